//! Per-peer connection state on the scheduler.
//!
//! Two tasks may target the same peer (the message-dispatch task for
//! catch-up resends, the task driver for broadcasts and bucket dispatch),
//! so every outbound send goes through the sink mutex: at most one message
//! is in flight per connection. Inbound reads never touch the mutex.

use crate::error::SwirlError;
use crate::protocol::{send_bulk, send_message, FramedSink, OpCode};
use bytes::Bytes;
use log::debug;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub struct Connection {
    pub id: usize,
    pub addr: SocketAddr,
    /// The send lock: acquire-before-write.
    sink: Mutex<FramedSink>,
    /// Set once the peer attaches as a labor; submitters stay false.
    pub is_labor: AtomicBool,
    /// Last `(taskid, epochid)` the peer acknowledged.
    pub taskid: AtomicU32,
    pub epochid: AtomicU32,
    /// A bucket is outstanding on this peer.
    pub busy: AtomicBool,
    last_active: StdMutex<Instant>,
    bucket_start: StdMutex<Instant>,
}

impl Connection {
    pub fn new(id: usize, addr: SocketAddr, sink: FramedSink) -> Self {
        let now = Instant::now();
        Connection {
            id,
            addr,
            sink: Mutex::new(sink),
            is_labor: AtomicBool::new(false),
            taskid: AtomicU32::new(0),
            epochid: AtomicU32::new(0),
            busy: AtomicBool::new(false),
            last_active: StdMutex::new(now),
            bucket_start: StdMutex::new(now),
        }
    }

    /// Record activity on this connection.
    pub fn touch(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    pub fn is_stale(&self, period: Duration) -> bool {
        self.last_active.lock().unwrap().elapsed() > period
    }

    pub fn mark_bucket_start(&self) {
        *self.bucket_start.lock().unwrap() = Instant::now();
    }

    pub fn bucket_elapsed(&self) -> Duration {
        self.bucket_start.lock().unwrap().elapsed()
    }

    /// The peer's acknowledged state equals `(taskid, epochid)`.
    pub fn matches(&self, taskid: u32, epochid: u32) -> bool {
        self.taskid.load(Ordering::Acquire) == taskid
            && self.epochid.load(Ordering::Acquire) == epochid
    }

    pub fn record_ack(&self, taskid: u32, epochid: u32) {
        self.taskid.store(taskid, Ordering::Release);
        self.epochid.store(epochid, Ordering::Release);
    }

    /// Send a small control message, waiting for the send lock.
    pub async fn send_message(&self, code: OpCode, payload: &[u8]) -> Result<(), SwirlError> {
        let mut sink = self.sink.lock().await;
        send_message(&mut sink, code, payload).await
    }

    /// Send a full message, waiting for the send lock.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_bulk(
        &self,
        code: OpCode,
        payload: Bytes,
        taskid: u32,
        epochid: u32,
        nfactors: u32,
        bucket: u32,
        lambda: f64,
        confidence: f64,
    ) -> Result<(), SwirlError> {
        let mut sink = self.sink.lock().await;
        send_bulk(
            &mut sink, code, payload, taskid, epochid, nfactors, bucket, lambda, confidence,
        )
        .await
    }

    /// Send a full message only if the send lock is free right now.
    /// Returns `Ok(false)` when the lock was lost to another sender; the
    /// caller skips this peer for the current pass.
    #[allow(clippy::too_many_arguments)]
    pub async fn try_send_bulk(
        &self,
        code: OpCode,
        payload: Bytes,
        taskid: u32,
        epochid: u32,
        nfactors: u32,
        bucket: u32,
        lambda: f64,
        confidence: f64,
    ) -> Result<bool, SwirlError> {
        let mut sink = match self.sink.try_lock() {
            Ok(sink) => sink,
            Err(_) => {
                debug!("send lock busy for connection {}, skipping", self.id);
                return Ok(false);
            }
        };
        send_bulk(
            &mut sink, code, payload, taskid, epochid, nfactors, bucket, lambda, confidence,
        )
        .await?;
        Ok(true)
    }

    /// Close the write half; the peer (and our reader task) will observe
    /// the shutdown.
    pub async fn close(&self) {
        use futures::SinkExt;
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
    }
}
