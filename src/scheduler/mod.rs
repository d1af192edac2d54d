//! The scheduler: accepts submitter and labor connections, demultiplexes
//! their messages, and runs the task driver.
//!
//! Wiring follows a reader-per-connection layout: each accepted socket gets
//! a task that parses frames and forwards them into one unbounded channel;
//! a single dispatch task consumes that channel and is therefore the only
//! writer of the authoritative factor matrices and the bucket bits. The
//! task driver runs beside it and owns the broadcast/quorum/dispatch
//! cadence.

mod connection;
mod state;
mod task;

pub use connection::Connection;
pub use state::{BucketBits, SharedState, TaskParams};
pub use task::{run_one_task, run_tasks, TaskDef};

use crate::engine::dataset_bytes;
use crate::error::SwirlError;
use crate::protocol::{
    epoch_solves_users, framed, Head, OpCode, ATTACH_ACK, PAYLOAD_FAIL, PAYLOAD_OK,
};
use crate::{BUCKET_SIZE, LISTEN_BACKLOG, POLL_INTERVAL, SOCK_BUF_SIZE};
use bytes::Bytes;
use futures::StreamExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Mutex;
use tokio::time::sleep;

/// The connection directory; the map is the sole owner of the handles.
pub type ConnMap = Arc<Mutex<HashMap<usize, Arc<Connection>>>>;

/// Snapshot the labor connections; iteration happens lock-free on the
/// snapshot.
pub async fn labor_snapshot(conns: &ConnMap) -> Vec<Arc<Connection>> {
    conns
        .lock()
        .await
        .values()
        .filter(|c| c.is_labor.load(Ordering::Acquire))
        .cloned()
        .collect()
}

pub struct Scheduler {
    listener: TcpListener,
    connections: ConnMap,
    state: Arc<SharedState>,
    terminate: Arc<AtomicBool>,
}

impl Scheduler {
    /// Bind the listen socket with enlarged buffers and a short backlog.
    /// Accepted sockets inherit the buffer sizes.
    pub async fn bind(
        ip: &str,
        port: u16,
        terminate: Arc<AtomicBool>,
    ) -> Result<Scheduler, SwirlError> {
        let addr: SocketAddr = format!("{}:{}", ip, port)
            .parse()
            .map_err(|_| SwirlError::BadAddress(format!("{}:{}", ip, port)))?;
        let socket = TcpSocket::new_v4()?;
        socket.set_send_buffer_size(SOCK_BUF_SIZE)?;
        socket.set_recv_buffer_size(SOCK_BUF_SIZE)?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        info!("scheduler listening on {}", listener.local_addr()?);
        Ok(Scheduler {
            listener,
            connections: Arc::new(Mutex::new(HashMap::new())),
            state: Arc::new(SharedState::new()),
            terminate,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SwirlError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the terminate flag is raised. Spawns the
    /// message-dispatch task and the task driver.
    pub async fn run(self) -> Result<(), SwirlError> {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (task_tx, task_rx) = mpsc::unbounded_channel();

        tokio::spawn(process_messages(
            self.state.clone(),
            self.connections.clone(),
            task_tx,
            msg_rx,
        ));
        tokio::spawn(run_tasks(
            self.state.clone(),
            self.connections.clone(),
            task_rx,
            self.terminate.clone(),
        ));

        let mut next_id = 0usize;
        loop {
            if self.terminate.load(Ordering::Relaxed) {
                break;
            }
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = sleep(POLL_INTERVAL) => continue,
            };
            let (socket, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("accept failed: {}", e);
                    continue;
                }
            };
            next_id += 1;
            let conn_id = next_id;
            let (stream, sink) = framed(socket);
            let conn = Arc::new(Connection::new(conn_id, peer, sink));
            self.connections.lock().await.insert(conn_id, conn);
            info!("accepted connection {} from {}", conn_id, peer);

            let conns = self.connections.clone();
            let tx = msg_tx.clone();
            tokio::spawn(async move {
                let mut stream = stream;
                loop {
                    match stream.next().await {
                        Some(Ok((head, body))) => {
                            if tx.send((conn_id, head, body)).is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            error!("connection {}: {}", conn_id, e);
                            break;
                        }
                        None => {
                            info!("connection {} closed by peer", conn_id);
                            break;
                        }
                    }
                }
                if conns.lock().await.remove(&conn_id).is_some() {
                    info!("unregistered connection {}", conn_id);
                }
            });
        }
        info!("scheduler accept loop exiting");
        Ok(())
    }

    pub fn state(&self) -> Arc<SharedState> {
        self.state.clone()
    }

    pub fn connections(&self) -> ConnMap {
        self.connections.clone()
    }
}

/// Consume every inbound frame; this task is the only writer of the
/// authoritative factor matrices and the bucket bits.
async fn process_messages(
    state: Arc<SharedState>,
    conns: ConnMap,
    task_tx: UnboundedSender<TaskDef>,
    mut rx: mpsc::UnboundedReceiver<(usize, Head, Bytes)>,
) {
    while let Some((conn_id, head, body)) = rx.recv().await {
        let conn = { conns.lock().await.get(&conn_id).cloned() };
        let Some(conn) = conn else {
            debug!("dropping frame from departed connection {}", conn_id);
            continue;
        };
        conn.touch();

        match head.opcode() {
            OpCode::SubmitTask => handle_submit(&conn, &task_tx, &body).await,
            OpCode::AttachLabor => {
                info!(
                    "connection {} attached as labor ({})",
                    conn.id,
                    String::from_utf8_lossy(&body)
                );
                // ack before the peer becomes visible to the dispatcher, so
                // nothing can be queued on the sink ahead of it
                if let Err(e) = conn.send_message(OpCode::AttachLaborRsp, ATTACH_ACK).await {
                    warn!("attach ack to connection {} failed: {}", conn.id, e);
                }
                conn.is_labor.store(true, Ordering::Release);
            }
            OpCode::PushRateRsp | OpCode::PushFixedRsp => {
                if &body[..] == PAYLOAD_OK {
                    conn.record_ack(head.taskid, head.epochid);
                    debug!(
                        "connection {} acked (task {}, epoch {})",
                        conn.id, head.taskid, head.epochid
                    );
                } else {
                    warn!(
                        "connection {} rejected push at (task {}, epoch {})",
                        conn.id, head.taskid, head.epochid
                    );
                }
            }
            OpCode::CalcRsp => handle_calc_rsp(&state, &conn, head, &body).await,
            OpCode::InfoRsp => handle_info_rsp(&state, &conn, head, &body).await,
            _ => {
                error!(
                    "invalid opcode {} from connection {}, dropping it",
                    head.opcode, conn.id
                );
                conn.close().await;
                conns.lock().await.remove(&conn.id);
            }
        }
    }
}

/// Task admission: the payload names a task file on the scheduler's
/// filesystem; parse it and queue it.
async fn handle_submit(
    conn: &Arc<Connection>,
    task_tx: &UnboundedSender<TaskDef>,
    body: &Bytes,
) {
    conn.is_labor.store(false, Ordering::Release);
    let admitted = match std::str::from_utf8(body) {
        Ok(path) => match tokio::fs::read_to_string(path.trim()).await {
            Ok(text) => match TaskDef::parse(&text) {
                Ok(task) => task_tx.send(task).is_ok(),
                Err(e) => {
                    error!("task file {} rejected: {}", path.trim(), e);
                    false
                }
            },
            Err(e) => {
                error!("cannot read task file {}: {}", path.trim(), e);
                false
            }
        },
        Err(_) => {
            error!("submit payload from connection {} is not utf-8", conn.id);
            false
        }
    };
    let reply = if admitted { PAYLOAD_OK } else { PAYLOAD_FAIL };
    if let Err(e) = conn.send_message(OpCode::SubmitTaskRsp, reply).await {
        warn!("submit reply to connection {} failed: {}", conn.id, e);
    }
}

/// Merge one completed bucket into the authoritative factor matrix.
///
/// The labor has finished its assignment whatever happens here, but its
/// busy flag is released only after the merge: the dispatcher must never
/// observe a free peer while the bucket bit is still clear.
async fn handle_calc_rsp(
    state: &Arc<SharedState>,
    conn: &Arc<Connection>,
    head: Head,
    body: &Bytes,
) {
    merge_calc_rsp(state, conn, head, body).await;
    conn.busy.store(false, Ordering::Release);
}

async fn merge_calc_rsp(
    state: &Arc<SharedState>,
    conn: &Arc<Connection>,
    head: Head,
    body: &Bytes,
) {
    let taskid = state.taskid();
    let epochid = state.epochid();
    if head.taskid != taskid || head.epochid != epochid {
        warn!(
            "stale calc response {} from connection {}, local (task {}, epoch {})",
            head.stepinfo(),
            conn.id,
            taskid,
            epochid
        );
        return;
    }
    let nfactors = state.params.read().await.nfactors;
    if head.nfactors as usize != nfactors {
        warn!(
            "calc response {} carries {} factors, task uses {}",
            head.stepinfo(),
            head.nfactors,
            nfactors
        );
        return;
    }

    let solves_users = epoch_solves_users(epochid);
    let nsolve = {
        let engine = state.engine.read().await;
        if solves_users {
            engine.nusers()
        } else {
            engine.nitems()
        }
    };
    let bucket = head.bucket as usize;
    let lo = bucket * BUCKET_SIZE;
    if lo >= nsolve {
        warn!("calc response {} is out of range", head.stepinfo());
        return;
    }
    let hi = nsolve.min(lo + BUCKET_SIZE);
    if body.len() != (hi - lo) * nfactors * 8 {
        warn!(
            "calc response {} payload is {} bytes, rows {}..{} need {}",
            head.stepinfo(),
            body.len(),
            lo,
            hi,
            (hi - lo) * nfactors * 8
        );
        return;
    }
    if state.bucket_bits.get(bucket) {
        debug!("duplicate calc response {} discarded", head.stepinfo());
        return;
    }

    let merged = if solves_users {
        let mut users = state.user_factors.write().await;
        users.load_rows_bytes(lo, hi, body)
    } else {
        let mut items = state.item_factors.write().await;
        items.load_rows_bytes(lo, hi, body)
    };
    match merged {
        Ok(()) => {
            state.bucket_bits.set(bucket);
            conn.record_ack(head.taskid, head.epochid);
            info!(
                "bucket {} merged from connection {} in {:?}",
                head.stepinfo(),
                conn.id,
                conn.bucket_elapsed()
            );
        }
        Err(e) => warn!("bucket {} merge failed: {}", head.stepinfo(), e),
    }
}

/// A labor reported its `(taskid, epoch)`. If it is behind, resend what it
/// is missing under the connection's send lock; otherwise record the ack.
async fn handle_info_rsp(
    state: &Arc<SharedState>,
    conn: &Arc<Connection>,
    head: Head,
    body: &Bytes,
) {
    let local_task = state.taskid();
    let local_epoch = state.epochid();
    // a mismatch report or a failed solve abandons any outstanding
    // assignment; a routine liveness ack says nothing about it
    if head.taskid < local_task || head.epochid < local_epoch || &body[..] == PAYLOAD_FAIL {
        conn.busy.store(false, Ordering::Release);
    }
    if head.taskid < local_task {
        info!(
            "connection {} is on task {} (local {}), resending rating data",
            conn.id, head.taskid, local_task
        );
        let state = state.clone();
        let conn = conn.clone();
        tokio::spawn(async move {
            let payload = {
                let dataset = state.dataset.read().await;
                Bytes::copy_from_slice(dataset_bytes(&dataset))
            };
            let params = *state.params.read().await;
            if let Err(e) = conn
                .send_bulk(
                    OpCode::PushRate,
                    payload,
                    state.taskid(),
                    0,
                    params.nfactors as u32,
                    0,
                    params.lambda,
                    params.confidence,
                )
                .await
            {
                warn!("rating resend to connection {} failed: {}", conn.id, e);
            }
        });
    } else if head.epochid < local_epoch {
        info!(
            "connection {} is on epoch {} (local {}), resending fixed factors",
            conn.id, head.epochid, local_epoch
        );
        let state = state.clone();
        let conn = conn.clone();
        tokio::spawn(async move {
            let epochid = state.epochid();
            let payload = if epoch_solves_users(epochid) {
                let items = state.item_factors.read().await;
                Bytes::copy_from_slice(items.as_bytes())
            } else {
                let users = state.user_factors.read().await;
                Bytes::copy_from_slice(users.as_bytes())
            };
            let params = *state.params.read().await;
            if let Err(e) = conn
                .send_bulk(
                    OpCode::PushFixed,
                    payload,
                    state.taskid(),
                    epochid,
                    params.nfactors as u32,
                    0,
                    params.lambda,
                    params.confidence,
                )
                .await
            {
                warn!("fixed resend to connection {} failed: {}", conn.id, e);
            }
        });
    } else {
        debug!(
            "connection {} info ack {:?} at (task {}, epoch {})",
            conn.id,
            String::from_utf8_lossy(body),
            head.taskid,
            head.epochid
        );
        conn.record_ack(head.taskid, head.epochid);
    }
}
