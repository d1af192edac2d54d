//! A labor node: a long-lived connection to the scheduler and an
//! opcode-keyed event loop over its messages.
//!
//! The labor keeps full local replicas of the rating dataset, both factor
//! matrices and the current YtY. It never initiates anything: the scheduler
//! pushes state at it and triggers bucket computations, and every reaction
//! carries the labor's `(taskid, epoch)` so the scheduler can catch it up
//! when it is behind. That makes reconnects and mid-task joins ordinary
//! cases instead of special ones.

use crate::engine::{dataset_from_bytes, FactorData, Observation, WalsEngine};
use crate::error::SwirlError;
use crate::protocol::{
    epoch_solves_users, framed, send_bulk, send_message, Frame, FramedSink, FramedStream, Head,
    OpCode, ATTACH_GREETING, PAYLOAD_FAIL, PAYLOAD_OK,
};
use crate::{BUCKET_SIZE, RECV_TIMEOUT, SOCK_BUF_SIZE};
use bytes::Bytes;
use futures::StreamExt;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpSocket;
use tokio::time::timeout;

pub struct Labor {
    stream: FramedStream,
    sink: FramedSink,
    terminate: Arc<AtomicBool>,

    // local replica of the task state
    taskid: u32,
    epochid: u32,
    nfactors: usize,
    lambda: f64,
    confidence: f64,
    dataset: Vec<Observation>,
    engine: WalsEngine,
    user_factors: FactorData,
    item_factors: FactorData,
    yty: Vec<f64>,
}

impl Labor {
    /// Connect to the scheduler with enlarged socket buffers and complete
    /// the attach handshake.
    pub async fn connect(
        ip: &str,
        port: u16,
        terminate: Arc<AtomicBool>,
    ) -> Result<Labor, SwirlError> {
        let addr: SocketAddr = format!("{}:{}", ip, port)
            .parse()
            .map_err(|_| SwirlError::BadAddress(format!("{}:{}", ip, port)))?;
        let socket = TcpSocket::new_v4()?;
        socket.set_send_buffer_size(SOCK_BUF_SIZE)?;
        socket.set_recv_buffer_size(SOCK_BUF_SIZE)?;
        let stream = socket.connect(addr).await?;
        info!("connected to scheduler at {}", addr);

        let (stream, sink) = framed(stream);
        let mut labor = Labor {
            stream,
            sink,
            terminate,
            taskid: 0,
            epochid: 0,
            nfactors: 0,
            lambda: 0.0,
            confidence: 0.0,
            dataset: Vec::new(),
            engine: WalsEngine::new(),
            user_factors: FactorData::zeros(0, 0),
            item_factors: FactorData::zeros(0, 0),
            yty: Vec::new(),
        };
        labor.attach().await?;
        Ok(labor)
    }

    async fn attach(&mut self) -> Result<(), SwirlError> {
        send_message(&mut self.sink, OpCode::AttachLabor, ATTACH_GREETING).await?;
        loop {
            if self.terminate.load(Ordering::Relaxed) {
                return Err(SwirlError::Terminated);
            }
            match self.recv().await? {
                None => continue,
                Some((head, body)) => {
                    if head.opcode() != OpCode::AttachLaborRsp {
                        return Err(SwirlError::UnexpectedOpcode(head.opcode));
                    }
                    info!("attach response: {}", String::from_utf8_lossy(&body));
                    return Ok(());
                }
            }
        }
    }

    /// Receive one frame. `None` means the receive beat elapsed with the
    /// line idle; the caller gets a chance to observe the terminate flag.
    async fn recv(&mut self) -> Result<Option<Frame>, SwirlError> {
        match timeout(RECV_TIMEOUT, self.stream.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(SwirlError::StreamClosed),
            Ok(Some(frame)) => frame.map(Some),
        }
    }

    /// The event loop: react to scheduler messages until the terminate flag
    /// is raised or the connection fails.
    pub async fn run(&mut self) -> Result<(), SwirlError> {
        info!("labor event loop running");
        loop {
            if self.terminate.load(Ordering::Relaxed) {
                info!("labor event loop terminating");
                return Ok(());
            }
            let Some((head, body)) = self.recv().await? else {
                continue;
            };
            match head.opcode() {
                OpCode::HeartBeat => self.handle_heartbeat().await?,
                OpCode::PushRate => self.handle_push_rate(head, body).await?,
                OpCode::PushFixed => self.handle_push_fixed(head, body).await?,
                OpCode::Calc => self.handle_calc(head).await?,
                _ => {
                    error!("invalid opcode {} received by labor", head.opcode);
                    return Err(SwirlError::UnexpectedOpcode(head.opcode));
                }
            }
        }
    }

    /// Report our local `(taskid, epoch)`; the scheduler drives catch-up
    /// from it.
    async fn info_rsp(&mut self, payload: &'static [u8]) -> Result<(), SwirlError> {
        send_bulk(
            &mut self.sink,
            OpCode::InfoRsp,
            Bytes::from_static(payload),
            self.taskid,
            self.epochid,
            0,
            0,
            0.0,
            0.0,
        )
        .await
    }

    fn set_params(&mut self, head: &Head) {
        self.taskid = head.taskid;
        self.epochid = head.epochid;
        self.nfactors = head.nfactors as usize;
        self.lambda = head.lambda;
        self.confidence = head.confidence;
    }

    async fn handle_heartbeat(&mut self) -> Result<(), SwirlError> {
        self.info_rsp(PAYLOAD_OK).await
    }

    /// A new dataset replica: rebuild the indexes and reallocate all
    /// factor state for the incoming task.
    async fn handle_push_rate(&mut self, head: Head, body: Bytes) -> Result<(), SwirlError> {
        self.dataset = dataset_from_bytes(&body)?;
        self.set_params(&head);
        self.engine.init(&self.dataset);

        let nfactors = self.nfactors;
        self.user_factors = FactorData::zeros(self.engine.nusers(), nfactors);
        self.item_factors = FactorData::zeros(self.engine.nitems(), nfactors);
        self.yty = vec![0.0; nfactors * nfactors];
        info!(
            "loaded rating replica for task {}: {} observations, {} users, {} items",
            self.taskid,
            self.dataset.len(),
            self.engine.nusers(),
            self.engine.nitems()
        );

        send_bulk(
            &mut self.sink,
            OpCode::PushRateRsp,
            Bytes::from_static(PAYLOAD_OK),
            head.taskid,
            head.epochid,
            0,
            0,
            0.0,
            0.0,
        )
        .await
    }

    /// The fixed side for the coming half-epoch. The epoch parity names the
    /// side; the inferred row count must agree with our index or the
    /// replica is unusable.
    async fn handle_push_fixed(&mut self, head: Head, body: Bytes) -> Result<(), SwirlError> {
        if head.taskid != self.taskid {
            error!(
                "push fixed taskid mismatch: local {}, received {}",
                self.taskid, head.taskid
            );
            self.info_rsp(PAYLOAD_FAIL).await?;
            return Ok(());
        }

        let nfactors = head.nfactors as usize;
        let inferred = body.len() / (nfactors * 8);
        let solves_users = epoch_solves_users(head.epochid);
        if solves_users {
            if inferred != self.engine.nitems() {
                return Err(SwirlError::StateMismatch(format!(
                    "fixed push holds {} item rows, local index holds {}",
                    inferred,
                    self.engine.nitems()
                )));
            }
            self.item_factors.load_bytes(&body)?;
            self.set_params(&head);
            self.engine.compute_xtx(&self.item_factors, &mut self.yty);
        } else {
            if inferred != self.engine.nusers() {
                return Err(SwirlError::StateMismatch(format!(
                    "fixed push holds {} user rows, local index holds {}",
                    inferred,
                    self.engine.nusers()
                )));
            }
            self.user_factors.load_bytes(&body)?;
            self.set_params(&head);
            self.engine.compute_xtx(&self.user_factors, &mut self.yty);
        }
        info!(
            "loaded fixed {} factors for (task {}, epoch {})",
            if solves_users { "item" } else { "user" },
            self.taskid,
            self.epochid
        );

        send_bulk(
            &mut self.sink,
            OpCode::PushFixedRsp,
            Bytes::from_static(PAYLOAD_OK),
            head.taskid,
            head.epochid,
            0,
            0,
            0.0,
            0.0,
        )
        .await
    }

    /// Solve one bucket of the side this epoch updates and stream the rows
    /// back.
    async fn handle_calc(&mut self, head: Head) -> Result<(), SwirlError> {
        if head.taskid != self.taskid || head.epochid != self.epochid {
            error!(
                "calc mismatch: local (task {}, epoch {}), received {}",
                self.taskid,
                self.epochid,
                head.stepinfo()
            );
            self.info_rsp(PAYLOAD_FAIL).await?;
            return Ok(());
        }

        let bucket = head.bucket as usize;
        let solves_users = epoch_solves_users(self.epochid);
        let nsolve = if solves_users {
            self.engine.nusers()
        } else {
            self.engine.nitems()
        };
        let lo = bucket * BUCKET_SIZE;
        if lo >= nsolve {
            warn!("calc {} is out of range ({} rows)", head.stepinfo(), nsolve);
            self.info_rsp(PAYLOAD_FAIL).await?;
            return Ok(());
        }
        let hi = nsolve.min(lo + BUCKET_SIZE);

        let solved = if solves_users {
            self.engine.iterate(
                lo,
                hi,
                &mut self.user_factors,
                &self.engine.user_signals,
                &self.item_factors,
                &self.engine.item_index,
                &self.yty,
                self.confidence,
                self.lambda,
            )
        } else {
            self.engine.iterate(
                lo,
                hi,
                &mut self.item_factors,
                &self.engine.item_signals,
                &self.user_factors,
                &self.engine.user_index,
                &self.yty,
                self.confidence,
                self.lambda,
            )
        };
        let loss = match solved {
            Ok(loss) => loss,
            Err(e) => {
                error!("bucket {} solve failed: {}", head.stepinfo(), e);
                self.info_rsp(PAYLOAD_FAIL).await?;
                return Ok(());
            }
        };
        info!("bucket {} loss: {}", head.stepinfo(), loss);

        let payload = if solves_users {
            Bytes::copy_from_slice(self.user_factors.rows_bytes(lo, hi))
        } else {
            Bytes::copy_from_slice(self.item_factors.rows_bytes(lo, hi))
        };
        send_bulk(
            &mut self.sink,
            OpCode::CalcRsp,
            payload,
            self.taskid,
            self.epochid,
            self.nfactors as u32,
            head.bucket,
            0.0,
            0.0,
        )
        .await
    }
}
