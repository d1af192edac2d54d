//! Distributed weighted ALS (WALS) matrix factorization for
//! implicit-feedback collaborative filtering.
//!
//! A rating dataset of `(user, item, value)` triples is factorized into two
//! low-rank matrices by alternating closed-form solves: fix the item
//! factors and solve every user row, then fix the user factors and solve
//! every item row. One [`scheduler`] coordinates the run; any number of
//! [`labor`] nodes hold full replicas of the dataset and compute buckets of
//! rows on demand; a one-shot submitter queues task descriptors.
//!
//! The scheduler owns the authoritative factor matrices and treats labors
//! as stateless compute cells: a labor may attach, die, or reconnect at any
//! time and the catch-up path (driven by `INFO_RSP`) rehydrates it with the
//! current dataset and fixed factors. Forward progress of a half-epoch is
//! tracked only by the bucket bitset.
//!
//! All inter-node traffic uses the packed binary [`protocol`]: a 44-byte
//! header with big-endian integer fields followed by a raw payload. Payload
//! doubles travel in host byte order; the cluster is assumed to be
//! homogeneous little-endian.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod engine;
pub mod error;
pub mod labor;
pub mod protocol;
pub mod scheduler;
pub mod submit;

/// Rows per dispatch bucket.
pub const BUCKET_SIZE: usize = 10_000;
/// Capacity of the bucket bitset; supports 10^8 rows per side.
pub const BUCKET_BITS_CAPACITY: usize = 10_000;
/// A silent peer older than this gets probed with a heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Labor-side receive beat; lets the event loop observe the terminate flag.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);
/// SO_SNDBUF/SO_RCVBUF target for all sockets.
pub const SOCK_BUF_SIZE: u32 = 5 * 1024 * 1024;
/// Listen backlog on the scheduler.
pub const LISTEN_BACKLOG: u32 = 10;
/// Cadence of the quorum-wait and bucket-dispatch polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Raise `flag` when SIGINT or SIGUSR1 arrives; every long-running loop in
/// the scheduler and the labor checks it at its next iteration.
#[cfg(unix)]
pub fn watch_termination(flag: Arc<AtomicBool>) {
    use tokio::signal::unix::{signal, SignalKind};
    tokio::spawn(async move {
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                log::error!("cannot install SIGINT handler: {}", e);
                return;
            }
        };
        let mut user1 = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                log::error!("cannot install SIGUSR1 handler: {}", e);
                return;
            }
        };
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = user1.recv() => {}
        }
        flag.store(true, Ordering::Relaxed);
        log::info!("terminate flag raised");
    });
}
