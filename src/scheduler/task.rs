//! Task descriptors and the task driver.
//!
//! The driver owns one factorization end to end: load and index the
//! training set, initialize factors, replicate the dataset, then alternate
//! half-epochs — broadcast the fixed side, wait for a quorum of labors to
//! acknowledge it, and drive bucket dispatch until every row range of the
//! solving side has been merged back.

use crate::engine::{dataset_bytes, read_dataset, FactorData};
use crate::error::SwirlError;
use crate::protocol::{epoch_solves_users, OpCode, PAYLOAD_CALC, PAYLOAD_HEARTBEAT};
use crate::scheduler::state::{SharedState, TaskParams};
use crate::scheduler::{labor_snapshot, ConnMap};
use crate::{BUCKET_SIZE, HEARTBEAT_INTERVAL, POLL_INTERVAL};
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::sleep;

/// A parsed task descriptor.
#[derive(Clone, Debug)]
pub struct TaskDef {
    pub nepochs: u32,
    pub nfactors: usize,
    pub regularization_lambda: f64,
    pub confidence_weight: f64,
    pub init_distribution_bound: f64,
    pub distribution_file: Option<PathBuf>,
    pub train_set: PathBuf,
    pub user_factors: PathBuf,
    pub item_factors: PathBuf,
}

impl TaskDef {
    /// Parse the textual descriptor: one `key: value` per line, `#`
    /// comments and blank lines ignored.
    pub fn parse(text: &str) -> Result<TaskDef, SwirlError> {
        let mut fields: HashMap<&str, &str> = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| SwirlError::BadTask(format!("malformed line: {:?}", line)))?;
            fields.insert(key.trim(), value.trim());
        }

        fn required<'a>(
            fields: &HashMap<&str, &'a str>,
            key: &str,
        ) -> Result<&'a str, SwirlError> {
            fields
                .get(key)
                .copied()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| SwirlError::BadTask(format!("missing field: {}", key)))
        }
        fn number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, SwirlError> {
            raw.parse()
                .map_err(|_| SwirlError::BadTask(format!("bad value for {}: {:?}", key, raw)))
        }

        let nepochs: u32 = number("nepochs", required(&fields, "nepochs")?)?;
        let nfactors: usize = number("nfactors", required(&fields, "nfactors")?)?;
        let regularization_lambda: f64 = number(
            "regularization_lambda",
            required(&fields, "regularization_lambda")?,
        )?;
        let confidence_weight: f64 =
            number("confidence_weight", required(&fields, "confidence_weight")?)?;
        let init_distribution_bound: f64 = match fields.get("init_distribution_bound").copied() {
            Some(raw) if !raw.is_empty() => number("init_distribution_bound", raw)?,
            _ => 0.0,
        };
        let distribution_file = fields
            .get("distribution_file")
            .copied()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        if nepochs == 0 {
            return Err(SwirlError::BadTask("nepochs must be positive".into()));
        }
        if nfactors == 0 {
            return Err(SwirlError::BadTask("nfactors must be positive".into()));
        }
        // lambda > 0 and alpha >= 0 keep every per-row system positive
        // definite; anything else would fail rows on the labors instead of
        // failing the task here
        if !(regularization_lambda > 0.0) {
            return Err(SwirlError::BadTask(
                "regularization_lambda must be positive".into(),
            ));
        }
        if !(confidence_weight >= 0.0) {
            return Err(SwirlError::BadTask(
                "confidence_weight must be non-negative".into(),
            ));
        }
        if distribution_file.is_none() && init_distribution_bound <= 0.0 {
            return Err(SwirlError::BadTask(
                "init_distribution_bound must be positive without a distribution_file".into(),
            ));
        }

        Ok(TaskDef {
            nepochs,
            nfactors,
            regularization_lambda,
            confidence_weight,
            init_distribution_bound,
            distribution_file,
            train_set: PathBuf::from(required(&fields, "train_set")?),
            user_factors: PathBuf::from(required(&fields, "user_factors")?),
            item_factors: PathBuf::from(required(&fields, "item_factors")?),
        })
    }

    /// Multi-line rendering logged when a task is admitted.
    pub fn dump(&self) -> String {
        format!(
            "\n------ full task ------\n\
             \tnepochs: {}\n\
             \tnfactors: {}\n\
             \tregularization_lambda: {}\n\
             \tconfidence_weight: {}\n\
             \tinit_distribution_bound: {}\n\
             \tdistribution_file: {}\n\
             \ttrain_set: {}\n\
             \tuser_factors: {}\n\
             \titem_factors: {}\n\
             ------    end    ------",
            self.nepochs,
            self.nfactors,
            self.regularization_lambda,
            self.confidence_weight,
            self.init_distribution_bound,
            self.distribution_file
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            self.train_set.display(),
            self.user_factors.display(),
            self.item_factors.display(),
        )
    }
}

/// Consume the submitted-task queue until the terminate flag is raised. A
/// failed task is logged and the driver moves on to the next one.
pub async fn run_tasks(
    state: Arc<SharedState>,
    conns: ConnMap,
    mut queue: UnboundedReceiver<TaskDef>,
    terminate: Arc<AtomicBool>,
) {
    loop {
        if terminate.load(Ordering::Relaxed) {
            break;
        }
        let task = tokio::select! {
            task = queue.recv() => match task {
                Some(task) => task,
                None => break,
            },
            _ = sleep(POLL_INTERVAL) => continue,
        };
        match run_one_task(&state, &conns, &task, &terminate).await {
            Ok(()) => info!("task {} finished", state.taskid()),
            Err(e) => error!("task {} failed: {}", state.taskid(), e),
        }
    }
    info!("task driver exiting");
}

/// Drive one factorization end to end.
pub async fn run_one_task(
    state: &Arc<SharedState>,
    conns: &ConnMap,
    task: &TaskDef,
    terminate: &Arc<AtomicBool>,
) -> Result<(), SwirlError> {
    info!("{}", task.dump());

    state
        .start_term(TaskParams {
            nfactors: task.nfactors,
            lambda: task.regularization_lambda,
            confidence: task.confidence_weight,
        })
        .await;
    let taskid = state.taskid();

    info!("loading training dataset");
    let dataset = read_dataset(&task.train_set)?;
    if dataset.is_empty() {
        return Err(SwirlError::Dataset(format!(
            "training set {} is empty",
            task.train_set.display()
        )));
    }
    info!("loaded training set: {} observations", dataset.len());

    let (nusers, nitems) = {
        let mut engine = state.engine.write().await;
        engine.init(&dataset);
        (engine.nusers(), engine.nitems())
    };
    info!("detected user count: {}, item count: {}", nusers, nitems);

    {
        // users are solved first and start zeroed
        *state.user_factors.write().await = FactorData::zeros(nusers, task.nfactors);
        let mut items = FactorData::zeros(nitems, task.nfactors);
        match &task.distribution_file {
            Some(path) => {
                items.fill_from_file(path)?;
                info!("initialized item factors from {}", path.display());
            }
            None => {
                items.fill_uniform(task.init_distribution_bound, &mut rand::thread_rng());
                info!(
                    "initialized item factors uniformly within +-{}",
                    task.init_distribution_bound
                );
            }
        }
        *state.item_factors.write().await = items;
    }

    *state.dataset.write().await = dataset;

    let labors = labor_snapshot(conns).await;
    if labors.is_empty() {
        return Err(SwirlError::NoLabor);
    }
    let quorum = labors.len() / 2 + 1;
    info!("{} labors attached, quorum is {}", labors.len(), quorum);

    broadcast_rating(state, conns).await;
    wait_quorum(conns, taskid, 0, quorum, terminate).await?;

    for _ in 0..task.nepochs {
        for _ in 0..2 {
            state.incr_epoch();
            broadcast_fixed(state, conns).await;
            wait_quorum(conns, taskid, state.epochid(), quorum, terminate).await?;
            dispatch_buckets(state, conns, terminate).await?;
        }
    }

    {
        let engine = state.engine.read().await;
        let users = state.user_factors.read().await;
        engine.save_factors(&users, &engine.user_index, &task.user_factors)?;
        let items = state.item_factors.read().await;
        engine.save_factors(&items, &engine.item_index, &task.item_factors)?;
    }
    info!(
        "saved user factors to {} and item factors to {}",
        task.user_factors.display(),
        task.item_factors.display()
    );
    Ok(())
}

/// Replicate the rating dataset to every attached labor.
async fn broadcast_rating(state: &Arc<SharedState>, conns: &ConnMap) {
    let payload = {
        let dataset = state.dataset.read().await;
        Bytes::copy_from_slice(dataset_bytes(&dataset))
    };
    let params = *state.params.read().await;
    let taskid = state.taskid();
    for conn in labor_snapshot(conns).await {
        if let Err(e) = conn
            .send_bulk(
                OpCode::PushRate,
                payload.clone(),
                taskid,
                0,
                params.nfactors as u32,
                0,
                params.lambda,
                params.confidence,
            )
            .await
        {
            warn!("push rating to connection {} failed: {}", conn.id, e);
        }
    }
}

/// Broadcast the fixed side for the current epoch (items on odd epochs).
async fn broadcast_fixed(state: &Arc<SharedState>, conns: &ConnMap) {
    let epochid = state.epochid();
    let payload = if epoch_solves_users(epochid) {
        let items = state.item_factors.read().await;
        Bytes::copy_from_slice(items.as_bytes())
    } else {
        let users = state.user_factors.read().await;
        Bytes::copy_from_slice(users.as_bytes())
    };
    let params = *state.params.read().await;
    let taskid = state.taskid();
    for conn in labor_snapshot(conns).await {
        if let Err(e) = conn
            .send_bulk(
                OpCode::PushFixed,
                payload.clone(),
                taskid,
                epochid,
                params.nfactors as u32,
                0,
                params.lambda,
                params.confidence,
            )
            .await
        {
            warn!("push fixed to connection {} failed: {}", conn.id, e);
        }
    }
}

/// Poll until at least `quorum` labors have acknowledged `(taskid,
/// epochid)`. Silent stragglers get probed with a heartbeat; their
/// `INFO_RSP` then drives the catch-up resend.
async fn wait_quorum(
    conns: &ConnMap,
    taskid: u32,
    epochid: u32,
    quorum: usize,
    terminate: &Arc<AtomicBool>,
) -> Result<(), SwirlError> {
    loop {
        if terminate.load(Ordering::Relaxed) {
            return Err(SwirlError::Terminated);
        }
        let labors = labor_snapshot(conns).await;
        let matching = labors
            .iter()
            .filter(|c| c.matches(taskid, epochid))
            .count();
        if matching >= quorum {
            info!(
                "quorum {}/{} reached for (task {}, epoch {})",
                matching,
                labors.len(),
                taskid,
                epochid
            );
            return Ok(());
        }
        for conn in &labors {
            if !conn.matches(taskid, epochid) && conn.is_stale(HEARTBEAT_INTERVAL) {
                conn.touch();
                let _ = conn
                    .try_send_bulk(
                        OpCode::HeartBeat,
                        Bytes::from_static(PAYLOAD_HEARTBEAT),
                        0,
                        0,
                        0,
                        0,
                        0.0,
                        0.0,
                    )
                    .await;
            }
        }
        debug!(
            "waiting for quorum on (task {}, epoch {}): {}/{}",
            taskid, epochid, matching, quorum
        );
        sleep(POLL_INTERVAL).await;
    }
}

/// Hand out buckets of the solving side until every one has been merged.
///
/// A rotating cursor skips buckets that are merged or reserved by an
/// in-flight assignment; busy peers are left alone (probed if silent too
/// long). A reservation is released when its bucket merges, when the
/// holder leaves the connection map, or when the holder abandons the
/// assignment, so the same bucket is handed out again only after its
/// assignee is actually gone. A late duplicate merge is idempotent
/// because the bit is already set.
async fn dispatch_buckets(
    state: &Arc<SharedState>,
    conns: &ConnMap,
    terminate: &Arc<AtomicBool>,
) -> Result<(), SwirlError> {
    let taskid = state.taskid();
    let epochid = state.epochid();
    let params = *state.params.read().await;
    let nsolve = {
        let engine = state.engine.read().await;
        if epoch_solves_users(epochid) {
            engine.nusers()
        } else {
            engine.nitems()
        }
    };
    let total = nsolve.div_ceil(BUCKET_SIZE);
    if total == 0 {
        return Ok(());
    }
    if total > state.bucket_bits.capacity() {
        return Err(SwirlError::BadTask(format!(
            "{} rows need {} buckets, bitset capacity is {}",
            nsolve,
            total,
            state.bucket_bits.capacity()
        )));
    }
    info!(
        "dispatching {} buckets for (task {}, epoch {})",
        total, taskid, epochid
    );

    let mut cursor = 0usize;
    // buckets handed out but not merged yet, keyed to their holder
    let mut inflight: HashMap<usize, usize> = HashMap::new();
    loop {
        if state.bucket_bits.count() >= total {
            info!("all {} buckets merged for epoch {}", total, epochid);
            return Ok(());
        }
        if terminate.load(Ordering::Relaxed) {
            return Err(SwirlError::Terminated);
        }

        let labors = labor_snapshot(conns).await;
        // release reservations whose bucket merged, or whose holder is no
        // longer attached or no longer working on it
        inflight.retain(|bucket, holder| {
            !state.bucket_bits.get(*bucket)
                && labors
                    .iter()
                    .any(|c| c.id == *holder && c.busy.load(Ordering::Acquire))
        });

        for conn in &labors {
            if conn.busy.load(Ordering::Acquire) {
                if conn.is_stale(HEARTBEAT_INTERVAL) {
                    conn.touch();
                    let _ = conn
                        .try_send_bulk(
                            OpCode::HeartBeat,
                            Bytes::from_static(PAYLOAD_HEARTBEAT),
                            0,
                            0,
                            0,
                            0,
                            0.0,
                            0.0,
                        )
                        .await;
                }
                continue;
            }

            // advance past buckets that are merged or already handed out
            let mut scanned = 0;
            while scanned < total
                && (state.bucket_bits.get(cursor) || inflight.contains_key(&cursor))
            {
                cursor = (cursor + 1) % total;
                scanned += 1;
            }
            if scanned >= total {
                // every bucket is merged or reserved; nothing to hand out
                // this pass
                break;
            }

            conn.touch();
            conn.mark_bucket_start();
            // reserve the peer before the send; an instant reply must not
            // find the flag still clear
            conn.busy.store(true, Ordering::Release);
            match conn
                .try_send_bulk(
                    OpCode::Calc,
                    Bytes::from_static(PAYLOAD_CALC),
                    taskid,
                    epochid,
                    params.nfactors as u32,
                    cursor as u32,
                    params.lambda,
                    params.confidence,
                )
                .await
            {
                Ok(true) => {
                    debug!("bucket {} assigned to connection {}", cursor, conn.id);
                    inflight.insert(cursor, conn.id);
                    cursor = (cursor + 1) % total;
                }
                Ok(false) => {
                    conn.busy.store(false, Ordering::Release);
                }
                Err(e) => {
                    // the reader task will unregister the connection
                    conn.busy.store(false, Ordering::Release);
                    warn!("calc dispatch to connection {} failed: {}", conn.id, e);
                }
            }
        }

        sleep(POLL_INTERVAL).await;
    }
}
