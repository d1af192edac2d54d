//! Shared task-scope state on the scheduler: counters, the authoritative
//! data, and the bucket bitset that is the only record of half-epoch
//! progress.

use crate::engine::{FactorData, Observation, WalsEngine};
use crate::BUCKET_BITS_CAPACITY;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Parameters of the task currently being driven.
#[derive(Clone, Copy, Debug, Default)]
pub struct TaskParams {
    pub nfactors: usize,
    pub lambda: f64,
    pub confidence: f64,
}

/// Fixed-capacity bitset over dispatch buckets.
///
/// Set by the message-dispatch task when a `CALC_RSP` merges, polled by the
/// task driver. Within one half-epoch the count only grows.
pub struct BucketBits {
    words: Vec<AtomicU64>,
}

impl BucketBits {
    pub fn new() -> Self {
        BucketBits {
            words: (0..BUCKET_BITS_CAPACITY.div_ceil(64))
                .map(|_| AtomicU64::new(0))
                .collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        BUCKET_BITS_CAPACITY
    }

    pub fn get(&self, idx: usize) -> bool {
        debug_assert!(idx < BUCKET_BITS_CAPACITY);
        self.words[idx / 64].load(Ordering::Acquire) & (1 << (idx % 64)) != 0
    }

    pub fn set(&self, idx: usize) {
        debug_assert!(idx < BUCKET_BITS_CAPACITY);
        self.words[idx / 64].fetch_or(1 << (idx % 64), Ordering::AcqRel);
    }

    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    pub fn reset(&self) {
        for w in &self.words {
            w.store(0, Ordering::Release);
        }
    }
}

impl Default for BucketBits {
    fn default() -> Self {
        BucketBits::new()
    }
}

/// Everything a running task needs, shared between the accept/dispatch side
/// and the task driver.
///
/// The driver reads the factor matrices (for broadcasts) and the dispatch
/// task writes them (merging `CALC_RSP` rows); the phases never overlap
/// because broadcasts only happen when no buckets are outstanding.
pub struct SharedState {
    taskid: AtomicU32,
    epochid: AtomicU32,
    pub params: RwLock<TaskParams>,
    pub dataset: RwLock<Vec<Observation>>,
    pub engine: RwLock<WalsEngine>,
    pub user_factors: RwLock<FactorData>,
    pub item_factors: RwLock<FactorData>,
    pub bucket_bits: BucketBits,
}

impl SharedState {
    pub fn new() -> Self {
        SharedState {
            taskid: AtomicU32::new(0),
            epochid: AtomicU32::new(0),
            params: RwLock::new(TaskParams::default()),
            dataset: RwLock::new(Vec::new()),
            engine: RwLock::new(WalsEngine::new()),
            user_factors: RwLock::new(FactorData::zeros(0, 0)),
            item_factors: RwLock::new(FactorData::zeros(0, 0)),
            bucket_bits: BucketBits::new(),
        }
    }

    pub fn taskid(&self) -> u32 {
        self.taskid.load(Ordering::Acquire)
    }

    pub fn epochid(&self) -> u32 {
        self.epochid.load(Ordering::Acquire)
    }

    /// Begin a new task: bump the task counter, rewind the epoch, clear the
    /// bucket bits.
    pub async fn start_term(&self, params: TaskParams) {
        self.taskid.fetch_add(1, Ordering::AcqRel);
        self.epochid.store(0, Ordering::Release);
        self.bucket_bits.reset();
        *self.params.write().await = params;
    }

    /// Begin the next half-epoch; bucket progress starts over.
    pub fn incr_epoch(&self) {
        self.epochid.fetch_add(1, Ordering::AcqRel);
        self.bucket_bits.reset();
    }
}

impl Default for SharedState {
    fn default() -> Self {
        SharedState::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_count_is_monotone_and_resets() {
        let bits = BucketBits::new();
        assert_eq!(bits.count(), 0);
        let mut last = 0;
        for i in [0usize, 5, 63, 64, 9999, 5, 0] {
            bits.set(i);
            let c = bits.count();
            assert!(c >= last);
            last = c;
        }
        // duplicates collapse
        assert_eq!(bits.count(), 5);
        assert!(bits.get(9999));
        assert!(!bits.get(1));
        bits.reset();
        assert_eq!(bits.count(), 0);
        assert!(!bits.get(63));
    }

    #[tokio::test]
    async fn term_and_epoch_counters() {
        let state = SharedState::new();
        state
            .start_term(TaskParams {
                nfactors: 4,
                lambda: 0.1,
                confidence: 1.0,
            })
            .await;
        assert_eq!(state.taskid(), 1);
        assert_eq!(state.epochid(), 0);
        state.bucket_bits.set(3);
        state.incr_epoch();
        assert_eq!(state.epochid(), 1);
        assert_eq!(state.bucket_bits.count(), 0);
        state
            .start_term(TaskParams {
                nfactors: 4,
                lambda: 0.1,
                confidence: 1.0,
            })
            .await;
        assert_eq!(state.taskid(), 2);
        assert_eq!(state.epochid(), 0);
    }
}
