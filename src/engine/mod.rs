//! The numerical side of the system: the rating dataset, the dense id
//! indexes, the factor matrices, and the weighted-ALS update kernel.

mod dataset;
mod factors;
mod index;
mod solve;
mod wals;

pub use dataset::{dataset_bytes, dataset_from_bytes, read_dataset, Observation, OBSERVATION_LEN};
pub use factors::FactorData;
pub use index::IdIndex;
pub use solve::solve_spd;
pub use wals::{update_row, Signal, SignalGroup, WalsEngine};
