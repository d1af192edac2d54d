//! The weighted-ALS compute engine: signal grouping, the per-row update
//! kernel, the parallel half-epoch sweep, and the YtY reduction.
//!
//! The same engine runs on the scheduler (for indexes and output files) and
//! on every labor (for the actual solves). It is rebuilt from the dataset at
//! the start of each task and must come up completely clean.

use crate::engine::dataset::Observation;
use crate::engine::factors::FactorData;
use crate::engine::index::IdIndex;
use crate::engine::solve::solve_spd;
use crate::error::SwirlError;
use crossbeam_utils::thread;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// One observation as seen from a source row: the other axis' id and the
/// rating value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Signal {
    pub id: i64,
    pub value: f64,
}

/// All observations of one source row.
#[derive(Clone, Debug, PartialEq)]
pub struct SignalGroup {
    pub source_id: i64,
    pub group: Vec<Signal>,
}

/// Per-task indexes and groupings for both axes.
#[derive(Clone, Debug, Default)]
pub struct WalsEngine {
    pub user_index: IdIndex,
    pub item_index: IdIndex,
    pub user_signals: Vec<SignalGroup>,
    pub item_signals: Vec<SignalGroup>,
}

impl WalsEngine {
    pub fn new() -> Self {
        WalsEngine::default()
    }

    /// Rebuild both indexes and groupings from the dataset.
    pub fn init(&mut self, dataset: &[Observation]) {
        self.user_index.clear();
        self.item_index.clear();
        self.user_signals.clear();
        self.item_signals.clear();

        let mut mutable = dataset.to_vec();
        group_signals(&mut self.user_signals, &mut self.user_index, &mut mutable);

        // swap the id pair and regroup for the item side
        for elem in mutable.iter_mut() {
            std::mem::swap(&mut elem.user_id, &mut elem.item_id);
        }
        group_signals(&mut self.item_signals, &mut self.item_index, &mut mutable);
    }

    pub fn nusers(&self) -> usize {
        self.user_index.len()
    }

    pub fn nitems(&self) -> usize {
        self.item_index.len()
    }

    /// Solve the rows `lo..hi` of `left` against the fixed matrix `right`.
    /// Returns the mean loss over the range, or an error if any row's
    /// normal equations lose positive definiteness.
    ///
    /// Rows are split across threads in contiguous chunks; every thread
    /// writes only its own chunk.
    #[allow(clippy::too_many_arguments)]
    pub fn iterate(
        &self,
        lo: usize,
        hi: usize,
        left: &mut FactorData,
        left_signals: &[SignalGroup],
        right: &FactorData,
        right_index: &IdIndex,
        yty: &[f64],
        alpha: f64,
        lambda: f64,
    ) -> Result<f64, SwirlError> {
        if hi <= lo {
            return Ok(0.0);
        }
        let k = left.nfactors();
        let nrows = hi - lo;
        let n_threads = num_cpus::get().min(nrows).max(1);
        let chunk_rows = nrows.div_ceil(n_threads);

        let rows = left.rows_mut(lo, hi);
        let total = thread::scope(|s| {
            let mut handles = Vec::new();
            for (t, chunk) in rows.chunks_mut(chunk_rows * k).enumerate() {
                let first = lo + t * chunk_rows;
                handles.push(s.spawn(move |_| -> Result<f64, SwirlError> {
                    let mut loss = 0.0;
                    for (off, out) in chunk.chunks_mut(k).enumerate() {
                        let group = &left_signals[first + off];
                        loss += update_row(out, right, right_index, group, yty, alpha, lambda)?;
                    }
                    Ok(loss)
                }));
            }
            let mut sum = 0.0;
            for handle in handles {
                sum += handle.join().unwrap()?;
            }
            Ok::<f64, SwirlError>(sum)
        })
        .unwrap()?;

        Ok(total / (k * right.nrows() * nrows) as f64)
    }

    /// `out = X^T X`, a parallel reduction over the rows of `X`. `out` is
    /// cleared first and must hold `nfactors * nfactors` entries.
    pub fn compute_xtx(&self, x: &FactorData, out: &mut [f64]) {
        let k = x.nfactors();
        debug_assert_eq!(out.len(), k * k);
        out.iter_mut().for_each(|v| *v = 0.0);

        let nrows = x.nrows();
        if nrows == 0 {
            return;
        }
        let n_threads = num_cpus::get().min(nrows).max(1);
        let chunk_rows = nrows.div_ceil(n_threads);

        let partials: Vec<Vec<f64>> = thread::scope(|s| {
            let mut handles = Vec::new();
            for chunk in x.as_slice().chunks(chunk_rows * k) {
                handles.push(s.spawn(move |_| {
                    let mut acc = vec![0.0; k * k];
                    for row in chunk.chunks(k) {
                        for i in 0..k {
                            let ri = row[i];
                            for j in 0..k {
                                acc[i * k + j] += ri * row[j];
                            }
                        }
                    }
                    acc
                }));
            }
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
        .unwrap();

        for acc in partials {
            for (o, a) in out.iter_mut().zip(acc) {
                *o += a;
            }
        }
    }

    /// Write factors to `path`, one line per ordinal: the external id
    /// followed by the factor values at 9-digit fixed precision.
    pub fn save_factors<P: AsRef<Path>>(
        &self,
        factors: &FactorData,
        index: &IdIndex,
        path: P,
    ) -> Result<(), SwirlError> {
        if factors.nrows() != index.len() {
            return Err(SwirlError::StateMismatch(format!(
                "factor matrix has {} rows but the index holds {} ids",
                factors.nrows(),
                index.len()
            )));
        }
        let mut out = BufWriter::new(File::create(path)?);
        for idx in 0..factors.nrows() {
            write!(out, "{}", index.id(idx))?;
            for v in factors.row(idx) {
                write!(out, " {:.9}", v)?;
            }
            writeln!(out)?;
        }
        out.flush()?;
        Ok(())
    }
}

/// Group a dataset by its leading id. Sorts `dataset` by (user, item),
/// emits one group per distinct leading id, and assigns ordinals so that
/// the group at position i owns ordinal i.
fn group_signals(signals: &mut Vec<SignalGroup>, index: &mut IdIndex, dataset: &mut [Observation]) {
    dataset.sort_by(|x, y| {
        x.user_id
            .cmp(&y.user_id)
            .then_with(|| x.item_id.cmp(&y.item_id))
    });

    let mut prev: Option<i64> = None;
    let mut group = Vec::new();
    for elem in dataset.iter() {
        if prev != Some(elem.user_id) {
            if let Some(id) = prev {
                signals.push(SignalGroup {
                    source_id: id,
                    group: std::mem::take(&mut group),
                });
            }
            prev = Some(elem.user_id);
        }
        group.push(Signal {
            id: elem.item_id,
            value: elem.value,
        });
    }
    if let Some(id) = prev {
        signals.push(SignalGroup {
            source_id: id,
            group,
        });
    }

    for (i, sig) in signals.iter().enumerate() {
        let idx = index.get_or_assign(sig.source_id);
        debug_assert_eq!(idx, i);
    }
}

/// Solve the normal equations for one source row and write the result into
/// `out`; returns this row's loss contribution.
pub fn update_row(
    out: &mut [f64],
    right: &FactorData,
    right_index: &IdIndex,
    group: &SignalGroup,
    yty: &[f64],
    alpha: f64,
    lambda: f64,
) -> Result<f64, SwirlError> {
    let k = out.len();
    debug_assert_eq!(yty.len(), k * k);

    let mut a = yty.to_vec();
    let mut b = vec![0.0; k];
    let mut loss = 0.0;

    for signal in &group.group {
        let y = right.row(right_index.idx(signal.id));
        let conf = 1.0 + alpha * signal.value;
        let w = alpha * signal.value;
        for i in 0..k {
            b[i] += y[i] * conf;
            let wi = w * y[i];
            for j in 0..k {
                a[i * k + j] += wi * y[j];
            }
        }
        // constant term p^T C p
        loss += conf;
    }

    // keep B = Y^T C Y for the loss before regularizing
    let b_mat = a.clone();
    for i in 0..k {
        a[i * k + i] += lambda;
    }

    let x = match solve_spd(&mut a, k, &b) {
        Some(x) => x,
        None => {
            return Err(SwirlError::Numeric(format!(
                "normal equations for source {} are not positive definite",
                group.source_id
            )))
        }
    };

    // x^T B x - 2 x^T b
    for i in 0..k {
        for j in 0..k {
            loss += b_mat[i * k + j] * x[i] * x[j];
        }
        loss -= 2.0 * x[i] * b[i];
    }

    out.copy_from_slice(&x);
    Ok(loss)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_dataset() -> Vec<Observation> {
        vec![
            Observation {
                user_id: 1,
                item_id: 10,
                value: 1.0,
            },
            Observation {
                user_id: 1,
                item_id: 20,
                value: 1.0,
            },
            Observation {
                user_id: 2,
                item_id: 10,
                value: 1.0,
            },
            Observation {
                user_id: 2,
                item_id: 30,
                value: 1.0,
            },
        ]
    }

    #[test]
    fn grouping_assigns_sorted_ordinals() {
        let mut engine = WalsEngine::new();
        engine.init(&toy_dataset());
        assert_eq!(engine.nusers(), 2);
        assert_eq!(engine.nitems(), 3);
        // users 1, 2 in sorted order
        assert_eq!(engine.user_index.id(0), 1);
        assert_eq!(engine.user_index.id(1), 2);
        // items 10, 20, 30 in sorted order
        assert_eq!(engine.item_index.id(0), 10);
        assert_eq!(engine.item_index.id(1), 20);
        assert_eq!(engine.item_index.id(2), 30);
        // item 10 is observed by both users
        assert_eq!(engine.item_signals[0].group.len(), 2);
    }

    #[test]
    fn init_is_repeatable() {
        let mut engine = WalsEngine::new();
        engine.init(&toy_dataset());
        let users = engine.nusers();
        engine.init(&toy_dataset());
        assert_eq!(engine.nusers(), users);
        assert_eq!(engine.user_signals.len(), users);
    }

    #[test]
    fn xtx_matches_direct_product() {
        let mut x = FactorData::zeros(3, 2);
        x.row_mut(0).copy_from_slice(&[1.0, 2.0]);
        x.row_mut(1).copy_from_slice(&[3.0, 4.0]);
        x.row_mut(2).copy_from_slice(&[5.0, 6.0]);
        let engine = WalsEngine::new();
        let mut out = vec![0.0; 4];
        engine.compute_xtx(&x, &mut out);
        // X^T X = [[35, 44], [44, 56]]
        assert_eq!(out, vec![35.0, 44.0, 44.0, 56.0]);
        // output is cleared before accumulating
        engine.compute_xtx(&x, &mut out);
        assert_eq!(out, vec![35.0, 44.0, 44.0, 56.0]);
    }

    /// Plain Gaussian elimination with partial pivoting, used as the
    /// independent check on the kernel's Cholesky path.
    fn gauss_solve(mut a: Vec<f64>, n: usize, mut b: Vec<f64>) -> Vec<f64> {
        for col in 0..n {
            let pivot = (col..n)
                .max_by(|&i, &j| {
                    a[i * n + col]
                        .abs()
                        .partial_cmp(&a[j * n + col].abs())
                        .unwrap()
                })
                .unwrap();
            if pivot != col {
                for j in 0..n {
                    a.swap(col * n + j, pivot * n + j);
                }
                b.swap(col, pivot);
            }
            for row in (col + 1)..n {
                let f = a[row * n + col] / a[col * n + col];
                for j in col..n {
                    a[row * n + j] -= f * a[col * n + j];
                }
                b[row] -= f * b[col];
            }
        }
        let mut x = vec![0.0; n];
        for row in (0..n).rev() {
            let mut sum = b[row];
            for j in (row + 1)..n {
                sum -= a[row * n + j] * x[j];
            }
            x[row] = sum / a[row * n + row];
        }
        x
    }

    #[test]
    fn row_update_matches_direct_normal_equations() {
        // small synthetic Y, one user with observations on items 0 and 2
        let k = 3;
        let mut y = FactorData::zeros(4, k);
        let vals = [
            [0.3, -0.1, 0.8],
            [0.5, 0.2, -0.4],
            [-0.2, 0.7, 0.1],
            [0.9, 0.05, 0.3],
        ];
        let mut item_index = IdIndex::new();
        for (i, row) in vals.iter().enumerate() {
            y.row_mut(i).copy_from_slice(row);
            item_index.get_or_assign(100 + i as i64);
        }
        let alpha = 2.0;
        let lambda = 0.1;
        let group = SignalGroup {
            source_id: 1,
            group: vec![
                Signal {
                    id: 100,
                    value: 3.0,
                },
                Signal {
                    id: 102,
                    value: 1.0,
                },
            ],
        };

        let engine = WalsEngine::new();
        let mut yty = vec![0.0; k * k];
        engine.compute_xtx(&y, &mut yty);

        let mut out = vec![0.0; k];
        update_row(&mut out, &y, &item_index, &group, &yty, alpha, lambda).unwrap();

        // direct assembly: (Y^T C Y + lambda I) x = Y^T C p with
        // C = I + alpha * diag(v) over all items, p = 1 on observed items
        let mut a = vec![0.0; k * k];
        let mut rhs = vec![0.0; k];
        for idx in 0..4 {
            let v = match idx {
                0 => 3.0,
                2 => 1.0,
                _ => 0.0,
            };
            let c = 1.0 + alpha * v;
            let p = if v > 0.0 { 1.0 } else { 0.0 };
            let row = y.row(idx);
            for i in 0..k {
                rhs[i] += c * p * row[i];
                for j in 0..k {
                    a[i * k + j] += c * row[i] * row[j];
                }
            }
        }
        for i in 0..k {
            a[i * k + i] += lambda;
        }
        let expect = gauss_solve(a, k, rhs);

        for i in 0..k {
            assert!(
                (out[i] - expect[i]).abs() < 1e-9,
                "factor {}: {} vs {}",
                i,
                out[i],
                expect[i]
            );
        }
    }

    #[test]
    fn degenerate_system_is_an_error_not_a_panic() {
        // one fixed row and no regularizer leaves a rank-1 system
        let k = 2;
        let mut y = FactorData::zeros(1, k);
        y.row_mut(0).copy_from_slice(&[0.5, 0.5]);
        let mut index = IdIndex::new();
        index.get_or_assign(10);
        let group = SignalGroup {
            source_id: 1,
            group: vec![Signal {
                id: 10,
                value: 1.0,
            }],
        };
        let engine = WalsEngine::new();
        let mut yty = vec![0.0; k * k];
        engine.compute_xtx(&y, &mut yty);

        let mut out = vec![0.0; k];
        let result = update_row(&mut out, &y, &index, &group, &yty, 1.0, 0.0);
        assert!(matches!(result, Err(SwirlError::Numeric(_))));
    }

    #[test]
    fn iterate_covers_the_requested_range() {
        let mut engine = WalsEngine::new();
        let dataset = toy_dataset();
        engine.init(&dataset);
        let k = 2;
        let mut users = FactorData::zeros(engine.nusers(), k);
        let mut items = FactorData::zeros(engine.nitems(), k);
        items.row_mut(0).copy_from_slice(&[0.1, 0.1]);
        items.row_mut(1).copy_from_slice(&[0.1, -0.1]);
        items.row_mut(2).copy_from_slice(&[-0.1, 0.1]);

        let mut yty = vec![0.0; k * k];
        engine.compute_xtx(&items, &mut yty);
        let signals = engine.user_signals.clone();
        engine
            .iterate(0, 2, &mut users, &signals, &items, &engine.item_index, &yty, 1.0, 0.1)
            .unwrap();
        // both user rows must have been written
        assert!(users.row(0).iter().any(|v| *v != 0.0));
        assert!(users.row(1).iter().any(|v| *v != 0.0));
    }

    #[test]
    fn saved_factors_carry_external_ids_at_fixed_precision() {
        let mut engine = WalsEngine::new();
        engine.init(&toy_dataset());
        let mut users = FactorData::zeros(2, 2);
        users.row_mut(0).copy_from_slice(&[0.123456789123, -1.5]);
        users.row_mut(1).copy_from_slice(&[2.0, 0.5]);

        let path =
            std::env::temp_dir().join(format!("swirl-factors-{}.out", std::process::id()));
        engine
            .save_factors(&users, &engine.user_index, &path)
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "1 0.123456789 -1.500000000");
        assert_eq!(lines[1], "2 2.000000000 0.500000000");
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn save_rejects_a_matrix_the_index_does_not_cover() {
        let mut engine = WalsEngine::new();
        engine.init(&toy_dataset());
        let users = FactorData::zeros(5, 2);
        let path =
            std::env::temp_dir().join(format!("swirl-factors-bad-{}.out", std::process::id()));
        let result = engine.save_factors(&users, &engine.user_index, &path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }

    #[test]
    fn two_pass_factorization_reconstructs_ratings() {
        // the tiny deterministic scenario: after two passes the model must
        // reproduce the four observed cells up to regularization shrinkage
        let mut engine = WalsEngine::new();
        let dataset = toy_dataset();
        engine.init(&dataset);
        let k = 2;
        let (alpha, lambda) = (1.0, 0.1);
        let mut users = FactorData::zeros(engine.nusers(), k);
        let mut items = FactorData::zeros(engine.nitems(), k);
        items.row_mut(0).copy_from_slice(&[0.1, 0.1]);
        items.row_mut(1).copy_from_slice(&[0.1, -0.1]);
        items.row_mut(2).copy_from_slice(&[-0.1, 0.1]);

        let mut yty = vec![0.0; k * k];
        for _ in 0..2 {
            engine.compute_xtx(&items, &mut yty);
            let signals = engine.user_signals.clone();
            let n = engine.nusers();
            engine
                .iterate(
                    0,
                    n,
                    &mut users,
                    &signals,
                    &items,
                    &engine.item_index,
                    &yty,
                    alpha,
                    lambda,
                )
                .unwrap();
            engine.compute_xtx(&users, &mut yty);
            let signals = engine.item_signals.clone();
            let n = engine.nitems();
            engine
                .iterate(
                    0,
                    n,
                    &mut items,
                    &signals,
                    &users,
                    &engine.user_index,
                    &yty,
                    alpha,
                    lambda,
                )
                .unwrap();
        }

        for obs in &dataset {
            let u = users.row(engine.user_index.idx(obs.user_id));
            let v = items.row(engine.item_index.idx(obs.item_id));
            let pred: f64 = u.iter().zip(v).map(|(a, b)| a * b).sum();
            assert!(
                (pred - obs.value).abs() < 0.05 && pred > 0.9,
                "({}, {}): predicted {} want {}",
                obs.user_id,
                obs.item_id,
                pred,
                obs.value
            );
        }
    }
}
