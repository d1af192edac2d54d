//! Row-major factor matrices and their initialization strategies.

use crate::error::SwirlError;
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// A dense (nrows, nfactors) matrix of doubles; row i is the latent vector
/// for ordinal i.
#[derive(Clone, Debug, PartialEq)]
pub struct FactorData {
    nrows: usize,
    nfactors: usize,
    data: Vec<f64>,
}

impl FactorData {
    /// Zero-initialized matrix.
    pub fn zeros(nrows: usize, nfactors: usize) -> Self {
        FactorData {
            nrows,
            nfactors,
            data: vec![0.0; nrows * nfactors],
        }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn nfactors(&self) -> usize {
        self.nfactors
    }

    pub fn row(&self, idx: usize) -> &[f64] {
        &self.data[idx * self.nfactors..(idx + 1) * self.nfactors]
    }

    pub fn row_mut(&mut self, idx: usize) -> &mut [f64] {
        &mut self.data[idx * self.nfactors..(idx + 1) * self.nfactors]
    }

    /// Contiguous view over the rows `lo..hi`.
    pub fn rows(&self, lo: usize, hi: usize) -> &[f64] {
        &self.data[lo * self.nfactors..hi * self.nfactors]
    }

    /// Contiguous mutable view over the rows `lo..hi`.
    pub fn rows_mut(&mut self, lo: usize, hi: usize) -> &mut [f64] {
        &mut self.data[lo * self.nfactors..hi * self.nfactors]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Wire image of the whole matrix.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    /// Wire image of the rows `lo..hi`.
    pub fn rows_bytes(&self, lo: usize, hi: usize) -> &[u8] {
        bytemuck::cast_slice(self.rows(lo, hi))
    }

    /// Overwrite the whole matrix from its wire image.
    pub fn load_bytes(&mut self, bytes: &[u8]) -> Result<(), SwirlError> {
        if bytes.len() != self.data.len() * 8 {
            return Err(SwirlError::SizeMismatch(format!(
                "factor payload is {} bytes, matrix holds {}",
                bytes.len(),
                self.data.len() * 8
            )));
        }
        // cast the aligned destination down to bytes; the source buffer
        // carries no alignment guarantee
        bytemuck::cast_slice_mut::<f64, u8>(&mut self.data).copy_from_slice(bytes);
        Ok(())
    }

    /// Overwrite the rows `lo..hi` from a wire image of exactly that range.
    pub fn load_rows_bytes(&mut self, lo: usize, hi: usize, bytes: &[u8]) -> Result<(), SwirlError> {
        let expect = (hi - lo) * self.nfactors * 8;
        if bytes.len() != expect {
            return Err(SwirlError::SizeMismatch(format!(
                "row payload is {} bytes, rows {}..{} need {}",
                bytes.len(),
                lo,
                hi,
                expect
            )));
        }
        bytemuck::cast_slice_mut::<f64, u8>(self.rows_mut(lo, hi)).copy_from_slice(bytes);
        Ok(())
    }

    /// Fill every entry with samples from uniform(-bound, bound).
    pub fn fill_uniform<R: Rng>(&mut self, bound: f64, rng: &mut R) {
        let distr = Uniform::new(-bound, bound);
        for v in self.data.iter_mut() {
            *v = distr.sample(rng);
        }
    }

    /// Fill the matrix from a file holding one value per line, in row-major
    /// order. Used for reproducible runs.
    pub fn fill_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), SwirlError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| SwirlError::Dataset(format!("open {}: {}", path.display(), e)))?;
        let mut lines = BufReader::new(file).lines();
        for (i, slot) in self.data.iter_mut().enumerate() {
            let line = match lines.next() {
                Some(line) => line?,
                None => {
                    return Err(SwirlError::Dataset(format!(
                        "{}: ran out of init values at entry {}",
                        path.display(),
                        i
                    )))
                }
            };
            *slot = line.trim().parse::<f64>().map_err(|_| {
                SwirlError::Dataset(format!("{}: bad init value: {:?}", path.display(), line))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn row_views_are_contiguous() {
        let mut f = FactorData::zeros(3, 2);
        f.row_mut(1).copy_from_slice(&[1.0, 2.0]);
        assert_eq!(f.as_slice(), &[0.0, 0.0, 1.0, 2.0, 0.0, 0.0]);
        assert_eq!(f.rows(1, 3), &[1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn bytes_roundtrip_through_rows() {
        let mut src = FactorData::zeros(4, 3);
        for i in 0..4 {
            for j in 0..3 {
                src.row_mut(i)[j] = (i * 3 + j) as f64;
            }
        }
        let mut dst = FactorData::zeros(4, 3);
        dst.load_rows_bytes(1, 3, src.rows_bytes(1, 3)).unwrap();
        assert_eq!(dst.rows(1, 3), src.rows(1, 3));
        assert_eq!(dst.row(0), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn load_rejects_wrong_size() {
        let mut f = FactorData::zeros(2, 2);
        assert!(f.load_bytes(&[0u8; 8]).is_err());
        assert!(f.load_rows_bytes(0, 1, &[0u8; 24]).is_err());
    }

    #[test]
    fn uniform_fill_respects_bound() {
        let mut f = FactorData::zeros(10, 10);
        let mut rng = rand::thread_rng();
        f.fill_uniform(0.01, &mut rng);
        assert!(f.as_slice().iter().all(|v| v.abs() < 0.01));
        assert!(f.as_slice().iter().any(|v| *v != 0.0));
    }

    #[test]
    fn file_fill_is_row_major() {
        let path =
            std::env::temp_dir().join(format!("swirl-init-{}.dat", std::process::id()));
        let mut out = File::create(&path).unwrap();
        for v in ["0.1", "0.1", "0.1", "-0.1", "-0.1", "0.1"] {
            writeln!(out, "{}", v).unwrap();
        }
        drop(out);
        let mut f = FactorData::zeros(3, 2);
        f.fill_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(f.row(0), &[0.1, 0.1]);
        assert_eq!(f.row(1), &[0.1, -0.1]);
        assert_eq!(f.row(2), &[-0.1, 0.1]);
    }

    #[test]
    fn file_fill_underflow_is_an_error() {
        let path =
            std::env::temp_dir().join(format!("swirl-init-short-{}.dat", std::process::id()));
        std::fs::write(&path, "0.5\n").unwrap();
        let mut f = FactorData::zeros(2, 2);
        let result = f.fill_from_file(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }
}
