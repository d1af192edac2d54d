//! The rating dataset: observation records, the text reader, and the
//! byte-level views used to ship a dataset over the wire in one block.

use crate::error::SwirlError;
use bytemuck::{Pod, Zeroable};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// One implicit-feedback observation. `repr(C)` with no padding: 24 bytes,
/// shipped over the wire in host layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Observation {
    pub user_id: i64,
    pub item_id: i64,
    pub value: f64,
}

/// Size of one observation on the wire.
pub const OBSERVATION_LEN: usize = std::mem::size_of::<Observation>();

/// Read a training set: one `user item value` triple per line, whitespace
/// separated, blank lines skipped.
pub fn read_dataset<P: AsRef<Path>>(path: P) -> Result<Vec<Observation>, SwirlError> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| SwirlError::Dataset(format!("open {}: {}", path.display(), e)))?;
    let mut out = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let parsed = (|| {
            let user_id = fields.next()?.parse::<i64>().ok()?;
            let item_id = fields.next()?.parse::<i64>().ok()?;
            let value = fields.next()?.parse::<f64>().ok()?;
            Some(Observation {
                user_id,
                item_id,
                value,
            })
        })();
        match parsed {
            Some(obs) => out.push(obs),
            None => {
                return Err(SwirlError::Dataset(format!(
                    "{}:{}: malformed observation: {:?}",
                    path.display(),
                    lineno + 1,
                    line
                )))
            }
        }
    }
    Ok(out)
}

/// The raw wire image of a dataset.
pub fn dataset_bytes(dataset: &[Observation]) -> &[u8] {
    bytemuck::cast_slice(dataset)
}

/// Rebuild a dataset from its wire image.
pub fn dataset_from_bytes(bytes: &[u8]) -> Result<Vec<Observation>, SwirlError> {
    if bytes.len() % OBSERVATION_LEN != 0 {
        return Err(SwirlError::SizeMismatch(format!(
            "rating payload of {} bytes is not a whole number of {}-byte records",
            bytes.len(),
            OBSERVATION_LEN
        )));
    }
    // the wire buffer carries no alignment guarantee, so collect by copy
    Ok(bytemuck::pod_collect_to_vec(bytes))
}
