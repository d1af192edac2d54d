//! Bijection between external 64-bit ids and dense 0-based ordinals.

use std::collections::HashMap;

/// Assigns dense ordinals to external ids in first-seen order.
#[derive(Clone, Debug, Default)]
pub struct IdIndex {
    ids: Vec<i64>,
    ordinals: HashMap<i64, usize>,
}

impl IdIndex {
    pub fn new() -> Self {
        IdIndex::default()
    }

    /// Ordinal for `id`, assigning the next free one on first sight.
    pub fn get_or_assign(&mut self, id: i64) -> usize {
        if let Some(&idx) = self.ordinals.get(&id) {
            return idx;
        }
        let idx = self.ids.len();
        self.ids.push(id);
        self.ordinals.insert(id, idx);
        idx
    }

    /// Ordinal for an id that must already be assigned.
    pub fn idx(&self, id: i64) -> usize {
        self.ordinals[&id]
    }

    /// External id for an assigned ordinal.
    pub fn id(&self, idx: usize) -> i64 {
        self.ids[idx]
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.ordinals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bijection() {
        let mut index = IdIndex::new();
        let external = [42i64, -7, 9_000_000_000, 42, 0];
        for &e in &external {
            index.get_or_assign(e);
        }
        // duplicates collapse
        assert_eq!(index.len(), 4);
        for &e in &[42i64, -7, 9_000_000_000, 0] {
            assert_eq!(index.id(index.idx(e)), e);
        }
        for i in 0..index.len() {
            assert_eq!(index.idx(index.id(i)), i);
        }
    }

    #[test]
    fn first_seen_order() {
        let mut index = IdIndex::new();
        assert_eq!(index.get_or_assign(5), 0);
        assert_eq!(index.get_or_assign(3), 1);
        assert_eq!(index.get_or_assign(5), 0);
        assert_eq!(index.get_or_assign(8), 2);
    }
}
