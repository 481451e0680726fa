//! Concurrent multiset of shard priorities with max tracking
//!
//! Used by the aggregator to know the best priority among shards that have
//! not finished yet.

use std::sync::Mutex;

/// Multiset of f64 priorities kept sorted ascending
#[derive(Debug, Default)]
pub struct PrioritySet {
    values: Mutex<Vec<f64>>,
}

impl PrioritySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, value: f64) {
        let mut values = self.lock();
        let pos = values.partition_point(|v| v.total_cmp(&value).is_le());
        values.insert(pos, value);
    }

    /// Remove one occurrence of `value`; a no-op when absent
    pub fn remove(&self, value: f64) {
        let mut values = self.lock();
        if let Some(pos) = values.iter().rposition(|v| v.total_cmp(&value).is_eq()) {
            values.remove(pos);
        }
    }

    /// Largest value, or negative infinity when empty
    pub fn max(&self) -> f64 {
        self.lock().last().copied().unwrap_or(f64::NEG_INFINITY)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<f64>> {
        // The vector stays sorted even if a holder panicked
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}
