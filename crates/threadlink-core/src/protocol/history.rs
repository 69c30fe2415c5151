//! Bounded memory of recently processed envelope ids.

use std::collections::VecDeque;

/// Fixed-capacity ring of the most recently observed envelope ids.
///
/// Only recent duplicates are caught: once an id has been evicted it will be
/// processed again if redelivered.
#[derive(Debug, Clone)]
pub struct RecentHistory {
    ids: VecDeque<String>,
    capacity: usize,
}

impl RecentHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ids: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|seen| seen == id)
    }

    /// Record `id`, evicting the oldest entry when full.
    ///
    /// Returns `false` (and records nothing) if the id was already present.
    pub fn record(&mut self, id: &str) -> bool {
        if self.contains(id) {
            return false;
        }
        if self.ids.len() == self.capacity {
            self.ids.pop_front();
        }
        self.ids.push_back(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
