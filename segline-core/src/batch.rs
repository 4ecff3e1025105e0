//! A set of transfers that completes as a unit.

use std::collections::HashSet;
use std::hash::Hash;

use tracing::debug;

/// Tracks members by key; reports completion exactly once, when the last member
/// completes, or at `start` when there are none.
#[derive(Debug)]
pub struct Batch<K> {
    remaining: HashSet<K>,
    total: usize,
    done: bool,
}

impl<K: Eq + Hash> Batch<K> {
    pub fn new(members: impl IntoIterator<Item = K>) -> Self {
        let remaining: HashSet<K> = members.into_iter().collect();
        Self {
            total: remaining.len(),
            remaining,
            done: false,
        }
    }

    /// Returns `true` if the batch is empty and therefore already complete.
    pub fn start(&mut self) -> bool {
        if self.remaining.is_empty() && !self.done {
            self.done = true;
            return true;
        }
        false
    }

    /// Mark one member complete. Returns `true` only for the call that completes the batch.
    pub fn mark_complete(&mut self, key: &K) -> bool {
        if !self.remaining.remove(key) {
            return false;
        }
        debug!(remaining = self.remaining.len(), total = self.total, "batch member complete");
        if self.remaining.is_empty() && !self.done {
            self.done = true;
            return true;
        }
        false
    }

    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_complete(&self) -> bool {
        self.done
    }
}
