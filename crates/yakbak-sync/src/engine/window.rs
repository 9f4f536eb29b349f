//! The merge window: a session's in-memory, newest-first record sequence.

use std::collections::HashSet;

use yakbak_core::{Record, RecordId, Timestamp};

/// Records held by one session, sorted by `created_at` descending.
///
/// Only the first `threshold` records are exposed to the view. The threshold
/// never shrinks and never exceeds the number of held records. Ties keep
/// their relative order across re-sorts.
#[derive(Debug, Default)]
pub struct MergeWindow {
    records: Vec<Record>,
    ids: HashSet<RecordId>,
    threshold: usize,
}

impl MergeWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.ids.contains(id)
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// The exposed prefix.
    pub fn visible(&self) -> &[Record] {
        &self.records[..self.threshold]
    }

    /// Whether held records remain beyond the threshold.
    pub fn has_hidden(&self) -> bool {
        self.threshold < self.records.len()
    }

    pub fn oldest_created_at(&self) -> Option<Timestamp> {
        self.records.iter().map(|r| r.created_at).min()
    }

    /// Push `record` at the end without sorting. False if already held.
    pub fn append(&mut self, record: Record) -> bool {
        if !self.ids.insert(record.id) {
            return false;
        }
        self.records.push(record);
        true
    }

    /// Place `record` at its sorted position, after any records with the same
    /// timestamp. Returns the index, or `None` if already held. A record that
    /// lands inside the visible prefix extends it by one.
    pub fn insert_sorted(&mut self, record: Record) -> Option<usize> {
        if !self.ids.insert(record.id) {
            return None;
        }
        let index = self
            .records
            .partition_point(|r| r.created_at >= record.created_at);
        self.records.insert(index, record);
        if index < self.threshold {
            self.threshold += 1;
        }
        Some(index)
    }

    /// Stable re-sort, newest first.
    pub fn sort(&mut self) {
        self.records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    }

    /// Drop everything past the first `len` records. Only valid before the
    /// records have been exposed.
    pub fn truncate(&mut self, len: usize) {
        for dropped in self.records.drain(len.min(self.records.len())..) {
            self.ids.remove(&dropped.id);
        }
        self.threshold = self.threshold.min(self.records.len());
    }

    /// Expose `n` more records, capped at the window size.
    pub fn advance(&mut self, n: usize) -> usize {
        self.threshold = (self.threshold + n).min(self.records.len());
        self.threshold
    }

    /// Raise the threshold to `n` (capped), never lowering it.
    pub fn raise_to(&mut self, n: usize) -> usize {
        self.threshold = self.threshold.max(n.min(self.records.len()));
        self.threshold
    }
}
