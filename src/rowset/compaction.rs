//! RowSetsInCompaction
//!
//! Selection-phase helper: collects rowsets for one flush/compaction while
//! holding each rowset's selection flag, so no rowset is picked twice.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{same_rowset, RowSet};

/// Holds a rowset's selection flag; released on drop
pub struct CompactionLock {
    rowset: Arc<dyn RowSet>,
}

impl CompactionLock {
    /// Claim the rowset's flag, or `None` if it is taken or the rowset is not
    /// selectable
    pub fn try_acquire(rowset: &Arc<dyn RowSet>) -> Option<Self> {
        let flag = rowset.compaction_flag()?;
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        Some(Self {
            rowset: Arc::clone(rowset),
        })
    }
}

impl Drop for CompactionLock {
    fn drop(&mut self) {
        if let Some(flag) = self.rowset.compaction_flag() {
            flag.store(false, Ordering::Release);
        }
    }
}

/// Working set of rowsets picked for one compaction (or flush)
#[derive(Default)]
pub struct RowSetsInCompaction {
    rowsets: Vec<Arc<dyn RowSet>>,
    locks: Vec<CompactionLock>,
    total_size: u64,
}

impl RowSetsInCompaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rowset if nobody else has selected it. Returns false (and leaves
    /// the set unchanged) if it is already selected or not selectable.
    pub fn add(&mut self, rowset: Arc<dyn RowSet>) -> bool {
        if self.contains(&rowset) {
            return false;
        }
        let lock = match CompactionLock::try_acquire(&rowset) {
            Some(lock) => lock,
            None => return false,
        };
        self.total_size += rowset.estimate_size();
        self.rowsets.push(rowset);
        self.locks.push(lock);
        true
    }

    pub fn contains(&self, rowset: &Arc<dyn RowSet>) -> bool {
        self.rowsets.iter().any(|r| same_rowset(r, rowset))
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn num_rowsets(&self) -> usize {
        self.rowsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rowsets.is_empty()
    }

    pub fn rowsets(&self) -> &[Arc<dyn RowSet>] {
        &self.rowsets
    }

    pub fn describe(&self) -> String {
        let names: Vec<String> = self.rowsets.iter().map(|r| r.describe()).collect();
        format!("[{}]", names.join(", "))
    }
}
