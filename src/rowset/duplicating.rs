//! DuplicatingRowSet
//!
//! Installed in place of a flush/compaction's inputs between the first and
//! the final swap. Reads and containment go to the inputs, which hold every
//! row; updates land on the owning input and are mirrored onto the output
//! that received the row, so neither side misses a write while the swap is
//! in progress.
//!
//! The input is authoritative: once it has stored a mutation the write
//! succeeds. A mirror that fails is recorded instead, and the final swap
//! must not install the outputs afterwards.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use super::{CompactionInput, KeyedMutation, Mutation, RowSet};
use crate::error::{Result, TabletError};
use crate::iterator::{MergeIterator, RowwiseIterator};
use crate::mvcc::{MvccSnapshot, Timestamp};
use crate::schema::{RowChangeList, Schema};

pub struct DuplicatingRowSet {
    inputs: Vec<Arc<dyn RowSet>>,
    outputs: Vec<Arc<dyn RowSet>>,
    /// Set once a mutation stored in an input did not reach the outputs
    mirror_failed: AtomicBool,
}

impl DuplicatingRowSet {
    pub fn new(inputs: Vec<Arc<dyn RowSet>>, outputs: Vec<Arc<dyn RowSet>>) -> Self {
        Self {
            inputs,
            outputs,
            mirror_failed: AtomicBool::new(false),
        }
    }

    /// `IllegalState` if any mutation failed to reach the outputs
    pub fn check_mirrored(&self) -> Result<()> {
        if self.mirror_failed.load(Ordering::Acquire) {
            return Err(TabletError::IllegalState(format!(
                "{}: outputs are missing updates",
                self.describe()
            )));
        }
        Ok(())
    }

    pub fn inputs(&self) -> &[Arc<dyn RowSet>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Arc<dyn RowSet>] {
        &self.outputs
    }

    fn find_owner<'a>(
        rowsets: &'a [Arc<dyn RowSet>],
        key: &[u8],
    ) -> Result<Option<&'a Arc<dyn RowSet>>> {
        for rs in rowsets.iter().rev() {
            if rs.check_row_present(key)? {
                return Ok(Some(rs));
            }
        }
        Ok(None)
    }

    /// Copy a mutation the input already holds onto the owning output
    fn mirror_to_output(&self, key: &[u8], mutation: &Mutation) {
        let result = Self::find_owner(&self.outputs, key).and_then(|owner| match owner {
            Some(output) => output.reapply_mutation(key, mutation),
            None => Err(TabletError::KeyNotFound),
        });
        if let Err(e) = result {
            warn!(
                rowset = %self.describe(),
                ts = mutation.ts.0,
                error = %e,
                "Failed to mirror update to outputs"
            );
            self.mirror_failed.store(true, Ordering::Release);
        }
    }
}

impl fmt::Debug for DuplicatingRowSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl RowSet for DuplicatingRowSet {
    fn describe(&self) -> String {
        let names = |v: &[Arc<dyn RowSet>]| {
            v.iter().map(|r| r.describe()).collect::<Vec<_>>().join(", ")
        };
        format!(
            "DuplicatingRowSet([{}] -> [{}])",
            names(&self.inputs),
            names(&self.outputs)
        )
    }

    fn check_row_present(&self, key: &[u8]) -> Result<bool> {
        Ok(Self::find_owner(&self.inputs, key)?.is_some())
    }

    fn mutate_row(&self, ts: Timestamp, key: &[u8], change: &RowChangeList) -> Result<()> {
        let input = Self::find_owner(&self.inputs, key)?.ok_or(TabletError::KeyNotFound)?;
        input.mutate_row(ts, key, change)?;
        let mutation = Mutation {
            ts,
            change: change.clone(),
        };
        self.mirror_to_output(key, &mutation);
        Ok(())
    }

    fn reapply_mutation(&self, key: &[u8], mutation: &Mutation) -> Result<()> {
        let input = Self::find_owner(&self.inputs, key)?.ok_or(TabletError::KeyNotFound)?;
        input.reapply_mutation(key, mutation)?;
        self.mirror_to_output(key, mutation);
        Ok(())
    }

    fn collect_mutations(
        &self,
        filter: &dyn Fn(Timestamp) -> bool,
    ) -> Result<Vec<KeyedMutation>> {
        let mut all = Vec::new();
        for input in &self.inputs {
            all.extend(input.collect_mutations(filter)?);
        }
        Ok(all)
    }

    fn new_row_iterator(
        self: Arc<Self>,
        projection: &Schema,
        snap: &MvccSnapshot,
    ) -> Result<Box<dyn RowwiseIterator>> {
        let mut sources = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            sources.push(Arc::clone(input).new_row_iterator(projection, snap)?);
        }
        Ok(Box::new(MergeIterator::new(projection.clone(), sources)))
    }

    fn new_compaction_input(
        self: Arc<Self>,
        _snap: &MvccSnapshot,
        _ancient: Timestamp,
    ) -> Result<CompactionInput> {
        Err(TabletError::IllegalState(format!(
            "{} cannot be compacted",
            self.describe()
        )))
    }

    fn count_rows(&self) -> Result<u64> {
        let mut total = 0;
        for input in &self.inputs {
            total += input.count_rows()?;
        }
        Ok(total)
    }

    fn estimate_size(&self) -> u64 {
        self.inputs.iter().map(|r| r.estimate_size()).sum()
    }

    fn durable_indices(&self) -> Vec<u64> {
        self.inputs.iter().flat_map(|r| r.durable_indices()).collect()
    }

    fn compaction_flag(&self) -> Option<&AtomicBool> {
        None
    }

    fn key_bounds(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let bounds: Vec<_> = self.inputs.iter().filter_map(|r| r.key_bounds()).collect();
        let min = bounds.iter().map(|(lo, _)| lo.clone()).min()?;
        let max = bounds.iter().map(|(_, hi)| hi.clone()).max()?;
        Some((min, max))
    }
}
