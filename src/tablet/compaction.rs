//! Flush and compaction
//!
//! Both rewrite a set of input rowsets into new DiskRowSets and then swap
//! the outputs in:
//!
//! ```text
//!   write snapshot ──► swap in DuplicatingRowSet ──► reupdate missed deltas
//!        (unlocked)          (exclusive)                  (unlocked)
//!                                                             │
//!   mark inputs obsolete ◄── swap in outputs (metadata commit) ◄┘
//!                                 (exclusive)
//! ```
//!
//! A failure at any step puts the inputs back and discards the outputs.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::{get_rowset_path, Tablet};
use crate::diskrowset::{DiskRowSet, DiskRowSetMeta, DiskRowSetWriter};
use crate::error::{Result, TabletError};
use crate::memrowset::MemRowSet;
use crate::mvcc::{MvccSnapshot, Timestamp};
use crate::rowset::{
    same_rowset, CompactionInput, CompactionRow, DuplicatingRowSet, KeyedMutation, RowSet,
    RowSetsInCompaction,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RewriteKind {
    Flush,
    Compaction,
}

impl RewriteKind {
    fn name(&self) -> &'static str {
        match self {
            RewriteKind::Flush => "flush",
            RewriteKind::Compaction => "compaction",
        }
    }
}

// =============================================================================
// Merging compaction inputs
// =============================================================================

struct HeapEntry {
    row: CompactionRow,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Max-heap: smallest key first; on equal keys the later insert wins
    fn cmp(&self, other: &Self) -> Ordering {
        match self.row.key.cmp(&other.row.key) {
            Ordering::Equal => self
                .row
                .insert_ts
                .cmp(&other.row.insert_ts)
                .then(self.source.cmp(&other.source)),
            ord => ord.reverse(),
        }
    }
}

/// Key-ordered union of compaction inputs, one row per key
struct MergedInput {
    sources: Vec<CompactionInput>,
    heap: BinaryHeap<HeapEntry>,
}

impl MergedInput {
    fn new(mut sources: Vec<CompactionInput>) -> Result<Self> {
        let mut heap = BinaryHeap::new();
        for (source, input) in sources.iter_mut().enumerate() {
            if let Some(row) = input.next().transpose()? {
                heap.push(HeapEntry { row, source });
            }
        }
        Ok(Self { sources, heap })
    }

    fn refill(&mut self, source: usize) -> Result<()> {
        if let Some(row) = self.sources[source].next().transpose()? {
            self.heap.push(HeapEntry { row, source });
        }
        Ok(())
    }

    fn next_row(&mut self) -> Result<Option<CompactionRow>> {
        let top = match self.heap.pop() {
            Some(entry) => entry,
            None => return Ok(None),
        };
        self.refill(top.source)?;

        while let Some(next) = self.heap.peek() {
            if next.row.key != top.row.key {
                break;
            }
            if let Some(shadowed) = self.heap.pop() {
                self.refill(shadowed.source)?;
            }
        }
        Ok(Some(top.row))
    }
}

// =============================================================================
// Flush / Compact
// =============================================================================

impl Tablet {
    /// Write the active MemRowSet out as DiskRowSet(s). No-op if it is empty.
    pub fn flush(&self) -> Result<()> {
        self.check_open()?;
        let _flush_guard = self.flush_lock.lock();
        let start = Instant::now();

        // Retire the MemRowSet into the rowset collection and install a new one
        let (old_mrs, input, snap) = {
            let mut components = self.components.write();
            if components.memrowset.is_empty() {
                debug!("Flush: MemRowSet is empty, nothing to do");
                return Ok(());
            }
            let old_mrs = Arc::clone(&components.memrowset);
            let old_rs: Arc<dyn RowSet> = old_mrs.clone();

            let mut input = RowSetsInCompaction::new();
            if !input.add(Arc::clone(&old_rs)) {
                return Err(TabletError::IllegalState(format!(
                    "{} is already being flushed",
                    old_rs.describe()
                )));
            }
            self.swap_locked(&mut components, &[], &[old_rs])?;
            components.memrowset = Arc::new(MemRowSet::new(self.allocate_mrs_id(), self.schema.clone()));
            (old_mrs, input, self.mvcc.take_snapshot())
        };
        let ancient = self.mvcc.ancient_history_mark();

        info!(
            memrowset = old_mrs.id(),
            rows = old_mrs.entry_count(),
            bytes = old_mrs.memory_footprint(),
            snapshot = %snap,
            ancient = ancient.0,
            "Flush: started"
        );

        let result = self
            .run_flush_hook(|h| h.post_swap_new_memrowset())
            .and_then(|_| {
                let mrs: Arc<dyn RowSet> = old_mrs.clone();
                let stream = mrs.new_compaction_input(&snap, ancient)?;
                self.do_compaction_or_flush(&input, vec![stream], &snap, RewriteKind::Flush)
            });

        match result {
            Ok(()) => {
                info!(
                    memrowset = old_mrs.id(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Flush: complete"
                );
                Ok(())
            }
            Err(e) => {
                warn!(memrowset = old_mrs.id(), error = %e, "Flush: failed, restoring MemRowSet");
                if let Err(re) = self.restore_memrowset(&old_mrs) {
                    error!(memrowset = old_mrs.id(), error = %re, "Failed to restore MemRowSet");
                }
                Err(e)
            }
        }
    }

    /// Put a retired MemRowSet back as the active one, absorbing rows
    /// inserted into its replacement in the meantime
    fn restore_memrowset(&self, old_mrs: &Arc<MemRowSet>) -> Result<()> {
        let mut components = self.components.write();
        let old_rs: Arc<dyn RowSet> = old_mrs.clone();

        let absorbed = old_mrs.absorb(&components.memrowset)?;
        self.swap_locked(&mut components, &[old_rs], &[])?;
        components.memrowset = Arc::clone(old_mrs);
        debug!(memrowset = old_mrs.id(), absorbed, "Restored MemRowSet");
        Ok(())
    }

    /// Merge a set of DiskRowSets. No-op if nothing is eligible.
    pub fn compact(&self) -> Result<()> {
        self.check_open()?;
        let start = Instant::now();

        let input = self.pick_rowsets_to_compact()?;
        if input.is_empty() {
            debug!("Compaction: nothing to compact");
            return Ok(());
        }

        let snap = self.mvcc.take_snapshot();
        let ancient = self.mvcc.ancient_history_mark();
        let streams = self.capture_compaction_inputs(&input, &snap, ancient)?;

        info!(
            inputs = %input.describe(),
            bytes = input.total_size(),
            snapshot = %snap,
            ancient = ancient.0,
            "Compaction: started"
        );

        self.run_compaction_hook(|h| h.post_select_iterators())?;
        self.do_compaction_or_flush(&input, streams, &snap, RewriteKind::Compaction)?;

        info!(
            inputs = input.num_rowsets(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Compaction: complete"
        );
        Ok(())
    }

    /// Choose the DiskRowSets for the next compaction and claim them.
    ///
    /// Starts from the smallest rowset. Each further pick is the smallest
    /// rowset whose key range overlaps the range picked so far, or the
    /// smallest remaining one if none overlaps. Bounded by count and total
    /// size; the first pick is always admitted. Empty if fewer than the
    /// configured minimum.
    pub fn pick_rowsets_to_compact(&self) -> Result<RowSetsInCompaction> {
        let policy = self.config.compaction;
        let components = self.components.read();

        let mut candidates: Vec<(&Arc<dyn RowSet>, u64)> = components
            .rowsets
            .iter()
            .filter(|r| r.compaction_flag().is_some() && !r.durable_indices().is_empty())
            .map(|r| (r, r.estimate_size()))
            .collect();
        candidates.sort_by_key(|&(_, size)| size);

        let mut picked = RowSetsInCompaction::new();
        let mut range: Option<(Vec<u8>, Vec<u8>)> = None;
        while !candidates.is_empty() && picked.num_rowsets() < policy.max_rowsets_per_compaction {
            let pos = range
                .as_ref()
                .and_then(|r| {
                    candidates
                        .iter()
                        .position(|(rs, _)| rs.key_bounds().map_or(false, |b| ranges_overlap(r, &b)))
                })
                .unwrap_or(0);
            let (rowset, size) = candidates.remove(pos);
            if !picked.is_empty() && picked.total_size() + size > policy.max_compaction_input_bytes {
                continue;
            }
            if picked.add(Arc::clone(rowset)) {
                range = widen_range(range, rowset.key_bounds());
            }
        }

        if picked.num_rowsets() < policy.min_rowsets_to_compact {
            return Ok(RowSetsInCompaction::new());
        }
        debug!(picked = %picked.describe(), bytes = picked.total_size(), "Picked rowsets to compact");
        Ok(picked)
    }

    /// Compaction inputs for exactly the picked rowsets, under the shared guard
    fn capture_compaction_inputs(
        &self,
        input: &RowSetsInCompaction,
        snap: &MvccSnapshot,
        ancient: Timestamp,
    ) -> Result<Vec<CompactionInput>> {
        let components = self.components.read();
        let mut streams = Vec::with_capacity(input.num_rowsets());
        for rowset in input.rowsets() {
            if !components.rowsets.iter().any(|r| same_rowset(r, rowset)) {
                return Err(TabletError::IllegalState(format!(
                    "{} left the tablet before compaction",
                    rowset.describe()
                )));
            }
            streams.push(Arc::clone(rowset).new_compaction_input(snap, ancient)?);
        }
        Ok(streams)
    }

    // =========================================================================
    // Shared rewrite path
    // =========================================================================

    fn do_compaction_or_flush(
        &self,
        input: &RowSetsInCompaction,
        streams: Vec<CompactionInput>,
        snap: &MvccSnapshot,
        kind: RewriteKind,
    ) -> Result<()> {
        let inputs: Vec<Arc<dyn RowSet>> = input.rowsets().to_vec();

        // Step 1: write the snapshot of the inputs
        let outputs = self.write_snapshot(streams)?;
        debug!(
            kind = kind.name(),
            outputs = outputs.len(),
            "Wrote snapshot"
        );
        if let Err(e) = self.run_common_hook(|h| h.post_write_snapshot()) {
            Self::discard_outputs(&outputs);
            return Err(e);
        }

        // Step 2: duplicate updates into the outputs while they catch up
        let duplicating = Arc::new(DuplicatingRowSet::new(inputs.clone(), outputs.clone()));
        let dup: Arc<dyn RowSet> = duplicating.clone();
        let boundary = match self.atomic_swap_rowsets(&inputs, &[Arc::clone(&dup)]) {
            Ok(snap) => snap,
            Err(e) => {
                Self::discard_outputs(&outputs);
                return Err(e);
            }
        };

        // Step 3: carry over mutations the snapshot missed
        let caught_up = self
            .run_common_hook(|h| h.post_swap_in_duplicating_rowset())
            .and_then(|_| self.reupdate_missed_deltas(&inputs, &outputs, snap, &boundary))
            .and_then(|_| self.run_common_hook(|h| h.post_reupdate_missed_deltas()));
        if let Err(e) = caught_up {
            warn!(kind = kind.name(), error = %e, "Rolling back before final swap");
            self.swap_back(&dup, &inputs, &outputs);
            return Err(e);
        }

        // Step 4: install the outputs (metadata commit point), unless an
        // update failed to reach them
        let final_snap = match self.swap_rowsets_checked(&[Arc::clone(&dup)], &outputs, || {
            duplicating.check_mirrored()
        }) {
            Ok(snap) => snap,
            Err(e) => {
                warn!(kind = kind.name(), error = %e, "Final swap failed, rolling back");
                self.swap_back(&dup, &inputs, &outputs);
                return Err(e);
            }
        };

        if let Err(e) = self.run_common_hook(|h| h.post_swap_new_rowset()) {
            warn!(kind = kind.name(), error = %e, "Rolling back after final swap");
            self.unswap_outputs(&inputs, &outputs, &final_snap);
            return Err(e);
        }

        // Step 5: inputs go away when their last reader lets go
        for rowset in &inputs {
            rowset.mark_obsolete();
        }
        Ok(())
    }

    /// Merge `streams` into new DiskRowSets, rolling over at the target
    /// size, and seed their delta stores with the carried redo mutations
    fn write_snapshot(&self, streams: Vec<CompactionInput>) -> Result<Vec<Arc<dyn RowSet>>> {
        let mut written: Vec<DiskRowSetMeta> = Vec::new();
        let mut redo: Vec<KeyedMutation> = Vec::new();
        let result = self.write_rolling(streams, &mut written, &mut redo);
        if let Err(e) = result {
            for meta in &written {
                if let Err(rm) = fs::remove_dir_all(&meta.dir) {
                    warn!(index = meta.index, error = %rm, "Failed to remove unused output");
                }
            }
            return Err(e);
        }

        let mut outputs: Vec<Arc<dyn RowSet>> = Vec::with_capacity(written.len());
        for meta in &written {
            match DiskRowSet::open(&meta.dir, meta.index, self.schema.clone(), self.config.delta_sync) {
                Ok(drs) => outputs.push(Arc::new(drs)),
                Err(e) => {
                    Self::discard_outputs(&outputs);
                    for meta in &written[outputs.len()..] {
                        if let Err(rm) = fs::remove_dir_all(&meta.dir) {
                            warn!(index = meta.index, error = %rm, "Failed to remove unused output");
                        }
                    }
                    return Err(e);
                }
            }
        }

        if let Err(e) = Self::seed_redo(&outputs, &redo) {
            Self::discard_outputs(&outputs);
            return Err(e);
        }
        Ok(outputs)
    }

    /// Store each carried mutation in the output holding its row, keeping
    /// the timestamp it committed at
    fn seed_redo(outputs: &[Arc<dyn RowSet>], redo: &[KeyedMutation]) -> Result<()> {
        for km in redo {
            let owner = find_row_owner(outputs, &km.key)?.ok_or_else(|| {
                TabletError::IllegalState("carried mutation for a row absent from outputs".to_string())
            })?;
            owner.reapply_mutation(&km.key, &km.mutation)?;
        }
        if !redo.is_empty() {
            debug!(count = redo.len(), "Carried redo mutations into outputs");
        }
        Ok(())
    }

    fn write_rolling(
        &self,
        streams: Vec<CompactionInput>,
        written: &mut Vec<DiskRowSetMeta>,
        redo: &mut Vec<KeyedMutation>,
    ) -> Result<()> {
        let mut merged = MergedInput::new(streams)?;
        let mut writer: Option<DiskRowSetWriter> = None;

        let outcome = (|| -> Result<()> {
            while let Some(row) = merged.next_row()? {
                if writer.is_none() {
                    let index = self.allocate_rowset_index()?;
                    writer = Some(DiskRowSetWriter::new(
                        &get_rowset_path(&self.dir, index),
                        index,
                        self.schema.byte_size(),
                        self.config.bloom_sizing,
                    )?);
                }
                let full = match writer.as_mut() {
                    Some(w) => {
                        w.add(&row.key, row.insert_ts, &row.row)?;
                        let CompactionRow { key, redo: carried, .. } = row;
                        redo.extend(carried.into_iter().map(|mutation| KeyedMutation {
                            key: key.clone(),
                            mutation,
                        }));
                        w.bytes_written() >= self.config.target_rowset_size
                    }
                    None => false,
                };
                if full {
                    if let Some(w) = writer.take() {
                        written.push(w.finish()?);
                    }
                }
            }
            if let Some(last) = writer.take() {
                written.push(last.finish()?);
            }
            Ok(())
        })();

        if outcome.is_err() {
            if let Some(w) = writer.take() {
                w.abort();
            }
        }
        outcome
    }

    /// Apply to the outputs every input mutation committed after `snap`
    /// but before `boundary`
    fn reupdate_missed_deltas(
        &self,
        inputs: &[Arc<dyn RowSet>],
        outputs: &[Arc<dyn RowSet>],
        snap: &MvccSnapshot,
        boundary: &MvccSnapshot,
    ) -> Result<()> {
        let missed = |ts| !snap.is_committed(ts) && boundary.is_committed(ts);
        let mut count = 0usize;
        for input in inputs {
            for km in input.collect_mutations(&missed)? {
                let owner = find_row_owner(outputs, &km.key)?.ok_or_else(|| {
                    TabletError::IllegalState(format!(
                        "missed delta for a row absent from outputs of {}",
                        input.describe()
                    ))
                })?;
                owner.reapply_mutation(&km.key, &km.mutation)?;
                count += 1;
            }
        }
        debug!(count, "Reupdated missed deltas");
        Ok(())
    }

    // =========================================================================
    // Rollback
    // =========================================================================

    /// Replace the duplicating rowset with the inputs again
    fn swap_back(&self, dup: &Arc<dyn RowSet>, inputs: &[Arc<dyn RowSet>], outputs: &[Arc<dyn RowSet>]) {
        if let Err(e) = self.atomic_swap_rowsets(&[Arc::clone(dup)], inputs) {
            // Same durable layout on both sides: only fails on a logic error
            error!(error = %e, "Failed to restore compaction inputs");
            return;
        }
        Self::discard_outputs(outputs);
    }

    /// Undo a completed final swap: replay onto the inputs whatever the
    /// outputs received since the swap, then swap the inputs back in
    fn unswap_outputs(&self, inputs: &[Arc<dyn RowSet>], outputs: &[Arc<dyn RowSet>], final_snap: &MvccSnapshot) {
        let mut components = self.components.write();

        let replay = (|| -> Result<usize> {
            let after_swap = |ts| !final_snap.is_committed(ts);
            let mut count = 0;
            for output in outputs {
                for km in output.collect_mutations(&after_swap)? {
                    let owner = find_row_owner(inputs, &km.key)?
                        .ok_or(TabletError::KeyNotFound)?;
                    owner.reapply_mutation(&km.key, &km.mutation)?;
                    count += 1;
                }
            }
            Ok(count)
        })();

        let result = replay.and_then(|count| {
            self.swap_locked(&mut components, outputs, inputs)?;
            Ok(count)
        });
        match result {
            Ok(count) => {
                debug!(replayed = count, "Restored inputs after final swap");
                drop(components);
                Self::discard_outputs(outputs);
            }
            Err(e) => {
                // The outputs are installed and hold every row: keep them
                error!(error = %e, "Could not restore inputs, keeping new rowsets");
                drop(components);
                for rowset in inputs {
                    rowset.mark_obsolete();
                }
            }
        }
    }

    fn discard_outputs(outputs: &[Arc<dyn RowSet>]) {
        for output in outputs {
            output.mark_obsolete();
        }
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    fn run_compaction_hook(
        &self,
        f: impl FnOnce(&dyn super::CompactionFaultHooks) -> Result<()>,
    ) -> Result<()> {
        let hooks = self.compaction_hooks.read().clone();
        match hooks {
            Some(h) => f(h.as_ref()),
            None => Ok(()),
        }
    }

    fn run_flush_hook(&self, f: impl FnOnce(&dyn super::FlushFaultHooks) -> Result<()>) -> Result<()> {
        let hooks = self.flush_hooks.read().clone();
        match hooks {
            Some(h) => f(h.as_ref()),
            None => Ok(()),
        }
    }

    fn run_common_hook(
        &self,
        f: impl FnOnce(&dyn super::FlushCompactCommonHooks) -> Result<()>,
    ) -> Result<()> {
        let hooks = self.common_hooks.read().clone();
        match hooks {
            Some(h) => f(h.as_ref()),
            None => Ok(()),
        }
    }
}

fn ranges_overlap(a: &(Vec<u8>, Vec<u8>), b: &(Vec<u8>, Vec<u8>)) -> bool {
    a.0 <= b.1 && b.0 <= a.1
}

fn widen_range(
    range: Option<(Vec<u8>, Vec<u8>)>,
    bounds: Option<(Vec<u8>, Vec<u8>)>,
) -> Option<(Vec<u8>, Vec<u8>)> {
    match (range, bounds) {
        (Some((lo, hi)), Some((blo, bhi))) => Some((lo.min(blo), hi.max(bhi))),
        (range, None) => range,
        (None, bounds) => bounds,
    }
}

/// Newest rowset in `rowsets` holding `key`
fn find_row_owner<'a>(rowsets: &'a [Arc<dyn RowSet>], key: &[u8]) -> Result<Option<&'a Arc<dyn RowSet>>> {
    for rowset in rowsets.iter().rev() {
        if rowset.check_row_present(key)? {
            return Ok(Some(rowset));
        }
    }
    Ok(None)
}
