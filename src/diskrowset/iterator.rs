//! DiskRowSet iterators
//!
//! Both the row iterator and the compaction input stream the base file and
//! merge in a copy of the deltas taken when iteration starts.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::reader::BaseScanner;
use super::rowset::DiskRowSet;
use crate::error::{Result, TabletError};
use crate::iterator::{IteratedRow, RowwiseIterator};
use crate::mvcc::{MvccSnapshot, Timestamp};
use crate::rowset::{apply_mutations, fold_history, CompactionRow, Mutation};
use crate::schema::{Projection, Schema};

/// Base rows visible in a snapshot, with committed deltas folded in
pub(crate) struct VisibleRows {
    rowset: Arc<DiskRowSet>,
    scanner: BaseScanner,
    deltas: BTreeMap<Vec<u8>, Vec<Mutation>>,
    snap: MvccSnapshot,
}

impl VisibleRows {
    pub(crate) fn open(rowset: Arc<DiskRowSet>, snap: MvccSnapshot) -> Result<Self> {
        let scanner = rowset.base().scan()?;
        let deltas = rowset.deltas().snapshot(|ts| snap.is_committed(ts));
        Ok(Self {
            rowset,
            scanner,
            deltas,
            snap,
        })
    }

    fn next_visible(&mut self) -> Result<Option<IteratedRow>> {
        while let Some(entry) = self.scanner.next() {
            let (key, insert_ts, base) = entry?;
            if !self.snap.is_committed(Timestamp(insert_ts)) {
                continue;
            }
            let mutations = self.deltas.get(&key).map(Vec::as_slice).unwrap_or(&[]);
            if let Some(row) = apply_mutations(self.rowset.schema(), &base, mutations, &self.snap)? {
                return Ok(Some(IteratedRow { key, row }));
            }
        }
        Ok(None)
    }
}

/// Compaction input over one DiskRowSet: history below the ancient mark
/// folded into the base, the rest carried as redo mutations
pub(crate) struct CompactionRows {
    rowset: Arc<DiskRowSet>,
    scanner: BaseScanner,
    deltas: BTreeMap<Vec<u8>, Vec<Mutation>>,
    snap: MvccSnapshot,
    ancient: Timestamp,
}

impl CompactionRows {
    pub(crate) fn open(rowset: Arc<DiskRowSet>, snap: MvccSnapshot, ancient: Timestamp) -> Result<Self> {
        let scanner = rowset.base().scan()?;
        let deltas = rowset.deltas().snapshot(|ts| snap.is_committed(ts));
        Ok(Self {
            rowset,
            scanner,
            deltas,
            snap,
            ancient,
        })
    }

    fn next_row(&mut self) -> Result<Option<CompactionRow>> {
        while let Some(entry) = self.scanner.next() {
            let (key, insert_ts, base) = entry?;
            let insert_ts = Timestamp(insert_ts);
            if !self.snap.is_committed(insert_ts) {
                continue;
            }
            let mutations = self.deltas.get(&key).map(Vec::as_slice).unwrap_or(&[]);
            let folded = fold_history(
                self.rowset.schema(),
                &key,
                insert_ts,
                &base,
                mutations,
                &self.snap,
                self.ancient,
            )?;
            if folded.is_some() {
                return Ok(folded);
            }
        }
        Ok(None)
    }
}

impl Iterator for CompactionRows {
    type Item = Result<CompactionRow>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

/// Projected row iterator over one DiskRowSet
pub(crate) struct DiskRowSetIterator {
    rowset: Arc<DiskRowSet>,
    projection: Projection,
    snap: MvccSnapshot,
    rows: Option<VisibleRows>,
}

impl DiskRowSetIterator {
    pub(crate) fn new(rowset: Arc<DiskRowSet>, projection: Projection, snap: MvccSnapshot) -> Self {
        Self {
            rowset,
            projection,
            snap,
            rows: None,
        }
    }
}

impl RowwiseIterator for DiskRowSetIterator {
    fn init(&mut self) -> Result<()> {
        if self.rows.is_some() {
            return Err(TabletError::IllegalState(
                "iterator already initialized".to_string(),
            ));
        }
        self.rows = Some(VisibleRows::open(
            Arc::clone(&self.rowset),
            self.snap.clone(),
        )?);
        Ok(())
    }

    fn next_row(&mut self) -> Result<Option<IteratedRow>> {
        let rows = self.rows.as_mut().ok_or_else(|| {
            TabletError::IllegalState("iterator used before init".to_string())
        })?;
        Ok(rows.next_visible()?.map(|r| IteratedRow {
            row: self.projection.project(&r.row),
            key: r.key,
        }))
    }

    fn schema(&self) -> &Schema {
        self.projection.schema()
    }
}
