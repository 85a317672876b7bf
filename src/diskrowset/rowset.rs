//! DiskRowSet
//!
//! Base data plus delta store for one `rowset_{index}` directory.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::delta::DeltaStore;
use super::iterator::{CompactionRows, DiskRowSetIterator};
use super::reader::BaseReader;
use super::{BASE_FILENAME, DELTA_FILENAME};
use crate::config::DeltaSyncStrategy;
use crate::error::{Result, TabletError};
use crate::iterator::RowwiseIterator;
use crate::mvcc::{MvccSnapshot, Timestamp};
use crate::rowset::{CompactionInput, KeyedMutation, Mutation, RowSet};
use crate::schema::{Projection, RowChangeList, Schema};

pub struct DiskRowSet {
    index: u64,
    dir: PathBuf,
    schema: Schema,
    base: BaseReader,
    deltas: DeltaStore,
    /// Selection flag held while this rowset is being compacted
    in_compaction: AtomicBool,
    /// Set once replaced; the directory is removed when the last handle drops
    obsolete: AtomicBool,
}

impl DiskRowSet {
    /// Open the rowset stored in `dir`
    pub fn open(dir: &Path, index: u64, schema: Schema, delta_sync: DeltaSyncStrategy) -> Result<Self> {
        let base = BaseReader::open(&dir.join(BASE_FILENAME))?;
        let deltas = DeltaStore::open(&dir.join(DELTA_FILENAME), delta_sync)?;

        debug!(
            index,
            rows = base.entry_count(),
            deltas = deltas.num_mutations(),
            "Opened DiskRowSet"
        );

        Ok(Self {
            index,
            dir: dir.to_path_buf(),
            schema,
            base,
            deltas,
            in_compaction: AtomicBool::new(false),
            obsolete: AtomicBool::new(false),
        })
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Number of rows in the base data, deleted or not
    pub fn base_row_count(&self) -> u64 {
        self.base.entry_count()
    }

    pub fn num_deltas(&self) -> usize {
        self.deltas.num_mutations()
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    /// Largest timestamp stored in this rowset, base rows and deltas alike
    pub fn max_timestamp(&self) -> Timestamp {
        let base = Timestamp(self.base.max_insert_ts());
        self.deltas.max_timestamp().map_or(base, |d| d.max(base))
    }

    /// fsync the delta log
    pub fn flush_deltas(&self) -> Result<()> {
        self.deltas.sync()
    }

    pub(crate) fn base(&self) -> &BaseReader {
        &self.base
    }

    pub(crate) fn deltas(&self) -> &DeltaStore {
        &self.deltas
    }
}

impl fmt::Debug for DiskRowSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskRowSet")
            .field("index", &self.index)
            .field("base", &self.base.path())
            .field("deltas", &self.deltas.path())
            .field("rows", &self.base.entry_count())
            .finish()
    }
}

impl RowSet for DiskRowSet {
    fn describe(&self) -> String {
        format!("DiskRowSet({})", self.index)
    }

    fn check_row_present(&self, key: &[u8]) -> Result<bool> {
        Ok(self.base.contains(key))
    }

    fn mutate_row(&self, ts: Timestamp, key: &[u8], change: &RowChangeList) -> Result<()> {
        if !self.base.contains(key) {
            return Err(TabletError::KeyNotFound);
        }
        let mutation = Mutation {
            ts,
            change: change.clone(),
        };
        self.deltas.apply(key, &mutation, true)
    }

    fn reapply_mutation(&self, key: &[u8], mutation: &Mutation) -> Result<()> {
        if !self.base.contains(key) {
            return Err(TabletError::KeyNotFound);
        }
        self.deltas.apply(key, mutation, false)
    }

    fn collect_mutations(
        &self,
        filter: &dyn Fn(Timestamp) -> bool,
    ) -> Result<Vec<KeyedMutation>> {
        Ok(self.deltas.collect(filter))
    }

    fn new_row_iterator(
        self: Arc<Self>,
        projection: &Schema,
        snap: &MvccSnapshot,
    ) -> Result<Box<dyn RowwiseIterator>> {
        let projection = Projection::new(&self.schema, projection)?;
        Ok(Box::new(DiskRowSetIterator::new(self, projection, snap.clone())))
    }

    fn new_compaction_input(
        self: Arc<Self>,
        snap: &MvccSnapshot,
        ancient: Timestamp,
    ) -> Result<CompactionInput> {
        Ok(Box::new(CompactionRows::open(self, snap.clone(), ancient)?))
    }

    fn count_rows(&self) -> Result<u64> {
        Ok(self.base.entry_count() - self.deltas.deleted_count()?)
    }

    fn estimate_size(&self) -> u64 {
        self.base.file_size() + self.deltas.estimate_size()
    }

    fn durable_indices(&self) -> Vec<u64> {
        vec![self.index]
    }

    fn compaction_flag(&self) -> Option<&AtomicBool> {
        Some(&self.in_compaction)
    }

    fn key_bounds(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        Some((self.base.min_key()?.to_vec(), self.base.max_key()?.to_vec()))
    }

    fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }
}

impl Drop for DiskRowSet {
    fn drop(&mut self) {
        if !self.is_obsolete() {
            return;
        }
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => info!(index = self.index, "Removed obsolete DiskRowSet"),
            Err(e) => warn!(index = self.index, error = %e, "Failed to remove obsolete DiskRowSet"),
        }
    }
}
