//! MemRowSet implementation
//!
//! BTreeMap-based row store with RwLock for concurrency.

use std::collections::BTreeMap;
use std::fmt;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::{Result, TabletError};
use crate::iterator::{IteratedRow, MaterializedIterator, RowwiseIterator};
use crate::mvcc::{MvccSnapshot, Timestamp};
use crate::rowset::{
    apply_mutations, fold_history, is_deleted, CompactionInput, KeyedMutation, Mutation, RowSet,
};
use crate::schema::{Projection, RowChangeList, Schema};

/// One stored row: its insert version plus every mutation applied since
#[derive(Debug, Clone)]
struct MrsEntry {
    insert_ts: Timestamp,
    row: Bytes,
    mutations: Vec<Mutation>,
}

const ENTRY_OVERHEAD: usize = size_of::<MrsEntry>();
const MUTATION_OVERHEAD: usize = size_of::<Mutation>();

/// In-memory, sorted, mutable row store
pub struct MemRowSet {
    /// Ordinal for logging; not persisted
    id: u64,
    schema: Schema,
    /// Encoded key → entry
    rows: RwLock<BTreeMap<Vec<u8>, MrsEntry>>,
    /// Approximate size in bytes
    footprint: AtomicUsize,
    /// Selection flag held while this MemRowSet is being flushed
    in_compaction: AtomicBool,
}

impl MemRowSet {
    /// Create a new empty MemRowSet
    pub fn new(id: u64, schema: Schema) -> Self {
        Self {
            id,
            schema,
            rows: RwLock::new(BTreeMap::new()),
            footprint: AtomicUsize::new(0),
            in_compaction: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Insert a row under its encoded key at `ts` (write lock).
    ///
    /// Returns `AlreadyPresent` if the key is stored here, deleted or not.
    pub fn insert(&self, ts: Timestamp, key: Vec<u8>, row: &[u8]) -> Result<()> {
        self.schema.validate_row(row)?;
        let added = ENTRY_OVERHEAD + key.len() + row.len();

        let mut rows = self.rows.write();
        if rows.contains_key(&key) {
            return Err(TabletError::AlreadyPresent);
        }
        rows.insert(
            key,
            MrsEntry {
                insert_ts: ts,
                row: Bytes::copy_from_slice(row),
                mutations: Vec::new(),
            },
        );
        self.footprint.fetch_add(added, Ordering::Relaxed);
        Ok(())
    }

    /// Approximate memory held, in bytes
    pub fn memory_footprint(&self) -> usize {
        self.footprint.load(Ordering::Relaxed)
    }

    /// Number of stored rows, including deleted ones
    pub fn entry_count(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Copy every row of `other` into this MemRowSet. Used to fold a
    /// replacement MemRowSet back into the one it replaced when a flush is
    /// rolled back; the two never share a key.
    pub fn absorb(&self, other: &MemRowSet) -> Result<usize> {
        let theirs = other.rows.read();
        let mut ours = self.rows.write();
        if let Some(key) = theirs.keys().find(|k| ours.contains_key(*k)) {
            return Err(TabletError::IllegalState(format!(
                "{} and {} both hold key {:?}",
                self.describe(),
                other.describe(),
                key
            )));
        }
        for (key, entry) in theirs.iter() {
            ours.insert(key.clone(), entry.clone());
        }
        self.footprint
            .fetch_add(other.memory_footprint(), Ordering::Relaxed);
        Ok(theirs.len())
    }

    fn visible_rows(&self, projection: &Projection, snap: &MvccSnapshot) -> Result<Vec<IteratedRow>> {
        let rows = self.rows.read();
        let mut out = Vec::with_capacity(rows.len());
        for (key, entry) in rows.iter() {
            if !snap.is_committed(entry.insert_ts) {
                continue;
            }
            if let Some(row) = apply_mutations(&self.schema, &entry.row, &entry.mutations, snap)? {
                out.push(IteratedRow {
                    key: key.clone(),
                    row: projection.project(&row),
                });
            }
        }
        Ok(out)
    }
}

impl fmt::Debug for MemRowSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemRowSet")
            .field("id", &self.id)
            .field("entries", &self.entry_count())
            .field("footprint", &self.memory_footprint())
            .finish()
    }
}

impl RowSet for MemRowSet {
    fn describe(&self) -> String {
        format!("MemRowSet({})", self.id)
    }

    fn check_row_present(&self, key: &[u8]) -> Result<bool> {
        Ok(self.rows.read().contains_key(key))
    }

    fn mutate_row(&self, ts: Timestamp, key: &[u8], change: &RowChangeList) -> Result<()> {
        let mut rows = self.rows.write();
        let entry = rows.get_mut(key).ok_or(TabletError::KeyNotFound)?;
        if is_deleted(&entry.mutations)? {
            return Err(TabletError::KeyNotFound);
        }
        entry.mutations.push(Mutation {
            ts,
            change: change.clone(),
        });
        self.footprint
            .fetch_add(MUTATION_OVERHEAD + change.len(), Ordering::Relaxed);
        Ok(())
    }

    fn reapply_mutation(&self, key: &[u8], mutation: &Mutation) -> Result<()> {
        let mut rows = self.rows.write();
        let entry = rows.get_mut(key).ok_or(TabletError::KeyNotFound)?;
        entry.mutations.push(mutation.clone());
        self.footprint
            .fetch_add(MUTATION_OVERHEAD + mutation.change.len(), Ordering::Relaxed);
        Ok(())
    }

    fn collect_mutations(
        &self,
        filter: &dyn Fn(Timestamp) -> bool,
    ) -> Result<Vec<KeyedMutation>> {
        let rows = self.rows.read();
        let mut out = Vec::new();
        for (key, entry) in rows.iter() {
            for mutation in entry.mutations.iter().filter(|m| filter(m.ts)) {
                out.push(KeyedMutation {
                    key: key.clone(),
                    mutation: mutation.clone(),
                });
            }
        }
        Ok(out)
    }

    fn new_row_iterator(
        self: Arc<Self>,
        projection: &Schema,
        snap: &MvccSnapshot,
    ) -> Result<Box<dyn RowwiseIterator>> {
        let projection = Projection::new(&self.schema, projection)?;
        let schema = projection.schema().clone();
        let snap = snap.clone();
        Ok(Box::new(MaterializedIterator::new(schema, move || {
            self.visible_rows(&projection, &snap)
        })))
    }

    fn new_compaction_input(
        self: Arc<Self>,
        snap: &MvccSnapshot,
        ancient: Timestamp,
    ) -> Result<CompactionInput> {
        let rows = self.rows.read();
        let mut out = Vec::with_capacity(rows.len());
        for (key, entry) in rows.iter() {
            if !snap.is_committed(entry.insert_ts) {
                return Err(TabletError::IllegalState(format!(
                    "{}: insert at {} not committed in flush snapshot",
                    self.describe(),
                    entry.insert_ts
                )));
            }
            let folded = fold_history(
                &self.schema,
                key,
                entry.insert_ts,
                &entry.row,
                &entry.mutations,
                snap,
                ancient,
            )?;
            out.extend(folded);
        }
        Ok(Box::new(out.into_iter().map(Ok)))
    }

    fn count_rows(&self) -> Result<u64> {
        let rows = self.rows.read();
        let mut live = 0;
        for entry in rows.values() {
            if !is_deleted(&entry.mutations)? {
                live += 1;
            }
        }
        Ok(live)
    }

    fn estimate_size(&self) -> u64 {
        self.memory_footprint() as u64
    }

    fn durable_indices(&self) -> Vec<u64> {
        Vec::new()
    }

    fn compaction_flag(&self) -> Option<&AtomicBool> {
        Some(&self.in_compaction)
    }

    fn key_bounds(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let rows = self.rows.read();
        let min = rows.keys().next()?.clone();
        let max = rows.keys().next_back()?.clone();
        Some((min, max))
    }
}
