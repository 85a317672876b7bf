//! RowSet Module
//!
//! The capability every row container in a tablet provides, whether it is
//! the in-memory MemRowSet, an on-disk DiskRowSet, or the transient
//! DuplicatingRowSet installed while a flush/compaction swaps storage.
//!
//! ## Responsibilities
//! - Containment test for a key (used for duplicate checks and update routing)
//! - Timestamped mutation of rows it owns
//! - Uninitialized row iterators filtered by a projection and MVCC snapshot
//! - Inputs for flush/compaction, and delta bookkeeping for the swap protocol
//!
//! Keys passed to a RowSet are always memcomparable encoded keys
//! (`Schema::encode_key`).

mod compaction;
mod duplicating;

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::error::Result;
use crate::iterator::RowwiseIterator;
use crate::mvcc::{MvccSnapshot, Timestamp};
use crate::schema::{RowChange, RowChangeList, Schema};

pub use compaction::{CompactionLock, RowSetsInCompaction};
pub use duplicating::DuplicatingRowSet;

/// A timestamped change applied to a stored row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub ts: Timestamp,
    pub change: RowChangeList,
}

/// A mutation together with the encoded key it targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedMutation {
    pub key: Vec<u8>,
    pub mutation: Mutation,
}

/// A row as written by a flush or compaction: the base image with the
/// folded history applied, plus the committed mutations some live snapshot
/// may still not see
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionRow {
    pub key: Vec<u8>,
    pub insert_ts: Timestamp,
    pub row: Vec<u8>,
    /// Timestamp order
    pub redo: Vec<Mutation>,
}

/// Key-ordered stream of rows feeding a flush or compaction
pub type CompactionInput = Box<dyn Iterator<Item = Result<CompactionRow>> + Send>;

/// Shared capability of all row containers
pub trait RowSet: Send + Sync + fmt::Debug {
    /// Short name for logs, e.g. `DiskRowSet(3)`
    fn describe(&self) -> String;

    /// Whether a row with this key is stored here, deleted or not
    fn check_row_present(&self, key: &[u8]) -> Result<bool>;

    /// Apply `change` at `ts` to the live row with this key.
    /// `KeyNotFound` if absent or deleted.
    fn mutate_row(&self, ts: Timestamp, key: &[u8], change: &RowChangeList) -> Result<()>;

    /// Re-apply a mutation recorded elsewhere, without the live-row check.
    /// Used to carry deltas between stores during a swap.
    fn reapply_mutation(&self, key: &[u8], mutation: &Mutation) -> Result<()>;

    /// Every stored mutation whose timestamp satisfies `filter`
    fn collect_mutations(&self, filter: &dyn Fn(Timestamp) -> bool)
        -> Result<Vec<KeyedMutation>>;

    /// Uninitialized iterator over rows visible in `snap`, projected
    fn new_row_iterator(
        self: Arc<Self>,
        projection: &Schema,
        snap: &MvccSnapshot,
    ) -> Result<Box<dyn RowwiseIterator>>;

    /// Rows as of `snap`. Mutations below `ancient` are folded into the
    /// row and rows deleted below it are omitted; later mutations committed
    /// in `snap` are carried in `CompactionRow::redo`.
    fn new_compaction_input(
        self: Arc<Self>,
        snap: &MvccSnapshot,
        ancient: Timestamp,
    ) -> Result<CompactionInput>;

    /// Live (not deleted) rows, as of the latest applied mutations
    fn count_rows(&self) -> Result<u64>;

    /// Approximate bytes held, for compaction sizing
    fn estimate_size(&self) -> u64;

    /// DiskRowSet indices whose on-disk state backs this rowset
    fn durable_indices(&self) -> Vec<u64>;

    /// Selection flag, or `None` if this rowset may never be compacted
    fn compaction_flag(&self) -> Option<&AtomicBool>;

    /// Encoded (min, max) key held, if any rows are stored
    fn key_bounds(&self) -> Option<(Vec<u8>, Vec<u8>)>;

    /// Release backing storage once the last handle drops
    fn mark_obsolete(&self) {}
}

/// Identity comparison of rowset handles (data pointer only)
pub fn same_rowset(a: &Arc<dyn RowSet>, b: &Arc<dyn RowSet>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Fold the mutations committed in `snap` into `base`, in timestamp order.
/// Returns `None` if a visible mutation deletes the row.
pub(crate) fn apply_mutations(
    schema: &Schema,
    base: &[u8],
    mutations: &[Mutation],
    snap: &MvccSnapshot,
) -> Result<Option<Vec<u8>>> {
    let mut visible: Vec<&Mutation> = mutations
        .iter()
        .filter(|m| snap.is_committed(m.ts))
        .collect();
    visible.sort_by_key(|m| m.ts);

    let mut row = base.to_vec();
    for mutation in visible {
        match mutation.change.decode()? {
            RowChange::Delete => return Ok(None),
            change => change.apply_to(schema, &mut row)?,
        }
    }
    Ok(Some(row))
}

/// Split the mutations committed in `snap` at `ancient`: fold the older
/// ones into `base`, carry the rest as redo mutations.
/// Returns `None` if a folded mutation deletes the row.
pub(crate) fn fold_history(
    schema: &Schema,
    key: &[u8],
    insert_ts: Timestamp,
    base: &[u8],
    mutations: &[Mutation],
    snap: &MvccSnapshot,
    ancient: Timestamp,
) -> Result<Option<CompactionRow>> {
    let mut committed: Vec<&Mutation> = mutations
        .iter()
        .filter(|m| snap.is_committed(m.ts))
        .collect();
    committed.sort_by_key(|m| m.ts);

    let mut row = base.to_vec();
    let mut redo = Vec::new();
    for mutation in committed {
        if mutation.ts >= ancient {
            redo.push(mutation.clone());
            continue;
        }
        match mutation.change.decode()? {
            RowChange::Delete => return Ok(None),
            change => change.apply_to(schema, &mut row)?,
        }
    }
    Ok(Some(CompactionRow {
        key: key.to_vec(),
        insert_ts,
        row,
        redo,
    }))
}

/// Whether the most recent mutation (by timestamp) deletes the row
pub(crate) fn is_deleted(mutations: &[Mutation]) -> Result<bool> {
    match mutations.iter().max_by_key(|m| m.ts) {
        Some(latest) => latest.change.is_delete(),
        None => Ok(false),
    }
}
