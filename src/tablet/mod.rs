//! Tablet Module
//!
//! The coordinator that ties MemRowSet, DiskRowSets and MVCC together.
//!
//! ## Responsibilities
//! - Route inserts to the active MemRowSet and updates to the owning rowset
//! - Hand out snapshot-consistent iterators without blocking writers
//! - Flush the MemRowSet and compact DiskRowSets as atomic layout swaps
//! - Persist the rowset layout so a reopened tablet sees the same rows
//!
//! ## Concurrency Model
//!
//! - **Component guard** (`components`): one reader-writer lock over the
//!   active MemRowSet and the rowset collection.
//!   - Shared: insert, update, iterator capture, compaction input capture
//!   - Exclusive: pointer swaps only (MemRowSet replacement, rowset swaps)
//! - **Writers** begin and finish their MVCC transaction while holding the
//!   shared guard, so nothing is in flight while the exclusive guard is held.
//! - **Flush lock**: at most one flush at a time. Compactions run
//!   concurrently over disjoint inputs (rowset selection flags).
//! - **Metadata lock** (`metadata`): last stored metadata. Every metadata
//!   write happens under it. Taken after the component guard, never before.

mod compaction;
mod hooks;
mod metadata;

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::TabletConfig;
use crate::diskrowset::DiskRowSet;
use crate::error::{Result, TabletError};
use crate::iterator::{MergeIterator, RowwiseIterator};
use crate::memrowset::MemRowSet;
use crate::mvcc::{MvccManager, MvccSnapshot, ScopedTransaction, Timestamp};
use crate::rowset::{same_rowset, RowSet};
use crate::schema::{Projection, RowChangeList, Schema};

pub use hooks::{CompactionFaultHooks, FlushCompactCommonHooks, FlushFaultHooks};

use metadata::{remove_stale_tmp_files, StagedMetadata, TabletMetadata};

/// Prefix of every DiskRowSet directory inside a tablet directory
const ROWSET_DIR_PREFIX: &str = "rowset_";

/// Directory of the DiskRowSet with the given index
pub fn get_rowset_path(tablet_dir: &Path, index: u64) -> PathBuf {
    tablet_dir.join(format!("{}{:06}", ROWSET_DIR_PREFIX, index))
}

/// Inverse of `get_rowset_path` for a directory entry name
fn parse_rowset_dir(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(ROWSET_DIR_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Everything the component guard protects
pub(crate) struct TabletComponents {
    pub(crate) memrowset: Arc<MemRowSet>,
    /// Oldest first
    pub(crate) rowsets: Vec<Arc<dyn RowSet>>,
}

/// A single tablet: a key-sorted slice of a table with MVCC reads
pub struct Tablet {
    schema: Schema,
    dir: PathBuf,
    config: TabletConfig,

    mvcc: MvccManager,

    /// Active MemRowSet and rowset collection
    components: RwLock<TabletComponents>,

    open: AtomicBool,

    /// Metadata as last stored, including the next DiskRowSet index to
    /// hand out (never reused)
    metadata: Mutex<TabletMetadata>,
    /// Suffix for staged metadata files
    staging_seq: AtomicU64,
    /// Ordinal for MemRowSets, used in logs only
    next_mrs_id: AtomicU64,

    /// Serializes flushes
    flush_lock: Mutex<()>,

    compaction_hooks: RwLock<Option<Arc<dyn CompactionFaultHooks>>>,
    flush_hooks: RwLock<Option<Arc<dyn FlushFaultHooks>>>,
    common_hooks: RwLock<Option<Arc<dyn FlushCompactCommonHooks>>>,
}

impl Tablet {
    /// Construct an unopened tablet over `dir` with default config
    pub fn new(schema: Schema, dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_config(schema, dir, TabletConfig::default())
    }

    /// Construct an unopened tablet over `dir`
    pub fn with_config(schema: Schema, dir: impl Into<PathBuf>, config: TabletConfig) -> Result<Self> {
        config.validate()?;
        if schema.num_key_columns() == 0 {
            return Err(TabletError::InvalidArgument(
                "tablet schema needs at least one key column".to_string(),
            ));
        }

        let memrowset = Arc::new(MemRowSet::new(0, schema.clone()));
        let metadata = Mutex::new(TabletMetadata::new(&schema, Vec::new(), 0));
        Ok(Self {
            schema,
            dir: dir.into(),
            config,
            mvcc: MvccManager::new(),
            components: RwLock::new(TabletComponents {
                memrowset,
                rowsets: Vec::new(),
            }),
            open: AtomicBool::new(false),
            metadata,
            staging_seq: AtomicU64::new(0),
            next_mrs_id: AtomicU64::new(1),
            flush_lock: Mutex::new(()),
            compaction_hooks: RwLock::new(None),
            flush_hooks: RwLock::new(None),
            common_hooks: RwLock::new(None),
        })
    }

    /// Read the schema from the metadata in `dir` and open the tablet
    pub fn open_existing(dir: impl Into<PathBuf>, config: TabletConfig) -> Result<Self> {
        let dir = dir.into();
        let schema = TabletMetadata::load(&dir)?.schema()?;
        let tablet = Self::with_config(schema, dir, config)?;
        tablet.open()?;
        Ok(tablet)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create the tablet directory and its initial metadata.
    ///
    /// Fails with an I/O error (`AlreadyExists`) if the directory exists.
    /// Does not open the tablet.
    pub fn create_new(&self) -> Result<()> {
        fs::create_dir(&self.dir)?;
        let meta = TabletMetadata::new(&self.schema, Vec::new(), 0);
        meta.store(&self.dir)?;
        *self.metadata.lock() = meta;
        info!(dir = %self.dir.display(), schema = %self.schema, "Created tablet");
        Ok(())
    }

    /// Open the tablet stored in `dir`
    pub fn open(&self) -> Result<()> {
        let mut components = self.components.write();
        if self.is_open() {
            return Err(TabletError::IllegalState(format!(
                "tablet {} is already open",
                self.dir.display()
            )));
        }

        let meta = TabletMetadata::load(&self.dir)?;
        let stored_schema = meta.schema()?;
        if stored_schema != self.schema {
            return Err(TabletError::InvalidArgument(format!(
                "schema mismatch: tablet has {}, caller gave {}",
                stored_schema, self.schema
            )));
        }

        let stale = remove_stale_tmp_files(&self.dir)?;
        if stale > 0 {
            warn!(count = stale, "Removed stale temporary metadata files");
        }

        // Discover rowset directories; unlisted ones are leftovers of an
        // interrupted flush/compaction
        let live: BTreeSet<u64> = meta.rowsets.iter().copied().collect();
        let mut max_seen: Option<u64> = None;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let index = match name.to_str().and_then(parse_rowset_dir) {
                Some(index) => index,
                None => continue,
            };
            max_seen = Some(max_seen.map_or(index, |m| m.max(index)));
            if !live.contains(&index) {
                warn!(index, "Removing orphaned rowset directory");
                fs::remove_dir_all(entry.path())?;
            }
        }

        let mut rowsets: Vec<Arc<dyn RowSet>> = Vec::with_capacity(meta.rowsets.len());
        let mut max_ts = Timestamp::MIN;
        for &index in &meta.rowsets {
            let path = get_rowset_path(&self.dir, index);
            let drs = DiskRowSet::open(&path, index, self.schema.clone(), self.config.delta_sync)?;
            max_ts = max_ts.max(drs.max_timestamp());
            rowsets.push(Arc::new(drs));
        }
        // Versions on disk predate every transaction of this process
        self.mvcc.advance_past(max_ts);

        let next_idx = match max_seen {
            Some(max) => meta.next_rowset_idx.max(max + 1),
            None => meta.next_rowset_idx,
        };
        *self.metadata.lock() = TabletMetadata::new(&self.schema, meta.rowsets.clone(), next_idx);

        components.rowsets = rowsets;
        components.memrowset = Arc::new(MemRowSet::new(self.allocate_mrs_id(), self.schema.clone()));
        self.open.store(true, Ordering::Release);

        info!(
            dir = %self.dir.display(),
            rowsets = components.rowsets.len(),
            next_rowset_idx = next_idx,
            "Opened tablet"
        );
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TabletError::IllegalState(format!(
                "tablet {} is not open",
                self.dir.display()
            )))
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert a new row. `AlreadyPresent` if any rowset holds its key.
    pub fn insert(&self, row: &[u8]) -> Result<()> {
        self.check_open()?;
        self.schema.validate_row(row)?;
        let key = self.schema.encode_key(row)?;

        let components = self.components.read();
        let tx = ScopedTransaction::new(&self.mvcc);

        for rowset in components.rowsets.iter().rev() {
            if rowset.check_row_present(&key)? {
                return Err(TabletError::AlreadyPresent);
            }
        }
        components.memrowset.insert(tx.timestamp(), key, row)?;
        tx.commit()
    }

    /// Apply `change` to the row whose key prefix is `key`.
    /// `KeyNotFound` if no live row has that key.
    pub fn update_row(&self, key: &[u8], change: &RowChangeList) -> Result<()> {
        self.check_open()?;
        change.validate(&self.schema)?;
        let key = self.schema.encode_key(key)?;

        let components = self.components.read();
        let tx = ScopedTransaction::new(&self.mvcc);

        let owner = Self::find_owner(&components, &key)?.ok_or(TabletError::KeyNotFound)?;
        owner.mutate_row(tx.timestamp(), &key, change)?;
        tx.commit()
    }

    /// Delete the row whose key prefix is `key`
    pub fn delete_row(&self, key: &[u8]) -> Result<()> {
        self.update_row(key, &RowChangeList::delete()?)
    }

    /// Rowset holding `key`: the MemRowSet first, then rowsets newest first
    fn find_owner(components: &TabletComponents, key: &[u8]) -> Result<Option<Arc<dyn RowSet>>> {
        if components.memrowset.check_row_present(key)? {
            let mrs: Arc<dyn RowSet> = components.memrowset.clone();
            return Ok(Some(mrs));
        }
        for rowset in components.rowsets.iter().rev() {
            if rowset.check_row_present(key)? {
                return Ok(Some(Arc::clone(rowset)));
            }
        }
        Ok(None)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Uninitialized iterator over every row visible now
    pub fn new_row_iterator(&self, projection: &Schema) -> Result<Box<dyn RowwiseIterator>> {
        self.new_row_iterator_inner(projection, None)
    }

    /// Uninitialized iterator over every row visible in `snap`
    pub fn new_row_iterator_with_snapshot(
        &self,
        projection: &Schema,
        snap: &MvccSnapshot,
    ) -> Result<Box<dyn RowwiseIterator>> {
        self.new_row_iterator_inner(projection, Some(snap))
    }

    fn new_row_iterator_inner(
        &self,
        projection: &Schema,
        snap: Option<&MvccSnapshot>,
    ) -> Result<Box<dyn RowwiseIterator>> {
        self.check_open()?;
        Projection::new(&self.schema, projection)?;
        let sources = self.capture_consistent_iterators(projection, snap)?;
        Ok(Box::new(MergeIterator::new(projection.clone(), sources)))
    }

    /// One iterator per rowset plus the MemRowSet, all captured under one
    /// shared guard. The snapshot (if not given) is taken at capture time.
    fn capture_consistent_iterators(
        &self,
        projection: &Schema,
        snap: Option<&MvccSnapshot>,
    ) -> Result<Vec<Box<dyn RowwiseIterator>>> {
        let components = self.components.read();
        let snap = match snap {
            Some(snap) => snap.clone(),
            None => self.mvcc.take_snapshot(),
        };

        let mut iters = Vec::with_capacity(components.rowsets.len() + 1);
        for rowset in &components.rowsets {
            iters.push(Arc::clone(rowset).new_row_iterator(projection, &snap)?);
        }
        let mrs: Arc<dyn RowSet> = components.memrowset.clone();
        iters.push(mrs.new_row_iterator(projection, &snap)?);
        Ok(iters)
    }

    // =========================================================================
    // Layout swaps
    // =========================================================================

    /// Replace `old` (all of it) with `new` in the rowset collection.
    ///
    /// Rewrites the tablet metadata when the durable layout changes; if that
    /// write fails nothing is swapped. Returns a snapshot taken under the
    /// exclusive guard.
    pub fn atomic_swap_rowsets(
        &self,
        old: &[Arc<dyn RowSet>],
        new: &[Arc<dyn RowSet>],
    ) -> Result<MvccSnapshot> {
        self.swap_rowsets_checked(old, new, || Ok(()))
    }

    /// `atomic_swap_rowsets`, aborted if `precondition` fails under the
    /// exclusive guard.
    ///
    /// The new metadata is written and synced before the guard is taken;
    /// under it only the rename happens, unless the layout or the next
    /// index moved in the meantime.
    pub(crate) fn swap_rowsets_checked(
        &self,
        old: &[Arc<dyn RowSet>],
        new: &[Arc<dyn RowSet>],
        precondition: impl FnOnce() -> Result<()>,
    ) -> Result<MvccSnapshot> {
        let staged = self.stage_layout(old, new)?;
        let mut components = self.components.write();
        precondition()?;
        self.swap_locked_with(&mut components, old, new, staged)?;
        Ok(self.mvcc.take_snapshot())
    }

    /// Metadata for the layout after swapping `old` for `new`, staged on
    /// disk. None if the durable layout would not change.
    fn stage_layout(&self, old: &[Arc<dyn RowSet>], new: &[Arc<dyn RowSet>]) -> Result<Option<StagedMetadata>> {
        let (before, after) = {
            let components = self.components.read();
            let kept = components.rowsets.iter().filter(|r| !old.iter().any(|o| same_rowset(r, o)));
            (
                durable_layout(components.rowsets.iter()),
                durable_layout(kept.chain(new.iter())),
            )
        };
        if before == after {
            return Ok(None);
        }
        let next = self.metadata.lock().next_rowset_idx;
        let seq = self.staging_seq.fetch_add(1, Ordering::Relaxed);
        TabletMetadata::new(&self.schema, after, next)
            .stage(&self.dir, seq)
            .map(Some)
    }

    /// Swap with the exclusive guard already held
    fn swap_locked(
        &self,
        components: &mut TabletComponents,
        old: &[Arc<dyn RowSet>],
        new: &[Arc<dyn RowSet>],
    ) -> Result<()> {
        self.swap_locked_with(components, old, new, None)
    }

    fn swap_locked_with(
        &self,
        components: &mut TabletComponents,
        old: &[Arc<dyn RowSet>],
        new: &[Arc<dyn RowSet>],
        staged: Option<StagedMetadata>,
    ) -> Result<()> {
        for rs in old {
            if !components.rowsets.iter().any(|r| same_rowset(r, rs)) {
                return Err(TabletError::IllegalState(format!(
                    "{} is not part of the tablet",
                    rs.describe()
                )));
            }
        }

        let mut rowsets: Vec<Arc<dyn RowSet>> = components
            .rowsets
            .iter()
            .filter(|r| !old.iter().any(|o| same_rowset(r, o)))
            .cloned()
            .collect();
        rowsets.extend(new.iter().cloned());
        // Oldest first: DiskRowSets by index, in-memory rowsets last
        rowsets.sort_by_key(|r| r.durable_indices().into_iter().min().unwrap_or(u64::MAX));

        let before = durable_layout(components.rowsets.iter());
        let after = durable_layout(rowsets.iter());
        if before != after {
            let mut meta = self.metadata.lock();
            let wanted = TabletMetadata::new(&self.schema, after, meta.next_rowset_idx);
            match staged {
                Some(staged) if *staged.metadata() == wanted => staged.commit(&self.dir)?,
                _ => wanted.store(&self.dir)?,
            }
            *meta = wanted;
        }

        debug!(
            removed = old.len(),
            added = new.len(),
            rowsets = rowsets.len(),
            "Swapped rowsets"
        );
        components.rowsets = rowsets;
        Ok(())
    }

    /// Hand out the next DiskRowSet index. The metadata records it as used
    /// before the caller can create its directory.
    pub(crate) fn allocate_rowset_index(&self) -> Result<u64> {
        let mut meta = self.metadata.lock();
        let index = meta.next_rowset_idx;
        let mut reserved = meta.clone();
        reserved.next_rowset_idx = index + 1;
        reserved.store(&self.dir)?;
        *meta = reserved;
        Ok(index)
    }

    fn allocate_mrs_id(&self) -> u64 {
        self.next_mrs_id.fetch_add(1, Ordering::Relaxed)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &TabletConfig {
        &self.config
    }

    pub fn mvcc_manager(&self) -> &MvccManager {
        &self.mvcc
    }

    /// Footprint of the active MemRowSet, in bytes
    pub fn memrowset_size(&self) -> usize {
        self.components.read().memrowset.memory_footprint()
    }

    /// Number of rowsets, excluding the active MemRowSet
    pub fn num_rowsets(&self) -> usize {
        self.components.read().rowsets.len()
    }

    /// Live rows across all stores (not snapshot-consistent)
    pub fn count_rows(&self) -> Result<u64> {
        let components = self.components.read();
        let mut total = components.memrowset.count_rows()?;
        for rowset in &components.rowsets {
            total += rowset.count_rows()?;
        }
        Ok(total)
    }

    /// Whether the MemRowSet has reached the configured flush threshold
    pub fn needs_flush(&self) -> bool {
        self.memrowset_size() >= self.config.memrowset_flush_threshold
    }

    /// Short description of every rowset, oldest first
    pub fn describe_rowsets(&self) -> Vec<String> {
        self.components
            .read()
            .rowsets
            .iter()
            .map(|r| r.describe())
            .collect()
    }

    // =========================================================================
    // Fault hooks (tests)
    // =========================================================================

    pub fn set_compaction_hooks_for_tests(&self, hooks: Arc<dyn CompactionFaultHooks>) {
        *self.compaction_hooks.write() = Some(hooks);
    }

    pub fn set_flush_hooks_for_tests(&self, hooks: Arc<dyn FlushFaultHooks>) {
        *self.flush_hooks.write() = Some(hooks);
    }

    pub fn set_flush_compact_common_hooks_for_tests(&self, hooks: Arc<dyn FlushCompactCommonHooks>) {
        *self.common_hooks.write() = Some(hooks);
    }
}

/// Sorted durable indices of `rowsets`
fn durable_layout<'a>(rowsets: impl Iterator<Item = &'a Arc<dyn RowSet>>) -> Vec<u64> {
    let mut indices: Vec<u64> = rowsets.flat_map(|r| r.durable_indices()).collect();
    indices.sort_unstable();
    indices
}

impl std::fmt::Debug for Tablet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tablet")
            .field("dir", &self.dir)
            .field("open", &self.is_open())
            .field("rowsets", &self.num_rowsets())
            .finish()
    }
}
