//! # tablet-store
//!
//! Storage core for a single tablet of a distributed table store:
//! - Primary-key sorted rows with snapshot-isolated (MVCC) reads
//! - In-memory MemRowSet for recent inserts, immutable DiskRowSets with
//!   persistent delta stores for everything older
//! - Flush and compaction as atomic, crash-safe layout swaps that never
//!   block writers for longer than a pointer swap
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Tablet                              │
//! │     insert / update_row / new_row_iterator / flush / compact │
//! └──────────┬──────────────────────┬───────────────────┬───────┘
//!            │                      │                   │
//!            ▼                      ▼                   ▼
//!   ┌─────────────────┐   ┌──────────────────┐  ┌──────────────┐
//!   │  MvccManager    │   │ Component guard  │  │   Tablet     │
//!   │ (timestamps,    │   │    (RwLock)      │  │   metadata   │
//!   │  snapshots)     │   └────────┬─────────┘  │ (commit pt.) │
//!   └─────────────────┘            │            └──────────────┘
//!                     ┌────────────┴─────────────┐
//!                     ▼                          ▼
//!             ┌──────────────┐        ┌─────────────────────┐
//!             │  MemRowSet   │        │ DiskRowSet × N      │
//!             │  (BTreeMap)  │ flush  │ base.data (bloom,   │
//!             │              ├───────►│ index) + deltas.log │
//!             └──────────────┘        └──────────┬──────────┘
//!                                                │ compact
//!                                                ▼
//!                                     ┌─────────────────────┐
//!                                     │  new DiskRowSet(s)  │
//!                                     └─────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

pub mod diskrowset;
pub mod iterator;
pub mod memrowset;
pub mod mvcc;
pub mod rowset;
pub mod schema;
pub mod tablet;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{BloomFilterSizing, CompactionPolicy, DeltaSyncStrategy, TabletConfig};
pub use error::{Result, TabletError};
pub use iterator::{IteratedRow, RowwiseIterator};
pub use mvcc::{MvccManager, MvccSnapshot, ScopedTransaction, Timestamp};
pub use rowset::{RowSet, RowSetsInCompaction};
pub use schema::{
    ColumnSchema, DataType, Projection, RowBuilder, RowChangeList, RowChangeListEncoder, Schema,
};
pub use tablet::{
    get_rowset_path, CompactionFaultHooks, FlushCompactCommonHooks, FlushFaultHooks, Tablet,
};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of tablet-store
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
