//! MemRowSet Module
//!
//! In-memory store that absorbs every insert until the next flush.
//!
//! ## Responsibilities
//! - Sorted, concurrent inserts and updates of recent rows
//! - MVCC-tagged versions: each row keeps its insert timestamp and every
//!   mutation applied to it, so readers at any snapshot see the right state
//! - Track memory footprint for flush decisions
//!
//! ## Data Structure Choice
//! BTreeMap keyed by encoded key, wrapped in a parking_lot RwLock:
//! - Ordered keys (required for flush and merged scans)
//! - Rows are `Bytes`, so iterators materialize without deep copies

mod table;

pub use table::MemRowSet;
