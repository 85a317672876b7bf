//! DiskRowSet Module
//!
//! Immutable sorted run of rows on disk plus a mutable, persistent delta
//! store for updates and deletes applied after the run was written.
//!
//! ## Directory Layout
//! ```text
//! {tablet_dir}/rowset_{index:06}/
//!   ├── base.data     (immutable base rows, written once by flush/compaction)
//!   └── deltas.log    (append-only log of post-write mutations)
//! ```
//!
//! ## Base File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (14 bytes)                                            │
//! │   Magic: "TBDR" (4) | Version: u16 (2) | Count: u64 (8)      │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Data Block (variable)                                        │
//! │   [KeyLen: u32][RowLen: u32][InsertTs: u64][Key][Row]        │
//! │   ... repeated for each row, in encoded-key order ...        │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Index Block (variable)                                       │
//! │   [KeyLen: u32][Offset: u64][Key]                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Bloom Block (variable)                                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Footer (32 bytes)                                            │
//! │   IndexOffset: u64 | BloomOffset: u64 | MaxInsertTs: u64     │
//! │   DataCRC: u32 | Pad(4)                                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod bloom;
mod builder;
mod delta;
mod iterator;
mod reader;
mod rowset;

use std::path::PathBuf;

pub use builder::DiskRowSetWriter;
pub use rowset::DiskRowSet;

// =============================================================================
// Shared Constants (used by builder, reader, iterator)
// =============================================================================

/// Magic bytes identifying a base data file
pub(crate) const MAGIC: &[u8; 4] = b"TBDR";

/// Current base file format version
pub(crate) const VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + EntryCount (8) = 14 bytes
pub(crate) const HEADER_SIZE: u64 = 14;

/// Footer size: IndexOffset (8) + BloomOffset (8) + MaxInsertTs (8) +
/// DataCRC (4) + Padding (4)
pub(crate) const FOOTER_SIZE: u64 = 32;

/// Per-row header: KeyLen (4) + RowLen (4) + InsertTs (8)
pub(crate) const ENTRY_HEADER_SIZE: u64 = 16;

pub(crate) const BASE_FILENAME: &str = "base.data";
pub(crate) const DELTA_FILENAME: &str = "deltas.log";

// =============================================================================
// DiskRowSet Metadata
// =============================================================================

/// Summary of a freshly written DiskRowSet
#[derive(Debug, Clone)]
pub struct DiskRowSetMeta {
    /// Never-reused rowset index
    pub index: u64,
    /// Rowset directory
    pub dir: PathBuf,
    /// Number of base rows
    pub entry_count: u64,
    /// Smallest encoded key
    pub min_key: Vec<u8>,
    /// Largest encoded key
    pub max_key: Vec<u8>,
    /// Base file size in bytes
    pub file_size: u64,
}
