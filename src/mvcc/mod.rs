//! MVCC Module
//!
//! Multi-version concurrency control for a single tablet.
//!
//! ## Responsibilities
//! - Issue strictly increasing write timestamps
//! - Track which timestamps are in flight / committed
//! - Produce immutable snapshots that decide row-version visibility
//!
//! ## Visibility
//! ```text
//!   0 ─────────── all_committed_before ──── in flight ──── none_committed_at_or_after ──►
//!   │ committed   │  committed unless listed in `in_flight` │ not committed
//! ```
//! Every stored row version and delta carries the timestamp of the
//! transaction that wrote it. A reader holding a snapshot sees a version iff
//! the snapshot says its timestamp is committed.

mod manager;
mod snapshot;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use manager::{MvccManager, ScopedTransaction};
pub use snapshot::MvccSnapshot;

/// Transaction timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
