//! MVCC snapshots

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::Timestamp;

/// Live snapshots of one manager: `all_committed_before` → holders
pub(super) type SnapshotRegistry = Mutex<BTreeMap<u64, usize>>;

/// Registration of a snapshot with the manager that issued it. Dropped
/// with the last clone of the snapshot.
#[derive(Debug)]
pub(super) struct SnapshotPin {
    ts: u64,
    registry: Weak<SnapshotRegistry>,
}

impl SnapshotPin {
    pub(super) fn new(ts: u64, registry: &Arc<SnapshotRegistry>) -> Self {
        Self {
            ts,
            registry: Arc::downgrade(registry),
        }
    }
}

impl Drop for SnapshotPin {
    fn drop(&mut self) {
        let registry = match self.registry.upgrade() {
            Some(registry) => registry,
            None => return,
        };
        let mut live = registry.lock();
        if let Some(holders) = live.get_mut(&self.ts) {
            *holders -= 1;
            if *holders == 0 {
                live.remove(&self.ts);
            }
        }
    }
}

/// Immutable visibility boundary
///
/// A timestamp is committed in this snapshot iff it is below
/// `all_committed_before`, or it is below `none_committed_at_or_after` and
/// not listed in `in_flight`.
///
/// Snapshots taken from an `MvccManager` stay registered with it while any
/// clone is alive, so flush and compaction keep the history they can see.
#[derive(Debug, Clone)]
pub struct MvccSnapshot {
    all_committed_before: Timestamp,
    none_committed_at_or_after: Timestamp,
    /// Sorted ascending
    in_flight: Vec<Timestamp>,
    pin: Option<Arc<SnapshotPin>>,
}

impl MvccSnapshot {
    pub(super) fn new(
        all_committed_before: Timestamp,
        none_committed_at_or_after: Timestamp,
        in_flight: Vec<Timestamp>,
    ) -> Self {
        Self {
            all_committed_before,
            none_committed_at_or_after,
            in_flight,
            pin: None,
        }
    }

    pub(super) fn pinned(mut self, pin: SnapshotPin) -> Self {
        self.pin = Some(Arc::new(pin));
        self
    }

    /// A snapshot that considers every timestamp committed
    pub fn including_all_transactions() -> Self {
        Self::new(Timestamp::MAX, Timestamp::MAX, Vec::new())
    }

    /// A snapshot that considers no timestamp committed
    pub fn including_no_transactions() -> Self {
        Self::new(Timestamp::MIN, Timestamp::MIN, Vec::new())
    }

    pub fn is_committed(&self, ts: Timestamp) -> bool {
        if ts < self.all_committed_before {
            return true;
        }
        if ts >= self.none_committed_at_or_after {
            return false;
        }
        self.in_flight.binary_search(&ts).is_err()
    }

    pub fn all_committed_before(&self) -> Timestamp {
        self.all_committed_before
    }

    pub fn none_committed_at_or_after(&self) -> Timestamp {
        self.none_committed_at_or_after
    }

    pub fn in_flight(&self) -> &[Timestamp] {
        &self.in_flight
    }
}

impl PartialEq for MvccSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.all_committed_before == other.all_committed_before
            && self.none_committed_at_or_after == other.none_committed_at_or_after
            && self.in_flight == other.in_flight
    }
}

impl Eq for MvccSnapshot {}

impl fmt::Display for MvccSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MvccSnapshot[committed < {}, none >= {}, in flight {:?}]",
            self.all_committed_before,
            self.none_committed_at_or_after,
            self.in_flight.iter().map(|t| t.0).collect::<Vec<_>>()
        )
    }
}
