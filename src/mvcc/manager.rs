//! MVCC manager
//!
//! Single mutex around the timestamp counter and the in-flight set. Critical
//! sections are a handful of instructions, so one lock is enough. Live
//! snapshots are counted in a second map, always locked after `state`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;

use super::snapshot::{SnapshotPin, SnapshotRegistry};
use super::{MvccSnapshot, Timestamp};
use crate::error::{Result, TabletError};

/// Issues timestamps and tracks transaction state for one tablet
pub struct MvccManager {
    state: Mutex<MvccState>,
    live_snapshots: Arc<SnapshotRegistry>,
}

struct MvccState {
    /// Timestamp handed to the next transaction
    next: u64,
    in_flight: BTreeSet<u64>,
}

impl MvccManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MvccState {
                next: 1,
                in_flight: BTreeSet::new(),
            }),
            live_snapshots: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Start a transaction and return its timestamp
    pub fn begin_transaction(&self) -> Timestamp {
        let mut state = self.state.lock();
        let ts = state.next;
        state.next += 1;
        state.in_flight.insert(ts);
        Timestamp(ts)
    }

    /// Mark an in-flight transaction committed
    pub fn commit_transaction(&self, ts: Timestamp) -> Result<()> {
        self.finish(ts, "commit")
    }

    /// Drop an in-flight transaction that wrote nothing.
    ///
    /// The timestamp must not tag any stored version: once out of the
    /// in-flight set, later snapshots would treat it as committed.
    pub fn abort_transaction(&self, ts: Timestamp) -> Result<()> {
        self.finish(ts, "abort")
    }

    fn finish(&self, ts: Timestamp, what: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.in_flight.remove(&ts.0) {
            return Err(TabletError::IllegalState(format!(
                "cannot {} transaction {}: not in flight",
                what, ts
            )));
        }
        Ok(())
    }

    /// Make every later transaction's timestamp exceed `ts`. Used on open so
    /// versions already on disk stay in the past.
    pub fn advance_past(&self, ts: Timestamp) {
        let mut state = self.state.lock();
        state.next = state.next.max(ts.0.saturating_add(1));
    }

    /// Capture the current commit watermark and in-flight set. The
    /// snapshot stays registered until its last clone is dropped.
    pub fn take_snapshot(&self) -> MvccSnapshot {
        let state = self.state.lock();
        let next = Timestamp(state.next);
        let all_committed_before = state.all_committed_before();
        let in_flight = state.in_flight.iter().map(|&ts| Timestamp(ts)).collect();

        *self
            .live_snapshots
            .lock()
            .entry(all_committed_before)
            .or_insert(0) += 1;
        let pin = SnapshotPin::new(all_committed_before, &self.live_snapshots);
        MvccSnapshot::new(Timestamp(all_committed_before), next, in_flight).pinned(pin)
    }

    /// Timestamp below which every committed mutation is visible to every
    /// live snapshot and to any snapshot taken from now on. History older
    /// than this may be folded away.
    pub fn ancient_history_mark(&self) -> Timestamp {
        let state = self.state.lock();
        let current = state.all_committed_before();
        let oldest_live = self.live_snapshots.lock().keys().next().copied();
        Timestamp(oldest_live.map_or(current, |ts| ts.min(current)))
    }

    /// Number of snapshots currently registered
    pub fn num_live_snapshots(&self) -> usize {
        self.live_snapshots.lock().values().sum()
    }

    /// Whether a version written at `ts` is visible to `snap`
    pub fn is_visible(&self, ts: Timestamp, snap: &MvccSnapshot) -> bool {
        snap.is_committed(ts)
    }

    /// Number of transactions currently in flight
    pub fn num_in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

impl MvccState {
    fn all_committed_before(&self) -> u64 {
        self.in_flight.iter().next().copied().unwrap_or(self.next)
    }
}

impl Default for MvccManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII transaction: aborted on drop unless `commit` was called
pub struct ScopedTransaction<'a> {
    mvcc: &'a MvccManager,
    ts: Timestamp,
    finished: bool,
}

impl<'a> ScopedTransaction<'a> {
    pub fn new(mvcc: &'a MvccManager) -> Self {
        let ts = mvcc.begin_transaction();
        Self {
            mvcc,
            ts,
            finished: false,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.ts
    }

    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.mvcc.commit_transaction(self.ts)
    }
}

impl Drop for ScopedTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.mvcc.abort_transaction(self.ts) {
                tracing::warn!(ts = self.ts.0, error = %e, "failed to abort transaction");
            }
        }
    }
}
