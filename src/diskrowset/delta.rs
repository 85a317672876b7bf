//! Delta store
//!
//! Mutations applied to a DiskRowSet after its base data was written.
//! Every mutation is appended to `deltas.log` before it becomes visible,
//! and the log is replayed into memory when the rowset is opened.
//!
//! ## Log Format
//! ```text
//! ┌─────────┬─────────┬─────────┬──────────────────────────────┐
//! │ Seq (8) │ CRC (4) │ Len (4) │ bincode(DeltaRecord) (Len)   │
//! └─────────┴─────────┴─────────┴──────────────────────────────┘
//! ```
//! The CRC covers the payload. A record cut short at the end of the file
//! (a torn append) is truncated away on replay; a complete record whose
//! checksum does not match is corruption.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::reader::{le_u32, le_u64};
use crate::config::DeltaSyncStrategy;
use crate::error::{Result, TabletError};
use crate::mvcc::Timestamp;
use crate::rowset::{is_deleted, KeyedMutation, Mutation};
use crate::schema::RowChangeList;

/// Seq (8) + CRC (4) + Len (4)
const RECORD_HEADER_SIZE: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct DeltaRecord {
    ts: u64,
    key: Vec<u8>,
    change: Vec<u8>,
}

struct DeltaLog {
    writer: BufWriter<File>,
    next_seq: u64,
    unsynced: usize,
    sync: DeltaSyncStrategy,
}

impl DeltaLog {
    fn append(&mut self, key: &[u8], mutation: &Mutation) -> Result<()> {
        let record = DeltaRecord {
            ts: mutation.ts.value(),
            key: key.to_vec(),
            change: mutation.change.as_bytes().to_vec(),
        };
        let payload = bincode::serialize(&record)?;
        let crc = crc32fast::hash(&payload);

        self.writer.write_all(&self.next_seq.to_le_bytes())?;
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.writer.write_all(&payload)?;
        self.writer.flush()?;
        self.next_seq += 1;
        self.unsynced += 1;

        let due = match self.sync {
            DeltaSyncStrategy::EveryWrite => true,
            DeltaSyncStrategy::EveryNEntries { count } => self.unsynced >= count.max(1),
        };
        if due {
            self.sync()?;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.unsynced = 0;
        Ok(())
    }
}

/// Persistent per-rowset delta store
pub(crate) struct DeltaStore {
    path: PathBuf,
    /// Encoded key → mutations, in application order
    mutations: RwLock<BTreeMap<Vec<u8>, Vec<Mutation>>>,
    log: Mutex<DeltaLog>,
}

impl DeltaStore {
    /// Replay `path` (created if missing) and open it for appending
    pub(crate) fn open(path: &Path, sync: DeltaSyncStrategy) -> Result<Self> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut mutations: BTreeMap<Vec<u8>, Vec<Mutation>> = BTreeMap::new();
        let mut pos = 0;
        let mut next_seq = 0u64;
        while pos < data.len() {
            if pos + RECORD_HEADER_SIZE > data.len() {
                break;
            }
            let seq = le_u64(&data[pos..]);
            let crc = le_u32(&data[pos + 8..]);
            let len = le_u32(&data[pos + 12..]) as usize;
            let start = pos + RECORD_HEADER_SIZE;
            if start + len > data.len() {
                break;
            }
            let payload = &data[start..start + len];
            if crc32fast::hash(payload) != crc {
                return Err(TabletError::Corruption(format!(
                    "{}: checksum mismatch in record {}",
                    path.display(),
                    seq
                )));
            }
            if seq != next_seq {
                return Err(TabletError::Corruption(format!(
                    "{}: expected record {}, found {}",
                    path.display(),
                    next_seq,
                    seq
                )));
            }
            let record: DeltaRecord = bincode::deserialize(payload).map_err(|e| {
                TabletError::Corruption(format!("{}: record {}: {}", path.display(), seq, e))
            })?;
            mutations.entry(record.key).or_default().push(Mutation {
                ts: Timestamp(record.ts),
                change: RowChangeList::from_encoded(Bytes::from(record.change)),
            });
            next_seq += 1;
            pos = start + len;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)?;
        if pos < data.len() {
            warn!(
                path = %path.display(),
                valid_bytes = pos,
                dropped_bytes = data.len() - pos,
                "Truncating torn delta log tail"
            );
            file.set_len(pos as u64)?;
            file.sync_all()?;
        }
        drop(file);

        let file = OpenOptions::new().append(true).open(path)?;
        if next_seq > 0 {
            debug!(path = %path.display(), records = next_seq, "Replayed delta log");
        }

        Ok(Self {
            path: path.to_path_buf(),
            mutations: RwLock::new(mutations),
            log: Mutex::new(DeltaLog {
                writer: BufWriter::new(file),
                next_seq,
                unsynced: 0,
                sync,
            }),
        })
    }

    /// Log and record a mutation. With `require_live`, a row whose latest
    /// mutation is a delete is `KeyNotFound`.
    pub(crate) fn apply(&self, key: &[u8], mutation: &Mutation, require_live: bool) -> Result<()> {
        let mut map = self.mutations.write();
        if require_live {
            if let Some(existing) = map.get(key) {
                if is_deleted(existing)? {
                    return Err(TabletError::KeyNotFound);
                }
            }
        }
        self.log.lock().append(key, mutation)?;
        map.entry(key.to_vec()).or_default().push(mutation.clone());
        Ok(())
    }

    /// Copy of the mutations accepted by `filter`, grouped by key
    pub(crate) fn snapshot(
        &self,
        filter: impl Fn(Timestamp) -> bool,
    ) -> BTreeMap<Vec<u8>, Vec<Mutation>> {
        let map = self.mutations.read();
        let mut out = BTreeMap::new();
        for (key, mutations) in map.iter() {
            let kept: Vec<Mutation> = mutations.iter().filter(|m| filter(m.ts)).cloned().collect();
            if !kept.is_empty() {
                out.insert(key.clone(), kept);
            }
        }
        out
    }

    pub(crate) fn collect(&self, filter: &dyn Fn(Timestamp) -> bool) -> Vec<KeyedMutation> {
        let map = self.mutations.read();
        let mut out = Vec::new();
        for (key, mutations) in map.iter() {
            for mutation in mutations.iter().filter(|m| filter(m.ts)) {
                out.push(KeyedMutation {
                    key: key.clone(),
                    mutation: mutation.clone(),
                });
            }
        }
        out
    }

    /// Rows whose latest mutation is a delete
    pub(crate) fn deleted_count(&self) -> Result<u64> {
        let map = self.mutations.read();
        let mut deleted = 0;
        for mutations in map.values() {
            if is_deleted(mutations)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Largest timestamp of any stored mutation
    pub(crate) fn max_timestamp(&self) -> Option<Timestamp> {
        self.mutations
            .read()
            .values()
            .flat_map(|muts| muts.iter().map(|m| m.ts))
            .max()
    }

    pub(crate) fn num_mutations(&self) -> usize {
        self.mutations.read().values().map(Vec::len).sum()
    }

    /// Approximate encoded size of all stored mutations
    pub(crate) fn estimate_size(&self) -> u64 {
        let map = self.mutations.read();
        map.iter()
            .map(|(key, ms)| {
                ms.iter()
                    .map(|m| (RECORD_HEADER_SIZE + key.len() + m.change.len()) as u64)
                    .sum::<u64>()
            })
            .sum()
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.log.lock().sync()
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}
