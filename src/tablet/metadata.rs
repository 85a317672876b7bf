//! Tablet metadata file
//!
//! Records the schema, the live DiskRowSet indices (in creation order) and
//! the next rowset index. Rewriting it is the commit point of every layout
//! swap.
//!
//! A new version is written and synced under a temporary name, then renamed
//! over `tablet.meta`. Layout swaps stage the temporary file before taking
//! the tablet's exclusive guard so that only the rename happens under it.
//!
//! ## File Format
//! ```text
//! ┌──────────────┬─────────┬─────────┬─────────────────────────┐
//! │ "TBMD" (4)   │ CRC (4) │ Len (4) │ bincode(body) (Len)     │
//! └──────────────┴─────────┴─────────┴─────────────────────────┘
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, TabletError};
use crate::schema::{ColumnSchema, Schema};

const META_MAGIC: &[u8; 4] = b"TBMD";
const META_HEADER_SIZE: usize = 12;

pub(crate) const METADATA_FILENAME: &str = "tablet.meta";
/// Prefix of every temporary metadata file
pub(crate) const METADATA_TMP_PREFIX: &str = "tablet.meta.tmp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TabletMetadata {
    columns: Vec<ColumnSchema>,
    num_key_columns: usize,
    /// Live DiskRowSet indices, oldest first
    pub(crate) rowsets: Vec<u64>,
    pub(crate) next_rowset_idx: u64,
}

impl TabletMetadata {
    pub(crate) fn new(schema: &Schema, rowsets: Vec<u64>, next_rowset_idx: u64) -> Self {
        Self {
            columns: schema.columns().to_vec(),
            num_key_columns: schema.num_key_columns(),
            rowsets,
            next_rowset_idx,
        }
    }

    pub(crate) fn schema(&self) -> Result<Schema> {
        Schema::new(self.columns.clone(), self.num_key_columns)
            .map_err(|e| TabletError::Corruption(format!("stored schema is invalid: {}", e)))
    }

    /// Load the metadata of the tablet in `dir`. A missing or unreadable
    /// file is `Corruption`.
    pub(crate) fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILENAME);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TabletError::Corruption(format!(
                    "{}: tablet metadata not found",
                    dir.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let corrupt = |msg: &str| TabletError::Corruption(format!("{}: {}", path.display(), msg));

        if data.len() < META_HEADER_SIZE || &data[0..4] != META_MAGIC {
            return Err(corrupt("bad metadata header"));
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&data[4..8]);
        let crc = u32::from_le_bytes(word);
        word.copy_from_slice(&data[8..12]);
        let len = u32::from_le_bytes(word) as usize;

        let body = &data[META_HEADER_SIZE..];
        if body.len() != len {
            return Err(corrupt("metadata length mismatch"));
        }
        if crc32fast::hash(body) != crc {
            return Err(corrupt("metadata checksum mismatch"));
        }
        bincode::deserialize(body).map_err(|e| corrupt(&e.to_string()))
    }

    /// Atomically replace the metadata of the tablet in `dir`
    pub(crate) fn store(&self, dir: &Path) -> Result<()> {
        let tmp_path = dir.join(METADATA_TMP_PREFIX);
        self.write_synced(&tmp_path)?;
        publish(&tmp_path, dir)
    }

    /// Write and sync this version under a temporary name unique to `seq`,
    /// without replacing the current metadata
    pub(crate) fn stage(&self, dir: &Path, seq: u64) -> Result<StagedMetadata> {
        let staged = StagedMetadata {
            meta: self.clone(),
            tmp_path: dir.join(format!("{}.{}", METADATA_TMP_PREFIX, seq)),
            committed: false,
        };
        self.write_synced(&staged.tmp_path)?;
        Ok(staged)
    }

    fn write_synced(&self, path: &Path) -> Result<()> {
        let body = bincode::serialize(self)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.write_all(META_MAGIC)?;
        file.write_all(&crc32fast::hash(&body).to_le_bytes())?;
        file.write_all(&(body.len() as u32).to_le_bytes())?;
        file.write_all(&body)?;
        file.sync_all()?;
        Ok(())
    }
}

fn publish(tmp_path: &Path, dir: &Path) -> Result<()> {
    fs::rename(tmp_path, dir.join(METADATA_FILENAME))?;
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Remove temporary metadata files left by an interrupted write
pub(crate) fn remove_stale_tmp_files(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let stale = entry
            .file_name()
            .to_str()
            .map_or(false, |name| name.starts_with(METADATA_TMP_PREFIX));
        if stale {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// A synced metadata version waiting to be renamed into place. Removed
/// from disk if dropped uncommitted.
#[derive(Debug)]
pub(crate) struct StagedMetadata {
    meta: TabletMetadata,
    tmp_path: PathBuf,
    committed: bool,
}

impl StagedMetadata {
    pub(crate) fn metadata(&self) -> &TabletMetadata {
        &self.meta
    }

    /// Make the staged version the tablet's metadata
    pub(crate) fn commit(mut self, dir: &Path) -> Result<()> {
        publish(&self.tmp_path, dir)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedMetadata {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = fs::remove_file(&self.tmp_path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.tmp_path.display(), error = %e, "Failed to remove staged metadata");
            }
        }
    }
}
