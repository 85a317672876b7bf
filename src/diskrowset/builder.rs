//! DiskRowSet Writer
//!
//! Writes the sorted rows of a flush/compaction into a new rowset
//! directory.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::bloom::KeyBloom;
use super::{
    DiskRowSetMeta, BASE_FILENAME, DELTA_FILENAME, ENTRY_HEADER_SIZE, HEADER_SIZE, MAGIC, VERSION,
};
use crate::config::BloomFilterSizing;
use crate::error::{Result, TabletError};
use crate::mvcc::Timestamp;

/// Writer for a new DiskRowSet
pub struct DiskRowSetWriter {
    index: u64,
    /// Rowset directory (created by `new`)
    dir: PathBuf,
    /// Buffered writer for the base file
    writer: BufWriter<File>,
    /// Expected width of every row
    row_size: usize,
    entry_count: u64,
    /// Current write position (for index)
    current_offset: u64,
    /// Key index: key → file offset of entry
    key_index: Vec<(Vec<u8>, u64)>,
    /// Running CRC hasher for data section
    data_hasher: crc32fast::Hasher,
    bloom_sizing: BloomFilterSizing,
    /// Largest insert timestamp added so far
    max_insert_ts: u64,
}

impl fmt::Debug for DiskRowSetWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskRowSetWriter")
            .field("index", &self.index)
            .field("dir", &self.dir)
            .field("entries", &self.entry_count)
            .field("bytes", &self.current_offset)
            .finish()
    }
}

impl DiskRowSetWriter {
    /// Create the rowset directory and its base file.
    ///
    /// Fails if the directory already exists: a rowset index is never
    /// written twice.
    pub fn new(
        dir: &Path,
        index: u64,
        row_size: usize,
        bloom_sizing: BloomFilterSizing,
    ) -> Result<Self> {
        fs::create_dir(dir)?;

        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(dir.join(BASE_FILENAME))?;
        let mut writer = BufWriter::new(file);

        // entry_count placeholder, updated in finish
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&0u64.to_le_bytes())?;

        debug!(index, dir = %dir.display(), "Started DiskRowSet");

        Ok(Self {
            index,
            dir: dir.to_path_buf(),
            writer,
            row_size,
            entry_count: 0,
            current_offset: HEADER_SIZE,
            key_index: Vec::new(),
            data_hasher: crc32fast::Hasher::new(),
            bloom_sizing,
            max_insert_ts: 0,
        })
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Bytes of row data written so far (header included)
    pub fn bytes_written(&self) -> u64 {
        self.current_offset
    }

    /// Append a row. Keys must be strictly increasing.
    pub fn add(&mut self, key: &[u8], insert_ts: Timestamp, row: &[u8]) -> Result<()> {
        if let Some((last, _)) = self.key_index.last() {
            if key <= last.as_slice() {
                return Err(TabletError::InvalidArgument(format!(
                    "DiskRowSet({}): keys out of order",
                    self.index
                )));
            }
        }
        if row.len() != self.row_size {
            return Err(TabletError::InvalidArgument(format!(
                "row is {} bytes, expected {}",
                row.len(),
                self.row_size
            )));
        }

        self.key_index.push((key.to_vec(), self.current_offset));

        // [key_len(4)][row_len(4)][insert_ts(8)][key][row]
        let key_len_bytes = (key.len() as u32).to_le_bytes();
        let row_len_bytes = (row.len() as u32).to_le_bytes();
        let ts_bytes = insert_ts.value().to_le_bytes();

        for part in [&key_len_bytes[..], &row_len_bytes[..], &ts_bytes[..], key, row] {
            self.writer.write_all(part)?;
            self.data_hasher.update(part);
        }

        self.current_offset += ENTRY_HEADER_SIZE + key.len() as u64 + row.len() as u64;
        self.entry_count += 1;
        self.max_insert_ts = self.max_insert_ts.max(insert_ts.value());
        Ok(())
    }

    /// Write index, bloom and footer, sync, and create the empty delta log.
    /// On failure the rowset directory is removed.
    pub fn finish(self) -> Result<DiskRowSetMeta> {
        let dir = self.dir.clone();
        let index = self.index;
        self.write_trailer().map_err(|e| {
            if let Err(rm) = fs::remove_dir_all(&dir) {
                warn!(index, error = %rm, "Failed to remove unfinished DiskRowSet");
            }
            e
        })
    }

    fn write_trailer(mut self) -> Result<DiskRowSetMeta> {
        let index_offset = self.current_offset;

        for (key, offset) in &self.key_index {
            self.writer.write_all(&(key.len() as u32).to_le_bytes())?;
            self.writer.write_all(&offset.to_le_bytes())?;
            self.writer.write_all(key)?;
        }
        let index_size: u64 = self
            .key_index
            .iter()
            .map(|(k, _)| 12 + k.len() as u64)
            .sum();

        let bloom_offset = index_offset + index_size;
        let bloom = KeyBloom::build(
            self.key_index.iter().map(|(k, _)| k.as_slice()),
            self.key_index.len(),
            self.bloom_sizing,
        );
        self.writer.write_all(&bloom.to_bytes())?;

        // Footer: index_offset (8) + bloom_offset (8) + max_insert_ts (8) +
        // data_crc (4) + padding (4)
        let data_crc = self.data_hasher.finalize();
        self.writer.write_all(&index_offset.to_le_bytes())?;
        self.writer.write_all(&bloom_offset.to_le_bytes())?;
        self.writer.write_all(&self.max_insert_ts.to_le_bytes())?;
        self.writer.write_all(&data_crc.to_le_bytes())?;
        self.writer.write_all(&[0u8; 4])?;
        self.writer.flush()?;

        let mut file = self
            .writer
            .into_inner()
            .map_err(|e| TabletError::Io(e.into_error()))?;
        file.seek(SeekFrom::Start(6))?; // After magic + version
        file.write_all(&self.entry_count.to_le_bytes())?;
        file.sync_all()?;
        let file_size = file.metadata()?.len();

        File::create(self.dir.join(DELTA_FILENAME))?.sync_all()?;

        debug!(
            index = self.index,
            entries = self.entry_count,
            file_size,
            "Finished DiskRowSet"
        );

        Ok(DiskRowSetMeta {
            index: self.index,
            dir: self.dir,
            entry_count: self.entry_count,
            min_key: self.key_index.first().map(|(k, _)| k.clone()).unwrap_or_default(),
            max_key: self.key_index.last().map(|(k, _)| k.clone()).unwrap_or_default(),
            file_size,
        })
    }

    /// Discard a partially written rowset and its directory
    pub fn abort(self) {
        let Self { dir, writer, index, .. } = self;
        drop(writer);
        if let Err(e) = fs::remove_dir_all(&dir) {
            warn!(index, error = %e, "Failed to remove aborted DiskRowSet");
        }
    }
}
