//! Base data reader
//!
//! Opens a DiskRowSet's base file, validates it, and keeps the key index
//! and bloom filter in memory for containment checks.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::bloom::KeyBloom;
use super::{ENTRY_HEADER_SIZE, FOOTER_SIZE, HEADER_SIZE, MAGIC, VERSION};
use crate::error::{Result, TabletError};

/// Chunk size used while checksumming the data block
const CRC_CHUNK: usize = 64 * 1024;

pub(crate) struct BaseReader {
    path: PathBuf,
    /// In-memory index: key → file offset
    index: BTreeMap<Vec<u8>, u64>,
    bloom: KeyBloom,
    entry_count: u64,
    /// Largest insert timestamp of any base row
    max_insert_ts: u64,
    /// Index block starting offset (end of data block)
    data_end: u64,
    file_size: u64,
}

fn le_u16(bytes: &[u8]) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&bytes[..2]);
    u16::from_le_bytes(buf)
}

pub(crate) fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

pub(crate) fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

impl BaseReader {
    /// Open and validate a base file.
    ///
    /// Structural problems and checksum mismatches are `Corruption`.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let corrupt = |msg: String| TabletError::Corruption(format!("{}: {}", path.display(), msg));

        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < HEADER_SIZE + FOOTER_SIZE {
            return Err(corrupt(format!("file too short ({} bytes)", file_size)));
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        if &header[0..4] != MAGIC {
            return Err(corrupt(format!(
                "invalid magic: expected TBDR, got {:?}",
                &header[0..4]
            )));
        }
        let version = le_u16(&header[4..6]);
        if version != VERSION {
            return Err(corrupt(format!("unsupported version {}", version)));
        }
        let entry_count = le_u64(&header[6..14]);

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact(&mut footer)?;
        let index_offset = le_u64(&footer[0..8]);
        let bloom_offset = le_u64(&footer[8..16]);
        let max_insert_ts = le_u64(&footer[16..24]);
        let data_crc = le_u32(&footer[24..28]);

        let footer_start = file_size - FOOTER_SIZE;
        if index_offset < HEADER_SIZE || index_offset > bloom_offset || bloom_offset > footer_start
        {
            return Err(corrupt(format!(
                "bad block offsets (index {}, bloom {}, footer {})",
                index_offset, bloom_offset, footer_start
            )));
        }

        // Checksum the data block
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut hasher = crc32fast::Hasher::new();
        let mut remaining = index_offset - HEADER_SIZE;
        let mut chunk = vec![0u8; CRC_CHUNK];
        while remaining > 0 {
            let n = remaining.min(CRC_CHUNK as u64) as usize;
            file.read_exact(&mut chunk[..n])?;
            hasher.update(&chunk[..n]);
            remaining -= n as u64;
        }
        let actual_crc = hasher.finalize();
        if actual_crc != data_crc {
            return Err(corrupt(format!(
                "data checksum mismatch: stored {:08x}, computed {:08x}",
                data_crc, actual_crc
            )));
        }

        // Index block: [key_len(4)][offset(8)][key]
        let mut index_data = vec![0u8; (bloom_offset - index_offset) as usize];
        file.read_exact(&mut index_data)?;

        let mut index = BTreeMap::new();
        let mut pos = 0;
        while pos < index_data.len() {
            if pos + 12 > index_data.len() {
                return Err(corrupt("truncated index entry".to_string()));
            }
            let key_len = le_u32(&index_data[pos..]) as usize;
            let offset = le_u64(&index_data[pos + 4..]);
            pos += 12;
            if pos + key_len > index_data.len() {
                return Err(corrupt("truncated index key".to_string()));
            }
            if offset < HEADER_SIZE || offset + ENTRY_HEADER_SIZE > index_offset {
                return Err(corrupt(format!("index offset {} out of range", offset)));
            }
            index.insert(index_data[pos..pos + key_len].to_vec(), offset);
            pos += key_len;
        }
        if index.len() as u64 != entry_count {
            return Err(corrupt(format!(
                "header claims {} rows, index holds {}",
                entry_count,
                index.len()
            )));
        }

        let mut bloom_data = vec![0u8; (footer_start - bloom_offset) as usize];
        file.read_exact(&mut bloom_data)?;
        let bloom = KeyBloom::from_bytes(&bloom_data)?;

        Ok(Self {
            path: path.to_path_buf(),
            index,
            bloom,
            entry_count,
            max_insert_ts,
            data_end: index_offset,
            file_size,
        })
    }

    /// Whether a row with `key` is stored in the base data
    pub(crate) fn contains(&self, key: &[u8]) -> bool {
        self.bloom.might_contain(key) && self.index.contains_key(key)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub(crate) fn max_insert_ts(&self) -> u64 {
        self.max_insert_ts
    }

    pub(crate) fn file_size(&self) -> u64 {
        self.file_size
    }

    pub(crate) fn min_key(&self) -> Option<&[u8]> {
        self.index.keys().next().map(|k| k.as_slice())
    }

    pub(crate) fn max_key(&self) -> Option<&[u8]> {
        self.index.keys().next_back().map(|k| k.as_slice())
    }

    /// Open a sequential scanner over the data block
    pub(crate) fn scan(&self) -> Result<BaseScanner> {
        BaseScanner::open(&self.path, self.data_end)
    }
}

/// Sequential iteration over base rows in key order
pub(crate) struct BaseScanner {
    file: BufReader<File>,
    /// Stop reading when we reach this offset (start of index block)
    end_offset: u64,
    current_offset: u64,
}

/// One base row: (key, insert_ts, row)
pub(crate) type BaseEntry = (Vec<u8>, u64, Vec<u8>);

impl BaseScanner {
    fn open(path: &Path, end_offset: u64) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        Ok(Self {
            file,
            end_offset,
            current_offset: HEADER_SIZE,
        })
    }

    fn read_entry(&mut self) -> Result<BaseEntry> {
        let mut header = [0u8; ENTRY_HEADER_SIZE as usize];
        self.file.read_exact(&mut header)?;
        let key_len = le_u32(&header[0..4]) as usize;
        let row_len = le_u32(&header[4..8]) as usize;
        let insert_ts = le_u64(&header[8..16]);

        let entry_size = ENTRY_HEADER_SIZE + key_len as u64 + row_len as u64;
        if self.current_offset + entry_size > self.end_offset {
            return Err(TabletError::Corruption(format!(
                "row at offset {} overruns the data block",
                self.current_offset
            )));
        }

        let mut key = vec![0u8; key_len];
        self.file.read_exact(&mut key)?;
        let mut row = vec![0u8; row_len];
        self.file.read_exact(&mut row)?;

        self.current_offset += entry_size;
        Ok((key, insert_ts, row))
    }
}

impl Iterator for BaseScanner {
    type Item = Result<BaseEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_offset >= self.end_offset {
            return None;
        }
        match self.read_entry() {
            Ok(entry) => Some(Ok(entry)),
            Err(e) => {
                // Stop after the first error
                self.current_offset = self.end_offset;
                Some(Err(e))
            }
        }
    }
}
