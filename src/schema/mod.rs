//! Schema Module
//!
//! Typed, fixed-width row layout shared by every store in a tablet.
//!
//! ## Row Layout
//! ```text
//! ┌──────────────┬──────────────┬───────────────┬─────┐
//! │ key col 0 LE │ key col 1 LE │ value col 0 LE│ ... │
//! └──────────────┴──────────────┴───────────────┴─────┘
//!  ◄──── key prefix ──────────►
//! ```
//!
//! Rows are compared by their *encoded key*: each key column rewritten
//! big-endian with the sign bit flipped for signed types, so plain byte
//! comparison of encoded keys equals tuple comparison of the key columns.

mod changelist;
mod row;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TabletError};

pub use changelist::{ColumnUpdate, RowChange, RowChangeList, RowChangeListEncoder};
pub use row::{Projection, RowBuilder};

// =============================================================================
// Column Types
// =============================================================================

/// Fixed-width column types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    UInt8,
    Int8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    UInt64,
    Int64,
}

impl DataType {
    /// Width of a cell of this type in the row layout
    pub fn size(&self) -> usize {
        match self {
            DataType::UInt8 | DataType::Int8 => 1,
            DataType::UInt16 | DataType::Int16 => 2,
            DataType::UInt32 | DataType::Int32 => 4,
            DataType::UInt64 | DataType::Int64 => 8,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::UInt8 => "uint8",
            DataType::Int8 => "int8",
            DataType::UInt16 => "uint16",
            DataType::Int16 => "int16",
            DataType::UInt32 => "uint32",
            DataType::Int32 => "int32",
            DataType::UInt64 => "uint64",
            DataType::Int64 => "int64",
        }
    }

    /// Render a little-endian cell for debugging
    fn format_cell(&self, bytes: &[u8]) -> String {
        match self {
            DataType::UInt8 => u8::read_le(bytes).to_string(),
            DataType::Int8 => i8::read_le(bytes).to_string(),
            DataType::UInt16 => u16::read_le(bytes).to_string(),
            DataType::Int16 => i16::read_le(bytes).to_string(),
            DataType::UInt32 => u32::read_le(bytes).to_string(),
            DataType::Int32 => i32::read_le(bytes).to_string(),
            DataType::UInt64 => u64::read_le(bytes).to_string(),
            DataType::Int64 => i64::read_le(bytes).to_string(),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rust types that can be stored in a cell
pub trait Cell: Copy + fmt::Debug {
    const DATA_TYPE: DataType;

    fn write_le(self, out: &mut Vec<u8>);

    /// Caller guarantees `bytes.len() >= DATA_TYPE.size()`
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_cell {
    ($t:ty, $dt:expr) => {
        impl Cell for $t {
            const DATA_TYPE: DataType = $dt;

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(&bytes[..std::mem::size_of::<$t>()]);
                <$t>::from_le_bytes(buf)
            }
        }
    };
}

impl_cell!(u8, DataType::UInt8);
impl_cell!(i8, DataType::Int8);
impl_cell!(u16, DataType::UInt16);
impl_cell!(i16, DataType::Int16);
impl_cell!(u32, DataType::UInt32);
impl_cell!(i32, DataType::Int32);
impl_cell!(u64, DataType::UInt64);
impl_cell!(i64, DataType::Int64);

// =============================================================================
// Schema
// =============================================================================

/// A named, typed column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    name: String,
    data_type: DataType,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }
}

/// Ordered list of columns with a key-column prefix
///
/// Immutable once built. `offsets[i]` is the byte offset of column `i`
/// inside a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnSchema>,
    num_key_columns: usize,
    offsets: Vec<usize>,
    byte_size: usize,
}

impl Schema {
    /// Build a schema whose first `num_key_columns` columns form the key.
    ///
    /// Projection schemas may have zero key columns; a tablet schema may not
    /// (checked by `Tablet::new`).
    pub fn new(columns: Vec<ColumnSchema>, num_key_columns: usize) -> Result<Self> {
        if num_key_columns > columns.len() {
            return Err(TabletError::InvalidArgument(format!(
                "{} key columns requested but schema has {} columns",
                num_key_columns,
                columns.len()
            )));
        }

        for (i, col) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == col.name) {
                return Err(TabletError::InvalidArgument(format!(
                    "duplicate column name: {}",
                    col.name
                )));
            }
        }

        let mut offsets = Vec::with_capacity(columns.len());
        let mut byte_size = 0;
        for col in &columns {
            offsets.push(byte_size);
            byte_size += col.data_type.size();
        }

        Ok(Self {
            columns,
            num_key_columns,
            offsets,
            byte_size,
        })
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn column(&self, idx: usize) -> Option<&ColumnSchema> {
        self.columns.get(idx)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    /// Size in bytes of every row matching this schema
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Size in bytes of the key prefix of a row
    pub fn key_byte_size(&self) -> usize {
        self.offsets
            .get(self.num_key_columns)
            .copied()
            .unwrap_or(self.byte_size)
    }

    pub fn column_offset(&self, idx: usize) -> Option<usize> {
        self.offsets.get(idx).copied()
    }

    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Fail unless `row` has exactly this schema's byte size
    pub fn validate_row(&self, row: &[u8]) -> Result<()> {
        if row.len() != self.byte_size {
            return Err(TabletError::InvalidArgument(format!(
                "row has {} bytes, schema requires {}",
                row.len(),
                self.byte_size
            )));
        }
        Ok(())
    }

    /// Encode the key prefix of `key` (a row, or just its key columns) into
    /// its memcomparable form.
    pub fn encode_key(&self, key: &[u8]) -> Result<Vec<u8>> {
        let key_size = self.key_byte_size();
        if key.len() < key_size {
            return Err(TabletError::InvalidArgument(format!(
                "key has {} bytes, key columns require {}",
                key.len(),
                key_size
            )));
        }

        let mut encoded = Vec::with_capacity(key_size);
        for idx in 0..self.num_key_columns {
            let data_type = self.columns[idx].data_type;
            let start = self.offsets[idx];
            let first = encoded.len();
            encoded.extend(key[start..start + data_type.size()].iter().rev());
            if data_type.is_signed() {
                encoded[first] ^= 0x80;
            }
        }
        Ok(encoded)
    }

    /// Read a typed cell out of a row
    pub fn get<T: Cell>(&self, row: &[u8], idx: usize) -> Result<T> {
        let col = self.columns.get(idx).ok_or_else(|| {
            TabletError::InvalidArgument(format!("column index {} out of range", idx))
        })?;
        if col.data_type != T::DATA_TYPE {
            return Err(TabletError::InvalidArgument(format!(
                "column {} is {}, not {}",
                col.name, col.data_type, T::DATA_TYPE
            )));
        }
        let start = self.offsets[idx];
        if row.len() < start + col.data_type.size() {
            return Err(TabletError::InvalidArgument(format!(
                "row too short for column {}",
                col.name
            )));
        }
        Ok(T::read_le(&row[start..]))
    }

    /// Human-readable rendering of a row, e.g. `(int32 key=1, int64 val=7)`
    pub fn debug_row(&self, row: &[u8]) -> String {
        if row.len() != self.byte_size {
            return format!("<malformed row: {} bytes>", row.len());
        }
        let cells: Vec<String> = self
            .columns
            .iter()
            .zip(&self.offsets)
            .map(|(col, &off)| {
                format!(
                    "{} {}={}",
                    col.data_type,
                    col.name,
                    col.data_type.format_cell(&row[off..])
                )
            })
            .collect();
        format!("({})", cells.join(", "))
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cols: Vec<String> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let key = if i < self.num_key_columns { " KEY" } else { "" };
                format!("{} {}{}", c.name, c.data_type, key)
            })
            .collect();
        write!(f, "Schema [{}]", cols.join(", "))
    }
}
