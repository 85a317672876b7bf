//! Row change lists
//!
//! A `RowChangeList` is the encoded form of a mutation against an existing
//! row: either a set of column updates or a delete marker. Stores keep the
//! encoded bytes and only decode when materializing a row.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{Cell, Schema};
use crate::error::{Result, TabletError};

/// New little-endian value for one non-key column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnUpdate {
    pub column: usize,
    pub value: Vec<u8>,
}

/// Decoded form of a RowChangeList
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowChange {
    Update(Vec<ColumnUpdate>),
    Delete,
}

impl RowChange {
    /// Check every update targets an existing non-key column with a value
    /// of the column's width
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        let updates = match self {
            RowChange::Delete => return Ok(()),
            RowChange::Update(updates) => updates,
        };
        if updates.is_empty() {
            return Err(TabletError::InvalidArgument(
                "update changes no columns".to_string(),
            ));
        }
        for update in updates {
            let col = schema.column(update.column).ok_or_else(|| {
                TabletError::InvalidArgument(format!(
                    "update names column {} of {}",
                    update.column,
                    schema.num_columns()
                ))
            })?;
            if update.column < schema.num_key_columns() {
                return Err(TabletError::InvalidArgument(format!(
                    "key column {} cannot be updated",
                    col.name()
                )));
            }
            if update.value.len() != col.data_type().size() {
                return Err(TabletError::InvalidArgument(format!(
                    "update of {} carries {} bytes, expected {}",
                    col.name(),
                    update.value.len(),
                    col.data_type().size()
                )));
            }
        }
        Ok(())
    }

    /// Apply column updates in place. Deletes leave the row untouched;
    /// callers decide what a delete means for them.
    pub fn apply_to(&self, schema: &Schema, row: &mut [u8]) -> Result<()> {
        if let RowChange::Update(updates) = self {
            self.validate(schema)?;
            for update in updates {
                let offset = schema.column_offset(update.column).unwrap_or_default();
                row[offset..offset + update.value.len()].copy_from_slice(&update.value);
            }
        }
        Ok(())
    }
}

/// Encoded mutation, cheap to clone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChangeList {
    encoded: Bytes,
}

impl RowChangeList {
    /// Wrap already-encoded bytes (e.g. read back from a delta log)
    pub fn from_encoded(encoded: impl Into<Bytes>) -> Self {
        Self {
            encoded: encoded.into(),
        }
    }

    /// Encode a decoded change
    pub fn from_change(change: &RowChange) -> Result<Self> {
        Ok(Self::from_encoded(bincode::serialize(change)?))
    }

    /// The delete marker
    pub fn delete() -> Result<Self> {
        Self::from_change(&RowChange::Delete)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.encoded
    }

    pub fn len(&self) -> usize {
        self.encoded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoded.is_empty()
    }

    pub fn decode(&self) -> Result<RowChange> {
        bincode::deserialize(&self.encoded).map_err(|e| {
            TabletError::InvalidArgument(format!("malformed row change list: {}", e))
        })
    }

    pub fn is_delete(&self) -> Result<bool> {
        Ok(matches!(self.decode()?, RowChange::Delete))
    }

    /// Decode and validate against `schema`
    pub fn validate(&self, schema: &Schema) -> Result<RowChange> {
        let change = self.decode()?;
        change.validate(schema)?;
        Ok(change)
    }
}

/// Builds an update RowChangeList column by column
pub struct RowChangeListEncoder<'a> {
    schema: &'a Schema,
    updates: Vec<ColumnUpdate>,
}

impl<'a> RowChangeListEncoder<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            updates: Vec::new(),
        }
    }

    /// Set column `column` to `value`; the value's type must match
    pub fn update<T: Cell>(&mut self, column: usize, value: T) -> Result<&mut Self> {
        let col = self.schema.column(column).ok_or_else(|| {
            TabletError::InvalidArgument(format!("column index {} out of range", column))
        })?;
        if col.data_type() != T::DATA_TYPE {
            return Err(TabletError::InvalidArgument(format!(
                "column {} is {}, got {}",
                col.name(),
                col.data_type(),
                T::DATA_TYPE
            )));
        }
        let mut value_bytes = Vec::with_capacity(col.data_type().size());
        value.write_le(&mut value_bytes);
        self.updates.push(ColumnUpdate {
            column,
            value: value_bytes,
        });
        Ok(self)
    }

    pub fn build(&self) -> Result<RowChangeList> {
        let change = RowChange::Update(self.updates.clone());
        change.validate(self.schema)?;
        RowChangeList::from_change(&change)
    }
}
