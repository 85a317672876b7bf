//! Row construction and projection

use super::{Cell, Schema};
use crate::error::{Result, TabletError};

/// Builds a row (or a key) cell by cell, in column order.
///
/// ```ignore
/// let row = RowBuilder::new(&schema).add(1i32)?.add(10i64)?.build()?;
/// let key = RowBuilder::key(&schema).add(1i32)?.build()?;
/// ```
#[derive(Debug)]
pub struct RowBuilder<'a> {
    schema: &'a Schema,
    buf: Vec<u8>,
    next_col: usize,
    num_cols: usize,
}

impl<'a> RowBuilder<'a> {
    /// Builder for a full row
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            buf: Vec::with_capacity(schema.byte_size()),
            next_col: 0,
            num_cols: schema.num_columns(),
        }
    }

    /// Builder for the key prefix only, as passed to `Tablet::update_row`
    pub fn key(schema: &'a Schema) -> Self {
        Self {
            schema,
            buf: Vec::with_capacity(schema.key_byte_size()),
            next_col: 0,
            num_cols: schema.num_key_columns(),
        }
    }

    /// Append the next cell; its type must match the column's type
    pub fn add<T: Cell>(&mut self, value: T) -> Result<&mut Self> {
        if self.next_col >= self.num_cols {
            return Err(TabletError::InvalidArgument(format!(
                "too many cells: builder expects {}",
                self.num_cols
            )));
        }
        let col = &self.schema.columns()[self.next_col];
        if col.data_type() != T::DATA_TYPE {
            return Err(TabletError::InvalidArgument(format!(
                "column {} is {}, got {}",
                col.name(),
                col.data_type(),
                T::DATA_TYPE
            )));
        }
        value.write_le(&mut self.buf);
        self.next_col += 1;
        Ok(self)
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        if self.next_col != self.num_cols {
            return Err(TabletError::InvalidArgument(format!(
                "incomplete row: {} of {} cells set",
                self.next_col, self.num_cols
            )));
        }
        Ok(self.buf.clone())
    }
}

/// Maps rows of a base schema onto a projection schema.
///
/// Every projected column must exist in the base schema, by name, with the
/// same type.
#[derive(Debug, Clone)]
pub struct Projection {
    schema: Schema,
    /// (source offset, width) for each projected column
    cells: Vec<(usize, usize)>,
}

impl Projection {
    pub fn new(base: &Schema, projection: &Schema) -> Result<Self> {
        let mut cells = Vec::with_capacity(projection.num_columns());
        for col in projection.columns() {
            let idx = base.find_column(col.name()).ok_or_else(|| {
                TabletError::InvalidArgument(format!(
                    "projected column {} not in schema",
                    col.name()
                ))
            })?;
            let base_col = &base.columns()[idx];
            if base_col.data_type() != col.data_type() {
                return Err(TabletError::InvalidArgument(format!(
                    "projected column {} is {}, schema has {}",
                    col.name(),
                    col.data_type(),
                    base_col.data_type()
                )));
            }
            let offset = base.column_offset(idx).unwrap_or_default();
            cells.push((offset, col.data_type().size()));
        }
        Ok(Self {
            schema: projection.clone(),
            cells,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Copy the projected cells of a base-schema row into a new row
    pub fn project(&self, row: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.schema.byte_size());
        for &(offset, width) in &self.cells {
            out.extend_from_slice(&row[offset..offset + width]);
        }
        out
    }
}
