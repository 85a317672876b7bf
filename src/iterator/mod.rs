//! Row Iterators
//!
//! Every read path hands out a `RowwiseIterator`. Iterators are returned
//! uninitialized: construction only captures handles, `init()` does the
//! work of positioning (opening files, copying deltas).

mod merge;

use crate::error::Result;
use crate::schema::Schema;

pub use merge::MergeIterator;

/// One row produced by an iterator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IteratedRow {
    /// Memcomparable encoded key of the row
    pub key: Vec<u8>,
    /// Row bytes laid out per the iterator's projection schema
    pub row: Vec<u8>,
}

/// Pull-based iterator over projected rows in key order
pub trait RowwiseIterator: Send {
    /// Prepare for iteration. Must be called once, before `next_row`.
    fn init(&mut self) -> Result<()>;

    /// Next visible row, or `None` once exhausted
    fn next_row(&mut self) -> Result<Option<IteratedRow>>;

    /// Projection schema of produced rows
    fn schema(&self) -> &Schema;

    /// Drain the remaining rows
    fn collect_rows(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut rows = Vec::new();
        while let Some(r) = self.next_row()? {
            rows.push(r.row);
        }
        Ok(rows)
    }
}

/// Iterator over rows materialized at init time
///
/// `source` runs once, on `init()`, and yields key-ordered rows.
pub(crate) struct MaterializedIterator<F>
where
    F: FnOnce() -> Result<Vec<IteratedRow>> + Send,
{
    schema: Schema,
    source: Option<F>,
    rows: std::vec::IntoIter<IteratedRow>,
}

impl<F> MaterializedIterator<F>
where
    F: FnOnce() -> Result<Vec<IteratedRow>> + Send,
{
    pub(crate) fn new(schema: Schema, source: F) -> Self {
        Self {
            schema,
            source: Some(source),
            rows: Vec::new().into_iter(),
        }
    }
}

impl<F> RowwiseIterator for MaterializedIterator<F>
where
    F: FnOnce() -> Result<Vec<IteratedRow>> + Send,
{
    fn init(&mut self) -> Result<()> {
        if let Some(source) = self.source.take() {
            self.rows = source()?.into_iter();
        }
        Ok(())
    }

    fn next_row(&mut self) -> Result<Option<IteratedRow>> {
        Ok(self.rows.next())
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}
