//! Key-ordered merge over several row iterators

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::{IteratedRow, RowwiseIterator};
use crate::error::{Result, TabletError};
use crate::schema::Schema;

struct HeapEntry {
    row: IteratedRow,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.row.key == other.row.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Max-heap: smallest key first; on equal keys the later source wins
    fn cmp(&self, other: &Self) -> Ordering {
        match self.row.key.cmp(&other.row.key) {
            Ordering::Equal => self.source.cmp(&other.source),
            ord => ord.reverse(),
        }
    }
}

/// Merges sub-iterators into one key-ordered stream.
///
/// Sources are ordered oldest to newest. If two sources yield the same key,
/// the newest source's row is produced and the others are skipped.
pub struct MergeIterator {
    schema: Schema,
    sources: Vec<Box<dyn RowwiseIterator>>,
    heap: BinaryHeap<HeapEntry>,
    initialized: bool,
}

impl MergeIterator {
    pub fn new(schema: Schema, sources: Vec<Box<dyn RowwiseIterator>>) -> Self {
        Self {
            schema,
            sources,
            heap: BinaryHeap::new(),
            initialized: false,
        }
    }

    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    fn refill(&mut self, source: usize) -> Result<()> {
        if let Some(row) = self.sources[source].next_row()? {
            self.heap.push(HeapEntry { row, source });
        }
        Ok(())
    }
}

impl RowwiseIterator for MergeIterator {
    fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Err(TabletError::IllegalState(
                "merge iterator already initialized".to_string(),
            ));
        }
        for source in 0..self.sources.len() {
            self.sources[source].init()?;
            self.refill(source)?;
        }
        self.initialized = true;
        Ok(())
    }

    fn next_row(&mut self) -> Result<Option<IteratedRow>> {
        if !self.initialized {
            return Err(TabletError::IllegalState(
                "merge iterator used before init".to_string(),
            ));
        }

        let top = match self.heap.pop() {
            Some(entry) => entry,
            None => return Ok(None),
        };
        self.refill(top.source)?;

        // Drop shadowed duplicates from older sources
        while let Some(next) = self.heap.peek() {
            if next.row.key != top.row.key {
                break;
            }
            if let Some(dup) = self.heap.pop() {
                self.refill(dup.source)?;
            }
        }

        Ok(Some(top.row))
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}
