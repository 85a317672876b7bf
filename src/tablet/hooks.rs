//! Fault-injection hooks for flush and compaction
//!
//! Each method runs at a named checkpoint. The defaults do nothing; a test
//! installs an override that returns an error to make the enclosing
//! `flush()`/`compact()` abort at that point. Hooks run with no tablet lock
//! held, so they may call back into the tablet (insert, update, scan).

use crate::error::Result;

/// Checkpoints specific to `Tablet::compact`
pub trait CompactionFaultHooks: Send + Sync {
    /// After the compaction inputs were picked and their iterators captured
    fn post_select_iterators(&self) -> Result<()> {
        Ok(())
    }
}

/// Checkpoints specific to `Tablet::flush`
pub trait FlushFaultHooks: Send + Sync {
    /// After the active MemRowSet was retired and a new one installed
    fn post_swap_new_memrowset(&self) -> Result<()> {
        Ok(())
    }
}

/// Checkpoints shared by flush and compaction
pub trait FlushCompactCommonHooks: Send + Sync {
    /// After the new DiskRowSet(s) were written, before any swap
    fn post_write_snapshot(&self) -> Result<()> {
        Ok(())
    }

    /// After the inputs were replaced by a duplicating rowset
    fn post_swap_in_duplicating_rowset(&self) -> Result<()> {
        Ok(())
    }

    /// After mutations missed by the written snapshot were carried over
    fn post_reupdate_missed_deltas(&self) -> Result<()> {
        Ok(())
    }

    /// After the outputs replaced the duplicating rowset
    fn post_swap_new_rowset(&self) -> Result<()> {
        Ok(())
    }
}
