//! Configuration for a tablet
//!
//! Centralized configuration with sensible defaults.

use crate::error::{Result, TabletError};

/// Main configuration for a Tablet instance
#[derive(Debug, Clone)]
pub struct TabletConfig {
    // -------------------------------------------------------------------------
    // DiskRowSet Configuration
    // -------------------------------------------------------------------------
    /// Sizing policy for the key bloom filter attached to new DiskRowSets
    pub bloom_sizing: BloomFilterSizing,

    /// Base data size at which a flush/compaction output rolls over to a
    /// new DiskRowSet
    pub target_rowset_size: u64,

    /// How often to fsync each DiskRowSet's delta log
    pub delta_sync: DeltaSyncStrategy,

    // -------------------------------------------------------------------------
    // MemRowSet Configuration
    // -------------------------------------------------------------------------
    /// MemRowSet footprint (in bytes) at which `Tablet::needs_flush` reports true
    pub memrowset_flush_threshold: usize,

    // -------------------------------------------------------------------------
    // Compaction Configuration
    // -------------------------------------------------------------------------
    pub compaction: CompactionPolicy,
}

/// Bloom filter sizing for new DiskRowSets
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BloomFilterSizing {
    /// Target false positive rate, in (0, 1)
    pub false_positive_rate: f64,
}

impl Default for BloomFilterSizing {
    fn default() -> Self {
        Self {
            false_positive_rate: 0.01,
        }
    }
}

/// Delta log sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaSyncStrategy {
    /// fsync after every update (safest, slowest)
    EveryWrite,

    /// fsync after N unsynced updates (balanced durability/performance)
    EveryNEntries { count: usize },
}

/// Selection policy used by `Tablet::compact`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    /// Fewer eligible rowsets than this and compaction is a no-op
    pub min_rowsets_to_compact: usize,

    /// Upper bound on rowsets merged by one compaction
    pub max_rowsets_per_compaction: usize,

    /// Upper bound on the summed estimated size of the picked rowsets.
    /// The smallest candidate is always admitted.
    pub max_compaction_input_bytes: u64,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            min_rowsets_to_compact: 2,
            max_rowsets_per_compaction: 32,
            max_compaction_input_bytes: 1024 * 1024 * 1024, // 1 GB
        }
    }
}

impl Default for TabletConfig {
    fn default() -> Self {
        Self {
            bloom_sizing: BloomFilterSizing::default(),
            target_rowset_size: 64 * 1024 * 1024, // 64 MB
            delta_sync: DeltaSyncStrategy::EveryNEntries { count: 100 },
            memrowset_flush_threshold: 64 * 1024 * 1024, // 64 MB
            compaction: CompactionPolicy::default(),
        }
    }
}

impl TabletConfig {
    /// Create a new config builder
    pub fn builder() -> TabletConfigBuilder {
        TabletConfigBuilder::default()
    }

    /// Reject values the tablet cannot operate with
    pub fn validate(&self) -> Result<()> {
        let fp = self.bloom_sizing.false_positive_rate;
        if !(fp > 0.0 && fp < 1.0) {
            return Err(TabletError::Config(format!(
                "bloom false positive rate must be in (0, 1), got {}",
                fp
            )));
        }
        if self.target_rowset_size == 0 {
            return Err(TabletError::Config(
                "target_rowset_size must be non-zero".to_string(),
            ));
        }
        if let DeltaSyncStrategy::EveryNEntries { count: 0 } = self.delta_sync {
            return Err(TabletError::Config(
                "delta sync entry count must be non-zero".to_string(),
            ));
        }
        let policy = &self.compaction;
        if policy.min_rowsets_to_compact == 0
            || policy.max_rowsets_per_compaction < policy.min_rowsets_to_compact
        {
            return Err(TabletError::Config(format!(
                "invalid compaction bounds: min={} max={}",
                policy.min_rowsets_to_compact, policy.max_rowsets_per_compaction
            )));
        }
        Ok(())
    }
}

/// Builder for TabletConfig
#[derive(Default)]
pub struct TabletConfigBuilder {
    config: TabletConfig,
}

impl TabletConfigBuilder {
    /// Set the bloom filter false positive rate for new DiskRowSets
    pub fn bloom_false_positive_rate(mut self, rate: f64) -> Self {
        self.config.bloom_sizing.false_positive_rate = rate;
        self
    }

    /// Set the DiskRowSet roll-over size (in bytes)
    pub fn target_rowset_size(mut self, size: u64) -> Self {
        self.config.target_rowset_size = size;
        self
    }

    /// Set the delta log sync strategy
    pub fn delta_sync(mut self, strategy: DeltaSyncStrategy) -> Self {
        self.config.delta_sync = strategy;
        self
    }

    /// Set the MemRowSet flush threshold (in bytes)
    pub fn memrowset_flush_threshold(mut self, size: usize) -> Self {
        self.config.memrowset_flush_threshold = size;
        self
    }

    /// Set the minimum number of rowsets a compaction must pick
    pub fn min_rowsets_to_compact(mut self, count: usize) -> Self {
        self.config.compaction.min_rowsets_to_compact = count;
        self
    }

    /// Set the maximum number of rowsets a compaction may pick
    pub fn max_rowsets_per_compaction(mut self, count: usize) -> Self {
        self.config.compaction.max_rowsets_per_compaction = count;
        self
    }

    /// Set the compaction input size budget (in bytes)
    pub fn max_compaction_input_bytes(mut self, bytes: u64) -> Self {
        self.config.compaction.max_compaction_input_bytes = bytes;
        self
    }

    pub fn build(self) -> TabletConfig {
        self.config
    }
}
