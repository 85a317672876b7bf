//! Key bloom filter for DiskRowSets
//!
//! Lets update routing skip rowsets that definitely do not hold a key
//! without touching the key index.

use bloomfilter::Bloom;

use crate::config::BloomFilterSizing;
use crate::error::{Result, TabletError};

/// Fixed part of the serialized form:
/// num_bits (8) + num_hashes (4) + bitmap_len (4) + sip_keys (32)
const BLOOM_HEADER_SIZE: usize = 48;

pub(crate) struct KeyBloom {
    filter: Bloom<[u8]>,
}

impl KeyBloom {
    pub(crate) fn build<'a>(
        keys: impl Iterator<Item = &'a [u8]>,
        expected: usize,
        sizing: BloomFilterSizing,
    ) -> Self {
        let mut filter = Bloom::new_for_fp_rate(expected.max(1), sizing.false_positive_rate);
        for key in keys {
            filter.set(key);
        }
        Self { filter }
    }

    /// false = definitely absent, true = maybe present
    pub(crate) fn might_contain(&self, key: &[u8]) -> bool {
        self.filter.check(key)
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let bitmap = self.filter.bitmap();
        let sip_keys = self.filter.sip_keys();

        let mut bytes = Vec::with_capacity(BLOOM_HEADER_SIZE + bitmap.len());
        bytes.extend_from_slice(&self.filter.number_of_bits().to_le_bytes());
        bytes.extend_from_slice(&self.filter.number_of_hash_functions().to_le_bytes());
        bytes.extend_from_slice(&(bitmap.len() as u32).to_le_bytes());
        for (k0, k1) in sip_keys.iter() {
            bytes.extend_from_slice(&k0.to_le_bytes());
            bytes.extend_from_slice(&k1.to_le_bytes());
        }
        bytes.extend_from_slice(&bitmap);
        bytes
    }

    pub(crate) fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < BLOOM_HEADER_SIZE {
            return Err(TabletError::Corruption(format!(
                "bloom block too short: {} bytes",
                data.len()
            )));
        }
        let u64_at = |pos: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[pos..pos + 8]);
            u64::from_le_bytes(buf)
        };
        let u32_at = |pos: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&data[pos..pos + 4]);
            u32::from_le_bytes(buf)
        };

        let num_bits = u64_at(0);
        let num_hashes = u32_at(8);
        let bitmap_len = u32_at(12) as usize;
        let sip_keys = [(u64_at(16), u64_at(24)), (u64_at(32), u64_at(40))];

        if data.len() != BLOOM_HEADER_SIZE + bitmap_len || num_hashes == 0 {
            return Err(TabletError::Corruption(format!(
                "bloom block length mismatch: {} bytes for a {} byte bitmap",
                data.len(),
                bitmap_len
            )));
        }

        let bitmap = &data[BLOOM_HEADER_SIZE..];
        Ok(Self {
            filter: Bloom::from_existing(bitmap, num_bits, num_hashes, sip_keys),
        })
    }
}
