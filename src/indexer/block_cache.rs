use std::collections::BTreeMap;

use alloy::primitives::B256;
use chrono::{DateTime, Utc};

use crate::rpc::BlockMeta;

/// Cached header data for one block height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    pub hash: B256,
    pub parent_hash: B256,
    pub time: DateTime<Utc>,
}

impl From<BlockMeta> for BlockEntry {
    fn from(meta: BlockMeta) -> Self {
        Self {
            hash: meta.hash,
            parent_hash: meta.parent_hash,
            time: DateTime::from_timestamp(meta.timestamp as i64, 0).unwrap_or_default(),
        }
    }
}

/// In-memory block-hash cache of one crawler instance.
///
/// Holds the last `reorg_depth` blocks so the reorg probe has canonical
/// hashes to compare against, and supplies `block_hash`/`block_time` to
/// persisted rows. Not persisted: empty on restart, rebuilt lazily.
#[derive(Debug, Default)]
pub struct BlockCache {
    entries: BTreeMap<u64, BlockEntry>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, number: u64) -> Option<&BlockEntry> {
        self.entries.get(&number)
    }

    /// Idempotent: re-inserting a height replaces the entry.
    pub fn put(&mut self, number: u64, entry: BlockEntry) {
        self.entries.insert(number, entry);
    }

    /// Remove entries with `number <= keep_above`.
    pub fn prune(&mut self, keep_above: u64) {
        self.entries = self.entries.split_off(&(keep_above + 1));
    }

    /// Remove entries with `number >= from`. Used on reorg rollback.
    pub fn drop_from(&mut self, from: u64) {
        self.entries.split_off(&from);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(byte: u8) -> BlockEntry {
        BlockEntry {
            hash: B256::repeat_byte(byte),
            parent_hash: B256::repeat_byte(byte.wrapping_sub(1)),
            time: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_put_get() {
        let mut cache = BlockCache::new();
        assert!(cache.get(10).is_none());

        cache.put(10, entry(0xaa));
        assert_eq!(cache.get(10).unwrap().hash, B256::repeat_byte(0xaa));

        // Re-insert replaces.
        cache.put(10, entry(0xbb));
        assert_eq!(cache.get(10).unwrap().hash, B256::repeat_byte(0xbb));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_prune_keeps_above_cutoff() {
        let mut cache = BlockCache::new();
        for n in 1..=20 {
            cache.put(n, entry(n as u8));
        }

        cache.prune(8);
        assert!(cache.get(8).is_none());
        assert!(cache.get(9).is_some());
        assert_eq!(cache.len(), 12);
    }

    #[test]
    fn test_drop_from_removes_suffix() {
        let mut cache = BlockCache::new();
        for n in 1..=20 {
            cache.put(n, entry(n as u8));
        }

        cache.drop_from(15);
        assert!(cache.get(15).is_none());
        assert!(cache.get(20).is_none());
        assert!(cache.get(14).is_some());
        assert_eq!(cache.len(), 14);
    }

    #[test]
    fn test_retention_window() {
        let mut cache = BlockCache::new();
        let reorg_depth = 12u64;
        for head in 100..150u64 {
            cache.put(head, entry(head as u8));
            cache.prune(head - reorg_depth);
        }
        assert_eq!(cache.len(), reorg_depth as usize);
        assert!(cache.get(149).is_some());
        assert!(cache.get(149 - reorg_depth + 1).is_some());
        assert!(cache.get(149 - reorg_depth).is_none());
    }
}
