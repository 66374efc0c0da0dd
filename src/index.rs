//! Content-hash index (C2): answers "have we already stored this exact
//! content?" in O(1) without ever reading an object body.

use std::collections::HashMap;

use tracing::{debug, info, instrument, warn};

use crate::store::ObjectStore;
use crate::types::{ContentHash, HASH_METADATA_KEY};

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub key: String,
    pub size: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IndexStats {
    pub entries: usize,
    pub hydrated_total: usize,
    pub skipped_unindexed: usize,
}

struct Inner {
    by_hash: HashMap<ContentHash, IndexEntry>,
    by_key: HashMap<String, ContentHash>,
}

/// `parking_lot::RwLock` over two maps, mirroring the concurrency primitive
/// used throughout this service's other shared state.
pub struct HashIndex {
    inner: parking_lot::RwLock<Inner>,
}

impl HashIndex {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::RwLock::new(Inner {
                by_hash: HashMap::new(),
                by_key: HashMap::new(),
            }),
        }
    }

    /// Look up an existing object by content hash. Returns `None` when no
    /// object with this exact content has been recorded.
    pub fn contains(&self, hash: &str) -> Option<IndexEntry> {
        self.inner.read().by_hash.get(hash).cloned()
    }

    pub fn add(&self, hash: ContentHash, key: String, size: u64) {
        let mut inner = self.inner.write();
        inner.by_key.insert(key.clone(), hash.clone());
        inner.by_hash.insert(hash, IndexEntry { key, size });
    }

    pub fn remove_by_key(&self, key: &str) {
        let mut inner = self.inner.write();
        if let Some(hash) = inner.by_key.remove(key) {
            if inner.by_hash.get(&hash).map(|e| e.key.as_str()) == Some(key) {
                inner.by_hash.remove(&hash);
            }
        }
    }

    pub fn size(&self) -> usize {
        self.inner.read().by_hash.len()
    }

    /// Look up the content hash currently on record for a key, used to
    /// detect a filename collision against a different hash before an
    /// upload is admitted.
    pub fn hash_for_key(&self, key: &str) -> Option<ContentHash> {
        self.inner.read().by_key.get(key).cloned()
    }

    /// Drop every tracked entry. Used by the bucket-clear admin operation
    /// so a stale index never reports a duplicate against content that no
    /// longer exists in the store.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.by_hash.clear();
        inner.by_key.clear();
    }

    /// Rebuild the index from the backing store at boot, reading only
    /// each object's user-metadata — never its body.
    #[instrument(skip(self, store))]
    pub async fn hydrate(&self, store: &dyn ObjectStore) -> Result<IndexStats, crate::store::StoreError> {
        let objects = store.list_with_metadata("").await?;
        let mut stats = IndexStats::default();
        stats.hydrated_total = objects.len();

        let mut inner = self.inner.write();
        for object in objects {
            match object.user_metadata.get(HASH_METADATA_KEY) {
                Some(hash) => {
                    inner.by_key.insert(object.key.clone(), hash.clone());
                    inner.by_hash.insert(
                        hash.clone(),
                        IndexEntry {
                            key: object.key,
                            size: object.size,
                        },
                    );
                    stats.entries += 1;
                }
                None => {
                    stats.skipped_unindexed += 1;
                }
            }
        }
        drop(inner);

        if stats.skipped_unindexed > 0 {
            warn!(
                skipped = stats.skipped_unindexed,
                "objects missing content-hash metadata left un-indexed"
            );
        }
        info!(entries = stats.entries, total = stats.hydrated_total, "hash index hydrated");
        debug!(?stats, "hydration complete");
        Ok(stats)
    }
}

impl Default for HashIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_contains_round_trips() {
        let index = HashIndex::new();
        index.add("hash1".into(), "a.wav".into(), 100);
        let entry = index.contains("hash1").unwrap();
        assert_eq!(entry.key, "a.wav");
        assert_eq!(entry.size, 100);
    }

    #[test]
    fn missing_hash_returns_none() {
        let index = HashIndex::new();
        assert!(index.contains("nope").is_none());
    }

    #[test]
    fn remove_by_key_clears_both_maps() {
        let index = HashIndex::new();
        index.add("hash1".into(), "a.wav".into(), 100);
        index.remove_by_key("a.wav");
        assert!(index.contains("hash1").is_none());
        assert_eq!(index.size(), 0);
    }

    #[test]
    fn hash_for_key_reflects_last_write() {
        let index = HashIndex::new();
        index.add("hash1".into(), "a.wav".into(), 100);
        assert_eq!(index.hash_for_key("a.wav").as_deref(), Some("hash1"));
        assert!(index.hash_for_key("missing.wav").is_none());
    }

    #[test]
    fn clear_empties_both_maps() {
        let index = HashIndex::new();
        index.add("hash1".into(), "a.wav".into(), 100);
        index.clear();
        assert_eq!(index.size(), 0);
        assert!(index.contains("hash1").is_none());
    }

    #[test]
    fn remove_by_key_does_not_remove_a_different_keys_entry() {
        let index = HashIndex::new();
        index.add("hash1".into(), "a.wav".into(), 100);
        index.add("hash1".into(), "b.wav".into(), 100); // same content, re-keyed
        index.remove_by_key("a.wav");
        // by_hash now points at b.wav; removing a.wav must not evict it.
        assert!(index.contains("hash1").is_some());
    }
}
