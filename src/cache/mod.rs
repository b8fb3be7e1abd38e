pub mod control;
pub mod key;

pub use control::CachePolicy;
pub use key::CacheKey;

use crate::config::ProxyConfig;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

/// A transformed image as served to clients.
#[derive(Debug)]
pub struct CacheEntry {
    pub payload: Bytes,
    pub content_type: String,
    pub stored_at: SystemTime,
    /// Size of the upstream bytes this payload was produced from.
    pub original_size: usize,
    sequence: u64,
}

impl CacheEntry {
    fn is_stale(&self, ttl: Duration) -> bool {
        // A clock that moved backwards keeps the entry fresh.
        self.stored_at.elapsed().map(|age| age > ttl).unwrap_or(false)
    }
}

/// Statistics about the cache
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub approx_size_bytes: u64,
    pub stale_entries: usize,
    pub max_entries: usize,
    pub max_size_bytes: u64,
    pub ttl_secs: u64,
}

/// In-process store of transformed variants.
///
/// Entries are immutable once stored and shared as `Arc`s; writers replace
/// whole entries under the lock, so readers never see a partial value.
/// Nothing survives a restart.
pub struct CacheStore {
    entries: RwLock<HashMap<CacheKey, Arc<CacheEntry>>>,
    ttl: Duration,
    max_entries: usize,
    max_bytes: u64,
    next_sequence: AtomicU64,
}

impl CacheStore {
    pub fn new(ttl: Duration, max_entries: usize, max_bytes: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_entries,
            max_bytes,
            next_sequence: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(config.cache_ttl, config.max_cache_entries, config.max_cache_bytes)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<CacheKey, Arc<CacheEntry>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<CacheKey, Arc<CacheEntry>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up a fresh entry. Stale entries read as absent but are left in
    /// place; the next [`CacheStore::set`] purges them.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.read()
            .get(key)
            .filter(|entry| !entry.is_stale(self.ttl))
            .cloned()
    }

    /// Stores (or replaces) the variant for `key`, then enforces capacity.
    pub fn set(
        &self,
        key: CacheKey,
        payload: Bytes,
        content_type: impl Into<String>,
        original_size: usize,
    ) -> Arc<CacheEntry> {
        let entry = Arc::new(CacheEntry {
            payload,
            content_type: content_type.into(),
            stored_at: SystemTime::now(),
            original_size,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
        });

        let mut entries = self.write();
        entries.insert(key, Arc::clone(&entry));
        self.evict(&mut entries);
        entry
    }

    pub fn compute_etag(&self, key: &CacheKey) -> String {
        key.etag()
    }

    pub fn delete(&self, key: &CacheKey) -> bool {
        self.write().remove(key).is_some()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.write();
        let removed = entries.len();
        entries.clear();
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.read();
        CacheStats {
            entry_count: entries.len(),
            approx_size_bytes: entries.values().map(|e| e.payload.len() as u64).sum(),
            stale_entries: entries.values().filter(|e| e.is_stale(self.ttl)).count(),
            max_entries: self.max_entries,
            max_size_bytes: self.max_bytes,
            ttl_secs: self.ttl.as_secs(),
        }
    }

    /// Drops stale entries, then the oldest ones until both limits hold.
    fn evict(&self, entries: &mut HashMap<CacheKey, Arc<CacheEntry>>) {
        let before = entries.len();
        entries.retain(|_, e| !e.is_stale(self.ttl));

        let mut size: u64 = entries.values().map(|e| e.payload.len() as u64).sum();
        if entries.len() > self.max_entries || size > self.max_bytes {
            let mut oldest_first: Vec<(CacheKey, u64, u64)> = entries
                .iter()
                .map(|(k, e)| (k.clone(), e.sequence, e.payload.len() as u64))
                .collect();
            oldest_first.sort_by_key(|(_, sequence, _)| *sequence);

            for (key, _, len) in oldest_first {
                if entries.len() <= self.max_entries && size <= self.max_bytes {
                    break;
                }
                entries.remove(&key);
                size -= len;
            }
        }

        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::info!("Evicted {} cache entries, {} remain ({} bytes)", evicted, entries.len(), size);
        }
    }
}
