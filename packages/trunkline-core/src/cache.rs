//! TTL'd read-through cache over the talkgroup/channel catalog.
//!
//! Keyed by talkgroup number (trunked) or frequency in Hz (conventional).
//! Positive entries live 60 s, negative lookups are cached 10 s as a
//! sentinel so a missing catalog row doesn't hammer the store.
//!
//! The UDP hot path uses [`MetadataCache::lookup_cached`], which never
//! touches the store inline: a miss spawns a background refill and the frame
//! goes out unenriched until the entry lands.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::calls::SystemType;
use crate::db::Store;
use crate::protocol_constants::{CACHE_NEGATIVE_TTL_SECS, CACHE_TTL_SECS};
use crate::runtime::{TaskSpawner, TokioSpawner};

/// Catalog metadata attached to audio frames and persisted calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMetadata {
    pub alpha_tag: String,
    pub description: String,
    pub group_name: String,
    pub group_tag: String,
    pub mode: String,
}

struct CacheEntry {
    value: Option<ChannelMetadata>,
    expires: Instant,
}

/// Read-through metadata cache. Never the system of record.
pub struct MetadataCache {
    store: Arc<Store>,
    system_type: SystemType,
    entries: RwLock<HashMap<u64, CacheEntry>>,
    /// Keys with an in-flight background refill, to avoid duplicate fetches.
    refreshing: Mutex<HashSet<u64>>,
    spawner: TokioSpawner,
    ttl: Duration,
    negative_ttl: Duration,
}

impl MetadataCache {
    pub fn new(store: Arc<Store>, system_type: SystemType, spawner: TokioSpawner) -> Self {
        Self::with_ttls(
            store,
            system_type,
            spawner,
            Duration::from_secs(CACHE_TTL_SECS),
            Duration::from_secs(CACHE_NEGATIVE_TTL_SECS),
        )
    }

    /// Constructor with explicit TTLs, used by tests.
    pub fn with_ttls(
        store: Arc<Store>,
        system_type: SystemType,
        spawner: TokioSpawner,
        ttl: Duration,
        negative_ttl: Duration,
    ) -> Self {
        Self {
            store,
            system_type,
            entries: RwLock::new(HashMap::new()),
            refreshing: Mutex::new(HashSet::new()),
            spawner,
            ttl,
            negative_ttl,
        }
    }

    /// Synchronous cache-only lookup for the UDP hot path.
    ///
    /// Returns the cached value if fresh; on a miss (or expiry) schedules a
    /// background refill and returns `None` immediately.
    pub fn lookup_cached(self: &Arc<Self>, key: u64) -> Option<ChannelMetadata> {
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(&key) {
                if entry.expires > Instant::now() {
                    return entry.value.clone();
                }
            }
        }

        // Stale or absent: refill off the hot path.
        {
            let mut refreshing = self.refreshing.lock();
            if !refreshing.insert(key) {
                return None;
            }
        }
        let cache = Arc::clone(self);
        self.spawner.spawn(async move {
            let value = cache.fetch(key).await;
            cache.insert(key, value);
            cache.refreshing.lock().remove(&key);
        });
        None
    }

    /// Read-through lookup that may await the store. Used by the correlator,
    /// which is off the hot path.
    pub async fn lookup(&self, key: u64) -> Option<ChannelMetadata> {
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(&key) {
                if entry.expires > Instant::now() {
                    return entry.value.clone();
                }
            }
        }
        let value = self.fetch(key).await;
        self.insert(key, value.clone());
        value
    }

    /// Drops one cached entry; the next lookup refills it. Called after
    /// catalog writes.
    pub fn invalidate(&self, key: u64) {
        self.entries.write().remove(&key);
    }

    /// Drops every cached entry. Writers invalidate and refill.
    pub fn invalidate_all(&self) {
        self.entries.write().clear();
    }

    fn insert(&self, key: u64, value: Option<ChannelMetadata>) {
        let ttl = if value.is_some() {
            self.ttl
        } else {
            self.negative_ttl
        };
        self.entries.write().insert(
            key,
            CacheEntry {
                value,
                expires: Instant::now() + ttl,
            },
        );
    }

    async fn fetch(&self, key: u64) -> Option<ChannelMetadata> {
        match self.system_type {
            SystemType::Trunked => match self.store.talkgroup(key).await {
                Ok(row) => row.map(|r| ChannelMetadata {
                    alpha_tag: r.alpha_tag,
                    description: r.description,
                    group_name: r.group_name,
                    group_tag: r.group_tag,
                    mode: r.mode,
                }),
                Err(e) => {
                    log::warn!("[Cache] Talkgroup {} lookup failed: {}", key, e);
                    None
                }
            },
            SystemType::Conventional => match self.store.channel_by_frequency(key).await {
                Ok(row) => row.map(|r| ChannelMetadata {
                    alpha_tag: r.alpha_tag,
                    description: r.description,
                    group_name: r.group_name,
                    group_tag: r.group_tag,
                    mode: r.mode,
                }),
                Err(e) => {
                    log::warn!("[Cache] Channel {} lookup failed: {}", key, e);
                    None
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CatalogUpsert;

    async fn store_with_talkgroup() -> Arc<Store> {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        store
            .upsert_talkgroup(
                927,
                CatalogUpsert {
                    alpha_tag: "Control A2".into(),
                    group_name: "Police".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn read_through_hits_catalog() {
        let store = store_with_talkgroup().await;
        let cache = MetadataCache::new(store, SystemType::Trunked, TokioSpawner::current());

        let meta = cache.lookup(927).await.unwrap();
        assert_eq!(meta.alpha_tag, "Control A2");
        assert_eq!(meta.group_name, "Police");
    }

    #[tokio::test]
    async fn negative_results_are_cached_with_short_ttl() {
        let store = store_with_talkgroup().await;
        let cache = MetadataCache::with_ttls(
            Arc::clone(&store),
            SystemType::Trunked,
            TokioSpawner::current(),
            Duration::from_secs(60),
            Duration::from_millis(30),
        );

        assert!(cache.lookup(555).await.is_none());

        // Row appears, but the negative sentinel is still fresh.
        store
            .upsert_talkgroup(
                555,
                CatalogUpsert {
                    alpha_tag: "Late".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(cache.lookup(555).await.is_none());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.lookup(555).await.unwrap().alpha_tag, "Late");
    }

    #[tokio::test]
    async fn cached_lookup_never_blocks_and_refills_in_background() {
        let store = store_with_talkgroup().await;
        let cache = Arc::new(MetadataCache::new(
            store,
            SystemType::Trunked,
            TokioSpawner::current(),
        ));

        // First call misses and schedules the refill.
        assert!(cache.lookup_cached(927).is_none());

        // Give the background task a moment to land the entry.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let meta = cache.lookup_cached(927).unwrap();
        assert_eq!(meta.alpha_tag, "Control A2");
    }
}
