//! Catalog lookup cache.
//!
//! Message types are looked up on every publish and every dispatched delivery, but
//! their rows never change once registered. `CatalogCache` keeps them in memory for
//! a bounded time, keyed both by name and by id. It is an ordinary value: construct
//! one per process and hand it to whatever needs it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use busline_core::{Clock, MessageTypeId, SystemClock};

use crate::store::{CatalogStore, MessageType, StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub ttl: Duration,
    /// Maximum entries per index.
    pub capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted: DateTime<Utc>,
}

/// One TTL/capacity-bounded index.
#[derive(Debug)]
struct TtlMap<K, V> {
    entries: HashMap<K, Entry<V>>,
}

impl<K, V> Default for TtlMap<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> TtlMap<K, V> {
    fn get(&mut self, key: &K, ttl: chrono::Duration, now: DateTime<Utc>) -> Option<V> {
        let fresh = self
            .entries
            .get(key)
            .map(|entry| now - entry.inserted < ttl)?;
        if fresh {
            self.entries.get(key).map(|entry| entry.value.clone())
        } else {
            self.entries.remove(key);
            None
        }
    }

    fn insert(
        &mut self,
        key: K,
        value: V,
        settings: &CacheSettings,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) {
        if settings.capacity == 0 {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= settings.capacity {
            self.entries.retain(|_, entry| now - entry.inserted < ttl);
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= settings.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            key,
            Entry {
                value,
                inserted: now,
            },
        );
    }
}

#[derive(Debug, Default)]
struct Indexes {
    by_name: TtlMap<String, MessageType>,
    by_id: TtlMap<MessageTypeId, MessageType>,
}

/// Message type cache shared by publishers and consumers of one process.
#[derive(Debug)]
pub struct CatalogCache {
    settings: CacheSettings,
    clock: Arc<dyn Clock>,
    indexes: Mutex<Indexes>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CatalogCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: CacheSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            indexes: Mutex::new(Indexes::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> CacheSettings {
        self.settings
    }

    fn ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.settings.ttl).unwrap_or(chrono::Duration::MAX)
    }

    fn lock(&self) -> MutexGuard<'_, Indexes> {
        // Entries are plain values; a panic mid-insert cannot leave them inconsistent.
        self.indexes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn remember(&self, message_type: &MessageType) {
        let (ttl, now) = (self.ttl(), self.clock.now());
        let mut indexes = self.lock();
        indexes.by_name.insert(
            message_type.name.clone(),
            message_type.clone(),
            &self.settings,
            ttl,
            now,
        );
        indexes.by_id.insert(
            message_type.id,
            message_type.clone(),
            &self.settings,
            ttl,
            now,
        );
    }

    /// Cached entry for `name`, or the result of `load` (cached when found).
    ///
    /// The lock is not held while `load` runs; concurrent misses may both load.
    pub async fn get_or_load<F, Fut>(&self, name: &str, load: F) -> StoreResult<Option<MessageType>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<Option<MessageType>>>,
    {
        let cached = {
            let now = self.clock.now();
            self.lock().by_name.get(&name.to_string(), self.ttl(), now)
        };
        self.record(cached.is_some());
        if cached.is_some() {
            return Ok(cached);
        }

        debug!(message_type = name, "catalog cache miss");
        let loaded = load().await?;
        if let Some(message_type) = &loaded {
            self.remember(message_type);
        }
        Ok(loaded)
    }

    /// Id of a registered message type, going to `store` on a miss.
    pub async fn message_type<S>(&self, store: &S, name: &str) -> StoreResult<MessageType>
    where
        S: CatalogStore + ?Sized,
    {
        self.get_or_load(name, || store.message_type_by_name(name))
            .await?
            .ok_or_else(|| StoreError::not_found("message type", name))
    }

    /// Reverse lookup used when dispatching a claimed message.
    pub async fn message_type_by_id<S>(&self, store: &S, id: MessageTypeId) -> StoreResult<MessageType>
    where
        S: CatalogStore + ?Sized,
    {
        let cached = {
            let now = self.clock.now();
            self.lock().by_id.get(&id, self.ttl(), now)
        };
        self.record(cached.is_some());
        if let Some(message_type) = cached {
            return Ok(message_type);
        }

        let loaded = store
            .message_type_by_id(id)
            .await?
            .ok_or_else(|| StoreError::not_found("message type", id))?;
        self.remember(&loaded);
        Ok(loaded)
    }

    /// Drop a single name (and the id it mapped to).
    pub fn invalidate(&self, name: &str) {
        let mut indexes = self.lock();
        if let Some(entry) = indexes.by_name.entries.remove(name) {
            indexes.by_id.entries.remove(&entry.value.id);
        }
    }

    pub fn clear(&self) {
        let mut indexes = self.lock();
        indexes.by_name.entries.clear();
        indexes.by_id.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.lock().by_name.entries.len(),
        }
    }
}
