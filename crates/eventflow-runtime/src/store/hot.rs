//! Hot store: TTL-bounded cache of recent aggregate streams.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use eventflow_core::{AggregateId, EventEnvelope, EventStream};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotStoreConfig {
    pub ttl_seconds: u64,
    pub max_aggregates: usize,
}

impl Default for HotStoreConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 300,
            max_aggregates: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HotStoreStatistics {
    pub hits: u64,
    pub misses: u64,
    pub promotions: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub cached_aggregates: usize,
}

struct HotEntry {
    /// Full stream from version 1; entries always cover the whole aggregate
    events: Vec<EventEnvelope>,
    cached_at: Instant,
    last_accessed: Instant,
    access_count: u64,
}

impl HotEntry {
    fn version(&self) -> i64 {
        self.events.last().map(|e| e.version).unwrap_or(0)
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() > ttl
    }
}

/// TTL-bounded per-aggregate stream cache with LRU eviction.
pub struct HotEventCache {
    entries: RwLock<HashMap<AggregateId, HotEntry>>,
    access_order: Mutex<VecDeque<AggregateId>>,
    config: HotStoreConfig,
    stats: Mutex<HotStoreStatistics>,
}

impl HotEventCache {
    pub fn new(config: HotStoreConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            access_order: Mutex::new(VecDeque::new()),
            config,
            stats: Mutex::new(HotStoreStatistics::default()),
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_seconds)
    }

    /// Serve a version range if the aggregate's full stream is cached and
    /// fresh. A `None` result means the caller must fall through to warm.
    pub async fn get(
        &self,
        aggregate_id: &AggregateId,
        from_version: i64,
        to_version: Option<i64>,
    ) -> Option<EventStream> {
        let ttl = self.ttl();
        let mut expired = false;
        let result = {
            let mut entries = self.entries.write().await;
            let served = match entries.get_mut(aggregate_id) {
                Some(entry) if entry.is_expired(ttl) => {
                    expired = true;
                    None
                }
                Some(entry) => {
                    entry.last_accessed = Instant::now();
                    entry.access_count += 1;
                    Some(
                        entry
                            .events
                            .iter()
                            .filter(|e| {
                                e.version >= from_version
                                    && to_version.map(|to| e.version <= to).unwrap_or(true)
                            })
                            .cloned()
                            .collect::<EventStream>(),
                    )
                }
                None => None,
            };
            if expired {
                entries.remove(aggregate_id);
            }
            served
        };

        let mut stats = self.stats.lock().await;
        match &result {
            Some(_) => {
                stats.hits += 1;
                drop(stats);
                self.touch(aggregate_id).await;
            }
            None => {
                stats.misses += 1;
                if expired {
                    stats.evictions += 1;
                }
            }
        }
        result
    }

    /// Cached version of an aggregate, if its entry is fresh.
    pub async fn version(&self, aggregate_id: &AggregateId) -> Option<i64> {
        let entries = self.entries.read().await;
        entries
            .get(aggregate_id)
            .filter(|e| !e.is_expired(self.ttl()))
            .map(|e| e.version())
    }

    /// Install the full stream of an aggregate (read-through promotion).
    pub async fn promote(&self, aggregate_id: &AggregateId, stream: &EventStream) {
        // Only complete streams are cached; partial ranges would serve
        // truncated reads.
        if stream.first().map(|e| e.version) != Some(1) {
            return;
        }
        self.evict_for_capacity().await;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.insert(
            aggregate_id.clone(),
            HotEntry {
                events: stream.as_slice().to_vec(),
                cached_at: now,
                last_accessed: now,
                access_count: 0,
            },
        );
        drop(entries);
        self.touch(aggregate_id).await;
        let mut stats = self.stats.lock().await;
        stats.promotions += 1;
        debug!(aggregate_id = %aggregate_id, "promoted stream to hot store");
    }

    /// Extend a cached stream with freshly appended events. Creates the
    /// entry when the append starts the aggregate's stream.
    pub async fn extend(&self, aggregate_id: &AggregateId, events: &[EventEnvelope]) {
        if events.is_empty() {
            return;
        }
        let ttl = self.ttl();
        let mut promote_fresh = false;
        {
            let mut entries = self.entries.write().await;
            let extended = match entries.get_mut(aggregate_id) {
                Some(entry)
                    if !entry.is_expired(ttl) && entry.version() + 1 == events[0].version =>
                {
                    entry.events.extend(events.iter().cloned());
                    entry.cached_at = Instant::now();
                    true
                }
                _ => false,
            };
            if !extended {
                // Expired entry, or a gap between the cached tail and the
                // appended events: the entry no longer covers the stream.
                entries.remove(aggregate_id);
                promote_fresh = events[0].version == 1;
            }
        }
        if promote_fresh {
            self.promote(aggregate_id, &EventStream::new(events.to_vec()))
                .await;
        }
    }

    pub async fn invalidate(&self, aggregate_id: &AggregateId) {
        let mut entries = self.entries.write().await;
        if entries.remove(aggregate_id).is_some() {
            let mut stats = self.stats.lock().await;
            stats.invalidations += 1;
        }
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn evict_expired(&self) -> usize {
        let ttl = self.ttl();
        let mut entries = self.entries.write().await;
        let expired: Vec<AggregateId> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(ttl))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            entries.remove(id);
        }
        drop(entries);
        if !expired.is_empty() {
            let mut stats = self.stats.lock().await;
            stats.evictions += expired.len() as u64;
        }
        expired.len()
    }

    pub async fn statistics(&self) -> HotStoreStatistics {
        let mut stats = self.stats.lock().await.clone();
        stats.cached_aggregates = self.entries.read().await.len();
        stats
    }

    async fn touch(&self, aggregate_id: &AggregateId) {
        let mut order = self.access_order.lock().await;
        if let Some(pos) = order.iter().position(|id| id == aggregate_id) {
            order.remove(pos);
        }
        order.push_front(aggregate_id.clone());
        while order.len() > self.config.max_aggregates * 2 {
            order.pop_back();
        }
    }

    async fn evict_for_capacity(&self) {
        let mut entries = self.entries.write().await;
        if entries.len() < self.config.max_aggregates {
            return;
        }
        let mut order = self.access_order.lock().await;
        let mut evicted = 0u64;
        while entries.len() >= self.config.max_aggregates {
            match order.pop_back() {
                Some(candidate) => {
                    if entries.remove(&candidate).is_some() {
                        evicted += 1;
                    }
                }
                None => {
                    // LRU order drifted from the entry map; drop an arbitrary
                    // entry to honor the bound.
                    if let Some(id) = entries.keys().next().cloned() {
                        entries.remove(&id);
                        evicted += 1;
                    } else {
                        break;
                    }
                }
            }
        }
        drop(order);
        drop(entries);
        if evicted > 0 {
            let mut stats = self.stats.lock().await;
            stats.evictions += evicted;
        }
    }
}
