//! Multi-tier query cache: in-process L1, distributed L2, durable L3.
//!
//! L1 entries carry their tags, so tag invalidation clears L1 immediately
//! and synchronously. L2/L3 invalidation is queued through a rate-limited
//! batcher; `force_invalidate_tags` bypasses the queue and clears every tier
//! inline.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use eventflow_core::EngineResult;

use crate::repository::CacheTagInvalidator;

/// Which tier served a cache hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheTier {
    L1,
    L2,
    L3,
}

/// Value plus its invalidation tags, as stored in L2/L3.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedValue {
    pub value: Value,
    pub tags: Vec<String>,
}

/// L1 eviction strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionStrategy {
    Lru,
    TtlFirst,
    SizeBased,
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L1CacheConfig {
    pub max_entries: usize,
    /// Approximate bound on the serialized size of cached values
    pub max_bytes: usize,
    pub eviction: EvictionStrategy,
}

impl Default for L1CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 64 * 1024 * 1024,
            eviction: EvictionStrategy::Lru,
        }
    }
}

struct L1Entry {
    value: Value,
    tags: Vec<String>,
    created_at: Instant,
    expires_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    size_bytes: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct L1Statistics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired_drops: u64,
    pub entries: usize,
    pub approximate_bytes: usize,
}

struct L1Inner {
    entries: HashMap<String, L1Entry>,
    current_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expired_drops: u64,
}

/// In-process cache with strict entry and byte bounds.
pub struct L1Cache {
    inner: std::sync::Mutex<L1Inner>,
    config: L1CacheConfig,
}

impl L1Cache {
    pub fn new(config: L1CacheConfig) -> Self {
        Self {
            inner: std::sync::Mutex::new(L1Inner {
                entries: HashMap::new(),
                current_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expired_drops: 0,
            }),
            config,
        }
    }

    pub fn get(&self, key: &str) -> Option<CachedValue> {
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        let now = Instant::now();
        let expired = matches!(inner.entries.get(key), Some(entry) if entry.expires_at <= now);
        if expired {
            if let Some(entry) = inner.entries.remove(key) {
                inner.current_bytes = inner.current_bytes.saturating_sub(entry.size_bytes);
            }
            inner.expired_drops += 1;
            inner.misses += 1;
            return None;
        }
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed = now;
                entry.access_count += 1;
                let cached = CachedValue {
                    value: entry.value.clone(),
                    tags: entry.tags.clone(),
                };
                inner.hits += 1;
                Some(cached)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn put(&self, key: &str, value: Value, tags: Vec<String>, ttl: Duration) {
        let size_bytes = value.to_string().len();
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        // Replace first so the capacity check sees the net state
        if let Some(old) = inner.entries.remove(key) {
            inner.current_bytes = inner.current_bytes.saturating_sub(old.size_bytes);
        }
        self.evict_until_capacity(&mut inner, size_bytes);
        let now = Instant::now();
        inner.entries.insert(
            key.to_string(),
            L1Entry {
                value,
                tags,
                created_at: now,
                expires_at: now + ttl,
                last_accessed: now,
                access_count: 0,
                size_bytes,
            },
        );
        inner.current_bytes += size_bytes;
    }

    pub fn remove(&self, key: &str) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        match inner.entries.remove(key) {
            Some(entry) => {
                inner.current_bytes = inner.current_bytes.saturating_sub(entry.size_bytes);
                true
            }
            None => false,
        }
    }

    /// Remove every entry whose tags intersect `tags`; returns the count.
    pub fn remove_by_tags(&self, tags: &[String]) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let victims: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.tags.iter().any(|t| tags.contains(t)))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &victims {
            if let Some(entry) = inner.entries.remove(key) {
                inner.current_bytes = inner.current_bytes.saturating_sub(entry.size_bytes);
            }
        }
        victims.len()
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
            inner.current_bytes = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn statistics(&self) -> L1Statistics {
        self.inner
            .lock()
            .map(|inner| L1Statistics {
                hits: inner.hits,
                misses: inner.misses,
                evictions: inner.evictions,
                expired_drops: inner.expired_drops,
                entries: inner.entries.len(),
                approximate_bytes: inner.current_bytes,
            })
            .unwrap_or_default()
    }

    fn evict_until_capacity(&self, inner: &mut L1Inner, incoming_bytes: usize) {
        while !inner.entries.is_empty()
            && (inner.entries.len() >= self.config.max_entries
                || inner.current_bytes + incoming_bytes > self.config.max_bytes)
        {
            let victim = self.pick_victim(inner);
            if let Some(key) = victim {
                if let Some(entry) = inner.entries.remove(&key) {
                    inner.current_bytes = inner.current_bytes.saturating_sub(entry.size_bytes);
                    inner.evictions += 1;
                }
            } else {
                break;
            }
        }
    }

    fn pick_victim(&self, inner: &L1Inner) -> Option<String> {
        let now = Instant::now();
        // Expired entries go first regardless of strategy
        if let Some((key, _)) = inner.entries.iter().find(|(_, e)| e.expires_at <= now) {
            return Some(key.clone());
        }
        match self.config.eviction {
            EvictionStrategy::Lru => inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone()),
            EvictionStrategy::TtlFirst => inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone()),
            EvictionStrategy::SizeBased => inner
                .entries
                .iter()
                .max_by_key(|(_, e)| e.size_bytes)
                .map(|(k, _)| k.clone()),
            EvictionStrategy::Random => {
                let index = rand::thread_rng().gen_range(0..inner.entries.len());
                inner.entries.keys().nth(index).cloned()
            }
        }
    }
}

/// L2: distributed cache shared between processes. Tag support is optional;
/// backends without it return `None` from `keys_for_tags` and rely on the
/// durable tier's tag mappings.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> EngineResult<Option<CachedValue>>;

    async fn set(&self, key: &str, value: &CachedValue, ttl: Duration) -> EngineResult<()>;

    async fn delete(&self, keys: &[String]) -> EngineResult<()>;

    async fn keys_for_tags(&self, tags: &[String]) -> EngineResult<Option<Vec<String>>> {
        let _ = tags;
        Ok(None)
    }
}

/// L3: durable cache with explicit tag-to-key mappings.
#[async_trait]
pub trait DurableCache: Send + Sync {
    async fn get(&self, key: &str) -> EngineResult<Option<CachedValue>>;

    async fn set(&self, key: &str, value: &CachedValue, ttl: Duration) -> EngineResult<()>;

    async fn delete(&self, keys: &[String]) -> EngineResult<()>;

    async fn add_tag_mappings(&self, key: &str, tags: &[String]) -> EngineResult<()>;

    async fn keys_for_tags(&self, tags: &[String]) -> EngineResult<Vec<String>>;

    async fn purge_expired(&self) -> EngineResult<usize>;
}

struct TimedValue {
    cached: CachedValue,
    expires_at: Instant,
}

/// In-memory L2 with tag support.
pub struct InMemoryDistributedCache {
    values: RwLock<HashMap<String, TimedValue>>,
    tag_index: RwLock<HashMap<String, HashSet<String>>>,
}

impl InMemoryDistributedCache {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            tag_index: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryDistributedCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedCache for InMemoryDistributedCache {
    fn name(&self) -> &str {
        "memory-l2"
    }

    async fn get(&self, key: &str) -> EngineResult<Option<CachedValue>> {
        let values = self.values.read().await;
        Ok(values
            .get(key)
            .filter(|v| v.expires_at > Instant::now())
            .map(|v| v.cached.clone()))
    }

    async fn set(&self, key: &str, value: &CachedValue, ttl: Duration) -> EngineResult<()> {
        {
            let mut values = self.values.write().await;
            values.insert(
                key.to_string(),
                TimedValue {
                    cached: value.clone(),
                    expires_at: Instant::now() + ttl,
                },
            );
        }
        let mut index = self.tag_index.write().await;
        for tag in &value.tags {
            index.entry(tag.clone()).or_default().insert(key.to_string());
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> EngineResult<()> {
        let mut values = self.values.write().await;
        for key in keys {
            values.remove(key);
        }
        Ok(())
    }

    async fn keys_for_tags(&self, tags: &[String]) -> EngineResult<Option<Vec<String>>> {
        let index = self.tag_index.read().await;
        let mut keys = HashSet::new();
        for tag in tags {
            if let Some(tagged) = index.get(tag) {
                keys.extend(tagged.iter().cloned());
            }
        }
        Ok(Some(keys.into_iter().collect()))
    }
}

/// In-memory L3 with explicit tag mappings.
pub struct InMemoryDurableCache {
    values: RwLock<HashMap<String, TimedValue>>,
    tag_index: RwLock<HashMap<String, HashSet<String>>>,
}

impl InMemoryDurableCache {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            tag_index: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryDurableCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableCache for InMemoryDurableCache {
    async fn get(&self, key: &str) -> EngineResult<Option<CachedValue>> {
        let values = self.values.read().await;
        Ok(values
            .get(key)
            .filter(|v| v.expires_at > Instant::now())
            .map(|v| v.cached.clone()))
    }

    async fn set(&self, key: &str, value: &CachedValue, ttl: Duration) -> EngineResult<()> {
        let mut values = self.values.write().await;
        values.insert(
            key.to_string(),
            TimedValue {
                cached: value.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> EngineResult<()> {
        let mut values = self.values.write().await;
        for key in keys {
            values.remove(key);
        }
        Ok(())
    }

    async fn add_tag_mappings(&self, key: &str, tags: &[String]) -> EngineResult<()> {
        let mut index = self.tag_index.write().await;
        for tag in tags {
            index.entry(tag.clone()).or_default().insert(key.to_string());
        }
        Ok(())
    }

    async fn keys_for_tags(&self, tags: &[String]) -> EngineResult<Vec<String>> {
        let index = self.tag_index.read().await;
        let mut keys = HashSet::new();
        for tag in tags {
            if let Some(tagged) = index.get(tag) {
                keys.extend(tagged.iter().cloned());
            }
        }
        Ok(keys.into_iter().collect())
    }

    async fn purge_expired(&self) -> EngineResult<usize> {
        let mut values = self.values.write().await;
        let before = values.len();
        let now = Instant::now();
        values.retain(|_, v| v.expires_at > now);
        Ok(before - values.len())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationBatcherConfig {
    pub batch_size: usize,
    pub max_batches_per_second: u32,
}

impl Default for InvalidationBatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_batches_per_second: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCacheConfig {
    /// TTL applied to L1/L2 entries
    pub default_ttl_seconds: u64,
    /// L3 entries live this many times longer
    pub l3_ttl_multiplier: u32,
    pub l1: L1CacheConfig,
    pub batcher: InvalidationBatcherConfig,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 300,
            l3_ttl_multiplier: 2,
            l1: L1CacheConfig::default(),
            batcher: InvalidationBatcherConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryCacheStatistics {
    pub total_requests: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l3_hits: u64,
    pub misses: u64,
    pub invalidations_queued: u64,
    pub invalidation_batches: u64,
    pub forced_invalidations: u64,
    pub l1: L1Statistics,
}

/// Orchestrates the three tiers: probe L1 → L2 → L3, promote upward on hit,
/// fill every tier on miss.
pub struct QueryCacheManager {
    l1: L1Cache,
    l2: Option<Arc<dyn DistributedCache>>,
    l3: Option<Arc<dyn DurableCache>>,
    config: QueryCacheConfig,
    pending_tags: AsyncMutex<VecDeque<String>>,
    stats: std::sync::Mutex<QueryCacheStatistics>,
}

impl QueryCacheManager {
    pub fn new(config: QueryCacheConfig) -> Self {
        Self {
            l1: L1Cache::new(config.l1.clone()),
            l2: None,
            l3: None,
            config,
            pending_tags: AsyncMutex::new(VecDeque::new()),
            stats: std::sync::Mutex::new(QueryCacheStatistics::default()),
        }
    }

    pub fn with_l2(mut self, l2: Arc<dyn DistributedCache>) -> Self {
        self.l2 = Some(l2);
        self
    }

    pub fn with_l3(mut self, l3: Arc<dyn DurableCache>) -> Self {
        self.l3 = Some(l3);
        self
    }

    fn l1_ttl(&self, override_seconds: Option<u64>) -> Duration {
        Duration::from_secs(override_seconds.unwrap_or(self.config.default_ttl_seconds))
    }

    fn l3_ttl(&self, override_seconds: Option<u64>) -> Duration {
        self.l1_ttl(override_seconds) * self.config.l3_ttl_multiplier.max(1)
    }

    /// Probe the tiers in order, promoting hits upward.
    pub async fn get(&self, key: &str, ttl_seconds: Option<u64>) -> Option<(Value, CacheTier)> {
        self.bump(|s| s.total_requests += 1);

        if let Some(cached) = self.l1.get(key) {
            self.bump(|s| s.l1_hits += 1);
            return Some((cached.value, CacheTier::L1));
        }

        if let Some(l2) = &self.l2 {
            match l2.get(key).await {
                Ok(Some(cached)) => {
                    self.l1.put(
                        key,
                        cached.value.clone(),
                        cached.tags.clone(),
                        self.l1_ttl(ttl_seconds),
                    );
                    self.bump(|s| s.l2_hits += 1);
                    return Some((cached.value, CacheTier::L2));
                }
                Ok(None) => {}
                Err(err) => warn!(key, error = %err, "L2 cache read failed"),
            }
        }

        if let Some(l3) = &self.l3 {
            match l3.get(key).await {
                Ok(Some(cached)) => {
                    if let Some(l2) = &self.l2 {
                        if let Err(err) = l2.set(key, &cached, self.l1_ttl(ttl_seconds)).await {
                            warn!(key, error = %err, "L2 promotion failed");
                        }
                    }
                    self.l1.put(
                        key,
                        cached.value.clone(),
                        cached.tags.clone(),
                        self.l1_ttl(ttl_seconds),
                    );
                    self.bump(|s| s.l3_hits += 1);
                    return Some((cached.value, CacheTier::L3));
                }
                Ok(None) => {}
                Err(err) => warn!(key, error = %err, "L3 cache read failed"),
            }
        }

        self.bump(|s| s.misses += 1);
        None
    }

    /// Write a fresh result to every tier.
    pub async fn put(
        &self,
        key: &str,
        value: &Value,
        tags: &[String],
        ttl_seconds: Option<u64>,
    ) {
        let cached = CachedValue {
            value: value.clone(),
            tags: tags.to_vec(),
        };
        self.l1
            .put(key, value.clone(), tags.to_vec(), self.l1_ttl(ttl_seconds));
        if let Some(l2) = &self.l2 {
            if let Err(err) = l2.set(key, &cached, self.l1_ttl(ttl_seconds)).await {
                warn!(key, error = %err, "L2 cache write failed");
            }
        }
        if let Some(l3) = &self.l3 {
            if let Err(err) = l3.set(key, &cached, self.l3_ttl(ttl_seconds)).await {
                warn!(key, error = %err, "L3 cache write failed");
            } else if let Err(err) = l3.add_tag_mappings(key, tags).await {
                warn!(key, error = %err, "L3 tag mapping write failed");
            }
        }
    }

    /// Clear matching L1 entries immediately; queue L2/L3 clearing through
    /// the rate-limited batcher.
    pub async fn invalidate_tags(&self, tags: &[String]) {
        let removed = self.l1.remove_by_tags(tags);
        debug!(tags = ?tags, l1_removed = removed, "queued tag invalidation");
        let mut pending = self.pending_tags.lock().await;
        for tag in tags {
            if !pending.contains(tag) {
                pending.push_back(tag.clone());
            }
        }
        self.bump(|s| s.invalidations_queued += tags.len() as u64);
    }

    /// Clear every tier for the matching tags, bypassing the batcher.
    pub async fn force_invalidate_tags(&self, tags: &[String]) -> EngineResult<()> {
        self.l1.remove_by_tags(tags);
        let keys = self.resolve_keys(tags).await?;
        self.delete_lower_tiers(&keys).await?;
        self.bump(|s| s.forced_invalidations += 1);
        Ok(())
    }

    /// Process one batch of queued tags. Failed batches re-queue their tags.
    /// Returns the number of tags processed.
    pub async fn flush_invalidations(&self) -> EngineResult<usize> {
        let batch: Vec<String> = {
            let mut pending = self.pending_tags.lock().await;
            let take = self.config.batcher.batch_size.min(pending.len());
            pending.drain(..take).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let result = async {
            let keys = self.resolve_keys(&batch).await?;
            self.delete_lower_tiers(&keys).await
        }
        .await;

        match result {
            Ok(()) => {
                self.bump(|s| s.invalidation_batches += 1);
                Ok(batch.len())
            }
            Err(err) => {
                warn!(error = %err, tags = batch.len(), "invalidation batch failed, re-queueing");
                let mut pending = self.pending_tags.lock().await;
                for tag in batch {
                    pending.push_back(tag);
                }
                Err(err)
            }
        }
    }

    pub async fn pending_invalidations(&self) -> usize {
        self.pending_tags.lock().await.len()
    }

    /// Background worker draining the invalidation queue at the configured
    /// rate.
    pub fn start_invalidation_worker(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self;
        let period =
            Duration::from_secs_f64(1.0 / manager.config.batcher.max_batches_per_second.max(1) as f64);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let _ = manager.flush_invalidations().await;
            }
        })
    }

    async fn resolve_keys(&self, tags: &[String]) -> EngineResult<Vec<String>> {
        let mut keys = HashSet::new();
        if let Some(l3) = &self.l3 {
            keys.extend(l3.keys_for_tags(tags).await?);
        }
        if let Some(l2) = &self.l2 {
            if let Some(l2_keys) = l2.keys_for_tags(tags).await? {
                keys.extend(l2_keys);
            }
        }
        Ok(keys.into_iter().collect())
    }

    async fn delete_lower_tiers(&self, keys: &[String]) -> EngineResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        if let Some(l2) = &self.l2 {
            l2.delete(keys).await?;
        }
        if let Some(l3) = &self.l3 {
            l3.delete(keys).await?;
        }
        Ok(())
    }

    fn bump(&self, f: impl FnOnce(&mut QueryCacheStatistics)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    pub fn statistics(&self) -> QueryCacheStatistics {
        let mut stats = self
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.l1 = self.l1.statistics();
        stats
    }
}

#[async_trait]
impl CacheTagInvalidator for QueryCacheManager {
    async fn invalidate_tags(&self, tags: &[String]) -> EngineResult<()> {
        QueryCacheManager::invalidate_tags(self, tags).await;
        Ok(())
    }
}
