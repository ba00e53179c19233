//! Query bus: handler selection, multi-tier caching, batch optimization.

pub mod cache;

pub use cache::{
    CacheTier, CachedValue, DistributedCache, DurableCache, EvictionStrategy,
    InMemoryDistributedCache, InMemoryDurableCache, InvalidationBatcherConfig, L1Cache,
    L1CacheConfig, L1Statistics, QueryCacheConfig, QueryCacheManager, QueryCacheStatistics,
};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use eventflow_core::{EngineError, EngineResult, MessageKind};

use crate::auth::{PolicySet, Principal};

/// Metadata traveling with every query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub principal: Option<Principal>,
    pub correlation_id: Option<Uuid>,
    /// Bypass every cache tier for this execution
    pub skip_cache: bool,
}

/// Type-erased query: stable type tag, serialized payload, and the
/// self-declared cache fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEnvelope {
    pub query_id: Uuid,
    pub query_type: String,
    pub payload: Value,
    pub cache_key: String,
    pub cache_tags: Vec<String>,
    pub cache_ttl_seconds: Option<u64>,
    pub metadata: QueryMetadata,
}

impl QueryEnvelope {
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.metadata.principal = Some(principal);
        self
    }

    pub fn skipping_cache(mut self) -> Self {
        self.metadata.skip_cache = true;
        self
    }

    pub fn decode<Q: Query>(&self) -> EngineResult<Q> {
        serde_json::from_value(self.payload.clone()).map_err(|e| EngineError::Serialization {
            message: format!("failed to decode '{}' query payload: {}", self.query_type, e),
        })
    }
}

/// Typed read-only query. Each query yields its own cache key and tags; the
/// bus never derives them by introspection.
pub trait Query: Serialize + DeserializeOwned + Send + Sync {
    fn query_type() -> &'static str;

    /// Stable fingerprint for cache lookups.
    fn cache_key(&self) -> String;

    fn cache_tags(&self) -> Vec<String> {
        Vec::new()
    }

    /// Override the configured cache TTL for this query.
    fn cache_ttl(&self) -> Option<Duration> {
        None
    }

    fn envelope(&self) -> EngineResult<QueryEnvelope> {
        Ok(QueryEnvelope {
            query_id: Uuid::new_v4(),
            query_type: Self::query_type().to_string(),
            payload: serde_json::to_value(self)?,
            cache_key: self.cache_key(),
            cache_tags: self.cache_tags(),
            cache_ttl_seconds: self.cache_ttl().map(|d| d.as_secs()),
            metadata: QueryMetadata::default(),
        })
    }
}

/// Handles queries of one type. Several handlers may serve the same type;
/// the bus picks the one with the smallest estimated execution time among
/// those whose `can_handle` accepts the query.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    fn name(&self) -> &str;

    fn query_type(&self) -> &str;

    fn can_handle(&self, query: &QueryEnvelope) -> bool {
        query.query_type == self.query_type()
    }

    fn estimated_execution_time_ms(&self) -> u64 {
        10
    }

    async fn handle(&self, query: QueryEnvelope) -> EngineResult<Value>;

    /// Whether this handler implements the batch interface.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Batch-capable handlers may still decline small or mixed groups.
    fn should_use_batch_optimization(&self, queries: &[QueryEnvelope]) -> bool {
        queries.len() > 1
    }

    /// Execute a group in one call, returning results in input order.
    async fn handle_batch(&self, queries: Vec<QueryEnvelope>) -> EngineResult<Vec<Value>> {
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            results.push(self.handle(query).await?);
        }
        Ok(results)
    }
}

/// One entry of a batch execution, in input order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchQueryResult {
    pub cache_key: String,
    pub value: Value,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryHandlerStatistics {
    pub executions: u64,
    pub average_execution_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryBusStatistics {
    pub total_queries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub average_execution_ms: f64,
    pub per_handler: HashMap<String, QueryHandlerStatistics>,
}

impl QueryBusStatistics {
    fn record_execution(&mut self, handler: &str, duration_ms: f64) {
        let executed = self.total_queries - self.cache_hits;
        self.average_execution_ms = if executed <= 1 {
            duration_ms
        } else {
            (self.average_execution_ms * (executed - 1) as f64 + duration_ms) / executed as f64
        };
        let entry = self.per_handler.entry(handler.to_string()).or_default();
        entry.executions += 1;
        let n = entry.executions as f64;
        entry.average_execution_ms = (entry.average_execution_ms * (n - 1.0) + duration_ms) / n;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryBusConfig {
    /// How long a memoized handler selection stays valid
    pub selection_ttl_seconds: u64,
}

impl Default for QueryBusConfig {
    fn default() -> Self {
        Self {
            selection_ttl_seconds: 60,
        }
    }
}

/// Mediates read-only queries: authorize, probe the cache tiers, execute the
/// cheapest capable handler, fill the tiers.
pub struct QueryBus {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn QueryHandler>>>>,
    selection_cache: RwLock<HashMap<String, (String, Instant)>>,
    cache: Option<Arc<QueryCacheManager>>,
    policies: Option<PolicySet>,
    statistics: Mutex<QueryBusStatistics>,
    config: QueryBusConfig,
}

impl QueryBus {
    pub fn new(config: QueryBusConfig) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            selection_cache: RwLock::new(HashMap::new()),
            cache: None,
            policies: None,
            statistics: Mutex::new(QueryBusStatistics::default()),
            config,
        }
    }

    pub fn with_cache(mut self, cache: Arc<QueryCacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_policies(mut self, policies: PolicySet) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn cache_manager(&self) -> Option<&Arc<QueryCacheManager>> {
        self.cache.as_ref()
    }

    pub async fn register_handler(&self, handler: Arc<dyn QueryHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers
            .entry(handler.query_type().to_string())
            .or_default()
            .push(handler);
        // New handlers invalidate the memoized selection for their type
        drop(handlers);
        self.selection_cache.write().await.clear();
    }

    /// Execute a typed query.
    pub async fn execute_query<Q: Query>(&self, query: &Q) -> EngineResult<Value> {
        self.execute(query.envelope()?).await
    }

    /// Execute one query envelope through the read path.
    pub async fn execute(&self, query: QueryEnvelope) -> EngineResult<Value> {
        self.authorize(&query)?;
        {
            let mut stats = self.statistics.lock().await;
            stats.total_queries += 1;
        }

        if !query.metadata.skip_cache {
            if let Some(cache) = &self.cache {
                if let Some((value, tier)) =
                    cache.get(&query.cache_key, query.cache_ttl_seconds).await
                {
                    debug!(
                        query_type = %query.query_type,
                        cache_key = %query.cache_key,
                        tier = ?tier,
                        "query served from cache"
                    );
                    let mut stats = self.statistics.lock().await;
                    stats.cache_hits += 1;
                    return Ok(value);
                }
            }
        }

        {
            let mut stats = self.statistics.lock().await;
            stats.cache_misses += 1;
        }

        let handler = self.select_handler(&query).await?;
        let started = Instant::now();
        let value = handler.handle(query.clone()).await?;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        {
            let mut stats = self.statistics.lock().await;
            stats.record_execution(handler.name(), duration_ms);
        }

        if !query.metadata.skip_cache {
            if let Some(cache) = &self.cache {
                cache
                    .put(
                        &query.cache_key,
                        &value,
                        &query.cache_tags,
                        query.cache_ttl_seconds,
                    )
                    .await;
            }
        }

        Ok(value)
    }

    /// Execute a batch of queries, merging cache hits with grouped handler
    /// execution. Results preserve input order.
    pub async fn execute_batch(
        &self,
        queries: Vec<QueryEnvelope>,
    ) -> EngineResult<Vec<BatchQueryResult>> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        for query in &queries {
            self.authorize(query)?;
        }
        {
            let mut stats = self.statistics.lock().await;
            stats.total_queries += queries.len() as u64;
        }

        let mut slots: Vec<Option<BatchQueryResult>> = (0..queries.len()).map(|_| None).collect();

        // Cache pass
        let mut misses: Vec<usize> = Vec::new();
        for (index, query) in queries.iter().enumerate() {
            let cached = if query.metadata.skip_cache {
                None
            } else if let Some(cache) = &self.cache {
                cache.get(&query.cache_key, query.cache_ttl_seconds).await
            } else {
                None
            };
            match cached {
                Some((value, _)) => {
                    let mut stats = self.statistics.lock().await;
                    stats.cache_hits += 1;
                    drop(stats);
                    slots[index] = Some(BatchQueryResult {
                        cache_key: query.cache_key.clone(),
                        value,
                        from_cache: true,
                    });
                }
                None => {
                    let mut stats = self.statistics.lock().await;
                    stats.cache_misses += 1;
                    drop(stats);
                    misses.push(index);
                }
            }
        }

        // Group misses by selected handler
        let mut groups: HashMap<String, (Arc<dyn QueryHandler>, Vec<usize>)> = HashMap::new();
        for &index in &misses {
            let handler = self.select_handler(&queries[index]).await?;
            groups
                .entry(handler.name().to_string())
                .or_insert_with(|| (handler, Vec::new()))
                .1
                .push(index);
        }

        for (_, (handler, indexes)) in groups {
            let group: Vec<QueryEnvelope> =
                indexes.iter().map(|&i| queries[i].clone()).collect();
            let started = Instant::now();

            let values = if handler.supports_batch()
                && handler.should_use_batch_optimization(&group)
            {
                let values = handler.handle_batch(group).await?;
                if values.len() != indexes.len() {
                    return Err(EngineError::Configuration {
                        message: format!(
                            "batch handler '{}' returned {} results for {} queries",
                            handler.name(),
                            values.len(),
                            indexes.len()
                        ),
                    });
                }
                values
            } else {
                let mut values = Vec::with_capacity(group.len());
                for query in group {
                    values.push(handler.handle(query).await?);
                }
                values
            };

            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
            {
                let mut stats = self.statistics.lock().await;
                stats.record_execution(handler.name(), duration_ms);
            }

            for (&index, value) in indexes.iter().zip(values) {
                let query = &queries[index];
                if !query.metadata.skip_cache {
                    if let Some(cache) = &self.cache {
                        cache
                            .put(
                                &query.cache_key,
                                &value,
                                &query.cache_tags,
                                query.cache_ttl_seconds,
                            )
                            .await;
                    }
                }
                slots[index] = Some(BatchQueryResult {
                    cache_key: query.cache_key.clone(),
                    value,
                    from_cache: false,
                });
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }

    pub async fn statistics(&self) -> QueryBusStatistics {
        self.statistics.lock().await.clone()
    }

    fn authorize(&self, query: &QueryEnvelope) -> EngineResult<()> {
        if let Some(policies) = &self.policies {
            policies.authorize(
                &query.query_type,
                query.metadata.principal.as_ref(),
                &query.payload,
            )?;
        }
        Ok(())
    }

    /// Pick the cheapest capable handler, memoized per query type for a
    /// bounded TTL.
    async fn select_handler(&self, query: &QueryEnvelope) -> EngineResult<Arc<dyn QueryHandler>> {
        let selection_ttl = Duration::from_secs(self.config.selection_ttl_seconds);

        if let Some((name, selected_at)) = self
            .selection_cache
            .read()
            .await
            .get(&query.query_type)
            .cloned()
        {
            if selected_at.elapsed() < selection_ttl {
                let handlers = self.handlers.read().await;
                if let Some(handler) = handlers
                    .get(&query.query_type)
                    .and_then(|list| list.iter().find(|h| h.name() == name))
                {
                    if handler.can_handle(query) {
                        return Ok(Arc::clone(handler));
                    }
                }
            }
        }

        let handlers = self.handlers.read().await;
        let selected = handlers
            .get(&query.query_type)
            .and_then(|list| {
                list.iter()
                    .filter(|h| h.can_handle(query))
                    .min_by_key(|h| h.estimated_execution_time_ms())
            })
            .cloned()
            .ok_or_else(|| EngineError::HandlerNotFound {
                kind: MessageKind::Query,
                message_type: query.query_type.clone(),
            })?;
        drop(handlers);

        self.selection_cache.write().await.insert(
            query.query_type.clone(),
            (selected.name().to_string(), Instant::now()),
        );
        Ok(selected)
    }
}

impl Default for QueryBus {
    fn default() -> Self {
        Self::new(QueryBusConfig::default())
    }
}
