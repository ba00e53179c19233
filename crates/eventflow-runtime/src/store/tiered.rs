//! Tiered event store: hot cache over a durable warm store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use eventflow_core::{AggregateId, EngineError, EngineResult, EventEnvelope, EventStream};

use super::hot::{HotEventCache, HotStoreConfig, HotStoreStatistics};
use super::{AppendOutcome, EventStore, EventStoreStatistics};
use crate::jobs::{InMemoryJobQueue, Job, JobHandler, JobQueue};

/// Job type used for asynchronous durable persistence
pub const WRITE_BACK_JOB_TYPE: &str = "event_store.write_back";

/// How appends reach the warm store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Persist synchronously before returning
    WriteThrough,
    /// Persist through a durable background job with at-least-once semantics
    WriteBehind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBackConfig {
    /// Attempts before a failed write-back lands in the dead-letter area
    pub max_attempts: u32,
}

impl Default for WriteBackConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredStoreConfig {
    pub hot: HotStoreConfig,
    pub write_mode: WriteMode,
    pub write_back: WriteBackConfig,
}

impl Default for TieredStoreConfig {
    fn default() -> Self {
        Self {
            hot: HotStoreConfig::default(),
            write_mode: WriteMode::WriteThrough,
            write_back: WriteBackConfig::default(),
        }
    }
}

/// A write-back append that exhausted its retries, held for operator
/// intervention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBackDeadLetter {
    pub dead_letter_id: Uuid,
    pub aggregate_id: AggregateId,
    pub expected_version: Option<i64>,
    pub events: Vec<EventEnvelope>,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WriteBackPayload {
    aggregate_id: AggregateId,
    expected_version: Option<i64>,
    events: Vec<EventEnvelope>,
}

/// Facade composing the hot cache and the warm store.
///
/// Reads go hot-first with best-effort promotion on warm hits. Appends write
/// hot first so follow-up reads within the request observe the new events,
/// then persist to warm either synchronously ([`WriteMode::WriteThrough`]) or
/// through a durable job ([`WriteMode::WriteBehind`]). Optimistic concurrency
/// is enforced at the point of durable insertion; a conflict invalidates the
/// hot entry and propagates to the caller.
pub struct TieredEventStore {
    hot: Arc<HotEventCache>,
    warm: Arc<dyn EventStore>,
    jobs: Option<Arc<dyn JobQueue>>,
    dead_letters: Arc<RwLock<Vec<WriteBackDeadLetter>>>,
    config: TieredStoreConfig,
}

impl TieredEventStore {
    /// Tiered store persisting synchronously to the warm store.
    pub fn write_through(warm: Arc<dyn EventStore>, config: TieredStoreConfig) -> Self {
        log_tier_configuration(&config);
        Self {
            hot: Arc::new(HotEventCache::new(config.hot.clone())),
            warm,
            jobs: None,
            dead_letters: Arc::new(RwLock::new(Vec::new())),
            config: TieredStoreConfig {
                write_mode: WriteMode::WriteThrough,
                ..config
            },
        }
    }

    /// Tiered store persisting through the given job queue. Registers the
    /// write-back handler on the queue.
    pub async fn write_behind(
        warm: Arc<dyn EventStore>,
        config: TieredStoreConfig,
        queue: Arc<InMemoryJobQueue>,
    ) -> Self {
        log_tier_configuration(&config);
        let hot = Arc::new(HotEventCache::new(config.hot.clone()));
        let dead_letters = Arc::new(RwLock::new(Vec::new()));
        // The handler must dead-letter no later than the queue stops
        // retrying, or failed appends would vanish silently.
        let max_attempts = config
            .write_back
            .max_attempts
            .min(queue.config().max_attempts);
        queue
            .register_handler(Arc::new(WriteBackHandler {
                warm: Arc::clone(&warm),
                hot: Arc::clone(&hot),
                dead_letters: Arc::clone(&dead_letters),
                max_attempts,
            }))
            .await;
        Self {
            hot,
            warm,
            jobs: Some(queue as Arc<dyn JobQueue>),
            dead_letters,
            config: TieredStoreConfig {
                write_mode: WriteMode::WriteBehind,
                ..config
            },
        }
    }

    pub fn hot_store(&self) -> &Arc<HotEventCache> {
        &self.hot
    }

    pub fn warm_store(&self) -> &Arc<dyn EventStore> {
        &self.warm
    }

    /// Write-back appends that exhausted their retries.
    pub async fn write_back_dead_letters(&self) -> Vec<WriteBackDeadLetter> {
        self.dead_letters.read().await.clone()
    }

    /// Resubmit a dead-lettered write-back append.
    pub async fn requeue_write_back(&self, dead_letter_id: Uuid) -> EngineResult<bool> {
        let entry = {
            let mut dead = self.dead_letters.write().await;
            match dead.iter().position(|d| d.dead_letter_id == dead_letter_id) {
                Some(index) => dead.remove(index),
                None => return Ok(false),
            }
        };
        let jobs = self.jobs.as_ref().ok_or_else(|| EngineError::Configuration {
            message: "write-back requeue requires a job queue".to_string(),
        })?;
        let payload = serde_json::to_value(WriteBackPayload {
            aggregate_id: entry.aggregate_id,
            expected_version: entry.expected_version,
            events: entry.events,
        })?;
        jobs.submit(WRITE_BACK_JOB_TYPE, payload).await?;
        Ok(true)
    }

    pub async fn hot_statistics(&self) -> HotStoreStatistics {
        self.hot.statistics().await
    }

    /// Periodic hot-store TTL sweep.
    pub fn start_hot_sweep(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let hot = Arc::clone(&self.hot);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let evicted = hot.evict_expired().await;
                if evicted > 0 {
                    debug!(evicted, "hot store sweep evicted expired entries");
                }
            }
        })
    }

    async fn append_write_through(
        &self,
        aggregate_id: &AggregateId,
        events: &[EventEnvelope],
        expected_version: Option<i64>,
    ) -> EngineResult<AppendOutcome> {
        self.hot.extend(aggregate_id, events).await;
        match self.warm.append(aggregate_id, events, expected_version).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if matches!(err, EngineError::ConcurrencyConflict { .. }) {
                    self.hot.invalidate(aggregate_id).await;
                }
                Err(err)
            }
        }
    }

    async fn append_write_behind(
        &self,
        aggregate_id: &AggregateId,
        events: &[EventEnvelope],
        expected_version: Option<i64>,
    ) -> EngineResult<AppendOutcome> {
        // Fast-fail on conflicts already visible in the hot tier; the
        // authoritative check happens at durable insertion.
        if let (Some(expected), Some(hot_version)) =
            (expected_version, self.hot.version(aggregate_id).await)
        {
            if hot_version != expected {
                return Err(EngineError::ConcurrencyConflict {
                    aggregate_id: aggregate_id.to_string(),
                    expected,
                    actual: hot_version,
                });
            }
        }

        let jobs = self.jobs.as_ref().ok_or_else(|| EngineError::Configuration {
            message: "write-behind mode requires a job queue".to_string(),
        })?;

        self.hot.extend(aggregate_id, events).await;

        let payload = serde_json::to_value(WriteBackPayload {
            aggregate_id: aggregate_id.clone(),
            expected_version,
            events: events.to_vec(),
        })?;
        jobs.submit(WRITE_BACK_JOB_TYPE, payload).await?;

        Ok(AppendOutcome {
            aggregate_version: events.last().map(|e| e.version).unwrap_or(0),
            sequence_range: None,
        })
    }
}

#[async_trait]
impl EventStore for TieredEventStore {
    async fn append(
        &self,
        aggregate_id: &AggregateId,
        events: &[EventEnvelope],
        expected_version: Option<i64>,
    ) -> EngineResult<AppendOutcome> {
        if events.is_empty() {
            let version = self.aggregate_version(aggregate_id).await?;
            return Ok(AppendOutcome {
                aggregate_version: version,
                sequence_range: None,
            });
        }
        match self.config.write_mode {
            WriteMode::WriteThrough => {
                self.append_write_through(aggregate_id, events, expected_version)
                    .await
            }
            WriteMode::WriteBehind => {
                self.append_write_behind(aggregate_id, events, expected_version)
                    .await
            }
        }
    }

    async fn load(
        &self,
        aggregate_id: &AggregateId,
        from_version: i64,
        to_version: Option<i64>,
    ) -> EngineResult<EventStream> {
        if let Some(hot_version) = self.hot.version(aggregate_id).await {
            let covered = from_version <= hot_version
                && to_version.map(|to| to <= hot_version).unwrap_or(true);
            if covered {
                if let Some(stream) = self.hot.get(aggregate_id, from_version, to_version).await {
                    return Ok(stream);
                }
            }
        }

        if from_version == 1 && to_version.is_none() {
            let stream = self.warm.load(aggregate_id, 1, None).await?;
            if !stream.is_empty() {
                self.hot.promote(aggregate_id, &stream).await;
            }
            Ok(stream)
        } else {
            self.warm.load(aggregate_id, from_version, to_version).await
        }
    }

    async fn load_batch(
        &self,
        aggregate_ids: &[AggregateId],
        from_version: i64,
        to_version: Option<i64>,
    ) -> EngineResult<HashMap<AggregateId, EventStream>> {
        let mut result = HashMap::with_capacity(aggregate_ids.len());
        let mut misses = Vec::new();
        for id in aggregate_ids {
            match self.hot.get(id, from_version, to_version).await {
                Some(stream) if !stream.is_empty() => {
                    result.insert(id.clone(), stream);
                }
                _ => misses.push(id.clone()),
            }
        }
        if !misses.is_empty() {
            let warm_result = self
                .warm
                .load_batch(&misses, from_version, to_version)
                .await?;
            result.extend(warm_result);
        }
        Ok(result)
    }

    async fn aggregate_exists(&self, aggregate_id: &AggregateId) -> EngineResult<bool> {
        if self.hot.version(aggregate_id).await.is_some() {
            return Ok(true);
        }
        self.warm.aggregate_exists(aggregate_id).await
    }

    async fn aggregate_exists_batch(
        &self,
        aggregate_ids: &[AggregateId],
    ) -> EngineResult<HashMap<AggregateId, bool>> {
        self.warm.aggregate_exists_batch(aggregate_ids).await
    }

    async fn aggregate_version(&self, aggregate_id: &AggregateId) -> EngineResult<i64> {
        if let Some(version) = self.hot.version(aggregate_id).await {
            return Ok(version);
        }
        self.warm.aggregate_version(aggregate_id).await
    }

    async fn aggregate_versions_batch(
        &self,
        aggregate_ids: &[AggregateId],
    ) -> EngineResult<HashMap<AggregateId, i64>> {
        self.warm.aggregate_versions_batch(aggregate_ids).await
    }

    async fn load_events_by_type(
        &self,
        event_type: &str,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<EventEnvelope>> {
        self.warm.load_events_by_type(event_type, limit, offset).await
    }

    async fn load_events_from_sequence(
        &self,
        from_sequence: i64,
        limit: usize,
    ) -> EngineResult<Vec<EventEnvelope>> {
        self.warm
            .load_events_from_sequence(from_sequence, limit)
            .await
    }

    async fn latest_sequence(&self) -> EngineResult<i64> {
        self.warm.latest_sequence().await
    }

    async fn statistics(&self) -> EngineResult<EventStoreStatistics> {
        self.warm.statistics().await
    }
}

/// Durable-persistence job for write-behind appends.
struct WriteBackHandler {
    warm: Arc<dyn EventStore>,
    hot: Arc<HotEventCache>,
    dead_letters: Arc<RwLock<Vec<WriteBackDeadLetter>>>,
    max_attempts: u32,
}

#[async_trait]
impl JobHandler for WriteBackHandler {
    fn job_type(&self) -> &str {
        WRITE_BACK_JOB_TYPE
    }

    async fn execute(&self, job: &Job) -> EngineResult<()> {
        let payload: WriteBackPayload = serde_json::from_value(job.payload.clone())?;
        match self
            .warm
            .append(
                &payload.aggregate_id,
                &payload.events,
                payload.expected_version,
            )
            .await
        {
            Ok(outcome) => {
                debug!(
                    aggregate_id = %payload.aggregate_id,
                    events = payload.events.len(),
                    sequence_range = ?outcome.sequence_range,
                    "write-back persisted"
                );
                Ok(())
            }
            Err(err) => {
                let permanent = !err.is_retryable() || job.attempt >= self.max_attempts;
                if permanent {
                    error!(
                        aggregate_id = %payload.aggregate_id,
                        attempt = job.attempt,
                        error = %err,
                        error_code = err.code(),
                        "write-back failed permanently, dead-lettering"
                    );
                    if matches!(err, EngineError::ConcurrencyConflict { .. }) {
                        // Another writer won: the hot entry no longer matches
                        // the durable stream and must not keep serving it.
                        self.hot.invalidate(&payload.aggregate_id).await;
                    }
                    // For any other permanent failure hot keeps the only
                    // remaining copy of these events until the dead letter
                    // is requeued; the TTL sweep bounds its lifetime.
                    let mut dead = self.dead_letters.write().await;
                    dead.push(WriteBackDeadLetter {
                        dead_letter_id: Uuid::new_v4(),
                        aggregate_id: payload.aggregate_id.clone(),
                        expected_version: payload.expected_version,
                        events: payload.events.clone(),
                        attempts: job.attempt,
                        last_error: err.to_string(),
                        failed_at: Utc::now(),
                    });
                } else {
                    warn!(
                        aggregate_id = %payload.aggregate_id,
                        attempt = job.attempt,
                        error = %err,
                        "write-back failed, will retry"
                    );
                }
                Err(err)
            }
        }
    }
}

/// Log a summary of the tiers at startup.
pub fn log_tier_configuration(config: &TieredStoreConfig) {
    info!(
        write_mode = ?config.write_mode,
        hot_ttl_seconds = config.hot.ttl_seconds,
        hot_max_aggregates = config.hot.max_aggregates,
        "tiered event store configured"
    );
}
