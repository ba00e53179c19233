//! Projection dispatch strategies.
//!
//! After a write commits, new events are offered to the pipeline through
//! strategies ordered by priority, each filtering on a glob pattern over the
//! event type: realtime applies projections inline (in the post-commit hook
//! when a transaction scope is active), async enqueues one durable job per
//! event, batched buffers events and flushes on size or age.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use eventflow_core::{EngineError, EngineResult, EventEnvelope};

use crate::jobs::{InMemoryJobQueue, Job, JobHandler, JobQueue};
use crate::projection::ProjectionManager;
use crate::repository::EventSink;
use crate::transaction::{hook, TransactionManager};

pub const REALTIME_PRIORITY: i32 = 100;
pub const ASYNC_PRIORITY: i32 = 50;
pub const BATCHED_PRIORITY: i32 = 25;

/// Job type for async projection application
pub const PROJECTION_APPLY_JOB_TYPE: &str = "projection.apply";

/// Glob pattern over event types: `*` matches any run of characters, `?`
/// matches one.
#[derive(Debug, Clone)]
pub struct EventTypePattern {
    raw: String,
    regex: Regex,
}

impl EventTypePattern {
    pub fn new(pattern: &str) -> EngineResult<Self> {
        let mut expression = String::with_capacity(pattern.len() + 8);
        expression.push('^');
        for ch in pattern.chars() {
            match ch {
                '*' => expression.push_str(".*"),
                '?' => expression.push('.'),
                c if regex_syntax_char(c) => {
                    expression.push('\\');
                    expression.push(c);
                }
                c => expression.push(c),
            }
        }
        expression.push('$');
        let regex = Regex::new(&expression).map_err(|e| EngineError::Configuration {
            message: format!("invalid event pattern '{}': {}", pattern, e),
        })?;
        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    /// Pattern matching every event type.
    pub fn match_all() -> Self {
        Self {
            raw: "*".to_string(),
            regex: Regex::new("^.*$").expect("static pattern"),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, event_type: &str) -> bool {
        self.regex.is_match(event_type)
    }
}

fn regex_syntax_char(c: char) -> bool {
    matches!(
        c,
        '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\'
    )
}

/// A way of moving committed events into the projection pipeline.
#[async_trait]
pub trait DispatchStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Higher priority strategies claim matching events first.
    fn priority(&self) -> i32;

    fn pattern(&self) -> &EventTypePattern;

    fn matches(&self, event: &EventEnvelope) -> bool {
        self.pattern().matches(&event.event_type)
    }

    async fn dispatch(&self, events: &[EventEnvelope]) -> EngineResult<()>;
}

/// Apply projections inline, on the dispatching task.
pub struct RealtimeDispatchStrategy {
    manager: Arc<ProjectionManager>,
    pattern: EventTypePattern,
}

impl RealtimeDispatchStrategy {
    pub fn new(manager: Arc<ProjectionManager>, pattern: EventTypePattern) -> Self {
        Self { manager, pattern }
    }
}

#[async_trait]
impl DispatchStrategy for RealtimeDispatchStrategy {
    fn name(&self) -> &str {
        "realtime"
    }

    fn priority(&self) -> i32 {
        REALTIME_PRIORITY
    }

    fn pattern(&self) -> &EventTypePattern {
        &self.pattern
    }

    async fn dispatch(&self, events: &[EventEnvelope]) -> EngineResult<()> {
        for event in events {
            self.manager.process_event(event).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProjectionJobPayload {
    event: EventEnvelope,
}

/// Enqueue one durable job per event.
pub struct AsyncDispatchStrategy {
    jobs: Arc<dyn JobQueue>,
    pattern: EventTypePattern,
}

impl AsyncDispatchStrategy {
    /// Registers the projection-apply job handler on the queue.
    pub async fn new(
        manager: Arc<ProjectionManager>,
        queue: Arc<InMemoryJobQueue>,
        pattern: EventTypePattern,
    ) -> Self {
        queue
            .register_handler(Arc::new(ProjectionJobHandler { manager }))
            .await;
        Self {
            jobs: queue as Arc<dyn JobQueue>,
            pattern,
        }
    }
}

#[async_trait]
impl DispatchStrategy for AsyncDispatchStrategy {
    fn name(&self) -> &str {
        "async"
    }

    fn priority(&self) -> i32 {
        ASYNC_PRIORITY
    }

    fn pattern(&self) -> &EventTypePattern {
        &self.pattern
    }

    async fn dispatch(&self, events: &[EventEnvelope]) -> EngineResult<()> {
        for event in events {
            let payload = serde_json::to_value(ProjectionJobPayload {
                event: event.clone(),
            })?;
            self.jobs.submit(PROJECTION_APPLY_JOB_TYPE, payload).await?;
        }
        Ok(())
    }
}

struct ProjectionJobHandler {
    manager: Arc<ProjectionManager>,
}

#[async_trait]
impl JobHandler for ProjectionJobHandler {
    fn job_type(&self) -> &str {
        PROJECTION_APPLY_JOB_TYPE
    }

    async fn execute(&self, job: &Job) -> EngineResult<()> {
        let payload: ProjectionJobPayload = serde_json::from_value(job.payload.clone())?;
        self.manager.process_event(&payload.event).await
    }
}

struct BatchBuffer {
    events: Vec<EventEnvelope>,
    opened_at: Option<Instant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchedDispatchConfig {
    pub max_size: usize,
    pub max_age_ms: u64,
}

impl Default for BatchedDispatchConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_age_ms: 1_000,
        }
    }
}

/// Buffer events in a shared bucket; flush as one batch when the bucket
/// fills or ages out.
pub struct BatchedDispatchStrategy {
    manager: Arc<ProjectionManager>,
    pattern: EventTypePattern,
    config: BatchedDispatchConfig,
    buffer: Mutex<BatchBuffer>,
}

impl BatchedDispatchStrategy {
    pub fn new(
        manager: Arc<ProjectionManager>,
        pattern: EventTypePattern,
        config: BatchedDispatchConfig,
    ) -> Self {
        Self {
            manager,
            pattern,
            config,
            buffer: Mutex::new(BatchBuffer {
                events: Vec::new(),
                opened_at: None,
            }),
        }
    }

    /// Flush the buffer regardless of size or age.
    pub async fn flush(&self) -> EngineResult<usize> {
        let batch: Vec<EventEnvelope> = {
            let mut buffer = self.buffer.lock().await;
            buffer.opened_at = None;
            buffer.events.drain(..).collect()
        };
        let count = batch.len();
        for event in &batch {
            self.manager.process_event(event).await?;
        }
        if count > 0 {
            debug!(events = count, "batched projection flush");
        }
        Ok(count)
    }

    /// Flush only when the oldest buffered event exceeds the max age.
    pub async fn flush_expired(&self) -> EngineResult<usize> {
        let expired = {
            let buffer = self.buffer.lock().await;
            buffer
                .opened_at
                .map(|at| at.elapsed() >= Duration::from_millis(self.config.max_age_ms))
                .unwrap_or(false)
        };
        if expired {
            self.flush().await
        } else {
            Ok(0)
        }
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.events.len()
    }
}

#[async_trait]
impl DispatchStrategy for BatchedDispatchStrategy {
    fn name(&self) -> &str {
        "batched"
    }

    fn priority(&self) -> i32 {
        BATCHED_PRIORITY
    }

    fn pattern(&self) -> &EventTypePattern {
        &self.pattern
    }

    async fn dispatch(&self, events: &[EventEnvelope]) -> EngineResult<()> {
        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            if buffer.opened_at.is_none() {
                buffer.opened_at = Some(Instant::now());
            }
            buffer.events.extend(events.iter().cloned());
            buffer.events.len() >= self.config.max_size
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }
}

/// Routes each committed event to the highest-priority strategy whose
/// pattern matches. When a transaction scope is active, delivery is deferred
/// to the post-commit hook.
pub struct ProjectionDispatcher {
    strategies: Vec<Arc<dyn DispatchStrategy>>,
}

impl ProjectionDispatcher {
    pub fn new(mut strategies: Vec<Arc<dyn DispatchStrategy>>) -> Self {
        strategies.sort_by_key(|s| std::cmp::Reverse(s.priority()));
        Self { strategies }
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    fn partition(
        &self,
        events: &[EventEnvelope],
    ) -> Vec<(Arc<dyn DispatchStrategy>, Vec<EventEnvelope>)> {
        let mut routed: Vec<(Arc<dyn DispatchStrategy>, Vec<EventEnvelope>)> = self
            .strategies
            .iter()
            .map(|s| (Arc::clone(s), Vec::new()))
            .collect();
        for event in events {
            for (strategy, claimed) in routed.iter_mut() {
                if strategy.matches(event) {
                    claimed.push(event.clone());
                    break;
                }
            }
        }
        routed.retain(|(_, claimed)| !claimed.is_empty());
        routed
    }
}

#[async_trait]
impl EventSink for ProjectionDispatcher {
    fn name(&self) -> &str {
        "projection_dispatcher"
    }

    async fn offer(&self, events: &[EventEnvelope]) -> EngineResult<()> {
        let routed = self.partition(events);
        if routed.is_empty() {
            return Ok(());
        }

        if TransactionManager::in_transaction() {
            // Deliver in the post-commit hook so projections never observe
            // events from a scope that later rolls back.
            TransactionManager::after_commit(hook(move || async move {
                for (strategy, claimed) in routed {
                    if let Err(err) = strategy.dispatch(&claimed).await {
                        warn!(
                            strategy = strategy.name(),
                            error = %err,
                            "post-commit dispatch failed"
                        );
                    }
                }
                Ok(())
            }))?;
            return Ok(());
        }

        for (strategy, claimed) in routed {
            if let Err(err) = strategy.dispatch(&claimed).await {
                warn!(
                    strategy = strategy.name(),
                    events = claimed.len(),
                    error = %err,
                    error_code = err.code(),
                    "dispatch strategy failed"
                );
            }
        }
        Ok(())
    }
}

/// Periodic pipeline sweep: flushes aged batches and advances projections
/// that have fallen behind the realtime path.
pub fn start_pipeline_sweep(
    manager: Arc<ProjectionManager>,
    batched: Option<Arc<BatchedDispatchStrategy>>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Some(batched) = &batched {
                if let Err(err) = batched.flush_expired().await {
                    warn!(error = %err, "batch flush failed during sweep");
                }
            }
            let report = manager.process_new_events().await;
            if !report.failed.is_empty() {
                warn!(failed = report.failed.len(), "projection sweep saw failures");
            }
        }
    })
}
