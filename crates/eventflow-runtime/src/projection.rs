//! Projection pipeline: projectors, checkpoints, locks, replay, health.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use eventflow_core::{EngineError, EngineResult, EventEnvelope};

use crate::store::EventStore;

/// Lag thresholds for health classification
pub const LAG_WARNING_THRESHOLD: i64 = 1_000;
pub const LAG_CRITICAL_THRESHOLD: i64 = 10_000;

/// Identity, position, enabled flag, and in-process lock shared by every
/// projector. Concrete projectors embed one and return it from
/// [`Projector::core`].
pub struct ProjectorCore {
    name: String,
    position: AtomicI64,
    enabled: AtomicBool,
    lease: Mutex<Option<Instant>>,
}

impl ProjectorCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            position: AtomicI64::new(0),
            enabled: AtomicBool::new(true),
            lease: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn position(&self) -> i64 {
        self.position.load(Ordering::SeqCst)
    }

    pub fn set_position(&self, sequence: i64) {
        self.position.store(sequence, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Acquire the in-process lock for `timeout`. An expired lease is
    /// reclaimable.
    pub fn lock(&self, timeout: Duration) -> bool {
        let Ok(mut lease) = self.lease.lock() else {
            return false;
        };
        let now = Instant::now();
        match *lease {
            Some(until) if until > now => false,
            _ => {
                *lease = Some(now + timeout);
                true
            }
        }
    }

    pub fn unlock(&self) {
        if let Ok(mut lease) = self.lease.lock() {
            *lease = None;
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lease
            .lock()
            .map(|lease| matches!(*lease, Some(until) if until > Instant::now()))
            .unwrap_or(false)
    }
}

/// A read-model builder advancing through the global event sequence.
#[async_trait]
pub trait Projector: Send + Sync {
    fn core(&self) -> &ProjectorCore;

    /// Event types this projector consumes; `"*"` consumes everything.
    fn handled_events(&self) -> Vec<String>;

    async fn handle(&self, event: &EventEnvelope) -> EngineResult<()>;

    /// Clear all derived state before a full replay.
    async fn reset(&self) -> EngineResult<()>;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn can_handle(&self, event: &EventEnvelope) -> bool {
        self.handled_events()
            .iter()
            .any(|t| t == "*" || *t == event.event_type)
    }

    fn position(&self) -> i64 {
        self.core().position()
    }

    fn set_position(&self, sequence: i64) {
        self.core().set_position(sequence)
    }

    fn is_enabled(&self) -> bool {
        self.core().is_enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.core().set_enabled(enabled)
    }

    fn lock(&self, timeout: Duration) -> bool {
        self.core().lock(timeout)
    }

    fn unlock(&self) {
        self.core().unlock()
    }

    fn is_locked(&self) -> bool {
        self.core().is_locked()
    }
}

/// Durable projection progress row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionCheckpoint {
    pub projection_name: String,
    pub last_processed_sequence: i64,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectionCheckpoint {
    fn new(projection_name: &str) -> Self {
        Self {
            projection_name: projection_name.to_string(),
            last_processed_sequence: 0,
            locked_by: None,
            locked_until: None,
            updated_at: Utc::now(),
        }
    }
}

/// Persistence for projection checkpoints and the cross-process lock.
///
/// The lock is a lease: `acquire` succeeds when the row is unlocked, the
/// lease expired, or the same holder re-acquires (reentrant, extending the
/// lease). A crashed worker's lease becomes reclaimable once `locked_until`
/// passes.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, name: &str) -> EngineResult<Option<ProjectionCheckpoint>>;

    async fn save_position(&self, name: &str, sequence: i64) -> EngineResult<()>;

    async fn acquire_lock(&self, name: &str, holder: &str, lease: Duration) -> EngineResult<bool>;

    async fn release_lock(&self, name: &str, holder: &str) -> EngineResult<()>;

    async fn reset(&self, name: &str) -> EngineResult<()>;

    async fn all(&self) -> EngineResult<Vec<ProjectionCheckpoint>>;
}

/// In-memory checkpoint store.
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, ProjectionCheckpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            checkpoints: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, name: &str) -> EngineResult<Option<ProjectionCheckpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints.get(name).cloned())
    }

    async fn save_position(&self, name: &str, sequence: i64) -> EngineResult<()> {
        let mut checkpoints = self.checkpoints.write().await;
        let entry = checkpoints
            .entry(name.to_string())
            .or_insert_with(|| ProjectionCheckpoint::new(name));
        entry.last_processed_sequence = sequence;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn acquire_lock(&self, name: &str, holder: &str, lease: Duration) -> EngineResult<bool> {
        let mut checkpoints = self.checkpoints.write().await;
        let entry = checkpoints
            .entry(name.to_string())
            .or_insert_with(|| ProjectionCheckpoint::new(name));
        let now = Utc::now();
        let lease_until = now
            + ChronoDuration::from_std(lease).unwrap_or_else(|_| ChronoDuration::seconds(30));

        let acquirable = match (&entry.locked_by, entry.locked_until) {
            (None, _) => true,
            (Some(current), _) if current == holder => true,
            (Some(_), Some(until)) if until <= now => true,
            (Some(_), None) => true,
            _ => false,
        };

        if acquirable {
            entry.locked_by = Some(holder.to_string());
            entry.locked_until = Some(lease_until);
            entry.updated_at = now;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release_lock(&self, name: &str, holder: &str) -> EngineResult<()> {
        let mut checkpoints = self.checkpoints.write().await;
        if let Some(entry) = checkpoints.get_mut(name) {
            if entry.locked_by.as_deref() == Some(holder) {
                entry.locked_by = None;
                entry.locked_until = None;
                entry.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn reset(&self, name: &str) -> EngineResult<()> {
        let mut checkpoints = self.checkpoints.write().await;
        if let Some(entry) = checkpoints.get_mut(name) {
            entry.last_processed_sequence = 0;
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn all(&self) -> EngineResult<Vec<ProjectionCheckpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints.values().cloned().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectionHealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl ProjectionHealthStatus {
    fn from_lag(lag: i64) -> Self {
        if lag >= LAG_CRITICAL_THRESHOLD {
            ProjectionHealthStatus::Critical
        } else if lag >= LAG_WARNING_THRESHOLD {
            ProjectionHealthStatus::Warning
        } else {
            ProjectionHealthStatus::Healthy
        }
    }

    fn degraded(self) -> Self {
        match self {
            ProjectionHealthStatus::Healthy => ProjectionHealthStatus::Warning,
            _ => ProjectionHealthStatus::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionHealth {
    pub name: String,
    pub enabled: bool,
    pub position: i64,
    pub latest_sequence: i64,
    pub lag: i64,
    pub status: ProjectionHealthStatus,
    pub errors_last_hour: usize,
}

/// Result of one `process_new_events` pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectionRunReport {
    pub processed: HashMap<String, u64>,
    pub failed: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionManagerConfig {
    /// Events read per checkpoint-advance batch
    pub batch_size: usize,
    /// Lease granted per lock acquisition
    pub lock_lease_seconds: u64,
    /// Identity of this worker for lock ownership
    pub worker_id: String,
}

impl Default for ProjectionManagerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            lock_lease_seconds: 30,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

/// Coordinates registered projectors: advancing, replaying, and health.
pub struct ProjectionManager {
    projectors: RwLock<Vec<Arc<dyn Projector>>>,
    store: Arc<dyn EventStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: ProjectionManagerConfig,
    errors: RwLock<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl ProjectionManager {
    pub fn new(
        store: Arc<dyn EventStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: ProjectionManagerConfig,
    ) -> Self {
        Self {
            projectors: RwLock::new(Vec::new()),
            store,
            checkpoints,
            config,
            errors: RwLock::new(HashMap::new()),
        }
    }

    /// Register a projector, seeding its position from the checkpoint store.
    pub async fn register(&self, projector: Arc<dyn Projector>) -> EngineResult<()> {
        if let Some(checkpoint) = self.checkpoints.load(projector.name()).await? {
            projector.set_position(checkpoint.last_processed_sequence);
        }
        info!(
            projection = projector.name(),
            position = projector.position(),
            "projector registered"
        );
        let mut projectors = self.projectors.write().await;
        projectors.push(projector);
        Ok(())
    }

    pub async fn projector(&self, name: &str) -> Option<Arc<dyn Projector>> {
        let projectors = self.projectors.read().await;
        projectors.iter().find(|p| p.name() == name).cloned()
    }

    /// Advance every enabled projector through the new portion of the log.
    /// Errors in one projector do not abort the others.
    pub async fn process_new_events(&self) -> ProjectionRunReport {
        let projectors = self.projectors.read().await.clone();
        let mut report = ProjectionRunReport::default();
        for projector in projectors {
            if !projector.is_enabled() {
                continue;
            }
            match self.advance(&projector).await {
                Ok(count) => {
                    report.processed.insert(projector.name().to_string(), count);
                }
                Err(err) => {
                    error!(
                        projection = projector.name(),
                        error = %err,
                        error_code = err.code(),
                        "projector failed, checkpoint not advanced"
                    );
                    report
                        .failed
                        .insert(projector.name().to_string(), err.to_string());
                }
            }
        }
        report
    }

    /// Offer one event to every enabled projector (the async dispatch path).
    /// Events at or below a projector's position are skipped.
    pub async fn process_event(&self, event: &EventEnvelope) -> EngineResult<()> {
        let projectors = self.projectors.read().await.clone();
        for projector in projectors {
            if !projector.is_enabled() || event.sequence_number <= projector.position() {
                continue;
            }
            if projector.can_handle(event) {
                if let Err(err) = projector.handle(event).await {
                    self.record_error(projector.name()).await;
                    return Err(EngineError::Projection {
                        projection: projector.name().to_string(),
                        message: err.to_string(),
                    });
                }
            }
            projector.set_position(event.sequence_number);
            self.checkpoints
                .save_position(projector.name(), event.sequence_number)
                .await?;
        }
        Ok(())
    }

    /// Replay one projection. Without `from_sequence` the projector is reset
    /// and replayed from the beginning of the log.
    pub async fn replay(&self, name: &str, from_sequence: Option<i64>) -> EngineResult<u64> {
        let projector = self.projector(name).await.ok_or_else(|| {
            EngineError::Projection {
                projection: name.to_string(),
                message: "not registered".to_string(),
            }
        })?;

        let start = match from_sequence {
            Some(sequence) => sequence.max(1),
            None => {
                projector.reset().await?;
                self.checkpoints.reset(name).await?;
                1
            }
        };
        projector.set_position(start - 1);
        self.checkpoints.save_position(name, start - 1).await?;

        info!(projection = name, from_sequence = start, "replay started");
        self.advance(&projector).await
    }

    /// Replay every registered projection from the beginning.
    pub async fn replay_all(&self) -> EngineResult<HashMap<String, u64>> {
        let projectors = self.projectors.read().await.clone();
        let mut processed = HashMap::new();
        for projector in projectors {
            let count = self.replay(projector.name(), None).await?;
            processed.insert(projector.name().to_string(), count);
        }
        Ok(processed)
    }

    /// Health report with lag classification. Errors within the last hour
    /// degrade the status one level.
    pub async fn health(&self) -> EngineResult<Vec<ProjectionHealth>> {
        let latest_sequence = self.store.latest_sequence().await?;
        let projectors = self.projectors.read().await;
        let errors = self.errors.read().await;
        let one_hour_ago = Utc::now() - ChronoDuration::hours(1);

        Ok(projectors
            .iter()
            .map(|projector| {
                let position = projector.position();
                let lag = (latest_sequence - position).max(0);
                let errors_last_hour = errors
                    .get(projector.name())
                    .map(|times| times.iter().filter(|t| **t > one_hour_ago).count())
                    .unwrap_or(0);
                let mut status = ProjectionHealthStatus::from_lag(lag);
                if errors_last_hour > 0 {
                    status = status.degraded();
                }
                ProjectionHealth {
                    name: projector.name().to_string(),
                    enabled: projector.is_enabled(),
                    position,
                    latest_sequence,
                    lag,
                    status,
                    errors_last_hour,
                }
            })
            .collect())
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Advance a single projector under both locks. Returns the number of
    /// events its checkpoint moved past.
    async fn advance(&self, projector: &Arc<dyn Projector>) -> EngineResult<u64> {
        let name = projector.name().to_string();
        let lease = Duration::from_secs(self.config.lock_lease_seconds);

        if !self
            .checkpoints
            .acquire_lock(&name, &self.config.worker_id, lease)
            .await?
        {
            debug!(projection = %name, "checkpoint lock held elsewhere, skipping");
            return Ok(0);
        }
        if !projector.lock(lease) {
            self.checkpoints
                .release_lock(&name, &self.config.worker_id)
                .await?;
            return Ok(0);
        }

        let result = self.advance_locked(projector, &name).await;

        projector.unlock();
        self.checkpoints
            .release_lock(&name, &self.config.worker_id)
            .await?;

        result
    }

    async fn advance_locked(
        &self,
        projector: &Arc<dyn Projector>,
        name: &str,
    ) -> EngineResult<u64> {
        let mut moved: u64 = 0;
        loop {
            let from = projector.position() + 1;
            let events = self
                .store
                .load_events_from_sequence(from, self.config.batch_size)
                .await?;
            if events.is_empty() {
                break;
            }
            let batch_len = events.len();
            for event in &events {
                if projector.can_handle(event) {
                    if let Err(err) = projector.handle(event).await {
                        self.record_error(name).await;
                        // Checkpoint stays at the last processed event
                        return Err(EngineError::Projection {
                            projection: name.to_string(),
                            message: format!(
                                "failed at sequence {}: {}",
                                event.sequence_number, err
                            ),
                        });
                    }
                }
                projector.set_position(event.sequence_number);
                self.checkpoints
                    .save_position(name, event.sequence_number)
                    .await?;
                moved += 1;
            }
            if batch_len < self.config.batch_size {
                break;
            }
        }
        if moved > 0 {
            debug!(projection = %name, moved, position = projector.position(), "projection advanced");
        }
        Ok(moved)
    }

    async fn record_error(&self, name: &str) {
        let mut errors = self.errors.write().await;
        let entry = errors.entry(name.to_string()).or_default();
        entry.push(Utc::now());
        let cutoff = Utc::now() - ChronoDuration::hours(1);
        entry.retain(|t| *t > cutoff);
    }
}
