//! Snapshot stores and snapshotting strategies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use eventflow_core::{AggregateId, AggregateRoot, AggregateSnapshot, EngineResult};

/// Persistence for aggregate snapshots.
///
/// `load` and `load_version` verify the content hash and fail with
/// `SnapshotIntegrity` on mismatch; callers fall back to a full replay.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: AggregateSnapshot) -> EngineResult<()>;

    /// Latest snapshot for the aggregate, integrity-verified.
    async fn load(&self, aggregate_id: &AggregateId) -> EngineResult<Option<AggregateSnapshot>>;

    /// Snapshot at an exact version, integrity-verified.
    async fn load_version(
        &self,
        aggregate_id: &AggregateId,
        version: i64,
    ) -> EngineResult<Option<AggregateSnapshot>>;

    /// Latest snapshots for many aggregates. Aggregates without a valid
    /// snapshot are absent from the map; integrity failures are skipped and
    /// logged rather than failing the batch.
    async fn load_batch(
        &self,
        aggregate_ids: &[AggregateId],
    ) -> EngineResult<HashMap<AggregateId, AggregateSnapshot>>;

    async fn exists(&self, aggregate_id: &AggregateId) -> EngineResult<bool>;

    /// Delete all but the newest `keep` snapshots. Returns how many were
    /// removed.
    async fn prune(&self, aggregate_id: &AggregateId, keep: usize) -> EngineResult<usize>;

    async fn remove_all(&self, aggregate_id: &AggregateId) -> EngineResult<usize>;
}

/// In-memory snapshot store.
pub struct InMemorySnapshotStore {
    // Per aggregate, sorted by version ascending
    snapshots: RwLock<HashMap<AggregateId, Vec<AggregateSnapshot>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: AggregateSnapshot) -> EngineResult<()> {
        let mut snapshots = self.snapshots.write().await;
        let entry = snapshots.entry(snapshot.aggregate_id.clone()).or_default();
        entry.retain(|s| s.version != snapshot.version);
        entry.push(snapshot);
        entry.sort_by_key(|s| s.version);
        Ok(())
    }

    async fn load(&self, aggregate_id: &AggregateId) -> EngineResult<Option<AggregateSnapshot>> {
        let snapshots = self.snapshots.read().await;
        match snapshots.get(aggregate_id).and_then(|s| s.last()) {
            Some(snapshot) => {
                snapshot.verify_integrity()?;
                Ok(Some(snapshot.clone()))
            }
            None => Ok(None),
        }
    }

    async fn load_version(
        &self,
        aggregate_id: &AggregateId,
        version: i64,
    ) -> EngineResult<Option<AggregateSnapshot>> {
        let snapshots = self.snapshots.read().await;
        match snapshots
            .get(aggregate_id)
            .and_then(|s| s.iter().find(|snap| snap.version == version))
        {
            Some(snapshot) => {
                snapshot.verify_integrity()?;
                Ok(Some(snapshot.clone()))
            }
            None => Ok(None),
        }
    }

    async fn load_batch(
        &self,
        aggregate_ids: &[AggregateId],
    ) -> EngineResult<HashMap<AggregateId, AggregateSnapshot>> {
        let snapshots = self.snapshots.read().await;
        let mut result = HashMap::new();
        for id in aggregate_ids {
            if let Some(snapshot) = snapshots.get(id).and_then(|s| s.last()) {
                match snapshot.verify_integrity() {
                    Ok(()) => {
                        result.insert(id.clone(), snapshot.clone());
                    }
                    Err(err) => {
                        warn!(
                            aggregate_id = %id,
                            error = %err,
                            "skipping corrupt snapshot in batch load"
                        );
                    }
                }
            }
        }
        Ok(result)
    }

    async fn exists(&self, aggregate_id: &AggregateId) -> EngineResult<bool> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots
            .get(aggregate_id)
            .map(|s| !s.is_empty())
            .unwrap_or(false))
    }

    async fn prune(&self, aggregate_id: &AggregateId, keep: usize) -> EngineResult<usize> {
        let mut snapshots = self.snapshots.write().await;
        match snapshots.get_mut(aggregate_id) {
            Some(entry) if entry.len() > keep => {
                let removed = entry.len() - keep;
                entry.drain(..removed);
                Ok(removed)
            }
            _ => Ok(0),
        }
    }

    async fn remove_all(&self, aggregate_id: &AggregateId) -> EngineResult<usize> {
        let mut snapshots = self.snapshots.write().await;
        Ok(snapshots
            .remove(aggregate_id)
            .map(|s| s.len())
            .unwrap_or(0))
    }
}

/// Per-aggregate access statistics feeding the adaptive strategy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessStats {
    pub loads: u64,
    pub total_load_ms: u64,
    pub events_replayed: u64,
}

impl AccessStats {
    pub fn average_load_ms(&self) -> f64 {
        if self.loads == 0 {
            0.0
        } else {
            self.total_load_ms as f64 / self.loads as f64
        }
    }
}

/// Recorder for aggregate load metrics. The repository records one entry per
/// load; the adaptive strategy reads them synchronously.
#[derive(Default)]
pub struct AggregateAccessMetrics {
    stats: Mutex<HashMap<AggregateId, AccessStats>>,
}

impl AggregateAccessMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_load(&self, aggregate_id: &AggregateId, duration: Duration, events_replayed: u64) {
        if let Ok(mut stats) = self.stats.lock() {
            let entry = stats.entry(aggregate_id.clone()).or_default();
            entry.loads += 1;
            entry.total_load_ms += duration.as_millis() as u64;
            entry.events_replayed += events_replayed;
        }
    }

    pub fn stats_for(&self, aggregate_id: &AggregateId) -> Option<AccessStats> {
        self.stats
            .lock()
            .ok()
            .and_then(|stats| stats.get(aggregate_id).cloned())
    }
}

/// Decides when the repository writes a snapshot.
pub trait SnapshotStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Serializable view of the strategy's tuning, for diagnostics.
    fn configuration(&self) -> Value;

    fn should_snapshot(
        &self,
        aggregate_id: &AggregateId,
        current_version: i64,
        last_snapshot: Option<&AggregateSnapshot>,
    ) -> bool;
}

/// Snapshot whenever `current_version - last_snapshot_version >= threshold`.
#[derive(Debug, Clone)]
pub struct SimpleSnapshotStrategy {
    threshold: i64,
}

impl SimpleSnapshotStrategy {
    pub const DEFAULT_THRESHOLD: i64 = 10;

    pub fn new(threshold: i64) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }
}

impl Default for SimpleSnapshotStrategy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

impl SnapshotStrategy for SimpleSnapshotStrategy {
    fn name(&self) -> &str {
        "simple"
    }

    fn configuration(&self) -> Value {
        json!({ "threshold": self.threshold })
    }

    fn should_snapshot(
        &self,
        _aggregate_id: &AggregateId,
        current_version: i64,
        last_snapshot: Option<&AggregateSnapshot>,
    ) -> bool {
        let last_version = last_snapshot.map(|s| s.version).unwrap_or(0);
        current_version - last_version >= self.threshold
    }
}

/// Tuning for [`AdaptiveSnapshotStrategy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveStrategyConfig {
    /// Score contribution per event since the last snapshot
    pub complexity_weight: f64,
    /// Score contribution per recorded load
    pub access_weight: f64,
    /// Score contribution per millisecond of average load time
    pub load_time_weight: f64,
    /// Snapshot once the combined score reaches this value
    pub score_threshold: f64,
}

impl Default for AdaptiveStrategyConfig {
    fn default() -> Self {
        Self {
            complexity_weight: 0.1,
            access_weight: 0.05,
            load_time_weight: 0.02,
            score_threshold: 1.0,
        }
    }
}

/// Combines replay complexity, access frequency, and average load time.
///
/// Without recorded metrics for the aggregate the strategy degrades to
/// [`SimpleSnapshotStrategy`] with the default threshold, keeping decisions
/// deterministic in early-lifecycle systems.
pub struct AdaptiveSnapshotStrategy {
    config: AdaptiveStrategyConfig,
    metrics: std::sync::Arc<AggregateAccessMetrics>,
    fallback: SimpleSnapshotStrategy,
}

impl AdaptiveSnapshotStrategy {
    pub fn new(
        config: AdaptiveStrategyConfig,
        metrics: std::sync::Arc<AggregateAccessMetrics>,
    ) -> Self {
        Self {
            config,
            metrics,
            fallback: SimpleSnapshotStrategy::default(),
        }
    }

    fn score(&self, events_since_snapshot: i64, stats: &AccessStats) -> f64 {
        self.config.complexity_weight * events_since_snapshot as f64
            + self.config.access_weight * stats.loads as f64
            + self.config.load_time_weight * stats.average_load_ms()
    }
}

impl SnapshotStrategy for AdaptiveSnapshotStrategy {
    fn name(&self) -> &str {
        "adaptive"
    }

    fn configuration(&self) -> Value {
        json!({
            "complexity_weight": self.config.complexity_weight,
            "access_weight": self.config.access_weight,
            "load_time_weight": self.config.load_time_weight,
            "score_threshold": self.config.score_threshold,
            "fallback": self.fallback.configuration(),
        })
    }

    fn should_snapshot(
        &self,
        aggregate_id: &AggregateId,
        current_version: i64,
        last_snapshot: Option<&AggregateSnapshot>,
    ) -> bool {
        let last_version = last_snapshot.map(|s| s.version).unwrap_or(0);
        let events_since = current_version - last_version;
        if events_since <= 0 {
            return false;
        }
        match self.metrics.stats_for(aggregate_id) {
            Some(stats) => self.score(events_since, &stats) >= self.config.score_threshold,
            None => self
                .fallback
                .should_snapshot(aggregate_id, current_version, last_snapshot),
        }
    }
}

/// Statistics for the snapshot subsystem
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotStatistics {
    pub snapshots_written: u64,
    pub snapshot_failures: u64,
    pub loads_from_snapshot: u64,
    pub integrity_failures: u64,
}

/// Strategy-driven snapshot enforcement, called by the repository after
/// every successful append.
pub struct SnapshotManager {
    store: std::sync::Arc<dyn SnapshotStore>,
    strategy: std::sync::Arc<dyn SnapshotStrategy>,
    metrics: std::sync::Arc<AggregateAccessMetrics>,
    stats: Mutex<SnapshotStatistics>,
    keep_per_aggregate: usize,
}

impl SnapshotManager {
    pub const DEFAULT_KEEP: usize = 3;

    pub fn new(
        store: std::sync::Arc<dyn SnapshotStore>,
        strategy: std::sync::Arc<dyn SnapshotStrategy>,
    ) -> Self {
        Self {
            store,
            strategy,
            metrics: std::sync::Arc::new(AggregateAccessMetrics::new()),
            stats: Mutex::new(SnapshotStatistics::default()),
            keep_per_aggregate: Self::DEFAULT_KEEP,
        }
    }

    pub fn with_metrics(mut self, metrics: std::sync::Arc<AggregateAccessMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_keep_per_aggregate(mut self, keep: usize) -> Self {
        self.keep_per_aggregate = keep.max(1);
        self
    }

    pub fn store(&self) -> &std::sync::Arc<dyn SnapshotStore> {
        &self.store
    }

    pub fn metrics(&self) -> &std::sync::Arc<AggregateAccessMetrics> {
        &self.metrics
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Write a snapshot if the strategy asks for one. Failures are recorded
    /// and logged but never propagated: snapshotting is an optimization, not
    /// a correctness requirement.
    pub async fn maybe_snapshot<A: AggregateRoot>(&self, aggregate: &A) {
        let aggregate_id = aggregate.id().clone();
        let current_version = aggregate.version();

        let last = match self.store.load(&aggregate_id).await {
            Ok(last) => last,
            Err(err) => {
                warn!(
                    aggregate_id = %aggregate_id,
                    error = %err,
                    "failed to load last snapshot for strategy decision"
                );
                None
            }
        };

        if !self
            .strategy
            .should_snapshot(&aggregate_id, current_version, last.as_ref())
        {
            return;
        }

        let state = match aggregate.snapshot_state() {
            Ok(state) => state,
            Err(err) => {
                self.record_failure();
                warn!(aggregate_id = %aggregate_id, error = %err, "failed to serialize snapshot state");
                return;
            }
        };

        let snapshot = AggregateSnapshot::new(
            aggregate_id.clone(),
            A::aggregate_type(),
            current_version,
            state,
        );
        match self.store.save(snapshot).await {
            Ok(()) => {
                if let Ok(mut stats) = self.stats.lock() {
                    stats.snapshots_written += 1;
                }
                debug!(
                    aggregate_id = %aggregate_id,
                    version = current_version,
                    strategy = self.strategy.name(),
                    "snapshot written"
                );
                if let Err(err) = self
                    .store
                    .prune(&aggregate_id, self.keep_per_aggregate)
                    .await
                {
                    warn!(aggregate_id = %aggregate_id, error = %err, "snapshot prune failed");
                }
            }
            Err(err) => {
                self.record_failure();
                warn!(aggregate_id = %aggregate_id, error = %err, "snapshot write failed");
            }
        }
    }

    pub fn record_snapshot_load(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.loads_from_snapshot += 1;
        }
    }

    pub fn record_integrity_failure(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.integrity_failures += 1;
        }
    }

    fn record_failure(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.snapshot_failures += 1;
        }
    }

    pub fn statistics(&self) -> SnapshotStatistics {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn snapshot_at(id: &AggregateId, version: i64) -> AggregateSnapshot {
        AggregateSnapshot::new(id.clone(), "user", version, json!({"v": version}))
    }

    #[test]
    fn test_simple_strategy_uses_snapshot_aware_formula() {
        let strategy = SimpleSnapshotStrategy::new(10);
        let id = AggregateId::new("U-1");

        assert!(!strategy.should_snapshot(&id, 9, None));
        assert!(strategy.should_snapshot(&id, 10, None));

        let last = snapshot_at(&id, 10);
        assert!(!strategy.should_snapshot(&id, 19, Some(&last)));
        assert!(strategy.should_snapshot(&id, 20, Some(&last)));
    }

    #[test]
    fn test_simple_strategy_threshold_one_snapshots_every_event() {
        let strategy = SimpleSnapshotStrategy::new(1);
        let id = AggregateId::new("U-1");
        let last = snapshot_at(&id, 4);
        assert!(strategy.should_snapshot(&id, 5, Some(&last)));
    }

    #[test]
    fn test_adaptive_strategy_falls_back_without_metrics() {
        let metrics = Arc::new(AggregateAccessMetrics::new());
        let strategy = AdaptiveSnapshotStrategy::new(AdaptiveStrategyConfig::default(), metrics);
        let id = AggregateId::new("U-1");

        // No metrics recorded: behaves like simple(10)
        assert!(!strategy.should_snapshot(&id, 9, None));
        assert!(strategy.should_snapshot(&id, 10, None));
    }

    #[test]
    fn test_adaptive_strategy_scores_hot_aggregates_earlier() {
        let metrics = Arc::new(AggregateAccessMetrics::new());
        let id = AggregateId::new("U-1");
        for _ in 0..40 {
            metrics.record_load(&id, Duration::from_millis(20), 50);
        }
        let strategy = AdaptiveSnapshotStrategy::new(AdaptiveStrategyConfig::default(), metrics);

        // 5 events since snapshot would not trigger simple(10), but the
        // access frequency and load cost push the score over the threshold.
        assert!(strategy.should_snapshot(&id, 5, None));
    }

    #[tokio::test]
    async fn test_store_keeps_versions_sorted_and_prunes() {
        let store = InMemorySnapshotStore::new();
        let id = AggregateId::new("U-1");
        for version in [10, 30, 20, 40] {
            store.save(snapshot_at(&id, version)).await.unwrap();
        }

        let latest = store.load(&id).await.unwrap().unwrap();
        assert_eq!(latest.version, 40);
        assert!(store.load_version(&id, 20).await.unwrap().is_some());

        let removed = store.prune(&id, 2).await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.load_version(&id, 10).await.unwrap().is_none());
        assert_eq!(store.load(&id).await.unwrap().unwrap().version, 40);

        assert_eq!(store.remove_all(&id).await.unwrap(), 2);
        assert!(!store.exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_fails_load_with_integrity_error() {
        let store = InMemorySnapshotStore::new();
        let id = AggregateId::new("U-1");
        let mut snapshot = snapshot_at(&id, 10);
        snapshot.state = json!({"v": "tampered"});
        store.save(snapshot).await.unwrap();

        let err = store.load(&id).await.unwrap_err();
        assert_eq!(err.code(), "snapshot_integrity");
    }
}
