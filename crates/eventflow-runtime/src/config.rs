//! Runtime configuration profiles.
//!
//! A [`RuntimeProfile`] is a preset tuned for a deployment stage; every key
//! can be overridden individually, and `EVENTFLOW_*` environment variables
//! override the preset at load time.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::command::AsyncCommandStrategy;
use crate::dispatch::BatchedDispatchConfig;
use crate::jobs::JobQueueConfig;
use crate::query::{InvalidationBatcherConfig, L1CacheConfig, QueryCacheConfig};
use crate::snapshot::SimpleSnapshotStrategy;
use crate::store::{HotStoreConfig, TieredStoreConfig, WriteMode};

/// Deployment-stage preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeProfile {
    Startup,
    Growth,
    Scale,
    Enterprise,
}

static PROFILE_NAMES: Lazy<HashMap<&'static str, RuntimeProfile>> = Lazy::new(|| {
    HashMap::from([
        ("startup", RuntimeProfile::Startup),
        ("growth", RuntimeProfile::Growth),
        ("scale", RuntimeProfile::Scale),
        ("enterprise", RuntimeProfile::Enterprise),
    ])
});

impl RuntimeProfile {
    pub fn parse(name: &str) -> Option<Self> {
        PROFILE_NAMES.get(name.to_lowercase().as_str()).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeProfile::Startup => "startup",
            RuntimeProfile::Growth => "growth",
            RuntimeProfile::Scale => "scale",
            RuntimeProfile::Enterprise => "enterprise",
        }
    }
}

/// Which snapshot strategy the profile selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotStrategyKind {
    Simple,
    Adaptive,
}

/// Projection dispatch strategies enabled by the profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectionStrategyKind {
    Realtime,
    Async,
    Batched,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSettings {
    pub strategy: SnapshotStrategyKind,
    pub threshold: i64,
    pub keep_per_aggregate: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionSettings {
    pub strategies: Vec<ProjectionStrategyKind>,
    pub batch_size: usize,
    pub lock_lease_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub batched: BatchedDispatchConfig,
}

/// Complete runtime configuration assembled from a profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub profile: RuntimeProfile,
    pub snapshot: SnapshotSettings,
    pub tiered_store: TieredStoreConfig,
    pub query_cache: QueryCacheConfig,
    pub async_command_strategy: AsyncCommandStrategy,
    pub async_status_ttl_seconds: u64,
    pub projection: ProjectionSettings,
    pub saga_sweep_interval_seconds: u64,
    pub jobs: JobQueueConfig,
}

impl RuntimeConfig {
    /// Preset defaults for a profile.
    pub fn for_profile(profile: RuntimeProfile) -> Self {
        match profile {
            RuntimeProfile::Startup => Self {
                profile,
                snapshot: SnapshotSettings {
                    strategy: SnapshotStrategyKind::Simple,
                    threshold: SimpleSnapshotStrategy::DEFAULT_THRESHOLD,
                    keep_per_aggregate: 3,
                },
                tiered_store: TieredStoreConfig {
                    hot: HotStoreConfig {
                        ttl_seconds: 120,
                        max_aggregates: 200,
                    },
                    write_mode: WriteMode::WriteThrough,
                    ..Default::default()
                },
                query_cache: QueryCacheConfig {
                    default_ttl_seconds: 60,
                    l1: L1CacheConfig {
                        max_entries: 1_000,
                        max_bytes: 8 * 1024 * 1024,
                        ..Default::default()
                    },
                    ..Default::default()
                },
                async_command_strategy: AsyncCommandStrategy::Sync,
                async_status_ttl_seconds: 3_600,
                projection: ProjectionSettings {
                    strategies: vec![ProjectionStrategyKind::Realtime],
                    batch_size: 100,
                    lock_lease_seconds: 30,
                    sweep_interval_seconds: 10,
                    batched: BatchedDispatchConfig::default(),
                },
                saga_sweep_interval_seconds: 60,
                jobs: JobQueueConfig::default(),
            },
            RuntimeProfile::Growth => Self {
                profile,
                snapshot: SnapshotSettings {
                    strategy: SnapshotStrategyKind::Simple,
                    threshold: SimpleSnapshotStrategy::DEFAULT_THRESHOLD,
                    keep_per_aggregate: 3,
                },
                tiered_store: TieredStoreConfig {
                    hot: HotStoreConfig {
                        ttl_seconds: 300,
                        max_aggregates: 1_000,
                    },
                    write_mode: WriteMode::WriteThrough,
                    ..Default::default()
                },
                query_cache: QueryCacheConfig {
                    default_ttl_seconds: 300,
                    ..Default::default()
                },
                async_command_strategy: AsyncCommandStrategy::Queue,
                async_status_ttl_seconds: 6 * 3_600,
                projection: ProjectionSettings {
                    strategies: vec![
                        ProjectionStrategyKind::Realtime,
                        ProjectionStrategyKind::Async,
                    ],
                    batch_size: 100,
                    lock_lease_seconds: 30,
                    sweep_interval_seconds: 5,
                    batched: BatchedDispatchConfig::default(),
                },
                saga_sweep_interval_seconds: 30,
                jobs: JobQueueConfig::default(),
            },
            RuntimeProfile::Scale => Self {
                profile,
                snapshot: SnapshotSettings {
                    strategy: SnapshotStrategyKind::Adaptive,
                    threshold: SimpleSnapshotStrategy::DEFAULT_THRESHOLD,
                    keep_per_aggregate: 5,
                },
                tiered_store: TieredStoreConfig {
                    hot: HotStoreConfig {
                        ttl_seconds: 600,
                        max_aggregates: 10_000,
                    },
                    write_mode: WriteMode::WriteBehind,
                    ..Default::default()
                },
                query_cache: QueryCacheConfig {
                    default_ttl_seconds: 600,
                    l1: L1CacheConfig {
                        max_entries: 50_000,
                        max_bytes: 256 * 1024 * 1024,
                        ..Default::default()
                    },
                    batcher: InvalidationBatcherConfig {
                        batch_size: 200,
                        max_batches_per_second: 20,
                    },
                    ..Default::default()
                },
                async_command_strategy: AsyncCommandStrategy::Queue,
                async_status_ttl_seconds: 24 * 3_600,
                projection: ProjectionSettings {
                    strategies: vec![
                        ProjectionStrategyKind::Async,
                        ProjectionStrategyKind::Batched,
                    ],
                    batch_size: 500,
                    lock_lease_seconds: 60,
                    sweep_interval_seconds: 2,
                    batched: BatchedDispatchConfig {
                        max_size: 500,
                        max_age_ms: 500,
                    },
                },
                saga_sweep_interval_seconds: 15,
                jobs: JobQueueConfig {
                    max_attempts: 5,
                    ..Default::default()
                },
            },
            RuntimeProfile::Enterprise => Self {
                profile,
                snapshot: SnapshotSettings {
                    strategy: SnapshotStrategyKind::Adaptive,
                    threshold: SimpleSnapshotStrategy::DEFAULT_THRESHOLD,
                    keep_per_aggregate: 10,
                },
                tiered_store: TieredStoreConfig {
                    hot: HotStoreConfig {
                        ttl_seconds: 900,
                        max_aggregates: 100_000,
                    },
                    write_mode: WriteMode::WriteBehind,
                    ..Default::default()
                },
                query_cache: QueryCacheConfig {
                    default_ttl_seconds: 900,
                    l1: L1CacheConfig {
                        max_entries: 200_000,
                        max_bytes: 1024 * 1024 * 1024,
                        ..Default::default()
                    },
                    batcher: InvalidationBatcherConfig {
                        batch_size: 500,
                        max_batches_per_second: 50,
                    },
                    ..Default::default()
                },
                async_command_strategy: AsyncCommandStrategy::Queue,
                async_status_ttl_seconds: 7 * 24 * 3_600,
                projection: ProjectionSettings {
                    strategies: vec![
                        ProjectionStrategyKind::Realtime,
                        ProjectionStrategyKind::Async,
                        ProjectionStrategyKind::Batched,
                    ],
                    batch_size: 1_000,
                    lock_lease_seconds: 60,
                    sweep_interval_seconds: 1,
                    batched: BatchedDispatchConfig {
                        max_size: 1_000,
                        max_age_ms: 250,
                    },
                },
                saga_sweep_interval_seconds: 10,
                jobs: JobQueueConfig {
                    max_attempts: 5,
                    max_delay_ms: 60_000,
                    ..Default::default()
                },
            },
        }
    }

    /// Profile from `EVENTFLOW_PROFILE` (default `startup`) with individual
    /// `EVENTFLOW_*` key overrides applied.
    pub fn from_env() -> Self {
        let profile = std::env::var("EVENTFLOW_PROFILE")
            .ok()
            .and_then(|name| RuntimeProfile::parse(&name))
            .unwrap_or(RuntimeProfile::Startup);
        let mut config = Self::for_profile(profile);

        if let Some(threshold) = env_parse::<i64>("EVENTFLOW_SNAPSHOT_THRESHOLD") {
            config.snapshot.threshold = threshold.max(1);
        }
        if let Some(ttl) = env_parse::<u64>("EVENTFLOW_HOT_TTL_SECONDS") {
            config.tiered_store.hot.ttl_seconds = ttl;
        }
        if let Some(max) = env_parse::<usize>("EVENTFLOW_L1_MAX_ENTRIES") {
            config.query_cache.l1.max_entries = max;
        }
        if let Some(bytes) = env_parse::<usize>("EVENTFLOW_L1_MAX_BYTES") {
            config.query_cache.l1.max_bytes = bytes;
        }
        if let Some(ttl) = env_parse::<u64>("EVENTFLOW_QUERY_CACHE_TTL_SECONDS") {
            config.query_cache.default_ttl_seconds = ttl;
        }
        if let Some(batch) = env_parse::<usize>("EVENTFLOW_PROJECTION_BATCH_SIZE") {
            config.projection.batch_size = batch.max(1);
        }
        config
    }

    pub fn with_snapshot_threshold(mut self, threshold: i64) -> Self {
        self.snapshot.threshold = threshold.max(1);
        self
    }

    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.tiered_store.write_mode = mode;
        self
    }

    pub fn with_async_strategy(mut self, strategy: AsyncCommandStrategy) -> Self {
        self.async_command_strategy = strategy;
        self
    }

    pub fn with_projection_strategies(
        mut self,
        strategies: Vec<ProjectionStrategyKind>,
    ) -> Self {
        self.projection.strategies = strategies;
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::for_profile(RuntimeProfile::Startup)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_names_round_trip() {
        for profile in [
            RuntimeProfile::Startup,
            RuntimeProfile::Growth,
            RuntimeProfile::Scale,
            RuntimeProfile::Enterprise,
        ] {
            assert_eq!(RuntimeProfile::parse(profile.as_str()), Some(profile));
        }
        assert_eq!(RuntimeProfile::parse("SCALE"), Some(RuntimeProfile::Scale));
        assert_eq!(RuntimeProfile::parse("unknown"), None);
    }

    #[test]
    fn test_profiles_scale_their_limits() {
        let startup = RuntimeConfig::for_profile(RuntimeProfile::Startup);
        let enterprise = RuntimeConfig::for_profile(RuntimeProfile::Enterprise);

        assert_eq!(startup.snapshot.strategy, SnapshotStrategyKind::Simple);
        assert_eq!(enterprise.snapshot.strategy, SnapshotStrategyKind::Adaptive);
        assert!(enterprise.query_cache.l1.max_entries > startup.query_cache.l1.max_entries);
        assert_eq!(startup.tiered_store.write_mode, WriteMode::WriteThrough);
        assert_eq!(enterprise.tiered_store.write_mode, WriteMode::WriteBehind);
        assert_eq!(
            startup.async_command_strategy,
            AsyncCommandStrategy::Sync
        );
        assert_eq!(
            enterprise.async_command_strategy,
            AsyncCommandStrategy::Queue
        );
    }

    #[test]
    fn test_builder_overrides_apply() {
        let config = RuntimeConfig::for_profile(RuntimeProfile::Startup)
            .with_snapshot_threshold(25)
            .with_write_mode(WriteMode::WriteBehind)
            .with_projection_strategies(vec![ProjectionStrategyKind::Batched]);

        assert_eq!(config.snapshot.threshold, 25);
        assert_eq!(config.tiered_store.write_mode, WriteMode::WriteBehind);
        assert_eq!(
            config.projection.strategies,
            vec![ProjectionStrategyKind::Batched]
        );
    }
}
