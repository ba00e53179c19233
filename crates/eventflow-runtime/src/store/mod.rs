//! Event store contract and implementations.
//!
//! The warm store is the durable append-only log and the only source of the
//! global `sequence_number`; the hot store is a TTL-bounded accelerator for
//! per-aggregate reads; [`TieredEventStore`] composes the two with
//! read-through promotion and optional asynchronous write-back.

pub mod hot;
pub mod memory;
pub mod tiered;

pub use hot::{HotEventCache, HotStoreConfig, HotStoreStatistics};
pub use memory::InMemoryEventStore;
pub use tiered::{
    TieredEventStore, TieredStoreConfig, WriteBackConfig, WriteBackDeadLetter, WriteMode,
    WRITE_BACK_JOB_TYPE,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use eventflow_core::{AggregateId, EngineResult, EventEnvelope, EventStream};

/// Result of a successful append
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppendOutcome {
    /// Aggregate version after the append
    pub aggregate_version: i64,
    /// Global sequence range assigned by the durable log, absent while a
    /// write-behind append is still in flight
    pub sequence_range: Option<(i64, i64)>,
}

/// Aggregate counts exposed for monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventStoreStatistics {
    pub total_events: u64,
    pub total_aggregates: u64,
    pub latest_sequence: i64,
}

/// Append-only event log keyed by aggregate.
///
/// `append` enforces optimistic concurrency: when `expected_version` is
/// `Some(v)` and the stored aggregate version differs from `v`, the append
/// fails with [`EngineError::ConcurrencyConflict`] and no partial events are
/// persisted. An empty `events` slice is a no-op.
///
/// [`EngineError::ConcurrencyConflict`]: eventflow_core::EngineError::ConcurrencyConflict
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(
        &self,
        aggregate_id: &AggregateId,
        events: &[EventEnvelope],
        expected_version: Option<i64>,
    ) -> EngineResult<AppendOutcome>;

    /// Events for one aggregate ordered by version ascending.
    /// `from_version` is inclusive; `to_version` (when present) is inclusive.
    async fn load(
        &self,
        aggregate_id: &AggregateId,
        from_version: i64,
        to_version: Option<i64>,
    ) -> EngineResult<EventStream>;

    /// Single-round-trip equivalent of N loads. Absent aggregates map to
    /// empty streams; an empty `ids` slice yields an empty map.
    async fn load_batch(
        &self,
        aggregate_ids: &[AggregateId],
        from_version: i64,
        to_version: Option<i64>,
    ) -> EngineResult<HashMap<AggregateId, EventStream>>;

    async fn aggregate_exists(&self, aggregate_id: &AggregateId) -> EngineResult<bool>;

    async fn aggregate_exists_batch(
        &self,
        aggregate_ids: &[AggregateId],
    ) -> EngineResult<HashMap<AggregateId, bool>>;

    /// Current highest version, 0 when the aggregate has no events.
    async fn aggregate_version(&self, aggregate_id: &AggregateId) -> EngineResult<i64>;

    async fn aggregate_versions_batch(
        &self,
        aggregate_ids: &[AggregateId],
    ) -> EngineResult<HashMap<AggregateId, i64>>;

    /// Events of one type ordered by global sequence, for projection and
    /// replay queries. Served by the warm store only.
    async fn load_events_by_type(
        &self,
        event_type: &str,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<EventEnvelope>>;

    /// Events with `sequence_number >= from_sequence` ordered ascending.
    /// Served by the warm store only; this is the projection cursor.
    async fn load_events_from_sequence(
        &self,
        from_sequence: i64,
        limit: usize,
    ) -> EngineResult<Vec<EventEnvelope>>;

    /// Highest assigned global sequence number, 0 when the log is empty.
    async fn latest_sequence(&self) -> EngineResult<i64>;

    async fn statistics(&self) -> EngineResult<EventStoreStatistics>;
}
