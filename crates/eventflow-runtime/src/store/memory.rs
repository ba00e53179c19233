//! In-memory warm store.
//!
//! Full warm-store semantics without a database: a global monotonic sequence,
//! unique `(aggregate_id, version)` enforcement, and sequence-cursor queries.
//! This is the test backbone and a workable store for single-process
//! deployments.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use eventflow_core::{AggregateId, EngineError, EngineResult, EventEnvelope, EventStream};

use super::{AppendOutcome, EventStore, EventStoreStatistics};

#[derive(Debug, Clone)]
pub struct InMemoryStoreConfig {
    /// Stamp each appended event with an integrity checksum
    pub enable_checksums: bool,
}

impl Default for InMemoryStoreConfig {
    fn default() -> Self {
        Self {
            enable_checksums: true,
        }
    }
}

#[derive(Default)]
struct MemoryLog {
    by_aggregate: HashMap<AggregateId, Vec<EventEnvelope>>,
    global: Vec<EventEnvelope>,
    next_sequence: i64,
}

/// Warm event store backed by process memory.
pub struct InMemoryEventStore {
    log: RwLock<MemoryLog>,
    config: InMemoryStoreConfig,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::with_config(InMemoryStoreConfig::default())
    }

    pub fn with_config(config: InMemoryStoreConfig) -> Self {
        Self {
            log: RwLock::new(MemoryLog {
                next_sequence: 1,
                ..Default::default()
            }),
            config,
        }
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

fn slice_range(events: &[EventEnvelope], from_version: i64, to_version: Option<i64>) -> EventStream {
    events
        .iter()
        .filter(|e| {
            e.version >= from_version && to_version.map(|to| e.version <= to).unwrap_or(true)
        })
        .cloned()
        .collect()
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        aggregate_id: &AggregateId,
        events: &[EventEnvelope],
        expected_version: Option<i64>,
    ) -> EngineResult<AppendOutcome> {
        let mut log = self.log.write().await;
        let current = log
            .by_aggregate
            .get(aggregate_id)
            .map(|e| e.len() as i64)
            .unwrap_or(0);

        if events.is_empty() {
            return Ok(AppendOutcome {
                aggregate_version: current,
                sequence_range: None,
            });
        }

        let expected = expected_version.unwrap_or(events[0].version - 1);
        if current != expected {
            return Err(EngineError::ConcurrencyConflict {
                aggregate_id: aggregate_id.to_string(),
                expected,
                actual: current,
            });
        }

        // Validate the whole batch before touching the log: either all
        // events persist or none do.
        for (offset, event) in events.iter().enumerate() {
            let wanted = expected + 1 + offset as i64;
            if event.version != wanted {
                return Err(EngineError::storage(
                    "append",
                    format!(
                        "event versions must be consecutive: expected {}, got {} for aggregate {}",
                        wanted, event.version, aggregate_id
                    ),
                ));
            }
        }

        let first_sequence = log.next_sequence;
        let mut stored = Vec::with_capacity(events.len());
        for event in events {
            let mut event = event.clone();
            event.sequence_number = log.next_sequence;
            event.recorded_at = Utc::now();
            if self.config.enable_checksums && event.checksum.is_none() {
                event = event.sealed();
            }
            log.next_sequence += 1;
            stored.push(event);
        }
        let last_sequence = log.next_sequence - 1;

        log.global.extend(stored.iter().cloned());
        log.by_aggregate
            .entry(aggregate_id.clone())
            .or_default()
            .extend(stored);

        debug!(
            aggregate_id = %aggregate_id,
            events = events.len(),
            first_sequence,
            last_sequence,
            "appended events"
        );

        Ok(AppendOutcome {
            aggregate_version: expected + events.len() as i64,
            sequence_range: Some((first_sequence, last_sequence)),
        })
    }

    async fn load(
        &self,
        aggregate_id: &AggregateId,
        from_version: i64,
        to_version: Option<i64>,
    ) -> EngineResult<EventStream> {
        let log = self.log.read().await;
        Ok(log
            .by_aggregate
            .get(aggregate_id)
            .map(|events| slice_range(events, from_version, to_version))
            .unwrap_or_default())
    }

    async fn load_batch(
        &self,
        aggregate_ids: &[AggregateId],
        from_version: i64,
        to_version: Option<i64>,
    ) -> EngineResult<HashMap<AggregateId, EventStream>> {
        let log = self.log.read().await;
        let mut result = HashMap::with_capacity(aggregate_ids.len());
        for id in aggregate_ids {
            let stream = log
                .by_aggregate
                .get(id)
                .map(|events| slice_range(events, from_version, to_version))
                .unwrap_or_default();
            result.insert(id.clone(), stream);
        }
        Ok(result)
    }

    async fn aggregate_exists(&self, aggregate_id: &AggregateId) -> EngineResult<bool> {
        let log = self.log.read().await;
        Ok(log.by_aggregate.contains_key(aggregate_id))
    }

    async fn aggregate_exists_batch(
        &self,
        aggregate_ids: &[AggregateId],
    ) -> EngineResult<HashMap<AggregateId, bool>> {
        let log = self.log.read().await;
        Ok(aggregate_ids
            .iter()
            .map(|id| (id.clone(), log.by_aggregate.contains_key(id)))
            .collect())
    }

    async fn aggregate_version(&self, aggregate_id: &AggregateId) -> EngineResult<i64> {
        let log = self.log.read().await;
        Ok(log
            .by_aggregate
            .get(aggregate_id)
            .and_then(|e| e.last())
            .map(|e| e.version)
            .unwrap_or(0))
    }

    async fn aggregate_versions_batch(
        &self,
        aggregate_ids: &[AggregateId],
    ) -> EngineResult<HashMap<AggregateId, i64>> {
        let log = self.log.read().await;
        Ok(aggregate_ids
            .iter()
            .map(|id| {
                let version = log
                    .by_aggregate
                    .get(id)
                    .and_then(|e| e.last())
                    .map(|e| e.version)
                    .unwrap_or(0);
                (id.clone(), version)
            })
            .collect())
    }

    async fn load_events_by_type(
        &self,
        event_type: &str,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<EventEnvelope>> {
        let log = self.log.read().await;
        Ok(log
            .global
            .iter()
            .filter(|e| e.event_type == event_type)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn load_events_from_sequence(
        &self,
        from_sequence: i64,
        limit: usize,
    ) -> EngineResult<Vec<EventEnvelope>> {
        let log = self.log.read().await;
        Ok(log
            .global
            .iter()
            .filter(|e| e.sequence_number >= from_sequence)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest_sequence(&self) -> EngineResult<i64> {
        let log = self.log.read().await;
        Ok(log.next_sequence - 1)
    }

    async fn statistics(&self) -> EngineResult<EventStoreStatistics> {
        let log = self.log.read().await;
        Ok(EventStoreStatistics {
            total_events: log.global.len() as u64,
            total_aggregates: log.by_aggregate.len() as u64,
            latest_sequence: log.next_sequence - 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn events_for(id: &AggregateId, from: i64, count: i64) -> Vec<EventEnvelope> {
        (0..count)
            .map(|i| {
                EventEnvelope::new(
                    id.clone(),
                    "user",
                    "user.registered",
                    1,
                    from + i,
                    json!({"n": from + i}),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_append_assigns_monotonic_sequences() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new("U-1");
        let b = AggregateId::new("U-2");

        let first = store.append(&a, &events_for(&a, 1, 2), Some(0)).await.unwrap();
        let second = store.append(&b, &events_for(&b, 1, 1), Some(0)).await.unwrap();

        assert_eq!(first.sequence_range, Some((1, 2)));
        assert_eq!(second.sequence_range, Some((3, 3)));
        assert_eq!(store.latest_sequence().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_version_conflict_persists_nothing() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new("U-1");
        store.append(&id, &events_for(&id, 1, 3), Some(0)).await.unwrap();

        let err = store
            .append(&id, &events_for(&id, 3, 1), Some(2))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "concurrency_conflict");
        assert_eq!(store.aggregate_version(&id).await.unwrap(), 3);
        assert_eq!(store.load(&id, 1, None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_empty_append_is_a_noop() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new("U-1");
        let outcome = store.append(&id, &[], Some(0)).await.unwrap();
        assert_eq!(outcome.aggregate_version, 0);
        assert!(!store.aggregate_exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_load_respects_version_range() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new("U-1");
        store.append(&id, &events_for(&id, 1, 5), Some(0)).await.unwrap();

        let tail = store.load(&id, 3, None).await.unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail.first().unwrap().version, 3);

        let window = store.load(&id, 2, Some(4)).await.unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(window.last().unwrap().version, 4);
    }

    #[tokio::test]
    async fn test_load_batch_maps_absent_aggregates_to_empty_streams() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new("U-1");
        let missing = AggregateId::new("U-404");
        store.append(&a, &events_for(&a, 1, 2), Some(0)).await.unwrap();

        let result = store
            .load_batch(&[a.clone(), missing.clone()], 1, None)
            .await
            .unwrap();
        assert_eq!(result.get(&a).unwrap().len(), 2);
        assert!(result.get(&missing).unwrap().is_empty());

        let empty = store.load_batch(&[], 1, None).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_sequence_and_type_queries_serve_projections() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new("U-1");
        let b = AggregateId::new("U-2");
        store.append(&a, &events_for(&a, 1, 2), Some(0)).await.unwrap();
        store.append(&b, &events_for(&b, 1, 2), Some(0)).await.unwrap();

        let from_two = store.load_events_from_sequence(2, 10).await.unwrap();
        assert_eq!(from_two.len(), 3);
        assert_eq!(from_two[0].sequence_number, 2);

        let by_type = store.load_events_by_type("user.registered", 2, 1).await.unwrap();
        assert_eq!(by_type.len(), 2);
        assert_eq!(by_type[0].sequence_number, 2);
    }

    #[tokio::test]
    async fn test_appended_events_carry_checksums() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new("U-1");
        store.append(&id, &events_for(&id, 1, 1), Some(0)).await.unwrap();
        let stream = store.load(&id, 1, None).await.unwrap();
        assert!(stream[0].checksum.is_some());
        assert!(stream[0].verify_checksum());
    }
}
