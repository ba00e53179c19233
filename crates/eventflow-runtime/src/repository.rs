//! Aggregate repository: save, load, and batch reconstitution.

use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use eventflow_core::{
    AggregateId, AggregateRoot, EngineError, EngineResult, EventEnvelope,
};

use crate::snapshot::SnapshotManager;
use crate::store::EventStore;

/// Receives freshly appended events after a successful save. The projection
/// dispatcher and the saga coordinator plug in here.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    async fn offer(&self, events: &[EventEnvelope]) -> EngineResult<()>;
}

/// Invalidates query-cache tags after a write. Implemented by the query
/// cache manager.
#[async_trait]
pub trait CacheTagInvalidator: Send + Sync {
    async fn invalidate_tags(&self, tags: &[String]) -> EngineResult<()>;
}

/// Event-sourced repository for one aggregate type.
pub struct AggregateRepository<A: AggregateRoot> {
    store: Arc<dyn EventStore>,
    snapshots: Arc<SnapshotManager>,
    sinks: Vec<Arc<dyn EventSink>>,
    invalidator: Option<Arc<dyn CacheTagInvalidator>>,
    _marker: PhantomData<fn() -> A>,
}

impl<A: AggregateRoot> AggregateRepository<A> {
    pub fn new(store: Arc<dyn EventStore>, snapshots: Arc<SnapshotManager>) -> Self {
        Self {
            store,
            snapshots,
            sinks: Vec::new(),
            invalidator: None,
            _marker: PhantomData,
        }
    }

    /// Register an event sink notified after each successful save.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_cache_invalidator(mut self, invalidator: Arc<dyn CacheTagInvalidator>) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn snapshot_manager(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    /// Append the aggregate's uncommitted events.
    ///
    /// No-op when the buffer is empty. On success the buffer is cleared, the
    /// snapshot strategy is consulted, registered sinks receive the events,
    /// and the aggregate's cache tags are invalidated. Sink and snapshot
    /// failures are logged, not propagated; the append itself is the only
    /// fallible step the caller observes.
    pub async fn save(&self, aggregate: &mut A) -> EngineResult<()> {
        let uncommitted = aggregate.uncommitted_events().to_vec();
        if uncommitted.is_empty() {
            return Ok(());
        }

        let aggregate_id = aggregate.id().clone();
        let expected = aggregate.version() - uncommitted.len() as i64;
        let outcome = self
            .store
            .append(&aggregate_id, &uncommitted, Some(expected))
            .await?;
        aggregate.base_mut().mark_committed();

        debug!(
            aggregate_id = %aggregate_id,
            aggregate_type = A::aggregate_type(),
            events = uncommitted.len(),
            version = outcome.aggregate_version,
            "aggregate saved"
        );

        self.snapshots.maybe_snapshot(aggregate).await;

        // Stamp assigned sequences onto the local copies so realtime
        // projections can advance their checkpoints.
        let mut events = uncommitted;
        if let Some((first, _)) = outcome.sequence_range {
            for (index, event) in events.iter_mut().enumerate() {
                event.sequence_number = first + index as i64;
            }
        }

        for sink in &self.sinks {
            if let Err(err) = sink.offer(&events).await {
                warn!(
                    sink = sink.name(),
                    aggregate_id = %aggregate_id,
                    error = %err,
                    error_code = err.code(),
                    "event sink failed"
                );
            }
        }

        if let Some(invalidator) = &self.invalidator {
            let tags = Self::cache_tags(&aggregate_id);
            if let Err(err) = invalidator.invalidate_tags(&tags).await {
                warn!(
                    aggregate_id = %aggregate_id,
                    error = %err,
                    "cache tag invalidation failed"
                );
            }
        }

        Ok(())
    }

    /// Tags invalidated after a write to the given aggregate.
    pub fn cache_tags(aggregate_id: &AggregateId) -> Vec<String> {
        vec![
            format!("aggregate:{}", aggregate_id),
            format!("{}:{}", A::aggregate_type(), aggregate_id),
            format!("type:{}", A::aggregate_type()),
        ]
    }

    /// Reconstitute an aggregate, seeded from its latest snapshot when one
    /// is available and intact.
    pub async fn load(&self, aggregate_id: &AggregateId) -> EngineResult<A> {
        let started = Instant::now();

        let snapshot = match self.snapshots.store().load(aggregate_id).await {
            Ok(snapshot) => snapshot,
            Err(err @ EngineError::SnapshotIntegrity { .. }) => {
                self.snapshots.record_integrity_failure();
                error!(
                    aggregate_id = %aggregate_id,
                    error = %err,
                    "snapshot integrity check failed, falling back to full replay"
                );
                None
            }
            Err(err) => {
                warn!(
                    aggregate_id = %aggregate_id,
                    error = %err,
                    "snapshot load failed, falling back to full replay"
                );
                None
            }
        };

        let (aggregate, replayed) = match snapshot {
            Some(snapshot) => {
                let tail = self
                    .store
                    .load(aggregate_id, snapshot.version + 1, None)
                    .await?;
                self.snapshots.record_snapshot_load();
                let replayed = tail.len() as u64;
                (A::reconstitute_from_snapshot(&snapshot, &tail)?, replayed)
            }
            None => {
                let events = self.store.load(aggregate_id, 1, None).await?;
                if events.is_empty() {
                    return Err(EngineError::AggregateNotFound {
                        aggregate_id: aggregate_id.to_string(),
                    });
                }
                let replayed = events.len() as u64;
                (A::reconstitute(aggregate_id.clone(), &events)?, replayed)
            }
        };

        self.snapshots
            .metrics()
            .record_load(aggregate_id, started.elapsed(), replayed);

        Ok(aggregate)
    }

    /// Batch reconstitution: snapshots first, then one event batch-load per
    /// distinct tail position. Aggregates with neither snapshot nor events
    /// are absent from the result.
    pub async fn load_batch(
        &self,
        aggregate_ids: &[AggregateId],
    ) -> EngineResult<HashMap<AggregateId, A>> {
        if aggregate_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let snapshots = self.snapshots.store().load_batch(aggregate_ids).await?;

        // Group by tail position so each group is one store round-trip.
        let mut groups: HashMap<i64, Vec<AggregateId>> = HashMap::new();
        for id in aggregate_ids {
            let from_version = snapshots.get(id).map(|s| s.version + 1).unwrap_or(1);
            groups.entry(from_version).or_default().push(id.clone());
        }

        let loads = groups.into_iter().map(|(from_version, ids)| {
            let store = Arc::clone(&self.store);
            async move {
                store
                    .load_batch(&ids, from_version, None)
                    .await
                    .map(|streams| (from_version, streams))
            }
        });

        let mut result = HashMap::new();
        for loaded in join_all(loads).await {
            let (_, streams) = loaded?;
            for (id, stream) in streams {
                match snapshots.get(&id) {
                    Some(snapshot) => {
                        let aggregate = A::reconstitute_from_snapshot(snapshot, &stream)?;
                        result.insert(id, aggregate);
                    }
                    None => {
                        if stream.is_empty() {
                            continue;
                        }
                        let aggregate = A::reconstitute(id.clone(), &stream)?;
                        result.insert(id, aggregate);
                    }
                }
            }
        }
        Ok(result)
    }

    pub async fn exists(&self, aggregate_id: &AggregateId) -> EngineResult<bool> {
        self.store.aggregate_exists(aggregate_id).await
    }

    pub async fn version(&self, aggregate_id: &AggregateId) -> EngineResult<i64> {
        self.store.aggregate_version(aggregate_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{InMemorySnapshotStore, SimpleSnapshotStrategy, SnapshotStore};
    use crate::store::InMemoryEventStore;
    use eventflow_core::{AggregateBase, AggregateSnapshot, DomainEventPayload};
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Registered {
        email: String,
    }

    impl DomainEventPayload for Registered {
        fn event_type() -> &'static str {
            "user.registered"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Renamed {
        name: String,
    }

    impl DomainEventPayload for Renamed {
        fn event_type() -> &'static str {
            "user.renamed"
        }
    }

    #[derive(Debug)]
    struct User {
        base: AggregateBase,
        email: String,
        name: String,
    }

    impl AggregateRoot for User {
        fn aggregate_type() -> &'static str {
            "user"
        }

        fn new(id: AggregateId) -> Self {
            Self {
                base: AggregateBase::new(id),
                email: String::new(),
                name: String::new(),
            }
        }

        fn base(&self) -> &AggregateBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut AggregateBase {
            &mut self.base
        }

        fn apply(&mut self, event: &EventEnvelope) -> EngineResult<()> {
            match event.event_type.as_str() {
                "user.registered" => {
                    let payload: Registered = event.decode()?;
                    self.email = payload.email;
                }
                "user.renamed" => {
                    let payload: Renamed = event.decode()?;
                    self.name = payload.name;
                }
                _ => {}
            }
            Ok(())
        }

        fn snapshot_state(&self) -> EngineResult<Value> {
            Ok(json!({"email": self.email, "name": self.name}))
        }

        fn restore_snapshot_state(&mut self, state: &Value) -> EngineResult<()> {
            self.email = state
                .get("email")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            self.name = state
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(())
        }
    }

    struct RecordingSink {
        seen: Mutex<Vec<EventEnvelope>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn offer(&self, events: &[EventEnvelope]) -> EngineResult<()> {
            self.seen.lock().await.extend(events.iter().cloned());
            Ok(())
        }
    }

    fn repository(
        threshold: i64,
    ) -> (
        AggregateRepository<User>,
        Arc<dyn SnapshotStore>,
        Arc<RecordingSink>,
    ) {
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let snapshot_store: Arc<dyn SnapshotStore> = Arc::new(InMemorySnapshotStore::new());
        let manager = Arc::new(SnapshotManager::new(
            Arc::clone(&snapshot_store),
            Arc::new(SimpleSnapshotStrategy::new(threshold)),
        ));
        let sink = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });
        let repo = AggregateRepository::new(store, manager)
            .with_sink(Arc::clone(&sink) as Arc<dyn EventSink>);
        (repo, snapshot_store, sink)
    }

    #[tokio::test]
    async fn test_save_then_load_round_trips() {
        let (repo, _, _) = repository(10);
        let id = AggregateId::new("U-1");
        let mut user = User::new(id.clone());
        user.record(Registered {
            email: "a@example.com".to_string(),
        })
        .unwrap();
        user.record(Renamed {
            name: "Ada".to_string(),
        })
        .unwrap();
        repo.save(&mut user).await.unwrap();
        assert!(user.uncommitted_events().is_empty());

        let loaded = repo.load(&id).await.unwrap();
        assert_eq!(loaded.version(), 2);
        assert_eq!(loaded.email, "a@example.com");
        assert_eq!(loaded.name, "Ada");
    }

    #[tokio::test]
    async fn test_save_with_empty_buffer_is_noop() {
        let (repo, _, sink) = repository(10);
        let mut user = User::new(AggregateId::new("U-1"));
        repo.save(&mut user).await.unwrap();
        assert!(sink.seen.lock().await.is_empty());
        assert!(!repo.exists(user.id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_load_unknown_aggregate_fails() {
        let (repo, _, _) = repository(10);
        let err = repo.load(&AggregateId::new("missing")).await.unwrap_err();
        assert_eq!(err.code(), "aggregate_not_found");
    }

    #[tokio::test]
    async fn test_snapshot_written_at_threshold_and_used_on_load() {
        let (repo, snapshot_store, _) = repository(3);
        let id = AggregateId::new("U-1");
        let mut user = User::new(id.clone());
        user.record(Registered {
            email: "a@example.com".to_string(),
        })
        .unwrap();
        for n in 0..2 {
            user.record(Renamed {
                name: format!("name-{}", n),
            })
            .unwrap();
        }
        repo.save(&mut user).await.unwrap();

        let snapshot = snapshot_store.load(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.version, 3);

        let loaded = repo.load(&id).await.unwrap();
        assert_eq!(loaded.version(), 3);
        assert_eq!(repo.snapshot_manager().statistics().loads_from_snapshot, 1);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_falls_back_to_full_replay() {
        let (repo, snapshot_store, _) = repository(2);
        let id = AggregateId::new("U-1");
        let mut user = User::new(id.clone());
        user.record(Registered {
            email: "a@example.com".to_string(),
        })
        .unwrap();
        user.record(Renamed {
            name: "Ada".to_string(),
        })
        .unwrap();
        repo.save(&mut user).await.unwrap();

        // Corrupt the stored snapshot
        let mut snapshot = snapshot_store.load(&id).await.unwrap().unwrap();
        snapshot.state = json!({"email": "evil@example.com", "name": "x"});
        // Bypass hashing by writing the tampered state directly
        let tampered = AggregateSnapshot {
            state: snapshot.state.clone(),
            ..snapshot
        };
        snapshot_store.save(tampered).await.unwrap();

        let loaded = repo.load(&id).await.unwrap();
        assert_eq!(loaded.email, "a@example.com");
        assert_eq!(loaded.version(), 2);
    }

    #[tokio::test]
    async fn test_sinks_receive_sequenced_events() {
        let (repo, _, sink) = repository(10);
        let id = AggregateId::new("U-1");
        let mut user = User::new(id.clone());
        user.record(Registered {
            email: "a@example.com".to_string(),
        })
        .unwrap();
        repo.save(&mut user).await.unwrap();

        let seen = sink.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].sequence_number, 1);
    }

    #[tokio::test]
    async fn test_load_batch_mixes_snapshot_and_replay_paths() {
        let (repo, _, _) = repository(2);
        let a = AggregateId::new("U-A");
        let b = AggregateId::new("U-B");

        let mut ua = User::new(a.clone());
        ua.record(Registered {
            email: "a@example.com".to_string(),
        })
        .unwrap();
        ua.record(Renamed {
            name: "Ada".to_string(),
        })
        .unwrap(); // snapshot at 2
        ua.record(Renamed {
            name: "Ada L".to_string(),
        })
        .unwrap();
        repo.save(&mut ua).await.unwrap();

        let mut ub = User::new(b.clone());
        ub.record(Registered {
            email: "b@example.com".to_string(),
        })
        .unwrap();
        repo.save(&mut ub).await.unwrap();

        let missing = AggregateId::new("U-missing");
        let result = repo
            .load_batch(&[a.clone(), b.clone(), missing.clone()])
            .await
            .unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result.get(&a).unwrap().version(), 3);
        assert_eq!(result.get(&a).unwrap().name, "Ada L");
        assert_eq!(result.get(&b).unwrap().version(), 1);
        assert!(!result.contains_key(&missing));
    }
}
