// Projection pipeline: crash recovery, replay determinism, async dispatch.

mod common;

use async_trait::async_trait;
use common::registered_event;
use eventflow_core::{AggregateId, EngineError, EngineResult, EventEnvelope};
use eventflow_runtime::{
    AsyncDispatchStrategy, CheckpointStore, DispatchStrategy, EventStore, EventTypePattern,
    InMemoryCheckpointStore, InMemoryEventStore, InMemoryJobQueue, InMemoryReadModelStore,
    JobQueueConfig, ProjectionManager, ProjectionManagerConfig, Projector, ProjectorCore,
    ReadModel, ReadModelStore,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

const COUNT_MODEL: &str = "user_count";

/// Counts user registrations into a read model.
struct UserCountProjector {
    core: ProjectorCore,
    read_models: Arc<dyn ReadModelStore>,
    fail_after_sequence: AtomicI64,
}

impl UserCountProjector {
    fn new(read_models: Arc<dyn ReadModelStore>) -> Self {
        Self {
            core: ProjectorCore::new("user_count"),
            read_models,
            fail_after_sequence: AtomicI64::new(i64::MAX),
        }
    }

    async fn count(read_models: &Arc<dyn ReadModelStore>) -> i64 {
        read_models
            .get(COUNT_MODEL, "all")
            .await
            .unwrap()
            .and_then(|m| m.data.get("count").and_then(Value::as_i64))
            .unwrap_or(0)
    }
}

#[async_trait]
impl Projector for UserCountProjector {
    fn core(&self) -> &ProjectorCore {
        &self.core
    }

    fn handled_events(&self) -> Vec<String> {
        vec!["user.registered".to_string()]
    }

    async fn handle(&self, event: &EventEnvelope) -> EngineResult<()> {
        if event.sequence_number > self.fail_after_sequence.load(Ordering::SeqCst) {
            return Err(EngineError::storage("projection", "simulated crash"));
        }
        let current = Self::count(&self.read_models).await;
        self.read_models
            .put(ReadModel::new(
                "all",
                COUNT_MODEL,
                json!({"count": current + 1}),
                event.version,
            ))
            .await
    }

    async fn reset(&self) -> EngineResult<()> {
        self.read_models.delete(COUNT_MODEL, "all").await?;
        Ok(())
    }
}

async fn seed_registrations(store: &InMemoryEventStore, start: i64, count: i64) {
    for n in start..start + count {
        let id = AggregateId::new(format!("U-{}", n));
        store
            .append(&id, &[registered_event(&id, 1)], Some(0))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_projector_resumes_after_crash_and_reaches_the_full_count() {
    let store = Arc::new(InMemoryEventStore::new());
    seed_registrations(&store, 0, 7).await;
    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let read_models: Arc<dyn ReadModelStore> = Arc::new(InMemoryReadModelStore::new());

    // First run crashes after sequence 4
    {
        let manager = ProjectionManager::new(
            Arc::clone(&store) as Arc<dyn EventStore>,
            Arc::clone(&checkpoints),
            ProjectionManagerConfig::default(),
        );
        let projector = Arc::new(UserCountProjector::new(Arc::clone(&read_models)));
        projector.fail_after_sequence.store(4, Ordering::SeqCst);
        manager
            .register(Arc::clone(&projector) as Arc<dyn Projector>)
            .await
            .unwrap();

        let report = manager.process_new_events().await;
        assert!(report.failed.contains_key("user_count"));
        assert_eq!(projector.position(), 4);
        assert_eq!(UserCountProjector::count(&read_models).await, 4);
    }

    // Restart: a fresh projector resumes at sequence 5
    let manager = ProjectionManager::new(
        Arc::clone(&store) as Arc<dyn EventStore>,
        Arc::clone(&checkpoints),
        ProjectionManagerConfig::default(),
    );
    let projector = Arc::new(UserCountProjector::new(Arc::clone(&read_models)));
    manager
        .register(Arc::clone(&projector) as Arc<dyn Projector>)
        .await
        .unwrap();
    assert_eq!(projector.position(), 4);

    let report = manager.process_new_events().await;
    assert_eq!(report.processed.get("user_count"), Some(&3));
    assert_eq!(UserCountProjector::count(&read_models).await, 7);

    // Full replay after reset yields the same terminal count
    let replayed = manager.replay("user_count", None).await.unwrap();
    assert_eq!(replayed, 7);
    assert_eq!(UserCountProjector::count(&read_models).await, 7);
}

#[tokio::test]
async fn test_async_dispatch_strategy_applies_projections_through_the_queue() {
    let store = Arc::new(InMemoryEventStore::new());
    seed_registrations(&store, 0, 5).await;
    let events = store.load_events_from_sequence(1, 100).await.unwrap();

    let read_models: Arc<dyn ReadModelStore> = Arc::new(InMemoryReadModelStore::new());
    let manager = Arc::new(ProjectionManager::new(
        Arc::clone(&store) as Arc<dyn EventStore>,
        Arc::new(InMemoryCheckpointStore::new()) as Arc<dyn CheckpointStore>,
        ProjectionManagerConfig::default(),
    ));
    let projector = Arc::new(UserCountProjector::new(Arc::clone(&read_models)));
    manager
        .register(Arc::clone(&projector) as Arc<dyn Projector>)
        .await
        .unwrap();

    let queue = InMemoryJobQueue::start(JobQueueConfig::default());
    let strategy = AsyncDispatchStrategy::new(
        Arc::clone(&manager),
        Arc::clone(&queue),
        EventTypePattern::new("user.*").unwrap(),
    )
    .await;

    strategy.dispatch(&events).await.unwrap();
    queue.drain().await;

    assert_eq!(UserCountProjector::count(&read_models).await, 5);
    assert_eq!(projector.position(), 5);
}

#[tokio::test]
async fn test_incremental_and_replayed_projections_agree() {
    let store = Arc::new(InMemoryEventStore::new());
    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let read_models: Arc<dyn ReadModelStore> = Arc::new(InMemoryReadModelStore::new());

    let manager = ProjectionManager::new(
        Arc::clone(&store) as Arc<dyn EventStore>,
        Arc::clone(&checkpoints),
        ProjectionManagerConfig {
            batch_size: 2,
            ..Default::default()
        },
    );
    let projector = Arc::new(UserCountProjector::new(Arc::clone(&read_models)));
    manager
        .register(Arc::clone(&projector) as Arc<dyn Projector>)
        .await
        .unwrap();

    // Interleave ingestion and processing
    seed_registrations(&store, 0, 3).await;
    manager.process_new_events().await;
    seed_registrations(&store, 3, 4).await;
    manager.process_new_events().await;
    let incremental = UserCountProjector::count(&read_models).await;
    assert_eq!(incremental, 7);

    manager.replay("user_count", None).await.unwrap();
    assert_eq!(UserCountProjector::count(&read_models).await, incremental);
}
