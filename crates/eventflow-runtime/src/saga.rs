//! Saga coordination: persistent workflow state machines reacting to events,
//! dispatching commands, and compensating on failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use eventflow_core::{EngineError, EngineResult, EventEnvelope};

use crate::command::{CommandBus, CommandEnvelope};
use crate::repository::EventSink;

/// Saga lifecycle states.
///
/// ```text
/// PENDING → RUNNING                      first handled event
/// PENDING/RUNNING → FAILED               handler fails (non-retryable)
/// RUNNING → COMPLETED                    should_complete() returns true
/// FAILED/RUNNING → COMPENSATING          compensation initiated
/// COMPENSATING → COMPENSATED             all compensations succeed
/// COMPENSATING → FAILED                  a compensation fails
/// any non-terminal → TIMED_OUT           timeout_at < now (sweep)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaState {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
    TimedOut,
}

impl SagaState {
    /// Active sagas receive events.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SagaState::Pending | SagaState::Running | SagaState::Compensating
        )
    }

    /// Terminal sagas are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Compensated | SagaState::TimedOut
        )
    }
}

/// Persisted saga row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaRecord {
    pub saga_id: Uuid,
    pub saga_type: String,
    pub state: SagaState,
    pub state_data: Value,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A long-running workflow reacting to events and emitting commands.
///
/// Implementations keep their progress in serializable state
/// ([`state_data`](Saga::state_data) / [`restore_state`](Saga::restore_state));
/// the coordinator persists it through the [`SagaStore`] after every handled
/// event.
#[async_trait]
pub trait Saga: Send + Sync {
    fn saga_id(&self) -> Uuid;

    fn saga_type(&self) -> &str;

    fn state(&self) -> SagaState;

    fn set_state(&mut self, state: SagaState);

    /// Whether this saga reacts to the event.
    fn handles(&self, event: &EventEnvelope) -> bool;

    /// React to an event, possibly emitting commands for the coordinator to
    /// dispatch.
    async fn handle_event(&mut self, event: &EventEnvelope)
        -> EngineResult<Vec<CommandEnvelope>>;

    /// Whether the workflow has reached its goal.
    fn should_complete(&self) -> bool;

    /// Compensation commands in execution order (reverse of the effects).
    fn compensation_commands(&self) -> Vec<CommandEnvelope>;

    /// Whether all compensations have taken effect. Sagas whose
    /// compensations are confirmed by later events override this to gate
    /// COMPENSATING → COMPENSATED.
    fn compensation_complete(&self) -> bool {
        true
    }

    fn timeout_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn state_data(&self) -> EngineResult<Value>;

    fn restore_state(&mut self, data: &Value) -> EngineResult<()>;

    fn metadata(&self) -> HashMap<String, Value> {
        HashMap::new()
    }
}

/// Factory rebuilding a saga instance for hydration.
pub type SagaFactory = Arc<dyn Fn(Uuid) -> Box<dyn Saga> + Send + Sync>;

/// Predicate deciding whether an event initiates a new saga instance.
pub type InitiationPredicate = Arc<dyn Fn(&EventEnvelope) -> bool + Send + Sync>;

/// Registered saga type: hydration goes through the factory, never through
/// reflection.
#[derive(Clone)]
pub struct SagaDefinition {
    pub saga_type: String,
    pub factory: SagaFactory,
    pub initiates_on: InitiationPredicate,
}

impl SagaDefinition {
    pub fn new(
        saga_type: impl Into<String>,
        factory: SagaFactory,
        initiates_on: InitiationPredicate,
    ) -> Self {
        Self {
            saga_type: saga_type.into(),
            factory,
            initiates_on,
        }
    }
}

/// Maps `saga_type` strings to factories.
pub struct SagaTypeRegistry {
    definitions: RwLock<HashMap<String, SagaDefinition>>,
}

impl SagaTypeRegistry {
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, definition: SagaDefinition) {
        let mut definitions = self.definitions.write().await;
        definitions.insert(definition.saga_type.clone(), definition);
    }

    pub async fn definition(&self, saga_type: &str) -> Option<SagaDefinition> {
        let definitions = self.definitions.read().await;
        definitions.get(saga_type).cloned()
    }

    pub async fn initiators_for(&self, event: &EventEnvelope) -> Vec<SagaDefinition> {
        let definitions = self.definitions.read().await;
        definitions
            .values()
            .filter(|d| (d.initiates_on)(event))
            .cloned()
            .collect()
    }

    /// Rebuild a saga instance from its persisted record.
    pub async fn hydrate(&self, record: &SagaRecord) -> EngineResult<Box<dyn Saga>> {
        let definition =
            self.definition(&record.saga_type)
                .await
                .ok_or_else(|| EngineError::Saga {
                    saga_id: record.saga_id.to_string(),
                    message: format!("saga type '{}' not registered", record.saga_type),
                })?;
        let mut saga = (definition.factory)(record.saga_id);
        saga.restore_state(&record.state_data)?;
        saga.set_state(record.state);
        Ok(saga)
    }
}

impl Default for SagaTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Persistence for saga records. `acquire` serializes mutation per saga.
#[async_trait]
pub trait SagaStore: Send + Sync {
    async fn save(&self, record: &SagaRecord) -> EngineResult<()>;

    async fn load(&self, saga_id: Uuid) -> EngineResult<Option<SagaRecord>>;

    /// Sagas in an active state (PENDING, RUNNING, COMPENSATING).
    async fn load_active(&self) -> EngineResult<Vec<SagaRecord>>;

    async fn load_by_state(&self, state: SagaState) -> EngineResult<Vec<SagaRecord>>;

    /// Non-terminal sagas whose `timeout_at` has passed.
    async fn load_timed_out(&self, now: DateTime<Utc>) -> EngineResult<Vec<SagaRecord>>;

    /// Per-saga mutation lock.
    async fn acquire(&self, saga_id: Uuid) -> EngineResult<OwnedMutexGuard<()>>;

    /// Drop terminal sagas older than `before`. Returns the removed count.
    async fn cleanup_finished(&self, before: DateTime<Utc>) -> EngineResult<usize>;
}

/// In-memory saga store with per-saga locks.
pub struct InMemorySagaStore {
    records: RwLock<HashMap<Uuid, SagaRecord>>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemorySagaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn save(&self, record: &SagaRecord) -> EngineResult<()> {
        let mut records = self.records.write().await;
        records.insert(record.saga_id, record.clone());
        Ok(())
    }

    async fn load(&self, saga_id: Uuid) -> EngineResult<Option<SagaRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&saga_id).cloned())
    }

    async fn load_active(&self) -> EngineResult<Vec<SagaRecord>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| r.state.is_active())
            .cloned()
            .collect())
    }

    async fn load_by_state(&self, state: SagaState) -> EngineResult<Vec<SagaRecord>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect())
    }

    async fn load_timed_out(&self, now: DateTime<Utc>) -> EngineResult<Vec<SagaRecord>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| {
                !r.state.is_terminal()
                    && r.timeout_at.map(|at| at < now).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn acquire(&self, saga_id: Uuid) -> EngineResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(saga_id).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        Ok(lock.lock_owned().await)
    }

    async fn cleanup_finished(&self, before: DateTime<Utc>) -> EngineResult<usize> {
        let mut records = self.records.write().await;
        let initial = records.len();
        records.retain(|_, r| !(r.state.is_terminal() && r.updated_at < before));
        Ok(initial - records.len())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaCoordinatorConfig {
    pub sweep_interval_seconds: u64,
}

impl Default for SagaCoordinatorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SagaStatistics {
    pub initiated: u64,
    pub events_handled: u64,
    pub completed: u64,
    pub failed: u64,
    pub compensated: u64,
    pub timed_out: u64,
}

/// Routes events to active sagas, initiates new ones, dispatches emitted
/// commands, and drives compensation and timeouts.
pub struct SagaCoordinator {
    registry: SagaTypeRegistry,
    store: Arc<dyn SagaStore>,
    bus: Arc<CommandBus>,
    config: SagaCoordinatorConfig,
    stats: std::sync::Mutex<SagaStatistics>,
}

impl SagaCoordinator {
    pub fn new(
        store: Arc<dyn SagaStore>,
        bus: Arc<CommandBus>,
        config: SagaCoordinatorConfig,
    ) -> Self {
        Self {
            registry: SagaTypeRegistry::new(),
            store,
            bus,
            config,
            stats: std::sync::Mutex::new(SagaStatistics::default()),
        }
    }

    pub fn registry(&self) -> &SagaTypeRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn SagaStore> {
        &self.store
    }

    pub async fn register_saga_type(&self, definition: SagaDefinition) {
        self.registry.register(definition).await;
    }

    /// React to one committed event: initiate matching saga types, then fan
    /// the event in to every active saga that handles it.
    pub async fn on_event(&self, event: &EventEnvelope) -> EngineResult<()> {
        let mut just_initiated = Vec::new();
        for definition in self.registry.initiators_for(event).await {
            let saga_id = self.initiate(&definition, event).await?;
            just_initiated.push(saga_id);
        }

        for record in self.store.load_active().await? {
            if just_initiated.contains(&record.saga_id) {
                // The initiating event was already processed at creation
                continue;
            }
            if self.registry.definition(&record.saga_type).await.is_none() {
                // Bookkeeping records (compensation children) have no
                // registered type and receive no events
                continue;
            }
            if let Err(err) = self.process_saga_event(record.saga_id, event).await {
                error!(
                    saga_id = %record.saga_id,
                    saga_type = %record.saga_type,
                    event_type = %event.event_type,
                    error = %err,
                    error_code = err.code(),
                    "saga event handling failed"
                );
            }
        }
        Ok(())
    }

    async fn initiate(
        &self,
        definition: &SagaDefinition,
        event: &EventEnvelope,
    ) -> EngineResult<Uuid> {
        let saga_id = Uuid::new_v4();
        let mut saga = (definition.factory)(saga_id);
        saga.set_state(SagaState::Pending);
        self.persist(saga.as_ref(), Utc::now()).await?;
        self.bump(|s| s.initiated += 1);
        info!(
            saga_id = %saga_id,
            saga_type = %definition.saga_type,
            event_type = %event.event_type,
            "saga initiated"
        );
        self.process_saga_event(saga_id, event).await?;
        Ok(saga_id)
    }

    /// Process one event for one saga inside its per-saga lock.
    pub async fn process_saga_event(
        &self,
        saga_id: Uuid,
        event: &EventEnvelope,
    ) -> EngineResult<()> {
        let guard = self.store.acquire(saga_id).await?;
        let Some(record) = self.store.load(saga_id).await? else {
            return Ok(());
        };
        // Terminal sagas are immutable; FAILED sagas only move through
        // explicit compensation.
        if !record.state.is_active() {
            return Ok(());
        }

        let mut saga = self.registry.hydrate(&record).await?;
        if !saga.handles(event) {
            return Ok(());
        }

        if saga.state() == SagaState::Pending {
            saga.set_state(SagaState::Running);
        }

        match saga.handle_event(event).await {
            Ok(commands) => {
                self.bump(|s| s.events_handled += 1);
                for command in commands {
                    let command_type = command.command_type.clone();
                    if let Err(err) = self.bus.dispatch(command).await {
                        error!(
                            saga_id = %saga_id,
                            command_type = %command_type,
                            error = %err,
                            "saga-emitted command failed, failing saga"
                        );
                        saga.set_state(SagaState::Failed);
                        self.persist(saga.as_ref(), record.created_at).await?;
                        self.bump(|s| s.failed += 1);
                        drop(guard);
                        return self.compensate(saga_id).await;
                    }
                }

                match saga.state() {
                    SagaState::Running if saga.should_complete() => {
                        saga.set_state(SagaState::Completed);
                        self.bump(|s| s.completed += 1);
                        debug!(saga_id = %saga_id, "saga completed");
                    }
                    SagaState::Compensating if saga.compensation_complete() => {
                        saga.set_state(SagaState::Compensated);
                        self.bump(|s| s.compensated += 1);
                        debug!(saga_id = %saga_id, "saga compensated");
                    }
                    _ => {}
                }
                self.persist(saga.as_ref(), record.created_at).await
            }
            Err(err) if err.is_retryable() => {
                warn!(
                    saga_id = %saga_id,
                    error = %err,
                    "saga handler hit a transient failure, state unchanged"
                );
                Err(err)
            }
            Err(err) => {
                error!(
                    saga_id = %saga_id,
                    error = %err,
                    error_code = err.code(),
                    "saga handler failed, initiating compensation"
                );
                saga.set_state(SagaState::Failed);
                self.persist(saga.as_ref(), record.created_at).await?;
                self.bump(|s| s.failed += 1);
                drop(guard);
                self.compensate(saga_id).await
            }
        }
    }

    /// Drive compensation for a FAILED, RUNNING, or TIMED_OUT saga: a child
    /// compensation saga dispatches the compensation commands sequentially.
    /// A compensation failure marks the saga FAILED and raises an operator
    /// alert; it is never retried automatically.
    pub async fn compensate(&self, saga_id: Uuid) -> EngineResult<()> {
        let _guard = self.store.acquire(saga_id).await?;
        let Some(record) = self.store.load(saga_id).await? else {
            return Ok(());
        };
        if matches!(
            record.state,
            SagaState::Completed | SagaState::Compensated | SagaState::Compensating
        ) {
            return Ok(());
        }

        let mut saga = self.registry.hydrate(&record).await?;
        // A timed-out parent keeps its TIMED_OUT state; everything else
        // moves to COMPENSATING.
        let keep_parent_state = record.state == SagaState::TimedOut;
        if !keep_parent_state {
            saga.set_state(SagaState::Compensating);
            self.persist(saga.as_ref(), record.created_at).await?;
        }

        let commands = saga.compensation_commands();
        let mut child = SagaRecord {
            saga_id: Uuid::new_v4(),
            saga_type: format!("{}.compensation", record.saga_type),
            state: SagaState::Running,
            state_data: json!({ "parent_saga_id": saga_id, "commands": commands.len() }),
            metadata: HashMap::from([(
                "parent_saga_id".to_string(),
                json!(saga_id.to_string()),
            )]),
            timeout_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.save(&child).await?;

        for command in commands {
            let command_type = command.command_type.clone();
            if let Err(err) = self.bus.dispatch(command).await {
                error!(
                    saga_id = %saga_id,
                    compensation_saga_id = %child.saga_id,
                    command_type = %command_type,
                    error = %err,
                    error_code = err.code(),
                    "compensation command failed, manual intervention required"
                );
                child.state = SagaState::Failed;
                child.updated_at = Utc::now();
                self.store.save(&child).await?;
                if !keep_parent_state {
                    saga.set_state(SagaState::Failed);
                    self.persist(saga.as_ref(), record.created_at).await?;
                }
                return Ok(());
            }
        }

        child.state = SagaState::Completed;
        child.updated_at = Utc::now();
        self.store.save(&child).await?;

        if !keep_parent_state && saga.compensation_complete() {
            saga.set_state(SagaState::Compensated);
            self.persist(saga.as_ref(), record.created_at).await?;
            self.bump(|s| s.compensated += 1);
        }
        Ok(())
    }

    /// Transition expired non-terminal sagas to TIMED_OUT and start their
    /// compensation. Returns how many sagas timed out.
    pub async fn sweep_timeouts(&self) -> EngineResult<usize> {
        let now = Utc::now();
        let expired = self.store.load_timed_out(now).await?;
        let mut swept = 0;
        for record in expired {
            {
                let _guard = self.store.acquire(record.saga_id).await?;
                let Some(mut current) = self.store.load(record.saga_id).await? else {
                    continue;
                };
                if current.state.is_terminal()
                    || current.timeout_at.map(|at| at >= now).unwrap_or(true)
                {
                    continue;
                }
                warn!(
                    saga_id = %current.saga_id,
                    saga_type = %current.saga_type,
                    "saga timed out"
                );
                current.state = SagaState::TimedOut;
                current.updated_at = Utc::now();
                self.store.save(&current).await?;
                self.bump(|s| s.timed_out += 1);
            }
            self.compensate(record.saga_id).await?;
            swept += 1;
        }
        Ok(swept)
    }

    /// Periodic timeout sweep task.
    pub fn start_timeout_sweep(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let coordinator = self;
        let interval = Duration::from_secs(coordinator.config.sweep_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = coordinator.sweep_timeouts().await {
                    error!(error = %err, "saga timeout sweep failed");
                }
            }
        })
    }

    pub fn statistics(&self) -> SagaStatistics {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    async fn persist(&self, saga: &dyn Saga, created_at: DateTime<Utc>) -> EngineResult<()> {
        let record = SagaRecord {
            saga_id: saga.saga_id(),
            saga_type: saga.saga_type().to_string(),
            state: saga.state(),
            state_data: saga.state_data()?,
            metadata: saga.metadata(),
            timeout_at: saga.timeout_at(),
            created_at,
            updated_at: Utc::now(),
        };
        self.store.save(&record).await
    }

    fn bump(&self, f: impl FnOnce(&mut SagaStatistics)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

#[async_trait]
impl EventSink for SagaCoordinator {
    fn name(&self) -> &str {
        "saga_coordinator"
    }

    async fn offer(&self, events: &[EventEnvelope]) -> EngineResult<()> {
        for event in events {
            self.on_event(event).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventflow_core::AggregateId;

    #[test]
    fn test_state_classification() {
        assert!(SagaState::Pending.is_active());
        assert!(SagaState::Running.is_active());
        assert!(SagaState::Compensating.is_active());
        assert!(!SagaState::Failed.is_active());
        assert!(SagaState::Completed.is_terminal());
        assert!(SagaState::Compensated.is_terminal());
        assert!(SagaState::TimedOut.is_terminal());
        assert!(!SagaState::Failed.is_terminal());
    }

    fn record(state: SagaState, timeout_at: Option<DateTime<Utc>>) -> SagaRecord {
        SagaRecord {
            saga_id: Uuid::new_v4(),
            saga_type: "shipment".to_string(),
            state,
            state_data: json!({}),
            metadata: HashMap::new(),
            timeout_at,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_store_filters_active_and_timed_out() {
        let store = InMemorySagaStore::new();
        store.save(&record(SagaState::Running, None)).await.unwrap();
        store.save(&record(SagaState::Completed, None)).await.unwrap();
        store
            .save(&record(
                SagaState::Running,
                Some(Utc::now() - chrono::Duration::seconds(5)),
            ))
            .await
            .unwrap();
        store
            .save(&record(
                SagaState::Completed,
                Some(Utc::now() - chrono::Duration::seconds(5)),
            ))
            .await
            .unwrap();

        assert_eq!(store.load_active().await.unwrap().len(), 2);
        // Terminal sagas never time out
        assert_eq!(store.load_timed_out(Utc::now()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_drops_only_old_terminal_sagas() {
        let store = InMemorySagaStore::new();
        let mut old_done = record(SagaState::Completed, None);
        old_done.updated_at = Utc::now() - chrono::Duration::hours(2);
        store.save(&old_done).await.unwrap();
        store.save(&record(SagaState::Running, None)).await.unwrap();

        let removed = store
            .cleanup_finished(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.load(old_done.saga_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hydration_requires_a_registered_type() {
        let registry = SagaTypeRegistry::new();
        let err = match registry.hydrate(&record(SagaState::Running, None)).await {
            Err(e) => e,
            Ok(_) => panic!("expected hydration to fail"),
        };
        assert_eq!(err.code(), "saga");
    }

    #[tokio::test]
    async fn test_per_saga_lock_serializes_mutation() {
        let store = Arc::new(InMemorySagaStore::new());
        let saga_id = Uuid::new_v4();
        let guard = store.acquire(saga_id).await.unwrap();

        let store_b = Arc::clone(&store);
        let contender = tokio::spawn(async move { store_b.acquire(saga_id).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    fn event(event_type: &str) -> EventEnvelope {
        EventEnvelope::new(
            AggregateId::new("S-1"),
            "shipment",
            event_type,
            1,
            1,
            json!({}),
        )
    }

    #[tokio::test]
    async fn test_initiation_predicate_creates_and_runs_saga() {
        let store: Arc<dyn SagaStore> = Arc::new(InMemorySagaStore::new());
        let bus = Arc::new(CommandBus::new());
        let coordinator =
            SagaCoordinator::new(Arc::clone(&store), bus, SagaCoordinatorConfig::default());

        coordinator
            .register_saga_type(SagaDefinition::new(
                "shipment",
                Arc::new(|saga_id| Box::new(ShipmentSaga::new(saga_id)) as Box<dyn Saga>),
                Arc::new(|event| event.event_type == "order.placed"),
            ))
            .await;

        coordinator.on_event(&event("order.placed")).await.unwrap();

        let running = store.load_by_state(SagaState::Running).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].saga_type, "shipment");
        assert_eq!(coordinator.statistics().initiated, 1);

        // Completing event moves it to COMPLETED, and terminal sagas ignore
        // further events
        coordinator.on_event(&event("order.shipped")).await.unwrap();
        let done = store.load_by_state(SagaState::Completed).await.unwrap();
        assert_eq!(done.len(), 1);

        coordinator.on_event(&event("order.shipped")).await.unwrap();
        assert_eq!(coordinator.statistics().events_handled, 2);
    }

    /// Minimal test saga: runs on order.placed, completes on order.shipped.
    struct ShipmentSaga {
        saga_id: Uuid,
        state: SagaState,
        shipped: bool,
    }

    impl ShipmentSaga {
        fn new(saga_id: Uuid) -> Self {
            Self {
                saga_id,
                state: SagaState::Pending,
                shipped: false,
            }
        }
    }

    #[async_trait]
    impl Saga for ShipmentSaga {
        fn saga_id(&self) -> Uuid {
            self.saga_id
        }

        fn saga_type(&self) -> &str {
            "shipment"
        }

        fn state(&self) -> SagaState {
            self.state
        }

        fn set_state(&mut self, state: SagaState) {
            self.state = state;
        }

        fn handles(&self, event: &EventEnvelope) -> bool {
            matches!(event.event_type.as_str(), "order.placed" | "order.shipped")
        }

        async fn handle_event(
            &mut self,
            event: &EventEnvelope,
        ) -> EngineResult<Vec<CommandEnvelope>> {
            if event.event_type == "order.shipped" {
                self.shipped = true;
            }
            Ok(Vec::new())
        }

        fn should_complete(&self) -> bool {
            self.shipped
        }

        fn compensation_commands(&self) -> Vec<CommandEnvelope> {
            Vec::new()
        }

        fn state_data(&self) -> EngineResult<Value> {
            Ok(json!({ "shipped": self.shipped }))
        }

        fn restore_state(&mut self, data: &Value) -> EngineResult<()> {
            self.shipped = data.get("shipped").and_then(Value::as_bool).unwrap_or(false);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_timeout_sweep_transitions_expired_sagas() {
        let store: Arc<dyn SagaStore> = Arc::new(InMemorySagaStore::new());
        let bus = Arc::new(CommandBus::new());
        let coordinator = SagaCoordinator::new(
            Arc::clone(&store),
            bus,
            SagaCoordinatorConfig::default(),
        );
        coordinator
            .register_saga_type(SagaDefinition::new(
                "shipment",
                Arc::new(|saga_id| Box::new(ShipmentSaga::new(saga_id)) as Box<dyn Saga>),
                Arc::new(|_| false),
            ))
            .await;

        let mut expired = record(SagaState::Running, Some(Utc::now() - chrono::Duration::seconds(1)));
        expired.saga_type = "shipment".to_string();
        store.save(&expired).await.unwrap();

        let swept = coordinator.sweep_timeouts().await.unwrap();
        assert_eq!(swept, 1);
        let reloaded = store.load(expired.saga_id).await.unwrap().unwrap();
        assert_eq!(reloaded.state, SagaState::TimedOut);

        // Second sweep finds nothing
        assert_eq!(coordinator.sweep_timeouts().await.unwrap(), 0);
    }
}
