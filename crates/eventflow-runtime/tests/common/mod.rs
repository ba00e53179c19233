//! Shared test fixture: a small user domain wired through the runtime.
#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use eventflow_core::{
    AggregateBase, AggregateId, AggregateRoot, DomainEventPayload, EngineResult, EventEnvelope,
};
use eventflow_runtime::{
    AggregateRepository, EventStore, InMemoryEventStore, InMemorySnapshotStore,
    SimpleSnapshotStrategy, SnapshotManager, SnapshotStore,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRegistered {
    pub email: String,
}

impl DomainEventPayload for UserRegistered {
    fn event_type() -> &'static str {
        "user.registered"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRenamed {
    pub name: String,
}

impl DomainEventPayload for UserRenamed {
    fn event_type() -> &'static str {
        "user.renamed"
    }
}

#[derive(Debug, Clone, Default)]
pub struct UserState {
    pub email: String,
    pub name: String,
}

pub struct User {
    base: AggregateBase,
    pub state: UserState,
}

impl User {
    pub fn register(id: AggregateId, email: impl Into<String>) -> EngineResult<Self> {
        let mut user = Self::new(id);
        user.record(UserRegistered {
            email: email.into(),
        })?;
        Ok(user)
    }

    pub fn rename(&mut self, name: impl Into<String>) -> EngineResult<()> {
        self.record(UserRenamed { name: name.into() })
    }
}

impl AggregateRoot for User {
    fn aggregate_type() -> &'static str {
        "user"
    }

    fn new(id: AggregateId) -> Self {
        Self {
            base: AggregateBase::new(id),
            state: UserState::default(),
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
                let payload: UserRegistered = event.decode()?;
                self.state.email = payload.email;
            }
            "user.renamed" => {
                let payload: UserRenamed = event.decode()?;
                self.state.name = payload.name;
            }
            _ => {}
        }
        Ok(())
    }

    fn snapshot_state(&self) -> EngineResult<Value> {
        Ok(json!({"email": self.state.email, "name": self.state.name}))
    }

    fn restore_snapshot_state(&mut self, state: &Value) -> EngineResult<()> {
        self.state.email = state
            .get("email")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.state.name = state
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(())
    }
}

pub struct UserFixture {
    pub event_store: Arc<dyn EventStore>,
    pub snapshot_store: Arc<dyn SnapshotStore>,
    pub repository: AggregateRepository<User>,
}

/// Repository over in-memory stores with a simple snapshot strategy.
pub fn user_fixture(snapshot_threshold: i64) -> UserFixture {
    let event_store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let snapshot_store: Arc<dyn SnapshotStore> = Arc::new(InMemorySnapshotStore::new());
    let manager = Arc::new(SnapshotManager::new(
        Arc::clone(&snapshot_store),
        Arc::new(SimpleSnapshotStrategy::new(snapshot_threshold)),
    ));
    let repository = AggregateRepository::new(Arc::clone(&event_store), manager);
    UserFixture {
        event_store,
        snapshot_store,
        repository,
    }
}

/// A registered-user event envelope for direct store-level tests.
pub fn registered_event(id: &AggregateId, version: i64) -> EventEnvelope {
    EventEnvelope::new(
        id.clone(),
        "user",
        "user.registered",
        1,
        version,
        json!({"email": format!("{}@example.com", id)}),
    )
}
