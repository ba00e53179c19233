//! Aggregate root contract and reconstitution.
//!
//! Concrete aggregates embed an [`AggregateBase`] value rather than
//! inheriting behavior: the base owns the identifier, the version counter,
//! and the uncommitted-event buffer, while the concrete type owns domain
//! state and the event-application logic.

use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::event::{DomainEventPayload, EventEnvelope};
use crate::ids::AggregateId;
use crate::snapshot::AggregateSnapshot;
use crate::stream::EventStream;

/// Identity, version, and uncommitted buffer shared by every aggregate.
///
/// Invariants:
/// - applying an event increments the version by exactly one;
/// - the version after recording equals the prior version plus the number of
///   recorded events;
/// - the uncommitted buffer is cleared only by [`mark_committed`] after a
///   successful append.
///
/// [`mark_committed`]: AggregateBase::mark_committed
#[derive(Debug, Clone)]
pub struct AggregateBase {
    id: AggregateId,
    version: i64,
    uncommitted: Vec<EventEnvelope>,
}

impl AggregateBase {
    pub fn new(id: AggregateId) -> Self {
        Self {
            id,
            version: 0,
            uncommitted: Vec::new(),
        }
    }

    pub fn id(&self) -> &AggregateId {
        &self.id
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn uncommitted(&self) -> &[EventEnvelope] {
        &self.uncommitted
    }

    pub fn has_uncommitted(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// Advance the version for a newly recorded event and buffer it.
    fn record(&mut self, envelope: EventEnvelope) {
        self.version = envelope.version;
        self.uncommitted.push(envelope);
    }

    /// Advance the version for a replayed (already stored) event.
    fn replay(&mut self, version: i64) {
        self.version = version;
    }

    /// Clear the uncommitted buffer after a successful append.
    pub fn mark_committed(&mut self) {
        self.uncommitted.clear();
    }

    /// Force the version, used when seeding from a snapshot.
    pub fn restore_version(&mut self, version: i64) {
        self.version = version;
        self.uncommitted.clear();
    }
}

/// Contract for event-sourced aggregates.
pub trait AggregateRoot: Sized + Send + Sync {
    /// Stable aggregate type name stored with every event.
    fn aggregate_type() -> &'static str;

    /// Fresh aggregate with version 0 and no state.
    fn new(id: AggregateId) -> Self;

    fn base(&self) -> &AggregateBase;

    fn base_mut(&mut self) -> &mut AggregateBase;

    /// Mutate domain state for one event. Version bookkeeping is handled by
    /// [`record`](AggregateRoot::record) and [`replay`](AggregateRoot::replay);
    /// implementations only fold the payload into their state.
    fn apply(&mut self, event: &EventEnvelope) -> EngineResult<()>;

    /// Serialize domain state for snapshotting.
    fn snapshot_state(&self) -> EngineResult<Value>;

    /// Restore domain state from a snapshot produced by
    /// [`snapshot_state`](AggregateRoot::snapshot_state).
    fn restore_snapshot_state(&mut self, state: &Value) -> EngineResult<()>;

    fn id(&self) -> &AggregateId {
        self.base().id()
    }

    fn version(&self) -> i64 {
        self.base().version()
    }

    fn uncommitted_events(&self) -> &[EventEnvelope] {
        self.base().uncommitted()
    }

    /// Record a new domain event: build its envelope at `version + 1`, apply
    /// it to state, and buffer it for the next repository save.
    fn record<E: DomainEventPayload>(&mut self, payload: E) -> EngineResult<()> {
        let envelope = EventEnvelope::new(
            self.base().id().clone(),
            Self::aggregate_type(),
            E::event_type(),
            E::schema_version(),
            self.base().version() + 1,
            payload.to_payload()?,
        );
        self.apply(&envelope)?;
        self.base_mut().record(envelope);
        Ok(())
    }

    /// Apply an already-stored event during reconstitution.
    fn replay(&mut self, event: &EventEnvelope) -> EngineResult<()> {
        self.apply(event)?;
        self.base_mut().replay(event.version);
        Ok(())
    }

    /// Rebuild an aggregate from its full event stream.
    fn reconstitute(id: AggregateId, events: &EventStream) -> EngineResult<Self> {
        if events.is_empty() {
            return Err(EngineError::AggregateNotFound {
                aggregate_id: id.to_string(),
            });
        }
        let mut aggregate = Self::new(id);
        for event in events {
            aggregate.replay(event)?;
        }
        Ok(aggregate)
    }

    /// Rebuild an aggregate from a snapshot plus the events recorded after
    /// the snapshot version. The caller is responsible for integrity
    /// verification before seeding.
    fn reconstitute_from_snapshot(
        snapshot: &AggregateSnapshot,
        tail: &EventStream,
    ) -> EngineResult<Self> {
        let mut aggregate = Self::new(snapshot.aggregate_id.clone());
        aggregate.restore_snapshot_state(&snapshot.state)?;
        aggregate.base_mut().restore_version(snapshot.version);
        for event in tail {
            aggregate.replay(event)?;
        }
        Ok(aggregate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DomainEventPayload;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Credited {
        amount: i64,
    }

    impl DomainEventPayload for Credited {
        fn event_type() -> &'static str {
            "account.credited"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Debited {
        amount: i64,
    }

    impl DomainEventPayload for Debited {
        fn event_type() -> &'static str {
            "account.debited"
        }
    }

    #[derive(Debug)]
    struct Account {
        base: AggregateBase,
        balance: i64,
    }

    impl AggregateRoot for Account {
        fn aggregate_type() -> &'static str {
            "account"
        }

        fn new(id: AggregateId) -> Self {
            Self {
                base: AggregateBase::new(id),
                balance: 0,
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
                "account.credited" => {
                    let payload: Credited = event.decode()?;
                    self.balance += payload.amount;
                }
                "account.debited" => {
                    let payload: Debited = event.decode()?;
                    self.balance -= payload.amount;
                }
                other => {
                    return Err(EngineError::Configuration {
                        message: format!("account cannot apply event type '{}'", other),
                    })
                }
            }
            Ok(())
        }

        fn snapshot_state(&self) -> EngineResult<Value> {
            Ok(json!({"balance": self.balance}))
        }

        fn restore_snapshot_state(&mut self, state: &Value) -> EngineResult<()> {
            self.balance = state
                .get("balance")
                .and_then(Value::as_i64)
                .ok_or_else(|| EngineError::Serialization {
                    message: "account snapshot missing balance".to_string(),
                })?;
            Ok(())
        }
    }

    #[test]
    fn test_recording_applies_state_and_bumps_version() {
        let mut account = Account::new(AggregateId::new("A-1"));
        account.record(Credited { amount: 100 }).unwrap();
        account.record(Debited { amount: 30 }).unwrap();

        assert_eq!(account.version(), 2);
        assert_eq!(account.balance, 70);
        assert_eq!(account.uncommitted_events().len(), 2);
        assert_eq!(account.uncommitted_events()[0].version, 1);
        assert_eq!(account.uncommitted_events()[1].version, 2);
    }

    #[test]
    fn test_mark_committed_clears_buffer_but_keeps_version() {
        let mut account = Account::new(AggregateId::new("A-1"));
        account.record(Credited { amount: 100 }).unwrap();
        account.base_mut().mark_committed();
        assert_eq!(account.version(), 1);
        assert!(account.uncommitted_events().is_empty());
    }

    #[test]
    fn test_reconstitution_matches_recorded_state() {
        let mut account = Account::new(AggregateId::new("A-1"));
        account.record(Credited { amount: 100 }).unwrap();
        account.record(Debited { amount: 25 }).unwrap();

        let stream = EventStream::new(account.uncommitted_events().to_vec());
        let rebuilt = Account::reconstitute(AggregateId::new("A-1"), &stream).unwrap();

        assert_eq!(rebuilt.version(), account.version());
        assert_eq!(rebuilt.balance, account.balance);
        assert!(rebuilt.uncommitted_events().is_empty());
    }

    #[test]
    fn test_reconstitution_of_unknown_aggregate_fails() {
        let err = Account::reconstitute(AggregateId::new("missing"), &EventStream::empty())
            .unwrap_err();
        assert_eq!(err.code(), "aggregate_not_found");
    }

    #[test]
    fn test_snapshot_seeded_reconstitution_applies_tail() {
        let mut account = Account::new(AggregateId::new("A-1"));
        account.record(Credited { amount: 100 }).unwrap();
        let snapshot = AggregateSnapshot::new(
            AggregateId::new("A-1"),
            "account",
            1,
            account.snapshot_state().unwrap(),
        );

        let mut tail_source = Account::new(AggregateId::new("A-1"));
        tail_source.base_mut().restore_version(1);
        tail_source.balance = 100;
        tail_source.record(Debited { amount: 40 }).unwrap();
        let tail = EventStream::new(tail_source.uncommitted_events().to_vec());

        let rebuilt = Account::reconstitute_from_snapshot(&snapshot, &tail).unwrap();
        assert_eq!(rebuilt.version(), 2);
        assert_eq!(rebuilt.balance, 60);
    }
}
