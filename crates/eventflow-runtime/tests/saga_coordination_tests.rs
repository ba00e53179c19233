// Booking saga end to end: initiation, command dispatch, compensation.

mod common;

use async_trait::async_trait;
use eventflow_core::{AggregateId, EngineError, EngineResult, EventEnvelope};
use eventflow_runtime::{
    Command, CommandBus, CommandEnvelope, CommandHandler, EventSink, InMemorySagaStore, Saga,
    SagaCoordinator, SagaCoordinatorConfig, SagaDefinition, SagaState, SagaStore,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct ReserveRoom {
    booking_id: String,
}

impl Command for ReserveRoom {
    fn command_type() -> &'static str {
        "booking.reserve_room"
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct VoidPayment {
    booking_id: String,
}

impl Command for VoidPayment {
    fn command_type() -> &'static str {
        "booking.void_payment"
    }
}

struct CountingHandler {
    command_type: &'static str,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl CommandHandler for CountingHandler {
    fn command_type(&self) -> &str {
        self.command_type
    }

    async fn handle(&self, _command: CommandEnvelope) -> EngineResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Null)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BookingProgress {
    booking_id: String,
    payment_authorized: bool,
    room_requested: bool,
    room_reserved: bool,
    payment_voided: bool,
}

/// Starts on PaymentAuthorized, reserves a room, and voids the payment if
/// the reservation fails.
struct BookingSaga {
    saga_id: Uuid,
    state: SagaState,
    progress: BookingProgress,
}

impl BookingSaga {
    fn new(saga_id: Uuid) -> Self {
        Self {
            saga_id,
            state: SagaState::Pending,
            progress: BookingProgress::default(),
        }
    }
}

#[async_trait]
impl Saga for BookingSaga {
    fn saga_id(&self) -> Uuid {
        self.saga_id
    }

    fn saga_type(&self) -> &str {
        "booking"
    }

    fn state(&self) -> SagaState {
        self.state
    }

    fn set_state(&mut self, state: SagaState) {
        self.state = state;
    }

    fn handles(&self, event: &EventEnvelope) -> bool {
        matches!(
            event.event_type.as_str(),
            "payment.authorized" | "room.reservation_failed" | "room.reserved" | "payment.voided"
        )
    }

    async fn handle_event(
        &mut self,
        event: &EventEnvelope,
    ) -> EngineResult<Vec<CommandEnvelope>> {
        match event.event_type.as_str() {
            "payment.authorized" => {
                self.progress.booking_id = event.aggregate_id.to_string();
                self.progress.payment_authorized = true;
                self.progress.room_requested = true;
                Ok(vec![ReserveRoom {
                    booking_id: self.progress.booking_id.clone(),
                }
                .envelope()?])
            }
            "room.reserved" => {
                self.progress.room_reserved = true;
                Ok(Vec::new())
            }
            "room.reservation_failed" => Err(EngineError::Saga {
                saga_id: self.saga_id.to_string(),
                message: "room reservation failed".to_string(),
            }),
            "payment.voided" => {
                self.progress.payment_voided = true;
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }

    fn should_complete(&self) -> bool {
        self.progress.room_reserved
    }

    fn compensation_commands(&self) -> Vec<CommandEnvelope> {
        let mut commands = Vec::new();
        if self.progress.payment_authorized && !self.progress.payment_voided {
            if let Ok(envelope) = (VoidPayment {
                booking_id: self.progress.booking_id.clone(),
            })
            .envelope()
            {
                commands.push(envelope);
            }
        }
        commands
    }

    fn compensation_complete(&self) -> bool {
        self.progress.payment_voided
    }

    fn state_data(&self) -> EngineResult<Value> {
        Ok(serde_json::to_value(&self.progress)?)
    }

    fn restore_state(&mut self, data: &Value) -> EngineResult<()> {
        self.progress = serde_json::from_value(data.clone())?;
        Ok(())
    }
}

struct SagaHarness {
    coordinator: Arc<SagaCoordinator>,
    store: Arc<dyn SagaStore>,
    reserve_calls: Arc<AtomicU32>,
    void_calls: Arc<AtomicU32>,
}

async fn saga_harness() -> SagaHarness {
    let bus = Arc::new(CommandBus::new());
    let reserve_calls = Arc::new(AtomicU32::new(0));
    let void_calls = Arc::new(AtomicU32::new(0));
    bus.register_handler(Arc::new(CountingHandler {
        command_type: "booking.reserve_room",
        calls: Arc::clone(&reserve_calls),
    }))
    .await;
    bus.register_handler(Arc::new(CountingHandler {
        command_type: "booking.void_payment",
        calls: Arc::clone(&void_calls),
    }))
    .await;

    let store: Arc<dyn SagaStore> = Arc::new(InMemorySagaStore::new());
    let coordinator = Arc::new(SagaCoordinator::new(
        Arc::clone(&store),
        bus,
        SagaCoordinatorConfig::default(),
    ));
    coordinator
        .register_saga_type(SagaDefinition::new(
            "booking",
            Arc::new(|saga_id| Box::new(BookingSaga::new(saga_id)) as Box<dyn Saga>),
            Arc::new(|event| event.event_type == "payment.authorized"),
        ))
        .await;

    SagaHarness {
        coordinator,
        store,
        reserve_calls,
        void_calls,
    }
}

fn booking_event(event_type: &str) -> EventEnvelope {
    EventEnvelope::new(
        AggregateId::new("B-1"),
        "booking",
        event_type,
        1,
        1,
        json!({}),
    )
}

async fn single_booking_record(store: &Arc<dyn SagaStore>) -> eventflow_runtime::SagaRecord {
    let mut records = Vec::new();
    for state in [
        SagaState::Pending,
        SagaState::Running,
        SagaState::Completed,
        SagaState::Failed,
        SagaState::Compensating,
        SagaState::Compensated,
        SagaState::TimedOut,
    ] {
        for record in store.load_by_state(state).await.unwrap() {
            if record.saga_type == "booking" {
                records.push(record);
            }
        }
    }
    assert_eq!(records.len(), 1, "expected exactly one booking saga");
    records.remove(0)
}

#[tokio::test]
async fn test_happy_path_completes_the_booking_saga() {
    let h = saga_harness().await;

    h.coordinator
        .offer(&[booking_event("payment.authorized")])
        .await
        .unwrap();
    assert_eq!(h.reserve_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        single_booking_record(&h.store).await.state,
        SagaState::Running
    );

    h.coordinator
        .offer(&[booking_event("room.reserved")])
        .await
        .unwrap();
    assert_eq!(
        single_booking_record(&h.store).await.state,
        SagaState::Completed
    );
    assert_eq!(h.void_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_reservation_failure_compensates_and_voids_the_payment() {
    let h = saga_harness().await;

    // PaymentAuthorized initiates the saga and dispatches ReserveRoom
    h.coordinator
        .offer(&[booking_event("payment.authorized")])
        .await
        .unwrap();
    assert_eq!(h.reserve_calls.load(Ordering::SeqCst), 1);

    // The reservation fails: RUNNING -> FAILED -> COMPENSATING, and the
    // compensation dispatches VoidPayment
    h.coordinator
        .offer(&[booking_event("room.reservation_failed")])
        .await
        .unwrap();
    let record = single_booking_record(&h.store).await;
    assert_eq!(record.state, SagaState::Compensating);
    assert_eq!(h.void_calls.load(Ordering::SeqCst), 1);

    // Confirmation of the void moves the saga to COMPENSATED
    h.coordinator
        .offer(&[booking_event("payment.voided")])
        .await
        .unwrap();
    let record = single_booking_record(&h.store).await;
    assert_eq!(record.state, SagaState::Compensated);

    // Terminal: further events no longer mutate the saga
    let before = h.coordinator.statistics().events_handled;
    h.coordinator
        .offer(&[booking_event("room.reserved")])
        .await
        .unwrap();
    assert_eq!(h.coordinator.statistics().events_handled, before);
    assert_eq!(
        single_booking_record(&h.store).await.state,
        SagaState::Compensated
    );
}

#[tokio::test]
async fn test_timed_out_saga_is_swept_and_compensated() {
    let h = saga_harness().await;

    h.coordinator
        .offer(&[booking_event("payment.authorized")])
        .await
        .unwrap();

    // Force the timeout into the past
    let mut record = single_booking_record(&h.store).await;
    record.timeout_at = Some(chrono::Utc::now() - chrono::Duration::seconds(5));
    h.store.save(&record).await.unwrap();

    let swept = h.coordinator.sweep_timeouts().await.unwrap();
    assert_eq!(swept, 1);
    let record = single_booking_record(&h.store).await;
    assert_eq!(record.state, SagaState::TimedOut);
    // Compensation for the timed-out saga voided the payment
    assert_eq!(h.void_calls.load(Ordering::SeqCst), 1);
}
