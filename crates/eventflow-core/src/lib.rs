//! # eventflow-core
//!
//! Domain contracts for the eventflow event-sourcing runtime:
//!
//! - Typed identifiers ([`AggregateId`])
//! - The domain-event contract ([`EventEnvelope`], [`EventMetadata`],
//!   [`DomainEventPayload`])
//! - Ordered event sequences ([`EventStream`])
//! - The aggregate contract ([`AggregateRoot`], [`AggregateBase`]) with
//!   snapshot-seeded reconstitution
//! - Snapshots with integrity hashes ([`AggregateSnapshot`])
//! - The error taxonomy ([`EngineError`]) with stable codes and typed
//!   retryability
//!
//! This crate performs no I/O. Stores, buses, caches, projections, and sagas
//! live in `eventflow-runtime`.

pub mod aggregate;
pub mod error;
pub mod event;
pub mod ids;
pub mod snapshot;
pub mod stream;
pub mod telemetry;

pub use aggregate::{AggregateBase, AggregateRoot};
pub use error::{EngineError, EngineResult, FieldError, MessageKind, TransientKind};
pub use event::{DomainEventPayload, EventEnvelope, EventMetadata, SEQUENCE_UNASSIGNED};
pub use ids::AggregateId;
pub use snapshot::AggregateSnapshot;
pub use stream::EventStream;
