//! # eventflow-runtime
//!
//! The runtime of the eventflow event-sourcing and CQRS framework:
//!
//! - **Tiered event store**: TTL-bounded hot cache over a durable warm log
//!   with optimistic concurrency, read-through promotion, and asynchronous
//!   write-back with dead-lettering ([`store`])
//! - **Snapshots**: strategy-driven snapshotting (simple threshold and
//!   adaptive scoring) with integrity-verified loads ([`snapshot`])
//! - **Aggregate repository**: snapshot-accelerated reconstitution, batch
//!   loading, and post-append fan-out ([`repository`])
//! - **Command bus**: priority-ordered middleware (validation,
//!   authorization, transactions, retry, circuit breaking) and async
//!   submission with durable status tracking ([`command`])
//! - **Query bus**: cheapest-handler selection, three cache tiers with
//!   tag-based invalidation, and batch optimization ([`query`])
//! - **Projection pipeline**: checkpointed projectors with crash-safe
//!   locks, realtime/async/batched dispatch, replay, and health ([`projection`],
//!   [`dispatch`])
//! - **Saga coordinator**: persistent workflow state machines with
//!   compensation and timeout sweeps ([`saga`])
//! - **Transactions**: scoped execution with post-commit hooks, deadlock
//!   retry, and a two-phase distributed coordinator ([`transaction`])
//!
//! Every storage trait ships an in-memory implementation; PostgreSQL
//! backends live behind the `postgres` feature and a Redis L2 cache behind
//! `redis-cache`.

pub mod auth;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod jobs;
pub mod projection;
pub mod query;
pub mod readmodel;
pub mod repository;
pub mod saga;
pub mod snapshot;
pub mod store;
pub mod transaction;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "redis-cache")]
pub mod redis_cache;

pub use eventflow_core as core;

pub use auth::{AuthorizationPolicy, PolicySet, Principal};
pub use command::{
    AsyncCommandBus, AsyncCommandState, AsyncCommandStatus, AsyncCommandStrategy,
    AsyncStatusRepository, AuthorizationMiddleware, BackoffStrategy, CircuitBreaker,
    CircuitBreakerConfig, CircuitBreakerMiddleware, CircuitState, Command, CommandBus,
    CommandBusStatistics, CommandEnvelope, CommandHandler, CommandMetadata, CommandMiddleware,
    CommandValidator, InMemoryAsyncStatusRepository, Next, RequiredFieldsValidator,
    RetryMiddleware, RetryPolicy, TransactionMiddleware, ValidationMiddleware,
};
pub use config::{
    ProjectionSettings, ProjectionStrategyKind, RuntimeConfig, RuntimeProfile, SnapshotSettings,
    SnapshotStrategyKind,
};
pub use dispatch::{
    AsyncDispatchStrategy, BatchedDispatchConfig, BatchedDispatchStrategy, DispatchStrategy,
    EventTypePattern, ProjectionDispatcher, RealtimeDispatchStrategy,
};
pub use jobs::{DeadLetteredJob, InMemoryJobQueue, Job, JobHandler, JobQueue, JobQueueConfig};
pub use projection::{
    CheckpointStore, InMemoryCheckpointStore, ProjectionCheckpoint, ProjectionHealth,
    ProjectionHealthStatus, ProjectionManager, ProjectionManagerConfig, Projector, ProjectorCore,
};
pub use query::{
    BatchQueryResult, CacheTier, CachedValue, DistributedCache, DurableCache, EvictionStrategy,
    InMemoryDistributedCache, InMemoryDurableCache, InvalidationBatcherConfig, L1Cache,
    L1CacheConfig, Query, QueryBus, QueryBusConfig, QueryBusStatistics, QueryCacheConfig,
    QueryCacheManager, QueryCacheStatistics, QueryEnvelope, QueryHandler, QueryMetadata,
};
pub use readmodel::{InMemoryReadModelStore, ReadModel, ReadModelStore};
pub use repository::{AggregateRepository, CacheTagInvalidator, EventSink};
pub use saga::{
    InMemorySagaStore, Saga, SagaCoordinator, SagaCoordinatorConfig, SagaDefinition, SagaRecord,
    SagaState, SagaStore, SagaTypeRegistry,
};
pub use snapshot::{
    AdaptiveSnapshotStrategy, AdaptiveStrategyConfig, AggregateAccessMetrics,
    InMemorySnapshotStore, SimpleSnapshotStrategy, SnapshotManager, SnapshotStore,
    SnapshotStrategy,
};
pub use store::{
    AppendOutcome, EventStore, EventStoreStatistics, HotEventCache, HotStoreConfig,
    InMemoryEventStore, TieredEventStore, TieredStoreConfig, WriteBackDeadLetter, WriteMode,
};
pub use transaction::{
    DistributedTransactionCoordinator, DistributedTransactionState, InMemoryTransactionStateStore,
    IsolationLevel, TransactionManager, TransactionOptions, TransactionParticipant,
    TransactionStateStore,
};
