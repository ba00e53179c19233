//! PostgreSQL backends for the durable stores (feature `postgres`).
//!
//! The schema below is created by the operator's migration tooling; the
//! runtime requires it but does not create it:
//!
//! ```sql
//! CREATE TABLE event_log (
//!     sequence_number BIGSERIAL PRIMARY KEY,
//!     event_id        UUID        NOT NULL,
//!     aggregate_id    VARCHAR(36) NOT NULL,
//!     aggregate_type  TEXT        NOT NULL,
//!     event_type      TEXT        NOT NULL,
//!     event_version   INTEGER     NOT NULL,
//!     version         BIGINT      NOT NULL,
//!     payload         JSONB       NOT NULL,
//!     metadata        JSONB       NOT NULL,
//!     occurred_at     TIMESTAMPTZ NOT NULL,
//!     recorded_at     TIMESTAMPTZ NOT NULL,
//!     checksum        TEXT,
//!     UNIQUE (aggregate_id, version)
//! );
//! CREATE INDEX idx_event_log_type_seq ON event_log (event_type, sequence_number);
//! CREATE INDEX idx_event_log_aggregate ON event_log (aggregate_type, aggregate_id);
//! CREATE INDEX idx_event_log_occurred ON event_log (occurred_at);
//!
//! CREATE TABLE snapshots (
//!     aggregate_id   VARCHAR(36) NOT NULL,
//!     aggregate_type TEXT        NOT NULL,
//!     version        BIGINT      NOT NULL,
//!     state          JSONB       NOT NULL,
//!     state_hash     TEXT        NOT NULL,
//!     created_at     TIMESTAMPTZ NOT NULL,
//!     PRIMARY KEY (aggregate_id, version)
//! );
//!
//! CREATE TABLE projection_checkpoints (
//!     projection_name         TEXT PRIMARY KEY,
//!     last_processed_sequence BIGINT      NOT NULL DEFAULT 0,
//!     locked_by               TEXT,
//!     locked_until            TIMESTAMPTZ,
//!     updated_at              TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE TABLE sagas (
//!     saga_id    UUID PRIMARY KEY,
//!     saga_type  TEXT        NOT NULL,
//!     state      TEXT        NOT NULL,
//!     state_data JSONB       NOT NULL,
//!     metadata   JSONB       NOT NULL,
//!     timeout_at TIMESTAMPTZ,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE TABLE read_models (
//!     id           TEXT        NOT NULL,
//!     model_type   TEXT        NOT NULL,
//!     data         JSONB       NOT NULL,
//!     version      BIGINT      NOT NULL,
//!     last_updated TIMESTAMPTZ NOT NULL,
//!     metadata     JSONB       NOT NULL,
//!     PRIMARY KEY (model_type, id)
//! );
//!
//! CREATE TABLE query_cache (
//!     cache_key  TEXT PRIMARY KEY,
//!     value      JSONB       NOT NULL,
//!     tags       JSONB       NOT NULL,
//!     expires_at TIMESTAMPTZ NOT NULL
//! );
//! CREATE TABLE query_cache_tags (
//!     tag       TEXT NOT NULL,
//!     cache_key TEXT NOT NULL,
//!     PRIMARY KEY (tag, cache_key)
//! );
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::result::DatabaseErrorKind;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use eventflow_core::{
    AggregateId, AggregateSnapshot, EngineError, EngineResult, EventEnvelope, EventMetadata,
    EventStream, TransientKind,
};

use crate::projection::{CheckpointStore, ProjectionCheckpoint};
use crate::query::cache::{CachedValue, DurableCache};
use crate::readmodel::{ReadModel, ReadModelStore};
use crate::saga::{SagaRecord, SagaState, SagaStore};
use crate::snapshot::SnapshotStore;
use crate::store::{AppendOutcome, EventStore, EventStoreStatistics};

mod schema {
    diesel::table! {
        event_log (sequence_number) {
            sequence_number -> BigInt,
            event_id -> Uuid,
            aggregate_id -> Text,
            aggregate_type -> Text,
            event_type -> Text,
            event_version -> Integer,
            version -> BigInt,
            payload -> Jsonb,
            metadata -> Jsonb,
            occurred_at -> Timestamptz,
            recorded_at -> Timestamptz,
            checksum -> Nullable<Text>,
        }
    }

    diesel::table! {
        snapshots (aggregate_id, version) {
            aggregate_id -> Text,
            aggregate_type -> Text,
            version -> BigInt,
            state -> Jsonb,
            state_hash -> Text,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        projection_checkpoints (projection_name) {
            projection_name -> Text,
            last_processed_sequence -> BigInt,
            locked_by -> Nullable<Text>,
            locked_until -> Nullable<Timestamptz>,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        sagas (saga_id) {
            saga_id -> Uuid,
            saga_type -> Text,
            state -> Text,
            state_data -> Jsonb,
            metadata -> Jsonb,
            timeout_at -> Nullable<Timestamptz>,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        read_models (model_type, id) {
            id -> Text,
            model_type -> Text,
            data -> Jsonb,
            version -> BigInt,
            last_updated -> Timestamptz,
            metadata -> Jsonb,
        }
    }

    diesel::table! {
        query_cache (cache_key) {
            cache_key -> Text,
            value -> Jsonb,
            tags -> Jsonb,
            expires_at -> Timestamptz,
        }
    }

    diesel::table! {
        query_cache_tags (tag, cache_key) {
            tag -> Text,
            cache_key -> Text,
        }
    }
}

use schema::{event_log, projection_checkpoints, query_cache, query_cache_tags, read_models, sagas, snapshots};

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub database_url: String,
    pub pool_size: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/eventflow".to_string(),
            pool_size: 10,
        }
    }
}

/// Build a connection pool shared by the postgres-backed stores.
pub fn build_pool(config: &PostgresConfig) -> EngineResult<Arc<PgPool>> {
    let manager = ConnectionManager::<PgConnection>::new(&config.database_url);
    let pool = Pool::builder()
        .max_size(config.pool_size)
        .build(manager)
        .map_err(|e| EngineError::storage("pool_build", e.to_string()))?;
    Ok(Arc::new(pool))
}

fn get_connection(
    pool: &PgPool,
    operation: &str,
) -> EngineResult<PooledConnection<ConnectionManager<PgConnection>>> {
    pool.get().map_err(|e| {
        EngineError::transient(
            TransientKind::ConnectionReset,
            operation,
            format!("connection pool exhausted: {}", e),
        )
    })
}

/// Map diesel failures onto the error taxonomy. Deadlocks and serialization
/// failures are retryable; unique violations on the event log surface as
/// concurrency conflicts at the call site.
fn map_db_error(operation: &str, error: diesel::result::Error) -> EngineError {
    match &error {
        diesel::result::Error::DatabaseError(kind, info) => match kind {
            DatabaseErrorKind::SerializationFailure => EngineError::transient(
                TransientKind::Deadlock,
                operation,
                info.message().to_string(),
            ),
            DatabaseErrorKind::ClosedConnection => EngineError::transient(
                TransientKind::ConnectionReset,
                operation,
                info.message().to_string(),
            ),
            _ => EngineError::storage(operation, info.message().to_string()),
        },
        _ => EngineError::storage(operation, error.to_string()),
    }
}

fn is_unique_violation(error: &diesel::result::Error) -> bool {
    matches!(
        error,
        diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)
    )
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = event_log)]
struct EventRow {
    sequence_number: i64,
    event_id: Uuid,
    aggregate_id: String,
    aggregate_type: String,
    event_type: String,
    event_version: i32,
    version: i64,
    payload: Value,
    metadata: Value,
    occurred_at: DateTime<Utc>,
    recorded_at: DateTime<Utc>,
    checksum: Option<String>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = event_log)]
struct NewEventRow {
    event_id: Uuid,
    aggregate_id: String,
    aggregate_type: String,
    event_type: String,
    event_version: i32,
    version: i64,
    payload: Value,
    metadata: Value,
    occurred_at: DateTime<Utc>,
    recorded_at: DateTime<Utc>,
    checksum: Option<String>,
}

impl EventRow {
    fn into_envelope(self) -> EngineResult<EventEnvelope> {
        let metadata: EventMetadata = serde_json::from_value(self.metadata)?;
        Ok(EventEnvelope {
            event_id: self.event_id,
            aggregate_id: AggregateId::new(self.aggregate_id),
            aggregate_type: self.aggregate_type,
            event_type: self.event_type,
            event_version: self.event_version,
            version: self.version,
            sequence_number: self.sequence_number,
            occurred_at: self.occurred_at,
            recorded_at: self.recorded_at,
            payload: self.payload,
            metadata,
            checksum: self.checksum,
        })
    }
}

fn new_event_row(event: &EventEnvelope) -> EngineResult<NewEventRow> {
    Ok(NewEventRow {
        event_id: event.event_id,
        aggregate_id: event.aggregate_id.to_string(),
        aggregate_type: event.aggregate_type.clone(),
        event_type: event.event_type.clone(),
        event_version: event.event_version,
        version: event.version,
        payload: event.payload.clone(),
        metadata: serde_json::to_value(&event.metadata)?,
        occurred_at: event.occurred_at,
        recorded_at: Utc::now(),
        checksum: event.checksum.clone(),
    })
}

/// Warm event store on PostgreSQL.
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
    enable_checksums: bool,
}

impl PostgresEventStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self {
            pool,
            enable_checksums: true,
        }
    }

    pub fn without_checksums(mut self) -> Self {
        self.enable_checksums = false;
        self
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append(
        &self,
        aggregate_id: &AggregateId,
        events: &[EventEnvelope],
        expected_version: Option<i64>,
    ) -> EngineResult<AppendOutcome> {
        let mut conn = get_connection(&self.pool, "append")?;
        let id = aggregate_id.to_string();

        if events.is_empty() {
            let current: Option<i64> = event_log::table
                .filter(event_log::aggregate_id.eq(&id))
                .select(diesel::dsl::max(event_log::version))
                .first(&mut conn)
                .map_err(|e| map_db_error("append", e))?;
            return Ok(AppendOutcome {
                aggregate_version: current.unwrap_or(0),
                sequence_range: None,
            });
        }

        let mut rows = Vec::with_capacity(events.len());
        for event in events {
            let mut event = event.clone();
            if self.enable_checksums && event.checksum.is_none() {
                event = event.sealed();
            }
            rows.push(new_event_row(&event)?);
        }

        let expected = expected_version.unwrap_or(events[0].version - 1);
        let inserted: Vec<EventRow> = match conn
            .transaction::<_, diesel::result::Error, _>(|conn| {
                let current: Option<i64> = event_log::table
                    .filter(event_log::aggregate_id.eq(&id))
                    .select(diesel::dsl::max(event_log::version))
                    .first(conn)?;
                if current.unwrap_or(0) != expected {
                    return Err(diesel::result::Error::RollbackTransaction);
                }
                diesel::insert_into(event_log::table)
                    .values(&rows)
                    .get_results(conn)
            }) {
            Ok(rows) => rows,
            Err(e)
                if is_unique_violation(&e)
                    || matches!(e, diesel::result::Error::RollbackTransaction) =>
            {
                let actual: i64 = event_log::table
                    .filter(event_log::aggregate_id.eq(&id))
                    .select(diesel::dsl::max(event_log::version))
                    .first::<Option<i64>>(&mut conn)
                    .ok()
                    .flatten()
                    .unwrap_or(0);
                return Err(EngineError::ConcurrencyConflict {
                    aggregate_id: id,
                    expected,
                    actual,
                });
            }
            Err(e) => return Err(map_db_error("append", e)),
        };

        let first = inserted.first().map(|r| r.sequence_number).unwrap_or(0);
        let last = inserted.last().map(|r| r.sequence_number).unwrap_or(first);
        Ok(AppendOutcome {
            aggregate_version: expected + events.len() as i64,
            sequence_range: Some((first, last)),
        })
    }

    async fn load(
        &self,
        aggregate_id: &AggregateId,
        from_version: i64,
        to_version: Option<i64>,
    ) -> EngineResult<EventStream> {
        let mut conn = get_connection(&self.pool, "load")?;
        let mut query = event_log::table
            .filter(event_log::aggregate_id.eq(aggregate_id.to_string()))
            .filter(event_log::version.ge(from_version))
            .into_boxed();
        if let Some(to) = to_version {
            query = query.filter(event_log::version.le(to));
        }
        let rows: Vec<EventRow> = query
            .order(event_log::version.asc())
            .load(&mut conn)
            .map_err(|e| map_db_error("load", e))?;
        rows.into_iter()
            .map(EventRow::into_envelope)
            .collect::<EngineResult<Vec<_>>>()
            .map(EventStream::new)
    }

    async fn load_batch(
        &self,
        aggregate_ids: &[AggregateId],
        from_version: i64,
        to_version: Option<i64>,
    ) -> EngineResult<HashMap<AggregateId, EventStream>> {
        let mut result: HashMap<AggregateId, EventStream> = aggregate_ids
            .iter()
            .map(|id| (id.clone(), EventStream::empty()))
            .collect();
        if aggregate_ids.is_empty() {
            return Ok(result);
        }

        let mut conn = get_connection(&self.pool, "load_batch")?;
        let ids: Vec<String> = aggregate_ids.iter().map(|id| id.to_string()).collect();
        let mut query = event_log::table
            .filter(event_log::aggregate_id.eq_any(&ids))
            .filter(event_log::version.ge(from_version))
            .into_boxed();
        if let Some(to) = to_version {
            query = query.filter(event_log::version.le(to));
        }
        let rows: Vec<EventRow> = query
            .order((event_log::aggregate_id.asc(), event_log::version.asc()))
            .load(&mut conn)
            .map_err(|e| map_db_error("load_batch", e))?;

        for row in rows {
            let envelope = row.into_envelope()?;
            result
                .entry(envelope.aggregate_id.clone())
                .or_default()
                .push(envelope);
        }
        Ok(result)
    }

    async fn aggregate_exists(&self, aggregate_id: &AggregateId) -> EngineResult<bool> {
        let mut conn = get_connection(&self.pool, "aggregate_exists")?;
        let count: i64 = event_log::table
            .filter(event_log::aggregate_id.eq(aggregate_id.to_string()))
            .count()
            .get_result(&mut conn)
            .map_err(|e| map_db_error("aggregate_exists", e))?;
        Ok(count > 0)
    }

    async fn aggregate_exists_batch(
        &self,
        aggregate_ids: &[AggregateId],
    ) -> EngineResult<HashMap<AggregateId, bool>> {
        let versions = self.aggregate_versions_batch(aggregate_ids).await?;
        Ok(versions
            .into_iter()
            .map(|(id, version)| (id, version > 0))
            .collect())
    }

    async fn aggregate_version(&self, aggregate_id: &AggregateId) -> EngineResult<i64> {
        let mut conn = get_connection(&self.pool, "aggregate_version")?;
        let version: Option<i64> = event_log::table
            .filter(event_log::aggregate_id.eq(aggregate_id.to_string()))
            .select(diesel::dsl::max(event_log::version))
            .first(&mut conn)
            .map_err(|e| map_db_error("aggregate_version", e))?;
        Ok(version.unwrap_or(0))
    }

    async fn aggregate_versions_batch(
        &self,
        aggregate_ids: &[AggregateId],
    ) -> EngineResult<HashMap<AggregateId, i64>> {
        let mut result: HashMap<AggregateId, i64> = aggregate_ids
            .iter()
            .map(|id| (id.clone(), 0))
            .collect();
        if aggregate_ids.is_empty() {
            return Ok(result);
        }
        let mut conn = get_connection(&self.pool, "aggregate_versions_batch")?;
        let ids: Vec<String> = aggregate_ids.iter().map(|id| id.to_string()).collect();
        let rows: Vec<(String, Option<i64>)> = event_log::table
            .filter(event_log::aggregate_id.eq_any(&ids))
            .group_by(event_log::aggregate_id)
            .select((event_log::aggregate_id, diesel::dsl::max(event_log::version)))
            .load(&mut conn)
            .map_err(|e| map_db_error("aggregate_versions_batch", e))?;
        for (id, version) in rows {
            result.insert(AggregateId::new(id), version.unwrap_or(0));
        }
        Ok(result)
    }

    async fn load_events_by_type(
        &self,
        event_type: &str,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<EventEnvelope>> {
        let mut conn = get_connection(&self.pool, "load_events_by_type")?;
        let rows: Vec<EventRow> = event_log::table
            .filter(event_log::event_type.eq(event_type))
            .order(event_log::sequence_number.asc())
            .offset(offset as i64)
            .limit(limit as i64)
            .load(&mut conn)
            .map_err(|e| map_db_error("load_events_by_type", e))?;
        rows.into_iter().map(EventRow::into_envelope).collect()
    }

    async fn load_events_from_sequence(
        &self,
        from_sequence: i64,
        limit: usize,
    ) -> EngineResult<Vec<EventEnvelope>> {
        let mut conn = get_connection(&self.pool, "load_events_from_sequence")?;
        let rows: Vec<EventRow> = event_log::table
            .filter(event_log::sequence_number.ge(from_sequence))
            .order(event_log::sequence_number.asc())
            .limit(limit as i64)
            .load(&mut conn)
            .map_err(|e| map_db_error("load_events_from_sequence", e))?;
        rows.into_iter().map(EventRow::into_envelope).collect()
    }

    async fn latest_sequence(&self) -> EngineResult<i64> {
        let mut conn = get_connection(&self.pool, "latest_sequence")?;
        let latest: Option<i64> = event_log::table
            .select(diesel::dsl::max(event_log::sequence_number))
            .first(&mut conn)
            .map_err(|e| map_db_error("latest_sequence", e))?;
        Ok(latest.unwrap_or(0))
    }

    async fn statistics(&self) -> EngineResult<EventStoreStatistics> {
        let mut conn = get_connection(&self.pool, "statistics")?;
        let total_events: i64 = event_log::table
            .count()
            .get_result(&mut conn)
            .map_err(|e| map_db_error("statistics", e))?;
        let total_aggregates: i64 = event_log::table
            .select(diesel::dsl::count_distinct(event_log::aggregate_id))
            .first(&mut conn)
            .map_err(|e| map_db_error("statistics", e))?;
        let latest: Option<i64> = event_log::table
            .select(diesel::dsl::max(event_log::sequence_number))
            .first(&mut conn)
            .map_err(|e| map_db_error("statistics", e))?;
        Ok(EventStoreStatistics {
            total_events: total_events as u64,
            total_aggregates: total_aggregates as u64,
            latest_sequence: latest.unwrap_or(0),
        })
    }
}

#[derive(Debug, Queryable, Selectable, Insertable)]
#[diesel(table_name = snapshots)]
struct SnapshotRow {
    aggregate_id: String,
    aggregate_type: String,
    version: i64,
    state: Value,
    state_hash: String,
    created_at: DateTime<Utc>,
}

impl SnapshotRow {
    fn into_snapshot(self) -> AggregateSnapshot {
        AggregateSnapshot {
            aggregate_id: AggregateId::new(self.aggregate_id),
            aggregate_type: self.aggregate_type,
            version: self.version,
            state: self.state,
            state_hash: self.state_hash,
            created_at: self.created_at,
        }
    }
}

/// Snapshot store on PostgreSQL.
pub struct PostgresSnapshotStore {
    pool: Arc<PgPool>,
}

impl PostgresSnapshotStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    fn verified(snapshot: AggregateSnapshot) -> EngineResult<AggregateSnapshot> {
        snapshot.verify_integrity()?;
        Ok(snapshot)
    }
}

#[async_trait]
impl SnapshotStore for PostgresSnapshotStore {
    async fn save(&self, snapshot: AggregateSnapshot) -> EngineResult<()> {
        let mut conn = get_connection(&self.pool, "snapshot_save")?;
        let row = SnapshotRow {
            aggregate_id: snapshot.aggregate_id.to_string(),
            aggregate_type: snapshot.aggregate_type,
            version: snapshot.version,
            state: snapshot.state,
            state_hash: snapshot.state_hash,
            created_at: snapshot.created_at,
        };
        diesel::insert_into(snapshots::table)
            .values(&row)
            .on_conflict((snapshots::aggregate_id, snapshots::version))
            .do_update()
            .set((
                snapshots::state.eq(&row.state),
                snapshots::state_hash.eq(&row.state_hash),
                snapshots::created_at.eq(&row.created_at),
            ))
            .execute(&mut conn)
            .map_err(|e| map_db_error("snapshot_save", e))?;
        Ok(())
    }

    async fn load(&self, aggregate_id: &AggregateId) -> EngineResult<Option<AggregateSnapshot>> {
        let mut conn = get_connection(&self.pool, "snapshot_load")?;
        let row: Option<SnapshotRow> = snapshots::table
            .filter(snapshots::aggregate_id.eq(aggregate_id.to_string()))
            .order(snapshots::version.desc())
            .first(&mut conn)
            .optional()
            .map_err(|e| map_db_error("snapshot_load", e))?;
        row.map(|r| Self::verified(r.into_snapshot())).transpose()
    }

    async fn load_version(
        &self,
        aggregate_id: &AggregateId,
        version: i64,
    ) -> EngineResult<Option<AggregateSnapshot>> {
        let mut conn = get_connection(&self.pool, "snapshot_load_version")?;
        let row: Option<SnapshotRow> = snapshots::table
            .filter(snapshots::aggregate_id.eq(aggregate_id.to_string()))
            .filter(snapshots::version.eq(version))
            .first(&mut conn)
            .optional()
            .map_err(|e| map_db_error("snapshot_load_version", e))?;
        row.map(|r| Self::verified(r.into_snapshot())).transpose()
    }

    async fn load_batch(
        &self,
        aggregate_ids: &[AggregateId],
    ) -> EngineResult<HashMap<AggregateId, AggregateSnapshot>> {
        if aggregate_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = get_connection(&self.pool, "snapshot_load_batch")?;
        let ids: Vec<String> = aggregate_ids.iter().map(|id| id.to_string()).collect();
        let rows: Vec<SnapshotRow> = snapshots::table
            .filter(snapshots::aggregate_id.eq_any(&ids))
            .order((snapshots::aggregate_id.asc(), snapshots::version.asc()))
            .load(&mut conn)
            .map_err(|e| map_db_error("snapshot_load_batch", e))?;

        let mut result = HashMap::new();
        for row in rows {
            // Ascending order: later rows replace earlier versions
            let snapshot = row.into_snapshot();
            if snapshot.verify_integrity().is_ok() {
                result.insert(snapshot.aggregate_id.clone(), snapshot);
            } else {
                tracing::warn!(
                    aggregate_id = %snapshot.aggregate_id,
                    version = snapshot.version,
                    "skipping corrupt snapshot in batch load"
                );
            }
        }
        Ok(result)
    }

    async fn exists(&self, aggregate_id: &AggregateId) -> EngineResult<bool> {
        let mut conn = get_connection(&self.pool, "snapshot_exists")?;
        let count: i64 = snapshots::table
            .filter(snapshots::aggregate_id.eq(aggregate_id.to_string()))
            .count()
            .get_result(&mut conn)
            .map_err(|e| map_db_error("snapshot_exists", e))?;
        Ok(count > 0)
    }

    async fn prune(&self, aggregate_id: &AggregateId, keep: usize) -> EngineResult<usize> {
        let mut conn = get_connection(&self.pool, "snapshot_prune")?;
        let id = aggregate_id.to_string();
        let keep_versions: Vec<i64> = snapshots::table
            .filter(snapshots::aggregate_id.eq(&id))
            .order(snapshots::version.desc())
            .limit(keep as i64)
            .select(snapshots::version)
            .load(&mut conn)
            .map_err(|e| map_db_error("snapshot_prune", e))?;
        let deleted = diesel::delete(
            snapshots::table
                .filter(snapshots::aggregate_id.eq(&id))
                .filter(snapshots::version.ne_all(keep_versions)),
        )
        .execute(&mut conn)
        .map_err(|e| map_db_error("snapshot_prune", e))?;
        Ok(deleted)
    }

    async fn remove_all(&self, aggregate_id: &AggregateId) -> EngineResult<usize> {
        let mut conn = get_connection(&self.pool, "snapshot_remove_all")?;
        diesel::delete(
            snapshots::table.filter(snapshots::aggregate_id.eq(aggregate_id.to_string())),
        )
        .execute(&mut conn)
        .map_err(|e| map_db_error("snapshot_remove_all", e))
    }
}

#[derive(Debug, Queryable, Selectable, Insertable)]
#[diesel(table_name = projection_checkpoints)]
struct CheckpointRow {
    projection_name: String,
    last_processed_sequence: i64,
    locked_by: Option<String>,
    locked_until: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl CheckpointRow {
    fn into_checkpoint(self) -> ProjectionCheckpoint {
        ProjectionCheckpoint {
            projection_name: self.projection_name,
            last_processed_sequence: self.last_processed_sequence,
            locked_by: self.locked_by,
            locked_until: self.locked_until,
            updated_at: self.updated_at,
        }
    }
}

/// Checkpoint store on PostgreSQL. Lock acquisition runs in a transaction
/// with `SELECT ... FOR UPDATE`, so two workers cannot both claim an
/// expired lease.
pub struct PostgresCheckpointStore {
    pool: Arc<PgPool>,
}

impl PostgresCheckpointStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    fn ensure_row(conn: &mut PgConnection, name: &str) -> Result<(), diesel::result::Error> {
        diesel::insert_into(projection_checkpoints::table)
            .values(&CheckpointRow {
                projection_name: name.to_string(),
                last_processed_sequence: 0,
                locked_by: None,
                locked_until: None,
                updated_at: Utc::now(),
            })
            .on_conflict(projection_checkpoints::projection_name)
            .do_nothing()
            .execute(conn)?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn load(&self, name: &str) -> EngineResult<Option<ProjectionCheckpoint>> {
        let mut conn = get_connection(&self.pool, "checkpoint_load")?;
        let row: Option<CheckpointRow> = projection_checkpoints::table
            .filter(projection_checkpoints::projection_name.eq(name))
            .first(&mut conn)
            .optional()
            .map_err(|e| map_db_error("checkpoint_load", e))?;
        Ok(row.map(CheckpointRow::into_checkpoint))
    }

    async fn save_position(&self, name: &str, sequence: i64) -> EngineResult<()> {
        let mut conn = get_connection(&self.pool, "checkpoint_save")?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            Self::ensure_row(conn, name)?;
            diesel::update(
                projection_checkpoints::table
                    .filter(projection_checkpoints::projection_name.eq(name)),
            )
            .set((
                projection_checkpoints::last_processed_sequence.eq(sequence),
                projection_checkpoints::updated_at.eq(Utc::now()),
            ))
            .execute(conn)?;
            Ok(())
        })
        .map_err(|e| map_db_error("checkpoint_save", e))
    }

    async fn acquire_lock(&self, name: &str, holder: &str, lease: Duration) -> EngineResult<bool> {
        let mut conn = get_connection(&self.pool, "checkpoint_lock")?;
        let lease_until = Utc::now()
            + ChronoDuration::from_std(lease).unwrap_or_else(|_| ChronoDuration::seconds(30));

        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            Self::ensure_row(conn, name)?;
            let row: CheckpointRow = projection_checkpoints::table
                .filter(projection_checkpoints::projection_name.eq(name))
                .for_update()
                .first(conn)?;

            let now = Utc::now();
            let acquirable = match (&row.locked_by, row.locked_until) {
                (None, _) => true,
                (Some(current), _) if current == holder => true,
                (Some(_), Some(until)) if until <= now => true,
                (Some(_), None) => true,
                _ => false,
            };
            if !acquirable {
                return Ok(false);
            }
            diesel::update(
                projection_checkpoints::table
                    .filter(projection_checkpoints::projection_name.eq(name)),
            )
            .set((
                projection_checkpoints::locked_by.eq(Some(holder.to_string())),
                projection_checkpoints::locked_until.eq(Some(lease_until)),
                projection_checkpoints::updated_at.eq(now),
            ))
            .execute(conn)?;
            Ok(true)
        })
        .map_err(|e| map_db_error("checkpoint_lock", e))
    }

    async fn release_lock(&self, name: &str, holder: &str) -> EngineResult<()> {
        let mut conn = get_connection(&self.pool, "checkpoint_unlock")?;
        diesel::update(
            projection_checkpoints::table
                .filter(projection_checkpoints::projection_name.eq(name))
                .filter(projection_checkpoints::locked_by.eq(holder)),
        )
        .set((
            projection_checkpoints::locked_by.eq(None::<String>),
            projection_checkpoints::locked_until.eq(None::<DateTime<Utc>>),
            projection_checkpoints::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .map_err(|e| map_db_error("checkpoint_unlock", e))?;
        Ok(())
    }

    async fn reset(&self, name: &str) -> EngineResult<()> {
        self.save_position(name, 0).await
    }

    async fn all(&self) -> EngineResult<Vec<ProjectionCheckpoint>> {
        let mut conn = get_connection(&self.pool, "checkpoint_all")?;
        let rows: Vec<CheckpointRow> = projection_checkpoints::table
            .order(projection_checkpoints::projection_name.asc())
            .load(&mut conn)
            .map_err(|e| map_db_error("checkpoint_all", e))?;
        Ok(rows.into_iter().map(CheckpointRow::into_checkpoint).collect())
    }
}

#[derive(Debug, Queryable, Selectable, Insertable)]
#[diesel(table_name = sagas)]
struct SagaRow {
    saga_id: Uuid,
    saga_type: String,
    state: String,
    state_data: Value,
    metadata: Value,
    timeout_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn saga_state_to_str(state: SagaState) -> &'static str {
    match state {
        SagaState::Pending => "pending",
        SagaState::Running => "running",
        SagaState::Completed => "completed",
        SagaState::Failed => "failed",
        SagaState::Compensating => "compensating",
        SagaState::Compensated => "compensated",
        SagaState::TimedOut => "timed_out",
    }
}

fn saga_state_from_str(state: &str) -> SagaState {
    match state {
        "pending" => SagaState::Pending,
        "running" => SagaState::Running,
        "completed" => SagaState::Completed,
        "compensating" => SagaState::Compensating,
        "compensated" => SagaState::Compensated,
        "timed_out" => SagaState::TimedOut,
        _ => SagaState::Failed,
    }
}

impl SagaRow {
    fn into_record(self) -> EngineResult<SagaRecord> {
        let metadata: HashMap<String, Value> = serde_json::from_value(self.metadata)?;
        Ok(SagaRecord {
            saga_id: self.saga_id,
            saga_type: self.saga_type,
            state: saga_state_from_str(&self.state),
            state_data: self.state_data,
            metadata,
            timeout_at: self.timeout_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Saga store on PostgreSQL. Mutation locks are per-process; deployments
/// with multiple coordinator processes partition saga types between them.
pub struct PostgresSagaStore {
    pool: Arc<PgPool>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl PostgresSagaStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self {
            pool,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn active_states() -> Vec<&'static str> {
        vec!["pending", "running", "compensating"]
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn save(&self, record: &SagaRecord) -> EngineResult<()> {
        let mut conn = get_connection(&self.pool, "saga_save")?;
        let row = SagaRow {
            saga_id: record.saga_id,
            saga_type: record.saga_type.clone(),
            state: saga_state_to_str(record.state).to_string(),
            state_data: record.state_data.clone(),
            metadata: serde_json::to_value(&record.metadata)?,
            timeout_at: record.timeout_at,
            created_at: record.created_at,
            updated_at: record.updated_at,
        };
        diesel::insert_into(sagas::table)
            .values(&row)
            .on_conflict(sagas::saga_id)
            .do_update()
            .set((
                sagas::state.eq(&row.state),
                sagas::state_data.eq(&row.state_data),
                sagas::metadata.eq(&row.metadata),
                sagas::timeout_at.eq(&row.timeout_at),
                sagas::updated_at.eq(&row.updated_at),
            ))
            .execute(&mut conn)
            .map_err(|e| map_db_error("saga_save", e))?;
        Ok(())
    }

    async fn load(&self, saga_id: Uuid) -> EngineResult<Option<SagaRecord>> {
        let mut conn = get_connection(&self.pool, "saga_load")?;
        let row: Option<SagaRow> = sagas::table
            .filter(sagas::saga_id.eq(saga_id))
            .first(&mut conn)
            .optional()
            .map_err(|e| map_db_error("saga_load", e))?;
        row.map(SagaRow::into_record).transpose()
    }

    async fn load_active(&self) -> EngineResult<Vec<SagaRecord>> {
        let mut conn = get_connection(&self.pool, "saga_load_active")?;
        let rows: Vec<SagaRow> = sagas::table
            .filter(sagas::state.eq_any(Self::active_states()))
            .order(sagas::created_at.asc())
            .load(&mut conn)
            .map_err(|e| map_db_error("saga_load_active", e))?;
        rows.into_iter().map(SagaRow::into_record).collect()
    }

    async fn load_by_state(&self, state: SagaState) -> EngineResult<Vec<SagaRecord>> {
        let mut conn = get_connection(&self.pool, "saga_load_by_state")?;
        let rows: Vec<SagaRow> = sagas::table
            .filter(sagas::state.eq(saga_state_to_str(state)))
            .order(sagas::created_at.asc())
            .load(&mut conn)
            .map_err(|e| map_db_error("saga_load_by_state", e))?;
        rows.into_iter().map(SagaRow::into_record).collect()
    }

    async fn load_timed_out(&self, now: DateTime<Utc>) -> EngineResult<Vec<SagaRecord>> {
        let mut conn = get_connection(&self.pool, "saga_load_timed_out")?;
        let rows: Vec<SagaRow> = sagas::table
            .filter(sagas::state.ne_all(vec!["completed", "compensated", "timed_out"]))
            .filter(sagas::timeout_at.lt(now))
            .load(&mut conn)
            .map_err(|e| map_db_error("saga_load_timed_out", e))?;
        rows.into_iter().map(SagaRow::into_record).collect()
    }

    async fn acquire(&self, saga_id: Uuid) -> EngineResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(
                locks
                    .entry(saga_id)
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        Ok(lock.lock_owned().await)
    }

    async fn cleanup_finished(&self, before: DateTime<Utc>) -> EngineResult<usize> {
        let mut conn = get_connection(&self.pool, "saga_cleanup")?;
        diesel::delete(
            sagas::table
                .filter(sagas::state.eq_any(vec!["completed", "compensated", "timed_out"]))
                .filter(sagas::updated_at.lt(before)),
        )
        .execute(&mut conn)
        .map_err(|e| map_db_error("saga_cleanup", e))
    }
}

#[derive(Debug, Queryable, Selectable, Insertable)]
#[diesel(table_name = read_models)]
struct ReadModelRow {
    id: String,
    model_type: String,
    data: Value,
    version: i64,
    last_updated: DateTime<Utc>,
    metadata: Value,
}

impl ReadModelRow {
    fn into_model(self) -> EngineResult<ReadModel> {
        let metadata: HashMap<String, Value> = serde_json::from_value(self.metadata)?;
        Ok(ReadModel {
            id: self.id,
            model_type: self.model_type,
            data: self.data,
            version: self.version,
            last_updated: self.last_updated,
            metadata,
        })
    }
}

/// Read model store on PostgreSQL.
pub struct PostgresReadModelStore {
    pool: Arc<PgPool>,
}

impl PostgresReadModelStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReadModelStore for PostgresReadModelStore {
    async fn get(&self, model_type: &str, id: &str) -> EngineResult<Option<ReadModel>> {
        let mut conn = get_connection(&self.pool, "read_model_get")?;
        let row: Option<ReadModelRow> = read_models::table
            .filter(read_models::model_type.eq(model_type))
            .filter(read_models::id.eq(id))
            .first(&mut conn)
            .optional()
            .map_err(|e| map_db_error("read_model_get", e))?;
        row.map(ReadModelRow::into_model).transpose()
    }

    async fn put(&self, model: ReadModel) -> EngineResult<()> {
        let mut conn = get_connection(&self.pool, "read_model_put")?;
        let row = ReadModelRow {
            id: model.id,
            model_type: model.model_type,
            data: model.data,
            version: model.version,
            last_updated: model.last_updated,
            metadata: serde_json::to_value(&model.metadata)?,
        };
        diesel::insert_into(read_models::table)
            .values(&row)
            .on_conflict((read_models::model_type, read_models::id))
            .do_update()
            .set((
                read_models::data.eq(&row.data),
                read_models::version.eq(row.version),
                read_models::last_updated.eq(row.last_updated),
                read_models::metadata.eq(&row.metadata),
            ))
            .execute(&mut conn)
            .map_err(|e| map_db_error("read_model_put", e))?;
        Ok(())
    }

    async fn delete(&self, model_type: &str, id: &str) -> EngineResult<bool> {
        let mut conn = get_connection(&self.pool, "read_model_delete")?;
        let deleted = diesel::delete(
            read_models::table
                .filter(read_models::model_type.eq(model_type))
                .filter(read_models::id.eq(id)),
        )
        .execute(&mut conn)
        .map_err(|e| map_db_error("read_model_delete", e))?;
        Ok(deleted > 0)
    }

    async fn find_by_type(
        &self,
        model_type: &str,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<ReadModel>> {
        let mut conn = get_connection(&self.pool, "read_model_find")?;
        let rows: Vec<ReadModelRow> = read_models::table
            .filter(read_models::model_type.eq(model_type))
            .order(read_models::id.asc())
            .offset(offset as i64)
            .limit(limit as i64)
            .load(&mut conn)
            .map_err(|e| map_db_error("read_model_find", e))?;
        rows.into_iter().map(ReadModelRow::into_model).collect()
    }

    async fn count(&self, model_type: &str) -> EngineResult<usize> {
        let mut conn = get_connection(&self.pool, "read_model_count")?;
        let count: i64 = read_models::table
            .filter(read_models::model_type.eq(model_type))
            .count()
            .get_result(&mut conn)
            .map_err(|e| map_db_error("read_model_count", e))?;
        Ok(count as usize)
    }

    async fn clear_type(&self, model_type: &str) -> EngineResult<usize> {
        let mut conn = get_connection(&self.pool, "read_model_clear")?;
        diesel::delete(read_models::table.filter(read_models::model_type.eq(model_type)))
            .execute(&mut conn)
            .map_err(|e| map_db_error("read_model_clear", e))
    }
}

#[derive(Debug, Queryable, Selectable, Insertable)]
#[diesel(table_name = query_cache)]
struct QueryCacheRow {
    cache_key: String,
    value: Value,
    tags: Value,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = query_cache_tags)]
struct QueryCacheTagRow {
    tag: String,
    cache_key: String,
}

/// Durable (L3) query cache on PostgreSQL with explicit tag mappings.
pub struct PostgresDurableCache {
    pool: Arc<PgPool>,
}

impl PostgresDurableCache {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DurableCache for PostgresDurableCache {
    async fn get(&self, key: &str) -> EngineResult<Option<CachedValue>> {
        let mut conn = get_connection(&self.pool, "l3_get")?;
        let row: Option<QueryCacheRow> = query_cache::table
            .filter(query_cache::cache_key.eq(key))
            .filter(query_cache::expires_at.gt(Utc::now()))
            .first(&mut conn)
            .optional()
            .map_err(|e| map_db_error("l3_get", e))?;
        match row {
            Some(row) => {
                let tags: Vec<String> = serde_json::from_value(row.tags)?;
                Ok(Some(CachedValue {
                    value: row.value,
                    tags,
                }))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &CachedValue, ttl: Duration) -> EngineResult<()> {
        let mut conn = get_connection(&self.pool, "l3_set")?;
        let row = QueryCacheRow {
            cache_key: key.to_string(),
            value: value.value.clone(),
            tags: serde_json::to_value(&value.tags)?,
            expires_at: Utc::now()
                + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::minutes(10)),
        };
        diesel::insert_into(query_cache::table)
            .values(&row)
            .on_conflict(query_cache::cache_key)
            .do_update()
            .set((
                query_cache::value.eq(&row.value),
                query_cache::tags.eq(&row.tags),
                query_cache::expires_at.eq(row.expires_at),
            ))
            .execute(&mut conn)
            .map_err(|e| map_db_error("l3_set", e))?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> EngineResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = get_connection(&self.pool, "l3_delete")?;
        diesel::delete(query_cache::table.filter(query_cache::cache_key.eq_any(keys)))
            .execute(&mut conn)
            .map_err(|e| map_db_error("l3_delete", e))?;
        diesel::delete(query_cache_tags::table.filter(query_cache_tags::cache_key.eq_any(keys)))
            .execute(&mut conn)
            .map_err(|e| map_db_error("l3_delete", e))?;
        Ok(())
    }

    async fn add_tag_mappings(&self, key: &str, tags: &[String]) -> EngineResult<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let mut conn = get_connection(&self.pool, "l3_tag")?;
        let rows: Vec<QueryCacheTagRow> = tags
            .iter()
            .map(|tag| QueryCacheTagRow {
                tag: tag.clone(),
                cache_key: key.to_string(),
            })
            .collect();
        diesel::insert_into(query_cache_tags::table)
            .values(&rows)
            .on_conflict((query_cache_tags::tag, query_cache_tags::cache_key))
            .do_nothing()
            .execute(&mut conn)
            .map_err(|e| map_db_error("l3_tag", e))?;
        Ok(())
    }

    async fn keys_for_tags(&self, tags: &[String]) -> EngineResult<Vec<String>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = get_connection(&self.pool, "l3_keys_for_tags")?;
        query_cache_tags::table
            .filter(query_cache_tags::tag.eq_any(tags))
            .select(query_cache_tags::cache_key)
            .distinct()
            .load(&mut conn)
            .map_err(|e| map_db_error("l3_keys_for_tags", e))
    }

    async fn purge_expired(&self) -> EngineResult<usize> {
        let mut conn = get_connection(&self.pool, "l3_purge")?;
        diesel::delete(query_cache::table.filter(query_cache::expires_at.le(Utc::now())))
            .execute(&mut conn)
            .map_err(|e| map_db_error("l3_purge", e))
    }
}
