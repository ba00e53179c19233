//! Domain event envelope and metadata.
//!
//! Events are immutable value objects. Once recorded by a store they are
//! never mutated; schema evolution happens through the payload's
//! `schema_version` and an explicit upcasting hook.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::ids::AggregateId;

/// Metadata attached to every event
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EventMetadata {
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub source: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub custom: HashMap<String, Value>,
}

impl EventMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_causation_id(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn add_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn add_custom(mut self, key: impl Into<String>, value: Value) -> Self {
        self.custom.insert(key.into(), value);
        self
    }
}

/// Sequence number value meaning "not yet assigned by the durable log"
pub const SEQUENCE_UNASSIGNED: i64 = 0;

/// Envelope wrapping a domain event with its positions and metadata.
///
/// `version` is the 1-based position within the aggregate's own stream.
/// `sequence_number` is the global ordinal assigned by the warm store at
/// durable insertion; it stays [`SEQUENCE_UNASSIGNED`] until then and is the
/// only cross-aggregate ordering the runtime guarantees.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub event_type: String,
    /// Schema revision of the payload
    pub event_version: i32,
    /// 1-based position within the aggregate's stream
    pub version: i64,
    /// Global ordinal assigned by the warm store
    pub sequence_number: i64,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub payload: Value,
    pub metadata: EventMetadata,
    pub checksum: Option<String>,
}

impl EventEnvelope {
    pub fn new(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        event_version: i32,
        version: i64,
        payload: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            event_version,
            version,
            sequence_number: SEQUENCE_UNASSIGNED,
            occurred_at: now,
            recorded_at: now,
            payload,
            metadata: EventMetadata::default(),
            checksum: None,
        }
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Compute the integrity checksum over payload and metadata.
    pub fn compute_checksum(&self) -> String {
        let metadata = serde_json::to_string(&self.metadata).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(self.payload.to_string().as_bytes());
        hasher.update(metadata.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Stamp the envelope with its checksum.
    pub fn sealed(mut self) -> Self {
        self.checksum = Some(self.compute_checksum());
        self
    }

    /// Verify a stamped checksum, if present. Unstamped envelopes pass.
    pub fn verify_checksum(&self) -> bool {
        match &self.checksum {
            Some(expected) => *expected == self.compute_checksum(),
            None => true,
        }
    }

    /// Decode the payload into a typed domain event, upcasting if the stored
    /// schema revision is older than the current one.
    pub fn decode<E: DomainEventPayload>(&self) -> EngineResult<E> {
        E::from_payload(&self.payload, self.event_version)
    }
}

/// Contract implemented by typed domain-event payloads.
///
/// The `event_type` string is the stable wire tag routing the event to
/// projectors and sagas; it must survive schema revisions. A
/// backward-incompatible payload change bumps [`schema_version`] and
/// supplies an [`upcast`] step from each older revision.
///
/// [`schema_version`]: DomainEventPayload::schema_version
/// [`upcast`]: DomainEventPayload::upcast
pub trait DomainEventPayload: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// Stable, fully qualified event type name.
    fn event_type() -> &'static str;

    /// Current schema revision of this payload.
    fn schema_version() -> i32 {
        1
    }

    /// Rewrite a payload stored at `from_version` into the current revision.
    fn upcast(payload: Value, from_version: i32) -> EngineResult<Value> {
        let _ = from_version;
        Ok(payload)
    }

    fn to_payload(&self) -> EngineResult<Value> {
        serde_json::to_value(self).map_err(|e| EngineError::Serialization {
            message: format!("failed to serialize '{}' payload: {}", Self::event_type(), e),
        })
    }

    fn from_payload(payload: &Value, stored_version: i32) -> EngineResult<Self> {
        let value = if stored_version < Self::schema_version() {
            Self::upcast(payload.clone(), stored_version)?
        } else {
            payload.clone()
        };
        serde_json::from_value(value).map_err(|e| EngineError::Serialization {
            message: format!(
                "failed to deserialize '{}' payload at schema version {}: {}",
                Self::event_type(),
                stored_version,
                e
            ),
        })
    }
}
