//! Aggregate snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{EngineError, EngineResult};
use crate::ids::AggregateId;

/// Serialized aggregate state at a particular version.
///
/// The hash covers the serialized state; loads verify it and fail with
/// [`EngineError::SnapshotIntegrity`] on mismatch so the caller can fall back
/// to a full replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateSnapshot {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub version: i64,
    pub state: Value,
    pub state_hash: String,
    pub created_at: DateTime<Utc>,
}

impl AggregateSnapshot {
    pub fn new(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        version: i64,
        state: Value,
    ) -> Self {
        let state_hash = hash_state(&state);
        Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            version,
            state,
            state_hash,
            created_at: Utc::now(),
        }
    }

    /// Verify the stored hash against the serialized state.
    pub fn verify_integrity(&self) -> EngineResult<()> {
        if hash_state(&self.state) == self.state_hash {
            Ok(())
        } else {
            Err(EngineError::SnapshotIntegrity {
                aggregate_id: self.aggregate_id.to_string(),
                version: self.version,
            })
        }
    }
}

fn hash_state(state: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(state.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integrity_passes_for_untouched_state() {
        let snapshot = AggregateSnapshot::new(
            AggregateId::new("U-1"),
            "user",
            10,
            json!({"email": "a@example.com", "version": 10}),
        );
        assert!(snapshot.verify_integrity().is_ok());
    }

    #[test]
    fn test_integrity_fails_after_tampering() {
        let mut snapshot = AggregateSnapshot::new(
            AggregateId::new("U-1"),
            "user",
            10,
            json!({"email": "a@example.com"}),
        );
        snapshot.state = json!({"email": "evil@example.com"});
        let err = snapshot.verify_integrity().unwrap_err();
        assert_eq!(err.code(), "snapshot_integrity");
    }
}
