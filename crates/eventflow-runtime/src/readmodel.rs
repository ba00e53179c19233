//! Read models: denormalized views derived from events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

use eventflow_core::EngineResult;

/// A denormalized view row. `version` tracks the highest aggregate version
/// projected into it; read models may be rebuilt from the log at any time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadModel {
    pub id: String,
    pub model_type: String,
    pub data: Value,
    pub version: i64,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ReadModel {
    pub fn new(
        id: impl Into<String>,
        model_type: impl Into<String>,
        data: Value,
        version: i64,
    ) -> Self {
        Self {
            id: id.into(),
            model_type: model_type.into(),
            data,
            version,
            last_updated: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}

/// Storage for read models, keyed by `(model_type, id)`.
#[async_trait]
pub trait ReadModelStore: Send + Sync {
    async fn get(&self, model_type: &str, id: &str) -> EngineResult<Option<ReadModel>>;

    async fn put(&self, model: ReadModel) -> EngineResult<()>;

    async fn delete(&self, model_type: &str, id: &str) -> EngineResult<bool>;

    async fn find_by_type(
        &self,
        model_type: &str,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<ReadModel>>;

    async fn count(&self, model_type: &str) -> EngineResult<usize>;

    /// Drop every row of a type, for projection rebuilds.
    async fn clear_type(&self, model_type: &str) -> EngineResult<usize>;
}

/// In-memory read model store.
pub struct InMemoryReadModelStore {
    models: RwLock<HashMap<(String, String), ReadModel>>,
}

impl InMemoryReadModelStore {
    pub fn new() -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryReadModelStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadModelStore for InMemoryReadModelStore {
    async fn get(&self, model_type: &str, id: &str) -> EngineResult<Option<ReadModel>> {
        let models = self.models.read().await;
        Ok(models
            .get(&(model_type.to_string(), id.to_string()))
            .cloned())
    }

    async fn put(&self, model: ReadModel) -> EngineResult<()> {
        let mut models = self.models.write().await;
        models.insert((model.model_type.clone(), model.id.clone()), model);
        Ok(())
    }

    async fn delete(&self, model_type: &str, id: &str) -> EngineResult<bool> {
        let mut models = self.models.write().await;
        Ok(models
            .remove(&(model_type.to_string(), id.to_string()))
            .is_some())
    }

    async fn find_by_type(
        &self,
        model_type: &str,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<ReadModel>> {
        let models = self.models.read().await;
        let mut matching: Vec<ReadModel> = models
            .values()
            .filter(|m| m.model_type == model_type)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&self, model_type: &str) -> EngineResult<usize> {
        let models = self.models.read().await;
        Ok(models.values().filter(|m| m.model_type == model_type).count())
    }

    async fn clear_type(&self, model_type: &str) -> EngineResult<usize> {
        let mut models = self.models.write().await;
        let before = models.len();
        models.retain(|(t, _), _| t != model_type);
        Ok(before - models.len())
    }
}
