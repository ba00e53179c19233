//! Command bus: typed commands, handler registry, and the middleware chain.

pub mod async_bus;
pub mod circuit;
pub mod middleware;

pub use async_bus::{
    AsyncCommandBus, AsyncCommandState, AsyncCommandStatus, AsyncCommandStrategy,
    AsyncStatusRepository, InMemoryAsyncStatusRepository, ASYNC_COMMAND_JOB_TYPE,
};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use middleware::{
    AuthorizationMiddleware, BackoffStrategy, CircuitBreakerMiddleware, CommandValidator,
    RequiredFieldsValidator, RetryMiddleware, RetryPolicy, TransactionMiddleware,
    ValidationMiddleware,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use eventflow_core::{EngineError, EngineResult, MessageKind};

use crate::auth::Principal;

/// Metadata traveling with every command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMetadata {
    pub principal: Option<Principal>,
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    /// Opt out of the transaction middleware
    pub transactional: bool,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl Default for CommandMetadata {
    fn default() -> Self {
        Self {
            principal: None,
            correlation_id: None,
            causation_id: None,
            transactional: true,
            timeout_ms: None,
            tags: HashMap::new(),
        }
    }
}

/// Type-erased command: a stable type tag plus a serialized payload.
///
/// The envelope is what travels through the bus, the middleware chain, and
/// durable job queues; typed [`Command`] values build envelopes and handlers
/// decode them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_id: Uuid,
    pub command_type: String,
    pub payload: Value,
    pub metadata: CommandMetadata,
    pub submitted_at: DateTime<Utc>,
}

impl CommandEnvelope {
    pub fn new(command_type: impl Into<String>, payload: Value) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            command_type: command_type.into(),
            payload,
            metadata: CommandMetadata::default(),
            submitted_at: Utc::now(),
        }
    }

    pub fn from_command<C: Command>(command: &C) -> EngineResult<Self> {
        Ok(Self::new(C::command_type(), serde_json::to_value(command)?))
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.metadata.principal = Some(principal);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.metadata.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.metadata.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Opt this command out of the transaction middleware.
    pub fn without_transaction(mut self) -> Self {
        self.metadata.transactional = false;
        self
    }

    pub fn decode<C: Command>(&self) -> EngineResult<C> {
        serde_json::from_value(self.payload.clone()).map_err(|e| EngineError::Serialization {
            message: format!(
                "failed to decode '{}' command payload: {}",
                self.command_type, e
            ),
        })
    }
}

/// Typed state-changing command.
pub trait Command: Serialize + DeserializeOwned + Send + Sync {
    /// Stable type tag routing the command to its handler.
    fn command_type() -> &'static str;

    fn envelope(&self) -> EngineResult<CommandEnvelope> {
        CommandEnvelope::from_command(self)
    }
}

/// Handles one command type.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn command_type(&self) -> &str;

    async fn handle(&self, command: CommandEnvelope) -> EngineResult<Value>;
}

/// A stage in the command pipeline. Higher priority runs earlier (closer to
/// the caller); the chain order is stable for equal priorities.
#[async_trait]
pub trait CommandMiddleware: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32;

    fn should_process(&self, command: &CommandEnvelope) -> bool {
        let _ = command;
        true
    }

    async fn handle(&self, command: CommandEnvelope, next: Next<'_>) -> EngineResult<Value>;
}

/// Remainder of the middleware chain, ending at the handler.
///
/// `Next` is `Copy`, so middlewares that re-invoke downstream stages (the
/// retry decorator) can run it multiple times.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn CommandMiddleware>],
    handler: &'a Arc<dyn CommandHandler>,
}

impl<'a> Next<'a> {
    pub fn run(self, command: CommandEnvelope) -> BoxFuture<'a, EngineResult<Value>> {
        Box::pin(async move {
            match self.middlewares.split_first() {
                Some((middleware, rest)) => {
                    let next = Next {
                        middlewares: rest,
                        handler: self.handler,
                    };
                    if middleware.should_process(&command) {
                        middleware.handle(command, next).await
                    } else {
                        next.run(command).await
                    }
                }
                None => self.handler.handle(command).await,
            }
        })
    }
}

/// Per-command-type dispatch statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandTypeStatistics {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub average_duration_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandBusStatistics {
    pub total_dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub average_duration_ms: f64,
    pub per_type: HashMap<String, CommandTypeStatistics>,
}

impl CommandBusStatistics {
    fn record(&mut self, command_type: &str, success: bool, duration_ms: f64) {
        self.total_dispatched += 1;
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        let total = self.total_dispatched as f64;
        self.average_duration_ms = (self.average_duration_ms * (total - 1.0) + duration_ms) / total;

        let entry = self.per_type.entry(command_type.to_string()).or_default();
        entry.dispatched += 1;
        if success {
            entry.succeeded += 1;
        } else {
            entry.failed += 1;
        }
        let type_total = entry.dispatched as f64;
        entry.average_duration_ms =
            (entry.average_duration_ms * (type_total - 1.0) + duration_ms) / type_total;
    }
}

/// Routes each command to exactly one handler through an ordered middleware
/// chain.
pub struct CommandBus {
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    middlewares: RwLock<Vec<Arc<dyn CommandMiddleware>>>,
    statistics: Mutex<CommandBusStatistics>,
}

impl CommandBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            middlewares: RwLock::new(Vec::new()),
            statistics: Mutex::new(CommandBusStatistics::default()),
        }
    }

    pub async fn register_handler(&self, handler: Arc<dyn CommandHandler>) {
        let mut handlers = self.handlers.write().await;
        let command_type = handler.command_type().to_string();
        if handlers.insert(command_type.clone(), handler).is_some() {
            warn!(command_type = %command_type, "replaced existing command handler");
        }
    }

    /// Insert a middleware, keeping the chain ordered by priority descending.
    pub async fn add_middleware(&self, middleware: Arc<dyn CommandMiddleware>) {
        let mut middlewares = self.middlewares.write().await;
        middlewares.push(middleware);
        middlewares.sort_by_key(|m| std::cmp::Reverse(m.priority()));
    }

    pub async fn middleware_names(&self) -> Vec<String> {
        self.middlewares
            .read()
            .await
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    /// Dispatch a typed command.
    pub async fn dispatch_command<C: Command>(&self, command: &C) -> EngineResult<Value> {
        self.dispatch(command.envelope()?).await
    }

    /// Dispatch an envelope through the middleware chain to its handler.
    pub async fn dispatch(&self, command: CommandEnvelope) -> EngineResult<Value> {
        let command_type = command.command_type.clone();
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&command_type).cloned()
        }
        .ok_or_else(|| {
            warn!(command_type = %command_type, "no handler registered for command");
            EngineError::HandlerNotFound {
                kind: MessageKind::Command,
                message_type: command_type.clone(),
            }
        })?;

        let middlewares = self.middlewares.read().await.clone();
        let timeout_ms = command.metadata.timeout_ms;
        let started = Instant::now();

        let chain = Next {
            middlewares: &middlewares,
            handler: &handler,
        };
        let result = match timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), chain.run(command))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(EngineError::CommandTimeout {
                    command_type: command_type.clone(),
                    timeout_ms: ms,
                }),
            },
            None => chain.run(command).await,
        };

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        {
            let mut stats = self.statistics.lock().await;
            stats.record(&command_type, result.is_ok(), duration_ms);
        }

        match &result {
            Ok(_) => debug!(command_type = %command_type, duration_ms, "command dispatched"),
            Err(err) => debug!(
                command_type = %command_type,
                duration_ms,
                error_code = err.code(),
                "command failed"
            ),
        }

        result
    }

    pub async fn statistics(&self) -> CommandBusStatistics {
        self.statistics.lock().await.clone()
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}
