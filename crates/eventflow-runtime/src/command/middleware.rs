//! Standard command middlewares: validation, authorization, transaction
//! wrapping, retry, and circuit breaking.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use eventflow_core::{EngineError, EngineResult, FieldError};

use super::{CircuitBreaker, CircuitBreakerConfig, CommandEnvelope, CommandMiddleware, Next};
use crate::auth::PolicySet;
use crate::transaction::{TransactionManager, TransactionOptions};

pub const VALIDATION_PRIORITY: i32 = 100;
pub const AUTHORIZATION_PRIORITY: i32 = 90;
pub const TRANSACTION_PRIORITY: i32 = 50;
pub const RETRY_PRIORITY: i32 = 1_000;
pub const CIRCUIT_BREAKER_PRIORITY: i32 = 950;

/// Validates one command type's payload before any side effect.
pub trait CommandValidator: Send + Sync {
    fn command_type(&self) -> &str;

    fn validate(&self, payload: &Value) -> Result<(), Vec<FieldError>>;
}

/// Validator rejecting payloads with missing or empty required fields.
pub struct RequiredFieldsValidator {
    command_type: String,
    required: Vec<String>,
}

impl RequiredFieldsValidator {
    pub fn new(
        command_type: impl Into<String>,
        required: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            command_type: command_type.into(),
            required: required.into_iter().map(Into::into).collect(),
        }
    }
}

impl CommandValidator for RequiredFieldsValidator {
    fn command_type(&self) -> &str {
        &self.command_type
    }

    fn validate(&self, payload: &Value) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();
        for field in &self.required {
            let missing = match payload.get(field) {
                None => true,
                Some(Value::Null) => true,
                Some(Value::String(s)) => s.is_empty(),
                Some(_) => false,
            };
            if missing {
                errors.push(FieldError::new(field.clone(), "is required"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Runs registered validators before the rest of the pipeline.
pub struct ValidationMiddleware {
    validators: RwLock<HashMap<String, Arc<dyn CommandValidator>>>,
}

impl ValidationMiddleware {
    pub fn new() -> Self {
        Self {
            validators: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, validator: Arc<dyn CommandValidator>) {
        let mut validators = self.validators.write().await;
        validators.insert(validator.command_type().to_string(), validator);
    }
}

impl Default for ValidationMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandMiddleware for ValidationMiddleware {
    fn name(&self) -> &str {
        "validation"
    }

    fn priority(&self) -> i32 {
        VALIDATION_PRIORITY
    }

    async fn handle(&self, command: CommandEnvelope, next: Next<'_>) -> EngineResult<Value> {
        let validator = {
            let validators = self.validators.read().await;
            validators.get(&command.command_type).cloned()
        };
        if let Some(validator) = validator {
            if let Err(fields) = validator.validate(&command.payload) {
                debug!(
                    command_type = %command.command_type,
                    field_errors = fields.len(),
                    "command rejected by validation"
                );
                return Err(EngineError::ValidationFailure {
                    message_type: command.command_type.clone(),
                    fields,
                });
            }
        }
        next.run(command).await
    }
}

/// Evaluates the policy set against the command's principal.
pub struct AuthorizationMiddleware {
    policies: PolicySet,
}

impl AuthorizationMiddleware {
    pub fn new(policies: PolicySet) -> Self {
        Self { policies }
    }
}

#[async_trait]
impl CommandMiddleware for AuthorizationMiddleware {
    fn name(&self) -> &str {
        "authorization"
    }

    fn priority(&self) -> i32 {
        AUTHORIZATION_PRIORITY
    }

    async fn handle(&self, command: CommandEnvelope, next: Next<'_>) -> EngineResult<Value> {
        self.policies.authorize(
            &command.command_type,
            command.metadata.principal.as_ref(),
            &command.payload,
        )?;
        next.run(command).await
    }
}

/// Wraps the downstream pipeline in a transaction scope. Commands opt out
/// via `metadata.transactional = false`.
///
/// Deadlock retry is left to the outer retry decorator; re-running only the
/// inner scope would replay the handler without replaying validation and
/// authorization.
pub struct TransactionMiddleware {
    manager: Arc<TransactionManager>,
}

impl TransactionMiddleware {
    pub fn new(manager: Arc<TransactionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl CommandMiddleware for TransactionMiddleware {
    fn name(&self) -> &str {
        "transaction"
    }

    fn priority(&self) -> i32 {
        TRANSACTION_PRIORITY
    }

    fn should_process(&self, command: &CommandEnvelope) -> bool {
        command.metadata.transactional
    }

    async fn handle(&self, command: CommandEnvelope, next: Next<'_>) -> EngineResult<Value> {
        let options = TransactionOptions {
            deadlock_retries: 0,
            ..self.manager.defaults().clone()
        };
        self.manager
            .execute_in_transaction(options, || next.run(command.clone()))
            .await
    }
}

/// Backoff schedule for the retry decorator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Fixed delay between attempts
    Linear { delay_ms: u64 },
    /// Exponential backoff with optional jitter
    Exponential {
        base_ms: u64,
        multiplier: f64,
        max_ms: u64,
        jitter: bool,
    },
}

impl BackoffStrategy {
    /// Delay before the given retry attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Linear { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffStrategy::Exponential {
                base_ms,
                multiplier,
                max_ms,
                jitter,
            } => {
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                let mut delay = ((*base_ms as f64) * factor) as u64;
                delay = delay.min(*max_ms);
                if *jitter {
                    let spread = delay / 2 + 1;
                    delay += rand::thread_rng().gen_range(0..spread);
                }
                Duration::from_millis(delay.min(*max_ms))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential {
                base_ms: 50,
                multiplier: 2.0,
                max_ms: 5_000,
                jitter: true,
            },
        }
    }
}

/// Outer-most decorator re-invoking the downstream pipeline for retryable
/// errors. Non-retryable errors propagate immediately.
pub struct RetryMiddleware {
    policy: RetryPolicy,
}

impl RetryMiddleware {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl Default for RetryMiddleware {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl CommandMiddleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    fn priority(&self) -> i32 {
        RETRY_PRIORITY
    }

    async fn handle(&self, command: CommandEnvelope, next: Next<'_>) -> EngineResult<Value> {
        let mut attempt: u32 = 1;
        loop {
            match next.run(command.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff.delay(attempt);
                    warn!(
                        command_type = %command.command_type,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying command after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Per-command-type circuit breaking. Breakers trip on storage-level
/// failures only; validation, authorization, and concurrency outcomes do not
/// indicate a broken downstream.
pub struct CircuitBreakerMiddleware {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerMiddleware {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    async fn breaker_for(&self, command_type: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(breaker) = breakers.get(command_type) {
                return Arc::clone(breaker);
            }
        }
        let mut breakers = self.breakers.write().await;
        Arc::clone(
            breakers
                .entry(command_type.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone()))),
        )
    }

    fn counts_as_breaker_failure(err: &EngineError) -> bool {
        matches!(
            err,
            EngineError::TransientStorage { .. }
                | EngineError::Storage { .. }
                | EngineError::CommandTimeout { .. }
        )
    }
}

#[async_trait]
impl CommandMiddleware for CircuitBreakerMiddleware {
    fn name(&self) -> &str {
        "circuit_breaker"
    }

    fn priority(&self) -> i32 {
        CIRCUIT_BREAKER_PRIORITY
    }

    async fn handle(&self, command: CommandEnvelope, next: Next<'_>) -> EngineResult<Value> {
        let breaker = self.breaker_for(&command.command_type).await;
        if !breaker.try_acquire() {
            return Err(EngineError::CircuitBreakerOpen {
                scope: command.command_type.clone(),
            });
        }
        match next.run(command).await {
            Ok(value) => {
                breaker.record_success();
                Ok(value)
            }
            Err(err) => {
                if Self::counts_as_breaker_failure(&err) {
                    breaker.record_failure();
                }
                Err(err)
            }
        }
    }
}
