//! Asynchronous command submission with durable status tracking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use eventflow_core::{EngineError, EngineResult};

use super::{CommandBus, CommandEnvelope};
use crate::jobs::{InMemoryJobQueue, Job, JobHandler, JobQueue};

/// Job type carrying queued async commands
pub const ASYNC_COMMAND_JOB_TYPE: &str = "command.async";

/// Lifecycle of an asynchronously submitted command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsyncCommandState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncCommandStatus {
    pub async_id: Uuid,
    pub state: AsyncCommandState,
    pub command_type: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AsyncCommandStatus {
    fn new(async_id: Uuid, command_type: String) -> Self {
        let now = Utc::now();
        Self {
            async_id,
            state: AsyncCommandState::Pending,
            command_type,
            metadata: HashMap::new(),
            result: None,
            error: None,
            submitted_at: now,
            updated_at: now,
        }
    }
}

/// Persistence for async command statuses, bounded by a TTL.
#[async_trait]
pub trait AsyncStatusRepository: Send + Sync {
    async fn create(&self, status: AsyncCommandStatus) -> EngineResult<()>;

    async fn get(&self, async_id: Uuid) -> EngineResult<Option<AsyncCommandStatus>>;

    /// Compare-and-swap state transition. Returns false when the current
    /// state is not in `from`.
    async fn transition(
        &self,
        async_id: Uuid,
        from: &[AsyncCommandState],
        to: AsyncCommandState,
    ) -> EngineResult<bool>;

    async fn set_result(&self, async_id: Uuid, result: Value) -> EngineResult<()>;

    async fn set_error(&self, async_id: Uuid, error: String) -> EngineResult<()>;

    /// Drop statuses past their TTL. Returns how many were removed.
    async fn purge_expired(&self) -> EngineResult<usize>;
}

/// In-memory status repository with TTL-based purging.
pub struct InMemoryAsyncStatusRepository {
    statuses: RwLock<HashMap<Uuid, (AsyncCommandStatus, Instant)>>,
    ttl: Duration,
}

impl InMemoryAsyncStatusRepository {
    pub fn new(ttl: Duration) -> Self {
        Self {
            statuses: RwLock::new(HashMap::new()),
            ttl,
        }
    }
}

#[async_trait]
impl AsyncStatusRepository for InMemoryAsyncStatusRepository {
    async fn create(&self, status: AsyncCommandStatus) -> EngineResult<()> {
        let mut statuses = self.statuses.write().await;
        statuses.insert(status.async_id, (status, Instant::now()));
        Ok(())
    }

    async fn get(&self, async_id: Uuid) -> EngineResult<Option<AsyncCommandStatus>> {
        let statuses = self.statuses.read().await;
        Ok(statuses.get(&async_id).map(|(status, _)| status.clone()))
    }

    async fn transition(
        &self,
        async_id: Uuid,
        from: &[AsyncCommandState],
        to: AsyncCommandState,
    ) -> EngineResult<bool> {
        let mut statuses = self.statuses.write().await;
        match statuses.get_mut(&async_id) {
            Some((status, _)) if from.contains(&status.state) => {
                status.state = to;
                status.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn set_result(&self, async_id: Uuid, result: Value) -> EngineResult<()> {
        let mut statuses = self.statuses.write().await;
        if let Some((status, _)) = statuses.get_mut(&async_id) {
            status.result = Some(result);
            status.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_error(&self, async_id: Uuid, error: String) -> EngineResult<()> {
        let mut statuses = self.statuses.write().await;
        if let Some((status, _)) = statuses.get_mut(&async_id) {
            status.error = Some(error);
            status.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn purge_expired(&self) -> EngineResult<usize> {
        let mut statuses = self.statuses.write().await;
        let before = statuses.len();
        let ttl = self.ttl;
        statuses.retain(|_, entry| entry.1.elapsed() <= ttl);
        Ok(before - statuses.len())
    }
}

/// How `dispatch_async` executes the command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsyncCommandStrategy {
    /// Run inline, recording status transitions; `dispatch_async` returns
    /// after completion
    Sync,
    /// Enqueue a durable job consumed by a worker
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AsyncCommandJobPayload {
    async_id: Uuid,
    envelope: CommandEnvelope,
}

/// Async submission front-end over the command bus.
pub struct AsyncCommandBus {
    bus: Arc<CommandBus>,
    statuses: Arc<dyn AsyncStatusRepository>,
    strategy: AsyncCommandStrategy,
    jobs: Option<Arc<dyn JobQueue>>,
}

impl AsyncCommandBus {
    /// Inline strategy: commands execute on the caller's task.
    pub fn sync(bus: Arc<CommandBus>, statuses: Arc<dyn AsyncStatusRepository>) -> Self {
        Self {
            bus,
            statuses,
            strategy: AsyncCommandStrategy::Sync,
            jobs: None,
        }
    }

    /// Queue strategy: commands run on the job queue's workers. Registers
    /// the async-command job handler on the queue.
    pub async fn queued(
        bus: Arc<CommandBus>,
        statuses: Arc<dyn AsyncStatusRepository>,
        queue: Arc<InMemoryJobQueue>,
    ) -> Self {
        queue
            .register_handler(Arc::new(AsyncCommandJobHandler {
                bus: Arc::clone(&bus),
                statuses: Arc::clone(&statuses),
            }))
            .await;
        Self {
            bus,
            statuses,
            strategy: AsyncCommandStrategy::Queue,
            jobs: Some(queue as Arc<dyn JobQueue>),
        }
    }

    pub fn strategy(&self) -> AsyncCommandStrategy {
        self.strategy
    }

    /// Submit a command for asynchronous execution; returns its async id.
    pub async fn dispatch_async(&self, envelope: CommandEnvelope) -> EngineResult<Uuid> {
        let async_id = Uuid::new_v4();
        self.statuses
            .create(AsyncCommandStatus::new(
                async_id,
                envelope.command_type.clone(),
            ))
            .await?;

        match self.strategy {
            AsyncCommandStrategy::Sync => {
                run_async_command(&self.bus, self.statuses.as_ref(), async_id, envelope).await?;
            }
            AsyncCommandStrategy::Queue => {
                let jobs = self.jobs.as_ref().ok_or_else(|| EngineError::Configuration {
                    message: "queue strategy requires a job queue".to_string(),
                })?;
                let payload = serde_json::to_value(AsyncCommandJobPayload { async_id, envelope })?;
                jobs.submit(ASYNC_COMMAND_JOB_TYPE, payload).await?;
            }
        }

        Ok(async_id)
    }

    pub async fn status(&self, async_id: Uuid) -> EngineResult<Option<AsyncCommandStatus>> {
        self.statuses.get(async_id).await
    }

    pub async fn result(&self, async_id: Uuid) -> EngineResult<Option<Value>> {
        Ok(self.statuses.get(async_id).await?.and_then(|s| s.result))
    }

    /// Best-effort cancellation: only pending commands can be cancelled;
    /// running commands are not interrupted.
    pub async fn cancel(&self, async_id: Uuid) -> EngineResult<bool> {
        let cancelled = self
            .statuses
            .transition(
                async_id,
                &[AsyncCommandState::Pending],
                AsyncCommandState::Cancelled,
            )
            .await?;
        if cancelled {
            debug!(async_id = %async_id, "async command cancelled");
        }
        Ok(cancelled)
    }
}

/// Shared execution path for both strategies.
async fn run_async_command(
    bus: &CommandBus,
    statuses: &dyn AsyncStatusRepository,
    async_id: Uuid,
    envelope: CommandEnvelope,
) -> EngineResult<()> {
    let claimed = statuses
        .transition(
            async_id,
            &[AsyncCommandState::Pending],
            AsyncCommandState::Processing,
        )
        .await?;
    if !claimed {
        // Cancelled (or already claimed by a competing worker): skip.
        debug!(async_id = %async_id, "async command not claimable, skipping");
        return Ok(());
    }

    match bus.dispatch(envelope).await {
        Ok(result) => {
            statuses.set_result(async_id, result).await?;
            statuses
                .transition(
                    async_id,
                    &[AsyncCommandState::Processing],
                    AsyncCommandState::Completed,
                )
                .await?;
            Ok(())
        }
        Err(err) => {
            statuses.set_error(async_id, err.to_string()).await?;
            statuses
                .transition(
                    async_id,
                    &[AsyncCommandState::Processing],
                    AsyncCommandState::Failed,
                )
                .await?;
            warn!(
                async_id = %async_id,
                error = %err,
                error_code = err.code(),
                "async command failed"
            );
            Ok(())
        }
    }
}

struct AsyncCommandJobHandler {
    bus: Arc<CommandBus>,
    statuses: Arc<dyn AsyncStatusRepository>,
}

#[async_trait]
impl JobHandler for AsyncCommandJobHandler {
    fn job_type(&self) -> &str {
        ASYNC_COMMAND_JOB_TYPE
    }

    async fn execute(&self, job: &Job) -> EngineResult<()> {
        let payload: AsyncCommandJobPayload = serde_json::from_value(job.payload.clone())?;
        run_async_command(
            &self.bus,
            self.statuses.as_ref(),
            payload.async_id,
            payload.envelope,
        )
        .await
    }
}
