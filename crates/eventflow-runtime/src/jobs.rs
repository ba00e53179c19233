//! Durable background jobs.
//!
//! The runtime submits work to a host-provided queue with at-least-once
//! semantics. [`JobQueue`] is the submission contract; [`InMemoryJobQueue`]
//! is the bundled single-process implementation with bounded retries and a
//! dead-letter area, used by the write-behind event store, async commands,
//! and the async projection strategy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, warn};
use uuid::Uuid;

use eventflow_core::{EngineError, EngineResult};

/// Retry schedule for failed jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueueConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            backoff_multiplier: 2.0,
            max_delay_ms: 5_000,
        }
    }
}

impl JobQueueConfig {
    /// Delay before the given retry attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = (self.base_delay_ms as f64 * factor) as u64;
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// A unit of durable background work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub job_type: String,
    pub payload: Value,
    pub attempt: u32,
    pub submitted_at: DateTime<Utc>,
}

/// A job that exhausted its retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetteredJob {
    pub job: Job,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

/// Executes jobs of one type
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &str;

    async fn execute(&self, job: &Job) -> EngineResult<()>;
}

/// Submission side of the durable queue contract
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submit a job for at-least-once execution. Returns the job id.
    async fn submit(&self, job_type: &str, payload: Value) -> EngineResult<Uuid>;
}

/// Single-process job queue with bounded retries and dead-lettering.
pub struct InMemoryJobQueue {
    tx: mpsc::UnboundedSender<Job>,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
    dead_letters: Arc<RwLock<Vec<DeadLetteredJob>>>,
    config: JobQueueConfig,
    in_flight: Arc<AtomicUsize>,
    worker: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl InMemoryJobQueue {
    /// Create the queue and start its worker task.
    pub fn start(config: JobQueueConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            tx,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            dead_letters: Arc::new(RwLock::new(Vec::new())),
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
            worker: std::sync::Mutex::new(None),
        });

        let worker = tokio::spawn(Self::run_worker(
            rx,
            queue.tx.clone(),
            Arc::clone(&queue.handlers),
            Arc::clone(&queue.dead_letters),
            queue.config.clone(),
            Arc::clone(&queue.in_flight),
        ));
        if let Ok(mut slot) = queue.worker.lock() {
            *slot = Some(worker);
        }

        queue
    }

    /// Stop the worker task. In-flight retries are abandoned.
    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.worker.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.config
    }

    pub async fn register_handler(&self, handler: Arc<dyn JobHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(handler.job_type().to_string(), handler);
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetteredJob> {
        self.dead_letters.read().await.clone()
    }

    /// Resubmit a dead-lettered job, clearing its retry count.
    pub async fn requeue_dead_letter(&self, job_id: Uuid) -> EngineResult<bool> {
        let mut dead = self.dead_letters.write().await;
        if let Some(index) = dead.iter().position(|d| d.job.job_id == job_id) {
            let mut entry = dead.remove(index);
            entry.job.attempt = 0;
            drop(dead);
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            self.tx.send(entry.job).map_err(|e| {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                EngineError::storage("job_requeue", e.to_string())
            })?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Wait until every submitted job has either completed or dead-lettered.
    pub async fn drain(&self) {
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn run_worker(
        mut rx: mpsc::UnboundedReceiver<Job>,
        tx: mpsc::UnboundedSender<Job>,
        handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
        dead_letters: Arc<RwLock<Vec<DeadLetteredJob>>>,
        config: JobQueueConfig,
        in_flight: Arc<AtomicUsize>,
    ) {
        while let Some(mut job) = rx.recv().await {
            let handler = {
                let handlers = handlers.read().await;
                handlers.get(&job.job_type).cloned()
            };

            let Some(handler) = handler else {
                warn!(job_type = %job.job_type, job_id = %job.job_id, "no handler for job type, dead-lettering");
                let mut dead = dead_letters.write().await;
                dead.push(DeadLetteredJob {
                    job: job.clone(),
                    last_error: format!("no handler registered for '{}'", job.job_type),
                    failed_at: Utc::now(),
                });
                in_flight.fetch_sub(1, Ordering::SeqCst);
                continue;
            };

            job.attempt += 1;
            match handler.execute(&job).await {
                Ok(()) => {
                    debug!(job_type = %job.job_type, job_id = %job.job_id, attempt = job.attempt, "job completed");
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                Err(err) if err.is_retryable() && job.attempt < config.max_attempts => {
                    let delay = config.delay_for_attempt(job.attempt);
                    warn!(
                        job_type = %job.job_type,
                        job_id = %job.job_id,
                        attempt = job.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "job failed, scheduling retry"
                    );
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(job);
                    });
                }
                Err(err) => {
                    error!(
                        job_type = %job.job_type,
                        job_id = %job.job_id,
                        attempt = job.attempt,
                        error = %err,
                        error_code = err.code(),
                        "job failed permanently, dead-lettering"
                    );
                    let mut dead = dead_letters.write().await;
                    dead.push(DeadLetteredJob {
                        job: job.clone(),
                        last_error: err.to_string(),
                        failed_at: Utc::now(),
                    });
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn submit(&self, job_type: &str, payload: Value) -> EngineResult<Uuid> {
        let job = Job {
            job_id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            payload,
            attempt: 0,
            submitted_at: Utc::now(),
        };
        let job_id = job.job_id;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.tx.send(job).map_err(|e| {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            EngineError::storage("job_submit", e.to_string())
        })?;
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventflow_core::TransientKind;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct CountingHandler {
        calls: Arc<AtomicU32>,
        fail_first: u32,
        retryable: bool,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        fn job_type(&self) -> &str {
            "test.count"
        }

        async fn execute(&self, _job: &Job) -> EngineResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                if self.retryable {
                    return Err(EngineError::transient(
                        TransientKind::ConnectionReset,
                        "test",
                        "transient failure",
                    ));
                }
                return Err(EngineError::storage("test", "fatal failure"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_retries_transient_failures_until_success() {
        let queue = InMemoryJobQueue::start(JobQueueConfig {
            base_delay_ms: 1,
            ..Default::default()
        });
        let calls = Arc::new(AtomicU32::new(0));
        queue
            .register_handler(Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
                fail_first: 2,
                retryable: true,
            }))
            .await;

        queue.submit("test.count", json!({})).await.unwrap();
        queue.drain().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(queue.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn test_non_retryable_failures_dead_letter_immediately() {
        let queue = InMemoryJobQueue::start(JobQueueConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        queue
            .register_handler(Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
                fail_first: 10,
                retryable: false,
            }))
            .await;

        queue.submit("test.count", json!({})).await.unwrap();
        queue.drain().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_and_can_requeue() {
        let queue = InMemoryJobQueue::start(JobQueueConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            ..Default::default()
        });
        let calls = Arc::new(AtomicU32::new(0));
        queue
            .register_handler(Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
                fail_first: 2,
                retryable: true,
            }))
            .await;

        queue.submit("test.count", json!({})).await.unwrap();
        queue.drain().await;

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // After requeue the third call succeeds
        assert!(queue.requeue_dead_letter(dead[0].job.job_id).await.unwrap());
        queue.drain().await;
        assert!(queue.dead_letters().await.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
