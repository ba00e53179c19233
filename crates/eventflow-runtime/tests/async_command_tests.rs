// Async command lifecycle: status transitions, results, cancellation.

mod common;

use async_trait::async_trait;
use eventflow_core::EngineResult;
use eventflow_runtime::{
    AsyncCommandBus, AsyncCommandState, AsyncStatusRepository, Command, CommandBus,
    CommandEnvelope, CommandHandler, InMemoryAsyncStatusRepository, InMemoryJobQueue, JobHandler,
    JobQueue, JobQueueConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Serialize, Deserialize)]
struct SendInvoice {
    invoice_id: String,
}

impl Command for SendInvoice {
    fn command_type() -> &'static str {
        "invoice.send"
    }
}

struct SendInvoiceHandler;

#[async_trait]
impl CommandHandler for SendInvoiceHandler {
    fn command_type(&self) -> &str {
        "invoice.send"
    }

    async fn handle(&self, command: CommandEnvelope) -> EngineResult<Value> {
        let send: SendInvoice = command.decode()?;
        Ok(json!({"sent": send.invoice_id}))
    }
}

/// Occupies the queue's worker until released, so queued commands stay
/// PENDING deterministically.
struct BlockingHandler {
    release: Arc<Notify>,
}

#[async_trait]
impl JobHandler for BlockingHandler {
    fn job_type(&self) -> &str {
        "test.blocker"
    }

    async fn execute(&self, _job: &eventflow_runtime::Job) -> EngineResult<()> {
        self.release.notified().await;
        Ok(())
    }
}

async fn queued_bus() -> (AsyncCommandBus, Arc<InMemoryJobQueue>, Arc<Notify>) {
    let bus = Arc::new(CommandBus::new());
    bus.register_handler(Arc::new(SendInvoiceHandler)).await;
    let statuses: Arc<dyn AsyncStatusRepository> =
        Arc::new(InMemoryAsyncStatusRepository::new(Duration::from_secs(60)));
    let queue = InMemoryJobQueue::start(JobQueueConfig::default());

    let release = Arc::new(Notify::new());
    queue
        .register_handler(Arc::new(BlockingHandler {
            release: Arc::clone(&release),
        }))
        .await;

    let async_bus = AsyncCommandBus::queued(bus, statuses, Arc::clone(&queue)).await;
    (async_bus, queue, release)
}

#[tokio::test]
async fn test_queued_command_walks_pending_processing_completed() {
    let (async_bus, queue, release) = queued_bus().await;

    // Park the worker behind a blocker job
    queue.submit("test.blocker", json!({})).await.unwrap();

    let envelope = SendInvoice {
        invoice_id: "INV-1".to_string(),
    }
    .envelope()
    .unwrap();
    let async_id = async_bus.dispatch_async(envelope).await.unwrap();

    // Still queued behind the blocker
    let status = async_bus.status(async_id).await.unwrap().unwrap();
    assert_eq!(status.state, AsyncCommandState::Pending);
    assert!(status.result.is_none());

    release.notify_one();
    queue.drain().await;

    let status = async_bus.status(async_id).await.unwrap().unwrap();
    assert_eq!(status.state, AsyncCommandState::Completed);
    assert_eq!(
        async_bus.result(async_id).await.unwrap().unwrap(),
        json!({"sent": "INV-1"})
    );

    // Cancelling after completion returns false
    assert!(!async_bus.cancel(async_id).await.unwrap());
}

#[tokio::test]
async fn test_pending_commands_cancel_and_are_skipped_by_the_worker() {
    let (async_bus, queue, release) = queued_bus().await;

    queue.submit("test.blocker", json!({})).await.unwrap();
    let envelope = SendInvoice {
        invoice_id: "INV-2".to_string(),
    }
    .envelope()
    .unwrap();
    let async_id = async_bus.dispatch_async(envelope).await.unwrap();

    assert!(async_bus.cancel(async_id).await.unwrap());
    let status = async_bus.status(async_id).await.unwrap().unwrap();
    assert_eq!(status.state, AsyncCommandState::Cancelled);

    release.notify_one();
    queue.drain().await;

    // The worker saw the cancellation and never executed the command
    let status = async_bus.status(async_id).await.unwrap().unwrap();
    assert_eq!(status.state, AsyncCommandState::Cancelled);
    assert!(status.result.is_none());
}

#[tokio::test]
async fn test_unknown_async_ids_have_no_status() {
    let (async_bus, _, _) = queued_bus().await;
    assert!(async_bus.status(uuid::Uuid::new_v4()).await.unwrap().is_none());
}
