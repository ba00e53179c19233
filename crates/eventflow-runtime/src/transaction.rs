//! Transactional scopes, post-commit hooks, and distributed coordination.
//!
//! [`TransactionManager::execute_in_transaction`] wraps a closure in a
//! logical transaction scope with isolation options, a timeout, and deadlock
//! retry. Components running inside the scope register
//! [`after_commit`](TransactionManager::after_commit) /
//! [`after_rollback`](TransactionManager::after_rollback) hooks that fire
//! exactly once when the scope exits. Storage backends bind their native
//! transactions to the scope; the in-memory backends treat it as a logical
//! boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};
use uuid::Uuid;

use eventflow_core::{EngineError, EngineResult, TransientKind};

/// Transaction isolation level, honored by backends that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionOptions {
    pub isolation: IsolationLevel,
    pub timeout_ms: Option<u64>,
    pub read_only: bool,
    /// Deadlock retries before surfacing the error
    pub deadlock_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::default(),
            timeout_ms: None,
            read_only: false,
            deadlock_retries: 3,
            retry_base_delay_ms: 10,
        }
    }
}

/// A hook fired when the owning scope exits.
pub type TransactionHook = Box<dyn FnOnce() -> BoxFuture<'static, EngineResult<()>> + Send>;

/// Build a [`TransactionHook`] from an async closure.
pub fn hook<F, Fut>(f: F) -> TransactionHook
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = EngineResult<()>> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}

struct ScopeInner {
    options: TransactionOptions,
    commit_hooks: Mutex<Vec<TransactionHook>>,
    rollback_hooks: Mutex<Vec<TransactionHook>>,
}

impl ScopeInner {
    fn new(options: TransactionOptions) -> Self {
        Self {
            options,
            commit_hooks: Mutex::new(Vec::new()),
            rollback_hooks: Mutex::new(Vec::new()),
        }
    }

    fn push_commit(&self, hook: TransactionHook) {
        if let Ok(mut hooks) = self.commit_hooks.lock() {
            hooks.push(hook);
        }
    }

    fn push_rollback(&self, hook: TransactionHook) {
        if let Ok(mut hooks) = self.rollback_hooks.lock() {
            hooks.push(hook);
        }
    }

    fn drain(hooks: &Mutex<Vec<TransactionHook>>) -> Vec<TransactionHook> {
        hooks.lock().map(|mut h| h.drain(..).collect()).unwrap_or_default()
    }
}

tokio::task_local! {
    static CURRENT_SCOPE: Arc<ScopeInner>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionStatistics {
    pub started: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub deadlock_retries: u64,
    pub hook_failures: u64,
}

/// Scoped transactional execution with hooks and deadlock retry.
pub struct TransactionManager {
    defaults: TransactionOptions,
    started: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    deadlock_retries: AtomicU64,
    hook_failures: AtomicU64,
}

impl TransactionManager {
    pub fn new(defaults: TransactionOptions) -> Self {
        Self {
            defaults,
            started: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            rolled_back: AtomicU64::new(0),
            deadlock_retries: AtomicU64::new(0),
            hook_failures: AtomicU64::new(0),
        }
    }

    pub fn defaults(&self) -> &TransactionOptions {
        &self.defaults
    }

    /// Whether the current task is inside a transaction scope.
    pub fn in_transaction() -> bool {
        CURRENT_SCOPE.try_with(|_| ()).is_ok()
    }

    /// Register a hook fired once after the current scope commits.
    /// Fails when no scope is active.
    pub fn after_commit(h: TransactionHook) -> EngineResult<()> {
        CURRENT_SCOPE
            .try_with(|scope| scope.push_commit(h))
            .map_err(|_| EngineError::Configuration {
                message: "after_commit called outside a transaction scope".to_string(),
            })
    }

    /// Register a hook fired once after the current scope rolls back.
    pub fn after_rollback(h: TransactionHook) -> EngineResult<()> {
        CURRENT_SCOPE
            .try_with(|scope| scope.push_rollback(h))
            .map_err(|_| EngineError::Configuration {
                message: "after_rollback called outside a transaction scope".to_string(),
            })
    }

    /// Execute `f` in a transaction scope with the manager's defaults.
    pub async fn execute<T, F, Fut>(&self, f: F) -> EngineResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        self.execute_in_transaction(self.defaults.clone(), f).await
    }

    /// Execute `f` in a transaction scope.
    ///
    /// Deadlocks are retried with exponential backoff and jitter up to
    /// `options.deadlock_retries`. The closure runs once per attempt; hooks
    /// registered by an attempt fire when that attempt's scope exits.
    pub async fn execute_in_transaction<T, F, Fut>(
        &self,
        options: TransactionOptions,
        f: F,
    ) -> EngineResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            self.started.fetch_add(1, Ordering::Relaxed);
            let scope = Arc::new(ScopeInner::new(options.clone()));
            let work = CURRENT_SCOPE.scope(Arc::clone(&scope), f());

            let result = match options.timeout_ms {
                Some(timeout_ms) => {
                    match tokio::time::timeout(Duration::from_millis(timeout_ms), work).await {
                        Ok(result) => result,
                        Err(_) => Err(EngineError::transient(
                            TransientKind::LockTimeout,
                            "transaction",
                            format!("transaction timed out after {}ms", timeout_ms),
                        )),
                    }
                }
                None => work.await,
            };

            match result {
                Ok(value) => {
                    self.committed.fetch_add(1, Ordering::Relaxed);
                    self.fire_hooks(ScopeInner::drain(&scope.commit_hooks), "after_commit")
                        .await;
                    return Ok(value);
                }
                Err(err) => {
                    self.rolled_back.fetch_add(1, Ordering::Relaxed);
                    self.fire_hooks(ScopeInner::drain(&scope.rollback_hooks), "after_rollback")
                        .await;

                    if err.is_deadlock() && attempt < options.deadlock_retries {
                        attempt += 1;
                        self.deadlock_retries.fetch_add(1, Ordering::Relaxed);
                        let delay = Self::backoff_delay(options.retry_base_delay_ms, attempt);
                        warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "deadlock detected, retrying transaction"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
        let exponential = base_ms.saturating_mul(1u64 << attempt.min(10));
        let jitter = rand::thread_rng().gen_range(0..=exponential / 2 + 1);
        Duration::from_millis(exponential + jitter)
    }

    async fn fire_hooks(&self, hooks: Vec<TransactionHook>, kind: &str) {
        for h in hooks {
            if let Err(err) = h().await {
                self.hook_failures.fetch_add(1, Ordering::Relaxed);
                warn!(hook = kind, error = %err, error_code = err.code(), "transaction hook failed");
            }
        }
    }

    pub fn statistics(&self) -> TransactionStatistics {
        TransactionStatistics {
            started: self.started.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            deadlock_retries: self.deadlock_retries.load(Ordering::Relaxed),
            hook_failures: self.hook_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(TransactionOptions::default())
    }
}

/// State of a distributed transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributedTransactionState {
    Active,
    Preparing,
    Committed,
    RolledBack,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedTransactionRecord {
    pub transaction_id: Uuid,
    pub state: DistributedTransactionState,
    pub participants: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Persistence for distributed transaction state, so coordination survives
/// process restarts. Records expire after a bounded TTL.
#[async_trait]
pub trait TransactionStateStore: Send + Sync {
    async fn save(&self, record: &DistributedTransactionRecord) -> EngineResult<()>;

    async fn load(&self, transaction_id: Uuid) -> EngineResult<Option<DistributedTransactionRecord>>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> EngineResult<usize>;
}

/// In-memory distributed transaction state store.
pub struct InMemoryTransactionStateStore {
    records: RwLock<HashMap<Uuid, DistributedTransactionRecord>>,
}

impl InMemoryTransactionStateStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryTransactionStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionStateStore for InMemoryTransactionStateStore {
    async fn save(&self, record: &DistributedTransactionRecord) -> EngineResult<()> {
        let mut records = self.records.write().await;
        records.insert(record.transaction_id, record.clone());
        Ok(())
    }

    async fn load(
        &self,
        transaction_id: Uuid,
    ) -> EngineResult<Option<DistributedTransactionRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&transaction_id).cloned())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| r.expires_at > now);
        Ok(before - records.len())
    }
}

/// A resource taking part in a two-phase commit.
#[async_trait]
pub trait TransactionParticipant: Send + Sync {
    fn name(&self) -> &str;

    async fn prepare(&self, transaction_id: Uuid) -> EngineResult<()>;

    async fn commit(&self, transaction_id: Uuid) -> EngineResult<()>;

    async fn rollback(&self, transaction_id: Uuid) -> EngineResult<()>;
}

/// Two-phase distributed transaction coordinator: prepare all participants,
/// then commit all; any prepare or commit failure rolls everything back.
pub struct DistributedTransactionCoordinator {
    participants: RwLock<Vec<Arc<dyn TransactionParticipant>>>,
    store: Arc<dyn TransactionStateStore>,
    ttl: Duration,
}

impl DistributedTransactionCoordinator {
    pub fn new(store: Arc<dyn TransactionStateStore>, ttl: Duration) -> Self {
        Self {
            participants: RwLock::new(Vec::new()),
            store,
            ttl,
        }
    }

    pub async fn register_participant(&self, participant: Arc<dyn TransactionParticipant>) {
        let mut participants = self.participants.write().await;
        participants.push(participant);
    }

    pub async fn begin(&self) -> EngineResult<Uuid> {
        let transaction_id = Uuid::new_v4();
        let now = Utc::now();
        let participants = self.participants.read().await;
        let record = DistributedTransactionRecord {
            transaction_id,
            state: DistributedTransactionState::Active,
            participants: participants.iter().map(|p| p.name().to_string()).collect(),
            started_at: now,
            updated_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::hours(1)),
        };
        drop(participants);
        self.store.save(&record).await?;
        debug!(transaction_id = %transaction_id, "distributed transaction started");
        Ok(transaction_id)
    }

    pub async fn commit(&self, transaction_id: Uuid) -> EngineResult<()> {
        let mut record = self.expect_active(transaction_id).await?;
        record.state = DistributedTransactionState::Preparing;
        record.updated_at = Utc::now();
        self.store.save(&record).await?;

        let participants = self.participants.read().await.clone();

        // Phase one: prepare everyone
        for participant in &participants {
            if let Err(err) = participant.prepare(transaction_id).await {
                error!(
                    transaction_id = %transaction_id,
                    participant = participant.name(),
                    error = %err,
                    "prepare failed, rolling back"
                );
                self.rollback_participants(&participants, transaction_id).await;
                self.finish(record, DistributedTransactionState::RolledBack)
                    .await?;
                return Err(err);
            }
        }

        // Phase two: commit everyone
        for participant in &participants {
            if let Err(err) = participant.commit(transaction_id).await {
                error!(
                    transaction_id = %transaction_id,
                    participant = participant.name(),
                    error = %err,
                    "commit failed after successful prepare, rolling back"
                );
                self.rollback_participants(&participants, transaction_id).await;
                self.finish(record, DistributedTransactionState::Failed)
                    .await?;
                return Err(err);
            }
        }

        self.finish(record, DistributedTransactionState::Committed)
            .await
    }

    pub async fn rollback(&self, transaction_id: Uuid) -> EngineResult<()> {
        let record = self.expect_active(transaction_id).await?;
        let participants = self.participants.read().await.clone();
        self.rollback_participants(&participants, transaction_id).await;
        self.finish(record, DistributedTransactionState::RolledBack)
            .await
    }

    pub async fn state(
        &self,
        transaction_id: Uuid,
    ) -> EngineResult<Option<DistributedTransactionState>> {
        Ok(self.store.load(transaction_id).await?.map(|r| r.state))
    }

    async fn expect_active(&self, transaction_id: Uuid) -> EngineResult<DistributedTransactionRecord> {
        let record = self.store.load(transaction_id).await?.ok_or_else(|| {
            EngineError::Configuration {
                message: format!("unknown distributed transaction {}", transaction_id),
            }
        })?;
        match record.state {
            DistributedTransactionState::Active => Ok(record),
            other => Err(EngineError::Configuration {
                message: format!(
                    "distributed transaction {} is {:?}, not active",
                    transaction_id, other
                ),
            }),
        }
    }

    async fn rollback_participants(
        &self,
        participants: &[Arc<dyn TransactionParticipant>],
        transaction_id: Uuid,
    ) {
        for participant in participants {
            if let Err(err) = participant.rollback(transaction_id).await {
                warn!(
                    transaction_id = %transaction_id,
                    participant = participant.name(),
                    error = %err,
                    "participant rollback failed"
                );
            }
        }
    }

    async fn finish(
        &self,
        mut record: DistributedTransactionRecord,
        state: DistributedTransactionState,
    ) -> EngineResult<()> {
        record.state = state;
        record.updated_at = Utc::now();
        self.store.save(&record).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_commit_hooks_fire_once_on_success() {
        let manager = TransactionManager::default();
        let fired = Arc::new(AtomicU32::new(0));

        let fired_in = Arc::clone(&fired);
        let result: EngineResult<i32> = manager
            .execute(move || {
                let fired = Arc::clone(&fired_in);
                async move {
                    TransactionManager::after_commit(hook(move || {
                        let fired = Arc::clone(&fired);
                        async move {
                            fired.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }))?;
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(manager.statistics().committed, 1);
    }

    #[tokio::test]
    async fn test_rollback_hooks_fire_on_failure_and_commit_hooks_do_not() {
        let manager = TransactionManager::default();
        let committed = Arc::new(AtomicU32::new(0));
        let rolled_back = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&committed);
        let r = Arc::clone(&rolled_back);
        let result: EngineResult<()> = manager
            .execute(move || {
                let c = Arc::clone(&c);
                let r = Arc::clone(&r);
                async move {
                    TransactionManager::after_commit(hook(move || {
                        let c = Arc::clone(&c);
                        async move {
                            c.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }))?;
                    TransactionManager::after_rollback(hook(move || {
                        let r = Arc::clone(&r);
                        async move {
                            r.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }))?;
                    Err(EngineError::storage("test", "boom"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(committed.load(Ordering::SeqCst), 0);
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deadlocks_retry_up_to_limit() {
        let manager = TransactionManager::new(TransactionOptions {
            deadlock_retries: 3,
            retry_base_delay_ms: 1,
            ..Default::default()
        });
        let attempts = Arc::new(AtomicU32::new(0));

        let attempts_in = Arc::clone(&attempts);
        let result: EngineResult<u32> = manager
            .execute(move || {
                let attempts = Arc::clone(&attempts_in);
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(EngineError::transient(
                            TransientKind::Deadlock,
                            "append",
                            "deadlock",
                        ))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(manager.statistics().deadlock_retries, 2);
    }

    #[tokio::test]
    async fn test_timeout_rolls_back() {
        let manager = TransactionManager::default();
        let result: EngineResult<()> = manager
            .execute_in_transaction(
                TransactionOptions {
                    timeout_ms: Some(10),
                    deadlock_retries: 0,
                    ..Default::default()
                },
                || async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(manager.statistics().rolled_back, 1);
    }

    #[tokio::test]
    async fn test_in_transaction_reflects_scope() {
        let manager = TransactionManager::default();
        assert!(!TransactionManager::in_transaction());
        let inside: EngineResult<bool> = manager
            .execute(|| async { Ok(TransactionManager::in_transaction()) })
            .await;
        assert!(inside.unwrap());
    }

    struct FlakyParticipant {
        name: String,
        fail_prepare: bool,
        prepared: AtomicU32,
        committed: AtomicU32,
        rolled_back: AtomicU32,
    }

    impl FlakyParticipant {
        fn new(name: &str, fail_prepare: bool) -> Self {
            Self {
                name: name.to_string(),
                fail_prepare,
                prepared: AtomicU32::new(0),
                committed: AtomicU32::new(0),
                rolled_back: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl TransactionParticipant for FlakyParticipant {
        fn name(&self) -> &str {
            &self.name
        }

        async fn prepare(&self, _transaction_id: Uuid) -> EngineResult<()> {
            if self.fail_prepare {
                return Err(EngineError::storage("prepare", "participant unavailable"));
            }
            self.prepared.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn commit(&self, _transaction_id: Uuid) -> EngineResult<()> {
            self.committed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rollback(&self, _transaction_id: Uuid) -> EngineResult<()> {
            self.rolled_back.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_two_phase_commit_succeeds_with_healthy_participants() {
        let store = Arc::new(InMemoryTransactionStateStore::new());
        let coordinator =
            DistributedTransactionCoordinator::new(store, Duration::from_secs(60));
        let a = Arc::new(FlakyParticipant::new("a", false));
        let b = Arc::new(FlakyParticipant::new("b", false));
        coordinator.register_participant(Arc::clone(&a) as _).await;
        coordinator.register_participant(Arc::clone(&b) as _).await;

        let txn = coordinator.begin().await.unwrap();
        coordinator.commit(txn).await.unwrap();

        assert_eq!(a.committed.load(Ordering::SeqCst), 1);
        assert_eq!(b.committed.load(Ordering::SeqCst), 1);
        assert_eq!(
            coordinator.state(txn).await.unwrap(),
            Some(DistributedTransactionState::Committed)
        );
    }

    #[tokio::test]
    async fn test_prepare_failure_rolls_back_all_participants() {
        let store = Arc::new(InMemoryTransactionStateStore::new());
        let coordinator =
            DistributedTransactionCoordinator::new(store, Duration::from_secs(60));
        let a = Arc::new(FlakyParticipant::new("a", false));
        let b = Arc::new(FlakyParticipant::new("b", true));
        coordinator.register_participant(Arc::clone(&a) as _).await;
        coordinator.register_participant(Arc::clone(&b) as _).await;

        let txn = coordinator.begin().await.unwrap();
        assert!(coordinator.commit(txn).await.is_err());

        assert_eq!(a.committed.load(Ordering::SeqCst), 0);
        assert_eq!(a.rolled_back.load(Ordering::SeqCst), 1);
        assert_eq!(b.rolled_back.load(Ordering::SeqCst), 1);
        assert_eq!(
            coordinator.state(txn).await.unwrap(),
            Some(DistributedTransactionState::RolledBack)
        );
    }

    #[tokio::test]
    async fn test_expired_records_purge() {
        let store = InMemoryTransactionStateStore::new();
        let now = Utc::now();
        store
            .save(&DistributedTransactionRecord {
                transaction_id: Uuid::new_v4(),
                state: DistributedTransactionState::Committed,
                participants: vec![],
                started_at: now,
                updated_at: now,
                expires_at: now - chrono::Duration::seconds(1),
            })
            .await
            .unwrap();
        assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 1);
    }
}
