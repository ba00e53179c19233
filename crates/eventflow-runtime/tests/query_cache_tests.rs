// Read path end to end: caching, write-driven invalidation, rebuild.

mod common;

use async_trait::async_trait;
use common::{user_fixture, User, UserFixture};
use eventflow_core::{AggregateId, AggregateRoot, EngineResult};
use eventflow_runtime::{
    CacheTagInvalidator, Command, CommandBus, CommandEnvelope, CommandHandler,
    InMemoryDistributedCache, InMemoryDurableCache, Query, QueryBus, QueryCacheConfig,
    QueryCacheManager, QueryEnvelope, QueryHandler,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
struct GetUserQuery {
    user_id: String,
}

impl Query for GetUserQuery {
    fn query_type() -> &'static str {
        "user.get"
    }

    fn cache_key(&self) -> String {
        format!("user.get:{}", self.user_id)
    }

    fn cache_tags(&self) -> Vec<String> {
        vec![format!("user:{}", self.user_id)]
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UpdateUserCommand {
    user_id: String,
    name: String,
}

impl Command for UpdateUserCommand {
    fn command_type() -> &'static str {
        "user.update"
    }
}

struct GetUserHandler {
    fixture: Arc<UserFixture>,
    executions: Arc<AtomicU32>,
}

#[async_trait]
impl QueryHandler for GetUserHandler {
    fn name(&self) -> &str {
        "user_reader"
    }

    fn query_type(&self) -> &str {
        "user.get"
    }

    async fn handle(&self, query: QueryEnvelope) -> EngineResult<Value> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let get: GetUserQuery = query.decode()?;
        let user = self
            .fixture
            .repository
            .load(&AggregateId::new(get.user_id))
            .await?;
        Ok(json!({"email": user.state.email, "name": user.state.name}))
    }
}

struct UpdateUserHandler {
    fixture: Arc<UserFixture>,
}

#[async_trait]
impl CommandHandler for UpdateUserHandler {
    fn command_type(&self) -> &str {
        "user.update"
    }

    async fn handle(&self, command: CommandEnvelope) -> EngineResult<Value> {
        let update: UpdateUserCommand = command.decode()?;
        let id = AggregateId::new(update.user_id);
        let mut user = self.fixture.repository.load(&id).await?;
        user.rename(update.name)?;
        self.fixture.repository.save(&mut user).await?;
        Ok(json!({"version": user.version()}))
    }
}

struct Harness {
    command_bus: CommandBus,
    query_bus: QueryBus,
    cache: Arc<QueryCacheManager>,
    executions: Arc<AtomicU32>,
}

async fn harness() -> Harness {
    let cache = Arc::new(
        QueryCacheManager::new(QueryCacheConfig::default())
            .with_l2(Arc::new(InMemoryDistributedCache::new()))
            .with_l3(Arc::new(InMemoryDurableCache::new())),
    );

    // The repository invalidates "user:<id>" tags on save, matching the
    // query's declared tags
    let UserFixture {
        event_store,
        snapshot_store,
        repository,
    } = user_fixture(100);
    let fixture = Arc::new(UserFixture {
        event_store,
        snapshot_store,
        repository: repository
            .with_cache_invalidator(Arc::clone(&cache) as Arc<dyn CacheTagInvalidator>),
    });

    let mut seed = User::register(AggregateId::new("U-3"), "u3@example.com").unwrap();
    fixture.repository.save(&mut seed).await.unwrap();

    let executions = Arc::new(AtomicU32::new(0));
    let query_bus = QueryBus::default().with_cache(Arc::clone(&cache));
    query_bus
        .register_handler(Arc::new(GetUserHandler {
            fixture: Arc::clone(&fixture),
            executions: Arc::clone(&executions),
        }))
        .await;

    let command_bus = CommandBus::new();
    command_bus
        .register_handler(Arc::new(UpdateUserHandler {
            fixture: Arc::clone(&fixture),
        }))
        .await;

    Harness {
        command_bus,
        query_bus,
        cache,
        executions,
    }
}

#[tokio::test]
async fn test_update_command_invalidates_and_query_rebuilds_the_cache() {
    let h = harness().await;
    let query = GetUserQuery {
        user_id: "U-3".to_string(),
    };

    // First read executes the handler and fills L1/L2/L3
    let first = h.query_bus.execute_query(&query).await.unwrap();
    assert_eq!(first.get("email").unwrap(), "u3@example.com");
    assert_eq!(h.executions.load(Ordering::SeqCst), 1);

    // Second read is a cache hit
    h.query_bus.execute_query(&query).await.unwrap();
    assert_eq!(h.executions.load(Ordering::SeqCst), 1);
    let stats = h.query_bus.statistics().await;
    assert_eq!(stats.cache_hits, 1);

    // A write through the command bus invalidates the user's tags
    h.command_bus
        .dispatch_command(&UpdateUserCommand {
            user_id: "U-3".to_string(),
            name: "X".to_string(),
        })
        .await
        .unwrap();

    // L1 was cleared synchronously; drain the rate-limited batcher so the
    // lower tiers are cleared too
    while h.cache.pending_invalidations().await > 0 {
        h.cache.flush_invalidations().await.unwrap();
    }

    // The next read misses every tier, executes the handler once, and sees
    // the new name
    let rebuilt = h.query_bus.execute_query(&query).await.unwrap();
    assert_eq!(rebuilt.get("name").unwrap(), "X");
    assert_eq!(h.executions.load(Ordering::SeqCst), 2);

    // And the rebuild is cached again
    h.query_bus.execute_query(&query).await.unwrap();
    assert_eq!(h.executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_force_invalidation_takes_effect_without_the_batcher() {
    let h = harness().await;
    let query = GetUserQuery {
        user_id: "U-3".to_string(),
    };

    h.query_bus.execute_query(&query).await.unwrap();
    h.cache
        .force_invalidate_tags(&["user:U-3".to_string()])
        .await
        .unwrap();

    h.query_bus.execute_query(&query).await.unwrap();
    assert_eq!(h.executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unrelated_tags_keep_their_entries() {
    let h = harness().await;
    let query = GetUserQuery {
        user_id: "U-3".to_string(),
    };
    h.query_bus.execute_query(&query).await.unwrap();

    h.cache
        .force_invalidate_tags(&["user:U-999".to_string()])
        .await
        .unwrap();

    h.query_bus.execute_query(&query).await.unwrap();
    assert_eq!(h.executions.load(Ordering::SeqCst), 1);
}
