// Aggregate lifecycle: snapshot cadence and optimistic concurrency.

mod common;

use common::{registered_event, user_fixture, User};
use eventflow_core::{AggregateId, AggregateRoot};
use eventflow_runtime::{EventStore, InMemoryEventStore};
use std::sync::Arc;

#[tokio::test]
async fn test_snapshot_cadence_follows_the_simple_threshold() {
    let fixture = user_fixture(10);
    let id = AggregateId::new("U-1");

    // Events 1..=10: registration plus nine renames
    let mut user = User::register(id.clone(), "u1@example.com").unwrap();
    for n in 1..=9 {
        user.rename(format!("name-{}", n)).unwrap();
    }
    fixture.repository.save(&mut user).await.unwrap();

    let snapshot = fixture.snapshot_store.load(&id).await.unwrap().unwrap();
    assert_eq!(snapshot.version, 10);

    // Events 11..=19: below the threshold, no new snapshot
    for n in 10..=18 {
        user.rename(format!("name-{}", n)).unwrap();
    }
    fixture.repository.save(&mut user).await.unwrap();
    let snapshot = fixture.snapshot_store.load(&id).await.unwrap().unwrap();
    assert_eq!(snapshot.version, 10);

    // Event 20 crosses the threshold again
    user.rename("name-19").unwrap();
    fixture.repository.save(&mut user).await.unwrap();
    let snapshot = fixture.snapshot_store.load(&id).await.unwrap().unwrap();
    assert_eq!(snapshot.version, 20);

    // The loaded aggregate equals the incrementally built one
    let loaded = fixture.repository.load(&id).await.unwrap();
    assert_eq!(loaded.version(), 20);
    assert_eq!(loaded.state.email, "u1@example.com");
    assert_eq!(loaded.state.name, "name-19");
}

#[tokio::test]
async fn test_loaded_version_matches_stored_event_count() {
    let fixture = user_fixture(3);
    let id = AggregateId::new("U-counts");

    let mut user = User::register(id.clone(), "c@example.com").unwrap();
    for n in 0..6 {
        user.rename(format!("n{}", n)).unwrap();
    }
    fixture.repository.save(&mut user).await.unwrap();

    let stored = fixture.event_store.load(&id, 1, None).await.unwrap();
    let loaded = fixture.repository.load(&id).await.unwrap();
    assert_eq!(loaded.version(), stored.len() as i64);
    assert_eq!(loaded.version(), fixture.repository.version(&id).await.unwrap());
}

#[tokio::test]
async fn test_concurrent_appends_at_the_same_version_have_one_winner() {
    let store = Arc::new(InMemoryEventStore::new());
    let id = AggregateId::new("U-2");

    // Both workers observed version 5
    for version in 1..=5 {
        store
            .append(&id, &[registered_event(&id, version)], Some(version - 1))
            .await
            .unwrap();
    }

    let store_a = Arc::clone(&store);
    let store_b = Arc::clone(&store);
    let id_a = id.clone();
    let id_b = id.clone();
    let (left, right) = tokio::join!(
        tokio::spawn(async move {
            store_a
                .append(&id_a, &[registered_event(&id_a, 6)], Some(5))
                .await
        }),
        tokio::spawn(async move {
            store_b
                .append(&id_b, &[registered_event(&id_b, 6)], Some(5))
                .await
        }),
    );
    let results = [left.unwrap(), right.unwrap()];

    let successes = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| {
            matches!(r, Err(e) if e.code() == "concurrency_conflict")
        })
        .count();
    assert_eq!(successes, 1);
    assert_eq!(conflicts, 1);

    // Exactly one event landed at version 6, and the winner observed it
    let stream = store.load(&id, 6, Some(6)).await.unwrap();
    assert_eq!(stream.len(), 1);
    assert_eq!(store.aggregate_version(&id).await.unwrap(), 6);
    let winner = results.iter().find_map(|r| r.as_ref().ok()).unwrap();
    assert_eq!(winner.aggregate_version, 6);
}

#[tokio::test]
async fn test_conflicted_saves_can_reload_and_retry() {
    let fixture = user_fixture(100);
    let id = AggregateId::new("U-retry");

    let mut user = User::register(id.clone(), "r@example.com").unwrap();
    fixture.repository.save(&mut user).await.unwrap();

    // Two in-memory copies of the same aggregate
    let mut first = fixture.repository.load(&id).await.unwrap();
    let mut second = fixture.repository.load(&id).await.unwrap();

    first.rename("first").unwrap();
    fixture.repository.save(&mut first).await.unwrap();

    second.rename("second").unwrap();
    let err = fixture.repository.save(&mut second).await.unwrap_err();
    assert_eq!(err.code(), "concurrency_conflict");
    // The loser's buffer is intact for a reload-and-retry
    assert_eq!(second.uncommitted_events().len(), 1);

    let mut fresh = fixture.repository.load(&id).await.unwrap();
    fresh.rename("second").unwrap();
    fixture.repository.save(&mut fresh).await.unwrap();

    let loaded = fixture.repository.load(&id).await.unwrap();
    assert_eq!(loaded.state.name, "second");
    assert_eq!(loaded.version(), 3);
}
