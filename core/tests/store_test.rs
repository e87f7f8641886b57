use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use twinraven_core::event::{Event, EventId, Outcome};
use twinraven_core::store::{
    CountFilters, EventStore, MemoryEventStore, SessionOrder, SqliteEventStore,
    SqliteStoreOptions, StorageError,
};

fn event_at(session: &str, tool: &str, offset_ms: i64) -> Event {
    let mut e = Event::new(session, tool, json!({"k": tool}), Outcome::Success);
    // Shift the already-microsecond-truncated creation time so the value
    // survives the store's fixed-precision timestamp encoding.
    e.timestamp = e.timestamp + Duration::milliseconds(offset_ms);
    e
}

async fn sqlite_store(dir: &tempfile::TempDir) -> SqliteEventStore {
    SqliteEventStore::open(dir.path().join("events.db"), SqliteStoreOptions::default())
        .await
        .unwrap()
}

async fn stores() -> (Vec<Arc<dyn EventStore>>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let sqlite = sqlite_store(&dir).await;
    (vec![MemoryEventStore::new(), Arc::new(sqlite)], dir)
}

#[tokio::test]
async fn append_then_get_round_trips() {
    let (stores, _dir) = stores().await;
    for store in stores {
        let event = event_at("s1", "search", 0);
        store.append(event.clone()).await.unwrap();
        let loaded = store.get_by_id(event.id).await.unwrap().unwrap();
        assert_eq!(loaded.session_id, "s1");
        assert_eq!(loaded.tool_id, "search");
        assert_eq!(loaded.input_hash, event.input_hash);
        assert_eq!(loaded.timestamp, event.timestamp);
    }
}

#[tokio::test]
async fn duplicate_append_is_rejected() {
    let (stores, _dir) = stores().await;
    for store in stores {
        let event = event_at("s1", "search", 0);
        store.append(event.clone()).await.unwrap();
        let err = store.append(event.clone()).await.unwrap_err();
        assert!(matches!(err, StorageError::DuplicateEvent(id) if id == event.id));
    }
}

#[tokio::test]
async fn batch_append_is_atomic_on_duplicate() {
    let (stores, _dir) = stores().await;
    for store in stores {
        let existing = event_at("s1", "a", 0);
        store.append(existing.clone()).await.unwrap();

        let fresh = event_at("s1", "b", 10);
        let fresh_id = fresh.id;
        let err = store
            .append_batch(vec![fresh, existing.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateEvent(_)));
        // Nothing from the failed batch landed.
        assert!(store.get_by_id(fresh_id).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn successor_backfill_and_chain_order() {
    let (stores, _dir) = stores().await;
    for store in stores {
        let mut first = event_at("s1", "a", 0);
        let mut second = event_at("s1", "b", 10);
        let third = event_at("s1", "c", 20);
        first.successor = None;
        second.predecessor = Some(first.id);
        let mut third = third;
        third.predecessor = Some(second.id);
        second.successor = Some(third.id);

        store.append(first.clone()).await.unwrap();
        store.append(second.clone()).await.unwrap();
        store.append(third.clone()).await.unwrap();
        store.update_successor(first.id, second.id).await.unwrap();

        let chained = store.get_by_session("s1", SessionOrder::Chain).await.unwrap();
        let ids: Vec<EventId> = chained.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first.id, second.id, third.id]);

        let loaded_first = store.get_by_id(first.id).await.unwrap().unwrap();
        assert_eq!(loaded_first.successor, Some(second.id));
    }
}

#[tokio::test]
async fn chain_order_tolerates_orphan_tail() {
    let (stores, _dir) = stores().await;
    for store in stores {
        let first = event_at("s1", "a", 0);
        // Orphan: predecessor points outside the session (pruned away).
        let mut orphan = event_at("s1", "b", 50);
        orphan.predecessor = Some(EventId::new_v4());

        store.append(first.clone()).await.unwrap();
        store.append(orphan.clone()).await.unwrap();

        let chained = store.get_by_session("s1", SessionOrder::Chain).await.unwrap();
        assert_eq!(chained.len(), 2);
        assert_eq!(chained[0].id, first.id);
        assert_eq!(chained[1].id, orphan.id);
    }
}

#[tokio::test]
async fn backfill_of_missing_event_errors() {
    let (stores, _dir) = stores().await;
    for store in stores {
        let err = store
            .update_successor(EventId::new_v4(), EventId::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
    }
}

#[tokio::test]
async fn tool_scan_respects_window_and_limit() {
    let (stores, _dir) = stores().await;
    for store in stores {
        for i in 0..5 {
            store.append(event_at("s1", "search", i * 100)).await.unwrap();
        }
        store.append(event_at("s1", "other", 0)).await.unwrap();

        let since = Utc::now() - Duration::seconds(60);
        let until = Utc::now() + Duration::seconds(60);
        let all = store.get_by_tool("search", since, until, None).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let limited = store
            .get_by_tool("search", since, until, Some(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }
}

#[tokio::test]
async fn session_listing_filters_by_event_count() {
    let (stores, _dir) = stores().await;
    for store in stores {
        store.append(event_at("solo", "a", 0)).await.unwrap();
        store.append(event_at("pair", "a", 0)).await.unwrap();
        store.append(event_at("pair", "b", 10)).await.unwrap();

        let since = Utc::now() - Duration::seconds(60);
        let until = Utc::now() + Duration::seconds(60);
        let sessions = store.get_sessions(since, until, 2).await.unwrap();
        assert_eq!(sessions, vec!["pair".to_string()]);
    }
}

#[tokio::test]
async fn count_applies_filters() {
    let (stores, _dir) = stores().await;
    for store in stores {
        store.append(event_at("s1", "a", 0)).await.unwrap();
        let mut failing = event_at("s1", "a", 10);
        failing.outcome = Outcome::Failure;
        store.append(failing).await.unwrap();
        store.append(event_at("s2", "b", 0)).await.unwrap();

        let total = store.count(&CountFilters::default()).await.unwrap();
        assert_eq!(total, 3);
        let failures = store
            .count(&CountFilters {
                tool_id: Some("a".into()),
                outcome: Some(Outcome::Failure),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failures, 1);
    }
}

#[tokio::test]
async fn prune_deletes_only_older_events() {
    let (stores, _dir) = stores().await;
    for store in stores {
        let old = event_at("s1", "a", -60_000);
        let fresh = event_at("s1", "b", 0);
        store.append(old.clone()).await.unwrap();
        store.append(fresh.clone()).await.unwrap();

        let deleted = store.prune(Utc::now() - Duration::seconds(30)).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_by_id(old.id).await.unwrap().is_none());
        assert!(store.get_by_id(fresh.id).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn health_check_passes_on_live_store() {
    let (stores, _dir) = stores().await;
    for store in stores {
        store.health_check().await.unwrap();
    }
}
