//! Event persistence contract.
//!
//! The store is append-dominated: events are written once and read by every
//! other component. The single permitted post-append write is the successor
//! backfill. Two implementations ship: a DashMap-indexed in-memory store for
//! embedded and test use, and a sqlite store on a bounded `sqlx` pool.

mod memory;
mod sqlite;

pub use memory::MemoryEventStore;
pub use sqlite::{SqliteEventStore, SqliteStoreOptions};

use crate::event::{Event, EventId, Outcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("duplicate event: {0}")]
    DuplicateEvent(EventId),

    #[error("storage error: {0}")]
    Io(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Orderings available for a session scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrder {
    /// Ascending by event timestamp.
    Timestamp,
    /// Follow predecessor/successor links from the chain head; orphans and
    /// cycle remainders degrade to timestamp order.
    Chain,
}

/// Filters accepted by [`EventStore::count`].
#[derive(Debug, Clone, Default)]
pub struct CountFilters {
    pub session_id: Option<String>,
    pub tool_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub outcome: Option<Outcome>,
}

/// Append-only persistence of telemetry events with indexed session, tool
/// and time access.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a single event. Fails with [`StorageError::DuplicateEvent`]
    /// when the identifier already exists.
    async fn append(&self, event: Event) -> StorageResult<()>;

    /// Append a batch atomically: any duplicate fails the whole batch.
    async fn append_batch(&self, events: Vec<Event>) -> StorageResult<()>;

    /// Backfill the forward link of `predecessor`. The one permitted write
    /// outside append, used solely by the collector.
    async fn update_successor(
        &self,
        predecessor: EventId,
        successor: EventId,
    ) -> StorageResult<()>;

    async fn get_by_id(&self, id: EventId) -> StorageResult<Option<Event>>;

    async fn get_by_session(
        &self,
        session_id: &str,
        order: SessionOrder,
    ) -> StorageResult<Vec<Event>>;

    async fn get_by_tool(
        &self,
        tool_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<Event>>;

    /// Distinct session ids in the window holding at least
    /// `min_event_count` events, sorted for determinism.
    async fn get_sessions(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        min_event_count: usize,
    ) -> StorageResult<Vec<String>>;

    async fn count(&self, filters: &CountFilters) -> StorageResult<u64>;

    /// Delete events older than the cutoff. The only destructive operation;
    /// may break link continuity at the retention boundary, which chain
    /// reconstruction tolerates as an orphan tail.
    async fn prune(&self, older_than: DateTime<Utc>) -> StorageResult<u64>;

    /// Cheap reachability probe (`SELECT 1` or equivalent).
    async fn health_check(&self) -> StorageResult<()>;
}

/// Reorder one session's events by walking successor links from the head.
///
/// The head is the event without a predecessor (earliest timestamp wins if
/// several qualify, e.g. after pruning). Events unreachable from the head
/// are appended at the end sorted by timestamp. A cycle breaks the walk,
/// logs at warning level, and the remainder degrades to timestamp order.
pub(crate) fn reconstruct_chain_order(mut events: Vec<Event>) -> Vec<Event> {
    if events.len() <= 1 {
        return events;
    }
    events.sort_by_key(|e| e.timestamp);

    let by_id: HashMap<EventId, Event> = events.iter().map(|e| (e.id, e.clone())).collect();
    let head = events.iter().find(|e| {
        e.predecessor.is_none() || !by_id.contains_key(&e.predecessor.expect("checked"))
    });

    let Some(head) = head else {
        // Every event points at another in the set: a pure cycle.
        warn!(
            target: "muninn",
            session = %events[0].session_id,
            "chain reconstruction found no head, using timestamp order"
        );
        return events;
    };

    let mut ordered = Vec::with_capacity(events.len());
    let mut visited: HashSet<EventId> = HashSet::new();
    let mut cursor = Some(head.id);
    while let Some(id) = cursor {
        if !visited.insert(id) {
            warn!(
                target: "muninn",
                session = %events[0].session_id,
                event = %id,
                "cycle in successor links, degrading to timestamp order"
            );
            break;
        }
        match by_id.get(&id) {
            Some(event) => {
                cursor = event.successor;
                ordered.push(event.clone());
            }
            None => break,
        }
    }

    // Orphan tail: whatever the walk did not reach, in timestamp order.
    for event in events {
        if !visited.contains(&event.id) {
            ordered.push(event);
        }
    }
    ordered
}
