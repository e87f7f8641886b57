//! In-memory event store.
//!
//! DashMap-indexed, suitable for embedded deployments and tests. Semantics
//! match the sqlite store exactly, including duplicate rejection and atomic
//! batch append.

use super::{
    reconstruct_chain_order, CountFilters, EventStore, SessionOrder, StorageError, StorageResult,
};
use crate::event::{Event, EventId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

pub struct MemoryEventStore {
    /// Main storage: event id -> event.
    events: DashMap<EventId, Event>,

    /// Index by session id for fast session scans.
    session_index: DashMap<String, Vec<EventId>>,

    /// Index by tool id for windowed tool scans.
    tool_index: DashMap<String, Vec<EventId>>,
}

impl MemoryEventStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: DashMap::new(),
            session_index: DashMap::new(),
            tool_index: DashMap::new(),
        })
    }

    fn insert_unchecked(&self, event: Event) {
        self.session_index
            .entry(event.session_id.clone())
            .or_default()
            .push(event.id);
        self.tool_index
            .entry(event.tool_id.clone())
            .or_default()
            .push(event.id);
        self.events.insert(event.id, event);
    }

    fn session_events(&self, session_id: &str) -> Vec<Event> {
        let Some(ids) = self.session_index.get(session_id) else {
            return Vec::new();
        };
        let mut events: Vec<Event> = ids
            .iter()
            .filter_map(|id| self.events.get(id).map(|e| e.clone()))
            .collect();
        events.sort_by_key(|e| e.timestamp);
        events
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: Event) -> StorageResult<()> {
        if self.events.contains_key(&event.id) {
            return Err(StorageError::DuplicateEvent(event.id));
        }
        trace!(target: "muninn", event = %event.id, session = %event.session_id, "append");
        self.insert_unchecked(event);
        Ok(())
    }

    async fn append_batch(&self, events: Vec<Event>) -> StorageResult<()> {
        // All-or-nothing: check every id before touching the indexes.
        for event in &events {
            if self.events.contains_key(&event.id) {
                return Err(StorageError::DuplicateEvent(event.id));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for event in &events {
            if !seen.insert(event.id) {
                return Err(StorageError::DuplicateEvent(event.id));
            }
        }
        for event in events {
            self.insert_unchecked(event);
        }
        Ok(())
    }

    async fn update_successor(
        &self,
        predecessor: EventId,
        successor: EventId,
    ) -> StorageResult<()> {
        match self.events.get_mut(&predecessor) {
            Some(mut event) => {
                event.successor = Some(successor);
                Ok(())
            }
            None => Err(StorageError::Io(format!(
                "successor backfill target not found: {predecessor}"
            ))),
        }
    }

    async fn get_by_id(&self, id: EventId) -> StorageResult<Option<Event>> {
        Ok(self.events.get(&id).map(|e| e.clone()))
    }

    async fn get_by_session(
        &self,
        session_id: &str,
        order: SessionOrder,
    ) -> StorageResult<Vec<Event>> {
        let events = self.session_events(session_id);
        Ok(match order {
            SessionOrder::Timestamp => events,
            SessionOrder::Chain => reconstruct_chain_order(events),
        })
    }

    async fn get_by_tool(
        &self,
        tool_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<Event>> {
        let Some(ids) = self.tool_index.get(tool_id) else {
            return Ok(Vec::new());
        };
        let mut events: Vec<Event> = ids
            .iter()
            .filter_map(|id| self.events.get(id).map(|e| e.clone()))
            .filter(|e| e.timestamp >= since && e.timestamp <= until)
            .collect();
        events.sort_by_key(|e| e.timestamp);
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn get_sessions(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        min_event_count: usize,
    ) -> StorageResult<Vec<String>> {
        let mut sessions: Vec<String> = self
            .session_index
            .iter()
            .filter_map(|entry| {
                let in_window = entry
                    .value()
                    .iter()
                    .filter_map(|id| self.events.get(id))
                    .filter(|e| e.timestamp >= since && e.timestamp <= until)
                    .count();
                (in_window >= min_event_count).then(|| entry.key().clone())
            })
            .collect();
        sessions.sort();
        Ok(sessions)
    }

    async fn count(&self, filters: &CountFilters) -> StorageResult<u64> {
        let count = self
            .events
            .iter()
            .filter(|e| {
                filters
                    .session_id
                    .as_ref()
                    .map_or(true, |s| &e.session_id == s)
                    && filters.tool_id.as_ref().map_or(true, |t| &e.tool_id == t)
                    && filters.since.map_or(true, |s| e.timestamp >= s)
                    && filters.until.map_or(true, |u| e.timestamp <= u)
                    && filters.outcome.map_or(true, |o| e.outcome == o)
            })
            .count();
        Ok(count as u64)
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> StorageResult<u64> {
        let doomed: Vec<EventId> = self
            .events
            .iter()
            .filter(|e| e.timestamp < older_than)
            .map(|e| e.id)
            .collect();
        for id in &doomed {
            if let Some((_, event)) = self.events.remove(id) {
                if let Some(mut ids) = self.session_index.get_mut(&event.session_id) {
                    ids.retain(|i| i != id);
                }
                if let Some(mut ids) = self.tool_index.get_mut(&event.tool_id) {
                    ids.retain(|i| i != id);
                }
            }
        }
        Ok(doomed.len() as u64)
    }

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}
