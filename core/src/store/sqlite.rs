//! Sqlite event store on a bounded `sqlx` pool.

use super::{
    reconstruct_chain_order, CountFilters, EventStore, SessionOrder, StorageError, StorageResult,
};
use crate::event::{Event, EventId, Outcome};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Pool sizing knobs; the defaults match a single-process deployment.
#[derive(Debug, Clone)]
pub struct SqliteStoreOptions {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Periodic connection recycling.
    pub max_lifetime: Duration,
}

impl Default for SqliteStoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
            max_lifetime: Duration::from_secs(30 * 60),
        }
    }
}

pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    /// Open (creating if missing) the database at `path` and run migrations.
    pub async fn open(path: impl AsRef<Path>, options: SqliteStoreOptions) -> StorageResult<Self> {
        let connect = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .max_lifetime(options.max_lifetime)
            .connect_with(connect)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(target: "muninn", path = %path.as_ref().display(), "event store ready");
        Ok(store)
    }

    /// Wrap an existing pool (shared with the registry tables).
    pub async fn with_pool(pool: SqlitePool) -> StorageResult<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                event_id       TEXT PRIMARY KEY,
                session_id     TEXT NOT NULL,
                tool_id        TEXT NOT NULL,
                input_hash     TEXT NOT NULL,
                input_params   TEXT NOT NULL,
                output_summary TEXT,
                predecessor    TEXT REFERENCES events(event_id),
                successor      TEXT REFERENCES events(event_id),
                timestamp      TEXT NOT NULL,
                latency_ms     INTEGER NOT NULL CHECK (latency_ms >= 0),
                outcome        TEXT NOT NULL,
                tags           TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id)",
            "CREATE INDEX IF NOT EXISTS idx_events_tool ON events(tool_id)",
            "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_events_predecessor ON events(predecessor)",
            "CREATE INDEX IF NOT EXISTS idx_events_successor ON events(successor)",
            "CREATE INDEX IF NOT EXISTS idx_events_session_ts ON events(session_id, timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_events_tool_ts ON events(tool_id, timestamp)",
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn insert_event<'e, E>(executor: E, event: &Event) -> StorageResult<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let result = sqlx::query(
            r#"
            INSERT INTO events (
                event_id, session_id, tool_id, input_hash, input_params,
                output_summary, predecessor, successor, timestamp,
                latency_ms, outcome, tags
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id.to_string())
        .bind(&event.session_id)
        .bind(&event.tool_id)
        .bind(&event.input_hash)
        .bind(event.input_params.to_string())
        .bind(&event.output_summary)
        .bind(event.predecessor.map(|id| id.to_string()))
        .bind(event.successor.map(|id| id.to_string()))
        .bind(encode_ts(event.timestamp))
        .bind(event.latency_ms as i64)
        .bind(event.outcome.as_str())
        .bind(serde_json::to_string(&event.tags).unwrap_or_else(|_| "[]".into()))
        .execute(executor)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StorageError::DuplicateEvent(event.id)),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append(&self, event: Event) -> StorageResult<()> {
        Self::insert_event(&self.pool, &event).await
    }

    async fn append_batch(&self, events: Vec<Event>) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        for event in &events {
            // Any duplicate aborts the transaction; nothing is committed.
            Self::insert_event(&mut *tx, event).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_successor(
        &self,
        predecessor: EventId,
        successor: EventId,
    ) -> StorageResult<()> {
        let result = sqlx::query("UPDATE events SET successor = ? WHERE event_id = ?")
            .bind(successor.to_string())
            .bind(predecessor.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::Io(format!(
                "successor backfill target not found: {predecessor}"
            )));
        }
        Ok(())
    }

    async fn get_by_id(&self, id: EventId) -> StorageResult<Option<Event>> {
        let row = sqlx::query("SELECT * FROM events WHERE event_id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_event(&r)).transpose()
    }

    async fn get_by_session(
        &self,
        session_id: &str,
        order: SessionOrder,
    ) -> StorageResult<Vec<Event>> {
        let rows = sqlx::query("SELECT * FROM events WHERE session_id = ? ORDER BY timestamp ASC")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        let events = rows
            .iter()
            .map(row_to_event)
            .collect::<StorageResult<Vec<_>>>()?;
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
        let rows = sqlx::query(
            r#"
            SELECT * FROM events
            WHERE tool_id = ? AND timestamp >= ? AND timestamp <= ?
            ORDER BY timestamp ASC
            LIMIT ?
            "#,
        )
        .bind(tool_id)
        .bind(encode_ts(since))
        .bind(encode_ts(until))
        .bind(limit.map(|l| l as i64).unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn get_sessions(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        min_event_count: usize,
    ) -> StorageResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT session_id FROM events
            WHERE timestamp >= ? AND timestamp <= ?
            GROUP BY session_id
            HAVING COUNT(*) >= ?
            ORDER BY session_id ASC
            "#,
        )
        .bind(encode_ts(since))
        .bind(encode_ts(until))
        .bind(min_event_count as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("session_id")).collect())
    }

    async fn count(&self, filters: &CountFilters) -> StorageResult<u64> {
        let mut clauses: Vec<&str> = Vec::new();
        if filters.session_id.is_some() {
            clauses.push("session_id = ?");
        }
        if filters.tool_id.is_some() {
            clauses.push("tool_id = ?");
        }
        if filters.since.is_some() {
            clauses.push("timestamp >= ?");
        }
        if filters.until.is_some() {
            clauses.push("timestamp <= ?");
        }
        if filters.outcome.is_some() {
            clauses.push("outcome = ?");
        }
        let mut sql = "SELECT COUNT(*) FROM events".to_string();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        let mut q = sqlx::query_scalar::<_, i64>(&sql);
        if let Some(s) = &filters.session_id {
            q = q.bind(s.clone());
        }
        if let Some(t) = &filters.tool_id {
            q = q.bind(t.clone());
        }
        if let Some(since) = filters.since {
            q = q.bind(encode_ts(since));
        }
        if let Some(until) = filters.until {
            q = q.bind(encode_ts(until));
        }
        if let Some(outcome) = filters.outcome {
            q = q.bind(outcome.as_str());
        }
        Ok(q.fetch_one(&self.pool).await? as u64)
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM events WHERE timestamp < ?")
            .bind(encode_ts(older_than))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> StorageResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map_or(false, |db| db.is_unique_violation())
}

/// RFC 3339 UTC with fixed microsecond precision: lexicographic order is
/// chronological order, so the timestamp indexes stay range-scannable.
fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Io(format!("bad timestamp {raw:?}: {e}")))
}

fn row_to_event(row: &SqliteRow) -> StorageResult<Event> {
    let parse_id = |raw: String| {
        raw.parse::<EventId>()
            .map_err(|e| StorageError::Io(format!("bad event id {raw:?}: {e}")))
    };
    let outcome_raw: String = row.get("outcome");
    let outcome = Outcome::parse(&outcome_raw)
        .ok_or_else(|| StorageError::Io(format!("bad outcome {outcome_raw:?}")))?;
    let params_raw: String = row.get("input_params");
    let tags_raw: String = row.get("tags");
    Ok(Event {
        id: parse_id(row.get("event_id"))?,
        session_id: row.get("session_id"),
        tool_id: row.get("tool_id"),
        input_hash: row.get("input_hash"),
        input_params: serde_json::from_str(&params_raw)
            .map_err(|e| StorageError::Io(format!("bad input_params: {e}")))?,
        output_summary: row.get("output_summary"),
        predecessor: row
            .get::<Option<String>, _>("predecessor")
            .map(parse_id)
            .transpose()?,
        successor: row
            .get::<Option<String>, _>("successor")
            .map(parse_id)
            .transpose()?,
        timestamp: decode_ts(&row.get::<String, _>("timestamp"))?,
        latency_ms: row.get::<i64, _>("latency_ms") as u32,
        outcome,
        tags: serde_json::from_str(&tags_raw)
            .map_err(|e| StorageError::Io(format!("bad tags: {e}")))?,
    })
}
