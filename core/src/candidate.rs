//! Mining outputs: candidate chains and their persistence.
//!
//! Candidates are immutable after save; the orchestration layer deletes
//! them once consumed or rejected.

use crate::event::EventId;
use crate::mining::MiningConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CandidateError {
    #[error("duplicate candidate: {0}")]
    Duplicate(Uuid),

    #[error("candidate store error: {0}")]
    Io(String),
}

pub type CandidateResult<T> = std::result::Result<T, CandidateError>;

/// An ordered tool sequence observed across sessions, with the statistics
/// that justify proposing it as a composite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateChain {
    pub id: Uuid,

    /// At least two tool identifiers, in order.
    pub tools: Vec<String>,

    /// Fraction of sessions containing the chain as a subsequence, in [0,1].
    pub support: f64,

    /// Mean transition probability across consecutive links, in [0,1].
    pub confidence: f64,

    pub avg_latency_ms: f64,

    /// Fraction of containing sessions whose final chain step failed.
    pub failure_rate: f64,

    /// Up to ten anchor events for provenance, most recent sessions first.
    pub sample_event_ids: Vec<EventId>,

    pub discovered_at: DateTime<Utc>,

    /// The mining parameters that produced this candidate.
    pub mining_config: MiningConfig,
}

impl CandidateChain {
    /// Chains compare equal on their semantic tuple regardless of id.
    pub fn signature(&self) -> (Vec<String>, u64, u64) {
        (
            self.tools.clone(),
            (self.support * 1e9) as u64,
            (self.confidence * 1e9) as u64,
        )
    }
}

/// Persistence of mining outputs.
#[async_trait]
pub trait CandidateStore: Send + Sync {
    /// Save a new candidate. Fails with [`CandidateError::Duplicate`] when
    /// the identifier already exists; saved candidates are never updated.
    async fn save(&self, chain: CandidateChain) -> CandidateResult<()>;

    async fn get(&self, id: Uuid) -> CandidateResult<Option<CandidateChain>>;

    /// All candidates ranked by support descending.
    async fn list(&self) -> CandidateResult<Vec<CandidateChain>>;

    async fn delete(&self, id: Uuid) -> CandidateResult<bool>;
}

pub struct MemoryCandidateStore {
    chains: DashMap<Uuid, CandidateChain>,
}

impl MemoryCandidateStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            chains: DashMap::new(),
        })
    }
}

#[async_trait]
impl CandidateStore for MemoryCandidateStore {
    async fn save(&self, chain: CandidateChain) -> CandidateResult<()> {
        if self.chains.contains_key(&chain.id) {
            return Err(CandidateError::Duplicate(chain.id));
        }
        self.chains.insert(chain.id, chain);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> CandidateResult<Option<CandidateChain>> {
        Ok(self.chains.get(&id).map(|c| c.clone()))
    }

    async fn list(&self) -> CandidateResult<Vec<CandidateChain>> {
        let mut chains: Vec<CandidateChain> =
            self.chains.iter().map(|c| c.clone()).collect();
        chains.sort_by(|a, b| {
            b.support
                .partial_cmp(&a.support)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.tools.cmp(&b.tools))
        });
        Ok(chains)
    }

    async fn delete(&self, id: Uuid) -> CandidateResult<bool> {
        Ok(self.chains.remove(&id).is_some())
    }
}

/// Sqlite-backed candidate store; shares the event store's pool.
pub struct SqliteCandidateStore {
    pool: SqlitePool,
}

impl SqliteCandidateStore {
    pub async fn new(pool: SqlitePool) -> CandidateResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candidates (
                id               TEXT PRIMARY KEY,
                tools            TEXT NOT NULL,
                support          REAL NOT NULL,
                confidence       REAL NOT NULL,
                avg_latency_ms   REAL NOT NULL,
                failure_rate     REAL NOT NULL,
                sample_event_ids TEXT NOT NULL,
                discovered_at    TEXT NOT NULL,
                mining_config    TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| CandidateError::Io(e.to_string()))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl CandidateStore for SqliteCandidateStore {
    async fn save(&self, chain: CandidateChain) -> CandidateResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO candidates (
                id, tools, support, confidence, avg_latency_ms,
                failure_rate, sample_event_ids, discovered_at, mining_config
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(chain.id.to_string())
        .bind(serde_json::to_string(&chain.tools).map_err(io_err)?)
        .bind(chain.support)
        .bind(chain.confidence)
        .bind(chain.avg_latency_ms)
        .bind(chain.failure_rate)
        .bind(serde_json::to_string(&chain.sample_event_ids).map_err(io_err)?)
        .bind(chain.discovered_at.to_rfc3339())
        .bind(serde_json::to_string(&chain.mining_config).map_err(io_err)?)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_database_error()
                    .map_or(false, |db| db.is_unique_violation()) =>
            {
                Err(CandidateError::Duplicate(chain.id))
            }
            Err(e) => Err(CandidateError::Io(e.to_string())),
        }
    }

    async fn get(&self, id: Uuid) -> CandidateResult<Option<CandidateChain>> {
        let row = sqlx::query("SELECT * FROM candidates WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CandidateError::Io(e.to_string()))?;
        row.map(|r| row_to_chain(&r)).transpose()
    }

    async fn list(&self) -> CandidateResult<Vec<CandidateChain>> {
        let rows = sqlx::query("SELECT * FROM candidates ORDER BY support DESC, tools ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CandidateError::Io(e.to_string()))?;
        rows.iter().map(row_to_chain).collect()
    }

    async fn delete(&self, id: Uuid) -> CandidateResult<bool> {
        let result = sqlx::query("DELETE FROM candidates WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| CandidateError::Io(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }
}

fn io_err(e: serde_json::Error) -> CandidateError {
    CandidateError::Io(e.to_string())
}

fn row_to_chain(row: &sqlx::sqlite::SqliteRow) -> CandidateResult<CandidateChain> {
    let id_raw: String = row.get("id");
    let tools_raw: String = row.get("tools");
    let samples_raw: String = row.get("sample_event_ids");
    let config_raw: String = row.get("mining_config");
    let discovered_raw: String = row.get("discovered_at");
    Ok(CandidateChain {
        id: id_raw
            .parse()
            .map_err(|e| CandidateError::Io(format!("bad candidate id: {e}")))?,
        tools: serde_json::from_str(&tools_raw).map_err(io_err)?,
        support: row.get("support"),
        confidence: row.get("confidence"),
        avg_latency_ms: row.get("avg_latency_ms"),
        failure_rate: row.get("failure_rate"),
        sample_event_ids: serde_json::from_str(&samples_raw).map_err(io_err)?,
        discovered_at: DateTime::parse_from_rfc3339(&discovered_raw)
            .map_err(|e| CandidateError::Io(format!("bad discovered_at: {e}")))?
            .with_timezone(&Utc),
        mining_config: serde_json::from_str(&config_raw).map_err(io_err)?,
    })
}
