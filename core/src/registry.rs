//! Versioned registry of synthesized tools.
//!
//! Promoted tools live as immutable on-disk version documents under a
//! per-slug directory, plus a `tool_records` row per slug and a
//! `tool_versions` row per (slug, version). Writes serialize per slug via
//! an advisory lock; reads are lock-free.

use crate::export::write_atomic;
use crate::mining::{Miner, MiningConfig};
use crate::store::{CountFilters, EventStore};
use crate::tool::{SynthesizedTool, ToolStatus, TransitionError};
use crate::validation::ValidationResult;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry error: {0}")]
    Registry(String),

    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("duplicate tool: {0}")]
    Duplicate(String),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

fn db_err(e: sqlx::Error) -> RegistryError {
    RegistryError::Registry(e.to_string())
}

/// Why a tool left the promoted set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetirementReason {
    Manual,
    AutoUnused,
    Drift,
    FailureSpike,
    Superseded,
}

impl RetirementReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetirementReason::Manual => "manual",
            RetirementReason::AutoUnused => "auto_unused",
            RetirementReason::Drift => "drift",
            RetirementReason::FailureSpike => "failure_spike",
            RetirementReason::Superseded => "superseded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolRecord {
    pub slug: String,
    pub current_version: u32,
    pub definition_path: PathBuf,
    pub registered_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub invocation_count: u64,
    pub retirement_reason: Option<String>,
}

impl ToolRecord {
    pub fn status(&self) -> ToolStatus {
        if self.retirement_reason.is_some() {
            ToolStatus::Retired
        } else {
            ToolStatus::Promoted
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolVersion {
    pub slug: String,
    pub version: u32,
    pub validation_passed: bool,
    pub equivalence_score: f64,
    pub created_at: DateTime<Utc>,
    pub superseded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    slug: String,
    current_version: u32,
    registered_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Root of the on-disk layout, `<root>/<slug>/v<N>.json`.
    pub root_dir: PathBuf,
    /// Current/original support ratio below which a tool has drifted.
    pub drift_threshold: f64,
    pub auto_retire_on_drift: bool,
    /// Staleness horizon for the unused scan.
    pub auto_retire_after_days: i64,
    /// Failure rate over the last 7 days that triggers retirement.
    pub failure_spike_threshold: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("generated"),
            drift_threshold: 0.5,
            auto_retire_on_drift: false,
            auto_retire_after_days: 30,
            failure_spike_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriftReport {
    pub slug: String,
    pub original_support: f64,
    pub current_support: f64,
    pub flagged: bool,
    pub retired: bool,
}

pub struct ToolRegistry {
    pool: SqlitePool,
    config: RegistryConfig,
    /// Advisory per-slug write locks.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ToolRegistry {
    pub async fn new(pool: SqlitePool, config: RegistryConfig) -> RegistryResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tool_records (
                slug               TEXT PRIMARY KEY,
                current_version    INTEGER NOT NULL,
                definition_path    TEXT NOT NULL,
                registered_at      TEXT NOT NULL,
                last_used_at       TEXT,
                invocation_count   INTEGER NOT NULL DEFAULT 0,
                retirement_reason  TEXT
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(db_err)?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tool_versions (
                slug               TEXT NOT NULL,
                version            INTEGER NOT NULL,
                validation_passed  INTEGER NOT NULL,
                equivalence_score  REAL NOT NULL,
                created_at         TEXT NOT NULL,
                superseded_at      TEXT,
                PRIMARY KEY (slug, version)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(db_err)?;
        tokio::fs::create_dir_all(&config.root_dir)
            .await
            .map_err(|e| RegistryError::Registry(format!("create root dir: {e}")))?;
        Ok(Self {
            pool,
            config,
            locks: DashMap::new(),
        })
    }

    fn lock_for(&self, slug: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(slug.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn version_path(&self, slug: &str, version: u32) -> PathBuf {
        self.config.root_dir.join(slug).join(format!("v{version}.json"))
    }

    fn metadata_path(&self, slug: &str) -> PathBuf {
        self.config.root_dir.join(slug).join("metadata.json")
    }

    /// Register a freshly validated tool at version 1.
    #[tracing::instrument(skip(self, tool, validation), fields(slug = %tool.slug))]
    pub async fn register(
        &self,
        tool: &SynthesizedTool,
        validation: &ValidationResult,
    ) -> RegistryResult<ToolRecord> {
        let lock = self.lock_for(&tool.slug);
        let _guard = lock.lock().await;

        if self.fetch_record(&tool.slug).await?.is_some() {
            return Err(RegistryError::Duplicate(tool.slug.clone()));
        }

        let path = self.version_path(&tool.slug, tool.version);
        self.write_version_document(tool).await?;
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO tool_records
                (slug, current_version, definition_path, registered_at, invocation_count)
            VALUES (?, ?, ?, ?, 0)
            "#,
        )
        .bind(&tool.slug)
        .bind(tool.version as i64)
        .bind(path.to_string_lossy().to_string())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        self.insert_version_row(tool, validation, now).await?;

        info!(target: "registry", slug = %tool.slug, version = tool.version, "tool registered");
        self.get(&tool.slug).await
    }

    /// Version creation on re-synthesis: dense, monotone, prior version
    /// marked superseded.
    #[tracing::instrument(skip(self, tool, validation), fields(slug = %tool.slug))]
    pub async fn new_version(
        &self,
        tool: &mut SynthesizedTool,
        validation: &ValidationResult,
    ) -> RegistryResult<ToolRecord> {
        let lock = self.lock_for(&tool.slug);
        let _guard = lock.lock().await;

        let record = self
            .fetch_record(&tool.slug)
            .await?
            .ok_or_else(|| RegistryError::NotFound(tool.slug.clone()))?;
        if record.retirement_reason.is_some() {
            return Err(TransitionError {
                from: ToolStatus::Retired,
                to: ToolStatus::Promoted,
            }
            .into());
        }

        let version = record.current_version + 1;
        tool.version = version;
        let path = self.version_path(&tool.slug, version);
        self.write_version_document(tool).await?;
        let now = Utc::now();

        sqlx::query(
            "UPDATE tool_versions SET superseded_at = ? WHERE slug = ? AND superseded_at IS NULL",
        )
        .bind(now.to_rfc3339())
        .bind(&tool.slug)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        self.insert_version_row(tool, validation, now).await?;
        sqlx::query("UPDATE tool_records SET current_version = ?, definition_path = ? WHERE slug = ?")
            .bind(version as i64)
            .bind(path.to_string_lossy().to_string())
            .bind(&tool.slug)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        info!(target: "registry", slug = %tool.slug, version, "new tool version");
        self.get(&tool.slug).await
    }

    async fn insert_version_row(
        &self,
        tool: &SynthesizedTool,
        validation: &ValidationResult,
        created_at: DateTime<Utc>,
    ) -> RegistryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tool_versions
                (slug, version, validation_passed, equivalence_score, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&tool.slug)
        .bind(tool.version as i64)
        .bind(validation.passed)
        .bind(validation.mean_similarity)
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn write_version_document(&self, tool: &SynthesizedTool) -> RegistryResult<()> {
        let dir = self.config.root_dir.join(&tool.slug);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RegistryError::Registry(format!("create tool dir: {e}")))?;
        let doc = serde_json::to_vec_pretty(tool)
            .map_err(|e| RegistryError::Registry(format!("serialize tool: {e}")))?;
        write_atomic(&self.version_path(&tool.slug, tool.version), &doc)
            .await
            .map_err(|e| RegistryError::Registry(e.to_string()))?;
        self.write_metadata(&tool.slug, tool.version).await
    }

    async fn write_metadata(&self, slug: &str, current_version: u32) -> RegistryResult<()> {
        let path = self.metadata_path(slug);
        let registered_at = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Metadata>(&bytes)
                .map(|m| m.registered_at)
                .unwrap_or_else(|_| Utc::now()),
            Err(_) => Utc::now(),
        };
        let metadata = Metadata {
            slug: slug.to_string(),
            current_version,
            registered_at,
            updated_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| RegistryError::Registry(format!("serialize metadata: {e}")))?;
        write_atomic(&path, &bytes)
            .await
            .map_err(|e| RegistryError::Registry(e.to_string()))
    }

    pub async fn get(&self, slug: &str) -> RegistryResult<ToolRecord> {
        self.fetch_record(slug)
            .await?
            .ok_or_else(|| RegistryError::NotFound(slug.to_string()))
    }

    /// Load the current version document for a slug.
    pub async fn load_definition(&self, slug: &str) -> RegistryResult<SynthesizedTool> {
        let record = self.get(slug).await?;
        self.load_version(slug, record.current_version).await
    }

    pub async fn load_version(&self, slug: &str, version: u32) -> RegistryResult<SynthesizedTool> {
        let bytes = tokio::fs::read(self.version_path(slug, version))
            .await
            .map_err(|e| RegistryError::Registry(format!("read definition: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| RegistryError::Registry(format!("parse definition: {e}")))
    }

    pub async fn list(&self, status: Option<ToolStatus>) -> RegistryResult<Vec<ToolRecord>> {
        let rows = sqlx::query("SELECT * FROM tool_records ORDER BY slug ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(row_to_record(row)?);
        }
        if let Some(status) = status {
            records.retain(|r| r.status() == status);
        }
        Ok(records)
    }

    /// Make `version` the current one for the slug.
    pub async fn promote(&self, slug: &str, version: u32) -> RegistryResult<ToolRecord> {
        let lock = self.lock_for(slug);
        let _guard = lock.lock().await;

        let record = self
            .fetch_record(slug)
            .await?
            .ok_or_else(|| RegistryError::NotFound(slug.to_string()))?;
        if record.retirement_reason.is_some() {
            return Err(TransitionError {
                from: ToolStatus::Retired,
                to: ToolStatus::Promoted,
            }
            .into());
        }
        let exists: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM tool_versions WHERE slug = ? AND version = ?")
                .bind(slug)
                .bind(version as i64)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        if exists == 0 {
            return Err(RegistryError::NotFound(format!("{slug} v{version}")));
        }

        let path = self.version_path(slug, version);
        sqlx::query("UPDATE tool_records SET current_version = ?, definition_path = ? WHERE slug = ?")
            .bind(version as i64)
            .bind(path.to_string_lossy().to_string())
            .bind(slug)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        self.write_metadata(slug, version).await?;
        self.get(slug).await
    }

    /// Retirement is terminal.
    #[tracing::instrument(skip(self), fields(slug = %slug, reason = reason.as_str()))]
    pub async fn retire(&self, slug: &str, reason: RetirementReason) -> RegistryResult<ToolRecord> {
        let lock = self.lock_for(slug);
        let _guard = lock.lock().await;

        let record = self
            .fetch_record(slug)
            .await?
            .ok_or_else(|| RegistryError::NotFound(slug.to_string()))?;
        if record.retirement_reason.is_some() {
            return Err(TransitionError {
                from: ToolStatus::Retired,
                to: ToolStatus::Retired,
            }
            .into());
        }

        sqlx::query("UPDATE tool_records SET retirement_reason = ? WHERE slug = ?")
            .bind(reason.as_str())
            .bind(slug)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        // Keep the on-disk document in step; failure here is non-fatal.
        match self.load_version(slug, record.current_version).await {
            Ok(mut tool) => {
                if tool.transition(ToolStatus::Retired).is_ok() {
                    if let Ok(doc) = serde_json::to_vec_pretty(&tool) {
                        let _ = write_atomic(
                            &self.version_path(slug, record.current_version),
                            &doc,
                        )
                        .await;
                    }
                }
            }
            Err(e) => {
                warn!(target: "registry", slug, error = %e, "could not update retired document");
            }
        }

        info!(target: "registry", slug, reason = reason.as_str(), "tool retired");
        self.get(slug).await
    }

    /// Bump the usage counter; last-writer-wins on the timestamp.
    pub async fn record_usage(&self, slug: &str) -> RegistryResult<()> {
        let result = sqlx::query(
            "UPDATE tool_records SET invocation_count = invocation_count + 1, last_used_at = ? \
             WHERE slug = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(slug)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(slug.to_string()));
        }
        Ok(())
    }

    pub async fn version_history(&self, slug: &str) -> RegistryResult<Vec<ToolVersion>> {
        let rows = sqlx::query(
            "SELECT * FROM tool_versions WHERE slug = ? ORDER BY version ASC",
        )
        .bind(slug)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                Ok(ToolVersion {
                    slug: row.get("slug"),
                    version: row.get::<i64, _>("version") as u32,
                    validation_passed: row.get::<i64, _>("validation_passed") != 0,
                    equivalence_score: row.get("equivalence_score"),
                    created_at: parse_ts(&row.get::<String, _>("created_at"))?,
                    superseded_at: row
                        .get::<Option<String>, _>("superseded_at")
                        .map(|s| parse_ts(&s))
                        .transpose()?,
                })
            })
            .collect()
    }

    /// Active tools unused since the cutoff (or never used and older).
    pub async fn stale(&self, unused_since: DateTime<Utc>) -> RegistryResult<Vec<ToolRecord>> {
        let records = self.list(Some(ToolStatus::Promoted)).await?;
        Ok(records
            .into_iter()
            .filter(|r| match r.last_used_at {
                Some(last) => last < unused_since,
                None => r.registered_at < unused_since,
            })
            .collect())
    }

    /// Re-mine each promoted tool's source chain over the window; flag a
    /// support collapse and optionally retire for drift.
    pub async fn drift_scan(
        &self,
        miner: &Miner,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> RegistryResult<Vec<DriftReport>> {
        let config = MiningConfig::over_window(since, until);
        let mut reports = Vec::new();
        for record in self.list(Some(ToolStatus::Promoted)).await? {
            let definition = self.load_definition(&record.slug).await?;
            if definition.source_support <= 0.0 {
                continue;
            }
            let tools: Vec<String> = definition
                .steps
                .iter()
                .map(|s| s.tool_id.clone())
                .collect();
            let current = miner
                .support_of(&tools, &config)
                .await
                .map_err(|e| RegistryError::Registry(e.to_string()))?;
            let flagged = current / definition.source_support < self.config.drift_threshold;
            let mut retired = false;
            if flagged {
                warn!(
                    target: "registry",
                    slug = %record.slug,
                    original = definition.source_support,
                    current,
                    "support drift detected"
                );
                if self.config.auto_retire_on_drift {
                    self.retire(&record.slug, RetirementReason::Drift).await?;
                    retired = true;
                }
            }
            reports.push(DriftReport {
                slug: record.slug,
                original_support: definition.source_support,
                current_support: current,
                flagged,
                retired,
            });
        }
        Ok(reports)
    }

    /// Retire tools idle past the staleness horizon.
    pub async fn staleness_scan(&self) -> RegistryResult<Vec<String>> {
        let cutoff = Utc::now() - Duration::days(self.config.auto_retire_after_days);
        let mut retired = Vec::new();
        for record in self.stale(cutoff).await? {
            self.retire(&record.slug, RetirementReason::AutoUnused)
                .await?;
            retired.push(record.slug);
        }
        Ok(retired)
    }

    /// Retire tools whose observed failure rate over the last 7 days
    /// exceeds the spike threshold.
    pub async fn failure_spike_scan(
        &self,
        store: &dyn EventStore,
    ) -> RegistryResult<Vec<(String, f64)>> {
        let since = Utc::now() - Duration::days(7);
        let mut retired = Vec::new();
        for record in self.list(Some(ToolStatus::Promoted)).await? {
            let base = CountFilters {
                tool_id: Some(record.slug.clone()),
                since: Some(since),
                ..Default::default()
            };
            let total = store
                .count(&base)
                .await
                .map_err(|e| RegistryError::Registry(e.to_string()))?;
            if total == 0 {
                continue;
            }
            let failures = store
                .count(&CountFilters {
                    outcome: Some(crate::event::Outcome::Failure),
                    ..base
                })
                .await
                .map_err(|e| RegistryError::Registry(e.to_string()))?;
            let rate = failures as f64 / total as f64;
            if rate > self.config.failure_spike_threshold {
                self.retire(&record.slug, RetirementReason::FailureSpike)
                    .await?;
                retired.push((record.slug, rate));
            }
        }
        Ok(retired)
    }

    async fn fetch_record(&self, slug: &str) -> RegistryResult<Option<ToolRecord>> {
        let row = sqlx::query("SELECT * FROM tool_records WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_record).transpose()
    }
}

fn parse_ts(raw: &str) -> RegistryResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RegistryError::Registry(format!("bad timestamp {raw:?}: {e}")))
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> RegistryResult<ToolRecord> {
    Ok(ToolRecord {
        slug: row.get("slug"),
        current_version: row.get::<i64, _>("current_version") as u32,
        definition_path: PathBuf::from(row.get::<String, _>("definition_path")),
        registered_at: parse_ts(&row.get::<String, _>("registered_at"))?,
        last_used_at: row
            .get::<Option<String>, _>("last_used_at")
            .map(|s| parse_ts(&s))
            .transpose()?,
        invocation_count: row.get::<i64, _>("invocation_count") as u64,
        retirement_reason: row.get("retirement_reason"),
    })
}
