//! Sequence mining over the event log.
//!
//! The miner is a pure function of the store contents for a given config:
//! session preparation, PrefixSpan, the gsp time-window filter, candidate
//! construction, and dedup. It writes nothing back to the event store.

mod prefixspan;

pub use prefixspan::{is_subsequence, leftmost_embedding, mine_patterns};

use crate::candidate::CandidateChain;
use crate::event::{Event, Outcome};
use crate::store::{EventStore, SessionOrder, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum MiningError {
    #[error("invalid mining config: {0}")]
    InvalidConfig(String),

    #[error("storage error during mining: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MiningAlgorithm {
    /// Plain sequential pattern mining.
    PrefixSpan,
    /// PrefixSpan followed by the time-window contiguity filter.
    Gsp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningConfig {
    pub algorithm: MiningAlgorithm,
    /// Fraction of sessions a chain must appear in, (0, 1].
    pub min_support: f64,
    /// Minimum mean transition probability, [0, 1].
    pub min_confidence: f64,
    /// Patterns longer than this are not explored.
    pub max_chain_length: usize,
    /// Maximum inter-step gap for the gsp filter.
    pub time_window_seconds: u64,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    /// Restrict mining to these sessions instead of a window query.
    pub session_ids: Option<Vec<String>>,
    /// Drop consecutive duplicate tool ids during preparation.
    pub collapse_repeats: bool,
    /// Provenance anchors per candidate, capped at ten.
    pub max_sample_events: usize,
    /// Relative support slack under which a shorter chain is subsumed.
    pub subsumption_threshold: f64,
    /// Deterministic session sampling fraction, (0, 1].
    pub sample_rate: f64,
}

impl MiningConfig {
    pub fn over_window(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            algorithm: MiningAlgorithm::PrefixSpan,
            min_support: 0.3,
            min_confidence: 0.5,
            max_chain_length: 5,
            time_window_seconds: 300,
            since,
            until,
            session_ids: None,
            collapse_repeats: true,
            max_sample_events: 10,
            subsumption_threshold: 0.1,
            sample_rate: 1.0,
        }
    }

    pub fn validate(&self) -> Result<(), MiningError> {
        let fail = |msg: String| Err(MiningError::InvalidConfig(msg));
        if !(self.min_support > 0.0 && self.min_support <= 1.0) {
            return fail(format!("min_support {} not in (0, 1]", self.min_support));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return fail(format!(
                "min_confidence {} not in [0, 1]",
                self.min_confidence
            ));
        }
        if self.max_chain_length < 2 {
            return fail(format!(
                "max_chain_length {} must be at least 2",
                self.max_chain_length
            ));
        }
        if !(0.0..=1.0).contains(&self.subsumption_threshold) {
            return fail(format!(
                "subsumption_threshold {} not in [0, 1]",
                self.subsumption_threshold
            ));
        }
        if !(self.sample_rate > 0.0 && self.sample_rate <= 1.0) {
            return fail(format!("sample_rate {} not in (0, 1]", self.sample_rate));
        }
        if self.since >= self.until {
            return fail("since must precede until".into());
        }
        if self.algorithm == MiningAlgorithm::Gsp && self.time_window_seconds == 0 {
            return fail("time_window_seconds must be positive for gsp".into());
        }
        Ok(())
    }
}

/// One prepared session: collapsed tool sequence plus the raw events used
/// for latency, outcome, and provenance statistics.
struct SessionData {
    id: String,
    seq: Vec<String>,
    events: Vec<Event>,
}

impl SessionData {
    fn last_timestamp(&self) -> DateTime<Utc> {
        self.events
            .last()
            .map(|e| e.timestamp)
            .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC)
    }

    fn raw_tools(&self) -> Vec<String> {
        self.events.iter().map(|e| e.tool_id.clone()).collect()
    }
}

pub struct Miner {
    store: Arc<dyn EventStore>,
}

impl Miner {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Run the full pipeline. Deterministic for a fixed store state and
    /// config, modulo freshly assigned candidate identifiers.
    #[tracing::instrument(skip(self, config), fields(algorithm = ?config.algorithm))]
    pub async fn mine(&self, config: &MiningConfig) -> Result<Vec<CandidateChain>, MiningError> {
        config.validate()?;

        let sessions = self.prepare_sessions(config).await?;
        let n_sessions = sessions.len();
        if n_sessions == 0 {
            return Ok(Vec::new());
        }
        debug!(target: "miner", sessions = n_sessions, "prepared sessions");

        let sequences: Vec<Vec<String>> = sessions.iter().map(|s| s.seq.clone()).collect();
        let abs_min = ((config.min_support * n_sessions as f64).ceil() as usize).max(1);
        let patterns = mine_patterns(&sequences, abs_min, config.max_chain_length);

        let mut candidates = Vec::new();
        for pattern in patterns {
            let containing: Vec<&SessionData> = sessions
                .iter()
                .filter(|s| is_subsequence(&pattern, &s.seq))
                .collect();
            let support = containing.len() as f64 / n_sessions as f64;
            if support < config.min_support {
                continue;
            }

            // Time-window filter applies under gsp only.
            let (containing, support) = if config.algorithm == MiningAlgorithm::Gsp {
                let window = config.time_window_seconds;
                let passing: Vec<&SessionData> = containing
                    .into_iter()
                    .filter(|s| embedding_within_window(&s.events, &pattern, window))
                    .collect();
                let support = passing.len() as f64 / n_sessions as f64;
                if support < config.min_support {
                    continue;
                }
                (passing, support)
            } else {
                (containing, support)
            };

            let confidence = chain_confidence(&pattern, &sessions);
            if confidence < config.min_confidence {
                continue;
            }

            candidates.push(build_candidate(
                &pattern, &containing, support, confidence, config,
            ));
        }

        let deduped = dedup(candidates, config.subsumption_threshold);
        info!(target: "miner", candidates = deduped.len(), "mining complete");
        Ok(deduped)
    }

    /// Current support of one fixed chain, for drift scans: the miner
    /// restricted to a single pattern.
    pub async fn support_of(
        &self,
        tools: &[String],
        config: &MiningConfig,
    ) -> Result<f64, MiningError> {
        config.validate()?;
        let sessions = self.prepare_sessions(config).await?;
        if sessions.is_empty() {
            return Ok(0.0);
        }
        let containing = sessions
            .iter()
            .filter(|s| is_subsequence(tools, &s.seq))
            .count();
        Ok(containing as f64 / sessions.len() as f64)
    }

    async fn prepare_sessions(
        &self,
        config: &MiningConfig,
    ) -> Result<Vec<SessionData>, MiningError> {
        let session_ids = match &config.session_ids {
            Some(ids) => {
                let mut ids = ids.clone();
                ids.sort();
                ids
            }
            None => {
                self.store
                    .get_sessions(config.since, config.until, 2)
                    .await?
            }
        };

        let mut sessions = Vec::new();
        for session_id in session_ids {
            if config.sample_rate < 1.0 && !sampled(&session_id, config.sample_rate) {
                continue;
            }
            let events: Vec<Event> = self
                .store
                .get_by_session(&session_id, SessionOrder::Timestamp)
                .await?
                .into_iter()
                .filter(|e| e.timestamp >= config.since && e.timestamp <= config.until)
                .collect();

            let mut seq: Vec<String> = events.iter().map(|e| e.tool_id.clone()).collect();
            if config.collapse_repeats {
                seq.dedup();
            }
            // Heuristic cap: very long sessions explode pattern search.
            if seq.len() < 2 || seq.len() > 3 * config.max_chain_length {
                continue;
            }
            sessions.push(SessionData {
                id: session_id,
                seq,
                events,
            });
        }
        Ok(sessions)
    }
}

/// Deterministic session sampling: hash the id to a fraction of u64 space.
fn sampled(session_id: &str, rate: f64) -> bool {
    let digest = Sha256::digest(session_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let fraction = u64::from_be_bytes(bytes) as f64 / u64::MAX as f64;
    fraction < rate
}

/// Any embedding of `pattern` in the session whose inter-step gaps all fit
/// the window? Gap = start(next) - end(current), end = start + latency.
fn embedding_within_window(events: &[Event], pattern: &[String], window_seconds: u64) -> bool {
    fn search(
        events: &[Event],
        pattern: &[String],
        pat_idx: usize,
        from: usize,
        last: Option<usize>,
        window_seconds: u64,
    ) -> bool {
        if pat_idx == pattern.len() {
            return true;
        }
        for i in from..events.len() {
            if events[i].tool_id != pattern[pat_idx] {
                continue;
            }
            if let Some(last) = last {
                let prev_end = events[last].timestamp
                    + chrono::Duration::milliseconds(events[last].latency_ms as i64);
                let gap = events[i].timestamp - prev_end;
                if gap > chrono::Duration::seconds(window_seconds as i64) {
                    // Later positions only widen this gap.
                    return false;
                }
            }
            if search(events, pattern, pat_idx + 1, i + 1, Some(i), window_seconds) {
                return true;
            }
        }
        false
    }
    search(events, pattern, 0, 0, None, window_seconds)
}

/// Mean, over consecutive links, of P(later tool appears after the earlier
/// one within a session). "After" means later in the sequence, not adjacent.
fn chain_confidence(pattern: &[String], sessions: &[SessionData]) -> f64 {
    if pattern.len() < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    for link in pattern.windows(2) {
        let (a, b) = (&link[0], &link[1]);
        let mut with_a = 0usize;
        let mut a_then_b = 0usize;
        for session in sessions {
            if let Some(first_a) = session.seq.iter().position(|t| t == a) {
                with_a += 1;
                if session.seq[first_a + 1..].iter().any(|t| t == b) {
                    a_then_b += 1;
                }
            }
        }
        if with_a == 0 {
            return 0.0;
        }
        total += a_then_b as f64 / with_a as f64;
    }
    total / (pattern.len() - 1) as f64
}

fn build_candidate(
    pattern: &[String],
    containing: &[&SessionData],
    support: f64,
    confidence: f64,
    config: &MiningConfig,
) -> CandidateChain {
    let mut latency_sum = 0.0;
    let mut failures = 0usize;
    let mut anchors: Vec<(DateTime<Utc>, &str, crate::event::EventId)> = Vec::new();

    for session in containing {
        let raw = session.raw_tools();
        if let Some(embedding) = leftmost_embedding(pattern, &raw) {
            let chain_latency: u64 = embedding
                .iter()
                .map(|&i| session.events[i].latency_ms as u64)
                .sum();
            latency_sum += chain_latency as f64;
            let last = *embedding.last().expect("non-empty embedding");
            if session.events[last].outcome == Outcome::Failure {
                failures += 1;
            }
            let first = embedding[0];
            anchors.push((
                session.last_timestamp(),
                session.id.as_str(),
                session.events[first].id,
            ));
        }
    }

    let n = containing.len().max(1) as f64;
    // Recent sessions first for provenance samples; session id breaks ties
    // so sample ordering stays reproducible.
    anchors.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    let sample_event_ids = anchors
        .into_iter()
        .map(|(_, _, id)| id)
        .take(config.max_sample_events.min(10))
        .collect();

    CandidateChain {
        id: Uuid::new_v4(),
        tools: pattern.to_vec(),
        support,
        confidence,
        avg_latency_ms: latency_sum / n,
        failure_rate: failures as f64 / n,
        sample_event_ids,
        discovered_at: Utc::now(),
        mining_config: config.clone(),
    }
}

/// Equality merge plus subsumption, then rank by support descending.
fn dedup(candidates: Vec<CandidateChain>, subsumption_threshold: f64) -> Vec<CandidateChain> {
    // Equality: same tool list merges, higher support wins, samples union.
    let mut by_tools: HashMap<Vec<String>, CandidateChain> = HashMap::new();
    for candidate in candidates {
        match by_tools.get_mut(&candidate.tools) {
            Some(existing) => {
                let mut merged_samples = existing.sample_event_ids.clone();
                for id in &candidate.sample_event_ids {
                    if !merged_samples.contains(id) {
                        merged_samples.push(*id);
                    }
                }
                merged_samples.truncate(10);
                if candidate.support > existing.support {
                    *existing = candidate;
                }
                existing.sample_event_ids = merged_samples;
            }
            None => {
                by_tools.insert(candidate.tools.clone(), candidate);
            }
        }
    }
    let mut chains: Vec<CandidateChain> = by_tools.into_values().collect();

    // Subsumption: a strict subsequence with near-equal support loses to
    // the longer chain.
    chains.sort_by(|a, b| b.tools.len().cmp(&a.tools.len()));
    let mut kept: Vec<CandidateChain> = Vec::new();
    for chain in chains {
        let subsumed = kept.iter().any(|longer| {
            chain.tools.len() < longer.tools.len()
                && is_subsequence(&chain.tools, &longer.tools)
                && longer.support > 0.0
                && (chain.support - longer.support).abs() / longer.support
                    <= subsumption_threshold
        });
        if !subsumed {
            kept.push(chain);
        }
    }

    kept.sort_by(|a, b| {
        b.support
            .partial_cmp(&a.support)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.tools.cmp(&b.tools))
    });
    kept
}
