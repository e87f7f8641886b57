//! The feedback loop: mine, gate, synthesize, validate, register.
//!
//! Components stay independently usable; the orchestrator only sequences
//! them and owns the candidate-consumption policy.

use crate::candidate::{CandidateChain, CandidateStore};
use crate::config::TwinRavenConfig;
use crate::mining::Miner;
use crate::registry::{DriftReport, RegistryError, ToolRegistry};
use crate::store::EventStore;
use crate::synthesis::{SynthesisError, Synthesizer};
use crate::tool::ToolStatus;
use crate::validation::{ValidationError, Validator};
use crate::Result;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct CycleReport {
    pub candidates_mined: usize,
    pub rejected_failure_rate: usize,
    pub promoted: Vec<String>,
    pub awaiting_approval: Vec<String>,
    pub returned_to_draft: Vec<String>,
    pub deferred: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MaintenanceReport {
    pub pruned_events: u64,
    pub drift: Vec<DriftReport>,
    pub retired_stale: Vec<String>,
    pub retired_spiking: Vec<(String, f64)>,
}

pub struct Orchestrator {
    store: Arc<dyn EventStore>,
    candidates: Arc<dyn CandidateStore>,
    miner: Miner,
    synthesizer: Synthesizer,
    validator: Validator,
    registry: Arc<ToolRegistry>,
    config: TwinRavenConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn EventStore>,
        candidates: Arc<dyn CandidateStore>,
        miner: Miner,
        synthesizer: Synthesizer,
        validator: Validator,
        registry: Arc<ToolRegistry>,
        config: TwinRavenConfig,
    ) -> Self {
        Self {
            store,
            candidates,
            miner,
            synthesizer,
            validator,
            registry,
            config,
        }
    }

    /// One pass of the loop over the configured mining window.
    #[tracing::instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let mining_config = self.config.mining_config();
        let chains = self.miner.mine(&mining_config).await?;
        report.candidates_mined = chains.len();

        for chain in chains {
            self.candidates.save(chain.clone()).await?;

            if chain.failure_rate > self.config.mining.max_failure_rate {
                info!(
                    target: "orchestrator",
                    chain = %chain.tools.join("->"),
                    failure_rate = chain.failure_rate,
                    "candidate rejected for failure rate"
                );
                self.candidates.delete(chain.id).await?;
                report.rejected_failure_rate += 1;
                continue;
            }

            match self.consume_candidate(&chain, &mut report).await {
                Ok(consumed) => {
                    if consumed {
                        self.candidates.delete(chain.id).await?;
                    } else {
                        report.deferred.push(chain.tools.join("->"));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            target: "orchestrator",
            mined = report.candidates_mined,
            promoted = report.promoted.len(),
            rejected = report.rejected_failure_rate,
            "cycle complete"
        );
        Ok(report)
    }

    /// Synthesize and validate one candidate. Returns whether the
    /// candidate was consumed (and should be deleted) or should stay for
    /// a later cycle.
    async fn consume_candidate(
        &self,
        chain: &CandidateChain,
        report: &mut CycleReport,
    ) -> Result<bool> {
        let mut tool = match self.synthesizer.synthesize(chain).await {
            Ok(tool) => tool,
            Err(SynthesisError::SchemaInvalid(e)) => {
                // Rejected for good: the model cannot produce a valid plan.
                warn!(target: "orchestrator", chain = %chain.tools.join("->"), error = %e,
                      "synthesis rejected");
                return Ok(true);
            }
            Err(e) => return Err(e.into()),
        };

        let validation_config = self.config.validation_config();
        let validation = match self.validator.validate(&mut tool, &validation_config).await {
            Ok(v) => v,
            Err(ValidationError::InsufficientData { found, needed }) => {
                // Not enough history yet; the chain may accumulate more.
                info!(
                    target: "orchestrator",
                    slug = %tool.slug,
                    found,
                    needed,
                    "validation deferred for data"
                );
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        match tool.status {
            ToolStatus::Promoted => {
                match self.registry.register(&tool, &validation).await {
                    Ok(_) => {}
                    Err(RegistryError::Duplicate(_)) => {
                        // Re-synthesis of a known slug: next dense version.
                        self.registry.new_version(&mut tool, &validation).await?;
                    }
                    Err(e) => return Err(e.into()),
                }
                report.promoted.push(tool.slug.clone());
            }
            ToolStatus::Testing => report.awaiting_approval.push(tool.slug.clone()),
            _ => report.returned_to_draft.push(tool.slug.clone()),
        }
        Ok(true)
    }

    /// Retention pruning plus the registry health scans.
    #[tracing::instrument(skip(self))]
    pub async fn maintenance(&self) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();

        let cutoff = Utc::now() - Duration::days(self.config.store.retention_days);
        report.pruned_events = self.store.prune(cutoff).await?;

        let until = Utc::now();
        let since = until - Duration::days(self.config.mining.window_days);
        report.drift = self.registry.drift_scan(&self.miner, since, until).await?;
        report.retired_stale = self.registry.staleness_scan().await?;
        report.retired_spiking = self
            .registry
            .failure_spike_scan(self.store.as_ref())
            .await?;

        info!(
            target: "orchestrator",
            pruned = report.pruned_events,
            drifted = report.drift.iter().filter(|d| d.flagged).count(),
            stale = report.retired_stale.len(),
            spiking = report.retired_spiking.len(),
            "maintenance complete"
        );
        Ok(report)
    }
}
