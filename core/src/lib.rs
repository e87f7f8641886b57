// TwinRaven core
// Telemetry-and-synthesis runtime: observe agent tool calls (Muninn, the
// append-only event log), mine repeated chains, synthesize composite tools,
// validate them offline, and manage their lifecycle.

pub mod candidate;
pub mod collector;
pub mod config;
pub mod event;
pub mod export;
pub mod llm;
pub mod mining;
pub mod orchestrator;
pub mod predicate;
pub mod registry;
pub mod store;
pub mod synthesis;
pub mod telemetry;
pub mod tool;
pub mod validation;

// Export core types
pub use candidate::{CandidateChain, CandidateError, CandidateStore, MemoryCandidateStore};
pub use collector::{BufferMode, Collector, CollectorConfig, CollectorError, ObservationContext};
pub use config::{ConfigError, TwinRavenConfig};
pub use event::{canonical_json, input_hash, Event, EventId, Outcome};
pub use llm::{GenerateRequest, HttpLlmProvider, LlmError, LlmProvider, LlmResponse};
pub use mining::{Miner, MiningAlgorithm, MiningConfig, MiningError};
pub use orchestrator::{CycleReport, MaintenanceReport, Orchestrator};
pub use predicate::Predicate;
pub use registry::{
    RegistryConfig, RegistryError, RetirementReason, ToolRecord, ToolRegistry, ToolVersion,
};
pub use store::{
    CountFilters, EventStore, MemoryEventStore, SessionOrder, SqliteEventStore, StorageError,
};
pub use synthesis::{SynthesisError, Synthesizer, SynthesizerConfig};
pub use tool::{ErrorStrategy, InputSource, SynthesizedTool, ToolStatus, ToolStep};
pub use validation::{
    SimilarityMethod, ValidationConfig, ValidationError, ValidationResult, Validator,
};

use crate::candidate::SqliteCandidateStore;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RavenError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Collector(#[from] CollectorError),

    #[error(transparent)]
    Candidate(#[from] CandidateError),

    #[error(transparent)]
    Mining(#[from] MiningError),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Export(#[from] export::ExportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, RavenError>;

/// Runtime root: constructs the whole pipeline from a validated config.
///
/// No global singletons; every component receives its dependencies
/// explicitly, and tests construct fresh instances of the pieces they need.
pub struct TwinRaven {
    pub config: TwinRavenConfig,
    pub store: Arc<dyn EventStore>,
    pub candidates: Arc<dyn CandidateStore>,
    pub collector: Collector,
    pub registry: Arc<ToolRegistry>,
    pub orchestrator: Orchestrator,
}

impl TwinRaven {
    /// Build on the sqlite store named in the config, sharing its pool
    /// with the candidate store and the registry tables.
    pub async fn new(config: TwinRavenConfig, llm: Arc<dyn LlmProvider>) -> Result<Self> {
        config.validate()?;

        let sqlite =
            SqliteEventStore::open(config.store_path(), config.store_options()).await?;
        let pool = sqlite.pool();
        let store: Arc<dyn EventStore> = Arc::new(sqlite);

        let candidates: Arc<dyn CandidateStore> =
            Arc::new(SqliteCandidateStore::new(pool.clone()).await?);
        let registry = Arc::new(ToolRegistry::new(pool, config.registry_config()).await?);

        let collector = Collector::new(
            Arc::clone(&store),
            Some(Arc::clone(&llm)),
            config.collector_config(),
        );
        let miner = Miner::new(Arc::clone(&store));
        let synthesizer = Synthesizer::new(
            Arc::clone(&store),
            Arc::clone(&llm),
            config.synthesizer_config(),
        );
        let validator = Validator::new(Arc::clone(&store));

        let orchestrator = Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&candidates),
            miner,
            synthesizer,
            validator,
            Arc::clone(&registry),
            config.clone(),
        );

        Ok(Self {
            config,
            store,
            candidates,
            collector,
            registry,
            orchestrator,
        })
    }
}
