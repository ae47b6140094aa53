//! Oracle module - prediction-run pipeline and its components.
//!
//! The [`Orchestrator`] drives one run through polling, ingestion, analytics,
//! evaluation, re-weighting and ticket generation. Everything it persists goes
//! through the traits in [`storage`].

pub mod analytics;
pub mod circuit_breaker;
pub mod data_sources;
pub mod evaluator;
pub mod pipeline;
pub mod poller;
pub mod schedule;
pub mod sqlite_ledger;
pub mod storage;
pub mod strategies;
pub mod strategy_manager;
pub mod types;
pub mod weights;

// Re-export the main entry points
pub use analytics::{AnalyticsSummary, CooccurrenceEngine};
pub use data_sources::{DrawSource, FallbackDrawSource, HttpDrawSource, StaticDrawSource};
pub use evaluator::{EvaluationSummary, OutcomeEvaluator};
pub use pipeline::{Orchestrator, RunHandle, RECOVERED_ON_RESTART};
pub use poller::{PollOutcome, PollReport, PollWaker, Poller};
pub use schedule::{Clock, DrawSchedule, FixedClock, SystemClock};
pub use sqlite_ledger::SqliteLedger;
pub use storage::OracleStorage;
pub use strategies::{StrategyRegistry, TicketStrategy};
pub use strategy_manager::{GeneratedBatch, StrategyManager};
pub use types::{
    PipelineExecution, PollResultKind, PollingSummary, RunSelector, RunStatus, Stage, StageStatus,
    StrategyPerformance, TriggerAck,
};
pub use weights::AdaptiveWeighting;

use std::sync::Arc;

use crate::config::{OracleConfig, ProviderConfig};
use crate::error::PipelineError;

/// Orchestrator builder for convenient construction with sensible defaults.
pub struct OracleBuilder {
    config: OracleConfig,
    registry: Option<StrategyRegistry>,
    clock: Option<Arc<dyn Clock>>,
}

impl OracleBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::from_config(OracleConfig::default())
    }

    /// Start from an already loaded configuration.
    pub fn from_config(config: OracleConfig) -> Self {
        Self {
            config,
            registry: None,
            clock: None,
        }
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = url.into();
        self
    }

    /// Switch the POLL stage on or off.
    pub fn with_polling(mut self, enabled: bool) -> Self {
        self.config.polling.enabled = enabled;
        self
    }

    /// Set poll interval, poll ceiling and supervisor grace period, in seconds.
    pub fn with_poll_timing(mut self, interval: u64, timeout: u64, supervisor_grace: u64) -> Self {
        self.config.polling.interval_seconds = interval;
        self.config.polling.timeout_seconds = timeout;
        self.config.polling.supervisor_grace_seconds = supervisor_grace;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.config.generation.batch_size = batch_size;
        self
    }

    /// Fix the generation RNG seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.generation.seed = Some(seed);
        self
    }

    pub fn with_significance_threshold(mut self, percent: f64) -> Self {
        self.config.analytics.significance_threshold_percent = percent;
        self
    }

    pub fn with_weight_prior(mut self, prior: f64) -> Self {
        self.config.weighting.prior = prior;
        self
    }

    pub fn with_providers(mut self, providers: Vec<ProviderConfig>) -> Self {
        self.config.providers = providers;
        self
    }

    /// Replace the built-in strategy set.
    pub fn with_registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the configuration only.
    pub fn build_config(self) -> OracleConfig {
        self.config
    }

    /// Build an orchestrator over the given storage and ingestion adapter.
    pub fn build(
        self,
        storage: Arc<dyn OracleStorage>,
        source: Arc<dyn DrawSource>,
    ) -> Result<Orchestrator, PipelineError> {
        Orchestrator::new(
            self.config,
            storage,
            source,
            self.registry.unwrap_or_else(StrategyRegistry::standard),
            self.clock.unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>),
        )
    }

    /// Connect the SQLite ledger and the configured HTTP providers, then build.
    pub async fn connect(self) -> Result<Orchestrator, PipelineError> {
        self.config.validate()?;
        let domain = self.config.number_domain()?;
        let storage = SqliteLedger::connect(&self.config.database_url).await?;
        let source = FallbackDrawSource::from_config(&self.config.providers, &domain)?;
        self.build(storage, Arc::new(source))
    }
}

impl Default for OracleBuilder {
    fn default() -> Self {
        Self::new()
    }
}
