//! Error types for the draw oracle.
//!
//! Every error that can end a pipeline stage is folded into [`PipelineError`],
//! whose [`Severity`] decides whether the run continues, rejects a single
//! record, or aborts.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the orchestrator reacts to a stage error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Stage is marked failed, the run continues and ends `partial`.
    Transient,
    /// The offending record or ticket is rejected, aggregates stay untouched.
    DataIntegrity,
    /// The run aborts immediately and ends `failed`.
    Fatal,
}

/// Configuration-related errors with structured variants.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("provider {provider} requires credential in ${env_var}, which is not set")]
    MissingCredential { provider: String, env_var: String },

    #[error("failed to read config file: {0}")]
    ReadFile(#[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),
}

/// A draw or ticket that violates the number-domain invariants.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("expected {expected} primary numbers, got {actual}")]
    WrongCount { expected: usize, actual: usize },

    #[error("primary number {value} outside 1..={max}")]
    PrimaryOutOfDomain { value: u8, max: u8 },

    #[error("duplicate primary number {0}")]
    DuplicatePrimary(u8),

    #[error("secondary number {value} outside 1..={max} for era {era}")]
    SecondaryOutOfDomain { value: u8, max: u8, era: String },

    #[error("ticket duplicates another ticket in the batch")]
    DuplicateTicket,

    #[error("draw {date} already stored with different primary numbers")]
    ConflictingDraw { date: NaiveDate },
}

/// Failures reported by ingestion providers.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("provider {provider} unreachable: {reason}")]
    Unreachable { provider: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed payload from {provider}: {reason}")]
    Malformed { provider: String, reason: String },

    #[error("invalid draw from provider: {0}")]
    Invalid(#[from] ValidationError),

    #[error("record from {provider} rejected while polling: {reason}")]
    Rejected { provider: String, reason: String },

    #[error("all providers failed: {0}")]
    Exhausted(String),
}

/// Persistence failures.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("another run is already running (id {run_id:?})")]
    RunAlreadyActive { run_id: Option<i64> },

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Top-level error for pipeline operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("run {run_id} is already running")]
    AlreadyRunning { run_id: i64 },

    #[error("draw for {expected} not available after {elapsed_seconds:.1}s ({attempts} attempts)")]
    PollTimedOut {
        expected: NaiveDate,
        attempts: u32,
        elapsed_seconds: f64,
    },

    #[error("persistent store is unreadable")]
    StoreUnavailable,

    #[error("no strategies are registered")]
    NoStrategies,
}

impl PipelineError {
    /// Classify this error for the orchestrator.
    pub fn severity(&self) -> Severity {
        match self {
            PipelineError::Config(_)
            | PipelineError::Storage(_)
            | PipelineError::StoreUnavailable
            | PipelineError::NoStrategies
            | PipelineError::AlreadyRunning { .. } => Severity::Fatal,
            PipelineError::Validation(_) | PipelineError::Ingest(IngestError::Invalid(_)) => {
                Severity::DataIntegrity
            }
            PipelineError::Ingest(IngestError::Malformed { .. } | IngestError::Rejected { .. }) => {
                Severity::DataIntegrity
            }
            PipelineError::Ingest(_) | PipelineError::PollTimedOut { .. } => Severity::Transient,
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classification() {
        let timeout = PipelineError::PollTimedOut {
            expected: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            attempts: 3,
            elapsed_seconds: 12.0,
        };
        assert_eq!(timeout.severity(), Severity::Transient);

        let unreachable = PipelineError::Ingest(IngestError::Unreachable {
            provider: "p".into(),
            reason: "refused".into(),
        });
        assert_eq!(unreachable.severity(), Severity::Transient);

        let invalid = PipelineError::Ingest(IngestError::Invalid(ValidationError::DuplicatePrimary(4)));
        assert_eq!(invalid.severity(), Severity::DataIntegrity);

        let rejected = PipelineError::Ingest(IngestError::Rejected {
            provider: "p".into(),
            reason: "duplicate primary number 4".into(),
        });
        assert_eq!(rejected.severity(), Severity::DataIntegrity);

        let config = PipelineError::Config(ConfigError::MissingField { field: "providers" });
        assert_eq!(config.severity(), Severity::Fatal);
        assert_eq!(PipelineError::StoreUnavailable.severity(), Severity::Fatal);
    }

    #[test]
    fn test_error_messages_are_readable() {
        let err = ValidationError::SecondaryOutOfDomain { value: 30, max: 26, era: "pb26".into() };
        assert_eq!(err.to_string(), "secondary number 30 outside 1..=26 for era pb26");
    }
}
