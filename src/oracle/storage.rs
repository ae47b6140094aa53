//! Storage abstraction layer for the oracle.
//!
//! This module defines the formal contracts for persistence, split by the
//! collaborator each one stands for. [`OracleStorage`] bundles them so the
//! pipeline can hold a single `Arc<dyn OracleStorage>`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::StorageError;
use crate::oracle::types::{CooccurrencePair, OutcomeDelta, PipelineExecution, StrategyPerformance};
use crate::types::{DrawRecord, GeneratedTicket, NumberDomain, TicketEvaluation};

/// What happened when a draw was offered to the historical record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawInsert {
    Inserted,
    /// Same date and numbers were already stored
    Unchanged,
    /// Same date and primaries, the secondary number was corrected
    SecondaryCorrected { previous: u8 },
    /// Same date but different primaries; the stored row was left alone
    Conflicting,
}

/// Append-only table of past draw outcomes, keyed by draw date.
#[async_trait]
pub trait DrawStorage: Send + Sync {
    /// Insert a draw (or correct its secondary number) and recompute era tags.
    async fn upsert_draw(&self, draw: &DrawRecord, domain: &NumberDomain) -> Result<DrawInsert, StorageError>;

    async fn latest_draw(&self) -> Result<Option<DrawRecord>, StorageError>;

    async fn draw_by_date(&self, date: NaiveDate) -> Result<Option<DrawRecord>, StorageError>;

    /// All draws ordered by date (ascending).
    async fn all_draws(&self) -> Result<Vec<DrawRecord>, StorageError>;

    async fn draw_count(&self) -> Result<i64, StorageError>;
}

/// Output of the co-occurrence analytics pass.
#[async_trait]
pub trait CooccurrenceStorage: Send + Sync {
    /// Replace every pair row in one transaction.
    async fn replace_pairs(&self, pairs: &[CooccurrencePair]) -> Result<(), StorageError>;

    /// All pairs ordered by `(a, b)`.
    async fn pairs(&self) -> Result<Vec<CooccurrencePair>, StorageError>;
}

/// Per-strategy outcome record and weights.
///
/// Every method is a single statement or a single transaction, so readers never
/// observe a half-written set of weights.
#[async_trait]
pub trait StrategyStorage: Send + Sync {
    async fn load_performance(&self) -> Result<Vec<StrategyPerformance>, StorageError>;

    /// Upsert the full set of rows atomically.
    async fn save_performance(&self, rows: &[StrategyPerformance]) -> Result<(), StorageError>;

    /// Mark tickets evaluated and fold the deltas into the strategy counters.
    async fn record_outcomes(
        &self,
        evaluations: &[(i64, TicketEvaluation)],
        deltas: &[OutcomeDelta],
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;
}

/// Persisted ticket batches.
#[async_trait]
pub trait TicketStorage: Send + Sync {
    /// Insert a batch in one transaction, returning the new ids in order.
    async fn insert_tickets(&self, tickets: &[GeneratedTicket]) -> Result<Vec<i64>, StorageError>;

    async fn tickets_for(&self, target_date: NaiveDate) -> Result<Vec<GeneratedTicket>, StorageError>;

    /// Tickets not yet evaluated whose target date is on or before `up_to`.
    async fn unevaluated_tickets(&self, up_to: NaiveDate) -> Result<Vec<GeneratedTicket>, StorageError>;
}

/// Run history, current stage and terminal status.
#[async_trait]
pub trait ExecutionLog: Send + Sync {
    /// Insert a new running execution. Fails with
    /// [`StorageError::RunAlreadyActive`] if another run is still running.
    async fn begin_execution(&self, execution: &PipelineExecution) -> Result<i64, StorageError>;

    async fn update_execution(&self, execution: &PipelineExecution) -> Result<(), StorageError>;

    async fn running_execution(&self) -> Result<Option<PipelineExecution>, StorageError>;

    async fn execution(&self, id: i64) -> Result<Option<PipelineExecution>, StorageError>;

    async fn latest_execution(&self) -> Result<Option<PipelineExecution>, StorageError>;

    /// Most recent runs first.
    async fn recent_executions(&self, limit: u32) -> Result<Vec<PipelineExecution>, StorageError>;

    /// Mark every running execution failed with `reason`; returns their ids.
    async fn fail_running_executions(&self, reason: &str, at: DateTime<Utc>) -> Result<Vec<i64>, StorageError>;

    /// Health check for the storage backend.
    async fn health_check(&self) -> Result<bool, StorageError>;
}

/// Everything the pipeline persists.
pub trait OracleStorage:
    DrawStorage + CooccurrenceStorage + StrategyStorage + TicketStorage + ExecutionLog
{
}

impl<T> OracleStorage for T where
    T: DrawStorage + CooccurrenceStorage + StrategyStorage + TicketStorage + ExecutionLog
{
}
