//! SqliteLedger module - SQLite implementation of the oracle storage
//!
//! One database holds the draw history, the co-occurrence table, strategy
//! performance, generated tickets and the execution log. Multi-row writes run
//! inside a single transaction.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite, SqliteConnection};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::oracle::storage::{
    CooccurrenceStorage, DrawInsert, DrawStorage, ExecutionLog, StrategyStorage, TicketStorage,
};
use crate::oracle::types::{
    CooccurrencePair, OutcomeDelta, PipelineExecution, RunStatus, StrategyPerformance,
};
use crate::types::{DrawRecord, GeneratedTicket, NumberDomain, TicketEvaluation, PRIMARY_COUNT};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS draws (
        draw_date TEXT PRIMARY KEY,
        n1 INTEGER NOT NULL,
        n2 INTEGER NOT NULL,
        n3 INTEGER NOT NULL,
        n4 INTEGER NOT NULL,
        n5 INTEGER NOT NULL,
        secondary INTEGER NOT NULL,
        era TEXT NOT NULL,
        is_current_era BOOLEAN NOT NULL,
        ingested_at TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cooccurrence_pairs (
        a INTEGER NOT NULL,
        b INTEGER NOT NULL,
        observed INTEGER NOT NULL,
        expected REAL NOT NULL,
        deviation_percent REAL NOT NULL,
        significant BOOLEAN NOT NULL,
        PRIMARY KEY (a, b),
        CHECK (a < b)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS strategy_performance (
        strategy TEXT PRIMARY KEY,
        plays INTEGER NOT NULL DEFAULT 0,
        wins INTEGER NOT NULL DEFAULT 0,
        win_rate REAL NOT NULL DEFAULT 0,
        total_prize REAL NOT NULL DEFAULT 0,
        total_cost REAL NOT NULL DEFAULT 0,
        roi REAL NOT NULL DEFAULT 0,
        weight REAL NOT NULL DEFAULT 0,
        confidence REAL NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS generated_tickets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        target_date TEXT NOT NULL,
        n1 INTEGER NOT NULL,
        n2 INTEGER NOT NULL,
        n3 INTEGER NOT NULL,
        n4 INTEGER NOT NULL,
        n5 INTEGER NOT NULL,
        secondary INTEGER NOT NULL,
        strategy TEXT NOT NULL,
        confidence REAL NOT NULL,
        created_at TEXT NOT NULL,
        matched_primary INTEGER,
        matched_secondary BOOLEAN,
        prize REAL,
        evaluated_at TEXT
    );
    "#,
    "CREATE INDEX IF NOT EXISTS idx_generated_tickets_target ON generated_tickets (target_date);",
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_executions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        current_stage TEXT,
        status TEXT NOT NULL,
        failure_reason TEXT,
        stages TEXT NOT NULL,
        metadata TEXT NOT NULL,
        polling TEXT
    );
    "#,
    // At most one run may be in the running state.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_one_running_execution
        ON pipeline_executions (status) WHERE status = 'running';
    "#,
];

#[derive(FromRow)]
struct DrawRow {
    draw_date: NaiveDate,
    n1: i64,
    n2: i64,
    n3: i64,
    n4: i64,
    n5: i64,
    secondary: i64,
    era: String,
    is_current_era: bool,
}

#[derive(FromRow)]
struct PairRow {
    a: i64,
    b: i64,
    observed: i64,
    expected: f64,
    deviation_percent: f64,
    significant: bool,
}

#[derive(FromRow)]
struct PerformanceRow {
    strategy: String,
    plays: i64,
    wins: i64,
    win_rate: f64,
    total_prize: f64,
    total_cost: f64,
    roi: f64,
    weight: f64,
    confidence: f64,
    updated_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct TicketRow {
    id: i64,
    target_date: NaiveDate,
    n1: i64,
    n2: i64,
    n3: i64,
    n4: i64,
    n5: i64,
    secondary: i64,
    strategy: String,
    confidence: f64,
    created_at: DateTime<Utc>,
    matched_primary: Option<i64>,
    matched_secondary: Option<bool>,
    prize: Option<f64>,
    evaluated_at: Option<DateTime<Utc>>,
}

#[derive(FromRow)]
struct ExecutionRow {
    id: i64,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    current_stage: Option<String>,
    status: String,
    failure_reason: Option<String>,
    stages: String,    // JSON
    metadata: String,  // JSON
    polling: Option<String>, // JSON
}

fn small(value: i64, column: &str) -> Result<u8, StorageError> {
    u8::try_from(value).map_err(|_| StorageError::Corrupt(format!("{} = {} does not fit a draw number", column, value)))
}

fn primaries_from(values: [i64; PRIMARY_COUNT]) -> Result<[u8; PRIMARY_COUNT], StorageError> {
    let mut out = [0u8; PRIMARY_COUNT];
    for (slot, value) in out.iter_mut().zip(values) {
        *slot = small(value, "primary")?;
    }
    Ok(out)
}

impl DrawRow {
    fn into_record(self) -> Result<DrawRecord, StorageError> {
        Ok(DrawRecord {
            draw_date: self.draw_date,
            primaries: primaries_from([self.n1, self.n2, self.n3, self.n4, self.n5])?,
            secondary: small(self.secondary, "secondary")?,
            era: self.era,
            is_current_era: self.is_current_era,
        })
    }
}

impl TicketRow {
    fn into_ticket(self) -> Result<GeneratedTicket, StorageError> {
        let evaluation = match (self.matched_primary, self.matched_secondary, self.prize, self.evaluated_at) {
            (Some(matched_primary), Some(matched_secondary), Some(prize), Some(evaluated_at)) => {
                Some(TicketEvaluation {
                    matched_primary: small(matched_primary, "matched_primary")?,
                    matched_secondary,
                    prize,
                    evaluated_at,
                })
            }
            _ => None,
        };
        Ok(GeneratedTicket {
            id: Some(self.id),
            target_date: self.target_date,
            primaries: primaries_from([self.n1, self.n2, self.n3, self.n4, self.n5])?,
            secondary: small(self.secondary, "secondary")?,
            strategy: self.strategy,
            confidence: self.confidence,
            created_at: self.created_at,
            evaluation,
        })
    }
}

impl From<PerformanceRow> for StrategyPerformance {
    fn from(row: PerformanceRow) -> Self {
        Self {
            strategy: row.strategy,
            plays: row.plays.max(0) as u64,
            wins: row.wins.max(0) as u64,
            win_rate: row.win_rate,
            total_prize: row.total_prize,
            total_cost: row.total_cost,
            roi: row.roi,
            weight: row.weight,
            confidence: row.confidence,
            updated_at: row.updated_at,
        }
    }
}

impl ExecutionRow {
    fn into_execution(self) -> Result<PipelineExecution, StorageError> {
        let current_stage = match self.current_stage {
            Some(stage) => Some(stage.parse().map_err(StorageError::Corrupt)?),
            None => None,
        };
        let polling = match self.polling {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        Ok(PipelineExecution {
            id: Some(self.id),
            started_at: self.started_at,
            completed_at: self.completed_at,
            current_stage,
            stages: serde_json::from_str(&self.stages)?,
            status: self.status.parse().map_err(StorageError::Corrupt)?,
            failure_reason: self.failure_reason,
            metadata: serde_json::from_str(&self.metadata)?,
            polling,
        })
    }
}

/// SqliteLedger provides persistent storage for the pipeline using SQLite.
pub struct SqliteLedger {
    pool: Pool<Sqlite>,
}

impl SqliteLedger {
    /// Connect to (and create, if missing) the database at `url`.
    pub async fn connect(url: &str) -> Result<Arc<Self>, StorageError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::create_schema(&pool).await?;
        info!("SqliteLedger initialized and connected to {}", url);

        Ok(Arc::new(Self { pool }))
    }

    /// A private in-memory database. All access goes through one connection,
    /// which lives as long as the ledger.
    pub async fn in_memory() -> Result<Arc<Self>, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::create_schema(&pool).await?;
        debug!("SqliteLedger initialized in memory");

        Ok(Arc::new(Self { pool }))
    }

    async fn create_schema(pool: &Pool<Sqlite>) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(pool).await?;
        }
        Ok(())
    }

    /// Re-tag every stored draw with the era its date falls into.
    async fn refresh_eras(conn: &mut SqliteConnection, domain: &NumberDomain) -> Result<(), StorageError> {
        let eras = domain.eras();
        let current = &domain.current_era().tag;
        for (i, era) in eras.iter().enumerate() {
            // The first era also absorbs anything dated before it.
            let lower = if i == 0 { None } else { Some(era.starts_on) };
            let upper = eras.get(i + 1).map(|next| next.starts_on);
            sqlx::query(
                r#"
                UPDATE draws
                SET era = ?, is_current_era = ?
                WHERE (? IS NULL OR draw_date >= ?)
                  AND (? IS NULL OR draw_date < ?);
                "#,
            )
            .bind(&era.tag)
            .bind(&era.tag == current)
            .bind(lower)
            .bind(lower)
            .bind(upper)
            .bind(upper)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DrawStorage for SqliteLedger {
    async fn upsert_draw(&self, draw: &DrawRecord, domain: &NumberDomain) -> Result<DrawInsert, StorageError> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<DrawRow> = sqlx::query_as(
            "SELECT draw_date, n1, n2, n3, n4, n5, secondary, era, is_current_era FROM draws WHERE draw_date = ?",
        )
        .bind(draw.draw_date)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO draws (draw_date, n1, n2, n3, n4, n5, secondary, era, is_current_era, ingested_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
                    "#,
                )
                .bind(draw.draw_date)
                .bind(draw.primaries[0] as i64)
                .bind(draw.primaries[1] as i64)
                .bind(draw.primaries[2] as i64)
                .bind(draw.primaries[3] as i64)
                .bind(draw.primaries[4] as i64)
                .bind(draw.secondary as i64)
                .bind(&draw.era)
                .bind(draw.is_current_era)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
                DrawInsert::Inserted
            }
            Some(row) => {
                let stored = row.into_record()?;
                if stored.primaries != draw.primaries {
                    warn!(
                        "Draw {} already stored with primaries {:?}, refusing {:?}",
                        draw.draw_date, stored.primaries, draw.primaries
                    );
                    DrawInsert::Conflicting
                } else if stored.secondary != draw.secondary {
                    sqlx::query("UPDATE draws SET secondary = ? WHERE draw_date = ?")
                        .bind(draw.secondary as i64)
                        .bind(draw.draw_date)
                        .execute(&mut *tx)
                        .await?;
                    info!(
                        "Corrected secondary number of draw {}: {} -> {}",
                        draw.draw_date, stored.secondary, draw.secondary
                    );
                    DrawInsert::SecondaryCorrected { previous: stored.secondary }
                } else {
                    DrawInsert::Unchanged
                }
            }
        };

        if matches!(outcome, DrawInsert::Inserted | DrawInsert::SecondaryCorrected { .. }) {
            Self::refresh_eras(&mut tx, domain).await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn latest_draw(&self) -> Result<Option<DrawRecord>, StorageError> {
        let row: Option<DrawRow> = sqlx::query_as(
            "SELECT draw_date, n1, n2, n3, n4, n5, secondary, era, is_current_era FROM draws ORDER BY draw_date DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(DrawRow::into_record).transpose()
    }

    async fn draw_by_date(&self, date: NaiveDate) -> Result<Option<DrawRecord>, StorageError> {
        let row: Option<DrawRow> = sqlx::query_as(
            "SELECT draw_date, n1, n2, n3, n4, n5, secondary, era, is_current_era FROM draws WHERE draw_date = ?",
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DrawRow::into_record).transpose()
    }

    async fn all_draws(&self) -> Result<Vec<DrawRecord>, StorageError> {
        let rows: Vec<DrawRow> = sqlx::query_as(
            "SELECT draw_date, n1, n2, n3, n4, n5, secondary, era, is_current_era FROM draws ORDER BY draw_date ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DrawRow::into_record).collect()
    }

    async fn draw_count(&self) -> Result<i64, StorageError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM draws")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }
}

#[async_trait]
impl CooccurrenceStorage for SqliteLedger {
    async fn replace_pairs(&self, pairs: &[CooccurrencePair]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM cooccurrence_pairs").execute(&mut *tx).await?;
        for pair in pairs {
            sqlx::query(
                r#"
                INSERT INTO cooccurrence_pairs (a, b, observed, expected, deviation_percent, significant)
                VALUES (?, ?, ?, ?, ?, ?);
                "#,
            )
            .bind(pair.a as i64)
            .bind(pair.b as i64)
            .bind(pair.observed as i64)
            .bind(pair.expected)
            .bind(pair.deviation_percent)
            .bind(pair.significant)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Replaced co-occurrence table with {} pairs", pairs.len());
        Ok(())
    }

    async fn pairs(&self) -> Result<Vec<CooccurrencePair>, StorageError> {
        let rows: Vec<PairRow> = sqlx::query_as(
            "SELECT a, b, observed, expected, deviation_percent, significant FROM cooccurrence_pairs ORDER BY a, b",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(CooccurrencePair {
                    a: small(row.a, "a")?,
                    b: small(row.b, "b")?,
                    observed: u32::try_from(row.observed)
                        .map_err(|_| StorageError::Corrupt(format!("observed = {}", row.observed)))?,
                    expected: row.expected,
                    deviation_percent: row.deviation_percent,
                    significant: row.significant,
                })
            })
            .collect()
    }
}

#[async_trait]
impl StrategyStorage for SqliteLedger {
    async fn load_performance(&self) -> Result<Vec<StrategyPerformance>, StorageError> {
        let rows: Vec<PerformanceRow> = sqlx::query_as(
            r#"
            SELECT strategy, plays, wins, win_rate, total_prize, total_cost, roi, weight, confidence, updated_at
            FROM strategy_performance
            ORDER BY strategy;
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(StrategyPerformance::from).collect())
    }

    async fn save_performance(&self, rows: &[StrategyPerformance]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO strategy_performance
                    (strategy, plays, wins, win_rate, total_prize, total_cost, roi, weight, confidence, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (strategy) DO UPDATE SET
                    plays = excluded.plays,
                    wins = excluded.wins,
                    win_rate = excluded.win_rate,
                    total_prize = excluded.total_prize,
                    total_cost = excluded.total_cost,
                    roi = excluded.roi,
                    weight = excluded.weight,
                    confidence = excluded.confidence,
                    updated_at = excluded.updated_at;
                "#,
            )
            .bind(&row.strategy)
            .bind(row.plays as i64)
            .bind(row.wins as i64)
            .bind(row.win_rate)
            .bind(row.total_prize)
            .bind(row.total_cost)
            .bind(row.roi)
            .bind(row.weight)
            .bind(row.confidence)
            .bind(row.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn record_outcomes(
        &self,
        evaluations: &[(i64, TicketEvaluation)],
        deltas: &[OutcomeDelta],
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        for (ticket_id, evaluation) in evaluations {
            sqlx::query(
                r#"
                UPDATE generated_tickets
                SET matched_primary = ?, matched_secondary = ?, prize = ?, evaluated_at = ?
                WHERE id = ? AND evaluated_at IS NULL;
                "#,
            )
            .bind(evaluation.matched_primary as i64)
            .bind(evaluation.matched_secondary)
            .bind(evaluation.prize)
            .bind(evaluation.evaluated_at)
            .bind(ticket_id)
            .execute(&mut *tx)
            .await?;
        }

        // Unqualified columns in DO UPDATE refer to the stored row.
        for delta in deltas {
            sqlx::query(
                r#"
                INSERT INTO strategy_performance
                    (strategy, plays, wins, win_rate, total_prize, total_cost, roi, weight, confidence, updated_at)
                VALUES (?, ?, ?, 0, ?, ?, 0, 0, 0, ?)
                ON CONFLICT (strategy) DO UPDATE SET
                    plays = plays + excluded.plays,
                    wins = wins + excluded.wins,
                    total_prize = total_prize + excluded.total_prize,
                    total_cost = total_cost + excluded.total_cost,
                    updated_at = excluded.updated_at;
                "#,
            )
            .bind(&delta.strategy)
            .bind(delta.plays as i64)
            .bind(delta.wins as i64)
            .bind(delta.prize)
            .bind(delta.cost)
            .bind(at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE strategy_performance
            SET win_rate = CASE WHEN plays > 0 THEN CAST(wins AS REAL) / plays ELSE 0 END,
                roi = CASE WHEN total_cost > 0 THEN (total_prize - total_cost) / total_cost ELSE 0 END;
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl TicketStorage for SqliteLedger {
    async fn insert_tickets(&self, tickets: &[GeneratedTicket]) -> Result<Vec<i64>, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(tickets.len());

        for ticket in tickets {
            let id = sqlx::query(
                r#"
                INSERT INTO generated_tickets
                    (target_date, n1, n2, n3, n4, n5, secondary, strategy, confidence, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
                "#,
            )
            .bind(ticket.target_date)
            .bind(ticket.primaries[0] as i64)
            .bind(ticket.primaries[1] as i64)
            .bind(ticket.primaries[2] as i64)
            .bind(ticket.primaries[3] as i64)
            .bind(ticket.primaries[4] as i64)
            .bind(ticket.secondary as i64)
            .bind(&ticket.strategy)
            .bind(ticket.confidence)
            .bind(ticket.created_at)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();
            ids.push(id);
        }

        tx.commit().await?;
        Ok(ids)
    }

    async fn tickets_for(&self, target_date: NaiveDate) -> Result<Vec<GeneratedTicket>, StorageError> {
        let rows: Vec<TicketRow> = sqlx::query_as(
            "SELECT * FROM generated_tickets WHERE target_date = ? ORDER BY id",
        )
        .bind(target_date)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TicketRow::into_ticket).collect()
    }

    async fn unevaluated_tickets(&self, up_to: NaiveDate) -> Result<Vec<GeneratedTicket>, StorageError> {
        let rows: Vec<TicketRow> = sqlx::query_as(
            "SELECT * FROM generated_tickets WHERE evaluated_at IS NULL AND target_date <= ? ORDER BY id",
        )
        .bind(up_to)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TicketRow::into_ticket).collect()
    }
}

#[async_trait]
impl ExecutionLog for SqliteLedger {
    async fn begin_execution(&self, execution: &PipelineExecution) -> Result<i64, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO pipeline_executions
                (started_at, completed_at, current_stage, status, failure_reason, stages, metadata, polling)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?);
            "#,
        )
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.current_stage.map(|s| s.as_str()))
        .bind(execution.status.as_str())
        .bind(&execution.failure_reason)
        .bind(serde_json::to_string(&execution.stages)?)
        .bind(serde_json::to_string(&execution.metadata)?)
        .bind(execution.polling.as_ref().map(serde_json::to_string).transpose()?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.last_insert_rowid()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                let running = self.running_execution().await?;
                Err(StorageError::RunAlreadyActive {
                    run_id: running.and_then(|r| r.id),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_execution(&self, execution: &PipelineExecution) -> Result<(), StorageError> {
        let id = execution
            .id
            .ok_or_else(|| StorageError::Corrupt("execution has no id".into()))?;

        sqlx::query(
            r#"
            UPDATE pipeline_executions
            SET completed_at = ?, current_stage = ?, status = ?, failure_reason = ?,
                stages = ?, metadata = ?, polling = ?
            WHERE id = ?;
            "#,
        )
        .bind(execution.completed_at)
        .bind(execution.current_stage.map(|s| s.as_str()))
        .bind(execution.status.as_str())
        .bind(&execution.failure_reason)
        .bind(serde_json::to_string(&execution.stages)?)
        .bind(serde_json::to_string(&execution.metadata)?)
        .bind(execution.polling.as_ref().map(serde_json::to_string).transpose()?)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn running_execution(&self) -> Result<Option<PipelineExecution>, StorageError> {
        let row: Option<ExecutionRow> = sqlx::query_as(
            "SELECT * FROM pipeline_executions WHERE status = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(RunStatus::Running.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(ExecutionRow::into_execution).transpose()
    }

    async fn execution(&self, id: i64) -> Result<Option<PipelineExecution>, StorageError> {
        let row: Option<ExecutionRow> = sqlx::query_as("SELECT * FROM pipeline_executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ExecutionRow::into_execution).transpose()
    }

    async fn latest_execution(&self) -> Result<Option<PipelineExecution>, StorageError> {
        let row: Option<ExecutionRow> =
            sqlx::query_as("SELECT * FROM pipeline_executions ORDER BY id DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        row.map(ExecutionRow::into_execution).transpose()
    }

    async fn recent_executions(&self, limit: u32) -> Result<Vec<PipelineExecution>, StorageError> {
        let rows: Vec<ExecutionRow> =
            sqlx::query_as("SELECT * FROM pipeline_executions ORDER BY id DESC LIMIT ?")
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }

    async fn fail_running_executions(&self, reason: &str, at: DateTime<Utc>) -> Result<Vec<i64>, StorageError> {
        let rows: Vec<ExecutionRow> = sqlx::query_as("SELECT * FROM pipeline_executions WHERE status = ?")
            .bind(RunStatus::Running.as_str())
            .fetch_all(&self.pool)
            .await?;

        let mut recovered = Vec::with_capacity(rows.len());
        for row in rows {
            let mut execution = row.into_execution()?;
            execution.abort(reason, at);
            self.update_execution(&execution).await?;
            if let Some(id) = execution.id {
                recovered.push(id);
            }
        }
        Ok(recovered)
    }

    async fn health_check(&self) -> Result<bool, StorageError> {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}
