//! Types shared by the pipeline stages and the execution log.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Severity;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Poll,
    Ingest,
    Analyze,
    Evaluate,
    Reweight,
    Generate,
}

impl Stage {
    pub fn all() -> [Stage; 6] {
        [
            Stage::Poll,
            Stage::Ingest,
            Stage::Analyze,
            Stage::Evaluate,
            Stage::Reweight,
            Stage::Generate,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Poll => "poll",
            Stage::Ingest => "ingest",
            Stage::Analyze => "analyze",
            Stage::Evaluate => "evaluate",
            Stage::Reweight => "reweight",
            Stage::Generate => "generate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::all()
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// Progress of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

impl StageStatus {
    /// Completed or intentionally skipped.
    pub fn is_done(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Skipped)
    }
}

/// Overall state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// How a polling window ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollResultKind {
    Found,
    TimedOut,
    Rejected,
    NotYetDue,
    Disabled,
}

/// Poller summary persisted with the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingSummary {
    pub enabled: bool,
    pub result: PollResultKind,
    pub expected_date: Option<NaiveDate>,
    pub attempts: u32,
    pub elapsed_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PollingSummary {
    /// Summary for a run with polling switched off.
    pub fn disabled(at: DateTime<Utc>) -> Self {
        Self {
            enabled: false,
            result: PollResultKind::Disabled,
            expected_date: None,
            attempts: 0,
            elapsed_seconds: 0.0,
            started_at: at,
            completed_at: Some(at),
        }
    }
}

/// One invocation of the pipeline, tracked end to end in the execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineExecution {
    /// Database record ID (set by DB)
    pub id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub current_stage: Option<Stage>,
    pub stages: BTreeMap<Stage, StageStatus>,
    pub status: RunStatus,
    pub failure_reason: Option<String>,
    /// Free-form per-stage details, keyed by stage name
    pub metadata: Map<String, Value>,
    pub polling: Option<PollingSummary>,
}

impl PipelineExecution {
    /// A fresh run with every stage pending.
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            started_at,
            completed_at: None,
            current_stage: None,
            stages: Stage::all().into_iter().map(|s| (s, StageStatus::Pending)).collect(),
            status: RunStatus::Running,
            failure_reason: None,
            metadata: Map::new(),
            polling: None,
        }
    }

    pub fn stage_status(&self, stage: Stage) -> StageStatus {
        self.stages.get(&stage).copied().unwrap_or(StageStatus::Pending)
    }

    pub fn begin_stage(&mut self, stage: Stage) {
        self.current_stage = Some(stage);
        self.stages.insert(stage, StageStatus::Running);
    }

    pub fn complete_stage(&mut self, stage: Stage, detail: Value) {
        self.stages.insert(stage, StageStatus::Completed);
        self.metadata.insert(stage.as_str().into(), json!({ "status": "completed", "detail": detail }));
    }

    pub fn skip_stage(&mut self, stage: Stage, reason: &str) {
        self.stages.insert(stage, StageStatus::Skipped);
        self.metadata.insert(stage.as_str().into(), json!({ "status": "skipped", "reason": reason }));
    }

    pub fn fail_stage(&mut self, stage: Stage, severity: Severity, error: &str) {
        self.stages.insert(stage, StageStatus::Failed);
        self.metadata.insert(
            stage.as_str().into(),
            json!({ "status": "failed", "severity": severity, "error": error }),
        );
    }

    /// Record a rejected record or ticket without failing the stage.
    pub fn record_rejection(&mut self, stage: Stage, reason: &str) {
        let key = format!("{}_rejections", stage.as_str());
        let entry = self.metadata.entry(key).or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = entry {
            items.push(Value::String(reason.to_string()));
        }
    }

    pub fn has_failed_stage(&self) -> bool {
        self.stages.values().any(|s| *s == StageStatus::Failed)
    }

    /// Settle the terminal status after the last stage.
    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.status = if self.has_failed_stage() {
            RunStatus::Partial
        } else {
            RunStatus::Succeeded
        };
        self.completed_at = Some(at);
    }

    /// Abort the run with a fatal reason.
    pub fn abort(&mut self, reason: &str, at: DateTime<Utc>) {
        if let Some(stage) = self.current_stage {
            if self.stage_status(stage) == StageStatus::Running {
                self.stages.insert(stage, StageStatus::Failed);
            }
        }
        self.status = RunStatus::Failed;
        self.failure_reason = Some(reason.to_string());
        self.completed_at = Some(at);
    }
}

/// Accumulated outcome record and current selection weight of one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyPerformance {
    pub strategy: String,
    pub plays: u64,
    pub wins: u64,
    pub win_rate: f64,
    pub total_prize: f64,
    pub total_cost: f64,
    /// (prize - cost) / cost, 0.0 before the first play
    pub roi: f64,
    pub weight: f64,
    pub confidence: f64,
    pub updated_at: DateTime<Utc>,
}

impl StrategyPerformance {
    /// A strategy with no plays yet.
    pub fn untested(strategy: &str, at: DateTime<Utc>) -> Self {
        Self {
            strategy: strategy.to_string(),
            plays: 0,
            wins: 0,
            win_rate: 0.0,
            total_prize: 0.0,
            total_cost: 0.0,
            roi: 0.0,
            weight: 0.0,
            confidence: 0.0,
            updated_at: at,
        }
    }
}

/// Per-strategy increments produced by evaluating a draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeDelta {
    pub strategy: String,
    pub plays: u64,
    pub wins: u64,
    pub prize: f64,
    pub cost: f64,
}

/// Joint statistics for one unordered pair of primary numbers (`a < b`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooccurrencePair {
    pub a: u8,
    pub b: u8,
    pub observed: u32,
    pub expected: f64,
    pub deviation_percent: f64,
    pub significant: bool,
}

/// Which run the status contract should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSelector {
    Latest,
    Id(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Accepted,
}

/// Immediate answer to a trigger request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerAck {
    pub run_id: i64,
    pub status: AckStatus,
    pub started_at: DateTime<Utc>,
}
