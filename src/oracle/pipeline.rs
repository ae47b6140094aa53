//! Pipeline orchestrator.
//!
//! A run walks the stages POLL, INGEST, ANALYZE, EVALUATE, REWEIGHT and
//! GENERATE in order. Stage errors are classified by [`Severity`]: transient
//! ones mark the stage failed and the run moves on, data-integrity ones are
//! recorded as rejections, and fatal ones abort the run. The execution record
//! is written back after every transition, and at most one run is `running`
//! at any time.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument, warn};

use crate::config::OracleConfig;
use crate::error::{IngestError, PipelineError, Severity, StorageError, ValidationError};
use crate::oracle::analytics::CooccurrenceEngine;
use crate::oracle::data_sources::DrawSource;
use crate::oracle::evaluator::OutcomeEvaluator;
use crate::oracle::poller::{PollOutcome, PollWaker, Poller};
use crate::oracle::schedule::{Clock, DrawSchedule};
use crate::oracle::storage::{DrawInsert, OracleStorage};
use crate::oracle::strategies::{HistoryView, StrategyRegistry};
use crate::oracle::strategy_manager::StrategyManager;
use crate::oracle::types::{
    AckStatus, PipelineExecution, PollingSummary, RunSelector, Stage, TriggerAck,
};
use crate::oracle::weights::AdaptiveWeighting;
use crate::types::{DrawRecord, NumberDomain};

/// Failure reason written on runs found `running` at startup.
pub const RECOVERED_ON_RESTART: &str = "recovered on restart";

/// What a stage reports when it did not fail.
enum StageOutcome {
    Completed(Value),
    Skipped(String),
}

/// State handed from one stage to the next within a run.
#[derive(Default)]
struct RunContext {
    polled: Option<DrawRecord>,
}

/// A triggered run: the immediate acknowledgement and the task executing it.
pub struct RunHandle {
    pub ack: TriggerAck,
    pub completion: JoinHandle<PipelineExecution>,
}

pub struct Orchestrator {
    config: OracleConfig,
    domain: NumberDomain,
    storage: Arc<dyn OracleStorage>,
    source: Arc<dyn DrawSource>,
    clock: Arc<dyn Clock>,
    schedule: DrawSchedule,
    poller: Poller,
    analytics: CooccurrenceEngine,
    weighting: AdaptiveWeighting,
    evaluator: OutcomeEvaluator,
    registry: Arc<StrategyRegistry>,
    manager: StrategyManager,
    start_lock: Mutex<()>,
}

impl Orchestrator {
    /// Validate `config` and wire up every stage.
    pub fn new(
        config: OracleConfig,
        storage: Arc<dyn OracleStorage>,
        source: Arc<dyn DrawSource>,
        registry: StrategyRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        if registry.is_empty() {
            return Err(PipelineError::NoStrategies);
        }

        let domain = config.number_domain()?;
        let schedule = DrawSchedule::from_config(&config.schedule);
        let poller = Poller::from_config(&config.polling, source.clone(), schedule.clone(), clock.clone());
        let analytics = CooccurrenceEngine::new(
            domain.primary_max(),
            config.analytics.significance_threshold_percent,
        );
        let weighting = AdaptiveWeighting::from_config(&config.weighting);
        let evaluator = OutcomeEvaluator::new(config.prizes.clone());
        let registry = Arc::new(registry);
        let manager = StrategyManager::new(registry.clone(), &config.generation);

        Ok(Self {
            config,
            domain,
            storage,
            source,
            clock,
            schedule,
            poller,
            analytics,
            weighting,
            evaluator,
            registry,
            manager,
            start_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn OracleStorage> {
        &self.storage
    }

    /// Handle that cuts the current poll interval short.
    pub fn poll_waker(&self) -> PollWaker {
        self.poller.waker()
    }

    /// Startup housekeeping: fail runs left `running` by a previous process and
    /// make sure every registered strategy has a performance row. Returns the
    /// ids of the recovered runs.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<Vec<i64>, PipelineError> {
        let now = self.clock.now();
        let recovered = self.storage.fail_running_executions(RECOVERED_ON_RESTART, now).await?;
        for id in &recovered {
            warn!("Run {} was still running at startup, marked failed", id);
        }

        let names = self.registry.names();
        self.weighting.initialize(self.storage.as_ref(), &names, now).await?;
        info!("Orchestrator ready with {} strategies", names.len());
        Ok(recovered)
    }

    /// Register a new run, refusing if another one is in progress.
    async fn start(&self) -> Result<(i64, PipelineExecution), PipelineError> {
        let _guard = self.start_lock.lock().await;

        if let Some(running) = self.storage.running_execution().await? {
            let run_id = running.id.unwrap_or_default();
            warn!("Refusing to start: run {} is still running", run_id);
            return Err(PipelineError::AlreadyRunning { run_id });
        }

        let mut execution = PipelineExecution::new(self.clock.now());
        let run_id = match self.storage.begin_execution(&execution).await {
            Ok(id) => id,
            Err(StorageError::RunAlreadyActive { run_id }) => {
                return Err(PipelineError::AlreadyRunning {
                    run_id: run_id.unwrap_or_default(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        execution.id = Some(run_id);
        info!("Run {} started", run_id);
        Ok((run_id, execution))
    }

    /// Execute a run in the caller's task and return its final record.
    pub async fn run_now(&self) -> Result<PipelineExecution, PipelineError> {
        let (_, execution) = self.start().await?;
        Ok(self.execute(execution).await)
    }

    /// Start a run in the background and acknowledge it immediately.
    pub async fn trigger(self: &Arc<Self>) -> Result<RunHandle, PipelineError> {
        let (run_id, execution) = self.start().await?;
        let ack = TriggerAck {
            run_id,
            status: AckStatus::Accepted,
            started_at: execution.started_at,
        };

        let this = Arc::clone(self);
        let completion = tokio::spawn(async move { this.execute(execution).await });
        Ok(RunHandle { ack, completion })
    }

    /// Trigger a run on every tick of `every` until `shutdown` resolves.
    ///
    /// Ticks that find a run still in progress are skipped. On shutdown the
    /// run in flight is awaited, so no stage is cut off halfway. Returns the
    /// last run started, if any.
    pub async fn run_every<F>(self: &Arc<Self>, every: std::time::Duration, shutdown: F) -> Option<PipelineExecution>
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        let mut in_flight: Option<JoinHandle<PipelineExecution>> = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => match self.trigger().await {
                    Ok(handle) => {
                        info!("Run {} accepted", handle.ack.run_id);
                        in_flight = Some(handle.completion);
                    }
                    Err(PipelineError::AlreadyRunning { run_id }) => {
                        warn!("Run {} still in progress, skipping this tick", run_id)
                    }
                    Err(e) => error!("Could not start run: {}", e),
                },
                _ = &mut shutdown => break,
            }
        }

        let handle = in_flight?;
        info!("Waiting for the current run to finish");
        match handle.await {
            Ok(execution) => Some(execution),
            Err(e) => {
                error!("Run task ended abnormally: {}", e);
                None
            }
        }
    }

    /// Current state of a run.
    pub async fn status(&self, selector: RunSelector) -> Result<Option<PipelineExecution>, PipelineError> {
        let execution = match selector {
            RunSelector::Latest => self.storage.latest_execution().await?,
            RunSelector::Id(id) => self.storage.execution(id).await?,
        };
        Ok(execution)
    }

    /// Most recent runs, newest first.
    pub async fn history(&self, limit: u32) -> Result<Vec<PipelineExecution>, PipelineError> {
        Ok(self.storage.recent_executions(limit).await?)
    }

    async fn persist(&self, execution: &PipelineExecution) -> Result<(), StorageError> {
        self.storage.update_execution(execution).await
    }

    /// Abort with `reason` and make a best effort to record it.
    async fn abort(&self, mut execution: PipelineExecution, reason: &str) -> PipelineExecution {
        error!("Run {:?} aborted: {}", execution.id, reason);
        execution.abort(reason, self.clock.now());
        if let Err(e) = self.persist(&execution).await {
            error!("Could not record aborted run {:?}: {}", execution.id, e);
        }
        execution
    }

    /// Fatal conditions checked before any stage runs.
    async fn preflight(&self) -> Result<(), PipelineError> {
        match self.storage.health_check().await {
            Ok(true) => {}
            Ok(false) | Err(_) => return Err(PipelineError::StoreUnavailable),
        }
        self.source.check_credentials()?;
        Ok(())
    }

    #[instrument(skip(self, execution), fields(run_id = ?execution.id))]
    async fn execute(&self, mut execution: PipelineExecution) -> PipelineExecution {
        if let Err(e) = self.preflight().await {
            return self.abort(execution, &e.to_string()).await;
        }

        let mut context = RunContext::default();
        for stage in Stage::all() {
            execution.begin_stage(stage);
            if let Err(e) = self.persist(&execution).await {
                return self.abort(execution, &PipelineError::from(e).to_string()).await;
            }

            let result = match stage {
                Stage::Poll => self.poll_stage(&mut context, &mut execution).await,
                Stage::Ingest => self.ingest_stage(&mut context).await,
                Stage::Analyze => self.analyze_stage().await,
                Stage::Evaluate => self.evaluate_stage().await,
                Stage::Reweight => self.reweight_stage().await,
                Stage::Generate => self.generate_stage(&mut execution).await,
            };

            match result {
                Ok(StageOutcome::Completed(detail)) => {
                    info!("Stage {} completed", stage);
                    execution.complete_stage(stage, detail);
                }
                Ok(StageOutcome::Skipped(reason)) => {
                    info!("Stage {} skipped: {}", stage, reason);
                    execution.skip_stage(stage, &reason);
                }
                Err(e) => match e.severity() {
                    Severity::DataIntegrity => {
                        warn!("Stage {} rejected a record: {}", stage, e);
                        execution.record_rejection(stage, &e.to_string());
                        execution.complete_stage(stage, json!({ "rejected": e.to_string() }));
                    }
                    Severity::Transient => {
                        warn!("Stage {} failed, continuing: {}", stage, e);
                        execution.fail_stage(stage, Severity::Transient, &e.to_string());
                    }
                    Severity::Fatal => {
                        execution.fail_stage(stage, Severity::Fatal, &e.to_string());
                        return self.abort(execution, &e.to_string()).await;
                    }
                },
            }

            if let Err(e) = self.persist(&execution).await {
                return self.abort(execution, &PipelineError::from(e).to_string()).await;
            }
        }

        execution.finish(self.clock.now());
        if let Err(e) = self.persist(&execution).await {
            error!("Could not record finished run {:?}: {}", execution.id, e);
        }
        info!("Run {:?} finished: {}", execution.id, execution.status);
        execution
    }

    async fn poll_stage(
        &self,
        context: &mut RunContext,
        execution: &mut PipelineExecution,
    ) -> Result<StageOutcome, PipelineError> {
        if !self.config.polling.enabled {
            execution.polling = Some(PollingSummary::disabled(self.clock.now()));
            return Ok(StageOutcome::Skipped("polling disabled".into()));
        }

        let latest = self.storage.latest_draw().await?.map(|d| d.draw_date);
        let expected = self.schedule.expected_after(latest, self.clock.now());
        let report = self.poller.poll(expected).await;
        execution.polling = Some(report.summary());

        match report.outcome {
            PollOutcome::Found(draw) => {
                context.polled = Some(draw);
                Ok(StageOutcome::Completed(json!({
                    "result": "found",
                    "expected": expected,
                    "attempts": report.attempts,
                })))
            }
            PollOutcome::NotYetDue { available_at } => Ok(StageOutcome::Completed(json!({
                "result": "not_yet_due",
                "expected": expected,
                "available_at": available_at,
            }))),
            PollOutcome::Rejected { reason } => Err(IngestError::Rejected {
                provider: self.source.name().to_string(),
                reason,
            }
            .into()),
            PollOutcome::TimedOut => Err(PipelineError::PollTimedOut {
                expected,
                attempts: report.attempts,
                elapsed_seconds: report.elapsed.as_secs_f64(),
            }),
        }
    }

    async fn ingest_stage(&self, context: &mut RunContext) -> Result<StageOutcome, PipelineError> {
        let draw = match context.polled.take() {
            Some(draw) => draw,
            None => match self.source.fetch_latest().await? {
                Some(draw) => draw,
                None => {
                    return Ok(StageOutcome::Completed(json!({ "result": "nothing_published" })));
                }
            },
        };

        let draw = draw.revalidate(&self.domain)?;
        let result = match self.storage.upsert_draw(&draw, &self.domain).await? {
            DrawInsert::Inserted => "inserted",
            DrawInsert::Unchanged => "unchanged",
            DrawInsert::SecondaryCorrected { previous } => {
                warn!(
                    "Draw {} secondary corrected from {} to {}",
                    draw.draw_date, previous, draw.secondary
                );
                "secondary_corrected"
            }
            DrawInsert::Conflicting => {
                return Err(ValidationError::ConflictingDraw { date: draw.draw_date }.into());
            }
        };

        Ok(StageOutcome::Completed(json!({
            "result": result,
            "draw_date": draw.draw_date,
            "era": draw.era,
        })))
    }

    async fn analyze_stage(&self) -> Result<StageOutcome, PipelineError> {
        let summary = self.analytics.run(self.storage.as_ref()).await?;
        Ok(StageOutcome::Completed(to_detail(&summary)?))
    }

    async fn evaluate_stage(&self) -> Result<StageOutcome, PipelineError> {
        let summary = self.evaluator.run(self.storage.as_ref(), self.clock.now()).await?;
        Ok(StageOutcome::Completed(to_detail(&summary)?))
    }

    async fn reweight_stage(&self) -> Result<StageOutcome, PipelineError> {
        let rows = self.weighting.reweight(self.storage.as_ref(), self.clock.now()).await?;
        let weights: BTreeMap<&str, f64> = rows.iter().map(|r| (r.strategy.as_str(), r.weight)).collect();
        Ok(StageOutcome::Completed(json!({ "weights": weights })))
    }

    /// The draw the next batch is for: the first scheduled draw after the
    /// latest stored one, never earlier than today.
    pub fn generation_target(&self, latest: Option<NaiveDate>, now: DateTime<Utc>) -> NaiveDate {
        let yesterday = now.date_naive() - ChronoDuration::days(1);
        let after = latest.map_or(yesterday, |date| date.max(yesterday));
        self.schedule.next_draw_after(after)
    }

    async fn generate_stage(&self, execution: &mut PipelineExecution) -> Result<StageOutcome, PipelineError> {
        let now = self.clock.now();
        let latest = self.storage.latest_draw().await?.map(|d| d.draw_date);
        let target = self.generation_target(latest, now);

        let existing = self.storage.tickets_for(target).await?;
        if !existing.is_empty() {
            return Ok(StageOutcome::Skipped(format!(
                "{} tickets for {} already exist",
                existing.len(),
                target
            )));
        }

        let draws = self.storage.all_draws().await?;
        let pairs = self.storage.pairs().await?;
        // Strategies without a row yet start from the untested defaults.
        let performance = self
            .weighting
            .initialize(self.storage.as_ref(), &self.registry.names(), now)
            .await?;
        let history = HistoryView::new(&draws, &self.domain, &pairs);

        let batch = {
            let mut rng = match self.config.generation.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            self.manager.generate(&history, &performance, target, now, &mut rng)?
        };
        for reason in &batch.report.rejected {
            execution.record_rejection(Stage::Generate, reason);
        }

        let ids = self.storage.insert_tickets(&batch.tickets).await?;
        info!("Stored {} tickets for the draw on {}", ids.len(), target);
        Ok(StageOutcome::Completed(json!({
            "target_date": target,
            "tickets": ids.len(),
            "allocation": batch.report.allocation,
            "fallbacks": batch.report.fallbacks,
            "secondary_rerolls": batch.report.secondary_rerolls,
        })))
    }
}

fn to_detail<T: serde::Serialize>(value: &T) -> Result<Value, PipelineError> {
    serde_json::to_value(value).map_err(|e| StorageError::from(e).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::data_sources::StaticDrawSource;
    use crate::oracle::schedule::FixedClock;
    use crate::oracle::sqlite_ledger::SqliteLedger;
    use crate::oracle::types::{RunStatus, StageStatus};
    use chrono::TimeZone;

    async fn orchestrator(now: DateTime<Utc>, polling: bool) -> (Orchestrator, Arc<StaticDrawSource>) {
        let mut config = OracleConfig::default();
        config.polling.enabled = polling;
        config.generation.seed = Some(42);
        let ledger = SqliteLedger::in_memory().await.unwrap();
        let source = Arc::new(StaticDrawSource::new());
        let orchestrator = Orchestrator::new(
            config,
            ledger,
            source.clone(),
            StrategyRegistry::standard(),
            Arc::new(FixedClock::new(now)),
        )
        .unwrap();
        (orchestrator, source)
    }

    #[tokio::test]
    async fn test_generation_target_never_in_the_past() {
        let now = Utc.with_ymd_and_hms(2024, 3, 7, 12, 0, 0).unwrap();
        let (orchestrator, _) = orchestrator(now, false).await;
        let old = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        // Thursday: the next draw is Saturday the 9th
        assert_eq!(
            orchestrator.generation_target(Some(old), now),
            NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()
        );
        let recent = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(
            orchestrator.generation_target(Some(recent), now),
            NaiveDate::from_ymd_opt(2024, 3, 11).unwrap()
        );
    }

    #[tokio::test]
    async fn test_full_run_with_polling_disabled() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
        let (orchestrator, source) = orchestrator(now, false).await;
        let draw = DrawRecord::new(
            NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            &[3, 14, 15, 35, 65],
            9,
            &orchestrator.domain,
        )
        .unwrap();
        source.publish(draw).await;
        orchestrator.initialize().await.unwrap();

        let run = orchestrator.run_now().await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.stage_status(Stage::Poll), StageStatus::Skipped);
        assert_eq!(run.polling.as_ref().map(|p| p.enabled), Some(false));
        assert_eq!(run.metadata["ingest"]["detail"]["result"], "inserted");

        let target = NaiveDate::from_ymd_opt(2024, 3, 6).unwrap();
        let tickets = orchestrator.storage().tickets_for(target).await.unwrap();
        assert_eq!(tickets.len(), 10);

        // A second run does not generate a second batch for the same draw.
        let again = orchestrator.run_now().await.unwrap();
        assert_eq!(again.stage_status(Stage::Generate), StageStatus::Skipped);
        assert_eq!(orchestrator.storage().tickets_for(target).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_conflicting_draw_is_rejected_not_failed() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
        let (orchestrator, source) = orchestrator(now, false).await;
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let stored = DrawRecord::new(date, &[1, 2, 3, 4, 5], 9, &orchestrator.domain).unwrap();
        orchestrator
            .storage()
            .upsert_draw(&stored, &orchestrator.domain)
            .await
            .unwrap();
        source
            .publish(DrawRecord::new(date, &[6, 7, 8, 9, 10], 9, &orchestrator.domain).unwrap())
            .await;

        let run = orchestrator.run_now().await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.stage_status(Stage::Ingest), StageStatus::Completed);
        assert_eq!(run.metadata["ingest_rejections"].as_array().unwrap().len(), 1);
        let kept = orchestrator.storage().draw_by_date(date).await.unwrap().unwrap();
        assert_eq!(kept.primaries, [1, 2, 3, 4, 5]);
    }
}
