//! End-to-end tests for the pipeline orchestrator

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use draw_oracle::error::{ConfigError, IngestError, PipelineError, ValidationError};
use draw_oracle::oracle::storage::{DrawStorage, ExecutionLog, StrategyStorage, TicketStorage};
use draw_oracle::oracle::{
    DrawSource, FixedClock, OracleBuilder, Orchestrator, PipelineExecution, PollResultKind, RunSelector,
    RunStatus, SqliteLedger, Stage, StageStatus, StaticDrawSource, RECOVERED_ON_RESTART,
};
use draw_oracle::types::{DrawRecord, NumberDomain};
use draw_oracle::OracleConfig;
use std::sync::Arc;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

fn domain() -> NumberDomain {
    OracleConfig::default().number_domain().unwrap()
}

fn draw(on: NaiveDate, primaries: [u8; 5], secondary: u8) -> DrawRecord {
    DrawRecord::new(on, &primaries, secondary, &domain()).unwrap()
}

struct Harness {
    orchestrator: Orchestrator,
    ledger: Arc<SqliteLedger>,
    source: Arc<StaticDrawSource>,
    clock: Arc<FixedClock>,
}

async fn harness(builder: OracleBuilder, now: DateTime<Utc>) -> Harness {
    let ledger = SqliteLedger::in_memory().await.unwrap();
    let source = Arc::new(StaticDrawSource::new());
    let clock = Arc::new(FixedClock::new(now));
    let orchestrator = builder
        .with_seed(7)
        .with_clock(clock.clone())
        .build(ledger.clone(), source.clone())
        .expect("Failed to build orchestrator");
    Harness {
        orchestrator,
        ledger,
        source,
        clock,
    }
}

/// Source whose credential is never configured.
struct LockedSource;

#[async_trait]
impl DrawSource for LockedSource {
    fn name(&self) -> &str {
        "locked"
    }

    async fn fetch_latest(&self) -> Result<Option<DrawRecord>, IngestError> {
        Ok(None)
    }

    async fn fetch_by_date(&self, _date: NaiveDate) -> Result<Option<DrawRecord>, IngestError> {
        Ok(None)
    }

    fn check_credentials(&self) -> Result<(), ConfigError> {
        Err(ConfigError::MissingCredential {
            provider: "locked".into(),
            env_var: "LOCKED_TOKEN".into(),
        })
    }
}

#[tokio::test]
async fn test_not_yet_due_poll_completes_instantly_and_ingest_runs() {
    // Monday noon: Monday's draw is not published until Tuesday 04:00
    let h = harness(OracleBuilder::new(), at(2024, 3, 4, 12)).await;
    let saturday = draw(date(2024, 3, 2), [4, 8, 15, 16, 23], 12);
    h.ledger.upsert_draw(&saturday, &domain()).await.unwrap();
    h.source.publish(saturday).await;
    h.orchestrator.initialize().await.unwrap();

    let started = std::time::Instant::now();
    let run = h.orchestrator.run_now().await.unwrap();
    assert!(started.elapsed() < std::time::Duration::from_secs(10));

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.stage_status(Stage::Poll), StageStatus::Completed);
    assert_eq!(run.stage_status(Stage::Ingest), StageStatus::Completed);
    let polling = run.polling.clone().unwrap();
    assert_eq!(polling.result, PollResultKind::NotYetDue);
    assert_eq!(polling.attempts, 0);
    assert_eq!(polling.expected_date, Some(date(2024, 3, 4)));
    assert_eq!(run.metadata["ingest"]["detail"]["result"], "unchanged");
}

#[tokio::test]
async fn test_polled_draw_is_ingested() {
    let h = harness(OracleBuilder::new(), at(2024, 3, 5, 12)).await;
    h.ledger
        .upsert_draw(&draw(date(2024, 3, 2), [4, 8, 15, 16, 23], 12), &domain())
        .await
        .unwrap();
    h.source.publish(draw(date(2024, 3, 4), [3, 14, 15, 35, 65], 9)).await;

    let run = h.orchestrator.run_now().await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    let polling = run.polling.unwrap();
    assert_eq!(polling.result, PollResultKind::Found);
    assert_eq!(polling.attempts, 1);
    assert_eq!(run.metadata["ingest"]["detail"]["result"], "inserted");
    assert!(h.ledger.draw_by_date(date(2024, 3, 4)).await.unwrap().is_some());
}

/// Source that answers with a corrupt record for the awaited draw.
struct CorruptFeedSource {
    latest: DrawRecord,
}

#[async_trait]
impl DrawSource for CorruptFeedSource {
    fn name(&self) -> &str {
        "corrupt-feed"
    }

    async fn fetch_latest(&self) -> Result<Option<DrawRecord>, IngestError> {
        Ok(Some(self.latest.clone()))
    }

    async fn fetch_by_date(&self, _date: NaiveDate) -> Result<Option<DrawRecord>, IngestError> {
        Err(ValidationError::DuplicatePrimary(4).into())
    }
}

#[tokio::test]
async fn test_corrupt_polled_record_is_rejected_without_waiting() {
    let ledger = SqliteLedger::in_memory().await.unwrap();
    let saturday = draw(date(2024, 3, 2), [4, 8, 15, 16, 23], 12);
    ledger.upsert_draw(&saturday, &domain()).await.unwrap();
    let orchestrator = OracleBuilder::new()
        .with_seed(7)
        .with_clock(Arc::new(FixedClock::new(at(2024, 3, 5, 12))))
        .build(ledger.clone(), Arc::new(CorruptFeedSource { latest: saturday }))
        .unwrap();

    let started = std::time::Instant::now();
    let run = orchestrator.run_now().await.unwrap();
    assert!(started.elapsed() < std::time::Duration::from_secs(10));

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.stage_status(Stage::Poll), StageStatus::Completed);
    assert_eq!(run.metadata["poll_rejections"].as_array().unwrap().len(), 1);
    let polling = run.polling.unwrap();
    assert_eq!(polling.result, PollResultKind::Rejected);
    assert_eq!(polling.attempts, 1);
    // INGEST still made its direct attempt.
    assert_eq!(run.metadata["ingest"]["detail"]["result"], "unchanged");
}

#[tokio::test]
async fn test_run_without_initialize_seeds_strategy_rows() {
    let h = harness(OracleBuilder::new().with_polling(false), at(2024, 3, 5, 12)).await;
    h.source.publish(draw(date(2024, 3, 4), [3, 14, 15, 35, 65], 9)).await;

    let run = h.orchestrator.run_now().await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);

    let base = OracleConfig::default().weighting.confidence_base;
    let tickets = h.ledger.tickets_for(date(2024, 3, 6)).await.unwrap();
    assert_eq!(tickets.len(), 10);
    assert!(tickets.iter().all(|t| (t.confidence - base).abs() < 1e-12));
    assert_eq!(h.ledger.load_performance().await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_poll_timeout_is_not_fatal() {
    // Interval 1s, ceiling 2s: the expected Monday draw never shows up.
    let h = harness(
        OracleBuilder::new().with_poll_timing(1, 2, 1800),
        at(2024, 3, 10, 12),
    )
    .await;
    let saturday = draw(date(2024, 3, 2), [4, 8, 15, 16, 23], 12);
    h.ledger.upsert_draw(&saturday, &domain()).await.unwrap();
    h.source.publish(saturday).await;

    let run = h.orchestrator.run_now().await.unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.stage_status(Stage::Poll), StageStatus::Failed);
    assert_eq!(run.metadata["poll"]["severity"], "transient");
    // INGEST still made its direct attempt.
    assert_eq!(run.stage_status(Stage::Ingest), StageStatus::Completed);
    assert_eq!(run.stage_status(Stage::Generate), StageStatus::Completed);

    let polling = run.polling.unwrap();
    assert_eq!(polling.result, PollResultKind::TimedOut);
    assert!(polling.attempts >= 2);
    assert!(polling.elapsed_seconds < 1800.0);
}

#[tokio::test]
async fn test_second_start_is_refused_while_running() {
    let h = harness(OracleBuilder::new().with_polling(false), at(2024, 3, 5, 12)).await;
    let in_progress = PipelineExecution::new(at(2024, 3, 5, 11));
    let run_id = h.ledger.begin_execution(&in_progress).await.unwrap();
    let before = h.ledger.execution(run_id).await.unwrap();

    let err = h.orchestrator.run_now().await.unwrap_err();
    assert!(matches!(err, PipelineError::AlreadyRunning { run_id: id } if id == run_id));

    let orchestrator = Arc::new(h.orchestrator);
    assert!(matches!(
        orchestrator.trigger().await,
        Err(PipelineError::AlreadyRunning { .. })
    ));

    let after = h.ledger.execution(run_id).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(h.ledger.recent_executions(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_stuck_run_recovered_at_initialization() {
    let h = harness(OracleBuilder::new().with_polling(false), at(2024, 3, 5, 12)).await;
    let stuck = h
        .ledger
        .begin_execution(&PipelineExecution::new(at(2024, 3, 4, 3)))
        .await
        .unwrap();

    let recovered = h.orchestrator.initialize().await.unwrap();
    assert_eq!(recovered, vec![stuck]);

    let record = h.orchestrator.status(RunSelector::Id(stuck)).await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.failure_reason.as_deref(), Some(RECOVERED_ON_RESTART));

    let run = h.orchestrator.run_now().await.unwrap();
    assert!(run.status.is_terminal());
    let latest = h.orchestrator.status(RunSelector::Latest).await.unwrap().unwrap();
    assert_eq!(latest.id, run.id);
}

#[tokio::test]
async fn test_unreachable_source_gives_partial_run() {
    let h = harness(OracleBuilder::new().with_polling(false), at(2024, 3, 5, 12)).await;
    h.source.set_unreachable(true);
    h.orchestrator.initialize().await.unwrap();

    let run = h.orchestrator.run_now().await.unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.stage_status(Stage::Poll), StageStatus::Skipped);
    assert_eq!(run.stage_status(Stage::Ingest), StageStatus::Failed);
    assert_eq!(run.metadata["ingest"]["severity"], "transient");
    for stage in [Stage::Analyze, Stage::Evaluate, Stage::Reweight, Stage::Generate] {
        assert_eq!(run.stage_status(stage), StageStatus::Completed, "stage {}", stage);
    }
    assert!(run.failure_reason.is_none());

    let stored = h.orchestrator.status(RunSelector::Latest).await.unwrap().unwrap();
    assert_eq!(stored.id, run.id);
    assert_eq!(stored.status, RunStatus::Partial);
    assert_eq!(stored.stages, run.stages);
    assert_eq!(stored.metadata["ingest"]["error"], run.metadata["ingest"]["error"]);
}

#[tokio::test]
async fn test_missing_credential_fails_run() {
    let ledger = SqliteLedger::in_memory().await.unwrap();
    let orchestrator = OracleBuilder::new()
        .with_polling(false)
        .with_clock(Arc::new(FixedClock::new(at(2024, 3, 5, 12))))
        .build(ledger.clone(), Arc::new(LockedSource))
        .unwrap();

    let run = orchestrator.run_now().await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.failure_reason.as_deref().unwrap().contains("LOCKED_TOKEN"));
    assert!(run.stages.values().all(|s| *s == StageStatus::Pending));
    assert!(ledger.running_execution().await.unwrap().is_none());
}

#[tokio::test]
async fn test_trigger_acknowledges_before_completion() {
    let h = harness(OracleBuilder::new().with_polling(false), at(2024, 3, 5, 12)).await;
    h.source.publish(draw(date(2024, 3, 4), [3, 14, 15, 35, 65], 9)).await;
    let orchestrator = Arc::new(h.orchestrator);
    orchestrator.initialize().await.unwrap();

    let handle = orchestrator.trigger().await.unwrap();
    let ack = handle.ack.clone();
    let finished = handle.completion.await.unwrap();

    assert_eq!(finished.id, Some(ack.run_id));
    assert_eq!(finished.started_at, ack.started_at);
    assert_eq!(finished.status, RunStatus::Succeeded);
    let stored = orchestrator.status(RunSelector::Id(ack.run_id)).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_tickets_are_evaluated_on_the_next_run() {
    let h = harness(OracleBuilder::new().with_polling(false), at(2024, 3, 5, 12)).await;
    h.source.publish(draw(date(2024, 3, 4), [3, 14, 15, 35, 65], 9)).await;
    h.orchestrator.initialize().await.unwrap();

    let first = h.orchestrator.run_now().await.unwrap();
    assert_eq!(first.metadata["generate"]["detail"]["target_date"], "2024-03-06");
    let tickets = h.ledger.tickets_for(date(2024, 3, 6)).await.unwrap();
    assert_eq!(tickets.len(), 10);
    assert!(tickets.iter().all(|t| t.evaluation.is_none()));

    h.clock.set(at(2024, 3, 7, 12));
    h.source.publish(draw(date(2024, 3, 6), [1, 2, 3, 4, 5], 6)).await;
    let second = h.orchestrator.run_now().await.unwrap();
    assert_eq!(second.status, RunStatus::Succeeded);
    assert_eq!(second.metadata["evaluate"]["detail"]["evaluated"], 10);

    let tickets = h.ledger.tickets_for(date(2024, 3, 6)).await.unwrap();
    assert!(tickets.iter().all(|t| t.evaluation.is_some()));
    let plays: u64 = h.ledger.load_performance().await.unwrap().iter().map(|p| p.plays).sum();
    assert_eq!(plays, 10);

    let weights: f64 = h.ledger.load_performance().await.unwrap().iter().map(|p| p.weight).sum();
    assert!((weights - 1.0).abs() < 1e-9);
    assert_eq!(h.ledger.tickets_for(date(2024, 3, 9)).await.unwrap().len(), 10);
}

/// Source that takes a while to answer.
struct SlowSource {
    latest: DrawRecord,
}

#[async_trait]
impl DrawSource for SlowSource {
    fn name(&self) -> &str {
        "slow"
    }

    async fn fetch_latest(&self) -> Result<Option<DrawRecord>, IngestError> {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        Ok(Some(self.latest.clone()))
    }

    async fn fetch_by_date(&self, _date: NaiveDate) -> Result<Option<DrawRecord>, IngestError> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_scheduled_runs_finish_the_run_in_flight_on_shutdown() {
    let ledger = SqliteLedger::in_memory().await.unwrap();
    let orchestrator = Arc::new(
        OracleBuilder::new()
            .with_polling(false)
            .with_seed(7)
            .with_clock(Arc::new(FixedClock::new(at(2024, 3, 5, 12))))
            .build(
                ledger.clone(),
                Arc::new(SlowSource {
                    latest: draw(date(2024, 3, 4), [3, 14, 15, 35, 65], 9),
                }),
            )
            .unwrap(),
    );
    orchestrator.initialize().await.unwrap();

    // Shutdown arrives while the first run is still inside INGEST.
    let shutdown = tokio::time::sleep(std::time::Duration::from_millis(50));
    let last = orchestrator
        .run_every(std::time::Duration::from_secs(3600), shutdown)
        .await
        .expect("a run was started");

    assert_eq!(last.status, RunStatus::Succeeded);
    assert!(ledger.running_execution().await.unwrap().is_none());
    let stored = orchestrator.status(RunSelector::Latest).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Succeeded);
    assert!(stored.completed_at.is_some());
}
