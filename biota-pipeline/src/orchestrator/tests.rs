//! Unit coverage for run policy, timeouts and resumption.
#![expect(clippy::expect_used, reason = "tests should fail fast when setup breaks")]

use std::sync::Arc;
use std::time::Duration;

use biota_core::test_support::{HERRING_GULL, synthetic_observations};
use rstest::{fixture, rstest};

use super::*;
use crate::sink::MemorySink;
use crate::source::Cursor;
use crate::state::{ActivationStore, GenerationStatus, StateError};
use crate::test_support::{
    FailingSource, HeldSource, InterruptedSource, RegistryBuilder, StalledSource, dwc_rows,
    gull_context,
};

struct Pipeline {
    orchestrator: PipelineOrchestrator,
    sink: Arc<MemorySink>,
    state: Arc<StateStore>,
}

impl Pipeline {
    fn new(registry: ProviderRegistry, config: OrchestratorConfig) -> Self {
        let sink = Arc::new(MemorySink::new());
        let state = Arc::new(StateStore::open_in_memory().expect("state store"));
        let orchestrator = PipelineOrchestrator::new(
            config,
            registry,
            gull_context(),
            sink.clone(),
            Arc::clone(&state),
        )
        .expect("valid config");
        Self {
            orchestrator,
            sink,
            state,
        }
    }

    async fn run(&self, mode: RunMode) -> RunReport {
        self.orchestrator
            .start_run(&[], mode)
            .await
            .expect("start run")
            .wait()
            .await
            .expect("run task")
    }

    async fn active_slot(&self) -> InstanceSlot {
        self.state
            .load_activation()
            .await
            .expect("activation")
            .active_slot
    }
}

#[fixture]
fn config() -> OrchestratorConfig {
    OrchestratorConfig::default().with_chunk_size(4)
}

fn generation<'a>(report: &'a RunReport, provider_id: &str) -> &'a ProcessGeneration {
    report
        .generations
        .iter()
        .find(|generation| generation.provider_id == provider_id)
        .expect("generation for provider")
}

#[rstest]
#[tokio::test]
async fn a_full_run_publishes_every_provider(config: OrchestratorConfig) {
    let registry = RegistryBuilder::new()
        .rows("a", true, dwc_rows("a", HERRING_GULL, 5))
        .rows("b", false, dwc_rows("b", HERRING_GULL, 3))
        .build();
    let pipeline = Pipeline::new(registry, config);

    let report = pipeline.run(RunMode::Full).await;

    assert_eq!(
        report.outcome,
        RunOutcome::Swapped {
            active_slot: InstanceSlot::One
        }
    );
    assert_eq!(report.generations.len(), 2);
    assert!(report.generations.iter().all(ProcessGeneration::succeeded));
    assert_eq!(pipeline.active_slot().await, InstanceSlot::One);
    assert_eq!(pipeline.sink.snapshot(InstanceSlot::One).len(), 8);
    let stored = pipeline.state.run(report.run_id).await.expect("run record");
    assert_eq!(stored.outcome.as_deref(), Some("swapped"));
    assert!(stored.finished_at.is_some());
}

#[rstest]
#[tokio::test]
async fn a_full_run_with_a_failure_keeps_the_active_slot(config: OrchestratorConfig) {
    let registry = RegistryBuilder::new()
        .rows("a", false, dwc_rows("a", HERRING_GULL, 5))
        .provider("b", false, Arc::new(FailingSource::new("offline")))
        .build();
    let pipeline = Pipeline::new(registry, config);

    let report = pipeline.run(RunMode::Full).await;

    assert_eq!(
        report.outcome,
        RunOutcome::NotSwapped(NotSwappedReason::PolicyRejected)
    );
    assert_eq!(pipeline.active_slot().await, InstanceSlot::Zero);
    assert!(generation(&report, "a").succeeded());
    assert_eq!(generation(&report, "b").status, GenerationStatus::Failed);
}

#[rstest]
#[tokio::test]
async fn a_partial_run_carries_failed_providers_over(config: OrchestratorConfig) {
    let registry = RegistryBuilder::new()
        .rows("a", true, dwc_rows("a", HERRING_GULL, 5))
        .provider("b", false, Arc::new(FailingSource::new("offline")))
        .build();
    let pipeline = Pipeline::new(registry, config);
    pipeline
        .sink
        .write_batch(synthetic_observations("b", HERRING_GULL, 3), InstanceSlot::Zero)
        .await
        .expect("seed previous generation");

    let report = pipeline.run(RunMode::Partial).await;

    assert!(report.outcome.is_swapped());
    assert_eq!(pipeline.active_slot().await, InstanceSlot::One);
    assert_eq!(
        pipeline
            .sink
            .count(InstanceSlot::One, "b")
            .await
            .expect("count"),
        3
    );
    assert_eq!(
        pipeline
            .sink
            .count(InstanceSlot::One, "a")
            .await
            .expect("count"),
        5
    );
}

#[rstest]
#[case::core_provider_failed(true, true)]
#[case::every_provider_failed(false, false)]
#[tokio::test]
async fn a_partial_run_rejects_unsafe_outcomes(
    config: OrchestratorConfig,
    #[case] failing_is_core: bool,
    #[case] healthy_provider: bool,
) {
    let mut builder =
        RegistryBuilder::new().provider("b", failing_is_core, Arc::new(FailingSource::new("offline")));
    if healthy_provider {
        builder = builder.rows("a", false, dwc_rows("a", HERRING_GULL, 2));
    }
    let pipeline = Pipeline::new(builder.build(), config);

    let report = pipeline.run(RunMode::Partial).await;

    assert_eq!(
        report.outcome,
        RunOutcome::NotSwapped(NotSwappedReason::PolicyRejected)
    );
    assert_eq!(pipeline.active_slot().await, InstanceSlot::Zero);
}

#[rstest]
#[tokio::test]
async fn a_stalled_provider_times_out(config: OrchestratorConfig) {
    let registry = RegistryBuilder::new()
        .rows("a", false, dwc_rows("a", HERRING_GULL, 2))
        .provider("slow", false, Arc::new(StalledSource))
        .build();
    let pipeline = Pipeline::new(
        registry,
        config.with_provider_timeout(Duration::from_millis(50)),
    );

    let report = pipeline.run(RunMode::Full).await;

    assert_eq!(
        report.outcome,
        RunOutcome::NotSwapped(NotSwappedReason::PolicyRejected)
    );
    let slow = generation(&report, "slow");
    assert_eq!(slow.status, GenerationStatus::Failed);
    assert!(
        slow.error
            .as_deref()
            .is_some_and(|error| error.starts_with("timed out")),
        "unexpected error {:?}",
        slow.error
    );
    assert!(generation(&report, "a").succeeded());
}

#[rstest]
#[tokio::test]
async fn a_run_past_its_deadline_is_stopped(config: OrchestratorConfig) {
    let registry = RegistryBuilder::new()
        .provider("slow", false, Arc::new(StalledSource))
        .build();
    let pipeline = Pipeline::new(registry, config.with_run_timeout(Duration::from_millis(50)));

    let report = pipeline.run(RunMode::Partial).await;

    assert_eq!(
        report.outcome,
        RunOutcome::NotSwapped(NotSwappedReason::RunTimedOut)
    );
    let slow = generation(&report, "slow");
    assert_eq!(slow.status, GenerationStatus::Failed);
    assert_eq!(slow.error.as_deref(), Some("run timed out"));
    assert_eq!(pipeline.active_slot().await, InstanceSlot::Zero);
}

#[rstest]
#[tokio::test]
async fn a_cancelled_run_does_not_swap(config: OrchestratorConfig) {
    let registry = RegistryBuilder::new()
        .provider("slow", false, Arc::new(StalledSource))
        .build();
    let pipeline = Pipeline::new(
        registry,
        config.with_provider_timeout(Duration::from_millis(100)),
    );

    let handle = pipeline
        .orchestrator
        .start_run(&[], RunMode::Partial)
        .await
        .expect("start run");
    pipeline.orchestrator.cancel_run(&handle);
    let report = handle.wait().await.expect("run task");

    assert_eq!(
        report.outcome,
        RunOutcome::NotSwapped(NotSwappedReason::Cancelled)
    );
    assert_eq!(pipeline.active_slot().await, InstanceSlot::Zero);
}

#[rstest]
#[tokio::test]
async fn a_second_run_waits_for_the_leased_slot(config: OrchestratorConfig) {
    let source = Arc::new(HeldSource::new(dwc_rows("a", HERRING_GULL, 3)));
    let registry = RegistryBuilder::new()
        .provider("a", false, source.clone())
        .rows("b", false, dwc_rows("b", HERRING_GULL, 2))
        .build();
    let pipeline = Pipeline::new(registry, config);

    let first = pipeline
        .orchestrator
        .start_run(&["a".to_owned()], RunMode::Full)
        .await
        .expect("first run");
    let err = pipeline
        .orchestrator
        .start_run(&["b".to_owned()], RunMode::Full)
        .await
        .expect_err("slot is leased");
    assert!(matches!(
        err,
        OrchestratorError::State(StateError::SlotBusy {
            run_id,
            target_slot: InstanceSlot::One,
        }) if run_id == first.run_id()
    ));

    source.release();
    let report = first.wait().await.expect("first report");
    assert!(report.outcome.is_swapped());
    assert_eq!(pipeline.active_slot().await, InstanceSlot::One);
    assert_eq!(pipeline.sink.count(InstanceSlot::One, "a").await.expect("count"), 3);
    assert_eq!(pipeline.sink.count(InstanceSlot::One, "b").await.expect("count"), 0);

    let next = pipeline.run(RunMode::Full).await;
    assert_eq!(next.target_slot, InstanceSlot::Zero);
    assert!(next.outcome.is_swapped());
    let activation = pipeline.state.load_activation().await.expect("activation");
    assert_eq!(activation.version, 2);
}

#[rstest]
#[tokio::test]
async fn a_partial_run_over_one_provider_keeps_the_others(config: OrchestratorConfig) {
    let registry = RegistryBuilder::new()
        .rows("a", false, dwc_rows("a", HERRING_GULL, 3))
        .rows("b", false, dwc_rows("b", HERRING_GULL, 4))
        .build();
    let pipeline = Pipeline::new(registry, config);
    assert!(pipeline.run(RunMode::Full).await.outcome.is_swapped());

    let report = pipeline
        .orchestrator
        .start_run(&["a".to_owned()], RunMode::Partial)
        .await
        .expect("start partial run")
        .wait()
        .await
        .expect("run task");

    assert!(report.outcome.is_swapped());
    assert_eq!(report.generations.len(), 1);
    assert_eq!(pipeline.active_slot().await, InstanceSlot::Zero);
    for (provider, expected) in [("a", 3), ("b", 4)] {
        assert_eq!(
            pipeline
                .sink
                .count(InstanceSlot::Zero, provider)
                .await
                .expect("count"),
            expected,
            "provider {provider}"
        );
    }
}

#[rstest]
#[tokio::test]
async fn a_resumed_run_continues_from_the_last_cursor(config: OrchestratorConfig) {
    let source = Arc::new(InterruptedSource::new(dwc_rows("r", HERRING_GULL, 10), 4));
    let registry = RegistryBuilder::new()
        .rows("a", false, dwc_rows("a", HERRING_GULL, 2))
        .provider("r", false, source.clone())
        .build();
    let pipeline = Pipeline::new(registry, config);

    let first = pipeline.run(RunMode::Full).await;
    assert_eq!(
        first.outcome,
        RunOutcome::NotSwapped(NotSwappedReason::PolicyRejected)
    );
    assert_eq!(generation(&first, "r").last_cursor, Some(Cursor(4)));
    let finished_a = generation(&first, "a").clone();

    source.disarm();
    let resumed = pipeline
        .orchestrator
        .resume_run(first.run_id)
        .await
        .expect("resume")
        .wait()
        .await
        .expect("run task");

    assert_eq!(resumed.run_id, first.run_id);
    assert!(resumed.outcome.is_swapped());
    assert_eq!(generation(&resumed, "r").public_count, 10);
    assert_eq!(generation(&resumed, "a"), &finished_a);
    assert_eq!(pipeline.sink.snapshot(InstanceSlot::One).len(), 12);
}

#[rstest]
#[tokio::test]
async fn published_or_stale_runs_cannot_resume(config: OrchestratorConfig) {
    let registry = RegistryBuilder::new()
        .rows("a", false, dwc_rows("a", HERRING_GULL, 2))
        .build();
    let pipeline = Pipeline::new(registry, config);

    let published = pipeline.run(RunMode::Full).await;
    let err = pipeline
        .orchestrator
        .resume_run(published.run_id)
        .await
        .expect_err("published run");
    assert!(matches!(err, OrchestratorError::RunAlreadySwapped { .. }));

    let cancelled = pipeline
        .orchestrator
        .start_run(&[], RunMode::Full)
        .await
        .expect("start");
    cancelled.cancel();
    let stale = cancelled.wait().await.expect("report");
    assert_eq!(stale.target_slot, InstanceSlot::Zero);
    assert!(pipeline.run(RunMode::Full).await.outcome.is_swapped());
    let err = pipeline
        .orchestrator
        .resume_run(stale.run_id)
        .await
        .expect_err("stale run");
    assert!(matches!(
        err,
        OrchestratorError::StaleRun {
            target_slot: InstanceSlot::Zero,
            ..
        }
    ));
}

#[rstest]
#[tokio::test]
async fn an_empty_registry_cannot_start_a_run(config: OrchestratorConfig) {
    let pipeline = Pipeline::new(RegistryBuilder::new().build(), config);
    let err = pipeline
        .orchestrator
        .start_run(&[], RunMode::Full)
        .await
        .expect_err("no providers");
    assert!(matches!(err, OrchestratorError::NoProviders));
}

#[rstest]
#[case::no_concurrency(OrchestratorConfig::default().with_max_concurrent_providers(0))]
#[case::no_chunk(OrchestratorConfig::default().with_chunk_size(0))]
#[case::no_time(OrchestratorConfig::default().with_run_timeout(Duration::ZERO))]
fn unusable_limits_are_rejected(#[case] config: OrchestratorConfig) {
    let err = PipelineOrchestrator::new(
        config,
        ProviderRegistry::new(),
        gull_context(),
        Arc::new(MemorySink::new()),
        Arc::new(StateStore::open_in_memory().expect("state store")),
    )
    .expect_err("invalid config");
    assert!(matches!(err, OrchestratorError::InvalidConfig { .. }));
}

#[test]
fn outcomes_render_as_stored_labels() {
    assert_eq!(
        RunOutcome::Swapped {
            active_slot: InstanceSlot::One
        }
        .to_string(),
        "swapped"
    );
    assert_eq!(
        RunOutcome::NotSwapped(NotSwappedReason::LostRace).to_string(),
        "not-swapped: lost-race"
    );
    assert_eq!(
        RunOutcome::NotSwapped(NotSwappedReason::Failed("disk full".to_owned())).to_string(),
        "not-swapped: failed: disk full"
    );
}
