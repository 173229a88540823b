//! Behavioural tests for run policies and the slot swap.
#![expect(clippy::expect_used, reason = "tests should fail fast when setup breaks")]

use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use biota_core::test_support::{HERRING_GULL, synthetic_observations};
use biota_pipeline::test_support::{
    FailingSource, HeldSource, InterruptedSource, RegistryBuilder, dwc_rows, gull_context,
};
use biota_pipeline::{
    ActivationStore, BatchSink, BatchSource, InstanceSlot, MemorySink, MemorySource,
    OrchestratorConfig, OrchestratorError, PipelineOrchestrator, ProcessGeneration, RunId,
    RunMode, RunOutcome, RunReport, StateError, StateStore,
};
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use tokio::runtime::Runtime;

struct PublicationWorld {
    runtime: Runtime,
    sink: Arc<MemorySink>,
    state: Arc<StateStore>,
    providers: RefCell<Vec<(String, bool, Arc<dyn BatchSource>)>>,
    held: RefCell<Vec<Arc<HeldSource>>>,
    interrupted: RefCell<Vec<Arc<InterruptedSource>>>,
    reports: RefCell<Vec<RunReport>>,
    refusals: RefCell<Vec<OrchestratorError>>,
}

impl PublicationWorld {
    fn add(&self, core: bool, source: Arc<dyn BatchSource>) -> String {
        let mut providers = self.providers.borrow_mut();
        let id = format!("p{}", providers.len());
        providers.push((id.clone(), core, source));
        id
    }

    fn orchestrator(&self) -> PipelineOrchestrator {
        let registry = self
            .providers
            .borrow()
            .iter()
            .fold(RegistryBuilder::new(), |builder, (id, core, source)| {
                builder.provider(id, *core, Arc::clone(source))
            })
            .build();
        PipelineOrchestrator::new(
            OrchestratorConfig::default().with_chunk_size(4),
            registry,
            gull_context(),
            self.sink.clone(),
            Arc::clone(&self.state),
        )
        .expect("valid configuration")
    }

    fn last_outcome(&self) -> RunOutcome {
        self.reports
            .borrow()
            .last()
            .map(|report| report.outcome.clone())
            .expect("a run has finished")
    }

    fn run(&self, selection: &[String], mode: RunMode) {
        let orchestrator = self.orchestrator();
        let report = self.runtime.block_on(async {
            orchestrator
                .start_run(selection, mode)
                .await
                .expect("start run")
                .wait()
                .await
                .expect("run task")
        });
        self.reports.borrow_mut().push(report);
    }
}

fn slot(number: u8) -> InstanceSlot {
    InstanceSlot::from_i64(i64::from(number)).expect("slot 0 or 1")
}

#[fixture]
fn world() -> PublicationWorld {
    PublicationWorld {
        runtime: tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("tokio runtime"),
        sink: Arc::new(MemorySink::new()),
        state: Arc::new(StateStore::open_in_memory().expect("state store")),
        providers: RefCell::new(Vec::new()),
        held: RefCell::new(Vec::new()),
        interrupted: RefCell::new(Vec::new()),
        reports: RefCell::new(Vec::new()),
        refusals: RefCell::new(Vec::new()),
    }
}

#[given("a healthy provider with {count} records")]
fn given_healthy(world: &PublicationWorld, count: usize) {
    let rows = dwc_rows(&format!("h{}", world.providers.borrow().len()), HERRING_GULL, count);
    world.add(false, Arc::new(MemorySource::new(rows)));
}

#[given("a healthy core provider with {count} records")]
fn given_healthy_core(world: &PublicationWorld, count: usize) {
    let rows = dwc_rows(&format!("c{}", world.providers.borrow().len()), HERRING_GULL, count);
    world.add(true, Arc::new(MemorySource::new(rows)));
}

#[given("a failing provider whose previous generation holds {count} records")]
fn given_failing_with_history(world: &PublicationWorld, count: usize) {
    let id = world.add(false, Arc::new(FailingSource::new("harvest unavailable")));
    world
        .runtime
        .block_on(
            world
                .sink
                .write_batch(synthetic_observations(&id, HERRING_GULL, count), InstanceSlot::Zero),
        )
        .expect("seed previous generation");
}

#[given("a failing core provider")]
fn given_failing_core(world: &PublicationWorld) {
    world.add(true, Arc::new(FailingSource::new("harvest unavailable")));
}

#[given("a held provider with {count} records")]
fn given_held(world: &PublicationWorld, count: usize) {
    let source = Arc::new(HeldSource::new(dwc_rows("held", HERRING_GULL, count)));
    world.held.borrow_mut().push(Arc::clone(&source));
    world.add(false, source);
}

#[given("a provider with {count} records that fails from offset {offset}")]
fn given_interrupted(world: &PublicationWorld, count: usize, offset: u64) {
    let source = Arc::new(InterruptedSource::new(
        dwc_rows("interrupted", HERRING_GULL, count),
        offset,
    ));
    world.interrupted.borrow_mut().push(Arc::clone(&source));
    world.add(false, source);
}

#[when("a full run completes")]
fn when_full_run(world: &PublicationWorld) {
    world.run(&[], RunMode::Full);
}

#[when("a partial run completes")]
fn when_partial_run(world: &PublicationWorld) {
    world.run(&[], RunMode::Partial);
}

#[when("a partial run over provider {provider} completes")]
fn when_partial_run_over(world: &PublicationWorld, provider: String) {
    world.run(&[provider], RunMode::Partial);
}

#[when("a second full run starts while the first is held")]
fn when_second_run_starts(world: &PublicationWorld) {
    let orchestrator = world.orchestrator();
    let (report, refusal) = world.runtime.block_on(async {
        let first = orchestrator
            .start_run(&[], RunMode::Full)
            .await
            .expect("first run");
        let refusal = orchestrator
            .start_run(&[], RunMode::Full)
            .await
            .expect_err("the slot is leased by the first run");
        for source in world.held.borrow().iter() {
            source.release();
        }
        (first.wait().await.expect("first report"), refusal)
    });
    world.reports.borrow_mut().push(report);
    world.refusals.borrow_mut().push(refusal);
}

#[when("the source recovers and the run is resumed")]
fn when_resumed(world: &PublicationWorld) {
    for source in world.interrupted.borrow().iter() {
        source.disarm();
    }
    let run_id = world
        .reports
        .borrow()
        .last()
        .map(|report| report.run_id)
        .expect("a run to resume");
    let orchestrator = world.orchestrator();
    let report = world.runtime.block_on(async {
        orchestrator
            .resume_run(run_id)
            .await
            .expect("resume run")
            .wait()
            .await
            .expect("run task")
    });
    world.reports.borrow_mut().push(report);
}

#[then("the run swapped to slot {number}")]
fn then_swapped(world: &PublicationWorld, number: u8) {
    assert_eq!(
        world.last_outcome(),
        RunOutcome::Swapped {
            active_slot: slot(number)
        }
    );
}

#[then("the run was not swapped because of {reason}")]
fn then_not_swapped(world: &PublicationWorld, reason: String) {
    match world.last_outcome() {
        RunOutcome::NotSwapped(actual) => assert_eq!(actual.as_str(), reason),
        RunOutcome::Swapped { .. } => panic!("expected the run not to swap"),
    }
}

#[then("the active slot is {number}")]
fn then_active_slot(world: &PublicationWorld, number: u8) {
    let activation = world
        .runtime
        .block_on(world.state.load_activation())
        .expect("activation");
    assert_eq!(activation.active_slot, slot(number));
}

#[then("slot {number} holds {count} records")]
fn then_slot_holds(world: &PublicationWorld, number: u8, count: usize) {
    assert_eq!(world.sink.snapshot(slot(number)).len(), count);
}

#[then("provider {provider} keeps {count} records in slot {number}")]
fn then_provider_keeps(world: &PublicationWorld, provider: String, count: usize, number: u8) {
    let kept = world
        .runtime
        .block_on(world.sink.count(slot(number), &provider))
        .expect("count records");
    assert_eq!(kept, count);
}

#[then("the second run was refused because run {run_id} holds slot {number}")]
fn then_refused(world: &PublicationWorld, run_id: i64, number: u8) {
    let refusals = world.refusals.borrow();
    let refusal = refusals.last().expect("a refused run");
    assert!(
        matches!(
            refusal,
            OrchestratorError::State(StateError::SlotBusy { run_id: holder, target_slot })
                if *holder == RunId(run_id) && *target_slot == slot(number)
        ),
        "unexpected refusal {refusal:?}"
    );
}

#[then("every generation succeeded")]
fn then_all_succeeded(world: &PublicationWorld) {
    let reports = world.reports.borrow();
    let report = reports.last().expect("a run has finished");
    assert!(report.generations.iter().all(ProcessGeneration::succeeded));
}

#[scenario(path = "tests/features/publication.feature", index = 0)]
fn publishing_a_full_run(world: PublicationWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/publication.feature", index = 1)]
fn keeping_the_old_slot_after_a_failure(world: PublicationWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/publication.feature", index = 2)]
fn carrying_a_failed_provider_over(world: PublicationWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/publication.feature", index = 3)]
fn guarding_core_providers(world: PublicationWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/publication.feature", index = 4)]
fn leasing_the_target_slot(world: PublicationWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/publication.feature", index = 5)]
fn resuming_an_interrupted_run(world: PublicationWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/publication.feature", index = 6)]
fn keeping_unselected_providers(world: PublicationWorld) {
    let _ = world;
}

#[test]
fn scenario_indices_follow_feature_order() {
    let feature =
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/features/publication.feature");
    let contents = fs::read_to_string(&feature).unwrap_or_else(|err| {
        panic!("failed to read feature file {feature:?}: {err}");
    });
    let titles: Vec<&str> = contents
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Scenario: "))
        .collect();
    assert_eq!(
        titles,
        [
            "a full run publishes a fresh generation",
            "a full run with a failure leaves readers on the old slot",
            "a partial run carries the failed provider over",
            "a partial run never publishes without a core provider",
            "a second run waits for the slot the first run leased",
            "an interrupted run resumes from its last cursor",
            "a partial run over one provider keeps the others",
        ]
    );
}
