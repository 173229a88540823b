//! Unit coverage for the provider chunk loop.
#![expect(clippy::expect_used, reason = "tests should fail fast when setup breaks")]

use std::sync::Arc;
use std::time::Duration;

use biota_core::test_support::{AUDOUINS_GULL, HERRING_GULL};
use rstest::{fixture, rstest};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::registry::ProviderHandle;
use crate::sink::MemorySink;
use crate::source::BatchSource;
use crate::state::{GenerationStatus, RunMode, SlotLease, StateStore};
use crate::test_support::{FailingSource, InterruptedSource, RegistryBuilder, dwc_rows, gull_context};

struct Harness {
    processor: BatchProcessor,
    sink: MemorySink,
    state: StateStore,
    run_id: RunId,
}

impl Harness {
    async fn process(&self, provider: ProviderHandle, resume_from: Option<ProcessGeneration>) -> ProcessGeneration {
        self.process_with(provider, resume_from, &CancellationToken::new())
            .await
    }

    async fn process_with(
        &self,
        provider: ProviderHandle,
        resume_from: Option<ProcessGeneration>,
        cancel: &CancellationToken,
    ) -> ProcessGeneration {
        let job = ProviderJob {
            provider,
            run_id: self.run_id,
            slot: InstanceSlot::One,
            resume_from,
        };
        self.processor
            .process_provider(job, &self.sink, &self.state, cancel)
            .await
    }
}

#[fixture]
async fn harness() -> Harness {
    let state = StateStore::open_in_memory().expect("state store");
    let run = state
        .create_run(
            RunMode::Full,
            SlotLease {
                target_slot: InstanceSlot::One,
                observed_version: 0,
                duration: Duration::from_secs(60),
            },
            &["p".to_owned()],
        )
        .await
        .expect("create run");
    Harness {
        processor: BatchProcessor::new(gull_context(), 4),
        sink: MemorySink::new(),
        state,
        run_id: run.run_id,
    }
}

fn provider(source: Arc<dyn BatchSource>) -> ProviderHandle {
    RegistryBuilder::new()
        .provider("p", false, source)
        .build()
        .resolve(&[])
        .expect("resolve provider")
        .into_iter()
        .next()
        .expect("one provider")
}

fn rows_provider(rows: Vec<serde_json::Value>) -> ProviderHandle {
    provider(Arc::new(crate::source::MemorySource::new(rows)))
}

#[rstest]
#[tokio::test]
async fn counts_public_protected_and_failed_rows(#[future] harness: Harness) {
    let harness = harness.await;
    let mut rows = dwc_rows("pub", HERRING_GULL, 6);
    rows.extend(dwc_rows("prot", AUDOUINS_GULL, 3));
    rows.push(json!({ "occurrenceID": "bad" }));
    rows.push(json!({ "occurrenceID": "unknown", "taxonID": 9999, "decimalLongitude": 18.0, "decimalLatitude": 59.3 }));

    let generation = harness.process(rows_provider(rows), None).await;

    assert_eq!(generation.status, GenerationStatus::Succeeded);
    assert_eq!(generation.public_count, 6);
    assert_eq!(generation.protected_count, 3);
    assert_eq!(generation.failed_count, 2);
    assert_eq!(generation.last_cursor, Some(Cursor(11)));
    assert_eq!(harness.sink.snapshot(InstanceSlot::One).len(), 9);
    let stored = harness
        .state
        .generation(harness.run_id, "p")
        .await
        .expect("read generation")
        .expect("generation persisted");
    assert_eq!(stored, generation);
}

#[rstest]
#[tokio::test]
async fn protected_records_are_written_generalised(#[future] harness: Harness) {
    let harness = harness.await;
    harness
        .process(rows_provider(dwc_rows("prot", AUDOUINS_GULL, 2)), None)
        .await;
    for record in harness.sink.snapshot(InstanceSlot::One) {
        assert!(record.sensitive);
        assert_eq!(record.locality, None);
        assert_eq!(record.diffusion_radius_m, Some(5_000));
    }
}

#[rstest]
#[tokio::test]
async fn a_fresh_generation_replaces_the_previous_one(#[future] harness: Harness) {
    let harness = harness.await;
    harness
        .process(rows_provider(dwc_rows("old", HERRING_GULL, 5)), None)
        .await;
    harness
        .process(rows_provider(dwc_rows("new", HERRING_GULL, 2)), None)
        .await;
    let keys: Vec<String> = harness
        .sink
        .snapshot(InstanceSlot::One)
        .into_iter()
        .map(|record| record.stable_key)
        .collect();
    assert_eq!(keys, ["new-0", "new-1"]);
}

#[rstest]
#[tokio::test]
async fn source_failures_keep_confirmed_chunks(#[future] harness: Harness) {
    let harness = harness.await;
    let source = Arc::new(InterruptedSource::new(dwc_rows("r", HERRING_GULL, 10), 4));
    let failed = harness.process(provider(source.clone()), None).await;

    assert_eq!(failed.status, GenerationStatus::Failed);
    assert_eq!(failed.last_cursor, Some(Cursor(4)));
    assert_eq!(failed.public_count, 4);
    assert!(
        failed
            .error
            .as_deref()
            .is_some_and(|error| error.contains("source error")),
        "unexpected error {:?}",
        failed.error
    );
    assert_eq!(harness.sink.snapshot(InstanceSlot::One).len(), 4);

    source.disarm();
    let resumed = harness.process(provider(source), Some(failed)).await;
    assert_eq!(resumed.status, GenerationStatus::Succeeded);
    assert_eq!(resumed.public_count, 10);
    assert_eq!(resumed.error, None);
    assert_eq!(harness.sink.snapshot(InstanceSlot::One).len(), 10);
}

#[rstest]
#[tokio::test]
async fn cancellation_stops_before_the_first_fetch(#[future] harness: Harness) {
    let harness = harness.await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let generation = harness
        .process_with(rows_provider(dwc_rows("r", HERRING_GULL, 3)), None, &cancel)
        .await;
    assert_eq!(generation.status, GenerationStatus::Failed);
    assert_eq!(generation.error.as_deref(), Some("cancelled"));
    assert!(harness.sink.snapshot(InstanceSlot::One).is_empty());
}

#[rstest]
#[tokio::test]
async fn unreachable_sources_fail_the_generation(#[future] harness: Harness) {
    let harness = harness.await;
    let generation = harness
        .process(provider(Arc::new(FailingSource::new("offline"))), None)
        .await;
    assert_eq!(generation.status, GenerationStatus::Failed);
    assert_eq!(generation.last_cursor, None);
    assert!(generation.finished_at.is_some());
}

#[test]
fn zero_chunk_size_is_raised_to_one() {
    assert_eq!(BatchProcessor::new(gull_context(), 0).chunk_size(), 1);
}
