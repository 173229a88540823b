//! Shared behaviour checks run against every sink.
#![expect(clippy::expect_used, reason = "tests should fail fast when setup breaks")]

use std::collections::BTreeSet;
use std::sync::Arc;

use biota_core::test_support::synthetic_observations;
use biota_core::{RegionRef, RegionRefs};
use rstest::rstest;
use tempfile::TempDir;

use super::*;

fn memory() -> Arc<dyn BatchSink> {
    Arc::new(MemorySink::new())
}

fn sqlite() -> Arc<dyn BatchSink> {
    Arc::new(SqliteSink::open_in_memory().expect("open sqlite sink"))
}

fn records(provider: &str, taxon_id: u64, count: usize) -> Vec<CanonicalObservation> {
    synthetic_observations(provider, taxon_id, count)
}

#[rstest]
#[case::memory(memory())]
#[case::sqlite(sqlite())]
#[tokio::test]
async fn writes_are_idempotent_upserts(#[case] sink: Arc<dyn BatchSink>) {
    sink.write_batch(records("a", 21, 3), InstanceSlot::One)
        .await
        .expect("first write");
    sink.write_batch(records("a", 21, 3), InstanceSlot::One)
        .await
        .expect("replayed write");
    assert_eq!(sink.count(InstanceSlot::One, "a").await.expect("count"), 3);
    assert_eq!(sink.count(InstanceSlot::Zero, "a").await.expect("count"), 0);
}

#[rstest]
#[case::memory(memory())]
#[case::sqlite(sqlite())]
#[tokio::test]
async fn clearing_touches_one_provider_in_one_slot(#[case] sink: Arc<dyn BatchSink>) {
    sink.write_batch(records("a", 21, 2), InstanceSlot::One)
        .await
        .expect("write a");
    sink.write_batch(records("b", 21, 2), InstanceSlot::One)
        .await
        .expect("write b");
    sink.write_batch(records("a", 21, 2), InstanceSlot::Zero)
        .await
        .expect("write a to zero");

    let removed = sink
        .clear_provider("a", InstanceSlot::One)
        .await
        .expect("clear");
    assert_eq!(removed, 2);
    assert_eq!(sink.count(InstanceSlot::One, "a").await.expect("count"), 0);
    assert_eq!(sink.count(InstanceSlot::One, "b").await.expect("count"), 2);
    assert_eq!(sink.count(InstanceSlot::Zero, "a").await.expect("count"), 2);
}

#[rstest]
#[case::memory(memory())]
#[case::sqlite(sqlite())]
#[tokio::test]
async fn copying_replaces_the_target_generation(#[case] sink: Arc<dyn BatchSink>) {
    sink.write_batch(records("a", 21, 4), InstanceSlot::Zero)
        .await
        .expect("write previous generation");
    let mut stale = records("a", 21, 6);
    for record in &mut stale {
        record.stable_key = format!("stale-{}", record.stable_key);
    }
    sink.write_batch(stale, InstanceSlot::One)
        .await
        .expect("write partial generation");

    let copied = sink
        .copy_provider("a", InstanceSlot::Zero, InstanceSlot::One)
        .await
        .expect("copy");
    assert_eq!(copied, 4);
    assert_eq!(sink.count(InstanceSlot::One, "a").await.expect("count"), 4);
    assert_eq!(sink.count(InstanceSlot::Zero, "a").await.expect("count"), 4);
}

#[rstest]
#[case::memory(memory())]
#[case::sqlite(sqlite())]
#[tokio::test]
async fn search_filters_and_limits(#[case] sink: Arc<dyn BatchSink>) {
    let mut in_county = records("a", 21, 3);
    for record in &mut in_county {
        record.region_refs = RegionRefs {
            county: Some(RegionRef {
                feature_id: "01".to_owned(),
                name: "Stockholm".to_owned(),
            }),
            ..RegionRefs::default()
        };
    }
    sink.write_batch(in_county, InstanceSlot::Zero)
        .await
        .expect("write county records");
    sink.write_batch(records("b", 13, 2), InstanceSlot::Zero)
        .await
        .expect("write other taxon");

    let by_county = RecordFilter {
        county: Some("01".to_owned()),
        ..RecordFilter::default()
    };
    assert_eq!(
        sink.search(InstanceSlot::Zero, &by_county)
            .await
            .expect("search")
            .len(),
        3
    );

    let by_taxon = RecordFilter {
        taxon_ids: Some(BTreeSet::from([13])),
        ..RecordFilter::default()
    };
    let found = sink
        .search(InstanceSlot::Zero, &by_taxon)
        .await
        .expect("search");
    assert!(found.iter().all(|record| record.provider_id == "b"));
    assert_eq!(found.len(), 2);

    let limited = RecordFilter {
        limit: Some(1),
        ..RecordFilter::default()
    };
    let first = sink
        .search(InstanceSlot::Zero, &limited)
        .await
        .expect("search");
    assert_eq!(first.len(), 1);
    assert_eq!(
        first.first().map(|record| record.stable_key.as_str()),
        Some("a-0")
    );
    assert!(
        sink.search(InstanceSlot::One, &RecordFilter::default())
            .await
            .expect("search empty slot")
            .is_empty()
    );
}

#[tokio::test]
async fn sqlite_documents_survive_reopening() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("observations.db");
    let written = records("a", 21, 2);
    {
        let sink = SqliteSink::open(&path).expect("open sink");
        sink.write_batch(written.clone(), InstanceSlot::One)
            .await
            .expect("write");
    }
    let reopened = SqliteSink::open(&path).expect("reopen sink");
    let found = reopened
        .search(InstanceSlot::One, &RecordFilter::default())
        .await
        .expect("search");
    assert_eq!(found, written);
}

#[tokio::test]
async fn sqlite_rejects_taxon_ids_beyond_the_column_range() {
    let sink = SqliteSink::open_in_memory().expect("open sink");
    let mut batch = records("a", 21, 2);
    let oversized = u64::MAX;
    for record in batch.iter_mut().skip(1) {
        record.taxon_id = oversized;
    }

    let err = sink
        .write_batch(batch, InstanceSlot::One)
        .await
        .expect_err("oversized taxon id must be rejected");
    assert!(matches!(
        err,
        SinkError::TaxonIdOutOfRange { ref stable_key, taxon_id }
            if stable_key == "a-1" && taxon_id == oversized
    ));
    assert_eq!(sink.count(InstanceSlot::One, "a").await.expect("count"), 0);
}
