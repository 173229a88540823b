//! Behavioural tests for enriching batches of canonical records.

use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;

use biota_core::test_support::{
    AUDOUINS_GULL, HERRING_GULL, gull_taxonomy, swedish_areas, synthetic_observations,
};
use biota_core::{
    AreaIndex, CanonicalObservation, DiffusionPolicy, EnrichmentOutcome, RecordEnricher,
    TaxonGraph, ValidationState,
};
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

struct EnrichmentWorld {
    graph: TaxonGraph,
    areas: AreaIndex,
    policy: DiffusionPolicy,
    records: RefCell<Vec<CanonicalObservation>>,
    outcomes: RefCell<Vec<EnrichmentOutcome>>,
}

impl EnrichmentWorld {
    fn add(&self, taxon_id: u64, count: usize, free_usage: bool) {
        let mut records = self.records.borrow_mut();
        let offset = records.len();
        records.extend(
            synthetic_observations("bdd", taxon_id, count)
                .into_iter()
                .enumerate()
                .map(|(index, mut record)| {
                    record.stable_key = format!("bdd-{}", offset + index);
                    record.with_free_usage(free_usage)
                }),
        );
    }

    fn count(&self, predicate: impl Fn(&EnrichmentOutcome) -> bool) -> usize {
        self.outcomes
            .borrow()
            .iter()
            .filter(|outcome| predicate(outcome))
            .count()
    }
}

#[fixture]
fn world() -> EnrichmentWorld {
    EnrichmentWorld {
        graph: TaxonGraph::build(gull_taxonomy()).expect("valid taxonomy"),
        areas: AreaIndex::from_areas(swedish_areas()).expect("build areas"),
        policy: DiffusionPolicy::default(),
        records: RefCell::new(Vec::new()),
        outcomes: RefCell::new(Vec::new()),
    }
}

#[given("{count} records of a protected taxon without override")]
fn given_protected(world: &EnrichmentWorld, count: usize) {
    world.add(AUDOUINS_GULL, count, false);
}

#[given("{count} records of a protected taxon with override")]
fn given_protected_override(world: &EnrichmentWorld, count: usize) {
    world.add(AUDOUINS_GULL, count, true);
}

#[given("{count} records of a public taxon")]
fn given_public(world: &EnrichmentWorld, count: usize) {
    world.add(HERRING_GULL, count, false);
}

#[given("{count} records of an unknown taxon")]
fn given_unknown(world: &EnrichmentWorld, count: usize) {
    world.add(9_999, count, false);
}

#[when("the records are enriched")]
fn when_enriched(world: &EnrichmentWorld) {
    let enricher = RecordEnricher::new(&world.graph, &world.areas, &world.policy);
    let records = world.records.borrow().clone();
    *world.outcomes.borrow_mut() = enricher.enrich_batch(records);
}

#[then("{count} records are sensitive")]
fn then_sensitive(world: &EnrichmentWorld, count: usize) {
    assert_eq!(world.count(|outcome| outcome.observation.sensitive), count);
}

#[then("{count} records are not sensitive")]
fn then_not_sensitive(world: &EnrichmentWorld, count: usize) {
    assert_eq!(world.count(|outcome| !outcome.observation.sensitive), count);
}

#[then("{count} records are invalid")]
fn then_invalid(world: &EnrichmentWorld, count: usize) {
    assert_eq!(
        world.count(|outcome| outcome.observation.validation_state == ValidationState::Invalid),
        count
    );
}

#[then("every sensitive record has no locality")]
fn then_no_locality(world: &EnrichmentWorld) {
    assert_eq!(
        world.count(|outcome| outcome.observation.sensitive && outcome.observation.locality.is_some()),
        0
    );
    assert_eq!(
        world.count(|outcome| outcome.observation.sensitive
            && outcome.observation.diffusion_radius_m != Some(5_000)),
        0
    );
}

#[scenario(path = "tests/features/enrichment.feature", index = 0)]
fn mixing_protected_and_public(world: EnrichmentWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/enrichment.feature", index = 1)]
fn honouring_the_override(world: EnrichmentWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/enrichment.feature", index = 2)]
fn dropping_unknown_taxa(world: EnrichmentWorld) {
    let _ = world;
}

#[test]
fn scenario_indices_follow_feature_order() {
    let feature =
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/features/enrichment.feature");
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
            "mixing protected and public records",
            "honouring the free usage override",
            "dropping records of unknown taxa",
        ]
    );
}
