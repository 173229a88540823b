//! Unit tests for the `check-taxa` command.

use super::helpers::{Workspace, write_utf8};
use super::*;
use crate::taxa::{CheckTaxaArgs, check_taxa_command, summarise_taxonomy};
use biota_core::test_support::{BIOTA, HERRING_GULL, ICHTHYAETUS, gull_taxonomy};
use biota_core::{Taxon, TaxonGraphError};
use rstest::rstest;
use serde_json::Value;

#[rstest]
fn reports_size_and_root() {
    let workspace = Workspace::new();
    workspace.write_gull_taxonomy();
    let mut buffer = Vec::new();
    check_taxa_command(
        CheckTaxaArgs {
            taxa: Some(workspace.taxa()),
        },
        &mut buffer,
    )
    .expect("taxonomy should check");
    let summary: Value = serde_json::from_slice(&buffer).expect("output should be JSON");
    assert_eq!(summary["taxa"], gull_taxonomy().len());
    assert_eq!(summary["root"], BIOTA);
    assert_eq!(summary["secondaryCycles"], Value::Array(Vec::new()));
}

#[rstest]
fn secondary_loops_are_reported_not_fatal() {
    let workspace = Workspace::new();
    let mut taxa = gull_taxonomy();
    for taxon in &mut taxa {
        if taxon.id == ICHTHYAETUS {
            taxon.secondary_parent_ids.push(HERRING_GULL);
        }
    }
    workspace.write_taxonomy(&taxa);

    let summary = summarise_taxonomy(&workspace.taxa()).expect("secondary loops are advisory");
    assert_eq!(summary.secondary_cycles.len(), 1);
}

#[rstest]
fn primary_problems_fail_the_check() {
    let workspace = Workspace::new();
    workspace.write_taxonomy(&[
        Taxon::new(BIOTA, "Biota"),
        Taxon::new(2, "Aves").with_primary_parent(404),
    ]);
    let err = summarise_taxonomy(&workspace.taxa()).expect_err("dangling parent");
    match err {
        CliError::Taxonomy(TaxonGraphError::DanglingParent { parent_id: 404, .. }) => {}
        other => panic!("expected Taxonomy, found {other:?}"),
    }
}

#[rstest]
fn malformed_snapshots_name_the_file() {
    let workspace = Workspace::new();
    write_utf8(&workspace.taxa(), b"{ not json");
    let err = summarise_taxonomy(&workspace.taxa()).expect_err("invalid JSON");
    match err {
        CliError::ParseSnapshot { path, .. } => assert_eq!(path, workspace.taxa()),
        other => panic!("expected ParseSnapshot, found {other:?}"),
    }
}
