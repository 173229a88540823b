//! Scratch workspaces holding taxonomy, area and provider snapshots.

use biota_core::test_support::{HERRING_GULL, gull_taxonomy, swedish_areas};
use biota_core::{Taxon, write_area_store};
use biota_pipeline::test_support::dwc_rows;
use biota_pipeline::{DWC_STAGING_KIND, ProviderDefinition, stage_records};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use tempfile::TempDir;

use crate::run::RunArgs;

pub(super) const STAGING_DB: &str = "staging.db";
pub(super) const BROKEN_DB: &str = "broken.db";

/// Temporary directory populated with snapshot inputs.
#[derive(Debug)]
pub(super) struct Workspace {
    _tmp: TempDir,
    root: Utf8PathBuf,
}

impl Workspace {
    pub(super) fn new() -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf-8 workspace");
        Self { _tmp: tmp, root }
    }

    pub(super) fn path(&self, name: &str) -> Utf8PathBuf {
        self.root.join(name)
    }

    pub(super) fn taxa(&self) -> Utf8PathBuf {
        self.path("taxa.json")
    }

    pub(super) fn areas(&self) -> Utf8PathBuf {
        self.path("areas.db")
    }

    pub(super) fn providers(&self) -> Utf8PathBuf {
        self.path("providers.json")
    }

    pub(super) fn state_dir(&self) -> Utf8PathBuf {
        self.path("state")
    }

    pub(super) fn write_taxonomy(&self, taxa: &[Taxon]) {
        let payload = serde_json::to_string_pretty(taxa).expect("serialise taxa");
        write_utf8(&self.taxa(), payload.as_bytes());
    }

    pub(super) fn write_gull_taxonomy(&self) {
        self.write_taxonomy(&gull_taxonomy());
    }

    pub(super) fn write_areas(&self) {
        write_area_store(self.areas().as_std_path(), &swedish_areas()).expect("write area store");
    }

    /// Stage `count` herring gull rows for `provider_id` in the shared staging db.
    pub(super) fn stage(&self, provider_id: &str, count: usize) {
        stage_records(
            self.path(STAGING_DB).as_std_path(),
            provider_id,
            &dwc_rows(provider_id, HERRING_GULL, count),
        )
        .expect("stage records");
    }

    /// Write a database file that holds no staging table.
    pub(super) fn write_broken_staging(&self) {
        write_utf8(&self.path(BROKEN_DB), b"");
    }

    /// Providers file with locations relative to the workspace.
    pub(super) fn write_providers(&self, providers: &[(&str, &str)]) {
        let definitions: Vec<ProviderDefinition> = providers
            .iter()
            .map(|(id, location)| {
                ProviderDefinition::new(*id, DWC_STAGING_KIND)
                    .with_core(true)
                    .with_location(*location)
            })
            .collect();
        let payload = serde_json::to_string_pretty(&definitions).expect("serialise providers");
        write_utf8(&self.providers(), payload.as_bytes());
    }

    /// Arguments naming every input in this workspace.
    pub(super) fn run_args(&self) -> RunArgs {
        RunArgs {
            taxa: Some(self.taxa()),
            areas: Some(self.areas()),
            providers: Some(self.providers()),
            state_dir: Some(self.state_dir()),
            chunk_size: Some(4),
            ..RunArgs::default()
        }
    }
}

pub(super) fn write_utf8(path: &Utf8Path, contents: &[u8]) {
    fs::write(path.as_std_path(), contents).expect("write fixture");
}
