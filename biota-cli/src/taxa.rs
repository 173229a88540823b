//! Check-taxa command: build a taxonomy snapshot and report its shape.

use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use log::warn;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};

use crate::inputs::{load_taxonomy, require_input};
use crate::summary::TaxonomySummary;
use crate::{ARG_TAXA, CliError, ENV_CHECK_TAXA, write_json};

/// CLI arguments for the `check-taxa` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    long_about = "Build the taxonomy snapshot and report its size, root and any \
                 loops formed through secondary parents. Primary-edge problems \
                 fail the command.",
    about = "Validate a taxonomy snapshot"
)]
#[ortho_config(prefix = "BIOTA")]
pub(crate) struct CheckTaxaArgs {
    /// Path to the JSON taxonomy snapshot.
    #[arg(long = ARG_TAXA, value_name = "path")]
    #[serde(default)]
    pub(crate) taxa: Option<Utf8PathBuf>,
}

pub(crate) fn check_taxa_command(
    args: CheckTaxaArgs,
    writer: &mut dyn Write,
) -> Result<(), CliError> {
    let merged = args.load_and_merge().map_err(CliError::Configuration)?;
    let path = merged.taxa.ok_or(CliError::MissingArgument {
        field: ARG_TAXA,
        env: ENV_CHECK_TAXA,
    })?;
    let summary = summarise_taxonomy(&path)?;
    write_json(writer, &summary)
}

pub(crate) fn summarise_taxonomy(path: &Utf8Path) -> Result<TaxonomySummary, CliError> {
    require_input(path, ARG_TAXA)?;
    let graph = load_taxonomy(path, ARG_TAXA)?;
    let secondary_cycles = graph.detect_cycles();
    for cycle in &secondary_cycles {
        warn!("secondary parents form a loop: {cycle:?}");
    }
    Ok(TaxonomySummary {
        taxa: graph.len(),
        root: graph.root(),
        secondary_cycles,
    })
}
