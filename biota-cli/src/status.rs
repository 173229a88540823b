//! Status command: report the published slot and recent runs.

use std::io::Write;

use biota_fs::StateLayout;
use biota_pipeline::{ActivationStore, GenerationLedger, RunId, StateStore};
use camino::Utf8PathBuf;
use clap::Parser;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};

use crate::inputs::require_input;
use crate::summary::{RunSummary, StatusSummary};
use crate::{ARG_LIMIT, ARG_RUN_ID, ARG_STATE_DIR, CliError, DEFAULT_STATE_DIR, write_json};

const DEFAULT_LIMIT: usize = 10;

/// CLI arguments for the `status` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(about = "Show the active slot and recent runs")]
#[ortho_config(prefix = "BIOTA")]
pub(crate) struct StatusArgs {
    /// Directory holding `state.db`.
    #[arg(long = ARG_STATE_DIR, value_name = "dir")]
    #[serde(default)]
    pub(crate) state_dir: Option<Utf8PathBuf>,
    /// Report a single run.
    #[arg(long = ARG_RUN_ID, value_name = "id")]
    #[serde(default)]
    pub(crate) run_id: Option<i64>,
    /// Number of recent runs to list.
    #[arg(long = ARG_LIMIT, value_name = "count")]
    #[serde(default)]
    pub(crate) limit: Option<usize>,
}

/// Resolved `status` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StatusConfig {
    pub(crate) layout: StateLayout,
    pub(crate) run_id: Option<RunId>,
    pub(crate) limit: usize,
}

impl From<StatusArgs> for StatusConfig {
    fn from(args: StatusArgs) -> Self {
        let state_dir = args
            .state_dir
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_STATE_DIR));
        Self {
            layout: StateLayout::new(state_dir),
            run_id: args.run_id.map(RunId),
            limit: args.limit.unwrap_or(DEFAULT_LIMIT),
        }
    }
}

pub(crate) fn status_command(args: StatusArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let merged = args.load_and_merge().map_err(CliError::Configuration)?;
    let config = StatusConfig::from(merged);
    let summary = collect_status(&config)?;
    write_json(writer, &summary)
}

/// Read the activation record and the requested runs from `state.db`.
pub(crate) fn collect_status(config: &StatusConfig) -> Result<StatusSummary, CliError> {
    let state_db = config.layout.state_db();
    require_input(&state_db, ARG_STATE_DIR)?;
    let store = StateStore::open(state_db.as_std_path())?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;
    runtime.block_on(async {
        let activation = store.load_activation().await?;
        let records = match config.run_id {
            Some(run_id) => vec![store.run(run_id).await?],
            None => store.recent_runs(config.limit).await?,
        };
        let mut runs = Vec::with_capacity(records.len());
        for record in &records {
            let generations = store.generations(record.run_id).await?;
            runs.push(RunSummary::from_record(record, &generations));
        }
        Ok(StatusSummary::new(&activation, runs))
    })
}
