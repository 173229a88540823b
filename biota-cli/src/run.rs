//! Run command implementation for the Biota CLI.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use biota_core::{AreaIndex, DiffusionPolicy};
use biota_fs::StateLayout;
use biota_pipeline::{
    OrchestratorConfig, PipelineOrchestrator, ProcessorContext, RunId, RunMode, RunReport,
    SqliteSink, StateStore,
};
use camino::Utf8PathBuf;
use clap::Parser;
use log::info;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};

use crate::inputs::{load_registry, load_taxonomy, require_input};
use crate::summary::RunSummary;
use crate::{
    ARG_AREAS, ARG_CHUNK_SIZE, ARG_MAX_CONCURRENT, ARG_MODE, ARG_PROVIDER, ARG_PROVIDER_TIMEOUT,
    ARG_PROVIDERS, ARG_RESUME, ARG_RUN_TIMEOUT, ARG_STATE_DIR, ARG_TAXA, CliError,
    DEFAULT_STATE_DIR, ENV_RUN_AREAS, ENV_RUN_PROVIDERS, ENV_RUN_TAXA, write_json,
};

/// CLI arguments for the `run` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    long_about = "Process every selected provider into the inactive slot and \
                 publish the slot when the run mode allows it. Inputs can come \
                 from CLI flags, configuration files, or environment \
                 variables.",
    about = "Process providers and publish the inactive slot"
)]
#[ortho_config(prefix = "BIOTA")]
pub(crate) struct RunArgs {
    /// Path to the JSON taxonomy snapshot.
    #[arg(long = ARG_TAXA, value_name = "path")]
    #[serde(default)]
    pub(crate) taxa: Option<Utf8PathBuf>,
    /// Path to the SQLite area store.
    #[arg(long = ARG_AREAS, value_name = "path")]
    #[serde(default)]
    pub(crate) areas: Option<Utf8PathBuf>,
    /// Path to the JSON provider definitions.
    #[arg(long = ARG_PROVIDERS, value_name = "path")]
    #[serde(default)]
    pub(crate) providers: Option<Utf8PathBuf>,
    /// Directory holding `state.db` and `observations.db`.
    #[arg(long = ARG_STATE_DIR, value_name = "dir")]
    #[serde(default)]
    pub(crate) state_dir: Option<Utf8PathBuf>,
    /// Providers to process; every provider when omitted.
    #[arg(long = ARG_PROVIDER, value_name = "id", value_delimiter = ',')]
    #[serde(default)]
    pub(crate) provider: Option<Vec<String>>,
    /// Swap policy: `full` or `partial`.
    #[arg(long = ARG_MODE, value_name = "mode")]
    #[serde(default)]
    pub(crate) mode: Option<String>,
    /// Resume an earlier run instead of starting a new one.
    #[arg(long = ARG_RESUME, value_name = "run-id")]
    #[serde(default)]
    pub(crate) resume: Option<i64>,
    /// Rows fetched per chunk.
    #[arg(long = ARG_CHUNK_SIZE, value_name = "rows")]
    #[serde(default)]
    pub(crate) chunk_size: Option<usize>,
    /// Providers processed at once.
    #[arg(long = ARG_MAX_CONCURRENT, value_name = "count")]
    #[serde(default)]
    pub(crate) max_concurrent_providers: Option<usize>,
    /// Time limit for one provider, in seconds.
    #[arg(long = ARG_PROVIDER_TIMEOUT, value_name = "secs")]
    #[serde(default)]
    pub(crate) provider_timeout_secs: Option<u64>,
    /// Time limit for the whole run, in seconds.
    #[arg(long = ARG_RUN_TIMEOUT, value_name = "secs")]
    #[serde(default)]
    pub(crate) run_timeout_secs: Option<u64>,
}

impl RunArgs {
    pub(crate) fn into_config(self) -> Result<RunConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        RunConfig::try_from(merged)
    }
}

/// Resolved `run` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunConfig {
    pub(crate) taxa: Utf8PathBuf,
    pub(crate) areas: Utf8PathBuf,
    pub(crate) providers: Utf8PathBuf,
    pub(crate) layout: StateLayout,
    pub(crate) selection: Vec<String>,
    pub(crate) mode: RunMode,
    pub(crate) resume: Option<RunId>,
    pub(crate) orchestrator: OrchestratorConfig,
}

impl RunConfig {
    pub(crate) fn validate_sources(&self) -> Result<(), CliError> {
        require_input(&self.taxa, ARG_TAXA)?;
        require_input(&self.areas, ARG_AREAS)?;
        require_input(&self.providers, ARG_PROVIDERS)?;
        Ok(())
    }
}

impl TryFrom<RunArgs> for RunConfig {
    type Error = CliError;

    fn try_from(args: RunArgs) -> Result<Self, Self::Error> {
        let taxa = args.taxa.ok_or(CliError::MissingArgument {
            field: ARG_TAXA,
            env: ENV_RUN_TAXA,
        })?;
        let areas = args.areas.ok_or(CliError::MissingArgument {
            field: ARG_AREAS,
            env: ENV_RUN_AREAS,
        })?;
        let providers = args.providers.ok_or(CliError::MissingArgument {
            field: ARG_PROVIDERS,
            env: ENV_RUN_PROVIDERS,
        })?;
        let state_dir = args
            .state_dir
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_STATE_DIR));
        let mode = args
            .mode
            .as_deref()
            .map(str::parse::<RunMode>)
            .transpose()
            .map_err(|err| CliError::InvalidArgument {
                field: ARG_MODE,
                message: err.to_string(),
            })?
            .unwrap_or_default();
        if args.resume.is_some() && args.provider.as_ref().is_some_and(|ids| !ids.is_empty()) {
            return Err(CliError::InvalidArgument {
                field: ARG_RESUME,
                message: format!("--{ARG_PROVIDER} cannot be combined with a resumed run"),
            });
        }

        let mut orchestrator = OrchestratorConfig::default();
        if let Some(rows) = args.chunk_size {
            orchestrator = orchestrator.with_chunk_size(rows);
        }
        if let Some(limit) = args.max_concurrent_providers {
            orchestrator = orchestrator.with_max_concurrent_providers(limit);
        }
        if let Some(secs) = args.provider_timeout_secs {
            orchestrator = orchestrator.with_provider_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = args.run_timeout_secs {
            orchestrator = orchestrator.with_run_timeout(Duration::from_secs(secs));
        }

        Ok(Self {
            taxa,
            areas,
            providers,
            layout: StateLayout::new(state_dir),
            selection: args.provider.unwrap_or_default(),
            mode,
            resume: args.resume.map(RunId),
            orchestrator,
        })
    }
}

pub(crate) fn run_command(args: RunArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let config = resolve_run_config(args)?;
    let report = execute_run(&config)?;
    write_json(writer, &RunSummary::from_report(&report))?;
    if report.outcome.is_swapped() {
        Ok(())
    } else {
        Err(CliError::NotSwapped {
            run_id: report.run_id,
            outcome: report.outcome.to_string(),
        })
    }
}

fn resolve_run_config(args: RunArgs) -> Result<RunConfig, CliError> {
    let config = args.into_config()?;
    config.validate_sources()?;
    Ok(config)
}

/// Load the inputs, start or resume the run and wait for its report.
pub(crate) fn execute_run(config: &RunConfig) -> Result<RunReport, CliError> {
    let graph = load_taxonomy(&config.taxa, ARG_TAXA)?;
    let areas = AreaIndex::open(config.areas.as_std_path())?;
    let registry = load_registry(&config.providers, ARG_PROVIDERS)?;
    info!(
        "loaded {} taxa, {} areas and {} providers",
        graph.len(),
        areas.len(),
        registry.definitions().count()
    );

    config.layout.prepare().map_err(CliError::PrepareState)?;
    let state = Arc::new(StateStore::open(config.layout.state_db().as_std_path())?);
    let sink = Arc::new(SqliteSink::open(
        config.layout.observations_db().as_std_path(),
    )?);
    let context = Arc::new(ProcessorContext::new(
        graph,
        areas,
        DiffusionPolicy::default(),
    ));
    let orchestrator = PipelineOrchestrator::new(
        config.orchestrator.clone(),
        registry,
        context,
        sink,
        state,
    )?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;
    runtime.block_on(async {
        let handle = match config.resume {
            Some(run_id) => orchestrator.resume_run(run_id).await?,
            None => orchestrator.start_run(&config.selection, config.mode).await?,
        };
        info!(
            "run {} is writing slot {}",
            handle.run_id(),
            handle.target_slot()
        );
        Ok::<_, CliError>(handle.wait().await?)
    })
}

#[cfg(test)]
pub(crate) fn config_from_layers_for_test(
    layers: Vec<ortho_config::MergeLayer<'static>>,
) -> Result<RunConfig, CliError> {
    let merged = RunArgs::merge_from_layers(layers).map_err(CliError::from)?;
    RunConfig::try_from(merged)
}
