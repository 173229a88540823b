//! Error types emitted by the Biota CLI.

use std::sync::Arc;

use biota_core::{AreaError, TaxonGraphError};
use biota_fs::FsError;
use biota_pipeline::{OrchestratorError, RegistryError, RunId, SinkError, StateError};
use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors emitted by the Biota CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Provided arguments failed Clap validation.
    #[error(transparent)]
    ArgumentParsing(#[from] clap::Error),
    /// Configuration layering failed (files, env, CLI).
    #[error("failed to load configuration: {0}")]
    Configuration(#[from] Arc<ortho_config::OrthoError>),
    /// A required option is missing after configuration merging.
    #[error("missing {field} (set --{field} or {env})")]
    MissingArgument {
        field: &'static str,
        env: &'static str,
    },
    /// An option holds a value the command cannot use.
    #[error("invalid {field}: {message}")]
    InvalidArgument {
        field: &'static str,
        message: String,
    },
    /// An input file is missing, unreadable or not a regular file.
    #[error("{field} input is unusable: {source}")]
    Input {
        field: &'static str,
        #[source]
        source: FsError,
    },
    /// A JSON snapshot could not be decoded.
    #[error("failed to parse {path}")]
    ParseSnapshot {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// The state directory could not be created.
    #[error("failed to prepare the state directory")]
    PrepareState(#[source] FsError),
    /// The taxonomy snapshot is structurally invalid.
    #[error("invalid taxonomy: {0}")]
    Taxonomy(#[from] TaxonGraphError),
    /// The area store could not be opened or read.
    #[error("area store error: {0}")]
    Areas(#[from] AreaError),
    /// A provider definition was rejected.
    #[error("provider registry error: {0}")]
    Registry(#[from] RegistryError),
    /// The run state database failed.
    #[error("state store error: {0}")]
    State(#[from] StateError),
    /// The observation store failed.
    #[error("observation store error: {0}")]
    Sink(#[from] SinkError),
    /// The run could not be started or awaited.
    #[error("run failed: {0}")]
    Orchestrator(#[from] OrchestratorError),
    /// The async runtime could not be started.
    #[error("failed to start the async runtime: {0}")]
    Runtime(#[source] std::io::Error),
    /// The run finished without publishing its slot.
    #[error("run {run_id} finished without swapping: {outcome}")]
    NotSwapped { run_id: RunId, outcome: String },
    /// Serialising a report failed.
    #[error("failed to serialise report: {0}")]
    SerialiseReport(#[source] serde_json::Error),
    /// Writing a report failed.
    #[error("failed to write output: {0}")]
    WriteOutput(#[source] std::io::Error),
}
