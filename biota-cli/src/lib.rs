//! Command-line interface for driving Biota processing runs.
#![forbid(unsafe_code)]

use std::io::Write;

use clap::{Parser, Subcommand};

mod error;
mod inputs;
mod run;
mod status;
mod summary;
mod taxa;

pub use error::CliError;

pub(crate) const ARG_TAXA: &str = "taxa";
pub(crate) const ARG_AREAS: &str = "areas";
pub(crate) const ARG_PROVIDERS: &str = "providers";
pub(crate) const ARG_STATE_DIR: &str = "state-dir";
pub(crate) const ARG_PROVIDER: &str = "provider";
pub(crate) const ARG_MODE: &str = "mode";
pub(crate) const ARG_RESUME: &str = "resume";
pub(crate) const ARG_CHUNK_SIZE: &str = "chunk-size";
pub(crate) const ARG_MAX_CONCURRENT: &str = "max-concurrent-providers";
pub(crate) const ARG_PROVIDER_TIMEOUT: &str = "provider-timeout-secs";
pub(crate) const ARG_RUN_TIMEOUT: &str = "run-timeout-secs";
pub(crate) const ARG_RUN_ID: &str = "run-id";
pub(crate) const ARG_LIMIT: &str = "limit";
pub(crate) const ENV_RUN_TAXA: &str = "BIOTA_CMDS_RUN_TAXA";
pub(crate) const ENV_RUN_AREAS: &str = "BIOTA_CMDS_RUN_AREAS";
pub(crate) const ENV_RUN_PROVIDERS: &str = "BIOTA_CMDS_RUN_PROVIDERS";
pub(crate) const ENV_CHECK_TAXA: &str = "BIOTA_CMDS_CHECK_TAXA_TAXA";

/// State directory used when none is configured.
pub(crate) const DEFAULT_STATE_DIR: &str = "biota-state";

/// Run the Biota CLI with the current process arguments and environment.
///
/// Reports are written to standard output as JSON.
pub fn run() -> Result<(), CliError> {
    let cli = Cli::try_parse().map_err(CliError::ArgumentParsing)?;
    let mut stdout = std::io::stdout().lock();
    dispatch(cli.command, &mut stdout)
}

fn dispatch(command: Command, writer: &mut dyn Write) -> Result<(), CliError> {
    match command {
        Command::Run(args) => run::run_command(args, writer),
        Command::Status(args) => status::status_command(args, writer),
        Command::CheckTaxa(args) => taxa::check_taxa_command(args, writer),
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "biota",
    about = "Process biodiversity observations into a blue/green published index",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Process providers into the inactive slot and publish it.
    Run(run::RunArgs),
    /// Show the active slot and recent runs.
    Status(status::StatusArgs),
    /// Validate a taxonomy snapshot.
    CheckTaxa(taxa::CheckTaxaArgs),
}

/// Write `value` as pretty JSON followed by a newline.
pub(crate) fn write_json<T: serde::Serialize>(
    writer: &mut dyn Write,
    value: &T,
) -> Result<(), CliError> {
    let payload = serde_json::to_string_pretty(value).map_err(CliError::SerialiseReport)?;
    writer
        .write_all(payload.as_bytes())
        .map_err(CliError::WriteOutput)?;
    writer.write_all(b"\n").map_err(CliError::WriteOutput)
}

#[cfg(test)]
mod tests;
