//! Entry point for the `biota` command.
#![forbid(unsafe_code)]

use std::error::Error;

use biota_cli::CliError;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "BIOTA_LOG";

fn main() {
    init_logging();
    match biota_cli::run() {
        Ok(()) => {}
        Err(CliError::ArgumentParsing(err)) => err.exit(),
        Err(err) => {
            eprintln!("biota: {err}");
            let mut cause = err.source();
            while let Some(inner) = cause {
                eprintln!("  caused by: {inner}");
                cause = inner.source();
            }
            std::process::exit(1);
        }
    }
}

/// Route `log` records to stderr, filtered by `BIOTA_LOG` (default `info`).
fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(err) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("biota: logging disabled: {err}");
    }
}
