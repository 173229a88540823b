//! Loading the snapshot inputs shared by several commands.

use std::io::BufReader;

use biota_core::{TaxonGraph, load_taxa_json};
use biota_pipeline::{ProviderDefinition, ProviderRegistry};
use camino::Utf8Path;

use crate::CliError;

/// Fail with [`CliError::Input`] unless `path` is a regular file.
pub(crate) fn require_input(path: &Utf8Path, field: &'static str) -> Result<(), CliError> {
    biota_fs::require_file(path).map_err(|source| CliError::Input { field, source })
}

/// Read and build the taxonomy snapshot at `path`.
pub(crate) fn load_taxonomy(path: &Utf8Path, field: &'static str) -> Result<TaxonGraph, CliError> {
    let file = biota_fs::open_snapshot(path).map_err(|source| CliError::Input { field, source })?;
    let taxa = load_taxa_json(BufReader::new(file)).map_err(|source| CliError::ParseSnapshot {
        path: path.to_owned(),
        source,
    })?;
    Ok(TaxonGraph::build(taxa)?)
}

/// Read provider definitions and register them with the built-in kinds.
///
/// Relative provider locations are resolved against the directory holding
/// the providers file.
pub(crate) fn load_registry(
    path: &Utf8Path,
    field: &'static str,
) -> Result<ProviderRegistry, CliError> {
    let contents =
        biota_fs::read_snapshot(path).map_err(|source| CliError::Input { field, source })?;
    let definitions: Vec<ProviderDefinition> =
        serde_json::from_str(&contents).map_err(|source| CliError::ParseSnapshot {
            path: path.to_owned(),
            source,
        })?;
    let base = path.parent().unwrap_or_else(|| Utf8Path::new(""));
    let mut registry = ProviderRegistry::with_builtin_kinds();
    for mut definition in definitions {
        if let Some(location) = definition.location.take() {
            let resolved = if location.is_relative() {
                base.as_std_path().join(location)
            } else {
                location
            };
            definition = definition.with_location(resolved);
        }
        registry.add_provider(definition)?;
    }
    Ok(registry)
}
