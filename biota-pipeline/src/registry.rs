//! Provider definitions and the capabilities behind each provider kind.
//!
//! A provider kind is a tag such as `dwc-staging` bound to a source factory
//! and a [`RowMapper`]. Runs resolve their provider ids once, up front, into
//! [`ProviderHandle`]s that carry everything the processor needs.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mapping::{ProviderContext, RowMapper, map_darwin_core};
use crate::source::{BatchSource, MemorySource, SourceError, SqliteStagingSource};

/// Kind tag for providers staged in a SQLite `staged_records` table.
pub const DWC_STAGING_KIND: &str = "dwc-staging";
/// Kind tag for providers delivered as a JSON array file.
pub const DWC_JSON_KIND: &str = "dwc-json";

/// Declarative description of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDefinition {
    /// Unique provider identifier.
    pub id: String,
    /// Kind tag selecting the source and mapper.
    pub kind: String,
    /// Whether a failure of this provider blocks a partial swap.
    #[serde(default)]
    pub core: bool,
    /// Where the provider's rows live, interpreted by the kind.
    #[serde(default)]
    pub location: Option<PathBuf>,
}

impl ProviderDefinition {
    /// Non-core definition without a location.
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            core: false,
            location: None,
        }
    }

    /// Mark the provider as core.
    #[must_use]
    pub const fn with_core(mut self, core: bool) -> Self {
        self.core = core;
        self
    }

    /// Set the location the kind reads from.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Builds the source for one provider definition.
pub type SourceFactory =
    Arc<dyn Fn(&ProviderDefinition) -> Result<Arc<dyn BatchSource>, SourceError> + Send + Sync>;

/// Errors raised while registering or resolving providers.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A provider id was registered twice.
    #[error("provider {id} is already registered")]
    DuplicateProvider {
        /// Provider identifier.
        id: String,
    },
    /// A definition names a kind nobody registered.
    #[error("provider {id} has unknown kind '{kind}'")]
    UnknownKind {
        /// Provider identifier.
        id: String,
        /// Kind tag.
        kind: String,
    },
    /// A run asked for a provider that is not registered.
    #[error("unknown provider {id}")]
    UnknownProvider {
        /// Provider identifier.
        id: String,
    },
    /// The providers file is not valid JSON.
    #[error("failed to parse provider definitions")]
    Parse {
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
    /// The source for a provider could not be built.
    #[error("failed to open source for provider {id}")]
    Source {
        /// Provider identifier.
        id: String,
        /// Underlying source error.
        #[source]
        source: SourceError,
    },
}

#[derive(Clone)]
struct ProviderKind {
    factory: SourceFactory,
    mapper: RowMapper,
}

/// Everything needed to process one provider during a run.
#[derive(Clone)]
pub struct ProviderHandle {
    /// The provider's definition.
    pub definition: ProviderDefinition,
    /// Source of raw rows.
    pub source: Arc<dyn BatchSource>,
    /// Mapper for the provider's kind.
    pub mapper: RowMapper,
}

impl ProviderHandle {
    /// Provider identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// Context passed to the mapper.
    #[must_use]
    pub fn context(&self) -> ProviderContext {
        ProviderContext {
            provider_id: self.definition.id.clone(),
            kind: self.definition.kind.clone(),
        }
    }
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// Provider kinds and the providers defined against them.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    kinds: HashMap<String, ProviderKind>,
    providers: BTreeMap<String, ProviderDefinition>,
}

impl ProviderRegistry {
    /// Registry with no kinds and no providers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the Darwin Core staging and JSON file kinds.
    #[must_use]
    pub fn with_builtin_kinds() -> Self {
        let mut registry = Self::new();
        registry.register_kind(DWC_STAGING_KIND, Arc::new(open_staging), map_darwin_core);
        registry.register_kind(DWC_JSON_KIND, Arc::new(open_json_file), map_darwin_core);
        registry
    }

    /// Bind `tag` to a source factory and mapper, replacing any earlier binding.
    pub fn register_kind(&mut self, tag: impl Into<String>, factory: SourceFactory, mapper: RowMapper) {
        self.kinds
            .insert(tag.into(), ProviderKind { factory, mapper });
    }

    /// Add a provider definition.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownKind`] when the kind is not
    /// registered and [`RegistryError::DuplicateProvider`] when the id is
    /// taken.
    pub fn add_provider(&mut self, definition: ProviderDefinition) -> Result<(), RegistryError> {
        if !self.kinds.contains_key(&definition.kind) {
            return Err(RegistryError::UnknownKind {
                id: definition.id,
                kind: definition.kind,
            });
        }
        if self.providers.contains_key(&definition.id) {
            return Err(RegistryError::DuplicateProvider { id: definition.id });
        }
        self.providers.insert(definition.id.clone(), definition);
        Ok(())
    }

    /// Add every definition in a JSON array read from `reader`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Parse`] for malformed JSON and the errors of
    /// [`Self::add_provider`] for invalid definitions.
    pub fn load_providers_json<R: Read>(&mut self, reader: R) -> Result<usize, RegistryError> {
        let definitions: Vec<ProviderDefinition> =
            serde_json::from_reader(reader).map_err(|source| RegistryError::Parse { source })?;
        let count = definitions.len();
        for definition in definitions {
            self.add_provider(definition)?;
        }
        Ok(count)
    }

    /// Registered definitions ordered by id.
    pub fn definitions(&self) -> impl Iterator<Item = &ProviderDefinition> {
        self.providers.values()
    }

    /// Look up one definition.
    #[must_use]
    pub fn definition(&self, id: &str) -> Option<&ProviderDefinition> {
        self.providers.get(id)
    }

    /// Resolve provider ids into handles, opening each source once.
    ///
    /// An empty `ids` slice selects every registered provider. Duplicates
    /// are resolved once.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownProvider`] for ids that are not
    /// registered and [`RegistryError::Source`] when a source fails to open.
    pub fn resolve(&self, ids: &[String]) -> Result<Vec<ProviderHandle>, RegistryError> {
        let selected: Vec<&ProviderDefinition> = if ids.is_empty() {
            self.providers.values().collect()
        } else {
            let mut seen = BTreeMap::new();
            for id in ids {
                let definition = self
                    .providers
                    .get(id)
                    .ok_or_else(|| RegistryError::UnknownProvider { id: id.clone() })?;
                seen.insert(id.as_str(), definition);
            }
            seen.into_values().collect()
        };

        selected
            .into_iter()
            .map(|definition| self.handle(definition))
            .collect()
    }

    fn handle(&self, definition: &ProviderDefinition) -> Result<ProviderHandle, RegistryError> {
        let kind = self
            .kinds
            .get(&definition.kind)
            .ok_or_else(|| RegistryError::UnknownKind {
                id: definition.id.clone(),
                kind: definition.kind.clone(),
            })?;
        let source = (kind.factory)(definition).map_err(|source| RegistryError::Source {
            id: definition.id.clone(),
            source,
        })?;
        Ok(ProviderHandle {
            definition: definition.clone(),
            source,
            mapper: kind.mapper,
        })
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&String> = self.kinds.keys().collect();
        kinds.sort();
        f.debug_struct("ProviderRegistry")
            .field("kinds", &kinds)
            .field("providers", &self.providers)
            .finish()
    }
}

fn required_location(definition: &ProviderDefinition) -> Result<&PathBuf, SourceError> {
    definition
        .location
        .as_ref()
        .ok_or_else(|| SourceError::Unavailable {
            provider_id: definition.id.clone(),
            message: format!("kind '{}' needs a location", definition.kind),
        })
}

fn open_staging(definition: &ProviderDefinition) -> Result<Arc<dyn BatchSource>, SourceError> {
    let path = required_location(definition)?;
    let source = SqliteStagingSource::open(path, definition.id.clone())?;
    Ok(Arc::new(source))
}

fn open_json_file(definition: &ProviderDefinition) -> Result<Arc<dyn BatchSource>, SourceError> {
    let path = required_location(definition)?;
    Ok(Arc::new(MemorySource::from_json_file(path)?))
}

#[cfg(test)]
mod tests {
    #![expect(clippy::expect_used, reason = "tests should fail fast when setup breaks")]

    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn registry() -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register_kind(
            "memory",
            Arc::new(|_: &ProviderDefinition| {
                Ok(Arc::new(MemorySource::default()) as Arc<dyn BatchSource>)
            }),
            map_darwin_core,
        );
        registry
            .add_provider(ProviderDefinition::new("b", "memory"))
            .expect("add b");
        registry
            .add_provider(ProviderDefinition::new("a", "memory").with_core(true))
            .expect("add a");
        registry
    }

    #[rstest]
    fn empty_selection_resolves_every_provider_in_id_order(registry: ProviderRegistry) {
        let handles = registry.resolve(&[]).expect("resolve");
        let ids: Vec<&str> = handles.iter().map(ProviderHandle::id).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[rstest]
    fn duplicate_ids_resolve_once(registry: ProviderRegistry) {
        let handles = registry
            .resolve(&["b".to_owned(), "b".to_owned()])
            .expect("resolve");
        assert_eq!(handles.len(), 1);
    }

    #[rstest]
    fn unknown_providers_and_kinds_are_rejected(mut registry: ProviderRegistry) {
        assert!(matches!(
            registry.resolve(&["z".to_owned()]),
            Err(RegistryError::UnknownProvider { id }) if id == "z"
        ));
        assert!(matches!(
            registry.add_provider(ProviderDefinition::new("c", "ftp")),
            Err(RegistryError::UnknownKind { .. })
        ));
        assert!(matches!(
            registry.add_provider(ProviderDefinition::new("a", "memory")),
            Err(RegistryError::DuplicateProvider { .. })
        ));
    }

    #[rstest]
    fn definitions_load_from_json() {
        let mut registry = ProviderRegistry::with_builtin_kinds();
        let json = r#"[
            {"id": "artportalen", "kind": "dwc-staging", "core": true, "location": "staging.db"},
            {"id": "inaturalist", "kind": "dwc-json", "location": "inat.json"}
        ]"#;
        let count = registry
            .load_providers_json(json.as_bytes())
            .expect("load definitions");
        assert_eq!(count, 2);
        let core = registry.definition("artportalen").expect("artportalen");
        assert!(core.core);
        assert!(!registry.definition("inaturalist").expect("inaturalist").core);
    }

    #[rstest]
    fn builtin_kinds_need_a_location() {
        let mut registry = ProviderRegistry::with_builtin_kinds();
        registry
            .add_provider(ProviderDefinition::new("nowhere", DWC_JSON_KIND))
            .expect("add");
        assert!(matches!(
            registry.resolve(&[]),
            Err(RegistryError::Source {
                source: SourceError::Unavailable { .. },
                ..
            })
        ));
    }
}
