//! In-memory collaborators for pipeline tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use biota_core::test_support::{gull_taxonomy, swedish_areas};
use biota_core::{AreaIndex, DiffusionPolicy, TaxonGraph, TaxonId};
use serde_json::{Value, json};
use tokio::sync::watch;

use crate::mapping::map_darwin_core;
use crate::processor::ProcessorContext;
use crate::registry::{ProviderDefinition, ProviderRegistry};
use crate::slot::InstanceSlot;
use crate::source::{BatchSource, Cursor, MemorySource, SourceBatch, SourceError};
use crate::state::{ActivationRecord, ActivationStore, StateError, unix_now};

/// Kind tag bound by [`RegistryBuilder`].
pub const MEMORY_KIND: &str = "memory";

/// Context over the gull taxonomy and the central Sweden areas.
///
/// # Panics
///
/// Panics if the fixtures stop being valid.
#[must_use]
#[expect(clippy::expect_used, reason = "fixtures are known to be valid")]
pub fn gull_context() -> Arc<ProcessorContext> {
    Arc::new(ProcessorContext::new(
        TaxonGraph::build(gull_taxonomy()).expect("gull taxonomy is valid"),
        AreaIndex::from_areas(swedish_areas()).expect("fixture areas are valid"),
        DiffusionPolicy::default(),
    ))
}

/// `count` Darwin Core rows for `taxon_id` inside Stockholm municipality.
#[must_use]
#[expect(clippy::float_arithmetic, reason = "fixture coordinates step across a grid")]
pub fn dwc_rows(prefix: &str, taxon_id: TaxonId, count: usize) -> Vec<Value> {
    (0..count)
        .map(|index| {
            let step = u32::try_from(index % 100).unwrap_or_default();
            json!({
                "occurrenceID": format!("{prefix}-{index}"),
                "taxonID": taxon_id,
                "decimalLongitude": 18.0 + f64::from(step) / 1_000.0,
                "decimalLatitude": 59.3 + f64::from(step) / 1_000.0,
                "coordinateUncertaintyInMeters": 50,
                "locality": "Stockholm"
            })
        })
        .collect()
}

/// Source that always fails.
#[derive(Debug, Clone)]
pub struct FailingSource {
    message: String,
}

impl FailingSource {
    /// Source failing with `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl BatchSource for FailingSource {
    async fn next_batch(&self, _cursor: Cursor, _limit: usize) -> Result<SourceBatch, SourceError> {
        Err(SourceError::Unavailable {
            provider_id: "failing".to_owned(),
            message: self.message.clone(),
        })
    }
}

/// Source whose fetches never complete.
#[derive(Debug, Clone, Copy, Default)]
pub struct StalledSource;

#[async_trait]
impl BatchSource for StalledSource {
    async fn next_batch(&self, _cursor: Cursor, _limit: usize) -> Result<SourceBatch, SourceError> {
        std::future::pending().await
    }
}

/// Memory source that fails from a given offset until disarmed.
#[derive(Debug)]
pub struct InterruptedSource {
    inner: MemorySource,
    fail_from: u64,
    armed: AtomicBool,
}

impl InterruptedSource {
    /// Serve `rows` but fail any fetch starting at or after `fail_from`.
    #[must_use]
    pub const fn new(rows: Vec<Value>, fail_from: u64) -> Self {
        Self {
            inner: MemorySource::new(rows),
            fail_from,
            armed: AtomicBool::new(true),
        }
    }

    /// Let every later fetch succeed.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl BatchSource for InterruptedSource {
    async fn next_batch(&self, cursor: Cursor, limit: usize) -> Result<SourceBatch, SourceError> {
        if self.armed.load(Ordering::SeqCst) && cursor.value() >= self.fail_from {
            return Err(SourceError::Unavailable {
                provider_id: "interrupted".to_owned(),
                message: format!("connection lost at offset {cursor}"),
            });
        }
        self.inner.next_batch(cursor, limit).await
    }
}

/// Memory source whose fetches wait until [`HeldSource::release`] is called.
#[derive(Debug)]
pub struct HeldSource {
    inner: MemorySource,
    released: watch::Sender<bool>,
}

impl HeldSource {
    /// Hold `rows` back until released.
    #[must_use]
    pub fn new(rows: Vec<Value>) -> Self {
        Self {
            inner: MemorySource::new(rows),
            released: watch::Sender::new(false),
        }
    }

    /// Let every waiting and later fetch proceed.
    pub fn release(&self) {
        self.released.send_replace(true);
    }
}

#[async_trait]
impl BatchSource for HeldSource {
    async fn next_batch(&self, cursor: Cursor, limit: usize) -> Result<SourceBatch, SourceError> {
        let mut released = self.released.subscribe();
        released
            .wait_for(|open| *open)
            .await
            .map_err(|err| SourceError::Unavailable {
                provider_id: "held".to_owned(),
                message: err.to_string(),
            })?;
        self.inner.next_batch(cursor, limit).await
    }
}

/// Builds a registry whose providers read prepared sources.
#[derive(Default)]
pub struct RegistryBuilder {
    sources: HashMap<String, Arc<dyn BatchSource>>,
    definitions: Vec<ProviderDefinition>,
}

impl RegistryBuilder {
    /// Empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider backed by `source`.
    #[must_use]
    pub fn provider(mut self, id: &str, core: bool, source: Arc<dyn BatchSource>) -> Self {
        self.sources.insert(id.to_owned(), source);
        self.definitions
            .push(ProviderDefinition::new(id, MEMORY_KIND).with_core(core));
        self
    }

    /// Add a provider serving Darwin Core `rows` from memory.
    #[must_use]
    pub fn rows(self, id: &str, core: bool, rows: Vec<Value>) -> Self {
        self.provider(id, core, Arc::new(MemorySource::new(rows)))
    }

    /// Finish the registry.
    ///
    /// # Panics
    ///
    /// Panics when two providers share an id.
    #[must_use]
    #[expect(clippy::expect_used, reason = "duplicate ids are a test setup bug")]
    pub fn build(self) -> ProviderRegistry {
        let sources = Arc::new(self.sources);
        let mut registry = ProviderRegistry::new();
        registry.register_kind(
            MEMORY_KIND,
            Arc::new(move |definition: &ProviderDefinition| {
                sources
                    .get(&definition.id)
                    .cloned()
                    .ok_or_else(|| SourceError::Unavailable {
                        provider_id: definition.id.clone(),
                        message: "no prepared source".to_owned(),
                    })
            }),
            map_darwin_core,
        );
        for definition in self.definitions {
            registry
                .add_provider(definition)
                .expect("provider ids are unique");
        }
        registry
    }
}

/// Activation record held in memory with the same compare-and-set rules as
/// the SQLite store.
#[derive(Debug)]
pub struct MemoryActivationStore {
    record: Mutex<ActivationRecord>,
}

impl MemoryActivationStore {
    /// Store starting from `record`.
    #[must_use]
    pub const fn new(record: ActivationRecord) -> Self {
        Self {
            record: Mutex::new(record),
        }
    }
}

impl Default for MemoryActivationStore {
    fn default() -> Self {
        Self::new(ActivationRecord::INITIAL)
    }
}

#[async_trait]
impl ActivationStore for MemoryActivationStore {
    async fn load_activation(&self) -> Result<ActivationRecord, StateError> {
        Ok(*self.record.lock().unwrap_or_else(PoisonError::into_inner))
    }

    async fn compare_and_set(
        &self,
        expected_version: u64,
        active_slot: InstanceSlot,
    ) -> Result<Option<ActivationRecord>, StateError> {
        let mut record = self.record.lock().unwrap_or_else(PoisonError::into_inner);
        if record.version != expected_version {
            return Ok(None);
        }
        *record = ActivationRecord {
            active_slot,
            version: record.version.saturating_add(1),
            last_swap_at: Some(unix_now()),
        };
        Ok(Some(*record))
    }
}
