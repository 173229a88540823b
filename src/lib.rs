//! Facade crate for the Biota observation pipeline.
//!
//! This crate re-exports the core lookup structures and, behind the
//! `pipeline` feature, the orchestration layer that publishes processed
//! observations through blue/green slots.

#![forbid(unsafe_code)]

pub use biota_core::{
    Area, AreaError, AreaIndex, AreaType, CanonicalObservation, DiffusionDecision,
    DiffusionError, DiffusionPolicy, EnrichmentOutcome, RecordEnricher, RegionRefs, Taxon,
    TaxonGraph, TaxonGraphError, TaxonId,
};

#[cfg(feature = "serde")]
pub use biota_core::load_taxa_json;

#[cfg(feature = "store-sqlite")]
pub use biota_core::{SqliteGeometrySource, write_area_store};

#[cfg(feature = "pipeline")]
pub use biota_pipeline::{
    BatchProcessor, InstanceCoordinator, InstanceSlot, ObservationIndex, ObservationQuery,
    OrchestratorConfig, OrchestratorError, PipelineOrchestrator, ProcessGeneration,
    ProcessorContext, ProviderDefinition, ProviderRegistry, RunHandle, RunId, RunMode,
    RunOutcome, RunReport, SqliteSink, StateStore,
};

#[cfg(feature = "test-support")]
pub use biota_core::test_support;
