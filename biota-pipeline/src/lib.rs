//! Processing runs for the Biota observation pipeline.
//!
//! Providers are read through [`BatchSource`] implementations, mapped into
//! canonical records, enriched with the lookup structures from
//! [`biota_core`], and written into the inactive [`InstanceSlot`] of a
//! [`BatchSink`]. When a run satisfies its [`RunMode`], the
//! [`InstanceCoordinator`] publishes the slot with a single compare-and-set
//! on the persisted activation record.
//!
//! Run and generation state lives in a SQLite [`StateStore`] so interrupted
//! providers can resume from their last confirmed cursor.
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod coordinator;
pub mod index;
pub mod mapping;
pub mod orchestrator;
pub mod processor;
pub mod registry;
pub mod sink;
pub mod slot;
pub mod source;
pub mod state;

#[cfg(any(test, feature = "test-support"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-support")))]
pub mod test_support;

pub use coordinator::{InstanceCoordinator, SwapResult, SwapTicket};
pub use index::{IndexError, ObservationIndex, ObservationQuery};
pub use mapping::{MappingError, ProviderContext, RowMapper, map_darwin_core};
pub use orchestrator::{
    NotSwappedReason, OrchestratorConfig, OrchestratorError, PipelineOrchestrator, RunHandle,
    RunOutcome, RunReport,
};
pub use processor::{
    BatchProcessor, DEFAULT_CHUNK_SIZE, ProcessorContext, ProviderFailure, ProviderJob,
};
pub use registry::{
    DWC_JSON_KIND, DWC_STAGING_KIND, ProviderDefinition, ProviderHandle, ProviderRegistry,
    RegistryError, SourceFactory,
};
pub use sink::{BatchSink, MemorySink, RecordFilter, SinkError, SqliteSink};
pub use slot::InstanceSlot;
pub use source::{
    BatchSource, Cursor, MemorySource, RawRecord, SourceBatch, SourceError, SqliteStagingSource,
    stage_records,
};
pub use state::{
    ActivationRecord, ActivationStore, GenerationLedger, GenerationStatus, ProcessGeneration,
    RunId, RunMode, RunRecord, SCHEMA_VERSION, SlotLease, StateError, StateStore, unix_now,
};
