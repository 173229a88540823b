//! Core domain model for the Biota observation pipeline.
//!
//! The crate holds the read-only lookup structures shared by every provider
//! during a processing run ([`TaxonGraph`], [`AreaIndex`] and
//! [`DiffusionPolicy`]) together with the canonical record type and the
//! [`RecordEnricher`] that applies them to one record at a time.
//!
//! Nothing here performs I/O on the hot path. The optional `store-sqlite`
//! feature adds a SQLite-backed area store.
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod area;
pub mod diffusion;
pub mod enrich;
pub mod observation;
pub mod taxon;

#[cfg(any(test, feature = "test-support"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-support")))]
pub mod test_support;

pub use area::{
    Area, AreaError, AreaIndex, AreaKey, AreaSummary, AreaType, Cache, CacheEvent,
    GeometrySource, MemoryGeometrySource, RegionRef, RegionRefs,
};
#[cfg(feature = "store-sqlite")]
pub use area::{SqliteGeometrySource, write_area_store};
pub use diffusion::{DiffusionDecision, DiffusionError, DiffusionPolicy, generalize};
pub use enrich::{EnrichmentOutcome, RecordEnricher, Severity, ValidationIssue};
pub use observation::{
    CanonicalObservation, OccurrenceStatus, TaxonSummary, ValidationState, is_valid_wgs84,
};
#[cfg(feature = "serde")]
pub use taxon::load_taxa_json;
pub use taxon::{Taxon, TaxonGraph, TaxonGraphError, TaxonId};
