//! Destinations for enriched observations, partitioned by instance slot.
//!
//! Writes are upserts keyed by `(slot, provider_id, stable_key)`, so
//! replaying a chunk after a crash leaves the slot unchanged.

use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use biota_core::{CanonicalObservation, TaxonId};
use thiserror::Error;

use crate::slot::InstanceSlot;

mod memory;
mod sqlite;

pub use memory::MemorySink;
pub use sqlite::SqliteSink;

/// Selection applied by [`BatchSink::search`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// Only records from this provider.
    pub provider_id: Option<String>,
    /// Only records of these taxa.
    pub taxon_ids: Option<BTreeSet<TaxonId>>,
    /// Only records inside this county feature.
    pub county: Option<String>,
    /// At most this many records.
    pub limit: Option<usize>,
}

impl RecordFilter {
    /// Whether `record` passes every criterion except the limit.
    #[must_use]
    pub fn matches(&self, record: &CanonicalObservation) -> bool {
        self.provider_id
            .as_ref()
            .is_none_or(|provider| *provider == record.provider_id)
            && self
                .taxon_ids
                .as_ref()
                .is_none_or(|taxa| taxa.contains(&record.taxon_id))
            && self.county.as_ref().is_none_or(|county| {
                record
                    .region_refs
                    .county
                    .as_ref()
                    .is_some_and(|region| region.feature_id == *county)
            })
    }
}

/// Errors raised by sinks.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink database could not be opened.
    #[error("failed to open observation store at {path:?}")]
    Open {
        /// Database location.
        path: PathBuf,
        /// Underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },
    /// A sink statement failed.
    #[error("failed to {operation} in observation store")]
    Store {
        /// Action that failed.
        operation: &'static str,
        /// Underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },
    /// A record could not be encoded or decoded.
    #[error("failed to encode observation {stable_key}")]
    Encode {
        /// Key of the record.
        stable_key: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
    /// A taxon id does not fit the store's signed integer column.
    #[error("observation {stable_key} has taxon id {taxon_id}, beyond the storable range")]
    TaxonIdOutOfRange {
        /// Key of the record.
        stable_key: String,
        /// Offending taxon id.
        taxon_id: TaxonId,
    },
    /// A blocking sink task panicked or was cancelled.
    #[error("observation store task failed")]
    Task {
        /// Join failure reported by tokio.
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Slot-partitioned observation store.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Upsert `records` into `slot`, returning how many were written.
    async fn write_batch(
        &self,
        records: Vec<CanonicalObservation>,
        slot: InstanceSlot,
    ) -> Result<usize, SinkError>;

    /// Remove every record of `provider_id` from `slot`.
    async fn clear_provider(&self, provider_id: &str, slot: InstanceSlot)
    -> Result<usize, SinkError>;

    /// Replace `provider_id`'s records in `to` with a copy of those in `from`.
    async fn copy_provider(
        &self,
        provider_id: &str,
        from: InstanceSlot,
        to: InstanceSlot,
    ) -> Result<usize, SinkError>;

    /// Number of `provider_id`'s records in `slot`.
    async fn count(&self, slot: InstanceSlot, provider_id: &str) -> Result<usize, SinkError>;

    /// Records in `slot` passing `filter`, ordered by provider then key.
    async fn search(
        &self,
        slot: InstanceSlot,
        filter: &RecordFilter,
    ) -> Result<Vec<CanonicalObservation>, SinkError>;
}

#[cfg(test)]
mod tests;
