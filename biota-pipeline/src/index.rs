//! Read path over the published slot.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use biota_core::{CanonicalObservation, TaxonGraph, TaxonGraphError, TaxonId};
use thiserror::Error;

use crate::sink::{BatchSink, RecordFilter, SinkError};
use crate::slot::InstanceSlot;
use crate::state::{ActivationStore, StateError};

/// Criteria for [`ObservationIndex::search`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservationQuery {
    /// Only records from this provider.
    pub provider_id: Option<String>,
    /// Only records of this taxon.
    pub taxon_id: Option<TaxonId>,
    /// Also match taxa below `taxon_id`.
    pub include_descendants: bool,
    /// Only records inside this county feature.
    pub county: Option<String>,
    /// At most this many records.
    pub limit: Option<usize>,
}

/// Errors raised while reading the published slot.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The activation record could not be read.
    #[error(transparent)]
    State(#[from] StateError),
    /// The sink failed.
    #[error(transparent)]
    Sink(#[from] SinkError),
    /// Descendant expansion failed.
    #[error(transparent)]
    Taxonomy(#[from] TaxonGraphError),
    /// Descendant expansion was requested without a taxonomy.
    #[error("descendant search needs a taxonomy")]
    NoTaxonomy,
}

/// Searches whichever slot is active when the query starts.
#[derive(Clone)]
pub struct ObservationIndex {
    activation: Arc<dyn ActivationStore>,
    sink: Arc<dyn BatchSink>,
    taxonomy: Option<Arc<TaxonGraph>>,
}

impl ObservationIndex {
    /// Index over `sink`, following `activation`.
    #[must_use]
    pub fn new(activation: Arc<dyn ActivationStore>, sink: Arc<dyn BatchSink>) -> Self {
        Self {
            activation,
            sink,
            taxonomy: None,
        }
    }

    /// Enable descendant expansion.
    #[must_use]
    pub fn with_taxonomy(mut self, taxonomy: Arc<TaxonGraph>) -> Self {
        self.taxonomy = Some(taxonomy);
        self
    }

    /// Slot readers should use.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::State`] when the record cannot be read.
    pub async fn read_active_slot(&self) -> Result<InstanceSlot, IndexError> {
        Ok(self.activation.load_activation().await?.active_slot)
    }

    /// Records of the active slot matching `query`, ordered by provider and
    /// stable key.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::NoTaxonomy`] or [`IndexError::Taxonomy`] when
    /// descendants cannot be expanded, and state or sink errors otherwise.
    pub async fn search(
        &self,
        query: &ObservationQuery,
    ) -> Result<Vec<CanonicalObservation>, IndexError> {
        let filter = RecordFilter {
            provider_id: query.provider_id.clone(),
            taxon_ids: self.taxa_for(query)?,
            county: query.county.clone(),
            limit: query.limit,
        };
        let slot = self.read_active_slot().await?;
        Ok(self.sink.search(slot, &filter).await?)
    }

    fn taxa_for(&self, query: &ObservationQuery) -> Result<Option<BTreeSet<TaxonId>>, IndexError> {
        let Some(taxon_id) = query.taxon_id else {
            return Ok(None);
        };
        if !query.include_descendants {
            return Ok(Some(BTreeSet::from([taxon_id])));
        }
        let taxonomy = self.taxonomy.as_ref().ok_or(IndexError::NoTaxonomy)?;
        let mut taxa = taxonomy.get_descendants(taxon_id, true)?;
        taxa.insert(taxon_id);
        Ok(Some(taxa))
    }
}

impl fmt::Debug for ObservationIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservationIndex")
            .field("taxonomy", &self.taxonomy.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![expect(clippy::expect_used, reason = "tests should fail fast when setup breaks")]

    use super::*;
    use crate::sink::MemorySink;
    use crate::test_support::MemoryActivationStore;
    use biota_core::test_support::{
        AUDOUINS_GULL, HERRING_GULL, LARUS, gull_taxonomy, synthetic_observations,
    };
    use rstest::{fixture, rstest};

    struct Fixture {
        index: ObservationIndex,
        activation: Arc<MemoryActivationStore>,
    }

    #[fixture]
    async fn fixture() -> Fixture {
        let sink = Arc::new(MemorySink::new());
        sink.write_batch(synthetic_observations("old", HERRING_GULL, 2), InstanceSlot::Zero)
            .await
            .expect("write active slot");
        let mut fresh = synthetic_observations("new", HERRING_GULL, 3);
        fresh.extend(synthetic_observations("new-rare", AUDOUINS_GULL, 1));
        sink.write_batch(fresh, InstanceSlot::One)
            .await
            .expect("write inactive slot");
        let activation = Arc::new(MemoryActivationStore::default());
        let taxonomy = Arc::new(TaxonGraph::build(gull_taxonomy()).expect("taxonomy"));
        Fixture {
            index: ObservationIndex::new(activation.clone(), sink).with_taxonomy(taxonomy),
            activation,
        }
    }

    #[rstest]
    #[tokio::test]
    async fn searches_follow_the_swap(#[future] fixture: Fixture) {
        let fixture = fixture.await;
        let all = ObservationQuery::default();
        assert_eq!(fixture.index.search(&all).await.expect("search").len(), 2);

        fixture
            .activation
            .compare_and_set(0, InstanceSlot::One)
            .await
            .expect("swap");
        assert_eq!(
            fixture.index.read_active_slot().await.expect("active"),
            InstanceSlot::One
        );
        assert_eq!(fixture.index.search(&all).await.expect("search").len(), 4);
    }

    #[rstest]
    #[tokio::test]
    async fn descendant_search_expands_the_taxonomy(#[future] fixture: Fixture) {
        let fixture = fixture.await;
        fixture
            .activation
            .compare_and_set(0, InstanceSlot::One)
            .await
            .expect("swap");

        let exact = ObservationQuery {
            taxon_id: Some(LARUS),
            ..ObservationQuery::default()
        };
        assert!(fixture.index.search(&exact).await.expect("search").is_empty());

        let below = ObservationQuery {
            include_descendants: true,
            ..exact
        };
        let found = fixture.index.search(&below).await.expect("search");
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|record| record.taxon_id == HERRING_GULL));
    }

    #[tokio::test]
    async fn descendant_search_needs_a_taxonomy() {
        let index = ObservationIndex::new(
            Arc::new(MemoryActivationStore::default()),
            Arc::new(MemorySink::new()),
        );
        let query = ObservationQuery {
            taxon_id: Some(HERRING_GULL),
            include_descendants: true,
            ..ObservationQuery::default()
        };
        let err = index.search(&query).await.expect_err("no taxonomy");
        assert!(matches!(err, IndexError::NoTaxonomy));
    }
}
