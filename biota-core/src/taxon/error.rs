use thiserror::Error;

use super::TaxonId;

/// Errors raised while building or querying a [`super::TaxonGraph`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaxonGraphError {
    /// Two taxa in the snapshot share an identifier.
    #[error("taxon {taxon_id} appears more than once in the snapshot")]
    DuplicateTaxon {
        /// Repeated identifier.
        taxon_id: TaxonId,
    },
    /// A primary or secondary parent does not exist.
    #[error("taxon {taxon_id} references missing parent {parent_id}")]
    DanglingParent {
        /// Taxon holding the reference.
        taxon_id: TaxonId,
        /// Identifier that could not be found.
        parent_id: TaxonId,
    },
    /// No taxon lacks a primary parent.
    #[error("taxonomy has no root taxon")]
    MissingRoot,
    /// More than one taxon lacks a primary parent.
    #[error("taxonomy has several root taxa: {roots:?}")]
    MultipleRoots {
        /// Identifiers of every parentless taxon, ascending.
        roots: Vec<TaxonId>,
    },
    /// Primary parent edges loop back on themselves.
    #[error("primary parent edges form a cycle through {cycle:?}")]
    CycleDetected {
        /// Taxa along the loop, following primary parents.
        cycle: Vec<TaxonId>,
    },
    /// The requested taxon is not part of the graph.
    #[error("taxon {taxon_id} is not in the taxonomy")]
    UnknownTaxon {
        /// Requested identifier.
        taxon_id: TaxonId,
    },
}
