//! Taxonomic hierarchy for enrichment.
//!
//! A [`Taxon`] carries a single authoritative primary parent and any number of
//! secondary parents. [`TaxonGraph`] indexes a full snapshot of taxa into
//! adjacency lists so descendant expansion and diagnostics stay cheap.
//!
//! Primary edges form the ownership tree. Secondary edges are extra,
//! non-owning relations: they widen descendant queries on request and take
//! part in cycle diagnostics, but never redefine a taxon's primary parent.

mod error;
mod graph;

pub use error::TaxonGraphError;
pub use graph::TaxonGraph;

#[cfg(feature = "serde")]
use serde::Deserialize;

/// Identifier of a taxon within a taxonomy snapshot.
pub type TaxonId = u64;

/// A node of the taxonomy.
///
/// # Examples
///
/// ```
/// use biota_core::Taxon;
///
/// let root = Taxon::new(0, "Biota");
/// let aves = Taxon::new(1, "Aves").with_primary_parent(0);
/// assert!(root.is_root());
/// assert_eq!(aves.primary_parent_id, Some(0));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct Taxon {
    /// Unique identifier.
    pub id: TaxonId,
    /// Accepted scientific name.
    pub scientific_name: String,
    /// Common name, when one is known.
    #[cfg_attr(feature = "serde", serde(default))]
    pub vernacular_name: Option<String>,
    /// Authoritative parent; `None` only for the root.
    #[cfg_attr(feature = "serde", serde(default))]
    pub primary_parent_id: Option<TaxonId>,
    /// Additional non-authoritative parents.
    #[cfg_attr(feature = "serde", serde(default))]
    pub secondary_parent_ids: Vec<TaxonId>,
    /// Sensitivity classification; `0` means public.
    #[cfg_attr(feature = "serde", serde(default))]
    pub protection_level: u8,
}

impl Taxon {
    /// Construct a public root-level taxon with no parents.
    pub fn new(id: TaxonId, scientific_name: impl Into<String>) -> Self {
        Self {
            id,
            scientific_name: scientific_name.into(),
            vernacular_name: None,
            primary_parent_id: None,
            secondary_parent_ids: Vec::new(),
            protection_level: 0,
        }
    }

    /// Set the primary parent.
    #[must_use]
    pub fn with_primary_parent(mut self, parent_id: TaxonId) -> Self {
        self.primary_parent_id = Some(parent_id);
        self
    }

    /// Append a secondary parent.
    #[must_use]
    pub fn with_secondary_parent(mut self, parent_id: TaxonId) -> Self {
        self.secondary_parent_ids.push(parent_id);
        self
    }

    /// Set the protection level.
    #[must_use]
    pub fn with_protection_level(mut self, level: u8) -> Self {
        self.protection_level = level;
        self
    }

    /// Set the vernacular name.
    #[must_use]
    pub fn with_vernacular_name(mut self, name: impl Into<String>) -> Self {
        self.vernacular_name = Some(name.into());
        self
    }

    /// Whether this taxon has no primary parent.
    pub fn is_root(&self) -> bool {
        self.primary_parent_id.is_none()
    }
}

/// Read a JSON array of taxa.
///
/// # Examples
///
/// ```
/// use biota_core::load_taxa_json;
///
/// let json = r#"[
///     {"id": 1, "scientificName": "Biota"},
///     {"id": 2, "scientificName": "Aves", "primaryParentId": 1, "protectionLevel": 0}
/// ]"#;
/// let taxa = load_taxa_json(json.as_bytes())?;
/// assert_eq!(taxa.len(), 2);
/// # Ok::<(), serde_json::Error>(())
/// ```
#[cfg(feature = "serde")]
pub fn load_taxa_json<R: std::io::Read>(reader: R) -> Result<Vec<Taxon>, serde_json::Error> {
    serde_json::from_reader(reader)
}
