//! Canonical observation record shared by mappers, the enricher and sinks.

use geo::Coord;

use crate::{RegionRefs, Taxon, TaxonId};

/// Whether the observer recorded the taxon as present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum OccurrenceStatus {
    /// The taxon was observed.
    #[default]
    Present,
    /// The taxon was searched for and not found.
    Absent,
}

/// Result of structural validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum ValidationState {
    /// Not yet enriched.
    #[default]
    Unvalidated,
    /// No issues found.
    Valid,
    /// Only advisory issues found; the record is still published.
    ValidWithWarnings,
    /// At least one required check failed; the record is dropped.
    Invalid,
}

impl ValidationState {
    /// Whether records in this state are written to the sink.
    pub const fn is_publishable(self) -> bool {
        matches!(self, Self::Valid | Self::ValidWithWarnings)
    }
}

/// Taxon details denormalised onto an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TaxonSummary {
    /// Taxon identifier.
    pub id: TaxonId,
    /// Accepted scientific name.
    pub scientific_name: String,
    /// Common name, when known.
    pub vernacular_name: Option<String>,
    /// Protection level, zero for public taxa.
    pub protection_level: u8,
}

impl From<&Taxon> for TaxonSummary {
    fn from(taxon: &Taxon) -> Self {
        Self {
            id: taxon.id,
            scientific_name: taxon.scientific_name.clone(),
            vernacular_name: taxon.vernacular_name.clone(),
            protection_level: taxon.protection_level,
        }
    }
}

/// One observation in the canonical schema.
///
/// Mappers fill the provider-supplied fields; [`crate::RecordEnricher`]
/// fills `region_refs`, `taxon`, `is_positive`, `sensitive`,
/// `diffusion_radius_m` and `validation_state`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct CanonicalObservation {
    /// Identity of the record, stable across harvests of one provider.
    pub stable_key: String,
    /// Provider the record came from.
    pub provider_id: String,
    /// Observed taxon.
    pub taxon_id: TaxonId,
    /// WGS84 position with `x = longitude` and `y = latitude`.
    pub coordinates: Option<Coord<f64>>,
    /// Positional uncertainty in metres.
    pub coordinate_uncertainty_m: Option<u32>,
    /// Presence or absence.
    pub occurrence_status: OccurrenceStatus,
    /// Free-text place description.
    pub locality: Option<String>,
    /// Record-level permission to publish exact positions.
    pub free_usage_override: bool,
    /// Regions enclosing the true position.
    pub region_refs: RegionRefs,
    /// Denormalised taxon details.
    pub taxon: Option<TaxonSummary>,
    /// Whether the record counts as a positive observation.
    pub is_positive: bool,
    /// Whether the position was generalised.
    pub sensitive: bool,
    /// Grid cell side used for generalisation.
    pub diffusion_radius_m: Option<u32>,
    /// Outcome of structural validation.
    pub validation_state: ValidationState,
}

impl CanonicalObservation {
    /// Start a record with only its identity filled in.
    pub fn new(
        provider_id: impl Into<String>,
        stable_key: impl Into<String>,
        taxon_id: TaxonId,
    ) -> Self {
        Self {
            stable_key: stable_key.into(),
            provider_id: provider_id.into(),
            taxon_id,
            coordinates: None,
            coordinate_uncertainty_m: None,
            occurrence_status: OccurrenceStatus::Present,
            locality: None,
            free_usage_override: false,
            region_refs: RegionRefs::default(),
            taxon: None,
            is_positive: false,
            sensitive: false,
            diffusion_radius_m: None,
            validation_state: ValidationState::Unvalidated,
        }
    }

    /// Set the WGS84 position.
    #[must_use]
    pub fn with_coordinates(mut self, longitude: f64, latitude: f64) -> Self {
        self.coordinates = Some(Coord {
            x: longitude,
            y: latitude,
        });
        self
    }

    /// Set the positional uncertainty.
    #[must_use]
    pub fn with_uncertainty(mut self, metres: u32) -> Self {
        self.coordinate_uncertainty_m = Some(metres);
        self
    }

    /// Set the occurrence status.
    #[must_use]
    pub fn with_status(mut self, status: OccurrenceStatus) -> Self {
        self.occurrence_status = status;
        self
    }

    /// Set the free-text locality.
    #[must_use]
    pub fn with_locality(mut self, locality: impl Into<String>) -> Self {
        self.locality = Some(locality.into());
        self
    }

    /// Allow exact positions to be published regardless of protection.
    #[must_use]
    pub fn with_free_usage(mut self, allowed: bool) -> Self {
        self.free_usage_override = allowed;
        self
    }

    /// Whether the stored position lies inside WGS84 bounds.
    pub fn has_valid_coordinates(&self) -> bool {
        self.coordinates.is_some_and(is_valid_wgs84)
    }
}

/// Whether `coord` is finite and within longitude/latitude bounds.
pub fn is_valid_wgs84(coord: Coord<f64>) -> bool {
    coord.x.is_finite()
        && coord.y.is_finite()
        && (-180.0..=180.0).contains(&coord.x)
        && (-90.0..=90.0).contains(&coord.y)
}
