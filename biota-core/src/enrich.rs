//! Per-record enrichment and structural validation.

use std::fmt;

use geo::Coord;
use log::debug;

use crate::{
    AreaIndex, AreaType, CanonicalObservation, DiffusionPolicy, OccurrenceStatus, RegionRefs,
    TaxonGraph, TaxonSummary, ValidationState, generalize,
};

/// Problem found while enriching one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    /// The record has no stable key.
    MissingStableKey,
    /// The record has no provider identifier.
    MissingProviderId,
    /// The record has no position.
    MissingCoordinates,
    /// The position is outside WGS84 bounds or not finite.
    InvalidCoordinates,
    /// The taxon is not part of the taxonomy.
    UnknownTaxon {
        /// Identifier carried by the record.
        taxon_id: u64,
    },
    /// No county encloses the position.
    OutsideKnownAreas,
    /// The record carries no positional uncertainty.
    MissingCoordinateUncertainty,
    /// Region resolution failed for this record.
    AreaLookupFailed {
        /// Rendered lookup error.
        message: String,
    },
}

/// Whether an issue drops the record or only annotates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The record is excluded and counted as failed.
    Required,
    /// The record is published with warnings.
    Advisory,
}

impl ValidationIssue {
    /// Severity of this issue.
    pub const fn severity(&self) -> Severity {
        match self {
            Self::MissingStableKey
            | Self::MissingProviderId
            | Self::MissingCoordinates
            | Self::InvalidCoordinates
            | Self::UnknownTaxon { .. } => Severity::Required,
            Self::OutsideKnownAreas
            | Self::MissingCoordinateUncertainty
            | Self::AreaLookupFailed { .. } => Severity::Advisory,
        }
    }

    /// Whether this issue excludes the record.
    pub const fn is_required(&self) -> bool {
        matches!(self.severity(), Severity::Required)
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingStableKey => f.write_str("missing stable key"),
            Self::MissingProviderId => f.write_str("missing provider id"),
            Self::MissingCoordinates => f.write_str("missing coordinates"),
            Self::InvalidCoordinates => f.write_str("coordinates out of range"),
            Self::UnknownTaxon { taxon_id } => write!(f, "unknown taxon {taxon_id}"),
            Self::OutsideKnownAreas => f.write_str("outside every known county"),
            Self::MissingCoordinateUncertainty => f.write_str("missing coordinate uncertainty"),
            Self::AreaLookupFailed { message } => write!(f, "area lookup failed: {message}"),
        }
    }
}

/// Enriched record together with every issue found.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentOutcome {
    /// Record after enrichment; `validation_state` reflects `issues`.
    pub observation: CanonicalObservation,
    /// Issues in detection order.
    pub issues: Vec<ValidationIssue>,
}

impl EnrichmentOutcome {
    /// Whether the record is written to the sink.
    pub const fn is_publishable(&self) -> bool {
        self.observation.validation_state.is_publishable()
    }
}

/// Applies taxonomy, regions and diffusion to canonical records.
///
/// The enricher only reads from its collaborators. Any number of enrichers
/// may share one graph, index and policy across threads.
///
/// # Examples
///
/// ```
/// use biota_core::{
///     AreaIndex, CanonicalObservation, DiffusionPolicy, RecordEnricher, Taxon, TaxonGraph,
///     ValidationState,
/// };
///
/// let graph = TaxonGraph::build(vec![
///     Taxon::new(1, "Biota"),
///     Taxon::new(2, "Aquila chrysaetos").with_primary_parent(1).with_protection_level(3),
/// ])?;
/// let areas = AreaIndex::from_areas(Vec::new())?;
/// let policy = DiffusionPolicy::default();
/// let enricher = RecordEnricher::new(&graph, &areas, &policy);
///
/// let raw = CanonicalObservation::new("artportalen", "obs-1", 2)
///     .with_coordinates(18.07, 59.33)
///     .with_locality("Djurgården");
/// let outcome = enricher.enrich(raw);
///
/// assert!(outcome.observation.sensitive);
/// assert_eq!(outcome.observation.locality, None);
/// assert_eq!(outcome.observation.validation_state, ValidationState::ValidWithWarnings);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, Copy)]
pub struct RecordEnricher<'a> {
    graph: &'a TaxonGraph,
    areas: &'a AreaIndex,
    policy: &'a DiffusionPolicy,
}

impl<'a> RecordEnricher<'a> {
    /// Borrow the shared lookup structures.
    pub const fn new(
        graph: &'a TaxonGraph,
        areas: &'a AreaIndex,
        policy: &'a DiffusionPolicy,
    ) -> Self {
        Self {
            graph,
            areas,
            policy,
        }
    }

    /// Enrich and validate one record.
    pub fn enrich(&self, raw: CanonicalObservation) -> EnrichmentOutcome {
        let regions = self.resolvable_point(&raw).map(|point| {
            self.areas
                .resolve(point)
                .map_err(|err| err.to_string())
        });
        self.finish(raw, regions)
    }

    /// Enrich a batch, resolving regions for all records in one pass.
    ///
    /// Outcomes are identical to calling [`Self::enrich`] on each record in
    /// order. If the batched lookup fails, records fall back to individual
    /// lookups so each one reports its own failure.
    pub fn enrich_batch(&self, raws: Vec<CanonicalObservation>) -> Vec<EnrichmentOutcome> {
        let points: Vec<Coord<f64>> = raws
            .iter()
            .filter_map(|raw| self.resolvable_point(raw))
            .collect();
        let resolved = match self.areas.batch_resolve(&points) {
            Ok(resolved) => resolved,
            Err(err) => {
                debug!("batched area lookup failed, resolving records one by one: {err}");
                return raws.into_iter().map(|raw| self.enrich(raw)).collect();
            }
        };

        let mut resolved = resolved.into_iter();
        raws.into_iter()
            .map(|raw| {
                let regions = self
                    .resolvable_point(&raw)
                    .and_then(|_| resolved.next())
                    .map(Ok);
                self.finish(raw, regions)
            })
            .collect()
    }

    /// Position to resolve regions for: known taxon and valid coordinates.
    fn resolvable_point(&self, raw: &CanonicalObservation) -> Option<Coord<f64>> {
        if self.graph.get(raw.taxon_id).is_none() || !raw.has_valid_coordinates() {
            return None;
        }
        raw.coordinates
    }

    fn finish(
        &self,
        mut record: CanonicalObservation,
        regions: Option<Result<RegionRefs, String>>,
    ) -> EnrichmentOutcome {
        let mut issues = Vec::new();
        let coordinates_valid = record.has_valid_coordinates();
        let taxon = self.graph.get(record.taxon_id);

        match taxon {
            None => {
                record.taxon = None;
                record.region_refs = RegionRefs::default();
                record.sensitive = false;
                record.diffusion_radius_m = None;
            }
            Some(taxon) => {
                record.taxon = Some(TaxonSummary::from(taxon));
                match regions {
                    Some(Ok(found)) => record.region_refs = found,
                    Some(Err(message)) => {
                        record.region_refs = RegionRefs::default();
                        issues.push(ValidationIssue::AreaLookupFailed { message });
                    }
                    None => record.region_refs = RegionRefs::default(),
                }
                self.apply_diffusion(&mut record, taxon.protection_level, coordinates_valid);
            }
        }

        record.is_positive = record.occurrence_status != OccurrenceStatus::Absent;

        let regions_resolved = taxon.is_some()
            && coordinates_valid
            && !issues
                .iter()
                .any(|issue| matches!(issue, ValidationIssue::AreaLookupFailed { .. }));
        issues.extend(structural_issues(
            &record,
            taxon.is_some(),
            coordinates_valid,
            regions_resolved,
        ));
        record.validation_state = if issues.iter().any(ValidationIssue::is_required) {
            ValidationState::Invalid
        } else if issues.is_empty() {
            ValidationState::Valid
        } else {
            ValidationState::ValidWithWarnings
        };

        EnrichmentOutcome {
            observation: record,
            issues,
        }
    }

    fn apply_diffusion(
        &self,
        record: &mut CanonicalObservation,
        protection_level: u8,
        coordinates_valid: bool,
    ) {
        let decision = self
            .policy
            .evaluate(protection_level, record.free_usage_override);
        if !decision.must_diffuse {
            record.sensitive = false;
            record.diffusion_radius_m = None;
            return;
        }

        let radius = decision.radius_m;
        if coordinates_valid {
            record.coordinates = record.coordinates.map(|point| generalize(point, radius));
        }
        record.locality = None;
        record.sensitive = true;
        record.diffusion_radius_m = Some(radius);
        record.coordinate_uncertainty_m = Some(
            record
                .coordinate_uncertainty_m
                .map_or(radius, |existing| existing.max(radius)),
        );
    }
}

fn structural_issues(
    record: &CanonicalObservation,
    taxon_known: bool,
    coordinates_valid: bool,
    regions_resolved: bool,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if record.stable_key.trim().is_empty() {
        issues.push(ValidationIssue::MissingStableKey);
    }
    if record.provider_id.trim().is_empty() {
        issues.push(ValidationIssue::MissingProviderId);
    }
    match record.coordinates {
        None => issues.push(ValidationIssue::MissingCoordinates),
        Some(_) if !coordinates_valid => issues.push(ValidationIssue::InvalidCoordinates),
        Some(_) => {}
    }
    if !taxon_known {
        issues.push(ValidationIssue::UnknownTaxon {
            taxon_id: record.taxon_id,
        });
    }
    if regions_resolved && record.region_refs.get(AreaType::County).is_none() {
        issues.push(ValidationIssue::OutsideKnownAreas);
    }
    if record.coordinate_uncertainty_m.is_none() {
        issues.push(ValidationIssue::MissingCoordinateUncertainty);
    }
    issues
}
