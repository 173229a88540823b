//! Fixtures shared by unit, behaviour and downstream crate tests.

use geo::{MultiPolygon, polygon};

use crate::{Area, AreaKey, AreaType, CanonicalObservation, Taxon, TaxonId};

/// Root of [`gull_taxonomy`].
pub const BIOTA: TaxonId = 1;
/// Genus with four species in [`gull_taxonomy`].
pub const ICHTHYAETUS: TaxonId = 10;
/// Genus with two species in [`gull_taxonomy`].
pub const LARUS: TaxonId = 20;
/// Public species (protection level 0) in [`gull_taxonomy`].
pub const HERRING_GULL: TaxonId = 21;
/// Protected species (protection level 2) in [`gull_taxonomy`].
pub const AUDOUINS_GULL: TaxonId = 13;

/// Small gull taxonomy with one secondary edge.
///
/// Ichthyaetus holds four species; Larus holds two, one of which also lists
/// Ichthyaetus as a secondary parent.
pub fn gull_taxonomy() -> Vec<Taxon> {
    vec![
        Taxon::new(BIOTA, "Biota"),
        Taxon::new(2, "Aves").with_primary_parent(BIOTA),
        Taxon::new(3, "Laridae").with_primary_parent(2),
        Taxon::new(ICHTHYAETUS, "Ichthyaetus").with_primary_parent(3),
        Taxon::new(11, "Ichthyaetus ichthyaetus").with_primary_parent(ICHTHYAETUS),
        Taxon::new(12, "Ichthyaetus melanocephalus").with_primary_parent(ICHTHYAETUS),
        Taxon::new(AUDOUINS_GULL, "Ichthyaetus audouinii")
            .with_primary_parent(ICHTHYAETUS)
            .with_protection_level(2)
            .with_vernacular_name("Audouin's gull"),
        Taxon::new(14, "Ichthyaetus relictus").with_primary_parent(ICHTHYAETUS),
        Taxon::new(LARUS, "Larus").with_primary_parent(3),
        Taxon::new(HERRING_GULL, "Larus argentatus")
            .with_primary_parent(LARUS)
            .with_secondary_parent(ICHTHYAETUS)
            .with_vernacular_name("herring gull"),
        Taxon::new(22, "Larus marinus").with_primary_parent(LARUS),
    ]
}

/// Axis-aligned rectangular area with corners `min` and `max`.
///
/// # Panics
///
/// Panics when `min` and `max` describe an empty rectangle.
pub fn square_area(
    area_type: AreaType,
    feature_id: &str,
    name: &str,
    min: (f64, f64),
    max: (f64, f64),
) -> Area {
    let outline = polygon![
        (x: min.0, y: min.1),
        (x: max.0, y: min.1),
        (x: max.0, y: max.1),
        (x: min.0, y: max.1),
    ];
    Area::new(
        AreaKey::new(area_type, feature_id),
        name,
        MultiPolygon::new(vec![outline]),
    )
    .expect("fixture squares are non-empty")
}

/// A county and municipality covering central Sweden.
pub fn swedish_areas() -> Vec<Area> {
    vec![
        square_area(AreaType::County, "01", "Stockholm", (17.0, 58.7), (19.5, 60.2)),
        square_area(
            AreaType::Municipality,
            "0180",
            "Stockholm",
            (17.8, 59.2),
            (18.3, 59.45),
        ),
        square_area(AreaType::EconomicZone, "SE", "Sweden", (10.0, 55.0), (25.0, 69.1)),
    ]
}

/// `count` valid records for `taxon_id`, keyed `{provider_id}-{n}` and
/// spread across central Stockholm.
pub fn synthetic_observations(
    provider_id: &str,
    taxon_id: TaxonId,
    count: usize,
) -> Vec<CanonicalObservation> {
    (0..count)
        .map(|index| synthetic_observation(provider_id, taxon_id, index))
        .collect()
}

/// One valid record, deterministic in `index`.
pub fn synthetic_observation(
    provider_id: &str,
    taxon_id: TaxonId,
    index: usize,
) -> CanonicalObservation {
    let step = f64::from(u32::try_from(index % 100).unwrap_or(0)) * 0.001;
    CanonicalObservation::new(provider_id, format!("{provider_id}-{index}"), taxon_id)
        .with_coordinates(18.0 + step, 59.3 + step)
        .with_uncertainty(50)
        .with_locality("Stockholm")
}
