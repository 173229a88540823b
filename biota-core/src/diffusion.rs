//! Coordinate generalisation for sensitive taxa.
//!
//! A taxon's protection level decides whether an observation's position is
//! blurred before publication. Blurring snaps the point to the centre of a
//! square grid cell laid out in Web Mercator (EPSG:3857) metres, so every
//! point in one cell publishes the same position.

use std::{collections::BTreeMap, f64::consts::FRAC_PI_4};

use geo::Coord;
use thiserror::Error;

/// WGS84 semi-major axis used by Web Mercator, in metres.
const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Latitude limit of the Web Mercator square.
const MAX_MERCATOR_LATITUDE: f64 = 85.051_128_779_806_59;

/// Outcome of [`DiffusionPolicy::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffusionDecision {
    /// Whether the coordinates must be generalised.
    pub must_diffuse: bool,
    /// Grid cell side in metres; zero when no diffusion applies.
    pub radius_m: u32,
}

impl DiffusionDecision {
    /// Decision leaving the record untouched.
    pub const PUBLIC: Self = Self {
        must_diffuse: false,
        radius_m: 0,
    };
}

/// Errors raised when configuring a [`DiffusionPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffusionError {
    /// No radius was configured for any protection level.
    #[error("diffusion policy needs at least one radius")]
    EmptyRadii,
    /// Level zero marks public taxa and cannot carry a radius.
    #[error("protection level 0 is public and cannot carry a diffusion radius")]
    PublicLevelRadius,
}

/// Maps protection levels to diffusion radii.
///
/// # Examples
///
/// ```
/// use biota_core::DiffusionPolicy;
///
/// let policy = DiffusionPolicy::default();
/// assert!(!policy.evaluate(0, false).must_diffuse);
/// assert!(!policy.evaluate(2, true).must_diffuse);
///
/// let decision = policy.evaluate(2, false);
/// assert!(decision.must_diffuse);
/// assert_eq!(decision.radius_m, 5_000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffusionPolicy {
    radii: BTreeMap<u8, u32>,
}

impl Default for DiffusionPolicy {
    fn default() -> Self {
        Self {
            radii: BTreeMap::from([(1, 1_000), (2, 5_000), (3, 25_000), (4, 50_000)]),
        }
    }
}

impl DiffusionPolicy {
    /// Build a policy from a `level -> radius in metres` table.
    ///
    /// # Errors
    ///
    /// Returns [`DiffusionError::EmptyRadii`] for an empty table and
    /// [`DiffusionError::PublicLevelRadius`] when level 0 is configured.
    pub fn new(radii: BTreeMap<u8, u32>) -> Result<Self, DiffusionError> {
        if radii.is_empty() {
            return Err(DiffusionError::EmptyRadii);
        }
        if radii.contains_key(&0) {
            return Err(DiffusionError::PublicLevelRadius);
        }
        Ok(Self { radii })
    }

    /// Replace or add the radius for one level.
    ///
    /// # Errors
    ///
    /// Returns [`DiffusionError::PublicLevelRadius`] for level 0.
    pub fn with_radius(mut self, level: u8, radius_m: u32) -> Result<Self, DiffusionError> {
        if level == 0 {
            return Err(DiffusionError::PublicLevelRadius);
        }
        self.radii.insert(level, radius_m);
        Ok(self)
    }

    /// Configured `level -> radius` table.
    pub const fn radii(&self) -> &BTreeMap<u8, u32> {
        &self.radii
    }

    /// Decide whether a record of a taxon with `protection_level` is
    /// generalised.
    ///
    /// Levels without their own entry use the radius of the nearest lower
    /// configured level, or the smallest radius when none is lower.
    pub fn evaluate(&self, protection_level: u8, free_usage_override: bool) -> DiffusionDecision {
        if protection_level == 0 || free_usage_override {
            return DiffusionDecision::PUBLIC;
        }
        let radius_m = self
            .radii
            .range(..=protection_level)
            .next_back()
            .or_else(|| self.radii.iter().next())
            .map_or(0, |(_, radius)| *radius);
        DiffusionDecision {
            must_diffuse: true,
            radius_m,
        }
    }
}

/// Snap a WGS84 coordinate to the centre of its `radius_m` grid cell.
///
/// The cell grid is axis-aligned in Web Mercator metres; latitudes beyond
/// the projection's limit are clamped first. Cells straddling the
/// antimeridian publish their centre clamped to ±180°, so the result is
/// always a valid WGS84 position. The result is deterministic and
/// `generalize(generalize(c, r), r) == generalize(c, r)`. A zero radius
/// returns the input unchanged.
///
/// # Examples
///
/// ```
/// use geo::Coord;
/// use biota_core::generalize;
///
/// let stockholm = Coord { x: 18.0686, y: 59.3293 };
/// let blurred = generalize(stockholm, 5_000);
/// assert_ne!(blurred, stockholm);
/// assert_eq!(generalize(blurred, 5_000), blurred);
/// ```
pub fn generalize(coord: Coord<f64>, radius_m: u32) -> Coord<f64> {
    if radius_m == 0 {
        return coord;
    }
    let cell = f64::from(radius_m);
    let projected = to_web_mercator(coord);
    let snapped = Coord {
        x: snap_to_centre(projected.x, cell),
        y: snap_to_centre(projected.y, cell),
    };
    from_web_mercator(snapped)
}

fn snap_to_centre(value: f64, cell: f64) -> f64 {
    ((value / cell).floor() + 0.5) * cell
}

fn to_web_mercator(coord: Coord<f64>) -> Coord<f64> {
    let latitude = coord.y.clamp(-MAX_MERCATOR_LATITUDE, MAX_MERCATOR_LATITUDE);
    Coord {
        x: EARTH_RADIUS_M * coord.x.to_radians(),
        y: EARTH_RADIUS_M * (FRAC_PI_4 + latitude.to_radians() / 2.0).tan().ln(),
    }
}

fn from_web_mercator(coord: Coord<f64>) -> Coord<f64> {
    Coord {
        x: (coord.x / EARTH_RADIUS_M).to_degrees().clamp(-180.0, 180.0),
        y: (2.0 * (coord.y / EARTH_RADIUS_M).exp().atan() - 2.0 * FRAC_PI_4).to_degrees(),
    }
}
