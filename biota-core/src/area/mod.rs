//! Administrative and ecological regions used to place observations.
//!
//! Areas are keyed by `(AreaType, feature id)` because feature ids repeat
//! across area types. [`AreaIndex`] answers point-in-polygon queries against
//! an R\*-tree of bounding boxes and loads full geometries lazily through a
//! [`GeometrySource`], keeping them in a shared [`Cache`].
//!
//! Coordinates are WGS84 with `x = longitude` and `y = latitude`.

mod cache;
mod error;
mod index;
mod source;
#[cfg(feature = "store-sqlite")]
mod store;

use std::{fmt, str::FromStr};

use geo::{BoundingRect, MultiPolygon, Rect};

pub use cache::{Cache, CacheEvent};
pub use error::AreaError;
pub use index::AreaIndex;
pub use source::{GeometrySource, MemoryGeometrySource};
#[cfg(feature = "store-sqlite")]
pub use store::{SqliteGeometrySource, write_area_store};

/// Kinds of region an observation is placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum AreaType {
    /// First-level administrative division.
    County,
    /// Second-level administrative division.
    Municipality,
    /// Historical biogeographic province.
    Province,
    /// Church parish.
    Parish,
    /// Fixed-size atlas grid square.
    AtlasSquare,
    /// Exclusive economic zone of the country.
    EconomicZone,
}

impl AreaType {
    /// Every area type, in resolution order.
    pub const ALL: [Self; 6] = [
        Self::County,
        Self::Municipality,
        Self::Province,
        Self::Parish,
        Self::AtlasSquare,
        Self::EconomicZone,
    ];

    /// Stable textual tag used in persisted artefacts.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::County => "county",
            Self::Municipality => "municipality",
            Self::Province => "province",
            Self::Parish => "parish",
            Self::AtlasSquare => "atlas-square",
            Self::EconomicZone => "economic-zone",
        }
    }
}

impl fmt::Display for AreaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AreaType {
    type Err = AreaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|area_type| area_type.as_str() == value)
            .ok_or_else(|| AreaError::UnknownAreaType {
                value: value.to_owned(),
            })
    }
}

/// Composite identity of an area.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AreaKey {
    /// Kind of region.
    pub area_type: AreaType,
    /// Feature identifier, unique within its area type only.
    pub feature_id: String,
}

impl AreaKey {
    /// Build a key from its parts.
    pub fn new(area_type: AreaType, feature_id: impl Into<String>) -> Self {
        Self {
            area_type,
            feature_id: feature_id.into(),
        }
    }
}

impl fmt::Display for AreaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.area_type, self.feature_id)
    }
}

/// A region with its full geometry.
///
/// # Examples
///
/// ```
/// use geo::{polygon, MultiPolygon};
/// use biota_core::{Area, AreaKey, AreaType};
///
/// let square = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)];
/// let area = Area::new(
///     AreaKey::new(AreaType::County, "01"),
///     "Stockholm",
///     MultiPolygon::new(vec![square]),
/// )?;
/// assert_eq!(area.bounding_box().max().x, 1.0);
/// # Ok::<(), biota_core::AreaError>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Area {
    /// Composite identity.
    pub key: AreaKey,
    /// Display name.
    pub name: String,
    /// Polygon or multipolygon outline.
    pub geometry: MultiPolygon<f64>,
    bounding_box: Rect<f64>,
}

impl Area {
    /// Validate and construct an [`Area`], deriving its bounding box.
    ///
    /// # Errors
    ///
    /// Returns [`AreaError::EmptyGeometry`] when the geometry has no extent.
    pub fn new(
        key: AreaKey,
        name: impl Into<String>,
        geometry: MultiPolygon<f64>,
    ) -> Result<Self, AreaError> {
        let Some(bounding_box) = geometry.bounding_rect() else {
            return Err(AreaError::EmptyGeometry { key });
        };
        Ok(Self {
            key,
            name: name.into(),
            geometry,
            bounding_box,
        })
    }

    /// Axis-aligned bounds of the geometry.
    pub const fn bounding_box(&self) -> Rect<f64> {
        self.bounding_box
    }

    /// Catalog entry for this area.
    pub fn summary(&self) -> AreaSummary {
        AreaSummary {
            key: self.key.clone(),
            name: self.name.clone(),
            bounding_box: self.bounding_box,
        }
    }
}

/// Catalog entry describing an area without its geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaSummary {
    /// Composite identity.
    pub key: AreaKey,
    /// Display name.
    pub name: String,
    /// Axis-aligned bounds of the geometry.
    pub bounding_box: Rect<f64>,
}

/// Reference to the region an observation falls in.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegionRef {
    /// Feature identifier within its area type.
    pub feature_id: String,
    /// Display name.
    pub name: String,
}

/// Regions resolved for one point, at most one per [`AreaType`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RegionRefs {
    /// Enclosing county.
    pub county: Option<RegionRef>,
    /// Enclosing municipality.
    pub municipality: Option<RegionRef>,
    /// Enclosing province.
    pub province: Option<RegionRef>,
    /// Enclosing parish.
    pub parish: Option<RegionRef>,
    /// Enclosing atlas grid square.
    pub atlas_square: Option<RegionRef>,
    /// Enclosing economic zone.
    pub economic_zone: Option<RegionRef>,
}

impl RegionRefs {
    /// Region resolved for `area_type`, if any.
    pub const fn get(&self, area_type: AreaType) -> Option<&RegionRef> {
        match area_type {
            AreaType::County => self.county.as_ref(),
            AreaType::Municipality => self.municipality.as_ref(),
            AreaType::Province => self.province.as_ref(),
            AreaType::Parish => self.parish.as_ref(),
            AreaType::AtlasSquare => self.atlas_square.as_ref(),
            AreaType::EconomicZone => self.economic_zone.as_ref(),
        }
    }

    /// Record the region resolved for `area_type`.
    pub fn set(&mut self, area_type: AreaType, region: RegionRef) {
        let slot = match area_type {
            AreaType::County => &mut self.county,
            AreaType::Municipality => &mut self.municipality,
            AreaType::Province => &mut self.province,
            AreaType::Parish => &mut self.parish,
            AreaType::AtlasSquare => &mut self.atlas_square,
            AreaType::EconomicZone => &mut self.economic_zone,
        };
        *slot = Some(region);
    }

    /// Whether no region was resolved at all.
    pub fn is_empty(&self) -> bool {
        AreaType::ALL
            .into_iter()
            .all(|area_type| self.get(area_type).is_none())
    }
}
