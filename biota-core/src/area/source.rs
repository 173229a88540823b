use std::collections::HashMap;

use geo::MultiPolygon;

use super::{Area, AreaError, AreaKey, AreaSummary};

/// Backing store for area geometries.
///
/// The catalog is read once when an [`super::AreaIndex`] is built; full
/// geometries are requested on demand and may be expensive to load.
pub trait GeometrySource: Send + Sync {
    /// Every area known to the source, without geometries.
    ///
    /// # Errors
    ///
    /// Returns an [`AreaError`] when the catalog cannot be read.
    fn catalog(&self) -> Result<Vec<AreaSummary>, AreaError>;

    /// Load the full geometry for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`AreaError::NotFound`] for unknown keys and other variants
    /// when the backing store fails.
    fn load_geometry(&self, key: &AreaKey) -> Result<MultiPolygon<f64>, AreaError>;
}

/// Geometry source holding every area in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryGeometrySource {
    areas: HashMap<AreaKey, Area>,
}

impl MemoryGeometrySource {
    /// Index `areas` by key. Later entries replace earlier ones with the
    /// same key.
    pub fn new(areas: impl IntoIterator<Item = Area>) -> Self {
        Self {
            areas: areas
                .into_iter()
                .map(|area| (area.key.clone(), area))
                .collect(),
        }
    }

    /// Number of areas held.
    pub fn len(&self) -> usize {
        self.areas.len()
    }

    /// Whether the source holds no areas.
    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }
}

impl GeometrySource for MemoryGeometrySource {
    fn catalog(&self) -> Result<Vec<AreaSummary>, AreaError> {
        let mut summaries: Vec<AreaSummary> = self.areas.values().map(Area::summary).collect();
        summaries.sort_by(|left, right| left.key.cmp(&right.key));
        Ok(summaries)
    }

    fn load_geometry(&self, key: &AreaKey) -> Result<MultiPolygon<f64>, AreaError> {
        self.areas
            .get(key)
            .map(|area| area.geometry.clone())
            .ok_or_else(|| AreaError::NotFound { key: key.clone() })
    }
}
