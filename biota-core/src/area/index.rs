//! Point-in-polygon resolution over every area type.

use std::{cmp::Ordering, collections::HashMap, fmt, sync::Arc};

use geo::{Area as _, Coord, Intersects, MultiPolygon, Point};
use rstar::{AABB, RTree, RTreeObject};

use super::{
    Area, AreaError, AreaKey, AreaSummary, AreaType, Cache, GeometrySource, MemoryGeometrySource,
    RegionRef, RegionRefs,
};

type SharedGeometry = Arc<MultiPolygon<f64>>;

#[derive(Debug, Clone)]
struct IndexedArea {
    key: AreaKey,
    name: String,
    envelope: AABB<[f64; 2]>,
}

impl From<AreaSummary> for IndexedArea {
    fn from(summary: AreaSummary) -> Self {
        let bbox = summary.bounding_box;
        Self {
            key: summary.key,
            name: summary.name,
            envelope: AABB::from_corners([bbox.min().x, bbox.min().y], [bbox.max().x, bbox.max().y]),
        }
    }
}

impl RTreeObject for IndexedArea {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Spatial index resolving points to their enclosing regions.
///
/// One R\*-tree per [`AreaType`] holds bounding boxes only. Candidate
/// geometries are fetched through the [`GeometrySource`] the first time they
/// are needed and kept in a shared [`Cache`].
///
/// When several areas of one type contain a point, the one with the smallest
/// planar area wins, then the lowest feature id. Points on a boundary count
/// as inside.
///
/// # Examples
///
/// ```
/// use geo::{polygon, Coord, MultiPolygon};
/// use biota_core::{Area, AreaIndex, AreaKey, AreaType};
///
/// let square = polygon![(x: 0.0, y: 0.0), (x: 2.0, y: 0.0), (x: 2.0, y: 2.0), (x: 0.0, y: 2.0)];
/// let county = Area::new(
///     AreaKey::new(AreaType::County, "01"),
///     "Stockholm",
///     MultiPolygon::new(vec![square]),
/// )?;
/// let index = AreaIndex::from_areas(vec![county])?;
///
/// let regions = index.resolve(Coord { x: 1.0, y: 1.0 })?;
/// assert_eq!(regions.county.map(|region| region.name), Some("Stockholm".to_owned()));
/// assert!(regions.parish.is_none());
/// # Ok::<(), biota_core::AreaError>(())
/// ```
pub struct AreaIndex {
    trees: HashMap<AreaType, RTree<IndexedArea>>,
    source: Arc<dyn GeometrySource>,
    cache: Cache<AreaKey, SharedGeometry>,
}

impl fmt::Debug for AreaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: usize = self.trees.values().map(RTree::size).sum();
        f.debug_struct("AreaIndex")
            .field("entries", &entries)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl AreaIndex {
    /// Build an index from the catalog of `source`.
    ///
    /// # Errors
    ///
    /// Propagates failures from [`GeometrySource::catalog`].
    pub fn new(source: Arc<dyn GeometrySource>) -> Result<Self, AreaError> {
        Self::with_cache(source, Cache::new())
    }

    /// Build an index sharing a preconfigured geometry cache, for example one
    /// with a soft TTL or registered listeners.
    ///
    /// # Errors
    ///
    /// Propagates failures from [`GeometrySource::catalog`].
    pub fn with_cache(
        source: Arc<dyn GeometrySource>,
        cache: Cache<AreaKey, SharedGeometry>,
    ) -> Result<Self, AreaError> {
        let mut grouped: HashMap<AreaType, Vec<IndexedArea>> = HashMap::new();
        for summary in source.catalog()? {
            grouped
                .entry(summary.key.area_type)
                .or_default()
                .push(IndexedArea::from(summary));
        }
        let trees = grouped
            .into_iter()
            .map(|(area_type, entries)| (area_type, RTree::bulk_load(entries)))
            .collect();
        Ok(Self {
            trees,
            source,
            cache,
        })
    }

    /// Build an index over areas held in memory.
    ///
    /// # Errors
    ///
    /// Infallible for in-memory areas; the signature matches [`Self::new`].
    pub fn from_areas(areas: Vec<Area>) -> Result<Self, AreaError> {
        Self::new(Arc::new(MemoryGeometrySource::new(areas)))
    }

    /// Number of areas across all types.
    pub fn len(&self) -> usize {
        self.trees.values().map(RTree::size).sum()
    }

    /// Whether the index holds no areas.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The geometry cache, for subscribing to invalidation events.
    pub const fn cache(&self) -> &Cache<AreaKey, SharedGeometry> {
        &self.cache
    }

    /// Resolve the enclosing region of every area type for one point.
    ///
    /// # Errors
    ///
    /// Returns an [`AreaError`] when a candidate geometry cannot be loaded.
    pub fn resolve(&self, point: Coord<f64>) -> Result<RegionRefs, AreaError> {
        let mut regions = RegionRefs::default();
        for area_type in AreaType::ALL {
            if let Some(region) = self.select(area_type, point, |key| self.get_geometry(key))? {
                regions.set(area_type, region);
            }
        }
        Ok(regions)
    }

    /// Resolve many points at once.
    ///
    /// Geometries are looked up in the shared cache once per batch, so a
    /// batch touching the same few areas avoids repeated lock traffic.
    /// Results match calling [`Self::resolve`] for each point in order.
    ///
    /// # Errors
    ///
    /// Returns an [`AreaError`] when a candidate geometry cannot be loaded.
    pub fn batch_resolve(&self, points: &[Coord<f64>]) -> Result<Vec<RegionRefs>, AreaError> {
        let mut local: HashMap<AreaKey, SharedGeometry> = HashMap::new();
        let mut results = vec![RegionRefs::default(); points.len()];
        for area_type in AreaType::ALL {
            for (point, regions) in points.iter().zip(results.iter_mut()) {
                let found = self.select(area_type, *point, |key| {
                    if let Some(geometry) = local.get(key) {
                        return Ok(Arc::clone(geometry));
                    }
                    let geometry = self.get_geometry(key)?;
                    local.insert(key.clone(), Arc::clone(&geometry));
                    Ok(geometry)
                })?;
                if let Some(region) = found {
                    regions.set(area_type, region);
                }
            }
        }
        Ok(results)
    }

    /// Full geometry for `key`, loading it on a cache miss.
    ///
    /// # Errors
    ///
    /// Returns [`AreaError::NotFound`] for unknown keys, or the source's
    /// error when loading fails.
    pub fn get_geometry(&self, key: &AreaKey) -> Result<SharedGeometry, AreaError> {
        if let Some(geometry) = self.cache.get(key) {
            return Ok(geometry);
        }
        let geometry = Arc::new(self.source.load_geometry(key)?);
        self.cache.set(key.clone(), Arc::clone(&geometry));
        Ok(geometry)
    }

    /// Drop every cached geometry. Subscribers receive a release event per
    /// key.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn select<F>(
        &self,
        area_type: AreaType,
        point: Coord<f64>,
        mut geometry_of: F,
    ) -> Result<Option<RegionRef>, AreaError>
    where
        F: FnMut(&AreaKey) -> Result<SharedGeometry, AreaError>,
    {
        let Some(tree) = self.trees.get(&area_type) else {
            return Ok(None);
        };
        let probe = AABB::from_point([point.x, point.y]);
        let target = Point::from(point);

        let mut best: Option<(f64, &IndexedArea)> = None;
        for candidate in tree.locate_in_envelope_intersecting(&probe) {
            let geometry = geometry_of(&candidate.key)?;
            if !geometry.intersects(&target) {
                continue;
            }
            let size = geometry.unsigned_area();
            let better = best.is_none_or(|(best_size, best_area)| {
                match size.total_cmp(&best_size) {
                    Ordering::Less => true,
                    Ordering::Equal => candidate.key.feature_id < best_area.key.feature_id,
                    Ordering::Greater => false,
                }
            });
            if better {
                best = Some((size, candidate));
            }
        }

        Ok(best.map(|(_, area)| RegionRef {
            feature_id: area.key.feature_id.clone(),
            name: area.name.clone(),
        }))
    }
}
