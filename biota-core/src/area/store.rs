//! SQLite-backed area store.
//!
//! Each row carries the area's bounding box in plain columns so the catalog
//! can be read without touching geometry blobs. Geometries are stored as
//! `bincode`-encoded [`MultiPolygon`]s and decoded on demand.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Mutex, PoisonError},
};

use geo::{Coord, MultiPolygon, Rect};
use log::debug;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use super::{Area, AreaError, AreaKey, AreaSummary, AreaType, GeometrySource};

const CREATE_AREAS: &str = "CREATE TABLE IF NOT EXISTS areas (
    area_type TEXT NOT NULL,
    feature_id TEXT NOT NULL,
    name TEXT NOT NULL,
    min_x REAL NOT NULL,
    min_y REAL NOT NULL,
    max_x REAL NOT NULL,
    max_y REAL NOT NULL,
    geometry BLOB NOT NULL,
    PRIMARY KEY (area_type, feature_id)
) WITHOUT ROWID";

/// Persist `areas` into a SQLite database at `path`, replacing rows that
/// share a key.
///
/// # Errors
///
/// Returns [`AreaError::Open`] when the database cannot be created,
/// [`AreaError::Geometry`] when encoding fails and [`AreaError::Store`] for
/// failed statements.
///
/// # Examples
///
/// ```
/// use geo::{polygon, Coord, MultiPolygon};
/// use biota_core::{Area, AreaIndex, AreaKey, AreaType, write_area_store};
///
/// let dir = tempfile::tempdir()?;
/// let path = dir.path().join("areas.db");
/// let square = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)];
/// let parish = Area::new(
///     AreaKey::new(AreaType::Parish, "0180"),
///     "Adolf Fredrik",
///     MultiPolygon::new(vec![square]),
/// )?;
/// write_area_store(&path, &[parish])?;
///
/// let index = AreaIndex::open(&path)?;
/// let regions = index.resolve(Coord { x: 0.5, y: 0.5 })?;
/// assert_eq!(regions.parish.map(|region| region.feature_id), Some("0180".to_owned()));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn write_area_store(path: &Path, areas: &[Area]) -> Result<(), AreaError> {
    let mut connection = Connection::open(path).map_err(|source| AreaError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let transaction = connection
        .transaction()
        .map_err(|source| store_error("begin area transaction", source))?;
    transaction
        .execute(CREATE_AREAS, [])
        .map_err(|source| store_error("create areas table", source))?;
    {
        let mut insert = transaction
            .prepare_cached(
                "INSERT OR REPLACE INTO areas
                    (area_type, feature_id, name, min_x, min_y, max_x, max_y, geometry)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .map_err(|source| store_error("prepare area insert", source))?;
        for area in areas {
            let blob = bincode::serialize(&area.geometry).map_err(|source| AreaError::Geometry {
                key: area.key.clone(),
                source,
            })?;
            let bbox = area.bounding_box();
            insert
                .execute(params![
                    area.key.area_type.as_str(),
                    area.key.feature_id,
                    area.name,
                    bbox.min().x,
                    bbox.min().y,
                    bbox.max().x,
                    bbox.max().y,
                    blob,
                ])
                .map_err(|source| store_error("insert area", source))?;
        }
    }
    transaction
        .commit()
        .map_err(|source| store_error("commit area transaction", source))?;
    debug!("wrote {} areas to {}", areas.len(), path.display());
    Ok(())
}

/// Read-only [`GeometrySource`] over a store written by [`write_area_store`].
pub struct SqliteGeometrySource {
    path: PathBuf,
    connection: Mutex<Connection>,
}

impl fmt::Debug for SqliteGeometrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteGeometrySource")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteGeometrySource {
    /// Open the store at `path` read-only.
    ///
    /// # Errors
    ///
    /// Returns [`AreaError::Open`] when the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AreaError> {
        let path = path.as_ref();
        let connection = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|source| AreaError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            connection: Mutex::new(connection),
        })
    }
}

impl GeometrySource for SqliteGeometrySource {
    fn catalog(&self) -> Result<Vec<AreaSummary>, AreaError> {
        let connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        let mut statement = connection
            .prepare(
                "SELECT area_type, feature_id, name, min_x, min_y, max_x, max_y
                 FROM areas ORDER BY area_type, feature_id",
            )
            .map_err(|source| store_error("prepare area catalog", source))?;
        let mut rows = statement
            .query([])
            .map_err(|source| store_error("query area catalog", source))?;

        let mut summaries = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|source| store_error("read area catalog", source))?
        {
            let read = |source| store_error("decode area catalog row", source);
            let area_type: String = row.get(0).map_err(read)?;
            let feature_id: String = row.get(1).map_err(read)?;
            let name: String = row.get(2).map_err(read)?;
            let min = Coord {
                x: row.get(3).map_err(read)?,
                y: row.get(4).map_err(read)?,
            };
            let max = Coord {
                x: row.get(5).map_err(read)?,
                y: row.get(6).map_err(read)?,
            };
            summaries.push(AreaSummary {
                key: AreaKey::new(AreaType::from_str(&area_type)?, feature_id),
                name,
                bounding_box: Rect::new(min, max),
            });
        }
        Ok(summaries)
    }

    fn load_geometry(&self, key: &AreaKey) -> Result<MultiPolygon<f64>, AreaError> {
        let connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        let mut statement = connection
            .prepare_cached("SELECT geometry FROM areas WHERE area_type = ?1 AND feature_id = ?2")
            .map_err(|source| store_error("prepare geometry lookup", source))?;
        let blob: Option<Vec<u8>> = statement
            .query_row(params![key.area_type.as_str(), key.feature_id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|source| store_error("load geometry", source))?;
        let Some(blob) = blob else {
            return Err(AreaError::NotFound { key: key.clone() });
        };
        bincode::deserialize(&blob).map_err(|source| AreaError::Geometry {
            key: key.clone(),
            source,
        })
    }
}

impl super::AreaIndex {
    /// Open an index over a SQLite area store.
    ///
    /// # Errors
    ///
    /// Returns an [`AreaError`] when the store cannot be opened or its
    /// catalog is unreadable.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AreaError> {
        let source = SqliteGeometrySource::open(path)?;
        Self::new(std::sync::Arc::new(source))
    }
}

fn store_error(operation: &'static str, source: rusqlite::Error) -> AreaError {
    AreaError::Store { operation, source }
}
