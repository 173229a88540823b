#[cfg(feature = "store-sqlite")]
use std::path::PathBuf;

use thiserror::Error;

use super::AreaKey;

/// Errors raised while resolving, loading or persisting areas.
#[derive(Debug, Error)]
pub enum AreaError {
    /// No area with the requested key exists.
    #[error("area {key} not found")]
    NotFound {
        /// Requested key.
        key: AreaKey,
    },
    /// The geometry has no extent.
    #[error("area {key} has an empty geometry")]
    EmptyGeometry {
        /// Key of the rejected area.
        key: AreaKey,
    },
    /// A persisted area type tag is not recognised.
    #[error("unknown area type {value:?}")]
    UnknownAreaType {
        /// Tag read from storage.
        value: String,
    },
    /// Opening the area store failed.
    #[cfg(feature = "store-sqlite")]
    #[error("failed to open area store at {path:?}")]
    Open {
        /// Location of the SQLite database.
        path: PathBuf,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// A query against the area store failed.
    #[cfg(feature = "store-sqlite")]
    #[error("failed to {operation} in area store")]
    Store {
        /// Description of the failed operation.
        operation: &'static str,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// A geometry blob could not be encoded or decoded.
    #[cfg(feature = "store-sqlite")]
    #[error("failed to encode or decode geometry for area {key}")]
    Geometry {
        /// Key of the affected area.
        key: AreaKey,
        /// Codec failure from `bincode`.
        #[source]
        source: bincode::Error,
    },
}
