//! Filesystem access for snapshot inputs and the pipeline state directory.
//!
//! Every operation goes through `cap-std` directory handles opened with
//! ambient authority at the nearest existing root, and every path is UTF-8
//! (`camino`).
#![forbid(unsafe_code)]

use std::io::{self, Read};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8};
use thiserror::Error;

/// Run state database inside a state directory.
pub const STATE_DB: &str = "state.db";
/// Published observation store inside a state directory.
pub const OBSERVATIONS_DB: &str = "observations.db";

/// Errors raised while touching the filesystem.
#[derive(Debug, Error)]
pub enum FsError {
    /// Nothing exists at the path.
    #[error("{path} does not exist")]
    Missing {
        /// Path that was checked.
        path: Utf8PathBuf,
    },
    /// The path exists but is a directory or special file.
    #[error("{path} is not a regular file")]
    NotAFile {
        /// Path that was checked.
        path: Utf8PathBuf,
    },
    /// Any other I/O failure.
    #[error("failed to access {path}")]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
}

impl FsError {
    fn from_io(path: &Utf8Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::Missing {
                path: path.to_owned(),
            }
        } else {
            Self::Io {
                path: path.to_owned(),
                source,
            }
        }
    }
}

/// Locations inside a pipeline state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    root: Utf8PathBuf,
}

impl StateLayout {
    /// Layout rooted at `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The state directory itself.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Path of the run state database.
    #[must_use]
    pub fn state_db(&self) -> Utf8PathBuf {
        self.root.join(STATE_DB)
    }

    /// Path of the observation store.
    #[must_use]
    pub fn observations_db(&self) -> Utf8PathBuf {
        self.root.join(OBSERVATIONS_DB)
    }

    /// Create the state directory if it is missing.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Io`] when a directory cannot be created.
    pub fn prepare(&self) -> Result<(), FsError> {
        ensure_parent_dir(&self.state_db())
    }
}

/// Check that `path` names an existing regular file.
///
/// # Errors
///
/// Returns [`FsError::Missing`] or [`FsError::NotAFile`] accordingly, and
/// [`FsError::Io`] for other failures.
pub fn require_file(path: &Utf8Path) -> Result<(), FsError> {
    let (dir, name) = open_parent(path)?;
    let metadata = dir
        .metadata(name.as_str())
        .map_err(|source| FsError::from_io(path, source))?;
    if metadata.is_file() {
        Ok(())
    } else {
        Err(FsError::NotAFile {
            path: path.to_owned(),
        })
    }
}

/// Open a snapshot file for reading.
///
/// # Errors
///
/// Fails as [`require_file`] does, or with [`FsError::Io`] when the file
/// cannot be opened.
pub fn open_snapshot(path: &Utf8Path) -> Result<fs_utf8::File, FsError> {
    require_file(path)?;
    let (dir, name) = open_parent(path)?;
    dir.open(name.as_str())
        .map_err(|source| FsError::from_io(path, source))
}

/// Read a whole snapshot file as UTF-8 text.
///
/// # Errors
///
/// Fails as [`open_snapshot`] does, or with [`FsError::Io`] when the
/// contents are unreadable or not UTF-8.
pub fn read_snapshot(path: &Utf8Path) -> Result<String, FsError> {
    let mut file = open_snapshot(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|source| FsError::from_io(path, source))?;
    Ok(contents)
}

/// Create every missing directory above `path`.
///
/// # Errors
///
/// Returns [`FsError::Io`] when a directory cannot be opened or created.
pub fn ensure_parent_dir(path: &Utf8Path) -> Result<(), FsError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    let (base, relative) = split_root(parent);
    if relative.as_str().is_empty() {
        return Ok(());
    }
    let dir = fs_utf8::Dir::open_ambient_dir(&base, ambient_authority())
        .map_err(|source| FsError::from_io(&base, source))?;
    dir.create_dir_all(&relative).map_err(|source| FsError::Io {
        path: parent.to_owned(),
        source,
    })
}

/// Directory handle for the parent of `path` plus the file name within it.
fn open_parent(path: &Utf8Path) -> Result<(fs_utf8::Dir, String), FsError> {
    let name = path.file_name().ok_or_else(|| FsError::NotAFile {
        path: path.to_owned(),
    })?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    let dir = fs_utf8::Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|source| FsError::from_io(path, source))?;
    Ok((dir, name.to_owned()))
}

/// Split `path` into the root cap-std can open and the rest.
///
/// Absolute paths split at their root (and drive prefix on Windows);
/// relative paths are taken from the current directory.
fn split_root(path: &Utf8Path) -> (Utf8PathBuf, Utf8PathBuf) {
    let mut base = Utf8PathBuf::new();
    let mut relative = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::Prefix(_) | Utf8Component::RootDir => base.push(component),
            other => relative.push(other),
        }
    }
    if base.as_str().is_empty() {
        base.push(".");
    }
    (base, relative)
}
