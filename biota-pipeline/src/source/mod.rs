//! Provider-facing record sources.
//!
//! A [`BatchSource`] hands out raw rows in cursor order. Sources are
//! deterministic per cursor, so a run can restart a provider from the last
//! confirmed [`Cursor`] and see the same rows again.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod staging;

pub use memory::MemorySource;
pub use staging::{SqliteStagingSource, stage_records};

/// Position in a provider's record stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cursor(pub u64);

impl Cursor {
    /// The beginning of every stream.
    pub const START: Self = Self(0);

    /// Raw offset value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One untyped row as handed over by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// Offset of the row in the provider stream.
    pub offset: u64,
    /// Provider payload, usually a Darwin Core style JSON object.
    pub payload: serde_json::Value,
}

/// A chunk of rows and the cursor that follows it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBatch {
    /// Rows in stream order.
    pub rows: Vec<RawRecord>,
    /// Cursor to pass to the next call.
    pub next_cursor: Cursor,
    /// Whether rows remain after `next_cursor`.
    pub has_more: bool,
}

/// Errors raised while reading from a provider.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The staging database could not be opened.
    #[error("failed to open staging database at {path:?}")]
    Open {
        /// Database location.
        path: PathBuf,
        /// Underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },
    /// A staging query failed.
    #[error("failed to {operation} in staging database")]
    Query {
        /// Action that failed.
        operation: &'static str,
        /// Underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },
    /// A staged payload is not valid JSON.
    #[error("staged record at offset {offset} is not valid JSON")]
    Payload {
        /// Offset of the bad row.
        offset: u64,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
    /// A record file could not be read.
    #[error("failed to read records from {path:?}")]
    Read {
        /// File location.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A record file does not hold a JSON array of objects.
    #[error("records in {path:?} are not a JSON array")]
    Decode {
        /// File location.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
    /// The provider definition lacks what the source needs.
    #[error("provider {provider_id} is unavailable: {message}")]
    Unavailable {
        /// Provider identifier.
        provider_id: String,
        /// Human-readable reason.
        message: String,
    },
    /// A blocking read task panicked or was cancelled.
    #[error("staging read task failed")]
    Task {
        /// Join failure reported by tokio.
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Ordered, resumable access to one provider's rows.
#[async_trait]
pub trait BatchSource: Send + Sync {
    /// Fetch up to `limit` rows starting at `cursor`.
    async fn next_batch(&self, cursor: Cursor, limit: usize) -> Result<SourceBatch, SourceError>;
}
