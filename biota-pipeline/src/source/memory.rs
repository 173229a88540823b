//! In-memory source backed by a vector of JSON rows.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use async_trait::async_trait;

use super::{BatchSource, Cursor, RawRecord, SourceBatch, SourceError};

/// Rows held in memory, offset by position.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    rows: Vec<serde_json::Value>,
}

impl MemorySource {
    /// Wrap `rows`; row `n` gets offset `n`.
    #[must_use]
    pub const fn new(rows: Vec<serde_json::Value>) -> Self {
        Self { rows }
    }

    /// Load a JSON array of records from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Read`] when the file cannot be opened and
    /// [`SourceError::Decode`] when it is not a JSON array.
    pub fn from_json_file(path: &Path) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|source| SourceError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let rows: Vec<serde_json::Value> = serde_json::from_reader(BufReader::new(file))
            .map_err(|source| SourceError::Decode {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::new(rows))
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the source holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl BatchSource for MemorySource {
    async fn next_batch(&self, cursor: Cursor, limit: usize) -> Result<SourceBatch, SourceError> {
        let start = usize::try_from(cursor.value()).unwrap_or(usize::MAX);
        let rows: Vec<RawRecord> = self
            .rows
            .iter()
            .enumerate()
            .skip(start)
            .take(limit)
            .map(|(offset, payload)| RawRecord {
                offset: u64::try_from(offset).unwrap_or(u64::MAX),
                payload: payload.clone(),
            })
            .collect();
        let next = rows
            .last()
            .map_or(cursor, |row| Cursor(row.offset.saturating_add(1)));
        let consumed = usize::try_from(next.value()).unwrap_or(usize::MAX);
        Ok(SourceBatch {
            rows,
            next_cursor: next,
            has_more: consumed < self.rows.len(),
        })
    }
}
