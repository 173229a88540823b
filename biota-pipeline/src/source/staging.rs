//! SQLite staging table filled by per-provider harvesters.
//!
//! Harvesters append rows to `staged_records`; the pipeline reads them back
//! in offset order. The table is keyed by `(provider_id, record_offset)` so
//! paging by offset is an index range scan.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use log::debug;
use rusqlite::{Connection, OpenFlags, params};

use super::{BatchSource, Cursor, RawRecord, SourceBatch, SourceError};

const CREATE_STAGED_RECORDS: &str = "CREATE TABLE IF NOT EXISTS staged_records (
    provider_id TEXT NOT NULL,
    record_offset INTEGER NOT NULL CHECK (record_offset >= 0),
    payload TEXT NOT NULL,
    PRIMARY KEY (provider_id, record_offset)
) WITHOUT ROWID";

const SELECT_PAGE: &str = "SELECT record_offset, payload FROM staged_records
    WHERE provider_id = ?1 AND record_offset >= ?2
    ORDER BY record_offset
    LIMIT ?3";

/// Append `payloads` for `provider_id`, continuing after its last offset.
///
/// Returns the offset given to the first payload.
///
/// # Errors
///
/// Returns [`SourceError::Open`] when the database cannot be created and
/// [`SourceError::Query`] when a statement fails.
pub fn stage_records(
    path: &Path,
    provider_id: &str,
    payloads: &[serde_json::Value],
) -> Result<u64, SourceError> {
    let mut connection = Connection::open(path).map_err(|source| SourceError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    connection
        .execute(CREATE_STAGED_RECORDS, [])
        .map_err(|source| query_error("create staged_records", source))?;

    let transaction = connection
        .transaction()
        .map_err(|source| query_error("begin staging transaction", source))?;
    let first: i64 = transaction
        .query_row(
            "SELECT COALESCE(MAX(record_offset) + 1, 0) FROM staged_records WHERE provider_id = ?1",
            [provider_id],
            |row| row.get(0),
        )
        .map_err(|source| query_error("read last staged offset", source))?;
    {
        let mut insert = transaction
            .prepare_cached(
                "INSERT INTO staged_records (provider_id, record_offset, payload) VALUES (?1, ?2, ?3)",
            )
            .map_err(|source| query_error("prepare staged insert", source))?;
        for (offset, payload) in (first..).zip(payloads) {
            insert
                .execute(params![provider_id, offset, payload.to_string()])
                .map_err(|source| query_error("insert staged record", source))?;
        }
    }
    transaction
        .commit()
        .map_err(|source| query_error("commit staging transaction", source))?;
    debug!(
        "staged {} records for provider {provider_id} at {}",
        payloads.len(),
        path.display()
    );
    Ok(u64::try_from(first).unwrap_or_default())
}

/// Read-only view of one provider's staged rows.
pub struct SqliteStagingSource {
    path: PathBuf,
    provider_id: String,
    connection: Arc<Mutex<Connection>>,
}

impl SqliteStagingSource {
    /// Open the staging database at `path` for `provider_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Open`] when the file cannot be opened.
    pub fn open(path: &Path, provider_id: impl Into<String>) -> Result<Self, SourceError> {
        let connection = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|source| SourceError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            provider_id: provider_id.into(),
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Provider whose rows this source yields.
    #[must_use]
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }
}

impl fmt::Debug for SqliteStagingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStagingSource")
            .field("path", &self.path)
            .field("provider_id", &self.provider_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BatchSource for SqliteStagingSource {
    async fn next_batch(&self, cursor: Cursor, limit: usize) -> Result<SourceBatch, SourceError> {
        let connection = Arc::clone(&self.connection);
        let provider_id = self.provider_id.clone();
        tokio::task::spawn_blocking(move || read_page(&connection, &provider_id, cursor, limit))
            .await
            .map_err(|source| SourceError::Task { source })?
    }
}

fn read_page(
    connection: &Mutex<Connection>,
    provider_id: &str,
    cursor: Cursor,
    limit: usize,
) -> Result<SourceBatch, SourceError> {
    let guard = connection.lock().unwrap_or_else(PoisonError::into_inner);
    let start = i64::try_from(cursor.value()).unwrap_or(i64::MAX);
    // One extra row tells whether another page follows.
    let probe = i64::try_from(limit).unwrap_or(i64::MAX).saturating_add(1);
    let mut statement = guard
        .prepare_cached(SELECT_PAGE)
        .map_err(|source| query_error("prepare staged page", source))?;
    let fetched = statement
        .query_map(params![provider_id, start, probe], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(|source| query_error("query staged page", source))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| query_error("read staged row", source))?;

    let has_more = fetched.len() > limit;
    let mut rows = Vec::with_capacity(fetched.len().min(limit));
    for (stored_offset, text) in fetched.into_iter().take(limit) {
        let offset = u64::try_from(stored_offset).unwrap_or_default();
        let payload = serde_json::from_str(&text)
            .map_err(|source| SourceError::Payload { offset, source })?;
        rows.push(RawRecord { offset, payload });
    }
    let next_cursor = rows
        .last()
        .map_or(cursor, |row| Cursor(row.offset.saturating_add(1)));
    Ok(SourceBatch {
        rows,
        next_cursor,
        has_more,
    })
}

const fn query_error(operation: &'static str, source: rusqlite::Error) -> SourceError {
    SourceError::Query { operation, source }
}
