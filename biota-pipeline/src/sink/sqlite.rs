//! SQLite observation store holding both slots in one table.
//!
//! Each record is stored as its JSON document next to the columns the read
//! path filters on. The slot is part of the primary key, so clearing or
//! copying a provider touches one slot only.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use biota_core::CanonicalObservation;
use log::debug;
use rusqlite::{Connection, Transaction, params};

use super::{BatchSink, RecordFilter, SinkError};
use crate::slot::InstanceSlot;

const CREATE_OBSERVATIONS: &str = "CREATE TABLE IF NOT EXISTS observations (
    slot INTEGER NOT NULL CHECK (slot IN (0, 1)),
    provider_id TEXT NOT NULL,
    stable_key TEXT NOT NULL,
    taxon_id INTEGER NOT NULL,
    county TEXT,
    sensitive INTEGER NOT NULL,
    document TEXT NOT NULL,
    PRIMARY KEY (slot, provider_id, stable_key)
) WITHOUT ROWID";

const CREATE_TAXON_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_observations_taxon
    ON observations(slot, taxon_id)";

const UPSERT_OBSERVATION: &str = "INSERT OR REPLACE INTO observations
    (slot, provider_id, stable_key, taxon_id, county, sensitive, document)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

/// Observation store backed by a SQLite file.
pub struct SqliteSink {
    path: Option<PathBuf>,
    connection: Arc<Mutex<Connection>>,
}

impl SqliteSink {
    /// Open or create the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Open`] when the file cannot be opened and
    /// [`SinkError::Store`] when the schema cannot be created.
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        let connection = Connection::open(path).map_err(|source| SinkError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_connection(connection, Some(path.to_path_buf()))
    }

    /// Private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Store`] when the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, SinkError> {
        let connection = Connection::open_in_memory().map_err(|source| SinkError::Open {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        Self::from_connection(connection, None)
    }

    fn from_connection(connection: Connection, path: Option<PathBuf>) -> Result<Self, SinkError> {
        connection
            .execute(CREATE_OBSERVATIONS, [])
            .map_err(|source| store_error("create observations", source))?;
        connection
            .execute(CREATE_TAXON_INDEX, [])
            .map_err(|source| store_error("index observations", source))?;
        Ok(Self {
            path,
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    async fn call<T, F>(&self, operation: F) -> Result<T, SinkError>
    where
        F: FnOnce(&mut Connection) -> Result<T, SinkError> + Send + 'static,
        T: Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        tokio::task::spawn_blocking(move || {
            let mut guard = connection.lock().unwrap_or_else(PoisonError::into_inner);
            operation(&mut guard)
        })
        .await
        .map_err(|source| SinkError::Task { source })?
    }
}

impl fmt::Debug for SqliteSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteSink")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BatchSink for SqliteSink {
    async fn write_batch(
        &self,
        records: Vec<CanonicalObservation>,
        slot: InstanceSlot,
    ) -> Result<usize, SinkError> {
        self.call(move |connection| {
            let transaction = connection
                .transaction()
                .map_err(|source| store_error("begin write transaction", source))?;
            upsert_all(&transaction, &records, slot)?;
            transaction
                .commit()
                .map_err(|source| store_error("commit write transaction", source))?;
            debug!("wrote {} observations to slot {slot}", records.len());
            Ok(records.len())
        })
        .await
    }

    async fn clear_provider(
        &self,
        provider_id: &str,
        slot: InstanceSlot,
    ) -> Result<usize, SinkError> {
        let provider = provider_id.to_owned();
        self.call(move |connection| {
            connection
                .execute(
                    "DELETE FROM observations WHERE slot = ?1 AND provider_id = ?2",
                    params![slot.as_i64(), provider],
                )
                .map_err(|source| store_error("clear provider", source))
        })
        .await
    }

    async fn copy_provider(
        &self,
        provider_id: &str,
        from: InstanceSlot,
        to: InstanceSlot,
    ) -> Result<usize, SinkError> {
        let provider = provider_id.to_owned();
        self.call(move |connection| {
            let transaction = connection
                .transaction()
                .map_err(|source| store_error("begin copy transaction", source))?;
            transaction
                .execute(
                    "DELETE FROM observations WHERE slot = ?1 AND provider_id = ?2",
                    params![to.as_i64(), provider],
                )
                .map_err(|source| store_error("clear copy target", source))?;
            let copied = transaction
                .execute(
                    "INSERT INTO observations
                        (slot, provider_id, stable_key, taxon_id, county, sensitive, document)
                        SELECT ?1, provider_id, stable_key, taxon_id, county, sensitive, document
                        FROM observations WHERE slot = ?2 AND provider_id = ?3",
                    params![to.as_i64(), from.as_i64(), provider],
                )
                .map_err(|source| store_error("copy provider", source))?;
            transaction
                .commit()
                .map_err(|source| store_error("commit copy transaction", source))?;
            Ok(copied)
        })
        .await
    }

    async fn count(&self, slot: InstanceSlot, provider_id: &str) -> Result<usize, SinkError> {
        let provider = provider_id.to_owned();
        self.call(move |connection| {
            let total: i64 = connection
                .query_row(
                    "SELECT COUNT(*) FROM observations WHERE slot = ?1 AND provider_id = ?2",
                    params![slot.as_i64(), provider],
                    |row| row.get(0),
                )
                .map_err(|source| store_error("count provider", source))?;
            Ok(usize::try_from(total).unwrap_or_default())
        })
        .await
    }

    async fn search(
        &self,
        slot: InstanceSlot,
        filter: &RecordFilter,
    ) -> Result<Vec<CanonicalObservation>, SinkError> {
        let criteria = filter.clone();
        self.call(move |connection| {
            let mut statement = connection
                .prepare_cached(
                    "SELECT stable_key, document FROM observations
                        WHERE slot = ?1
                            AND (?2 IS NULL OR provider_id = ?2)
                            AND (?3 IS NULL OR county = ?3)
                        ORDER BY provider_id, stable_key",
                )
                .map_err(|source| store_error("prepare search", source))?;
            let rows = statement
                .query_map(
                    params![slot.as_i64(), criteria.provider_id, criteria.county],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .map_err(|source| store_error("search observations", source))?;

            let mut found = Vec::new();
            let limit = criteria.limit.unwrap_or(usize::MAX);
            for row in rows {
                if found.len() >= limit {
                    break;
                }
                let (stable_key, document) =
                    row.map_err(|source| store_error("read observation row", source))?;
                let record: CanonicalObservation = serde_json::from_str(&document)
                    .map_err(|source| SinkError::Encode { stable_key, source })?;
                if criteria.matches(&record) {
                    found.push(record);
                }
            }
            Ok(found)
        })
        .await
    }
}

fn upsert_all(
    transaction: &Transaction<'_>,
    records: &[CanonicalObservation],
    slot: InstanceSlot,
) -> Result<(), SinkError> {
    let mut statement = transaction
        .prepare_cached(UPSERT_OBSERVATION)
        .map_err(|source| store_error("prepare observation upsert", source))?;
    for record in records {
        let document = serde_json::to_string(record).map_err(|source| SinkError::Encode {
            stable_key: record.stable_key.clone(),
            source,
        })?;
        let county = record
            .region_refs
            .county
            .as_ref()
            .map(|region| region.feature_id.as_str());
        let taxon_id =
            i64::try_from(record.taxon_id).map_err(|_| SinkError::TaxonIdOutOfRange {
                stable_key: record.stable_key.clone(),
                taxon_id: record.taxon_id,
            })?;
        statement
            .execute(params![
                slot.as_i64(),
                record.provider_id,
                record.stable_key,
                taxon_id,
                county,
                record.sensitive,
                document,
            ])
            .map_err(|source| store_error("upsert observation", source))?;
    }
    Ok(())
}

const fn store_error(operation: &'static str, source: rusqlite::Error) -> SinkError {
    SinkError::Store { operation, source }
}
