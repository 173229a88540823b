//! SQLite-backed state store.
//!
//! All statements run on tokio's blocking pool behind one mutex-guarded
//! connection. The activation swap is a single conditional `UPDATE`, so no
//! lock is held across a run; a run claims its target slot with a lease
//! column on its `runs` row instead.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};

use super::{
    ActivationRecord, ActivationStore, GenerationLedger, GenerationStatus, ProcessGeneration,
    RunId, RunMode, RunRecord, SlotLease, StateError, initialise_schema, unix_now,
};
use crate::slot::InstanceSlot;
use crate::source::Cursor;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const UPSERT_GENERATION: &str = "INSERT INTO process_generations (
        run_id, provider_id, instance_slot, public_count, protected_count, failed_count,
        started_at, finished_at, status, last_cursor, error
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
    ON CONFLICT (run_id, provider_id) DO UPDATE SET
        instance_slot = excluded.instance_slot,
        public_count = excluded.public_count,
        protected_count = excluded.protected_count,
        failed_count = excluded.failed_count,
        started_at = excluded.started_at,
        finished_at = excluded.finished_at,
        status = excluded.status,
        last_cursor = excluded.last_cursor,
        error = excluded.error";

const SELECT_GENERATION: &str = "SELECT run_id, provider_id, instance_slot, public_count,
        protected_count, failed_count, started_at, finished_at, status, last_cursor, error
    FROM process_generations";

const SELECT_RUN: &str = "SELECT run_id, mode, target_slot, provider_ids, started_at,
        finished_at, outcome, lease_expires_at
    FROM runs";

/// Durable home of the activation record, runs and generations.
pub struct StateStore {
    path: Option<PathBuf>,
    connection: Arc<Mutex<Connection>>,
}

impl StateStore {
    /// Open or create the state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Open`] when the file cannot be opened and the
    /// errors of [`initialise_schema`] otherwise.
    pub fn open(path: &Path) -> Result<Self, StateError> {
        let connection = Connection::open(path).map_err(|source| StateError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self::from_connection(connection, Some(path.to_path_buf()))?;
        debug!("opened state store at {}", path.display());
        Ok(store)
    }

    /// Private in-memory store, used by tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`initialise_schema`].
    pub fn open_in_memory() -> Result<Self, StateError> {
        let connection = Connection::open_in_memory().map_err(|source| StateError::Open {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        Self::from_connection(connection, None)
    }

    fn from_connection(mut connection: Connection, path: Option<PathBuf>) -> Result<Self, StateError> {
        connection
            .pragma_update(None, "foreign_keys", true)
            .map_err(|source| StateError::Migration {
                step: "enable foreign keys",
                source,
            })?;
        connection
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(|source| StateError::Migration {
                step: "set busy timeout",
                source,
            })?;
        initialise_schema(&mut connection)?;
        Ok(Self {
            path,
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Database location, `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn call<T, F>(&self, operation: F) -> Result<T, StateError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StateError> + Send + 'static,
        T: Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        tokio::task::spawn_blocking(move || {
            let mut guard = connection.lock().unwrap_or_else(PoisonError::into_inner);
            operation(&mut guard)
        })
        .await
        .map_err(|source| StateError::Task { source })?
    }

    /// Record the start of a run and lease its target slot.
    ///
    /// The activation version and the slot's other leases are checked in the
    /// same write transaction as the insert, so two starts cannot both claim
    /// one slot.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::ActivationMoved`] when a swap happened after
    /// `lease` was taken, [`StateError::SlotBusy`] when another unfinished
    /// run holds the slot and [`StateError::Query`] when the insert fails.
    pub async fn create_run(
        &self,
        mode: RunMode,
        lease: SlotLease,
        provider_ids: &[String],
    ) -> Result<RunRecord, StateError> {
        let encoded = serde_json::to_string(provider_ids).map_err(|err| StateError::Corrupt {
            field: "provider_ids",
            value: err.to_string(),
        })?;
        let record = RunRecord {
            run_id: RunId(0),
            mode,
            target_slot: lease.target_slot,
            provider_ids: provider_ids.to_vec(),
            started_at: unix_now(),
            finished_at: None,
            outcome: None,
            lease_expires_at: None,
        };
        let started_at = record.started_at;
        let (run_id, lease_expires_at) = self
            .call(move |connection| {
                let transaction = begin_immediate(connection)?;
                let expires_at = claim_slot(&transaction, &lease, None)?;
                transaction
                    .execute(
                        "INSERT INTO runs (mode, target_slot, provider_ids, started_at, lease_expires_at)
                            VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            mode.as_str(),
                            lease.target_slot.as_i64(),
                            encoded,
                            started_at,
                            expires_at
                        ],
                    )
                    .map_err(|source| query_error("insert run", source))?;
                let run_id = RunId(transaction.last_insert_rowid());
                transaction
                    .commit()
                    .map_err(|source| query_error("commit run start", source))?;
                Ok((run_id, expires_at))
            })
            .await?;
        info!(
            "run {run_id} started in {mode} mode targeting slot {}",
            lease.target_slot
        );
        Ok(RunRecord {
            run_id,
            lease_expires_at: Some(lease_expires_at),
            ..record
        })
    }

    /// Stamp the end of a run with an outcome label and release its lease.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::RunNotFound`] for unknown runs.
    pub async fn finish_run(&self, run_id: RunId, outcome: &str) -> Result<(), StateError> {
        let label = outcome.to_owned();
        self.call(move |connection| {
            let changed = connection
                .execute(
                    "UPDATE runs SET finished_at = ?1, outcome = ?2, lease_expires_at = NULL
                        WHERE run_id = ?3",
                    params![unix_now(), label, run_id.0],
                )
                .map_err(|source| query_error("finish run", source))?;
            if changed == 0 {
                return Err(StateError::RunNotFound { run_id });
            }
            Ok(())
        })
        .await
    }

    /// Clear the end stamp of a run that is being resumed and lease its
    /// target slot again.
    ///
    /// `lease.target_slot` must be the run's own target slot.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::RunNotFound`] for unknown runs and the lease
    /// errors of [`StateStore::create_run`].
    pub async fn reopen_run(&self, run_id: RunId, lease: SlotLease) -> Result<(), StateError> {
        self.call(move |connection| {
            let transaction = begin_immediate(connection)?;
            let expires_at = claim_slot(&transaction, &lease, Some(run_id))?;
            let changed = transaction
                .execute(
                    "UPDATE runs SET finished_at = NULL, outcome = NULL, lease_expires_at = ?1
                        WHERE run_id = ?2",
                    params![expires_at, run_id.0],
                )
                .map_err(|source| query_error("reopen run", source))?;
            if changed == 0 {
                return Err(StateError::RunNotFound { run_id });
            }
            transaction
                .commit()
                .map_err(|source| query_error("commit run reopen", source))
        })
        .await
    }

    /// Load one run.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::RunNotFound`] for unknown runs.
    pub async fn run(&self, run_id: RunId) -> Result<RunRecord, StateError> {
        self.call(move |connection| {
            let stored = connection
                .query_row(
                    &format!("{SELECT_RUN} WHERE run_id = ?1"),
                    [run_id.0],
                    StoredRun::from_row,
                )
                .optional()
                .map_err(|source| query_error("read run", source))?;
            stored
                .ok_or(StateError::RunNotFound { run_id })?
                .into_record()
        })
        .await
    }

    /// The `limit` most recent runs, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Query`] when the query fails.
    pub async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StateError> {
        let bounded = i64::try_from(limit).unwrap_or(i64::MAX);
        self.call(move |connection| {
            let mut statement = connection
                .prepare_cached(&format!("{SELECT_RUN} ORDER BY run_id DESC LIMIT ?1"))
                .map_err(|source| query_error("prepare recent runs", source))?;
            let stored = statement
                .query_map([bounded], StoredRun::from_row)
                .map_err(|source| query_error("query recent runs", source))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|source| query_error("read run row", source))?;
            stored.into_iter().map(StoredRun::into_record).collect()
        })
        .await
    }

    async fn upsert(&self, operation: &'static str, generation: &ProcessGeneration) -> Result<(), StateError> {
        let stored = StoredGeneration::from(generation);
        self.call(move |connection| {
            connection
                .prepare_cached(UPSERT_GENERATION)
                .and_then(|mut statement| {
                    statement.execute(params![
                        stored.run_id,
                        stored.provider_id,
                        stored.instance_slot,
                        stored.public_count,
                        stored.protected_count,
                        stored.failed_count,
                        stored.started_at,
                        stored.finished_at,
                        stored.status,
                        stored.last_cursor,
                        stored.error,
                    ])
                })
                .map(|_| ())
                .map_err(|source| query_error(operation, source))
        })
        .await
    }
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ActivationStore for StateStore {
    async fn load_activation(&self) -> Result<ActivationRecord, StateError> {
        self.call(|connection| read_activation(connection)).await
    }

    async fn compare_and_set(
        &self,
        expected_version: u64,
        active_slot: InstanceSlot,
    ) -> Result<Option<ActivationRecord>, StateError> {
        let expected = to_sql(expected_version);
        self.call(move |connection| {
            let changed = connection
                .execute(
                    "UPDATE activation
                        SET active_slot = ?1, version = version + 1, last_swap_at = ?2
                        WHERE id = 1 AND version = ?3",
                    params![active_slot.as_i64(), unix_now(), expected],
                )
                .map_err(|source| query_error("swap activation", source))?;
            if changed == 0 {
                return Ok(None);
            }
            read_activation(connection).map(Some)
        })
        .await
    }
}

#[async_trait]
impl GenerationLedger for StateStore {
    async fn begin(&self, generation: &ProcessGeneration) -> Result<(), StateError> {
        self.upsert("begin generation", generation).await
    }

    async fn checkpoint(&self, generation: &ProcessGeneration) -> Result<(), StateError> {
        self.upsert("checkpoint generation", generation).await
    }

    async fn finish(&self, generation: &ProcessGeneration) -> Result<(), StateError> {
        self.upsert("finish generation", generation).await
    }

    async fn generation(
        &self,
        run_id: RunId,
        provider_id: &str,
    ) -> Result<Option<ProcessGeneration>, StateError> {
        let provider = provider_id.to_owned();
        self.call(move |connection| {
            connection
                .query_row(
                    &format!("{SELECT_GENERATION} WHERE run_id = ?1 AND provider_id = ?2"),
                    params![run_id.0, provider],
                    StoredGeneration::from_row,
                )
                .optional()
                .map_err(|source| query_error("read generation", source))?
                .map(ProcessGeneration::try_from)
                .transpose()
        })
        .await
    }

    async fn generations(&self, run_id: RunId) -> Result<Vec<ProcessGeneration>, StateError> {
        self.call(move |connection| {
            let mut statement = connection
                .prepare_cached(&format!(
                    "{SELECT_GENERATION} WHERE run_id = ?1 ORDER BY provider_id"
                ))
                .map_err(|source| query_error("prepare generations", source))?;
            let stored = statement
                .query_map([run_id.0], StoredGeneration::from_row)
                .map_err(|source| query_error("query generations", source))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|source| query_error("read generation row", source))?;
            stored.into_iter().map(ProcessGeneration::try_from).collect()
        })
        .await
    }
}

fn begin_immediate(connection: &mut Connection) -> Result<Transaction<'_>, StateError> {
    connection
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|source| query_error("begin lease transaction", source))
}

/// Check `lease` against the activation record and the slot's live leases,
/// returning the expiry to store. `own_run` is ignored when looking for
/// competing leases.
fn claim_slot(
    transaction: &Transaction<'_>,
    lease: &SlotLease,
    own_run: Option<RunId>,
) -> Result<i64, StateError> {
    let current = read_activation(transaction)?;
    if current.version != lease.observed_version {
        return Err(StateError::ActivationMoved {
            observed: lease.observed_version,
            current: current.version,
        });
    }
    let now = unix_now();
    let holder: Option<i64> = transaction
        .query_row(
            "SELECT run_id FROM runs
                WHERE target_slot = ?1 AND outcome IS NULL AND lease_expires_at > ?2
                    AND run_id IS NOT ?3
                ORDER BY run_id LIMIT 1",
            params![lease.target_slot.as_i64(), now, own_run.map(|run| run.0)],
            |row| row.get(0),
        )
        .optional()
        .map_err(|source| query_error("check slot lease", source))?;
    if let Some(run_id) = holder {
        return Err(StateError::SlotBusy {
            run_id: RunId(run_id),
            target_slot: lease.target_slot,
        });
    }
    let seconds = i64::try_from(lease.duration.as_secs()).unwrap_or(i64::MAX);
    Ok(now.saturating_add(seconds))
}

fn read_activation(connection: &Connection) -> Result<ActivationRecord, StateError> {
    let (slot, version, last_swap_at): (i64, i64, Option<i64>) = connection
        .query_row(
            "SELECT active_slot, version, last_swap_at FROM activation WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(|source| query_error("read activation", source))?;
    Ok(ActivationRecord {
        active_slot: decode_slot("active_slot", slot)?,
        version: from_sql(version),
        last_swap_at,
    })
}

/// Column values of one `process_generations` row.
struct StoredGeneration {
    run_id: i64,
    provider_id: String,
    instance_slot: i64,
    public_count: i64,
    protected_count: i64,
    failed_count: i64,
    started_at: i64,
    finished_at: Option<i64>,
    status: String,
    last_cursor: Option<i64>,
    error: Option<String>,
}

impl StoredGeneration {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            provider_id: row.get(1)?,
            instance_slot: row.get(2)?,
            public_count: row.get(3)?,
            protected_count: row.get(4)?,
            failed_count: row.get(5)?,
            started_at: row.get(6)?,
            finished_at: row.get(7)?,
            status: row.get(8)?,
            last_cursor: row.get(9)?,
            error: row.get(10)?,
        })
    }
}

impl From<&ProcessGeneration> for StoredGeneration {
    fn from(generation: &ProcessGeneration) -> Self {
        Self {
            run_id: generation.run_id.0,
            provider_id: generation.provider_id.clone(),
            instance_slot: generation.instance_slot.as_i64(),
            public_count: to_sql(generation.public_count),
            protected_count: to_sql(generation.protected_count),
            failed_count: to_sql(generation.failed_count),
            started_at: generation.started_at,
            finished_at: generation.finished_at,
            status: generation.status.as_str().to_owned(),
            last_cursor: generation.last_cursor.map(|cursor| to_sql(cursor.value())),
            error: generation.error.clone(),
        }
    }
}

impl TryFrom<StoredGeneration> for ProcessGeneration {
    type Error = StateError;

    fn try_from(stored: StoredGeneration) -> Result<Self, Self::Error> {
        Ok(Self {
            run_id: RunId(stored.run_id),
            instance_slot: decode_slot("instance_slot", stored.instance_slot)?,
            status: stored.status.parse::<GenerationStatus>()?,
            provider_id: stored.provider_id,
            public_count: from_sql(stored.public_count),
            protected_count: from_sql(stored.protected_count),
            failed_count: from_sql(stored.failed_count),
            started_at: stored.started_at,
            finished_at: stored.finished_at,
            last_cursor: stored.last_cursor.map(|cursor| Cursor(from_sql(cursor))),
            error: stored.error,
        })
    }
}

/// Column values of one `runs` row.
struct StoredRun {
    run_id: i64,
    mode: String,
    target_slot: i64,
    provider_ids: String,
    started_at: i64,
    finished_at: Option<i64>,
    outcome: Option<String>,
    lease_expires_at: Option<i64>,
}

impl StoredRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            mode: row.get(1)?,
            target_slot: row.get(2)?,
            provider_ids: row.get(3)?,
            started_at: row.get(4)?,
            finished_at: row.get(5)?,
            outcome: row.get(6)?,
            lease_expires_at: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<RunRecord, StateError> {
        let provider_ids: Vec<String> =
            serde_json::from_str(&self.provider_ids).map_err(|_| StateError::Corrupt {
                field: "provider_ids",
                value: self.provider_ids.clone(),
            })?;
        Ok(RunRecord {
            run_id: RunId(self.run_id),
            mode: self.mode.parse()?,
            target_slot: decode_slot("target_slot", self.target_slot)?,
            provider_ids,
            started_at: self.started_at,
            finished_at: self.finished_at,
            outcome: self.outcome,
            lease_expires_at: self.lease_expires_at,
        })
    }
}

fn decode_slot(field: &'static str, value: i64) -> Result<InstanceSlot, StateError> {
    InstanceSlot::from_i64(value).ok_or_else(|| StateError::Corrupt {
        field,
        value: value.to_string(),
    })
}

fn to_sql(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

const fn query_error(operation: &'static str, source: rusqlite::Error) -> StateError {
    StateError::Query { operation, source }
}
