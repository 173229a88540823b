use rusqlite::{Connection, OptionalExtension, Transaction};

use super::StateError;

/// Schema version written by this build.
pub const SCHEMA_VERSION: i64 = 2;

/// Version before runs carried slot leases.
const UNLEASED_VERSION: i64 = 1;

/// Create the state tables inside `connection` and record the version.
///
/// Steps run in one transaction. Databases of version 1 gain the run lease
/// column; versions other than that and [`SCHEMA_VERSION`] are rejected.
///
/// # Errors
///
/// Returns [`StateError::Migration`] when a step fails and
/// [`StateError::VersionMismatch`] for databases of another version.
///
/// # Examples
/// ```
/// use biota_pipeline::state::initialise_schema;
/// use rusqlite::Connection;
///
/// let mut conn = Connection::open_in_memory().expect("create in-memory database");
/// initialise_schema(&mut conn).expect("create state schema");
/// let slot: i64 = conn
///     .query_row("SELECT active_slot FROM activation WHERE id = 1", [], |row| row.get(0))
///     .expect("read activation");
/// assert_eq!(slot, 0);
/// ```
pub fn initialise_schema(connection: &mut Connection) -> Result<(), StateError> {
    let transaction = connection
        .transaction()
        .map_err(|source| StateError::Migration {
            step: "begin schema transaction",
            source,
        })?;

    create_tables(&transaction)?;
    seed_activation(&transaction)?;
    ensure_schema_version(&transaction)?;

    transaction.commit().map_err(|source| StateError::Migration {
        step: "commit schema transaction",
        source,
    })
}

fn create_tables(transaction: &Transaction<'_>) -> Result<(), StateError> {
    run_migration_step(
        transaction,
        "create activation",
        "CREATE TABLE IF NOT EXISTS activation (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            active_slot INTEGER NOT NULL CHECK (active_slot IN (0, 1)),
            version INTEGER NOT NULL CHECK (version >= 0),
            last_swap_at INTEGER
        )",
    )?;
    run_migration_step(
        transaction,
        "create runs",
        "CREATE TABLE IF NOT EXISTS runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            mode TEXT NOT NULL,
            target_slot INTEGER NOT NULL CHECK (target_slot IN (0, 1)),
            provider_ids TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            outcome TEXT,
            lease_expires_at INTEGER
        )",
    )?;
    run_migration_step(
        transaction,
        "create process_generations",
        "CREATE TABLE IF NOT EXISTS process_generations (
            run_id INTEGER NOT NULL,
            provider_id TEXT NOT NULL,
            instance_slot INTEGER NOT NULL CHECK (instance_slot IN (0, 1)),
            public_count INTEGER NOT NULL DEFAULT 0,
            protected_count INTEGER NOT NULL DEFAULT 0,
            failed_count INTEGER NOT NULL DEFAULT 0,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            status TEXT NOT NULL,
            last_cursor INTEGER,
            error TEXT,
            PRIMARY KEY (run_id, provider_id),
            FOREIGN KEY (run_id) REFERENCES runs(run_id) ON DELETE CASCADE
        ) WITHOUT ROWID",
    )?;
    run_migration_step(
        transaction,
        "index process_generations by provider",
        "CREATE INDEX IF NOT EXISTS idx_process_generations_provider
            ON process_generations(provider_id, run_id)",
    )
}

fn add_run_leases(transaction: &Transaction<'_>) -> Result<(), StateError> {
    run_migration_step(
        transaction,
        "add run leases",
        "ALTER TABLE runs ADD COLUMN lease_expires_at INTEGER",
    )?;
    transaction
        .execute(
            "UPDATE schema_version SET version = ?1 WHERE version = ?2",
            [SCHEMA_VERSION, UNLEASED_VERSION],
        )
        .map(|_| ())
        .map_err(|source| StateError::Migration {
            step: "record schema version",
            source,
        })
}

fn seed_activation(transaction: &Transaction<'_>) -> Result<(), StateError> {
    run_migration_step(
        transaction,
        "seed activation",
        "INSERT OR IGNORE INTO activation (id, active_slot, version, last_swap_at)
            VALUES (1, 0, 0, NULL)",
    )
}

fn ensure_schema_version(transaction: &Transaction<'_>) -> Result<(), StateError> {
    run_migration_step(
        transaction,
        "create schema version table",
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY CHECK (version > 0),
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        ) WITHOUT ROWID",
    )?;

    let existing: Option<i64> = transaction
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|source| StateError::Migration {
            step: "read schema version",
            source,
        })?;

    match existing {
        Some(version) if version == SCHEMA_VERSION => Ok(()),
        Some(UNLEASED_VERSION) => add_run_leases(transaction),
        Some(found) => Err(StateError::VersionMismatch {
            expected: SCHEMA_VERSION,
            found,
        }),
        None => transaction
            .execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )
            .map(|_| ())
            .map_err(|source| StateError::Migration {
                step: "record schema version",
                source,
            }),
    }
}

fn run_migration_step(
    transaction: &Transaction<'_>,
    step: &'static str,
    sql: &str,
) -> Result<(), StateError> {
    transaction
        .execute(sql, [])
        .map(|_| ())
        .map_err(|source| StateError::Migration { step, source })
}
