//! Persisted run state: the activation record, runs and process generations.
//!
//! The activation record names the slot readers see and carries a version
//! that only ever moves through compare-and-set. Generations record how far
//! each provider got in a run so a run can be inspected or resumed.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;

use crate::slot::InstanceSlot;
use crate::source::Cursor;

mod schema;
mod store;

pub use schema::{SCHEMA_VERSION, initialise_schema};
pub use store::StateStore;

/// Identifier of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(pub i64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which slot is live, and how many swaps have happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationRecord {
    /// Slot served to readers.
    pub active_slot: InstanceSlot,
    /// Incremented by every successful swap.
    pub version: u64,
    /// Unix seconds of the last swap.
    pub last_swap_at: Option<i64>,
}

impl ActivationRecord {
    /// State of a fresh installation.
    pub const INITIAL: Self = Self {
        active_slot: InstanceSlot::Zero,
        version: 0,
        last_swap_at: None,
    };
}

/// Lifecycle of one provider within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationStatus {
    /// Chunks are still being written.
    Running,
    /// Every chunk was written and confirmed.
    Succeeded,
    /// The provider stopped early; see the generation error.
    Failed,
}

impl GenerationStatus {
    /// Tag stored in SQLite.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationStatus {
    type Err = StateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(StateError::Corrupt {
                field: "status",
                value: other.to_owned(),
            }),
        }
    }
}

/// One provider's contribution to one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessGeneration {
    /// Run the generation belongs to.
    pub run_id: RunId,
    /// Provider processed.
    pub provider_id: String,
    /// Slot written.
    pub instance_slot: InstanceSlot,
    /// Published records with exact positions.
    pub public_count: u64,
    /// Published records with generalised positions.
    pub protected_count: u64,
    /// Rows that failed mapping or validation.
    pub failed_count: u64,
    /// Unix seconds when processing began.
    pub started_at: i64,
    /// Unix seconds when processing ended.
    pub finished_at: Option<i64>,
    /// Current lifecycle state.
    pub status: GenerationStatus,
    /// Cursor after the last confirmed chunk.
    pub last_cursor: Option<Cursor>,
    /// Failure reason for [`GenerationStatus::Failed`].
    pub error: Option<String>,
}

impl ProcessGeneration {
    /// A running generation with zero counts.
    pub fn start(run_id: RunId, provider_id: impl Into<String>, instance_slot: InstanceSlot) -> Self {
        Self {
            run_id,
            provider_id: provider_id.into(),
            instance_slot,
            public_count: 0,
            protected_count: 0,
            failed_count: 0,
            started_at: unix_now(),
            finished_at: None,
            status: GenerationStatus::Running,
            last_cursor: None,
            error: None,
        }
    }

    /// Reopen a stopped generation, keeping its counts and cursor.
    #[must_use]
    pub fn resumed(mut self) -> Self {
        self.status = GenerationStatus::Running;
        self.finished_at = None;
        self.error = None;
        self
    }

    /// Mark the generation succeeded.
    pub fn succeed(&mut self) {
        self.status = GenerationStatus::Succeeded;
        self.finished_at = Some(unix_now());
        self.error = None;
    }

    /// Mark the generation failed with `reason`.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = GenerationStatus::Failed;
        self.finished_at = Some(unix_now());
        self.error = Some(reason.into());
    }

    /// Records published by this generation.
    #[must_use]
    pub const fn published_count(&self) -> u64 {
        self.public_count.saturating_add(self.protected_count)
    }

    /// Whether the generation finished successfully.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == GenerationStatus::Succeeded
    }
}

/// How a run decides whether to swap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RunMode {
    /// Swap only when every provider succeeded.
    #[default]
    Full,
    /// Swap when some provider succeeded and no core provider failed.
    Partial,
}

impl RunMode {
    /// Tag stored in SQLite and accepted on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Partial => "partial",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = StateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "full" => Ok(Self::Full),
            "partial" => Ok(Self::Partial),
            other => Err(StateError::Corrupt {
                field: "mode",
                value: other.to_owned(),
            }),
        }
    }
}

/// Persisted summary of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    /// Run identifier.
    pub run_id: RunId,
    /// Swap policy.
    pub mode: RunMode,
    /// Slot the run writes.
    pub target_slot: InstanceSlot,
    /// Providers selected for the run, in processing order.
    pub provider_ids: Vec<String>,
    /// Unix seconds when the run started.
    pub started_at: i64,
    /// Unix seconds when the run ended.
    pub finished_at: Option<i64>,
    /// Outcome label written when the run ended.
    pub outcome: Option<String>,
    /// Unix seconds until which the run holds its target slot; cleared when
    /// the run ends.
    pub lease_expires_at: Option<i64>,
}

/// Claim on a target slot, taken when a run starts or resumes.
///
/// At most one unfinished run holds a live lease on a slot. A lease that
/// outlives its duration without the run finishing is treated as released,
/// so a crashed process does not block the slot forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLease {
    /// Slot the run writes.
    pub target_slot: InstanceSlot,
    /// Activation version observed when the slot was chosen.
    pub observed_version: u64,
    /// How long the claim lasts if the run never finishes.
    pub duration: Duration,
}

/// Errors raised by the state store.
#[derive(Debug, Error)]
pub enum StateError {
    /// The state database could not be opened.
    #[error("failed to open state database at {path:?}")]
    Open {
        /// Database location.
        path: PathBuf,
        /// Underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },
    /// A schema migration step failed.
    #[error("failed to execute migration step '{step}'")]
    Migration {
        /// Step that failed.
        step: &'static str,
        /// Underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },
    /// The database was created by another schema version.
    #[error(
        "expected state schema version {expected} but found {found}; apply migrations before retrying"
    )]
    VersionMismatch {
        /// Version this build understands.
        expected: i64,
        /// Version found on disk.
        found: i64,
    },
    /// A query failed.
    #[error("failed to {operation} in state database")]
    Query {
        /// Action that failed.
        operation: &'static str,
        /// Underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },
    /// A stored value cannot be decoded.
    #[error("state column {field} holds unexpected value '{value}'")]
    Corrupt {
        /// Column name.
        field: &'static str,
        /// Raw stored value.
        value: String,
    },
    /// A requested run does not exist.
    #[error("run {run_id} not found")]
    RunNotFound {
        /// Missing run.
        run_id: RunId,
    },
    /// Another unfinished run holds a live lease on the slot.
    #[error("slot {target_slot} is leased by unfinished run {run_id}")]
    SlotBusy {
        /// Run holding the lease.
        run_id: RunId,
        /// Contested slot.
        target_slot: InstanceSlot,
    },
    /// A swap happened after the caller chose its target slot.
    #[error("activation moved from version {observed} to {current}")]
    ActivationMoved {
        /// Version the caller observed.
        observed: u64,
        /// Version now stored.
        current: u64,
    },
    /// A blocking state task panicked or was cancelled.
    #[error("state task failed")]
    Task {
        /// Join failure reported by tokio.
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Storage for the activation record.
#[async_trait]
pub trait ActivationStore: Send + Sync {
    /// Read the current record.
    async fn load_activation(&self) -> Result<ActivationRecord, StateError>;

    /// Make `active_slot` live if the stored version still equals
    /// `expected_version`.
    ///
    /// Returns the new record on success and `None` when another writer got
    /// there first.
    async fn compare_and_set(
        &self,
        expected_version: u64,
        active_slot: InstanceSlot,
    ) -> Result<Option<ActivationRecord>, StateError>;
}

/// Durable progress of provider generations.
#[async_trait]
pub trait GenerationLedger: Send + Sync {
    /// Record a new or resumed generation.
    async fn begin(&self, generation: &ProcessGeneration) -> Result<(), StateError>;
    /// Confirm a chunk: counts and cursor are persisted together.
    async fn checkpoint(&self, generation: &ProcessGeneration) -> Result<(), StateError>;
    /// Record the final status.
    async fn finish(&self, generation: &ProcessGeneration) -> Result<(), StateError>;
    /// One provider's generation in a run.
    async fn generation(
        &self,
        run_id: RunId,
        provider_id: &str,
    ) -> Result<Option<ProcessGeneration>, StateError>;
    /// Every generation of a run, ordered by provider.
    async fn generations(&self, run_id: RunId) -> Result<Vec<ProcessGeneration>, StateError>;
}

/// Current time as Unix seconds.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
}
