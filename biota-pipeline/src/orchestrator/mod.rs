//! Runs: provider fan-out, swap policy and the final slot swap.
//!
//! A run resolves its providers once, takes a [`SwapTicket`], leases the
//! ticket's target slot in the state store and processes providers on the
//! tokio runtime behind a semaphore. When every provider has settled, the
//! run's [`RunMode`] decides whether the target slot may be published.
//! Providers the run did not refresh are copied over from the active slot,
//! and the coordinator performs the compare-and-set swap.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::coordinator::{InstanceCoordinator, SwapResult, SwapTicket};
use crate::processor::{BatchProcessor, DEFAULT_CHUNK_SIZE, ProcessorContext, ProviderJob};
use crate::registry::{ProviderRegistry, RegistryError};
use crate::sink::BatchSink;
use crate::slot::InstanceSlot;
use crate::state::{
    GenerationLedger, GenerationStatus, ProcessGeneration, RunId, RunMode, RunRecord, SlotLease,
    StateError, StateStore,
};

const DEFAULT_MAX_CONCURRENT_PROVIDERS: usize = 4;
const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);
/// Time a slot lease outlives the run timeout, covering settle and publish.
const LEASE_GRACE: Duration = Duration::from_secs(10 * 60);

/// Limits applied to every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    max_concurrent_providers: usize,
    provider_timeout: Duration,
    run_timeout: Duration,
    chunk_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_providers: DEFAULT_MAX_CONCURRENT_PROVIDERS,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            run_timeout: DEFAULT_RUN_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl OrchestratorConfig {
    /// Override how many providers run at once.
    #[must_use]
    pub const fn with_max_concurrent_providers(mut self, limit: usize) -> Self {
        self.max_concurrent_providers = limit;
        self
    }

    /// Override the per-provider time limit.
    #[must_use]
    pub const fn with_provider_timeout(mut self, limit: Duration) -> Self {
        self.provider_timeout = limit;
        self
    }

    /// Override the whole-run time limit.
    #[must_use]
    pub const fn with_run_timeout(mut self, limit: Duration) -> Self {
        self.run_timeout = limit;
        self
    }

    /// Override the rows fetched per chunk.
    #[must_use]
    pub const fn with_chunk_size(mut self, rows: usize) -> Self {
        self.chunk_size = rows;
        self
    }

    /// Providers processed at once.
    #[must_use]
    pub const fn max_concurrent_providers(&self) -> usize {
        self.max_concurrent_providers
    }

    /// Time limit for one provider.
    #[must_use]
    pub const fn provider_timeout(&self) -> Duration {
        self.provider_timeout
    }

    /// Time limit for a whole run.
    #[must_use]
    pub const fn run_timeout(&self) -> Duration {
        self.run_timeout
    }

    /// Rows fetched per chunk.
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn validate(&self) -> Result<(), OrchestratorError> {
        let problem = if self.max_concurrent_providers == 0 {
            Some("max_concurrent_providers must be at least 1")
        } else if self.chunk_size == 0 {
            Some("chunk_size must be at least 1")
        } else if self.provider_timeout.is_zero() || self.run_timeout.is_zero() {
            Some("timeouts must be positive")
        } else {
            None
        };
        problem.map_or(Ok(()), |message| {
            Err(OrchestratorError::InvalidConfig {
                message: message.to_owned(),
            })
        })
    }
}

/// Why a run left the active slot alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotSwappedReason {
    /// The run mode's success rule was not met.
    PolicyRejected,
    /// Another run swapped after this run started.
    LostRace,
    /// The run exceeded its time limit.
    RunTimedOut,
    /// The run was cancelled.
    Cancelled,
    /// Carry-over or the swap itself failed.
    Failed(String),
}

impl NotSwappedReason {
    /// Short tag used in outcome labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyRejected => "policy-rejected",
            Self::LostRace => "lost-race",
            Self::RunTimedOut => "run-timed-out",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run's slot is now active.
    Swapped {
        /// Newly active slot.
        active_slot: InstanceSlot,
    },
    /// The active slot is unchanged.
    NotSwapped(NotSwappedReason),
}

impl RunOutcome {
    /// Whether the run published its slot.
    #[must_use]
    pub const fn is_swapped(&self) -> bool {
        matches!(self, Self::Swapped { .. })
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Swapped { .. } => f.write_str(SWAPPED_LABEL),
            Self::NotSwapped(NotSwappedReason::Failed(message)) => {
                write!(f, "not-swapped: failed: {message}")
            }
            Self::NotSwapped(reason) => write!(f, "not-swapped: {}", reason.as_str()),
        }
    }
}

const SWAPPED_LABEL: &str = "swapped";

/// Everything known about a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Run identifier.
    pub run_id: RunId,
    /// Swap policy applied.
    pub mode: RunMode,
    /// Slot the run wrote.
    pub target_slot: InstanceSlot,
    /// Final outcome.
    pub outcome: RunOutcome,
    /// Final generation of every provider, ordered by provider.
    pub generations: Vec<ProcessGeneration>,
}

/// Errors that prevent a run from starting or being awaited.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The configuration is unusable.
    #[error("invalid orchestrator configuration: {message}")]
    InvalidConfig {
        /// What is wrong.
        message: String,
    },
    /// No providers were selected.
    #[error("no providers selected for the run")]
    NoProviders,
    /// Provider resolution failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The state store failed.
    #[error(transparent)]
    State(#[from] StateError),
    /// A swapped run cannot be resumed.
    #[error("run {run_id} already swapped")]
    RunAlreadySwapped {
        /// Run identifier.
        run_id: RunId,
    },
    /// The run's target slot has become the active slot.
    #[error("run {run_id} targeted slot {target_slot}, which is now active")]
    StaleRun {
        /// Run identifier.
        run_id: RunId,
        /// Slot the run wrote.
        target_slot: InstanceSlot,
    },
    /// The run task panicked or was aborted.
    #[error("run task failed")]
    Task(#[source] tokio::task::JoinError),
}

/// A run in progress.
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    target_slot: InstanceSlot,
    cancel: CancellationToken,
    task: JoinHandle<RunReport>,
}

impl RunHandle {
    /// Run identifier.
    #[must_use]
    pub const fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Slot the run writes.
    #[must_use]
    pub const fn target_slot(&self) -> InstanceSlot {
        self.target_slot
    }

    /// Ask the run to stop at the next chunk boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the run has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to end.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Task`] when the run task panicked.
    pub async fn wait(self) -> Result<RunReport, OrchestratorError> {
        self.task.await.map_err(OrchestratorError::Task)
    }
}

/// Starts, tracks and resumes runs.
pub struct PipelineOrchestrator {
    config: OrchestratorConfig,
    registry: ProviderRegistry,
    processor: BatchProcessor,
    sink: Arc<dyn BatchSink>,
    state: Arc<StateStore>,
    coordinator: InstanceCoordinator,
}

impl PipelineOrchestrator {
    /// Wire an orchestrator.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidConfig`] for unusable limits.
    pub fn new(
        config: OrchestratorConfig,
        registry: ProviderRegistry,
        context: Arc<ProcessorContext>,
        sink: Arc<dyn BatchSink>,
        state: Arc<StateStore>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let processor = BatchProcessor::new(context, config.chunk_size);
        let coordinator = InstanceCoordinator::new(state.clone());
        Ok(Self {
            config,
            registry,
            processor,
            sink,
            state,
            coordinator,
        })
    }

    /// Coordinator over the shared activation record.
    #[must_use]
    pub const fn coordinator(&self) -> &InstanceCoordinator {
        &self.coordinator
    }

    /// Registered providers.
    #[must_use]
    pub const fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Start a run over `provider_ids`, or every provider when empty.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Registry`] for unknown providers,
    /// [`OrchestratorError::NoProviders`] when nothing is selected and
    /// [`OrchestratorError::State`] when the run cannot be recorded. An
    /// unfinished run already writing the inactive slot surfaces as
    /// [`StateError::SlotBusy`].
    pub async fn start_run(
        &self,
        provider_ids: &[String],
        mode: RunMode,
    ) -> Result<RunHandle, OrchestratorError> {
        let providers = self.registry.resolve(provider_ids)?;
        if providers.is_empty() {
            return Err(OrchestratorError::NoProviders);
        }
        let ticket = self.coordinator.begin().await?;
        let ids: Vec<String> = providers
            .iter()
            .map(|provider| provider.id().to_owned())
            .collect();
        let record = self
            .state
            .create_run(mode, self.lease(ticket), &ids)
            .await?;
        let jobs = providers
            .into_iter()
            .map(|provider| ProviderJob {
                provider,
                run_id: record.run_id,
                slot: ticket.target_slot,
                resume_from: None,
            })
            .collect();
        Ok(self.launch(record, ticket, jobs))
    }

    /// Resume a run that ended without swapping.
    ///
    /// Providers that already succeeded are kept; the others continue from
    /// their last confirmed cursor into the same target slot.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::RunAlreadySwapped`] for published runs,
    /// [`OrchestratorError::StaleRun`] when the target slot has since become
    /// active, [`StateError::SlotBusy`] inside [`OrchestratorError::State`]
    /// when another unfinished run holds the slot, and registry or state
    /// errors otherwise.
    pub async fn resume_run(&self, run_id: RunId) -> Result<RunHandle, OrchestratorError> {
        let record = self.state.run(run_id).await?;
        if record.outcome.as_deref() == Some(SWAPPED_LABEL) {
            return Err(OrchestratorError::RunAlreadySwapped { run_id });
        }
        let ticket = self.coordinator.begin().await?;
        if ticket.target_slot != record.target_slot {
            return Err(OrchestratorError::StaleRun {
                run_id,
                target_slot: record.target_slot,
            });
        }

        let previous: BTreeMap<String, ProcessGeneration> = self
            .state
            .generations(run_id)
            .await?
            .into_iter()
            .map(|generation| (generation.provider_id.clone(), generation))
            .collect();
        let pending: Vec<String> = record
            .provider_ids
            .iter()
            .filter(|id| !previous.get(*id).is_some_and(ProcessGeneration::succeeded))
            .cloned()
            .collect();
        let jobs = if pending.is_empty() {
            Vec::new()
        } else {
            self.registry
                .resolve(&pending)?
                .into_iter()
                .map(|provider| ProviderJob {
                    resume_from: previous.get(provider.id()).cloned(),
                    provider,
                    run_id,
                    slot: record.target_slot,
                })
                .collect()
        };
        self.state.reopen_run(run_id, self.lease(ticket)).await?;
        info!("resuming run {run_id} with {} pending providers", pending.len());
        Ok(self.launch(record, ticket, jobs))
    }

    /// Signal a run to stop.
    pub fn cancel_run(&self, handle: &RunHandle) {
        info!("cancelling run {}", handle.run_id);
        handle.cancel();
    }

    /// Persisted generations of a run.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::State`] when the ledger cannot be read.
    pub async fn run_status(
        &self,
        handle: &RunHandle,
    ) -> Result<Vec<ProcessGeneration>, OrchestratorError> {
        Ok(self.state.generations(handle.run_id).await?)
    }

    const fn lease(&self, ticket: SwapTicket) -> SlotLease {
        SlotLease {
            target_slot: ticket.target_slot,
            observed_version: ticket.observed_version,
            duration: self.config.run_timeout.saturating_add(LEASE_GRACE),
        }
    }

    fn launch(&self, record: RunRecord, ticket: SwapTicket, jobs: Vec<ProviderJob>) -> RunHandle {
        let cancel = CancellationToken::new();
        let core: BTreeSet<String> = record
            .provider_ids
            .iter()
            .filter(|id| self.registry.definition(id).is_some_and(|definition| definition.core))
            .cloned()
            .collect();
        let unselected: Vec<String> = self
            .registry
            .definitions()
            .map(|definition| definition.id.clone())
            .filter(|id| !record.provider_ids.contains(id))
            .collect();
        let execution = RunExecution {
            config: self.config.clone(),
            processor: self.processor.clone(),
            sink: Arc::clone(&self.sink),
            state: Arc::clone(&self.state),
            coordinator: self.coordinator.clone(),
            cancel: cancel.clone(),
        };
        let run_id = record.run_id;
        let target_slot = ticket.target_slot;
        let plan = RunPlan {
            record,
            ticket,
            jobs,
            core,
            unselected,
        };
        RunHandle {
            run_id,
            target_slot,
            cancel,
            task: tokio::spawn(execution.run(plan)),
        }
    }
}

impl fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

struct RunPlan {
    record: RunRecord,
    ticket: SwapTicket,
    jobs: Vec<ProviderJob>,
    core: BTreeSet<String>,
    /// Registered providers outside the run, served from the active slot.
    unselected: Vec<String>,
}

/// Owned pieces a spawned run needs.
#[derive(Clone)]
struct RunExecution {
    config: OrchestratorConfig,
    processor: BatchProcessor,
    sink: Arc<dyn BatchSink>,
    state: Arc<StateStore>,
    coordinator: InstanceCoordinator,
    cancel: CancellationToken,
}

impl RunExecution {
    async fn run(self, mut plan: RunPlan) -> RunReport {
        let run_id = plan.record.run_id;
        let jobs = std::mem::take(&mut plan.jobs);
        let timed_out = tokio::time::timeout(self.config.run_timeout, self.process_all(jobs))
            .await
            .is_err();
        if timed_out {
            warn!(
                "run {run_id} exceeded {}s and was stopped",
                self.config.run_timeout.as_secs()
            );
            self.cancel.cancel();
        }

        let reason = if timed_out { "run timed out" } else { "abandoned" };
        let (outcome, generations) = match self.settle(&plan.record, reason).await {
            Ok(generations) => {
                let outcome = if timed_out {
                    RunOutcome::NotSwapped(NotSwappedReason::RunTimedOut)
                } else if self.cancel.is_cancelled() {
                    RunOutcome::NotSwapped(NotSwappedReason::Cancelled)
                } else {
                    self.publish(&plan, &generations).await
                };
                (outcome, generations)
            }
            Err(err) => (
                RunOutcome::NotSwapped(NotSwappedReason::Failed(err.to_string())),
                Vec::new(),
            ),
        };

        if let Err(err) = self.state.finish_run(run_id, &outcome.to_string()).await {
            warn!("could not record outcome of run {run_id}: {err}");
        }
        info!("run {run_id} finished: {outcome}");
        RunReport {
            run_id,
            mode: plan.record.mode,
            target_slot: plan.ticket.target_slot,
            outcome,
            generations,
        }
    }

    /// Process every job, at most `max_concurrent_providers` at a time.
    ///
    /// Dropping the returned future aborts the provider tasks.
    async fn process_all(&self, jobs: Vec<ProviderJob>) {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_providers));
        let mut workers = JoinSet::new();
        for job in jobs {
            let execution = self.clone();
            let gate = Arc::clone(&permits);
            workers.spawn(async move {
                let Ok(_permit) = gate.acquire_owned().await else {
                    return;
                };
                execution.process_one(job).await;
            });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!("provider task ended abnormally: {err}");
            }
        }
    }

    async fn process_one(&self, job: ProviderJob) {
        let provider_id = job.provider.id().to_owned();
        let (run_id, slot) = (job.run_id, job.slot);
        let limit = self.config.provider_timeout;
        let processing = self.processor.process_provider(
            job,
            self.sink.as_ref(),
            self.state.as_ref(),
            &self.cancel,
        );
        if tokio::time::timeout(limit, processing).await.is_err() {
            let reason = format!("timed out after {limit:?}");
            warn!("provider {provider_id} {reason}");
            if let Err(err) = self.abandon(run_id, &provider_id, slot, &reason).await {
                warn!("could not record timeout of provider {provider_id}: {err}");
            }
        }
    }

    /// Mark a generation that stopped without finishing as failed.
    async fn abandon(
        &self,
        run_id: RunId,
        provider_id: &str,
        slot: InstanceSlot,
        reason: &str,
    ) -> Result<ProcessGeneration, StateError> {
        let mut generation = self
            .state
            .generation(run_id, provider_id)
            .await?
            .unwrap_or_else(|| ProcessGeneration::start(run_id, provider_id, slot));
        generation.fail(reason);
        self.state.finish(&generation).await?;
        Ok(generation)
    }

    /// Final generation of every provider in the run.
    async fn settle(
        &self,
        record: &RunRecord,
        reason: &str,
    ) -> Result<Vec<ProcessGeneration>, StateError> {
        let mut known: BTreeMap<String, ProcessGeneration> = self
            .state
            .generations(record.run_id)
            .await?
            .into_iter()
            .map(|generation| (generation.provider_id.clone(), generation))
            .collect();
        for provider_id in &record.provider_ids {
            let unfinished = known
                .get(provider_id)
                .is_none_or(|generation| generation.status == GenerationStatus::Running);
            if unfinished {
                let generation = self
                    .abandon(record.run_id, provider_id, record.target_slot, reason)
                    .await?;
                known.insert(provider_id.clone(), generation);
            }
        }
        Ok(known.into_values().collect())
    }

    /// Apply the run mode, carry over failed and unselected providers and
    /// swap.
    async fn publish(&self, plan: &RunPlan, generations: &[ProcessGeneration]) -> RunOutcome {
        let failed: Vec<&ProcessGeneration> = generations
            .iter()
            .filter(|generation| !generation.succeeded())
            .collect();
        let allowed = match plan.record.mode {
            RunMode::Full => failed.is_empty(),
            RunMode::Partial => {
                failed.len() < generations.len()
                    && failed
                        .iter()
                        .all(|generation| !plan.core.contains(&generation.provider_id))
            }
        };
        if !allowed {
            info!(
                "run {} keeps the active slot: {} of {} providers failed",
                plan.record.run_id,
                failed.len(),
                generations.len()
            );
            return RunOutcome::NotSwapped(NotSwappedReason::PolicyRejected);
        }

        let target = plan.ticket.target_slot;
        let carried = failed
            .iter()
            .map(|generation| generation.provider_id.as_str())
            .chain(plan.unselected.iter().map(String::as_str));
        for provider_id in carried {
            match self
                .sink
                .copy_provider(provider_id, target.opposite(), target)
                .await
            {
                Ok(copied) => {
                    info!("carried {copied} records of provider {provider_id} into slot {target}");
                }
                Err(err) => {
                    return RunOutcome::NotSwapped(NotSwappedReason::Failed(format!(
                        "carry-over of provider {provider_id} failed: {err}"
                    )));
                }
            }
        }

        match self.coordinator.try_swap(plan.ticket).await {
            Ok(SwapResult::Swapped { active_slot }) => RunOutcome::Swapped { active_slot },
            Ok(SwapResult::LostRace { .. }) => RunOutcome::NotSwapped(NotSwappedReason::LostRace),
            Err(err) => RunOutcome::NotSwapped(NotSwappedReason::Failed(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests;
