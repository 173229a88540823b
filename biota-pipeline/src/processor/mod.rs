//! Per-provider chunk loop: fetch, map, enrich, write, confirm.
//!
//! Chunks of one provider are strictly ordered. A chunk's cursor is only
//! confirmed to the ledger after its records reached the sink, so a resumed
//! provider never skips rows; replayed rows are absorbed by the sink's
//! upsert semantics.

use std::sync::Arc;

use biota_core::{
    AreaIndex, CanonicalObservation, DiffusionPolicy, EnrichmentOutcome, RecordEnricher,
    TaxonGraph, ValidationState,
};
use log::{debug, info, warn};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::registry::ProviderHandle;
use crate::sink::{BatchSink, SinkError};
use crate::slot::InstanceSlot;
use crate::source::{Cursor, SourceError};
use crate::state::{GenerationLedger, ProcessGeneration, RunId, StateError};

/// Chunk size used when none is configured.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Read-only lookup structures shared by every provider of a run.
#[derive(Debug)]
pub struct ProcessorContext {
    /// Taxonomy snapshot.
    pub graph: TaxonGraph,
    /// Region index.
    pub areas: AreaIndex,
    /// Sensitive-species policy.
    pub policy: DiffusionPolicy,
}

impl ProcessorContext {
    /// Bundle the lookup structures.
    #[must_use]
    pub const fn new(graph: TaxonGraph, areas: AreaIndex, policy: DiffusionPolicy) -> Self {
        Self {
            graph,
            areas,
            policy,
        }
    }

    /// Enricher borrowing this context.
    #[must_use]
    pub const fn enricher(&self) -> RecordEnricher<'_> {
        RecordEnricher::new(&self.graph, &self.areas, &self.policy)
    }
}

/// One provider to process within a run.
#[derive(Debug, Clone)]
pub struct ProviderJob {
    /// Provider to read.
    pub provider: ProviderHandle,
    /// Run the generation belongs to.
    pub run_id: RunId,
    /// Slot to write.
    pub slot: InstanceSlot,
    /// Earlier generation to continue from, when resuming.
    pub resume_from: Option<ProcessGeneration>,
}

/// Why a provider stopped before its last chunk.
#[derive(Debug, Error)]
pub enum ProviderFailure {
    /// The run was cancelled.
    #[error("cancelled")]
    Cancelled,
    /// The source failed.
    #[error("source error: {0}")]
    Source(#[source] SourceError),
    /// The sink failed.
    #[error("sink error: {0}")]
    Sink(#[source] SinkError),
    /// Progress could not be recorded.
    #[error("state error: {0}")]
    State(#[source] StateError),
    /// The enrichment task panicked.
    #[error("enrichment task failed: {0}")]
    Enrichment(#[source] tokio::task::JoinError),
}

/// Counts for one chunk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ChunkTally {
    public: u64,
    protected: u64,
    failed: u64,
}

impl ChunkTally {
    fn record(&mut self, outcome: &EnrichmentOutcome) {
        match outcome.observation.validation_state {
            ValidationState::Invalid | ValidationState::Unvalidated => self.failed += 1,
            ValidationState::Valid | ValidationState::ValidWithWarnings => {
                if outcome.observation.sensitive {
                    self.protected += 1;
                } else {
                    self.public += 1;
                }
            }
        }
    }

    fn apply(self, generation: &mut ProcessGeneration) {
        generation.public_count = generation.public_count.saturating_add(self.public);
        generation.protected_count = generation.protected_count.saturating_add(self.protected);
        generation.failed_count = generation.failed_count.saturating_add(self.failed);
    }
}

/// Drives providers through the chunk loop.
#[derive(Debug, Clone)]
pub struct BatchProcessor {
    context: Arc<ProcessorContext>,
    chunk_size: usize,
}

impl BatchProcessor {
    /// Processor reading `chunk_size` rows per fetch. A zero size is raised
    /// to one.
    #[must_use]
    pub fn new(context: Arc<ProcessorContext>, chunk_size: usize) -> Self {
        Self {
            context,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Rows requested per fetch.
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Process one provider into `job.slot` and return its final generation.
    ///
    /// Failures never escape: they are recorded on the returned generation
    /// and, where the ledger is reachable, persisted.
    pub async fn process_provider(
        &self,
        job: ProviderJob,
        sink: &dyn BatchSink,
        ledger: &dyn GenerationLedger,
        cancel: &CancellationToken,
    ) -> ProcessGeneration {
        let provider_id = job.provider.id().to_owned();
        let resume_cursor = job
            .resume_from
            .as_ref()
            .and_then(|previous| previous.last_cursor);
        let mut generation = job.resume_from.clone().map_or_else(
            || ProcessGeneration::start(job.run_id, provider_id.clone(), job.slot),
            ProcessGeneration::resumed,
        );
        info!(
            "provider {provider_id} starting in slot {} from cursor {}",
            job.slot,
            resume_cursor.unwrap_or(Cursor::START)
        );

        let result = self
            .run_chunks(&job, resume_cursor, sink, ledger, cancel, &mut generation)
            .await;
        match result {
            Ok(()) => {
                generation.succeed();
                info!(
                    "provider {provider_id} finished: {} public, {} protected, {} failed",
                    generation.public_count, generation.protected_count, generation.failed_count
                );
            }
            Err(failure) => {
                warn!("provider {provider_id} failed: {failure}");
                generation.fail(failure.to_string());
            }
        }
        if let Err(err) = ledger.finish(&generation).await {
            warn!("could not record final state of provider {provider_id}: {err}");
        }
        generation
    }

    async fn run_chunks(
        &self,
        job: &ProviderJob,
        resume_cursor: Option<Cursor>,
        sink: &dyn BatchSink,
        ledger: &dyn GenerationLedger,
        cancel: &CancellationToken,
        generation: &mut ProcessGeneration,
    ) -> Result<(), ProviderFailure> {
        let provider = &job.provider;
        if resume_cursor.is_none() {
            let removed = sink
                .clear_provider(provider.id(), job.slot)
                .await
                .map_err(ProviderFailure::Sink)?;
            debug!(
                "cleared {removed} stale records of provider {} from slot {}",
                provider.id(),
                job.slot
            );
        }
        ledger.begin(generation).await.map_err(ProviderFailure::State)?;

        let context = provider.context();
        let mut cursor = resume_cursor.unwrap_or(Cursor::START);
        loop {
            if cancel.is_cancelled() {
                return Err(ProviderFailure::Cancelled);
            }
            let batch = provider
                .source
                .next_batch(cursor, self.chunk_size)
                .await
                .map_err(ProviderFailure::Source)?;

            let mut tally = ChunkTally::default();
            let mut mapped = Vec::with_capacity(batch.rows.len());
            for row in &batch.rows {
                match (provider.mapper)(row, &context) {
                    Ok(record) => mapped.push(record),
                    Err(err) => {
                        debug!("provider {}: {err}", provider.id());
                        tally.failed += 1;
                    }
                }
            }

            let publishable = self.enrich(mapped, &mut tally).await?;
            let written = sink
                .write_batch(publishable, job.slot)
                .await
                .map_err(ProviderFailure::Sink)?;

            tally.apply(generation);
            generation.last_cursor = Some(batch.next_cursor);
            ledger
                .checkpoint(generation)
                .await
                .map_err(ProviderFailure::State)?;
            debug!(
                "provider {}: chunk ending at {} wrote {written} records",
                provider.id(),
                batch.next_cursor
            );

            if !batch.has_more {
                return Ok(());
            }
            cursor = batch.next_cursor;
        }
    }

    /// Enrich on the blocking pool and keep only publishable records.
    async fn enrich(
        &self,
        records: Vec<CanonicalObservation>,
        tally: &mut ChunkTally,
    ) -> Result<Vec<CanonicalObservation>, ProviderFailure> {
        if records.is_empty() {
            return Ok(records);
        }
        let context = Arc::clone(&self.context);
        let outcomes = tokio::task::spawn_blocking(move || context.enricher().enrich_batch(records))
            .await
            .map_err(ProviderFailure::Enrichment)?;
        Ok(outcomes
            .into_iter()
            .filter_map(|outcome| {
                tally.record(&outcome);
                outcome.is_publishable().then_some(outcome.observation)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests;
