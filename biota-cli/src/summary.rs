//! JSON shapes printed by the commands.

use biota_core::TaxonId;
use biota_pipeline::{ActivationRecord, ProcessGeneration, RunRecord, RunReport};
use serde::Serialize;

/// One provider's generation within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerationSummary {
    pub(crate) provider_id: String,
    pub(crate) status: String,
    pub(crate) public_count: u64,
    pub(crate) protected_count: u64,
    pub(crate) failed_count: u64,
    pub(crate) last_cursor: Option<u64>,
    pub(crate) error: Option<String>,
}

impl From<&ProcessGeneration> for GenerationSummary {
    fn from(generation: &ProcessGeneration) -> Self {
        Self {
            provider_id: generation.provider_id.clone(),
            status: generation.status.to_string(),
            public_count: generation.public_count,
            protected_count: generation.protected_count,
            failed_count: generation.failed_count,
            last_cursor: generation.last_cursor.map(|cursor| cursor.value()),
            error: generation.error.clone(),
        }
    }
}

/// A run and its generations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RunSummary {
    pub(crate) run_id: i64,
    pub(crate) mode: String,
    pub(crate) target_slot: i64,
    pub(crate) outcome: Option<String>,
    pub(crate) swapped: bool,
    pub(crate) generations: Vec<GenerationSummary>,
}

impl RunSummary {
    pub(crate) fn from_report(report: &RunReport) -> Self {
        Self {
            run_id: report.run_id.0,
            mode: report.mode.to_string(),
            target_slot: report.target_slot.as_i64(),
            outcome: Some(report.outcome.to_string()),
            swapped: report.outcome.is_swapped(),
            generations: report.generations.iter().map(GenerationSummary::from).collect(),
        }
    }

    pub(crate) fn from_record(record: &RunRecord, generations: &[ProcessGeneration]) -> Self {
        Self {
            run_id: record.run_id.0,
            mode: record.mode.to_string(),
            target_slot: record.target_slot.as_i64(),
            outcome: record.outcome.clone(),
            swapped: record.outcome.as_deref() == Some("swapped"),
            generations: generations.iter().map(GenerationSummary::from).collect(),
        }
    }
}

/// Output of `biota status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StatusSummary {
    pub(crate) active_slot: i64,
    pub(crate) version: u64,
    pub(crate) last_swap_at: Option<i64>,
    pub(crate) runs: Vec<RunSummary>,
}

impl StatusSummary {
    pub(crate) fn new(activation: &ActivationRecord, runs: Vec<RunSummary>) -> Self {
        Self {
            active_slot: activation.active_slot.as_i64(),
            version: activation.version,
            last_swap_at: activation.last_swap_at,
            runs,
        }
    }
}

/// Output of `biota check-taxa`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TaxonomySummary {
    pub(crate) taxa: usize,
    pub(crate) root: TaxonId,
    pub(crate) secondary_cycles: Vec<Vec<TaxonId>>,
}
