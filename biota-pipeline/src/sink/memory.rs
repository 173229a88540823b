//! In-memory sink for tests and dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use biota_core::CanonicalObservation;

use super::{BatchSink, RecordFilter, SinkError};
use crate::slot::InstanceSlot;

type SlotRecords = BTreeMap<(String, String), CanonicalObservation>;

/// Both slots held in ordered maps.
#[derive(Debug, Default)]
pub struct MemorySink {
    slots: Mutex<HashMap<InstanceSlot, SlotRecords>>,
}

impl MemorySink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record in `slot`, ordered by provider then key.
    #[must_use]
    pub fn snapshot(&self, slot: InstanceSlot) -> Vec<CanonicalObservation> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(&slot)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BatchSink for MemorySink {
    async fn write_batch(
        &self,
        records: Vec<CanonicalObservation>,
        slot: InstanceSlot,
    ) -> Result<usize, SinkError> {
        let written = records.len();
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let target = slots.entry(slot).or_default();
        for record in records {
            target.insert(
                (record.provider_id.clone(), record.stable_key.clone()),
                record,
            );
        }
        Ok(written)
    }

    async fn clear_provider(
        &self,
        provider_id: &str,
        slot: InstanceSlot,
    ) -> Result<usize, SinkError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(records) = slots.get_mut(&slot) else {
            return Ok(0);
        };
        let before = records.len();
        records.retain(|(provider, _), _| provider != provider_id);
        Ok(before.saturating_sub(records.len()))
    }

    async fn copy_provider(
        &self,
        provider_id: &str,
        from: InstanceSlot,
        to: InstanceSlot,
    ) -> Result<usize, SinkError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let copies: Vec<_> = slots
            .get(&from)
            .map(|records| {
                records
                    .iter()
                    .filter(|((provider, _), _)| provider == provider_id)
                    .map(|(key, record)| (key.clone(), record.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let copied = copies.len();
        let target = slots.entry(to).or_default();
        target.retain(|(provider, _), _| provider != provider_id);
        target.extend(copies);
        Ok(copied)
    }

    async fn count(&self, slot: InstanceSlot, provider_id: &str) -> Result<usize, SinkError> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(slots.get(&slot).map_or(0, |records| {
            records
                .keys()
                .filter(|(provider, _)| provider == provider_id)
                .count()
        }))
    }

    async fn search(
        &self,
        slot: InstanceSlot,
        filter: &RecordFilter,
    ) -> Result<Vec<CanonicalObservation>, SinkError> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(slots.get(&slot).map_or_else(Vec::new, |records| {
            records
                .values()
                .filter(|record| filter.matches(record))
                .take(filter.limit.unwrap_or(usize::MAX))
                .cloned()
                .collect()
        }))
    }
}
