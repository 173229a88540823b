//! Blue/green slot coordination.
//!
//! A run takes a [`SwapTicket`] when it starts, writes into the ticket's
//! target slot, and finally presents the ticket back. The swap succeeds only
//! if no other run swapped in between.

use std::fmt;
use std::sync::Arc;

use log::{info, warn};

use crate::slot::InstanceSlot;
use crate::state::{ActivationRecord, ActivationStore, StateError};

/// Activation version observed at run start plus the slot to publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapTicket {
    /// Version the swap must still find.
    pub observed_version: u64,
    /// Inactive slot at run start.
    pub target_slot: InstanceSlot,
}

/// Result of presenting a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapResult {
    /// The target slot is now live.
    Swapped {
        /// Newly active slot.
        active_slot: InstanceSlot,
    },
    /// Another run swapped first; nothing changed.
    LostRace {
        /// Record as found.
        current: ActivationRecord,
    },
}

/// Reads and flips the activation record.
#[derive(Clone)]
pub struct InstanceCoordinator {
    store: Arc<dyn ActivationStore>,
}

impl InstanceCoordinator {
    /// Coordinate through `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ActivationStore>) -> Self {
        Self { store }
    }

    /// Slot readers currently see.
    ///
    /// # Errors
    ///
    /// Returns the store's error when the record cannot be read.
    pub async fn active_slot(&self) -> Result<InstanceSlot, StateError> {
        Ok(self.store.load_activation().await?.active_slot)
    }

    /// Slot a new run would write.
    ///
    /// # Errors
    ///
    /// Returns the store's error when the record cannot be read.
    pub async fn inactive_slot(&self) -> Result<InstanceSlot, StateError> {
        Ok(self.active_slot().await?.opposite())
    }

    /// Take a ticket for a new run.
    ///
    /// # Errors
    ///
    /// Returns the store's error when the record cannot be read.
    pub async fn begin(&self) -> Result<SwapTicket, StateError> {
        let record = self.store.load_activation().await?;
        Ok(SwapTicket {
            observed_version: record.version,
            target_slot: record.active_slot.opposite(),
        })
    }

    /// Publish the ticket's slot if the record is unchanged since `begin`.
    ///
    /// # Errors
    ///
    /// Returns the store's error when the record cannot be read or written.
    pub async fn try_swap(&self, ticket: SwapTicket) -> Result<SwapResult, StateError> {
        match self
            .store
            .compare_and_set(ticket.observed_version, ticket.target_slot)
            .await?
        {
            Some(record) => {
                info!(
                    "slot {} is now active at version {}",
                    record.active_slot, record.version
                );
                Ok(SwapResult::Swapped {
                    active_slot: record.active_slot,
                })
            }
            None => {
                let current = self.store.load_activation().await?;
                warn!(
                    "swap to slot {} lost the race: expected version {}, found {}",
                    ticket.target_slot, ticket.observed_version, current.version
                );
                Ok(SwapResult::LostRace { current })
            }
        }
    }
}

impl fmt::Debug for InstanceCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceCoordinator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![expect(clippy::expect_used, reason = "tests should fail fast when setup breaks")]

    use super::*;
    use crate::test_support::MemoryActivationStore;
    use rstest::{fixture, rstest};

    #[fixture]
    fn coordinator() -> InstanceCoordinator {
        InstanceCoordinator::new(Arc::new(MemoryActivationStore::default()))
    }

    #[rstest]
    #[tokio::test]
    async fn tickets_target_the_inactive_slot(coordinator: InstanceCoordinator) {
        let ticket = coordinator.begin().await.expect("ticket");
        assert_eq!(ticket.observed_version, 0);
        assert_eq!(ticket.target_slot, InstanceSlot::One);
        assert_eq!(
            coordinator.inactive_slot().await.expect("inactive"),
            InstanceSlot::One
        );
    }

    #[rstest]
    #[tokio::test]
    async fn only_the_first_of_two_concurrent_tickets_swaps(coordinator: InstanceCoordinator) {
        let first = coordinator.begin().await.expect("first ticket");
        let second = coordinator.begin().await.expect("second ticket");

        assert_eq!(
            coordinator.try_swap(first).await.expect("first swap"),
            SwapResult::Swapped {
                active_slot: InstanceSlot::One
            }
        );
        let lost = coordinator.try_swap(second).await.expect("second swap");
        assert!(matches!(
            lost,
            SwapResult::LostRace { current } if current.version == 1
                && current.active_slot == InstanceSlot::One
        ));
        assert_eq!(
            coordinator.active_slot().await.expect("active"),
            InstanceSlot::One
        );
    }

    #[rstest]
    #[tokio::test]
    async fn successive_runs_alternate_slots(coordinator: InstanceCoordinator) {
        for expected in [InstanceSlot::One, InstanceSlot::Zero, InstanceSlot::One] {
            let ticket = coordinator.begin().await.expect("ticket");
            assert_eq!(
                coordinator.try_swap(ticket).await.expect("swap"),
                SwapResult::Swapped {
                    active_slot: expected
                }
            );
        }
    }
}
