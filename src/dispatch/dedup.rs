use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::warn;

use crate::error::StoreError;
use crate::lifecycle::RecipientLifecycle;
use crate::store::{QueuedArtifact, SharedStateStore};

/// Why a recipient was left out of a batch.
///
/// The first four never consume rate-limit budget. `skipped_ceiling` and
/// `circuit_open` leave the recipient eligible for the next cycle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SkipReason {
    AlreadySentToday,
    LifecycleTerminal,
    LifecycleUnavailable,
    CrossChannelToday,
    SkippedCeiling,
    CircuitOpen,
}

/// Three-layer exclusion gate run per recipient before any external call.
pub struct DedupChecker<'a> {
    store: &'a SharedStateStore,
    lifecycle: &'a dyn RecipientLifecycle,
}

impl<'a> DedupChecker<'a> {
    #[must_use]
    pub fn new(store: &'a SharedStateStore, lifecycle: &'a dyn RecipientLifecycle) -> Self {
        Self { store, lifecycle }
    }

    /// Returns the exclusion reason, or `None` when all three layers pass.
    ///
    /// A lifecycle source failure excludes the recipient (fail closed); a
    /// store failure aborts the caller's planning instead.
    pub async fn check(
        &self,
        artifact: &QueuedArtifact,
        date: NaiveDate,
    ) -> Result<Option<SkipReason>, StoreError> {
        let recipient_id = &artifact.payload.recipient_id;

        // Layer 1: one contact per recipient per day, across all channels.
        if self.store.already_sent_today(recipient_id, date).await? {
            return Ok(Some(SkipReason::AlreadySentToday));
        }

        // Layer 2: terminal lifecycle status.
        match self.lifecycle.get_status(recipient_id).await {
            Ok(status) if status.is_terminal() => {
                return Ok(Some(SkipReason::LifecycleTerminal));
            }
            Ok(_) => {}
            Err(err) => {
                warn!("lifecycle lookup failed for {recipient_id}: {err}; excluding");
                return Ok(Some(SkipReason::LifecycleUnavailable));
            }
        }

        // Layer 3: dispatch marks already on the artifact for this date.
        if artifact.dispatched_on.values().any(|marked| *marked == date) {
            return Ok(Some(SkipReason::CrossChannelToday));
        }

        Ok(None)
    }
}
