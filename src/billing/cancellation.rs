use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use super::models::{OccurrenceState, SubscriptionStatus};
use super::store::BillingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationOutcome {
    Applied { occurrence_id: Option<Uuid> },
    /// The subscription was not in the state the request starts from.
    NotApplicable,
    /// A failed charge must be settled before the plan can be cancelled.
    PaymentOutstanding,
    Missing,
}

// key: billing-cancellation -> user cancel and rescind
pub struct CancellationController {
    store: Arc<dyn BillingStore>,
}

impl CancellationController {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn request(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CancellationOutcome> {
        let occurrences = self.store.list_occurrences(subscription_id).await?;
        if occurrences
            .iter()
            .any(|occurrence| occurrence.state == OccurrenceState::Failed)
        {
            return Ok(CancellationOutcome::PaymentOutstanding);
        }
        if self.store.find_subscription(subscription_id).await?.is_none() {
            return Ok(CancellationOutcome::Missing);
        }

        let moved = self
            .store
            .transition_subscription_status(
                subscription_id,
                SubscriptionStatus::Active,
                SubscriptionStatus::CancellationRequested,
                now,
            )
            .await?;
        if !moved {
            return Ok(CancellationOutcome::NotApplicable);
        }

        let occurrence_id = self
            .store
            .cancel_next_pending_occurrence(subscription_id, now)
            .await?;
        info!(
            subscription = %subscription_id,
            occurrence = ?occurrence_id,
            "cancellation requested"
        );
        Ok(CancellationOutcome::Applied { occurrence_id })
    }

    pub async fn rescind(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CancellationOutcome> {
        let Some(subscription) = self.store.find_subscription(subscription_id).await? else {
            return Ok(CancellationOutcome::Missing);
        };

        let moved = self
            .store
            .transition_subscription_status(
                subscription_id,
                SubscriptionStatus::CancellationRequested,
                SubscriptionStatus::Active,
                now,
            )
            .await?;
        if !moved {
            return Ok(CancellationOutcome::NotApplicable);
        }

        // Only the renewal at or after the current cycle end comes back.
        let cutoff = subscription.original_end_date - chrono::Duration::seconds(1);
        let occurrence_id = self
            .store
            .restore_cancelled_occurrence(subscription_id, cutoff, now)
            .await?;
        info!(
            subscription = %subscription_id,
            occurrence = ?occurrence_id,
            "cancellation rescinded"
        );
        Ok(CancellationOutcome::Applied { occurrence_id })
    }
}
