use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::adapters::EntitlementBridge;
use super::models::SubscriptionStatus;
use super::store::BillingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    Expired,
    NotDue,
    Missing,
}

// key: billing-reaper -> finalize subscriptions past their end date
pub struct ExpiryReaper {
    store: Arc<dyn BillingStore>,
    entitlements: Arc<dyn EntitlementBridge>,
}

impl ExpiryReaper {
    pub fn new(store: Arc<dyn BillingStore>, entitlements: Arc<dyn EntitlementBridge>) -> Self {
        Self {
            store,
            entitlements,
        }
    }

    /// Expires the subscription if it is still due at `now`. The store
    /// re-checks the due predicate, so a redelivered task after a committed
    /// expiry makes no bridge calls.
    pub async fn expire(&self, subscription_id: Uuid, now: DateTime<Utc>) -> Result<ReapOutcome> {
        let Some(subscription) = self.store.find_subscription(subscription_id).await? else {
            debug!(subscription = %subscription_id, "expire task for unknown subscription");
            return Ok(ReapOutcome::Missing);
        };

        let expired = self
            .store
            .expire_subscription(
                subscription.id,
                &[
                    SubscriptionStatus::Active,
                    SubscriptionStatus::CancellationRequested,
                ],
                Some(now),
                now,
            )
            .await?;

        if !expired {
            debug!(
                subscription = %subscription.id,
                status = %subscription.status,
                end_date = %subscription.end_date,
                "subscription no longer due for expiry"
            );
            return Ok(ReapOutcome::NotDue);
        }

        info!(
            subscription = %subscription.id,
            previous_status = %subscription.status,
            end_date = %subscription.end_date,
            "subscription expired"
        );

        if let Err(err) = self
            .entitlements
            .set_expiry_now(&subscription.entitlement_code)
            .await
        {
            error!(
                ?err,
                subscription = %subscription.id,
                entitlement = %subscription.entitlement_code,
                "failed to expire entitlement"
            );
        }

        Ok(ReapOutcome::Expired)
    }
}
