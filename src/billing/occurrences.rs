use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::BillingConfig;

use super::calendar::cycle_schedule;
use super::models::{BillingCycle, Occurrence, SubscriptionStatus};
use super::store::BillingStore;

// key: billing-pregen -> keep the schedule from running dry
pub struct OccurrencePlanner {
    store: Arc<dyn BillingStore>,
    config: BillingConfig,
}

impl OccurrencePlanner {
    pub fn new(store: Arc<dyn BillingStore>, config: BillingConfig) -> Self {
        Self { store, config }
    }

    fn run_ahead(&self, cycle: BillingCycle) -> u32 {
        match cycle {
            BillingCycle::Monthly => self.config.monthly_run_ahead,
            BillingCycle::Yearly => self.config.yearly_run_ahead,
        }
    }

    /// Seeds the run-ahead window for an ACTIVE subscription that has no
    /// PENDING or FAILED occurrence. Returns how many occurrences were created.
    pub async fn create_pending(&self, subscription_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let Some(subscription) = self.store.find_subscription(subscription_id).await? else {
            debug!(subscription = %subscription_id, "pre-generation for unknown subscription");
            return Ok(0);
        };
        if subscription.status != SubscriptionStatus::Active {
            return Ok(0);
        }
        if self.store.has_open_occurrence(subscription.id).await? {
            return Ok(0);
        }

        let Some(plan) = self.store.find_plan(subscription.plan_id).await? else {
            error!(
                subscription = %subscription.id,
                plan = %subscription.plan_id,
                "cannot pre-generate occurrences without a plan"
            );
            return Ok(0);
        };

        let dates = cycle_schedule(
            subscription.anchor_day(),
            subscription.billing_cycle,
            subscription.original_end_date,
            self.run_ahead(subscription.billing_cycle),
        );
        let occurrences: Vec<Occurrence> = dates
            .into_iter()
            .map(|scheduled_at| {
                Occurrence::pending(
                    subscription.id,
                    scheduled_at,
                    plan.amount_cents,
                    plan.currency.clone(),
                    now,
                )
            })
            .collect();

        let created = self.store.insert_occurrences(&occurrences).await?;
        info!(
            subscription = %subscription.id,
            created,
            first = %subscription.original_end_date,
            "pre-generated billing occurrences"
        );
        Ok(created)
    }
}
