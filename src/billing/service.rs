use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::job_queue::{Task, TaskQueue};

use super::adapters::{EntitlementBridge, NotificationBridge, PaymentGateway};
use super::calendar::next_cycle_end;
use super::cancellation::{CancellationController, CancellationOutcome};
use super::executor::{ExecutionOutcome, PaymentExecutor};
use super::failure::FailureHandler;
use super::models::{
    Occurrence, OccurrenceState, Subscription, SubscriptionStatus, CURRENT_SCHEMA_VERSION,
};
use super::occurrences::OccurrencePlanner;
use super::reaper::{ExpiryReaper, ReapOutcome};
use super::scheduler::{BillingScheduler, DispatchSummary};
use super::store::BillingStore;

/// First purchase of a plan.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivationRequest {
    pub owner_id: Uuid,
    pub plan_id: Uuid,
    pub entitlement_code: String,
    pub payer_key: String,
    pub contact_email: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    /// What the purchaser actually paid, promotions included. Defaults to the
    /// plan price.
    #[serde(default)]
    pub price_paid_cents: Option<i64>,
    pub purchased_at: DateTime<Utc>,
}

fn default_locale() -> String {
    "en".to_string()
}

/// Read model returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionView {
    pub subscription: Subscription,
    pub display_status: SubscriptionStatus,
    pub occurrences: Vec<Occurrence>,
}

// key: billing-service -> subscription lifecycle
pub struct BillingEngine {
    store: Arc<dyn BillingStore>,
    entitlements: Arc<dyn EntitlementBridge>,
    executor: PaymentExecutor,
    reaper: ExpiryReaper,
    planner: OccurrencePlanner,
    scheduler: BillingScheduler,
    cancellations: CancellationController,
}

impl BillingEngine {
    pub fn new(
        store: Arc<dyn BillingStore>,
        queue: Arc<dyn TaskQueue>,
        gateway: Arc<dyn PaymentGateway>,
        entitlements: Arc<dyn EntitlementBridge>,
        notifications: Arc<dyn NotificationBridge>,
        config: BillingConfig,
    ) -> Self {
        let failures = FailureHandler::new(
            store.clone(),
            entitlements.clone(),
            notifications,
            config.clone(),
        );
        let executor = PaymentExecutor::new(
            store.clone(),
            gateway,
            entitlements.clone(),
            failures,
            config.clone(),
        );
        Self {
            reaper: ExpiryReaper::new(store.clone(), entitlements.clone()),
            planner: OccurrencePlanner::new(store.clone(), config.clone()),
            scheduler: BillingScheduler::new(store.clone(), queue, config),
            cancellations: CancellationController::new(store.clone()),
            executor,
            entitlements,
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.store
    }

    pub fn scheduler(&self) -> BillingScheduler {
        self.scheduler.clone()
    }

    pub async fn handle(&self, task: &Task) -> Result<()> {
        self.handle_at(task, Utc::now()).await
    }

    /// Runs one delivered task. Errors mean "redeliver"; every handler is a
    /// no-op for work that was already applied.
    pub async fn handle_at(&self, task: &Task, now: DateTime<Utc>) -> Result<()> {
        match task {
            Task::DispatchScan => {
                let summary: DispatchSummary = self.scheduler.process_tick(now).await;
                debug!(?summary, "on-demand dispatch scan finished");
            }
            Task::ExecuteOccurrence { occurrence_id } => {
                let outcome = self.executor.execute(*occurrence_id, now).await?;
                if let ExecutionOutcome::Skipped(reason) = outcome {
                    debug!(occurrence = %occurrence_id, ?reason, "execute task skipped");
                }
            }
            Task::ExpireSubscription { subscription_id } => {
                if self.reaper.expire(*subscription_id, now).await? == ReapOutcome::Missing {
                    debug!(subscription = %subscription_id, "expire task skipped");
                }
            }
            Task::CreatePendingOccurrences { subscription_id } => {
                self.planner.create_pending(*subscription_id, now).await?;
            }
        }
        Ok(())
    }

    pub async fn execute_occurrence(
        &self,
        occurrence_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome> {
        self.executor.execute(occurrence_id, now).await
    }

    pub async fn expire_subscription(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReapOutcome> {
        self.reaper.expire(subscription_id, now).await
    }

    pub async fn create_pending_occurrences(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.planner.create_pending(subscription_id, now).await
    }

    pub async fn request_cancellation(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CancellationOutcome> {
        self.cancellations.request(subscription_id, now).await
    }

    pub async fn rescind_cancellation(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CancellationOutcome> {
        self.cancellations.rescind(subscription_id, now).await
    }

    /// NONE -> ACTIVE for a first purchase. The first renewal lands one cycle
    /// after the purchase, on the purchase day-of-month.
    pub async fn activate(&self, request: ActivationRequest) -> Result<Subscription> {
        let plan = self
            .store
            .find_plan(request.plan_id)
            .await?
            .ok_or_else(|| anyhow!("plan {} not found", request.plan_id))?;
        if !plan.active {
            return Err(anyhow!("plan {} is not available for purchase", plan.code));
        }
        if request.entitlement_code.trim().is_empty() {
            return Err(anyhow!("entitlement code must not be empty"));
        }

        let start = request.purchased_at;
        let end = {
            use chrono::Datelike;
            next_cycle_end(start.day(), plan.billing_cycle, start)
        };
        let subscription = Subscription {
            id: Uuid::new_v4(),
            owner_id: request.owner_id,
            plan_id: plan.id,
            status: SubscriptionStatus::Active,
            billing_cycle: plan.billing_cycle,
            start_date: start,
            end_date: end,
            original_end_date: end,
            original_price: request.price_paid_cents.unwrap_or(plan.amount_cents),
            entitlement_code: request.entitlement_code,
            payer_key: request.payer_key,
            contact_email: request.contact_email,
            locale: request.locale,
            schema_version: CURRENT_SCHEMA_VERSION,
            created_at: start,
            updated_at: start,
        };
        self.store.insert_subscription(&subscription).await?;

        info!(
            subscription = %subscription.id,
            plan = %plan.code,
            end_date = %end,
            "subscription activated"
        );

        if let Err(err) = self
            .entitlements
            .extend_expiry(&subscription.entitlement_code, end)
            .await
        {
            error!(
                ?err,
                subscription = %subscription.id,
                "failed to grant entitlement on activation"
            );
        }

        Ok(subscription)
    }

    pub async fn subscription_view(&self, subscription_id: Uuid) -> Result<Option<SubscriptionView>> {
        let Some(subscription) = self.store.find_subscription(subscription_id).await? else {
            return Ok(None);
        };
        let occurrences = self.store.list_occurrences(subscription_id).await?;
        let has_failed = occurrences
            .iter()
            .any(|occurrence| occurrence.state == OccurrenceState::Failed);
        Ok(Some(SubscriptionView {
            display_status: subscription.display_status(has_failed),
            subscription,
            occurrences,
        }))
    }

    /// Brings rows written by older code up to `CURRENT_SCHEMA_VERSION`.
    pub async fn upgrade_legacy_subscriptions(&self) -> Result<u64> {
        let upgraded = self.store.upgrade_legacy_subscriptions(Utc::now()).await?;
        if upgraded > 0 {
            info!(upgraded, "upgraded legacy subscription rows");
        }
        Ok(upgraded)
    }
}
