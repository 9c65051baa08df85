use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BillingConfig;

use super::adapters::{preferred_method, EntitlementBridge, GatewayError, PaymentGateway};
use super::calendar::next_cycle_end;
use super::failure::{FailureCause, FailureHandler, FailureOutcome};
use super::models::{Occurrence, OccurrenceState, Subscription, SubscriptionStatus};
use super::store::BillingStore;

/// Why an execute-occurrence task was a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    OccurrenceMissing,
    OccurrenceResolved,
    RetryNotDue,
    SubscriptionMissing,
    FailedOccurrenceOutstanding,
    SubscriptionInactive,
    /// A concurrent delivery committed the transition first.
    CommitLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Skipped(SkipReason),
    Charged {
        transaction_id: String,
        new_end_date: DateTime<Utc>,
    },
    RetryScheduled {
        retry_at: DateTime<Utc>,
        grace_period_deadline: DateTime<Utc>,
        notified: bool,
    },
    GraceExpired,
    /// The subscription referenced a plan or entitlement that does not resolve.
    ForceExpired,
}

// key: billing-executor -> charge one occurrence
pub struct PaymentExecutor {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    entitlements: Arc<dyn EntitlementBridge>,
    failures: FailureHandler,
    config: BillingConfig,
}

impl PaymentExecutor {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        entitlements: Arc<dyn EntitlementBridge>,
        failures: FailureHandler,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            entitlements,
            failures,
            config,
        }
    }

    pub async fn execute(&self, occurrence_id: Uuid, now: DateTime<Utc>) -> Result<ExecutionOutcome> {
        let Some(occurrence) = self.store.find_occurrence(occurrence_id).await? else {
            debug!(occurrence = %occurrence_id, "occurrence not found; treating as resolved");
            return Ok(ExecutionOutcome::Skipped(SkipReason::OccurrenceMissing));
        };
        if occurrence.state == OccurrenceState::Charged && !occurrence.entitlement_synced {
            self.resync_entitlement(&occurrence, now).await?;
            return Ok(ExecutionOutcome::Skipped(SkipReason::OccurrenceResolved));
        }
        if !occurrence.state.is_open() {
            debug!(
                occurrence = %occurrence.id,
                state = %occurrence.state,
                "occurrence already resolved"
            );
            return Ok(ExecutionOutcome::Skipped(SkipReason::OccurrenceResolved));
        }
        if !occurrence.is_due(now) {
            return Ok(ExecutionOutcome::Skipped(SkipReason::RetryNotDue));
        }

        let Some(subscription) = self.store.find_subscription(occurrence.subscription_id).await?
        else {
            warn!(
                occurrence = %occurrence.id,
                subscription = %occurrence.subscription_id,
                "occurrence references a missing subscription"
            );
            return Ok(ExecutionOutcome::Skipped(SkipReason::SubscriptionMissing));
        };

        if !self.references_resolve(&subscription).await? {
            return self.force_expire(&subscription, now).await;
        }

        if self
            .store
            .has_other_failed_occurrence(subscription.id, occurrence.id)
            .await?
        {
            debug!(
                subscription = %subscription.id,
                occurrence = %occurrence.id,
                "earlier failed occurrence outstanding; deferring"
            );
            return Ok(ExecutionOutcome::Skipped(
                SkipReason::FailedOccurrenceOutstanding,
            ));
        }

        if subscription.status != SubscriptionStatus::Active {
            debug!(
                subscription = %subscription.id,
                status = %subscription.status,
                "subscription not active; skipping charge"
            );
            return Ok(ExecutionOutcome::Skipped(SkipReason::SubscriptionInactive));
        }

        match self.attempt_charge(&subscription, &occurrence).await {
            Ok(transaction_id) => self.settle(&subscription, &occurrence, transaction_id, now).await,
            Err(cause) => {
                let outcome = self
                    .failures
                    .handle(&subscription, &occurrence, &cause, now)
                    .await?;
                Ok(match outcome {
                    FailureOutcome::RetryScheduled {
                        retry_at,
                        grace_period_deadline,
                        notified,
                    } => ExecutionOutcome::RetryScheduled {
                        retry_at,
                        grace_period_deadline,
                        notified,
                    },
                    FailureOutcome::GraceExpired => ExecutionOutcome::GraceExpired,
                    FailureOutcome::AlreadyResolved => {
                        ExecutionOutcome::Skipped(SkipReason::CommitLost)
                    }
                })
            }
        }
    }

    async fn references_resolve(&self, subscription: &Subscription) -> Result<bool> {
        if subscription.entitlement_code.trim().is_empty() {
            return Ok(false);
        }
        Ok(self.store.find_plan(subscription.plan_id).await?.is_some())
    }

    async fn force_expire(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome> {
        error!(
            subscription = %subscription.id,
            plan = %subscription.plan_id,
            entitlement = %subscription.entitlement_code,
            "subscription references an unresolvable plan or entitlement; forcing expiry"
        );
        let expired = self
            .store
            .expire_subscription(
                subscription.id,
                &[
                    SubscriptionStatus::None,
                    SubscriptionStatus::Active,
                    SubscriptionStatus::PaymentFailed,
                    SubscriptionStatus::CancellationRequested,
                ],
                None,
                now,
            )
            .await?;
        if expired {
            Ok(ExecutionOutcome::ForceExpired)
        } else {
            Ok(ExecutionOutcome::Skipped(SkipReason::SubscriptionInactive))
        }
    }

    async fn attempt_charge(
        &self,
        subscription: &Subscription,
        occurrence: &Occurrence,
    ) -> Result<String, FailureCause> {
        let methods = match self.gateway.list_payment_methods(&subscription.payer_key).await {
            Ok(methods) => methods,
            Err(err) => {
                warn!(
                    ?err,
                    subscription = %subscription.id,
                    "failed to list saved payment methods"
                );
                return Err(err.into());
            }
        };
        let Some(method) = preferred_method(&methods) else {
            return Err(FailureCause::NoPaymentMethod);
        };

        let charge = self.gateway.charge(
            &subscription.payer_key,
            &method.reference,
            occurrence.amount_cents,
            &occurrence.currency,
        );
        let result = match time::timeout(self.config.gateway_timeout, charge).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        };

        match result {
            Ok(Some(transaction_id)) => Ok(transaction_id),
            Ok(None) => Err(FailureCause::MissingTransactionId),
            Err(err) => Err(err.into()),
        }
    }

    async fn settle(
        &self,
        subscription: &Subscription,
        occurrence: &Occurrence,
        transaction_id: String,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome> {
        let new_end = next_cycle_end(
            subscription.anchor_day(),
            subscription.billing_cycle,
            subscription.original_end_date,
        );

        let committed = self
            .store
            .record_successful_charge(occurrence.id, &transaction_id, subscription.id, new_end, now)
            .await?;
        if !committed {
            // The gateway took the money but another delivery already settled
            // this occurrence; surface loudly for reconciliation.
            error!(
                subscription = %subscription.id,
                occurrence = %occurrence.id,
                transaction = %transaction_id,
                "charge succeeded but occurrence was no longer open"
            );
            return Ok(ExecutionOutcome::Skipped(SkipReason::CommitLost));
        }

        info!(
            subscription = %subscription.id,
            occurrence = %occurrence.id,
            transaction = %transaction_id,
            new_end_date = %new_end,
            "renewal charged"
        );

        self.extend_entitlement(subscription, occurrence.id, new_end, now)
            .await?;

        Ok(ExecutionOutcome::Charged {
            transaction_id,
            new_end_date: new_end,
        })
    }

    /// Applies the entitlement extension for a committed charge and flags it.
    /// A bridge failure is returned so the task is redelivered.
    async fn extend_entitlement(
        &self,
        subscription: &Subscription,
        occurrence_id: Uuid,
        end_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Err(err) = self
            .entitlements
            .extend_expiry(&subscription.entitlement_code, end_date)
            .await
        {
            error!(
                ?err,
                subscription = %subscription.id,
                entitlement = %subscription.entitlement_code,
                "failed to extend entitlement after renewal"
            );
            return Err(err).with_context(|| {
                format!("entitlement extension pending for occurrence {occurrence_id}")
            });
        }
        self.store.mark_entitlement_synced(occurrence_id, now).await?;
        Ok(())
    }

    /// Redelivery of a charge whose entitlement extension never landed. Only
    /// the subscription's latest settled charge outside a grace window is
    /// re-applied; older ones were superseded and are just flagged.
    async fn resync_entitlement(&self, occurrence: &Occurrence, now: DateTime<Utc>) -> Result<()> {
        let Some(subscription) = self.store.find_subscription(occurrence.subscription_id).await?
        else {
            return Ok(());
        };

        let latest_charge = self
            .store
            .list_occurrences(subscription.id)
            .await?
            .into_iter()
            .filter(|candidate| candidate.state == OccurrenceState::Charged)
            .map(|candidate| (candidate.scheduled_at, candidate.id))
            .max();
        let renews_current_cycle = matches!(
            subscription.status,
            SubscriptionStatus::Active | SubscriptionStatus::CancellationRequested
        ) && subscription.end_date == subscription.original_end_date
            && latest_charge.map(|(_, id)| id) == Some(occurrence.id);

        if !renews_current_cycle {
            self.store.mark_entitlement_synced(occurrence.id, now).await?;
            return Ok(());
        }

        info!(
            subscription = %subscription.id,
            occurrence = %occurrence.id,
            end_date = %subscription.end_date,
            "re-applying entitlement extension for settled charge"
        );
        self.extend_entitlement(&subscription, occurrence.id, subscription.end_date, now)
            .await
    }
}
