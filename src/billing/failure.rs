use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::config::BillingConfig;

use super::adapters::{EntitlementBridge, GatewayError, NotificationBridge, PaymentFailedNotice};
use super::models::{Occurrence, OccurrenceState, Subscription, SubscriptionStatus};
use super::store::BillingStore;

/// Why a charge did not produce a transaction id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    NoPaymentMethod,
    Timeout,
    Declined(String),
    Transport(String),
    MissingTransactionId,
}

impl From<GatewayError> for FailureCause {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Timeout => FailureCause::Timeout,
            GatewayError::Declined(reason) => FailureCause::Declined(reason),
            GatewayError::Transport(reason) => FailureCause::Transport(reason),
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::NoPaymentMethod => f.write_str("no saved payment method"),
            FailureCause::Timeout => f.write_str("gateway timeout"),
            FailureCause::Declined(reason) => write!(f, "declined: {reason}"),
            FailureCause::Transport(reason) => write!(f, "transport: {reason}"),
            FailureCause::MissingTransactionId => f.write_str("no transaction id returned"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The occurrence is FAILED and will be retried at `retry_at`.
    RetryScheduled {
        retry_at: DateTime<Utc>,
        grace_period_deadline: DateTime<Utc>,
        notified: bool,
    },
    /// The grace deadline had passed; the subscription is EXPIRED.
    GraceExpired,
    /// Another delivery already moved the records on.
    AlreadyResolved,
}

/// Retry time for a failed occurrence. Anchored to the original schedule so
/// repeated checks never move it.
pub fn retry_due_at(occurrence: &Occurrence, config: &BillingConfig) -> DateTime<Utc> {
    occurrence.scheduled_at + config.retry_offset
}

/// When the occurrence is next due after a failure at `now`. Before the
/// scheduled retry has run this is the retry time; once it has been
/// attempted, the only check left is the one at the grace deadline.
pub fn next_due_after_failure(
    occurrence: &Occurrence,
    deadline: DateTime<Utc>,
    config: &BillingConfig,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let retry_at = retry_due_at(occurrence, config);
    let retry_attempted = occurrence.state == OccurrenceState::Failed && now >= retry_at;
    if retry_attempted {
        deadline.max(retry_at)
    } else {
        retry_at
    }
}

/// Grace deadline established on a subscription's first failure in a cycle.
pub fn grace_deadline_for(subscription: &Subscription, config: &BillingConfig) -> DateTime<Utc> {
    subscription.original_end_date + config.grace_window
}

// key: billing-failure -> retry vs grace expiry
pub struct FailureHandler {
    store: Arc<dyn BillingStore>,
    entitlements: Arc<dyn EntitlementBridge>,
    notifications: Arc<dyn NotificationBridge>,
    config: BillingConfig,
}

impl FailureHandler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        entitlements: Arc<dyn EntitlementBridge>,
        notifications: Arc<dyn NotificationBridge>,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            entitlements,
            notifications,
            config,
        }
    }

    pub async fn handle(
        &self,
        subscription: &Subscription,
        occurrence: &Occurrence,
        cause: &FailureCause,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        let grace_elapsed = occurrence.state == OccurrenceState::Failed
            && occurrence
                .grace_period_deadline
                .map_or(false, |deadline| now > deadline);

        if grace_elapsed {
            return self.expire_after_grace(subscription, occurrence, cause, now).await;
        }

        let deadline = occurrence
            .grace_period_deadline
            .unwrap_or_else(|| grace_deadline_for(subscription, &self.config));
        let retry_at = next_due_after_failure(occurrence, deadline, &self.config, now);
        if !self
            .store
            .mark_occurrence_failed(occurrence.id, retry_at, now)
            .await?
        {
            return Ok(FailureOutcome::AlreadyResolved);
        }

        if let Some(deadline) = occurrence.grace_period_deadline {
            info!(
                subscription = %subscription.id,
                occurrence = %occurrence.id,
                %retry_at,
                %deadline,
                %cause,
                "charge failed inside grace window"
            );
            return Ok(FailureOutcome::RetryScheduled {
                retry_at,
                grace_period_deadline: deadline,
                notified: false,
            });
        }

        let established = self
            .store
            .establish_grace_period(occurrence.id, subscription.id, deadline, now)
            .await?;

        info!(
            subscription = %subscription.id,
            occurrence = %occurrence.id,
            %retry_at,
            %deadline,
            %cause,
            established,
            "charge failed; grace window opened"
        );

        if established {
            self.notify_payment_failed(subscription, deadline).await;
        }

        Ok(FailureOutcome::RetryScheduled {
            retry_at,
            grace_period_deadline: deadline,
            notified: established,
        })
    }

    async fn expire_after_grace(
        &self,
        subscription: &Subscription,
        occurrence: &Occurrence,
        cause: &FailureCause,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        let expired = self
            .store
            .expire_subscription(
                subscription.id,
                &[
                    SubscriptionStatus::Active,
                    SubscriptionStatus::CancellationRequested,
                ],
                None,
                now,
            )
            .await?;

        if !expired {
            return Ok(FailureOutcome::AlreadyResolved);
        }

        warn!(
            subscription = %subscription.id,
            occurrence = %occurrence.id,
            %cause,
            "grace window elapsed; subscription expired"
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
                "failed to expire entitlement after grace window"
            );
        }

        Ok(FailureOutcome::GraceExpired)
    }

    async fn notify_payment_failed(&self, subscription: &Subscription, deadline: DateTime<Utc>) {
        let notice = PaymentFailedNotice {
            recipient: subscription.contact_email.clone(),
            entitlement_code: subscription.entitlement_code.clone(),
            new_end_date: deadline,
            locale: subscription.locale.clone(),
        };
        if let Err(err) = self.notifications.send_payment_failed(&notice).await {
            warn!(
                ?err,
                subscription = %subscription.id,
                "payment failed notification could not be delivered"
            );
        }
    }
}
