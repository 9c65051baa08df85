use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Record shape written by the current code. Rows below this version are
/// upgraded once at startup by `BillingStore::upgrade_legacy_subscriptions`.
pub const CURRENT_SCHEMA_VERSION: i16 = 2;

// key: billing-models -> subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    None,
    Active,
    PaymentFailed,
    CancellationRequested,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "NONE",
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::PaymentFailed => "PAYMENT_FAILED",
            SubscriptionStatus::CancellationRequested => "CANCELLATION_REQUESTED",
            SubscriptionStatus::Cancelled => "CANCELLED",
            SubscriptionStatus::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired
        )
    }
}

impl FromStr for SubscriptionStatus {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "NONE" => Ok(SubscriptionStatus::None),
            "ACTIVE" => Ok(SubscriptionStatus::Active),
            "PAYMENT_FAILED" => Ok(SubscriptionStatus::PaymentFailed),
            "CANCELLATION_REQUESTED" => Ok(SubscriptionStatus::CancellationRequested),
            "CANCELLED" => Ok(SubscriptionStatus::Cancelled),
            "EXPIRED" => Ok(SubscriptionStatus::Expired),
            other => Err(anyhow!("unknown subscription status `{other}`")),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "MONTHLY",
            BillingCycle::Yearly => "YEARLY",
        }
    }

    pub fn months(&self) -> u32 {
        match self {
            BillingCycle::Monthly => 1,
            BillingCycle::Yearly => 12,
        }
    }
}

impl FromStr for BillingCycle {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "MONTHLY" | "monthly" => Ok(BillingCycle::Monthly),
            "YEARLY" | "yearly" | "annual" => Ok(BillingCycle::Yearly),
            other => Err(anyhow!("unknown billing cycle `{other}`")),
        }
    }
}

impl fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// key: billing-models -> occurrence state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OccurrenceState {
    Pending,
    Charged,
    Failed,
    Cancelled,
    Expired,
}

impl OccurrenceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OccurrenceState::Pending => "PENDING",
            OccurrenceState::Charged => "CHARGED",
            OccurrenceState::Failed => "FAILED",
            OccurrenceState::Cancelled => "CANCELLED",
            OccurrenceState::Expired => "EXPIRED",
        }
    }

    /// PENDING and FAILED occurrences still expect a charge attempt.
    pub fn is_open(&self) -> bool {
        matches!(self, OccurrenceState::Pending | OccurrenceState::Failed)
    }
}

impl FromStr for OccurrenceState {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PENDING" => Ok(OccurrenceState::Pending),
            "CHARGED" => Ok(OccurrenceState::Charged),
            "FAILED" => Ok(OccurrenceState::Failed),
            "CANCELLED" => Ok(OccurrenceState::Cancelled),
            "EXPIRED" => Ok(OccurrenceState::Expired),
            other => Err(anyhow!("unknown occurrence state `{other}`")),
        }
    }
}

impl fmt::Display for OccurrenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// key: billing-models -> plan catalog entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingPlan {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub billing_cycle: BillingCycle,
    pub currency: String,
    /// Full recurring price; renewals are always charged this amount.
    pub amount_cents: i64,
    pub active: bool,
}

// key: billing-models -> subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub billing_cycle: BillingCycle,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub original_end_date: DateTime<Utc>,
    pub original_price: i64,
    pub entitlement_code: String,
    pub payer_key: String,
    pub contact_email: String,
    pub locale: String,
    pub schema_version: i16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Day-of-month every renewal is anchored to.
    pub fn anchor_day(&self) -> u32 {
        use chrono::Datelike;
        self.start_date.day()
    }

    /// Status as reported to readers. The stored status stays ACTIVE during a
    /// grace period so retries keep flowing; an outstanding FAILED occurrence
    /// surfaces as PAYMENT_FAILED here.
    pub fn display_status(&self, has_failed_occurrence: bool) -> SubscriptionStatus {
        if self.status == SubscriptionStatus::Active && has_failed_occurrence {
            SubscriptionStatus::PaymentFailed
        } else {
            self.status
        }
    }
}

// key: billing-models -> scheduled charge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub amount_cents: i64,
    pub currency: String,
    pub state: OccurrenceState,
    pub grace_period_deadline: Option<DateTime<Utc>>,
    pub retry_at: Option<DateTime<Utc>>,
    pub transaction_id: Option<String>,
    /// Set once the entitlement extension for this charge has been applied.
    pub entitlement_synced: bool,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Occurrence {
    pub fn pending(
        subscription_id: Uuid,
        scheduled_at: DateTime<Utc>,
        amount_cents: i64,
        currency: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id,
            scheduled_at,
            amount_cents,
            currency: currency.into(),
            state: OccurrenceState::Pending,
            grace_period_deadline: None,
            retry_at: None,
            transaction_id: None,
            entitlement_synced: false,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a charge attempt is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            OccurrenceState::Pending => self.scheduled_at <= now,
            OccurrenceState::Failed => self.retry_at.map_or(true, |retry_at| retry_at <= now),
            _ => false,
        }
    }
}

/// Row produced by the due-for-charge scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueOccurrence {
    pub occurrence_id: Uuid,
    pub subscription_id: Uuid,
    pub state: OccurrenceState,
    pub scheduled_at: DateTime<Utc>,
}
