use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::{
    BillingPlan, DueOccurrence, Occurrence, OccurrenceState, Subscription, SubscriptionStatus,
    CURRENT_SCHEMA_VERSION,
};
use super::store::BillingStore;

// key: billing-store-memory -> process-local store
/// Mirrors the conditional semantics of `PgBillingStore` under a single lock,
/// including the unique (subscription, scheduled_at) pair and the single
/// FAILED occurrence per subscription.
#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    plans: HashMap<Uuid, BillingPlan>,
    subscriptions: HashMap<Uuid, Subscription>,
    occurrences: HashMap<Uuid, Occurrence>,
}

impl MemoryState {
    fn occurrences_of(&self, subscription_id: Uuid) -> impl Iterator<Item = &Occurrence> {
        self.occurrences
            .values()
            .filter(move |occurrence| occurrence.subscription_id == subscription_id)
    }

    fn failed_elsewhere(&self, subscription_id: Uuid, excluding: Uuid) -> bool {
        self.occurrences_of(subscription_id)
            .any(|occurrence| occurrence.state == OccurrenceState::Failed && occurrence.id != excluding)
    }
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn upsert_plan(&self, plan: &BillingPlan) -> Result<()> {
        let mut state = self.state.lock().await;
        state.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn find_plan(&self, plan_id: Uuid) -> Result<Option<BillingPlan>> {
        let state = self.state.lock().await;
        Ok(state.plans.get(&plan_id).cloned())
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.subscriptions.contains_key(&subscription.id) {
            return Err(anyhow!("subscription {} already exists", subscription.id));
        }
        state
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn find_subscription(&self, subscription_id: Uuid) -> Result<Option<Subscription>> {
        let state = self.state.lock().await;
        Ok(state.subscriptions.get(&subscription_id).cloned())
    }

    async fn find_occurrence(&self, occurrence_id: Uuid) -> Result<Option<Occurrence>> {
        let state = self.state.lock().await;
        Ok(state.occurrences.get(&occurrence_id).cloned())
    }

    async fn list_occurrences(&self, subscription_id: Uuid) -> Result<Vec<Occurrence>> {
        let state = self.state.lock().await;
        let mut occurrences: Vec<Occurrence> = state.occurrences_of(subscription_id).cloned().collect();
        occurrences.sort_by_key(|occurrence| occurrence.scheduled_at);
        Ok(occurrences)
    }

    async fn has_other_failed_occurrence(
        &self,
        subscription_id: Uuid,
        excluding: Uuid,
    ) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.failed_elsewhere(subscription_id, excluding))
    }

    async fn has_open_occurrence(&self, subscription_id: Uuid) -> Result<bool> {
        let state = self.state.lock().await;
        let open = state
            .occurrences_of(subscription_id)
            .any(|occurrence| occurrence.state.is_open());
        Ok(open)
    }

    async fn due_occurrences(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<DueOccurrence>> {
        let state = self.state.lock().await;
        let mut due: Vec<DueOccurrence> = state
            .occurrences
            .values()
            .filter(|occurrence| occurrence.is_due(now))
            .filter(|occurrence| {
                state
                    .subscriptions
                    .get(&occurrence.subscription_id)
                    .map_or(false, |subscription| {
                        subscription.status == SubscriptionStatus::Active
                    })
            })
            .map(|occurrence| DueOccurrence {
                occurrence_id: occurrence.id,
                subscription_id: occurrence.subscription_id,
                state: occurrence.state,
                scheduled_at: occurrence.scheduled_at,
            })
            .collect();

        due.sort_by_key(|row| {
            let rank = if row.state == OccurrenceState::Failed { 0 } else { 1 };
            (rank, row.scheduled_at)
        });
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn subscriptions_due_for_expiry(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>> {
        let state = self.state.lock().await;
        let mut due: Vec<&Subscription> = state
            .subscriptions
            .values()
            .filter(|subscription| {
                matches!(
                    subscription.status,
                    SubscriptionStatus::Active | SubscriptionStatus::CancellationRequested
                ) && subscription.end_date <= now
            })
            .collect();
        due.sort_by_key(|subscription| subscription.end_date);
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|subscription| subscription.id)
            .collect())
    }

    async fn subscriptions_missing_occurrences(&self, limit: i64) -> Result<Vec<Uuid>> {
        let state = self.state.lock().await;
        let mut missing: Vec<&Subscription> = state
            .subscriptions
            .values()
            .filter(|subscription| subscription.status == SubscriptionStatus::Active)
            .filter(|subscription| {
                !state
                    .occurrences_of(subscription.id)
                    .any(|occurrence| occurrence.state.is_open())
            })
            .collect();
        missing.sort_by_key(|subscription| subscription.end_date);
        Ok(missing
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|subscription| subscription.id)
            .collect())
    }

    async fn insert_occurrences(&self, occurrences: &[Occurrence]) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for occurrence in occurrences {
            let duplicate = state.occurrences_of(occurrence.subscription_id).any(|existing| {
                existing.scheduled_at == occurrence.scheduled_at
            });
            if duplicate || state.occurrences.contains_key(&occurrence.id) {
                continue;
            }
            state.occurrences.insert(occurrence.id, occurrence.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn record_successful_charge(
        &self,
        occurrence_id: Uuid,
        transaction_id: &str,
        subscription_id: Uuid,
        new_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(occurrence) = state.occurrences.get_mut(&occurrence_id) else {
            return Ok(false);
        };
        if !occurrence.state.is_open() {
            return Ok(false);
        }
        occurrence.state = OccurrenceState::Charged;
        occurrence.transaction_id = Some(transaction_id.to_string());
        occurrence.retry_at = None;
        occurrence.attempts += 1;
        occurrence.updated_at = now;

        if let Some(subscription) = state.subscriptions.get_mut(&subscription_id) {
            subscription.end_date = new_end;
            subscription.original_end_date = new_end;
            subscription.updated_at = now;
        }
        Ok(true)
    }

    async fn mark_entitlement_synced(
        &self,
        occurrence_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(occurrence) = state.occurrences.get_mut(&occurrence_id) else {
            return Ok(false);
        };
        if occurrence.state != OccurrenceState::Charged || occurrence.entitlement_synced {
            return Ok(false);
        }
        occurrence.entitlement_synced = true;
        occurrence.updated_at = now;
        Ok(true)
    }

    async fn mark_occurrence_failed(
        &self,
        occurrence_id: Uuid,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(current) = state.occurrences.get(&occurrence_id) else {
            return Ok(false);
        };
        if !current.state.is_open() {
            return Ok(false);
        }
        let subscription_id = current.subscription_id;
        if state.failed_elsewhere(subscription_id, occurrence_id) {
            return Err(anyhow!(
                "subscription {subscription_id} already has a failed occurrence"
            ));
        }

        if let Some(occurrence) = state.occurrences.get_mut(&occurrence_id) {
            occurrence.state = OccurrenceState::Failed;
            occurrence.retry_at = Some(retry_at);
            occurrence.attempts += 1;
            occurrence.updated_at = now;
        }
        Ok(true)
    }

    async fn establish_grace_period(
        &self,
        occurrence_id: Uuid,
        subscription_id: Uuid,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(occurrence) = state.occurrences.get_mut(&occurrence_id) else {
            return Ok(false);
        };
        if occurrence.state != OccurrenceState::Failed || occurrence.grace_period_deadline.is_some()
        {
            return Ok(false);
        }
        occurrence.grace_period_deadline = Some(deadline);
        occurrence.updated_at = now;

        if let Some(subscription) = state.subscriptions.get_mut(&subscription_id) {
            if subscription.status == SubscriptionStatus::Active {
                subscription.end_date = deadline;
                subscription.updated_at = now;
            }
        }
        Ok(true)
    }

    async fn expire_subscription(
        &self,
        subscription_id: Uuid,
        from: &[SubscriptionStatus],
        ended_by: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(subscription) = state.subscriptions.get_mut(&subscription_id) else {
            return Ok(false);
        };
        if !from.contains(&subscription.status) {
            return Ok(false);
        }
        if let Some(ended_by) = ended_by {
            if subscription.end_date > ended_by {
                return Ok(false);
            }
        }
        subscription.status = SubscriptionStatus::Expired;
        subscription.updated_at = now;

        for occurrence in state.occurrences.values_mut() {
            if occurrence.subscription_id == subscription_id && occurrence.state.is_open() {
                occurrence.state = OccurrenceState::Expired;
                occurrence.retry_at = None;
                occurrence.updated_at = now;
            }
        }
        Ok(true)
    }

    async fn transition_subscription_status(
        &self,
        subscription_id: Uuid,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.subscriptions.get_mut(&subscription_id) {
            Some(subscription) if subscription.status == from => {
                subscription.status = to;
                subscription.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_next_pending_occurrence(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>> {
        let mut state = self.state.lock().await;
        let next = state
            .occurrences_of(subscription_id)
            .filter(|occurrence| occurrence.state == OccurrenceState::Pending)
            .min_by_key(|occurrence| occurrence.scheduled_at)
            .map(|occurrence| occurrence.id);

        if let Some(id) = next {
            if let Some(occurrence) = state.occurrences.get_mut(&id) {
                occurrence.state = OccurrenceState::Cancelled;
                occurrence.updated_at = now;
            }
        }
        Ok(next)
    }

    async fn restore_cancelled_occurrence(
        &self,
        subscription_id: Uuid,
        after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>> {
        let mut state = self.state.lock().await;
        let candidate = state
            .occurrences_of(subscription_id)
            .filter(|occurrence| {
                occurrence.state == OccurrenceState::Cancelled && occurrence.scheduled_at > after
            })
            .min_by_key(|occurrence| occurrence.scheduled_at)
            .map(|occurrence| occurrence.id);

        if let Some(id) = candidate {
            if let Some(occurrence) = state.occurrences.get_mut(&id) {
                occurrence.state = OccurrenceState::Pending;
                occurrence.updated_at = now;
            }
        }
        Ok(candidate)
    }

    async fn upgrade_legacy_subscriptions(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut upgraded = 0;
        for subscription in state.subscriptions.values_mut() {
            if subscription.schema_version < CURRENT_SCHEMA_VERSION {
                subscription.schema_version = CURRENT_SCHEMA_VERSION;
                subscription.updated_at = now;
                upgraded += 1;
            }
        }
        Ok(upgraded)
    }
}
