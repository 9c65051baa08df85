#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use billing_engine::billing::{
    BillingCycle, BillingEngine, BillingPlan, BillingStore, BridgeError, EntitlementBridge,
    GatewayError, InMemoryBillingStore, NotificationBridge, Occurrence, OccurrenceState,
    PaymentFailedNotice, PaymentGateway, PaymentMethod, Subscription, SubscriptionStatus,
};
use billing_engine::billing::models::CURRENT_SCHEMA_VERSION;
use billing_engine::job_queue::{Task, TaskQueue};
use billing_engine::BillingConfig;
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

pub fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeScript {
    Approve,
    Decline,
    NoMethods,
    Hang,
    Blank,
}

pub struct ScriptedGateway {
    script: Mutex<ChargeScript>,
    charges: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new(script: ChargeScript) -> Self {
        Self {
            script: Mutex::new(script),
            charges: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, script: ChargeScript) {
        *self.script.lock().unwrap() = script;
    }

    pub fn charge_calls(&self) -> usize {
        self.charges.load(Ordering::SeqCst)
    }

    fn current(&self) -> ChargeScript {
        *self.script.lock().unwrap()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn list_payment_methods(
        &self,
        _payer_key: &str,
    ) -> Result<Vec<PaymentMethod>, GatewayError> {
        if self.current() == ChargeScript::NoMethods {
            return Ok(Vec::new());
        }
        Ok(vec![PaymentMethod {
            reference: "pm_card".to_string(),
            is_default: true,
        }])
    }

    async fn charge(
        &self,
        _payer_key: &str,
        _method_ref: &str,
        _amount_cents: i64,
        _currency: &str,
    ) -> Result<Option<String>, GatewayError> {
        let call = self.charges.fetch_add(1, Ordering::SeqCst) + 1;
        match self.current() {
            ChargeScript::Approve => Ok(Some(format!("txn_{call}"))),
            ChargeScript::Decline => Err(GatewayError::Declined("card_declined".into())),
            ChargeScript::NoMethods => Err(GatewayError::Declined("no method".into())),
            ChargeScript::Blank => Ok(None),
            ChargeScript::Hang => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Some("txn_late".into()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntitlementCall {
    Extend(String, DateTime<Utc>),
    ExpireNow(String),
}

#[derive(Default)]
pub struct RecordingEntitlements {
    calls: Mutex<Vec<EntitlementCall>>,
    failing_extends: AtomicUsize,
}

impl RecordingEntitlements {
    /// Successful calls only.
    pub fn calls(&self) -> Vec<EntitlementCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Rejects the next `count` extend calls with a 503.
    pub fn fail_next_extends(&self, count: usize) {
        self.failing_extends.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl EntitlementBridge for RecordingEntitlements {
    async fn extend_expiry(
        &self,
        entitlement_code: &str,
        new_date: DateTime<Utc>,
    ) -> Result<(), BridgeError> {
        let failing = self
            .failing_extends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BridgeError::Rejected(503));
        }
        self.calls
            .lock()
            .unwrap()
            .push(EntitlementCall::Extend(entitlement_code.to_string(), new_date));
        Ok(())
    }

    async fn set_expiry_now(&self, entitlement_code: &str) -> Result<(), BridgeError> {
        self.calls
            .lock()
            .unwrap()
            .push(EntitlementCall::ExpireNow(entitlement_code.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifications {
    sent: Mutex<Vec<PaymentFailedNotice>>,
    reject: AtomicBool,
}

impl RecordingNotifications {
    pub fn sent(&self) -> Vec<PaymentFailedNotice> {
        self.sent.lock().unwrap().clone()
    }

    pub fn reject_all(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl NotificationBridge for RecordingNotifications {
    async fn send_payment_failed(&self, notice: &PaymentFailedNotice) -> Result<(), BridgeError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(BridgeError::Rejected(503));
        }
        self.sent.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingQueue {
    tasks: Mutex<Vec<Task>>,
    fail: AtomicBool,
}

impl RecordingQueue {
    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.lock().unwrap().clone()
    }

    pub fn fail_enqueues(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, task: &Task) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("queue unavailable"));
        }
        self.tasks.lock().unwrap().push(task.clone());
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<InMemoryBillingStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub entitlements: Arc<RecordingEntitlements>,
    pub notifications: Arc<RecordingNotifications>,
    pub queue: Arc<RecordingQueue>,
    pub engine: Arc<BillingEngine>,
    pub config: BillingConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(BillingConfig {
            gateway_timeout: Duration::from_millis(50),
            ..BillingConfig::default()
        })
    }

    pub fn with_config(config: BillingConfig) -> Self {
        let store = Arc::new(InMemoryBillingStore::new());
        let gateway = Arc::new(ScriptedGateway::new(ChargeScript::Approve));
        let entitlements = Arc::new(RecordingEntitlements::default());
        let notifications = Arc::new(RecordingNotifications::default());
        let queue = Arc::new(RecordingQueue::default());
        let engine = Arc::new(BillingEngine::new(
            store.clone(),
            queue.clone(),
            gateway.clone(),
            entitlements.clone(),
            notifications.clone(),
            config.clone(),
        ));
        Self {
            store,
            gateway,
            entitlements,
            notifications,
            queue,
            engine,
            config,
        }
    }

    pub async fn seed_plan(&self, cycle: BillingCycle, amount_cents: i64) -> BillingPlan {
        let plan = BillingPlan {
            id: Uuid::new_v4(),
            code: format!("plan-{}", Uuid::new_v4().simple()),
            name: "Pro".to_string(),
            billing_cycle: cycle,
            currency: "USD".to_string(),
            amount_cents,
            active: true,
        };
        self.store.upsert_plan(&plan).await.unwrap();
        plan
    }

    pub async fn seed_subscription(
        &self,
        plan: &BillingPlan,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Subscription {
        self.seed_subscription_with(plan, start, end, SubscriptionStatus::Active)
            .await
    }

    pub async fn seed_subscription_with(
        &self,
        plan: &BillingPlan,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        status: SubscriptionStatus,
    ) -> Subscription {
        let subscription = Subscription {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            plan_id: plan.id,
            status,
            billing_cycle: plan.billing_cycle,
            start_date: start,
            end_date: end,
            original_end_date: end,
            original_price: plan.amount_cents / 2,
            entitlement_code: "LIC-1".to_string(),
            payer_key: "cus_123".to_string(),
            contact_email: "owner@example.com".to_string(),
            locale: "de".to_string(),
            schema_version: CURRENT_SCHEMA_VERSION,
            created_at: start,
            updated_at: start,
        };
        self.store.insert_subscription(&subscription).await.unwrap();
        subscription
    }

    pub async fn seed_occurrence(
        &self,
        subscription: &Subscription,
        scheduled_at: DateTime<Utc>,
    ) -> Occurrence {
        let occurrence = Occurrence::pending(subscription.id, scheduled_at, 1_900, "USD", scheduled_at);
        self.store
            .insert_occurrences(std::slice::from_ref(&occurrence))
            .await
            .unwrap();
        occurrence
    }

    pub async fn subscription(&self, id: Uuid) -> Subscription {
        self.store.find_subscription(id).await.unwrap().unwrap()
    }

    pub async fn occurrence(&self, id: Uuid) -> Occurrence {
        self.store.find_occurrence(id).await.unwrap().unwrap()
    }

    pub async fn failed_count(&self, subscription_id: Uuid) -> usize {
        self.store
            .list_occurrences(subscription_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|occurrence| occurrence.state == OccurrenceState::Failed)
            .count()
    }
}
