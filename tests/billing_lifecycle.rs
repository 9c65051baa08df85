mod common;

use billing_engine::billing::models::CURRENT_SCHEMA_VERSION;
use billing_engine::billing::{
    ActivationRequest, BillingCycle, BillingStore, CancellationOutcome, DispatchSummary,
    ExecutionOutcome, OccurrenceState, ReapOutcome, SkipReason, SubscriptionStatus,
};
use billing_engine::job_queue::Task;
use chrono::{Duration, TimeZone, Utc};
use common::{at, ChargeScript, EntitlementCall, Harness};
use uuid::Uuid;

// key: billing-reaper-tests -> expiry at end of cycle
#[tokio::test]
async fn reaper_expires_due_subscription_exactly_once() {
    let harness = Harness::new();
    let plan = harness.seed_plan(BillingCycle::Monthly, 1_900).await;
    let subscription = harness
        .seed_subscription(&plan, at(2025, 2, 1), at(2025, 3, 1))
        .await;
    let pending = harness.seed_occurrence(&subscription, at(2025, 4, 1)).await;

    let first = harness
        .engine
        .expire_subscription(subscription.id, at(2025, 3, 2))
        .await
        .unwrap();
    let second = harness
        .engine
        .expire_subscription(subscription.id, at(2025, 3, 2))
        .await
        .unwrap();

    assert_eq!(first, ReapOutcome::Expired);
    assert_eq!(second, ReapOutcome::NotDue);
    assert_eq!(
        harness.subscription(subscription.id).await.status,
        SubscriptionStatus::Expired
    );
    assert_eq!(harness.occurrence(pending.id).await.state, OccurrenceState::Expired);
    assert_eq!(
        harness.entitlements.calls(),
        vec![EntitlementCall::ExpireNow("LIC-1".into())]
    );
    assert!(harness.notifications.sent().is_empty());
}

#[tokio::test]
async fn reaper_leaves_subscription_before_end_date() {
    let harness = Harness::new();
    let plan = harness.seed_plan(BillingCycle::Monthly, 1_900).await;
    let subscription = harness
        .seed_subscription(&plan, at(2025, 2, 1), at(2025, 3, 1))
        .await;

    let outcome = harness
        .engine
        .expire_subscription(subscription.id, at(2025, 2, 20))
        .await
        .unwrap();

    assert_eq!(outcome, ReapOutcome::NotDue);
    assert_eq!(
        harness.subscription(subscription.id).await.status,
        SubscriptionStatus::Active
    );
    assert!(harness.entitlements.calls().is_empty());
}

#[tokio::test]
async fn reaper_reports_unknown_subscription() {
    let harness = Harness::new();
    let outcome = harness
        .engine
        .expire_subscription(Uuid::new_v4(), at(2025, 3, 1))
        .await
        .unwrap();
    assert_eq!(outcome, ReapOutcome::Missing);
}

// key: billing-pregen-tests -> run-ahead window
#[tokio::test]
async fn pregeneration_seeds_twelve_monthly_occurrences_at_full_price() {
    let harness = Harness::new();
    let plan = harness.seed_plan(BillingCycle::Monthly, 1_900).await;
    let subscription = harness
        .seed_subscription(&plan, at(2025, 1, 15), at(2025, 2, 15))
        .await;
    assert_eq!(subscription.original_price, 950);

    let created = harness
        .engine
        .create_pending_occurrences(subscription.id, at(2025, 1, 15))
        .await
        .unwrap();
    assert_eq!(created, 12);

    let occurrences = harness.store.list_occurrences(subscription.id).await.unwrap();
    assert_eq!(occurrences.len(), 12);
    assert_eq!(occurrences[0].scheduled_at, at(2025, 2, 15));
    assert_eq!(occurrences[11].scheduled_at, at(2026, 1, 15));
    assert!(occurrences
        .iter()
        .all(|occurrence| occurrence.amount_cents == 1_900
            && occurrence.currency == "USD"
            && occurrence.state == OccurrenceState::Pending));

    let again = harness
        .engine
        .create_pending_occurrences(subscription.id, at(2025, 1, 16))
        .await
        .unwrap();
    assert_eq!(again, 0);
    assert_eq!(
        harness.store.list_occurrences(subscription.id).await.unwrap().len(),
        12
    );
}

#[tokio::test]
async fn pregeneration_seeds_four_yearly_occurrences() {
    let harness = Harness::new();
    let plan = harness.seed_plan(BillingCycle::Yearly, 19_900).await;
    let subscription = harness
        .seed_subscription(&plan, at(2024, 6, 15), at(2025, 6, 15))
        .await;

    let created = harness
        .engine
        .create_pending_occurrences(subscription.id, at(2024, 6, 15))
        .await
        .unwrap();

    assert_eq!(created, 4);
    let dates: Vec<_> = harness
        .store
        .list_occurrences(subscription.id)
        .await
        .unwrap()
        .into_iter()
        .map(|occurrence| occurrence.scheduled_at)
        .collect();
    assert_eq!(
        dates,
        vec![at(2025, 6, 15), at(2026, 6, 15), at(2027, 6, 15), at(2028, 6, 15)]
    );
}

#[tokio::test]
async fn pregeneration_skips_existing_dates_after_charges_resolve() {
    let harness = Harness::new();
    let plan = harness.seed_plan(BillingCycle::Monthly, 1_900).await;
    let subscription = harness
        .seed_subscription(&plan, at(2025, 1, 15), at(2025, 2, 15))
        .await;
    let charged = harness.seed_occurrence(&subscription, at(2025, 2, 15)).await;
    harness
        .store
        .record_successful_charge(
            charged.id,
            "txn_seed",
            subscription.id,
            at(2025, 2, 15),
            at(2025, 2, 15),
        )
        .await
        .unwrap();

    let created = harness
        .engine
        .create_pending_occurrences(subscription.id, at(2025, 2, 15))
        .await
        .unwrap();

    assert_eq!(created, 11);
    let occurrences = harness.store.list_occurrences(subscription.id).await.unwrap();
    assert_eq!(occurrences.len(), 12);
    assert_eq!(
        occurrences
            .iter()
            .filter(|occurrence| occurrence.scheduled_at == at(2025, 2, 15))
            .count(),
        1
    );
}

#[tokio::test]
async fn pregeneration_ignores_inactive_subscriptions() {
    let harness = Harness::new();
    let plan = harness.seed_plan(BillingCycle::Monthly, 1_900).await;
    let subscription = harness
        .seed_subscription_with(
            &plan,
            at(2025, 1, 15),
            at(2025, 2, 15),
            SubscriptionStatus::CancellationRequested,
        )
        .await;

    let created = harness
        .engine
        .create_pending_occurrences(subscription.id, at(2025, 1, 15))
        .await
        .unwrap();
    assert_eq!(created, 0);
}

// key: billing-scheduler-tests -> dispatch ordering
#[tokio::test]
async fn scheduler_dispatches_failed_occurrences_first() {
    let harness = Harness::new();
    let plan = harness.seed_plan(BillingCycle::Monthly, 1_900).await;

    harness.gateway.set(ChargeScript::Decline);
    let retrying = harness
        .seed_subscription(&plan, at(2025, 2, 1), at(2025, 3, 1))
        .await;
    let failed = harness.seed_occurrence(&retrying, at(2025, 3, 1)).await;
    harness
        .engine
        .execute_occurrence(failed.id, at(2025, 3, 1))
        .await
        .unwrap();

    let later = harness
        .seed_subscription(&plan, at(2025, 2, 3), at(2025, 3, 3))
        .await;
    let later_occurrence = harness.seed_occurrence(&later, at(2025, 3, 3)).await;
    let earlier = harness
        .seed_subscription(&plan, at(2025, 2, 2), at(2025, 3, 2))
        .await;
    let earlier_occurrence = harness.seed_occurrence(&earlier, at(2025, 3, 2)).await;
    let dry = harness
        .seed_subscription(&plan, at(2025, 3, 1), at(2025, 4, 1))
        .await;

    let summary = harness.engine.scheduler().process_tick(at(2025, 3, 7)).await;

    assert_eq!(
        summary,
        DispatchSummary {
            charges_enqueued: 3,
            expiries_enqueued: 2,
            pregenerations_enqueued: 1,
            enqueue_failures: 0,
            scan_failures: 0,
        }
    );
    assert_eq!(
        harness.queue.tasks(),
        vec![
            Task::ExecuteOccurrence {
                occurrence_id: failed.id
            },
            Task::ExecuteOccurrence {
                occurrence_id: earlier_occurrence.id
            },
            Task::ExecuteOccurrence {
                occurrence_id: later_occurrence.id
            },
            Task::ExpireSubscription {
                subscription_id: earlier.id
            },
            Task::ExpireSubscription {
                subscription_id: later.id
            },
            Task::CreatePendingOccurrences {
                subscription_id: dry.id
            },
        ]
    );
}

#[tokio::test]
async fn scheduler_skips_retries_that_are_not_due() {
    let harness = Harness::new();
    harness.gateway.set(ChargeScript::Decline);
    let plan = harness.seed_plan(BillingCycle::Monthly, 1_900).await;
    let subscription = harness
        .seed_subscription(&plan, at(2025, 2, 1), at(2025, 3, 1))
        .await;
    let occurrence = harness.seed_occurrence(&subscription, at(2025, 3, 1)).await;
    harness
        .engine
        .execute_occurrence(occurrence.id, at(2025, 3, 1))
        .await
        .unwrap();

    let before_retry = harness.engine.scheduler().process_tick(at(2025, 3, 4)).await;
    assert_eq!(before_retry.charges_enqueued, 0);
    assert_eq!(before_retry.expiries_enqueued, 0);

    let after_retry = harness.engine.scheduler().process_tick(at(2025, 3, 6)).await;
    assert_eq!(after_retry.charges_enqueued, 1);
}

#[tokio::test]
async fn scheduler_counts_enqueue_failures_and_recovers() {
    let harness = Harness::new();
    let plan = harness.seed_plan(BillingCycle::Monthly, 1_900).await;
    let subscription = harness
        .seed_subscription(&plan, at(2025, 2, 1), at(2025, 3, 1))
        .await;
    harness.seed_occurrence(&subscription, at(2025, 3, 1)).await;

    harness.queue.fail_enqueues(true);
    let failing = harness.engine.scheduler().process_tick(at(2025, 3, 1)).await;
    assert_eq!(failing.charges_enqueued, 0);
    assert_eq!(failing.enqueue_failures, 2);
    assert_eq!(failing.scan_failures, 0);
    assert!(harness.queue.tasks().is_empty());

    harness.queue.fail_enqueues(false);
    let recovered = harness.engine.scheduler().process_tick(at(2025, 3, 1)).await;
    assert_eq!(recovered.charges_enqueued, 1);
    assert_eq!(recovered.expiries_enqueued, 1);
}

#[tokio::test]
async fn dispatch_task_runs_a_scan() {
    let harness = Harness::new();
    let plan = harness.seed_plan(BillingCycle::Monthly, 1_900).await;
    let subscription = harness
        .seed_subscription(&plan, at(2025, 2, 1), at(2025, 3, 1))
        .await;

    harness
        .engine
        .handle_at(&Task::DispatchScan, at(2025, 2, 10))
        .await
        .unwrap();

    assert_eq!(
        harness.queue.tasks(),
        vec![Task::CreatePendingOccurrences {
            subscription_id: subscription.id
        }]
    );

    harness
        .engine
        .handle_at(
            &Task::CreatePendingOccurrences {
                subscription_id: subscription.id,
            },
            at(2025, 2, 10),
        )
        .await
        .unwrap();
    assert_eq!(
        harness.store.list_occurrences(subscription.id).await.unwrap().len(),
        12
    );
}

// key: billing-cancellation-tests -> cancel and rescind
#[tokio::test]
async fn cancellation_cancels_next_renewal_and_expires_at_end_date() {
    let harness = Harness::new();
    let plan = harness.seed_plan(BillingCycle::Monthly, 1_900).await;
    let subscription = harness
        .seed_subscription(&plan, at(2025, 2, 1), at(2025, 3, 1))
        .await;
    let next = harness.seed_occurrence(&subscription, at(2025, 3, 1)).await;
    let after = harness.seed_occurrence(&subscription, at(2025, 4, 1)).await;

    let outcome = harness
        .engine
        .request_cancellation(subscription.id, at(2025, 2, 10))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CancellationOutcome::Applied {
            occurrence_id: Some(next.id)
        }
    );
    assert_eq!(
        harness.subscription(subscription.id).await.status,
        SubscriptionStatus::CancellationRequested
    );
    assert_eq!(harness.occurrence(next.id).await.state, OccurrenceState::Cancelled);
    assert_eq!(harness.occurrence(after.id).await.state, OccurrenceState::Pending);

    let charge = harness
        .engine
        .execute_occurrence(after.id, at(2025, 4, 1))
        .await
        .unwrap();
    assert_eq!(charge, ExecutionOutcome::Skipped(SkipReason::SubscriptionInactive));

    let summary = harness.engine.scheduler().process_tick(at(2025, 3, 1)).await;
    assert_eq!(summary.charges_enqueued, 0);
    assert_eq!(summary.expiries_enqueued, 1);

    let reaped = harness
        .engine
        .expire_subscription(subscription.id, at(2025, 3, 1))
        .await
        .unwrap();
    assert_eq!(reaped, ReapOutcome::Expired);
    assert_eq!(harness.occurrence(next.id).await.state, OccurrenceState::Cancelled);
    assert_eq!(harness.occurrence(after.id).await.state, OccurrenceState::Expired);
    assert_eq!(harness.gateway.charge_calls(), 0);
}

#[tokio::test]
async fn rescinding_restores_the_cancelled_renewal() {
    let harness = Harness::new();
    let plan = harness.seed_plan(BillingCycle::Monthly, 1_900).await;
    let subscription = harness
        .seed_subscription(&plan, at(2025, 2, 1), at(2025, 3, 1))
        .await;
    let next = harness.seed_occurrence(&subscription, at(2025, 3, 1)).await;

    harness
        .engine
        .request_cancellation(subscription.id, at(2025, 2, 10))
        .await
        .unwrap();
    let outcome = harness
        .engine
        .rescind_cancellation(subscription.id, at(2025, 2, 11))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        CancellationOutcome::Applied {
            occurrence_id: Some(next.id)
        }
    );
    assert_eq!(
        harness.subscription(subscription.id).await.status,
        SubscriptionStatus::Active
    );
    assert_eq!(harness.occurrence(next.id).await.state, OccurrenceState::Pending);

    let repeat = harness
        .engine
        .rescind_cancellation(subscription.id, at(2025, 2, 12))
        .await
        .unwrap();
    assert_eq!(repeat, CancellationOutcome::NotApplicable);
}

#[tokio::test]
async fn cancellation_is_refused_while_a_charge_is_failed() {
    let harness = Harness::new();
    harness.gateway.set(ChargeScript::Decline);
    let plan = harness.seed_plan(BillingCycle::Monthly, 1_900).await;
    let subscription = harness
        .seed_subscription(&plan, at(2025, 2, 1), at(2025, 3, 1))
        .await;
    let occurrence = harness.seed_occurrence(&subscription, at(2025, 3, 1)).await;
    harness
        .engine
        .execute_occurrence(occurrence.id, at(2025, 3, 1))
        .await
        .unwrap();

    let outcome = harness
        .engine
        .request_cancellation(subscription.id, at(2025, 3, 2))
        .await
        .unwrap();

    assert_eq!(outcome, CancellationOutcome::PaymentOutstanding);
    assert_eq!(
        harness.subscription(subscription.id).await.status,
        SubscriptionStatus::Active
    );
}

#[tokio::test]
async fn repeated_cancellation_is_not_applicable() {
    let harness = Harness::new();
    let plan = harness.seed_plan(BillingCycle::Monthly, 1_900).await;
    let subscription = harness
        .seed_subscription(&plan, at(2025, 2, 1), at(2025, 3, 1))
        .await;

    let first = harness
        .engine
        .request_cancellation(subscription.id, at(2025, 2, 10))
        .await
        .unwrap();
    let second = harness
        .engine
        .request_cancellation(subscription.id, at(2025, 2, 10))
        .await
        .unwrap();

    assert_eq!(first, CancellationOutcome::Applied { occurrence_id: None });
    assert_eq!(second, CancellationOutcome::NotApplicable);
    assert_eq!(
        harness
            .engine
            .request_cancellation(Uuid::new_v4(), at(2025, 2, 10))
            .await
            .unwrap(),
        CancellationOutcome::Missing
    );
}

// key: billing-activation-tests -> first purchase
#[tokio::test]
async fn activation_starts_first_cycle_on_purchase_day() {
    let harness = Harness::new();
    let plan = harness.seed_plan(BillingCycle::Monthly, 1_900).await;
    let purchased_at = Utc.with_ymd_and_hms(2025, 1, 31, 10, 30, 0).unwrap();

    let subscription = harness
        .engine
        .activate(ActivationRequest {
            owner_id: Uuid::new_v4(),
            plan_id: plan.id,
            entitlement_code: "LIC-9".into(),
            payer_key: "cus_9".into(),
            contact_email: "new@example.com".into(),
            locale: "en".into(),
            price_paid_cents: Some(950),
            purchased_at,
        })
        .await
        .unwrap();

    let expected_end = Utc.with_ymd_and_hms(2025, 2, 28, 10, 30, 0).unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.end_date, expected_end);
    assert_eq!(subscription.original_end_date, expected_end);
    assert_eq!(subscription.original_price, 950);
    assert_eq!(subscription.schema_version, CURRENT_SCHEMA_VERSION);
    assert_eq!(
        harness.entitlements.calls(),
        vec![EntitlementCall::Extend("LIC-9".into(), expected_end)]
    );

    let created = harness
        .engine
        .create_pending_occurrences(subscription.id, purchased_at)
        .await
        .unwrap();
    assert_eq!(created, 12);
    let occurrences = harness.store.list_occurrences(subscription.id).await.unwrap();
    assert!(occurrences.iter().all(|occurrence| occurrence.amount_cents == 1_900));
    assert_eq!(occurrences[0].scheduled_at, expected_end);
}

#[tokio::test]
async fn activation_rejects_retired_plans() {
    let harness = Harness::new();
    let mut plan = harness.seed_plan(BillingCycle::Monthly, 1_900).await;
    plan.active = false;
    harness.store.upsert_plan(&plan).await.unwrap();

    let result = harness
        .engine
        .activate(ActivationRequest {
            owner_id: Uuid::new_v4(),
            plan_id: plan.id,
            entitlement_code: "LIC-9".into(),
            payer_key: "cus_9".into(),
            contact_email: "new@example.com".into(),
            locale: "en".into(),
            price_paid_cents: None,
            purchased_at: at(2025, 1, 1),
        })
        .await;

    assert!(result.is_err());
    assert!(harness.entitlements.calls().is_empty());
}

#[tokio::test]
async fn legacy_rows_are_upgraded_once() {
    let harness = Harness::new();
    let plan = harness.seed_plan(BillingCycle::Monthly, 1_900).await;
    let current = harness
        .seed_subscription(&plan, at(2025, 2, 1), at(2025, 3, 1))
        .await;
    let mut legacy = current.clone();
    legacy.id = Uuid::new_v4();
    legacy.schema_version = 1;
    harness.store.insert_subscription(&legacy).await.unwrap();

    assert_eq!(harness.engine.upgrade_legacy_subscriptions().await.unwrap(), 1);
    assert_eq!(harness.engine.upgrade_legacy_subscriptions().await.unwrap(), 0);
    assert_eq!(
        harness.subscription(legacy.id).await.schema_version,
        CURRENT_SCHEMA_VERSION
    );
}

#[tokio::test]
async fn failed_charge_shows_payment_failed_until_grace_expires() {
    let harness = Harness::new();
    harness.gateway.set(ChargeScript::Decline);
    let plan = harness.seed_plan(BillingCycle::Monthly, 1_900).await;
    let subscription = harness
        .seed_subscription(&plan, at(2025, 2, 1), at(2025, 3, 1))
        .await;
    let occurrence = harness.seed_occurrence(&subscription, at(2025, 3, 1)).await;
    harness
        .engine
        .execute_occurrence(occurrence.id, at(2025, 3, 1))
        .await
        .unwrap();

    let view = harness
        .engine
        .subscription_view(subscription.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.display_status, SubscriptionStatus::PaymentFailed);
    assert_eq!(view.subscription.status, SubscriptionStatus::Active);

    // Reaper wins the race once the shortened end date passes.
    let reaped = harness
        .engine
        .expire_subscription(subscription.id, at(2025, 3, 16) + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(reaped, ReapOutcome::Expired);
    assert_eq!(harness.occurrence(occurrence.id).await.state, OccurrenceState::Expired);

    let view = harness
        .engine
        .subscription_view(subscription.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.display_status, SubscriptionStatus::Expired);
}
