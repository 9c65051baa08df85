pub mod adapters;
pub mod api;
pub mod calendar;
pub mod cancellation;
pub mod executor;
pub mod failure;
pub mod memory;
pub mod models;
pub mod occurrences;
pub mod reaper;
pub mod scheduler;
pub mod service;
pub mod store;

pub use adapters::{
    BridgeError, EntitlementBridge, GatewayError, HttpEntitlementBridge, HttpNotificationBridge,
    HttpPaymentGateway, NotificationBridge, PaymentFailedNotice, PaymentGateway, PaymentMethod,
};
pub use calendar::next_cycle_end;
pub use cancellation::CancellationOutcome;
pub use executor::{ExecutionOutcome, PaymentExecutor, SkipReason};
pub use failure::{FailureCause, FailureHandler, FailureOutcome};
pub use memory::InMemoryBillingStore;
pub use models::{
    BillingCycle, BillingPlan, Occurrence, OccurrenceState, Subscription, SubscriptionStatus,
};
pub use reaper::{ExpiryReaper, ReapOutcome};
pub use scheduler::{BillingScheduler, DispatchSummary};
pub use service::{ActivationRequest, BillingEngine, SubscriptionView};
pub use store::{BillingStore, PgBillingStore};
