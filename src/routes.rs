use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};
use axum_prometheus::PrometheusMetricLayer;

use crate::billing::api::{self, TaskCallbackSecret};
use crate::billing::BillingEngine;

async fn root() -> &'static str {
    "Billing Engine"
}

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/billing/tasks", post(api::receive_task))
        .route("/api/billing/subscriptions", post(api::activate_subscription))
        .route("/api/billing/subscriptions/:id", get(api::get_subscription))
        .route(
            "/api/billing/subscriptions/:id/cancel",
            post(api::cancel_subscription),
        )
        .route(
            "/api/billing/subscriptions/:id/rescind",
            post(api::rescind_cancellation),
        )
}

/// Billing routes with the engine and callback secret attached.
pub fn billing_app(engine: Arc<BillingEngine>, secret: TaskCallbackSecret) -> Router {
    api_routes()
        .layer(Extension(engine))
        .layer(Extension(secret))
}

/// Full service router. Installs the global Prometheus recorder, so call it
/// once per process.
pub fn app(engine: Arc<BillingEngine>, secret: TaskCallbackSecret) -> Router {
    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(billing_app(engine, secret))
        .layer(prometheus_layer)
}
