use std::net::SocketAddr;
use std::sync::Arc;

use billing_engine::billing::api::TaskCallbackSecret;
use billing_engine::billing::{
    BillingEngine, BillingStore, EntitlementBridge, HttpEntitlementBridge, HttpNotificationBridge,
    HttpPaymentGateway, NotificationBridge, PaymentGateway, PgBillingStore,
};
use billing_engine::job_queue::{start_worker, PgTaskQueue, TaskQueue};
use billing_engine::routes;
use billing_engine::{billing_config_from_env, server_config_from_env};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let server = server_config_from_env()?;
    let billing = billing_config_from_env();

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&server.database_url)
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if server.allow_migration_failure {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool.clone()));
    let queue: Arc<dyn TaskQueue> = Arc::new(PgTaskQueue::new(pool.clone()));
    let gateway: Arc<dyn PaymentGateway> = Arc::new(HttpPaymentGateway::new(
        server.gateway_url.clone(),
        server.gateway_token.clone(),
        billing.gateway_timeout,
    )?);
    let entitlements: Arc<dyn EntitlementBridge> = Arc::new(HttpEntitlementBridge::new(
        server.entitlement_url.clone(),
        server.bridge_token.clone(),
        billing.gateway_timeout,
    )?);
    let notifications: Arc<dyn NotificationBridge> = Arc::new(HttpNotificationBridge::new(
        server.notification_url.clone(),
        server.bridge_token.clone(),
        billing.gateway_timeout,
    )?);

    let engine = Arc::new(BillingEngine::new(
        store,
        queue,
        gateway,
        entitlements,
        notifications,
        billing.clone(),
    ));
    engine.upgrade_legacy_subscriptions().await?;

    engine.scheduler().spawn();
    start_worker(pool.clone(), engine.clone(), server.worker_poll_interval);

    let app = routes::app(
        engine.clone(),
        TaskCallbackSecret(server.task_callback_secret.clone()),
    );

    let addr: SocketAddr = format!("{}:{}", server.bind_address, server.bind_port)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(
        %addr,
        scan_interval_secs = billing.scan_interval.as_secs(),
        "Listening for incoming connections"
    );
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
