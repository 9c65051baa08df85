use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::job_queue::Task;

use super::cancellation::CancellationOutcome;
use super::service::{ActivationRequest, BillingEngine, SubscriptionView};
use super::models::Subscription;

pub const SIGNATURE_HEADER: &str = "x-billing-signature";

/// Shared secret used to verify task callbacks.
#[derive(Clone)]
pub struct TaskCallbackSecret(pub Option<String>);

pub fn sign_payload(secret: &str, body: &[u8]) -> AppResult<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|err| AppError::Message(format!("invalid callback secret: {err}")))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

fn verify_signature(secret: &str, headers: &HeaderMap, body: &[u8]) -> AppResult<()> {
    let header = headers
        .get(SIGNATURE_HEADER)
        .ok_or(AppError::Unauthorized)?
        .to_str()
        .map_err(|_| AppError::BadRequest("Bad signature".into()))?;
    let provided = header
        .strip_prefix("sha256=")
        .ok_or_else(|| AppError::BadRequest("Bad signature".into()))?;
    let provided = hex::decode(provided).map_err(|_| AppError::BadRequest("Bad signature".into()))?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|err| AppError::Message(format!("invalid callback secret: {err}")))?;
    mac.update(body);
    mac.verify_slice(&provided).map_err(|_| AppError::Unauthorized)
}

// key: billing-api -> task callback
/// Any error response makes the queue redeliver, so a task is acknowledged
/// only after the engine has applied it.
pub async fn receive_task(
    Extension(engine): Extension<Arc<BillingEngine>>,
    Extension(secret): Extension<TaskCallbackSecret>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<StatusCode> {
    let Some(secret) = secret.0.as_deref() else {
        tracing::warn!("task callback received but no callback secret is configured");
        return Err(AppError::Unauthorized);
    };
    verify_signature(secret, &headers, &body)?;

    let task: Task = serde_json::from_slice(&body)
        .map_err(|err| AppError::BadRequest(format!("invalid task payload: {err}")))?;
    engine
        .handle(&task)
        .await
        .map_err(|err| AppError::Message(format!("{} task failed: {err:#}", task.kind())))?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn activate_subscription(
    Extension(engine): Extension<Arc<BillingEngine>>,
    Json(request): Json<ActivationRequest>,
) -> AppResult<(StatusCode, Json<Subscription>)> {
    let subscription = engine
        .activate(request)
        .await
        .map_err(|err| AppError::BadRequest(err.to_string()))?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

pub async fn get_subscription(
    Extension(engine): Extension<Arc<BillingEngine>>,
    Path(subscription_id): Path<Uuid>,
) -> AppResult<Json<SubscriptionView>> {
    let view = engine
        .subscription_view(subscription_id)
        .await
        .map_err(|err| AppError::Message(err.to_string()))?
        .ok_or(AppError::NotFound)?;
    Ok(Json(view))
}

#[derive(Debug, Serialize)]
pub struct CancellationResponse {
    pub subscription_id: Uuid,
    pub occurrence_id: Option<Uuid>,
}

fn cancellation_response(
    subscription_id: Uuid,
    outcome: CancellationOutcome,
) -> AppResult<Json<CancellationResponse>> {
    match outcome {
        CancellationOutcome::Applied { occurrence_id } => Ok(Json(CancellationResponse {
            subscription_id,
            occurrence_id,
        })),
        CancellationOutcome::Missing => Err(AppError::NotFound),
        CancellationOutcome::NotApplicable => Err(AppError::Conflict(
            "subscription is not in a state that allows this change".into(),
        )),
        CancellationOutcome::PaymentOutstanding => Err(AppError::Conflict(
            "a failed payment must be settled first".into(),
        )),
    }
}

pub async fn cancel_subscription(
    Extension(engine): Extension<Arc<BillingEngine>>,
    Path(subscription_id): Path<Uuid>,
) -> AppResult<Json<CancellationResponse>> {
    let outcome = engine
        .request_cancellation(subscription_id, Utc::now())
        .await
        .map_err(|err| AppError::Message(err.to_string()))?;
    cancellation_response(subscription_id, outcome)
}

pub async fn rescind_cancellation(
    Extension(engine): Extension<Arc<BillingEngine>>,
    Path(subscription_id): Path<Uuid>,
) -> AppResult<Json<CancellationResponse>> {
    let outcome = engine
        .rescind_cancellation(subscription_id, Utc::now())
        .await
        .map_err(|err| AppError::Message(err.to_string()))?;
    cancellation_response(subscription_id, outcome)
}
