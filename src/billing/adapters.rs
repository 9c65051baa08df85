use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use url::Url;

/// Failure modes of a gateway call. Every variant is handled by the failure
/// state machine; none of them is ever treated as a successful charge.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request timed out")]
    Timeout,
    #[error("gateway declined the charge: {0}")]
    Declined(String),
    #[error("gateway transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("bridge rejected request with status {0}")]
    Rejected(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub reference: String,
    #[serde(default)]
    pub is_default: bool,
}

/// Selects the method a renewal is charged against: the payer's default when
/// flagged, otherwise the first one listed.
pub fn preferred_method(methods: &[PaymentMethod]) -> Option<&PaymentMethod> {
    methods
        .iter()
        .find(|method| method.is_default)
        .or_else(|| methods.first())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentFailedNotice {
    pub recipient: String,
    pub entitlement_code: String,
    pub new_end_date: DateTime<Utc>,
    pub locale: String,
}

// key: billing-adapter -> payment gateway
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn list_payment_methods(&self, payer_key: &str)
        -> Result<Vec<PaymentMethod>, GatewayError>;

    /// Returns the gateway transaction id, or `None` when the gateway answered
    /// without one.
    async fn charge(
        &self,
        payer_key: &str,
        method_ref: &str,
        amount_cents: i64,
        currency: &str,
    ) -> Result<Option<String>, GatewayError>;
}

// key: billing-adapter -> downstream entitlement (license) expiry
#[async_trait]
pub trait EntitlementBridge: Send + Sync {
    async fn extend_expiry(
        &self,
        entitlement_code: &str,
        new_date: DateTime<Utc>,
    ) -> Result<(), BridgeError>;
    async fn set_expiry_now(&self, entitlement_code: &str) -> Result<(), BridgeError>;
}

// key: billing-adapter -> subscriber notifications
#[async_trait]
pub trait NotificationBridge: Send + Sync {
    async fn send_payment_failed(&self, notice: &PaymentFailedNotice) -> Result<(), BridgeError>;
}

struct HttpEndpoint {
    client: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpEndpoint {
    fn new(base_url: &str, auth_token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("invalid bridge url `{base_url}`"))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("bridge url `{base_url}` cannot carry a path");
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            auth_token,
        })
    }

    /// Appends path segments to the base URL, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.auth_token {
            request.bearer_auth(token)
        } else {
            request
        }
    }
}

// key: billing-adapter-http -> gateway over REST
pub struct HttpPaymentGateway {
    http: HttpEndpoint,
}

#[derive(Debug, Deserialize)]
struct PaymentMethodsResponse {
    #[serde(default)]
    methods: Vec<PaymentMethod>,
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    decline_reason: Option<String>,
}

impl HttpPaymentGateway {
    pub fn new(
        base_url: impl AsRef<str>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpEndpoint::new(base_url.as_ref(), auth_token, timeout)?,
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn list_payment_methods(
        &self,
        payer_key: &str,
    ) -> Result<Vec<PaymentMethod>, GatewayError> {
        let response = self
            .http
            .auth(
                self.http
                    .client
                    .get(self.http.endpoint(&["payers", payer_key, "payment-methods"])),
            )
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let parsed: PaymentMethodsResponse = response.error_for_status()?.json().await?;
        Ok(parsed.methods)
    }

    async fn charge(
        &self,
        payer_key: &str,
        method_ref: &str,
        amount_cents: i64,
        currency: &str,
    ) -> Result<Option<String>, GatewayError> {
        let response = self
            .http
            .auth(self.http.client.post(self.http.endpoint(&["charges"])))
            .json(&json!({
                "payer_key": payer_key,
                "payment_method": method_ref,
                "amount": amount_cents,
                "currency": currency,
            }))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::PAYMENT_REQUIRED || status == StatusCode::UNPROCESSABLE_ENTITY {
            let body: Option<ChargeResponse> = response.json().await.ok();
            let reason = body
                .and_then(|body| body.decline_reason)
                .unwrap_or_else(|| format!("status {}", status.as_u16()));
            return Err(GatewayError::Declined(reason));
        }

        let parsed: ChargeResponse = response.error_for_status()?.json().await?;
        if let Some(reason) = parsed.decline_reason.filter(|_| parsed.transaction_id.is_none()) {
            return Err(GatewayError::Declined(reason));
        }
        Ok(parsed.transaction_id.filter(|id| !id.is_empty()))
    }
}

// key: billing-adapter-http -> entitlement bridge over REST
pub struct HttpEntitlementBridge {
    http: HttpEndpoint,
}

impl HttpEntitlementBridge {
    pub fn new(
        base_url: impl AsRef<str>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpEndpoint::new(base_url.as_ref(), auth_token, timeout)?,
        })
    }
}

fn ensure_accepted(response: reqwest::Response) -> Result<(), BridgeError> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(BridgeError::Rejected(response.status().as_u16()))
    }
}

#[async_trait]
impl EntitlementBridge for HttpEntitlementBridge {
    async fn extend_expiry(
        &self,
        entitlement_code: &str,
        new_date: DateTime<Utc>,
    ) -> Result<(), BridgeError> {
        let response = self
            .http
            .auth(
                self.http
                    .client
                    .put(self.http.endpoint(&["entitlements", entitlement_code, "expiry"])),
            )
            .json(&json!({ "expires_at": new_date }))
            .send()
            .await?;
        ensure_accepted(response)
    }

    async fn set_expiry_now(&self, entitlement_code: &str) -> Result<(), BridgeError> {
        let response = self
            .http
            .auth(
                self.http
                    .client
                    .post(self.http.endpoint(&["entitlements", entitlement_code, "expire"])),
            )
            .send()
            .await?;
        ensure_accepted(response)
    }
}

// key: billing-adapter-http -> notification bridge over REST
pub struct HttpNotificationBridge {
    http: HttpEndpoint,
}

impl HttpNotificationBridge {
    pub fn new(
        base_url: impl AsRef<str>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpEndpoint::new(base_url.as_ref(), auth_token, timeout)?,
        })
    }
}

#[async_trait]
impl NotificationBridge for HttpNotificationBridge {
    async fn send_payment_failed(&self, notice: &PaymentFailedNotice) -> Result<(), BridgeError> {
        let response = self
            .http
            .auth(
                self.http
                    .client
                    .post(self.http.endpoint(&["notifications", "payment-failed"])),
            )
            .json(notice)
            .send()
            .await?;
        ensure_accepted(response)
    }
}
