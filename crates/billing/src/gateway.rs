//! Payment gateway port
//!
//! The reconciliation job only needs three calls from the gateway. `StripeGateway`
//! creates off-session PaymentIntents over the REST API (so the idempotency key
//! travels as a header) and uses the SDK for reads and portal sessions. Every call
//! is bounded by the configured timeout.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

const PAYMENT_INTENTS_URL: &str = "https://api.stripe.com/v1/payment_intents";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("gateway call timed out")]
    Timeout,
    #[error("charge declined: {reason}")]
    Declined {
        charge_ref: Option<String>,
        reason: String,
    },
    #[error("gateway API error: {0}")]
    Api(String),
}

impl GatewayError {
    /// Reason recorded on the schedule entry
    pub fn failure_reason(&self) -> String {
        match self {
            GatewayError::Timeout => "gateway timeout".to_string(),
            GatewayError::Declined { reason, .. } => reason.clone(),
            GatewayError::Api(message) => format!("gateway error: {}", message),
        }
    }

    pub fn charge_ref(&self) -> Option<&str> {
        match self {
            GatewayError::Declined { charge_ref, .. } => charge_ref.as_deref(),
            _ => None,
        }
    }
}

impl From<stripe::StripeError> for GatewayError {
    fn from(e: stripe::StripeError) -> Self {
        GatewayError::Api(e.to_string())
    }
}

impl From<GatewayError> for BillingError {
    fn from(e: GatewayError) -> Self {
        BillingError::Gateway(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    /// Amount in minor units (cents)
    pub amount_minor: i64,
    pub currency: String,
    pub customer_id: String,
    pub payment_method_id: String,
    pub idempotency_key: String,
    pub booking_id: Uuid,
    pub schedule_entry_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeStatus {
    Succeeded,
    /// Settlement still in flight; the webhook or the stall sweep resolves it
    Processing,
    /// 3-D Secure or similar customer action required; counts as a failure off-session
    RequiresAction,
    Declined,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeOutcome {
    pub charge_ref: String,
    pub status: ChargeStatus,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeDetails {
    pub charge_ref: String,
    pub status: ChargeStatus,
    pub customer_id: Option<String>,
    pub payment_method_id: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, GatewayError>;

    async fn retrieve_charge(&self, charge_ref: &str) -> Result<ChargeDetails, GatewayError>;

    /// Self-service payment-method update link
    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<String, GatewayError>;
}

#[derive(Debug, Deserialize)]
struct IntentResponse {
    id: String,
    status: String,
    #[serde(default)]
    last_payment_error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    decline_code: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    payment_intent: Option<IntentRef>,
}

#[derive(Debug, Deserialize)]
struct IntentRef {
    id: String,
}

impl ErrorBody {
    fn reason(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.decline_code.clone())
            .or_else(|| self.code.clone())
            .unwrap_or_else(|| "payment failed".to_string())
    }
}

fn status_from_str(status: &str) -> ChargeStatus {
    match status {
        "succeeded" => ChargeStatus::Succeeded,
        "processing" => ChargeStatus::Processing,
        "requires_action" | "requires_confirmation" => ChargeStatus::RequiresAction,
        "requires_payment_method" | "canceled" => ChargeStatus::Declined,
        _ => ChargeStatus::Other,
    }
}

fn status_from_sdk(status: stripe::PaymentIntentStatus) -> ChargeStatus {
    use stripe::PaymentIntentStatus as S;
    match status {
        S::Succeeded => ChargeStatus::Succeeded,
        S::Processing => ChargeStatus::Processing,
        S::RequiresAction | S::RequiresConfirmation => ChargeStatus::RequiresAction,
        S::RequiresPaymentMethod | S::Canceled => ChargeStatus::Declined,
        _ => ChargeStatus::Other,
    }
}

pub struct StripeGateway {
    stripe: StripeClient,
    http: reqwest::Client,
    timeout: Duration,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> BillingResult<Self> {
        let timeout = stripe.config().timeout;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            stripe,
            http,
            timeout,
        })
    }

    async fn bounded<F, T>(&self, call: F) -> Result<T, GatewayError>
    where
        F: std::future::Future<Output = Result<T, stripe::StripeError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(GatewayError::from),
            Err(_) => Err(GatewayError::Timeout),
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, GatewayError> {
        let amount = request.amount_minor.to_string();
        let booking_id = request.booking_id.to_string();
        let entry_id = request.schedule_entry_id.to_string();
        let form_params = [
            ("amount", amount.as_str()),
            ("currency", request.currency.as_str()),
            ("customer", request.customer_id.as_str()),
            ("payment_method", request.payment_method_id.as_str()),
            ("off_session", "true"),
            ("confirm", "true"),
            ("metadata[booking_id]", booking_id.as_str()),
            ("metadata[schedule_entry_id]", entry_id.as_str()),
        ];

        let response = self
            .http
            .post(PAYMENT_INTENTS_URL)
            .bearer_auth(&self.stripe.config().secret_key)
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&form_params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout
                } else {
                    GatewayError::Api(format!("failed to call Stripe API: {}", e))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            let intent: IntentResponse = response
                .json()
                .await
                .map_err(|e| GatewayError::Api(format!("failed to parse Stripe response: {}", e)))?;
            return Ok(ChargeOutcome {
                failure_reason: intent.last_payment_error.as_ref().map(ErrorBody::reason),
                status: status_from_str(&intent.status),
                charge_ref: intent.id,
            });
        }

        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) if envelope.error.kind.as_deref() == Some("card_error") => {
                Err(GatewayError::Declined {
                    reason: envelope.error.reason(),
                    charge_ref: envelope.error.payment_intent.map(|pi| pi.id),
                })
            }
            _ => {
                tracing::error!(
                    status = %status,
                    schedule_entry_id = %request.schedule_entry_id,
                    "Stripe payment_intents API failed"
                );
                Err(GatewayError::Api(format!("Stripe API error ({})", status)))
            }
        }
    }

    async fn retrieve_charge(&self, charge_ref: &str) -> Result<ChargeDetails, GatewayError> {
        let id: stripe::PaymentIntentId = charge_ref
            .parse()
            .map_err(|e| GatewayError::Api(format!("invalid payment intent id '{}': {}", charge_ref, e)))?;

        let intent = self
            .bounded(stripe::PaymentIntent::retrieve(self.stripe.inner(), &id, &[]))
            .await?;

        Ok(ChargeDetails {
            charge_ref: intent.id.to_string(),
            status: status_from_sdk(intent.status),
            customer_id: intent.customer.as_ref().map(|customer| match customer {
                stripe::Expandable::Id(id) => id.to_string(),
                stripe::Expandable::Object(customer) => customer.id.to_string(),
            }),
            payment_method_id: intent.payment_method.as_ref().map(|method| match method {
                stripe::Expandable::Id(id) => id.to_string(),
                stripe::Expandable::Object(method) => method.id.to_string(),
            }),
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<String, GatewayError> {
        let customer: stripe::CustomerId = customer_id
            .parse()
            .map_err(|e| GatewayError::Api(format!("invalid customer id '{}': {}", customer_id, e)))?;

        let mut params = stripe::CreateBillingPortalSession::new(customer);
        params.return_url = Some(return_url);

        let session = self
            .bounded(stripe::BillingPortalSession::create(self.stripe.inner(), params))
            .await?;
        Ok(session.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_from_str("succeeded"), ChargeStatus::Succeeded);
        assert_eq!(status_from_str("requires_action"), ChargeStatus::RequiresAction);
        assert_eq!(status_from_str("requires_payment_method"), ChargeStatus::Declined);
        assert_eq!(status_from_str("processing"), ChargeStatus::Processing);
        assert_eq!(status_from_str("something_new"), ChargeStatus::Other);
    }

    #[test]
    fn test_card_error_body_parsing() {
        let body = r#"{"error":{"type":"card_error","code":"card_declined","decline_code":"insufficient_funds","message":"Your card has insufficient funds.","payment_intent":{"id":"pi_123","status":"requires_payment_method"}}}"#;
        let envelope: ErrorEnvelope = serde_json::from_str(body).unwrap();
        assert_eq!(envelope.error.kind.as_deref(), Some("card_error"));
        assert_eq!(envelope.error.reason(), "Your card has insufficient funds.");
        assert_eq!(envelope.error.payment_intent.unwrap().id, "pi_123");
    }

    #[test]
    fn test_failure_reason_text() {
        assert_eq!(GatewayError::Timeout.failure_reason(), "gateway timeout");
        let declined = GatewayError::Declined {
            charge_ref: Some("pi_1".to_string()),
            reason: "card declined".to_string(),
        };
        assert_eq!(declined.failure_reason(), "card declined");
        assert_eq!(declined.charge_ref(), Some("pi_1"));
    }
}
