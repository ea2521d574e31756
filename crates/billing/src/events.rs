//! Typed gateway webhook events
//!
//! Only the fields the reconciliation engine reads are modelled; everything else in
//! the payload is ignored so newer gateway API versions keep parsing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const PAYMENT_INTENT_SUCCEEDED: &str = "payment_intent.succeeded";
pub const PAYMENT_INTENT_FAILED: &str = "payment_intent.payment_failed";
pub const CHARGE_REFUNDED: &str = "charge.refunded";

/// Verified event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutCompleted {
    pub id: String,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CheckoutCompleted {
    /// Reference under which the first payment is recorded
    pub fn charge_ref(&self) -> &str {
        self.payment_intent.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentError {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub decline_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentEvent {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub last_payment_error: Option<PaymentError>,
}

impl PaymentIntentEvent {
    pub fn failure_reason(&self) -> String {
        self.last_payment_error
            .as_ref()
            .and_then(|e| {
                e.message
                    .clone()
                    .or_else(|| e.decline_code.clone())
                    .or_else(|| e.code.clone())
            })
            .unwrap_or_else(|| "payment failed".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundItem {
    pub id: String,
    pub amount: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefundList {
    #[serde(default)]
    pub data: Vec<RefundItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChargeRefunded {
    pub id: String,
    #[serde(default)]
    pub payment_intent: Option<String>,
    pub amount: i64,
    pub amount_refunded: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub refunds: Option<RefundList>,
}

impl ChargeRefunded {
    /// Charge reference used when the payment was recorded
    pub fn charge_ref(&self) -> &str {
        self.payment_intent.as_deref().unwrap_or(&self.id)
    }

    pub fn is_fully_refunded(&self) -> bool {
        self.amount_refunded >= self.amount
    }
}

/// Event classified by what the engine does with it
#[derive(Debug, Clone)]
pub enum GatewayEventKind {
    CheckoutCompleted(CheckoutCompleted),
    PaymentSucceeded(PaymentIntentEvent),
    PaymentFailed(PaymentIntentEvent),
    ChargeRefunded(ChargeRefunded),
    Unhandled,
}

impl GatewayEvent {
    pub fn timestamp(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.created)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    pub fn kind(&self) -> BillingResult<GatewayEventKind> {
        let object = self.data.object.clone();
        let kind = match self.event_type.as_str() {
            CHECKOUT_SESSION_COMPLETED => {
                GatewayEventKind::CheckoutCompleted(self.decode(object)?)
            }
            PAYMENT_INTENT_SUCCEEDED => GatewayEventKind::PaymentSucceeded(self.decode(object)?),
            PAYMENT_INTENT_FAILED => GatewayEventKind::PaymentFailed(self.decode(object)?),
            CHARGE_REFUNDED => GatewayEventKind::ChargeRefunded(self.decode(object)?),
            _ => GatewayEventKind::Unhandled,
        };
        Ok(kind)
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, object: serde_json::Value) -> BillingResult<T> {
        serde_json::from_value(object).map_err(|e| {
            BillingError::MalformedEvent(format!("{} ({}): {}", self.event_type, self.id, e))
        })
    }
}

/// Read a UUID out of event metadata
pub fn metadata_uuid(metadata: &HashMap<String, String>, key: &str) -> Option<Uuid> {
    metadata.get(key).and_then(|v| Uuid::parse_str(v).ok())
}
