//! Email provider delivery-status webhook
//!
//! Same shape as the gateway path: verify the signature, then record the event
//! once per delivery id. Signatures follow the Svix scheme: HMAC-SHA256 over
//! `"{id}.{timestamp}.{body}"`, keyed with the base64 part of a `whsec_` secret,
//! sent as space-separated `v1,<base64>` entries.

use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

use crate::config::Environment;
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;
use crate::types::{DeliveryStatus, EmailDeliveryEvent};
use crate::verifier::{Rejection, TIMESTAMP_TOLERANCE};

type HmacSha256 = Hmac<Sha256>;

/// Values of the `svix-id`, `svix-timestamp` and `svix-signature` headers
#[derive(Debug, Clone, Default)]
pub struct SvixHeaders<'a> {
    pub id: Option<&'a str>,
    pub timestamp: Option<&'a str>,
    pub signature: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailEventOutcome {
    Recorded,
    Duplicate,
    Ignored,
}

#[derive(Debug, Deserialize)]
struct ProviderEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created_at: Option<String>,
    data: ProviderEventData,
}

#[derive(Debug, Deserialize)]
struct ProviderEventData {
    email_id: String,
    #[serde(default)]
    to: Vec<String>,
}

fn delivery_status(event_type: &str) -> Option<DeliveryStatus> {
    match event_type {
        "email.sent" => Some(DeliveryStatus::Sent),
        "email.delivered" => Some(DeliveryStatus::Delivered),
        "email.bounced" => Some(DeliveryStatus::Bounced),
        "email.complained" => Some(DeliveryStatus::Complained),
        "email.opened" => Some(DeliveryStatus::Opened),
        "email.clicked" => Some(DeliveryStatus::Clicked),
        _ => None,
    }
}

pub struct EmailEventHandler {
    key: Option<Vec<u8>>,
    environment: Environment,
    store: Arc<dyn BillingStore>,
}

impl EmailEventHandler {
    pub fn new(
        secret: Option<String>,
        environment: Environment,
        store: Arc<dyn BillingStore>,
    ) -> Self {
        let key = secret.and_then(|s| {
            let encoded = s.strip_prefix("whsec_").unwrap_or(&s).to_string();
            match general_purpose::STANDARD.decode(encoded.as_bytes()) {
                Ok(key) => Some(key),
                Err(e) => {
                    tracing::error!(error = %e, "RESEND_WEBHOOK_SECRET is not valid base64 - email webhooks will be rejected");
                    None
                }
            }
        });
        Self {
            key,
            environment,
            store,
        }
    }

    pub async fn handle(&self, raw_body: &str, headers: SvixHeaders<'_>) -> BillingResult<EmailEventOutcome> {
        self.handle_at(raw_body, headers, OffsetDateTime::now_utc())
            .await
    }

    pub async fn handle_at(
        &self,
        raw_body: &str,
        headers: SvixHeaders<'_>,
        now: OffsetDateTime,
    ) -> BillingResult<EmailEventOutcome> {
        self.verify(raw_body, &headers, now).map_err(|rejection| {
            tracing::warn!(
                rejection = %rejection,
                delivery_id = ?headers.id,
                payload_len = raw_body.len(),
                "Email webhook rejected"
            );
            BillingError::from(rejection)
        })?;

        let event: ProviderEvent = serde_json::from_str(raw_body)
            .map_err(|_| BillingError::from(Rejection::MalformedPayload))?;

        let Some(status) = delivery_status(&event.event_type) else {
            tracing::debug!(event_type = %event.event_type, "Ignoring email event type");
            return Ok(EmailEventOutcome::Ignored);
        };

        let occurred_at = event
            .created_at
            .as_deref()
            .and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok())
            .unwrap_or(now);

        // svix-id is unique per message and stable across redeliveries
        let delivery_id = headers
            .id
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}:{}", event.data.email_id, event.event_type));

        let recorded = self
            .store
            .record_email_event(&EmailDeliveryEvent {
                delivery_id: delivery_id.clone(),
                message_id: event.data.email_id.clone(),
                status,
                recipient: event.data.to.first().cloned(),
                occurred_at,
            })
            .await?;

        if !recorded {
            tracing::debug!(delivery_id = %delivery_id, "Duplicate email delivery event");
            return Ok(EmailEventOutcome::Duplicate);
        }

        if status == DeliveryStatus::Bounced || status == DeliveryStatus::Complained {
            tracing::warn!(
                message_id = %event.data.email_id,
                status = %status,
                "Email delivery problem"
            );
        } else {
            tracing::info!(message_id = %event.data.email_id, status = %status, "Email delivery event recorded");
        }
        Ok(EmailEventOutcome::Recorded)
    }

    fn verify(
        &self,
        raw_body: &str,
        headers: &SvixHeaders<'_>,
        now: OffsetDateTime,
    ) -> Result<(), Rejection> {
        let Some(key) = &self.key else {
            if self.environment.is_production() {
                return Err(Rejection::SecretNotConfigured);
            }
            tracing::warn!("Email webhook secret not configured - accepting UNVERIFIED event outside production");
            return Ok(());
        };

        let (Some(id), Some(timestamp), Some(signature)) =
            (headers.id, headers.timestamp, headers.signature)
        else {
            return Err(Rejection::MissingSignature);
        };

        let sent_at: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| Rejection::MalformedSignature)?;
        let skew_secs = now
            .unix_timestamp()
            .checked_sub(sent_at)
            .and_then(i64::checked_abs)
            .ok_or(Rejection::MalformedSignature)?;
        if Duration::seconds(skew_secs) > TIMESTAMP_TOLERANCE {
            return Err(Rejection::StaleTimestamp { skew_secs });
        }

        let signed_content = format!("{}.{}.{}", id, sent_at, raw_body);
        let matched = signature
            .split_whitespace()
            .filter_map(|part| part.strip_prefix("v1,"))
            .filter_map(|encoded| general_purpose::STANDARD.decode(encoded).ok())
            .any(|candidate| match HmacSha256::new_from_slice(key) {
                Ok(mut mac) => {
                    mac.update(signed_content.as_bytes());
                    mac.verify_slice(&candidate).is_ok()
                }
                Err(_) => false,
            });

        if matched {
            Ok(())
        } else {
            Err(Rejection::SignatureMismatch)
        }
    }
}

/// `svix-signature` value for `body`; the provider's side of the scheme
pub fn sign(secret: &str, id: &str, timestamp: i64, body: &str) -> String {
    let encoded = secret.strip_prefix("whsec_").unwrap_or(secret);
    let Ok(key) = general_purpose::STANDARD.decode(encoded) else {
        return String::new();
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(&key) else {
        return String::new();
    };
    mac.update(format!("{}.{}.{}", id, timestamp, body).as_bytes());
    format!(
        "v1,{}",
        general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    // base64 of "email-webhook-test-key"
    const SECRET: &str = "whsec_ZW1haWwtd2ViaG9vay10ZXN0LWtleQ==";
    const BODY: &str = r#"{"type":"email.bounced","created_at":"2026-03-01T09:00:00Z","data":{"email_id":"msg_1","to":["ada@example.com"]}}"#;

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_772_355_600).unwrap()
    }

    fn handler(store: Arc<MemoryStore>) -> EmailEventHandler {
        EmailEventHandler::new(Some(SECRET.to_string()), Environment::Production, store)
    }

    #[tokio::test]
    async fn test_valid_event_recorded_once() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler(store);
        let ts = now().unix_timestamp().to_string();
        let signature = sign(SECRET, "msg_evt_1", now().unix_timestamp(), BODY);
        let headers = SvixHeaders {
            id: Some("msg_evt_1"),
            timestamp: Some(&ts),
            signature: Some(&signature),
        };

        let first = handler.handle_at(BODY, headers.clone(), now()).await.unwrap();
        let second = handler.handle_at(BODY, headers, now()).await.unwrap();
        assert_eq!(first, EmailEventOutcome::Recorded);
        assert_eq!(second, EmailEventOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_tampered_body_rejected() {
        let handler = handler(Arc::new(MemoryStore::new()));
        let ts = now().unix_timestamp().to_string();
        let signature = sign(SECRET, "msg_evt_1", now().unix_timestamp(), BODY);
        let tampered = BODY.replace("bounced", "delivered");
        let result = handler
            .handle_at(
                &tampered,
                SvixHeaders {
                    id: Some("msg_evt_1"),
                    timestamp: Some(&ts),
                    signature: Some(&signature),
                },
                now(),
            )
            .await;
        assert!(matches!(
            result,
            Err(BillingError::WebhookRejected(Rejection::SignatureMismatch))
        ));
    }

    #[tokio::test]
    async fn test_missing_headers_rejected() {
        let handler = handler(Arc::new(MemoryStore::new()));
        let result = handler.handle_at(BODY, SvixHeaders::default(), now()).await;
        assert!(matches!(
            result,
            Err(BillingError::WebhookRejected(Rejection::MissingSignature))
        ));
    }

    #[tokio::test]
    async fn test_overflowing_timestamp_rejected() {
        let handler = handler(Arc::new(MemoryStore::new()));
        let ts = i64::MIN.to_string();
        let result = handler
            .handle_at(
                BODY,
                SvixHeaders {
                    id: Some("msg_evt_1"),
                    timestamp: Some(&ts),
                    signature: Some("v1,AAAA"),
                },
                now(),
            )
            .await;
        assert!(matches!(
            result,
            Err(BillingError::WebhookRejected(Rejection::MalformedSignature))
        ));
    }

    #[tokio::test]
    async fn test_unknown_type_ignored() {
        let handler = EmailEventHandler::new(None, Environment::Development, Arc::new(MemoryStore::new()));
        let body = r#"{"type":"email.delivery_delayed","data":{"email_id":"msg_2"}}"#;
        let outcome = handler.handle_at(body, SvixHeaders::default(), now()).await.unwrap();
        assert_eq!(outcome, EmailEventOutcome::Ignored);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(delivery_status("email.opened"), Some(DeliveryStatus::Opened));
        assert_eq!(delivery_status("email.scheduled"), None);
    }
}
