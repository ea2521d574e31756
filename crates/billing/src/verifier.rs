//! Gateway webhook signature verification
//!
//! The signature header has the form `t=<unix seconds>,v1=<hex hmac>[,v1=...]`.
//! The HMAC-SHA256 is computed over `"{t}.{raw body}"` with the endpoint secret.
//! Verification never touches storage.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

use crate::config::Environment;
use crate::events::GatewayEvent;

type HmacSha256 = Hmac<Sha256>;

/// Replay window for signed payloads
pub const TIMESTAMP_TOLERANCE: Duration = Duration::minutes(5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("signature header missing")]
    MissingSignature,
    #[error("signature header malformed")]
    MalformedSignature,
    #[error("webhook secret not configured")]
    SecretNotConfigured,
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("timestamp outside tolerance ({skew_secs}s)")]
    StaleTimestamp { skew_secs: i64 },
    #[error("payload is not a valid event")]
    MalformedPayload,
}

#[derive(Debug, Clone)]
pub struct EventVerifier {
    secret: Option<String>,
    environment: Environment,
    tolerance: Duration,
}

struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

impl EventVerifier {
    pub fn new(secret: Option<String>, environment: Environment) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            environment,
            tolerance: TIMESTAMP_TOLERANCE,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    /// Check authenticity and freshness, then parse the event
    pub fn verify(
        &self,
        raw_body: &str,
        signature_header: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<GatewayEvent, Rejection> {
        let secret = match &self.secret {
            Some(secret) => secret,
            None if self.environment.is_production() => {
                tracing::error!("Webhook secret not configured - rejecting event");
                return Err(Rejection::SecretNotConfigured);
            }
            None => {
                tracing::warn!(
                    environment = ?self.environment,
                    payload_len = raw_body.len(),
                    "Webhook secret not configured - accepting UNVERIFIED event outside production"
                );
                return parse_event(raw_body);
            }
        };

        let header = signature_header
            .filter(|h| !h.trim().is_empty())
            .ok_or(Rejection::MissingSignature)?;
        let parsed = parse_header(header)?;

        let skew_secs = now
            .unix_timestamp()
            .checked_sub(parsed.timestamp)
            .and_then(i64::checked_abs)
            .ok_or(Rejection::MalformedSignature)?;
        if Duration::seconds(skew_secs) > self.tolerance {
            tracing::warn!(
                timestamp = parsed.timestamp,
                now = now.unix_timestamp(),
                skew_secs,
                "Webhook timestamp outside tolerance"
            );
            return Err(Rejection::StaleTimestamp { skew_secs });
        }

        let signed_payload = format!("{}.{}", parsed.timestamp, raw_body);
        let matched = parsed.signatures.iter().any(|candidate| {
            match HmacSha256::new_from_slice(secret.as_bytes()) {
                Ok(mut mac) => {
                    mac.update(signed_payload.as_bytes());
                    mac.verify_slice(candidate).is_ok()
                }
                Err(_) => false,
            }
        });

        if !matched {
            tracing::warn!(payload_len = raw_body.len(), "Webhook signature mismatch");
            return Err(Rejection::SignatureMismatch);
        }

        parse_event(raw_body)
    }
}

fn parse_header(header: &str) -> Result<SignatureHeader, Rejection> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => {
                let bytes = hex::decode(value).map_err(|_| Rejection::MalformedSignature)?;
                signatures.push(bytes);
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(Rejection::MalformedSignature)?;
    if signatures.is_empty() {
        return Err(Rejection::MalformedSignature);
    }

    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

fn parse_event(raw_body: &str) -> Result<GatewayEvent, Rejection> {
    serde_json::from_str(raw_body).map_err(|e| {
        tracing::warn!(parse_error = %e, "Failed to parse webhook event JSON");
        Rejection::MalformedPayload
    })
}

/// Produce a signature header for `body`; the gateway's side of the scheme
pub fn sign(secret: &str, body: &str, timestamp: i64) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return format!("t={}", timestamp),
    };
    mac.update(format!("{}.{}", timestamp, body).as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}
