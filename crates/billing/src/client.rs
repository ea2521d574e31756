//! Stripe client and credentials

use std::time::Duration;

use crate::config::non_empty_var;
use crate::error::{BillingError, BillingResult};

pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// Webhook signing secret; verification fails closed in production without it
    pub webhook_secret: Option<String>,
    /// Upper bound on any single gateway call
    pub timeout: Duration,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"[redacted]")
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "[redacted]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = non_empty_var("STRIPE_SECRET_KEY")
            .ok_or_else(|| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;

        let timeout = match non_empty_var("GATEWAY_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(raw.parse().map_err(|_| {
                BillingError::Config(format!("GATEWAY_TIMEOUT_SECS has invalid value '{}'", raw))
            })?),
            None => DEFAULT_GATEWAY_TIMEOUT,
        };

        Ok(Self {
            secret_key,
            webhook_secret: non_empty_var("STRIPE_WEBHOOK_SECRET"),
            timeout,
        })
    }
}

/// Stripe SDK client plus the raw credentials for endpoints called over plain HTTP
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            inner: stripe::Client::new(config.secret_key.clone()),
            config,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secrets() {
        let config = StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: Some("whsec_abc".to_string()),
            timeout: DEFAULT_GATEWAY_TIMEOUT,
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("sk_test_123"));
        assert!(!rendered.contains("whsec_abc"));
    }
}
