//! Billing configuration loaded from the environment

use std::str::FromStr;

use time::Duration;

use crate::error::{BillingError, BillingResult};
use crate::policy::RetryPolicy;

/// Deployment environment. Signature verification fails closed in production.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Staging,
    Development,
    Test,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl FromStr for Environment {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "staging" => Ok(Environment::Staging),
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            other => Err(BillingError::Config(format!("unknown APP_ENV '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub resend_api_key: Option<String>,
    pub from_address: String,
    pub admin_address: String,
    /// Signing secret for the provider's delivery-status webhook
    pub webhook_secret: Option<String>,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            resend_api_key: non_empty_var("RESEND_API_KEY"),
            from_address: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Retreat Bookings <bookings@localhost>".to_string()),
            admin_address: std::env::var("ADMIN_EMAIL")
                .unwrap_or_else(|_| "admin@localhost".to_string()),
            webhook_secret: non_empty_var("RESEND_WEBHOOK_SECRET"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub environment: Environment,
    pub retry: RetryPolicy,
    /// Spacing between installment due dates when a schedule is materialized
    pub installment_interval: Duration,
    /// Whether the first successful payment confirms a pending booking
    pub auto_confirm: bool,
    /// Where the gateway's payment-method portal sends the guest back to
    pub portal_return_url: String,
    /// Link used in failure emails when no portal session can be created
    pub payment_update_fallback_url: String,
    pub email: EmailConfig,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            retry: RetryPolicy::default(),
            installment_interval: Duration::days(30),
            auto_confirm: true,
            portal_return_url: "http://localhost:3000/bookings".to_string(),
            payment_update_fallback_url: "http://localhost:3000/bookings/payment".to_string(),
            email: EmailConfig {
                resend_api_key: None,
                from_address: "Retreat Bookings <bookings@localhost>".to_string(),
                admin_address: "admin@localhost".to_string(),
                webhook_secret: None,
            },
        }
    }
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();
        let environment = match std::env::var("APP_ENV") {
            Ok(value) => value.parse()?,
            Err(_) => Environment::Development,
        };

        let retry = RetryPolicy {
            max_attempts: parse_var("PAYMENT_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            retry_interval: Duration::hours(parse_var("PAYMENT_RETRY_HOURS", 24)?),
            deadline_window: Duration::days(parse_var("PAYMENT_DEADLINE_DAYS", 14)?),
            processing_timeout: Duration::minutes(parse_var(
                "PAYMENT_PROCESSING_TIMEOUT_MINUTES",
                30,
            )?),
        };

        if retry.max_attempts < 1 {
            return Err(BillingError::Config(
                "PAYMENT_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            environment,
            retry,
            installment_interval: Duration::days(parse_var("INSTALLMENT_INTERVAL_DAYS", 30)?),
            auto_confirm: parse_var("BOOKING_AUTO_CONFIRM", true)?,
            portal_return_url: std::env::var("PAYMENT_UPDATE_RETURN_URL")
                .unwrap_or(defaults.portal_return_url),
            payment_update_fallback_url: std::env::var("PAYMENT_UPDATE_FALLBACK_URL")
                .unwrap_or(defaults.payment_update_fallback_url),
            email: EmailConfig::from_env(),
        })
    }
}

pub(crate) fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &str, default: T) -> BillingResult<T> {
    match non_empty_var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has invalid value '{}'", name, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parsing() {
        assert_eq!("production".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("dev".parse::<Environment>().unwrap(), Environment::Development);
        assert!("moon".parse::<Environment>().is_err());
        assert!(Environment::Production.is_production());
        assert!(!Environment::Staging.is_production());
    }
}
