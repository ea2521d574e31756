//! Guest and admin notifications
//!
//! The engine emits typed `Notification`s; delivery is the notifier's concern and
//! never feeds back into payment state. Guest-facing messages carry no gateway or
//! storage error text.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use time::{Date, OffsetDateTime};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::config::EmailConfig;
use crate::error::{BillingError, BillingResult};

const RESEND_EMAILS_URL: &str = "https://api.resend.com/emails";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Guest {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NextInstallment {
    pub due_date: Date,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    BookingConfirmed {
        booking_id: Uuid,
        guest: Guest,
        amount_paid: Decimal,
        currency: String,
    },
    PaymentSucceeded {
        booking_id: Uuid,
        guest: Guest,
        amount: Decimal,
        currency: String,
        next_due: Option<NextInstallment>,
    },
    PaymentFailed {
        booking_id: Uuid,
        guest: Guest,
        amount: Decimal,
        currency: String,
        deadline: OffsetDateTime,
        update_url: String,
    },
    BookingCancelledNonPayment {
        booking_id: Uuid,
        guest: Guest,
    },
    AdminPaymentFailed {
        booking_id: Uuid,
        guest_name: String,
        amount: Decimal,
        currency: String,
        reason: String,
        attempt: i32,
        deadline: OffsetDateTime,
    },
    AdminNewBooking {
        booking_id: Uuid,
        guest_name: String,
        guest_email: String,
        total_amount: Decimal,
        currency: String,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::BookingConfirmed { .. } => "booking_confirmed",
            Notification::PaymentSucceeded { .. } => "payment_succeeded",
            Notification::PaymentFailed { .. } => "payment_failed",
            Notification::BookingCancelledNonPayment { .. } => "booking_cancelled_non_payment",
            Notification::AdminPaymentFailed { .. } => "admin_payment_failed",
            Notification::AdminNewBooking { .. } => "admin_new_booking",
        }
    }

    pub fn booking_id(&self) -> Uuid {
        match self {
            Notification::BookingConfirmed { booking_id, .. }
            | Notification::PaymentSucceeded { booking_id, .. }
            | Notification::PaymentFailed { booking_id, .. }
            | Notification::BookingCancelledNonPayment { booking_id, .. }
            | Notification::AdminPaymentFailed { booking_id, .. }
            | Notification::AdminNewBooking { booking_id, .. } => *booking_id,
        }
    }

    /// Guest address, or `None` for admin notifications
    pub fn guest_email(&self) -> Option<&str> {
        match self {
            Notification::BookingConfirmed { guest, .. }
            | Notification::PaymentSucceeded { guest, .. }
            | Notification::PaymentFailed { guest, .. }
            | Notification::BookingCancelledNonPayment { guest, .. } => Some(&guest.email),
            Notification::AdminPaymentFailed { .. } | Notification::AdminNewBooking { .. } => None,
        }
    }

    pub fn subject(&self) -> String {
        match self {
            Notification::BookingConfirmed { .. } => "Your retreat booking is confirmed".to_string(),
            Notification::PaymentSucceeded { .. } => "Payment received".to_string(),
            Notification::PaymentFailed { .. } => {
                "Action needed: your payment could not be processed".to_string()
            }
            Notification::BookingCancelledNonPayment { .. } => {
                "Your retreat booking has been cancelled".to_string()
            }
            Notification::AdminPaymentFailed { guest_name, .. } => {
                format!("Payment failed for {}", guest_name)
            }
            Notification::AdminNewBooking { guest_name, .. } => {
                format!("New booking from {}", guest_name)
            }
        }
    }

    pub fn body(&self) -> String {
        match self {
            Notification::BookingConfirmed {
                guest,
                amount_paid,
                currency,
                ..
            } => format!(
                "Hi {},\n\nWe received your payment of {} {} and your booking is confirmed.",
                guest.name,
                amount_paid,
                currency.to_uppercase()
            ),
            Notification::PaymentSucceeded {
                guest,
                amount,
                currency,
                next_due,
                ..
            } => {
                let next = match next_due {
                    Some(next) => format!(
                        "Your next installment of {} {} is due on {}.",
                        next.amount,
                        currency.to_uppercase(),
                        next.due_date
                    ),
                    None => "Your booking is now fully paid.".to_string(),
                };
                format!(
                    "Hi {},\n\nWe received your payment of {} {}. {}",
                    guest.name,
                    amount,
                    currency.to_uppercase(),
                    next
                )
            }
            Notification::PaymentFailed {
                guest,
                amount,
                currency,
                deadline,
                update_url,
                ..
            } => format!(
                "Hi {},\n\nWe could not process your payment of {} {}. Please update your \
                 payment method before {} to keep your booking:\n\n{}",
                guest.name,
                amount,
                currency.to_uppercase(),
                deadline.date(),
                update_url
            ),
            Notification::BookingCancelledNonPayment { guest, .. } => format!(
                "Hi {},\n\nYour booking was cancelled because an outstanding payment was not \
                 completed before its deadline.",
                guest.name
            ),
            Notification::AdminPaymentFailed {
                booking_id,
                guest_name,
                amount,
                currency,
                reason,
                attempt,
                deadline,
            } => format!(
                "Booking {} ({}): charge of {} {} failed on attempt {}.\nReason: {}\nDeadline: {}",
                booking_id,
                guest_name,
                amount,
                currency.to_uppercase(),
                attempt,
                reason,
                deadline
            ),
            Notification::AdminNewBooking {
                booking_id,
                guest_name,
                guest_email,
                total_amount,
                currency,
            } => format!(
                "Booking {} from {} <{}>, total {} {}.",
                booking_id,
                guest_name,
                guest_email,
                total_amount,
                currency.to_uppercase()
            ),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> BillingResult<()>;
}

#[derive(Debug, Serialize)]
struct ResendEmail<'a> {
    from: &'a str,
    to: Vec<&'a str>,
    subject: String,
    text: String,
}

/// Sends through the Resend HTTP API
#[derive(Clone)]
pub struct EmailNotifier {
    http: reqwest::Client,
    config: EmailConfig,
}

impl EmailNotifier {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.resend_api_key.is_some()
    }

    async fn post(&self, api_key: &str, email: &ResendEmail<'_>) -> BillingResult<()> {
        let response = self
            .http
            .post(RESEND_EMAILS_URL)
            .bearer_auth(api_key)
            .timeout(Duration::from_secs(10))
            .json(email)
            .send()
            .await
            .map_err(|e| BillingError::Internal(format!("email request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(BillingError::Internal(format!(
                "email provider returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn send(&self, notification: &Notification) -> BillingResult<()> {
        let Some(api_key) = self.config.resend_api_key.as_deref() else {
            tracing::debug!(
                kind = notification.kind(),
                booking_id = %notification.booking_id(),
                "Email disabled (RESEND_API_KEY not set) - skipping notification"
            );
            return Ok(());
        };

        let to = notification
            .guest_email()
            .unwrap_or(self.config.admin_address.as_str());
        let email = ResendEmail {
            from: &self.config.from_address,
            to: vec![to],
            subject: notification.subject(),
            text: notification.body(),
        };

        let strategy = ExponentialBackoff::from_millis(200)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(3);
        Retry::spawn(strategy, || self.post(api_key, &email)).await?;

        tracing::info!(
            kind = notification.kind(),
            booking_id = %notification.booking_id(),
            "Notification sent"
        );
        Ok(())
    }
}

/// Fire-and-forget front for a `Notifier`: delivery errors are logged, never returned
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    pub async fn dispatch(&self, notification: Notification) {
        if let Err(e) = self.notifier.send(&notification).await {
            tracing::error!(
                kind = notification.kind(),
                booking_id = %notification.booking_id(),
                error = %e,
                "Failed to deliver notification"
            );
        }
    }
}
