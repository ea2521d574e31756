//! Retreat background worker
//!
//! Triggers the API's reconciliation endpoint on a fixed schedule:
//! - Reconciliation run (expiry, due payments, repair) on `RECONCILE_CRON`, hourly by default
//! - Heartbeat every 5 minutes

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_SCHEDULE: &str = "0 0 * * * *";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

struct WorkerConfig {
    reconcile_url: String,
    cron_secret: String,
    schedule: String,
}

impl WorkerConfig {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            reconcile_url: std::env::var("RECONCILE_URL").context("RECONCILE_URL must be set")?,
            cron_secret: std::env::var("CRON_SECRET")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .context("CRON_SECRET must be set")?,
            schedule: std::env::var("RECONCILE_CRON")
                .unwrap_or_else(|_| DEFAULT_SCHEDULE.to_string()),
        })
    }
}

/// Only the counters; the full report stays in the API logs
#[derive(Debug, Default, Deserialize)]
struct PassCounts {
    processed: usize,
    succeeded: usize,
    failed: usize,
    skipped: usize,
    cancelled: usize,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RunReport {
    #[serde(default)]
    expiry: PassCounts,
    #[serde(default)]
    due: PassCounts,
    #[serde(default)]
    repair: PassCounts,
}

fn log_pass(pass: &str, counts: &PassCounts) {
    info!(
        pass = pass,
        processed = counts.processed,
        succeeded = counts.succeeded,
        failed = counts.failed,
        skipped = counts.skipped,
        cancelled = counts.cancelled,
        errors = counts.errors.len(),
        "Reconciliation pass complete"
    );
}

struct Trigger {
    client: reqwest::Client,
    url: String,
    secret: String,
}

impl Trigger {
    async fn run(&self) {
        let response = match self
            .client
            .post(&self.url)
            .bearer_auth(&self.secret)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Reconciliation trigger request failed");
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            error!(status = %status, "Reconciliation endpoint returned an error");
            return;
        }

        match response.json::<RunReport>().await {
            Ok(report) => {
                log_pass("expiry", &report.expiry);
                log_pass("due", &report.due);
                log_pass("repair", &report.repair);
                let errors =
                    report.expiry.errors.len() + report.due.errors.len() + report.repair.errors.len();
                if errors > 0 {
                    warn!(errors, "Reconciliation run reported item errors");
                }
            }
            Err(e) => warn!(error = %e, "Reconciliation ran but the report could not be parsed"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting retreat worker");

    let config = WorkerConfig::from_env()?;
    let trigger = Arc::new(Trigger {
        client: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?,
        url: config.reconcile_url,
        secret: config.cron_secret,
    });

    let scheduler = JobScheduler::new().await?;

    // Job 1: Reconciliation run
    let reconcile_trigger = trigger.clone();
    scheduler
        .add(Job::new_async(config.schedule.as_str(), move |_uuid, _l| {
            let trigger = reconcile_trigger.clone();
            Box::pin(async move {
                info!("Running scheduled reconciliation");
                trigger.run().await;
            })
        })?)
        .await?;
    info!(schedule = %config.schedule, "Scheduled: Reconciliation run");

    // Job 2: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    // The scheduler runs jobs in background tasks
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received - stopping worker");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_parses_api_summary() {
        let body = r#"{
            "started_at": "2026-03-01T09:00:00Z",
            "expiry": {"processed": 1, "succeeded": 0, "failed": 0, "skipped": 0, "cancelled": 1, "errors": []},
            "due": {"processed": 3, "succeeded": 2, "failed": 1, "skipped": 0, "cancelled": 0,
                    "errors": [{"booking_id": "00000000-0000-0000-0000-000000000000", "entry_id": null, "error": "x"}]},
            "repair": {"processed": 0, "succeeded": 0, "failed": 0, "skipped": 0, "cancelled": 0, "errors": []}
        }"#;
        let report: RunReport = serde_json::from_str(body).unwrap();
        assert_eq!(report.expiry.cancelled, 1);
        assert_eq!(report.due.succeeded, 2);
        assert_eq!(report.due.errors.len(), 1);
    }
}
