//! Shared-secret authentication for the cron trigger and admin endpoints

mod middleware;


pub use middleware::{extract_bearer_token, require_cron_secret, secret_matches};
