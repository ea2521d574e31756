//! Application state

use std::sync::Arc;

use retreat_billing::BillingService;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(billing: BillingService, config: Config) -> Self {
        Self {
            billing: Arc::new(billing),
            config: Arc::new(config),
        }
    }
}
