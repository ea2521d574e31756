//! Server configuration

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Shared bearer secret for `/cron/*` and `/admin/*`; `None` rejects every call
    pub cron_secret: Option<String>,
    pub run_migrations: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let cron_secret = std::env::var("CRON_SECRET")
            .ok()
            .filter(|s| !s.trim().is_empty());
        if cron_secret.is_none() {
            tracing::warn!("CRON_SECRET not set - cron and admin endpoints will reject every call");
        }

        let run_migrations = match std::env::var("RUN_MIGRATIONS") {
            Ok(v) => parse_bool(&v).with_context(|| format!("RUN_MIGRATIONS: invalid value {:?}", v))?,
            Err(_) => true,
        };

        Ok(Self {
            database_url,
            bind_address,
            cron_secret,
            run_migrations,
        })
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" off "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
