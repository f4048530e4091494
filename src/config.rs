use anyhow::{Context, Result};
use reqwest::Url;
use std::env;
use std::time::Duration;

use crate::query::RetryPolicy;

pub const DEFAULT_API_URL: &str = "http://localhost:8080";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub const API_URL_VAR: &str = "APPTRACK_API_URL";
pub const TIMEOUT_VAR: &str = "APPTRACK_TIMEOUT_SECS";
pub const RETRY_ATTEMPTS_VAR: &str = "APPTRACK_RETRY_ATTEMPTS";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Url,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            base_url: parse_base_url(base_url)?,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
        })
    }

    /// Reads `APPTRACK_API_URL`, `APPTRACK_TIMEOUT_SECS` and
    /// `APPTRACK_RETRY_ATTEMPTS`, falling back to defaults for unset values.
    pub fn from_env() -> Result<Self> {
        let mut config = match env::var(API_URL_VAR) {
            Ok(url) => Self::new(&url).with_context(|| format!("{} is not a valid URL", API_URL_VAR))?,
            Err(_) => Self::new(DEFAULT_API_URL)?,
        };

        if let Ok(secs) = env::var(TIMEOUT_VAR) {
            let secs: u64 = secs
                .trim()
                .parse()
                .with_context(|| format!("{} must be a whole number of seconds", TIMEOUT_VAR))?;
            config.timeout = Duration::from_secs(secs);
        }

        if let Ok(attempts) = env::var(RETRY_ATTEMPTS_VAR) {
            let attempts: u32 = attempts
                .trim()
                .parse()
                .with_context(|| format!("{} must be a positive integer", RETRY_ATTEMPTS_VAR))?;
            if attempts == 0 {
                anyhow::bail!("{} must be a positive integer", RETRY_ATTEMPTS_VAR);
            }
            config.retry.max_attempts = attempts;
        }

        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: &str) -> Result<Self> {
        self.base_url = parse_base_url(base_url)?;
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).with_context(|| format!("Invalid API URL '{}'", raw))?;
    if url.cannot_be_a_base() {
        anyhow::bail!("API URL '{}' cannot be used as a base URL", raw);
    }
    Ok(url)
}
