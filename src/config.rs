//! Immutable, startup-only configuration loaded from the environment:
//! three book base URLs/credentials and the rate-limit knobs for each.

use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub server_port: u16,

    pub primary_base_url: String,
    pub primary_api_key: String,

    pub competitor_a_base_url: String,
    pub competitor_a_api_key: String,

    pub competitor_b_base_url: String,
    pub competitor_b_api_key: String,

    pub primary_max_in_flight: usize,
    pub competitor_a_max_in_flight: usize,
    pub competitor_b_max_in_flight: usize,
    pub competitor_b_min_spacing: Duration,

    pub request_timeout: Duration,
    pub retry_max_attempts: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, crate::errors::ScrapeError> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| crate::errors::ScrapeError::Configuration("DATABASE_URL must be set".into()))?;

        let port_str = env::var("PORT").unwrap_or_else(|_| "8080".to_string());
        let server_port = port_str
            .parse()
            .map_err(|_| crate::errors::ScrapeError::Configuration(format!("invalid PORT '{port_str}'")))?;

        Ok(Self {
            database_url,
            server_port,

            primary_base_url: env::var("PRIMARY_BASE_URL").unwrap_or_default(),
            primary_api_key: env::var("PRIMARY_API_KEY").unwrap_or_default(),

            competitor_a_base_url: env::var("COMPETITOR_A_BASE_URL").unwrap_or_default(),
            competitor_a_api_key: env::var("COMPETITOR_A_API_KEY").unwrap_or_default(),

            competitor_b_base_url: env::var("COMPETITOR_B_BASE_URL").unwrap_or_default(),
            competitor_b_api_key: env::var("COMPETITOR_B_API_KEY").unwrap_or_default(),

            primary_max_in_flight: env_parse("PRIMARY_MAX_IN_FLIGHT", 50),
            competitor_a_max_in_flight: env_parse("COMPETITOR_A_MAX_IN_FLIGHT", 50),
            competitor_b_max_in_flight: env_parse("COMPETITOR_B_MAX_IN_FLIGHT", 15),
            competitor_b_min_spacing: Duration::from_millis(env_parse("COMPETITOR_B_MIN_SPACING_MS", 25)),

            request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT_SECS", 10)),
            retry_max_attempts: env_parse("RETRY_MAX_ATTEMPTS", 3),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
