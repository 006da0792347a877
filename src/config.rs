//! Runtime configuration.
//!
//! The service is configured entirely through environment variables, with
//! defaults matching the documented recommendations. Env names follow the
//! upstream deployment's conventions (CONFIDENCE_THRESHOLD, MAX_RETRIES,
//! RETRY_INTERVAL) where they map.

use std::path::PathBuf;
use std::time::Duration;

/// Application-level constants
pub const APP_NAME: &str = "Secondlook";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tracing filter when RUST_LOG is unset.
pub fn default_log_filter() -> &'static str {
    "info,secondlook=debug"
}

/// Get the application data directory
/// ~/Secondlook/ on all platforms (user-visible, holds store + state DB)
pub fn app_data_dir() -> PathBuf {
    let home = dirs::home_dir().expect("Cannot determine home directory");
    home.join(APP_NAME)
}

/// All tunables for one service instance.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Scalar fields below this confidence are routed to review.
    /// Applied uniformly regardless of blueprint.
    pub confidence_threshold: f32,
    /// Attempts per external call (first try included).
    pub max_attempts: u32,
    /// First backoff delay; doubles per attempt by default.
    pub retry_base: Duration,
    pub retry_multiplier: u32,
    /// Wall-clock bound on a whole pipeline instance.
    pub pipeline_timeout: Duration,
    /// How often the coordinator sweeps for overdue instances.
    pub sweep_interval: Duration,
    /// How often the intake watcher rescans the store.
    pub poll_interval: Duration,
    pub data_dir: PathBuf,
    pub extraction_url: String,
    pub review_url: String,
    pub http_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.70,
            max_attempts: 3,
            retry_base: Duration::from_secs(1),
            retry_multiplier: 2,
            pipeline_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
            data_dir: app_data_dir(),
            extraction_url: "http://localhost:8091".into(),
            review_url: "http://localhost:8092".into(),
            http_timeout_secs: 30,
        }
    }
}

impl Settings {
    /// Read settings from the environment, falling back to defaults for
    /// anything unset or unparseable (logged at warn).
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Settings {
            confidence_threshold: env_parse("CONFIDENCE_THRESHOLD", defaults.confidence_threshold),
            max_attempts: env_parse("MAX_RETRIES", defaults.max_attempts),
            retry_base: Duration::from_secs(env_parse(
                "RETRY_INTERVAL",
                defaults.retry_base.as_secs(),
            )),
            retry_multiplier: env_parse("RETRY_MULTIPLIER", defaults.retry_multiplier),
            pipeline_timeout: Duration::from_secs(env_parse(
                "PIPELINE_TIMEOUT",
                defaults.pipeline_timeout.as_secs(),
            )),
            sweep_interval: Duration::from_secs(env_parse(
                "SWEEP_INTERVAL",
                defaults.sweep_interval.as_secs(),
            )),
            poll_interval: Duration::from_secs(env_parse(
                "POLL_INTERVAL",
                defaults.poll_interval.as_secs(),
            )),
            data_dir: std::env::var("SECONDLOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            extraction_url: std::env::var("EXTRACTION_SERVICE_URL")
                .unwrap_or(defaults.extraction_url),
            review_url: std::env::var("REVIEW_SERVICE_URL").unwrap_or(defaults.review_url),
            http_timeout_secs: env_parse("HTTP_TIMEOUT", defaults.http_timeout_secs),
        }
    }
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(name, raw = %raw, "Unparseable env value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
