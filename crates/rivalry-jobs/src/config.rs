use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rivalry_runner::ExecutionMode;
use serde::Deserialize;
use tracing::warn;

/// Backoff and deadline settings for one polling session.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOptions {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_duration: Duration,
    pub backoff_multiplier: f64,
}

/// Shortest wait between two status fetches.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl PollOptions {
    /// Clamps intervals to at least [`MIN_POLL_INTERVAL`] and replaces a multiplier
    /// that is not finite or below 1 with the default.
    pub fn sanitized(self) -> Self {
        let defaults = Self::default();
        let initial_interval = self.initial_interval.max(MIN_POLL_INTERVAL);
        let max_interval = self.max_interval.max(MIN_POLL_INTERVAL);
        let backoff_multiplier = if self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0 {
            self.backoff_multiplier
        } else {
            defaults.backoff_multiplier
        };
        let sanitized = Self {
            initial_interval,
            max_interval,
            max_duration: self.max_duration,
            backoff_multiplier,
        };
        if sanitized != self {
            warn!(
                initial_ms = sanitized.initial_interval.as_millis() as u64,
                max_ms = sanitized.max_interval.as_millis() as u64,
                multiplier = sanitized.backoff_multiplier,
                "poll options out of range; adjusted"
            );
        }
        sanitized
    }
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(2_000),
            max_interval: Duration::from_millis(10_000),
            max_duration: Duration::from_millis(600_000),
            backoff_multiplier: 1.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub database_url: Option<String>,
    pub runner_base_url: Option<String>,
    pub runner_api_key: Option<String>,
    pub runner_mode: ExecutionMode,
    pub runner_http_timeout_secs: u64,
    pub triggered_by: String,
    pub analysis_freshness_days: i64,
    pub source_lookback_days: i64,
    pub brands_file: PathBuf,
    pub scheduler_enabled: bool,
    pub scrape_cron: String,
    pub web_port: u16,
    pub poll: PollOptions,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            runner_base_url: None,
            runner_api_key: None,
            runner_mode: ExecutionMode::Local,
            runner_http_timeout_secs: 20,
            triggered_by: "rivalry".to_string(),
            analysis_freshness_days: 30,
            source_lookback_days: 30,
            brands_file: PathBuf::from("brands.yaml"),
            scheduler_enabled: false,
            scrape_cron: "0 0 6 * * *".to_string(),
            web_port: 8000,
            poll: PollOptions::default(),
        }
    }
}

impl JobsConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let poll = PollOptions {
            initial_interval: env_millis("POLL_INITIAL_INTERVAL_MS").unwrap_or(defaults.poll.initial_interval),
            max_interval: env_millis("POLL_MAX_INTERVAL_MS").unwrap_or(defaults.poll.max_interval),
            max_duration: env_millis("POLL_MAX_DURATION_MS").unwrap_or(defaults.poll.max_duration),
            backoff_multiplier: env_parse("POLL_BACKOFF_MULTIPLIER").unwrap_or(defaults.poll.backoff_multiplier),
        }
        .sanitized();

        let runner_mode = match std::env::var("RUNNER_MODE") {
            Ok(raw) => raw.parse().unwrap_or_else(|err| {
                warn!("{err}; falling back to local runner mode");
                ExecutionMode::Local
            }),
            Err(_) => defaults.runner_mode,
        };

        Self {
            database_url: env_non_empty("DATABASE_URL"),
            runner_base_url: env_non_empty("RUNNER_BASE_URL"),
            runner_api_key: env_non_empty("RUNNER_API_KEY"),
            runner_mode,
            runner_http_timeout_secs: env_parse("RUNNER_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.runner_http_timeout_secs),
            triggered_by: env_non_empty("RIVALRY_TRIGGERED_BY").unwrap_or(defaults.triggered_by),
            analysis_freshness_days: env_parse::<i64>("ANALYSIS_FRESHNESS_DAYS")
                .unwrap_or(defaults.analysis_freshness_days)
                .clamp(1, 180),
            source_lookback_days: env_parse::<i64>("SOURCE_LOOKBACK_DAYS")
                .unwrap_or(defaults.source_lookback_days)
                .clamp(7, 180),
            brands_file: env_non_empty("RIVALRY_BRANDS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.brands_file),
            scheduler_enabled: std::env::var("RIVALRY_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            scrape_cron: env_non_empty("SCRAPE_CRON").unwrap_or(defaults.scrape_cron),
            web_port: env_parse("RIVALRY_WEB_PORT").unwrap_or(defaults.web_port),
            poll,
        }
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrandRegistry {
    #[serde(default)]
    pub brands: Vec<BrandEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrandEntry {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Enabled brand ids from the registry file. A missing file yields an empty list.
pub fn load_known_brands(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let registry: BrandRegistry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(registry
        .brands
        .into_iter()
        .filter(|b| b.enabled)
        .map(|b| b.id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect())
}
