//! Configuration loader and validator for the dispatch engine.
use crate::batch::BatchOptions;
use crate::model::Platform;
use crate::retry::RetryPolicies;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub batch: Batch,
    #[serde(default)]
    pub retry: RetryPolicies,
    #[serde(default)]
    pub publishers: HashMap<Platform, Publisher>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    /// Wall-clock budget for one scheduler run.
    #[serde(default = "default_run_budget_seconds")]
    pub run_budget_seconds: u64,
}

fn default_run_budget_seconds() -> u64 {
    300
}

/// Fan-out settings for per-post platform dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Batch {
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
    /// 0 disables the per-attempt timeout.
    pub attempt_timeout_ms: u64,
}

impl Default for Batch {
    fn default() -> Self {
        Self {
            batch_size: 5,
            inter_batch_delay_ms: 1000,
            attempt_timeout_ms: 30_000,
        }
    }
}

impl Batch {
    pub fn options(&self) -> BatchOptions {
        BatchOptions {
            batch_size: self.batch_size,
            inter_batch_delay: Duration::from_millis(self.inter_batch_delay_ms),
            retry: None,
            attempt_timeout: (self.attempt_timeout_ms > 0)
                .then(|| Duration::from_millis(self.attempt_timeout_ms)),
        }
    }
}

/// Gateway endpoint used by the webhook publisher for one platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Publisher {
    pub endpoint: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.resolved_data_dir())
    }

    /// `app.data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.app.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.app.data_dir.clone(),
            },
            None => self.app.data_dir.clone(),
        }
    }

    /// `DATABASE_URL` if set, otherwise a SQLite file under the data dir.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/postrelay.db", self.resolved_data_dir()))
    }

    pub fn run_budget(&self) -> Duration {
        Duration::from_secs(self.app.run_budget_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.app.poll_interval_ms)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<Config, ConfigError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.run_budget_seconds == 0 {
        return Err(ConfigError::Invalid("app.run_budget_seconds must be > 0"));
    }

    if cfg.batch.batch_size == 0 {
        return Err(ConfigError::Invalid("batch.batch_size must be > 0"));
    }

    let retry = &cfg.retry.default;
    if !(retry.backoff_multiplier.is_finite() && retry.backoff_multiplier >= 1.0) {
        return Err(ConfigError::Invalid("retry.backoff_multiplier must be >= 1"));
    }
    if retry.max_delay_ms < retry.base_delay_ms {
        return Err(ConfigError::Invalid(
            "retry.max_delay_ms must be >= retry.base_delay_ms",
        ));
    }
    for platform in cfg.retry.platforms.keys() {
        let effective = cfg.retry.for_platform(*platform);
        if effective.max_delay_ms < effective.base_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.platforms.*.max_delay_ms must be >= base_delay_ms",
            ));
        }
    }

    for publisher in cfg.publishers.values() {
        if publisher.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("publishers.*.endpoint must be non-empty"));
        }
    }

    Ok(())
}

/// Returns the canonical example YAML.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 60000
  run_budget_seconds: 300

batch:
  batch_size: 5
  inter_batch_delay_ms: 1000
  attempt_timeout_ms: 30000

retry:
  max_retries: 3
  base_delay_ms: 1000
  max_delay_ms: 30000
  backoff_multiplier: 2.0
  jitter: true
  platforms:
    linkedin:
      base_delay_ms: 2000
      max_delay_ms: 60000
    instagram:
      max_retries: 2

publishers:
  twitter:
    endpoint: "https://gateway.example/publish/twitter"
  linkedin:
    endpoint: "https://gateway.example/publish/linkedin"
"#
}
