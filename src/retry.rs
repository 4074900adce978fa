//! Retry decisions for failed work items.
//!
//! Everything here is pure: given an error and how many attempts have already
//! failed, decide whether to try again and how long to wait first.

use crate::model::Platform;
use crate::platform::PublishError;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Backoff parameters. Defaults: 3 retries, 1s base, 30s cap, x2, jitter on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Per-platform adjustments; unset fields fall back to the default config.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryOverride {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay_ms: u64,
}

impl RetryDecision {
    pub fn stop() -> Self {
        Self {
            should_retry: false,
            delay_ms: 0,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Default config plus the per-destination override table, keyed by platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicies {
    #[serde(flatten)]
    pub default: RetryConfig,
    #[serde(default)]
    pub platforms: HashMap<Platform, RetryOverride>,
}

impl RetryPolicies {
    pub fn new(default: RetryConfig) -> Self {
        Self {
            default,
            platforms: HashMap::new(),
        }
    }

    pub fn with_override(mut self, platform: Platform, o: RetryOverride) -> Self {
        self.platforms.insert(platform, o);
        self
    }

    /// Effective config for `platform`. Multiplier and jitter always come from
    /// the default config.
    pub fn for_platform(&self, platform: Platform) -> RetryConfig {
        let mut cfg = self.default.clone();
        if let Some(o) = self.platforms.get(&platform) {
            if let Some(v) = o.max_retries {
                cfg.max_retries = v;
            }
            if let Some(v) = o.base_delay_ms {
                cfg.base_delay_ms = v;
            }
            if let Some(v) = o.max_delay_ms {
                cfg.max_delay_ms = v;
            }
        }
        cfg
    }
}

/// Decide what to do after the attempt with zero-based index `attempt` failed.
pub fn decide(error: &anyhow::Error, attempt: u32, config: &RetryConfig) -> RetryDecision {
    if attempt >= config.max_retries || !is_retryable(error) {
        return RetryDecision::stop();
    }
    let mut delay_ms = compute_delay_ms(attempt, config);
    if let Some(hint) = retry_after_hint(error) {
        let hint_ms = u64::try_from(hint.as_millis()).unwrap_or(u64::MAX);
        delay_ms = delay_ms.max(hint_ms).min(config.max_delay_ms);
    }
    RetryDecision {
        should_retry: true,
        delay_ms,
    }
}

/// `min(base * multiplier^attempt, max)`, scaled by a uniform factor in
/// `[0.5, 1.0]` when jitter is enabled.
pub fn compute_delay_ms(attempt: u32, config: &RetryConfig) -> u64 {
    let factor = if config.jitter {
        rand::thread_rng().gen_range(0.5..=1.0)
    } else {
        1.0
    };
    compute_delay_with_factor(attempt, config, factor)
}

fn compute_delay_with_factor(attempt: u32, config: &RetryConfig, factor: f64) -> u64 {
    let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
    let raw = config.base_delay_ms as f64 * config.backoff_multiplier.powi(exp);
    let capped = if raw.is_finite() {
        raw.min(config.max_delay_ms as f64)
    } else {
        config.max_delay_ms as f64
    };
    (capped * factor).round() as u64
}

/// A status code in an HTTP position: after `http`/`status`/`response`, at the
/// start of the message, or right after a `:` separator. Platform error codes
/// ("error 130") and OS errno values ("os error 104") are not statuses.
static STATUS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:\b(?:http|status|response)\D{0,8}|^\s*|:\s*)\b([1-5]\d{2})\b")
        .expect("status regex")
});

const TRANSIENT_PHRASES: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "connection",
    "econnreset",
    "econnrefused",
    "etimedout",
    "socket hang up",
    "rate limit",
    "rate-limit",
    "too many requests",
    "service unavailable",
    "temporarily unavailable",
    "bad gateway",
    "gateway timeout",
];

/// Platform error markers known to be transient.
const PLATFORM_TRANSIENT_MARKERS: &[&str] = &[
    "over capacity",
    "\"is_transient\":true",
    "is_transient: true",
    "flood_wait",
    "retry after",
    "please try again later",
];

/// Whether an error is worth retrying: network/timeout/connection problems,
/// rate limiting, 5xx responses and known transient platform markers.
pub fn is_retryable(error: &anyhow::Error) -> bool {
    for cause in error.chain() {
        if let Some(e) = cause.downcast_ref::<PublishError>() {
            return e.is_transient();
        }
        if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
            if e.is_timeout() || e.is_connect() {
                return true;
            }
            if let Some(status) = e.status() {
                return status_is_retryable(status.as_u16());
            }
        }
        if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return true;
        }
        if let Some(e) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind::*;
            if matches!(
                e.kind(),
                TimedOut | ConnectionReset | ConnectionRefused | ConnectionAborted | BrokenPipe
            ) {
                return true;
            }
        }
    }
    message_is_retryable(&format!("{:#}", error))
}

pub fn status_is_retryable(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Classify a bare error message. A 429/5xx status is retryable and any other
/// 4xx is not; everything else falls through to the transient phrases and
/// platform markers, matched case-insensitively.
pub fn message_is_retryable(message: &str) -> bool {
    let status = STATUS_RE
        .captures(message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok());
    match status {
        Some(s) if status_is_retryable(s) => return true,
        Some(s) if (400..500).contains(&s) => return false,
        _ => {}
    }
    let lower = message.to_ascii_lowercase();
    TRANSIENT_PHRASES
        .iter()
        .chain(PLATFORM_TRANSIENT_MARKERS)
        .any(|p| lower.contains(p))
}

fn retry_after_hint(error: &anyhow::Error) -> Option<Duration> {
    error
        .chain()
        .find_map(|c| c.downcast_ref::<PublishError>())
        .and_then(PublishError::retry_after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.base_delay_ms, 1000);
        assert_eq!(cfg.max_delay_ms, 30_000);
        assert_eq!(cfg.backoff_multiplier, 2.0);
        assert!(cfg.jitter);
    }

    #[test]
    fn backoff_doubles_and_clamps() {
        let cfg = no_jitter();
        let delays: Vec<u64> = (0..4).map(|a| compute_delay_ms(a, &cfg)).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000]);
        assert_eq!(compute_delay_ms(10, &cfg), 30_000);
        assert_eq!(compute_delay_ms(200, &cfg), 30_000);
    }

    #[test]
    fn jitter_stays_within_half_to_full() {
        let cfg = RetryConfig::default();
        for attempt in 0..5 {
            let full = compute_delay_with_factor(attempt, &cfg, 1.0);
            for _ in 0..50 {
                let d = compute_delay_ms(attempt, &cfg);
                assert!(d >= full / 2 && d <= full, "attempt {attempt}: {d}");
            }
        }
    }

    #[test]
    fn classifies_rate_limit_and_timeouts_as_retryable() {
        assert!(is_retryable(&anyhow!("HTTP 429 Too Many Requests")));
        assert!(is_retryable(&anyhow!("http 429 too many requests")));
        assert!(is_retryable(&anyhow!("Network Timeout while posting")));
        assert!(is_retryable(&anyhow!("NETWORK TIMEOUT")));
        assert!(is_retryable(&anyhow!("Rate Limit exceeded")));
        assert!(is_retryable(&anyhow!("status 503")));
        assert!(is_retryable(&anyhow!(PublishError::Http {
            status: 502,
            body: String::new()
        })));
        assert!(is_retryable(&anyhow!(PublishError::Timeout)));
    }

    #[test]
    fn classifies_client_errors_as_permanent() {
        assert!(!is_retryable(&anyhow!("HTTP 401 Unauthorized")));
        assert!(!is_retryable(&anyhow!("http 401 unauthorized")));
        assert!(!is_retryable(&anyhow!("status 400: invalid media")));
        assert!(!is_retryable(&anyhow!("content too long")));
        assert!(!is_retryable(&anyhow!(PublishError::Auth("expired".into()))));
        assert!(!is_retryable(&anyhow!(PublishError::Http {
            status: 401,
            body: "connection token invalid".into()
        })));
    }

    #[test]
    fn platform_markers_are_transient() {
        assert!(message_is_retryable("Twitter is over capacity"));
        assert!(message_is_retryable(r#"{"error":{"is_transient":true}}"#));
        assert!(message_is_retryable("FLOOD_WAIT_30"));
    }

    #[test]
    fn error_codes_that_are_not_http_statuses_do_not_decide() {
        for message in [
            "Connection reset by peer (os error 104)",
            "Connection timed out (os error 110)",
            "Twitter API error 130: Over capacity",
            "Telegram error 420: FLOOD_WAIT_30",
            "500 Internal Server Error",
            "Request failed: 503",
        ] {
            assert!(is_retryable(&anyhow!(message)), "{message}");
        }
        assert!(!is_retryable(&anyhow!("Request failed: 404")));
        assert!(!is_retryable(&anyhow!("403 Forbidden: connection revoked")));
        assert!(!is_retryable(&anyhow!("Instagram error 190: invalid media id")));
    }

    #[test]
    fn context_chain_is_inspected() {
        let err = anyhow::Error::new(PublishError::Http {
            status: 500,
            body: String::new(),
        })
        .context("publishing to linkedin");
        assert!(is_retryable(&err));
    }

    #[test]
    fn decide_respects_max_retries() {
        let cfg = no_jitter();
        let err = anyhow!("HTTP 500");
        let d = decide(&err, 0, &cfg);
        assert!(d.should_retry);
        assert_eq!(d.delay_ms, 1000);
        assert!(decide(&err, 2, &cfg).should_retry);
        assert!(!decide(&err, 3, &cfg).should_retry);
        assert!(!decide(&anyhow!("HTTP 403"), 0, &cfg).should_retry);
    }

    #[test]
    fn retry_after_hint_extends_delay_within_cap() {
        let cfg = no_jitter();
        let err = anyhow!(PublishError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        });
        assert_eq!(decide(&err, 0, &cfg).delay_ms, 5000);
        let err = anyhow!(PublishError::RateLimited {
            retry_after: Some(Duration::from_secs(600)),
        });
        assert_eq!(decide(&err, 0, &cfg).delay_ms, 30_000);
    }

    #[test]
    fn platform_override_falls_back_to_default() {
        let policies = RetryPolicies::new(no_jitter()).with_override(
            Platform::Linkedin,
            RetryOverride {
                base_delay_ms: Some(5000),
                ..Default::default()
            },
        );
        let li = policies.for_platform(Platform::Linkedin);
        assert_eq!(li.base_delay_ms, 5000);
        assert_eq!(li.max_retries, 3);
        assert_eq!(policies.for_platform(Platform::Twitter), no_jitter());
    }
}
