//! Platform-publish adapter seam.
//!
//! Concrete platform protocols live outside this crate; the dispatcher only
//! sees [`PlatformPublisher`] implementations looked up by [`Platform`].

use crate::model::{Credential, Platform, PublishReceipt};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod webhook;

pub use webhook::WebhookPublisher;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("rate limited (429 Too Many Requests)")]
    RateLimited { retry_after: Option<Duration> },
    #[error("http error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rejected by platform: {0}")]
    Rejected(String),
    #[error("platform error {code}: {message}")]
    Platform {
        code: String,
        message: String,
        transient: bool,
    },
    #[error("no connected {0} account")]
    NotConnected(Platform),
    #[error("no publisher registered for {0}")]
    NoPublisher(Platform),
    #[error("no {0} content on post")]
    MissingContent(Platform),
}

impl PublishError {
    /// Transient errors may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            PublishError::Network(_) | PublishError::Timeout | PublishError::RateLimited { .. } => {
                true
            }
            PublishError::Http { status, .. } => crate::retry::status_is_retryable(*status),
            PublishError::Platform { transient, .. } => *transient,
            PublishError::Auth(_)
            | PublishError::Rejected(_)
            | PublishError::NotConnected(_)
            | PublishError::NoPublisher(_)
            | PublishError::MissingContent(_) => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PublishError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[async_trait]
pub trait PlatformPublisher: Send + Sync {
    async fn publish(
        &self,
        content: &str,
        credential: &Credential,
    ) -> Result<PublishReceipt, PublishError>;
}

/// Adapters keyed by platform. Built once at startup and shared read-only.
#[derive(Clone, Default)]
pub struct PublisherRegistry {
    publishers: HashMap<Platform, Arc<dyn PlatformPublisher>>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, platform: Platform, publisher: Arc<dyn PlatformPublisher>) {
        self.publishers.insert(platform, publisher);
    }

    pub fn with(mut self, platform: Platform, publisher: Arc<dyn PlatformPublisher>) -> Self {
        self.register(platform, publisher);
        self
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PlatformPublisher>> {
        self.publishers.get(&platform).cloned()
    }

    /// One [`WebhookPublisher`] per configured platform.
    pub fn from_config(publishers: &HashMap<Platform, crate::config::Publisher>) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        for (platform, publisher) in publishers {
            let adapter = WebhookPublisher::new(*platform, &publisher.endpoint)?;
            registry.register(*platform, Arc::new(adapter));
        }
        Ok(registry)
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut list: Vec<Platform> = self.publishers.keys().copied().collect();
        list.sort();
        list
    }
}

impl std::fmt::Debug for PublisherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherRegistry")
            .field("platforms", &self.platforms())
            .finish()
    }
}
