use super::{PlatformPublisher, PublishError};
use crate::model::{Credential, Platform, PublishReceipt};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Generic publisher that forwards a post to an HTTP gateway which speaks the
/// platform's own protocol.
#[derive(Clone)]
pub struct WebhookPublisher {
    http: Client,
    endpoint: Url,
    platform: Platform,
}

impl fmt::Debug for WebhookPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookPublisher")
            .field("platform", &self.platform)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct PublishResponse {
    id: String,
    #[serde(default)]
    url: Option<String>,
}

impl WebhookPublisher {
    pub fn new(platform: Platform, endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("invalid {} publisher endpoint", platform))?;
        let http = Client::builder()
            .user_agent("postrelay/0.1")
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            endpoint,
            platform,
        })
    }

    pub fn build_request(&self, body: &Value, credential: &Credential) -> Result<reqwest::Request> {
        self.http
            .post(self.endpoint.clone())
            .header("Authorization", format!("Bearer {}", credential.access_token))
            .header("Content-Type", "application/json")
            .json(body)
            .build()
            .context("failed to build publish request")
    }
}

pub fn build_publish_body(platform: Platform, content: &str, credential: &Credential) -> Value {
    json!({
        "platform": platform.as_str(),
        "account_id": credential.account_id,
        "content": content,
    })
}

/// Map a non-success HTTP response to a publish error.
pub fn error_for_status(status: StatusCode, headers: &HeaderMap, body: String) -> PublishError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return PublishError::RateLimited {
            retry_after: parse_retry_after(headers),
        };
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return PublishError::Auth(format!("{}: {}", status, body));
    }
    if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
        return PublishError::Rejected(body);
    }
    PublishError::Http {
        status: status.as_u16(),
        body,
    }
}

/// Only the delta-seconds form of `Retry-After` is honoured.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl PlatformPublisher for WebhookPublisher {
    async fn publish(
        &self,
        content: &str,
        credential: &Credential,
    ) -> Result<PublishReceipt, PublishError> {
        let body = build_publish_body(self.platform, content, credential);
        let request = self
            .build_request(&body, credential)
            .map_err(|e| PublishError::Rejected(format!("{:#}", e)))?;
        debug!(platform = %self.platform, url = %request.url(), "sending publish request");

        let res = self.http.execute(request).await.map_err(|e| {
            if e.is_timeout() {
                PublishError::Timeout
            } else {
                PublishError::Network(e.to_string())
            }
        })?;

        let status = res.status();
        if !status.is_success() {
            let headers = res.headers().clone();
            let body = res.text().await.unwrap_or_default();
            warn!(platform = %self.platform, %status, "publish gateway returned error");
            return Err(error_for_status(status, &headers, body));
        }

        // The gateway accepted the post, so an unreadable body must not be retried.
        let payload: PublishResponse = res
            .json()
            .await
            .map_err(|e| PublishError::Platform {
                code: "invalid_response".into(),
                message: e.to_string(),
                transient: false,
            })?;
        Ok(PublishReceipt {
            external_id: payload.id,
            url: payload.url,
        })
    }
}
