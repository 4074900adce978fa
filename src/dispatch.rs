//! Per-post fan-out to platform publishers.

use crate::batch::{BatchOptions, BatchRunner, BatchSummary, ItemOutcome, OutcomeKind, WorkItem};
use crate::model::{Platform, Post, PublishReceipt, UnknownPlatform};
use crate::platform::{PublishError, PublisherRegistry};
use crate::retry::RetryPolicies;
use crate::store::PostStore;
use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Dispatch-level failures. No per-platform work happened when one of these
/// is returned.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("post {post_id} has no platforms to publish to")]
    NoPlatforms { post_id: i64 },
    #[error("post {0} not found")]
    PostNotFound(i64),
    #[error(transparent)]
    UnknownPlatform(#[from] UnknownPlatform),
    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    /// No platform failed (skipped platforms count as done).
    Published,
    /// Some platforms succeeded, some failed.
    Partial,
    /// Nothing succeeded and at least one platform failed.
    Failed,
}

impl DispatchStatus {
    pub fn from_summary(summary: &BatchSummary) -> Self {
        if summary.failed == 0 {
            DispatchStatus::Published
        } else if summary.succeeded == 0 {
            DispatchStatus::Failed
        } else {
            DispatchStatus::Partial
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PostDispatchOutcome {
    pub post_id: i64,
    pub per_platform: Vec<ItemOutcome<PublishReceipt>>,
    pub summary: BatchSummary,
}

impl PostDispatchOutcome {
    pub fn status(&self) -> DispatchStatus {
        DispatchStatus::from_summary(&self.summary)
    }
}

const ALREADY_DELIVERED: &str = "already delivered";

/// Payload of one platform work item.
#[derive(Debug, Clone)]
struct PlatformJob {
    platform: Platform,
    content: Option<String>,
}

pub struct PublishDispatcher {
    store: Arc<dyn PostStore>,
    publishers: PublisherRegistry,
    policies: RetryPolicies,
    runner: BatchRunner,
}

impl PublishDispatcher {
    pub fn new(
        store: Arc<dyn PostStore>,
        publishers: PublisherRegistry,
        policies: RetryPolicies,
        options: BatchOptions,
    ) -> Self {
        Self {
            store,
            publishers,
            policies,
            runner: BatchRunner::new(options),
        }
    }

    /// Explicit platforms win when non-empty; otherwise every platform with
    /// content on the post. Duplicates are removed, first occurrence kept.
    pub fn resolve_platforms(post: &Post, explicit: Option<&[Platform]>) -> Vec<Platform> {
        match explicit.filter(|list| !list.is_empty()) {
            Some(list) => {
                let mut seen = HashSet::new();
                list.iter().copied().filter(|p| seen.insert(*p)).collect()
            }
            None => post.targeted_platforms(),
        }
    }

    /// Parse platform names from an external request.
    pub fn parse_platforms(names: &[String]) -> Result<Vec<Platform>, DispatchError> {
        names
            .iter()
            .map(|name| name.parse::<Platform>().map_err(DispatchError::from))
            .collect()
    }

    #[instrument(skip_all, fields(post_id = post.id))]
    pub async fn dispatch(
        &self,
        post: &Post,
        explicit: Option<&[Platform]>,
    ) -> Result<PostDispatchOutcome, DispatchError> {
        let targets = Self::resolve_platforms(post, explicit);
        if targets.is_empty() {
            warn!("post has no platform targets");
            return Err(DispatchError::NoPlatforms { post_id: post.id });
        }

        let delivered: HashSet<Platform> = self
            .store
            .delivered_platforms(post.id)
            .await
            .map_err(DispatchError::Store)?
            .into_iter()
            .collect();

        let items: Vec<WorkItem<PlatformJob>> = targets
            .iter()
            .map(|&platform| {
                WorkItem::new(
                    platform.as_str(),
                    PlatformJob {
                        platform,
                        content: post.content_for(platform).map(str::to_string),
                    },
                )
                .with_retry(self.policies.for_platform(platform))
            })
            .collect();

        let report = self
            .runner
            .run_with_skip(
                items,
                |item| {
                    let done = delivered.contains(&item.payload.platform);
                    if done {
                        info!(platform = %item.payload.platform, "already delivered; skipping");
                    }
                    done
                },
                |job| self.publish_one(post.org_id, post.id, job),
            )
            .await;

        let mut per_platform = report.outcomes;
        for outcome in &mut per_platform {
            if let OutcomeKind::Skipped { detail } = &mut outcome.kind {
                detail.get_or_insert_with(|| ALREADY_DELIVERED.to_string());
            }
        }
        let outcome = PostDispatchOutcome {
            post_id: post.id,
            per_platform,
            summary: report.summary,
        };
        info!(
            status = ?outcome.status(),
            succeeded = outcome.summary.succeeded,
            skipped = outcome.summary.skipped,
            failed = outcome.summary.failed,
            "dispatch finished"
        );
        Ok(outcome)
    }

    /// Load the post and dispatch it.
    pub async fn dispatch_by_id(
        &self,
        post_id: i64,
        explicit: Option<&[Platform]>,
    ) -> Result<(Post, PostDispatchOutcome), DispatchError> {
        let post = self
            .store
            .get_post(post_id)
            .await
            .map_err(DispatchError::Store)?
            .ok_or(DispatchError::PostNotFound(post_id))?;
        let outcome = self.dispatch(&post, explicit).await?;
        Ok((post, outcome))
    }

    async fn publish_one(&self, org_id: i64, post_id: i64, job: PlatformJob) -> Result<PublishReceipt> {
        let platform = job.platform;
        let content = job
            .content
            .ok_or(PublishError::MissingContent(platform))?;
        let publisher = self
            .publishers
            .get(platform)
            .ok_or(PublishError::NoPublisher(platform))?;
        let credential = self
            .store
            .get_connection(org_id, platform)
            .await?
            .ok_or(PublishError::NotConnected(platform))?;

        let receipt = publisher.publish(&content, &credential).await?;

        // The publish already happened; a failed receipt write must not turn
        // into a retry that would post again.
        if let Err(err) = self.store.record_delivery(post_id, platform, &receipt).await {
            warn!(?err, %platform, "failed to record delivery receipt");
        }
        info!(%platform, external_id = %receipt.external_id, "published");
        Ok(receipt)
    }
}
