//! Periodic scheduler: finds due posts and drives each through dispatch and
//! the lifecycle write.

use crate::batch::{panic_message, BatchSummary, ItemOutcome};
use crate::config::Config;
use crate::dispatch::{DispatchError, DispatchStatus, PostDispatchOutcome, PublishDispatcher};
use crate::lifecycle::{PostLifecycleManager, Transition};
use crate::model::{Platform, Post, PublishReceipt};
use crate::platform::PublisherRegistry;
use crate::report::TriggerResponse;
use crate::store::PostStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PostRunStatus {
    Published,
    Partial,
    Failed,
    NoPlatforms,
    /// Dispatch ran but another writer changed the post before its state
    /// could be settled.
    Conflict,
    /// Dispatch or the lifecycle write could not run to completion.
    Error,
}

impl From<DispatchStatus> for PostRunStatus {
    fn from(status: DispatchStatus) -> Self {
        match status {
            DispatchStatus::Published => PostRunStatus::Published,
            DispatchStatus::Partial => PostRunStatus::Partial,
            DispatchStatus::Failed => PostRunStatus::Failed,
        }
    }
}

/// Result of processing one post within a run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PostRunOutcome {
    pub post_id: i64,
    pub status: PostRunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<BatchSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<ItemOutcome<PublishReceipt>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition: Option<Transition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PostRunOutcome {
    fn errored(post_id: i64, status: PostRunStatus, error: impl Into<String>) -> Self {
        Self {
            post_id,
            status,
            summary: None,
            platforms: Vec::new(),
            transition: None,
            error: Some(error.into()),
        }
    }

    pub fn is_published(&self) -> bool {
        self.status == PostRunStatus::Published
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SchedulerReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub processed: usize,
    pub successful: usize,
    /// Subset of `failed` where at least one platform went out.
    pub partial: usize,
    pub failed: usize,
    pub outcomes: Vec<PostRunOutcome>,
}

impl SchedulerReport {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, outcomes: Vec<PostRunOutcome>) -> Self {
        let successful = outcomes.iter().filter(|o| o.is_published()).count();
        let partial = outcomes
            .iter()
            .filter(|o| o.status == PostRunStatus::Partial)
            .count();
        Self {
            run_id,
            started_at,
            processed: outcomes.len(),
            successful,
            partial,
            failed: outcomes.len() - successful,
            outcomes,
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn PostStore>,
    dispatcher: Arc<PublishDispatcher>,
    lifecycle: PostLifecycleManager,
}

impl Scheduler {
    pub fn new(store: Arc<dyn PostStore>, dispatcher: Arc<PublishDispatcher>) -> Self {
        Self {
            lifecycle: PostLifecycleManager::new(store.clone()),
            store,
            dispatcher,
        }
    }

    /// Wire the full engine from configuration: webhook publishers, retry
    /// policies and batch options.
    pub fn from_config(cfg: &Config, store: Arc<dyn PostStore>) -> Result<Self> {
        let publishers = PublisherRegistry::from_config(&cfg.publishers)?;
        info!(platforms = ?publishers.platforms(), "publishers registered");
        let dispatcher = PublishDispatcher::new(
            store.clone(),
            publishers,
            cfg.retry.clone(),
            cfg.batch.options(),
        );
        Ok(Self::new(store, Arc::new(dispatcher)))
    }

    pub fn dispatcher(&self) -> &PublishDispatcher {
        &self.dispatcher
    }

    /// Process every post due at `now`, one at a time, earliest first. Only a
    /// failure to list due posts is an error; per-post failures are reported.
    #[instrument(skip_all)]
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<SchedulerReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let due = self
            .store
            .due_posts(now)
            .await
            .context("failed to load due posts")?;
        info!(%run_id, due = due.len(), "scheduler run started");

        let mut outcomes = Vec::with_capacity(due.len());
        for post in &due {
            outcomes.push(self.run_post(post).await);
        }

        let report = SchedulerReport::new(run_id, started_at, outcomes);
        info!(
            %run_id,
            processed = report.processed,
            successful = report.successful,
            partial = report.partial,
            failed = report.failed,
            "scheduler run finished"
        );
        Ok(report)
    }

    /// One scheduler run bounded by `budget`. Exceeding the budget or failing
    /// to list due posts yields a fatal response.
    pub async fn trigger(&self, budget: Duration) -> TriggerResponse {
        match tokio::time::timeout(budget, self.run_due(Utc::now())).await {
            Ok(Ok(report)) => TriggerResponse::from_report(report),
            Ok(Err(err)) => {
                error!(error = %format!("{:#}", err), "scheduler run failed");
                TriggerResponse::fatal(format!("{:#}", err))
            }
            Err(_) => {
                error!(budget_secs = budget.as_secs(), "scheduler run exceeded its budget");
                TriggerResponse::fatal(format!(
                    "scheduler run exceeded budget of {}s",
                    budget.as_secs()
                ))
            }
        }
    }

    /// Trigger a run every `interval` until `shutdown` resolves. Shutdown is
    /// honoured mid-run too: the in-flight run is dropped, and the deliveries it
    /// already recorded let the next process resume without re-posting.
    pub async fn run_until<F>(&self, interval: Duration, budget: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        response = self.trigger(budget) => {
                            if response.http_status() >= 500 {
                                error!(status = response.http_status(), "scheduler run aborted");
                            } else if !response.is_success() {
                                warn!("scheduler run finished with failures");
                            }
                        }
                        _ = &mut shutdown => {
                            warn!("shutdown during a run; in-flight dispatch abandoned");
                            break;
                        }
                    }
                }
            }
        }
        info!("scheduler loop stopped");
    }

    /// Manual dispatch of a single post, optionally restricted to `explicit`
    /// platforms. Dispatch-level failures are returned to the caller.
    pub async fn dispatch_post(
        &self,
        post_id: i64,
        explicit: Option<&[Platform]>,
    ) -> Result<PostRunOutcome, DispatchError> {
        let (post, outcome) = self.dispatcher.dispatch_by_id(post_id, explicit).await?;
        Ok(self.finish(&post, outcome).await)
    }

    /// Failure boundary for one post: errors and panics end up in the outcome
    /// and never stop the run.
    async fn run_post(&self, post: &Post) -> PostRunOutcome {
        AssertUnwindSafe(self.process(post))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic_message(&*panic);
                error!(post_id = post.id, %message, "post processing panicked");
                PostRunOutcome::errored(
                    post.id,
                    PostRunStatus::Error,
                    format!("panicked: {}", message),
                )
            })
    }

    async fn process(&self, post: &Post) -> PostRunOutcome {
        match self.dispatcher.dispatch(post, None).await {
            Ok(outcome) => self.finish(post, outcome).await,
            Err(err @ DispatchError::NoPlatforms { .. }) => {
                PostRunOutcome::errored(post.id, PostRunStatus::NoPlatforms, err.to_string())
            }
            Err(err) => {
                warn!(post_id = post.id, error = %err, "dispatch failed");
                PostRunOutcome::errored(post.id, PostRunStatus::Error, err.to_string())
            }
        }
    }

    async fn finish(&self, post: &Post, outcome: PostDispatchOutcome) -> PostRunOutcome {
        let mut run = PostRunOutcome {
            post_id: post.id,
            status: outcome.status().into(),
            summary: Some(outcome.summary),
            platforms: Vec::new(),
            transition: None,
            error: None,
        };
        match self.lifecycle.on_dispatch_outcome(post, &outcome).await {
            Ok(Transition::Conflict) => {
                warn!(post_id = post.id, "post changed during dispatch; state left as is");
                run.status = PostRunStatus::Conflict;
                run.transition = Some(Transition::Conflict);
            }
            Ok(transition) => run.transition = Some(transition),
            Err(err) => {
                error!(post_id = post.id, error = %format!("{:#}", err), "failed to update post state");
                run.status = PostRunStatus::Error;
                run.error = Some(format!("failed to update post state: {:#}", err));
            }
        }
        run.platforms = outcome.per_platform;
        run
    }
}
