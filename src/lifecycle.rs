//! Post state transitions after a dispatch.

use crate::batch::BatchSummary;
use crate::dispatch::PostDispatchOutcome;
use crate::model::{Post, PostState, PostStateUpdate};
use crate::store::PostStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// What the lifecycle write did to the post.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum Transition {
    Published { at: DateTime<Utc> },
    /// Some platform failed; the post stays scheduled for the next tick.
    Rescheduled,
    /// No write was needed for the post's current state.
    Unchanged,
    /// The post changed state concurrently, so the conditional write did nothing.
    Conflict,
}

/// Full success publishes; anything else leaves the post scheduled with
/// `published_at` cleared.
pub fn next_state(summary: &BatchSummary, now: DateTime<Utc>) -> PostStateUpdate {
    if summary.failed == 0 {
        PostStateUpdate {
            state: PostState::Published,
            published_at: Some(now),
        }
    } else {
        PostStateUpdate {
            state: PostState::Scheduled,
            published_at: None,
        }
    }
}

pub struct PostLifecycleManager {
    store: Arc<dyn PostStore>,
}

impl PostLifecycleManager {
    pub fn new(store: Arc<dyn PostStore>) -> Self {
        Self { store }
    }

    pub async fn on_dispatch_outcome(
        &self,
        post: &Post,
        outcome: &PostDispatchOutcome,
    ) -> Result<Transition> {
        self.apply(post, outcome, Utc::now()).await
    }

    /// The write is conditioned on the state the post had when it was read, so a
    /// post published or edited by someone else in the meantime is left alone.
    pub async fn apply(
        &self,
        post: &Post,
        outcome: &PostDispatchOutcome,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let update = next_state(&outcome.summary, now);
        let expected = post.state;
        match (expected, update.state) {
            (PostState::Published, _) => return Ok(Transition::Unchanged),
            (PostState::Draft, PostState::Scheduled) => return Ok(Transition::Unchanged),
            _ => {}
        }

        let applied = self
            .store
            .update_post_state(post.id, &update, expected)
            .await?;
        if !applied {
            warn!(post_id = post.id, expected = expected.as_str(), "post state changed concurrently; skipping write");
            return Ok(Transition::Conflict);
        }

        let transition = match update.published_at {
            Some(at) => Transition::Published { at },
            None => Transition::Rescheduled,
        };
        info!(post_id = post.id, ?transition, "post state updated");
        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(succeeded: usize, skipped: usize, failed: usize) -> BatchSummary {
        BatchSummary {
            total: succeeded + skipped + failed,
            succeeded,
            skipped,
            failed,
        }
    }

    #[test]
    fn full_success_publishes() {
        let now = Utc::now();
        let update = next_state(&summary(3, 0, 0), now);
        assert_eq!(update.state, PostState::Published);
        assert_eq!(update.published_at, Some(now));

        let update = next_state(&summary(1, 2, 0), now);
        assert_eq!(update.state, PostState::Published);
    }

    #[test]
    fn any_failure_stays_scheduled() {
        let now = Utc::now();
        for s in [summary(2, 0, 1), summary(0, 0, 3), summary(0, 1, 1)] {
            let update = next_state(&s, now);
            assert_eq!(update.state, PostState::Scheduled);
            assert_eq!(update.published_at, None);
        }
    }

    #[test]
    fn transition_serializes_with_tag() {
        let v = serde_json::to_value(Transition::Rescheduled).unwrap();
        assert_eq!(v["transition"], "rescheduled");
    }
}
