//! Bounded-concurrency batch execution with per-item failure isolation.
//!
//! Runnable items are split into consecutive groups of `batch_size`. A group runs
//! concurrently and is fully resolved before the next one starts, with a pause
//! between groups. Every item ends up as exactly one [`ItemOutcome`]; nothing
//! an item does can abort its siblings.

use crate::retry::{self, RetryConfig, RetryDecision};
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::{debug, warn};

/// One unit of work. `attempts` counts calls made to the operation so far.
#[derive(Debug, Clone)]
pub struct WorkItem<T> {
    pub id: String,
    pub payload: T,
    pub attempts: u32,
    /// Overrides the runner-wide retry config for this item.
    pub retry: Option<RetryConfig>,
}

impl<T> WorkItem<T> {
    pub fn new(id: impl Into<String>, payload: T) -> Self {
        Self {
            id: id.into(),
            payload,
            attempts: 0,
            retry: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Succeeded,
    Skipped,
    Failed,
}

/// Status-specific data: a result value on success, a message otherwise.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum OutcomeKind<R> {
    Succeeded {
        result: R,
    },
    Skipped {
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Failed {
        detail: String,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ItemOutcome<R> {
    pub id: String,
    pub attempts: u32,
    #[serde(flatten)]
    pub kind: OutcomeKind<R>,
}

impl<R> ItemOutcome<R> {
    pub fn succeeded(id: impl Into<String>, attempts: u32, result: R) -> Self {
        Self {
            id: id.into(),
            attempts,
            kind: OutcomeKind::Succeeded { result },
        }
    }

    pub fn skipped(id: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            id: id.into(),
            attempts: 0,
            kind: OutcomeKind::Skipped { detail },
        }
    }

    pub fn failed(id: impl Into<String>, attempts: u32, detail: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attempts,
            kind: OutcomeKind::Failed {
                detail: detail.into(),
            },
        }
    }

    pub fn status(&self) -> ItemStatus {
        match self.kind {
            OutcomeKind::Succeeded { .. } => ItemStatus::Succeeded,
            OutcomeKind::Skipped { .. } => ItemStatus::Skipped,
            OutcomeKind::Failed { .. } => ItemStatus::Failed,
        }
    }

    pub fn result(&self) -> Option<&R> {
        match &self.kind {
            OutcomeKind::Succeeded { result } => Some(result),
            _ => None,
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match &self.kind {
            OutcomeKind::Succeeded { .. } => None,
            OutcomeKind::Skipped { detail } => detail.as_deref(),
            OutcomeKind::Failed { detail } => Some(detail),
        }
    }
}

/// Counts over an outcome list. Always derived from the list, never kept as
/// running counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn from_outcomes<R>(outcomes: &[ItemOutcome<R>]) -> Self {
        outcomes.iter().fold(
            BatchSummary {
                total: outcomes.len(),
                ..Default::default()
            },
            |mut acc, o| {
                match o.status() {
                    ItemStatus::Succeeded => acc.succeeded += 1,
                    ItemStatus::Skipped => acc.skipped += 1,
                    ItemStatus::Failed => acc.failed += 1,
                }
                acc
            },
        )
    }

    pub fn is_partial(&self) -> bool {
        self.failed > 0 && self.succeeded > 0
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchReport<R> {
    pub outcomes: Vec<ItemOutcome<R>>,
    pub summary: BatchSummary,
}

impl<R> BatchReport<R> {
    pub fn new(outcomes: Vec<ItemOutcome<R>>) -> Self {
        let summary = BatchSummary::from_outcomes(&outcomes);
        Self { outcomes, summary }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOptions {
    /// Upper bound on in-flight operations.
    pub batch_size: usize,
    pub inter_batch_delay: Duration,
    /// Retry config for items that do not carry their own. `None` means one attempt.
    pub retry: Option<RetryConfig>,
    pub attempt_timeout: Option<Duration>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 5,
            inter_batch_delay: Duration::from_millis(1000),
            retry: None,
            attempt_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchRunner {
    options: BatchOptions,
}

impl BatchRunner {
    pub fn new(options: BatchOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    pub async fn run<T, R, F, Fut>(&self, items: Vec<WorkItem<T>>, operation: F) -> BatchReport<R>
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        self.run_with_skip(items, |_: &WorkItem<T>| false, operation)
            .await
    }

    /// Like [`run`](Self::run), but items for which `should_skip` returns true
    /// are reported as skipped without calling `operation`. Skip checks happen
    /// up front, so only runnable items occupy slots in a group.
    pub async fn run_with_skip<T, R, F, Fut, S>(
        &self,
        mut items: Vec<WorkItem<T>>,
        should_skip: S,
        operation: F,
    ) -> BatchReport<R>
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
        S: Fn(&WorkItem<T>) -> bool,
    {
        let batch_size = self.options.batch_size.max(1);
        let mut slots: Vec<Option<ItemOutcome<R>>> = Vec::with_capacity(items.len());
        let mut runnable = Vec::with_capacity(items.len());
        for (index, item) in items.iter_mut().enumerate() {
            if should_skip(item) {
                debug!(item = %item.id, "skipping item");
                slots.push(Some(ItemOutcome::skipped(item.id.clone(), None)));
            } else {
                slots.push(None);
                runnable.push((index, item));
            }
        }

        let groups = runnable.len().div_ceil(batch_size);
        for (group_index, group) in runnable.chunks_mut(batch_size).enumerate() {
            if group_index > 0 && !self.options.inter_batch_delay.is_zero() {
                tokio::time::sleep(self.options.inter_batch_delay).await;
            }
            debug!(group = group_index + 1, groups, size = group.len(), "running batch group");
            let pending = group.iter_mut().map(|(index, item)| {
                let index = *index;
                self.run_item(item, &operation).map(move |outcome| (index, outcome))
            });
            for (index, outcome) in join_all(pending).await {
                slots[index] = Some(outcome);
            }
        }

        let report = BatchReport::new(slots.into_iter().flatten().collect());
        debug!(summary = ?report.summary, "batch finished");
        report
    }

    async fn run_item<T, R, F, Fut>(&self, item: &mut WorkItem<T>, operation: &F) -> ItemOutcome<R>
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let retry = item.retry.clone().or_else(|| self.options.retry.clone());
        loop {
            item.attempts += 1;
            let err = match self.attempt(operation(item.payload.clone())).await {
                Ok(result) => return ItemOutcome::succeeded(item.id.clone(), item.attempts, result),
                Err(err) => err,
            };

            let decision = retry
                .as_ref()
                .map(|cfg| retry::decide(&err, item.attempts - 1, cfg))
                .unwrap_or_else(RetryDecision::stop);
            if !decision.should_retry {
                warn!(item = %item.id, attempts = item.attempts, error = %format!("{:#}", err), "item failed");
                return ItemOutcome::failed(item.id.clone(), item.attempts, format!("{:#}", err));
            }

            warn!(
                item = %item.id,
                attempt = item.attempts,
                delay_ms = decision.delay_ms,
                error = %format!("{:#}", err),
                "item failed; retrying"
            );
            tokio::time::sleep(decision.delay()).await;
        }
    }

    /// One call to the operation, bounded by the attempt timeout. Panics are
    /// turned into errors so they stay scoped to the item.
    async fn attempt<R, Fut>(&self, fut: Fut) -> anyhow::Result<R>
    where
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let guarded = AssertUnwindSafe(fut).catch_unwind();
        let outcome = match self.options.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(outcome) => outcome,
                Err(elapsed) => {
                    return Err(anyhow::Error::new(elapsed).context(format!(
                        "operation timed out after {}ms",
                        limit.as_millis()
                    )))
                }
            },
            None => guarded.await,
        };
        outcome.unwrap_or_else(|panic| {
            Err(anyhow::anyhow!(
                "operation panicked: {}",
                panic_message(&*panic)
            ))
        })
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_of_empty_list_is_zero() {
        let summary = BatchSummary::from_outcomes::<()>(&[]);
        assert_eq!(summary, BatchSummary::default());
        assert!(!summary.is_partial());
    }

    #[test]
    fn summary_counts_each_status() {
        let outcomes = vec![
            ItemOutcome::succeeded("a", 1, 1),
            ItemOutcome::skipped("b", None),
            ItemOutcome::failed("c", 2, "boom"),
            ItemOutcome::succeeded("d", 1, 4),
        ];
        let s = BatchSummary::from_outcomes(&outcomes);
        assert_eq!(s.total, 4);
        assert_eq!(s.succeeded, 2);
        assert_eq!(s.skipped, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.succeeded + s.skipped + s.failed, s.total);
        assert!(s.is_partial());
    }

    #[test]
    fn outcome_exposes_only_status_specific_data() {
        let ok = ItemOutcome::succeeded("a", 1, "value");
        assert_eq!(ok.result(), Some(&"value"));
        assert_eq!(ok.detail(), None);

        let failed: ItemOutcome<&str> = ItemOutcome::failed("b", 3, "nope");
        assert_eq!(failed.result(), None);
        assert_eq!(failed.detail(), Some("nope"));
    }

    #[test]
    fn outcome_serializes_flat() {
        let ok = ItemOutcome::succeeded("twitter", 1, "id-1");
        let v = serde_json::to_value(&ok).unwrap();
        assert_eq!(v["id"], "twitter");
        assert_eq!(v["status"], "succeeded");
        assert_eq!(v["result"], "id-1");

        let failed: ItemOutcome<String> = ItemOutcome::failed("linkedin", 2, "HTTP 401");
        let v = serde_json::to_value(&failed).unwrap();
        assert_eq!(v["status"], "failed");
        assert_eq!(v["detail"], "HTTP 401");
        assert!(v.get("result").is_none());
    }

    #[tokio::test]
    async fn zero_batch_size_is_treated_as_one() {
        let runner = BatchRunner::new(BatchOptions {
            batch_size: 0,
            inter_batch_delay: Duration::ZERO,
            ..Default::default()
        });
        let items = (0..3).map(|i| WorkItem::new(i.to_string(), i)).collect();
        let report = runner
            .run(items, |n: i32| async move { Ok::<_, anyhow::Error>(n * 2) })
            .await;
        assert_eq!(report.summary.succeeded, 3);
    }
}
