//! Draft generation from trending topics.

use crate::batch::{BatchOptions, BatchReport, BatchRunner, WorkItem};
use crate::model::{Platform, PlatformContent, TrendItem};
use crate::store::PostStore;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Writes platform-specific copy for a trend.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, item: &TrendItem, platform: Platform) -> Result<String>;
}

pub struct GenerationJob {
    runner: BatchRunner,
    generator: Arc<dyn ContentGenerator>,
    store: Arc<dyn PostStore>,
}

impl GenerationJob {
    pub fn new(
        options: BatchOptions,
        generator: Arc<dyn ContentGenerator>,
        store: Arc<dyn PostStore>,
    ) -> Self {
        Self {
            runner: BatchRunner::new(options),
            generator,
            store,
        }
    }

    /// One draft post per trend item. The result of each item is the new
    /// post id. Items without target platforms are skipped.
    pub async fn run(&self, items: Vec<TrendItem>) -> BatchReport<i64> {
        let items: Vec<WorkItem<TrendItem>> = items
            .into_iter()
            .map(|item| WorkItem::new(item.id.clone(), item))
            .collect();
        let report = self
            .runner
            .run_with_skip(
                items,
                |item| item.payload.platforms.is_empty(),
                |item| self.process(item),
            )
            .await;
        info!(summary = ?report.summary, "generation job finished");
        report
    }

    async fn process(&self, item: TrendItem) -> Result<i64> {
        let mut content = PlatformContent::new();
        for &platform in &item.platforms {
            if content.contains_key(&platform) {
                continue;
            }
            let text = self.generator.generate(&item, platform).await?;
            if text.trim().is_empty() {
                debug!(trend = %item.id, %platform, "generator returned empty copy");
                continue;
            }
            content.insert(platform, text);
        }
        if content.is_empty() {
            bail!("no content generated for trend {}", item.id);
        }
        let post_id = self.store.create_draft(item.org_id, &content).await?;
        info!(trend = %item.id, post_id, "draft created");
        Ok(post_id)
    }
}
