//! Image watermarking over the batch runner.

use crate::batch::{BatchOptions, BatchReport, BatchRunner, WorkItem};
use crate::model::ImageRecord;
use crate::store::ImageStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Path segment carried by every already-watermarked image URL.
pub const WATERMARKED_SEGMENT: &str = "/watermarked/";

pub fn is_watermarked(url: &str) -> bool {
    url.contains(WATERMARKED_SEGMENT)
}

/// Produces a watermarked copy of an image and returns its new URL.
#[async_trait]
pub trait Watermarker: Send + Sync {
    async fn watermark(&self, image: &ImageRecord) -> Result<String>;
}

pub struct WatermarkJob {
    runner: BatchRunner,
    watermarker: Arc<dyn Watermarker>,
    images: Arc<dyn ImageStore>,
}

impl WatermarkJob {
    pub fn new(
        options: BatchOptions,
        watermarker: Arc<dyn Watermarker>,
        images: Arc<dyn ImageStore>,
    ) -> Self {
        Self {
            runner: BatchRunner::new(options),
            watermarker,
            images,
        }
    }

    /// Images whose URL is already watermarked are skipped; the rest get a
    /// watermarked copy and their stored URL is replaced with it.
    pub async fn run(&self, images: Vec<ImageRecord>) -> BatchReport<String> {
        let items: Vec<WorkItem<ImageRecord>> = images
            .into_iter()
            .map(|image| WorkItem::new(image.id.to_string(), image))
            .collect();
        let report = self
            .runner
            .run_with_skip(
                items,
                |item| is_watermarked(&item.payload.url),
                |image| self.process(image),
            )
            .await;
        info!(summary = ?report.summary, "watermark job finished");
        report
    }

    async fn process(&self, image: ImageRecord) -> Result<String> {
        let url = self.watermarker.watermark(&image).await?;
        self.images
            .update_image_url(image.id, &url)
            .await
            .with_context(|| format!("failed to store watermarked url for image {}", image.id))?;
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermarked_urls_are_detected() {
        assert!(is_watermarked("https://cdn.example/org/1/watermarked/a.png"));
        assert!(!is_watermarked("https://cdn.example/org/1/a.png"));
        assert!(!is_watermarked("https://cdn.example/watermarked.png"));
    }
}
