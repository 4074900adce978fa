use anyhow::{anyhow, Result};
use async_trait::async_trait;
use postrelay::batch::{BatchOptions, ItemStatus};
use postrelay::db::{self, Pool};
use postrelay::jobs::watermark::is_watermarked;
use postrelay::jobs::{ContentGenerator, GenerationJob, WatermarkJob, Watermarker};
use postrelay::model::{ImageRecord, Platform, PostState, TrendItem};
use postrelay::store::SqliteStore;
use std::sync::Arc;
use tokio::sync::{Barrier, Mutex};
use tokio::time::Duration;

async fn setup_pool() -> Pool {
    let pool = db::memory_pool().await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

fn options(batch_size: usize) -> BatchOptions {
    BatchOptions {
        batch_size,
        inter_batch_delay: Duration::from_secs(30),
        retry: None,
        attempt_timeout: None,
    }
}

/// Waits until `group` calls are in flight together, then returns a
/// watermarked URL.
struct BarrierWatermarker {
    barrier: Barrier,
    seen: Mutex<Vec<i64>>,
}

#[async_trait]
impl Watermarker for BarrierWatermarker {
    async fn watermark(&self, image: &ImageRecord) -> Result<String> {
        self.seen.lock().await.push(image.id);
        self.barrier.wait().await;
        Ok(image.url.replacen("/img/", "/img/watermarked/", 1))
    }
}

#[tokio::test]
async fn watermark_skips_processed_images_and_runs_the_rest_together() {
    let pool = setup_pool().await;
    let urls = [
        "https://cdn.example/img/1.png",
        "https://cdn.example/img/watermarked/2.png",
        "https://cdn.example/img/3.png",
        "https://cdn.example/img/4.png",
        "https://cdn.example/img/watermarked/5.png",
        "https://cdn.example/img/6.png",
        "https://cdn.example/img/7.png",
    ];
    for url in urls {
        db::insert_image(&pool, 1, url).await.unwrap();
    }
    let images = db::fetch_images(&pool, 1).await.unwrap();
    assert_eq!(images.len(), 7);

    let watermarker = Arc::new(BarrierWatermarker {
        barrier: Barrier::new(5),
        seen: Mutex::new(Vec::new()),
    });
    let job = WatermarkJob::new(
        options(5),
        watermarker.clone(),
        Arc::new(SqliteStore::new(pool.clone())),
    );

    // The barrier only opens if all five runnable images share one group.
    let report = tokio::time::timeout(Duration::from_secs(5), job.run(images))
        .await
        .expect("runnable images were not processed in one group");

    assert_eq!(report.summary.total, 7);
    assert_eq!(report.summary.skipped, 2);
    assert_eq!(report.summary.succeeded, 5);
    assert_eq!(report.outcomes[1].status(), ItemStatus::Skipped);
    assert_eq!(report.outcomes[4].status(), ItemStatus::Skipped);

    let mut seen = watermarker.seen.lock().await.clone();
    seen.sort();
    assert_eq!(seen.len(), 5);
    assert!(!seen.contains(&2) && !seen.contains(&5));

    let stored = db::fetch_images(&pool, 1).await.unwrap();
    assert!(stored.iter().all(|image| is_watermarked(&image.url)));
    assert_eq!(stored[0].url, "https://cdn.example/img/watermarked/1.png");
}

struct FailingWatermarker;

#[async_trait]
impl Watermarker for FailingWatermarker {
    async fn watermark(&self, image: &ImageRecord) -> Result<String> {
        if image.id == 2 {
            Err(anyhow!("unsupported format"))
        } else {
            Ok(format!("https://cdn.example/watermarked/{}.png", image.id))
        }
    }
}

#[tokio::test]
async fn watermark_failure_leaves_url_untouched() {
    let pool = setup_pool().await;
    db::insert_image(&pool, 1, "https://cdn.example/1.png").await.unwrap();
    db::insert_image(&pool, 1, "https://cdn.example/2.tiff").await.unwrap();
    let images = db::fetch_images(&pool, 1).await.unwrap();

    let job = WatermarkJob::new(
        options(5),
        Arc::new(FailingWatermarker),
        Arc::new(SqliteStore::new(pool.clone())),
    );
    let report = job.run(images).await;
    assert_eq!(report.summary.succeeded, 1);
    assert_eq!(report.summary.failed, 1);
    assert!(report.outcomes[1].detail().unwrap().contains("unsupported format"));

    let stored = db::fetch_images(&pool, 1).await.unwrap();
    assert_eq!(stored[0].url, "https://cdn.example/watermarked/1.png");
    assert_eq!(stored[1].url, "https://cdn.example/2.tiff");
}

struct TemplateGenerator;

#[async_trait]
impl ContentGenerator for TemplateGenerator {
    async fn generate(&self, item: &TrendItem, platform: Platform) -> Result<String> {
        match platform {
            Platform::Instagram => Ok(String::new()),
            Platform::Threads => Err(anyhow!("model refused")),
            _ => Ok(format!("[{}] {}", platform, item.topic)),
        }
    }
}

fn trend(id: &str, platforms: &[Platform]) -> TrendItem {
    TrendItem {
        id: id.into(),
        org_id: 3,
        topic: format!("topic {}", id),
        platforms: platforms.to_vec(),
    }
}

#[tokio::test]
async fn generation_creates_drafts() {
    let pool = setup_pool().await;
    let job = GenerationJob::new(
        options(5),
        Arc::new(TemplateGenerator),
        Arc::new(SqliteStore::new(pool.clone())),
    );

    let report = job
        .run(vec![
            trend("a", &[Platform::Twitter, Platform::Linkedin, Platform::Instagram]),
            trend("b", &[]),
            trend("c", &[Platform::Instagram]),
            trend("d", &[Platform::Twitter, Platform::Threads]),
        ])
        .await;

    let statuses: Vec<ItemStatus> = report.outcomes.iter().map(|o| o.status()).collect();
    assert_eq!(
        statuses,
        vec![
            ItemStatus::Succeeded,
            ItemStatus::Skipped,
            ItemStatus::Failed,
            ItemStatus::Failed
        ]
    );
    assert!(report.outcomes[2].detail().unwrap().contains("no content generated"));
    assert!(report.outcomes[3].detail().unwrap().contains("model refused"));

    let post_id = *report.outcomes[0].result().unwrap();
    let post = db::fetch_post(&pool, post_id).await.unwrap().unwrap();
    assert_eq!(post.state, PostState::Draft);
    assert_eq!(post.org_id, 3);
    assert_eq!(post.targeted_platforms(), vec![Platform::Twitter, Platform::Linkedin]);
    assert_eq!(post.content_for(Platform::Twitter), Some("[twitter] topic a"));
}
