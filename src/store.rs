//! Data-store collaborators consumed by the dispatch engine.
//!
//! The engine only talks to these traits. [`SqliteStore`] is the production
//! implementation; it is constructed once per process and handed to each
//! component explicitly.

use crate::db::{self, Pool};
use crate::model::{
    Credential, Platform, PlatformContent, Post, PostState, PostStateUpdate, PublishReceipt,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait PostStore: Send + Sync {
    /// Scheduled posts with `scheduled_for <= now`, earliest first.
    async fn due_posts(&self, now: DateTime<Utc>) -> Result<Vec<Post>>;

    async fn get_post(&self, id: i64) -> Result<Option<Post>>;

    /// Apply `update` only while the post is in `expected`. Returns false when
    /// another writer got there first.
    async fn update_post_state(
        &self,
        id: i64,
        update: &PostStateUpdate,
        expected: PostState,
    ) -> Result<bool>;

    async fn get_connection(&self, org_id: i64, platform: Platform) -> Result<Option<Credential>>;

    /// Platforms that already have a recorded successful publish for this post.
    async fn delivered_platforms(&self, post_id: i64) -> Result<Vec<Platform>>;

    async fn record_delivery(
        &self,
        post_id: i64,
        platform: Platform,
        receipt: &PublishReceipt,
    ) -> Result<()>;

    async fn create_draft(&self, org_id: i64, content: &PlatformContent) -> Result<i64>;
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn update_image_url(&self, id: i64, url: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl PostStore for SqliteStore {
    async fn due_posts(&self, now: DateTime<Utc>) -> Result<Vec<Post>> {
        db::fetch_due_posts(&self.pool, now).await
    }

    async fn get_post(&self, id: i64) -> Result<Option<Post>> {
        db::fetch_post(&self.pool, id).await
    }

    async fn update_post_state(
        &self,
        id: i64,
        update: &PostStateUpdate,
        expected: PostState,
    ) -> Result<bool> {
        db::update_post_state(&self.pool, id, update, expected).await
    }

    async fn get_connection(&self, org_id: i64, platform: Platform) -> Result<Option<Credential>> {
        db::fetch_connection(&self.pool, org_id, platform).await
    }

    async fn delivered_platforms(&self, post_id: i64) -> Result<Vec<Platform>> {
        db::delivered_platforms(&self.pool, post_id).await
    }

    async fn record_delivery(
        &self,
        post_id: i64,
        platform: Platform,
        receipt: &PublishReceipt,
    ) -> Result<()> {
        db::record_delivery(&self.pool, post_id, platform, receipt).await
    }

    async fn create_draft(&self, org_id: i64, content: &PlatformContent) -> Result<i64> {
        db::insert_post(&self.pool, org_id, content, PostState::Draft, None).await
    }
}

#[async_trait]
impl ImageStore for SqliteStore {
    async fn update_image_url(&self, id: i64, url: &str) -> Result<()> {
        db::update_image_url(&self.pool, id, url).await
    }
}
