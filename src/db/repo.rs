use super::model::parse_platform_content;
use crate::model::{
    Credential, ImageRecord, Platform, PlatformContent, Post, PostState, PostStateUpdate,
    PublishReceipt,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

const POST_COLUMNS: &str = "id, org_id, platform_content, scheduled_for, state, published_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and request creation of the file. In-memory URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{}", expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

/// Single-connection in-memory database. Every SQLite `:memory:` connection is
/// its own database, so the pool must never open a second one.
pub async fn memory_pool() -> Result<Pool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None::<Duration>)
        .max_lifetime(None::<Duration>)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn post_from_row(row: &SqliteRow) -> Result<Post> {
    let id: i64 = row.get("id");
    let state_str: String = row.get("state");
    let state = PostState::parse_state(&state_str)
        .ok_or_else(|| anyhow!("post {} has unknown state {}", id, state_str))?;
    let raw_content: String = row.get("platform_content");
    Ok(Post {
        id,
        org_id: row.get("org_id"),
        content: parse_platform_content(&raw_content),
        scheduled_for: row
            .try_get::<Option<DateTime<Utc>>, _>("scheduled_for")
            .ok()
            .flatten(),
        state,
        published_at: row
            .try_get::<Option<DateTime<Utc>>, _>("published_at")
            .ok()
            .flatten(),
    })
}

#[instrument(skip_all)]
pub async fn insert_post(
    pool: &Pool,
    org_id: i64,
    content: &PlatformContent,
    state: PostState,
    scheduled_for: Option<DateTime<Utc>>,
) -> Result<i64> {
    let raw = serde_json::to_string(content)?;
    insert_post_raw(pool, org_id, &raw, state, scheduled_for).await
}

/// Insert with the content column exactly as given, e.g. data written by
/// another service with loose platform keys.
#[instrument(skip_all)]
pub async fn insert_post_raw(
    pool: &Pool,
    org_id: i64,
    raw_content: &str,
    state: PostState,
    scheduled_for: Option<DateTime<Utc>>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO posts (org_id, platform_content, state, scheduled_for) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(org_id)
    .bind(raw_content)
    .bind(state.as_str())
    .bind(scheduled_for)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

/// Move a draft to `scheduled`. Returns false if the post was not a draft.
#[instrument(skip_all)]
pub async fn schedule_post(pool: &Pool, id: i64, at: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE posts SET state = 'scheduled', scheduled_for = ? WHERE id = ? AND state = 'draft'",
    )
    .bind(at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn fetch_post(pool: &Pool, id: i64) -> Result<Option<Post>> {
    let row = sqlx::query(&format!("SELECT {} FROM posts WHERE id = ?", POST_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(post_from_row).transpose()
}

/// Scheduled posts due at `now`, earliest first.
#[instrument(skip_all)]
pub async fn fetch_due_posts(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<Post>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM posts \
         WHERE state = 'scheduled' AND scheduled_for IS NOT NULL \
           AND julianday(scheduled_for) <= julianday(?) \
         ORDER BY julianday(scheduled_for) ASC, id ASC",
        POST_COLUMNS
    ))
    .bind(now)
    .fetch_all(pool)
    .await?;

    let mut posts = Vec::with_capacity(rows.len());
    for row in &rows {
        match post_from_row(row) {
            Ok(post) => posts.push(post),
            Err(err) => warn!(?err, "skipping unreadable post row"),
        }
    }
    Ok(posts)
}

/// Write the new state only if the post is still in `expected`. Returns whether
/// a row was updated.
#[instrument(skip_all)]
pub async fn update_post_state(
    pool: &Pool,
    id: i64,
    update: &PostStateUpdate,
    expected: PostState,
) -> Result<bool> {
    let res = sqlx::query("UPDATE posts SET state = ?, published_at = ? WHERE id = ? AND state = ?")
        .bind(update.state.as_str())
        .bind(update.published_at)
        .bind(id)
        .bind(expected.as_str())
        .execute(pool)
        .await
        .context("failed to update post state")?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn upsert_connection(pool: &Pool, credential: &Credential) -> Result<()> {
    sqlx::query(
        "INSERT INTO connections (org_id, platform, account_id, access_token) VALUES (?, ?, ?, ?) \
         ON CONFLICT (org_id, platform) DO UPDATE SET account_id = excluded.account_id, access_token = excluded.access_token",
    )
    .bind(credential.org_id)
    .bind(credential.platform.as_str())
    .bind(&credential.account_id)
    .bind(&credential.access_token)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn fetch_connection(
    pool: &Pool,
    org_id: i64,
    platform: Platform,
) -> Result<Option<Credential>> {
    let row = sqlx::query(
        "SELECT account_id, access_token FROM connections WHERE org_id = ? AND platform = ?",
    )
    .bind(org_id)
    .bind(platform.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| Credential {
        org_id,
        platform,
        account_id: row.get("account_id"),
        access_token: row.get("access_token"),
    }))
}

#[instrument(skip_all)]
pub async fn record_delivery(
    pool: &Pool,
    post_id: i64,
    platform: Platform,
    receipt: &PublishReceipt,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO deliveries (post_id, platform, external_id, url) VALUES (?, ?, ?, ?) \
         ON CONFLICT (post_id, platform) DO NOTHING",
    )
    .bind(post_id)
    .bind(platform.as_str())
    .bind(&receipt.external_id)
    .bind(receipt.url.as_deref())
    .execute(pool)
    .await
    .context("failed to record delivery")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delivered_platforms(pool: &Pool, post_id: i64) -> Result<Vec<Platform>> {
    let names: Vec<String> =
        sqlx::query_scalar("SELECT platform FROM deliveries WHERE post_id = ? ORDER BY platform")
            .bind(post_id)
            .fetch_all(pool)
            .await?;
    Ok(names
        .iter()
        .filter_map(|name| Platform::parse_key(name))
        .collect())
}

#[instrument(skip_all)]
pub async fn insert_image(pool: &Pool, org_id: i64, url: &str) -> Result<i64> {
    let rec = sqlx::query("INSERT INTO images (org_id, url) VALUES (?, ?) RETURNING id")
        .bind(org_id)
        .bind(url)
        .fetch_one(pool)
        .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn fetch_images(pool: &Pool, org_id: i64) -> Result<Vec<ImageRecord>> {
    let rows = sqlx::query("SELECT id, org_id, url FROM images WHERE org_id = ? ORDER BY id")
        .bind(org_id)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| ImageRecord {
            id: row.get("id"),
            org_id: row.get("org_id"),
            url: row.get("url"),
        })
        .collect())
}

#[instrument(skip_all)]
pub async fn update_image_url(pool: &Pool, id: i64, url: &str) -> Result<()> {
    let res = sqlx::query("UPDATE images SET url = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(url)
        .bind(id)
        .execute(pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("image {} not found", id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn setup_pool() -> Pool {
        let pool = memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn content(pairs: &[(Platform, &str)]) -> PlatformContent {
        pairs.iter().map(|(p, c)| (*p, c.to_string())).collect()
    }

    #[test]
    fn prepare_url_adds_create_mode() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("db.sqlite");
        let url = prepare_sqlite_url(&format!("sqlite://{}", path.display()));
        assert!(url.ends_with("db.sqlite?mode=rwc"));
        assert!(td.path().join("nested").exists());
    }

    #[tokio::test]
    async fn due_posts_are_ordered_and_filtered() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let c = content(&[(Platform::Twitter, "hi")]);

        let later = insert_post(&pool, 1, &c, PostState::Draft, None).await.unwrap();
        schedule_post(&pool, later, now - Duration::minutes(1))
            .await
            .unwrap();
        let earlier = insert_post(&pool, 1, &c, PostState::Draft, None).await.unwrap();
        schedule_post(&pool, earlier, now - Duration::minutes(10))
            .await
            .unwrap();
        let future = insert_post(&pool, 1, &c, PostState::Draft, None).await.unwrap();
        schedule_post(&pool, future, now + Duration::minutes(10))
            .await
            .unwrap();
        let _draft = insert_post(&pool, 1, &c, PostState::Draft, None).await.unwrap();

        let due = fetch_due_posts(&pool, now).await.unwrap();
        let ids: Vec<i64> = due.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![earlier, later]);
        assert!(due.iter().all(|p| p.state == PostState::Scheduled));
        assert_eq!(due[0].content, c);
    }

    #[tokio::test]
    async fn schedule_only_moves_drafts() {
        let pool = setup_pool().await;
        let c = content(&[(Platform::Twitter, "hi")]);
        let id = insert_post(&pool, 1, &c, PostState::Draft, None).await.unwrap();
        assert!(schedule_post(&pool, id, Utc::now()).await.unwrap());
        assert!(!schedule_post(&pool, id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn state_update_is_conditional() {
        let pool = setup_pool().await;
        let c = content(&[(Platform::Twitter, "hi")]);
        let id = insert_post(&pool, 1, &c, PostState::Scheduled, Some(Utc::now()))
            .await
            .unwrap();
        let update = PostStateUpdate {
            state: PostState::Published,
            published_at: Some(Utc::now()),
        };
        assert!(update_post_state(&pool, id, &update, PostState::Scheduled)
            .await
            .unwrap());
        // Already published: a second conditional write does nothing.
        assert!(!update_post_state(&pool, id, &update, PostState::Scheduled)
            .await
            .unwrap());

        let post = fetch_post(&pool, id).await.unwrap().unwrap();
        assert_eq!(post.state, PostState::Published);
        assert!(post.published_at.is_some());
        assert!(post.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn loose_content_keys_are_normalized_on_read() {
        let pool = setup_pool().await;
        let id = insert_post_raw(
            &pool,
            1,
            r#"{"Twitter":"hi","LinkedIn":null,"TELEGRAM":"yo"}"#,
            PostState::Draft,
            None,
        )
        .await
        .unwrap();
        let post = fetch_post(&pool, id).await.unwrap().unwrap();
        assert_eq!(
            post.targeted_platforms(),
            vec![Platform::Twitter, Platform::Telegram]
        );
        assert!(fetch_post(&pool, id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn connections_and_deliveries() {
        let pool = setup_pool().await;
        let cred = Credential {
            org_id: 3,
            platform: Platform::Linkedin,
            account_id: "acct".into(),
            access_token: "t1".into(),
        };
        upsert_connection(&pool, &cred).await.unwrap();
        upsert_connection(
            &pool,
            &Credential {
                access_token: "t2".into(),
                ..cred.clone()
            },
        )
        .await
        .unwrap();
        let got = fetch_connection(&pool, 3, Platform::Linkedin)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.access_token, "t2");
        assert!(fetch_connection(&pool, 3, Platform::Twitter)
            .await
            .unwrap()
            .is_none());

        let c = content(&[(Platform::Linkedin, "hi")]);
        let post_id = insert_post(&pool, 3, &c, PostState::Draft, None).await.unwrap();
        let receipt = PublishReceipt {
            external_id: "ext-1".into(),
            url: None,
        };
        record_delivery(&pool, post_id, Platform::Linkedin, &receipt)
            .await
            .unwrap();
        record_delivery(&pool, post_id, Platform::Linkedin, &receipt)
            .await
            .unwrap();
        assert_eq!(
            delivered_platforms(&pool, post_id).await.unwrap(),
            vec![Platform::Linkedin]
        );
    }

    #[tokio::test]
    async fn image_urls_update() {
        let pool = setup_pool().await;
        let id = insert_image(&pool, 9, "https://cdn/a.png").await.unwrap();
        update_image_url(&pool, id, "https://cdn/watermarked/a.png")
            .await
            .unwrap();
        let images = fetch_images(&pool, 9).await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].url, "https://cdn/watermarked/a.png");
        assert!(update_image_url(&pool, id + 1, "x").await.is_err());
    }
}
