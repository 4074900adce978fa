use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Destination platforms a post can target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitter,
    Linkedin,
    Facebook,
    Instagram,
    Telegram,
    Threads,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown platform: {0}")]
pub struct UnknownPlatform(pub String);

impl Platform {
    pub const ALL: [Platform; 6] = [
        Platform::Twitter,
        Platform::Linkedin,
        Platform::Facebook,
        Platform::Instagram,
        Platform::Telegram,
        Platform::Threads,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Twitter => "twitter",
            Platform::Linkedin => "linkedin",
            Platform::Facebook => "facebook",
            Platform::Instagram => "instagram",
            Platform::Telegram => "telegram",
            Platform::Threads => "threads",
        }
    }

    /// Parse a platform key as it appears in stored content or request bodies.
    /// Case and surrounding whitespace are ignored; a few legacy aliases are accepted.
    pub fn parse_key(key: &str) -> Option<Platform> {
        match key.trim().to_ascii_lowercase().as_str() {
            "twitter" | "x" => Some(Platform::Twitter),
            "linkedin" | "linked_in" => Some(Platform::Linkedin),
            "facebook" | "fb" => Some(Platform::Facebook),
            "instagram" | "ig" => Some(Platform::Instagram),
            "telegram" => Some(Platform::Telegram),
            "threads" => Some(Platform::Threads),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::parse_key(s).ok_or_else(|| UnknownPlatform(s.to_string()))
    }
}

/// Persisted lifecycle state of a post.
///
/// There is no `Failed` state: a dispatch that does not fully succeed leaves
/// the post `Scheduled` and the next tick picks it up again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PostState {
    Draft,
    Scheduled,
    Published,
}

impl PostState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostState::Draft => "draft",
            PostState::Scheduled => "scheduled",
            PostState::Published => "published",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(PostState::Draft),
            "scheduled" => Some(PostState::Scheduled),
            "published" => Some(PostState::Published),
            _ => None,
        }
    }
}

/// Typed per-platform content. Only targeted platforms have an entry.
pub type PlatformContent = BTreeMap<Platform, String>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Post {
    pub id: i64,
    pub org_id: i64,
    pub content: PlatformContent,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub state: PostState,
    pub published_at: Option<DateTime<Utc>>,
}

impl Post {
    /// Platforms with non-empty content, in stable order. Recomputed on every
    /// call because the content mapping can change between dispatches.
    pub fn targeted_platforms(&self) -> Vec<Platform> {
        self.content
            .iter()
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(platform, _)| *platform)
            .collect()
    }

    pub fn content_for(&self, platform: Platform) -> Option<&str> {
        self.content
            .get(&platform)
            .map(String::as_str)
            .filter(|text| !text.trim().is_empty())
    }

    /// `published` implies `published_at`; `scheduled` implies `scheduled_for`.
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        match self.state {
            PostState::Published if self.published_at.is_none() => {
                Err("published post must have published_at")
            }
            PostState::Scheduled if self.scheduled_for.is_none() => {
                Err("scheduled post must have scheduled_for")
            }
            _ => Ok(()),
        }
    }
}

/// The single write the lifecycle manager performs on a post.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostStateUpdate {
    pub state: PostState,
    pub published_at: Option<DateTime<Utc>>,
}

/// A live platform connection for an organization. Read-only from this crate.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub org_id: i64,
    pub platform: Platform,
    pub account_id: String,
    pub access_token: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("org_id", &self.org_id)
            .field("platform", &self.platform)
            .field("account_id", &self.account_id)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

/// What a platform adapter returns after a successful publish.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishReceipt {
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: i64,
    pub org_id: i64,
    pub url: String,
}

/// A trending topic that the generation job turns into a draft post.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrendItem {
    pub id: String,
    pub org_id: i64,
    pub topic: String,
    pub platforms: Vec<Platform>,
}
