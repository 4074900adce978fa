//! Row shapes and boundary normalisation for stored posts.

use crate::model::{Platform, PlatformContent};
use serde_json::Value;
use tracing::warn;

/// Turn the loosely-typed stored content object into typed per-platform
/// content. Keys are matched case-insensitively; null, blank and non-string
/// entries mean "not targeted" and are dropped, as are unknown platform keys.
pub fn normalize_platform_content(raw: &Value) -> PlatformContent {
    let mut content = PlatformContent::new();
    let Some(map) = raw.as_object() else {
        if !raw.is_null() {
            warn!("platform content is not a JSON object; ignoring");
        }
        return content;
    };
    for (key, value) in map {
        let Some(platform) = Platform::parse_key(key) else {
            warn!(key = %key, "ignoring unknown platform key");
            continue;
        };
        let Some(text) = value.as_str().filter(|t| !t.trim().is_empty()) else {
            continue;
        };
        // First non-empty spelling wins when the same platform appears twice.
        content.entry(platform).or_insert_with(|| text.to_string());
    }
    content
}

/// Parse the `platform_content` column. Malformed JSON yields no targets.
pub fn parse_platform_content(raw: &str) -> PlatformContent {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => normalize_platform_content(&value),
        Err(err) => {
            warn!(?err, "stored platform content is not valid JSON");
            PlatformContent::new()
        }
    }
}
