//! Capture file adapters.
//!
//! The scrape step has written posts in more than one layout over time.
//! Each known layout gets its own serde type and is converted into
//! [`CapturedPost`]; anything else is rejected instead of guessed at.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::CaptureError;

/// Normalized post record consumed by the extractor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapturedPost {
    pub tweet_url: String,
    pub full_text: String,
    pub publish_time: String,
    pub images: Vec<String>,
    pub videos: Vec<String>,
    pub expand_urls: Vec<String>,
    pub screen_name: String,
    pub name: String,
}

fn default_name() -> String {
    "N/A".to_string()
}

#[derive(Deserialize)]
struct EnrichedUser {
    #[serde(rename = "screenName")]
    screen_name: String,
    #[serde(default = "default_name")]
    name: String,
}

/// Current capture layout (camelCase keys).
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnrichedTweet {
    user: EnrichedUser,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    videos: Vec<String>,
    #[serde(default)]
    expand_urls: Vec<String>,
    #[serde(default)]
    tweet_url: String,
    #[serde(default)]
    full_text: String,
    #[serde(default)]
    publish_time: String,
}

#[derive(Deserialize)]
struct LegacyUser {
    screen_name: String,
    #[serde(default = "default_name")]
    name: String,
}

/// Older snake_case layout.
#[derive(Deserialize)]
struct LegacyTweet {
    user: LegacyUser,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    videos: Vec<String>,
    #[serde(default)]
    expand_urls: Vec<String>,
    #[serde(default)]
    url: String,
    #[serde(default)]
    full_text: String,
    #[serde(default)]
    publish_time: String,
}

impl From<EnrichedTweet> for CapturedPost {
    fn from(t: EnrichedTweet) -> Self {
        Self {
            tweet_url: t.tweet_url,
            full_text: t.full_text,
            publish_time: t.publish_time,
            images: t.images,
            videos: t.videos,
            expand_urls: t.expand_urls,
            screen_name: t.user.screen_name,
            name: t.user.name,
        }
    }
}

impl From<LegacyTweet> for CapturedPost {
    fn from(t: LegacyTweet) -> Self {
        Self {
            tweet_url: t.url,
            full_text: t.full_text,
            publish_time: t.publish_time,
            images: t.images,
            videos: t.videos,
            expand_urls: t.expand_urls,
            screen_name: t.user.screen_name,
            name: t.user.name,
        }
    }
}

/// Convert one raw item, trying each known layout in turn.
fn adapt_item(item: Value) -> Option<CapturedPost> {
    let user = item.get("user")?;
    let post = if user.get("screenName").is_some() {
        serde_json::from_value::<EnrichedTweet>(item).ok()?.into()
    } else if user.get("screen_name").is_some() {
        serde_json::from_value::<LegacyTweet>(item).ok()?.into()
    } else {
        return None;
    };
    Some(post)
}

/// Pull the post array out of a top-level capture document.
fn post_array(doc: Value) -> Option<Vec<Value>> {
    match doc {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => ["tweets", "data"].iter().find_map(|key| match map.remove(*key) {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        }),
        _ => None,
    }
}

/// Normalize a parsed capture document.
pub fn parse_capture(doc: Value, path: &Path) -> Result<Vec<CapturedPost>, CaptureError> {
    let items = post_array(doc).ok_or_else(|| CaptureError::UnrecognizedShape {
        path: path.to_path_buf(),
    })?;

    let mut posts = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        match adapt_item(item) {
            Some(post) if !post.screen_name.is_empty() => posts.push(post),
            _ => warn!(file = %path.display(), index = i, "skipping capture item with unknown layout"),
        }
    }
    Ok(posts)
}

/// Read and normalize a capture file.
pub fn load_capture(path: &Path) -> Result<Vec<CapturedPost>, CaptureError> {
    let bytes = fs::read(path).map_err(|source| CaptureError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let doc: Value = serde_json::from_slice(&bytes).map_err(|source| CaptureError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let posts = parse_capture(doc, path)?;
    debug!(file = %path.display(), posts = posts.len(), "capture loaded");
    Ok(posts)
}

/// Read the list of followed users.
///
/// Accepts `["name", ..]`, `[{"legacy": {"screenName": ..}}, ..]`,
/// `[{"screenName": ..}, ..]` or `{"screenName": [..]}`.
pub fn load_followed_users(path: &Path) -> anyhow::Result<HashSet<String>> {
    let bytes = fs::read(path)?;
    let doc: Value = serde_json::from_slice(&bytes)?;
    let names: Vec<String> = match doc {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                item.as_str()
                    .or_else(|| item.pointer("/legacy/screenName").and_then(Value::as_str))
                    .or_else(|| item.get("screenName").and_then(Value::as_str))
                    .map(str::to_string)
            })
            .collect(),
        Value::Object(map) => map
            .get("screenName")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default(),
        _ => anyhow::bail!("unrecognized user list layout in {}", path.display()),
    };

    Ok(names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect())
}
