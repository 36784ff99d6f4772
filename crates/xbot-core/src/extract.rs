use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::capture::CapturedPost;
use crate::error::LedgerError;
use crate::ledger::Ledger;
use crate::media::{entry_id, MediaEntry, MediaType, UserRef};

static STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/status/([^/?#]+)(?:[/?#]|$)").unwrap());

/// File name of a media URL: query stripped, last path segment.
pub fn file_name_from_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string()
}

/// Post id from a permalink, empty when absent or not numeric.
pub fn tweet_id_from_url(url: &str) -> String {
    STATUS_RE
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or("")
        .to_string()
}

/// Classify an "expand" URL; anything that is not a space or broadcast is ignored.
pub fn classify_expand_url(url: &str) -> Option<MediaType> {
    if url.contains("/i/spaces/") {
        Some(MediaType::Space)
    } else if url.contains("/i/broadcasts/") {
        Some(MediaType::Broadcast)
    } else {
        None
    }
}

/// Entries whose identities made it into the ledger, plus the ledger error
/// that stopped extraction early, if any.
///
/// The entries must be persisted even when `failure` is set: the ledger
/// already counts them as seen.
#[derive(Debug, Default)]
pub struct Extraction {
    pub entries: Vec<MediaEntry>,
    pub failure: Option<LedgerError>,
}

/// Turn captured posts into entries not yet seen by the ledger.
///
/// Each new identity is recorded in the ledger before the entry is returned.
/// Extraction stops at the first identity the ledger fails to record.
pub fn extract_entries(
    posts: &[CapturedPost],
    ledger: &mut Ledger,
    users: Option<&HashSet<String>>,
    read_time: &str,
) -> Extraction {
    let mut entries = Vec::new();
    let mut skipped = 0usize;

    for post in posts {
        if let Some(users) = users {
            if !users.contains(&post.screen_name) {
                continue;
            }
        }

        let tweet_id = tweet_id_from_url(&post.tweet_url);
        let user = UserRef {
            screen_name: post.screen_name.clone(),
            name: post.name.clone(),
        };

        let media = post
            .images
            .iter()
            .map(|u| (u, Some(MediaType::Image)))
            .chain(post.videos.iter().map(|u| (u, Some(MediaType::Video))))
            .chain(post.expand_urls.iter().map(|u| (u, classify_expand_url(u))));

        for (url, media_type) in media {
            let Some(media_type) = media_type else { continue };
            let file_name = file_name_from_url(url);
            if file_name.is_empty() {
                continue;
            }

            let id = entry_id(&file_name, &user.screen_name, media_type);
            if ledger.contains(&id) {
                skipped += 1;
                continue;
            }

            if let Err(e) = ledger.record(&id) {
                warn!(entry = %id, error = %e, "failed to record entry in ledger, stopping extraction");
                return Extraction {
                    entries,
                    failure: Some(e),
                };
            }
            entries.push(MediaEntry {
                file_name,
                tweet_id: tweet_id.clone(),
                user: user.clone(),
                media_type,
                url: url.clone(),
                full_text: post.full_text.clone(),
                publish_time: post.publish_time.clone(),
                read_time: read_time.to_string(),
                ..Default::default()
            });
        }
    }

    debug!(skipped, "entries already in ledger");
    info!(new = entries.len(), "extracted entries");
    Extraction {
        entries,
        failure: None,
    }
}
