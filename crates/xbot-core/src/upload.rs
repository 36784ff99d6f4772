//! Upload/delivery manager.
//!
//! Entries of one post are delivered as a text notice (special types), a
//! single media message, or one grouped message. A group that is too big,
//! fails, or comes back with the wrong number of message ids is resent item
//! by item; only a failure at that level is recorded on the entry.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::alert::{alert_terminal_once, send_alert, Alerter};
use crate::caption::{build_caption, build_notice};
use crate::config::LimitsConfig;
use crate::download::local_path;
use crate::error::DeliveryError;
use crate::media::{now_stamp, MediaEntry, UploadErrorKind, UploadInfo};
use crate::notifier::{ChatNotifier, MediaKind, OutgoingMedia};

#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub image_max_bytes: u64,
    pub video_max_bytes: u64,
    pub group_max_bytes: u64,
    pub max_group_items: usize,
    pub caption_max_chars: usize,
}

impl From<&LimitsConfig> for UploadLimits {
    fn from(l: &LimitsConfig) -> Self {
        Self {
            image_max_bytes: l.image_max_bytes,
            video_max_bytes: l.video_max_bytes,
            group_max_bytes: l.group_max_bytes,
            max_group_items: l.max_group_items,
            caption_max_chars: l.caption_max_chars,
        }
    }
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self::from(&LimitsConfig::default())
    }
}

impl UploadLimits {
    fn ceiling(&self, kind: MediaKind) -> u64 {
        match kind {
            MediaKind::Photo => self.image_max_bytes,
            MediaKind::Video => self.video_max_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Text,
    Single,
    Group,
}

/// Strategy for each eligible entry, by index. Media entries of the same
/// post are grouped when there are two or more of them.
pub fn classify(entries: &[MediaEntry]) -> Vec<(usize, Strategy)> {
    let eligible: Vec<usize> = (0..entries.len()).filter(|&i| is_eligible(&entries[i])).collect();
    eligible
        .iter()
        .map(|&i| {
            let entry = &entries[i];
            if entry.media_type.is_special() {
                return (i, Strategy::Text);
            }
            let key = entry.post_key();
            let siblings = eligible
                .iter()
                .filter(|&&j| !entries[j].media_type.is_special() && entries[j].post_key() == key)
                .count();
            (i, if siblings >= 2 { Strategy::Group } else { Strategy::Single })
        })
        .collect()
}

/// Not uploaded, not terminal, and either special or downloaded.
pub fn is_eligible(entry: &MediaEntry) -> bool {
    !entry.is_uploaded
        && entry.terminal_error().is_none()
        && (entry.media_type.is_special() || entry.is_downloaded)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub uploaded: usize,
    pub failed: usize,
    pub terminal: usize,
}

pub struct UploadManager<'a> {
    notifier: &'a dyn ChatNotifier,
    alerter: &'a dyn Alerter,
    chat_id: String,
    media_dir: PathBuf,
    limits: UploadLimits,
}

impl<'a> UploadManager<'a> {
    pub fn new(
        notifier: &'a dyn ChatNotifier,
        alerter: &'a dyn Alerter,
        chat_id: String,
        media_dir: PathBuf,
        limits: UploadLimits,
    ) -> Self {
        Self {
            notifier,
            alerter,
            chat_id,
            media_dir,
            limits,
        }
    }

    /// Deliver the entries of one post, returning them with updated state.
    pub fn process_items(&self, mut entries: Vec<MediaEntry>) -> (Vec<MediaEntry>, UploadStats) {
        let mut stats = UploadStats::default();

        for entry in entries.iter_mut().filter(|e| !e.is_uploaded && e.terminal_error().is_some()) {
            alert_terminal_once(self.alerter, entry);
        }

        let plan = classify(&entries);
        let mut group: Vec<usize> = Vec::new();
        for (i, strategy) in plan {
            match strategy {
                Strategy::Text => self.deliver_text(&mut entries[i], &mut stats),
                Strategy::Single => self.deliver_single(&mut entries[i], &mut stats),
                Strategy::Group => group.push(i),
            }
        }

        // Group members can belong to different posts only if the caller
        // mixed posts; split them so each send stays within one post.
        let mut by_post: Vec<(String, Vec<usize>)> = Vec::new();
        for i in group {
            let key = entries[i].post_key();
            match by_post.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(i),
                None => by_post.push((key, vec![i])),
            }
        }
        for (_, members) in by_post {
            for chunk in members.chunks(self.limits.max_group_items.max(1)) {
                if chunk.len() == 1 {
                    self.deliver_single(&mut entries[chunk[0]], &mut stats);
                } else {
                    self.deliver_group(&mut entries, chunk, &mut stats);
                }
            }
        }

        (entries, stats)
    }

    fn deliver_text(&self, entry: &mut MediaEntry, stats: &mut UploadStats) {
        let text = build_notice(entry, self.limits.caption_max_chars);
        let result = self.notifier.send_text(&self.chat_id, &text);
        self.record(entry, result, stats);
    }

    fn deliver_single(&self, entry: &mut MediaEntry, stats: &mut UploadStats) {
        let result = self
            .single_media(entry)
            .and_then(|media| self.notifier.send_single_media(&self.chat_id, media));
        self.record(entry, result, stats);
    }

    fn deliver_group(&self, entries: &mut [MediaEntry], members: &[usize], stats: &mut UploadStats) {
        let total: u64 = members.iter().map(|&i| self.known_size(&entries[i])).sum();
        if total > self.limits.group_max_bytes {
            info!(
                items = members.len(),
                total,
                limit = self.limits.group_max_bytes,
                "group too large, sending items one by one"
            );
            return self.fallback(entries, members, stats);
        }

        let assembled: Result<Vec<OutgoingMedia>, DeliveryError> = members
            .iter()
            .enumerate()
            .map(|(n, &i)| {
                let mut media = self.single_media(&entries[i])?;
                if n > 0 {
                    media.caption = None;
                }
                Ok(media)
            })
            .collect();

        let sent = assembled.and_then(|media| self.notifier.send_media_group(&self.chat_id, media));
        match sent {
            Ok(ids) if ids.len() == members.len() => {
                for (&i, id) in members.iter().zip(ids) {
                    mark_uploaded(&mut entries[i], id);
                    stats.uploaded += 1;
                }
                info!(items = members.len(), "media group delivered");
            }
            Ok(ids) => {
                warn!(
                    submitted = members.len(),
                    delivered = ids.len(),
                    "media group answer does not match, resending items one by one"
                );
                self.fallback(entries, members, stats);
            }
            Err(e) => {
                warn!(error = %e, "media group failed, resending items one by one");
                self.fallback(entries, members, stats);
            }
        }
    }

    fn fallback(&self, entries: &mut [MediaEntry], members: &[usize], stats: &mut UploadStats) {
        for &i in members {
            self.deliver_single(&mut entries[i], stats);
        }
    }

    /// Size for the group check: persisted metadata first, then the file.
    fn known_size(&self, entry: &MediaEntry) -> u64 {
        entry
            .download_info
            .size
            .filter(|&s| s > 0)
            .or_else(|| fs::metadata(local_path(&self.media_dir, entry)).ok().map(|m| m.len()))
            .unwrap_or(0)
    }

    /// Read an entry's bytes, refusing anything over its type's ceiling
    /// before the transfer is attempted.
    fn single_media(&self, entry: &MediaEntry) -> Result<OutgoingMedia, DeliveryError> {
        let kind = MediaKind::from_media_type(entry.media_type).ok_or_else(|| {
            DeliveryError::Api(format!("{} entries carry no media", entry.media_type))
        })?;
        let path = local_path(&self.media_dir, entry);
        let size = fs::metadata(&path)?.len();
        let limit = self.limits.ceiling(kind);
        if size > limit {
            return Err(DeliveryError::FileTooLarge(format!(
                "{} is {} bytes, limit {} bytes",
                entry.file_name, size, limit
            )));
        }

        let data = fs::read(&path)?;
        Ok(OutgoingMedia {
            data,
            file_name: entry.file_name.clone(),
            kind,
            caption: Some(build_caption(entry, self.limits.caption_max_chars)),
        })
    }

    fn record(&self, entry: &mut MediaEntry, result: Result<i64, DeliveryError>, stats: &mut UploadStats) {
        match result {
            Ok(id) => {
                mark_uploaded(entry, id);
                stats.uploaded += 1;
                debug!(entry = %entry.id(), message_id = id, "delivered");
            }
            Err(DeliveryError::FileTooLarge(reason)) => {
                warn!(entry = %entry.id(), %reason, "file too large, giving up");
                entry.mark_terminal(UploadErrorKind::FileTooLarge, reason);
                alert_terminal_once(self.alerter, entry);
                stats.terminal += 1;
            }
            Err(e) => {
                warn!(entry = %entry.id(), error = %e, "delivery failed, will download again");
                let info = &mut entry.upload_info;
                info.success = false;
                info.error_kind = Some(UploadErrorKind::ApiError);
                info.message = Some(e.to_string());
                info.timestamp = Some(now_stamp());
                entry.is_uploaded = false;
                // The local copy may be what broke the send.
                entry.is_downloaded = false;
                send_alert(
                    self.alerter,
                    &format!(
                        "api_error: {} (@{}, {})\n{}",
                        entry.file_name, entry.user.screen_name, entry.media_type, e
                    ),
                );
                stats.failed += 1;
            }
        }
    }
}

fn mark_uploaded(entry: &mut MediaEntry, message_id: i64) {
    entry.is_uploaded = true;
    entry.upload_info = UploadInfo {
        success: true,
        message_id: Some(message_id),
        error_kind: None,
        message: None,
        timestamp: Some(now_stamp()),
        notification_sent: entry.upload_info.notification_sent,
    };
}
