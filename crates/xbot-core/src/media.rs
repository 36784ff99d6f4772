use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Timestamp format used for every time the pipeline itself records.
pub const STAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Current local time in [`STAMP_FORMAT`].
pub fn now_stamp() -> String {
    chrono::Local::now().format(STAMP_FORMAT).to_string()
}

/// Parse a capture `publishTime`. Accepts RFC 3339 and the naive
/// `YYYY-MM-DDTHH:MM:SS` form the capture step writes.
pub fn parse_publish_time(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    for fmt in [STAMP_FORMAT, "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    Image,
    Video,
    /// Audio space: no bytes, delivered as a text notice.
    Space,
    /// Live broadcast: no bytes, delivered as a text notice.
    Broadcast,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Space => "space",
            MediaType::Broadcast => "broadcast",
        }
    }

    /// Special types carry no downloadable bytes.
    pub fn is_special(&self) -> bool {
        matches!(self, MediaType::Space | MediaType::Broadcast)
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserRef {
    #[serde(rename = "screenName")]
    pub screen_name: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadErrorKind {
    FileTooLarge,
    MaxDownloadAttempts,
    ApiError,
}

impl UploadErrorKind {
    /// Terminal kinds are never retried, only alerted once.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadErrorKind::FileTooLarge | UploadErrorKind::MaxDownloadAttempts)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadErrorKind::FileTooLarge => "file_too_large",
            UploadErrorKind::MaxDownloadAttempts => "max_download_attempts",
            UploadErrorKind::ApiError => "api_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownloadInfo {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Failed attempts so far; persisted so it survives restarts.
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UploadInfo {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<UploadErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Latches true once the terminal alert for this entry went out.
    #[serde(default)]
    pub notification_sent: bool,
}

/// One downloadable (or special-type) media reference from a captured post.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaEntry {
    pub file_name: String,
    #[serde(default)]
    pub tweet_id: String,
    pub user: UserRef,
    pub media_type: MediaType,
    pub url: String,
    #[serde(rename = "fullText", default)]
    pub full_text: String,
    #[serde(rename = "publishTime", default)]
    pub publish_time: String,
    #[serde(default)]
    pub read_time: String,
    #[serde(default)]
    pub is_downloaded: bool,
    #[serde(default)]
    pub download_info: DownloadInfo,
    #[serde(default)]
    pub is_uploaded: bool,
    #[serde(default)]
    pub upload_info: UploadInfo,
}

/// Globally unique, run-stable identity of an entry.
pub fn entry_id(file_name: &str, screen_name: &str, media_type: MediaType) -> String {
    format!("{}_{}_{}", file_name, screen_name, media_type.as_str())
}

impl MediaEntry {
    pub fn id(&self) -> String {
        entry_id(&self.file_name, &self.user.screen_name, self.media_type)
    }

    pub fn terminal_error(&self) -> Option<UploadErrorKind> {
        self.upload_info.error_kind.filter(UploadErrorKind::is_terminal)
    }

    /// Record a terminal classification, keeping any earlier timestamp and
    /// notification flag.
    pub fn mark_terminal(&mut self, kind: UploadErrorKind, message: impl Into<String>) {
        let info = &mut self.upload_info;
        info.success = false;
        info.error_kind = Some(kind);
        info.message = Some(message.into());
        if info.timestamp.is_none() {
            info.timestamp = Some(now_stamp());
        }
        self.is_uploaded = false;
    }

    /// Whether the pipeline still has anything to do for this entry.
    pub fn needs_work(&self) -> bool {
        if self.is_uploaded {
            return false;
        }
        match self.terminal_error() {
            Some(_) => !self.upload_info.notification_sent,
            None => true,
        }
    }

    /// Grouping key of the parent post.
    pub fn post_key(&self) -> String {
        if self.tweet_id.is_empty() {
            format!("{}@{}", self.user.screen_name, self.publish_time)
        } else {
            self.tweet_id.clone()
        }
    }
}
