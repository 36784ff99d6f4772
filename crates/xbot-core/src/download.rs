//! Download manager.
//!
//! Per entry: `pending -> downloading -> downloaded | retrying | terminal`.
//! Every failure, whatever its cause, bumps the same persisted attempt
//! counter; reaching the cap makes the entry terminal.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::Client;
use tracing::{debug, info, warn};

use crate::alert::{alert_terminal_once, Alerter};
use crate::error::FetchError;
use crate::media::{now_stamp, parse_publish_time, DownloadInfo, MediaEntry, UploadErrorKind};

pub trait Fetcher {
    /// Stream `url` into `dest`, returning the number of bytes written.
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64, FetchError>;
}

/// Streamed HTTP GET with a bounded timeout.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let mut resp = self.client.get(url).send()?;
        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status().as_u16()));
        }

        if let Some(dir) = dest.parent() {
            fs::create_dir_all(dir)?;
        }
        // Write next to the target first so a cut-off transfer never looks complete.
        let part_path = part_path(dest);
        let written = {
            let mut out = BufWriter::new(File::create(&part_path)?);
            let written = resp.copy_to(&mut out)?;
            out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
            written
        };
        fs::rename(&part_path, dest)?;
        Ok(written)
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Where an entry's bytes live on disk.
pub fn local_path(media_dir: &Path, entry: &MediaEntry) -> PathBuf {
    media_dir.join(&entry.user.screen_name).join(&entry.file_name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Special type, nothing to fetch.
    Bypassed,
    AlreadyDownloaded,
    Downloaded { size: u64 },
    /// Failed, will be retried on a later run.
    Retrying { attempts: u32 },
    /// Permanently ineligible.
    Terminal,
}

pub struct DownloadManager<'a> {
    fetcher: &'a dyn Fetcher,
    alerter: &'a dyn Alerter,
    media_dir: PathBuf,
    max_attempts: u32,
}

impl<'a> DownloadManager<'a> {
    pub fn new(
        fetcher: &'a dyn Fetcher,
        alerter: &'a dyn Alerter,
        media_dir: PathBuf,
        max_attempts: u32,
    ) -> Self {
        Self {
            fetcher,
            alerter,
            media_dir,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    /// Advance one entry's download state. Never fails past this boundary.
    pub fn process_item(&self, mut entry: MediaEntry) -> (MediaEntry, DownloadOutcome) {
        if entry.media_type.is_special() {
            if !entry.is_downloaded {
                entry.is_downloaded = true;
                entry.download_info = DownloadInfo {
                    success: true,
                    size: Some(0),
                    timestamp: Some(now_stamp()),
                    attempts: 0,
                };
            }
            return (entry, DownloadOutcome::Bypassed);
        }

        if entry.is_downloaded {
            return (entry, DownloadOutcome::AlreadyDownloaded);
        }

        if entry.terminal_error().is_some() {
            alert_terminal_once(self.alerter, &mut entry);
            return (entry, DownloadOutcome::Terminal);
        }

        if entry.download_info.attempts >= self.max_attempts {
            self.make_terminal(&mut entry);
            return (entry, DownloadOutcome::Terminal);
        }

        let dest = local_path(&self.media_dir, &entry);
        debug!(entry = %entry.id(), url = %entry.url, "downloading");
        match self.fetcher.fetch(&entry.url, &dest) {
            Ok(size) => {
                set_publish_mtime(&dest, &entry.publish_time);
                entry.is_downloaded = true;
                entry.download_info = DownloadInfo {
                    success: true,
                    size: Some(size),
                    timestamp: Some(now_stamp()),
                    attempts: 0,
                };
                info!(entry = %entry.id(), size, "downloaded");
                (entry, DownloadOutcome::Downloaded { size })
            }
            Err(e) => {
                entry.is_downloaded = false;
                entry.download_info.success = false;
                entry.download_info.timestamp = Some(now_stamp());
                entry.download_info.attempts += 1;
                let attempts = entry.download_info.attempts;
                warn!(entry = %entry.id(), attempts, error = %e, "download failed");

                if attempts >= self.max_attempts {
                    self.make_terminal(&mut entry);
                    (entry, DownloadOutcome::Terminal)
                } else {
                    (entry, DownloadOutcome::Retrying { attempts })
                }
            }
        }
    }

    fn make_terminal(&self, entry: &mut MediaEntry) {
        let message = format!(
            "download failed {} times: {}",
            entry.download_info.attempts, entry.url
        );
        entry.mark_terminal(UploadErrorKind::MaxDownloadAttempts, message);
        warn!(entry = %entry.id(), "download attempts exhausted");
        alert_terminal_once(self.alerter, entry);
    }
}

/// Stamp the file with the post's publish time, when it parses.
fn set_publish_mtime(path: &Path, publish_time: &str) {
    let Some(dt) = parse_publish_time(publish_time) else { return };
    if let Some(local) = dt.and_local_timezone(chrono::Local).single() {
        let ft = filetime::FileTime::from_unix_time(local.timestamp(), 0);
        if let Err(e) = filetime::set_file_mtime(path, ft) {
            debug!(file = %path.display(), error = %e, "failed to set modification time");
        }
    }
}
