//! One end-to-end run over a capture file.
//!
//! load capture -> extract (ledger) -> merge into the output record -> per
//! post: download then deliver, persisting the record after every post.
//! A run that stops anywhere can be repeated; finished work is never redone.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::alert::{send_alert, Alerter};
use crate::cancel::CancellationToken;
use crate::capture::load_capture;
use crate::config::Config;
use crate::download::{DownloadManager, DownloadOutcome, Fetcher};
use crate::extract::extract_entries;
use crate::ledger::Ledger;
use crate::media::{now_stamp, MediaEntry};
use crate::notifier::ChatNotifier;
use crate::state::OutputRecord;
use crate::upload::{UploadLimits, UploadManager};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub capture_file: PathBuf,
    pub output_file: PathBuf,
    /// Only posts by these users are extracted; `None` takes everyone.
    pub users: Option<HashSet<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub inserted: usize,
    pub downloaded: usize,
    pub uploaded: usize,
    pub failed: usize,
    pub terminal: usize,
    pub units: usize,
    pub cancelled: bool,
}

impl RunResult {
    pub fn absorb(&mut self, other: &RunResult) {
        self.inserted += other.inserted;
        self.downloaded += other.downloaded;
        self.uploaded += other.uploaded;
        self.failed += other.failed;
        self.terminal += other.terminal;
        self.units += other.units;
        self.cancelled |= other.cancelled;
    }

    fn summary(&self, output: &std::path::Path) -> String {
        format!(
            "run summary for {}: {} new, {} downloaded, {} delivered, {} failed, {} given up",
            output.display(),
            self.inserted,
            self.downloaded,
            self.uploaded,
            self.failed,
            self.terminal
        )
    }
}

pub struct Pipeline<'a> {
    config: &'a Config,
    chat_id: String,
    fetcher: &'a dyn Fetcher,
    notifier: &'a dyn ChatNotifier,
    alerter: &'a dyn Alerter,
    cancel_token: Option<CancellationToken>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a Config,
        chat_id: String,
        fetcher: &'a dyn Fetcher,
        notifier: &'a dyn ChatNotifier,
        alerter: &'a dyn Alerter,
    ) -> Self {
        Self {
            config,
            chat_id,
            fetcher,
            notifier,
            alerter,
            cancel_token: None,
        }
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_token.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    pub fn run(&self, options: &RunOptions) -> anyhow::Result<RunResult> {
        let paths = &self.config.paths;
        let limits = &self.config.limits;
        let pretty = self.config.ledger.pretty;
        let mut result = RunResult::default();

        let posts = load_capture(&options.capture_file)?;
        info!(file = %options.capture_file.display(), posts = posts.len(), "capture loaded");

        let mut ledger = Ledger::load(&paths.ledger_dir, &paths.shard_prefix, limits.max_entries_per_shard, pretty)
            .context("failed to load ledger")?;
        debug!(known = ledger.len(), "ledger loaded");

        // Open the record before the ledger is touched so a corrupt record
        // does not cost the identities extracted for it.
        let mut record = OutputRecord::load(&options.output_file, pretty)?;

        let extraction = extract_entries(&posts, &mut ledger, options.users.as_ref(), &now_stamp());
        result.inserted = record.merge(extraction.entries);
        record.save()?;
        // Whatever the ledger took in is on disk now; only then give up.
        if let Some(e) = extraction.failure {
            return Err(anyhow::Error::new(e).context("failed to record entries in ledger"));
        }
        info!(
            output = %record.path().display(),
            inserted = result.inserted,
            total = record.entries.len(),
            "output record updated"
        );

        let downloader = DownloadManager::new(
            self.fetcher,
            self.alerter,
            paths.media_dir.clone(),
            limits.max_download_attempts,
        );
        let uploader = UploadManager::new(
            self.notifier,
            self.alerter,
            self.chat_id.clone(),
            paths.media_dir.clone(),
            UploadLimits::from(limits),
        );

        for key in pending_units(&record.entries) {
            if self.is_cancelled() {
                warn!("cancelled, stopping before the next post");
                result.cancelled = true;
                break;
            }

            let members: Vec<usize> = record
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.post_key() == key)
                .map(|(i, _)| i)
                .collect();

            for &i in &members {
                let entry = std::mem::take(&mut record.entries[i]);
                let was_terminal = entry.terminal_error().is_some();
                let (entry, outcome) = downloader.process_item(entry);
                match outcome {
                    DownloadOutcome::Downloaded { .. } => result.downloaded += 1,
                    DownloadOutcome::Retrying { .. } => result.failed += 1,
                    DownloadOutcome::Terminal if !was_terminal => result.terminal += 1,
                    _ => {}
                }
                record.entries[i] = entry;
            }

            let batch: Vec<MediaEntry> =
                members.iter().map(|&i| std::mem::take(&mut record.entries[i])).collect();
            let (batch, stats) = uploader.process_items(batch);
            for (&i, entry) in members.iter().zip(batch) {
                record.entries[i] = entry;
            }
            result.uploaded += stats.uploaded;
            result.failed += stats.failed;
            result.terminal += stats.terminal;
            result.units += 1;

            record.save()?;
        }

        info!(
            inserted = result.inserted,
            downloaded = result.downloaded,
            uploaded = result.uploaded,
            failed = result.failed,
            terminal = result.terminal,
            units = result.units,
            "run finished"
        );

        if self.config.webhook.push_summary && (result.uploaded > 0 || result.failed > 0) {
            send_alert(self.alerter, &result.summary(record.path()));
        }

        Ok(result)
    }
}

/// Post keys with outstanding work, in record order.
fn pending_units(entries: &[MediaEntry]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    for entry in entries {
        let key = entry.post_key();
        if seen.contains(&key) {
            continue;
        }
        if entries.iter().any(|e| e.needs_work() && e.post_key() == key) {
            keys.push(key.clone());
        }
        seen.insert(key);
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaType, UploadErrorKind};
    use crate::ledger::SHARD_PREFIX;
    use crate::test_support::{FailingAlerter, FakeFetcher, FakeNotifier, RecordingAlerter};
    use serde_json::json;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn config(root: &Path) -> Config {
        let mut config = Config::default();
        config.paths.ledger_dir = root.join("db");
        config.paths.media_dir = root.join("media");
        config
    }

    fn write_capture(root: &Path) -> PathBuf {
        let path = root.join("capture.json");
        let doc = json!([
            {
                "user": {"screenName": "alice", "name": "Alice"},
                "images": [
                    "https://pbs.twimg.com/media/a1.jpg?name=orig",
                    "https://pbs.twimg.com/media/a2.jpg?name=orig"
                ],
                "tweetUrl": "https://x.com/alice/status/1",
                "fullText": "two photos",
                "publishTime": "2024-05-01T10:00:00"
            },
            {
                "user": {"screenName": "bob", "name": "Bob"},
                "videos": ["https://video.twimg.com/ext_tw_video/9/pu/vid/b1.mp4"],
                "expandUrls": ["https://x.com/i/spaces/1space"],
                "tweetUrl": "https://x.com/bob/status/2",
                "fullText": "video and a space",
                "publishTime": "2024-05-01T09:00:00"
            }
        ]);
        fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();
        path
    }

    fn options(root: &Path) -> RunOptions {
        RunOptions {
            capture_file: write_capture(root),
            output_file: root.join("output").join("2024-05").join("2024-05-01.json"),
            users: None,
        }
    }

    fn read_output(options: &RunOptions) -> Vec<MediaEntry> {
        serde_json::from_str(&fs::read_to_string(&options.output_file).unwrap()).unwrap()
    }

    #[test]
    fn test_full_run_then_rerun_is_noop() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let options = options(dir.path());
        let fetcher = FakeFetcher::serving(b"bytes".to_vec());
        let notifier = FakeNotifier::default();
        let alerter = RecordingAlerter::default();
        let pipeline = Pipeline::new(&config, "@chan".to_string(), &fetcher, &notifier, &alerter);

        let first = pipeline.run(&options).unwrap();
        assert_eq!(first.inserted, 4);
        assert_eq!(first.downloaded, 3);
        assert_eq!(first.uploaded, 4);
        assert_eq!(first.units, 2);
        assert_eq!(notifier.groups(), 1);
        assert_eq!(notifier.singles(), 1);
        assert_eq!(notifier.texts(), 1);

        let saved = read_output(&options);
        assert_eq!(saved.len(), 4);
        assert!(saved.iter().all(|e| e.is_uploaded));
        // Sorted by publish time: bob's post comes first.
        assert_eq!(saved[0].user.screen_name, "bob");
        assert!(dir.path().join("media").join("alice").join("a1.jpg").exists());

        let second = pipeline.run(&options).unwrap();
        assert_eq!(second, RunResult::default());
        assert_eq!(notifier.sent.borrow().len(), 3);
        assert_eq!(fetcher.calls(), 3);
        assert_eq!(read_output(&options), saved);
    }

    #[test]
    fn test_user_filter() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let mut options = options(dir.path());
        options.users = Some(HashSet::from(["alice".to_string()]));
        let fetcher = FakeFetcher::serving(b"bytes".to_vec());
        let notifier = FakeNotifier::default();
        let alerter = RecordingAlerter::default();
        let pipeline = Pipeline::new(&config, "@chan".to_string(), &fetcher, &notifier, &alerter);

        let result = pipeline.run(&options).unwrap();
        assert_eq!(result.inserted, 2);
        assert!(read_output(&options).iter().all(|e| e.user.screen_name == "alice"));
    }

    #[test]
    fn test_download_failures_carry_over_runs() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.limits.max_download_attempts = 2;
        let options = options(dir.path());
        let fetcher = FakeFetcher::failing();
        let notifier = FakeNotifier::default();
        let alerter = RecordingAlerter::default();
        let pipeline = Pipeline::new(&config, "@chan".to_string(), &fetcher, &notifier, &alerter);

        let first = pipeline.run(&options).unwrap();
        assert_eq!(first.failed, 3);
        // The space needs no download and goes out as text.
        assert_eq!(first.uploaded, 1);
        assert_eq!(alerter.count(), 0);

        let second = pipeline.run(&options).unwrap();
        assert_eq!(second.terminal, 3);
        assert_eq!(alerter.count(), 3);

        let third = pipeline.run(&options).unwrap();
        assert_eq!(third.units, 0);
        assert_eq!(alerter.count(), 3);
        assert_eq!(fetcher.calls(), 6);

        let saved = read_output(&options);
        let terminal: Vec<&MediaEntry> = saved
            .iter()
            .filter(|e| e.media_type != MediaType::Space)
            .collect();
        assert!(terminal
            .iter()
            .all(|e| e.terminal_error() == Some(UploadErrorKind::MaxDownloadAttempts)
                && e.upload_info.notification_sent
                && e.download_info.attempts == 2));
    }

    #[test]
    fn test_cancelled_run_keeps_merged_record() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let options = options(dir.path());
        let fetcher = FakeFetcher::serving(b"bytes".to_vec());
        let notifier = FakeNotifier::default();
        let alerter = RecordingAlerter::default();
        let token = CancellationToken::new();
        token.cancel();
        let pipeline = Pipeline::new(&config, "@chan".to_string(), &fetcher, &notifier, &alerter)
            .with_cancel_token(token);

        let result = pipeline.run(&options).unwrap();
        assert!(result.cancelled);
        assert_eq!(result.units, 0);
        assert_eq!(fetcher.calls(), 0);
        assert_eq!(read_output(&options).len(), 4);

        // A later, uncancelled run picks the work up.
        let resumed = Pipeline::new(&config, "@chan".to_string(), &fetcher, &notifier, &alerter)
            .run(&options)
            .unwrap();
        assert_eq!(resumed.inserted, 0);
        assert_eq!(resumed.uploaded, 4);
    }

    #[test]
    fn test_corrupt_output_record_is_not_overwritten() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let options = options(dir.path());
        fs::create_dir_all(options.output_file.parent().unwrap()).unwrap();
        fs::write(&options.output_file, "{ not json").unwrap();
        let fetcher = FakeFetcher::serving(b"bytes".to_vec());
        let notifier = FakeNotifier::default();
        let alerter = RecordingAlerter::default();
        let pipeline = Pipeline::new(&config, "@chan".to_string(), &fetcher, &notifier, &alerter);

        assert!(pipeline.run(&options).is_err());
        assert_eq!(fs::read_to_string(&options.output_file).unwrap(), "{ not json");

        // Identities were not consumed: a repaired record gets them all.
        fs::remove_file(&options.output_file).unwrap();
        assert_eq!(pipeline.run(&options).unwrap().inserted, 4);
    }

    #[test]
    fn test_unrecognized_capture_aborts() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let mut options = options(dir.path());
        fs::write(&options.capture_file, r#"{"unexpected": 1}"#).unwrap();
        options.output_file = dir.path().join("out.json");
        let fetcher = FakeFetcher::serving(b"bytes".to_vec());
        let notifier = FakeNotifier::default();
        let alerter = RecordingAlerter::default();
        let pipeline = Pipeline::new(&config, "@chan".to_string(), &fetcher, &notifier, &alerter);

        assert!(pipeline.run(&options).is_err());
        assert!(!options.output_file.exists());
    }

    #[test]
    fn test_summary_pushed_when_enabled() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.webhook.push_summary = true;
        let options = options(dir.path());
        let fetcher = FakeFetcher::serving(b"bytes".to_vec());
        let notifier = FakeNotifier::default();
        let alerter = RecordingAlerter::default();
        let pipeline = Pipeline::new(&config, "@chan".to_string(), &fetcher, &notifier, &alerter);

        pipeline.run(&options).unwrap();
        assert_eq!(alerter.count(), 1);
        assert!(alerter.messages.borrow()[0].starts_with("run summary"));

        // Nothing delivered or failed: no second summary.
        pipeline.run(&options).unwrap();
        assert_eq!(alerter.count(), 1);
    }

    #[test]
    fn test_webhook_outage_neither_aborts_nor_latches() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.limits.max_download_attempts = 1;
        let options = options(dir.path());
        let fetcher = FakeFetcher::failing();
        let notifier = FakeNotifier::default();
        let down = FailingAlerter::default();

        let first = Pipeline::new(&config, "@chan".to_string(), &fetcher, &notifier, &down)
            .run(&options)
            .unwrap();
        assert_eq!(first.terminal, 3);
        assert_eq!(first.uploaded, 1);
        assert!(down.attempts() >= 3);
        assert!(read_output(&options).iter().all(|e| !e.upload_info.notification_sent));

        // Webhook back up: the pending alerts go out once and latch.
        let up = RecordingAlerter::default();
        let pipeline = Pipeline::new(&config, "@chan".to_string(), &fetcher, &notifier, &up);
        let second = pipeline.run(&options).unwrap();
        assert_eq!(second.units, 2);
        assert_eq!(up.count(), 3);
        let third = pipeline.run(&options).unwrap();
        assert_eq!(third.units, 0);
        assert_eq!(up.count(), 3);
        assert_eq!(fetcher.calls(), 3);
    }

    #[test]
    fn test_ledger_failure_persists_recorded_entries() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.limits.max_entries_per_shard = 1;
        let options = options(dir.path());
        let month = chrono::Local::now().format("%Y-%m").to_string();
        let blocked = config
            .paths
            .ledger_dir
            .join(format!("{}{}-0002.json.tmp", SHARD_PREFIX, month));
        fs::create_dir_all(&blocked).unwrap();
        let fetcher = FakeFetcher::serving(b"bytes".to_vec());
        let notifier = FakeNotifier::default();
        let alerter = RecordingAlerter::default();
        let pipeline = Pipeline::new(&config, "@chan".to_string(), &fetcher, &notifier, &alerter);

        assert!(pipeline.run(&options).is_err());
        let saved = read_output(&options);
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].file_name, "a1.jpg");

        // Once the ledger can be written again the remaining entries follow
        // and the first one is not lost.
        fs::remove_dir(&blocked).unwrap();
        let result = pipeline.run(&options).unwrap();
        assert_eq!(result.inserted, 3);
        assert_eq!(read_output(&options).len(), 4);
        assert!(read_output(&options).iter().all(|e| e.is_uploaded));
    }
}
