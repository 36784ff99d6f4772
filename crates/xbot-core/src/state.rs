//! Per-period output record and the idempotent merge into it.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::media::{parse_publish_time, MediaEntry};

/// Result of folding new entries into an existing record.
pub struct MergeOutcome {
    pub entries: Vec<MediaEntry>,
    pub inserted: usize,
}

/// Append entries whose identity is not present yet, then sort by publish time.
///
/// Existing entries are never removed or overwritten. Entries without a
/// parseable publish time sort first.
pub fn merge(existing: Vec<MediaEntry>, new_entries: Vec<MediaEntry>) -> MergeOutcome {
    let mut known: HashSet<String> = existing.iter().map(MediaEntry::id).collect();
    let mut entries = existing;
    let mut inserted = 0;

    for entry in new_entries {
        if known.insert(entry.id()) {
            entries.push(entry);
            inserted += 1;
        }
    }

    sort_by_publish_time(&mut entries);
    MergeOutcome { entries, inserted }
}

pub fn sort_by_publish_time(entries: &mut [MediaEntry]) {
    entries.sort_by_cached_key(|e| parse_publish_time(&e.publish_time));
}

/// All entries known for one processing period, backed by one JSON file.
pub struct OutputRecord {
    path: PathBuf,
    pretty: bool,
    pub entries: Vec<MediaEntry>,
}

impl OutputRecord {
    /// Load the record at `path`. A missing file is an empty record; a file
    /// that does not parse is an error so the audit trail is never replaced.
    pub fn load(path: &Path, pretty: bool) -> anyhow::Result<Self> {
        let entries = if path.exists() {
            let file = File::open(path)
                .with_context(|| format!("failed to open output record {}", path.display()))?;
            serde_json::from_reader(BufReader::new(file))
                .with_context(|| format!("output record {} is corrupt", path.display()))?
        } else {
            Vec::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            pretty,
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merge new entries in place, returning how many were inserted.
    pub fn merge(&mut self, new_entries: Vec<MediaEntry>) -> usize {
        let outcome = merge(std::mem::take(&mut self.entries), new_entries);
        self.entries = outcome.entries;
        outcome.inserted
    }

    /// Rewrite the whole record, sorted, via a temp file and rename.
    pub fn save(&mut self) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        sort_by_publish_time(&mut self.entries);

        let temp_path = self.path.with_extension("json.tmp");
        {
            let writer = BufWriter::new(File::create(&temp_path)?);
            if self.pretty {
                serde_json::to_writer_pretty(writer, &self.entries)?;
            } else {
                serde_json::to_writer(writer, &self.entries)?;
            }
        }
        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("failed to replace output record {}", self.path.display()))?;
        Ok(())
    }
}
