//! Sharded deduplication ledger.
//!
//! Every identity the extractor has ever minted is appended to a JSON array
//! shard named `<prefix>YYYY-MM-####.json`. Shards are capped, numbered per
//! calendar month and never compacted. The in-memory index is rebuilt from
//! all shards at load time.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use crate::error::LedgerError;

/// Default shard filename prefix.
pub const SHARD_PREFIX: &str = "processed_entries_";

/// Default cap of identities per shard.
pub const MAX_ENTRIES_PER_SHARD: usize = 10_000;

pub struct Ledger {
    dir: PathBuf,
    prefix: String,
    max_entries: usize,
    pretty: bool,
    index: HashSet<String>,
}

impl Ledger {
    /// Load every shard under `dir` into the membership index.
    ///
    /// Unreadable or corrupt shards are logged and contribute nothing.
    pub fn load(dir: &Path, prefix: &str, max_entries: usize, pretty: bool) -> Result<Self, LedgerError> {
        fs::create_dir_all(dir).map_err(|source| LedgerError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut ledger = Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            max_entries: max_entries.max(1),
            pretty,
            index: HashSet::new(),
        };

        let shards = ledger.shard_files()?;
        for path in &shards {
            match read_shard(path) {
                Ok(entries) => ledger.index.extend(entries),
                Err(ShardReadError::Corrupt(e)) => {
                    warn!(shard = %path.display(), error = %e, "corrupt ledger shard, skipped")
                }
                Err(ShardReadError::Io(e)) => {
                    error!(shard = %path.display(), error = %e, "unreadable ledger shard, skipped")
                }
            }
        }
        debug!(shards = shards.len(), entries = ledger.index.len(), "ledger loaded");
        Ok(ledger)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Record an identity in the current month's shard.
    pub fn record(&mut self, id: &str) -> Result<PathBuf, LedgerError> {
        let year_month = chrono::Local::now().format("%Y-%m").to_string();
        self.record_in(id, &year_month)
    }

    /// Record an identity in the shard set of `year_month` (`YYYY-MM`).
    pub fn record_in(&mut self, id: &str, year_month: &str) -> Result<PathBuf, LedgerError> {
        let current_max = self.max_shard_number(year_month)?;
        let candidate = self.shard_path(year_month, current_max);

        if current_max > 0 && candidate.exists() {
            match read_shard(&candidate) {
                Ok(mut entries) => {
                    if entries.len() < self.max_entries {
                        entries.push(id.to_string());
                        self.write_shard(&candidate, &entries)?;
                        self.index.insert(id.to_string());
                        return Ok(candidate);
                    }
                }
                Err(ShardReadError::Corrupt(e)) => {
                    // Whatever the shard held is considered lost.
                    warn!(shard = %candidate.display(), error = %e, "corrupt ledger shard, rewriting");
                    self.write_shard(&candidate, &[id.to_string()])?;
                    self.index.insert(id.to_string());
                    return Ok(candidate);
                }
                Err(ShardReadError::Io(source)) => {
                    return Err(LedgerError::Io {
                        path: candidate,
                        source,
                    });
                }
            }
        }

        let path = self.shard_path(year_month, current_max + 1);
        self.write_shard(&path, &[id.to_string()])?;
        self.index.insert(id.to_string());
        debug!(shard = %path.display(), "opened new ledger shard");
        Ok(path)
    }

    fn shard_path(&self, year_month: &str, number: u32) -> PathBuf {
        self.dir.join(format!("{}{}-{:04}.json", self.prefix, year_month, number))
    }

    fn shard_files(&self) -> Result<Vec<PathBuf>, LedgerError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| LedgerError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&self.prefix) && n.ends_with(".json"))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Highest shard number for the month, 0 when there is none.
    fn max_shard_number(&self, year_month: &str) -> Result<u32, LedgerError> {
        let month_prefix = format!("{}{}-", self.prefix, year_month);
        let max = self
            .shard_files()?
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .filter_map(|name| {
                name.strip_prefix(&month_prefix)?
                    .strip_suffix(".json")?
                    .parse::<u32>()
                    .ok()
            })
            .max()
            .unwrap_or(0);
        Ok(max)
    }

    /// Replace a shard via a temp file so an interrupted write never
    /// truncates identities already committed.
    fn write_shard(&self, path: &Path, entries: &[String]) -> Result<(), LedgerError> {
        let io_err = |source| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        };
        let temp = temp_path(path);
        {
            let mut writer = BufWriter::new(File::create(&temp).map_err(io_err)?);
            let result = if self.pretty {
                serde_json::to_writer_pretty(&mut writer, entries)
            } else {
                serde_json::to_writer(&mut writer, entries)
            };
            result.map_err(|source| LedgerError::Encode {
                path: path.to_path_buf(),
                source,
            })?;
            writer.flush().map_err(io_err)?;
        }
        fs::rename(&temp, path).map_err(io_err)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[derive(Debug)]
enum ShardReadError {
    Io(std::io::Error),
    Corrupt(serde_json::Error),
}

impl std::fmt::Display for ShardReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardReadError::Io(e) => write!(f, "{}", e),
            ShardReadError::Corrupt(e) => write!(f, "{}", e),
        }
    }
}

fn read_shard(path: &Path) -> Result<Vec<String>, ShardReadError> {
    let bytes = fs::read(path).map_err(ShardReadError::Io)?;
    serde_json::from_slice(&bytes).map_err(ShardReadError::Corrupt)
}
