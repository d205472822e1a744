use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Lines, Read, Take, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::error_handling::types::StorageError;
use crate::event::EventRecord;
use crate::storage::storage_trait::{EventStore, RecordIter};
use crate::storage::types::EventFilter;

const EVENTS_FILE: &str = "events.jsonl";

/// Append-only JSON-lines event log under `<base_path>/events.jsonl`.
///
/// One record per line. A torn or corrupt line is skipped on read so a crash
/// mid-write never makes the rest of the log unreadable, and a record that was
/// appended twice (retry after a partial failure) is only returned once.
pub struct FileStorage {
    base_path: PathBuf,
    // the append handle; also serializes appends against cleanup
    writer: Mutex<File>,
}

/// Streams the records of a log snapshot, one line at a time.
struct LogScan {
    path: PathBuf,
    lines: Option<Lines<BufReader<Take<File>>>>,
    lineno: usize,
}

impl Iterator for LogScan {
    type Item = Result<EventRecord, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        let lines = self.lines.as_mut()?;
        loop {
            let line = match lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(StorageError::ReadFailed(e.to_string()))),
            };
            self.lineno += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EventRecord>(&line) {
                Ok(record) => return Some(Ok(record)),
                Err(e) => warn!(
                    "Skipping corrupt line {} in {}: {}",
                    self.lineno,
                    self.path.display(),
                    e
                ),
            }
        }
    }
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).map_err(|e| {
            error!("Failed to create storage dir {}: {}", base_path.display(), e);
            StorageError::Unavailable(e.to_string())
        })?;
        let writer = Self::open_append(&base_path.join(EVENTS_FILE))?;
        info!("FileStorage initialized at {}", base_path.display());

        Ok(Self {
            base_path,
            writer: Mutex::new(writer),
        })
    }

    /// Construct FileStorage using env var LEURRE_STORAGE_DIR if set, otherwise current directory.
    pub fn new_default() -> Result<Self, StorageError> {
        if let Ok(dir) = std::env::var("LEURRE_STORAGE_DIR") {
            info!("Using FileStorage from LEURRE_STORAGE_DIR: {}", dir);
            return Self::new(PathBuf::from(dir));
        }
        let cwd = std::env::current_dir().map_err(|e| {
            error!("Failed to get current dir: {}", e);
            StorageError::Unavailable(e.to_string())
        })?;
        info!("Using FileStorage at current directory: {}", cwd.display());
        Self::new(cwd)
    }

    pub fn events_path(&self) -> PathBuf {
        self.base_path.join(EVENTS_FILE)
    }

    fn open_append(path: &Path) -> Result<File, StorageError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                error!("Open append failed {}: {}", path.display(), e);
                StorageError::Unavailable(e.to_string())
            })
    }

    /// Opens the log as it is now; lines appended later are not seen.
    ///
    /// The caller must hold the writer lock while this runs so the snapshot
    /// ends on a line boundary. Iterating does not need the lock.
    fn snapshot(&self) -> Result<LogScan, StorageError> {
        let path = self.events_path();
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(LogScan {
                    path,
                    lines: None,
                    lineno: 0,
                })
            }
            Err(e) => {
                error!("Read failed {}: {}", path.display(), e);
                return Err(StorageError::ReadFailed(e.to_string()));
            }
        };
        let len = file
            .metadata()
            .map_err(|e| StorageError::ReadFailed(e.to_string()))?
            .len();
        Ok(LogScan {
            path,
            lines: Some(BufReader::new(file.take(len)).lines()),
            lineno: 0,
        })
    }

    fn locked_snapshot(&self) -> Result<LogScan, StorageError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.snapshot()
    }
}

impl EventStore for FileStorage {
    fn append(&self, record: &EventRecord) -> Result<(), StorageError> {
        let mut line =
            serde_json::to_string(record).map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        line.push('\n');

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(line.as_bytes()).map_err(|e| {
            error!("Write failed {}: {}", self.events_path().display(), e);
            StorageError::WriteFailed(e.to_string())
        })?;
        writer
            .flush()
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        debug!("Appended record {} to {}", record.id, self.events_path().display());
        Ok(())
    }

    /// Streams the log once and keeps only the matching records; the first
    /// copy of a duplicated id wins.
    fn query(&self, filter: &EventFilter) -> Result<RecordIter<'_>, StorageError> {
        let mut matched = BTreeMap::new();
        for record in self.locked_snapshot()? {
            let record = record?;
            if filter.matches(&record) {
                matched.entry(record.id).or_insert(record);
            }
        }
        debug!("Query matched {} record(s)", matched.len());
        Ok(Box::new(matched.into_values()))
    }

    fn max_id(&self) -> Result<Option<u64>, StorageError> {
        let mut max = None;
        for record in self.locked_snapshot()? {
            max = max.max(Some(record?.id));
        }
        Ok(max)
    }

    fn cleanup_older_than(&self, older_than: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let tmp_path = self.base_path.join(format!("{}.tmp", EVENTS_FILE));
        let mut seen = HashSet::new();
        let mut removed = 0usize;
        {
            let mut tmp = File::create(&tmp_path).map_err(|e| {
                error!("Create failed {}: {}", tmp_path.display(), e);
                StorageError::WriteFailed(e.to_string())
            })?;
            for record in self.snapshot()? {
                let record = record?;
                if !seen.insert(record.id) {
                    continue;
                }
                if record.occurred_at < older_than {
                    removed += 1;
                    continue;
                }
                let line = serde_json::to_string(&record)
                    .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
                writeln!(tmp, "{}", line).map_err(|e| StorageError::WriteFailed(e.to_string()))?;
            }
            tmp.sync_all()
                .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        }

        fs::rename(&tmp_path, self.events_path()).map_err(|e| {
            error!("Rename failed {}: {}", tmp_path.display(), e);
            StorageError::WriteFailed(e.to_string())
        })?;
        *writer = Self::open_append(&self.events_path())?;

        info!(
            "Removed {} old record(s) (cutoff: {})",
            removed,
            older_than.to_rfc3339()
        );
        Ok(removed)
    }
}
