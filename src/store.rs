//! Durable checkpoint log, dedup index, and artifact finalization.
//!
//! The append-only JSONL log is the source of truth for resumability; the
//! in-memory dedup index is a derived cache, rebuilt from durable state at
//! startup. A record is fsynced to the log *before* its id enters the index,
//! so a crash between the two can at worst cost a redundant index rebuild,
//! never a lost record.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::record::{CheckpointEntry, Record};

/// Set of already-captured target URLs.
#[derive(Debug, Default)]
pub struct DedupIndex {
    ids: HashSet<String>,
}

impl DedupIndex {
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Admit an id. Returns false if it was already present.
    pub fn admit(&mut self, id: &str) -> bool {
        self.ids.insert(id.to_string())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Checkpoint storage for one crawl run: the append-only log, the dedup
/// index derived from it, and final-artifact materialization.
pub struct CheckpointStore {
    log_path: PathBuf,
    artifact_path: PathBuf,
    error_page_path: PathBuf,
    log_file: Option<File>,
    index: DedupIndex,
    next_ordinal: u64,
    appended_this_run: u64,
}

impl CheckpointStore {
    /// Open the store, rebuilding the dedup index from the checkpoint log
    /// and from a previously finalized artifact if one exists.
    pub fn open(
        log_path: impl Into<PathBuf>,
        artifact_path: impl Into<PathBuf>,
        error_page_path: impl Into<PathBuf>,
    ) -> Result<Self, EngineError> {
        let log_path = log_path.into();
        let artifact_path = artifact_path.into();
        let error_page_path = error_page_path.into();

        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let finalized = read_artifact(&artifact_path)?;
        let entries = read_log(&log_path)?;

        let mut index = DedupIndex::default();
        for record in &finalized {
            if let Some(url) = record.target_url() {
                index.admit(url);
            }
        }
        for entry in &entries {
            if let Some(url) = entry.record.target_url() {
                index.admit(url);
            }
        }

        let next_ordinal = (finalized.len() + entries.len()) as u64;
        if !entries.is_empty() {
            info!(
                "resuming: {} checkpointed records, {} already finalized",
                entries.len(),
                finalized.len()
            );
        }

        Ok(Self {
            log_path,
            artifact_path,
            error_page_path,
            log_file: None,
            index,
            next_ordinal,
            appended_this_run: 0,
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    /// Total ids known captured (log plus finalized artifact).
    pub fn captured_total(&self) -> u64 {
        self.index.len() as u64
    }

    /// Durably append one record, then admit its id into the index.
    pub fn append(&mut self, record: Record) -> Result<u64, EngineError> {
        let Some(url) = record.target_url().map(str::to_string) else {
            return Err(EngineError::Storage(io::Error::new(
                io::ErrorKind::InvalidInput,
                "record has no target URL",
            )));
        };

        let entry = CheckpointEntry::new(self.next_ordinal, record);
        let line = serde_json::to_string(&entry).map_err(io_invalid)?;

        if self.log_file.is_none() {
            self.log_file = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.log_path)?,
            );
        }
        let file = self.log_file.as_mut().expect("log file just opened");
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        file.sync_data()?;

        self.index.admit(&url);
        self.next_ordinal += 1;
        self.appended_this_run += 1;
        Ok(entry.ordinal)
    }

    /// Read back the full log, merge with any previously finalized artifact,
    /// write the consolidated JSON array atomically, and clear the log.
    ///
    /// Idempotent: with nothing newly checkpointed and an existing artifact
    /// this is a no-op returning the same artifact path.
    pub fn finalize(&mut self) -> Result<PathBuf, EngineError> {
        let entries = read_log(&self.log_path)?;

        if entries.is_empty() {
            if self.log_path.exists() {
                fs::remove_file(&self.log_path)?;
            }
            if self.artifact_path.exists() {
                debug!("nothing new to finalize");
                return Ok(self.artifact_path.clone());
            }
        }

        let mut records = read_artifact(&self.artifact_path)?;
        records.extend(entries.into_iter().map(|entry| entry.record));

        let dir = self
            .artifact_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut tmp = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, &records).map_err(io_invalid)?;
        tmp.as_file_mut().write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.artifact_path)
            .map_err(|e| EngineError::Storage(e.error))?;

        // The log may only disappear after the artifact is durable.
        self.log_file = None;
        if self.log_path.exists() {
            fs::remove_file(&self.log_path)?;
        }

        info!(
            "finalized {} records to {}",
            records.len(),
            self.artifact_path.display()
        );
        Ok(self.artifact_path.clone())
    }

    /// Dump raw page HTML next to the log for offline diagnosis of pages
    /// that yielded nothing.
    pub fn dump_error_page(&self, html: &str) -> io::Result<PathBuf> {
        fs::write(&self.error_page_path, html)?;
        Ok(self.error_page_path.clone())
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    pub fn appended_this_run(&self) -> u64 {
        self.appended_this_run
    }
}

fn io_invalid(e: serde_json::Error) -> EngineError {
    EngineError::Storage(io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Read checkpoint entries. A truncated final line is uncommitted data from
/// an interrupted run and is ignored; malformed interior lines are skipped
/// with a warning.
fn read_log(path: &Path) -> io::Result<Vec<CheckpointEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)?;
    let lines: Vec<&str> = raw.lines().collect();
    let mut entries = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CheckpointEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) if i + 1 == lines.len() => {
                debug!("ignoring truncated final checkpoint line: {}", e);
            }
            Err(e) => {
                warn!("skipping malformed checkpoint line {}: {}", i + 1, e);
            }
        }
    }
    Ok(entries)
}

fn read_artifact(path: &Path) -> io::Result<Vec<Record>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
