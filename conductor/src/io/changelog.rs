//! Append-only JSONL mirror of store mutations.
//!
//! One line per mutation: `{seq, timestamp, entity_type, entity_id,
//! change_type, data}`. `seq` increases monotonically and resumes after the
//! last line when the file is reopened. External tools can tail the file or
//! replay it into a fresh store.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::types::{Spec, Task};
use crate::io::config::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Spec,
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub change_type: ChangeType,
    /// Full entity snapshot after the change.
    pub data: Value,
}

#[derive(Debug)]
struct LogState {
    file: File,
    next_seq: u64,
}

/// Writer for the change log file.
#[derive(Debug)]
pub struct ChangeLog {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl ChangeLog {
    /// Open (or create) the log, resuming the sequence after its last record.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let last_seq = read_records(path)?.last().map(|r| r.seq).unwrap_or(0);
        let file = open_append(path)?;
        debug!(last_seq, "opened change log");
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(LogState {
                file,
                next_seq: last_seq + 1,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one mutation and flush it. Returns the assigned sequence number.
    pub fn record(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        change_type: ChangeType,
        data: Value,
    ) -> Result<u64> {
        let mut state = self.lock()?;
        let record = ChangeRecord {
            seq: state.next_seq,
            timestamp: Utc::now(),
            entity_type,
            entity_id: entity_id.to_string(),
            change_type,
            data,
        };
        let mut line = serde_json::to_string(&record).context("serialize change record")?;
        line.push('\n');
        state
            .file
            .write_all(line.as_bytes())
            .and_then(|()| state.file.flush())
            .with_context(|| format!("append {}", self.path.display()))?;
        state.next_seq += 1;
        Ok(record.seq)
    }

    pub fn read_all(&self) -> Result<Vec<ChangeRecord>> {
        let _state = self.lock()?;
        read_records(&self.path)
    }

    /// Records with `seq` strictly greater than `after`.
    pub fn changes_since(&self, after: u64) -> Result<Vec<ChangeRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.seq > after)
            .collect())
    }

    /// Rewrite the file as one `create` record per entity. Returns the record count.
    ///
    /// Exported records continue the sequence, so a reader holding an older
    /// `seq` still sees everything written after it through [`Self::changes_since`].
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn export(&self, specs: &[Spec], tasks: &[Task]) -> Result<usize> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let mut buf = String::new();
        let mut seq = state.next_seq;
        for spec in specs {
            push_line(&mut buf, seq, now, EntityType::Spec, &spec.id, spec)?;
            seq += 1;
        }
        for task in tasks {
            push_line(&mut buf, seq, now, EntityType::Task, &task.id, task)?;
            seq += 1;
        }
        write_atomic(&self.path, &buf)?;
        state.file = open_append(&self.path)?;
        let count = seq - state.next_seq;
        state.next_seq = seq;
        debug!(records = count, next_seq = seq, "exported change log");
        Ok(count as usize)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LogState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("change log lock poisoned"))
    }
}

fn push_line(
    buf: &mut String,
    seq: u64,
    timestamp: DateTime<Utc>,
    entity_type: EntityType,
    entity_id: &str,
    entity: &impl Serialize,
) -> Result<()> {
    let record = ChangeRecord {
        seq,
        timestamp,
        entity_type,
        entity_id: entity_id.to_string(),
        change_type: ChangeType::Create,
        data: serde_json::to_value(entity).context("serialize entity")?,
    };
    buf.push_str(&serde_json::to_string(&record).context("serialize change record")?);
    buf.push('\n');
    Ok(())
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))
}

/// Parse every record in `path`; a missing file has no records.
pub fn read_records(path: &Path) -> Result<Vec<ChangeRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: ChangeRecord = serde_json::from_str(&line)
            .with_context(|| format!("parse {} line {}", path.display(), idx + 1))?;
        records.push(record);
    }
    Ok(records)
}

/// Final state of every entity in `records`; the last write wins.
#[derive(Debug, Default)]
pub struct Replay {
    pub specs: Vec<Spec>,
    pub tasks: Vec<Task>,
}

pub fn replay(records: &[ChangeRecord]) -> Result<Replay> {
    let mut latest: BTreeMap<(EntityType, &str), &ChangeRecord> = BTreeMap::new();
    for record in records {
        latest.insert((record.entity_type, record.entity_id.as_str()), record);
    }
    let mut out = Replay::default();
    for ((entity_type, id), record) in latest {
        match entity_type {
            EntityType::Spec => out.specs.push(
                serde_json::from_value(record.data.clone())
                    .with_context(|| format!("decode spec {id} (seq {})", record.seq))?,
            ),
            EntityType::Task => out.tasks.push(
                serde_json::from_value(record.data.clone())
                    .with_context(|| format!("decode task {id} (seq {})", record.seq))?,
            ),
        }
    }
    // Rows keep their original insertion order when re-imported.
    out.tasks.sort_by_key(|t| t.seq);
    Ok(out)
}
