//! `ledger.jsonl`: one versioned line per recorded run, in completion order.
//! It is the index behind run listings; each run directory stays the source
//! of truth for what the run did.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use vaultward_core::{Result, RunBatch, RunKind, RunOutcome, SCHEMA_VERSION};

use crate::store::{decode_versioned, write_atomic};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub schema_version: u32,
    pub event_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub run_id: String,
    pub kind: RunKind,
    pub outcome: RunOutcome,
    pub changes: usize,
    pub conflicts: usize,
}

impl LedgerEvent {
    pub fn for_batch(batch: &RunBatch) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            event_id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            run_id: batch.run_id.clone(),
            kind: batch.kind.clone(),
            outcome: batch.outcome.clone(),
            changes: batch.changes.len(),
            conflicts: batch.conflicts.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerJournal {
    path: PathBuf,
}

impl LedgerJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add one line and sync it before returning.
    pub async fn append(&self, event: &LedgerEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Replace the whole journal in one atomic rename.
    pub async fn rewrite(&self, events: &[LedgerEvent]) -> Result<()> {
        let mut rendered = String::new();
        for event in events {
            rendered.push_str(&serde_json::to_string(event)?);
            rendered.push('\n');
        }
        write_atomic(&self.path, rendered.as_bytes()).await
    }

    /// Every event in completion order.
    ///
    /// A line that is not JSON at all (a torn append) is skipped with a
    /// warning. A line carrying an unknown schema version is an error.
    pub fn load(&self) -> Result<Vec<LedgerEvent>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut events = Vec::new();
        for (number, line) in raw.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
            let value: serde_json::Value = match serde_json::from_str(line) {
                Ok(value) => value,
                Err(err) => {
                    warn!(line = number + 1, path = %self.path.display(), error = %err, "skipping unreadable journal line");
                    continue;
                }
            };
            events.push(decode_versioned("ledger-journal", value)?);
        }
        Ok(events)
    }
}
