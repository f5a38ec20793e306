use std::fs;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tracing::info;

use vaultward_core::{Result, RunBatch, VaultwardError, check_schema};

use crate::journal::{LedgerEvent, LedgerJournal};

pub const RUN_LOG_FILE: &str = "run-log.json";

const HOWTO: &str = "\
How to resolve vaultward conflicts
==================================

Every conflict has two files named after the note and the action id:

  <note>.<action>.note  why the change was not written
  <note>.<action>.diff  unified diff of what differed (may be empty)

Nothing was overwritten. To proceed, either:
  1. re-run the recommender so it plans against the current file, or
  2. apply the diff by hand after reviewing it, or
  3. for B1 (rename) transactions, restore with your version control.
";

/// Artifact layout of one run: `runs/<run_id>/{backups,patches,conflicts}`.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub run_dir: PathBuf,
}

impl RunArtifacts {
    pub fn backup_path(&self, action_id: &str, rel: &Path) -> PathBuf {
        with_suffix(&self.run_dir.join("backups").join(action_id).join(rel), "bak")
    }

    pub fn patch_path(&self, action_id: &str, rel: &Path) -> PathBuf {
        with_suffix(&self.run_dir.join("patches").join(action_id).join(rel), "patch")
    }

    /// `(diff, note)` artifact paths for a conflict on `rel`.
    pub fn conflict_paths(&self, action_id: &str, rel: &Path) -> (PathBuf, PathBuf) {
        let base = self.run_dir.join("conflicts").join(rel);
        (
            with_suffix(&base, &format!("{action_id}.diff")),
            with_suffix(&base, &format!("{action_id}.note")),
        )
    }

    pub fn conflicts_dir(&self) -> PathBuf {
        self.run_dir.join("conflicts")
    }

    /// Write an artifact file, creating parent directories.
    pub fn write(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Drop a `HOWTO.txt` next to the conflict artifacts once per run.
    pub fn ensure_howto(&self) -> Result<()> {
        let path = self.conflicts_dir().join("HOWTO.txt");
        if path.exists() {
            return Ok(());
        }
        self.write(&path, HOWTO)
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|f| f.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// A run directory found on disk.
#[derive(Debug, Clone)]
pub struct RunEntry {
    pub run_id: String,
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Durable store of finalized runs. Written by the orchestrator and the
/// rollback engine, read by rollback and reporting.
#[derive(Debug, Clone)]
pub struct RunLedger {
    runs_dir: PathBuf,
    journal: LedgerJournal,
}

impl RunLedger {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        let state_dir = state_dir.as_ref();
        Self {
            runs_dir: state_dir.join("runs"),
            journal: LedgerJournal::new(state_dir.join("ledger.jsonl")),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn journal(&self) -> &LedgerJournal {
        &self.journal
    }

    pub fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        let mut components = Path::new(run_id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.runs_dir.join(run_id)),
            _ => Err(VaultwardError::RunNotFound(run_id.to_string())),
        }
    }

    pub fn artifacts(&self, run_id: &str) -> Result<RunArtifacts> {
        Ok(RunArtifacts {
            run_dir: self.run_dir(run_id)?,
        })
    }

    /// Persist a finalized run: `run-log.json` is replaced atomically, then
    /// the journal gets one line.
    pub async fn record(&self, batch: &RunBatch) -> Result<PathBuf> {
        let run_dir = self.run_dir(&batch.run_id)?;
        tokio::fs::create_dir_all(&run_dir).await?;
        let log_path = run_dir.join(RUN_LOG_FILE);
        let rendered = serde_json::to_vec_pretty(batch)?;
        write_atomic(&log_path, &rendered).await?;

        self.journal.append(&LedgerEvent::for_batch(batch)).await?;

        info!(run_id = %batch.run_id, path = %log_path.display(), "run recorded");
        Ok(log_path)
    }

    pub fn load(&self, run_id: &str) -> Result<RunBatch> {
        let log_path = self.run_dir(run_id)?.join(RUN_LOG_FILE);
        let raw = match fs::read_to_string(&log_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultwardError::RunNotFound(run_id.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        decode_versioned("run-log", serde_json::from_str(&raw)?)
    }

    /// Recorded runs from the journal, newest first.
    pub fn history(&self) -> Result<Vec<LedgerEvent>> {
        let mut events = self.journal.load()?;
        events.reverse();
        Ok(events)
    }

    /// Runs on disk, newest first.
    pub fn list(&self) -> Result<Vec<RunEntry>> {
        let mut entries = Vec::new();
        let read_dir = match fs::read_dir(&self.runs_dir) {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(err.into()),
        };
        for entry in read_dir {
            let entry = entry?;
            let path = entry.path();
            if !path.join(RUN_LOG_FILE).exists() {
                continue;
            }
            let modified = entry
                .metadata()?
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            entries.push(RunEntry {
                run_id: entry.file_name().to_string_lossy().into_owned(),
                size_bytes: dir_size(&path),
                path,
                modified,
            });
        }
        entries.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.run_id.cmp(&a.run_id)));
        Ok(entries)
    }
}

pub(crate) fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Check the `schema_version` field before decoding the rest of a record.
pub(crate) fn decode_versioned<T: DeserializeOwned>(record: &'static str, value: serde_json::Value) -> Result<T> {
    let version = value
        .get("schema_version")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| VaultwardError::SchemaMismatch {
            record,
            found: "missing".to_string(),
        })?;
    check_schema(record, u32::try_from(version).unwrap_or(u32::MAX))?;
    Ok(serde_json::from_value(value)?)
}

pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = with_suffix(path, "tmp");
    let write_result: Result<()> = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(err) = write_result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err);
    }
    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }
    Ok(())
}
