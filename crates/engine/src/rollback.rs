//! Reverses recorded changes of an earlier run.
//!
//! A record is restored only when the file still carries the digest the run
//! left behind; anything else is a conflict and the file is not touched.
//! Rename transactions are reversed as a whole or not at all. A rollback is
//! itself a run and is written to the ledger.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{error, info, warn};

use vaultward_core::paths::{normalize_path, resolve_in_vault};
use vaultward_core::{
    ArtifactPaths, ConflictKind, Digest, FallbackMode, FileChangeRecord, Result, RiskClass, RunBatch, RunKind,
    RunOutcome, SCHEMA_VERSION, SkipReason, VaultwardError, VcsInfo,
};
use vaultward_ledger::RunLedger;

use crate::artifacts::RunRecorder;
use crate::lease::{LeaseOptions, WriteLease};
use crate::resolver;
use crate::source::{DigestSource, FsDigestSource, read_current};
use crate::writer;

/// Narrows a rollback to part of a run. Both filters must match when both
/// are set; an empty filter selects the whole run.
#[derive(Debug, Clone, Default)]
pub struct RollbackFilter {
    pub by_file: Option<PathBuf>,
    pub by_action: Option<String>,
}

impl RollbackFilter {
    pub fn is_empty(&self) -> bool {
        self.by_file.is_none() && self.by_action.is_none()
    }

    fn matches(&self, record: &FileChangeRecord) -> bool {
        let file_ok = self.by_file.as_ref().is_none_or(|file| {
            let file = normalize_path(file);
            normalize_path(&record.target_path) == file
                || record.renamed_from.as_ref().is_some_and(|from| normalize_path(from) == file)
        });
        let action_ok = self.by_action.as_ref().is_none_or(|id| record.action_id == *id);
        file_ok && action_ok
    }
}

#[derive(Debug, Clone)]
pub struct RollbackOutcome {
    pub batch: RunBatch,
    /// Selected records whose recorded dependencies stay in place.
    pub notices: Vec<String>,
    pub recorded: PathBuf,
}

/// A record staged for reversal, with the content it goes back to.
struct Reversal<'a> {
    record: &'a FileChangeRecord,
    abs: PathBuf,
    current: Option<String>,
    restore: Option<String>,
}

enum Check<'a> {
    Ready(Reversal<'a>),
    Conflict {
        kind: ConflictKind,
        detail: String,
        diff: String,
    },
}

pub struct RollbackEngine {
    vault: PathBuf,
    ledger: RunLedger,
    lease: WriteLease,
    lease_options: LeaseOptions,
    digests: Box<dyn DigestSource>,
}

impl RollbackEngine {
    pub fn new(vault: impl Into<PathBuf>, state_dir: impl AsRef<Path>) -> Self {
        Self {
            vault: vault.into(),
            ledger: RunLedger::new(state_dir.as_ref()),
            lease: WriteLease::new(state_dir.as_ref()),
            lease_options: LeaseOptions::default(),
            digests: Box::new(FsDigestSource),
        }
    }

    pub fn with_lease_options(mut self, options: LeaseOptions) -> Self {
        self.lease_options = options;
        self
    }

    pub fn with_digest_source(mut self, digests: impl DigestSource + 'static) -> Self {
        self.digests = Box::new(digests);
        self
    }

    pub async fn rollback(&self, run_id: &str, filter: &RollbackFilter) -> Result<RollbackOutcome> {
        let parent = self.ledger.load(run_id)?;
        let selected: Vec<&FileChangeRecord> = parent.changes.iter().filter(|c| filter.matches(c)).collect();
        if selected.is_empty() {
            return Err(VaultwardError::RollbackRejected(format!(
                "run {run_id} has no recorded changes matching the filter"
            )));
        }
        if selected.iter().all(|c| c.risk_class == RiskClass::B2) {
            return Err(VaultwardError::RollbackRejected(
                "B2 changes are not reversible by rollback; restore them from version control".to_string(),
            ));
        }
        check_whole_transactions(&parent, &selected)?;
        let notices = dependency_notices(&parent, &selected);

        let lease = self.lease.acquire(&self.vault, self.lease_options)?;
        let started_at = Utc::now();
        let rollback_id = RunBatch::new_run_id();
        info!(run_id = %rollback_id, parent = run_id, records = selected.len(), "rollback started");
        let mut recorder = RunRecorder::new(self.ledger.artifacts(&rollback_id)?);
        let parent_artifacts = self.ledger.artifacts(run_id)?;

        // Later writes are undone first so stacked edits unwind in order.
        let mut done_transactions = BTreeSet::new();
        for record in selected.iter().rev() {
            if record.risk_class == RiskClass::B2 {
                recorder.skip(&record.action_id, &record.target_path, SkipReason::NotRollbackEligible);
                continue;
            }
            match record.transaction_id.as_deref() {
                Some(txn) => {
                    if done_transactions.insert(txn.to_string()) {
                        let members: Vec<&FileChangeRecord> = parent.changes_for_transaction(txn).collect();
                        self.reverse_transaction(txn, &members, &parent_artifacts.run_dir, &mut recorder);
                    }
                }
                None => {
                    self.reverse_single(record, &parent_artifacts.run_dir, &mut recorder);
                }
            }
        }

        let outcome = if recorder.conflicts.is_empty() {
            RunOutcome::Completed
        } else {
            RunOutcome::CompletedWithConflicts
        };
        let batch = RunBatch {
            schema_version: SCHEMA_VERSION,
            run_id: rollback_id,
            kind: RunKind::Rollback {
                parent_run_id: run_id.to_string(),
            },
            vault: self.vault.clone(),
            started_at,
            ended_at: Utc::now(),
            lease: Some(lease.info().clone()),
            quiescence: None,
            fallback: FallbackMode::None,
            offline_lock: false,
            outcome,
            changes: recorder.changes.clone(),
            conflicts: recorder.conflicts.clone(),
            skipped: recorder.skipped.clone(),
            vcs: VcsInfo::default(),
        };
        let recorded = self.ledger.record(&batch).await;
        if let Err(err) = lease.release() {
            warn!(error = %err, "failed to release write lease");
        }
        let recorded = recorded?;

        info!(
            run_id = %batch.run_id,
            restored = batch.changes.len(),
            conflicts = batch.conflicts.len(),
            "rollback finished"
        );
        Ok(RollbackOutcome {
            batch,
            notices,
            recorded,
        })
    }

    fn check<'a>(&self, record: &'a FileChangeRecord, parent_run_dir: &Path) -> Check<'a> {
        let rel = &record.target_path;
        let abs = match resolve_in_vault(&self.vault, rel) {
            Ok(abs) => abs,
            Err(err) => {
                return Check::Conflict {
                    kind: ConflictKind::MalformedStructure,
                    detail: err.to_string(),
                    diff: String::new(),
                };
            }
        };

        let restore = match &record.before_digest {
            None => None,
            Some(before) => match backup_content(record, parent_run_dir) {
                Some(content) if Digest::of_str(&content) == *before => Some(content),
                _ => {
                    return Check::Conflict {
                        kind: ConflictKind::BackupMissing,
                        detail: format!(
                            "the backup of {} taken before {} is missing or does not match {}",
                            rel.display(),
                            record.action_id,
                            before.short()
                        ),
                        diff: String::new(),
                    };
                }
            },
        };

        let io_conflict = |err: std::io::Error| Check::Conflict {
            kind: ConflictKind::IoFailure,
            detail: format!("I/O error: {err}"),
            diff: String::new(),
        };
        let now = match self.digests.digest_of(&abs) {
            Ok(now) => now,
            Err(err) => return io_conflict(err),
        };
        let current = match read_current(&abs) {
            Ok(current) => current,
            Err(err) => return io_conflict(err),
        };
        if now != record.after_digest {
            return Check::Conflict {
                kind: ConflictKind::RollbackDiverged,
                detail: format!(
                    "{} changed after run applied {}: expected {}, found {}",
                    rel.display(),
                    record.action_id,
                    record.after_digest.as_ref().map_or("<absent>", Digest::short),
                    now.as_ref().map_or("<absent>", Digest::short)
                ),
                diff: resolver::conflict_diff(
                    rel,
                    current.as_deref().unwrap_or(""),
                    restore.as_deref().unwrap_or(""),
                ),
            };
        }

        Check::Ready(Reversal {
            record,
            abs,
            current,
            restore,
        })
    }

    fn reverse_single(&self, record: &FileChangeRecord, parent_run_dir: &Path, recorder: &mut RunRecorder) -> bool {
        match self.check(record, parent_run_dir) {
            Check::Ready(reversal) => match commit(&reversal, recorder) {
                Ok(change) => {
                    recorder.change(change);
                    true
                }
                Err(err) => {
                    recorder.conflict(
                        &record.action_id,
                        &record.target_path,
                        ConflictKind::IoFailure,
                        &format!("I/O error: {err}"),
                        "",
                    );
                    false
                }
            },
            Check::Conflict { kind, detail, diff } => {
                recorder.conflict(&record.action_id, &record.target_path, kind, &detail, &diff);
                false
            }
        }
    }

    /// Verify every member, then reverse them all. Restored content is
    /// written before created files are removed.
    fn reverse_transaction(
        &self,
        transaction_id: &str,
        members: &[&FileChangeRecord],
        parent_run_dir: &Path,
        recorder: &mut RunRecorder,
    ) -> bool {
        let mut ready = Vec::new();
        let mut failed = Vec::new();
        for record in members {
            match self.check(record, parent_run_dir) {
                Check::Ready(reversal) => ready.push(reversal),
                Check::Conflict { kind, detail, diff } => failed.push((*record, kind, detail, diff)),
            }
        }
        if !failed.is_empty() {
            let untouched: Vec<&FileChangeRecord> = ready.iter().map(|r| r.record).collect();
            abort_transaction(transaction_id, &untouched, failed, recorder);
            return false;
        }

        ready.sort_by_key(|r| r.restore.is_none());
        let mut changes = Vec::new();
        for (idx, reversal) in ready.iter().enumerate() {
            match commit(reversal, recorder) {
                Ok(change) => changes.push(change),
                Err(err) => {
                    unwind(&ready[..idx]);
                    let untouched: Vec<&FileChangeRecord> = ready
                        .iter()
                        .map(|r| r.record)
                        .filter(|r| !std::ptr::eq(*r, reversal.record))
                        .collect();
                    let failed = vec![(
                        reversal.record,
                        ConflictKind::IoFailure,
                        format!("I/O error: {err}"),
                        String::new(),
                    )];
                    abort_transaction(transaction_id, &untouched, failed, recorder);
                    return false;
                }
            }
        }

        info!(transaction_id, files = changes.len(), "transaction reversed");
        for change in changes {
            recorder.change(change);
        }
        true
    }
}

/// Every rename transaction touched by the selection must be selected whole.
fn check_whole_transactions(parent: &RunBatch, selected: &[&FileChangeRecord]) -> Result<()> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for record in selected {
        if let Some(txn) = record.transaction_id.as_deref() {
            *counts.entry(txn).or_default() += 1;
        }
    }
    for (txn, count) in counts {
        let total = parent.changes_for_transaction(txn).count();
        if count < total {
            return Err(VaultwardError::RollbackRejected(format!(
                "the filter selects {count} of {total} files of transaction {txn}; \
                 partial reversal would leave broken links. Roll back the whole transaction \
                 or restore the files with version control (e.g. `git checkout`)"
            )));
        }
    }
    Ok(())
}

fn dependency_notices(parent: &RunBatch, selected: &[&FileChangeRecord]) -> Vec<String> {
    let ids: BTreeSet<&str> = selected.iter().map(|c| c.action_id.as_str()).collect();
    let changed: BTreeSet<&str> = parent.changes.iter().map(|c| c.action_id.as_str()).collect();
    let mut notices = BTreeSet::new();
    for record in selected {
        for dep in &record.dependencies {
            if changed.contains(dep.as_str()) && !ids.contains(dep.as_str()) {
                notices.insert(format!(
                    "{} depended on {dep}, which is not being rolled back",
                    record.action_id
                ));
            }
        }
    }
    notices.into_iter().collect()
}

fn backup_content(record: &FileChangeRecord, parent_run_dir: &Path) -> Option<String> {
    let backup = record.artifact_paths.backup.as_ref()?;
    // Older logs may carry run-relative artifact paths.
    let path = if backup.is_absolute() {
        backup.clone()
    } else {
        parent_run_dir.join(backup)
    };
    std::fs::read_to_string(path).ok()
}

fn commit(reversal: &Reversal<'_>, recorder: &RunRecorder) -> Result<FileChangeRecord> {
    let record = reversal.record;
    let rel = &record.target_path;
    let backup = match &reversal.current {
        Some(current) => Some(recorder.backup(&record.action_id, rel, current)?),
        None => None,
    };
    let patch = recorder.patch(
        &record.action_id,
        rel,
        reversal.current.as_deref().unwrap_or(""),
        reversal.restore.as_deref().unwrap_or(""),
    );
    let after = match &reversal.restore {
        Some(content) => Some(writer::write_atomic(&reversal.abs, content.as_bytes())?),
        None => {
            writer::remove(&reversal.abs)?;
            None
        }
    };
    info!(action_id = %record.action_id, path = %rel.display(), "change reversed");
    Ok(FileChangeRecord {
        action_id: record.action_id.clone(),
        target_path: rel.clone(),
        base_digest: record.after_digest.clone(),
        before_digest: record.after_digest.clone(),
        after_digest: after,
        artifact_paths: ArtifactPaths { backup, patch },
        risk_class: record.risk_class,
        transaction_id: record.transaction_id.clone(),
        renamed_from: None,
        dependencies: record.dependencies.clone(),
    })
}

fn unwind(written: &[Reversal<'_>]) {
    for reversal in written.iter().rev() {
        let restored = match &reversal.current {
            Some(content) => writer::write_atomic(&reversal.abs, content.as_bytes()).map(|_| ()),
            None => writer::remove(&reversal.abs),
        };
        if let Err(err) = restored {
            error!(path = %reversal.abs.display(), error = %err, "failed to unwind rollback write");
        }
    }
}

fn abort_transaction(
    transaction_id: &str,
    untouched: &[&FileChangeRecord],
    failed: Vec<(&FileChangeRecord, ConflictKind, String, String)>,
    recorder: &mut RunRecorder,
) {
    warn!(transaction_id, failed = failed.len(), "transaction rollback aborted");
    for (record, kind, detail, diff) in &failed {
        recorder.conflict(
            &record.action_id,
            &record.target_path,
            *kind,
            &format!("{detail} (transaction {transaction_id} not reversed)"),
            diff,
        );
    }
    for record in untouched {
        recorder.conflict(
            &record.action_id,
            &record.target_path,
            ConflictKind::TransactionAborted,
            &format!("transaction {transaction_id} was not reversed because another file in it could not be"),
            "",
        );
    }
}
