//! All-or-nothing application of a B1 transaction.
//!
//! Every member is verified and its edits staged in memory before anything
//! is written. Writes then go out one file at a time; if any of them fails
//! (the file moved under us, or I/O broke) the files already written are
//! restored and no change record is kept for the transaction.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use vaultward_core::paths::{normalize_path, resolve_in_vault};
use vaultward_core::{ActionPayload, ArtifactPaths, ConflictKind, Digest, FileChangeRecord, RiskClass};

use crate::artifacts::RunRecorder;
use crate::edits;
use crate::plan::PlannedAction;
use crate::resolver::{self, Resolution};
use crate::source::{DigestSource, read_current};
use crate::writer;

/// Why the transaction cannot commit, pinned to the member at fault.
#[derive(Debug)]
struct Failure {
    action_id: String,
    target: PathBuf,
    kind: ConflictKind,
    detail: String,
    diff: String,
}

#[derive(Debug, Clone)]
struct Staged {
    action_id: String,
    original: Option<String>,
    original_digest: Option<Digest>,
    /// `None`: the file is removed.
    content: Option<String>,
    renamed_from: Option<PathBuf>,
    dependencies: Vec<String>,
}

struct Stage<'a> {
    vault: &'a Path,
    files: BTreeMap<PathBuf, Staged>,
    originals: BTreeMap<PathBuf, Option<String>>,
}

impl<'a> Stage<'a> {
    fn new(vault: &'a Path) -> Self {
        Self {
            vault,
            files: BTreeMap::new(),
            originals: BTreeMap::new(),
        }
    }

    fn original(&mut self, rel: &Path) -> std::io::Result<Option<String>> {
        if let Some(content) = self.originals.get(rel) {
            return Ok(content.clone());
        }
        let abs = resolve_in_vault(self.vault, rel).map_err(std::io::Error::other)?;
        let content = read_current(&abs)?;
        self.originals.insert(rel.to_path_buf(), content.clone());
        Ok(content)
    }

    /// Content as it will be once earlier members are applied.
    fn view(&mut self, rel: &Path) -> std::io::Result<Option<String>> {
        match self.files.get(rel) {
            Some(staged) => Ok(staged.content.clone()),
            None => self.original(rel),
        }
    }

    fn put(&mut self, rel: &Path, planned: &PlannedAction, content: Option<String>, renamed_from: Option<PathBuf>) -> std::io::Result<()> {
        if let Some(existing) = self.files.get_mut(rel) {
            existing.content = content;
            if renamed_from.is_some() {
                existing.renamed_from = renamed_from;
            }
            return Ok(());
        }
        let original = self.original(rel)?;
        self.files.insert(
            rel.to_path_buf(),
            Staged {
                action_id: planned.action.id.clone(),
                original_digest: original.as_deref().map(Digest::of_str),
                original,
                content,
                renamed_from,
                dependencies: planned.action.dependencies.iter().cloned().collect(),
            },
        );
        Ok(())
    }
}

fn io_failure(planned: &PlannedAction, target: &Path, err: impl std::fmt::Display) -> Failure {
    Failure {
        action_id: planned.action.id.clone(),
        target: target.to_path_buf(),
        kind: ConflictKind::IoFailure,
        detail: format!("I/O error: {err}"),
        diff: String::new(),
    }
}

/// Markdown files other than `exclude` that link to `source`. Hidden
/// directories (`.obsidian`, `.git`, the engine's state) are not scanned.
fn linking_files(stage: &mut Stage<'_>, source: &Path, exclude: &BTreeMap<PathBuf, Digest>) -> std::io::Result<Vec<PathBuf>> {
    let vault = stage.vault.to_path_buf();
    let mut found = Vec::new();
    let walker = walkdir::WalkDir::new(&vault)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || entry.path().extension().is_none_or(|ext| ext != "md") {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(&vault) else {
            continue;
        };
        let rel = rel.to_path_buf();
        if rel == source || exclude.contains_key(&rel) {
            continue;
        }
        let links = stage
            .view(&rel)?
            .is_some_and(|content| edits::count_links_to(&content, source) > 0);
        if links {
            found.push(rel);
        }
    }
    Ok(found)
}

fn stage_rename(
    stage: &mut Stage<'_>,
    planned: &PlannedAction,
    source: &Path,
    referrers: &BTreeMap<PathBuf, Digest>,
) -> Result<(), Failure> {
    let target = normalize_path(&planned.action.target_path);
    let source = normalize_path(source);
    let referrers: BTreeMap<PathBuf, Digest> = referrers
        .iter()
        .map(|(path, digest)| (normalize_path(path), digest.clone()))
        .collect();

    let Some(source_content) = stage.view(&source).map_err(|e| io_failure(planned, &source, e))? else {
        return Err(Failure {
            action_id: planned.action.id.clone(),
            target: source.clone(),
            kind: ConflictKind::TargetMissing,
            detail: format!("rename source {} does not exist", source.display()),
            diff: String::new(),
        });
    };
    if !stage.files.contains_key(&source) {
        let current = Digest::of_str(&source_content);
        if planned.action.expected_base_digest.as_ref().is_some_and(|d| *d != current) {
            return Err(Failure {
                action_id: planned.action.id.clone(),
                target: source.clone(),
                kind: ConflictKind::EditedSincePlan,
                detail: format!("{} changed since the plan was made", source.display()),
                diff: String::new(),
            });
        }
    }
    if stage
        .view(&target)
        .map_err(|e| io_failure(planned, &target, e))?
        .is_some()
    {
        return Err(Failure {
            action_id: planned.action.id.clone(),
            target: target.clone(),
            kind: ConflictKind::TargetExists,
            detail: format!("rename target {} already exists", target.display()),
            diff: String::new(),
        });
    }

    let mut rewritten = Vec::new();
    for (rel, planned_digest) in &referrers {
        let original = stage.original(rel).map_err(|e| io_failure(planned, rel, e))?;
        let current = stage.view(rel).map_err(|e| io_failure(planned, rel, e))?;
        let Some(current) = current else {
            return Err(Failure {
                action_id: planned.action.id.clone(),
                target: rel.clone(),
                kind: ConflictKind::TargetMissing,
                detail: format!("referrer {} does not exist", rel.display()),
                diff: String::new(),
            });
        };
        let (updated, _) = edits::rewrite_links(&current, &source, &target);
        if original.as_deref().map(Digest::of_str).as_ref() != Some(planned_digest) {
            return Err(Failure {
                action_id: planned.action.id.clone(),
                target: rel.clone(),
                kind: ConflictKind::EditedSincePlan,
                detail: format!(
                    "referrer {} changed since the plan was made: expected {}",
                    rel.display(),
                    planned_digest.short()
                ),
                diff: resolver::conflict_diff(rel, &current, &updated),
            });
        }
        rewritten.push((rel.clone(), updated));
    }

    let unplanned = linking_files(stage, &source, &referrers).map_err(|e| io_failure(planned, &source, e))?;
    if !unplanned.is_empty() {
        let listed: Vec<String> = unplanned.iter().map(|p| p.display().to_string()).collect();
        return Err(Failure {
            action_id: planned.action.id.clone(),
            target: source.clone(),
            kind: ConflictKind::UnplannedReference,
            detail: format!(
                "renaming {} would break links in files the plan does not update: {}",
                source.display(),
                listed.join(", ")
            ),
            diff: String::new(),
        });
    }

    let (moved, _) = edits::rewrite_links(&source_content, &source, &target);
    let put = |stage: &mut Stage<'_>, rel: &Path, content: Option<String>, from: Option<PathBuf>| {
        stage.put(rel, planned, content, from).map_err(|e| io_failure(planned, rel, e))
    };
    put(stage, &target, Some(moved), Some(source.clone()))?;
    for (rel, updated) in rewritten {
        put(stage, &rel, Some(updated), None)?;
    }
    put(stage, &source, None, None)?;
    Ok(())
}

fn stage_edit(stage: &mut Stage<'_>, planned: &PlannedAction) -> Result<(), Failure> {
    let rel = normalize_path(&planned.action.target_path);
    let fail = |kind, detail: String, diff: String| Failure {
        action_id: planned.action.id.clone(),
        target: rel.clone(),
        kind,
        detail,
        diff,
    };

    if stage.files.contains_key(&rel) {
        // Already rewritten by an earlier member: the planned base no longer applies.
        let current = stage.view(&rel).map_err(|e| io_failure(planned, &rel, e))?;
        let edited = resolver::apply_edit(&planned.action.payload, current.as_deref().unwrap_or(""))
            .map_err(|err| fail(err.conflict_kind(), err.to_string(), String::new()))?;
        if let Some(edited) = edited {
            stage.put(&rel, planned, Some(edited), None).map_err(|e| io_failure(planned, &rel, e))?;
        }
        return Ok(());
    }

    let current = stage.original(&rel).map_err(|e| io_failure(planned, &rel, e))?;
    match resolver::verify_and_prepare(&planned.action, current.as_deref()) {
        Resolution::Proceed { new_content } => stage
            .put(&rel, planned, Some(new_content), None)
            .map_err(|e| io_failure(planned, &rel, e)),
        Resolution::AlreadyApplied | Resolution::NoChange => Ok(()),
        Resolution::Conflict(conflict) => Err(fail(conflict.kind, conflict.detail, conflict.diff)),
    }
}

/// Apply `members` (in dependency order) as one unit. Returns whether the
/// transaction committed; either way `recorder` receives its records.
pub(crate) fn apply(
    vault: &Path,
    transaction_id: &str,
    members: &[&PlannedAction],
    digests: &dyn DigestSource,
    recorder: &mut RunRecorder,
) -> bool {
    let mut stage = Stage::new(vault);
    let staged = members.iter().try_for_each(|planned| match &planned.action.payload {
        ActionPayload::RenameNote {
            source_path,
            referrers,
        } => stage_rename(&mut stage, planned, source_path, referrers),
        _ => stage_edit(&mut stage, planned),
    });
    if let Err(failure) = staged {
        abort(transaction_id, members, failure, recorder);
        return false;
    }

    // New content lands before sources disappear.
    let mut order: Vec<(PathBuf, Staged)> = stage.files.into_iter().collect();
    order.sort_by_key(|(_, staged)| staged.content.is_none());

    let mut written: Vec<(PathBuf, Option<String>)> = Vec::new();
    let mut records = Vec::new();
    for (rel, staged) in &order {
        match commit_file(vault, rel, staged, digests, recorder) {
            Ok(artifact_paths_and_after) => {
                written.push((rel.clone(), staged.original.clone()));
                let (artifact_paths, after_digest) = artifact_paths_and_after;
                let risk_class = members
                    .iter()
                    .find(|m| m.action.id == staged.action_id)
                    .map_or(RiskClass::B1, |m| m.class);
                records.push(FileChangeRecord {
                    action_id: staged.action_id.clone(),
                    target_path: rel.clone(),
                    base_digest: staged.original_digest.clone(),
                    before_digest: staged.original_digest.clone(),
                    after_digest,
                    artifact_paths,
                    risk_class,
                    transaction_id: Some(transaction_id.to_string()),
                    renamed_from: staged.renamed_from.clone(),
                    dependencies: staged.dependencies.clone(),
                });
            }
            Err(failure) => {
                unwind(vault, &written);
                abort(transaction_id, members, failure, recorder);
                return false;
            }
        }
    }

    info!(transaction_id, files = records.len(), "transaction committed");
    for record in records {
        recorder.change(record);
    }
    true
}

fn commit_file(
    vault: &Path,
    rel: &Path,
    staged: &Staged,
    digests: &dyn DigestSource,
    recorder: &RunRecorder,
) -> Result<(ArtifactPaths, Option<Digest>), Failure> {
    let fail = |kind, detail: String| Failure {
        action_id: staged.action_id.clone(),
        target: rel.to_path_buf(),
        kind,
        detail,
        diff: String::new(),
    };
    let abs = resolve_in_vault(vault, rel).map_err(|e| fail(ConflictKind::MalformedStructure, e.to_string()))?;

    let now = digests
        .digest_of(&abs)
        .map_err(|e| fail(ConflictKind::IoFailure, format!("I/O error: {e}")))?;
    if now != staged.original_digest {
        return Err(fail(
            ConflictKind::EditedSincePlan,
            format!("{} changed while the transaction was being applied", rel.display()),
        ));
    }

    let backup = match &staged.original {
        Some(original) => Some(
            recorder
                .backup(&staged.action_id, rel, original)
                .map_err(|e| fail(ConflictKind::IoFailure, format!("backup failed: {e}")))?,
        ),
        None => None,
    };
    let patch = recorder.patch(
        &staged.action_id,
        rel,
        staged.original.as_deref().unwrap_or(""),
        staged.content.as_deref().unwrap_or(""),
    );

    let after = match &staged.content {
        Some(content) => Some(
            writer::write_atomic(&abs, content.as_bytes())
                .map_err(|e| fail(ConflictKind::IoFailure, format!("I/O error: {e}")))?,
        ),
        None => {
            writer::remove(&abs).map_err(|e| fail(ConflictKind::IoFailure, format!("I/O error: {e}")))?;
            None
        }
    };
    Ok((ArtifactPaths { backup, patch }, after))
}

fn unwind(vault: &Path, written: &[(PathBuf, Option<String>)]) {
    for (rel, original) in written.iter().rev() {
        let Ok(abs) = resolve_in_vault(vault, rel) else {
            continue;
        };
        let restored = match original {
            Some(content) => writer::write_atomic(&abs, content.as_bytes()).map(|_| ()),
            None => writer::remove(&abs),
        };
        match restored {
            Ok(()) => warn!(path = %rel.display(), "unwound transaction write"),
            Err(err) => error!(path = %rel.display(), error = %err, "failed to unwind transaction write"),
        }
    }
}

fn abort(transaction_id: &str, members: &[&PlannedAction], failure: Failure, recorder: &mut RunRecorder) {
    warn!(transaction_id, action_id = %failure.action_id, kind = failure.kind.label(), "transaction aborted");
    for member in members {
        if member.action.id == failure.action_id {
            continue;
        }
        recorder.conflict(
            &member.action.id,
            &member.action.target_path,
            ConflictKind::TransactionAborted,
            &format!(
                "transaction {transaction_id} was not applied because {} hit a conflict ({}); nothing in it was written",
                failure.action_id,
                failure.kind.label()
            ),
            "",
        );
    }
    recorder.conflict(
        &failure.action_id,
        &failure.target,
        failure.kind,
        &format!("{} (transaction {transaction_id} not applied)", failure.detail),
        &failure.diff,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FsDigestSource;
    use std::collections::BTreeSet;
    use std::fs;
    use tempfile::TempDir;
    use vaultward_core::ProposedAction;
    use vaultward_ledger::RunArtifacts;

    fn write(vault: &TempDir, rel: &str, content: &str) -> Digest {
        fs::write(vault.path().join(rel), content).unwrap();
        Digest::of_str(content)
    }

    fn read(vault: &TempDir, rel: &str) -> Option<String> {
        fs::read_to_string(vault.path().join(rel)).ok()
    }

    fn rename(id: &str, from: &str, to: &str, base: Digest, referrers: &[(&str, Digest)], deps: &[&str]) -> PlannedAction {
        PlannedAction {
            action: ProposedAction {
                id: id.to_string(),
                target_path: PathBuf::from(to),
                risk_class: RiskClass::B1,
                payload: ActionPayload::RenameNote {
                    source_path: PathBuf::from(from),
                    referrers: referrers
                        .iter()
                        .map(|(path, digest)| (PathBuf::from(path), digest.clone()))
                        .collect(),
                },
                dependencies: deps.iter().map(|d| d.to_string()).collect::<BTreeSet<_>>(),
                expected_base_digest: Some(base),
            },
            class: RiskClass::B1,
            transaction_id: Some("txn_r1".to_string()),
        }
    }

    fn recorder(vault: &TempDir) -> RunRecorder {
        RunRecorder::new(RunArtifacts {
            run_dir: vault.path().join(".vaultward/runs/run_t"),
        })
    }

    fn kind_of(recorder: &RunRecorder, id: &str) -> Option<ConflictKind> {
        recorder.conflicts.iter().find(|c| c.action_id == id).map(|c| c.kind)
    }

    /// Sees one file change just before it is written.
    struct ChangesBeforeWrite(&'static str);

    impl DigestSource for ChangesBeforeWrite {
        fn digest_of(&self, path: &Path) -> std::io::Result<Option<Digest>> {
            if path.ends_with(self.0) {
                return Ok(Some(Digest::of_str("edited by a sync client")));
            }
            Digest::of_file(path)
        }
    }

    #[test]
    fn members_commit_together() {
        let vault = TempDir::new().unwrap();
        let a = write(&vault, "a.md", "# A\n");
        let c = write(&vault, "c.md", "see [[a]]\n");
        let x = write(&vault, "x.md", "# X\n");
        let r1 = rename("r1", "a.md", "b.md", a, &[("c.md", c)], &[]);
        let r2 = rename("r2", "x.md", "y.md", x, &[], &["r1"]);
        let mut recorder = recorder(&vault);

        assert!(apply(vault.path(), "txn_r1", &[&r1, &r2], &FsDigestSource, &mut recorder));

        assert_eq!(read(&vault, "b.md").as_deref(), Some("# A\n"));
        assert_eq!(read(&vault, "y.md").as_deref(), Some("# X\n"));
        assert_eq!(read(&vault, "c.md").as_deref(), Some("see [[b]]\n"));
        assert!(read(&vault, "a.md").is_none());
        assert_eq!(recorder.changes.len(), 5);
        assert!(recorder.conflicts.is_empty());
    }

    #[test]
    fn late_commit_failure_restores_files_already_written() {
        let vault = TempDir::new().unwrap();
        let a = write(&vault, "a.md", "# A\n");
        let c = write(&vault, "c.md", "see [[a]]\n");
        let x = write(&vault, "x.md", "# X\n");
        let r1 = rename("r1", "a.md", "b.md", a, &[("c.md", c)], &[]);
        let r2 = rename("r2", "x.md", "y.md", x, &[], &["r1"]);
        let mut recorder = recorder(&vault);

        // b.md and c.md are written before y.md is reached.
        let committed = apply(vault.path(), "txn_r1", &[&r1, &r2], &ChangesBeforeWrite("y.md"), &mut recorder);

        assert!(!committed);
        assert_eq!(read(&vault, "a.md").as_deref(), Some("# A\n"));
        assert_eq!(read(&vault, "x.md").as_deref(), Some("# X\n"));
        assert_eq!(read(&vault, "c.md").as_deref(), Some("see [[a]]\n"));
        assert!(read(&vault, "b.md").is_none());
        assert!(read(&vault, "y.md").is_none());
        assert!(recorder.changes.is_empty());
        assert_eq!(kind_of(&recorder, "r2"), Some(ConflictKind::EditedSincePlan));
        assert_eq!(kind_of(&recorder, "r1"), Some(ConflictKind::TransactionAborted));
    }

    #[test]
    fn unplanned_referrer_blocks_rename() {
        let vault = TempDir::new().unwrap();
        let a = write(&vault, "a.md", "# A\n");
        write(&vault, "d.md", "also see [[a|the A note]]\n");
        let r1 = rename("r1", "a.md", "b.md", a, &[], &[]);
        let mut recorder = recorder(&vault);

        assert!(!apply(vault.path(), "txn_r1", &[&r1], &FsDigestSource, &mut recorder));

        assert_eq!(kind_of(&recorder, "r1"), Some(ConflictKind::UnplannedReference));
        let note = &recorder.conflicts[0].human_note;
        assert!(note.contains("d.md"), "{note}");
        assert_eq!(read(&vault, "a.md").as_deref(), Some("# A\n"));
        assert!(read(&vault, "b.md").is_none());
    }

    #[test]
    fn existing_target_blocks_rename() {
        let vault = TempDir::new().unwrap();
        let a = write(&vault, "a.md", "# A\n");
        write(&vault, "b.md", "# B\n");
        let r1 = rename("r1", "a.md", "b.md", a, &[], &[]);
        let mut recorder = recorder(&vault);

        assert!(!apply(vault.path(), "txn_r1", &[&r1], &FsDigestSource, &mut recorder));

        assert_eq!(kind_of(&recorder, "r1"), Some(ConflictKind::TargetExists));
        assert_eq!(read(&vault, "a.md").as_deref(), Some("# A\n"));
        assert_eq!(read(&vault, "b.md").as_deref(), Some("# B\n"));
        assert!(recorder.changes.is_empty());
    }
}
