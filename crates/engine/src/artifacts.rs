//! Collects the records of one run and writes their artifacts: backups,
//! patches, and the diff/note pair every conflict leaves behind.

use std::path::{Path, PathBuf};

use tracing::warn;

use vaultward_core::{ConflictKind, ConflictRecord, FileChangeRecord, Result, SkipReason, SkippedAction};
use vaultward_ledger::RunArtifacts;

use crate::diff;

#[derive(Debug)]
pub struct RunRecorder {
    artifacts: RunArtifacts,
    pub changes: Vec<FileChangeRecord>,
    pub conflicts: Vec<ConflictRecord>,
    pub skipped: Vec<SkippedAction>,
}

impl RunRecorder {
    pub fn new(artifacts: RunArtifacts) -> Self {
        Self {
            artifacts,
            changes: Vec::new(),
            conflicts: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn artifacts(&self) -> &RunArtifacts {
        &self.artifacts
    }

    pub fn skip(&mut self, action_id: &str, target_path: &Path, reason: SkipReason) {
        self.skipped.push(SkippedAction {
            action_id: action_id.to_string(),
            target_path: target_path.to_path_buf(),
            reason,
        });
    }

    /// Record a conflict. The note is always written; the diff only when
    /// there is one. Artifact write failures are logged and the conflict is
    /// still recorded with its note inline.
    pub fn conflict(&mut self, action_id: &str, target_path: &Path, kind: ConflictKind, detail: &str, diff: &str) {
        let (diff_path, note_path) = self.artifacts.conflict_paths(action_id, target_path);
        let note = format!(
            "action: {action_id}\ntarget: {}\nconflict: {}\n\n{detail}\n\nNothing was overwritten. See HOWTO.txt in this directory.\n",
            target_path.display(),
            kind.label(),
        );

        let note_artifact = self.write_logged(&note_path, &note);
        let diff_artifact = if diff.is_empty() {
            None
        } else {
            self.write_logged(&diff_path, diff)
        };
        if let Err(err) = self.artifacts.ensure_howto() {
            warn!(error = %err, "failed to write conflict HOWTO");
        }

        warn!(action_id, target = %target_path.display(), kind = kind.label(), "conflict recorded");
        self.conflicts.push(ConflictRecord {
            action_id: action_id.to_string(),
            target_path: target_path.to_path_buf(),
            kind,
            diff_artifact,
            note_artifact,
            human_note: detail.to_string(),
        });
    }

    fn write_logged(&self, path: &Path, content: &str) -> Option<PathBuf> {
        match self.artifacts.write(path, content) {
            Ok(()) => Some(path.to_path_buf()),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to write conflict artifact");
                None
            }
        }
    }

    /// Save the pre-write content. Must succeed before the write happens.
    pub fn backup(&self, action_id: &str, rel: &Path, content: &str) -> Result<PathBuf> {
        let path = self.artifacts.backup_path(action_id, rel);
        self.artifacts.write(&path, content)?;
        Ok(path)
    }

    pub fn patch(&self, action_id: &str, rel: &Path, old: &str, new: &str) -> Option<PathBuf> {
        let label = rel.to_string_lossy();
        let rendered = diff::unified(old, new, &format!("a/{label}"), &format!("b/{label}"));
        if rendered.is_empty() {
            return None;
        }
        let path = self.artifacts.patch_path(action_id, rel);
        self.write_logged(&path, &rendered)
    }

    pub fn change(&mut self, record: FileChangeRecord) {
        self.changes.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn recorder(dir: &TempDir) -> RunRecorder {
        RunRecorder::new(RunArtifacts {
            run_dir: dir.path().join("runs/r1"),
        })
    }

    #[test]
    fn conflict_writes_note_diff_and_howto() {
        let dir = TempDir::new().unwrap();
        let mut rec = recorder(&dir);
        rec.conflict("a1", Path::new("notes/x.md"), ConflictKind::EditedSincePlan, "changed", "--- a\n+++ b\n");
        let record = &rec.conflicts[0];
        let note = fs::read_to_string(record.note_artifact.as_ref().unwrap()).unwrap();
        assert!(note.contains("conflict: edited since plan"));
        assert!(record.diff_artifact.as_ref().unwrap().exists());
        assert!(dir.path().join("runs/r1/conflicts/HOWTO.txt").exists());
    }

    #[test]
    fn conflict_without_diff_has_only_note() {
        let dir = TempDir::new().unwrap();
        let mut rec = recorder(&dir);
        rec.conflict("a1", Path::new("x.md"), ConflictKind::AmbiguousAnchor, "twice", "");
        assert!(rec.conflicts[0].diff_artifact.is_none());
        assert!(rec.conflicts[0].note_artifact.is_some());
    }

    #[test]
    fn backup_and_patch_paths() {
        let dir = TempDir::new().unwrap();
        let rec = recorder(&dir);
        let backup = rec.backup("a1", Path::new("x.md"), "old\n").unwrap();
        assert_eq!(fs::read_to_string(backup).unwrap(), "old\n");
        let patch = rec.patch("a1", Path::new("x.md"), "old\n", "new\n").unwrap();
        assert!(fs::read_to_string(patch).unwrap().contains("+new"));
        assert!(rec.patch("a1", Path::new("x.md"), "same", "same").is_none());
    }
}
