//! Decides whether a single-file action may be written against the file as it
//! is now, and prepares the new content when it may. Never writes.

use std::path::Path;

use vaultward_core::{ActionPayload, ConflictKind, Digest, ProposedAction, action::anchor_marker};

use crate::diff;
use crate::edits::{self, EditError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub detail: String,
    /// Unified diff from the current file to the edit applied to it. Empty
    /// when the edit cannot be located in the current file.
    pub diff: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Proceed { new_content: String },
    /// The action's effect is already present; writing again would duplicate it.
    AlreadyApplied,
    /// The edit is a no-op against the current content.
    NoChange,
    Conflict(Conflict),
}

/// Apply the payload's edit to `content`. `Ok(None)` when nothing changes.
pub fn apply_edit(payload: &ActionPayload, content: &str) -> Result<Option<String>, EditError> {
    match payload {
        ActionPayload::AppendAnchoredBlock {
            anchor,
            block,
            placement,
        } => {
            let marker = anchor_marker(anchor);
            match edits::count_occurrences(content, &marker) {
                0 => edits::insert_block(content, block, placement).map(Some),
                1 => Ok(None),
                _ => Err(EditError::AmbiguousAnchor(marker)),
            }
        }
        ActionPayload::MergeFields { fields } => edits::merge_frontmatter(content, fields),
        ActionPayload::ReplaceContent { content: replacement } => {
            Ok((replacement != content).then(|| replacement.clone()))
        }
        ActionPayload::RenameNote { .. } | ActionPayload::Preview { .. } => Err(EditError::MalformedStructure(
            format!("{} is not a single-file content edit", payload.type_name()),
        )),
    }
}

fn base_matches(candidate: &str, expected: Option<&Digest>) -> bool {
    match expected {
        Some(digest) => Digest::of_str(candidate) == *digest,
        None => candidate.is_empty(),
    }
}

/// True when `current` is exactly the planned base with this action applied.
fn already_applied(action: &ProposedAction, current: &str) -> bool {
    let expected = action.expected_base_digest.as_ref();
    match &action.payload {
        ActionPayload::AppendAnchoredBlock { anchor, block, .. } => {
            edits::count_occurrences(current, &anchor_marker(anchor)) == 1
                && edits::strip_block_candidates(current, block)
                    .iter()
                    .any(|candidate| base_matches(candidate, expected))
        }
        ActionPayload::ReplaceContent { content } => content == current,
        _ => false,
    }
}

/// Verify `current` (the target's content, `None` if absent) against the
/// action's expected base and prepare the write.
pub fn verify_and_prepare(action: &ProposedAction, current: Option<&str>) -> Resolution {
    let current_digest = current.map(Digest::of_str);
    let expected = action.expected_base_digest.as_ref();

    if current_digest.as_ref() == expected {
        let content = current.unwrap_or("");
        return match apply_edit(&action.payload, content) {
            Ok(Some(new_content)) => Resolution::Proceed { new_content },
            Ok(None) if matches!(action.payload, ActionPayload::AppendAnchoredBlock { .. }) => {
                Resolution::AlreadyApplied
            }
            Ok(None) => Resolution::NoChange,
            Err(err) => Resolution::Conflict(Conflict {
                kind: err.conflict_kind(),
                detail: err.to_string(),
                diff: String::new(),
            }),
        };
    }

    let Some(current) = current else {
        return Resolution::Conflict(Conflict {
            kind: ConflictKind::TargetMissing,
            detail: format!(
                "{} no longer exists; the plan expected digest {}",
                action.target_path.display(),
                expected.map_or("<absent>", Digest::short)
            ),
            diff: String::new(),
        });
    };

    if already_applied(action, current) {
        return Resolution::AlreadyApplied;
    }

    let found = current_digest.as_ref().map_or("<absent>", Digest::short);
    let (kind, detail) = match expected {
        None => (
            ConflictKind::TargetExists,
            format!("{} was expected to be absent but exists ({found})", action.target_path.display()),
        ),
        Some(expected) => (
            ConflictKind::EditedSincePlan,
            format!(
                "{} changed since the plan was made: expected {}, found {found}",
                action.target_path.display(),
                expected.short()
            ),
        ),
    };

    match apply_edit(&action.payload, current) {
        Ok(edited) => {
            let edited = edited.unwrap_or_else(|| current.to_string());
            Resolution::Conflict(Conflict {
                kind,
                detail,
                diff: conflict_diff(&action.target_path, current, &edited),
            })
        }
        Err(err) => Resolution::Conflict(Conflict {
            kind: err.conflict_kind(),
            detail: format!("{detail}; {err}"),
            diff: String::new(),
        }),
    }
}

pub fn conflict_diff(path: &Path, current: &str, proposed: &str) -> String {
    let label = path.to_string_lossy();
    diff::unified(current, proposed, &format!("a/{label} (current)"), &format!("b/{label} (proposed)"))
}
