//! Risk classification. The effective class is the stricter of what the
//! recommender declared and what the action's shape implies; a declared
//! class never lowers it. A read-only declaration always holds.

use vaultward_core::paths::{is_vault_relative, normalize_path};
use vaultward_core::{ActionPayload, ProposedAction, RiskClass, action::anchor_marker};

/// Class implied by the payload type alone.
pub fn derived_class(action: &ProposedAction) -> RiskClass {
    match action.payload {
        ActionPayload::AppendAnchoredBlock { .. } | ActionPayload::MergeFields { .. } => RiskClass::A,
        ActionPayload::RenameNote { .. } => RiskClass::B1,
        ActionPayload::ReplaceContent { .. } => RiskClass::B2,
        ActionPayload::Preview { .. } => RiskClass::ReadOnly,
    }
}

/// Why an action cannot be applied safely as planned, if it cannot.
pub fn structural_problem(action: &ProposedAction) -> Option<String> {
    if !is_vault_relative(&action.target_path) {
        return Some(format!("target {} escapes the vault", action.target_path.display()));
    }
    match &action.payload {
        ActionPayload::AppendAnchoredBlock { anchor, block, .. } => {
            if anchor.trim().is_empty() {
                Some("anchored block has an empty anchor".to_string())
            } else if !block.contains(&anchor_marker(anchor)) {
                Some(format!("block does not carry its marker {}", anchor_marker(anchor)))
            } else {
                None
            }
        }
        ActionPayload::RenameNote {
            source_path,
            referrers,
        } => {
            if !is_vault_relative(source_path) {
                Some(format!("rename source {} escapes the vault", source_path.display()))
            } else if normalize_path(source_path) == normalize_path(&action.target_path) {
                Some("rename source and target are the same note".to_string())
            } else {
                referrers
                    .keys()
                    .find(|path| !is_vault_relative(path))
                    .map(|path| format!("referrer {} escapes the vault", path.display()))
            }
        }
        _ => None,
    }
}

pub fn classify(action: &ProposedAction) -> RiskClass {
    let class = action.risk_class.stricter(derived_class(action));
    if class == RiskClass::ReadOnly {
        return class;
    }
    if structural_problem(action).is_some() {
        return RiskClass::B2;
    }
    class
}
