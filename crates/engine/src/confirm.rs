//! Confirmation port: the orchestrator's only point of contact with a human.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use vaultward_core::{FallbackMode, ProposedAction, RiskClass};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryLine {
    pub action_id: String,
    pub target_path: PathBuf,
    pub risk_class: RiskClass,
    pub action_type: &'static str,
}

/// What is about to be written, shown before any mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub run_id: String,
    pub vault: PathBuf,
    pub fallback: FallbackMode,
    pub lines: Vec<SummaryLine>,
    /// Actions dropped before confirmation (read-only, starvation fallback).
    pub withheld: usize,
}

impl BatchSummary {
    pub fn counts(&self) -> BTreeMap<RiskClass, usize> {
        let mut counts = BTreeMap::new();
        for line in &self.lines {
            *counts.entry(line.risk_class).or_insert(0) += 1;
        }
        counts
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} on {}", self.run_id, self.vault.display())?;
        if self.fallback != FallbackMode::None {
            writeln!(f, "Vault did not settle; degraded mode: {:?}", self.fallback)?;
        }
        let counts = self
            .counts()
            .into_iter()
            .map(|(class, n)| format!("{class}: {n}"))
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(f, "{} action(s) to apply ({counts})", self.lines.len())?;
        if self.withheld > 0 {
            writeln!(f, "{} action(s) withheld", self.withheld)?;
        }
        for line in &self.lines {
            writeln!(
                f,
                "  [{}] {} {} {}",
                line.risk_class,
                line.action_id,
                line.action_type,
                line.target_path.display()
            )?;
        }
        Ok(())
    }
}

/// Synchronous approval callback invoked in the `Confirming` state, and once
/// per B2 action that would need a forced override.
pub trait ConfirmationPort: Send + Sync {
    fn confirm(&self, summary: &BatchSummary) -> bool;

    fn confirm_override(&self, action: &ProposedAction, reason: &str) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAccept;

impl ConfirmationPort for AlwaysAccept {
    fn confirm(&self, _summary: &BatchSummary) -> bool {
        true
    }

    fn confirm_override(&self, _action: &ProposedAction, _reason: &str) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReject;

impl ConfirmationPort for AlwaysReject {
    fn confirm(&self, _summary: &BatchSummary) -> bool {
        false
    }

    fn confirm_override(&self, _action: &ProposedAction, _reason: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_renders_counts_by_class() {
        let summary = BatchSummary {
            run_id: "run_1".to_string(),
            vault: PathBuf::from("/vault"),
            fallback: FallbackMode::None,
            lines: vec![
                SummaryLine {
                    action_id: "a1".to_string(),
                    target_path: PathBuf::from("x.md"),
                    risk_class: RiskClass::A,
                    action_type: "append_anchored_block",
                },
                SummaryLine {
                    action_id: "b1".to_string(),
                    target_path: PathBuf::from("y.md"),
                    risk_class: RiskClass::B1,
                    action_type: "rename_note",
                },
            ],
            withheld: 1,
        };
        let text = summary.to_string();
        assert!(text.contains("2 action(s) to apply (A: 1, B1: 1)"));
        assert!(text.contains("1 action(s) withheld"));
        assert!(text.contains("[B1] b1 rename_note y.md"));
    }
}
