use std::io::{self, BufRead, IsTerminal, Write};

use vaultward_core::ProposedAction;
use vaultward_engine::{BatchSummary, ConfirmationPort};

/// Asks on the terminal. Declines whenever stdin is not a terminal, unless
/// `--yes` was given.
#[derive(Debug, Clone, Copy)]
pub struct TerminalConfirmation {
    pub assume_yes: bool,
}

impl TerminalConfirmation {
    fn ask(&self, question: &str, expected: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        if !io::stdin().is_terminal() {
            eprintln!("{question} (declined: not a terminal; pass --yes to accept)");
            return false;
        }
        eprint!("{question} ");
        if io::stderr().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        accepts(&answer, expected)
    }
}

fn accepts(answer: &str, expected: &str) -> bool {
    let answer = answer.trim();
    if expected == "y" {
        matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes")
    } else {
        answer == expected
    }
}

impl ConfirmationPort for TerminalConfirmation {
    fn confirm(&self, summary: &BatchSummary) -> bool {
        eprintln!("{summary}");
        self.ask(&format!("Apply {} actions? [y/N]", summary.lines.len()), "y")
    }

    fn confirm_override(&self, action: &ProposedAction, reason: &str) -> bool {
        eprintln!(
            "B2 action {} on {}: {reason}. Rollback will not restore it.",
            action.id,
            action.target_path.display()
        );
        self.ask("Type 'OVERRIDE' to apply it anyway:", "OVERRIDE")
    }
}
