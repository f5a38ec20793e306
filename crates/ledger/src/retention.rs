use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use vaultward_core::Result;

use crate::store::{RunEntry, RunLedger};

/// Limits applied by [`prune`]. A zero disables that limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_runs: usize,
    pub max_age_days: u64,
    pub max_total_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub kept: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Remove old run directories until every limit holds, then rewrite the
/// journal without the removed runs. Runs are dropped oldest first.
pub async fn prune(ledger: &RunLedger, policy: RetentionPolicy, now: DateTime<Utc>) -> Result<PruneReport> {
    let entries = ledger.list()?;
    let bytes_before: u64 = entries.iter().map(|e| e.size_bytes).sum();
    let doomed = select_for_removal(&entries, policy, now);

    let mut report = PruneReport {
        bytes_before,
        ..PruneReport::default()
    };
    let mut removed_ids = HashSet::new();
    for entry in entries.iter().filter(|e| doomed.contains(&e.run_id)) {
        match tokio::fs::remove_dir_all(&entry.path).await {
            Ok(()) => {
                removed_ids.insert(entry.run_id.clone());
                report.removed.push(entry.run_id.clone());
            }
            Err(err) => {
                warn!(run_id = %entry.run_id, error = %err, "failed to prune run directory");
            }
        }
    }

    report.kept = entries.len() - report.removed.len();
    report.bytes_after = entries
        .iter()
        .filter(|e| !removed_ids.contains(&e.run_id))
        .map(|e| e.size_bytes)
        .sum();

    if !removed_ids.is_empty() {
        let journal = ledger.journal();
        let events: Vec<_> = journal
            .load()?
            .into_iter()
            .filter(|e| !removed_ids.contains(&e.run_id))
            .collect();
        journal.rewrite(&events).await?;
        info!(
            removed = report.removed.len(),
            kept = report.kept,
            bytes_after = report.bytes_after,
            "pruned run ledger"
        );
    }

    Ok(report)
}

/// `entries` must be newest first, as returned by [`RunLedger::list`].
fn select_for_removal(entries: &[RunEntry], policy: RetentionPolicy, now: DateTime<Utc>) -> HashSet<String> {
    let mut doomed = HashSet::new();

    if policy.max_age_days > 0 {
        let cutoff = now - Duration::days(policy.max_age_days as i64);
        for entry in entries.iter().filter(|e| e.modified < cutoff) {
            doomed.insert(entry.run_id.clone());
        }
    }

    if policy.max_runs > 0 {
        for entry in entries.iter().skip(policy.max_runs) {
            doomed.insert(entry.run_id.clone());
        }
    }

    if policy.max_total_bytes > 0 {
        let mut total: u64 = entries
            .iter()
            .filter(|e| !doomed.contains(&e.run_id))
            .map(|e| e.size_bytes)
            .sum();
        for entry in entries.iter().rev() {
            if total <= policy.max_total_bytes {
                break;
            }
            if doomed.insert(entry.run_id.clone()) {
                total = total.saturating_sub(entry.size_bytes);
            }
        }
    }

    doomed
}
