use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;

use vaultward_config::{AppConfig, CONFIG_FILE_NAME};
use vaultward_core::{ActionPlan, Digest, RunBatch, RunOutcome, SkipReason};
use vaultward_engine::orchestrator::{ABORT_STARVATION, ABORT_USER_DECLINED, REJECT_VCS_DIRTY};
use vaultward_engine::{LeaseOptions, Orchestrator, RollbackEngine, RollbackFilter, diagnose};
use vaultward_ledger::{RetentionPolicy, RunLedger};

use crate::exit;
use crate::prompt::TerminalConfirmation;

/// Vault root plus the configuration that governs it.
#[derive(Debug, Clone)]
pub struct VaultContext {
    pub vault: PathBuf,
    pub config: AppConfig,
}

impl VaultContext {
    pub fn resolve(vault: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<Self> {
        let initial = match vault.clone().or_else(|| std::env::var_os("VAULT_PATH").map(PathBuf::from)) {
            Some(path) => path,
            None => std::env::current_dir().context("cannot determine current directory")?,
        };
        let config = match config_path {
            Some(path) => {
                if !path.exists() {
                    bail!("config file {} does not exist", path.display());
                }
                AppConfig::load_from(&path).with_context(|| format!("failed to load {}", path.display()))?
            }
            None => AppConfig::discover(&initial, &AppConfig::default().state_dir_for(&initial))
                .context("failed to load vaultward.toml")?,
        };
        let vault = vault.or_else(|| config.vault_path()).unwrap_or(initial);
        Ok(Self { vault, config })
    }

    pub fn state_dir(&self) -> PathBuf {
        self.config.state_dir_for(&self.vault)
    }

    fn lease_options(&self, reclaim_stale: bool) -> LeaseOptions {
        LeaseOptions {
            ttl: std::time::Duration::from_secs(self.config.lease.ttl_sec.max(1)),
            reclaim_stale: reclaim_stale || self.config.lease.reclaim_stale,
            force: false,
        }
    }
}

pub struct ApplyArgs {
    pub plan: PathBuf,
    pub yes: bool,
    pub non_interactive: bool,
    pub allow_b2: bool,
    pub reclaim_stale: bool,
    pub json: bool,
}

pub async fn apply(context: &VaultContext, args: ApplyArgs) -> Result<u8> {
    let raw = fs::read_to_string(&args.plan).with_context(|| format!("failed to read plan {}", args.plan.display()))?;
    let plan = ActionPlan::from_json(&raw)?;

    let mut orchestrator = Orchestrator::from_config(context.vault.clone(), &context.config)
        .with_confirmation(TerminalConfirmation { assume_yes: args.yes });
    let options = orchestrator.options_mut();
    options.lease = context.lease_options(args.reclaim_stale);
    if args.non_interactive {
        options.interactive = false;
    }
    if args.allow_b2 {
        options.allow_b2_override = true;
    }

    let report = orchestrator.apply(&plan).await?;
    print_batch(&report.batch, args.json)?;
    if let Some(pruned) = report.pruned.as_ref().filter(|p| !p.removed.is_empty()) {
        eprintln!("pruned {} old runs", pruned.removed.len());
    }
    Ok(outcome_code(&report.batch.outcome))
}

pub async fn rollback(
    context: &VaultContext,
    run_id: &str,
    file: Option<PathBuf>,
    action: Option<String>,
    reclaim_stale: bool,
    json: bool,
) -> Result<u8> {
    let engine = RollbackEngine::new(context.vault.clone(), context.state_dir())
        .with_lease_options(context.lease_options(reclaim_stale));
    let outcome = engine
        .rollback(run_id, &RollbackFilter {
            by_file: file,
            by_action: action,
        })
        .await?;
    for notice in &outcome.notices {
        eprintln!("note: {notice}");
    }
    print_batch(&outcome.batch, json)?;
    Ok(outcome_code(&outcome.batch.outcome))
}

pub fn runs_list(context: &VaultContext, limit: usize) -> Result<u8> {
    let ledger = RunLedger::new(context.state_dir());
    let history = ledger.history()?;
    if history.is_empty() {
        println!("no runs recorded under {}", ledger.runs_dir().display());
        return Ok(exit::OK);
    }
    let sizes: HashMap<String, u64> = ledger
        .list()?
        .into_iter()
        .map(|entry| (entry.run_id, entry.size_bytes))
        .collect();
    for event in history.iter().take(limit) {
        let size = match sizes.get(&event.run_id) {
            Some(bytes) => format!("{:>8} KiB", bytes / 1024),
            None => format!("{:>12}", "pruned"),
        };
        println!(
            "{}  {}  {size}  {:<24} changes={} conflicts={}",
            event.run_id,
            event.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            outcome_label(&event.outcome),
            event.changes,
            event.conflicts
        );
    }
    Ok(exit::OK)
}

pub fn runs_show(context: &VaultContext, run_id: &str) -> Result<u8> {
    let batch = RunLedger::new(context.state_dir()).load(run_id)?;
    println!("{}", serde_json::to_string_pretty(&batch)?);
    Ok(exit::OK)
}

pub async fn doctor(context: &VaultContext) -> Result<u8> {
    let report = diagnose(&context.vault, &context.config).await;
    print!("{report}");
    Ok(if report.healthy() { exit::OK } else { exit::FAILURE })
}

pub async fn prune(
    context: &VaultContext,
    max_runs: Option<usize>,
    max_days: Option<u64>,
    max_mb: Option<u64>,
) -> Result<u8> {
    let storage = &context.config.storage;
    let policy = RetentionPolicy {
        max_runs: max_runs.unwrap_or(storage.max_run_logs),
        max_age_days: max_days.unwrap_or(storage.max_run_days),
        max_total_bytes: max_mb.unwrap_or(storage.max_total_mb).saturating_mul(1024 * 1024),
    };
    let ledger = RunLedger::new(context.state_dir());
    let report = vaultward_ledger::prune(&ledger, policy, Utc::now()).await?;
    println!(
        "removed {} runs, kept {} ({} KiB -> {} KiB)",
        report.removed.len(),
        report.kept,
        report.bytes_before / 1024,
        report.bytes_after / 1024
    );
    Ok(exit::OK)
}

pub fn init_config(context: &VaultContext, force: bool) -> Result<u8> {
    let path = context.vault.join(CONFIG_FILE_NAME);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    AppConfig::default().save_to(&path)?;
    println!("wrote {}", path.display());
    Ok(exit::OK)
}

fn outcome_code(outcome: &RunOutcome) -> u8 {
    match outcome {
        RunOutcome::Completed => exit::OK,
        RunOutcome::CompletedWithConflicts => exit::CONFLICTS,
        RunOutcome::Rejected(reason) if reason == REJECT_VCS_DIRTY => exit::VCS_DIRTY,
        RunOutcome::Aborted(reason) if reason == ABORT_STARVATION => exit::STARVATION,
        RunOutcome::Aborted(reason) if reason == ABORT_USER_DECLINED => exit::OK,
        RunOutcome::Rejected(_) | RunOutcome::Aborted(_) => exit::FAILURE,
    }
}

fn outcome_label(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Completed => "completed".to_string(),
        RunOutcome::CompletedWithConflicts => "completed with conflicts".to_string(),
        RunOutcome::Rejected(reason) => format!("rejected ({reason})"),
        RunOutcome::Aborted(reason) => format!("aborted ({reason})"),
    }
}

fn skip_label(reason: SkipReason) -> String {
    serde_json::to_value(reason)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{reason:?}"))
}

fn short(digest: Option<&Digest>) -> &str {
    digest.map_or("absent", Digest::short)
}

fn print_batch(batch: &RunBatch, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(batch)?);
        return Ok(());
    }
    println!("run {}: {}", batch.run_id, outcome_label(&batch.outcome));
    for change in &batch.changes {
        let moved = change
            .renamed_from
            .as_deref()
            .map(|from| format!(" (from {})", from.display()))
            .unwrap_or_default();
        println!(
            "  changed   {}{moved} [{}] {} -> {}",
            change.target_path.display(),
            change.action_id,
            short(change.before_digest.as_ref()),
            short(change.after_digest.as_ref())
        );
    }
    for conflict in &batch.conflicts {
        println!(
            "  conflict  {} [{}] {}: {}",
            conflict.target_path.display(),
            conflict.action_id,
            conflict.kind.label(),
            conflict.human_note
        );
        if let Some(note) = &conflict.note_artifact {
            println!("            see {}", display_path(note));
        }
    }
    for skipped in &batch.skipped {
        println!(
            "  skipped   {} [{}] {}",
            skipped.target_path.display(),
            skipped.action_id,
            skip_label(skipped.reason)
        );
    }
    Ok(())
}

fn display_path(path: &Path) -> String {
    std::env::current_dir()
        .ok()
        .and_then(|cwd| path.strip_prefix(cwd).ok().map(Path::to_path_buf))
        .unwrap_or_else(|| path.to_path_buf())
        .display()
        .to_string()
}
