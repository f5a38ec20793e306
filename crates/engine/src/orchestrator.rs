//! Apply orchestrator.
//!
//! ```text
//! Idle ─► LeaseAcquiring ─► Quiescing ─► Confirming ─► Applying ─► Finalizing ─► Released
//!  │            │               │             │
//!  ▼            ▼               ▼             ▼
//! Rejected   Rejected        Aborted       Aborted
//! ```
//!
//! Plan validation and the version-control preflight happen in `Idle`. Once
//! the lease is held every exit path releases it, and every run that got
//! that far is written to the ledger, aborted or not.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use vaultward_config::{AppConfig, GitPolicy, StarvationPolicy};
use vaultward_core::paths::resolve_in_vault;
use vaultward_core::{
    ActionPayload, ActionPlan, ArtifactPaths, ConflictKind, Digest, FallbackMode, FileChangeRecord,
    QuiescenceObservation, Result, RiskClass, RunBatch, RunKind, RunOutcome, SCHEMA_VERSION, SkipReason, VcsInfo,
    check_schema,
};
use vaultward_ledger::{PruneReport, RetentionPolicy, RunLedger, prune};

use crate::artifacts::RunRecorder;
use crate::classifier;
use crate::confirm::{AlwaysReject, BatchSummary, ConfirmationPort, SummaryLine};
use crate::lease::{LeaseHandle, LeaseOptions, WriteLease};
use crate::plan::{self, OrderedPlan, PlannedAction};
use crate::quiescence::{ActivityProbe, FsActivityProbe, QuiescenceSettings, wait_for_quiet};
use crate::resolver::{self, Resolution};
use crate::source::{DigestSource, FsDigestSource, read_current};
use crate::vcs::{GitCli, NoVcs, VcsStatus, VersionControl, vault_relative};
use crate::writer;

pub const ABORT_STARVATION: &str = "starvation";
pub const ABORT_USER_DECLINED: &str = "user_declined";
pub const REJECT_VCS_DIRTY: &str = "vcs_dirty";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyState {
    Idle,
    LeaseAcquiring,
    Quiescing,
    Confirming,
    Applying,
    Finalizing,
    Released,
    Rejected(String),
    Aborted(String),
}

impl fmt::Display for ApplyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::LeaseAcquiring => f.write_str("lease_acquiring"),
            Self::Quiescing => f.write_str("quiescing"),
            Self::Confirming => f.write_str("confirming"),
            Self::Applying => f.write_str("applying"),
            Self::Finalizing => f.write_str("finalizing"),
            Self::Released => f.write_str("released"),
            Self::Rejected(reason) => write!(f, "rejected({reason})"),
            Self::Aborted(reason) => write!(f, "aborted({reason})"),
        }
    }
}

/// Marker dropped in the vault under starvation asking sync clients to pause.
#[derive(Debug, Clone)]
pub struct OfflineLock {
    pub marker: PathBuf,
    pub cleanup: bool,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub lease: LeaseOptions,
    pub quiescence: QuiescenceSettings,
    pub on_starvation: StarvationPolicy,
    pub offline_lock: Option<OfflineLock>,
    /// When false the batch confirmation is skipped. B2 overrides are still
    /// put to the confirmation port one by one.
    pub interactive: bool,
    pub allow_b2_override: bool,
    pub git_policy: GitPolicy,
    pub auto_checkpoint: bool,
    pub retention: Option<RetentionPolicy>,
}

impl RunOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        let storage = &config.storage;
        Self {
            lease: LeaseOptions {
                ttl: std::time::Duration::from_secs(config.lease.ttl_sec.max(1)),
                reclaim_stale: config.lease.reclaim_stale,
                force: false,
            },
            quiescence: QuiescenceSettings::from(&config.quiescence),
            on_starvation: config.quiescence.on_starvation,
            offline_lock: config.quiescence.offline_lock.then(|| OfflineLock {
                marker: PathBuf::from(&config.quiescence.offline_lock_marker),
                cleanup: config.quiescence.offline_lock_cleanup,
            }),
            interactive: config.apply.interactive,
            allow_b2_override: config.apply.allow_b2_override,
            git_policy: config.git.policy,
            auto_checkpoint: config.git.auto_checkpoint,
            retention: storage.auto_prune.then_some(RetentionPolicy {
                max_runs: storage.max_run_logs,
                max_age_days: storage.max_run_days,
                max_total_bytes: storage.max_total_mb.saturating_mul(1024 * 1024),
            }),
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub batch: RunBatch,
    pub states: Vec<ApplyState>,
    /// Path of `run-log.json`; `None` for runs rejected before the lease.
    pub recorded: Option<PathBuf>,
    pub pruned: Option<PruneReport>,
}

impl ApplyReport {
    pub fn final_state(&self) -> Option<&ApplyState> {
        self.states.last()
    }
}

/// Per-run state carried from the lease onwards.
struct RunContext {
    run_id: String,
    started_at: DateTime<Utc>,
    states: Vec<ApplyState>,
    lease: Option<LeaseHandle>,
    quiescence: Option<QuiescenceObservation>,
    fallback: FallbackMode,
    offline_lock: Option<PathBuf>,
    vcs: VcsInfo,
    recorder: RunRecorder,
}

impl RunContext {
    fn enter(&mut self, state: ApplyState) {
        info!(run_id = %self.run_id, state = %state, "apply state");
        self.states.push(state);
    }
}

pub struct Orchestrator {
    vault: PathBuf,
    ledger: RunLedger,
    lease: WriteLease,
    options: RunOptions,
    probe: Box<dyn ActivityProbe>,
    vcs: Box<dyn VersionControl>,
    confirmation: Box<dyn ConfirmationPort>,
    digests: Box<dyn DigestSource>,
}

impl Orchestrator {
    /// Filesystem probe with default busy paths, no version control, and a
    /// confirmation port that declines.
    pub fn new(vault: impl Into<PathBuf>, state_dir: impl AsRef<Path>, options: RunOptions) -> Self {
        let vault = vault.into();
        let probe = FsActivityProbe::from_config(vault.clone(), &Default::default());
        Self {
            ledger: RunLedger::new(state_dir.as_ref()),
            lease: WriteLease::new(state_dir.as_ref()),
            options,
            probe: Box::new(probe),
            vcs: Box::new(NoVcs),
            confirmation: Box::new(AlwaysReject),
            digests: Box::new(FsDigestSource),
            vault,
        }
    }

    /// Wire the production collaborators from configuration.
    pub fn from_config(vault: impl Into<PathBuf>, config: &AppConfig) -> Self {
        let vault = vault.into();
        let state_dir = config.state_dir_for(&vault);
        let mut git = GitCli::new(vault.clone()).excluding(config.quiescence.offline_lock_marker.clone());
        if let Some(rel) = vault_relative(&vault, &state_dir) {
            git = git.excluding(rel);
        }
        let probe = FsActivityProbe::from_config(vault.clone(), &config.quiescence);
        Self::new(vault, &state_dir, RunOptions::from_config(config))
            .with_probe(probe)
            .with_vcs(git)
    }

    pub fn with_probe(mut self, probe: impl ActivityProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn with_vcs(mut self, vcs: impl VersionControl + 'static) -> Self {
        self.vcs = Box::new(vcs);
        self
    }

    pub fn with_confirmation(mut self, confirmation: impl ConfirmationPort + 'static) -> Self {
        self.confirmation = Box::new(confirmation);
        self
    }

    pub fn with_digest_source(mut self, digests: impl DigestSource + 'static) -> Self {
        self.digests = Box::new(digests);
        self
    }

    pub fn options_mut(&mut self) -> &mut RunOptions {
        &mut self.options
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    /// Run one batch to a terminal state.
    ///
    /// Invalid plans, unknown schema versions and a held lease are errors:
    /// nothing is recorded. Everything after the lease is a [`RunOutcome`].
    /// A held lease therefore surfaces as `Err(LeaseHeld)` or
    /// `Err(LiveLeaseReclaim)` rather than as an `ApplyState::Rejected` entry
    /// in [`ApplyReport::states`].
    pub async fn apply(&self, plan: &ActionPlan) -> Result<ApplyReport> {
        let started_at = Utc::now();
        let run_id = RunBatch::new_run_id();
        let mut states = vec![ApplyState::Idle];

        check_schema("action-plan", plan.schema_version)?;
        let ordered = plan::order(&plan.items)?;

        let mut vcs = VcsInfo::default();
        let status = self.vcs.status().await?;
        vcs.repo = status != VcsStatus::NotARepo;
        vcs.dirty = vcs.repo.then_some(status == VcsStatus::Dirty);
        if status == VcsStatus::Dirty && self.options.git_policy == GitPolicy::RequireClean {
            warn!(run_id = %run_id, "vault has uncommitted changes; refusing to apply");
            states.push(ApplyState::Rejected(REJECT_VCS_DIRTY.to_string()));
            return Ok(ApplyReport {
                batch: self.batch(&run_id, started_at, RunOutcome::Rejected(REJECT_VCS_DIRTY.to_string()), None, vcs),
                states,
                recorded: None,
                pruned: None,
            });
        }

        states.push(ApplyState::LeaseAcquiring);
        let lease = match self.lease.acquire(&self.vault, self.options.lease) {
            Ok(lease) => lease,
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "apply rejected: write lease unavailable");
                return Err(err);
            }
        };

        let mut ctx = RunContext {
            recorder: RunRecorder::new(self.ledger.artifacts(&run_id)?),
            run_id,
            started_at,
            states,
            lease: Some(lease),
            quiescence: None,
            fallback: FallbackMode::None,
            offline_lock: None,
            vcs,
        };

        ctx.enter(ApplyState::Quiescing);
        let observation = wait_for_quiet(self.probe.as_ref(), &self.options.quiescence).await;
        let settled = observation.settled;
        ctx.quiescence = Some(observation);
        if let Some(lease) = ctx.lease.as_mut() {
            lease.renew()?;
        }

        let mut dropped = BTreeSet::new();
        if !settled {
            let append_only = match self.options.on_starvation {
                StarvationPolicy::Abort => return self.abort(ctx, ABORT_STARVATION).await,
                StarvationPolicy::AppendOnly => true,
                StarvationPolicy::ClassAOnly => false,
            };
            ctx.fallback = if append_only {
                FallbackMode::AppendOnly
            } else {
                FallbackMode::ClassAOnly
            };
            let roots: BTreeSet<String> = ordered
                .actions
                .iter()
                .filter(|p| p.class != RiskClass::ReadOnly && !plan::survives_starvation(p, append_only))
                .map(|p| p.action.id.clone())
                .collect();
            dropped = ordered.dependents_of(&roots);
            dropped.extend(roots);
            for planned in ordered.actions.iter().filter(|p| dropped.contains(&p.action.id)) {
                ctx.recorder
                    .skip(&planned.action.id, &planned.action.target_path, SkipReason::StarvationFallback);
            }
            let writable = ordered
                .actions
                .iter()
                .any(|p| p.class != RiskClass::ReadOnly && !dropped.contains(&p.action.id));
            warn!(run_id = %ctx.run_id, fallback = ?ctx.fallback, dropped = dropped.len(), "vault did not settle");
            if !writable {
                return self.abort(ctx, ABORT_STARVATION).await;
            }
        }

        let mut approved: Vec<&PlannedAction> = Vec::new();
        let mut overrides: Vec<&PlannedAction> = Vec::new();
        for planned in ordered.actions.iter().filter(|p| !dropped.contains(&p.action.id)) {
            let id = &planned.action.id;
            let path = &planned.action.target_path;
            match planned.class {
                RiskClass::ReadOnly => ctx.recorder.skip(id, path, SkipReason::ReadOnly),
                RiskClass::B2 if !self.options.allow_b2_override => {
                    ctx.recorder.skip(id, path, SkipReason::RequiresOverride)
                }
                RiskClass::B2 => overrides.push(planned),
                _ => approved.push(planned),
            }
        }

        ctx.enter(ApplyState::Confirming);
        let summary = BatchSummary {
            run_id: ctx.run_id.clone(),
            vault: self.vault.clone(),
            fallback: ctx.fallback,
            lines: approved
                .iter()
                .chain(overrides.iter())
                .map(|p| SummaryLine {
                    action_id: p.action.id.clone(),
                    target_path: p.action.target_path.clone(),
                    risk_class: p.class,
                    action_type: p.action.type_name(),
                })
                .collect(),
            withheld: ctx.recorder.skipped.len(),
        };
        if self.options.interactive && !summary.lines.is_empty() && !self.confirmation.confirm(&summary) {
            return self.abort(ctx, ABORT_USER_DECLINED).await;
        }
        for planned in overrides {
            let reason = classifier::structural_problem(&planned.action)
                .unwrap_or_else(|| format!("{} is not reversible by rollback", planned.action.type_name()));
            if self.confirmation.confirm_override(&planned.action, &reason) {
                warn!(action_id = %planned.action.id, %reason, "B2 override confirmed");
                approved.push(planned);
            } else {
                ctx.recorder
                    .skip(&planned.action.id, &planned.action.target_path, SkipReason::OverrideDeclined);
            }
        }

        if !approved.is_empty() {
            self.take_offline_lock(&mut ctx);
            if self.options.auto_checkpoint && ctx.vcs.repo {
                ctx.vcs.pre_checkpoint = self
                    .checkpoint(&format!("vaultward: checkpoint before {}", ctx.run_id))
                    .await;
            }
        }

        ctx.enter(ApplyState::Applying);
        let approved_ids: HashSet<&str> = approved.iter().map(|p| p.action.id.as_str()).collect();
        self.apply_ordered(&ordered, &approved_ids, &mut ctx.recorder);

        self.finalize(ctx).await
    }

    fn apply_ordered(&self, ordered: &OrderedPlan, approved: &HashSet<&str>, recorder: &mut RunRecorder) {
        // Actions whose effect did not happen; their dependents cannot run.
        let mut blocked: BTreeSet<String> = recorder
            .skipped
            .iter()
            .filter(|s| {
                matches!(
                    s.reason,
                    SkipReason::RequiresOverride | SkipReason::OverrideDeclined | SkipReason::StarvationFallback
                )
            })
            .map(|s| s.action_id.clone())
            .collect();
        let mut processed: HashSet<String> = HashSet::new();

        for planned in &ordered.actions {
            let id = planned.action.id.as_str();
            if !approved.contains(id) || processed.contains(id) {
                continue;
            }

            if let Some(txn) = planned.transaction_id.as_deref() {
                let members = ordered.transaction_members(txn);
                let member_ids: BTreeSet<String> = members.iter().map(|m| m.action.id.clone()).collect();
                // Outside dependencies were all ordered ahead of the transaction.
                let unmet = members
                    .iter()
                    .flat_map(|m| m.action.dependencies.iter())
                    .find(|dep| !member_ids.contains(*dep) && blocked.contains(*dep))
                    .cloned();
                let committed = match unmet {
                    Some(dep) => {
                        for member in &members {
                            recorder.conflict(
                                &member.action.id,
                                &member.action.target_path,
                                ConflictKind::DependencyFailed,
                                &format!("transaction {txn} depends on {dep}, which was not applied"),
                                "",
                            );
                        }
                        false
                    }
                    None => crate::transaction::apply(&self.vault, txn, &members, self.digests.as_ref(), recorder),
                };
                if !committed {
                    blocked.extend(member_ids.iter().cloned());
                }
                processed.extend(member_ids);
                continue;
            }

            processed.insert(id.to_string());
            if let Some(dep) = planned.action.dependencies.iter().find(|d| blocked.contains(*d)) {
                recorder.conflict(
                    id,
                    &planned.action.target_path,
                    ConflictKind::DependencyFailed,
                    &format!("depends on {dep}, which was not applied"),
                    "",
                );
                blocked.insert(id.to_string());
                continue;
            }

            let effective = match planned.action.payload {
                // A rename forced through as B2 still needs the staged path.
                ActionPayload::RenameNote { .. } => crate::transaction::apply(
                    &self.vault,
                    &format!("txn_{id}"),
                    &[planned],
                    self.digests.as_ref(),
                    recorder,
                ),
                _ => self.apply_single(planned, recorder),
            };
            if !effective {
                blocked.insert(id.to_string());
            }
        }
    }

    /// Resolve then write one single-file action. Returns false when the
    /// action's effect is not in the vault afterwards.
    fn apply_single(&self, planned: &PlannedAction, recorder: &mut RunRecorder) -> bool {
        let action = &planned.action;
        let rel = &action.target_path;
        let abs = match resolve_in_vault(&self.vault, rel) {
            Ok(abs) => abs,
            Err(err) => {
                recorder.conflict(&action.id, rel, ConflictKind::MalformedStructure, &err.to_string(), "");
                return false;
            }
        };
        let current = match read_current(&abs) {
            Ok(current) => current,
            Err(err) => {
                recorder.conflict(&action.id, rel, ConflictKind::IoFailure, &format!("I/O error: {err}"), "");
                return false;
            }
        };

        let new_content = match resolver::verify_and_prepare(action, current.as_deref()) {
            Resolution::Proceed { new_content } => new_content,
            Resolution::AlreadyApplied => {
                info!(action_id = %action.id, "already applied; skipping");
                recorder.skip(&action.id, rel, SkipReason::AlreadyApplied);
                return true;
            }
            Resolution::NoChange => {
                recorder.skip(&action.id, rel, SkipReason::NoChange);
                return true;
            }
            Resolution::Conflict(conflict) => {
                recorder.conflict(&action.id, rel, conflict.kind, &conflict.detail, &conflict.diff);
                return false;
            }
        };

        let before = current.as_deref().map(Digest::of_str);
        match self.digests.digest_of(&abs) {
            Ok(now) if now == before => {}
            Ok(_) => {
                let diff = resolver::conflict_diff(rel, current.as_deref().unwrap_or(""), &new_content);
                recorder.conflict(
                    &action.id,
                    rel,
                    ConflictKind::EditedSincePlan,
                    &format!("{} changed between verification and write", rel.display()),
                    &diff,
                );
                return false;
            }
            Err(err) => {
                recorder.conflict(&action.id, rel, ConflictKind::IoFailure, &format!("I/O error: {err}"), "");
                return false;
            }
        }

        let backup = match current.as_deref().map(|c| recorder.backup(&action.id, rel, c)).transpose() {
            Ok(backup) => backup,
            Err(err) => {
                recorder.conflict(&action.id, rel, ConflictKind::IoFailure, &format!("backup failed: {err}"), "");
                return false;
            }
        };
        let patch = recorder.patch(&action.id, rel, current.as_deref().unwrap_or(""), &new_content);

        let after = match writer::write_atomic(&abs, new_content.as_bytes()) {
            Ok(after) => after,
            Err(err) => {
                recorder.conflict(&action.id, rel, ConflictKind::IoFailure, &format!("I/O error: {err}"), "");
                return false;
            }
        };
        info!(action_id = %action.id, path = %rel.display(), after = after.short(), "action applied");
        recorder.change(FileChangeRecord {
            action_id: action.id.clone(),
            target_path: rel.clone(),
            base_digest: action.expected_base_digest.clone(),
            before_digest: before,
            after_digest: Some(after),
            artifact_paths: ArtifactPaths { backup, patch },
            risk_class: planned.class,
            transaction_id: None,
            renamed_from: None,
            dependencies: action.dependencies.iter().cloned().collect(),
        });
        true
    }

    fn take_offline_lock(&self, ctx: &mut RunContext) {
        let Some(lock) = &self.options.offline_lock else {
            return;
        };
        if ctx.fallback == FallbackMode::None {
            return;
        }
        let path = match resolve_in_vault(&self.vault, &lock.marker) {
            Ok(path) => path,
            Err(err) => {
                warn!(error = %err, "offline lock marker path rejected");
                return;
            }
        };
        let body = format!("vaultward run {} in progress\n", ctx.run_id);
        match writer::write_atomic(&path, body.as_bytes()) {
            Ok(_) => {
                info!(marker = %path.display(), "offline lock placed");
                ctx.offline_lock = Some(path);
            }
            Err(err) => warn!(error = %err, "failed to place offline lock"),
        }
    }

    async fn checkpoint(&self, message: &str) -> Option<String> {
        match self.vcs.checkpoint(message).await {
            Ok(commit) => commit,
            Err(err) => {
                warn!(error = %err, "version-control checkpoint failed");
                None
            }
        }
    }

    fn batch(
        &self,
        run_id: &str,
        started_at: DateTime<Utc>,
        outcome: RunOutcome,
        ctx: Option<&RunContext>,
        vcs: VcsInfo,
    ) -> RunBatch {
        RunBatch {
            schema_version: SCHEMA_VERSION,
            run_id: run_id.to_string(),
            kind: RunKind::Apply,
            vault: self.vault.clone(),
            started_at,
            ended_at: Utc::now(),
            lease: ctx.and_then(|c| c.lease.as_ref()).map(|l| l.info().clone()),
            quiescence: ctx.and_then(|c| c.quiescence.clone()),
            fallback: ctx.map_or(FallbackMode::None, |c| c.fallback),
            offline_lock: ctx.is_some_and(|c| c.offline_lock.is_some()),
            outcome,
            changes: ctx.map(|c| c.recorder.changes.clone()).unwrap_or_default(),
            conflicts: ctx.map(|c| c.recorder.conflicts.clone()).unwrap_or_default(),
            skipped: ctx.map(|c| c.recorder.skipped.clone()).unwrap_or_default(),
            vcs,
        }
    }

    async fn abort(&self, mut ctx: RunContext, reason: &str) -> Result<ApplyReport> {
        warn!(run_id = %ctx.run_id, reason, "apply aborted");
        ctx.enter(ApplyState::Aborted(reason.to_string()));
        self.close(ctx, RunOutcome::Aborted(reason.to_string()), false).await
    }

    async fn finalize(&self, mut ctx: RunContext) -> Result<ApplyReport> {
        ctx.enter(ApplyState::Finalizing);
        let outcome = if ctx.recorder.conflicts.is_empty() {
            RunOutcome::Completed
        } else {
            RunOutcome::CompletedWithConflicts
        };
        self.close(ctx, outcome, true).await
    }

    /// Record the run, release the lease and report. The lease is released
    /// even when recording fails.
    async fn close(&self, mut ctx: RunContext, outcome: RunOutcome, completed: bool) -> Result<ApplyReport> {
        if let Some(marker) = ctx.offline_lock.as_ref() {
            let cleanup = self.options.offline_lock.as_ref().is_some_and(|l| l.cleanup);
            if cleanup {
                if let Err(err) = writer::remove(marker) {
                    warn!(error = %err, marker = %marker.display(), "failed to remove offline lock");
                }
            }
        }
        if completed && self.options.auto_checkpoint && ctx.vcs.repo && !ctx.recorder.changes.is_empty() {
            ctx.vcs.post_checkpoint = self.checkpoint(&format!("vaultward: apply {}", ctx.run_id)).await;
        }

        let batch = self.batch(&ctx.run_id, ctx.started_at, outcome, Some(&ctx), ctx.vcs.clone());
        let recorded = self.ledger.record(&batch).await;

        if let Some(lease) = ctx.lease.take() {
            if let Err(err) = lease.release() {
                warn!(error = %err, "failed to release write lease");
            }
        }
        let recorded = recorded?;
        if completed {
            ctx.enter(ApplyState::Released);
        }

        let pruned = match self.options.retention {
            Some(policy) => match prune(&self.ledger, policy, Utc::now()).await {
                Ok(report) => Some(report),
                Err(err) => {
                    warn!(error = %err, "run ledger pruning failed");
                    None
                }
            },
            None => None,
        };

        info!(
            run_id = %batch.run_id,
            changes = batch.changes.len(),
            conflicts = batch.conflicts.len(),
            skipped = batch.skipped.len(),
            "apply finished"
        );
        Ok(ApplyReport {
            batch,
            states: ctx.states,
            recorded: Some(recorded),
            pruned,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::AlwaysAccept;
    use crate::quiescence::testing::{ChangingProbe, ScriptedProbe};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use vaultward_core::{ActivitySample, Placement, ProposedAction, VaultwardError};

    fn options() -> RunOptions {
        RunOptions {
            lease: LeaseOptions::default(),
            quiescence: QuiescenceSettings {
                max_wait: Duration::from_millis(200),
                interval: Duration::from_millis(5),
                stable_samples: 2,
            },
            on_starvation: StarvationPolicy::ClassAOnly,
            offline_lock: None,
            interactive: true,
            allow_b2_override: false,
            git_policy: GitPolicy::RequireClean,
            auto_checkpoint: false,
            retention: None,
        }
    }

    fn starving(policy: StarvationPolicy) -> RunOptions {
        RunOptions {
            quiescence: QuiescenceSettings {
                max_wait: Duration::from_millis(30),
                interval: Duration::from_millis(5),
                stable_samples: 2,
            },
            on_starvation: policy,
            ..options()
        }
    }

    fn engine(vault: &TempDir, options: RunOptions) -> Orchestrator {
        Orchestrator::new(vault.path(), vault.path().join(".vaultward"), options)
            .with_probe(ScriptedProbe::new(vec![ActivitySample::default()]))
            .with_confirmation(AlwaysAccept)
    }

    fn write(vault: &TempDir, rel: &str, content: &str) -> Digest {
        let path = vault.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        Digest::of_str(content)
    }

    fn read(vault: &TempDir, rel: &str) -> String {
        fs::read_to_string(vault.path().join(rel)).unwrap()
    }

    fn append(id: &str, target: &str, base: Option<Digest>) -> ProposedAction {
        ProposedAction {
            id: id.to_string(),
            target_path: PathBuf::from(target),
            risk_class: RiskClass::A,
            payload: ActionPayload::AppendAnchoredBlock {
                anchor: format!("related_{id}"),
                block: format!("## Related\n<!-- related_{id} -->\n- [[y]]\n"),
                placement: Placement::End,
            },
            dependencies: BTreeSet::new(),
            expected_base_digest: base,
        }
    }

    fn merge(id: &str, target: &str, base: Option<Digest>) -> ProposedAction {
        ProposedAction {
            risk_class: RiskClass::A,
            payload: ActionPayload::MergeFields {
                fields: BTreeMap::from([("tags".to_string(), vec!["review".to_string()])]),
            },
            ..append(id, target, base)
        }
    }

    fn rename(id: &str, from: &str, to: &str, base: Digest, referrers: &[(&str, Digest)]) -> ProposedAction {
        ProposedAction {
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
            dependencies: BTreeSet::new(),
            expected_base_digest: Some(base),
        }
    }

    fn replace(id: &str, target: &str, base: Digest, content: &str) -> ProposedAction {
        ProposedAction {
            risk_class: RiskClass::B2,
            payload: ActionPayload::ReplaceContent {
                content: content.to_string(),
            },
            ..append(id, target, Some(base))
        }
    }

    fn skip_reason(report: &ApplyReport, id: &str) -> Option<SkipReason> {
        report.batch.skipped.iter().find(|s| s.action_id == id).map(|s| s.reason)
    }

    fn conflict_kind(report: &ApplyReport, id: &str) -> Option<ConflictKind> {
        report.batch.conflicts.iter().find(|c| c.action_id == id).map(|c| c.kind)
    }

    #[tokio::test]
    async fn applied_change_records_real_digests() {
        let vault = TempDir::new().unwrap();
        let h0 = write(&vault, "notes/x.md", "# X\n");
        let orchestrator = engine(&vault, options());

        let report = orchestrator
            .apply(&ActionPlan::new(vec![append("a1", "notes/x.md", Some(h0.clone()))]))
            .await
            .unwrap();

        assert_eq!(report.batch.outcome, RunOutcome::Completed);
        assert_eq!(report.final_state(), Some(&ApplyState::Released));
        let change = &report.batch.changes[0];
        assert_eq!(change.before_digest, Some(h0.clone()));
        assert_eq!(change.base_digest, Some(h0));
        let on_disk = Digest::of_file(&vault.path().join("notes/x.md")).unwrap();
        assert_eq!(change.after_digest, on_disk);
        assert!(change.artifact_paths.backup.as_ref().unwrap().exists());
        assert!(report.recorded.as_ref().unwrap().exists());
        assert!(!WriteLease::new(vault.path().join(".vaultward")).marker_path().exists());
    }

    #[tokio::test]
    async fn replanning_against_applied_file_skips_instead_of_duplicating() {
        let vault = TempDir::new().unwrap();
        let h0 = write(&vault, "notes/x.md", "# X\n");
        let orchestrator = engine(&vault, options());
        orchestrator
            .apply(&ActionPlan::new(vec![append("a1", "notes/x.md", Some(h0.clone()))]))
            .await
            .unwrap();
        let h1 = Digest::of_str(&read(&vault, "notes/x.md"));

        for base in [h0, h1] {
            let report = orchestrator
                .apply(&ActionPlan::new(vec![append("a1", "notes/x.md", Some(base))]))
                .await
                .unwrap();
            assert_eq!(skip_reason(&report, "a1"), Some(SkipReason::AlreadyApplied));
            assert!(report.batch.changes.is_empty());
            assert!(report.batch.conflicts.is_empty());
        }
        assert_eq!(read(&vault, "notes/x.md").matches("<!-- related_a1 -->").count(), 1);
    }

    #[tokio::test]
    async fn diverged_base_produces_conflict_and_no_write() {
        let vault = TempDir::new().unwrap();
        let h0 = write(&vault, "notes/x.md", "# X\n");
        write(&vault, "notes/x.md", "# X\nedited by hand\n");
        let orchestrator = engine(&vault, options());

        let report = orchestrator
            .apply(&ActionPlan::new(vec![append("a1", "notes/x.md", Some(h0))]))
            .await
            .unwrap();

        assert_eq!(report.batch.outcome, RunOutcome::CompletedWithConflicts);
        assert_eq!(conflict_kind(&report, "a1"), Some(ConflictKind::EditedSincePlan));
        assert_eq!(read(&vault, "notes/x.md"), "# X\nedited by hand\n");
        let conflict = &report.batch.conflicts[0];
        assert!(conflict.diff_artifact.as_ref().unwrap().exists());
        assert!(conflict.note_artifact.as_ref().unwrap().exists());
    }

    /// Reports a digest nobody planned against, as if the file changed
    /// between verification and write.
    struct MovingTarget;

    impl DigestSource for MovingTarget {
        fn digest_of(&self, _path: &Path) -> std::io::Result<Option<Digest>> {
            Ok(Some(Digest::of_str("written by a sync client")))
        }
    }

    #[tokio::test]
    async fn change_between_verify_and_write_is_not_overwritten() {
        let vault = TempDir::new().unwrap();
        let h0 = write(&vault, "x.md", "# X\n");
        let orchestrator = engine(&vault, options()).with_digest_source(MovingTarget);

        let report = orchestrator
            .apply(&ActionPlan::new(vec![append("a1", "x.md", Some(h0))]))
            .await
            .unwrap();

        assert_eq!(conflict_kind(&report, "a1"), Some(ConflictKind::EditedSincePlan));
        assert!(report.batch.changes.is_empty());
        assert_eq!(read(&vault, "x.md"), "# X\n");
    }

    #[tokio::test]
    async fn rename_transaction_rewrites_planned_referrers() {
        let vault = TempDir::new().unwrap();
        let a = write(&vault, "a.md", "# A\n");
        let c = write(&vault, "c.md", "see [[a]]\n");
        let orchestrator = engine(&vault, options());

        let report = orchestrator
            .apply(&ActionPlan::new(vec![rename("r1", "a.md", "b.md", a, &[("c.md", c)])]))
            .await
            .unwrap();

        assert_eq!(report.batch.outcome, RunOutcome::Completed);
        assert!(!vault.path().join("a.md").exists());
        assert_eq!(read(&vault, "b.md"), "# A\n");
        assert!(read(&vault, "c.md").contains("[[b]]"));
        assert!(
            report
                .batch
                .changes
                .iter()
                .all(|c| c.transaction_id.as_deref() == Some("txn_r1"))
        );
    }

    #[tokio::test]
    async fn conflicting_referrer_leaves_note_unrenamed() {
        let vault = TempDir::new().unwrap();
        let a = write(&vault, "a.md", "# A\n");
        let planned_c = Digest::of_str("see [[a]]\n");
        write(&vault, "c.md", "see [[a]] and more\n");
        let orchestrator = engine(&vault, options());

        let report = orchestrator
            .apply(&ActionPlan::new(vec![rename("r1", "a.md", "b.md", a, &[("c.md", planned_c)])]))
            .await
            .unwrap();

        assert_eq!(conflict_kind(&report, "r1"), Some(ConflictKind::EditedSincePlan));
        assert!(report.batch.changes.is_empty());
        assert_eq!(read(&vault, "a.md"), "# A\n");
        assert!(!vault.path().join("b.md").exists());
        assert_eq!(read(&vault, "c.md"), "see [[a]] and more\n");
    }

    #[tokio::test]
    async fn transaction_runs_after_outside_dependency_of_later_member() {
        let vault = TempDir::new().unwrap();
        let a = write(&vault, "a.md", "# A\n");
        let c = write(&vault, "c.md", "# C\n");
        let x = write(&vault, "x.md", "# X\n");
        let mut r2 = rename("r2", "c.md", "d.md", c, &[]);
        r2.dependencies = BTreeSet::from(["r1".to_string(), "a1".to_string()]);
        let plan = ActionPlan::new(vec![rename("r1", "a.md", "b.md", a, &[]), append("a1", "x.md", Some(x)), r2]);

        let report = engine(&vault, options()).apply(&plan).await.unwrap();

        assert_eq!(report.batch.outcome, RunOutcome::Completed, "{:?}", report.batch.conflicts);
        assert_eq!(read(&vault, "b.md"), "# A\n");
        assert_eq!(read(&vault, "d.md"), "# C\n");
        assert!(read(&vault, "x.md").contains("<!-- related_a1 -->"));
        let order: Vec<&str> = report.batch.changes.iter().map(|c| c.action_id.as_str()).collect();
        assert_eq!(order.first(), Some(&"a1"));
    }

    #[tokio::test]
    async fn live_lease_rejects_second_apply_immediately() {
        let vault = TempDir::new().unwrap();
        let h0 = write(&vault, "x.md", "# X\n");
        let held = WriteLease::new(vault.path().join(".vaultward"))
            .acquire(vault.path(), LeaseOptions::default())
            .unwrap();
        let orchestrator = engine(&vault, options());

        let err = orchestrator
            .apply(&ActionPlan::new(vec![append("a1", "x.md", Some(h0))]))
            .await
            .unwrap_err();

        assert!(matches!(err, VaultwardError::LeaseHeld { stale: false, .. }));
        assert_eq!(read(&vault, "x.md"), "# X\n");
        held.release().unwrap();
    }

    #[tokio::test]
    async fn starvation_abort_policy_writes_nothing() {
        let vault = TempDir::new().unwrap();
        let h0 = write(&vault, "x.md", "# X\n");
        let orchestrator = engine(&vault, starving(StarvationPolicy::Abort)).with_probe(ChangingProbe::default());

        let report = orchestrator
            .apply(&ActionPlan::new(vec![append("a1", "x.md", Some(h0))]))
            .await
            .unwrap();

        assert_eq!(report.batch.outcome, RunOutcome::Aborted(ABORT_STARVATION.to_string()));
        assert!(!report.batch.quiescence.as_ref().unwrap().settled);
        assert_eq!(read(&vault, "x.md"), "# X\n");
        assert!(report.recorded.is_some());
        assert!(!WriteLease::new(vault.path().join(".vaultward")).marker_path().exists());
    }

    #[tokio::test]
    async fn starvation_keeps_class_a_and_drops_the_rest() {
        let vault = TempDir::new().unwrap();
        let x = write(&vault, "x.md", "# X\n");
        let a = write(&vault, "a.md", "# A\n");
        let mut dependent = append("a2", "x2.md", None);
        dependent.dependencies.insert("r1".to_string());
        let orchestrator = engine(&vault, starving(StarvationPolicy::ClassAOnly)).with_probe(ChangingProbe::default());

        let report = orchestrator
            .apply(&ActionPlan::new(vec![
                append("a1", "x.md", Some(x)),
                rename("r1", "a.md", "b.md", a, &[]),
                dependent,
            ]))
            .await
            .unwrap();

        assert_eq!(report.batch.fallback, FallbackMode::ClassAOnly);
        assert_eq!(report.batch.outcome, RunOutcome::Completed);
        assert_eq!(skip_reason(&report, "r1"), Some(SkipReason::StarvationFallback));
        assert_eq!(skip_reason(&report, "a2"), Some(SkipReason::StarvationFallback));
        assert!(read(&vault, "x.md").contains("<!-- related_a1 -->"));
        assert!(vault.path().join("a.md").exists());
    }

    #[tokio::test]
    async fn append_only_fallback_drops_field_merges_and_places_offline_lock() {
        let vault = TempDir::new().unwrap();
        let x = write(&vault, "x.md", "# X\n");
        let y = write(&vault, "y.md", "---\ntitle: Y\n---\nbody\n");
        let mut options = starving(StarvationPolicy::AppendOnly);
        options.offline_lock = Some(OfflineLock {
            marker: PathBuf::from(".nosync"),
            cleanup: false,
        });
        let orchestrator = engine(&vault, options).with_probe(ChangingProbe::default());

        let report = orchestrator
            .apply(&ActionPlan::new(vec![append("a1", "x.md", Some(x)), merge("m1", "y.md", Some(y))]))
            .await
            .unwrap();

        assert_eq!(report.batch.fallback, FallbackMode::AppendOnly);
        assert_eq!(skip_reason(&report, "m1"), Some(SkipReason::StarvationFallback));
        assert_eq!(report.batch.changes.len(), 1);
        assert!(report.batch.offline_lock);
        assert!(vault.path().join(".nosync").exists());
    }

    #[tokio::test]
    async fn starvation_with_nothing_left_aborts() {
        let vault = TempDir::new().unwrap();
        let a = write(&vault, "a.md", "# A\n");
        let orchestrator = engine(&vault, starving(StarvationPolicy::ClassAOnly)).with_probe(ChangingProbe::default());

        let report = orchestrator
            .apply(&ActionPlan::new(vec![rename("r1", "a.md", "b.md", a, &[])]))
            .await
            .unwrap();

        assert_eq!(report.batch.outcome, RunOutcome::Aborted(ABORT_STARVATION.to_string()));
        assert!(vault.path().join("a.md").exists());
    }

    #[tokio::test]
    async fn declined_confirmation_leaves_vault_untouched() {
        let vault = TempDir::new().unwrap();
        let h0 = write(&vault, "x.md", "# X\n");
        let orchestrator = engine(&vault, options()).with_confirmation(AlwaysReject);

        let report = orchestrator
            .apply(&ActionPlan::new(vec![append("a1", "x.md", Some(h0))]))
            .await
            .unwrap();

        assert_eq!(report.batch.outcome, RunOutcome::Aborted(ABORT_USER_DECLINED.to_string()));
        assert_eq!(report.final_state(), Some(&ApplyState::Aborted(ABORT_USER_DECLINED.to_string())));
        assert!(report.batch.changes.is_empty());
        assert_eq!(read(&vault, "x.md"), "# X\n");
        assert!(!WriteLease::new(vault.path().join(".vaultward")).marker_path().exists());
    }

    #[tokio::test]
    async fn cyclic_plan_is_rejected_before_the_lease() {
        let vault = TempDir::new().unwrap();
        let mut a = append("a", "x.md", None);
        a.dependencies.insert("b".to_string());
        let mut b = append("b", "y.md", None);
        b.dependencies.insert("a".to_string());
        let orchestrator = engine(&vault, options());

        let err = orchestrator.apply(&ActionPlan::new(vec![a, b])).await.unwrap_err();

        assert!(matches!(err, VaultwardError::InvalidPlan(_)));
        assert!(orchestrator.ledger().list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn future_plan_schema_is_rejected() {
        let vault = TempDir::new().unwrap();
        let mut plan = ActionPlan::new(vec![append("a1", "x.md", None)]);
        plan.schema_version = SCHEMA_VERSION + 1;

        let err = engine(&vault, options()).apply(&plan).await.unwrap_err();
        assert!(matches!(err, VaultwardError::SchemaMismatch { .. }));
    }

    #[tokio::test]
    async fn b2_needs_override_and_confirmation() {
        let vault = TempDir::new().unwrap();
        let h0 = write(&vault, "x.md", "old body\n");
        let plan = ActionPlan::new(vec![replace("w1", "x.md", h0, "new body\n")]);

        let report = engine(&vault, options()).apply(&plan).await.unwrap();
        assert_eq!(skip_reason(&report, "w1"), Some(SkipReason::RequiresOverride));
        assert_eq!(read(&vault, "x.md"), "old body\n");

        let mut allowed = options();
        allowed.allow_b2_override = true;
        allowed.interactive = false;
        let report = engine(&vault, allowed.clone())
            .with_confirmation(AlwaysReject)
            .apply(&plan)
            .await
            .unwrap();
        assert_eq!(skip_reason(&report, "w1"), Some(SkipReason::OverrideDeclined));

        let report = engine(&vault, allowed).apply(&plan).await.unwrap();
        assert_eq!(report.batch.changes[0].risk_class, RiskClass::B2);
        assert_eq!(read(&vault, "x.md"), "new body\n");
    }

    #[tokio::test]
    async fn dependents_of_a_conflict_are_not_applied() {
        let vault = TempDir::new().unwrap();
        write(&vault, "x.md", "# X\nchanged\n");
        let y = write(&vault, "y.md", "# Y\n");
        let mut second = append("a2", "y.md", Some(y));
        second.dependencies.insert("a1".to_string());
        let plan = ActionPlan::new(vec![append("a1", "x.md", Some(Digest::of_str("# X\n"))), second]);

        let report = engine(&vault, options()).apply(&plan).await.unwrap();

        assert_eq!(conflict_kind(&report, "a1"), Some(ConflictKind::EditedSincePlan));
        assert_eq!(conflict_kind(&report, "a2"), Some(ConflictKind::DependencyFailed));
        assert_eq!(read(&vault, "y.md"), "# Y\n");
    }

    #[tokio::test]
    async fn preview_actions_are_skipped_as_read_only() {
        let vault = TempDir::new().unwrap();
        let preview = ProposedAction {
            risk_class: RiskClass::ReadOnly,
            payload: ActionPayload::Preview {
                summary: "would link x to y".to_string(),
            },
            ..append("p1", "x.md", None)
        };

        let report = engine(&vault, options())
            .apply(&ActionPlan::new(vec![preview]))
            .await
            .unwrap();

        assert_eq!(skip_reason(&report, "p1"), Some(SkipReason::ReadOnly));
        assert_eq!(report.batch.outcome, RunOutcome::Completed);
    }

    #[tokio::test]
    async fn declared_read_only_action_never_writes() {
        let vault = TempDir::new().unwrap();
        let h0 = write(&vault, "x.md", "# X\n");
        let declared = ProposedAction {
            risk_class: RiskClass::ReadOnly,
            ..append("r", "x.md", Some(h0))
        };

        let report = engine(&vault, options())
            .apply(&ActionPlan::new(vec![declared]))
            .await
            .unwrap();

        assert_eq!(skip_reason(&report, "r"), Some(SkipReason::ReadOnly));
        assert!(report.batch.changes.is_empty());
        assert_eq!(read(&vault, "x.md"), "# X\n");
    }

    struct DirtyRepo;

    #[async_trait]
    impl VersionControl for DirtyRepo {
        async fn status(&self) -> Result<VcsStatus> {
            Ok(VcsStatus::Dirty)
        }

        async fn checkpoint(&self, _message: &str) -> Result<Option<String>> {
            Ok(None)
        }

        async fn revert(&self, _commit_id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn dirty_repository_is_rejected_under_require_clean() {
        let vault = TempDir::new().unwrap();
        let h0 = write(&vault, "x.md", "# X\n");
        let plan = ActionPlan::new(vec![append("a1", "x.md", Some(h0))]);

        let report = engine(&vault, options()).with_vcs(DirtyRepo).apply(&plan).await.unwrap();
        assert_eq!(report.batch.outcome, RunOutcome::Rejected(REJECT_VCS_DIRTY.to_string()));
        assert!(report.recorded.is_none());
        assert_eq!(read(&vault, "x.md"), "# X\n");

        let mut lenient = options();
        lenient.git_policy = GitPolicy::AllowDirty;
        let report = engine(&vault, lenient).with_vcs(DirtyRepo).apply(&plan).await.unwrap();
        assert_eq!(report.batch.outcome, RunOutcome::Completed);
        assert_eq!(report.batch.vcs.dirty, Some(true));
    }
}
