//! Records produced by an apply or rollback run. Immutable once written.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Digest, RiskClass};

/// Snapshot of the write lease under which a run executed. Also the on-disk
/// layout of the durable lease marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub schema_version: u32,
    pub holder_id: String,
    pub pid: u32,
    pub host: String,
    pub vault: PathBuf,
    pub acquired_at: DateTime<Utc>,
    pub ttl_sec: u64,
    pub expires_at: DateTime<Utc>,
}

impl LeaseInfo {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// One activity sample taken while waiting for the vault to go quiet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySample {
    /// Newest modification time (ms since epoch) across the busy paths.
    pub latest_mtime_ms: Option<u128>,
    /// Sibling lock files present at sample time.
    pub lock_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuiescenceObservation {
    pub waited_ms: u64,
    pub settled: bool,
    pub sampled_signals: Vec<ActivitySample>,
}

impl QuiescenceObservation {
    pub fn waited_seconds(&self) -> f64 {
        self.waited_ms as f64 / 1000.0
    }
}

/// Degraded mode selected after quiescence starvation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    #[default]
    None,
    ClassAOnly,
    AppendOnly,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    /// Pre-write content, used to restore on rollback.
    pub backup: Option<PathBuf>,
    /// Unified diff from pre-write to post-write content.
    pub patch: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeRecord {
    pub action_id: String,
    pub target_path: PathBuf,
    /// Digest the plan expected (`None`: file expected absent).
    pub base_digest: Option<Digest>,
    /// Digest observed immediately before the write; equals `base_digest`.
    pub before_digest: Option<Digest>,
    /// Digest of the file after the write (`None` when the write removed it).
    pub after_digest: Option<Digest>,
    pub artifact_paths: ArtifactPaths,
    pub risk_class: RiskClass,
    #[serde(default)]
    pub transaction_id: Option<String>,
    /// Set when this record moved a note: the path it came from.
    #[serde(default)]
    pub renamed_from: Option<PathBuf>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// The file changed since the plan was made.
    EditedSincePlan,
    /// The anchor or heading used to relocate a sub-region matches more than once.
    AmbiguousAnchor,
    /// The heading used to relocate a sub-region is gone.
    MissingAnchor,
    /// The document structure (e.g. frontmatter) cannot be edited safely.
    MalformedStructure,
    TargetMissing,
    TargetExists,
    /// A rename would leave links in a file the plan did not cover.
    UnplannedReference,
    DependencyFailed,
    /// Another member of the same transaction failed; this one was unwound.
    TransactionAborted,
    IoFailure,
    RollbackDiverged,
    BackupMissing,
}

impl ConflictKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::EditedSincePlan => "edited since plan",
            Self::AmbiguousAnchor => "ambiguous anchor",
            Self::MissingAnchor => "missing anchor",
            Self::MalformedStructure => "malformed structure",
            Self::TargetMissing => "target missing",
            Self::TargetExists => "target exists",
            Self::UnplannedReference => "unplanned reference",
            Self::DependencyFailed => "dependency failed",
            Self::TransactionAborted => "transaction aborted",
            Self::IoFailure => "I/O failure",
            Self::RollbackDiverged => "changed since apply",
            Self::BackupMissing => "backup missing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub action_id: String,
    pub target_path: PathBuf,
    pub kind: ConflictKind,
    pub diff_artifact: Option<PathBuf>,
    pub note_artifact: Option<PathBuf>,
    pub human_note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ReadOnly,
    AlreadyApplied,
    NoChange,
    RequiresOverride,
    OverrideDeclined,
    StarvationFallback,
    NotRollbackEligible,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedAction {
    pub action_id: String,
    pub target_path: PathBuf,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunKind {
    Apply,
    Rollback { parent_run_id: String },
}

/// Terminal status of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    CompletedWithConflicts,
    Rejected(String),
    Aborted(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsInfo {
    pub repo: bool,
    pub dirty: Option<bool>,
    pub pre_checkpoint: Option<String>,
    pub post_checkpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunBatch {
    pub schema_version: u32,
    pub run_id: String,
    pub kind: RunKind,
    pub vault: PathBuf,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub lease: Option<LeaseInfo>,
    #[serde(default)]
    pub quiescence: Option<QuiescenceObservation>,
    #[serde(default)]
    pub fallback: FallbackMode,
    #[serde(default)]
    pub offline_lock: bool,
    pub outcome: RunOutcome,
    pub changes: Vec<FileChangeRecord>,
    pub conflicts: Vec<ConflictRecord>,
    #[serde(default)]
    pub skipped: Vec<SkippedAction>,
    #[serde(default)]
    pub vcs: VcsInfo,
}

impl RunBatch {
    /// Fresh run identifier: UTC timestamp plus a short random suffix, so
    /// directory listings sort chronologically.
    pub fn new_run_id() -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("run_{}_{}", Utc::now().format("%Y%m%dT%H%M%SZ"), &suffix[..8])
    }

    pub fn changes_for_transaction<'a>(
        &'a self,
        transaction_id: &'a str,
    ) -> impl Iterator<Item = &'a FileChangeRecord> + 'a {
        self.changes
            .iter()
            .filter(move |c| c.transaction_id.as_deref() == Some(transaction_id))
    }
}
