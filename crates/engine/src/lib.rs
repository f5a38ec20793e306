//! The vaultward apply engine: write lease, quiescence wait, conflict-aware
//! single-file and transactional writes, the apply state machine, rollback
//! and diagnostics.

pub mod artifacts;
pub mod classifier;
pub mod confirm;
pub mod diff;
pub mod doctor;
pub mod edits;
pub mod lease;
pub mod orchestrator;
pub mod plan;
pub mod quiescence;
pub mod resolver;
pub mod rollback;
pub mod source;
mod transaction;
pub mod vcs;
pub mod writer;

pub use confirm::{AlwaysAccept, AlwaysReject, BatchSummary, ConfirmationPort, SummaryLine};
pub use doctor::{CheckStatus, DoctorReport, diagnose};
pub use lease::{LeaseHandle, LeaseOptions, LeaseState, WriteLease};
pub use orchestrator::{ApplyReport, ApplyState, OfflineLock, Orchestrator, RunOptions};
pub use quiescence::{ActivityProbe, FsActivityProbe, QuiescenceSettings, wait_for_quiet};
pub use rollback::{RollbackEngine, RollbackFilter, RollbackOutcome};
pub use source::{DigestSource, FsDigestSource};
pub use vcs::{GitCli, NoVcs, VcsStatus, VersionControl};
