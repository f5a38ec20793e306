//! Shared vocabulary for the vaultward apply engine: proposed actions, run
//! records, content digests and the error taxonomy.

pub mod action;
pub mod digest;
pub mod error;
pub mod paths;
pub mod record;

pub use action::{ActionPayload, ActionPlan, Placement, ProposedAction, RiskClass};
pub use digest::Digest;
pub use error::{Result, VaultwardError};
pub use record::{
    ActivitySample, ArtifactPaths, ConflictKind, ConflictRecord, FallbackMode, FileChangeRecord, LeaseInfo,
    QuiescenceObservation, RunBatch, RunKind, RunOutcome, SkippedAction, SkipReason, VcsInfo,
};

/// Version stamped on every persisted record (plans, run logs, lease markers).
/// Readers reject any other value instead of guessing at its layout.
pub const SCHEMA_VERSION: u32 = 1;

/// Fails with [`VaultwardError::SchemaMismatch`] unless `found` is the version
/// this build understands.
pub fn check_schema(record: &'static str, found: u32) -> Result<()> {
    if found == SCHEMA_VERSION {
        Ok(())
    } else {
        Err(VaultwardError::SchemaMismatch {
            record,
            found: found.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_schema_is_accepted() {
        assert!(check_schema("run-log", SCHEMA_VERSION).is_ok());
    }

    #[test]
    fn future_schema_is_rejected() {
        let err = check_schema("run-log", SCHEMA_VERSION + 1).unwrap_err();
        assert!(matches!(err, VaultwardError::SchemaMismatch { record: "run-log", .. }));
    }
}
