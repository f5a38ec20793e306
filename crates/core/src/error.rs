use std::path::PathBuf;

/// Failures that abort an invocation or a whole rollback request.
///
/// Divergence between planned and on-disk state is *not* an error: it is
/// reported as a [`crate::ConflictRecord`] in the run result. Quiescence
/// starvation is likewise an outcome handled by the configured fallback.
#[derive(Debug, thiserror::Error)]
pub enum VaultwardError {
    /// Another live process holds the vault write lease. Retry after backoff.
    #[error("write lease held by {holder} (pid {pid} on {host}) until {expires_at} (stale: {stale})")]
    LeaseHeld {
        holder: String,
        pid: u32,
        host: String,
        expires_at: String,
        stale: bool,
    },

    /// A forced reclaim was requested while the lease holder is still alive.
    #[error("refusing to reclaim a live write lease held by {holder} (pid {pid})")]
    LiveLeaseReclaim { holder: String, pid: u32 },

    /// A persisted record carries a version (or tag) this build does not know.
    #[error("unsupported {record} schema: {found}")]
    SchemaMismatch { record: &'static str, found: String },

    /// The proposed batch is malformed: dependency cycle, unknown dependency,
    /// duplicate action id.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("path escapes vault boundary: {}", .0.display())]
    PathEscapesVault(PathBuf),

    #[error("run not found: {0}")]
    RunNotFound(String),

    /// The rollback filter selected records that cannot be reversed on their own.
    #[error("rollback rejected: {0}")]
    RollbackRejected(String),

    #[error("version control error: {0}")]
    Vcs(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VaultwardError>;

impl VaultwardError {
    /// Whether the caller may retry the same request later without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LeaseHeld { stale: false, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_held_message_mentions_staleness() {
        let err = VaultwardError::LeaseHeld {
            holder: "h1".to_string(),
            pid: 42,
            host: "box".to_string(),
            expires_at: "2026-01-01T00:00:00Z".to_string(),
            stale: true,
        };
        let msg = err.to_string();
        assert!(msg.contains("pid 42"));
        assert!(msg.ends_with("(stale: true)"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn live_lease_is_retryable() {
        let err = VaultwardError::LeaseHeld {
            holder: "h1".to_string(),
            pid: 42,
            host: "box".to_string(),
            expires_at: "later".to_string(),
            stale: false,
        };
        assert!(err.is_retryable());
    }
}
