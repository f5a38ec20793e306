//! Durable run ledger: one directory per run holding `run-log.json` and the
//! backup, patch and conflict artifacts, plus a JSONL journal indexing runs
//! in completion order.

pub mod journal;
pub mod retention;
pub mod store;

pub use journal::{LedgerEvent, LedgerJournal};
pub use retention::{PruneReport, RetentionPolicy, prune};
pub use store::{RUN_LOG_FILE, RunArtifacts, RunEntry, RunLedger};
