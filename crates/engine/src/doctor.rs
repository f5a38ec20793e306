//! Read-only health checks over a vault and its engine state. Never takes
//! the lease and never writes to the vault.

use std::fmt;
use std::path::Path;

use chrono::Utc;

use vaultward_config::AppConfig;
use vaultward_core::paths::resolve_in_vault;
use vaultward_ledger::RunLedger;

use crate::lease::{LeaseState, WriteLease};
use crate::vcs::{GitCli, VcsStatus, VersionControl};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Ok,
    Warn,
    Fail,
}

impl CheckStatus {
    fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warn => "warn",
            Self::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Check {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct DoctorReport {
    pub checks: Vec<Check>,
}

impl DoctorReport {
    fn push(&mut self, name: &'static str, status: CheckStatus, detail: impl Into<String>) {
        self.checks.push(Check {
            name,
            status,
            detail: detail.into(),
        });
    }

    pub fn healthy(&self) -> bool {
        self.checks.iter().all(|c| c.status != CheckStatus::Fail)
    }

    pub fn get(&self, name: &str) -> Option<&Check> {
        self.checks.iter().find(|c| c.name == name)
    }
}

impl fmt::Display for DoctorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "vaultward doctor")?;
        for check in &self.checks {
            writeln!(f, "- [{}] {}: {}", check.status.label(), check.name, check.detail)?;
        }
        Ok(())
    }
}

pub async fn diagnose(vault: &Path, config: &AppConfig) -> DoctorReport {
    let mut report = DoctorReport::default();
    let state_dir = config.state_dir_for(vault);

    if vault.is_dir() {
        report.push("vault", CheckStatus::Ok, vault.display().to_string());
    } else {
        report.push("vault", CheckStatus::Fail, format!("{} is not a directory", vault.display()));
    }

    match probe_writable(&state_dir) {
        Ok(()) => report.push("state dir", CheckStatus::Ok, state_dir.display().to_string()),
        Err(err) => report.push(
            "state dir",
            CheckStatus::Fail,
            format!("{} is not writable: {err}", state_dir.display()),
        ),
    }

    match WriteLease::new(&state_dir).state() {
        Ok(LeaseState::Free) => report.push("write lease", CheckStatus::Ok, "free"),
        Ok(LeaseState::Held(info)) => report.push(
            "write lease",
            CheckStatus::Warn,
            format!(
                "held by {} (pid {} on {}) until {}",
                info.holder_id, info.pid, info.host, info.expires_at
            ),
        ),
        Ok(LeaseState::Stale(info)) => report.push(
            "write lease",
            CheckStatus::Warn,
            format!(
                "stale marker from pid {} on {} (expired {}s ago); enable lease.reclaim_stale to clear it",
                info.pid,
                info.host,
                Utc::now().signed_duration_since(info.expires_at).num_seconds()
            ),
        ),
        Err(err) => report.push("write lease", CheckStatus::Fail, err.to_string()),
    }

    let marker = &config.quiescence.offline_lock_marker;
    match resolve_in_vault(vault, Path::new(marker)) {
        Ok(path) if path.exists() => report.push(
            "offline lock",
            CheckStatus::Warn,
            format!("{marker} is present; sync clients may stay paused until it is removed"),
        ),
        Ok(_) => report.push("offline lock", CheckStatus::Ok, format!("{marker} absent")),
        Err(err) => report.push("offline lock", CheckStatus::Fail, err.to_string()),
    }

    match GitCli::new(vault).status().await {
        Ok(VcsStatus::NotARepo) => report.push("version control", CheckStatus::Warn, "not a git repository"),
        Ok(VcsStatus::Clean) => report.push("version control", CheckStatus::Ok, "clean"),
        Ok(VcsStatus::Dirty) => report.push(
            "version control",
            CheckStatus::Warn,
            format!("uncommitted changes (policy: {:?})", config.git.policy),
        ),
        Err(err) => report.push("version control", CheckStatus::Warn, err.to_string()),
    }

    match RunLedger::new(&state_dir).list() {
        Ok(runs) => {
            let bytes: u64 = runs.iter().map(|r| r.size_bytes).sum();
            report.push(
                "run ledger",
                CheckStatus::Ok,
                format!("{} runs, {:.1} MiB", runs.len(), bytes as f64 / (1024.0 * 1024.0)),
            );
        }
        Err(err) => report.push("run ledger", CheckStatus::Fail, err.to_string()),
    }

    report
}

fn probe_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(format!(".doctor-{}", std::process::id()));
    std::fs::write(&probe, b"ok")?;
    std::fs::remove_file(&probe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseOptions;
    use tempfile::TempDir;

    #[tokio::test]
    async fn fresh_vault_is_healthy() {
        let vault = TempDir::new().unwrap();
        let report = diagnose(vault.path(), &AppConfig::default()).await;
        assert!(report.healthy(), "{report}");
        assert_eq!(report.get("write lease").unwrap().detail, "free");
        assert_eq!(report.get("offline lock").unwrap().status, CheckStatus::Ok);
    }

    #[tokio::test]
    async fn held_lease_and_offline_marker_are_reported() {
        let vault = TempDir::new().unwrap();
        let config = AppConfig::default();
        std::fs::write(vault.path().join(&config.quiescence.offline_lock_marker), "").unwrap();
        let lease = WriteLease::new(config.state_dir_for(vault.path()))
            .acquire(vault.path(), LeaseOptions::default())
            .unwrap();

        let report = diagnose(vault.path(), &config).await;

        assert_eq!(report.get("write lease").unwrap().status, CheckStatus::Warn);
        assert!(report.get("write lease").unwrap().detail.contains("held by"));
        assert_eq!(report.get("offline lock").unwrap().status, CheckStatus::Warn);
        lease.release().unwrap();
    }

    #[tokio::test]
    async fn missing_vault_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let mut config = AppConfig::default();
        config.vault.state_dir = dir.path().join("state").display().to_string();

        let report = diagnose(&missing, &config).await;
        assert!(!report.healthy());
        assert_eq!(report.get("vault").unwrap().status, CheckStatus::Fail);
    }
}
