use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// File name looked up in the vault root, then in the state directory.
pub const CONFIG_FILE_NAME: &str = "vaultward.toml";

// ── Starvation policy ─────────────────────────────────────────────────────────

/// What the orchestrator does when the vault never goes quiet within
/// `max_wait_sec`.
///
/// | Policy         | Behaviour                                                  |
/// |----------------|------------------------------------------------------------|
/// | `class_a_only` | Drop B1/B2 actions, apply the remaining Class A set.       |
/// | `append_only`  | Smallest write set: only anchored-block appends.           |
/// | `abort`        | Apply nothing; the run ends `Aborted(starvation)`.         |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StarvationPolicy {
    #[default]
    ClassAOnly,
    AppendOnly,
    Abort,
}

/// How a dirty version-control working tree is treated before applying.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitPolicy {
    #[default]
    RequireClean,
    AllowDirty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Vault root. Overridden by the `VAULT_PATH` environment variable.
    pub path: String,
    /// Where leases, run ledgers and conflict artifacts live. Relative paths
    /// resolve against the current directory. Overridden by
    /// `VAULTWARD_STATE_DIR`.
    pub state_dir: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            state_dir: ".vaultward".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub ttl_sec: u64,
    /// Reclaim a lease whose TTL elapsed and whose holder is verifiably gone.
    /// When false such a lease is reported and left for `--force`.
    pub reclaim_stale: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_sec: 60,
            reclaim_stale: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuiescenceConfig {
    /// Hard upper bound on the quiet wait. `0` means sample once and never sleep.
    pub max_wait_sec: u64,
    pub interval_ms: u64,
    /// Consecutive identical samples required to declare the vault quiet.
    pub stable_samples: usize,
    /// Vault-relative paths whose newest mtime signals editor/sync activity.
    pub busy_paths: Vec<String>,
    /// Vault-relative lock files whose presence means another writer is busy.
    pub lock_files: Vec<String>,
    pub on_starvation: StarvationPolicy,
    /// Under starvation, drop a marker file asking sync clients to pause.
    pub offline_lock: bool,
    pub offline_lock_marker: String,
    pub offline_lock_cleanup: bool,
}

impl Default for QuiescenceConfig {
    fn default() -> Self {
        Self {
            max_wait_sec: 30,
            interval_ms: 2000,
            stable_samples: 2,
            busy_paths: vec![".obsidian".to_string()],
            lock_files: vec![
                ".git/index.lock".to_string(),
                ".obsidian/workspace.lock".to_string(),
            ],
            on_starvation: StarvationPolicy::ClassAOnly,
            offline_lock: false,
            offline_lock_marker: ".nosync".to_string(),
            offline_lock_cleanup: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// Ask for confirmation before writing. `--yes` bypasses it.
    pub interactive: bool,
    /// Allow B2 (structurally unsafe) actions through when the operator also
    /// confirms each one. Off by default.
    pub allow_b2_override: bool,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            interactive: true,
            allow_b2_override: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub policy: GitPolicy,
    /// Commit a checkpoint before and after each apply.
    pub auto_checkpoint: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Prune the run ledger after each apply.
    pub auto_prune: bool,
    /// Keep at most this many runs. `0` disables the count limit.
    pub max_run_logs: usize,
    /// Drop runs older than this many days. `0` disables the age limit.
    pub max_run_days: u64,
    /// Drop oldest runs until the ledger fits. `0` disables the size limit.
    pub max_total_mb: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            auto_prune: true,
            max_run_logs: 50,
            max_run_days: 30,
            max_total_mb: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub vault: VaultConfig,
    pub lease: LeaseConfig,
    pub quiescence: QuiescenceConfig,
    pub apply: ApplyConfig,
    pub git: GitConfig,
    pub storage: StorageConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load `vaultward.toml` from the vault root, falling back to the state
    /// directory, falling back to defaults.
    pub fn discover(vault: &Path, state_dir: &Path) -> Result<Self> {
        for candidate in [vault.join(CONFIG_FILE_NAME), state_dir.join(CONFIG_FILE_NAME)] {
            if candidate.exists() {
                return Self::load_from(candidate);
            }
        }
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var("VAULT_PATH") {
            if !value.is_empty() {
                self.vault.path = value;
            }
        }
        if let Ok(value) = env::var("VAULTWARD_STATE_DIR") {
            if !value.is_empty() {
                self.vault.state_dir = value;
            }
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(&self.vault.state_dir)
    }

    /// State directory for `vault`: a relative `state_dir` lives inside it.
    pub fn state_dir_for(&self, vault: &Path) -> PathBuf {
        let state_dir = self.state_dir();
        if state_dir.is_absolute() {
            state_dir
        } else {
            vault.join(state_dir)
        }
    }

    pub fn vault_path(&self) -> Option<PathBuf> {
        if self.vault.path.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.vault.path))
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
