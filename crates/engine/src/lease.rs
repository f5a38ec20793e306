//! Vault write lease.
//!
//! The lease is a durable JSON marker at `<state_dir>/locks/write-lease.json`
//! plus an advisory `fs2` lock on the sibling `write-lease.lock` held for the
//! lifetime of the [`LeaseHandle`]. The OS lock disappears with the holder
//! process; the marker does not, so a crashed holder is visible as a stale
//! lease until it is reclaimed.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vaultward_core::{LeaseInfo, Result, SCHEMA_VERSION, VaultwardError, check_schema};

pub const LEASE_MARKER_FILE: &str = "write-lease.json";
const LEASE_GUARD_FILE: &str = "write-lease.lock";

#[derive(Debug, Clone, Copy)]
pub struct LeaseOptions {
    pub ttl: Duration,
    /// Clear a stale marker left by a dead holder.
    pub reclaim_stale: bool,
    /// Operator override. Still refuses to clear a live holder.
    pub force: bool,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            reclaim_stale: false,
            force: false,
        }
    }
}

/// What a diagnostics reader sees when it looks at the marker.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseState {
    Free,
    Held(LeaseInfo),
    Stale(LeaseInfo),
}

#[derive(Debug, Clone)]
pub struct WriteLease {
    locks_dir: PathBuf,
}

impl WriteLease {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            locks_dir: state_dir.as_ref().join("locks"),
        }
    }

    pub fn marker_path(&self) -> PathBuf {
        self.locks_dir.join(LEASE_MARKER_FILE)
    }

    fn guard_path(&self) -> PathBuf {
        self.locks_dir.join(LEASE_GUARD_FILE)
    }

    /// Take the lease without blocking. Fails with
    /// [`VaultwardError::LeaseHeld`] when another holder is live, or when the
    /// marker is stale and reclaiming was not allowed.
    pub fn acquire(&self, vault: &Path, options: LeaseOptions) -> Result<LeaseHandle> {
        fs::create_dir_all(&self.locks_dir)?;
        let guard = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.guard_path())?;

        if guard.try_lock_exclusive().is_err() {
            let existing = self.read_marker().ok().flatten();
            return Err(match (existing, options.force) {
                (Some(info), true) => VaultwardError::LiveLeaseReclaim {
                    holder: info.holder_id,
                    pid: info.pid,
                },
                (Some(info), false) => lease_held(&info, false),
                (None, _) => VaultwardError::LeaseHeld {
                    holder: "unknown".to_string(),
                    pid: 0,
                    host: "unknown".to_string(),
                    expires_at: "unknown".to_string(),
                    stale: false,
                },
            });
        }

        if let Some(existing) = self.read_marker()? {
            let stale = is_stale(&existing, Utc::now());
            if !stale {
                if options.force {
                    return Err(VaultwardError::LiveLeaseReclaim {
                        holder: existing.holder_id,
                        pid: existing.pid,
                    });
                }
                return Err(lease_held(&existing, false));
            }
            if !(options.reclaim_stale || options.force) {
                return Err(lease_held(&existing, true));
            }
            warn!(
                holder = %existing.holder_id,
                pid = existing.pid,
                expired_at = %existing.expires_at,
                "reclaiming stale write lease"
            );
            fs::remove_file(self.marker_path())?;
        }

        let host = local_host();
        let pid = std::process::id();
        let acquired_at = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        let info = LeaseInfo {
            schema_version: SCHEMA_VERSION,
            holder_id: format!("{host}:{pid}:{}", &suffix[..8]),
            pid,
            host,
            vault: vault.to_path_buf(),
            acquired_at,
            ttl_sec: options.ttl.as_secs(),
            expires_at: expiry(acquired_at, options.ttl),
        };

        // create_new: a marker that appeared since the read above means we lost a race.
        let mut marker = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.marker_path())
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let existing = self.read_marker()?;
                return Err(match existing {
                    Some(info) => lease_held(&info, false),
                    None => err.into(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        marker.write_all(&serde_json::to_vec_pretty(&info)?)?;
        marker.sync_all()?;

        info!(holder = %info.holder_id, ttl_sec = info.ttl_sec, "write lease acquired");
        Ok(LeaseHandle {
            info,
            marker_path: self.marker_path(),
            guard: Some(guard),
        })
    }

    pub fn read_marker(&self) -> Result<Option<LeaseInfo>> {
        let raw = match fs::read_to_string(self.marker_path()) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let info: LeaseInfo = serde_json::from_str(&raw)?;
        check_schema("write-lease", info.schema_version)?;
        Ok(Some(info))
    }

    pub fn state(&self) -> Result<LeaseState> {
        Ok(match self.read_marker()? {
            None => LeaseState::Free,
            Some(info) if is_stale(&info, Utc::now()) => LeaseState::Stale(info),
            Some(info) => LeaseState::Held(info),
        })
    }
}

/// A lease is stale once its TTL elapsed and its holder is verifiably gone.
/// A holder on another host cannot be probed and is assumed alive.
pub fn is_stale(info: &LeaseInfo, now: DateTime<Utc>) -> bool {
    if !info.is_expired_at(now) {
        return false;
    }
    info.host == local_host() && !is_pid_running(info.pid)
}

fn lease_held(info: &LeaseInfo, stale: bool) -> VaultwardError {
    VaultwardError::LeaseHeld {
        holder: info.holder_id.clone(),
        pid: info.pid,
        host: info.host.clone(),
        expires_at: info.expires_at.to_rfc3339(),
        stale,
    }
}

fn expiry(from: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    from + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Held lease. Released explicitly with [`LeaseHandle::release`] or, failing
/// that, when dropped.
#[derive(Debug)]
pub struct LeaseHandle {
    info: LeaseInfo,
    marker_path: PathBuf,
    guard: Option<File>,
}

impl LeaseHandle {
    pub fn info(&self) -> &LeaseInfo {
        &self.info
    }

    /// Push the expiry out by another TTL, e.g. after a long quiescence wait.
    pub fn renew(&mut self) -> Result<()> {
        let now = Utc::now();
        self.info.expires_at = expiry(now, Duration::from_secs(self.info.ttl_sec));
        let tmp = self.marker_path.with_extension("json.tmp");
        let result = (|| -> Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(&self.info)?)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.marker_path)?;
            Ok(())
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        debug!(holder = %self.info.holder_id, expires_at = %self.info.expires_at, "write lease renewed");
        result
    }

    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        let Some(guard) = self.guard.take() else {
            return Ok(());
        };
        // Only remove a marker that is still ours.
        let ours = fs::read_to_string(&self.marker_path)
            .ok()
            .and_then(|raw| serde_json::from_str::<LeaseInfo>(&raw).ok())
            .is_some_and(|info| info.holder_id == self.info.holder_id);
        let removed = if ours {
            match fs::remove_file(&self.marker_path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err),
            }
        } else {
            Ok(())
        };
        let _ = FileExt::unlock(&guard);
        info!(holder = %self.info.holder_id, "write lease released");
        removed.map_err(Into::into)
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(error = %err, holder = %self.info.holder_id, "failed to release write lease");
        }
    }
}

pub(crate) fn local_host() -> String {
    if let Ok(host) = std::env::var("HOSTNAME") {
        let host = host.trim().to_string();
        if !host.is_empty() {
            return host;
        }
    }
    fs::read_to_string("/etc/hostname")
        .map(|raw| raw.trim().to_string())
        .ok()
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

pub(crate) fn is_pid_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}
