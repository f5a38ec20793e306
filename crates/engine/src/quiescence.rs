//! Bounded wait for external write activity (editor, sync client, git) to
//! subside before the engine touches the vault.

use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use tokio::time::Instant;
use tracing::{debug, info};

use vaultward_config::QuiescenceConfig;
use vaultward_core::{ActivitySample, QuiescenceObservation};

/// Source of activity samples. The filesystem probe is the production one;
/// tests script their own.
pub trait ActivityProbe: Send + Sync {
    fn sample(&self) -> ActivitySample;
}

#[derive(Debug, Clone)]
pub struct QuiescenceSettings {
    pub max_wait: Duration,
    pub interval: Duration,
    pub stable_samples: usize,
}

impl From<&QuiescenceConfig> for QuiescenceSettings {
    fn from(config: &QuiescenceConfig) -> Self {
        Self {
            max_wait: Duration::from_secs(config.max_wait_sec),
            interval: Duration::from_millis(config.interval_ms.max(1)),
            stable_samples: config.stable_samples.max(1),
        }
    }
}

/// Samples newest mtimes under the busy paths and the presence of lock files.
#[derive(Debug, Clone)]
pub struct FsActivityProbe {
    vault: PathBuf,
    busy_paths: Vec<PathBuf>,
    lock_files: Vec<PathBuf>,
}

impl FsActivityProbe {
    pub fn new(vault: impl Into<PathBuf>, busy_paths: &[String], lock_files: &[String]) -> Self {
        Self {
            vault: vault.into(),
            busy_paths: busy_paths.iter().map(PathBuf::from).collect(),
            lock_files: lock_files.iter().map(PathBuf::from).collect(),
        }
    }

    pub fn from_config(vault: impl Into<PathBuf>, config: &QuiescenceConfig) -> Self {
        Self::new(vault, &config.busy_paths, &config.lock_files)
    }
}

impl ActivityProbe for FsActivityProbe {
    fn sample(&self) -> ActivitySample {
        let latest_mtime_ms = self
            .busy_paths
            .iter()
            .filter_map(|rel| latest_mtime_ms(&self.vault.join(rel)))
            .max();
        let lock_files = self
            .lock_files
            .iter()
            .filter(|rel| self.vault.join(rel).exists())
            .cloned()
            .collect();
        ActivitySample {
            latest_mtime_ms,
            lock_files,
        }
    }
}

fn latest_mtime_ms(root: &Path) -> Option<u128> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.metadata().ok())
        .filter_map(|meta| meta.modified().ok())
        .filter_map(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
        .map(|since| since.as_millis())
        .max()
}

/// Sample until `stable_samples` consecutive identical, lock-free samples
/// are seen, or until `max_wait` elapses. Never sleeps past the deadline.
/// A vault with nothing to observe is quiet on the first sample.
pub async fn wait_for_quiet(probe: &dyn ActivityProbe, settings: &QuiescenceSettings) -> QuiescenceObservation {
    let started = Instant::now();
    let deadline = started + settings.max_wait;
    let mut sampled_signals: Vec<ActivitySample> = Vec::new();
    let mut streak = 0usize;

    let settled = loop {
        let sample = probe.sample();
        let lock_free = sample.lock_files.is_empty();
        let unobservable = lock_free && sample.latest_mtime_ms.is_none();
        streak = match sampled_signals.last() {
            Some(prev) if lock_free && *prev == sample => streak + 1,
            _ if lock_free => 1,
            _ => 0,
        };
        debug!(
            latest_mtime_ms = ?sample.latest_mtime_ms,
            lock_files = sample.lock_files.len(),
            streak,
            "quiescence sample"
        );
        sampled_signals.push(sample);

        if unobservable || streak >= settings.stable_samples {
            break true;
        }
        let now = Instant::now();
        if now >= deadline {
            break false;
        }
        tokio::time::sleep(settings.interval.min(deadline - now)).await;
    };

    let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    info!(settled, waited_ms, samples = sampled_signals.len(), "quiescence wait finished");
    QuiescenceObservation {
        waited_ms,
        settled,
        sampled_signals,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::ActivityProbe;
    use vaultward_core::ActivitySample;

    /// Probe that replays a fixed sequence, repeating the last sample forever.
    #[derive(Debug)]
    pub struct ScriptedProbe {
        samples: Mutex<Vec<ActivitySample>>,
    }

    impl ScriptedProbe {
        pub fn new(mut samples: Vec<ActivitySample>) -> Self {
            samples.reverse();
            Self {
                samples: Mutex::new(samples),
            }
        }
    }

    impl ActivityProbe for ScriptedProbe {
        fn sample(&self) -> ActivitySample {
            let mut samples = match self.samples.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if samples.len() > 1 {
                samples.pop().unwrap_or_default()
            } else {
                samples.last().cloned().unwrap_or_default()
            }
        }
    }

    /// A vault whose busy path changes on every sample.
    #[derive(Debug, Default)]
    pub struct ChangingProbe {
        counter: Mutex<u128>,
    }

    impl ActivityProbe for ChangingProbe {
        fn sample(&self) -> ActivitySample {
            let mut counter = match self.counter.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *counter += 1;
            ActivitySample {
                latest_mtime_ms: Some(*counter),
                lock_files: Vec::new(),
            }
        }
    }
}
