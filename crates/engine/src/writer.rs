//! Crash-safe replacement of vault files.
//!
//! Content goes to a temp sibling in the target's directory, is synced, and
//! is renamed over the target. A crash at any point leaves either the old or
//! the new file, never a torn one.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use vaultward_core::Digest;

fn temp_sibling(path: &Path) -> PathBuf {
    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "note".to_string());
    path.with_file_name(format!(".{filename}.vaultward.tmp"))
}

/// Atomically replace `path` with `content` and return the digest of the
/// bytes that were synced and renamed into place.
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<Digest> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = temp_sibling(path);
    // Never re-read after the rename: another writer may already be there.
    let digest = Digest::of_bytes(content);

    let write_result = (|| -> io::Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(content)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(err) = write_result {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    sync_parent(path);

    debug!(path = %path.display(), digest = digest.short(), "atomic write committed");
    Ok(digest)
}

/// Remove `path`; a file that is already gone counts as removed.
pub fn remove(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            sync_parent(path);
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Persist the directory entry change. Best effort: not every platform lets
/// a directory be opened for syncing.
fn sync_parent(path: &Path) {
    #[cfg(unix)]
    {
        if let Some(dir) = path.parent().and_then(|parent| File::open(parent).ok()) {
            let _ = dir.sync_all();
        }
    }

    #[cfg(not(unix))]
    {
        let _ = path;
    }
}
