//! Vault-relative path handling.

use std::path::{Component, Path, PathBuf};

use crate::{Result, VaultwardError};

/// Lexically resolve `.` and `..` without touching the filesystem, so targets
/// that do not exist yet (rename destinations) can still be checked.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// True when `rel` is a plain relative path that stays inside the vault.
pub fn is_vault_relative(rel: &Path) -> bool {
    if rel.as_os_str().is_empty() || rel.is_absolute() {
        return false;
    }
    let mut depth = 0i32;
    for component in rel.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    depth > 0
}

/// Join `rel` onto `vault`, refusing anything that would escape it.
pub fn resolve_in_vault(vault: &Path, rel: &Path) -> Result<PathBuf> {
    if !is_vault_relative(rel) {
        return Err(VaultwardError::PathEscapesVault(rel.to_path_buf()));
    }
    Ok(normalize_path(&vault.join(rel)))
}

/// Note stem used by wiki links: `notes/Old Name.md` → `Old Name`.
pub fn note_stem(rel: &Path) -> String {
    rel.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
