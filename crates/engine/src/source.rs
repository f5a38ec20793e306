use std::io;
use std::path::Path;

use vaultward_core::Digest;

/// Where the engine learns a file's current digest. Consulted immediately
/// before every write and on rollback.
pub trait DigestSource: Send + Sync {
    fn digest_of(&self, path: &Path) -> io::Result<Option<Digest>>;
}

/// Hashes the file on disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsDigestSource;

impl DigestSource for FsDigestSource {
    fn digest_of(&self, path: &Path) -> io::Result<Option<Digest>> {
        Digest::of_file(path)
    }
}

/// Current content of a vault file, `None` when it does not exist.
pub fn read_current(path: &Path) -> io::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}
