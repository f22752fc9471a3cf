//! The per-invocation scratch directory.
//!
//! Every byte of derived material — decoded signer chains, OCSP staples,
//! decoded signatures, extracted keys — lives under one of these for the
//! lifetime of a single invocation. Replaces the source shell's
//! trap-on-exit cleanup with RAII: `Drop` removes the directory tree on
//! every exit path, including an early `?`-propagated error, without a
//! deferred call that a `return` could skip.

use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use rand::thread_rng;

use crate::crypto::generate_token;

/// An owner-only, memory-backed scratch directory, created fresh per
/// invocation and removed on drop.
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Creates a new scratch directory under `parent`, named with a random
    /// base58 suffix, mode `0700`.
    ///
    /// Built on `tempfile::Builder` rather than a bare `mkdir`, matching
    /// the rest of the codebase's use of `tempfile` for disposable
    /// directories; `.into_path()` hands ownership of cleanup to this
    /// type's own `Drop` impl so a failed removal can be logged instead of
    /// silently swallowed the way `TempDir`'s own `Drop` would.
    pub fn create(parent: impl AsRef<Path>) -> eyre::Result<Self> {
        let suffix = generate_token::<16>(thread_rng())?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("ssh-key-agent-{suffix}-"))
            .rand_bytes(0)
            .permissions(Permissions::from_mode(0o700))
            .tempdir_in(parent.as_ref())?;

        Ok(Self { path: dir.into_path() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `contents` to `name` inside the scratch directory with mode
    /// `mode` (`0600` for general derived material, `0400` for the
    /// extracted signer public key and decoded credentials).
    pub fn write_file(&self, name: &str, contents: &[u8], mode: u32) -> eyre::Result<PathBuf> {
        let file_path = self.path.join(name);
        std::fs::write(&file_path, contents)?;
        std::fs::set_permissions(&file_path, Permissions::from_mode(mode))?;
        Ok(file_path)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove scratch directory");
            }
        }
    }
}
