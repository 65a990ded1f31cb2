//! Whole-ruleset snapshots
//!
//! A snapshot is the text output of `nft list ruleset`, written atomically with a
//! `<path>.sha256` sidecar. Restore verifies the sidecar when present and loads the
//! snapshot behind a `flush ruleset` in one nft batch, so a snapshot that fails to
//! parse leaves the running ruleset untouched.

use crate::core::control::{self, ControlPlane};
use crate::core::error::{Error, Result, SnapshotError};
use crate::utils::{sha256_hex, write_atomic};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Sidecar path holding the hex SHA-256 of `path`.
pub fn checksum_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Writes the current ruleset to `path` and its checksum next to it.
///
/// Returns the checksum.
pub async fn save_ruleset<C: ControlPlane>(cp: &C, path: &Path) -> Result<String> {
    let ruleset = control::list_ruleset(cp).await?;
    let checksum = sha256_hex(ruleset.as_bytes());

    write_atomic(path, ruleset.as_bytes())?;
    write_atomic(&checksum_path(path), format!("{checksum}\n").as_bytes())?;

    info!("Saved ruleset to {} ({checksum})", path.display());
    Ok(checksum)
}

/// Replaces the running ruleset with the snapshot at `path`.
///
/// Returns `false` without touching the firewall when no snapshot exists.
///
/// # Errors
///
/// [`SnapshotError::ChecksumMismatch`] if the sidecar disagrees with the file,
/// [`SnapshotError::Empty`] for a blank snapshot, [`SnapshotError::RestoreFailed`]
/// if nft rejects the batch.
pub async fn restore_ruleset<C: ControlPlane>(cp: &C, path: &Path) -> Result<bool> {
    let ruleset = match tokio::fs::read_to_string(path).await {
        Ok(ruleset) => ruleset,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No snapshot at {}, nothing to restore", path.display());
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };

    verify_checksum(path, &ruleset).await?;
    if ruleset.trim().is_empty() {
        return Err(SnapshotError::Empty.into());
    }

    let batch = format!("flush ruleset\n{ruleset}");
    cp.run(&["-f", "-"], Some(&batch)).await.map_err(|e| match e {
        Error::Nftables { message, .. } => SnapshotError::RestoreFailed(message).into(),
        other => other,
    })?;

    info!("Restored ruleset from {}", path.display());
    Ok(true)
}

async fn verify_checksum(path: &Path, ruleset: &str) -> Result<()> {
    let sidecar = checksum_path(path);
    let expected = match tokio::fs::read_to_string(&sidecar).await {
        Ok(expected) => expected.trim().to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("No checksum for {}, restoring unverified", path.display());
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let actual = sha256_hex(ruleset.as_bytes());
    if expected != actual {
        return Err(SnapshotError::ChecksumMismatch { expected, actual }.into());
    }
    Ok(())
}
