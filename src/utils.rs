//! Directory and file helpers
//!
//! State (disabled forwards, ruleset snapshot, audit log) lives in
//! `/var/lib/nftgate` when running as root, otherwise in the XDG state directory
//! (`~/.local/state/nftgate`).

use directories::ProjectDirs;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};

/// State directory used when running as root
pub const SYSTEM_STATE_DIR: &str = "/var/lib/nftgate";

pub fn get_state_dir() -> PathBuf {
    if nix::unistd::getuid().is_root() {
        return PathBuf::from(SYSTEM_STATE_DIR);
    }
    ProjectDirs::from("org", "nftgate", "nftgate")
        .and_then(|pd| pd.state_dir().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from(SYSTEM_STATE_DIR))
}

/// Creates the parent directory of `path` (mode 0700 on creation).
pub fn ensure_parent(path: &Path) -> std::io::Result<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };

    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        DirBuilder::new().mode(0o700).recursive(true).create(parent)
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(parent)
    }
}

/// Writes `contents` to `path` atomically: temp file in the same directory,
/// mode 0600, fsync, rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    ensure_parent(path)?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                format!("Disk full: cannot write {}", path.display()),
            )
        } else {
            e.error
        }
    })?;
    Ok(())
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/state.json");
        write_atomic(&path, b"{}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");

        write_atomic(&path, b"[1]").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[1]");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_atomic_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        write_atomic(&path, b"x").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
