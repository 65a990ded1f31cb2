//! Privilege elevation for the nft control plane
//!
//! nftgate only needs root for one thing: invoking the configured `nft` binary.
//! When the process already runs as root the binary is executed directly.
//!
//! # Elevation Strategy
//!
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Fallback**: `sudo`
//!
//! # Environment Variables
//!
//! - `NFTGATE_ELEVATION_METHOD`: Force a specific elevation method (`sudo` or `run0`).
//!   Useful with sudoers NOPASSWD rules.
//!   Example: `NFTGATE_ELEVATION_METHOD=sudo nftgate quota list`
//!
//! - `NFTGATE_NO_ELEVATION`: Run the binary as-is (tests, containers with `CAP_NET_ADMIN`).
//!
//! # Security
//!
//! - Only the configured nft binary is ever elevated
//! - Commands are constructed without shell interpolation
//! - All inputs are validated before they reach an argument vector

use std::io;
use tokio::process::Command;

pub const ELEVATION_METHOD_ENV: &str = "NFTGATE_ELEVATION_METHOD";
pub const NO_ELEVATION_ENV: &str = "NFTGATE_NO_ELEVATION";

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `NFTGATE_ELEVATION_METHOD`
    #[error("Invalid NFTGATE_ELEVATION_METHOD '{0}'. Valid options: sudo, run0")]
    InvalidMethod(String),

    /// Neither run0 nor sudo could be found
    #[error("No elevation helper found (install sudo or run nftgate as root)")]
    NoHelper,

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn forced_method() -> Result<Option<&'static str>, ElevationError> {
    let Ok(method) = std::env::var(ELEVATION_METHOD_ENV) else {
        return Ok(None);
    };
    match method.to_lowercase().as_str() {
        "" => Ok(None),
        "sudo" => Ok(Some("sudo")),
        "run0" => Ok(Some("run0")),
        other => Err(ElevationError::InvalidMethod(other.to_string())),
    }
}

fn wrapped(helper: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(helper);
    // sudo would otherwise block on a password prompt nobody can answer
    if helper == "sudo" && !stdin_is_terminal() {
        cmd.arg("-n");
    }
    cmd.arg(program).args(args);
    cmd
}

/// Builds a command running `program` with root privileges.
///
/// The method override is validated first so a typo surfaces even when no
/// elevation turns out to be necessary.
pub fn build_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    let forced = forced_method()?;

    if std::env::var_os(NO_ELEVATION_ENV).is_some() || nix::unistd::getuid().is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    if let Some(helper) = forced {
        if !binary_exists(helper) {
            return Err(ElevationError::MethodNotAvailable(helper.into()));
        }
        return Ok(wrapped(helper, program, args));
    }

    if binary_exists("run0") {
        return Ok(wrapped("run0", program, args));
    }
    if binary_exists("sudo") {
        return Ok(wrapped("sudo", program, args));
    }
    Err(ElevationError::NoHelper)
}

/// Whether stdin is a terminal, i.e. whether a password prompt can be answered.
pub fn stdin_is_terminal() -> bool {
    use std::os::fd::AsFd;
    nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    #[test]
    fn test_binary_exists() {
        assert!(binary_exists("sh"));
        assert!(!binary_exists("nftgate_nonexistent_binary_xyz"));
    }

    #[test]
    fn test_no_elevation_runs_program_directly() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var(NO_ELEVATION_ENV, "1");
            std::env::remove_var(ELEVATION_METHOD_ENV);
        }

        let cmd = build_command("/usr/sbin/nft", &["list", "ruleset"]).unwrap();
        unsafe { std::env::remove_var(NO_ELEVATION_ENV) };

        assert_eq!(cmd.as_std().get_program(), "/usr/sbin/nft");
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(args, ["list", "ruleset"]);
    }

    #[test]
    fn test_invalid_elevation_method() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var(ELEVATION_METHOD_ENV, "invalid_method");
        }

        let result = build_command("nft", &["list", "ruleset"]);

        unsafe {
            std::env::remove_var(ELEVATION_METHOD_ENV);
        }

        assert!(matches!(result, Err(ElevationError::InvalidMethod(_))));
    }

    #[test]
    fn test_elevation_method_case_insensitive() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var(ELEVATION_METHOD_ENV, "SUDO");
        }

        let result = build_command("nft", &["list", "ruleset"]);

        unsafe {
            std::env::remove_var(ELEVATION_METHOD_ENV);
        }

        // Succeeds, or fails because sudo is missing, but never InvalidMethod
        assert!(!matches!(result, Err(ElevationError::InvalidMethod(_))));
    }
}
