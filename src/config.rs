//! Runtime configuration
//!
//! Resolution order: the JSON file given with `--config`, else
//! `/etc/nftgate/config.json` if it exists, else built-in defaults. `NFTGATE_*`
//! environment variables override whatever the file says.

use crate::core::error::{Error, Result};
use crate::utils::get_state_dir;
use crate::validators::validate_identifier;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Configuration file read when `--config` is not given
pub const SYSTEM_CONFIG_PATH: &str = "/etc/nftgate/config.json";

const MIN_TIMEOUT_SECS: u64 = 1;
const MAX_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub nft_binary: String,
    /// Family of the quota and input chains (`ip`, `ip6` or `inet`)
    pub table_family: String,
    pub table_name: String,
    /// Chain holding quota rules
    pub chain_name: String,
    /// Chain holding allowed-port rules
    pub input_chain: String,
    pub disabled_forwards_path: PathBuf,
    pub ruleset_path: PathBuf,
    pub audit_log_path: Option<PathBuf>,
    /// Clamped to 1..=120 seconds
    pub command_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let state_dir = get_state_dir();
        Self {
            nft_binary: "/usr/sbin/nft".to_string(),
            table_family: "inet".to_string(),
            table_name: "filter".to_string(),
            chain_name: "output".to_string(),
            input_chain: "input".to_string(),
            disabled_forwards_path: state_dir.join("disabled-forwards.json"),
            ruleset_path: state_dir.join("ruleset.nft"),
            audit_log_path: None,
            command_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Loads, overrides from the environment, and validates.
    ///
    /// # Errors
    ///
    /// Returns `Err` if an explicitly given file is missing, any file fails to
    /// parse, or the result does not validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let system = Path::new(SYSTEM_CONFIG_PATH);
                if system.exists() {
                    Self::from_file(system)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        config.command_timeout_secs = config
            .command_timeout_secs
            .clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            Error::validation("config", format!("cannot parse {}: {e}", path.display()))
        })
    }

    fn apply_env(&mut self) {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        if let Some(v) = var("NFTGATE_NFT_BINARY") {
            self.nft_binary = v;
        }
        if let Some(v) = var("NFTGATE_TABLE_FAMILY") {
            self.table_family = v;
        }
        if let Some(v) = var("NFTGATE_TABLE_NAME") {
            self.table_name = v;
        }
        if let Some(v) = var("NFTGATE_CHAIN_NAME") {
            self.chain_name = v;
        }
        if let Some(v) = var("NFTGATE_INPUT_CHAIN") {
            self.input_chain = v;
        }
        if let Some(v) = var("NFTGATE_DISABLED_FORWARDS_PATH") {
            self.disabled_forwards_path = PathBuf::from(v);
        }
        if let Some(v) = var("NFTGATE_RULESET_PATH") {
            self.ruleset_path = PathBuf::from(v);
        }
        if let Some(v) = var("NFTGATE_AUDIT_LOG_PATH") {
            self.audit_log_path = Some(PathBuf::from(v));
        }
        if let Some(secs) = var("NFTGATE_COMMAND_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.command_timeout_secs = secs;
        }
    }

    /// Rejects identifiers nft would misparse and unsupported families.
    pub fn validate(&self) -> Result<()> {
        validate_identifier("table_family", &self.table_family)?;
        validate_identifier("table_name", &self.table_name)?;
        validate_identifier("chain_name", &self.chain_name)?;
        validate_identifier("input_chain", &self.input_chain)?;

        if !matches!(self.table_family.as_str(), "ip" | "ip6" | "inet") {
            return Err(Error::validation(
                "table_family",
                format!("unsupported family '{}'", self.table_family),
            ));
        }
        if self.nft_binary.trim().is_empty() {
            return Err(Error::validation("nft_binary", "must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    const ENV_KEYS: [&str; 3] = [
        "NFTGATE_TABLE_NAME",
        "NFTGATE_COMMAND_TIMEOUT_SECS",
        "NFTGATE_AUDIT_LOG_PATH",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            // SAFETY: callers hold ENV_VAR_MUTEX
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.nft_binary, "/usr/sbin/nft");
        assert_eq!(config.table_family, "inet");
        assert_eq!(config.chain_name, "output");
        assert_eq!(config.command_timeout_secs, 10);
        assert!(config.audit_log_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"table_name": "quota", "command_timeout_secs": 999}"#).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.table_name, "quota");
        assert_eq!(config.input_chain, "input");
        assert_eq!(config.command_timeout_secs, 120);
    }

    #[test]
    fn test_env_overrides_file() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"table_name": "quota"}"#).unwrap();

        // SAFETY: ENV_VAR_MUTEX is held
        unsafe {
            std::env::set_var("NFTGATE_TABLE_NAME", "edge");
            std::env::set_var("NFTGATE_COMMAND_TIMEOUT_SECS", "0");
            std::env::set_var("NFTGATE_AUDIT_LOG_PATH", "/tmp/nftgate-audit.log");
        }
        let config = Config::load(Some(&path));
        clear_env();

        let config = config.unwrap();
        assert_eq!(config.table_name, "edge");
        assert_eq!(config.command_timeout_secs, 1);
        assert_eq!(
            config.audit_log_path.as_deref(),
            Some(Path::new("/tmp/nftgate-audit.log"))
        );
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.json"))).is_err());
    }

    #[test]
    fn test_rejects_bad_identifiers() {
        let config = Config {
            chain_name: "output; flush ruleset".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            table_family: "bridge".into(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::Validation { field, .. }) if field == "table_family"
        ));
    }
}
