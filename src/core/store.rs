//! Persistence of disabled forwards
//!
//! A disabled forward has no presence in the firewall, so its definition is kept
//! in a JSON file of the form `{"rules": [...]}`. The file is always rewritten as a
//! whole. A missing file is an empty store.

use crate::core::error::{Error, Result};
use crate::core::model::{ForwardingRule, Protocol, forward_id};
use crate::validators::forward_comment;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    rules: Vec<StoredForward>,
}

/// On-disk record of one disabled forward
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredForward {
    src_port: u16,
    dst_ip: Ipv4Addr,
    dst_port: u16,
    #[serde(default)]
    protocol: Protocol,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    limit_mbps: u32,
}

impl From<&ForwardingRule> for StoredForward {
    fn from(rule: &ForwardingRule) -> Self {
        Self {
            src_port: rule.src_port,
            dst_ip: rule.dst_ip,
            dst_port: rule.dst_port,
            protocol: rule.protocol,
            comment: rule.comment.clone(),
            limit_mbps: rule.limit_mbps,
        }
    }
}

impl From<StoredForward> for ForwardingRule {
    /// Identity and state are always re-derived; the file is not trusted for them.
    fn from(stored: StoredForward) -> Self {
        Self {
            id: forward_id(stored.src_port),
            src_port: stored.src_port,
            dst_ip: stored.dst_ip,
            dst_port: stored.dst_port,
            protocol: stored.protocol,
            enabled: false,
            managed: true,
            comment: forward_comment(&stored.comment, stored.src_port, stored.limit_mbps),
            limit_mbps: stored.limit_mbps,
            pre_handle: None,
            post_handle: None,
        }
    }
}

/// File-backed list of disabled forwards
#[derive(Debug, Clone)]
pub struct DisabledForwardStore {
    path: PathBuf,
}

impl DisabledForwardStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Loads every stored forward, all with `enabled = false`.
    ///
    /// # Errors
    ///
    /// [`Error::Store`] if the file exists but cannot be read or parsed.
    pub async fn load(&self) -> Result<Vec<ForwardingRule>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Store(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )));
            }
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }

        let file: StoreFile = serde_json::from_str(&raw)
            .map_err(|e| Error::Store(format!("cannot parse {}: {e}", self.path.display())))?;
        debug!(
            "Loaded {} disabled forwards from {}",
            file.rules.len(),
            self.path.display()
        );
        Ok(file.rules.into_iter().map(ForwardingRule::from).collect())
    }

    /// Replaces the whole file with `rules`, creating parent directories as needed.
    pub async fn save(&self, rules: &[ForwardingRule]) -> Result<()> {
        let file = StoreFile {
            rules: rules.iter().map(StoredForward::from).collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        crate::utils::write_atomic(&self.path, json.as_bytes())
            .map_err(|e| Error::Store(format!("cannot write {}: {e}", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(src_port: u16) -> ForwardingRule {
        ForwardingRule {
            id: forward_id(src_port),
            src_port,
            dst_ip: Ipv4Addr::new(10, 0, 0, 5),
            dst_port: 22,
            protocol: Protocol::Tcp,
            enabled: true,
            managed: true,
            comment: "ssh".into(),
            limit_mbps: 25,
            pre_handle: Some(3),
            post_handle: Some(4),
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DisabledForwardStore::new(dir.path().join("none.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_creates_parents_and_reloads_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let store = DisabledForwardStore::new(dir.path().join("nested/dir/disabled.json"));
        store.save(&[rule(9000)]).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        let r = &loaded[0];
        assert_eq!(r.id, "fwd_9000");
        assert!(!r.enabled);
        assert_eq!(r.limit_mbps, 25);
        assert_eq!(r.pre_handle, None);
        assert_eq!(r.comment, "ssh");
    }

    #[tokio::test]
    async fn test_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disabled.json");
        let store = DisabledForwardStore::new(&path);
        store.save(&[rule(9000)]).await.unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let record = &value["rules"][0];
        assert_eq!(record["src_port"], 9000);
        assert_eq!(record["dst_ip"], "10.0.0.5");
        assert_eq!(record["protocol"], "tcp");
        assert!(record.get("enabled").is_none());
        assert!(record.get("pre_handle").is_none());
    }

    #[tokio::test]
    async fn test_hand_edited_identity_is_rederived() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disabled.json");
        std::fs::write(
            &path,
            r#"{"rules":[{"id":"bogus","enabled":true,"src_port":7000,"dst_ip":"192.168.1.2","dst_port":80,"comment":"web\"; x"}]}"#,
        )
        .unwrap();

        let loaded = DisabledForwardStore::new(&path).load().await.unwrap();
        assert_eq!(loaded[0].id, "fwd_7000");
        assert!(!loaded[0].enabled);
        assert_eq!(loaded[0].protocol, Protocol::Both);
        assert_eq!(loaded[0].comment, "web x");
    }

    #[tokio::test]
    async fn test_corrupt_file_is_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disabled.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = DisabledForwardStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }
}
