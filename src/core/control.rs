//! The nft process boundary
//!
//! [`ControlPlane`] is the only place nftgate talks to the kernel firewall. The
//! production implementation, [`NftClient`], spawns the configured `nft` binary
//! (elevated if needed) with a hard timeout. Everything above this module works
//! against the trait so lifecycle logic can be exercised with an in-memory firewall.

use crate::core::codec::{self, NftRule};
use crate::core::compiler::Op;
use crate::core::error::{Error, Result};
use crate::core::model::ChainRef;
use crate::core::topology::BaseChain;
use serde_json::Value;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, error, info};

/// Argument vector for rule mutations: JSON on stdin, echo the result with handles.
pub const APPLY_ARGS: [&str; 5] = ["-j", "-e", "-a", "-f", "-"];

/// Executes nft commands
pub trait ControlPlane: Send + Sync {
    /// Runs nft with `args`, feeding `stdin` if given, and returns stdout.
    ///
    /// # Errors
    ///
    /// [`Error::Nftables`] on non-zero exit, [`Error::Timeout`] if the process
    /// does not finish in time.
    fn run(
        &self,
        args: &[&str],
        stdin: Option<&str>,
    ) -> impl Future<Output = Result<String>> + Send;
}

/// Spawns the real `nft` binary
#[derive(Debug, Clone)]
pub struct NftClient {
    binary: String,
    timeout: Duration,
}

impl NftClient {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            config.nft_binary.clone(),
            Duration::from_secs(config.command_timeout_secs),
        )
    }

    async fn execute(&self, args: Vec<String>, stdin: Option<String>) -> Result<String> {
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        debug!("nft {}", args.join(" "));

        let mut child = crate::elevation::build_command(&self.binary, &argv)?
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!("Failed to spawn {}: {e}", self.binary);
                Error::Nftables {
                    args: args.clone(),
                    message: format!("failed to spawn {}: {e}", self.binary),
                    exit_code: None,
                }
            })?;

        // Feeding stdin counts against the timeout too: nft may stop reading
        // before a large batch fits in the pipe.
        let io = async move {
            if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
                use tokio::io::AsyncWriteExt;
                pipe.write_all(input.as_bytes()).await?;
                // Dropping the pipe closes nft's stdin
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(self.timeout, io).await {
            Ok(result) => result?,
            Err(_) => {
                error!("nft {} timed out", args.join(" "));
                return Err(Error::Timeout {
                    args,
                    secs: self.timeout.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = format!("{stdout}{stderr}").trim().to_string();
            Err(Error::Nftables {
                args,
                message,
                exit_code: output.status.code(),
            })
        }
    }
}

impl ControlPlane for NftClient {
    fn run(
        &self,
        args: &[&str],
        stdin: Option<&str>,
    ) -> impl Future<Output = Result<String>> + Send {
        let args: Vec<String> = args.iter().map(|a| (*a).to_string()).collect();
        let stdin = stdin.map(str::to_string);
        self.execute(args, stdin)
    }
}

/// Lists the rules of `chain`; `None` if its table or chain does not exist.
pub async fn list_chain<C: ControlPlane>(cp: &C, chain: &ChainRef) -> Result<Option<Vec<NftRule>>> {
    let [family, table, name] = chain.args();
    match cp
        .run(&["-j", "-a", "list", "chain", family, table, name], None)
        .await
    {
        Ok(raw) => codec::parse_listing(&raw, chain).map(Some),
        Err(e) if e.is_missing_object() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Lists the rules of `chain`, treating an absent chain as empty.
pub async fn list_rules<C: ControlPlane>(cp: &C, chain: &ChainRef) -> Result<Vec<NftRule>> {
    Ok(list_chain(cp, chain).await?.unwrap_or_default())
}

/// Creates the table and base chain if the chain is not listable yet.
pub async fn ensure_chain<C: ControlPlane>(cp: &C, base: &BaseChain) -> Result<()> {
    if list_chain(cp, &base.chain).await?.is_some() {
        return Ok(());
    }
    info!("Creating missing chain {}", base.chain);
    let batch = serde_json::to_string(&base.create_commands())?;
    cp.run(&["-j", "-f", "-"], Some(&batch)).await?;
    Ok(())
}

/// Applies one operation; returns the handle nft assigned when it adds a rule.
///
/// # Errors
///
/// An add whose echo carries no handle is a [`Error::Decode`]: without the handle
/// the rule could not be rolled back.
pub async fn apply<C: ControlPlane>(cp: &C, op: &Op) -> Result<Option<u64>> {
    let batch = serde_json::to_string(&op.to_command())?;
    debug!("{op}");
    let echo = cp.run(&APPLY_ARGS, Some(&batch)).await?;
    match op {
        Op::Add { .. } => echoed_handle(&echo)
            .map(Some)
            .ok_or_else(|| Error::Decode(format!("nft did not echo a handle for: {op}"))),
        Op::Delete { .. } => Ok(None),
    }
}

/// Extracts the handle of the first rule in an echoed command batch.
pub fn echoed_handle(echo: &str) -> Option<u64> {
    let value: Value = serde_json::from_str(echo).ok()?;
    value
        .get("nftables")?
        .as_array()?
        .iter()
        .filter_map(Value::as_object)
        .flat_map(|entry| entry.values())
        .find_map(|cmd| cmd.get("rule")?.get("handle")?.as_u64())
}

/// Full ruleset in nft's text syntax.
pub async fn list_ruleset<C: ControlPlane>(cp: &C) -> Result<String> {
    cp.run(&["list", "ruleset"], None).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echoed_handle_add() {
        let echo = r#"{"nftables": [{"add": {"rule": {"family": "ip", "table": "nat", "chain": "prerouting", "handle": 42, "expr": []}}}]}"#;
        assert_eq!(echoed_handle(echo), Some(42));
    }

    #[test]
    fn test_echoed_handle_insert_with_metainfo() {
        let echo = r#"{"nftables": [{"metainfo": {"version": "1.0.9"}}, {"insert": {"rule": {"handle": 7}}}]}"#;
        assert_eq!(echoed_handle(echo), Some(7));
    }

    #[test]
    fn test_echoed_handle_missing() {
        assert_eq!(echoed_handle(""), None);
        assert_eq!(echoed_handle(r#"{"nftables": []}"#), None);
    }
}
