//! Shared test utilities for core module tests
//!
//! [`FakeNft`] is an in-memory firewall speaking the subset of the nft command
//! line nftgate uses, so lifecycle tests run without root or a kernel.
//! This module is only compiled in test mode.

use crate::core::codec::NftRule;
use crate::core::control::{APPLY_ARGS, ControlPlane};
use crate::core::error::{Error, Result};
use crate::core::model::ChainRef;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// Hold it while setting `NFTGATE_*` variables and restore them before releasing.
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe { std::env::set_var("NFTGATE_ELEVATION_METHOD", "sudo") };
/// // ... test ...
/// unsafe { std::env::remove_var("NFTGATE_ELEVATION_METHOD") };
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

type ChainKey = (String, String, String);

fn key(chain: &ChainRef) -> ChainKey {
    (
        chain.family.clone(),
        chain.table.clone(),
        chain.chain.clone(),
    )
}

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct FakeState {
    chains: BTreeMap<ChainKey, Vec<Value>>,
    next_handle: u64,
    mutations: usize,
    fail_at: Option<usize>,
    hooks: Vec<(usize, Hook)>,
    ruleset: String,
    loaded: Vec<String>,
}

/// In-memory firewall implementing [`ControlPlane`]
pub struct FakeNft {
    state: Mutex<FakeState>,
}

impl Default for FakeNft {
    fn default() -> Self {
        Self::new()
    }
}

fn missing(args: &[&str]) -> Error {
    Error::Nftables {
        args: args.iter().map(|a| (*a).to_string()).collect(),
        message: "Error: No such file or directory".to_string(),
        exit_code: Some(1),
    }
}

impl FakeNft {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_handle: 2,
                ..FakeState::default()
            }),
        }
    }

    /// Text returned by `nft list ruleset`.
    pub fn with_ruleset(self, text: &str) -> Self {
        self.state.lock().unwrap().ruleset = text.to_string();
        self
    }

    pub fn has_chain(&self, chain: &ChainRef) -> bool {
        self.state.lock().unwrap().chains.contains_key(&key(chain))
    }

    /// Appends a rule as another tool would, creating the chain if needed.
    pub fn add_foreign_rule(&self, chain: &ChainRef, expr: Value, comment: &str) -> u64 {
        let mut state = self.state.lock().unwrap();
        let handle = state.next_handle;
        state.next_handle += 1;
        let mut rule = json!({
            "family": chain.family,
            "table": chain.table,
            "chain": chain.chain,
            "handle": handle,
            "expr": expr,
        });
        if !comment.is_empty() {
            rule["comment"] = json!(comment);
        }
        state.chains.entry(key(chain)).or_default().push(rule);
        handle
    }

    /// Decoded rules of `chain`, in listing order.
    pub fn rules_in(&self, chain: &ChainRef) -> Vec<NftRule> {
        self.state
            .lock()
            .unwrap()
            .chains
            .get(&key(chain))
            .map(|rules| {
                rules
                    .iter()
                    .map(|r| serde_json::from_value(r.clone()).unwrap())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Simulates traffic: sets the used counter of the quota in rule `handle`.
    pub fn set_quota_used(&self, handle: u64, bytes: u64) {
        let mut state = self.state.lock().unwrap();
        for rule in state.chains.values_mut().flatten() {
            if rule["handle"] != handle {
                continue;
            }
            for expr in rule["expr"].as_array_mut().into_iter().flatten() {
                if let Some(quota) = expr.get_mut("quota") {
                    quota["used"] = json!(bytes);
                    quota["used_unit"] = json!("bytes");
                }
            }
        }
    }

    /// Makes the `n`-th rule mutation from now fail (1 = the next one).
    pub fn fail_nth_mutation(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        state.fail_at = Some(state.mutations + n);
    }

    /// Runs `hook` right after the `n`-th rule mutation from now has been applied.
    ///
    /// Lets a test change the world between two steps of an operation.
    pub fn on_nth_mutation(&self, n: usize, hook: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock().unwrap();
        let at = state.mutations + n;
        state.hooks.push((at, Box::new(hook)));
    }

    /// Rule additions and deletions attempted so far, failed ones included.
    pub fn mutation_count(&self) -> usize {
        self.state.lock().unwrap().mutations
    }

    /// Batches loaded with `nft -f -`.
    pub fn loaded_batches(&self) -> Vec<String> {
        self.state.lock().unwrap().loaded.clone()
    }

    fn handle(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        match args {
            ["-j", "-a", "list", "chain", family, table, chain] => {
                let key = ((*family).to_string(), (*table).to_string(), (*chain).to_string());
                let rules = state.chains.get(&key).ok_or_else(|| missing(args))?;
                let mut entries = vec![
                    json!({"metainfo": {"json_schema_version": 1}}),
                    json!({"chain": {"family": family, "table": table, "name": chain, "handle": 1}}),
                ];
                entries.extend(rules.iter().map(|r| json!({ "rule": r })));
                Ok(json!({ "nftables": entries }).to_string())
            }
            ["-j", "-f", "-"] => {
                let batch: Value = serde_json::from_str(stdin.unwrap_or_default())?;
                for cmd in batch["nftables"].as_array().into_iter().flatten() {
                    if let Some(chain) = cmd["add"].get("chain") {
                        let key = (
                            chain["family"].as_str().unwrap_or_default().to_string(),
                            chain["table"].as_str().unwrap_or_default().to_string(),
                            chain["name"].as_str().unwrap_or_default().to_string(),
                        );
                        state.chains.entry(key).or_default();
                    }
                }
                Ok(String::new())
            }
            args if args == APPLY_ARGS => {
                state.mutations += 1;
                if state.fail_at == Some(state.mutations) {
                    return Err(Error::Nftables {
                        args: args.iter().map(|a| (*a).to_string()).collect(),
                        message: "Error: Could not process rule: Operation not permitted"
                            .to_string(),
                        exit_code: Some(1),
                    });
                }
                let batch: Value = serde_json::from_str(stdin.unwrap_or_default())?;
                let mut echo = Vec::new();
                for cmd in batch["nftables"].as_array().into_iter().flatten() {
                    echo.push(Self::apply(&mut state, cmd, args)?);
                }
                let current = state.mutations;
                let (due, pending) = std::mem::take(&mut state.hooks)
                    .into_iter()
                    .partition::<Vec<_>, _>(|(at, _)| *at == current);
                state.hooks = pending;
                for (_, hook) in due {
                    hook();
                }
                Ok(json!({ "nftables": echo }).to_string())
            }
            ["list", "ruleset"] => Ok(state.ruleset.clone()),
            ["-f", "-"] => {
                state.loaded.push(stdin.unwrap_or_default().to_string());
                Ok(String::new())
            }
            _ => Err(Error::Internal(format!("FakeNft: unsupported {args:?}"))),
        }
    }

    fn apply(state: &mut FakeState, cmd: &Value, args: &[&str]) -> Result<Value> {
        let (verb, body) = cmd
            .as_object()
            .and_then(|o| o.iter().next())
            .ok_or_else(|| Error::Internal("FakeNft: empty command".into()))?;
        let rule = &body["rule"];
        let key = (
            rule["family"].as_str().unwrap_or_default().to_string(),
            rule["table"].as_str().unwrap_or_default().to_string(),
            rule["chain"].as_str().unwrap_or_default().to_string(),
        );

        match verb.as_str() {
            "add" | "insert" => {
                let handle = state.next_handle;
                let rules = state.chains.get_mut(&key).ok_or_else(|| missing(args))?;
                let mut stored = rule.clone();
                stored["handle"] = json!(handle);
                if verb == "insert" {
                    rules.insert(0, stored.clone());
                } else {
                    rules.push(stored.clone());
                }
                state.next_handle += 1;
                let mut echo = serde_json::Map::new();
                echo.insert(verb.clone(), json!({ "rule": stored }));
                Ok(Value::Object(echo))
            }
            "delete" => {
                let rules = state.chains.get_mut(&key).ok_or_else(|| missing(args))?;
                let pos = rules
                    .iter()
                    .position(|r| r["handle"] == rule["handle"])
                    .ok_or_else(|| missing(args))?;
                rules.remove(pos);
                Ok(cmd.clone())
            }
            other => Err(Error::Internal(format!("FakeNft: unsupported verb {other}"))),
        }
    }
}

impl ControlPlane for FakeNft {
    fn run(
        &self,
        args: &[&str],
        stdin: Option<&str>,
    ) -> impl Future<Output = Result<String>> + Send {
        let result = self.handle(args, stdin);
        async move { result }
    }
}
