//! Where each kind of rule lives
//!
//! Quota and allow-list chains come from configuration. Forwarding always lives in
//! the `ip nat` table and its shadow quotas in `ip filter forward`, because DNAT
//! targets are IPv4-only.

use crate::config::Config;
use crate::core::model::ChainRef;
use serde_json::{Value, json};

/// A base chain together with the hook it must be created with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseChain {
    pub chain: ChainRef,
    pub kind: &'static str,
    pub hook: &'static str,
    pub priority: i32,
}

impl BaseChain {
    fn new(chain: ChainRef, kind: &'static str, hook: &'static str, priority: i32) -> Self {
        Self {
            chain,
            kind,
            hook,
            priority,
        }
    }

    /// nft JSON batch creating the table and the chain (`add` is a no-op for existing objects).
    pub fn create_commands(&self) -> Value {
        let ChainRef {
            family,
            table,
            chain,
        } = &self.chain;
        json!({
            "nftables": [
                { "add": { "table": { "family": family, "name": table } } },
                { "add": { "chain": {
                    "family": family,
                    "table": table,
                    "name": chain,
                    "type": self.kind,
                    "hook": self.hook,
                    "prio": self.priority,
                    "policy": "accept"
                } } }
            ]
        })
    }
}

const PRIO_FILTER: i32 = 0;
const PRIO_DSTNAT: i32 = -100;
const PRIO_SRCNAT: i32 = 100;

/// Every chain nftgate reads or writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub quota: BaseChain,
    pub input: BaseChain,
    pub prerouting: BaseChain,
    pub postrouting: BaseChain,
    pub nat_output: BaseChain,
    pub forward: BaseChain,
}

impl Topology {
    pub fn from_config(config: &Config) -> Self {
        let family = config.table_family.as_str();
        let table = config.table_name.as_str();
        Self {
            quota: BaseChain::new(
                ChainRef::new(family, table, &config.chain_name),
                "filter",
                "output",
                PRIO_FILTER,
            ),
            input: BaseChain::new(
                ChainRef::new(family, table, &config.input_chain),
                "filter",
                "input",
                PRIO_FILTER,
            ),
            prerouting: BaseChain::new(
                ChainRef::new("ip", "nat", "prerouting"),
                "nat",
                "prerouting",
                PRIO_DSTNAT,
            ),
            postrouting: BaseChain::new(
                ChainRef::new("ip", "nat", "postrouting"),
                "nat",
                "postrouting",
                PRIO_SRCNAT,
            ),
            nat_output: BaseChain::new(
                ChainRef::new("ip", "nat", "output"),
                "nat",
                "output",
                PRIO_DSTNAT,
            ),
            forward: BaseChain::new(
                ChainRef::new("ip", "filter", "forward"),
                "filter",
                "forward",
                PRIO_FILTER,
            ),
        }
    }

    /// The three chains a forward installs rules into, in install order.
    pub fn nat_chains(&self) -> [&BaseChain; 3] {
        [&self.prerouting, &self.postrouting, &self.nat_output]
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_topology() {
        let topo = Topology::default();
        assert_eq!(topo.quota.chain.to_string(), "inet filter output");
        assert_eq!(topo.input.chain.to_string(), "inet filter input");
        assert_eq!(topo.forward.chain.to_string(), "ip filter forward");
        assert_eq!(topo.nat_chains()[1].chain.chain, "postrouting");
    }

    #[test]
    fn test_configured_chains() {
        let config = Config {
            table_family: "ip".into(),
            table_name: "quota".into(),
            chain_name: "egress".into(),
            ..Config::default()
        };
        let topo = Topology::from_config(&config);
        assert_eq!(topo.quota.chain, ChainRef::new("ip", "quota", "egress"));
        assert_eq!(topo.quota.hook, "output");
    }

    #[test]
    fn test_create_commands_shape() {
        let cmds = Topology::default().prerouting.create_commands();
        let chain = &cmds["nftables"][1]["add"]["chain"];
        assert_eq!(chain["type"], "nat");
        assert_eq!(chain["prio"], -100);
        assert_eq!(chain["policy"], "accept");
        assert_eq!(cmds["nftables"][0]["add"]["table"]["name"], "nat");
    }
}
