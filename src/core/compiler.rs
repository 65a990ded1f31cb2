//! Compilation of domain intents into ordered rule operations
//!
//! Every function here is pure: it returns the [`Op`]s an intent needs and
//! touches nothing. [`crate::core::txn`] executes them and unwinds on failure.
//! nft has no in-place rule edit, so every change is expressed as deletes of the
//! existing rules followed by adds of their replacements.

use crate::core::codec::NftRule;
use crate::core::expr::{ByteUnit, Expr, Match, Nat, Operand, Quota};
use crate::core::marker;
use crate::core::model::{ChainRef, ForwardSpec, Protocol};
use crate::core::topology::Topology;
use serde_json::{Map, Value, json};
use std::fmt;

const BYTES_PER_MBYTE: u64 = 1_000_000;

/// Where an added rule goes in its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Append,
    /// Head of the chain (`insert rule`)
    Insert,
}

/// One low-level rule mutation
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Add {
        chain: ChainRef,
        expr: Vec<Expr>,
        comment: String,
        position: Position,
    },
    /// Carries the whole rule so the deletion can be inverted.
    Delete { rule: NftRule },
}

impl Op {
    pub fn append(chain: &ChainRef, expr: Vec<Expr>, comment: impl Into<String>) -> Self {
        Op::Add {
            chain: chain.clone(),
            expr,
            comment: comment.into(),
            position: Position::Append,
        }
    }

    pub fn delete(rule: NftRule) -> Self {
        Op::Delete { rule }
    }

    pub fn chain(&self) -> ChainRef {
        match self {
            Op::Add { chain, .. } => chain.clone(),
            Op::Delete { rule } => rule.chain_ref(),
        }
    }

    /// nft JSON command batch for this operation.
    pub fn to_command(&self) -> Value {
        let command = match self {
            Op::Add {
                chain,
                expr,
                comment,
                position,
            } => {
                let mut rule = Map::new();
                rule.insert("family".into(), json!(chain.family));
                rule.insert("table".into(), json!(chain.table));
                rule.insert("chain".into(), json!(chain.chain));
                rule.insert("expr".into(), json!(expr));
                if !comment.is_empty() {
                    rule.insert("comment".into(), json!(comment));
                }
                let verb = match position {
                    Position::Append => "add",
                    Position::Insert => "insert",
                };
                let mut wrapper = Map::new();
                wrapper.insert(verb.into(), json!({ "rule": rule }));
                Value::Object(wrapper)
            }
            Op::Delete { rule } => json!({
                "delete": { "rule": {
                    "family": rule.family,
                    "table": rule.table,
                    "chain": rule.chain,
                    "handle": rule.handle
                } }
            }),
        };
        json!({ "nftables": [command] })
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Add {
                chain, comment, ..
            } => write!(f, "add rule {chain} \"{comment}\""),
            Op::Delete { rule } => {
                write!(f, "delete rule {} handle {}", rule.chain_ref(), rule.handle)
            }
        }
    }
}

/// Converts a byte limit to whole megabytes, rounding up, never below 1.
pub fn mbytes_ceil(bytes: u64) -> u64 {
    bytes.div_ceil(BYTES_PER_MBYTE).max(1)
}

fn quota_over(bytes: u64) -> Expr {
    Expr::Quota(Quota {
        val: mbytes_ceil(bytes),
        val_unit: ByteUnit::Mbytes,
        used: 0,
        used_unit: ByteUnit::Bytes,
        inv: true,
    })
}

fn eq(left: Operand, right: Operand) -> Expr {
    Expr::Match(Match::eq(left, right))
}

/// Transport-port predicate for one protocol selector.
fn port_match(protocol: Protocol, field: &str, port: u16) -> Vec<Expr> {
    let port = Operand::Number(u64::from(port));
    match protocol {
        Protocol::Tcp | Protocol::Udp => vec![eq(Operand::payload(protocol.as_str(), field), port)],
        Protocol::Both => vec![
            eq(Operand::meta("l4proto"), both_protocols()),
            eq(Operand::payload("th", field), port),
        ],
    }
}

fn both_protocols() -> Operand {
    Operand::Set(vec![Operand::Text("tcp".into()), Operand::Text("udp".into())])
}

fn ip_match(field: &str, addr: impl fmt::Display) -> Expr {
    eq(Operand::payload("ip", field), Operand::Text(addr.to_string()))
}

/// Quota on a local source port: `<proto> sport P quota over N mbytes drop`.
pub fn compile_add_quota(
    topo: &Topology,
    port: u16,
    protocol: Protocol,
    bytes: u64,
    comment: &str,
) -> Vec<Op> {
    let mut expr = port_match(protocol, "sport", port);
    expr.push(quota_over(bytes));
    expr.push(Expr::Drop);
    vec![Op::append(&topo.quota.chain, expr, comment)]
}

/// Replaces a quota rule by a copy with a fresh counter and the limit `bytes`.
///
/// Every predicate of the old rule is kept, so a rule on a port set stays one
/// rule on the same set.
pub fn compile_recreate_quota(old: &NftRule, bytes: u64) -> Vec<Op> {
    let mut replaced = false;
    let expr = old
        .expr
        .iter()
        .map(|e| match e {
            Expr::Quota(_) if !replaced => {
                replaced = true;
                quota_over(bytes)
            }
            other => other.clone(),
        })
        .collect();
    vec![
        Op::delete(old.clone()),
        Op::append(&old.chain_ref(), expr, old.comment.clone()),
    ]
}

pub fn compile_delete_rules(rules: &[NftRule]) -> Vec<Op> {
    rules.iter().cloned().map(Op::delete).collect()
}

/// Accept rule for an inbound port, inserted at the head of the input chain.
pub fn compile_allow_port(topo: &Topology, port: u16) -> Vec<Op> {
    vec![Op::Add {
        chain: topo.input.chain.clone(),
        expr: vec![
            eq(
                Operand::payload("tcp", "dport"),
                Operand::Number(u64::from(port)),
            ),
            Expr::Accept,
        ],
        comment: marker::MANAGED.to_string(),
        position: Position::Insert,
    }]
}

/// The three rules of a forward: ingress DNAT, egress masquerade, loopback DNAT.
pub fn compile_add_forward(topo: &Topology, spec: &ForwardSpec) -> Vec<Op> {
    let comment = marker::encode_forward(spec.src_port, spec.limit_mbps, &spec.comment);
    let dnat = || {
        let mut expr = port_match(spec.protocol, "dport", spec.src_port);
        expr.push(Expr::Dnat(Nat {
            addr: Some(spec.dst_ip.to_string()),
            port: Some(spec.dst_port),
            family: None,
        }));
        expr
    };

    let mut masquerade = vec![ip_match("daddr", spec.dst_ip)];
    masquerade.extend(port_match(Protocol::Both, "dport", spec.dst_port));
    masquerade.push(Expr::Masquerade);

    vec![
        Op::append(&topo.prerouting.chain, dnat(), comment.clone()),
        Op::append(&topo.postrouting.chain, masquerade, comment.clone()),
        Op::append(&topo.nat_output.chain, dnat(), comment),
    ]
}

/// Edit is delete-by-marker followed by a fresh add.
pub fn compile_edit_forward(existing: &[NftRule], topo: &Topology, spec: &ForwardSpec) -> Vec<Op> {
    let mut ops = compile_delete_rules(existing);
    ops.extend(compile_add_forward(topo, spec));
    ops
}

/// Quota on traffic returning from a forward's backend, counted in the forward chain.
pub fn compile_shadow_quota(topo: &Topology, spec: &ForwardSpec, bytes: u64) -> Vec<Op> {
    let mut expr = vec![ip_match("saddr", spec.dst_ip)];
    expr.extend(port_match(spec.protocol, "sport", spec.dst_port));
    expr.push(quota_over(bytes));
    expr.push(Expr::Drop);
    vec![Op::append(
        &topo.forward.chain,
        expr,
        marker::encode_forward_quota(spec.src_port),
    )]
}

/// Shadow resync: drop every existing shadow rule for the port, then add one.
pub fn compile_resync_shadow(
    existing: &[NftRule],
    topo: &Topology,
    spec: &ForwardSpec,
    bytes: u64,
) -> Vec<Op> {
    let mut ops = compile_delete_rules(existing);
    ops.extend(compile_shadow_quota(topo, spec, bytes));
    ops
}
