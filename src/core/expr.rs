//! Typed model of nftables JSON rule expressions
//!
//! nft represents every statement of a rule as a single-key object, for example
//! `{"match": {...}}`, `{"quota": {...}}` or `{"accept": null}`. [`Expr`] is a closed
//! union over the kinds this crate interprets. Anything else is kept verbatim in
//! [`Expr::Unrecognized`] so a rule can be re-added unchanged during rollback.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};

/// Byte units nft uses for quota values (decimal multipliers)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, strum::AsRefStr,
)]
pub enum ByteUnit {
    #[strum(serialize = "bytes")]
    Bytes,
    #[strum(serialize = "kbytes")]
    Kbytes,
    #[strum(serialize = "mbytes")]
    Mbytes,
    #[strum(serialize = "gbytes")]
    Gbytes,
    #[strum(serialize = "tbytes")]
    Tbytes,
}

impl ByteUnit {
    pub const fn multiplier(self) -> u64 {
        match self {
            ByteUnit::Bytes => 1,
            ByteUnit::Kbytes => 1_000,
            ByteUnit::Mbytes => 1_000_000,
            ByteUnit::Gbytes => 1_000_000_000,
            ByteUnit::Tbytes => 1_000_000_000_000,
        }
    }

    /// Unknown or missing unit tags count as plain bytes.
    pub fn from_tag(tag: Option<&str>) -> Self {
        tag.and_then(|t| t.parse().ok()).unwrap_or(ByteUnit::Bytes)
    }

    pub fn to_bytes(self, value: u64) -> u64 {
        value.saturating_mul(self.multiplier())
    }
}

/// One side of a `match` expression
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Header field, e.g. `tcp dport` or `th sport`
    Payload { protocol: String, field: String },
    /// Meta key, e.g. `meta l4proto`
    Meta { key: String },
    Number(u64),
    Text(String),
    /// Anonymous set `{"set": [...]}`
    Set(Vec<Operand>),
    /// Literal array `[...]`
    List(Vec<Operand>),
    Other(Value),
}

impl Operand {
    pub fn payload(protocol: &str, field: &str) -> Self {
        Operand::Payload {
            protocol: protocol.to_string(),
            field: field.to_string(),
        }
    }

    pub fn meta(key: &str) -> Self {
        Operand::Meta {
            key: key.to_string(),
        }
    }

    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Number(n) => n
                .as_u64()
                .map_or_else(|| Operand::Other(value.clone()), Operand::Number),
            Value::String(s) => Operand::Text(s.clone()),
            Value::Array(items) => Operand::List(items.iter().map(Operand::from_json).collect()),
            Value::Object(map) if map.len() == 1 => {
                if let Some(Value::Object(p)) = map.get("payload")
                    && let (Some(protocol), Some(field)) = (
                        p.get("protocol").and_then(Value::as_str),
                        p.get("field").and_then(Value::as_str),
                    )
                {
                    return Operand::payload(protocol, field);
                }
                if let Some(Value::Object(m)) = map.get("meta")
                    && let Some(key) = m.get("key").and_then(Value::as_str)
                {
                    return Operand::meta(key);
                }
                if let Some(Value::Array(items)) = map.get("set") {
                    return Operand::Set(items.iter().map(Operand::from_json).collect());
                }
                Operand::Other(value.clone())
            }
            _ => Operand::Other(value.clone()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Operand::Payload { protocol, field } => {
                json!({ "payload": { "protocol": protocol, "field": field } })
            }
            Operand::Meta { key } => json!({ "meta": { "key": key } }),
            Operand::Number(n) => json!(n),
            Operand::Text(s) => json!(s),
            Operand::Set(items) => {
                json!({ "set": items.iter().map(Operand::to_json).collect::<Vec<_>>() })
            }
            Operand::List(items) => Value::Array(items.iter().map(Operand::to_json).collect()),
            Operand::Other(v) => v.clone(),
        }
    }

    /// Enumerates numeric values of a scalar, set or array, in order.
    pub fn numbers(&self) -> Vec<u64> {
        match self {
            Operand::Number(n) => vec![*n],
            Operand::Set(items) | Operand::List(items) => items
                .iter()
                .filter_map(|i| match i {
                    Operand::Number(n) => Some(*n),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Enumerates textual values of a scalar, set or array, in order.
    pub fn texts(&self) -> Vec<&str> {
        match self {
            Operand::Text(s) => vec![s.as_str()],
            Operand::Set(items) | Operand::List(items) => items
                .iter()
                .filter_map(|i| match i {
                    Operand::Text(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Relational match `left op right`
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub op: String,
    pub left: Operand,
    pub right: Operand,
}

impl Match {
    pub fn eq(left: Operand, right: Operand) -> Self {
        Self {
            op: "==".to_string(),
            left,
            right,
        }
    }
}

/// `quota [over] <val> <unit> [used <used> <unit>]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub val: u64,
    pub val_unit: ByteUnit,
    pub used: u64,
    pub used_unit: ByteUnit,
    /// `over` flag: the statement matches once the quota is exhausted
    pub inv: bool,
}

impl Quota {
    pub fn limit_bytes(&self) -> u64 {
        self.val_unit.to_bytes(self.val)
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_unit.to_bytes(self.used)
    }
}

/// Destination NAT target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nat {
    pub addr: Option<String>,
    pub port: Option<u16>,
    pub family: Option<String>,
}

/// One statement of an nft rule
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Match(Match),
    Quota(Quota),
    Dnat(Nat),
    Masquerade,
    Accept,
    Drop,
    /// Any statement kind not interpreted here, kept verbatim
    Unrecognized { key: String, body: Value },
}

impl Expr {
    pub fn from_json(value: &Value) -> Self {
        let Some(map) = value.as_object() else {
            return Expr::Unrecognized {
                key: String::new(),
                body: value.clone(),
            };
        };
        let Some((key, body)) = single_entry(map) else {
            return Expr::Unrecognized {
                key: String::new(),
                body: value.clone(),
            };
        };

        let parsed = match key.as_str() {
            "match" => parse_match(body).map(Expr::Match),
            "quota" => parse_quota(body).map(Expr::Quota),
            "dnat" => Some(Expr::Dnat(parse_nat(body))),
            "masquerade" => Some(Expr::Masquerade),
            "accept" => Some(Expr::Accept),
            "drop" => Some(Expr::Drop),
            _ => None,
        };

        parsed.unwrap_or_else(|| Expr::Unrecognized {
            key: key.clone(),
            body: body.clone(),
        })
    }

    pub fn to_json(&self) -> Value {
        match self {
            Expr::Match(m) => json!({
                "match": { "op": m.op, "left": m.left.to_json(), "right": m.right.to_json() }
            }),
            Expr::Quota(q) => json!({
                "quota": {
                    "val": q.val,
                    "val_unit": q.val_unit.as_ref(),
                    "used": q.used,
                    "used_unit": q.used_unit.as_ref(),
                    "inv": q.inv
                }
            }),
            Expr::Dnat(nat) => {
                let mut body = Map::new();
                if let Some(family) = &nat.family {
                    body.insert("family".into(), json!(family));
                }
                if let Some(addr) = &nat.addr {
                    body.insert("addr".into(), json!(addr));
                }
                if let Some(port) = nat.port {
                    body.insert("port".into(), json!(port));
                }
                json!({ "dnat": body })
            }
            Expr::Masquerade => json!({ "masquerade": null }),
            Expr::Accept => json!({ "accept": null }),
            Expr::Drop => json!({ "drop": null }),
            Expr::Unrecognized { key, body } if key.is_empty() => body.clone(),
            Expr::Unrecognized { key, body } => {
                let mut map = Map::new();
                map.insert(key.clone(), body.clone());
                Value::Object(map)
            }
        }
    }
}

impl Serialize for Expr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Expr::from_json(&value))
    }
}

fn single_entry(map: &Map<String, Value>) -> Option<(&String, &Value)> {
    if map.len() == 1 { map.iter().next() } else { None }
}

fn parse_match(body: &Value) -> Option<Match> {
    let obj = body.as_object()?;
    Some(Match {
        op: obj
            .get("op")
            .and_then(Value::as_str)
            .unwrap_or("==")
            .to_string(),
        left: Operand::from_json(obj.get("left")?),
        right: Operand::from_json(obj.get("right")?),
    })
}

fn parse_quota(body: &Value) -> Option<Quota> {
    let obj = body.as_object()?;
    Some(Quota {
        val: obj.get("val").and_then(Value::as_u64)?,
        val_unit: ByteUnit::from_tag(obj.get("val_unit").and_then(Value::as_str)),
        used: obj.get("used").and_then(Value::as_u64).unwrap_or(0),
        used_unit: ByteUnit::from_tag(obj.get("used_unit").and_then(Value::as_str)),
        inv: obj.get("inv").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn parse_nat(body: &Value) -> Nat {
    let addr = body.get("addr").and_then(Value::as_str).map(String::from);
    let port = body
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok());
    let family = body.get("family").and_then(Value::as_str).map(String::from);
    Nat { addr, port, family }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_match() {
        let v = json!({"match": {"op": "==", "left": {"payload": {"protocol": "th", "field": "sport"}}, "right": 8080}});
        let Expr::Match(m) = Expr::from_json(&v) else {
            panic!("expected match");
        };
        assert_eq!(m.left, Operand::payload("th", "sport"));
        assert_eq!(m.right.numbers(), vec![8080]);
    }

    #[test]
    fn test_port_shapes_enumerate_identically() {
        let set = Operand::from_json(&json!({"set": [8889, 14001]}));
        let list = Operand::from_json(&json!([8889, 14001]));
        assert_eq!(set.numbers(), vec![8889, 14001]);
        assert_eq!(list.numbers(), vec![8889, 14001]);
    }

    #[test]
    fn test_quota_units_are_decimal() {
        let v = json!({"quota": {"val": 2, "val_unit": "gbytes", "used": 512, "used_unit": "kbytes", "inv": true}});
        let Expr::Quota(q) = Expr::from_json(&v) else {
            panic!("expected quota");
        };
        assert_eq!(q.limit_bytes(), 2_000_000_000);
        assert_eq!(q.used_bytes(), 512_000);
        assert!(q.inv);
    }

    #[test]
    fn test_quota_missing_used_defaults_to_zero() {
        let v = json!({"quota": {"val": 5, "val_unit": "mbytes", "inv": true}});
        let Expr::Quota(q) = Expr::from_json(&v) else {
            panic!("expected quota");
        };
        assert_eq!(q.used_bytes(), 0);
        assert_eq!(ByteUnit::from_tag(Some("furlongs")), ByteUnit::Bytes);
    }

    #[test]
    fn test_dnat_and_verdicts() {
        let dnat = Expr::from_json(&json!({"dnat": {"addr": "10.0.0.5", "port": 22}}));
        assert_eq!(
            dnat,
            Expr::Dnat(Nat {
                addr: Some("10.0.0.5".into()),
                port: Some(22),
                family: None
            })
        );
        assert_eq!(Expr::from_json(&json!({"drop": null})), Expr::Drop);
        assert_eq!(Expr::from_json(&json!({"accept": null})), Expr::Accept);
        assert_eq!(
            Expr::from_json(&json!({"masquerade": null})),
            Expr::Masquerade
        );
    }

    #[test]
    fn test_unrecognized_is_preserved() {
        let v = json!({"counter": {"packets": 3, "bytes": 120}});
        let expr = Expr::from_json(&v);
        assert!(matches!(expr, Expr::Unrecognized { ref key, .. } if key == "counter"));
        assert_eq!(expr.to_json(), v);
    }

    #[test]
    fn test_malformed_known_kind_falls_back() {
        let v = json!({"quota": "nonsense"});
        assert!(matches!(Expr::from_json(&v), Expr::Unrecognized { .. }));
        assert_eq!(Expr::from_json(&v).to_json(), v);
    }

    #[test]
    fn test_serde_roundtrip_through_value() {
        let v = json!([
            {"match": {"op": "==", "left": {"meta": {"key": "l4proto"}}, "right": {"set": ["tcp", "udp"]}}},
            {"drop": null}
        ]);
        let exprs: Vec<Expr> = serde_json::from_value(v.clone()).unwrap();
        assert_eq!(serde_json::to_value(&exprs).unwrap(), v);
    }
}
