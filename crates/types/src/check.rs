use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::Node;

/// Outcome of a node check: the surviving subset and whether it came from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub nodes: Vec<Node>,
    pub cached: bool,
}

impl CheckResult {
    pub fn fresh(nodes: Vec<Node>) -> Self {
        Self { nodes, cached: false }
    }

    pub fn cached(nodes: Vec<Node>) -> Self {
        Self { nodes, cached: true }
    }
}

/// What a probe learned about a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Observation {
    ChainId(u64),
    BlockHeight(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLog {
    pub node: Node,
    pub observation: Observation,
}

impl NodeLog {
    pub fn height(&self) -> Option<u64> {
        match self.observation {
            Observation::BlockHeight(h) => Some(h),
            Observation::ChainId(_) => None,
        }
    }

    pub fn chain_id(&self) -> Option<u64> {
        match self.observation {
            Observation::ChainId(id) => Some(id),
            Observation::BlockHeight(_) => None,
        }
    }
}

/// Decode a JSON-RPC quantity. Strings are hex with an optional `0x` prefix;
/// bare numbers are taken as-is.
pub fn decode_quantity(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => {
            let digits = s.trim();
            let digits = digits
                .strip_prefix("0x")
                .or_else(|| digits.strip_prefix("0X"))
                .unwrap_or(digits);
            if digits.is_empty() {
                return None;
            }
            u64::from_str_radix(digits, 16).ok()
        }
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Walk a dotted path (`result.sync_info.latest_block_height`) into a JSON document.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_hex_strings() {
        assert_eq!(decode_quantity(&json!("0x10")), Some(16));
        assert_eq!(decode_quantity(&json!("0X1f")), Some(31));
        assert_eq!(decode_quantity(&json!("ff")), Some(255));
        assert_eq!(decode_quantity(&json!(64)), Some(64));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(decode_quantity(&json!("0x")), None);
        assert_eq!(decode_quantity(&json!("zz")), None);
        assert_eq!(decode_quantity(&json!(null)), None);
        assert_eq!(decode_quantity(&json!(-1)), None);
    }

    #[test]
    fn walks_nested_paths() {
        let doc = json!({"result": {"sync_info": {"latest_block_height": "0x2a"}}, "list": ["0x1"]});
        let found = lookup_path(&doc, "result.sync_info.latest_block_height").unwrap();
        assert_eq!(decode_quantity(found), Some(42));
        assert_eq!(lookup_path(&doc, "list.0"), Some(&json!("0x1")));
        assert_eq!(lookup_path(&doc, "result.missing"), None);
    }

    #[test]
    fn observation_accessors_are_exclusive() {
        let log = NodeLog { node: Node::new("a"), observation: Observation::BlockHeight(9) };
        assert_eq!(log.height(), Some(9));
        assert_eq!(log.chain_id(), None);
    }
}
