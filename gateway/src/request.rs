use std::time::Duration;

use relay_types::{ApplicationRef, HttpMethod};
use serde_json::Value;

use crate::enforcement::CallerInfo;

/// Everything the front door hands the dispatcher for one client request.
#[derive(Debug, Clone)]
pub struct SendRelayOptions {
    /// Routing host the chain is resolved from (e.g. `eth-mainnet`).
    pub host: String,
    pub raw_data: String,
    pub relay_path: Option<String>,
    pub http_method: HttpMethod,
    pub application: ApplicationRef,
    pub caller: CallerInfo,
    pub request_id: String,
    /// Per-relay timeout override.
    pub request_timeout: Option<Duration>,
    pub overall_timeout: Option<Duration>,
    pub relay_retries: Option<u32>,
    /// Load-balancer specific `eth_getLogs` limit; only values above 0 apply.
    pub log_limit_blocks: Option<u64>,
}

impl SendRelayOptions {
    pub fn new(host: impl Into<String>, raw_data: impl Into<String>, application: ApplicationRef) -> Self {
        Self {
            host: host.into(),
            raw_data: raw_data.into(),
            relay_path: None,
            http_method: HttpMethod::Post,
            application,
            caller: CallerInfo::default(),
            request_id: String::new(),
            request_timeout: None,
            overall_timeout: None,
            relay_retries: None,
            log_limit_blocks: None,
        }
    }
}

/// A client body after validation and canonical re-serialisation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    pub value: Value,
    /// Compact form relayed to nodes and the fallback.
    pub data: String,
    /// JSON-RPC method label for logs and metrics; batches are comma-joined.
    pub method: String,
}

pub fn parse_request(raw: &str) -> Result<ParsedRequest, serde_json::Error> {
    let value: Value = if raw.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(raw)?
    };
    let data = value.to_string();
    let method = parse_method(&value);
    Ok(ParsedRequest { value, data, method })
}

pub fn parse_method(value: &Value) -> String {
    let method_of = |v: &Value| v.get("method").and_then(Value::as_str).unwrap_or_default().to_string();
    match value {
        Value::Array(items) => items.iter().map(method_of).collect::<Vec<_>>().join(","),
        other => method_of(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalises_whitespace() {
        let parsed = parse_request("{\n  \"method\": \"eth_chainId\",\n  \"id\": 1\n}").unwrap();
        assert_eq!(parsed.data, r#"{"id":1,"method":"eth_chainId"}"#);
        assert_eq!(parsed.method, "eth_chainId");
    }

    #[test]
    fn batch_methods_are_joined() {
        let parsed = parse_request(r#"[{"method":"eth_chainId"},{"method":"eth_blockNumber"}]"#).unwrap();
        assert_eq!(parsed.method, "eth_chainId,eth_blockNumber");
    }

    #[test]
    fn empty_body_becomes_empty_object() {
        let parsed = parse_request("  ").unwrap();
        assert_eq!(parsed.data, "{}");
        assert_eq!(parsed.method, "");
    }

    #[test]
    fn malformed_body_is_rejected() {
        assert!(parse_request("{\"method\":").is_err());
    }
}
