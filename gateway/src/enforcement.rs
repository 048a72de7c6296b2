//! Result-format enforcement and application access rules.

use relay_types::GatewaySettings;
use serde_json::Value;

/// JSON-RPC error messages caused by the caller's request rather than the node.
const USER_ERROR_MESSAGES: &[&str] = &[
    "execution reverted",
    "invalid argument",
    "invalid opcode",
    "insufficient funds",
    "nonce too low",
    "already known",
    "transaction underpriced",
    "gas required exceeds allowance",
    "intrinsic gas too low",
    "method not found",
    "the method does not exist",
];

const USER_ERROR_CODES: &[i64] = &[3, -32600, -32601, -32602];

pub fn is_json(payload: &str) -> bool {
    serde_json::from_str::<Value>(payload).is_ok()
}

/// Some element of the response carries a JSON-RPC `error` member.
pub fn is_relay_error(payload: &str) -> bool {
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => rpc_errors(&value).next().is_some(),
        Err(_) => payload.contains("\"error\""),
    }
}

/// Every JSON-RPC error in the response is attributable to the request.
pub fn is_user_error(payload: &str) -> bool {
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return false;
    };
    let mut errors = rpc_errors(&value).peekable();
    if errors.peek().is_none() {
        return false;
    }
    errors.all(|err| {
        let code = err.get("code").and_then(Value::as_i64);
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();
        code.is_some_and(|c| USER_ERROR_CODES.contains(&c))
            || USER_ERROR_MESSAGES.iter().any(|m| message.contains(m))
    })
}

/// A JSON-enforced chain rejects payloads that are not JSON or carry a node-side error.
pub fn violates_json_enforcement(payload: &str) -> bool {
    !is_json(payload) || (is_relay_error(payload) && !is_user_error(payload))
}

/// Fallback bodies are only decoded when they plausibly hold JSON.
pub fn looks_like_json(body: &str) -> bool {
    let trimmed = body.trim_start();
    trimmed.starts_with('{') || trimmed.starts_with("[{")
}

fn rpc_errors(value: &Value) -> Box<dyn Iterator<Item = &Value> + '_> {
    match value {
        Value::Object(map) => Box::new(map.get("error").filter(|e| !e.is_null()).into_iter()),
        Value::Array(items) => Box::new(items.iter().flat_map(rpc_errors)),
        _ => Box::new(std::iter::empty()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhitelistMode {
    /// The value must equal an entry.
    Explicit,
    /// The value must contain an entry.
    Substring,
}

/// An empty whitelist admits everything.
pub fn check_whitelist(list: &[String], value: &str, mode: WhitelistMode) -> bool {
    if list.is_empty() {
        return true;
    }
    match mode {
        WhitelistMode::Explicit => list.iter().any(|entry| entry == value),
        WhitelistMode::Substring => {
            let value = value.to_lowercase();
            list.iter().any(|entry| value.contains(&entry.to_lowercase()))
        }
    }
}

pub fn check_secret_key(settings: &GatewaySettings, provided: Option<&str>) -> bool {
    if !settings.secret_key_required {
        return true;
    }
    match (settings.secret_key.as_deref(), provided) {
        (Some(expected), Some(given)) => !expected.is_empty() && expected == given,
        _ => false,
    }
}

/// Caller identity as seen by the front door.
#[derive(Debug, Clone, Default)]
pub struct CallerInfo {
    pub origin: String,
    pub user_agent: String,
    pub secret_key: Option<String>,
}

/// Apply an application's access rules. `Err` carries the forbidden reason.
pub fn authorize(settings: &GatewaySettings, caller: &CallerInfo) -> Result<(), String> {
    if !check_secret_key(settings, caller.secret_key.as_deref()) {
        return Err("SecretKey does not match".to_string());
    }
    if !check_whitelist(&settings.whitelist_origins, &caller.origin, WhitelistMode::Explicit) {
        return Err(format!("Whitelist Origin check failed: {}", caller.origin));
    }
    if !check_whitelist(&settings.whitelist_user_agents, &caller.user_agent, WhitelistMode::Substring) {
        return Err(format!("Whitelist User Agent check failed: {}", caller.user_agent));
    }
    Ok(())
}
