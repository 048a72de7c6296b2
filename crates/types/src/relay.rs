use std::fmt;

use serde::{Deserialize, Serialize};

/// Retryable, node-level relay failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("relay error {status} from {node}: {message}")]
pub struct RelayError {
    pub message: String,
    pub status: u16,
    /// Public key of the servicer; empty when no node was reached.
    pub node: String,
}

impl RelayError {
    pub fn new(message: impl Into<String>, status: u16, node: impl Into<String>) -> Self {
        Self { message: message.into(), status, node: node.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application authentication token, passed through to the network client untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub version: String,
    pub client_public_key: String,
    pub application_public_key: String,
    pub signature: String,
}

/// Access rules an application configured for its gateway endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub secret_key_required: bool,
    #[serde(default)]
    pub whitelist_origins: Vec<String>,
    #[serde(default)]
    pub whitelist_user_agents: Vec<String>,
}

/// The calling application as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRef {
    pub id: String,
    pub public_key: String,
    pub aat: AuthToken,
    #[serde(default)]
    pub settings: GatewaySettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_error_display_names_node() {
        let err = RelayError::new("boom", 503, "abc");
        assert_eq!(err.to_string(), "relay error 503 from abc: boom");
    }

    #[test]
    fn http_method_serde_is_uppercase() {
        assert_eq!(serde_json::to_string(&HttpMethod::Get).unwrap(), "\"GET\"");
        let m: HttpMethod = serde_json::from_str("\"POST\"").unwrap();
        assert_eq!(m, HttpMethod::Post);
    }
}
