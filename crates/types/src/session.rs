use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::hash::session_digest;

/// A service node as advertised by the network for one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub public_key: String,
    #[serde(default, with = "crate::serde::serde_url_opt")]
    pub service_url: Option<Url>,
}

impl Node {
    pub fn new(public_key: impl Into<String>) -> Self {
        Self { public_key: public_key.into(), service_url: None }
    }

    pub fn with_service_url(mut self, url: Url) -> Self {
        self.service_url = Some(url);
        self
    }

    /// Host part of the service URL, used only as log context.
    pub fn service_domain(&self) -> String {
        self.service_url
            .as_ref()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }
}

/// Rotating assignment of nodes to an (application, chain) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub chain_id: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub block_height: u64,
}

impl Session {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.chain_id, &self.nodes)
    }
}

/// Deterministic fingerprint of `(chain, node set)`. Order of `nodes` is irrelevant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(chain_id: &str, nodes: &[Node]) -> Self {
        Self(session_digest(chain_id, nodes.iter().map(|n| n.public_key.as_str())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keep the nodes of `nodes` whose public key appears in `keys`, preserving order.
pub fn retain_by_keys<'a, I>(nodes: &[Node], keys: I) -> Vec<Node>
where
    I: IntoIterator<Item = &'a str>,
{
    let keys: HashSet<&str> = keys.into_iter().collect();
    nodes
        .iter()
        .filter(|n| keys.contains(n.public_key.as_str()))
        .cloned()
        .collect()
}

/// Drop the nodes of `nodes` whose public key appears in `keys`.
pub fn exclude_by_keys<'a, I>(nodes: &[Node], keys: I) -> Vec<Node>
where
    I: IntoIterator<Item = &'a str>,
{
    let keys: HashSet<&str> = keys.into_iter().collect();
    nodes
        .iter()
        .filter(|n| !keys.contains(n.public_key.as_str()))
        .cloned()
        .collect()
}
