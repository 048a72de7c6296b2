use std::time::Duration;

use async_trait::async_trait;
use relay_types::{AuthToken, ChainConfig, HttpMethod, Node, Session};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("wrong value type at key {0}")]
    WrongType(String),
    #[error("value at key {key} is not an integer")]
    NotAnInteger { key: String },
}

/// Errors surfaced by the network client, classified by how the gateway reacts to them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("invalid session")]
    InvalidSession,
    #[error("node is not part of the session")]
    NodeNotInSession,
    #[error("request is out of sync with the session height")]
    OutOfSync,
    #[error("evidence is sealed for this session")]
    EvidenceSealed,
    #[error("the evidence is sealed, either max relays reached or claim already submitted")]
    MaxRelaysReached,
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

impl ClientError {
    /// The node exhausted its relay quota for this session.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ClientError::MaxRelaysReached)
    }

    /// The cached session no longer matches what the network thinks it is.
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            ClientError::InvalidSession | ClientError::NodeNotInSession | ClientError::OutOfSync
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("unknown blockchain host: {0}")]
    NotFound(String),
    #[error("chain lookup failed: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
#[error("metrics sink failed: {0}")]
pub struct MetricsError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(Duration),
}

/// Process-shared key/value store holding check results, locks and counters.
///
/// Every method is a single-key atomic operation; callers never rely on
/// multi-key transactions.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store a string, replacing any previous value. `None` keeps it forever.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Store only when the key is absent. Returns `true` when this call wrote it.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Add a member to the set at `key`. Returns `true` when the member was new.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, CacheError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl, CacheError>;

    /// Returns `false` when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    async fn incr(&self, key: &str) -> Result<i64, CacheError>;
}

/// A single relay sent to one node of a session.
#[derive(Debug, Clone)]
pub struct RelayCall {
    pub data: String,
    pub chain_id: String,
    pub aat: AuthToken,
    pub node: Node,
    pub path: Option<String>,
    pub method: HttpMethod,
    pub timeout: Duration,
    pub retry_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayResponse {
    pub payload: String,
    pub servicer_public_key: String,
}

/// The network's session dispatcher and relay transport.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Fetch (or reuse) the current session for an application on a chain.
    async fn session(
        &self,
        aat: &AuthToken,
        chain_id: &str,
        timeout: Duration,
    ) -> Result<Session, ClientError>;

    async fn relay(&self, call: &RelayCall) -> Result<RelayResponse, ClientError>;
}

/// Node-selection policy. Returning `None` means no acceptable node.
#[async_trait]
pub trait NodeSelector: Send + Sync {
    async fn pick(
        &self,
        application_id: &str,
        chain_id: &str,
        nodes: &[Node],
        request_id: &str,
    ) -> Option<Node>;
}

/// Resolves the chain a request targets from its routing host.
#[async_trait]
pub trait ChainLookup: Send + Sync {
    async fn load_chain(&self, host: &str) -> Result<ChainConfig, LookupError>;
}

/// One relay outcome as reported to the metrics pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMetric {
    pub request_id: String,
    pub application_id: String,
    pub application_public_key: String,
    pub chain_id: String,
    pub service_node: String,
    pub elapsed: Duration,
    pub result: u16,
    pub bytes: usize,
    pub delivered: bool,
    pub fallback: bool,
    pub method: String,
    pub error: Option<String>,
    pub origin: String,
    pub session_key: Option<String>,
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record(&self, metric: &RelayMetric) -> Result<(), MetricsError>;
}
