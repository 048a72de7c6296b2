use serde::{Deserialize, Serialize};

/// Per-chain record consulted on every relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Human alias the front door routes on (e.g. `eth-mainnet`).
    pub blockchain: String,
    /// Network chain identifier (e.g. `0021`).
    pub chain_id: String,
    #[serde(default)]
    pub chain_id_check: Option<ChainIdCheck>,
    #[serde(default)]
    pub sync_check: Option<SyncCheckOptions>,
    #[serde(default)]
    pub enforce_result: Option<ResultFormat>,
    /// Widest `eth_getLogs` range accepted; 0 disables the limit.
    #[serde(default)]
    pub log_limit_blocks: u64,
}

impl ChainConfig {
    pub fn new(blockchain: impl Into<String>, chain_id: impl Into<String>) -> Self {
        Self {
            blockchain: blockchain.into(),
            chain_id: chain_id.into(),
            chain_id_check: None,
            sync_check: None,
            enforce_result: None,
            log_limit_blocks: 0,
        }
    }

    pub fn enforces_json(&self) -> bool {
        matches!(self.enforce_result, Some(ResultFormat::Json))
    }
}

/// Probe used to confirm that a node serves the chain it claims to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainIdCheck {
    /// Raw JSON-RPC body, e.g. `{"method":"eth_chainId",...}`.
    pub payload: String,
    pub expected_chain_id: u64,
}

/// Probe used to read a node's head height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckOptions {
    pub body: String,
    #[serde(default)]
    pub path: Option<String>,
    /// Dotted path into the response, e.g. `result` or `result.sync_info.latest_block_height`.
    pub result_key: String,
    /// Blocks a node may trail the head by; 0 means the gateway default.
    #[serde(default)]
    pub allowance: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultFormat {
    Json,
}
