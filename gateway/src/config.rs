use std::collections::HashMap;
use std::env;
use std::time::Duration;

use tracing::warn;
use url::Url;

/// Gateway-wide knobs shared by the dispatcher and the node checkers.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Network attempts after the first one before falling back
    pub relay_retries: u32,

    /// Used when a chain's sync check leaves its allowance at 0
    pub default_sync_allowance: u64,

    /// Used when a chain record carries no `eth_getLogs` limit
    pub default_log_limit_blocks: u64,

    /// Skip the network and relay straight to the fallback endpoint
    pub always_redirect_to_fallback: bool,

    /// Per-probe timeout for chain and sync checks
    pub check_timeout: Duration,

    /// Timeout handed to the network client when fetching a session
    pub session_timeout: Duration,

    /// Default timeout for fallback HTTP calls
    pub fallback_timeout: Duration,

    /// Relay timeout when the request carries no override
    pub relay_timeout: Duration,

    /// Wall-clock budget for one request when the caller gives none
    pub overall_timeout: Duration,

    /// Log probe payloads at debug level
    pub check_debug: bool,

    /// Gateway identity attached to logs and metrics
    pub origin: String,

    /// Trusted fallback endpoint per chain id
    pub fallbacks: HashMap<String, Url>,
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let relay_retries = env_parse("RELAY_RETRIES", defaults.relay_retries);
        let default_sync_allowance =
            env_parse("DEFAULT_SYNC_ALLOWANCE", defaults.default_sync_allowance);
        let default_log_limit_blocks =
            env_parse("DEFAULT_LOG_LIMIT_BLOCKS", defaults.default_log_limit_blocks);
        let always_redirect_to_fallback = env_parse(
            "ALWAYS_REDIRECT_TO_ALTRUISTS",
            defaults.always_redirect_to_fallback,
        );
        let check_timeout = Duration::from_millis(env_parse("CHECK_TIMEOUT_MS", 4_000u64));
        let session_timeout = Duration::from_millis(env_parse("SESSION_TIMEOUT_MS", 4_000u64));
        let fallback_timeout = Duration::from_millis(env_parse("FALLBACK_TIMEOUT_MS", 60_000u64));
        let relay_timeout = Duration::from_millis(env_parse("RELAY_TIMEOUT_MS", 10_000u64));
        let overall_timeout = Duration::from_millis(env_parse("OVERALL_TIMEOUT_MS", 120_000u64));
        let check_debug = env_parse("CHECK_DEBUG", defaults.check_debug);
        let origin = env::var("GATEWAY_ORIGIN").unwrap_or(defaults.origin);
        let fallbacks = env::var("ALTRUISTS")
            .map(|raw| parse_fallbacks(&raw))
            .unwrap_or_default();

        Self {
            relay_retries,
            default_sync_allowance,
            default_log_limit_blocks,
            always_redirect_to_fallback,
            check_timeout,
            session_timeout,
            fallback_timeout,
            relay_timeout,
            overall_timeout,
            check_debug,
            origin,
            fallbacks,
        }
    }

    pub fn fallback_for(&self, chain_id: &str) -> Option<&Url> {
        self.fallbacks.get(chain_id)
    }

    pub fn with_fallback(mut self, chain_id: impl Into<String>, url: Url) -> Self {
        self.fallbacks.insert(chain_id.into(), url);
        self
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            relay_retries: 0,
            default_sync_allowance: 5,
            default_log_limit_blocks: 10_000,
            always_redirect_to_fallback: false,
            check_timeout: Duration::from_millis(4_000),
            session_timeout: Duration::from_millis(4_000),
            fallback_timeout: Duration::from_millis(60_000),
            relay_timeout: Duration::from_millis(10_000),
            overall_timeout: Duration::from_millis(120_000),
            check_debug: false,
            origin: "unknown".to_string(),
            fallbacks: HashMap::new(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            warn!(target: "config", key, value = %raw, "unparsable value; using default");
            default
        }),
        Err(_) => default,
    }
}

/// `ALTRUISTS` holds a JSON object of chain id to URL. Bad entries are skipped.
pub(crate) fn parse_fallbacks(raw: &str) -> HashMap<String, Url> {
    let parsed: HashMap<String, String> = match serde_json::from_str(raw) {
        Ok(map) => map,
        Err(err) => {
            warn!(target: "config", error = %err, "ALTRUISTS is not a JSON object; ignoring");
            return HashMap::new();
        }
    };

    parsed
        .into_iter()
        .filter_map(|(chain, url)| match Url::parse(&url) {
            Ok(u) => Some((chain, u)),
            Err(err) => {
                warn!(target: "config", chain = %chain, error = %err, "skipping invalid fallback url");
                None
            }
        })
        .collect()
}
