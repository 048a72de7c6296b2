//! Chain record lookup with a short-lived shared-cache layer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gateway_api::{ChainLookup, LookupError, SharedCache};
use relay_types::ChainConfig;
use tracing::warn;

use crate::cache::keys;

pub const CHAIN_CACHE_TTL: Duration = Duration::from_secs(60);

/// Fixed host-to-chain table, for single-tenant deployments and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticChainLookup {
    chains: HashMap<String, ChainConfig>,
}

impl StaticChainLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a chain under its alias and its network id.
    pub fn with_chain(mut self, chain: ChainConfig) -> Self {
        self.chains.insert(chain.chain_id.clone(), chain.clone());
        self.chains.insert(chain.blockchain.clone(), chain);
        self
    }
}

#[async_trait]
impl ChainLookup for StaticChainLookup {
    async fn load_chain(&self, host: &str) -> Result<ChainConfig, LookupError> {
        let alias = host.split('.').next().unwrap_or(host);
        self.chains
            .get(host)
            .or_else(|| self.chains.get(alias))
            .cloned()
            .ok_or_else(|| LookupError::NotFound(host.to_string()))
    }
}

/// Serves chain records from the shared cache, refreshing from `inner` on a miss.
pub struct CachedChainLookup<L> {
    inner: L,
    cache: Arc<dyn SharedCache>,
    ttl: Duration,
}

impl<L: ChainLookup> CachedChainLookup<L> {
    pub fn new(inner: L, cache: Arc<dyn SharedCache>) -> Self {
        Self { inner, cache, ttl: CHAIN_CACHE_TTL }
    }
}

#[async_trait]
impl<L: ChainLookup> ChainLookup for CachedChainLookup<L> {
    async fn load_chain(&self, host: &str) -> Result<ChainConfig, LookupError> {
        let key = keys::blockchain(host);
        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<ChainConfig>(&raw) {
                Ok(chain) => return Ok(chain),
                Err(err) => warn!(target: "cache", key = %key, error = %err, "unreadable cached chain record"),
            },
            Ok(None) => {}
            Err(err) => warn!(target: "cache", key = %key, error = %err, "chain cache read failed"),
        }

        let chain = self.inner.load_chain(host).await?;
        match serde_json::to_string(&chain) {
            Ok(raw) => {
                if let Err(err) = self.cache.set(&key, &raw, Some(self.ttl)).await {
                    warn!(target: "cache", key = %key, error = %err, "chain cache write failed");
                }
            }
            Err(err) => warn!(target: "cache", key = %key, error = %err, "chain record not serialisable"),
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        inner: StaticChainLookup,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChainLookup for Counting {
        async fn load_chain(&self, host: &str) -> Result<ChainConfig, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.load_chain(host).await
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn static_lookup_matches_alias_and_subdomain() {
        let lookup = StaticChainLookup::new().with_chain(ChainConfig::new("eth-mainnet", "0021"));
        assert_eq!(lookup.load_chain("eth-mainnet").await.unwrap().chain_id, "0021");
        assert_eq!(lookup.load_chain("eth-mainnet.gateway.example").await.unwrap().chain_id, "0021");
        assert!(matches!(lookup.load_chain("nope").await, Err(LookupError::NotFound(_))));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn second_lookup_is_served_from_cache() {
        let inner = Counting {
            inner: StaticChainLookup::new().with_chain(ChainConfig::new("eth-mainnet", "0021")),
            calls: AtomicUsize::new(0),
        };
        let cache = Arc::new(MemoryCache::new());
        let lookup = CachedChainLookup::new(inner, cache.clone());

        lookup.load_chain("eth-mainnet").await.unwrap();
        lookup.load_chain("eth-mainnet").await.unwrap();

        assert_eq!(lookup.inner.calls.load(Ordering::SeqCst), 1);
        assert!(cache.get("blockchain-eth-mainnet").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn misses_are_not_cached() {
        let cache = Arc::new(MemoryCache::new());
        let lookup = CachedChainLookup::new(StaticChainLookup::new(), cache.clone());
        assert!(lookup.load_chain("ghost").await.is_err());
        assert!(cache.get("blockchain-ghost").await.unwrap().is_none());
    }
}
