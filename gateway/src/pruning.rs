//! Session-scoped node eviction and cache invalidation.

use std::time::Duration;

use gateway_api::{CacheError, KeyTtl, SharedCache};
use relay_types::SessionKey;
use tracing::warn;

use crate::cache::keys;

/// How long an evicted node stays out of a session.
pub const REMOVED_NODES_TTL: Duration = Duration::from_secs(3600);

/// Pull `node` out of the session. Repeating the call has no further effect.
///
/// The set's expiry is only armed when it has none, so later removals never extend it.
pub async fn remove_node_from_session(
    cache: &dyn SharedCache,
    session: &SessionKey,
    node: &str,
    invalidate_checks: bool,
) -> Result<(), CacheError> {
    let key = keys::removed_nodes(session);
    let added = cache.set_add(&key, node).await?;

    if matches!(cache.ttl(&key).await?, KeyTtl::Persistent | KeyTtl::Missing) {
        cache.expire(&key, REMOVED_NODES_TTL).await?;
    }

    if added {
        warn!(
            target: "pruning",
            session_key = %session,
            node,
            "exhausted node relays; removed from session"
        );
    }

    if invalidate_checks {
        remove_checks_cache(cache, session).await?;
    }
    Ok(())
}

/// Forget both node-check results for the session so the next request re-probes.
pub async fn remove_checks_cache(cache: &dyn SharedCache, session: &SessionKey) -> Result<(), CacheError> {
    cache.delete(&keys::sync_check(session)).await?;
    cache.delete(&keys::chain_check(session)).await?;
    Ok(())
}

/// Forget the cached session for an application on a chain.
pub async fn remove_session_cache(
    cache: &dyn SharedCache,
    app_public_key: &str,
    chain_id: &str,
) -> Result<(), CacheError> {
    cache.delete(&keys::session_cache(app_public_key, chain_id)).await
}

pub async fn removed_nodes(cache: &dyn SharedCache, session: &SessionKey) -> Result<Vec<String>, CacheError> {
    cache.set_members(&keys::removed_nodes(session)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use relay_types::Node;

    fn session() -> SessionKey {
        SessionKey::new("0021", &[Node::new("a"), Node::new("b")])
    }

    #[tokio::test(flavor = "current_thread")]
    async fn removal_is_idempotent() {
        let cache = MemoryCache::new();
        let key = session();
        remove_node_from_session(&cache, &key, "a", false).await.unwrap();
        remove_node_from_session(&cache, &key, "a", false).await.unwrap();
        assert_eq!(removed_nodes(&cache, &key).await.unwrap(), vec!["a"]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn ttl_is_not_extended_by_later_removals() {
        let cache = MemoryCache::new();
        let key = session();
        remove_node_from_session(&cache, &key, "a", false).await.unwrap();
        tokio::time::advance(Duration::from_secs(1800)).await;
        remove_node_from_session(&cache, &key, "b", false).await.unwrap();

        match cache.ttl(&keys::removed_nodes(&key)).await.unwrap() {
            KeyTtl::Expires(left) => assert!(left <= Duration::from_secs(1800)),
            other => panic!("unexpected ttl {other:?}"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn removal_can_invalidate_checks() {
        let cache = MemoryCache::new();
        let key = session();
        cache.set(&keys::chain_check(&key), "[]", None).await.unwrap();
        cache.set(&keys::sync_check(&key), "[]", None).await.unwrap();

        remove_node_from_session(&cache, &key, "a", true).await.unwrap();

        assert!(cache.get(&keys::chain_check(&key)).await.unwrap().is_none());
        assert!(cache.get(&keys::sync_check(&key)).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn session_cache_is_scoped_to_app_and_chain() {
        let cache = MemoryCache::new();
        cache.set("session-cached-app-0021", "x", None).await.unwrap();
        cache.set("session-cached-app-0040", "y", None).await.unwrap();
        remove_session_cache(&cache, "app", "0021").await.unwrap();
        assert!(cache.get("session-cached-app-0021").await.unwrap().is_none());
        assert!(cache.get("session-cached-app-0040").await.unwrap().is_some());
    }
}
