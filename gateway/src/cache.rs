//! In-process [`SharedCache`] and the key layout every gateway process agrees on.
//!
//! Production deployments point the dispatcher at a networked store; `MemoryCache`
//! backs single-process deployments and the test-suite. Expiry uses the tokio clock
//! so paused-time tests can step past TTLs.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use gateway_api::{CacheError, KeyTtl, SharedCache};
use tokio::time::Instant;

pub mod keys {
    use relay_types::SessionKey;

    pub fn chain_check(session: &SessionKey) -> String {
        format!("chain-check-{session}")
    }

    pub fn sync_check(session: &SessionKey) -> String {
        format!("sync-check-{session}")
    }

    pub fn lock(key: &str) -> String {
        format!("lock-{key}")
    }

    /// Set of node public keys pulled out of a session.
    pub fn removed_nodes(session: &SessionKey) -> String {
        format!("session-{session}")
    }

    pub fn session_cache(app_public_key: &str, chain_id: &str) -> String {
        format!("session-cached-{app_public_key}-{chain_id}")
    }

    pub fn node_errors(chain_id: &str, node: &str) -> String {
        format!("{chain_id}-{node}-errors")
    }

    pub fn node_failure(chain_id: &str, node: &str) -> String {
        format!("{chain_id}-{node}-failure")
    }

    pub fn blockchain(host: &str) -> String {
        format!("blockchain-{host}")
    }
}

#[derive(Debug, Clone)]
enum Stored {
    Text(String),
    Members(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the map and drops whatever expired at `key`.
    fn guard(&self, key: &str) -> Result<MutexGuard<'_, HashMap<String, Entry>>, CacheError> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| CacheError::Unavailable("memory cache mutex poisoned".into()))?;
        let now = Instant::now();
        if map.get(key).is_some_and(|e| !e.live(now)) {
            map.remove(key);
        }
        Ok(map)
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let map = self.guard(key)?;
        match map.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Stored::Text(s)) => Ok(Some(s.clone())),
            Some(Stored::Members(_)) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut map = self.guard(key)?;
        map.insert(
            key.to_string(),
            Entry {
                value: Stored::Text(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut map = self.guard(key)?;
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: Stored::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut map = self.guard(key)?;
        map.remove(key);
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        let mut map = self.guard(key)?;
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Stored::Members(HashSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Stored::Members(set) => Ok(set.insert(member.to_string())),
            Stored::Text(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let map = self.guard(key)?;
        match map.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Stored::Members(set)) => {
                let mut members: Vec<String> = set.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Some(Stored::Text(_)) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, CacheError> {
        let map = self.guard(key)?;
        Ok(match map.get(key) {
            None => KeyTtl::Missing,
            Some(Entry { expires_at: None, .. }) => KeyTtl::Persistent,
            Some(Entry { expires_at: Some(at), .. }) => {
                KeyTtl::Expires(at.saturating_duration_since(Instant::now()))
            }
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut map = self.guard(key)?;
        match map.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        let mut map = self.guard(key)?;
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Stored::Text("0".to_string()),
            expires_at: None,
        });
        match &mut entry.value {
            Stored::Text(s) => {
                let current: i64 = s
                    .parse()
                    .map_err(|_| CacheError::NotAnInteger { key: key.to_string() })?;
                let next = current + 1;
                *s = next.to_string();
                Ok(next)
            }
            Stored::Members(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn set_if_absent_only_writes_once() {
        let cache = MemoryCache::new();
        assert!(cache.set_if_absent("lock-a", "1", Duration::from_secs(60)).await.unwrap());
        assert!(!cache.set_if_absent("lock-a", "2", Duration::from_secs(60)).await.unwrap());
        assert_eq!(cache.get("lock-a").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn entries_expire() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Some(Duration::from_secs(30))).await.unwrap();
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cache.get("k").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert_eq!(cache.ttl("k").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn sets_report_new_members() {
        let cache = MemoryCache::new();
        assert!(cache.set_add("s", "a").await.unwrap());
        assert!(!cache.set_add("s", "a").await.unwrap());
        assert!(cache.set_add("s", "b").await.unwrap());
        assert_eq!(cache.set_members("s").await.unwrap(), vec!["a", "b"]);
        assert_eq!(cache.ttl("s").await.unwrap(), KeyTtl::Persistent);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn incr_counts_from_zero() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr("c").await.unwrap(), 1);
        assert_eq!(cache.incr("c").await.unwrap(), 2);
        cache.set("t", "nope", None).await.unwrap();
        assert!(matches!(cache.incr("t").await, Err(CacheError::NotAnInteger { .. })));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn type_mismatch_is_an_error() {
        let cache = MemoryCache::new();
        cache.set_add("s", "a").await.unwrap();
        assert!(matches!(cache.get("s").await, Err(CacheError::WrongType(_))));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn expire_on_missing_key_is_false() {
        let cache = MemoryCache::new();
        assert!(!cache.expire("nope", Duration::from_secs(1)).await.unwrap());
    }
}
