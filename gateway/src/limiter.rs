//! Request limits applied before any network relay is attempted.

use async_trait::async_trait;
use relay_types::decode_quantity;
use serde_json::Value;
use tracing::warn;
use url::Url;

use crate::fallback::FallbackClient;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LimitError {
    #[error("You cannot query logs for more than {limit} blocks at once.")]
    LogRange { limit: u64 },
    #[error("Please use an explicit block number instead of 'latest'.")]
    UnresolvedLatest,
    #[error("invalid eth_getLogs filter: {0}")]
    Malformed(String),
}

/// Source of the current head height used to resolve `latest` tags.
#[async_trait]
pub trait HeadProvider: Send + Sync {
    async fn head(&self) -> Option<u64>;
}

/// Resolves `latest` through a chain's fallback endpoint.
pub struct FallbackHead<'a> {
    pub client: &'a FallbackClient,
    pub url: Option<&'a Url>,
}

#[async_trait]
impl HeadProvider for FallbackHead<'_> {
    async fn head(&self) -> Option<u64> {
        let url = self.url?;
        match self.client.latest_block_number(url).await {
            Ok(h) => Some(h),
            Err(err) => {
                warn!(target: "limiter", error = %err, "could not resolve latest block from fallback");
                None
            }
        }
    }
}

/// Reject `eth_getLogs` calls spanning more than `limit` blocks. A limit of 0 disables the check.
pub async fn enforce_log_limits(
    request: &Value,
    limit: u64,
    head: &dyn HeadProvider,
) -> Result<(), LimitError> {
    if limit == 0 {
        return Ok(());
    }
    let calls: Vec<&Value> = match request {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    // Resolved lazily, at most once per request.
    let mut latest: Option<Option<u64>> = None;

    for call in calls {
        if call.get("method").and_then(Value::as_str) != Some("eth_getLogs") {
            continue;
        }
        let filter = match call.get("params").and_then(|p| p.get(0)) {
            Some(Value::Object(f)) => f,
            Some(_) => return Err(LimitError::Malformed("filter must be an object".into())),
            None => continue,
        };
        if filter.get("blockHash").is_some_and(|h| !h.is_null()) {
            continue;
        }

        let from = parse_block_ref(filter.get("fromBlock"))?;
        let to = parse_block_ref(filter.get("toBlock"))?;

        if (from == BlockRef::Latest || to == BlockRef::Latest) && latest.is_none() {
            latest = Some(head.head().await);
        }
        let head_height = latest.flatten();

        let pin = |r: BlockRef| -> Result<u64, LimitError> {
            match r {
                BlockRef::Number(n) => Ok(n),
                BlockRef::Latest => head_height.ok_or(LimitError::UnresolvedLatest),
            }
        };
        let (from, to) = (pin(from)?, pin(to)?);

        if to.saturating_sub(from) > limit {
            return Err(LimitError::LogRange { limit });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockRef {
    Number(u64),
    Latest,
}

/// Missing tags default to `latest`, matching node behaviour.
fn parse_block_ref(tag: Option<&Value>) -> Result<BlockRef, LimitError> {
    match tag {
        None | Some(Value::Null) => Ok(BlockRef::Latest),
        Some(Value::String(s)) => match s.as_str() {
            "latest" | "pending" | "safe" | "finalized" => Ok(BlockRef::Latest),
            "earliest" => Ok(BlockRef::Number(0)),
            _ => decode_quantity(&Value::String(s.clone()))
                .map(BlockRef::Number)
                .ok_or_else(|| LimitError::Malformed(format!("bad block tag {s}"))),
        },
        Some(other) => decode_quantity(other)
            .map(BlockRef::Number)
            .ok_or_else(|| LimitError::Malformed(format!("bad block tag {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedHead {
        height: Option<u64>,
        calls: AtomicUsize,
    }

    impl FixedHead {
        fn new(height: Option<u64>) -> Self {
            Self { height, calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl HeadProvider for FixedHead {
        async fn head(&self) -> Option<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.height
        }
    }

    fn get_logs(from: Value, to: Value) -> Value {
        json!({"jsonrpc":"2.0","id":1,"method":"eth_getLogs","params":[{"fromBlock": from, "toBlock": to}]})
    }

    #[tokio::test(flavor = "current_thread")]
    async fn narrow_ranges_pass() {
        let head = FixedHead::new(None);
        let req = get_logs(json!("0x10"), json!("0x20"));
        assert_eq!(enforce_log_limits(&req, 100, &head).await, Ok(()));
        assert_eq!(head.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn wide_ranges_are_rejected() {
        let head = FixedHead::new(None);
        let req = get_logs(json!("0x0"), json!("0x2711"));
        let err = enforce_log_limits(&req, 10_000, &head).await.unwrap_err();
        assert_eq!(err.to_string(), "You cannot query logs for more than 10000 blocks at once.");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn latest_is_resolved_once_per_request() {
        let head = FixedHead::new(Some(1_000));
        let req = json!([
            get_logs(json!("0x3de"), json!("latest")),
            get_logs(json!("0x3e0"), Value::Null),
        ]);
        assert_eq!(enforce_log_limits(&req, 50, &head).await, Ok(()));
        assert_eq!(head.calls.load(Ordering::SeqCst), 1);

        let req = get_logs(json!("0x1"), json!("latest"));
        assert_eq!(
            enforce_log_limits(&req, 50, &head).await,
            Err(LimitError::LogRange { limit: 50 })
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unresolved_latest_is_rejected() {
        let head = FixedHead::new(None);
        let req = get_logs(json!("0x1"), json!("latest"));
        assert_eq!(enforce_log_limits(&req, 50, &head).await, Err(LimitError::UnresolvedLatest));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn block_hash_and_zero_limit_bypass() {
        let head = FixedHead::new(None);
        let req = json!({"method":"eth_getLogs","params":[{"blockHash":"0xabc"}]});
        assert_eq!(enforce_log_limits(&req, 1, &head).await, Ok(()));

        let req = get_logs(json!("0x0"), json!("0xffffff"));
        assert_eq!(enforce_log_limits(&req, 0, &head).await, Ok(()));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn other_methods_are_ignored() {
        let head = FixedHead::new(None);
        let req = json!({"method":"eth_blockNumber","params":[]});
        assert_eq!(enforce_log_limits(&req, 1, &head).await, Ok(()));
    }
}
