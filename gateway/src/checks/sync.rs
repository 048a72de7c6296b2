//! Sync verification: keep only nodes within the allowance of the chain head.
//!
//! The head is the highest node height, cross-checked against the chain's fallback
//! endpoint. A fallback that more than 80% of reporting nodes are ahead of is
//! considered stale and is replaced by the node head.

use std::time::Duration;

use relay_types::{CheckResult, NodeLog, Observation, SyncCheckOptions};
use tracing::{info, warn};
use url::Url;

use super::{
    failure_metric, gated, handle_probe_failure, probe_all, CheckContext, CheckEnv, CheckError, CheckKind,
};
use crate::cache::keys;
use crate::fallback::{redact_url, FallbackClient};

/// How long an in-sync node's failure mark stays cleared.
pub const FAILURE_FLAG_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 30);

/// Fraction of nodes ahead of the fallback beyond which it is no longer trusted.
const FALLBACK_AHEAD_LIMIT: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncVerdict {
    pub in_sync: Vec<NodeLog>,
    pub behind: Vec<NodeLog>,
    pub highest: u64,
    pub fallback_height: u64,
    pub fallback_trusted: bool,
}

/// Classify node heights against the head.
///
/// `probed` is the number of nodes asked; `logs` holds only the non-zero answers.
/// Returns `None` when neither the nodes nor the fallback give a usable head.
pub fn classify(
    mut logs: Vec<NodeLog>,
    probed: usize,
    allowance: u64,
    fallback: Option<u64>,
) -> Option<SyncVerdict> {
    logs.sort_by(|a, b| b.height().unwrap_or(0).cmp(&a.height().unwrap_or(0)));
    let height = |i: usize| logs.get(i).and_then(NodeLog::height).unwrap_or(0);

    let mut error_state = probed > 2 && logs.len() <= 2;
    let mut highest = 0;
    if height(0) == 0 {
        error_state = true;
    } else {
        highest = height(0);
    }

    // Heights are node-reported; sums saturate.
    // One wildly-ahead node must not define the head.
    if !error_state
        && logs.len() >= 3
        && highest > height(1).saturating_add(allowance)
        && highest > height(2).saturating_add(allowance)
    {
        error_state = true;
    }

    let mut fallback_height = fallback.unwrap_or(0);
    let mut trusted = false;
    if fallback_height == 0 {
        if error_state {
            return None;
        }
    } else {
        let ahead = nodes_ahead_of(fallback_height, &logs);
        trusted = ahead <= FALLBACK_AHEAD_LIMIT;
        if !trusted {
            fallback_height = highest;
        }
    }

    if trusted && highest > fallback_height.saturating_add(allowance) {
        highest = fallback_height;
    }

    let ceiling = if trusted { fallback_height } else { highest }.saturating_add(allowance);
    let (in_sync, behind) = logs.into_iter().partition(|log| {
        let h = log.height().unwrap_or(0);
        let reach = h.saturating_add(allowance);
        h <= ceiling && reach >= highest && reach >= fallback_height
    });

    Some(SyncVerdict { in_sync, behind, highest, fallback_height, fallback_trusted: trusted })
}

fn nodes_ahead_of(fallback_height: u64, logs: &[NodeLog]) -> f64 {
    let total = logs.iter().filter(|l| l.height().unwrap_or(0) > 0).count();
    if total == 0 {
        return 0.0;
    }
    let ahead = logs.iter().filter(|l| l.height().unwrap_or(0) > fallback_height).count();
    ahead as f64 / total as f64
}

#[derive(Clone)]
pub struct SyncChecker {
    env: CheckEnv,
    fallback: FallbackClient,
    default_allowance: u64,
}

impl SyncChecker {
    pub fn new(env: CheckEnv, fallback: FallbackClient, default_allowance: u64) -> Self {
        Self { env, fallback, default_allowance }
    }

    pub async fn consensus_filter(
        &self,
        ctx: &CheckContext<'_>,
        opts: &SyncCheckOptions,
        fallback_url: Option<&Url>,
    ) -> Result<CheckResult, CheckError> {
        let allowance = if opts.allowance > 0 { opts.allowance } else { self.default_allowance };

        gated(&self.env, CheckKind::Sync, ctx, || async move {
            let (logs, fallback_height) = tokio::join!(
                self.node_sync_logs(ctx, opts),
                self.fallback_height(ctx, opts, fallback_url),
            );

            let Some(verdict) = classify(logs, ctx.nodes.len(), allowance, fallback_height) else {
                warn!(
                    target: "sync_check",
                    request_id = ctx.request_id,
                    chain = ctx.chain_id(),
                    session_key = %ctx.session_key,
                    "SYNC CHECK ERROR: no usable head from nodes or fallback; using unfiltered nodes"
                );
                return None;
            };
            self.apply_verdict(ctx, &verdict, allowance).await;
            Some(verdict.in_sync.into_iter().map(|log| log.node).collect())
        })
        .await
    }

    async fn node_sync_logs(&self, ctx: &CheckContext<'_>, opts: &SyncCheckOptions) -> Vec<NodeLog> {
        let outcomes = probe_all(&self.env, ctx, &opts.body, opts.path.as_deref(), &opts.result_key).await;
        let mut logs = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match &outcome.result {
                Ok(0) => {}
                Ok(height) => logs.push(NodeLog {
                    node: outcome.node.clone(),
                    observation: Observation::BlockHeight(*height),
                }),
                Err(err) => handle_probe_failure(&self.env, CheckKind::Sync, ctx, &outcome, err).await,
            }
        }
        logs
    }

    async fn fallback_height(
        &self,
        ctx: &CheckContext<'_>,
        opts: &SyncCheckOptions,
        url: Option<&Url>,
    ) -> Option<u64> {
        let url = url?;
        match self.fallback.block_height(url, opts).await {
            Ok(h) => {
                info!(target: "sync_check", request_id = ctx.request_id, chain = ctx.chain_id(), height = h, "SYNC CHECK ALTRUIST CHECK");
                Some(h)
            }
            Err(err) => {
                warn!(
                    target: "sync_check",
                    request_id = ctx.request_id,
                    chain = ctx.chain_id(),
                    node = %format!("fallback:{}", redact_url(url)),
                    error = %err,
                    "SYNC CHECK ALTRUIST FAILURE"
                );
                None
            }
        }
    }

    async fn apply_verdict(&self, ctx: &CheckContext<'_>, verdict: &SyncVerdict, allowance: u64) {
        if !verdict.fallback_trusted && verdict.fallback_height > 0 {
            info!(
                target: "sync_check",
                request_id = ctx.request_id,
                chain = ctx.chain_id(),
                "SYNC CHECK ALTRUIST FAILURE: most synced nodes are ahead of the fallback"
            );
        }

        for log in &verdict.in_sync {
            let key = keys::node_failure(ctx.chain_id(), &log.node.public_key);
            if let Err(err) = self.env.cache.set(&key, "false", Some(FAILURE_FLAG_TTL)).await {
                warn!(target: "sync_check", node = %log.node.public_key, error = %err, "could not clear failure mark");
            }
        }

        for log in &verdict.behind {
            let height = log.height().unwrap_or(0);
            info!(
                target: "sync_check",
                request_id = ctx.request_id,
                chain = ctx.chain_id(),
                node = %log.node.public_key,
                service_domain = %log.node.service_domain(),
                height,
                "SYNC CHECK BEHIND"
            );
            let error = format!(
                "OUT OF SYNC: current block height on chain {}: {} - altruist block height: {} - nodes height: {} - sync allowance: {}",
                ctx.chain_id(),
                verdict.highest,
                verdict.fallback_height,
                height,
                allowance
            );
            self.env
                .metrics
                .record(failure_metric(&self.env, CheckKind::Sync, ctx, &log.node, Duration::ZERO, error))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::testing::{rpc_result, Fixture};
    use gateway_api::{ClientError, SharedCache};
    use relay_types::Node;
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn logs(heights: &[u64]) -> Vec<NodeLog> {
        heights
            .iter()
            .enumerate()
            .map(|(i, h)| NodeLog { node: Node::new(format!("n{i}")), observation: Observation::BlockHeight(*h) })
            .collect()
    }

    fn heights(logs: &[NodeLog]) -> Vec<u64> {
        logs.iter().filter_map(NodeLog::height).collect()
    }

    #[test]
    fn agreeing_nodes_all_pass() {
        let v = classify(logs(&[100, 100, 99]), 3, 2, Some(100)).unwrap();
        assert_eq!(heights(&v.in_sync), vec![100, 100, 99]);
        assert!(v.behind.is_empty());
        assert!(v.fallback_trusted);
    }

    #[test]
    fn runaway_node_is_clamped_to_fallback() {
        let v = classify(logs(&[1000, 100, 99]), 3, 2, Some(100)).unwrap();
        assert_eq!(heights(&v.in_sync), vec![100, 99]);
        assert_eq!(heights(&v.behind), vec![1000]);
        assert_eq!(v.highest, 100);
    }

    #[test]
    fn stale_fallback_is_distrusted() {
        let v = classify(logs(&[110, 110, 110, 110, 110]), 5, 2, Some(100)).unwrap();
        assert!(!v.fallback_trusted);
        assert_eq!(v.fallback_height, 110);
        assert_eq!(v.in_sync.len(), 5);
    }

    #[test]
    fn exactly_eighty_percent_ahead_is_still_trusted() {
        let v = classify(logs(&[110, 110, 110, 110, 100]), 5, 2, Some(100)).unwrap();
        assert!(v.fallback_trusted);
        assert_eq!(v.highest, 100);
        assert_eq!(heights(&v.in_sync), vec![100]);
    }

    #[test]
    fn absurd_heights_do_not_overflow() {
        let v = classify(logs(&[u64::MAX]), 1, 5, None).unwrap();
        assert_eq!(heights(&v.in_sync), vec![u64::MAX]);

        // Every node is ahead of the fallback, so it is distrusted and the head is u64::MAX.
        let v = classify(logs(&[u64::MAX]), 1, 5, Some(100)).unwrap();
        assert!(!v.fallback_trusted);
        assert_eq!(v.highest, u64::MAX);
        assert_eq!(heights(&v.in_sync), vec![u64::MAX]);

        let v = classify(logs(&[u64::MAX, 100, 100, 99]), 4, 2, Some(100)).unwrap();
        assert!(v.fallback_trusted);
        assert_eq!(v.highest, 100);
        assert_eq!(heights(&v.behind), vec![u64::MAX]);
        assert_eq!(heights(&v.in_sync), vec![100, 100, 99]);
    }

    #[test]
    fn error_state_without_fallback_gives_up() {
        assert_eq!(classify(logs(&[100, 99]), 5, 2, None), None);
        assert_eq!(classify(Vec::new(), 3, 2, Some(0)), None);
    }

    #[test]
    fn missing_fallback_uses_node_head() {
        let v = classify(logs(&[100, 100, 97]), 3, 2, None).unwrap();
        assert!(!v.fallback_trusted);
        assert_eq!(v.fallback_height, 0);
        assert_eq!(heights(&v.in_sync), vec![100, 100]);
        assert_eq!(heights(&v.behind), vec![97]);
    }

    #[test]
    fn nodes_too_far_ahead_of_fallback_are_rejected() {
        let v = classify(logs(&[105, 101, 100]), 3, 2, Some(100)).unwrap();
        assert_eq!(v.highest, 100);
        assert_eq!(heights(&v.in_sync), vec![101, 100]);
        assert_eq!(heights(&v.behind), vec![105]);
    }

    fn opts() -> SyncCheckOptions {
        SyncCheckOptions {
            body: r#"{"method":"eth_blockNumber","id":1,"jsonrpc":"2.0"}"#.into(),
            path: None,
            result_key: "result".into(),
            allowance: 0,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn filters_against_live_fallback_and_records_side_effects() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jsonrpc":"2.0","id":1,"result":"0x64"})))
            .expect(1)
            .mount(&server)
            .await;

        let fx = Fixture::new(&["a", "b", "c", "d"]);
        fx.client.answer("a", rpc_result("0x64"));
        fx.client.answer("b", rpc_result("0x63"));
        fx.client.answer("c", rpc_result("0x50"));
        fx.client.answer("d", Err(ClientError::MaxRelaysReached));

        let key = fx.key();
        let ctx = CheckContext {
            session: &fx.session,
            session_key: &key,
            nodes: &fx.session.nodes,
            application: &fx.app,
            request_id: "req",
        };
        let checker = SyncChecker::new(fx.env.clone(), FallbackClient::new(Duration::from_secs(2)).unwrap(), 2);
        let url = Url::parse(&server.uri()).unwrap();
        let result = checker.consensus_filter(&ctx, &opts(), Some(&url)).await.unwrap();

        let kept: Vec<&str> = result.nodes.iter().map(|n| n.public_key.as_str()).collect();
        assert_eq!(kept, vec!["a", "b"]);
        assert_eq!(fx.cache.get("0021-a-failure").await.unwrap().as_deref(), Some("false"));
        assert!(fx.cache.get("0021-c-failure").await.unwrap().is_none());
        assert_eq!(crate::pruning::removed_nodes(fx.cache.as_ref(), &key).await.unwrap(), vec!["d"]);

        let metrics = fx.sink.snapshot();
        let behind = metrics.iter().find(|m| m.service_node == "c").unwrap();
        assert_eq!(behind.method, "synccheck");
        assert_eq!(
            behind.error.as_deref(),
            Some("OUT OF SYNC: current block height on chain 0021: 100 - altruist block height: 100 - nodes height: 80 - sync allowance: 2")
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unreachable_fallback_in_error_state_returns_input() {
        let fx = Fixture::new(&["a", "b", "c"]);
        fx.client.answer("a", rpc_result("0x64"));

        let key = fx.key();
        let ctx = CheckContext {
            session: &fx.session,
            session_key: &key,
            nodes: &fx.session.nodes,
            application: &fx.app,
            request_id: "req",
        };
        let checker = SyncChecker::new(fx.env.clone(), FallbackClient::new(Duration::from_secs(2)).unwrap(), 2);
        let result = checker.consensus_filter(&ctx, &opts(), None).await.unwrap();

        assert_eq!(result.nodes, fx.session.nodes);
        assert!(fx.cache.get(&keys::sync_check(&key)).await.unwrap().is_none());
    }
}
