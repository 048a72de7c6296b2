//! Chain identity verification: keep only nodes that serve the chain they were assigned.

use relay_types::{ChainIdCheck, CheckResult, NodeLog, Observation};
use tracing::warn;

use super::{
    failure_metric, gated, handle_probe_failure, probe_all, CheckContext, CheckEnv, CheckError, CheckKind,
};

#[derive(Clone)]
pub struct ChainChecker {
    env: CheckEnv,
}

impl ChainChecker {
    pub fn new(env: CheckEnv) -> Self {
        Self { env }
    }

    pub async fn chain_id_filter(
        &self,
        ctx: &CheckContext<'_>,
        check: &ChainIdCheck,
    ) -> Result<CheckResult, CheckError> {
        gated(&self.env, CheckKind::Chain, ctx, || async move {
            let logs = self.node_chain_logs(ctx, check).await;
            Some(
                logs.into_iter()
                    .filter(|log| log.chain_id() == Some(check.expected_chain_id))
                    .map(|log| log.node)
                    .collect(),
            )
        })
        .await
    }

    /// Probe every node; wrong answers are logged and reported, never fatal.
    async fn node_chain_logs(&self, ctx: &CheckContext<'_>, check: &ChainIdCheck) -> Vec<NodeLog> {
        let outcomes = probe_all(&self.env, ctx, &check.payload, None, "result").await;
        let mut logs = Vec::with_capacity(outcomes.len());

        for outcome in outcomes {
            match &outcome.result {
                Ok(chain_id) if *chain_id == check.expected_chain_id => logs.push(NodeLog {
                    node: outcome.node,
                    observation: Observation::ChainId(*chain_id),
                }),
                Ok(chain_id) => {
                    warn!(
                        target: "chain_check",
                        request_id = ctx.request_id,
                        chain = ctx.chain_id(),
                        node = %outcome.node.public_key,
                        service_domain = %outcome.node.service_domain(),
                        expected = check.expected_chain_id,
                        reported = *chain_id,
                        "CHAIN CHECK FAILURE"
                    );
                    let error = format!(
                        "WRONG CHAIN ID: expected {} - node reported {}",
                        check.expected_chain_id, chain_id
                    );
                    self.env
                        .metrics
                        .record(failure_metric(&self.env, CheckKind::Chain, ctx, &outcome.node, outcome.elapsed, error))
                        .await;
                }
                Err(err) => handle_probe_failure(&self.env, CheckKind::Chain, ctx, &outcome, err).await,
            }
        }
        logs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::keys;
    use crate::checks::testing::{rpc_result, Fixture};
    use gateway_api::{ClientError, SharedCache};
    use relay_types::Node;

    fn check() -> ChainIdCheck {
        ChainIdCheck { payload: r#"{"method":"eth_chainId","id":1,"jsonrpc":"2.0"}"#.into(), expected_chain_id: 100 }
    }

    fn keys_of(nodes: &[Node]) -> Vec<&str> {
        nodes.iter().map(|n| n.public_key.as_str()).collect()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn keeps_only_matching_nodes_and_caches_them() {
        let fx = Fixture::new(&["a", "b", "c"]);
        fx.client.answer("a", rpc_result("0x64"));
        fx.client.answer("b", rpc_result("0x1"));
        fx.client.answer("c", Err(ClientError::Timeout));

        let key = fx.key();
        let checker = ChainChecker::new(fx.env.clone());
        let ctx = CheckContext {
            session: &fx.session,
            session_key: &key,
            nodes: &fx.session.nodes,
            application: &fx.app,
            request_id: "req",
        };
        let result = checker.chain_id_filter(&ctx, &check()).await.unwrap();

        assert!(!result.cached);
        assert_eq!(keys_of(&result.nodes), vec!["a"]);
        let cached = fx.cache.get(&keys::chain_check(&key)).await.unwrap();
        assert_eq!(cached.as_deref(), Some(r#"["a"]"#));

        let metrics = fx.sink.snapshot();
        assert_eq!(metrics.len(), 2);
        assert!(metrics.iter().all(|m| m.method == "chaincheck" && m.result == 500));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cached_list_skips_probes_and_intersects() {
        let fx = Fixture::new(&["a", "b", "c"]);
        let key = fx.key();
        fx.cache.set(&keys::chain_check(&key), r#"["a","c","zz"]"#, None).await.unwrap();

        let pruned = vec![Node::new("a"), Node::new("b")];
        let ctx = CheckContext {
            session: &fx.session,
            session_key: &key,
            nodes: &pruned,
            application: &fx.app,
            request_id: "req",
        };
        let result = ChainChecker::new(fx.env.clone()).chain_id_filter(&ctx, &check()).await.unwrap();

        assert!(result.cached);
        assert_eq!(keys_of(&result.nodes), vec!["a"]);
        assert_eq!(fx.client.calls(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn held_lock_fails_open_without_probing() {
        let fx = Fixture::new(&["a", "b"]);
        let key = fx.key();
        let lock = keys::lock(&keys::chain_check(&key));
        fx.cache.set(&lock, "true", None).await.unwrap();

        let ctx = CheckContext {
            session: &fx.session,
            session_key: &key,
            nodes: &fx.session.nodes,
            application: &fx.app,
            request_id: "req",
        };
        let result = ChainChecker::new(fx.env.clone()).chain_id_filter(&ctx, &check()).await.unwrap();

        assert!(!result.cached);
        assert_eq!(result.nodes, fx.session.nodes);
        assert_eq!(fx.client.calls(), 0);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn empty_pass_list_expires_quickly() {
        let fx = Fixture::new(&["a"]);
        fx.client.answer("a", rpc_result("0x1"));
        let key = fx.key();
        let ctx = CheckContext {
            session: &fx.session,
            session_key: &key,
            nodes: &fx.session.nodes,
            application: &fx.app,
            request_id: "req",
        };
        let result = ChainChecker::new(fx.env.clone()).chain_id_filter(&ctx, &check()).await.unwrap();
        assert!(result.nodes.is_empty());

        match fx.cache.ttl(&keys::chain_check(&key)).await.unwrap() {
            gateway_api::KeyTtl::Expires(left) => assert!(left <= std::time::Duration::from_secs(30)),
            other => panic!("unexpected ttl {other:?}"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn evidence_sealed_prunes_node_and_purges_checks() {
        let fx = Fixture::new(&["a", "b"]);
        fx.client.answer("a", Err(ClientError::EvidenceSealed));
        fx.client.answer("b", rpc_result("0x64"));
        let key = fx.key();
        fx.cache.set(&keys::sync_check(&key), r#"["a","b"]"#, None).await.unwrap();

        let ctx = CheckContext {
            session: &fx.session,
            session_key: &key,
            nodes: &fx.session.nodes,
            application: &fx.app,
            request_id: "req",
        };
        let result = ChainChecker::new(fx.env.clone()).chain_id_filter(&ctx, &check()).await.unwrap();

        assert_eq!(keys_of(&result.nodes), vec!["b"]);
        assert_eq!(crate::pruning::removed_nodes(fx.cache.as_ref(), &key).await.unwrap(), vec!["a"]);
        assert!(fx.cache.get(&keys::sync_check(&key)).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn invalid_session_drops_session_cache() {
        let fx = Fixture::new(&["a"]);
        fx.client.answer("a", Err(ClientError::InvalidSession));
        fx.cache.set("session-cached-app-pk-0021", "{}", None).await.unwrap();

        let key = fx.key();
        let ctx = CheckContext {
            session: &fx.session,
            session_key: &key,
            nodes: &fx.session.nodes,
            application: &fx.app,
            request_id: "req",
        };
        ChainChecker::new(fx.env.clone()).chain_id_filter(&ctx, &check()).await.unwrap();

        assert!(fx.cache.get("session-cached-app-pk-0021").await.unwrap().is_none());
    }
}
