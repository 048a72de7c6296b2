//! Per-session node verification shared by the chain and sync checkers.
//!
//! Both checkers follow the same cache discipline:
//! 1. a cached pass-list for the session short-circuits all probing;
//! 2. otherwise a 60 s advisory lock elects one process to probe, and every
//!    other process proceeds with the unfiltered node set;
//! 3. the elected process probes every node concurrently, each under its own
//!    timeout, and caches the public keys that passed.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use gateway_api::{CacheError, ClientError, RelayCall, RelayClient, RelayMetric, SharedCache};
use relay_types::{
    decode_quantity, lookup_path, retain_by_keys, ApplicationRef, CheckResult, HttpMethod, Node, Session, SessionKey,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::keys;
use crate::pruning::{remove_checks_cache, remove_node_from_session, remove_session_cache};
use crate::telemetry::{GatewayTelemetry, MetricsRecorder};

pub mod chain;
pub mod sync;

pub use chain::ChainChecker;
pub use sync::SyncChecker;

pub const CHECK_LOCK_TTL: Duration = Duration::from_secs(60);
pub const FAILED_CHECK_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("check cache unavailable: {0}")]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Chain,
    Sync,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Chain => "chain",
            CheckKind::Sync => "sync",
        }
    }

    pub fn cache_key(&self, session: &SessionKey) -> String {
        match self {
            CheckKind::Chain => keys::chain_check(session),
            CheckKind::Sync => keys::sync_check(session),
        }
    }

    /// Lifetime of a cached pass-list with at least one node in it.
    pub fn success_ttl(&self) -> Duration {
        match self {
            CheckKind::Chain => Duration::from_secs(600),
            CheckKind::Sync => Duration::from_secs(300),
        }
    }

    pub fn metric_method(&self) -> &'static str {
        match self {
            CheckKind::Chain => "chaincheck",
            CheckKind::Sync => "synccheck",
        }
    }

    pub fn failure_label(&self) -> &'static str {
        match self {
            CheckKind::Chain => "WRONG CHAIN",
            CheckKind::Sync => "OUT OF SYNC",
        }
    }
}

/// Collaborators every checker needs.
#[derive(Clone)]
pub struct CheckEnv {
    pub cache: Arc<dyn SharedCache>,
    pub client: Arc<dyn RelayClient>,
    pub metrics: MetricsRecorder,
    pub telemetry: Arc<GatewayTelemetry>,
    pub probe_timeout: Duration,
    pub debug: bool,
    pub origin: String,
}

/// Request-scoped inputs to a check.
#[derive(Clone, Copy)]
pub struct CheckContext<'a> {
    /// The full session; probes are authorised against it.
    pub session: &'a Session,
    pub session_key: &'a SessionKey,
    /// Nodes still eligible after pruning.
    pub nodes: &'a [Node],
    pub application: &'a ApplicationRef,
    pub request_id: &'a str,
}

impl CheckContext<'_> {
    pub fn chain_id(&self) -> &str {
        &self.session.chain_id
    }
}

pub(crate) enum Gate {
    Cached(Vec<Node>),
    Locked,
    Acquired,
}

pub(crate) async fn open_gate(
    env: &CheckEnv,
    kind: CheckKind,
    ctx: &CheckContext<'_>,
) -> Result<Gate, CheckError> {
    let key = kind.cache_key(ctx.session_key);
    if let Some(raw) = env.cache.get(&key).await? {
        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(list) => {
                let nodes = retain_by_keys(ctx.nodes, list.iter().map(String::as_str));
                return Ok(Gate::Cached(nodes));
            }
            Err(err) => {
                warn!(target: "checks", check = kind.as_str(), key = %key, error = %err, "discarding unreadable pass-list");
            }
        }
    }

    if env.cache.set_if_absent(&keys::lock(&key), "true", CHECK_LOCK_TTL).await? {
        Ok(Gate::Acquired)
    } else {
        Ok(Gate::Locked)
    }
}

/// Persist the passing public keys; an empty list is retried sooner.
pub(crate) async fn store_passing(
    env: &CheckEnv,
    kind: CheckKind,
    ctx: &CheckContext<'_>,
    passing: &[Node],
) -> Result<(), CheckError> {
    let list: Vec<&str> = passing.iter().map(|n| n.public_key.as_str()).collect();
    let ttl = if passing.is_empty() { FAILED_CHECK_TTL } else { kind.success_ttl() };
    let body = serde_json::to_string(&list).unwrap_or_else(|_| "[]".to_string());
    env.cache.set(&kind.cache_key(ctx.session_key), &body, Some(ttl)).await?;
    Ok(())
}

/// Cache gate around a checker body. `evaluate` returns `None` when it could not reach a
/// verdict; the input set is then returned unfiltered and nothing is cached.
pub(crate) async fn gated<F, Fut>(
    env: &CheckEnv,
    kind: CheckKind,
    ctx: &CheckContext<'_>,
    evaluate: F,
) -> Result<CheckResult, CheckError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Option<Vec<Node>>>,
{
    match open_gate(env, kind, ctx).await? {
        Gate::Cached(nodes) => {
            env.telemetry.record_check_cache(true);
            return Ok(CheckResult::cached(nodes));
        }
        Gate::Locked => {
            env.telemetry.record_lock_contended();
            debug!(
                target: "checks",
                check = kind.as_str(),
                session_key = %ctx.session_key,
                "check already running elsewhere; using unfiltered nodes"
            );
            return Ok(CheckResult::fresh(ctx.nodes.to_vec()));
        }
        Gate::Acquired => env.telemetry.record_check_cache(false),
    }

    match evaluate().await {
        Some(passing) => {
            store_passing(env, kind, ctx, &passing).await?;
            info!(
                target: "checks",
                check = kind.as_str(),
                request_id = ctx.request_id,
                chain = ctx.chain_id(),
                session_key = %ctx.session_key,
                passed = passing.len(),
                probed = ctx.nodes.len(),
                "check complete"
            );
            Ok(CheckResult::fresh(passing))
        }
        None => Ok(CheckResult::fresh(ctx.nodes.to_vec())),
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("undecodable probe response: {0}")]
    Decode(String),
}

#[derive(Debug)]
pub(crate) struct ProbeOutcome {
    pub node: Node,
    pub elapsed: Duration,
    pub result: Result<u64, ProbeError>,
}

/// Relay `payload` to every node concurrently and decode `result_key` from each answer.
pub(crate) async fn probe_all(
    env: &CheckEnv,
    ctx: &CheckContext<'_>,
    payload: &str,
    path: Option<&str>,
    result_key: &str,
) -> Vec<ProbeOutcome> {
    let probes = ctx.nodes.iter().cloned().map(|node| {
        let call = RelayCall {
            data: payload.to_string(),
            chain_id: ctx.chain_id().to_string(),
            aat: ctx.application.aat.clone(),
            node: node.clone(),
            path: path.map(str::to_string),
            method: HttpMethod::Post,
            timeout: env.probe_timeout,
            retry_attempts: 1,
        };
        let client = Arc::clone(&env.client);
        let timeout = env.probe_timeout;
        let debug_payloads = env.debug;
        async move {
            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, client.relay(&call)).await {
                Err(_) => Err(ProbeError::Client(ClientError::Timeout)),
                Ok(Err(err)) => Err(ProbeError::Client(err)),
                Ok(Ok(resp)) => {
                    if debug_payloads {
                        debug!(target: "checks", node = %node.public_key, payload = %resp.payload, "probe response");
                    }
                    decode_probe(&resp.payload, result_key)
                }
            };
            ProbeOutcome { node, elapsed: started.elapsed(), result }
        }
    });
    join_all(probes).await
}

fn decode_probe(payload: &str, result_key: &str) -> Result<u64, ProbeError> {
    let value: Value = serde_json::from_str(payload).map_err(|e| ProbeError::Decode(e.to_string()))?;
    lookup_path(&value, result_key)
        .and_then(decode_quantity)
        .ok_or_else(|| ProbeError::Decode(format!("missing or non-numeric `{result_key}`")))
}

/// Side effects of a failed probe, shared by both checkers. Cache trouble here is logged only.
pub(crate) async fn handle_probe_failure(
    env: &CheckEnv,
    kind: CheckKind,
    ctx: &CheckContext<'_>,
    outcome: &ProbeOutcome,
    err: &ProbeError,
) {
    let node = &outcome.node;
    let cache = env.cache.as_ref();

    let side_effect = match err {
        ProbeError::Client(ClientError::EvidenceSealed) => {
            env.telemetry.record_node_pruned();
            remove_node_from_session(cache, ctx.session_key, &node.public_key, true).await
        }
        ProbeError::Client(e) if e.invalidates_session() => {
            match remove_session_cache(cache, &ctx.application.public_key, ctx.chain_id()).await {
                Ok(()) => remove_checks_cache(cache, ctx.session_key).await,
                Err(e) => Err(e),
            }
        }
        ProbeError::Client(e) if e.is_rate_limited() => {
            env.telemetry.record_node_pruned();
            remove_node_from_session(cache, ctx.session_key, &node.public_key, false).await
        }
        _ => Ok(()),
    };
    if let Err(cache_err) = side_effect {
        warn!(
            target: "checks",
            check = kind.as_str(),
            node = %node.public_key,
            error = %cache_err,
            "failed to apply probe failure side effects"
        );
    }

    info!(
        target: "checks",
        check = kind.as_str(),
        request_id = ctx.request_id,
        chain = ctx.chain_id(),
        node = %node.public_key,
        service_domain = %node.service_domain(),
        error = %err,
        "probe failed"
    );
    env.metrics
        .record(failure_metric(env, kind, ctx, node, outcome.elapsed, err.to_string()))
        .await;
}

pub(crate) fn failure_metric(
    env: &CheckEnv,
    kind: CheckKind,
    ctx: &CheckContext<'_>,
    node: &Node,
    elapsed: Duration,
    error: String,
) -> RelayMetric {
    RelayMetric {
        request_id: ctx.request_id.to_string(),
        application_id: ctx.application.id.clone(),
        application_public_key: ctx.application.public_key.clone(),
        chain_id: ctx.chain_id().to_string(),
        service_node: node.public_key.clone(),
        elapsed,
        result: 500,
        bytes: kind.failure_label().len(),
        delivered: false,
        fallback: false,
        method: kind.metric_method().to_string(),
        error: Some(error),
        origin: env.origin.clone(),
        session_key: Some(ctx.session_key.to_string()),
    }
}
