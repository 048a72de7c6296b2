//! Relay dispatch: session lookup, node verification, retries and the fallback path.
//!
//! One client request runs through
//! `load chain -> limits -> access rules -> attempt* -> fallback -> give up`.
//! Each attempt fetches the session, drops nodes already pulled out of it, runs the
//! chain and sync checks concurrently, lets the selector pick a node and relays to it.
//! Attempt state lives in [`AttemptContext`]; the dispatcher itself is shared and
//! holds no per-request data.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use gateway_api::{
    ChainLookup, NodeSelector, RelayCall, RelayClient, RelayMetric, RelayResponse, SharedCache,
};
use relay_types::{retain_by_keys, exclude_by_keys, ChainConfig, Node, RelayError, SessionKey};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::keys;
use crate::checks::{ChainChecker, CheckContext, CheckEnv, SyncChecker};
use crate::config::GatewayConfig;
use crate::enforcement::{authorize, looks_like_json, violates_json_enforcement};
use crate::fallback::{redact_url, FallbackClient};
use crate::limiter::{enforce_log_limits, FallbackHead};
use crate::pruning::{remove_node_from_session, removed_nodes};
use crate::request::{parse_request, ParsedRequest, SendRelayOptions};
use crate::telemetry::{GatewayTelemetry, MetricsRecorder};

mod error;

pub use error::{AttemptError, GatewayError};

/// How long a node's error counter survives without new failures.
pub const NODE_ERRORS_TTL: Duration = Duration::from_secs(3600);

/// Label used in metrics for failures that are not attributable to one node.
const SESSION_FAILURE_NODE: &str = "session-failure";

/// The body handed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutput {
    /// Decoded because the chain enforces JSON results.
    Json(Value),
    Raw(String),
}

/// External collaborators of the dispatcher.
#[derive(Clone)]
pub struct GatewayDeps {
    pub cache: Arc<dyn SharedCache>,
    pub client: Arc<dyn RelayClient>,
    pub chains: Arc<dyn ChainLookup>,
    pub selector: Arc<dyn NodeSelector>,
    pub metrics: MetricsRecorder,
}

pub struct RelayDispatcher {
    config: GatewayConfig,
    deps: GatewayDeps,
    telemetry: Arc<GatewayTelemetry>,
    fallback: FallbackClient,
    chain_checker: ChainChecker,
    sync_checker: SyncChecker,
}

/// Per-request values shared by every attempt.
struct RequestScope<'a> {
    opts: &'a SendRelayOptions,
    chain: &'a ChainConfig,
    request: &'a ParsedRequest,
    fallback_url: Option<&'a Url>,
}

/// Per-attempt state, filled in as the attempt progresses.
#[derive(Debug)]
struct AttemptContext {
    index: u32,
    started: Instant,
    session_key: Option<SessionKey>,
    node: Option<Node>,
}

impl AttemptContext {
    fn new(index: u32) -> Self {
        Self { index, started: Instant::now(), session_key: None, node: None }
    }
}

impl RelayDispatcher {
    pub fn new(config: GatewayConfig, deps: GatewayDeps) -> anyhow::Result<Self> {
        let telemetry = Arc::new(GatewayTelemetry::default());
        let fallback = FallbackClient::new(config.fallback_timeout).context("initialising fallback client")?;
        let env = CheckEnv {
            cache: Arc::clone(&deps.cache),
            client: Arc::clone(&deps.client),
            metrics: deps.metrics.clone(),
            telemetry: Arc::clone(&telemetry),
            probe_timeout: config.check_timeout,
            debug: config.check_debug,
            origin: config.origin.clone(),
        };
        let chain_checker = ChainChecker::new(env.clone());
        let sync_checker = SyncChecker::new(env, fallback.clone(), config.default_sync_allowance);
        Ok(Self { config, deps, telemetry, fallback, chain_checker, sync_checker })
    }

    pub fn telemetry(&self) -> Arc<GatewayTelemetry> {
        Arc::clone(&self.telemetry)
    }

    pub async fn send_relay(&self, opts: SendRelayOptions) -> Result<RelayOutput, GatewayError> {
        let chain = self.deps.chains.load_chain(&opts.host).await.map_err(|err| {
            error!(target: "relay", host = %opts.host, error = %err, origin = %self.config.origin, "Incorrect blockchain");
            GatewayError::BadRequest(format!("Incorrect blockchain: {}", opts.host))
        })?;
        let overall_started = Instant::now();

        let request = parse_request(&opts.raw_data)
            .map_err(|err| GatewayError::BadRequest(format!("Invalid request body: {err}")))?;

        let fallback_url = self.config.fallback_for(&chain.chain_id);
        let log_limit = match opts.log_limit_blocks {
            Some(limit) if limit > 0 => limit,
            _ if chain.log_limit_blocks > 0 => chain.log_limit_blocks,
            _ => self.config.default_log_limit_blocks,
        };
        let head = FallbackHead { client: &self.fallback, url: fallback_url };
        if let Err(limit_err) = enforce_log_limits(&request.value, log_limit, &head).await {
            self.telemetry.record_limit_rejected();
            error!(
                target: "relay",
                request_id = %opts.request_id,
                chain = %chain.chain_id,
                application_id = %opts.application.id,
                method = %request.method,
                error = %limit_err,
                "LIMITATION ERROR"
            );
            return Err(GatewayError::BadRequest(limit_err.to_string()));
        }

        authorize(&opts.application.settings, &opts.caller).map_err(GatewayError::Forbidden)?;

        let scope = RequestScope { opts: &opts, chain: &chain, request: &request, fallback_url };
        let retries = opts.relay_retries.unwrap_or(self.config.relay_retries);
        let overall_timeout = opts.overall_timeout.unwrap_or(self.config.overall_timeout);

        if !self.config.always_redirect_to_fallback {
            for index in 0..=retries {
                if overall_started.elapsed() > overall_timeout {
                    error!(target: "relay", request_id = %opts.request_id, timeout_ms = overall_timeout.as_millis() as u64, "Overall Timeout exceeded");
                    return Err(GatewayError::GatewayTimeout(format!(
                        "Overall Timeout exceeded: {}",
                        overall_timeout.as_millis()
                    )));
                }

                let mut attempt = AttemptContext::new(index);
                match self.attempt(&scope, &mut attempt).await {
                    Ok(response) => return Ok(self.on_success(&scope, &attempt, response).await),
                    Err(AttemptError::Relay(relay_err)) => {
                        let last = index == retries;
                        self.on_relay_error(&scope, &attempt, &relay_err, last).await;
                    }
                    Err(other) => {
                        self.telemetry.record_relay(None, false);
                        warn!(
                            target: "relay",
                            request_id = %opts.request_id,
                            chain = %chain.chain_id,
                            attempt = index + 1,
                            attempts = retries + 1,
                            error = %other,
                            "relay attempt failed"
                        );
                    }
                }
            }
        }

        if let Some(url) = fallback_url {
            match self.relay_via_fallback(&scope, url).await {
                Ok(output) => return Ok(output),
                Err(err) => {
                    self.telemetry.record_fallback(false);
                    error!(
                        target: "fallback",
                        request_id = %opts.request_id,
                        chain = %chain.chain_id,
                        node = %format!("fallback:{}", redact_url(url)),
                        error = %format!("{err:#}"),
                        "fallback relay failed"
                    );
                }
            }
        }

        Err(GatewayError::GatewayTimeout("Relay attempts exhausted".to_string()))
    }

    async fn attempt(
        &self,
        scope: &RequestScope<'_>,
        attempt: &mut AttemptContext,
    ) -> Result<RelayResponse, AttemptError> {
        let opts = scope.opts;
        let chain_id = scope.chain.chain_id.as_str();
        let app = &opts.application;

        let session = self
            .deps
            .client
            .session(&app.aat, chain_id, self.config.session_timeout)
            .await
            .map_err(|err| {
                error!(target: "relay", request_id = %opts.request_id, chain = chain_id, error = %err, "ERROR obtaining a session");
                AttemptError::Session(err)
            })?;
        let session_key = session.key();
        attempt.session_key = Some(session_key.clone());

        let removed = removed_nodes(self.deps.cache.as_ref(), &session_key).await?;
        let nodes = exclude_by_keys(&session.nodes, removed.iter().map(String::as_str));
        if nodes.is_empty() {
            warn!(target: "relay", request_id = %opts.request_id, session_key = %session_key, "SESSION has exhausted all node relays");
            return Err(AttemptError::NoAvailableNodes);
        }

        let ctx = CheckContext {
            session: &session,
            session_key: &session_key,
            nodes: &nodes,
            application: app,
            request_id: &opts.request_id,
        };
        let nodes = self.filter_checked(scope, attempt, &ctx).await?;

        let node = self
            .deps
            .selector
            .pick(&app.id, chain_id, &nodes, &opts.request_id)
            .await
            .ok_or(AttemptError::NoNodeSelected)?;
        attempt.node = Some(node.clone());

        let call = RelayCall {
            data: scope.request.data.clone(),
            chain_id: chain_id.to_string(),
            aat: app.aat.clone(),
            node: node.clone(),
            path: opts.relay_path.clone(),
            method: opts.http_method,
            timeout: opts.request_timeout.unwrap_or(self.config.relay_timeout),
            retry_attempts: 1,
        };
        let relayed = self.deps.client.relay(&call).await;
        if self.config.check_debug {
            debug!(target: "relay", request_id = %opts.request_id, node = %node.public_key, response = ?relayed, "relay response");
        }

        match relayed {
            Ok(response) => {
                if scope.chain.enforces_json() && violates_json_enforcement(&response.payload) {
                    Err(AttemptError::Relay(RelayError::new(
                        response.payload,
                        503,
                        response.servicer_public_key,
                    )))
                } else {
                    Ok(response)
                }
            }
            Err(err) => {
                if err.is_rate_limited() {
                    self.telemetry.record_node_pruned();
                    let pruned =
                        remove_node_from_session(self.deps.cache.as_ref(), &session_key, &node.public_key, false).await;
                    if let Err(cache_err) = pruned {
                        warn!(
                            target: "relay",
                            request_id = %opts.request_id,
                            session_key = %session_key,
                            node = %node.public_key,
                            error = %cache_err,
                            "failed to prune rate-limited node"
                        );
                    }
                }
                Err(AttemptError::Relay(RelayError::new(err.to_string(), 500, node.public_key)))
            }
        }
    }

    /// Run the configured checks concurrently and combine their pass-lists.
    async fn filter_checked(
        &self,
        scope: &RequestScope<'_>,
        attempt: &AttemptContext,
        ctx: &CheckContext<'_>,
    ) -> Result<Vec<Node>, AttemptError> {
        let chain = scope.chain;
        let chain_check = async {
            match &chain.chain_id_check {
                Some(check) => Some(self.chain_checker.chain_id_filter(ctx, check).await),
                None => None,
            }
        };
        let sync_check = async {
            match &chain.sync_check {
                Some(opts) => Some(self.sync_checker.consensus_filter(ctx, opts, scope.fallback_url).await),
                None => None,
            }
        };
        let (chain_result, sync_result) = tokio::join!(chain_check, sync_check);

        let chain_nodes = match chain_result {
            Some(Ok(result)) => Some(result.nodes),
            Some(Err(err)) => return Err(self.check_failed(scope, attempt, "ChainID", err).await),
            None => None,
        };
        let sync_nodes = match sync_result {
            Some(Ok(result)) => Some(result.nodes),
            Some(Err(err)) => return Err(self.check_failed(scope, attempt, "Sync", err).await),
            None => None,
        };

        match (chain_nodes, sync_nodes) {
            (Some(chain_ok), Some(sync_ok)) => {
                let both = retain_by_keys(&sync_ok, chain_ok.iter().map(|n| n.public_key.as_str()));
                if both.is_empty() {
                    Err(AttemptError::NoNodePassedChecks)
                } else {
                    Ok(both)
                }
            }
            (None, Some(passing)) | (Some(passing), None) if !passing.is_empty() => Ok(passing),
            _ => Ok(ctx.nodes.to_vec()),
        }
    }

    async fn check_failed(
        &self,
        scope: &RequestScope<'_>,
        attempt: &AttemptContext,
        label: &'static str,
        source: crate::checks::CheckError,
    ) -> AttemptError {
        let err = AttemptError::Check { label, source };
        let message = format!("{label} check failure");
        self.deps
            .metrics
            .record(self.metric(scope, attempt, SESSION_FAILURE_NODE, 500, message.len(), "checks", Some(message)))
            .await;
        err
    }

    async fn on_success(
        &self,
        scope: &RequestScope<'_>,
        attempt: &AttemptContext,
        response: RelayResponse,
    ) -> RelayOutput {
        let opts = scope.opts;
        let elapsed = attempt.started.elapsed();
        self.telemetry.record_relay(Some(elapsed), true);
        info!(
            target: "relay",
            request_id = %opts.request_id,
            chain = %scope.chain.chain_id,
            node = %response.servicer_public_key,
            attempt = attempt.index + 1,
            elapsed_ms = elapsed.as_millis() as u64,
            "SUCCESS relaying"
        );

        let method = scope.request.method.clone();
        self.deps
            .metrics
            .record(self.metric(
                scope,
                attempt,
                &response.servicer_public_key,
                200,
                response.payload.len(),
                &method,
                None,
            ))
            .await;

        let errors_key = keys::node_errors(&scope.chain.chain_id, &response.servicer_public_key);
        if let Err(err) = self.deps.cache.delete(&errors_key).await {
            warn!(target: "relay", key = %errors_key, error = %err, "could not clear node error counter");
        }

        if scope.chain.enforces_json() {
            match serde_json::from_str(&response.payload) {
                Ok(value) => return RelayOutput::Json(value),
                Err(err) => warn!(target: "relay", error = %err, "enforced JSON payload failed to decode"),
            }
        }
        RelayOutput::Raw(response.payload)
    }

    async fn on_relay_error(
        &self,
        scope: &RequestScope<'_>,
        attempt: &AttemptContext,
        relay_err: &RelayError,
        last_attempt: bool,
    ) {
        self.telemetry.record_relay(None, false);
        // The caller never sees this error when the fallback gets another go.
        let delivered = !(last_attempt && scope.fallback_url.is_some());

        let errors_key = keys::node_errors(&scope.chain.chain_id, &relay_err.node);
        let bumped = match self.deps.cache.incr(&errors_key).await {
            Ok(_) => self.deps.cache.expire(&errors_key, NODE_ERRORS_TTL).await.map(|_| ()),
            Err(err) => Err(err),
        };
        if let Err(err) = bumped {
            warn!(target: "relay", key = %errors_key, error = %err, "could not bump node error counter");
        }

        warn!(
            target: "relay",
            request_id = %scope.opts.request_id,
            chain = %scope.chain.chain_id,
            node = %relay_err.node,
            status = relay_err.status,
            attempt = attempt.index + 1,
            error = %relay_err.message,
            "relay error"
        );

        let mut metric = self.metric(
            scope,
            attempt,
            &relay_err.node,
            500,
            relay_err.message.len(),
            &scope.request.method,
            Some(relay_err.message.clone()),
        );
        metric.delivered = delivered;
        self.deps.metrics.record(metric).await;
    }

    async fn relay_via_fallback(&self, scope: &RequestScope<'_>, url: &Url) -> anyhow::Result<RelayOutput> {
        let opts = scope.opts;
        let started = Instant::now();
        let body = self
            .fallback
            .replay(url, opts.relay_path.as_deref(), opts.http_method, &opts.raw_data, opts.request_timeout)
            .await?;

        if self.config.check_debug {
            debug!(target: "fallback", request_id = %opts.request_id, body = %body, "fallback response");
        }
        self.telemetry.record_fallback(true);

        let attempt = AttemptContext { index: 0, started, session_key: None, node: None };
        let mut metric = self.metric(
            scope,
            &attempt,
            &format!("fallback:{}", redact_url(url)),
            200,
            body.len(),
            &scope.request.method,
            None,
        );
        metric.fallback = true;
        self.deps.metrics.record(metric).await;

        if scope.chain.enforces_json() && looks_like_json(&body) {
            if let Ok(value) = serde_json::from_str(&body) {
                return Ok(RelayOutput::Json(value));
            }
        }
        Ok(RelayOutput::Raw(body))
    }

    #[allow(clippy::too_many_arguments)]
    fn metric(
        &self,
        scope: &RequestScope<'_>,
        attempt: &AttemptContext,
        service_node: &str,
        result: u16,
        bytes: usize,
        method: &str,
        error: Option<String>,
    ) -> RelayMetric {
        let app = &scope.opts.application;
        RelayMetric {
            request_id: scope.opts.request_id.clone(),
            application_id: app.id.clone(),
            application_public_key: app.aat.application_public_key.clone(),
            chain_id: scope.chain.chain_id.clone(),
            service_node: service_node.to_string(),
            elapsed: attempt.started.elapsed(),
            result,
            bytes,
            delivered: false,
            fallback: false,
            method: method.to_string(),
            error,
            origin: self.config.origin.clone(),
            session_key: attempt.session_key.as_ref().map(SessionKey::to_string),
        }
    }
}
