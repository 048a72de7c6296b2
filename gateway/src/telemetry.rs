//! Relay metrics reporting plus in-process counters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gateway_api::{MetricsError, MetricsSink, RelayMetric};
use tracing::{error, info};

// Keep a bounded number of latency samples to avoid unbounded memory growth.
const TELEMETRY_WINDOW: usize = 1000;

/// Best-effort wrapper around a [`MetricsSink`]: failures are logged, never returned.
#[derive(Clone)]
pub struct MetricsRecorder {
    sink: Arc<dyn MetricsSink>,
}

impl MetricsRecorder {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }

    pub async fn record(&self, metric: RelayMetric) {
        if let Err(err) = self.sink.record(&metric).await {
            error!(
                target: "metrics",
                request_id = %metric.request_id,
                chain = %metric.chain_id,
                error = %err,
                "Error recording metrics"
            );
        }
    }
}

/// Sink that only emits a structured log line per metric.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

#[async_trait]
impl MetricsSink for TracingMetricsSink {
    async fn record(&self, metric: &RelayMetric) -> Result<(), MetricsError> {
        info!(
            target: "metrics",
            request_id = %metric.request_id,
            application_id = %metric.application_id,
            chain = %metric.chain_id,
            node = %metric.service_node,
            result = metric.result,
            bytes = metric.bytes,
            elapsed_ms = metric.elapsed.as_millis() as u64,
            delivered = metric.delivered,
            fallback = metric.fallback,
            method = %metric.method,
            error = metric.error.as_deref().unwrap_or(""),
            "relay metric"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct GatewayTelemetry {
    relays_ok: AtomicU64,
    relays_err: AtomicU64,
    fallbacks_ok: AtomicU64,
    fallbacks_err: AtomicU64,
    check_cache_hits: AtomicU64,
    check_cache_misses: AtomicU64,
    check_lock_contended: AtomicU64,
    nodes_pruned: AtomicU64,
    limits_rejected: AtomicU64,
    relay_ms: Mutex<VecDeque<u128>>,
}

#[derive(Clone, Debug, Default)]
pub struct GatewayTelemetrySummary {
    pub relays_ok: u64,
    pub relays_err: u64,
    pub fallbacks_ok: u64,
    pub fallbacks_err: u64,
    pub check_cache_hits: u64,
    pub check_cache_misses: u64,
    pub check_lock_contended: u64,
    pub nodes_pruned: u64,
    pub limits_rejected: u64,
    pub relay_ms_p50: Option<f64>,
    pub relay_ms_p95: Option<f64>,
    pub success_rate: f64,
}

impl GatewayTelemetry {
    pub fn record_relay(&self, duration: Option<Duration>, success: bool) {
        if success {
            self.relays_ok.fetch_add(1, Ordering::Relaxed);
            if let Some(dur) = duration {
                if let Ok(mut samples) = self.relay_ms.lock() {
                    samples.push_back(dur.as_millis());
                    while samples.len() > TELEMETRY_WINDOW {
                        samples.pop_front();
                    }
                }
            }
        } else {
            self.relays_err.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_fallback(&self, success: bool) {
        if success {
            self.fallbacks_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fallbacks_err.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_check_cache(&self, hit: bool) {
        if hit {
            self.check_cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.check_cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_lock_contended(&self) {
        self.check_lock_contended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_node_pruned(&self) {
        self.nodes_pruned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_limit_rejected(&self) {
        self.limits_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> GatewayTelemetrySummary {
        let relays_ok = self.relays_ok.load(Ordering::Relaxed);
        let relays_err = self.relays_err.load(Ordering::Relaxed);
        let (relay_ms_p50, relay_ms_p95) = match self.relay_ms.lock() {
            Ok(samples) => (percentile(&samples, 0.50), percentile(&samples, 0.95)),
            Err(_) => (None, None),
        };
        let total = relays_ok + relays_err;
        let success_rate = if total == 0 { 0.0 } else { relays_ok as f64 / total as f64 };

        GatewayTelemetrySummary {
            relays_ok,
            relays_err,
            fallbacks_ok: self.fallbacks_ok.load(Ordering::Relaxed),
            fallbacks_err: self.fallbacks_err.load(Ordering::Relaxed),
            check_cache_hits: self.check_cache_hits.load(Ordering::Relaxed),
            check_cache_misses: self.check_cache_misses.load(Ordering::Relaxed),
            check_lock_contended: self.check_lock_contended.load(Ordering::Relaxed),
            nodes_pruned: self.nodes_pruned.load(Ordering::Relaxed),
            limits_rejected: self.limits_rejected.load(Ordering::Relaxed),
            relay_ms_p50,
            relay_ms_p95,
            success_rate,
        }
    }
}

fn percentile(samples: &VecDeque<u128>, q: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted: Vec<u128> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let rank = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted.get(rank).map(|v| *v as f64)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Sink that keeps every metric for assertions.
    #[derive(Default)]
    pub struct CollectingSink {
        pub metrics: Mutex<Vec<RelayMetric>>,
    }

    impl CollectingSink {
        pub fn snapshot(&self) -> Vec<RelayMetric> {
            self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl MetricsSink for CollectingSink {
        async fn record(&self, metric: &RelayMetric) -> Result<(), MetricsError> {
            if let Ok(mut m) = self.metrics.lock() {
                m.push(metric.clone());
            }
            Ok(())
        }
    }
}
