pub mod cache;
pub mod chains;
pub mod checks;
pub mod config;
pub mod enforcement;
pub mod fallback;
pub mod limiter;
pub mod pruning;
pub mod relayer;
pub mod request;
pub mod selector;
pub mod telemetry;

pub use cache::MemoryCache;
pub use chains::{CachedChainLookup, StaticChainLookup};
pub use checks::{ChainChecker, CheckContext, CheckEnv, CheckError, SyncChecker};
pub use config::GatewayConfig;
pub use enforcement::CallerInfo;
pub use fallback::FallbackClient;
pub use relayer::{AttemptError, GatewayDeps, GatewayError, RelayDispatcher, RelayOutput};
pub use request::SendRelayOptions;
pub use selector::RandomNodeSelector;
pub use telemetry::{GatewayTelemetry, GatewayTelemetrySummary, MetricsRecorder, TracingMetricsSink};
