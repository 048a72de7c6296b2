// Operator tool for poking at fallback endpoints and the verification rules
// without standing up the gateway.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use relay_gateway::checks::sync::classify;
use relay_gateway::limiter::{enforce_log_limits, FallbackHead};
use relay_gateway::FallbackClient;
use relay_types::{Node, NodeLog, Observation, SyncCheckOptions};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "relay-probe", version, about = "Relay gateway diagnostics")]
struct Args {
    /// HTTP timeout for fallback calls (ms)
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask a fallback endpoint for its head height
    Head {
        #[arg(long)]
        fallback: Url,

        /// Custom height query body; defaults to eth_blockNumber
        #[arg(long)]
        body: Option<String>,

        /// Dotted path of the height in the response
        #[arg(long, default_value = "result")]
        result_key: String,

        #[arg(long)]
        path: Option<String>,
    },
    /// Check an eth_getLogs request against a block-range limit
    Logs {
        /// Raw JSON-RPC request (single or batch)
        #[arg(long)]
        request: String,

        #[arg(long, default_value_t = 10_000)]
        limit: u64,

        /// Used to resolve `latest`
        #[arg(long)]
        fallback: Option<Url>,
    },
    /// Classify a set of node heights the way the sync check would
    Classify {
        /// Comma-separated heights, one per node (0 = no answer)
        #[arg(long, value_delimiter = ',')]
        heights: Vec<u64>,

        #[arg(long, default_value_t = 5)]
        allowance: u64,

        #[arg(long)]
        fallback_height: Option<u64>,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let client = FallbackClient::new(Duration::from_millis(args.timeout_ms))?;

    match args.command {
        Command::Head { fallback, body, result_key, path } => {
            let height = match body {
                Some(body) => {
                    let opts = SyncCheckOptions { body, path, result_key, allowance: 0 };
                    client.block_height(&fallback, &opts).await?
                }
                None => client.latest_block_number(&fallback).await?,
            };
            println!("{height}");
        }
        Command::Logs { request, limit, fallback } => {
            let value: serde_json::Value = serde_json::from_str(&request).context("parsing --request")?;
            let head = FallbackHead { client: &client, url: fallback.as_ref() };
            match enforce_log_limits(&value, limit, &head).await {
                Ok(()) => println!("ok"),
                Err(err) => bail!("rejected: {err}"),
            }
        }
        Command::Classify { heights, allowance, fallback_height } => {
            let logs: Vec<NodeLog> = heights
                .iter()
                .enumerate()
                .filter(|(_, h)| **h > 0)
                .map(|(i, h)| NodeLog { node: Node::new(format!("node-{i}")), observation: Observation::BlockHeight(*h) })
                .collect();
            let Some(verdict) = classify(logs, heights.len(), allowance, fallback_height) else {
                bail!("no usable head: nodes disagree and no fallback height was given");
            };
            println!(
                "highest={} fallback={} trusted={}",
                verdict.highest, verdict.fallback_height, verdict.fallback_trusted
            );
            for log in &verdict.in_sync {
                println!("in-sync  {} {}", log.node.public_key, log.height().unwrap_or(0));
            }
            for log in &verdict.behind {
                println!("behind   {} {}", log.node.public_key, log.height().unwrap_or(0));
            }
        }
    }
    Ok(())
}
