//! Plain-HTTP access to the trusted fallback ("altruist") endpoint of a chain.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use relay_types::{decode_quantity, lookup_path, HttpMethod, SyncCheckOptions};
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::debug;
use url::Url;

#[derive(Clone, Debug)]
pub struct FallbackClient {
    http: Client,
    default_timeout: Duration,
}

impl FallbackClient {
    pub fn new(default_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(default_timeout.min(Duration::from_secs(10)))
            .build()
            .context("building fallback client")?;
        Ok(Self { http, default_timeout })
    }

    /// Replay a client request against the fallback, keeping its method and path.
    pub async fn replay(
        &self,
        base: &Url,
        path: Option<&str>,
        method: HttpMethod,
        body: &str,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let url = join_path(base, path)?;
        let mut req = self
            .http
            .request(to_reqwest(method), url)
            .timeout(timeout.unwrap_or(self.default_timeout));

        if !body.is_empty() {
            req = req
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.to_string());
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("fallback request to {}", redact_url(base)))?;
        let status = resp.status();
        let text = resp.text().await.context("reading fallback response body")?;
        if !status.is_success() {
            bail!("fallback {} returned {}", redact_url(base), status);
        }
        Ok(text)
    }

    /// Head height as reported by the fallback for a chain's sync probe.
    pub async fn block_height(&self, base: &Url, opts: &SyncCheckOptions) -> Result<u64> {
        let url = join_path(base, opts.path.as_deref())?;
        let resp = self
            .http
            .post(url)
            .timeout(self.default_timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(opts.body.clone())
            .send()
            .await
            .with_context(|| format!("sync probe to {}", redact_url(base)))?
            .error_for_status()
            .context("fallback sync probe status")?;

        let payload: Value = resp.json().await.context("decoding fallback sync payload")?;
        debug!(target: "fallback", url = %redact_url(base), %payload, "fallback sync payload");

        lookup_path(&payload, &opts.result_key)
            .and_then(decode_quantity)
            .ok_or_else(|| anyhow!("fallback payload has no usable `{}`", opts.result_key))
    }

    /// `eth_blockNumber` against the fallback, used to resolve `latest` in log ranges.
    pub async fn latest_block_number(&self, base: &Url) -> Result<u64> {
        let opts = SyncCheckOptions {
            body: serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "eth_blockNumber",
                "params": [],
            })
            .to_string(),
            path: None,
            result_key: "result".to_string(),
            allowance: 0,
        };
        self.block_height(base, &opts).await
    }
}

fn to_reqwest(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Delete => Method::DELETE,
    }
}

/// Append a relay path to the fallback base URL.
pub fn join_path(base: &Url, path: Option<&str>) -> Result<Url> {
    let path = match path.map(str::trim) {
        None | Some("") => return Ok(base.clone()),
        Some(p) => p,
    };
    let joined = if path.starts_with('/') {
        format!("{}{}", base.as_str().trim_end_matches('/'), path)
    } else {
        format!("{}/{}", base.as_str().trim_end_matches('/'), path)
    };
    Url::parse(&joined).with_context(|| format!("joining relay path {path}"))
}

/// The URL without its userinfo, safe for logs and metric labels.
pub fn redact_url(url: &Url) -> String {
    let mut clean = url.clone();
    // Only fails for cannot-be-a-base URLs, which carry no credentials anyway.
    let _ = clean.set_username("");
    let _ = clean.set_password(None);
    clean.to_string()
}
