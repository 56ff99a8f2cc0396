//! Outbound HTTP client for the metrics backend and resolved exporters.
//!
//! Every call here authenticates with the proxy's own service-account
//! token. Caller authorization has already constrained the query (federate)
//! or will filter the payload (scrape); upstream authentication is
//! independent of it.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use http::StatusCode;
use metrics_proxy_core::{Error, ProxyTarget, TrustAnchor};
use std::{pin::Pin, time::Duration};
use tracing::{debug, instrument};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

/// The proxy's outbound surface.
#[async_trait]
pub trait MetricsUpstream: Send + Sync + 'static {
    /// Forwards a rewritten federation query. The response status and body
    /// are relayed verbatim, success or not.
    async fn federate(&self, query: &[(String, String)])
        -> Result<(StatusCode, ByteStream), Error>;

    /// Runs an instant query against the query API.
    async fn query(&self, promql: &str) -> Result<(StatusCode, Bytes), Error>;

    /// Fetches a raw exposition payload from a resolved exporter target.
    async fn scrape(&self, target: &ProxyTarget) -> Result<(StatusCode, Bytes), Error>;
}

/// A Prometheus-compatible backend reached over a pooled client.
pub struct PrometheusUpstream {
    base: String,
    token: String,
    trust: TrustAnchor,
    timeout: Duration,
    client: reqwest::Client,
}

// === impl PrometheusUpstream ===

impl PrometheusUpstream {
    pub async fn new(
        base: String,
        token: String,
        trust: TrustAnchor,
        timeout: Duration,
    ) -> Result<Self> {
        let base = base.trim_end_matches('/').to_string();
        reqwest::Url::parse(&base).with_context(|| format!("invalid upstream URL '{base}'"))?;
        let client = build_client(&trust, timeout).await?;
        Ok(Self {
            base,
            token,
            trust,
            timeout,
            client,
        })
    }

    /// Scrape targets may require a different trust anchor than the base
    /// upstream (e.g. the cluster service CA); the pooled client is reused
    /// whenever the anchors agree.
    async fn client_for(&self, trust: &TrustAnchor) -> Result<reqwest::Client, Error> {
        if *trust == self.trust {
            return Ok(self.client.clone());
        }
        build_client(trust, self.timeout)
            .await
            .map_err(|error| Error::UpstreamUnavailable(format!("{error:#}")))
    }
}

#[async_trait]
impl MetricsUpstream for PrometheusUpstream {
    #[instrument(skip_all)]
    async fn federate(
        &self,
        query: &[(String, String)],
    ) -> Result<(StatusCode, ByteStream), Error> {
        let rsp = self
            .client
            .get(format!("{}/federate", self.base))
            .query(query)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(unavailable)?;
        let status = rsp.status();
        debug!(%status, "Federation response");
        let body = rsp.bytes_stream().map(|chunk| chunk.map_err(unavailable));
        Ok((status, Box::pin(body)))
    }

    #[instrument(skip_all)]
    async fn query(&self, promql: &str) -> Result<(StatusCode, Bytes), Error> {
        let rsp = self
            .client
            .get(format!("{}/api/v1/query", self.base))
            .query(&[("query", promql)])
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(unavailable)?;
        let status = rsp.status();
        let body = rsp.bytes().await.map_err(unavailable)?;
        Ok((status, body))
    }

    #[instrument(skip_all, fields(url = %target.url()))]
    async fn scrape(&self, target: &ProxyTarget) -> Result<(StatusCode, Bytes), Error> {
        let client = self.client_for(&target.trust).await?;
        let rsp = client
            .get(target.url())
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(unavailable)?;
        let status = rsp.status();
        let body = rsp.bytes().await.map_err(unavailable)?;
        Ok((status, body))
    }
}

async fn build_client(trust: &TrustAnchor, timeout: Duration) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout).use_rustls_tls();
    match trust {
        TrustAnchor::SystemRoots => {}
        TrustAnchor::Insecure => {
            builder = builder.danger_accept_invalid_certs(true);
        }
        TrustAnchor::CaBundle(path) => {
            let pem = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read CA bundle {}", path.display()))?;
            let certs = reqwest::Certificate::from_pem_bundle(&pem)
                .with_context(|| format!("invalid CA bundle {}", path.display()))?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }
    }
    builder.build().context("failed to build HTTP client")
}

fn unavailable(error: reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::UpstreamUnavailable(format!("request timed out: {error}"))
    } else {
        Error::UpstreamUnavailable(error.to_string())
    }
}
