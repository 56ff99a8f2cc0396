use crate::{metrics::Metrics, proxy::Proxy, server, upstream::PrometheusUpstream};
use anyhow::{bail, Context, Result};
use clap::Parser;
use metrics_proxy_core::TrustAnchor;
use metrics_proxy_k8s::{destination::SERVICE_CA_BUNDLE, ClusterDestinations, ProjectResolver};
use prometheus_client::registry::Registry;
use secrecy::ExposeSecret;
use std::net::SocketAddr;
use tokio::time::Duration;
use tracing::{info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "metrics-proxy",
    about = "A namespace-scoped authorization proxy for Prometheus metrics"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "metrics_proxy=info,warn",
        env = "METRICS_PROXY_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Address the proxy listens on.
    #[clap(long, default_value = "0.0.0.0:8080")]
    listen_addr: SocketAddr,

    /// Base URL of the upstream Prometheus.
    #[clap(long, env = "UPSTREAM")]
    upstream: String,

    /// Upstream TLS verification: `true`, `false`, or `service` to trust
    /// the cluster service CA bundle.
    #[clap(long, env = "SSL_VERIFY", default_value = "true")]
    ssl_verify: TlsMode,

    /// Timeout applied to every upstream call, in seconds.
    #[clap(long, default_value = "30")]
    upstream_timeout: u64,
}

/// Parsed `SSL_VERIFY` value.
#[derive(Clone, Debug, PartialEq, Eq)]
enum TlsMode {
    Verify,
    NoVerify,
    ServiceCa,
}

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            listen_addr,
            upstream,
            ssl_verify,
            upstream_timeout,
        } = self;

        let mut prom = <Registry>::default();
        let proxy_metrics = Metrics::register(prom.sub_registry_with_prefix("metrics_proxy"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // The base config supplies the API server address and TLS roots for
        // per-request caller clients; its own identity is the proxy's
        // service account, which also authenticates all upstream calls.
        let base = kube::Config::infer()
            .await
            .context("failed to load the cluster configuration")?;
        let proxy_namespace = base.default_namespace.clone();
        let token = service_account_token(&base.auth_info)?;

        let trust = ssl_verify.trust_anchor();
        let upstream = PrometheusUpstream::new(
            upstream,
            token,
            trust.clone(),
            Duration::from_secs(upstream_timeout),
        )
        .await
        .context("failed to build the upstream client")?;

        let resolver = ProjectResolver::new(base);
        let destinations = ClusterDestinations::new(runtime.client(), proxy_namespace, trust);
        let proxy = Proxy::new(resolver, destinations, upstream, proxy_metrics);

        tokio::spawn(
            server::serve(listen_addr, proxy, runtime.shutdown_handle())
                .instrument(info_span!("proxy")),
        );

        if runtime.run().await.is_err() {
            bail!("aborted");
        }
        Ok(())
    }
}

// === impl TlsMode ===

impl std::str::FromStr for TlsMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "true" => Ok(Self::Verify),
            "false" => Ok(Self::NoVerify),
            "service" => Ok(Self::ServiceCa),
            s => bail!("invalid SSL_VERIFY value '{s}'"),
        }
    }
}

impl TlsMode {
    fn trust_anchor(&self) -> TrustAnchor {
        match self {
            Self::Verify => TrustAnchor::SystemRoots,
            Self::NoVerify => TrustAnchor::Insecure,
            Self::ServiceCa => TrustAnchor::CaBundle(SERVICE_CA_BUNDLE.into()),
        }
    }
}

/// The proxy's own credential for upstream calls, read once at startup.
fn service_account_token(auth: &kube::config::AuthInfo) -> Result<String> {
    if let Some(token) = auth.token.as_ref() {
        return Ok(token.expose_secret().to_string());
    }
    if let Some(file) = auth.token_file.as_ref() {
        let token = std::fs::read_to_string(file)
            .with_context(|| format!("failed to read token file {file}"))?;
        return Ok(token.trim().to_string());
    }
    bail!("the cluster configuration carries no service-account token");
}
