//! The per-request proxy orchestrator.
//!
//! Each inbound request drives one authorization resolution, one upstream
//! call, and one response; nothing is shared between requests beyond the
//! pooled upstream client. Failures map onto HTTP statuses, the proxy's
//! only externally observable error channel.

use crate::{
    metrics::{Metrics, Route},
    server::ClientAddr,
    upstream::MetricsUpstream,
};
use bytes::Bytes;
use futures::{future, StreamExt};
use http::{header, request::Parts, Method, Request, Response, StatusCode};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full, StreamBody};
use hyper::body::Frame;
use metrics_proxy_core::{exposition, selector, Error, NamespaceSet, TargetAddr};
use metrics_proxy_k8s::{DestinationResolver, NamespaceResolver};
use std::{
    convert::Infallible,
    sync::Arc,
    task::{Context, Poll},
};
use tracing::{debug, info, warn};

/// Caller identity and display headers set by the authenticating front end.
pub const ACCESS_TOKEN_HEADER: &str = "x-forwarded-access-token";
pub const USER_HEADER: &str = "x-forwarded-user";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

pub type Body = UnsyncBoxBody<Bytes, Error>;

pub struct Proxy<N, D, U> {
    inner: Arc<Inner<N, D, U>>,
}

struct Inner<N, D, U> {
    resolver: N,
    destinations: D,
    upstream: U,
    metrics: Metrics,
}

/// Forwarded request metadata used for error bodies and access logging.
struct Caller {
    user: String,
    peer: String,
    content_type: String,
}

/// A parsed `/{nodes|services}/{addr}/proxy/{rest}` path.
#[derive(Debug, PartialEq)]
struct ProxyPath {
    kind: ResourceKind,
    addr: TargetAddr,
    rest: String,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ResourceKind {
    Node,
    Service,
}

// === impl Proxy ===

impl<N, D, U> Clone for Proxy<N, D, U> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B, N, D, U> tower::Service<Request<B>> for Proxy<N, D, U>
where
    B: Send + 'static,
    N: NamespaceResolver,
    D: DestinationResolver,
    U: MetricsUpstream,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let proxy = self.clone();
        Box::pin(async move { Ok(proxy.handle(req).await) })
    }
}

impl<N, D, U> Proxy<N, D, U>
where
    N: NamespaceResolver,
    D: DestinationResolver,
    U: MetricsUpstream,
{
    pub fn new(resolver: N, destinations: D, upstream: U, metrics: Metrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                resolver,
                destinations,
                upstream,
                metrics,
            }),
        }
    }

    async fn handle<B>(&self, req: Request<B>) -> Response<Body> {
        let (parts, _body) = req.into_parts();
        let caller = Caller::from_parts(&parts);

        let rsp = match self.dispatch(&parts, &caller).await {
            Ok(rsp) => rsp,
            Err(error) => {
                match error.status().as_u16() {
                    500.. => warn!(%error, "Request failed"),
                    _ => debug!(%error, "Request refused"),
                }
                error_response(&error)
            }
        };

        info!(
            peer = %caller.peer,
            user = %caller.user,
            method = %parts.method,
            path = %parts.uri.path(),
            status = rsp.status().as_u16(),
            "Handled request"
        );
        self.inner
            .metrics
            .record(Route::from_path(parts.uri.path()), rsp.status());
        rsp
    }

    async fn dispatch(&self, parts: &Parts, caller: &Caller) -> Result<Response<Body>, Error> {
        if parts.method != Method::GET {
            return Err(Error::MethodNotAllowed);
        }

        let token = parts
            .headers
            .get(ACCESS_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .unwrap_or("");
        if token.is_empty() {
            return Err(Error::Unauthenticated);
        }

        let namespaces = self.inner.resolver.resolve(token).await?;
        if namespaces.is_empty() {
            return Err(Error::Forbidden {
                user: caller.user.clone(),
            });
        }

        match parts.uri.path() {
            "/federate" => {
                self.federate(parts.uri.query().unwrap_or(""), &namespaces, caller)
                    .await
            }
            "/jobs" => self.jobs(&namespaces, caller).await,
            path => match ProxyPath::parse(path) {
                Some(proxy_path) => self.exporter(proxy_path, &namespaces, caller).await,
                None => Err(Error::NotFound),
            },
        }
    }

    /// Rewrites every `match[]` argument and relays the federation response.
    async fn federate(
        &self,
        raw_query: &str,
        namespaces: &NamespaceSet,
        caller: &Caller,
    ) -> Result<Response<Body>, Error> {
        let query = scoped_query(raw_query, namespaces)?;
        let (status, body) = self.inner.upstream.federate(&query).await?;
        let body = StreamBody::new(body.map(|chunk| chunk.map(Frame::data)));
        Ok(Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, caller.content_type.clone())
            .body(BodyExt::boxed_unsync(body))
            .expect("response must be valid"))
    }

    /// Lists the jobs observable within the caller's namespaces, one
    /// single-quoted name per line, sorted ascending.
    async fn jobs(
        &self,
        namespaces: &NamespaceSet,
        caller: &Caller,
    ) -> Result<Response<Body>, Error> {
        let promql = format!("count({{{}}}) by (job)", namespaces.matcher());
        let (status, body) = self.inner.upstream.query(&promql).await?;
        if !status.is_success() {
            return Err(Error::Upstream {
                status,
                body: body.to_vec(),
            });
        }

        let jobs = job_names(&body)?;
        let rendered = jobs
            .iter()
            .map(|job| format!("'{job}'\n"))
            .collect::<String>();
        Ok(text_response(StatusCode::OK, rendered.into(), caller))
    }

    /// Scrapes a resolved node or service target and filters the payload
    /// down to the caller's namespaces.
    async fn exporter(
        &self,
        path: ProxyPath,
        namespaces: &NamespaceSet,
        caller: &Caller,
    ) -> Result<Response<Body>, Error> {
        let ProxyPath { kind, addr, rest } = path;
        let target = match kind {
            ResourceKind::Node => self.inner.destinations.resolve_node(&addr, &rest).await?,
            ResourceKind::Service => {
                self.inner
                    .destinations
                    .resolve_service(&addr, &rest)
                    .await?
            }
        };

        let (status, body) = self.inner.upstream.scrape(&target).await?;
        if !status.is_success() {
            return Err(Error::Upstream {
                status,
                body: body.to_vec(),
            });
        }

        let text = std::str::from_utf8(&body)
            .map_err(|_| Error::UpstreamMalformed("exposition payload is not UTF-8".to_string()))?;
        let filtered = exposition::filter_text(text, namespaces)?;
        Ok(text_response(StatusCode::OK, filtered.into(), caller))
    }
}

// === impl Caller ===

impl Caller {
    fn from_parts(parts: &Parts) -> Self {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
        };
        let user = header(USER_HEADER).unwrap_or("<unknown>").to_string();
        let peer = header(FORWARDED_FOR_HEADER)
            .and_then(|value| value.split(',').next())
            .map(|value| value.trim().to_string())
            .or_else(|| {
                parts
                    .extensions
                    .get::<ClientAddr>()
                    .map(|addr| addr.0.to_string())
            })
            .unwrap_or_else(|| "-".to_string());
        let content_type = header("content-type").unwrap_or("text/plain").to_string();
        Self {
            user,
            peer,
            content_type,
        }
    }
}

// === impl ProxyPath ===

impl ProxyPath {
    fn parse(path: &str) -> Option<Self> {
        let (kind, rest) = if let Some(rest) = path.strip_prefix("/nodes/") {
            (ResourceKind::Node, rest)
        } else if let Some(rest) = path.strip_prefix("/services/") {
            (ResourceKind::Service, rest)
        } else {
            return None;
        };

        let (addr, rest) = rest.split_once('/')?;
        let rest = rest.strip_prefix("proxy")?;
        let rest = if rest.is_empty() {
            ""
        } else {
            rest.strip_prefix('/')?
        };
        let addr = TargetAddr::parse(addr).ok()?;
        Some(Self {
            kind,
            addr,
            rest: rest.to_string(),
        })
    }
}

/// Re-assembles the federation query string with every `match[]` argument
/// scoped to the caller's namespaces, preserving argument order. A single
/// malformed selector rejects the whole request: partial rewriting could
/// silently change which constraints reach the upstream.
fn scoped_query(
    raw_query: &str,
    namespaces: &NamespaceSet,
) -> Result<Vec<(String, String)>, Error> {
    let mut query = Vec::new();
    let mut matches = 0;
    for (key, value) in url::form_urlencoded::parse(raw_query.as_bytes()) {
        if key == "match[]" {
            matches += 1;
            query.push((key.into_owned(), selector::rewrite(&value, namespaces)?));
        } else {
            query.push((key.into_owned(), value.into_owned()));
        }
    }
    if matches == 0 {
        return Err(Error::InvalidRequest("Missing match[] parameter".to_string()));
    }
    Ok(query)
}

fn job_names(body: &[u8]) -> Result<Vec<String>, Error> {
    let rsp: serde_json::Value = serde_json::from_slice(body)
        .map_err(|error| Error::UpstreamMalformed(format!("query response is not JSON: {error}")))?;
    let results = rsp
        .pointer("/data/result")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| Error::UpstreamMalformed("query response has no data.result".to_string()))?;

    let mut jobs = results
        .iter()
        .map(|result| {
            result
                .pointer("/metric/job")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("")
                .to_string()
        })
        .collect::<Vec<_>>();
    jobs.sort();
    Ok(jobs)
}

fn text_response(status: StatusCode, body: Bytes, caller: &Caller) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, caller.content_type.clone())
        .body(full_body(body))
        .expect("response must be valid")
}

fn error_response(error: &Error) -> Response<Body> {
    let (status, body) = match error {
        // Upstream answers pass through to the caller verbatim.
        Error::Upstream { status, body } => (*status, Bytes::copy_from_slice(body)),
        error => (error.status(), Bytes::from(format!("{error}\n"))),
    };
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(full_body(body))
        .expect("response must be valid")
}

fn full_body(bytes: Bytes) -> Body {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}
