//! The proxy's inbound HTTP listener.
//!
//! The proxy serves plain HTTP; callers are expected to reach it through an
//! authenticating front end that sets the forwarded-identity headers.

use crate::proxy::Body;
use anyhow::{Context as _, Result};
use http::{Request, Response};
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use std::{convert::Infallible, net::SocketAddr};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// The socket address a request arrived from, exposed to handlers through
/// request extensions.
#[derive(Clone, Copy, Debug)]
pub struct ClientAddr(pub SocketAddr);

/// Accepts connections until `drain` fires, then stops accepting and lets
/// in-flight requests complete.
pub async fn serve<S>(addr: SocketAddr, service: S, drain: drain::Watch) -> Result<()>
where
    S: tower::Service<Request<Incoming>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "HTTP proxy server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(error) => {
                        warn!(%error, "Failed to accept connection");
                        continue;
                    }
                };
                tokio::spawn(serve_connection(stream, peer, service.clone(), drain.clone()));
            }
            release = drain.clone().signaled() => {
                info!("Proxy server shutting down");
                drop(release);
                return Ok(());
            }
        }
    }
}

async fn serve_connection<S>(stream: TcpStream, peer: SocketAddr, service: S, drain: drain::Watch)
where
    S: tower::Service<Request<Incoming>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    let io = TokioIo::new(stream);
    let svc = service_fn(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(ClientAddr(peer));
        let mut service = service.clone();
        tower::Service::call(&mut service, req)
    });

    let conn = http1::Builder::new().serve_connection(io, svc);
    tokio::pin!(conn);
    tokio::select! {
        result = conn.as_mut() => {
            if let Err(error) = result {
                debug!(%error, "Connection closed");
            }
        }
        release = drain.signaled() => {
            conn.as_mut().graceful_shutdown();
            if let Err(error) = release.release_after(conn.as_mut()).await {
                debug!(%error, "Connection closed during shutdown");
            }
        }
    }
}
