#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Cluster-facing resolvers: the caller's namespace scope and exporter-proxy
//! destinations.

pub mod destination;
pub mod resolver;

pub use self::{
    destination::{ClusterDestinations, DestinationResolver},
    resolver::{NamespaceResolver, ProjectResolver},
};
pub use k8s_openapi::api::core::v1::{Node, Service};
pub use kube::{Client, Config};

use http::StatusCode;
use metrics_proxy_core::Error;

/// Maps a kube client failure onto the request-error taxonomy: API-level
/// answers are mirrored, transport-level failures are `UpstreamUnavailable`.
pub(crate) fn map_kube_error(error: kube::Error) -> Error {
    match error {
        kube::Error::Api(rsp) => Error::Upstream {
            status: StatusCode::from_u16(rsp.code).unwrap_or(StatusCode::BAD_GATEWAY),
            body: rsp.message.into_bytes(),
        },
        error => Error::UpstreamUnavailable(error.to_string()),
    }
}
