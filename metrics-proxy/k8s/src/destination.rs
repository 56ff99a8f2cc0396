//! Exporter-proxy destination resolution.
//!
//! `/nodes/...` and `/services/...` proxy paths name cluster resources, not
//! network addresses. Resolution confirms the resource exists before any
//! outbound connection is made, so the proxy cannot be used to probe
//! arbitrary hosts.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::{api::Api, Client};
use metrics_proxy_core::{Error, ProxyTarget, Scheme, TargetAddr, TrustAnchor};
use std::path::PathBuf;
use tracing::{debug, instrument};

/// The CA bundle the cluster publishes for service-serving certificates.
pub const SERVICE_CA_BUNDLE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/service-ca.crt";

const DEFAULT_KUBELET_PORT: u16 = 10250;
const DEFAULT_SERVICE_PORT: u16 = 8080;

/// Resolves an exporter-proxy address to a concrete scrape target.
#[async_trait]
pub trait DestinationResolver: Send + Sync + 'static {
    async fn resolve_node(&self, addr: &TargetAddr, rest: &str) -> Result<ProxyTarget, Error>;
    async fn resolve_service(&self, addr: &TargetAddr, rest: &str) -> Result<ProxyTarget, Error>;
}

/// Looks up Nodes and Services with the proxy's own client.
///
/// Service targets are restricted to the proxy's own namespace.
#[derive(Clone)]
pub struct ClusterDestinations {
    client: Client,
    namespace: String,
    trust: TrustAnchor,
    service_ca: PathBuf,
}

// === impl ClusterDestinations ===

impl ClusterDestinations {
    pub fn new(client: Client, namespace: String, trust: TrustAnchor) -> Self {
        Self {
            client,
            namespace,
            trust,
            service_ca: PathBuf::from(SERVICE_CA_BUNDLE),
        }
    }
}

#[async_trait]
impl DestinationResolver for ClusterDestinations {
    #[instrument(skip_all, fields(node = %addr.host))]
    async fn resolve_node(&self, addr: &TargetAddr, rest: &str) -> Result<ProxyTarget, Error> {
        let api = Api::<Node>::all(self.client.clone());
        let node = api.get(&addr.host).await.map_err(map_get_error)?;

        let host = internal_ip(&node).ok_or(Error::NotFound)?;
        let port = addr
            .port
            .or_else(|| kubelet_port(&node))
            .unwrap_or(DEFAULT_KUBELET_PORT);
        let target = ProxyTarget {
            scheme: addr.scheme.unwrap_or(Scheme::Https),
            host,
            port,
            path: rest.to_string(),
            trust: self.trust.clone(),
        };
        debug!(url = %target.url(), "Resolved node target");
        Ok(target)
    }

    #[instrument(skip_all, fields(service = %addr.host))]
    async fn resolve_service(&self, addr: &TargetAddr, rest: &str) -> Result<ProxyTarget, Error> {
        // Existence check only; the scrape goes through cluster DNS.
        let api = Api::<Service>::namespaced(self.client.clone(), &self.namespace);
        api.get(&addr.host).await.map_err(map_get_error)?;

        let trust = match self.trust {
            TrustAnchor::Insecure => TrustAnchor::Insecure,
            _ => TrustAnchor::CaBundle(self.service_ca.clone()),
        };
        let target = ProxyTarget {
            scheme: addr.scheme.unwrap_or(Scheme::Http),
            host: format!("{}.{}.svc.cluster.local", addr.host, self.namespace),
            port: addr.port.unwrap_or(DEFAULT_SERVICE_PORT),
            path: rest.to_string(),
            trust,
        };
        debug!(url = %target.url(), "Resolved service target");
        Ok(target)
    }
}

fn map_get_error(error: kube::Error) -> Error {
    match error {
        kube::Error::Api(rsp) if rsp.code == 404 => Error::NotFound,
        error => crate::map_kube_error(error),
    }
}

/// The node's first address of type `InternalIP`.
fn internal_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|addr| addr.type_ == "InternalIP")
        .map(|addr| addr.address.clone())
}

fn kubelet_port(node: &Node) -> Option<u16> {
    let port = node
        .status
        .as_ref()?
        .daemon_endpoints
        .as_ref()?
        .kubelet_endpoint
        .as_ref()?
        .port;
    u16::try_from(port).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        DaemonEndpoint, NodeAddress, NodeDaemonEndpoints, NodeStatus,
    };

    fn node(addresses: Vec<NodeAddress>, kubelet: Option<i32>) -> Node {
        Node {
            status: Some(NodeStatus {
                addresses: Some(addresses),
                daemon_endpoints: kubelet.map(|port| NodeDaemonEndpoints {
                    kubelet_endpoint: Some(DaemonEndpoint { port }),
                }),
                ..NodeStatus::default()
            }),
            ..Node::default()
        }
    }

    #[test]
    fn internal_ip_is_selected() {
        let node = node(
            vec![
                NodeAddress {
                    address: "node-1.example.com".to_string(),
                    type_: "Hostname".to_string(),
                },
                NodeAddress {
                    address: "10.0.0.7".to_string(),
                    type_: "InternalIP".to_string(),
                },
            ],
            Some(10250),
        );
        assert_eq!(internal_ip(&node).as_deref(), Some("10.0.0.7"));
        assert_eq!(kubelet_port(&node), Some(10250));
    }

    #[test]
    fn missing_internal_ip_is_none() {
        let node = node(
            vec![NodeAddress {
                address: "node-1.example.com".to_string(),
                type_: "Hostname".to_string(),
            }],
            None,
        );
        assert_eq!(internal_ip(&node), None);
        assert_eq!(kubelet_port(&node), None);
    }
}
