//! Self-metrics, exposed on the admin endpoint.

use http::StatusCode;
use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    requests: Family<RequestLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RequestLabels {
    route: Route,
    status: u16,
}

/// Inbound route classes.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Route {
    Federate,
    Jobs,
    Exporter,
    Other,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "requests",
            "Inbound requests handled by the proxy",
            metrics.requests.clone(),
        );
        metrics
    }

    pub fn record(&self, route: Route, status: StatusCode) {
        self.requests
            .get_or_create(&RequestLabels {
                route,
                status: status.as_u16(),
            })
            .inc();
    }
}

// === impl Route ===

impl Route {
    pub fn from_path(path: &str) -> Self {
        match path {
            "/federate" => Self::Federate,
            "/jobs" => Self::Jobs,
            path if path.starts_with("/nodes/") || path.starts_with("/services/") => {
                Self::Exporter
            }
            _ => Self::Other,
        }
    }
}
