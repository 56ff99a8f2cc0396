#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use metrics_proxy_core as core;
pub use metrics_proxy_k8s as k8s;

mod args;
mod metrics;
mod proxy;
mod server;
mod upstream;

#[cfg(test)]
mod tests;

pub use self::{
    args::Args,
    proxy::Proxy,
    upstream::{MetricsUpstream, PrometheusUpstream},
};
