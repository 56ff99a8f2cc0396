#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Request-scoped logic for the metrics proxy: the error taxonomy, the
//! caller's namespace scope, vector-selector rewriting, and text-exposition
//! filtering. Everything here is pure; the cluster- and network-facing
//! pieces live in the `k8s` and `runtime` crates.

pub mod error;
pub mod exposition;
pub mod namespace;
pub mod selector;
pub mod target;

pub use self::{
    error::Error,
    exposition::{MetricFamily, Sample},
    namespace::NamespaceSet,
    selector::VectorSelector,
    target::{ProxyTarget, Scheme, TargetAddr, TrustAnchor},
};
