//! Exporter-proxy target description.

use crate::error::Error;
use std::path::PathBuf;

/// How the upstream connection is verified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrustAnchor {
    /// Verify against the CA bundle at the given path.
    CaBundle(PathBuf),
    /// Verify against the system roots.
    SystemRoots,
    /// No verification.
    Insecure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// The `{scheme:}{host}{:port}` token of an exporter-proxy path, as used by
/// apiserver-style proxy URLs. Scheme and port are each optional.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetAddr {
    pub scheme: Option<Scheme>,
    pub host: String,
    pub port: Option<u16>,
}

/// A resolved upstream scrape descriptor, constructed once per request and
/// consumed exactly once by the upstream call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyTarget {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Path relative to the target root, without a leading slash.
    pub path: String,
    pub trust: TrustAnchor,
}

// === impl Scheme ===

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl std::str::FromStr for Scheme {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            _ => Err(()),
        }
    }
}

// === impl TargetAddr ===

impl TargetAddr {
    /// Parses a path token like `node-1`, `node-1:10250`, `https:node-1`, or
    /// `https:node-1:10250`. A token that does not fit the pattern is
    /// `NotFound`: the enclosing path is simply not a proxy route.
    pub fn parse(token: &str) -> Result<Self, Error> {
        let mut scheme = None;
        let mut port = None;

        let mut parts = token.split(':').collect::<Vec<_>>();
        if parts.len() > 1 {
            if let Ok(s) = parts[0].parse::<Scheme>() {
                scheme = Some(s);
                parts.remove(0);
            }
        }
        if parts.len() > 1 {
            let raw = parts.pop().expect("len checked");
            port = Some(raw.parse::<u16>().map_err(|_| Error::NotFound)?);
        }

        match parts.as_slice() {
            [host] if !host.is_empty() => Ok(Self {
                scheme,
                host: host.to_string(),
                port,
            }),
            _ => Err(Error::NotFound),
        }
    }
}

// === impl ProxyTarget ===

impl ProxyTarget {
    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}/{}",
            self.scheme.as_str(),
            self.host,
            self.port,
            self.path
        )
    }
}
