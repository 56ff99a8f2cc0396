use http::StatusCode;

/// Failure taxonomy for a proxied request.
///
/// HTTP status codes are the proxy's only externally observable error
/// channel, so every variant maps onto exactly one status. Upstream
/// failures carry the upstream's own status and body, which are mirrored
/// to the caller verbatim.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing or invalid caller credentials")]
    Unauthenticated,

    #[error("Account '{user}' doesn't have access to any namespaces!")]
    Forbidden { user: String },

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Not a valid vector selector: '{0}'!")]
    InvalidSelector(String),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("not found")]
    NotFound,

    /// A non-2xx answer from the metrics or identity backend.
    #[error("upstream request failed with status {status}")]
    Upstream { status: StatusCode, body: Vec<u8> },

    /// The backend could not be reached at all (connect failure, timeout).
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The backend answered 2xx but the payload does not parse.
    #[error("malformed upstream payload: {0}")]
    UpstreamMalformed(String),
}

// === impl Error ===

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::InvalidRequest(_) | Self::InvalidSelector(_) => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Upstream { status, .. } => *status,
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamMalformed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
