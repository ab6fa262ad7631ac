use thiserror::Error;

/// Error type shared by every layer of the driver.
///
/// Errors travel as values in reply channels and never cross an actor
/// boundary as a panic. The variants are grouped by severity: local guards
/// that refuse a request before any network traffic, non-retryable server
/// outcomes, retryable server outcomes, and transport failures.
#[derive(Error, Debug)]
pub enum VellumError {
    // -- local guards -------------------------------------------------------
    #[error("entity cannot be null")]
    NullEntity,

    #[error("no valid id could be resolved for the entity")]
    NoValidIdInformed,

    #[error("GET request URL is {0} characters, over the configured maximum")]
    MaximumUrlLengthReached(usize),

    #[error("session reached its maximum of {0} requests")]
    MaxRequestsExceeded(u32),

    // -- server responses, non-retryable ------------------------------------
    #[error("document not found")]
    DocumentNotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("stale response: {0}")]
    Stale(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("invalid response payload: {0}")]
    InvalidResponsePayload(String),

    // -- server responses, retryable ----------------------------------------
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("node gone: {0}")]
    NodeGone(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    // -- transport ----------------------------------------------------------
    #[error("connection error: {0}")]
    Connection(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("executor channel closed")]
    ChannelClosed,

    #[error("topology has no available nodes")]
    NoNodesAvailable,

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl VellumError {
    /// Whether the same request may succeed if attempted again.
    ///
    /// Server outcomes classified retryable (conflict, node gone, transient
    /// unavailability) and transport-level failures are worth another
    /// attempt; everything else is permanent for the request that caused it.
    /// `Stale` is policy-dependent and resolved during response
    /// classification, so it reports `false` here.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VellumError::Conflict(_)
                | VellumError::NodeGone(_)
                | VellumError::Unavailable(_)
                | VellumError::Connection(_)
                | VellumError::Timeout(_)
                | VellumError::ChannelClosed
        )
    }
}

impl From<hyper::Error> for VellumError {
    fn from(err: hyper::Error) -> Self {
        VellumError::Http(err.to_string())
    }
}

impl From<hyper::http::Error> for VellumError {
    fn from(err: hyper::http::Error) -> Self {
        VellumError::Http(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VellumError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(VellumError::Conflict("409".to_string()).is_retryable());
        assert!(VellumError::NodeGone("410".to_string()).is_retryable());
        assert!(VellumError::Unavailable("503".to_string()).is_retryable());
        assert!(VellumError::Connection("refused".to_string()).is_retryable());
        assert!(VellumError::Timeout(30_000).is_retryable());
        assert!(VellumError::ChannelClosed.is_retryable());
    }

    #[test]
    fn test_non_retryable_errors() {
        assert!(!VellumError::DocumentNotFound.is_retryable());
        assert!(!VellumError::Unauthorized.is_retryable());
        assert!(!VellumError::Server("boom".to_string()).is_retryable());
        assert!(!VellumError::InvalidResponsePayload("bad json".to_string()).is_retryable());
        assert!(!VellumError::NullEntity.is_retryable());
        assert!(!VellumError::NoValidIdInformed.is_retryable());
        assert!(!VellumError::MaximumUrlLengthReached(2000).is_retryable());
        assert!(!VellumError::MaxRequestsExceeded(30).is_retryable());
        assert!(!VellumError::Stale("index".to_string()).is_retryable());
    }

    #[test]
    fn test_error_messages_include_detail() {
        let err = VellumError::MaximumUrlLengthReached(1700);
        assert!(err.to_string().contains("1700"));

        let err = VellumError::MaxRequestsExceeded(30);
        assert!(err.to_string().contains("30"));

        let err = VellumError::Timeout(5000);
        assert!(err.to_string().contains("5000"));
    }

    #[test]
    fn test_from_serde_json() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: VellumError = parse_err.into();
        assert!(matches!(err, VellumError::Json(_)));
        assert!(!err.is_retryable());
    }
}
