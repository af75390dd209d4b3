use thiserror::Error;

/// Errors from the remote query surface.
///
/// The gateway never retries; retry policy belongs to whoever triggered the
/// sync.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the per-request timeout
    #[error("Request timed out")]
    Timeout,
    /// Response body was not the expected JSON rows
    #[error("Unexpected response: {0}")]
    Decode(String),
    /// Response body exceeded the size limit
    #[error("Response too large (exceeds {0} bytes)")]
    ResponseTooLarge(usize),
    /// Base URL could not be parsed
    #[error("Invalid remote URL")]
    InvalidBaseUrl,
    /// Base URL is plain HTTP and not loopback
    #[error("Insecure remote URL: HTTPS required (except localhost for testing)")]
    InsecureBaseUrl,
    /// No remote source has been configured
    #[error("No remote source configured")]
    NotConfigured,
}

impl RemoteError {
    /// Classify a reqwest error, separating timeouts from other failures.
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout
        } else {
            RemoteError::Network(err)
        }
    }
}
