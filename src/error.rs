//! Error taxonomy for temit operations.
//!
//! Every variant carries owned strings rather than source errors so that a
//! single bootstrap outcome can be cloned out to every caller awaiting it.

use std::time::Duration;

use crate::codec::RemoteError;

/// Result type for temit operations.
pub type Result<T> = std::result::Result<T, TemitError>;

/// Errors surfaced by the client and its components.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TemitError {
    /// Transport connection could not be established or was lost.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Queue/exchange assertion or consumer start failed during bootstrap.
    #[error("Setup failed: {0}")]
    Setup(String),

    /// A publish was rejected by the broker or could not be confirmed.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// A body could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// The broker or a peer broke the wire contract (e.g. reply without correlation id).
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A channel or consumer closed unexpectedly.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No reply arrived within the configured window.
    #[error("Request to '{event}' timed out after {}ms", .timeout.as_millis())]
    Timeout { event: String, timeout: Duration },

    /// The broker returned the request: nothing is bound to the routing key.
    #[error("No route for '{event}': no endpoint is listening")]
    NoRoute { event: String },

    /// The remote handler failed; carries its serialized error.
    #[error("{0}")]
    Remote(RemoteError),

    /// Options passed by the caller are out of range.
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// The client has been closed and cannot be reused.
    #[error("Client is closed")]
    Closed,
}

impl TemitError {
    /// True if this is a call-level timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TemitError::Timeout { .. })
    }

    /// True if the broker reported the request as unroutable.
    pub fn is_no_route(&self) -> bool {
        matches!(self, TemitError::NoRoute { .. })
    }

    /// The remote handler's error, if this is one.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            TemitError::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for TemitError {
    fn from(e: serde_json::Error) -> Self {
        TemitError::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = TemitError::Timeout {
            event: "user.get".to_string(),
            timeout: Duration::from_millis(50),
        };
        assert_eq!(err.to_string(), "Request to 'user.get' timed out after 50ms");
        assert!(err.is_timeout());
        assert!(!err.is_no_route());
    }

    #[test]
    fn test_remote_display_is_message() {
        let err = TemitError::Remote(RemoteError::new("boom"));
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.remote().map(|e| e.message.as_str()), Some("boom"));
    }

    #[test]
    fn test_from_serde_error() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: TemitError = parse.unwrap_err().into();
        assert!(matches!(err, TemitError::Codec(_)));
    }
}
