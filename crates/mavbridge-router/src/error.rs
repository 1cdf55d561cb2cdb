//! Error types for the bridge.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("resource unavailable: {resource}")]
    ResourceUnavailable { resource: String },

    #[error("permission denied for {resource}")]
    PermissionDenied { resource: String },

    #[error("protocol desync: discarded {discarded} bytes")]
    ProtocolDesync { discarded: usize },

    #[error("I/O failure on {endpoint}: {reason}")]
    IoFailure { endpoint: String, reason: String },

    #[error("signature mismatch on frame from system {system_id}")]
    SignatureMismatch { system_id: u8 },

    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge { size: usize, max_size: usize },

    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectTimeout { addr: String, timeout_ms: u64 },

    #[error("TLS handshake failed: {reason}")]
    Tls { reason: String },

    #[error("websocket error: {reason}")]
    WebSocket { reason: String },

    #[error("not connected")]
    NotConnected,

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("router already running")]
    AlreadyRunning,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Builds an `InvalidConfig` error from any displayable reason.
    pub fn config(reason: impl Into<String>) -> Self {
        BridgeError::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether a supervisor should keep retrying after this error.
    ///
    /// `PermissionDenied` needs an external re-grant and configuration errors
    /// never heal on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::ResourceUnavailable { .. } => true,
            BridgeError::IoFailure { .. } => true,
            BridgeError::ConnectTimeout { .. } => true,
            BridgeError::Tls { .. } => true,
            BridgeError::WebSocket { .. } => true,
            BridgeError::NotConnected => true,
            BridgeError::Io(_) => true,
            BridgeError::ProtocolDesync { .. } => true,
            BridgeError::SignatureMismatch { .. } => true,
            BridgeError::PermissionDenied { .. } => false,
            BridgeError::InvalidConfig { .. } => false,
            BridgeError::PayloadTooLarge { .. } => false,
            BridgeError::AlreadyRunning => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(BridgeError::ResourceUnavailable {
            resource: "serial".to_string()
        }
        .is_retryable());
        assert!(BridgeError::ConnectTimeout {
            addr: "relay:5760".to_string(),
            timeout_ms: 5000
        }
        .is_retryable());
        assert!(BridgeError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        ))
        .is_retryable());

        assert!(!BridgeError::PermissionDenied {
            resource: "/dev/ttyACM0".to_string()
        }
        .is_retryable());
        assert!(!BridgeError::config("bad port").is_retryable());
        assert!(!BridgeError::AlreadyRunning.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = BridgeError::config("signing key must be 32 bytes");
        assert_eq!(
            err.to_string(),
            "invalid configuration: signing key must be 32 bytes"
        );
        let err = BridgeError::IoFailure {
            endpoint: "cloud".to_string(),
            reason: "broken pipe".to_string(),
        };
        assert_eq!(err.to_string(), "I/O failure on cloud: broken pipe");
    }
}
