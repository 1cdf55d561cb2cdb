//! Observable connection and router states.

use std::fmt;

use serde::Serialize;

/// Connection state of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "kebab-case")]
pub enum ConnectionState {
    /// Idle, not trying to connect.
    #[default]
    Disconnected,
    /// The underlying device is not present yet.
    WaitingForResource,
    /// The device is present but access has not been granted.
    WaitingForPermission,
    /// Opening the medium.
    Connecting,
    /// Read and write tasks are running.
    Connected,
    /// The last attempt or session ended unexpectedly.
    Error(String),
}

impl ConnectionState {
    /// Whether frames can currently flow.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::WaitingForResource => write!(f, "waiting-for-resource"),
            ConnectionState::WaitingForPermission => write!(f, "waiting-for-permission"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// Lifecycle state of the router.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "kebab-case")]
pub enum RouterState {
    /// No tasks running.
    #[default]
    Stopped,
    /// Validating configuration and spawning tasks.
    Starting,
    /// Endpoints are supervised and frames are forwarded.
    Running,
    /// Start failed.
    Error(String),
}

impl fmt::Display for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterState::Stopped => write!(f, "stopped"),
            RouterState::Starting => write!(f, "starting"),
            RouterState::Running => write!(f, "running"),
            RouterState::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_strings() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
        assert_eq!(
            ConnectionState::WaitingForResource.to_string(),
            "waiting-for-resource"
        );
        assert_eq!(
            ConnectionState::WaitingForPermission.to_string(),
            "waiting-for-permission"
        );
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            ConnectionState::Error("reset".to_string()).to_string(),
            "error: reset"
        );
    }

    #[test]
    fn test_connection_state_predicates() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::WaitingForResource.is_connected());
    }

    #[test]
    fn test_router_state_json() {
        let json = serde_json::to_string(&RouterState::Running).unwrap();
        assert_eq!(json, r#"{"state":"running"}"#);
        let json = serde_json::to_string(&ConnectionState::Error("eof".to_string())).unwrap();
        assert_eq!(json, r#"{"state":"error","reason":"eof"}"#);
    }
}
