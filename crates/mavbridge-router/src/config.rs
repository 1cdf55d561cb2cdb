//! Router configuration.
//!
//! The router takes an immutable [`RouterConfig`] at `start`/`restart` and
//! never persists it. Hosts may build it in code or read it from a TOML or
//! JSON file with [`RouterConfig::from_file`].

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::retry::BackoffConfig;
use crate::signing::{Signer, SigningKey};
use crate::tls::TlsConfig;

/// Vehicle-side serial link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Line rate handed to the host when opening the device.
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self { baud_rate: 57_600 }
    }
}

/// Medium used to reach the cloud relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloudTransport {
    /// Plain TCP byte stream.
    Tcp,
    /// TLS over TCP.
    TlsTcp,
    /// `ws://` WebSocket.
    WebSocket,
    /// `wss://` WebSocket.
    SecureWebSocket,
}

impl CloudTransport {
    /// Whether this medium needs TLS material.
    pub fn uses_tls(self) -> bool {
        matches!(self, CloudTransport::TlsTcp | CloudTransport::SecureWebSocket)
    }

    /// Whether this medium is message oriented.
    pub fn is_websocket(self) -> bool {
        matches!(self, CloudTransport::WebSocket | CloudTransport::SecureWebSocket)
    }
}

/// Cloud relay link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Medium kind.
    pub transport: CloudTransport,
    /// Relay host name or address.
    pub host: String,
    /// Relay port.
    pub port: u16,
    /// Request path for WebSocket links.
    #[serde(default = "default_ws_path")]
    pub path: String,
    /// TLS trust anchors and optional client identity.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Bearer token sent on the WebSocket upgrade request.
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn default_ws_path() -> String {
    "/".to_string()
}

impl CloudConfig {
    /// `host:port` for socket connects.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// URL of the WebSocket endpoint.
    pub fn url(&self) -> String {
        let scheme = match self.transport {
            CloudTransport::SecureWebSocket => "wss",
            _ => "ws",
        };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.path)
    }
}

/// Local UDP mirror for debugging listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Listener host.
    pub host: String,
    /// Listener port.
    pub port: u16,
}

impl MirrorConfig {
    /// `host:port` of the listener.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Synthetic telemetry injection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionConfig {
    /// System id stamped on injected frames.
    pub system_id: u8,
    /// Component id stamped on injected frames.
    pub component_id: u8,
    /// Maximum rate per sensor in Hz; 0 disables a sensor. Sensors without an
    /// entry are not throttled.
    pub rates_hz: BTreeMap<String, f64>,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            system_id: 1,
            component_id: 191,
            rates_hz: BTreeMap::new(),
        }
    }
}

/// Message signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningConfig {
    /// 32-byte shared secret as 64 hex characters.
    pub key_hex: String,
    /// Link id stamped on generated signatures.
    #[serde(default)]
    pub link_id: u8,
    /// Drop frames whose signature fails validation instead of only counting
    /// them.
    #[serde(default = "default_true")]
    pub reject_invalid: bool,
}

fn default_true() -> bool {
    true
}

impl SigningConfig {
    /// Builds the signer for one router session.
    pub fn signer(&self) -> Result<Signer> {
        Ok(Signer::new(SigningKey::from_hex(&self.key_hex)?, self.link_id))
    }
}

/// Complete router configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Serial link to the vehicle controller.
    pub vehicle: Option<SerialConfig>,
    /// Link to the cloud relay.
    pub cloud: Option<CloudConfig>,
    /// UDP mirror receiving copies of routed traffic.
    pub mirror: Option<MirrorConfig>,
    /// Sensor injection.
    pub injection: Option<InjectionConfig>,
    /// Signing; absent means disabled.
    pub signing: Option<SigningConfig>,
    /// Reconnect backoff bounds.
    pub backoff: BackoffConfig,
    /// Timeout for opening network media (default: 5 seconds).
    pub connect_timeout_ms: u64,
    /// Timeout for a single medium write (default: 2 seconds).
    pub write_timeout_ms: u64,
    /// Period of the statistics snapshot task (default: 1 second).
    pub stats_interval_ms: u64,
    /// Pause between stop and start on restart (default: 500ms).
    pub restart_settle_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            vehicle: None,
            cloud: None,
            mirror: None,
            injection: None,
            signing: None,
            backoff: BackoffConfig::default(),
            connect_timeout_ms: 5_000,
            write_timeout_ms: 2_000,
            stats_interval_ms: 1_000,
            restart_settle_ms: 500,
        }
    }
}

impl RouterConfig {
    /// Reads a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: RouterConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        Ok(config)
    }

    /// Rejects configurations that could never work.
    ///
    /// Called by the router before any task is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.vehicle.is_none()
            && self.cloud.is_none()
            && self.mirror.is_none()
            && self.injection.is_none()
        {
            return Err(BridgeError::config("no endpoints configured"));
        }

        if let Some(vehicle) = &self.vehicle {
            if vehicle.baud_rate == 0 {
                return Err(BridgeError::config("vehicle baud rate must be positive"));
            }
        }

        if let Some(cloud) = &self.cloud {
            if cloud.host.trim().is_empty() {
                return Err(BridgeError::config("cloud host is empty"));
            }
            if cloud.port == 0 {
                return Err(BridgeError::config("cloud port must be non-zero"));
            }
            if cloud.transport.is_websocket() && !cloud.path.starts_with('/') {
                return Err(BridgeError::config("websocket path must start with '/'"));
            }
            match (&cloud.tls, cloud.transport.uses_tls()) {
                (None, true) => {
                    return Err(BridgeError::config("TLS cloud transport needs a tls section"))
                }
                (Some(tls), true) => tls.validate()?,
                _ => {}
            }
        }

        if let Some(mirror) = &self.mirror {
            if mirror.host.trim().is_empty() {
                return Err(BridgeError::config("mirror host is empty"));
            }
            if mirror.port == 0 {
                return Err(BridgeError::config("mirror port must be non-zero"));
            }
        }

        if let Some(injection) = &self.injection {
            for (sensor, rate) in &injection.rates_hz {
                if !rate.is_finite() || *rate < 0.0 {
                    return Err(BridgeError::config(format!(
                        "injection rate for {} must be a non-negative number",
                        sensor
                    )));
                }
                if *rate > 0.0 && Duration::try_from_secs_f64(1.0 / rate).is_err() {
                    return Err(BridgeError::config(format!(
                        "injection rate for {} is too small: {}",
                        sensor, rate
                    )));
                }
            }
        }

        if let Some(signing) = &self.signing {
            SigningKey::from_hex(&signing.key_hex)?;
        }

        if self.backoff.base_ms == 0 {
            return Err(BridgeError::config("backoff base must be positive"));
        }
        if self.backoff.max_ms < self.backoff.base_ms {
            return Err(BridgeError::config("backoff max must not be below base"));
        }
        if self.connect_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(BridgeError::config("timeouts must be positive"));
        }
        if self.stats_interval_ms == 0 {
            return Err(BridgeError::config("stats interval must be positive"));
        }
        Ok(())
    }

    /// Connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Write timeout as a duration.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Stats interval as a duration.
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    /// Restart settle delay as a duration.
    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }
}
