#![warn(missing_docs)]

//! MAVLink bridge routing engine.
//!
//! Moves MAVLink v1/v2 frames between a serial-attached vehicle controller,
//! a cloud relay (TCP, TLS, or WebSocket), a local UDP mirror and a sensor
//! injector. Links reconnect with exponential backoff; frames can be signed
//! and verified with a shared key.

pub mod buffer;
pub mod cli;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod injector;
pub mod metrics;
pub mod protocol;
pub mod retry;
pub mod router;
pub mod serial;
pub mod signing;
pub mod state;
pub mod tcp;
pub mod tls;
pub mod transport;
pub mod udp;
pub mod websocket;

pub use buffer::FrameBuffer;
pub use config::{
    CloudConfig, CloudTransport, InjectionConfig, MirrorConfig, RouterConfig, SerialConfig,
    SigningConfig,
};
pub use endpoint::{Endpoint, EndpointOptions};
pub use error::{BridgeError, Result};
pub use injector::{InjectorHandle, SensorMessage, SubmitOutcome};
pub use metrics::{EndpointStats, StatsSnapshot};
pub use protocol::{parse_frame, Frame, ParseOutcome, ProtocolVersion};
pub use retry::{Backoff, BackoffConfig};
pub use router::Router;
pub use serial::{DevicePathHost, Permission, SerialHost};
pub use signing::{Signer, SigningKey};
pub use state::{ConnectionState, RouterState};
pub use tls::TlsConfig;
pub use transport::{BoxedStream, ByteStream, Medium};
