//! Medium kinds and how each is opened.
//!
//! The set of media is closed, so it is an enum dispatched by tag rather than
//! a trait object per kind. Opening a medium yields an [`Opened`] handle
//! whose shape tells the endpoint how to read and write it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::config::{CloudConfig, CloudTransport, MirrorConfig};
use crate::error::{BridgeError, Result};
use crate::injector::InjectorSource;
use crate::serial::{self, SerialHost};
use crate::state::ConnectionState;
use crate::tcp::{connect_tcp, connect_tls};
use crate::tls::TlsConnector;
use crate::udp::connect_mirror;
use crate::websocket::{connect_ws, WsStream, WsTarget};

/// Any bidirectional byte stream a medium can produce.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased byte stream.
pub type BoxedStream = Box<dyn ByteStream>;

/// A link medium and everything needed to open it.
#[derive(Clone)]
pub enum Medium {
    /// Host-supplied serial device.
    Serial {
        /// Device provider.
        host: Arc<dyn SerialHost>,
        /// Line rate.
        baud_rate: u32,
    },
    /// Plain TCP.
    Tcp {
        /// `host:port`.
        addr: String,
    },
    /// TLS over TCP.
    TlsTcp {
        /// Relay host, also the name verified in the certificate.
        host: String,
        /// Relay port.
        port: u16,
        /// Shared connector.
        connector: Arc<TlsConnector>,
    },
    /// WebSocket, `wss://` when a connector is present.
    WebSocket {
        /// Where to connect.
        target: WsTarget,
        /// Connector for `wss://`.
        connector: Option<Arc<TlsConnector>>,
    },
    /// Send-only UDP mirror.
    UdpMirror {
        /// `host:port` of the listener.
        target: String,
    },
    /// Source-only sensor injector.
    Injector(InjectorSource),
}

impl fmt::Debug for Medium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Medium::Serial { host, baud_rate } => f
                .debug_struct("Serial")
                .field("device", &host.name())
                .field("baud_rate", baud_rate)
                .finish(),
            Medium::Tcp { addr } => f.debug_struct("Tcp").field("addr", addr).finish(),
            Medium::TlsTcp { host, port, .. } => f
                .debug_struct("TlsTcp")
                .field("host", host)
                .field("port", port)
                .finish(),
            Medium::WebSocket { target, connector } => f
                .debug_struct("WebSocket")
                .field("url", &target.url)
                .field("tls", &connector.is_some())
                .finish(),
            Medium::UdpMirror { target } => {
                f.debug_struct("UdpMirror").field("target", target).finish()
            }
            Medium::Injector(_) => f.write_str("Injector"),
        }
    }
}

/// An open medium.
pub enum Opened {
    /// Byte stream (serial, TCP, TLS).
    Stream(BoxedStream),
    /// Message-oriented WebSocket.
    WebSocket(Box<WsStream>),
    /// Connected UDP socket, send-only.
    Datagram(UdpSocket),
    /// Injection channel, receive-only.
    Injector(InjectorSource),
}

impl fmt::Debug for Opened {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Opened::Stream(_) => "Stream",
            Opened::WebSocket(_) => "WebSocket",
            Opened::Datagram(_) => "Datagram",
            Opened::Injector(_) => "Injector",
        };
        f.write_str(kind)
    }
}

impl Medium {
    /// Builds the cloud medium, including its TLS connector.
    pub fn cloud(config: &CloudConfig) -> Result<Self> {
        let connector = match (&config.tls, config.transport.uses_tls()) {
            (Some(tls), true) => Some(Arc::new(TlsConnector::new(tls)?)),
            (None, true) => {
                return Err(BridgeError::config(
                    "TLS cloud transport needs a tls section",
                ))
            }
            _ => None,
        };

        Ok(match config.transport {
            CloudTransport::Tcp => Medium::Tcp {
                addr: config.addr(),
            },
            CloudTransport::TlsTcp => Medium::TlsTcp {
                host: config.host.clone(),
                port: config.port,
                connector: connector.ok_or_else(|| BridgeError::config("missing TLS connector"))?,
            },
            CloudTransport::WebSocket | CloudTransport::SecureWebSocket => Medium::WebSocket {
                target: WsTarget {
                    host: config.host.clone(),
                    port: config.port,
                    url: config.url(),
                    auth_token: config.auth_token.clone(),
                },
                connector,
            },
        })
    }

    /// Builds the mirror medium.
    pub fn mirror(config: &MirrorConfig) -> Self {
        Medium::UdpMirror {
            target: config.addr(),
        }
    }

    /// Short kind name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Medium::Serial { .. } => "serial",
            Medium::Tcp { .. } => "tcp",
            Medium::TlsTcp { .. } => "tls-tcp",
            Medium::WebSocket {
                connector: Some(_), ..
            } => "wss",
            Medium::WebSocket { .. } => "ws",
            Medium::UdpMirror { .. } => "udp-mirror",
            Medium::Injector(_) => "injector",
        }
    }

    /// Whether frames can be written to this medium.
    pub fn is_writable(&self) -> bool {
        !matches!(self, Medium::Injector(_))
    }

    /// The serial host, for serial media.
    pub fn serial_host(&self) -> Option<&Arc<dyn SerialHost>> {
        match self {
            Medium::Serial { host, .. } => Some(host),
            _ => None,
        }
    }

    /// Opens the medium.
    ///
    /// Serial media report their waits through `set_state`; every other
    /// kind is already `Connecting` when this is called.
    pub(crate) async fn open(
        &self,
        connect_timeout: Duration,
        set_state: &(dyn Fn(ConnectionState) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<Opened> {
        match self {
            Medium::Serial { host, baud_rate } => {
                serial::acquire(host.as_ref(), *baud_rate, set_state, cancel)
                    .await
                    .map(Opened::Stream)
            }
            Medium::Tcp { addr } => {
                let stream = connect_tcp(addr, connect_timeout).await?;
                Ok(Opened::Stream(Box::new(stream)))
            }
            Medium::TlsTcp {
                host,
                port,
                connector,
            } => connect_tls(host, *port, connector, connect_timeout)
                .await
                .map(Opened::Stream),
            Medium::WebSocket { target, connector } => {
                connect_ws(target, connector.as_deref(), connect_timeout)
                    .await
                    .map(|ws| Opened::WebSocket(Box::new(ws)))
            }
            Medium::UdpMirror { target } => connect_mirror(target, connect_timeout)
                .await
                .map(Opened::Datagram),
            Medium::Injector(source) => Ok(Opened::Injector(source.clone())),
        }
    }
}
