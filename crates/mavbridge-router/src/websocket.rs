//! WebSocket link to the cloud relay.
//!
//! Each outbound frame is one binary message. Inbound binary messages may
//! carry several concatenated frames and go through the same stream buffer
//! as byte-stream media.

use std::time::Duration;

use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::tcp::{connect_tcp, connect_tls};
use crate::tls::TlsConnector;
use crate::transport::BoxedStream;

/// WebSocket over a plain or TLS stream.
pub type WsStream = WebSocketStream<BoxedStream>;

/// Target of a WebSocket connection.
#[derive(Debug, Clone)]
pub struct WsTarget {
    /// Relay host.
    pub host: String,
    /// Relay port.
    pub port: u16,
    /// `ws://` or `wss://` URL including the path.
    pub url: String,
    /// Sent as `Authorization: Bearer <token>` when set.
    pub auth_token: Option<String>,
}

/// Connects the underlying stream and performs the upgrade handshake.
///
/// `tls` selects `wss://`; the same connector as the TLS TCP link is used.
pub async fn connect_ws(
    target: &WsTarget,
    tls: Option<&TlsConnector>,
    timeout: Duration,
) -> Result<WsStream> {
    let stream: BoxedStream = match tls {
        Some(connector) => connect_tls(&target.host, target.port, connector, timeout).await?,
        None => {
            let addr = format!("{}:{}", target.host, target.port);
            Box::new(connect_tcp(&addr, timeout).await?)
        }
    };

    let mut request = target
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| BridgeError::WebSocket {
            reason: format!("invalid url {}: {}", target.url, e),
        })?;
    if let Some(token) = &target.auth_token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| {
            BridgeError::WebSocket {
                reason: format!("invalid auth token: {}", e),
            }
        })?;
        request.headers_mut().insert(header::AUTHORIZATION, value);
    }

    let (ws, response) = tokio::time::timeout(
        timeout,
        tokio_tungstenite::client_async(request, stream),
    )
    .await
    .map_err(|_| BridgeError::ConnectTimeout {
        addr: target.url.clone(),
        timeout_ms: timeout.as_millis() as u64,
    })?
    .map_err(|e| BridgeError::WebSocket {
        reason: e.to_string(),
    })?;
    debug!(url = %target.url, status = %response.status(), "websocket upgraded");
    Ok(ws)
}
