//! TCP and TLS-over-TCP byte streams to the cloud relay.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::tls::TlsConnector;
use crate::transport::BoxedStream;

/// Opens a TCP connection with `TCP_NODELAY` set.
pub async fn connect_tcp(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| BridgeError::ConnectTimeout {
            addr: addr.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })?
        .map_err(|e| BridgeError::IoFailure {
            endpoint: addr.to_string(),
            reason: e.to_string(),
        })?;
    stream.set_nodelay(true)?;
    debug!(addr, "TCP connected");
    Ok(stream)
}

/// Opens TCP and runs the TLS handshake, both within `timeout`.
pub async fn connect_tls(
    host: &str,
    port: u16,
    connector: &TlsConnector,
    timeout: Duration,
) -> Result<BoxedStream> {
    let addr = format!("{}:{}", host, port);
    let tcp = connect_tcp(&addr, timeout).await?;
    let stream = tokio::time::timeout(timeout, connector.connect(host, tcp))
        .await
        .map_err(|_| BridgeError::ConnectTimeout {
            addr: addr.clone(),
            timeout_ms: timeout.as_millis() as u64,
        })??;
    debug!(addr = %addr, "TLS established");
    Ok(Box::new(stream))
}
