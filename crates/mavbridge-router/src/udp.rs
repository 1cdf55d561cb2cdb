//! Send-only UDP mirror for local debugging listeners.

use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{BridgeError, Result};

/// Binds an ephemeral local socket and connects it to `target`.
///
/// Resolution of `target` is bounded by `timeout`. Nothing is sent; a
/// missing listener only shows up as later send errors.
pub async fn connect_mirror(target: &str, timeout: Duration) -> Result<UdpSocket> {
    let addr = tokio::time::timeout(timeout, tokio::net::lookup_host(target))
        .await
        .map_err(|_| BridgeError::ConnectTimeout {
            addr: target.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })?
        .map_err(|e| BridgeError::IoFailure {
            endpoint: target.to_string(),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| BridgeError::ResourceUnavailable {
            resource: target.to_string(),
        })?;

    let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;
    debug!(target, %addr, "UDP mirror ready");
    Ok(socket)
}
