//! Uniform frame-in/frame-out endpoint over any [`Medium`].
//!
//! An endpoint owns its inbound and outbound queues for its whole life.
//! Each successful [`Endpoint::connect`] starts a session: a read task that
//! pushes medium bytes through a [`FrameBuffer`] into the inbound queue, and
//! a write task that drains the outbound queue with a bounded per-write
//! timeout. A session ends on [`Endpoint::close`] (state `Disconnected`) or
//! on the first I/O failure of either task (state `Error`). Reconnecting is
//! the caller's job.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::buffer::{FrameBuffer, READ_CHUNK_SIZE};
use crate::error::{BridgeError, Result};
use crate::injector::InjectorSource;
use crate::metrics::{EndpointCounters, EndpointStats};
use crate::protocol::Frame;
use crate::serial;
use crate::state::ConnectionState;
use crate::transport::{BoxedStream, Medium, Opened};
use crate::websocket::WsStream;

/// Timeouts applied by an endpoint.
#[derive(Debug, Clone, Copy)]
pub struct EndpointOptions {
    /// Bound on opening a network medium.
    pub connect_timeout: Duration,
    /// Bound on a single frame write.
    pub write_timeout: Duration,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
        }
    }
}

struct Session {
    id: u64,
    token: CancellationToken,
}

struct Inner {
    name: String,
    medium: Medium,
    options: EndpointOptions,
    state_tx: watch::Sender<ConnectionState>,
    inbound_tx: mpsc::UnboundedSender<Frame>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    outbound_tx: mpsc::UnboundedSender<Frame>,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    connected: AtomicBool,
    session: Mutex<Option<Session>>,
    next_session_id: AtomicU64,
    lifetime: CancellationToken,
    counters: EndpointCounters,
}

/// A named link. Clones share the same link.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.inner.name)
            .field("medium", &self.inner.medium)
            .field("state", &*self.inner.state_tx.borrow())
            .finish()
    }
}

impl Endpoint {
    /// Creates a disconnected endpoint.
    pub fn new(name: impl Into<String>, medium: Medium, options: EndpointOptions) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                medium,
                options,
                state_tx: watch::channel(ConnectionState::Disconnected).0,
                inbound_tx,
                inbound_rx: tokio::sync::Mutex::new(inbound_rx),
                outbound_tx,
                outbound_rx: tokio::sync::Mutex::new(outbound_rx),
                connected: AtomicBool::new(false),
                session: Mutex::new(None),
                next_session_id: AtomicU64::new(1),
                lifetime: CancellationToken::new(),
                counters: EndpointCounters::default(),
            }),
        }
    }

    /// Endpoint name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Underlying medium.
    pub fn medium(&self) -> &Medium {
        &self.inner.medium
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Subscribes to connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Whether a session is running.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Counters of this endpoint's I/O tasks.
    pub fn stats(&self) -> EndpointStats {
        self.inner.counters.snapshot()
    }

    /// Runs one connection attempt.
    ///
    /// Returns once the session is running, or with the error that ended the
    /// attempt. Serial media may wait here indefinitely for the device and
    /// its grant.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.lifetime.is_cancelled() {
            return Err(BridgeError::NotConnected);
        }
        if self.is_connected() {
            return Ok(());
        }

        let id = inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        let token = inner.lifetime.child_token();
        *self.lock_session() = Some(Session {
            id,
            token: token.clone(),
        });

        if inner.medium.serial_host().is_none() {
            self.set_state(ConnectionState::Connecting);
        }
        let set_state = |state: ConnectionState| self.set_state(state);
        let opened = tokio::select! {
            _ = token.cancelled() => Err(BridgeError::NotConnected),
            res = inner.medium.open(inner.options.connect_timeout, &set_state, &token) => res,
        };

        let opened = match opened {
            Ok(opened) => opened,
            Err(e) => {
                let still_current = self.clear_session(id);
                if token.is_cancelled() {
                    self.set_state(ConnectionState::Disconnected);
                } else if still_current {
                    warn!(endpoint = %inner.name, medium = inner.medium.kind(), error = %e, "connect failed");
                    self.set_state(ConnectionState::Error(e.to_string()));
                }
                return Err(e);
            }
        };

        {
            let mut stale = inner.outbound_rx.lock().await;
            let mut discarded = 0usize;
            while stale.try_recv().is_ok() {
                discarded += 1;
            }
            if discarded > 0 {
                debug!(endpoint = %inner.name, discarded, "discarded stale outbound frames");
            }
        }

        // Published under the session lock so a concurrent close either
        // sees this session or has already retired it.
        {
            let mut session = self.lock_session();
            if session.as_ref().map(|s| s.id) != Some(id) {
                // Retired by close, which already published Disconnected.
                return Err(BridgeError::NotConnected);
            }
            if token.is_cancelled() {
                *session = None;
                drop(session);
                self.set_state(ConnectionState::Disconnected);
                return Err(BridgeError::NotConnected);
            }
            inner.connected.store(true, Ordering::Release);
            self.set_state(ConnectionState::Connected);
        }

        inner.counters.record_session();
        self.spawn_session(id, &token, opened);
        Ok(())
    }

    /// Resolves when the current session ends, or immediately if none runs.
    pub async fn disconnected(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| !state.is_connected()).await;
    }

    /// Next inbound frame.
    ///
    /// Blocks across reconnects; returns `None` only after
    /// [`Endpoint::shutdown`].
    pub async fn read_frame(&self) -> Option<Frame> {
        let mut rx = self.inner.inbound_rx.lock().await;
        tokio::select! {
            _ = self.inner.lifetime.cancelled() => None,
            frame = rx.recv() => frame,
        }
    }

    /// Queues a frame for the write task.
    ///
    /// Returns false when no session is running or the medium is
    /// receive-only; nothing is queued in that case.
    pub fn send_frame(&self, frame: Frame) -> bool {
        if !self.inner.medium.is_writable() || !self.is_connected() {
            return false;
        }
        self.inner.outbound_tx.send(frame).is_ok()
    }

    /// Ends the current session or attempt. Idempotent.
    pub fn close(&self) {
        let session = self.lock_session().take();
        if let Some(session) = session {
            session.token.cancel();
        }
        if self.inner.connected.swap(false, Ordering::AcqRel) {
            debug!(endpoint = %self.inner.name, "session closed");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Closes the endpoint for good; pending and future reads return `None`.
    pub fn shutdown(&self) {
        self.close();
        self.inner.lifetime.cancel();
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn clear_session(&self, id: u64) -> bool {
        let mut session = self.lock_session();
        match session.as_ref() {
            Some(current) if current.id == id => {
                *session = None;
                true
            }
            _ => false,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.inner.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state.clone();
            true
        });
        if changed {
            info!(endpoint = %self.inner.name, state = %state, "endpoint state changed");
        }
    }

    /// Ends session `id` after a task failure. No-op if that session is
    /// already over.
    fn fail_session(&self, id: u64, error: BridgeError) {
        let token = {
            let mut session = self.lock_session();
            match session.as_ref() {
                Some(current) if current.id == id => session.take().map(|s| s.token),
                _ => None,
            }
        };
        if let Some(token) = token {
            token.cancel();
            self.inner.connected.store(false, Ordering::Release);
            warn!(endpoint = %self.inner.name, error = %error, "session ended");
            self.set_state(ConnectionState::Error(error.to_string()));
        }
    }

    fn spawn_task<F>(&self, id: u64, token: &CancellationToken, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let endpoint = self.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => Ok(()),
                res = task => res,
            };
            if let Err(e) = result {
                endpoint.fail_session(id, e);
            }
        });
    }

    fn spawn_session(&self, id: u64, token: &CancellationToken, opened: Opened) {
        debug!(endpoint = %self.inner.name, session = id, medium = ?opened, "session started");
        match opened {
            Opened::Stream(stream) => {
                let (reader, writer) = tokio::io::split(stream);
                self.spawn_task(id, token, self.clone().read_stream(reader));
                self.spawn_task(id, token, self.clone().write_stream(writer));
            }
            Opened::WebSocket(ws) => {
                let (sink, stream) = (*ws).split();
                self.spawn_task(id, token, self.clone().read_websocket(stream));
                self.spawn_task(id, token, self.clone().write_websocket(sink));
            }
            Opened::Datagram(socket) => {
                self.spawn_task(id, token, self.clone().write_datagram(socket));
            }
            Opened::Injector(source) => {
                self.spawn_task(id, token, self.clone().read_injector(source));
            }
        }

        if let Some(host) = self.inner.medium.serial_host() {
            let host = Arc::clone(host);
            self.spawn_task(id, token, async move {
                serial::detached(host.as_ref()).await;
                Err(BridgeError::ResourceUnavailable {
                    resource: host.name().to_string(),
                })
            });
        }
    }

    fn io_failure(&self, reason: impl fmt::Display) -> BridgeError {
        BridgeError::IoFailure {
            endpoint: self.inner.name.clone(),
            reason: reason.to_string(),
        }
    }

    fn deliver(&self, buffer: &mut FrameBuffer, bytes: &[u8]) {
        let discarded_before = buffer.discarded_bytes();
        for frame in buffer.push(bytes) {
            self.deliver_frame(frame);
        }
        self.inner
            .counters
            .record_discard(buffer.discarded_bytes() - discarded_before);
    }

    fn deliver_frame(&self, frame: Frame) {
        self.inner.counters.record_in(frame.len());
        trace!(
            endpoint = %self.inner.name,
            message_id = frame.message_id(),
            len = frame.len(),
            "frame received"
        );
        let _ = self.inner.inbound_tx.send(frame);
    }

    async fn write_with_timeout<W>(&self, writer: &mut W, frame: &Frame) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        tokio::time::timeout(self.inner.options.write_timeout, async {
            writer.write_all(frame.raw()).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| self.io_failure("write timed out"))?
        .map_err(|e| self.io_failure(e))?;
        self.inner.counters.record_out(frame.len());
        Ok(())
    }

    async fn read_stream(self, mut reader: ReadHalf<BoxedStream>) -> Result<()> {
        let mut buffer = FrameBuffer::new();
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            let n = reader
                .read(&mut chunk)
                .await
                .map_err(|e| self.io_failure(e))?;
            if n == 0 {
                return Err(self.io_failure("closed by peer"));
            }
            self.deliver(&mut buffer, &chunk[..n]);
        }
    }

    async fn write_stream(self, mut writer: WriteHalf<BoxedStream>) -> Result<()> {
        let mut rx = self.inner.outbound_rx.lock().await;
        while let Some(frame) = rx.recv().await {
            self.write_with_timeout(&mut writer, &frame).await?;
        }
        Ok(())
    }

    async fn read_websocket(self, mut stream: futures::stream::SplitStream<WsStream>) -> Result<()> {
        let mut buffer = FrameBuffer::new();
        while let Some(message) = stream.next().await {
            let message = message.map_err(|e| BridgeError::WebSocket {
                reason: e.to_string(),
            })?;
            match message {
                Message::Binary(data) => self.deliver(&mut buffer, &data),
                Message::Close(frame) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "no reason".to_string());
                    return Err(BridgeError::WebSocket {
                        reason: format!("closed by peer: {}", reason),
                    });
                }
                other => trace!(endpoint = %self.inner.name, kind = ?other, "ignoring websocket message"),
            }
        }
        Err(self.io_failure("closed by peer"))
    }

    async fn write_websocket(
        self,
        mut sink: futures::stream::SplitSink<WsStream, Message>,
    ) -> Result<()> {
        let mut rx = self.inner.outbound_rx.lock().await;
        while let Some(frame) = rx.recv().await {
            tokio::time::timeout(
                self.inner.options.write_timeout,
                sink.send(Message::Binary(frame.raw().to_vec())),
            )
            .await
            .map_err(|_| self.io_failure("write timed out"))?
            .map_err(|e| BridgeError::WebSocket {
                reason: e.to_string(),
            })?;
            self.inner.counters.record_out(frame.len());
        }
        Ok(())
    }

    async fn write_datagram(self, socket: UdpSocket) -> Result<()> {
        let mut rx = self.inner.outbound_rx.lock().await;
        while let Some(frame) = rx.recv().await {
            match tokio::time::timeout(self.inner.options.write_timeout, socket.send(frame.raw()))
                .await
            {
                Ok(Ok(_)) => self.inner.counters.record_out(frame.len()),
                Ok(Err(e)) => {
                    debug!(endpoint = %self.inner.name, error = %e, "mirror send failed")
                }
                Err(_) => debug!(endpoint = %self.inner.name, "mirror send timed out"),
            }
        }
        Ok(())
    }

    async fn read_injector(self, source: InjectorSource) -> Result<()> {
        loop {
            match source.next_frame().await {
                Some(frame) => self.deliver_frame(frame),
                None => return Err(self.io_failure("injection channel closed")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injector::{InjectorHandle, SensorMessage};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn tcp_endpoint(addr: String) -> Endpoint {
        Endpoint::new("cloud", Medium::Tcp { addr }, EndpointOptions::default())
    }

    fn heartbeat(seq: u8) -> Frame {
        Frame::build_v2(seq, 1, 1, 0, &[0, 0, 0, 0, 2, 3, 81, 4, 3], 50).unwrap()
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = tcp_endpoint(listener.local_addr().unwrap().to_string());
        let mut states = endpoint.subscribe();

        let (connect, accepted) = tokio::join!(endpoint.connect(), listener.accept());
        connect.unwrap();
        let (mut peer, _) = accepted.unwrap();
        assert!(endpoint.is_connected());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);

        assert!(endpoint.send_frame(heartbeat(1)));
        let mut buf = vec![0u8; heartbeat(1).len()];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(Frame::from_bytes(&buf).unwrap(), heartbeat(1));

        let mut bytes = vec![0x00, 0x55];
        bytes.extend_from_slice(heartbeat(2).raw());
        bytes.extend_from_slice(heartbeat(3).raw());
        peer.write_all(&bytes).await.unwrap();
        assert_eq!(endpoint.read_frame().await.unwrap(), heartbeat(2));
        assert_eq!(endpoint.read_frame().await.unwrap(), heartbeat(3));

        let stats = endpoint.stats();
        assert_eq!(stats.frames_in, 2);
        assert_eq!(stats.frames_out, 1);
        assert_eq!(stats.sessions, 1);
    }

    #[tokio::test]
    async fn test_peer_close_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = tcp_endpoint(listener.local_addr().unwrap().to_string());
        let (connect, accepted) = tokio::join!(endpoint.connect(), listener.accept());
        connect.unwrap();
        drop(accepted.unwrap());

        tokio::time::timeout(Duration::from_secs(2), endpoint.disconnected())
            .await
            .unwrap();
        assert!(!endpoint.is_connected());
        assert!(matches!(endpoint.state(), ConnectionState::Error(_)));
        assert!(!endpoint.send_frame(heartbeat(0)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let endpoint = tcp_endpoint(addr);
        assert!(endpoint.connect().await.is_err());
        assert!(matches!(endpoint.state(), ConnectionState::Error(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = tcp_endpoint(listener.local_addr().unwrap().to_string());
        let (connect, _accepted) = tokio::join!(endpoint.connect(), listener.accept());
        connect.unwrap();

        endpoint.close();
        endpoint.close();
        assert_eq!(endpoint.state(), ConnectionState::Disconnected);
        assert!(!endpoint.is_connected());
        assert!(!endpoint.send_frame(heartbeat(0)));
    }

    #[tokio::test]
    async fn test_close_during_connect_wins() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = tcp_endpoint(listener.local_addr().unwrap().to_string());

        // Holding the outbound queue parks connect after the medium opens.
        let held = endpoint.inner.outbound_rx.lock().await;
        let connecting = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.connect().await })
        };
        let (_peer, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        endpoint.close();
        drop(held);

        assert!(connecting.await.unwrap().is_err());
        assert!(!endpoint.is_connected());
        assert_eq!(endpoint.state(), ConnectionState::Disconnected);
        assert!(!endpoint.send_frame(heartbeat(0)));
        assert_eq!(endpoint.stats().sessions, 0);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_not_queued() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = tcp_endpoint(listener.local_addr().unwrap().to_string());
        assert!(!endpoint.send_frame(heartbeat(9)));

        let (connect, accepted) = tokio::join!(endpoint.connect(), listener.accept());
        connect.unwrap();
        let (mut peer, _) = accepted.unwrap();
        assert!(endpoint.send_frame(heartbeat(1)));

        let mut buf = vec![0u8; heartbeat(1).len()];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[4], 1);
    }

    #[tokio::test]
    async fn test_mirror_endpoint_is_send_only() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new(
            "mirror",
            Medium::UdpMirror {
                target: listener.local_addr().unwrap().to_string(),
            },
            EndpointOptions::default(),
        );
        endpoint.connect().await.unwrap();
        assert!(endpoint.send_frame(heartbeat(4)));

        let mut buf = [0u8; 64];
        let n = listener.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], heartbeat(4).raw().as_ref());
    }

    #[tokio::test]
    async fn test_injector_endpoint() {
        let handle = InjectorHandle::new();
        handle.configure(&Default::default());
        let endpoint = Endpoint::new(
            "injector",
            Medium::Injector(handle.source()),
            EndpointOptions::default(),
        );

        handle.set_active(true);
        endpoint.connect().await.unwrap();
        assert!(!endpoint.send_frame(heartbeat(0)));

        assert!(handle
            .submit(SensorMessage::new("gps", 232, 151, vec![2; 10]))
            .is_queued());
        let frame = endpoint.read_frame().await.unwrap();
        assert_eq!(frame.message_id(), 232);
        assert_eq!(frame.payload()[0], 2);
    }

    #[tokio::test]
    async fn test_shutdown_ends_reads() {
        let endpoint = tcp_endpoint("127.0.0.1:9".to_string());
        let reader = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.read_frame().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        endpoint.shutdown();
        assert!(reader.await.unwrap().is_none());
        assert!(endpoint.connect().await.is_err());
    }
}
