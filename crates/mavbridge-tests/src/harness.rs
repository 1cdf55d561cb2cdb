//! Test harness: mock serial host, framed peers and router fixtures.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mavbridge_router::buffer::READ_CHUNK_SIZE;
use mavbridge_router::{
    BackoffConfig, BoxedStream, BridgeError, CloudConfig, CloudTransport, ConnectionState, Frame,
    FrameBuffer, MirrorConfig, Permission, Router, RouterConfig, SerialConfig, SerialHost,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex};

/// Default wait in harness helpers.
pub const WAIT: Duration = Duration::from_secs(3);

/// CRC_EXTRA of HEARTBEAT (id 0).
pub const HEARTBEAT_CRC_EXTRA: u8 = 50;
/// CRC_EXTRA of COMMAND_LONG (id 76).
pub const COMMAND_LONG_CRC_EXTRA: u8 = 152;

/// Installs a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// v2 HEARTBEAT from the autopilot with the given sequence number.
pub fn heartbeat(seq: u8) -> Frame {
    Frame::build_v2(seq, 1, 1, 0, &[0, 0, 0, 0, 2, 3, 81, 4, 3], HEARTBEAT_CRC_EXTRA)
        .expect("heartbeat fits")
}

/// v2 COMMAND_LONG from a ground station.
pub fn command_long(seq: u8, command: u16) -> Frame {
    let mut payload = vec![0u8; 33];
    payload[28..30].copy_from_slice(&command.to_le_bytes());
    payload[30] = 1;
    payload[31] = 1;
    payload[32] = 1;
    Frame::build_v2(seq, 255, 190, 76, &payload, COMMAND_LONG_CRC_EXTRA)
        .expect("command fits")
}

/// Router configuration with fast timings for tests.
pub fn fast_config() -> RouterConfig {
    RouterConfig {
        backoff: BackoffConfig {
            base_ms: 50,
            max_ms: 400,
        },
        connect_timeout_ms: 1_000,
        write_timeout_ms: 1_000,
        stats_interval_ms: 50,
        restart_settle_ms: 20,
        ..Default::default()
    }
}

/// Serial configuration used with [`MockSerialHost`].
pub fn serial_config() -> SerialConfig {
    SerialConfig { baud_rate: 57_600 }
}

/// In-memory serial host. Each successful open hands the far side of a
/// duplex pipe to the test.
#[derive(Debug)]
pub struct MockSerialHost {
    attached: watch::Sender<bool>,
    permission: watch::Sender<Permission>,
    links_tx: mpsc::UnboundedSender<DuplexStream>,
    links_rx: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    opens: AtomicUsize,
}

impl MockSerialHost {
    /// Creates a host with the given presence and grant.
    pub fn new(attached: bool, permission: Permission) -> Arc<Self> {
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            attached: watch::channel(attached).0,
            permission: watch::channel(permission).0,
            links_tx,
            links_rx: Mutex::new(links_rx),
            opens: AtomicUsize::new(0),
        })
    }

    /// Attached and granted.
    pub fn ready() -> Arc<Self> {
        Self::new(true, Permission::Granted)
    }

    /// Plugs the device in.
    pub fn attach(&self) {
        self.attached.send_replace(true);
    }

    /// Unplugs the device.
    pub fn detach(&self) {
        self.attached.send_replace(false);
    }

    /// Sets the access grant.
    pub fn set_permission(&self, permission: Permission) {
        self.permission.send_replace(permission);
    }

    /// Number of successful opens.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Vehicle side of the next opened link.
    pub async fn next_link(&self) -> Option<FramedPeer<DuplexStream>> {
        let mut rx = self.links_rx.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .ok()
            .flatten()
            .map(FramedPeer::new)
    }
}

#[async_trait]
impl SerialHost for MockSerialHost {
    fn name(&self) -> &str {
        "mock-serial"
    }

    fn attached(&self) -> watch::Receiver<bool> {
        self.attached.subscribe()
    }

    fn permission(&self) -> watch::Receiver<Permission> {
        self.permission.subscribe()
    }

    async fn open(&self, _baud_rate: u32) -> mavbridge_router::Result<BoxedStream> {
        if !*self.attached.borrow() {
            return Err(BridgeError::ResourceUnavailable {
                resource: self.name().to_string(),
            });
        }
        let (near, far) = tokio::io::duplex(16 * 1024);
        self.opens.fetch_add(1, Ordering::SeqCst);
        let _ = self.links_tx.send(far);
        Ok(Box::new(near))
    }
}

/// A byte-stream peer that speaks frames.
pub struct FramedPeer<S> {
    stream: S,
    buffer: FrameBuffer,
    pending: VecDeque<Frame>,
}

impl<S> FramedPeer<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: FrameBuffer::new(),
            pending: VecDeque::new(),
        }
    }

    /// Writes one frame.
    pub async fn send(&mut self, frame: &Frame) -> std::io::Result<()> {
        self.send_raw(frame.raw()).await
    }

    /// Writes raw bytes.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Next frame, or `None` on timeout or end of stream.
    pub async fn recv(&mut self, timeout: Duration) -> Option<Frame> {
        tokio::time::timeout(timeout, async {
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            loop {
                if let Some(frame) = self.pending.pop_front() {
                    return Some(frame);
                }
                let n = self.stream.read(&mut chunk).await.ok()?;
                if n == 0 {
                    return None;
                }
                self.pending.extend(self.buffer.push(&chunk[..n]));
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Collects `count` frames or fewer if the stream goes quiet.
    pub async fn recv_many(&mut self, count: usize, timeout: Duration) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(count);
        while frames.len() < count {
            match self.recv(timeout).await {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }
        frames
    }
}

/// TCP relay listener standing in for the cloud.
pub struct CloudRelay {
    listener: TcpListener,
}

impl CloudRelay {
    /// Binds an ephemeral local port.
    pub async fn bind() -> std::io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind("127.0.0.1:0").await?,
        })
    }

    /// Plain TCP cloud configuration pointing at this relay.
    pub fn config(&self) -> CloudConfig {
        CloudConfig {
            transport: CloudTransport::Tcp,
            host: "127.0.0.1".to_string(),
            port: self.port(),
            path: "/".to_string(),
            tls: None,
            auth_token: None,
        }
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// The raw listener, for relays that wrap the stream themselves.
    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }

    /// Next connection from the router.
    pub async fn accept(&self) -> Option<FramedPeer<TcpStream>> {
        let (stream, _) = tokio::time::timeout(WAIT, self.listener.accept())
            .await
            .ok()?
            .ok()?;
        Some(FramedPeer::new(stream))
    }
}

/// UDP listener standing in for a local ground station.
pub struct MirrorListener {
    socket: UdpSocket,
}

impl MirrorListener {
    /// Binds an ephemeral local port.
    pub async fn bind() -> std::io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind("127.0.0.1:0").await?,
        })
    }

    /// Mirror configuration pointing at this listener.
    pub fn config(&self) -> MirrorConfig {
        MirrorConfig {
            host: "127.0.0.1".to_string(),
            port: self.socket.local_addr().map(|a| a.port()).unwrap_or(0),
        }
    }

    /// Next datagram parsed as a frame.
    pub async fn recv(&self, timeout: Duration) -> Option<Frame> {
        let mut buf = [0u8; 512];
        let n = tokio::time::timeout(timeout, self.socket.recv(&mut buf))
            .await
            .ok()?
            .ok()?;
        Frame::from_bytes(&buf[..n])
    }
}

/// Waits until `name`'s state satisfies `pred`.
pub async fn wait_for_endpoint<F>(router: &Router, name: &str, pred: F) -> bool
where
    F: Fn(&ConnectionState) -> bool,
{
    let mut rx = match router.subscribe_endpoint(name) {
        Some(rx) => rx,
        None => return false,
    };
    let reached = matches!(
        tokio::time::timeout(WAIT, rx.wait_for(|state| pred(state))).await,
        Ok(Ok(_))
    );
    reached
}

/// Waits until every named endpoint is connected.
pub async fn wait_connected(router: &Router, names: &[&str]) -> bool {
    for name in names {
        if !wait_for_endpoint(router, name, |s| s.is_connected()).await {
            return false;
        }
    }
    true
}

/// Polls `cond` until it holds or [`WAIT`] elapses.
pub async fn eventually<F>(mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
