//! Serial link to the vehicle controller.
//!
//! Device discovery and access grants belong to the host platform. The
//! router only observes them through [`SerialHost`] and opens the stream
//! once the device is attached and access is granted.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{BridgeError, Result};
use crate::state::ConnectionState;
use crate::transport::BoxedStream;

/// Access grant for the serial device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    /// The user has not answered yet.
    #[default]
    Pending,
    /// Access granted.
    Granted,
    /// Access refused; only a new grant from the host unblocks the link.
    Denied,
}

/// Host-side provider of the vehicle's serial device.
#[async_trait]
pub trait SerialHost: Send + Sync + fmt::Debug {
    /// Device name used in logs and errors.
    fn name(&self) -> &str;

    /// Presence of the device.
    fn attached(&self) -> watch::Receiver<bool>;

    /// Access grant for the device.
    fn permission(&self) -> watch::Receiver<Permission>;

    /// Opens the device at `baud_rate`.
    async fn open(&self, baud_rate: u32) -> Result<BoxedStream>;
}

/// Waits for the device and its grant, then opens it.
///
/// Publishes `WaitingForResource`, `WaitingForPermission` and `Connecting`
/// through `set_state` as the wait progresses. A denied grant returns
/// `PermissionDenied` without waiting.
pub(crate) async fn acquire(
    host: &dyn SerialHost,
    baud_rate: u32,
    set_state: &(dyn Fn(ConnectionState) + Send + Sync),
    cancel: &CancellationToken,
) -> Result<BoxedStream> {
    let mut attached = host.attached();
    if !*attached.borrow_and_update() {
        set_state(ConnectionState::WaitingForResource);
        info!(device = host.name(), "waiting for serial device");
        tokio::select! {
            _ = cancel.cancelled() => return Err(BridgeError::NotConnected),
            res = attached.wait_for(|present| *present) => {
                res.map_err(|_| BridgeError::ResourceUnavailable {
                    resource: host.name().to_string(),
                })?;
            }
        }
    }

    let mut permission = host.permission();
    loop {
        let current = *permission.borrow_and_update();
        match current {
            Permission::Granted => break,
            Permission::Denied => {
                return Err(BridgeError::PermissionDenied {
                    resource: host.name().to_string(),
                })
            }
            Permission::Pending => {
                set_state(ConnectionState::WaitingForPermission);
                info!(device = host.name(), "waiting for serial permission");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BridgeError::NotConnected),
                    res = permission.changed() => {
                        res.map_err(|_| BridgeError::PermissionDenied {
                            resource: host.name().to_string(),
                        })?;
                    }
                }
            }
        }
    }

    set_state(ConnectionState::Connecting);
    debug!(device = host.name(), baud_rate, "opening serial device");
    host.open(baud_rate).await
}

/// Resolves when the device is reported detached.
pub(crate) async fn detached(host: &dyn SerialHost) {
    let mut attached = host.attached();
    if attached.wait_for(|present| !*present).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// [`SerialHost`] backed by a character device path such as `/dev/ttyACM0`.
///
/// Presence is polled. Line settings (baud rate, raw mode) are expected to be
/// applied outside the process, for example by udev rules or `stty`.
pub struct DevicePathHost {
    path: PathBuf,
    name: String,
    attached_tx: watch::Sender<bool>,
    permission_tx: watch::Sender<Permission>,
}

impl fmt::Debug for DevicePathHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevicePathHost")
            .field("path", &self.path)
            .field("attached", &*self.attached_tx.borrow())
            .field("permission", &*self.permission_tx.borrow())
            .finish()
    }
}

impl DevicePathHost {
    /// Creates the host and spawns its presence poller.
    ///
    /// The poller stops when `cancel` fires.
    pub fn spawn(
        path: impl Into<PathBuf>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let path = path.into();
        let host = Arc::new(Self {
            name: path.display().to_string(),
            path,
            attached_tx: watch::channel(false).0,
            permission_tx: watch::channel(Permission::Pending).0,
        });

        let poller = Arc::clone(&host);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => poller.poll().await,
                }
            }
        });
        host
    }

    /// Device path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn poll(&self) {
        let present = tokio::fs::metadata(&self.path).await.is_ok();
        let changed = self.attached_tx.send_if_modified(|current| {
            let changed = *current != present;
            *current = present;
            changed
        });
        if changed {
            info!(device = %self.name, present, "serial device presence changed");
        }

        if !present {
            self.permission_tx.send_replace(Permission::Pending);
            return;
        }
        if changed || *self.permission_tx.borrow() != Permission::Granted {
            let grant = check_access(&self.path).await;
            self.permission_tx.send_if_modified(|current| {
                let changed = *current != grant;
                *current = grant;
                changed
            });
        }
    }
}

async fn check_access(path: &Path) -> Permission {
    match tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .await
    {
        Err(e) if e.kind() == ErrorKind::PermissionDenied => Permission::Denied,
        _ => Permission::Granted,
    }
}

#[async_trait]
impl SerialHost for DevicePathHost {
    fn name(&self) -> &str {
        &self.name
    }

    fn attached(&self) -> watch::Receiver<bool> {
        self.attached_tx.subscribe()
    }

    fn permission(&self) -> watch::Receiver<Permission> {
        self.permission_tx.subscribe()
    }

    async fn open(&self, baud_rate: u32) -> Result<BoxedStream> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => BridgeError::ResourceUnavailable {
                    resource: self.name.clone(),
                },
                ErrorKind::PermissionDenied => {
                    self.permission_tx.send_replace(Permission::Denied);
                    BridgeError::PermissionDenied {
                        resource: self.name.clone(),
                    }
                }
                _ => BridgeError::IoFailure {
                    endpoint: self.name.clone(),
                    reason: e.to_string(),
                },
            })?;
        debug!(device = %self.name, baud_rate, "serial device opened");
        Ok(Box::new(file))
    }
}
