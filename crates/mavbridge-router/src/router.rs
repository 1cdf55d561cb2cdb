//! Router: endpoint supervision, frame forwarding and link statistics.
//!
//! Topology for one running session:
//!
//! ```text
//! vehicle  --> cloud, mirror            (uplink)
//! cloud    --> vehicle, mirror          (downlink)
//! injector --> vehicle, cloud, mirror   (injected)
//! ```
//!
//! The vehicle and cloud endpoints each have a supervisor that reconnects
//! with exponential backoff. The mirror and the injector are connected once.
//! One forwarding task per route moves frames from its source to its
//! destinations; a disconnected destination refuses the frame and it is
//! counted as dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::RouterConfig;
use crate::endpoint::{Endpoint, EndpointOptions};
use crate::error::{BridgeError, Result};
use crate::injector::InjectorHandle;
use crate::metrics::{LinkStats, RouteCounters, StatsSnapshot};
use crate::retry::{Backoff, BackoffConfig};
use crate::serial::{Permission, SerialHost};
use crate::signing::Signer;
use crate::state::{ConnectionState, RouterState};
use crate::transport::Medium;

/// Name of the serial endpoint to the vehicle.
pub const VEHICLE: &str = "vehicle";
/// Name of the cloud relay endpoint.
pub const CLOUD: &str = "cloud";
/// Name of the UDP mirror endpoint.
pub const MIRROR: &str = "mirror";
/// Name of the sensor injector endpoint.
pub const INJECTOR: &str = "injector";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteKind {
    Uplink,
    Downlink,
    Injected,
}

impl RouteKind {
    fn name(self) -> &'static str {
        match self {
            RouteKind::Uplink => "uplink",
            RouteKind::Downlink => "downlink",
            RouteKind::Injected => "injected",
        }
    }

    /// Routes whose frames arrive from a peer that may sign them.
    fn validates(self) -> bool {
        matches!(self, RouteKind::Uplink | RouteKind::Downlink)
    }
}

struct Destination {
    endpoint: Endpoint,
    sign: bool,
}

struct Route {
    kind: RouteKind,
    source: Endpoint,
    destinations: Vec<Destination>,
    mirror: Option<Endpoint>,
}

#[derive(Debug, Default, Clone)]
struct Endpoints {
    vehicle: Option<Endpoint>,
    cloud: Option<Endpoint>,
    mirror: Option<Endpoint>,
    injector: Option<Endpoint>,
}

impl Endpoints {
    fn all(&self) -> Vec<Endpoint> {
        [&self.vehicle, &self.cloud, &self.mirror, &self.injector]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

struct Running {
    token: CancellationToken,
    endpoints: Endpoints,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    serial_host: Option<Arc<dyn SerialHost>>,
    state_tx: watch::Sender<RouterState>,
    stats_tx: watch::Sender<StatsSnapshot>,
    stats: LinkStats,
    injector: InjectorHandle,
    running: Mutex<Option<Running>>,
    last_config: Mutex<Option<RouterConfig>>,
    retired_discards: AtomicU64,
}

impl Shared {
    fn snapshot(&self, endpoints: &[Endpoint]) -> StatsSnapshot {
        let live: u64 = endpoints.iter().map(|e| e.stats().desync_discards).sum();
        self.stats.snapshot(
            self.injector.dropped(),
            self.retired_discards.load(Ordering::Relaxed) + live,
        )
    }
}

/// The routing engine.
///
/// Statistics and the injector handle outlive individual start/stop cycles.
pub struct Router {
    shared: Arc<Shared>,
}

impl Router {
    /// Creates a stopped router. `serial_host` is required for configurations
    /// with a vehicle link.
    pub fn new(serial_host: Option<Arc<dyn SerialHost>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                serial_host,
                state_tx: watch::channel(RouterState::Stopped).0,
                stats_tx: watch::channel(StatsSnapshot::default()).0,
                stats: LinkStats::new(),
                injector: InjectorHandle::new(),
                running: Mutex::new(None),
                last_config: Mutex::new(None),
                retired_discards: AtomicU64::new(0),
            }),
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.shared
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: RouterState) {
        info!(state = %state, "router state changed");
        self.shared.state_tx.send_replace(state);
    }

    /// Validates `config` and starts every configured endpoint and route.
    ///
    /// Configuration errors are returned before anything is spawned. Must be
    /// called within a tokio runtime.
    pub fn start(&self, config: RouterConfig) -> Result<()> {
        let mut running = self.lock_running();
        if running.is_some() {
            return Err(BridgeError::AlreadyRunning);
        }
        self.set_state(RouterState::Starting);

        match self.launch(&config) {
            Ok(session) => {
                *running = Some(session);
                *self
                    .shared
                    .last_config
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(config);
                self.set_state(RouterState::Running);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "router start failed");
                self.set_state(RouterState::Error(e.to_string()));
                Err(e)
            }
        }
    }

    fn launch(&self, config: &RouterConfig) -> Result<Running> {
        config.validate()?;

        let signer = Arc::new(match &config.signing {
            Some(signing) => signing.signer()?,
            None => Signer::disabled(),
        });
        let reject_invalid = config
            .signing
            .as_ref()
            .map(|s| s.reject_invalid)
            .unwrap_or(false);

        let options = EndpointOptions {
            connect_timeout: config.connect_timeout(),
            write_timeout: config.write_timeout(),
        };

        let mut endpoints = Endpoints::default();
        if let Some(vehicle) = &config.vehicle {
            let host = self.shared.serial_host.clone().ok_or_else(|| {
                BridgeError::config("vehicle link configured without a serial host")
            })?;
            endpoints.vehicle = Some(Endpoint::new(
                VEHICLE,
                Medium::Serial {
                    host,
                    baud_rate: vehicle.baud_rate,
                },
                options,
            ));
        }
        if let Some(cloud) = &config.cloud {
            endpoints.cloud = Some(Endpoint::new(CLOUD, Medium::cloud(cloud)?, options));
        }
        if let Some(mirror) = &config.mirror {
            endpoints.mirror = Some(Endpoint::new(MIRROR, Medium::mirror(mirror), options));
        }
        if let Some(injection) = &config.injection {
            self.shared.injector.configure(injection);
            endpoints.injector = Some(Endpoint::new(
                INJECTOR,
                Medium::Injector(self.shared.injector.source()),
                options,
            ));
        }

        let token = CancellationToken::new();
        let mut tasks = Vec::new();

        for endpoint in [&endpoints.vehicle, &endpoints.cloud].into_iter().flatten() {
            tasks.push(tokio::spawn(supervise(
                endpoint.clone(),
                config.backoff,
                token.child_token(),
            )));
        }
        for endpoint in [&endpoints.mirror, &endpoints.injector].into_iter().flatten() {
            tasks.push(tokio::spawn(connect_once(
                endpoint.clone(),
                token.child_token(),
            )));
        }

        for route in routes(&endpoints) {
            debug!(
                route = route.kind.name(),
                destinations = route.destinations.len(),
                mirrored = route.mirror.is_some(),
                "route ready"
            );
            tasks.push(tokio::spawn(forward(
                route,
                Arc::clone(&self.shared),
                Arc::clone(&signer),
                reject_invalid,
                token.child_token(),
            )));
        }

        tasks.push(tokio::spawn(publish_stats(
            Arc::clone(&self.shared),
            endpoints.all(),
            config.stats_interval(),
            token.child_token(),
        )));

        self.shared.injector.set_active(endpoints.injector.is_some());
        info!(
            vehicle = endpoints.vehicle.is_some(),
            cloud = endpoints.cloud.is_some(),
            mirror = endpoints.mirror.is_some(),
            injector = endpoints.injector.is_some(),
            signing = signer.is_enabled(),
            "router started"
        );

        Ok(Running {
            token,
            endpoints,
            tasks,
        })
    }

    /// Cancels every task and closes every endpoint.
    pub async fn stop(&self) {
        let running = self.lock_running().take();
        if let Some(running) = running {
            running.token.cancel();
            self.shared.injector.set_active(false);
            for endpoint in running.endpoints.all() {
                endpoint.shutdown();
            }
            for task in running.tasks {
                let _ = task.await;
            }
            let discarded = self.shared.injector.source().discard_pending().await;
            if discarded > 0 {
                self.shared.stats.injected.record_dropped(discarded as u64);
                debug!(discarded, "discarded pending sensor messages");
            }
            let retired: u64 = running
                .endpoints
                .all()
                .iter()
                .map(|e| e.stats().desync_discards)
                .sum();
            self.shared
                .retired_discards
                .fetch_add(retired, Ordering::Relaxed);
            self.shared.stats_tx.send_replace(self.shared.snapshot(&[]));
            info!("router stopped");
        }
        if *self.shared.state_tx.borrow() != RouterState::Stopped {
            self.set_state(RouterState::Stopped);
        }
    }

    /// Stops, waits the settle delay, and starts with `config` or the
    /// previous configuration.
    pub async fn restart(&self, config: Option<RouterConfig>) -> Result<()> {
        let config = match config {
            Some(config) => config,
            None => self
                .shared
                .last_config
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .ok_or_else(|| BridgeError::config("no previous configuration to restart with"))?,
        };
        config.validate()?;

        self.stop().await;
        tokio::time::sleep(config.restart_settle()).await;
        self.start(config)
    }

    /// Current router state.
    pub fn state(&self) -> RouterState {
        self.shared.state_tx.borrow().clone()
    }

    /// Subscribes to router state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<RouterState> {
        self.shared.state_tx.subscribe()
    }

    /// Statistics right now.
    pub fn stats(&self) -> StatsSnapshot {
        let endpoints = self
            .lock_running()
            .as_ref()
            .map(|r| r.endpoints.all())
            .unwrap_or_default();
        self.shared.snapshot(&endpoints)
    }

    /// Subscribes to periodic statistics snapshots.
    pub fn subscribe_stats(&self) -> watch::Receiver<StatsSnapshot> {
        self.shared.stats_tx.subscribe()
    }

    /// States of the endpoints of the running session, by name.
    pub fn endpoint_states(&self) -> BTreeMap<String, ConnectionState> {
        self.lock_running()
            .as_ref()
            .map(|r| {
                r.endpoints
                    .all()
                    .into_iter()
                    .map(|e| (e.name().to_string(), e.state()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Subscribes to one endpoint of the running session.
    pub fn subscribe_endpoint(&self, name: &str) -> Option<watch::Receiver<ConnectionState>> {
        self.lock_running().as_ref().and_then(|r| {
            r.endpoints
                .all()
                .into_iter()
                .find(|e| e.name() == name)
                .map(|e| e.subscribe())
        })
    }

    /// Handle for submitting sensor readings.
    pub fn injector(&self) -> InjectorHandle {
        self.shared.injector.clone()
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        if let Some(running) = self.lock_running().take() {
            running.token.cancel();
            for endpoint in running.endpoints.all() {
                endpoint.shutdown();
            }
        }
    }
}

fn routes(endpoints: &Endpoints) -> Vec<Route> {
    let dest = |endpoint: &Option<Endpoint>, sign: bool| {
        endpoint.clone().map(|endpoint| Destination { endpoint, sign })
    };

    let mut routes = Vec::new();
    if let Some(vehicle) = &endpoints.vehicle {
        routes.push(Route {
            kind: RouteKind::Uplink,
            source: vehicle.clone(),
            destinations: dest(&endpoints.cloud, false).into_iter().collect(),
            mirror: endpoints.mirror.clone(),
        });
    }
    if let Some(cloud) = &endpoints.cloud {
        routes.push(Route {
            kind: RouteKind::Downlink,
            source: cloud.clone(),
            destinations: dest(&endpoints.vehicle, true).into_iter().collect(),
            mirror: endpoints.mirror.clone(),
        });
    }
    if let Some(injector) = &endpoints.injector {
        routes.push(Route {
            kind: RouteKind::Injected,
            source: injector.clone(),
            destinations: [dest(&endpoints.vehicle, true), dest(&endpoints.cloud, false)]
                .into_iter()
                .flatten()
                .collect(),
            mirror: endpoints.mirror.clone(),
        });
    }
    routes
}

fn route_counters(stats: &LinkStats, kind: RouteKind) -> &RouteCounters {
    match kind {
        RouteKind::Uplink => &stats.uplink,
        RouteKind::Downlink => &stats.downlink,
        RouteKind::Injected => &stats.injected,
    }
}

/// Reconnect loop for one endpoint.
async fn supervise(endpoint: Endpoint, backoff: BackoffConfig, token: CancellationToken) {
    let mut backoff = Backoff::new(backoff);
    loop {
        let result = tokio::select! {
            _ = token.cancelled() => break,
            res = endpoint.connect() => res,
        };

        match result {
            Ok(()) => {
                backoff.reset();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = endpoint.disconnected() => {}
                }
            }
            Err(BridgeError::PermissionDenied { resource }) => {
                let Some(host) = endpoint.medium().serial_host() else {
                    break;
                };
                info!(endpoint = endpoint.name(), resource = %resource, "permission denied, waiting for a new grant");
                let mut permission = host.permission();
                let granted = tokio::select! {
                    _ = token.cancelled() => break,
                    res = permission.wait_for(|p| *p != Permission::Denied) => res.is_ok(),
                };
                if !granted {
                    break;
                }
                continue;
            }
            Err(e) if !e.is_retryable() => {
                warn!(endpoint = endpoint.name(), error = %e, "giving up on endpoint");
                break;
            }
            Err(_) => {}
        }

        let delay = backoff.next_delay();
        info!(
            endpoint = endpoint.name(),
            attempt = backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "reconnecting"
        );
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!(endpoint = endpoint.name(), "supervisor stopped");
}

/// Single connection attempt for fire-and-forget endpoints.
async fn connect_once(endpoint: Endpoint, token: CancellationToken) {
    let result = tokio::select! {
        _ = token.cancelled() => return,
        res = endpoint.connect() => res,
    };
    if let Err(e) = result {
        warn!(endpoint = endpoint.name(), error = %e, "endpoint left down");
    }
}

async fn forward(
    route: Route,
    shared: Arc<Shared>,
    signer: Arc<Signer>,
    reject_invalid: bool,
    token: CancellationToken,
) {
    let counters = route_counters(&shared.stats, route.kind);
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = route.source.read_frame() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        counters.record_frame(frame.len());

        if route.kind.validates() && signer.is_enabled() && frame.is_signed() {
            if let Err(e) = signer.verify(&frame) {
                counters.record_signature_failure();
                warn!(route = route.kind.name(), error = %e, reject_invalid, "invalid signature");
                if reject_invalid {
                    continue;
                }
            }
        }

        for destination in &route.destinations {
            let outgoing = if destination.sign {
                signer.sign(&frame)
            } else {
                frame.clone()
            };
            if !destination.endpoint.send_frame(outgoing) {
                counters.record_dropped(1);
                trace!(
                    route = route.kind.name(),
                    destination = destination.endpoint.name(),
                    "destination down, frame dropped"
                );
            }
        }
        if let Some(mirror) = &route.mirror {
            mirror.send_frame(frame);
        }
    }
    debug!(route = route.kind.name(), "forwarding stopped");
}

async fn publish_stats(
    shared: Arc<Shared>,
    endpoints: Vec<Endpoint>,
    interval: std::time::Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = shared.snapshot(&endpoints);
                debug!(
                    uplink_frames = snapshot.uplink_frames,
                    downlink_frames = snapshot.downlink_frames,
                    injected_frames = snapshot.injected_frames,
                    dropped_frames = snapshot.dropped_frames,
                    signature_failures = snapshot.signature_failures,
                    "link stats"
                );
                shared.stats_tx.send_replace(snapshot);
            }
        }
    }
}
