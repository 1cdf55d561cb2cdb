//! Link statistics.
//!
//! Every counter has exactly one writer: the forwarding task of its route,
//! the read task of its endpoint, or the injector. Readers aggregate them
//! into a [`StatsSnapshot`]; the snapshot is not transactionally consistent
//! across counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Counters owned by one forwarding route.
#[derive(Debug, Default)]
pub struct RouteCounters {
    frames: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
    signature_failures: AtomicU64,
    last_activity_ms: AtomicU64,
}

impl RouteCounters {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one frame read from the route's source.
    pub fn record_frame(&self, bytes: usize) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_activity_ms.store(unix_millis(), Ordering::Relaxed);
    }

    /// Records frames that could not be delivered.
    pub fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Records a frame whose signature failed validation.
    pub fn record_signature_failure(&self) {
        self.signature_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames read.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Bytes read.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Deliveries that were dropped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Signature validation failures.
    pub fn signature_failures(&self) -> u64 {
        self.signature_failures.load(Ordering::Relaxed)
    }

    /// Last activity in Unix milliseconds, 0 if none.
    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }
}

/// Counters of a single endpoint's I/O tasks.
#[derive(Debug, Default)]
pub struct EndpointCounters {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    desync_discards: AtomicU64,
    sessions: AtomicU64,
}

impl EndpointCounters {
    /// Frame parsed by the read task.
    pub fn record_in(&self, bytes: usize) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Frame written by the write task.
    pub fn record_out(&self, bytes: usize) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Bytes discarded by the stream buffer cap.
    pub fn record_discard(&self, bytes: u64) {
        if bytes > 0 {
            self.desync_discards.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    /// A session reached `Connected`.
    pub fn record_session(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy.
    pub fn snapshot(&self) -> EndpointStats {
        EndpointStats {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            desync_discards: self.desync_discards.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
        }
    }
}

/// Copy of one endpoint's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    /// Frames parsed from the medium.
    pub frames_in: u64,
    /// Frames written to the medium.
    pub frames_out: u64,
    /// Bytes of parsed frames.
    pub bytes_in: u64,
    /// Bytes written.
    pub bytes_out: u64,
    /// Bytes thrown away by the receive buffer cap.
    pub desync_discards: u64,
    /// Sessions established.
    pub sessions: u64,
}

/// Router-wide statistics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Frames read from the vehicle.
    pub uplink_frames: u64,
    /// Bytes read from the vehicle.
    pub uplink_bytes: u64,
    /// Frames read from the cloud.
    pub downlink_frames: u64,
    /// Bytes read from the cloud.
    pub downlink_bytes: u64,
    /// Frames produced by the sensor injector.
    pub injected_frames: u64,
    /// Frames not delivered (destination down, throttled or rejected).
    pub dropped_frames: u64,
    /// Frames whose signature failed validation.
    pub signature_failures: u64,
    /// Bytes discarded by receive buffer caps.
    pub desync_discards: u64,
    /// Last activity on any route, Unix milliseconds (0 if none).
    pub last_activity_ms: u64,
}

/// Counters for the three routes of the bridge.
#[derive(Debug, Default)]
pub struct LinkStats {
    /// vehicle -> cloud
    pub uplink: RouteCounters,
    /// cloud -> vehicle
    pub downlink: RouteCounters,
    /// injector -> vehicle, cloud
    pub injected: RouteCounters,
}

impl LinkStats {
    /// Creates zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregates route counters plus externally owned drop and discard
    /// counts.
    pub fn snapshot(&self, extra_dropped: u64, desync_discards: u64) -> StatsSnapshot {
        let routes = [&self.uplink, &self.downlink, &self.injected];
        StatsSnapshot {
            uplink_frames: self.uplink.frames(),
            uplink_bytes: self.uplink.bytes(),
            downlink_frames: self.downlink.frames(),
            downlink_bytes: self.downlink.bytes(),
            injected_frames: self.injected.frames(),
            dropped_frames: routes.iter().map(|r| r.dropped()).sum::<u64>() + extra_dropped,
            signature_failures: routes.iter().map(|r| r.signature_failures()).sum(),
            desync_discards,
            last_activity_ms: routes
                .iter()
                .map(|r| r.last_activity_ms())
                .max()
                .unwrap_or(0),
        }
    }
}
