//! Synthetic telemetry injection from host sensors.
//!
//! The host submits [`SensorMessage`]s through an [`InjectorHandle`]. The
//! handle throttles each sensor to its configured rate and queues accepted
//! messages on a bounded channel; the injector endpoint drains the channel
//! and wraps each message in a v2 frame. Throttled and rejected submissions
//! are counted as dropped frames.
//!
//! The channel belongs to the router, so a handle stays valid across
//! restarts. Submissions are refused while the router is stopped, and
//! messages still queued at stop are discarded.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::config::InjectionConfig;
use crate::protocol::{Frame, MAX_PAYLOAD_LEN};

/// Capacity of the submission channel.
pub const INJECT_QUEUE_CAPACITY: usize = 64;

/// One sensor reading, already encoded as a MAVLink payload by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorMessage {
    /// Sensor name, matched against the configured rates.
    pub sensor: String,
    /// MAVLink message id.
    pub message_id: u32,
    /// CRC_EXTRA of the message definition.
    pub crc_extra: u8,
    /// Encoded payload.
    pub payload: Vec<u8>,
}

impl SensorMessage {
    /// Creates a message for `sensor`.
    pub fn new(sensor: impl Into<String>, message_id: u32, crc_extra: u8, payload: Vec<u8>) -> Self {
        Self {
            sensor: sensor.into(),
            message_id,
            crc_extra,
            payload,
        }
    }
}

/// Result of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Queued for injection.
    Queued,
    /// Faster than the sensor's configured rate, or the sensor is disabled.
    Throttled,
    /// The channel is full.
    QueueFull,
    /// Injection is not running.
    Inactive,
    /// The payload exceeds the frame limit.
    Oversized,
}

impl SubmitOutcome {
    /// Whether the message was accepted.
    pub fn is_queued(self) -> bool {
        matches!(self, SubmitOutcome::Queued)
    }
}

#[derive(Debug, Clone, Copy)]
struct Identity {
    system_id: u8,
    component_id: u8,
}

#[derive(Debug)]
struct Shared {
    tx: mpsc::Sender<SensorMessage>,
    rx: tokio::sync::Mutex<mpsc::Receiver<SensorMessage>>,
    active: AtomicBool,
    identity: RwLock<Identity>,
    min_intervals: RwLock<BTreeMap<String, Option<Duration>>>,
    last_accepted: Mutex<HashMap<String, Instant>>,
    dropped: AtomicU64,
    sequence: AtomicU8,
}

/// Host-facing submission handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct InjectorHandle {
    shared: Arc<Shared>,
}

impl InjectorHandle {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::channel(INJECT_QUEUE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                tx,
                rx: tokio::sync::Mutex::new(rx),
                active: AtomicBool::new(false),
                identity: RwLock::new(Identity {
                    system_id: 1,
                    component_id: 191,
                }),
                min_intervals: RwLock::new(BTreeMap::new()),
                last_accepted: Mutex::new(HashMap::new()),
                dropped: AtomicU64::new(0),
                sequence: AtomicU8::new(0),
            }),
        }
    }

    /// Applies ids and rates for the next session.
    pub(crate) fn configure(&self, config: &InjectionConfig) {
        *self
            .shared
            .identity
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Identity {
            system_id: config.system_id,
            component_id: config.component_id,
        };
        let intervals = config
            .rates_hz
            .iter()
            .map(|(sensor, hz)| {
                // A period too long to represent is treated like a zero rate.
                let interval = if *hz > 0.0 {
                    Duration::try_from_secs_f64(1.0 / hz).ok()
                } else {
                    None
                };
                (sensor.clone(), interval)
            })
            .collect();
        *self
            .shared
            .min_intervals
            .write()
            .unwrap_or_else(PoisonError::into_inner) = intervals;
        self.shared
            .last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.shared.active.store(active, Ordering::Release);
    }

    /// Whether submissions are currently accepted.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Submits a reading without blocking.
    pub fn submit(&self, message: SensorMessage) -> SubmitOutcome {
        let outcome = self.try_submit(message);
        if !outcome.is_queued() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(?outcome, "sensor message not queued");
        }
        outcome
    }

    fn try_submit(&self, message: SensorMessage) -> SubmitOutcome {
        if !self.is_active() {
            return SubmitOutcome::Inactive;
        }
        if message.payload.len() > MAX_PAYLOAD_LEN {
            return SubmitOutcome::Oversized;
        }
        if !self.admit(&message.sensor) {
            return SubmitOutcome::Throttled;
        }
        match self.shared.tx.try_send(message) {
            Ok(()) => SubmitOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => SubmitOutcome::QueueFull,
            Err(mpsc::error::TrySendError::Closed(_)) => SubmitOutcome::Inactive,
        }
    }

    fn admit(&self, sensor: &str) -> bool {
        let interval = match self
            .shared
            .min_intervals
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sensor)
        {
            None => return true,
            Some(None) => return false,
            Some(Some(interval)) => *interval,
        };

        let now = Instant::now();
        let mut last = self
            .shared
            .last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match last.get(sensor) {
            Some(prev) if now.duration_since(*prev) < interval => false,
            _ => {
                last.insert(sensor.to_string(), now);
                true
            }
        }
    }

    /// Submissions that were not queued.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn source(&self) -> InjectorSource {
        InjectorSource {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Endpoint-side view of the injection channel.
#[derive(Debug, Clone)]
pub struct InjectorSource {
    shared: Arc<Shared>,
}

impl InjectorSource {
    /// Drops every queued message.
    pub(crate) async fn discard_pending(&self) -> usize {
        let mut rx = self.shared.rx.lock().await;
        let mut discarded = 0;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    /// Waits for the next message and frames it.
    ///
    /// Returns `None` only if the channel closes.
    pub(crate) async fn next_frame(&self) -> Option<Frame> {
        let mut rx = self.shared.rx.lock().await;
        loop {
            let message = rx.recv().await?;
            let identity = *self
                .shared
                .identity
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let sequence = self.shared.sequence.fetch_add(1, Ordering::Relaxed);
            match Frame::build_v2(
                sequence,
                identity.system_id,
                identity.component_id,
                message.message_id,
                &message.payload,
                message.crc_extra,
            ) {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(sensor = %message.sensor, error = %e, "failed to frame sensor message");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_handle(rates: &[(&str, f64)]) -> InjectorHandle {
        let handle = InjectorHandle::new();
        let mut config = InjectionConfig::default();
        for (sensor, hz) in rates {
            config.rates_hz.insert(sensor.to_string(), *hz);
        }
        config.system_id = 7;
        config.component_id = 42;
        handle.configure(&config);
        handle.set_active(true);
        handle
    }

    fn gps(payload: u8) -> SensorMessage {
        SensorMessage::new("gps", 232, 151, vec![payload; 20])
    }

    #[tokio::test]
    async fn test_inactive_rejects() {
        let handle = InjectorHandle::new();
        assert_eq!(handle.submit(gps(1)), SubmitOutcome::Inactive);
        assert_eq!(handle.dropped(), 1);
    }

    #[tokio::test]
    async fn test_frames_carry_identity_and_sequence() {
        let handle = active_handle(&[]);
        let source = handle.source();
        assert!(handle.submit(gps(1)).is_queued());
        assert!(handle.submit(gps(2)).is_queued());

        let first = source.next_frame().await.unwrap();
        let second = source.next_frame().await.unwrap();
        assert_eq!(first.system_id(), 7);
        assert_eq!(first.component_id(), 42);
        assert_eq!(first.message_id(), 232);
        assert!(first.validate_checksum(151));
        assert_eq!(second.sequence(), first.sequence().wrapping_add(1));
        assert_eq!(second.payload()[0], 2);
        assert_eq!(handle.dropped(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_throttle() {
        let handle = active_handle(&[("gps", 5.0)]);
        assert_eq!(handle.submit(gps(1)), SubmitOutcome::Queued);
        assert_eq!(handle.submit(gps(2)), SubmitOutcome::Throttled);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(handle.submit(gps(3)), SubmitOutcome::Throttled);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(handle.submit(gps(4)), SubmitOutcome::Queued);

        assert_eq!(
            handle.submit(SensorMessage::new("baro", 29, 115, vec![0; 14])),
            SubmitOutcome::Queued
        );
        assert_eq!(handle.dropped(), 2);
    }

    #[tokio::test]
    async fn test_zero_rate_disables_sensor() {
        let handle = active_handle(&[("gps", 0.0)]);
        assert_eq!(handle.submit(gps(1)), SubmitOutcome::Throttled);
    }

    #[tokio::test]
    async fn test_unrepresentable_period_disables_sensor() {
        let handle = active_handle(&[("gps", 1e-30)]);
        assert_eq!(handle.submit(gps(1)), SubmitOutcome::Throttled);
    }

    #[tokio::test]
    async fn test_queue_full() {
        let handle = active_handle(&[]);
        for i in 0..INJECT_QUEUE_CAPACITY {
            assert!(handle.submit(gps(i as u8)).is_queued());
        }
        assert_eq!(handle.submit(gps(0)), SubmitOutcome::QueueFull);
        assert_eq!(handle.dropped(), 1);
    }

    #[tokio::test]
    async fn test_oversized_payload() {
        let handle = active_handle(&[]);
        let msg = SensorMessage::new("lidar", 1, 0, vec![1; MAX_PAYLOAD_LEN + 1]);
        assert_eq!(handle.submit(msg), SubmitOutcome::Oversized);
    }

    #[tokio::test]
    async fn test_discard_pending() {
        let handle = active_handle(&[]);
        handle.submit(gps(1));
        handle.submit(gps(2));
        assert_eq!(handle.source().discard_pending().await, 2);
        assert_eq!(handle.source().discard_pending().await, 0);
    }
}
