//! MAVLink v2 message signing.
//!
//! A signature block is `link_id (1) || timestamp (6, LE) || sig (6)` where
//! `sig` is the first six bytes of
//! `SHA-256(key || frame bytes without signature || link_id || timestamp)`.
//! Timestamps count 10 microsecond ticks since 2015-01-01 00:00:00 UTC and
//! never repeat within one [`Signer`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{BridgeError, Result};
use crate::protocol::{Frame, ProtocolVersion, IFLAG_SIGNED, SIGNATURE_LEN};

/// Length of the shared secret.
pub const SIGNING_KEY_LEN: usize = 32;

/// Seconds between the Unix epoch and the MAVLink signing epoch (2015-01-01).
const SIGNING_EPOCH_SECS: u64 = 1_420_070_400;

/// Largest value a 48-bit timestamp can hold.
const TIMESTAMP_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// Shared 32-byte signing secret. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningKey {
    bytes: [u8; SIGNING_KEY_LEN],
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey").field("bytes", &"<redacted>").finish()
    }
}

impl SigningKey {
    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; SIGNING_KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Parses a 64-character hex string.
    pub fn from_hex(text: &str) -> Result<Self> {
        let mut decoded = hex::decode(text.trim())
            .map_err(|e| BridgeError::config(format!("signing key is not hex: {}", e)))?;
        if decoded.len() != SIGNING_KEY_LEN {
            let len = decoded.len();
            decoded.zeroize();
            return Err(BridgeError::config(format!(
                "signing key must be {} bytes, got {}",
                SIGNING_KEY_LEN, len
            )));
        }
        let mut bytes = [0u8; SIGNING_KEY_LEN];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self { bytes })
    }

    fn as_bytes(&self) -> &[u8; SIGNING_KEY_LEN] {
        &self.bytes
    }
}

/// Signs and validates frames for one session.
pub struct Signer {
    key: Option<SigningKey>,
    link_id: u8,
    last_timestamp: AtomicU64,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("enabled", &self.is_enabled())
            .field("link_id", &self.link_id)
            .finish()
    }
}

impl Signer {
    /// A signer that attaches nothing and accepts everything.
    pub fn disabled() -> Self {
        Self {
            key: None,
            link_id: 0,
            last_timestamp: AtomicU64::new(0),
        }
    }

    /// A signer using `key` and stamping `link_id` on generated blocks.
    pub fn new(key: SigningKey, link_id: u8) -> Self {
        Self {
            key: Some(key),
            link_id,
            last_timestamp: AtomicU64::new(0),
        }
    }

    /// Whether a key is configured.
    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Link id written into generated signature blocks.
    pub fn link_id(&self) -> u8 {
        self.link_id
    }

    /// Next timestamp: `max(last + 1, now)`, stored back atomically.
    pub fn next_timestamp(&self) -> u64 {
        let now = wall_clock_ticks();
        let mut current = self.last_timestamp.load(Ordering::Relaxed);
        loop {
            let next = (current + 1).max(now) & TIMESTAMP_MASK;
            match self.last_timestamp.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    /// Computes a signature block over the frame's unsigned bytes.
    ///
    /// Returns `None` when signing is disabled. The frame's signed flag must
    /// already be set for the result to validate on the receiving side.
    pub fn generate(&self, frame: &Frame) -> Option<[u8; SIGNATURE_LEN]> {
        let key = self.key.as_ref()?;
        let timestamp = self.next_timestamp();
        let ts = timestamp.to_le_bytes();

        let mut block = [0u8; SIGNATURE_LEN];
        block[0] = self.link_id;
        block[1..7].copy_from_slice(&ts[..6]);
        let digest = signature_digest(key, &frame.unsigned_bytes(), self.link_id, &ts[..6]);
        block[7..].copy_from_slice(&digest[..6]);
        Some(block)
    }

    /// Returns the frame signed for delivery.
    ///
    /// Sets the signed flag (fixing up the checksum) and appends a fresh
    /// block, replacing any existing one. v1 frames and a disabled signer
    /// return the frame unchanged.
    pub fn sign(&self, frame: &Frame) -> Frame {
        if !self.is_enabled() || frame.version() == ProtocolVersion::V1 {
            return frame.clone();
        }
        let flagged = frame.with_incompat_flags(frame.incompat_flags() | IFLAG_SIGNED);
        match self.generate(&flagged) {
            Some(block) => flagged.with_signature(&block),
            None => frame.clone(),
        }
    }

    /// Checks a frame's signature against the shared key.
    ///
    /// Always true when signing is disabled; false for frames that carry no
    /// signature.
    pub fn validate(&self, frame: &Frame) -> bool {
        self.verify(frame).is_ok()
    }

    /// Like [`Signer::validate`], reporting a failure as
    /// [`BridgeError::SignatureMismatch`].
    pub fn verify(&self, frame: &Frame) -> Result<()> {
        let key = match &self.key {
            Some(key) => key,
            None => return Ok(()),
        };
        let mismatch = || BridgeError::SignatureMismatch {
            system_id: frame.system_id(),
        };
        let block = frame.signature().ok_or_else(mismatch)?;
        let link_id = block[0];
        let digest = signature_digest(key, &frame.unsigned_bytes(), link_id, &block[1..7]);
        if !constant_time_eq(&digest[..6], &block[7..]) {
            debug!(
                system_id = frame.system_id(),
                component_id = frame.component_id(),
                message_id = frame.message_id(),
                link_id,
                "signature mismatch"
            );
            return Err(mismatch());
        }
        Ok(())
    }
}

fn signature_digest(key: &SigningKey, unsigned: &[u8], link_id: u8, timestamp: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(unsigned);
    hasher.update([link_id]);
    hasher.update(timestamp);
    hasher.finalize().into()
}

fn wall_clock_ticks() -> u64 {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    micros.saturating_sub(SIGNING_EPOCH_SECS * 1_000_000) / 10
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
