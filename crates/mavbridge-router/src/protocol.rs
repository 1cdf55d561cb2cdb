//! MAVLink v1/v2 frame codec.
//!
//! Frames are carried as their raw wire bytes. Only the header fields needed
//! for routing and signing are decoded; payloads stay opaque.
//!
//! ```text
//! v1: FE len seq sys comp msg            payload crc_lo crc_hi
//! v2: FD len incompat compat seq sys comp msg0 msg1 msg2 payload crc_lo crc_hi [signature:13]
//! ```

use std::time::Instant;

use bytes::Bytes;
use crc::{Crc, CRC_16_MCRF4XX};

use crate::error::{BridgeError, Result};

/// Start-of-frame marker for MAVLink v1.
pub const MAGIC_V1: u8 = 0xFE;

/// Start-of-frame marker for MAVLink v2.
pub const MAGIC_V2: u8 = 0xFD;

/// v1 header length (magic, len, seq, sys, comp, msgid).
pub const V1_HEADER_LEN: usize = 6;

/// v2 header length (magic, len, incompat, compat, seq, sys, comp, msgid:3).
pub const V2_HEADER_LEN: usize = 10;

/// Trailing checksum length.
pub const CHECKSUM_LEN: usize = 2;

/// v2 signature block length (link id:1, timestamp:6, signature:6).
pub const SIGNATURE_LEN: usize = 13;

/// Incompatibility flag marking a signed v2 frame.
pub const IFLAG_SIGNED: u8 = 0x01;

/// Largest payload a frame can carry.
pub const MAX_PAYLOAD_LEN: usize = 255;

/// Largest possible frame on the wire (signed v2 with a full payload).
pub const MAX_FRAME_LEN: usize = V2_HEADER_LEN + MAX_PAYLOAD_LEN + CHECKSUM_LEN + SIGNATURE_LEN;

/// The MAVLink X.25 checksum.
pub const MAVLINK_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MCRF4XX);

/// Wire protocol version of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// MAVLink 1.0
    V1,
    /// MAVLink 2.0
    V2,
}

impl ProtocolVersion {
    /// Header length for this version.
    pub fn header_len(self) -> usize {
        match self {
            ProtocolVersion::V1 => V1_HEADER_LEN,
            ProtocolVersion::V2 => V2_HEADER_LEN,
        }
    }
}

/// One complete MAVLink frame.
///
/// The raw bytes are reference counted, so cloning a frame for each
/// destination of a route does not copy the payload. Equality compares wire
/// bytes only.
#[derive(Debug, Clone)]
pub struct Frame {
    raw: Bytes,
    version: ProtocolVersion,
    sequence: u8,
    system_id: u8,
    component_id: u8,
    message_id: u32,
    received_at: Instant,
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Frame {}

/// Result of attempting to parse a frame at a buffer offset.
#[derive(Debug)]
pub enum ParseOutcome {
    /// A complete frame and the number of bytes it occupies.
    Complete(Frame, usize),
    /// A frame starts here but not all of its bytes have arrived yet.
    Incomplete,
    /// The byte at the offset is not a start-of-frame marker.
    Skip,
}

/// Parses the frame starting at `offset`.
///
/// Checksums are not verified. A complete frame is returned as soon as the
/// header-declared length is available.
pub fn parse_frame(buf: &[u8], offset: usize) -> ParseOutcome {
    let data = match buf.get(offset..) {
        Some(data) if !data.is_empty() => data,
        _ => return ParseOutcome::Incomplete,
    };

    match data[0] {
        MAGIC_V1 => {
            if data.len() < 2 {
                return ParseOutcome::Incomplete;
            }
            let total = V1_HEADER_LEN + data[1] as usize + CHECKSUM_LEN;
            if data.len() < total {
                return ParseOutcome::Incomplete;
            }
            let frame = Frame {
                raw: Bytes::copy_from_slice(&data[..total]),
                version: ProtocolVersion::V1,
                sequence: data[2],
                system_id: data[3],
                component_id: data[4],
                message_id: data[5] as u32,
                received_at: Instant::now(),
            };
            ParseOutcome::Complete(frame, total)
        }
        MAGIC_V2 => {
            if data.len() < 3 {
                return ParseOutcome::Incomplete;
            }
            let signed = data[2] & IFLAG_SIGNED != 0;
            let total = V2_HEADER_LEN
                + data[1] as usize
                + CHECKSUM_LEN
                + if signed { SIGNATURE_LEN } else { 0 };
            if data.len() < total {
                return ParseOutcome::Incomplete;
            }
            let frame = Frame {
                raw: Bytes::copy_from_slice(&data[..total]),
                version: ProtocolVersion::V2,
                sequence: data[4],
                system_id: data[5],
                component_id: data[6],
                message_id: u32::from_le_bytes([data[7], data[8], data[9], 0]),
                received_at: Instant::now(),
            };
            ParseOutcome::Complete(frame, total)
        }
        _ => ParseOutcome::Skip,
    }
}

/// Checksum of a frame body (the bytes after the magic, up to the end of
/// the payload) finished with the message's CRC_EXTRA byte.
pub fn frame_checksum(body: &[u8], crc_extra: u8) -> u16 {
    let mut digest = MAVLINK_CRC.digest();
    digest.update(body);
    digest.update(&[crc_extra]);
    digest.finalize()
}

impl Frame {
    /// Parses a buffer holding exactly one frame.
    pub fn from_bytes(bytes: &[u8]) -> Option<Frame> {
        match parse_frame(bytes, 0) {
            ParseOutcome::Complete(frame, consumed) if consumed == bytes.len() => Some(frame),
            _ => None,
        }
    }

    /// Builds a v1 frame, computing its checksum with `crc_extra`.
    pub fn build_v1(
        sequence: u8,
        system_id: u8,
        component_id: u8,
        message_id: u8,
        payload: &[u8],
        crc_extra: u8,
    ) -> Result<Frame> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(BridgeError::PayloadTooLarge {
                size: payload.len(),
                max_size: MAX_PAYLOAD_LEN,
            });
        }
        let mut raw = Vec::with_capacity(V1_HEADER_LEN + payload.len() + CHECKSUM_LEN);
        raw.extend_from_slice(&[
            MAGIC_V1,
            payload.len() as u8,
            sequence,
            system_id,
            component_id,
            message_id,
        ]);
        raw.extend_from_slice(payload);
        let crc = frame_checksum(&raw[1..], crc_extra);
        raw.extend_from_slice(&crc.to_le_bytes());
        Ok(Frame {
            raw: Bytes::from(raw),
            version: ProtocolVersion::V1,
            sequence,
            system_id,
            component_id,
            message_id: message_id as u32,
            received_at: Instant::now(),
        })
    }

    /// Builds an unsigned v2 frame, computing its checksum with `crc_extra`.
    ///
    /// Trailing zero bytes of the payload are truncated as MAVLink 2 senders
    /// do; at least one payload byte is kept.
    pub fn build_v2(
        sequence: u8,
        system_id: u8,
        component_id: u8,
        message_id: u32,
        payload: &[u8],
        crc_extra: u8,
    ) -> Result<Frame> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(BridgeError::PayloadTooLarge {
                size: payload.len(),
                max_size: MAX_PAYLOAD_LEN,
            });
        }
        let keep = payload
            .iter()
            .rposition(|&b| b != 0)
            .map(|last| last + 1)
            .unwrap_or(0)
            .max(1.min(payload.len()));
        let payload = &payload[..keep];
        let id = (message_id & 0x00FF_FFFF).to_le_bytes();

        let mut raw = Vec::with_capacity(V2_HEADER_LEN + payload.len() + CHECKSUM_LEN);
        raw.extend_from_slice(&[
            MAGIC_V2,
            payload.len() as u8,
            0,
            0,
            sequence,
            system_id,
            component_id,
            id[0],
            id[1],
            id[2],
        ]);
        raw.extend_from_slice(payload);
        let crc = frame_checksum(&raw[1..], crc_extra);
        raw.extend_from_slice(&crc.to_le_bytes());
        Ok(Frame {
            raw: Bytes::from(raw),
            version: ProtocolVersion::V2,
            sequence,
            system_id,
            component_id,
            message_id: message_id & 0x00FF_FFFF,
            received_at: Instant::now(),
        })
    }

    /// Raw wire bytes.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Length on the wire.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Always false; a frame carries at least its header and checksum.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Protocol version.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Sequence number.
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Sending system id.
    pub fn system_id(&self) -> u8 {
        self.system_id
    }

    /// Sending component id.
    pub fn component_id(&self) -> u8 {
        self.component_id
    }

    /// Message id (8 bits for v1, 24 bits for v2).
    pub fn message_id(&self) -> u32 {
        self.message_id
    }

    /// Local receipt time; monotonic.
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Declared payload length.
    pub fn payload_len(&self) -> usize {
        self.raw[1] as usize
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        let start = self.version.header_len();
        &self.raw[start..start + self.payload_len()]
    }

    /// Checksum as stored on the wire.
    pub fn checksum(&self) -> u16 {
        let at = self.version.header_len() + self.payload_len();
        u16::from_le_bytes([self.raw[at], self.raw[at + 1]])
    }

    /// Incompatibility flags (always 0 for v1).
    pub fn incompat_flags(&self) -> u8 {
        match self.version {
            ProtocolVersion::V1 => 0,
            ProtocolVersion::V2 => self.raw[2],
        }
    }

    /// Compatibility flags (always 0 for v1).
    pub fn compat_flags(&self) -> u8 {
        match self.version {
            ProtocolVersion::V1 => 0,
            ProtocolVersion::V2 => self.raw[3],
        }
    }

    /// Whether a signature block trails the checksum.
    pub fn is_signed(&self) -> bool {
        self.version == ProtocolVersion::V2 && self.incompat_flags() & IFLAG_SIGNED != 0
    }

    /// The 13-byte signature block, when present.
    pub fn signature(&self) -> Option<&[u8]> {
        if self.is_signed() {
            Some(&self.raw[self.raw.len() - SIGNATURE_LEN..])
        } else {
            None
        }
    }

    /// Wire bytes without any trailing signature block.
    pub fn unsigned_bytes(&self) -> Bytes {
        if self.is_signed() {
            self.raw.slice(..self.raw.len() - SIGNATURE_LEN)
        } else {
            self.raw.clone()
        }
    }

    /// Verifies the stored checksum given the message's CRC_EXTRA byte.
    pub fn validate_checksum(&self, crc_extra: u8) -> bool {
        let end = self.version.header_len() + self.payload_len();
        frame_checksum(&self.raw[1..end], crc_extra) == self.checksum()
    }

    /// Returns a copy with new incompatibility flags and no signature block.
    ///
    /// The checksum is corrected for the changed header byte without knowing
    /// the message's CRC_EXTRA: the X.25 checksum is affine over GF(2), so
    /// `crc(m ^ d) = crc(m) ^ crc(d) ^ crc(0..0)` for inputs of equal length.
    /// v1 frames are returned unchanged.
    pub fn with_incompat_flags(&self, flags: u8) -> Frame {
        if self.version == ProtocolVersion::V1 {
            return self.clone();
        }
        let body_end = V2_HEADER_LEN + self.payload_len();
        let old = self.raw[2];
        let mut raw = Vec::with_capacity(body_end + CHECKSUM_LEN + SIGNATURE_LEN);
        raw.extend_from_slice(&self.raw[..body_end]);
        raw[2] = flags;

        // Checksummed span: bytes 1..body_end plus the CRC_EXTRA byte.
        let mut diff = vec![0u8; body_end];
        diff[1] = old ^ flags;
        let zeros = MAVLINK_CRC.checksum(&vec![0u8; body_end]);
        let crc = self.checksum() ^ MAVLINK_CRC.checksum(&diff) ^ zeros;
        raw.extend_from_slice(&crc.to_le_bytes());

        Frame {
            raw: Bytes::from(raw),
            version: self.version,
            sequence: self.sequence,
            system_id: self.system_id,
            component_id: self.component_id,
            message_id: self.message_id,
            received_at: self.received_at,
        }
    }

    /// Returns a copy with `block` appended as the signature.
    ///
    /// The caller is responsible for the signed flag being set.
    pub(crate) fn with_signature(&self, block: &[u8; SIGNATURE_LEN]) -> Frame {
        let mut raw = Vec::with_capacity(self.raw.len() + SIGNATURE_LEN);
        raw.extend_from_slice(&self.unsigned_bytes());
        raw.extend_from_slice(block);
        Frame {
            raw: Bytes::from(raw),
            version: self.version,
            sequence: self.sequence,
            system_id: self.system_id,
            component_id: self.component_id,
            message_id: self.message_id,
            received_at: self.received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // HEARTBEAT (id 0) carries CRC_EXTRA 50.
    const HEARTBEAT_CRC_EXTRA: u8 = 50;

    fn heartbeat_payload() -> [u8; 9] {
        [0, 0, 0, 0, 2, 3, 81, 4, 3]
    }

    #[test]
    fn test_crc_known_vector() {
        // CRC-16/MCRF4XX check value for "123456789".
        assert_eq!(MAVLINK_CRC.checksum(b"123456789"), 0x6F91);
    }

    #[test]
    fn test_frame_checksum_includes_crc_extra() {
        let body = [9u8, 0, 0, 0, 1, 1, 0, 0, 0];
        assert_ne!(frame_checksum(&body, 50), frame_checksum(&body, 51));
        let mut digest = MAVLINK_CRC.digest();
        digest.update(&body);
        digest.update(&[50]);
        assert_eq!(frame_checksum(&body, 50), digest.finalize());
    }

    #[test]
    fn test_parse_v1_frame() {
        let frame = Frame::build_v1(7, 1, 1, 0, &heartbeat_payload(), HEARTBEAT_CRC_EXTRA).unwrap();
        assert_eq!(frame.len(), 8 + 9);

        match parse_frame(frame.raw(), 0) {
            ParseOutcome::Complete(parsed, consumed) => {
                assert_eq!(consumed, 17);
                assert_eq!(parsed.version(), ProtocolVersion::V1);
                assert_eq!(parsed.sequence(), 7);
                assert_eq!(parsed.system_id(), 1);
                assert_eq!(parsed.component_id(), 1);
                assert_eq!(parsed.message_id(), 0);
                assert_eq!(parsed.payload(), &heartbeat_payload());
                assert!(parsed.validate_checksum(HEARTBEAT_CRC_EXTRA));
                assert_eq!(parsed.raw(), frame.raw());
            }
            other => panic!("expected complete frame, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_v2_frame() {
        let frame =
            Frame::build_v2(42, 255, 190, 0x01_02_03, &[9, 8, 7, 6], 77).unwrap();
        assert_eq!(frame.len(), 12 + 4);

        match parse_frame(frame.raw(), 0) {
            ParseOutcome::Complete(parsed, consumed) => {
                assert_eq!(consumed, 16);
                assert_eq!(parsed.version(), ProtocolVersion::V2);
                assert_eq!(parsed.sequence(), 42);
                assert_eq!(parsed.system_id(), 255);
                assert_eq!(parsed.component_id(), 190);
                assert_eq!(parsed.message_id(), 0x01_02_03);
                assert!(!parsed.is_signed());
                assert!(parsed.signature().is_none());
                assert!(parsed.validate_checksum(77));
                assert!(!parsed.validate_checksum(78));
            }
            other => panic!("expected complete frame, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_signed_v2_length() {
        let mut bytes = Frame::build_v2(1, 1, 1, 30, &[1, 2, 3], 39)
            .unwrap()
            .with_incompat_flags(IFLAG_SIGNED)
            .raw()
            .to_vec();
        bytes.extend_from_slice(&[0xAA; SIGNATURE_LEN]);

        match parse_frame(&bytes, 0) {
            ParseOutcome::Complete(parsed, consumed) => {
                assert_eq!(consumed, 12 + 3 + 13);
                assert!(parsed.is_signed());
                assert_eq!(parsed.signature().unwrap(), &[0xAA; SIGNATURE_LEN]);
                assert_eq!(parsed.unsigned_bytes().len(), 15);
            }
            other => panic!("expected complete frame, got {:?}", other),
        }
    }

    #[test]
    fn test_incomplete_frames() {
        let frame = Frame::build_v2(1, 1, 1, 0, &heartbeat_payload(), HEARTBEAT_CRC_EXTRA).unwrap();
        let raw = frame.raw();
        for cut in 1..raw.len() {
            assert!(
                matches!(parse_frame(&raw[..cut], 0), ParseOutcome::Incomplete),
                "cut at {} should be incomplete",
                cut
            );
        }
        assert!(matches!(parse_frame(&[], 0), ParseOutcome::Incomplete));
        assert!(matches!(parse_frame(raw, raw.len()), ParseOutcome::Incomplete));
    }

    #[test]
    fn test_skip_non_magic() {
        assert!(matches!(parse_frame(&[0x00, 0xFD], 0), ParseOutcome::Skip));
        assert!(matches!(parse_frame(&[0x55], 0), ParseOutcome::Skip));
    }

    #[test]
    fn test_parse_at_offset() {
        let frame = Frame::build_v1(3, 1, 1, 0, &heartbeat_payload(), HEARTBEAT_CRC_EXTRA).unwrap();
        let mut buf = vec![0x11, 0x22];
        buf.extend_from_slice(frame.raw());
        match parse_frame(&buf, 2) {
            ParseOutcome::Complete(parsed, consumed) => {
                assert_eq!(consumed, frame.len());
                assert_eq!(parsed, frame);
            }
            other => panic!("expected complete frame, got {:?}", other),
        }
    }

    #[test]
    fn test_build_v2_truncates_trailing_zeros() {
        let frame = Frame::build_v2(0, 1, 1, 0, &[5, 0, 3, 0, 0, 0], 50).unwrap();
        assert_eq!(frame.payload(), &[5, 0, 3]);

        let all_zero = Frame::build_v2(0, 1, 1, 0, &[0, 0, 0], 50).unwrap();
        assert_eq!(all_zero.payload(), &[0]);
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![1u8; 256];
        assert!(matches!(
            Frame::build_v2(0, 1, 1, 0, &payload, 0),
            Err(BridgeError::PayloadTooLarge { size: 256, .. })
        ));
        assert!(Frame::build_v1(0, 1, 1, 0, &payload, 0).is_err());
    }

    #[test]
    fn test_flag_patch_keeps_checksum_valid() {
        let frame = Frame::build_v2(9, 1, 1, 33, &[1, 2, 3, 4, 5, 6, 7, 8], 104).unwrap();
        let flagged = frame.with_incompat_flags(IFLAG_SIGNED);
        assert_eq!(flagged.incompat_flags(), IFLAG_SIGNED);
        assert!(flagged.validate_checksum(104));
        assert_ne!(flagged.checksum(), frame.checksum());

        let cleared = flagged.with_incompat_flags(0);
        assert_eq!(cleared.checksum(), frame.checksum());
        assert_eq!(cleared.raw(), frame.raw());
    }

    #[test]
    fn test_from_bytes_rejects_trailing_data() {
        let frame = Frame::build_v1(0, 1, 1, 0, &heartbeat_payload(), 50).unwrap();
        let mut bytes = frame.raw().to_vec();
        assert!(Frame::from_bytes(&bytes).is_some());
        bytes.push(0);
        assert!(Frame::from_bytes(&bytes).is_none());
    }
}
