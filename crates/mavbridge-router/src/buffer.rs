//! Stream accumulation for byte-oriented transports.
//!
//! Every read path pushes raw chunks into a [`FrameBuffer`] and gets back the
//! complete frames they finish. Bytes that cannot start a frame are skipped
//! one at a time; a partial frame at the tail is retained for the next chunk.

use tracing::warn;

use crate::error::BridgeError;
use crate::protocol::{parse_frame, Frame, ParseOutcome};

/// Nominal size of one medium read.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Hard cap on retained bytes (4x the nominal read chunk).
pub const MAX_RETAINED: usize = 4 * READ_CHUNK_SIZE;

/// Incremental frame extractor.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    limit: usize,
    skipped_bytes: u64,
    discarded_bytes: u64,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    /// Creates a buffer with the default retention cap.
    pub fn new() -> Self {
        Self::with_limit(MAX_RETAINED)
    }

    /// Creates a buffer that discards its contents past `limit` retained bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(READ_CHUNK_SIZE),
            limit,
            skipped_bytes: 0,
            discarded_bytes: 0,
        }
    }

    /// Appends a chunk and returns every frame it completes, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut offset = 0;
        while offset < self.buf.len() {
            match parse_frame(&self.buf, offset) {
                ParseOutcome::Complete(frame, consumed) => {
                    frames.push(frame);
                    offset += consumed;
                }
                ParseOutcome::Skip => {
                    self.skipped_bytes += 1;
                    offset += 1;
                }
                ParseOutcome::Incomplete => break,
            }
        }
        self.buf.drain(..offset);

        if self.buf.len() > self.limit {
            let desync = BridgeError::ProtocolDesync {
                discarded: self.buf.len(),
            };
            warn!(limit = self.limit, error = %desync, "receive buffer over limit");
            self.discarded_bytes += self.buf.len() as u64;
            self.buf.clear();
        }

        frames
    }

    /// Bytes currently held back waiting for more data.
    pub fn retained(&self) -> usize {
        self.buf.len()
    }

    /// Bytes skipped during resynchronization.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped_bytes
    }

    /// Bytes thrown away because the retention cap was hit.
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded_bytes
    }

    /// Drops any retained bytes, e.g. when a new session starts.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MAGIC_V2, V2_HEADER_LEN};

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::build_v2(0, 1, 1, 0, &[0, 0, 0, 0, 2, 3, 81, 4, 3], 50).unwrap(),
            Frame::build_v1(1, 1, 1, 30, &[1; 28], 39).unwrap(),
            Frame::build_v2(2, 1, 1, 24, &[7; 30], 24).unwrap(),
        ]
    }

    fn concat(frames: &[Frame]) -> Vec<u8> {
        frames.iter().flat_map(|f| f.raw().to_vec()).collect()
    }

    #[test]
    fn test_whole_stream() {
        let frames = sample_frames();
        let mut buffer = FrameBuffer::new();
        let out = buffer.push(&concat(&frames));
        assert_eq!(out, frames);
        assert_eq!(buffer.retained(), 0);
    }

    #[test]
    fn test_byte_at_a_time() {
        let frames = sample_frames();
        let mut buffer = FrameBuffer::new();
        let mut out = Vec::new();
        for byte in concat(&frames) {
            out.extend(buffer.push(&[byte]));
        }
        assert_eq!(out, frames);
        assert_eq!(buffer.skipped_bytes(), 0);
    }

    #[test]
    fn test_resync_skips_leading_garbage() {
        let frame = Frame::build_v2(5, 1, 1, 0, &[1, 2, 3], 50).unwrap();
        let mut stream = vec![0x00, 0x00];
        stream.extend_from_slice(frame.raw());

        let mut buffer = FrameBuffer::new();
        let out = buffer.push(&stream);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], frame);
        assert_eq!(buffer.skipped_bytes(), 2);
        assert_eq!(buffer.retained(), 0);
    }

    #[test]
    fn test_partial_tail_retained() {
        let frame = Frame::build_v2(5, 1, 1, 0, &[1, 2, 3], 50).unwrap();
        let raw = frame.raw();
        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(&raw[..4]).is_empty());
        assert_eq!(buffer.retained(), 4);
        let out = buffer.push(&raw[4..]);
        assert_eq!(out, vec![frame]);
    }

    #[test]
    fn test_no_magic_never_grows() {
        let mut buffer = FrameBuffer::new();
        let garbage = vec![0x42u8; READ_CHUNK_SIZE];
        for _ in 0..64 {
            assert!(buffer.push(&garbage).is_empty());
            assert!(buffer.retained() <= MAX_RETAINED);
        }
        assert_eq!(buffer.retained(), 0);
    }

    #[test]
    fn test_over_limit_discards() {
        let mut buffer = FrameBuffer::with_limit(16);
        // A v2 header announcing a 200-byte payload keeps the tail incomplete.
        let mut partial = vec![MAGIC_V2, 200, 0, 0, 0, 1, 1, 0, 0, 0];
        partial.extend_from_slice(&[0u8; 20]);
        assert!(partial.len() > V2_HEADER_LEN);
        assert!(buffer.push(&partial).is_empty());
        assert_eq!(buffer.retained(), 0);
        assert_eq!(buffer.discarded_bytes(), partial.len() as u64);

        let frame = Frame::build_v2(1, 1, 1, 0, &[1], 50).unwrap();
        assert_eq!(buffer.push(frame.raw()), vec![frame]);
    }
}
