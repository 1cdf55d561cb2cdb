//! Property-based tests for framing, stream reassembly, signing and backoff.

#[cfg(test)]
mod tests {
    use mavbridge_router::buffer::MAX_RETAINED;
    use mavbridge_router::{
        Backoff, BackoffConfig, Frame, FrameBuffer, ProtocolVersion, Signer, SigningKey,
    };
    use proptest::prelude::*;

    fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 1..=255)
    }

    fn arb_v2_frame() -> impl Strategy<Value = Frame> {
        (any::<u8>(), any::<u8>(), any::<u8>(), 0u32..=0xFF_FFFF, arb_payload(), any::<u8>())
            .prop_map(|(seq, sys, comp, msg_id, payload, crc_extra)| {
                Frame::build_v2(seq, sys, comp, msg_id, &payload, crc_extra).unwrap()
            })
    }

    fn arb_v1_frame() -> impl Strategy<Value = Frame> {
        (any::<u8>(), any::<u8>(), any::<u8>(), any::<u8>(), arb_payload(), any::<u8>())
            .prop_map(|(seq, sys, comp, msg_id, payload, crc_extra)| {
                Frame::build_v1(seq, sys, comp, msg_id, &payload, crc_extra).unwrap()
            })
    }

    fn arb_frame() -> impl Strategy<Value = Frame> {
        prop_oneof![arb_v1_frame(), arb_v2_frame()]
    }

    fn concat(frames: &[Frame]) -> Vec<u8> {
        frames.iter().flat_map(|f| f.raw().to_vec()).collect()
    }

    proptest! {
        #[test]
        fn prop_v1_header_fields_survive(
            seq in any::<u8>(),
            sys in any::<u8>(),
            msg_id in any::<u8>(),
            payload in arb_payload(),
        ) {
            let frame = Frame::build_v1(seq, sys, 1, msg_id, &payload, 0).unwrap();
            prop_assert_eq!(frame.version(), ProtocolVersion::V1);
            prop_assert_eq!(frame.len(), 8 + payload.len());
            let parsed = Frame::from_bytes(frame.raw()).unwrap();
            prop_assert_eq!(parsed.sequence(), seq);
            prop_assert_eq!(parsed.system_id(), sys);
            prop_assert_eq!(parsed.message_id(), msg_id as u32);
            prop_assert!(parsed.validate_checksum(0));
        }

        #[test]
        fn prop_v2_length_matches_truncated_payload(frame in arb_v2_frame()) {
            prop_assert_eq!(frame.len(), 12 + frame.payload_len());
            prop_assert!(frame.payload_len() >= 1);
            prop_assert!(!frame.is_signed());
        }

        #[test]
        fn prop_chunking_does_not_change_frames(
            frames in prop::collection::vec(arb_frame(), 1..8),
            chunk in 1usize..64,
        ) {
            let stream = concat(&frames);
            let mut buffer = FrameBuffer::new();
            let mut out = Vec::new();
            for piece in stream.chunks(chunk) {
                out.extend(buffer.push(piece));
            }
            prop_assert_eq!(out, frames);
            prop_assert_eq!(buffer.retained(), 0);
        }

        #[test]
        fn prop_garbage_prefix_is_skipped(
            garbage in prop::collection::vec(any::<u8>().prop_filter("not a magic byte", |b| *b != 0xFE && *b != 0xFD), 0..100),
            frames in prop::collection::vec(arb_frame(), 1..4),
        ) {
            let mut stream = garbage.clone();
            stream.extend(concat(&frames));
            let mut buffer = FrameBuffer::new();
            let out = buffer.push(&stream);
            prop_assert_eq!(out, frames);
            prop_assert_eq!(buffer.skipped_bytes(), garbage.len() as u64);
        }

        #[test]
        fn prop_retained_bytes_are_bounded(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..1024), 0..16),
        ) {
            let mut buffer = FrameBuffer::new();
            for chunk in &chunks {
                buffer.push(chunk);
                prop_assert!(buffer.retained() <= MAX_RETAINED);
            }
        }

        #[test]
        fn prop_signed_frames_validate(frame in arb_v2_frame(), link_id in any::<u8>()) {
            let signer = Signer::new(SigningKey::from_bytes([0x42; 32]), link_id);
            let signed = signer.sign(&frame);
            prop_assert!(signed.is_signed());
            prop_assert_eq!(signed.len(), frame.len() + 13);
            prop_assert!(signer.validate(&signed));
            prop_assert_eq!(signed.signature().unwrap()[0], link_id);
            let reparsed = Frame::from_bytes(signed.raw()).unwrap();
            prop_assert_eq!(reparsed, signed);
        }

        #[test]
        fn prop_flipped_signature_byte_fails(frame in arb_v2_frame(), index in 7usize..13, bit in 0u8..8) {
            let signer = Signer::new(SigningKey::from_bytes([0x42; 32]), 0);
            let signed = signer.sign(&frame);
            let mut raw = signed.raw().to_vec();
            let at = raw.len() - 13 + index;
            raw[at] ^= 1 << bit;
            let tampered = Frame::from_bytes(&raw).unwrap();
            prop_assert!(!signer.validate(&tampered));
        }

        #[test]
        fn prop_flipped_payload_byte_fails(frame in arb_v2_frame(), pick in any::<prop::sample::Index>(), bit in 0u8..8) {
            let signer = Signer::new(SigningKey::from_bytes([0x42; 32]), 0);
            let signed = signer.sign(&frame);
            let mut raw = signed.raw().to_vec();
            let at = 10 + pick.index(signed.payload_len());
            raw[at] ^= 1 << bit;
            let tampered = Frame::from_bytes(&raw).unwrap();
            prop_assert!(!signer.validate(&tampered));
        }

        #[test]
        fn prop_other_key_fails(frame in arb_v2_frame()) {
            let signer = Signer::new(SigningKey::from_bytes([0x42; 32]), 0);
            let other = Signer::new(SigningKey::from_bytes([0x24; 32]), 0);
            prop_assert!(!other.validate(&signer.sign(&frame)));
        }

        #[test]
        fn prop_backoff_stays_within_jitter_of_cap(base in 1u64..500, factor in 1u64..20, attempts in 1usize..40) {
            let max = base * factor;
            let mut backoff = Backoff::new(BackoffConfig { base_ms: base, max_ms: max });
            for _ in 0..attempts {
                let delay = backoff.next_delay().as_millis() as f64;
                prop_assert!(delay >= base as f64);
                prop_assert!(delay <= (max as f64 * 1.1).ceil());
            }
        }
    }
}
