//! # Codec Integration Tests
//!
//! Exercises the public API the way the network crate uses it:
//! - headers built with the builder-style setters
//! - frames assembled as header ‖ payload and decoded back
//! - corrupted frames rejected without panicking

use ptp_codec::{
    decode_frame, HeaderError, MessageHeader, MessageKind, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE,
};

fn frame(header: &MessageHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = header.encode().to_vec();
    out.extend_from_slice(payload);
    out
}

#[test]
fn test_public_api_round_trip() {
    let header = MessageHeader::new(1, 2, 77)
        .with_payload_size(3)
        .with_sequence(4);
    let bytes = frame(&header, b"abc");

    let (decoded, payload) = decode_frame(&bytes, DEFAULT_MAX_PAYLOAD_SIZE).unwrap();
    assert_eq!(decoded, header);
    assert_eq!(decoded.kind, MessageKind::Data);
    assert_eq!(decoded.frame_len(), bytes.len());
    assert_eq!(payload, b"abc");
}

#[test]
fn test_all_kinds_survive_the_wire() {
    for kind in [MessageKind::Data, MessageKind::Control, MessageKind::Ack] {
        let header = MessageHeader::new(9, 8, 7).with_kind(kind);
        let decoded = MessageHeader::decode(&header.encode(), 0).unwrap();
        assert_eq!(decoded.kind, kind);
    }
}

#[test]
fn test_empty_payload_frame() {
    let header = MessageHeader::new(0, 0, 0);
    let bytes = frame(&header, &[]);
    assert_eq!(bytes.len(), HEADER_SIZE);

    let (_, payload) = decode_frame(&bytes, 0).unwrap();
    assert!(payload.is_empty());
}

#[test]
fn test_corrupted_frames_are_rejected() {
    let header = MessageHeader::new(5, 6, 1).with_payload_size(4);
    let good = frame(&header, b"data");

    // Flip the kind byte
    let mut bad_kind = good.clone();
    bad_kind[0] = 0xFF;
    assert!(matches!(
        decode_frame(&bad_kind, DEFAULT_MAX_PAYLOAD_SIZE),
        Err(HeaderError::UnknownKind { kind: 0xFF, .. })
    ));

    // Cut the frame mid-header
    assert!(matches!(
        decode_frame(&good[..10], DEFAULT_MAX_PAYLOAD_SIZE),
        Err(HeaderError::Truncated { .. })
    ));

    // Partial payload
    assert!(matches!(
        decode_frame(&good[..good.len() - 1], DEFAULT_MAX_PAYLOAD_SIZE),
        Err(HeaderError::LengthMismatch {
            declared: 4,
            actual: 3
        })
    ));

    // Declared size above the configured limit
    assert!(matches!(
        decode_frame(&good, 3),
        Err(HeaderError::PayloadTooLarge { size: 4, limit: 3 })
    ));
}
