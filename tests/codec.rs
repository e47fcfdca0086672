#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Wire codec tests: layout, conditional fields, malformed input.

use bytes::BytesMut;
use icp_protocol::core::message::{HEADER_LEN, ZERO_ADDRESS};
use icp_protocol::{
    compute_length, Codec, FrameError, IcpError, LazyCodec, Message, Opcode, WireCodec,
    FLAG_HIT_OBJ, FLAG_SRC_RTT, ICP_VERSION,
};
use std::net::{Ipv4Addr, SocketAddr};

// ============================================================================
// LAYOUT
// ============================================================================

#[test]
fn test_query_layout_byte_for_byte() {
    let query = Message::new(Opcode::Query, 0x0102_0304, "http://x/")
        .with_options(FLAG_SRC_RTT, 0)
        .with_sender(Ipv4Addr::new(192, 168, 1, 2))
        .with_requester(Ipv4Addr::new(10, 0, 0, 9));
    let bytes = WireCodec::new().encode(&query).unwrap();

    let mut expected = vec![1u8, ICP_VERSION, 0, 34];
    expected.extend_from_slice(&[1, 2, 3, 4]);
    expected.extend_from_slice(&[0x40, 0, 0, 0]);
    expected.extend_from_slice(&[0, 0, 0, 0]);
    expected.extend_from_slice(&[192, 168, 1, 2]);
    expected.extend_from_slice(&[10, 0, 0, 9]);
    expected.extend_from_slice(b"http://x/\0");
    assert_eq!(&bytes[..], &expected[..]);
}

#[test]
fn test_hit_obj_layout() {
    let msg = Message::new(Opcode::HitObj, 5, "u")
        .with_options(FLAG_HIT_OBJ, 0)
        .with_payload_object(vec![0xAA, 0xBB, 0xCC]);
    let bytes = WireCodec::new().encode(&msg).unwrap();
    assert_eq!(bytes.len(), HEADER_LEN + 2 + 2 + 3);
    assert_eq!(&bytes[HEADER_LEN..HEADER_LEN + 2], b"u\0");
    assert_eq!(&bytes[HEADER_LEN + 2..HEADER_LEN + 4], &[0, 3]);
    assert_eq!(&bytes[HEADER_LEN + 4..], &[0xAA, 0xBB, 0xCC]);
}

#[test]
fn test_compute_length_rules() {
    let url = "http://example.com/path";
    assert_eq!(compute_length(&Message::new(Opcode::Hit, 1, url)), 21 + url.len());
    assert_eq!(
        compute_length(&Message::new(Opcode::Query, 1, url)),
        21 + url.len() + 4
    );
    assert_eq!(
        compute_length(&Message::new(Opcode::HitObj, 1, url).with_payload_object(vec![1u8; 10])),
        21 + url.len() + 2 + 10
    );
}

// ============================================================================
// ROUND TRIPS
// ============================================================================

#[test]
fn test_roundtrip_every_opcode() {
    let codec = WireCodec::new();
    for op in Opcode::ALL {
        let msg = Message::new(op, 77, "http://www.example.org/a?b=c")
            .with_options(FLAG_SRC_RTT, 0x1234)
            .with_sender(Ipv4Addr::new(1, 1, 1, 1))
            .with_requester(Ipv4Addr::new(2, 2, 2, 2))
            .with_payload_object(vec![7u8; 12]);
        let decoded = codec.decode(&codec.encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg, "roundtrip of {op}");
    }
}

#[test]
fn test_decode_from_records_transport_origin() {
    let from: SocketAddr = "192.0.2.7:40000".parse().unwrap();
    let codec = WireCodec::new();
    let bytes = codec.encode(&Message::new(Opcode::Miss, 3, "u")).unwrap();
    let msg = codec.decode_from(&bytes, from).unwrap();
    assert_eq!(msg.source(), Some(from));
    assert_eq!(msg.source_port(), Some(40000));
    assert_eq!(msg.sender(), ZERO_ADDRESS);
}

#[test]
fn test_declared_length_is_preserved() {
    let codec = WireCodec::new();
    let mut bytes = codec
        .encode(&Message::new(Opcode::Hit, 3, "http://x/"))
        .unwrap()
        .to_vec();
    bytes[2..4].copy_from_slice(&500u16.to_be_bytes());
    assert_eq!(codec.decode(&bytes).unwrap().length(), 500);
}

// ============================================================================
// MALFORMED INPUT
// ============================================================================

#[test]
fn test_invalid_opcodes_rejected() {
    let codec = WireCodec::new();
    let valid = codec.encode(&Message::new(Opcode::Hit, 1, "u")).unwrap();
    for byte in 0..=u8::MAX {
        if Opcode::try_from(byte).is_ok() {
            continue;
        }
        let mut bytes = valid.to_vec();
        bytes[0] = byte;
        match codec.decode(&bytes) {
            Err(IcpError::Malformed(FrameError::InvalidOpcode(b))) => assert_eq!(b, byte),
            other => panic!("opcode {byte} gave {other:?}"),
        }
    }
}

#[test]
fn test_every_truncation_of_a_query_is_malformed() {
    let codec = WireCodec::new();
    let bytes = codec
        .encode(&Message::new(Opcode::Query, 1, "http://x/"))
        .unwrap();
    for len in 0..bytes.len() {
        assert!(
            matches!(codec.decode(&bytes[..len]), Err(IcpError::Malformed(_))),
            "prefix of {len} bytes decoded"
        );
    }
}

#[test]
fn test_truncated_hit_obj_payload() {
    let codec = WireCodec::new();
    let bytes = codec
        .encode(&Message::new(Opcode::HitObj, 1, "u").with_payload_object(vec![1u8; 8]))
        .unwrap();
    let err = codec.decode(&bytes[..bytes.len() - 1]).unwrap_err();
    assert!(matches!(
        err,
        IcpError::Malformed(FrameError::Truncated {
            field: "payload object"
        })
    ));
}

#[test]
fn test_non_ascii_url_rejected() {
    let codec = WireCodec::new();
    let mut bytes = codec.encode(&Message::new(Opcode::Hit, 1, "abc")).unwrap().to_vec();
    bytes[HEADER_LEN + 1] = 0xE9;
    assert!(matches!(
        codec.decode(&bytes),
        Err(IcpError::Malformed(FrameError::NonAsciiUrl))
    ));
}

#[test]
fn test_message_longer_than_length_field_rejected() {
    let codec = WireCodec::new();
    let long_url = Message::new(Opcode::Hit, 1, "a".repeat(70_000));
    assert!(matches!(
        codec.encode(&long_url),
        Err(IcpError::PayloadTooLarge(len)) if len == compute_length(&long_url)
    ));

    // Payload fits its own u16 length, but header and URL push the total over.
    let full_object = Message::new(Opcode::HitObj, 1, "http://x/")
        .with_payload_object(vec![0u8; u16::MAX as usize]);
    assert!(matches!(
        codec.encode(&full_object),
        Err(IcpError::PayloadTooLarge(_))
    ));

    let mut buf = BytesMut::new();
    assert!(codec.encode_into(&long_url, &mut buf).is_err());
    assert!(buf.is_empty());
}

// ============================================================================
// CODEC TRAIT
// ============================================================================

fn answer_with<C: Codec>(codec: &C, datagram: &[u8], opcode: Opcode) -> Vec<u8> {
    let decoded = codec
        .decode_datagram(BytesMut::from(datagram), None)
        .unwrap();
    let response = codec.respond(decoded, opcode).unwrap();
    codec.encode_message(&response).unwrap().to_vec()
}

#[test]
fn test_both_codecs_answer_identically() {
    let query = WireCodec::new()
        .encode(&Message::new(Opcode::Query, 12, "http://x/y").with_requester(Ipv4Addr::LOCALHOST))
        .unwrap();
    for op in [Opcode::Denied, Opcode::Err, Opcode::Hit, Opcode::MissNoFetch] {
        assert_eq!(
            answer_with(&WireCodec::new(), &query, op),
            answer_with(&LazyCodec::new(), &query, op),
            "{op}"
        );
    }
}

#[test]
fn test_lazy_codec_rejects_bad_opcode_up_front() {
    let err = LazyCodec::new()
        .decode_datagram(BytesMut::from(&[99u8, 2, 0, 0][..]), None)
        .unwrap_err();
    assert!(matches!(err, IcpError::Malformed(FrameError::InvalidOpcode(99))));
}
