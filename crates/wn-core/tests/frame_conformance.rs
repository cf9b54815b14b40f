//! Frame wire-format conformance.
//!
//! Pins the exact byte layout and decoding behavior of control frames.

use proptest::prelude::*;
use wn_core::frame::{Frame, FrameLimits, FrameType, HEADER_LEN, TYPE_ERR, TYPE_PERM, TYPE_RECV};
use wn_core::Error;

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

/// A perm frame is header, then command bytes, then token bytes.
#[test]
fn test_perm_frame_layout() {
    let bytes = Frame::perm("files", b"tok".to_vec()).serialize().unwrap();

    assert_eq!(u32_at(&bytes, 0), TYPE_PERM);
    assert_eq!(u32_at(&bytes, 4), 5);
    assert_eq!(u32_at(&bytes, 8), 3);
    assert_eq!(&bytes[HEADER_LEN..HEADER_LEN + 5], b"files");
    assert_eq!(&bytes[HEADER_LEN + 5..], b"tok");
    assert_eq!(bytes.len(), HEADER_LEN + 8);
}

/// An acknowledgment carries the stream name and no payload.
#[test]
fn test_recv_frame_layout() {
    let frame = Frame::recv("echo");
    let bytes = frame.serialize().unwrap();

    assert_eq!(u32_at(&bytes, 0), TYPE_RECV);
    assert_eq!(u32_at(&bytes, 8), 0);
    assert_eq!(bytes.len(), frame.encoded_len());
    assert!(frame.is_recv_frame());
    assert!(!frame.is_perm_frame());
}

/// An error frame carries the code as command and detail as payload.
#[test]
fn test_err_frame_layout() {
    let frame = Frame::err("not_found", "no handler for echo");
    let bytes = frame.serialize().unwrap();

    assert_eq!(u32_at(&bytes, 0), TYPE_ERR);
    let (parsed, used) = Frame::parse(&bytes).unwrap();
    assert_eq!(used, bytes.len());
    assert!(parsed.is_err_frame());
    assert_eq!(parsed.command(), "not_found");
    assert_eq!(parsed.payload(), b"no handler for echo");
}

/// Each tag satisfies exactly its own predicate.
#[test]
fn test_classification_is_exclusive() {
    for frame_type in [FrameType::Init, FrameType::Perm, FrameType::Recv, FrameType::Err] {
        let bytes = Frame::new(frame_type, "x", Vec::new()).serialize().unwrap();
        let (frame, _) = Frame::parse(&bytes).unwrap();
        let flags = [
            frame.is_init_frame(),
            frame.is_perm_frame(),
            frame.is_recv_frame(),
            frame.is_err_frame(),
        ];
        assert_eq!(flags.iter().filter(|f| **f).count(), 1, "{frame_type:?}");
        assert_eq!(frame.frame_type(), frame_type);
    }
}

/// Empty command and empty payload are legal.
#[test]
fn test_empty_fields() {
    let frame = Frame::new(FrameType::Init, "", Vec::new());
    let bytes = frame.serialize().unwrap();
    assert_eq!(bytes.len(), HEADER_LEN);
    assert_eq!(Frame::parse(&bytes).unwrap().0, frame);
}

/// Every strict prefix of a frame is reported as truncated.
#[test]
fn test_every_prefix_is_insufficient() {
    let bytes = Frame::perm("stream", b"secret".to_vec()).serialize().unwrap();
    for cut in 0..bytes.len() {
        match Frame::parse(&bytes[..cut]) {
            Err(Error::InsufficientData(_)) => {}
            other => panic!("prefix of {cut} bytes: unexpected {other:?}"),
        }
    }
}

/// Truncation inside a frame surfaces as an error on async reads too.
#[tokio::test]
async fn test_read_truncated_frame() {
    let bytes = Frame::perm("stream", b"secret".to_vec()).serialize().unwrap();
    let mut reader: &[u8] = &bytes[..HEADER_LEN + 3];
    let res = Frame::read_from(&mut reader).await;
    assert!(matches!(res, Err(Error::InsufficientData(_))));
}

/// Back-to-back frames decode one at a time.
#[tokio::test]
async fn test_consecutive_frames() {
    let mut buf = Frame::perm("a", Vec::new()).serialize().unwrap();
    buf.extend(Frame::recv("a").serialize().unwrap());
    buf.extend_from_slice(b"payload");

    let mut reader: &[u8] = &buf;
    let first = Frame::read_from(&mut reader).await.unwrap().unwrap();
    let second = Frame::read_from(&mut reader).await.unwrap().unwrap();
    assert!(first.is_perm_frame());
    assert!(second.is_recv_frame());
    assert_eq!(reader, b"payload");
}

/// A forged header cannot make the decoder allocate past its limits.
#[tokio::test]
async fn test_forged_length_rejected_before_allocation() {
    let mut header = Vec::new();
    header.extend_from_slice(&TYPE_PERM.to_le_bytes());
    header.extend_from_slice(&u32::MAX.to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes());

    let mut reader: &[u8] = &header;
    let res = Frame::read_limited(&mut reader, FrameLimits::default()).await;
    assert!(matches!(res, Err(Error::InvalidFrame(_))));
}

proptest! {
    #[test]
    fn prop_parse_arbitrary_input_never_panics(
        data in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let _ = Frame::parse(&data);
    }

    #[test]
    fn prop_serialized_frames_parse_back(
        tag in 1u32..=4,
        command in "[a-z0-9_.-]{0,32}",
        payload in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let frame_type = FrameType::from_u32(tag).unwrap();
        let frame = Frame::new(frame_type, command, payload);
        let bytes = frame.serialize().unwrap();
        let (parsed, used) = Frame::parse(&bytes).unwrap();
        prop_assert_eq!(used, bytes.len());
        prop_assert_eq!(parsed, frame);
    }
}
