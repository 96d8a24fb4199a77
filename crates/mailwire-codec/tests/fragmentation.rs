//! Fragmentation tests for the frame decoders.
//!
//! Feeding the same byte stream in arbitrary chunks must produce exactly the
//! frames that a single delivery produces.

#![allow(clippy::unwrap_used)]

use bytes::{BufMut, BytesMut};
use mailwire_codec::{Frame, LineDecoder, Packet, PacketCodec};
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

/// Feeds `input` split at the given cut points and collects every frame.
fn decode_in_chunks<D>(decoder: &mut D, input: &[u8], cuts: &[usize]) -> Vec<D::Item>
where
    D: Decoder,
    D::Error: std::fmt::Debug,
{
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (input.len() + 1)).collect();
    points.sort_unstable();
    points.push(input.len());

    let mut buf = BytesMut::new();
    let mut frames = Vec::new();
    let mut start = 0;
    for end in points {
        buf.extend_from_slice(&input[start..end]);
        start = end;
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
    }
    frames
}

fn line_strategy() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[ -z\r]{0,40}").unwrap()
}

proptest! {
    #[test]
    fn lines_survive_arbitrary_fragmentation(
        lines in proptest::collection::vec(line_strategy(), 0..12),
        trailing in "[a-z]{0,10}",
        cuts in proptest::collection::vec(any::<usize>(), 0..8),
    ) {
        let mut input = Vec::new();
        for line in &lines {
            input.extend_from_slice(line.as_bytes());
            input.extend_from_slice(b"\r\n");
        }
        // An unterminated tail must stay buffered.
        input.extend_from_slice(trailing.as_bytes());

        let whole = decode_in_chunks(&mut LineDecoder::default(), &input, &[]);
        let split = decode_in_chunks(&mut LineDecoder::default(), &input, &cuts);
        prop_assert_eq!(&whole, &split);
        prop_assert!(whole.iter().all(|f| matches!(f, Frame::Line(_))));
    }

    #[test]
    fn literal_round_trips_at_any_boundary(
        payload in proptest::collection::vec(any::<u8>(), 0..64),
        cut in any::<usize>(),
        non_sync in any::<bool>(),
    ) {
        let marker = if non_sync { "+" } else { "" };
        let mut input = format!("A1 APPEND INBOX {{{}{marker}}}\r\n", payload.len()).into_bytes();
        let literal_start = input.len();
        input.extend_from_slice(&payload);
        input.extend_from_slice(b"\r\nA2 NOOP\r\n");

        // Include boundaries exactly at the literal start and end.
        for point in [cut, literal_start, literal_start + payload.len()] {
            let frames = decode_in_chunks(&mut LineDecoder::default(), &input, &[point]);
            prop_assert_eq!(frames.len(), 4);
            prop_assert_eq!(&frames[1], &Frame::Literal(payload.clone().into()));
            prop_assert_eq!(&frames[3], &Frame::Line("A2 NOOP".to_string()));
        }
    }

    #[test]
    fn packets_dispatch_once_after_last_byte(
        payload in proptest::collection::vec(any::<u8>(), 0..128),
        cuts in proptest::collection::vec(any::<usize>(), 0..16),
    ) {
        let mut codec = PacketCodec::default();
        let mut wire = BytesMut::new();
        codec.encode(Packet::new(b'D', payload.clone()), &mut wire).unwrap();

        let frames = decode_in_chunks(&mut codec, &wire, &cuts);
        prop_assert_eq!(frames, vec![Packet::new(b'D', payload)]);
    }
}

#[test]
fn packet_is_withheld_until_final_byte() {
    let mut codec = PacketCodec::default();
    let mut wire = BytesMut::new();
    wire.put_u32(4);
    wire.put_u8(b'R');
    wire.put_slice(b"<a>");

    let mut buf = BytesMut::new();
    for (i, byte) in wire.iter().enumerate() {
        buf.put_u8(*byte);
        let decoded = codec.decode(&mut buf).unwrap();
        if i + 1 < wire.len() {
            assert!(decoded.is_none(), "dispatched early at byte {i}");
        } else {
            assert_eq!(decoded, Some(Packet::new(b'R', &b"<a>"[..])));
        }
    }
}

#[test]
fn oversized_literal_does_not_corrupt_following_line() {
    let mut decoder = LineDecoder::new(1024, 16);
    let mut buf = BytesMut::from(&b"A7 APPEND Drafts {1048576}\r\n"[..]);
    let err = decoder.decode(&mut buf).unwrap_err();
    assert!(err.to_string().contains("A7 APPEND Drafts {1048576}"));

    buf.extend_from_slice(b"A8 NOOP\r\n");
    assert_eq!(
        decoder.decode(&mut buf).unwrap(),
        Some(Frame::Line("A8 NOOP".to_string()))
    );
}
