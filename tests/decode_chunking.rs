//! Chunk-boundary independence of the inbound decode loop.
//!
//! However a well-formed byte stream is sliced into DATA frames, the
//! engine must dispatch the same performatives and produce the same
//! reply bytes.

mod common;

use amqpgate::{
    codec::{ProtocolHeader, Role},
    transport::Message,
};
use common::{Harness, attach_frame, begin_frame, flow_frame, open_frame, reply_bytes};
use proptest::prelude::*;

/// A handshake, session, attach and flow as one contiguous byte run.
fn stimulus() -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&ProtocolHeader::AMQP_1_0.to_bytes());
    bytes.extend_from_slice(&open_frame("C1", Some(256)));
    bytes.extend_from_slice(&begin_frame(0, 100, 10));
    bytes.extend_from_slice(&attach_frame(1, "replies", 0, Role::Receiver, "queue-a"));
    bytes.extend_from_slice(&flow_frame(1, 1, 100, 0, 10, None));
    bytes
}

/// Reply bytes plus the order of every non-DATA message, with
/// per-event identifiers (trace ids) masked out.
fn run_chunked(chunks: &[&[u8]]) -> (Vec<u8>, Vec<String>, Harness) {
    let mut harness = Harness::new();
    harness.connect();
    harness.grant_reply_window(64 * 1024);

    let mut out = Vec::new();
    for chunk in chunks {
        out.extend(harness.send_bytes(chunk));
    }

    let bytes = reply_bytes(&out, harness.reply_id);
    // DATA boundaries and inbound-window echoes legitimately vary with
    // chunking; the dispatched reactions must not.
    let events = out
        .iter()
        .filter(|message| {
            !matches!(message, Message::Data(_))
                && !matches!(message, Message::Window(w) if w.stream_id == harness.initial_id)
        })
        .map(|message| format!("{}:{}", message.name(), message.stream_id()))
        .collect();
    (bytes, events, harness)
}

#[test]
fn byte_by_byte_equals_monolithic() {
    let stream = stimulus();
    let (whole_bytes, whole_events, _) = run_chunked(&[stream.as_slice()]);

    let slices: Vec<&[u8]> = stream.chunks(1).collect();
    let (byte_bytes, byte_events, harness) = run_chunked(&slices);

    assert_eq!(whole_bytes, byte_bytes);
    assert_eq!(whole_events, byte_events);
    assert_eq!(
        harness.engine.pool_outstanding(),
        0,
        "no decode slot may remain after a complete stream",
    );
}

#[test]
fn split_inside_the_frame_header_is_reassembled() {
    let stream = stimulus();
    let (whole_bytes, whole_events, _) = run_chunked(&[stream.as_slice()]);

    // Split in the middle of the OPEN frame's header.
    let (a, rest) = stream.split_at(11);
    let (b, c) = rest.split_at(3);
    let (split_bytes, split_events, _) = run_chunked(&[a, b, c]);

    assert_eq!(whole_bytes, split_bytes);
    assert_eq!(whole_events, split_events);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any chunking of the stimulus yields the monolithic transcript.
    #[test]
    fn any_chunking_is_equivalent(
        splits in prop::collection::vec(1usize..200, 0..6),
    ) {
        let stream = stimulus();
        let (whole_bytes, whole_events, _) = run_chunked(&[stream.as_slice()]);

        let mut points: Vec<usize> = splits
            .into_iter()
            .map(|p| p % stream.len())
            .collect();
        points.sort_unstable();
        points.dedup();

        let mut chunks: Vec<&[u8]> = Vec::new();
        let mut start = 0;
        for point in points {
            chunks.push(&stream[start..point]);
            start = point;
        }
        chunks.push(&stream[start..]);

        let (chunk_bytes, chunk_events, harness) = run_chunked(&chunks);
        prop_assert_eq!(whole_bytes, chunk_bytes);
        prop_assert_eq!(whole_events, chunk_events);
        prop_assert_eq!(harness.engine.pool_outstanding(), 0);
    }
}
