//! Header and OPEN/CLOSE handshake scenarios against the engine.

mod common;

use amqpgate::{
    ConnectionState,
    codec::{Performative, ProtocolHeader},
    transport::Message,
};
use common::{Harness, close_frame, open_frame, parse_wire, reply_bytes};

#[test]
fn header_then_open_reaches_opened() {
    let mut harness = Harness::new();
    harness.connect();
    harness.grant_reply_window(64 * 1024);

    let mut out = harness.send_bytes(&ProtocolHeader::AMQP_1_0.to_bytes());
    out.extend(harness.send_bytes(&open_frame("C1", None)));

    let (header, frames) = parse_wire(&reply_bytes(&out, harness.reply_id));
    let header = header.expect("engine should echo the protocol header");
    assert!(header.is_valid());
    assert_eq!((header.major, header.minor, header.revision), (1, 0, 0));

    let Performative::Open(open) = &frames[0].performative else {
        panic!("expected OPEN reply, got {frames:?}");
    };
    assert_eq!(open.container_id, "gate-under-test");
    // The peer offered no max-frame-size, so the reply omits it too.
    assert_eq!(open.max_frame_size, None);

    assert_eq!(
        harness.engine.handshake_state(harness.initial_id),
        Some(ConnectionState::Opened),
    );
}

#[test]
fn open_with_max_frame_size_is_answered_with_default() {
    let mut harness = Harness::new();
    harness.connect();
    harness.grant_reply_window(64 * 1024);

    harness.send_bytes(&ProtocolHeader::AMQP_1_0.to_bytes());
    let out = harness.send_bytes(&open_frame("C1", Some(512)));

    let (_, frames) = parse_wire(&reply_bytes(&out, harness.reply_id));
    let Performative::Open(open) = &frames[0].performative else {
        panic!("expected OPEN reply");
    };
    assert_eq!(open.max_frame_size, Some(common::test_config().max_frame_size));
}

#[test]
fn connection_begin_grants_inbound_window() {
    let mut harness = Harness::new();
    let out = harness.connect();

    let reply_begin = out
        .iter()
        .any(|m| matches!(m, Message::Begin(b) if b.stream_id == harness.reply_id));
    assert!(reply_begin, "reply-direction BEGIN expected");

    let window = out
        .iter()
        .find_map(|m| match m {
            Message::Window(w) if w.stream_id == harness.initial_id => Some(w),
            _ => None,
        })
        .expect("inbound WINDOW expected");
    assert_eq!(window.credit as usize, common::test_config().slot_capacity);
}

#[test]
fn invalid_protocol_header_closes_with_decode_error() {
    let mut harness = Harness::new();
    harness.connect();
    harness.grant_reply_window(64 * 1024);

    let out = harness.send_bytes(b"HTTP/1.1");

    let (_, frames) = parse_wire(&reply_bytes(&out, harness.reply_id));
    let close = frames
        .iter()
        .find_map(|frame| match &frame.performative {
            Performative::Close(close) => Some(close),
            _ => None,
        })
        .expect("CLOSE expected after bad header");
    let error = close.error.as_ref().expect("close should carry an error");
    assert_eq!(error.condition, amqpgate::ErrorCondition::DecodeError);

    assert!(
        out.iter()
            .any(|m| matches!(m, Message::End(e) if e.stream_id == harness.reply_id)),
        "reply direction should end after a decode error",
    );
    assert_eq!(
        harness.engine.handshake_state(harness.initial_id),
        Some(ConnectionState::Error),
    );

    // The decoder is now in ignore-all mode: further bytes are discarded.
    let quiet = harness.send_bytes(&open_frame("C1", None));
    assert!(reply_bytes(&quiet, harness.reply_id).is_empty());
}

#[test]
fn open_before_header_is_a_protocol_violation() {
    let mut harness = Harness::new();
    harness.connect();
    harness.grant_reply_window(64 * 1024);

    let out = harness.send_bytes(&open_frame("C1", None));

    let (_, frames) = parse_wire(&reply_bytes(&out, harness.reply_id));
    assert!(
        frames.iter().any(|frame| matches!(
            &frame.performative,
            Performative::Close(close)
                if close.error.as_ref().is_some_and(
                    |e| e.condition == amqpgate::ErrorCondition::DecodeError,
                )
        )),
        "out-of-sequence OPEN should close with decode-error",
    );
}

#[test]
fn close_is_echoed_and_connection_is_dropped() {
    let mut harness = Harness::new();
    harness.open_connection();
    assert_eq!(harness.engine.connection_count(), 1);

    let out = harness.send_bytes(&close_frame());
    let (_, frames) = parse_wire(&reply_bytes(&out, harness.reply_id));
    let Performative::Close(close) = &frames[0].performative else {
        panic!("expected CLOSE echo");
    };
    assert!(close.error.is_none());
    assert!(
        out.iter()
            .any(|m| matches!(m, Message::End(e) if e.stream_id == harness.reply_id)),
    );
    assert_eq!(
        harness.engine.handshake_state(harness.initial_id),
        Some(ConnectionState::Ended),
    );

    harness.end_network();
    assert_eq!(harness.engine.connection_count(), 0);
    assert_eq!(harness.engine.pool_outstanding(), 0);
}

#[test]
fn unhandled_performatives_close_the_connection() {
    // DISPOSITION is recognised by the decoder but has no handler.
    let body = [0x00, 0x53, 0x15, 0x45];
    let mut frame = bytes::BytesMut::new();
    amqpgate::codec::FrameHeader {
        size: (amqpgate::codec::FRAME_HEADER_SIZE + body.len()) as u32,
        doff: 2,
        frame_type: 0,
        channel: 0,
    }
    .encode(&mut frame);
    frame.extend_from_slice(&body);

    let mut harness = Harness::new();
    harness.open_connection();
    let out = harness.send_bytes(&frame);

    let (_, frames) = parse_wire(&reply_bytes(&out, harness.reply_id));
    assert!(frames.iter().any(|frame| matches!(
        &frame.performative,
        Performative::Close(close)
            if close.error.as_ref().is_some_and(
                |e| e.condition == amqpgate::ErrorCondition::DecodeError,
            )
    )));
}

#[test]
fn signal_is_echoed_on_the_initial_direction() {
    let mut harness = Harness::new();
    harness.connect();

    let out = harness.send_app(Message::Signal(amqpgate::transport::Signal {
        route_id: common::NET_ROUTE,
        stream_id: harness.initial_id,
        trace_id: amqpgate::transport::TraceId(77),
    }));
    assert!(
        out.iter()
            .any(|m| matches!(m, Message::Signal(s) if s.stream_id == harness.initial_id)),
    );
}
