//! Session window and link credit behaviour.

mod common;

use amqpgate::{
    ErrorCondition,
    codec::{Performative, Role},
    transport::{Capabilities, LinkExtension, Message, TraceId},
};
use common::{
    APP_ROUTE,
    Harness,
    attach_frame,
    begin_frame,
    expect_app_begin,
    flow_frame,
    parse_wire,
    reply_bytes,
};

fn close_condition(out: &[Message], harness: &Harness) -> Option<ErrorCondition> {
    let (_, frames) = parse_wire(&reply_bytes(out, harness.reply_id));
    frames.iter().find_map(|frame| match &frame.performative {
        Performative::Close(close) => close.error.as_ref().map(|e| e.condition),
        _ => None,
    })
}

/// Answer the engine's application BEGIN so the link's reply side opens.
fn answer_app_begin(harness: &mut Harness, out: &[Message], address: &str) -> Vec<Message> {
    let app_begin = expect_app_begin(out);
    harness.send_app(Message::Begin(amqpgate::transport::Begin {
        route_id: APP_ROUTE,
        stream_id: app_begin.stream_id.counterpart(),
        trace_id: TraceId(900),
        authorization: 0,
        affinity: 0,
        extension: Some(LinkExtension {
            address: Some(address.to_owned()),
            capabilities: Capabilities::ReceiveOnly,
            sender_settle_mode: amqpgate::codec::SenderSettleMode::Mixed,
            receiver_settle_mode: amqpgate::codec::ReceiverSettleMode::First,
        }),
    }))
}

#[test]
fn begin_is_answered_with_assigned_channel() {
    let mut harness = Harness::new();
    harness.open_connection();

    let out = harness.send_bytes(&begin_frame(0, 100, 10));
    let (_, frames) = parse_wire(&reply_bytes(&out, harness.reply_id));
    let Performative::Begin(begin) = &frames[0].performative else {
        panic!("expected BEGIN reply");
    };

    assert_eq!(frames[0].channel, 1);
    assert_eq!(begin.remote_channel, Some(1));
    assert_eq!(begin.next_outgoing_id, 1);
    assert_eq!(
        begin.incoming_window as usize,
        common::test_config().slot_capacity,
    );
    assert_eq!(begin.outgoing_window, common::test_config().outgoing_window);

    let session = harness
        .engine
        .session_snapshot(harness.initial_id, 1)
        .expect("session should exist");
    assert_eq!(session.next_incoming_id, 0);
    assert_eq!(session.remote_incoming_window, 100);
    assert_eq!(session.remote_outgoing_window, 10);
}

#[test]
fn begin_with_remote_channel_is_not_allowed() {
    let mut harness = Harness::new();
    harness.open_connection();

    let mut buf = bytes::BytesMut::new();
    amqpgate::codec::encode_frame(
        0,
        &Performative::Begin(amqpgate::codec::Begin {
            remote_channel: Some(5),
            next_outgoing_id: 0,
            incoming_window: 10,
            outgoing_window: 10,
        }),
        &[],
        &mut buf,
    );
    let out = harness.send_bytes(&buf);
    assert_eq!(close_condition(&out, &harness), Some(ErrorCondition::NotAllowed));
}

#[test]
fn session_flow_recomputes_remote_windows() {
    let mut harness = Harness::new();
    harness.open_connection();
    harness.send_bytes(&begin_frame(0, 100, 10));

    harness.send_bytes(&flow_frame(1, 1, 50, 7, 9, None));

    let session = harness
        .engine
        .session_snapshot(harness.initial_id, 1)
        .expect("session");
    // remote_incoming_window = peer.next_incoming_id + peer.incoming_window
    //                          - self.next_outgoing_id
    assert_eq!(session.next_incoming_id, 7);
    assert_eq!(
        session.remote_incoming_window,
        1 + 50 - i64::from(session.next_outgoing_id),
    );
    assert_eq!(session.remote_outgoing_window, 9);
}

#[test]
fn attach_opens_application_stream_with_metadata() {
    let mut harness = Harness::new();
    harness.open_connection();
    harness.send_bytes(&begin_frame(0, 100, 10));

    let out = harness.send_bytes(&attach_frame(1, "replies", 0, Role::Receiver, "queue-a"));
    let app_begin = expect_app_begin(&out);
    assert!(app_begin.stream_id.is_initial());
    let extension = app_begin.extension.expect("link extension expected");
    assert_eq!(extension.address.as_deref(), Some("queue-a"));
    assert_eq!(extension.capabilities, Capabilities::ReceiveOnly);
    assert_eq!(harness.engine.correlation_count(), 1);
}

#[test]
fn application_begin_is_answered_with_attach_echo() {
    let mut harness = Harness::new();
    harness.open_connection();
    harness.send_bytes(&begin_frame(0, 100, 10));
    let out = harness.send_bytes(&attach_frame(1, "replies", 0, Role::Receiver, "queue-a"));

    let out = answer_app_begin(&mut harness, &out, "queue-a");
    assert_eq!(harness.engine.correlation_count(), 0);

    let (_, frames) = parse_wire(&reply_bytes(&out, harness.reply_id));
    let Performative::Attach(attach) = &frames[0].performative else {
        panic!("expected ATTACH echo, got {frames:?}");
    };
    assert_eq!(attach.name, "replies");
    assert_eq!(attach.handle, 0);
    // We answer a receiving client as the sending endpoint.
    assert_eq!(attach.role, Role::Sender);
    assert_eq!(
        attach.source.as_ref().and_then(|s| s.address.as_deref()),
        Some("queue-a"),
    );
    assert_eq!(attach.initial_delivery_count, Some(0));
}

#[test]
fn duplicate_handle_attach_is_not_allowed() {
    let mut harness = Harness::new();
    harness.open_connection();
    harness.send_bytes(&begin_frame(0, 100, 10));
    harness.send_bytes(&attach_frame(1, "first", 0, Role::Receiver, "queue-a"));

    let out = harness.send_bytes(&attach_frame(1, "second", 0, Role::Receiver, "queue-b"));
    assert_eq!(close_condition(&out, &harness), Some(ErrorCondition::NotAllowed));

    // The session's links were torn down with the connection close.
    assert!(
        out.iter()
            .any(|m| matches!(m, Message::Abort(_) | Message::Reset(_))),
        "application streams should be aborted or reset",
    );
    assert_eq!(harness.engine.correlation_count(), 0);
}

#[test]
fn attach_on_unknown_channel_is_not_allowed() {
    let mut harness = Harness::new();
    harness.open_connection();

    let out = harness.send_bytes(&attach_frame(9, "nowhere", 0, Role::Receiver, "queue-a"));
    assert_eq!(close_condition(&out, &harness), Some(ErrorCondition::NotAllowed));
}

#[test]
fn unrouted_attach_is_ignored() {
    let router = amqpgate::TableRouter::new().with_route(amqpgate::route::TableRoute {
        address: Some("only-this".to_owned()),
        capabilities: Capabilities::ReceiveOnly,
        target: APP_ROUTE,
    });
    let mut harness = Harness::with_router(common::test_config(), router);
    harness.open_connection();
    harness.send_bytes(&begin_frame(0, 100, 10));

    let out = harness.send_bytes(&attach_frame(1, "replies", 0, Role::Receiver, "queue-a"));

    assert!(
        !out.iter()
            .any(|m| matches!(m, Message::Begin(b) if b.route_id == APP_ROUTE)),
        "no application stream for an unrouted address",
    );
    assert_eq!(close_condition(&out, &harness), None);
    assert!(harness.engine.link_snapshot(harness.initial_id, 1, 0).is_none());
}

#[test]
fn link_flow_translates_credit_into_budget() {
    let mut harness = Harness::new();
    harness.open_connection();
    harness.send_bytes(&begin_frame(0, 100, 10));
    let out = harness.send_bytes(&attach_frame(1, "replies", 0, Role::Receiver, "queue-a"));
    answer_app_begin(&mut harness, &out, "queue-a");

    let out = harness.send_bytes(&flow_frame(1, 1, 100, 0, 10, Some((0, 0, 10))));

    let link = harness
        .engine
        .link_snapshot(harness.initial_id, 1, 0)
        .expect("link");
    let config = common::test_config();
    // link_credit = peer.delivery_count + peer.link_credit
    //               - self.delivery_count
    assert_eq!(link.link_credit, 10);
    assert_eq!(
        link.reply_budget,
        i64::from(link.link_credit) * i64::from(config.max_frame_size),
    );

    let window = out
        .iter()
        .find_map(|m| match m {
            Message::Window(w) if w.route_id == APP_ROUTE => Some(w),
            _ => None,
        })
        .expect("credit should flush a WINDOW to the application");
    assert_eq!(i64::from(window.credit), link.reply_budget);
    assert_eq!(window.minimum, config.max_frame_size);
    let frames_per_slot = config.slot_capacity.div_ceil(config.max_frame_size as usize);
    assert_eq!(window.padding as usize, 20 * frames_per_slot + 205);
}

#[test]
fn flow_with_unknown_handle_is_not_allowed() {
    let mut harness = Harness::new();
    harness.open_connection();
    harness.send_bytes(&begin_frame(0, 100, 10));

    let out = harness.send_bytes(&flow_frame(1, 1, 100, 0, 10, Some((42, 0, 10))));
    assert_eq!(close_condition(&out, &harness), Some(ErrorCondition::NotAllowed));
}

#[test]
fn connection_close_sweeps_correlations_and_slots() {
    let mut harness = Harness::new();
    harness.open_connection();
    harness.send_bytes(&begin_frame(0, 100, 10));
    harness.send_bytes(&attach_frame(1, "replies", 0, Role::Receiver, "queue-a"));
    assert_eq!(harness.engine.correlation_count(), 1);

    harness.send_bytes(&common::close_frame());
    harness.end_network();

    assert_eq!(harness.engine.connection_count(), 0);
    assert_eq!(harness.engine.correlation_count(), 0);
    assert_eq!(harness.engine.pool_outstanding(), 0);
}
