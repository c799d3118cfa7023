//! Shared helpers for driving the sans-io engine in tests.

// Items in this shared module may not be used by all test binaries that import it.
#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use std::sync::Arc;

use amqpgate::{
    AmqpEngine,
    EngineConfig,
    SharedCreditor,
    TableRouter,
    codec::{
        self,
        Attach,
        Begin,
        Close,
        Flow,
        Frame,
        Open,
        Performative,
        ProtocolHeader,
        ReceiverSettleMode,
        Role,
        SenderSettleMode,
        Terminus,
    },
    transport::{BudgetId, Data, End, Message, RouteId, StreamId, TraceId, Window},
};
use bytes::{Bytes, BytesMut};

/// Route id the simulated network transport arrives on.
pub const NET_ROUTE: RouteId = RouteId(1);
/// Route id the application streams are opened on.
pub const APP_ROUTE: RouteId = RouteId(100);
/// Initial stream id of the simulated client connection.
pub const CLIENT_INITIAL: StreamId = StreamId(11);

/// Compact configuration keeping test frames small.
#[must_use]
pub fn test_config() -> EngineConfig {
    EngineConfig {
        container_id: "gate-under-test".to_owned(),
        outgoing_window: 8,
        max_frame_size: 256,
        initial_delivery_count: 0,
        slot_capacity: 1024,
        slot_count: 8,
    }
}

/// Engine plus bookkeeping for one simulated client connection.
pub struct Harness {
    pub engine: AmqpEngine,
    pub initial_id: StreamId,
    pub reply_id: StreamId,
    trace: u64,
}

impl Harness {
    #[must_use]
    pub fn new() -> Self { Self::with_config(test_config()) }

    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_router(config, TableRouter::wildcard(APP_ROUTE))
    }

    #[must_use]
    pub fn with_router(config: EngineConfig, router: TableRouter) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let engine = AmqpEngine::new(config, Arc::new(router), Arc::new(SharedCreditor::new()));
        Self {
            engine,
            initial_id: CLIENT_INITIAL,
            reply_id: CLIENT_INITIAL.counterpart(),
            trace: 0,
        }
    }

    fn next_trace(&mut self) -> TraceId {
        self.trace += 1;
        TraceId(self.trace)
    }

    /// Open the network connection and drain the engine's reaction.
    pub fn connect(&mut self) -> Vec<Message> {
        let trace_id = self.next_trace();
        self.engine
            .on_message(Message::Begin(amqpgate::transport::Begin {
                route_id: NET_ROUTE,
                stream_id: self.initial_id,
                trace_id,
                authorization: 0,
                affinity: 0,
                extension: None,
            }));
        self.drain()
    }

    /// Grant reply-direction budget so encoded frames can flow.
    pub fn grant_reply_window(&mut self, credit: u32) -> Vec<Message> {
        let trace_id = self.next_trace();
        self.engine.on_message(Message::Window(Window {
            route_id: NET_ROUTE,
            stream_id: self.reply_id,
            trace_id,
            authorization: 0,
            budget_id: BudgetId::default(),
            credit,
            padding: 0,
            minimum: 0,
        }));
        self.drain()
    }

    /// Deliver raw AMQP bytes on the initial direction.
    pub fn send_bytes(&mut self, bytes: &[u8]) -> Vec<Message> {
        let trace_id = self.next_trace();
        self.engine.on_message(Message::Data(Data {
            route_id: NET_ROUTE,
            stream_id: self.initial_id,
            trace_id,
            authorization: 0,
            budget_id: BudgetId::default(),
            reserved: bytes.len() as u32,
            fin: false,
            payload: Bytes::copy_from_slice(bytes),
            extension: None,
        }));
        self.drain()
    }

    /// End the initial direction of the network stream.
    pub fn end_network(&mut self) -> Vec<Message> {
        let trace_id = self.next_trace();
        self.engine.on_message(Message::End(End {
            route_id: NET_ROUTE,
            stream_id: self.initial_id,
            trace_id,
            authorization: 0,
        }));
        self.drain()
    }

    /// Forward an application-side message into the engine.
    pub fn send_app(&mut self, message: Message) -> Vec<Message> {
        self.engine.on_message(message);
        self.drain()
    }

    pub fn drain(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(message) = self.engine.poll_transmit() {
            out.push(message);
        }
        out
    }

    /// Connection, window grant and AMQP handshake up to OPENED.
    pub fn open_connection(&mut self) -> Vec<Message> {
        self.connect();
        self.grant_reply_window(64 * 1024);
        let mut out = self.send_bytes(&ProtocolHeader::AMQP_1_0.to_bytes());
        out.extend(self.send_bytes(&open_frame("client-1", Some(256))));
        out
    }
}

impl Default for Harness {
    fn default() -> Self { Self::new() }
}

/// Concatenated reply-direction payload bytes from `messages`.
#[must_use]
pub fn reply_bytes(messages: &[Message], reply_id: StreamId) -> Vec<u8> {
    let mut bytes = Vec::new();
    for message in messages {
        if let Message::Data(data) = message
            && data.stream_id == reply_id
        {
            bytes.extend_from_slice(&data.payload);
        }
    }
    bytes
}

/// Parse a protocol header (if present) and every complete frame.
#[must_use]
pub fn parse_wire(mut bytes: &[u8]) -> (Option<ProtocolHeader>, Vec<Frame>) {
    let mut header = None;
    if bytes.len() >= 8 && &bytes[..4] == b"AMQP" {
        header = ProtocolHeader::parse(bytes);
        bytes = &bytes[8..];
    }
    let mut frames = Vec::new();
    while let Some((frame, consumed)) = codec::parse_frame(bytes).expect("well-formed reply bytes")
    {
        frames.push(frame);
        bytes = &bytes[consumed..];
    }
    assert!(bytes.is_empty(), "trailing partial frame in reply");
    (header, frames)
}

#[must_use]
pub fn open_frame(container_id: &str, max_frame_size: Option<u32>) -> BytesMut {
    let mut buf = BytesMut::new();
    codec::encode_frame(
        0,
        &Performative::Open(Open {
            container_id: container_id.to_owned(),
            max_frame_size,
            ..Open::default()
        }),
        &[],
        &mut buf,
    );
    buf
}

#[must_use]
pub fn begin_frame(next_outgoing_id: u32, incoming_window: u32, outgoing_window: u32) -> BytesMut {
    let mut buf = BytesMut::new();
    codec::encode_frame(
        0,
        &Performative::Begin(Begin {
            remote_channel: None,
            next_outgoing_id,
            incoming_window,
            outgoing_window,
        }),
        &[],
        &mut buf,
    );
    buf
}

#[must_use]
pub fn attach_frame(channel: u16, name: &str, handle: u32, role: Role, address: &str) -> BytesMut {
    let terminus = Some(Terminus {
        address: Some(address.to_owned()),
    });
    let (source, target) = match role {
        Role::Receiver => (terminus, None),
        Role::Sender => (None, terminus),
    };
    let mut buf = BytesMut::new();
    codec::encode_frame(
        channel,
        &Performative::Attach(Attach {
            name: name.to_owned(),
            handle,
            role,
            snd_settle_mode: SenderSettleMode::Mixed,
            rcv_settle_mode: ReceiverSettleMode::First,
            source,
            target,
            initial_delivery_count: Some(0),
        }),
        &[],
        &mut buf,
    );
    buf
}

#[allow(clippy::too_many_arguments)]
#[must_use]
pub fn flow_frame(
    channel: u16,
    next_incoming_id: u32,
    incoming_window: u32,
    next_outgoing_id: u32,
    outgoing_window: u32,
    link: Option<(u32, u32, u32)>,
) -> BytesMut {
    let (handle, delivery_count, link_credit) = match link {
        Some((handle, delivery_count, link_credit)) => {
            (Some(handle), Some(delivery_count), Some(link_credit))
        }
        None => (None, None, None),
    };
    let mut buf = BytesMut::new();
    codec::encode_frame(
        channel,
        &Performative::Flow(Flow {
            next_incoming_id: Some(next_incoming_id),
            incoming_window,
            next_outgoing_id,
            outgoing_window,
            handle,
            delivery_count,
            link_credit,
        }),
        &[],
        &mut buf,
    );
    buf
}

#[must_use]
pub fn close_frame() -> BytesMut {
    let mut buf = BytesMut::new();
    codec::encode_frame(0, &Performative::Close(Close::default()), &[], &mut buf);
    buf
}

/// The first application-stream BEGIN in `messages`.
#[must_use]
pub fn expect_app_begin(messages: &[Message]) -> amqpgate::transport::Begin {
    messages
        .iter()
        .find_map(|message| match message {
            Message::Begin(begin) if begin.route_id == APP_ROUTE => Some(begin.clone()),
            _ => None,
        })
        .expect("engine should open an application stream")
}
