//! Per-connection engine: decode loop, encode path and teardown.
//!
//! One instance owns everything a network connection needs: the
//! handshake state, the decoder mode, at most one decode and one
//! encode reassembly slot, the session table and the budget counters
//! for both stream directions. All mutation happens on the thread
//! delivering the current event; backpressure is expressed through the
//! budget counters, never by blocking.

use bytes::BytesMut;

use super::{
    EngineContext,
    life::DuplexLife,
    link::{AttachEcho, DataFault, LinkEnv},
    session::Session,
};
use crate::{
    codec::{
        self,
        Attach,
        Begin,
        Close,
        ErrorList,
        Flow,
        Frame,
        FrameHeader,
        Open,
        Performative,
        ProtocolHeader,
        Role,
        Terminus,
    },
    error::{EngineError, ErrorCondition},
    handshake::{ConnectionEvent, ConnectionState, transition},
    metrics,
    pool::SlotPool,
    transport::{
        Abort,
        BudgetId,
        Data,
        End,
        Message,
        Reset,
        RouteId,
        Signal,
        StreamId,
        TraceId,
        Window,
    },
};

/// Inbound decoder mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DecodeMode {
    /// Expecting the 8-byte protocol header.
    Header,
    /// Expecting frames.
    Frame,
    /// Terminal: all further inbound bytes are discarded.
    IgnoreAll,
}

/// Engine state for one accepted network connection.
#[derive(Debug)]
pub(crate) struct AmqpConnection {
    route_id: RouteId,
    initial_id: StreamId,
    reply_id: StreamId,
    affinity: u64,
    shared_budget_id: BudgetId,
    sessions: std::collections::HashMap<u16, Session>,
    life: DuplexLife,
    handshake: ConnectionState,
    decoder: DecodeMode,
    decode_slot: Option<BytesMut>,
    encode_slot: Option<BytesMut>,
    encode_slot_trace: TraceId,
    initial_budget: i64,
    reply_budget: i64,
    reply_padding: u32,
    reply_shared_budget: i64,
    creditor_index: Option<crate::credit::CreditorIndex>,
    channel_counter: u16,
    max_frame_size: u32,
}

impl AmqpConnection {
    pub(crate) fn new(
        route_id: RouteId,
        initial_id: StreamId,
        affinity: u64,
        shared_budget_id: BudgetId,
        default_max_frame_size: u32,
    ) -> Self {
        Self {
            route_id,
            initial_id,
            reply_id: initial_id.counterpart(),
            affinity,
            shared_budget_id,
            sessions: std::collections::HashMap::new(),
            life: DuplexLife::default(),
            handshake: ConnectionState::Start,
            decoder: DecodeMode::Header,
            decode_slot: None,
            encode_slot: None,
            encode_slot_trace: TraceId::default(),
            initial_budget: 0,
            reply_budget: 0,
            reply_padding: 0,
            reply_shared_budget: 0,
            creditor_index: None,
            channel_counter: 0,
            max_frame_size: default_max_frame_size,
        }
    }

    pub(crate) const fn handshake(&self) -> ConnectionState { self.handshake }

    pub(crate) fn session(&self, channel: u16) -> Option<&Session> { self.sessions.get(&channel) }

    /// Whether both network directions have closed and the connection
    /// can be dropped from the engine.
    pub(crate) fn is_terminated(&self) -> bool { self.life.is_closed() }

    /// Stream ids of every application stream pair owned by links.
    pub(crate) fn owned_streams(&self) -> Vec<StreamId> {
        self.sessions
            .values()
            .flat_map(|session| session.links.values())
            .flat_map(|link| {
                let (initial, reply) = link.stream_ids();
                [initial, reply]
            })
            .collect()
    }

    /// Return any held slots to the pool and release the creditor
    /// entry; called by the engine when the connection is dropped.
    pub(crate) fn release_resources(
        &mut self,
        pool: &mut SlotPool,
        creditor: &dyn crate::credit::BudgetCreditor,
    ) {
        if let Some(slot) = self.decode_slot.take() {
            pool.release(slot);
        }
        if let Some(slot) = self.encode_slot.take() {
            pool.release(slot);
        }
        if let Some(index) = self.creditor_index.take() {
            creditor.release(index);
        }
    }

    /// Handle one network-side transport message.
    pub(crate) fn on_network(&mut self, ctx: &mut EngineContext<'_>, message: &Message) {
        match message {
            Message::Begin(begin) => self.on_network_begin(ctx, begin.trace_id, begin.authorization),
            Message::Data(data) => self.on_network_data(ctx, data),
            Message::End(end) => self.on_network_end(ctx, end.trace_id, end.authorization),
            Message::Abort(abort) => self.on_network_abort(ctx, abort.trace_id, abort.authorization),
            Message::Window(window) => self.on_network_window(ctx, window),
            Message::Reset(reset) => self.on_network_reset(ctx, reset.trace_id, reset.authorization),
            Message::Signal(signal) => self.on_network_signal(ctx, signal.trace_id),
        }
    }

    fn on_network_begin(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        self.life.initial.opening();
        self.do_network_begin(ctx, trace_id, authorization);
        let credit = ctx.pool.slot_capacity() as u32;
        self.do_network_window(ctx, trace_id, authorization, credit, 0);
    }

    fn on_network_data(&mut self, ctx: &mut EngineContext<'_>, data: &Data) {
        let trace_id = data.trace_id;
        let authorization = data.authorization;

        self.initial_budget -= i64::from(data.reserved);
        if self.initial_budget < 0 {
            tracing::warn!(
                stream = %self.initial_id,
                reserved = data.reserved,
                "peer overran its inbound budget"
            );
            let trace_id = ctx.ids.trace_id();
            self.do_network_reset(ctx, trace_id, authorization);
            return;
        }

        // Fold any buffered prefix in front of the new bytes, taking
        // the slot out so the decode loop sees one contiguous range.
        let (mut work, from_pool) = match self.decode_slot.take() {
            Some(mut slot) => {
                if slot.len() + data.payload.len() > ctx.pool.slot_capacity() {
                    ctx.pool.release(slot);
                    self.cleanup_network(ctx, trace_id, authorization);
                    return;
                }
                slot.extend_from_slice(&data.payload);
                (slot, true)
            }
            None => (BytesMut::from(&data.payload[..]), false),
        };

        let consumed = self.decode_network(ctx, trace_id, authorization, &work);
        let remainder = work.len() - consumed;

        if remainder > 0 {
            if from_pool {
                let len = work.len();
                work.copy_within(consumed..len, 0);
                work.truncate(remainder);
                self.decode_slot = Some(work);
            } else if remainder > ctx.pool.slot_capacity() {
                self.cleanup_network(ctx, trace_id, authorization);
            } else if let Some(mut slot) = ctx.pool.acquire() {
                slot.extend_from_slice(&work[consumed..]);
                self.decode_slot = Some(slot);
            } else {
                tracing::warn!(
                    stream = %self.initial_id,
                    error = %EngineError::SlotExhausted,
                    "cannot buffer partial frame"
                );
                self.cleanup_network(ctx, trace_id, authorization);
            }
        } else {
            if from_pool {
                ctx.pool.release(work);
            }
            if self.life.initial.is_closed() {
                self.cleanup_streams(ctx, trace_id, authorization);
                self.do_network_end_if_necessary(ctx, trace_id, authorization);
            }
        }

        // Consumed bytes no longer occupy buffering; hand the credit
        // back so the peer can keep the pipe full.
        if consumed > 0 && self.decoder != DecodeMode::IgnoreAll && !self.life.initial.is_closed() {
            self.do_network_window(ctx, trace_id, authorization, consumed as u32, 0);
        }
    }

    /// Consume as many complete units from `buffer` as possible and
    /// return the consumed extent.
    fn decode_network(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
        buffer: &[u8],
    ) -> usize {
        let mut offset = 0;
        while offset < buffer.len() {
            match self.decoder {
                DecodeMode::Header => {
                    let Some(header) = ProtocolHeader::parse(&buffer[offset..]) else {
                        break;
                    };
                    if header.is_valid() {
                        self.on_decode_header(ctx, trace_id, authorization, header);
                        self.decoder = DecodeMode::Frame;
                        offset += codec::PROTOCOL_HEADER_SIZE;
                    } else {
                        tracing::debug!(stream = %self.initial_id, ?header, "bad protocol header");
                        self.on_decode_error(ctx, trace_id, authorization, ErrorCondition::DecodeError);
                        offset = buffer.len();
                    }
                }
                DecodeMode::Frame => match codec::parse_frame(&buffer[offset..]) {
                    Ok(Some((frame, consumed))) => {
                        offset += consumed;
                        self.on_decode_frame(ctx, trace_id, authorization, frame);
                    }
                    Ok(None) => {
                        // A frame that can never fit a slot will never
                        // complete; fail fast instead of buffering.
                        if let Ok(Some(header)) = FrameHeader::parse(&buffer[offset..])
                            && header.size as usize > ctx.pool.slot_capacity()
                        {
                            self.on_decode_error(
                                ctx,
                                trace_id,
                                authorization,
                                ErrorCondition::DecodeError,
                            );
                            offset = buffer.len();
                        }
                        break;
                    }
                    Err(error) => {
                        let error = EngineError::from(error);
                        tracing::debug!(stream = %self.initial_id, %error, "malformed frame");
                        self.on_decode_error(ctx, trace_id, authorization, ErrorCondition::DecodeError);
                        offset = buffer.len();
                    }
                },
                DecodeMode::IgnoreAll => {
                    offset = buffer.len();
                }
            }
        }
        offset
    }

    fn on_decode_frame(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
        frame: Frame,
    ) {
        metrics::inc_frames(metrics::Direction::Inbound);
        match frame.performative {
            Performative::Open(open) => self.on_decode_open(ctx, trace_id, authorization, &open),
            Performative::Begin(begin) => self.on_decode_begin(ctx, trace_id, authorization, &begin),
            Performative::Attach(attach) => {
                self.on_decode_attach(ctx, trace_id, authorization, frame.channel, &attach);
            }
            Performative::Flow(flow) => {
                self.on_decode_flow(ctx, trace_id, authorization, frame.channel, &flow);
            }
            Performative::Close(close) => self.on_decode_close(ctx, trace_id, authorization, &close),
            // Recognised by the decoder but deliberately unhandled;
            // wiring a handler here is the extension point for full
            // transfer/disposition/detach/end support.
            Performative::Transfer(_)
            | Performative::Disposition
            | Performative::Detach
            | Performative::End => {
                tracing::debug!(
                    stream = %self.initial_id,
                    kind = frame.performative.name(),
                    "performative without handler"
                );
                self.on_decode_error(ctx, trace_id, authorization, ErrorCondition::DecodeError);
            }
        }
    }

    fn on_decode_header(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
        header: ProtocolHeader,
    ) {
        if !self.apply_handshake(ctx, trace_id, authorization, ConnectionEvent::ReceivedHeader) {
            return;
        }
        self.do_encode_protocol_header(ctx, trace_id, authorization, header);
        self.note_handshake(ConnectionEvent::SentHeader);
    }

    fn on_decode_open(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
        open: &Open,
    ) {
        if !self.apply_handshake(ctx, trace_id, authorization, ConnectionEvent::ReceivedOpen) {
            return;
        }
        if let Some(max_frame_size) = open.max_frame_size {
            self.max_frame_size = max_frame_size;
        }
        self.do_encode_open(ctx, trace_id, authorization, open.max_frame_size.is_some());
        self.note_handshake(ConnectionEvent::SentOpen);
    }

    fn on_decode_begin(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
        begin: &Begin,
    ) {
        if begin.remote_channel.is_some() {
            self.on_decode_error(ctx, trace_id, authorization, ErrorCondition::NotAllowed);
            return;
        }
        // Fresh channel id, distinct from any in-flight duplicate.
        loop {
            self.channel_counter = self.channel_counter.wrapping_add(1);
            if !self.sessions.contains_key(&self.channel_counter) {
                break;
            }
        }
        let channel = self.channel_counter;
        let session = Session::new(
            channel,
            begin,
            ctx.pool.slot_capacity() as u32,
            ctx.config.outgoing_window,
        );
        let next_outgoing_id = session.windows.next_outgoing_id;
        self.sessions.insert(channel, session);
        self.do_encode_begin(ctx, trace_id, authorization, channel, next_outgoing_id);
    }

    fn on_decode_attach(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
        channel: u16,
        attach: &Attach,
    ) {
        let env = LinkEnv {
            connection: self.initial_id,
            channel,
            affinity: self.affinity,
            shared_budget_id: self.shared_budget_id,
        };
        let network_route = self.route_id;
        let outcome = match self.sessions.get_mut(&channel) {
            Some(session) => {
                session.on_decode_attach(ctx, env, attach, trace_id, authorization, network_route)
            }
            None => Err(ErrorCondition::NotAllowed),
        };
        if let Err(condition) = outcome {
            self.on_decode_error(ctx, trace_id, authorization, condition);
        }
    }

    fn on_decode_flow(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
        channel: u16,
        flow: &Flow,
    ) {
        let max_frame_size = self.max_frame_size;
        let slot_capacity = ctx.pool.slot_capacity();
        let outcome = match self.sessions.get_mut(&channel) {
            Some(session) => session.on_decode_flow(
                ctx,
                flow,
                trace_id,
                authorization,
                max_frame_size,
                slot_capacity,
            ),
            None => Err(ErrorCondition::NotAllowed),
        };
        if let Err(condition) = outcome {
            self.on_decode_error(ctx, trace_id, authorization, condition);
        }
    }

    fn on_decode_close(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
        close: &Close,
    ) {
        if !self.apply_handshake(ctx, trace_id, authorization, ConnectionEvent::ReceivedClose) {
            return;
        }
        if let Some(error) = &close.error {
            tracing::debug!(stream = %self.initial_id, condition = %error.condition, "peer closed with error");
        }
        self.cleanup_streams(ctx, trace_id, authorization);
        self.do_encode_close(ctx, trace_id, authorization, None);
        self.do_network_end_if_necessary(ctx, trace_id, authorization);
    }

    /// Escalate a decode or protocol error: tear down every stream,
    /// close with the condition, end the reply direction and discard
    /// all further inbound bytes.
    pub(crate) fn on_decode_error(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
        condition: ErrorCondition,
    ) {
        metrics::inc_errors();
        self.decoder = DecodeMode::IgnoreAll;
        self.cleanup_streams(ctx, trace_id, authorization);
        self.do_encode_close(ctx, trace_id, authorization, Some(condition));
        self.do_network_end_if_necessary(ctx, trace_id, authorization);
    }

    fn apply_handshake(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
        event: ConnectionEvent,
    ) -> bool {
        let next = transition(self.handshake, event);
        if next == ConnectionState::Error {
            tracing::debug!(
                stream = %self.initial_id,
                state = ?self.handshake,
                ?event,
                "illegal handshake event"
            );
            self.on_decode_error(ctx, trace_id, authorization, ErrorCondition::DecodeError);
            return false;
        }
        self.handshake = next;
        true
    }

    /// Record a locally-driven handshake event without escalation.
    fn note_handshake(&mut self, event: ConnectionEvent) {
        self.handshake = transition(self.handshake, event);
    }

    /// Handle one application-side transport message for a link.
    pub(crate) fn on_application(
        &mut self,
        ctx: &mut EngineContext<'_>,
        channel: u16,
        handle: u32,
        message: &Message,
    ) {
        enum Action {
            None,
            EncodeAttach(AttachEcho, TraceId, u64),
            Emit(Vec<BytesMut>, u32, TraceId, u64),
            Fault(DataFault, u32, TraceId, u64),
        }

        let max_frame_size = self.max_frame_size;
        let action = {
            let Some(session) = self.sessions.get_mut(&channel) else {
                tracing::debug!(channel, handle, "application message for unknown session");
                return;
            };
            let windows = &mut session.windows;
            let Some(link) = session.links.get_mut(&handle) else {
                tracing::debug!(channel, handle, "application message for unknown link");
                return;
            };
            match message {
                Message::Begin(begin) => link
                    .on_application_begin(begin, ctx.config.initial_delivery_count)
                    .map_or(Action::None, |echo| {
                        Action::EncodeAttach(echo, begin.trace_id, begin.authorization)
                    }),
                Message::Data(data) => {
                    let outcome =
                        link.on_application_data(ctx, data, windows, channel, max_frame_size);
                    match outcome.fault {
                        Some(fault) => Action::Fault(
                            fault,
                            outcome.reserved,
                            data.trace_id,
                            data.authorization,
                        ),
                        None => Action::Emit(
                            outcome.frames,
                            outcome.reserved,
                            data.trace_id,
                            data.authorization,
                        ),
                    }
                }
                Message::End(end) => {
                    link.on_application_end(end);
                    Action::None
                }
                Message::Abort(abort) => {
                    link.on_application_abort(ctx, abort.trace_id, abort.authorization);
                    Action::None
                }
                Message::Window(window) => {
                    link.on_application_window(ctx, window);
                    Action::None
                }
                Message::Reset(reset) => {
                    link.on_application_reset(ctx, reset.trace_id, reset.authorization);
                    Action::None
                }
                Message::Signal(_) => Action::None,
            }
        };

        match action {
            Action::None => {}
            Action::EncodeAttach(echo, trace_id, authorization) => {
                self.do_encode_attach(ctx, trace_id, authorization, channel, &echo);
            }
            Action::Emit(frames, reserved, trace_id, authorization) => {
                self.reply_shared_budget -= i64::from(reserved);
                for frame in frames {
                    self.do_network_data(ctx, trace_id, authorization, &frame);
                }
            }
            Action::Fault(fault, reserved, trace_id, authorization) => {
                tracing::warn!(channel, handle, ?fault, "link data fault");
                self.reply_shared_budget -= i64::from(reserved);
                self.do_network_abort_if_necessary(ctx, trace_id, authorization);
            }
        }

        // Idempotent handle removal once both directions closed.
        if let Some(session) = self.sessions.get_mut(&channel)
            && session.links.get(&handle).is_some_and(super::link::Link::is_closed)
            && let Some(link) = session.links.remove(&handle)
        {
            link.unregister(ctx);
        }
    }

    fn do_encode_protocol_header(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
        header: ProtocolHeader,
    ) {
        let mut buf = BytesMut::with_capacity(codec::PROTOCOL_HEADER_SIZE);
        header.encode(&mut buf);
        self.do_network_data(ctx, trace_id, authorization, &buf);
    }

    fn do_encode_open(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
        has_max_frame_size: bool,
    ) {
        let open = Open {
            container_id: ctx.config.container_id.clone(),
            max_frame_size: has_max_frame_size.then_some(ctx.config.max_frame_size),
            ..Open::default()
        };
        let mut buf = BytesMut::new();
        codec::encode_frame(0, &Performative::Open(open), &[], &mut buf);
        self.do_network_data(ctx, trace_id, authorization, &buf);
    }

    fn do_encode_begin(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
        channel: u16,
        next_outgoing_id: u32,
    ) {
        let begin = Begin {
            remote_channel: Some(channel),
            next_outgoing_id,
            incoming_window: ctx.pool.slot_capacity() as u32,
            outgoing_window: ctx.config.outgoing_window,
        };
        let mut buf = BytesMut::new();
        codec::encode_frame(channel, &Performative::Begin(begin), &[], &mut buf);
        self.do_network_data(ctx, trace_id, authorization, &buf);
    }

    fn do_encode_attach(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
        channel: u16,
        echo: &AttachEcho,
    ) {
        let (source, target, initial_delivery_count) = match echo.role {
            Role::Sender => (
                Some(Terminus {
                    address: echo.address.clone(),
                }),
                Some(Terminus { address: None }),
                Some(ctx.config.initial_delivery_count),
            ),
            Role::Receiver => (
                None,
                Some(Terminus {
                    address: echo.address.clone(),
                }),
                None,
            ),
        };
        let attach = Attach {
            name: echo.name.clone(),
            handle: echo.handle,
            role: echo.role,
            snd_settle_mode: echo.snd_settle_mode,
            rcv_settle_mode: echo.rcv_settle_mode,
            source,
            target,
            initial_delivery_count,
        };
        let mut buf = BytesMut::new();
        codec::encode_frame(channel, &Performative::Attach(attach), &[], &mut buf);
        self.do_network_data(ctx, trace_id, authorization, &buf);
    }

    fn do_encode_close(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
        condition: Option<ErrorCondition>,
    ) {
        let close = Close {
            error: condition.map(|condition| ErrorList {
                condition,
                description: None,
            }),
        };
        let mut buf = BytesMut::new();
        codec::encode_frame(0, &Performative::Close(close), &[], &mut buf);
        self.do_network_data(ctx, trace_id, authorization, &buf);
        self.note_handshake(ConnectionEvent::SentClose);
    }

    /// Queue outbound bytes, preserving order behind any buffered
    /// remainder, and flush what the reply budget allows.
    pub(crate) fn do_network_data(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
        bytes: &[u8],
    ) {
        metrics::inc_frames(metrics::Direction::Outbound);
        if let Some(slot) = self.encode_slot.as_mut() {
            if slot.len() + bytes.len() > ctx.pool.slot_capacity() {
                tracing::warn!(stream = %self.reply_id, "encode slot overflow");
                if let Some(slot) = self.encode_slot.take() {
                    ctx.pool.release(slot);
                }
                self.cleanup_network(ctx, trace_id, authorization);
                return;
            }
            slot.extend_from_slice(bytes);
            self.encode_slot_trace = trace_id;
            self.flush_encode_slot(ctx, authorization);
        } else {
            self.encode_network(ctx, trace_id, authorization, bytes);
        }
    }

    /// Send `min(budget - padding, available)`; buffer the remainder.
    fn encode_network(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
        bytes: &[u8],
    ) {
        let budget = (self.reply_budget - i64::from(self.reply_padding)).max(0);
        let length = usize::try_from(budget).map_or(bytes.len(), |b| b.min(bytes.len()));

        if length > 0 {
            let reserved = length as u32 + self.reply_padding;
            self.reply_budget -= i64::from(reserved);
            ctx.send(Message::Data(Data {
                route_id: self.route_id,
                stream_id: self.reply_id,
                trace_id,
                authorization,
                budget_id: BudgetId::default(),
                reserved,
                fin: false,
                payload: bytes::Bytes::copy_from_slice(&bytes[..length]),
                extension: None,
            }));
        }

        let remaining = bytes.len() - length;
        if remaining > 0 {
            if remaining > ctx.pool.slot_capacity() {
                self.cleanup_network(ctx, trace_id, authorization);
            } else if let Some(mut slot) = ctx.pool.acquire() {
                slot.extend_from_slice(&bytes[length..]);
                self.encode_slot = Some(slot);
                self.encode_slot_trace = trace_id;
            } else {
                tracing::warn!(
                    stream = %self.reply_id,
                    error = %EngineError::SlotExhausted,
                    "cannot buffer unsent bytes"
                );
                self.cleanup_network(ctx, trace_id, authorization);
            }
        } else {
            self.maybe_end_reply(ctx, trace_id, authorization);
        }
    }

    /// Drain buffered outbound bytes as far as the budget allows.
    fn flush_encode_slot(&mut self, ctx: &mut EngineContext<'_>, authorization: u64) {
        let Some(mut slot) = self.encode_slot.take() else {
            return;
        };
        let trace_id = self.encode_slot_trace;
        let budget = (self.reply_budget - i64::from(self.reply_padding)).max(0);
        let length = usize::try_from(budget).map_or(slot.len(), |b| b.min(slot.len()));

        if length > 0 {
            let reserved = length as u32 + self.reply_padding;
            self.reply_budget -= i64::from(reserved);
            ctx.send(Message::Data(Data {
                route_id: self.route_id,
                stream_id: self.reply_id,
                trace_id,
                authorization,
                budget_id: BudgetId::default(),
                reserved,
                fin: false,
                payload: bytes::Bytes::copy_from_slice(&slot[..length]),
                extension: None,
            }));
            let len = slot.len();
            slot.copy_within(length..len, 0);
            slot.truncate(len - length);
        }

        if slot.is_empty() {
            ctx.pool.release(slot);
            self.maybe_end_reply(ctx, trace_id, authorization);
        } else {
            self.encode_slot = Some(slot);
        }
    }

    /// End the reply direction once everything is drained and nothing
    /// remains to produce more output.
    fn maybe_end_reply(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        if self.sessions.is_empty() && self.decoder == DecodeMode::IgnoreAll {
            self.do_network_end_if_necessary(ctx, trace_id, authorization);
        }
    }

    fn on_network_end(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        self.life.initial.close();
        if self.decode_slot.is_none() {
            self.cleanup_streams(ctx, trace_id, authorization);
            self.do_network_end_if_necessary(ctx, trace_id, authorization);
        }
        self.decoder = DecodeMode::IgnoreAll;
    }

    fn on_network_abort(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        self.life.initial.close();
        self.decoder = DecodeMode::IgnoreAll;
        self.cleanup_network(ctx, trace_id, authorization);
    }

    fn on_network_window(&mut self, ctx: &mut EngineContext<'_>, window: &Window) {
        self.life.reply.open();
        self.reply_budget += i64::from(window.credit);
        self.reply_padding = window.padding;

        self.flush_encode_slot(ctx, window.authorization);

        // Re-derive the shared reply budget: the narrowest session
        // window bounds how much the links may collectively produce.
        let min_remote = self
            .sessions
            .values()
            .map(|session| session.windows.remote_incoming_window)
            .min();
        let shared_max = match min_remote {
            Some(min) => (min.max(0) * i64::from(self.max_frame_size)).min(self.reply_budget),
            None => self.reply_budget,
        };
        let pending = self.encode_slot.as_ref().map_or(0, |slot| slot.len() as i64);
        let shared_credit = shared_max - self.reply_shared_budget.max(0) - pending;
        if shared_credit > 0
            && let Some(index) = self.creditor_index
        {
            ctx.creditor
                .credit(window.trace_id, index, shared_credit as u64);
            self.reply_shared_budget += shared_credit;
        }
    }

    fn on_network_reset(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        self.life.reply.close();
        self.release_creditor(ctx);
        if let Some(slot) = self.encode_slot.take() {
            ctx.pool.release(slot);
        }
        self.cleanup_streams(ctx, trace_id, authorization);
        self.do_network_reset_if_necessary(ctx, trace_id, authorization);
    }

    fn on_network_signal(&mut self, ctx: &mut EngineContext<'_>, trace_id: TraceId) {
        ctx.send(Message::Signal(Signal {
            route_id: self.route_id,
            stream_id: self.initial_id,
            trace_id,
        }));
    }

    fn do_network_begin(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        self.life.reply.opening();
        ctx.send(Message::Begin(crate::transport::Begin {
            route_id: self.route_id,
            stream_id: self.reply_id,
            trace_id,
            authorization,
            affinity: self.affinity,
            extension: None,
        }));
        debug_assert!(self.creditor_index.is_none());
        self.creditor_index = Some(ctx.creditor.acquire(self.shared_budget_id));
    }

    fn do_network_window(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
        credit: u32,
        padding: u32,
    ) {
        self.life.initial.open();
        self.initial_budget += i64::from(credit);
        ctx.send(Message::Window(Window {
            route_id: self.route_id,
            stream_id: self.initial_id,
            trace_id,
            authorization,
            budget_id: BudgetId::default(),
            credit,
            padding,
            minimum: 0,
        }));
    }

    fn do_network_end(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        self.life.reply.close();
        self.release_creditor(ctx);
        if let Some(slot) = self.encode_slot.take() {
            ctx.pool.release(slot);
        }
        ctx.send(Message::End(End {
            route_id: self.route_id,
            stream_id: self.reply_id,
            trace_id,
            authorization,
        }));
    }

    fn do_network_abort(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        self.life.reply.close();
        self.release_creditor(ctx);
        if let Some(slot) = self.encode_slot.take() {
            ctx.pool.release(slot);
        }
        ctx.send(Message::Abort(Abort {
            route_id: self.route_id,
            stream_id: self.reply_id,
            trace_id,
            authorization,
        }));
    }

    fn do_network_reset(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        self.life.initial.close();
        self.decoder = DecodeMode::IgnoreAll;
        if let Some(slot) = self.decode_slot.take() {
            ctx.pool.release(slot);
        }
        ctx.send(Message::Reset(Reset {
            route_id: self.route_id,
            stream_id: self.initial_id,
            trace_id,
            authorization,
        }));
    }

    fn do_network_end_if_necessary(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        if !self.life.reply.is_closed() {
            self.do_network_end(ctx, trace_id, authorization);
        }
    }

    fn do_network_abort_if_necessary(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        if !self.life.reply.is_closed() {
            self.do_network_abort(ctx, trace_id, authorization);
        }
    }

    fn do_network_reset_if_necessary(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        if !self.life.initial.is_closed() {
            self.do_network_reset(ctx, trace_id, authorization);
        }
    }

    /// Full teardown: abort and reset whatever is still open on both
    /// directions and every owned stream. Safe to repeat.
    fn cleanup_network(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        if let Some(slot) = self.decode_slot.take() {
            ctx.pool.release(slot);
        }
        self.cleanup_streams(ctx, trace_id, authorization);
        self.do_network_reset_if_necessary(ctx, trace_id, authorization);
        self.do_network_abort_if_necessary(ctx, trace_id, authorization);
    }

    fn cleanup_streams(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        for session in self.sessions.values_mut() {
            session.cleanup(ctx, trace_id, authorization);
        }
    }

    fn release_creditor(&mut self, ctx: &mut EngineContext<'_>) {
        if let Some(index) = self.creditor_index.take() {
            ctx.creditor.release(index);
        }
    }
}
