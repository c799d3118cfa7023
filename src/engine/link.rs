//! One attached link: credit accounting and message fragmentation.
//!
//! A link bridges an AMQP attach to exactly one application stream
//! pair. Inbound FLOW credit is translated into a byte budget flushed
//! to the application as a WINDOW; application DATA flows back out as
//! one or more TRANSFER frames bounded by the negotiated max frame
//! size.

use bytes::BytesMut;

use super::{
    EngineContext,
    Owner,
    life::DuplexLife,
    session::SessionWindows,
};
use crate::{
    codec::{
        Attach,
        FRAME_HEADER_SIZE,
        FrameHeader,
        Performative,
        ReceiverSettleMode,
        Role,
        SenderSettleMode,
        Transfer,
        ValueHeader,
        encode_annotations,
        encode_application_properties,
        encode_performative,
        encode_properties,
        performative_size,
    },
    route::Route,
    transport::{
        Abort,
        Begin,
        BudgetId,
        Capabilities,
        Data,
        End,
        LinkExtension,
        Message,
        Reset,
        RouteId,
        StreamId,
        TraceId,
        Window,
    },
};

/// Connection-scoped facts a link needs when opening its stream pair.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LinkEnv {
    /// Initial stream id of the owning network connection.
    pub(crate) connection: StreamId,
    pub(crate) channel: u16,
    pub(crate) affinity: u64,
    pub(crate) shared_budget_id: BudgetId,
}

/// Reply ATTACH parameters handed back to the connection for encoding.
#[derive(Clone, Debug)]
pub(crate) struct AttachEcho {
    pub(crate) name: String,
    pub(crate) handle: u32,
    pub(crate) role: Role,
    pub(crate) snd_settle_mode: SenderSettleMode,
    pub(crate) rcv_settle_mode: ReceiverSettleMode,
    pub(crate) address: Option<String>,
}

/// Faults raised while translating application DATA into TRANSFER.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DataFault {
    /// The delivery overdrew the link's reply budget.
    BudgetUnderflow,
    /// Framing overhead alone exceeds the negotiated max frame size.
    Oversized,
}

/// Result of one application DATA event.
#[derive(Debug, Default)]
pub(crate) struct DataOutcome {
    /// Encoded TRANSFER frames, in order.
    pub(crate) frames: Vec<BytesMut>,
    /// Bytes to debit from the connection's shared reply budget.
    pub(crate) reserved: u32,
    /// When set, the connection must abort its network reply side.
    pub(crate) fault: Option<DataFault>,
}

/// One sender/receiver link attached within a session.
#[derive(Debug)]
pub(crate) struct Link {
    name: String,
    handle: u32,
    role: Role,
    address: Option<String>,
    snd_settle_mode: SenderSettleMode,
    rcv_settle_mode: ReceiverSettleMode,
    route_id: RouteId,
    initial_id: StreamId,
    reply_id: StreamId,
    shared_budget_id: BudgetId,
    budget_id: BudgetId,
    initial_budget: i64,
    initial_padding: u32,
    reply_budget: i64,
    delivery_count: u32,
    link_credit: u32,
    life: DuplexLife,
    capabilities: Option<Capabilities>,
}

impl Link {
    /// Open the application stream pair for a decoded ATTACH.
    ///
    /// Emits the application BEGIN carrying the link metadata and
    /// registers the reply-side correlation so the answering BEGIN
    /// finds its way back here.
    pub(crate) fn open(
        ctx: &mut EngineContext<'_>,
        env: LinkEnv,
        attach: &Attach,
        route: Route,
        trace_id: TraceId,
        authorization: u64,
    ) -> Self {
        let initial_id = ctx.ids.link_stream_id();
        let reply_id = initial_id.counterpart();
        let capabilities = Capabilities::from_role(attach.role);
        let address = match attach.role {
            Role::Receiver => attach.source.as_ref().and_then(|s| s.address.clone()),
            Role::Sender => attach.target.as_ref().and_then(|t| t.address.clone()),
        };

        let link = Self {
            name: attach.name.clone(),
            handle: attach.handle,
            role: attach.role,
            address: address.clone(),
            snd_settle_mode: attach.snd_settle_mode,
            rcv_settle_mode: attach.rcv_settle_mode,
            route_id: route.route_id,
            initial_id,
            reply_id,
            shared_budget_id: env.shared_budget_id,
            budget_id: BudgetId::default(),
            initial_budget: 0,
            initial_padding: 0,
            reply_budget: 0,
            delivery_count: 0,
            link_credit: 0,
            life: {
                let mut life = DuplexLife::default();
                life.initial.opening();
                life
            },
            capabilities: Some(capabilities),
        };

        let owner = Owner::Link {
            connection: env.connection,
            channel: env.channel,
            handle: attach.handle,
        };
        ctx.owners.insert(initial_id, owner);
        ctx.correlations.insert(reply_id, owner);

        ctx.send(Message::Begin(Begin {
            route_id: route.route_id,
            stream_id: initial_id,
            trace_id,
            authorization,
            affinity: env.affinity,
            extension: Some(LinkExtension {
                address,
                capabilities,
                sender_settle_mode: attach.snd_settle_mode,
                receiver_settle_mode: attach.rcv_settle_mode,
            }),
        }));

        link
    }

    pub(crate) const fn handle(&self) -> u32 { self.handle }

    pub(crate) const fn role(&self) -> Role { self.role }

    pub(crate) const fn capabilities(&self) -> Option<Capabilities> { self.capabilities }

    /// The application stream pair owned by this link.
    pub(crate) const fn stream_ids(&self) -> (StreamId, StreamId) {
        (self.initial_id, self.reply_id)
    }

    pub(crate) const fn address(&self) -> Option<&String> { self.address.as_ref() }

    pub(crate) const fn link_credit(&self) -> u32 { self.link_credit }

    pub(crate) const fn delivery_count(&self) -> u32 { self.delivery_count }

    pub(crate) const fn reply_budget(&self) -> i64 { self.reply_budget }

    /// Whether both stream directions have closed; the session removes
    /// closed links from its table.
    pub(crate) fn is_closed(&self) -> bool { self.life.is_closed() }

    /// Link-scope FLOW: recompute credit and flush the byte budget.
    ///
    /// `link_credit = delivery_count(peer) + peer_link_credit -
    /// delivery_count(self)`; our own delivery count only advances on
    /// sends, so the invariant holds against the current value.
    pub(crate) fn on_decode_flow(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
        peer_delivery_count: u32,
        peer_link_credit: u32,
        max_frame_size: u32,
        slot_capacity: usize,
    ) {
        self.link_credit = peer_delivery_count
            .wrapping_add(peer_link_credit)
            .wrapping_sub(self.delivery_count);
        self.reply_budget = i64::from(self.link_credit) * i64::from(max_frame_size);
        self.flush_reply_window(ctx, trace_id, authorization, max_frame_size, slot_capacity);
    }

    /// Advertise the reply budget to the application as a WINDOW.
    fn flush_reply_window(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
        max_frame_size: u32,
        slot_capacity: usize,
    ) {
        if !self.life.reply.is_open() {
            return;
        }
        let frames_per_slot = slot_capacity.div_ceil(max_frame_size.max(1) as usize);
        let padding = 20 * frames_per_slot + 205;
        ctx.send(Message::Window(Window {
            route_id: self.route_id,
            stream_id: self.reply_id,
            trace_id,
            authorization,
            budget_id: self.shared_budget_id,
            credit: u32::try_from(self.reply_budget.max(0)).unwrap_or(u32::MAX),
            padding: padding as u32,
            minimum: max_frame_size,
        }));
    }

    /// The application answered our BEGIN; echo the ATTACH.
    pub(crate) fn on_application_begin(
        &mut self,
        begin: &Begin,
        initial_delivery_count: u32,
    ) -> Option<AttachEcho> {
        self.life.reply.open();
        let extension = begin.extension.as_ref()?;
        self.delivery_count = initial_delivery_count;
        let role = match extension.capabilities {
            Capabilities::ReceiveOnly => Role::Sender,
            Capabilities::SendOnly => Role::Receiver,
        };
        Some(AttachEcho {
            name: self.name.clone(),
            handle: self.handle,
            role,
            snd_settle_mode: extension.sender_settle_mode,
            rcv_settle_mode: extension.receiver_settle_mode,
            address: extension.address.clone(),
        })
    }

    /// Translate one application DATA event into TRANSFER frames.
    ///
    /// The first frame of a delivery carries the delivery metadata,
    /// the encoded section set and the value header; continuations
    /// carry only handle and `more`. Section and value-header overhead
    /// is always reserved before slicing the first fragment's payload,
    /// so framing can never push the first frame past the max frame
    /// size. The loop stops (without sending) once the session's
    /// remote incoming window is exhausted.
    pub(crate) fn on_application_data(
        &mut self,
        ctx: &mut EngineContext<'_>,
        data: &Data,
        windows: &mut SessionWindows,
        channel: u16,
        max_frame_size: u32,
    ) -> DataOutcome {
        let trace_id = data.trace_id;
        let authorization = data.authorization;

        self.reply_budget -= i64::from(data.reserved);
        if self.reply_budget < 0 {
            tracing::warn!(
                handle = self.handle,
                reserved = data.reserved,
                "delivery overdrew link reply budget"
            );
            self.do_application_reset(ctx, trace_id, authorization);
            return DataOutcome {
                frames: Vec::new(),
                reserved: data.reserved,
                fault: Some(DataFault::BudgetUnderflow),
            };
        }

        let delivery = data.extension.as_ref();
        if delivery.is_some() {
            // Per-message accounting; window counters move per frame.
            self.delivery_count = self.delivery_count.wrapping_add(1);
            self.link_credit = self.link_credit.saturating_sub(1);
        }

        if delivery.is_none() && data.payload.is_empty() && !data.fin {
            return DataOutcome {
                frames: Vec::new(),
                reserved: data.reserved,
                fault: None,
            };
        }

        let max_frame = max_frame_size as usize;
        let payload = &data.payload;

        let mut sections = BytesMut::new();
        let mut value_header = None;
        if let Some(delivery) = delivery {
            encode_annotations(&delivery.annotations, &mut sections);
            encode_properties(&delivery.properties, &mut sections);
            encode_application_properties(&delivery.application_properties, &mut sections);
            value_header = Some(ValueHeader {
                value_length: (payload.len() as u32).saturating_add(delivery.deferred),
            });
        }

        let continuation_overhead = FRAME_HEADER_SIZE
            + performative_size(&Performative::Transfer(Transfer {
                handle: self.handle,
                more: true,
                ..Transfer::default()
            }));

        let mut frames = Vec::new();
        let mut offset = 0usize;
        let mut first = true;
        loop {
            if windows.remote_incoming_window <= 0 {
                tracing::warn!(
                    handle = self.handle,
                    unsent = payload.len() - offset,
                    "remote incoming window exhausted mid-delivery"
                );
                break;
            }

            let (mut transfer, overhead) = match delivery.filter(|_| first) {
                Some(delivery) => {
                    let transfer = Transfer {
                        handle: self.handle,
                        delivery_id: Some(delivery.delivery_id),
                        delivery_tag: Some(delivery.delivery_tag.clone()),
                        message_format: Some(delivery.message_format),
                        settled: Some(delivery.settled),
                        more: true,
                    };
                    let size = performative_size(&Performative::Transfer(transfer.clone()));
                    (
                        transfer,
                        FRAME_HEADER_SIZE + size + sections.len() + ValueHeader::SIZE,
                    )
                }
                None => (
                    Transfer {
                        handle: self.handle,
                        more: true,
                        ..Transfer::default()
                    },
                    continuation_overhead,
                ),
            };

            let Some(capacity) = max_frame.checked_sub(overhead).filter(|c| *c > 0 || payload.is_empty()) else {
                tracing::warn!(
                    handle = self.handle,
                    overhead,
                    max_frame,
                    "framing overhead exceeds max frame size"
                );
                self.do_application_reset(ctx, trace_id, authorization);
                return DataOutcome {
                    frames: Vec::new(),
                    reserved: data.reserved,
                    fault: Some(DataFault::Oversized),
                };
            };

            let end = (offset + capacity).min(payload.len());
            let last_slice = end == payload.len();
            transfer.more = !(last_slice && data.fin);

            let mut body = BytesMut::new();
            encode_performative(&Performative::Transfer(transfer), &mut body);
            if first {
                body.extend_from_slice(&sections);
                if let Some(header) = value_header {
                    header.encode(&mut body);
                }
            }
            body.extend_from_slice(&payload[offset..end]);

            let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
            FrameHeader {
                size: (FRAME_HEADER_SIZE + body.len()) as u32,
                doff: 2,
                frame_type: 0,
                channel,
            }
            .encode(&mut frame);
            frame.extend_from_slice(&body);
            frames.push(frame);

            windows.remote_incoming_window -= 1;
            windows.next_outgoing_id = windows.next_outgoing_id.wrapping_add(1);
            windows.outgoing_window = windows.outgoing_window.saturating_sub(1);

            offset = end;
            first = false;
            if last_slice {
                break;
            }
        }

        DataOutcome {
            frames,
            reserved: data.reserved,
            fault: None,
        }
    }

    /// The application finished its reply side cleanly. Our own
    /// direction toward it ends on the next budget grant.
    pub(crate) fn on_application_end(&mut self, _end: &End) {
        self.set_reply_closed();
        self.life.initial.closing();
    }

    /// The application aborted its reply side.
    pub(crate) fn on_application_abort(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        self.set_reply_closed();
        ctx.correlations.remove(&self.reply_id);
        self.cleanup(ctx, trace_id, authorization);
    }

    /// Budget grant for the stream flowing toward the application.
    pub(crate) fn on_application_window(
        &mut self,
        ctx: &mut EngineContext<'_>,
        window: &Window,
    ) {
        self.life.initial.open();
        self.budget_id = window.budget_id;
        self.initial_budget += i64::from(window.credit);
        self.initial_padding = window.padding;
        tracing::trace!(
            handle = self.handle,
            budget_id = %self.budget_id,
            budget = self.initial_budget,
            padding = self.initial_padding,
            "application window"
        );

        if self.life.initial.is_closing() {
            self.do_application_end(ctx, window.trace_id, window.authorization);
        }
    }

    /// The application reset the stream flowing toward it.
    pub(crate) fn on_application_reset(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        self.set_initial_closed();
        self.cleanup(ctx, trace_id, authorization);
    }

    /// Abort and reset whatever is still open; always safe to repeat.
    pub(crate) fn cleanup(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        self.do_application_abort_if_necessary(ctx, trace_id, authorization);
        self.do_application_reset_if_necessary(ctx, trace_id, authorization);
    }

    /// Drop this link's stream registrations from the engine tables.
    pub(crate) fn unregister(&self, ctx: &mut EngineContext<'_>) {
        ctx.owners.remove(&self.initial_id);
        ctx.owners.remove(&self.reply_id);
        ctx.correlations.remove(&self.reply_id);
    }

    fn do_application_end(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        self.set_initial_closed();
        ctx.send(Message::End(End {
            route_id: self.route_id,
            stream_id: self.initial_id,
            trace_id,
            authorization,
        }));
    }

    fn do_application_abort(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        self.set_initial_closed();
        ctx.send(Message::Abort(Abort {
            route_id: self.route_id,
            stream_id: self.initial_id,
            trace_id,
            authorization,
        }));
    }

    fn do_application_abort_if_necessary(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        if !self.life.initial.is_closed() {
            self.do_application_abort(ctx, trace_id, authorization);
        }
    }

    fn do_application_reset(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        self.set_reply_closed();
        ctx.send(Message::Reset(Reset {
            route_id: self.route_id,
            stream_id: self.reply_id,
            trace_id,
            authorization,
        }));
    }

    fn do_application_reset_if_necessary(
        &mut self,
        ctx: &mut EngineContext<'_>,
        trace_id: TraceId,
        authorization: u64,
    ) {
        ctx.correlations.remove(&self.reply_id);
        if !self.life.reply.is_closed() {
            self.do_application_reset(ctx, trace_id, authorization);
        }
    }

    fn set_initial_closed(&mut self) {
        self.life.initial.close();
        if self.life.is_closed() {
            self.capabilities = None;
        }
    }

    fn set_reply_closed(&mut self) {
        self.life.reply.close();
        if self.life.is_closed() {
            self.capabilities = None;
        }
    }
}
