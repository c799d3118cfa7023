//! The protocol engine: one logical actor over many connections.
//!
//! [`AmqpEngine`] terminates AMQP connections carried as initial-
//! direction streams of the internal transport and bridges their links
//! to application stream pairs. It is sans-io: the caller feeds
//! inbound [`Message`]s through [`AmqpEngine::on_message`] and drains
//! outbound ones with [`AmqpEngine::poll_transmit`]. Events for one
//! connection are processed strictly in arrival order; nothing blocks.

mod connection;
mod life;
mod link;
mod session;

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use connection::AmqpConnection;

use crate::{
    codec::Role,
    config::EngineConfig,
    credit::BudgetCreditor,
    handshake::ConnectionState,
    metrics,
    pool::SlotPool,
    route::Router,
    transport::{Begin, BudgetId, Capabilities, Message, StreamId, TraceId},
};

/// Which entity consumes messages for a registered stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Owner {
    /// A network stream pair owned by a connection.
    Network { connection: StreamId },
    /// An application stream pair owned by a link.
    Link {
        connection: StreamId,
        channel: u16,
        handle: u32,
    },
}

impl Owner {
    const fn connection(self) -> StreamId {
        match self {
            Self::Network { connection } | Self::Link { connection, .. } => connection,
        }
    }
}

/// Allocates stream, trace and budget identifiers.
///
/// Link stream ids are odd (initial direction) and carved from a high
/// range so they stay clear of externally assigned network ids.
#[derive(Debug)]
pub(crate) struct IdAllocator {
    next_stream: u64,
    next_trace: u64,
    next_budget: u64,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self {
            next_stream: (1 << 62) | 1,
            next_trace: 1,
            next_budget: 1,
        }
    }
}

impl IdAllocator {
    pub(crate) fn link_stream_id(&mut self) -> StreamId {
        let id = StreamId(self.next_stream);
        self.next_stream += 2;
        id
    }

    pub(crate) fn trace_id(&mut self) -> TraceId {
        let id = TraceId(self.next_trace);
        self.next_trace += 1;
        id
    }

    fn budget_id(&mut self) -> BudgetId {
        let id = BudgetId(self.next_budget);
        self.next_budget += 1;
        id
    }
}

/// Engine facilities threaded through every event handler.
///
/// Connections, sessions and links never reach back into the engine;
/// everything they may touch during one event is borrowed here, which
/// keeps ownership of the connection table with the engine alone.
pub(crate) struct EngineContext<'a> {
    pub(crate) config: &'a EngineConfig,
    pub(crate) router: &'a dyn Router,
    pub(crate) creditor: &'a dyn BudgetCreditor,
    pub(crate) pool: &'a mut SlotPool,
    pub(crate) correlations: &'a mut HashMap<StreamId, Owner>,
    pub(crate) owners: &'a mut HashMap<StreamId, Owner>,
    pub(crate) ids: &'a mut IdAllocator,
    pub(crate) transmit: &'a mut VecDeque<Message>,
}

impl EngineContext<'_> {
    /// Queue one outbound message.
    pub(crate) fn send(&mut self, message: Message) { self.transmit.push_back(message); }
}

/// Read-only view of a session's window counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub channel: u16,
    pub next_incoming_id: u32,
    pub incoming_window: u32,
    pub next_outgoing_id: u32,
    pub outgoing_window: u32,
    pub remote_incoming_window: i64,
    pub remote_outgoing_window: i64,
}

/// Read-only view of a link's credit state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub handle: u32,
    pub role: Role,
    pub capabilities: Option<Capabilities>,
    pub delivery_count: u32,
    pub link_credit: u32,
    pub reply_budget: i64,
    pub address: Option<String>,
}

/// Server-side AMQP 1.0 protocol engine.
pub struct AmqpEngine {
    config: EngineConfig,
    router: Arc<dyn Router>,
    creditor: Arc<dyn BudgetCreditor>,
    pool: SlotPool,
    correlations: HashMap<StreamId, Owner>,
    owners: HashMap<StreamId, Owner>,
    connections: HashMap<StreamId, AmqpConnection>,
    ids: IdAllocator,
    transmit: VecDeque<Message>,
}

impl AmqpEngine {
    /// Create an engine with its collaborators.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        router: Arc<dyn Router>,
        creditor: Arc<dyn BudgetCreditor>,
    ) -> Self {
        let pool = SlotPool::new(config.slot_count, config.slot_capacity);
        Self {
            config,
            router,
            creditor,
            pool,
            correlations: HashMap::new(),
            owners: HashMap::new(),
            connections: HashMap::new(),
            ids: IdAllocator::default(),
            transmit: VecDeque::new(),
        }
    }

    /// Feed one inbound transport message into the engine.
    ///
    /// An initial-direction BEGIN for an unknown stream opens a new
    /// connection; a reply-direction BEGIN resolves a pending
    /// correlation. Anything else for an unknown stream is dropped.
    pub fn on_message(&mut self, message: Message) {
        let stream_id = message.stream_id();
        if let Some(owner) = self.owners.get(&stream_id).copied() {
            self.dispatch(owner, &message);
            return;
        }
        match message {
            Message::Begin(begin) if stream_id.is_initial() => self.accept(begin),
            Message::Begin(begin) => self.correlate(begin),
            other => {
                tracing::debug!(
                    stream = %stream_id,
                    kind = other.name(),
                    "message for unknown stream"
                );
            }
        }
    }

    /// Take the next outbound message, if any.
    pub fn poll_transmit(&mut self) -> Option<Message> { self.transmit.pop_front() }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize { self.connections.len() }

    /// Number of unresolved reply correlations.
    #[must_use]
    pub fn correlation_count(&self) -> usize { self.correlations.len() }

    /// Number of reassembly slots currently lent out.
    #[must_use]
    pub fn pool_outstanding(&self) -> usize { self.pool.outstanding() }

    /// Handshake state of the connection owning `stream`, if any.
    #[must_use]
    pub fn handshake_state(&self, connection: StreamId) -> Option<ConnectionState> {
        self.connections
            .get(&connection)
            .map(AmqpConnection::handshake)
    }

    /// Window counters of one session.
    #[must_use]
    pub fn session_snapshot(&self, connection: StreamId, channel: u16) -> Option<SessionSnapshot> {
        let session = self.connections.get(&connection)?.session(channel)?;
        let windows = session.windows;
        Some(SessionSnapshot {
            channel: session.channel_id(),
            next_incoming_id: windows.next_incoming_id,
            incoming_window: windows.incoming_window,
            next_outgoing_id: windows.next_outgoing_id,
            outgoing_window: windows.outgoing_window,
            remote_incoming_window: windows.remote_incoming_window,
            remote_outgoing_window: windows.remote_outgoing_window,
        })
    }

    /// Credit state of one link.
    #[must_use]
    pub fn link_snapshot(
        &self,
        connection: StreamId,
        channel: u16,
        handle: u32,
    ) -> Option<LinkSnapshot> {
        let session = self.connections.get(&connection)?.session(channel)?;
        let link = session.links.get(&handle)?;
        Some(LinkSnapshot {
            handle: link.handle(),
            role: link.role(),
            capabilities: link.capabilities(),
            delivery_count: link.delivery_count(),
            link_credit: link.link_credit(),
            reply_budget: link.reply_budget(),
            address: link.address().cloned(),
        })
    }

    fn accept(&mut self, begin: Begin) {
        if !self.router.accepts(begin.route_id, begin.authorization) {
            tracing::debug!(route = %begin.route_id, "no route for connection");
            return;
        }
        let initial_id = begin.stream_id;
        let reply_id = initial_id.counterpart();
        let shared_budget_id = self.ids.budget_id();
        let connection = AmqpConnection::new(
            begin.route_id,
            initial_id,
            begin.affinity,
            shared_budget_id,
            self.config.max_frame_size,
        );
        let owner = Owner::Network {
            connection: initial_id,
        };
        self.owners.insert(initial_id, owner);
        self.owners.insert(reply_id, owner);
        self.connections.insert(initial_id, connection);
        metrics::inc_connections();
        tracing::info!(stream = %initial_id, route = %begin.route_id, "connection opened");

        self.dispatch(owner, &Message::Begin(begin));
    }

    fn correlate(&mut self, begin: Begin) {
        let Some(owner) = self.correlations.remove(&begin.stream_id) else {
            tracing::debug!(stream = %begin.stream_id, "reply begin without correlation");
            return;
        };
        self.owners.insert(begin.stream_id, owner);
        self.dispatch(owner, &Message::Begin(begin));
    }

    fn dispatch(&mut self, owner: Owner, message: &Message) {
        let key = owner.connection();
        let terminated = {
            let Some(connection) = self.connections.get_mut(&key) else {
                tracing::debug!(connection = %key, "owner without connection");
                return;
            };
            let mut ctx = EngineContext {
                config: &self.config,
                router: self.router.as_ref(),
                creditor: self.creditor.as_ref(),
                pool: &mut self.pool,
                correlations: &mut self.correlations,
                owners: &mut self.owners,
                ids: &mut self.ids,
                transmit: &mut self.transmit,
            };
            match owner {
                Owner::Network { .. } => connection.on_network(&mut ctx, message),
                Owner::Link {
                    channel, handle, ..
                } => connection.on_application(&mut ctx, channel, handle, message),
            }
            connection.is_terminated()
        };
        if terminated {
            self.remove_connection(key);
        }
    }

    /// Drop a terminated connection and sweep every table that might
    /// still reference it, correlations included.
    fn remove_connection(&mut self, key: StreamId) {
        let Some(mut connection) = self.connections.remove(&key) else {
            return;
        };
        connection.release_resources(&mut self.pool, self.creditor.as_ref());
        for stream in connection.owned_streams() {
            self.owners.remove(&stream);
        }
        self.owners.remove(&key);
        self.owners.remove(&key.counterpart());
        self.correlations
            .retain(|_, owner| owner.connection() != key);
        metrics::dec_connections();
        tracing::info!(stream = %key, "connection closed");
    }
}
