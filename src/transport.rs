//! Message model for the internal flow-controlled transport.
//!
//! The engine does not own sockets on its application side: it
//! exchanges typed messages with the surrounding system. Streams are
//! half-duplex and identified by a [`StreamId`] whose parity encodes
//! direction — odd identifiers are connection-initiated (initial),
//! even identifiers are replies. That parity is the sole discriminator
//! used to route an inbound BEGIN to "new connection" versus "reply to
//! an outstanding correlation".

use bytes::Bytes;

use crate::codec::{Annotation, MessageProperties, ReceiverSettleMode, Role, SenderSettleMode};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            /// Return the inner `u64` representation.
            #[must_use]
            pub const fn as_u64(self) -> u64 { self.0 }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self { Self(value) }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    };
}

id_type! {
    /// Identifier of a resolved route between the engine and a peer.
    RouteId
}
id_type! {
    /// Identifier of one half-duplex stream.
    StreamId
}
id_type! {
    /// Trace correlation identifier stamped on every message.
    TraceId
}
id_type! {
    /// Identifier of a shared byte budget.
    BudgetId
}

impl StreamId {
    /// Whether this stream runs in the connection-initiated direction.
    #[must_use]
    pub const fn is_initial(self) -> bool { self.0 & 1 == 1 }

    /// Whether this stream runs in the reply direction.
    #[must_use]
    pub const fn is_reply(self) -> bool { !self.is_initial() }

    /// The paired stream flowing the other way.
    #[must_use]
    pub const fn counterpart(self) -> Self { Self(self.0 ^ 1) }
}

/// Transfer capability a link advertises toward the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capabilities {
    /// The peer only sends into the system.
    SendOnly,
    /// The peer only receives from the system.
    ReceiveOnly,
}

impl Capabilities {
    /// Map an AMQP link role onto the capability its stream needs.
    #[must_use]
    pub const fn from_role(role: Role) -> Self {
        match role {
            Role::Sender => Self::SendOnly,
            Role::Receiver => Self::ReceiveOnly,
        }
    }
}

/// Link metadata carried on an application-stream BEGIN.
#[derive(Clone, Debug, PartialEq)]
pub struct LinkExtension {
    pub address: Option<String>,
    pub capabilities: Capabilities,
    pub sender_settle_mode: SenderSettleMode,
    pub receiver_settle_mode: ReceiverSettleMode,
}

/// Delivery metadata carried on the first DATA frame of a message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeliveryExtension {
    pub delivery_id: u32,
    pub delivery_tag: Bytes,
    pub message_format: u32,
    pub settled: bool,
    /// Bytes of the delivery still to come in later DATA frames.
    pub deferred: u32,
    pub annotations: Vec<Annotation>,
    pub properties: MessageProperties,
    pub application_properties: Vec<(String, String)>,
}

/// Open a new stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Begin {
    pub route_id: RouteId,
    pub stream_id: StreamId,
    pub trace_id: TraceId,
    pub authorization: u64,
    pub affinity: u64,
    pub extension: Option<LinkExtension>,
}

/// Payload bytes on an open stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Data {
    pub route_id: RouteId,
    pub stream_id: StreamId,
    pub trace_id: TraceId,
    pub authorization: u64,
    pub budget_id: BudgetId,
    /// Bytes of budget the sender debited for this frame, padding
    /// included.
    pub reserved: u32,
    /// Whether this frame completes the in-flight message.
    pub fin: bool,
    pub payload: Bytes,
    /// Present on the first frame of a message.
    pub extension: Option<DeliveryExtension>,
}

impl Data {
    /// The delivery metadata, defaulted when the sender omitted it.
    #[must_use]
    pub fn delivery(&self) -> DeliveryExtension { self.extension.clone().unwrap_or_default() }
}

/// Orderly end of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct End {
    pub route_id: RouteId,
    pub stream_id: StreamId,
    pub trace_id: TraceId,
    pub authorization: u64,
}

/// Abrupt teardown of a stream by its sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Abort {
    pub route_id: RouteId,
    pub stream_id: StreamId,
    pub trace_id: TraceId,
    pub authorization: u64,
}

/// Budget grant flowing back against a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub route_id: RouteId,
    pub stream_id: StreamId,
    pub trace_id: TraceId,
    pub authorization: u64,
    pub budget_id: BudgetId,
    pub credit: u32,
    pub padding: u32,
    /// Smallest useful grant; a sizing hint for the sender.
    pub minimum: u32,
}

/// Abrupt teardown of a stream by its receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reset {
    pub route_id: RouteId,
    pub stream_id: StreamId,
    pub trace_id: TraceId,
    pub authorization: u64,
}

/// Out-of-band signal against a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signal {
    pub route_id: RouteId,
    pub stream_id: StreamId,
    pub trace_id: TraceId,
}

/// Any message exchanged with the internal transport.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Begin(Begin),
    Data(Data),
    End(End),
    Abort(Abort),
    Window(Window),
    Reset(Reset),
    Signal(Signal),
}

impl Message {
    /// The stream this message belongs to.
    #[must_use]
    pub const fn stream_id(&self) -> StreamId {
        match self {
            Self::Begin(m) => m.stream_id,
            Self::Data(m) => m.stream_id,
            Self::End(m) => m.stream_id,
            Self::Abort(m) => m.stream_id,
            Self::Window(m) => m.stream_id,
            Self::Reset(m) => m.stream_id,
            Self::Signal(m) => m.stream_id,
        }
    }

    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Begin(_) => "begin",
            Self::Data(_) => "data",
            Self::End(_) => "end",
            Self::Abort(_) => "abort",
            Self::Window(_) => "window",
            Self::Reset(_) => "reset",
            Self::Signal(_) => "signal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::StreamId;

    #[test]
    fn stream_parity_discriminates_direction() {
        assert!(StreamId(1).is_initial());
        assert!(StreamId(2).is_reply());
        assert!(!StreamId(2).is_initial());
    }

    #[test]
    fn counterpart_flips_direction_only() {
        assert_eq!(StreamId(7).counterpart(), StreamId(6));
        assert_eq!(StreamId(6).counterpart(), StreamId(7));
        assert_eq!(StreamId(7).counterpart().counterpart(), StreamId(7));
    }
}
