//! Performative bodies and their described-list encodings.
//!
//! Each AMQP frame body is a described list (descriptors 0x10..0x18).
//! Only the field subsets the engine acts on are modelled; trailing
//! fields the engine never reads are skipped on decode and omitted on
//! encode. DISPOSITION, DETACH and END are recognised without a body
//! model so the decode loop can report them as unhandled.

use bytes::{Bytes, BytesMut};

use super::{
    error::CodecError,
    primitives::{Reader, Value, encode_value, trim_trailing_nulls},
};
use crate::error::ErrorCondition;

pub(crate) const DESC_OPEN: u64 = 0x10;
pub(crate) const DESC_BEGIN: u64 = 0x11;
pub(crate) const DESC_ATTACH: u64 = 0x12;
pub(crate) const DESC_FLOW: u64 = 0x13;
pub(crate) const DESC_TRANSFER: u64 = 0x14;
pub(crate) const DESC_DISPOSITION: u64 = 0x15;
pub(crate) const DESC_DETACH: u64 = 0x16;
pub(crate) const DESC_END: u64 = 0x17;
pub(crate) const DESC_CLOSE: u64 = 0x18;
pub(crate) const DESC_ERROR: u64 = 0x1d;
pub(crate) const DESC_SOURCE: u64 = 0x28;
pub(crate) const DESC_TARGET: u64 = 0x29;

/// Link direction from the peer's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The peer transfers messages to us.
    Sender,
    /// The peer receives messages from us.
    Receiver,
}

impl Role {
    /// Wire encoding: `false` = sender, `true` = receiver.
    #[must_use]
    pub const fn from_wire(flag: bool) -> Self {
        if flag { Self::Receiver } else { Self::Sender }
    }

    #[must_use]
    pub const fn to_wire(self) -> bool { matches!(self, Self::Receiver) }

    /// The role we advertise when echoing an ATTACH back.
    #[must_use]
    pub const fn reciprocal(self) -> Self {
        match self {
            Self::Sender => Self::Receiver,
            Self::Receiver => Self::Sender,
        }
    }
}

/// Sender settlement mode (ATTACH field 3).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SenderSettleMode {
    Unsettled,
    Settled,
    #[default]
    Mixed,
}

impl SenderSettleMode {
    #[must_use]
    pub const fn from_wire(value: u8) -> Self {
        match value {
            0 => Self::Unsettled,
            1 => Self::Settled,
            _ => Self::Mixed,
        }
    }

    #[must_use]
    pub const fn to_wire(self) -> u8 {
        match self {
            Self::Unsettled => 0,
            Self::Settled => 1,
            Self::Mixed => 2,
        }
    }
}

/// Receiver settlement mode (ATTACH field 4).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReceiverSettleMode {
    #[default]
    First,
    Second,
}

impl ReceiverSettleMode {
    #[must_use]
    pub const fn from_wire(value: u8) -> Self {
        if value == 1 { Self::Second } else { Self::First }
    }

    #[must_use]
    pub const fn to_wire(self) -> u8 {
        match self {
            Self::First => 0,
            Self::Second => 1,
        }
    }
}

/// OPEN performative (descriptor 0x10).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Open {
    pub container_id: String,
    pub hostname: Option<String>,
    pub max_frame_size: Option<u32>,
    pub channel_max: Option<u16>,
}

/// BEGIN performative (descriptor 0x11).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Begin {
    pub remote_channel: Option<u16>,
    pub next_outgoing_id: u32,
    pub incoming_window: u32,
    pub outgoing_window: u32,
}

/// Source or target terminus carrying only the address field.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Terminus {
    pub address: Option<String>,
}

/// ATTACH performative (descriptor 0x12).
#[derive(Clone, Debug, PartialEq)]
pub struct Attach {
    pub name: String,
    pub handle: u32,
    pub role: Role,
    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,
    pub source: Option<Terminus>,
    pub target: Option<Terminus>,
    pub initial_delivery_count: Option<u32>,
}

/// FLOW performative (descriptor 0x13).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Flow {
    pub next_incoming_id: Option<u32>,
    pub incoming_window: u32,
    pub next_outgoing_id: u32,
    pub outgoing_window: u32,
    pub handle: Option<u32>,
    pub delivery_count: Option<u32>,
    pub link_credit: Option<u32>,
}

/// TRANSFER performative (descriptor 0x14).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Transfer {
    pub handle: u32,
    pub delivery_id: Option<u32>,
    pub delivery_tag: Option<Bytes>,
    pub message_format: Option<u32>,
    pub settled: Option<bool>,
    pub more: bool,
}

/// Error list carried on CLOSE (descriptor 0x1d).
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorList {
    pub condition: ErrorCondition,
    pub description: Option<String>,
}

/// CLOSE performative (descriptor 0x18).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Close {
    pub error: Option<ErrorList>,
}

/// A parsed frame body.
#[derive(Clone, Debug, PartialEq)]
pub enum Performative {
    Open(Open),
    Begin(Begin),
    Attach(Attach),
    Flow(Flow),
    Transfer(Transfer),
    Disposition,
    Detach,
    End,
    Close(Close),
}

impl Performative {
    /// Short name used in logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Open(_) => "open",
            Self::Begin(_) => "begin",
            Self::Attach(_) => "attach",
            Self::Flow(_) => "flow",
            Self::Transfer(_) => "transfer",
            Self::Disposition => "disposition",
            Self::Detach => "detach",
            Self::End => "end",
            Self::Close(_) => "close",
        }
    }
}

/// Positional access into a described list's fields, treating null and
/// absent uniformly.
struct Fields<'a> {
    items: &'a [Value],
    context: &'static str,
}

impl<'a> Fields<'a> {
    fn get(&self, index: usize) -> Option<&'a Value> {
        self.items.get(index).filter(|value| !value.is_null())
    }

    fn require(&self, index: usize, field: &'static str) -> Result<&'a Value, CodecError> {
        self.get(index).ok_or(CodecError::MissingField {
            field,
            context: self.context,
        })
    }

    fn require_u32(&self, index: usize, field: &'static str) -> Result<u32, CodecError> {
        self.require(index, field)?
            .as_u32()
            .ok_or(CodecError::MissingField {
                field,
                context: self.context,
            })
    }

    fn opt_u32(&self, index: usize) -> Option<u32> { self.get(index).and_then(Value::as_u32) }

    fn opt_u16(&self, index: usize) -> Option<u16> { self.get(index).and_then(Value::as_u16) }

    fn opt_bool(&self, index: usize) -> Option<bool> { self.get(index).and_then(Value::as_bool) }

    fn opt_str(&self, index: usize) -> Option<String> {
        self.get(index).and_then(Value::as_str).map(str::to_owned)
    }
}

fn described_list(value: &Value, expected: u64) -> Option<&[Value]> {
    match value {
        Value::Described(descriptor, body) if *descriptor == expected => match body.as_ref() {
            Value::List(items) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

fn parse_terminus(value: &Value, descriptor: u64) -> Option<Terminus> {
    let items = described_list(value, descriptor)?;
    let fields = Fields {
        items,
        context: "terminus",
    };
    Some(Terminus {
        address: fields.opt_str(0),
    })
}

/// Parse one performative from `reader`.
///
/// # Errors
///
/// Returns a [`CodecError`] when the bytes are not a described list,
/// the descriptor is outside the performative range, or a mandatory
/// field is missing. Truncation inside a complete frame body is
/// malformed, not incomplete.
pub(crate) fn parse_performative(reader: &mut Reader<'_>) -> Result<Performative, CodecError> {
    let value = reader.value("performative")?;
    let Value::Described(descriptor, body) = value else {
        return Err(CodecError::UnexpectedConstructor {
            constructor: 0,
            context: "performative",
        });
    };
    let items: &[Value] = match body.as_ref() {
        Value::List(items) => items,
        _ => {
            return Err(CodecError::UnexpectedConstructor {
                constructor: 0,
                context: "performative body",
            });
        }
    };

    match descriptor {
        DESC_OPEN => {
            let fields = Fields {
                items,
                context: "open",
            };
            let container_id = fields
                .require(0, "container-id")?
                .as_str()
                .ok_or(CodecError::MissingField {
                    field: "container-id",
                    context: "open",
                })?
                .to_owned();
            Ok(Performative::Open(Open {
                container_id,
                hostname: fields.opt_str(1),
                max_frame_size: fields.opt_u32(2),
                channel_max: fields.opt_u16(3),
            }))
        }
        DESC_BEGIN => {
            let fields = Fields {
                items,
                context: "begin",
            };
            Ok(Performative::Begin(Begin {
                remote_channel: fields.opt_u16(0),
                next_outgoing_id: fields.require_u32(1, "next-outgoing-id")?,
                incoming_window: fields.require_u32(2, "incoming-window")?,
                outgoing_window: fields.require_u32(3, "outgoing-window")?,
            }))
        }
        DESC_ATTACH => {
            let fields = Fields {
                items,
                context: "attach",
            };
            let name = fields
                .require(0, "name")?
                .as_str()
                .ok_or(CodecError::MissingField {
                    field: "name",
                    context: "attach",
                })?
                .to_owned();
            let role = Role::from_wire(fields.opt_bool(2).ok_or(CodecError::MissingField {
                field: "role",
                context: "attach",
            })?);
            Ok(Performative::Attach(Attach {
                name,
                handle: fields.require_u32(1, "handle")?,
                role,
                snd_settle_mode: fields
                    .opt_u32(3)
                    .map_or_else(SenderSettleMode::default, |v| {
                        SenderSettleMode::from_wire(v as u8)
                    }),
                rcv_settle_mode: fields
                    .opt_u32(4)
                    .map_or_else(ReceiverSettleMode::default, |v| {
                        ReceiverSettleMode::from_wire(v as u8)
                    }),
                source: fields.get(5).and_then(|v| parse_terminus(v, DESC_SOURCE)),
                target: fields.get(6).and_then(|v| parse_terminus(v, DESC_TARGET)),
                initial_delivery_count: fields.opt_u32(9),
            }))
        }
        DESC_FLOW => {
            let fields = Fields {
                items,
                context: "flow",
            };
            Ok(Performative::Flow(Flow {
                next_incoming_id: fields.opt_u32(0),
                incoming_window: fields.require_u32(1, "incoming-window")?,
                next_outgoing_id: fields.require_u32(2, "next-outgoing-id")?,
                outgoing_window: fields.require_u32(3, "outgoing-window")?,
                handle: fields.opt_u32(4),
                delivery_count: fields.opt_u32(5),
                link_credit: fields.opt_u32(6),
            }))
        }
        DESC_TRANSFER => {
            let fields = Fields {
                items,
                context: "transfer",
            };
            Ok(Performative::Transfer(Transfer {
                handle: fields.require_u32(0, "handle")?,
                delivery_id: fields.opt_u32(1),
                delivery_tag: fields.get(2).and_then(Value::as_binary).cloned(),
                message_format: fields.opt_u32(3),
                settled: fields.opt_bool(4),
                more: fields.opt_bool(5).unwrap_or(false),
            }))
        }
        DESC_DISPOSITION => Ok(Performative::Disposition),
        DESC_DETACH => Ok(Performative::Detach),
        DESC_END => Ok(Performative::End),
        DESC_CLOSE => {
            let fields = Fields {
                items,
                context: "close",
            };
            let error = fields.get(0).and_then(|value| {
                let items = described_list(value, DESC_ERROR)?;
                let fields = Fields {
                    items,
                    context: "error",
                };
                let condition = fields
                    .get(0)
                    .and_then(Value::as_str)
                    .and_then(ErrorCondition::from_symbol)?;
                Some(ErrorList {
                    condition,
                    description: fields.opt_str(1),
                })
            });
            Ok(Performative::Close(Close { error }))
        }
        other => Err(CodecError::UnknownPerformative { descriptor: other }),
    }
}

fn terminus_value(descriptor: u64, terminus: Option<&Terminus>) -> Value {
    match terminus {
        Some(t) => {
            let fields = trim_trailing_nulls(vec![
                t.address.as_ref().map_or(Value::Null, |a| Value::Str(a.clone())),
            ]);
            Value::Described(descriptor, Box::new(Value::List(fields)))
        }
        None => Value::Null,
    }
}

fn body_fields(performative: &Performative) -> (u64, Vec<Value>) {
    match performative {
        Performative::Open(open) => (
            DESC_OPEN,
            vec![
                Value::Str(open.container_id.clone()),
                open.hostname
                    .as_ref()
                    .map_or(Value::Null, |h| Value::Str(h.clone())),
                open.max_frame_size.map_or(Value::Null, Value::Uint),
                open.channel_max.map_or(Value::Null, Value::Ushort),
            ],
        ),
        Performative::Begin(begin) => (
            DESC_BEGIN,
            vec![
                begin.remote_channel.map_or(Value::Null, Value::Ushort),
                Value::Uint(begin.next_outgoing_id),
                Value::Uint(begin.incoming_window),
                Value::Uint(begin.outgoing_window),
            ],
        ),
        Performative::Attach(attach) => (
            DESC_ATTACH,
            vec![
                Value::Str(attach.name.clone()),
                Value::Uint(attach.handle),
                Value::Bool(attach.role.to_wire()),
                Value::Ubyte(attach.snd_settle_mode.to_wire()),
                Value::Ubyte(attach.rcv_settle_mode.to_wire()),
                terminus_value(DESC_SOURCE, attach.source.as_ref()),
                terminus_value(DESC_TARGET, attach.target.as_ref()),
                Value::Null,
                Value::Null,
                attach.initial_delivery_count.map_or(Value::Null, Value::Uint),
            ],
        ),
        Performative::Flow(flow) => (
            DESC_FLOW,
            vec![
                flow.next_incoming_id.map_or(Value::Null, Value::Uint),
                Value::Uint(flow.incoming_window),
                Value::Uint(flow.next_outgoing_id),
                Value::Uint(flow.outgoing_window),
                flow.handle.map_or(Value::Null, Value::Uint),
                flow.delivery_count.map_or(Value::Null, Value::Uint),
                flow.link_credit.map_or(Value::Null, Value::Uint),
            ],
        ),
        Performative::Transfer(transfer) => (
            DESC_TRANSFER,
            vec![
                Value::Uint(transfer.handle),
                transfer.delivery_id.map_or(Value::Null, Value::Uint),
                transfer
                    .delivery_tag
                    .as_ref()
                    .map_or(Value::Null, |tag| Value::Binary(tag.clone())),
                transfer.message_format.map_or(Value::Null, Value::Uint),
                transfer.settled.map_or(Value::Null, Value::Bool),
                if transfer.more {
                    Value::Bool(true)
                } else {
                    Value::Null
                },
            ],
        ),
        Performative::Disposition => (DESC_DISPOSITION, Vec::new()),
        Performative::Detach => (DESC_DETACH, Vec::new()),
        Performative::End => (DESC_END, Vec::new()),
        Performative::Close(close) => (
            DESC_CLOSE,
            vec![close.error.as_ref().map_or(Value::Null, |error| {
                let fields = trim_trailing_nulls(vec![
                    Value::Symbol(error.condition.symbol().to_owned()),
                    error
                        .description
                        .as_ref()
                        .map_or(Value::Null, |d| Value::Str(d.clone())),
                ]);
                Value::Described(DESC_ERROR, Box::new(Value::List(fields)))
            })],
        ),
    }
}

/// Append the described-list encoding of `performative` to `dst`.
pub(crate) fn encode_performative(performative: &Performative, dst: &mut BytesMut) {
    let (descriptor, fields) = body_fields(performative);
    let body = Value::List(trim_trailing_nulls(fields));
    encode_value(&Value::Described(descriptor, Box::new(body)), dst);
}
