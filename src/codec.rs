//! AMQP 1.0 wire codec: headers, performatives and message sections.
//!
//! The codec is pure and stateless. Parsing functions take a byte
//! slice and either produce a typed view plus its consumed extent,
//! report that more bytes are needed (`Ok(None)`), or fail with a
//! [`CodecError`]; serialisers append to a caller-supplied buffer.
//! Incompleteness is never an error, which keeps the connection
//! engine's decode loop independent of how reads are chunked.

use bytes::{BufMut, Bytes, BytesMut};

pub mod error;
mod performative;
mod primitives;
mod section;

pub use error::CodecError;
pub use performative::{
    Attach,
    Begin,
    Close,
    ErrorList,
    Flow,
    Open,
    Performative,
    ReceiverSettleMode,
    Role,
    SenderSettleMode,
    Terminus,
    Transfer,
};
pub use section::{Annotation, AnnotationKey, MessageProperties, ValueHeader};

pub(crate) use performative::encode_performative;
pub(crate) use section::{
    encode_annotations,
    encode_application_properties,
    encode_properties,
};

/// Size in bytes of the fixed protocol header.
pub const PROTOCOL_HEADER_SIZE: usize = 8;

/// Size in bytes of the fixed frame header.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Size in bytes of a described-type prefix (`0x00 0x53 <code>`).
pub const DESCRIBED_PREFIX_SIZE: usize = 3;

/// The 8-byte AMQP 1.0.0 protocol header as one big-endian word.
const AMQP_1_0_HEADER: u64 = 0x414D_5150_0001_0000;

/// The fixed preamble exchanged before any frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolHeader {
    pub name: [u8; 4],
    pub id: u8,
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
}

impl ProtocolHeader {
    /// The header this server speaks: `"AMQP"` 0 1.0.0.
    pub const AMQP_1_0: Self = Self {
        name: *b"AMQP",
        id: 0,
        major: 1,
        minor: 0,
        revision: 0,
    };

    /// Parse a header from the front of `buf`; `None` if fewer than
    /// eight bytes are available. Validity is checked separately so the
    /// caller can report the received tuple.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < PROTOCOL_HEADER_SIZE {
            return None;
        }
        Some(Self {
            name: [buf[0], buf[1], buf[2], buf[3]],
            id: buf[4],
            major: buf[5],
            minor: buf[6],
            revision: buf[7],
        })
    }

    /// Whether this is exactly the AMQP 1.0.0 header, compared as a
    /// single big-endian 64-bit word.
    #[must_use]
    pub fn is_valid(self) -> bool { u64::from_be_bytes(self.to_bytes()) == AMQP_1_0_HEADER }

    /// The wire representation.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 8] {
        [
            self.name[0],
            self.name[1],
            self.name[2],
            self.name[3],
            self.id,
            self.major,
            self.minor,
            self.revision,
        ]
    }

    /// Append the wire representation to `dst`.
    pub fn encode(self, dst: &mut BytesMut) { dst.put_slice(&self.to_bytes()); }
}

/// The fixed prefix of every AMQP frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame size in bytes, header included.
    pub size: u32,
    /// Data offset in 4-byte words; the body starts at `doff * 4`.
    pub doff: u8,
    /// Frame type; 0 for AMQP frames.
    pub frame_type: u8,
    /// Channel the frame belongs to.
    pub channel: u16,
}

impl FrameHeader {
    /// Parse a frame header from the front of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidFrameHeader`] when the size or data
    /// offset is inconsistent with the fixed layout.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, CodecError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let header = Self {
            size: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            doff: buf[4],
            frame_type: buf[5],
            channel: u16::from_be_bytes([buf[6], buf[7]]),
        };
        if header.doff < 2 || header.size < u32::from(header.doff) * 4 {
            return Err(CodecError::InvalidFrameHeader {
                size: header.size,
                doff: header.doff,
            });
        }
        Ok(Some(header))
    }

    /// Append the wire representation to `dst`.
    pub fn encode(self, dst: &mut BytesMut) {
        dst.put_u32(self.size);
        dst.put_u8(self.doff);
        dst.put_u8(self.frame_type);
        dst.put_u16(self.channel);
    }
}

/// One complete frame: header fields, performative and trailing payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub channel: u16,
    pub performative: Performative,
    /// Bytes between the end of the performative and the end of the
    /// frame; the message body on TRANSFER, empty otherwise.
    pub payload: Bytes,
}

/// Attempt to parse one complete frame from the front of `buf`.
///
/// Returns the frame and the number of bytes consumed, or `Ok(None)`
/// when the buffer does not yet hold the whole frame.
///
/// # Errors
///
/// Returns a [`CodecError`] when the frame header or performative body
/// is malformed. A complete frame whose body cannot be parsed is
/// malformed, never incomplete.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, CodecError> {
    let Some(header) = FrameHeader::parse(buf)? else {
        return Ok(None);
    };
    let size = header.size as usize;
    if buf.len() < size {
        return Ok(None);
    }
    let body = &buf[usize::from(header.doff) * 4..size];
    let mut reader = primitives::Reader::new(body);
    let performative = performative::parse_performative(&mut reader)?;
    let payload = Bytes::copy_from_slice(reader.rest());
    Ok(Some((
        Frame {
            channel: header.channel,
            performative,
            payload,
        },
        size,
    )))
}

/// Serialise `performative` (plus an optional payload) as one frame and
/// append it to `dst`.
pub fn encode_frame(
    channel: u16,
    performative: &Performative,
    payload: &[u8],
    dst: &mut BytesMut,
) {
    let mut body = BytesMut::new();
    encode_performative(performative, &mut body);
    let size = FRAME_HEADER_SIZE + body.len() + payload.len();
    let header = FrameHeader {
        size: size as u32,
        doff: 2,
        frame_type: 0,
        channel,
    };
    dst.reserve(size);
    header.encode(dst);
    dst.put_slice(&body);
    dst.put_slice(payload);
}

/// Encoded size of `performative` alone, without frame header or payload.
#[must_use]
pub fn performative_size(performative: &Performative) -> usize {
    let mut body = BytesMut::new();
    encode_performative(performative, &mut body);
    body.len()
}
