//! Structured errors for the AMQP wire codec.
//!
//! The codec distinguishes malformed bytes (always fatal for the
//! connection) from incompleteness, which is never an error: parsing
//! functions report `Ok(None)` when more bytes are required, so the
//! decode loop stays chunk-boundary independent.

use thiserror::Error;

/// Errors produced while parsing or serialising AMQP frames.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// A value ended before its declared extent.
    #[error("truncated {context}")]
    Truncated { context: &'static str },
    /// A type constructor the codec does not understand.
    #[error("unexpected constructor {constructor:#04x} for {context}")]
    UnexpectedConstructor {
        constructor: u8,
        context: &'static str,
    },
    /// A described value with a descriptor outside the performative set.
    #[error("unknown performative descriptor {descriptor:#x}")]
    UnknownPerformative { descriptor: u64 },
    /// A frame header whose size or data offset is inconsistent.
    #[error("invalid frame header: size {size}, doff {doff}")]
    InvalidFrameHeader { size: u32, doff: u8 },
    /// A mandatory performative field was null or absent.
    #[error("missing field {field} in {context}")]
    MissingField {
        field: &'static str,
        context: &'static str,
    },
    /// Text that is not valid UTF-8.
    #[error("invalid utf-8 in {context}")]
    InvalidUtf8 { context: &'static str },
}
