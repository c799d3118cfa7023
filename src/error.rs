//! Canonical error types for the crate.
//!
//! Wire-level failures are reported as [`crate::codec::CodecError`];
//! this module defines the protocol-level error vocabulary carried on
//! CLOSE frames and the fatal fault type used by the engine's teardown
//! paths.

use thiserror::Error;

use crate::codec::CodecError;

/// AMQP error condition carried in the error list of a CLOSE frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCondition {
    /// Malformed or out-of-sequence bytes.
    DecodeError,
    /// Well-formed but semantically invalid, such as a duplicate
    /// remote-channel or re-attaching a bound handle.
    NotAllowed,
}

impl ErrorCondition {
    /// The AMQP condition symbol for this error.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::DecodeError => "amqp:decode-error",
            Self::NotAllowed => "amqp:not-allowed",
        }
    }

    /// Parse a condition symbol back into an [`ErrorCondition`].
    #[must_use]
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "amqp:decode-error" => Some(Self::DecodeError),
            "amqp:not-allowed" => Some(Self::NotAllowed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Fatal connection faults raised while processing one event.
///
/// All variants escalate to connection teardown; none are retried.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A protocol violation that closes the connection with `condition`.
    #[error("protocol violation: {0}")]
    Protocol(ErrorCondition),
    /// The wire codec rejected inbound bytes.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// No reassembly slot could be acquired from the pool.
    #[error("reassembly slot pool exhausted")]
    SlotExhausted,
}

impl EngineError {
    /// The error condition to encode on the outgoing CLOSE, if any.
    ///
    /// Resource exhaustion has no AMQP condition; it aborts the
    /// connection without a negotiated close.
    #[must_use]
    pub const fn condition(&self) -> Option<ErrorCondition> {
        match self {
            Self::Protocol(condition) => Some(*condition),
            Self::Codec(_) => Some(ErrorCondition::DecodeError),
            Self::SlotExhausted => None,
        }
    }
}
