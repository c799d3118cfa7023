//! Public API for the `amqpgate` library.
//!
//! `amqpgate` terminates server-side AMQP 1.0 connections and bridges
//! them onto an internal message transport whose flow control speaks
//! budgets and windows instead of AMQP's credit. The core is the
//! sans-io [`AmqpEngine`]; [`server::AmqpServer`] supplies a TCP
//! front-end for embedders that want one.

pub mod codec;
pub mod config;
pub mod credit;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod metrics;
pub mod pool;
pub mod route;
pub mod server;
pub mod transport;

pub use codec::{CodecError, Performative, ProtocolHeader, Role};
pub use config::EngineConfig;
pub use credit::{BudgetCreditor, SharedCreditor};
pub use engine::{AmqpEngine, LinkSnapshot, SessionSnapshot};
pub use error::{EngineError, ErrorCondition};
pub use handshake::{ConnectionEvent, ConnectionState, transition};
pub use route::{Route, Router, TableRouter};
pub use transport::{Message, StreamId};
