//! # EmberMQ
//!
//! EmberMQ is an AMQP 0-9-1 message broker written in Rust. It accepts
//! standard AMQP clients over TCP, multiplexes connections into channels,
//! routes published messages through typed exchanges to queues via bindings,
//! and delivers them to consumers under acknowledgement and flow-control
//! rules. Durable entities and persistent messages survive restarts through
//! an append-only message log plus metadata snapshots.
//!
//! ## Architecture
//!
//! - [`protocol`] - AMQP 0-9-1 wire codec (frames, field tables, content
//!   properties, method arguments)
//! - [`broker`] - TCP server, connection/channel state machines, method
//!   dispatch and the delivery engine
//! - [`entities`] - Exchange, queue, binding, consumer and message records
//! - [`routing`] - Exchange-type dispatch and the topic pattern matcher
//! - [`storage`] - Append-log persistence, snapshots and startup recovery
//! - [`events`] - Best-effort broker event stream
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use embermq::{Broker, BrokerConfig};
//!
//! #[tokio::main]
//! async fn main() -> embermq::Result<()> {
//!     let config = BrokerConfig { port: 5672, ..Default::default() };
//!     let broker = Broker::new(config)?;
//!     broker.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     broker.stop().await;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod entities;
pub mod events;
pub mod protocol;
pub mod routing;
pub mod storage;

pub use broker::{Broker, BrokerStatus, ConnectionInfo, QueueInfo};
pub use config::BrokerConfig;
pub use entities::{Binding, Consumer, Exchange, ExchangeType, Message, Queue};
pub use events::{BrokerEvent, EventBus};
pub use protocol::{BasicProperties, FieldTable, FieldValue};

use thiserror::Error;

/// Broker error types.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// File and socket I/O failures.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding failures in the persistence layer.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wire codec failures.
    #[error("codec error: {0}")]
    Codec(#[from] protocol::CodecError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Durable log corruption or storage-level failures.
    #[error("storage error: {0}")]
    Storage(String),

    /// Protocol-level failures outside the codec.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BrokerError>;
