//! Broker runtime: the TCP server, per-connection drivers, channel state,
//! method dispatch and the delivery engine.

pub mod channel;
pub mod connection;
pub mod delivery;
pub mod handler;
pub mod server;

pub use channel::{ChannelState, ConnectionId, UnackedEntry};
pub use delivery::QueueState;
pub use handler::{BrokerCore, FrameOutcome};
pub use server::{Broker, BrokerStatus, ConnectionInfo, QueueInfo};
