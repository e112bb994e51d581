//! Peer handling: one task per connection, and the errors that close them.

mod connection;
mod error;
mod handler;
mod stats;

#[cfg(test)]
mod tests;

pub use connection::{ConnectedAddr, Connection, ConnectionId, ConnectionState};
pub use error::{
    AlreadyClosed, ConnectError, ErrorSlot, HandshakeError, PeerError, SharedPeerError,
};
pub use handler::ConnectionHandler;
pub use stats::{ConnectionStats, TrafficCounts};
