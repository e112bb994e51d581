//! Hub and leaf overlay networking for PYXNet.
//!
//! ## Overlay Design
//!
//! A PYXNet network is made of **hubs**, which connect to each other and
//! relay traffic, and **leaves**, which attach to one or more hubs to publish
//! and search for content. Every node runs the same [`Node`], and can be
//! promoted to a hub or demoted to a leaf while it runs.
//!
//! ### Connections
//!
//! Each connection is handled by a distinct [`peer::Connection`] task, which
//! answers pings, records the remote node's info, hub list and query filter,
//! and passes every other message to the node. A [`ConnectionManager`] sorts
//! connections into pools after a [`ConnectionRequest`]/[`ConnectionResponse`]
//! handshake:
//!
//! - pending connections are waiting for the handshake,
//! - persistent connections carry gossip and queries,
//! - temporary connections are opened by this node for one exchange, and are
//!   closed once they are no longer held,
//! - volatile connections were opened by the remote node for one exchange.
//!
//! The manager makes at most one connection attempt to each node at a time,
//! skips nodes that were recently unreachable, and asks nodes that cannot be
//! reached directly to connect back, by relaying a [`StackConnector`].
//!
//! ### Gossip
//!
//! Nodes advertise their [`NodeInfo`], the hubs they know about (their
//! [`HubMembership`]), and a [`QueryFilter`] of the content they can answer
//! queries about. A hub's filter also covers its persistent leaves, so hubs
//! only forward a query to the peers that may have results.
//!
//! ### Broadcasts
//!
//! Queries and message relays walk the hub graph progressively: the origin
//! tries its own hubs, then the hubs their acknowledgements suggest, until
//! one hub reports that the broadcast reached nodes that can handle it. See
//! [`broadcast`] for details.
//!
//! [`ConnectionRequest`]: protocol::message::ConnectionRequest
//! [`ConnectionResponse`]: protocol::message::ConnectionResponse
//! [`StackConnector`]: protocol::message::StackConnector

#[macro_use]
extern crate serde;
#[macro_use]
extern crate tracing;

/// Type alias to make working with boxed transport errors easier.
///
/// Note: the 'static lifetime bound means that the *type* cannot have any
/// non-'static lifetimes, (e.g., when a type contains a borrow and is
/// parameterized by 'a), *not* that the object itself has 'static lifetime.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub mod broadcast;
pub mod collaborators;
pub mod config;
pub mod constants;
pub mod events;
pub mod hub_membership;
pub mod identity;
pub mod peer;
pub mod peer_set;
pub mod protocol;
pub mod query_filter;
pub mod router;
pub mod transport;

mod gossip;
mod node;

pub use crate::{
    broadcast::{BadHubCache, MessageRelayer, Querier, QuerierEvent, SessionOutcome},
    collaborators::{MessageSecurity, NoPortMapping, NoSecurity, PortMapper, SecurityError},
    config::{Config, ConfigError},
    hub_membership::{HubList, HubMembership},
    identity::{Mode, NetworkAddress, NodeId, NodeInfo},
    node::{Node, NodeError, NodeEvent, NodeStats},
    peer::{ConnectError, Connection, HandshakeError, PeerError, SharedPeerError},
    peer_set::{ConnectionManager, PoolCounts, PoolKind},
    protocol::wire::{Tag, WireError, WireMessage},
    query_filter::{LocalQueryFilter, QueryFilter},
    router::{MessageHandler, ReceivedMessage},
    transport::{MemoryTransport, TcpTransport, Transport},
};
