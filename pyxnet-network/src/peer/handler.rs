//! The callbacks a connection uses to hand messages to its node.

use crate::{
    hub_membership::HubList,
    identity::NodeInfo,
    peer::Connection,
    protocol::{
        message::{Acknowledgement, Query},
        wire::{Tag, WireMessage},
    },
};

/// Receives the messages and state changes of one or more connections.
///
/// Every method runs on the connection task, in message order, so
/// implementations must not block. Long-running work should be spawned.
/// The default implementations ignore the callback.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called first for every message, before it is dispatched.
    fn on_any_message(&self, _connection: &Connection, _message: &WireMessage) {}

    /// Called after a `PING` has been answered.
    fn on_ping(&self, _connection: &Connection) {}

    /// Called when the remote node sends its info.
    ///
    /// `first` is set the first time the connection learns the remote info.
    fn on_node_info(&self, _connection: &Connection, _info: &NodeInfo, _first: bool) {}

    /// Called when the remote node sends its hub membership.
    fn on_hub_list(&self, _connection: &Connection, _hubs: &HubList) {}

    /// Called when the remote node sends a query.
    fn on_query(&self, _connection: &Connection, _query: Query) {}

    /// Called when the remote node acknowledges a query.
    fn on_query_ack(&self, _connection: &Connection, _ack: Acknowledgement) {}

    /// Called when the remote query filter changes.
    ///
    /// Also called when the remote node info arrives after the filter, so
    /// the filter can be attributed to a node.
    fn on_query_filter(&self, _connection: &Connection) {}

    /// Called the first time each message type outside the fixed dispatch
    /// table arrives on a connection.
    fn on_unknown_tag(&self, _connection: &Connection, _tag: Tag) {}

    /// Called for every message outside the fixed dispatch table.
    fn on_message(&self, _connection: &Connection, _message: WireMessage) {}

    /// Called once, after the connection has closed.
    fn on_closed(&self, _connection: &Connection) {}
}
