//! Tests for peer connections.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, Weak},
};

use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

use crate::{
    constants::MAX_MESSAGE_LEN,
    hub_membership::HubList,
    identity::{NodeId, NodeInfo},
    peer::{ConnectedAddr, Connection, ConnectionHandler},
    protocol::{
        codec::Codec,
        message::{Acknowledgement, Query},
        wire::{Tag, WireMessage},
    },
};


/// A callback seen by a [`Recorder`].
#[derive(Clone, Debug, PartialEq, Eq)]
enum Recorded {
    Any(Tag),
    Ping,
    NodeInfo { id: NodeId, first: bool },
    HubList,
    Query,
    QueryAck,
    QueryFilter,
    UnknownTag(Tag),
    Message(Tag),
    Closed,
}

/// A connection handler that records every callback.
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<Recorded>>,
}

impl Recorder {
    fn record(&self, call: Recorded) {
        self.calls.lock().expect("mutex should be unpoisoned").push(call);
    }

    /// Every callback except `on_any_message`.
    fn dispatched(&self) -> Vec<Recorded> {
        self.calls
            .lock()
            .expect("mutex should be unpoisoned")
            .iter()
            .filter(|call| !matches!(call, Recorded::Any(_)))
            .cloned()
            .collect()
    }

    fn count(&self, call: &Recorded) -> usize {
        self.calls
            .lock()
            .expect("mutex should be unpoisoned")
            .iter()
            .filter(|recorded| *recorded == call)
            .count()
    }
}

impl ConnectionHandler for Recorder {
    fn on_any_message(&self, _connection: &Connection, message: &WireMessage) {
        self.record(Recorded::Any(message.tag()));
    }

    fn on_ping(&self, _connection: &Connection) {
        self.record(Recorded::Ping);
    }

    fn on_node_info(&self, _connection: &Connection, info: &NodeInfo, first: bool) {
        self.record(Recorded::NodeInfo { id: info.id, first });
    }

    fn on_hub_list(&self, _connection: &Connection, _hubs: &HubList) {
        self.record(Recorded::HubList);
    }

    fn on_query(&self, _connection: &Connection, _query: Query) {
        self.record(Recorded::Query);
    }

    fn on_query_ack(&self, _connection: &Connection, _ack: Acknowledgement) {
        self.record(Recorded::QueryAck);
    }

    fn on_query_filter(&self, _connection: &Connection) {
        self.record(Recorded::QueryFilter);
    }

    fn on_unknown_tag(&self, _connection: &Connection, tag: Tag) {
        self.record(Recorded::UnknownTag(tag));
    }

    fn on_message(&self, _connection: &Connection, message: WireMessage) {
        self.record(Recorded::Message(message.tag()));
    }

    fn on_closed(&self, _connection: &Connection) {
        self.record(Recorded::Closed);
    }
}

/// Spawns a connection over an in-memory stream, and returns it with the
/// recorder receiving its callbacks and the framed remote end of the stream.
fn new_test_connection() -> (Connection, Arc<Recorder>, Framed<DuplexStream, Codec>) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let recorder = Arc::new(Recorder::default());
    let handler: Weak<Recorder> = Arc::downgrade(&recorder);
    let handler: Weak<dyn ConnectionHandler> = handler;

    let addr = ConnectedAddr::Inbound {
        addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 4)),
    };
    let connection = Connection::spawn(local, addr, MAX_MESSAGE_LEN, handler);

    let remote = Framed::new(remote, Codec::builder().finish());

    (connection, recorder, remote)
}
