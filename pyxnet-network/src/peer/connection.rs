//! A single PYXNet connection: one transport stream, and the task that
//! reads and writes it.
//!
//! Each connection task owns both halves of its stream. Outbound messages
//! are queued on an unbounded channel and written in order; inbound messages
//! are dispatched through a fixed table of core message types, and anything
//! else is handed to the [`ConnectionHandler`] as a generic message.

use std::{
    collections::HashSet,
    fmt,
    hash::{Hash, Hasher},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use futures::{channel::mpsc, Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing_futures::Instrument;

use crate::{
    constants,
    hub_membership::HubList,
    identity::{NodeId, NodeInfo},
    peer::{ConnectionHandler, ConnectionStats, ErrorSlot, PeerError, SharedPeerError},
    protocol::{
        codec::Codec,
        message::{Query, QueryAcknowledgement},
        wire::{Tag, TaggedMessage, WireError, WireMessage},
    },
    query_filter::QueryFilter,
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a connection for its whole lifetime.
///
/// Ids are never reused within a process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> ConnectionId {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The remote endpoint of a connection, and which side opened it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectedAddr {
    /// This node opened the connection.
    Outbound {
        /// The endpoint we connected to.
        addr: SocketAddr,
        /// The node we expect to answer, or nil if any node will do.
        target: NodeId,
    },

    /// The remote node opened the connection.
    Inbound {
        /// The remote endpoint reported by the listener.
        addr: SocketAddr,
    },
}

impl ConnectedAddr {
    /// The remote endpoint.
    pub fn addr(&self) -> SocketAddr {
        match self {
            ConnectedAddr::Outbound { addr, .. } | ConnectedAddr::Inbound { addr } => *addr,
        }
    }

    /// Did this node open the connection?
    pub fn is_outbound(&self) -> bool {
        matches!(self, ConnectedAddr::Outbound { .. })
    }

    /// The node an outbound connection expects to reach, if known.
    pub fn target(&self) -> Option<NodeId> {
        match self {
            ConnectedAddr::Outbound { target, .. } if !target.is_nil() => Some(*target),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectedAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectedAddr::Outbound { addr, .. } => write!(f, "outbound to {}", addr),
            ConnectedAddr::Inbound { addr } => write!(f, "inbound from {}", addr),
        }
    }
}

/// The lifecycle of a connection.
///
/// ```text
/// Constructed -> Opening -> Active -> CloseRequested -> Closed
///                                  \-> Closing -------/
/// ```
///
/// Any state can also move directly to `Closed` when the stream fails.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, but the connection task has not started.
    Constructed,
    /// The stream is open, and the handshake is in progress.
    Opening,
    /// The handshake succeeded.
    Active,
    /// The remote node sent `CLOS`.
    CloseRequested,
    /// This node is closing the connection, and has queued a `CLOS`.
    Closing,
    /// The connection task has exited. Closed connections never reopen.
    Closed,
}

enum Outgoing {
    Message(WireMessage),
    Close,
}

/// What the connection task should do after dispatching a message.
enum Flow {
    Continue,
    Close,
}

struct Shared {
    state: ConnectionState,
    remote: Option<NodeInfo>,
    remote_hubs: Option<HubList>,
    remote_filter: Option<Arc<QueryFilter>>,
    /// Message types outside the dispatch table seen on this connection.
    unknown_tags: HashSet<Tag>,
    stats: ConnectionStats,
}

struct Inner {
    id: ConnectionId,
    addr: ConnectedAddr,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    shared: Mutex<Shared>,
    error_slot: ErrorSlot,
    handler: Weak<dyn ConnectionHandler>,
}

/// A handle to a live or closed connection.
///
/// Handles are cheap to clone, and compare equal if they refer to the same
/// connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Starts a connection task for `stream`, and returns its handle.
    ///
    /// Messages are delivered to `handler` for as long as it is alive.
    pub fn spawn<S>(
        stream: S,
        addr: ConnectedAddr,
        max_message_len: usize,
        handler: Weak<dyn ConnectionHandler>,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (outgoing, outgoing_rx) = mpsc::unbounded();
        let connection = Connection {
            inner: Arc::new(Inner {
                id: ConnectionId::next(),
                addr,
                outgoing,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Constructed,
                    remote: None,
                    remote_hubs: None,
                    remote_filter: None,
                    unknown_tags: HashSet::new(),
                    stats: ConnectionStats::default(),
                }),
                error_slot: ErrorSlot::default(),
                handler,
            }),
        };

        let codec = Codec::builder()
            .with_max_body_len(max_message_len)
            .finish();
        let framed = Framed::new(stream, codec);

        connection.set_state(ConnectionState::Opening);

        let span = info_span!("connection", id = %connection.id(), addr = %addr);
        tokio::spawn(
            connection
                .clone()
                .run(framed, outgoing_rx)
                .instrument(span),
        );

        connection
    }

    /// The unique id of this connection.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The remote endpoint, and which side opened the connection.
    pub fn addr(&self) -> ConnectedAddr {
        self.inner.addr
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Has the connection task exited?
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Is the connection closed, or on its way to closing?
    pub fn is_closing(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::CloseRequested | ConnectionState::Closing | ConnectionState::Closed
        )
    }

    /// The remote node info, if it has been received.
    pub fn remote_node(&self) -> Option<NodeInfo> {
        self.lock().remote.clone()
    }

    /// The remote node id, if it has been received.
    pub fn remote_id(&self) -> Option<NodeId> {
        self.lock().remote.as_ref().map(|remote| remote.id)
    }

    /// Is the remote node a hub?
    pub fn is_remote_hub(&self) -> bool {
        self.lock()
            .remote
            .as_ref()
            .map_or(false, |remote| remote.is_hub())
    }

    /// The latest hub membership snapshot from the remote node.
    pub fn remote_hubs(&self) -> Option<HubList> {
        self.lock().remote_hubs.clone()
    }

    /// The latest query filter from the remote node.
    pub fn remote_filter(&self) -> Option<Arc<QueryFilter>> {
        self.lock().remote_filter.clone()
    }

    /// A copy of the traffic statistics of this connection.
    pub fn stats(&self) -> ConnectionStats {
        self.lock().stats.clone()
    }

    /// The error that closed this connection, if it has closed.
    pub fn error(&self) -> Option<SharedPeerError> {
        self.inner.error_slot.closed_by()
    }

    /// Queues `message` to be sent.
    ///
    /// Returns `false` if the connection is closing. A message that is
    /// queued can still be lost if the connection fails before it is
    /// written.
    pub fn send(&self, message: WireMessage) -> bool {
        if self.is_closing() {
            return false;
        }

        self.inner
            .outgoing
            .unbounded_send(Outgoing::Message(message))
            .is_ok()
    }

    /// Queues a `PING`.
    pub fn ping(&self) -> bool {
        self.send(WireMessage::new(Tag::PING))
    }

    /// Sends `CLOS` and closes the connection.
    ///
    /// Closing a connection that is already closing does nothing.
    pub fn close(&self) {
        let should_close = {
            let mut shared = self.lock();
            match shared.state {
                ConnectionState::CloseRequested
                | ConnectionState::Closing
                | ConnectionState::Closed => false,
                _ => {
                    shared.state = ConnectionState::Closing;
                    true
                }
            }
        };

        if should_close {
            debug!(id = %self.id(), "closing connection");
            // If the task has already exited, there is nothing left to close.
            let _ = self.inner.outgoing.unbounded_send(Outgoing::Close);
        }
    }

    /// Marks the handshake as complete.
    ///
    /// Returns `false` if the connection is not opening.
    pub(crate) fn mark_active(&self) -> bool {
        let mut shared = self.lock();
        match shared.state {
            ConnectionState::Constructed | ConnectionState::Opening => {
                shared.state = ConnectionState::Active;
                true
            }
            _ => false,
        }
    }

    /// Stores the remote node info, returning `true` if it was not known before.
    ///
    /// Does not call the handler.
    pub(crate) fn set_remote_node(&self, info: NodeInfo) -> bool {
        self.lock().remote.replace(info).is_none()
    }

    /// Stores the remote hub membership snapshot.
    pub(crate) fn set_remote_hubs(&self, hubs: HubList) {
        self.lock().remote_hubs = Some(hubs);
    }

    fn set_state(&self, state: ConnectionState) {
        self.lock().state = state;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .expect("connection mutex should be unpoisoned")
    }

    fn handler(&self) -> Option<Arc<dyn ConnectionHandler>> {
        self.inner.handler.upgrade()
    }

    /// Consume this handle, reading and writing the stream until it closes.
    async fn run<S>(
        self,
        framed: Framed<S, Codec>,
        mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut sink, mut stream) = framed.split();
        trace!("connection task started");

        let error = loop {
            tokio::select! {
                next = outgoing.next() => match next {
                    Some(Outgoing::Message(message)) => {
                        if let Err(error) = self.write(&mut sink, message).await {
                            break error;
                        }
                    }
                    Some(Outgoing::Close) | None => {
                        // The remote node treats a closed stream the same
                        // way, so a failed CLOS is not an error.
                        let _ = self.write(&mut sink, WireMessage::new(Tag::CLOSE)).await;
                        break PeerError::ConnectionDropped;
                    }
                },
                next = stream.next() => match next {
                    Some(Ok(message)) => match self.dispatch(message) {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close) => break PeerError::CloseRequested,
                        Err(error) => break error,
                    },
                    Some(Err(error)) => break error.into(),
                    None => break PeerError::ConnectionClosed,
                },
            }
        };

        self.finish(error);
    }

    async fn write<Si>(&self, sink: &mut Si, message: WireMessage) -> Result<(), PeerError>
    where
        Si: Sink<WireMessage, Error = WireError> + Unpin,
    {
        let tag = message.tag();
        let len = message.serialized_len();

        match tokio::time::timeout(constants::SEND_TIMEOUT, sink.send(message)).await {
            Ok(Ok(())) => {
                trace!(%tag, len, "sent message");
                self.lock().stats.record_sent(tag, len);
                Ok(())
            }
            Ok(Err(error)) => Err(error.into()),
            Err(_elapsed) => Err(PeerError::ConnectionSendTimeout),
        }
    }

    fn dispatch(&self, message: WireMessage) -> Result<Flow, PeerError> {
        let tag = message.tag();
        let len = message.serialized_len();
        trace!(%tag, len, "received message");
        self.lock().stats.record_received(tag, len);

        let handler = self.handler();
        if let Some(handler) = &handler {
            handler.on_any_message(self, &message);
        }

        match tag {
            Tag::PING => {
                // Reply before anything else sees the ping.
                self.send(WireMessage::new(Tag::PONG));
                if let Some(handler) = &handler {
                    handler.on_ping(self);
                }
            }
            // Pong times are recorded in the statistics.
            Tag::PONG => {}
            Tag::NODE_INFO => {
                let info = NodeInfo::from_message(&message)?;
                let (first, has_filter) = {
                    let mut shared = self.lock();
                    let first = shared.remote.replace(info.clone()).is_none();
                    (first, shared.remote_filter.is_some())
                };

                if let Some(handler) = &handler {
                    handler.on_node_info(self, &info, first);
                    if first && has_filter {
                        handler.on_query_filter(self);
                    }
                }
            }
            Tag::KNOWN_HUB_LIST => {
                let hubs = HubList::from_message(&message)?;
                self.set_remote_hubs(hubs.clone());
                if let Some(handler) = &handler {
                    handler.on_hub_list(self, &hubs);
                }
            }
            Tag::QUERY => {
                let query = Query::from_message(&message)?;
                if let Some(handler) = &handler {
                    handler.on_query(self, query);
                }
            }
            Tag::QUERY_ACK => {
                let ack = QueryAcknowledgement::from_message(&message)?;
                if let Some(handler) = &handler {
                    handler.on_query_ack(self, ack.0);
                }
            }
            Tag::QUERY_FILTER => {
                let filter = QueryFilter::from_message(&message)?;
                self.lock().remote_filter = Some(Arc::new(filter));
                if let Some(handler) = &handler {
                    handler.on_query_filter(self);
                }
            }
            Tag::CLOSE => {
                debug!("remote node requested close");
                self.set_state(ConnectionState::CloseRequested);
                return Ok(Flow::Close);
            }
            _ => {
                let first = self.lock().unknown_tags.insert(tag);
                if let Some(handler) = &handler {
                    if first {
                        handler.on_unknown_tag(self, tag);
                    }
                    handler.on_message(self, message);
                }
            }
        }

        Ok(Flow::Continue)
    }

    fn finish(&self, error: PeerError) {
        match &error {
            PeerError::ConnectionClosed
            | PeerError::CloseRequested
            | PeerError::ConnectionDropped => debug!(kind = %error.kind(), "connection closed"),
            _ => info!(%error, "closing connection after error"),
        }

        // Only the task calls `finish`, so the slot is always empty here.
        let _ = self.inner.error_slot.close_with(error.into());
        self.set_state(ConnectionState::Closed);
        self.inner.outgoing.close_channel();

        if let Some(handler) = self.handler() {
            handler.on_closed(self);
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.lock();
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.addr)
            .field("state", &shared.state)
            .field("remote", &shared.remote)
            .finish()
    }
}
