//! The public face of an overlay node.
//!
//! A [`Node`] owns the connection manager, the hub membership, the query
//! filters, the router and the gossip timers, and passes messages between
//! them. Content layers search with [`Node::query`], answer the query hits
//! they can serve with [`Node::send_query_result`], and reach nodes they are
//! not connected to with [`Node::relay`].

use std::{
    collections::HashMap,
    fmt, io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::{Duration, Instant},
};

use futures::{
    future::{BoxFuture, FutureExt},
    StreamExt,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;
use uuid::Uuid;

use crate::{
    broadcast::{BadHubCache, BroadcastHost, MessageRelayer, Querier, SessionHandle},
    collaborators::{MessageSecurity, NoPortMapping, NoSecurity, PortMapper, SecurityError},
    config::{Config, ConfigError},
    constants,
    events::{Registry, Subscription},
    gossip::Gossip,
    hub_membership::{HubList, HubMembership},
    identity::{Mode, NetworkAddress, NodeId, NodeInfo, PublicKey},
    peer::{ConnectError, Connection, ConnectionHandler, ConnectionStats},
    peer_set::{ConnectionHost, ConnectionManager, PoolCounts, PoolKind},
    protocol::{
        message::{
            Acknowledgement, ConnectionRequest, ConnectionResponse, MessageRelay, MessageRelayAck,
            Query, QueryAcknowledgement, QueryResult, SignedEnvelope, StackConnector, Status,
            StatusRequest,
        },
        wire::{Tag, TaggedMessage, WireMessage},
    },
    query_filter::{LocalQueryFilter, QueryFilter},
    router::{MessageHandler, ReceivedMessage, RelayRoute, Router},
    transport::Transport,
};

#[cfg(test)]
mod tests;

/// A node that could not be created, started or used.
#[derive(Error, Debug)]
pub enum NodeError {
    /// The config cannot run a node.
    #[error("invalid node config: {0}")]
    Config(#[from] ConfigError),

    /// The listener could not be bound.
    #[error("could not listen on {addr}: {source}")]
    Listen {
        /// The configured listen address.
        addr: SocketAddr,
        /// The transport error.
        #[source]
        source: io::Error,
    },

    /// [`Node::start`] was called twice.
    #[error("node is already started")]
    AlreadyStarted,

    /// The node was shut down.
    #[error("node is shut down")]
    ShutDown,

    /// A connection could not be made.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// A message could not be signed.
    #[error(transparent)]
    Security(#[from] SecurityError),
}

/// Something that happened to a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    /// This node became a hub.
    Promoted,
    /// This node stopped being a hub.
    Demoted,
    /// A handshake succeeded.
    ConnectionEstablished {
        /// The node at the other end.
        remote: NodeInfo,
        /// The pool the connection was placed in.
        pool: Option<PoolKind>,
    },
    /// A connection closed.
    ConnectionClosed {
        /// The node at the other end, if the handshake got that far.
        remote: Option<NodeInfo>,
        /// The pool the connection was in.
        pool: Option<PoolKind>,
    },
    /// A node answered a status request.
    StatusReceived(Status),
    /// A connection delivered a message type outside the fixed dispatch table
    /// for the first time.
    UnknownTag {
        /// The message type.
        tag: Tag,
        /// The node that sent it.
        remote: Option<NodeId>,
    },
}

/// Connection counts and traffic totals for a node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// The number of connections in each pool.
    pub pools: PoolCounts,
    /// Traffic on the open connections.
    pub traffic: ConnectionStats,
}

/// Where a message came from, and so where answers go.
#[derive(Copy, Clone, Debug)]
enum Source<'a> {
    /// The message arrived on a connection.
    Connection(&'a Connection),
    /// The message was relayed to this node by `origin`.
    Relay(&'a NodeInfo),
}

impl<'a> Source<'a> {
    fn connection(self) -> Option<&'a Connection> {
        match self {
            Source::Connection(connection) => Some(connection),
            Source::Relay(_) => None,
        }
    }
}

/// Parses `message`, closing the connection it came on if it is malformed.
fn parse<T: TaggedMessage>(source: Source<'_>, message: &WireMessage) -> Option<T> {
    match T::from_message(message) {
        Ok(value) => Some(value),
        Err(error) => {
            info!(%error, tag = %message.tag(), "dropping malformed message");
            if let Source::Connection(connection) = source {
                connection.close();
            }
            None
        }
    }
}

fn wire_count(count: usize) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

/// An overlay node.
pub struct Node {
    this: Weak<Node>,
    id: NodeId,
    config: Config,
    local: Mutex<NodeInfo>,
    started_at: Mutex<Option<Instant>>,
    started: AtomicBool,
    stopped: AtomicBool,

    security: Arc<dyn MessageSecurity>,
    port_mapper: Arc<dyn PortMapper>,

    membership: Arc<HubMembership>,
    local_filter: Arc<LocalQueryFilter>,
    manager: Arc<ConnectionManager>,
    router: Arc<Router>,
    gossip: Arc<Gossip>,
    bad_hubs: Arc<BadHubCache>,

    /// Running broadcasts started by this node, by GUID.
    broadcasts: Mutex<HashMap<Uuid, SessionHandle>>,
    events: Registry<NodeEvent>,
    query_results: Registry<QueryResult>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("manager", &self.manager)
            .field("router", &self.router)
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl Node {
    /// Returns a node that neither signs messages nor maps ports.
    ///
    /// The node does not listen or connect until [`Node::start`].
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Arc<Node>, NodeError> {
        Node::with_collaborators(
            config,
            transport,
            Arc::new(NoSecurity),
            Arc::new(NoPortMapping),
        )
    }

    /// Returns a node that uses `security` for signed messages, and
    /// `port_mapper` to find its external endpoints.
    pub fn with_collaborators(
        config: Config,
        transport: Arc<dyn Transport>,
        security: Arc<dyn MessageSecurity>,
        port_mapper: Arc<dyn PortMapper>,
    ) -> Result<Arc<Node>, NodeError> {
        config.validate()?;

        let local = NodeInfo {
            id: NodeId::new_random(),
            public_key: PublicKey::default(),
            mode: config.mode,
            hub_count: 0,
            leaf_count: 0,
            address: NetworkAddress::default(),
            friendly_name: config.friendly_name.clone(),
        };
        let id = local.id;
        let membership = Arc::new(HubMembership::new(id));
        let local_filter = Arc::new(LocalQueryFilter::new());
        let bad_hubs = Arc::new(BadHubCache::new(config.retry_connecting_hubs_timeout));

        let node = Arc::new_cyclic(|node: &Weak<Node>| {
            let host: Weak<dyn ConnectionHost> = node.clone();
            let handler: Weak<dyn ConnectionHandler> = node.clone();

            let manager = Arc::new(ConnectionManager::new(
                config.clone(),
                transport,
                membership.clone(),
                host.clone(),
                handler,
            ));
            let router = Arc::new(Router::new(
                manager.clone(),
                membership.clone(),
                local_filter.clone(),
                config.recent_query_capacity,
            ));
            let gossip = Arc::new(Gossip::new(
                &config,
                host,
                manager.clone(),
                membership.clone(),
                router.clone(),
            ));

            Node {
                this: node.clone(),
                id,
                config,
                local: Mutex::new(local),
                started_at: Mutex::new(None),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                security,
                port_mapper,
                membership,
                local_filter,
                manager,
                router,
                gossip,
                bad_hubs,
                broadcasts: Mutex::new(HashMap::new()),
                events: Registry::new(),
                query_results: Registry::new(),
                tasks: Mutex::new(Vec::new()),
            }
        });

        Ok(node)
    }

    fn local(&self) -> MutexGuard<'_, NodeInfo> {
        self.local.lock().expect("mutex should be unpoisoned")
    }

    fn broadcasts(&self) -> MutexGuard<'_, HashMap<Uuid, SessionHandle>> {
        self.broadcasts.lock().expect("mutex should be unpoisoned")
    }

    fn push_task(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().expect("mutex should be unpoisoned");
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    /// This node's current info.
    pub fn info(&self) -> NodeInfo {
        self.local().clone()
    }

    /// This node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// This node's current mode.
    pub fn mode(&self) -> Mode {
        self.local().mode
    }

    /// The config this node was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The hubs this node knows about.
    pub fn membership(&self) -> &Arc<HubMembership> {
        &self.membership
    }

    /// The filter of the content this node publishes.
    ///
    /// Changes are sent to this node's hubs after a short delay.
    pub fn local_filter(&self) -> &Arc<LocalQueryFilter> {
        &self.local_filter
    }

    /// The filter this node advertises: its own, and for a hub, those of its
    /// persistent leaves.
    pub fn query_filter(&self) -> Arc<QueryFilter> {
        self.router.amalgamated_filter(&self.info())
    }

    /// The connections of this node.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Has [`Node::start`] succeeded, without a later shutdown?
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    /// Starts listening, and starts the gossip timers.
    ///
    /// Returns the bound address. The bound address is advertised as an
    /// internal endpoint, and each endpoint the port mapper can map is
    /// advertised as an external endpoint.
    #[instrument(skip(self), fields(node = %self.id))]
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, NodeError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(NodeError::ShutDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NodeError::AlreadyStarted);
        }

        let addr = self.config.listen_addr;
        let bound = self
            .manager
            .listen(addr)
            .await
            .map_err(|source| NodeError::Listen { addr, source })?;

        let mut address = NetworkAddress::internal(bound);
        for internal in address.internal.clone() {
            if let Some(external) = self.port_mapper.map_port(internal).await {
                info!(%internal, %external, "mapped external endpoint");
                address.external.push(external);
            }
        }
        self.local().address = address;
        *self.started_at.lock().expect("mutex should be unpoisoned") = Some(Instant::now());

        self.manager.spawn_sweeper();
        self.gossip.start();

        let mut changes = self.local_filter.subscribe();
        let node = Arc::downgrade(self);
        let filter_changes = async move {
            while changes.events.next().await.is_some() {
                match node.upgrade() {
                    Some(node) => {
                        node.router.invalidate_amalgamated_filter();
                        node.gossip.filter_changed();
                    }
                    None => break,
                }
            }
        };
        self.push_task(tokio::spawn(filter_changes.in_current_span()));

        info!(%bound, mode = ?self.mode(), "node started");
        Ok(bound)
    }

    /// Stops every broadcast and timer, and closes every connection.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node = %self.id, "shutting down node");

        for (_, session) in self.broadcasts().drain() {
            session.stop();
        }
        for task in self
            .tasks
            .lock()
            .expect("mutex should be unpoisoned")
            .drain(..)
        {
            task.abort();
        }

        self.gossip.shutdown();
        self.manager.shutdown();
    }

    /// Opens a persistent connection to whatever node listens on `addr`.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<Connection, NodeError> {
        Ok(self.manager.connect(addr, true).await?)
    }

    /// Returns a connection to `node`, opening one if needed.
    pub async fn connect_to(
        self: &Arc<Self>,
        node: &NodeInfo,
        persistent: bool,
    ) -> Result<Connection, NodeError> {
        Ok(self
            .manager
            .get_connection(node, persistent, Duration::ZERO)
            .await?)
    }

    /// Changes this node's mode, and advertises the change.
    pub fn set_mode(&self, mode: Mode) {
        let previous = std::mem::replace(&mut self.local().mode, mode);
        if previous == mode {
            return;
        }
        info!(?previous, ?mode, "changed node mode");

        if mode == Mode::Hub {
            self.events.notify(NodeEvent::Promoted);
        } else if previous == Mode::Hub {
            self.events.notify(NodeEvent::Demoted);
        }

        // Leaves only advertise their own filter.
        if mode != Mode::Hub {
            self.router.invalidate_amalgamated_filter();
        }

        self.gossip.send_node_info_now();
        self.gossip.filter_changed();
    }

    /// Broadcasts a query for `contents`, and reports results until
    /// [`constants::QUERY_EXPIRY`].
    pub fn query(self: &Arc<Self>, contents: impl Into<String>) -> Querier {
        self.query_with_expiry(contents, constants::QUERY_EXPIRY)
    }

    /// Broadcasts a query for `contents`, and reports results until `expiry`.
    pub fn query_with_expiry(
        self: &Arc<Self>,
        contents: impl Into<String>,
        expiry: Duration,
    ) -> Querier {
        let query = Query::new(self.info(), contents);
        debug!(guid = %query.guid, contents = %query.contents, "starting query");

        let host: Arc<dyn BroadcastHost> = self.clone();
        let querier = Querier::start(
            query,
            host,
            self.bad_hubs.clone(),
            self.config.query_hop_timeout,
            expiry,
            self.query_results.subscribe(),
        );
        self.track_session(querier.session().clone());

        querier
    }

    /// Relays `payload` across the hub graph to `target`.
    pub fn relay(self: &Arc<Self>, target: NodeId, payload: WireMessage) -> MessageRelayer {
        let relay = MessageRelay::new(self.info(), target, payload);

        let host: Arc<dyn BroadcastHost> = self.clone();
        let relayer = MessageRelayer::start(
            relay,
            host,
            self.bad_hubs.clone(),
            self.config.relay_hop_timeout,
        );
        self.track_session(relayer.session().clone());

        relayer
    }

    fn track_session(&self, session: SessionHandle) {
        let mut broadcasts = self.broadcasts();
        broadcasts.retain(|_, running| !running.is_finished());
        broadcasts.insert(session.guid(), session);
    }

    /// Passes an acknowledgement to the broadcast it belongs to.
    fn route_acknowledgement(&self, ack: Acknowledgement) {
        let guid = ack.guid;
        let mut broadcasts = self.broadcasts();

        match broadcasts.get(&guid) {
            Some(session) => {
                if !session.acknowledge(ack) {
                    trace!(%guid, "acknowledgement for a finished broadcast");
                    broadcasts.remove(&guid);
                }
            }
            None => trace!(%guid, "acknowledgement for an unknown broadcast"),
        }
    }

    /// Sends `result` towards its query origin.
    ///
    /// Existing connections to the origin are used first. Otherwise the
    /// result is relayed, unless it requires a direct connection, in which
    /// case a temporary connection is opened and held open for a while.
    pub fn send_query_result(self: &Arc<Self>, result: QueryResult) {
        let origin = result.query_origin.clone();
        if origin.id == self.id {
            debug!(query = %result.query_guid, from = %result.result_node, "received query result");
            self.query_results.notify(result);
            return;
        }

        let message = result.to_message();
        if let Some(connection) = self.manager.find_connection(&origin.id, false) {
            if connection.send(message.clone()) {
                trace!(query = %result.query_guid, %origin, "sent query result");
                return;
            }
        }

        if !result.requires_direct_connection {
            trace!(query = %result.query_guid, %origin, "relaying query result");
            self.relay(origin.id, message);
            return;
        }

        let node = self.clone();
        let deliver = async move { node.deliver_query_result(origin, message).await };
        self.push_task(tokio::spawn(deliver.in_current_span()));
    }

    async fn deliver_query_result(self: Arc<Self>, origin: NodeInfo, message: WireMessage) {
        for attempt in 1..=constants::QUERY_RESULT_ATTEMPTS {
            match self
                .manager
                .get_connection(&origin, false, constants::QUERY_RESULT_REVERSE_TIMEOUT)
                .await
            {
                Ok(connection) => {
                    if connection.send(message.clone()) {
                        self.manager
                            .hold_connection(&connection, self.config.temporary_connection_hold);
                        debug!(%origin, attempt, "sent query result over a direct connection");
                        return;
                    }
                }
                Err(error @ ConnectError::RecentlyUnreachable(_))
                | Err(error @ ConnectError::ShuttingDown) => {
                    debug!(%origin, %error, "giving up on query result");
                    break;
                }
                Err(error) => debug!(%origin, %error, attempt, "could not connect to query origin"),
            }
        }

        warn!(%origin, "dropped query result: the query origin is unreachable");
    }

    /// Signs `message` as this node.
    pub fn sign(&self, message: &WireMessage) -> Result<WireMessage, NodeError> {
        Ok(self.security.sign(message, &self.info())?.to_message())
    }

    /// Asks `target` for its status. The answer arrives as a
    /// [`NodeEvent::StatusReceived`].
    pub fn request_status(self: &Arc<Self>, target: NodeId) {
        let request = StatusRequest.to_message();
        match self.manager.find_connection(&target, false) {
            Some(connection) if connection.send(request.clone()) => {}
            _ => {
                self.relay(target, request);
            }
        }
    }

    /// How long this node has been running.
    pub fn uptime(&self) -> Duration {
        self.started_at
            .lock()
            .expect("mutex should be unpoisoned")
            .map_or(Duration::ZERO, |started_at| started_at.elapsed())
    }

    /// A summary of this node's state.
    pub fn status(&self) -> Status {
        let counts = self.manager.counts();

        Status {
            node: self.info(),
            persistent_connections: wire_count(counts.persistent),
            temporary_connections: wire_count(counts.temporary),
            volatile_connections: wire_count(counts.volatile),
            known_hubs: wire_count(self.membership.snapshot().len()),
            uptime_secs: i64::try_from(self.uptime().as_secs()).unwrap_or(i64::MAX),
        }
    }

    /// Connection counts, and traffic totals across the open connections.
    pub fn stats(&self) -> NodeStats {
        let mut traffic = ConnectionStats::default();
        for kind in PoolKind::ALL {
            for connection in self.manager.connections(kind) {
                traffic.merge(&connection.stats());
            }
        }

        NodeStats {
            pools: self.manager.counts(),
            traffic,
        }
    }

    /// Subscribes to node events.
    pub fn subscribe(&self) -> Subscription<NodeEvent> {
        self.events.subscribe()
    }

    /// Subscribes to every query result that reaches this node as the
    /// query origin.
    pub fn subscribe_query_results(&self) -> Subscription<QueryResult> {
        self.query_results.subscribe()
    }

    /// Subscribes to queries that match this node's own filter.
    pub fn subscribe_query_hits(&self) -> Subscription<Query> {
        self.router.subscribe_query_hits()
    }

    /// Subscribes to messages with no registered handler.
    pub fn subscribe_unhandled(&self) -> Subscription<ReceivedMessage> {
        self.router.subscribe_unhandled()
    }

    /// Registers `handler` for messages tagged `tag`.
    pub fn register_handler(&self, tag: Tag, handler: MessageHandler) -> Option<MessageHandler> {
        self.router.register_handler(tag, handler)
    }

    /// Removes the handler for `tag`.
    pub fn unregister_handler(&self, tag: Tag) -> Option<MessageHandler> {
        self.router.unregister_handler(tag)
    }

    /// Adds `hubs` to the membership, and gossips the hub list if it changed.
    fn merge_hubs<'a>(&self, hubs: impl IntoIterator<Item = &'a NodeInfo>) {
        let mut changed = false;
        for hub in hubs {
            changed |= self
                .membership
                .add(hub, |id| self.manager.is_persistently_connected(id));
        }

        if changed {
            self.gossip.hub_list_changed();
        }
    }

    /// Re-counts the persistent hubs and leaves this node advertises.
    fn refresh_connection_counts(&self) {
        let (hubs, leaves) = self
            .manager
            .persistent_connections()
            .iter()
            .filter_map(Connection::remote_node)
            .fold((0, 0), |(hubs, leaves), remote| {
                if remote.is_hub() {
                    (hubs + 1, leaves)
                } else {
                    (hubs, leaves + 1)
                }
            });

        let mut local = self.local();
        local.hub_count = hubs;
        local.leaf_count = leaves;
    }

    /// Rebuilds the advertised filter after a persistent leaf changed.
    fn leaf_filters_changed(&self, remote: &NodeInfo) {
        self.router.invalidate_amalgamated_filter();
        if remote.is_leaf() && self.info().is_hub() {
            self.gossip.filter_changed();
        }
    }

    /// Delivers a relay, and returns the acknowledgement for its sender.
    fn process_relay(&self, relay: &MessageRelay) -> Acknowledgement {
        let (route, ack) = self.router.process_relay(&self.info(), relay);
        if route == RelayRoute::Local {
            self.handle_message(Source::Relay(&relay.origin), relay.payload.clone());
        }
        ack
    }

    fn reply(&self, source: Source<'_>, message: WireMessage) {
        match source {
            Source::Connection(connection) => {
                connection.send(message);
            }
            Source::Relay(origin) => {
                if let Some(node) = self.this.upgrade() {
                    node.relay(origin.id, message);
                }
            }
        }
    }

    /// Handles a message outside the connection dispatch table.
    fn handle_message(&self, source: Source<'_>, message: WireMessage) {
        match message.tag() {
            Tag::CONNECTION_REQUEST => {
                if let (Some(connection), Some(request)) = (
                    source.connection(),
                    parse::<ConnectionRequest>(source, &message),
                ) {
                    self.manager.on_connection_request(connection, request);
                }
            }
            Tag::CONNECTION_RESPONSE => {
                if let (Some(connection), Some(response)) = (
                    source.connection(),
                    parse::<ConnectionResponse>(source, &message),
                ) {
                    self.manager.on_connection_response(connection, response);
                }
            }
            Tag::QUERY_RESULT => {
                if let (Some(node), Some(result)) =
                    (self.this.upgrade(), parse::<QueryResult>(source, &message))
                {
                    node.send_query_result(result);
                }
            }
            Tag::MESSAGE_RELAY => {
                if let Some(relay) = parse::<MessageRelay>(source, &message) {
                    let ack = self.process_relay(&relay);
                    if let Some(connection) = source.connection() {
                        connection.send(MessageRelayAck(ack).to_message());
                    }
                }
            }
            Tag::MESSAGE_RELAY_ACK => {
                if let Some(MessageRelayAck(ack)) = parse::<MessageRelayAck>(source, &message) {
                    self.merge_hubs(&ack.candidates);
                    self.route_acknowledgement(ack);
                }
            }
            Tag::CONNECTOR => {
                if let (Some(node), Some(connector)) =
                    (self.this.upgrade(), parse::<StackConnector>(source, &message))
                {
                    debug!(target = %connector.node, "connecting back on request");
                    let connect = async move {
                        if let Err(error) = node
                            .manager
                            .get_connection(&connector.node, connector.persistent, Duration::ZERO)
                            .await
                        {
                            debug!(target = %connector.node, %error, "could not connect back");
                        }
                    };
                    self.push_task(tokio::spawn(connect.in_current_span()));
                }
            }
            Tag::STATUS_REQUEST => {
                if parse::<StatusRequest>(source, &message).is_some() {
                    self.reply(source, self.status().to_message());
                }
            }
            Tag::STATUS => {
                if let Some(status) = parse::<Status>(source, &message) {
                    debug!(from = %status.node, "received status");
                    self.events.notify(NodeEvent::StatusReceived(status));
                }
            }
            Tag::SIGNED => {
                if let Some(envelope) = parse::<SignedEnvelope>(source, &message) {
                    match self.security.open(&envelope) {
                        Ok(inner) => self.handle_message(source, inner),
                        Err(error) => {
                            info!(signer = %envelope.signer, %error, "rejected signed message")
                        }
                    }
                }
            }
            _ => {
                self.router.dispatch(ReceivedMessage {
                    connection: source.connection().cloned(),
                    message,
                });
            }
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ConnectionHandler for Node {
    fn on_node_info(&self, connection: &Connection, info: &NodeInfo, first: bool) {
        if first {
            trace!(remote = %info, "learned remote node info");
        }

        self.merge_hubs([info]);

        if self.manager.pool_of(connection) == Some(PoolKind::Persistent) {
            self.refresh_connection_counts();
            self.router.invalidate_amalgamated_filter();
        }
    }

    fn on_hub_list(&self, _connection: &Connection, hubs: &HubList) {
        let changed = self
            .membership
            .add_all(hubs, |id| self.manager.is_persistently_connected(id));

        if changed {
            self.gossip.hub_list_changed();
        }
    }

    fn on_query(&self, connection: &Connection, query: Query) {
        if let Some(ack) = self.router.process_query(&self.info(), &query) {
            connection.send(QueryAcknowledgement(ack).to_message());
        }
    }

    fn on_query_ack(&self, _connection: &Connection, ack: Acknowledgement) {
        self.merge_hubs(&ack.candidates);
        self.route_acknowledgement(ack);
    }

    fn on_query_filter(&self, connection: &Connection) {
        if self.manager.pool_of(connection) != Some(PoolKind::Persistent) {
            return;
        }

        if let Some(remote) = connection.remote_node() {
            self.leaf_filters_changed(&remote);
        }
    }

    fn on_unknown_tag(&self, connection: &Connection, tag: Tag) {
        self.events.notify(NodeEvent::UnknownTag {
            tag,
            remote: connection.remote_id(),
        });
    }

    fn on_message(&self, connection: &Connection, message: WireMessage) {
        self.handle_message(Source::Connection(connection), message);
    }

    fn on_closed(&self, connection: &Connection) {
        let pool = self.manager.remove_connection(connection);
        let remote = connection.remote_node();
        debug!(connection = %connection.id(), ?pool, remote = ?remote, "connection closed");

        if let Some(remote) = &remote {
            // A hub we lost the last persistent connection to moves to the known list.
            self.merge_hubs([remote]);

            if pool == Some(PoolKind::Persistent) {
                self.refresh_connection_counts();
                self.leaf_filters_changed(remote);
            }
        }

        self.events
            .notify(NodeEvent::ConnectionClosed { remote, pool });
    }
}

impl ConnectionHost for Node {
    fn local_node(&self) -> NodeInfo {
        self.info()
    }

    fn connection_established(&self, connection: &Connection) {
        let remote = match connection.remote_node() {
            Some(remote) => remote,
            None => return,
        };
        let pool = self.manager.pool_of(connection);
        debug!(connection = %connection.id(), %remote, ?pool, "connection established");

        let mut hubs = vec![remote.clone()];
        if let Some(remote_hubs) = connection.remote_hubs() {
            hubs.extend(remote_hubs.all().cloned());
        }
        self.merge_hubs(&hubs);

        if pool == Some(PoolKind::Persistent) {
            self.refresh_connection_counts();
            self.leaf_filters_changed(&remote);
            self.gossip.send_filter_to(connection);
        }

        self.events
            .notify(NodeEvent::ConnectionEstablished { remote, pool });
    }

    fn connect_back(&self, target: &NodeInfo) -> Option<SessionHandle> {
        let node = self.this.upgrade()?;
        let connector = StackConnector {
            node: self.info(),
            // Only persistent connections are found by a waiting `get_connection`.
            persistent: true,
        };

        Some(node.relay(target.id, connector.to_message()).session().clone())
    }
}

impl BroadcastHost for Node {
    fn local_node(&self) -> NodeInfo {
        self.info()
    }

    fn connected_hubs(&self) -> Vec<NodeInfo> {
        self.membership.snapshot().connected().cloned().collect()
    }

    fn send_existing(&self, hub: &NodeId, message: &WireMessage) -> bool {
        self.manager
            .find_connection(hub, true)
            .map_or(false, |connection| connection.send(message.clone()))
    }

    fn send_connecting(&self, hub: NodeInfo, message: WireMessage) -> BoxFuture<'static, bool> {
        let manager = self.manager.clone();
        async move {
            match manager.get_connection(&hub, false, Duration::ZERO).await {
                Ok(connection) => connection.send(message),
                Err(error) => {
                    debug!(%hub, %error, "could not connect to broadcast hub");
                    false
                }
            }
        }
        .boxed()
    }

    fn release(&self, hub: &NodeId) {
        if let Some(connection) = self.manager.find_connection(hub, false) {
            if self.manager.pool_of(&connection) == Some(PoolKind::Temporary) {
                self.manager.release_connection(&connection);
            }
        }
    }

    fn process_query_locally(&self, query: &Query) -> Acknowledgement {
        let local = self.info();
        self.router
            .process_query(&local, query)
            .unwrap_or_else(|| Acknowledgement::dead_end(query.guid, local, Vec::new()))
    }

    fn process_relay_locally(&self, relay: &MessageRelay) -> Acknowledgement {
        self.process_relay(relay)
    }
}
