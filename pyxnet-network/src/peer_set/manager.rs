//! Opens, accepts, shares and closes the connections of a node.
//!
//! # Handshake
//!
//! The node that opens a connection sends a [`ConnectionRequest`], and the
//! other node answers with a [`ConnectionResponse`]. Until then, the
//! connection is in the pending pool on both sides. A successful handshake
//! moves it to the persistent pool if the initiator asked for a persistent
//! connection, and to the temporary (initiator) or volatile (responder) pool
//! otherwise.
//!
//! # Connection reuse
//!
//! [`ConnectionManager::get_connection`] makes at most one connection attempt
//! per target node at a time. Other callers wait for that attempt, then use
//! its connection.

use std::{
    collections::{HashMap, HashSet},
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};

use futures::{channel::oneshot, StreamExt};
use tokio::{task::JoinHandle, time::Instant};
use tracing_futures::Instrument;

use crate::{
    broadcast::SessionHandle,
    config::Config,
    constants,
    hub_membership::HubMembership,
    identity::{NodeId, NodeInfo},
    peer::{
        ConnectError, ConnectedAddr, Connection, ConnectionHandler, ConnectionId, HandshakeError,
    },
    peer_set::{
        holder::TimedConnectionHolder,
        pools::{PoolCounts, PoolKind, Pools},
        unreachable::UnreachableCache,
    },
    protocol::{
        message::{ConnectionRequest, ConnectionResponse},
        wire::{TaggedMessage, WireMessage},
    },
    transport::{connect_any, BoxedStream, Transport},
};

/// The node services a [`ConnectionManager`] needs.
pub trait ConnectionHost: Send + Sync + 'static {
    /// This node's current info.
    fn local_node(&self) -> NodeInfo;

    /// Called after a handshake succeeds, on either side of the connection.
    fn connection_established(&self, connection: &Connection);

    /// Asks `target` to open a persistent connection to this node, by
    /// relaying a connector message across the hub graph.
    fn connect_back(&self, target: &NodeInfo) -> Option<SessionHandle>;
}

type HandshakeResult = Result<(), HandshakeError>;

/// Marks a node as having a connection attempt in progress.
///
/// Dropping the guard ends the attempt.
struct ConnectInProgress {
    node: NodeId,
    in_progress: Arc<Mutex<HashSet<NodeId>>>,
}

impl ConnectInProgress {
    fn try_start(node: NodeId, in_progress: &Arc<Mutex<HashSet<NodeId>>>) -> Option<Self> {
        let started = in_progress
            .lock()
            .expect("mutex should be unpoisoned")
            .insert(node);

        started.then(|| ConnectInProgress {
            node,
            in_progress: in_progress.clone(),
        })
    }
}

impl Drop for ConnectInProgress {
    fn drop(&mut self) {
        self.in_progress
            .lock()
            .expect("mutex should be unpoisoned")
            .remove(&self.node);
    }
}

/// Either our turn to connect, or a connection another caller made.
enum Turn {
    Mine(ConnectInProgress),
    Found(Connection),
}

/// The connections of a node, and the handshake that sorts them into pools.
pub struct ConnectionManager {
    config: Config,
    transport: Arc<dyn Transport>,
    membership: Arc<HubMembership>,
    host: Weak<dyn ConnectionHost>,
    handler: Weak<dyn ConnectionHandler>,

    pools: Mutex<Pools>,
    /// Outbound handshakes waiting for a response.
    handshakes: Mutex<HashMap<ConnectionId, oneshot::Sender<HandshakeResult>>>,
    in_progress: Arc<Mutex<HashSet<NodeId>>>,
    unreachable: Mutex<UnreachableCache>,
    holder: Mutex<TimedConnectionHolder>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("counts", &self.counts())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl ConnectionManager {
    /// Returns a manager with empty pools.
    ///
    /// Connections deliver their messages to `handler`, which must pass
    /// connection requests and responses back to this manager.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        membership: Arc<HubMembership>,
        host: Weak<dyn ConnectionHost>,
        handler: Weak<dyn ConnectionHandler>,
    ) -> ConnectionManager {
        let unreachable = UnreachableCache::new(config.retry_connecting_hubs_timeout);

        ConnectionManager {
            config,
            transport,
            membership,
            host,
            handler,
            pools: Mutex::new(Pools::default()),
            handshakes: Mutex::new(HashMap::new()),
            in_progress: Arc::new(Mutex::new(HashSet::new())),
            unreachable: Mutex::new(unreachable),
            holder: Mutex::new(TimedConnectionHolder::default()),
            tasks: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    fn pools(&self) -> MutexGuard<'_, Pools> {
        self.pools.lock().expect("mutex should be unpoisoned")
    }

    fn local_node(&self) -> Result<NodeInfo, ConnectError> {
        self.host
            .upgrade()
            .map(|host| host.local_node())
            .ok_or(ConnectError::ShuttingDown)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Binds `addr`, and accepts connections on it until shutdown.
    ///
    /// Returns the bound address.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> io::Result<SocketAddr> {
        let listener = self.transport.listen(addr).await?;
        let local_addr = listener.local_addr;
        let mut incoming = listener.incoming;

        let manager = Arc::downgrade(self);
        let accept_loop = async move {
            while let Some(accepted) = incoming.next().await {
                let manager = match manager.upgrade() {
                    Some(manager) if !manager.is_shutting_down() => manager,
                    _ => break,
                };

                match accepted {
                    Ok((stream, addr)) => {
                        manager.accept(stream, addr);
                    }
                    Err(error) => debug!(%error, "failed to accept connection"),
                }
            }
            debug!("stopped accepting connections");
        };

        let task = tokio::spawn(accept_loop.instrument(info_span!("listen", %local_addr)));
        self.tasks
            .lock()
            .expect("mutex should be unpoisoned")
            .push(task);

        Ok(local_addr)
    }

    /// Starts a connection for an accepted `stream`, and waits for the
    /// remote node's connection request.
    ///
    /// The connection is closed if the request does not arrive within the
    /// handshake timeout.
    pub fn accept(self: &Arc<Self>, stream: BoxedStream, addr: SocketAddr) -> Connection {
        debug!(%addr, "accepted connection");

        // The request can arrive as soon as the task starts, so the
        // connection must be pending before then.
        let connection = {
            let mut pools = self.pools();
            let connection = Connection::spawn(
                stream,
                ConnectedAddr::Inbound { addr },
                self.config.max_message_len,
                self.handler.clone(),
            );
            pools.insert(PoolKind::Pending, connection.clone());
            connection
        };

        if self.is_shutting_down() {
            self.remove_connection(&connection);
            connection.close();
            return connection;
        }

        let manager = Arc::downgrade(self);
        let pending = connection.clone();
        let handshake_timeout = self.config.handshake_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(handshake_timeout).await;

            let manager = match manager.upgrade() {
                Some(manager) => manager,
                None => return,
            };
            let expired = {
                let mut pools = manager.pools();
                let expired = pools.kind_of(pending.id()) == Some(PoolKind::Pending);
                if expired {
                    pools.remove(pending.id());
                }
                expired
            };
            if expired {
                debug!(connection = %pending.id(), "inbound handshake timed out");
                pending.close();
            }
        });

        connection
    }

    /// Opens a connection to `addr`, without expecting a particular node.
    pub async fn connect(
        self: &Arc<Self>,
        addr: SocketAddr,
        persistent: bool,
    ) -> Result<Connection, ConnectError> {
        if self.is_shutting_down() {
            return Err(ConnectError::ShuttingDown);
        }

        let (stream, addr) = connect_any(
            self.transport.clone(),
            vec![addr],
            self.config.handshake_timeout,
        )
        .await
        .map_err(ConnectError::Transport)?;

        let connection = Connection::spawn(
            stream,
            ConnectedAddr::Outbound {
                addr,
                target: NodeId::nil(),
            },
            self.config.max_message_len,
            self.handler.clone(),
        );

        self.handshake(connection, NodeId::nil(), persistent).await
    }

    /// Opens a new connection to `target`, trying each of its usable endpoints.
    ///
    /// Does not reuse existing connections. See [`get_connection`](Self::get_connection).
    pub async fn connect_to(
        self: &Arc<Self>,
        target: &NodeInfo,
        persistent: bool,
    ) -> Result<Connection, ConnectError> {
        if self.is_shutting_down() {
            return Err(ConnectError::ShuttingDown);
        }

        let local = self.local_node()?;
        let candidates = target.address.connect_candidates(&local.address);
        if candidates.is_empty() {
            return Err(ConnectError::NoAddress(target.id));
        }

        let (stream, addr) = connect_any(
            self.transport.clone(),
            candidates,
            self.config.handshake_timeout,
        )
        .await
        .map_err(ConnectError::Transport)?;

        let connection = Connection::spawn(
            stream,
            ConnectedAddr::Outbound {
                addr,
                target: target.id,
            },
            self.config.max_message_len,
            self.handler.clone(),
        );

        self.handshake(connection, target.id, persistent).await
    }

    /// Sends our connection request on `connection`, and waits for the response.
    async fn handshake(
        &self,
        connection: Connection,
        target: NodeId,
        persistent: bool,
    ) -> Result<Connection, ConnectError> {
        let local = self.local_node()?;
        let (response_tx, response_rx) = oneshot::channel();

        self.handshakes
            .lock()
            .expect("mutex should be unpoisoned")
            .insert(connection.id(), response_tx);
        self.pools().insert(PoolKind::Pending, connection.clone());

        let request = ConnectionRequest {
            persistent,
            from: local,
            hubs: self.membership.snapshot(),
            target,
        };

        let result = if connection.send(request.to_message()) {
            match tokio::time::timeout(self.config.handshake_timeout, response_rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_canceled)) => Err(HandshakeError::ConnectionClosed),
                Err(elapsed) => Err(elapsed.into()),
            }
        } else {
            Err(HandshakeError::RequestNotSent)
        };

        self.handshakes
            .lock()
            .expect("mutex should be unpoisoned")
            .remove(&connection.id());

        match result {
            Ok(()) => {
                debug!(connection = %connection.id(), remote = ?connection.remote_id(), "handshake succeeded");
                Ok(connection)
            }
            Err(error) => {
                debug!(connection = %connection.id(), %error, "handshake failed");
                self.remove_connection(&connection);
                connection.close();

                if let HandshakeError::IncorrectNode { expected, .. } = &error {
                    if self.membership.remove(expected) {
                        info!(hub = %expected, "removed hub that answered with another id");
                    }
                }

                Err(error.into())
            }
        }
    }

    /// Answers the connection request that arrived on `connection`.
    pub fn on_connection_request(&self, connection: &Connection, request: ConnectionRequest) {
        let local = match self.local_node() {
            Ok(local) => local,
            Err(_) => return,
        };

        let kind = if request.persistent {
            PoolKind::Persistent
        } else {
            PoolKind::Volatile
        };

        let error = {
            let mut pools = self.pools();
            if pools.kind_of(connection.id()) != Some(PoolKind::Pending) {
                Some(HandshakeError::NodeNotPending)
            } else if !request.target.is_nil() && request.target != local.id {
                Some(HandshakeError::IncorrectNode {
                    expected: request.target,
                    actual: local.id,
                })
            } else if request.from.id == local.id {
                Some(HandshakeError::SameNode)
            } else {
                pools.transfer(connection.id(), PoolKind::Pending, kind);
                None
            }
        };

        if error.is_none() {
            connection.set_remote_node(request.from.clone());
            connection.set_remote_hubs(request.hubs.clone());
        }

        let response = ConnectionResponse {
            persistent: request.persistent,
            from: local,
            hubs: self.membership.snapshot(),
            error: error.as_ref().and_then(HandshakeError::rejection),
        };
        connection.send(response.to_message());

        match error {
            Some(error) => {
                info!(from = %request.from, %error, "refused connection request");
                self.remove_connection(connection);
                connection.close();
            }
            None => {
                debug!(from = %request.from, ?kind, "accepted connection request");
                connection.mark_active();
                self.unreachable
                    .lock()
                    .expect("mutex should be unpoisoned")
                    .remove(&request.from.id);

                if let Some(host) = self.host.upgrade() {
                    host.connection_established(connection);
                }
            }
        }
    }

    /// Completes our handshake on `connection` with the remote node's response.
    pub fn on_connection_response(&self, connection: &Connection, response: ConnectionResponse) {
        let waiting = self
            .handshakes
            .lock()
            .expect("mutex should be unpoisoned")
            .remove(&connection.id());

        let waiting = match waiting {
            Some(waiting) => waiting,
            None => {
                debug!(connection = %connection.id(), "ignoring unexpected connection response");
                return;
            }
        };

        let result = self.complete_handshake(connection, &response);
        if result.is_ok() {
            if let Some(host) = self.host.upgrade() {
                host.connection_established(connection);
            }
        }

        // The initiator may have timed out already.
        let _ = waiting.send(result);
    }

    fn complete_handshake(
        &self,
        connection: &Connection,
        response: &ConnectionResponse,
    ) -> HandshakeResult {
        let expected = connection.addr().target();
        let actual = response.from.id;

        if let Some(reason) = response.error {
            return Err(HandshakeError::from_rejection(
                reason,
                expected.unwrap_or_else(NodeId::nil),
                actual,
            ));
        }

        if let Some(expected) = expected {
            if expected != actual {
                return Err(HandshakeError::IncorrectNode { expected, actual });
            }
        }

        let local = self
            .local_node()
            .map_err(|_| HandshakeError::ConnectionClosed)?;
        if actual == local.id {
            return Err(HandshakeError::SameNode);
        }

        let kind = if response.persistent {
            PoolKind::Persistent
        } else {
            PoolKind::Temporary
        };
        if !self
            .pools()
            .transfer(connection.id(), PoolKind::Pending, kind)
        {
            return Err(HandshakeError::NodeNotPending);
        }

        connection.set_remote_node(response.from.clone());
        connection.set_remote_hubs(response.hubs.clone());
        connection.mark_active();

        if kind == PoolKind::Temporary {
            self.hold_connection(connection, self.config.temporary_connection_hold);
        }
        self.unreachable
            .lock()
            .expect("mutex should be unpoisoned")
            .remove(&actual);

        Ok(())
    }

    /// Returns a connection to `target`, reusing an existing connection if
    /// there is one.
    ///
    /// Temporary connections are only reused if `persistent_only` is unset.
    /// New connections are persistent if `persistent_only` is set.
    ///
    /// If `reverse_timeout` is not zero, and the direct connection does not
    /// succeed quickly, `target` is also asked to connect back to this node,
    /// and this waits up to `reverse_timeout` for either connection.
    #[instrument(skip(self, target), fields(node = %target))]
    pub async fn get_connection(
        self: &Arc<Self>,
        target: &NodeInfo,
        persistent_only: bool,
        reverse_timeout: Duration,
    ) -> Result<Connection, ConnectError> {
        if self.is_shutting_down() {
            return Err(ConnectError::ShuttingDown);
        }
        if target.id == self.local_node()?.id {
            return Err(HandshakeError::SameNode.into());
        }
        if let Some(connection) = self.find_connection(&target.id, persistent_only) {
            return Ok(connection);
        }

        let _in_progress = match self.wait_for_turn(target.id, persistent_only).await {
            Turn::Found(connection) => return Ok(connection),
            Turn::Mine(in_progress) => in_progress,
        };

        // Another caller may have connected while we waited.
        if let Some(connection) = self.find_connection(&target.id, persistent_only) {
            return Ok(connection);
        }

        let pending = self.pools().find_pending(&target.id);
        if let Some(pending) = pending {
            trace!(connection = %pending.id(), "waiting for pending connection");
            self.wait_for_pending(&pending).await;
            if let Some(connection) = self.find_connection(&target.id, persistent_only) {
                return Ok(connection);
            }
        }

        let now = Instant::now();
        if self
            .unreachable
            .lock()
            .expect("mutex should be unpoisoned")
            .contains(&target.id, now)
        {
            return Err(ConnectError::RecentlyUnreachable(target.id));
        }

        let result = if reverse_timeout.is_zero() {
            self.connect_to(target, persistent_only).await
        } else {
            self.connect_with_reverse_fallback(target, persistent_only, reverse_timeout)
                .await
        };

        if let Err(error) = &result {
            if !matches!(error, ConnectError::ShuttingDown) {
                debug!(%error, "marking node unreachable");
                self.unreachable
                    .lock()
                    .expect("mutex should be unpoisoned")
                    .insert(target.id, Instant::now());
            }
        }

        result
    }

    /// Waits until no other caller is connecting to `node`.
    async fn wait_for_turn(&self, node: NodeId, persistent_only: bool) -> Turn {
        loop {
            if let Some(in_progress) = ConnectInProgress::try_start(node, &self.in_progress) {
                return Turn::Mine(in_progress);
            }

            tokio::time::sleep(constants::CONNECT_IN_PROGRESS_POLL_INTERVAL).await;

            if let Some(connection) = self.find_connection(&node, persistent_only) {
                return Turn::Found(connection);
            }
        }
    }

    /// Waits until `pending` has left the pending pool, or the handshake timeout.
    async fn wait_for_pending(&self, pending: &Connection) {
        let deadline = Instant::now() + self.config.handshake_timeout;

        while Instant::now() < deadline
            && self.pools().kind_of(pending.id()) == Some(PoolKind::Pending)
        {
            tokio::time::sleep(constants::PENDING_CONNECTION_POLL_INTERVAL).await;
        }
    }

    async fn connect_with_reverse_fallback(
        self: &Arc<Self>,
        target: &NodeInfo,
        persistent: bool,
        reverse_timeout: Duration,
    ) -> Result<Connection, ConnectError> {
        let manager = self.clone();
        let direct_target = target.clone();
        let mut direct = tokio::spawn(
            async move { manager.connect_to(&direct_target, persistent).await }.in_current_span(),
        );

        let mut direct_error = None;
        let mut direct_done = false;

        // Only a direct success skips the reverse connect.
        match tokio::time::timeout(constants::REVERSE_CONNECT_HEAD_START, &mut direct).await {
            Ok(joined) => {
                direct_done = true;
                match flatten_join(joined) {
                    Ok(connection) => return Ok(connection),
                    Err(error) => {
                        debug!(%error, "direct connection failed, asking the target to connect back");
                        direct_error = Some(error);
                    }
                }
            }
            Err(_) => debug!("direct connection is slow, asking the target to connect back"),
        }

        let relay = self
            .host
            .upgrade()
            .and_then(|host| host.connect_back(target));

        let deadline = Instant::now() + reverse_timeout;

        let result = loop {
            tokio::select! {
                joined = &mut direct, if !direct_done => {
                    direct_done = true;
                    match flatten_join(joined) {
                        Ok(connection) => break Ok(connection),
                        Err(error) => {
                            debug!(%error, "direct connection failed, still waiting for reverse connection");
                            direct_error = Some(error);
                        }
                    }
                }
                _ = tokio::time::sleep(constants::REVERSE_CONNECT_POLL_INTERVAL) => {
                    if let Some(connection) = self.find_connection(&target.id, false) {
                        break Ok(connection);
                    }
                    if Instant::now() >= deadline {
                        break Err(direct_error
                            .take()
                            .unwrap_or(ConnectError::Handshake(HandshakeError::TimedOut)));
                    }
                }
            }
        };

        if let Some(relay) = relay {
            relay.stop();
        }
        if !direct_done {
            direct.abort();
        }

        result
    }

    /// Returns an open connection to `node`, from the persistent pool, then
    /// the temporary pool unless `persistent_only` is set.
    pub fn find_connection(&self, node: &NodeId, persistent_only: bool) -> Option<Connection> {
        let kinds: &[PoolKind] = if persistent_only {
            &[PoolKind::Persistent]
        } else {
            &[PoolKind::Persistent, PoolKind::Temporary]
        };

        self.pools().find(node, kinds)
    }

    /// Are new connection attempts to `node` skipped, because an attempt
    /// failed recently?
    pub fn is_recently_unreachable(&self, node: &NodeId) -> bool {
        self.unreachable
            .lock()
            .expect("mutex should be unpoisoned")
            .contains(node, Instant::now())
    }

    /// Is there an open persistent connection to `node`?
    pub fn is_persistently_connected(&self, node: &NodeId) -> bool {
        self.pools().find(node, &[PoolKind::Persistent]).is_some()
    }

    /// The open connections in the `kind` pool.
    pub fn connections(&self, kind: PoolKind) -> Vec<Connection> {
        self.pools().connections(kind).cloned().collect()
    }

    /// The open persistent connections.
    pub fn persistent_connections(&self) -> Vec<Connection> {
        self.connections(PoolKind::Persistent)
    }

    /// The distinct hubs at the other end of established connections.
    pub fn hubs(&self) -> Vec<NodeInfo> {
        self.pools().hubs()
    }

    /// The pool holding `connection`.
    pub fn pool_of(&self, connection: &Connection) -> Option<PoolKind> {
        self.pools().kind_of(connection.id())
    }

    /// The number of connections in each pool.
    pub fn counts(&self) -> PoolCounts {
        self.pools().counts()
    }

    /// Sends `message` on every established connection, and returns the
    /// number of connections it was queued on.
    pub fn send_to_all(&self, message: &WireMessage) -> usize {
        let connections: Vec<Connection> = {
            let pools = self.pools();
            [PoolKind::Persistent, PoolKind::Temporary, PoolKind::Volatile]
                .into_iter()
                .flat_map(|kind| pools.connections(kind).cloned().collect::<Vec<_>>())
                .collect()
        };

        connections
            .iter()
            .filter(|connection| connection.send(message.clone()))
            .count()
    }

    /// Pings every connection, including pending ones.
    pub fn ping_all(&self) {
        let connections: Vec<Connection> = {
            let pools = self.pools();
            PoolKind::ALL
                .into_iter()
                .flat_map(|kind| pools.connections(kind).cloned().collect::<Vec<_>>())
                .collect()
        };

        for connection in connections {
            connection.ping();
        }
    }

    /// Removes `connection` from every pool, and forgets its handshake and holds.
    ///
    /// Returns the pool it was in.
    pub fn remove_connection(&self, connection: &Connection) -> Option<PoolKind> {
        let removed = self.pools().remove(connection.id()).map(|(kind, _)| kind);

        self.handshakes
            .lock()
            .expect("mutex should be unpoisoned")
            .remove(&connection.id());
        self.holder
            .lock()
            .expect("mutex should be unpoisoned")
            .release(connection.id());

        removed
    }

    /// Keeps a temporary `connection` open for at least `duration`.
    pub fn hold_connection(&self, connection: &Connection, duration: Duration) {
        self.holder
            .lock()
            .expect("mutex should be unpoisoned")
            .hold(connection.clone(), duration, Instant::now());
    }

    /// Stops holding `connection` open.
    pub fn release_connection(&self, connection: &Connection) -> bool {
        self.holder
            .lock()
            .expect("mutex should be unpoisoned")
            .release(connection.id())
    }

    /// Closes temporary connections that are no longer held.
    pub fn sweep_temporary_connections(&self) -> usize {
        let now = Instant::now();
        let unheld: Vec<Connection> = {
            let mut holder = self.holder.lock().expect("mutex should be unpoisoned");
            holder.take_expired(now);

            let mut pools = self.pools();
            let unheld: Vec<Connection> = pools
                .connections(PoolKind::Temporary)
                .filter(|connection| !holder.is_held(connection.id(), now))
                .cloned()
                .collect();
            for connection in &unheld {
                pools.remove(connection.id());
            }
            unheld
        };

        for connection in &unheld {
            trace!(connection = %connection.id(), "closing unheld temporary connection");
            connection.close();
        }

        unheld.len()
    }

    /// Starts the periodic sweep of temporary connections.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        let sweeper = async move {
            let mut sweep = tokio::time::interval(constants::CONNECTION_HOLD_SWEEP_INTERVAL);
            loop {
                sweep.tick().await;
                match manager.upgrade() {
                    Some(manager) if !manager.is_shutting_down() => {
                        manager.sweep_temporary_connections();
                    }
                    _ => break,
                }
            }
        };

        let task = tokio::spawn(sweeper.in_current_span());
        self.tasks
            .lock()
            .expect("mutex should be unpoisoned")
            .push(task);
    }

    /// Stops accepting connections, and closes every connection.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down connection manager");

        for task in self
            .tasks
            .lock()
            .expect("mutex should be unpoisoned")
            .drain(..)
        {
            task.abort();
        }

        // Dropping the senders fails every waiting handshake.
        self.handshakes
            .lock()
            .expect("mutex should be unpoisoned")
            .clear();
        self.holder
            .lock()
            .expect("mutex should be unpoisoned")
            .clear();

        let connections = self.pools().drain();
        for connection in connections {
            connection.close();
        }
    }
}

fn flatten_join(
    joined: Result<Result<Connection, ConnectError>, tokio::task::JoinError>,
) -> Result<Connection, ConnectError> {
    match joined {
        Ok(result) => result,
        Err(join_error) => Err(ConnectError::Transport(join_error.into())),
    }
}
