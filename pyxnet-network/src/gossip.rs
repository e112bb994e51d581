//! Periodic and rate-limited gossip: pings, node info, hub lists and
//! query filters.
//!
//! Pings and node info run on fixed timers. Hub lists and filters are sent
//! when they change, but never more often than their configured interval:
//! a change inside the interval schedules one deferred send at the end of
//! it, and further changes wait for that send.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{self, Instant},
};
use tracing_futures::Instrument;

use crate::{
    config::Config,
    constants,
    hub_membership::HubMembership,
    identity::NodeInfo,
    peer::Connection,
    peer_set::{ConnectionHost, ConnectionManager},
    protocol::wire::TaggedMessage,
    router::Router,
};

#[derive(Debug, Default)]
struct GossipState {
    /// The node info last sent, and when.
    node_info_sent: Option<(NodeInfo, Instant)>,
    hub_list_sent: Option<Instant>,
    hub_list_scheduled: bool,
    filter_sent: Option<Instant>,
    filter_scheduled: bool,
}

/// Sends this node's state to its peers.
pub struct Gossip {
    ping_interval: Duration,
    node_info_interval: Duration,
    node_info_max_age: Duration,
    hub_list_interval: Duration,
    filter_interval: Duration,
    compress_filters: bool,

    host: Weak<dyn ConnectionHost>,
    manager: Arc<ConnectionManager>,
    membership: Arc<HubMembership>,
    router: Arc<Router>,

    state: Mutex<GossipState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Gossip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gossip")
            .field("state", &self.state.try_lock().ok())
            .finish()
    }
}

impl Gossip {
    /// Returns a gossip service for the node behind `host`. No timers run
    /// until [`Gossip::start`].
    pub fn new(
        config: &Config,
        host: Weak<dyn ConnectionHost>,
        manager: Arc<ConnectionManager>,
        membership: Arc<HubMembership>,
        router: Arc<Router>,
    ) -> Gossip {
        Gossip {
            ping_interval: config.ping_interval,
            node_info_interval: config.node_info_interval,
            node_info_max_age: config.node_info_max_age,
            hub_list_interval: config.hub_list_interval,
            filter_interval: config.query_filter_interval,
            compress_filters: config.compress_query_filters,
            host,
            manager,
            membership,
            router,
            state: Mutex::new(GossipState::default()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, GossipState> {
        self.state.lock().expect("mutex should be unpoisoned")
    }

    fn local_node(&self) -> Option<NodeInfo> {
        self.host.upgrade().map(|host| host.local_node())
    }

    fn push_task(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().expect("mutex should be unpoisoned");
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    /// Starts the ping and node info timers.
    pub fn start(self: &Arc<Self>) {
        let gossip = Arc::downgrade(self);
        let ping_interval = self.ping_interval;
        let pings = async move {
            let mut timer = time::interval_at(Instant::now() + ping_interval, ping_interval);
            loop {
                timer.tick().await;
                match gossip.upgrade() {
                    Some(gossip) => gossip.manager.ping_all(),
                    None => break,
                }
            }
        };
        self.push_task(tokio::spawn(pings.instrument(debug_span!("ping_timer"))));

        let gossip = Arc::downgrade(self);
        let node_info_interval = self.node_info_interval;
        let node_info = async move {
            let mut timer =
                time::interval_at(Instant::now() + node_info_interval, node_info_interval);
            loop {
                timer.tick().await;
                match gossip.upgrade() {
                    Some(gossip) => {
                        gossip.send_node_info_if_due();
                    }
                    None => break,
                }
            }
        };
        self.push_task(tokio::spawn(
            node_info.instrument(debug_span!("node_info_timer")),
        ));
    }

    /// Sends this node's info to every peer if it changed since the last
    /// send, or the last send is too old. Returns `true` if it was sent.
    pub fn send_node_info_if_due(&self) -> bool {
        let local = match self.local_node() {
            Some(local) => local,
            None => return false,
        };

        let due = match &self.state().node_info_sent {
            Some((sent, at)) => {
                !sent.same_advertisement(&local) || at.elapsed() >= self.node_info_max_age
            }
            None => true,
        };

        if due {
            self.send_node_info(local);
        }

        due
    }

    /// Sends this node's info to every peer now.
    pub fn send_node_info_now(&self) {
        if let Some(local) = self.local_node() {
            self.send_node_info(local);
        }
    }

    fn send_node_info(&self, local: NodeInfo) {
        let sent = self.manager.send_to_all(&local.to_message());
        trace!(peers = sent, "sent node info");
        self.state().node_info_sent = Some((local, Instant::now()));
    }

    /// Sends the hub list to every peer, or schedules a send if one was
    /// sent recently. Returns `true` if it was sent now.
    pub fn hub_list_changed(self: &Arc<Self>) -> bool {
        let now = Instant::now();
        let deferred_until = {
            let mut state = self.state();
            let last_sent = state.hub_list_sent;
            match last_sent {
                Some(sent) if now.duration_since(sent) < self.hub_list_interval => {
                    if state.hub_list_scheduled {
                        return false;
                    }
                    state.hub_list_scheduled = true;
                    Some(sent + self.hub_list_interval)
                }
                _ => {
                    state.hub_list_sent = Some(now);
                    None
                }
            }
        };

        match deferred_until {
            Some(deadline) => {
                trace!("deferring hub list send");
                let gossip = Arc::downgrade(self);
                let deferred = async move {
                    time::sleep_until(deadline).await;
                    if let Some(gossip) = gossip.upgrade() {
                        {
                            let mut state = gossip.state();
                            state.hub_list_scheduled = false;
                            state.hub_list_sent = Some(Instant::now());
                        }
                        gossip.send_hub_list();
                    }
                };
                self.push_task(tokio::spawn(deferred.in_current_span()));
                false
            }
            None => {
                self.send_hub_list();
                true
            }
        }
    }

    fn send_hub_list(&self) {
        let hubs = self.membership.snapshot();
        let sent = self.manager.send_to_all(&hubs.to_message());
        debug!(peers = sent, hubs = hubs.len(), "sent hub list");
    }

    /// Schedules a filter send to the persistent hubs.
    ///
    /// The send waits out the rest of the filter interval, or a short
    /// coalescing delay if the interval has passed. Changes made while a
    /// send is scheduled are included in it.
    pub fn filter_changed(self: &Arc<Self>) {
        let delay = {
            let mut state = self.state();
            if state.filter_scheduled {
                return;
            }
            state.filter_scheduled = true;

            let last_sent = state.filter_sent;
            match last_sent {
                Some(sent) if sent.elapsed() < self.filter_interval => {
                    self.filter_interval - sent.elapsed()
                }
                _ => constants::QUERY_FILTER_COALESCE_DELAY,
            }
        };

        trace!(?delay, "scheduling query filter send");
        let gossip = Arc::downgrade(self);
        let deferred = async move {
            time::sleep(delay).await;
            if let Some(gossip) = gossip.upgrade() {
                gossip.flush_filter();
            }
        };
        self.push_task(tokio::spawn(deferred.in_current_span()));
    }

    /// Is a filter send scheduled?
    pub fn is_filter_dirty(&self) -> bool {
        self.state().filter_scheduled
    }

    /// Sends a scheduled filter now, instead of waiting for its timer.
    ///
    /// Returns the number of hubs the filter was sent to, or `None` if no
    /// send was scheduled.
    pub fn flush_filter(&self) -> Option<usize> {
        {
            let mut state = self.state();
            if !state.filter_scheduled {
                return None;
            }
            state.filter_scheduled = false;
            state.filter_sent = Some(Instant::now());
        }

        Some(self.send_filter())
    }

    /// Rebuilds the amalgamated filter, and sends it to every persistent hub.
    fn send_filter(&self) -> usize {
        let local = match self.local_node() {
            Some(local) => local,
            None => return 0,
        };

        self.router.invalidate_amalgamated_filter();
        let message = self
            .router
            .amalgamated_filter(&local)
            .to_message_with(self.compress_filters);

        let sent = self
            .manager
            .persistent_connections()
            .into_iter()
            .filter(|connection| connection.is_remote_hub())
            .filter(|connection| connection.send(message.clone()))
            .count();
        debug!(hubs = sent, "sent query filter");

        sent
    }

    /// Sends this node's filter to a newly connected hub.
    pub fn send_filter_to(&self, connection: &Connection) -> bool {
        if !connection.is_remote_hub() {
            return false;
        }

        match self.local_node() {
            Some(local) => connection.send(
                self.router
                    .amalgamated_filter(&local)
                    .to_message_with(self.compress_filters),
            ),
            None => false,
        }
    }

    /// Stops every timer and deferred send.
    pub fn shutdown(&self) {
        for task in self
            .tasks
            .lock()
            .expect("mutex should be unpoisoned")
            .drain(..)
        {
            task.abort();
        }

        let mut state = self.state();
        state.hub_list_scheduled = false;
        state.filter_scheduled = false;
    }
}
