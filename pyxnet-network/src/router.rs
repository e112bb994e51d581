//! Query propagation, message relays and generic message dispatch.
//!
//! Hubs answer each query that reaches them from outside their own leaves
//! with an acknowledgement, forward the query to the hubs and leaves whose
//! filters match, and raise a query hit if their own filter matches.
//! Leaves only check their own filter.
//!
//! Messages outside the connection dispatch table go to the handler
//! registered for their tag, or to the unhandled subscribers.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use tracing_futures::Instrument;

use crate::{
    events::{Registry, Subscription},
    hub_membership::HubMembership,
    identity::NodeInfo,
    peer::Connection,
    peer_set::ConnectionManager,
    protocol::{
        message::{Acknowledgement, MessageRelay, Query},
        wire::{Tag, TaggedMessage, WireMessage},
    },
    query_filter::{AmalgamatedFilter, LocalQueryFilter, QueryFilter},
};

mod recent;

#[cfg(test)]
mod tests;

pub use recent::RecentQueries;

/// A message passed to a registered handler or an unhandled subscriber.
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    /// The connection the message arrived on, or `None` if it was relayed
    /// or unwrapped from a signed envelope.
    pub connection: Option<Connection>,
    /// The message.
    pub message: WireMessage,
}

/// Handles every message with a particular tag.
pub type MessageHandler = Arc<dyn Fn(ReceivedMessage) + Send + Sync + 'static>;

/// Where a relayed message went.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelayRoute {
    /// The relay is for this node, and should be delivered locally.
    Local,
    /// The relay was forwarded over a connection to its target.
    Forwarded,
    /// This node cannot reach the target.
    DeadEnd,
}

/// Routes queries, relays and generic messages for one node.
pub struct Router {
    manager: Arc<ConnectionManager>,
    membership: Arc<HubMembership>,
    local_filter: Arc<LocalQueryFilter>,
    amalgamated: AmalgamatedFilter,

    recent: Mutex<RecentQueries>,
    handlers: Mutex<HashMap<Tag, MessageHandler>>,
    unhandled: Registry<ReceivedMessage>,
    query_hits: Registry<Query>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers: Vec<Tag> = self
            .handlers
            .lock()
            .expect("mutex should be unpoisoned")
            .keys()
            .copied()
            .collect();

        f.debug_struct("Router")
            .field("handlers", &handlers)
            .field("amalgamated_cached", &self.amalgamated.is_cached())
            .finish()
    }
}

impl Router {
    /// Returns a router that remembers `recent_query_capacity` queries.
    pub fn new(
        manager: Arc<ConnectionManager>,
        membership: Arc<HubMembership>,
        local_filter: Arc<LocalQueryFilter>,
        recent_query_capacity: usize,
    ) -> Router {
        Router {
            manager,
            membership,
            local_filter,
            amalgamated: AmalgamatedFilter::default(),
            recent: Mutex::new(RecentQueries::new(recent_query_capacity)),
            handlers: Mutex::new(HashMap::new()),
            unhandled: Registry::new(),
            query_hits: Registry::new(),
        }
    }

    /// Registers `handler` for messages tagged `tag`, replacing any
    /// previous handler.
    pub fn register_handler(&self, tag: Tag, handler: MessageHandler) -> Option<MessageHandler> {
        self.handlers
            .lock()
            .expect("mutex should be unpoisoned")
            .insert(tag, handler)
    }

    /// Removes the handler for `tag`.
    pub fn unregister_handler(&self, tag: Tag) -> Option<MessageHandler> {
        self.handlers
            .lock()
            .expect("mutex should be unpoisoned")
            .remove(&tag)
    }

    /// Subscribes to messages with no registered handler.
    pub fn subscribe_unhandled(&self) -> Subscription<ReceivedMessage> {
        self.unhandled.subscribe()
    }

    /// Subscribes to queries that match this node's own filter.
    pub fn subscribe_query_hits(&self) -> Subscription<Query> {
        self.query_hits.subscribe()
    }

    /// Passes `received` to the handler for its tag, or to the unhandled
    /// subscribers. Returns `true` if a handler was registered.
    pub fn dispatch(&self, received: ReceivedMessage) -> bool {
        let tag = received.message.tag();
        let handler = self
            .handlers
            .lock()
            .expect("mutex should be unpoisoned")
            .get(&tag)
            .cloned();

        match handler {
            Some(handler) => {
                handler(received);
                true
            }
            None => {
                trace!(%tag, "unhandled message");
                self.unhandled.notify(received);
                false
            }
        }
    }

    /// The filter covering this node and, for a hub, its persistent leaves.
    pub fn amalgamated_filter(&self, local: &NodeInfo) -> Arc<QueryFilter> {
        if !local.is_hub() {
            return Arc::new(self.local_filter.snapshot());
        }

        self.amalgamated.get_or_build(|| {
            let mut filter = self.local_filter.snapshot();
            for connection in self.manager.persistent_connections() {
                let is_leaf = connection
                    .remote_node()
                    .map_or(false, |remote| remote.is_leaf());
                if let (true, Some(leaf_filter)) = (is_leaf, connection.remote_filter()) {
                    filter.add_filter(&leaf_filter);
                }
            }
            trace!(set_bits = filter.count_ones(), "rebuilt amalgamated filter");
            filter
        })
    }

    /// Discards the cached amalgamated filter, so it is rebuilt on next use.
    pub fn invalidate_amalgamated_filter(&self) {
        self.amalgamated.invalidate();
    }

    /// Is the amalgamated filter cached?
    pub fn is_amalgamated_filter_cached(&self) -> bool {
        self.amalgamated.is_cached()
    }

    /// Processes a query that reached this node, and returns the
    /// acknowledgement to send back, if any.
    ///
    /// Only hubs acknowledge, and only queries that come straight from
    /// their origin.
    pub fn process_query(&self, local: &NodeInfo, query: &Query) -> Option<Acknowledgement> {
        let duplicate = self
            .recent
            .lock()
            .expect("mutex should be unpoisoned")
            .check_and_insert(query.guid);
        if duplicate {
            debug!(guid = %query.guid, "query was already seen");
        }

        let mut acknowledgement = None;

        if local.is_hub() {
            let mut to_hubs = false;
            let mut to_leaves = false;

            if query.hop_count < 1 {
                let mut ack = self.acknowledgement_for(local, query);
                if duplicate {
                    ack.is_dead_end = true;
                    return Some(ack);
                }
                acknowledgement = Some(ack);
                to_hubs = true;
            }

            if !duplicate {
                if self.amalgamated_filter(local).may_contain(&query.contents)
                    || self.local_filter.may_contain(&query.contents)
                {
                    to_leaves = true;
                } else {
                    trace!(guid = %query.guid, "query does not match this hub or its leaves");
                }
            }

            if to_hubs || to_leaves {
                self.spawn_forward(query, to_hubs, to_leaves);
            }
        }

        if !duplicate && self.local_filter.may_contain(&query.contents) {
            debug!(guid = %query.guid, contents = %query.contents, "query hit");
            self.query_hits.notify(query.clone());
        }

        acknowledgement
    }

    /// Builds a hub's acknowledgement of `query`.
    ///
    /// Persistent hubs that have sent a filter already get the query from
    /// this hub, so they count as visited. The rest are candidates.
    fn acknowledgement_for(&self, local: &NodeInfo, query: &Query) -> Acknowledgement {
        let mut candidates: Vec<NodeInfo> = self
            .membership
            .snapshot()
            .known()
            .filter(|hub| hub.id != local.id)
            .cloned()
            .collect();
        let mut visited = vec![local.clone()];

        for connection in self.manager.persistent_connections() {
            let remote = match connection.remote_node() {
                Some(remote) if remote.is_hub() => remote,
                _ => continue,
            };

            if connection.remote_filter().is_none() {
                if !candidates.contains(&remote) && !visited.contains(&remote) {
                    candidates.push(remote);
                }
            } else {
                candidates.retain(|candidate| candidate.id != remote.id);
                visited.push(remote);
            }
        }

        Acknowledgement {
            guid: query.guid,
            from: local.clone(),
            is_dead_end: !self.may_have_results(local, &query.contents),
            visited,
            candidates,
        }
    }

    /// Could this hub, or a hub it is persistently connected to, have
    /// results for `contents`?
    ///
    /// Only returns `false` when every persistent hub has sent a filter
    /// that rules the query out.
    pub fn may_have_results(&self, local: &NodeInfo, contents: &str) -> bool {
        if self.amalgamated_filter(local).may_contain(contents) {
            return true;
        }

        self.manager
            .persistent_connections()
            .iter()
            .any(|connection| match connection.remote_node() {
                None => true,
                Some(remote) if remote.is_hub() => connection
                    .remote_filter()
                    .map_or(true, |filter| filter.may_contain(contents)),
                Some(_) => false,
            })
    }

    /// Sends `message` on each persistent connection whose remote node and
    /// filter pass `should_send`, and returns the number of sends.
    /// Forwards the hopped `query` on a separate task, so the
    /// acknowledgement is not held up by the fan-out.
    ///
    /// Matching persistent hubs get it if `to_hubs` is set, then matching
    /// persistent leaves if `to_leaves` is set.
    fn spawn_forward(&self, query: &Query, to_hubs: bool, to_leaves: bool) {
        let connections = self.manager.persistent_connections();
        if connections.is_empty() {
            return;
        }

        let hopped = query.hopped();
        let forward = async move {
            let message = hopped.to_message();
            let contents = hopped.contents.as_str();

            if to_hubs {
                let forwarded = forward_to(&connections, &message, |remote, filter| {
                    remote.is_hub() && filter.map_or(false, |filter| filter.may_contain(contents))
                });
                trace!(guid = %hopped.guid, hubs = forwarded, "forwarded query to hubs");
            }

            if to_leaves {
                let forwarded = forward_to(&connections, &message, |remote, filter| {
                    if !remote.is_leaf() {
                        return false;
                    }
                    match filter {
                        Some(filter) => filter.may_contain(contents),
                        None => {
                            warn!(leaf = %remote, "leaf connection has no query filter");
                            false
                        }
                    }
                });
                trace!(guid = %hopped.guid, leaves = forwarded, "forwarded query to leaves");
            }
        };

        tokio::spawn(forward.in_current_span());
    }

    /// Processes a relay that reached this node.
    ///
    /// Returns where the relay went, and the acknowledgement to send back.
    /// A [`RelayRoute::Local`] relay must be delivered by the caller.
    pub fn process_relay(
        &self,
        local: &NodeInfo,
        relay: &MessageRelay,
    ) -> (RelayRoute, Acknowledgement) {
        if relay.target == local.id {
            trace!(guid = %relay.guid, "relay reached its target");
            return (
                RelayRoute::Local,
                Acknowledgement::reached(relay.guid, local.clone()),
            );
        }

        if let Some(connection) = self.manager.find_connection(&relay.target, false) {
            if connection.send(relay.payload.clone()) {
                debug!(guid = %relay.guid, target = %relay.target, "forwarded relay to its target");
                return (
                    RelayRoute::Forwarded,
                    Acknowledgement::reached(relay.guid, local.clone()),
                );
            }
        }

        let candidates = self
            .membership
            .snapshot()
            .known()
            .filter(|hub| hub.id != local.id)
            .cloned()
            .collect();

        (
            RelayRoute::DeadEnd,
            Acknowledgement::dead_end(relay.guid, local.clone(), candidates),
        )
    }
}

/// Sends `message` on each of `connections` whose remote node and filter
/// pass `should_send`, and returns how many were sent.
fn forward_to<F>(connections: &[Connection], message: &WireMessage, should_send: F) -> usize
where
    F: Fn(&NodeInfo, Option<&QueryFilter>) -> bool,
{
    connections
        .iter()
        .filter(|connection| match connection.remote_node() {
            Some(remote) => {
                let filter = connection.remote_filter();
                should_send(&remote, filter.as_deref())
            }
            None => {
                debug!(connection = %connection.id(), "persistent connection has no remote info");
                false
            }
        })
        .filter(|connection| connection.send(message.clone()))
        .count()
}
