//! Progressive broadcast sessions.
//!
//! A session walks the hub graph one hub at a time. Each hub it reaches
//! replies with an [`Acknowledgement`]: a dead end lists the hubs that hub
//! has already covered and more hubs to try, anything else means the
//! broadcast has arrived and the session is done.
//!
//! # Traversal
//!
//! Candidates are kept in a ring. Each attempt takes the first candidate that
//! is not unreachable, and moves it to the back of the ring, which counts as a
//! demotion. While there have been no more demotions than candidates, only
//! existing persistent connections are used. After that, the session opens
//! connections, and hubs that cannot be reached are dropped from the session
//! and marked bad for every session of this node.
//!
//! Each successful send arms the hop timer. If the timer fires before an
//! acknowledgement arrives, traversal moves on to the next candidate. Once
//! every candidate was tried, the session still accepts acknowledgements for
//! one more hop timeout before it reports that it is exhausted.

use std::{
    collections::{HashSet, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

use futures::{channel::mpsc, future::BoxFuture, StreamExt};
use tokio::task::JoinHandle;
use tracing_futures::Instrument;
use uuid::Uuid;

use crate::{
    broadcast::BadHubCache,
    identity::{NodeId, NodeInfo},
    protocol::{
        message::{Acknowledgement, MessageRelay, Query},
        wire::{TaggedMessage, WireMessage},
    },
};

/// The node services a broadcast session needs.
pub trait BroadcastHost: Send + Sync + 'static {
    /// This node's current info.
    fn local_node(&self) -> NodeInfo;

    /// The hubs this node has persistent connections to.
    fn connected_hubs(&self) -> Vec<NodeInfo>;

    /// Sends `message` to `hub` over an existing persistent connection.
    ///
    /// Returns `false` if there is no such connection, or the send failed.
    fn send_existing(&self, hub: &NodeId, message: &WireMessage) -> bool;

    /// Sends `message` to `hub`, opening a connection if needed.
    fn send_connecting(&self, hub: NodeInfo, message: WireMessage) -> BoxFuture<'static, bool>;

    /// Stops holding any temporary connection to `hub`.
    fn release(&self, hub: &NodeId);

    /// Processes `query` as if it arrived from another node, and returns the
    /// acknowledgement this node would send.
    fn process_query_locally(&self, query: &Query) -> Acknowledgement;

    /// Processes `relay` as if it arrived from another node, and returns the
    /// acknowledgement this node would send.
    fn process_relay_locally(&self, relay: &MessageRelay) -> Acknowledgement;
}

/// A message that can be broadcast across the hub graph.
pub trait Broadcast: fmt::Debug + Send + Sync + 'static {
    /// The correlation id that acknowledgements must carry.
    fn guid(&self) -> Uuid;

    /// The message sent to each hub.
    fn message(&self) -> WireMessage;

    /// Delivers the broadcast to this node, and returns its acknowledgement.
    fn deliver_locally(&self, host: &dyn BroadcastHost) -> Acknowledgement;
}

impl Broadcast for Query {
    fn guid(&self) -> Uuid {
        self.guid
    }

    fn message(&self) -> WireMessage {
        self.to_message()
    }

    fn deliver_locally(&self, host: &dyn BroadcastHost) -> Acknowledgement {
        host.process_query_locally(self)
    }
}

impl Broadcast for MessageRelay {
    fn guid(&self) -> Uuid {
        self.guid
    }

    fn message(&self) -> WireMessage {
        self.to_message()
    }

    fn deliver_locally(&self, host: &dyn BroadcastHost) -> Acknowledgement {
        host.process_relay_locally(self)
    }
}

/// How a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A node acknowledged the broadcast without a dead end.
    Reached(NodeInfo),
    /// Every candidate was tried.
    Exhausted,
    /// The session was stopped.
    Stopped,
}

enum Control {
    Ack(Acknowledgement),
    Stop,
}

/// A handle to a running session.
///
/// Dropping every handle stops the session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    guid: Uuid,
    control: mpsc::UnboundedSender<Control>,
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Control::Ack(ack) => f.debug_tuple("Ack").field(&ack.from.id).finish(),
            Control::Stop => f.write_str("Stop"),
        }
    }
}

impl SessionHandle {
    /// The correlation id of the session.
    pub fn guid(&self) -> Uuid {
        self.guid
    }

    /// Passes an acknowledgement to the session.
    ///
    /// Returns `false` if the session has finished.
    pub fn acknowledge(&self, ack: Acknowledgement) -> bool {
        self.control.unbounded_send(Control::Ack(ack)).is_ok()
    }

    /// Stops the session. Messages that were already sent are not retracted.
    pub fn stop(&self) {
        let _ = self.control.unbounded_send(Control::Stop);
    }

    /// Has the session finished?
    pub fn is_finished(&self) -> bool {
        self.control.is_closed()
    }
}

/// The result of one traversal step.
enum Step {
    Sent(NodeInfo),
    Exhausted,
}

struct Session<B> {
    broadcast: B,
    host: Arc<dyn BroadcastHost>,
    bad_hubs: Arc<BadHubCache>,
    hop_timeout: Duration,
    local_id: NodeId,

    candidates: VecDeque<NodeInfo>,
    visited: HashSet<NodeId>,
    unreachable: HashSet<NodeId>,
    demotions: usize,
    /// Has any hub been sent the broadcast?
    sent_any: bool,
}

/// Starts a broadcast session on a new task.
///
/// The session first delivers the broadcast to this node, then to the hubs
/// this node is connected to, then to the hubs the acknowledgements suggest.
pub fn spawn<B: Broadcast>(
    broadcast: B,
    host: Arc<dyn BroadcastHost>,
    bad_hubs: Arc<BadHubCache>,
    hop_timeout: Duration,
) -> (SessionHandle, JoinHandle<SessionOutcome>) {
    let guid = broadcast.guid();
    let (control, control_rx) = mpsc::unbounded();

    let local_id = host.local_node().id;
    let session = Session {
        broadcast,
        host,
        bad_hubs,
        hop_timeout,
        local_id,
        candidates: VecDeque::new(),
        visited: HashSet::new(),
        unreachable: HashSet::new(),
        demotions: 0,
        sent_any: false,
    };

    let span = debug_span!("broadcast", %guid);
    let task = tokio::spawn(session.run(control_rx).instrument(span));

    (SessionHandle { guid, control }, task)
}

impl<B: Broadcast> Session<B> {
    async fn run(mut self, mut control: mpsc::UnboundedReceiver<Control>) -> SessionOutcome {
        self.candidates = self
            .host
            .connected_hubs()
            .into_iter()
            .filter(|hub| hub.id != self.local_id)
            .collect();
        trace!(candidates = self.candidates.len(), "starting broadcast");

        let local_ack = self.broadcast.deliver_locally(self.host.as_ref());
        if let Some(outcome) = self.handle_ack(local_ack) {
            return self.finish(outcome);
        }

        let message = self.broadcast.message();

        loop {
            let hub = match self.send_to_next_candidate(&message).await {
                Step::Sent(hub) => hub,
                Step::Exhausted => match self.wait_for_late_acks(&mut control).await {
                    Some(outcome) => return self.finish(outcome),
                    None => continue,
                },
            };
            self.sent_any = true;

            let connecting = self.is_connecting_pass();
            let timer = tokio::time::sleep(self.hop_timeout);
            tokio::pin!(timer);

            loop {
                tokio::select! {
                    next = control.next() => match next {
                        Some(Control::Ack(ack)) => {
                            if ack.guid != self.broadcast.guid() {
                                trace!(guid = %ack.guid, "ignoring acknowledgement for another broadcast");
                                continue;
                            }
                            match self.handle_ack(ack) {
                                Some(outcome) => return self.finish(outcome),
                                // A dead end resumes traversal.
                                None => break,
                            }
                        }
                        Some(Control::Stop) | None => return self.finish(SessionOutcome::Stopped),
                    },
                    _ = &mut timer => {
                        debug!(hub = %hub, "hop timed out");
                        if connecting {
                            self.unreachable.insert(hub.id);
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Waits one more hop timeout for acknowledgements from hubs that
    /// answered too slowly, once every candidate was tried.
    ///
    /// Returns `None` if a late dead end suggested hubs to try next.
    async fn wait_for_late_acks(
        &mut self,
        control: &mut mpsc::UnboundedReceiver<Control>,
    ) -> Option<SessionOutcome> {
        if !self.sent_any {
            return Some(SessionOutcome::Exhausted);
        }

        let timer = tokio::time::sleep(self.hop_timeout);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                next = control.next() => match next {
                    Some(Control::Ack(ack)) => {
                        if ack.guid != self.broadcast.guid() {
                            continue;
                        }
                        if let Some(outcome) = self.handle_ack(ack) {
                            return Some(outcome);
                        }
                        if self.has_untried_candidates() {
                            return None;
                        }
                    }
                    Some(Control::Stop) | None => return Some(SessionOutcome::Stopped),
                },
                _ = &mut timer => return Some(SessionOutcome::Exhausted),
            }
        }
    }

    fn has_untried_candidates(&self) -> bool {
        self.candidates
            .iter()
            .any(|hub| !self.unreachable.contains(&hub.id))
    }

    /// The session has moved past the existing connections.
    fn is_connecting_pass(&self) -> bool {
        self.demotions > self.candidates.len()
    }

    async fn send_to_next_candidate(&mut self, message: &WireMessage) -> Step {
        loop {
            let position = self
                .candidates
                .iter()
                .position(|hub| !self.unreachable.contains(&hub.id));
            let hub = match position.and_then(|position| self.candidates.remove(position)) {
                Some(hub) => hub,
                None => return Step::Exhausted,
            };

            self.candidates.push_back(hub.clone());
            self.demotions += 1;

            if !self.is_connecting_pass() {
                if self.host.send_existing(&hub.id, message) {
                    trace!(%hub, "sent over existing connection");
                    return Step::Sent(hub);
                }
                continue;
            }

            if self.bad_hubs.is_bad(&hub.id) {
                self.unreachable.insert(hub.id);
                continue;
            }

            if self.host.send_connecting(hub.clone(), message.clone()).await {
                trace!(%hub, "sent over new connection");
                return Step::Sent(hub);
            }

            debug!(%hub, "could not reach hub");
            self.unreachable.insert(hub.id);
            self.bad_hubs.mark_bad(hub.id);
        }
    }

    /// Applies `ack`, returning the outcome if the session is done.
    fn handle_ack(&mut self, ack: Acknowledgement) -> Option<SessionOutcome> {
        if !ack.is_dead_end {
            debug!(from = %ack.from, "broadcast reached its destination");
            return Some(SessionOutcome::Reached(ack.from));
        }

        self.visited.insert(ack.from.id);
        for visited in &ack.visited {
            self.visited.insert(visited.id);
        }
        self.candidates.retain(|hub| !self.visited.contains(&hub.id));

        for candidate in ack.candidates {
            let known = candidate.id == self.local_id
                || self.visited.contains(&candidate.id)
                || self.candidates.iter().any(|hub| hub.id == candidate.id)
                || self.bad_hubs.is_bad(&candidate.id);
            if !known {
                self.candidates.push_back(candidate);
            }
        }

        if ack.from.id != self.local_id {
            self.host.release(&ack.from.id);
        }

        trace!(
            from = %ack.from,
            candidates = self.candidates.len(),
            visited = self.visited.len(),
            "dead end"
        );

        None
    }

    fn finish(&mut self, outcome: SessionOutcome) -> SessionOutcome {
        debug!(?outcome, "broadcast finished");

        self.candidates.clear();
        self.visited.clear();
        self.unreachable.clear();
        self.demotions = 0;
        self.sent_any = false;

        outcome
    }
}
