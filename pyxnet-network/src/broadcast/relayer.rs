//! Targeted message relays.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;

use crate::{
    broadcast::{session, BadHubCache, BroadcastHost, SessionHandle, SessionOutcome},
    identity::NodeId,
    protocol::message::MessageRelay,
};

/// A running relay of a message to one node.
///
/// The relay walks the hub graph until a hub reports that the target was
/// reached, or every candidate hub has been tried.
#[derive(Debug)]
pub struct MessageRelayer {
    target: NodeId,
    session: SessionHandle,
    outcome: JoinHandle<SessionOutcome>,
}

impl MessageRelayer {
    /// Starts relaying `relay`.
    pub(crate) fn start(
        relay: MessageRelay,
        host: Arc<dyn BroadcastHost>,
        bad_hubs: Arc<BadHubCache>,
        hop_timeout: Duration,
    ) -> MessageRelayer {
        let target = relay.target;
        debug!(guid = %relay.guid, %target, "relaying message");

        let (session, outcome) = session::spawn(relay, host, bad_hubs, hop_timeout);

        MessageRelayer {
            target,
            session,
            outcome,
        }
    }

    /// The node the message is relayed to.
    pub fn target(&self) -> NodeId {
        self.target
    }

    /// The broadcast session of this relay.
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Stops relaying.
    pub fn stop(&self) {
        self.session.stop();
    }

    /// Waits for the relay to finish.
    pub async fn outcome(self) -> SessionOutcome {
        self.outcome.await.unwrap_or(SessionOutcome::Stopped)
    }
}
