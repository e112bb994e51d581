//! Keeps temporary connections open for a while after they were last needed.

use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

use crate::peer::{Connection, ConnectionId};

/// Temporary connections, and how long each must stay open.
///
/// Holding an already held connection keeps the later expiry.
#[derive(Debug, Default)]
pub(crate) struct TimedConnectionHolder {
    held: HashMap<ConnectionId, (Connection, Instant)>,
}

impl TimedConnectionHolder {
    /// Keeps `connection` open until at least `now + duration`.
    pub fn hold(&mut self, connection: Connection, duration: Duration, now: Instant) {
        let until = now + duration;
        self.held
            .entry(connection.id())
            .and_modify(|(_, expiry)| *expiry = (*expiry).max(until))
            .or_insert((connection, until));
    }

    /// Stops holding the connection `id`.
    pub fn release(&mut self, id: ConnectionId) -> bool {
        self.held.remove(&id).is_some()
    }

    /// Is the connection `id` held at `now`?
    pub fn is_held(&self, id: ConnectionId, now: Instant) -> bool {
        self.held
            .get(&id)
            .map_or(false, |(_, expiry)| *expiry > now)
    }

    /// Removes and returns the connections whose holds expired before `now`.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Connection> {
        let expired: Vec<ConnectionId> = self
            .held
            .iter()
            .filter(|(_, (_, expiry))| *expiry <= now)
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.held.remove(&id))
            .map(|(connection, _)| connection)
            .collect()
    }

    /// Stops holding every connection.
    pub fn clear(&mut self) {
        self.held.clear();
    }
}
