//! The disjoint connection pools of a node.

use indexmap::IndexMap;

use crate::{
    identity::{NodeId, NodeInfo},
    peer::{Connection, ConnectionId},
};

/// The pools a connection can be in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(any(test, feature = "proptest-impl"), derive(proptest_derive::Arbitrary))]
pub enum PoolKind {
    /// Waiting for the handshake to finish.
    Pending,
    /// Long-lived connections, requested by either side.
    Persistent,
    /// Short-lived connections this node opened.
    Temporary,
    /// Short-lived connections the remote node opened.
    Volatile,
}

impl PoolKind {
    /// Every pool, in lookup order.
    pub const ALL: [PoolKind; 4] = [
        PoolKind::Pending,
        PoolKind::Persistent,
        PoolKind::Temporary,
        PoolKind::Volatile,
    ];
}

/// The number of connections in each pool.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolCounts {
    /// Connections waiting for a handshake.
    pub pending: usize,
    /// Persistent connections.
    pub persistent: usize,
    /// Temporary connections.
    pub temporary: usize,
    /// Volatile connections.
    pub volatile: usize,
}

/// Connections grouped by pool.
///
/// # Correctness
///
/// A connection is in at most one pool. Every insert removes the connection
/// from the other pools first.
#[derive(Debug, Default)]
pub(crate) struct Pools {
    pending: IndexMap<ConnectionId, Connection>,
    persistent: IndexMap<ConnectionId, Connection>,
    temporary: IndexMap<ConnectionId, Connection>,
    volatile: IndexMap<ConnectionId, Connection>,
}

impl Pools {
    fn pool(&self, kind: PoolKind) -> &IndexMap<ConnectionId, Connection> {
        match kind {
            PoolKind::Pending => &self.pending,
            PoolKind::Persistent => &self.persistent,
            PoolKind::Temporary => &self.temporary,
            PoolKind::Volatile => &self.volatile,
        }
    }

    fn pool_mut(&mut self, kind: PoolKind) -> &mut IndexMap<ConnectionId, Connection> {
        match kind {
            PoolKind::Pending => &mut self.pending,
            PoolKind::Persistent => &mut self.persistent,
            PoolKind::Temporary => &mut self.temporary,
            PoolKind::Volatile => &mut self.volatile,
        }
    }

    /// Puts `connection` in the `kind` pool, removing it from any other pool.
    pub fn insert(&mut self, kind: PoolKind, connection: Connection) {
        self.remove(connection.id());
        self.pool_mut(kind).insert(connection.id(), connection);
    }

    /// Moves the connection `id` from the `from` pool to the `to` pool.
    ///
    /// Returns `false`, and changes nothing, if the connection is not in `from`.
    pub fn transfer(&mut self, id: ConnectionId, from: PoolKind, to: PoolKind) -> bool {
        match self.pool_mut(from).shift_remove(&id) {
            Some(connection) => {
                self.pool_mut(to).insert(id, connection);
                true
            }
            None => false,
        }
    }

    /// Removes the connection `id` from whichever pool holds it.
    pub fn remove(&mut self, id: ConnectionId) -> Option<(PoolKind, Connection)> {
        PoolKind::ALL.into_iter().find_map(|kind| {
            self.pool_mut(kind)
                .shift_remove(&id)
                .map(|connection| (kind, connection))
        })
    }

    /// The pool holding the connection `id`.
    pub fn kind_of(&self, id: ConnectionId) -> Option<PoolKind> {
        PoolKind::ALL
            .into_iter()
            .find(|kind| self.pool(*kind).contains_key(&id))
    }

    /// The open connections in the `kind` pool.
    pub fn connections(&self, kind: PoolKind) -> impl Iterator<Item = &Connection> + '_ {
        self.pool(kind)
            .values()
            .filter(|connection| !connection.is_closing())
    }

    /// The first open connection to `node` in the `kinds` pools, searched in order.
    pub fn find(&self, node: &NodeId, kinds: &[PoolKind]) -> Option<Connection> {
        kinds.iter().find_map(|kind| {
            self.connections(*kind)
                .find(|connection| connection.remote_id().as_ref() == Some(node))
                .cloned()
        })
    }

    /// The first pending connection to or from `node`.
    ///
    /// Outbound connections match on the node they expect to reach.
    pub fn find_pending(&self, node: &NodeId) -> Option<Connection> {
        self.connections(PoolKind::Pending)
            .find(|connection| {
                connection.addr().target().as_ref() == Some(node)
                    || connection.remote_id().as_ref() == Some(node)
            })
            .cloned()
    }

    /// The distinct hubs at the other end of established connections.
    pub fn hubs(&self) -> Vec<NodeInfo> {
        let mut hubs: IndexMap<NodeId, NodeInfo> = IndexMap::new();
        for kind in [PoolKind::Persistent, PoolKind::Temporary, PoolKind::Volatile] {
            for remote in self.connections(kind).filter_map(Connection::remote_node) {
                if remote.is_hub() {
                    hubs.entry(remote.id).or_insert(remote);
                }
            }
        }

        hubs.into_values().collect()
    }

    /// The number of connections in each pool, including closing connections.
    pub fn counts(&self) -> PoolCounts {
        PoolCounts {
            pending: self.pending.len(),
            persistent: self.persistent.len(),
            temporary: self.temporary.len(),
            volatile: self.volatile.len(),
        }
    }

    /// Empties every pool, returning the connections.
    pub fn drain(&mut self) -> Vec<Connection> {
        PoolKind::ALL
            .into_iter()
            .flat_map(|kind| {
                self.pool_mut(kind)
                    .drain(..)
                    .map(|(_id, connection)| connection)
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}
