//! Gossiped hub membership: the hubs we are connected to, and the hubs we
//! have heard about.
//!
//! Every node keeps a [`HubMembership`], and sends snapshots of it to its
//! peers in `KHLi` messages. A node's membership is the union of what it
//! learns from its own connections and the snapshots its peers send it.
//!
//! Only hubs are tracked. Leaves are dropped as soon as we learn they are
//! leaves, even if they were previously hubs.

use std::sync::Mutex;

use indexmap::IndexMap;

use crate::{
    events::{Registry, Subscription},
    identity::{NodeId, NodeInfo},
    protocol::wire::{
        MessageReader, Tag, TaggedMessage, WireDeserialize, WireError, WireMessage, WireSerialize,
    },
};

#[cfg(test)]
mod tests;

/// A snapshot of a node's hub membership, as sent on the wire.
///
/// The `connected` and `known` lists never share a [`NodeId`].
#[derive(Clone, Debug, Default)]
pub struct HubList {
    connected: IndexMap<NodeId, NodeInfo>,
    known: IndexMap<NodeId, NodeInfo>,
}

impl HubList {
    /// Builds a snapshot from lists of connected and known hubs.
    ///
    /// A hub in both lists ends up in the known list.
    pub fn from_hubs(
        connected: impl IntoIterator<Item = NodeInfo>,
        known: impl IntoIterator<Item = NodeInfo>,
    ) -> HubList {
        let mut list = HubList::default();
        for hub in connected {
            list.place(&hub, true);
        }
        for hub in known {
            list.place(&hub, false);
        }

        list
    }

    /// The hubs the owner has a persistent connection to.
    pub fn connected(&self) -> impl Iterator<Item = &NodeInfo> + '_ {
        self.connected.values()
    }

    /// The hubs the owner has heard of, but is not connected to.
    pub fn known(&self) -> impl Iterator<Item = &NodeInfo> + '_ {
        self.known.values()
    }

    /// Every hub in the snapshot, known hubs first.
    pub fn all(&self) -> impl Iterator<Item = &NodeInfo> + '_ {
        self.known.values().chain(self.connected.values())
    }

    /// Is `id` in either list?
    pub fn contains(&self, id: &NodeId) -> bool {
        self.connected.contains_key(id) || self.known.contains_key(id)
    }

    /// Is `id` in the connected list?
    pub fn is_connected(&self, id: &NodeId) -> bool {
        self.connected.contains_key(id)
    }

    /// The total number of hubs in the snapshot.
    pub fn len(&self) -> usize {
        self.connected.len() + self.known.len()
    }

    /// Is the snapshot empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of connected hubs.
    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    /// The number of known hubs.
    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    /// Inserts `node` into the connected or known list, removing it from the other list.
    ///
    /// Returns `true` if the node changed lists, or was not in either list.
    /// An existing entry is refreshed with the latest info, but that does not
    /// count as a change.
    fn place(&mut self, node: &NodeInfo, connected: bool) -> bool {
        let (target, other) = if connected {
            (&mut self.connected, &mut self.known)
        } else {
            (&mut self.known, &mut self.connected)
        };

        let moved = other.shift_remove(&node.id).is_some();
        let added = target.insert(node.id, node.clone()).is_none();

        moved || added
    }

    fn remove_everywhere(&mut self, id: &NodeId) -> bool {
        // Both lookups must run, so a node can never be left in one list.
        let connected = self.connected.shift_remove(id).is_some();
        let known = self.known.shift_remove(id).is_some();

        connected || known
    }
}

impl PartialEq for HubList {
    fn eq(&self, other: &Self) -> bool {
        let same_keys = |a: &IndexMap<NodeId, NodeInfo>, b: &IndexMap<NodeId, NodeInfo>| {
            a.len() == b.len() && a.keys().all(|id| b.contains_key(id))
        };

        same_keys(&self.connected, &other.connected) && same_keys(&self.known, &other.known)
    }
}

impl Eq for HubList {}

impl WireSerialize for HubList {
    fn wire_serialize(&self, message: &mut WireMessage) {
        message.put_length(self.connected.len());
        message.put_length(self.known.len());

        for hub in self.connected.values().chain(self.known.values()) {
            hub.wire_serialize(message);
        }
    }
}

impl WireDeserialize for HubList {
    fn wire_deserialize(reader: &mut MessageReader<'_>) -> Result<Self, WireError> {
        let connected_count = reader.read_length()?;
        let known_count = reader.read_length()?;

        // Every node info is more than one byte, so larger counts must be truncated.
        if connected_count.saturating_add(known_count) > reader.remaining() {
            return Err(WireError::BadLength(
                connected_count.saturating_add(known_count) as i64,
            ));
        }

        let mut list = HubList::default();
        for _ in 0..connected_count {
            let hub = NodeInfo::wire_deserialize(reader)?;
            list.place(&hub, true);
        }
        for _ in 0..known_count {
            let hub = NodeInfo::wire_deserialize(reader)?;
            list.place(&hub, false);
        }

        Ok(list)
    }
}

impl TaggedMessage for HubList {
    const TAG: Tag = Tag::KNOWN_HUB_LIST;
}

/// A change in whether this node is connected to any hub.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
    /// The first hub was added to the connected list.
    HubConnected,
    /// The last hub was removed from the connected list.
    HubDisconnected,
}

/// The live, thread-safe hub membership of this node.
///
/// # Correctness
///
/// When the membership lock and the connection pool lock are both needed,
/// the membership lock must be taken first. The `is_connected` callbacks
/// passed to [`HubMembership::add`] run while the membership lock is held.
#[derive(Debug)]
pub struct HubMembership {
    /// This node, which is never added to its own membership.
    local_id: NodeId,
    hubs: Mutex<HubList>,
    events: Registry<MembershipEvent>,
}

impl HubMembership {
    /// Returns an empty membership for the node with `local_id`.
    pub fn new(local_id: NodeId) -> HubMembership {
        HubMembership {
            local_id,
            hubs: Mutex::new(HubList::default()),
            events: Registry::new(),
        }
    }

    /// Subscribes to [`MembershipEvent`]s.
    pub fn subscribe(&self) -> Subscription<MembershipEvent> {
        self.events.subscribe()
    }

    /// Adds or moves `node`, and returns `true` if either list changed.
    ///
    /// Leaves are removed from both lists. Hubs are placed in the connected
    /// list if `is_connected` reports a live persistent connection to them,
    /// and in the known list otherwise.
    pub fn add<F>(&self, node: &NodeInfo, is_connected: F) -> bool
    where
        F: Fn(&NodeId) -> bool,
    {
        let (changed, event) = {
            let mut hubs = self.hubs.lock().expect("mutex should be unpoisoned");
            let before = hubs.connected_count();
            let changed = self.add_locked(&mut hubs, node, &is_connected);

            (changed, Self::transition(before, hubs.connected_count()))
        };

        if let Some(event) = event {
            self.events.notify(event);
        }

        changed
    }

    /// Adds every hub in `other`, and returns `true` if either list changed.
    pub fn add_all<F>(&self, other: &HubList, is_connected: F) -> bool
    where
        F: Fn(&NodeId) -> bool,
    {
        let (changed, event) = {
            let mut hubs = self.hubs.lock().expect("mutex should be unpoisoned");
            let before = hubs.connected_count();

            let mut changed = false;
            for node in other.known().chain(other.connected()) {
                changed |= self.add_locked(&mut hubs, node, &is_connected);
            }

            (changed, Self::transition(before, hubs.connected_count()))
        };

        if let Some(event) = event {
            self.events.notify(event);
        }

        changed
    }

    fn add_locked<F>(&self, hubs: &mut HubList, node: &NodeInfo, is_connected: &F) -> bool
    where
        F: Fn(&NodeId) -> bool,
    {
        if !node.is_hub() {
            let removed = hubs.remove_everywhere(&node.id);
            if removed {
                debug!(%node, "removed demoted hub from hub membership");
            }
            return removed;
        }

        if node.id == self.local_id {
            return false;
        }

        let connected = is_connected(&node.id);
        let changed = hubs.place(node, connected);
        if changed {
            trace!(%node, connected, "updated hub membership");
        }

        changed
    }

    fn transition(before: usize, after: usize) -> Option<MembershipEvent> {
        match (before, after) {
            (0, after) if after > 0 => Some(MembershipEvent::HubConnected),
            (before, 0) if before > 0 => Some(MembershipEvent::HubDisconnected),
            _ => None,
        }
    }

    /// Removes `id` from the known list. Connected hubs are not removed.
    pub fn remove(&self, id: &NodeId) -> bool {
        self.hubs
            .lock()
            .expect("mutex should be unpoisoned")
            .known
            .shift_remove(id)
            .is_some()
    }

    /// Returns a snapshot of the membership.
    pub fn snapshot(&self) -> HubList {
        self.hubs.lock().expect("mutex should be unpoisoned").clone()
    }

    /// Is `id` in either list?
    pub fn contains(&self, id: &NodeId) -> bool {
        self.hubs
            .lock()
            .expect("mutex should be unpoisoned")
            .contains(id)
    }

    /// The number of connected hubs.
    pub fn connected_count(&self) -> usize {
        self.hubs
            .lock()
            .expect("mutex should be unpoisoned")
            .connected_count()
    }

    /// Every hub this node knows about, in either list.
    pub fn all_hubs(&self) -> Vec<NodeInfo> {
        self.hubs
            .lock()
            .expect("mutex should be unpoisoned")
            .all()
            .cloned()
            .collect()
    }
}
