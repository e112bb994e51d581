//! Remembers nodes we recently failed to connect to.

use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

use crate::identity::NodeId;

/// Nodes that failed a connection attempt, and when they failed.
///
/// Entries expire after the retry interval, and are purged on lookup.
#[derive(Debug)]
pub(crate) struct UnreachableCache {
    retry_after: Duration,
    failed: HashMap<NodeId, Instant>,
}

impl UnreachableCache {
    pub fn new(retry_after: Duration) -> UnreachableCache {
        UnreachableCache {
            retry_after,
            failed: HashMap::new(),
        }
    }

    /// Records a failed attempt to reach `node` at `now`.
    pub fn insert(&mut self, node: NodeId, now: Instant) {
        self.failed.insert(node, now);
    }

    /// Did an attempt to reach `node` fail less than the retry interval before `now`?
    pub fn contains(&mut self, node: &NodeId, now: Instant) -> bool {
        match self.failed.get(node) {
            Some(failed_at) if now.saturating_duration_since(*failed_at) < self.retry_after => {
                true
            }
            Some(_) => {
                self.failed.remove(node);
                false
            }
            None => false,
        }
    }

    /// Forgets a failure, because the node connected to us.
    pub fn remove(&mut self, node: &NodeId) -> bool {
        self.failed.remove(node).is_some()
    }
}
