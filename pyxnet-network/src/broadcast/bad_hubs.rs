//! A shared cooldown list of hubs that broadcasts could not reach.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use crate::identity::NodeId;

/// A source of the current time.
pub trait Clock: Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> Instant;
}

/// The system monotonic clock.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when it is advanced.
#[cfg(any(test, feature = "proptest-impl"))]
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    elapsed: Mutex<Duration>,
}

#[cfg(any(test, feature = "proptest-impl"))]
impl Default for ManualClock {
    fn default() -> Self {
        ManualClock {
            start: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }
}

#[cfg(any(test, feature = "proptest-impl"))]
impl ManualClock {
    /// Moves the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock().expect("mutex should be unpoisoned") += duration;
    }
}

#[cfg(any(test, feature = "proptest-impl"))]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + *self.elapsed.lock().expect("mutex should be unpoisoned")
    }
}

/// Hubs that failed to accept a broadcast, shared by every broadcast session
/// of a node.
///
/// A bad hub is skipped by later sessions until its cooldown expires.
pub struct BadHubCache {
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    bad: Mutex<HashMap<NodeId, Instant>>,
}

impl fmt::Debug for BadHubCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BadHubCache")
            .field("cooldown", &self.cooldown)
            .field("bad", &self.bad.try_lock().map(|bad| bad.len()).ok())
            .finish()
    }
}

impl BadHubCache {
    /// Creates an empty cache using the system clock.
    pub fn new(cooldown: Duration) -> BadHubCache {
        BadHubCache::with_clock(cooldown, Arc::new(SystemClock))
    }

    /// Creates an empty cache using `clock`.
    pub fn with_clock(cooldown: Duration, clock: Arc<dyn Clock>) -> BadHubCache {
        BadHubCache {
            cooldown,
            clock,
            bad: Mutex::new(HashMap::new()),
        }
    }

    /// Marks `hub` as bad, restarting its cooldown.
    pub fn mark_bad(&self, hub: NodeId) {
        let now = self.clock.now();
        self.bad
            .lock()
            .expect("mutex should be unpoisoned")
            .insert(hub, now);
    }

    /// Is `hub` still cooling down?
    pub fn is_bad(&self, hub: &NodeId) -> bool {
        let now = self.clock.now();
        let mut bad = self.bad.lock().expect("mutex should be unpoisoned");

        match bad.get(hub) {
            Some(marked) if now.saturating_duration_since(*marked) < self.cooldown => true,
            Some(_) => {
                bad.remove(hub);
                false
            }
            None => false,
        }
    }

    /// Clears the mark on `hub`.
    pub fn remove(&self, hub: &NodeId) -> bool {
        self.bad
            .lock()
            .expect("mutex should be unpoisoned")
            .remove(hub)
            .is_some()
    }
}
