//! Typed event subscription registries.
//!
//! Each registry fans an event out to every subscriber's unbounded channel.
//! Subscribing, unsubscribing and notifying all take the same lock, so a
//! subscriber never misses an event sent after `subscribe` returns, and never
//! receives one sent after `unsubscribe` returns.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use futures::channel::mpsc;

/// Identifies a subscription, so it can be removed later.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A live subscription to a [`Registry`].
#[derive(Debug)]
pub struct Subscription<T> {
    /// The id to pass to [`Registry::unsubscribe`].
    pub id: SubscriptionId,
    /// The stream of events.
    pub events: mpsc::UnboundedReceiver<T>,
}

/// A thread-safe list of event subscribers.
#[derive(Debug)]
pub struct Registry<T> {
    subscribers: Mutex<Vec<(SubscriptionId, mpsc::UnboundedSender<T>)>>,
}

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Registry {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> Registry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber, and returns its event stream.
    pub fn subscribe(&self) -> Subscription<T> {
        let id = SubscriptionId(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed));
        let (tx, events) = mpsc::unbounded();

        self.subscribers
            .lock()
            .expect("mutex should be unpoisoned")
            .push((id, tx));

        Subscription { id, events }
    }

    /// Removes a subscriber. Returns `false` if it was already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock().expect("mutex should be unpoisoned");
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);

        subscribers.len() != before
    }

    /// Sends `event` to every subscriber, dropping subscribers whose stream was dropped.
    pub fn notify(&self, event: T) {
        let mut subscribers = self.subscribers.lock().expect("mutex should be unpoisoned");
        subscribers.retain(|(_, tx)| tx.unbounded_send(event.clone()).is_ok());
    }

    /// The number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("mutex should be unpoisoned")
            .len()
    }
}
