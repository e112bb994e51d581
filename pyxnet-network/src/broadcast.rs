//! Progressive broadcasts across the hub graph.
//!
//! Queries and message relays share the same traversal. See [`session`] for
//! how candidate hubs are chosen and retried.

mod bad_hubs;
mod querier;
mod relayer;
pub mod session;


pub use bad_hubs::{BadHubCache, Clock, SystemClock};

#[cfg(any(test, feature = "proptest-impl"))]
pub use bad_hubs::ManualClock;
pub use querier::{Querier, QuerierEvent};
pub use relayer::MessageRelayer;
pub use session::{Broadcast, BroadcastHost, SessionHandle, SessionOutcome};
