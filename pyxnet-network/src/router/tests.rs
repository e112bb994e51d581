//! Tests for query routing and message dispatch.

use std::sync::{Arc, Weak};

use futures::{FutureExt, StreamExt};

use crate::{
    config::Config,
    events::Subscription,
    hub_membership::HubMembership,
    identity::{Mode, NodeId, NodeInfo},
    peer::ConnectionHandler,
    peer_set::{ConnectionHost, ConnectionManager},
    query_filter::LocalQueryFilter,
    router::Router,
    transport::MemoryTransport,
};

mod vectors;

/// A router with no connections, and the state it reads.
struct Fixture {
    local: NodeInfo,
    membership: Arc<HubMembership>,
    filter: Arc<LocalQueryFilter>,
    router: Router,
}

impl Fixture {
    fn new(mode: Mode) -> Fixture {
        let mut local = NodeInfo::placeholder(NodeId::new_random());
        local.mode = mode;
        local.friendly_name = "local".to_string();

        let membership = Arc::new(HubMembership::new(local.id));
        let filter = Arc::new(LocalQueryFilter::new());

        // Nothing connects in these tests, so the manager needs no host.
        let host: Weak<dyn ConnectionHost> = Weak::<NoHost>::new();
        let handler: Weak<dyn ConnectionHandler> = Weak::<NoHost>::new();
        let manager = Arc::new(ConnectionManager::new(
            Config::for_tests("local", mode),
            Arc::new(MemoryTransport::new()),
            membership.clone(),
            host,
            handler,
        ));

        let router = Router::new(manager, membership.clone(), filter.clone(), 16);

        Fixture {
            local,
            membership,
            filter,
            router,
        }
    }

    /// Adds a hub the local node is not connected to.
    fn add_known_hub(&self, name: &str) -> NodeInfo {
        let hub = hub(name);
        assert!(self.membership.add(&hub, |_| false));
        hub
    }
}

struct NoHost;

impl ConnectionHost for NoHost {
    fn local_node(&self) -> NodeInfo {
        NodeInfo::placeholder(NodeId::nil())
    }

    fn connection_established(&self, _connection: &crate::peer::Connection) {}

    fn connect_back(&self, _target: &NodeInfo) -> Option<crate::broadcast::SessionHandle> {
        None
    }
}

impl ConnectionHandler for NoHost {}

fn hub(name: &str) -> NodeInfo {
    let mut hub = NodeInfo::placeholder(NodeId::new_random());
    hub.mode = Mode::Hub;
    hub.friendly_name = name.to_string();
    hub
}

/// Returns the next ready event, or `None` if no event is ready.
fn next_ready<T>(subscription: &mut Subscription<T>) -> Option<T> {
    subscription.events.next().now_or_never().flatten()
}
