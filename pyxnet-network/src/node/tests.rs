//! Tests for the node façade, over in-memory transports.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;

use pyxnet_test::prelude::*;

use crate::{config::Config, events::Subscription, identity::Mode, transport::MemoryTransport};

use super::Node;

mod vectors;

/// How long scenarios wait for the network to settle.
const WAIT: Duration = Duration::from_secs(5);

/// Starts a node with a test config on `transport`.
async fn start_node(transport: &MemoryTransport, name: &str, mode: Mode) -> Arc<Node> {
    let node = Node::new(Config::for_tests(name, mode), Arc::new(transport.clone()))
        .expect("test configs are valid");
    node.start()
        .await
        .expect("in-memory listeners always bind");

    node
}

/// Returns a node that is not started.
fn idle_node(name: &str, mode: Mode) -> Arc<Node> {
    Node::new(Config::for_tests(name, mode), Arc::new(MemoryTransport::new()))
        .expect("test configs are valid")
}

/// Waits for the next event that `matches`, skipping the others.
async fn next_event<T, F>(subscription: &mut Subscription<T>, mut matches: F) -> Result<T>
where
    F: FnMut(&T) -> bool,
{
    let found = tokio::time::timeout(WAIT, async {
        while let Some(event) = subscription.events.next().await {
            if matches(&event) {
                return Some(event);
            }
        }
        None
    })
    .await?;

    found.ok_or_else(|| eyre::eyre!("event stream ended"))
}
