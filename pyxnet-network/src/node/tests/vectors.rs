//! Fixed node scenarios, over in-memory transports.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
};

use futures::StreamExt;
use tokio::time::timeout;

use pyxnet_test::prelude::*;

use crate::{
    broadcast::{QuerierEvent, SessionOutcome},
    config::{Config, ConfigError},
    identity::{Mode, NetworkAddress, NodeId},
    node::{Node, NodeError, NodeEvent},
    peer_set::PoolKind,
    protocol::{
        message::{Query, QueryResult},
        wire::{Tag, WireMessage},
    },
    router::ReceivedMessage,
    transport::MemoryTransport,
};

use super::{idle_node, next_event, start_node, WAIT};

const CUSTOM: Tag = Tag(*b"Test");

/// Registers a handler for [`CUSTOM`] messages, and returns what it receives.
fn record_custom_messages(node: &Node) -> Arc<Mutex<Vec<WireMessage>>> {
    let received = Arc::new(Mutex::new(Vec::new()));

    let seen = received.clone();
    node.register_handler(
        CUSTOM,
        Arc::new(move |received: ReceivedMessage| {
            seen.lock()
                .expect("mutex should be unpoisoned")
                .push(received.message);
        }),
    );

    received
}

fn received_count(received: &Mutex<Vec<WireMessage>>) -> usize {
    received.lock().expect("mutex should be unpoisoned").len()
}

#[test]
fn invalid_configs_are_rejected() {
    pyxnet_test::init();

    let config = Config {
        recent_query_capacity: 0,
        ..Config::for_tests("invalid", Mode::Leaf)
    };

    let error = Node::new(config, Arc::new(MemoryTransport::new()))
        .expect_err("a zero query capacity is invalid");
    assert!(matches!(
        error,
        NodeError::Config(ConfigError::ZeroQueryCapacity)
    ));
}

#[tokio::test]
async fn nodes_start_once_and_advertise_their_endpoint() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let node = start_node(&transport, "once", Mode::Leaf).await;

    assert!(node.is_running());
    assert_eq!(node.info().address.internal.len(), 1);
    assert!(node.info().address.external.is_empty());
    assert!(matches!(node.start().await, Err(NodeError::AlreadyStarted)));

    node.shutdown();
    assert!(!node.is_running());
    assert!(matches!(node.start().await, Err(NodeError::ShutDown)));

    Ok(())
}

#[tokio::test]
async fn hubs_connect_and_track_each_other() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let a = start_node(&transport, "a", Mode::Hub).await;
    let b = start_node(&transport, "b", Mode::Hub).await;
    let mut events = a.subscribe();

    let connection = a.connect_to(&b.info(), true).await?;
    assert_eq!(connection.remote_id(), Some(b.id()));

    let established = next_event(&mut events, |event| {
        matches!(event, NodeEvent::ConnectionEstablished { .. })
    })
    .await?;
    assert_eq!(
        established,
        NodeEvent::ConnectionEstablished {
            remote: b.info(),
            pool: Some(PoolKind::Persistent),
        }
    );
    assert!(a.membership().snapshot().is_connected(&b.id()));
    assert_eq!(a.info().hub_count, 1);
    assert_eq!(a.status().persistent_connections, 1);

    wait_until("b tracks a as a connected hub", WAIT, || {
        b.membership().snapshot().is_connected(&a.id())
    })
    .await?;

    b.shutdown();

    let closed = next_event(&mut events, |event| {
        matches!(event, NodeEvent::ConnectionClosed { .. })
    })
    .await?;
    assert_eq!(
        closed,
        NodeEvent::ConnectionClosed {
            remote: Some(b.info()),
            pool: Some(PoolKind::Persistent),
        }
    );

    // The hub is still known, but no longer connected.
    let hubs = a.membership().snapshot();
    assert!(hubs.contains(&b.id()));
    assert!(!hubs.is_connected(&b.id()));
    assert_eq!(a.info().hub_count, 0);

    Ok(())
}

/// A hub advertises its own content and that of its persistent leaves, but
/// not the content of leaves it is not connected to.
#[tokio::test]
async fn hub_filters_amalgamate_persistent_leaves_only() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let hub = start_node(&transport, "hub", Mode::Hub).await;
    let leaf = start_node(&transport, "leaf", Mode::Leaf).await;
    let stranger = start_node(&transport, "stranger", Mode::Leaf).await;

    hub.local_filter().add("abc");
    leaf.local_filter().add("xyz");
    stranger.local_filter().add("qqq");

    leaf.connect_to(&hub.info(), true).await?;

    wait_until("the hub has the leaf's filter", WAIT, || {
        hub.query_filter().may_contain("xyz")
    })
    .await?;

    let filter = hub.query_filter();
    assert!(filter.may_contain("abc"));
    assert!(!filter.may_contain("qqq"));

    // Leaves only advertise their own content.
    assert!(leaf.query_filter().may_contain("xyz"));
    assert!(!leaf.query_filter().may_contain("abc"));

    Ok(())
}

/// A leaf's query reaches a matching leaf through their hub, and the result
/// is relayed back through the hub.
#[tokio::test]
async fn query_hits_are_answered_with_results() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let hub = start_node(&transport, "hub", Mode::Hub).await;
    let holder = start_node(&transport, "holder", Mode::Leaf).await;
    let origin = start_node(&transport, "origin", Mode::Leaf).await;

    holder.local_filter().add("rivers");
    holder.connect_to(&hub.info(), true).await?;
    origin.connect_to(&hub.info(), true).await?;

    wait_until("the hub advertises the holder's content", WAIT, || {
        hub.query_filter().may_contain("rivers")
    })
    .await?;

    let mut hits = holder.subscribe_query_hits();
    let mut querier = origin.query("rivers");

    let hit = timeout(WAIT, hits.events.next())
        .await?
        .expect("hit stream is open");
    assert_eq!(hit.guid, querier.guid());
    assert_eq!(hit.origin, origin.info());

    holder.send_query_result(QueryResult::for_query(&hit, holder.info()));

    match timeout(WAIT, querier.next()).await? {
        Some(QuerierEvent::Result(result)) => {
            assert_eq!(result.query_guid, hit.guid);
            assert_eq!(result.result_node, holder.info());
        }
        other => panic!("expected a query result, got {other:?}"),
    }

    Ok(())
}

/// A hub returns its acknowledgement straight away, and forwards the
/// hopped query to its matching leaves afterwards.
#[tokio::test]
async fn hubs_acknowledge_then_forward_queries() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let hub = start_node(&transport, "hub", Mode::Hub).await;
    let holder = start_node(&transport, "holder", Mode::Leaf).await;

    holder.local_filter().add("lakes");
    holder.connect_to(&hub.info(), true).await?;

    wait_until("the hub advertises the holder's content", WAIT, || {
        hub.query_filter().may_contain("lakes")
    })
    .await?;

    let mut hits = holder.subscribe_query_hits();
    let origin = idle_node("origin", Mode::Leaf);
    let query = Query::new(origin.info(), "lakes");

    let ack = hub
        .router
        .process_query(&hub.info(), &query)
        .expect("hubs acknowledge first hop queries");
    assert_eq!(ack.guid, query.guid);
    assert!(!ack.is_dead_end);

    let hit = timeout(WAIT, hits.events.next())
        .await?
        .expect("hit stream is open");
    assert_eq!(hit.guid, query.guid);
    assert_eq!(hit.hop_count, 1);

    Ok(())
}

#[tokio::test]
async fn status_requests_are_answered() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let hub = start_node(&transport, "hub", Mode::Hub).await;
    let leaf = start_node(&transport, "leaf", Mode::Leaf).await;
    leaf.connect_to(&hub.info(), true).await?;

    let mut events = leaf.subscribe();
    leaf.request_status(hub.id());

    let event = next_event(&mut events, |event| {
        matches!(event, NodeEvent::StatusReceived(_))
    })
    .await?;
    match event {
        NodeEvent::StatusReceived(status) => {
            assert_eq!(status.node, hub.info());
            assert_eq!(status.node.friendly_name, "hub");
            assert_eq!(status.persistent_connections, 1);
            assert!(status.uptime_secs >= 0);
        }
        other => panic!("expected a status, got {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn relays_reach_leaves_behind_a_hub() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let hub = start_node(&transport, "hub", Mode::Hub).await;
    let sender = start_node(&transport, "sender", Mode::Leaf).await;
    let target = start_node(&transport, "target", Mode::Leaf).await;
    sender.connect_to(&hub.info(), true).await?;
    target.connect_to(&hub.info(), true).await?;

    let received = record_custom_messages(&target);

    let relayer = sender.relay(target.id(), WireMessage::new(CUSTOM));
    assert_eq!(
        timeout(WAIT, relayer.outcome()).await?,
        SessionOutcome::Reached(hub.info())
    );

    wait_until("the target received the relayed message", WAIT, || {
        received_count(&received) == 1
    })
    .await?;

    Ok(())
}

#[tokio::test]
async fn relays_to_unknown_nodes_are_exhausted() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let hub = start_node(&transport, "hub", Mode::Hub).await;
    let sender = start_node(&transport, "sender", Mode::Leaf).await;
    sender.connect_to(&hub.info(), true).await?;

    let relayer = sender.relay(NodeId::new_random(), WireMessage::new(CUSTOM));
    assert_eq!(
        timeout(WAIT, relayer.outcome()).await?,
        SessionOutcome::Exhausted
    );

    Ok(())
}

/// A target that cannot be reached directly is asked, through its hub, to
/// connect back, and is not remembered as unreachable.
#[tokio::test]
async fn unreachable_targets_connect_back_through_their_hub() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let hub = start_node(&transport, "hub", Mode::Hub).await;
    let origin = start_node(&transport, "origin", Mode::Leaf).await;
    let target = start_node(&transport, "target", Mode::Leaf).await;
    origin.connect_to(&hub.info(), true).await?;
    target.connect_to(&hub.info(), true).await?;

    wait_until("the hub has both leaves", WAIT, || {
        hub.manager().counts().persistent == 2
    })
    .await?;
    wait_until("the origin tracks its hub", WAIT, || {
        origin.membership().snapshot().is_connected(&hub.id())
    })
    .await?;

    // Nothing listens on this endpoint, so the direct attempt fails at once.
    let mut stale = target.info();
    stale.address = NetworkAddress::internal(SocketAddr::from((Ipv4Addr::LOCALHOST, 1)));

    let connection = origin
        .manager()
        .get_connection(&stale, false, WAIT)
        .await?;

    assert_eq!(connection.remote_id(), Some(target.id()));
    assert!(origin.manager().is_persistently_connected(&target.id()));
    assert!(!origin.manager().is_recently_unreachable(&target.id()));

    Ok(())
}

#[tokio::test]
async fn signed_messages_are_opened_and_dispatched() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let hub = start_node(&transport, "hub", Mode::Hub).await;
    let leaf = start_node(&transport, "leaf", Mode::Leaf).await;
    let connection = leaf.connect_to(&hub.info(), true).await?;

    let received = record_custom_messages(&hub);

    let signed = leaf.sign(&WireMessage::new(CUSTOM))?;
    assert_eq!(signed.tag(), Tag::SIGNED);
    assert!(connection.send(signed));

    wait_until("the hub dispatched the signed message", WAIT, || {
        received_count(&received) == 1
    })
    .await?;

    Ok(())
}

#[tokio::test]
async fn malformed_messages_close_their_connection() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let hub = start_node(&transport, "hub", Mode::Hub).await;
    let leaf = start_node(&transport, "leaf", Mode::Leaf).await;
    let connection = leaf.connect_to(&hub.info(), true).await?;

    // A status message with no body.
    assert!(connection.send(WireMessage::new(Tag::STATUS)));

    wait_until("the hub closed the connection", WAIT, || {
        connection.is_closed()
    })
    .await?;
    wait_until("the hub forgot the leaf", WAIT, || {
        hub.manager().counts().persistent == 0
    })
    .await?;

    Ok(())
}

#[tokio::test]
async fn mode_changes_raise_events_once() -> Result<()> {
    pyxnet_test::init();

    let node = idle_node("mode", Mode::Leaf);
    let mut events = node.subscribe();

    node.set_mode(Mode::Hub);
    node.set_mode(Mode::Hub);
    node.set_mode(Mode::Leaf);

    assert_eq!(events.events.next().await, Some(NodeEvent::Promoted));
    assert_eq!(events.events.next().await, Some(NodeEvent::Demoted));
    assert!(events.events.try_next().is_err(), "no other events are ready");
    assert_eq!(node.mode(), Mode::Leaf);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn gossip_sends_are_rate_limited() -> Result<()> {
    pyxnet_test::init();

    let node = idle_node("gossip", Mode::Hub);
    let gossip = node.gossip.clone();

    assert!(gossip.hub_list_changed());
    assert!(
        !gossip.hub_list_changed(),
        "a second change inside the interval is deferred"
    );
    assert!(!gossip.hub_list_changed());

    assert!(gossip.send_node_info_if_due());
    assert!(!gossip.send_node_info_if_due(), "nothing changed");

    node.local().hub_count = 2;
    assert!(gossip.send_node_info_if_due(), "the advertisement changed");

    tokio::time::advance(node.config().node_info_max_age).await;
    assert!(gossip.send_node_info_if_due(), "the last send is too old");

    assert!(!gossip.is_filter_dirty());
    gossip.filter_changed();
    gossip.filter_changed();
    assert!(gossip.is_filter_dirty());
    assert_eq!(gossip.flush_filter(), Some(0), "there are no hubs to send to");
    assert_eq!(gossip.flush_filter(), None);

    Ok(())
}
