//! Fixed connection manager scenarios, over in-memory transports.

use std::time::Duration;

use futures::future;

use pyxnet_test::prelude::*;

use crate::{
    config::Config,
    identity::Mode,
    peer::{ConnectError, ConnectionState, HandshakeError},
    peer_set::PoolKind,
    transport::{MemoryTransport, Transport},
};

use super::{unreachable_hub, TestPeer};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn persistent_handshake_registers_both_hubs() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let a = TestPeer::start(&transport, "a", Mode::Hub).await;
    let b = TestPeer::start(&transport, "b", Mode::Hub).await;

    let connection = a
        .manager
        .get_connection(&b.info(), true, Duration::ZERO)
        .await?;

    assert_eq!(connection.state(), ConnectionState::Active);
    assert_eq!(connection.remote_id(), Some(b.id()));
    assert_eq!(a.manager.pool_of(&connection), Some(PoolKind::Persistent));
    assert_eq!(a.established(), vec![connection.id()]);
    assert!(a.membership.snapshot().is_connected(&b.id()));

    wait_until("b has a persistent connection", WAIT, || {
        b.manager.counts().persistent == 1
    })
    .await?;

    let inbound = b
        .manager
        .find_connection(&a.id(), true)
        .expect("b is connected to a");
    assert_eq!(inbound.state(), ConnectionState::Active);
    assert!(!inbound.addr().is_outbound());
    assert!(b.membership.snapshot().is_connected(&a.id()));
    assert_eq!(b.manager.counts().pending, 0);

    Ok(())
}

#[tokio::test]
async fn non_persistent_handshake_uses_temporary_and_volatile_pools() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let a = TestPeer::start(&transport, "a", Mode::Leaf).await;
    let b = TestPeer::start(&transport, "b", Mode::Hub).await;

    let connection = a
        .manager
        .get_connection(&b.info(), false, Duration::ZERO)
        .await?;
    assert_eq!(a.manager.pool_of(&connection), Some(PoolKind::Temporary));

    // Temporary connections are not reused by callers that need persistence.
    assert!(a.manager.find_connection(&b.id(), true).is_none());
    assert!(a.manager.find_connection(&b.id(), false).is_some());

    wait_until("b has a volatile connection", WAIT, || {
        b.manager.counts().volatile == 1
    })
    .await?;

    // A leaf is not a hub, so it is not added to b's membership.
    assert!(!b.membership.contains(&a.id()));

    Ok(())
}

#[tokio::test]
async fn incorrect_target_is_reported_and_evicted() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let a = TestPeer::start(&transport, "a", Mode::Hub).await;
    let b = TestPeer::start(&transport, "b", Mode::Hub).await;

    // `a` believes some other hub lives at b's address.
    let mut stale = unreachable_hub();
    stale.address = b.info().address;
    assert!(a.membership.add(&stale, |_| false));

    let error = a
        .manager
        .get_connection(&stale, true, Duration::ZERO)
        .await
        .expect_err("b is not the requested node");

    match error {
        ConnectError::Handshake(HandshakeError::IncorrectNode { expected, actual }) => {
            assert_eq!(expected, stale.id);
            assert_eq!(actual, b.id());
        }
        error => panic!("unexpected error: {error}"),
    }

    assert!(!a.membership.contains(&stale.id));
    assert_eq!(a.manager.counts(), Default::default());

    Ok(())
}

#[tokio::test]
async fn concurrent_callers_share_one_connection_attempt() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let a = TestPeer::start(&transport, "a", Mode::Hub).await;
    let b = TestPeer::start(&transport, "b", Mode::Hub).await;
    let target = b.info();

    let attempts = (0..8).map(|_| a.manager.get_connection(&target, true, Duration::ZERO));
    let connections = future::join_all(attempts).await;

    let first = connections[0].as_ref().expect("the connection succeeds").id();
    for connection in &connections {
        let connection = connection.as_ref().expect("every caller gets a connection");
        assert_eq!(connection.id(), first);
    }

    assert_eq!(transport.connect_attempts(b.addr()), 1);
    assert_eq!(a.manager.counts().persistent, 1);

    Ok(())
}

#[tokio::test]
async fn unreachable_nodes_are_not_retried_immediately() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let a = TestPeer::start(&transport, "a", Mode::Hub).await;
    let hub = unreachable_hub();

    let first = a
        .manager
        .get_connection(&hub, false, Duration::ZERO)
        .await;
    assert!(matches!(first, Err(ConnectError::Transport(_))));

    let second = a
        .manager
        .get_connection(&hub, false, Duration::ZERO)
        .await;
    assert!(matches!(second, Err(ConnectError::RecentlyUnreachable(id)) if id == hub.id));

    assert_eq!(transport.connect_attempts(hub.address.internal[0]), 1);

    Ok(())
}

#[tokio::test]
async fn connecting_to_self_fails() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let a = TestPeer::start(&transport, "a", Mode::Hub).await;

    let error = a
        .manager
        .get_connection(&a.info(), false, Duration::ZERO)
        .await
        .expect_err("self connections are refused");
    assert!(matches!(
        error,
        ConnectError::Handshake(HandshakeError::SameNode)
    ));

    // Connecting by address does not know the target, so the responder refuses it.
    let error = a
        .manager
        .connect(a.addr(), false)
        .await
        .expect_err("self connections are refused");
    assert!(matches!(
        error,
        ConnectError::Handshake(HandshakeError::SameNode)
    ));

    Ok(())
}

#[tokio::test]
async fn connecting_by_address_learns_the_remote_node() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let a = TestPeer::start(&transport, "a", Mode::Leaf).await;
    let b = TestPeer::start(&transport, "b", Mode::Hub).await;

    let connection = a.manager.connect(b.addr(), true).await?;
    assert_eq!(connection.remote_id(), Some(b.id()));
    assert_eq!(connection.addr().target(), None);
    assert!(a.manager.is_persistently_connected(&b.id()));

    Ok(())
}

#[tokio::test]
async fn unheld_temporary_connections_are_swept() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let a = TestPeer::start(&transport, "a", Mode::Leaf).await;
    let b = TestPeer::start(&transport, "b", Mode::Hub).await;

    let connection = a
        .manager
        .get_connection(&b.info(), false, Duration::ZERO)
        .await?;

    // New temporary connections are held for a while.
    assert_eq!(a.manager.sweep_temporary_connections(), 0);

    assert!(a.manager.release_connection(&connection));
    assert_eq!(a.manager.sweep_temporary_connections(), 1);
    assert!(connection.is_closing());
    assert_eq!(a.manager.pool_of(&connection), None);

    wait_until("b drops the volatile connection", WAIT, || {
        b.manager.counts().volatile == 0
    })
    .await?;

    Ok(())
}

#[tokio::test]
async fn silent_inbound_connections_are_closed() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let config = Config {
        handshake_timeout: Duration::from_millis(100),
        ..Config::for_tests("b", Mode::Hub)
    };
    let b = TestPeer::start_with_config(&transport, config).await;

    // Open a stream, but never send a connection request.
    let _stream = transport.connect(b.addr()).await?;

    wait_until("b accepts the stream", WAIT, || {
        b.manager.counts().pending == 1
    })
    .await?;
    wait_until("b closes the stream", WAIT, || {
        b.manager.counts().pending == 0
    })
    .await?;

    Ok(())
}

#[tokio::test]
async fn shutdown_closes_every_connection() -> Result<()> {
    pyxnet_test::init();

    let transport = MemoryTransport::new();
    let a = TestPeer::start(&transport, "a", Mode::Hub).await;
    let b = TestPeer::start(&transport, "b", Mode::Hub).await;

    let connection = a
        .manager
        .get_connection(&b.info(), true, Duration::ZERO)
        .await?;

    a.manager.shutdown();

    assert!(connection.is_closing());
    assert_eq!(a.manager.counts(), Default::default());

    let error = a
        .manager
        .get_connection(&b.info(), true, Duration::ZERO)
        .await
        .expect_err("shut down managers do not connect");
    assert!(matches!(error, ConnectError::ShuttingDown));

    wait_until("b sees the close", WAIT, || {
        b.manager.counts().persistent == 0
    })
    .await?;

    Ok(())
}
