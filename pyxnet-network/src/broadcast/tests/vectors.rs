//! Fixed broadcast scenarios.

use std::{collections::HashSet, sync::Arc, time::Duration};

use futures::StreamExt;
use uuid::Uuid;

use crate::{
    broadcast::{
        session, BadHubCache, Clock, ManualClock, MessageRelayer, Querier, QuerierEvent,
        SessionOutcome,
    },
    events::Registry,
    identity::NodeId,
    protocol::{
        message::{Acknowledgement, MessageRelay, Query, QueryResult},
        wire::{Tag, WireMessage},
    },
};

use super::{hub, next_sent, FakeHost, Sent};

const HOP_TIMEOUT: Duration = Duration::from_secs(1);

fn bad_hubs() -> Arc<BadHubCache> {
    Arc::new(BadHubCache::new(Duration::from_secs(300)))
}

/// Two dead ends, then a hub that has the answer: the broadcast stops there.
#[tokio::test]
async fn broadcast_stops_at_the_first_hub_that_is_not_a_dead_end() {
    pyxnet_test::init();

    let hubs = vec![hub("a"), hub("b"), hub("c"), hub("d")];
    let (host, mut sent) = FakeHost::new(hubs.clone());
    let query = Query::new(host.local.clone(), "needle");
    let guid = query.guid;

    let (handle, outcome) = session::spawn(query, host.clone(), bad_hubs(), HOP_TIMEOUT);

    assert_eq!(next_sent(&mut sent).await, Sent::Existing(hubs[0].id));
    assert!(handle.acknowledge(Acknowledgement::dead_end(
        guid,
        hubs[0].clone(),
        Vec::new()
    )));

    assert_eq!(next_sent(&mut sent).await, Sent::Existing(hubs[1].id));
    assert!(handle.acknowledge(Acknowledgement::dead_end(
        guid,
        hubs[1].clone(),
        Vec::new()
    )));

    // Two hubs are left after two demotions, so the third send opens a connection.
    assert_eq!(next_sent(&mut sent).await, Sent::Connecting(hubs[2].id));
    handle.acknowledge(Acknowledgement::reached(guid, hubs[2].clone()));

    let outcome = outcome.await.expect("session task does not panic");
    assert_eq!(outcome, SessionOutcome::Reached(hubs[2].clone()));
    assert!(handle.is_finished());

    // The fourth hub was never contacted.
    drop(handle);
    assert_eq!(sent.try_next().ok().flatten(), None);
    assert_eq!(host.released(), vec![hubs[0].id, hubs[1].id]);
}

/// Hubs that never answer are retried over new connections, then dropped.
#[tokio::test(start_paused = true)]
async fn unanswered_hubs_are_retried_then_exhausted() {
    pyxnet_test::init();

    let hubs = vec![hub("a"), hub("b")];
    let (host, mut sent) = FakeHost::new(hubs.clone());
    let query = Query::new(host.local.clone(), "needle");

    let (_handle, outcome) = session::spawn(query, host, bad_hubs(), HOP_TIMEOUT);

    assert_eq!(next_sent(&mut sent).await, Sent::Existing(hubs[0].id));
    assert_eq!(next_sent(&mut sent).await, Sent::Existing(hubs[1].id));
    assert_eq!(next_sent(&mut sent).await, Sent::Connecting(hubs[0].id));
    assert_eq!(next_sent(&mut sent).await, Sent::Connecting(hubs[1].id));

    let outcome = outcome.await.expect("session task does not panic");
    assert_eq!(outcome, SessionOutcome::Exhausted);
}

/// A hub that answers after its last hop timer still ends the broadcast.
#[tokio::test(start_paused = true)]
async fn late_acknowledgements_are_accepted_after_the_last_hop() {
    pyxnet_test::init();

    let a = hub("a");
    let (host, mut sent) = FakeHost::new(vec![a.clone()]);
    let query = Query::new(host.local.clone(), "needle");
    let guid = query.guid;

    let (handle, outcome) = session::spawn(query, host, bad_hubs(), HOP_TIMEOUT);

    assert_eq!(next_sent(&mut sent).await, Sent::Existing(a.id));
    assert_eq!(next_sent(&mut sent).await, Sent::Connecting(a.id));

    // The hop timer for the last attempt fires first.
    tokio::time::sleep(HOP_TIMEOUT + HOP_TIMEOUT / 10).await;
    assert!(!handle.is_finished());
    assert!(handle.acknowledge(Acknowledgement::reached(guid, a.clone())));

    let outcome = outcome.await.expect("session task does not panic");
    assert_eq!(outcome, SessionOutcome::Reached(a));
}

/// Dead ends can suggest hubs this node did not know about.
#[tokio::test]
async fn dead_ends_add_new_candidates_and_skip_visited_hubs() {
    pyxnet_test::init();

    let a = hub("a");
    let b = hub("b");
    let c = hub("c");
    let (host, mut sent) = FakeHost::with_connectivity(
        vec![a.clone(), b.clone()],
        [a.id, b.id].into_iter().collect(),
        [a.id, b.id, c.id].into_iter().collect(),
    );
    let relay = MessageRelay::new(
        host.local.clone(),
        NodeId::new_random(),
        WireMessage::new(Tag::PING),
    );
    let guid = relay.guid;

    let (handle, outcome) = session::spawn(relay, host.clone(), bad_hubs(), HOP_TIMEOUT);

    assert_eq!(next_sent(&mut sent).await, Sent::Existing(a.id));

    // `a` has already passed the relay on to `b`, and suggests `c`.
    let mut ack = Acknowledgement::dead_end(guid, a.clone(), vec![c.clone(), host.local.clone()]);
    ack.visited.push(b.clone());
    handle.acknowledge(ack);

    assert_eq!(next_sent(&mut sent).await, Sent::Connecting(c.id));
    handle.acknowledge(Acknowledgement::reached(guid, c.clone()));

    let outcome = outcome.await.expect("session task does not panic");
    assert_eq!(outcome, SessionOutcome::Reached(c));
}

/// Hubs that could not be reached are skipped by later sessions.
#[tokio::test]
async fn unreachable_hubs_are_marked_bad_and_skipped() {
    pyxnet_test::init();

    let a = hub("a");
    let b = hub("b");
    let bad_hubs = bad_hubs();
    bad_hubs.mark_bad(b.id);

    // No existing connections, and only `b` would accept one.
    let (host, mut sent) = FakeHost::with_connectivity(
        vec![a.clone(), b.clone()],
        HashSet::new(),
        [b.id].into_iter().collect(),
    );
    let query = Query::new(host.local.clone(), "needle");

    let (_handle, outcome) = session::spawn(query, host, bad_hubs.clone(), HOP_TIMEOUT);

    assert_eq!(next_sent(&mut sent).await, Sent::Connecting(a.id));

    let outcome = outcome.await.expect("session task does not panic");
    assert_eq!(outcome, SessionOutcome::Exhausted);
    assert!(bad_hubs.is_bad(&a.id));
    assert_eq!(sent.try_next().ok().flatten(), None);
}

/// Acknowledgements for other broadcasts do not end the session.
#[tokio::test]
async fn acknowledgements_for_other_broadcasts_are_ignored() {
    pyxnet_test::init();

    let a = hub("a");
    let stranger = hub("stranger");
    let (host, mut sent) = FakeHost::new(vec![a.clone()]);
    let query = Query::new(host.local.clone(), "needle");
    let guid = query.guid;

    let (handle, outcome) = session::spawn(query, host, bad_hubs(), HOP_TIMEOUT);

    assert_eq!(next_sent(&mut sent).await, Sent::Existing(a.id));
    handle.acknowledge(Acknowledgement::reached(Uuid::new_v4(), stranger));
    handle.acknowledge(Acknowledgement::reached(guid, a.clone()));

    let outcome = outcome.await.expect("session task does not panic");
    assert_eq!(outcome, SessionOutcome::Reached(a));
}

#[tokio::test]
async fn stopped_sessions_do_not_continue() {
    pyxnet_test::init();

    let a = hub("a");
    let (host, mut sent) = FakeHost::new(vec![a.clone(), hub("b")]);
    let query = Query::new(host.local.clone(), "needle");

    let (handle, outcome) = session::spawn(query, host, bad_hubs(), HOP_TIMEOUT);

    assert_eq!(next_sent(&mut sent).await, Sent::Existing(a.id));
    handle.stop();

    let outcome = outcome.await.expect("session task does not panic");
    assert_eq!(outcome, SessionOutcome::Stopped);
    assert!(handle.is_finished());
    assert!(!handle.acknowledge(Acknowledgement::reached(handle.guid(), a)));
}

#[test]
fn bad_hubs_cool_down() {
    pyxnet_test::init();

    let clock = Arc::new(ManualClock::default());
    let cache = BadHubCache::with_clock(Duration::from_secs(60), clock.clone());
    let hub = NodeId::new_random();

    assert!(!cache.is_bad(&hub));
    cache.mark_bad(hub);
    assert!(cache.is_bad(&hub));

    clock.advance(Duration::from_secs(59));
    assert!(cache.is_bad(&hub));

    clock.advance(Duration::from_secs(1));
    assert!(!cache.is_bad(&hub));
    assert!(!cache.remove(&hub));

    let start = clock.now();
    clock.advance(Duration::from_secs(1));
    assert_eq!(clock.now() - start, Duration::from_secs(1));
}

/// A relay to this node is delivered without contacting any hub.
#[tokio::test]
async fn relays_to_this_node_are_delivered_locally() {
    pyxnet_test::init();

    let (host, mut sent) = FakeHost::new(vec![hub("a")]);
    let relay = MessageRelay::new(
        host.local.clone(),
        host.local.id,
        WireMessage::new(Tag::PING),
    );

    let relayer = MessageRelayer::start(relay, host.clone(), bad_hubs(), HOP_TIMEOUT);
    assert_eq!(relayer.target(), host.local.id);

    assert_eq!(
        relayer.outcome().await,
        SessionOutcome::Reached(host.local.clone())
    );
    assert_eq!(sent.try_next().ok().flatten(), None);
}

/// Queriers report matching results until the query expires.
#[tokio::test(start_paused = true)]
async fn querier_reports_matching_results_then_expires() {
    pyxnet_test::init();

    let (host, _sent) = FakeHost::new(Vec::new());
    let results = Registry::new();
    let query = Query::new(host.local.clone(), "needle");

    let mut querier = Querier::start(
        query.clone(),
        host.clone(),
        bad_hubs(),
        HOP_TIMEOUT,
        Duration::from_secs(30),
        results.subscribe(),
    );
    assert_eq!(querier.guid(), query.guid);

    let other_query = Query::new(host.local.clone(), "haystack");
    results.notify(QueryResult::for_query(&other_query, hub("other")));

    let result = QueryResult::for_query(&query, hub("holder"));
    results.notify(result.clone());

    assert_eq!(querier.next().await, Some(QuerierEvent::Result(result)));
    assert_eq!(querier.next().await, Some(QuerierEvent::Expired));
    assert_eq!(querier.next().await, None);
}
