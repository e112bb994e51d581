//! Fixed routing scenarios for a node without connections.

use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::{
    identity::{Mode, NodeId},
    protocol::{
        message::{MessageRelay, Query},
        wire::{Tag, WireMessage},
    },
    router::{ReceivedMessage, RecentQueries, RelayRoute},
};

use super::{next_ready, Fixture};

#[test]
fn leaves_do_not_acknowledge_queries_and_hit_once() {
    pyxnet_test::init();

    let fixture = Fixture::new(Mode::Leaf);
    fixture.filter.add("rivers");
    let mut hits = fixture.router.subscribe_query_hits();

    let query = Query::new(super::hub("origin"), "rivers");
    assert_eq!(fixture.router.process_query(&fixture.local, &query), None);
    assert_eq!(fixture.router.process_query(&fixture.local, &query), None);

    assert_eq!(next_ready(&mut hits).map(|hit| hit.guid), Some(query.guid));
    assert_eq!(next_ready(&mut hits), None);
}

#[test]
fn leaves_ignore_queries_outside_their_filter() {
    pyxnet_test::init();

    let fixture = Fixture::new(Mode::Leaf);
    fixture.filter.add("rivers");
    let mut hits = fixture.router.subscribe_query_hits();

    let query = Query::new(super::hub("origin"), "mountains");
    assert_eq!(fixture.router.process_query(&fixture.local, &query), None);
    assert_eq!(next_ready(&mut hits), None);
}

#[test]
fn hubs_acknowledge_first_hop_queries_with_their_known_hubs() {
    pyxnet_test::init();

    let fixture = Fixture::new(Mode::Hub);
    let a = fixture.add_known_hub("a");
    let b = fixture.add_known_hub("b");

    let query = Query::new(super::hub("origin"), "lakes");
    let ack = fixture
        .router
        .process_query(&fixture.local, &query)
        .expect("hubs acknowledge first hop queries");

    assert_eq!(ack.guid, query.guid);
    assert_eq!(ack.from, fixture.local);
    assert!(ack.is_dead_end, "nothing here can match");
    assert_eq!(ack.visited, vec![fixture.local.clone()]);
    assert_eq!(ack.candidates, vec![a, b]);
}

#[test]
fn matching_hubs_are_not_dead_ends() {
    pyxnet_test::init();

    let fixture = Fixture::new(Mode::Hub);
    fixture.filter.add("lakes");
    let mut hits = fixture.router.subscribe_query_hits();

    let query = Query::new(super::hub("origin"), "lakes");
    let ack = fixture
        .router
        .process_query(&fixture.local, &query)
        .expect("hubs acknowledge first hop queries");

    assert!(!ack.is_dead_end);
    assert_eq!(next_ready(&mut hits).map(|hit| hit.guid), Some(query.guid));
}

#[test]
fn duplicate_queries_are_dead_ends_without_hits() {
    pyxnet_test::init();

    let fixture = Fixture::new(Mode::Hub);
    fixture.filter.add("lakes");
    let mut hits = fixture.router.subscribe_query_hits();

    let query = Query::new(super::hub("origin"), "lakes");
    let first = fixture.router.process_query(&fixture.local, &query);
    let second = fixture.router.process_query(&fixture.local, &query);

    assert_eq!(first.map(|ack| ack.is_dead_end), Some(false));
    assert_eq!(second.map(|ack| ack.is_dead_end), Some(true));

    assert!(next_ready(&mut hits).is_some());
    assert_eq!(next_ready(&mut hits), None);
}

#[test]
fn hubs_do_not_acknowledge_forwarded_queries() {
    pyxnet_test::init();

    let fixture = Fixture::new(Mode::Hub);
    fixture.filter.add("lakes");
    let mut hits = fixture.router.subscribe_query_hits();

    let query = Query::new(super::hub("origin"), "lakes").hopped();
    assert_eq!(fixture.router.process_query(&fixture.local, &query), None);
    assert!(next_ready(&mut hits).is_some());
}

#[test]
fn recent_queries_forget_the_oldest_guid() {
    pyxnet_test::init();

    let mut recent = RecentQueries::new(2);
    let (first, second, third) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    assert!(!recent.check_and_insert(first));
    assert!(!recent.check_and_insert(second));
    assert!(recent.check_and_insert(first));

    assert!(!recent.check_and_insert(third));
    assert_eq!(recent.len(), 2);

    // `first` was the oldest, even though it was seen again.
    assert!(!recent.check_and_insert(first));
    assert!(recent.check_and_insert(third));
}

#[test]
fn registered_handlers_receive_their_tag_only() {
    pyxnet_test::init();

    let fixture = Fixture::new(Mode::Leaf);
    let custom = Tag(*b"Test");
    let received = Arc::new(Mutex::new(Vec::new()));

    let seen = received.clone();
    fixture.router.register_handler(
        custom,
        Arc::new(move |received: ReceivedMessage| {
            seen.lock()
                .expect("mutex should be unpoisoned")
                .push(received.message.tag());
        }),
    );
    let mut unhandled = fixture.router.subscribe_unhandled();

    assert!(fixture.router.dispatch(ReceivedMessage {
        connection: None,
        message: WireMessage::new(custom),
    }));
    assert!(!fixture.router.dispatch(ReceivedMessage {
        connection: None,
        message: WireMessage::new(Tag(*b"Othr")),
    }));

    assert_eq!(
        *received.lock().expect("mutex should be unpoisoned"),
        vec![custom]
    );
    let other = next_ready(&mut unhandled).expect("unknown tags are unhandled");
    assert_eq!(other.message.tag(), Tag(*b"Othr"));
    assert!(other.connection.is_none());

    assert!(fixture.router.unregister_handler(custom).is_some());
    assert!(!fixture.router.dispatch(ReceivedMessage {
        connection: None,
        message: WireMessage::new(custom),
    }));
}

#[test]
fn relays_for_this_node_are_local() {
    pyxnet_test::init();

    let fixture = Fixture::new(Mode::Hub);
    let relay = MessageRelay::new(
        super::hub("origin"),
        fixture.local.id,
        WireMessage::new(Tag::STATUS_REQUEST),
    );

    let (route, ack) = fixture.router.process_relay(&fixture.local, &relay);
    assert_eq!(route, RelayRoute::Local);
    assert!(!ack.is_dead_end);
    assert_eq!(ack.guid, relay.guid);
}

#[test]
fn unreachable_relay_targets_are_dead_ends_listing_known_hubs() {
    pyxnet_test::init();

    let fixture = Fixture::new(Mode::Hub);
    let a = fixture.add_known_hub("a");

    let relay = MessageRelay::new(
        super::hub("origin"),
        NodeId::new_random(),
        WireMessage::new(Tag::STATUS_REQUEST),
    );

    let (route, ack) = fixture.router.process_relay(&fixture.local, &relay);
    assert_eq!(route, RelayRoute::DeadEnd);
    assert!(ack.is_dead_end);
    assert_eq!(ack.visited, vec![fixture.local.clone()]);
    assert_eq!(ack.candidates, vec![a]);
}

#[test]
fn only_hubs_cache_their_amalgamated_filter() {
    pyxnet_test::init();

    let leaf = Fixture::new(Mode::Leaf);
    leaf.filter.add("rivers");
    assert!(leaf.router.amalgamated_filter(&leaf.local).may_contain("rivers"));
    assert!(!leaf.router.is_amalgamated_filter_cached());

    let hub = Fixture::new(Mode::Hub);
    hub.filter.add("rivers");
    assert!(hub.router.amalgamated_filter(&hub.local).may_contain("rivers"));
    assert!(hub.router.is_amalgamated_filter_cached());

    // The cache does not see local changes until it is invalidated.
    hub.filter.add("lakes");
    assert!(!hub.router.amalgamated_filter(&hub.local).may_contain("lakes"));

    hub.router.invalidate_amalgamated_filter();
    assert!(hub.router.amalgamated_filter(&hub.local).may_contain("lakes"));
}
