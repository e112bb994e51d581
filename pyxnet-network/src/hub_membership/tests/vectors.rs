//! Fixed test cases for hub membership.

use std::{collections::HashSet, sync::Mutex};

use futures::{FutureExt, StreamExt};

use crate::{
    hub_membership::{HubList, HubMembership, MembershipEvent},
    identity::{Mode, NodeId, NodeInfo},
    protocol::wire::{TaggedMessage, WireError},
};

fn node(mode: Mode, name: &str) -> NodeInfo {
    let mut info = NodeInfo::placeholder(NodeId::new_random());
    info.mode = mode;
    info.friendly_name = name.to_string();
    info
}

fn never_connected(_: &NodeId) -> bool {
    false
}

#[test]
fn hubs_are_placed_by_connection_state() {
    pyxnet_test::init();

    let local = NodeId::new_random();
    let membership = HubMembership::new(local);

    let hub_a = node(Mode::Hub, "a");
    let hub_b = node(Mode::Hub, "b");
    let connected = HashSet::from([hub_a.id]);
    let is_connected = |id: &NodeId| connected.contains(id);

    assert!(membership.add(&hub_a, is_connected));
    assert!(membership.add(&hub_b, is_connected));
    // Adding again with the same state is not a change.
    assert!(!membership.add(&hub_a, is_connected));
    assert!(!membership.add(&hub_b, is_connected));

    let snapshot = membership.snapshot();
    assert!(snapshot.is_connected(&hub_a.id));
    assert!(!snapshot.is_connected(&hub_b.id));
    assert!(snapshot.contains(&hub_b.id));
    assert_eq!(snapshot.connected_count(), 1);
    assert_eq!(snapshot.known_count(), 1);

    // The connection to a closed, so re-adding moves it to the known list.
    assert!(membership.add(&hub_a, never_connected));
    let snapshot = membership.snapshot();
    assert_eq!(snapshot.connected_count(), 0);
    assert_eq!(snapshot.known_count(), 2);
}

#[test]
fn leaves_and_self_are_never_tracked() {
    pyxnet_test::init();

    let mut local = node(Mode::Hub, "local");
    let membership = HubMembership::new(local.id);

    assert!(!membership.add(&local, never_connected));
    assert!(!membership.add(&node(Mode::Leaf, "leaf"), never_connected));
    assert!(membership.snapshot().is_empty());

    // A hub that becomes a leaf is removed from both lists.
    let mut demoted = node(Mode::Hub, "demoted");
    assert!(membership.add(&demoted, |_| true));
    demoted.mode = Mode::Leaf;
    assert!(membership.add(&demoted, |_| true));
    assert!(!membership.contains(&demoted.id));

    local.mode = Mode::Leaf;
    assert!(!membership.add(&local, never_connected));
}

#[test]
fn remove_only_affects_known_hubs() {
    pyxnet_test::init();

    let membership = HubMembership::new(NodeId::new_random());
    let connected = node(Mode::Hub, "connected");
    let known = node(Mode::Hub, "known");

    membership.add(&connected, |_| true);
    membership.add(&known, never_connected);

    assert!(!membership.remove(&connected.id));
    assert!(membership.remove(&known.id));
    assert!(!membership.remove(&known.id));

    assert!(membership.contains(&connected.id));
    assert!(!membership.contains(&known.id));
}

#[test]
fn first_and_last_connected_hub_raise_events() {
    pyxnet_test::init();

    let membership = HubMembership::new(NodeId::new_random());
    let mut subscription = membership.subscribe();

    let hub_a = node(Mode::Hub, "a");
    let hub_b = node(Mode::Hub, "b");
    let live = Mutex::new(HashSet::new());
    let is_connected = |id: &NodeId| live.lock().expect("unpoisoned").contains(id);

    live.lock().expect("unpoisoned").insert(hub_a.id);
    membership.add(&hub_a, is_connected);
    live.lock().expect("unpoisoned").insert(hub_b.id);
    membership.add(&hub_b, is_connected);

    assert_eq!(
        subscription.events.next().now_or_never(),
        Some(Some(MembershipEvent::HubConnected))
    );
    // The second connected hub is not a transition.
    assert_eq!(subscription.events.next().now_or_never(), None);

    live.lock().expect("unpoisoned").clear();
    membership.add(&hub_a, is_connected);
    assert_eq!(subscription.events.next().now_or_never(), None);
    membership.add(&hub_b, is_connected);

    assert_eq!(
        subscription.events.next().now_or_never(),
        Some(Some(MembershipEvent::HubDisconnected))
    );
}

#[test]
fn merging_a_snapshot_reports_changes() {
    pyxnet_test::init();

    let local = node(Mode::Hub, "local");
    let membership = HubMembership::new(local.id);

    let hub_a = node(Mode::Hub, "a");
    let hub_b = node(Mode::Hub, "b");
    let leaf = node(Mode::Leaf, "leaf");

    let remote = HubList::from_hubs([hub_a.clone(), local.clone()], [hub_b.clone(), leaf]);
    assert!(membership.add_all(&remote, never_connected));
    assert!(!membership.add_all(&remote, never_connected));

    let snapshot = membership.snapshot();
    // Remote connected hubs are only known hubs to us.
    assert_eq!(snapshot.connected_count(), 0);
    assert_eq!(snapshot.known_count(), 2);
    assert!(snapshot.contains(&hub_a.id));
    assert!(snapshot.contains(&hub_b.id));
    assert!(!snapshot.contains(&local.id));
}

#[test]
fn hub_list_wire_layout() {
    pyxnet_test::init();

    let hub_a = node(Mode::Hub, "a");
    let hub_b = node(Mode::Hub, "b");
    let list = HubList::from_hubs([hub_a.clone()], [hub_b.clone()]);

    let message = list.to_message();
    let bytes = message.as_bytes();
    assert_eq!(&bytes[..4], b"KHLi");
    assert_eq!(&bytes[4..8], &1_i32.to_le_bytes());
    assert_eq!(&bytes[8..12], &1_i32.to_le_bytes());

    let parsed = HubList::from_message(&message).expect("message should deserialize");
    assert_eq!(parsed, list);
    assert!(parsed.is_connected(&hub_a.id));
    assert!(!parsed.is_connected(&hub_b.id));
}

#[test]
fn oversized_hub_counts_are_rejected() {
    pyxnet_test::init();

    let message = HubList::default().to_message();
    let mut bytes = message.as_bytes().to_vec();
    bytes[4..8].copy_from_slice(&i32::MAX.to_le_bytes());
    let message = crate::protocol::wire::WireMessage::from_bytes(bytes).expect("has a tag");

    assert!(matches!(
        HubList::from_message(&message),
        Err(WireError::BadLength(_))
    ));
}
