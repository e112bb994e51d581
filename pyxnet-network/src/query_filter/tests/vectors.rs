//! Fixed test vectors for query filters.

use futures::{FutureExt, StreamExt};

use crate::{
    protocol::{
        message::DataPackage,
        wire::{TaggedMessage, WireMessage},
    },
    query_filter::{
        AmalgamatedFilter, FilterChanged, LocalQueryFilter, QueryFilter, FILTER_BYTES,
    },
};

#[test]
fn hash_vectors() {
    pyxnet_test::init();

    assert_eq!(QueryFilter::hash(""), 0);
    assert_eq!(QueryFilter::hash("abc"), 658_988);
    assert_eq!(QueryFilter::hash("foo"), 456_010);
    assert_eq!(QueryFilter::hash("bar"), 938_586);
    assert_eq!(QueryFilter::hash("foo bar"), 678_639);
    assert_eq!(QueryFilter::hash("hello world"), 909_576);
    // A negative accumulator is sign-extended before the multiply.
    assert_eq!(QueryFilter::hash("\u{ff}\u{ff}\u{ff}\u{ff}"), 724_548);
}

#[test]
fn hash_ignores_case() {
    pyxnet_test::init();

    assert_eq!(QueryFilter::hash("ABC"), QueryFilter::hash("abc"));
    assert_eq!(
        QueryFilter::hash("Hello World"),
        QueryFilter::hash("hello world")
    );
}

#[test]
fn words_must_all_match() {
    pyxnet_test::init();

    let mut filter = QueryFilter::new();
    assert!(filter.add("foo"));
    assert!(!filter.add("foo"));

    assert!(filter.may_contain("foo"));
    assert!(filter.may_contain("FOO"));
    assert!(!filter.may_contain("foo bar"));

    assert!(filter.add("bar"));
    assert!(filter.may_contain("foo bar"));
    assert!(filter.may_contain("bar foo"));

    // The whole string matches even if its words were never added.
    let mut phrase = QueryFilter::new();
    phrase.add("hello world");
    assert!(phrase.may_contain("hello world"));
    assert!(!phrase.may_contain("hello"));
}

#[test]
fn add_filter_and_set_report_changes() {
    pyxnet_test::init();

    let mut abc = QueryFilter::new();
    abc.add("abc");
    let mut xyz = QueryFilter::new();
    xyz.add("xyz");

    let mut merged = QueryFilter::new();
    assert!(merged.add_filter(&abc));
    assert!(!merged.add_filter(&abc));
    assert!(merged.add_filter(&xyz));
    assert!(merged.may_contain("abc"));
    assert!(merged.may_contain("xyz"));
    assert_eq!(merged.count_ones(), 2);

    assert!(merged.set(&abc));
    assert!(!merged.set(&abc));
    assert!(!merged.may_contain("xyz"));
    assert_eq!(merged, abc);
}

#[test]
fn bits_are_packed_lsb_first() {
    pyxnet_test::init();

    let mut filter = QueryFilter::new();
    // "" hashes to bit 0, the lowest bit of the first byte.
    filter.add("");
    filter.add("abc");

    let bytes = filter.to_bytes();
    assert_eq!(bytes.len(), FILTER_BYTES);
    assert_eq!(bytes[0], 0b0000_0001);
    assert_eq!(bytes[658_988 / 8], 1_u8 << (658_988 % 8));

    let parsed = QueryFilter::from_bytes(&bytes).expect("full filter should parse");
    assert_eq!(parsed, filter);

    // Short inputs leave the rest of the filter clear.
    let short = QueryFilter::from_bytes(&[0b1000_0000]).expect("short filter should parse");
    assert_eq!(short.count_ones(), 1);

    assert!(QueryFilter::from_bytes(&vec![0; FILTER_BYTES + 1]).is_err());
}

#[test]
fn filter_messages_are_compressed_by_default() {
    pyxnet_test::init();

    let mut filter = QueryFilter::new();
    filter.add("abc");

    let compressed = filter.to_message();
    assert_eq!(&compressed.as_bytes()[..4], b"QHaT");
    assert_eq!(compressed.as_bytes()[4], 1);
    // An almost empty filter compresses very well.
    assert!(compressed.serialized_len() < 1024);

    let plain = filter.to_message_with(false);
    assert_eq!(plain.as_bytes()[4], 0);
    assert_eq!(plain.serialized_len(), 4 + 1 + 4 + FILTER_BYTES);

    for message in [compressed, plain] {
        let parsed = QueryFilter::from_message(&message).expect("filter should deserialize");
        assert_eq!(parsed, filter);
    }
}

#[test]
fn corrupt_compressed_data_is_rejected() {
    pyxnet_test::init();

    let mut message = WireMessage::new(QueryFilter::TAG);
    message.put_bool(true);
    // A final block with the reserved block type.
    message.put_bytes(&[0x07, 0x00, 0x00]);

    assert!(QueryFilter::from_message(&message).is_err());
}

#[test]
fn oversized_packages_are_rejected() {
    pyxnet_test::init();

    let package = DataPackage::new(vec![7; 64], true);
    assert!(package.is_compressed());
    assert!(package.clone().into_data(63).is_err());
    assert_eq!(package.into_data(64).expect("fits"), vec![7; 64]);

    let package = DataPackage::new(vec![7; 64], false);
    assert!(!package.is_compressed());
    assert!(package.into_data(10).is_err());
}

#[test]
fn local_filter_notifies_on_change_only() {
    pyxnet_test::init();

    let local = LocalQueryFilter::new();
    let mut subscription = local.subscribe();

    assert!(local.add("abc"));
    assert!(!local.add("abc"));

    assert_eq!(
        subscription.events.next().now_or_never(),
        Some(Some(FilterChanged))
    );
    assert_eq!(subscription.events.next().now_or_never(), None);
    assert!(local.may_contain("abc"));
}

#[test]
fn batched_updates_notify_once() {
    pyxnet_test::init();

    let local = LocalQueryFilter::new();
    let mut subscription = local.subscribe();

    local.begin_update();
    local.begin_update();
    local.add("abc");
    local.add("xyz");
    local.end_update();
    assert_eq!(subscription.events.next().now_or_never(), None);
    local.end_update();

    assert_eq!(
        subscription.events.next().now_or_never(),
        Some(Some(FilterChanged))
    );
    assert_eq!(subscription.events.next().now_or_never(), None);

    // A batch without changes is silent.
    local.begin_update();
    local.add("abc");
    local.end_update();
    assert_eq!(subscription.events.next().now_or_never(), None);
}

#[test]
fn amalgamated_filter_is_rebuilt_after_invalidation() {
    pyxnet_test::init();

    let cache = AmalgamatedFilter::default();
    let mut builds = 0;

    let mut build = |word: &str| {
        builds += 1;
        let mut filter = QueryFilter::new();
        filter.add(word);
        filter
    };

    let first = cache.get_or_build(|| build("abc"));
    let second = cache.get_or_build(|| build("xyz"));
    assert!(first.may_contain("abc"));
    assert!(second.may_contain("abc"));
    assert!(cache.is_cached());

    cache.invalidate();
    assert!(!cache.is_cached());
    let third = cache.get_or_build(|| build("xyz"));
    assert!(third.may_contain("xyz"));

    assert_eq!(builds, 2);
}
