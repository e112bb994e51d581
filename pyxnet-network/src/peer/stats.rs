//! Per-connection traffic statistics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::protocol::wire::Tag;

/// Message and byte counts in each direction.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TrafficCounts {
    /// Messages sent.
    pub sent: u64,
    /// Serialized bytes sent, including tags but not frame headers.
    pub sent_bytes: u64,
    /// Messages received.
    pub received: u64,
    /// Serialized bytes received, including tags but not frame headers.
    pub received_bytes: u64,
}

impl TrafficCounts {
    fn add_sent(&mut self, len: usize) {
        self.sent += 1;
        self.sent_bytes += len as u64;
    }

    fn add_received(&mut self, len: usize) {
        self.received += 1;
        self.received_bytes += len as u64;
    }

    fn merge(&mut self, other: &TrafficCounts) {
        self.sent += other.sent;
        self.sent_bytes += other.sent_bytes;
        self.received += other.received;
        self.received_bytes += other.received_bytes;
    }
}

/// Traffic statistics for one or more connections.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Totals across every message type.
    pub total: TrafficCounts,
    /// Counts for each message type seen.
    pub by_tag: BTreeMap<Tag, TrafficCounts>,
    /// `PING`s sent.
    pub pings_sent: u64,
    /// `PING`s received.
    pub pings_received: u64,
    /// `PONG`s received.
    pub pongs_received: u64,
    /// When the last `PONG` arrived.
    pub last_pong: Option<DateTime<Utc>>,
}

impl ConnectionStats {
    pub(crate) fn record_sent(&mut self, tag: Tag, len: usize) {
        self.total.add_sent(len);
        self.by_tag.entry(tag).or_default().add_sent(len);
        if tag == Tag::PING {
            self.pings_sent += 1;
        }
    }

    pub(crate) fn record_received(&mut self, tag: Tag, len: usize) {
        self.total.add_received(len);
        self.by_tag.entry(tag).or_default().add_received(len);
        match tag {
            Tag::PING => self.pings_received += 1,
            Tag::PONG => {
                self.pongs_received += 1;
                self.last_pong = Some(Utc::now());
            }
            _ => {}
        }
    }

    /// Adds the counts of `other` to these statistics.
    ///
    /// The latest `last_pong` of the two is kept.
    pub fn merge(&mut self, other: &ConnectionStats) {
        self.total.merge(&other.total);
        for (tag, counts) in &other.by_tag {
            self.by_tag.entry(*tag).or_default().merge(counts);
        }
        self.pings_sent += other.pings_sent;
        self.pings_received += other.pings_received;
        self.pongs_received += other.pongs_received;
        self.last_pong = self.last_pong.max(other.last_pong);
    }

    /// The counts for a single message type.
    pub fn for_tag(&self, tag: Tag) -> TrafficCounts {
        self.by_tag.get(&tag).copied().unwrap_or_default()
    }
}
