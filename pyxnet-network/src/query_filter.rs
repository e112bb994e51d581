//! The query hash table: a fixed-size approximate-membership filter.
//!
//! Each node publishes a [`QueryFilter`] describing the content it can
//! answer queries for. Hubs OR together their own filter and their leaves'
//! filters into an amalgamated filter, and use their peers' filters to skip
//! sending queries to nodes that cannot have results.
//!
//! The filter has no false negatives: once a string is added,
//! [`QueryFilter::may_contain`] returns `true` for it until the filter is
//! replaced. Bits are never cleared in place.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use crate::{
    events::{Registry, Subscription},
    protocol::{
        message::DataPackage,
        wire::{
            MessageReader, Tag, TaggedMessage, WireDeserialize, WireError, WireMessage,
            WireSerialize,
        },
    },
};

#[cfg(test)]
mod tests;

/// The number of bits in a filter index.
pub const FILTER_INDEX_BITS: u32 = 20;

/// The number of bits in a filter.
pub const FILTER_BITS: usize = 1 << FILTER_INDEX_BITS;

/// The serialized size of a filter, before compression.
pub const FILTER_BYTES: usize = FILTER_BITS / 8;

const WORD_BITS: usize = u64::BITS as usize;

/// The multiplier of the Gnutella 2 query hash.
const HASH_MULTIPLIER: u64 = 0x4F1B_BCDC;

/// A fixed-length bit vector supporting "may contain" tests for query text.
#[derive(Clone, PartialEq, Eq)]
pub struct QueryFilter {
    words: Box<[u64]>,
}

impl Default for QueryFilter {
    fn default() -> Self {
        QueryFilter::new()
    }
}

impl fmt::Debug for QueryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFilter")
            .field("set_bits", &self.count_ones())
            .finish()
    }
}

impl QueryFilter {
    /// Returns an empty filter.
    pub fn new() -> QueryFilter {
        QueryFilter {
            words: vec![0; FILTER_BITS / WORD_BITS].into_boxed_slice(),
        }
    }

    /// Returns the bit index for `value`.
    ///
    /// This is the 20-bit Gnutella 2 hash: each lower-cased UTF-16 unit is
    /// truncated to a byte and XORed into one of four byte lanes in turn,
    /// then the lanes are multiplied by a fixed constant and the high bits of
    /// the low 32 bits of the product are the index.
    pub fn hash(value: &str) -> usize {
        let mut num: i32 = 0;
        let mut lane = 0;

        for unit in value.encode_utf16() {
            let byte = i32::from(lower_utf16(unit) & 0xFF);
            num ^= byte << (lane * 8);
            lane = (lane + 1) & 3;
        }

        // Negative accumulators are sign-extended before the multiply.
        let product = (num as i64 as u64).wrapping_mul(HASH_MULTIPLIER);
        ((product << 32) >> (64 - FILTER_INDEX_BITS)) as usize
    }

    fn bit(&self, index: usize) -> bool {
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Sets a bit, returning `true` if it was previously clear.
    fn set_bit(&mut self, index: usize) -> bool {
        let word = &mut self.words[index / WORD_BITS];
        let mask = 1 << (index % WORD_BITS);
        let was_clear = *word & mask == 0;
        *word |= mask;
        was_clear
    }

    /// Adds `value`, returning `true` if the filter changed.
    pub fn add(&mut self, value: &str) -> bool {
        self.set_bit(Self::hash(value))
    }

    /// ORs every bit of `other` into this filter, returning `true` if the filter changed.
    pub fn add_filter(&mut self, other: &QueryFilter) -> bool {
        let mut changed = false;
        for (mine, theirs) in self.words.iter_mut().zip(other.words.iter()) {
            let merged = *mine | *theirs;
            changed |= merged != *mine;
            *mine = merged;
        }

        changed
    }

    /// Replaces the contents of this filter with `other`, returning `true` if it changed.
    pub fn set(&mut self, other: &QueryFilter) -> bool {
        if self == other {
            return false;
        }

        self.words.copy_from_slice(&other.words);
        true
    }

    /// Could `value` be in the filter?
    ///
    /// Returns `true` if the whole string was added. Otherwise, every
    /// whitespace-separated word must have been added.
    pub fn may_contain(&self, value: &str) -> bool {
        if self.bit(Self::hash(value)) {
            return true;
        }

        // Empty words are kept, so "a  b" checks the empty string's bit too.
        value
            .split(char::is_whitespace)
            .all(|word| self.bit(Self::hash(word)))
    }

    /// The number of set bits.
    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|word| word.count_ones()).sum()
    }

    /// Is every bit clear?
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }

    /// Packs the bits into bytes, least significant bit first.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect()
    }

    /// Unpacks bits written by [`QueryFilter::to_bytes`].
    ///
    /// Shorter inputs leave the remaining bits clear. Longer inputs are rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<QueryFilter, WireError> {
        if bytes.len() > FILTER_BYTES {
            return Err(WireError::BadLength(bytes.len() as i64));
        }

        let mut filter = QueryFilter::new();
        for (index, chunk) in bytes.chunks(8).enumerate() {
            let mut word = [0; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            filter.words[index] = u64::from_le_bytes(word);
        }

        Ok(filter)
    }

    /// Appends the filter to `message`, optionally compressing it.
    pub fn wire_serialize_with(&self, message: &mut WireMessage, compress: bool) {
        DataPackage::new(self.to_bytes(), compress).wire_serialize(message);
    }

    /// Builds a `QHaT` message for this filter.
    pub fn to_message_with(&self, compress: bool) -> WireMessage {
        let mut message = WireMessage::new(Self::TAG);
        self.wire_serialize_with(&mut message, compress);
        message
    }
}

/// Lower-cases a single UTF-16 unit, leaving it unchanged when the
/// lower-case form is not a single unit.
fn lower_utf16(unit: u16) -> u16 {
    let Some(c) = char::from_u32(u32::from(unit)) else {
        // Unpaired surrogates have no case.
        return unit;
    };

    let mut lower = c.to_lowercase();
    match (lower.next(), lower.next()) {
        (Some(l), None) => u16::try_from(u32::from(l)).unwrap_or(unit),
        _ => unit,
    }
}

impl WireSerialize for QueryFilter {
    fn wire_serialize(&self, message: &mut WireMessage) {
        self.wire_serialize_with(message, true);
    }
}

impl WireDeserialize for QueryFilter {
    fn wire_deserialize(reader: &mut MessageReader<'_>) -> Result<Self, WireError> {
        let package = DataPackage::wire_deserialize(reader)?;
        QueryFilter::from_bytes(&package.into_data(FILTER_BYTES)?)
    }
}

impl TaggedMessage for QueryFilter {
    const TAG: Tag = Tag::QUERY_FILTER;
}

/// Raised when the bits of a [`LocalQueryFilter`] change.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FilterChanged;

#[derive(Debug, Default)]
struct LocalState {
    filter: QueryFilter,
    update_depth: usize,
    pending: bool,
}

/// This node's own query filter, with change notifications.
///
/// Changes made between [`begin_update`](Self::begin_update) and the
/// matching [`end_update`](Self::end_update) raise at most one notification.
#[derive(Debug, Default)]
pub struct LocalQueryFilter {
    state: Mutex<LocalState>,
    events: Registry<FilterChanged>,
}

impl LocalQueryFilter {
    /// Returns an empty filter.
    pub fn new() -> LocalQueryFilter {
        LocalQueryFilter::default()
    }

    /// Subscribes to [`FilterChanged`] notifications.
    pub fn subscribe(&self) -> Subscription<FilterChanged> {
        self.events.subscribe()
    }

    fn mutate(&self, f: impl FnOnce(&mut QueryFilter) -> bool) -> bool {
        let notify = {
            let mut state = self.state.lock().expect("mutex should be unpoisoned");
            let changed = f(&mut state.filter);
            if changed && state.update_depth > 0 {
                state.pending = true;
            }
            changed && state.update_depth == 0
        };

        if notify {
            self.events.notify(FilterChanged);
        }

        notify
    }

    /// Adds `value`, returning `true` if the filter changed.
    pub fn add(&self, value: &str) -> bool {
        let mut changed = false;
        self.mutate(|filter| {
            changed = filter.add(value);
            changed
        });
        changed
    }

    /// ORs `other` into the filter, returning `true` if the filter changed.
    pub fn add_filter(&self, other: &QueryFilter) -> bool {
        let mut changed = false;
        self.mutate(|filter| {
            changed = filter.add_filter(other);
            changed
        });
        changed
    }

    /// Replaces the filter contents, returning `true` if the filter changed.
    pub fn set(&self, other: &QueryFilter) -> bool {
        let mut changed = false;
        self.mutate(|filter| {
            changed = filter.set(other);
            changed
        });
        changed
    }

    /// Suspends change notifications until the matching [`end_update`](Self::end_update).
    pub fn begin_update(&self) {
        self.state
            .lock()
            .expect("mutex should be unpoisoned")
            .update_depth += 1;
    }

    /// Resumes change notifications, raising one if anything changed while suspended.
    pub fn end_update(&self) {
        let notify = {
            let mut state = self.state.lock().expect("mutex should be unpoisoned");
            state.update_depth = state.update_depth.saturating_sub(1);
            let notify = state.update_depth == 0 && state.pending;
            if notify {
                state.pending = false;
            }
            notify
        };

        if notify {
            self.events.notify(FilterChanged);
        }
    }

    /// Could `value` be in the filter?
    pub fn may_contain(&self, value: &str) -> bool {
        self.state
            .lock()
            .expect("mutex should be unpoisoned")
            .filter
            .may_contain(value)
    }

    /// Returns a copy of the current filter.
    pub fn snapshot(&self) -> QueryFilter {
        self.state
            .lock()
            .expect("mutex should be unpoisoned")
            .filter
            .clone()
    }
}

/// A lazily rebuilt amalgamated filter.
///
/// The cache is invalidated whenever a contributing filter changes, and
/// rebuilt on the next read.
#[derive(Debug, Default)]
pub struct AmalgamatedFilter {
    cached: Mutex<Option<Arc<QueryFilter>>>,
}

impl AmalgamatedFilter {
    /// Returns the cached filter, building it with `build` if the cache is empty.
    pub fn get_or_build(&self, build: impl FnOnce() -> QueryFilter) -> Arc<QueryFilter> {
        let mut cached = self.cached.lock().expect("mutex should be unpoisoned");
        cached.get_or_insert_with(|| Arc::new(build())).clone()
    }

    /// Discards the cached filter.
    pub fn invalidate(&self) {
        *self.cached.lock().expect("mutex should be unpoisoned") = None;
    }

    /// Is there a cached filter?
    pub fn is_cached(&self) -> bool {
        self.cached
            .lock()
            .expect("mutex should be unpoisoned")
            .is_some()
    }
}
