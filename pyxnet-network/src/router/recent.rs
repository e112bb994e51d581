//! A bounded set of recently seen query GUIDs.

use indexmap::IndexSet;
use uuid::Uuid;

/// Remembers the last `capacity` query GUIDs, oldest first.
#[derive(Debug)]
pub struct RecentQueries {
    capacity: usize,
    seen: IndexSet<Uuid>,
}

impl RecentQueries {
    /// Returns an empty set that remembers up to `capacity` GUIDs.
    pub fn new(capacity: usize) -> RecentQueries {
        let capacity = capacity.max(1);

        RecentQueries {
            capacity,
            seen: IndexSet::with_capacity(capacity),
        }
    }

    /// Records `guid`, and returns `true` if it was already recorded.
    ///
    /// Seeing a GUID again does not refresh its age.
    pub fn check_and_insert(&mut self, guid: Uuid) -> bool {
        if self.seen.contains(&guid) {
            return true;
        }

        if self.seen.len() >= self.capacity {
            self.seen.shift_remove_index(0);
        }
        self.seen.insert(guid);

        false
    }

    /// The number of remembered GUIDs.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Are there no remembered GUIDs?
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
