use std::collections::{BTreeMap, BTreeSet};
use serde::{Deserialize, Serialize};
use crate::content::ContentId;

/// A generic trait for implementing new replacement policies. Can be used to parameterise a Cache.
///
/// The cache owns the entries and the byte accounting, the policy only decides the order in which
/// entries leave
pub trait ReplacementPolicy {
    /// Registers a newly stored item
    fn update_on_insert(&mut self, content: ContentId);

    /// Updates the policy when a cached item is read
    ///
    /// Not applicable for some policies, a default which does nothing is provided
    fn update_on_read(&mut self, _content: ContentId) {}

    /// Forgets an item which has left the cache
    fn update_on_remove(&mut self, content: ContentId);

    /// The next item to evict, if any
    fn victim(&self) -> Option<ContentId>;

    /// Every tracked item, next victim first
    fn eviction_order(&self) -> Vec<ContentId>;
}

/// Items ordered by a logical clock. Tracking logical time means a single ordered map answers
/// both "where is this item" and "which item is oldest"
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct LogicalQueue {
    time: u64,
    stamps: BTreeMap<ContentId, u64>,
    order: BTreeMap<u64, ContentId>,
}

impl LogicalQueue {
    fn stamp(&mut self, content: ContentId) {
        if let Some(old) = self.stamps.insert(content, self.time) {
            self.order.remove(&old);
        }
        self.order.insert(self.time, content);
        self.time += 1;
    }

    fn remove(&mut self, content: ContentId) {
        if let Some(old) = self.stamps.remove(&content) {
            self.order.remove(&old);
        }
    }

    fn front(&self) -> Option<ContentId> {
        self.order.values().next().copied()
    }

    fn ordered(&self) -> Vec<ContentId> {
        self.order.values().copied().collect()
    }
}

/// Least Recently Used replacement policy. Both inserts and reads move an item to the back
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeastRecentlyUsed {
    queue: LogicalQueue,
}

impl ReplacementPolicy for LeastRecentlyUsed {
    fn update_on_insert(&mut self, content: ContentId) {
        self.queue.stamp(content);
    }

    fn update_on_read(&mut self, content: ContentId) {
        self.queue.stamp(content);
    }

    fn update_on_remove(&mut self, content: ContentId) {
        self.queue.remove(content);
    }

    fn victim(&self) -> Option<ContentId> {
        self.queue.front()
    }

    fn eviction_order(&self) -> Vec<ContentId> {
        self.queue.ordered()
    }
}

/// First In First Out replacement policy. Reads never change the order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirstInFirstOut {
    queue: LogicalQueue,
}

impl ReplacementPolicy for FirstInFirstOut {
    fn update_on_insert(&mut self, content: ContentId) {
        self.queue.stamp(content);
    }

    fn update_on_remove(&mut self, content: ContentId) {
        self.queue.remove(content);
    }

    fn victim(&self) -> Option<ContentId> {
        self.queue.front()
    }

    fn eviction_order(&self) -> Vec<ContentId> {
        self.queue.ordered()
    }
}

/// Least frequently used replacement policy
///
/// New items start with a usage count of one. Ties are broken by the oldest insertion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeastFrequentlyUsed {
    time: u64,
    // content -> (usages, insertion time)
    usages: BTreeMap<ContentId, (u64, u64)>,
    order: BTreeSet<(u64, u64, ContentId)>,
}

impl LeastFrequentlyUsed {
    /// Number of reads plus the initial insert, for a tracked item
    pub fn usage_count(&self, content: ContentId) -> Option<u64> {
        self.usages.get(&content).map(|(count, _)| *count)
    }
}

impl ReplacementPolicy for LeastFrequentlyUsed {
    fn update_on_insert(&mut self, content: ContentId) {
        self.update_on_remove(content);
        self.usages.insert(content, (1, self.time));
        self.order.insert((1, self.time, content));
        self.time += 1;
    }

    fn update_on_read(&mut self, content: ContentId) {
        if let Some((count, inserted)) = self.usages.get_mut(&content) {
            self.order.remove(&(*count, *inserted, content));
            *count += 1;
            self.order.insert((*count, *inserted, content));
        }
    }

    fn update_on_remove(&mut self, content: ContentId) {
        if let Some((count, inserted)) = self.usages.remove(&content) {
            self.order.remove(&(count, inserted, content));
        }
    }

    fn victim(&self) -> Option<ContentId> {
        self.order.iter().next().map(|(_, _, content)| *content)
    }

    fn eviction_order(&self) -> Vec<ContentId> {
        self.order.iter().map(|(_, _, content)| *content).collect()
    }
}
