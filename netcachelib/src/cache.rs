use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::coloring::{content_color, ColorId};
use crate::config::CacheTypeConfig;
use crate::content::ContentId;
use crate::error::{Error, Result};
use crate::replacement_policies::{FirstInFirstOut, LeastFrequentlyUsed, LeastRecentlyUsed, ReplacementPolicy};

/// The contract every cache store honours, whatever its eviction discipline
///
/// Capacities and sizes are in bytes. After every operation the occupied size is at most the
/// capacity, and no content identifier is held twice
pub trait CacheStore {
    /// Looks an item up, returning true on a cache hit, and false otherwise
    ///
    /// On a hit the implementation must update its replacement policy
    fn lookup(&mut self, content: ContentId) -> bool;

    /// Stores an item, evicting as needed. Returns the evicted identifiers
    ///
    /// Inserting an item which can never fit fails with [`Error::CapacityExceeded`] and leaves the
    /// store untouched
    fn insert(&mut self, content: ContentId, size: u64) -> Result<Vec<ContentId>>;

    /// Evicts until an item of `incoming_size` bytes would fit. Returns the evicted identifiers
    fn evict_if_needed(&mut self, incoming_size: u64) -> Vec<ContentId>;

    /// Occupied bytes
    fn size(&self) -> u64;

    fn capacity(&self) -> u64;

    /// Membership test which leaves the replacement policy untouched
    fn contains(&self, content: ContentId) -> bool;

    /// Every held identifier, next victim first
    fn contents(&self) -> Vec<ContentId>;

    /// Tags the store with a color. Only color-partitioned stores react to this
    fn set_server_color(&mut self, _color: ColorId, _palette: &[ColorId]) {}
}

/// A generic cache implementation, parameterised by a replacement policy
///
/// The cache does all the byte accounting, so every policy shares one capacity contract and only
/// has to decide who leaves next
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cache<R: ReplacementPolicy> {
    capacity: u64,
    occupied: u64,
    entries: BTreeMap<ContentId, u64>,
    replacement_policy: R,
}

impl<R: ReplacementPolicy + Default> Cache<R> {
    pub fn new(capacity: u64) -> Self {
        Self::with_policy(capacity, R::default())
    }
}

impl<R: ReplacementPolicy> Cache<R> {
    pub fn with_policy(capacity: u64, policy: R) -> Self {
        Self {
            capacity,
            occupied: 0,
            entries: BTreeMap::new(),
            replacement_policy: policy,
        }
    }

    pub fn policy(&self) -> &R {
        &self.replacement_policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes an item, returning its size
    pub fn remove(&mut self, content: ContentId) -> Option<u64> {
        let size = self.entries.remove(&content)?;
        self.occupied -= size;
        self.replacement_policy.update_on_remove(content);
        Some(size)
    }

    /// Held items with their sizes, next victim first
    pub fn entries(&self) -> Vec<(ContentId, u64)> {
        self.replacement_policy
            .eviction_order()
            .into_iter()
            .map(|c| (c, self.entries[&c]))
            .collect()
    }

    /// Evicts until `occupied + incoming <= limit`
    fn make_room(&mut self, limit: u64, incoming: u64) -> Vec<ContentId> {
        let mut evicted = Vec::new();
        while self.occupied + incoming > limit {
            let Some(victim) = self.replacement_policy.victim() else {
                break;
            };
            self.remove(victim);
            evicted.push(victim);
        }
        evicted
    }

    fn check_invariant(&self) {
        assert!(
            self.occupied <= self.capacity,
            "cache invariant violated: {} bytes occupied with capacity {}",
            self.occupied,
            self.capacity
        );
        debug_assert_eq!(self.occupied, self.entries.values().sum::<u64>());
    }
}

impl<R: ReplacementPolicy> CacheStore for Cache<R> {
    fn lookup(&mut self, content: ContentId) -> bool {
        if self.entries.contains_key(&content) {
            self.replacement_policy.update_on_read(content);
            true
        } else {
            false
        }
    }

    fn insert(&mut self, content: ContentId, size: u64) -> Result<Vec<ContentId>> {
        if size > self.capacity {
            return Err(Error::CapacityExceeded { content, size, capacity: self.capacity });
        }
        match self.entries.get(&content) {
            Some(existing) if *existing == size => {
                self.replacement_policy.update_on_read(content);
                return Ok(Vec::new());
            }
            Some(_) => {
                self.remove(content);
            }
            None => {}
        }
        let evicted = self.evict_if_needed(size);
        self.entries.insert(content, size);
        self.occupied += size;
        self.replacement_policy.update_on_insert(content);
        self.check_invariant();
        Ok(evicted)
    }

    fn evict_if_needed(&mut self, incoming_size: u64) -> Vec<ContentId> {
        self.make_room(self.capacity, incoming_size)
    }

    fn size(&self) -> u64 {
        self.occupied
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn contains(&self, content: ContentId) -> bool {
        self.entries.contains_key(&content)
    }

    fn contents(&self) -> Vec<ContentId> {
        self.replacement_policy.eviction_order()
    }
}

/// Color-partitioned cache
///
/// Content of the store's own color lives in an LRU region bounded by `capacity_ratio * capacity`.
/// Content of other colors passing through lives in an overflow LRU region which may use whatever
/// the own region leaves free, and gives way first when the store as a whole runs short. Own-color
/// content is never evicted to admit overflow content.
///
/// Until a color is assigned every item counts as own-color
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridCache {
    capacity: u64,
    capacity_ratio: f64,
    color: Option<ColorId>,
    palette: Vec<ColorId>,
    own: Cache<LeastRecentlyUsed>,
    overflow: Cache<LeastRecentlyUsed>,
}

impl HybridCache {
    pub fn new(capacity: u64, capacity_ratio: f64) -> Result<Self> {
        if !(capacity_ratio > 0.0 && capacity_ratio <= 1.0) {
            return Err(Error::config(format!("capacityRatio must lie in (0, 1], got {capacity_ratio}")));
        }
        let own_capacity = (capacity as f64 * capacity_ratio).floor() as u64;
        Ok(Self {
            capacity,
            capacity_ratio,
            color: None,
            palette: Vec::new(),
            own: Cache::new(own_capacity),
            overflow: Cache::new(capacity),
        })
    }

    pub fn color(&self) -> Option<ColorId> {
        self.color
    }

    pub fn capacity_ratio(&self) -> f64 {
        self.capacity_ratio
    }

    /// Bytes held by own-color content
    pub fn own_size(&self) -> u64 {
        self.own.size()
    }

    pub fn own_capacity(&self) -> u64 {
        self.own.capacity()
    }

    /// Bytes held by content of other colors
    pub fn overflow_size(&self) -> u64 {
        self.overflow.size()
    }

    pub fn is_own_color(&self, content: ContentId) -> bool {
        match self.color {
            None => true,
            Some(color) => content_color(content, &self.palette).map_or(true, |c| c == color),
        }
    }

    fn check_invariant(&self) {
        assert!(
            self.own.size() + self.overflow.size() <= self.capacity,
            "hybrid cache invariant violated: {} + {} bytes occupied with capacity {}",
            self.own.size(),
            self.overflow.size(),
            self.capacity
        );
    }
}

impl CacheStore for HybridCache {
    fn lookup(&mut self, content: ContentId) -> bool {
        self.own.lookup(content) || self.overflow.lookup(content)
    }

    fn insert(&mut self, content: ContentId, size: u64) -> Result<Vec<ContentId>> {
        if size > self.capacity {
            return Err(Error::CapacityExceeded { content, size, capacity: self.capacity });
        }
        let evicted = if self.is_own_color(content) {
            if size > self.own.capacity() {
                return Err(Error::CapacityExceeded { content, size, capacity: self.own.capacity() });
            }
            self.overflow.remove(content);
            self.own.remove(content);
            // The own region trims to its bound first, overflow only gives up what is still missing
            let mut evicted = self.own.evict_if_needed(size);
            let budget = self.capacity.saturating_sub(self.own.size() + size);
            evicted.extend(self.overflow.make_room(budget, 0));
            evicted.extend(self.own.insert(content, size)?);
            evicted
        } else {
            let available = self.capacity - self.own.size();
            if size > available {
                return Err(Error::CapacityExceeded { content, size, capacity: available });
            }
            self.own.remove(content);
            self.overflow.remove(content);
            let mut evicted = self.overflow.make_room(available, size);
            evicted.extend(self.overflow.insert(content, size)?);
            evicted
        };
        self.check_invariant();
        Ok(evicted)
    }

    fn evict_if_needed(&mut self, incoming_size: u64) -> Vec<ContentId> {
        let mut evicted = self.overflow.make_room(self.capacity.saturating_sub(self.own.size()), incoming_size);
        if self.own.size() + self.overflow.size() + incoming_size > self.capacity {
            evicted.extend(self.own.evict_if_needed(incoming_size));
        }
        evicted
    }

    fn size(&self) -> u64 {
        self.own.size() + self.overflow.size()
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn contains(&self, content: ContentId) -> bool {
        self.own.contains(content) || self.overflow.contains(content)
    }

    fn contents(&self) -> Vec<ContentId> {
        let mut contents = self.overflow.contents();
        contents.extend(self.own.contents());
        contents
    }

    fn set_server_color(&mut self, color: ColorId, palette: &[ColorId]) {
        self.color = Some(color);
        self.palette = palette.to_vec();
        // Re-file anything already held under the new classification, oldest first
        let held: Vec<(ContentId, u64)> = self.overflow.entries().into_iter().chain(self.own.entries()).collect();
        self.own = Cache::new(self.own.capacity());
        self.overflow = Cache::new(self.capacity);
        for (content, size) in held {
            // Items that no longer fit their region are dropped
            if let Err(e) = self.insert(content, size) {
                debug!("dropped while re-coloring: {e}");
            }
        }
    }
}

/// Enum for all 4 types of cache store provided by the library
///
/// Explicitly branching on all implementations lets the compiler reason about the concrete types
/// and inline the replacement policies, which is much faster than a trait object on the hot
/// routing path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GenericCache {
    LeastRecentlyUsed(Cache<LeastRecentlyUsed>),
    LeastFrequentlyUsed(Cache<LeastFrequentlyUsed>),
    FirstInFirstOut(Cache<FirstInFirstOut>),
    Hybrid(HybridCache),
}

impl GenericCache {
    /// Creates an empty store of the configured kind
    pub fn new(kind: CacheTypeConfig, capacity: u64, capacity_ratio: Option<f64>) -> Result<Self> {
        Ok(match kind {
            CacheTypeConfig::LeastRecentlyUsed => Cache::<LeastRecentlyUsed>::new(capacity).into(),
            CacheTypeConfig::LeastFrequentlyUsed => Cache::<LeastFrequentlyUsed>::new(capacity).into(),
            CacheTypeConfig::FirstInFirstOut => Cache::<FirstInFirstOut>::new(capacity).into(),
            CacheTypeConfig::Hybrid => {
                let ratio = capacity_ratio.ok_or_else(|| Error::config("Hybrid caches need a capacityRatio"))?;
                HybridCache::new(capacity, ratio)?.into()
            }
        })
    }

    pub fn kind(&self) -> CacheTypeConfig {
        match self {
            GenericCache::LeastRecentlyUsed(_) => CacheTypeConfig::LeastRecentlyUsed,
            GenericCache::LeastFrequentlyUsed(_) => CacheTypeConfig::LeastFrequentlyUsed,
            GenericCache::FirstInFirstOut(_) => CacheTypeConfig::FirstInFirstOut,
            GenericCache::Hybrid(_) => CacheTypeConfig::Hybrid,
        }
    }

    pub fn as_hybrid(&self) -> Option<&HybridCache> {
        match self {
            GenericCache::Hybrid(c) => Some(c),
            _ => None,
        }
    }
}

impl From<Cache<LeastRecentlyUsed>> for GenericCache {
    fn from(value: Cache<LeastRecentlyUsed>) -> Self {
        Self::LeastRecentlyUsed(value)
    }
}

impl From<Cache<LeastFrequentlyUsed>> for GenericCache {
    fn from(value: Cache<LeastFrequentlyUsed>) -> Self {
        Self::LeastFrequentlyUsed(value)
    }
}

impl From<Cache<FirstInFirstOut>> for GenericCache {
    fn from(value: Cache<FirstInFirstOut>) -> Self {
        Self::FirstInFirstOut(value)
    }
}

impl From<HybridCache> for GenericCache {
    fn from(value: HybridCache) -> Self {
        Self::Hybrid(value)
    }
}

impl CacheStore for GenericCache {
    fn lookup(&mut self, content: ContentId) -> bool {
        match self {
            GenericCache::LeastRecentlyUsed(c) => c.lookup(content),
            GenericCache::LeastFrequentlyUsed(c) => c.lookup(content),
            GenericCache::FirstInFirstOut(c) => c.lookup(content),
            GenericCache::Hybrid(c) => c.lookup(content),
        }
    }

    fn insert(&mut self, content: ContentId, size: u64) -> Result<Vec<ContentId>> {
        match self {
            GenericCache::LeastRecentlyUsed(c) => c.insert(content, size),
            GenericCache::LeastFrequentlyUsed(c) => c.insert(content, size),
            GenericCache::FirstInFirstOut(c) => c.insert(content, size),
            GenericCache::Hybrid(c) => c.insert(content, size),
        }
    }

    fn evict_if_needed(&mut self, incoming_size: u64) -> Vec<ContentId> {
        match self {
            GenericCache::LeastRecentlyUsed(c) => c.evict_if_needed(incoming_size),
            GenericCache::LeastFrequentlyUsed(c) => c.evict_if_needed(incoming_size),
            GenericCache::FirstInFirstOut(c) => c.evict_if_needed(incoming_size),
            GenericCache::Hybrid(c) => c.evict_if_needed(incoming_size),
        }
    }

    fn size(&self) -> u64 {
        match self {
            GenericCache::LeastRecentlyUsed(c) => c.size(),
            GenericCache::LeastFrequentlyUsed(c) => c.size(),
            GenericCache::FirstInFirstOut(c) => c.size(),
            GenericCache::Hybrid(c) => c.size(),
        }
    }

    fn capacity(&self) -> u64 {
        match self {
            GenericCache::LeastRecentlyUsed(c) => c.capacity(),
            GenericCache::LeastFrequentlyUsed(c) => c.capacity(),
            GenericCache::FirstInFirstOut(c) => c.capacity(),
            GenericCache::Hybrid(c) => c.capacity(),
        }
    }

    fn contains(&self, content: ContentId) -> bool {
        match self {
            GenericCache::LeastRecentlyUsed(c) => c.contains(content),
            GenericCache::LeastFrequentlyUsed(c) => c.contains(content),
            GenericCache::FirstInFirstOut(c) => c.contains(content),
            GenericCache::Hybrid(c) => c.contains(content),
        }
    }

    fn contents(&self) -> Vec<ContentId> {
        match self {
            GenericCache::LeastRecentlyUsed(c) => c.contents(),
            GenericCache::LeastFrequentlyUsed(c) => c.contents(),
            GenericCache::FirstInFirstOut(c) => c.contents(),
            GenericCache::Hybrid(c) => c.contents(),
        }
    }

    fn set_server_color(&mut self, color: ColorId, palette: &[ColorId]) {
        if let GenericCache::Hybrid(c) = self {
            c.set_server_color(color, palette);
        }
    }
}
