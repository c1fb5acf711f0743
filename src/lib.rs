//! A bounded, time-expiring, reference-counted buffer cache for transient
//! file system metadata (directory enumeration pages, security descriptors).
//!
//! Producers [`add`](MetaCache::add) a blob and get back an opaque
//! [`ItemIndex`]. Consumers [`reference`](MetaCache::reference) that index to
//! get an [`ItemRef`] over the cached bytes; the bytes stay valid until the
//! `ItemRef` is released, even if the cache evicts the entry meanwhile. Every
//! item expires a fixed TTL after insertion; a periodic caller reclaims
//! expired items with [`expire_sweep`](MetaCache::expire_sweep).
//!
//! ```
//! use meta_cache::{AddItemError, MetaCache};
//! use std::time::Duration;
//!
//! let cache = MetaCache::new(2, 64, Duration::from_millis(100)).unwrap();
//!
//! let a = cache.add(b"A").unwrap();
//! let b = cache.add(b"B").unwrap();
//! assert_eq!((a.get(), b.get()), (1, 2));
//! assert_eq!(cache.add(b"C"), Err(AddItemError::AtCapacity { capacity: 2 }));
//!
//! let item = cache.reference(a).unwrap();
//! assert_eq!(&*item, b"A");
//! MetaCache::dereference(item);
//! ```

mod clock;
mod error;
mod index;
mod item;

pub(crate) mod metrics;
pub(crate) mod sync;
pub(crate) mod util;


use index::*;
use item::CacheItem;

pub use clock::{Clock, MAX_TTL, ManualClock, MonotonicClock};
pub use clocksource::precise::Instant;
pub use error::{AddItemError, CreateError};
pub use item::{ITEM_HEADER_SIZE, ItemIndex, ItemRef};
pub use metrics::{CacheMetrics, Counter, Gauge};
pub use std::time::Duration;

use sync::{Arc, SpinLock};
use tracing::{debug, trace};

/// Size of the index arena when none is configured: one 4 KiB page
pub const DEFAULT_ARENA_SIZE: usize = 4096;

/// Builder for constructing a MetaCache with custom configuration
pub struct MetaCacheBuilder {
    capacity: usize,
    item_size_max: usize,
    ttl: Duration,
    arena_size: usize,
    clock: std::sync::Arc<dyn Clock>,
}

impl MetaCacheBuilder {
    /// Create a new MetaCacheBuilder with default settings
    pub fn new() -> Self {
        Self {
            capacity: 100,
            item_size_max: 16 * 1024,
            ttl: Duration::from_secs(1),
            arena_size: DEFAULT_ARENA_SIZE,
            clock: std::sync::Arc::new(MonotonicClock),
        }
    }

    /// Set the maximum number of live items. Default is 100.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the maximum size of one item in bytes, including
    /// [`ITEM_HEADER_SIZE`]. Default is 16KB.
    pub fn item_size_max(mut self, size: usize) -> Self {
        self.item_size_max = size;
        self
    }

    /// Set the time-to-live applied to every item at insertion. Default is
    /// one second. Values above [`MAX_TTL`] are clamped.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the size in bytes of the index arena.
    ///
    /// The bucket count is derived from the space left after the index
    /// header. Default is one 4 KiB page.
    pub fn arena_size(mut self, size: usize) -> Self {
        self.arena_size = size;
        self
    }

    /// Set the time source used to stamp and expire items
    pub fn clock(mut self, clock: std::sync::Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the MetaCache with the configured settings
    pub fn build(self) -> Result<MetaCache, CreateError> {
        let bucket_count = Index::bucket_count_for(self.arena_size);
        let index = Index::new(self.capacity, bucket_count)?;
        let ttl = self.ttl.min(MAX_TTL);

        debug!(
            capacity = self.capacity,
            item_size_max = self.item_size_max,
            ttl_ms = ttl.as_millis() as u64,
            bucket_count,
            "created meta cache"
        );

        Ok(MetaCache {
            index: SpinLock::new(index),
            capacity: self.capacity,
            item_size_max: self.item_size_max,
            ttl,
            expire_after: clock::ttl_duration(ttl),
            bucket_count,
            clock: self.clock,
            metrics: std::sync::Arc::new(CacheMetrics::new()),
        })
    }
}

impl Default for MetaCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded cache of immutable metadata buffers with a fixed TTL.
///
/// All methods take `&self` and may be called from any number of threads;
/// share the cache with an `Arc`. Index updates are serialized by a spin
/// lock held only for short, allocation-free critical sections. Reference
/// counts are updated atomically outside the lock.
pub struct MetaCache {
    index: SpinLock<Index>,
    capacity: usize,
    item_size_max: usize,
    ttl: Duration,
    expire_after: clocksource::precise::Duration,
    bucket_count: usize,
    clock: std::sync::Arc<dyn Clock>,
    metrics: std::sync::Arc<CacheMetrics>,
}

impl MetaCache {
    /// Create a cache holding at most `capacity` items of at most
    /// `item_size_max` bytes each (header included), every one expiring `ttl`
    /// after insertion.
    ///
    /// For other settings, use [`MetaCache::builder`].
    pub fn new(capacity: usize, item_size_max: usize, ttl: Duration) -> Result<Self, CreateError> {
        MetaCacheBuilder::new()
            .capacity(capacity)
            .item_size_max(item_size_max)
            .ttl(ttl)
            .build()
    }

    pub fn builder() -> MetaCacheBuilder {
        MetaCacheBuilder::new()
    }

    /// Get a reference to the cache metrics
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn item_size_max(&self) -> usize {
        self.item_size_max
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Number of items currently indexed
    pub fn len(&self) -> usize {
        self.index.with(|index| index.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `bytes` into the cache.
    ///
    /// Returns the index under which the copy can be referenced until it is
    /// invalidated or swept. On any error nothing is inserted.
    ///
    /// # Errors
    ///
    /// - `Oversized` if `ITEM_HEADER_SIZE + bytes.len()` exceeds
    ///   `item_size_max`; checked before allocating
    /// - `OutOfMemory` if the copy cannot be allocated
    /// - `AtCapacity` if `capacity` items are already live
    pub fn add(&self, bytes: &[u8]) -> Result<ItemIndex, AddItemError> {
        let size = ITEM_HEADER_SIZE.saturating_add(bytes.len());
        if size > self.item_size_max {
            self.metrics.item_add_oversized.increment();
            trace!(size, max = self.item_size_max, "rejected oversized item");
            return Err(AddItemError::Oversized {
                size,
                max: self.item_size_max,
            });
        }

        let expire_at = self.clock.now() + self.expire_after;
        let item = match CacheItem::new(bytes, expire_at, &self.metrics) {
            Ok(item) => Arc::new(item),
            Err(e) => {
                self.metrics.item_add_oom.increment();
                trace!(size, "failed to allocate item buffer");
                return Err(e);
            }
        };

        match self.index.with(|index| index.insert(item)) {
            Ok(index) => {
                self.metrics.item_add.increment();
                self.metrics.items_live.increment();
                Ok(index)
            }
            Err(item) => {
                // Free the rejected copy outside the lock
                drop(item);
                self.metrics.item_add_at_capacity.increment();
                trace!(capacity = self.capacity, "rejected item, cache at capacity");
                Err(AddItemError::AtCapacity {
                    capacity: self.capacity,
                })
            }
        }
    }

    /// Take a counted reference to the item at `index`.
    ///
    /// Returns `None` if the index was never assigned, or the item has been
    /// invalidated or swept. Items past their TTL stay referenceable until a
    /// sweep removes them.
    pub fn reference(&self, index: ItemIndex) -> Option<ItemRef> {
        // The clone bumps the refcount before the lock is released, so a
        // concurrent invalidation can't free the item under us
        let item = self
            .index
            .with(|items| items.get(index.get()).map(Arc::clone));

        match item {
            Some(item) => {
                self.metrics.item_reference.increment();
                Some(ItemRef::new(item, index))
            }
            None => {
                self.metrics.item_reference_miss.increment();
                trace!(%index, "reference miss");
                None
            }
        }
    }

    /// Release a reference taken with [`reference`](Self::reference).
    ///
    /// Equivalent to dropping it. If the item has already left the cache and
    /// this was the last reference, the buffer is freed here.
    pub fn dereference(item: ItemRef) {
        drop(item);
    }

    /// Remove the item at `index` from the cache.
    ///
    /// Outstanding references stay valid. Returns whether an item was
    /// removed; an unknown index is a no-op.
    pub fn invalidate_item(&self, index: ItemIndex) -> bool {
        match self.index.with(|items| items.remove(index.get())) {
            Some(item) => {
                self.metrics.items_live.decrement();
                self.metrics.item_invalidate.increment();
                drop(item);
                true
            }
            None => {
                self.metrics.item_invalidate_not_found.increment();
                false
            }
        }
    }

    /// Remove every item regardless of expiration. Returns the number removed.
    pub fn invalidate_all(&self) -> usize {
        let removed = self.invalidate_items(Cutoff::All);
        self.metrics.item_invalidate.add(removed as u64);
        removed
    }

    /// Remove every item whose TTL has elapsed. Returns the number removed.
    ///
    /// Meant to be driven periodically by a timer owned by the caller.
    pub fn expire_sweep(&self) -> usize {
        let removed = self.invalidate_items(Cutoff::At(self.clock.now()));
        if removed > 0 {
            self.metrics.item_expire.add(removed as u64);
            debug!(removed, "expired meta cache items");
        }
        removed
    }

    /// Destroy the cache, evicting everything first.
    ///
    /// Buffers still held through an [`ItemRef`] are freed when those
    /// references are released.
    pub fn delete(self) {
        drop(self);
    }

    /// Pop list heads covered by `cutoff`, one lock acquisition per item so
    /// other callers interleave with a long sweep.
    fn invalidate_items(&self, cutoff: Cutoff) -> usize {
        let mut removed = 0;

        while let Some(item) = self.index.with(|index| index.pop_expired(cutoff)) {
            self.metrics.items_live.decrement();
            // Drop the structural reference outside the lock
            drop(item);
            removed += 1;
        }

        removed
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        self.index.with(|index| index.assert_consistent());
    }

    #[cfg(test)]
    pub(crate) fn indices(&self) -> Vec<u64> {
        self.index.with(|index| index.indices())
    }
}

impl Drop for MetaCache {
    fn drop(&mut self) {
        let removed = self.invalidate_all();
        debug!(removed, "deleted meta cache");
    }
}

impl std::fmt::Debug for MetaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaCache")
            .field("capacity", &self.capacity)
            .field("item_size_max", &self.item_size_max)
            .field("ttl", &self.ttl)
            .field("bucket_count", &self.bucket_count)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod cache_tests {
    use super::*;

    fn manual_cache(capacity: usize, ttl: Duration) -> (MetaCache, std::sync::Arc<ManualClock>) {
        let clock = std::sync::Arc::new(ManualClock::new());
        let cache = MetaCache::builder()
            .capacity(capacity)
            .item_size_max(64)
            .ttl(ttl)
            .clock(clock.clone())
            .build()
            .unwrap();
        (cache, clock)
    }

    #[test]
    fn test_add_and_reference() {
        let cache = MetaCache::new(8, 256, Duration::from_secs(60)).unwrap();

        let index = cache.add(b"dirinfo").unwrap();
        let item = cache.reference(index).unwrap();

        assert_eq!(item.bytes(), b"dirinfo");
        assert_eq!(item.len(), 7);
        assert_eq!(item.index(), index);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.metrics().item_reference.value(), 1);
        cache.assert_consistent();
    }

    #[test]
    fn test_size_limit_counts_header() {
        let cache = MetaCache::new(8, ITEM_HEADER_SIZE + 4, Duration::from_secs(60)).unwrap();

        assert!(cache.add(b"1234").is_ok());
        assert_eq!(
            cache.add(b"12345"),
            Err(AddItemError::Oversized {
                size: ITEM_HEADER_SIZE + 5,
                max: ITEM_HEADER_SIZE + 4,
            })
        );

        // Rejected before allocating
        assert_eq!(cache.metrics().buffers_live.value(), 1);
        assert_eq!(cache.metrics().item_add_oversized.value(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_item_size_max_below_header_rejects_everything() {
        let cache = MetaCache::new(8, ITEM_HEADER_SIZE - 1, Duration::from_secs(60)).unwrap();
        assert!(matches!(cache.add(&[]), Err(AddItemError::Oversized { .. })));
    }

    #[test]
    fn test_capacity_rejection_rolls_back() {
        let (cache, _clock) = manual_cache(2, Duration::from_millis(100));

        assert_eq!(cache.add(b"A").unwrap().get(), 1);
        assert_eq!(cache.add(b"B").unwrap().get(), 2);
        assert_eq!(
            cache.add(b"C"),
            Err(AddItemError::AtCapacity { capacity: 2 })
        );

        assert_eq!(cache.metrics().buffers_live.value(), 2);
        assert_eq!(cache.metrics().item_free.value(), 1);
        assert_eq!(cache.metrics().item_add_at_capacity.value(), 1);
        assert_eq!(cache.metrics().items_live.value(), 2);
        cache.assert_consistent();
    }

    #[test]
    fn test_expire_sweep_example() {
        let (cache, clock) = manual_cache(2, Duration::from_millis(100));

        let a = cache.add(b"A").unwrap();
        clock.advance(Duration::from_millis(10));
        let b = cache.add(b"B").unwrap();
        assert!(cache.add(b"C").is_err());

        // 100ms after A, before B expires
        clock.advance(Duration::from_millis(90));
        assert_eq!(cache.expire_sweep(), 1);
        assert!(cache.reference(a).is_none());
        assert!(cache.reference(b).is_some());

        let c = cache.add(b"C").unwrap();
        assert_eq!(c.get(), 3);
        assert_eq!(cache.indices(), vec![2, 3]);
        cache.assert_consistent();
    }

    #[test]
    fn test_expired_item_referenceable_until_swept() {
        let (cache, clock) = manual_cache(4, Duration::from_millis(100));

        let index = cache.add(b"stale").unwrap();
        clock.advance(Duration::from_millis(500));

        assert!(cache.reference(index).is_some());
        assert_eq!(cache.expire_sweep(), 1);
        assert!(cache.reference(index).is_none());
    }

    #[test]
    fn test_invalidate_item() {
        let (cache, _clock) = manual_cache(4, Duration::from_secs(1));

        let first = cache.add(b"first").unwrap();
        let second = cache.add(b"second").unwrap();

        assert!(cache.invalidate_item(first));
        assert!(!cache.invalidate_item(first));
        assert!(cache.reference(first).is_none());
        assert_eq!(&*cache.reference(second).unwrap(), b"second");

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.metrics().item_invalidate.value(), 1);
        assert_eq!(cache.metrics().item_invalidate_not_found.value(), 1);
        cache.assert_consistent();
    }

    #[test]
    fn test_reference_outlives_invalidation() {
        let (cache, _clock) = manual_cache(4, Duration::from_secs(1));
        let index = cache.add(b"held").unwrap();

        let held = cache.reference(index).unwrap();
        assert!(cache.invalidate_item(index));

        assert!(cache.reference(index).is_none());
        assert_eq!(held.bytes(), b"held");
        assert_eq!(cache.metrics().item_free.value(), 0);

        MetaCache::dereference(held);
        assert_eq!(cache.metrics().item_free.value(), 1);
        assert_eq!(cache.metrics().buffers_live.value(), 0);
    }

    #[test]
    fn test_invalidate_all_then_delete() {
        let (cache, _clock) = manual_cache(8, Duration::from_secs(1));
        for i in 0..8u8 {
            cache.add(&[i; 4]).unwrap();
        }

        assert_eq!(cache.invalidate_all(), 8);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.invalidate_all(), 0);

        let metrics = std::sync::Arc::clone(&cache.metrics);
        cache.delete();

        assert_eq!(metrics.item_free.value(), 8);
        assert_eq!(metrics.buffers_live.value(), 0);
        assert_eq!(metrics.items_live.value(), 0);
    }

    #[test]
    fn test_delete_keeps_outstanding_references() {
        let (cache, _clock) = manual_cache(2, Duration::from_secs(1));
        let index = cache.add(b"survivor").unwrap();
        let held = cache.reference(index).unwrap();
        let metrics = std::sync::Arc::clone(&cache.metrics);

        cache.delete();
        assert_eq!(metrics.buffers_live.value(), 1);
        assert_eq!(&*held, b"survivor");

        drop(held);
        assert_eq!(metrics.buffers_live.value(), 0);
    }

    #[test]
    fn test_bucket_count_from_arena_size() {
        let small = MetaCache::builder().arena_size(0).build().unwrap();
        assert_eq!(small.bucket_count(), 1);

        let page = MetaCache::builder().build().unwrap();
        let double = MetaCache::builder()
            .arena_size(2 * DEFAULT_ARENA_SIZE)
            .build()
            .unwrap();
        assert!(double.bucket_count() > page.bucket_count());
    }

    #[test]
    fn test_single_bucket_cache() {
        let cache = MetaCache::builder()
            .capacity(16)
            .arena_size(0)
            .build()
            .unwrap();

        let indices: Vec<_> = (0..16u8).map(|i| cache.add(&[i]).unwrap()).collect();
        for (i, index) in indices.iter().enumerate() {
            assert_eq!(cache.reference(*index).unwrap().bytes(), &[i as u8]);
        }

        for index in indices.iter().step_by(2) {
            assert!(cache.invalidate_item(*index));
        }
        cache.assert_consistent();
        assert_eq!(cache.len(), 8);
    }

    #[test]
    fn test_ttl_is_clamped() {
        let cache = MetaCache::builder()
            .ttl(Duration::from_secs(u64::MAX))
            .build()
            .unwrap();
        assert_eq!(cache.ttl(), MAX_TTL);
        assert!(cache.add(b"forever").is_ok());
        assert_eq!(cache.expire_sweep(), 0);
    }

    #[test]
    fn test_zero_ttl_expires_immediately() {
        let (cache, _clock) = manual_cache(4, Duration::ZERO);
        cache.add(b"gone").unwrap();
        assert_eq!(cache.expire_sweep(), 1);
        assert!(cache.is_empty());
    }
}
