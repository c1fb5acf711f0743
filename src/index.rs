//! Chained hash index plus insertion-ordered list over a fixed slot arena.
//!
//! Every live item occupies one slot. A slot is linked into two structures at
//! once: the singly linked chain of its bucket (`index % bucket_count`) and
//! the doubly linked insertion list. Unused slots are threaded onto a free
//! list through `next`. All links are `u32` slot handles, with `NIL` as the
//! terminator.
//!
//! ```text
//! buckets: [ 3 ][NIL][ 0 ][ 1 ] ...       chain:  slot.chain
//!            |         |    |
//! list:    head -> slot0 <-> slot1 <-> slot3 <- tail    (prev / next)
//! ```
//!
//! The whole structure lives behind the cache's spin lock, so nothing here is
//! atomic. Slots are allocated up front: no operation allocates or frees
//! memory. Removed items are handed back to the caller, who drops them after
//! releasing the lock.

use crate::error::CreateError;
use crate::item::{CacheItem, ItemIndex};
use crate::sync::Arc;
use clocksource::precise::Instant;

pub(crate) type SlotId = u32;

pub(crate) const NIL: SlotId = SlotId::MAX;

/// Largest capacity addressable with `SlotId` handles
pub(crate) const MAX_SLOTS: usize = NIL as usize;

/// Which items an invalidation pass removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cutoff {
    /// Everything, regardless of expiration time
    All,
    /// Items whose expiration time is at or before the instant
    At(Instant),
}

impl Cutoff {
    #[inline]
    fn covers(self, expire_at: Instant) -> bool {
        match self {
            Cutoff::All => true,
            Cutoff::At(now) => expire_at <= now,
        }
    }
}

struct Slot {
    item: Option<Arc<CacheItem>>,
    index: u64,
    /// Next slot in the same bucket chain
    chain: SlotId,
    /// Insertion list links; `next` doubles as the free list link
    prev: SlotId,
    next: SlotId,
}

pub(crate) struct Index {
    buckets: Box<[SlotId]>,
    slots: Box<[Slot]>,
    free: SlotId,
    head: SlotId,
    tail: SlotId,
    next_index: u64,
    len: usize,
}

impl Index {
    /// Number of buckets that fit in `arena_size` bytes after the index header.
    ///
    /// Always at least one.
    pub(crate) fn bucket_count_for(arena_size: usize) -> usize {
        let available = arena_size.saturating_sub(std::mem::size_of::<Index>());
        (available / std::mem::size_of::<SlotId>()).max(1)
    }

    pub(crate) fn new(capacity: usize, bucket_count: usize) -> Result<Self, CreateError> {
        if capacity > MAX_SLOTS {
            return Err(CreateError::CapacityTooLarge {
                capacity,
                max: MAX_SLOTS,
            });
        }
        let bucket_count = bucket_count.max(1);

        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(bucket_count)
            .map_err(|_| CreateError::OutOfMemory)?;
        buckets.resize(bucket_count, NIL);

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| CreateError::OutOfMemory)?;
        for id in 0..capacity {
            // Thread every slot onto the free list
            let next = if id + 1 < capacity {
                (id + 1) as SlotId
            } else {
                NIL
            };
            slots.push(Slot {
                item: None,
                index: 0,
                chain: NIL,
                prev: NIL,
                next,
            });
        }

        Ok(Self {
            buckets: buckets.into_boxed_slice(),
            slots: slots.into_boxed_slice(),
            free: if capacity > 0 { 0 } else { NIL },
            head: NIL,
            tail: NIL,
            next_index: 0,
            len: 0,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    fn bucket_of(&self, index: u64) -> usize {
        (index % self.buckets.len() as u64) as usize
    }

    #[inline]
    fn slot(&self, id: SlotId) -> &Slot {
        &self.slots[id as usize]
    }

    #[inline]
    fn slot_mut(&mut self, id: SlotId) -> &mut Slot {
        &mut self.slots[id as usize]
    }

    /// Advance the index counter, skipping 0 and the sentinel.
    fn assign_index(&mut self) -> ItemIndex {
        self.next_index = if self.next_index >= ItemIndex::SENTINEL - 1 {
            1
        } else {
            self.next_index + 1
        };

        // The counter never lands on a reserved value
        match ItemIndex::new(self.next_index) {
            Some(index) => index,
            None => unreachable!("index counter produced reserved value {}", self.next_index),
        }
    }

    /// Link `item` as the newest entry.
    ///
    /// Hands the item back when every slot is taken so the caller can
    /// release it outside the lock.
    pub(crate) fn insert(&mut self, item: Arc<CacheItem>) -> Result<ItemIndex, Arc<CacheItem>> {
        let id = self.free;
        if id == NIL {
            return Err(item);
        }

        let index = self.assign_index();
        let bucket = self.bucket_of(index.get());

        debug_assert!(
            self.find(index.get()).is_none(),
            "index {index} is already live"
        );

        let tail = self.tail;
        let chain = self.buckets[bucket];
        let slot = self.slot_mut(id);
        let next_free = slot.next;
        slot.item = Some(item);
        slot.index = index.get();
        slot.chain = chain;
        slot.prev = tail;
        slot.next = NIL;
        self.free = next_free;

        // Append to the insertion list
        if tail == NIL {
            self.head = id;
        } else {
            self.slot_mut(tail).next = id;
        }
        self.tail = id;

        // Push onto the bucket chain
        self.buckets[bucket] = id;

        self.len += 1;
        Ok(index)
    }

    fn find(&self, index: u64) -> Option<SlotId> {
        let mut id = self.buckets[self.bucket_of(index)];
        while id != NIL {
            let slot = self.slot(id);
            if slot.index == index {
                return Some(id);
            }
            id = slot.chain;
        }
        None
    }

    /// Look up a live item.
    pub(crate) fn get(&self, index: u64) -> Option<&Arc<CacheItem>> {
        let id = self.find(index)?;
        self.slot(id).item.as_ref()
    }

    /// Unlink the item with the given index, if present.
    pub(crate) fn remove(&mut self, index: u64) -> Option<Arc<CacheItem>> {
        let bucket = self.bucket_of(index);

        // Walk the chain keeping the predecessor so we can splice it out
        let mut prev = NIL;
        let mut id = self.buckets[bucket];
        while id != NIL {
            let slot = self.slot(id);
            if slot.index == index {
                let chain = slot.chain;
                if prev == NIL {
                    self.buckets[bucket] = chain;
                } else {
                    self.slot_mut(prev).chain = chain;
                }
                return Some(self.release_slot(id));
            }
            prev = id;
            id = slot.chain;
        }

        None
    }

    /// Unlink the oldest item if the cutoff covers its expiration time.
    ///
    /// Items are linked in insertion order and share one TTL, so when the
    /// head is not covered, nothing behind it is either.
    pub(crate) fn pop_expired(&mut self, cutoff: Cutoff) -> Option<Arc<CacheItem>> {
        let id = self.head;
        if id == NIL {
            return None;
        }

        let (index, chain) = {
            let slot = self.slot(id);
            let expire_at = slot.item.as_ref()?.expire_at();
            if !cutoff.covers(expire_at) {
                return None;
            }
            (slot.index, slot.chain)
        };

        let bucket = self.bucket_of(index);
        if self.buckets[bucket] == id {
            self.buckets[bucket] = chain;
        } else {
            let mut prev = self.buckets[bucket];
            while prev != NIL {
                let following = self.slot(prev).chain;
                if following == id {
                    self.slot_mut(prev).chain = chain;
                    break;
                }
                prev = following;
            }
        }

        Some(self.release_slot(id))
    }

    /// Detach a slot, already removed from its chain, from the insertion
    /// list and return it to the free list.
    fn release_slot(&mut self, id: SlotId) -> Arc<CacheItem> {
        let (prev, next) = {
            let slot = self.slot(id);
            (slot.prev, slot.next)
        };

        if prev == NIL {
            self.head = next;
        } else {
            self.slot_mut(prev).next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.slot_mut(next).prev = prev;
        }

        let free = self.free;
        let slot = self.slot_mut(id);
        let item = slot.item.take();
        slot.index = 0;
        slot.chain = NIL;
        slot.prev = NIL;
        slot.next = free;
        self.free = id;
        self.len -= 1;

        match item {
            Some(item) => item,
            None => unreachable!("linked slot {id} holds no item"),
        }
    }

    /// Indices in insertion order
    #[cfg(test)]
    pub(crate) fn indices(&self) -> Vec<u64> {
        let mut indices = Vec::with_capacity(self.len);
        let mut id = self.head;
        while id != NIL {
            let slot = self.slot(id);
            indices.push(slot.index);
            id = slot.next;
        }
        indices
    }

    /// Check that list, chains, free list and `len` agree.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let listed = self.indices();
        assert_eq!(listed.len(), self.len, "list length != len");

        // Backward walk mirrors the forward walk
        let mut backward = Vec::with_capacity(self.len);
        let mut id = self.tail;
        while id != NIL {
            backward.push(self.slot(id).index);
            id = self.slot(id).prev;
        }
        backward.reverse();
        assert_eq!(listed, backward, "prev links disagree with next links");

        // Every chain member hashes to its bucket and is in the list
        let mut chained = 0;
        for (bucket, &first) in self.buckets.iter().enumerate() {
            let mut id = first;
            while id != NIL {
                let slot = self.slot(id);
                assert!(slot.item.is_some(), "chained slot {id} is empty");
                assert_eq!(self.bucket_of(slot.index), bucket);
                assert!(listed.contains(&slot.index));
                chained += 1;
                id = slot.chain;
            }
        }
        assert_eq!(chained, self.len, "chain membership != len");

        let mut free = 0;
        let mut id = self.free;
        while id != NIL {
            assert!(self.slot(id).item.is_none(), "free slot {id} holds an item");
            free += 1;
            id = self.slot(id).next;
        }
        assert_eq!(free + self.len, self.slots.len());
    }
}
