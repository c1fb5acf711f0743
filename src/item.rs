use crate::error::AddItemError;
use crate::metrics::CacheMetrics;
use crate::sync::Arc;
use clocksource::precise::Instant;
use std::fmt;
use std::num::NonZeroU64;
use std::ops::Deref;

/// Per-buffer bookkeeping overhead counted against `item_size_max`.
///
/// Mirrors the header the driver allocates in front of each payload (owner
/// handle plus size, aligned to 16 bytes), so size limits carried over from
/// the driver's configuration mean the same thing here.
pub const ITEM_HEADER_SIZE: usize = 16;

/// Opaque handle to a cached item.
///
/// Indices are handed out in increasing order and are never 0 or
/// `u64::MAX`; those raw values are reserved for "no item".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemIndex(NonZeroU64);

impl ItemIndex {
    /// Sentinel raw value meaning "no item" / "match everything"
    pub const SENTINEL: u64 = u64::MAX;

    /// Wrap a raw index, rejecting the reserved values 0 and `u64::MAX`.
    pub fn new(raw: u64) -> Option<Self> {
        if raw == Self::SENTINEL {
            return None;
        }
        NonZeroU64::new(raw).map(Self)
    }

    /// The raw index value
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl From<ItemIndex> for u64 {
    fn from(index: ItemIndex) -> u64 {
        index.get()
    }
}

impl fmt::Display for ItemIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One cached blob: an immutable private copy of the payload plus its
/// expiration time.
///
/// Shared through `Arc`; the index holds the structural reference and every
/// `ItemRef` holds one more. The buffer is freed when the last one goes.
pub(crate) struct CacheItem {
    expire_at: Instant,
    data: Box<[u8]>,
    metrics: std::sync::Arc<CacheMetrics>,
}

impl CacheItem {
    /// Copy `bytes` into a freshly allocated buffer.
    pub(crate) fn new(
        bytes: &[u8],
        expire_at: Instant,
        metrics: &std::sync::Arc<CacheMetrics>,
    ) -> Result<Self, AddItemError> {
        let mut data = Vec::new();
        data.try_reserve_exact(bytes.len())
            .map_err(|_| AddItemError::OutOfMemory)?;
        data.extend_from_slice(bytes);

        metrics.buffers_live.increment();
        metrics.bytes_live.add(bytes.len() as i64);

        Ok(Self {
            expire_at,
            data: data.into_boxed_slice(),
            metrics: std::sync::Arc::clone(metrics),
        })
    }

    pub(crate) fn expire_at(&self) -> Instant {
        self.expire_at
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for CacheItem {
    fn drop(&mut self) {
        self.metrics.item_free.increment();
        self.metrics.buffers_live.decrement();
        self.metrics.bytes_live.sub(self.data.len() as i64);
    }
}

/// A counted reference to a cached buffer, returned by
/// [`MetaCache::reference`](crate::MetaCache::reference).
///
/// The bytes stay valid for as long as the `ItemRef` lives, even if the item
/// is invalidated or expires in the meantime; the cache just stops handing
/// out new references to it. Dropping the `ItemRef` (or passing it to
/// [`MetaCache::dereference`](crate::MetaCache::dereference)) releases the
/// reference.
///
/// ```
/// use meta_cache::MetaCache;
/// use std::time::Duration;
///
/// let cache = MetaCache::new(16, 4096, Duration::from_secs(1)).unwrap();
/// let index = cache.add(b"security descriptor").unwrap();
///
/// let item = cache.reference(index).unwrap();
/// cache.invalidate_item(index);
///
/// // Still readable: the reference keeps the buffer alive
/// assert_eq!(&*item, b"security descriptor");
/// assert!(cache.reference(index).is_none());
/// ```
#[derive(Clone)]
pub struct ItemRef {
    item: Arc<CacheItem>,
    index: ItemIndex,
}

impl ItemRef {
    pub(crate) fn new(item: Arc<CacheItem>, index: ItemIndex) -> Self {
        Self { item, index }
    }

    /// The index this reference was obtained for
    pub fn index(&self) -> ItemIndex {
        self.index
    }

    /// The cached bytes
    pub fn bytes(&self) -> &[u8] {
        self.item.data()
    }

    /// Size of the cached payload in bytes
    pub fn len(&self) -> usize {
        self.item.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.item.data().is_empty()
    }

    /// When the item becomes eligible for expiration
    pub fn expire_at(&self) -> Instant {
        self.item.expire_at()
    }
}

impl Deref for ItemRef {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes()
    }
}

impl AsRef<[u8]> for ItemRef {
    fn as_ref(&self) -> &[u8] {
        self.bytes()
    }
}

impl fmt::Debug for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemRef")
            .field("index", &self.index)
            .field("len", &self.len())
            .finish()
    }
}
