use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotonically increasing counter
#[derive(Debug)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge that can increase or decrease
#[derive(Debug)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: i64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn sub(&self, value: i64) {
        self.0.fetch_sub(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-cache metrics for observability and testing
///
/// Each cache instance owns its own set, so tests (including loom models)
/// never see counts from another instance.
#[derive(Debug)]
pub struct CacheMetrics {
    // Add outcomes
    pub item_add: Counter,
    pub item_add_oversized: Counter,
    pub item_add_at_capacity: Counter,
    pub item_add_oom: Counter,

    // Read path
    pub item_reference: Counter,
    pub item_reference_miss: Counter,

    // Removal paths
    pub item_invalidate: Counter,
    pub item_invalidate_not_found: Counter,
    pub item_expire: Counter,

    /// Item storage actually released (refcount reached zero)
    pub item_free: Counter,

    /// Items currently indexed
    pub items_live: Gauge,
    /// Item buffers still allocated, indexed or only referenced
    pub buffers_live: Gauge,
    /// Payload bytes held by allocated buffers
    pub bytes_live: Gauge,
}

impl CacheMetrics {
    /// Create a new set of metrics for a cache instance
    pub fn new() -> Self {
        Self {
            item_add: Counter::new(),
            item_add_oversized: Counter::new(),
            item_add_at_capacity: Counter::new(),
            item_add_oom: Counter::new(),
            item_reference: Counter::new(),
            item_reference_miss: Counter::new(),
            item_invalidate: Counter::new(),
            item_invalidate_not_found: Counter::new(),
            item_expire: Counter::new(),
            item_free: Counter::new(),
            items_live: Gauge::new(),
            buffers_live: Gauge::new(),
            bytes_live: Gauge::new(),
        }
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}
