use thiserror::Error;

/// Error type for cache creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CreateError {
    /// The slot arena or bucket array could not be allocated
    #[error("failed to allocate cache index")]
    OutOfMemory,
    /// The capacity cannot be addressed by 32-bit slot handles
    #[error("capacity {capacity} exceeds the maximum of {max} items")]
    CapacityTooLarge { capacity: usize, max: usize },
}

/// Error type for add operations
///
/// Every variant is an expected outcome: the caller decides whether to retry
/// later or regenerate the data on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AddItemError {
    /// Header plus payload exceeds `item_size_max`; nothing was allocated
    #[error("item of {size} bytes exceeds the {max} byte item limit")]
    Oversized { size: usize, max: usize },
    /// The cache already holds `capacity` items
    #[error("cache is at capacity ({capacity} items)")]
    AtCapacity { capacity: usize },
    /// The payload copy could not be allocated
    #[error("failed to allocate item buffer")]
    OutOfMemory,
}
