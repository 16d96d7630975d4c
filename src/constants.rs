/// Bytes between neighbouring size classes.
pub const SLOT_BASE_SIZE: usize = 8;

/// Number of size classes served by pools.
pub const POOL_COUNT: usize = 64;

/// Largest request served by a pool, anything bigger goes to the system.
pub const MAX_SLOT_SIZE: usize = SLOT_BASE_SIZE * POOL_COUNT;

/// Bytes requested from the system each time a pool grows.
pub const CHUNK_SIZE: usize = 4096;

/// Minimum alignment of blocks forwarded to the system allocator.
pub const SYSTEM_ALIGN: usize = 16;

/// Sentinel slot index marking the end of a free stack.
pub const NIL_INDEX: u32 = u32::MAX;
