use core::alloc::LayoutError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("system allocator failed to provide {size} bytes aligned to {align}")]
    OutOfMemory { size: usize, align: usize },

    #[error("slot index space exhausted for {slot_size} byte slots")]
    CapacityExhausted { slot_size: usize },

    #[error("pool used before a slot size was set")]
    Uninitialized,

    #[error("invalid slot size {slot_size} for {chunk_size} byte chunks")]
    InvalidSlotSize { slot_size: usize, chunk_size: usize },

    #[error("chunk size {0} is not a usable power of two")]
    InvalidChunkSize(usize),

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: &'static str },

    #[error("global router is already initialized")]
    AlreadyInitialized,

    #[error("invalid layout")]
    Layout,
}

impl From<LayoutError> for AllocError {
    fn from(_: LayoutError) -> Self {
        Self::Layout
    }
}
