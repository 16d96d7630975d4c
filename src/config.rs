use crate::chunk::{chunk_layout, HEADER_SIZE};
use crate::constants::{CHUNK_SIZE, NIL_INDEX, POOL_COUNT, SLOT_BASE_SIZE};
use crate::error::AllocError;

/// Shape of the size-class table. Fixed once a router is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterConfig {
    granularity: usize,
    classes: usize,
    chunk_size: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            granularity: SLOT_BASE_SIZE,
            classes: POOL_COUNT,
            chunk_size: CHUNK_SIZE,
        }
    }
}

impl RouterConfig {
    pub const fn with_granularity(mut self, granularity: usize) -> Self {
        self.granularity = granularity;
        self
    }

    pub const fn with_classes(mut self, classes: usize) -> Self {
        self.classes = classes;
        self
    }

    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Bytes between neighbouring size classes.
    pub const fn granularity(&self) -> usize {
        self.granularity
    }

    pub const fn classes(&self) -> usize {
        self.classes
    }

    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub const fn max_slot_size(&self) -> usize {
        self.granularity * self.classes
    }

    /// Slot size served by the pool at `index`.
    pub const fn slot_size(&self, index: usize) -> usize {
        (index + 1) * self.granularity
    }

    pub fn validate(&self) -> Result<(), AllocError> {
        // A power of two keeps every slot aligned for any type whose size
        // routes to it.
        if !self.granularity.is_power_of_two() {
            return Err(AllocError::InvalidConfig {
                reason: "granularity must be a non-zero power of two",
            });
        }

        if self.classes == 0 || self.classes >= NIL_INDEX as usize {
            return Err(AllocError::InvalidConfig {
                reason: "class count must be between 1 and u32::MAX - 1",
            });
        }

        let max_slot = self
            .granularity
            .checked_mul(self.classes)
            .ok_or(AllocError::InvalidConfig {
                reason: "largest slot size overflows",
            })?;

        chunk_layout(self.chunk_size)?;
        check_slot_size(max_slot, self.chunk_size)?;
        check_slot_size(self.granularity, self.chunk_size)
    }
}

/// A chunk must fit its header, worst-case alignment padding, and one slot,
/// and its slots must be addressable by `u32` indices.
pub(crate) fn check_slot_size(slot_size: usize, chunk_size: usize) -> Result<(), AllocError> {
    let needed = slot_size
        .checked_mul(2)
        .and_then(|slots| slots.checked_add(HEADER_SIZE));

    match needed {
        Some(needed)
            if slot_size > 0
                && needed <= chunk_size
                && (chunk_size - HEADER_SIZE) / slot_size <= NIL_INDEX as usize =>
        {
            Ok(())
        }
        _ => Err(AllocError::InvalidSlotSize {
            slot_size,
            chunk_size,
        }),
    }
}
