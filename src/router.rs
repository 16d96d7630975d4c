use crate::config::RouterConfig;
use crate::constants::SYSTEM_ALIGN;
use crate::error::AllocError;
use crate::pool::Pool;
use crate::size_class::SizeClass;
use std::alloc::{alloc, dealloc, Layout};
use std::ptr;
use std::sync::OnceLock;

/// Routes requests to one pool per size class, or to the system allocator
/// when they are larger than the biggest class.
///
/// Pools are built the first time their class is used.
pub struct SizeClassRouter {
    config: RouterConfig,
    pools: Box<[OnceLock<Pool>]>,
}

impl Default for SizeClassRouter {
    fn default() -> Self {
        Self::build(RouterConfig::default())
    }
}

// A block the system can never describe is as unobtainable as one it refuses.
fn system_layout(layout: Layout) -> Result<Layout, AllocError> {
    let align = layout.align().max(SYSTEM_ALIGN);

    Layout::from_size_align(layout.size(), align).map_err(|_| AllocError::OutOfMemory {
        size: layout.size(),
        align,
    })
}

impl SizeClassRouter {
    pub fn new(config: RouterConfig) -> Result<Self, AllocError> {
        config.validate()?;

        Ok(Self::build(config))
    }

    fn build(config: RouterConfig) -> Self {
        debug_assert!(config.validate().is_ok());

        Self {
            config,
            pools: (0..config.classes()).map(|_| OnceLock::new()).collect(),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Index of the pool serving `size`, if any.
    pub fn pool_index(&self, size: usize) -> Option<usize> {
        match SizeClass::get_for_size(size, &self.config) {
            SizeClass::Pooled(index) => Some(index),
            SizeClass::Empty | SizeClass::Large => None,
        }
    }

    /// # Panics
    ///
    /// Panics if `index` is not below the configured class count.
    pub fn pool(&self, index: usize) -> &Pool {
        self.pools[index].get_or_init(|| {
            Pool::configured(self.config.slot_size(index), self.config.chunk_size())
        })
    }

    /// Returns at least `size` bytes, or null when `size` is zero.
    ///
    /// Sizes the system allocator cannot serve, including ones too large to
    /// form a `Layout`, fail with `OutOfMemory`.
    pub fn allocate(&self, size: usize) -> Result<*mut u8, AllocError> {
        let layout = Layout::from_size_align(size, 1).map_err(|_| AllocError::OutOfMemory {
            size,
            align: SYSTEM_ALIGN,
        })?;

        self.allocate_layout(layout)
    }

    /// # Safety
    ///
    /// `ptr` must be null or come from `allocate` on this router with the same
    /// `size`, and must not be used afterwards.
    pub unsafe fn free(&self, ptr: *mut u8, size: usize) {
        if let Ok(layout) = Layout::from_size_align(size, 1) {
            self.free_layout(ptr, layout);
        }
    }

    /// Like `allocate`, but the block also satisfies `layout`'s alignment.
    pub fn allocate_layout(&self, layout: Layout) -> Result<*mut u8, AllocError> {
        let layout = layout.pad_to_align();

        match SizeClass::get_for_size(layout.size(), &self.config) {
            SizeClass::Empty => Ok(ptr::null_mut()),
            SizeClass::Pooled(index) => {
                let slot = self.pool(index).allocate()?;

                debug_assert_eq!(slot.as_ptr() as usize % layout.align(), 0);

                Ok(slot.as_ptr())
            }
            SizeClass::Large => {
                let layout = system_layout(layout)?;
                let ptr = unsafe { alloc(layout) };

                if ptr.is_null() {
                    return Err(AllocError::OutOfMemory {
                        size: layout.size(),
                        align: layout.align(),
                    });
                }

                Ok(ptr)
            }
        }
    }

    /// # Safety
    ///
    /// `ptr` must be null or come from `allocate_layout` on this router with
    /// the same `layout`, and must not be used afterwards.
    pub unsafe fn free_layout(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }

        let layout = layout.pad_to_align();

        match SizeClass::get_for_size(layout.size(), &self.config) {
            SizeClass::Empty => {}
            SizeClass::Pooled(index) => self.pool(index).deallocate(ptr),
            SizeClass::Large => {
                if let Ok(layout) = system_layout(layout) {
                    dealloc(ptr, layout);
                }
            }
        }
    }

    /// Bytes held from the system by pools built so far. Oversized blocks are
    /// not tracked.
    pub fn reserved_bytes(&self) -> usize {
        self.pools
            .iter()
            .filter_map(OnceLock::get)
            .map(Pool::reserved_bytes)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{MAX_SLOT_SIZE, POOL_COUNT, SLOT_BASE_SIZE};

    #[test]
    fn zero_size_is_null() {
        let router = SizeClassRouter::default();

        assert!(router.allocate(0).unwrap().is_null());
        assert_eq!(router.reserved_bytes(), 0);
    }

    #[test]
    fn pools_match_their_index() {
        let router = SizeClassRouter::default();

        for index in [0, 1, 31, POOL_COUNT - 1] {
            assert_eq!(router.pool(index).slot_size(), (index + 1) * SLOT_BASE_SIZE);
        }
    }

    #[test]
    fn pools_are_built_once() {
        let router = SizeClassRouter::default();
        let first: *const Pool = router.pool(3);
        let second: *const Pool = router.pool(3);

        assert_eq!(first, second);
    }

    #[test]
    fn boundary_routing() {
        let router = SizeClassRouter::default();

        assert_eq!(router.pool_index(0), None);
        assert_eq!(router.pool_index(MAX_SLOT_SIZE), Some(POOL_COUNT - 1));
        assert_eq!(router.pool_index(MAX_SLOT_SIZE + 1), None);

        let pooled = router.allocate(MAX_SLOT_SIZE).unwrap();
        let large = router.allocate(MAX_SLOT_SIZE + 1).unwrap();

        assert!(router.pool(POOL_COUNT - 1).owns(pooled));
        assert!(!router.pool(POOL_COUNT - 1).owns(large));
        assert_eq!(large as usize % SYSTEM_ALIGN, 0);

        unsafe {
            router.free(pooled, MAX_SLOT_SIZE);
            router.free(large, MAX_SLOT_SIZE + 1);
        }
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn large_request_out_of_memory() {
        let router = SizeClassRouter::default();

        assert!(matches!(
            router.allocate(1 << 62),
            Err(AllocError::OutOfMemory { size, align: SYSTEM_ALIGN }) if size == 1 << 62
        ));
        assert_eq!(router.reserved_bytes(), 0);
    }

    #[test]
    fn unrepresentable_sizes_are_out_of_memory() {
        let router = SizeClassRouter::default();

        for size in [isize::MAX as usize, isize::MAX as usize + 1, usize::MAX] {
            assert_eq!(
                router.allocate(size),
                Err(AllocError::OutOfMemory {
                    size,
                    align: SYSTEM_ALIGN
                })
            );
        }
    }

    #[test]
    fn free_returns_to_serving_pool() {
        let router = SizeClassRouter::default();
        let a = router.allocate(20).unwrap();

        unsafe { router.free(a, 20) };

        // 17..=24 bytes share a class.
        assert_eq!(router.allocate(17).unwrap(), a);
    }

    #[test]
    fn layout_alignment_is_honoured() {
        let router = SizeClassRouter::default();

        for (size, align) in [(1, 1), (5, 32), (24, 8), (48, 16), (64, 64), (100, 4), (600, 64)] {
            let layout = Layout::from_size_align(size, align).unwrap();
            let ptr = router.allocate_layout(layout).unwrap();

            assert_eq!(ptr as usize % align, 0, "{layout:?}");

            unsafe { router.free_layout(ptr, layout) };
        }
    }

    #[test]
    fn custom_config() {
        let config = RouterConfig::default()
            .with_granularity(16)
            .with_classes(4)
            .with_chunk_size(1024);
        let router = SizeClassRouter::new(config).unwrap();

        assert_eq!(router.pool_index(64), Some(3));
        assert_eq!(router.pool_index(65), None);
        assert_eq!(router.pool(3).chunk_size(), 1024);

        router.allocate(64).unwrap();

        assert_eq!(router.reserved_bytes(), 1024);
    }

    #[test]
    fn invalid_config_rejected() {
        let config = RouterConfig::default().with_chunk_size(512);

        assert!(SizeClassRouter::new(config).is_err());
    }
}
