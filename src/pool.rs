use crate::chunk::{chunk_layout, pad_address, Chunk, ChunkHeader, HEADER_SIZE};
use crate::config::check_slot_size;
use crate::constants::{CHUNK_SIZE, NIL_INDEX};
use crate::directory::ChunkDirectory;
use crate::error::AllocError;
use crate::free_stack::{FreeStack, Links};
use core::sync::atomic::AtomicU32;
use parking_lot::Mutex;
use std::ops::Range;
use std::ptr::{self, NonNull};
use tracing::{debug, trace, warn};

/// Dispenses slots of one fixed size.
///
/// Freed slots are recycled through a lock-free stack. Fresh slots are bumped
/// out of the newest chunk under a short lock, which is also where new chunks
/// are requested from the system. Chunks are kept until the pool is dropped.
pub struct Pool {
    slot_size: usize,
    chunk_size: usize,
    // Slot indices reserved per chunk: index = ordinal * stride + slot.
    stride: usize,
    free: FreeStack,
    directory: ChunkDirectory,
    bump: Mutex<BumpState>,
}

struct BumpState {
    chunks: Option<NonNull<ChunkHeader>>,
    cursor: *mut u8,
    boundary: *mut u8,
    chunk_count: usize,
}

// The pointers refer to chunks owned by the pool and are only touched with
// the lock held.
unsafe impl Send for BumpState {}

impl BumpState {
    const fn empty() -> Self {
        Self {
            chunks: None,
            cursor: ptr::null_mut(),
            boundary: ptr::null_mut(),
            chunk_count: 0,
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new(CHUNK_SIZE)
    }
}

impl Links for Pool {
    fn link(&self, index: u32) -> Option<&AtomicU32> {
        let index = index as usize;

        self.directory
            .get(index / self.stride)?
            .link(index % self.stride)
    }
}

impl Pool {
    /// Creates a pool with no slot size. It must be initialized before use.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            slot_size: 0,
            chunk_size,
            stride: 1,
            free: FreeStack::new(),
            directory: ChunkDirectory::new(),
            bump: Mutex::new(BumpState::empty()),
        }
    }

    pub fn with_slot_size(slot_size: usize, chunk_size: usize) -> Result<Self, AllocError> {
        let mut pool = Self::new(chunk_size);

        pool.initialize(slot_size)?;

        Ok(pool)
    }

    /// Skips validation, for shapes already checked by a `RouterConfig`.
    pub(crate) fn configured(slot_size: usize, chunk_size: usize) -> Self {
        debug_assert!(check_slot_size(slot_size, chunk_size).is_ok());

        let mut pool = Self::new(chunk_size);

        pool.reset(slot_size);
        pool
    }

    /// Fixes the slot size and empties the pool, returning any chunks it
    /// already holds to the system.
    pub fn initialize(&mut self, slot_size: usize) -> Result<(), AllocError> {
        chunk_layout(self.chunk_size)?;
        check_slot_size(slot_size, self.chunk_size)?;

        self.reset(slot_size);

        Ok(())
    }

    fn reset(&mut self, slot_size: usize) {
        self.release_chunks();

        self.slot_size = slot_size;
        self.stride = (self.chunk_size - HEADER_SIZE) / slot_size;
        self.free = FreeStack::new();
        self.directory = ChunkDirectory::new();
        *self.bump.get_mut() = BumpState::empty();

        debug!(slot_size, chunk_size = self.chunk_size, "pool initialized");
    }

    pub fn allocate(&self) -> Result<NonNull<u8>, AllocError> {
        if self.slot_size == 0 {
            return Err(AllocError::Uninitialized);
        }

        if let Some(slot) = self.free.pop(self).and_then(|index| self.slot_at(index)) {
            return Ok(slot);
        }

        let mut bump = self.bump.lock();

        if bump.cursor >= bump.boundary {
            self.grow(&mut bump)?;
        }

        let slot = bump.cursor;

        // `cursor < boundary` leaves room for a whole slot before the chunk end.
        bump.cursor = unsafe { slot.add(self.slot_size) };

        Ok(unsafe { NonNull::new_unchecked(slot) })
    }

    /// Returns a slot to the pool. Null is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `allocate` on this pool and must not be used
    /// after this call.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };

        let ordinal = ChunkHeader::from_ptr(ptr.as_ptr(), self.chunk_size).ordinal();

        let Some(chunk) = self.directory.get(ordinal) else {
            debug_assert!(false, "{ptr:p} does not belong to this pool");
            return;
        };

        let index = ordinal * self.stride + chunk.slot_of(ptr, self.slot_size);

        self.free.push(self, index as u32);
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.bump.lock().chunk_count
    }

    /// Bytes held from the system, used or not.
    pub fn reserved_bytes(&self) -> usize {
        self.chunk_count() * self.chunk_size
    }

    /// Address ranges of every chunk owned by this pool.
    pub fn chunk_ranges(&self) -> Vec<Range<usize>> {
        (0..self.chunk_count())
            .filter_map(|ordinal| self.directory.get(ordinal))
            .map(Chunk::range)
            .collect()
    }

    pub fn owns(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;

        self.chunk_ranges().iter().any(|range| range.contains(&addr))
    }

    fn slot_at(&self, index: u32) -> Option<NonNull<u8>> {
        let index = index as usize;
        let chunk = self.directory.get(index / self.stride)?;

        Some(chunk.slot_ptr(index % self.stride, self.slot_size))
    }

    fn grow(&self, bump: &mut BumpState) -> Result<(), AllocError> {
        let ordinal = bump.chunk_count;

        // Every index of the new chunk must stay below the sentinel.
        let fits = (ordinal + 1)
            .checked_mul(self.stride)
            .is_some_and(|end| end <= NIL_INDEX as usize);

        if !fits {
            warn!(slot_size = self.slot_size, ordinal, "slot index space exhausted");

            return Err(AllocError::CapacityExhausted {
                slot_size: self.slot_size,
            });
        }

        let layout = chunk_layout(self.chunk_size)?;
        let header = ChunkHeader::alloc(layout, bump.chunks, ordinal).inspect_err(|err| {
            warn!(slot_size = self.slot_size, ordinal, %err, "chunk growth failed");
        })?;

        let base = header.cast::<u8>();
        let first_slot = HEADER_SIZE + pad_address(base.as_ptr() as usize + HEADER_SIZE, self.slot_size);
        let slot_count = (self.chunk_size - first_slot) / self.slot_size;

        let inserted = self
            .directory
            .insert(ordinal, Chunk::new(base, self.chunk_size, first_slot, slot_count));

        debug_assert!(inserted, "chunk ordinal {ordinal} published twice");

        bump.chunks = Some(header);
        bump.chunk_count += 1;

        unsafe {
            bump.cursor = base.as_ptr().add(first_slot);
            bump.boundary = base.as_ptr().add(self.chunk_size - self.slot_size + 1);
        }

        trace!(slot_size = self.slot_size, ordinal, slot_count, "pool grew");

        Ok(())
    }

    fn release_chunks(&mut self) {
        let bump = self.bump.get_mut();

        let Some(head) = bump.chunks.take() else {
            return;
        };

        if let Ok(layout) = chunk_layout(self.chunk_size) {
            let released = unsafe { ChunkHeader::release_all(Some(head), layout) };

            trace!(slot_size = self.slot_size, released, "pool released chunks");
        }
    }
}

impl Drop for Pool {
    // `&mut self` guarantees no allocate or deallocate is in flight.
    fn drop(&mut self) {
        self.release_chunks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn uninitialized_pool_refuses() {
        let pool = Pool::new(4096);

        assert_eq!(pool.allocate(), Err(AllocError::Uninitialized));
    }

    #[test]
    fn initialize_validates() {
        let mut pool = Pool::new(4096);

        assert!(pool.initialize(0).is_err());
        assert!(pool.initialize(4096).is_err());
        assert!(pool.initialize(64).is_ok());
        assert_eq!(pool.slot_size(), 64);

        let mut pool = Pool::new(1000);

        assert_eq!(pool.initialize(8), Err(AllocError::InvalidChunkSize(1000)));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn initialize_rejects_unindexable_chunks() {
        let mut pool = Pool::new(1 << 36);

        assert_eq!(
            pool.initialize(8),
            Err(AllocError::InvalidSlotSize {
                slot_size: 8,
                chunk_size: 1 << 36
            })
        );
        assert_eq!(pool.allocate(), Err(AllocError::Uninitialized));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn chunk_growth_out_of_memory() {
        let pool = Pool::with_slot_size(1 << 40, 1 << 46).unwrap();

        assert!(matches!(pool.allocate(), Err(AllocError::OutOfMemory { .. })));
        assert_eq!(pool.chunk_count(), 0);
        assert!(pool.chunk_ranges().is_empty());

        // Still refuses on retry instead of handing out a half-built chunk.
        assert!(matches!(pool.allocate(), Err(AllocError::OutOfMemory { .. })));
    }

    #[test]
    fn index_space_exhausted() {
        let mut pool = Pool::with_slot_size(64, 4096).unwrap();

        // Pretend every ordinal that fits below the sentinel is taken.
        pool.bump.get_mut().chunk_count = NIL_INDEX as usize / pool.stride;

        assert_eq!(
            pool.allocate(),
            Err(AllocError::CapacityExhausted { slot_size: 64 })
        );
        assert!(pool.bump.get_mut().chunks.is_none());
    }

    #[test]
    fn consecutive_slots_are_contiguous() {
        let pool = Pool::with_slot_size(24, 4096).unwrap();
        let a = pool.allocate().unwrap().as_ptr() as usize;
        let b = pool.allocate().unwrap().as_ptr() as usize;

        assert_eq!(b - a, 24);
    }

    #[test]
    fn slots_are_aligned_to_their_size() {
        for slot_size in [8, 16, 24, 40, 64, 128, 256, 512] {
            let pool = Pool::with_slot_size(slot_size, 4096).unwrap();

            for _ in 0..1000 {
                let ptr = pool.allocate().unwrap().as_ptr() as usize;

                assert_eq!(ptr % slot_size, 0, "slot size {slot_size}");
            }
        }
    }

    #[test]
    fn lifo_reuse() {
        let pool = Pool::with_slot_size(32, 4096).unwrap();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();

        unsafe { pool.deallocate(a.as_ptr()) };

        let c = pool.allocate().unwrap();

        assert_eq!(c, a);
        assert_ne!(c, b);
    }

    #[test]
    fn null_deallocate_is_noop() {
        let pool = Pool::with_slot_size(8, 4096).unwrap();

        unsafe { pool.deallocate(ptr::null_mut()) };

        assert!(pool.free.is_empty());
    }

    #[test]
    fn last_slot_of_chunk_is_used() {
        let pool = Pool::with_slot_size(512, 4096).unwrap();
        let mut slots = vec![];

        while pool.chunk_count() < 2 {
            slots.push(pool.allocate().unwrap().as_ptr() as usize);
        }

        // Header plus padding take the first slot, seven remain.
        assert_eq!(slots.len(), 8);

        let range = &pool.chunk_ranges()[0];
        let last = slots[6];

        assert_eq!(last + 512, range.end);
    }

    #[test]
    fn grows_across_chunks() {
        let pool = Pool::with_slot_size(64, 1024).unwrap();
        let slots: Vec<_> = (0..500).map(|_| pool.allocate().unwrap().as_ptr() as usize).collect();
        let unique: HashSet<_> = slots.iter().collect();

        assert_eq!(unique.len(), slots.len());
        assert!(pool.chunk_count() > 1);
        assert_eq!(pool.reserved_bytes(), pool.chunk_count() * 1024);

        for slot in slots {
            assert!(pool.owns(slot as *const u8));
        }
    }

    #[test]
    fn freed_slots_from_any_chunk_come_back() {
        let pool = Pool::with_slot_size(128, 1024).unwrap();
        let slots: Vec<_> = (0..50).map(|_| pool.allocate().unwrap()).collect();
        let chunks = pool.chunk_count();

        for slot in slots.iter() {
            unsafe { pool.deallocate(slot.as_ptr()) };
        }

        let mut again: Vec<_> = (0..50).map(|_| pool.allocate().unwrap()).collect();
        let mut expect = slots.clone();

        again.sort();
        expect.sort();

        assert_eq!(again, expect);
        assert_eq!(pool.chunk_count(), chunks);
    }

    #[test]
    fn user_writes_do_not_disturb_free_stack() {
        let pool = Pool::with_slot_size(16, 4096).unwrap();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();

        unsafe {
            pool.deallocate(a.as_ptr());
            // Dangling write into a freed slot.
            a.as_ptr().write_bytes(0xff, 16);
            pool.deallocate(b.as_ptr());
        }

        assert_eq!(pool.allocate().unwrap(), b);
        assert_eq!(pool.allocate().unwrap(), a);
    }

    #[test]
    fn reinitialize_releases_chunks() {
        let mut pool = Pool::with_slot_size(8, 4096).unwrap();

        for _ in 0..2000 {
            pool.allocate().unwrap();
        }

        assert!(pool.chunk_count() > 1);

        pool.initialize(16).unwrap();

        assert_eq!(pool.chunk_count(), 0);
        assert_eq!(pool.slot_size(), 16);
        assert_eq!(pool.allocate().unwrap().as_ptr() as usize % 16, 0);
    }
}
