use crate::constants::NIL_INDEX;
use crate::error::AllocError;
use std::alloc::{alloc, dealloc, Layout};
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;

/// Sits in the first bytes of every chunk. Chunks are aligned to their own
/// size, so masking any slot address yields its header.
#[repr(C)]
pub struct ChunkHeader {
    prev: Option<NonNull<ChunkHeader>>,
    ordinal: usize,
}

pub const HEADER_SIZE: usize = core::mem::size_of::<ChunkHeader>();

/// Bytes needed to move `addr` up to the next multiple of `align`.
pub fn pad_address(addr: usize, align: usize) -> usize {
    let rem = addr % align;

    if rem == 0 {
        0
    } else {
        align - rem
    }
}

pub fn chunk_layout(chunk_size: usize) -> Result<Layout, AllocError> {
    if !chunk_size.is_power_of_two() || chunk_size < 2 * HEADER_SIZE {
        return Err(AllocError::InvalidChunkSize(chunk_size));
    }

    Layout::from_size_align(chunk_size, chunk_size)
        .map_err(|_| AllocError::InvalidChunkSize(chunk_size))
}

impl ChunkHeader {
    pub fn alloc(
        layout: Layout,
        prev: Option<NonNull<ChunkHeader>>,
        ordinal: usize,
    ) -> Result<NonNull<ChunkHeader>, AllocError> {
        let ptr = unsafe { alloc(layout) } as *mut ChunkHeader;
        let header = NonNull::new(ptr).ok_or(AllocError::OutOfMemory {
            size: layout.size(),
            align: layout.align(),
        })?;

        unsafe { header.as_ptr().write(ChunkHeader { prev, ordinal }) };

        Ok(header)
    }

    /// # Safety
    ///
    /// `ptr` must point into a live chunk of exactly `chunk_size` bytes.
    pub unsafe fn from_ptr<'a>(ptr: *const u8, chunk_size: usize) -> &'a ChunkHeader {
        let offset = (ptr as usize) % chunk_size;
        let header = ptr.byte_sub(offset);

        &*(header as *const ChunkHeader)
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Returns every chunk reachable from `head` to the system.
    ///
    /// # Safety
    ///
    /// Every chunk in the list was allocated with `layout`, and no slot inside
    /// them is referenced anymore.
    pub unsafe fn release_all(head: Option<NonNull<ChunkHeader>>, layout: Layout) -> usize {
        let mut cursor = head;
        let mut released = 0;

        while let Some(chunk) = cursor {
            cursor = chunk.as_ref().prev;
            dealloc(chunk.as_ptr() as *mut u8, layout);
            released += 1;
        }

        released
    }
}

/// Lock-free view of one chunk: where its slots start, and the next-links of
/// the free stack for each slot. The links live here rather than inside the
/// slots so user writes can never corrupt them.
pub struct Chunk {
    base: NonNull<u8>,
    first_slot: usize,
    len: usize,
    links: Box<[AtomicU32]>,
}

// The chunk memory is owned by the pool, which serializes its release with
// `&mut self`. The record itself is only read after publication.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    pub fn new(base: NonNull<u8>, len: usize, first_slot: usize, slot_count: usize) -> Self {
        debug_assert!(first_slot >= HEADER_SIZE);

        Self {
            base,
            first_slot,
            len,
            links: (0..slot_count).map(|_| AtomicU32::new(NIL_INDEX)).collect(),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.links.len()
    }

    pub fn link(&self, slot: usize) -> Option<&AtomicU32> {
        self.links.get(slot)
    }

    pub fn slot_ptr(&self, slot: usize, slot_size: usize) -> NonNull<u8> {
        debug_assert!(slot < self.slot_count());

        unsafe {
            NonNull::new_unchecked(self.base.as_ptr().add(self.first_slot + slot * slot_size))
        }
    }

    pub fn slot_of(&self, ptr: NonNull<u8>, slot_size: usize) -> usize {
        let offset = ptr.as_ptr() as usize - self.base.as_ptr() as usize - self.first_slot;

        debug_assert_eq!(offset % slot_size, 0, "pointer is not at a slot boundary");

        offset / slot_size
    }

    pub fn range(&self) -> Range<usize> {
        let start = self.base.as_ptr() as usize;

        start..start + self.len
    }
}
