use crate::constants::NIL_INDEX;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Resolves a slot index to the cell holding its next-link.
pub trait Links {
    fn link(&self, index: u32) -> Option<&AtomicU32>;
}

// A lock-free stack of slot indices using Treiber's algorithm.
//
// The head packs the top index with a tag that changes on every successful
// push and pop, so a thread holding a stale head always fails its CAS even
// when the same index has been popped and pushed back in between.
pub struct FreeStack {
    head: AtomicU64,
}

const fn pack(index: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

const fn unpack(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

impl Default for FreeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeStack {
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(pack(NIL_INDEX, 0)),
        }
    }

    pub fn push<L: Links + ?Sized>(&self, links: &L, index: u32) {
        debug_assert_ne!(index, NIL_INDEX);

        let Some(link) = links.link(index) else {
            debug_assert!(false, "push of unknown slot index {index}");
            return;
        };

        let mut current = self.head.load(Ordering::Relaxed);

        loop {
            let (top, tag) = unpack(current);

            // Private to this thread until the CAS below publishes it.
            link.store(top, Ordering::Relaxed);

            match self.head.compare_exchange_weak(
                current,
                pack(index, tag.wrapping_add(1)),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn pop<L: Links + ?Sized>(&self, links: &L) -> Option<u32> {
        let mut current = self.head.load(Ordering::Acquire);

        loop {
            let (top, tag) = unpack(current);

            if top == NIL_INDEX {
                return None;
            }

            // May be stale if `top` was popped and pushed again meanwhile; the
            // tag makes the CAS fail in that case.
            let next = links.link(top)?.load(Ordering::Relaxed);

            match self.head.compare_exchange_weak(
                current,
                pack(next, tag.wrapping_add(1)),
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(top),
                Err(actual) => current = actual,
            }
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        unpack(self.head.load(Ordering::Acquire)).0 == NIL_INDEX
    }
}
