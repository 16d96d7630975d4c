use crate::error::AllocError;
use crate::router::SizeClassRouter;
use std::alloc::Layout;
use std::ptr::{self, NonNull};

// Hands the storage back if the initializer panics.
struct FreeOnUnwind<'a> {
    router: &'a SizeClassRouter,
    ptr: *mut u8,
    layout: Layout,
}

impl Drop for FreeOnUnwind<'_> {
    fn drop(&mut self) {
        unsafe { self.router.free_layout(self.ptr, self.layout) };
    }
}

impl SizeClassRouter {
    /// Moves `value` into pooled storage.
    pub fn create<T>(&self, value: T) -> Result<NonNull<T>, AllocError> {
        self.create_with(|| value)
    }

    /// Builds a value with `init` straight into pooled storage.
    ///
    /// Zero-sized types never touch a pool and get a dangling, aligned pointer.
    pub fn create_with<T, F>(&self, init: F) -> Result<NonNull<T>, AllocError>
    where
        F: FnOnce() -> T,
    {
        let layout = Layout::new::<T>();

        if layout.size() == 0 {
            let ptr = NonNull::<T>::dangling();

            unsafe { ptr.as_ptr().write(init()) };

            return Ok(ptr);
        }

        // Non-zero sizes never come back null.
        let raw = NonNull::new(self.allocate_layout(layout)?).ok_or(AllocError::OutOfMemory {
            size: layout.size(),
            align: layout.align(),
        })?;

        let guard = FreeOnUnwind {
            router: self,
            ptr: raw.as_ptr(),
            layout,
        };

        let ptr = raw.cast::<T>();

        unsafe { ptr.as_ptr().write(init()) };
        core::mem::forget(guard);

        Ok(ptr)
    }

    /// Drops the value in place and returns its storage. Null is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or come from `create`/`create_with` on this router,
    /// and must not be used afterwards.
    pub unsafe fn destroy<T>(&self, ptr: *mut T) {
        if ptr.is_null() {
            return;
        }

        ptr::drop_in_place(ptr);

        let layout = Layout::new::<T>();

        if layout.size() != 0 {
            self.free_layout(ptr.cast::<u8>(), layout);
        }
    }
}
