//! A bank of fixed-size pools, one per size class, for small and frequent
//! allocations shared across threads.
//!
//! Requests up to [`MAX_SLOT_SIZE`] bytes are rounded up to the next multiple
//! of [`SLOT_BASE_SIZE`] and served by that class's [`Pool`]. Larger requests
//! go straight to the system allocator. Blocks carry no size header, so every
//! `free` must pass the size used to allocate.
//!
//! ```
//! let ptr = slabmux::create(String::from("pooled")).unwrap();
//!
//! assert_eq!(unsafe { ptr.as_ref() }, "pooled");
//!
//! unsafe { slabmux::destroy(ptr.as_ptr()) };
//! ```
mod chunk;
mod config;
mod constants;
mod directory;
mod error;
mod free_stack;
mod pool;
mod router;
mod size_class;
mod typed;

use std::ptr::NonNull;
use std::sync::OnceLock;
use tracing::debug;

pub use config::RouterConfig;
pub use constants::{CHUNK_SIZE, MAX_SLOT_SIZE, POOL_COUNT, SLOT_BASE_SIZE, SYSTEM_ALIGN};
pub use error::AllocError;
pub use pool::Pool;
pub use router::SizeClassRouter;
pub use size_class::SizeClass;

static ROUTER: OnceLock<SizeClassRouter> = OnceLock::new();

/// Installs the process-wide router with `config`.
///
/// Fails if the router already exists, including when an earlier call to any
/// of the allocation functions created it with the defaults.
pub fn init(config: RouterConfig) -> Result<&'static SizeClassRouter, AllocError> {
    let router = SizeClassRouter::new(config)?;
    let mut installed = false;

    let current = ROUTER.get_or_init(|| {
        installed = true;
        router
    });

    if !installed {
        return Err(AllocError::AlreadyInitialized);
    }

    debug!(?config, "router installed");

    Ok(current)
}

/// The process-wide router, created with default settings on first use.
pub fn router() -> &'static SizeClassRouter {
    ROUTER.get_or_init(|| {
        debug!("router installed with defaults");
        SizeClassRouter::default()
    })
}

pub fn allocate(size: usize) -> Result<*mut u8, AllocError> {
    router().allocate(size)
}

/// # Safety
///
/// `ptr` must be null or come from [`allocate`] with the same `size`, and must
/// not be used afterwards.
pub unsafe fn free(ptr: *mut u8, size: usize) {
    router().free(ptr, size)
}

pub fn create<T>(value: T) -> Result<NonNull<T>, AllocError> {
    router().create(value)
}

pub fn create_with<T, F>(init: F) -> Result<NonNull<T>, AllocError>
where
    F: FnOnce() -> T,
{
    router().create_with(init)
}

/// # Safety
///
/// `ptr` must be null or come from [`create`] or [`create_with`], and must not
/// be used afterwards.
pub unsafe fn destroy<T>(ptr: *mut T) {
    router().destroy(ptr)
}
