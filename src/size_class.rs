use crate::config::RouterConfig;

/// Where a request of a given size is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// Zero bytes, nothing to allocate.
    Empty,
    /// Index of the pool whose slots fit the request.
    Pooled(usize),
    /// Too big for any pool, forwarded to the system allocator.
    Large,
}

impl SizeClass {
    pub fn get_for_size(size: usize, config: &RouterConfig) -> SizeClass {
        if size == 0 {
            SizeClass::Empty
        } else if size > config.max_slot_size() {
            SizeClass::Large
        } else {
            SizeClass::Pooled(size.div_ceil(config.granularity()) - 1)
        }
    }
}
