use crate::chunk::Chunk;
use std::sync::OnceLock;

// Ordinals are bounded by the u32 slot index space.
const BUCKET_COUNT: usize = 32;

type Bucket = Box<[OnceLock<Chunk>]>;

/// Append-only map from chunk ordinal to chunk record. Bucket `b` holds `2^b`
/// records and is allocated the first time an ordinal lands in it, so lookups
/// never race with a reallocation.
pub struct ChunkDirectory {
    buckets: [OnceLock<Bucket>; BUCKET_COUNT],
}

fn locate(ordinal: usize) -> (usize, usize) {
    let n = ordinal + 1;
    let bucket = (usize::BITS - 1 - n.leading_zeros()) as usize;

    (bucket, n - (1 << bucket))
}

impl Default for ChunkDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDirectory {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| OnceLock::new()),
        }
    }

    pub fn get(&self, ordinal: usize) -> Option<&Chunk> {
        let (bucket, offset) = locate(ordinal);

        self.buckets.get(bucket)?.get()?.get(offset)?.get()
    }

    /// Callers serialize inserts. Returns false if the ordinal was taken or
    /// lies outside the directory.
    pub fn insert(&self, ordinal: usize, chunk: Chunk) -> bool {
        let (bucket, offset) = locate(ordinal);

        let Some(cell) = self.buckets.get(bucket) else {
            return false;
        };

        let entries = cell.get_or_init(|| (0..1usize << bucket).map(|_| OnceLock::new()).collect());

        entries[offset].set(chunk).is_ok()
    }
}
