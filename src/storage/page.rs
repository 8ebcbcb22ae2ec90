/// Identifier of a logical page on disk.
pub type PageId = i64;

/// Index of a physical frame in the buffer pool, in range `[0, pool_size)`.
pub type FrameId = usize;

/// Size of a data page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Sentinel for "no page".
pub const INVALID_PAGE_ID: PageId = -1;
