use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use log::debug;

use crate::error::{Error, Result};
use crate::storage::{DiskManager, FrameId, PageId, INVALID_PAGE_ID, PAGE_SIZE};

use super::guard::{PageGuard, ReadPageGuard, WritePageGuard};
use super::replacer::{Replacer, SyncLruKReplacer};

/// Bookkeeping of one frame, protected by the pool mutex. The page bytes
/// themselves live in [`Frame`] behind the per-frame latch.
struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

impl FrameMeta {
    fn new() -> Self {
        FrameMeta { page_id: INVALID_PAGE_ID, pin_count: 0, is_dirty: false }
    }

    fn reset(&mut self) {
        self.page_id = INVALID_PAGE_ID;
        self.pin_count = 0;
        self.is_dirty = false;
    }
}

/// One buffer pool frame: a `PAGE_SIZE` byte buffer behind a reader/writer
/// latch. The latch is orthogonal to the pool mutex; it is taken by read and
/// write page guards to serialize access to the page contents.
pub(super) struct Frame {
    data: RwLock<Vec<u8>>,
}

impl Frame {
    fn new() -> Self {
        Frame { data: RwLock::new(vec![0; PAGE_SIZE]) }
    }
}

/// The buffer pool state: the frame metadata array, the page table mapping
/// resident pages to frames, the free list, and the replacer.
///
/// Invariant: a page id is present in the page table iff a frame holds that
/// page, and every frame is accounted for by exactly one of the page table
/// and the free list.
struct BufferPool {
    metas: Vec<FrameMeta>,
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    /// Replacer to find unpinned frames for replacement. Internally
    /// synchronized, so it is callable while the pool mutex is held.
    replacer: Arc<dyn Replacer>,
    /// The next page id to be allocated.
    next_page_id: PageId,
}

/// The buffer pool manager moves physical pages back and forth between main
/// memory and disk, letting the system operate on databases larger than the
/// available memory.
///
/// Its operations are transparent to the rest of the system: callers ask for
/// a page by its unique identifier (`PageId`) without knowing whether it is
/// already in memory or has to be fetched from disk.
///
/// A single pool-wide mutex serializes all state transitions of frames, the
/// page table, the free list, and the replacer. Lock order is pool mutex →
/// frame latch → disk mutex; no method acquires them in any other order.
pub struct BufferPoolManager {
    pool: Mutex<BufferPool>,
    frames: Vec<Frame>,
    disk: Mutex<Box<dyn DiskManager>>,
}

impl BufferPoolManager {
    pub fn new(disk: Box<dyn DiskManager>, pool_size: usize, replacer_k: usize) -> Self {
        let mut metas = Vec::with_capacity(pool_size);
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        let replacer: Arc<dyn Replacer> = Arc::new(SyncLruKReplacer::new(replacer_k, pool_size));
        for i in 0..pool_size {
            metas.push(FrameMeta::new());
            frames.push(Frame::new());
            // initially, every frame is in the free list
            free_list.push_back(i);
        }
        let pool = BufferPool {
            metas,
            page_table: HashMap::new(),
            free_list,
            replacer,
            next_page_id: 0,
        };
        BufferPoolManager { pool: Mutex::new(pool), frames, disk: Mutex::new(disk) }
    }

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    /// Create a new page in the buffer pool and return a basic (pin-only)
    /// guard for it; the page was just created, so no latch is needed yet.
    ///
    /// Picks the replacement frame from the free list first, then from the
    /// replacer. A dirty victim is written back to disk before its frame is
    /// reused. Returns `Error::BufferPoolNoAvailableFrame` if every frame is
    /// pinned.
    pub fn new_page(&self) -> Result<PageGuard<'_>> {
        let mut pool = self.pool.lock()?;
        let frame_id = self.acquire_frame(&mut pool)?;

        let page_id = pool.next_page_id;
        pool.next_page_id += 1;

        let meta = &mut pool.metas[frame_id];
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = false;
        pool.page_table.insert(page_id, frame_id);
        // pin the frame so the replacer will not evict it before unpin
        pool.replacer.record_access(frame_id);
        pool.replacer.set_evictable(frame_id, false);

        Ok(PageGuard::new(self, page_id, frame_id))
    }

    /// Fetch the requested page and return a basic (pin-only) guard.
    ///
    /// If the page is resident its pin count is bumped; otherwise a frame is
    /// acquired as in [`new_page`](Self::new_page) and the page bytes are
    /// read from disk. Returns `Error::BufferPoolNoAvailableFrame` if the
    /// page is absent and every frame is pinned.
    pub fn fetch_page_basic(&self, page_id: PageId) -> Result<PageGuard<'_>> {
        let frame_id = self.pin_page(page_id)?;
        Ok(PageGuard::new(self, page_id, frame_id))
    }

    /// Fetch the requested page and take the shared frame latch.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<ReadPageGuard<'_>> {
        self.fetch_page_basic(page_id)?.upgrade_read()
    }

    /// Fetch the requested page and take the exclusive frame latch.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<WritePageGuard<'_>> {
        self.fetch_page_basic(page_id)?.upgrade_write()
    }

    /// Unpin the target page. Returns false if the page is not resident or
    /// its pin count is already zero.
    ///
    /// The dirty flag is OR-ed with `is_dirty`: a frame dirtied by one
    /// accessor stays dirty until flushed, whatever later accessors report.
    /// When the pin count reaches zero the frame becomes evictable.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut pool = self.pool.lock().unwrap();
        let Some(&frame_id) = pool.page_table.get(&page_id) else {
            return false;
        };
        let meta = &mut pool.metas[frame_id];
        if meta.pin_count == 0 {
            return false;
        }
        meta.pin_count -= 1;
        meta.is_dirty = meta.is_dirty || is_dirty;
        if meta.pin_count == 0 {
            pool.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Flush the target page to disk regardless of the dirty flag, then
    /// clear the flag. Returns `Ok(false)` if the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        // Take a transient pin so the frame can neither be evicted nor
        // deleted while the bytes are written outside the pool mutex.
        let frame_id = {
            let mut pool = self.pool.lock()?;
            let Some(&frame_id) = pool.page_table.get(&page_id) else {
                return Ok(false);
            };
            pool.metas[frame_id].pin_count += 1;
            if pool.metas[frame_id].pin_count == 1 {
                pool.replacer.set_evictable(frame_id, false);
            }
            frame_id
        };

        let res = (|| -> Result<()> {
            let data = self.frames[frame_id].data.read()?;
            self.disk.lock()?.write_page(page_id, &data)
        })();

        let mut pool = self.pool.lock()?;
        let meta = &mut pool.metas[frame_id];
        meta.pin_count -= 1;
        if res.is_ok() {
            meta.is_dirty = false;
        }
        if meta.pin_count == 0 {
            pool.replacer.set_evictable(frame_id, true);
        }
        res.map(|_| true)
    }

    /// Flush all resident pages to disk.
    pub fn flush_all_pages(&self) -> Result<()> {
        let page_ids: Vec<PageId> = {
            let pool = self.pool.lock()?;
            pool.page_table.keys().copied().collect()
        };
        for page_id in page_ids {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Delete a page from the buffer pool. A page that is not resident is
    /// already gone, so the call returns `Ok(true)`; a pinned page cannot be
    /// deleted and the call returns `Ok(false)`.
    ///
    /// The frame is removed from the replacer, zeroed, and returned to the
    /// free list; the disk manager is told to deallocate the page. This is
    /// the only place the core deallocates disk pages.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut pool = self.pool.lock()?;
        let Some(&frame_id) = pool.page_table.get(&page_id) else {
            return Ok(true);
        };
        if pool.metas[frame_id].pin_count > 0 {
            return Ok(false);
        }
        pool.replacer.remove(frame_id);
        pool.page_table.remove(&page_id);
        pool.metas[frame_id].reset();
        pool.free_list.push_back(frame_id);
        self.frames[frame_id].data.write()?.fill(0);
        self.disk.lock()?.deallocate_page(page_id)?;
        Ok(true)
    }

    /// Pin count of a resident page; None if the page is not in the pool.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let pool = self.pool.lock().ok()?;
        let &frame_id = pool.page_table.get(&page_id)?;
        Some(pool.metas[frame_id].pin_count)
    }

    pub(super) fn frame_latch(&self, frame_id: FrameId) -> &RwLock<Vec<u8>> {
        &self.frames[frame_id].data
    }

    /// Pin the page into a frame, reading it from disk if it is not
    /// resident. Returns the frame id; the caller wraps it into a guard.
    fn pin_page(&self, page_id: PageId) -> Result<FrameId> {
        let mut pool = self.pool.lock()?;
        if let Some(&frame_id) = pool.page_table.get(&page_id) {
            pool.metas[frame_id].pin_count += 1;
            pool.replacer.record_access(frame_id);
            pool.replacer.set_evictable(frame_id, false);
            return Ok(frame_id);
        }

        let frame_id = self.acquire_frame(&mut pool)?;
        {
            let mut data = self.frames[frame_id].data.write()?;
            let mut disk = self.disk.lock()?;
            if let Err(err) = disk.read_page(page_id, &mut data) {
                drop(disk);
                drop(data);
                // the frame was taken but never installed; hand it back
                pool.free_list.push_back(frame_id);
                return Err(err);
            }
        }
        let meta = &mut pool.metas[frame_id];
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = false;
        pool.page_table.insert(page_id, frame_id);
        pool.replacer.record_access(frame_id);
        pool.replacer.set_evictable(frame_id, false);
        Ok(frame_id)
    }

    /// Pick a usable frame: free list first, then the replacer. An evicted
    /// dirty page is written back to disk at its current id; the evicted id
    /// is unmapped but not deallocated, since eviction is not deletion.
    fn acquire_frame(&self, pool: &mut BufferPool) -> Result<FrameId> {
        if let Some(frame_id) = pool.free_list.pop_front() {
            return Ok(frame_id);
        }
        let frame_id = pool
            .replacer
            .evict()
            .ok_or(Error::BufferPoolNoAvailableFrame)?;

        let old_page_id = pool.metas[frame_id].page_id;
        let was_dirty = pool.metas[frame_id].is_dirty;
        {
            // The victim is unpinned, so no guard holds this latch.
            let mut data = self.frames[frame_id].data.write()?;
            if was_dirty {
                self.disk.lock()?.write_page(old_page_id, &data)?;
            }
            data.fill(0);
        }
        pool.page_table.remove(&old_page_id);
        pool.metas[frame_id].reset();
        debug!("evicted page {} from frame {}", old_page_id, frame_id);
        Ok(frame_id)
    }
}
