use std::ops::{Deref, DerefMut};
use std::sync::{RwLockReadGuard, RwLockWriteGuard};

use crate::error::Result;
use crate::storage::{FrameId, PageId};

use super::bufferpool::BufferPoolManager;

/// Basic page guard: owns one pin on a frame and nothing else.
///
/// Dropping the guard unpins the page with the accumulated dirty intent.
/// The guard is movable but not copyable, so the pin is released exactly
/// once. It does not expose the page bytes — those require the frame latch —
/// but it can be upgraded into a latched guard without losing the pin.
///
/// The pool reference is borrowed: the pool outlives all of its guards by
/// construction, and unpinning does not re-enter the guard.
pub struct PageGuard<'a> {
    bpm: &'a BufferPoolManager,
    page_id: PageId,
    frame_id: FrameId,
    is_dirty: bool,
    active: bool,
}

impl<'a> PageGuard<'a> {
    pub(super) fn new(bpm: &'a BufferPoolManager, page_id: PageId, frame_id: FrameId) -> Self {
        PageGuard { bpm, page_id, frame_id, is_dirty: false, active: true }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Record that the caller modified the page, so the drop-time unpin
    /// reports it dirty.
    pub fn set_dirty(&mut self) {
        self.is_dirty = true;
    }

    /// Trade the bare pin for a pin plus the shared frame latch.
    pub fn upgrade_read(self) -> Result<ReadPageGuard<'a>> {
        let (bpm, page_id, frame_id, is_dirty) = self.into_parts();
        let latch = bpm.frame_latch(frame_id).read()?;
        Ok(ReadPageGuard {
            latch,
            guard: PageGuard { bpm, page_id, frame_id, is_dirty, active: true },
        })
    }

    /// Trade the bare pin for a pin plus the exclusive frame latch.
    pub fn upgrade_write(self) -> Result<WritePageGuard<'a>> {
        let (bpm, page_id, frame_id, is_dirty) = self.into_parts();
        let latch = bpm.frame_latch(frame_id).write()?;
        Ok(WritePageGuard {
            latch,
            guard: PageGuard { bpm, page_id, frame_id, is_dirty, active: true },
        })
    }

    /// Disarm the drop hook and hand the pin over to the caller.
    fn into_parts(mut self) -> (&'a BufferPoolManager, PageId, FrameId, bool) {
        self.active = false;
        (self.bpm, self.page_id, self.frame_id, self.is_dirty)
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.bpm.unpin_page(self.page_id, self.is_dirty);
        }
    }
}

/// Read page guard: a pin plus the shared frame latch.
///
/// Other read guards on the same frame co-exist; a write guard is excluded.
/// Dereferences to the page bytes.
///
/// Field order matters: the latch is released first, then the inner guard
/// unpins.
pub struct ReadPageGuard<'a> {
    latch: RwLockReadGuard<'a, Vec<u8>>,
    guard: PageGuard<'a>,
}

impl ReadPageGuard<'_> {
    pub fn page_id(&self) -> PageId {
        self.guard.page_id()
    }

    pub fn data(&self) -> &[u8] {
        &self.latch
    }
}

impl Deref for ReadPageGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.latch
    }
}

/// Write page guard: a pin plus the exclusive frame latch.
///
/// Mutable access marks the guard dirty, so the drop-time unpin propagates
/// dirtiness to the pool.
pub struct WritePageGuard<'a> {
    latch: RwLockWriteGuard<'a, Vec<u8>>,
    guard: PageGuard<'a>,
}

impl WritePageGuard<'_> {
    pub fn page_id(&self) -> PageId {
        self.guard.page_id()
    }

    pub fn data(&self) -> &[u8] {
        &self.latch
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.guard.is_dirty = true;
        &mut self.latch
    }
}

impl Deref for WritePageGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.latch
    }
}

impl DerefMut for WritePageGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.is_dirty = true;
        &mut self.latch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDiskManager;

    fn new_bpm(pool_size: usize) -> BufferPoolManager {
        BufferPoolManager::new(Box::new(MemoryDiskManager::new()), pool_size, 2)
    }

    #[test]
    fn test_drop_unpins() -> Result<()> {
        let bpm = new_bpm(4);
        let guard = bpm.new_page()?;
        let page_id = guard.page_id();
        assert_eq!(Some(1), bpm.pin_count(page_id));
        drop(guard);
        assert_eq!(Some(0), bpm.pin_count(page_id));
        Ok(())
    }

    #[test]
    fn test_move_transfers_pin_once() -> Result<()> {
        let bpm = new_bpm(4);
        let guard = bpm.new_page()?;
        let page_id = guard.page_id();

        let moved = guard; // move, not copy
        assert_eq!(Some(1), bpm.pin_count(page_id));
        drop(moved);
        assert_eq!(Some(0), bpm.pin_count(page_id));
        Ok(())
    }

    #[test]
    fn test_upgrade_keeps_pin() -> Result<()> {
        let bpm = new_bpm(4);
        let guard = bpm.new_page()?;
        let page_id = guard.page_id();

        let writer = guard.upgrade_write()?;
        assert_eq!(Some(1), bpm.pin_count(page_id));
        drop(writer);
        assert_eq!(Some(0), bpm.pin_count(page_id));
        Ok(())
    }

    #[test]
    fn test_write_guard_marks_dirty_on_mutation() -> Result<()> {
        let disk = MemoryDiskManager::new();
        let bpm = BufferPoolManager::new(Box::new(disk.clone()), 1, 2);

        let guard = bpm.new_page()?;
        let page_id = guard.page_id();
        let mut writer = guard.upgrade_write()?;
        writer[7] = 3;
        drop(writer);

        // The only frame gets reused; the dirty page must hit the disk.
        let _other = bpm.new_page()?;
        assert_eq!(3, disk.page(page_id).expect("written back")[7]);
        Ok(())
    }

    #[test]
    fn test_shared_readers_coexist() -> Result<()> {
        let bpm = new_bpm(4);
        let guard = bpm.new_page()?;
        let page_id = guard.page_id();
        drop(guard);

        let r1 = bpm.fetch_page_read(page_id)?;
        let r2 = bpm.fetch_page_read(page_id)?;
        assert_eq!(Some(2), bpm.pin_count(page_id));
        assert_eq!(r1.data(), r2.data());
        drop(r1);
        drop(r2);
        assert_eq!(Some(0), bpm.pin_count(page_id));
        Ok(())
    }

    #[test]
    fn test_read_guard_does_not_dirty() -> Result<()> {
        let disk = MemoryDiskManager::new();
        let bpm = BufferPoolManager::new(Box::new(disk.clone()), 1, 2);

        let guard = bpm.new_page()?;
        let page_id = guard.page_id();
        drop(guard);

        let reader = bpm.fetch_page_read(page_id)?;
        drop(reader);

        // Evicting the clean page must not rewrite the zeroes to disk.
        let _other = bpm.new_page()?;
        assert_eq!(None, disk.page(page_id));
        Ok(())
    }
}
