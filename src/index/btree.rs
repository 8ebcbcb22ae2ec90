use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::buffer::{BufferPoolManager, WritePageGuard};
use crate::error::Result;
use crate::storage::{PageId, INVALID_PAGE_ID};

use super::iterator::{IndexIterator, TreeScan};
use super::key::{GenericComparator, GenericKey, Rid};
use super::page::{
    HeaderPage, HeaderPageMut, InternalPage, InternalPageMut, LeafPage, LeafPageMut, TreePage,
    TreePageMut,
};
use super::Transaction;

/// Write guards along the path from the root to the current node, plus the
/// header guard that pins the root id during structural changes. Guards drop
/// (unpin + unlatch) when the context goes out of scope, so every unwind
/// path releases the whole ancestor chain.
struct Context<'a> {
    header: Option<WritePageGuard<'a>>,
    root_page_id: PageId,
    write_set: Vec<WritePageGuard<'a>>,
}

impl<'a> Context<'a> {
    fn new() -> Self {
        Context { header: None, root_page_id: INVALID_PAGE_ID, write_set: Vec::new() }
    }
}

/// A B+Tree index over the buffer pool.
///
/// Keys are fixed-width `GenericKey<N>` values ordered by a three-way
/// comparator; leaf entries map keys to `Rid`s. The tree owns no pages
/// outside the pool: every node access goes through page guards, writers
/// lock the whole root-to-leaf path top-down, and readers crab with at most
/// one read guard held at a time.
pub struct BPlusTree<const N: usize> {
    bpm: Arc<BufferPoolManager>,
    comparator: GenericComparator<N>,
    leaf_max_size: usize,
    internal_max_size: usize,
    header_page_id: PageId,
}

impl<const N: usize> BPlusTree<N> {
    /// Create a tree over an already allocated header page; the header's
    /// root pointer is initialized to "empty".
    pub fn new(
        header_page_id: PageId,
        bpm: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        assert!(leaf_max_size >= 3, "leaf max size must be at least 3");
        assert!(internal_max_size >= 3, "internal max size must be at least 3");
        {
            let mut guard = bpm.fetch_page_write(header_page_id)?;
            HeaderPageMut::new(guard.data_mut()).init();
        }
        Ok(BPlusTree { bpm, comparator: GenericComparator, leaf_max_size, internal_max_size, header_page_id })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.root_page_id()? == INVALID_PAGE_ID)
    }

    pub fn root_page_id(&self) -> Result<PageId> {
        let guard = self.bpm.fetch_page_read(self.header_page_id)?;
        Ok(HeaderPage::new(guard.data()).root_page_id())
    }

    /// Point lookup. Readers crab: the parent guard is released before the
    /// child is fetched; correctness holds because read guards keep writers
    /// off the frame while it is inspected.
    pub fn get_value(&self, key: &GenericKey<N>, _txn: &Transaction) -> Result<Option<Rid>> {
        let bpm = self.bpm.as_ref();
        let root_page_id = {
            let header_guard = bpm.fetch_page_read(self.header_page_id)?;
            HeaderPage::new(header_guard.data()).root_page_id()
        };
        if root_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }

        let mut guard = bpm.fetch_page_read(root_page_id)?;
        loop {
            let child = {
                if TreePage::new(guard.data()).is_leaf() {
                    break;
                }
                InternalPage::<N>::new(guard.data()).find_child(key, &self.comparator).0
            };
            drop(guard);
            guard = bpm.fetch_page_read(child)?;
        }
        Ok(LeafPage::<N>::new(guard.data())
            .find(key, &self.comparator)
            .map(|(rid, _)| rid))
    }

    /// Insert a key/value pair. Returns false (leaving the tree unchanged)
    /// when the key is already present.
    pub fn insert(&self, key: &GenericKey<N>, rid: &Rid, _txn: &Transaction) -> Result<bool> {
        let bpm = self.bpm.as_ref();
        let mut ctx = Context::new();

        let mut header_guard = bpm.fetch_page_write(self.header_page_id)?;
        let root_page_id = HeaderPage::new(header_guard.data()).root_page_id();
        ctx.root_page_id = root_page_id;

        // Empty tree: the first insertion creates a single-leaf root.
        if root_page_id == INVALID_PAGE_ID {
            let root_guard = bpm.new_page()?;
            let root_page_id = root_guard.page_id();
            HeaderPageMut::new(header_guard.data_mut()).set_root_page_id(root_page_id);
            let mut root_guard = root_guard.upgrade_write()?;
            let mut leaf = LeafPageMut::<N>::new(root_guard.data_mut());
            leaf.init(INVALID_PAGE_ID, self.leaf_max_size);
            leaf.insert(key, rid, &self.comparator);
            return Ok(true);
        }
        ctx.header = Some(header_guard);

        // Descend to the leaf, locking the whole path.
        let mut guard = bpm.fetch_page_write(root_page_id)?;
        loop {
            let child = {
                if TreePage::new(guard.data()).is_leaf() {
                    break;
                }
                InternalPage::<N>::new(guard.data()).find_child(key, &self.comparator).0
            };
            let next = bpm.fetch_page_write(child)?;
            ctx.write_set.push(guard);
            guard = next;
        }

        // Fast path: room for one more entry without hitting the split
        // threshold (leaves hold max_size - 1 entries steady-state).
        let (must_split, inserted) = {
            let mut leaf = LeafPageMut::<N>::new(guard.data_mut());
            let fast = leaf.size() < leaf.max_size() - 1;
            (!fast, leaf.insert(key, rid, &self.comparator))
        };
        if !inserted {
            return Ok(false);
        }
        if !must_split {
            return Ok(true);
        }

        // The leaf reached max_size: split off a right sibling.
        let new_basic = bpm.new_page()?;
        let new_page_id = new_basic.page_id();
        let mut new_guard = new_basic.upgrade_write()?;
        let pushed_key = {
            let mut leaf = LeafPageMut::<N>::new(guard.data_mut());
            let mut new_leaf = LeafPageMut::<N>::new(new_guard.data_mut());
            let min_size = leaf.min_size();
            let cur_size = leaf.size();
            new_leaf.init(leaf.as_view().parent_page_id(), self.leaf_max_size);
            new_leaf.copy_from(&leaf.as_view(), min_size, cur_size);
            let pushed_key = leaf.key_at(min_size);
            new_leaf.set_size(cur_size - min_size);
            leaf.set_size(min_size);
            new_leaf.set_next_page_id(leaf.next_page_id());
            leaf.set_next_page_id(new_page_id);
            pushed_key
        };
        debug!("leaf {} split, new sibling {}", guard.page_id(), new_page_id);
        ctx.write_set.push(guard);
        self.insert_in_parent(&mut ctx, pushed_key, new_guard)?;
        Ok(true)
    }

    /// Propagate a split upward: install `key` (the first key of the new
    /// sibling) into the parent of the node on top of the path, splitting
    /// ancestors as needed. A split root grows a new internal root holding
    /// exactly the two halves.
    fn insert_in_parent<'b>(
        &'b self,
        ctx: &mut Context<'b>,
        key: GenericKey<N>,
        mut new_guard: WritePageGuard<'b>,
    ) -> Result<()> {
        let bpm = self.bpm.as_ref();
        let cur_page_id = ctx
            .write_set
            .last()
            .expect("split propagation requires the split node on the path")
            .page_id();

        if cur_page_id == ctx.root_page_id {
            // The split node was the root: grow a new root above it.
            let new_root_basic = bpm.new_page()?;
            let new_root_id = new_root_basic.page_id();
            let header = ctx.header.as_mut().expect("header guard held for structural change");
            HeaderPageMut::new(header.data_mut()).set_root_page_id(new_root_id);
            ctx.root_page_id = new_root_id;

            let mut new_root_guard = new_root_basic.upgrade_write()?;
            {
                let mut root = InternalPageMut::<N>::new(new_root_guard.data_mut());
                root.init(INVALID_PAGE_ID, self.internal_max_size);
                root.set_value_at(0, cur_page_id);
                root.set_key_value_at(1, &key, new_guard.page_id());
                root.set_size(2);
            }
            let mut cur_guard = ctx.write_set.pop().expect("checked above");
            TreePageMut::new(cur_guard.data_mut()).set_parent_page_id(new_root_id);
            TreePageMut::new(new_guard.data_mut()).set_parent_page_id(new_root_id);
            debug!("new root {} over {} and {}", new_root_id, cur_page_id, new_guard.page_id());
            return Ok(());
        }

        // Pop the split node; its parent is now on top of the path.
        ctx.write_set.pop();
        let fits = {
            let parent_guard = ctx.write_set.last().expect("non-root node must have a parent on the path");
            let parent = InternalPage::<N>::new(parent_guard.data());
            parent.size() < parent.max_size()
        };
        if fits {
            let parent_guard = ctx.write_set.last_mut().expect("checked above");
            InternalPageMut::<N>::new(parent_guard.data_mut())
                .insert(&key, new_guard.page_id(), &self.comparator);
            ctx.write_set.pop();
            return Ok(());
        }

        // The parent is full: split it too. The new key lands on whichever
        // side keeps the ordering, which also decides the key promoted to
        // the next level.
        let sibling_basic = bpm.new_page()?;
        let sibling_id = sibling_basic.page_id();
        let mut sibling_guard = sibling_basic.upgrade_write()?;
        let promoted = {
            let parent_guard = ctx.write_set.last_mut().expect("checked above");
            let mut parent = InternalPageMut::<N>::new(parent_guard.data_mut());
            let mut sibling = InternalPageMut::<N>::new(sibling_guard.data_mut());
            sibling.init(parent.parent_page_id(), self.internal_max_size);

            let min_size = parent.min_size();
            let cur_size = parent.size();
            let mid_key = parent.key_at(min_size);
            let last_key = parent.key_at(min_size - 1);
            let above_mid = self.comparator.compare(&key, &mid_key) == Ordering::Greater;
            let between = self.comparator.compare(&key, &mid_key) == Ordering::Less
                && self.comparator.compare(&key, &last_key) == Ordering::Greater;

            if above_mid || between {
                sibling.copy_from(&parent.as_view(), min_size, cur_size);
                parent.set_size(min_size);
                sibling.set_size(cur_size - min_size);
                sibling.insert(&key, new_guard.page_id(), &self.comparator);
                if between {
                    key
                } else {
                    mid_key
                }
            } else {
                // The new key belongs in the left half: the parent keeps one
                // entry fewer so the halves stay balanced after insertion.
                sibling.copy_from(&parent.as_view(), min_size - 1, cur_size);
                parent.set_size(min_size - 1);
                sibling.set_size(cur_size - min_size + 1);
                parent.insert(&key, new_guard.page_id(), &self.comparator);
                last_key
            }
        };
        debug!("internal {} split, new sibling {}", cur_page_id, sibling_id);
        self.insert_in_parent(ctx, promoted, sibling_guard)
    }

    /// Delete the entry for `key`, rebalancing with merges and
    /// redistributions where pages fall below their minimum occupancy.
    /// Deleting an absent key is a no-op.
    pub fn remove(&self, key: &GenericKey<N>, _txn: &Transaction) -> Result<()> {
        let bpm = self.bpm.as_ref();
        let mut ctx = Context::new();

        let header_guard = bpm.fetch_page_write(self.header_page_id)?;
        let root_page_id = HeaderPage::new(header_guard.data()).root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Ok(());
        }
        ctx.root_page_id = root_page_id;
        ctx.header = Some(header_guard);

        // Descend, remembering each child's slot in its parent so the
        // rebalance can locate siblings without re-searching.
        let mut child_index: HashMap<PageId, usize> = HashMap::new();
        let mut guard = bpm.fetch_page_write(root_page_id)?;
        loop {
            let child = {
                if TreePage::new(guard.data()).is_leaf() {
                    break;
                }
                let (child_id, slot) =
                    InternalPage::<N>::new(guard.data()).find_child(key, &self.comparator);
                child_index.insert(child_id, slot);
                child_id
            };
            let next = bpm.fetch_page_write(child)?;
            ctx.write_set.push(guard);
            guard = next;
        }

        let Some((rid, _)) = LeafPage::<N>::new(guard.data()).find(key, &self.comparator) else {
            return Ok(());
        };
        ctx.write_set.push(guard);
        self.delete_entry(&mut ctx, key, &rid, &child_index)
    }

    fn delete_entry<'b>(
        &'b self,
        ctx: &mut Context<'b>,
        key: &GenericKey<N>,
        rid: &Rid,
        child_index: &HashMap<PageId, usize>,
    ) -> Result<()> {
        let bpm = self.bpm.as_ref();
        let mut cur_guard = ctx.write_set.pop().expect("delete requires the leaf on the path");
        let cur_page_id = cur_guard.page_id();

        if !LeafPageMut::<N>::new(cur_guard.data_mut()).delete(key, rid, &self.comparator) {
            return Ok(());
        }

        let (cur_size, leaf_min, leaf_max) = {
            let leaf = LeafPage::<N>::new(cur_guard.data());
            (leaf.size(), leaf.min_size(), leaf.max_size())
        };
        if cur_page_id == ctx.root_page_id {
            if cur_size == 0 {
                // the last entry is gone; the tree is empty again
                let header = ctx.header.as_mut().expect("header guard held for structural change");
                HeaderPageMut::new(header.data_mut()).set_root_page_id(INVALID_PAGE_ID);
                ctx.root_page_id = INVALID_PAGE_ID;
            }
            return Ok(());
        }
        if cur_size >= leaf_min {
            return Ok(());
        }

        // Underflow: rebalance with a sibling. The right sibling is used
        // unless this node is its parent's last child.
        let idx_in_parent = *child_index
            .get(&cur_page_id)
            .expect("descent recorded the slot of every visited child");
        let (sibling_id, is_last, up_key, up_value, sep_idx) = {
            let parent_guard = ctx.write_set.last().expect("non-root leaf must have a parent on the path");
            let parent = InternalPage::<N>::new(parent_guard.data());
            let is_last = idx_in_parent == parent.size() - 1;
            if is_last {
                let sibling_id = parent.value_at(idx_in_parent - 1);
                (sibling_id, true, parent.key_at(idx_in_parent), cur_page_id, idx_in_parent)
            } else {
                let sibling_id = parent.value_at(idx_in_parent + 1);
                (sibling_id, false, parent.key_at(idx_in_parent + 1), sibling_id, idx_in_parent + 1)
            }
        };
        let mut sibling_guard = bpm.fetch_page_write(sibling_id)?;

        let merged = {
            let (left_guard, right_guard) = if is_last {
                (&mut sibling_guard, &mut cur_guard)
            } else {
                (&mut cur_guard, &mut sibling_guard)
            };
            let mut left = LeafPageMut::<N>::new(left_guard.data_mut());
            let mut right = LeafPageMut::<N>::new(right_guard.data_mut());
            let left_size = left.size();

            if left_size + right.size() < leaf_max {
                // merge right-into-left and unhook the right page from the
                // sibling chain
                left.merge_from(&right.as_view());
                left.set_next_page_id(right.next_page_id());
                true
            } else {
                // redistribute one entry across the boundary
                let new_sep = if is_last {
                    right.shift(1);
                    right.set_key_value_at(0, &left.key_at(left_size - 1), &left.rid_at(left_size - 1));
                    left.set_size(left_size - 1);
                    right.key_at(0)
                } else {
                    left.set_size(left_size + 1);
                    left.set_key_value_at(left_size, &right.key_at(0), &right.rid_at(0));
                    right.shift(-1);
                    right.key_at(0)
                };
                let parent_guard = ctx.write_set.last_mut().expect("checked above");
                InternalPageMut::<N>::new(parent_guard.data_mut()).set_key_at(sep_idx, &new_sep);
                false
            }
        };
        if merged {
            debug!("leaf {} merged into its left sibling", up_value);
            self.delete_internal_entry(ctx, &up_key, up_value, child_index)?;
        }
        Ok(())
    }

    /// The internal-page arm of deletion: remove the separator entry that
    /// pointed at a merged-away child, then rebalance this page the same way
    /// leaves are rebalanced. Internal merge and redistribution rotate the
    /// separator key through the parent, because entry 0's key is a
    /// placeholder.
    fn delete_internal_entry<'b>(
        &'b self,
        ctx: &mut Context<'b>,
        key: &GenericKey<N>,
        value: PageId,
        child_index: &HashMap<PageId, usize>,
    ) -> Result<()> {
        let bpm = self.bpm.as_ref();
        let mut cur_guard = ctx.write_set.pop().expect("internal delete requires the parent on the path");
        let cur_page_id = cur_guard.page_id();

        if !InternalPageMut::<N>::new(cur_guard.data_mut()).delete(key, value, &self.comparator) {
            return Ok(());
        }

        let (cur_size, int_min, int_max) = {
            let page = InternalPage::<N>::new(cur_guard.data());
            (page.size(), page.min_size(), page.max_size())
        };
        if cur_page_id == ctx.root_page_id {
            if cur_size == 1 {
                // a root with a single child collapses: that child is the
                // new root
                let new_root = InternalPage::<N>::new(cur_guard.data()).value_at(0);
                let header = ctx.header.as_mut().expect("header guard held for structural change");
                HeaderPageMut::new(header.data_mut()).set_root_page_id(new_root);
                ctx.root_page_id = new_root;
                debug!("root collapsed to {}", new_root);
            }
            return Ok(());
        }
        if cur_size >= int_min {
            return Ok(());
        }

        let idx_in_parent = *child_index
            .get(&cur_page_id)
            .expect("descent recorded the slot of every visited child");
        let (sibling_id, is_last, up_key, up_value, sep_idx) = {
            let parent_guard = ctx.write_set.last().expect("non-root node must have a parent on the path");
            let parent = InternalPage::<N>::new(parent_guard.data());
            let is_last = idx_in_parent == parent.size() - 1;
            if is_last {
                let sibling_id = parent.value_at(idx_in_parent - 1);
                (sibling_id, true, parent.key_at(idx_in_parent), cur_page_id, idx_in_parent)
            } else {
                let sibling_id = parent.value_at(idx_in_parent + 1);
                (sibling_id, false, parent.key_at(idx_in_parent + 1), sibling_id, idx_in_parent + 1)
            }
        };
        let mut sibling_guard = bpm.fetch_page_write(sibling_id)?;

        let merged = {
            let (left_guard, right_guard) = if is_last {
                (&mut sibling_guard, &mut cur_guard)
            } else {
                (&mut cur_guard, &mut sibling_guard)
            };
            let mut left = InternalPageMut::<N>::new(left_guard.data_mut());
            let mut right = InternalPageMut::<N>::new(right_guard.data_mut());
            let left_size = left.size();

            if left_size + right.size() <= int_max {
                // the separator becomes a real routing key in place of the
                // right page's placeholder, then the halves concatenate
                right.set_key_at(0, &up_key);
                left.merge_from(&right.as_view());
                true
            } else {
                let new_sep = if is_last {
                    // rotate left's last child in via the parent separator
                    right.shift(1);
                    right.set_key_at(1, &up_key);
                    right.set_value_at(0, left.value_at(left_size - 1));
                    let new_sep = left.key_at(left_size - 1);
                    left.set_size(left_size - 1);
                    new_sep
                } else {
                    // rotate right's first child out via the parent separator
                    let new_sep = right.key_at(1);
                    left.set_size(left_size + 1);
                    left.set_key_value_at(left_size, &up_key, right.value_at(0));
                    right.shift(-1);
                    new_sep
                };
                let parent_guard = ctx.write_set.last_mut().expect("checked above");
                InternalPageMut::<N>::new(parent_guard.data_mut()).set_key_at(sep_idx, &new_sep);
                false
            }
        };
        if merged {
            debug!("internal {} merged into its left sibling", up_value);
            self.delete_internal_entry(ctx, &up_key, up_value, child_index)?;
        }
        Ok(())
    }

    /// Iterator positioned at the first entry of the leftmost leaf.
    ///
    /// Panics when the tree is empty; callers check `is_empty` (or use
    /// [`scan`](Self::scan), which does).
    pub fn begin(&self) -> Result<IndexIterator<'_, N>> {
        let bpm = self.bpm.as_ref();
        let root_page_id = {
            let header_guard = bpm.fetch_page_read(self.header_page_id)?;
            HeaderPage::new(header_guard.data()).root_page_id()
        };
        assert!(root_page_id != INVALID_PAGE_ID, "begin() called on an empty tree");

        let mut guard = bpm.fetch_page_read(root_page_id)?;
        loop {
            let child = {
                if TreePage::new(guard.data()).is_leaf() {
                    break;
                }
                InternalPage::<N>::new(guard.data()).value_at(0)
            };
            drop(guard);
            guard = bpm.fetch_page_read(child)?;
        }
        let leaf = LeafPage::<N>::new(guard.data());
        let entry = (leaf.key_at(0), leaf.rid_at(0));
        let page_id = guard.page_id();
        drop(guard);
        Ok(IndexIterator::new(bpm, page_id, 0, Some(entry)))
    }

    /// Iterator positioned at `key`, or the end sentinel when the key is not
    /// present.
    pub fn begin_from(&self, key: &GenericKey<N>) -> Result<IndexIterator<'_, N>> {
        let bpm = self.bpm.as_ref();
        let root_page_id = {
            let header_guard = bpm.fetch_page_read(self.header_page_id)?;
            HeaderPage::new(header_guard.data()).root_page_id()
        };
        assert!(root_page_id != INVALID_PAGE_ID, "begin_from() called on an empty tree");

        let mut guard = bpm.fetch_page_read(root_page_id)?;
        loop {
            let child = {
                if TreePage::new(guard.data()).is_leaf() {
                    break;
                }
                InternalPage::<N>::new(guard.data()).find_child(key, &self.comparator).0
            };
            drop(guard);
            guard = bpm.fetch_page_read(child)?;
        }
        let leaf = LeafPage::<N>::new(guard.data());
        match leaf.find(key, &self.comparator) {
            Some((rid, index)) => {
                let entry = (*key, rid);
                let page_id = guard.page_id();
                drop(guard);
                Ok(IndexIterator::new(bpm, page_id, index as isize, Some(entry)))
            }
            None => Ok(IndexIterator::end(bpm)),
        }
    }

    /// Ordered scan over the whole tree; empty trees yield an empty scan.
    pub fn scan(&self) -> Result<TreeScan<'_, N>> {
        if self.is_empty()? {
            return Ok(TreeScan::empty());
        }
        Ok(TreeScan::new(self.begin()?))
    }

    /// Ordered scan starting at `key` (which must be present, otherwise the
    /// scan is empty).
    pub fn scan_from(&self, key: &GenericKey<N>) -> Result<TreeScan<'_, N>> {
        if self.is_empty()? {
            return Ok(TreeScan::empty());
        }
        let iter = self.begin_from(key)?;
        if iter.is_at_end_sentinel() {
            return Ok(TreeScan::empty());
        }
        Ok(TreeScan::new(iter))
    }
}
