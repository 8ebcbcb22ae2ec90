use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::storage::FrameId;

/// Replacer tracks frame usage for replacement in case the buffer pool is full.
pub trait Replacer: Send + Sync {
    /// Record the event that the given frame id is accessed at the current
    /// timestamp. Create a new entry for access history if the frame id has
    /// not been seen before.
    fn record_access(&self, frame_id: FrameId);

    /// Find the frame to evict with the replacement policy. Only frames that
    /// are marked as evictable are candidates for eviction.
    ///
    /// Successful eviction of a frame decrements the size of the replacer and
    /// removes the frame's access history.
    ///
    /// Return the frame id if a frame is evicted successfully, None if no
    /// frame can be evicted.
    fn evict(&self) -> Option<FrameId>;

    /// Toggle whether a frame is evictable or non-evictable. This function
    /// also controls the replacer size, which equals the number of evictable
    /// entries.
    ///
    /// Panics if the frame id is not tracked by the replacer.
    fn set_evictable(&self, frame_id: FrameId, evictable: bool);

    /// Remove a frame from the replacer, along with its access history,
    /// regardless of its position in the replacement order. Unknown frames
    /// are ignored.
    ///
    /// Panics if the frame is tracked but not evictable.
    fn remove(&self, frame_id: FrameId);

    /// Number of evictable frames.
    fn size(&self) -> usize;
}

struct LruKNode {
    /// The most recent k access timestamps, oldest first.
    history: VecDeque<u64>,
    k: usize,
    is_evictable: bool,
}

impl LruKNode {
    fn new(k: usize) -> Self {
        assert!(k > 0, "replacer k should be larger than zero");
        LruKNode { history: VecDeque::with_capacity(k), k, is_evictable: false }
    }

    fn record_access(&mut self, timestamp: u64) {
        if self.history.len() == self.k {
            self.history.pop_front();
        }
        self.history.push_back(timestamp)
    }

    fn has_k_history(&self) -> bool {
        self.history.len() == self.k
    }

    /// Timestamp of the k-th most recent access. The older this is, the
    /// larger the backward k-distance, and the better an eviction victim
    /// the frame makes.
    fn kth_recent_access(&self) -> u64 {
        debug_assert!(self.has_k_history());
        *self.history.front().unwrap_or(&0)
    }
}

/// LruKReplacer implements the LRU-K replacement policy.
///
/// The LRU-K algorithm evicts the frame whose backward k-distance is the
/// maximum over all evictable frames. Backward k-distance is the difference
/// between the current timestamp and the timestamp of the k-th previous
/// access.
///
/// A frame with fewer than k recorded accesses has +inf backward k-distance;
/// all such frames live in the default list and are preferred as victims,
/// oldest first appearance first. Frames with k or more accesses live in the
/// k list, ordered by the timestamp of their k-th most recent access.
pub struct LruKReplacer {
    nodes: HashMap<FrameId, LruKNode>,
    /// Frames with fewer than k accesses. Front = newest first access,
    /// back = oldest (the next victim among them).
    default_list: VecDeque<FrameId>,
    /// Frames with at least k accesses, sorted by k-th most recent access
    /// timestamp. Front = most recent, back = oldest (the next victim).
    k_list: VecDeque<FrameId>,
    current_timestamp: u64,
    current_size: usize,
    replacer_size: usize,
    k: usize,
}

impl LruKReplacer {
    pub fn new(k: usize, size: usize) -> Self {
        assert!(k > 0, "replacer k should be larger than zero");
        LruKReplacer {
            nodes: HashMap::new(),
            default_list: VecDeque::new(),
            k_list: VecDeque::new(),
            current_timestamp: 0,
            current_size: 0,
            replacer_size: size,
            k,
        }
    }

    fn record_access(&mut self, frame_id: FrameId) {
        if frame_id >= self.replacer_size {
            return;
        }
        let timestamp = self.current_timestamp;
        self.current_timestamp += 1;

        if !self.nodes.contains_key(&frame_id) {
            let mut node = LruKNode::new(self.k);
            node.record_access(timestamp);
            let full = node.has_k_history();
            self.nodes.insert(frame_id, node);
            if full {
                // k == 1: the very first access already completes the history
                self.insert_k_node(frame_id);
            } else {
                self.default_list.push_front(frame_id);
            }
            return;
        }

        let node = self.nodes.get_mut(&frame_id).expect("checked above");
        let was_full = node.has_k_history();
        node.record_access(timestamp);
        if !node.has_k_history() {
            // Still warming up: the frame keeps its position in the default
            // list, FIFO by first appearance.
            return;
        }
        if was_full {
            // Already in the k list; its k-distance changed, so it is
            // re-inserted at the correct sorted position.
            remove_from(&mut self.k_list, frame_id);
        } else {
            // Just reached k accesses: graduate from the default list.
            remove_from(&mut self.default_list, frame_id);
        }
        self.insert_k_node(frame_id);
    }

    /// Insert into the k list keeping it sorted: most recent k-th access at
    /// the front, oldest at the back.
    fn insert_k_node(&mut self, frame_id: FrameId) {
        let kth = self.nodes[&frame_id].kth_recent_access();
        let pos = self
            .k_list
            .iter()
            .position(|other| self.nodes[other].kth_recent_access() <= kth)
            .unwrap_or(self.k_list.len());
        self.k_list.insert(pos, frame_id);
    }

    fn evict(&mut self) -> Option<FrameId> {
        if self.current_size == 0 {
            return None;
        }
        // Frames with incomplete history (infinite k-distance) go first,
        // oldest first appearance first.
        if let Some(frame_id) = take_evictable_from_back(&mut self.default_list, &self.nodes) {
            self.finish_eviction(frame_id);
            return Some(frame_id);
        }
        // Then the frame with the oldest k-th most recent access, i.e. the
        // maximum backward k-distance.
        if let Some(frame_id) = take_evictable_from_back(&mut self.k_list, &self.nodes) {
            self.finish_eviction(frame_id);
            return Some(frame_id);
        }
        None
    }

    fn finish_eviction(&mut self, frame_id: FrameId) {
        self.nodes.remove(&frame_id);
        self.current_size -= 1;
    }

    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) {
        let node = self
            .nodes
            .get_mut(&frame_id)
            .unwrap_or_else(|| panic!("frame {} is not tracked by the replacer", frame_id));
        if node.is_evictable == evictable {
            return;
        }
        node.is_evictable = evictable;
        if evictable {
            self.current_size += 1;
        } else {
            self.current_size -= 1;
        }
    }

    fn remove(&mut self, frame_id: FrameId) {
        let Some(node) = self.nodes.get(&frame_id) else {
            return;
        };
        assert!(
            node.is_evictable,
            "cannot remove non-evictable frame {} from the replacer",
            frame_id
        );
        if node.has_k_history() {
            remove_from(&mut self.k_list, frame_id);
        } else {
            remove_from(&mut self.default_list, frame_id);
        }
        self.nodes.remove(&frame_id);
        self.current_size -= 1;
    }

    fn size(&self) -> usize {
        self.current_size
    }
}

fn remove_from(list: &mut VecDeque<FrameId>, frame_id: FrameId) {
    if let Some(pos) = list.iter().position(|&id| id == frame_id) {
        list.remove(pos);
    }
}

/// Scan a list from the back toward the front and take the first evictable
/// frame out of it.
fn take_evictable_from_back(
    list: &mut VecDeque<FrameId>,
    nodes: &HashMap<FrameId, LruKNode>,
) -> Option<FrameId> {
    let pos = list.iter().rposition(|id| nodes[id].is_evictable)?;
    list.remove(pos)
}

/// SyncLruKReplacer is the thread-safe version of the LRU-K policy; all the
/// heavy lifting happens in LruKReplacer. The inner mutex is independent of
/// the buffer pool mutex, so the replacer may be called while the pool mutex
/// is held.
pub struct SyncLruKReplacer {
    inner: Mutex<LruKReplacer>,
}

impl SyncLruKReplacer {
    pub fn new(k: usize, size: usize) -> Self {
        let inner = Mutex::new(LruKReplacer::new(k, size));
        SyncLruKReplacer { inner }
    }
}

impl Replacer for SyncLruKReplacer {
    fn record_access(&self, frame_id: FrameId) {
        let mut guard = self.inner.lock().unwrap();
        guard.record_access(frame_id)
    }

    fn evict(&self) -> Option<FrameId> {
        let mut guard = self.inner.lock().unwrap();
        guard.evict()
    }

    fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let mut guard = self.inner.lock().unwrap();
        guard.set_evictable(frame_id, evictable)
    }

    fn remove(&self, frame_id: FrameId) {
        let mut guard = self.inner.lock().unwrap();
        guard.remove(frame_id)
    }

    fn size(&self) -> usize {
        let guard = self.inner.lock().unwrap();
        guard.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_list_is_fifo_by_first_access() {
        let mut replacer = LruKReplacer::new(2, 7);

        // Three frames, each accessed once: all have infinite k-distance.
        replacer.record_access(1);
        replacer.record_access(2);
        replacer.record_access(3);
        replacer.set_evictable(1, true);
        replacer.set_evictable(2, true);
        replacer.set_evictable(3, true);
        assert_eq!(3, replacer.size());

        // A second access to frame 1 graduates it to the k list; frames 2
        // and 3 stay in the default list and are evicted oldest first
        // appearance first, ahead of the graduated frame.
        replacer.record_access(1);
        assert_eq!(Some(2), replacer.evict());
        assert_eq!(Some(3), replacer.evict());
        assert_eq!(Some(1), replacer.evict());
        assert_eq!(0, replacer.size());
    }

    #[test]
    fn test_incomplete_history_preferred_over_k_list() {
        let mut replacer = LruKReplacer::new(2, 7);

        // Frame 1 reaches k accesses, frame 2 does not.
        replacer.record_access(1);
        replacer.record_access(1);
        replacer.record_access(2);
        replacer.set_evictable(1, true);
        replacer.set_evictable(2, true);

        // Frame 2 has infinite k-distance and wins even though frame 1 was
        // accessed earlier.
        assert_eq!(Some(2), replacer.evict());
        assert_eq!(Some(1), replacer.evict());
    }

    #[test]
    fn test_evict_scenario_k2() {
        let mut replacer = LruKReplacer::new(2, 7);

        // Access sequence 1,2,3,4,1,2,3,1,2: frames 1-3 reach two accesses,
        // frame 4 stays at one.
        for frame_id in [1, 2, 3, 4, 1, 2, 3, 1, 2] {
            replacer.record_access(frame_id);
        }
        for frame_id in 1..=4 {
            replacer.set_evictable(frame_id, true);
        }
        assert_eq!(4, replacer.size());

        // Frame 4 is the only one still in the default list.
        assert_eq!(Some(4), replacer.evict());
        // Among the k list, frame 3's second-most-recent access is oldest.
        assert_eq!(Some(3), replacer.evict());
        assert_eq!(Some(1), replacer.evict());
        assert_eq!(Some(2), replacer.evict());
        assert_eq!(0, replacer.size());
        assert_eq!(None, replacer.evict());
    }

    #[test]
    fn test_non_evictable_frames_are_skipped() {
        let mut replacer = LruKReplacer::new(2, 7);
        replacer.record_access(1);
        replacer.record_access(2);
        replacer.record_access(3);
        replacer.set_evictable(1, true);
        replacer.set_evictable(2, false);
        replacer.set_evictable(3, true);
        assert_eq!(2, replacer.size());

        assert_eq!(Some(1), replacer.evict());
        assert_eq!(Some(3), replacer.evict());
        assert_eq!(None, replacer.evict());
        assert_eq!(0, replacer.size());

        // Frame 2 is still tracked and can be released later.
        replacer.set_evictable(2, true);
        assert_eq!(Some(2), replacer.evict());
    }

    #[test]
    fn test_set_evictable_adjusts_size_once() {
        let mut replacer = LruKReplacer::new(2, 7);
        replacer.record_access(1);
        assert_eq!(0, replacer.size());
        replacer.set_evictable(1, true);
        replacer.set_evictable(1, true);
        assert_eq!(1, replacer.size());
        replacer.set_evictable(1, false);
        assert_eq!(0, replacer.size());
    }

    #[test]
    fn test_remove() {
        let mut replacer = LruKReplacer::new(2, 7);
        replacer.record_access(1);
        replacer.record_access(2);
        replacer.set_evictable(1, true);
        replacer.set_evictable(2, true);

        replacer.remove(1);
        assert_eq!(1, replacer.size());
        assert_eq!(Some(2), replacer.evict());

        // Removing an unknown frame does nothing.
        replacer.remove(9);
        assert_eq!(0, replacer.size());
    }

    #[test]
    fn test_record_access_out_of_range_is_rejected() {
        let mut replacer = LruKReplacer::new(2, 7);
        // Frame ids are valid in [0, replacer_size); 7 is out of range.
        replacer.record_access(7);
        assert!(replacer.nodes.is_empty());
    }

    #[test]
    #[should_panic(expected = "not tracked by the replacer")]
    fn test_set_evictable_unknown_frame_panics() {
        let mut replacer = LruKReplacer::new(2, 7);
        replacer.set_evictable(3, true);
    }

    #[test]
    #[should_panic(expected = "cannot remove non-evictable frame")]
    fn test_remove_non_evictable_panics() {
        let mut replacer = LruKReplacer::new(2, 7);
        replacer.record_access(1);
        replacer.remove(1);
    }

    #[test]
    fn test_reaccess_reorders_k_list() {
        let mut replacer = LruKReplacer::new(2, 7);
        // Both frames complete their history; frame 1 is then touched twice
        // more, so its second-most-recent access becomes newer than frame
        // 2's and frame 2 turns into the better victim.
        for frame_id in [1, 1, 2, 2, 1, 1] {
            replacer.record_access(frame_id);
        }
        replacer.set_evictable(1, true);
        replacer.set_evictable(2, true);

        assert_eq!(Some(2), replacer.evict());
        assert_eq!(Some(1), replacer.evict());
    }

    #[test]
    fn test_sync_replacer_smoke() {
        let replacer = SyncLruKReplacer::new(2, 4);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.set_evictable(0, true);
        replacer.set_evictable(1, true);
        assert_eq!(2, replacer.size());
        assert_eq!(Some(0), replacer.evict());
        assert_eq!(Some(1), replacer.evict());
        assert_eq!(None, replacer.evict());
    }
}
