use super::Replacer;
use crate::buffer::FrameId;
use crate::error::{VellumError, VellumResult};
use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
struct LruKNode {
    /// Timestamps of the last k accesses, oldest first.
    history: VecDeque<u64>,
    is_evictable: bool,
}

impl LruKNode {
    fn new(k: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(k),
            is_evictable: false,
        }
    }

    fn record_access(&mut self, timestamp: u64, k: usize) {
        self.history.push_back(timestamp);
        if self.history.len() > k {
            self.history.pop_front();
        }
    }
}

/// LRU-K replacer: evicts the evictable frame with the largest backward
/// k-distance. Frames with fewer than k recorded accesses have infinite
/// k-distance and are evicted first, oldest access first.
#[derive(Debug)]
pub struct LRUKReplacer {
    current_size: usize,
    replacer_size: usize,
    k: usize,
    node_store: HashMap<FrameId, LruKNode>,
    current_timestamp: u64,
}

impl LRUKReplacer {
    pub fn with_k(num_frames: usize, k: usize) -> Self {
        Self {
            current_size: 0,
            replacer_size: num_frames,
            k,
            node_store: HashMap::with_capacity(num_frames),
            current_timestamp: 0,
        }
    }
}

impl Replacer for LRUKReplacer {
    fn new(capacity: usize) -> Self {
        const DEFAULT_K: usize = 2;
        Self::with_k(capacity, DEFAULT_K)
    }

    fn evict(&mut self) -> Option<FrameId> {
        let mut max_k_distance = 0;
        let mut victim = None;
        for (frame_id, node) in self.node_store.iter() {
            if !node.is_evictable {
                continue;
            }
            let Some(&oldest) = node.history.front() else {
                continue;
            };
            let k_distance = if node.history.len() < self.k {
                u64::MAX - oldest
            } else {
                self.current_timestamp - oldest
            };
            if k_distance > max_k_distance {
                max_k_distance = k_distance;
                victim = Some(*frame_id);
            }
        }
        if let Some(frame_id) = victim {
            self.remove(frame_id);
        }
        victim
    }

    fn record_access(&mut self, frame_id: FrameId) -> VellumResult<()> {
        let timestamp = self.current_timestamp;
        self.current_timestamp += 1;
        if let Some(node) = self.node_store.get_mut(&frame_id) {
            node.record_access(timestamp, self.k);
        } else {
            if self.node_store.len() >= self.replacer_size {
                return Err(VellumError::Internal(
                    "frame count exceeds the replacer capacity".to_string(),
                ));
            }
            let mut node = LruKNode::new(self.k);
            node.record_access(timestamp, self.k);
            self.node_store.insert(frame_id, node);
        }
        Ok(())
    }

    fn set_evictable(&mut self, frame_id: FrameId, set_evictable: bool) -> VellumResult<()> {
        let node = self
            .node_store
            .get_mut(&frame_id)
            .ok_or_else(|| VellumError::Internal("frame not found".to_string()))?;
        if set_evictable && !node.is_evictable {
            self.current_size += 1;
        } else if !set_evictable && node.is_evictable {
            self.current_size -= 1;
        }
        node.is_evictable = set_evictable;
        Ok(())
    }

    fn remove(&mut self, frame_id: FrameId) {
        if let Some(node) = self.node_store.get(&frame_id) {
            assert!(node.is_evictable, "frame is not evictable");
            self.node_store.remove(&frame_id);
            self.current_size -= 1;
        }
    }

    fn size(&self) -> usize {
        self.current_size
    }
}
