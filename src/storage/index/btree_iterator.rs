use std::cmp::Ordering;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use crate::buffer::{ReadPageGuard, INVALID_PAGE_ID};
use crate::error::VellumResult;
use crate::storage::codec::BPlusTreeLeafPageCodec;
use crate::storage::page::{Key, RecordId};

use super::btree_index::BPlusTreeIndex;

/// Forward iterator over the leaf chain.
///
/// Holds a read guard on the leaf it is positioned in; advancing past the
/// last slot releases that guard before latching the next leaf, so the
/// iterator never holds two leaves at once. It sees a consistent snapshot
/// of each leaf it visits, nothing more.
#[derive(Debug)]
pub struct TreeIndexIterator {
    index: Arc<BPlusTreeIndex>,
    start_bound: Bound<Key>,
    end_bound: Bound<Key>,
    current_guard: Option<ReadPageGuard>,
    cursor: usize,
    started: bool,
}

impl TreeIndexIterator {
    pub fn new<R: RangeBounds<Key>>(index: Arc<BPlusTreeIndex>, range: R) -> Self {
        Self {
            index,
            start_bound: range.start_bound().cloned(),
            end_bound: range.end_bound().cloned(),
            current_guard: None,
            cursor: 0,
            started: false,
        }
    }

    fn position_at_start(&mut self) -> VellumResult<()> {
        let root_page_id = self.index.get_root_page_id()?;
        if root_page_id == INVALID_PAGE_ID {
            return Ok(());
        }
        match &self.start_bound {
            Bound::Included(start_key) | Bound::Excluded(start_key) => {
                let included = matches!(self.start_bound, Bound::Included(_));
                let guard = self.index.find_leaf_page(start_key, root_page_id)?;
                let (leaf, _) =
                    BPlusTreeLeafPageCodec::decode(guard.data(), self.index.key_schema)?;
                // past-the-end positions roll into the next leaf on the
                // first advance
                self.cursor = leaf
                    .next_closest(start_key, included)
                    .unwrap_or(leaf.header.current_size as usize);
                self.current_guard = Some(guard);
            }
            Bound::Unbounded => {
                self.cursor = 0;
                self.current_guard = self.index.find_first_leaf_page()?;
            }
        }
        Ok(())
    }

    /// Next entry in key order within the range, or `None` once exhausted.
    pub fn next(&mut self) -> VellumResult<Option<(Key, RecordId)>> {
        if !self.started {
            self.started = true;
            self.position_at_start()?;
        }

        loop {
            let Some(guard) = self.current_guard.as_ref() else {
                return Ok(None);
            };
            let (leaf, _) = BPlusTreeLeafPageCodec::decode(guard.data(), self.index.key_schema)?;

            if self.cursor >= leaf.header.current_size as usize {
                let next_page_id = leaf.header.next_page_id;
                // release the current leaf before touching the next one
                self.current_guard = None;
                if next_page_id == INVALID_PAGE_ID {
                    return Ok(None);
                }
                self.current_guard = Some(self.index.buffer_pool.fetch_page_read(next_page_id)?);
                self.cursor = 0;
                continue;
            }

            let (key, rid) = leaf.array[self.cursor].clone();
            let in_range = match &self.end_bound {
                Bound::Included(end_key) => {
                    self.index.key_schema.compare(&key, end_key) != Ordering::Greater
                }
                Bound::Excluded(end_key) => {
                    self.index.key_schema.compare(&key, end_key) == Ordering::Less
                }
                Bound::Unbounded => true,
            };
            if !in_range {
                self.current_guard = None;
                return Ok(None);
            }
            self.cursor += 1;
            return Ok(Some((key, rid)));
        }
    }
}

impl BPlusTreeIndex {
    /// Iterator positioned at the smallest key.
    pub fn begin(self: &Arc<Self>) -> TreeIndexIterator {
        TreeIndexIterator::new(self.clone(), ..)
    }

    /// Iterator positioned at the first key >= `key`.
    pub fn begin_at(self: &Arc<Self>, key: &[u8]) -> TreeIndexIterator {
        TreeIndexIterator::new(self.clone(), key.to_vec()..)
    }
}

#[cfg(test)]
mod tests {
    use std::ops::Bound;
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::buffer::BufferManager;
    use crate::storage::comparator::{default_comparator, KeySchema};
    use crate::storage::disk_manager::DiskManager;
    use crate::storage::index::{BPlusTreeIndex, TreeIndexIterator};
    use crate::storage::page::{Key, RecordId};

    fn key(value: i32) -> Key {
        value.to_be_bytes().to_vec()
    }

    fn rid(value: i32) -> RecordId {
        RecordId::new(value as u32, value as u32)
    }

    fn build_index(values: impl IntoIterator<Item = i32>) -> (TempDir, Arc<BPlusTreeIndex>) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager =
            Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let buffer_pool = Arc::new(BufferManager::new(1000, disk_manager));
        let key_schema = KeySchema::new(4, default_comparator);
        let index = Arc::new(BPlusTreeIndex::new(key_schema, buffer_pool, 4, 4).unwrap());
        for v in values {
            index.insert(&key(v), rid(v)).unwrap();
        }
        (temp_dir, index)
    }

    fn drain(mut iterator: TreeIndexIterator) -> Vec<(Key, RecordId)> {
        let mut out = Vec::new();
        while let Some(entry) = iterator.next().unwrap() {
            out.push(entry);
        }
        out
    }

    #[test]
    fn full_scan_yields_sorted_keys() {
        let (_tmp, index) = build_index([5, 3, 8, 1]);
        let entries = drain(index.begin());
        let keys: Vec<_> = entries.iter().map(|kv| kv.0.clone()).collect();
        assert_eq!(keys, vec![key(1), key(3), key(5), key(8)]);
    }

    #[test]
    fn scan_crosses_leaf_boundaries() {
        let (_tmp, index) = build_index(1..=13);
        let entries = drain(index.begin());
        let keys: Vec<_> = entries.iter().map(|kv| kv.0.clone()).collect();
        let expected: Vec<_> = (1..=13).map(key).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn begin_at_seeks_to_first_key_not_less() {
        let (_tmp, index) = build_index(1..=13);
        let entries = drain(index.begin_at(&key(7)));
        let keys: Vec<_> = entries.iter().map(|kv| kv.0.clone()).collect();
        let expected: Vec<_> = (7..=13).map(key).collect();
        assert_eq!(keys, expected);

        // seeking between keys lands on the next one
        index.remove(&key(7)).unwrap();
        let entries = drain(index.begin_at(&key(7)));
        assert_eq!(entries[0].0, key(8));
    }

    #[test]
    fn range_bounds_are_honored() {
        let (_tmp, index) = build_index(1..=13);

        let inclusive = TreeIndexIterator::new(index.clone(), key(3)..=key(5));
        let keys: Vec<_> = drain(inclusive).into_iter().map(|kv| kv.0).collect();
        assert_eq!(keys, vec![key(3), key(4), key(5)]);

        let exclusive = TreeIndexIterator::new(
            index.clone(),
            (Bound::Excluded(key(3)), Bound::Excluded(key(6))),
        );
        let keys: Vec<_> = drain(exclusive).into_iter().map(|kv| kv.0).collect();
        assert_eq!(keys, vec![key(4), key(5)]);
    }

    #[test]
    fn empty_tree_iterates_nothing() {
        let (_tmp, index) = build_index([]);
        let mut iterator = index.begin();
        assert_eq!(iterator.next().unwrap(), None);
        assert_eq!(iterator.next().unwrap(), None);
    }

    #[test]
    fn exhausted_iterator_stays_exhausted() {
        let (_tmp, index) = build_index([1, 2]);
        let mut iterator = index.begin();
        assert!(iterator.next().unwrap().is_some());
        assert!(iterator.next().unwrap().is_some());
        assert_eq!(iterator.next().unwrap(), None);
        assert_eq!(iterator.next().unwrap(), None);
    }
}
