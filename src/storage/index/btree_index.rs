use std::cmp::Ordering;
use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use log::debug;

use crate::buffer::{
    BufferManager, PageId, ReadPageGuard, WritePageGuard, INVALID_PAGE_ID, PAGE_SIZE,
};
use crate::error::{VellumError, VellumResult};
use crate::storage::codec::{
    BPlusTreeHeaderPageCodec, BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec,
    BPlusTreePageCodec, RidCodec,
};
use crate::storage::comparator::KeySchema;
use crate::storage::page::{
    BPlusTreeHeaderPage, BPlusTreeInternalPage, BPlusTreeLeafPage, BPlusTreePage, Key, RecordId,
};

const LEAF_HEADER_SIZE: usize = 13;
const INTERNAL_HEADER_SIZE: usize = 9;
const CHILD_PTR_SIZE: usize = 4;

/// Latching state of one structure-modifying operation.
///
/// The guard stack *is* the root-to-leaf path: nodes carry no parent
/// pointers. `indexes[i]` is the child slot followed at `write_set[i]`;
/// both stacks are consumed in reverse during upward propagation.
#[derive(Debug)]
struct Context {
    header_guard: Option<WritePageGuard>,
    root_page_id: PageId,
    write_set: VecDeque<WritePageGuard>,
    indexes: Vec<usize>,
}

impl Context {
    fn new() -> Self {
        Self {
            header_guard: None,
            root_page_id: INVALID_PAGE_ID,
            write_set: VecDeque::new(),
            indexes: Vec::new(),
        }
    }

    /// Release every guard above the current node, header included. Called
    /// once the operation is proven not to propagate structural changes.
    fn release_ancestors(&mut self) {
        self.write_set.clear();
        self.indexes.clear();
        self.header_guard = None;
    }
}

/// A disk-resident B+Tree index over fixed-width binary keys.
///
/// Readers descend with latch coupling, holding at most one page guard at
/// a time. Writers latch the header page, then the full root-to-leaf path
/// in write mode, releasing everything above the leaf as soon as the leaf
/// is proven safe. Split and merge cascades walk the held path upward, so
/// no operation ever re-latches from below and the latch order is strictly
/// root-to-leaf: the protocol cannot deadlock.
#[derive(Debug)]
pub struct BPlusTreeIndex {
    pub key_schema: KeySchema,
    pub buffer_pool: Arc<BufferManager>,
    pub internal_max_size: u32,
    pub leaf_max_size: u32,
    pub header_page_id: PageId,
}

impl BPlusTreeIndex {
    /// Create a fresh tree: allocates the header page and persists an
    /// invalid root id (the empty tree).
    pub fn new(
        key_schema: KeySchema,
        buffer_pool: Arc<BufferManager>,
        internal_max_size: u32,
        leaf_max_size: u32,
    ) -> VellumResult<Self> {
        Self::check_fanout(&key_schema, internal_max_size, leaf_max_size)?;

        let mut header_guard = buffer_pool.new_page()?;
        let header_page_id = header_guard.page_id();
        let header_page = BPlusTreeHeaderPage {
            root_page_id: INVALID_PAGE_ID,
        };
        header_guard.overwrite(&BPlusTreeHeaderPageCodec::encode(&header_page));
        drop(header_guard);

        Ok(Self {
            key_schema,
            buffer_pool,
            internal_max_size,
            leaf_max_size,
            header_page_id,
        })
    }

    /// Attach to an existing tree by its header page id.
    pub fn open(
        key_schema: KeySchema,
        buffer_pool: Arc<BufferManager>,
        internal_max_size: u32,
        leaf_max_size: u32,
        header_page_id: PageId,
    ) -> Self {
        Self {
            key_schema,
            buffer_pool,
            internal_max_size,
            leaf_max_size,
            header_page_id,
        }
    }

    fn check_fanout(
        key_schema: &KeySchema,
        internal_max_size: u32,
        leaf_max_size: u32,
    ) -> VellumResult<()> {
        if leaf_max_size < 2 || internal_max_size < 3 {
            return Err(VellumError::Storage(format!(
                "fanout too small: leaf_max_size={}, internal_max_size={}",
                leaf_max_size, internal_max_size
            )));
        }
        let leaf_bytes =
            LEAF_HEADER_SIZE + leaf_max_size as usize * (key_schema.key_size + RidCodec::SIZE);
        let internal_bytes = INTERNAL_HEADER_SIZE
            + internal_max_size as usize * (key_schema.key_size + CHILD_PTR_SIZE);
        if leaf_bytes > PAGE_SIZE || internal_bytes > PAGE_SIZE {
            return Err(VellumError::Storage(format!(
                "node does not fit in a page: leaf {} bytes, internal {} bytes, page {}",
                leaf_bytes, internal_bytes, PAGE_SIZE
            )));
        }
        Ok(())
    }

    fn check_key(&self, key: &[u8]) -> VellumResult<()> {
        if key.len() != self.key_schema.key_size {
            return Err(VellumError::Storage(format!(
                "key is {} bytes, tree expects {}",
                key.len(),
                self.key_schema.key_size
            )));
        }
        Ok(())
    }

    pub fn get_root_page_id(&self) -> VellumResult<PageId> {
        let header_guard = self.buffer_pool.fetch_page_read(self.header_page_id)?;
        let (header_page, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;
        Ok(header_page.root_page_id)
    }

    pub fn is_empty(&self) -> VellumResult<bool> {
        Ok(self.get_root_page_id()? == INVALID_PAGE_ID)
    }

    fn write_header_root(guard: &mut WritePageGuard, root_page_id: PageId) {
        let header_page = BPlusTreeHeaderPage { root_page_id };
        guard.overwrite(&BPlusTreeHeaderPageCodec::encode(&header_page));
    }

    /// Point lookup. Descends with read crabbing: the child guard is
    /// acquired before the parent guard is released, and at most one guard
    /// is held at a time.
    ///
    /// No latch spans the window between reading the header and latching
    /// the root, so a concurrent root collapse can invalidate the root id
    /// we observed; such descents restart from the header (bounded).
    pub fn get(&self, key: &[u8]) -> VellumResult<Option<RecordId>> {
        self.check_key(key)?;

        const MAX_RESTARTS: usize = 8;
        let mut restarts = 0;
        'restart: loop {
            let root_page_id = self.get_root_page_id()?;
            if root_page_id == INVALID_PAGE_ID {
                return Ok(None);
            }

            let mut guard = match self.buffer_pool.fetch_page_read(root_page_id) {
                Ok(guard) => guard,
                Err(_) if restarts < MAX_RESTARTS => {
                    restarts += 1;
                    continue 'restart;
                }
                Err(e) => return Err(e),
            };
            loop {
                let page = match BPlusTreePageCodec::decode(guard.data(), self.key_schema) {
                    Ok((page, _)) => page,
                    Err(_) if restarts < MAX_RESTARTS => {
                        restarts += 1;
                        continue 'restart;
                    }
                    Err(e) => return Err(e),
                };
                match page {
                    BPlusTreePage::Internal(internal) => {
                        let child_page_id = internal.look_up(key);
                        // the assignment latches the child before the old
                        // guard drops
                        guard = self.buffer_pool.fetch_page_read(child_page_id)?;
                    }
                    BPlusTreePage::Leaf(leaf) => return Ok(leaf.look_up(key)),
                }
            }
        }
    }

    /// Insert a key/value pair. Returns `false` (tree untouched) if the
    /// key is already present.
    pub fn insert(&self, key: &[u8], rid: RecordId) -> VellumResult<bool> {
        self.check_key(key)?;

        let mut context = Context::new();
        let mut header_guard = self.buffer_pool.fetch_page_write(self.header_page_id)?;
        let (header_page, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;
        context.root_page_id = header_page.root_page_id;

        if context.root_page_id == INVALID_PAGE_ID {
            let mut root_guard = self.buffer_pool.new_page()?;
            let root_page_id = root_guard.page_id();
            let mut leaf = BPlusTreeLeafPage::new(self.key_schema, self.leaf_max_size);
            leaf.insert(key.to_vec(), rid);
            root_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
            drop(root_guard);
            Self::write_header_root(&mut header_guard, root_page_id);
            debug!("btree: started new tree with root page {}", root_page_id);
            return Ok(true);
        }
        context.header_guard = Some(header_guard);

        let (mut leaf_guard, mut leaf) = self.find_leaf_page_pessimistic(key, &mut context)?;

        let pos = leaf.insert_position(key);
        if pos < leaf.array.len()
            && self.key_schema.compare(leaf.key_at(pos), key) == Ordering::Equal
        {
            return Ok(false);
        }

        // safe leaf: nothing propagates upward, drop every ancestor first
        if leaf.header.current_size < leaf.header.max_size {
            context.release_ancestors();
            leaf.insert_at(pos, key.to_vec(), rid);
            leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
            return Ok(true);
        }

        self.split_insert(key, rid, pos, leaf_guard, leaf, context)
    }

    /// Insert into a full leaf: split it and walk the held path upward,
    /// inserting the promoted separator at each level, splitting further
    /// while ancestors are full, and growing a new root if the cascade
    /// exhausts the stack.
    fn split_insert(
        &self,
        key: &[u8],
        rid: RecordId,
        pos: usize,
        mut leaf_guard: WritePageGuard,
        mut leaf: BPlusTreeLeafPage,
        mut context: Context,
    ) -> VellumResult<bool> {
        // The held guard stack fixes the shape of the cascade: one new
        // page per full node from the leaf up, plus one if the root itself
        // splits. Allocate them all before mutating anything, so an
        // allocation failure aborts with the tree untouched.
        let mut splitting_levels = 0usize;
        let mut grows_root = true;
        for ancestor in context.write_set.iter().rev() {
            let (header, _) = BPlusTreeInternalPageCodec::decode(ancestor.data(), self.key_schema)
                .map(|(page, len)| (page.header, len))?;
            if header.current_size < header.max_size {
                grows_root = false;
                break;
            }
            splitting_levels += 1;
        }
        let total_pages = 1 + splitting_levels + usize::from(grows_root);
        let mut new_pages: VecDeque<WritePageGuard> = VecDeque::with_capacity(total_pages);
        for _ in 0..total_pages {
            new_pages.push_back(self.buffer_pool.new_page()?);
        }

        // leaf split: ceiling half stays, the rest moves right
        let mut new_leaf_guard = new_pages.pop_front().expect("leaf split page");
        let new_leaf_id = new_leaf_guard.page_id();
        leaf.insert_at(pos, key.to_vec(), rid);
        let first_size = (self.leaf_max_size as usize + 2) / 2;
        let moved = leaf.split_off(first_size);
        let mut new_leaf = BPlusTreeLeafPage::new(self.key_schema, self.leaf_max_size);
        new_leaf.batch_insert(moved);
        new_leaf.header.next_page_id = leaf.header.next_page_id;
        leaf.header.next_page_id = new_leaf_id;

        let mut promoted_key = new_leaf.key_at(0).clone();
        let mut right_page_id = new_leaf_id;
        new_leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&new_leaf));
        leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
        drop(new_leaf_guard);
        drop(leaf_guard);
        debug!(
            "btree: split leaf, right sibling is page {}",
            right_page_id
        );

        while let Some(mut internal_guard) = context.write_set.pop_back() {
            // the new child pointer goes just right of the slot followed
            let pos = self.pop_index(&mut context)? + 1;
            let (mut internal, _) =
                BPlusTreeInternalPageCodec::decode(internal_guard.data(), self.key_schema)?;

            if internal.header.current_size < internal.header.max_size {
                internal.insert_at(pos, promoted_key, right_page_id);
                internal_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&internal));
                context.release_ancestors();
                debug_assert!(new_pages.is_empty());
                return Ok(true);
            }

            // full ancestor: insert, split, and promote the middle key.
            // When `pos == first_size` the promoted key is the freshly
            // inserted one and the new child becomes the right node's
            // sentinel child, which this arrangement yields with no
            // special case.
            let mut new_internal_guard = new_pages.pop_front().expect("internal split page");
            let new_internal_id = new_internal_guard.page_id();
            internal.insert_at(pos, promoted_key, right_page_id);
            let first_size = (self.internal_max_size as usize + 2) / 2;
            let mut moved = internal.split_off(first_size);
            promoted_key = mem::take(&mut moved[0].0);
            let mut new_internal =
                BPlusTreeInternalPage::new(self.key_schema, self.internal_max_size);
            new_internal.batch_insert(moved);

            new_internal_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&new_internal));
            internal_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&internal));
            right_page_id = new_internal_id;
            drop(new_internal_guard);
            drop(internal_guard);
            debug!(
                "btree: split internal, right sibling is page {}",
                right_page_id
            );
        }

        // the old root split: anchor a new root above both halves
        let mut new_root_guard = new_pages.pop_front().expect("root split page");
        let new_root_id = new_root_guard.page_id();
        let mut new_root = BPlusTreeInternalPage::new(self.key_schema, self.internal_max_size);
        new_root.batch_insert(vec![
            (Key::new(), context.root_page_id),
            (promoted_key, right_page_id),
        ]);
        new_root_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&new_root));
        drop(new_root_guard);

        let mut header_guard = context
            .header_guard
            .take()
            .ok_or_else(|| VellumError::Internal("root split without header guard".to_string()))?;
        Self::write_header_root(&mut header_guard, new_root_id);
        debug!("btree: grew new root page {}", new_root_id);
        debug_assert!(new_pages.is_empty());
        Ok(true)
    }

    /// Remove a key. A no-op if the key is absent.
    pub fn remove(&self, key: &[u8]) -> VellumResult<()> {
        self.check_key(key)?;

        let mut context = Context::new();
        let header_guard = self.buffer_pool.fetch_page_write(self.header_page_id)?;
        let (header_page, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;
        context.root_page_id = header_page.root_page_id;
        if context.root_page_id == INVALID_PAGE_ID {
            return Ok(());
        }
        context.header_guard = Some(header_guard);

        let (mut leaf_guard, mut leaf) = self.find_leaf_page_pessimistic(key, &mut context)?;

        let Some(index) = leaf.key_index(key) else {
            return Ok(());
        };
        let was_first = index == 0;
        leaf.remove_at(index);
        leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));

        if context.write_set.is_empty() {
            // the leaf is the root; it may underflow to empty but never
            // merges
            if leaf.header.current_size == 0 {
                self.reset_root(leaf_guard, &mut context)?;
            }
            return Ok(());
        }

        if was_first {
            let new_min = if leaf.header.current_size > 0 {
                Some(leaf.key_at(0).clone())
            } else {
                // The leaf emptied out and will rebalance against its right
                // sibling (it has none to the left when any ancestor
                // separator can reference it), so the subtree minimum
                // becomes that sibling's first key.
                let node_idx = *context
                    .indexes
                    .last()
                    .ok_or_else(|| VellumError::Internal("empty descent path".to_string()))?;
                if node_idx == 0 {
                    let parent_guard = context.write_set.back().ok_or_else(|| {
                        VellumError::Internal("empty write set during refresh".to_string())
                    })?;
                    let (parent, _) =
                        BPlusTreeInternalPageCodec::decode(parent_guard.data(), self.key_schema)?;
                    let sibling_guard = self.buffer_pool.fetch_page_read(parent.value_at(1))?;
                    let (sibling, _) =
                        BPlusTreeLeafPageCodec::decode(sibling_guard.data(), self.key_schema)?;
                    Some(sibling.key_at(0).clone())
                } else {
                    None
                }
            };
            if let Some(new_min) = new_min {
                self.refresh_min_key_separator(&mut context, new_min)?;
            }
        }

        if leaf.header.current_size >= leaf.min_size() {
            return Ok(());
        }

        self.handle_underflow(leaf_guard, BPlusTreePage::Leaf(leaf), &mut context)
    }

    /// Rebalance an underflowing non-root node against the sibling the
    /// parent prefers (left when one exists), merging when the sibling is
    /// minimally filled and recursing into the parent when the merge
    /// underflows it in turn.
    fn handle_underflow(
        &self,
        node_guard: WritePageGuard,
        node_page: BPlusTreePage,
        context: &mut Context,
    ) -> VellumResult<()> {
        let mut node_guard = node_guard;
        let mut node_page = node_page;

        loop {
            if context.write_set.is_empty() {
                return self.adjust_root(node_guard, node_page, context);
            }

            let mut parent_guard = self
                .pop_guard(context)
                .ok_or_else(|| VellumError::Internal("underflow without parent".to_string()))?;
            let node_idx = self.pop_index(context)?;
            let (mut parent, _) =
                BPlusTreeInternalPageCodec::decode(parent_guard.data(), self.key_schema)?;
            debug_assert_eq!(parent.value_at(node_idx), node_guard.page_id());

            let from_left = node_idx > 0;
            let sibling_idx = if from_left { node_idx - 1 } else { node_idx + 1 };
            let sibling_page_id = parent.value_at(sibling_idx);
            let mut sibling_guard = self.buffer_pool.fetch_page_write(sibling_page_id)?;
            let (mut sibling, _) =
                BPlusTreePageCodec::decode(sibling_guard.data(), self.key_schema)?;

            if sibling.current_size() > sibling.min_size() {
                self.redistribute(
                    &mut node_page,
                    &mut sibling,
                    &mut parent,
                    node_idx,
                    from_left,
                )?;
                sibling_guard.overwrite(&BPlusTreePageCodec::encode(&sibling));
                node_guard.overwrite(&BPlusTreePageCodec::encode(&node_page));
                parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
                return Ok(());
            }

            // merge into the left of the pair and drop the right page
            let (mut left_guard, mut left_page, right_guard, right_page) = if from_left {
                (sibling_guard, sibling, node_guard, node_page)
            } else {
                (node_guard, node_page, sibling_guard, sibling)
            };
            let right_idx = if from_left { node_idx } else { node_idx + 1 };
            let right_page_id = right_guard.page_id();

            match (&mut left_page, right_page) {
                (BPlusTreePage::Leaf(left), BPlusTreePage::Leaf(mut right)) => {
                    left.merge(&mut right);
                    left.header.next_page_id = right.header.next_page_id;
                }
                (BPlusTreePage::Internal(left), BPlusTreePage::Internal(mut right)) => {
                    let middle_key = parent.key_at(right_idx).clone();
                    left.merge(middle_key, &mut right);
                }
                _ => {
                    return Err(VellumError::Internal(
                        "mismatched sibling page types in merge".to_string(),
                    ))
                }
            }
            parent.remove_at(right_idx);

            left_guard.overwrite(&BPlusTreePageCodec::encode(&left_page));
            parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
            drop(left_guard);
            drop(right_guard);
            self.buffer_pool.delete_page(right_page_id)?;
            debug!("btree: merged page {} into its left sibling", right_page_id);

            if context.write_set.is_empty() {
                return self.adjust_root(parent_guard, BPlusTreePage::Internal(parent), context);
            }
            if parent.header.current_size >= parent.min_size() {
                return Ok(());
            }
            node_guard = parent_guard;
            node_page = BPlusTreePage::Internal(parent);
        }
    }

    /// Move one boundary entry from `sibling` into `node` across the
    /// parent separator. For internal nodes the separator rotates down
    /// into the receiver while the sibling's boundary key rotates up.
    fn redistribute(
        &self,
        node: &mut BPlusTreePage,
        sibling: &mut BPlusTreePage,
        parent: &mut BPlusTreeInternalPage,
        node_idx: usize,
        from_left: bool,
    ) -> VellumResult<()> {
        match (node, sibling) {
            (BPlusTreePage::Leaf(node), BPlusTreePage::Leaf(sibling)) => {
                if from_left {
                    let (moved_key, moved_rid) = sibling.pop_last();
                    node.insert_at(0, moved_key, moved_rid);
                    parent.array[node_idx].0 = node.key_at(0).clone();
                } else {
                    let (moved_key, moved_rid) = sibling.remove_at(0);
                    let end = node.array.len();
                    node.insert_at(end, moved_key, moved_rid);
                    parent.array[node_idx + 1].0 = sibling.key_at(0).clone();
                }
            }
            (BPlusTreePage::Internal(node), BPlusTreePage::Internal(sibling)) => {
                if from_left {
                    let (moved_key, moved_child) = sibling.pop_last();
                    let pulled_down = parent.key_at(node_idx).clone();
                    node.array[0].0 = pulled_down;
                    node.insert_at(0, Key::new(), moved_child);
                    parent.array[node_idx].0 = moved_key;
                } else {
                    let (_, adopted_child) = sibling.remove_at(0);
                    let pulled_down = parent.key_at(node_idx + 1).clone();
                    let end = node.array.len();
                    node.insert_at(end, pulled_down, adopted_child);
                    parent.array[node_idx + 1].0 = mem::take(&mut sibling.array[0].0);
                }
            }
            _ => {
                return Err(VellumError::Internal(
                    "mismatched sibling page types in redistribution".to_string(),
                ))
            }
        }
        debug!("btree: redistributed one entry across a separator");
        Ok(())
    }

    /// Shrink at the top after a deletion cascade: an internal root with a
    /// single child hands the root role to that child, an empty leaf root
    /// empties the tree.
    fn adjust_root(
        &self,
        root_guard: WritePageGuard,
        root_page: BPlusTreePage,
        context: &mut Context,
    ) -> VellumResult<()> {
        match root_page {
            BPlusTreePage::Internal(root) if root.header.current_size == 1 => {
                let new_root_id = root.value_at(0);
                let old_root_id = root_guard.page_id();
                let mut header_guard = context.header_guard.take().ok_or_else(|| {
                    VellumError::Internal("root collapse without header guard".to_string())
                })?;
                Self::write_header_root(&mut header_guard, new_root_id);
                drop(root_guard);
                self.buffer_pool.delete_page(old_root_id)?;
                debug!(
                    "btree: collapsed root {} into child {}",
                    old_root_id, new_root_id
                );
            }
            _ => {}
        }
        Ok(())
    }

    /// The root leaf lost its last entry: the tree becomes empty.
    fn reset_root(
        &self,
        root_guard: WritePageGuard,
        context: &mut Context,
    ) -> VellumResult<()> {
        let old_root_id = root_guard.page_id();
        let mut header_guard = context
            .header_guard
            .take()
            .ok_or_else(|| VellumError::Internal("root reset without header guard".to_string()))?;
        Self::write_header_root(&mut header_guard, INVALID_PAGE_ID);
        drop(root_guard);
        self.buffer_pool.delete_page(old_root_id)?;
        debug!("btree: tree is empty, root page {} freed", old_root_id);
        Ok(())
    }

    /// Deleting a leaf's minimum can stale exactly one separator: the one
    /// at the deepest ancestor whose child slot on the descent path is
    /// non-zero. Refresh it to the leaf's new minimum.
    fn refresh_min_key_separator(&self, context: &mut Context, new_min: Key) -> VellumResult<()> {
        for depth in (0..context.indexes.len()).rev() {
            let child_idx = context.indexes[depth];
            if child_idx == 0 {
                continue;
            }
            let guard = context.write_set.get_mut(depth).ok_or_else(|| {
                VellumError::Internal("separator refresh walked off the path".to_string())
            })?;
            let (mut internal, _) =
                BPlusTreeInternalPageCodec::decode(guard.data(), self.key_schema)?;
            internal.array[child_idx].0 = new_min;
            guard.overwrite(&BPlusTreeInternalPageCodec::encode(&internal));
            return Ok(());
        }
        // the leaf sits on the leftmost path; no separator references it
        Ok(())
    }

    /// Descend to the leaf responsible for `key`, write-latching the whole
    /// path into the context. Ancestors are not released during descent;
    /// the caller decides when the operation is safe.
    fn find_leaf_page_pessimistic(
        &self,
        key: &[u8],
        context: &mut Context,
    ) -> VellumResult<(WritePageGuard, BPlusTreeLeafPage)> {
        let mut guard = self.buffer_pool.fetch_page_write(context.root_page_id)?;
        loop {
            let (page, _) = BPlusTreePageCodec::decode(guard.data(), self.key_schema)?;
            match page {
                BPlusTreePage::Internal(internal) => {
                    let child_idx = internal.child_index(key);
                    let child_page_id = internal.value_at(child_idx);
                    let child_guard = self.buffer_pool.fetch_page_write(child_page_id)?;
                    context.indexes.push(child_idx);
                    context.write_set.push_back(guard);
                    guard = child_guard;
                }
                BPlusTreePage::Leaf(leaf) => return Ok((guard, leaf)),
            }
        }
    }

    fn pop_guard(&self, context: &mut Context) -> Option<WritePageGuard> {
        context.write_set.pop_back()
    }

    fn pop_index(&self, context: &mut Context) -> VellumResult<usize> {
        context
            .indexes
            .pop()
            .ok_or_else(|| VellumError::Internal("child index stack underflow".to_string()))
    }

    /// Read-latched descent to the leaf that would contain `key`; used by
    /// iterators.
    pub(crate) fn find_leaf_page(
        &self,
        key: &[u8],
        start_page_id: PageId,
    ) -> VellumResult<ReadPageGuard> {
        let mut guard = self.buffer_pool.fetch_page_read(start_page_id)?;
        loop {
            let (page, _) = BPlusTreePageCodec::decode(guard.data(), self.key_schema)?;
            match page {
                BPlusTreePage::Internal(internal) => {
                    let child_page_id = internal.look_up(key);
                    guard = self.buffer_pool.fetch_page_read(child_page_id)?;
                }
                BPlusTreePage::Leaf(_) => return Ok(guard),
            }
        }
    }

    /// Read-latched descent along `C[0]` to the leftmost leaf.
    pub(crate) fn find_first_leaf_page(&self) -> VellumResult<Option<ReadPageGuard>> {
        let root_page_id = self.get_root_page_id()?;
        if root_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut guard = self.buffer_pool.fetch_page_read(root_page_id)?;
        loop {
            let (page, _) = BPlusTreePageCodec::decode(guard.data(), self.key_schema)?;
            match page {
                BPlusTreePage::Internal(internal) => {
                    let child_page_id = internal.value_at(0);
                    guard = self.buffer_pool.fetch_page_read(child_page_id)?;
                }
                BPlusTreePage::Leaf(_) => return Ok(Some(guard)),
            }
        }
    }
}
