//! B+Tree index over composite keys.
//!
//! Writes descend root-to-leaf holding exclusive latches and release
//! every ancestor as soon as the child below it is safe (room for one
//! more entry on insert, above the fill threshold after a removal on
//! delete). The root page number has its own lock, held for the whole
//! write and dropped together with the released ancestors.
//!
//! A split pre-allocates every page the cascade can need before any
//! in-place write: the latch stack holds exactly the chain of full
//! ancestors, so `stack depth (+1 for a root split)` pages suffice.
//! If allocation fails the batch is released and the tree is
//! untouched; pages left over after the cascade are returned to the
//! file's freelist.
//!
//! Deletes resolve an under-full page against its siblings in order -
//! redistribute from the left, redistribute from the right, merge
//! left, merge right - with sibling latches taken under the parent's
//! exclusive latch, left before right.

pub mod iter;
pub mod key;
pub mod page;

use std::sync::Arc;

use log::debug;
use parking_lot::{RwLock, RwLockWriteGuard};

use crate::core::errors::{NileDbError, Result, StorageError};
use crate::storage::buffer::{BufferPool, PageHandle, PageWriteGuard};
use crate::storage::page::{FileId, PageId, PageNum, RecordId, INVALID_PAGE_NUM};

use iter::IndexIter;
use key::{IndexCell, SortOrder};
use page::{
    build_internal, build_leaf, internal_entries, leaf_entries, BTreePage, BTreePageMut,
    BTREE_HEADER_SIZE, INTERNAL_SLOT_SIZE, LEAF_SLOT_SIZE,
};

type LeafEntry = (Vec<u8>, (PageNum, u32));
type SepEntry = (Vec<u8>, PageNum);

/// One exclusively latched, pinned page. The guard is declared first
/// so the latch is released before the pin on drop.
#[derive(Debug)]
struct Latched {
    guard: PageWriteGuard,
    handle: PageHandle,
}

impl Latched {
    fn acquire(pool: &Arc<BufferPool>, pid: PageId) -> Result<Latched> {
        let handle = pool.fetch_page(pid)?;
        let guard = handle.write();
        Ok(Latched { guard, handle })
    }

    fn create(pool: &Arc<BufferPool>, fid: FileId) -> Result<Latched> {
        let handle = pool.new_page(fid)?;
        let guard = handle.write();
        Ok(Latched { guard, handle })
    }

    fn pnum(&self) -> PageNum {
        self.handle.page_id().page_num
    }

    fn view(&self) -> Result<BTreePage<'_>> {
        BTreePage::open(&self.guard)
    }

    fn page(&mut self) -> BTreePageMut<'_> {
        BTreePageMut::new(&mut self.guard)
    }
}

/// Drop latches and push the pages back onto the file's freelist.
fn release_pages(pool: &Arc<BufferPool>, pages: Vec<Latched>) {
    for latched in pages {
        let pid = latched.handle.page_id();
        drop(latched);
        if let Err(err) = pool.delete_page(pid) {
            debug!("failed to release pre-allocated page {pid}: {err}");
        }
    }
}

#[derive(Debug)]
pub struct BTreeIndex {
    pool: Arc<BufferPool>,
    fid: FileId,
    table_fid: FileId,
    unique: bool,
    order: SortOrder,
    root: RwLock<PageNum>,
}

impl BTreeIndex {
    pub fn new(
        pool: Arc<BufferPool>,
        fid: FileId,
        table_fid: FileId,
        unique: bool,
        order: SortOrder,
        root_page_num: PageNum,
    ) -> BTreeIndex {
        BTreeIndex {
            pool,
            fid,
            table_fid,
            unique,
            order,
            root: RwLock::new(root_page_num),
        }
    }

    pub fn fid(&self) -> FileId {
        self.fid
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn sort_order(&self) -> &SortOrder {
        &self.order
    }

    /// Current root page number; the catalog persists changes to it.
    pub fn root_page_num(&self) -> PageNum {
        *self.root.read()
    }

    fn usable(&self) -> usize {
        self.pool.page_size() - BTREE_HEADER_SIZE - LEAF_SLOT_SIZE
    }

    /// Upper bound on any stored cell, from the `check_key` guard.
    /// Separators are stored keys, so an internal page with this much
    /// room can absorb whatever a split below promotes.
    fn max_cell_len(&self) -> usize {
        (self.usable() / 3).saturating_sub(16)
    }

    fn check_key(&self, cell: &IndexCell) -> Result<()> {
        if (cell.len() + 16) * 3 > self.usable() {
            return Err(NileDbError::InvalidArg(format!(
                "index key of {} bytes cannot fit three-per-page",
                cell.len()
            )));
        }
        Ok(())
    }

    /// Insert `cell -> rid`. An exact duplicate of a stored cell is
    /// rejected; unique indexes store the column fields alone, so a
    /// second row with the same fields collides here.
    pub fn insert(&self, cell: &IndexCell, rid: RecordId) -> Result<()> {
        self.check_key(cell)?;
        let value = (rid.page_id.page_num, rid.slot);
        let mut root_guard = Some(self.root.write());

        let root_pnum = **root_guard.as_ref().expect("root lock held");
        if root_pnum == INVALID_PAGE_NUM {
            let mut leaf = Latched::create(&self.pool, self.fid)?;
            let pnum = leaf.pnum();
            let mut page = leaf.page();
            page.init_leaf(pnum);
            page.insert_leaf_at(0, cell.bytes(), value)?;
            **root_guard.as_mut().expect("root lock held") = pnum;
            return Ok(());
        }

        let mut stack = vec![Latched::acquire(&self.pool, PageId::new(self.fid, root_pnum))?];
        loop {
            let child_pnum = {
                let view = stack.last().expect("descent stack").view()?;
                if view.is_leaf() {
                    break;
                }
                let idx = view.route(cell.bytes(), &self.order)?;
                view.child_at(idx)?
            };
            let child = Latched::acquire(&self.pool, PageId::new(self.fid, child_pnum))?;
            let child_safe = {
                let view = child.view()?;
                if view.is_leaf() {
                    view.free_space() >= LEAF_SLOT_SIZE + cell.len()
                } else {
                    // An internal page must be able to absorb any
                    // separator a split below could promote, not just
                    // this cell.
                    view.free_space() >= INTERNAL_SLOT_SIZE + self.max_cell_len()
                }
            };
            if child_safe {
                // Crabbing: everything above a safe child can go.
                stack.clear();
                root_guard = None;
            }
            stack.push(child);
        }

        let (at, exact, fits) = {
            let view = stack.last().expect("descent stack").view()?;
            let (at, exact) = view.leaf_lower_bound(cell.bytes(), &self.order)?;
            let fits = view.free_space() >= LEAF_SLOT_SIZE + cell.len();
            (at, exact, fits)
        };
        if exact {
            return Err(NileDbError::DuplicateKey(format!(
                "cell already present in index file {}",
                self.fid
            )));
        }
        if fits {
            let leaf = stack.last_mut().expect("descent stack");
            return leaf.page().insert_leaf_at(at, cell.bytes(), value);
        }
        self.split_and_insert(stack, &mut root_guard, cell, value, at)
    }

    fn split_and_insert(
        &self,
        mut stack: Vec<Latched>,
        root_guard: &mut Option<RwLockWriteGuard<'_, PageNum>>,
        cell: &IndexCell,
        value: (PageNum, u32),
        at: u32,
    ) -> Result<()> {
        let page_size = self.pool.page_size();

        // Crabbing left only the chain of full ancestors on the stack;
        // every level splits, plus one page when the chain tops out at
        // the root. Allocate the whole batch up front so an allocation
        // failure leaves the tree untouched.
        let need = stack.len() + usize::from(root_guard.is_some());
        let mut fresh: Vec<Latched> = Vec::with_capacity(need);
        for _ in 0..need {
            match Latched::create(&self.pool, self.fid) {
                Ok(latched) => fresh.push(latched),
                Err(err) => {
                    release_pages(&self.pool, fresh);
                    return Err(err);
                }
            }
        }
        debug!("splitting {} levels of index file {}", stack.len(), self.fid);

        // Leaf level.
        let mut leaf = stack.pop().expect("split of an empty stack");
        let leaf_pnum = leaf.pnum();
        let (leaf_parent, leaf_next) = {
            let view = leaf.view()?;
            (view.parent_page_num(), view.next_leaf_num())
        };
        let mut entries = leaf_entries(leaf.view()?)?;
        entries.insert(at as usize, (cell.bytes().to_vec(), value));
        let mut right = fresh.pop().expect("pre-allocated split page");
        let right_pnum = right.pnum();
        let split = leaf_split_point(&entries, page_size)?;
        build_leaf(&mut right.guard, right_pnum, leaf_parent, leaf_next, &entries[split..])?;
        build_leaf(&mut leaf.guard, leaf_pnum, leaf_parent, right_pnum, &entries[..split])?;
        let mut carry: Option<SepEntry> = Some((entries[split].0.clone(), right_pnum));
        let mut left_pnum = leaf_pnum;
        // Child-level latches go before the parent is touched; the
        // parent (or the root lock) still fences off every other
        // traversal.
        drop(leaf);
        drop(right);

        while let Some((sep, right_child)) = carry.take() {
            let Some(mut parent) = stack.pop() else {
                // Ran off the top of the stack: grow a new root.
                let guard = root_guard
                    .as_mut()
                    .expect("root split without the root lock");
                let mut new_root = fresh.pop().expect("pre-allocated root page");
                let new_root_pnum = new_root.pnum();
                build_internal(
                    &mut new_root.guard,
                    new_root_pnum,
                    INVALID_PAGE_NUM,
                    left_pnum,
                    &[(sep, right_child)],
                )?;
                drop(new_root);
                self.set_parent(left_pnum, new_root_pnum)?;
                self.set_parent(right_child, new_root_pnum)?;
                **guard = new_root_pnum;
                break;
            };

            let pos = parent.view()?.route(&sep, &self.order)? + 1;
            let fits = {
                let view = parent.view()?;
                view.free_space() >= INTERNAL_SLOT_SIZE + sep.len()
            };
            if fits {
                parent.page().insert_internal_at(pos, &sep, right_child)?;
                break;
            }

            // The parent splits too.
            let parent_pnum = parent.pnum();
            let parent_parent = parent.view()?.parent_page_num();
            let (first_child, mut seps) = internal_entries(parent.view()?)?;
            seps.insert(pos as usize - 1, (sep, right_child));
            let mut new_right = fresh.pop().expect("pre-allocated split page");
            let new_right_pnum = new_right.pnum();
            let promote = internal_split_point(&seps, page_size)?;
            let promoted = seps[promote].0.clone();
            let right_first = seps[promote].1;
            build_internal(
                &mut new_right.guard,
                new_right_pnum,
                parent_parent,
                right_first,
                &seps[promote + 1..],
            )?;
            build_internal(
                &mut parent.guard,
                parent_pnum,
                parent_parent,
                first_child,
                &seps[..promote],
            )?;
            drop(parent);
            drop(new_right);
            self.set_parent(right_first, new_right_pnum)?;
            for (_, child) in &seps[promote + 1..] {
                self.set_parent(*child, new_right_pnum)?;
            }
            carry = Some((promoted, new_right_pnum));
            left_pnum = parent_pnum;
        }

        release_pages(&self.pool, fresh);
        Ok(())
    }

    /// Remove the exact cell. `NotFound` when it is not stored.
    pub fn remove(&self, cell: &IndexCell) -> Result<()> {
        let mut root_guard = Some(self.root.write());
        let root_pnum = **root_guard.as_ref().expect("root lock held");
        if root_pnum == INVALID_PAGE_NUM {
            return Err(NileDbError::NotFound("index is empty".into()));
        }

        let mut stack = vec![Latched::acquire(&self.pool, PageId::new(self.fid, root_pnum))?];
        loop {
            let child_pnum = {
                let view = stack.last().expect("descent stack").view()?;
                if view.is_leaf() {
                    break;
                }
                let idx = view.route(cell.bytes(), &self.order)?;
                view.child_at(idx)?
            };
            let child = Latched::acquire(&self.pool, PageId::new(self.fid, child_pnum))?;
            let child_safe = {
                let view = child.view()?;
                // Estimate the entry the child could lose; staying
                // above the fill threshold afterwards makes every
                // ancestor releasable.
                let entry = view.slot_size() + cell.len();
                view.used_space().saturating_sub(entry) >= view.free_space() + entry
            };
            if child_safe {
                stack.clear();
                root_guard = None;
            }
            stack.push(child);
        }

        let bottom_is_root = root_guard.is_some();
        {
            let leaf = stack.last_mut().expect("descent stack");
            let (at, exact) = leaf.view()?.leaf_lower_bound(cell.bytes(), &self.order)?;
            if !exact {
                return Err(NileDbError::NotFound(format!(
                    "cell not present in index file {}",
                    self.fid
                )));
            }
            leaf.page().remove_at(at)?;
        }
        {
            let is_root_leaf = stack.len() == 1 && bottom_is_root;
            let too_short = stack
                .last()
                .expect("descent stack")
                .view()?
                .too_short(is_root_leaf);
            // The root leaf never merges; an under-full non-root page
            // with no latched parent was deemed safe and cannot be
            // here.
            if !too_short || stack.len() == 1 {
                return Ok(());
            }
        }

        // Walk the under-full page up against its siblings.
        let mut cur = stack.pop().expect("descent stack");
        while let Some(mut parent) = stack.pop() {
            let parent_lost_entry = self.rebalance(&mut parent, cur)?;
            if !parent_lost_entry {
                break;
            }
            let parent_is_root = stack.is_empty() && bottom_is_root;
            if parent_is_root {
                let view = parent.view()?;
                if !view.is_leaf() && view.slot_count() == 1 {
                    // Promote the only child to root and free the old
                    // root page.
                    let new_root = view.child_at(0)?;
                    let old_root = parent.pnum();
                    drop(parent);
                    self.set_parent(new_root, INVALID_PAGE_NUM)?;
                    self.pool.delete_page(PageId::new(self.fid, old_root))?;
                    **root_guard.as_mut().expect("root lock held") = new_root;
                    debug!("index file {} root collapsed to page {new_root}", self.fid);
                }
                break;
            }
            if !parent.view()?.too_short(false) {
                break;
            }
            cur = parent;
        }
        Ok(())
    }

    /// Resolve one under-full page against its siblings. Returns true
    /// when the parent lost an entry (a merge happened); `cur` is
    /// consumed and a merged-away page is deallocated.
    fn rebalance(&self, parent: &mut Latched, cur: Latched) -> Result<bool> {
        let cur_pnum = cur.pnum();
        let (child_idx, child_count) = {
            let view = parent.view()?;
            let n = view.slot_count();
            let mut found = None;
            for idx in 0..n {
                if view.child_at(idx)? == cur_pnum {
                    found = Some(idx);
                    break;
                }
            }
            let Some(idx) = found else {
                return Err(StorageError(format!(
                    "page {cur_pnum} is not a child of page {}",
                    parent.pnum()
                ))
                .into());
            };
            (idx, n)
        };

        // Siblings share the parent by construction. Latch left before
        // right, both under the parent's exclusive latch.
        let mut left = if child_idx > 0 {
            let pnum = parent.view()?.child_at(child_idx - 1)?;
            Some(Latched::acquire(&self.pool, PageId::new(self.fid, pnum))?)
        } else {
            None
        };
        let mut right = if child_idx + 1 < child_count {
            let pnum = parent.view()?.child_at(child_idx + 1)?;
            Some(Latched::acquire(&self.pool, PageId::new(self.fid, pnum))?)
        } else {
            None
        };

        let is_leaf = cur.view()?.is_leaf();
        let mut cur = cur;

        if let Some(left) = left.as_mut() {
            if self.redistribute_from_left(parent, left, &mut cur, child_idx, is_leaf)? {
                return Ok(false);
            }
        }
        if let Some(right) = right.as_mut() {
            if self.redistribute_from_right(parent, &mut cur, right, child_idx, is_leaf)? {
                return Ok(false);
            }
        }
        if let Some(mut left) = left.take() {
            match self.try_merge_into(parent, &mut left, cur, child_idx, is_leaf)? {
                None => return Ok(true),
                Some(given_back) => cur = given_back,
            }
        }
        if let Some(right) = right.take() {
            if self
                .try_merge_into(parent, &mut cur, right, child_idx + 1, is_leaf)?
                .is_none()
            {
                return Ok(true);
            }
        }
        // No sibling had slack and neither merge fits; the page stays
        // under-full, which costs space but not correctness.
        Ok(false)
    }

    /// Move the left sibling's last entry into `cur` and lift the
    /// moved key into the parent's separator slot.
    fn redistribute_from_left(
        &self,
        parent: &mut Latched,
        left: &mut Latched,
        cur: &mut Latched,
        child_idx: u32,
        is_leaf: bool,
    ) -> Result<bool> {
        if is_leaf {
            let (n, key, rid) = {
                let view = left.view()?;
                let n = view.slot_count();
                if n < 2 {
                    return Ok(false);
                }
                (n, view.key_at(n - 1)?.to_vec(), view.leaf_rid_at(n - 1)?)
            };
            let entry = LEAF_SLOT_SIZE + key.len();
            let slack = {
                let view = left.view()?;
                view.used_space().saturating_sub(entry) >= view.free_space() + entry
            };
            let fits = cur.view()?.free_space() >= entry;
            if !slack || !fits || !parent.page().can_replace_sep(child_idx, key.len()) {
                return Ok(false);
            }
            left.page().remove_at(n - 1)?;
            cur.page().insert_leaf_at(0, &key, rid)?;
            parent.page().replace_sep_key(child_idx, &key)?;
            return Ok(true);
        }

        let (left_fc, left_seps) = internal_entries(left.view()?)?;
        if left_seps.len() < 2 {
            return Ok(false);
        }
        let (moved_key, moved_child) = left_seps.last().expect("nonempty separators").clone();
        let sep_down = parent.view()?.key_at(child_idx)?.to_vec();
        let gained = INTERNAL_SLOT_SIZE + sep_down.len();
        let lost = INTERNAL_SLOT_SIZE + moved_key.len();
        let slack = {
            let view = left.view()?;
            view.used_space().saturating_sub(lost) >= view.free_space() + lost
        };
        let fits = cur.view()?.free_space() >= gained;
        if !slack || !fits || !parent.page().can_replace_sep(child_idx, moved_key.len()) {
            return Ok(false);
        }

        let left_pnum = left.pnum();
        let left_parent = left.view()?.parent_page_num();
        build_internal(
            &mut left.guard,
            left_pnum,
            left_parent,
            left_fc,
            &left_seps[..left_seps.len() - 1],
        )?;

        let cur_pnum = cur.pnum();
        let cur_parent = cur.view()?.parent_page_num();
        let (cur_fc, cur_seps) = internal_entries(cur.view()?)?;
        let mut seps = Vec::with_capacity(cur_seps.len() + 1);
        seps.push((sep_down, cur_fc));
        seps.extend(cur_seps);
        build_internal(&mut cur.guard, cur_pnum, cur_parent, moved_child, &seps)?;
        self.set_parent(moved_child, cur_pnum)?;
        parent.page().replace_sep_key(child_idx, &moved_key)?;
        Ok(true)
    }

    /// Move the right sibling's first entry into `cur` and lift the
    /// right sibling's new first key into the parent.
    fn redistribute_from_right(
        &self,
        parent: &mut Latched,
        cur: &mut Latched,
        right: &mut Latched,
        child_idx: u32,
        is_leaf: bool,
    ) -> Result<bool> {
        let sep_idx = child_idx + 1;
        if is_leaf {
            let (key, rid, next_first) = {
                let view = right.view()?;
                if view.slot_count() < 2 {
                    return Ok(false);
                }
                (
                    view.key_at(0)?.to_vec(),
                    view.leaf_rid_at(0)?,
                    view.key_at(1)?.to_vec(),
                )
            };
            let entry = LEAF_SLOT_SIZE + key.len();
            let slack = {
                let view = right.view()?;
                view.used_space().saturating_sub(entry) >= view.free_space() + entry
            };
            let fits = cur.view()?.free_space() >= entry;
            if !slack || !fits || !parent.page().can_replace_sep(sep_idx, next_first.len()) {
                return Ok(false);
            }
            let end = cur.view()?.slot_count();
            cur.page().insert_leaf_at(end, &key, rid)?;
            right.page().remove_at(0)?;
            parent.page().replace_sep_key(sep_idx, &next_first)?;
            return Ok(true);
        }

        let (right_fc, right_seps) = internal_entries(right.view()?)?;
        if right_seps.len() < 2 {
            return Ok(false);
        }
        let sep_down = parent.view()?.key_at(sep_idx)?.to_vec();
        let moved_up = right_seps[0].0.clone();
        let gained = INTERNAL_SLOT_SIZE + sep_down.len();
        let lost = INTERNAL_SLOT_SIZE + moved_up.len();
        let slack = {
            let view = right.view()?;
            view.used_space().saturating_sub(lost) >= view.free_space() + lost
        };
        let fits = cur.view()?.free_space() >= gained;
        if !slack || !fits || !parent.page().can_replace_sep(sep_idx, moved_up.len()) {
            return Ok(false);
        }

        let end = cur.view()?.slot_count();
        let cur_pnum = cur.pnum();
        cur.page().insert_internal_at(end, &sep_down, right_fc)?;
        let right_pnum = right.pnum();
        let right_parent = right.view()?.parent_page_num();
        build_internal(
            &mut right.guard,
            right_pnum,
            right_parent,
            right_seps[0].1,
            &right_seps[1..],
        )?;
        self.set_parent(right_fc, cur_pnum)?;
        parent.page().replace_sep_key(sep_idx, &moved_up)?;
        Ok(true)
    }

    /// Fold `src` (immediately right of `dst`) into `dst` when the
    /// combined contents fit, removing `src`'s entry from the parent
    /// and freeing its page. Gives `src` back untouched otherwise.
    fn try_merge_into(
        &self,
        parent: &mut Latched,
        dst: &mut Latched,
        src: Latched,
        src_idx: u32,
        is_leaf: bool,
    ) -> Result<Option<Latched>> {
        let fits = if is_leaf {
            dst.view()?.free_space() >= src.view()?.entries_size()
        } else {
            let sep_len = parent.view()?.key_at(src_idx)?.len();
            dst.view()?.free_space()
                >= src.view()?.entries_size() + INTERNAL_SLOT_SIZE + sep_len
        };
        if !fits {
            return Ok(Some(src));
        }

        let dst_pnum = dst.pnum();
        let src_pnum = src.pnum();
        let dst_parent = dst.view()?.parent_page_num();
        if is_leaf {
            let mut entries: Vec<LeafEntry> = leaf_entries(dst.view()?)?;
            entries.extend(leaf_entries(src.view()?)?);
            let src_next = src.view()?.next_leaf_num();
            build_leaf(&mut dst.guard, dst_pnum, dst_parent, src_next, &entries)?;
        } else {
            let sep = parent.view()?.key_at(src_idx)?.to_vec();
            let (dst_fc, mut seps) = internal_entries(dst.view()?)?;
            let (src_fc, src_seps) = internal_entries(src.view()?)?;
            seps.push((sep, src_fc));
            seps.extend(src_seps.iter().cloned());
            build_internal(&mut dst.guard, dst_pnum, dst_parent, dst_fc, &seps)?;
            self.set_parent(src_fc, dst_pnum)?;
            for (_, child) in &src_seps {
                self.set_parent(*child, dst_pnum)?;
            }
        }
        drop(src);
        self.pool.delete_page(PageId::new(self.fid, src_pnum))?;
        parent.page().remove_at(src_idx)?;
        Ok(None)
    }

    /// Range scan from the first cell >= `cell`.
    pub fn seek(&self, cell: &IndexCell) -> Result<IndexIter> {
        self.descend_to_leaf(Some(cell))
    }

    /// Full scan from the leftmost leaf.
    pub fn scan(&self) -> Result<IndexIter> {
        self.descend_to_leaf(None)
    }

    fn descend_to_leaf(&self, cell: Option<&IndexCell>) -> Result<IndexIter> {
        let root_guard = self.root.read();
        let root_pnum = *root_guard;
        if root_pnum == INVALID_PAGE_NUM {
            return Ok(IndexIter::empty(self.pool.clone(), self.table_fid));
        }
        let mut handle = self.pool.fetch_page(PageId::new(self.fid, root_pnum))?;
        let mut guard = handle.read();
        drop(root_guard);

        loop {
            let view = BTreePage::open(&guard)?;
            if view.is_leaf() {
                break;
            }
            let child_pnum = match cell {
                Some(cell) => view.child_at(view.route(cell.bytes(), &self.order)?)?,
                None => view.child_at(0)?,
            };
            let child_handle = self.pool.fetch_page(PageId::new(self.fid, child_pnum))?;
            let child_guard = child_handle.read();
            // Crab downward: the child latch is held before the parent
            // latch drops.
            drop(guard);
            handle = child_handle;
            guard = child_guard;
        }

        let view = BTreePage::open(&guard)?;
        let start = match cell {
            Some(cell) => view.leaf_lower_bound(cell.bytes(), &self.order)?.0,
            None => 0,
        };
        let slot_count = view.slot_count();
        let next_leaf = view.next_leaf_num();
        drop(guard);
        Ok(IndexIter::new(
            self.pool.clone(),
            self.table_fid,
            Some(handle),
            slot_count,
            next_leaf,
            start,
        ))
    }

    fn set_parent(&self, page_num: PageNum, parent: PageNum) -> Result<()> {
        let page = self.pool.fetch_page(PageId::new(self.fid, page_num))?;
        let mut guard = page.write();
        BTreePageMut::new(&mut guard).set_parent_page_num(parent);
        Ok(())
    }
}

fn leaf_fits(entries: &[LeafEntry], page_size: usize) -> bool {
    let bytes: usize = entries.iter().map(|(k, _)| LEAF_SLOT_SIZE + k.len()).sum();
    BTREE_HEADER_SIZE + bytes <= page_size
}

fn internal_fits(seps: &[SepEntry], page_size: usize) -> bool {
    let bytes: usize = seps.iter().map(|(k, _)| INTERNAL_SLOT_SIZE + k.len()).sum();
    BTREE_HEADER_SIZE + INTERNAL_SLOT_SIZE + bytes <= page_size
}

/// Split index for a leaf: aim for ceil(n/2), walking outward until
/// both halves fit their pages.
fn leaf_split_point(entries: &[LeafEntry], page_size: usize) -> Result<usize> {
    let total = entries.len();
    let mid = (total + 1) / 2;
    for delta in 0..total {
        for candidate in [mid.saturating_sub(delta), mid + delta] {
            if candidate >= 1
                && candidate < total
                && leaf_fits(&entries[..candidate], page_size)
                && leaf_fits(&entries[candidate..], page_size)
            {
                return Ok(candidate);
            }
        }
    }
    Err(StorageError("leaf split impossible (key too large?)".into()).into())
}

/// Index of the separator to promote when an internal page splits.
fn internal_split_point(seps: &[SepEntry], page_size: usize) -> Result<usize> {
    let total = seps.len();
    let mid = total / 2;
    for delta in 0..total {
        for candidate in [mid.saturating_sub(delta), mid + delta] {
            if candidate < total
                && internal_fits(&seps[..candidate], page_size)
                && internal_fits(&seps[candidate + 1..], page_size)
            {
                return Ok(candidate);
            }
        }
    }
    Err(StorageError("internal split impossible (key too large?)".into()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::Value;
    use crate::storage::disk::registry::FileRegistry;
    use crate::storage::disk::DiskManager;
    use tempfile::tempdir;

    const PAGE: usize = 128;

    fn index(dir: &std::path::Path, unique: bool) -> BTreeIndex {
        let registry = Arc::new(FileRegistry::new());
        let fid = registry.register(dir.join("i.ndb")).unwrap();
        let disk = DiskManager::new(registry, PAGE);
        let pool = BufferPool::new(disk, 32, 2);
        BTreeIndex::new(pool, fid, 99, unique, SortOrder::ascending(), INVALID_PAGE_NUM)
    }

    fn cell(i: i32) -> IndexCell {
        IndexCell::from_values(&[Value::Int(i)]).unwrap()
    }

    fn rid(i: i32) -> RecordId {
        RecordId::new(PageId::new(99, 1), i as u32)
    }

    fn scanned(idx: &BTreeIndex) -> Vec<i32> {
        idx.scan()
            .unwrap()
            .map(|entry| {
                let (cell, _) = entry.unwrap();
                match cell.decode().unwrap().as_slice() {
                    [Value::Int(v)] => *v,
                    other => panic!("unexpected cell {other:?}"),
                }
            })
            .collect()
    }

    #[test]
    fn split_cascade_keeps_scans_sorted() {
        let tmp = tempdir().unwrap();
        let idx = index(tmp.path(), true);

        let keys = [10, 20, 5, 30, 25, 15, 1, 40, 35, 22];
        let mut sorted: Vec<i32> = Vec::new();
        for (i, k) in keys.iter().enumerate() {
            idx.insert(&cell(*k), rid(i as i32)).unwrap();
            sorted.push(*k);
            sorted.sort();
            assert_eq!(scanned(&idx), sorted, "after inserting {k}");
        }
        // With 128-byte pages the root must have split.
        assert_ne!(idx.root_page_num(), INVALID_PAGE_NUM);
    }

    #[test]
    fn bulk_insert_and_full_scan() {
        let tmp = tempdir().unwrap();
        let idx = index(tmp.path(), true);

        use rand::seq::SliceRandom;
        let mut keys: Vec<i32> = (0..200).collect();
        keys.shuffle(&mut rand::thread_rng());
        for k in &keys {
            idx.insert(&cell(*k), rid(*k)).unwrap();
        }
        assert_eq!(scanned(&idx), (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn duplicate_keys_are_rejected_when_unique() {
        let tmp = tempdir().unwrap();
        let idx = index(tmp.path(), true);
        idx.insert(&cell(7), rid(0)).unwrap();
        let err = idx.insert(&cell(7), rid(1)).unwrap_err();
        assert!(matches!(err, NileDbError::DuplicateKey(_)));
    }

    #[test]
    fn record_id_suffix_permits_duplicates() {
        let tmp = tempdir().unwrap();
        let idx = index(tmp.path(), false);
        for slot in 0..5 {
            let cell = IndexCell::from_values_with_rid(&[Value::Int(7)], rid(slot)).unwrap();
            idx.insert(&cell, rid(slot)).unwrap();
        }
        let hits: Vec<RecordId> = idx
            .scan()
            .unwrap()
            .map(|entry| entry.unwrap().1)
            .collect();
        assert_eq!(hits.len(), 5);
        assert_eq!(hits, (0..5).map(rid).collect::<Vec<_>>());
    }

    #[test]
    fn seek_starts_at_the_lower_bound() {
        let tmp = tempdir().unwrap();
        let idx = index(tmp.path(), true);
        for k in [10, 20, 30, 40, 50] {
            idx.insert(&cell(k), rid(k)).unwrap();
        }
        let from_25: Vec<i32> = idx
            .seek(&cell(25))
            .unwrap()
            .map(|entry| match entry.unwrap().0.decode().unwrap().as_slice() {
                [Value::Int(v)] => *v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(from_25, vec![30, 40, 50]);

        let from_30: Vec<i32> = idx
            .seek(&cell(30))
            .unwrap()
            .map(|entry| match entry.unwrap().0.decode().unwrap().as_slice() {
                [Value::Int(v)] => *v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(from_30, vec![30, 40, 50]);
    }

    #[test]
    fn delete_with_merges_keeps_the_rest_reachable() {
        let tmp = tempdir().unwrap();
        let idx = index(tmp.path(), true);

        let keys = [10, 20, 5, 30, 25, 15, 1, 40, 35, 22];
        for (i, k) in keys.iter().enumerate() {
            idx.insert(&cell(*k), rid(i as i32)).unwrap();
        }
        let mut remaining: Vec<i32> = keys.to_vec();
        remaining.sort();
        for k in [10, 15, 20, 22, 25] {
            idx.remove(&cell(k)).unwrap();
            remaining.retain(|&x| x != k);
            assert_eq!(scanned(&idx), remaining, "after deleting {k}");
            let gone: Vec<i32> = idx
                .seek(&cell(k))
                .unwrap()
                .take(1)
                .map(|e| match e.unwrap().0.decode().unwrap().as_slice() {
                    [Value::Int(v)] => *v,
                    _ => unreachable!(),
                })
                .collect();
            assert_ne!(gone.first(), Some(&k), "seek of deleted {k} found it");
        }
    }

    #[test]
    fn drain_collapses_back_to_a_leaf_root() {
        let tmp = tempdir().unwrap();
        let idx = index(tmp.path(), true);
        for k in 0..60 {
            idx.insert(&cell(k), rid(k)).unwrap();
        }
        for k in 0..60 {
            idx.remove(&cell(k)).unwrap();
        }
        assert_eq!(scanned(&idx), Vec::<i32>::new());
        let err = idx.remove(&cell(3)).unwrap_err();
        assert!(matches!(err, NileDbError::NotFound(_)));
    }

    #[test]
    fn oversized_keys_are_rejected() {
        let tmp = tempdir().unwrap();
        let idx = index(tmp.path(), true);
        let big = IndexCell::from_values(&[Value::Varchar("x".repeat(60))]).unwrap();
        let err = idx.insert(&big, rid(0)).unwrap_err();
        assert!(matches!(err, NileDbError::InvalidArg(_)));
    }
}
