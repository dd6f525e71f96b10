//! B+Tree pages. Leaves and internals share one header:
//!
//!   0: page type tag (u8) - '1' leaf, '2' internal
//!   1: page number (i32)
//!   5: parent page number (i32, -1 for the root)
//!   9: next leaf page number (i32; undefined on internals)
//!  13: free-space offset (u32) - key payloads grow down from the
//!      page end
//!  17: slot count (u32)
//!  21: slot directory
//!
//! A slot is (key-offset u16, key-size u16) followed by the value:
//! a RecordId (page-num i32 + slot u32) on leaves, a child page
//! number (i32) on internals. Internal slot 0 carries the leftmost
//! child pointer only and has no key.

use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use crate::core::errors::{NileDbError, Result, StorageError};
use crate::storage::page::{PageNum, INVALID_PAGE_NUM};

use super::key::{cmp_cells, SortOrder};

pub const BTREE_HEADER_SIZE: usize = 21;
pub const LEAF_SLOT_SIZE: usize = 12;
pub const INTERNAL_SLOT_SIZE: usize = 8;

const TAG_LEAF: u8 = b'1';
const TAG_INTERNAL: u8 = b'2';

const TYPE_OFFSET: usize = 0;
const PAGE_NUM_OFFSET: usize = 1;
const PARENT_OFFSET: usize = 5;
const NEXT_LEAF_OFFSET: usize = 9;
const FREE_SPACE_OFFSET: usize = 13;
const SLOT_COUNT_OFFSET: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Leaf,
    Internal,
}

/// Read-only view over a tree page.
#[derive(Debug, Clone, Copy)]
pub struct BTreePage<'a> {
    buf: &'a [u8],
}

impl<'a> BTreePage<'a> {
    pub fn open(buf: &'a [u8]) -> Result<BTreePage<'a>> {
        let page = BTreePage { buf };
        page.validate()?;
        Ok(page)
    }

    fn validate(&self) -> Result<()> {
        if self.buf.len() < BTREE_HEADER_SIZE {
            return Err(StorageError("tree page buffer too small".into()).into());
        }
        match self.buf[TYPE_OFFSET] {
            TAG_LEAF | TAG_INTERNAL => {}
            tag => {
                return Err(StorageError(format!("unknown tree page tag {tag:#x}")).into());
            }
        }
        let fso = self.free_space_offset() as usize;
        if self.slots_end() > fso || fso > self.buf.len() {
            return Err(StorageError(format!(
                "tree page free-space offset {fso} out of range"
            ))
            .into());
        }
        Ok(())
    }

    pub fn kind(&self) -> PageKind {
        if self.buf[TYPE_OFFSET] == TAG_LEAF {
            PageKind::Leaf
        } else {
            PageKind::Internal
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.kind() == PageKind::Leaf
    }

    pub fn page_num(&self) -> PageNum {
        LittleEndian::read_i32(&self.buf[PAGE_NUM_OFFSET..])
    }

    pub fn parent_page_num(&self) -> PageNum {
        LittleEndian::read_i32(&self.buf[PARENT_OFFSET..])
    }

    pub fn next_leaf_num(&self) -> PageNum {
        LittleEndian::read_i32(&self.buf[NEXT_LEAF_OFFSET..])
    }

    pub fn free_space_offset(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[FREE_SPACE_OFFSET..])
    }

    pub fn slot_count(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[SLOT_COUNT_OFFSET..])
    }

    pub fn slot_size(&self) -> usize {
        match self.kind() {
            PageKind::Leaf => LEAF_SLOT_SIZE,
            PageKind::Internal => INTERNAL_SLOT_SIZE,
        }
    }

    fn slot_base(&self, idx: u32) -> usize {
        BTREE_HEADER_SIZE + idx as usize * self.slot_size()
    }

    fn slots_end(&self) -> usize {
        self.slot_base(self.slot_count())
    }

    pub fn free_space(&self) -> usize {
        (self.free_space_offset() as usize).saturating_sub(self.slots_end())
    }

    pub fn used_space(&self) -> usize {
        self.buf.len() - self.free_space()
    }

    /// Bytes consumed by slots and key payloads, header excluded.
    pub fn entries_size(&self) -> usize {
        self.used_space() - BTREE_HEADER_SIZE
    }

    fn check_idx(&self, idx: u32) -> Result<()> {
        if idx >= self.slot_count() {
            return Err(NileDbError::InvalidArg(format!(
                "tree slot {idx} out of bounds (count {})",
                self.slot_count()
            )));
        }
        Ok(())
    }

    /// Key bytes of a slot; internal slot 0 yields the empty key.
    pub fn key_at(&self, idx: u32) -> Result<&'a [u8]> {
        self.check_idx(idx)?;
        let base = self.slot_base(idx);
        let off = LittleEndian::read_u16(&self.buf[base..]) as usize;
        let size = LittleEndian::read_u16(&self.buf[base + 2..]) as usize;
        if size == 0 {
            return Ok(&[]);
        }
        if off < self.free_space_offset() as usize || off + size > self.buf.len() {
            return Err(StorageError(format!(
                "tree slot {idx} key range {off}+{size} out of bounds"
            ))
            .into());
        }
        Ok(&self.buf[off..off + size])
    }

    pub fn leaf_rid_at(&self, idx: u32) -> Result<(PageNum, u32)> {
        debug_assert!(self.is_leaf());
        self.check_idx(idx)?;
        let base = self.slot_base(idx) + 4;
        Ok((
            LittleEndian::read_i32(&self.buf[base..]),
            LittleEndian::read_u32(&self.buf[base + 4..]),
        ))
    }

    pub fn child_at(&self, idx: u32) -> Result<PageNum> {
        debug_assert!(!self.is_leaf());
        self.check_idx(idx)?;
        let base = self.slot_base(idx) + 4;
        Ok(LittleEndian::read_i32(&self.buf[base..]))
    }

    /// A page is too short when its free space exceeds its used space;
    /// the root is special-cased to a minimum slot count.
    pub fn too_short(&self, is_root: bool) -> bool {
        if is_root {
            return self.slot_count() <= 1;
        }
        self.free_space() > self.used_space()
    }

    /// First leaf slot whose key is >= `cell`, and whether it is an
    /// exact match.
    pub fn leaf_lower_bound(&self, cell: &[u8], order: &SortOrder) -> Result<(u32, bool)> {
        debug_assert!(self.is_leaf());
        let n = self.slot_count();
        let mut lo = 0;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if cmp_cells(self.key_at(mid)?, cell, order) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let exact = lo < n && cmp_cells(self.key_at(lo)?, cell, order) == Ordering::Equal;
        Ok((lo, exact))
    }

    /// Child slot to descend into: the child under the greatest
    /// separator <= `cell` (slot 0 when every separator is greater).
    pub fn route(&self, cell: &[u8], order: &SortOrder) -> Result<u32> {
        debug_assert!(!self.is_leaf());
        let n = self.slot_count();
        let mut lo = 1;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if cmp_cells(self.key_at(mid)?, cell, order) == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo - 1)
    }
}

/// Mutable view.
#[derive(Debug)]
pub struct BTreePageMut<'a> {
    buf: &'a mut [u8],
}

impl<'a> BTreePageMut<'a> {
    pub fn new(buf: &'a mut [u8]) -> BTreePageMut<'a> {
        BTreePageMut { buf }
    }

    pub fn as_ref(&self) -> BTreePage<'_> {
        BTreePage { buf: self.buf }
    }

    pub fn init_leaf(&mut self, page_num: PageNum) {
        self.init(TAG_LEAF, page_num);
    }

    pub fn init_internal(&mut self, page_num: PageNum) {
        self.init(TAG_INTERNAL, page_num);
    }

    fn init(&mut self, tag: u8, page_num: PageNum) {
        self.buf.fill(0);
        self.buf[TYPE_OFFSET] = tag;
        LittleEndian::write_i32(&mut self.buf[PAGE_NUM_OFFSET..], page_num);
        LittleEndian::write_i32(&mut self.buf[PARENT_OFFSET..], INVALID_PAGE_NUM);
        LittleEndian::write_i32(&mut self.buf[NEXT_LEAF_OFFSET..], INVALID_PAGE_NUM);
        let len = self.buf.len() as u32;
        LittleEndian::write_u32(&mut self.buf[FREE_SPACE_OFFSET..], len);
    }

    pub fn set_parent_page_num(&mut self, page_num: PageNum) {
        LittleEndian::write_i32(&mut self.buf[PARENT_OFFSET..], page_num);
    }

    pub fn set_next_leaf_num(&mut self, page_num: PageNum) {
        LittleEndian::write_i32(&mut self.buf[NEXT_LEAF_OFFSET..], page_num);
    }

    fn set_slot_count(&mut self, n: u32) {
        LittleEndian::write_u32(&mut self.buf[SLOT_COUNT_OFFSET..], n);
    }

    fn set_free_space_offset(&mut self, fso: u32) {
        LittleEndian::write_u32(&mut self.buf[FREE_SPACE_OFFSET..], fso);
    }

    /// Copy `key` into the payload area, lowering the free-space
    /// offset. The caller has verified it fits.
    fn push_key_payload(&mut self, key: &[u8]) -> u16 {
        let fso = self.as_ref().free_space_offset() as usize - key.len();
        self.buf[fso..fso + key.len()].copy_from_slice(key);
        self.set_free_space_offset(fso as u32);
        fso as u16
    }

    fn write_slot_key(&mut self, idx: u32, off: u16, size: u16) {
        let base = self.as_ref().slot_base(idx);
        LittleEndian::write_u16(&mut self.buf[base..], off);
        LittleEndian::write_u16(&mut self.buf[base + 2..], size);
    }

    pub fn set_leaf_rid_at(&mut self, idx: u32, rid: (PageNum, u32)) {
        let base = self.as_ref().slot_base(idx) + 4;
        LittleEndian::write_i32(&mut self.buf[base..], rid.0);
        LittleEndian::write_u32(&mut self.buf[base + 4..], rid.1);
    }

    pub fn set_child_at(&mut self, idx: u32, child: PageNum) {
        let base = self.as_ref().slot_base(idx) + 4;
        LittleEndian::write_i32(&mut self.buf[base..], child);
    }

    fn shift_slots_right(&mut self, idx: u32) {
        let view = self.as_ref();
        let n = view.slot_count();
        let slot_size = view.slot_size();
        let start = view.slot_base(idx);
        let end = view.slot_base(n);
        if idx < n {
            self.buf.copy_within(start..end, start + slot_size);
        }
        self.set_slot_count(n + 1);
    }

    fn shift_slots_left(&mut self, idx: u32) {
        let view = self.as_ref();
        let n = view.slot_count();
        let slot_size = view.slot_size();
        let start = view.slot_base(idx + 1);
        let end = view.slot_base(n);
        if start < end {
            let dest = view.slot_base(idx);
            self.buf.copy_within(start..end, dest);
        }
        // Zero the vacated tail entry so page bytes stay a pure
        // function of the logical contents.
        self.buf[end - slot_size..end].fill(0);
        self.set_slot_count(n - 1);
    }

    /// Insert a (key, record-id) pair at leaf slot `idx`.
    pub fn insert_leaf_at(&mut self, idx: u32, key: &[u8], rid: (PageNum, u32)) -> Result<()> {
        let view = self.as_ref();
        debug_assert!(view.is_leaf());
        if view.free_space() < LEAF_SLOT_SIZE + key.len() {
            return Err(StorageError(format!(
                "leaf page {} is full",
                view.page_num()
            ))
            .into());
        }
        self.shift_slots_right(idx);
        let off = self.push_key_payload(key);
        self.write_slot_key(idx, off, key.len() as u16);
        self.set_leaf_rid_at(idx, rid);
        Ok(())
    }

    /// Insert a (separator, child) pair at internal slot `idx >= 1`.
    pub fn insert_internal_at(&mut self, idx: u32, key: &[u8], child: PageNum) -> Result<()> {
        let view = self.as_ref();
        debug_assert!(!view.is_leaf());
        debug_assert!(idx >= 1);
        if view.free_space() < INTERNAL_SLOT_SIZE + key.len() {
            return Err(StorageError(format!(
                "internal page {} is full",
                view.page_num()
            ))
            .into());
        }
        self.shift_slots_right(idx);
        let off = self.push_key_payload(key);
        self.write_slot_key(idx, off, key.len() as u16);
        self.set_child_at(idx, child);
        Ok(())
    }

    /// Remove a slot and compact the payload area. Removing internal
    /// slot 0 promotes slot 1's child into the keyless position.
    pub fn remove_at(&mut self, idx: u32) -> Result<()> {
        let view = self.as_ref();
        view.check_idx(idx)?;
        let internal = !view.is_leaf();
        self.shift_slots_left(idx);
        if internal && idx == 0 && self.as_ref().slot_count() > 0 {
            // The promoted first slot keeps only its child pointer.
            self.write_slot_key(0, 0, 0);
        }
        self.compact();
        Ok(())
    }

    /// Whether `replace_sep_key(idx, key)` would succeed.
    pub fn can_replace_sep(&self, idx: u32, key_len: usize) -> bool {
        let view = self.as_ref();
        let old = LittleEndian::read_u16(&self.buf[view.slot_base(idx) + 2..]) as usize;
        view.free_space() + old >= key_len
    }

    /// Replace the separator key of internal slot `idx`, keeping its
    /// child. The caller checks `can_replace_sep` first; the page is
    /// untouched on failure.
    pub fn replace_sep_key(&mut self, idx: u32, key: &[u8]) -> Result<()> {
        let view = self.as_ref();
        debug_assert!(!view.is_leaf());
        view.check_idx(idx)?;
        if !self.can_replace_sep(idx, key.len()) {
            return Err(StorageError(format!(
                "separator of {} bytes does not fit",
                key.len()
            ))
            .into());
        }
        self.write_slot_key(idx, 0, 0);
        self.compact();
        let off = self.push_key_payload(key);
        self.write_slot_key(idx, off, key.len() as u16);
        Ok(())
    }

    /// Rewrite the payload area tightly from the page end, in slot
    /// order. Deterministic: the same logical contents always produce
    /// the same bytes.
    pub fn compact(&mut self) {
        let view = self.as_ref();
        let n = view.slot_count();
        let old_fso = view.free_space_offset() as usize;
        let mut keys: Vec<Vec<u8>> = Vec::with_capacity(n as usize);
        for idx in 0..n {
            let base = view.slot_base(idx);
            let off = LittleEndian::read_u16(&self.buf[base..]) as usize;
            let size = LittleEndian::read_u16(&self.buf[base + 2..]) as usize;
            if size == 0 || off == 0 {
                keys.push(Vec::new());
            } else {
                keys.push(self.buf[off..off + size].to_vec());
            }
        }
        self.buf[old_fso..].fill(0);
        let mut fso = self.buf.len();
        for (idx, key) in keys.iter().enumerate() {
            if key.is_empty() {
                self.write_slot_key(idx as u32, 0, 0);
                continue;
            }
            fso -= key.len();
            self.buf[fso..fso + key.len()].copy_from_slice(key);
            self.write_slot_key(idx as u32, fso as u16, key.len() as u16);
        }
        self.set_free_space_offset(fso as u32);
    }
}

/// Copy a leaf's entries out in slot order.
pub fn leaf_entries(view: BTreePage<'_>) -> Result<Vec<(Vec<u8>, (PageNum, u32))>> {
    let mut out = Vec::with_capacity(view.slot_count() as usize);
    for idx in 0..view.slot_count() {
        out.push((view.key_at(idx)?.to_vec(), view.leaf_rid_at(idx)?));
    }
    Ok(out)
}

/// Copy an internal page's (first child, separators) out in slot
/// order.
pub fn internal_entries(view: BTreePage<'_>) -> Result<(PageNum, Vec<(Vec<u8>, PageNum)>)> {
    if view.slot_count() == 0 {
        return Err(StorageError("internal page with no children".into()).into());
    }
    let first_child = view.child_at(0)?;
    let mut seps = Vec::with_capacity(view.slot_count() as usize - 1);
    for idx in 1..view.slot_count() {
        seps.push((view.key_at(idx)?.to_vec(), view.child_at(idx)?));
    }
    Ok((first_child, seps))
}

/// Rebuild a leaf from scratch with the given entries.
pub fn build_leaf(
    buf: &mut [u8],
    page_num: PageNum,
    parent: PageNum,
    next_leaf: PageNum,
    entries: &[(Vec<u8>, (PageNum, u32))],
) -> Result<()> {
    let mut page = BTreePageMut::new(buf);
    page.init_leaf(page_num);
    page.set_parent_page_num(parent);
    page.set_next_leaf_num(next_leaf);
    for (idx, (key, rid)) in entries.iter().enumerate() {
        page.insert_leaf_at(idx as u32, key, *rid)?;
    }
    Ok(())
}

/// Rebuild an internal page from scratch.
pub fn build_internal(
    buf: &mut [u8],
    page_num: PageNum,
    parent: PageNum,
    first_child: PageNum,
    seps: &[(Vec<u8>, PageNum)],
) -> Result<()> {
    let mut page = BTreePageMut::new(buf);
    page.init_internal(page_num);
    page.set_parent_page_num(parent);
    if page.as_ref().free_space() < INTERNAL_SLOT_SIZE {
        return Err(StorageError("internal page too small".into()).into());
    }
    page.set_slot_count(1);
    page.write_slot_key(0, 0, 0);
    page.set_child_at(0, first_child);
    for (idx, (key, child)) in seps.iter().enumerate() {
        page.insert_internal_at(idx as u32 + 1, key, *child)?;
    }
    Ok(())
}
