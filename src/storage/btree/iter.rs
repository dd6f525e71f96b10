//! Leaf-chain iteration.
//!
//! An iterator pins one leaf at a time and walks the intrusive
//! next-leaf list. It holds no latches between calls; each step takes
//! the page's shared latch only long enough to copy the entry out.

use std::sync::Arc;

use crate::core::errors::Result;
use crate::storage::buffer::{BufferPool, PageHandle};
use crate::storage::page::{FileId, PageId, RecordId, INVALID_PAGE_NUM, PageNum};

use super::key::IndexCell;
use super::page::BTreePage;

#[derive(Debug)]
pub struct IndexIter {
    pool: Arc<BufferPool>,
    table_fid: FileId,
    cur: Option<PageHandle>,
    slot_count: u32,
    next_leaf: PageNum,
    slot: u32,
}

impl IndexIter {
    pub(super) fn new(
        pool: Arc<BufferPool>,
        table_fid: FileId,
        cur: Option<PageHandle>,
        slot_count: u32,
        next_leaf: PageNum,
        slot: u32,
    ) -> IndexIter {
        IndexIter {
            pool,
            table_fid,
            cur,
            slot_count,
            next_leaf,
            slot,
        }
    }

    pub(super) fn empty(pool: Arc<BufferPool>, table_fid: FileId) -> IndexIter {
        IndexIter::new(pool, table_fid, None, 0, INVALID_PAGE_NUM, 0)
    }

    fn load_leaf(&mut self, fid: FileId, page_num: PageNum) -> Result<()> {
        let page = self.pool.fetch_page(PageId::new(fid, page_num))?;
        {
            let guard = page.read();
            let view = BTreePage::open(&guard)?;
            self.slot_count = view.slot_count();
            self.next_leaf = view.next_leaf_num();
        }
        self.cur = Some(page);
        self.slot = 0;
        Ok(())
    }
}

impl Iterator for IndexIter {
    type Item = Result<(IndexCell, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let page = self.cur.as_ref()?;
            if self.slot < self.slot_count {
                let slot = self.slot;
                self.slot += 1;
                let guard = page.read();
                let entry = BTreePage::open(&guard).and_then(|view| {
                    let cell = IndexCell::from_bytes(view.key_at(slot)?.to_vec());
                    let (page_num, rid_slot) = view.leaf_rid_at(slot)?;
                    Ok((
                        cell,
                        RecordId::new(PageId::new(self.table_fid, page_num), rid_slot),
                    ))
                });
                return Some(entry);
            }
            if self.next_leaf == INVALID_PAGE_NUM {
                self.cur = None;
                return None;
            }
            let fid = page.page_id().fid;
            let next = self.next_leaf;
            self.cur = None;
            if let Err(err) = self.load_leaf(fid, next) {
                return Some(Err(err));
            }
        }
    }
}
