//! Table heap: a linked chain of slotted data pages addressed through
//! the free-space map, with overflow chains for oversized values.
//!
//! The heap owns the overflow chains its records reference: deleting
//! a record walks its variable-length slots (via the table's
//! `RecordLayout`) and releases any chain it finds before the slot is
//! tombstoned.

pub mod data_page;
pub mod fsm;
pub mod overflow;

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::core::errors::{NileDbError, Result};
use crate::storage::buffer::{BufferPool, PageHandle};
use crate::storage::page::{FileId, PageId, RecordId};
use crate::storage::record::{Record, RecordLayout};

use data_page::{DataPage, DataPageMut, SLOT_ENTRY_SIZE};
use fsm::FreeSpaceMap;

pub const FIRST_DATA_PAGE: u32 = 1;

#[derive(Debug)]
pub struct Table {
    pool: Arc<BufferPool>,
    fid: FileId,
    fsm: FreeSpaceMap,
    layout: RecordLayout,
    tail: Mutex<Option<u32>>,
}

impl Table {
    /// Open (or create) a heap. A fresh file gets its first data page
    /// allocated immediately.
    pub fn open(
        pool: Arc<BufferPool>,
        fid: FileId,
        fsm: FreeSpaceMap,
        layout: RecordLayout,
    ) -> Result<Table> {
        let table = Table {
            pool,
            fid,
            fsm,
            layout,
            tail: Mutex::new(None),
        };
        table.ensure_first_page()?;
        Ok(table)
    }

    pub fn fid(&self) -> FileId {
        self.fid
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Largest record the heap accepts; the catalog spills variable
    /// payloads to overflow chains to stay under it.
    pub fn max_record_size(&self) -> usize {
        self.pool.page_size() / 2
    }

    pub fn insert_record(&self, record: &[u8]) -> Result<RecordId> {
        if record.is_empty() || record.len() > self.max_record_size() {
            return Err(NileDbError::InvalidArg(format!(
                "record of {} bytes exceeds the {}-byte bound",
                record.len(),
                self.max_record_size()
            )));
        }

        // Candidate pages from the map until one fits; entries are
        // advisory, so a miss corrects the entry and tries again.
        while let Some(page_num) = self.fsm.free_page_for(record.len() + SLOT_ENTRY_SIZE) {
            let page = self.pool.fetch_page(PageId::new(self.fid, page_num as i32))?;
            let mut guard = page.write();
            let mut view = DataPageMut::new(&mut guard);
            match view.insert_record(record) {
                Ok(slot) => {
                    let free = view.as_ref().free_space();
                    drop(guard);
                    self.fsm.update_free_space(page_num, free)?;
                    return Ok(RecordId::new(page.page_id(), slot));
                }
                Err(_) => {
                    let free = view.as_ref().free_space();
                    drop(guard);
                    debug!("fsm candidate page {page_num} rejected a {}-byte record", record.len());
                    self.fsm.update_free_space(page_num, free)?;
                }
            }
        }

        // No candidate: grow the chain by one page.
        let tail = self.find_tail()?;
        let page = self.pool.new_page(self.fid)?;
        let page_num = page.page_id().page_num as u32;
        let slot;
        let free;
        {
            let mut guard = page.write();
            let mut view = DataPageMut::new(&mut guard);
            view.init(page_num);
            view.set_prev_page_num(tail);
            slot = view.insert_record(record)?;
            free = view.as_ref().free_space();
        }
        {
            let prev = self.pool.fetch_page(PageId::new(self.fid, tail as i32))?;
            DataPageMut::new(&mut prev.write()).set_next_page_num(page_num);
        }
        *self.tail.lock() = Some(page_num);
        self.fsm.update_free_space(page_num, free)?;
        Ok(RecordId::new(page.page_id(), slot))
    }

    /// Tombstone a record, releasing any overflow chain it owns.
    pub fn delete_record(&self, rid: RecordId) -> Result<()> {
        if rid.page_id.fid != self.fid {
            return Err(NileDbError::InvalidArg(format!(
                "record id {rid} does not belong to file {}",
                self.fid
            )));
        }
        let page = self.pool.fetch_page(rid.page_id)?;
        let mut heads = Vec::new();
        let free;
        {
            let mut guard = page.write();
            {
                let view = DataPage::new(&guard);
                let record = Record::new(view.record(rid.slot)?);
                for &(_, offset) in &self.layout.var_cols {
                    if let Some(head) = record.overflow_head(offset as usize)? {
                        heads.push(head);
                    }
                }
            }
            let mut view = DataPageMut::new(&mut guard);
            view.delete_record(rid.slot)?;
            free = view.as_ref().free_space();
        }
        for head in heads {
            overflow::release_chain(&self.pool, self.fid, head)?;
        }
        self.fsm
            .update_free_space(rid.page_id.page_num as u32, free)?;
        Ok(())
    }

    /// Delete-then-insert; the new record may land on another page.
    pub fn update_record(&self, rid: RecordId, record: &[u8]) -> Result<RecordId> {
        self.delete_record(rid)?;
        self.insert_record(record)
    }

    /// Copy a live record out of its page.
    pub fn get_record(&self, rid: RecordId) -> Result<Vec<u8>> {
        if rid.page_id.fid != self.fid {
            return Err(NileDbError::InvalidArg(format!(
                "record id {rid} does not belong to file {}",
                self.fid
            )));
        }
        let page = self.pool.fetch_page(rid.page_id)?;
        let guard = page.read();
        Ok(DataPage::new(&guard).record(rid.slot)?.to_vec())
    }

    /// Forward scan over live records.
    pub fn iter(&self) -> Result<TableIter> {
        TableIter::open(self.pool.clone(), self.fid)
    }

    fn ensure_first_page(&self) -> Result<()> {
        match self.pool.fetch_page(PageId::new(self.fid, FIRST_DATA_PAGE as i32)) {
            Ok(_) => Ok(()),
            Err(NileDbError::PageNotFound(_)) => {
                let page = self.pool.new_page(self.fid)?;
                debug_assert_eq!(page.page_id().page_num, FIRST_DATA_PAGE as i32);
                let free;
                {
                    let mut guard = page.write();
                    let mut view = DataPageMut::new(&mut guard);
                    view.init(FIRST_DATA_PAGE);
                    free = view.as_ref().free_space();
                }
                self.fsm.update_free_space(FIRST_DATA_PAGE, free)?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Last page of the data chain, walking next-pointers once and
    /// caching the answer.
    fn find_tail(&self) -> Result<u32> {
        let mut cached = self.tail.lock();
        if let Some(tail) = *cached {
            return Ok(tail);
        }
        let mut page_num = FIRST_DATA_PAGE;
        loop {
            let page = self.pool.fetch_page(PageId::new(self.fid, page_num as i32))?;
            let next = DataPage::new(&page.read()).next_page_num();
            if next == 0 {
                break;
            }
            page_num = next;
        }
        *cached = Some(page_num);
        Ok(page_num)
    }
}

/// Forward-only iterator holding one page pinned at a time, skipping
/// tombstoned slots.
#[derive(Debug)]
pub struct TableIter {
    pool: Arc<BufferPool>,
    fid: FileId,
    cur: Option<PageHandle>,
    next_page: u32,
    slot_count: u32,
    slot: u32,
}

impl TableIter {
    fn open(pool: Arc<BufferPool>, fid: FileId) -> Result<TableIter> {
        let mut iter = TableIter {
            pool,
            fid,
            cur: None,
            next_page: 0,
            slot_count: 0,
            slot: 0,
        };
        iter.load_page(FIRST_DATA_PAGE)?;
        Ok(iter)
    }

    fn load_page(&mut self, page_num: u32) -> Result<()> {
        let page = self.pool.fetch_page(PageId::new(self.fid, page_num as i32))?;
        {
            let guard = page.read();
            let view = DataPage::new(&guard);
            self.slot_count = view.slot_count();
            self.next_page = view.next_page_num();
        }
        self.cur = Some(page);
        self.slot = 0;
        Ok(())
    }
}

impl Iterator for TableIter {
    type Item = Result<(RecordId, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let page = self.cur.as_ref()?;
            while self.slot < self.slot_count {
                let slot = self.slot;
                self.slot += 1;
                let guard = page.read();
                let view = DataPage::new(&guard);
                match view.slot(slot) {
                    Ok((0, _)) => continue,
                    Ok(_) => {
                        let rid = RecordId::new(page.page_id(), slot);
                        let bytes = match view.record(slot) {
                            Ok(bytes) => bytes.to_vec(),
                            Err(err) => return Some(Err(err)),
                        };
                        return Some(Ok((rid, bytes)));
                    }
                    Err(err) => return Some(Err(err)),
                }
            }
            if self.next_page == 0 {
                self.cur = None;
                return None;
            }
            let next = self.next_page;
            self.cur = None;
            if let Err(err) = self.load_page(next) {
                return Some(Err(err));
            }
        }
    }
}
