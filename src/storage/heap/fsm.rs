//! Per-table free-space map.
//!
//! An auxiliary `<table>_fsm.ndb` file holding one byte per page of
//! the table's heap file. Byte i describes heap page i+1: the free
//! fraction `free_bytes / (page_size / 256)`. Zero marks a page with
//! no usable space - full data pages, overflow pages, freelist pages -
//! and is skipped by candidate search. The map is advisory: a
//! candidate page may turn out not to fit the record, in which case
//! the caller corrects the entry and allocates elsewhere.
//!
//! On-disk shape: a byte stream of [count u32][fraction bytes...]
//! spread across the file's pages from page 1 up; loaded into memory
//! at open and written through on update.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::core::errors::{NileDbError, Result};
use crate::storage::buffer::BufferPool;
use crate::storage::page::{FileId, PageId};

#[derive(Debug)]
pub struct FreeSpaceMap {
    pool: Arc<BufferPool>,
    fid: FileId,
    entries: Mutex<Vec<u8>>,
}

impl FreeSpaceMap {
    /// Load the map from its file, creating the first page of a fresh
    /// map on demand.
    pub fn load(pool: Arc<BufferPool>, fid: FileId) -> Result<FreeSpaceMap> {
        let page_size = pool.page_size();
        let entries = match pool.fetch_page(PageId::new(fid, 1)) {
            Ok(first) => {
                let guard = first.read();
                let count = LittleEndian::read_u32(&guard[0..4]) as usize;
                let mut entries = Vec::with_capacity(count);
                let in_first = count.min(page_size - 4);
                entries.extend_from_slice(&guard[4..4 + in_first]);
                drop(guard);
                drop(first);
                let mut page_num = 2;
                while entries.len() < count {
                    let page = pool.fetch_page(PageId::new(fid, page_num))?;
                    let guard = page.read();
                    let take = (count - entries.len()).min(page_size);
                    entries.extend_from_slice(&guard[..take]);
                    page_num += 1;
                }
                entries
            }
            Err(NileDbError::PageNotFound(_)) => {
                let first = pool.new_page(fid)?;
                debug_assert_eq!(first.page_id().page_num, 1);
                first.write().fill(0);
                Vec::new()
            }
            Err(err) => return Err(err),
        };
        Ok(FreeSpaceMap {
            pool,
            fid,
            entries: Mutex::new(entries),
        })
    }

    fn granularity(&self) -> usize {
        (self.pool.page_size() / 256).max(1)
    }

    /// Record the free space of heap page `heap_page_num`, growing the
    /// map (zero-filled) if the page is beyond the tracked range.
    pub fn update_free_space(&self, heap_page_num: u32, free_bytes: usize) -> Result<()> {
        if heap_page_num < 1 {
            return Err(NileDbError::InvalidArg(format!(
                "free-space update for header page {heap_page_num}"
            )));
        }
        let idx = (heap_page_num - 1) as usize;
        let fraction = (free_bytes / self.granularity()).min(255) as u8;

        let mut entries = self.entries.lock();
        let old_len = entries.len();
        if idx >= old_len {
            entries.resize(idx + 1, 0);
        }
        entries[idx] = fraction;
        let new_len = entries.len();
        drop(entries);

        // Write-through. Growing the map writes the new count plus
        // every fresh stream byte; an in-range update touches one byte.
        if new_len > old_len {
            self.write_count(new_len as u32)?;
            for i in old_len..new_len {
                self.write_entry(i, if i == idx { fraction } else { 0 })?;
            }
        } else {
            self.write_entry(idx, fraction)?;
        }
        Ok(())
    }

    /// First heap page whose recorded free space covers `size_needed`,
    /// if any.
    pub fn free_page_for(&self, size_needed: usize) -> Option<u32> {
        let gran = self.granularity();
        let needed = size_needed.div_ceil(gran).min(255) as u8;
        let needed = needed.max(1);
        let entries = self.entries.lock();
        entries
            .iter()
            .position(|&f| f >= needed)
            .map(|idx| idx as u32 + 1)
    }

    fn write_count(&self, count: u32) -> Result<()> {
        let page = self.pool.fetch_page(PageId::new(self.fid, 1))?;
        let mut guard = page.write();
        LittleEndian::write_u32(&mut guard[0..4], count);
        Ok(())
    }

    fn write_entry(&self, idx: usize, value: u8) -> Result<()> {
        let page_size = self.pool.page_size();
        let stream_off = 4 + idx;
        let page_num = 1 + (stream_off / page_size) as i32;
        let in_page = stream_off % page_size;
        let page = match self.pool.fetch_page(PageId::new(self.fid, page_num)) {
            Ok(page) => page,
            Err(NileDbError::PageNotFound(_)) => {
                let page = self.pool.new_page(self.fid)?;
                debug_assert_eq!(page.page_id().page_num, page_num);
                page
            }
            Err(err) => return Err(err),
        };
        page.write()[in_page] = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::registry::FileRegistry;
    use crate::storage::disk::DiskManager;
    use tempfile::tempdir;

    const PAGE: usize = 256;

    fn fsm(dir: &std::path::Path) -> FreeSpaceMap {
        let registry = Arc::new(FileRegistry::new());
        let fid = registry.register(dir.join("t_fsm.ndb")).unwrap();
        let disk = DiskManager::new(registry, PAGE);
        let pool = BufferPool::new(disk, 8, 2);
        FreeSpaceMap::load(pool, fid).unwrap()
    }

    #[test]
    fn tracks_and_finds_candidates() {
        let tmp = tempdir().unwrap();
        let map = fsm(tmp.path());

        map.update_free_space(1, 10).unwrap();
        map.update_free_space(2, 200).unwrap();
        map.update_free_space(3, 40).unwrap();

        assert_eq!(map.free_page_for(100), Some(2));
        assert_eq!(map.free_page_for(30), Some(2));
        assert_eq!(map.free_page_for(8), Some(1));
        assert_eq!(map.free_page_for(250), None);
    }

    #[test]
    fn full_pages_are_skipped() {
        let tmp = tempdir().unwrap();
        let map = fsm(tmp.path());

        map.update_free_space(1, 0).unwrap();
        map.update_free_space(2, 90).unwrap();
        // A request of zero bytes still skips fraction-0 pages.
        assert_eq!(map.free_page_for(0), Some(2));
    }

    #[test]
    fn survives_reload() {
        let tmp = tempdir().unwrap();
        let registry = Arc::new(FileRegistry::new());
        let fid = registry.register(tmp.path().join("t_fsm.ndb")).unwrap();
        {
            let disk = DiskManager::new(registry.clone(), PAGE);
            let pool = BufferPool::new(disk, 8, 2);
            let map = FreeSpaceMap::load(pool.clone(), fid).unwrap();
            map.update_free_space(1, 64).unwrap();
            map.update_free_space(5, 128).unwrap();
            pool.close().unwrap();
        }
        let disk = DiskManager::new(registry, PAGE);
        let pool = BufferPool::new(disk, 8, 2);
        let map = FreeSpaceMap::load(pool, fid).unwrap();
        assert_eq!(map.free_page_for(128), Some(5));
        assert_eq!(map.free_page_for(64), Some(1));
    }
}
