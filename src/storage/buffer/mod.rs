//! Buffer pool: a fixed array of page frames fronting the disk
//! manager.
//!
//! The pool mutex guards the page table, free list and frame metadata
//! and is held only across O(1) bookkeeping — the one exception is the
//! flush of a dirty victim on the eviction path. Each frame's bytes
//! sit behind their own `RwLock`, the page latch: readers take it
//! shared before dereferencing page bytes, writers exclusive.
//!
//! A `PageHandle` is a pin ticket. Holding one keeps the frame
//! resident; dropping it unpins and, at pin count zero, marks the
//! frame evictable. Taking the handle's write latch marks the frame
//! dirty; the dirty bit is OR-ed into the frame on unpin.

pub mod lru_k;

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::core::errors::{NileDbError, Result};
use crate::storage::disk::DiskManager;
use crate::storage::page::{FileId, PageId};

use lru_k::LruKReplacer;

type FrameData = Arc<RwLock<Box<[u8]>>>;

pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Box<[u8]>>;
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>;

#[derive(Debug, Clone, Copy)]
struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    dirty: bool,
}

impl FrameMeta {
    const EMPTY: FrameMeta = FrameMeta {
        page_id: PageId::INVALID,
        pin_count: 0,
        dirty: false,
    };
}

#[derive(Debug)]
struct PoolState {
    metas: Vec<FrameMeta>,
    page_table: HashMap<PageId, usize>,
    free_list: Vec<usize>,
}

#[derive(Debug)]
pub struct BufferPool {
    page_size: usize,
    disk: DiskManager,
    frames: Vec<FrameData>,
    replacer: LruKReplacer,
    state: Mutex<PoolState>,
}

impl BufferPool {
    pub fn new(disk: DiskManager, pool_size: usize, replacer_k: usize) -> Arc<BufferPool> {
        let page_size = disk.page_size();
        let frames = (0..pool_size)
            .map(|_| Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())))
            .collect();
        Arc::new(BufferPool {
            page_size,
            disk,
            frames,
            replacer: LruKReplacer::new(replacer_k),
            state: Mutex::new(PoolState {
                metas: vec![FrameMeta::EMPTY; pool_size],
                page_table: HashMap::new(),
                free_list: (0..pool_size).rev().collect(),
            }),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Allocate a fresh zeroed page in `fid` and pin it.
    pub fn new_page(self: &Arc<Self>, fid: FileId) -> Result<PageHandle> {
        let frame = {
            let mut state = self.state.lock();
            self.acquire_frame(&mut state)?
        };
        // The frame is reserved and invisible; zero it and let the disk
        // manager persist the initial contents. No pool mutex across
        // the allocation I/O.
        let data = self.frames[frame].clone();
        let page_id = {
            let mut guard = data.write();
            guard.fill(0);
            match self.disk.allocate_page(fid, &guard) {
                Ok(page_id) => page_id,
                Err(err) => {
                    self.state.lock().free_list.push(frame);
                    return Err(err);
                }
            }
        };

        let mut state = self.state.lock();
        state.metas[frame] = FrameMeta {
            page_id,
            pin_count: 1,
            dirty: false,
        };
        state.page_table.insert(page_id, frame);
        self.replacer.record_access(frame);
        self.replacer.set_evictable(frame, false);
        drop(state);
        Ok(self.handle(data, page_id))
    }

    /// Pin a page, reading it from disk on a miss. A failed read
    /// installs nothing and surfaces the error.
    pub fn fetch_page(self: &Arc<Self>, page_id: PageId) -> Result<PageHandle> {
        if !page_id.is_valid() {
            return Err(NileDbError::InvalidArg(format!(
                "fetch of invalid page id {page_id}"
            )));
        }
        let frame = {
            let mut state = self.state.lock();
            if let Some(&frame) = state.page_table.get(&page_id) {
                state.metas[frame].pin_count += 1;
                self.replacer.record_access(frame);
                self.replacer.set_evictable(frame, false);
                return Ok(self.handle(self.frames[frame].clone(), page_id));
            }
            self.acquire_frame(&mut state)?
        };

        let data = self.frames[frame].clone();
        let read_result = {
            let mut guard = data.write();
            self.disk.read_page(page_id, &mut guard)
        };

        let mut state = self.state.lock();
        if let Err(err) = read_result {
            state.free_list.push(frame);
            return Err(err);
        }
        // Another thread may have loaded the same page while we were
        // off the mutex; prefer its frame and recycle ours.
        if let Some(&existing) = state.page_table.get(&page_id) {
            state.free_list.push(frame);
            state.metas[existing].pin_count += 1;
            self.replacer.record_access(existing);
            self.replacer.set_evictable(existing, false);
            let data = self.frames[existing].clone();
            drop(state);
            return Ok(self.handle(data, page_id));
        }
        state.metas[frame] = FrameMeta {
            page_id,
            pin_count: 1,
            dirty: false,
        };
        state.page_table.insert(page_id, frame);
        self.replacer.record_access(frame);
        self.replacer.set_evictable(frame, false);
        drop(state);
        Ok(self.handle(data, page_id))
    }

    /// Write a resident dirty page through to disk.
    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        let frame = {
            let state = self.state.lock();
            match state.page_table.get(&page_id) {
                Some(&frame) if state.metas[frame].dirty => frame,
                _ => return Ok(()),
            }
        };
        self.flush_frame(frame, page_id)
    }

    /// Flush every dirty frame, then the cached file headers.
    pub fn flush_all(&self) -> Result<()> {
        let targets: Vec<(usize, PageId)> = {
            let state = self.state.lock();
            state
                .metas
                .iter()
                .enumerate()
                .filter(|(_, meta)| meta.page_id.is_valid() && meta.dirty)
                .map(|(frame, meta)| (frame, meta.page_id))
                .collect()
        };
        for (frame, page_id) in targets {
            self.flush_frame(frame, page_id)?;
        }
        self.disk.flush_headers()
    }

    /// Flush one frame without holding the pool mutex across the
    /// latch wait: latch first, then re-check that the frame still
    /// holds the expected page (it may have been evicted meanwhile).
    fn flush_frame(&self, frame: usize, page_id: PageId) -> Result<()> {
        let guard = self.frames[frame].read();
        {
            let state = self.state.lock();
            let meta = state.metas[frame];
            if meta.page_id != page_id || !meta.dirty {
                return Ok(());
            }
        }
        self.disk.write_page(page_id, &guard)?;
        let mut state = self.state.lock();
        if state.metas[frame].page_id == page_id {
            state.metas[frame].dirty = false;
        }
        Ok(())
    }

    /// Drop a page from the pool and push it onto its file's freelist.
    /// The page must be unpinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<()> {
        {
            let mut state = self.state.lock();
            if let Some(&frame) = state.page_table.get(&page_id) {
                if state.metas[frame].pin_count != 0 {
                    return Err(NileDbError::InvalidArg(format!(
                        "delete of pinned page {page_id}"
                    )));
                }
                state.page_table.remove(&page_id);
                state.metas[frame] = FrameMeta::EMPTY;
                self.replacer.remove(frame);
                state.free_list.push(frame);
            }
        }
        self.disk.deallocate_page(page_id)
    }

    /// Evict every frame of a file (all must be unpinned), then unlink
    /// the file itself.
    pub fn delete_file(&self, fid: FileId) -> Result<()> {
        {
            let mut state = self.state.lock();
            let frames: Vec<usize> = state
                .page_table
                .iter()
                .filter(|(pid, _)| pid.fid == fid)
                .map(|(_, &frame)| frame)
                .collect();
            for &frame in &frames {
                if state.metas[frame].pin_count != 0 {
                    return Err(NileDbError::InvalidArg(format!(
                        "delete of file {fid} with pinned pages"
                    )));
                }
            }
            for frame in frames {
                let page_id = state.metas[frame].page_id;
                state.page_table.remove(&page_id);
                state.metas[frame] = FrameMeta::EMPTY;
                self.replacer.remove(frame);
                state.free_list.push(frame);
            }
        }
        self.disk.delete_file(fid)
    }

    /// Flush and fsync everything; used on database close.
    pub fn close(&self) -> Result<()> {
        self.flush_all()?;
        self.disk.close()
    }

    fn handle(self: &Arc<Self>, data: FrameData, page_id: PageId) -> PageHandle {
        PageHandle {
            pool: self.clone(),
            data,
            page_id,
            dirty: Cell::new(false),
        }
    }

    /// Pop a free frame, or evict the replacer's victim. A dirty
    /// victim is flushed before the frame is handed out; this is the
    /// only I/O performed under the pool mutex.
    fn acquire_frame(&self, state: &mut PoolState) -> Result<usize> {
        if let Some(frame) = state.free_list.pop() {
            return Ok(frame);
        }
        let Some(frame) = self.replacer.evict() else {
            return Err(NileDbError::FullPool(
                "no evictable frame available".into(),
            ));
        };
        let meta = state.metas[frame];
        debug_assert_eq!(meta.pin_count, 0, "evicted a pinned frame");
        if meta.dirty {
            debug!("flushing dirty victim {}", meta.page_id);
            let guard = self.frames[frame].read();
            if let Err(err) = self.disk.write_page(meta.page_id, &guard) {
                // Keep the page; the caller sees the failure.
                drop(guard);
                self.replacer.record_access(frame);
                self.replacer.set_evictable(frame, true);
                return Err(err);
            }
        }
        state.page_table.remove(&meta.page_id);
        state.metas[frame] = FrameMeta::EMPTY;
        Ok(frame)
    }

    fn unpin(&self, page_id: PageId, dirty: bool) {
        let mut state = self.state.lock();
        let Some(&frame) = state.page_table.get(&page_id) else {
            warn!("unpin of non-resident page {page_id}");
            return;
        };
        let meta = &mut state.metas[frame];
        if meta.pin_count == 0 {
            debug_assert!(false, "pin underflow on {page_id}");
            return;
        }
        meta.pin_count -= 1;
        meta.dirty |= dirty;
        if meta.pin_count == 0 {
            self.replacer.set_evictable(frame, true);
        }
    }

    #[cfg(test)]
    fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.state.lock();
        state
            .page_table
            .get(&page_id)
            .map(|&f| state.metas[f].pin_count)
    }
}

/// Pin ticket for one page. `read`/`write` take the page latch;
/// dropping the handle unpins.
#[derive(Debug)]
pub struct PageHandle {
    pool: Arc<BufferPool>,
    data: FrameData,
    page_id: PageId,
    dirty: Cell<bool>,
}

impl PageHandle {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> PageReadGuard {
        RwLock::read_arc(&self.data)
    }

    pub fn write(&self) -> PageWriteGuard {
        self.dirty.set(true);
        RwLock::write_arc(&self.data)
    }

    /// Mark dirty without taking the latch (the caller already holds a
    /// write guard obtained from this handle).
    pub fn mark_dirty(&self) {
        self.dirty.set(true);
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.pool.unpin(self.page_id, self.dirty.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::registry::FileRegistry;
    use tempfile::tempdir;

    const PAGE: usize = 256;

    fn pool_with(
        dir: &std::path::Path,
        pool_size: usize,
        k: usize,
    ) -> (Arc<BufferPool>, FileId) {
        let registry = Arc::new(FileRegistry::new());
        let fid = registry.register(dir.join("t.ndb")).unwrap();
        let disk = DiskManager::new(registry, PAGE);
        (BufferPool::new(disk, pool_size, k), fid)
    }

    #[test]
    fn new_page_roundtrips_through_eviction() {
        let tmp = tempdir().unwrap();
        let (pool, fid) = pool_with(tmp.path(), 2, 2);

        let a = pool.new_page(fid).unwrap();
        let a_id = a.page_id();
        a.write()[10] = 42;
        drop(a);

        // Force a out of the pool.
        let _b = pool.new_page(fid).unwrap();
        let _c = pool.new_page(fid).unwrap();

        drop(_b);
        drop(_c);
        let a = pool.fetch_page(a_id).unwrap();
        assert_eq!(a.read()[10], 42);
    }

    #[test]
    fn pinned_frames_exhaust_the_pool() {
        let tmp = tempdir().unwrap();
        let (pool, fid) = pool_with(tmp.path(), 2, 2);

        let a = pool.new_page(fid).unwrap();
        let b = pool.new_page(fid).unwrap();
        let err = pool.new_page(fid).unwrap_err();
        assert!(matches!(err, NileDbError::FullPool(_)));

        drop(b);
        let c = pool.new_page(fid).unwrap();
        drop(a);
        drop(c);
    }

    #[test]
    fn unpin_transitions_drive_evictability() {
        let tmp = tempdir().unwrap();
        let (pool, fid) = pool_with(tmp.path(), 3, 2);

        let a = pool.new_page(fid).unwrap();
        let a_id = a.page_id();
        let a2 = pool.fetch_page(a_id).unwrap();
        assert_eq!(pool.pin_count(a_id), Some(2));
        drop(a);
        assert_eq!(pool.pin_count(a_id), Some(1));
        drop(a2);
        assert_eq!(pool.pin_count(a_id), Some(0));
    }

    #[test]
    fn lru_k_scenario_evicts_the_single_access_page() {
        let tmp = tempdir().unwrap();
        let (pool, fid) = pool_with(tmp.path(), 3, 2);

        let a = pool.new_page(fid).unwrap();
        let b = pool.new_page(fid).unwrap();
        let c = pool.new_page(fid).unwrap();
        let (a_id, b_id, c_id) = (a.page_id(), b.page_id(), c.page_id());
        drop(a);
        drop(b);
        drop(c);

        // Access sequence a, b, a, c, b.
        for pid in [a_id, b_id, a_id, c_id, b_id] {
            drop(pool.fetch_page(pid).unwrap());
        }

        // The new page must evict c: its 2nd-most-recent access is the
        // oldest (it has the fewest accesses of the three).
        let _d = pool.new_page(fid).unwrap();
        let state = pool.state.lock();
        assert!(!state.page_table.contains_key(&c_id));
        assert!(state.page_table.contains_key(&a_id));
        assert!(state.page_table.contains_key(&b_id));
    }

    #[test]
    fn delete_page_recycles_the_disk_slot() {
        let tmp = tempdir().unwrap();
        let (pool, fid) = pool_with(tmp.path(), 4, 2);

        let a = pool.new_page(fid).unwrap();
        let a_id = a.page_id();
        drop(a);
        pool.delete_page(a_id).unwrap();

        let b = pool.new_page(fid).unwrap();
        assert_eq!(b.page_id(), a_id);
    }

    #[test]
    fn flush_all_persists_across_reopen() {
        let tmp = tempdir().unwrap();
        let registry = Arc::new(FileRegistry::new());
        let fid = registry.register(tmp.path().join("t.ndb")).unwrap();
        let page_id;
        {
            let disk = DiskManager::new(registry.clone(), PAGE);
            let pool = BufferPool::new(disk, 4, 2);
            let p = pool.new_page(fid).unwrap();
            page_id = p.page_id();
            p.write()[0..4].copy_from_slice(&[9, 9, 9, 9]);
            drop(p);
            pool.close().unwrap();
        }
        let disk = DiskManager::new(registry, PAGE);
        let pool = BufferPool::new(disk, 4, 2);
        let p = pool.fetch_page(page_id).unwrap();
        assert_eq!(&p.read()[0..4], &[9, 9, 9, 9]);
    }
}
