//! Disk manager: fixed-size page I/O over a set of registered files.
//!
//! File layout:
//! - page 0 is the header page. Bytes 0-3 hold the freelist head page
//!   number (0 = no free pages), bytes 4-7 the allocated page count
//!   (always >= 1, the header itself). The rest is reserved.
//! - a freed page stores the next freelist pointer in its first 4
//!   bytes; the remaining bytes are garbage.
//!
//! Headers are cached in memory while a file is open and written back
//! by `flush_headers` and on shutdown.

pub mod registry;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::warn;
use parking_lot::Mutex;

use crate::core::errors::{NileDbError, Result, StorageError};
use crate::storage::page::{FileId, PageId, PageNum};

use registry::FileRegistry;

#[derive(Debug)]
struct FileMeta {
    file: File,
    freelist_head: PageNum,
    page_count: u32,
}

#[derive(Debug)]
pub struct DiskManager {
    registry: Arc<FileRegistry>,
    page_size: usize,
    files: Mutex<HashMap<FileId, FileMeta>>,
}

impl DiskManager {
    pub fn new(registry: Arc<FileRegistry>, page_size: usize) -> DiskManager {
        DiskManager {
            registry,
            page_size,
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Read one page into `buf`. A short read zero-fills the tail and
    /// reports an error.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        let mut files = self.files.lock();
        let meta = self.open_file(&mut files, page_id.fid)?;
        if page_id.page_num < 1 || page_id.page_num as u32 >= meta.page_count {
            return Err(NileDbError::PageNotFound(format!(
                "page {page_id} is not allocated"
            )));
        }
        meta.file
            .seek(SeekFrom::Start(page_id.page_num as u64 * self.page_size as u64))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = meta.file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled < buf.len() {
            warn!("short read of {} bytes at page {page_id}", filled);
            buf[filled..].fill(0);
            return Err(StorageError(format!(
                "short read at page {page_id}: {filled} of {} bytes",
                self.page_size
            ))
            .into());
        }
        Ok(())
    }

    pub fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        let mut files = self.files.lock();
        let meta = self.open_file(&mut files, page_id.fid)?;
        if page_id.page_num < 1 || page_id.page_num as u32 >= meta.page_count {
            return Err(NileDbError::InvalidArg(format!(
                "write to unallocated page {page_id}"
            )));
        }
        meta.file
            .seek(SeekFrom::Start(page_id.page_num as u64 * self.page_size as u64))?;
        meta.file.write_all(buf)?;
        Ok(())
    }

    /// Allocate a page in `fid` and write `buf` as its initial
    /// contents. Pops the freelist when possible, otherwise appends.
    pub fn allocate_page(&self, fid: FileId, buf: &[u8]) -> Result<PageId> {
        debug_assert_eq!(buf.len(), self.page_size);
        let mut files = self.files.lock();
        let meta = self.open_file(&mut files, fid)?;

        let page_num = if meta.freelist_head != 0 {
            let head = meta.freelist_head;
            let offset = head as u64 * self.page_size as u64;
            let mut next = [0u8; 4];
            meta.file.seek(SeekFrom::Start(offset))?;
            meta.file.read_exact(&mut next)?;
            meta.file.seek(SeekFrom::Start(offset))?;
            meta.file.write_all(buf)?;
            meta.freelist_head = LittleEndian::read_i32(&next);
            head
        } else {
            let page_num = meta.page_count as PageNum;
            meta.file
                .seek(SeekFrom::Start(page_num as u64 * self.page_size as u64))?;
            meta.file.write_all(buf)?;
            meta.page_count += 1;
            page_num
        };
        Ok(PageId::new(fid, page_num))
    }

    /// Push a page onto its file's freelist. The page's first 4 bytes
    /// are overwritten with the old freelist head.
    pub fn deallocate_page(&self, page_id: PageId) -> Result<()> {
        let mut files = self.files.lock();
        let meta = self.open_file(&mut files, page_id.fid)?;
        if page_id.page_num < 1 || page_id.page_num as u32 >= meta.page_count {
            return Err(NileDbError::InvalidArg(format!(
                "deallocate of unallocated page {page_id}"
            )));
        }
        let mut head = [0u8; 4];
        LittleEndian::write_i32(&mut head, meta.freelist_head);
        meta.file
            .seek(SeekFrom::Start(page_id.page_num as u64 * self.page_size as u64))?;
        meta.file.write_all(&head)?;
        meta.freelist_head = page_id.page_num;
        Ok(())
    }

    /// Close and unlink a file, dropping its registry entry.
    pub fn delete_file(&self, fid: FileId) -> Result<()> {
        let mut files = self.files.lock();
        files.remove(&fid);
        let path = self
            .registry
            .path_of(fid)
            .ok_or_else(|| NileDbError::InvalidArg(format!("unknown file id {fid}")))?;
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        self.registry.unregister(fid);
        Ok(())
    }

    /// Write every cached header back to its file.
    pub fn flush_headers(&self) -> Result<()> {
        let mut files = self.files.lock();
        for meta in files.values_mut() {
            write_header(&mut meta.file, meta.freelist_head, meta.page_count)?;
        }
        Ok(())
    }

    /// Flush headers and fsync everything.
    pub fn close(&self) -> Result<()> {
        let mut files = self.files.lock();
        for meta in files.values_mut() {
            write_header(&mut meta.file, meta.freelist_head, meta.page_count)?;
            meta.file.sync_all()?;
        }
        files.clear();
        Ok(())
    }

    fn open_file<'a>(
        &self,
        files: &'a mut HashMap<FileId, FileMeta>,
        fid: FileId,
    ) -> Result<&'a mut FileMeta> {
        if !files.contains_key(&fid) {
            let path = self
                .registry
                .path_of(fid)
                .ok_or_else(|| NileDbError::InvalidArg(format!("unknown file id {fid}")))?;
            let existed = path.exists();
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            let meta = if existed {
                let mut header = [0u8; 8];
                file.seek(SeekFrom::Start(0))?;
                file.read_exact(&mut header).map_err(|e| {
                    StorageError(format!("corrupt header in {}: {e}", path.display()))
                })?;
                FileMeta {
                    file,
                    freelist_head: LittleEndian::read_i32(&header[0..4]),
                    page_count: LittleEndian::read_u32(&header[4..8]),
                }
            } else {
                // Fresh file: header page with empty freelist and a
                // page count of one (the header itself).
                let page = vec![0u8; self.page_size];
                file.write_all(&page)?;
                write_header(&mut file, 0, 1)?;
                FileMeta {
                    file,
                    freelist_head: 0,
                    page_count: 1,
                }
            };
            files.insert(fid, meta);
        }
        Ok(files.get_mut(&fid).expect("file meta just inserted"))
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        if let Err(err) = self.flush_headers() {
            warn!("failed to flush file headers on shutdown: {err}");
        }
    }
}

fn write_header(file: &mut File, freelist_head: PageNum, page_count: u32) -> Result<()> {
    let mut header = [0u8; 8];
    LittleEndian::write_i32(&mut header[0..4], freelist_head);
    LittleEndian::write_u32(&mut header[4..8], page_count);
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE: usize = 256;

    fn manager(dir: &std::path::Path) -> (DiskManager, FileId) {
        let registry = Arc::new(FileRegistry::new());
        let fid = registry.register(dir.join("t.ndb")).unwrap();
        (DiskManager::new(registry, PAGE), fid)
    }

    #[test]
    fn allocate_appends_then_reads_back() {
        let tmp = tempdir().unwrap();
        let (dm, fid) = manager(tmp.path());

        let a = dm.allocate_page(fid, &[1u8; PAGE]).unwrap();
        let b = dm.allocate_page(fid, &[2u8; PAGE]).unwrap();
        assert_eq!(a.page_num, 1);
        assert_eq!(b.page_num, 2);

        let mut buf = vec![0u8; PAGE];
        dm.read_page(a, &mut buf).unwrap();
        assert_eq!(buf, vec![1u8; PAGE]);
        dm.read_page(b, &mut buf).unwrap();
        assert_eq!(buf, vec![2u8; PAGE]);
    }

    #[test]
    fn deallocate_feeds_the_freelist() {
        let tmp = tempdir().unwrap();
        let (dm, fid) = manager(tmp.path());

        let a = dm.allocate_page(fid, &[1u8; PAGE]).unwrap();
        let b = dm.allocate_page(fid, &[2u8; PAGE]).unwrap();
        dm.deallocate_page(a).unwrap();
        dm.deallocate_page(b).unwrap();

        // LIFO reuse: b was freed last, so it comes back first.
        let c = dm.allocate_page(fid, &[3u8; PAGE]).unwrap();
        assert_eq!(c.page_num, b.page_num);
        let d = dm.allocate_page(fid, &[4u8; PAGE]).unwrap();
        assert_eq!(d.page_num, a.page_num);
        // Freelist exhausted: back to appending.
        let e = dm.allocate_page(fid, &[5u8; PAGE]).unwrap();
        assert_eq!(e.page_num, 3);
    }

    #[test]
    fn header_survives_reopen() {
        let tmp = tempdir().unwrap();
        let registry = Arc::new(FileRegistry::new());
        let fid = registry.register(tmp.path().join("t.ndb")).unwrap();
        {
            let dm = DiskManager::new(registry.clone(), PAGE);
            dm.allocate_page(fid, &[7u8; PAGE]).unwrap();
            dm.allocate_page(fid, &[8u8; PAGE]).unwrap();
            dm.close().unwrap();
        }
        let dm = DiskManager::new(registry, PAGE);
        let next = dm.allocate_page(fid, &[9u8; PAGE]).unwrap();
        assert_eq!(next.page_num, 3);
        let mut buf = vec![0u8; PAGE];
        dm.read_page(PageId::new(fid, 1), &mut buf).unwrap();
        assert_eq!(buf, vec![7u8; PAGE]);
    }

    #[test]
    fn reading_unallocated_pages_fails() {
        let tmp = tempdir().unwrap();
        let (dm, fid) = manager(tmp.path());
        let mut buf = vec![0u8; PAGE];
        let err = dm.read_page(PageId::new(fid, 1), &mut buf).unwrap_err();
        assert!(matches!(err, NileDbError::PageNotFound(_)));
    }
}
