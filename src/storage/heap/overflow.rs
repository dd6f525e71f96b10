//! Overflow pages: a singly-linked chain holding a value too large to
//! live inside its record.
//!
//! Page layout: next overflow page number (u32, 0 = end) at byte 0,
//! content size (u16) at byte 4, raw content from byte 6. Chains are
//! written tail-first so a reader can stream the value front to back
//! by following next pointers.

use byteorder::{ByteOrder, LittleEndian};

use std::sync::Arc;

use crate::core::errors::Result;
use crate::storage::buffer::BufferPool;
use crate::storage::page::{FileId, PageId, PageNum};

pub const OVERFLOW_HEADER_SIZE: usize = 6;

const NEXT_PAGE_OFFSET: usize = 0;
const CONTENT_SIZE_OFFSET: usize = 4;

pub fn max_content(page_size: usize) -> usize {
    page_size - OVERFLOW_HEADER_SIZE
}

#[derive(Debug, Clone, Copy)]
pub struct OverflowPage<'a> {
    buf: &'a [u8],
}

impl<'a> OverflowPage<'a> {
    pub fn new(buf: &'a [u8]) -> OverflowPage<'a> {
        OverflowPage { buf }
    }

    pub fn next_page_num(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[NEXT_PAGE_OFFSET..])
    }

    pub fn content_size(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[CONTENT_SIZE_OFFSET..])
    }

    pub fn content(&self) -> &'a [u8] {
        let size = self.content_size() as usize;
        &self.buf[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + size]
    }
}

#[derive(Debug)]
pub struct OverflowPageMut<'a> {
    buf: &'a mut [u8],
}

impl<'a> OverflowPageMut<'a> {
    pub fn new(buf: &'a mut [u8]) -> OverflowPageMut<'a> {
        OverflowPageMut { buf }
    }

    pub fn init(&mut self, next: u32, content: &[u8]) {
        self.buf.fill(0);
        LittleEndian::write_u32(&mut self.buf[NEXT_PAGE_OFFSET..], next);
        LittleEndian::write_u16(&mut self.buf[CONTENT_SIZE_OFFSET..], content.len() as u16);
        self.buf[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + content.len()]
            .copy_from_slice(content);
    }
}

/// Build an overflow chain for `value` in `fid`, returning the head
/// page number. Pages are created from the last chunk backwards so
/// each page can point at its successor as it is written. An
/// allocation failure releases the already-built suffix before
/// surfacing the error.
pub fn build_chain(pool: &Arc<BufferPool>, fid: FileId, value: &[u8]) -> Result<PageNum> {
    let chunk = max_content(pool.page_size());
    let mut next: u32 = 0;
    let mut built: Vec<PageNum> = Vec::new();
    for piece in value.chunks(chunk).rev() {
        let page = match pool.new_page(fid) {
            Ok(page) => page,
            Err(err) => {
                for page_num in built {
                    let _ = pool.delete_page(PageId::new(fid, page_num));
                }
                return Err(err);
            }
        };
        OverflowPageMut::new(&mut page.write()).init(next, piece);
        next = page.page_id().page_num as u32;
        built.push(page.page_id().page_num);
    }
    Ok(next as PageNum)
}

/// Read an entire chain back into one buffer.
pub fn read_chain(pool: &Arc<BufferPool>, fid: FileId, head: PageNum) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut reader = OverflowChainReader::new(pool.clone(), fid, head);
    while let Some(chunk) = reader.next_chunk()? {
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

/// Deallocate every page of a chain.
pub fn release_chain(pool: &Arc<BufferPool>, fid: FileId, head: PageNum) -> Result<()> {
    let mut page_num = head;
    while page_num != 0 && page_num != crate::storage::page::INVALID_PAGE_NUM {
        let page_id = PageId::new(fid, page_num);
        let next = {
            let page = pool.fetch_page(page_id)?;
            let guard = page.read();
            OverflowPage::new(&guard).next_page_num() as PageNum
        };
        pool.delete_page(page_id)?;
        page_num = next;
    }
    Ok(())
}

/// Streams a chain one page at a time; no pin is held between chunks.
#[derive(Debug)]
pub struct OverflowChainReader {
    pool: Arc<BufferPool>,
    fid: FileId,
    next: PageNum,
}

impl OverflowChainReader {
    pub fn new(pool: Arc<BufferPool>, fid: FileId, head: PageNum) -> OverflowChainReader {
        OverflowChainReader {
            pool,
            fid,
            next: head,
        }
    }

    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.next == 0 || self.next == crate::storage::page::INVALID_PAGE_NUM {
            return Ok(None);
        }
        let page = self.pool.fetch_page(PageId::new(self.fid, self.next))?;
        let guard = page.read();
        let view = OverflowPage::new(&guard);
        let chunk = view.content().to_vec();
        self.next = view.next_page_num() as PageNum;
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::registry::FileRegistry;
    use crate::storage::disk::DiskManager;
    use tempfile::tempdir;

    const PAGE: usize = 256;

    fn pool(dir: &std::path::Path) -> (Arc<BufferPool>, FileId) {
        let registry = Arc::new(FileRegistry::new());
        let fid = registry.register(dir.join("t.ndb")).unwrap();
        let disk = DiskManager::new(registry, PAGE);
        (BufferPool::new(disk, 8, 2), fid)
    }

    #[test]
    fn chain_round_trips_ten_pages_worth() {
        let tmp = tempdir().unwrap();
        let (pool, fid) = pool(tmp.path());

        let value: Vec<u8> = (0..PAGE * 10).map(|i| (i % 251) as u8).collect();
        let head = build_chain(&pool, fid, &value).unwrap();
        assert!(head > 0);

        let back = read_chain(&pool, fid, head).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn chunks_stream_in_forward_order() {
        let tmp = tempdir().unwrap();
        let (pool, fid) = pool(tmp.path());

        let mut value = vec![b'a'; max_content(PAGE)];
        value.extend(vec![b'b'; max_content(PAGE)]);
        value.extend(vec![b'c'; 10]);
        let head = build_chain(&pool, fid, &value).unwrap();

        let mut reader = OverflowChainReader::new(pool.clone(), fid, head);
        assert_eq!(reader.next_chunk().unwrap().unwrap()[0], b'a');
        assert_eq!(reader.next_chunk().unwrap().unwrap()[0], b'b');
        let last = reader.next_chunk().unwrap().unwrap();
        assert_eq!(last, vec![b'c'; 10]);
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn release_returns_pages_to_the_freelist() {
        let tmp = tempdir().unwrap();
        let (pool, fid) = pool(tmp.path());

        let value = vec![7u8; PAGE * 3];
        let head = build_chain(&pool, fid, &value).unwrap();
        release_chain(&pool, fid, head).unwrap();

        // Freed pages are recycled before the file grows.
        let reused = pool.new_page(fid).unwrap();
        assert!(reused.page_id().page_num <= 4);
    }
}
