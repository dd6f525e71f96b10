//! Slotted data page.
//!
//! Header layout (little-endian), offsets in bytes:
//!   0: page number (u32)
//!   4: previous sibling page number (u32, 0 = none)
//!   8: next sibling page number (u32, 0 = none)
//!  12: free-space offset (u32) - one past the last byte used by
//!      records, which grow down from the end of the page
//!  16: slot count (u32)
//!  20: slot directory; 8-byte entries of (record-offset u32,
//!      record-size u32). A record-offset of 0 tombstones the slot.
//!
//! Deletes only tombstone; bytes are reclaimed when a later insert
//! recycles the slot. Live records are never moved.

use byteorder::{ByteOrder, LittleEndian};

use crate::core::errors::{NileDbError, Result};

pub const DATA_PAGE_HEADER_SIZE: usize = 20;
pub const SLOT_ENTRY_SIZE: usize = 8;

const PAGE_NUM_OFFSET: usize = 0;
const PREV_PAGE_OFFSET: usize = 4;
const NEXT_PAGE_OFFSET: usize = 8;
const FREE_SPACE_OFFSET: usize = 12;
const SLOT_COUNT_OFFSET: usize = 16;

/// Read-only view over a slotted page's bytes.
#[derive(Debug, Clone, Copy)]
pub struct DataPage<'a> {
    buf: &'a [u8],
}

impl<'a> DataPage<'a> {
    pub fn new(buf: &'a [u8]) -> DataPage<'a> {
        DataPage { buf }
    }

    pub fn page_num(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[PAGE_NUM_OFFSET..])
    }

    pub fn prev_page_num(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[PREV_PAGE_OFFSET..])
    }

    pub fn next_page_num(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[NEXT_PAGE_OFFSET..])
    }

    pub fn free_space_offset(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[FREE_SPACE_OFFSET..])
    }

    pub fn slot_count(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[SLOT_COUNT_OFFSET..])
    }

    /// (record-offset, record-size); offset 0 means tombstoned.
    pub fn slot(&self, idx: u32) -> Result<(u32, u32)> {
        if idx >= self.slot_count() {
            return Err(NileDbError::InvalidArg(format!(
                "slot {idx} out of bounds (count {})",
                self.slot_count()
            )));
        }
        let at = DATA_PAGE_HEADER_SIZE + idx as usize * SLOT_ENTRY_SIZE;
        Ok((
            LittleEndian::read_u32(&self.buf[at..]),
            LittleEndian::read_u32(&self.buf[at + 4..]),
        ))
    }

    /// A read-only view of a live record's bytes.
    pub fn record(&self, idx: u32) -> Result<&'a [u8]> {
        let (off, size) = self.slot(idx)?;
        if off == 0 {
            return Err(NileDbError::NotFound(format!(
                "slot {idx} is tombstoned"
            )));
        }
        let (off, size) = (off as usize, size as usize);
        if off < self.slots_end() || off + size > self.buf.len() {
            return Err(NileDbError::InvalidArg(format!(
                "slot {idx} points outside the page: off={off} size={size}"
            )));
        }
        Ok(&self.buf[off..off + size])
    }

    /// Contiguous free bytes between the slot directory and the record
    /// heap.
    pub fn free_space(&self) -> usize {
        (self.free_space_offset() as usize).saturating_sub(self.slots_end())
    }

    pub fn used_space(&self) -> usize {
        self.buf.len() - self.free_space()
    }

    fn slots_end(&self) -> usize {
        DATA_PAGE_HEADER_SIZE + self.slot_count() as usize * SLOT_ENTRY_SIZE
    }
}

/// Mutable view; `init` before first use of a fresh page.
#[derive(Debug)]
pub struct DataPageMut<'a> {
    buf: &'a mut [u8],
}

impl<'a> DataPageMut<'a> {
    pub fn new(buf: &'a mut [u8]) -> DataPageMut<'a> {
        DataPageMut { buf }
    }

    pub fn as_ref(&self) -> DataPage<'_> {
        DataPage::new(self.buf)
    }

    pub fn init(&mut self, page_num: u32) {
        self.buf.fill(0);
        let len = self.buf.len() as u32;
        LittleEndian::write_u32(&mut self.buf[PAGE_NUM_OFFSET..], page_num);
        LittleEndian::write_u32(&mut self.buf[FREE_SPACE_OFFSET..], len);
    }

    pub fn set_prev_page_num(&mut self, page_num: u32) {
        LittleEndian::write_u32(&mut self.buf[PREV_PAGE_OFFSET..], page_num);
    }

    pub fn set_next_page_num(&mut self, page_num: u32) {
        LittleEndian::write_u32(&mut self.buf[NEXT_PAGE_OFFSET..], page_num);
    }

    /// Insert a record, recycling a tombstoned slot when one exists.
    /// Fails when neither the bytes nor a fresh slot entry fit.
    pub fn insert_record(&mut self, record: &[u8]) -> Result<u32> {
        let view = self.as_ref();
        let slot_count = view.slot_count();
        let mut target = None;
        for idx in 0..slot_count {
            if view.slot(idx)?.0 == 0 {
                target = Some(idx);
                break;
            }
        }

        let free = view.free_space();
        let idx = match target {
            Some(idx) if free >= record.len() => idx,
            None if free >= record.len() + SLOT_ENTRY_SIZE => {
                LittleEndian::write_u32(&mut self.buf[SLOT_COUNT_OFFSET..], slot_count + 1);
                slot_count
            }
            _ => {
                return Err(NileDbError::InvalidArg(format!(
                    "page full: {} free, {} needed",
                    free,
                    record.len()
                )))
            }
        };

        let fso = LittleEndian::read_u32(&self.buf[FREE_SPACE_OFFSET..]);
        let new_fso = fso - record.len() as u32;
        self.buf[new_fso as usize..fso as usize].copy_from_slice(record);
        LittleEndian::write_u32(&mut self.buf[FREE_SPACE_OFFSET..], new_fso);

        let at = DATA_PAGE_HEADER_SIZE + idx as usize * SLOT_ENTRY_SIZE;
        LittleEndian::write_u32(&mut self.buf[at..], new_fso);
        LittleEndian::write_u32(&mut self.buf[at + 4..], record.len() as u32);
        Ok(idx)
    }

    /// Tombstone a slot. The record bytes stay where they are.
    pub fn delete_record(&mut self, idx: u32) -> Result<()> {
        let view = self.as_ref();
        let (off, _) = view.slot(idx)?;
        if off == 0 {
            return Err(NileDbError::NotFound(format!(
                "slot {idx} already tombstoned"
            )));
        }
        let at = DATA_PAGE_HEADER_SIZE + idx as usize * SLOT_ENTRY_SIZE;
        self.buf[at..at + SLOT_ENTRY_SIZE].fill(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 256;

    fn fresh() -> Vec<u8> {
        let mut buf = vec![0u8; PAGE];
        DataPageMut::new(&mut buf).init(1);
        buf
    }

    #[test]
    fn insert_then_read_back() {
        let mut buf = fresh();
        let mut page = DataPageMut::new(&mut buf);
        let a = page.insert_record(b"alpha").unwrap();
        let b = page.insert_record(b"beta").unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);

        let view = page.as_ref();
        assert_eq!(view.record(a).unwrap(), b"alpha");
        assert_eq!(view.record(b).unwrap(), b"beta");
        assert_eq!(view.slot_count(), 2);
    }

    #[test]
    fn delete_tombstones_and_insert_recycles() {
        let mut buf = fresh();
        let mut page = DataPageMut::new(&mut buf);
        page.insert_record(b"alpha").unwrap();
        let b = page.insert_record(b"beta").unwrap();
        page.insert_record(b"gamma").unwrap();

        page.delete_record(b).unwrap();
        assert!(page.as_ref().record(b).is_err());

        // The tombstoned slot is reused; the directory does not grow.
        let again = page.insert_record(b"delta").unwrap();
        assert_eq!(again, b);
        assert_eq!(page.as_ref().slot_count(), 3);
        assert_eq!(page.as_ref().record(again).unwrap(), b"delta");
    }

    #[test]
    fn live_records_never_overlap() {
        let mut buf = fresh();
        let mut page = DataPageMut::new(&mut buf);
        for i in 0..8u8 {
            page.insert_record(&[i; 16]).unwrap();
        }
        page.delete_record(3).unwrap();
        page.insert_record(&[99; 10]).unwrap();

        let view = page.as_ref();
        let mut ranges = Vec::new();
        for idx in 0..view.slot_count() {
            let (off, size) = view.slot(idx).unwrap();
            if off == 0 {
                continue;
            }
            ranges.push((off, off + size));
        }
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "records overlap: {pair:?}");
        }
    }

    #[test]
    fn page_full_is_reported() {
        let mut buf = fresh();
        let mut page = DataPageMut::new(&mut buf);
        page.insert_record(&[1; 100]).unwrap();
        page.insert_record(&[2; 100]).unwrap();
        let err = page.insert_record(&[3; 100]).unwrap_err();
        assert!(matches!(err, NileDbError::InvalidArg(_)));
    }

    #[test]
    fn free_space_accounting() {
        let mut buf = fresh();
        let mut page = DataPageMut::new(&mut buf);
        let before = page.as_ref().free_space();
        assert_eq!(before, PAGE - DATA_PAGE_HEADER_SIZE);
        page.insert_record(&[0; 30]).unwrap();
        assert_eq!(page.as_ref().free_space(), before - 30 - SLOT_ENTRY_SIZE);
        // Tombstoning does not reclaim free space.
        page.delete_record(0).unwrap();
        assert_eq!(page.as_ref().free_space(), before - 30 - SLOT_ENTRY_SIZE);
    }
}
