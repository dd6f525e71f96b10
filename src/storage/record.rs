//! Record byte layout.
//!
//! A record is laid out as:
//! - the fixed area: every column at its schema-declared offset.
//!   Variable-length columns occupy a (payload-offset u16,
//!   payload-size u16) pair here.
//! - a null bitmap of ceil(columns / 8) bytes; bit i set means column
//!   i is NULL.
//! - the variable-length payloads, appended in declaration order.
//!
//! A payload that was spilled to an overflow chain stores
//! `OVERFLOW_SIZE_MARKER` as its size and the first overflow page
//! number as a 4-byte payload.

use byteorder::{ByteOrder, LittleEndian};

use crate::core::errors::{NileDbError, Result};
use crate::storage::page::PageNum;

/// Size sentinel marking a variable-length slot whose payload lives in
/// an overflow chain.
pub const OVERFLOW_SIZE_MARKER: u16 = u16::MAX;

/// The fixed-area shape of a table's records, enough for the heap to
/// walk a record without the full schema: where the variable-length
/// slots are, and where the null bitmap starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLayout {
    pub fixed_size: u16,
    pub num_cols: usize,
    /// (column index, fixed-area offset) of each variable-length column.
    pub var_cols: Vec<(usize, u16)>,
}

impl RecordLayout {
    pub fn bitmap_size(&self) -> usize {
        self.num_cols.div_ceil(8)
    }

    pub fn bitmap_offset(&self) -> usize {
        self.fixed_size as usize
    }

    /// Total size of the fixed area plus bitmap; variable payloads
    /// start here.
    pub fn payload_offset(&self) -> usize {
        self.fixed_size as usize + self.bitmap_size()
    }
}

/// Read-only view over one record's bytes.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    data: &'a [u8],
}

impl<'a> Record<'a> {
    pub fn new(data: &'a [u8]) -> Record<'a> {
        Record { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn fixed(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        if offset + len > self.data.len() {
            return Err(NileDbError::InvalidArg(format!(
                "fixed read {offset}+{len} outside record of {} bytes",
                self.data.len()
            )));
        }
        Ok(&self.data[offset..offset + len])
    }

    /// Decode the (payload-offset, payload-size) pair of a
    /// variable-length slot.
    pub fn var_slot(&self, offset: usize) -> Result<(u16, u16)> {
        let raw = self.fixed(offset, 4)?;
        Ok((
            LittleEndian::read_u16(&raw[0..2]),
            LittleEndian::read_u16(&raw[2..4]),
        ))
    }

    /// The payload bytes of an in-record variable-length slot. Fails
    /// on overflow slots; those only carry a page number.
    pub fn var_payload(&self, offset: usize) -> Result<&'a [u8]> {
        let (payload_off, size) = self.var_slot(offset)?;
        if size == OVERFLOW_SIZE_MARKER {
            return Err(NileDbError::InvalidArg(
                "payload lives in an overflow chain".into(),
            ));
        }
        self.fixed(payload_off as usize, size as usize)
    }

    /// The overflow chain head if this slot was spilled.
    pub fn overflow_head(&self, offset: usize) -> Result<Option<PageNum>> {
        let (payload_off, size) = self.var_slot(offset)?;
        if size != OVERFLOW_SIZE_MARKER {
            return Ok(None);
        }
        let raw = self.fixed(payload_off as usize, 4)?;
        Ok(Some(LittleEndian::read_i32(raw)))
    }

    pub fn is_null(&self, layout: &RecordLayout, col: usize) -> Result<bool> {
        let byte = self.fixed(layout.bitmap_offset() + col / 8, 1)?;
        Ok(byte[0] & (1 << (col % 8)) != 0)
    }
}

/// Incremental builder for a record's bytes. Fixed values are placed
/// at their declared offsets, variable payloads appended in call
/// order.
#[derive(Debug)]
pub struct RecordBuilder {
    data: Vec<u8>,
    layout: RecordLayout,
    next_payload: u16,
}

impl RecordBuilder {
    /// `var_total` is the summed size of all in-record variable
    /// payloads (spilled columns count 4 bytes for the page number).
    pub fn new(layout: RecordLayout, var_total: usize) -> RecordBuilder {
        let total = layout.payload_offset() + var_total;
        RecordBuilder {
            data: vec![0u8; total],
            next_payload: layout.payload_offset() as u16,
            layout,
        }
    }

    pub fn put_fixed(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn put_var(&mut self, offset: usize, payload: &[u8]) {
        let at = self.next_payload;
        LittleEndian::write_u16(&mut self.data[offset..offset + 2], at);
        LittleEndian::write_u16(
            &mut self.data[offset + 2..offset + 4],
            payload.len() as u16,
        );
        self.data[at as usize..at as usize + payload.len()].copy_from_slice(payload);
        self.next_payload += payload.len() as u16;
    }

    /// A variable slot whose payload went to an overflow chain: size
    /// marker plus the 4-byte head page number.
    pub fn put_overflow(&mut self, offset: usize, head: PageNum) {
        let at = self.next_payload;
        LittleEndian::write_u16(&mut self.data[offset..offset + 2], at);
        LittleEndian::write_u16(
            &mut self.data[offset + 2..offset + 4],
            OVERFLOW_SIZE_MARKER,
        );
        LittleEndian::write_i32(&mut self.data[at as usize..at as usize + 4], head);
        self.next_payload += 4;
    }

    pub fn set_null(&mut self, col: usize) {
        let at = self.layout.bitmap_offset() + col / 8;
        self.data[at] |= 1 << (col % 8);
    }

    pub fn finish(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> RecordLayout {
        // (i INT @0, s VARCHAR @4, t VARCHAR @8)
        RecordLayout {
            fixed_size: 12,
            num_cols: 3,
            var_cols: vec![(1, 4), (2, 8)],
        }
    }

    #[test]
    fn build_and_read_back() {
        let l = layout();
        let mut b = RecordBuilder::new(l.clone(), 5 + 3);
        b.put_fixed(0, &7i32.to_le_bytes());
        b.put_var(4, b"alpha");
        b.put_var(8, b"xyz");
        let bytes = b.finish();

        let r = Record::new(&bytes);
        assert_eq!(r.fixed(0, 4).unwrap(), &7i32.to_le_bytes());
        assert_eq!(r.var_payload(4).unwrap(), b"alpha");
        assert_eq!(r.var_payload(8).unwrap(), b"xyz");
        assert!(!r.is_null(&l, 0).unwrap());
        assert_eq!(r.overflow_head(4).unwrap(), None);
    }

    #[test]
    fn null_bitmap_round_trips() {
        let l = layout();
        let mut b = RecordBuilder::new(l.clone(), 0);
        b.put_var(4, b"");
        b.put_var(8, b"");
        b.set_null(0);
        b.set_null(2);
        let bytes = b.finish();

        let r = Record::new(&bytes);
        assert!(r.is_null(&l, 0).unwrap());
        assert!(!r.is_null(&l, 1).unwrap());
        assert!(r.is_null(&l, 2).unwrap());
    }

    #[test]
    fn overflow_slot_carries_the_head_page() {
        let l = layout();
        let mut b = RecordBuilder::new(l.clone(), 4 + 2);
        b.put_fixed(0, &1i32.to_le_bytes());
        b.put_overflow(4, 17);
        b.put_var(8, b"ok");
        let bytes = b.finish();

        let r = Record::new(&bytes);
        assert_eq!(r.overflow_head(4).unwrap(), Some(17));
        assert!(r.var_payload(4).is_err());
        assert_eq!(r.var_payload(8).unwrap(), b"ok");
    }
}
