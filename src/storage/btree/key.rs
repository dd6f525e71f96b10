//! Self-describing composite index keys.
//!
//! A cell is `[field count: u8][one serial type per field][payloads in
//! field order]`. Serial types: 0 NULL (no payload), 1 INT32, 2 INT64,
//! 3 FLOAT32, >= 13 TEXT of length (type - 13). The per-field sort
//! direction lives out of band in a `SortOrder` bitmap owned by the
//! index; it is not stored in the page.
//!
//! A non-unique index appends the record's (page-num, slot-num) as two
//! INT32 fields, making every stored cell globally unique without any
//! special-casing in the comparator.

use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use crate::core::errors::{NileDbError, Result};
use crate::core::value::Value;
use crate::storage::page::{FileId, PageId, RecordId};

pub const SERIAL_NULL: u8 = 0;
pub const SERIAL_INT: u8 = 1;
pub const SERIAL_LONG: u8 = 2;
pub const SERIAL_FLOAT: u8 = 3;
pub const SERIAL_TEXT_BASE: u8 = 13;

const MAX_TEXT_LEN: usize = (u8::MAX - SERIAL_TEXT_BASE) as usize;

/// Per-field descending bitmap; bits beyond the map (the record-id
/// suffix of non-unique cells) read as ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortOrder {
    bits: Vec<u8>,
}

impl SortOrder {
    pub fn ascending() -> SortOrder {
        SortOrder::default()
    }

    pub fn from_desc_flags(flags: &[bool]) -> SortOrder {
        let mut bits = vec![0u8; flags.len().div_ceil(8)];
        for (i, desc) in flags.iter().enumerate() {
            if *desc {
                bits[i / 8] |= 1 << (i % 8);
            }
        }
        SortOrder { bits }
    }

    pub fn is_desc(&self, idx: usize) -> bool {
        self.bits
            .get(idx / 8)
            .map(|b| b & (1 << (idx % 8)) != 0)
            .unwrap_or(false)
    }
}

/// An owned, encoded composite key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexCell {
    data: Vec<u8>,
}

impl IndexCell {
    pub fn from_values(values: &[Value]) -> Result<IndexCell> {
        if values.is_empty() || values.len() > u8::MAX as usize {
            return Err(NileDbError::InvalidArg(format!(
                "index keys take 1..=255 fields, got {}",
                values.len()
            )));
        }
        let mut header = Vec::with_capacity(1 + values.len());
        let mut payload = Vec::new();
        header.push(values.len() as u8);
        for value in values {
            match value {
                Value::Null => header.push(SERIAL_NULL),
                Value::Int(v) => {
                    header.push(SERIAL_INT);
                    let mut raw = [0u8; 4];
                    LittleEndian::write_i32(&mut raw, *v);
                    payload.extend_from_slice(&raw);
                }
                Value::BigInt(v) => {
                    header.push(SERIAL_LONG);
                    let mut raw = [0u8; 8];
                    LittleEndian::write_i64(&mut raw, *v);
                    payload.extend_from_slice(&raw);
                }
                Value::Float(v) => {
                    header.push(SERIAL_FLOAT);
                    let mut raw = [0u8; 4];
                    LittleEndian::write_f32(&mut raw, *v);
                    payload.extend_from_slice(&raw);
                }
                Value::Varchar(s) => {
                    if s.len() > MAX_TEXT_LEN {
                        return Err(NileDbError::InvalidArg(format!(
                            "text key field of {} bytes exceeds {MAX_TEXT_LEN}",
                            s.len()
                        )));
                    }
                    header.push(SERIAL_TEXT_BASE + s.len() as u8);
                    payload.extend_from_slice(s.as_bytes());
                }
                Value::Boolean(_) => {
                    return Err(NileDbError::InvalidArg(
                        "boolean columns cannot be indexed".into(),
                    ))
                }
            }
        }
        header.extend_from_slice(&payload);
        Ok(IndexCell { data: header })
    }

    /// Key fields plus the (page-num, slot-num) suffix of `rid`.
    pub fn from_values_with_rid(values: &[Value], rid: RecordId) -> Result<IndexCell> {
        let mut all = values.to_vec();
        all.push(Value::Int(rid.page_id.page_num));
        all.push(Value::Int(rid.slot as i32));
        IndexCell::from_values(&all)
    }

    pub fn from_bytes(data: Vec<u8>) -> IndexCell {
        IndexCell { data }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn field_count(&self) -> usize {
        field_count(&self.data)
    }

    pub fn decode(&self) -> Result<Vec<Value>> {
        decode_values(&self.data)
    }

    /// Decode all fields except the last `n` (used to strip the
    /// record-id suffix of non-unique cells).
    pub fn decode_without_last(&self, n: usize) -> Result<Vec<Value>> {
        let mut values = self.decode()?;
        if values.len() < n {
            return Err(NileDbError::InvalidArg(format!(
                "cell has {} fields, cannot drop {n}",
                values.len()
            )));
        }
        values.truncate(values.len() - n);
        Ok(values)
    }

    /// Interpret the last two fields as a record id in `fid`.
    pub fn rid_suffix(&self, fid: FileId) -> Result<RecordId> {
        let values = self.decode()?;
        match values.as_slice() {
            [.., Value::Int(page_num), Value::Int(slot)] => Ok(RecordId::new(
                PageId::new(fid, *page_num),
                *slot as u32,
            )),
            _ => Err(NileDbError::InvalidArg(
                "cell does not end in a record-id suffix".into(),
            )),
        }
    }
}

pub fn field_count(cell: &[u8]) -> usize {
    cell.first().copied().unwrap_or(0) as usize
}

fn payload_len(serial: u8) -> usize {
    match serial {
        SERIAL_NULL => 0,
        SERIAL_INT | SERIAL_FLOAT => 4,
        SERIAL_LONG => 8,
        tag => (tag.saturating_sub(SERIAL_TEXT_BASE)) as usize,
    }
}

pub fn decode_values(cell: &[u8]) -> Result<Vec<Value>> {
    let n = field_count(cell);
    if cell.len() < 1 + n {
        return Err(NileDbError::InvalidArg("truncated index cell".into()));
    }
    let mut values = Vec::with_capacity(n);
    let mut at = 1 + n;
    for i in 0..n {
        let serial = cell[1 + i];
        let len = payload_len(serial);
        if at + len > cell.len() {
            return Err(NileDbError::InvalidArg("truncated index cell".into()));
        }
        let raw = &cell[at..at + len];
        at += len;
        values.push(match serial {
            SERIAL_NULL => Value::Null,
            SERIAL_INT => Value::Int(LittleEndian::read_i32(raw)),
            SERIAL_LONG => Value::BigInt(LittleEndian::read_i64(raw)),
            SERIAL_FLOAT => Value::Float(LittleEndian::read_f32(raw)),
            _ => Value::Varchar(String::from_utf8_lossy(raw).into_owned()),
        });
    }
    Ok(values)
}

/// Total order over encoded cells. Fields compare pairwise: NULL sorts
/// low, numerics by value, TEXT by memcmp; a set descending bit flips
/// the field's outcome. When one cell is a prefix of the other (seek
/// keys omit the record-id suffix), the shorter sorts first.
pub fn cmp_cells(lhs: &[u8], rhs: &[u8], order: &SortOrder) -> Ordering {
    let ln = field_count(lhs);
    let rn = field_count(rhs);
    let mut lat = 1 + ln;
    let mut rat = 1 + rn;
    for i in 0..ln.min(rn) {
        let lt = lhs[1 + i];
        let rt = rhs[1 + i];
        let llen = payload_len(lt);
        let rlen = payload_len(rt);
        let lraw = &lhs[lat..lat + llen];
        let rraw = &rhs[rat..rat + rlen];
        lat += llen;
        rat += rlen;

        let field = cmp_field(lt, rt, lraw, rraw);
        let field = if order.is_desc(i) { field.reverse() } else { field };
        if field != Ordering::Equal {
            return field;
        }
    }
    ln.cmp(&rn)
}

fn cmp_field(lt: u8, rt: u8, lraw: &[u8], rraw: &[u8]) -> Ordering {
    match (lt, rt) {
        (SERIAL_NULL, SERIAL_NULL) => Ordering::Equal,
        (SERIAL_NULL, _) => Ordering::Less,
        (_, SERIAL_NULL) => Ordering::Greater,
        (SERIAL_INT, SERIAL_INT) => {
            LittleEndian::read_i32(lraw).cmp(&LittleEndian::read_i32(rraw))
        }
        (SERIAL_LONG, SERIAL_LONG) => {
            LittleEndian::read_i64(lraw).cmp(&LittleEndian::read_i64(rraw))
        }
        (SERIAL_FLOAT, SERIAL_FLOAT) => LittleEndian::read_f32(lraw)
            .partial_cmp(&LittleEndian::read_f32(rraw))
            .unwrap_or(Ordering::Equal),
        (lt, rt) if lt >= SERIAL_TEXT_BASE && rt >= SERIAL_TEXT_BASE => lraw.cmp(rraw),
        // Heterogeneous fields only appear on corruption; keep the
        // order total by falling back to the tags.
        (lt, rt) => {
            debug_assert!(false, "comparing serial types {lt} and {rt}");
            lt.cmp(&rt)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(values: &[Value]) -> IndexCell {
        IndexCell::from_values(values).unwrap()
    }

    fn cmp(a: &IndexCell, b: &IndexCell, order: &SortOrder) -> Ordering {
        cmp_cells(a.bytes(), b.bytes(), order)
    }

    #[test]
    fn encode_decode_round_trip() {
        let values = vec![
            Value::Int(42),
            Value::Null,
            Value::Varchar("nile".into()),
            Value::BigInt(-7),
            Value::Float(2.5),
        ];
        let c = cell(&values);
        assert_eq!(c.field_count(), 5);
        assert_eq!(c.decode().unwrap(), values);
    }

    #[test]
    fn integers_order_by_value_not_bytes() {
        let asc = SortOrder::ascending();
        assert_eq!(
            cmp(&cell(&[Value::Int(-1)]), &cell(&[Value::Int(1)]), &asc),
            Ordering::Less
        );
        assert_eq!(
            cmp(&cell(&[Value::Int(256)]), &cell(&[Value::Int(300)]), &asc),
            Ordering::Less
        );
    }

    #[test]
    fn null_sorts_low_and_desc_flips() {
        let asc = SortOrder::ascending();
        let desc = SortOrder::from_desc_flags(&[true]);
        let null = cell(&[Value::Null]);
        let one = cell(&[Value::Int(1)]);
        assert_eq!(cmp(&null, &one, &asc), Ordering::Less);
        assert_eq!(cmp(&null, &one, &desc), Ordering::Greater);
        assert_eq!(cmp(&one, &cell(&[Value::Int(2)]), &desc), Ordering::Greater);
    }

    #[test]
    fn text_compares_bytewise() {
        let asc = SortOrder::ascending();
        let a = cell(&[Value::Varchar("alpha".into())]);
        let b = cell(&[Value::Varchar("beta".into())]);
        let a2 = cell(&[Value::Varchar("alphabet".into())]);
        assert_eq!(cmp(&a, &b, &asc), Ordering::Less);
        assert_eq!(cmp(&a, &a2, &asc), Ordering::Less);
    }

    #[test]
    fn composite_fields_break_ties_in_order() {
        let order = SortOrder::from_desc_flags(&[false, true]);
        let a = cell(&[Value::Int(1), Value::Int(10)]);
        let b = cell(&[Value::Int(1), Value::Int(20)]);
        let c = cell(&[Value::Int(2), Value::Int(0)]);
        // Second field is descending: 20 sorts before 10.
        assert_eq!(cmp(&b, &a, &order), Ordering::Less);
        assert_eq!(cmp(&a, &c, &order), Ordering::Less);
    }

    #[test]
    fn rid_suffix_disambiguates_duplicates() {
        let asc = SortOrder::ascending();
        let rid1 = RecordId::new(PageId::new(3, 7), 0);
        let rid2 = RecordId::new(PageId::new(3, 7), 1);
        let a = IndexCell::from_values_with_rid(&[Value::Int(5)], rid1).unwrap();
        let b = IndexCell::from_values_with_rid(&[Value::Int(5)], rid2).unwrap();
        assert_eq!(cmp(&a, &b, &asc), Ordering::Less);
        assert_eq!(a.rid_suffix(3).unwrap(), rid1);
        assert_eq!(a.decode_without_last(2).unwrap(), vec![Value::Int(5)]);
    }

    #[test]
    fn prefix_seek_keys_sort_before_their_extensions() {
        let asc = SortOrder::ascending();
        let seek = cell(&[Value::Int(5)]);
        let stored =
            IndexCell::from_values_with_rid(&[Value::Int(5)], RecordId::new(PageId::new(1, 1), 0))
                .unwrap();
        assert_eq!(cmp(&seek, &stored, &asc), Ordering::Less);
        let smaller = IndexCell::from_values_with_rid(
            &[Value::Int(4)],
            RecordId::new(PageId::new(1, 9), 9),
        )
        .unwrap();
        assert_eq!(cmp(&seek, &smaller, &asc), Ordering::Greater);
    }
}
