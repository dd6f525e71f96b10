//! Table schemas and tuple <-> record translation.
//!
//! Columns live at fixed offsets assigned in declaration order;
//! variable-length columns occupy a 4-byte (offset, size) pair in the
//! fixed area. Translation writes the null bitmap and packs
//! variable payloads after it; a payload the catalog spilled to an
//! overflow chain is encoded as the chain's head page number with the
//! size marker.

use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};

use crate::core::errors::{NileDbError, Result};
use crate::core::value::{DataType, Value};
use crate::storage::page::PageNum;
use crate::storage::record::{Record, RecordBuilder, RecordLayout, OVERFLOW_SIZE_MARKER};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub dtype: DataType,
    pub offset: u16,
    pub nullable: bool,
    pub primary: bool,
    pub foreign: bool,
    pub unique: bool,
}

/// Column description handed to `create_table`; offsets are assigned
/// by the schema.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: String,
    pub dtype: DataType,
    pub nullable: bool,
    pub primary: bool,
    pub foreign: bool,
    pub unique: bool,
}

impl ColumnSpec {
    pub fn new(name: &str, dtype: DataType) -> ColumnSpec {
        ColumnSpec {
            name: name.to_string(),
            dtype,
            nullable: true,
            primary: false,
            foreign: false,
            unique: false,
        }
    }

    pub fn not_null(mut self) -> ColumnSpec {
        self.nullable = false;
        self
    }

    pub fn primary(mut self) -> ColumnSpec {
        self.primary = true;
        self
    }

    pub fn unique(mut self) -> ColumnSpec {
        self.unique = true;
        self
    }
}

/// A decoded record field: either a plain value or a varchar whose
/// payload lives in an overflow chain.
#[derive(Debug, Clone, PartialEq)]
pub enum RawField {
    Value(Value),
    OverflowVarchar(PageNum),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    table_name: String,
    columns: Vec<Column>,
    fixed_size: u16,
}

impl TableSchema {
    /// Build a schema from column specs, assigning offsets in
    /// declaration order.
    pub fn from_specs(table_name: &str, specs: &[ColumnSpec]) -> Result<TableSchema> {
        if specs.is_empty() {
            return Err(NileDbError::InvalidArg(format!(
                "table {table_name} needs at least one column"
            )));
        }
        let mut columns = Vec::with_capacity(specs.len());
        let mut offset = 0u16;
        for spec in specs {
            if spec.name.is_empty() {
                return Err(NileDbError::InvalidArg("empty column name".into()));
            }
            if columns.iter().any(|c: &Column| c.name == spec.name) {
                return Err(NileDbError::InvalidArg(format!(
                    "duplicate column {} in table {table_name}",
                    spec.name
                )));
            }
            columns.push(Column {
                name: spec.name.clone(),
                dtype: spec.dtype,
                offset,
                nullable: spec.nullable,
                primary: spec.primary,
                foreign: spec.foreign,
                unique: spec.unique,
            });
            offset += spec.dtype.fixed_size();
        }
        Ok(TableSchema {
            table_name: table_name.to_string(),
            columns,
            fixed_size: offset,
        })
    }

    /// Rebuild a schema from persisted columns (already carrying their
    /// offsets).
    pub fn from_columns(table_name: &str, mut columns: Vec<Column>) -> TableSchema {
        columns.sort_by_key(|c| c.offset);
        let fixed_size = columns.iter().map(|c| c.dtype.fixed_size()).sum();
        TableSchema {
            table_name: table_name.to_string(),
            columns,
            fixed_size,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn num_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn fixed_size(&self) -> u16 {
        self.fixed_size
    }

    pub fn col_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn layout(&self) -> RecordLayout {
        RecordLayout {
            fixed_size: self.fixed_size,
            num_cols: self.columns.len(),
            var_cols: self
                .columns
                .iter()
                .enumerate()
                .filter(|(_, c)| c.dtype.is_var_length())
                .map(|(i, c)| (i, c.offset))
                .collect(),
        }
    }

    /// Arity, type and nullability checks for an incoming tuple.
    pub fn validate_tuple(&self, values: &[Value]) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(NileDbError::SchemaMismatch(format!(
                "table {} takes {} columns, got {}",
                self.table_name,
                self.columns.len(),
                values.len()
            )));
        }
        for (value, col) in values.iter().zip(&self.columns) {
            if value.is_null() {
                if !col.nullable {
                    return Err(NileDbError::SchemaMismatch(format!(
                        "column {}.{} is not nullable",
                        self.table_name, col.name
                    )));
                }
                continue;
            }
            if !value.matches(col.dtype) {
                return Err(NileDbError::SchemaMismatch(format!(
                    "column {}.{} expects {:?}",
                    self.table_name, col.name, col.dtype
                )));
            }
        }
        Ok(())
    }

    /// Size the record would have with the given spill set.
    pub fn record_size(&self, values: &[Value], overflow: &HashMap<usize, PageNum>) -> usize {
        let layout = self.layout();
        let var_total: usize = layout
            .var_cols
            .iter()
            .map(|&(col, _)| match (&values[col], overflow.contains_key(&col)) {
                (_, true) => 4,
                (Value::Varchar(s), false) => s.len(),
                _ => 0,
            })
            .sum();
        layout.payload_offset() + var_total
    }

    /// Encode a validated tuple; `overflow` maps a column index to the
    /// chain head its payload was spilled to.
    pub fn encode_record(
        &self,
        values: &[Value],
        overflow: &HashMap<usize, PageNum>,
    ) -> Result<Vec<u8>> {
        self.validate_tuple(values)?;
        let layout = self.layout();
        let var_total = self.record_size(values, overflow) - layout.payload_offset();
        let mut builder = RecordBuilder::new(layout, var_total);

        for (i, (value, col)) in values.iter().zip(&self.columns).enumerate() {
            let offset = col.offset as usize;
            if let Some(&head) = overflow.get(&i) {
                builder.put_overflow(offset, head);
                continue;
            }
            match value {
                Value::Null => {
                    if col.dtype.is_var_length() {
                        builder.put_var(offset, b"");
                    }
                    builder.set_null(i);
                }
                Value::Boolean(b) => builder.put_fixed(offset, &[*b as u8]),
                Value::Int(v) => {
                    let mut raw = [0u8; 4];
                    LittleEndian::write_i32(&mut raw, *v);
                    builder.put_fixed(offset, &raw);
                }
                Value::BigInt(v) => {
                    let mut raw = [0u8; 8];
                    LittleEndian::write_i64(&mut raw, *v);
                    builder.put_fixed(offset, &raw);
                }
                Value::Float(v) => {
                    let mut raw = [0u8; 4];
                    LittleEndian::write_f32(&mut raw, *v);
                    builder.put_fixed(offset, &raw);
                }
                Value::Varchar(s) => builder.put_var(offset, s.as_bytes()),
            }
        }
        Ok(builder.finish())
    }

    /// Decode a record into per-column fields; overflow payloads are
    /// surfaced as chain heads for the caller to resolve.
    pub fn decode_record(&self, bytes: &[u8]) -> Result<Vec<RawField>> {
        let layout = self.layout();
        let record = Record::new(bytes);
        let mut fields = Vec::with_capacity(self.columns.len());
        for (i, col) in self.columns.iter().enumerate() {
            if record.is_null(&layout, i)? {
                fields.push(RawField::Value(Value::Null));
                continue;
            }
            let offset = col.offset as usize;
            let field = match col.dtype {
                DataType::Boolean => {
                    RawField::Value(Value::Boolean(record.fixed(offset, 1)?[0] != 0))
                }
                DataType::Int => RawField::Value(Value::Int(LittleEndian::read_i32(
                    record.fixed(offset, 4)?,
                ))),
                DataType::BigInt => RawField::Value(Value::BigInt(LittleEndian::read_i64(
                    record.fixed(offset, 8)?,
                ))),
                DataType::Float => RawField::Value(Value::Float(LittleEndian::read_f32(
                    record.fixed(offset, 4)?,
                ))),
                DataType::Varchar => {
                    let (_, size) = record.var_slot(offset)?;
                    if size == OVERFLOW_SIZE_MARKER {
                        let head = record
                            .overflow_head(offset)?
                            .expect("marker implies a chain head");
                        RawField::OverflowVarchar(head)
                    } else {
                        RawField::Value(Value::Varchar(
                            String::from_utf8_lossy(record.var_payload(offset)?).into_owned(),
                        ))
                    }
                }
            };
            fields.push(field);
        }
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TableSchema {
        TableSchema::from_specs(
            "t",
            &[
                ColumnSpec::new("id", DataType::Int).not_null(),
                ColumnSpec::new("name", DataType::Varchar),
                ColumnSpec::new("score", DataType::Float),
            ],
        )
        .unwrap()
    }

    #[test]
    fn offsets_follow_declaration_order() {
        let s = schema();
        let offsets: Vec<u16> = s.columns().iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 4, 8]);
        assert_eq!(s.fixed_size(), 12);
        assert_eq!(s.layout().var_cols, vec![(1, 4)]);
    }

    #[test]
    fn tuple_round_trips_through_a_record() {
        let s = schema();
        let tuple = vec![
            Value::Int(9),
            Value::Varchar("nile".into()),
            Value::Float(0.5),
        ];
        let bytes = s.encode_record(&tuple, &HashMap::new()).unwrap();
        let fields = s.decode_record(&bytes).unwrap();
        let expect: Vec<RawField> = tuple.into_iter().map(RawField::Value).collect();
        assert_eq!(fields, expect);
    }

    #[test]
    fn null_bitmap_round_trips() {
        let s = schema();
        let tuple = vec![Value::Int(1), Value::Null, Value::Null];
        let bytes = s.encode_record(&tuple, &HashMap::new()).unwrap();
        let fields = s.decode_record(&bytes).unwrap();
        assert_eq!(fields[1], RawField::Value(Value::Null));
        assert_eq!(fields[2], RawField::Value(Value::Null));
    }

    #[test]
    fn overflow_columns_carry_their_chain_head() {
        let s = schema();
        let tuple = vec![
            Value::Int(1),
            Value::Varchar("x".repeat(5000)),
            Value::Float(1.0),
        ];
        let mut overflow = HashMap::new();
        overflow.insert(1usize, 42 as PageNum);
        let bytes = s.encode_record(&tuple, &overflow).unwrap();
        // Spilled: the record holds just the 4-byte head.
        assert_eq!(bytes.len(), s.layout().payload_offset() + 4);
        let fields = s.decode_record(&bytes).unwrap();
        assert_eq!(fields[1], RawField::OverflowVarchar(42));
    }

    #[test]
    fn mismatched_tuples_are_rejected() {
        let s = schema();
        assert!(matches!(
            s.validate_tuple(&[Value::Int(1)]),
            Err(NileDbError::SchemaMismatch(_))
        ));
        assert!(matches!(
            s.validate_tuple(&[
                Value::Varchar("no".into()),
                Value::Varchar("x".into()),
                Value::Float(0.0)
            ]),
            Err(NileDbError::SchemaMismatch(_))
        ));
        assert!(matches!(
            s.validate_tuple(&[Value::Null, Value::Null, Value::Null]),
            Err(NileDbError::SchemaMismatch(_))
        ));
    }
}
