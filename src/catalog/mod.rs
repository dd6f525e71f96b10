//! The system catalog.
//!
//! Three reserved tables, bootstrapped at open, carry all metadata:
//! - `NILEDB_META_DATA`: one row per (table, column).
//! - `NDB_INDEX_META`: one row per index, including its root page
//!   number, rewritten in place (by remembered record id) whenever a
//!   root split or collapse moves the root.
//! - `NDB_INDEX_KEYS`: the ordered column list and per-field
//!   descending flags of every index.
//!
//! The catalog owns tuple <-> record translation: it spills oversized
//! variable-length payloads to overflow chains before handing records
//! to the heap, resolves chains back into values on reads, and fans
//! every user-table write out to the table's indexes.

pub mod schema;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use crate::core::errors::{NileDbError, Result, StorageError};
use crate::core::value::{DataType, Value};
use crate::storage::btree::iter::IndexIter;
use crate::storage::btree::key::{IndexCell, SortOrder};
use crate::storage::btree::BTreeIndex;
use crate::storage::buffer::BufferPool;
use crate::storage::disk::registry::FileRegistry;
use crate::storage::heap::fsm::FreeSpaceMap;
use crate::storage::heap::{overflow, Table, TableIter};
use crate::storage::page::{PageNum, RecordId, INVALID_PAGE_NUM};

use schema::{ColumnSpec, Column, RawField, TableSchema};

pub const META_TABLE: &str = "NILEDB_META_DATA";
pub const INDEX_META_TABLE: &str = "NDB_INDEX_META";
pub const INDEX_KEYS_TABLE: &str = "NDB_INDEX_KEYS";

/// Payloads smaller than this never spill; a chain head costs 4 bytes.
const MIN_SPILL_SIZE: usize = 5;

fn is_reserved(name: &str) -> bool {
    matches!(name, META_TABLE | INDEX_META_TABLE | INDEX_KEYS_TABLE)
}

#[derive(Debug)]
pub(crate) struct TableEntry {
    pub schema: TableSchema,
    pub table: Table,
}

#[derive(Debug)]
pub(crate) struct IndexEntry {
    pub name: String,
    pub table_name: String,
    /// (column index, descending) in key order.
    pub fields: Vec<(usize, bool)>,
    pub index: BTreeIndex,
    meta_rid: Mutex<RecordId>,
    persisted_root: Mutex<PageNum>,
}

#[derive(Debug)]
pub struct Catalog {
    pool: Arc<BufferPool>,
    registry: Arc<FileRegistry>,
    dir: PathBuf,
    meta: Arc<TableEntry>,
    index_meta: Arc<TableEntry>,
    index_keys: Arc<TableEntry>,
    tables: RwLock<HashMap<String, Arc<TableEntry>>>,
    indexes: RwLock<HashMap<String, Arc<IndexEntry>>>,
    table_indexes: RwLock<HashMap<String, Vec<String>>>,
}

fn meta_schema() -> TableSchema {
    TableSchema::from_specs(
        META_TABLE,
        &[
            ColumnSpec::new("table_name", DataType::Varchar),
            ColumnSpec::new("col_name", DataType::Varchar),
            ColumnSpec::new("col_type", DataType::Int),
            ColumnSpec::new("col_offset", DataType::Int),
            ColumnSpec::new("nullable", DataType::Boolean),
            ColumnSpec::new("primary", DataType::Boolean),
            ColumnSpec::new("foreign", DataType::Boolean),
            ColumnSpec::new("unique", DataType::Boolean),
        ],
    )
    .expect("hardcoded meta schema")
}

fn index_meta_schema() -> TableSchema {
    TableSchema::from_specs(
        INDEX_META_TABLE,
        &[
            ColumnSpec::new("index_name", DataType::Varchar),
            ColumnSpec::new("table_name", DataType::Varchar),
            ColumnSpec::new("file_id", DataType::Int),
            ColumnSpec::new("root_page_num", DataType::Int),
            ColumnSpec::new("is_unique", DataType::Boolean),
            ColumnSpec::new("nkey_cols", DataType::Int),
        ],
    )
    .expect("hardcoded index meta schema")
}

fn index_keys_schema() -> TableSchema {
    TableSchema::from_specs(
        INDEX_KEYS_TABLE,
        &[
            ColumnSpec::new("index_name", DataType::Varchar),
            ColumnSpec::new("col_idx", DataType::Int),
            ColumnSpec::new("desc", DataType::Boolean),
            ColumnSpec::new("position", DataType::Int),
        ],
    )
    .expect("hardcoded index keys schema")
}

impl Catalog {
    /// Open the reserved tables and load every persisted schema and
    /// index header.
    pub fn bootstrap(
        pool: Arc<BufferPool>,
        registry: Arc<FileRegistry>,
        dir: &Path,
    ) -> Result<Catalog> {
        let meta = open_entry(&pool, &registry, dir, meta_schema())?;
        let index_meta = open_entry(&pool, &registry, dir, index_meta_schema())?;
        let index_keys = open_entry(&pool, &registry, dir, index_keys_schema())?;
        let catalog = Catalog {
            pool,
            registry,
            dir: dir.to_path_buf(),
            meta,
            index_meta,
            index_keys,
            tables: RwLock::new(HashMap::new()),
            indexes: RwLock::new(HashMap::new()),
            table_indexes: RwLock::new(HashMap::new()),
        };
        catalog.load_tables()?;
        catalog.load_indexes()?;
        info!(
            "catalog open: {} tables, {} indexes",
            catalog.tables.read().len(),
            catalog.indexes.read().len()
        );
        Ok(catalog)
    }

    fn load_tables(&self) -> Result<()> {
        let mut columns: HashMap<String, Vec<Column>> = HashMap::new();
        for item in self.meta.table.iter()? {
            let (_, bytes) = item?;
            let row = self.resolve_fields(&self.meta, self.meta.schema.decode_record(&bytes)?)?;
            let table_name = as_str(&row[0])?;
            let dtype = DataType::from_i32(as_int(&row[2])?).ok_or_else(|| {
                StorageError(format!("unknown column type in schema row for {table_name}"))
            })?;
            columns.entry(table_name.clone()).or_default().push(Column {
                name: as_str(&row[1])?,
                dtype,
                offset: as_int(&row[3])? as u16,
                nullable: as_bool(&row[4])?,
                primary: as_bool(&row[5])?,
                foreign: as_bool(&row[6])?,
                unique: as_bool(&row[7])?,
            });
        }
        let mut tables = self.tables.write();
        for (name, cols) in columns {
            let schema = TableSchema::from_columns(&name, cols);
            let entry = open_entry(&self.pool, &self.registry, &self.dir, schema)?;
            tables.insert(name, entry);
        }
        Ok(())
    }

    fn load_indexes(&self) -> Result<()> {
        // Ordered key columns per index.
        let mut keys: HashMap<String, Vec<(i32, usize, bool)>> = HashMap::new();
        for item in self.index_keys.table.iter()? {
            let (_, bytes) = item?;
            let row = self
                .resolve_fields(&self.index_keys, self.index_keys.schema.decode_record(&bytes)?)?;
            keys.entry(as_str(&row[0])?).or_default().push((
                as_int(&row[3])?,
                as_int(&row[1])? as usize,
                as_bool(&row[2])?,
            ));
        }
        for fields in keys.values_mut() {
            fields.sort_by_key(|(position, _, _)| *position);
        }

        for item in self.index_meta.table.iter()? {
            let (rid, bytes) = item?;
            let row = self
                .resolve_fields(&self.index_meta, self.index_meta.schema.decode_record(&bytes)?)?;
            let name = as_str(&row[0])?;
            let table_name = as_str(&row[1])?;
            let root = as_int(&row[3])?;
            let unique = as_bool(&row[4])?;
            let fields: Vec<(usize, bool)> = keys
                .get(&name)
                .map(|f| f.iter().map(|&(_, ci, desc)| (ci, desc)).collect())
                .unwrap_or_default();
            if fields.is_empty() {
                return Err(StorageError(format!("index {name} has no key columns")).into());
            }
            let table_fid = {
                let tables = self.tables.read();
                let entry = tables.get(&table_name).ok_or_else(|| {
                    StorageError(format!("index {name} references missing table {table_name}"))
                })?;
                entry.table.fid()
            };
            // Index files are resolved by name; the persisted file_id
            // is informational only.
            let fid = self
                .registry
                .register(self.dir.join(format!("{name}.ndb")))?;
            let order = SortOrder::from_desc_flags(
                &fields.iter().map(|&(_, desc)| desc).collect::<Vec<_>>(),
            );
            let index = BTreeIndex::new(self.pool.clone(), fid, table_fid, unique, order, root);
            self.indexes.write().insert(
                name.clone(),
                Arc::new(IndexEntry {
                    name: name.clone(),
                    table_name: table_name.clone(),
                    fields,
                    index,
                    meta_rid: Mutex::new(rid),
                    persisted_root: Mutex::new(root),
                }),
            );
            self.table_indexes
                .write()
                .entry(table_name)
                .or_default()
                .push(name);
        }
        Ok(())
    }

    pub fn schema(&self, name: &str) -> Option<TableSchema> {
        self.tables.read().get(name).map(|e| e.schema.clone())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    pub fn index_names_of(&self, table: &str) -> Vec<String> {
        self.table_indexes
            .read()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Create a table: allocate its heap and FSM files, register the
    /// in-memory schema, and persist one meta row per column.
    pub fn create_table(&self, name: &str, specs: &[ColumnSpec]) -> Result<TableSchema> {
        if name.is_empty() || is_reserved(name) {
            return Err(NileDbError::InvalidArg(format!(
                "table name {name:?} is reserved or empty"
            )));
        }
        if self.tables.read().contains_key(name) {
            return Err(NileDbError::InvalidArg(format!("table {name} already exists")));
        }
        let schema = TableSchema::from_specs(name, specs)?;
        if schema.layout().payload_offset() + MIN_SPILL_SIZE > self.pool.page_size() / 2 {
            return Err(NileDbError::SchemaMismatch(format!(
                "fixed part of table {name} cannot fit half a page"
            )));
        }
        let entry = open_entry(&self.pool, &self.registry, &self.dir, schema.clone())?;
        for col in schema.columns() {
            let row = vec![
                Value::Varchar(name.to_string()),
                Value::Varchar(col.name.clone()),
                Value::Int(col.dtype as i32),
                Value::Int(col.offset as i32),
                Value::Boolean(col.nullable),
                Value::Boolean(col.primary),
                Value::Boolean(col.foreign),
                Value::Boolean(col.unique),
            ];
            self.insert_into(&self.meta, &row)?;
        }
        self.tables.write().insert(name.to_string(), entry);
        debug!("created table {name} with {} columns", specs.len());
        Ok(schema)
    }

    /// Drop a table: its indexes first, then the data chain and the
    /// free-space map, then the schema rows.
    pub fn delete_table(&self, name: &str) -> Result<()> {
        let entry = self
            .tables
            .write()
            .remove(name)
            .ok_or_else(|| NileDbError::NotFound(format!("no table {name}")))?;
        let index_names = self.table_indexes.write().remove(name).unwrap_or_default();
        for index_name in index_names {
            if let Some(idx) = self.indexes.write().remove(&index_name) {
                self.remove_index_rows(&idx)?;
                self.pool.delete_file(idx.index.fid())?;
            }
        }

        let mut doomed = Vec::new();
        for item in self.meta.table.iter()? {
            let (rid, bytes) = item?;
            let row = self.resolve_fields(&self.meta, self.meta.schema.decode_record(&bytes)?)?;
            if as_str(&row[0])? == name {
                doomed.push(rid);
            }
        }
        for rid in doomed {
            self.meta.table.delete_record(rid)?;
        }

        let fsm_fid = self
            .registry
            .register(self.dir.join(format!("{name}_fsm.ndb")))?;
        self.pool.delete_file(entry.table.fid())?;
        self.pool.delete_file(fsm_fid)?;
        Ok(())
    }

    /// Create an index and backfill it from the table's current rows.
    pub fn create_index(
        &self,
        table: &str,
        name: &str,
        fields: &[(&str, bool)],
        unique: bool,
    ) -> Result<()> {
        if name.is_empty() || is_reserved(name) {
            return Err(NileDbError::InvalidArg(format!(
                "index name {name:?} is reserved or empty"
            )));
        }
        if self.indexes.read().contains_key(name) {
            return Err(NileDbError::InvalidArg(format!("index {name} already exists")));
        }
        if fields.is_empty() {
            return Err(NileDbError::InvalidArg(format!(
                "index {name} needs at least one column"
            )));
        }
        let entry = self.user_table(table)?;
        let mut field_idxs = Vec::with_capacity(fields.len());
        for (col_name, desc) in fields {
            let ci = entry.schema.col_index(col_name).ok_or_else(|| {
                NileDbError::InvalidArg(format!("no column {col_name} in table {table}"))
            })?;
            if entry.schema.columns()[ci].dtype == DataType::Boolean {
                return Err(NileDbError::InvalidArg(format!(
                    "boolean column {col_name} cannot be indexed"
                )));
            }
            field_idxs.push((ci, *desc));
        }

        let fid = self
            .registry
            .register(self.dir.join(format!("{name}.ndb")))?;
        let order = SortOrder::from_desc_flags(
            &field_idxs.iter().map(|&(_, desc)| desc).collect::<Vec<_>>(),
        );
        let index = BTreeIndex::new(
            self.pool.clone(),
            fid,
            entry.table.fid(),
            unique,
            order,
            INVALID_PAGE_NUM,
        );

        let meta_row = vec![
            Value::Varchar(name.to_string()),
            Value::Varchar(table.to_string()),
            Value::Int(fid),
            Value::Int(INVALID_PAGE_NUM),
            Value::Boolean(unique),
            Value::Int(field_idxs.len() as i32),
        ];
        let meta_rid = self.insert_into(&self.index_meta, &meta_row)?;
        for (position, &(ci, desc)) in field_idxs.iter().enumerate() {
            let row = vec![
                Value::Varchar(name.to_string()),
                Value::Int(ci as i32),
                Value::Boolean(desc),
                Value::Int(position as i32),
            ];
            self.insert_into(&self.index_keys, &row)?;
        }

        let idx = Arc::new(IndexEntry {
            name: name.to_string(),
            table_name: table.to_string(),
            fields: field_idxs,
            index,
            meta_rid: Mutex::new(meta_rid),
            persisted_root: Mutex::new(INVALID_PAGE_NUM),
        });

        // Backfill from existing rows; a duplicate in a unique index
        // aborts and tears the half-built index down again.
        for item in entry.table.iter()? {
            let (rid, bytes) = item?;
            let values =
                self.resolve_fields(&entry, entry.schema.decode_record(&bytes)?)?;
            let cell = self.index_cell(&idx, &values, rid)?;
            if let Err(err) = idx.index.insert(&cell, rid) {
                self.remove_index_rows(&idx)?;
                self.pool.delete_file(idx.index.fid())?;
                return Err(err);
            }
        }
        self.persist_root(&idx)?;

        self.indexes.write().insert(name.to_string(), idx);
        self.table_indexes
            .write()
            .entry(table.to_string())
            .or_default()
            .push(name.to_string());
        debug!("created index {name} on {table}");
        Ok(())
    }

    pub fn delete_index(&self, name: &str) -> Result<()> {
        let idx = self
            .indexes
            .write()
            .remove(name)
            .ok_or_else(|| NileDbError::NotFound(format!("no index {name}")))?;
        if let Some(siblings) = self.table_indexes.write().get_mut(&idx.table_name) {
            siblings.retain(|n| n != name);
        }
        self.remove_index_rows(&idx)?;
        self.pool.delete_file(idx.index.fid())?;
        Ok(())
    }

    /// Insert a tuple into a user table and every index on it. A
    /// rejected unique key undoes the heap write and any index entries
    /// already added, so the statement fails as a unit.
    pub fn insert(&self, table: &str, values: &[Value]) -> Result<RecordId> {
        let entry = self.user_table(table)?;
        let rid = self.insert_into(&entry, values)?;

        let mut done: Vec<Arc<IndexEntry>> = Vec::new();
        for index_name in self.index_names_of(table) {
            let idx = self.index_entry(&index_name)?;
            let cell = self.index_cell(&idx, values, rid)?;
            match idx.index.insert(&cell, rid) {
                Ok(()) => {
                    self.persist_root(&idx)?;
                    done.push(idx);
                }
                Err(err) => {
                    for undone in done {
                        if let Ok(cell) = self.index_cell(&undone, values, rid) {
                            let _ = undone.index.remove(&cell);
                            let _ = self.persist_root(&undone);
                        }
                    }
                    let _ = entry.table.delete_record(rid);
                    return Err(err);
                }
            }
        }
        Ok(rid)
    }

    /// Delete a row by record id; indexes are updated first so they
    /// never point at a missing record.
    pub fn delete_by_rid(&self, table: &str, rid: RecordId) -> Result<()> {
        let entry = self.user_table(table)?;
        let bytes = entry.table.get_record(rid)?;
        let values = self.resolve_fields(&entry, entry.schema.decode_record(&bytes)?)?;
        for index_name in self.index_names_of(table) {
            let idx = self.index_entry(&index_name)?;
            let cell = self.index_cell(&idx, &values, rid)?;
            idx.index.remove(&cell)?;
            self.persist_root(&idx)?;
        }
        entry.table.delete_record(rid)
    }

    /// Delete-then-insert; returns the tuple's new record id.
    pub fn update_by_rid(&self, table: &str, rid: RecordId, values: &[Value]) -> Result<RecordId> {
        self.delete_by_rid(table, rid)?;
        self.insert(table, values)
    }

    /// Full scan producing decoded tuples.
    pub fn scan(&self, table: &str) -> Result<TupleScan> {
        let entry = self.user_table(table)?;
        let inner = entry.table.iter()?;
        Ok(TupleScan {
            pool: self.pool.clone(),
            entry,
            inner,
        })
    }

    pub fn index_scan(&self, name: &str) -> Result<IndexScan> {
        let idx = self.index_entry(name)?;
        let inner = idx.index.scan()?;
        Ok(IndexScan { idx, inner })
    }

    /// Range scan from the first key >= the given field values (a
    /// prefix of the index's key columns is accepted).
    pub fn index_seek(&self, name: &str, key: &[Value]) -> Result<IndexScan> {
        let idx = self.index_entry(name)?;
        if key.is_empty() || key.len() > idx.fields.len() {
            return Err(NileDbError::InvalidArg(format!(
                "index {name} takes 1..={} key fields",
                idx.fields.len()
            )));
        }
        let cell = IndexCell::from_values(key)?;
        let inner = idx.index.seek(&cell)?;
        Ok(IndexScan { idx, inner })
    }

    pub fn flush_all(&self) -> Result<()> {
        self.pool.flush_all()
    }

    fn user_table(&self, name: &str) -> Result<Arc<TableEntry>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| NileDbError::NotFound(format!("no table {name}")))
    }

    fn index_entry(&self, name: &str) -> Result<Arc<IndexEntry>> {
        self.indexes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| NileDbError::NotFound(format!("no index {name}")))
    }

    /// Translate and store one tuple in `entry`'s heap, spilling the
    /// largest payloads to overflow chains until the record fits half
    /// a page. A failure releases every chain it created.
    fn insert_into(&self, entry: &TableEntry, values: &[Value]) -> Result<RecordId> {
        entry.schema.validate_tuple(values)?;
        let max_record = self.pool.page_size() / 2;
        let fid = entry.table.fid();

        let mut candidates: Vec<(usize, usize)> = entry
            .schema
            .layout()
            .var_cols
            .iter()
            .filter_map(|&(col, _)| match &values[col] {
                Value::Varchar(s) if s.len() >= MIN_SPILL_SIZE => Some((s.len(), col)),
                _ => None,
            })
            .collect();
        candidates.sort_unstable_by(|a, b| b.cmp(a));

        let mut overflow_cols: HashMap<usize, PageNum> = HashMap::new();
        let mut created: Vec<PageNum> = Vec::new();
        let mut next_candidate = candidates.into_iter();
        while entry.schema.record_size(values, &overflow_cols) > max_record {
            let Some((_, col)) = next_candidate.next() else {
                break;
            };
            let Value::Varchar(payload) = &values[col] else {
                continue;
            };
            match overflow::build_chain(&self.pool, fid, payload.as_bytes()) {
                Ok(head) => {
                    created.push(head);
                    overflow_cols.insert(col, head);
                }
                Err(err) => {
                    self.release_chains(fid, &created);
                    return Err(err);
                }
            }
        }

        let record = match entry.schema.encode_record(values, &overflow_cols) {
            Ok(record) => record,
            Err(err) => {
                self.release_chains(fid, &created);
                return Err(err);
            }
        };
        if record.len() > max_record {
            self.release_chains(fid, &created);
            return Err(NileDbError::InvalidArg(format!(
                "record of {} bytes cannot fit half a page even after spilling",
                record.len()
            )));
        }
        match entry.table.insert_record(&record) {
            Ok(rid) => Ok(rid),
            Err(err) => {
                self.release_chains(fid, &created);
                Err(err)
            }
        }
    }

    fn release_chains(&self, fid: crate::storage::page::FileId, heads: &[PageNum]) {
        for &head in heads {
            if let Err(err) = overflow::release_chain(&self.pool, fid, head) {
                debug!("failed to release overflow chain {head}: {err}");
            }
        }
    }

    /// Resolve overflow chain heads back into values.
    fn resolve_fields(&self, entry: &TableEntry, fields: Vec<RawField>) -> Result<Vec<Value>> {
        let fid = entry.table.fid();
        fields
            .into_iter()
            .map(|field| match field {
                RawField::Value(value) => Ok(value),
                RawField::OverflowVarchar(head) => {
                    let bytes = overflow::read_chain(&self.pool, fid, head)?;
                    Ok(Value::Varchar(String::from_utf8_lossy(&bytes).into_owned()))
                }
            })
            .collect()
    }

    /// Composite key for one row in one index: the indexed column
    /// values, plus the record-id suffix on non-unique indexes.
    fn index_cell(
        &self,
        idx: &IndexEntry,
        values: &[Value],
        rid: RecordId,
    ) -> Result<IndexCell> {
        let mut key = Vec::with_capacity(idx.fields.len());
        for &(ci, _) in &idx.fields {
            let value = values.get(ci).ok_or_else(|| {
                NileDbError::SchemaMismatch(format!(
                    "index {} references column {ci} beyond the tuple",
                    idx.name
                ))
            })?;
            key.push(value.clone());
        }
        if idx.index.is_unique() {
            IndexCell::from_values(&key)
        } else {
            IndexCell::from_values_with_rid(&key, rid)
        }
    }

    /// Persist a changed root page number by rewriting the index's
    /// meta row through its remembered record id.
    fn persist_root(&self, idx: &IndexEntry) -> Result<()> {
        let current = idx.index.root_page_num();
        let mut persisted = idx.persisted_root.lock();
        if *persisted == current {
            return Ok(());
        }
        let row = vec![
            Value::Varchar(idx.name.clone()),
            Value::Varchar(idx.table_name.clone()),
            Value::Int(idx.index.fid()),
            Value::Int(current),
            Value::Boolean(idx.index.is_unique()),
            Value::Int(idx.fields.len() as i32),
        ];
        let record = self.index_meta.schema.encode_record(&row, &HashMap::new())?;
        let mut meta_rid = idx.meta_rid.lock();
        let new_rid = self.index_meta.table.update_record(*meta_rid, &record)?;
        *meta_rid = new_rid;
        *persisted = current;
        debug!("index {} root now page {current}", idx.name);
        Ok(())
    }

    /// Delete an index's rows from both reserved tables.
    fn remove_index_rows(&self, idx: &IndexEntry) -> Result<()> {
        self.index_meta.table.delete_record(*idx.meta_rid.lock())?;
        let mut doomed = Vec::new();
        for item in self.index_keys.table.iter()? {
            let (rid, bytes) = item?;
            let row = self
                .resolve_fields(&self.index_keys, self.index_keys.schema.decode_record(&bytes)?)?;
            if as_str(&row[0])? == idx.name {
                doomed.push(rid);
            }
        }
        for rid in doomed {
            self.index_keys.table.delete_record(rid)?;
        }
        Ok(())
    }
}

fn open_entry(
    pool: &Arc<BufferPool>,
    registry: &Arc<FileRegistry>,
    dir: &Path,
    schema: TableSchema,
) -> Result<Arc<TableEntry>> {
    let name = schema.table_name().to_string();
    let fid = registry.register(dir.join(format!("{name}.ndb")))?;
    let fsm_fid = registry.register(dir.join(format!("{name}_fsm.ndb")))?;
    let fsm = FreeSpaceMap::load(pool.clone(), fsm_fid)?;
    let table = Table::open(pool.clone(), fid, fsm, schema.layout())?;
    Ok(Arc::new(TableEntry { schema, table }))
}

fn as_str(value: &Value) -> Result<String> {
    match value {
        Value::Varchar(s) => Ok(s.clone()),
        other => Err(StorageError(format!("expected text, found {other}")).into()),
    }
}

fn as_int(value: &Value) -> Result<i32> {
    match value {
        Value::Int(v) => Ok(*v),
        other => Err(StorageError(format!("expected int, found {other}")).into()),
    }
}

fn as_bool(value: &Value) -> Result<bool> {
    match value {
        Value::Boolean(b) => Ok(*b),
        other => Err(StorageError(format!("expected boolean, found {other}")).into()),
    }
}

/// Full-scan iterator yielding decoded tuples.
#[derive(Debug)]
pub struct TupleScan {
    pool: Arc<BufferPool>,
    entry: Arc<TableEntry>,
    inner: TableIter,
}

impl Iterator for TupleScan {
    type Item = Result<(RecordId, Vec<Value>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (rid, bytes) = match self.inner.next()? {
            Ok(item) => item,
            Err(err) => return Some(Err(err)),
        };
        let tuple = self
            .entry
            .schema
            .decode_record(&bytes)
            .and_then(|fields| {
                let fid = self.entry.table.fid();
                fields
                    .into_iter()
                    .map(|field| match field {
                        RawField::Value(value) => Ok(value),
                        RawField::OverflowVarchar(head) => {
                            let bytes = overflow::read_chain(&self.pool, fid, head)?;
                            Ok(Value::Varchar(String::from_utf8_lossy(&bytes).into_owned()))
                        }
                    })
                    .collect::<Result<Vec<Value>>>()
            });
        Some(tuple.map(|values| (rid, values)))
    }
}

/// Index scan yielding decoded key fields (record-id suffix stripped)
/// and the row's record id.
#[derive(Debug)]
pub struct IndexScan {
    idx: Arc<IndexEntry>,
    inner: IndexIter,
}

impl Iterator for IndexScan {
    type Item = Result<(Vec<Value>, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (cell, rid) = match self.inner.next()? {
            Ok(item) => item,
            Err(err) => return Some(Err(err)),
        };
        let key = if self.idx.index.is_unique() {
            cell.decode()
        } else {
            cell.decode_without_last(2)
        };
        Some(key.map(|values| (values, rid)))
    }
}
