//! The database handle: one directory of `.ndb` files behind a file
//! registry, a disk manager, a buffer pool and the catalog.

use std::path::Path;
use std::sync::Arc;

use log::warn;

use crate::catalog::schema::{ColumnSpec, TableSchema};
use crate::catalog::{Catalog, IndexScan, TupleScan};
use crate::core::errors::Result;
use crate::core::value::Value;
use crate::storage::buffer::BufferPool;
use crate::storage::disk::registry::FileRegistry;
use crate::storage::disk::DiskManager;
use crate::storage::page::{DbConfig, RecordId};

#[derive(Debug)]
pub struct NileDb {
    pool: Arc<BufferPool>,
    catalog: Catalog,
}

impl NileDb {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<NileDb> {
        NileDb::open_with(dir, DbConfig::default())
    }

    pub fn open_with<P: AsRef<Path>>(dir: P, config: DbConfig) -> Result<NileDb> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let registry = Arc::new(FileRegistry::new());
        let disk = DiskManager::new(registry.clone(), config.page_size);
        let pool = BufferPool::new(disk, config.pool_size, config.replacer_k);
        let catalog = Catalog::bootstrap(pool.clone(), registry, dir)?;
        Ok(NileDb { pool, catalog })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn create_table(&self, name: &str, columns: &[ColumnSpec]) -> Result<TableSchema> {
        self.catalog.create_table(name, columns)
    }

    pub fn schema(&self, name: &str) -> Option<TableSchema> {
        self.catalog.schema(name)
    }

    pub fn delete_table(&self, name: &str) -> Result<()> {
        self.catalog.delete_table(name)
    }

    pub fn create_index(
        &self,
        table: &str,
        name: &str,
        fields: &[(&str, bool)],
        unique: bool,
    ) -> Result<()> {
        self.catalog.create_index(table, name, fields, unique)
    }

    pub fn delete_index(&self, name: &str) -> Result<()> {
        self.catalog.delete_index(name)
    }

    pub fn insert(&self, table: &str, values: &[Value]) -> Result<RecordId> {
        self.catalog.insert(table, values)
    }

    pub fn delete_by_rid(&self, table: &str, rid: RecordId) -> Result<()> {
        self.catalog.delete_by_rid(table, rid)
    }

    pub fn update_by_rid(&self, table: &str, rid: RecordId, values: &[Value]) -> Result<RecordId> {
        self.catalog.update_by_rid(table, rid, values)
    }

    pub fn scan(&self, table: &str) -> Result<TupleScan> {
        self.catalog.scan(table)
    }

    pub fn index_scan(&self, index: &str) -> Result<IndexScan> {
        self.catalog.index_scan(index)
    }

    pub fn index_seek(&self, index: &str, key: &[Value]) -> Result<IndexScan> {
        self.catalog.index_seek(index, key)
    }

    /// Write every dirty page and cached file header through to disk.
    pub fn flush_all(&self) -> Result<()> {
        self.pool.flush_all()
    }

    /// Flush and fsync everything.
    pub fn close(&self) -> Result<()> {
        self.pool.close()
    }
}

impl Drop for NileDb {
    fn drop(&mut self) {
        if let Err(err) = self.pool.close() {
            warn!("failed to flush database on drop: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::NileDbError;
    use crate::core::value::DataType;
    use tempfile::tempdir;

    fn config() -> DbConfig {
        DbConfig {
            page_size: 256,
            pool_size: 64,
            replacer_k: 2,
        }
    }

    fn open(dir: &std::path::Path) -> NileDb {
        let _ = env_logger::builder().is_test(true).try_init();
        NileDb::open_with(dir, config()).unwrap()
    }

    fn int_varchar_table(db: &NileDb, name: &str) {
        db.create_table(
            name,
            &[
                ColumnSpec::new("i", DataType::Int).not_null(),
                ColumnSpec::new("s", DataType::Varchar),
            ],
        )
        .unwrap();
    }

    fn scan_pairs(db: &NileDb, table: &str) -> Vec<(i32, String)> {
        let mut rows: Vec<(i32, String)> = db
            .scan(table)
            .unwrap()
            .map(|item| {
                let (_, values) = item.unwrap();
                match values.as_slice() {
                    [Value::Int(i), Value::Varchar(s)] => (*i, s.clone()),
                    other => panic!("unexpected row {other:?}"),
                }
            })
            .collect();
        rows.sort();
        rows
    }

    #[test]
    fn heap_round_trip() {
        let tmp = tempdir().unwrap();
        let db = open(tmp.path());
        int_varchar_table(&db, "t");

        db.insert("t", &[Value::Int(1), Value::Varchar("alpha".into())])
            .unwrap();
        let rid2 = db
            .insert("t", &[Value::Int(2), Value::Varchar("beta".into())])
            .unwrap();
        db.insert("t", &[Value::Int(3), Value::Varchar("gamma".into())])
            .unwrap();

        assert_eq!(
            scan_pairs(&db, "t"),
            vec![
                (1, "alpha".to_string()),
                (2, "beta".to_string()),
                (3, "gamma".to_string())
            ]
        );

        db.delete_by_rid("t", rid2).unwrap();
        assert_eq!(
            scan_pairs(&db, "t"),
            vec![(1, "alpha".to_string()), (3, "gamma".to_string())]
        );
    }

    #[test]
    fn overflow_values_round_trip_and_release() {
        let tmp = tempdir().unwrap();
        let db = open(tmp.path());
        int_varchar_table(&db, "t");

        let big = "x".repeat(2000);
        let rid = db
            .insert("t", &[Value::Int(1), Value::Varchar(big.clone())])
            .unwrap();

        let rows = scan_pairs(&db, "t");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, 1);
        assert_eq!(rows[0].1.len(), 2000);
        assert_eq!(rows[0].1, big);

        db.delete_by_rid("t", rid).unwrap();
        assert!(scan_pairs(&db, "t").is_empty());

        // The released chain is recycled: a fresh oversized insert
        // lands its record no deeper into the file than the first did.
        let rid2 = db
            .insert("t", &[Value::Int(2), Value::Varchar(big)])
            .unwrap();
        assert!(rid2.page_id.page_num <= rid.page_id.page_num + 1);
    }

    #[test]
    fn persistence_across_restart() {
        let tmp = tempdir().unwrap();
        {
            let db = open(tmp.path());
            db.create_table("t", &[ColumnSpec::new("i", DataType::Int).not_null()])
                .unwrap();
            for i in 1..=1000 {
                db.insert("t", &[Value::Int(i)]).unwrap();
            }
            db.flush_all().unwrap();
            db.close().unwrap();
        }

        let db = open(tmp.path());
        // One schema row per column: the reloaded schema has exactly
        // the created shape, not duplicates.
        let schema = db.schema("t").unwrap();
        assert_eq!(schema.num_cols(), 1);
        assert_eq!(schema.columns()[0].name, "i");

        let mut seen: Vec<i32> = db
            .scan("t")
            .unwrap()
            .map(|item| match item.unwrap().1.as_slice() {
                [Value::Int(i)] => *i,
                other => panic!("unexpected row {other:?}"),
            })
            .collect();
        seen.sort();
        assert_eq!(seen, (1..=1000).collect::<Vec<_>>());

        // The table is known, so re-creating it is rejected.
        let err = db
            .create_table("t", &[ColumnSpec::new("i", DataType::Int)])
            .unwrap_err();
        assert!(matches!(err, NileDbError::InvalidArg(_)));
    }

    #[test]
    fn unique_index_is_maintained_on_writes() {
        let tmp = tempdir().unwrap();
        let db = open(tmp.path());
        int_varchar_table(&db, "t");
        db.create_index("t", "t_i", &[("i", false)], true).unwrap();

        for (i, s) in [(30, "c"), (10, "a"), (20, "b")] {
            db.insert("t", &[Value::Int(i), Value::Varchar(s.into())])
                .unwrap();
        }
        let keys: Vec<i32> = db
            .index_scan("t_i")
            .unwrap()
            .map(|item| match item.unwrap().0.as_slice() {
                [Value::Int(i)] => *i,
                other => panic!("unexpected key {other:?}"),
            })
            .collect();
        assert_eq!(keys, vec![10, 20, 30]);

        // The duplicate is rejected and the whole statement undone.
        let err = db
            .insert("t", &[Value::Int(20), Value::Varchar("dup".into())])
            .unwrap_err();
        assert!(matches!(err, NileDbError::DuplicateKey(_)));
        assert_eq!(scan_pairs(&db, "t").len(), 3);
        assert_eq!(db.index_scan("t_i").unwrap().count(), 3);

        // Deleting through the rid drops the index entry too.
        let (_, rid) = db
            .index_seek("t_i", &[Value::Int(20)])
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        db.delete_by_rid("t", rid).unwrap();
        let keys: Vec<i32> = db
            .index_scan("t_i")
            .unwrap()
            .map(|item| match item.unwrap().0.as_slice() {
                [Value::Int(i)] => *i,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(keys, vec![10, 30]);
    }

    #[test]
    fn non_unique_index_with_backfill_and_seek() {
        let tmp = tempdir().unwrap();
        let db = open(tmp.path());
        int_varchar_table(&db, "t");
        for (i, s) in [(5, "x"), (5, "y"), (7, "z"), (3, "w")] {
            db.insert("t", &[Value::Int(i), Value::Varchar(s.into())])
                .unwrap();
        }
        // Backfill over existing rows.
        db.create_index("t", "t_i", &[("i", false)], false).unwrap();
        assert_eq!(db.index_scan("t_i").unwrap().count(), 4);

        let hits: Vec<(Vec<Value>, RecordId)> = db
            .index_seek("t_i", &[Value::Int(5)])
            .unwrap()
            .map(|item| item.unwrap())
            .collect();
        // Range start: both 5s, then 7.
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].0, vec![Value::Int(5)]);
        assert_eq!(hits[1].0, vec![Value::Int(5)]);
        assert_eq!(hits[2].0, vec![Value::Int(7)]);
        assert_ne!(hits[0].1, hits[1].1);
    }

    #[test]
    fn update_moves_the_row_and_indexes_follow() {
        let tmp = tempdir().unwrap();
        let db = open(tmp.path());
        int_varchar_table(&db, "t");
        db.create_index("t", "t_i", &[("i", false)], true).unwrap();

        let rid = db
            .insert("t", &[Value::Int(1), Value::Varchar("short".into())])
            .unwrap();
        let new_rid = db
            .update_by_rid("t", rid, &[Value::Int(2), Value::Varchar("rather-longer".into())])
            .unwrap();

        let rows = scan_pairs(&db, "t");
        assert_eq!(rows, vec![(2, "rather-longer".to_string())]);
        let hits: Vec<RecordId> = db
            .index_seek("t_i", &[Value::Int(2)])
            .unwrap()
            .map(|item| item.unwrap().1)
            .collect();
        assert_eq!(hits.first(), Some(&new_rid));
        assert!(db
            .index_seek("t_i", &[Value::Int(1)])
            .unwrap()
            .next()
            .map(|item| item.unwrap().0 != vec![Value::Int(1)])
            .unwrap_or(true));
    }

    #[test]
    fn indexes_survive_restart_via_persisted_roots() {
        let tmp = tempdir().unwrap();
        {
            let db = open(tmp.path());
            int_varchar_table(&db, "t");
            db.create_index("t", "t_i", &[("i", false)], true).unwrap();
            for i in 0..100 {
                db.insert("t", &[Value::Int(i), Value::Varchar(format!("v{i}"))])
                    .unwrap();
            }
            db.close().unwrap();
        }
        let db = open(tmp.path());
        let keys: Vec<i32> = db
            .index_scan("t_i")
            .unwrap()
            .map(|item| match item.unwrap().0.as_slice() {
                [Value::Int(i)] => *i,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(keys, (0..100).collect::<Vec<_>>());

        // Seek still works against the reloaded root.
        let first = db
            .index_seek("t_i", &[Value::Int(42)])
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(first.0, vec![Value::Int(42)]);
    }

    #[test]
    fn drop_table_removes_files_and_metadata() {
        let tmp = tempdir().unwrap();
        let db = open(tmp.path());
        int_varchar_table(&db, "t");
        db.create_index("t", "t_i", &[("i", false)], false).unwrap();
        db.insert("t", &[Value::Int(1), Value::Varchar("a".into())])
            .unwrap();

        db.delete_table("t").unwrap();
        assert!(db.schema("t").is_none());
        assert!(matches!(db.scan("t"), Err(NileDbError::NotFound(_))));
        assert!(matches!(
            db.index_scan("t_i"),
            Err(NileDbError::NotFound(_))
        ));
        assert!(!tmp.path().join("t.ndb").exists());
        assert!(!tmp.path().join("t_fsm.ndb").exists());
        assert!(!tmp.path().join("t_i.ndb").exists());

        // The name is free again.
        int_varchar_table(&db, "t");
        assert!(scan_pairs(&db, "t").is_empty());
    }

    #[test]
    fn schema_mismatches_are_rejected() {
        let tmp = tempdir().unwrap();
        let db = open(tmp.path());
        int_varchar_table(&db, "t");

        assert!(matches!(
            db.insert("t", &[Value::Int(1)]),
            Err(NileDbError::SchemaMismatch(_))
        ));
        assert!(matches!(
            db.insert("t", &[Value::Varchar("x".into()), Value::Varchar("y".into())]),
            Err(NileDbError::SchemaMismatch(_))
        ));
        assert!(matches!(
            db.insert("t", &[Value::Null, Value::Varchar("y".into())]),
            Err(NileDbError::SchemaMismatch(_))
        ));
    }
}
