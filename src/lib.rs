pub mod catalog;
pub mod core;
pub mod engine;
pub mod storage;

pub use crate::catalog::schema::{Column, ColumnSpec, TableSchema};
pub use crate::catalog::{Catalog, IndexScan, TupleScan};
pub use crate::core::errors::{NileDbError, Result, StorageError};
pub use crate::core::value::{DataType, Value};
pub use crate::engine::db::NileDb;
pub use crate::storage::btree::key::{IndexCell, SortOrder};
pub use crate::storage::btree::BTreeIndex;
pub use crate::storage::page::{DbConfig, FileId, PageId, PageNum, RecordId, PAGE_SIZE};
