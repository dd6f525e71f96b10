//! File-id registry owned by the database handle.
//!
//! Every `PageId` the engine produces carries a `FileId` registered
//! here. The registry is plain data passed down to the components that
//! need it; there is no process-wide table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::core::errors::{NileDbError, Result};
use crate::storage::page::{FileId, FILE_EXT};

#[derive(Debug, Default)]
struct RegistryInner {
    by_id: HashMap<FileId, PathBuf>,
    by_path: HashMap<PathBuf, FileId>,
    next_fid: FileId,
}

#[derive(Debug, Default)]
pub struct FileRegistry {
    inner: Mutex<RegistryInner>,
}

impl FileRegistry {
    pub fn new() -> FileRegistry {
        FileRegistry::default()
    }

    /// Register a path, returning its file id. Registering the same
    /// path twice returns the same id. Only `.ndb` paths are accepted.
    pub fn register<P: AsRef<Path>>(&self, path: P) -> Result<FileId> {
        let path = path.as_ref();
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) if name.ends_with(FILE_EXT) && name.len() > FILE_EXT.len() => {}
            _ => {
                return Err(NileDbError::InvalidArg(format!(
                    "database files must end in {FILE_EXT}: {}",
                    path.display()
                )))
            }
        }

        let mut inner = self.inner.lock();
        if let Some(fid) = inner.by_path.get(path) {
            return Ok(*fid);
        }
        let fid = inner.next_fid;
        inner.next_fid += 1;
        inner.by_id.insert(fid, path.to_path_buf());
        inner.by_path.insert(path.to_path_buf(), fid);
        Ok(fid)
    }

    pub fn path_of(&self, fid: FileId) -> Option<PathBuf> {
        self.inner.lock().by_id.get(&fid).cloned()
    }

    pub fn unregister(&self, fid: FileId) {
        let mut inner = self.inner.lock();
        if let Some(path) = inner.by_id.remove(&fid) {
            inner.by_path.remove(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_per_path() {
        let reg = FileRegistry::new();
        let a = reg.register("/tmp/t.ndb").unwrap();
        let b = reg.register("/tmp/t.ndb").unwrap();
        let c = reg.register("/tmp/u.ndb").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(reg.path_of(a).unwrap(), PathBuf::from("/tmp/t.ndb"));
    }

    #[test]
    fn rejects_foreign_extensions() {
        let reg = FileRegistry::new();
        assert!(matches!(
            reg.register("/tmp/t.db"),
            Err(NileDbError::InvalidArg(_))
        ));
        assert!(matches!(
            reg.register("/tmp/.ndb"),
            Err(NileDbError::InvalidArg(_))
        ));
    }
}
