//! Page identifiers and engine-wide configuration.

pub type FileId = i32;
pub type PageNum = i32;

pub const INVALID_FID: FileId = -1;
pub const INVALID_PAGE_NUM: PageNum = -1;

/// Default page size. Tests run with smaller pages (128/256) to force
/// splits, merges and overflow chains with little data.
pub const PAGE_SIZE: usize = 4096;

/// Required extension for every database file.
pub const FILE_EXT: &str = ".ndb";

/// A page on disk: which file, and which page-sized slot within it.
/// Page 0 of every file is the header page; data starts at page 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId {
    pub fid: FileId,
    pub page_num: PageNum,
}

impl PageId {
    pub const INVALID: PageId = PageId {
        fid: INVALID_FID,
        page_num: INVALID_PAGE_NUM,
    };

    pub fn new(fid: FileId, page_num: PageNum) -> PageId {
        PageId { fid, page_num }
    }

    pub fn is_valid(&self) -> bool {
        self.fid != INVALID_FID && self.page_num != INVALID_PAGE_NUM
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}:{})", self.fid, self.page_num)
    }
}

/// A tuple's address: page plus slot index within the page's directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot: u32,
}

impl RecordId {
    pub const INVALID: RecordId = RecordId {
        page_id: PageId::INVALID,
        slot: 0,
    };

    pub fn new(page_id: PageId, slot: u32) -> RecordId {
        RecordId { page_id, slot }
    }

    pub fn is_valid(&self) -> bool {
        self.page_id.is_valid()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.page_id, self.slot)
    }
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub page_size: usize,
    pub pool_size: usize,
    pub replacer_k: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            pool_size: 64,
            replacer_k: 2,
        }
    }
}
