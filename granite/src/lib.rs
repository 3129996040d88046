//! Transactional core of a single-node relational storage engine.
//!
//! Slotted table pages, an ARIES write-ahead log with crash recovery, a
//! multi-granularity two-phase lock manager and MVCC visibility rules for
//! table scans.

pub mod buffer_pool;

pub mod catalog;

pub mod config;

pub mod database;

pub mod error;

pub mod failpoint;

pub mod lock_manager;

pub mod log_manager;

pub mod log_record;

pub mod log_storage;

pub mod page;

pub mod pager;

pub mod record;

mod recovery;

pub mod table;

pub mod transaction;

pub mod visibility;

pub const PAGE_SIZE: usize = 8192;

pub type PageId = u32;
pub type SlotId = u32;
pub type TransactionId = u32;
pub type CommandId = u32;
pub type Oid = u32;
pub type Lsn = u64;

/// Sentinel for "no page" in `next_page_id` links.
pub const NULL_PAGE: PageId = u32::MAX;
/// Sentinel for "no deleter" in a record header.
pub const NULL_XID: TransactionId = 0;
/// First transaction id handed out by the transaction manager.
pub const FIRST_XID: TransactionId = 1;
/// Pseudo-transaction used for DDL page allocation; never issued to clients.
pub const DDL_XID: TransactionId = u32::MAX;
/// End of a transaction's backward log chain.
pub const NULL_LSN: Lsn = 0;

/// Logical row identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rid {
    pub page_id: PageId,
    pub slot_id: SlotId,
}

impl Rid {
    pub fn new(page_id: PageId, slot_id: SlotId) -> Self {
        Self { page_id, slot_id }
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot_id)
    }
}

pub use buffer_pool::{BufferPool, PageGuard, PageKey};
pub use config::EngineConfig;
pub use database::{Database, Transaction};
pub use error::{Result, StorageError};
pub use lock_manager::{DeadlockPolicy, LockManager, LockType};
pub use log_manager::LogManager;
pub use record::{Column, ColumnType, Record, Value};
pub use recovery::RecoveryStats;
pub use page::{Page, TablePage};
pub use visibility::IsolationLevel;
