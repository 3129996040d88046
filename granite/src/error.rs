use std::io;
use thiserror::Error;

use crate::lock_manager::LockType;
use crate::{Oid, PageId, Rid, SlotId, TransactionId};

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("catalog serialization error: {0}")]
    Catalog(#[from] serde_json::Error),
    #[error("transaction {0} already exists in the active transaction table")]
    DuplicateBegin(TransactionId),
    #[error("transaction {0} does not exist in the active transaction table")]
    UnknownTransaction(TransactionId),
    #[error("record size {size} exceeds maximum {max}")]
    RecordTooLarge { size: usize, max: usize },
    #[error("log record size {size} exceeds maximum {max}")]
    LogRecordTooLarge { size: usize, max: usize },
    #[error("slot {slot_id} out of range on page {page_id}")]
    SlotOutOfRange { page_id: PageId, slot_id: SlotId },
    #[error("table {0} not found")]
    TableNotFound(Oid),
    #[error("no table named {0}")]
    UnknownTable(String),
    #[error("table {0} already exists")]
    TableExists(String),
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("transaction {xid} could not acquire {lock_type:?} lock on table {oid}")]
    LockConflict {
        xid: TransactionId,
        oid: Oid,
        lock_type: LockType,
    },
    #[error("record {0} is already deleted")]
    RecordDeleted(Rid),
    #[error("corruption detected: {0}")]
    Corruption(String),
}

impl StorageError {
    pub fn corruption(msg: impl Into<String>) -> Self {
        StorageError::Corruption(msg.into())
    }
}
