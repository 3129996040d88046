//! Log records and their wire format.
//!
//! Every record starts with a fixed header (big-endian):
//!
//! | offset | size | field                                  |
//! |--------|------|----------------------------------------|
//! | 0      | 4    | total_len (header + body)              |
//! | 4      | 4    | crc32 of bytes `8..total_len`          |
//! | 8      | 1    | tag                                    |
//! | 9      | 4    | xid                                    |
//! | 13     | 8    | prev_lsn                               |
//!
//! The body depends on the tag. A record's LSN is its byte offset in the log.

use std::collections::BTreeMap;
use std::fmt;

use crc32fast::Hasher;

use crate::{Lsn, Oid, PageId, Result, SlotId, StorageError, TransactionId, NULL_LSN};

pub const LOG_HEADER_SIZE: usize = 21;
/// Upper bound on a single encoded record.
pub const MAX_LOG_RECORD_SIZE: usize = 256 * 1024;

/// Active transaction table: xid -> LSN of its latest log record.
pub type ActiveTransactionTable = BTreeMap<TransactionId, Lsn>;
/// Dirty page table: (oid, page id) -> recLSN.
pub type DirtyPageTable = BTreeMap<(Oid, PageId), Lsn>;

const TAG_BEGIN: u8 = 1;
const TAG_COMMIT: u8 = 2;
const TAG_ROLLBACK: u8 = 3;
const TAG_INSERT: u8 = 4;
const TAG_DELETE: u8 = 5;
const TAG_NEW_PAGE: u8 = 6;
const TAG_BEGIN_CHECKPOINT: u8 = 7;
const TAG_END_CHECKPOINT: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogBody {
    Begin,
    Commit,
    Rollback,
    /// A record was written at `offset` of `page_id`; `record` holds its raw bytes.
    Insert {
        oid: Oid,
        page_id: PageId,
        slot_id: SlotId,
        offset: u32,
        size: u32,
        record: Vec<u8>,
    },
    /// A record was logically deleted.
    Delete {
        oid: Oid,
        page_id: PageId,
        slot_id: SlotId,
    },
    /// `page_id` was allocated and linked after `prev_page_id`.
    NewPage {
        oid: Oid,
        prev_page_id: PageId,
        page_id: PageId,
    },
    BeginCheckpoint,
    EndCheckpoint {
        att: ActiveTransactionTable,
        dpt: DirtyPageTable,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub xid: TransactionId,
    pub prev_lsn: Lsn,
    pub body: LogBody,
}

impl LogRecord {
    pub fn new(xid: TransactionId, prev_lsn: Lsn, body: LogBody) -> Self {
        Self {
            lsn: NULL_LSN,
            xid,
            prev_lsn,
            body,
        }
    }

    /// Encoded size in bytes; also the distance to the next record's LSN.
    pub fn size(&self) -> usize {
        LOG_HEADER_SIZE
            + match &self.body {
                LogBody::Begin
                | LogBody::Commit
                | LogBody::Rollback
                | LogBody::BeginCheckpoint => 0,
                LogBody::Insert { record, .. } => 20 + record.len(),
                LogBody::Delete { .. } | LogBody::NewPage { .. } => 12,
                LogBody::EndCheckpoint { att, dpt } => 8 + att.len() * 12 + dpt.len() * 16,
            }
    }

    fn tag(&self) -> u8 {
        match self.body {
            LogBody::Begin => TAG_BEGIN,
            LogBody::Commit => TAG_COMMIT,
            LogBody::Rollback => TAG_ROLLBACK,
            LogBody::Insert { .. } => TAG_INSERT,
            LogBody::Delete { .. } => TAG_DELETE,
            LogBody::NewPage { .. } => TAG_NEW_PAGE,
            LogBody::BeginCheckpoint => TAG_BEGIN_CHECKPOINT,
            LogBody::EndCheckpoint { .. } => TAG_END_CHECKPOINT,
        }
    }

    /// The page this record modifies, for Insert, Delete and NewPage.
    pub fn page_target(&self) -> Option<(Oid, PageId)> {
        match self.body {
            LogBody::Insert { oid, page_id, .. }
            | LogBody::Delete { oid, page_id, .. }
            | LogBody::NewPage { oid, page_id, .. } => Some((oid, page_id)),
            _ => None,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let total_len = self.size();
        let mut buf = Vec::with_capacity(total_len);
        buf.extend_from_slice(&(total_len as u32).to_be_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.push(self.tag());
        buf.extend_from_slice(&self.xid.to_be_bytes());
        buf.extend_from_slice(&self.prev_lsn.to_be_bytes());
        match &self.body {
            LogBody::Begin | LogBody::Commit | LogBody::Rollback | LogBody::BeginCheckpoint => {}
            LogBody::Insert {
                oid,
                page_id,
                slot_id,
                offset,
                size,
                record,
            } => {
                for field in [*oid, *page_id, *slot_id, *offset, *size] {
                    buf.extend_from_slice(&field.to_be_bytes());
                }
                buf.extend_from_slice(record);
            }
            LogBody::Delete {
                oid,
                page_id,
                slot_id,
            } => {
                for field in [*oid, *page_id, *slot_id] {
                    buf.extend_from_slice(&field.to_be_bytes());
                }
            }
            LogBody::NewPage {
                oid,
                prev_page_id,
                page_id,
            } => {
                for field in [*oid, *prev_page_id, *page_id] {
                    buf.extend_from_slice(&field.to_be_bytes());
                }
            }
            LogBody::EndCheckpoint { att, dpt } => {
                buf.extend_from_slice(&(att.len() as u32).to_be_bytes());
                for (xid, lsn) in att {
                    buf.extend_from_slice(&xid.to_be_bytes());
                    buf.extend_from_slice(&lsn.to_be_bytes());
                }
                buf.extend_from_slice(&(dpt.len() as u32).to_be_bytes());
                for ((oid, page_id), rec_lsn) in dpt {
                    buf.extend_from_slice(&oid.to_be_bytes());
                    buf.extend_from_slice(&page_id.to_be_bytes());
                    buf.extend_from_slice(&rec_lsn.to_be_bytes());
                }
            }
        }
        debug_assert_eq!(buf.len(), total_len);
        let crc = checksum(&buf[8..]);
        buf[4..8].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Reads `total_len` from the start of an encoded record.
    pub fn peek_len(buf: &[u8]) -> Result<usize> {
        let raw = buf
            .get(0..4)
            .ok_or_else(|| StorageError::corruption("log record length truncated"))?;
        let len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        if !(LOG_HEADER_SIZE..=MAX_LOG_RECORD_SIZE).contains(&len) {
            return Err(StorageError::corruption(format!(
                "log record length {len} out of bounds"
            )));
        }
        Ok(len)
    }

    /// Decodes the record at `lsn` from `buf`, which must start at the record.
    pub fn deserialize(lsn: Lsn, buf: &[u8]) -> Result<Self> {
        let total_len = Self::peek_len(buf)?;
        let buf = buf.get(..total_len).ok_or_else(|| {
            StorageError::corruption(format!("log record at {lsn} truncated"))
        })?;
        let stored_crc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if checksum(&buf[8..]) != stored_crc {
            return Err(StorageError::corruption(format!(
                "log record at {lsn} crc mismatch"
            )));
        }
        let mut cursor = Cursor { buf, pos: 8, lsn };
        let tag = cursor.u8()?;
        let xid = cursor.u32()?;
        let prev_lsn = cursor.u64()?;
        let body = match tag {
            TAG_BEGIN => LogBody::Begin,
            TAG_COMMIT => LogBody::Commit,
            TAG_ROLLBACK => LogBody::Rollback,
            TAG_INSERT => {
                let oid = cursor.u32()?;
                let page_id = cursor.u32()?;
                let slot_id = cursor.u32()?;
                let offset = cursor.u32()?;
                let size = cursor.u32()?;
                let record = cursor.bytes(size as usize)?.to_vec();
                LogBody::Insert {
                    oid,
                    page_id,
                    slot_id,
                    offset,
                    size,
                    record,
                }
            }
            TAG_DELETE => LogBody::Delete {
                oid: cursor.u32()?,
                page_id: cursor.u32()?,
                slot_id: cursor.u32()?,
            },
            TAG_NEW_PAGE => LogBody::NewPage {
                oid: cursor.u32()?,
                prev_page_id: cursor.u32()?,
                page_id: cursor.u32()?,
            },
            TAG_BEGIN_CHECKPOINT => LogBody::BeginCheckpoint,
            TAG_END_CHECKPOINT => {
                let mut att = ActiveTransactionTable::new();
                for _ in 0..cursor.u32()? {
                    let xid = cursor.u32()?;
                    att.insert(xid, cursor.u64()?);
                }
                let mut dpt = DirtyPageTable::new();
                for _ in 0..cursor.u32()? {
                    let oid = cursor.u32()?;
                    let page_id = cursor.u32()?;
                    dpt.insert((oid, page_id), cursor.u64()?);
                }
                LogBody::EndCheckpoint { att, dpt }
            }
            other => {
                return Err(StorageError::corruption(format!(
                    "unknown log record tag {other} at {lsn}"
                )))
            }
        };
        if cursor.pos != total_len {
            return Err(StorageError::corruption(format!(
                "log record at {lsn} has trailing bytes"
            )));
        }
        Ok(Self {
            lsn,
            xid,
            prev_lsn,
            body,
        })
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lsn: {}\txid: {}\tprev_lsn: {}\t",
            self.lsn, self.xid, self.prev_lsn
        )?;
        match &self.body {
            LogBody::Begin => write!(f, "Begin"),
            LogBody::Commit => write!(f, "Commit"),
            LogBody::Rollback => write!(f, "Rollback"),
            LogBody::Insert {
                oid,
                page_id,
                slot_id,
                offset,
                size,
                ..
            } => write!(
                f,
                "Insert\toid: {oid}\tpage_id: {page_id}\tslot_id: {slot_id}\toffset: {offset}\tsize: {size}"
            ),
            LogBody::Delete {
                oid,
                page_id,
                slot_id,
            } => write!(f, "Delete\toid: {oid}\tpage_id: {page_id}\tslot_id: {slot_id}"),
            LogBody::NewPage {
                oid,
                prev_page_id,
                page_id,
            } => write!(
                f,
                "NewPage\toid: {oid}\tprev_page_id: {prev_page_id}\tpage_id: {page_id}"
            ),
            LogBody::BeginCheckpoint => write!(f, "BeginCheckpoint"),
            LogBody::EndCheckpoint { att, dpt } => {
                write!(f, "EndCheckpoint\tatt: {att:?}\tdpt: {dpt:?}")
            }
        }
    }
}

fn checksum(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    lsn: Lsn,
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        let slice = self.buf.get(self.pos..end).ok_or_else(|| {
            StorageError::corruption(format!("log record at {} body truncated", self.lsn))
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_be_bytes(raw))
    }
}
