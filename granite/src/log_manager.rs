//! The write-ahead log manager.
//!
//! LSNs are handed out by an atomic counter advanced by each record's encoded
//! size, so an LSN is also the record's byte offset in the log file. Appended
//! records sit in an in-memory buffer until [`LogManager::flush`] writes them.
//! The active transaction table (ATT) and dirty page table (DPT) live beside
//! the buffer under their own lock.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::buffer_pool::BufferPool;
use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::log_record::{
    ActiveTransactionTable, DirtyPageTable, LogBody, LogRecord, MAX_LOG_RECORD_SIZE,
};
use crate::log_storage::LogStorage;
use crate::transaction::TransactionManager;
use crate::{
    Lsn, Oid, PageId, Result, SlotId, StorageError, TransactionId, DDL_XID, NULL_LSN, NULL_PAGE,
    NULL_XID,
};

#[derive(Debug, Default, Clone)]
pub(crate) struct TransactionTables {
    pub(crate) att: ActiveTransactionTable,
    pub(crate) dpt: DirtyPageTable,
}

pub struct LogManager {
    /// Held for the whole of a flush, which serializes flushes against each other.
    pub(crate) storage: Mutex<LogStorage>,
    buffer: Mutex<BTreeMap<Lsn, LogRecord>>,
    pub(crate) next_lsn: AtomicU64,
    pub(crate) flushed_lsn: AtomicU64,
    /// Durable log end last written to the next-LSN side record.
    pub(crate) persisted_next_lsn: AtomicU64,
    pub(crate) tables: Mutex<TransactionTables>,
    pub(crate) buffer_pool: Arc<BufferPool>,
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) transactions: Arc<TransactionManager>,
    pub(crate) redo_count: AtomicU64,
}

impl LogManager {
    /// Opens the log and registers the manager with the buffer pool. Call
    /// [`LogManager::recover`] before appending.
    pub fn open(
        config: &EngineConfig,
        buffer_pool: Arc<BufferPool>,
        catalog: Arc<Catalog>,
        transactions: Arc<TransactionManager>,
    ) -> Result<Arc<Self>> {
        let storage = LogStorage::open(config)?;
        let end = storage.end();
        let log_manager = Arc::new(Self {
            storage: Mutex::new(storage),
            buffer: Mutex::new(BTreeMap::new()),
            next_lsn: AtomicU64::new(end),
            flushed_lsn: AtomicU64::new(NULL_LSN),
            persisted_next_lsn: AtomicU64::new(NULL_LSN),
            tables: Mutex::new(TransactionTables::default()),
            buffer_pool: buffer_pool.clone(),
            catalog,
            transactions,
            redo_count: AtomicU64::new(0),
        });
        buffer_pool.set_log_manager(Arc::downgrade(&log_manager));
        Ok(log_manager)
    }

    pub fn append_begin_log(&self, xid: TransactionId) -> Result<Lsn> {
        self.append(xid, LogBody::Begin)
    }

    /// Appends the Commit record and returns once it is durable.
    pub fn append_commit_log(&self, xid: TransactionId) -> Result<Lsn> {
        self.append_terminal(xid, LogBody::Commit)
    }

    /// Appends the Rollback record and returns once it is durable.
    pub fn append_rollback_log(&self, xid: TransactionId) -> Result<Lsn> {
        self.append_terminal(xid, LogBody::Rollback)
    }

    /// Logs a record written at `offset` of the page; `record` is its encoded form.
    pub fn append_insert_log(
        &self,
        xid: TransactionId,
        oid: Oid,
        page_id: PageId,
        slot_id: SlotId,
        offset: u32,
        record: Vec<u8>,
    ) -> Result<Lsn> {
        let size = record.len() as u32;
        self.append(
            xid,
            LogBody::Insert {
                oid,
                page_id,
                slot_id,
                offset,
                size,
                record,
            },
        )
    }

    pub fn append_delete_log(
        &self,
        xid: TransactionId,
        oid: Oid,
        page_id: PageId,
        slot_id: SlotId,
    ) -> Result<Lsn> {
        self.append(
            xid,
            LogBody::Delete {
                oid,
                page_id,
                slot_id,
            },
        )
    }

    /// Logs the allocation of `page_id` after `prev_page_id`. `DDL_XID` may log
    /// this without an open transaction.
    pub fn append_new_page_log(
        &self,
        xid: TransactionId,
        oid: Oid,
        prev_page_id: PageId,
        page_id: PageId,
    ) -> Result<Lsn> {
        self.append(
            xid,
            LogBody::NewPage {
                oid,
                prev_page_id,
                page_id,
            },
        )
    }

    fn append(&self, xid: TransactionId, body: LogBody) -> Result<Lsn> {
        let mut tables = self.tables.lock();
        let prev_lsn = match (&body, tables.att.get(&xid)) {
            (LogBody::Begin, Some(_)) => return Err(StorageError::DuplicateBegin(xid)),
            (LogBody::Begin, None) => NULL_LSN,
            (LogBody::NewPage { .. }, None) if xid == DDL_XID => NULL_LSN,
            (_, Some(&last)) => last,
            (_, None) => return Err(StorageError::UnknownTransaction(xid)),
        };

        let mut record = LogRecord::new(xid, prev_lsn, body);
        let size = record.size();
        if size > MAX_LOG_RECORD_SIZE {
            return Err(StorageError::LogRecordTooLarge {
                size,
                max: MAX_LOG_RECORD_SIZE,
            });
        }
        // Allocated under `tables` so a checkpoint's ATT/DPT snapshot covers
        // every LSN below its BeginCheckpoint. The counter stays atomic for
        // readers such as `next_lsn` and `flush`.
        let lsn = self.next_lsn.fetch_add(size as Lsn, Ordering::SeqCst);
        record.lsn = lsn;

        if xid != DDL_XID {
            tables.att.insert(xid, lsn);
        }
        // A DPT entry keeps the earliest LSN that dirtied the page.
        match record.body {
            LogBody::NewPage {
                oid,
                prev_page_id,
                page_id,
            } => {
                tables.dpt.entry((oid, page_id)).or_insert(lsn);
                if prev_page_id != NULL_PAGE {
                    tables.dpt.entry((oid, prev_page_id)).or_insert(lsn);
                }
            }
            LogBody::Insert { oid, page_id, .. } | LogBody::Delete { oid, page_id, .. } => {
                tables.dpt.entry((oid, page_id)).or_insert(lsn);
            }
            _ => {}
        }
        drop(tables);

        trace!(lsn, xid, prev_lsn, size, "appended {}", record);
        self.buffer.lock().insert(lsn, record);
        Ok(lsn)
    }

    fn append_terminal(&self, xid: TransactionId, body: LogBody) -> Result<Lsn> {
        let lsn = self.append(xid, body)?;
        self.flush(Some(lsn))?;
        self.tables.lock().att.remove(&xid);
        debug!(xid, lsn, "transaction end is durable");
        Ok(lsn)
    }

    /// Writes buffered records with LSN at most `up_to` (everything if `None`).
    ///
    /// Records are written in LSN order and only contiguously from the durable
    /// end of the log, so an LSN that has been reserved but not yet buffered is
    /// waited for rather than skipped.
    pub fn flush(&self, up_to: Option<Lsn>) -> Result<()> {
        let mut storage = self.storage.lock();
        let reserved_end = self.next_lsn.load(Ordering::SeqCst);
        let target_end = match up_to {
            Some(lsn) => lsn.saturating_add(1).min(reserved_end),
            None => reserved_end,
        };

        while storage.end() < target_end {
            let start = storage.end();
            let (bytes, last_lsn) = {
                let buffer = self.buffer.lock();
                let mut cursor = start;
                let mut bytes = Vec::new();
                let mut last_lsn = None;
                for (&lsn, record) in buffer.range(start..) {
                    if lsn != cursor || lsn >= target_end {
                        break;
                    }
                    bytes.extend_from_slice(&record.serialize());
                    cursor += record.size() as Lsn;
                    last_lsn = Some(lsn);
                }
                (bytes, last_lsn)
            };
            let Some(last_lsn) = last_lsn else {
                // The next LSN is reserved by an appender that has not buffered it yet.
                std::thread::yield_now();
                continue;
            };

            storage.append(start, &bytes)?;
            let end = storage.end();
            {
                let mut buffer = self.buffer.lock();
                let rest = buffer.split_off(&end);
                *buffer = rest;
            }
            self.flushed_lsn.fetch_max(last_lsn, Ordering::SeqCst);
            trace!(from = start, to = end, "flushed log");
        }

        let end = storage.end();
        if end > self.persisted_next_lsn.load(Ordering::SeqCst) {
            storage.store_next_lsn(end)?;
            self.persisted_next_lsn.store(end, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Writes a page back under the WAL rule: the log is made durable up to
    /// `page_lsn` first, and the page leaves the DPT only once `write` succeeded.
    pub fn flush_page<F>(&self, oid: Oid, page_id: PageId, page_lsn: Lsn, write: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        if page_lsn != NULL_LSN {
            self.flush(Some(page_lsn))?;
        }
        write()?;
        self.tables.lock().dpt.remove(&(oid, page_id));
        trace!(oid, page_id, page_lsn, "page flushed");
        Ok(())
    }

    /// Records that a page was changed outside the normal append path (undo).
    pub(crate) fn mark_dirty(&self, oid: Oid, page_id: PageId, lsn: Lsn) {
        self.tables.lock().dpt.entry((oid, page_id)).or_insert(lsn);
    }

    /// Takes a checkpoint and returns the LSN of its EndCheckpoint record.
    ///
    /// Unless `asynchronous` is set, dirty pages are written back first so the
    /// recorded DPT is as small as possible.
    pub fn checkpoint(&self, asynchronous: bool) -> Result<Lsn> {
        if !asynchronous {
            self.buffer_pool.flush_all()?;
        }

        let (begin, end, next_xid) = {
            let mut tables = self.tables.lock();
            if !asynchronous {
                // Entries left by Analyze for pages that were already clean on disk.
                let dirty: HashSet<(Oid, PageId)> = self
                    .buffer_pool
                    .dirty_pages()
                    .into_iter()
                    .map(|key| (key.oid, key.page_id))
                    .collect();
                tables.dpt.retain(|page, _| dirty.contains(page));
            }
            let mut begin = LogRecord::new(NULL_XID, NULL_LSN, LogBody::BeginCheckpoint);
            let mut end = LogRecord::new(
                NULL_XID,
                NULL_LSN,
                LogBody::EndCheckpoint {
                    att: tables.att.clone(),
                    dpt: tables.dpt.clone(),
                },
            );
            if end.size() > MAX_LOG_RECORD_SIZE {
                return Err(StorageError::LogRecordTooLarge {
                    size: end.size(),
                    max: MAX_LOG_RECORD_SIZE,
                });
            }
            begin.lsn = self
                .next_lsn
                .fetch_add(begin.size() as Lsn, Ordering::SeqCst);
            end.lsn = self.next_lsn.fetch_add(end.size() as Lsn, Ordering::SeqCst);
            // Every xid logged before `begin` was handed out before this point.
            (begin, end, self.transactions.get_next_xid())
        };
        let (begin_lsn, end_lsn) = (begin.lsn, end.lsn);
        {
            let mut buffer = self.buffer.lock();
            buffer.insert(begin_lsn, begin);
            buffer.insert(end_lsn, end);
        }

        self.flush(Some(end_lsn))?;
        {
            let storage = self.storage.lock();
            storage.store_next_xid(next_xid)?;
            storage.store_master(begin_lsn)?;
        }
        info!(begin_lsn, end_lsn, next_xid, "checkpoint complete");
        Ok(end_lsn)
    }

    /// Undoes every change of `xid`, newest first, by walking its `prev_lsn`
    /// chain. Returns the number of records visited. The caller appends the
    /// Rollback record.
    pub fn rollback(&self, xid: TransactionId) -> Result<usize> {
        let mut lsn = self
            .tables
            .lock()
            .att
            .get(&xid)
            .copied()
            .ok_or(StorageError::UnknownTransaction(xid))?;

        let mut visited = 0;
        while lsn != NULL_LSN {
            let record = self.read_record(lsn)?;
            if record.xid != xid {
                return Err(StorageError::corruption(format!(
                    "log record {lsn} in the chain of transaction {xid} belongs to {}",
                    record.xid
                )));
            }
            self.undo(&record)?;
            visited += 1;
            lsn = record.prev_lsn;
        }
        debug!(xid, visited, "rolled back transaction");
        Ok(visited)
    }

    /// Reads a record from the buffer if it is still there, otherwise from disk.
    pub fn read_record(&self, lsn: Lsn) -> Result<LogRecord> {
        if let Some(record) = self.buffer.lock().get(&lsn) {
            return Ok(record.clone());
        }
        self.storage.lock().read_record(lsn)
    }

    /// Durable records from `from` onward.
    pub fn read_log(&self, from: Lsn) -> Result<Vec<LogRecord>> {
        Ok(self.storage.lock().scan(from)?.records)
    }

    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn.load(Ordering::SeqCst)
    }

    /// LSN of the last record known to be durable.
    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn.load(Ordering::SeqCst)
    }

    pub fn redo_count(&self) -> u64 {
        self.redo_count.load(Ordering::SeqCst)
    }

    pub fn active_transaction_table(&self) -> ActiveTransactionTable {
        self.tables.lock().att.clone()
    }

    pub fn dirty_page_table(&self) -> DirtyPageTable {
        self.tables.lock().dpt.clone()
    }

    /// Forgets every record that has not been flushed, as a crash would.
    pub fn discard_buffer(&self) {
        let mut buffer = self.buffer.lock();
        if !buffer.is_empty() {
            debug!(records = buffer.len(), "discarding unflushed log records");
        }
        buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_storage::FIRST_LSN;
    use std::path::Path;
    use tempfile::tempdir;

    fn open(dir: &Path) -> Arc<LogManager> {
        let mut config = EngineConfig::new(dir);
        config.sync_writes = false;
        let catalog = Arc::new(Catalog::open(config.catalog_path(), config.db_oid).unwrap());
        let pool = Arc::new(BufferPool::new(&config));
        let log = LogManager::open(&config, pool, catalog, Arc::new(TransactionManager::new()))
            .unwrap();
        log.recover().unwrap();
        log
    }

    #[test]
    fn lsns_are_byte_offsets() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        let begin = log.append_begin_log(1).unwrap();
        assert_eq!(begin, FIRST_LSN);
        let delete = log.append_delete_log(1, 100, 0, 0).unwrap();
        let begin_size = LogRecord::new(1, NULL_LSN, LogBody::Begin).size() as Lsn;
        assert_eq!(delete, begin + begin_size);
        let record = log.read_record(delete).unwrap();
        assert_eq!(record.prev_lsn, begin);
    }

    #[test]
    fn protocol_violations_are_errors() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        log.append_begin_log(3).unwrap();
        assert!(matches!(
            log.append_begin_log(3),
            Err(StorageError::DuplicateBegin(3))
        ));
        assert!(matches!(
            log.append_delete_log(4, 100, 0, 0),
            Err(StorageError::UnknownTransaction(4))
        ));
        assert!(matches!(
            log.append_insert_log(3, 100, 0, 0, 0, vec![0; MAX_LOG_RECORD_SIZE]),
            Err(StorageError::LogRecordTooLarge { .. })
        ));
        log.append_new_page_log(DDL_XID, 100, NULL_PAGE, 0).unwrap();
        assert!(!log.active_transaction_table().contains_key(&DDL_XID));
    }

    #[test]
    fn commit_flushes_and_leaves_att() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        log.append_begin_log(1).unwrap();
        let insert = log.append_delete_log(1, 100, 0, 0).unwrap();
        assert!(log.flushed_lsn() < insert);
        let commit = log.append_commit_log(1).unwrap();
        assert_eq!(log.flushed_lsn(), commit);
        assert!(log.active_transaction_table().is_empty());

        let durable = log.read_log(FIRST_LSN).unwrap();
        let tail: Vec<_> = durable.iter().filter(|r| r.xid == 1).map(|r| r.lsn).collect();
        assert_eq!(tail.last(), Some(&commit));
    }

    #[test]
    fn dpt_keeps_first_dirtying_lsn() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        log.append_begin_log(1).unwrap();
        let first = log.append_delete_log(1, 100, 4, 0).unwrap();
        log.append_delete_log(1, 100, 4, 1).unwrap();
        let new_page = log.append_new_page_log(1, 100, 4, 5).unwrap();
        let dpt = log.dirty_page_table();
        assert_eq!(dpt.get(&(100, 4)), Some(&first));
        assert_eq!(dpt.get(&(100, 5)), Some(&new_page));
    }

    #[test]
    fn flush_waits_for_concurrent_appenders() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        let handles: Vec<_> = (1..=8u32)
            .map(|xid| {
                let log = log.clone();
                std::thread::spawn(move || {
                    log.append_begin_log(xid).unwrap();
                    for slot in 0..20 {
                        log.append_delete_log(xid, 100, xid, slot).unwrap();
                        if slot % 5 == 0 {
                            log.flush(None).unwrap();
                        }
                    }
                    log.append_commit_log(xid).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        log.flush(None).unwrap();

        let records = log.read_log(FIRST_LSN).unwrap();
        let mut expected = records[0].lsn;
        for record in &records {
            assert_eq!(record.lsn, expected);
            expected += record.size() as Lsn;
        }
        assert_eq!(expected, log.next_lsn());
        let commits = records
            .iter()
            .filter(|r| matches!(r.body, LogBody::Commit))
            .count();
        assert_eq!(commits, 8);
    }

    #[test]
    fn checkpoint_records_tables_and_master() {
        let dir = tempdir().unwrap();
        let log = open(dir.path());
        log.append_begin_log(7).unwrap();
        let last = log.append_delete_log(7, 100, 0, 0).unwrap();
        let end = log.checkpoint(true).unwrap();

        let master = log.storage.lock().load_master().unwrap().unwrap();
        let begin = log.read_record(master).unwrap();
        assert!(matches!(begin.body, LogBody::BeginCheckpoint));
        match log.read_record(end).unwrap().body {
            LogBody::EndCheckpoint { att, dpt } => {
                assert_eq!(att.get(&7), Some(&last));
                assert_eq!(dpt.get(&(100, 0)), Some(&last));
            }
            other => panic!("expected EndCheckpoint, got {other:?}"),
        }
    }
}
