//! ARIES restart recovery: Analyze, Redo, Undo.
//!
//! Undo does not write compensation records. Instead Analyze only retires a
//! transaction on its Commit record, so a transaction that rolled back before
//! the crash is undone again; every undo step checks the record header (or
//! page link) first and is therefore safe to repeat.

use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use crate::buffer_pool::PageKey;
use crate::failpoint;
use crate::log_manager::{LogManager, TransactionTables};
use crate::log_record::{LogBody, LogRecord};
use crate::log_storage::FIRST_LSN;
use crate::{Lsn, Oid, PageId, Result, StorageError, DDL_XID, NULL_LSN, NULL_PAGE, NULL_XID};

/// Work done by one call to [`LogManager::recover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Log records examined by Analyze.
    pub analyzed: usize,
    /// Page changes re-applied by Redo.
    pub redone: usize,
    /// Transactions rolled back by Undo.
    pub undone: usize,
}

struct Analysis {
    records: Vec<LogRecord>,
    redo_start: Lsn,
}

impl LogManager {
    pub fn recover(&self) -> Result<RecoveryStats> {
        let analysis = self.analyze()?;
        let analyzed = analysis.records.len();
        let redone = self.redo(&analysis)?;
        let undone = self.undo_losers()?;
        let stats = RecoveryStats {
            analyzed,
            redone,
            undone,
        };
        info!(?stats, next_lsn = self.next_lsn(), "recovery complete");
        Ok(stats)
    }

    /// Rebuilds the ATT and DPT as of the crash and finds the end of the log.
    fn analyze(&self) -> Result<Analysis> {
        let mut storage = self.storage.lock();
        let mut tables = TransactionTables::default();

        let master = storage.load_master()?;
        if let Some(next_xid) = storage.load_next_xid()? {
            self.transactions.set_next_xid(next_xid);
        }
        let mut start = FIRST_LSN;
        let mut checkpoint_scan = None;
        let mut tail_end = None;
        if let Some(begin_lsn) = master {
            let scan = storage.scan(begin_lsn)?;
            match scan.records.first() {
                Some(record) if matches!(record.body, LogBody::BeginCheckpoint) => {}
                _ => {
                    return Err(StorageError::corruption(format!(
                        "master record points at {begin_lsn}, which is not a BeginCheckpoint"
                    )))
                }
            }
            let (att, dpt) = scan
                .records
                .iter()
                .find_map(|record| match &record.body {
                    LogBody::EndCheckpoint { att, dpt } => Some((att.clone(), dpt.clone())),
                    _ => None,
                })
                .ok_or_else(|| {
                    StorageError::corruption(format!(
                        "checkpoint at {begin_lsn} has no EndCheckpoint record"
                    ))
                })?;
            tables.dpt = dpt;
            // A commit can land just before the checkpoint while its transaction
            // is still in the snapshot; its last record is then the Commit itself.
            for (&xid, &last) in &att {
                let finished = last < begin_lsn
                    && matches!(storage.read_record(last)?.body, LogBody::Commit);
                if !finished {
                    tables.att.insert(xid, last);
                }
            }
            start = tables
                .dpt
                .values()
                .copied()
                .fold(begin_lsn, Lsn::min);
            tail_end = Some(scan.end);
            checkpoint_scan = Some(scan).filter(|_| start == begin_lsn);
            debug!(begin_lsn, start, "analysis seeded from checkpoint");
        }

        let scan = match checkpoint_scan {
            Some(scan) => scan,
            None => storage.scan(start)?,
        };
        let end = scan.end;
        if tail_end.is_some_and(|tail| tail != end) {
            return Err(StorageError::corruption(format!(
                "log stops at {end} before the last checkpoint's tail"
            )));
        }
        if let Some(recorded) = storage.load_next_lsn()? {
            if recorded > end {
                return Err(StorageError::corruption(format!(
                    "log ends at {end} but {recorded} was recorded as durable"
                )));
            }
        }
        storage.truncate(end)?;
        self.next_lsn.store(end, Ordering::SeqCst);
        self.persisted_next_lsn.store(end, Ordering::SeqCst);
        let last_lsn = scan.records.last().map_or(NULL_LSN, |r| r.lsn);
        self.flushed_lsn.store(last_lsn, Ordering::SeqCst);
        drop(storage);

        let mut max_xid = NULL_XID;
        for record in &scan.records {
            let xid = record.xid;
            if xid != DDL_XID && xid != NULL_XID {
                max_xid = max_xid.max(xid);
                match record.body {
                    LogBody::Commit => {
                        tables.att.remove(&xid);
                    }
                    LogBody::BeginCheckpoint | LogBody::EndCheckpoint { .. } => {}
                    _ => {
                        let last = tables.att.entry(xid).or_insert(record.lsn);
                        *last = (*last).max(record.lsn);
                    }
                }
            }
            if let LogBody::NewPage {
                oid, prev_page_id, ..
            } = record.body
            {
                if prev_page_id != NULL_PAGE {
                    tables.dpt.entry((oid, prev_page_id)).or_insert(record.lsn);
                }
            }
            if let Some(target) = record.page_target() {
                tables.dpt.entry(target).or_insert(record.lsn);
            }
        }
        if max_xid != NULL_XID {
            self.transactions.set_next_xid(max_xid + 1);
        }

        let redo_start = tables.dpt.values().copied().min().unwrap_or(end);
        info!(
            records = scan.records.len(),
            end,
            losers = tables.att.len(),
            dirty_pages = tables.dpt.len(),
            redo_start,
            "analysis complete"
        );
        *self.tables.lock() = tables;
        Ok(Analysis {
            records: scan.records,
            redo_start,
        })
    }

    /// Re-applies every logged page change that may be missing from disk.
    fn redo(&self, analysis: &Analysis) -> Result<usize> {
        let dpt = self.dirty_page_table();
        let in_scope = |oid: Oid, page_id: PageId, lsn: Lsn| {
            dpt.get(&(oid, page_id))
                .is_some_and(|&rec_lsn| lsn >= rec_lsn)
        };

        let mut redone = 0;
        for record in analysis
            .records
            .iter()
            .filter(|r| r.lsn >= analysis.redo_start)
        {
            let Some((oid, _)) = record.page_target() else {
                continue;
            };
            let Some(db_oid) = self.db_oid_of(oid) else {
                debug!(oid, lsn = record.lsn, "skipping redo for dropped table");
                continue;
            };
            let lsn = record.lsn;
            match &record.body {
                LogBody::Insert {
                    page_id,
                    slot_id,
                    offset,
                    size,
                    record: raw,
                    ..
                } => {
                    if !in_scope(oid, *page_id, lsn) {
                        continue;
                    }
                    let guard = self
                        .buffer_pool
                        .get_page(PageKey::new(db_oid, oid, *page_id))?;
                    if guard.read().table().page_lsn() >= lsn {
                        continue;
                    }
                    let mut page = guard.write();
                    let mut table = page.table_mut();
                    table.redo_insert_record(*slot_id, raw, *offset, *size)?;
                    table.set_page_lsn(lsn);
                    redone += 1;
                }
                LogBody::Delete {
                    page_id, slot_id, ..
                } => {
                    if !in_scope(oid, *page_id, lsn) {
                        continue;
                    }
                    let guard = self
                        .buffer_pool
                        .get_page(PageKey::new(db_oid, oid, *page_id))?;
                    if guard.read().table().page_lsn() >= lsn {
                        continue;
                    }
                    let mut page = guard.write();
                    let mut table = page.table_mut();
                    table.delete_record(*slot_id, record.xid)?;
                    table.set_page_lsn(lsn);
                    redone += 1;
                }
                LogBody::NewPage {
                    prev_page_id,
                    page_id,
                    ..
                } => {
                    let key = PageKey::new(db_oid, oid, *page_id);
                    self.buffer_pool.ensure_allocated(key)?;
                    if in_scope(oid, *page_id, lsn) {
                        // Ids are never reused, so a page stamped at or after this
                        // record already went through its initialisation.
                        let guard = self.buffer_pool.get_page(key)?;
                        if guard.read().table().page_lsn() < lsn {
                            let mut page = guard.write();
                            let mut table = page.table_mut();
                            table.init();
                            table.set_page_lsn(lsn);
                            redone += 1;
                        }
                    }
                    if *prev_page_id != NULL_PAGE && in_scope(oid, *prev_page_id, lsn) {
                        let guard = self
                            .buffer_pool
                            .get_page(PageKey::new(db_oid, oid, *prev_page_id))?;
                        if guard.read().table().page_lsn() < lsn {
                            let mut page = guard.write();
                            let mut table = page.table_mut();
                            table.set_next_page_id(*page_id);
                            table.set_page_lsn(lsn);
                        }
                    }
                }
                _ => {}
            }
        }
        self.redo_count.fetch_add(redone as u64, Ordering::SeqCst);
        info!(redone, "redo complete");
        Ok(redone)
    }

    /// Rolls back every transaction left in the ATT and closes it with a
    /// Rollback record.
    fn undo_losers(&self) -> Result<usize> {
        let losers: Vec<_> = self.active_transaction_table().into_keys().collect();
        for &xid in &losers {
            self.rollback(xid)?;
        }
        failpoint::maybe_fail(failpoint::RECOVERY_UNDO)?;
        for &xid in &losers {
            self.append_rollback_log(xid)?;
            self.transactions.finish(xid);
        }
        if !losers.is_empty() {
            info!(?losers, "undo complete");
        }
        Ok(losers.len())
    }

    /// Reverts one logged change. Each case checks that the change is still
    /// in place, so repeating an undo has no effect.
    pub(crate) fn undo(&self, record: &LogRecord) -> Result<()> {
        let Some((oid, _)) = record.page_target() else {
            return Ok(());
        };
        let Some(db_oid) = self.db_oid_of(oid) else {
            return Ok(());
        };
        let xid = record.xid;
        match &record.body {
            LogBody::Insert {
                page_id, slot_id, ..
            } => {
                let guard = self
                    .buffer_pool
                    .get_page(PageKey::new(db_oid, oid, *page_id))?;
                let mut page = guard.write();
                let header = match page.table().record_header(*slot_id) {
                    Ok(header) => header,
                    Err(StorageError::SlotOutOfRange { .. }) => {
                        warn!(lsn = record.lsn, page_id, slot_id, "insert to undo is missing");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
                if header.xmin == xid && !(header.is_deleted() && header.xmax == xid) {
                    page.table_mut().delete_record(*slot_id, xid)?;
                }
                self.mark_dirty(oid, *page_id, record.lsn);
            }
            LogBody::Delete {
                page_id, slot_id, ..
            } => {
                let guard = self
                    .buffer_pool
                    .get_page(PageKey::new(db_oid, oid, *page_id))?;
                let mut page = guard.write();
                if page.table().record_header(*slot_id)?.xmax == xid {
                    page.table_mut().undo_delete_record(*slot_id)?;
                }
                self.mark_dirty(oid, *page_id, record.lsn);
            }
            LogBody::NewPage {
                prev_page_id,
                page_id,
                ..
            } => {
                if *prev_page_id == NULL_PAGE {
                    return Ok(());
                }
                let undone = self
                    .buffer_pool
                    .get_page(PageKey::new(db_oid, oid, *page_id))?;
                let (next, foreign_rows) = {
                    let page = undone.read();
                    let table = page.table();
                    let foreign = (0..table.record_count())
                        .filter_map(|slot| table.record_header(slot).ok())
                        .any(|h| h.xmin != xid);
                    (table.next_page_id(), foreign)
                };
                // Rows of other transactions keep the page in the chain.
                if foreign_rows {
                    return Ok(());
                }
                let prev = self
                    .buffer_pool
                    .get_page(PageKey::new(db_oid, oid, *prev_page_id))?;
                let mut page = prev.write();
                if page.table().next_page_id() == *page_id {
                    page.table_mut().set_next_page_id(next);
                }
                self.mark_dirty(oid, *prev_page_id, record.lsn);
            }
            _ => {}
        }
        Ok(())
    }

    fn db_oid_of(&self, oid: Oid) -> Option<Oid> {
        self.catalog.database_oid(oid).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;
    use crate::catalog::Catalog;
    use crate::config::EngineConfig;
    use crate::log_storage::LogStorage;
    use crate::record::{Column, ColumnType, Value};
    use crate::transaction::TransactionManager;
    use crate::{Database, IsolationLevel};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn config(dir: &Path) -> EngineConfig {
        let mut config = EngineConfig::new(dir);
        config.sync_writes = false;
        config
    }

    fn components(config: &EngineConfig) -> (Arc<BufferPool>, Arc<LogManager>) {
        let catalog = Arc::new(Catalog::open(config.catalog_path(), config.db_oid).unwrap());
        let pool = Arc::new(BufferPool::new(config));
        let log = LogManager::open(config, pool.clone(), catalog, Arc::new(TransactionManager::new()))
            .unwrap();
        (pool, log)
    }

    /// Creates a one-page table with a few committed changes and crashes.
    fn crashed_table(config: &EngineConfig) -> Oid {
        let db = Database::open(config.clone()).unwrap();
        let meta = db
            .create_table("t", vec![Column::new("id", ColumnType::Int)])
            .unwrap();
        let tx = db.begin(IsolationLevel::ReadCommitted).unwrap();
        let mut rids = Vec::new();
        for i in 0..3 {
            rids.push(db.insert(&tx, "t", vec![Value::Int(i)]).unwrap());
        }
        db.delete(&tx, "t", rids[1]).unwrap();
        db.commit(&tx).unwrap();
        db.crash();
        meta.oid
    }

    fn first_page(pool: &BufferPool, config: &EngineConfig, oid: Oid) -> Vec<u8> {
        let guard = pool.get_page(PageKey::new(config.db_oid, oid, 0)).unwrap();
        let page = guard.read();
        page.data.to_vec()
    }

    #[test]
    fn redo_is_idempotent() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let oid = crashed_table(&config);

        let (pool, log) = components(&config);
        let first = log.recover().unwrap();
        assert!(first.redone >= 5);
        assert_eq!(log.redo_count(), first.redone as u64);
        let once = first_page(&pool, &config, oid);
        // Write the redone page so the second pass finds it already up to date.
        pool.flush_all().unwrap();
        drop((pool, log));

        let (pool, log) = components(&config);
        let second = log.recover().unwrap();
        assert_eq!(second.redone, 0);
        assert_eq!(second.analyzed, first.analyzed);
        assert_eq!(first_page(&pool, &config, oid), once);
    }

    #[test]
    fn redo_from_an_unwritten_page_matches_redo_over_a_written_one() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let oid = crashed_table(&config);

        let (pool, log) = components(&config);
        log.recover().unwrap();
        let once = first_page(&pool, &config, oid);
        pool.drop_all();
        drop((pool, log));

        let (pool, log) = components(&config);
        log.recover().unwrap();
        assert_eq!(first_page(&pool, &config, oid), once);
    }

    #[test]
    fn loser_from_an_asynchronous_checkpoint_is_undone() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let db = Database::open(config.clone()).unwrap();
        db.create_table("t", vec![Column::new("id", ColumnType::Int)])
            .unwrap();
        let tx = db.begin(IsolationLevel::ReadCommitted).unwrap();
        db.insert(&tx, "t", vec![Value::Int(1)]).unwrap();
        db.log_manager().checkpoint(true).unwrap();
        db.crash();

        let db = Database::open(config).unwrap();
        assert_eq!(db.recovery_stats().undone, 1);
        let reader = db.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(db.scan(&reader, "t").unwrap().is_empty());
    }

    #[test]
    fn master_record_must_point_at_a_checkpoint() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        crashed_table(&config);

        let mut storage = LogStorage::open(&config).unwrap();
        let not_a_checkpoint = storage
            .scan(FIRST_LSN)
            .unwrap()
            .records
            .iter()
            .find(|r| matches!(r.body, LogBody::NewPage { .. }))
            .map(|r| r.lsn)
            .unwrap();
        storage.store_master(not_a_checkpoint).unwrap();
        drop(storage);

        assert!(matches!(
            Database::open(config),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn durable_end_beyond_the_log_is_corruption() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        crashed_table(&config);

        let storage = LogStorage::open(&config).unwrap();
        storage.store_next_lsn(storage.end() + 4096).unwrap();
        drop(storage);

        assert!(matches!(
            Database::open(config),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn xid_counter_survives_a_log_tail_without_transactions() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());

        let (_pool, log) = components(&config);
        log.recover().unwrap();
        log.transactions.set_next_xid(42);
        log.checkpoint(false).unwrap();
        drop(log);

        let (_pool, log) = components(&config);
        log.recover().unwrap();
        assert_eq!(log.transactions.get_next_xid(), 42);
    }
}
