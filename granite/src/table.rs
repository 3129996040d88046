//! Table heap: a chain of slotted pages with logged inserts and deletes, and
//! the MVCC table scan over it.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::buffer_pool::{BufferPool, PageGuard, PageKey};
use crate::catalog::TableMeta;
use crate::log_manager::LogManager;
use crate::page::MAX_RECORD_SIZE;
use crate::record::{Record, RecordHeader};
use crate::transaction::ActiveSet;
use crate::visibility::{is_visible, IsolationLevel};
use crate::{
    CommandId, PageId, Result, Rid, SlotId, StorageError, TransactionId, DDL_XID, NULL_PAGE,
    NULL_XID,
};

pub struct Table {
    meta: TableMeta,
    buffer_pool: Arc<BufferPool>,
    log_manager: Arc<LogManager>,
}

impl Table {
    pub fn new(meta: TableMeta, buffer_pool: Arc<BufferPool>, log_manager: Arc<LogManager>) -> Self {
        Self {
            meta,
            buffer_pool,
            log_manager,
        }
    }

    /// Allocates and logs the first page of a freshly registered table.
    pub fn create(
        meta: TableMeta,
        buffer_pool: Arc<BufferPool>,
        log_manager: Arc<LogManager>,
    ) -> Result<Self> {
        let guard = buffer_pool.allocate_page(meta.db_oid, meta.oid)?;
        let page_id = guard.key().page_id;
        if page_id != meta.first_page_id {
            return Err(StorageError::corruption(format!(
                "table {} already has pages on disk",
                meta.oid
            )));
        }
        let lsn = log_manager.append_new_page_log(DDL_XID, meta.oid, NULL_PAGE, page_id)?;
        guard.write().table_mut().set_page_lsn(lsn);
        drop(guard);
        log_manager.flush(Some(lsn))?;
        debug!(oid = meta.oid, lsn, "allocated first page");
        Ok(Self::new(meta, buffer_pool, log_manager))
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    fn page(&self, page_id: PageId) -> Result<PageGuard> {
        self.buffer_pool
            .get_page(PageKey::new(self.meta.db_oid, self.meta.oid, page_id))
    }

    /// Inserts into the first page with room, extending the chain when none has.
    pub fn insert_record(
        &self,
        record: &mut Record,
        xid: TransactionId,
        cid: CommandId,
    ) -> Result<Rid> {
        record.check_schema(&self.meta.columns)?;
        let size = record.size();
        if size > MAX_RECORD_SIZE {
            return Err(StorageError::RecordTooLarge {
                size,
                max: MAX_RECORD_SIZE,
            });
        }
        record.header = RecordHeader {
            deleted: false,
            xmin: xid,
            xmax: NULL_XID,
            cid,
        };
        let bytes = record.to_bytes();

        let mut page_id = self.meta.first_page_id;
        loop {
            let guard = self.page(page_id)?;
            let (fits, next) = {
                let page = guard.read();
                let table = page.table();
                (table.free_space_size() >= size, table.next_page_id())
            };

            if fits {
                let mut page = guard.write();
                if page.table().free_space_size() >= size {
                    let slot_id = page.table().record_count();
                    let offset = page.table().upper() - size as u32;
                    let lsn = self.log_manager.append_insert_log(
                        xid,
                        self.meta.oid,
                        page_id,
                        slot_id,
                        offset,
                        bytes.clone(),
                    )?;
                    let mut table = page.table_mut();
                    let inserted = table.insert_record(record, xid, cid)?;
                    debug_assert_eq!(inserted, slot_id);
                    table.set_page_lsn(lsn);
                    let rid = Rid::new(page_id, slot_id);
                    trace!(oid = self.meta.oid, %rid, lsn, "inserted record");
                    return Ok(rid);
                }
                continue;
            }

            if next != NULL_PAGE {
                page_id = next;
                continue;
            }

            let mut page = guard.write();
            if page.table().next_page_id() != NULL_PAGE {
                // Another inserter extended the chain first.
                continue;
            }
            let new_guard = self
                .buffer_pool
                .allocate_page(self.meta.db_oid, self.meta.oid)?;
            let new_page_id = new_guard.key().page_id;
            let lsn = self
                .log_manager
                .append_new_page_log(xid, self.meta.oid, page_id, new_page_id)?;
            {
                let mut table = page.table_mut();
                table.set_next_page_id(new_page_id);
                table.set_page_lsn(lsn);
            }
            new_guard.write().table_mut().set_page_lsn(lsn);
            debug!(oid = self.meta.oid, prev = page_id, page_id = new_page_id, lsn, "extended table");
            page_id = new_page_id;
        }
    }

    /// Logically deletes the record at `rid` on behalf of `xid`.
    pub fn delete_record(&self, rid: Rid, xid: TransactionId) -> Result<()> {
        let guard = self.page(rid.page_id)?;
        let mut page = guard.write();
        let header = page.table().record_header(rid.slot_id)?;
        if header.is_deleted() {
            return Err(StorageError::RecordDeleted(rid));
        }
        let lsn = self
            .log_manager
            .append_delete_log(xid, self.meta.oid, rid.page_id, rid.slot_id)?;
        let mut table = page.table_mut();
        table.delete_record(rid.slot_id, xid)?;
        table.set_page_lsn(lsn);
        trace!(oid = self.meta.oid, %rid, lsn, "deleted record");
        Ok(())
    }

    /// Replaces the record at `rid`: deletes it and inserts `record` as a new version.
    pub fn update_record(
        &self,
        rid: Rid,
        xid: TransactionId,
        cid: CommandId,
        record: &mut Record,
    ) -> Result<Rid> {
        record.check_schema(&self.meta.columns)?;
        self.delete_record(rid, xid)?;
        self.insert_record(record, xid, cid)
    }

    pub fn get_record(&self, rid: Rid) -> Result<Record> {
        let guard = self.page(rid.page_id)?;
        let page = guard.read();
        page.table().get_record(rid, &self.meta.columns)
    }

    /// Scans the table as seen by `(xid, cid)`. `active` is the snapshot used
    /// by the visibility rules.
    pub fn scan(
        &self,
        isolation: IsolationLevel,
        xid: TransactionId,
        cid: CommandId,
        active: ActiveSet,
    ) -> TableScan<'_> {
        TableScan {
            table: self,
            isolation,
            xid,
            cid,
            active,
            page_id: self.meta.first_page_id,
            slot_id: 0,
            current: None,
        }
    }
}

/// Iterator over the records of a table visible to one reader.
pub struct TableScan<'a> {
    table: &'a Table,
    isolation: IsolationLevel,
    xid: TransactionId,
    cid: CommandId,
    active: ActiveSet,
    page_id: PageId,
    slot_id: SlotId,
    current: Option<PageGuard>,
}

impl TableScan<'_> {
    fn advance(&mut self) -> Result<Option<Record>> {
        loop {
            if self.page_id == NULL_PAGE {
                return Ok(None);
            }
            let guard = match self.current.take() {
                Some(guard) => guard,
                None => self.table.page(self.page_id)?,
            };
            let found = {
                let page = guard.read();
                let table = page.table();
                let mut found = None;
                while self.slot_id < table.record_count() {
                    let slot_id = self.slot_id;
                    self.slot_id += 1;
                    let header = table.record_header(slot_id)?;
                    if is_visible(self.isolation, self.xid, self.cid, &self.active, &header) {
                        let rid = Rid::new(self.page_id, slot_id);
                        found = Some(table.get_record(rid, &self.table.meta.columns)?);
                        break;
                    }
                }
                if found.is_none() {
                    self.page_id = table.next_page_id();
                    self.slot_id = 0;
                }
                found
            };
            if found.is_some() {
                self.current = Some(guard);
                return Ok(found);
            }
        }
    }
}

impl Iterator for TableScan<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(record) => record.map(Ok),
            Err(e) => {
                self.page_id = NULL_PAGE;
                self.current = None;
                Some(Err(e))
            }
        }
    }
}
