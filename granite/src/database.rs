//! The engine facade: opens storage, runs recovery, and drives transactions
//! through the lock manager, the table heap and the log.

use std::fs;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::buffer_pool::BufferPool;
use crate::catalog::{Catalog, TableMeta};
use crate::config::EngineConfig;
use crate::lock_manager::{LockManager, LockType};
use crate::log_manager::LogManager;
use crate::record::{ColumnList, Record, Value};
use crate::recovery::RecoveryStats;
use crate::table::Table;
use crate::transaction::TransactionManager;
use crate::visibility::IsolationLevel;
use crate::{CommandId, Lsn, Oid, Result, Rid, StorageError, TransactionId};

/// A client transaction handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    xid: TransactionId,
    isolation: IsolationLevel,
    cid: CommandId,
}

impl Transaction {
    pub fn xid(&self) -> TransactionId {
        self.xid
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn cid(&self) -> CommandId {
        self.cid
    }

    /// Starts the next statement; rows inserted by earlier statements become
    /// visible to it.
    pub fn next_command(&mut self) -> CommandId {
        self.cid += 1;
        self.cid
    }
}

pub struct Database {
    config: EngineConfig,
    catalog: Arc<Catalog>,
    buffer_pool: Arc<BufferPool>,
    transactions: Arc<TransactionManager>,
    log_manager: Arc<LogManager>,
    lock_manager: LockManager,
    recovery: RecoveryStats,
}

impl Database {
    /// Opens the data directory, recovers it, and checkpoints the recovered state.
    pub fn open(config: EngineConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        info!(data_dir = ?config.data_dir, "opening database");

        let catalog = Arc::new(Catalog::open(config.catalog_path(), config.db_oid)?);
        let buffer_pool = Arc::new(BufferPool::new(&config));
        let transactions = Arc::new(TransactionManager::new());
        let log_manager = LogManager::open(
            &config,
            buffer_pool.clone(),
            catalog.clone(),
            transactions.clone(),
        )?;

        let recovery = log_manager.recover()?;
        log_manager.checkpoint(false)?;

        Ok(Self {
            lock_manager: LockManager::with_policy(config.deadlock_policy),
            config,
            catalog,
            buffer_pool,
            transactions,
            log_manager,
            recovery,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// What recovery did when this database was opened.
    pub fn recovery_stats(&self) -> RecoveryStats {
        self.recovery
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log_manager
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn begin(&self, isolation: IsolationLevel) -> Result<Transaction> {
        let xid = self.transactions.begin(isolation);
        if let Err(e) = self.log_manager.append_begin_log(xid) {
            self.transactions.finish(xid);
            return Err(e);
        }
        Ok(Transaction {
            xid,
            isolation,
            cid: 0,
        })
    }

    pub fn commit(&self, tx: &Transaction) -> Result<Lsn> {
        let lsn = self.log_manager.append_commit_log(tx.xid)?;
        self.end(tx.xid);
        info!(xid = tx.xid, lsn, "committed");
        Ok(lsn)
    }

    pub fn rollback(&self, tx: &Transaction) -> Result<Lsn> {
        self.log_manager.rollback(tx.xid)?;
        let lsn = self.log_manager.append_rollback_log(tx.xid)?;
        self.end(tx.xid);
        info!(xid = tx.xid, lsn, "rolled back");
        Ok(lsn)
    }

    fn end(&self, xid: TransactionId) {
        self.lock_manager.release_locks(xid);
        self.transactions.finish(xid);
    }

    pub fn create_table(&self, name: &str, columns: ColumnList) -> Result<TableMeta> {
        let meta = self.catalog.create_table(name, columns)?;
        Table::create(
            meta.clone(),
            self.buffer_pool.clone(),
            self.log_manager.clone(),
        )?;
        Ok(meta)
    }

    pub fn table(&self, name: &str) -> Result<Table> {
        let meta = self
            .catalog
            .table_by_name(name)
            .ok_or_else(|| StorageError::UnknownTable(name.to_string()))?;
        Ok(Table::new(
            meta,
            self.buffer_pool.clone(),
            self.log_manager.clone(),
        ))
    }

    fn lock_table(&self, tx: &Transaction, lock_type: LockType, oid: Oid) -> Result<()> {
        if self.lock_manager.lock_table(tx.xid, lock_type, oid) {
            Ok(())
        } else {
            warn!(xid = tx.xid, oid, ?lock_type, "table lock refused");
            Err(StorageError::LockConflict {
                xid: tx.xid,
                oid,
                lock_type,
            })
        }
    }

    fn lock_row(&self, tx: &Transaction, lock_type: LockType, oid: Oid, rid: Rid) -> Result<()> {
        if self.lock_manager.lock_row(tx.xid, lock_type, oid, rid) {
            Ok(())
        } else {
            warn!(xid = tx.xid, oid, %rid, ?lock_type, "row lock refused");
            Err(StorageError::LockConflict {
                xid: tx.xid,
                oid,
                lock_type,
            })
        }
    }

    pub fn insert(&self, tx: &Transaction, table: &str, values: Vec<Value>) -> Result<Rid> {
        let table = self.table(table)?;
        self.lock_table(tx, LockType::IX, table.meta().oid)?;
        let mut record = Record::new(values);
        table.insert_record(&mut record, tx.xid, tx.cid)
    }

    pub fn delete(&self, tx: &Transaction, table: &str, rid: Rid) -> Result<()> {
        let table = self.table(table)?;
        let oid = table.meta().oid;
        self.lock_table(tx, LockType::IX, oid)?;
        self.lock_row(tx, LockType::X, oid, rid)?;
        table.delete_record(rid, tx.xid)
    }

    pub fn update(
        &self,
        tx: &Transaction,
        table: &str,
        rid: Rid,
        values: Vec<Value>,
    ) -> Result<Rid> {
        let table = self.table(table)?;
        let oid = table.meta().oid;
        self.lock_table(tx, LockType::IX, oid)?;
        self.lock_row(tx, LockType::X, oid, rid)?;
        let mut record = Record::new(values);
        table.update_record(rid, tx.xid, tx.cid, &mut record)
    }

    /// Records of `table` visible to the transaction's current command.
    pub fn scan(&self, tx: &Transaction, table: &str) -> Result<Vec<Record>> {
        let table = self.table(table)?;
        self.lock_table(tx, LockType::IS, table.meta().oid)?;
        let active = match tx.isolation {
            IsolationLevel::ReadCommitted => self.transactions.get_active_transactions(),
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                self.transactions.get_snapshot(tx.xid)
            }
        };
        let records = table
            .scan(tx.isolation, tx.xid, tx.cid, active)
            .collect::<Result<Vec<_>>>()?;
        debug!(xid = tx.xid, table = %table.meta().name, rows = records.len(), "scan");
        Ok(records)
    }

    pub fn checkpoint(&self) -> Result<Lsn> {
        self.log_manager.checkpoint(false)
    }

    /// Writes every dirty page back to its table file.
    pub fn flush(&self) -> Result<()> {
        self.buffer_pool.flush_all()
    }

    /// Drops the database without writing buffered log records or dirty pages.
    pub fn crash(self) {
        warn!("simulating crash");
        self.log_manager.discard_buffer();
        self.buffer_pool.drop_all();
    }
}
