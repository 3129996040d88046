//! The log device: an append-only file addressed by LSN, plus the side
//! records that point into it and carry the transaction id counter.
//!
//! The log file starts with an 8-byte magic so that the first record lives at
//! [`FIRST_LSN`] and `NULL_LSN` never names a real record. Side records are
//! `value: u64 | crc32: u32`, replaced atomically by writing a temporary file and
//! renaming it over the old one.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::failpoint;
use crate::log_record::{LogRecord, LOG_HEADER_SIZE};
use crate::{Lsn, Result, StorageError, TransactionId};

pub const LOG_MAGIC: [u8; 8] = *b"GRNTWAL1";
/// Position of the first record in the log file.
pub const FIRST_LSN: Lsn = LOG_MAGIC.len() as Lsn;

const SIDE_RECORD_SIZE: usize = 12;

/// Result of scanning the log forward from some LSN.
#[derive(Debug, Default)]
pub struct LogScan {
    pub records: Vec<LogRecord>,
    /// Position just after the last valid record.
    pub end: Lsn,
}

pub struct LogStorage {
    file: File,
    /// Bytes of the log file that have been written through this handle or found at open.
    end: Lsn,
    sync_writes: bool,
    next_lsn_path: PathBuf,
    master_path: PathBuf,
    next_xid_path: PathBuf,
}

impl LogStorage {
    pub fn open(config: &EngineConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let path = config.log_path();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            file.write_all(&LOG_MAGIC)?;
            file.sync_all()?;
            info!(path = ?path, "created log file");
        } else {
            let mut magic = [0u8; 8];
            file.seek(SeekFrom::Start(0))?;
            if len < FIRST_LSN || file.read_exact(&mut magic).is_err() || magic != LOG_MAGIC {
                return Err(StorageError::corruption(format!(
                    "{} is not a log file",
                    path.display()
                )));
            }
        }
        let end = file.metadata()?.len();
        debug!(path = ?path, end, "opened log file");

        Ok(Self {
            file,
            end,
            sync_writes: config.sync_writes,
            next_lsn_path: config.next_lsn_path(),
            master_path: config.master_record_path(),
            next_xid_path: config.next_xid_path(),
        })
    }

    pub fn end(&self) -> Lsn {
        self.end
    }

    /// Writes `bytes` at `lsn`, which must be the current end of the log.
    pub fn append(&mut self, lsn: Lsn, bytes: &[u8]) -> Result<()> {
        if lsn != self.end {
            return Err(StorageError::corruption(format!(
                "log append at {lsn} leaves a gap after {}",
                self.end
            )));
        }
        failpoint::maybe_fail(failpoint::LOG_WRITE)?;
        self.file.seek(SeekFrom::Start(lsn))?;
        self.file.write_all(bytes)?;
        failpoint::maybe_fail(failpoint::LOG_SYNC)?;
        if self.sync_writes {
            self.file.sync_data()?;
        }
        self.end = lsn + bytes.len() as Lsn;
        Ok(())
    }

    /// Reads and validates the record at `lsn`.
    pub fn read_record(&mut self, lsn: Lsn) -> Result<LogRecord> {
        self.try_read(lsn)?.ok_or_else(|| {
            StorageError::corruption(format!("no log record at {lsn} (log ends at {})", self.end))
        })
    }

    /// Reads the record at `lsn`; `Ok(None)` if the log ends before a full record.
    fn try_read(&mut self, lsn: Lsn) -> Result<Option<LogRecord>> {
        if lsn < FIRST_LSN || lsn + LOG_HEADER_SIZE as Lsn > self.end {
            return Ok(None);
        }
        let mut len_buf = [0u8; 4];
        self.file.seek(SeekFrom::Start(lsn))?;
        self.file.read_exact(&mut len_buf)?;
        let len = LogRecord::peek_len(&len_buf)?;
        if lsn + len as Lsn > self.end {
            return Ok(None);
        }
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(lsn))?;
        self.file.read_exact(&mut buf)?;
        LogRecord::deserialize(lsn, &buf).map(Some)
    }

    /// Decodes records forward from `from` and stops at the first position that
    /// does not hold a complete, valid record.
    pub fn scan(&mut self, from: Lsn) -> Result<LogScan> {
        let mut scan = LogScan {
            records: Vec::new(),
            end: from.max(FIRST_LSN),
        };
        loop {
            match self.try_read(scan.end) {
                Ok(Some(record)) => {
                    scan.end += record.size() as Lsn;
                    scan.records.push(record);
                }
                Ok(None) => break,
                Err(StorageError::Corruption(reason)) => {
                    warn!(lsn = scan.end, %reason, "log scan stopped at invalid record");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(scan)
    }

    /// Cuts off everything after `end`, such as a torn final write.
    pub fn truncate(&mut self, end: Lsn) -> Result<()> {
        let end = end.max(FIRST_LSN);
        let len = self.file.metadata()?.len();
        if len > end {
            warn!(from = len, to = end, "truncating log tail");
            self.file.set_len(end)?;
            self.file.sync_all()?;
        }
        self.end = end;
        Ok(())
    }

    pub fn load_next_lsn(&self) -> Result<Option<Lsn>> {
        load_side_record(&self.next_lsn_path)
    }

    pub fn store_next_lsn(&self, lsn: Lsn) -> Result<()> {
        store_side_record(&self.next_lsn_path, lsn, self.sync_writes)
    }

    /// LSN of the BeginCheckpoint record of the latest complete checkpoint.
    pub fn load_master(&self) -> Result<Option<Lsn>> {
        load_side_record(&self.master_path)
    }

    pub fn store_master(&self, lsn: Lsn) -> Result<()> {
        store_side_record(&self.master_path, lsn, self.sync_writes)
    }

    /// Lowest transaction id not yet handed out when the latest checkpoint ran.
    pub fn load_next_xid(&self) -> Result<Option<TransactionId>> {
        match load_side_record(&self.next_xid_path)? {
            Some(value) => TransactionId::try_from(value).map(Some).map_err(|_| {
                StorageError::corruption(format!("next xid side record holds {value}"))
            }),
            None => Ok(None),
        }
    }

    pub fn store_next_xid(&self, xid: TransactionId) -> Result<()> {
        store_side_record(&self.next_xid_path, xid as u64, self.sync_writes)
    }
}

fn side_record_crc(raw: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(raw);
    hasher.finalize()
}

fn load_side_record(path: &Path) -> Result<Option<Lsn>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if bytes.len() != SIDE_RECORD_SIZE {
        return Err(StorageError::corruption(format!(
            "side record {} has {} bytes",
            path.display(),
            bytes.len()
        )));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    let stored = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    if side_record_crc(&raw) != stored {
        return Err(StorageError::corruption(format!(
            "side record {} crc mismatch",
            path.display()
        )));
    }
    Ok(Some(Lsn::from_be_bytes(raw)))
}

fn store_side_record(path: &Path, lsn: Lsn, sync: bool) -> Result<()> {
    let raw = lsn.to_be_bytes();
    let mut bytes = Vec::with_capacity(SIDE_RECORD_SIZE);
    bytes.extend_from_slice(&raw);
    bytes.extend_from_slice(&side_record_crc(&raw).to_be_bytes());

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        if sync {
            file.sync_all()?;
        }
    }
    failpoint::maybe_fail(failpoint::SIDE_RECORD_RENAME)?;
    fs::rename(&tmp, path)?;
    if sync {
        if let Some(dir) = path.parent() {
            File::open(dir)?.sync_all()?;
        }
    }
    debug!(path = ?path, lsn, "stored side record");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_record::LogBody;
    use crate::NULL_LSN;
    use tempfile::tempdir;

    fn config(dir: &Path) -> EngineConfig {
        let mut config = EngineConfig::new(dir);
        config.sync_writes = false;
        config
    }

    fn begin(xid: u32, lsn: Lsn) -> LogRecord {
        let mut record = LogRecord::new(xid, NULL_LSN, LogBody::Begin);
        record.lsn = lsn;
        record
    }

    #[test]
    fn new_log_starts_after_magic() {
        let dir = tempdir().unwrap();
        let storage = LogStorage::open(&config(dir.path())).unwrap();
        assert_eq!(storage.end(), FIRST_LSN);
        assert_eq!(fs::read(dir.path().join("wal.log")).unwrap(), LOG_MAGIC);
    }

    #[test]
    fn foreign_file_is_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("wal.log"), b"not a log at all").unwrap();
        assert!(matches!(
            LogStorage::open(&config(dir.path())),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn scan_stops_at_torn_tail() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let mut storage = LogStorage::open(&cfg).unwrap();
        let first = begin(1, FIRST_LSN);
        let second = begin(2, FIRST_LSN + first.size() as Lsn);
        storage.append(first.lsn, &first.serialize()).unwrap();
        let torn = second.serialize();
        storage.append(second.lsn, &torn[..torn.len() - 3]).unwrap();
        drop(storage);

        let mut storage = LogStorage::open(&cfg).unwrap();
        let scan = storage.scan(FIRST_LSN).unwrap();
        assert_eq!(scan.records, vec![first]);
        assert_eq!(scan.end, second.lsn);

        storage.truncate(scan.end).unwrap();
        assert_eq!(storage.end(), second.lsn);
        assert_eq!(
            fs::metadata(cfg.log_path()).unwrap().len(),
            second.lsn
        );
    }

    #[test]
    fn append_must_be_contiguous() {
        let dir = tempdir().unwrap();
        let mut storage = LogStorage::open(&config(dir.path())).unwrap();
        let record = begin(1, FIRST_LSN + 10);
        assert!(storage.append(record.lsn, &record.serialize()).is_err());
    }

    #[test]
    fn side_records_survive_reopen_and_detect_damage() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let storage = LogStorage::open(&cfg).unwrap();
        assert_eq!(storage.load_master().unwrap(), None);
        storage.store_master(1234).unwrap();
        storage.store_next_lsn(5678).unwrap();
        assert_eq!(storage.load_master().unwrap(), Some(1234));
        assert_eq!(storage.load_next_lsn().unwrap(), Some(5678));

        let mut bytes = fs::read(cfg.master_record_path()).unwrap();
        bytes[0] ^= 1;
        fs::write(cfg.master_record_path(), bytes).unwrap();
        assert!(matches!(
            storage.load_master(),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn failed_rename_keeps_previous_side_record() {
        let dir = tempdir().unwrap();
        let storage = LogStorage::open(&config(dir.path())).unwrap();
        storage.store_master(100).unwrap();
        failpoint::enable(failpoint::SIDE_RECORD_RENAME);
        assert!(storage.store_master(200).is_err());
        failpoint::clear();
        assert_eq!(storage.load_master().unwrap(), Some(100));
    }

    #[test]
    fn next_xid_side_record_is_separate_from_the_master() {
        let dir = tempdir().unwrap();
        let storage = LogStorage::open(&config(dir.path())).unwrap();
        assert_eq!(storage.load_next_xid().unwrap(), None);
        storage.store_master(4096).unwrap();
        storage.store_next_xid(17).unwrap();
        storage.store_next_lsn(8192).unwrap();

        let storage = LogStorage::open(&config(dir.path())).unwrap();
        assert_eq!(storage.load_next_xid().unwrap(), Some(17));
        assert_eq!(storage.load_master().unwrap(), Some(4096));
        assert_eq!(storage.load_next_lsn().unwrap(), Some(8192));
    }
}
