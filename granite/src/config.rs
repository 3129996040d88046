//! Engine configuration and on-disk layout.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::lock_manager::DeadlockPolicy;
use crate::Oid;

const DEFAULT_BUFFER_POOL_FRAMES: usize = 100;
const DEFAULT_DB_OID: Oid = 1;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the log, side records, catalog and table files.
    pub data_dir: PathBuf,
    /// Number of frames in the buffer pool.
    pub buffer_pool_frames: usize,
    /// Database oid that owns every table created through this engine.
    pub db_oid: Oid,
    pub deadlock_policy: DeadlockPolicy,
    /// fsync the log and page files on every flush.
    pub sync_writes: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("granite_data"),
            buffer_pool_frames: DEFAULT_BUFFER_POOL_FRAMES,
            db_oid: DEFAULT_DB_OID,
            deadlock_policy: DeadlockPolicy::None,
            sync_writes: true,
        }
    }
}

impl EngineConfig {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Builds a configuration from `GRANITE_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = std::env::var_os("GRANITE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(frames) = env_parse::<usize>("GRANITE_BUFFER_POOL_FRAMES") {
            config.buffer_pool_frames = frames.max(1);
        }
        if let Some(db_oid) = env_parse::<Oid>("GRANITE_DB_OID") {
            config.db_oid = db_oid;
        }
        if let Some(policy) = env_parse::<DeadlockPolicy>("GRANITE_DEADLOCK_POLICY") {
            config.deadlock_policy = policy;
        }
        if let Some(sync) = env_parse::<bool>("GRANITE_SYNC_WRITES") {
            config.sync_writes = sync;
        }
        config
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("wal.log")
    }

    pub fn next_lsn_path(&self) -> PathBuf {
        self.data_dir.join("wal.next_lsn")
    }

    pub fn master_record_path(&self) -> PathBuf {
        self.data_dir.join("wal.master")
    }

    pub fn next_xid_path(&self) -> PathBuf {
        self.data_dir.join("wal.next_xid")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("catalog.json")
    }

    pub fn table_path(&self, db_oid: Oid, oid: Oid) -> PathBuf {
        self.data_dir
            .join("base")
            .join(db_oid.to_string())
            .join(format!("{oid}.tbl"))
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|raw| raw.trim().parse().ok())
}
