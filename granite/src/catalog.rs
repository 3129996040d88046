//! Table metadata, persisted as JSON next to the log.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::record::ColumnList;
use crate::{Oid, PageId, Result, StorageError};

/// Oids below this are reserved for databases.
const FIRST_TABLE_OID: Oid = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub oid: Oid,
    pub db_oid: Oid,
    pub name: String,
    pub columns: ColumnList,
    pub first_page_id: PageId,
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogState {
    next_oid: Oid,
    tables: BTreeMap<Oid, TableMeta>,
}

impl Default for CatalogState {
    fn default() -> Self {
        Self {
            next_oid: FIRST_TABLE_OID,
            tables: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct Catalog {
    path: PathBuf,
    db_oid: Oid,
    state: RwLock<CatalogState>,
}

impl Catalog {
    /// Loads the catalog at `path`, or starts an empty one if the file is missing.
    pub fn open(path: impl AsRef<Path>, db_oid: Oid) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == ErrorKind::NotFound => CatalogState::default(),
            Err(e) => return Err(e.into()),
        };
        info!(path = ?path, tables = state.tables.len(), "loaded catalog");
        Ok(Self {
            path,
            db_oid,
            state: RwLock::new(state),
        })
    }

    /// Registers a new table whose first page is page 0.
    pub fn create_table(&self, name: &str, columns: ColumnList) -> Result<TableMeta> {
        if columns.is_empty() {
            return Err(StorageError::SchemaMismatch(format!(
                "table {name} has no columns"
            )));
        }
        let mut state = self.state.write();
        if state.tables.values().any(|t| t.name == name) {
            return Err(StorageError::TableExists(name.to_string()));
        }
        let oid = state.next_oid;
        let meta = TableMeta {
            oid,
            db_oid: self.db_oid,
            name: name.to_string(),
            columns,
            first_page_id: 0,
        };
        state.next_oid += 1;
        state.tables.insert(oid, meta.clone());
        if let Err(e) = self.persist(&state) {
            state.tables.remove(&oid);
            state.next_oid -= 1;
            return Err(e);
        }
        info!(oid, name, "created table");
        Ok(meta)
    }

    pub fn table_exists(&self, oid: Oid) -> bool {
        self.state.read().tables.contains_key(&oid)
    }

    pub fn database_oid(&self, oid: Oid) -> Result<Oid> {
        self.table(oid).map(|t| t.db_oid)
    }

    pub fn table(&self, oid: Oid) -> Result<TableMeta> {
        self.state
            .read()
            .tables
            .get(&oid)
            .cloned()
            .ok_or(StorageError::TableNotFound(oid))
    }

    pub fn table_by_name(&self, name: &str) -> Option<TableMeta> {
        self.state
            .read()
            .tables
            .values()
            .find(|t| t.name == name)
            .cloned()
    }

    pub fn tables(&self) -> Vec<TableMeta> {
        self.state.read().tables.values().cloned().collect()
    }

    fn persist(&self, state: &CatalogState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(path = ?self.path, "persisted catalog");
        Ok(())
    }
}
