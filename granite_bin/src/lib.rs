//! Administrative commands over a granite data directory.
//!
//! Every data command runs in its own auto-committed transaction. Opening the
//! directory always runs crash recovery first.

pub mod errors;

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use granite::log_storage::{LogStorage, FIRST_LSN};
use granite::{
    Column, ColumnType, Database, DeadlockPolicy, EngineConfig, IsolationLevel, Lsn, Rid, Value,
};
use tracing::info;

pub use errors::CliError;

#[derive(Parser, Debug)]
#[command(
    name = "granite",
    version,
    about = "Inspect and drive a granite storage directory",
    disable_help_subcommand = true
)]
pub struct Cli {
    #[arg(long, global = true, env = "GRANITE_DATA_DIR", help = "Data directory")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Buffer pool size in frames")]
    pub frames: Option<usize>,

    #[arg(long, global = true, help = "Lock manager deadlock policy")]
    pub deadlock_policy: Option<DeadlockPolicy>,

    #[arg(long, global = true, help = "Skip fsync on log and page writes")]
    pub no_sync: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run crash recovery and report what it did.
    Recover,
    /// Flush every dirty page and write a checkpoint.
    Checkpoint,
    /// Print the log records starting at an LSN.
    DumpLog {
        #[arg(long, default_value_t = FIRST_LSN)]
        from: Lsn,
    },
    /// Register a table; columns are given as name:type.
    CreateTable {
        name: String,
        #[arg(required = true, value_name = "NAME:TYPE")]
        columns: Vec<String>,
    },
    /// Insert one row.
    Insert {
        table: String,
        #[arg(required = true)]
        values: Vec<String>,
    },
    /// Delete the row at (page, slot).
    Delete {
        table: String,
        page_id: u32,
        slot_id: u32,
    },
    /// Print the rows visible to a fresh transaction.
    Scan {
        table: String,
        #[arg(long, default_value = "read-committed")]
        isolation: IsolationLevel,
    },
    /// List registered tables.
    Tables,
}

impl Cli {
    pub fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::from_env();
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(frames) = self.frames {
            config.buffer_pool_frames = frames.max(1);
        }
        if let Some(policy) = self.deadlock_policy {
            config.deadlock_policy = policy;
        }
        if self.no_sync {
            config.sync_writes = false;
        }
        config
    }
}

fn parse_column(spec: &str) -> Result<Column, CliError> {
    let (name, ty) = spec
        .split_once(':')
        .ok_or_else(|| CliError::InvalidColumn(spec.to_string()))?;
    if name.is_empty() {
        return Err(CliError::InvalidColumn(spec.to_string()));
    }
    let ty: ColumnType = ty.parse()?;
    Ok(Column::new(name, ty))
}

pub fn run(cli: Cli, out: &mut impl Write) -> Result<(), CliError> {
    let config = cli.config();
    let command = match cli.command {
        Command::DumpLog { from } => return dump_log(&config, from, out),
        command => command,
    };

    let db = Database::open(config)?;
    match command {
        Command::Recover => {
            let stats = db.recovery_stats();
            writeln!(
                out,
                "analyzed: {}\tredone: {}\tundone: {}",
                stats.analyzed, stats.redone, stats.undone
            )?;
        }
        Command::Checkpoint => {
            let lsn = db.checkpoint()?;
            writeln!(out, "checkpoint: {lsn}")?;
        }
        Command::CreateTable { name, columns } => {
            let columns = columns
                .iter()
                .map(|spec| parse_column(spec))
                .collect::<Result<Vec<_>, _>>()?;
            let meta = db.create_table(&name, columns)?;
            info!(table = %meta.name, oid = meta.oid, "created table");
            writeln!(out, "oid: {}", meta.oid)?;
        }
        Command::Insert { table, values } => {
            let columns = db.table(&table)?.meta().columns.clone();
            if columns.len() != values.len() {
                return Err(CliError::InvalidArguments(format!(
                    "table {table} has {} columns, got {} values",
                    columns.len(),
                    values.len()
                )));
            }
            let values = columns
                .iter()
                .zip(&values)
                .map(|(column, raw)| Value::parse(column.ty, raw))
                .collect::<granite::Result<Vec<_>>>()?;
            let tx = db.begin(IsolationLevel::ReadCommitted)?;
            match db.insert(&tx, &table, values) {
                Ok(rid) => {
                    db.commit(&tx)?;
                    writeln!(out, "inserted {rid}")?;
                }
                Err(e) => {
                    db.rollback(&tx)?;
                    return Err(e.into());
                }
            }
        }
        Command::Delete {
            table,
            page_id,
            slot_id,
        } => {
            let rid = Rid::new(page_id, slot_id);
            let tx = db.begin(IsolationLevel::ReadCommitted)?;
            match db.delete(&tx, &table, rid) {
                Ok(()) => {
                    db.commit(&tx)?;
                    writeln!(out, "deleted {rid}")?;
                }
                Err(e) => {
                    db.rollback(&tx)?;
                    return Err(e.into());
                }
            }
        }
        Command::Scan { table, isolation } => {
            let tx = db.begin(isolation)?;
            let records = db.scan(&tx, &table)?;
            db.commit(&tx)?;
            for record in records {
                let values = record
                    .values
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\t");
                match record.rid {
                    Some(rid) => writeln!(out, "{rid}\t{values}")?,
                    None => writeln!(out, "{values}")?,
                }
            }
        }
        Command::Tables => {
            for meta in db.catalog().tables() {
                let columns = meta
                    .columns
                    .iter()
                    .map(|c| format!("{}:{:?}", c.name, c.ty))
                    .collect::<Vec<_>>()
                    .join(" ");
                writeln!(out, "{}\t{}\t{}", meta.oid, meta.name, columns)?;
            }
        }
        Command::DumpLog { .. } => {}
    }
    Ok(())
}

/// Reads the log without running recovery, so a damaged tail is shown as is.
fn dump_log(config: &EngineConfig, from: Lsn, out: &mut impl Write) -> Result<(), CliError> {
    std::fs::create_dir_all(&config.data_dir)?;
    let mut storage = LogStorage::open(config)?;
    let scan = storage.scan(from)?;
    for record in &scan.records {
        writeln!(out, "{record}")?;
    }
    writeln!(out, "end: {}", scan.end)?;
    Ok(())
}
