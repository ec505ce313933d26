// src/core/persistence/store.rs

//! The durable typed KV store: in-memory tables, a JSON-line write-ahead
//! log, and an atomically rewritten snapshot file.
//!
//! Opening the store loads the snapshot and replays the WAL on top of it.
//! Every mutation is appended (and flushed) to the WAL before it is applied
//! to the tables, so a crash can lose at most the mutation being written.
//! `snapshot()` rewrites the snapshot via a temp file + rename and truncates
//! the WAL.

use super::records::{AppRecord, BlockRecord, PoolRecord};
use crate::core::LatZeroError;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const SNAPSHOT_FILE: &str = "latzero.snapshot.json";
const WAL_FILE: &str = "latzero.wal";

/// The durable tables. String-keyed maps preserve insertion order so
/// snapshots diff cleanly across saves.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Tables {
    #[serde(default)]
    pub apps: IndexMap<String, AppRecord>,
    #[serde(default)]
    pub pools: IndexMap<String, PoolRecord>,
    #[serde(default)]
    pub blocks: IndexMap<String, BlockRecord>,
    #[serde(default)]
    pub server_config: IndexMap<String, String>,
}

/// One logged mutation. A `Batch` is the unit of an atomic transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WalOp {
    PutApp { row: AppRecord },
    DeleteApp { app_id: String },
    PutPool { row: PoolRecord },
    DeletePool { name: String },
    PutBlock { row: BlockRecord },
    DeleteBlock { block_id: String },
    SetConfig { key: String, value: String },
    Batch { ops: Vec<WalOp> },
}

fn apply(tables: &mut Tables, op: &WalOp) {
    match op {
        WalOp::PutApp { row } => {
            tables.apps.insert(row.app_id.clone(), row.clone());
        }
        WalOp::DeleteApp { app_id } => {
            tables.apps.shift_remove(app_id);
        }
        WalOp::PutPool { row } => {
            tables.pools.insert(row.name.clone(), row.clone());
        }
        WalOp::DeletePool { name } => {
            tables.pools.shift_remove(name);
        }
        WalOp::PutBlock { row } => {
            tables.blocks.insert(row.block_id.clone(), row.clone());
        }
        WalOp::DeleteBlock { block_id } => {
            tables.blocks.shift_remove(block_id);
        }
        WalOp::SetConfig { key, value } => {
            tables.server_config.insert(key.clone(), value.clone());
        }
        WalOp::Batch { ops } => {
            for inner in ops {
                apply(tables, inner);
            }
        }
    }
}

struct StoreInner {
    tables: Tables,
    wal: Option<BufWriter<File>>,
}

/// The typed KV store backing all durable metadata.
pub struct Store {
    inner: Mutex<StoreInner>,
    /// `None` when running in memory mode: mutations skip the WAL entirely.
    data_dir: Option<PathBuf>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens the durable store rooted at `data_dir`, loading the snapshot and
    /// replaying the WAL.
    pub fn open(data_dir: &Path) -> Result<Self, LatZeroError> {
        std::fs::create_dir_all(data_dir)?;

        let snapshot_path = data_dir.join(SNAPSHOT_FILE);
        let mut tables = if snapshot_path.exists() {
            let file = File::open(&snapshot_path)?;
            serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                LatZeroError::Persistence(format!(
                    "corrupt snapshot '{}': {e}",
                    snapshot_path.display()
                ))
            })?
        } else {
            Tables::default()
        };

        let wal_path = data_dir.join(WAL_FILE);
        let mut replayed = 0usize;
        if wal_path.exists() {
            let reader = BufReader::new(File::open(&wal_path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WalOp>(&line) {
                    Ok(op) => {
                        apply(&mut tables, &op);
                        replayed += 1;
                    }
                    Err(e) => {
                        // A torn final line from a crash mid-append is
                        // expected; anything earlier is genuine corruption.
                        warn!(
                            "Stopping WAL replay at line {}: {e}. {} ops replayed.",
                            line_no + 1,
                            replayed
                        );
                        break;
                    }
                }
            }
        }
        if replayed > 0 {
            info!("Replayed {} WAL operations on top of the snapshot.", replayed);
        }

        let wal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&wal_path)?;

        Ok(Self {
            inner: Mutex::new(StoreInner {
                tables,
                wal: Some(BufWriter::new(wal)),
            }),
            data_dir: Some(data_dir.to_path_buf()),
        })
    }

    /// Creates a purely in-memory store (`memory_mode`): same semantics,
    /// nothing touches disk.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                tables: Tables::default(),
                wal: None,
            }),
            data_dir: None,
        }
    }

    /// Logs and applies a single mutation. The WAL write happens first; if
    /// it fails, the tables are left untouched and the caller must not
    /// update its in-memory mirror.
    pub fn mutate(&self, op: WalOp) -> Result<(), LatZeroError> {
        let mut inner = self.inner.lock();
        if let Some(wal) = inner.wal.as_mut() {
            let line = serde_json::to_string(&op)
                .map_err(|e| LatZeroError::Persistence(format!("WAL encode failed: {e}")))?;
            wal.write_all(line.as_bytes())
                .and_then(|_| wal.write_all(b"\n"))
                .and_then(|_| wal.flush())
                .map_err(|e| LatZeroError::Persistence(format!("WAL append failed: {e}")))?;
        }
        apply(&mut inner.tables, &op);
        Ok(())
    }

    /// Runs `f` against the current tables, collecting mutations into a
    /// batch that is logged and applied atomically iff `f` returns `Ok`.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Tables, &mut Vec<WalOp>) -> Result<T, LatZeroError>,
    ) -> Result<T, LatZeroError> {
        let mut inner = self.inner.lock();
        let mut ops = Vec::new();
        let out = f(&inner.tables, &mut ops)?;
        if ops.is_empty() {
            return Ok(out);
        }
        let batch = WalOp::Batch { ops };
        if let Some(wal) = inner.wal.as_mut() {
            let line = serde_json::to_string(&batch)
                .map_err(|e| LatZeroError::Persistence(format!("WAL encode failed: {e}")))?;
            wal.write_all(line.as_bytes())
                .and_then(|_| wal.write_all(b"\n"))
                .and_then(|_| wal.flush())
                .map_err(|e| LatZeroError::Persistence(format!("WAL append failed: {e}")))?;
        }
        apply(&mut inner.tables, &batch);
        Ok(out)
    }

    /// Reads from the tables under the store lock.
    pub fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        f(&self.inner.lock().tables)
    }

    /// Rewrites the snapshot atomically and truncates the WAL.
    pub fn snapshot(&self) -> Result<(), LatZeroError> {
        let Some(data_dir) = &self.data_dir else {
            return Ok(());
        };
        let mut inner = self.inner.lock();

        let snapshot_path = data_dir.join(SNAPSHOT_FILE);
        let tmp_path = data_dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        {
            let tmp = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(tmp);
            serde_json::to_writer_pretty(&mut writer, &inner.tables)
                .map_err(|e| LatZeroError::Persistence(format!("snapshot encode failed: {e}")))?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &snapshot_path)?;

        // The snapshot now holds everything the WAL held; start a fresh log.
        let wal_path = data_dir.join(WAL_FILE);
        let wal = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&wal_path)?;
        inner.wal = Some(BufWriter::new(wal));
        Ok(())
    }

    /// Path of the current snapshot file, if the store is disk-backed.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(SNAPSHOT_FILE))
    }
}
