// src/core/persistence/backup.rs

//! Timestamped snapshot copies with bounded retention.

use crate::core::LatZeroError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const BACKUP_PREFIX: &str = "latzero-";
const BACKUP_SUFFIX: &str = ".snapshot.json";

/// Copies `snapshot_path` into `backups_dir` under a timestamped name and
/// prunes the oldest backups beyond `max_backups`. Returns the path of the
/// new backup.
pub fn create_backup(
    snapshot_path: &Path,
    backups_dir: &Path,
    max_backups: usize,
) -> Result<PathBuf, LatZeroError> {
    std::fs::create_dir_all(backups_dir)?;

    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let backup_path = backups_dir.join(format!("{BACKUP_PREFIX}{stamp}{BACKUP_SUFFIX}"));
    std::fs::copy(snapshot_path, &backup_path)?;
    info!("Created backup {}", backup_path.display());

    prune_backups(backups_dir, max_backups)?;
    Ok(backup_path)
}

/// Removes the oldest backups until at most `max_backups` remain.
/// The timestamped names sort lexicographically in creation order.
fn prune_backups(backups_dir: &Path, max_backups: usize) -> Result<(), LatZeroError> {
    let mut backups: Vec<PathBuf> = std::fs::read_dir(backups_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(BACKUP_PREFIX) && n.ends_with(BACKUP_SUFFIX))
        })
        .collect();

    if backups.len() <= max_backups {
        return Ok(());
    }

    backups.sort();
    let excess = backups.len() - max_backups;
    for stale in backups.into_iter().take(excess) {
        debug!("Pruning old backup {}", stale.display());
        std::fs::remove_file(&stale)?;
    }
    Ok(())
}
