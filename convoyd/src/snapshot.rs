//! Durable controller snapshot.
//!
//! A single JSON file holding, in fixed order: the pending queue, the
//! in-progress set, the archived set, the job→vehicles map and the
//! vehicle→job map. Written after every state-mutating controller operation;
//! loaded once at boot. A corrupt or unreadable file is deleted and the
//! controller cold-starts rather than failing to boot.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use convoy_common::{CoreError, Job, Vehicle};

/// Field order mirrors the on-disk layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub pending: Vec<Job>,
    pub in_progress: Vec<Job>,
    pub archived: Vec<Job>,
    /// Full vehicle records so the active pool can be rebuilt on reload.
    pub job_vehicles: HashMap<String, Vec<Vehicle>>,
    pub vehicle_job: HashMap<String, String>,
}

/// Load the snapshot, or `None` for a cold start. Never fails boot: a file
/// that cannot be read or parsed is discarded.
pub fn load(path: &Path) -> Option<Snapshot> {
    if !path.exists() {
        return None;
    }

    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!(
                "Unreadable snapshot {}: {}; discarding and cold-starting",
                path.display(),
                err
            );
            discard(path);
            return None;
        }
    };

    match serde_json::from_str::<Snapshot>(&contents) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            warn!(
                "Corrupt snapshot {}: {}; discarding and cold-starting",
                path.display(),
                err
            );
            discard(path);
            None
        }
    }
}

fn discard(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        warn!("Failed to delete bad snapshot {}: {}", path.display(), err);
    }
}

/// Persist with durable semantics (flock + tmp + fsync + atomic rename).
pub fn save(path: &Path, snapshot: &Snapshot) -> Result<(), CoreError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| Path::new(".").to_path_buf());
    std::fs::create_dir_all(&dir).map_err(persistence)?;

    let lock_path = path.with_extension("lock");
    let lock = File::create(&lock_path).map_err(persistence)?;
    lock.lock_exclusive().map_err(persistence)?;

    let temp_path = path.with_extension("tmp");
    let mut temp = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .map_err(persistence)?;

    serde_json::to_writer(&mut temp, snapshot)
        .map_err(|err| CoreError::Persistence(format!("failed to encode snapshot: {err}")))?;
    temp.sync_all().map_err(persistence)?;
    drop(temp);

    std::fs::rename(&temp_path, path).map_err(persistence)?;

    let dir_handle = File::open(&dir).map_err(persistence)?;
    dir_handle.sync_all().map_err(persistence)?;

    drop(lock);
    Ok(())
}

fn persistence(err: std::io::Error) -> CoreError {
    CoreError::Persistence(err.to_string())
}
