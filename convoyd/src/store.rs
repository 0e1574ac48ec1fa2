//! Opaque relational-store collaborator.
//!
//! The core persists requests, job/vehicle records, and notification history
//! through this narrow interface without depending on the store's schema.
//! `JsonStore` is the shipped implementation: one JSON file per table with
//! durable writes (flock + tmp + fsync + atomic rename).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use convoy_common::{Job, Request, Vehicle};

const REQUESTS_FILE: &str = "requests.json";
const JOBS_FILE: &str = "jobs.json";
const VEHICLES_FILE: &str = "vehicles.json";
const NOTIFICATIONS_FILE: &str = "notifications.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] io::Error),
    #[error("store encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub at: DateTime<Utc>,
    pub message: String,
}

pub trait RelationalStore: Send + Sync {
    fn save_request(&self, request: &Request) -> Result<(), StoreError>;
    fn load_all_requests(&self) -> Result<Vec<Request>, StoreError>;
    fn save_job(&self, job: &Job) -> Result<(), StoreError>;
    fn load_jobs_for_user(&self, user: &str) -> Result<Vec<Job>, StoreError>;
    fn save_vehicle(&self, vehicle: &Vehicle) -> Result<(), StoreError>;
    fn load_vehicles_for_user(&self, user: &str) -> Result<Vec<Vehicle>, StoreError>;
    fn add_notification_history(&self, user: &str, message: &str) -> Result<(), StoreError>;
    fn get_notification_history(&self, user: &str) -> Result<Vec<NotificationRecord>, StoreError>;
}

pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn load_table<T: DeserializeOwned>(&self, file: &str) -> Result<HashMap<String, T>, StoreError> {
        let path = self.dir.join(file);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let handle = File::open(&path)?;
        Ok(serde_json::from_reader(handle)?)
    }

    fn save_table<T: Serialize>(
        &self,
        file: &str,
        table: &HashMap<String, T>,
    ) -> Result<(), StoreError> {
        let lock_file = File::create(self.dir.join(format!("{file}.lock")))?;
        lock_file.lock_exclusive()?;

        let temp_path = self.dir.join(format!("{file}.tmp"));
        let mut temp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        serde_json::to_writer_pretty(&mut temp, table)?;
        temp.sync_all()?;
        drop(temp);

        std::fs::rename(&temp_path, self.dir.join(file))?;

        let dir_handle = File::open(&self.dir)?;
        dir_handle.sync_all()?;

        drop(lock_file);
        Ok(())
    }

    fn update_table<T, F>(&self, file: &str, update: F) -> Result<(), StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut HashMap<String, T>),
    {
        let mut table = self.load_table(file)?;
        update(&mut table);
        self.save_table(file, &table)
    }
}

impl RelationalStore for JsonStore {
    fn save_request(&self, request: &Request) -> Result<(), StoreError> {
        self.update_table(REQUESTS_FILE, |table: &mut HashMap<String, Request>| {
            table.insert(request.id.clone(), request.clone());
        })
    }

    fn load_all_requests(&self) -> Result<Vec<Request>, StoreError> {
        let table: HashMap<String, Request> = self.load_table(REQUESTS_FILE)?;
        let mut requests: Vec<Request> = table.into_values().collect();
        requests.sort_by_key(|r| r.submitted_at);
        Ok(requests)
    }

    fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.update_table(JOBS_FILE, |table: &mut HashMap<String, Job>| {
            table.insert(job.id.clone(), job.clone());
        })
    }

    fn load_jobs_for_user(&self, user: &str) -> Result<Vec<Job>, StoreError> {
        let table: HashMap<String, Job> = self.load_table(JOBS_FILE)?;
        let mut jobs: Vec<Job> = table.into_values().filter(|j| j.owner == user).collect();
        jobs.sort_by_key(|j| j.submitted_at);
        Ok(jobs)
    }

    fn save_vehicle(&self, vehicle: &Vehicle) -> Result<(), StoreError> {
        self.update_table(VEHICLES_FILE, |table: &mut HashMap<String, Vehicle>| {
            table.insert(vehicle.signature(), vehicle.clone());
        })
    }

    fn load_vehicles_for_user(&self, user: &str) -> Result<Vec<Vehicle>, StoreError> {
        let table: HashMap<String, Vehicle> = self.load_table(VEHICLES_FILE)?;
        Ok(table.into_values().filter(|v| v.owner == user).collect())
    }

    fn add_notification_history(&self, user: &str, message: &str) -> Result<(), StoreError> {
        self.update_table(
            NOTIFICATIONS_FILE,
            |table: &mut HashMap<String, Vec<NotificationRecord>>| {
                table.entry(user.to_string()).or_default().push(NotificationRecord {
                    at: Utc::now(),
                    message: message.to_string(),
                });
            },
        )
    }

    fn get_notification_history(&self, user: &str) -> Result<Vec<NotificationRecord>, StoreError> {
        let table: HashMap<String, Vec<NotificationRecord>> =
            self.load_table(NOTIFICATIONS_FILE)?;
        Ok(table.get(user).cloned().unwrap_or_default())
    }
}

/// Best-effort helper: store failures degrade to a warning, never an error
/// for the calling mutation.
pub fn log_store_failure(context: &str, result: Result<(), StoreError>) {
    if let Err(err) = result {
        tracing::warn!("Store write failed ({}): {}", context, err);
    }
}
