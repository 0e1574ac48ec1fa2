use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_CHECKPOINT_ADDR: &str = "127.0.0.1:7401";
pub const DEFAULT_NOTIFY_ADDR: &str = "127.0.0.1:7402";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    /// Pending again after losing its last assigned vehicle without a
    /// usable checkpoint or replacement.
    Interrupted,
    Completed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub owner: String,
    /// Short client-supplied display token; also the prefix of the job id.
    pub label: String,
    pub duration_hours: u32,
    pub redundancy: u32,
    pub deadline: DateTime<Utc>,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        owner: &str,
        label: &str,
        duration_hours: u32,
        redundancy: u32,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: generate_job_id(label),
            owner: owner.to_string(),
            label: label.to_string(),
            duration_hours,
            redundancy,
            deadline,
            status: JobStatus::Pending,
            submitted_at: Utc::now(),
        }
    }
}

/// Job ids combine the client token with a random suffix so distinct
/// submitters never need to coordinate.
pub fn generate_job_id(label: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", label, &suffix[..8])
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStatus {
    Available,
    Active,
    /// Active after resuming an interrupted job from a checkpoint.
    ActiveRestarted,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vehicle {
    pub plate: String,
    pub jurisdiction: String,
    pub make: String,
    pub model: String,
    pub year: u16,
    /// The node is expected to leave some time after this instant.
    pub departure_after: DateTime<Utc>,
    pub status: VehicleStatus,
    pub cpu_status: String,
    pub memory_status: String,
    pub current_job_id: Option<String>,
    pub owner: String,
}

impl Vehicle {
    /// License plate plus jurisdiction code, unique across the system.
    pub fn signature(&self) -> String {
        vehicle_signature(&self.plate, &self.jurisdiction)
    }
}

pub fn vehicle_signature(plate: &str, jurisdiction: &str) -> String {
    format!(
        "{}-{}",
        plate.trim().to_uppercase(),
        jurisdiction.trim().to_uppercase()
    )
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum RequestPayload {
    JobSubmission(Job),
    VehicleRegistration(Vehicle),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub sender: String,
    pub payload: RequestPayload,
    pub status: RequestStatus,
    pub submitted_at: DateTime<Utc>,
    /// Receipt confirmation; independent of the approval decision.
    pub acknowledged: bool,
    pub decided_at: Option<DateTime<Utc>>,
}

impl Request {
    pub fn new(sender: &str, payload: RequestPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            payload,
            status: RequestStatus::Pending,
            submitted_at: Utc::now(),
            acknowledged: false,
            decided_at: None,
        }
    }
}

/// Immutable execution-state snapshot pushed by a vehicle mid-job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub job_id: String,
    /// Signature of the vehicle that produced the snapshot.
    pub vehicle_id: String,
    pub ts: DateTime<Utc>,
    pub state: Vec<u8>,
}

impl Checkpoint {
    pub fn new(job_id: &str, vehicle_id: &str, state: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            vehicle_id: vehicle_id.to_string(),
            ts: Utc::now(),
            state,
        }
    }
}
