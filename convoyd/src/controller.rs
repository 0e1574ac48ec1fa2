//! Scheduling and recovery state machine.
//!
//! The controller owns the FIFO pending queue, the available/active vehicle
//! pools, and the job↔vehicle assignment maps. Every mutating operation runs
//! under a single lock and writes a durable snapshot before returning, so a
//! process restart resumes without data loss.
//!
//! Lock policy: registry reads (request fetch, latest-checkpoint lookup)
//! happen before the controller lock is taken; registry writes, store writes
//! and notification pushes are emitted after it is released.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use convoy_common::types::vehicle_signature;
use convoy_common::{
    Checkpoint, CoreError, Job, JobStatus, Request, RequestPayload, Vehicle, VehicleStatus,
};

use crate::registry::Registry;
use crate::snapshot::{self, Snapshot};
use crate::store::{log_store_failure, RelationalStore};

/// Registration details supplied by a vehicle owner. Status and assignment
/// fields are controller-owned and never caller-chosen.
#[derive(Clone, Debug)]
pub struct VehicleDetails {
    pub plate: String,
    pub jurisdiction: String,
    pub make: String,
    pub model: String,
    pub year: u16,
    pub departure_after: DateTime<Utc>,
    pub cpu_status: String,
    pub memory_status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepartureOutcome {
    /// Vehicle found in neither pool; logged and ignored.
    NotTracked,
    RemovedFromAvailable,
    JobContinues {
        job_id: String,
        remaining: usize,
    },
    Recovered {
        job_id: String,
        replacement: String,
        checkpoint_id: String,
    },
    Requeued {
        job_id: String,
    },
}

enum Effect {
    Notify { user: String, text: String },
    SaveJob(Job),
    SaveVehicle(Vehicle),
}

pub struct Controller {
    state: Mutex<ControllerState>,
    registry: Arc<Registry>,
    store: Arc<dyn RelationalStore>,
    snapshot_path: PathBuf,
}

#[derive(Default)]
struct ControllerState {
    pending: VecDeque<Job>,
    in_progress: HashMap<String, Job>,
    archived: HashMap<String, Job>,
    available: VecDeque<Vehicle>,
    active: HashMap<String, Vehicle>,
    job_vehicles: HashMap<String, Vec<String>>,
    vehicle_job: HashMap<String, String>,
}

impl Controller {
    /// Construct the controller, restoring state from the snapshot file when
    /// one is present. Cold start is never a failure.
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn RelationalStore>,
        snapshot_path: impl Into<PathBuf>,
    ) -> Self {
        let snapshot_path = snapshot_path.into();
        let state = match snapshot::load(&snapshot_path) {
            Some(snap) => {
                let state = ControllerState::from_snapshot(snap);
                info!(
                    pending = state.pending.len(),
                    in_progress = state.in_progress.len(),
                    archived = state.archived.len(),
                    active_vehicles = state.active.len(),
                    "Controller state restored from snapshot"
                );
                state
            }
            None => {
                info!("Cold start with empty pools and queues");
                ControllerState::default()
            }
        };
        Self {
            state: Mutex::new(state),
            registry,
            store,
            snapshot_path,
        }
    }

    // ---- submission -----------------------------------------------------

    pub async fn submit_job_request(
        &self,
        sender: &str,
        label: &str,
        duration_hours: u32,
        redundancy: u32,
        deadline: DateTime<Utc>,
    ) -> Result<String, CoreError> {
        if duration_hours == 0 {
            return Err(CoreError::InvalidState(
                "job duration must be at least one hour".into(),
            ));
        }
        if redundancy == 0 {
            return Err(CoreError::InvalidState(
                "redundancy level must be at least 1".into(),
            ));
        }
        if deadline <= Utc::now() {
            return Err(CoreError::InvalidState(
                "deadline must be in the future".into(),
            ));
        }

        let job = Job::new(sender, label, duration_hours, redundancy, deadline);
        let request = Request::new(sender, RequestPayload::JobSubmission(job));
        self.accept_request(request)
    }

    pub async fn submit_vehicle_request(
        &self,
        sender: &str,
        details: VehicleDetails,
    ) -> Result<String, CoreError> {
        if details.departure_after <= Utc::now() {
            return Err(CoreError::InvalidState(
                "departure schedule must be in the future".into(),
            ));
        }

        let signature = vehicle_signature(&details.plate, &details.jurisdiction);
        if self.is_vehicle_registered(&signature).await {
            return Err(CoreError::DuplicateId(format!(
                "vehicle {signature} is already registered"
            )));
        }

        let vehicle = Vehicle {
            plate: details.plate,
            jurisdiction: details.jurisdiction,
            make: details.make,
            model: details.model,
            year: details.year,
            departure_after: details.departure_after,
            status: VehicleStatus::Available,
            cpu_status: details.cpu_status,
            memory_status: details.memory_status,
            current_job_id: None,
            owner: sender.to_string(),
        };
        let request = Request::new(sender, RequestPayload::VehicleRegistration(vehicle));
        self.accept_request(request)
    }

    /// Store the request and acknowledge receipt immediately. The approval
    /// decision comes later, from an operator.
    fn accept_request(&self, request: Request) -> Result<String, CoreError> {
        let sender = request.sender.clone();
        let id = self.registry.submit(request)?;
        self.registry.acknowledge(&id)?;
        if let Ok(stored) = self.registry.get(&id) {
            log_store_failure("request", self.store.save_request(&stored));
        }
        info!(request_id = %id, sender = %sender, "Request received and acknowledged");
        Ok(id)
    }

    /// Signature-lookup query: known to a pending registration request or to
    /// either vehicle pool. A terminally departed vehicle may re-register.
    pub async fn is_vehicle_registered(&self, signature: &str) -> bool {
        let pending_match = self.registry.list_pending().iter().any(|r| {
            matches!(&r.payload,
                RequestPayload::VehicleRegistration(v) if v.signature() == signature)
        });
        if pending_match {
            return true;
        }

        let state = self.state.lock().await;
        state.active.contains_key(signature)
            || state.available.iter().any(|v| v.signature() == signature)
    }

    // ---- approval -------------------------------------------------------

    pub async fn approve(&self, request_id: &str) -> Result<(), CoreError> {
        let request = self.registry.approve(request_id)?;
        log_store_failure("request", self.store.save_request(&request));

        let mut effects = vec![Effect::Notify {
            user: request.sender.clone(),
            text: format!("Request {} approved", request.id),
        }];

        match request.payload {
            RequestPayload::JobSubmission(job) => {
                info!(request_id = %request.id, job_id = %job.id, "Job submission approved");
                effects.push(Effect::SaveJob(job.clone()));
                let mut state = self.state.lock().await;
                state.pending.push_back(job);
                effects.extend(state.run_scheduling_pass());
                self.persist(&state);
            }
            RequestPayload::VehicleRegistration(mut vehicle) => {
                vehicle.status = VehicleStatus::Available;
                vehicle.current_job_id = None;
                info!(
                    request_id = %request.id,
                    vehicle = %vehicle.signature(),
                    "Vehicle registration approved"
                );
                effects.push(Effect::SaveVehicle(vehicle.clone()));
                let mut state = self.state.lock().await;
                state.available.push_back(vehicle);
                effects.extend(state.run_scheduling_pass());
                self.persist(&state);
            }
        }

        self.emit(effects).await;
        Ok(())
    }

    pub async fn reject(&self, request_id: &str) -> Result<(), CoreError> {
        let request = self.registry.reject(request_id)?;
        log_store_failure("request", self.store.save_request(&request));
        info!(request_id = %request.id, "Request rejected");
        self.emit(vec![Effect::Notify {
            user: request.sender.clone(),
            text: format!("Request {} rejected", request.id),
        }])
        .await;
        Ok(())
    }

    // ---- checkpoints ----------------------------------------------------

    /// Archival only: a checkpoint never triggers scheduling or a state
    /// transition, it just creates recovery material.
    pub fn handle_checkpoint(&self, checkpoint: Checkpoint) {
        info!(
            checkpoint_id = %checkpoint.id,
            job_id = %checkpoint.job_id,
            vehicle_id = %checkpoint.vehicle_id,
            "Checkpoint received"
        );
        self.registry.archive_checkpoint(checkpoint);
    }

    /// Ask every vehicle assigned to the job to push a checkpoint. The
    /// vehicle agents react by connecting to the ingress socket.
    pub async fn trigger_checkpoint(&self, job_id: &str) -> Result<usize, CoreError> {
        let targets = {
            let state = self.state.lock().await;
            if !state.in_progress.contains_key(job_id) {
                return Err(state.job_lookup_error(job_id, "is not in progress"));
            }
            let mut targets = Vec::new();
            for sig in state.job_vehicles.get(job_id).cloned().unwrap_or_default() {
                if let Some(vehicle) = state.active.get(&sig) {
                    targets.push((sig, vehicle.owner.clone()));
                }
            }
            targets
        };

        let mut effects = Vec::with_capacity(targets.len());
        for (sig, owner) in &targets {
            effects.push(Effect::Notify {
                user: owner.clone(),
                text: format!("Checkpoint requested for job {job_id} on vehicle {sig}"),
            });
        }
        self.emit(effects).await;
        Ok(targets.len())
    }

    // ---- completion -----------------------------------------------------

    /// External completion signal. Idempotent: completing an archived job is
    /// a no-op with no double release of vehicles.
    pub async fn complete_job(&self, job_id: &str) -> Result<(), CoreError> {
        let mut effects = Vec::new();
        {
            let mut state = self.state.lock().await;
            if state.archived.contains_key(job_id) {
                debug!(job_id, "Completion signal for archived job ignored");
                return Ok(());
            }
            let Some(mut job) = state.in_progress.remove(job_id) else {
                return Err(state.job_lookup_error(job_id, "has not started"));
            };

            for sig in state.job_vehicles.remove(job_id).unwrap_or_default() {
                state.vehicle_job.remove(&sig);
                if let Some(mut vehicle) = state.active.remove(&sig) {
                    vehicle.status = VehicleStatus::Available;
                    vehicle.current_job_id = None;
                    effects.push(Effect::SaveVehicle(vehicle.clone()));
                    state.available.push_back(vehicle);
                }
            }

            job.status = JobStatus::Completed;
            info!(job_id = %job.id, "Job completed and archived");
            effects.push(Effect::Notify {
                user: job.owner.clone(),
                text: format!("Job {} completed", job.id),
            });
            effects.push(Effect::SaveJob(job.clone()));
            state.archived.insert(job.id.clone(), job);

            effects.extend(state.run_scheduling_pass());
            self.persist(&state);
        }
        self.emit(effects).await;
        Ok(())
    }

    // ---- departure ------------------------------------------------------

    /// The core failure-handling algorithm: remove the vehicle, then either
    /// continue the job on survivors, recover it onto a replacement from the
    /// latest checkpoint, or re-queue it interrupted.
    pub async fn depart_vehicle(&self, signature: &str) -> Result<DepartureOutcome, CoreError> {
        // Checkpoint lookup happens before the controller lock is taken; the
        // archive is append-only so the fetched entry can only be superseded,
        // never invalidated.
        let job_hint = {
            let state = self.state.lock().await;
            state.vehicle_job.get(signature).cloned()
        };
        let latest = job_hint
            .as_deref()
            .and_then(|job_id| self.registry.latest_checkpoint(job_id));

        let (outcome, effects) = {
            let mut state = self.state.lock().await;
            let (outcome, mut effects) = state.apply_departure(signature, latest);
            if !matches!(outcome, DepartureOutcome::NotTracked) {
                effects.extend(state.run_scheduling_pass());
                self.persist(&state);
            }
            (outcome, effects)
        };

        self.emit(effects).await;
        Ok(outcome)
    }

    // ---- queries --------------------------------------------------------

    pub async fn get_job_status(&self, job_id: &str) -> Result<JobStatus, CoreError> {
        let state = self.state.lock().await;
        if let Some(job) = state.in_progress.get(job_id) {
            return Ok(job.status);
        }
        if let Some(job) = state.archived.get(job_id) {
            return Ok(job.status);
        }
        if let Some(job) = state.pending.iter().find(|j| j.id == job_id) {
            return Ok(job.status);
        }
        Err(CoreError::NotFound(format!("job {job_id}")))
    }

    pub fn get_pending_requests(&self) -> Vec<Request> {
        self.registry.list_pending()
    }

    pub async fn get_in_progress_jobs(&self) -> Vec<Job> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state.in_progress.values().cloned().collect();
        jobs.sort_by_key(|j| j.submitted_at);
        jobs
    }

    pub async fn pending_jobs(&self) -> Vec<Job> {
        self.state.lock().await.pending.iter().cloned().collect()
    }

    pub async fn available_vehicles(&self) -> Vec<Vehicle> {
        self.state.lock().await.available.iter().cloned().collect()
    }

    pub async fn active_vehicles(&self) -> Vec<Vehicle> {
        self.state.lock().await.active.values().cloned().collect()
    }

    pub async fn assigned_vehicles(&self, job_id: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .job_vehicles
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    // ---- internals ------------------------------------------------------

    /// Synchronous by design: the snapshot hits disk before the mutation
    /// returns. A write failure degrades to a warning; the in-memory state
    /// is already updated.
    fn persist(&self, state: &ControllerState) {
        if let Err(err) = snapshot::save(&self.snapshot_path, &state.to_snapshot()) {
            warn!("Snapshot write failed, continuing in memory: {}", err);
        }
    }

    async fn emit(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Notify { user, text } => {
                    log_store_failure(
                        "notification history",
                        self.store.add_notification_history(&user, &text),
                    );
                    self.registry.notify(&user, &text).await;
                }
                Effect::SaveJob(job) => log_store_failure("job", self.store.save_job(&job)),
                Effect::SaveVehicle(vehicle) => {
                    log_store_failure("vehicle", self.store.save_vehicle(&vehicle))
                }
            }
        }
    }
}

impl ControllerState {
    /// Strict FIFO: only the head of the queue is ever examined. A head
    /// requiring more vehicles than are available blocks everything behind
    /// it; that is the intended arrival-order fairness, not a bug.
    fn run_scheduling_pass(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        loop {
            let Some(head) = self.pending.front() else {
                break;
            };
            let need = head.redundancy as usize;
            if self.available.len() < need {
                debug!(
                    job_id = %head.id,
                    need,
                    available = self.available.len(),
                    "Head of queue cannot be satisfied, scheduling pass stops"
                );
                break;
            }

            let mut job = self.pending.pop_front().expect("head just observed");
            let mut signatures = Vec::with_capacity(need);
            for _ in 0..need {
                let mut vehicle = self.available.pop_front().expect("count checked above");
                vehicle.status = VehicleStatus::Active;
                vehicle.current_job_id = Some(job.id.clone());
                let sig = vehicle.signature();
                self.vehicle_job.insert(sig.clone(), job.id.clone());
                effects.push(Effect::Notify {
                    user: vehicle.owner.clone(),
                    text: format!("Vehicle {} assigned: begin executing job {}", sig, job.id),
                });
                effects.push(Effect::SaveVehicle(vehicle.clone()));
                self.active.insert(sig.clone(), vehicle);
                signatures.push(sig);
            }

            job.status = JobStatus::InProgress;
            info!(job_id = %job.id, vehicles = signatures.len(), "Job scheduled");
            effects.push(Effect::Notify {
                user: job.owner.clone(),
                text: format!("Job {} started on {} vehicle(s)", job.id, signatures.len()),
            });
            effects.push(Effect::SaveJob(job.clone()));
            self.job_vehicles.insert(job.id.clone(), signatures);
            self.in_progress.insert(job.id.clone(), job);
        }
        effects
    }

    fn apply_departure(
        &mut self,
        signature: &str,
        latest: Option<Checkpoint>,
    ) -> (DepartureOutcome, Vec<Effect>) {
        let mut effects = Vec::new();

        if let Some(pos) = self
            .available
            .iter()
            .position(|v| v.signature() == signature)
        {
            self.available.remove(pos);
            info!(vehicle = signature, "Available vehicle departed, no job impact");
            return (DepartureOutcome::RemovedFromAvailable, effects);
        }

        if self.active.remove(signature).is_none() {
            warn!(vehicle = signature, "Departure for unknown vehicle ignored");
            return (DepartureOutcome::NotTracked, effects);
        }

        let Some(job_id) = self.vehicle_job.remove(signature) else {
            warn!(vehicle = signature, "Active vehicle had no assignment record");
            return (DepartureOutcome::NotTracked, effects);
        };

        let remaining = match self.job_vehicles.get_mut(&job_id) {
            Some(list) => {
                list.retain(|s| s != signature);
                list.len()
            }
            None => 0,
        };

        if remaining > 0 {
            // Redundancy absorbs the loss; the original count is not
            // re-established.
            info!(
                vehicle = signature,
                job_id = %job_id,
                remaining,
                "Assigned vehicle departed, job continues on survivors"
            );
            if let Some(job) = self.in_progress.get(&job_id) {
                effects.push(Effect::Notify {
                    user: job.owner.clone(),
                    text: format!(
                        "Vehicle {signature} departed; job {job_id} continues on {remaining} vehicle(s)"
                    ),
                });
            }
            return (
                DepartureOutcome::JobContinues { job_id, remaining },
                effects,
            );
        }

        // Last assigned vehicle is gone.
        self.job_vehicles.remove(&job_id);
        let Some(mut job) = self.in_progress.remove(&job_id) else {
            warn!(job_id = %job_id, "Assignment pointed at a job not in progress");
            return (DepartureOutcome::NotTracked, effects);
        };

        match latest {
            Some(checkpoint) if !self.available.is_empty() => {
                let mut replacement = self.available.pop_front().expect("checked non-empty");
                replacement.status = VehicleStatus::ActiveRestarted;
                replacement.current_job_id = Some(job_id.clone());
                let replacement_sig = replacement.signature();
                info!(
                    job_id = %job_id,
                    replacement = %replacement_sig,
                    checkpoint_id = %checkpoint.id,
                    "Job recovered onto replacement vehicle from latest checkpoint"
                );
                effects.push(Effect::Notify {
                    user: replacement.owner.clone(),
                    text: format!(
                        "Vehicle {} assigned: resume job {} from checkpoint {}",
                        replacement_sig, job_id, checkpoint.id
                    ),
                });
                effects.push(Effect::Notify {
                    user: job.owner.clone(),
                    text: format!("Job {job_id} recovered onto vehicle {replacement_sig}"),
                });
                effects.push(Effect::SaveVehicle(replacement.clone()));
                self.vehicle_job
                    .insert(replacement_sig.clone(), job_id.clone());
                self.job_vehicles
                    .insert(job_id.clone(), vec![replacement_sig.clone()]);
                self.active.insert(replacement_sig.clone(), replacement);
                // The job never left In-Progress: this is recovery, not a
                // restart from scratch.
                self.in_progress.insert(job_id.clone(), job);
                (
                    DepartureOutcome::Recovered {
                        job_id,
                        replacement: replacement_sig,
                        checkpoint_id: checkpoint.id,
                    },
                    effects,
                )
            }
            _ => {
                // No safe resume point or no replacement: back to the tail.
                job.status = JobStatus::Interrupted;
                info!(job_id = %job_id, "Job interrupted and re-queued");
                effects.push(Effect::Notify {
                    user: job.owner.clone(),
                    text: format!("Job {job_id} interrupted and re-queued"),
                });
                effects.push(Effect::SaveJob(job.clone()));
                self.pending.push_back(job);
                (DepartureOutcome::Requeued { job_id }, effects)
            }
        }
    }

    fn job_lookup_error(&self, job_id: &str, verb: &str) -> CoreError {
        let known = self.archived.contains_key(job_id)
            || self.pending.iter().any(|j| j.id == job_id);
        if known {
            CoreError::InvalidState(format!("job {job_id} {verb}"))
        } else {
            CoreError::NotFound(format!("job {job_id}"))
        }
    }

    fn to_snapshot(&self) -> Snapshot {
        let mut in_progress: Vec<Job> = self.in_progress.values().cloned().collect();
        in_progress.sort_by_key(|j| j.submitted_at);
        let mut archived: Vec<Job> = self.archived.values().cloned().collect();
        archived.sort_by_key(|j| j.submitted_at);

        let job_vehicles = self
            .job_vehicles
            .iter()
            .map(|(job_id, sigs)| {
                let vehicles = sigs
                    .iter()
                    .filter_map(|sig| self.active.get(sig).cloned())
                    .collect();
                (job_id.clone(), vehicles)
            })
            .collect();

        Snapshot {
            pending: self.pending.iter().cloned().collect(),
            in_progress,
            archived,
            job_vehicles,
            vehicle_job: self.vehicle_job.clone(),
        }
    }

    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut state = ControllerState {
            pending: snapshot.pending.into(),
            in_progress: snapshot
                .in_progress
                .into_iter()
                .map(|j| (j.id.clone(), j))
                .collect(),
            archived: snapshot
                .archived
                .into_iter()
                .map(|j| (j.id.clone(), j))
                .collect(),
            vehicle_job: snapshot.vehicle_job,
            ..ControllerState::default()
        };

        // The active pool is rebuilt from the assignment map. Vehicles with
        // no recorded assignment are not restored to Available; owners
        // re-register after a restart.
        for (job_id, vehicles) in snapshot.job_vehicles {
            let mut signatures = Vec::with_capacity(vehicles.len());
            for vehicle in vehicles {
                let sig = vehicle.signature();
                state.active.insert(sig.clone(), vehicle);
                signatures.push(sig);
            }
            state.job_vehicles.insert(job_id, signatures);
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonStore;
    use chrono::Duration;
    use convoy_common::RequestStatus;

    struct Harness {
        _dir: tempfile::TempDir,
        snapshot_path: PathBuf,
        registry: Arc<Registry>,
        store: Arc<JsonStore>,
        controller: Controller,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let snapshot_path = dir.path().join("controller.snapshot.json");
        let registry = Arc::new(Registry::new());
        let store = Arc::new(JsonStore::open(dir.path().join("store")).unwrap());
        let controller = Controller::new(registry.clone(), store.clone(), &snapshot_path);
        Harness {
            _dir: dir,
            snapshot_path,
            registry,
            store,
            controller,
        }
    }

    fn details(plate: &str) -> VehicleDetails {
        VehicleDetails {
            plate: plate.to_string(),
            jurisdiction: "CA".to_string(),
            make: "Kenworth".to_string(),
            model: "T680".to_string(),
            year: 2022,
            departure_after: Utc::now() + Duration::hours(12),
            cpu_status: "8 cores idle".to_string(),
            memory_status: "16 GiB free".to_string(),
        }
    }

    async fn recruit(h: &Harness, owner: &str, plate: &str) -> String {
        let request_id = h
            .controller
            .submit_vehicle_request(owner, details(plate))
            .await
            .unwrap();
        h.controller.approve(&request_id).await.unwrap();
        vehicle_signature(plate, "CA")
    }

    async fn submit_job(h: &Harness, owner: &str, label: &str, redundancy: u32) -> String {
        let request_id = h
            .controller
            .submit_job_request(owner, label, 5, redundancy, Utc::now() + Duration::hours(48))
            .await
            .unwrap();
        h.controller.approve(&request_id).await.unwrap();
        find_job(h, label).await
    }

    async fn find_job(h: &Harness, label: &str) -> String {
        for job in h.controller.get_in_progress_jobs().await {
            if job.label == label {
                return job.id;
            }
        }
        for job in h.controller.pending_jobs().await {
            if job.label == label {
                return job.id;
            }
        }
        panic!("job {label} not found");
    }

    #[tokio::test]
    async fn submission_validates_inputs() {
        let h = harness();
        let past = Utc::now() - Duration::hours(1);
        let future = Utc::now() + Duration::hours(1);

        assert!(matches!(
            h.controller.submit_job_request("alice", "sim", 0, 1, future).await,
            Err(CoreError::InvalidState(_))
        ));
        assert!(matches!(
            h.controller.submit_job_request("alice", "sim", 1, 0, future).await,
            Err(CoreError::InvalidState(_))
        ));
        assert!(matches!(
            h.controller.submit_job_request("alice", "sim", 1, 1, past).await,
            Err(CoreError::InvalidState(_))
        ));

        let id = h
            .controller
            .submit_job_request("alice", "sim", 1, 1, future)
            .await
            .unwrap();
        let request = h.registry.get(&id).unwrap();
        assert!(request.acknowledged, "receipt is confirmed immediately");
        assert_eq!(request.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn fifo_head_blocks_later_jobs() {
        let h = harness();
        recruit(&h, "carol", "VAN100").await;

        let job_a = submit_job(&h, "alice", "big", 3).await;
        let job_b = submit_job(&h, "bob", "small", 1).await;

        // One vehicle cannot satisfy the head (redundancy 3); B must not be
        // scheduled ahead of A.
        assert_eq!(h.controller.get_job_status(&job_a).await.unwrap(), JobStatus::Pending);
        assert_eq!(h.controller.get_job_status(&job_b).await.unwrap(), JobStatus::Pending);
        assert!(h.controller.get_in_progress_jobs().await.is_empty());
        assert_eq!(h.controller.available_vehicles().await.len(), 1);
    }

    #[tokio::test]
    async fn scheduling_assigns_exactly_redundancy_vehicles() {
        let h = harness();
        let job_id = submit_job(&h, "alice", "sim", 2).await;
        assert_eq!(h.controller.get_job_status(&job_id).await.unwrap(), JobStatus::Pending);

        recruit(&h, "carol", "VAN100").await;
        assert_eq!(h.controller.get_job_status(&job_id).await.unwrap(), JobStatus::Pending);

        recruit(&h, "dave", "VAN200").await;
        assert_eq!(
            h.controller.get_job_status(&job_id).await.unwrap(),
            JobStatus::InProgress
        );
        assert_eq!(h.controller.assigned_vehicles(&job_id).await.len(), 2);
        assert!(h.controller.available_vehicles().await.is_empty());

        // Redundancy is fixed at creation and never changes.
        let job = &h.controller.get_in_progress_jobs().await[0];
        assert_eq!(job.redundancy, 2);
    }

    #[tokio::test]
    async fn job_is_in_exactly_one_collection() {
        let h = harness();
        let job_id = submit_job(&h, "alice", "sim", 1).await;

        let count = |pending: Vec<Job>, in_progress: Vec<Job>, archived: bool| {
            pending.iter().filter(|j| j.id == job_id).count()
                + in_progress.iter().filter(|j| j.id == job_id).count()
                + usize::from(archived)
        };

        assert_eq!(
            count(h.controller.pending_jobs().await, h.controller.get_in_progress_jobs().await, false),
            1
        );

        recruit(&h, "carol", "VAN100").await;
        assert_eq!(
            count(h.controller.pending_jobs().await, h.controller.get_in_progress_jobs().await, false),
            1
        );

        h.controller.complete_job(&job_id).await.unwrap();
        assert_eq!(
            count(
                h.controller.pending_jobs().await,
                h.controller.get_in_progress_jobs().await,
                h.controller.get_job_status(&job_id).await.unwrap() == JobStatus::Completed
            ),
            1
        );
    }

    #[tokio::test]
    async fn completion_is_idempotent() {
        let h = harness();
        let job_id = submit_job(&h, "alice", "sim", 1).await;
        recruit(&h, "carol", "VAN100").await;

        h.controller.complete_job(&job_id).await.unwrap();
        assert_eq!(h.controller.available_vehicles().await.len(), 1);

        // Second completion: no error, no double release.
        h.controller.complete_job(&job_id).await.unwrap();
        assert_eq!(h.controller.available_vehicles().await.len(), 1);
        assert_eq!(
            h.controller.get_job_status(&job_id).await.unwrap(),
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn completion_releases_vehicles_for_the_next_job() {
        let h = harness();
        let first = submit_job(&h, "alice", "first", 1).await;
        let second = submit_job(&h, "bob", "second", 1).await;
        recruit(&h, "carol", "VAN100").await;

        assert_eq!(h.controller.get_job_status(&first).await.unwrap(), JobStatus::InProgress);
        assert_eq!(h.controller.get_job_status(&second).await.unwrap(), JobStatus::Pending);

        h.controller.complete_job(&first).await.unwrap();
        // The release triggers a scheduling pass that picks up the next job.
        assert_eq!(
            h.controller.get_job_status(&second).await.unwrap(),
            JobStatus::InProgress
        );
    }

    #[tokio::test]
    async fn recovery_resumes_from_the_latest_checkpoint() {
        let h = harness();
        let job_id = submit_job(&h, "alice", "sim", 1).await;
        let worker = recruit(&h, "carol", "VAN100").await;

        h.controller
            .handle_checkpoint(Checkpoint::new(&job_id, &worker, b"older".to_vec()));
        let newer = Checkpoint::new(&job_id, &worker, b"newer".to_vec());
        let newer_id = newer.id.clone();
        h.controller.handle_checkpoint(newer);

        let spare = recruit(&h, "dave", "VAN200").await;

        let outcome = h.controller.depart_vehicle(&worker).await.unwrap();
        assert_eq!(
            outcome,
            DepartureOutcome::Recovered {
                job_id: job_id.clone(),
                replacement: spare.clone(),
                checkpoint_id: newer_id,
            }
        );
        assert_eq!(
            h.controller.get_job_status(&job_id).await.unwrap(),
            JobStatus::InProgress
        );
        assert_eq!(h.controller.assigned_vehicles(&job_id).await, vec![spare.clone()]);
        let restarted = h
            .controller
            .active_vehicles()
            .await
            .into_iter()
            .find(|v| v.signature() == spare)
            .unwrap();
        assert_eq!(restarted.status, VehicleStatus::ActiveRestarted);
        assert_eq!(restarted.current_job_id.as_deref(), Some(job_id.as_str()));
    }

    #[tokio::test]
    async fn departure_without_spare_requeues_interrupted_at_the_tail() {
        let h = harness();
        let first = submit_job(&h, "alice", "running", 1).await;
        let worker = recruit(&h, "carol", "VAN100").await;
        h.controller
            .handle_checkpoint(Checkpoint::new(&first, &worker, b"state".to_vec()));

        // A second pending job marks the tail of the queue.
        let queued = submit_job(&h, "bob", "waiting", 5).await;

        let outcome = h.controller.depart_vehicle(&worker).await.unwrap();
        assert_eq!(outcome, DepartureOutcome::Requeued { job_id: first.clone() });

        assert_eq!(
            h.controller.get_job_status(&first).await.unwrap(),
            JobStatus::Interrupted
        );
        let pending = h.controller.pending_jobs().await;
        assert_eq!(pending.last().unwrap().id, first, "re-queued at the tail");
        assert_eq!(pending.first().unwrap().id, queued);
        assert!(h.controller.assigned_vehicles(&first).await.is_empty());
        // Redundancy survives the interruption unchanged.
        assert_eq!(pending.last().unwrap().redundancy, 1);
    }

    #[tokio::test]
    async fn departure_without_checkpoint_restarts_from_scratch() {
        let h = harness();
        let job_id = submit_job(&h, "alice", "sim", 1).await;
        let worker = recruit(&h, "carol", "VAN100").await;
        let spare = recruit(&h, "dave", "VAN200").await;

        // No checkpoint was ever pushed: no safe resume point, so the job is
        // re-queued; the follow-up scheduling pass then restarts it from
        // scratch on the spare vehicle.
        let outcome = h.controller.depart_vehicle(&worker).await.unwrap();
        assert_eq!(outcome, DepartureOutcome::Requeued { job_id: job_id.clone() });
        assert_eq!(
            h.controller.get_job_status(&job_id).await.unwrap(),
            JobStatus::InProgress
        );
        assert_eq!(h.controller.assigned_vehicles(&job_id).await, vec![spare.clone()]);
        let vehicle = h
            .controller
            .active_vehicles()
            .await
            .into_iter()
            .find(|v| v.signature() == spare)
            .unwrap();
        assert_eq!(vehicle.status, VehicleStatus::Active, "fresh start, not a resume");
    }

    #[tokio::test]
    async fn redundancy_absorbs_losses_down_to_one_survivor() {
        let h = harness();
        let job_id = submit_job(&h, "alice", "sim", 2).await;
        let first = recruit(&h, "carol", "VAN100").await;
        let second = recruit(&h, "dave", "VAN200").await;
        assert_eq!(
            h.controller.get_job_status(&job_id).await.unwrap(),
            JobStatus::InProgress
        );

        let outcome = h.controller.depart_vehicle(&first).await.unwrap();
        assert_eq!(
            outcome,
            DepartureOutcome::JobContinues {
                job_id: job_id.clone(),
                remaining: 1,
            }
        );
        // The job keeps running on the survivor; the lost slot is not
        // re-filled.
        assert_eq!(
            h.controller.get_job_status(&job_id).await.unwrap(),
            JobStatus::InProgress
        );
        assert_eq!(h.controller.assigned_vehicles(&job_id).await, vec![second.clone()]);
        let survivor = h
            .controller
            .active_vehicles()
            .await
            .into_iter()
            .find(|v| v.signature() == second)
            .unwrap();
        assert_eq!(survivor.status, VehicleStatus::Active);
        assert_eq!(survivor.current_job_id.as_deref(), Some(job_id.as_str()));
    }

    #[tokio::test]
    async fn available_and_unknown_departures_have_no_job_impact() {
        let h = harness();
        let sig = recruit(&h, "carol", "VAN100").await;

        assert_eq!(
            h.controller.depart_vehicle(&sig).await.unwrap(),
            DepartureOutcome::RemovedFromAvailable
        );
        assert!(h.controller.available_vehicles().await.is_empty());

        assert_eq!(
            h.controller.depart_vehicle("GHOST-CA").await.unwrap(),
            DepartureOutcome::NotTracked
        );
    }

    #[tokio::test]
    async fn duplicate_signature_is_rejected_in_either_order() {
        let h = harness();

        // Second registration while the first is still pending.
        h.controller
            .submit_vehicle_request("carol", details("VAN100"))
            .await
            .unwrap();
        assert!(matches!(
            h.controller.submit_vehicle_request("dave", details("VAN100")).await,
            Err(CoreError::DuplicateId(_))
        ));

        // Second registration after the first was approved.
        recruit(&h, "erin", "VAN200").await;
        assert!(matches!(
            h.controller.submit_vehicle_request("frank", details("VAN200")).await,
            Err(CoreError::DuplicateId(_))
        ));

        assert!(h.controller.is_vehicle_registered("VAN100-CA").await);
        assert!(h.controller.is_vehicle_registered("VAN200-CA").await);
        assert!(!h.controller.is_vehicle_registered("VAN300-CA").await);
    }

    #[tokio::test]
    async fn vehicle_is_in_at_most_one_pool() {
        let h = harness();
        let job_id = submit_job(&h, "alice", "sim", 1).await;
        let sig = recruit(&h, "carol", "VAN100").await;

        let in_pools = |available: Vec<Vehicle>, active: Vec<Vehicle>, sig: &str| {
            available.iter().filter(|v| v.signature() == sig).count()
                + active.iter().filter(|v| v.signature() == sig).count()
        };

        assert_eq!(
            in_pools(
                h.controller.available_vehicles().await,
                h.controller.active_vehicles().await,
                &sig
            ),
            1
        );

        h.controller.complete_job(&job_id).await.unwrap();
        assert_eq!(
            in_pools(
                h.controller.available_vehicles().await,
                h.controller.active_vehicles().await,
                &sig
            ),
            1
        );

        h.controller.depart_vehicle(&sig).await.unwrap();
        assert_eq!(
            in_pools(
                h.controller.available_vehicles().await,
                h.controller.active_vehicles().await,
                &sig
            ),
            0,
            "neither pool only after terminal departure"
        );
    }

    #[tokio::test]
    async fn trigger_checkpoint_targets_every_assigned_vehicle() {
        let h = harness();
        let job_id = submit_job(&h, "alice", "sim", 2).await;
        recruit(&h, "carol", "VAN100").await;
        recruit(&h, "dave", "VAN200").await;

        assert_eq!(h.controller.trigger_checkpoint(&job_id).await.unwrap(), 2);

        let history = h.store.get_notification_history("carol").unwrap();
        assert!(history
            .iter()
            .any(|n| n.message.contains("Checkpoint requested")));

        assert!(matches!(
            h.controller.trigger_checkpoint("missing").await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejected_request_never_touches_the_pools() {
        let h = harness();
        let request_id = h
            .controller
            .submit_vehicle_request("carol", details("VAN100"))
            .await
            .unwrap();
        h.controller.reject(&request_id).await.unwrap();

        assert!(h.controller.available_vehicles().await.is_empty());
        assert!(matches!(
            h.controller.approve(&request_id).await,
            Err(CoreError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_reload_restores_assignments_but_not_available_pool() {
        let h = harness();
        let job_id = submit_job(&h, "alice", "sim", 1).await;
        let worker = recruit(&h, "carol", "VAN100").await;
        recruit(&h, "dave", "VAN200").await; // stays available

        let restarted = Controller::new(
            h.registry.clone(),
            h.store.clone(),
            &h.snapshot_path,
        );

        assert_eq!(
            restarted.get_job_status(&job_id).await.unwrap(),
            JobStatus::InProgress
        );
        assert_eq!(restarted.assigned_vehicles(&job_id).await, vec![worker]);
        assert_eq!(restarted.active_vehicles().await.len(), 1);
        // Unassigned vehicles are not restored: owners re-register after a
        // restart.
        assert!(restarted.available_vehicles().await.is_empty());
    }

    #[tokio::test]
    async fn end_to_end_submit_approve_schedule_depart() {
        let h = harness();

        let request_id = h
            .controller
            .submit_job_request("alice", "j1", 5, 2, Utc::now() + Duration::hours(48))
            .await
            .unwrap();
        assert_eq!(h.controller.get_pending_requests().len(), 1);
        h.controller.approve(&request_id).await.unwrap();
        let job_id = find_job(&h, "j1").await;

        let v1 = recruit(&h, "carol", "VAN100").await;
        let v2 = recruit(&h, "dave", "VAN200").await;
        assert_eq!(
            h.controller.get_job_status(&job_id).await.unwrap(),
            JobStatus::InProgress
        );
        assert_eq!(h.controller.assigned_vehicles(&job_id).await.len(), 2);

        // V1 departs with no checkpoint and no spare: one of two assigned
        // vehicles remains, so the job continues on V2 alone.
        let outcome = h.controller.depart_vehicle(&v1).await.unwrap();
        assert_eq!(
            outcome,
            DepartureOutcome::JobContinues {
                job_id: job_id.clone(),
                remaining: 1,
            }
        );
        assert_eq!(
            h.controller.get_job_status(&job_id).await.unwrap(),
            JobStatus::InProgress
        );
        assert_eq!(h.controller.assigned_vehicles(&job_id).await, vec![v2.clone()]);
        let survivor = h
            .controller
            .active_vehicles()
            .await
            .into_iter()
            .find(|v| v.signature() == v2)
            .unwrap();
        assert_eq!(survivor.current_job_id.as_deref(), Some(job_id.as_str()));
    }
}
