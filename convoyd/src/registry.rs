//! Authoritative store for in-flight requests, the checkpoint archive, and
//! the table of live outbound notification channels.
//!
//! The registry has no scheduling logic. Its three tables are synchronized
//! independently of the controller lock; callers never hold both at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::{debug, info, warn};

use convoy_common::{Checkpoint, CoreError, Request, RequestStatus};

pub struct Registry {
    requests: Mutex<HashMap<String, Request>>,
    checkpoints: Mutex<HashMap<String, Vec<Checkpoint>>>,
    channels: tokio::sync::Mutex<HashMap<String, Channel>>,
    channel_seq: AtomicU64,
}

struct Channel {
    token: u64,
    writer: OwnedWriteHalf,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
            checkpoints: Mutex::new(HashMap::new()),
            channels: tokio::sync::Mutex::new(HashMap::new()),
            channel_seq: AtomicU64::new(1),
        }
    }

    /// Re-populate the request table from the relational store at boot.
    pub fn seed_requests(&self, requests: Vec<Request>) {
        let mut table = self.requests.lock().unwrap();
        for request in requests {
            table.entry(request.id.clone()).or_insert(request);
        }
    }

    /// Store a new pending request. Ids are generated by `Request::new`, so a
    /// collision only happens when a caller supplies its own.
    pub fn submit(&self, request: Request) -> Result<String, CoreError> {
        let mut table = self.requests.lock().unwrap();
        if table.contains_key(&request.id) {
            return Err(CoreError::DuplicateId(request.id));
        }
        let id = request.id.clone();
        table.insert(id.clone(), request);
        Ok(id)
    }

    pub fn get(&self, request_id: &str) -> Result<Request, CoreError> {
        self.requests
            .lock()
            .unwrap()
            .get(request_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("request {request_id}")))
    }

    /// Confirm receipt. Independent of the approval decision.
    pub fn acknowledge(&self, request_id: &str) -> Result<(), CoreError> {
        let mut table = self.requests.lock().unwrap();
        let request = table
            .get_mut(request_id)
            .ok_or_else(|| CoreError::NotFound(format!("request {request_id}")))?;
        request.acknowledged = true;
        Ok(())
    }

    pub fn approve(&self, request_id: &str) -> Result<Request, CoreError> {
        self.decide(request_id, RequestStatus::Approved)
    }

    pub fn reject(&self, request_id: &str) -> Result<Request, CoreError> {
        self.decide(request_id, RequestStatus::Rejected)
    }

    fn decide(&self, request_id: &str, status: RequestStatus) -> Result<Request, CoreError> {
        let mut table = self.requests.lock().unwrap();
        let request = table
            .get_mut(request_id)
            .ok_or_else(|| CoreError::NotFound(format!("request {request_id}")))?;
        if request.status != RequestStatus::Pending {
            return Err(CoreError::InvalidState(format!(
                "request {request_id} already decided"
            )));
        }
        request.status = status;
        request.decided_at = Some(Utc::now());
        Ok(request.clone())
    }

    /// Pending requests, stable by submission time.
    pub fn list_pending(&self) -> Vec<Request> {
        let table = self.requests.lock().unwrap();
        let mut pending: Vec<Request> = table
            .values()
            .filter(|r| r.status == RequestStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.submitted_at);
        pending
    }

    pub fn decided_requests(&self) -> Vec<Request> {
        let table = self.requests.lock().unwrap();
        let mut decided: Vec<Request> = table
            .values()
            .filter(|r| r.status != RequestStatus::Pending)
            .cloned()
            .collect();
        decided.sort_by_key(|r| r.submitted_at);
        decided
    }

    /// Append-only; valid input is never rejected.
    pub fn archive_checkpoint(&self, checkpoint: Checkpoint) {
        debug!(
            checkpoint_id = %checkpoint.id,
            job_id = %checkpoint.job_id,
            vehicle_id = %checkpoint.vehicle_id,
            "Checkpoint archived"
        );
        self.checkpoints
            .lock()
            .unwrap()
            .entry(checkpoint.job_id.clone())
            .or_default()
            .push(checkpoint);
    }

    /// Latest by insertion order; timestamps from vehicle clocks may lie.
    pub fn latest_checkpoint(&self, job_id: &str) -> Option<Checkpoint> {
        self.checkpoints
            .lock()
            .unwrap()
            .get(job_id)
            .and_then(|archive| archive.last().cloned())
    }

    pub fn checkpoint_count(&self, job_id: &str) -> usize {
        self.checkpoints
            .lock()
            .unwrap()
            .get(job_id)
            .map(|archive| archive.len())
            .unwrap_or(0)
    }

    /// Register the outbound half of a notification connection. One channel
    /// per user: a reconnect replaces any prior channel (last-writer-wins).
    /// Returns a token the owning connection uses to deregister itself.
    pub async fn register_channel(&self, user: &str, writer: OwnedWriteHalf) -> u64 {
        let token = self.channel_seq.fetch_add(1, Ordering::Relaxed);
        let mut channels = self.channels.lock().await;
        if channels.insert(user.to_string(), Channel { token, writer }).is_some() {
            info!(user, "Replaced existing notification channel");
        } else {
            info!(user, "Notification channel registered");
        }
        token
    }

    /// Drop the user's channel, but only if it is still the one identified by
    /// `token`; a connection that was already replaced must not tear down its
    /// successor.
    pub async fn deregister_channel(&self, user: &str, token: u64) {
        let mut channels = self.channels.lock().await;
        if channels.get(user).map(|c| c.token) == Some(token) {
            channels.remove(user);
            info!(user, "Notification channel deregistered");
        }
    }

    pub async fn has_channel(&self, user: &str) -> bool {
        self.channels.lock().await.contains_key(user)
    }

    /// Best-effort, at-most-once push. Without a registered channel the
    /// message is dropped here; durable history is the caller's concern.
    pub async fn notify(&self, user: &str, message: &str) -> bool {
        let mut channels = self.channels.lock().await;
        let Some(channel) = channels.get_mut(user) else {
            debug!(user, "No notification channel, dropping message");
            return false;
        };

        let line = match serde_json::to_string(message) {
            Ok(encoded) => encoded + "\n",
            Err(err) => {
                warn!(user, "Failed to encode notification: {}", err);
                return false;
            }
        };

        match channel.writer.write_all(line.as_bytes()).await {
            Ok(()) => true,
            Err(err) => {
                warn!(user, "Notification push failed, dropping channel: {}", err);
                channels.remove(user);
                false
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
