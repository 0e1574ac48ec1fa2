//! Newline-delimited JSON frames spoken on the two daemon sockets.
//!
//! Every frame carries an explicit version field so the wire format can
//! evolve without shared in-process types on both ends.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Checkpoint;

pub const WIRE_VERSION: u8 = 1;

/// One checkpoint per connection on the ingress socket. The state blob is
/// base64 so the frame stays a single text line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointFrame {
    pub v: u8,
    pub checkpoint_id: String,
    pub job_id: String,
    pub vehicle_id: String,
    pub ts: DateTime<Utc>,
    pub state_data: String,
}

impl CheckpointFrame {
    pub fn from_checkpoint(cp: &Checkpoint) -> Self {
        Self {
            v: WIRE_VERSION,
            checkpoint_id: cp.id.clone(),
            job_id: cp.job_id.clone(),
            vehicle_id: cp.vehicle_id.clone(),
            ts: cp.ts,
            state_data: general_purpose::STANDARD.encode(&cp.state),
        }
    }

    pub fn into_checkpoint(self) -> Result<Checkpoint, CoreError> {
        if self.v != WIRE_VERSION {
            return Err(CoreError::Transport(format!(
                "unsupported checkpoint frame version {}",
                self.v
            )));
        }
        let state = general_purpose::STANDARD
            .decode(self.state_data.as_bytes())
            .map_err(|e| CoreError::Transport(format!("invalid state payload: {e}")))?;
        Ok(Checkpoint {
            id: self.checkpoint_id,
            job_id: self.job_id,
            vehicle_id: self.vehicle_id,
            ts: self.ts,
            state,
        })
    }
}

/// Sent by the server as soon as a notification connection is accepted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloFrame {
    pub v: u8,
    #[serde(rename = "type")]
    pub frame_type: String,
}

impl HelloFrame {
    pub fn new() -> Self {
        Self {
            v: WIRE_VERSION,
            frame_type: "hello".to_string(),
        }
    }
}

impl Default for HelloFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// The single frame a notification client sends: who to deliver for.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentifyFrame {
    pub v: u8,
    pub user: String,
}

impl IdentifyFrame {
    pub fn new(user: &str) -> Self {
        Self {
            v: WIRE_VERSION,
            user: user.to_string(),
        }
    }
}
