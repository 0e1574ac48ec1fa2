//! Shared domain types for the convoy job coordination daemon.
//!
//! Everything that crosses a crate boundary lives here: the Job, Vehicle,
//! Request and Checkpoint records, the wire frames spoken on the checkpoint
//! and notification sockets, and the core error taxonomy.

pub mod error;
pub mod types;
pub mod wire;

pub use error::CoreError;
pub use types::{
    Checkpoint, Job, JobStatus, Request, RequestPayload, RequestStatus, Vehicle, VehicleStatus,
};
pub use wire::{CheckpointFrame, HelloFrame, IdentifyFrame, WIRE_VERSION};
