use thiserror::Error;

/// Failure taxonomy of the core. Nothing here is fatal to the process:
/// every variant is reported to the caller or degraded to a logged warning.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("duplicate id: {0}")]
    DuplicateId(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("transport failure: {0}")]
    Transport(String),
}
