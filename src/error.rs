//! Controller-wide error types.
//!
//! Command-scoped protocol errors (bad opcode, LBA out of range, duplicate
//! CID, ...) are never represented here - they are recovered locally by
//! posting a [`crate::command::Completion`] with the appropriate SCT/SC/DNR
//! fields. This type is reserved for the handful of controller-fatal
//! conditions that set CSTS.CFS and stop the dispatcher; [`Controller::
//! last_error`](crate::controller::Controller::last_error) is what actually
//! constructs and surfaces these to a caller.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ControllerError {
    #[error("controller reset timed out after {0:?}")]
    ResetTimeout(std::time::Duration),

    #[error("invalid doorbell value {value} for queue {queue_id} (size {size})")]
    InvalidDoorbell {
        queue_id: u16,
        value: u16,
        size: u16,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("deserialization error: {0}")]
    Deserialize(#[from] serde_yaml::Error),
}
