//! Error types shared by the workers and the controller.

use std::time::Duration;

use thiserror::Error;

use crate::app::TaskState;

/// Failure classes a background job can end with.
///
/// Errors never cross the worker boundary as panics; they travel as data
/// inside the terminal event, so the type is `Clone`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Stream open/read failure or retry exhaustion.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Downloaded byte count does not match the advertised size.
    #[error("Integrity error: expected {expected} bytes, got {actual}")]
    Integrity { expected: u64, actual: u64 },

    /// Unsupported input audio, rejected before any job starts.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Local file create/write/read failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Unexpected failure inside the inference call.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    pub fn io(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        JobError::Io(format!("{context}: {err}"))
    }

    /// Errors the presentation layer should surface as a modal alert.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, JobError::Validation(_))
    }
}

/// Rejections of controller requests.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    #[error("{action} is not allowed while {state:?}")]
    InvalidState {
        action: &'static str,
        state: TaskState,
    },

    #[error("No input file selected")]
    NoInputSelected,

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("Worker did not exit within {0:?}")]
    ShutdownTimeout(Duration),
}

pub type Result<T> = std::result::Result<T, ControlError>;
