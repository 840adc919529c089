//! Job bookkeeping shared by both workers: ids, progress events, outcomes and
//! the controller's handle on a running worker.

use std::fmt;

use tokio::task::JoinHandle;

use crate::cancel::CancellationToken;
use crate::error::JobError;

/// Monotonic per-controller job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Download,
    LoadModel,
    Processing,
}

/// A progress report: a message plus an optional fraction in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub message: String,
    pub progress: Option<f32>,
}

impl ProgressEvent {
    pub fn new(message: impl Into<String>, progress: Option<f32>) -> Self {
        Self {
            message: message.into(),
            progress: progress.map(|p| p.clamp(0.0, 1.0)),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::new(message, None)
    }
}

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success,
    Failed(JobError),
    Cancelled,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success)
    }

    pub fn error(&self) -> Option<&JobError> {
        match self {
            JobOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// What a worker reports while it runs. `Finished` is always the last event
/// of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Progress(ProgressEvent),
    Finished(JobOutcome),
}

/// A [`JobEvent`] tagged with the job that produced it, as posted on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub id: JobId,
    pub event: JobEvent,
}

/// Controller-side handle on the one active worker.
#[derive(Debug)]
pub struct JobHandle {
    pub id: JobId,
    pub kind: JobKind,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl JobHandle {
    pub fn new(id: JobId, kind: JobKind, token: CancellationToken, join: JoinHandle<()>) -> Self {
        Self {
            id,
            kind,
            token,
            join,
        }
    }

    /// Request cooperative cancellation. Returns `false` if already requested.
    pub fn cancel(&self) -> bool {
        self.token.cancel()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn into_join_handle(self) -> JoinHandle<()> {
        self.join
    }
}

/// Fraction `done / total`, clamped into `[0, 1]`. `None` when the total is
/// unknown or zero.
pub fn fraction(done: u64, total: Option<u64>) -> Option<f32> {
    match total {
        Some(t) if t > 0 => Some((done as f64 / t as f64).min(1.0) as f32),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_clamped() {
        assert_eq!(ProgressEvent::new("x", Some(1.7)).progress, Some(1.0));
        assert_eq!(ProgressEvent::new("x", Some(-0.2)).progress, Some(0.0));
        assert_eq!(ProgressEvent::message("x").progress, None);
    }

    #[test]
    fn fraction_handles_unknown_and_overflow() {
        assert_eq!(fraction(10, None), None);
        assert_eq!(fraction(10, Some(0)), None);
        assert_eq!(fraction(50, Some(100)), Some(0.5));
        assert_eq!(fraction(150, Some(100)), Some(1.0));
    }
}
