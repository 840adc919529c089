//! Background model download and stem separation with cooperative
//! cancellation.
//!
//! Workers run on a tokio runtime owned by [`app::AppState`] and talk to the
//! owning thread only through [`bus`]. Each job reports progress in order and
//! ends with exactly one `Finished` event.

pub mod app;
pub mod audio;
pub mod bus;
pub mod cancel;
pub mod config;
pub mod downloader;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod separator;
pub mod stems;

pub use app::{AppState, BackendEvent, Notice, TaskState};
pub use cancel::CancellationToken;
pub use config::Config;
pub use error::{ControlError, JobError};
pub use job::{JobEvent, JobId, JobKind, JobOutcome, JobReport, ProgressEvent};
pub use stems::Stem;
