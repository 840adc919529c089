use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bus::BusSender;
use crate::config::Config;
use crate::error::{ControlError, JobError, Result};
use crate::job::{JobHandle, JobId, JobKind, JobReport, ProgressEvent};
use crate::separator::{ModelLoader, ProcessModelLoader, Separator};

/// Events delivered from workers to the owning thread.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    Job(JobReport),
    /// Terminal event of a model load. Carries the loaded model.
    ModelLoaded {
        id: JobId,
        result: std::result::Result<Arc<dyn Separator>, JobError>,
    },
}

impl BackendEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            BackendEvent::Job(report) => report.id,
            BackendEvent::ModelLoaded { id, .. } => *id,
        }
    }
}

impl From<JobReport> for BackendEvent {
    fn from(report: JobReport) -> Self {
        BackendEvent::Job(report)
    }
}

/// Application status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    ModelMissing,
    AwaitingDownloadConsent,
    Downloading,
    LoadingModel,
    Ready,
    Processing,
    Stopping,
    Error,
}

impl TaskState {
    /// Status line text.
    pub fn label(&self) -> &'static str {
        match self {
            TaskState::Idle => "Starting...",
            TaskState::ModelMissing => "Model not found",
            TaskState::AwaitingDownloadConsent => "Waiting for download confirmation",
            TaskState::Downloading => "Downloading model...",
            TaskState::LoadingModel => "Loading model...",
            TaskState::Ready => "Ready",
            TaskState::Processing => "Processing...",
            TaskState::Stopping => "Stopping...",
            TaskState::Error => "Error",
        }
    }

    /// Whether a background job may be running in this state.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            TaskState::Downloading
                | TaskState::LoadingModel
                | TaskState::Processing
                | TaskState::Stopping
        )
    }
}

/// What the presentation layer should show after handling an event.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub message: String,
    pub progress: Option<f32>,
    /// Show as a modal alert rather than a log line.
    pub alert: bool,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            progress: None,
            alert: false,
        }
    }

    pub fn alert(message: impl Into<String>) -> Self {
        Self {
            alert: true,
            ..Self::info(message)
        }
    }

    pub fn with_progress(mut self, progress: f32) -> Self {
        self.progress = Some(progress);
        self
    }
}

impl From<ProgressEvent> for Notice {
    fn from(event: ProgressEvent) -> Self {
        Self {
            message: event.message,
            progress: event.progress,
            alert: false,
        }
    }
}

/// Central application state. Lives on the owning (UI) thread; workers only
/// reach it through the bus.
pub struct AppState {
    pub(super) status: TaskState,
    pub config: Config,
    tokio_rt: Option<tokio::runtime::Runtime>,
    pub(super) backend_sender: BusSender<BackendEvent>,
    pub(super) loader: Arc<dyn ModelLoader>,
    pub(super) separator: Option<Arc<dyn Separator>>,
    pub(super) active: Option<JobHandle>,
    next_job: u64,
    pub(super) selected_file: Option<PathBuf>,
    pub(super) last_output_dir: Option<PathBuf>,
}

impl AppState {
    pub fn new(config: Config, sender: BusSender<BackendEvent>) -> std::io::Result<Self> {
        let loader = Arc::new(ProcessModelLoader::new(&config.separator_command));
        Self::with_loader(config, sender, loader)
    }

    pub fn with_loader(
        config: Config,
        sender: BusSender<BackendEvent>,
        loader: Arc<dyn ModelLoader>,
    ) -> std::io::Result<Self> {
        let tokio_rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("demucs-worker")
            .build()?;

        Ok(Self {
            status: TaskState::Idle,
            config,
            tokio_rt: Some(tokio_rt),
            backend_sender: sender,
            loader,
            separator: None,
            active: None,
            next_job: 0,
            selected_file: None,
            last_output_dir: None,
        })
    }

    pub fn status(&self) -> TaskState {
        self.status
    }

    pub fn selected_file(&self) -> Option<&Path> {
        self.selected_file.as_deref()
    }

    /// Output directory of the last processing run.
    pub fn last_output_dir(&self) -> Option<&Path> {
        self.last_output_dir.as_deref()
    }

    pub fn model_loaded(&self) -> bool {
        self.separator.is_some()
    }

    pub fn model_exists(&self) -> bool {
        self.config.model_path().is_file()
    }

    pub fn active_job(&self) -> Option<(JobId, JobKind)> {
        self.active.as_ref().map(|job| (job.id, job.kind))
    }

    pub(super) fn set_status(&mut self, next: TaskState) {
        if self.status != next {
            log::info!("State: {:?} -> {:?}", self.status, next);
        }
        self.status = next;
    }

    pub(super) fn next_job_id(&mut self) -> JobId {
        self.next_job += 1;
        JobId(self.next_job)
    }

    pub(super) fn runtime(&self) -> Result<&tokio::runtime::Handle> {
        self.tokio_rt
            .as_ref()
            .map(|rt| rt.handle())
            .ok_or(ControlError::InvalidState {
                action: "start a job",
                state: self.status,
            })
    }

    pub(super) fn require(&self, action: &'static str, allowed: &[TaskState]) -> Result<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            log::debug!("Rejected {action} while {:?}", self.status);
            Err(ControlError::InvalidState {
                action,
                state: self.status,
            })
        }
    }

    /// Cancel any active job and wait, bounded by the configured timeout, for
    /// it to exit. On timeout any engine process is killed and the caller
    /// should terminate the process.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(rt) = self.tokio_rt.take() else {
            return Ok(());
        };
        let limit = self.config.shutdown_timeout();

        let result = match self.active.take() {
            Some(job) => {
                job.cancel();
                log::info!("Waiting up to {limit:?} for {} to exit", job.id);
                let join = job.into_join_handle();
                match rt.block_on(async move { tokio::time::timeout(limit, join).await }) {
                    Ok(_) => Ok(()),
                    Err(_) => {
                        let killed = crate::separator::kill_running_engines();
                        log::error!(
                            "Worker still running after {limit:?}, killed {killed} engine process(es)"
                        );
                        Err(ControlError::ShutdownTimeout(limit))
                    }
                }
            }
            None => Ok(()),
        };

        // Blocking threads that ignored the timeout are left behind here
        rt.shutdown_timeout(std::time::Duration::from_millis(100));
        log::info!("Shutdown complete");
        result
    }
}

impl Drop for AppState {
    fn drop(&mut self) {
        if self.tokio_rt.is_some() {
            if let Err(e) = self.shutdown() {
                log::error!("{e}");
            }
        }
    }
}
