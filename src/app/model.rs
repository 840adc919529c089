use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::downloader::AssetDownloader;
use crate::error::{JobError, Result};
use crate::job::{JobEvent, JobHandle, JobKind, JobOutcome, JobReport, ProgressEvent};
use crate::separator::Separator;

use super::state::{AppState, BackendEvent, Notice, TaskState};

impl AppState {
    /// Check for the model asset: load it if present, otherwise ask for
    /// permission to download it.
    pub fn startup(&mut self) -> Result<()> {
        self.require("startup", &[TaskState::Idle])?;
        if self.model_exists() {
            self.begin_model_load()
        } else {
            log::info!("Model not found at {}", self.config.model_path().display());
            self.set_status(TaskState::ModelMissing);
            self.prompt_download()
        }
    }

    /// Ask the user whether to download the model.
    pub fn prompt_download(&mut self) -> Result<()> {
        self.require("prompt for download", &[TaskState::ModelMissing])?;
        self.set_status(TaskState::AwaitingDownloadConsent);
        Ok(())
    }

    /// The user's answer to the download prompt. Declining leaves the app in
    /// `ModelMissing` with processing unavailable.
    pub fn answer_download_prompt(&mut self, consent: bool) -> Result<()> {
        self.require("answer the download prompt", &[TaskState::AwaitingDownloadConsent])?;
        if consent {
            self.begin_download()
        } else {
            log::info!("Model download declined");
            self.set_status(TaskState::ModelMissing);
            Ok(())
        }
    }

    /// Start over after a failed, cancelled, or unusable download.
    pub fn retry_download(&mut self) -> Result<()> {
        match self.status {
            TaskState::Error if self.separator.is_none() => self.set_status(TaskState::ModelMissing),
            TaskState::ModelMissing => {}
            _ => return self.require("retry the download", &[]),
        }
        self.prompt_download()
    }

    fn begin_download(&mut self) -> Result<()> {
        let id = self.next_job_id();
        let downloader = AssetDownloader::new(self.config.download.clone());
        let staging = self.config.partial_model_path();
        let started = downloader.start(
            self.runtime()?,
            id,
            &self.config.model_url,
            &staging,
            self.backend_sender.clone(),
        );

        match started {
            Ok(handle) => {
                self.active = Some(handle);
                self.set_status(TaskState::Downloading);
                Ok(())
            }
            Err(e) => {
                log::error!("Could not start download: {e}");
                self.set_status(TaskState::Error);
                Err(e.into())
            }
        }
    }

    /// Move the verified download into place and start loading it.
    pub(super) fn on_download_finished(&mut self, outcome: JobOutcome) -> Notice {
        match outcome {
            JobOutcome::Success => {
                let staging = self.config.partial_model_path();
                let target = self.config.model_path();
                if let Err(e) = std::fs::rename(&staging, &target) {
                    let err = JobError::io(
                        format!("Failed to move model into {}", target.display()),
                        e,
                    );
                    log::error!("{err}");
                    self.set_status(TaskState::Error);
                    return Notice::alert(format!("Download failed: {err}"));
                }
                log::info!("Model saved to {}", target.display());
                match self.begin_model_load() {
                    Ok(()) => Notice::info("Download completed successfully").with_progress(1.0),
                    Err(e) => {
                        self.set_status(TaskState::Error);
                        Notice::alert(format!("Failed to load model: {e}"))
                    }
                }
            }
            JobOutcome::Cancelled => {
                self.set_status(TaskState::Error);
                Notice::info("Download cancelled")
            }
            JobOutcome::Failed(e) => {
                self.set_status(TaskState::Error);
                Notice::alert(format!("Download failed: {e}"))
            }
        }
    }

    /// Load the model on a blocking thread; the result comes back as
    /// [`BackendEvent::ModelLoaded`].
    pub(super) fn begin_model_load(&mut self) -> Result<()> {
        let id = self.next_job_id();
        let rt = self.runtime()?.clone();
        let loader = self.loader.clone();
        let path = self.config.model_path();
        let sender = self.backend_sender.clone();

        log::info!("{id}: loading model {}", path.display());
        sender.post(BackendEvent::Job(JobReport {
            id,
            event: JobEvent::Progress(ProgressEvent::message("Loading model...")),
        }));

        let join = rt.spawn(async move {
            let result = tokio::task::spawn_blocking(move || loader.load(&path)).await;
            let result = match result {
                Ok(r) => r,
                Err(e) => Err(JobError::Internal(format!("Model load panicked: {e}"))),
            };
            sender.post(BackendEvent::ModelLoaded { id, result });
        });

        // The loader has no cancellation point; shutdown only bounds the wait.
        self.active = Some(JobHandle::new(
            id,
            JobKind::LoadModel,
            CancellationToken::new(),
            join,
        ));
        self.set_status(TaskState::LoadingModel);
        Ok(())
    }

    pub(super) fn on_model_loaded(
        &mut self,
        result: std::result::Result<Arc<dyn Separator>, JobError>,
    ) -> Notice {
        match result {
            Ok(separator) => {
                log::info!("Model ready ({} stems)", separator.stems().len());
                self.separator = Some(separator);
                self.set_status(TaskState::Ready);
                Notice::info("Model loaded")
            }
            Err(e) => {
                log::error!("Failed to load model: {e}");
                self.set_status(TaskState::Error);
                Notice::alert(format!("Failed to load model: {e}"))
            }
        }
    }
}
