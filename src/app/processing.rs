use std::path::PathBuf;

use crate::config::stems_dir_for;
use crate::error::{ControlError, Result};
use crate::job::JobOutcome;
use crate::pipeline::PipelineRunner;

use super::state::{AppState, Notice, TaskState};

impl AppState {
    /// Choose the input file.
    pub fn select_file(&mut self, path: PathBuf) -> Result<()> {
        self.require("select a file", &[TaskState::Ready])?;
        log::info!("Selected {}", path.display());
        self.selected_file = Some(path);
        Ok(())
    }

    /// Validate the selected file and start separating it. A rejected file
    /// leaves the state at `Ready` with nothing spawned.
    pub fn start_processing(&mut self) -> Result<()> {
        self.require("start processing", &[TaskState::Ready])?;
        let source = self
            .selected_file
            .clone()
            .ok_or(ControlError::NoInputSelected)?;
        let separator = self.separator.clone().ok_or(ControlError::InvalidState {
            action: "start processing",
            state: self.status,
        })?;

        let output_dir = stems_dir_for(&source);
        let id = self.next_job_id();
        let handle = PipelineRunner::new(separator).start(
            self.runtime()?,
            id,
            &source,
            &output_dir,
            &self.config.stems,
            self.backend_sender.clone(),
        )?;

        self.active = Some(handle);
        self.last_output_dir = Some(output_dir);
        self.set_status(TaskState::Processing);
        Ok(())
    }

    /// Request cancellation of the active job. Processing moves to
    /// `Stopping` until the worker's terminal event arrives; a download stays
    /// `Downloading` and ends in `Error`.
    pub fn cancel(&mut self) -> Result<()> {
        self.require("cancel", &[TaskState::Processing, TaskState::Downloading])?;
        let Some(job) = self.active.as_ref() else {
            return self.require("cancel", &[]);
        };
        if job.cancel() {
            log::info!("Cancellation requested for {}", job.id);
        }
        if self.status == TaskState::Processing {
            self.set_status(TaskState::Stopping);
        }
        Ok(())
    }

    pub(super) fn on_processing_finished(&mut self, outcome: JobOutcome) -> Notice {
        self.set_status(TaskState::Ready);
        let dir = self
            .last_output_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_default();
        match outcome {
            JobOutcome::Success => {
                Notice::info(format!("Processing completed. Stems saved to {dir}")).with_progress(1.0)
            }
            JobOutcome::Cancelled => Notice::info("Processing cancelled"),
            JobOutcome::Failed(e) if e.is_fatal() => Notice::alert(format!("Processing failed: {e}")),
            JobOutcome::Failed(e) => Notice::info(format!("Processing failed: {e}")),
        }
    }
}
