use crate::error::JobError;
use crate::job::{JobEvent, JobKind, JobReport};

use super::state::{AppState, BackendEvent, Notice};

impl AppState {
    /// Handle a backend event. This is the core state machine.
    ///
    /// Events from anything but the active job are stale and dropped. A
    /// job's terminal event releases it, so at most one job is ever active.
    pub fn handle_event(&mut self, event: BackendEvent) -> Option<Notice> {
        let id = event.job_id();
        if self.active.as_ref().map(|job| job.id) != Some(id) {
            log::debug!("Ignoring event from stale {id}");
            return None;
        }

        match event {
            BackendEvent::Job(JobReport {
                event: JobEvent::Progress(progress),
                ..
            }) => Some(progress.into()),
            BackendEvent::Job(JobReport {
                event: JobEvent::Finished(outcome),
                ..
            }) => {
                let job = self.active.take()?;
                log::info!("{id} finished: {outcome:?}");
                Some(match job.kind {
                    JobKind::Download => self.on_download_finished(outcome),
                    JobKind::Processing => self.on_processing_finished(outcome),
                    JobKind::LoadModel => {
                        log::warn!("{id}: model load finished without a model");
                        let err = outcome.error().cloned().unwrap_or_else(|| {
                            JobError::Internal("model loader returned no model".into())
                        });
                        self.on_model_loaded(Err(err))
                    }
                })
            }
            BackendEvent::ModelLoaded { result, .. } => {
                self.active = None;
                Some(self.on_model_loaded(result))
            }
        }
    }
}
