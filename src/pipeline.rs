//! Stem-separation worker: decode, infer, write one WAV per stem.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::audio;
use crate::bus::BusSender;
use crate::cancel::CancellationToken;
use crate::config::stem_file_path;
use crate::error::JobError;
use crate::job::{JobEvent, JobHandle, JobId, JobKind, JobOutcome, JobReport, ProgressEvent};
use crate::separator::{SeparationError, Separator};
use crate::stems::{in_production_order, Stem};

/// Share of the progress bar given to inference; file writing gets the rest.
const INFERENCE_SHARE: f32 = 0.9;

/// One separation run.
#[derive(Debug)]
pub struct ProcessingJob {
    pub source: PathBuf,
    pub output_dir: PathBuf,
    stems: Vec<Stem>,
    written: usize,
    progress: f32,
    outcome: Option<JobOutcome>,
}

impl ProcessingJob {
    pub fn new(source: impl Into<PathBuf>, output_dir: impl Into<PathBuf>, stems: &[Stem]) -> Self {
        Self {
            source: source.into(),
            output_dir: output_dir.into(),
            stems: in_production_order(stems),
            written: 0,
            progress: 0.0,
            outcome: None,
        }
    }

    pub fn stems(&self) -> &[Stem] {
        &self.stems
    }

    /// Stems fully written so far. Always a prefix of [`Self::stems`].
    pub fn completed_stems(&self) -> &[Stem] {
        &self.stems[..self.written]
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.as_ref()
    }

    /// Progress never moves backwards.
    fn advance(&mut self, to: f32) -> f32 {
        self.progress = self.progress.max(to.clamp(0.0, 1.0));
        self.progress
    }

    fn finish(&mut self, outcome: JobOutcome) -> JobOutcome {
        self.outcome = Some(outcome.clone());
        outcome
    }
}

enum Halt {
    Cancelled,
    Failed(JobError),
}

impl From<JobError> for Halt {
    fn from(e: JobError) -> Self {
        Halt::Failed(e)
    }
}

/// Run `job` to completion on the current thread.
///
/// Cancellation is observed inside inference (via the separator's progress
/// callback) and before each stem file is written. Stems already on disk stay
/// there.
pub fn run_pipeline(
    job: &mut ProcessingJob,
    separator: &dyn Separator,
    token: &CancellationToken,
    emit: &mut dyn FnMut(ProgressEvent),
) -> JobOutcome {
    let outcome = match separate_and_write(job, separator, token, emit) {
        Ok(()) => JobOutcome::Success,
        Err(Halt::Cancelled) => JobOutcome::Cancelled,
        Err(Halt::Failed(e)) => JobOutcome::Failed(e),
    };

    match &outcome {
        JobOutcome::Success => log::info!(
            "Wrote {} stems to {}",
            job.written,
            job.output_dir.display()
        ),
        JobOutcome::Cancelled => log::info!(
            "Processing cancelled after {} of {} stems",
            job.written,
            job.stems.len()
        ),
        JobOutcome::Failed(e) => log::error!("Processing {} failed: {e}", job.source.display()),
    }
    job.finish(outcome)
}

fn separate_and_write(
    job: &mut ProcessingJob,
    separator: &dyn Separator,
    token: &CancellationToken,
    emit: &mut dyn FnMut(ProgressEvent),
) -> Result<(), Halt> {
    if token.is_cancelled() {
        return Err(Halt::Cancelled);
    }

    emit(ProgressEvent::new("Loading audio file...", Some(job.progress)));
    let input = audio::decode(&job.source)?;
    if input.channels.len() != audio::REQUIRED_CHANNELS as usize {
        return Err(JobError::Io(format!(
            "{} decoded to {} channel(s)",
            job.source.display(),
            input.channels.len()
        ))
        .into());
    }
    log::debug!(
        "Decoded {} frames from {}",
        input.frames(),
        job.source.display()
    );

    emit(ProgressEvent::new("Separating stems...", Some(job.progress)));
    let result = {
        let mut on_progress = |p: f32, message: &str| {
            if token.is_cancelled() {
                return ControlFlow::Break(());
            }
            if message.is_empty() {
                return ControlFlow::Continue(());
            }
            let at = job.advance(p * INFERENCE_SHARE);
            emit(ProgressEvent::new(message, Some(at)));
            ControlFlow::Continue(())
        };
        separator.separate(&input, &mut on_progress)
    };
    let separation = match result {
        Ok(s) => s,
        Err(SeparationError::Cancelled) => return Err(Halt::Cancelled),
        Err(SeparationError::Failed(msg)) => return Err(JobError::Internal(msg).into()),
    };
    let at = job.advance(INFERENCE_SHARE);

    std::fs::create_dir_all(&job.output_dir).map_err(|e| {
        JobError::io(
            format!("Failed to create {}", job.output_dir.display()),
            e,
        )
    })?;
    emit(ProgressEvent::new("Writing stems...", Some(at)));

    let total = job.stems.len().max(1) as f32;
    for i in 0..job.stems.len() {
        if token.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        let stem = job.stems[i];
        let track = separation.track(stem).ok_or_else(|| {
            JobError::Internal(format!("Separator produced no {stem} stem"))
        })?;
        let path = stem_file_path(&job.output_dir, &job.source, stem);
        audio::write_stereo_pcm16(&path, &track.left, &track.right, input.sample_rate)?;
        job.written = i + 1;

        let at = job.advance(INFERENCE_SHARE + (1.0 - INFERENCE_SHARE) * (i + 1) as f32 / total);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        emit(ProgressEvent::new(format!("Wrote {name}"), Some(at)));
    }
    Ok(())
}

/// Spawns processing workers on a tokio runtime.
#[derive(Debug, Clone)]
pub struct PipelineRunner {
    separator: Arc<dyn Separator>,
}

impl PipelineRunner {
    pub fn new(separator: Arc<dyn Separator>) -> Self {
        Self { separator }
    }

    /// Validate `source` and start separating it into `output_dir`.
    ///
    /// Validation happens here, before any worker exists: an unsupported file
    /// or a stem the model cannot produce is returned as an error with nothing
    /// spawned and nothing written. Otherwise exactly one `Finished` report is
    /// posted on `sender`.
    pub fn start<M>(
        &self,
        rt: &Handle,
        id: JobId,
        source: &Path,
        output_dir: &Path,
        stems: &[Stem],
        sender: BusSender<M>,
    ) -> Result<JobHandle, JobError>
    where
        M: From<JobReport> + Send + 'static,
    {
        let format = audio::validate_input(source)?;
        if stems.is_empty() {
            return Err(JobError::Validation("No stems selected".into()));
        }
        if let Some(missing) = stems.iter().find(|s| !self.separator.stems().contains(*s)) {
            return Err(JobError::Validation(format!(
                "The loaded model cannot produce the {missing} stem"
            )));
        }

        log::info!(
            "{id}: separating {} ({:.1}s) into {}",
            source.display(),
            format.duration_secs(),
            output_dir.display()
        );

        let token = CancellationToken::new();
        let worker_token = token.clone();
        let separator = Arc::clone(&self.separator);
        let mut job = ProcessingJob::new(source, output_dir, stems);
        let progress_sender = sender.clone();

        let join = rt.spawn(async move {
            let work = tokio::task::spawn_blocking(move || {
                let mut emit = |p| {
                    progress_sender.post(M::from(JobReport {
                        id,
                        event: JobEvent::Progress(p),
                    }))
                };
                run_pipeline(&mut job, separator.as_ref(), &worker_token, &mut emit)
            });

            let outcome = match work.await {
                Ok(outcome) => outcome,
                Err(e) => JobOutcome::Failed(JobError::Internal(format!(
                    "Processing task panicked: {e}"
                ))),
            };
            sender.post(M::from(JobReport {
                id,
                event: JobEvent::Finished(outcome),
            }));
        });

        Ok(JobHandle::new(id, JobKind::Processing, token, join))
    }
}
