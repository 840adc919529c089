//! Streams the model asset to disk with bounded retry and size verification.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;

use crate::bus::BusSender;
use crate::cancel::CancellationToken;
use crate::config::DownloadSettings;
use crate::error::JobError;
use crate::job::{fraction, JobEvent, JobHandle, JobId, JobKind, JobOutcome, JobReport, ProgressEvent};

/// Byte-count progress cadence when the server does not advertise a length.
const UNKNOWN_SIZE_REPORT_STEP: u64 = 10 * 1024 * 1024;

/// How often a worker waiting on the server looks at its token.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Result of one read from a [`ByteSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Read {
    /// `n` bytes were copied into the buffer. `Data(0)` counts as empty.
    Data(usize),
    /// Nothing arrived within the read timeout.
    Empty,
    /// The stream ended cleanly.
    End,
}

/// A remote byte stream read in fixed-size chunks.
///
/// `Err` from `read_chunk` is a fatal stream error.
pub trait ByteSource: Send {
    fn content_length(&self) -> Option<u64>;

    fn read_chunk(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<Read, JobError>> + Send;
}

/// `ByteSource` over an HTTP(S) response body.
pub struct HttpSource {
    stream: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    pending: Vec<u8>,
    offset: usize,
    total: Option<u64>,
    read_timeout: Duration,
    finished: bool,
}

impl HttpSource {
    pub async fn connect(address: &str, settings: &DownloadSettings) -> Result<Self, JobError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout())
            .build()
            .map_err(|e| JobError::Connection(format!("Failed to build HTTP client: {e}")))?;

        // connect_timeout only covers the handshake; a server that accepts and
        // never answers is bounded here
        let wait = settings.connect_timeout() + settings.read_timeout();
        let response = tokio::time::timeout(wait, client.get(address).send())
            .await
            .map_err(|_| {
                JobError::Connection(format!(
                    "Download server sent no response within {}s",
                    wait.as_secs()
                ))
            })?
            .map_err(|e| JobError::Connection(format!("Failed to connect to download server: {e}")))?;

        if !response.status().is_success() {
            return Err(JobError::Connection(format!(
                "Download server returned HTTP {}",
                response.status()
            )));
        }

        let total = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();

        Ok(Self {
            stream,
            pending: Vec::new(),
            offset: 0,
            total,
            read_timeout: settings.read_timeout(),
            finished: false,
        })
    }
}

impl ByteSource for HttpSource {
    fn content_length(&self) -> Option<u64> {
        self.total
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<Read, JobError> {
        if self.offset >= self.pending.len() {
            if self.finished {
                return Ok(Read::End);
            }
            match tokio::time::timeout(self.read_timeout, self.stream.next()).await {
                Err(_) => return Ok(Read::Empty),
                Ok(None) => {
                    self.finished = true;
                    return Ok(Read::End);
                }
                Ok(Some(Err(e))) => {
                    return Err(JobError::Connection(format!("Stream read failed: {e}")));
                }
                Ok(Some(Ok(chunk))) => {
                    if chunk.is_empty() {
                        return Ok(Read::Empty);
                    }
                    self.pending = chunk;
                    self.offset = 0;
                }
            }
        }

        let n = buf.len().min(self.pending.len() - self.offset);
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(Read::Data(n))
    }
}

/// State of one download.
#[derive(Debug)]
pub struct DownloadJob {
    pub address: String,
    pub destination: PathBuf,
    pub expected_size: Option<u64>,
    bytes_written: u64,
    empty_reads: u32,
    outcome: Option<JobOutcome>,
}

impl DownloadJob {
    pub fn new(address: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            address: address.into(),
            destination: destination.into(),
            expected_size: None,
            bytes_written: 0,
            empty_reads: 0,
            outcome: None,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn empty_reads(&self) -> u32 {
        self.empty_reads
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.as_ref()
    }

    fn finish(&mut self, outcome: JobOutcome) -> JobOutcome {
        debug_assert!(self.outcome.is_none(), "download finished twice");
        self.outcome = Some(outcome.clone());
        outcome
    }
}

enum LoopExit {
    Cancelled,
    End,
    Failed(JobError),
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Copy `source` into `job.destination` until the stream ends, the retry
/// budget runs out, or `token` is set.
///
/// `emit` receives progress only; the returned outcome is the terminal result.
pub async fn fetch_to_file<S, F>(
    job: &mut DownloadJob,
    mut source: S,
    settings: &DownloadSettings,
    token: &CancellationToken,
    emit: &mut F,
) -> JobOutcome
where
    S: ByteSource,
    F: FnMut(ProgressEvent) + Send,
{
    job.expected_size = source.content_length();
    match job.expected_size {
        Some(total) => emit(ProgressEvent::new(
            format!("Starting download ({:.1} MB)...", mb(total)),
            Some(0.0),
        )),
        None => emit(ProgressEvent::message("Starting download (size unknown)...")),
    }

    let mut file = match tokio::fs::File::create(&job.destination).await {
        Ok(f) => f,
        Err(e) => {
            let err = JobError::io(
                format!("Failed to create output file {}", job.destination.display()),
                e,
            );
            return job.finish(JobOutcome::Failed(err));
        }
    };

    let mut buf = vec![0u8; settings.chunk_size.max(1)];
    let mut last_percentage = 0u64;
    let mut last_step = 0u64;

    let exit = loop {
        if token.is_cancelled() {
            break LoopExit::Cancelled;
        }

        let read = match source.read_chunk(&mut buf).await {
            Ok(read) => read,
            Err(e) => {
                log::error!("Read error after {} bytes: {e}", job.bytes_written);
                break LoopExit::Failed(e);
            }
        };

        match read {
            Read::End => break LoopExit::End,
            Read::Empty | Read::Data(0) => {
                job.empty_reads += 1;
                log::warn!(
                    "Zero bytes read (attempt {} of {})",
                    job.empty_reads,
                    settings.max_empty_reads
                );
                if job.empty_reads >= settings.max_empty_reads {
                    break LoopExit::Failed(JobError::Connection(format!(
                        "No data received after {} attempts",
                        job.empty_reads
                    )));
                }
                tokio::time::sleep(settings.retry_backoff()).await;
            }
            Read::Data(n) => {
                job.empty_reads = 0;
                if let Err(e) = file.write_all(&buf[..n]).await {
                    let _ = file.flush().await;
                    let err = JobError::io("Failed to write to output file", e);
                    return job.finish(JobOutcome::Failed(err));
                }
                job.bytes_written += n as u64;

                match job.expected_size {
                    Some(total) if total > 0 => {
                        let percentage = job.bytes_written.min(total) * 100 / total;
                        if percentage / 10 > last_percentage / 10 {
                            let msg = format!(
                                "{percentage}% completed ({:.1} MB / {:.1} MB)",
                                mb(job.bytes_written),
                                mb(total)
                            );
                            log::info!("{msg}");
                            emit(ProgressEvent::new(msg, fraction(job.bytes_written, Some(total))));
                            last_percentage = percentage;
                        }
                    }
                    _ => {
                        let step = job.bytes_written / UNKNOWN_SIZE_REPORT_STEP;
                        if step > last_step {
                            emit(ProgressEvent::message(format!(
                                "{:.1} MB downloaded",
                                mb(job.bytes_written)
                            )));
                            last_step = step;
                        }
                    }
                }
            }
        }
    };

    let flushed = file.flush().await;
    drop(file);

    let outcome = if token.is_cancelled() {
        JobOutcome::Cancelled
    } else if let Err(e) = flushed {
        JobOutcome::Failed(JobError::io("Failed to flush output file", e))
    } else {
        match (job.expected_size, exit) {
            (Some(total), _) if job.bytes_written == total => JobOutcome::Success,
            (None, LoopExit::End) => JobOutcome::Success,
            (_, LoopExit::Failed(e)) => JobOutcome::Failed(e),
            (expected, _) => JobOutcome::Failed(JobError::Integrity {
                expected: expected.unwrap_or(0),
                actual: job.bytes_written,
            }),
        }
    };

    match &outcome {
        JobOutcome::Success => log::info!(
            "Downloaded {} bytes to {}",
            job.bytes_written,
            job.destination.display()
        ),
        JobOutcome::Cancelled => log::info!("Download cancelled by user"),
        JobOutcome::Failed(e) => log::error!(
            "Download failed after {} of {:?} bytes: {e}",
            job.bytes_written,
            job.expected_size
        ),
    }
    job.finish(outcome)
}

/// Resolves once `token` is set.
async fn cancelled(token: &CancellationToken) {
    while !token.is_cancelled() {
        tokio::time::sleep(CANCEL_POLL).await;
    }
}

/// Spawns download workers on a tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct AssetDownloader {
    settings: DownloadSettings,
}

impl AssetDownloader {
    pub fn new(settings: DownloadSettings) -> Self {
        Self { settings }
    }

    /// Begin streaming `address` into `destination`.
    ///
    /// Creates the destination's parent directory first; failure there is
    /// returned synchronously and no job exists. Otherwise every path ends in
    /// exactly one `Finished` report on `sender`.
    pub fn start<M>(
        &self,
        rt: &Handle,
        id: JobId,
        address: &str,
        destination: &Path,
        sender: BusSender<M>,
    ) -> Result<JobHandle, JobError>
    where
        M: From<JobReport> + Send + 'static,
    {
        if let Some(dir) = destination.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                JobError::io(format!("Failed to create model directory {}", dir.display()), e)
            })?;
        }

        let token = CancellationToken::new();
        let worker_token = token.clone();
        let settings = self.settings.clone();
        let mut job = DownloadJob::new(address, destination);
        let progress_sender = sender.clone();

        log::info!("{id}: downloading {address} to {}", destination.display());

        let join = rt.spawn(async move {
            let work = tokio::spawn(async move {
                let post = |event| progress_sender.post(M::from(JobReport { id, event }));
                post(JobEvent::Progress(ProgressEvent::new(
                    "Connecting to server...",
                    Some(0.0),
                )));
                let connected = tokio::select! {
                    biased;
                    _ = cancelled(&worker_token) => None,
                    result = HttpSource::connect(&job.address, &settings) => Some(result),
                };
                match connected {
                    Some(Ok(source)) => {
                        let mut emit = |p| post(JobEvent::Progress(p));
                        fetch_to_file(&mut job, source, &settings, &worker_token, &mut emit).await
                    }
                    Some(Err(e)) if !worker_token.is_cancelled() => {
                        log::error!("{id}: {e}");
                        job.finish(JobOutcome::Failed(e))
                    }
                    _ => {
                        log::info!("{id}: download cancelled while connecting");
                        job.finish(JobOutcome::Cancelled)
                    }
                }
            });

            let outcome = match work.await {
                Ok(outcome) => outcome,
                Err(e) => JobOutcome::Failed(JobError::Internal(format!(
                    "Download task panicked: {e}"
                ))),
            };
            sender.post(M::from(JobReport {
                id,
                event: JobEvent::Finished(outcome),
            }));
        });

        Ok(JobHandle::new(id, JobKind::Download, token, join))
    }
}
