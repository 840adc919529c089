//! Boundary to the inference engine.
//!
//! The engine is opaque: it takes decoded audio and a progress callback, and
//! either returns one stereo track per stem or fails. The callback's return
//! value is the cancellation channel. An engine that sees
//! `ControlFlow::Break` must stop and return [`SeparationError::Cancelled`].

use std::fmt;
use std::io::{self, BufRead, BufReader};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Deserialize;

use crate::audio::{self, AudioBuffer};
use crate::error::JobError;
use crate::stems::Stem;

/// `(fraction in [0, 1], message) -> Continue | Break`
///
/// An empty message is a poll: the engine has nothing new to report and only
/// asks whether to keep going.
pub type ProgressFn<'a> = dyn FnMut(f32, &str) -> ControlFlow<()> + 'a;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeparationError {
    /// The progress callback asked to stop.
    Cancelled,
    Failed(String),
}

impl fmt::Display for SeparationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeparationError::Cancelled => write!(f, "separation cancelled"),
            SeparationError::Failed(msg) => write!(f, "separation failed: {msg}"),
        }
    }
}

impl std::error::Error for SeparationError {}

/// A single stem's stereo audio.
#[derive(Debug, Clone, PartialEq)]
pub struct StemTrack {
    pub stem: Stem,
    pub left: Vec<f32>,
    pub right: Vec<f32>,
}

/// Everything an engine produced for one input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Separation {
    pub tracks: Vec<StemTrack>,
}

impl Separation {
    pub fn track(&self, stem: Stem) -> Option<&StemTrack> {
        self.tracks.iter().find(|t| t.stem == stem)
    }
}

/// A loaded separation model.
pub trait Separator: Send + Sync {
    /// Stems this model can produce, in production order.
    fn stems(&self) -> &[Stem];

    fn separate(
        &self,
        input: &AudioBuffer,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Separation, SeparationError>;
}

impl fmt::Debug for dyn Separator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Separator")
            .field("stems", &self.stems())
            .finish()
    }
}

/// Turns the downloaded asset into a [`Separator`]. Runs off the UI thread.
pub trait ModelLoader: Send + Sync {
    fn load(&self, model: &Path) -> Result<Arc<dyn Separator>, JobError>;
}

/// One stdout line of the external engine.
#[derive(Debug, Deserialize)]
struct ProgressLine {
    progress: f32,
    #[serde(default)]
    message: String,
}

fn parse_progress(line: &str) -> Option<ProgressLine> {
    serde_json::from_str(line.trim()).ok()
}

/// How long the engine may stay silent before the callback is polled.
const ENGINE_POLL: Duration = Duration::from_millis(100);

/// Engine processes that have not been reaped yet.
static RUNNING: Mutex<Vec<Arc<Mutex<Child>>>> = Mutex::new(Vec::new());

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Kill every engine process still running. Meant for a forced exit, where
/// the workers driving them never get to clean up. Returns how many were
/// signalled.
pub fn kill_running_engines() -> usize {
    let running = std::mem::take(&mut *lock(&RUNNING));
    for child in &running {
        let mut child = lock(child);
        log::warn!("Killing engine process {}", child.id());
        let _ = child.kill();
        let _ = child.wait();
    }
    running.len()
}

/// A spawned engine process. Dropping it kills and reaps the process.
struct Engine {
    child: Arc<Mutex<Child>>,
}

impl Engine {
    fn spawn(command: &mut Command) -> io::Result<(Self, Option<ChildStdout>)> {
        let mut child = command.spawn()?;
        let stdout = child.stdout.take();
        let child = Arc::new(Mutex::new(child));
        lock(&RUNNING).push(child.clone());
        Ok((Self { child }, stdout))
    }

    fn try_wait(&self) -> io::Result<Option<ExitStatus>> {
        lock(&self.child).try_wait()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        lock(&RUNNING).retain(|c| !Arc::ptr_eq(c, &self.child));
        let mut child = lock(&self.child);
        if let Ok(None) = child.try_wait() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Forward stdout lines from the engine until it closes the pipe.
fn read_lines(stdout: ChildStdout) -> io::Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("engine-stdout".into())
        .spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

/// Runs an external inference executable:
///
/// `<command> <model> <input.wav> <workdir>`
///
/// The executable prints `{"progress": f, "message": s}` lines on stdout and
/// writes `<workdir>/<stem>.wav` for every stem before exiting with status 0.
#[derive(Debug, Clone)]
pub struct ProcessSeparator {
    command: PathBuf,
    model: PathBuf,
    stems: Vec<Stem>,
}

static SCRATCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

impl ProcessSeparator {
    pub fn new(command: impl Into<PathBuf>, model: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            model: model.into(),
            stems: Stem::ALL.to_vec(),
        }
    }

    fn scratch_dir() -> Result<PathBuf, SeparationError> {
        let n = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("demucs-stems-{}-{n}", std::process::id()));
        std::fs::create_dir_all(&dir).map_err(|e| {
            SeparationError::Failed(format!("Failed to create {}: {e}", dir.display()))
        })?;
        Ok(dir)
    }

    fn run_in(
        &self,
        workdir: &Path,
        input: &AudioBuffer,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Separation, SeparationError> {
        let input_path = workdir.join("input.wav");
        audio::write_float(&input_path, input)
            .map_err(|e| SeparationError::Failed(e.to_string()))?;

        let cmd = self.command.display().to_string();
        let mut command = Command::new(&self.command);
        command
            .arg(&self.model)
            .arg(&input_path)
            .arg(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let (engine, stdout) = Engine::spawn(&mut command)
            .map_err(|e| SeparationError::Failed(format!("Failed to spawn {cmd}: {e}")))?;
        let stdout =
            stdout.ok_or_else(|| SeparationError::Failed("inference stdout missing".into()))?;
        let lines = read_lines(stdout)
            .map_err(|e| SeparationError::Failed(format!("Failed to read {cmd} output: {e}")))?;

        let mut last = 0.0;
        let status = loop {
            let flow = match lines.recv_timeout(ENGINE_POLL) {
                Ok(line) => match parse_progress(&line) {
                    Some(update) => {
                        last = update.progress;
                        progress(update.progress, &update.message)
                    }
                    None => {
                        if !line.trim().is_empty() {
                            log::debug!("{cmd}: {line}");
                        }
                        continue;
                    }
                },
                Err(RecvTimeoutError::Timeout) => progress(last, ""),
                Err(RecvTimeoutError::Disconnected) => {
                    let exited = engine.try_wait().map_err(|e| {
                        SeparationError::Failed(format!("Failed to wait for {cmd}: {e}"))
                    })?;
                    if let Some(status) = exited {
                        break status;
                    }
                    // stdout closed but the process lives on
                    std::thread::sleep(ENGINE_POLL);
                    progress(last, "")
                }
            };
            if flow.is_break() {
                log::info!("Stopping {cmd} on cancellation");
                drop(engine);
                return Err(SeparationError::Cancelled);
            }
        };

        if !status.success() {
            return Err(SeparationError::Failed(format!("{cmd} exited with {status}")));
        }

        let mut tracks = Vec::with_capacity(self.stems.len());
        for &stem in &self.stems {
            let path = workdir.join(format!("{stem}.wav"));
            let mut decoded =
                audio::decode(&path).map_err(|e| SeparationError::Failed(e.to_string()))?;
            let right = match decoded.channels.len() {
                1 => decoded.channels[0].clone(),
                2 => decoded.channels.pop().unwrap_or_default(),
                n => {
                    return Err(SeparationError::Failed(format!(
                        "{stem} stem has {n} channels"
                    )))
                }
            };
            let left = decoded.channels.swap_remove(0);
            tracks.push(StemTrack { stem, left, right });
        }
        Ok(Separation { tracks })
    }
}

impl Separator for ProcessSeparator {
    fn stems(&self) -> &[Stem] {
        &self.stems
    }

    fn separate(
        &self,
        input: &AudioBuffer,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Separation, SeparationError> {
        let workdir = Self::scratch_dir()?;
        let result = self.run_in(&workdir, input, progress);
        if let Err(e) = std::fs::remove_dir_all(&workdir) {
            log::warn!("Failed to clean up {}: {e}", workdir.display());
        }
        result
    }
}

/// Checks the asset and wraps it in a [`ProcessSeparator`].
#[derive(Debug, Clone)]
pub struct ProcessModelLoader {
    command: PathBuf,
}

impl ProcessModelLoader {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl ModelLoader for ProcessModelLoader {
    fn load(&self, model: &Path) -> Result<Arc<dyn Separator>, JobError> {
        let meta = std::fs::metadata(model)
            .map_err(|e| JobError::io(format!("Failed to read model {}", model.display()), e))?;
        if meta.len() == 0 {
            return Err(JobError::Internal(format!(
                "Model file {} is empty",
                model.display()
            )));
        }
        log::info!(
            "Model ready: {} ({:.1} MB)",
            model.display(),
            meta.len() as f64 / (1024.0 * 1024.0)
        );
        Ok(Arc::new(ProcessSeparator::new(&self.command, model)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Engine tests share the process-wide registry.
    static ENGINE_TESTS: Mutex<()> = Mutex::new(());

    fn engine_script(dir: &Path, body: &str) -> PathBuf {
        let script = dir.join("engine.sh");
        std::fs::write(&script, body).unwrap();
        script
    }

    fn stereo(frames: usize) -> AudioBuffer {
        AudioBuffer {
            channels: vec![vec![0.1; frames], vec![-0.1; frames]],
            sample_rate: 44100,
        }
    }

    #[test]
    fn progress_lines_parse_and_junk_is_skipped() {
        let line = parse_progress(r#" {"progress": 0.25, "message": "chunk 1/4"} "#).unwrap();
        assert_eq!(line.progress, 0.25);
        assert_eq!(line.message, "chunk 1/4");
        assert_eq!(parse_progress(r#"{"progress": 1}"#).unwrap().message, "");
        assert!(parse_progress("loading weights...").is_none());
    }

    #[test]
    fn loader_rejects_missing_and_empty_models() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ProcessModelLoader::new("demucs-separate");
        assert!(matches!(
            loader.load(&dir.path().join("missing.bin")),
            Err(JobError::Io(_))
        ));

        let empty = dir.path().join("empty.bin");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(loader.load(&empty), Err(JobError::Internal(_))));

        let model = dir.path().join("model.bin");
        std::fs::write(&model, b"ggml").unwrap();
        let separator = loader.load(&model).unwrap();
        assert_eq!(separator.stems(), &Stem::ALL);
    }

    #[test]
    fn missing_executable_is_a_failure() {
        let sep = ProcessSeparator::new("/nonexistent/demucs-separate", "/tmp/model.bin");
        let err = sep
            .separate(&stereo(16), &mut |_, _| ControlFlow::Continue(()))
            .unwrap_err();
        assert!(matches!(err, SeparationError::Failed(_)));
    }

    #[cfg(unix)]
    #[test]
    fn break_from_callback_kills_the_engine() {
        let _serial = lock(&ENGINE_TESTS);
        let dir = tempfile::tempdir().unwrap();
        let script = engine_script(
            dir.path(),
            "echo '{\"progress\": 0.1, \"message\": \"warming up\"}'\nexec sleep 30\n",
        );

        // `sh <script> <input> <workdir>`: the script stands in for the model argument
        let sep = ProcessSeparator::new("sh", &script);
        let started = std::time::Instant::now();
        let mut seen = Vec::new();
        let err = sep
            .separate(&stereo(16), &mut |p, msg| {
                seen.push((p, msg.to_string()));
                ControlFlow::Break(())
            })
            .unwrap_err();
        assert_eq!(err, SeparationError::Cancelled);
        assert_eq!(seen, vec![(0.1, "warming up".to_string())]);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(lock(&RUNNING).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn silent_engine_is_stopped_by_a_poll() {
        let _serial = lock(&ENGINE_TESTS);
        let dir = tempfile::tempdir().unwrap();
        let script = engine_script(dir.path(), "exec sleep 30\n");

        let sep = ProcessSeparator::new("sh", &script);
        let started = std::time::Instant::now();
        let mut polls = 0;
        let err = sep
            .separate(&stereo(16), &mut |_, msg| {
                assert!(msg.is_empty());
                polls += 1;
                if started.elapsed() > Duration::from_millis(300) {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap_err();
        assert_eq!(err, SeparationError::Cancelled);
        assert!(polls >= 2);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(lock(&RUNNING).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn forced_kill_takes_down_a_running_engine() {
        let _serial = lock(&ENGINE_TESTS);
        let dir = tempfile::tempdir().unwrap();
        let script = engine_script(
            dir.path(),
            "echo '{\"progress\": 0.0, \"message\": \"started\"}'\nexec sleep 30\n",
        );

        let (started_tx, started_rx) = mpsc::channel();
        let worker = std::thread::spawn(move || {
            // never asks to stop, like a worker that missed its deadline
            ProcessSeparator::new("sh", &script).separate(&stereo(16), &mut |_, msg| {
                if !msg.is_empty() {
                    let _ = started_tx.send(());
                }
                ControlFlow::Continue(())
            })
        });
        started_rx.recv_timeout(Duration::from_secs(10)).unwrap();

        let killed_at = std::time::Instant::now();
        assert_eq!(kill_running_engines(), 1);
        let err = worker.join().unwrap().unwrap_err();
        assert!(matches!(err, SeparationError::Failed(msg) if msg.contains("exited")));
        assert!(killed_at.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_a_failure() {
        let _serial = lock(&ENGINE_TESTS);
        let dir = tempfile::tempdir().unwrap();
        let script = engine_script(dir.path(), "echo 'model file is corrupt' >&2\nexit 3\n");

        let sep = ProcessSeparator::new("sh", &script);
        let err = sep
            .separate(&stereo(16), &mut |_, _| ControlFlow::Continue(()))
            .unwrap_err();
        assert!(matches!(err, SeparationError::Failed(msg) if msg.contains("exit")));
    }

    #[cfg(unix)]
    #[test]
    fn reads_back_stems_written_by_the_engine() {
        let _serial = lock(&ENGINE_TESTS);
        let dir = tempfile::tempdir().unwrap();
        // copy the input into every stem slot
        let script = engine_script(
            dir.path(),
            "for s in drums bass other vocals guitar piano; do cp \"$1\" \"$2/$s.wav\"; done\n\
             echo '{\"progress\": 1.0, \"message\": \"done\"}'\n",
        );

        let sep = ProcessSeparator::new("sh", &script);
        let input = stereo(32);
        let out = sep
            .separate(&input, &mut |_, _| ControlFlow::Continue(()))
            .unwrap();
        assert_eq!(out.tracks.len(), 6);
        let vocals = out.track(Stem::Vocals).unwrap();
        assert_eq!(vocals.left, input.channels[0]);
        assert_eq!(vocals.right, input.channels[1]);
    }
}
