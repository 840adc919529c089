#![allow(dead_code)]

use std::io::{Read as _, Write as _};
use std::net::TcpListener;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use demucs_stems::audio::AudioBuffer;
use demucs_stems::bus::{self, UiBus};
use demucs_stems::config::{Config, DownloadSettings};
use demucs_stems::separator::{
    ModelLoader, ProgressFn, Separation, SeparationError, Separator, StemTrack,
};
use demucs_stems::{AppState, BackendEvent, JobError, Notice, Stem};
use hound::{SampleFormat, WavSpec, WavWriter};

/// Separator that ticks through `ticks` progress calls, `delay` apart.
pub struct FakeSeparator {
    pub ticks: usize,
    pub delay: Duration,
    /// Keep running after the callback asks to stop.
    pub ignore_cancel: bool,
}

impl FakeSeparator {
    pub fn quick() -> Self {
        Self {
            ticks: 3,
            delay: Duration::ZERO,
            ignore_cancel: false,
        }
    }

    pub fn slow() -> Self {
        Self {
            ticks: 200,
            delay: Duration::from_millis(20),
            ignore_cancel: false,
        }
    }
}

impl Separator for FakeSeparator {
    fn stems(&self) -> &[Stem] {
        &Stem::ALL
    }

    fn separate(
        &self,
        input: &AudioBuffer,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Separation, SeparationError> {
        for i in 1..=self.ticks {
            std::thread::sleep(self.delay);
            let p = i as f32 / self.ticks as f32;
            if progress(p, &format!("Inference {i}/{}", self.ticks)).is_break()
                && !self.ignore_cancel
            {
                return Err(SeparationError::Cancelled);
            }
        }
        let tracks = Stem::ALL
            .into_iter()
            .map(|stem| StemTrack {
                stem,
                left: input.channels[0].clone(),
                right: input.channels[1].clone(),
            })
            .collect();
        Ok(Separation { tracks })
    }
}

/// Loader that hands out a fixed separator, or fails.
pub struct FakeLoader {
    pub separator: Option<Arc<dyn Separator>>,
    pub loads: AtomicUsize,
}

impl FakeLoader {
    pub fn with(separator: impl Separator + 'static) -> Arc<Self> {
        Arc::new(Self {
            separator: Some(Arc::new(separator)),
            loads: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            separator: None,
            loads: AtomicUsize::new(0),
        })
    }
}

impl ModelLoader for FakeLoader {
    fn load(&self, model: &Path) -> Result<Arc<dyn Separator>, JobError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !model.is_file() {
            return Err(JobError::Io(format!("{} missing", model.display())));
        }
        self.separator
            .clone()
            .ok_or_else(|| JobError::Internal("corrupt model".into()))
    }
}

pub fn test_config(data_dir: &Path) -> Config {
    Config {
        data_dir: Some(data_dir.to_path_buf()),
        model_url: "http://127.0.0.1:9/ggml-model.bin".into(),
        download: DownloadSettings {
            retry_backoff_ms: 5,
            read_timeout_secs: 2,
            connect_timeout_secs: 2,
            ..DownloadSettings::default()
        },
        shutdown_timeout_secs: 5,
        ..Config::default()
    }
}

pub fn install_model(config: &Config) {
    std::fs::create_dir_all(config.models_dir()).unwrap();
    std::fs::write(config.model_path(), b"ggml model bytes").unwrap();
}

pub fn controller(
    config: Config,
    loader: Arc<dyn ModelLoader>,
) -> (AppState, UiBus<BackendEvent>) {
    let (tx, bus) = bus::channel();
    let state = AppState::with_loader(config, tx, loader).unwrap();
    (state, bus)
}

/// Feed bus events into the controller until `done` holds.
pub fn pump_until(
    state: &mut AppState,
    bus: &UiBus<BackendEvent>,
    mut done: impl FnMut(&AppState) -> bool,
) -> Vec<Notice> {
    let deadline = Instant::now() + Duration::from_secs(15);
    let mut notices = Vec::new();
    while !done(state) {
        assert!(
            Instant::now() < deadline,
            "timed out waiting, state is {:?}",
            state.status()
        );
        match bus.try_next() {
            Some(event) => notices.extend(state.handle_event(event)),
            None => std::thread::sleep(Duration::from_millis(2)),
        }
    }
    notices
}

pub fn write_wav(dir: &Path, name: &str, sample_rate: u32, channels: u16) -> PathBuf {
    let path = dir.join(name);
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut w = WavWriter::create(&path, spec).unwrap();
    for i in 0..4410 * channels as usize {
        w.write_sample(((i % 100) as i16 - 50) * 200).unwrap();
    }
    w.finalize().unwrap();
    path
}

/// One-shot HTTP server: answers the first request with `body`, advertising
/// `content_length` bytes.
pub fn serve_once(body: Vec<u8>, content_length: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut request = [0u8; 4096];
            let _ = stream.read(&mut request);
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {content_length}\r\nConnection: close\r\n\r\n"
            );
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(&body);
            let _ = stream.flush();
        }
    });
    format!("http://{addr}/ggml-model.bin")
}

/// HTTP server that accepts one request and never answers. The connection
/// is held until the returned sender is dropped.
pub fn serve_stalled() -> (String, std::sync::mpsc::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (release, held) = std::sync::mpsc::channel::<()>();
    std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut request = [0u8; 4096];
            let _ = stream.read(&mut request);
            let _ = held.recv_timeout(Duration::from_secs(30));
        }
    });
    (format!("http://{addr}/ggml-model.bin"), release)
}
