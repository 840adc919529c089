use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::stems::Stem;

pub const MODEL_URL: &str = "https://huggingface.co/datasets/Retrobear/demucs.cpp/resolve/main/ggml-model-htdemucs-6s-f16.bin";
pub const MODEL_FILENAME: &str = "ggml-model-htdemucs-6s-f16.bin";
const APP_DIR: &str = "demucs-stems";
const MODELS_SUBDIR: &str = "demucs_models";

/// Download worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    /// Bytes requested per read.
    pub chunk_size: usize,
    /// Consecutive empty reads that end the job.
    pub max_empty_reads: u32,
    /// Sleep between empty reads.
    pub retry_backoff_ms: u64,
    /// A read that yields nothing for this long counts as an empty read.
    pub read_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            chunk_size: 8192,
            max_empty_reads: 3,
            retry_backoff_ms: 1000,
            read_timeout_secs: 30,
            connect_timeout_secs: 15,
        }
    }
}

impl DownloadSettings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model_url: String,
    /// Overrides the platform application-data root.
    pub data_dir: Option<PathBuf>,
    /// Stems to write, produced in fixed order.
    pub stems: Vec<Stem>,
    pub download: DownloadSettings,
    pub shutdown_timeout_secs: u64,
    /// External inference executable, see `separator::ProcessSeparator`.
    pub separator_command: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_url: MODEL_URL.into(),
            data_dir: None,
            stems: Stem::ALL.to_vec(),
            download: DownloadSettings::default(),
            shutdown_timeout_secs: 10,
            separator_command: "demucs-separate".into(),
        }
    }
}

impl Config {
    /// Directory: ~/.config/demucs-stems/
    fn dir() -> PathBuf {
        let mut p = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        p.push(APP_DIR);
        p
    }

    fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load from disk, returning defaults if file doesn't exist or is invalid.
    pub fn load() -> Self {
        let path = Self::path();
        match fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                log::warn!("Ignoring invalid config {}: {e}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Persist to disk.
    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        let dir = Self::dir();
        fs::create_dir_all(&dir)?;
        let data = serde_json::to_string_pretty(self)?;
        fs::write(Self::path(), data)?;
        Ok(())
    }

    /// Application-data root: ~/.local/share/ on Linux unless overridden.
    pub fn data_root(&self) -> PathBuf {
        self.data_dir
            .clone()
            .or_else(dirs::data_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Directory for model storage: <data>/demucs-stems/demucs_models/
    pub fn models_dir(&self) -> PathBuf {
        self.data_root().join(APP_DIR).join(MODELS_SUBDIR)
    }

    pub fn model_path(&self) -> PathBuf {
        self.models_dir().join(MODEL_FILENAME)
    }

    /// Where the download is staged until it verifies.
    pub fn partial_model_path(&self) -> PathBuf {
        self.models_dir().join(format!("{MODEL_FILENAME}.part"))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn input_basename(input: &Path) -> String {
    input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string())
}

/// `<input-dir>/<basename>_stems/`
pub fn stems_dir_for(input: &Path) -> PathBuf {
    let parent = input.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!("{}_stems", input_basename(input)))
}

/// `<output-dir>/<basename>_<stem>.wav`
pub fn stem_file_path(output_dir: &Path, input: &Path, stem: Stem) -> PathBuf {
    output_dir.join(format!("{}_{}.wav", input_basename(input), stem.as_str()))
}
