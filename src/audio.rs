use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::error::JobError;

pub const REQUIRED_SAMPLE_RATE: u32 = 44100;
pub const REQUIRED_CHANNELS: u16 = 2;

/// Header facts about an input file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub frames: u32,
}

impl AudioFormat {
    pub fn duration_secs(&self) -> f64 {
        self.frames as f64 / self.sample_rate.max(1) as f64
    }
}

/// Decoded audio, one `Vec` per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }
}

fn hound_error(path: &Path, err: hound::Error) -> JobError {
    match err {
        hound::Error::IoError(e) => JobError::io(format!("Failed to read {}", path.display()), e),
        other => JobError::Validation(format!(
            "Unsupported audio file {}: {other}",
            path.display()
        )),
    }
}

/// Read only the header.
pub fn probe(path: &Path) -> Result<AudioFormat, JobError> {
    let reader = WavReader::open(path).map_err(|e| hound_error(path, e))?;
    let spec = reader.spec();
    Ok(AudioFormat {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        frames: reader.duration(),
    })
}

/// Pre-flight check: the model only accepts 44.1 kHz stereo.
pub fn validate_input(path: &Path) -> Result<AudioFormat, JobError> {
    let format = probe(path)?;
    if format.sample_rate != REQUIRED_SAMPLE_RATE || format.channels != REQUIRED_CHANNELS {
        return Err(JobError::Validation(format!(
            "Expected {REQUIRED_SAMPLE_RATE} Hz stereo audio, got {} Hz with {} channel(s)",
            format.sample_rate, format.channels
        )));
    }
    Ok(format)
}

/// Decode the whole file into normalized `f32` channels.
///
/// Any failure here, including a malformed body after a valid header, is an
/// I/O error: the file already passed validation.
pub fn decode(path: &Path) -> Result<AudioBuffer, JobError> {
    let mut reader = WavReader::open(path)
        .map_err(|e| JobError::io(format!("Failed to open {}", path.display()), e))?;
    let spec = reader.spec();
    let n_channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, _) => reader.samples::<f32>().collect::<Result<_, _>>(),
        (SampleFormat::Int, bits) if bits <= 16 => {
            let scale = (1i32 << (bits - 1)) as f32;
            reader
                .samples::<i16>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
        }
        (SampleFormat::Int, bits) => {
            let scale = (1i64 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
        }
    }
    .map_err(|e| JobError::io(format!("Failed to decode {}", path.display()), e))?;

    let mut channels = vec![Vec::with_capacity(interleaved.len() / n_channels); n_channels];
    for frame in interleaved.chunks_exact(n_channels) {
        for (ch, &sample) in channels.iter_mut().zip(frame) {
            ch.push(sample);
        }
    }

    Ok(AudioBuffer {
        channels,
        sample_rate: spec.sample_rate,
    })
}

/// Write a stereo 16-bit PCM WAV file.
pub fn write_stereo_pcm16(
    path: &Path,
    left: &[f32],
    right: &[f32],
    sample_rate: u32,
) -> Result<(), JobError> {
    let spec = WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let io_err = |e: hound::Error| JobError::io(format!("Failed to write {}", path.display()), e);

    let mut writer = WavWriter::create(path, spec).map_err(io_err)?;
    for (&l, &r) in left.iter().zip(right) {
        writer.write_sample(to_i16(l)).map_err(io_err)?;
        writer.write_sample(to_i16(r)).map_err(io_err)?;
    }
    writer.finalize().map_err(io_err)?;
    Ok(())
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Write a 32-bit float WAV with the buffer's channel count.
pub fn write_float(path: &Path, audio: &AudioBuffer) -> Result<(), JobError> {
    let spec = WavSpec {
        channels: audio.channels.len() as u16,
        sample_rate: audio.sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let io_err = |e: hound::Error| JobError::io(format!("Failed to write {}", path.display()), e);

    let mut writer = WavWriter::create(path, spec).map_err(io_err)?;
    for i in 0..audio.frames() {
        for ch in &audio.channels {
            writer.write_sample(ch[i]).map_err(io_err)?;
        }
    }
    writer.finalize().map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pcm16(path: &Path, sample_rate: u32, channels: u16, frames: usize) {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut w = WavWriter::create(path, spec).unwrap();
        for i in 0..frames * channels as usize {
            w.write_sample(((i % 200) as i16 - 100) * 100).unwrap();
        }
        w.finalize().unwrap();
    }

    #[test]
    fn accepts_44k_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.wav");
        write_pcm16(&path, 44100, 2, 4410);
        let format = validate_input(&path).unwrap();
        assert_eq!(format.frames, 4410);
        assert!((format.duration_secs() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn rejects_wrong_rate_or_channels() {
        let dir = tempfile::tempdir().unwrap();
        for (name, rate, ch) in [("hi.wav", 48000, 2), ("mono.wav", 44100, 1), ("quad.wav", 44100, 4)] {
            let path = dir.path().join(name);
            write_pcm16(&path, rate, ch, 100);
            assert!(
                matches!(validate_input(&path), Err(JobError::Validation(_))),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn non_wav_is_validation_error_and_missing_is_io() {
        let dir = tempfile::tempdir().unwrap();
        let junk = dir.path().join("junk.wav");
        std::fs::write(&junk, b"definitely not RIFF").unwrap();
        assert!(matches!(validate_input(&junk), Err(JobError::Validation(_))));
        assert!(matches!(
            validate_input(&dir.path().join("missing.wav")),
            Err(JobError::Io(_))
        ));
    }

    #[test]
    fn decode_deinterleaves_and_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut w = WavWriter::create(&path, spec).unwrap();
        for (l, r) in [(16384i16, -16384i16), (0, 32767)] {
            w.write_sample(l).unwrap();
            w.write_sample(r).unwrap();
        }
        w.finalize().unwrap();

        let audio = decode(&path).unwrap();
        assert_eq!(audio.frames(), 2);
        assert_eq!(audio.channels[0], vec![0.5, 0.0]);
        assert_eq!(audio.channels[1][0], -0.5);
        assert!(audio.channels[1][1] > 0.999);
    }

    #[test]
    fn pcm16_writer_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        write_stereo_pcm16(&path, &[2.0, -2.0, 0.0], &[0.5, 0.0, -0.5], 44100).unwrap();

        let mut reader = WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!((spec.channels, spec.sample_rate, spec.bits_per_sample), (2, 44100, 16));
        let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(samples, vec![i16::MAX, 16383, -i16::MAX, 0, 0, -16383]);
    }

    #[test]
    fn float_round_trip_keeps_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.wav");
        let audio = AudioBuffer {
            channels: vec![vec![0.25, -0.75], vec![0.5, 1.0]],
            sample_rate: 44100,
        };
        write_float(&path, &audio).unwrap();
        assert_eq!(decode(&path).unwrap(), audio);
    }
}
