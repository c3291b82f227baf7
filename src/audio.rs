use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

use crate::error::{DubError, DubResult};

/// Interleaved 16-bit PCM held in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmAudio {
    pub fn empty(sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
            channels,
        }
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn push_silence(&mut self, seconds: f64) {
        let frames = (seconds.max(0.0) * self.sample_rate as f64).round() as usize;
        let len = self.samples.len() + frames * self.channels as usize;
        self.samples.resize(len, 0);
    }

    pub fn append(&mut self, other: &PcmAudio) -> DubResult<()> {
        if other.sample_rate != self.sample_rate || other.channels != self.channels {
            return Err(DubError::Synthesis(format!(
                "cannot join {} Hz/{} ch audio onto {} Hz/{} ch track",
                other.sample_rate, other.channels, self.sample_rate, self.channels
            )));
        }
        self.samples.extend_from_slice(&other.samples);
        Ok(())
    }

    /// Seconds before the first sample whose magnitude exceeds `threshold`.
    pub fn leading_silence_seconds(&self, threshold: i16) -> f64 {
        let channels = self.channels.max(1) as usize;
        let first_loud = self
            .samples
            .iter()
            .position(|s| s.unsigned_abs() > threshold.unsigned_abs());
        match first_loud {
            Some(idx) => (idx / channels) as f64 / self.sample_rate.max(1) as f64,
            None => self.duration_seconds(),
        }
    }
}

pub fn wav_duration_seconds(path: &Path) -> DubResult<f64> {
    let reader = WavReader::open(path)
        .map_err(|e| DubError::Synthesis(format!("cannot open {}: {}", path.display(), e)))?;
    let spec = reader.spec();
    let samples = reader.len();
    let frames = samples as f64 / spec.channels as f64;
    Ok(frames / spec.sample_rate as f64)
}

/// Reads any PCM/float WAV and converts it to 16-bit samples.
pub fn read_wav(path: &Path) -> DubResult<PcmAudio> {
    let corrupt = |e: hound::Error| {
        DubError::Synthesis(format!("cannot decode {}: {}", path.display(), e))
    };
    let mut reader = WavReader::open(path).map_err(corrupt)?;
    let spec = reader.spec();
    let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, _) => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
            .collect::<Result<_, _>>()
            .map_err(corrupt)?,
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .collect::<Result<_, _>>()
            .map_err(corrupt)?,
        (SampleFormat::Int, bits) => {
            let shift = bits.saturating_sub(16) as u32;
            reader
                .samples::<i32>()
                .map(|s| {
                    s.map(|v| {
                        if bits > 16 {
                            (v >> shift) as i16
                        } else {
                            (v << (16 - bits)) as i16
                        }
                    })
                })
                .collect::<Result<_, _>>()
                .map_err(corrupt)?
        }
    };
    Ok(PcmAudio {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

pub fn write_wav(path: &Path, audio: &PcmAudio) -> DubResult<()> {
    let spec = WavSpec {
        channels: audio.channels,
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let failed = |e: hound::Error| {
        DubError::Synthesis(format!("cannot write {}: {}", path.display(), e))
    };
    let mut writer = WavWriter::create(path, spec).map_err(failed)?;
    for &sample in &audio.samples {
        writer.write_sample(sample).map_err(failed)?;
    }
    writer.finalize().map_err(failed)?;
    Ok(())
}
