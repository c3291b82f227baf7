use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::audio::read_wav;
use crate::error::{DubError, DubResult};
use crate::utils::sha256_file;

/// Shortest reference sample accepted for voice cloning.
pub const MIN_REFERENCE_SECS: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceProfile {
    BuiltIn { id: String },
    Cloned(ClonedVoice),
}

/// A reference sample plus the fingerprint derived from it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClonedVoice {
    pub reference: PathBuf,
    pub fingerprint: String,
    pub duration_secs: f64,
    pub sample_rate: u32,
}

impl VoiceProfile {
    pub fn built_in(id: impl Into<String>) -> Self {
        VoiceProfile::BuiltIn { id: id.into() }
    }

    pub fn cloned(reference: &Path) -> DubResult<Self> {
        Ok(VoiceProfile::Cloned(ClonedVoice::from_reference(reference)?))
    }

    /// Stable key used when deriving job ids.
    pub fn cache_key(&self) -> String {
        match self {
            VoiceProfile::BuiltIn { id } => format!("builtin:{}", id),
            VoiceProfile::Cloned(voice) => format!("cloned:{}", voice.fingerprint),
        }
    }
}

impl ClonedVoice {
    pub fn from_reference(reference: &Path) -> DubResult<Self> {
        if !reference.is_file() {
            return Err(DubError::Configuration(format!(
                "voice reference {} does not exist",
                reference.display()
            )));
        }
        let audio = read_wav(reference)?;
        let duration_secs = audio.duration_seconds();
        if duration_secs < MIN_REFERENCE_SECS {
            return Err(DubError::Synthesis(format!(
                "voice reference {} is too short ({:.2}s, need {:.1}s)",
                reference.display(),
                duration_secs,
                MIN_REFERENCE_SECS
            )));
        }
        let fingerprint = sha256_file(reference).map_err(|e| {
            DubError::Synthesis(format!("cannot read {}: {}", reference.display(), e))
        })?;
        debug!(
            "Cloned voice reference {} ({:.2}s @ {} Hz)",
            reference.display(),
            duration_secs,
            audio.sample_rate
        );
        Ok(Self {
            reference: reference.to_path_buf(),
            fingerprint,
            duration_secs,
            sample_rate: audio.sample_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{PcmAudio, write_wav};

    fn write_sample(path: &Path, seconds: f64) {
        let mut audio = PcmAudio::empty(16_000, 1);
        audio.push_silence(seconds);
        write_wav(path, &audio).unwrap();
    }

    #[test]
    fn missing_reference_is_configuration_error() {
        let err = VoiceProfile::cloned(Path::new("/nope/voice.wav")).unwrap_err();
        assert!(matches!(err, DubError::Configuration(_)));
    }

    #[test]
    fn corrupt_or_short_reference_is_synthesis_error() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.wav");
        std::fs::write(&bad, b"RIFFjunk").unwrap();
        assert!(matches!(
            VoiceProfile::cloned(&bad),
            Err(DubError::Synthesis(_))
        ));

        let short = dir.path().join("short.wav");
        write_sample(&short, 0.2);
        assert!(matches!(
            VoiceProfile::cloned(&short),
            Err(DubError::Synthesis(_))
        ));
    }

    #[test]
    fn cloned_voice_key_follows_content() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        write_sample(&a, 2.0);
        write_sample(&b, 2.0);
        let va = VoiceProfile::cloned(&a).unwrap();
        let vb = VoiceProfile::cloned(&b).unwrap();
        assert_eq!(va.cache_key(), vb.cache_key());
        assert_ne!(va.cache_key(), VoiceProfile::built_in("default").cache_key());
    }
}
