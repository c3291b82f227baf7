use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{DubError, DubResult};

pub const DEFAULT_CONFIG_PATH: &str = "./config/dub.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Piper,
    Command,
}

/// How a single background clip is picked when several are long enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionOrder {
    /// Shortest clip that still covers the minimum duration.
    TightestFit,
    /// Longest clip available.
    LongestFirst,
}

/// External voice-cloning program. `args` may contain the placeholders
/// `{text_file}`, `{output}`, `{reference}` and `{speed}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneCommand {
    pub program: String,
    pub args: Vec<String>,
    /// File the program needs loaded before it can run (checked at startup).
    #[serde(default)]
    pub model: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub seconds: f64,
    pub height: u32,
    pub fps: u32,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            seconds: 3.0,
            height: 640,
            fps: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtitleStyle {
    pub enabled: bool,
    pub font_name: String,
    pub font_size: u32,
    pub outline: u32,
    pub shadow: u32,
    pub margin_v: u32,
}

impl Default for SubtitleStyle {
    fn default() -> Self {
        Self {
            enabled: true,
            font_name: "Inter".to_string(),
            font_size: 16,
            outline: 2,
            shadow: 1,
            margin_v: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DubConfig {
    pub library_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    /// Job scratch directories are created here, one per job.
    pub temp_root: PathBuf,

    pub engine: EngineKind,
    pub piper_bin: String,
    pub voices_dir: PathBuf,
    /// Built-in voice name -> model file inside `voices_dir`.
    pub voices: BTreeMap<String, String>,
    pub clone_command: Option<CloneCommand>,

    pub segment_gap_secs: f64,
    pub end_silence_secs: f64,
    pub speed: f64,
    pub chunk_chars: usize,

    pub selection_order: SelectionOrder,
    pub allow_loop: bool,
    pub tolerance_secs: f64,

    /// Volume of the original game audio under the narration. 0 drops it.
    pub background_volume: f64,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub preview: PreviewConfig,
    pub subtitles: SubtitleStyle,

    pub reuse_artifacts: bool,
    pub parallel_stages: bool,
}

impl Default for DubConfig {
    fn default() -> Self {
        let mut voices = BTreeMap::new();
        voices.insert("default".to_string(), "en_US-hfc_male-medium.onnx".to_string());
        voices.insert("Amy".to_string(), "en_US-amy-medium.onnx".to_string());

        Self {
            library_dir: PathBuf::from("videos"),
            artifacts_dir: PathBuf::from("outputs"),
            temp_root: PathBuf::from("rs_tmp"),
            engine: EngineKind::Piper,
            piper_bin: "piper".to_string(),
            voices_dir: PathBuf::from("./tts"),
            voices,
            clone_command: None,
            segment_gap_secs: 0.3,
            end_silence_secs: 0.5,
            speed: 1.05,
            chunk_chars: 250,
            selection_order: SelectionOrder::TightestFit,
            allow_loop: true,
            tolerance_secs: 0.1,
            background_volume: 0.0,
            width: 1080,
            height: 1920,
            fps: 60,
            preview: PreviewConfig::default(),
            subtitles: SubtitleStyle::default(),
            reuse_artifacts: true,
            parallel_stages: true,
        }
    }
}

impl DubConfig {
    /// Loads the config from `path`, or from the default location when it
    /// exists. Missing fields fall back to their defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                if !default.exists() {
                    debug!("No config at {}; using defaults", DEFAULT_CONFIG_PATH);
                    return Ok(Self::default());
                }
                default
            }
        };
        let data = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: DubConfig = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> DubResult<()> {
        let non_negative = [
            ("segment_gap_secs", self.segment_gap_secs),
            ("end_silence_secs", self.end_silence_secs),
            ("background_volume", self.background_volume),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(DubError::Configuration(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        if !(self.speed.is_finite() && self.speed > 0.0) {
            return Err(DubError::Configuration(format!(
                "speed must be positive, got {}",
                self.speed
            )));
        }
        if !(self.tolerance_secs.is_finite() && self.tolerance_secs > 0.0) {
            return Err(DubError::Configuration(format!(
                "tolerance_secs must be positive, got {}",
                self.tolerance_secs
            )));
        }
        if self.chunk_chars == 0 {
            return Err(DubError::Configuration("chunk_chars must be > 0".into()));
        }
        if self.width == 0 || self.height == 0 || self.fps == 0 {
            return Err(DubError::Configuration(
                "output canvas width, height and fps must be > 0".into(),
            ));
        }
        if !(self.preview.seconds.is_finite() && self.preview.seconds > 0.0) {
            return Err(DubError::Configuration(
                "preview.seconds must be positive".into(),
            ));
        }
        if self.engine == EngineKind::Command && self.clone_command.is_none() {
            return Err(DubError::Configuration(
                "engine 'command' requires a clone_command section".into(),
            ));
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn videos_json(&self) -> PathBuf {
        self.library_dir.join("videos.json")
    }

    pub fn usage_json(&self) -> PathBuf {
        self.library_dir.join("usage.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        DubConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: DubConfig =
            serde_json::from_str(r#"{ "allow_loop": false, "preview": { "seconds": 5.0 } }"#)
                .unwrap();
        assert!(!config.allow_loop);
        assert_eq!(config.preview.seconds, 5.0);
        assert_eq!(config.preview.height, 640);
        assert_eq!(config.segment_gap_secs, 0.3);
        assert_eq!(config.selection_order, SelectionOrder::TightestFit);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = DubConfig::default();
        config.tolerance_secs = 0.0;
        assert!(matches!(config.validate(), Err(DubError::Configuration(_))));

        let mut config = DubConfig::default();
        config.engine = EngineKind::Command;
        assert!(matches!(config.validate(), Err(DubError::Configuration(_))));
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dub.json");
        fs::write(&path, r#"{ "library_dir": "lib", "fps": 30 }"#).unwrap();
        let config = DubConfig::load(Some(&path)).unwrap();
        assert_eq!(config.library_dir, PathBuf::from("lib"));
        assert_eq!(config.fps, 30);
        assert_eq!(config.videos_json(), PathBuf::from("lib/videos.json"));
    }
}
