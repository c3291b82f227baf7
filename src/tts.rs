use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::audio::{PcmAudio, read_wav, wav_duration_seconds, write_wav};
use crate::config::{CloneCommand, DubConfig, EngineKind};
use crate::error::{DubError, DubResult};
use crate::script::Script;
use crate::voice::VoiceProfile;

/// Amplitude below which a segment's opening samples count as silence.
const LEADING_SILENCE_THRESHOLD: i16 = 500;

/// A local text-to-speech backend. Implementations render one text segment
/// to a WAV file and know nothing about jobs or scripts.
pub trait SpeechEngine: Send + Sync {
    fn name(&self) -> &str;

    fn voices(&self) -> Vec<String>;

    fn supports_voice_cloning(&self) -> bool;

    /// Fails with `ModelUnavailable` when the engine cannot run.
    fn ensure_ready(&self) -> DubResult<()>;

    fn render_segment(&self, text: &str, voice: &VoiceProfile, out: &Path) -> DubResult<()>;
}

pub fn build_engine(config: &DubConfig) -> DubResult<Arc<dyn SpeechEngine>> {
    match config.engine {
        EngineKind::Piper => Ok(Arc::new(PiperEngine::new(
            config.piper_bin.clone(),
            config.voices_dir.clone(),
            config.voices.clone(),
            config.speed,
        ))),
        EngineKind::Command => {
            let command = config.clone_command.clone().ok_or_else(|| {
                DubError::Configuration("engine 'command' requires clone_command".into())
            })?;
            Ok(Arc::new(CommandEngine::new(command, config.speed)))
        }
    }
}

pub struct PiperEngine {
    bin: String,
    voices_dir: PathBuf,
    voices: BTreeMap<String, String>,
    speed: f64,
}

impl PiperEngine {
    pub fn new(
        bin: String,
        voices_dir: PathBuf,
        voices: BTreeMap<String, String>,
        speed: f64,
    ) -> Self {
        Self {
            bin,
            voices_dir,
            voices,
            speed,
        }
    }

    fn model_for(&self, id: &str) -> DubResult<PathBuf> {
        let file = self.voices.get(id).ok_or_else(|| {
            DubError::Synthesis(format!(
                "unknown voice '{}' (available: {})",
                id,
                self.voices().join(", ")
            ))
        })?;
        let model = self.voices_dir.join(file);
        if !model.is_file() {
            return Err(DubError::ModelUnavailable(format!(
                "piper model {} for voice '{}' is missing",
                model.display(),
                id
            )));
        }
        Ok(model)
    }
}

impl SpeechEngine for PiperEngine {
    fn name(&self) -> &str {
        "piper"
    }

    fn voices(&self) -> Vec<String> {
        self.voices.keys().cloned().collect()
    }

    fn supports_voice_cloning(&self) -> bool {
        false
    }

    fn ensure_ready(&self) -> DubResult<()> {
        which::which(&self.bin).map_err(|_| {
            DubError::ModelUnavailable(format!("piper binary '{}' not found in PATH", self.bin))
        })?;
        let installed = self
            .voices
            .values()
            .any(|file| self.voices_dir.join(file).is_file());
        if !installed {
            return Err(DubError::ModelUnavailable(format!(
                "no piper voice models found in {}",
                self.voices_dir.display()
            )));
        }
        Ok(())
    }

    fn render_segment(&self, text: &str, voice: &VoiceProfile, out: &Path) -> DubResult<()> {
        let id = match voice {
            VoiceProfile::BuiltIn { id } => id,
            VoiceProfile::Cloned(_) => {
                return Err(DubError::ModelUnavailable(
                    "piper does not support voice cloning".into(),
                ));
            }
        };
        let model = self.model_for(id)?;
        let length_scale = format!("{:.3}", 1.0 / self.speed);
        debug!("Calling piper for output file {}", out.display());

        let mut child = Command::new(&self.bin)
            .arg("--model")
            .arg(&model)
            .arg("--output_file")
            .arg(out)
            .args(["--length_scale", &length_scale])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| DubError::ModelUnavailable(format!("failed to spawn piper: {}", e)))?;

        {
            let stdin = child
                .stdin
                .as_mut()
                .ok_or_else(|| DubError::Synthesis("failed to open piper stdin".into()))?;
            stdin
                .write_all(text.as_bytes())
                .map_err(|e| DubError::Synthesis(format!("failed to feed piper: {}", e)))?;
        }

        let status = child
            .wait()
            .map_err(|e| DubError::Synthesis(format!("piper did not finish: {}", e)))?;
        if !status.success() {
            error!("Piper TTS command failed for chunk: {}", out.display());
            return Err(DubError::Synthesis(format!(
                "piper exited with {} for {}",
                status,
                out.display()
            )));
        }
        Ok(())
    }
}

/// Runs a configured voice-cloning program once per segment.
pub struct CommandEngine {
    command: CloneCommand,
    speed: f64,
}

impl CommandEngine {
    pub fn new(command: CloneCommand, speed: f64) -> Self {
        Self { command, speed }
    }

    fn expand_args(&self, text_file: &Path, out: &Path, voice: &VoiceProfile) -> Vec<String> {
        let (voice_id, reference) = match voice {
            VoiceProfile::BuiltIn { id } => (id.clone(), String::new()),
            VoiceProfile::Cloned(c) => (String::new(), c.reference.display().to_string()),
        };
        let speed = format!("{:.3}", self.speed);
        self.command
            .args
            .iter()
            .map(|arg| {
                arg.replace("{text_file}", &text_file.display().to_string())
                    .replace("{output}", &out.display().to_string())
                    .replace("{reference}", &reference)
                    .replace("{voice}", &voice_id)
                    .replace("{speed}", &speed)
            })
            .collect()
    }
}

impl SpeechEngine for CommandEngine {
    fn name(&self) -> &str {
        &self.command.program
    }

    fn voices(&self) -> Vec<String> {
        Vec::new()
    }

    fn supports_voice_cloning(&self) -> bool {
        true
    }

    fn ensure_ready(&self) -> DubResult<()> {
        which::which(&self.command.program).map_err(|_| {
            DubError::ModelUnavailable(format!(
                "voice command '{}' not found",
                self.command.program
            ))
        })?;
        if let Some(model) = &self.command.model {
            if !model.exists() {
                return Err(DubError::ModelUnavailable(format!(
                    "voice model {} is missing",
                    model.display()
                )));
            }
        }
        Ok(())
    }

    fn render_segment(&self, text: &str, voice: &VoiceProfile, out: &Path) -> DubResult<()> {
        let text_file = out.with_extension("txt");
        fs::write(&text_file, text)
            .map_err(|e| DubError::Synthesis(format!("cannot write segment text: {}", e)))?;
        let args = self.expand_args(&text_file, out, voice);
        debug!("Running {} {:?}", self.command.program, args);

        let status = Command::new(&self.command.program)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| {
                DubError::ModelUnavailable(format!(
                    "failed to run {}: {}",
                    self.command.program, e
                ))
            })?;
        if !status.success() {
            return Err(DubError::Synthesis(format!(
                "{} exited with {}",
                self.command.program, status
            )));
        }
        if !out.is_file() {
            return Err(DubError::Synthesis(format!(
                "{} produced no audio at {}",
                self.command.program,
                out.display()
            )));
        }
        Ok(())
    }
}

/// Where one script segment landed inside the combined speech track.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentTiming {
    pub text: String,
    pub start: f64,
    pub end: f64,
    /// Silence at the head of the segment before the voice starts.
    pub lead_in: f64,
}

#[derive(Debug, Clone)]
pub struct SpeechTrack {
    pub path: PathBuf,
    pub duration_secs: f64,
    pub segments: Vec<SegmentTiming>,
}

pub struct Synthesizer {
    engine: Arc<dyn SpeechEngine>,
    segment_gap_secs: f64,
    end_silence_secs: f64,
}

impl Synthesizer {
    pub fn new(engine: Arc<dyn SpeechEngine>, segment_gap_secs: f64, end_silence_secs: f64) -> Self {
        Self {
            engine,
            segment_gap_secs,
            end_silence_secs,
        }
    }

    /// Renders every segment into `work_dir` and joins them in script order
    /// with a fixed gap. The joined track is written to `work_dir/speech.wav`.
    pub fn synthesize(
        &self,
        script: &Script,
        voice: &VoiceProfile,
        work_dir: &Path,
    ) -> DubResult<SpeechTrack> {
        let texts: Vec<&str> = script.speakable().collect();
        if texts.is_empty() {
            return Err(DubError::Synthesis("script has no speakable text".into()));
        }
        if matches!(voice, VoiceProfile::Cloned(_)) && !self.engine.supports_voice_cloning() {
            return Err(DubError::ModelUnavailable(format!(
                "engine {} cannot clone voices",
                self.engine.name()
            )));
        }
        self.engine.ensure_ready()?;

        let mut track: Option<PcmAudio> = None;
        let mut segments = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            let part = work_dir.join(format!("part_{:03}.wav", i));
            info!(
                "Generating TTS chunk {}/{} ({} chars)",
                i + 1,
                texts.len(),
                text.len()
            );
            self.engine.render_segment(text, voice, &part)?;
            let pcm = read_wav(&part)?;
            if pcm.frames() == 0 {
                warn!("Engine returned empty audio for chunk {}", i);
            }

            if let Some(t) = track.as_mut() {
                t.push_silence(self.segment_gap_secs);
            }
            let joined =
                track.get_or_insert_with(|| PcmAudio::empty(pcm.sample_rate, pcm.channels));
            let start = joined.duration_seconds();
            joined.append(&pcm)?;
            segments.push(SegmentTiming {
                text: text.to_string(),
                start,
                end: joined.duration_seconds(),
                lead_in: pcm.leading_silence_seconds(LEADING_SILENCE_THRESHOLD),
            });
        }

        let mut audio = track.ok_or_else(|| DubError::Synthesis("no audio produced".into()))?;
        if segments.iter().all(|s| s.end <= s.start) {
            return Err(DubError::Synthesis(
                "engine produced zero-length speech".into(),
            ));
        }
        audio.push_silence(self.end_silence_secs);

        let path = work_dir.join("speech.wav");
        write_wav(&path, &audio)?;
        let duration_secs = wav_duration_seconds(&path)?;
        info!(
            "Speech track {:.2}s from {} segments",
            duration_secs,
            segments.len()
        );
        Ok(SpeechTrack {
            path,
            duration_secs,
            segments,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Writes a tone whose length scales with the text, no model required.
    pub struct FakeEngine {
        pub seconds_per_char: f64,
        pub sample_rate: u32,
        pub cloning: bool,
        pub ready: bool,
        pub calls: Mutex<Vec<String>>,
        /// Runs before each segment is rendered.
        pub on_render: Option<Box<dyn Fn() + Send + Sync>>,
    }

    impl FakeEngine {
        pub fn new() -> Self {
            Self {
                seconds_per_char: 0.06,
                sample_rate: 16_000,
                cloning: true,
                ready: true,
                calls: Mutex::new(Vec::new()),
                on_render: None,
            }
        }
    }

    impl SpeechEngine for FakeEngine {
        fn name(&self) -> &str {
            "fake"
        }

        fn voices(&self) -> Vec<String> {
            vec!["default".to_string()]
        }

        fn supports_voice_cloning(&self) -> bool {
            self.cloning
        }

        fn ensure_ready(&self) -> DubResult<()> {
            if self.ready {
                Ok(())
            } else {
                Err(DubError::ModelUnavailable("fake model not loaded".into()))
            }
        }

        fn render_segment(&self, text: &str, voice: &VoiceProfile, out: &Path) -> DubResult<()> {
            if let VoiceProfile::BuiltIn { id } = voice {
                if id != "default" {
                    return Err(DubError::Synthesis(format!("unknown voice '{}'", id)));
                }
            }
            if let Some(hook) = &self.on_render {
                hook();
            }
            self.calls.lock().unwrap().push(text.to_string());
            let seconds = text.chars().count() as f64 * self.seconds_per_char;
            let frames = (seconds * self.sample_rate as f64) as usize;
            let audio = PcmAudio {
                samples: (0..frames).map(|i| ((i % 40) as i16 - 20) * 300).collect(),
                sample_rate: self.sample_rate,
                channels: 1,
            };
            write_wav(out, &audio)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeEngine;
    use super::*;

    fn synthesizer(engine: FakeEngine) -> Synthesizer {
        Synthesizer::new(Arc::new(engine), 0.3, 0.5)
    }

    #[test]
    fn segments_join_in_order_with_gap() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let synth = Synthesizer::new(engine.clone(), 0.3, 0.5);
        let script = Script::from_segments(["Hello world.", "", "Second line here."]);
        let track = synth
            .synthesize(&script, &VoiceProfile::built_in("default"), dir.path())
            .unwrap();

        assert_eq!(
            *engine.calls.lock().unwrap(),
            vec!["Hello world.", "Second line here."]
        );
        assert_eq!(track.segments.len(), 2);
        let first = &track.segments[0];
        let second = &track.segments[1];
        assert_eq!(first.start, 0.0);
        assert!((second.start - first.end - 0.3).abs() < 1e-3);
        let expected = 12.0 * 0.06 + 0.3 + 17.0 * 0.06 + 0.5;
        assert!((track.duration_secs - expected).abs() < 1e-3);
        assert!(track.path.is_file());
    }

    #[test]
    fn non_empty_text_gives_positive_duration() {
        let dir = tempfile::tempdir().unwrap();
        let synth = synthesizer(FakeEngine::new());
        for text in ["Hi.", "A", "Some longer narration, with a comma."] {
            let track = synth
                .synthesize(
                    &Script::from_segments([text]),
                    &VoiceProfile::built_in("default"),
                    dir.path(),
                )
                .unwrap();
            assert!(track.duration_secs > 0.0);
        }
    }

    #[test]
    fn empty_script_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let synth = synthesizer(FakeEngine::new());
        let err = synth
            .synthesize(
                &Script::from_segments(["  "]),
                &VoiceProfile::built_in("default"),
                dir.path(),
            )
            .unwrap_err();
        assert!(matches!(err, DubError::Synthesis(_)));
    }

    #[test]
    fn engine_errors_surface_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = FakeEngine::new();
        engine.ready = false;
        let err = synthesizer(engine)
            .synthesize(
                &Script::from_segments(["Hello."]),
                &VoiceProfile::built_in("default"),
                dir.path(),
            )
            .unwrap_err();
        assert!(matches!(err, DubError::ModelUnavailable(_)));

        let err = synthesizer(FakeEngine::new())
            .synthesize(
                &Script::from_segments(["Hello."]),
                &VoiceProfile::built_in("ghost"),
                dir.path(),
            )
            .unwrap_err();
        assert!(matches!(err, DubError::Synthesis(_)));
    }

    #[test]
    fn cloning_requires_engine_support() {
        let dir = tempfile::tempdir().unwrap();
        let reference = dir.path().join("ref.wav");
        let mut sample = PcmAudio::empty(16_000, 1);
        sample.push_silence(2.0);
        write_wav(&reference, &sample).unwrap();
        let voice = VoiceProfile::cloned(&reference).unwrap();

        let mut engine = FakeEngine::new();
        engine.cloning = false;
        let err = synthesizer(engine)
            .synthesize(&Script::from_segments(["Hello."]), &voice, dir.path())
            .unwrap_err();
        assert!(matches!(err, DubError::ModelUnavailable(_)));
    }

    #[test]
    fn piper_rejects_unknown_voice_and_missing_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut voices = BTreeMap::new();
        voices.insert("default".to_string(), "missing.onnx".to_string());
        let piper = PiperEngine::new("piper".into(), dir.path().to_path_buf(), voices, 1.0);

        assert!(matches!(piper.model_for("ghost"), Err(DubError::Synthesis(_))));
        assert!(matches!(
            piper.model_for("default"),
            Err(DubError::ModelUnavailable(_))
        ));
        assert!(!piper.supports_voice_cloning());
    }

    #[test]
    fn command_engine_expands_placeholders() {
        let engine = CommandEngine::new(
            CloneCommand {
                program: "clone-tts".into(),
                args: vec![
                    "--text".into(),
                    "{text_file}".into(),
                    "--ref={reference}".into(),
                    "-o".into(),
                    "{output}".into(),
                    "--speed".into(),
                    "{speed}".into(),
                ],
                model: None,
            },
            1.05,
        );
        let voice = VoiceProfile::Cloned(crate::voice::ClonedVoice {
            reference: PathBuf::from("/voices/me.wav"),
            fingerprint: "abc".into(),
            duration_secs: 3.0,
            sample_rate: 22_050,
        });
        let args = engine.expand_args(Path::new("/tmp/p.txt"), Path::new("/tmp/p.wav"), &voice);
        assert_eq!(
            args,
            vec![
                "--text",
                "/tmp/p.txt",
                "--ref=/voices/me.wav",
                "-o",
                "/tmp/p.wav",
                "--speed",
                "1.050"
            ]
        );
    }
}
