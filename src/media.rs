use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, error};

use crate::config::SubtitleStyle;
use crate::error::{DubError, DubResult};
use crate::reconcile::ClipSegment;

/// Durations of the first audio and video stream of a container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamDurations {
    pub video: Option<f64>,
    pub audio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreviewSpec {
    pub seconds: f64,
    pub height: u32,
    pub fps: u32,
    pub keep_audio: bool,
}

/// Everything needed to encode one dub.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub timeline: Vec<ClipSegment>,
    pub speech: PathBuf,
    pub duration: f64,
    pub subtitles: Option<PathBuf>,
    pub style: SubtitleStyle,
    /// Mix the clips' own audio under the speech at this volume; 0 drops it.
    pub background_volume: f64,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub output: PathBuf,
}

/// Video encode/decode capability. Every failure is an `Encoding` error.
pub trait MediaToolkit: Send + Sync {
    fn probe_duration(&self, path: &Path) -> DubResult<f64>;

    fn probe_streams(&self, path: &Path) -> DubResult<StreamDurations>;

    fn has_audio(&self, path: &Path) -> DubResult<bool>;

    fn render(&self, job: &RenderJob) -> DubResult<()>;

    fn extract_preview(&self, input: &Path, output: &Path, spec: &PreviewSpec) -> DubResult<()>;
}

pub struct Ffmpeg {
    ffmpeg: String,
    ffprobe: String,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

impl Ffmpeg {
    pub fn binaries(&self) -> [&str; 2] {
        [self.ffmpeg.as_str(), self.ffprobe.as_str()]
    }

    fn probe_json(&self, path: &Path, extra: &[&str]) -> DubResult<ProbeOutput> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error"])
            .args(extra)
            .args(["-of", "json"])
            .arg(path)
            .output()
            .map_err(|e| DubError::Encoding(format!("failed to run ffprobe: {}", e)))?;
        if !output.status.success() {
            return Err(DubError::Encoding(format!(
                "ffprobe failed for {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        serde_json::from_slice(&output.stdout).map_err(|e| {
            DubError::Encoding(format!("unreadable ffprobe output for {}: {}", path.display(), e))
        })
    }

    fn run(&self, args: &[String], what: &str) -> DubResult<()> {
        debug!("{} {}", self.ffmpeg, args.join(" "));
        let output = Command::new(&self.ffmpeg)
            .args(args)
            .output()
            .map_err(|e| DubError::Encoding(format!("failed to run ffmpeg: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            error!("ffmpeg failed to {}", what);
            return Err(DubError::Encoding(format!(
                "ffmpeg failed to {} ({}): {}",
                what,
                output.status,
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            )));
        }
        Ok(())
    }
}

fn parse_seconds(value: Option<&String>) -> Option<f64> {
    value.and_then(|v| v.trim().parse::<f64>().ok())
}

impl MediaToolkit for Ffmpeg {
    fn probe_duration(&self, path: &Path) -> DubResult<f64> {
        let probe = self.probe_json(path, &["-show_entries", "format=duration"])?;
        probe
            .format
            .as_ref()
            .and_then(|f| parse_seconds(f.duration.as_ref()))
            .ok_or_else(|| {
                DubError::Encoding(format!("ffprobe reported no duration for {}", path.display()))
            })
    }

    fn probe_streams(&self, path: &Path) -> DubResult<StreamDurations> {
        let probe = self.probe_json(
            path,
            &[
                "-show_entries",
                "stream=codec_type,duration:format=duration",
            ],
        )?;
        let container = probe
            .format
            .as_ref()
            .and_then(|f| parse_seconds(f.duration.as_ref()));
        let first = |kind: &str| {
            probe
                .streams
                .iter()
                .find(|s| s.codec_type.as_deref() == Some(kind))
                .map(|s| parse_seconds(s.duration.as_ref()).or(container).unwrap_or(0.0))
        };
        Ok(StreamDurations {
            video: first("video"),
            audio: first("audio"),
        })
    }

    fn has_audio(&self, path: &Path) -> DubResult<bool> {
        let probe = self.probe_json(
            path,
            &["-select_streams", "a", "-show_entries", "stream=index"],
        )?;
        Ok(!probe.streams.is_empty())
    }

    fn render(&self, job: &RenderJob) -> DubResult<()> {
        self.run(&render_args(job), "render the dub")
    }

    fn extract_preview(&self, input: &Path, output: &Path, spec: &PreviewSpec) -> DubResult<()> {
        self.run(&preview_args(input, output, spec), "cut the preview")
    }
}

fn secs(value: f64) -> String {
    format!("{:.3}", value)
}

/// Escapes a path for use as a filter option value.
fn filter_path(path: &Path) -> String {
    path.display()
        .to_string()
        .replace('\\', "/")
        .replace(':', "\\:")
        .replace('\'', "\\'")
}

fn force_style(style: &SubtitleStyle) -> String {
    format!(
        "FontName={},FontSize={},Outline={},Shadow={},Alignment=2,MarginV={}",
        style.font_name, style.font_size, style.outline, style.shadow, style.margin_v
    )
}

/// Fans one source chain out to `uses` labelled pads.
fn fan_out(chain: String, split: &str, input: usize, kind: char, uses: usize) -> String {
    let pads: String = (0..uses)
        .map(|pass| format!("[s{}{}{}]", input, kind, pass))
        .collect();
    if uses == 1 {
        format!("{}{}", chain, pads)
    } else {
        format!("{},{}={}{}", chain, split, uses, pads)
    }
}

/// Every distinct source is opened once and looped. A source that appears
/// several times in the timeline is split, and each pass is trimmed out of
/// the looped stream at its offset.
pub fn render_args(job: &RenderJob) -> Vec<String> {
    let mut sources: Vec<&Path> = Vec::new();
    let mut uses: Vec<usize> = Vec::new();
    let mut cuts = Vec::with_capacity(job.timeline.len());
    for clip in &job.timeline {
        let input = match sources.iter().position(|p| *p == clip.path.as_path()) {
            Some(i) => i,
            None => {
                sources.push(&clip.path);
                uses.push(0);
                sources.len() - 1
            }
        };
        let pass = uses[input];
        let start = pass as f64 * clip.source_duration + clip.source_in;
        uses[input] += 1;
        cuts.push((input, pass, start, start + clip.len()));
    }

    let mut args: Vec<String> = vec!["-y".into()];
    for source in &sources {
        args.extend([
            "-stream_loop".into(),
            "-1".into(),
            "-i".into(),
            source.display().to_string(),
        ]);
    }
    let speech_input = sources.len();
    args.extend(["-i".into(), job.speech.display().to_string()]);

    let mix = job.background_volume > 0.0;
    let mut graph = Vec::new();
    for (i, count) in uses.iter().enumerate() {
        let video = format!(
            "[{i}:v]scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h},setsar=1,fps={fps}",
            i = i,
            w = job.width,
            h = job.height,
            fps = job.fps
        );
        graph.push(fan_out(video, "split", i, 'v', *count));
        if mix {
            let audio = format!("[{}:a]aresample=48000,aformat=channel_layouts=stereo", i);
            graph.push(fan_out(audio, "asplit", i, 'a', *count));
        }
    }

    let mut concat_inputs = String::new();
    for (n, (input, pass, start, end)) in cuts.iter().enumerate() {
        graph.push(format!(
            "[s{}v{}]trim=start={}:end={},setpts=PTS-STARTPTS[v{}]",
            input,
            pass,
            secs(*start),
            secs(*end),
            n
        ));
        concat_inputs.push_str(&format!("[v{}]", n));
        if mix {
            graph.push(format!(
                "[s{}a{}]atrim=start={}:end={},asetpts=PTS-STARTPTS[a{}]",
                input,
                pass,
                secs(*start),
                secs(*end),
                n
            ));
            concat_inputs.push_str(&format!("[a{}]", n));
        }
    }
    let n = cuts.len();
    if mix {
        graph.push(format!("{}concat=n={}:v=1:a=1[vcat][bg]", concat_inputs, n));
    } else {
        graph.push(format!("{}concat=n={}:v=1:a=0[vcat]", concat_inputs, n));
    }

    match &job.subtitles {
        Some(srt) => graph.push(format!(
            "[vcat]subtitles={}:force_style='{}'[vout]",
            filter_path(srt),
            force_style(&job.style)
        )),
        None => graph.push("[vcat]null[vout]".to_string()),
    }

    let speech = format!(
        "[{}:a]atrim=0:{},asetpts=PTS-STARTPTS",
        speech_input,
        secs(job.duration)
    );
    if mix {
        graph.push(format!("{}[speech]", speech));
        graph.push(format!("[bg]volume={}[bgv]", job.background_volume));
        graph.push("[speech][bgv]amix=inputs=2:duration=first:dropout_transition=0[aout]".into());
    } else {
        graph.push(format!("{}[aout]", speech));
    }

    args.extend([
        "-filter_complex".into(),
        graph.join(";"),
        "-map".into(),
        "[vout]".into(),
        "-map".into(),
        "[aout]".into(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "fast".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-r".into(),
        job.fps.to_string(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "192k".into(),
        "-t".into(),
        secs(job.duration),
        "-movflags".into(),
        "+faststart".into(),
        job.output.display().to_string(),
    ]);
    args
}

pub fn preview_args(input: &Path, output: &Path, spec: &PreviewSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-i".into(),
        input.display().to_string(),
        "-t".into(),
        secs(spec.seconds),
        "-vf".into(),
        format!("scale=-2:{},fps={}", spec.height, spec.fps),
    ];
    if spec.keep_audio {
        args.extend(["-c:a".into(), "aac".into()]);
    } else {
        args.push("-an".into());
    }
    args.extend([
        "-movflags".into(),
        "+faststart".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        output.display().to_string(),
    ]);
    args
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::Mutex;

    /// Stands in for ffmpeg: "encodes" by writing a marker file and
    /// remembering the stream durations the real encoder would produce.
    #[derive(Default)]
    pub struct FakeMedia {
        pub durations: Mutex<HashMap<String, f64>>,
        pub streams: Mutex<HashMap<String, StreamDurations>>,
        pub with_audio: bool,
        pub fail_render: bool,
        /// Extra seconds added to the encoded video stream.
        pub video_drift: f64,
        pub renders: Mutex<Vec<RenderJob>>,
    }

    impl FakeMedia {
        pub fn with_durations(entries: &[(&str, f64)]) -> Self {
            let media = Self::default();
            {
                let mut durations = media.durations.lock().unwrap();
                for (name, secs) in entries {
                    durations.insert(name.to_string(), *secs);
                }
            }
            media
        }
    }

    fn key(path: &Path) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    impl MediaToolkit for FakeMedia {
        fn probe_duration(&self, path: &Path) -> DubResult<f64> {
            self.durations
                .lock()
                .unwrap()
                .get(&key(path))
                .copied()
                .ok_or_else(|| DubError::Encoding(format!("unknown media {}", path.display())))
        }

        fn probe_streams(&self, path: &Path) -> DubResult<StreamDurations> {
            self.streams
                .lock()
                .unwrap()
                .get(&key(path))
                .copied()
                .ok_or_else(|| DubError::Encoding(format!("not rendered: {}", path.display())))
        }

        fn has_audio(&self, _path: &Path) -> DubResult<bool> {
            Ok(self.with_audio)
        }

        fn render(&self, job: &RenderJob) -> DubResult<()> {
            self.renders.lock().unwrap().push(job.clone());
            if self.fail_render {
                fs::write(&job.output, b"partial").unwrap();
                return Err(DubError::Encoding("encoder crashed".into()));
            }
            let video: f64 = job.timeline.iter().map(|c| c.len()).sum::<f64>().min(job.duration);
            fs::write(&job.output, b"dub").unwrap();
            self.streams.lock().unwrap().insert(
                key(&job.output),
                StreamDurations {
                    video: Some(video + self.video_drift),
                    audio: Some(job.duration),
                },
            );
            self.durations
                .lock()
                .unwrap()
                .insert(key(&job.output), job.duration);
            Ok(())
        }

        fn extract_preview(&self, input: &Path, output: &Path, spec: &PreviewSpec) -> DubResult<()> {
            let source = self.probe_duration(input).unwrap_or(spec.seconds);
            fs::write(output, b"preview").unwrap();
            self.durations
                .lock()
                .unwrap()
                .insert(key(output), source.min(spec.seconds));
            Ok(())
        }
    }
}
