use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{DubConfig, PreviewConfig, SubtitleStyle};
use crate::error::{DubError, DubResult};
use crate::media::{MediaToolkit, PreviewSpec, RenderJob};
use crate::reconcile::ReconciledPair;
use crate::subtitle::{build_cues, write_srt};
use crate::utils::move_file;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputArtifact {
    pub id: String,
    pub video_path: PathBuf,
    pub preview_path: PathBuf,
    pub duration_secs: f64,
    /// True when an earlier run's files were reused instead of re-encoding.
    pub cached: bool,
}

pub fn artifact_paths(artifacts_dir: &Path, id: &str) -> (PathBuf, PathBuf) {
    (
        artifacts_dir.join(format!("{}.mp4", id)),
        artifacts_dir.join(format!("{}_preview.mp4", id)),
    )
}

#[derive(Debug, Clone)]
pub struct ComposeSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub background_volume: f64,
    pub subtitles: SubtitleStyle,
    pub preview: PreviewConfig,
    pub tolerance_secs: f64,
}

impl ComposeSettings {
    pub fn from_config(config: &DubConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            fps: config.fps,
            background_volume: config.background_volume,
            subtitles: config.subtitles.clone(),
            preview: config.preview.clone(),
            tolerance_secs: config.tolerance_secs,
        }
    }
}

pub struct Compositor {
    media: Arc<dyn MediaToolkit>,
    settings: ComposeSettings,
}

impl Compositor {
    pub fn new(media: Arc<dyn MediaToolkit>, settings: ComposeSettings) -> Self {
        Self { media, settings }
    }

    /// Encodes the dub inside `work_dir`, checks the result and only then
    /// moves it (and its preview) into `artifacts_dir`.
    pub fn compose(
        &self,
        pair: &ReconciledPair,
        work_dir: &Path,
        artifacts_dir: &Path,
        id: &str,
    ) -> DubResult<OutputArtifact> {
        let duration = pair.duration();
        let (final_video, final_preview) = artifact_paths(artifacts_dir, id);
        match (final_video.exists(), final_preview.exists()) {
            (true, true) => {
                return Err(DubError::Encoding(format!(
                    "artifact {} already exists; refusing to overwrite",
                    final_video.display()
                )));
            }
            (true, false) => remove_leftover(&final_video)?,
            (false, true) => remove_leftover(&final_preview)?,
            (false, false) => {}
        }

        let subtitles = if self.settings.subtitles.enabled {
            let path = work_dir.join("subs.srt");
            write_srt(&path, &build_cues(&pair.audio.segments)).map_err(|e| {
                DubError::Encoding(format!("cannot write subtitles {}: {}", path.display(), e))
            })?;
            Some(path)
        } else {
            None
        };

        let (staged_video, staged_preview) = artifact_paths(work_dir, id);
        let job = RenderJob {
            timeline: pair.video.segments.clone(),
            speech: pair.audio.path.clone(),
            duration,
            subtitles,
            style: self.settings.subtitles.clone(),
            background_volume: self.background_volume(pair)?,
            width: self.settings.width,
            height: self.settings.height,
            fps: self.settings.fps,
            output: staged_video.clone(),
        };
        info!(
            "Encoding {:.2}s dub from {} cuts into {}",
            duration,
            job.timeline.len(),
            staged_video.display()
        );
        self.media.render(&job)?;
        self.verify(&staged_video, duration)?;

        self.media.extract_preview(
            &staged_video,
            &staged_preview,
            &PreviewSpec {
                seconds: self.settings.preview.seconds.min(duration),
                height: self.settings.preview.height,
                fps: self.settings.preview.fps,
                keep_audio: true,
            },
        )?;

        publish(&staged_video, &final_video, &staged_preview, &final_preview)?;
        info!("Final video written to {}", final_video.display());
        Ok(OutputArtifact {
            id: id.to_string(),
            video_path: final_video,
            preview_path: final_preview,
            duration_secs: duration,
            cached: false,
        })
    }

    pub fn probe_duration(&self, path: &Path) -> DubResult<f64> {
        self.media.probe_duration(path)
    }

    /// Game audio is only kept when asked for and every clip carries some.
    fn background_volume(&self, pair: &ReconciledPair) -> DubResult<f64> {
        let volume = self.settings.background_volume;
        if volume <= 0.0 {
            return Ok(0.0);
        }
        let sources: BTreeSet<&Path> = pair
            .video
            .segments
            .iter()
            .map(|s| s.path.as_path())
            .collect();
        for source in sources {
            if !self.media.has_audio(source)? {
                warn!(
                    "{} has no audio track; background audio disabled",
                    source.display()
                );
                return Ok(0.0);
            }
        }
        Ok(volume)
    }

    fn verify(&self, output: &Path, expected: f64) -> DubResult<()> {
        let streams = self.media.probe_streams(output)?;
        let (video, audio) = match (streams.video, streams.audio) {
            (Some(v), Some(a)) => (v, a),
            _ => {
                return Err(DubError::Encoding(format!(
                    "{} is missing an audio or video stream",
                    output.display()
                )));
            }
        };
        let tolerance = self.settings.tolerance_secs;
        if (video - audio).abs() > tolerance || (audio - expected).abs() > tolerance {
            return Err(DubError::Encoding(format!(
                "encoded streams out of sync: video {:.3}s, audio {:.3}s, expected {:.3}s",
                video, audio, expected
            )));
        }
        Ok(())
    }
}

/// Half of an artifact pair left behind by an interrupted publish.
fn remove_leftover(path: &Path) -> DubResult<()> {
    warn!("Removing incomplete artifact {}", path.display());
    fs::remove_file(path)
        .map_err(|e| DubError::Encoding(format!("cannot remove {}: {}", path.display(), e)))
}

/// The preview goes last: a video without its preview is never reused.
fn publish(
    staged_video: &Path,
    final_video: &Path,
    staged_preview: &Path,
    final_preview: &Path,
) -> DubResult<()> {
    let dir = final_video.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir)
        .map_err(|e| DubError::Encoding(format!("cannot create {}: {}", dir.display(), e)))?;
    move_file(staged_video, final_video).map_err(|e| {
        DubError::Encoding(format!("cannot publish {}: {}", final_video.display(), e))
    })?;
    if let Err(e) = move_file(staged_preview, final_preview) {
        let _ = fs::remove_file(final_video);
        return Err(DubError::Encoding(format!(
            "cannot publish {}: {}",
            final_preview.display(),
            e
        )));
    }
    Ok(())
}
