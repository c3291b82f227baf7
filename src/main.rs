mod args;
mod audio;
mod compose;
mod config;
mod error;
mod library;
mod media;
mod pipeline;
mod reconcile;
mod script;
mod select;
mod subtitle;
mod tts;
mod utils;
mod voice;

use anyhow::Context;
use clap::Parser;
use std::fs;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::args::{AddArgs, Args, Command, DubArgs, VideosArgs};
use crate::config::DubConfig;
use crate::error::{DubError, DubResult};
use crate::library::{IngestRequest, Library, ingest, parse_tag_list};
use crate::media::Ffmpeg;
use crate::pipeline::{CancelHandle, JobState, Orchestrator};
use crate::script::Script;
use crate::select::SelectionCriteria;
use crate::tts::SpeechEngine;
use crate::utils::format_clock;
use crate::voice::VoiceProfile;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = DubConfig::load(args.config.as_deref())?;

    match args.command {
        Command::Dub(dub) => run_dub(config, dub).await,
        Command::Add(add) => run_add(&config, add),
        Command::Videos(videos) => run_videos(&config, videos),
        Command::Voices => run_voices(&config),
    }
}

async fn run_dub(mut config: DubConfig, args: DubArgs) -> anyhow::Result<()> {
    if let Some(dir) = args.out_dir {
        config.artifacts_dir = dir;
    }
    if let Some(chars) = args.chunk_chars {
        config.chunk_chars = chars;
    }
    if let Some(speed) = args.speed {
        config.speed = speed;
    }
    config.allow_loop &= !args.no_loop;
    config.reuse_artifacts &= !args.no_reuse;
    config.subtitles.enabled &= !args.no_subtitles;

    let ffmpeg = Ffmpeg::default();
    let engine = tts::build_engine(&config)?;
    if let Err(e) = check_environment(&config, engine.as_ref(), &ffmpeg.binaries()) {
        error!("Environment check failed ({}): {}", e.kind(), e);
        std::process::exit(2);
    }

    let script = match &args.script_file {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read script {}", path.display()))?;
            Script::from_segments(text.lines().filter(|l| !l.trim().is_empty()))
        }
        None => Script::from_text(args.text.as_deref().unwrap_or_default(), config.chunk_chars),
    };
    if !script.has_speech() {
        anyhow::bail!("Script has no speakable text");
    }
    info!("Script has {} segments", script.segments().len());

    let voice = match &args.voice_sample {
        Some(sample) => VoiceProfile::cloned(sample)?,
        None => VoiceProfile::built_in(args.voice.clone()),
    };
    let criteria = SelectionCriteria {
        tags: parse_tag_list(&args.tags),
        min_duration_secs: args.min_duration,
    };

    let library = Arc::new(Library::load(&config.library_dir)?);
    let orchestrator = Orchestrator::new(config, engine, Arc::new(ffmpeg));
    let mut job = orchestrator.submit(script, voice, criteria, &library);
    println!("Job {}", job.id);

    let cancel = CancelHandle::default();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; stopping after the current stage");
                cancel.cancel();
            }
        });
    }
    orchestrator.run(&mut job, library, &cancel).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&job)?);
    }
    match job.state() {
        JobState::Done(artifact) => {
            if !args.json {
                println!("Video:   {}", artifact.video_path.display());
                println!("Preview: {}", artifact.preview_path.display());
                println!(
                    "Length:  {}{}",
                    format_clock(artifact.duration_secs),
                    if artifact.cached { " (reused)" } else { "" }
                );
            }
            Ok(())
        }
        JobState::Failed(failure) => {
            error!(
                "Job {} failed at {} with {}: {}",
                job.id, failure.stage, failure.kind, failure.message
            );
            std::process::exit(1);
        }
        other => anyhow::bail!("Job {} stopped while {}", job.id, other.name()),
    }
}

fn run_add(config: &DubConfig, args: AddArgs) -> anyhow::Result<()> {
    let ffmpeg = Ffmpeg::default();
    for bin in ffmpeg.binaries() {
        which::which(bin).with_context(|| format!("'{}' not found in PATH", bin))?;
    }
    let request = IngestRequest {
        source: &args.video,
        tags: parse_tag_list(&args.tags),
        base_url: args.url.as_deref(),
    };
    let record = ingest(&config.library_dir, &request, &config.preview, &ffmpeg)?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn run_videos(config: &DubConfig, args: VideosArgs) -> anyhow::Result<()> {
    let library = Library::load(&config.library_dir)?;
    let tags = parse_tag_list(&args.tags);
    let page = library.page(&tags, args.page, args.page_size);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }
    println!(
        "Page {}/{} ({} videos)",
        page.page,
        page.total_pages.max(1),
        page.total_videos
    );
    for video in &page.videos {
        let tags: Vec<&str> = video.tags.iter().map(String::as_str).collect();
        println!(
            "{}  {}  {}  [{}]",
            video.id,
            format_clock(video.duration_secs),
            video.name,
            tags.join(", ")
        );
    }
    Ok(())
}

fn run_voices(config: &DubConfig) -> anyhow::Result<()> {
    let engine = tts::build_engine(config)?;
    println!("Engine: {}", engine.name());
    println!(
        "Voice cloning: {}",
        if engine.supports_voice_cloning() { "yes" } else { "no" }
    );
    for voice in engine.voices() {
        match config.voices.get(&voice) {
            Some(model) => println!("  {} ({})", voice, model),
            None => println!("  {}", voice),
        }
    }
    Ok(())
}

/// Startup checks run before any job is accepted: the config is sane, the
/// encoder binaries are on PATH, the speech engine can run and the working
/// directories exist.
fn check_environment(
    config: &DubConfig,
    engine: &dyn SpeechEngine,
    binaries: &[&str],
) -> DubResult<()> {
    config.validate()?;

    for bin in binaries {
        let path = which::which(bin).map_err(|_| {
            DubError::Encoding(format!("'{}' not found in PATH; install ffmpeg", bin))
        })?;
        debug!("Found {} at {}", bin, path.display());
    }

    engine.ensure_ready()?;
    info!(
        "Speech engine {} ready ({} voices)",
        engine.name(),
        engine.voices().len()
    );

    for dir in [&config.library_dir, &config.artifacts_dir, &config.temp_root] {
        fs::create_dir_all(dir).map_err(|e| {
            DubError::Configuration(format!("cannot create {}: {}", dir.display(), e))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::tts::testing::FakeEngine;

    fn config_in(root: &std::path::Path) -> DubConfig {
        let mut config = DubConfig::default();
        config.library_dir = root.join("videos");
        config.artifacts_dir = root.join("outputs");
        config.temp_root = root.join("tmp");
        config
    }

    #[test]
    fn ready_environment_creates_directories() {
        let root = tempfile::tempdir().unwrap();
        let config = config_in(root.path());
        check_environment(&config, &FakeEngine::new(), &[]).unwrap();
        assert!(config.artifacts_dir.is_dir());
        assert!(config.temp_root.is_dir());
    }

    #[test]
    fn missing_encoder_is_an_encoding_error() {
        let root = tempfile::tempdir().unwrap();
        let err = check_environment(
            &config_in(root.path()),
            &FakeEngine::new(),
            &["definitely-not-an-encoder-binary"],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Encoding);
    }

    #[test]
    fn unready_engine_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let mut engine = FakeEngine::new();
        engine.ready = false;
        let err = check_environment(&config_in(root.path()), &engine, &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelUnavailable);
    }

    #[test]
    fn invalid_config_is_rejected_first() {
        let root = tempfile::tempdir().unwrap();
        let mut config = config_in(root.path());
        config.speed = 0.0;
        let err = check_environment(&config, &FakeEngine::new(), &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
