use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::compose::{ComposeSettings, Compositor, OutputArtifact, artifact_paths};
use crate::config::DubConfig;
use crate::error::{DubError, DubResult, ErrorKind};
use crate::library::{Library, UsageLog};
use crate::media::MediaToolkit;
use crate::reconcile::{ReconcilePolicy, reconcile};
use crate::script::Script;
use crate::select::{Selection, SelectionCriteria, select};
use crate::tts::{SpeechEngine, SpeechTrack, Synthesizer};
use crate::voice::VoiceProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Queued,
    Synthesizing,
    Selecting,
    Reconciling,
    Composing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobFailure {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Synthesizing,
    Selecting,
    Reconciling,
    Composing,
    Done(OutputArtifact),
    Failed(JobFailure),
}

pub enum Event {
    /// The current stage finished; move on to the next one.
    Advance,
    Complete(OutputArtifact),
    Fail(DubError),
}

#[derive(Debug, Error)]
#[error("invalid transition: {event} while {state}")]
pub struct TransitionError {
    state: &'static str,
    event: &'static str,
}

impl From<TransitionError> for DubError {
    fn from(e: TransitionError) -> Self {
        DubError::Configuration(e.to_string())
    }
}

impl JobState {
    /// The stage a non-terminal state stands for.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            JobState::Queued => Some(Stage::Queued),
            JobState::Synthesizing => Some(Stage::Synthesizing),
            JobState::Selecting => Some(Stage::Selecting),
            JobState::Reconciling => Some(Stage::Reconciling),
            JobState::Composing => Some(Stage::Composing),
            JobState::Done(_) | JobState::Failed(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobState::Queued => "Queued",
            JobState::Synthesizing => "Synthesizing",
            JobState::Selecting => "Selecting",
            JobState::Reconciling => "Reconciling",
            JobState::Composing => "Composing",
            JobState::Done(_) => "Done",
            JobState::Failed(_) => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage().is_none()
    }

    /// Stages only move forward. `Complete` is accepted from `Composing`, and
    /// from `Queued` when a cached artifact makes every stage unnecessary.
    pub fn advance(&self, event: Event) -> Result<JobState, TransitionError> {
        let invalid = |event: &'static str| TransitionError {
            state: self.name(),
            event,
        };
        match (self, event) {
            (JobState::Queued, Event::Advance) => Ok(JobState::Synthesizing),
            (JobState::Synthesizing, Event::Advance) => Ok(JobState::Selecting),
            (JobState::Selecting, Event::Advance) => Ok(JobState::Reconciling),
            (JobState::Reconciling, Event::Advance) => Ok(JobState::Composing),
            (JobState::Composing | JobState::Queued, Event::Complete(artifact)) => {
                Ok(JobState::Done(artifact))
            }
            (state, Event::Fail(err)) => match state.stage() {
                Some(stage) => Ok(JobState::Failed(JobFailure {
                    stage,
                    kind: err.kind(),
                    message: err.to_string(),
                })),
                None => Err(invalid("fail")),
            },
            (_, Event::Advance) => Err(invalid("advance")),
            (_, Event::Complete(_)) => Err(invalid("complete")),
        }
    }
}

/// One script narrated over one background, producing one artifact.
#[derive(Debug, Clone, Serialize)]
pub struct DubJob {
    pub id: String,
    pub script: Script,
    pub voice: VoiceProfile,
    pub criteria: SelectionCriteria,
    state: JobState,
    history: Vec<JobState>,
}

impl DubJob {
    pub fn new(id: String, script: Script, voice: VoiceProfile, criteria: SelectionCriteria) -> Self {
        Self {
            id,
            script,
            voice,
            criteria,
            state: JobState::Queued,
            history: vec![JobState::Queued],
        }
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    /// Every state the job has been in, oldest first.
    #[cfg(test)]
    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    pub fn apply(&mut self, event: Event) -> Result<(), TransitionError> {
        let next = self.state.advance(event)?;
        info!("Job {}: {} -> {}", self.id, self.state.name(), next.name());
        self.history.push(next.clone());
        self.state = next;
        Ok(())
    }
}

/// Shared stop flag checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Completed {
    artifact: OutputArtifact,
    assets: Vec<String>,
}

pub struct Orchestrator {
    config: DubConfig,
    synthesizer: Arc<Synthesizer>,
    compositor: Arc<Compositor>,
    usage_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        config: DubConfig,
        engine: Arc<dyn SpeechEngine>,
        media: Arc<dyn MediaToolkit>,
    ) -> Self {
        let synthesizer = Synthesizer::new(engine, config.segment_gap_secs, config.end_silence_secs);
        let compositor = Compositor::new(media, ComposeSettings::from_config(&config));
        Self {
            config,
            synthesizer: Arc::new(synthesizer),
            compositor: Arc::new(compositor),
            usage_lock: Mutex::new(()),
        }
    }

    /// Creates a queued job. The id is derived from the inputs, the settings
    /// that shape the output and the library contents, so identical requests
    /// share an id and may reuse the earlier artifact. With artifact reuse
    /// off a random suffix makes every submission unique.
    pub fn submit(
        &self,
        script: Script,
        voice: VoiceProfile,
        criteria: SelectionCriteria,
        library: &Library,
    ) -> DubJob {
        let mut hasher = Sha256::new();
        for segment in script.segments() {
            hasher.update(segment.as_bytes());
            hasher.update(b"\x1f");
        }
        hasher.update(voice.cache_key().as_bytes());
        for tag in &criteria.tags {
            hasher.update(tag.as_bytes());
            hasher.update(b"\x1f");
        }
        hasher.update(criteria.min_duration_secs.to_le_bytes());
        hasher.update(self.output_settings_key().as_bytes());
        for asset in library.assets() {
            hasher.update(asset.id.as_bytes());
            hasher.update(b"\x1f");
            hasher.update(asset.name.as_bytes());
            hasher.update(b"\x1f");
            hasher.update(asset.duration_secs.to_le_bytes());
            for tag in &asset.tags {
                hasher.update(tag.as_bytes());
                hasher.update(b"\x1f");
            }
            hasher.update(b"\x1e");
        }
        let digest = format!("{:x}", hasher.finalize());
        let mut id = digest[..16].to_string();
        if !self.config.reuse_artifacts {
            id = format!("{}-{:08x}", id, rand::random::<u32>());
        }
        DubJob::new(id, script, voice, criteria)
    }

    fn output_settings_key(&self) -> String {
        let mut value = match serde_json::to_value(&self.config) {
            Ok(v) => v,
            Err(_) => return String::new(),
        };
        if let Some(map) = value.as_object_mut() {
            for local in [
                "library_dir",
                "artifacts_dir",
                "temp_root",
                "reuse_artifacts",
                "parallel_stages",
            ] {
                map.remove(local);
            }
        }
        value.to_string()
    }

    /// Drives `job` to `Done` or `Failed`. The library snapshot is only read.
    pub async fn run(&self, job: &mut DubJob, library: Arc<Library>, cancel: &CancelHandle) {
        let outcome = self.drive(job, library, cancel).await;
        let event = match outcome {
            Ok(done) => {
                if !done.artifact.cached {
                    self.record_usage(&done.assets, &job.id).await;
                }
                Event::Complete(done.artifact)
            }
            Err(err) => {
                error!("Job {} failed: {}", job.id, err);
                Event::Fail(err)
            }
        };
        if let Err(e) = job.apply(event) {
            error!("Job {}: {}", job.id, e);
        }
        match job.state() {
            JobState::Done(artifact) => info!(
                "Job {} done: {} (preview {})",
                job.id,
                artifact.video_path.display(),
                artifact.preview_path.display()
            ),
            JobState::Failed(failure) => warn!(
                "Job {} failed at {} with {}",
                job.id, failure.stage, failure.kind
            ),
            _ => {}
        }
    }

    fn enter(&self, job: &mut DubJob, cancel: &CancelHandle) -> DubResult<()> {
        if cancel.is_cancelled() {
            info!("Job {} cancelled", job.id);
            return Err(DubError::Cancelled);
        }
        job.apply(Event::Advance)?;
        Ok(())
    }

    async fn drive(
        &self,
        job: &mut DubJob,
        library: Arc<Library>,
        cancel: &CancelHandle,
    ) -> DubResult<Completed> {
        if job.state().is_terminal() {
            return Err(DubError::Configuration(format!(
                "job {} has already finished",
                job.id
            )));
        }
        if let Some(artifact) = self.cached_artifact(&job.id)? {
            info!("Reusing artifact {}", artifact.video_path.display());
            return Ok(Completed {
                artifact,
                assets: Vec::new(),
            });
        }

        // Removed on drop, whichever way this function returns.
        std::fs::create_dir_all(&self.config.temp_root).map_err(|e| {
            DubError::Configuration(format!(
                "cannot create {}: {}",
                self.config.temp_root.display(),
                e
            ))
        })?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-", job.id))
            .tempdir_in(&self.config.temp_root)
            .map_err(|e| DubError::Configuration(format!("cannot create job directory: {}", e)))?;
        let work_dir = scratch.path().to_path_buf();

        self.enter(job, cancel)?;
        let synthesis = self.spawn_synthesis(job, work_dir.clone());
        let early_selection = self
            .config
            .parallel_stages
            .then(|| self.spawn_selection(job, library.clone()));
        let speech = join(synthesis, DubError::Synthesis).await??;

        self.enter(job, cancel)?;
        let selection = match early_selection {
            Some(task) => task,
            None => self.spawn_selection(job, library),
        };
        let selection = join(selection, DubError::InsufficientFootage).await??;

        self.enter(job, cancel)?;
        let policy = ReconcilePolicy {
            allow_loop: self.config.allow_loop,
            tolerance_secs: self.config.tolerance_secs,
        };
        let pair = reconcile(speech, &selection, &policy)?;

        self.enter(job, cancel)?;
        let compositor = self.compositor.clone();
        let artifacts_dir = self.config.artifacts_dir.clone();
        let id = job.id.clone();
        let artifact = join(
            tokio::task::spawn_blocking(move || {
                compositor.compose(&pair, &work_dir, &artifacts_dir, &id)
            }),
            DubError::Encoding,
        )
        .await??;

        drop(scratch);
        Ok(Completed {
            artifact,
            assets: selection.ids().map(str::to_string).collect(),
        })
    }

    fn spawn_synthesis(&self, job: &DubJob, work_dir: PathBuf) -> JoinHandle<DubResult<SpeechTrack>> {
        let synthesizer = self.synthesizer.clone();
        let script = job.script.clone();
        let voice = job.voice.clone();
        tokio::task::spawn_blocking(move || synthesizer.synthesize(&script, &voice, &work_dir))
    }

    fn spawn_selection(
        &self,
        job: &DubJob,
        library: Arc<Library>,
    ) -> JoinHandle<DubResult<Selection>> {
        let criteria = job.criteria.clone();
        let order = self.config.selection_order;
        tokio::task::spawn_blocking(move || select(&library, &criteria, order))
    }

    fn cached_artifact(&self, id: &str) -> DubResult<Option<OutputArtifact>> {
        if !self.config.reuse_artifacts {
            return Ok(None);
        }
        let (video_path, preview_path) = artifact_paths(&self.config.artifacts_dir, id);
        if !(video_path.is_file() && preview_path.is_file()) {
            return Ok(None);
        }
        let duration_secs = self.compositor.probe_duration(&video_path)?;
        Ok(Some(OutputArtifact {
            id: id.to_string(),
            video_path,
            preview_path,
            duration_secs,
            cached: true,
        }))
    }

    async fn record_usage(&self, assets: &[String], job_id: &str) {
        let _guard = self.usage_lock.lock().await;
        let path = self.config.usage_json();
        let result = UsageLog::load(&path).and_then(|mut log| {
            log.record(assets.iter().map(String::as_str), job_id);
            log.save(&path)
        });
        if let Err(e) = result {
            warn!("Could not update usage log {}: {:#}", path.display(), e);
        }
    }
}

/// A task that panicked or was aborted fails with its stage's error kind.
async fn join<T>(
    handle: JoinHandle<DubResult<T>>,
    stage_error: fn(String) -> DubError,
) -> DubResult<DubResult<T>> {
    handle
        .await
        .map_err(|e| stage_error(format!("stage task did not finish: {}", e)))
}
