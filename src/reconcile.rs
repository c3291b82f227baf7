use std::path::PathBuf;
use tracing::{debug, info};

use crate::error::{DubError, DubResult};
use crate::select::Selection;
use crate::tts::SpeechTrack;

const EPSILON: f64 = 1e-6;

/// A contiguous cut `[source_in, source_out)` of one library clip.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipSegment {
    pub asset_id: String,
    pub path: PathBuf,
    /// Length of the whole clip, the period of a looped source.
    pub source_duration: f64,
    pub source_in: f64,
    pub source_out: f64,
}

impl ClipSegment {
    pub fn len(&self) -> f64 {
        self.source_out - self.source_in
    }
}

/// The background edit: clips played back to back.
#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    pub segments: Vec<ClipSegment>,
    pub duration: f64,
    /// How many times the selection was started over to cover the speech.
    pub repeats: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilePolicy {
    pub allow_loop: bool,
    pub tolerance_secs: f64,
}

#[derive(Debug, Clone)]
pub struct ReconciledPair {
    pub audio: SpeechTrack,
    pub video: Timeline,
}

impl ReconciledPair {
    pub fn duration(&self) -> f64 {
        self.audio.duration_secs
    }
}

/// Matches the background to the speech. Audio is never touched: video is
/// trimmed from 0 when too long and hard-cut repeated when too short.
pub fn reconcile(
    speech: SpeechTrack,
    selection: &Selection,
    policy: &ReconcilePolicy,
) -> DubResult<ReconciledPair> {
    let video = plan_timeline(speech.duration_secs, selection, policy)?;
    info!(
        "Reconciled {:.2}s speech with {:.2}s of video ({} cuts, {} repeats)",
        speech.duration_secs,
        video.duration,
        video.segments.len(),
        video.repeats
    );
    Ok(ReconciledPair { audio: speech, video })
}

pub fn plan_timeline(
    speech_secs: f64,
    selection: &Selection,
    policy: &ReconcilePolicy,
) -> DubResult<Timeline> {
    if !(speech_secs.is_finite() && speech_secs > 0.0) {
        return Err(DubError::DurationMismatch(format!(
            "speech duration must be positive, got {}",
            speech_secs
        )));
    }
    let assets = selection.assets();
    if assets.is_empty() {
        return Err(DubError::DurationMismatch("no background video selected".into()));
    }
    if let Some(bad) = assets.iter().find(|a| !(a.duration_secs > 0.0)) {
        return Err(DubError::DurationMismatch(format!(
            "video {} has no duration",
            bad.id
        )));
    }
    let available = selection.total_duration();
    if available + EPSILON < speech_secs && !policy.allow_loop {
        return Err(DubError::DurationMismatch(format!(
            "speech is {:.2}s but only {:.2}s of video is available and looping is disabled",
            speech_secs, available
        )));
    }

    // A final scrap shorter than this is dropped rather than encoded.
    let min_piece = policy.tolerance_secs / 2.0;
    let mut segments = Vec::new();
    let mut remaining = speech_secs;
    let mut repeats = 0;
    'cover: loop {
        for asset in assets {
            if remaining <= EPSILON {
                break 'cover;
            }
            let take = asset.duration_secs.min(remaining);
            let is_tail = asset.duration_secs >= remaining;
            if is_tail && take < min_piece && !segments.is_empty() {
                debug!("Dropping {:.3}s tail piece of {}", take, asset.id);
                break 'cover;
            }
            segments.push(ClipSegment {
                asset_id: asset.id.clone(),
                path: asset.path.clone(),
                source_duration: asset.duration_secs,
                source_in: 0.0,
                source_out: take,
            });
            remaining -= take;
        }
        if remaining <= EPSILON {
            break;
        }
        repeats += 1;
    }

    let duration: f64 = segments.iter().map(ClipSegment::len).sum();
    let drift = (duration - speech_secs).abs();
    if drift > policy.tolerance_secs {
        return Err(DubError::DurationMismatch(format!(
            "video {:.3}s and speech {:.3}s differ by {:.3}s",
            duration, speech_secs, drift
        )));
    }
    Ok(Timeline {
        segments,
        duration,
        repeats,
    })
}
