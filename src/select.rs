use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::config::SelectionOrder;
use crate::error::{DubError, DubResult};
use crate::library::{Library, VideoAsset};

/// Which background footage a job wants.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SelectionCriteria {
    /// Any-match filter; empty means every clip is eligible.
    pub tags: BTreeSet<String>,
    pub min_duration_secs: f64,
}

/// Clips to play back to back, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    assets: Vec<VideoAsset>,
}

impl Selection {
    pub fn new(assets: Vec<VideoAsset>) -> Self {
        Self { assets }
    }

    pub fn assets(&self) -> &[VideoAsset] {
        &self.assets
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.assets.iter().map(|a| a.id.as_str())
    }

    pub fn total_duration(&self) -> f64 {
        self.assets.iter().map(|a| a.duration_secs).sum()
    }
}

/// Picks background footage for `criteria`. The result depends only on the
/// library snapshot and the inputs: ties are broken by asset id.
pub fn select(
    library: &Library,
    criteria: &SelectionCriteria,
    order: SelectionOrder,
) -> DubResult<Selection> {
    let min = criteria.min_duration_secs.max(0.0);
    let mut eligible: Vec<&VideoAsset> = library.with_tags(&criteria.tags).collect();
    debug!(
        "{} of {} clips match tags {:?}",
        eligible.len(),
        library.len(),
        criteria.tags
    );
    if eligible.is_empty() {
        return Err(DubError::InsufficientFootage(format!(
            "no clips tagged with any of {:?}",
            criteria.tags
        )));
    }

    let single = eligible
        .iter()
        .filter(|a| a.duration_secs >= min)
        .min_by(|a, b| {
            let by_duration = match order {
                SelectionOrder::TightestFit => a.duration_secs.total_cmp(&b.duration_secs),
                SelectionOrder::LongestFirst => b.duration_secs.total_cmp(&a.duration_secs),
            };
            by_duration.then_with(|| a.id.cmp(&b.id))
        });
    if let Some(asset) = single {
        info!(
            "Selected clip {} ({:.2}s) for minimum {:.2}s",
            asset.id, asset.duration_secs, min
        );
        return Ok(Selection::new(vec![(*asset).clone()]));
    }

    eligible.sort_by(|a, b| {
        b.duration_secs
            .total_cmp(&a.duration_secs)
            .then_with(|| a.id.cmp(&b.id))
    });
    let mut chosen = Vec::new();
    let mut total = 0.0;
    for asset in eligible {
        chosen.push(asset.clone());
        total += asset.duration_secs;
        if total >= min {
            info!(
                "Selected {} clips totalling {:.2}s for minimum {:.2}s",
                chosen.len(),
                total,
                min
            );
            return Ok(Selection::new(chosen));
        }
    }
    Err(DubError::InsufficientFootage(format!(
        "matching clips total {:.2}s, need {:.2}s",
        total, min
    )))
}
