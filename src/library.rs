use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::PreviewConfig;
use crate::error::{DubError, DubResult};
use crate::media::{MediaToolkit, PreviewSpec};
use crate::utils::{format_clock, sha256_file, write_atomic};

/// One entry of `videos.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(deserialize_with = "seconds_or_clock")]
    pub duration: f64,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LibraryFile {
    #[serde(default)]
    videos: Vec<AssetRecord>,
}

/// Accepts plain seconds or the older "MM:SS" / "HH:MM:SS" strings.
fn seconds_or_clock<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(s) => Ok(s),
        Raw::Text(text) => parse_clock(&text).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid duration '{}'", text))
        }),
    }
}

fn parse_clock(text: &str) -> Option<f64> {
    let text = text.trim();
    if let Ok(seconds) = text.parse::<f64>() {
        return Some(seconds);
    }
    let mut total = 0.0;
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return None;
    }
    for part in parts {
        let value: f64 = part.parse().ok()?;
        total = total * 60.0 + value;
    }
    Some(total)
}

/// A background clip as the pipeline sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoAsset {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub duration_secs: f64,
    /// Empty means the clip is explicitly untagged.
    pub tags: BTreeSet<String>,
    pub preview_path: PathBuf,
    pub preview_url: Option<String>,
}

impl VideoAsset {
    fn from_record(dir: &Path, record: AssetRecord) -> Self {
        let preview_path = dir.join(preview_name(&record.name));
        let preview_url = if record.url.starts_with("http://") || record.url.starts_with("https://")
        {
            Some(record.url)
        } else {
            None
        };
        Self {
            path: dir.join(&record.name),
            id: record.id,
            name: record.name,
            duration_secs: record.duration,
            tags: normalize_tags(record.tags),
            preview_path,
            preview_url,
        }
    }

    pub fn matches_any(&self, tags: &BTreeSet<String>) -> bool {
        tags.is_empty() || self.tags.iter().any(|t| tags.contains(t))
    }
}

pub fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

pub fn parse_tag_list(list: &str) -> BTreeSet<String> {
    normalize_tags(list.split(','))
}

fn preview_name(name: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    format!("{}_preview.mp4", stem)
}

/// Read-only snapshot of the clip catalog, ordered by asset id.
#[derive(Debug, Clone, Default)]
pub struct Library {
    assets: Vec<VideoAsset>,
}

#[derive(Debug, Serialize)]
pub struct Page<'a> {
    pub page: usize,
    pub page_size: usize,
    pub total_videos: usize,
    pub total_pages: usize,
    pub videos: Vec<&'a VideoAsset>,
}

impl Library {
    pub fn load(dir: &Path) -> DubResult<Self> {
        let path = dir.join("videos.json");
        if !path.exists() {
            warn!("No library metadata at {}; library is empty", path.display());
            return Ok(Self::from_records(dir, Vec::new()));
        }
        let data = fs::read_to_string(&path).map_err(|e| {
            DubError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let file: LibraryFile = serde_json::from_str(&data).map_err(|e| {
            DubError::Configuration(format!("cannot parse {}: {}", path.display(), e))
        })?;
        let library = Self::from_records(dir, file.videos);
        info!("Loaded {} videos from {}", library.len(), path.display());
        Ok(library)
    }

    pub fn from_records(dir: &Path, records: Vec<AssetRecord>) -> Self {
        let mut seen = HashSet::new();
        let mut assets = Vec::with_capacity(records.len());
        for record in records {
            if !seen.insert(record.id.clone()) {
                warn!("Duplicate video id {} ignored", record.id);
                continue;
            }
            if !(record.duration.is_finite() && record.duration > 0.0) {
                warn!("Video {} has no usable duration; skipped", record.id);
                continue;
            }
            assets.push(VideoAsset::from_record(dir, record));
        }
        assets.sort_by(|a, b| a.id.cmp(&b.id));
        Self { assets }
    }

    pub fn assets(&self) -> &[VideoAsset] {
        &self.assets
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<&VideoAsset> {
        self.assets
            .binary_search_by(|a| a.id.as_str().cmp(id))
            .ok()
            .map(|i| &self.assets[i])
    }

    pub fn with_tags<'a, 'b>(
        &'a self,
        tags: &'b BTreeSet<String>,
    ) -> impl Iterator<Item = &'a VideoAsset> + use<'a, 'b> {
        self.assets.iter().filter(move |a| a.matches_any(tags))
    }

    /// 1-based pagination over the assets matching any of `tags`.
    pub fn page(&self, tags: &BTreeSet<String>, page: usize, page_size: usize) -> Page<'_> {
        let page = page.max(1);
        let page_size = page_size.max(1);
        let matching: Vec<&VideoAsset> = self
            .assets
            .iter()
            .filter(|a| a.matches_any(tags))
            .collect();
        let total_videos = matching.len();
        let total_pages = total_videos.div_ceil(page_size);
        let videos = matching
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect();
        Page {
            page,
            page_size,
            total_videos,
            total_pages,
            videos,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub uses: u64,
    pub last_job: String,
}

/// How often each clip has ended up in a finished dub. Kept apart from
/// `videos.json`, which only the ingestion command writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageLog {
    #[serde(default)]
    pub assets: BTreeMap<String, UsageEntry>,
}

impl UsageLog {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let log = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(log)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        write_atomic(path, data.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn record<'a>(&mut self, asset_ids: impl IntoIterator<Item = &'a str>, job_id: &str) {
        let unique: BTreeSet<&str> = asset_ids.into_iter().collect();
        for id in unique {
            let entry = self.assets.entry(id.to_string()).or_default();
            entry.uses += 1;
            entry.last_job = job_id.to_string();
        }
    }
}

/// Resets `videos.json` when it is missing, empty or unreadable.
fn ensure_library_file(dir: &Path) -> anyhow::Result<LibraryFile> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join("videos.json");
    let existing = fs::read_to_string(&path)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .and_then(|s| match serde_json::from_str::<LibraryFile>(&s) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("{} is corrupt ({}); starting a new library", path.display(), e);
                None
            }
        });
    match existing {
        Some(file) => Ok(file),
        None => {
            let empty = LibraryFile::default();
            write_atomic(&path, serde_json::to_string_pretty(&empty)?.as_bytes())?;
            Ok(empty)
        }
    }
}

pub struct IngestRequest<'a> {
    pub source: &'a Path,
    pub tags: BTreeSet<String>,
    pub base_url: Option<&'a str>,
}

/// Copies a clip into the library, cuts its preview and records it.
/// An entry with the same file name is replaced.
pub fn ingest(
    dir: &Path,
    request: &IngestRequest<'_>,
    preview: &PreviewConfig,
    media: &dyn MediaToolkit,
) -> anyhow::Result<AssetRecord> {
    let source = request.source;
    if !source.is_file() {
        anyhow::bail!("Video not found: {}", source.display());
    }
    let mut file = ensure_library_file(dir)?;

    let name = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid filename {}", source.display()))?
        .to_string();
    let stored = dir.join(&name);
    let same_file = match (source.canonicalize(), stored.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if !same_file {
        fs::copy(source, &stored).with_context(|| {
            format!("Failed to copy {} to {}", source.display(), stored.display())
        })?;
        debug!("Copied {} to {}", source.display(), stored.display());
    }

    let preview_file = preview_name(&name);
    let preview_path = dir.join(&preview_file);
    media.extract_preview(
        &stored,
        &preview_path,
        &PreviewSpec {
            seconds: preview.seconds,
            height: preview.height,
            fps: preview.fps,
            keep_audio: false,
        },
    )?;
    let duration = media.probe_duration(&stored)?;

    let hash = sha256_file(&stored)
        .with_context(|| format!("Failed to hash {}", stored.display()))?;
    let url = match request.base_url.filter(|b| !b.is_empty()) {
        Some(base) => format!("{}/{}", base.trim_end_matches('/'), preview_file),
        None => format!("{}/{}", dir.display(), preview_file),
    };
    let record = AssetRecord {
        id: hash[..16].to_string(),
        name: name.clone(),
        url,
        duration,
        tags: request.tags.iter().cloned().collect(),
    };

    file.videos.retain(|v| v.name != name);
    file.videos.push(record.clone());
    let data = serde_json::to_string_pretty(&file)?;
    write_atomic(&dir.join("videos.json"), data.as_bytes())?;

    info!(
        "Video added: id {} preview {} duration {}",
        record.id,
        preview_path.display(),
        format_clock(duration)
    );
    Ok(record)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn record(id: &str, duration: f64, tags: &[&str]) -> AssetRecord {
        AssetRecord {
            id: id.to_string(),
            name: format!("{}.mp4", id),
            url: format!("videos/{}_preview.mp4", id),
            duration,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn library(records: Vec<AssetRecord>) -> Library {
        Library::from_records(Path::new("videos"), records)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{library, record};
    use super::*;
    use crate::media::testing::FakeMedia;

    #[test]
    fn legacy_clock_durations_are_read() {
        let json = r#"{"videos":[
            {"id":"a","name":"a.mp4","url":"videos/a_preview.mp4","duration":"01:15","tags":["parkour"]},
            {"id":"b","name":"b.mp4","url":"https://cdn.example/b_preview.mp4","duration":12.5,"tags":[]}
        ]}"#;
        let file: LibraryFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.videos[0].duration, 75.0);
        let lib = Library::from_records(Path::new("videos"), file.videos);
        let b = lib.get("b").unwrap();
        assert_eq!(b.preview_url.as_deref(), Some("https://cdn.example/b_preview.mp4"));
        assert_eq!(b.preview_path, PathBuf::from("videos/b_preview.mp4"));
        assert!(b.tags.is_empty());
        assert_eq!(lib.get("a").unwrap().path, PathBuf::from("videos/a.mp4"));
    }

    #[test]
    fn duplicate_and_zero_length_entries_are_dropped() {
        let lib = library(vec![
            record("b", 10.0, &["x"]),
            record("a", 5.0, &["x"]),
            record("a", 99.0, &["y"]),
            record("c", 0.0, &["x"]),
        ]);
        let ids: Vec<&str> = lib.assets().iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(lib.get("a").unwrap().duration_secs, 5.0);
    }

    #[test]
    fn pagination_filters_by_any_tag() {
        let lib = library(vec![
            record("a", 5.0, &["parkour"]),
            record("b", 5.0, &["racing"]),
            record("c", 5.0, &["parkour", "city"]),
            record("d", 5.0, &[]),
        ]);
        let tags = parse_tag_list("parkour, city");
        let page = lib.page(&tags, 1, 1);
        assert_eq!(page.total_videos, 2);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.videos[0].id, "a");
        let page = lib.page(&tags, 2, 1);
        assert_eq!(page.videos[0].id, "c");
        assert!(lib.page(&tags, 3, 1).videos.is_empty());

        let all = lib.page(&BTreeSet::new(), 1, 10);
        assert_eq!(all.total_videos, 4);
    }

    #[test]
    fn page_borrows_only_the_library() {
        let lib = library(vec![record("a", 5.0, &["x"]), record("b", 5.0, &["y"])]);
        let page = {
            let tags = parse_tag_list("y");
            lib.page(&tags, 1, 10)
        };
        assert_eq!(page.videos.len(), 1);
        assert_eq!(page.videos[0].id, "b");
    }

    #[test]
    fn usage_counts_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.json");
        let mut log = UsageLog::load(&path).unwrap();
        log.record(["a", "b", "a"], "job1");
        log.save(&path).unwrap();

        let mut log = UsageLog::load(&path).unwrap();
        log.record(["a"], "job2");
        assert_eq!(log.assets["a"].uses, 2);
        assert_eq!(log.assets["a"].last_job, "job2");
        assert_eq!(log.assets["b"].uses, 1);
    }

    #[test]
    fn ingest_records_clip_and_replaces_same_name() {
        let dir = tempfile::tempdir().unwrap();
        let lib_dir = dir.path().join("videos");
        let source = dir.path().join("run.mp4");
        fs::write(&source, b"first clip").unwrap();
        let media = FakeMedia::with_durations(&[("run.mp4", 42.0)]);

        let request = IngestRequest {
            source: &source,
            tags: parse_tag_list("parkour,city"),
            base_url: Some("https://cdn.example/previews/"),
        };
        let first = ingest(&lib_dir, &request, &PreviewConfig::default(), &media).unwrap();
        assert_eq!(first.url, "https://cdn.example/previews/run_preview.mp4");
        assert_eq!(first.duration, 42.0);
        assert!(lib_dir.join("run.mp4").is_file());
        assert!(lib_dir.join("run_preview.mp4").is_file());

        fs::write(&source, b"second clip").unwrap();
        let second = ingest(&lib_dir, &request, &PreviewConfig::default(), &media).unwrap();
        assert_ne!(first.id, second.id);

        let lib = Library::load(&lib_dir).unwrap();
        assert_eq!(lib.len(), 1);
        assert_eq!(lib.assets()[0].id, second.id);
    }

    #[test]
    fn corrupt_library_file_is_reset_on_ingest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("videos.json"), "{not json").unwrap();
        assert!(matches!(
            Library::load(dir.path()),
            Err(DubError::Configuration(_))
        ));

        let source = dir.path().join("clip.mp4");
        fs::write(&source, b"clip").unwrap();
        let media = FakeMedia::with_durations(&[("clip.mp4", 8.0)]);
        let request = IngestRequest {
            source: &source,
            tags: BTreeSet::new(),
            base_url: None,
        };
        ingest(dir.path(), &request, &PreviewConfig::default(), &media).unwrap();
        assert_eq!(Library::load(dir.path()).unwrap().len(), 1);
    }
}
