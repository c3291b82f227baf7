use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use tracing::{info, warn};

fn sentence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)([^.!?]+[.!?]+)|([^.!?]+$)").expect("sentence pattern is valid")
    })
}

/// Ordered text segments narrated one after another. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Script {
    segments: Vec<String>,
}

impl Script {
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Splits free text into sentence-grouped chunks of at most `max_chars`.
    pub fn from_text(text: &str, max_chars: usize) -> Self {
        Self {
            segments: chunk_text(text, max_chars),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Segments with content, in script order.
    pub fn speakable(&self) -> impl Iterator<Item = &str> {
        self.segments
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn has_speech(&self) -> bool {
        self.speakable().next().is_some()
    }
}

pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    info!("Splitting text into chunks with max {} chars", max_chars);
    let mut sentences = Vec::new();
    for m in sentence_regex().find_iter(text) {
        let s = m.as_str().trim();
        if !s.is_empty() {
            sentences.push(s.to_string());
        }
    }
    if sentences.is_empty() {
        warn!("No sentence breaks found; returning whole text as one chunk");
        return vec![text.trim().to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for s in sentences {
        if current.is_empty() {
            current.push_str(&s);
        } else if current.len() + 1 + s.len() <= max_chars {
            current.push(' ');
            current.push_str(&s);
        } else {
            chunks.push(current);
            current = s;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    info!("Created {} text chunks", chunks.len());
    chunks
}
