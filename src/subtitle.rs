use regex::Regex;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::OnceLock;

use crate::tts::SegmentTiming;

const COMMA_PAUSE: f64 = 0.2;
const SENTENCE_END_PAUSE: f64 = 0.4;
/// Word length exponent used to share a segment's time between its words.
const WORD_WEIGHT_ALPHA: f64 = 0.75;

fn word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\w[\w'-]*)|([,.!?])").expect("word pattern is valid"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Word-level cues spread over each segment's known position in the track.
pub fn build_cues(segments: &[SegmentTiming]) -> Vec<Cue> {
    let mut cues = Vec::new();
    for segment in segments {
        let start_of_speech = (segment.start + segment.lead_in).min(segment.end);
        let elements: Vec<&str> = word_regex()
            .find_iter(&segment.text)
            .map(|m| m.as_str())
            .collect();
        if elements.is_empty() {
            cues.push(Cue {
                start: start_of_speech,
                end: segment.end,
                text: segment.text.clone(),
            });
            continue;
        }

        let mut total_pause = 0.0;
        let mut words = Vec::new();
        for &element in &elements {
            match element {
                "," => total_pause += COMMA_PAUSE,
                "." | "!" | "?" => total_pause += SENTENCE_END_PAUSE,
                _ => words.push(element),
            }
        }
        let word_time = (segment.end - start_of_speech - total_pause).max(0.0);
        let total_weight: f64 = words
            .iter()
            .map(|w| (w.chars().count() as f64).powf(WORD_WEIGHT_ALPHA))
            .sum();

        let mut clock = start_of_speech;
        for element in elements {
            match element {
                "," => clock += COMMA_PAUSE,
                "." | "!" | "?" => clock += SENTENCE_END_PAUSE,
                word => {
                    let weight = (word.chars().count() as f64).powf(WORD_WEIGHT_ALPHA);
                    let duration = if total_weight > 0.0 {
                        word_time * weight / total_weight
                    } else {
                        0.0
                    };
                    cues.push(Cue {
                        start: clock.min(segment.end),
                        end: (clock + duration).min(segment.end),
                        text: word.to_string(),
                    });
                    clock += duration;
                }
            }
        }
    }
    cues
}

pub fn write_srt(path: &Path, cues: &[Cue]) -> io::Result<()> {
    let mut f = BufWriter::new(File::create(path)?);
    for (i, cue) in cues.iter().enumerate() {
        writeln!(f, "{}", i + 1)?;
        writeln!(f, "{} --> {}", format_srt_time(cue.start), format_srt_time(cue.end))?;
        for line in wrap_text(&cue.text, 80) {
            writeln!(f, "{}", line)?;
        }
        writeln!(f)?;
    }
    f.flush()
}

fn format_srt_time(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_sec = total_ms / 1000;
    let s = total_sec % 60;
    let total_min = total_sec / 60;
    let m = total_min % 60;
    let h = total_min / 60;
    format!("{:02}:{:02}:{:02},{:03}", h, m, s, ms)
}

fn wrap_text(s: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in s.split_whitespace() {
        if current.len() + word.len() + 1 > width && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
            current.push_str(word);
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(text: &str, start: f64, end: f64) -> SegmentTiming {
        SegmentTiming {
            text: text.to_string(),
            start,
            end,
            lead_in: 0.0,
        }
    }

    #[test]
    fn words_fill_their_segment_in_order() {
        let cues = build_cues(&[segment("Hello world.", 0.0, 2.0), segment("Bye", 2.3, 3.0)]);
        let words: Vec<&str> = cues.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(words, vec!["Hello", "world", "Bye"]);
        // 2.0s minus the sentence pause, split over two five-letter words.
        assert!((cues[0].end - 0.8).abs() < 1e-9);
        assert!((cues[1].end - 1.6).abs() < 1e-9);
        assert!((cues[2].start - 2.3).abs() < 1e-9);
        assert!((cues[2].end - 3.0).abs() < 1e-9);
        assert!(cues.windows(2).all(|w| w[0].start <= w[1].start));
    }

    #[test]
    fn lead_in_delays_first_word() {
        let mut seg = segment("Go", 1.0, 2.0);
        seg.lead_in = 0.25;
        let cues = build_cues(&[seg]);
        assert!((cues[0].start - 1.25).abs() < 1e-9);
    }

    #[test]
    fn srt_formatting() {
        assert_eq!(format_srt_time(3725.0456), "01:02:05,046");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subs.srt");
        write_srt(
            &path,
            &[Cue {
                start: 0.0,
                end: 1.5,
                text: "Hi".into(),
            }],
        )
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "1\n00:00:00,000 --> 00:00:01,500\nHi\n\n"
        );
    }

    #[test]
    fn long_text_wraps() {
        let text = "word ".repeat(30);
        let lines = wrap_text(&text, 20);
        assert!(lines.iter().all(|l| l.len() <= 20));
        assert_eq!(lines.join(" ").split_whitespace().count(), 30);
    }
}
