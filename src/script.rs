//! Script parsing: pause markers, speaker labels and input sanitising.
//!
//! A script is free text with optional inline silence markers:
//!
//! | Marker        | Meaning                                  |
//! |---------------|------------------------------------------|
//! | `[pause]`     | silence of the default duration (1000 ms)|
//! | `[pause:N]`   | silence of `N` milliseconds              |
//!
//! Anything that does not match exactly (wrong case, a non-numeric or
//! out-of-range duration, a missing bracket) is kept as literal text.
//!
//! Multi-speaker scripts label their lines `Speaker N: …`; the labels are
//! passed through to the engine untouched.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Silence inserted for a bare `[pause]` marker.
pub const DEFAULT_PAUSE_MS: u32 = 1_000;

static RE_PAUSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[pause(?::(\d+))?\]").unwrap());

static RE_SPEAKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*Speaker\s+(\d+)\s*:").unwrap());

// ─────────────────────────────────────────────────────────────────────────────
// Segments
// ─────────────────────────────────────────────────────────────────────────────

/// One ordered unit of a parsed script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Text to synthesise (already trimmed).
    Text(String),
    /// Silence, in milliseconds.
    Pause(u32),
}

impl Segment {
    pub fn is_pause(&self) -> bool {
        matches!(self, Segment::Pause(_))
    }
}

/// Split `script` into text and pause segments using [`DEFAULT_PAUSE_MS`].
pub fn parse_script(script: &str) -> Vec<Segment> {
    parse_script_with_default(script, DEFAULT_PAUSE_MS)
}

/// Split `script` into text and pause segments.
///
/// Text between markers is trimmed and dropped when empty.  A script with no
/// markers always yields exactly one [`Segment::Text`] holding the trimmed
/// input.
pub fn parse_script_with_default(script: &str, default_pause_ms: u32) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut last_end = 0;
    let mut saw_marker = false;

    for caps in RE_PAUSE.captures_iter(script) {
        let whole = caps.get(0).expect("capture 0 is the whole match");
        let duration_ms = match caps.get(1) {
            None => default_pause_ms,
            // Overflowing durations are malformed: leave the marker in the text.
            Some(digits) => match digits.as_str().parse::<u32>() {
                Ok(ms) => ms,
                Err(_) => continue,
            },
        };

        push_text(&mut segments, &script[last_end..whole.start()]);
        segments.push(Segment::Pause(duration_ms));
        last_end = whole.end();
        saw_marker = true;
    }

    if !saw_marker {
        return vec![Segment::Text(script.trim().to_string())];
    }

    push_text(&mut segments, &script[last_end..]);
    segments
}

fn push_text(segments: &mut Vec<Segment>, text: &str) {
    let text = text.trim();
    if !text.is_empty() {
        segments.push(Segment::Text(text.to_string()));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Speaker labels
// ─────────────────────────────────────────────────────────────────────────────

/// Prefix every non-empty line with `Speaker {speaker}: `.
pub fn format_single_speaker(text: &str, speaker: usize) -> String {
    text.trim()
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| format!("Speaker {speaker}: {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Distinct `Speaker N:` labels used by `script`, in ascending order.
pub fn speaker_ids(script: &str) -> BTreeSet<usize> {
    RE_SPEAKER
        .captures_iter(script)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .collect()
}

/// `true` when `text` already carries at least one speaker label.
pub fn has_speaker_labels(text: &str) -> bool {
    RE_SPEAKER.is_match(text)
}

// ─────────────────────────────────────────────────────────────────────────────
// Sanitising
// ─────────────────────────────────────────────────────────────────────────────

/// NFKC-normalise, remove control characters (keeping `\n` and `\t`) and trim.
///
/// Newlines are preserved because they separate speaker turns.
pub fn sanitize_text(text: &str) -> String {
    text.nfkc()
        .filter(|&c| !c.is_control() || c == '\n' || c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
