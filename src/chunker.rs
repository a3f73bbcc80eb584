//! Chunk splitter: bounds every text segment to a word budget.
//!
//! Long text is cut in three passes, each only when the previous one leaves a
//! unit over budget:
//!
//! 1. **Sentences**: whitespace after `.`, `!` or `?` when the next word
//!    starts with a capital letter.  If that finds a single over-budget
//!    sentence, any word ending in `.` is accepted as a sentence end instead.
//! 2. **Clauses**: after words ending in `,` or `;`.
//! 3. **Greedy packing**: consecutive units are packed into chunks of at most
//!    `max_words` words.
//!
//! Cuts only ever happen on whitespace, so the words of the chunks, read in
//! order, are exactly the words of the input.  A clause with no usable
//! punctuation that is still over budget is emitted as one oversized chunk.

use fancy_regex::Regex;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::script::Segment;

/// Default word budget per engine call.
pub const DEFAULT_MAX_WORDS: usize = 250;

/// Whitespace run that ends a sentence: preceded by terminal punctuation and
/// followed by an upper-case letter.
static RE_SENTENCE_GAP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?<=[.!?])\s+(?=\p{Lu})").unwrap());

// ─────────────────────────────────────────────────────────────────────────────
// Plan types
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded unit of text submitted to the engine in one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position of this chunk in the [`ScriptPlan`] (reassembly order).
    pub index: usize,
    /// Index of the script segment the chunk was cut from.
    pub segment: usize,
    pub text: String,
    pub word_count: usize,
}

/// One step of a plan: speech to generate or silence to insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanItem {
    Speech(Chunk),
    Pause { index: usize, duration_ms: u32 },
}

impl PlanItem {
    pub fn index(&self) -> usize {
        match self {
            PlanItem::Speech(chunk) => chunk.index,
            PlanItem::Pause { index, .. } => *index,
        }
    }
}

/// Script order flattened into speech chunks and pauses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptPlan {
    items: Vec<PlanItem>,
}

impl ScriptPlan {
    /// Build a plan from parsed segments, splitting text to `max_words`.
    ///
    /// Empty text segments are skipped.
    pub fn new(segments: &[Segment], max_words: usize) -> Self {
        let mut items = Vec::new();
        for (seg_idx, segment) in segments.iter().enumerate() {
            match segment {
                Segment::Pause(ms) => items.push(PlanItem::Pause {
                    index: items.len(),
                    duration_ms: *ms,
                }),
                Segment::Text(text) => {
                    for piece in split_text(text, max_words) {
                        let word_count = piece.split_whitespace().count();
                        items.push(PlanItem::Speech(Chunk {
                            index: items.len(),
                            segment: seg_idx,
                            text: piece,
                            word_count,
                        }));
                    }
                }
            }
        }
        debug!(items = items.len(), max_words, "script plan built");
        Self { items }
    }

    pub fn items(&self) -> &[PlanItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.items.iter().filter_map(|item| match item {
            PlanItem::Speech(chunk) => Some(chunk),
            PlanItem::Pause { .. } => None,
        })
    }

    /// Plan index of the last speech chunk, if any.
    pub fn last_speech_index(&self) -> Option<usize> {
        self.chunks().last().map(|c| c.index)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Splitter
// ─────────────────────────────────────────────────────────────────────────────

/// Byte span of one whitespace-delimited word.
#[derive(Debug, Clone, Copy)]
struct Word {
    start: usize,
    end: usize,
}

fn words_of(text: &str) -> Vec<Word> {
    let mut words = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                words.push(Word { start: s, end: i });
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        words.push(Word { start: s, end: text.len() });
    }
    words
}

/// Split `text` into chunks of at most `max_words` words.
///
/// Text within budget is returned whole (trimmed, internal whitespace kept).
/// Empty input yields no chunks.  `max_words == 0` is treated as 1.
pub fn split_text(text: &str, max_words: usize) -> Vec<String> {
    let max_words = max_words.max(1);
    let words = words_of(text);
    if words.is_empty() {
        return Vec::new();
    }
    if words.len() <= max_words {
        return vec![text.trim().to_string()];
    }

    let sentences = sentence_units(text, &words, max_words);

    // Clause pass: only over-budget sentences are cut further.
    let mut units: Vec<(usize, usize)> = Vec::new();
    for (start, end) in sentences {
        if end - start > max_words {
            units.extend(split_after(&words[start..end], start, |w| {
                w.ends_with(',') || w.ends_with(';')
            }, text));
        } else {
            units.push((start, end));
        }
    }

    // Greedy packing.
    let mut chunks = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    for (start, end) in units {
        let len = end - start;
        match current {
            Some((cs, ce)) if (ce - cs) + len <= max_words => current = Some((cs, end)),
            Some(span) => {
                chunks.push(span);
                current = Some((start, end));
            }
            None => current = Some((start, end)),
        }
    }
    chunks.extend(current);

    debug!(chunks = chunks.len(), words = words.len(), max_words, "split text");
    chunks
        .into_iter()
        .map(|(s, e)| text[words[s].start..words[e - 1].end].to_string())
        .collect()
}

/// Sentence spans as `[start, end)` word indices.
fn sentence_units(text: &str, words: &[Word], max_words: usize) -> Vec<(usize, usize)> {
    let mut cuts = Vec::new();
    for gap in RE_SENTENCE_GAP.find_iter(text).filter_map(Result::ok) {
        // The gap sits between two words; cut before the first word after it.
        let next = words.partition_point(|w| w.start < gap.end());
        if next > 0 && next < words.len() {
            cuts.push(next);
        }
    }
    let sentences = spans_from_cuts(&cuts, words.len());

    if sentences.len() == 1 && words.len() > max_words {
        return split_after(words, 0, |w| w.ends_with('.'), text);
    }
    sentences
}

/// Cut `words` after every word for which `is_boundary` holds.
///
/// `offset` is the index of `words[0]` in the full word list.
fn split_after(
    words: &[Word],
    offset: usize,
    is_boundary: impl Fn(&str) -> bool,
    text: &str,
) -> Vec<(usize, usize)> {
    let cuts: Vec<usize> = words
        .iter()
        .enumerate()
        .filter(|(i, w)| *i + 1 < words.len() && is_boundary(&text[w.start..w.end]))
        .map(|(i, _)| i + 1)
        .collect();
    spans_from_cuts(&cuts, words.len())
        .into_iter()
        .map(|(s, e)| (s + offset, e + offset))
        .collect()
}

fn spans_from_cuts(cuts: &[usize], len: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0;
    for &cut in cuts {
        if cut > start {
            spans.push((start, cut));
            start = cut;
        }
    }
    spans.push((start, len));
    spans
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parse_script;

    fn all_words(chunks: &[String]) -> Vec<String> {
        chunks
            .iter()
            .flat_map(|c| c.split_whitespace().map(str::to_string))
            .collect()
    }

    fn input_words(text: &str) -> Vec<String> {
        text.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_within_budget_is_untouched() {
        let text = "Speaker 0: Hello there.\nSpeaker 1: Hi!";
        assert_eq!(split_text(text, 250), vec![text.to_string()]);
    }

    #[test]
    fn test_empty_text_has_no_chunks() {
        assert!(split_text("   \n ", 10).is_empty());
    }

    #[test]
    fn test_sentence_packing() {
        let text = "One two three. Four five six. Seven eight nine. Ten.";
        let chunks = split_text(text, 6);
        assert_eq!(
            chunks,
            vec!["One two three. Four five six.", "Seven eight nine. Ten."]
        );
    }

    #[test]
    fn test_long_sentence_splits_on_commas() {
        let text = "alpha beta gamma, delta epsilon zeta; eta theta iota, kappa lambda";
        let chunks = split_text(text, 4);
        for chunk in &chunks {
            assert!(chunk.split_whitespace().count() <= 4, "{chunk}");
        }
        // Punctuation stays attached to its word.
        assert_eq!(chunks[0], "alpha beta gamma,");
        assert_eq!(all_words(&chunks), input_words(text));
    }

    #[test]
    fn test_lowercase_after_period_fallback() {
        let text = "one two. three four. five six. seven eight.";
        let chunks = split_text(text, 4);
        assert_eq!(chunks, vec!["one two. three four.", "five six. seven eight."]);
    }

    #[test]
    fn test_unsplittable_run_passes_through() {
        let text = "word ".repeat(30);
        let chunks = split_text(&text, 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].split_whitespace().count(), 30);
    }

    #[test]
    fn test_oversized_run_is_isolated() {
        let run = "x ".repeat(12);
        let text = format!("Short one. {}end. Tail here.", run);
        let chunks = split_text(&text, 5);
        let over: Vec<_> = chunks.iter().filter(|c| c.split_whitespace().count() > 5).collect();
        assert_eq!(over.len(), 1);
        assert_eq!(all_words(&chunks), input_words(&text));
    }

    #[test]
    fn test_budget_and_word_preservation_property() {
        let text = "The quick brown fox jumps over the lazy dog. It was, by all accounts, \
                    a remarkable leap; witnesses agreed. Nobody expected it! Did the dog mind? \
                    Not at all, since dogs, as a rule, enjoy a good show and a long nap afterwards.";
        for budget in 1..=20 {
            let chunks = split_text(text, budget);
            assert_eq!(all_words(&chunks), input_words(text), "budget {budget}");
            for chunk in &chunks {
                let n = chunk.split_whitespace().count();
                // Every word ends in punctuation or belongs to a clause of its own
                // at this budget, so nothing may exceed it unless unsplittable.
                if n > budget {
                    assert!(!chunk.contains(", ") && !chunk.contains("; "), "{budget}: {chunk}");
                }
            }
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "A b c. D e f, g h; i j. K l m n o p q.";
        assert_eq!(split_text(text, 3), split_text(text, 3));
    }

    #[test]
    fn test_plan_indices_follow_script_order() {
        let segments = parse_script("Hello.\n[pause:200]\nWorld.");
        let plan = ScriptPlan::new(&segments, DEFAULT_MAX_WORDS);
        assert_eq!(plan.len(), 3);
        assert!(matches!(&plan.items()[0], PlanItem::Speech(c) if c.text == "Hello." && c.index == 0));
        assert!(matches!(plan.items()[1], PlanItem::Pause { index: 1, duration_ms: 200 }));
        assert!(matches!(&plan.items()[2], PlanItem::Speech(c) if c.text == "World." && c.segment == 2));
        assert_eq!(plan.last_speech_index(), Some(2));
    }

    #[test]
    fn test_plan_skips_empty_text() {
        let plan = ScriptPlan::new(&parse_script(""), 10);
        assert!(plan.is_empty());
    }
}
