//! Verdict extraction from noisy pane output.
//!
//! Agents are told to print a bare keyword (e.g. `PASS`) on its own line when
//! they finish. Pane captures also contain the instruction text itself, which
//! mentions every keyword, so extraction only accepts whole-line matches in the
//! tail of the capture and skips lines that reflow the instruction text.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::sync::lock;

/// Default number of trailing lines scanned for a verdict.
pub const DEFAULT_TAIL_LINES: usize = 40;

/// Consecutive identical detections required before a verdict is accepted.
pub const DEFAULT_STABILITY_POLLS: u32 = 2;

/// Returns the keyword when the whole line is exactly that keyword.
///
/// Markdown emphasis (`*`) and backticks are removed first, then surrounding
/// whitespace. Trailing punctuation or any other text rejects the line.
pub fn match_verdict<'a>(line: &str, keywords: &'a [String]) -> Option<&'a str> {
    let cleaned: String = line.chars().filter(|c| !matches!(c, '*' | '`')).collect();
    let cleaned = cleaned.trim();
    keywords
        .iter()
        .find(|k| k.as_str() == cleaned)
        .map(String::as_str)
}

/// Normalized instruction lines that mention at least one keyword.
pub fn prompt_verdict_lines(prompt_text: &str, keywords: &[String]) -> BTreeSet<String> {
    prompt_text
        .lines()
        .map(|line| line.replace(['*', '`'], "").trim().to_string())
        .filter(|line| !line.is_empty() && keywords.iter().any(|k| line.contains(k.as_str())))
        .collect()
}

/// True when `line` looks like a wrapped copy of an instruction line.
///
/// The text around the keyword is compared with the instruction lines. A bare
/// keyword has no surrounding text and is never treated as instruction text.
pub fn is_prompt_line(line: &str, prompt_lines: &BTreeSet<String>, keywords: &[String]) -> bool {
    let mut context = line.to_string();
    for keyword in keywords {
        context = context.replace(keyword.as_str(), "");
    }
    let context = context
        .trim_matches(|c: char| matches!(c, ' ' | '\t' | '\u{2014}' | '-' | ':' | '(' | ')' | '.'))
        .trim();
    if context.chars().count() <= 3 {
        return false;
    }
    let cleaned = line.replace(['*', '`'], "");
    let cleaned = cleaned.trim();
    prompt_lines.iter().any(|prompt| {
        prompt.contains(context) || prompt.contains(cleaned) || cleaned.contains(prompt.as_str())
    })
}

/// Options for [`extract_verdict`].
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions<'a> {
    /// Instruction text sent to the agent; lines reflowing it are skipped.
    pub prompt_text: &'a str,
    /// Verdicts that must be ignored (e.g. the awaiting verdict while paused).
    pub exclude: &'a [String],
    /// Trailing lines to scan; `0` uses [`DEFAULT_TAIL_LINES`].
    pub tail_lines: usize,
}

/// Scan the tail of `content` backwards and return the newest verdict line.
pub fn extract_verdict(
    content: &str,
    keywords: &[String],
    options: &ExtractOptions<'_>,
) -> Option<String> {
    let tail_lines = if options.tail_lines == 0 {
        DEFAULT_TAIL_LINES
    } else {
        options.tail_lines
    };
    let lines: Vec<&str> = content.trim().lines().collect();
    let tail = &lines[lines.len().saturating_sub(tail_lines)..];
    let prompt_lines = if options.prompt_text.is_empty() {
        BTreeSet::new()
    } else {
        prompt_verdict_lines(options.prompt_text, keywords)
    };

    for line in tail.iter().rev() {
        let stripped = line.trim().trim_matches('*').trim();
        let Some(verdict) = match_verdict(stripped, keywords) else {
            continue;
        };
        if options.exclude.iter().any(|e| e == verdict) {
            continue;
        }
        if !prompt_lines.is_empty() && is_prompt_line(stripped, &prompt_lines, keywords) {
            tracing::debug!(verdict, "skipping verdict line copied from instructions");
            continue;
        }
        return Some(verdict.to_string());
    }
    None
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct StabilityEntry {
    last: Option<String>,
    count: u32,
    misses: u32,
}

/// Debounces verdict detections per key.
///
/// A verdict is accepted once the same verdict has been seen on
/// `required_polls` consecutive updates. A different verdict always restarts
/// the count. An absent verdict restarts it too, unless fewer than
/// `noise_tolerance` absent polls have occurred in a row (strict by default).
#[derive(Debug)]
pub struct VerdictStabilityTracker {
    required_polls: u32,
    noise_tolerance: u32,
    entries: Mutex<BTreeMap<String, StabilityEntry>>,
}

impl Default for VerdictStabilityTracker {
    fn default() -> Self {
        Self::new(DEFAULT_STABILITY_POLLS, 0)
    }
}

impl VerdictStabilityTracker {
    pub fn new(required_polls: u32, noise_tolerance: u32) -> Self {
        Self {
            required_polls: required_polls.max(1),
            noise_tolerance,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn required_polls(&self) -> u32 {
        self.required_polls
    }

    pub fn noise_tolerance(&self) -> u32 {
        self.noise_tolerance
    }

    /// Record one poll for `key`. Returns true once the verdict is stable.
    pub fn update(&self, key: &str, verdict: Option<&str>) -> bool {
        let mut entries = lock(&self.entries);
        let entry = entries.entry(key.to_string()).or_default();
        match verdict {
            None => {
                entry.misses += 1;
                if entry.misses > self.noise_tolerance {
                    *entry = StabilityEntry::default();
                }
                false
            }
            Some(verdict) => {
                entry.misses = 0;
                if entry.last.as_deref() == Some(verdict) {
                    entry.count += 1;
                } else {
                    entry.last = Some(verdict.to_string());
                    entry.count = 1;
                }
                entry.count >= self.required_polls
            }
        }
    }

    pub fn reset(&self, key: &str) {
        lock(&self.entries).remove(key);
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}
