//! Fuzzy matching of harvested text fragments back to their jobs.
//!
//! The result list only shows a truncated rendering of each submitted text, so
//! matching works on the ends of the strings in three tiers:
//! 1. Exact match of the last [`TAIL_CHARS`] characters.
//! 2. Exact match of the normalized tail key.
//! 3. Either string's first [`PREFIX_CHARS`] characters appearing inside the other.
//!    Strings shorter than that never take part in this tier.
//!
//! The first tier with a candidate wins, lowest job index first.

use tracing::{debug, info};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::job::Job;

/// Characters compared at the end of a text.
pub const TAIL_CHARS: usize = 50;

/// Characters compared at the start of a text.
pub const PREFIX_CHARS: usize = 30;

/// Which rule produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    ExactTail,
    TailKey,
    Prefix,
}

impl MatchTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchTier::ExactTail => "exact_tail",
            MatchTier::TailKey => "tail_key",
            MatchTier::Prefix => "prefix",
        }
    }
}

/// A job matched to a fragment.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub job: Job,
    pub tier: MatchTier,
}

/// Last `n` characters of `text`.
fn last_chars(text: &str, n: usize) -> &str {
    let count = text.chars().count();
    if count <= n {
        return text;
    }
    match text.char_indices().nth(count - n) {
        Some((offset, _)) => &text[offset..],
        None => text,
    }
}

/// First `n` characters of `text`.
fn first_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((offset, _)) => &text[..offset],
        None => text,
    }
}

/// The first [`PREFIX_CHARS`] characters, if `text` has that many.
fn full_prefix(text: &str) -> Option<&str> {
    let prefix = first_chars(text, PREFIX_CHARS);
    (prefix.chars().count() == PREFIX_CHARS).then_some(prefix)
}

/// Lowercase, strip diacritics and collapse runs of non-alphanumeric
/// characters into single hyphens.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_hyphen = false;

    for ch in text.nfd().filter(|c| !is_combining_mark(*c)) {
        if ch.is_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_hyphen = true;
        }
    }

    out
}

/// Normalized fingerprint of the last [`TAIL_CHARS`] characters of `text`.
pub fn tail_key(text: &str) -> String {
    normalize(last_chars(text.trim(), TAIL_CHARS))
}

/// Strip the whitespace and trailing ellipsis a UI adds to truncated text.
fn clean_fragment(fragment: &str) -> &str {
    fragment
        .trim()
        .trim_end_matches('\u{2026}')
        .trim_end_matches("...")
        .trim_end()
}

struct Candidate {
    job: Job,
    text: String,
    tail: String,
    prefix: String,
}

/// Matches fragments against a fixed job set.
pub struct Matcher {
    candidates: Vec<Candidate>,
}

impl Matcher {
    /// Build a matcher. Jobs are tried in index order.
    pub fn new(mut jobs: Vec<Job>) -> Self {
        jobs.sort_by_key(|job| job.index);
        let candidates = jobs
            .into_iter()
            .map(|job| {
                let text = job.text.trim().to_string();
                Candidate {
                    tail: last_chars(&text, TAIL_CHARS).to_string(),
                    prefix: full_prefix(&text).unwrap_or_default().to_string(),
                    text,
                    job,
                }
            })
            .collect();
        Self { candidates }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Find the job a fragment belongs to.
    pub fn match_fragment(&self, fragment: &str) -> Option<MatchResult> {
        let fragment = clean_fragment(fragment);
        if fragment.is_empty() {
            return None;
        }

        let fragment_tail = last_chars(fragment, TAIL_CHARS);
        if let Some(candidate) = self.candidates.iter().find(|c| c.tail == fragment_tail) {
            return Some(MatchResult {
                job: candidate.job.clone(),
                tier: MatchTier::ExactTail,
            });
        }

        let key = tail_key(fragment);
        if !key.is_empty() {
            let hits: Vec<&Candidate> = self
                .candidates
                .iter()
                .filter(|c| c.job.tail_key == key)
                .collect();
            if let Some(result) = Self::pick(fragment, hits, MatchTier::TailKey) {
                return Some(result);
            }
        }

        let fragment_prefix = full_prefix(fragment);
        let hits: Vec<&Candidate> = self
            .candidates
            .iter()
            .filter(|c| {
                fragment_prefix.is_some_and(|prefix| c.text.contains(prefix))
                    || (!c.prefix.is_empty() && fragment.contains(c.prefix.as_str()))
            })
            .collect();
        if let Some(result) = Self::pick(fragment, hits, MatchTier::Prefix) {
            return Some(result);
        }

        debug!(fragment = %first_chars(fragment, PREFIX_CHARS), "No job matches fragment");
        None
    }

    /// First hit wins; every hit is logged.
    fn pick(fragment: &str, hits: Vec<&Candidate>, tier: MatchTier) -> Option<MatchResult> {
        let first = hits.first()?;
        for hit in &hits {
            info!(
                tier = tier.as_str(),
                job_index = hit.job.index,
                candidates = hits.len(),
                fragment = %first_chars(fragment, PREFIX_CHARS),
                "Fuzzy match candidate"
            );
        }
        Some(MatchResult {
            job: first.job.clone(),
            tier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::job_with_text;

    const LONG_A: &str = "A slow dolly shot through a neon-lit alley at night, rain falling, reflections shimmering on wet cobblestones";
    const LONG_B: &str = "Aerial view of a glacier calving into a turquoise fjord at golden hour, seabirds circling overhead";
    const LONG_C: &str = "Close-up of a potter's hands shaping wet clay on a spinning wheel, warm window light";

    fn matcher() -> Matcher {
        Matcher::new(vec![
            job_with_text(1, LONG_A),
            job_with_text(2, LONG_B),
            job_with_text(3, LONG_C),
        ])
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("Crème Brûlée, s'il vous plaît!"), "creme-brulee-s-il-vous-plait");
        assert_eq!(normalize("  --Hello__World--  "), "hello-world");
        assert_eq!(normalize("!!!"), "");
    }

    #[test]
    fn test_tail_key_uses_last_chars() {
        let text = format!("{}{}", "x".repeat(100), "The End.");
        let key = tail_key(&text);
        assert!(key.ends_with("the-end"));
        assert!(key.chars().count() <= TAIL_CHARS);
    }

    #[test]
    fn test_char_slicing_respects_multibyte() {
        assert_eq!(last_chars("héllo", 3), "llo");
        assert_eq!(first_chars("héllo", 2), "hé");
        assert_eq!(first_chars("hi", 10), "hi");
    }

    #[test]
    fn test_exact_tail_match_for_front_truncated_fragment() {
        let fragment = &LONG_B[20..];
        let result = matcher().match_fragment(fragment).unwrap();
        assert_eq!(result.job.index, 2);
        assert_eq!(result.tier, MatchTier::ExactTail);
    }

    #[test]
    fn test_tail_key_match_with_case_and_punctuation_drift() {
        let fragment = LONG_C.to_uppercase().replace(',', ";");
        let result = matcher().match_fragment(&fragment).unwrap();
        assert_eq!(result.job.index, 3);
        assert_eq!(result.tier, MatchTier::TailKey);
    }

    #[test]
    fn test_prefix_match_for_end_truncated_fragment() {
        let fragment = format!("{}…", &LONG_A[..45]);
        let result = matcher().match_fragment(&fragment).unwrap();
        assert_eq!(result.job.index, 1);
        assert_eq!(result.tier, MatchTier::Prefix);
    }

    #[test]
    fn test_no_match() {
        assert!(matcher()
            .match_fragment("A completely unrelated description of a city skyline")
            .is_none());
        assert!(matcher().match_fragment("   ").is_none());
    }

    #[test]
    fn test_short_fragment_does_not_prefix_match() {
        let m = matcher();
        assert!(m.match_fragment("a").is_none());
        assert!(m.match_fragment("on wet").is_none());
        assert!(m.match_fragment(&LONG_B[..PREFIX_CHARS - 1]).is_none());

        let short = Matcher::new(vec![job_with_text(1, "A slow dolly"), job_with_text(2, LONG_A)]);
        assert_eq!(short.match_fragment(&LONG_A[..40]).unwrap().job.index, 2);
        assert_eq!(short.match_fragment("A slow dolly").unwrap().tier, MatchTier::ExactTail);
    }

    #[test]
    fn test_lowest_index_wins_on_ambiguity() {
        let m = Matcher::new(vec![
            job_with_text(7, "duplicate prompt text"),
            job_with_text(3, "duplicate prompt text"),
        ]);
        assert_eq!(m.match_fragment("duplicate prompt text").unwrap().job.index, 3);
    }
}
