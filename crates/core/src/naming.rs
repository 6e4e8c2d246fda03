//! Deterministic artifact filenames.
//!
//! `<date>_<index:03>_<tail-slug>_<model>_<take:02>_<duration>s.<ext>`

use chrono::NaiveDate;

use crate::config::NamingConfig;

/// Slug used when a tail key normalizes to nothing.
const EMPTY_SLUG: &str = "untitled";

/// Builds artifact filenames for one run.
#[derive(Debug, Clone)]
pub struct ArtifactNamer {
    date: NaiveDate,
    model_tag: String,
    duration_secs: u32,
    extension: String,
    tail_slug_chars: usize,
}

impl ArtifactNamer {
    pub fn new(date: NaiveDate, config: &NamingConfig) -> Self {
        Self {
            date,
            model_tag: config.model_tag.clone(),
            duration_secs: config.duration_secs,
            extension: config.extension.clone(),
            tail_slug_chars: config.tail_slug_chars,
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// Filename for take `take_index` of job `job_index`.
    pub fn filename(&self, job_index: u32, tail_key: &str, take_index: u32) -> String {
        format!(
            "{}_{:03}_{}_{}_{:02}_{}s.{}",
            self.date.format("%Y-%m-%d"),
            job_index,
            self.tail_slug(tail_key),
            self.model_tag,
            take_index,
            self.duration_secs,
            self.extension
        )
    }

    /// The last `tail_slug_chars` characters of the tail key, starting at a
    /// word boundary and without dangling hyphens.
    fn tail_slug(&self, tail_key: &str) -> String {
        let chars: Vec<char> = tail_key
            .chars()
            .map(|c| if c == '_' || c == '/' || c == '.' { '-' } else { c })
            .collect();
        let mut start = chars.len().saturating_sub(self.tail_slug_chars);
        // A cut inside a word drops the partial word, unless it is the only one
        if start > 0 && chars[start - 1] != '-' {
            if let Some(hyphen) = chars[start..].iter().position(|&c| c == '-') {
                start += hyphen + 1;
            }
        }
        let slug: String = chars[start..].iter().collect();
        let slug = slug.trim_matches('-');
        if slug.is_empty() {
            EMPTY_SLUG.to_string()
        } else {
            slug.to_string()
        }
    }
}

/// Name of the plain-text record written when a download cannot be fetched.
pub fn fallback_filename(target_filename: &str) -> String {
    let stem = match target_filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => target_filename,
    };
    format!("{}.url.txt", stem)
}
