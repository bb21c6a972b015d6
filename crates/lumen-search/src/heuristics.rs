//! Draft/final variant heuristics.
//!
//! Two independent detectors that look at metadata instead of pixels:
//!
//! - [`FilenamePatternDetector`] pairs `portrait_upscaled.png` with
//!   `portrait.png` when both carry the same seed and model.
//! - [`ParameterGroupDetector`] groups images by generation parameters and
//!   pairs the two members of a group whose resolutions differ by an
//!   upscale-sized factor.
//!
//! Neither detector merges its output with the other or with visual
//! clusters; callers receive each signal on its own.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use lumen_core::defaults::{PROMPT_PREFIX_CHARS, UPSCALE_RATIO_MAX, UPSCALE_RATIO_MIN};
use lumen_core::{
    Error, FingerprintPolicy, GenerationParams, ImageDescriptor, ResolutionAgnosticFingerprint,
    Result, VariantPair, VariantSignal,
};

/// Filename suffixes that mark an upscaled or refined variant.
pub const DEFAULT_VARIANT_SUFFIXES: &[&str] = &[
    "upscaled", "upscale", "hires", "hr", "2x", "x2", "4x", "x4", "scaled", "final", "detailed",
];

/// Linear scale factor between two images: sqrt(final pixels / draft pixels).
pub fn scale_ratio(draft: &GenerationParams, final_: &GenerationParams) -> Option<f64> {
    let (d, f) = (draft.pixels()?, final_.pixels()?);
    if d <= 0 || f <= 0 {
        return None;
    }
    Some((f as f64 / d as f64).sqrt())
}

fn sort_pairs(pairs: &mut Vec<VariantPair>) {
    pairs.sort_by(|x, y| (x.draft_id, x.final_id).cmp(&(y.draft_id, y.final_id)));
    pairs.dedup_by(|x, y| x.draft_id == y.draft_id && x.final_id == y.final_id);
}

// =============================================================================
// FILENAME PATTERN
// =============================================================================

/// Pairs `<stem><sep><suffix>` files with their `<stem>` sibling.
#[derive(Debug, Clone)]
pub struct FilenamePatternDetector {
    pattern: Regex,
}

impl FilenamePatternDetector {
    /// Detector for [`DEFAULT_VARIANT_SUFFIXES`].
    pub fn new() -> Result<Self> {
        Self::with_suffixes(DEFAULT_VARIANT_SUFFIXES)
    }

    /// Detector for a custom suffix list. Suffixes match case-insensitively
    /// after a `-`, `_`, `.` or space separator.
    pub fn with_suffixes<S: AsRef<str>>(suffixes: &[S]) -> Result<Self> {
        let alternatives: Vec<String> = suffixes
            .iter()
            .map(|s| s.as_ref().trim())
            .filter(|s| !s.is_empty())
            .map(regex::escape)
            .collect();
        if alternatives.is_empty() {
            return Err(Error::Config("variant suffix list is empty".into()));
        }
        let pattern = Regex::new(&format!(
            r"(?i)^(?P<base>.+?)[-_. ](?:{})$",
            alternatives.join("|")
        ))
        .map_err(|e| Error::Config(format!("invalid variant suffix pattern: {e}")))?;
        Ok(Self { pattern })
    }

    /// Base stem of a variant stem, or `None` when no suffix matches.
    pub fn base_stem<'a>(&self, stem: &'a str) -> Option<&'a str> {
        self.pattern
            .captures(stem)
            .and_then(|c| c.name("base"))
            .map(|m| m.as_str())
    }

    /// All draft/final pairs among `images`.
    ///
    /// Images without both a seed and a model are ignored. When several
    /// files share the base stem, the lowest id is used as the draft.
    pub fn detect(&self, images: &[ImageDescriptor]) -> Vec<VariantPair> {
        let mut bases: HashMap<(String, i64, &str), &ImageDescriptor> = HashMap::new();
        let mut keyed = Vec::with_capacity(images.len());

        for image in images {
            let (Some(seed), Some(model)) = (image.params.seed, image.params.model.as_deref())
            else {
                continue;
            };
            let Some(stem) = Path::new(&image.filename)
                .file_stem()
                .and_then(|s| s.to_str())
            else {
                continue;
            };
            bases
                .entry((stem.to_lowercase(), seed, model))
                .and_modify(|current| {
                    if image.id < current.id {
                        *current = image;
                    }
                })
                .or_insert(image);
            keyed.push((image, stem, seed, model));
        }

        let mut pairs = Vec::new();
        for (image, stem, seed, model) in keyed {
            let Some(base) = self.base_stem(stem) else {
                continue;
            };
            let Some(draft) = bases.get(&(base.to_lowercase(), seed, model)) else {
                continue;
            };
            if draft.id == image.id {
                continue;
            }
            pairs.push(VariantPair {
                draft_id: draft.id,
                final_id: image.id,
                signal: VariantSignal::FilenamePattern,
                scale_ratio: scale_ratio(&draft.params, &image.params),
            });
        }
        sort_pairs(&mut pairs);
        pairs
    }
}

// =============================================================================
// PARAMETER GROUP
// =============================================================================

/// How images are grouped before looking for an upscale pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterGrouping {
    /// Seed, model and a normalized prompt prefix.
    #[default]
    SeedModelPrompt,
    /// Every generation parameter except resolution.
    ResolutionAgnostic,
}

impl std::str::FromStr for ParameterGrouping {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "seed_model_prompt" | "prompt" => Ok(ParameterGrouping::SeedModelPrompt),
            "resolution_agnostic" | "fingerprint" => Ok(ParameterGrouping::ResolutionAgnostic),
            other => Err(Error::InvalidInput(format!(
                "unknown parameter grouping: {other}"
            ))),
        }
    }
}

/// Lowercase, whitespace-collapsed prefix of a prompt.
pub fn normalize_prompt(prompt: &str, max_chars: usize) -> String {
    prompt
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .chars()
        .take(max_chars)
        .collect()
}

/// Pairs the two members of a parameter group when one is an upscale of the other.
#[derive(Debug, Clone)]
pub struct ParameterGroupDetector {
    pub grouping: ParameterGrouping,
    pub prompt_prefix_chars: usize,
    pub ratio_min: f64,
    pub ratio_max: f64,
}

impl Default for ParameterGroupDetector {
    fn default() -> Self {
        Self {
            grouping: ParameterGrouping::default(),
            prompt_prefix_chars: PROMPT_PREFIX_CHARS,
            ratio_min: UPSCALE_RATIO_MIN,
            ratio_max: UPSCALE_RATIO_MAX,
        }
    }
}

impl ParameterGroupDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grouping(mut self, grouping: ParameterGrouping) -> Self {
        self.grouping = grouping;
        self
    }

    pub fn with_prompt_prefix_chars(mut self, chars: usize) -> Self {
        self.prompt_prefix_chars = chars;
        self
    }

    pub fn with_ratio_range(mut self, min: f64, max: f64) -> Self {
        self.ratio_min = min;
        self.ratio_max = max;
        self
    }

    /// Group key of an image, or `None` when it cannot be grouped.
    pub fn group_key(&self, params: &GenerationParams) -> Option<String> {
        match self.grouping {
            ParameterGrouping::SeedModelPrompt => {
                let seed = params.seed?;
                let model = params.model.as_deref()?.trim();
                let prompt =
                    normalize_prompt(params.prompt.as_deref().unwrap_or(""), self.prompt_prefix_chars);
                Some(format!("{seed}\x1f{model}\x1f{prompt}"))
            }
            ParameterGrouping::ResolutionAgnostic => params
                .has_generation_data()
                .then(|| ResolutionAgnosticFingerprint.fingerprint(params)),
        }
    }

    /// All draft/final pairs among `images`.
    ///
    /// Only groups of exactly two qualify; larger groups are ambiguous.
    pub fn detect(&self, images: &[ImageDescriptor]) -> Vec<VariantPair> {
        let mut groups: HashMap<String, Vec<&ImageDescriptor>> = HashMap::new();
        for image in images {
            if let Some(key) = self.group_key(&image.params) {
                groups.entry(key).or_default().push(image);
            }
        }

        let mut pairs = Vec::new();
        for members in groups.values() {
            let [x, y] = members.as_slice() else {
                continue;
            };
            let (Some(px), Some(py)) = (x.params.pixels(), y.params.pixels()) else {
                continue;
            };
            let (draft, final_) = match px.cmp(&py) {
                std::cmp::Ordering::Less => (x, y),
                std::cmp::Ordering::Greater => (y, x),
                std::cmp::Ordering::Equal => continue,
            };
            let Some(ratio) = scale_ratio(&draft.params, &final_.params) else {
                continue;
            };
            if ratio >= self.ratio_min && ratio <= self.ratio_max {
                pairs.push(VariantPair {
                    draft_id: draft.id,
                    final_id: final_.id,
                    signal: VariantSignal::ParameterGroup,
                    scale_ratio: Some(ratio),
                });
            }
        }
        sort_pairs(&mut pairs);
        pairs
    }
}
