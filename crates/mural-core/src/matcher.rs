use log::debug;
use serde::{Deserialize, Serialize};

use crate::codec::{Descriptor, FeatureSet};
use crate::error::RelocalizationError;
use crate::fingerprint::Fingerprint;

/// Distance below which a stored feature counts as re-observed for
/// [`match_progress`].
pub const PROGRESS_GOOD_DISTANCE: u32 = 60;

/// Pairing of a stored fingerprint feature with a live feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorMatch {
    pub stored_idx: usize,
    pub live_idx: usize,
    /// Hamming distance between the two descriptors.
    pub distance: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Lower bound of the adaptive distance threshold.
    pub distance_floor: u32,
    /// The threshold is `max(distance_floor, distance_multiplier * min_distance)`.
    pub distance_multiplier: f32,
    /// Optional absolute cap applied on top of the adaptive threshold.
    pub max_distance: Option<u32>,
    /// Keep only mutually-best pairs.
    pub cross_check: bool,
    /// Optional Lowe ratio test on best / second-best distance.
    pub ratio_threshold: Option<f32>,
    /// Fewer surviving matches than this is reported as insufficient.
    pub min_matches: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            distance_floor: 30,
            distance_multiplier: 3.0,
            max_distance: None,
            cross_check: false,
            ratio_threshold: None,
            min_matches: 20,
        }
    }
}

/// Brute-force Hamming matcher from stored descriptors to live descriptors.
#[derive(Debug, Clone, Default)]
pub struct HammingMatcher {
    config: MatcherConfig,
}

#[derive(Debug, Clone, Copy)]
struct Nearest {
    idx: usize,
    best: u32,
    second: u32,
}

impl HammingMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Matches every stored descriptor to its nearest live descriptor and
    /// keeps the pairs under the adaptive threshold. Output is ordered by
    /// stored index.
    pub fn match_features(
        &self,
        live: &FeatureSet,
        stored: &Fingerprint,
    ) -> Result<Vec<DescriptorMatch>, RelocalizationError> {
        let matches = self.filtered_matches(live, stored);
        if matches.len() < self.config.min_matches {
            debug!(
                target: "mural_core::matcher",
                "only {} matches survived (need {})",
                matches.len(),
                self.config.min_matches
            );
            return Err(RelocalizationError::InsufficientMatches {
                found: matches.len(),
                required: self.config.min_matches,
            });
        }
        Ok(matches)
    }

    /// Like [`Self::match_features`] without the minimum-count gate.
    pub fn filtered_matches(&self, live: &FeatureSet, stored: &Fingerprint) -> Vec<DescriptorMatch> {
        if live.is_empty() || stored.is_empty() {
            return Vec::new();
        }
        let live_desc: Vec<&Descriptor> = live.iter().map(|f| &f.descriptor).collect();
        let stored_desc: Vec<&Descriptor> = stored.descriptors().collect();

        let forward: Vec<Nearest> = stored_desc
            .iter()
            .filter_map(|d| nearest(d, &live_desc))
            .collect();
        let backward: Option<Vec<Nearest>> = self.config.cross_check.then(|| {
            live_desc
                .iter()
                .filter_map(|d| nearest(d, &stored_desc))
                .collect()
        });

        let Some(threshold) = self.threshold(forward.iter().map(|n| n.best)) else {
            return Vec::new();
        };

        let matches: Vec<DescriptorMatch> = forward
            .iter()
            .enumerate()
            .filter(|(_, n)| n.best <= threshold)
            .filter(|(_, n)| self.passes_ratio(n))
            .filter(|(stored_idx, n)| match &backward {
                Some(back) => back[n.idx].idx == *stored_idx,
                None => true,
            })
            .map(|(stored_idx, n)| DescriptorMatch {
                stored_idx,
                live_idx: n.idx,
                distance: n.best,
            })
            .collect();

        debug!(
            target: "mural_core::matcher",
            "matched {} of {} stored descriptors against {} live (threshold {})",
            matches.len(),
            stored_desc.len(),
            live_desc.len(),
            threshold
        );
        matches
    }

    /// Adaptive acceptance distance for a set of nearest-neighbour distances.
    pub fn threshold(&self, distances: impl Iterator<Item = u32>) -> Option<u32> {
        let min = distances.min()?;
        let adaptive = (self.config.distance_multiplier * min as f32).floor() as u32;
        let threshold = adaptive.max(self.config.distance_floor);
        Some(match self.config.max_distance {
            Some(cap) => threshold.min(cap),
            None => threshold,
        })
    }

    fn passes_ratio(&self, n: &Nearest) -> bool {
        match self.config.ratio_threshold {
            Some(ratio) if n.second != u32::MAX => (n.best as f32) < ratio * n.second as f32,
            _ => true,
        }
    }
}

/// Nearest neighbour by Hamming distance; ties keep the lowest index.
fn nearest(query: &Descriptor, train: &[&Descriptor]) -> Option<Nearest> {
    let mut found: Option<Nearest> = None;
    for (idx, candidate) in train.iter().enumerate() {
        let distance = query.hamming(candidate);
        found = Some(match found {
            None => Nearest {
                idx,
                best: distance,
                second: u32::MAX,
            },
            Some(n) if distance < n.best => Nearest {
                idx,
                best: distance,
                second: n.best,
            },
            Some(n) => Nearest {
                second: n.second.min(distance),
                ..n
            },
        });
    }
    found
}

/// Fraction of stored features whose nearest live descriptor lies within
/// `good_distance`. Used for "how much of the surface is in view" feedback.
pub fn match_progress(live: &FeatureSet, stored: &Fingerprint, good_distance: u32) -> f32 {
    if stored.is_empty() || live.is_empty() {
        return 0.0;
    }
    let live_desc: Vec<&Descriptor> = live.iter().map(|f| &f.descriptor).collect();
    let good = stored
        .descriptors()
        .filter_map(|d| nearest(d, &live_desc))
        .filter(|n| n.best < good_distance)
        .count();
    (good as f32 / stored.len() as f32).clamp(0.0, 1.0)
}
