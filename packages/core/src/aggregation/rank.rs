//! Severity tiers and the sortable rank derived from bucket scores.
//!
//! Every tier has a floor of `1000^k`. A bucket contributes
//! `floor * (1 + |score|)`, which is at most twice its tier floor, so a single
//! contribution always outranks any single contribution of a lower tier.
//!
//! Entities are compared on per-tier bucket counts first, highest tier first,
//! so no number of lower-tier buckets can outrank one higher-tier bucket. The
//! summed contribution only breaks ties between equal counts.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

pub const DEFAULT_YELLOW_THRESHOLD: f64 = 0.9999;
pub const DEFAULT_RED_THRESHOLD: f64 = 0.99999;

const TIER_BASE: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub yellow: f64,
    pub red: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            yellow: DEFAULT_YELLOW_THRESHOLD,
            red: DEFAULT_RED_THRESHOLD,
        }
    }
}

/// Ordered lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Empty,
    GreenProbation,
    YellowProbation,
    RedProbation,
    Green,
    Yellow,
    Red,
}

impl Severity {
    /// Classify a bucket score; negative scores are probationary.
    pub fn of(score: Option<f64>, thresholds: &Thresholds) -> Self {
        let Some(score) = score.filter(|s| s.is_finite()) else {
            return Severity::Empty;
        };
        let magnitude = score.abs();
        let probation = score.is_sign_negative();

        match (magnitude >= thresholds.red, magnitude >= thresholds.yellow, probation) {
            (true, _, false) => Severity::Red,
            (true, _, true) => Severity::RedProbation,
            (false, true, false) => Severity::Yellow,
            (false, true, true) => Severity::YellowProbation,
            (false, false, false) => Severity::Green,
            (false, false, true) => Severity::GreenProbation,
        }
    }

    /// Lowest rank value a single contribution of this tier can have.
    pub fn floor(self) -> f64 {
        match self {
            Severity::Empty => 0.0,
            tier => TIER_BASE.powi(tier as i32 - 1),
        }
    }
}

/// Rank contribution of one bucket score.
pub fn rank(score: Option<f64>, thresholds: &Thresholds) -> f64 {
    let tier = Severity::of(score, thresholds);
    match (tier, score) {
        (Severity::Empty, _) | (_, None) => 0.0,
        (tier, Some(score)) => tier.floor() * (1.0 + score.abs()),
    }
}

/// Number of non-empty tiers.
const TIER_COUNT: usize = 6;

/// Sort key for an entity: more buckets in a higher tier first, then higher
/// summed rank, then display name (case-insensitive), with unnamed entities
/// last.
#[derive(Debug, Clone, Serialize)]
pub struct EntityRank {
    /// Bucket counts indexed by `Severity as usize - 1`.
    #[serde(skip)]
    tiers: [u32; TIER_COUNT],
    pub value: f64,
    pub name: Option<String>,
}

impl EntityRank {
    /// A rank with no tier counts; ordered by `value` and name only.
    pub fn new(value: f64, name: Option<String>) -> Self {
        Self {
            tiers: [0; TIER_COUNT],
            value,
            name,
        }
    }

    pub fn from_scores<I>(scores: I, thresholds: &Thresholds, name: Option<String>) -> Self
    where
        I: IntoIterator<Item = Option<f64>>,
    {
        let mut rank_value = 0.0;
        let mut tiers = [0; TIER_COUNT];
        for score in scores {
            let tier = Severity::of(score, thresholds);
            if tier == Severity::Empty {
                continue;
            }
            tiers[tier as usize - 1] += 1;
            rank_value += rank(score, thresholds);
        }
        Self {
            tiers,
            value: rank_value,
            name,
        }
    }

    pub fn count(&self, tier: Severity) -> u32 {
        match tier {
            Severity::Empty => 0,
            tier => self.tiers[tier as usize - 1],
        }
    }
}

impl Ord for EntityRank {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_tier = self
            .tiers
            .iter()
            .zip(other.tiers.iter())
            .rev()
            .map(|(mine, theirs)| theirs.cmp(mine))
            .find(|ord| ord.is_ne())
            .unwrap_or(Ordering::Equal);

        by_tier
            .then_with(|| other.value.total_cmp(&self.value))
            .then_with(|| match (&self.name, &other.name) {
                (Some(a), Some(b)) => a.to_lowercase().cmp(&b.to_lowercase()),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
    }
}

impl PartialOrd for EntityRank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for EntityRank {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EntityRank {}
