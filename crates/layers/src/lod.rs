//! Level-of-detail policy: how many items may be shown and which ones.
//!
//! `resolve` is a pure function of zoom, interaction state and candidate
//! count, so tiers can be tested without a surface.

use foundation::math::{stable_total_cmp_f64, unit_clamp};
use serde::{Deserialize, Serialize};

/// One zoom tier: zooms strictly below `max_zoom` are capped at `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LodTier {
    pub max_zoom: f64,
    pub cap: usize,
    pub backbone: bool,
}

impl LodTier {
    pub const fn new(max_zoom: f64, cap: usize, backbone: bool) -> Self {
        Self {
            max_zoom,
            cap,
            backbone,
        }
    }
}

pub const DEFAULT_TIERS: [LodTier; 4] = [
    LodTier::new(11.0, 800, true),
    LodTier::new(12.0, 1400, true),
    LodTier::new(13.0, 2400, true),
    LodTier::new(14.0, 4000, false),
];

pub const DEFAULT_INTERACTION_CAP: usize = 500;
pub const DEFAULT_BACKBONE_HEAD_RATIO: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LodPolicy {
    /// Ascending by `max_zoom`.
    pub tiers: Vec<LodTier>,
    pub interaction_cap: usize,
    pub backbone_head_ratio: f64,
}

impl Default for LodPolicy {
    fn default() -> Self {
        Self {
            tiers: DEFAULT_TIERS.to_vec(),
            interaction_cap: DEFAULT_INTERACTION_CAP,
            backbone_head_ratio: DEFAULT_BACKBONE_HEAD_RATIO,
        }
    }
}

/// Which rule produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LodStage {
    Interacting,
    Tier(usize),
    Unbounded,
}

impl std::fmt::Display for LodStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LodStage::Interacting => f.write_str("interacting"),
            LodStage::Tier(i) => write!(f, "tier{i}"),
            LodStage::Unbounded => f.write_str("unbounded"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LodDecision {
    /// `None` when every candidate may be shown.
    pub cap: Option<usize>,
    pub backbone_only: bool,
    pub stage: LodStage,
}

impl LodDecision {
    pub const UNBOUNDED: Self = Self {
        cap: None,
        backbone_only: false,
        stage: LodStage::Unbounded,
    };

    /// Apply the decision to ascending `candidates`; `scores` is indexed by item.
    pub fn apply(&self, candidates: &[u32], scores: &[f64], head_ratio: f64) -> Vec<u32> {
        match self.cap {
            None => candidates.to_vec(),
            Some(cap) if self.backbone_only => {
                select_backbone(candidates, scores, cap, head_ratio)
            }
            Some(cap) => downsample_even(candidates, cap),
        }
    }
}

impl LodPolicy {
    pub fn resolve(&self, zoom: Option<f64>, interacting: bool, total: usize) -> LodDecision {
        let (cap, backbone_only, stage) = if interacting {
            (self.interaction_cap, true, LodStage::Interacting)
        } else {
            let Some(zoom) = zoom.filter(|z| z.is_finite()) else {
                return LodDecision::UNBOUNDED;
            };
            let Some((i, tier)) = self
                .tiers
                .iter()
                .enumerate()
                .find(|(_, t)| zoom < t.max_zoom)
            else {
                return LodDecision::UNBOUNDED;
            };
            (tier.cap, tier.backbone, LodStage::Tier(i))
        };

        if total <= cap {
            return LodDecision {
                cap: None,
                backbone_only: false,
                stage,
            };
        }
        LodDecision {
            cap: Some(cap.max(1)),
            backbone_only,
            stage,
        }
    }
}

fn score_of(scores: &[f64], index: u32) -> f64 {
    scores.get(index as usize).copied().map_or(0.0, unit_clamp)
}

/// Backbone selection: the top `ceil(cap * head_ratio)` candidates by score,
/// then an even stride over the remaining ranked tail.
///
/// Ties rank by ascending index. Returns ascending indices.
pub fn select_backbone(candidates: &[u32], scores: &[f64], cap: usize, head_ratio: f64) -> Vec<u32> {
    if candidates.len() <= cap {
        return candidates.to_vec();
    }
    if cap == 0 {
        return Vec::new();
    }

    let mut ranked = candidates.to_vec();
    ranked.sort_by(|a, b| {
        stable_total_cmp_f64(score_of(scores, *b), score_of(scores, *a)).then(a.cmp(b))
    });

    let head = ((cap as f64 * unit_clamp(head_ratio)).ceil() as usize).min(cap);
    let mut out: Vec<u32> = ranked[..head].to_vec();

    let tail = &ranked[head..];
    let rest = cap - head;
    // tail.len() > rest here, so the picks are strictly increasing.
    for k in 0..rest {
        let pos = k * tail.len() / rest;
        out.push(tail[pos]);
    }

    out.sort_unstable();
    out
}

/// Evenly strided subset of `candidates` of at most `cap` items.
pub fn downsample_even(candidates: &[u32], cap: usize) -> Vec<u32> {
    if candidates.len() <= cap {
        return candidates.to_vec();
    }
    let step = candidates.len() as f64 / cap as f64;
    let mut out = Vec::with_capacity(cap);
    let mut last: Option<usize> = None;
    for k in 0..cap {
        let pos = ((k as f64 * step).floor() as usize).min(candidates.len() - 1);
        if last == Some(pos) {
            continue;
        }
        last = Some(pos);
        out.push(candidates[pos]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{LodDecision, LodPolicy, LodStage, downsample_even, select_backbone};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn zoom_tiers_relax_the_cap() {
        let p = LodPolicy::default();
        let d = p.resolve(Some(10.5), false, 10_000);
        assert_eq!(d.cap, Some(800));
        assert!(d.backbone_only);
        assert_eq!(d.stage, LodStage::Tier(0));

        assert_eq!(p.resolve(Some(11.0), false, 10_000).cap, Some(1400));
        assert_eq!(p.resolve(Some(12.9), false, 10_000).cap, Some(2400));

        let d = p.resolve(Some(13.5), false, 10_000);
        assert_eq!(d.cap, Some(4000));
        assert!(!d.backbone_only);

        assert_eq!(p.resolve(Some(14.0), false, 10_000), LodDecision::UNBOUNDED);
        assert_eq!(p.resolve(None, false, 10_000), LodDecision::UNBOUNDED);
        assert_eq!(p.resolve(Some(f64::NAN), false, 10_000), LodDecision::UNBOUNDED);
    }

    #[test]
    fn interaction_overrides_zoom() {
        let p = LodPolicy::default();
        for zoom in [None, Some(3.0), Some(18.0)] {
            let d = p.resolve(zoom, true, 10_000);
            assert_eq!(d.cap, Some(500));
            assert!(d.backbone_only);
            assert_eq!(d.stage, LodStage::Interacting);
        }
    }

    #[test]
    fn small_candidate_sets_are_not_capped() {
        let p = LodPolicy::default();
        let d = p.resolve(Some(10.0), false, 800);
        assert_eq!(d.cap, None);
        assert_eq!(d.stage, LodStage::Tier(0));
    }

    #[test]
    fn backbone_keeps_head_and_samples_tail() {
        let candidates: Vec<u32> = (0..10).collect();
        // Score rises with index: 9 is best.
        let scores: Vec<f64> = (0..10).map(|i| i as f64 / 10.0).collect();
        let picked = select_backbone(&candidates, &scores, 4, 0.7);
        // head = ceil(2.8) = 3 -> {9, 8, 7}; tail [6..0] sampled once at its start.
        assert_eq!(picked, vec![6, 7, 8, 9]);
    }

    #[test]
    fn backbone_ties_break_by_index() {
        let candidates: Vec<u32> = (0..6).collect();
        let scores = vec![0.5; 6];
        assert_eq!(select_backbone(&candidates, &scores, 2, 1.0), vec![0, 1]);
    }

    #[test]
    fn downsample_strides_evenly() {
        let candidates: Vec<u32> = (100..110).collect();
        assert_eq!(downsample_even(&candidates, 5), vec![100, 102, 104, 106, 108]);
        assert_eq!(downsample_even(&candidates, 20), candidates);
        assert_eq!(downsample_even(&candidates, 0), Vec::<u32>::new());
    }

    proptest! {
        #[test]
        fn cap_is_respected_and_head_is_kept(
            scores in proptest::collection::vec(0.0f64..1.0, 1..300),
            cap in 1usize..120,
        ) {
            let candidates: Vec<u32> = (0..scores.len() as u32).collect();

            let picked = select_backbone(&candidates, &scores, cap, 0.7);
            prop_assert!(picked.len() <= cap);
            prop_assert!(picked.windows(2).all(|w| w[0] < w[1]));

            let mut ranked = candidates.clone();
            ranked.sort_by(|a, b| {
                scores[*b as usize].total_cmp(&scores[*a as usize]).then(a.cmp(b))
            });
            let head = ((cap as f64 * 0.7).ceil() as usize).min(cap).min(ranked.len());
            for idx in &ranked[..head] {
                prop_assert!(picked.contains(idx));
            }

            let even = downsample_even(&candidates, cap);
            prop_assert!(even.len() <= cap);
            prop_assert!(even.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
