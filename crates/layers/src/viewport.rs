use foundation::bounds::GeoRect;
use scene::spatial::GridIndex;
use scene::visible_set::VisibleSet;

use crate::item::ItemStore;
use crate::lod::{LodDecision, LodPolicy};

pub const DEFAULT_VIEWPORT_PADDING_RATIO: f64 = 0.15;

/// Current map view as reported by the host.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Viewport {
    pub rect: GeoRect,
    pub zoom: f64,
}

impl Viewport {
    pub fn new(rect: GeoRect, zoom: f64) -> Self {
        Self { rect, zoom }
    }

    /// A viewport is usable when its rectangle is well formed.
    pub fn is_usable(&self) -> bool {
        self.rect.is_valid()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    pub desired: VisibleSet,
    pub decision: LodDecision,
    /// Live items in view before the LOD cap.
    pub candidates: usize,
}

/// Spatial culling followed by the LOD cap.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewportFilter {
    pub padding_ratio: f64,
    pub lod: LodPolicy,
}

impl Default for ViewportFilter {
    fn default() -> Self {
        Self {
            padding_ratio: DEFAULT_VIEWPORT_PADDING_RATIO,
            lod: LodPolicy::default(),
        }
    }
}

impl ViewportFilter {
    pub fn new(padding_ratio: f64, lod: LodPolicy) -> Self {
        Self { padding_ratio, lod }
    }

    /// Desired visible set for the current view.
    ///
    /// Without a usable viewport every live item is a candidate and zoom is
    /// treated as unknown.
    pub fn desired<H: Clone>(
        &self,
        viewport: Option<&Viewport>,
        interacting: bool,
        items: &ItemStore<H>,
        index: &GridIndex,
    ) -> FilterOutcome {
        let candidates: Vec<u32> = match viewport.filter(|v| v.is_usable()) {
            None => items.live_indices().collect(),
            Some(v) => {
                let padded = v.rect.padded(self.padding_ratio);
                if index.may_intersect(&padded) {
                    index
                        .query_candidates(&padded)
                        .into_iter()
                        .filter(|i| items.is_live(*i))
                        .filter(|i| {
                            items
                                .item_bounds(*i)
                                .is_none_or(|b| b.intersects(&padded))
                        })
                        .collect()
                } else {
                    Vec::new()
                }
            }
        };

        let zoom = viewport.filter(|v| v.is_usable()).map(|v| v.zoom);
        let decision = self.lod.resolve(zoom, interacting, candidates.len());
        let selected = decision.apply(&candidates, items.scores(), self.lod.backbone_head_ratio);

        FilterOutcome {
            desired: selected.into_iter().collect(),
            decision,
            candidates: candidates.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Viewport, ViewportFilter};
    use crate::item::{ItemStore, OverlayItem};
    use crate::lod::{LodPolicy, LodStage, LodTier};
    use foundation::bounds::GeoRect;
    use foundation::ids::GenerationKey;
    use pretty_assertions::assert_eq;
    use scene::spatial::GridIndex;

    fn store() -> ItemStore<u64> {
        // Items 0..4 along the equator at 1 degree spacing, plus one without bounds.
        let mut items: Vec<OverlayItem<u64>> = (0..5u32)
            .map(|i| OverlayItem {
                index: i,
                bounds: Some(GeoRect::new(i as f64, 0.0, i as f64 + 0.5, 0.5)),
                score: i as f64 / 10.0,
                handle: i as u64,
            })
            .collect();
        items.push(OverlayItem {
            index: 5,
            bounds: None,
            score: 0.0,
            handle: 5,
        });
        let mut s = ItemStore::new();
        s.load(GenerationKey::new("g"), items).unwrap();
        s
    }

    fn index_for(s: &ItemStore<u64>) -> GridIndex {
        GridIndex::build(
            s.bounds().iter().enumerate().map(|(i, b)| (i as u32, *b)),
            s.generation().clone(),
            0.25,
        )
    }

    #[test]
    fn no_viewport_means_all_live_items() {
        let mut s = store();
        s.mark_broken(2);
        let index = index_for(&s);
        let out = ViewportFilter::default().desired(None, false, &s, &index);
        assert_eq!(out.desired.to_vec(), vec![0, 1, 3, 4, 5]);
        assert_eq!(out.decision.stage, LodStage::Unbounded);
    }

    #[test]
    fn viewport_culls_exactly_and_keeps_loose_items() {
        let s = store();
        let index = index_for(&s);
        let filter = ViewportFilter::new(0.0, LodPolicy::default());
        let vp = Viewport::new(GeoRect::new(1.2, 0.1, 2.2, 0.4), 15.0);
        let out = filter.desired(Some(&vp), false, &s, &index);
        assert_eq!(out.desired.to_vec(), vec![1, 2, 5]);
        assert_eq!(out.candidates, 3);
    }

    #[test]
    fn padding_widens_the_query() {
        let s = store();
        let index = index_for(&s);
        let vp = Viewport::new(GeoRect::new(1.6, 0.1, 1.9, 0.4), 15.0);
        let tight = ViewportFilter::new(0.0, LodPolicy::default()).desired(Some(&vp), false, &s, &index);
        assert_eq!(tight.desired.to_vec(), vec![5]);
        let padded = ViewportFilter::new(1.0, LodPolicy::default()).desired(Some(&vp), false, &s, &index);
        assert_eq!(padded.desired.to_vec(), vec![1, 2, 5]);
    }

    #[test]
    fn lod_cap_prefers_high_scores() {
        let s = store();
        let index = index_for(&s);
        let lod = LodPolicy {
            tiers: vec![LodTier::new(20.0, 2, true)],
            interaction_cap: 1,
            backbone_head_ratio: 1.0,
        };
        let filter = ViewportFilter::new(0.0, lod);
        let vp = Viewport::new(GeoRect::new(-1.0, -1.0, 10.0, 1.0), 12.0);
        let out = filter.desired(Some(&vp), false, &s, &index);
        assert_eq!(out.desired.to_vec(), vec![3, 4]);

        let out = filter.desired(Some(&vp), true, &s, &index);
        assert_eq!(out.desired.to_vec(), vec![4]);
        assert_eq!(out.decision.stage, LodStage::Interacting);
    }

    #[test]
    fn malformed_viewport_degrades_to_all_items() {
        let s = store();
        let index = index_for(&s);
        let vp = Viewport::new(GeoRect::new(5.0, 0.0, 1.0, f64::NAN), 3.0);
        let out = ViewportFilter::default().desired(Some(&vp), false, &s, &index);
        assert_eq!(out.desired.len(), 6);
        assert_eq!(out.decision.cap, None);
    }
}
