use std::collections::BTreeMap;

use foundation::bounds::GeoRect;
use foundation::ids::GenerationKey;
use tracing::debug;

use crate::visible_set::VisibleSet;

/// Default grid cell edge in degrees (roughly 500 m at the equator).
pub const DEFAULT_CELL_SIZE_DEG: f64 = 0.0045;

/// Items covering more cells than this are kept in the loose bucket instead.
pub const MAX_CELLS_PER_ITEM: u64 = 4096;

type CellKey = (i64, i64);

/// Uniform-grid spatial index over item bounding boxes.
///
/// Queries return a superset of the items whose boxes intersect the viewport:
/// an item is appended to every cell its box covers, and items without a
/// usable box ("loose" items) are part of every result. Callers re-check
/// exact intersection against each item's own box.
///
/// Ordering contract:
/// - `query_candidates` returns indices in ascending order, without duplicates.
#[derive(Debug, Clone)]
pub struct GridIndex {
    generation: GenerationKey,
    cell_size_deg: f64,
    item_count: usize,
    cells: BTreeMap<CellKey, Vec<u32>>,
    loose: Vec<u32>,
    extent: Option<GeoRect>,
}

impl GridIndex {
    pub fn build(
        items: impl IntoIterator<Item = (u32, Option<GeoRect>)>,
        generation: GenerationKey,
        cell_size_deg: f64,
    ) -> Self {
        let cell_size_deg = if cell_size_deg.is_finite() && cell_size_deg > 0.0 {
            cell_size_deg
        } else {
            DEFAULT_CELL_SIZE_DEG
        };

        let mut index = Self {
            generation,
            cell_size_deg,
            item_count: 0,
            cells: BTreeMap::new(),
            loose: Vec::new(),
            extent: None,
        };

        for (item, bounds) in items {
            index.item_count += 1;
            let Some(rect) = bounds.filter(GeoRect::is_valid) else {
                index.loose.push(item);
                continue;
            };
            index.extent = Some(match index.extent {
                Some(e) => e.union(&rect),
                None => rect,
            });

            let (x0, y0, x1, y1) = index.cell_range(&rect);
            if cell_count(x0, y0, x1, y1) > MAX_CELLS_PER_ITEM {
                index.loose.push(item);
                continue;
            }
            for x in x0..=x1 {
                for y in y0..=y1 {
                    index.cells.entry((x, y)).or_default().push(item);
                }
            }
        }

        index
    }

    pub fn generation(&self) -> &GenerationKey {
        &self.generation
    }

    pub fn item_count(&self) -> usize {
        self.item_count
    }

    pub fn cell_size_deg(&self) -> f64 {
        self.cell_size_deg
    }

    pub fn occupied_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn loose(&self) -> &[u32] {
        &self.loose
    }

    /// Aggregate box of every item with a valid box.
    pub fn extent(&self) -> Option<GeoRect> {
        self.extent
    }

    /// O(1) coarse check: `false` only when no item can be in `viewport`.
    pub fn may_intersect(&self, viewport: &GeoRect) -> bool {
        if !self.loose.is_empty() {
            return true;
        }
        match self.extent {
            Some(extent) => !viewport.is_valid() || extent.intersects(viewport),
            None => false,
        }
    }

    /// Candidate items for `viewport`, always including loose items.
    ///
    /// A malformed viewport degrades to every indexed item.
    pub fn query_candidates(&self, viewport: &GeoRect) -> Vec<u32> {
        let mut hits = VisibleSet::new();
        hits.extend(self.loose.iter().copied());

        if !viewport.is_valid() {
            for bucket in self.cells.values() {
                hits.extend(bucket.iter().copied());
            }
            return hits.to_vec();
        }

        let Some(extent) = self.extent else {
            return hits.to_vec();
        };
        if !extent.intersects(viewport) {
            return hits.to_vec();
        }

        // Clip to the data extent so the cell range stays bounded.
        let clipped = GeoRect::new(
            viewport.min_lng.max(extent.min_lng),
            viewport.min_lat.max(extent.min_lat),
            viewport.max_lng.min(extent.max_lng),
            viewport.max_lat.min(extent.max_lat),
        );
        let (x0, y0, x1, y1) = self.cell_range(&clipped);

        if cell_count(x0, y0, x1, y1) > self.cells.len() as u64 {
            for (&(x, y), bucket) in &self.cells {
                if x >= x0 && x <= x1 && y >= y0 && y <= y1 {
                    hits.extend(bucket.iter().copied());
                }
            }
        } else {
            for x in x0..=x1 {
                for y in y0..=y1 {
                    if let Some(bucket) = self.cells.get(&(x, y)) {
                        hits.extend(bucket.iter().copied());
                    }
                }
            }
        }

        hits.to_vec()
    }

    fn cell_range(&self, rect: &GeoRect) -> (i64, i64, i64, i64) {
        (
            cell_coord(rect.min_lng, self.cell_size_deg),
            cell_coord(rect.min_lat, self.cell_size_deg),
            cell_coord(rect.max_lng, self.cell_size_deg),
            cell_coord(rect.max_lat, self.cell_size_deg),
        )
    }
}

fn cell_coord(deg: f64, cell_size_deg: f64) -> i64 {
    (deg / cell_size_deg).floor() as i64
}

fn cell_count(x0: i64, y0: i64, x1: i64, y1: i64) -> u64 {
    let w = (x1 - x0 + 1).max(0) as u64;
    let h = (y1 - y0 + 1).max(0) as u64;
    w.saturating_mul(h)
}

/// Holds the grid index for the live dataset and rebuilds it only when the
/// generation key or item count changes.
#[derive(Debug, Clone)]
pub struct SpatialIndexCache {
    cell_size_deg: f64,
    index: Option<GridIndex>,
    rebuilds: u64,
}

impl SpatialIndexCache {
    pub fn new(cell_size_deg: f64) -> Self {
        Self {
            cell_size_deg,
            index: None,
            rebuilds: 0,
        }
    }

    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    pub fn current(&self) -> Option<&GridIndex> {
        self.index.as_ref()
    }

    pub fn invalidate(&mut self) {
        self.index = None;
    }

    /// Returns an index trusted for `generation`; item `i` has box `bounds[i]`.
    pub fn ensure(&mut self, bounds: &[Option<GeoRect>], generation: &GenerationKey) -> &GridIndex {
        let stale = self
            .index
            .as_ref()
            .is_none_or(|ix| ix.generation() != generation || ix.item_count() != bounds.len());
        if stale {
            self.index = None;
        }

        let cell_size_deg = self.cell_size_deg;
        self.index.get_or_insert_with(|| {
            self.rebuilds += 1;
            let index = GridIndex::build(
                bounds
                    .iter()
                    .enumerate()
                    .map(|(i, b)| (i as u32, *b)),
                generation.clone(),
                cell_size_deg,
            );
            debug!(
                generation = %generation,
                items = index.item_count(),
                cells = index.occupied_cells(),
                loose = index.loose().len(),
                "spatial index rebuilt"
            );
            index
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{GridIndex, MAX_CELLS_PER_ITEM, SpatialIndexCache};
    use foundation::bounds::GeoRect;
    use foundation::ids::GenerationKey;
    use proptest::prelude::*;

    fn gen_key(s: &str) -> GenerationKey {
        GenerationKey::new(s)
    }

    fn sample() -> Vec<(u32, Option<GeoRect>)> {
        vec![
            (0, Some(GeoRect::new(0.0, 0.0, 0.01, 0.01))),
            (1, Some(GeoRect::new(1.0, 1.0, 1.002, 1.002))),
            (2, None),
            (3, Some(GeoRect::new(0.005, 0.005, 0.02, 0.006))),
            (4, Some(GeoRect::new(5.0, 5.0, 4.0, 6.0))),
        ]
    }

    #[test]
    fn query_includes_loose_and_overlapping_items() {
        let index = GridIndex::build(sample(), gen_key("g1"), 0.01);
        let hits = index.query_candidates(&GeoRect::new(0.0, 0.0, 0.004, 0.004));
        // 0 overlaps, 3 shares the cell, 2 and the inverted 4 are loose.
        assert_eq!(hits, vec![0, 2, 3, 4]);
        assert_eq!(index.loose(), &[2, 4]);
    }

    #[test]
    fn extent_rejects_far_viewports_only_without_loose_items() {
        let bounded: Vec<_> = sample().into_iter().filter(|(_, b)| b.is_some_and(|r| r.is_valid())).collect();
        let index = GridIndex::build(bounded, gen_key("g"), 0.01);
        let far = GeoRect::new(50.0, 50.0, 51.0, 51.0);
        assert!(!index.may_intersect(&far));
        assert!(index.query_candidates(&far).is_empty());
        assert!(index.may_intersect(&GeoRect::new(0.9, 0.9, 1.1, 1.1)));

        let with_loose = GridIndex::build(sample(), gen_key("g"), 0.01);
        assert!(with_loose.may_intersect(&far));
    }

    #[test]
    fn huge_items_go_loose() {
        let huge = GeoRect::new(-90.0, -45.0, 90.0, 45.0);
        let index = GridIndex::build([(7, Some(huge))], gen_key("g"), 0.01);
        assert_eq!(index.loose(), &[7]);
        assert_eq!(index.occupied_cells(), 0);
        assert!((180.0f64 / 0.01) * (90.0 / 0.01) > MAX_CELLS_PER_ITEM as f64);
    }

    #[test]
    fn zoomed_out_viewport_walks_buckets() {
        let index = GridIndex::build(sample(), gen_key("g"), 0.001);
        let world = GeoRect::new(-180.0, -90.0, 180.0, 90.0);
        assert_eq!(index.query_candidates(&world), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cache_rebuilds_on_generation_or_count_change() {
        let bounds = vec![Some(GeoRect::new(0.0, 0.0, 1.0, 1.0)), None];
        let mut cache = SpatialIndexCache::new(0.5);
        cache.ensure(&bounds, &gen_key("a"));
        cache.ensure(&bounds, &gen_key("a"));
        assert_eq!(cache.rebuilds(), 1);

        cache.ensure(&bounds, &gen_key("b"));
        assert_eq!(cache.rebuilds(), 2);

        cache.ensure(&bounds[..1], &gen_key("b"));
        assert_eq!(cache.rebuilds(), 3);
        assert_eq!(cache.current().map(|ix| ix.item_count()), Some(1));
    }

    fn rect() -> impl Strategy<Value = GeoRect> {
        (-1.0f64..1.0, -1.0f64..1.0, 0.0f64..0.3, 0.0f64..0.3)
            .prop_map(|(x, y, w, h)| GeoRect::new(x, y, x + w, y + h))
    }

    proptest! {
        #[test]
        fn candidates_never_miss_intersecting_items(
            boxes in proptest::collection::vec(proptest::option::weighted(0.9, rect()), 0..60),
            viewport in rect(),
            cell in 0.01f64..0.5,
        ) {
            let items: Vec<_> = boxes.iter().enumerate().map(|(i, b)| (i as u32, *b)).collect();
            let index = GridIndex::build(items, gen_key("p"), cell);
            let hits = index.query_candidates(&viewport);
            for (i, b) in boxes.iter().enumerate() {
                let must = match b {
                    Some(r) => r.intersects(&viewport),
                    None => true,
                };
                if must {
                    prop_assert!(hits.contains(&(i as u32)), "missing item {}", i);
                }
            }
            if !hits.is_empty() {
                prop_assert!(index.may_intersect(&viewport));
            }
        }
    }
}
