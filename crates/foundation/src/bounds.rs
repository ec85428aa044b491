/// Axis-aligned geographic bounding box in degrees.
///
/// Convention: `min_lng <= max_lng` and `min_lat <= max_lat` for a valid box.
/// Boxes crossing the antimeridian are not represented; callers split them.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GeoRect {
    pub min_lng: f64,
    pub min_lat: f64,
    pub max_lng: f64,
    pub max_lat: f64,
}

impl GeoRect {
    pub fn new(min_lng: f64, min_lat: f64, max_lng: f64, max_lat: f64) -> Self {
        Self {
            min_lng,
            min_lat,
            max_lng,
            max_lat,
        }
    }

    /// Bounding box of a set of `(lng, lat)` points.
    ///
    /// Non-finite coordinates are skipped. Returns `None` if no usable point remains.
    pub fn from_points(points: impl IntoIterator<Item = (f64, f64)>) -> Option<Self> {
        let mut out: Option<Self> = None;
        for (lng, lat) in points {
            if !lng.is_finite() || !lat.is_finite() {
                continue;
            }
            out = Some(match out {
                None => Self::new(lng, lat, lng, lat),
                Some(r) => Self::new(
                    r.min_lng.min(lng),
                    r.min_lat.min(lat),
                    r.max_lng.max(lng),
                    r.max_lat.max(lat),
                ),
            });
        }
        out
    }

    pub fn is_valid(&self) -> bool {
        self.min_lng.is_finite()
            && self.min_lat.is_finite()
            && self.max_lng.is_finite()
            && self.max_lat.is_finite()
            && self.min_lng <= self.max_lng
            && self.min_lat <= self.max_lat
    }

    pub fn width(&self) -> f64 {
        (self.max_lng - self.min_lng).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.max_lat - self.min_lat).max(0.0)
    }

    /// Closed-interval overlap test; touching edges count as intersecting.
    pub fn intersects(&self, other: &GeoRect) -> bool {
        !(other.min_lng > self.max_lng
            || other.max_lng < self.min_lng
            || other.min_lat > self.max_lat
            || other.max_lat < self.min_lat)
    }

    pub fn contains_point(&self, lng: f64, lat: f64) -> bool {
        lng >= self.min_lng && lng <= self.max_lng && lat >= self.min_lat && lat <= self.max_lat
    }

    pub fn union(&self, other: &GeoRect) -> GeoRect {
        GeoRect::new(
            self.min_lng.min(other.min_lng),
            self.min_lat.min(other.min_lat),
            self.max_lng.max(other.max_lng),
            self.max_lat.max(other.max_lat),
        )
    }

    /// Grow the box on every side by `ratio` of its own extent.
    pub fn padded(&self, ratio: f64) -> GeoRect {
        if !(ratio.is_finite() && ratio > 0.0) {
            return *self;
        }
        let dx = self.width() * ratio;
        let dy = self.height() * ratio;
        GeoRect::new(
            self.min_lng - dx,
            self.min_lat - dy,
            self.max_lng + dx,
            self.max_lat + dy,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::GeoRect;

    #[test]
    fn from_points_skips_non_finite() {
        let r = GeoRect::from_points([(1.0, 2.0), (f64::NAN, 0.0), (3.0, -1.0)]).unwrap();
        assert_eq!(r, GeoRect::new(1.0, -1.0, 3.0, 2.0));
        assert!(GeoRect::from_points([(f64::INFINITY, 0.0)]).is_none());
    }

    #[test]
    fn touching_edges_intersect() {
        let a = GeoRect::new(0.0, 0.0, 1.0, 1.0);
        let b = GeoRect::new(1.0, 0.5, 2.0, 2.0);
        let c = GeoRect::new(1.01, 0.0, 2.0, 1.0);
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn inverted_box_is_invalid() {
        assert!(!GeoRect::new(2.0, 0.0, 1.0, 1.0).is_valid());
        assert!(!GeoRect::new(0.0, f64::NAN, 1.0, 1.0).is_valid());
        assert!(GeoRect::new(0.0, 0.0, 0.0, 0.0).is_valid());
    }

    #[test]
    fn padding_grows_symmetrically() {
        let r = GeoRect::new(0.0, 0.0, 2.0, 1.0).padded(0.5);
        assert_eq!(r, GeoRect::new(-1.0, -0.5, 3.0, 1.5));
    }
}
