//! Road-network GeoJSON: analytic edges as overlay items.
//!
//! Edges are `LineString` / `MultiLineString` features carrying analytic
//! properties such as `choice_global`, `integration_r800`,
//! `connectivity_score` or `rank_quantile_choice`.

use std::fmt;
use std::str::FromStr;

use foundation::bounds::GeoRect;
use foundation::ids::GenerationKey;
use foundation::math::unit_clamp;
use layers::item::OverlayItem;
use serde_json::{Map, Value, json};

pub const GLOBAL_RADIUS: &str = "global";

#[derive(Debug, thiserror::Error)]
pub enum RoadNetworkError {
    #[error("invalid road network json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("expected GeoJSON FeatureCollection")]
    NotAFeatureCollection,
    #[error("invalid feature at index {index}: {reason}")]
    InvalidFeature { index: usize, reason: String },
    #[error("unknown metric {0:?}")]
    UnknownMetric(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Metric {
    Choice,
    Integration,
    Accessibility,
    Connectivity,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::Choice,
        Metric::Integration,
        Metric::Accessibility,
        Metric::Connectivity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Choice => "choice",
            Metric::Integration => "integration",
            Metric::Accessibility => "accessibility",
            Metric::Connectivity => "connectivity",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = RoadNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Metric::ALL
            .into_iter()
            .find(|m| m.as_str() == wanted)
            .ok_or_else(|| RoadNetworkError::UnknownMetric(s.to_string()))
    }
}

/// A metric plus the radius label its raw column is read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricSelection {
    pub metric: Metric,
    pub radius: String,
}

impl MetricSelection {
    pub fn new(metric: Metric) -> Self {
        Self {
            metric,
            radius: GLOBAL_RADIUS.to_string(),
        }
    }

    pub fn with_radius(mut self, radius: impl Into<String>) -> Self {
        let radius = radius.into();
        self.radius = if radius.trim().is_empty() {
            GLOBAL_RADIUS.to_string()
        } else {
            radius.trim().to_ascii_lowercase()
        };
        self
    }

    /// `choice`, `choice@r800`.
    pub fn parse(s: &str) -> Result<Self, RoadNetworkError> {
        match s.split_once('@') {
            Some((metric, radius)) => Ok(Self::new(metric.parse()?).with_radius(radius)),
            None => Ok(Self::new(s.parse()?)),
        }
    }

    pub fn label(&self) -> String {
        format!("{}@{}", self.metric, self.radius)
    }

    fn rank_key(&self) -> String {
        format!("rank_quantile_{}", self.metric)
    }

    /// Raw property keys in lookup order.
    fn raw_keys(&self) -> Vec<String> {
        let m = self.metric.as_str();
        let mut keys = Vec::with_capacity(3);
        if self.radius != GLOBAL_RADIUS {
            keys.push(format!("{m}_{}", self.radius));
        }
        keys.push(format!("{m}_{GLOBAL_RADIUS}"));
        keys.push(format!("{m}_score"));
        keys
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoadEdge {
    pub id: String,
    /// Polylines as `[lng, lat]`; non-finite positions are dropped.
    pub lines: Vec<Vec<[f64; 2]>>,
    pub properties: Map<String, Value>,
}

impl RoadEdge {
    /// `None` when no usable position survived parsing.
    pub fn bounds(&self) -> Option<GeoRect> {
        GeoRect::from_points(self.lines.iter().flatten().map(|p| (p[0], p[1])))
    }

    fn number(&self, key: &str) -> Option<f64> {
        let v = match self.properties.get(key)? {
            Value::Number(n) => n.as_f64()?,
            Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        v.is_finite().then_some(v)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoadNetwork {
    pub edges: Vec<RoadEdge>,
}

impl RoadNetwork {
    pub fn from_geojson_str(payload: &str) -> Result<Self, RoadNetworkError> {
        let value: Value = serde_json::from_str(payload)?;
        Self::from_geojson_value(&value)
    }

    pub fn from_geojson_value(value: &Value) -> Result<Self, RoadNetworkError> {
        let obj = value
            .as_object()
            .ok_or(RoadNetworkError::NotAFeatureCollection)?;
        if obj.get("type").and_then(Value::as_str) != Some("FeatureCollection") {
            return Err(RoadNetworkError::NotAFeatureCollection);
        }
        let features = obj
            .get("features")
            .and_then(Value::as_array)
            .ok_or(RoadNetworkError::NotAFeatureCollection)?;

        let mut edges = Vec::with_capacity(features.len());
        for (index, feature) in features.iter().enumerate() {
            let invalid = |reason: &str| RoadNetworkError::InvalidFeature {
                index,
                reason: reason.to_string(),
            };
            let feature = feature
                .as_object()
                .ok_or_else(|| invalid("feature must be an object"))?;
            if feature.get("type").and_then(Value::as_str) != Some("Feature") {
                return Err(invalid("feature type must be \"Feature\""));
            }

            let properties = feature
                .get("properties")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let id = match feature.get("id").or_else(|| properties.get("edge_id")) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => index.to_string(),
            };

            edges.push(RoadEdge {
                id,
                lines: feature.get("geometry").map(parse_lines).unwrap_or_default(),
                properties,
            });
        }
        Ok(Self { edges })
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn bounds(&self) -> Vec<Option<GeoRect>> {
        self.edges.iter().map(RoadEdge::bounds).collect()
    }

    /// Per-edge scores in `[0, 1]`.
    ///
    /// A finite `rank_quantile_{metric}` wins. Otherwise the first raw column
    /// found is min-max normalised over every edge that has one. Edges with
    /// nothing usable score 0.
    pub fn scores(&self, selection: &MetricSelection) -> Vec<f64> {
        let rank_key = selection.rank_key();
        let raw_keys = selection.raw_keys();

        let raw: Vec<Option<f64>> = self
            .edges
            .iter()
            .map(|e| raw_keys.iter().find_map(|k| e.number(k)))
            .collect();
        let (lo, hi) = raw
            .iter()
            .flatten()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(*v), hi.max(*v))
            });

        self.edges
            .iter()
            .zip(&raw)
            .map(|(edge, raw)| {
                if let Some(q) = edge.number(&rank_key) {
                    return unit_clamp(q);
                }
                match raw {
                    Some(v) if hi > lo => unit_clamp((v - lo) / (hi - lo)),
                    _ => 0.0,
                }
            })
            .collect()
    }

    /// Content hash of the edge geometry and the selected metric.
    ///
    /// Independent of feature order.
    pub fn fingerprint(&self, selection: &MetricSelection) -> GenerationKey {
        let mut entries: Vec<(&str, String)> = self
            .edges
            .iter()
            .map(|e| (e.id.as_str(), json!(e.lines).to_string()))
            .collect();
        // Duplicate ids fall back to geometry order.
        entries.sort();
        let canonical = json!({
            "metric": selection.label(),
            "edges": entries,
        });
        let hash = blake3::hash(canonical.to_string().as_bytes());
        GenerationKey::new(hash.to_hex().to_string())
    }

    /// Overlay items in feature order; `handle` mints one surface handle per edge.
    pub fn overlay_items<H>(
        &self,
        selection: &MetricSelection,
        mut handle: impl FnMut(u32, &RoadEdge) -> H,
    ) -> Vec<OverlayItem<H>> {
        self.edges
            .iter()
            .zip(self.scores(selection))
            .enumerate()
            .map(|(i, (edge, score))| OverlayItem {
                index: i as u32,
                bounds: edge.bounds(),
                score,
                handle: handle(i as u32, edge),
            })
            .collect()
    }
}

fn parse_position(v: &Value) -> Option<[f64; 2]> {
    let arr = v.as_array()?;
    let lng = arr.first()?.as_f64()?;
    let lat = arr.get(1)?.as_f64()?;
    (lng.is_finite() && lat.is_finite()).then_some([lng, lat])
}

fn parse_line(v: &Value) -> Vec<[f64; 2]> {
    v.as_array()
        .map(|pts| pts.iter().filter_map(parse_position).collect())
        .unwrap_or_default()
}

/// Unusable or unsupported geometry parses to no lines.
fn parse_lines(geometry: &Value) -> Vec<Vec<[f64; 2]>> {
    let Some(obj) = geometry.as_object() else {
        return Vec::new();
    };
    let coords = obj.get("coordinates");
    let lines = match (obj.get("type").and_then(Value::as_str), coords) {
        (Some("LineString"), Some(c)) => vec![parse_line(c)],
        (Some("MultiLineString"), Some(Value::Array(parts))) => {
            parts.iter().map(parse_line).collect()
        }
        _ => Vec::new(),
    };
    lines.into_iter().filter(|l| !l.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::{Metric, MetricSelection, RoadNetwork, RoadNetworkError};
    use foundation::bounds::GeoRect;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            { "type": "Feature", "id": "a",
              "geometry": { "type": "LineString", "coordinates": [[0.0, 0.0], [0.01, 0.02]] },
              "properties": { "choice_global": 10.0, "choice_r800": 4.0, "connectivity_score": 0.4 } },
            { "type": "Feature", "id": "b",
              "geometry": { "type": "MultiLineString", "coordinates": [[[1.0, 1.0], [1.5, 1.0]], [[2.0, 0.5], [2.0, 2.0]]] },
              "properties": { "choice_global": "30", "rank_quantile_integration": 0.9 } },
            { "type": "Feature", "id": "c",
              "geometry": null,
              "properties": { "choice_global": 20.0, "integration_score": 3.0 } }
        ]
    }"#;

    #[test]
    fn parses_edges_and_bounds() {
        let net = RoadNetwork::from_geojson_str(SAMPLE).unwrap();
        assert_eq!(net.len(), 3);
        assert_eq!(
            net.bounds(),
            vec![
                Some(GeoRect::new(0.0, 0.0, 0.01, 0.02)),
                Some(GeoRect::new(1.0, 0.5, 2.0, 2.0)),
                None,
            ]
        );
    }

    #[test]
    fn raw_scores_are_min_max_normalised() {
        let net = RoadNetwork::from_geojson_str(SAMPLE).unwrap();
        let scores = net.scores(&MetricSelection::new(Metric::Choice));
        assert_eq!(scores, vec![0.0, 1.0, 0.5]);

        // r800 exists only on "a"; the others fall back to the global column.
        let local = net.scores(&MetricSelection::parse("choice@R800").unwrap());
        assert_eq!(local, vec![0.0, 1.0, (20.0 - 4.0) / (30.0 - 4.0)]);
    }

    #[test]
    fn rank_quantile_wins_and_missing_scores_zero() {
        let net = RoadNetwork::from_geojson_str(SAMPLE).unwrap();
        let scores = net.scores(&MetricSelection::new(Metric::Integration));
        // "b" has a quantile; "c" is the only raw value, so its range is empty.
        assert_eq!(scores, vec![0.0, 0.9, 0.0]);

        let conn = net.scores(&MetricSelection::new(Metric::Connectivity));
        assert_eq!(conn, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn fingerprint_tracks_geometry_and_metric_not_order() {
        let net = RoadNetwork::from_geojson_str(SAMPLE).unwrap();
        let choice = MetricSelection::new(Metric::Choice);
        let key = net.fingerprint(&choice);
        assert_eq!(key.as_str().len(), 64);

        let mut shuffled = net.clone();
        shuffled.edges.reverse();
        assert_eq!(shuffled.fingerprint(&choice), key);

        assert_ne!(net.fingerprint(&MetricSelection::new(Metric::Integration)), key);

        let mut moved = net.clone();
        moved.edges[0].lines[0][1] = [0.02, 0.02];
        assert_ne!(moved.fingerprint(&choice), key);
    }

    #[test]
    fn fingerprint_ignores_order_of_duplicate_ids() {
        let mut net = RoadNetwork::from_geojson_str(SAMPLE).unwrap();
        net.edges[1].id = "a".to_string();
        let choice = MetricSelection::new(Metric::Choice);
        let key = net.fingerprint(&choice);

        net.edges.swap(0, 1);
        assert_eq!(net.fingerprint(&choice), key);
    }

    #[test]
    fn overlay_items_follow_feature_order() {
        let net = RoadNetwork::from_geojson_str(SAMPLE).unwrap();
        let items = net.overlay_items(&MetricSelection::new(Metric::Choice), |i, _| 1000 + i as u64);
        assert_eq!(
            items.iter().map(|it| (it.index, it.handle)).collect::<Vec<_>>(),
            vec![(0, 1000), (1, 1001), (2, 1002)]
        );
        assert_eq!(items[2].bounds, None);
    }

    #[test]
    fn rejects_non_collections_and_unknown_metrics() {
        assert!(matches!(
            RoadNetwork::from_geojson_str(r#"{ "type": "Feature" }"#),
            Err(RoadNetworkError::NotAFeatureCollection)
        ));
        assert!(matches!(
            RoadNetwork::from_geojson_str(
                r#"{ "type": "FeatureCollection", "features": [ { "type": "Point" } ] }"#
            ),
            Err(RoadNetworkError::InvalidFeature { index: 0, .. })
        ));
        assert!(matches!(
            RoadNetwork::from_geojson_str("[1,"),
            Err(RoadNetworkError::Parse(_))
        ));
        assert!(matches!(
            "speed".parse::<Metric>(),
            Err(RoadNetworkError::UnknownMetric(_))
        ));
        assert_eq!("Choice".parse::<Metric>().unwrap(), Metric::Choice);
    }
}
