use runtime::write_queue::DEFAULT_MAX_TASKS_PER_FRAME;
use scene::spatial::DEFAULT_CELL_SIZE_DEG;
use serde::{Deserialize, Serialize};

use crate::lod::LodPolicy;
use crate::telemetry::DEFAULT_SWITCH_SAMPLE_LIMIT;
use crate::viewport::DEFAULT_VIEWPORT_PADDING_RATIO;

pub const DEFAULT_REFRESH_DEBOUNCE_MS: f64 = 120.0;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Tunables of one overlay layer. Every field has a default, so a partial
/// JSON document is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub max_tasks_per_frame: u32,
    pub switch_sample_limit: usize,
    pub target_p95_ms: Option<f64>,
    pub lod: LodPolicy,
    pub cell_size_deg: f64,
    pub viewport_padding_ratio: f64,
    pub refresh_debounce_ms: f64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_frame: DEFAULT_MAX_TASKS_PER_FRAME,
            switch_sample_limit: DEFAULT_SWITCH_SAMPLE_LIMIT,
            target_p95_ms: None,
            lod: LodPolicy::default(),
            cell_size_deg: DEFAULT_CELL_SIZE_DEG,
            viewport_padding_ratio: DEFAULT_VIEWPORT_PADDING_RATIO,
            refresh_debounce_ms: DEFAULT_REFRESH_DEBOUNCE_MS,
        }
    }
}

impl OverlayConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tasks_per_frame == 0 {
            return Err(invalid("max_tasks_per_frame", "must be at least 1"));
        }
        if self.switch_sample_limit == 0 {
            return Err(invalid("switch_sample_limit", "must be at least 1"));
        }
        if let Some(t) = self.target_p95_ms
            && !(t.is_finite() && t > 0.0)
        {
            return Err(invalid("target_p95_ms", format!("{t} is not a positive duration")));
        }
        if !(self.cell_size_deg.is_finite() && self.cell_size_deg > 0.0) {
            return Err(invalid("cell_size_deg", "must be positive"));
        }
        if !(self.viewport_padding_ratio.is_finite() && self.viewport_padding_ratio >= 0.0) {
            return Err(invalid("viewport_padding_ratio", "must be non-negative"));
        }
        if !(self.refresh_debounce_ms.is_finite() && self.refresh_debounce_ms >= 0.0) {
            return Err(invalid("refresh_debounce_ms", "must be non-negative"));
        }

        let lod = &self.lod;
        if lod.interaction_cap == 0 {
            return Err(invalid("lod.interaction_cap", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&lod.backbone_head_ratio) {
            return Err(invalid("lod.backbone_head_ratio", "must be within [0, 1]"));
        }
        for (i, tier) in lod.tiers.iter().enumerate() {
            if tier.cap == 0 {
                return Err(invalid("lod.tiers", format!("tier {i} has a zero cap")));
            }
            if !tier.max_zoom.is_finite() {
                return Err(invalid("lod.tiers", format!("tier {i} has a non-finite zoom")));
            }
        }
        if lod.tiers.windows(2).any(|w| w[0].max_zoom >= w[1].max_zoom) {
            return Err(invalid("lod.tiers", "max_zoom must be strictly ascending"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, OverlayConfig};
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_valid() {
        let cfg = OverlayConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.max_tasks_per_frame, 2);
        assert_eq!(cfg.switch_sample_limit, 40);
        assert_eq!(cfg.lod.tiers.len(), 4);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg = OverlayConfig::from_json_str(
            r#"{ "target_p95_ms": 120.0, "lod": { "interaction_cap": 300 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.target_p95_ms, Some(120.0));
        assert_eq!(cfg.lod.interaction_cap, 300);
        assert_eq!(cfg.lod.tiers[0].cap, 800);
        assert_eq!(cfg.max_tasks_per_frame, 2);
    }

    #[test]
    fn rejects_unordered_tiers() {
        let err = OverlayConfig::from_json_str(
            r#"{ "lod": { "tiers": [
                { "max_zoom": 12.0, "cap": 10, "backbone": true },
                { "max_zoom": 11.0, "cap": 20, "backbone": true }
            ] } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "lod.tiers", .. }));
    }

    #[test]
    fn rejects_bad_values_and_bad_json() {
        let cfg = OverlayConfig {
            max_tasks_per_frame: 0,
            ..OverlayConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid {
                field: "max_tasks_per_frame",
                ..
            })
        ));
        assert!(matches!(
            OverlayConfig::from_json_str("{ nope"),
            Err(ConfigError::Parse(_))
        ));
    }
}
