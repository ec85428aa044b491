use std::collections::VecDeque;

use foundation::math::stable_total_cmp_f64;
use foundation::time::Time;
use tracing::warn;

use crate::lod::LodStage;

pub const DEFAULT_SWITCH_SAMPLE_LIMIT: usize = 40;

/// How a commit reached the surface.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommitPath {
    /// Nothing to attach or detach.
    Noop,
    Batched,
    PerItem,
    /// One direction batched, the other per item.
    Mixed,
}

impl CommitPath {
    pub fn as_str(self) -> &'static str {
        match self {
            CommitPath::Noop => "noop",
            CommitPath::Batched => "batched",
            CommitPath::PerItem => "per_item",
            CommitPath::Mixed => "mixed",
        }
    }
}

/// LOD state at the time of a switch, attached to warnings.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SwitchContext {
    pub stage: LodStage,
    pub cap: Option<usize>,
    pub interacting: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchSample {
    pub layer_key: String,
    pub duration_ms: f64,
    pub hidden: usize,
    pub shown: usize,
    pub path: CommitPath,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchWarning {
    pub layer_key: String,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub target_p95_ms: f64,
    pub samples: usize,
    pub path: CommitPath,
    pub context: SwitchContext,
}

impl std::fmt::Display for SwitchWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} p95={:.1}ms > {:.1}ms (p50={:.1}ms, n={}, path={}, lod={})",
            self.layer_key,
            self.p95_ms,
            self.target_p95_ms,
            self.p50_ms,
            self.samples,
            self.path.as_str(),
            self.context.stage,
        )
    }
}

/// Rolling switch-latency window with nearest-rank percentiles.
///
/// Pure observation: nothing here feeds back into scheduling.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchTelemetry {
    limit: usize,
    target_p95_ms: Option<f64>,
    window: VecDeque<f64>,
    p50_ms: Option<f64>,
    p95_ms: Option<f64>,
    degraded: bool,
    recorded: u64,
    last: Option<SwitchSample>,
}

impl SwitchTelemetry {
    pub fn new(sample_limit: usize, target_p95_ms: Option<f64>) -> Self {
        let limit = sample_limit.max(1);
        Self {
            limit,
            target_p95_ms: target_p95_ms.filter(|t| t.is_finite() && *t > 0.0),
            window: VecDeque::with_capacity(limit),
            p50_ms: None,
            p95_ms: None,
            degraded: false,
            recorded: 0,
            last: None,
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn p50_ms(&self) -> Option<f64> {
        self.p50_ms
    }

    pub fn p95_ms(&self) -> Option<f64> {
        self.p95_ms
    }

    /// Whether the last evaluation breached the p95 target.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    pub fn last(&self) -> Option<&SwitchSample> {
        self.last.as_ref()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        started_at: Time,
        now: Time,
        layer_key: &str,
        hidden: usize,
        shown: usize,
        path: CommitPath,
        context: SwitchContext,
    ) -> Option<SwitchWarning> {
        let duration_ms = now.millis_since(started_at);
        if self.window.len() == self.limit {
            self.window.pop_front();
        }
        self.window.push_back(duration_ms);
        self.recorded += 1;
        self.last = Some(SwitchSample {
            layer_key: layer_key.to_string(),
            duration_ms,
            hidden,
            shown,
            path,
        });

        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(|a, b| stable_total_cmp_f64(*a, *b));
        let p50 = nearest_rank(&sorted, 0.50);
        let p95 = nearest_rank(&sorted, 0.95);
        self.p50_ms = Some(p50);
        self.p95_ms = Some(p95);

        let Some(target) = self.target_p95_ms else {
            self.degraded = false;
            return None;
        };
        self.degraded = p95 > target;
        if !self.degraded {
            return None;
        }

        let warning = SwitchWarning {
            layer_key: layer_key.to_string(),
            p50_ms: p50,
            p95_ms: p95,
            target_p95_ms: target,
            samples: sorted.len(),
            path,
            context,
        };
        warn!(
            layer = %warning.layer_key,
            p50_ms = warning.p50_ms,
            p95_ms = warning.p95_ms,
            target_ms = target,
            samples = warning.samples,
            hidden,
            shown,
            path = path.as_str(),
            lod = %context.stage,
            cap = ?context.cap,
            interacting = context.interacting,
            "overlay switch p95 above target"
        );
        Some(warning)
    }
}

fn nearest_rank(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::{CommitPath, SwitchContext, SwitchTelemetry, nearest_rank};
    use crate::lod::LodStage;
    use foundation::time::Time;
    use proptest::prelude::*;

    fn ctx() -> SwitchContext {
        SwitchContext {
            stage: LodStage::Tier(0),
            cap: Some(800),
            interacting: false,
        }
    }

    fn record_ms(t: &mut SwitchTelemetry, ms: f64) -> bool {
        t.record(Time(0.0), Time::from_millis(ms), "roads", 1, 1, CommitPath::Batched, ctx())
            .is_some()
    }

    #[test]
    fn nearest_rank_percentiles() {
        let sorted: Vec<f64> = (1..=20).map(|v| v as f64).collect();
        assert_eq!(nearest_rank(&sorted, 0.5), 10.0);
        assert_eq!(nearest_rank(&sorted, 0.95), 19.0);
        assert_eq!(nearest_rank(&[7.0], 0.95), 7.0);
    }

    #[test]
    fn window_evicts_oldest() {
        let mut t = SwitchTelemetry::new(3, None);
        for ms in [1000.0, 1.0, 2.0, 3.0] {
            record_ms(&mut t, ms);
        }
        assert_eq!(t.len(), 3);
        let close = |v: Option<f64>, want: f64| v.is_some_and(|v| (v - want).abs() < 1e-9);
        assert!(close(t.p95_ms(), 3.0));
        assert!(close(t.p50_ms(), 2.0));
        assert_eq!(t.recorded(), 4);
    }

    #[test]
    fn warns_and_recovers_around_target() {
        let mut t = SwitchTelemetry::new(4, Some(50.0));
        assert!(!record_ms(&mut t, 10.0));
        assert!(record_ms(&mut t, 200.0));
        assert!(t.is_degraded());

        // Push the slow sample out of the window.
        for _ in 0..4 {
            record_ms(&mut t, 5.0);
        }
        assert!(!t.is_degraded());
        assert_eq!(t.last().map(|s| s.path), Some(CommitPath::Batched));
    }

    #[test]
    fn without_target_never_degrades() {
        let mut t = SwitchTelemetry::new(4, None);
        assert!(!record_ms(&mut t, 10_000.0));
        assert!(!t.is_degraded());
    }

    proptest! {
        #[test]
        fn p95_never_below_p50(samples in proptest::collection::vec(0.0f64..5_000.0, 1..120)) {
            let mut t = SwitchTelemetry::new(40, Some(100.0));
            for ms in samples {
                record_ms(&mut t, ms);
                let (p50, p95) = (t.p50_ms().unwrap(), t.p95_ms().unwrap());
                prop_assert!(p95 >= p50);
            }
        }
    }
}
