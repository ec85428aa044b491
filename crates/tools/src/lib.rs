//! Scripted overlay sessions for `overlay-bench`.
//!
//! A session loads a road network onto an in-memory surface and replays pan
//! gestures, zoom changes and metric switches on a manual clock, one frame at
//! a time, then reports what the layer did.

use std::rc::Rc;

use foundation::bounds::GeoRect;
use formats::{Metric, MetricSelection, RoadNetwork, RoadNetworkError};
use layers::{
    ConfigError, LayerId, MemorySurface, OverlayConfig, OverlayError, OverlayLayer,
    SurfaceCapabilities, Viewport,
};
use runtime::clock::{Clock, ManualClock};
use runtime::frame::RecordingFrameHost;
use serde::Serialize;
use tracing::{debug, info};

/// Extra frames allowed after the script for the layer to settle.
pub const MAX_DRAIN_FRAMES: u32 = 600;

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Network(#[from] RoadNetworkError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Overlay(#[from] OverlayError),
    #[error("encode summary: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("layer did not settle within {0} frames")]
    NotSettled(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BenchScript {
    pub frames: u32,
    pub frame_ms: f64,
    /// Frames between the starts of two pan gestures; 0 disables panning.
    pub pan_every: u32,
    pub drag_frames: u32,
    /// Frames between metric switches; 0 disables switching.
    pub switch_every: u32,
    /// Cycled on each switch. The first entry is loaded initially.
    pub metrics: Vec<MetricSelection>,
    /// Every n-th handle fails on the surface.
    pub fail_every: Option<u32>,
    pub single_only: bool,
}

impl Default for BenchScript {
    fn default() -> Self {
        Self {
            frames: 600,
            frame_ms: 16.0,
            pan_every: 90,
            drag_frames: 20,
            switch_every: 150,
            metrics: Metric::ALL.into_iter().map(MetricSelection::new).collect(),
            fail_every: None,
            single_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitSummary {
    pub submitted: u64,
    pub committed: u64,
    pub not_committed: u64,
    pub noop: u64,
    pub superseded: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSummary {
    pub enqueued: u64,
    pub executed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub replaced: u64,
    pub flushes: u64,
    pub task_errors: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchSummary {
    pub generation: String,
    pub items: usize,
    pub frames: u64,
    pub gestures: u32,
    pub metric_switches: u32,
    pub switches_recorded: u64,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub degraded: bool,
    pub slow_warnings: u64,
    pub applied: usize,
    pub attached: usize,
    pub broken: usize,
    pub stranded: usize,
    /// Surface contents equal the applied set once settled.
    pub consistent: bool,
    pub commits: CommitSummary,
    pub queue: QueueSummary,
}

pub fn load_network(path: &str) -> Result<RoadNetwork, BenchError> {
    let payload = std::fs::read_to_string(path).map_err(|source| BenchError::Io {
        path: path.to_string(),
        source,
    })?;
    Ok(RoadNetwork::from_geojson_str(&payload)?)
}

pub fn load_config(path: Option<&str>) -> Result<OverlayConfig, BenchError> {
    let Some(path) = path else {
        return Ok(OverlayConfig::default());
    };
    let payload = std::fs::read_to_string(path).map_err(|source| BenchError::Io {
        path: path.to_string(),
        source,
    })?;
    Ok(OverlayConfig::from_json_str(&payload)?)
}

/// Camera path: a quarter-extent window sliding east and wrapping, with zoom
/// stepping through the LOD tiers once per gesture.
#[derive(Debug, Clone)]
struct Camera {
    extent: GeoRect,
    width: f64,
    height: f64,
    offset: f64,
    zoom: f64,
}

impl Camera {
    fn new(extent: GeoRect) -> Self {
        Self {
            width: (extent.width() / 4.0).max(1e-4),
            height: (extent.height() / 2.0).max(1e-4),
            offset: 0.0,
            zoom: 12.5,
            extent,
        }
    }

    fn viewport(&self) -> Viewport {
        let span = (self.extent.width() - self.width).max(0.0);
        let min_lng = self.extent.min_lng + if span > 0.0 { self.offset % span } else { 0.0 };
        let min_lat = self.extent.min_lat + (self.extent.height() - self.height).max(0.0) / 2.0;
        Viewport::new(
            GeoRect::new(min_lng, min_lat, min_lng + self.width, min_lat + self.height),
            self.zoom,
        )
    }

    fn pan(&mut self, fraction: f64) {
        self.offset += self.width * fraction;
    }

    fn rezoom(&mut self, gesture: u32) {
        self.zoom = 10.5 + (gesture % 5) as f64;
    }
}

pub fn run_session(
    network: &RoadNetwork,
    config: OverlayConfig,
    script: &BenchScript,
) -> Result<BenchSummary, BenchError> {
    let metrics: Vec<MetricSelection> = if script.metrics.is_empty() {
        vec![MetricSelection::new(Metric::Choice)]
    } else {
        script.metrics.clone()
    };

    let caps = if script.single_only {
        SurfaceCapabilities::SINGLE_ONLY
    } else {
        SurfaceCapabilities::ALL
    };
    let surface = MemorySurface::new(caps);
    if let Some(n) = script.fail_every.filter(|n| *n > 0) {
        for handle in (0..network.len() as u64).step_by(n as usize) {
            surface.fail_on(handle);
        }
    }

    let clock = ManualClock::new();
    let mut layer = OverlayLayer::new(
        LayerId(1),
        "roads",
        surface.clone(),
        config,
        Box::new(RecordingFrameHost::new(true)),
        Rc::new(clock.clone()),
    )?;

    let mut metric_at = 0;
    let generation = network.fingerprint(&metrics[metric_at]);
    let items = network.overlay_items(&metrics[metric_at], |i, _| u64::from(i));
    info!(generation = %generation, items = items.len(), metric = %metrics[metric_at].label(), "loading road network");
    layer.load_dataset(generation.clone(), items)?;

    let extent = network
        .bounds()
        .into_iter()
        .flatten()
        .reduce(|a, b| a.union(&b));
    let mut camera = extent.map(Camera::new);
    if let Some(cam) = &camera {
        layer.set_viewport(Some(cam.viewport()));
    }

    let mut gestures = 0u32;
    let mut metric_switches = 0u32;
    let mut drag_left = 0u32;
    let mut frames = 0u64;

    let step = |layer: &mut OverlayLayer<MemorySurface>, frames: &mut u64| {
        clock.advance_ms(script.frame_ms);
        let report = layer.on_frame(clock.now());
        *frames += 1;
        if let Some(w) = &report.warning {
            debug!(frame = report.frame, p95_ms = w.p95_ms, "slow switch");
        }
    };

    for f in 0..script.frames {
        if let Some(cam) = camera.as_mut() {
            if script.pan_every > 0 && f % script.pan_every == 0 && drag_left == 0 {
                layer.begin_interaction();
                gestures += 1;
                drag_left = script.drag_frames.max(1);
            }
            if drag_left > 0 {
                cam.pan(1.0 / script.drag_frames.max(1) as f64);
                drag_left -= 1;
                if drag_left == 0 {
                    layer.end_interaction();
                    cam.rezoom(gestures);
                }
                layer.set_viewport(Some(cam.viewport()));
            }
        }

        if script.switch_every > 0 && f > 0 && f % script.switch_every == 0 && metrics.len() > 1 {
            metric_at = (metric_at + 1) % metrics.len();
            debug!(metric = %metrics[metric_at].label(), frame = f, "switching metric");
            layer.set_metric_scores(&network.scores(&metrics[metric_at]))?;
            metric_switches += 1;
        }

        step(&mut layer, &mut frames);
    }

    if layer.status().interacting {
        layer.end_interaction();
    }
    let mut drained = 0;
    while !layer.is_quiescent() {
        if drained == MAX_DRAIN_FRAMES {
            return Err(BenchError::NotSettled(MAX_DRAIN_FRAMES));
        }
        step(&mut layer, &mut frames);
        drained += 1;
    }

    let status = layer.status();
    let applied: Vec<u64> = layer.applied().iter().map(u64::from).collect();
    let attached = surface.attached();
    let commits = layer.commit_stats();
    let queue = layer.queue_stats();
    let summary = BenchSummary {
        generation: generation.to_string(),
        items: status.items,
        frames,
        gestures,
        metric_switches,
        switches_recorded: layer.telemetry().recorded(),
        p50_ms: status.p50_ms,
        p95_ms: status.p95_ms,
        degraded: status.degraded,
        slow_warnings: layer.metrics().counter("overlay.switch.slow"),
        applied: applied.len(),
        attached: attached.len(),
        broken: status.broken,
        stranded: status.stranded,
        consistent: applied == attached,
        commits: CommitSummary {
            submitted: commits.submitted,
            committed: commits.committed,
            not_committed: commits.not_committed,
            noop: commits.noop,
            superseded: commits.superseded,
        },
        queue: QueueSummary {
            enqueued: queue.enqueued,
            executed: queue.executed,
            failed: queue.failed,
            skipped: queue.skipped,
            replaced: queue.replaced,
            flushes: queue.flushes,
            task_errors: status.task_errors,
        },
    };
    info!(
        frames = summary.frames,
        committed = summary.commits.committed,
        p95_ms = ?summary.p95_ms,
        consistent = summary.consistent,
        "session finished"
    );
    Ok(summary)
}
