//! Overlay layer orchestration.
//!
//! Wires the pieces together per frame:
//! viewport / metric change -> viewport filter -> desired set -> commit engine
//! -> write queue -> surface, with switch telemetry observing each settled
//! commit. All state is owned here; the host drives it through `on_frame`.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use foundation::ids::GenerationKey;
use foundation::time::Time;
use runtime::clock::Clock;
use runtime::event_bus::EventBus;
use runtime::frame::{Frame, FrameHost};
use runtime::metrics::Metrics;
use runtime::write_queue::{DrainTicket, FlushSummary, QueueStats, WriteQueue};
use scene::spatial::SpatialIndexCache;
use scene::visible_set::VisibleSet;
use tracing::{debug, warn};

use crate::commit::{CommitEngine, CommitQueue, CommitStats, Settlement, Submission, SurfaceCtx};
use crate::config::{ConfigError, OverlayConfig};
use crate::interaction::{InteractionState, RefreshDebouncer};
use crate::item::{ItemError, ItemStore, OverlayItem};
use crate::layer::{Layer, LayerId};
use crate::lod::LodDecision;
use crate::surface::{RenderSurface, SurfaceError};
use crate::telemetry::{CommitPath, SwitchContext, SwitchTelemetry, SwitchWarning};
use crate::viewport::{Viewport, ViewportFilter};

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error(transparent)]
    Items(#[from] ItemError),
}

/// Read-only snapshot for the surrounding UI.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerStatus {
    pub generation: GenerationKey,
    pub items: usize,
    pub applied: usize,
    pub target: usize,
    pub pending: bool,
    pub queued: usize,
    pub broken: usize,
    /// Handles that could not be detached after repeated attempts.
    pub stranded: usize,
    pub interacting: bool,
    pub degraded: bool,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub lod: Option<LodDecision>,
    pub task_errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub frame: u64,
    pub flushed: Option<FlushSummary>,
    pub settled: Option<Settlement>,
    pub warning: Option<SwitchWarning>,
    pub refreshed: bool,
}

pub struct OverlayLayer<S: RenderSurface + 'static> {
    id: LayerId,
    key: String,
    config: OverlayConfig,
    ctx: SurfaceCtx<S>,
    queue: CommitQueue<S>,
    engine: CommitEngine,
    spatial: SpatialIndexCache,
    filter: ViewportFilter,
    interaction: InteractionState,
    debouncer: RefreshDebouncer,
    telemetry: SwitchTelemetry,
    metrics: Metrics,
    events: EventBus,
    viewport: Option<Viewport>,
    last_decision: Option<LodDecision>,
    stranded_seen: usize,
    task_errors: Rc<Cell<u64>>,
    frame: Frame,
    clock: Rc<dyn Clock>,
}

impl<S: RenderSurface + 'static> std::fmt::Debug for OverlayLayer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayLayer")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("queue", &self.queue)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl<S: RenderSurface + 'static> Layer for OverlayLayer<S> {
    fn id(&self) -> LayerId {
        self.id
    }
}

impl<S: RenderSurface + 'static> OverlayLayer<S> {
    pub fn new(
        id: LayerId,
        key: impl Into<String>,
        surface: S,
        config: OverlayConfig,
        host: Box<dyn FrameHost>,
        clock: Rc<dyn Clock>,
    ) -> Result<Self, OverlayError> {
        config.validate()?;
        let key = key.into();
        let ctx = SurfaceCtx::new(surface)?;

        let task_errors = Rc::new(Cell::new(0u64));
        let errors = Rc::clone(&task_errors);
        let queue = WriteQueue::new(config.max_tasks_per_frame, host, Rc::clone(&clock))
            .with_error_callback(move |_, _, _| errors.set(errors.get() + 1));

        Ok(Self {
            id,
            engine: CommitEngine::new(&key),
            key,
            ctx,
            queue,
            spatial: SpatialIndexCache::new(config.cell_size_deg),
            filter: ViewportFilter::new(config.viewport_padding_ratio, config.lod.clone()),
            interaction: InteractionState::new(),
            debouncer: RefreshDebouncer::new(config.refresh_debounce_ms),
            telemetry: SwitchTelemetry::new(config.switch_sample_limit, config.target_p95_ms),
            metrics: Metrics::new(),
            events: EventBus::new(),
            viewport: None,
            last_decision: None,
            stranded_seen: 0,
            task_errors,
            frame: Frame::new(0, clock.now()),
            clock,
            config,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn surface(&self) -> &S {
        &self.ctx.surface
    }

    pub fn items(&self) -> &ItemStore<S::Handle> {
        &self.ctx.items
    }

    pub fn applied(&self) -> &VisibleSet {
        self.engine.applied()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn commit_stats(&self) -> CommitStats {
        self.engine.stats()
    }

    pub fn telemetry(&self) -> &SwitchTelemetry {
        &self.telemetry
    }

    /// Nothing queued, unsettled, debounced or waiting for a detach retry.
    pub fn is_quiescent(&self) -> bool {
        self.queue.is_idle()
            && self.engine.pending().is_none()
            && !self.debouncer.is_pending()
            && self.ctx.items.quarantined() == 0
    }

    pub fn wait_for_drain(&mut self, timeout: Duration) -> DrainTicket {
        self.queue.wait_for_drain(timeout)
    }

    /// Swap in a new dataset generation and reconcile immediately.
    ///
    /// Invalid input leaves the current dataset untouched.
    pub fn load_dataset(
        &mut self,
        generation: GenerationKey,
        items: Vec<OverlayItem<S::Handle>>,
    ) -> Result<(), OverlayError> {
        self.settle_pending();
        let retired = self.applied_handles();
        self.ctx.items.load(generation, items)?;
        self.metrics.inc_counter("overlay.dataset.loads", 1);
        self.events.emit(
            self.frame.index,
            "dataset.loaded",
            format!("{} items={}", self.ctx.items.generation(), self.ctx.items.len()),
        );
        self.retire(retired, "dataset_replaced");
        Ok(())
    }

    /// Detach everything and drop the dataset.
    pub fn clear(&mut self) {
        self.settle_pending();
        let retired = self.applied_handles();
        self.ctx.items.clear();
        self.events.emit(self.frame.index, "dataset.cleared", self.key.clone());
        self.retire(retired, "layer_cleared");
    }

    pub fn set_viewport(&mut self, viewport: Option<Viewport>) {
        self.viewport = viewport;
        self.debouncer
            .request(self.clock.now(), self.interaction.token());
    }

    /// Metric switch: new scores for the same generation, applied right away.
    pub fn set_metric_scores(&mut self, scores: &[f64]) -> Result<(), OverlayError> {
        self.ctx.items.set_scores(scores)?;
        self.metrics.inc_counter("overlay.metric.switches", 1);
        self.refresh_now();
        Ok(())
    }

    /// Returns `false` if already interacting.
    pub fn begin_interaction(&mut self) -> bool {
        if !self.interaction.enter() {
            return false;
        }
        self.debouncer
            .request(self.clock.now(), self.interaction.token());
        true
    }

    /// Returns `false` if not interacting.
    pub fn end_interaction(&mut self) -> bool {
        if !self.interaction.leave() {
            return false;
        }
        self.debouncer
            .request(self.clock.now(), self.interaction.token());
        true
    }

    /// External validity signal: `index` must never be shown again.
    ///
    /// Returns `false` if the item is unknown or already broken.
    pub fn mark_broken(&mut self, index: u32) -> bool {
        // An executed but unobserved commit may have just shown `index`.
        self.settle_pending();
        let Some(handle) = self.ctx.items.mark_broken(index) else {
            return false;
        };
        if self.engine.forget(index) {
            self.ctx.items.quarantine(handle);
        }
        self.metrics.inc_counter("overlay.items.broken", 1);
        self.events
            .emit(self.frame.index, "item.broken", format!("{}#{index}", self.key));
        self.refresh_now();
        true
    }

    /// Reconcile now, bypassing the debounce.
    pub fn refresh_now(&mut self) -> Submission {
        self.debouncer.cancel();
        let now = self.clock.now();
        self.reconcile(now)
    }

    /// Host frame callback.
    pub fn on_frame(&mut self, now: Time) -> FrameReport {
        self.frame = self.frame.next(now);
        let mut report = FrameReport {
            frame: self.frame.index,
            ..FrameReport::default()
        };

        if self.queue.needs_flush() {
            let summary = self.queue.flush(&mut self.ctx);
            self.metrics
                .inc_counter("queue.executed", summary.executed as u64);
            self.metrics.inc_counter("queue.failed", summary.failed as u64);
            self.metrics
                .inc_counter("queue.skipped", summary.skipped as u64);
            report.flushed = Some(summary);
        }
        self.queue.poll_timers(now);

        if let Some(settled) = self.engine.settle(&self.ctx.items) {
            report.warning = self.observe(&settled, now);
            report.settled = Some(settled);
        }

        if self
            .debouncer
            .due(now, self.interaction.token())
            .is_some()
        {
            self.reconcile(now);
            report.refreshed = true;
        } else if self.ctx.items.quarantined() > 0
            && self.engine.pending().is_none()
            && self.queue.is_idle()
        {
            // Detaches that failed earlier are retried by the next commit.
            self.reconcile(now);
        }
        self.check_stranded();

        self.metrics
            .set_gauge("overlay.applied", self.engine.applied().len() as i64);
        self.metrics
            .set_gauge("overlay.broken", self.ctx.items.broken_count() as i64);
        self.metrics
            .set_gauge("overlay.quarantined", self.ctx.items.quarantined() as i64);
        self.metrics.set_gauge("queue.len", self.queue.len() as i64);
        report
    }

    pub fn status(&self) -> LayerStatus {
        LayerStatus {
            generation: self.ctx.items.generation().clone(),
            items: self.ctx.items.len(),
            applied: self.engine.applied().len(),
            target: self.engine.target().len(),
            pending: self.engine.pending().is_some(),
            queued: self.queue.len(),
            broken: self.ctx.items.broken_count(),
            stranded: self.ctx.items.stranded_count(),
            interacting: self.interaction.is_interacting(),
            degraded: self.telemetry.is_degraded() || self.ctx.items.stranded_count() > 0,
            p50_ms: self.telemetry.p50_ms(),
            p95_ms: self.telemetry.p95_ms(),
            lod: self.last_decision,
            task_errors: self.task_errors.get(),
        }
    }

    fn settle_pending(&mut self) {
        if let Some(settled) = self.engine.settle(&self.ctx.items) {
            let now = self.clock.now();
            self.observe(&settled, now);
        }
    }

    fn check_stranded(&mut self) {
        let stranded = self.ctx.items.stranded_count();
        if stranded <= self.stranded_seen {
            return;
        }
        let fresh = stranded - self.stranded_seen;
        self.stranded_seen = stranded;
        warn!(layer = %self.key, fresh, stranded, "overlay handles left on the surface");
        self.metrics
            .inc_counter("overlay.detach.failed", fresh as u64);
        self.events.emit(
            self.frame.index,
            "item.detach_failed",
            format!("{} stranded={stranded}", self.key),
        );
    }

    fn applied_handles(&self) -> Vec<S::Handle> {
        self.engine
            .applied()
            .iter()
            .filter_map(|i| self.ctx.items.live_handle(i).cloned())
            .collect()
    }

    fn retire(&mut self, handles: Vec<S::Handle>, reason: &str) {
        let evicted = self.queue.clear(reason);
        self.engine.reset();
        for handle in handles {
            self.ctx.items.quarantine(handle);
        }
        debug!(
            layer = %self.key,
            reason,
            evicted,
            quarantined = self.ctx.items.quarantined(),
            "overlay dataset retired"
        );
        self.refresh_now();
    }

    fn reconcile(&mut self, now: Time) -> Submission {
        // Settle first so a finished commit is never overwritten unobserved.
        self.settle_pending();

        let index = self
            .spatial
            .ensure(self.ctx.items.bounds(), self.ctx.items.generation());
        let outcome = self.filter.desired(
            self.viewport.as_ref(),
            self.interaction.is_interacting(),
            &self.ctx.items,
            index,
        );
        self.last_decision = Some(outcome.decision);
        self.metrics
            .set_gauge("overlay.candidates", outcome.candidates as i64);

        let submission = self
            .engine
            .submit(outcome.desired, &self.ctx.items, &mut self.queue, now);
        match &submission {
            Submission::Noop => self.metrics.inc_counter("overlay.commit.noop", 1),
            Submission::Queued { replaced, .. } => {
                self.metrics.inc_counter("overlay.commit.queued", 1);
                if *replaced {
                    self.metrics.inc_counter("queue.replaced", 1);
                }
            }
            Submission::Rejected(reason) => {
                self.metrics.inc_counter("overlay.commit.rejected", 1);
                self.events
                    .emit(self.frame.index, "commit.rejected", reason.to_string());
            }
        }
        submission
    }

    fn observe(&mut self, settled: &Settlement, now: Time) -> Option<SwitchWarning> {
        let outcome = &settled.outcome;
        if settled.committed {
            self.metrics.inc_counter("overlay.commit.ok", 1);
        } else if outcome.skipped {
            self.metrics.inc_counter("overlay.commit.skipped", 1);
        } else {
            self.metrics.inc_counter("overlay.commit.failed", 1);
        }

        if let Some(report) = &outcome.report {
            for index in &report.broken {
                self.metrics.inc_counter("overlay.items.broken", 1);
                self.events
                    .emit(self.frame.index, "item.broken", format!("{}#{index}", self.key));
            }
        }

        // Skipped commits never touched the surface; they are not switches.
        if outcome.skipped {
            return None;
        }

        let decision = self.last_decision.unwrap_or(LodDecision::UNBOUNDED);
        let context = SwitchContext {
            stage: decision.stage,
            cap: decision.cap,
            interacting: self.interaction.is_interacting(),
        };
        let path = outcome
            .report
            .as_ref()
            .map_or(CommitPath::Noop, |r| r.path);
        self.metrics
            .record_histogram("overlay.switch.ms", now.millis_since(settled.submitted_at));

        let warning = self.telemetry.record(
            settled.submitted_at,
            now,
            &self.key,
            settled.hide,
            settled.show,
            path,
            context,
        );
        if let Some(w) = &warning {
            self.metrics.inc_counter("overlay.switch.slow", 1);
            self.events
                .emit(self.frame.index, "switch.slow", w.to_string());
        }
        warning
    }
}
