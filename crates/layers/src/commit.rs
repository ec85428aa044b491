//! Diff/commit engine.
//!
//! The engine owns two visible sets per layer: `applied` (what the surface
//! shows as of the last confirmed commit) and `target` (what it should show).
//! A commit is a single write-queue task keyed per layer, so a newer diff
//! replaces a stale one that has not started yet. `applied` only moves when
//! that task settles with `ok`.

use foundation::time::Time;
use runtime::write_queue::{EnqueueOptions, SkipReason, TaskError, TaskId, TaskOutcome, TaskTicket, WriteQueue};
use scene::visible_set::VisibleSet;
use tracing::{debug, warn};

use crate::item::{ItemStore, MAX_DETACH_ATTEMPTS, Quarantined};
use crate::surface::{CommitStrategy, RenderSurface, SurfaceError, WritePath};
use crate::telemetry::CommitPath;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub to_hide: VisibleSet,
    pub to_show: VisibleSet,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.to_hide.is_empty() && self.to_show.is_empty()
    }

    pub fn len(&self) -> usize {
        self.to_hide.len() + self.to_show.len()
    }
}

pub fn compute_delta(applied: &VisibleSet, target: &VisibleSet) -> Delta {
    Delta {
        to_hide: applied.diff(target),
        to_show: target.diff(applied),
    }
}

/// State the commit tasks mutate during a flush.
#[derive(Debug)]
pub struct SurfaceCtx<S: RenderSurface> {
    pub surface: S,
    pub items: ItemStore<S::Handle>,
    pub strategy: CommitStrategy,
}

impl<S: RenderSurface> SurfaceCtx<S> {
    pub fn new(surface: S) -> Result<Self, SurfaceError> {
        let strategy = CommitStrategy::from_capabilities(surface.capabilities())?;
        Ok(Self {
            surface,
            items: ItemStore::new(),
            strategy,
        })
    }
}

/// What a commit task did to the surface.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReport {
    pub path: CommitPath,
    pub hidden: usize,
    pub shown: usize,
    /// Items whose mutation failed; marked broken and detached.
    pub broken: Vec<u32>,
    pub quarantine_detached: usize,
}

pub type CommitQueue<S> = WriteQueue<SurfaceCtx<S>, CommitReport>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Direction {
    Hide,
    Show,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Hide => "detach",
            Direction::Show => "attach",
        }
    }
}

fn batch_call<S: RenderSurface>(
    surface: &mut S,
    dir: Direction,
    handles: &[S::Handle],
) -> Result<(), SurfaceError> {
    match dir {
        Direction::Hide => surface.detach_many(handles),
        Direction::Show => surface.attach_many(handles),
    }
}

fn single_call<S: RenderSurface>(
    surface: &mut S,
    dir: Direction,
    handle: &S::Handle,
) -> Result<(), SurfaceError> {
    match dir {
        Direction::Hide => surface.detach(handle),
        Direction::Show => surface.attach(handle),
    }
}

/// Write one direction of a delta. `None` when there was nothing to write.
fn write_direction<S: RenderSurface>(
    surface: &mut S,
    items: &mut ItemStore<S::Handle>,
    path: WritePath,
    dir: Direction,
    indices: &[u32],
    broken: &mut Vec<u32>,
) -> Result<Option<(CommitPath, usize)>, TaskError> {
    // Broken items were detached when they broke.
    let targets: Vec<(u32, S::Handle)> = indices
        .iter()
        .filter_map(|&i| items.live_handle(i).map(|h| (i, h.clone())))
        .collect();
    if targets.is_empty() {
        return Ok(None);
    }

    match path {
        WritePath::Batched { per_item_fallback } => {
            let handles: Vec<S::Handle> = targets.iter().map(|(_, h)| h.clone()).collect();
            match batch_call(surface, dir, &handles) {
                Ok(()) => return Ok(Some((CommitPath::Batched, targets.len()))),
                Err(err) if per_item_fallback => {
                    debug!(op = dir.as_str(), items = targets.len(), error = %err, "batch rejected, writing per item");
                }
                Err(err) => {
                    return Err(TaskError::Failed(format!("batch {}: {err}", dir.as_str())));
                }
            }
        }
        WritePath::PerItem => {}
        WritePath::Unsupported => {
            return Err(TaskError::Failed(format!("surface cannot {}", dir.as_str())));
        }
    }

    let mut written = 0;
    for (index, handle) in targets {
        match single_call(surface, dir, &handle) {
            Ok(()) => written += 1,
            Err(err) => {
                warn!(index, op = dir.as_str(), error = %err, "overlay item mutation failed, marking broken");
                items.mark_broken(index);
                if let Err(err) = surface.detach(&handle) {
                    debug!(index, error = %err, "forced detach failed, quarantining");
                    requeue_detach(items, Quarantined::new(handle));
                }
                broken.push(index);
            }
        }
    }
    Ok(Some((CommitPath::PerItem, written)))
}

/// Put a handle back in the quarantine after a failed detach.
fn requeue_detach<H: Clone + std::fmt::Debug>(items: &mut ItemStore<H>, entry: Quarantined<H>) {
    let handle = entry.handle.clone();
    if !items.requarantine(entry) {
        warn!(?handle, attempts = MAX_DETACH_ATTEMPTS, "giving up on detaching handle");
    }
}

/// Detach quarantined handles. Returns how many succeeded; the rest go back
/// into the quarantine for the next commit.
fn drain_quarantine<S: RenderSurface>(ctx: &mut SurfaceCtx<S>) -> usize {
    let entries = ctx.items.take_quarantine();
    if entries.is_empty() {
        return 0;
    }
    if let WritePath::Batched { per_item_fallback } = ctx.strategy.hide {
        let handles: Vec<S::Handle> = entries.iter().map(|q| q.handle.clone()).collect();
        match ctx.surface.detach_many(&handles) {
            Ok(()) => return entries.len(),
            Err(err) if per_item_fallback => {
                debug!(handles = handles.len(), error = %err, "quarantine batch rejected, detaching per item");
            }
            Err(err) => {
                debug!(handles = handles.len(), error = %err, "quarantine batch rejected");
                for entry in entries {
                    requeue_detach(&mut ctx.items, entry);
                }
                return 0;
            }
        }
    }
    let mut detached = 0;
    for entry in entries {
        match ctx.surface.detach(&entry.handle) {
            Ok(()) => detached += 1,
            Err(err) => {
                debug!(handle = ?entry.handle, attempts = entry.attempts, error = %err, "quarantined handle detach failed");
                requeue_detach(&mut ctx.items, entry);
            }
        }
    }
    detached
}

fn combine(hide: Option<CommitPath>, show: Option<CommitPath>) -> CommitPath {
    match (hide, show) {
        (None, None) => CommitPath::Noop,
        (Some(p), None) | (None, Some(p)) => p,
        (Some(a), Some(b)) if a == b => a,
        _ => CommitPath::Mixed,
    }
}

/// Body of a commit task: quarantine first, then hide, then show.
pub fn apply_delta<S: RenderSurface>(
    ctx: &mut SurfaceCtx<S>,
    hide: &[u32],
    show: &[u32],
) -> Result<CommitReport, TaskError> {
    let quarantine_detached = drain_quarantine(ctx);
    let mut broken = Vec::new();
    let hidden = write_direction(
        &mut ctx.surface,
        &mut ctx.items,
        ctx.strategy.hide,
        Direction::Hide,
        hide,
        &mut broken,
    )?;
    let shown = write_direction(
        &mut ctx.surface,
        &mut ctx.items,
        ctx.strategy.show,
        Direction::Show,
        show,
        &mut broken,
    )?;
    Ok(CommitReport {
        path: combine(hidden.map(|(p, _)| p), shown.map(|(p, _)| p)),
        hidden: hidden.map_or(0, |(_, n)| n),
        shown: shown.map_or(0, |(_, n)| n),
        broken,
        quarantine_detached,
    })
}

#[derive(Debug)]
pub struct PendingCommit {
    pub id: TaskId,
    pub target: VisibleSet,
    pub hide: usize,
    pub show: usize,
    pub submitted_at: Time,
    ticket: TaskTicket<CommitReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Target already applied; committed synchronously.
    Noop,
    Queued {
        id: TaskId,
        replaced: bool,
        hide: usize,
        show: usize,
    },
    Rejected(SkipReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub committed: bool,
    pub submitted_at: Time,
    pub hide: usize,
    pub show: usize,
    pub outcome: TaskOutcome<CommitReport>,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub submitted: u64,
    pub committed: u64,
    pub not_committed: u64,
    pub noop: u64,
    pub superseded: u64,
}

#[derive(Debug)]
pub struct CommitEngine {
    key: String,
    applied: VisibleSet,
    target: VisibleSet,
    pending: Option<PendingCommit>,
    stats: CommitStats,
}

impl CommitEngine {
    pub fn new(layer_key: &str) -> Self {
        Self {
            key: format!("{layer_key}:delta"),
            applied: VisibleSet::new(),
            target: VisibleSet::new(),
            pending: None,
            stats: CommitStats::default(),
        }
    }

    /// Coalescing key of this layer's commit tasks.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn applied(&self) -> &VisibleSet {
        &self.applied
    }

    pub fn target(&self) -> &VisibleSet {
        &self.target
    }

    pub fn pending(&self) -> Option<&PendingCommit> {
        self.pending.as_ref()
    }

    pub fn stats(&self) -> CommitStats {
        self.stats
    }

    /// Forget all state; returns the previously applied set.
    pub fn reset(&mut self) -> VisibleSet {
        self.pending = None;
        self.target.clear();
        std::mem::take(&mut self.applied)
    }

    /// Drop `index` from both sets. Returns whether it was applied.
    pub fn forget(&mut self, index: u32) -> bool {
        self.target.remove(index);
        self.applied.remove(index)
    }

    /// Diff `target` against the applied set and queue the delta.
    ///
    /// Callers settle the previous commit first (see [`CommitEngine::settle`]).
    pub fn submit<S: RenderSurface + 'static>(
        &mut self,
        mut target: VisibleSet,
        items: &ItemStore<S::Handle>,
        queue: &mut CommitQueue<S>,
        now: Time,
    ) -> Submission {
        target.retain(|i| items.is_live(i));
        self.applied.retain(|i| items.is_live(i));
        let delta = compute_delta(&self.applied, &target);
        self.target = target;

        // A pending commit must still be replaced even when the new delta is empty.
        if delta.is_empty() && items.quarantined() == 0 && self.pending.is_none() {
            self.stats.noop += 1;
            return Submission::Noop;
        }

        let hide = delta.to_hide.to_vec();
        let show = delta.to_show.to_vec();
        let (hide_n, show_n) = (hide.len(), show.len());
        let generation = items.generation().clone();
        let opts = EnqueueOptions::new(self.key.clone())
            .keyed(self.key.clone())
            .replacing()
            .guarded(move |ctx: &SurfaceCtx<S>| ctx.items.generation() == &generation);
        let enqueued = queue.enqueue(opts, move |ctx: &mut SurfaceCtx<S>| {
            apply_delta(ctx, &hide, &show)
        });

        if !enqueued.accepted {
            let mut ticket = enqueued.ticket;
            let reason = ticket
                .take_outcome()
                .and_then(|o| o.reason)
                .unwrap_or(SkipReason::Dropped);
            warn!(key = %self.key, %reason, "commit rejected by write queue");
            self.pending = None;
            self.stats.not_committed += 1;
            return Submission::Rejected(reason);
        }

        if enqueued.replaced {
            self.stats.superseded += 1;
        }
        self.stats.submitted += 1;
        debug!(key = %self.key, task = enqueued.id.0, hide = hide_n, show = show_n, "commit queued");
        self.pending = Some(PendingCommit {
            id: enqueued.id,
            target: self.target.clone(),
            hide: hide_n,
            show: show_n,
            submitted_at: now,
            ticket: enqueued.ticket,
        });
        Submission::Queued {
            id: enqueued.id,
            replaced: enqueued.replaced,
            hide: hide_n,
            show: show_n,
        }
    }

    /// Poll the pending commit. On `ok` the pruned target becomes applied;
    /// otherwise applied stays at the last known-good state.
    pub fn settle<H: Clone>(&mut self, items: &ItemStore<H>) -> Option<Settlement> {
        let outcome = self.pending.as_mut()?.ticket.take_outcome()?;
        let pending = self.pending.take()?;

        if outcome.ok {
            let mut applied = pending.target;
            applied.retain(|i| items.is_live(i));
            self.target.retain(|i| items.is_live(i));
            self.applied = applied;
            self.stats.committed += 1;
            debug!(key = %self.key, task = pending.id.0, applied = self.applied.len(), "commit settled");
        } else {
            self.stats.not_committed += 1;
            debug!(
                key = %self.key,
                task = pending.id.0,
                reason = ?outcome.reason,
                error = ?outcome.error,
                "commit not applied"
            );
        }

        Some(Settlement {
            committed: outcome.ok,
            submitted_at: pending.submitted_at,
            hide: pending.hide,
            show: pending.show,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{CommitEngine, CommitQueue, Submission, SurfaceCtx, compute_delta};
    use crate::item::{MAX_DETACH_ATTEMPTS, OverlayItem};
    use crate::surface::{MemorySurface, SurfaceCapabilities};
    use crate::telemetry::CommitPath;
    use foundation::ids::GenerationKey;
    use foundation::time::Time;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use runtime::clock::ManualClock;
    use runtime::frame::RecordingFrameHost;
    use runtime::write_queue::{SkipReason, WriteQueue};
    use scene::visible_set::VisibleSet;
    use std::rc::Rc;

    struct Rig {
        ctx: SurfaceCtx<MemorySurface>,
        queue: CommitQueue<MemorySurface>,
        engine: CommitEngine,
        surface: MemorySurface,
    }

    fn items(generation: &str, n: u32) -> (GenerationKey, Vec<OverlayItem<u64>>) {
        let items = (0..n)
            .map(|i| OverlayItem {
                index: i,
                bounds: None,
                score: 0.5,
                handle: i as u64,
            })
            .collect();
        (GenerationKey::new(generation), items)
    }

    fn rig(caps: SurfaceCapabilities) -> Rig {
        let surface = MemorySurface::new(caps);
        let mut ctx = SurfaceCtx::new(surface.clone()).unwrap();
        let (generation, list) = items("g1", 8);
        ctx.items.load(generation, list).unwrap();
        let queue = WriteQueue::new(
            4,
            Box::new(RecordingFrameHost::new(true)),
            Rc::new(ManualClock::new()),
        );
        Rig {
            ctx,
            queue,
            engine: CommitEngine::new("roads"),
            surface,
        }
    }

    fn set(indices: &[u32]) -> VisibleSet {
        indices.iter().copied().collect()
    }

    impl Rig {
        fn submit(&mut self, target: &[u32]) -> Submission {
            self.engine
                .submit(set(target), &self.ctx.items, &mut self.queue, Time(0.0))
        }

        fn flush_and_settle(&mut self) -> Option<super::Settlement> {
            self.queue.flush(&mut self.ctx);
            self.engine.settle(&self.ctx.items)
        }
    }

    #[test]
    fn commit_moves_applied_only_after_success() {
        let mut r = rig(SurfaceCapabilities::ALL);
        r.submit(&[1, 2, 3]);
        assert!(r.engine.applied().is_empty());
        assert!(r.flush_and_settle().unwrap().committed);
        assert_eq!(r.engine.applied().to_vec(), vec![1, 2, 3]);

        let delta = compute_delta(r.engine.applied(), &set(&[2, 3, 4]));
        assert_eq!(delta.to_hide.to_vec(), vec![1]);
        assert_eq!(delta.to_show.to_vec(), vec![4]);

        assert_eq!(
            r.submit(&[2, 3, 4]),
            Submission::Queued {
                id: runtime::write_queue::TaskId(2),
                replaced: false,
                hide: 1,
                show: 1
            }
        );
        let settled = r.flush_and_settle().unwrap();
        assert!(settled.committed);
        assert_eq!(settled.outcome.report.map(|rep| rep.path), Some(CommitPath::Batched));
        assert_eq!(r.engine.applied().to_vec(), vec![2, 3, 4]);
        assert_eq!(r.surface.attached(), vec![2, 3, 4]);
    }

    #[test]
    fn guard_rejection_keeps_last_known_good() {
        let mut r = rig(SurfaceCapabilities::ALL);
        r.submit(&[1, 2, 3]);
        r.flush_and_settle();

        r.submit(&[2, 3, 4]);
        // Dataset swapped before the frame ran: the guard must cancel the write.
        let (generation, list) = items("g2", 8);
        r.ctx.items.load(generation, list).unwrap();
        let settled = r.flush_and_settle().unwrap();
        assert!(!settled.committed);
        assert_eq!(settled.outcome.reason, Some(SkipReason::GuardRejected));
        assert_eq!(r.engine.applied().to_vec(), vec![1, 2, 3]);
        assert_eq!(r.surface.attached(), vec![1, 2, 3]);
    }

    #[test]
    fn failed_batch_without_fallback_is_not_committed() {
        let batch_only = SurfaceCapabilities {
            batch_attach: true,
            batch_detach: true,
            single_attach: false,
            single_detach: false,
        };
        let mut r = rig(batch_only);
        r.submit(&[1, 2, 3]);
        r.flush_and_settle();

        r.surface.reject_batches(true);
        r.submit(&[2, 3, 4]);
        let settled = r.flush_and_settle().unwrap();
        assert!(!settled.committed);
        assert!(settled.outcome.error.is_some());
        assert_eq!(r.engine.applied().to_vec(), vec![1, 2, 3]);
        assert_eq!(r.engine.stats().not_committed, 1);
    }

    #[test]
    fn per_item_fallback_marks_failures_broken() {
        let mut r = rig(SurfaceCapabilities::ALL);
        r.surface.reject_batches(true);
        r.surface.fail_on(4);
        r.submit(&[2, 3, 4]);
        let settled = r.flush_and_settle().unwrap();
        assert!(settled.committed);

        let report = settled.outcome.report.unwrap();
        assert_eq!(report.path, CommitPath::PerItem);
        assert_eq!(report.broken, vec![4]);
        assert_eq!(report.shown, 2);
        assert!(!r.ctx.items.is_live(4));
        assert_eq!(r.engine.applied().to_vec(), vec![2, 3]);
        assert_eq!(r.surface.attached(), vec![2, 3]);

        // The forced detach failed too, so the handle waits in the quarantine.
        assert_eq!(r.ctx.items.quarantined(), 1);
        r.surface.heal(4);
        assert!(matches!(r.submit(&[2, 3, 4]), Submission::Queued { hide: 0, show: 0, .. }));
        let report = r.flush_and_settle().unwrap().outcome.report.unwrap();
        assert_eq!(report.quarantine_detached, 1);

        // Broken items never come back.
        assert_eq!(r.submit(&[2, 3, 4]), Submission::Noop);
    }

    #[test]
    fn failed_hide_keeps_handle_until_detached() {
        let mut r = rig(SurfaceCapabilities::SINGLE_ONLY);
        r.submit(&[0, 1, 2]);
        r.flush_and_settle();

        r.surface.fail_on(0);
        r.submit(&[1, 2]);
        let report = r.flush_and_settle().unwrap().outcome.report.unwrap();
        assert_eq!(report.broken, vec![0]);
        assert!(r.surface.is_attached(0));
        assert_eq!(r.ctx.items.quarantined(), 1);

        r.surface.heal(0);
        r.submit(&[1, 2]);
        r.flush_and_settle().unwrap();
        assert_eq!(r.ctx.items.quarantined(), 0);
        assert_eq!(r.surface.attached(), r.engine.applied().iter().map(u64::from).collect::<Vec<_>>());
    }

    #[test]
    fn batch_only_quarantine_survives_rejected_detach() {
        let batch_only = SurfaceCapabilities {
            batch_attach: true,
            batch_detach: true,
            single_attach: false,
            single_detach: false,
        };
        let mut r = rig(batch_only);
        r.submit(&[1, 2]);
        r.flush_and_settle();

        let handle = r.ctx.items.mark_broken(2).unwrap();
        r.ctx.items.quarantine(handle);
        assert!(r.engine.forget(2));
        r.surface.fail_on(2);
        r.submit(&[1]);
        let report = r.flush_and_settle().unwrap().outcome.report.unwrap();
        assert_eq!(report.quarantine_detached, 0);
        assert_eq!(r.ctx.items.quarantined(), 1);
        assert!(r.surface.is_attached(2));

        r.surface.heal(2);
        r.submit(&[1]);
        r.flush_and_settle().unwrap();
        assert_eq!(r.surface.attached(), vec![1]);
        assert_eq!(r.ctx.items.stranded_count(), 0);
    }

    #[test]
    fn persistent_detach_failure_is_stranded() {
        let mut r = rig(SurfaceCapabilities::SINGLE_ONLY);
        r.submit(&[3]);
        r.flush_and_settle();
        let handle = r.ctx.items.mark_broken(3).unwrap();
        r.ctx.items.quarantine(handle);
        r.engine.forget(3);
        r.surface.fail_on(3);

        for _ in 0..MAX_DETACH_ATTEMPTS {
            r.submit(&[]);
            r.flush_and_settle().unwrap();
        }
        assert_eq!(r.ctx.items.quarantined(), 0);
        assert_eq!(r.ctx.items.stranded_count(), 1);
        assert_eq!(r.submit(&[]), Submission::Noop);
    }

    #[test]
    fn newer_diff_supersedes_queued_one() {
        let mut r = rig(SurfaceCapabilities::ALL);
        r.submit(&[1]);
        let second = r.submit(&[5, 6]);
        assert!(matches!(second, Submission::Queued { replaced: true, .. }));
        assert_eq!(r.queue.len(), 1);

        r.flush_and_settle().unwrap();
        assert_eq!(r.engine.applied().to_vec(), vec![5, 6]);
        assert_eq!(r.surface.attached(), vec![5, 6]);
        assert_eq!(r.engine.stats().superseded, 1);
        assert_eq!(r.queue.stats().executed, 1);
    }

    #[test]
    fn same_target_twice_is_a_noop() {
        let mut r = rig(SurfaceCapabilities::ALL);
        r.submit(&[1, 2]);
        r.flush_and_settle();
        assert_eq!(r.submit(&[1, 2]), Submission::Noop);
        assert_eq!(r.submit(&[1, 2]), Submission::Noop);
        assert!(r.queue.is_empty());
        assert_eq!(r.engine.stats().noop, 2);
    }

    #[test]
    fn empty_diff_still_replaces_a_stale_pending_commit() {
        let mut r = rig(SurfaceCapabilities::ALL);
        r.submit(&[1, 2]);
        r.flush_and_settle();
        r.submit(&[7]);
        // Back to what is already applied before the frame ran.
        assert!(matches!(r.submit(&[1, 2]), Submission::Queued { hide: 0, show: 0, .. }));
        let settled = r.flush_and_settle().unwrap();
        assert_eq!(settled.outcome.report.map(|rep| rep.path), Some(CommitPath::Noop));
        assert_eq!(r.surface.attached(), vec![1, 2]);
    }

    #[test]
    fn quarantined_handles_are_detached_by_next_commit() {
        let mut r = rig(SurfaceCapabilities::SINGLE_ONLY);
        r.submit(&[1, 2]);
        r.flush_and_settle();

        let handle = r.ctx.items.mark_broken(2).unwrap();
        r.ctx.items.quarantine(handle);
        assert!(r.engine.forget(2));

        assert!(matches!(r.submit(&[1]), Submission::Queued { .. }));
        let report = r.flush_and_settle().unwrap().outcome.report.unwrap();
        assert_eq!(report.quarantine_detached, 1);
        assert_eq!(r.surface.attached(), vec![1]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reset_drops_pending_commit() {
        let mut r = rig(SurfaceCapabilities::ALL);
        r.submit(&[1]);
        r.flush_and_settle();
        r.submit(&[3]);
        let applied = r.engine.reset();
        assert_eq!(applied.to_vec(), vec![1]);
        assert!(r.engine.pending().is_none());
        r.queue.clear("reset");
        let mut drained = r.queue.wait_for_drain(std::time::Duration::from_millis(10));
        assert!(drained.try_outcome().is_some_and(|o| o.ok));
        assert!((&mut drained).await.ok);
    }

    proptest! {
        #[test]
        fn delta_partitions_the_symmetric_difference(
            applied in proptest::collection::vec(0u32..300, 0..80),
            target in proptest::collection::vec(0u32..300, 0..80),
        ) {
            let applied: VisibleSet = applied.into_iter().collect();
            let target: VisibleSet = target.into_iter().collect();
            let delta = compute_delta(&applied, &target);
            prop_assert!(delta.to_hide.intersect(&delta.to_show).is_empty());
            prop_assert_eq!(delta.to_hide.union(&delta.to_show), applied.symmetric_diff(&target));

            // Applying the delta reaches the target; diffing again is empty.
            let reached = applied.diff(&delta.to_hide).union(&delta.to_show);
            prop_assert_eq!(&reached, &target);
            prop_assert!(compute_delta(&reached, &target).is_empty());
        }
    }
}
