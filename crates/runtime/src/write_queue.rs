//! Frame-budgeted write queue for mutations against an expensive surface.
//!
//! Key properties:
//! - FIFO execution, at most `max_tasks_per_frame` task bodies per flush.
//! - At most one pending task per coalescing key. A replacing submission
//!   evicts the older task (settled as replaced) before it is enqueued.
//! - Guards run immediately before a body and may cancel it late.
//! - Every submission settles exactly once with a `TaskOutcome`; failures are
//!   values, never panics or errors crossing the queue boundary.
//! - The queue never halts: failing or panicking bodies are contained.
//!
//! Execution is single-threaded and cooperative. The owner calls
//! [`WriteQueue::flush`] from its frame callback with the mutable context the
//! task bodies operate on; the queue asks its [`FrameHost`] for another frame
//! while work remains.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use foundation::time::Time;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::budget::FrameBudget;
use crate::clock::Clock;
use crate::frame::{FrameHost, request_flush};

pub const DEFAULT_MAX_TASKS_PER_FRAME: u32 = 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Why a submission settled without its body running to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    GuardRejected,
    Replaced,
    DuplicateKey,
    Cleared(String),
    Timeout,
    InvalidInput(String),
    Dropped,
}

impl SkipReason {
    pub fn as_str(&self) -> &str {
        match self {
            SkipReason::GuardRejected => "guard_rejected",
            SkipReason::Replaced => "replaced",
            SkipReason::DuplicateKey => "duplicate_key",
            SkipReason::Cleared(reason) => reason,
            SkipReason::Timeout => "timeout",
            SkipReason::InvalidInput(_) => "invalid_input",
            SkipReason::Dropped => "dropped",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::InvalidInput(detail) => write!(f, "invalid_input: {detail}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Settlement value of a submitted task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome<R> {
    pub id: TaskId,
    pub ok: bool,
    pub skipped: bool,
    pub replaced: bool,
    pub reason: Option<SkipReason>,
    pub error: Option<TaskError>,
    pub duration_ms: f64,
    pub report: Option<R>,
}

impl<R> TaskOutcome<R> {
    pub fn completed(id: TaskId, duration_ms: f64, report: R) -> Self {
        Self {
            id,
            ok: true,
            skipped: false,
            replaced: false,
            reason: None,
            error: None,
            duration_ms,
            report: Some(report),
        }
    }

    pub fn failed(id: TaskId, duration_ms: f64, error: TaskError) -> Self {
        Self {
            id,
            ok: false,
            skipped: false,
            replaced: false,
            reason: None,
            error: Some(error),
            duration_ms,
            report: None,
        }
    }

    pub fn skipped(id: TaskId, reason: SkipReason) -> Self {
        Self {
            id,
            ok: false,
            skipped: true,
            replaced: reason == SkipReason::Replaced,
            reason: Some(reason),
            error: None,
            duration_ms: 0.0,
            report: None,
        }
    }
}

/// Outcome of [`WriteQueue::wait_for_drain`].
#[derive(Debug, Clone, PartialEq)]
pub struct DrainOutcome {
    pub ok: bool,
    pub reason: Option<SkipReason>,
    pub waited_ms: f64,
}

/// Value produced when a settlement channel closes without a value.
pub trait Settle {
    fn dropped(id: TaskId) -> Self;
}

impl<R> Settle for TaskOutcome<R> {
    fn dropped(id: TaskId) -> Self {
        TaskOutcome::skipped(id, SkipReason::Dropped)
    }
}

impl Settle for DrainOutcome {
    fn dropped(_id: TaskId) -> Self {
        DrainOutcome {
            ok: false,
            reason: Some(SkipReason::Dropped),
            waited_ms: 0.0,
        }
    }
}

/// Handle to a pending settlement.
///
/// Awaitable, and pollable without an executor through [`Ticket::try_outcome`]
/// so frame-driven callers can check it once per frame. Never errors: a queue
/// dropped before settling yields a `Dropped` outcome.
#[derive(Debug)]
pub struct Ticket<T> {
    id: TaskId,
    rx: oneshot::Receiver<T>,
    cached: Option<T>,
}

pub type TaskTicket<R> = Ticket<TaskOutcome<R>>;
pub type DrainTicket = Ticket<DrainOutcome>;

impl<T: Settle> Ticket<T> {
    fn new(id: TaskId, rx: oneshot::Receiver<T>) -> Self {
        Self {
            id,
            rx,
            cached: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Non-blocking check; returns the outcome once settled.
    pub fn try_outcome(&mut self) -> Option<&T> {
        if self.cached.is_none() {
            match self.rx.try_recv() {
                Ok(v) => self.cached = Some(v),
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.cached = Some(T::dropped(self.id));
                }
            }
        }
        self.cached.as_ref()
    }

    pub fn is_settled(&mut self) -> bool {
        self.try_outcome().is_some()
    }

    /// Takes the outcome out of the ticket once settled.
    pub fn take_outcome(&mut self) -> Option<T> {
        self.try_outcome()?;
        self.cached.take()
    }
}

impl<T: Settle + Unpin> Future for Ticket<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        if let Some(v) = this.cached.take() {
            return Poll::Ready(v);
        }
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(v)) => Poll::Ready(v),
            Poll::Ready(Err(_)) => Poll::Ready(T::dropped(this.id)),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub type TaskGuard<C> = Box<dyn Fn(&C) -> bool>;
type TaskBody<C, R> = Box<dyn FnOnce(&mut C) -> Result<R, TaskError>>;
type ErrorCallback = Box<dyn FnMut(TaskId, &str, &TaskError)>;

/// Per-submission options: coalescing key, replacement policy, late guard.
pub struct EnqueueOptions<C> {
    pub label: String,
    pub key: Option<String>,
    pub replace_existing: bool,
    pub guard: Option<TaskGuard<C>>,
}

impl<C> EnqueueOptions<C> {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            key: None,
            replace_existing: false,
            guard: None,
        }
    }

    pub fn keyed(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn replacing(mut self) -> Self {
        self.replace_existing = true;
        self
    }

    pub fn guarded(mut self, guard: impl Fn(&C) -> bool + 'static) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }
}

/// Result of [`WriteQueue::enqueue`].
#[derive(Debug)]
pub struct Enqueued<R> {
    pub accepted: bool,
    pub replaced: bool,
    pub id: TaskId,
    pub size: usize,
    pub ticket: TaskTicket<R>,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub executed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub replaced: u64,
    pub coalesced: u64,
    pub cleared: u64,
    pub flushes: u64,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub executed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub remaining: usize,
}

struct PendingTask<C, R> {
    id: TaskId,
    key: Option<String>,
    label: String,
    guard: Option<TaskGuard<C>>,
    body: TaskBody<C, R>,
    tx: oneshot::Sender<TaskOutcome<R>>,
}

struct DrainWaiter {
    started: Time,
    deadline: Time,
    tx: oneshot::Sender<DrainOutcome>,
}

enum Disposition {
    Executed,
    Failed,
    Skipped,
}

pub struct WriteQueue<C, R = ()> {
    next_id: u64,
    max_tasks_per_frame: u32,
    pending: VecDeque<PendingTask<C, R>>,
    flush_requested: bool,
    had_work: bool,
    disposed: bool,
    drain_listeners: Vec<Box<dyn FnOnce()>>,
    drain_waiters: Vec<DrainWaiter>,
    on_error: Option<ErrorCallback>,
    host: Box<dyn FrameHost>,
    clock: Rc<dyn Clock>,
    stats: QueueStats,
}

impl<C, R> std::fmt::Debug for WriteQueue<C, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueue")
            .field("len", &self.pending.len())
            .field("max_tasks_per_frame", &self.max_tasks_per_frame)
            .field("flush_requested", &self.flush_requested)
            .field("disposed", &self.disposed)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<C, R> WriteQueue<C, R> {
    pub fn new(max_tasks_per_frame: u32, host: Box<dyn FrameHost>, clock: Rc<dyn Clock>) -> Self {
        Self {
            next_id: 1,
            max_tasks_per_frame: max_tasks_per_frame.max(1),
            pending: VecDeque::new(),
            flush_requested: false,
            had_work: false,
            disposed: false,
            drain_listeners: Vec::new(),
            drain_waiters: Vec::new(),
            on_error: None,
            host,
            clock,
            stats: QueueStats::default(),
        }
    }

    /// Install the callback that receives every contained task failure.
    pub fn with_error_callback(
        mut self,
        callback: impl FnMut(TaskId, &str, &TaskError) + 'static,
    ) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    pub fn max_tasks_per_frame(&self) -> u32 {
        self.max_tasks_per_frame
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Empty and not mid-flush. Flushing borrows the queue mutably, so outside
    /// of `flush` this is equivalent to `is_empty`.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// A flush has been requested from the host and not yet delivered.
    pub fn needs_flush(&self) -> bool {
        self.flush_requested
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.pending.iter().any(|t| t.key.as_deref() == Some(key))
    }

    pub fn pending_keys(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().filter_map(|t| t.key.as_deref())
    }

    /// Submit a task body.
    ///
    /// Rejections (disposed queue, empty key, duplicate key without
    /// replacement) return `accepted: false` with an already-settled ticket.
    pub fn enqueue<F>(&mut self, opts: EnqueueOptions<C>, body: F) -> Enqueued<R>
    where
        F: FnOnce(&mut C) -> Result<R, TaskError> + 'static,
    {
        let id = TaskId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        let (tx, rx) = oneshot::channel();
        let ticket = Ticket::new(id, rx);

        let rejection = if self.disposed {
            Some(SkipReason::InvalidInput("queue disposed".to_string()))
        } else if opts.key.as_deref().is_some_and(str::is_empty) {
            Some(SkipReason::InvalidInput("empty coalescing key".to_string()))
        } else {
            None
        };
        if let Some(reason) = rejection {
            debug!(task = id.0, label = %opts.label, %reason, "write task rejected");
            self.stats.skipped += 1;
            let _ = tx.send(TaskOutcome::skipped(id, reason));
            return Enqueued {
                accepted: false,
                replaced: false,
                id,
                size: self.pending.len(),
                ticket,
            };
        }

        let mut replaced = false;
        if let Some(key) = opts.key.as_deref()
            && let Some(pos) = self
                .pending
                .iter()
                .position(|t| t.key.as_deref() == Some(key))
        {
            if !opts.replace_existing {
                self.stats.coalesced += 1;
                let _ = tx.send(TaskOutcome::skipped(id, SkipReason::DuplicateKey));
                return Enqueued {
                    accepted: false,
                    replaced: false,
                    id,
                    size: self.pending.len(),
                    ticket,
                };
            }
            if let Some(old) = self.pending.remove(pos) {
                debug!(task = old.id.0, by = id.0, key, "write task replaced");
                let _ = old.tx.send(TaskOutcome::skipped(old.id, SkipReason::Replaced));
                self.stats.replaced += 1;
                replaced = true;
            }
        }

        self.pending.push_back(PendingTask {
            id,
            key: opts.key,
            label: opts.label,
            guard: opts.guard,
            body: Box::new(body),
            tx,
        });
        self.stats.enqueued += 1;
        self.had_work = true;
        self.schedule_flush();

        Enqueued {
            accepted: true,
            replaced,
            id,
            size: self.pending.len(),
            ticket,
        }
    }

    /// Run up to `max_tasks_per_frame` task bodies against `ctx`.
    ///
    /// Guard-rejected tasks settle without consuming budget.
    pub fn flush(&mut self, ctx: &mut C) -> FlushSummary {
        self.flush_requested = false;
        self.stats.flushes += 1;

        let mut budget = FrameBudget::tasks(self.max_tasks_per_frame);
        let mut summary = FlushSummary::default();
        while !budget.is_exhausted() {
            let Some(task) = self.pending.pop_front() else {
                break;
            };
            match self.run_task(task, ctx, &mut budget) {
                Disposition::Executed => summary.executed += 1,
                Disposition::Failed => summary.failed += 1,
                Disposition::Skipped => summary.skipped += 1,
            }
        }
        summary.remaining = self.pending.len();

        let now = self.clock.now();
        if self.pending.is_empty() {
            self.notify_drained(now);
        } else {
            self.schedule_flush();
        }
        self.expire_drain_waiters(now);

        debug!(
            executed = summary.executed,
            failed = summary.failed,
            skipped = summary.skipped,
            remaining = summary.remaining,
            "write queue flushed"
        );
        summary
    }

    fn run_task(
        &mut self,
        task: PendingTask<C, R>,
        ctx: &mut C,
        budget: &mut FrameBudget,
    ) -> Disposition {
        let PendingTask {
            id,
            label,
            guard,
            body,
            tx,
            ..
        } = task;

        if let Some(guard) = guard {
            let allowed = catch_unwind(AssertUnwindSafe(|| guard(&*ctx))).unwrap_or_else(|_| {
                warn!(task = id.0, label = %label, "write task guard panicked");
                false
            });
            if !allowed {
                self.stats.skipped += 1;
                let _ = tx.send(TaskOutcome::skipped(id, SkipReason::GuardRejected));
                return Disposition::Skipped;
            }
        }

        budget.try_consume(1);
        let started = self.clock.now();
        let result = catch_unwind(AssertUnwindSafe(|| body(ctx)))
            .unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(payload.as_ref()))));
        let duration_ms = self.clock.now().millis_since(started);

        match result {
            Ok(report) => {
                self.stats.executed += 1;
                let _ = tx.send(TaskOutcome::completed(id, duration_ms, report));
                Disposition::Executed
            }
            Err(err) => {
                self.stats.failed += 1;
                warn!(task = id.0, label = %label, error = %err, "write task failed");
                if let Some(callback) = self.on_error.as_mut() {
                    callback(id, &label, &err);
                }
                let _ = tx.send(TaskOutcome::failed(id, duration_ms, err));
                Disposition::Failed
            }
        }
    }

    /// Evict every pending task, settling each as skipped with `reason`.
    ///
    /// Returns the number of evicted tasks.
    pub fn clear(&mut self, reason: &str) -> usize {
        let evicted = self.pending.len();
        for task in self.pending.drain(..) {
            let _ = task
                .tx
                .send(TaskOutcome::skipped(task.id, SkipReason::Cleared(reason.to_string())));
        }
        self.stats.cleared += evicted as u64;
        if evicted > 0 {
            debug!(evicted, reason, "write queue cleared");
        }
        let now = self.clock.now();
        self.notify_drained(now);
        evicted
    }

    /// Clear and refuse further submissions.
    pub fn dispose(&mut self) {
        self.clear("disposed");
        self.disposed = true;
        self.drain_listeners.clear();
    }

    /// Register a one-shot listener for the next transition to idle.
    ///
    /// Fires immediately when the queue is already idle.
    pub fn on_drain(&mut self, listener: impl FnOnce() + 'static) {
        if self.is_idle() {
            listener();
        } else {
            self.drain_listeners.push(Box::new(listener));
        }
    }

    /// Ticket that settles once the queue is idle, or `ok: false` with
    /// `Timeout` once a flush or [`WriteQueue::poll_timers`] observes the deadline.
    pub fn wait_for_drain(&mut self, timeout: Duration) -> DrainTicket {
        let id = TaskId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        let (tx, rx) = oneshot::channel();
        let now = self.clock.now();
        if self.is_idle() {
            let _ = tx.send(DrainOutcome {
                ok: true,
                reason: None,
                waited_ms: 0.0,
            });
        } else {
            self.drain_waiters.push(DrainWaiter {
                started: now,
                deadline: Time(now.0 + timeout.as_secs_f64()),
                tx,
            });
        }
        Ticket::new(id, rx)
    }

    /// Expire drain waiters whose deadline has passed without a flush.
    pub fn poll_timers(&mut self, now: Time) {
        self.expire_drain_waiters(now);
    }

    fn schedule_flush(&mut self) {
        if self.flush_requested || self.disposed {
            return;
        }
        self.flush_requested = true;
        request_flush(self.host.as_mut());
    }

    fn notify_drained(&mut self, now: Time) {
        for waiter in self.drain_waiters.drain(..) {
            let _ = waiter.tx.send(DrainOutcome {
                ok: true,
                reason: None,
                waited_ms: now.millis_since(waiter.started),
            });
        }
        if !self.had_work {
            return;
        }
        self.had_work = false;
        for listener in std::mem::take(&mut self.drain_listeners) {
            listener();
        }
    }

    fn expire_drain_waiters(&mut self, now: Time) {
        if self.drain_waiters.is_empty() {
            return;
        }
        let (expired, live): (Vec<_>, Vec<_>) = self
            .drain_waiters
            .drain(..)
            .partition(|w| now >= w.deadline);
        self.drain_waiters = live;
        for waiter in expired {
            let _ = waiter.tx.send(DrainOutcome {
                ok: false,
                reason: Some(SkipReason::Timeout),
                waited_ms: now.millis_since(waiter.started),
            });
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
