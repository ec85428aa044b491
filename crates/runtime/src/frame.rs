use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use foundation::time::Time;

/// Delay used when the host cannot deliver animation-frame callbacks.
pub const TIMER_FALLBACK_DELAY: Duration = Duration::from_millis(16);

/// Metadata for one scheduling tick delivered by the host.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Frame {
    /// 0-based frame index.
    pub index: u64,
    /// Host time at the start of the frame.
    pub time: Time,
}

impl Frame {
    pub fn new(index: u64, time: Time) -> Self {
        Self { index, time }
    }

    pub fn next(self, time: Time) -> Self {
        Self::new(self.index + 1, time)
    }
}

/// How a flush was requested from the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameSource {
    AnimationFrame,
    Timer,
}

/// Host-side scheduling hooks.
///
/// The host answers a request by eventually calling back into the owner of
/// the queue (e.g. `OverlayLayer::on_frame`). Requests are idempotent hints;
/// the queue never has more than one outstanding.
pub trait FrameHost {
    fn supports_animation_frames(&self) -> bool;
    fn request_animation_frame(&mut self);
    fn request_timeout(&mut self, delay: Duration);
}

/// Request the next flush, preferring animation frames over the timer fallback.
pub fn request_flush(host: &mut dyn FrameHost) -> FrameSource {
    if host.supports_animation_frames() {
        host.request_animation_frame();
        FrameSource::AnimationFrame
    } else {
        host.request_timeout(TIMER_FALLBACK_DELAY);
        FrameSource::Timer
    }
}

/// Host that only counts requests. Clones share counters.
///
/// Used by the bench driver and tests, where frames are pumped explicitly.
#[derive(Debug, Clone)]
pub struct RecordingFrameHost {
    animation_frames: bool,
    raf_requests: Rc<Cell<u64>>,
    timer_requests: Rc<Cell<u64>>,
}

impl RecordingFrameHost {
    pub fn new(animation_frames: bool) -> Self {
        Self {
            animation_frames,
            raf_requests: Rc::new(Cell::new(0)),
            timer_requests: Rc::new(Cell::new(0)),
        }
    }

    pub fn raf_requests(&self) -> u64 {
        self.raf_requests.get()
    }

    pub fn timer_requests(&self) -> u64 {
        self.timer_requests.get()
    }
}

impl Default for RecordingFrameHost {
    fn default() -> Self {
        Self::new(true)
    }
}

impl FrameHost for RecordingFrameHost {
    fn supports_animation_frames(&self) -> bool {
        self.animation_frames
    }

    fn request_animation_frame(&mut self) {
        self.raf_requests.set(self.raf_requests.get() + 1);
    }

    fn request_timeout(&mut self, _delay: Duration) {
        self.timer_requests.set(self.timer_requests.get() + 1);
    }
}
