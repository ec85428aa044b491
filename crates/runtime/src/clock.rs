use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

use foundation::time::Time;

/// Monotonic time source.
///
/// Injected everywhere latency is measured so tests and replays can drive
/// time explicitly.
pub trait Clock {
    fn now(&self) -> Time;
}

/// Wall clock, measured from construction.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Time {
        Time(self.origin.elapsed().as_secs_f64())
    }
}

/// Manually advanced clock. Clones share the same instant.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_s: Rc<Cell<f64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, t: Time) {
        self.now_s.set(t.0);
    }

    pub fn advance_ms(&self, ms: f64) {
        self.now_s.set(self.now_s.get() + ms / 1000.0);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Time {
        Time(self.now_s.get())
    }
}
