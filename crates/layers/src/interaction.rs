use foundation::time::Time;

/// Explicit "user is panning/zooming" state.
///
/// Transitions are idempotent and bump `token`, which invalidates any
/// refresh requested under the previous state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InteractionState {
    interacting: bool,
    token: u64,
}

impl InteractionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_interacting(&self) -> bool {
        self.interacting
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Returns `true` if the state changed.
    pub fn enter(&mut self) -> bool {
        if self.interacting {
            return false;
        }
        self.interacting = true;
        self.token = self.token.wrapping_add(1);
        true
    }

    /// Returns `true` if the state changed.
    pub fn leave(&mut self) -> bool {
        if !self.interacting {
            return false;
        }
        self.interacting = false;
        self.token = self.token.wrapping_add(1);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefreshTicket {
    pub token: u64,
    pub requested_at: Time,
    pub due_at: Time,
}

/// Trailing-edge debounce for viewport-driven reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshDebouncer {
    delay_ms: f64,
    pending: Option<RefreshTicket>,
    discarded: u64,
}

impl RefreshDebouncer {
    pub fn new(delay_ms: f64) -> Self {
        Self {
            delay_ms: if delay_ms.is_finite() { delay_ms.max(0.0) } else { 0.0 },
            pending: None,
            discarded: 0,
        }
    }

    pub fn delay_ms(&self) -> f64 {
        self.delay_ms
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Stale tickets dropped so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// (Re)arm the debounce; a later request pushes the deadline back.
    pub fn request(&mut self, now: Time, token: u64) {
        let requested_at = self.pending.map_or(now, |p| p.requested_at);
        self.pending = Some(RefreshTicket {
            token,
            requested_at,
            due_at: Time(now.0 + self.delay_ms / 1000.0),
        });
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    /// Take the ticket once its deadline has passed. A ticket issued under a
    /// different interaction token is discarded instead.
    pub fn due(&mut self, now: Time, current_token: u64) -> Option<RefreshTicket> {
        let ticket = self.pending?;
        if now < ticket.due_at {
            return None;
        }
        self.pending = None;
        if ticket.token != current_token {
            self.discarded += 1;
            return None;
        }
        Some(ticket)
    }
}
