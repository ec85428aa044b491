/// Deterministic frame budgeting for time-slicing work.
///
/// Budgets are expressed in abstract "work units" rather than wall-clock time.
/// The write queue charges one unit per executed task, so a budget of `n`
/// units is "at most `n` surface mutations this frame".
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameBudget {
    total_units: u32,
    remaining_units: u32,
}

impl FrameBudget {
    pub fn new(units: u32) -> Self {
        Self {
            total_units: units,
            remaining_units: units,
        }
    }

    /// Budget for a flush that may run `max_tasks` tasks; zero is treated as one
    /// so a misconfigured queue still makes progress.
    pub fn tasks(max_tasks: u32) -> Self {
        Self::new(max_tasks.max(1))
    }

    /// A practically-unbounded budget (still deterministic).
    pub fn unlimited() -> Self {
        Self::new(u32::MAX)
    }

    pub fn remaining_units(&self) -> u32 {
        self.remaining_units
    }

    pub fn spent_units(&self) -> u32 {
        self.total_units - self.remaining_units
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_units == 0
    }

    /// Attempts to consume `units` from the budget.
    ///
    /// Returns `true` if the budget had enough remaining units.
    pub fn try_consume(&mut self, units: u32) -> bool {
        if self.remaining_units < units {
            return false;
        }
        self.remaining_units -= units;
        true
    }
}
