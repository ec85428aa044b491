/// Engine time in seconds.
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd, Default)]
pub struct Time(pub f64);

impl Time {
    pub fn as_millis(self) -> f64 {
        self.0 * 1000.0
    }

    pub fn from_millis(ms: f64) -> Self {
        Time(ms / 1000.0)
    }

    /// Milliseconds elapsed since `earlier`, saturating at zero.
    pub fn millis_since(self, earlier: Time) -> f64 {
        ((self.0 - earlier.0) * 1000.0).max(0.0)
    }
}
