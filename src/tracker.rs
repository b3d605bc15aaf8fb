//! Size bookkeeping for the attempts of one mode or phase.

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SizeTracker {
    pub current: Option<u64>,
    pub previous: Option<u64>,
    pub best: Option<u64>,
}

impl SizeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new comparison window while keeping the best size.
    pub fn restart(&mut self) {
        self.current = None;
        self.previous = None;
    }

    pub fn record(&mut self, size: u64) {
        self.previous = self.current;
        self.current = Some(size);
    }

    pub fn set_best(&mut self, size: u64) {
        self.best = Some(size);
    }

    /// `|current - previous| / previous`, or `None` while there is nothing to compare.
    pub fn relative_change(&self) -> Option<f64> {
        match (self.current, self.previous) {
            (Some(current), Some(previous)) if previous > 0 => {
                Some((current as f64 - previous as f64).abs() / previous as f64)
            }
            _ => None,
        }
    }

    /// True when the last two sizes moved by less than `threshold`.
    pub fn stalled(&self, threshold: f64) -> bool {
        self.relative_change()
            .is_some_and(|change| change < threshold)
    }
}
