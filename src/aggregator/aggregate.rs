use crate::config::MetricKind;

/// Running value for one metric definition.
///
/// All arithmetic wraps on `i32` overflow, matching the width of the
/// published snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricAggregate {
    kind: MetricKind,
    value: i32,
    observed: bool,
}

impl MetricAggregate {
    /// Creates a zeroed aggregate of the given kind.
    pub fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            value: 0,
            observed: false,
        }
    }

    /// Folds one observed value.
    ///
    /// `count` ignores the value and increments by one.
    pub fn record(&mut self, value: i32) {
        self.value = match self.kind {
            MetricKind::Count => self.value.wrapping_add(1),
            MetricKind::Sum => self.value.wrapping_add(value),
            MetricKind::Min if self.observed => self.value.min(value),
            MetricKind::Max if self.observed => self.value.max(value),
            MetricKind::Min | MetricKind::Max | MetricKind::Last => value,
        };
        self.observed = true;
    }

    /// Current value. Zero when nothing was recorded since the last reset.
    pub fn value(&self) -> i32 {
        self.value
    }

    /// Whether any value was recorded since the last reset.
    pub fn is_observed(&self) -> bool {
        self.observed
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn reset(&mut self) {
        self.value = 0;
        self.observed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_ignores_value() {
        let mut agg = MetricAggregate::new(MetricKind::Count);
        agg.record(1000);
        agg.record(-3);
        assert_eq!(agg.value(), 2);
    }

    #[test]
    fn test_sum_wraps() {
        let mut agg = MetricAggregate::new(MetricKind::Sum);
        agg.record(i32::MAX);
        agg.record(1);
        assert_eq!(agg.value(), i32::MIN);
    }

    #[test]
    fn test_min_max_first_observation_wins_over_zero() {
        let mut min = MetricAggregate::new(MetricKind::Min);
        let mut max = MetricAggregate::new(MetricKind::Max);
        for v in [7, 3, 9] {
            min.record(v);
            max.record(-v);
        }
        assert_eq!(min.value(), 3);
        assert_eq!(max.value(), -3);
    }

    #[test]
    fn test_last_keeps_latest() {
        let mut agg = MetricAggregate::new(MetricKind::Last);
        agg.record(4);
        agg.record(2);
        assert_eq!(agg.value(), 2);
    }

    #[test]
    fn test_reset_returns_to_zero_state() {
        let mut agg = MetricAggregate::new(MetricKind::Min);
        agg.record(5);
        agg.reset();
        assert_eq!(agg.value(), 0);
        assert!(!agg.is_observed());

        // After reset, the next observation seeds min again.
        agg.record(8);
        assert_eq!(agg.value(), 8);
    }
}
