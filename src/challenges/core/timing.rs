//! Failover backoff schedule.
//!
//! Transient network failures are retried after a delay that grows linearly
//! with the attempt number and is capped, so a long outage never stretches a
//! single fetch beyond a bounded wait per attempt.

use std::time::Duration;

/// Linear backoff: `min(cap, (attempt + 1) * 2 + attempt * 0.5)` units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailoverBackoff {
    unit: Duration,
    cap_units: f64,
}

impl FailoverBackoff {
    pub const DEFAULT_CAP_UNITS: f64 = 30.0;

    pub fn new(unit: Duration) -> Self {
        Self {
            unit,
            cap_units: Self::DEFAULT_CAP_UNITS,
        }
    }

    pub fn with_cap(mut self, cap_units: f64) -> Self {
        self.cap_units = cap_units.max(0.0);
        self
    }

    /// No waiting at all; used by tests and latency-critical callers.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn units_for(&self, attempt: u32) -> f64 {
        let attempt = attempt as f64;
        ((attempt + 1.0) * 2.0 + attempt * 0.5).min(self.cap_units)
    }

    /// Delay to apply after the zero-based `attempt` failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.unit.mul_f64(self.units_for(attempt))
    }
}

impl Default for FailoverBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_linearly_then_caps() {
        let backoff = FailoverBackoff::default();
        assert_eq!(backoff.delay_for(0), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(4_500));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(7));
        assert_eq!(backoff.delay_for(20), Duration::from_secs(30));
    }

    #[test]
    fn immediate_never_waits() {
        assert_eq!(FailoverBackoff::immediate().delay_for(5), Duration::ZERO);
    }
}
