//! Zero-transient suppression for power and RPM telemetry
//!
//! Several power sources intermittently report zero for a few polling
//! cycles while the component is clearly active, which would otherwise
//! flicker through to consumers as false "power off" readings. The
//! stabilizer substitutes the last known positive value for a bounded
//! run of zeros, but only while independent evidence (load or
//! temperature) says the system is plausibly active. Past the cap the
//! zero is trusted: a component that has genuinely powered off must
//! not be reported at its old draw forever.

use crate::config::StabilizerConfig;
use crate::metric::MetricId;
use std::collections::HashMap;

/// Per-metric stabilizer state
#[derive(Debug, Clone, Copy, Default)]
struct StabilizerState {
    last_valid: f64,
    zero_streak: u32,
}

/// Smooths instantaneous power/RPM readings that intermittently report
/// zero despite an active system
pub struct PowerStabilizer {
    config: StabilizerConfig,
    states: HashMap<MetricId, StabilizerState>,
}

impl PowerStabilizer {
    /// Create a stabilizer from configuration
    pub fn new(config: &StabilizerConfig) -> Self {
        Self {
            config: config.clone(),
            states: HashMap::new(),
        }
    }

    /// Stabilize one reading.
    ///
    /// `load_percent` and `temperature_c` are the activity-evidence
    /// pair for this metric (see `MetricId::activity_evidence`), taken
    /// from the same reconciliation pass.
    pub fn stabilize(
        &mut self,
        metric: MetricId,
        raw: f64,
        load_percent: f64,
        temperature_c: f64,
    ) -> f64 {
        let state = self.states.entry(metric).or_default();

        if raw > 0.0 {
            state.last_valid = raw;
            state.zero_streak = 0;
            return raw;
        }

        state.zero_streak = state.zero_streak.saturating_add(1);

        let active = load_percent >= self.config.load_activity_percent
            || temperature_c >= self.config.temp_activity_celsius;

        if state.zero_streak > self.config.max_zero_streak {
            // The sensor has been dark too long; trust the zero and
            // forget the remembered value so it cannot resurface
            state.last_valid = 0.0;
            return 0.0;
        }

        if active && state.last_valid > 0.0 {
            return state.last_valid;
        }

        0.0
    }

    /// Current zero streak for a metric
    pub fn zero_streak(&self, metric: MetricId) -> u32 {
        self.states
            .get(&metric)
            .map(|s| s.zero_streak)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stabilizer() -> PowerStabilizer {
        PowerStabilizer::new(&StabilizerConfig::default())
    }

    #[test]
    fn test_positive_reading_passes_through() {
        // P3: a strictly positive reading is always returned unchanged
        // and resets the zero streak
        let mut s = stabilizer();
        s.stabilize(MetricId::GpuPower, 0.0, 45.0, 60.0);
        s.stabilize(MetricId::GpuPower, 0.0, 45.0, 60.0);
        assert!(s.zero_streak(MetricId::GpuPower) > 0);

        let out = s.stabilize(MetricId::GpuPower, 37.2, 45.0, 60.0);
        assert_eq!(out, 37.2);
        assert_eq!(s.zero_streak(MetricId::GpuPower), 0);
    }

    #[test]
    fn test_zero_without_activity_propagates() {
        // P3: zero with no activity evidence is returned as zero
        let mut s = stabilizer();
        s.stabilize(MetricId::CpuPower, 25.0, 50.0, 70.0);
        let out = s.stabilize(MetricId::CpuPower, 0.0, 0.5, 25.0);
        assert_eq!(out, 0.0);
    }

    #[test]
    fn test_bounded_substitution_under_activity() {
        // P4 / Scenario B: zeros with activity evidence return the
        // last valid value for the whole run below the cap
        let mut s = stabilizer();
        s.stabilize(MetricId::GpuPower, 42.0, 45.0, 60.0);
        for _ in 0..10 {
            let out = s.stabilize(MetricId::GpuPower, 0.0, 45.0, 60.0);
            assert_eq!(out, 42.0);
        }
    }

    #[test]
    fn test_substitution_stops_past_cap() {
        // P4: past the cap the zero wins regardless of activity, and
        // the remembered value is forgotten
        let mut s = stabilizer();
        s.stabilize(MetricId::GpuPower, 42.0, 45.0, 60.0);
        let cap = StabilizerConfig::default().max_zero_streak;
        for _ in 0..cap {
            assert_eq!(s.stabilize(MetricId::GpuPower, 0.0, 45.0, 60.0), 42.0);
        }
        assert_eq!(s.stabilize(MetricId::GpuPower, 0.0, 45.0, 60.0), 0.0);
        // Even renewed activity cannot resurrect the stale value
        assert_eq!(s.stabilize(MetricId::GpuPower, 0.0, 90.0, 80.0), 0.0);
    }

    #[test]
    fn test_temperature_alone_counts_as_activity() {
        let mut s = stabilizer();
        s.stabilize(MetricId::FanRpmCpu, 2400.0, 0.0, 50.0);
        let out = s.stabilize(MetricId::FanRpmCpu, 0.0, 0.0, 50.0);
        assert_eq!(out, 2400.0);
    }

    #[test]
    fn test_metrics_tracked_independently() {
        let mut s = stabilizer();
        s.stabilize(MetricId::CpuPower, 20.0, 50.0, 70.0);
        s.stabilize(MetricId::GpuPower, 80.0, 50.0, 70.0);
        assert_eq!(s.stabilize(MetricId::CpuPower, 0.0, 50.0, 70.0), 20.0);
        assert_eq!(s.stabilize(MetricId::GpuPower, 0.0, 50.0, 70.0), 80.0);
        assert_eq!(s.zero_streak(MetricId::CpuPower), 1);
        assert_eq!(s.zero_streak(MetricId::GpuPower), 1);
    }

    #[test]
    fn test_recovery_after_cap_requires_positive_reading() {
        let mut s = stabilizer();
        s.stabilize(MetricId::GpuPower, 42.0, 45.0, 60.0);
        let cap = StabilizerConfig::default().max_zero_streak;
        for _ in 0..=cap {
            s.stabilize(MetricId::GpuPower, 0.0, 45.0, 60.0);
        }
        // A fresh positive reading re-arms substitution
        assert_eq!(s.stabilize(MetricId::GpuPower, 55.0, 45.0, 60.0), 55.0);
        assert_eq!(s.stabilize(MetricId::GpuPower, 0.0, 45.0, 60.0), 55.0);
    }
}
