//! Stuck-value detection and escalating remediation
//!
//! A sensor that keeps returning the exact same value across many
//! polling cycles is more likely frozen than reporting a perfectly
//! steady state. The detector tracks a per-metric identical-value
//! streak and escalates: log a diagnostic, try an alternate source,
//! reinitialize the owning backend, and finally stop trusting the
//! source for that metric altogether.
//!
//! Temperatures get one extra rule: firmware on some models reports
//! the throttle threshold itself (TjMax) instead of the instantaneous
//! temperature. A CPU reading parked inside the thermal-limit band is
//! distrusted in favor of any other sensor reporting a lower,
//! plausible value.

use crate::config::StuckConfig;
use crate::metric::MetricId;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Escalation stage of a metric's stuck-value state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StuckStage {
    /// Value is changing; streak empty or short
    Fresh,
    /// Streak crossed the diagnostic threshold
    RepeatingLow,
    /// Streak crossed the remediation threshold
    RepeatingHigh,
    /// Remediation exhausted; source distrusted for this metric
    PersistentlyStuck,
}

/// What the reconciliation loop should do after feeding a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckAction {
    /// Value accepted, nothing to do
    Accept,
    /// Streak is suspicious; a diagnostic was logged, no remediation
    Logged,
    /// Read an alternate source for this metric; if it differs
    /// meaningfully, take it and the streak resets
    TryAlternate,
    /// Reinitialize the backend that produced the value
    Reinitialize,
    /// Stop trusting this source for this metric until it recovers
    ForceFallback,
    /// Temperature parked at the thermal-limit sentinel; prefer any
    /// lower plausible reading from another source
    SentinelSuspect,
}

#[derive(Debug, Clone, Default)]
struct MetricStuckState {
    last_value: Option<f64>,
    streak: u32,
    remediation_attempts: u32,
    stage: StuckStage,
    logged: bool,
}

impl Default for StuckStage {
    fn default() -> Self {
        StuckStage::Fresh
    }
}

/// Per-metric repeated-identical-value state machine
pub struct StuckValueDetector {
    config: StuckConfig,
    states: HashMap<MetricId, MetricStuckState>,
}

impl StuckValueDetector {
    /// Create a detector from configuration
    pub fn new(config: &StuckConfig) -> Self {
        Self {
            config: config.clone(),
            states: HashMap::new(),
        }
    }

    /// Feed one observed value and get the action to take.
    ///
    /// The remediation actions fire once per threshold crossing, not
    /// once per subsequent identical read: after `TryAlternate` at the
    /// remediation streak, the next episode requires a further full
    /// streak run.
    pub fn observe(&mut self, metric: MetricId, value: f64) -> StuckAction {
        let epsilon = metric.change_epsilon();
        let state = self.states.entry(metric).or_default();

        // Metrics with epsilon 0 (fixed totals) are exempt
        if epsilon == 0.0 {
            state.last_value = Some(value);
            return StuckAction::Accept;
        }

        let changed = match state.last_value {
            Some(last) => (value - last).abs() > epsilon,
            None => true,
        };

        if changed {
            state.last_value = Some(value);
            state.streak = 0;
            state.remediation_attempts = 0;
            state.stage = StuckStage::Fresh;
            state.logged = false;
            return StuckAction::Accept;
        }

        state.streak = state.streak.saturating_add(1);

        // Thermal-limit sentinel: a CPU temperature parked inside the
        // band is suspect well before the generic thresholds trip.
        if metric.is_cpu_temperature()
            && value >= self.config.sentinel_band_low
            && value <= self.config.sentinel_band_high
            && state.streak >= self.config.sentinel_streak
        {
            if !state.logged {
                warn!(
                    "{} parked at {:.0}{} for {} reads; treating as limit sentinel",
                    metric,
                    value,
                    metric.unit(),
                    state.streak + 1
                );
                state.logged = true;
            }
            return StuckAction::SentinelSuspect;
        }

        if state.stage == StuckStage::PersistentlyStuck {
            // Already demoted; nothing further until the value moves
            return StuckAction::Accept;
        }

        // Remediation episodes at N, 2N, 3N identical reads; a zero
        // threshold disables remediation outright
        if self.config.remediate_streak > 0
            && state.streak >= self.config.remediate_streak
            && state.streak % self.config.remediate_streak == 0
        {
            state.stage = StuckStage::RepeatingHigh;
            state.remediation_attempts = state.remediation_attempts.saturating_add(1);
            if state.remediation_attempts > self.config.max_remediations {
                state.stage = StuckStage::PersistentlyStuck;
                warn!(
                    "{} stuck at {:.1}{} through {} remediation attempts; forcing fallback",
                    metric,
                    value,
                    metric.unit(),
                    self.config.max_remediations
                );
                return StuckAction::ForceFallback;
            }
            debug!(
                "{} unchanged for {} reads; remediation attempt {}",
                metric, state.streak, state.remediation_attempts
            );
            return StuckAction::TryAlternate;
        }

        if state.streak >= self.config.log_streak {
            if state.stage == StuckStage::Fresh {
                state.stage = StuckStage::RepeatingLow;
                debug!(
                    "{} unchanged at {:.1}{} for {} reads",
                    metric,
                    value,
                    metric.unit(),
                    state.streak
                );
                return StuckAction::Logged;
            }
        }

        StuckAction::Accept
    }

    /// Escalation after a `TryAlternate` episode found no differing
    /// source: reinitialize the backend, or give up once remediation
    /// is exhausted.
    pub fn remediation_failed(&mut self, metric: MetricId) -> StuckAction {
        let state = self.states.entry(metric).or_default();
        if state.remediation_attempts >= self.config.max_remediations {
            state.stage = StuckStage::PersistentlyStuck;
            warn!(
                "{} remediation exhausted after {} attempts; forcing fallback",
                metric, state.remediation_attempts
            );
            return StuckAction::ForceFallback;
        }
        StuckAction::Reinitialize
    }

    /// Reset a metric's streak (an alternate source supplied a
    /// meaningfully different value)
    pub fn reset(&mut self, metric: MetricId, new_value: f64) {
        let state = self.states.entry(metric).or_default();
        state.last_value = Some(new_value);
        state.streak = 0;
        state.remediation_attempts = 0;
        state.stage = StuckStage::Fresh;
        state.logged = false;
    }

    /// Current escalation stage for a metric
    pub fn stage(&self, metric: MetricId) -> StuckStage {
        self.states
            .get(&metric)
            .map(|s| s.stage)
            .unwrap_or(StuckStage::Fresh)
    }

    /// Current identical-value streak for a metric
    pub fn streak(&self, metric: MetricId) -> u32 {
        self.states.get(&metric).map(|s| s.streak).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> StuckValueDetector {
        StuckValueDetector::new(&StuckConfig::default())
    }

    #[test]
    fn test_changing_values_stay_fresh() {
        let mut d = detector();
        for i in 0..50 {
            let action = d.observe(MetricId::GpuPower, 40.0 + i as f64);
            assert_eq!(action, StuckAction::Accept);
        }
        assert_eq!(d.stage(MetricId::GpuPower), StuckStage::Fresh);
    }

    #[test]
    fn test_log_threshold_fires_once() {
        let mut d = detector();
        let mut logged = 0;
        for _ in 0..9 {
            if d.observe(MetricId::GpuLoad, 55.0) == StuckAction::Logged {
                logged += 1;
            }
        }
        assert_eq!(logged, 1);
    }

    #[test]
    fn test_remediation_fires_exactly_once_per_threshold() {
        // P7: threshold_remediate identical feeds trigger exactly one
        // remediation attempt, not one per subsequent identical read
        let mut d = detector();
        let mut remediations = 0;
        // First feed establishes the value; the next 10 build the streak
        for _ in 0..12 {
            if d.observe(MetricId::GpuPower, 47.5) == StuckAction::TryAlternate {
                remediations += 1;
            }
        }
        assert_eq!(remediations, 1);
    }

    #[test]
    fn test_second_episode_needs_full_streak() {
        let mut d = detector();
        let mut episodes = Vec::new();
        for i in 0..22 {
            if d.observe(MetricId::GpuPower, 47.5) == StuckAction::TryAlternate {
                episodes.push(i);
            }
        }
        // Episodes at streak 10 and 20 (feeds 10 and 20; feed 0 set the value)
        assert_eq!(episodes.len(), 2);
        assert_eq!(episodes[1] - episodes[0], 10);
    }

    #[test]
    fn test_force_fallback_after_max_remediations() {
        let mut d = detector();
        let mut saw_fallback = false;
        for _ in 0..45 {
            match d.observe(MetricId::GpuTemperature, 70.0) {
                StuckAction::ForceFallback => {
                    saw_fallback = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_fallback);
        assert_eq!(
            d.stage(MetricId::GpuTemperature),
            StuckStage::PersistentlyStuck
        );
    }

    #[test]
    fn test_meaningful_change_resets_everything() {
        let mut d = detector();
        for _ in 0..11 {
            d.observe(MetricId::GpuPower, 47.5);
        }
        assert!(d.streak(MetricId::GpuPower) > 0);
        let action = d.observe(MetricId::GpuPower, 60.0);
        assert_eq!(action, StuckAction::Accept);
        assert_eq!(d.streak(MetricId::GpuPower), 0);
        assert_eq!(d.stage(MetricId::GpuPower), StuckStage::Fresh);
    }

    #[test]
    fn test_sub_epsilon_jitter_counts_as_identical() {
        let mut d = detector();
        // Temperature epsilon is 0.5; 0.2 swings are jitter
        d.observe(MetricId::GpuTemperature, 70.0);
        for _ in 0..6 {
            d.observe(MetricId::GpuTemperature, 70.2);
            d.observe(MetricId::GpuTemperature, 70.0);
        }
        assert!(d.streak(MetricId::GpuTemperature) >= 5);
    }

    #[test]
    fn test_tjmax_sentinel_suspected_quickly() {
        let mut d = detector();
        d.observe(MetricId::CpuTemperature, 97.0);
        d.observe(MetricId::CpuTemperature, 97.0);
        d.observe(MetricId::CpuTemperature, 97.0);
        // Third identical read reaches the sentinel streak
        let action = d.observe(MetricId::CpuTemperature, 97.0);
        assert_eq!(action, StuckAction::SentinelSuspect);
    }

    #[test]
    fn test_sentinel_only_inside_band() {
        let mut d = detector();
        for _ in 0..5 {
            let action = d.observe(MetricId::CpuTemperature, 85.0);
            assert_ne!(action, StuckAction::SentinelSuspect);
        }
    }

    #[test]
    fn test_remediation_failed_escalates_then_gives_up() {
        let mut d = detector();
        for _ in 0..11 {
            d.observe(MetricId::SsdTemperature, 41.0);
        }
        assert_eq!(
            d.remediation_failed(MetricId::SsdTemperature),
            StuckAction::Reinitialize
        );
        // Exhaust the remaining attempts
        for _ in 0..25 {
            d.observe(MetricId::SsdTemperature, 41.0);
        }
        assert_eq!(
            d.remediation_failed(MetricId::SsdTemperature),
            StuckAction::ForceFallback
        );
    }

    #[test]
    fn test_reset_clears_sentinel_state() {
        let mut d = detector();
        for _ in 0..4 {
            d.observe(MetricId::CpuTemperature, 97.0);
        }
        d.reset(MetricId::CpuTemperature, 62.0);
        assert_eq!(d.streak(MetricId::CpuTemperature), 0);
        let action = d.observe(MetricId::CpuTemperature, 62.5);
        assert_eq!(action, StuckAction::Accept);
    }
}
