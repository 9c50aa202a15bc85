//! Per-backend failure tracking with disable/cooldown
//!
//! Some backends (vendor GPU APIs in particular) can hang or throw
//! intermittently under load. Trusting them unconditionally risks a
//! stall every cycle; banning them permanently loses real data once
//! the transient condition clears. The tracker disables a backend
//! after a run of consecutive failures, sits it out for a cooldown,
//! then grants exactly one retry probe and re-evaluates on that
//! probe's outcome.

use crate::backend::BackendKind;
use crate::config::HealthConfig;
use log::{info, warn};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Per-backend mutable health counters
#[derive(Debug, Clone, Default)]
struct BackendHealth {
    consecutive_failures: u32,
    disabled: bool,
    disabled_at: Option<Instant>,
    probe_granted: bool,
}

/// Consecutive-failure counter with disable/cooldown policy
pub struct HealthTracker {
    threshold: u32,
    cooldown: Duration,
    states: HashMap<BackendKind, BackendHealth>,
}

impl HealthTracker {
    /// Create a tracker from configuration
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            threshold: config.failure_threshold,
            cooldown: Duration::from_secs(config.cooldown_secs),
            states: HashMap::new(),
        }
    }

    /// Record a successful read: resets the failure counter and
    /// clears any disabled state
    pub fn record_success(&mut self, backend: BackendKind) {
        let state = self.states.entry(backend).or_default();
        if state.disabled {
            info!("backend {} recovered, re-enabling", backend);
        }
        state.consecutive_failures = 0;
        state.disabled = false;
        state.disabled_at = None;
        state.probe_granted = false;
    }

    /// Record a failed read; crossing the threshold disables the
    /// backend and stamps the disable time. A failed retry probe
    /// restarts the cooldown.
    pub fn record_failure(&mut self, backend: BackendKind) {
        let threshold = self.threshold;
        let state = self.states.entry(backend).or_default();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        if state.disabled {
            if state.probe_granted {
                // Probe failed: back to the bench for another cooldown
                state.probe_granted = false;
                state.disabled_at = Some(Instant::now());
            }
            return;
        }

        if state.consecutive_failures >= threshold {
            state.disabled = true;
            state.disabled_at = Some(Instant::now());
            // Logged once at the transition, not per occurrence
            warn!(
                "backend {} disabled after {} consecutive failures",
                backend, state.consecutive_failures
            );
        }
    }

    /// Whether the engine may call this backend now.
    ///
    /// False while disabled and cooling down. Once the cooldown has
    /// elapsed this returns true exactly once (the retry probe); the
    /// next `record_success`/`record_failure` decides what happens
    /// after that.
    pub fn is_eligible(&mut self, backend: BackendKind) -> bool {
        let cooldown = self.cooldown;
        let state = self.states.entry(backend).or_default();
        if !state.disabled {
            return true;
        }
        if state.probe_granted {
            // Probe already outstanding; wait for its outcome
            return false;
        }
        let elapsed = state
            .disabled_at
            .map(|t| t.elapsed() >= cooldown)
            .unwrap_or(true);
        if elapsed {
            state.probe_granted = true;
            return true;
        }
        false
    }

    /// Whether the backend is currently disabled
    pub fn is_disabled(&self, backend: BackendKind) -> bool {
        self.states
            .get(&backend)
            .map(|s| s.disabled)
            .unwrap_or(false)
    }

    /// Current consecutive-failure count
    pub fn failure_count(&self, backend: BackendKind) -> u32 {
        self.states
            .get(&backend)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }
}
