//! Sensor reconciliation engine
//!
//! One polling cycle turns N unreliable, racy, sometimes-absent data
//! sources into one trustworthy `MonitoringSample`. Per metric the
//! engine walks a priority-ordered fallback chain, skipping backends
//! the health tracker has benched and backends inside their minimum
//! call interval, feeding every successful read through the stuck
//! detector and (for power/RPM telemetry) the stabilizer.
//!
//! Concurrency model: the sample cache serves repeated reads inside
//! the freshness window without touching hardware; expired callers
//! funnel through a single update lock, so at most one hardware pass
//! runs system-wide and concurrent callers receive that pass's result
//! rather than triggering duplicate driver calls.

use crate::backend::{BackendSet, ReadError, SensorBackend};
use crate::config::{EngineConfig, VulcanConfig};
use crate::error::{Result, VulcanError};
use crate::health::HealthTracker;
use crate::metric::MetricId;
use crate::sample::{MetricSource, MonitoringSample, ThrottleFlags};
use crate::stabilizer::PowerStabilizer;
use crate::stuck::{StuckAction, StuckValueDetector};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Cooperative cancellation token checked at the top of `read_sample`.
/// A pass already in flight completes; native calls are not safely
/// preemptible mid-call.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fresh, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Mutable reconciliation state, serialized by the update lock
struct EngineState {
    backends: BackendSet,
    health: HealthTracker,
    stuck: StuckValueDetector,
    stabilizer: PowerStabilizer,
    /// Last call time per (metric, backend index), for min-interval
    /// enforcement
    last_call: HashMap<(MetricId, usize), Instant>,
    /// (metric, backend index) pairs in forced-fallback mode
    demoted: HashSet<(MetricId, usize)>,
    /// Most recently completed sample, for held-value composition
    last_sample: Option<MonitoringSample>,
}

/// Produces one reconciled `MonitoringSample` per polling cycle
pub struct ReconciliationEngine {
    cache: RwLock<Option<(MonitoringSample, Instant)>>,
    state: Mutex<EngineState>,
    config: EngineConfig,
    low_overhead: AtomicBool,
}

impl ReconciliationEngine {
    /// Build an engine over an explicit backend set
    pub fn new(backends: BackendSet, config: &VulcanConfig) -> Self {
        Self {
            cache: RwLock::new(None),
            state: Mutex::new(EngineState {
                backends,
                health: HealthTracker::new(&config.health),
                stuck: StuckValueDetector::new(&config.stuck),
                stabilizer: PowerStabilizer::new(&config.stabilizer),
                last_call: HashMap::new(),
                demoted: HashSet::new(),
                last_sample: None,
            }),
            config: config.engine.clone(),
            low_overhead: AtomicBool::new(false),
        }
    }

    /// Build an engine over the probed production backends
    pub fn detect(config: &VulcanConfig) -> Self {
        Self::new(BackendSet::detect(), config)
    }

    /// Toggle low-overhead mode: widens the cache freshness window so
    /// driver calls happen far less often
    pub fn set_low_overhead(&self, enabled: bool) {
        self.low_overhead.store(enabled, Ordering::SeqCst);
    }

    fn freshness_window(&self) -> Duration {
        let ms = if self.low_overhead.load(Ordering::SeqCst) {
            self.config.low_overhead_freshness_ms
        } else {
            self.config.freshness_ms
        };
        Duration::from_millis(ms)
    }

    fn cached_if_fresh(&self) -> Option<MonitoringSample> {
        let window = self.freshness_window();
        let guard = self.cache.read().expect("sample cache poisoned");
        guard.as_ref().and_then(|(sample, at)| {
            if at.elapsed() <= window {
                Some(sample.clone())
            } else {
                None
            }
        })
    }

    /// Return the current sample, polling hardware only when the cache
    /// has expired.
    ///
    /// Concurrent callers during an in-flight update block on the
    /// update lock and then find a fresh cache; they never start a
    /// second pass.
    pub fn read_sample(&self, token: &CancelToken) -> Result<MonitoringSample> {
        if token.is_cancelled() {
            return Err(VulcanError::Cancelled);
        }

        if let Some(sample) = self.cached_if_fresh() {
            return Ok(sample);
        }

        let mut state = self.state.lock().expect("engine state poisoned");

        // Someone else may have completed a pass while we waited
        if let Some(sample) = self.cached_if_fresh() {
            return Ok(sample);
        }

        let sample = run_pass(&mut state, &self.config);
        state.last_sample = Some(sample.clone());

        let mut cache = self.cache.write().expect("sample cache poisoned");
        *cache = Some((sample.clone(), Instant::now()));
        Ok(sample)
    }
}

/// One full reconciliation pass over every metric
fn run_pass(state: &mut EngineState, config: &EngineConfig) -> MonitoringSample {
    let mut sample = MonitoringSample::empty();
    let budget = Duration::from_millis(config.call_budget_ms);

    for metric in MetricId::ALL {
        match reconcile_metric(state, metric, &sample, budget) {
            Some((value, kind)) => {
                sample.set_value(metric, value);
                sample.sources.insert(metric, MetricSource::Live(kind));
            }
            None => {
                // Retain the previous value rather than reporting a
                // hard zero; a metric that has never had a value keeps
                // the sentinel with unavailable attribution
                if let Some(prev) = &state.last_sample {
                    match prev.source(metric) {
                        MetricSource::Live(kind) | MetricSource::Held(kind) => {
                            sample.set_value(metric, prev.value(metric));
                            sample.sources.insert(metric, MetricSource::Held(kind));
                        }
                        MetricSource::Unavailable => {}
                    }
                }
            }
        }
    }

    sample.throttle = collect_throttle(&mut state.backends);
    collect_battery_extras(&mut state.backends, &mut sample);
    sample.timestamp = chrono::Utc::now().timestamp();
    sample
}

/// Walk one metric's fallback chain and produce a value
fn reconcile_metric(
    state: &mut EngineState,
    metric: MetricId,
    partial: &MonitoringSample,
    budget: Duration,
) -> Option<(f64, crate::backend::BackendKind)> {
    let chain: Vec<usize> = state.backends.chain(metric).to_vec();

    for idx in chain.iter().copied() {
        if state.demoted.contains(&(metric, idx)) {
            continue;
        }
        let kind = state.backends.kind_of(idx);
        if !state.health.is_eligible(kind) {
            continue;
        }
        // Respect the backend's hardware-cost throttle. A skip is not
        // a failure; the held value covers the gap.
        let min_interval = state.backends.get(idx).min_interval();
        if let Some(last) = state.last_call.get(&(metric, idx)) {
            if last.elapsed() < min_interval {
                continue;
            }
        }

        let started = Instant::now();
        let outcome = state.backends.get_mut(idx).try_read(metric);
        state.last_call.insert((metric, idx), started);
        let elapsed = started.elapsed();

        match outcome {
            Ok(raw) => {
                if elapsed > budget {
                    // Treated as a failure for this cycle so one
                    // misbehaving native call cannot stall the loop
                    // unnoticed; the call itself already happened.
                    warn!(
                        "{} read of {} took {:?}, over the {:?} budget",
                        kind, metric, elapsed, budget
                    );
                    state.health.record_failure(kind);
                    continue;
                }
                state.health.record_success(kind);

                let value = apply_stabilizer(state, metric, raw, partial);
                match state.stuck.observe(metric, value) {
                    StuckAction::Accept | StuckAction::Logged => {}
                    StuckAction::TryAlternate => {
                        if let Some(result) =
                            try_alternates(state, metric, idx, value, &chain, false)
                        {
                            return Some(result);
                        }
                        escalate(state, metric, idx);
                    }
                    StuckAction::SentinelSuspect => {
                        // Prefer any lower, plausible reading over the
                        // parked limit value; no escalation otherwise
                        if let Some(result) =
                            try_alternates(state, metric, idx, value, &chain, true)
                        {
                            return Some(result);
                        }
                    }
                    StuckAction::Reinitialize => {
                        reinit_backend(state, metric, idx);
                    }
                    StuckAction::ForceFallback => {
                        demote(state, metric, idx);
                    }
                }

                // A meaningful change lifts any forced-fallback
                // demotions for this metric
                if state.stuck.streak(metric) == 0 {
                    state.demoted.retain(|(m, _)| *m != metric);
                }

                return Some((value, kind));
            }
            Err(ReadError::NotSupported) => {
                // Chain construction bug; skip without penalty
                debug!("{} does not support {}", kind, metric);
                continue;
            }
            Err(err) => {
                debug!("{} read of {} failed: {}", kind, metric, err);
                state.health.record_failure(kind);
                continue;
            }
        }
    }

    None
}

/// Route power-like metrics through the stabilizer, using activity
/// evidence already reconciled earlier in this pass
fn apply_stabilizer(
    state: &mut EngineState,
    metric: MetricId,
    raw: f64,
    partial: &MonitoringSample,
) -> f64 {
    if !metric.is_power_like() {
        return raw;
    }
    let (load, temp) = match metric.activity_evidence() {
        Some((load_metric, temp_metric)) => {
            (partial.value(load_metric), partial.value(temp_metric))
        }
        None => (0.0, 0.0),
    };
    state.stabilizer.stabilize(metric, raw, load, temp)
}

/// Read the rest of the chain looking for a value that disagrees with
/// the suspect one. `require_lower` implements the thermal-limit
/// sentinel policy: only a lower, plausible reading wins.
fn try_alternates(
    state: &mut EngineState,
    metric: MetricId,
    suspect_idx: usize,
    suspect_value: f64,
    chain: &[usize],
    require_lower: bool,
) -> Option<(f64, crate::backend::BackendKind)> {
    let epsilon = metric.change_epsilon();
    for alt_idx in chain.iter().copied().filter(|i| *i != suspect_idx) {
        let kind = state.backends.kind_of(alt_idx);
        if !state.health.is_eligible(kind) {
            continue;
        }
        match state.backends.get_mut(alt_idx).try_read(metric) {
            Ok(alt) => {
                state.health.record_success(kind);
                let accepted = if require_lower {
                    alt < suspect_value && alt > 10.0
                } else {
                    (alt - suspect_value).abs() > epsilon
                };
                if accepted {
                    debug!(
                        "{}: alternate {} reports {:.1}, replacing suspect {:.1}",
                        metric, kind, alt, suspect_value
                    );
                    state.stuck.reset(metric, alt);
                    state.demoted.retain(|(m, _)| *m != metric);
                    return Some((alt, kind));
                }
            }
            Err(err) => {
                debug!("alternate {} for {} failed: {}", kind, metric, err);
                state.health.record_failure(kind);
            }
        }
    }
    None
}

/// Escalation when no alternate disagreed: reinitialize the suspect
/// backend, or demote it once remediation is exhausted
fn escalate(state: &mut EngineState, metric: MetricId, idx: usize) {
    match state.stuck.remediation_failed(metric) {
        StuckAction::Reinitialize => reinit_backend(state, metric, idx),
        StuckAction::ForceFallback => demote(state, metric, idx),
        _ => {}
    }
}

fn reinit_backend(state: &mut EngineState, metric: MetricId, idx: usize) {
    let kind = state.backends.kind_of(idx);
    debug!("reinitializing {} over stuck {}", kind, metric);
    if let Err(e) = state.backends.get_mut(idx).reinitialize() {
        warn!("reinitialization of {} failed: {}", kind, e);
    }
}

fn demote(state: &mut EngineState, metric: MetricId, idx: usize) {
    let kind = state.backends.kind_of(idx);
    warn!("demoting {} for {}; relying on fallback sources", kind, metric);
    state.demoted.insert((metric, idx));
}

/// Merge throttle flags from every backend that reports them
fn collect_throttle(backends: &mut BackendSet) -> ThrottleFlags {
    let mut flags = ThrottleFlags::default();
    for idx in 0..backends.len() {
        if let Some(t) = backends.get_mut(idx).read_throttle() {
            flags.cpu_thermal |= t.cpu_thermal;
            flags.cpu_power |= t.cpu_power;
            flags.gpu_thermal |= t.gpu_thermal;
            flags.gpu_power |= t.gpu_power;
        }
    }
    flags
}

/// Fill AC state and minutes-remaining from whichever backend has them
fn collect_battery_extras(backends: &mut BackendSet, sample: &mut MonitoringSample) {
    for idx in 0..backends.len() {
        if let Some(on_ac) = backends.get_mut(idx).power_source() {
            sample.battery.on_ac = on_ac;
            break;
        }
    }
    for idx in 0..backends.len() {
        if let Some(minutes) = backends.get_mut(idx).battery_minutes() {
            sample.battery.minutes_remaining = Some(minutes);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::ScriptedBackend;
    use crate::backend::BackendKind;
    use std::thread;

    fn config() -> VulcanConfig {
        VulcanConfig::default()
    }

    fn engine_with(backends: Vec<Box<dyn SensorBackend>>) -> ReconciliationEngine {
        ReconciliationEngine::new(BackendSet::new(backends), &config())
    }

    #[test]
    fn test_cache_serves_repeated_reads() {
        // P1: within the freshness window no backend is re-polled and
        // callers get the same sample
        let backend = ScriptedBackend::new(BackendKind::KernelMsr).with_constant(
            MetricId::CpuTemperature,
            0,
            55.0,
        );
        let calls = backend.calls.clone();
        let engine = engine_with(vec![Box::new(backend)]);
        let token = CancelToken::new();

        let first = engine.read_sample(&token).unwrap();
        let after_first = calls.load(Ordering::SeqCst);
        let second = engine.read_sample(&token).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), after_first);
        assert_eq!(first.value(MetricId::CpuTemperature), 55.0);
        assert_eq!(second.value(MetricId::CpuTemperature), 55.0);
        assert_eq!(first.timestamp, second.timestamp);
    }

    #[test]
    fn test_single_flight_under_concurrency() {
        // P2: N concurrent callers after expiry produce exactly one
        // reconciliation pass
        let mut cfg = config();
        cfg.engine.freshness_ms = 60_000;
        let backend = ScriptedBackend::new(BackendKind::KernelMsr).with_constant(
            MetricId::CpuTemperature,
            0,
            48.0,
        );
        let calls = backend.calls.clone();
        let engine = Arc::new(ReconciliationEngine::new(
            BackendSet::new(vec![Box::new(backend)]),
            &cfg,
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            handles.push(thread::spawn(move || {
                engine.read_sample(&CancelToken::new()).unwrap()
            }));
        }
        let samples: Vec<MonitoringSample> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        // One pass polls the single supported metric exactly once
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for s in &samples {
            assert_eq!(s.value(MetricId::CpuTemperature), 48.0);
        }
    }

    #[test]
    fn test_fallback_order_on_failure() {
        // P5: A(pri 0) fails, B(pri 1) succeeds; the value is B's and
        // A's failure is recorded
        let a = ScriptedBackend::new(BackendKind::VendorGpuApi)
            .with_failure(MetricId::GpuTemperature, 0);
        let b = ScriptedBackend::new(BackendKind::SharedMemory).with_constant(
            MetricId::GpuTemperature,
            1,
            66.0,
        );
        let engine = engine_with(vec![Box::new(a), Box::new(b)]);
        let sample = engine.read_sample(&CancelToken::new()).unwrap();

        assert_eq!(sample.value(MetricId::GpuTemperature), 66.0);
        assert_eq!(
            sample.source(MetricId::GpuTemperature),
            MetricSource::Live(BackendKind::SharedMemory)
        );

        let state = engine.state.lock().unwrap();
        assert_eq!(state.health.failure_count(BackendKind::VendorGpuApi), 1);
    }

    #[test]
    fn test_repeated_failures_disable_backend() {
        // Scenario D: three consecutive failures disable the vendor
        // API; later cycles use the fallback without calling it
        let mut cfg = config();
        cfg.engine.freshness_ms = 0;
        let flaky =
            ScriptedBackend::new(BackendKind::VendorGpuApi).with_failure(MetricId::GpuPower, 0);
        let flaky_calls = flaky.calls.clone();
        let steady = ScriptedBackend::new(BackendKind::SharedMemory).with_constant(
            MetricId::GpuPower,
            1,
            80.0,
        );
        let engine = ReconciliationEngine::new(
            BackendSet::new(vec![Box::new(flaky), Box::new(steady)]),
            &cfg,
        );
        let token = CancelToken::new();

        for _ in 0..6 {
            let sample = engine.read_sample(&token).unwrap();
            assert_eq!(sample.value(MetricId::GpuPower), 80.0);
            std::thread::sleep(Duration::from_millis(2));
        }

        // Called during the first three cycles only, then benched
        assert_eq!(flaky_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_all_sources_failed_holds_last_value() {
        let mut cfg = config();
        cfg.engine.freshness_ms = 0;
        let backend = ScriptedBackend::new(BackendKind::KernelMsr).with_script(
            MetricId::CpuPower,
            0,
            vec![
                Ok(28.0),
                Err(ReadError::Transient("blip".into())),
                Err(ReadError::Transient("blip".into())),
            ],
        );
        let engine = engine_with(vec![Box::new(backend)]);
        let token = CancelToken::new();

        let first = engine.read_sample(&token).unwrap();
        assert_eq!(first.value(MetricId::CpuPower), 28.0);
        std::thread::sleep(Duration::from_millis(2));

        let second = engine.read_sample(&token).unwrap();
        assert_eq!(second.value(MetricId::CpuPower), 28.0);
        assert_eq!(
            second.source(MetricId::CpuPower),
            MetricSource::Held(BackendKind::KernelMsr)
        );
    }

    #[test]
    fn test_never_seen_metric_reports_sentinel() {
        let backend = ScriptedBackend::new(BackendKind::KernelMsr).with_constant(
            MetricId::CpuTemperature,
            0,
            50.0,
        );
        let engine = engine_with(vec![Box::new(backend)]);
        let sample = engine.read_sample(&CancelToken::new()).unwrap();

        assert_eq!(sample.value(MetricId::GpuHotspot), 0.0);
        assert_eq!(sample.source(MetricId::GpuHotspot), MetricSource::Unavailable);
    }

    #[test]
    fn test_tjmax_sentinel_prefers_lower_alternate() {
        // Scenario A: firmware parks CPU temp at 97; the ACPI zone
        // reports 62; the engine switches to 62 and resets the streak
        let mut cfg = config();
        cfg.engine.freshness_ms = 0;
        let parked = ScriptedBackend::new(BackendKind::WmiBios).with_constant(
            MetricId::CpuTemperature,
            0,
            97.0,
        );
        let acpi = ScriptedBackend::new(BackendKind::AcpiThermalZone).with_constant(
            MetricId::CpuTemperature,
            1,
            62.0,
        );
        let engine =
            ReconciliationEngine::new(BackendSet::new(vec![Box::new(parked), Box::new(acpi)]), &cfg);
        let token = CancelToken::new();

        let mut switched_at = None;
        for cycle in 1..=5 {
            let sample = engine.read_sample(&token).unwrap();
            if sample.value(MetricId::CpuTemperature) == 62.0 && switched_at.is_none() {
                switched_at = Some(cycle);
                assert_eq!(
                    sample.source(MetricId::CpuTemperature),
                    MetricSource::Live(BackendKind::AcpiThermalZone)
                );
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        let switched_at = switched_at.expect("never switched off the sentinel");
        assert!(switched_at <= 5, "switched at cycle {}", switched_at);
        let state = engine.state.lock().unwrap();
        assert_eq!(state.stuck.streak(MetricId::CpuTemperature), 0);
    }

    #[test]
    fn test_stabilizer_bridges_zero_power_run() {
        // Scenario B: GPU power reads 0 for 10 cycles while the GPU is
        // loaded; output stays at the last positive wattage
        let mut cfg = config();
        cfg.engine.freshness_ms = 0;
        let mut script = vec![Ok(62.0)];
        script.extend(std::iter::repeat(Ok(0.0)).take(10));
        let power = ScriptedBackend::new(BackendKind::VendorGpuApi)
            .with_script(MetricId::GpuPower, 0, script)
            .with_constant(MetricId::GpuLoad, 0, 45.0)
            .with_constant(MetricId::GpuTemperature, 0, 70.0);
        let engine = ReconciliationEngine::new(BackendSet::new(vec![Box::new(power)]), &cfg);
        let token = CancelToken::new();

        let first = engine.read_sample(&token).unwrap();
        assert_eq!(first.value(MetricId::GpuPower), 62.0);

        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(2));
            let sample = engine.read_sample(&token).unwrap();
            assert_eq!(sample.value(MetricId::GpuPower), 62.0);
        }
    }

    #[test]
    fn test_cancelled_token_short_circuits() {
        let backend = ScriptedBackend::new(BackendKind::KernelMsr).with_constant(
            MetricId::CpuTemperature,
            0,
            50.0,
        );
        let calls = backend.calls.clone();
        let engine = engine_with(vec![Box::new(backend)]);

        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(
            engine.read_sample(&token),
            Err(VulcanError::Cancelled)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_min_interval_throttles_backend() {
        // A backend with a long minimum interval is polled once; the
        // next cycle holds its value instead of re-calling it
        let mut cfg = config();
        cfg.engine.freshness_ms = 0;
        let backend = ScriptedBackend::new(BackendKind::WmiBios)
            .with_constant(MetricId::FanRpmCpu, 0, 2400.0)
            .with_min_interval(Duration::from_secs(60));
        let calls = backend.calls.clone();
        let engine = ReconciliationEngine::new(BackendSet::new(vec![Box::new(backend)]), &cfg);
        let token = CancelToken::new();

        let first = engine.read_sample(&token).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let second = engine.read_sample(&token).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.value(MetricId::FanRpmCpu), 2400.0);
        assert_eq!(second.value(MetricId::FanRpmCpu), 2400.0);
        assert_eq!(
            second.source(MetricId::FanRpmCpu),
            MetricSource::Held(BackendKind::WmiBios)
        );
    }

    #[test]
    fn test_low_overhead_mode_widens_window() {
        let mut cfg = config();
        cfg.engine.freshness_ms = 0;
        cfg.engine.low_overhead_freshness_ms = 60_000;
        let backend = ScriptedBackend::new(BackendKind::KernelMsr).with_constant(
            MetricId::CpuTemperature,
            0,
            50.0,
        );
        let calls = backend.calls.clone();
        let engine = ReconciliationEngine::new(BackendSet::new(vec![Box::new(backend)]), &cfg);
        let token = CancelToken::new();

        engine.read_sample(&token).unwrap();
        let after_first = calls.load(Ordering::SeqCst);

        engine.set_low_overhead(true);
        for _ in 0..5 {
            engine.read_sample(&token).unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), after_first);
    }

    #[test]
    fn test_stuck_value_remediation_via_alternate() {
        // P7 at the engine level: a long identical run triggers one
        // alternate probe; the differing alternate takes over
        let mut cfg = config();
        cfg.engine.freshness_ms = 0;
        let frozen = ScriptedBackend::new(BackendKind::VendorGpuApi).with_constant(
            MetricId::GpuTemperature,
            0,
            71.0,
        );
        let live = ScriptedBackend::new(BackendKind::SharedMemory).with_constant(
            MetricId::GpuTemperature,
            1,
            64.0,
        );
        let live_calls = live.calls.clone();
        let engine =
            ReconciliationEngine::new(BackendSet::new(vec![Box::new(frozen), Box::new(live)]), &cfg);
        let token = CancelToken::new();

        // Cycle 1 establishes the value; the streak reaches the
        // remediation threshold on cycle 11
        let mut last = 0.0;
        for _ in 0..11 {
            last = engine
                .read_sample(&token)
                .unwrap()
                .value(MetricId::GpuTemperature);
            std::thread::sleep(Duration::from_millis(2));
        }

        // The alternate was consulted and its differing value accepted
        assert_eq!(last, 64.0);
        assert_eq!(live_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_throttle_flags_merged_across_backends() {
        struct ThrottlingBackend(ScriptedBackend);
        impl SensorBackend for ThrottlingBackend {
            fn kind(&self) -> BackendKind {
                self.0.kind()
            }
            fn is_available(&self) -> bool {
                true
            }
            fn supported_metrics(&self) -> Vec<MetricId> {
                self.0.supported_metrics()
            }
            fn priority(&self, metric: MetricId) -> Option<u8> {
                self.0.priority(metric)
            }
            fn try_read(&mut self, metric: MetricId) -> crate::backend::ReadOutcome {
                self.0.try_read(metric)
            }
            fn read_throttle(&mut self) -> Option<ThrottleFlags> {
                Some(ThrottleFlags {
                    cpu_thermal: true,
                    ..Default::default()
                })
            }
        }

        let inner = ScriptedBackend::new(BackendKind::KernelMsr).with_constant(
            MetricId::CpuTemperature,
            0,
            90.0,
        );
        let engine = engine_with(vec![Box::new(ThrottlingBackend(inner))]);
        let sample = engine.read_sample(&CancelToken::new()).unwrap();
        assert!(sample.throttle.cpu_thermal);
        assert!(!sample.throttle.gpu_power);
    }
}
