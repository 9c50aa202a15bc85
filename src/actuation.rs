//! Fan and voltage actuation
//!
//! Issues commands to the firmware/driver write paths and keeps them
//! alive: OMEN firmware silently reverts unattended manual settings
//! after a vendor-defined timeout (~120 s observed), so while a manual
//! intent is active a re-assertion thread resends it on an interval
//! short enough to beat the revert. The thread is owned by the
//! controller, carries an explicit stop handle, and is shut down
//! deterministically on mode exit and on drop.
//!
//! Commands are verified, not trusted: after a max-fan request the
//! controller samples RPM through the reconciliation engine and only
//! counts the command effective once the tach responds. Firmware that
//! accepts commands and does nothing is a real hardware population
//! ("commands ineffective on this model"), surfaced as a capability
//! flag rather than an error loop.

use crate::backend::kernel_msr::KernelMsrBackend;
use crate::backend::wmi_bios::WmiBiosBackend;
use crate::capability::{FanLevelUnit, ModelCapabilities};
use crate::config::ActuationConfig;
use crate::curve::FanCurve;
use crate::engine::{CancelToken, ReconciliationEngine};
use crate::error::{Result, VulcanError};
use crate::metric::MetricId;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Firmware fan mode bytes
mod fan_mode {
    /// Firmware-controlled default
    pub const DEFAULT: u8 = 0x00;
    /// Performance (raised fan floor)
    pub const PERFORMANCE: u8 = 0x31;
}

/// Highest fan level in hundreds of RPM for boards that speak krpm
const MAX_LEVEL_KRPM: f64 = 55.0;

/// Control mode state machine: firmware default, explicit manual
/// intent, or forced ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActuationMode {
    /// Firmware owns the fans
    Auto,
    /// A manual duty/mode intent is active and re-asserted
    Manual,
    /// Max-fan flag is set and re-asserted
    Max,
}

/// The policy that produced an intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentPolicy {
    /// A named preset's curve
    Preset(String),
    /// Direct duty request
    Manual,
    /// Forced ceiling
    MaxFan,
}

/// Desired actuation target, owned exclusively by the controller and
/// resent by the re-assertion thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuationIntent {
    /// CPU fan duty (0-100%)
    pub cpu_duty: f64,
    /// GPU fan duty (0-100%)
    pub gpu_duty: f64,
    /// Max-fan flag instead of duty levels
    pub max_fan: bool,
    /// Policy that produced this intent
    pub policy: IntentPolicy,
}

/// Named fan preset: a curve plus an optional firmware mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanPreset {
    /// Preset name
    pub name: String,
    /// Temperature→duty curve
    pub curve: FanCurve,
    /// Firmware performance mode to apply alongside, if any
    pub bios_mode: Option<u8>,
}

impl FanPreset {
    /// Quiet preset
    pub fn quiet() -> Self {
        Self {
            name: "Quiet".to_string(),
            curve: FanCurve::quiet(),
            bios_mode: Some(fan_mode::DEFAULT),
        }
    }

    /// Balanced preset
    pub fn balanced() -> Self {
        Self {
            name: "Balanced".to_string(),
            curve: FanCurve::balanced(),
            bios_mode: Some(fan_mode::DEFAULT),
        }
    }

    /// Performance preset
    pub fn performance() -> Self {
        Self {
            name: "Performance".to_string(),
            curve: FanCurve::performance(),
            bios_mode: Some(fan_mode::PERFORMANCE),
        }
    }
}

/// Fan command write path
pub trait FanWriter: Send + Sync {
    /// Set both fan duties (0-100%)
    fn set_levels(&self, cpu_percent: f64, gpu_percent: f64) -> Result<()>;
    /// Set or clear the firmware max-fan flag
    fn set_max_fan(&self, on: bool) -> Result<()>;
    /// Set the firmware fan mode byte
    fn set_mode(&self, mode: u8) -> Result<()>;
}

/// CPU voltage/power-limit write path
pub trait PowerWriter: Send + Sync {
    /// Set the package power limit in watts
    fn set_power_limit(&self, watts: f64) -> Result<()>;
    /// Apply a core voltage offset in millivolts (negative undervolts)
    fn set_voltage_offset(&self, millivolts: i32) -> Result<()>;
}

/// Production fan writer over the HP WMI BIOS command channel
pub struct WmiBiosFanWriter {
    bios: WmiBiosBackend,
    unit: FanLevelUnit,
}

impl WmiBiosFanWriter {
    /// Wrap a BIOS session, converting duties per the board's unit
    pub fn new(bios: WmiBiosBackend, unit: FanLevelUnit) -> Self {
        Self { bios, unit }
    }

    fn duty_to_level(&self, percent: f64) -> u8 {
        match self.unit {
            FanLevelUnit::Percent => percent.clamp(0.0, 100.0).round() as u8,
            FanLevelUnit::Krpm => (percent.clamp(0.0, 100.0) / 100.0 * MAX_LEVEL_KRPM).round() as u8,
        }
    }
}

impl FanWriter for WmiBiosFanWriter {
    fn set_levels(&self, cpu_percent: f64, gpu_percent: f64) -> Result<()> {
        self.bios
            .set_fan_levels(self.duty_to_level(cpu_percent), self.duty_to_level(gpu_percent))
    }

    fn set_max_fan(&self, on: bool) -> Result<()> {
        self.bios.set_max_fan(on)
    }

    fn set_mode(&self, mode: u8) -> Result<()> {
        self.bios.set_fan_mode(mode)
    }
}

/// Production power writer over the MSR driver
pub struct MsrPowerWriter {
    msr: KernelMsrBackend,
}

impl MsrPowerWriter {
    /// Wrap an MSR driver session
    pub fn new(msr: KernelMsrBackend) -> Self {
        Self { msr }
    }
}

impl PowerWriter for MsrPowerWriter {
    fn set_power_limit(&self, watts: f64) -> Result<()> {
        self.msr.write_power_limit(watts)
    }

    fn set_voltage_offset(&self, millivolts: i32) -> Result<()> {
        self.msr.write_voltage_offset(millivolts)
    }
}

/// Controller-internal mutable state
struct ControllerState {
    mode: ActuationMode,
    intent: Option<ActuationIntent>,
    verify_failures: u32,
    commands_ineffective: bool,
}

/// Stop handle + thread for the re-assertion loop
struct ReassertTask {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl ReassertTask {
    fn stop(mut self) {
        let (lock, cvar) = &*self.stop;
        *lock.lock().expect("reassert stop lock poisoned") = true;
        cvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Fan/voltage actuation controller with closed-loop verification
pub struct ActuationController {
    engine: Arc<ReconciliationEngine>,
    fans: Arc<dyn FanWriter>,
    power: Option<Arc<dyn PowerWriter>>,
    caps: ModelCapabilities,
    config: ActuationConfig,
    state: Arc<Mutex<ControllerState>>,
    reassert: Mutex<Option<ReassertTask>>,
}

impl ActuationController {
    /// Build a controller over explicit write paths
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        fans: Arc<dyn FanWriter>,
        power: Option<Arc<dyn PowerWriter>>,
        caps: ModelCapabilities,
        config: &ActuationConfig,
    ) -> Self {
        Self {
            engine,
            fans,
            power,
            caps,
            config: config.clone(),
            state: Arc::new(Mutex::new(ControllerState {
                mode: ActuationMode::Auto,
                intent: None,
                verify_failures: 0,
                commands_ineffective: false,
            })),
            reassert: Mutex::new(None),
        }
    }

    /// Current control mode
    pub fn mode(&self) -> ActuationMode {
        self.state.lock().expect("controller state poisoned").mode
    }

    /// Whether fan commands have been found ineffective on this model
    pub fn commands_ineffective(&self) -> bool {
        self.state
            .lock()
            .expect("controller state poisoned")
            .commands_ineffective
    }

    /// Set both fan zones to one duty cycle
    pub fn set_fan_speed(&self, percent: f64) -> Result<String> {
        self.set_fan_speeds(percent, percent)
    }

    /// Set CPU and GPU fan duties independently
    pub fn set_fan_speeds(&self, cpu_percent: f64, gpu_percent: f64) -> Result<String> {
        validate_duty(cpu_percent)?;
        validate_duty(gpu_percent)?;
        self.fail_fast_if_ineffective()?;

        self.fans.set_levels(cpu_percent, gpu_percent)?;

        self.install_intent(
            ActuationIntent {
                cpu_duty: cpu_percent,
                gpu_duty: gpu_percent,
                max_fan: false,
                policy: IntentPolicy::Manual,
            },
            ActuationMode::Manual,
        );

        // Full-throttle requests get closed-loop verification; partial
        // duties have no crisp RPM expectation to check against
        if cpu_percent >= 99.5 && gpu_percent >= 99.5 {
            self.verify_fan_response()?;
        }

        Ok(format!(
            "fan duties applied (cpu {:.0}%, gpu {:.0}%)",
            cpu_percent, gpu_percent
        ))
    }

    /// Force the firmware max-fan ceiling
    pub fn set_max_fan(&self) -> Result<String> {
        self.fail_fast_if_ineffective()?;
        if !self.caps.supports_max_fan {
            return Err(VulcanError::FeatureNotAvailable(format!(
                "{} has no max-fan flag",
                self.caps.family
            )));
        }

        self.fans.set_max_fan(true)?;

        self.install_intent(
            ActuationIntent {
                cpu_duty: 100.0,
                gpu_duty: 100.0,
                max_fan: true,
                policy: IntentPolicy::MaxFan,
            },
            ActuationMode::Max,
        );

        self.verify_fan_response()?;
        Ok("max fan engaged and verified".to_string())
    }

    /// Apply a preset: evaluate its curve against the current
    /// reconciled temperatures and drive both zones
    pub fn apply_preset(&self, preset: &FanPreset) -> Result<String> {
        self.fail_fast_if_ineffective()?;

        let sample = self.engine.read_sample(&CancelToken::new())?;
        let temp = sample
            .value(MetricId::CpuTemperature)
            .max(sample.value(MetricId::GpuTemperature));
        let duty = preset.curve.duty_for(temp);

        if let Some(mode) = preset.bios_mode {
            if self.caps.supports_performance_modes {
                self.fans.set_mode(mode)?;
            }
        }
        self.fans.set_levels(duty, duty)?;

        self.install_intent(
            ActuationIntent {
                cpu_duty: duty,
                gpu_duty: duty,
                max_fan: false,
                policy: IntentPolicy::Preset(preset.name.clone()),
            },
            ActuationMode::Manual,
        );

        Ok(format!(
            "preset '{}' applied: {:.0}% at {:.0}°C",
            preset.name, duty, temp
        ))
    }

    /// Hand fan control back to the firmware.
    ///
    /// A single command is not enough on some firmware revisions; the
    /// release is a fixed sequence: clear the max flag, reset the mode
    /// to default, hint a low manual level, then release.
    pub fn restore_auto_control(&self) -> Result<String> {
        self.stop_reassert();

        // Best-effort sequence; later steps still run when an earlier
        // one is refused, and the first failure is reported
        let mut first_err: Option<VulcanError> = None;
        let mut step = |r: Result<()>| {
            if let Err(e) = r {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        };

        step(self.fans.set_max_fan(false));
        step(self.fans.set_mode(fan_mode::DEFAULT));
        step(self.fans.set_levels(20.0, 20.0));
        step(self.fans.set_mode(fan_mode::DEFAULT));

        {
            let mut state = self.state.lock().expect("controller state poisoned");
            state.mode = ActuationMode::Auto;
            state.intent = None;
        }

        match first_err {
            None => Ok("fan control released to firmware".to_string()),
            Some(e) => Err(e),
        }
    }

    /// Restore firmware control and clear any voltage/power overrides
    pub fn reset_to_defaults(&self) -> Result<String> {
        let release = self.restore_auto_control();
        if let Some(power) = &self.power {
            if self.caps.supports_cpu_power_limit {
                if let Err(e) = power.set_voltage_offset(0) {
                    debug!("voltage offset reset failed: {}", e);
                }
            }
        }
        release.map(|_| "controller reset to defaults".to_string())
    }

    /// Set the CPU package power limit, gated on the model capability
    pub fn set_cpu_power_limit(&self, watts: f64) -> Result<String> {
        if watts <= 0.0 {
            return Err(VulcanError::InvalidValue(format!(
                "power limit must be positive, got {}",
                watts
            )));
        }
        if !self.caps.supports_cpu_power_limit {
            return Err(VulcanError::CommandRejected(format!(
                "{} locks the CPU power limit",
                self.caps.family
            )));
        }
        let power = self.power.as_ref().ok_or_else(|| {
            VulcanError::FeatureNotAvailable("no power write path configured".to_string())
        })?;
        power.set_power_limit(watts)?;
        Ok(format!("CPU power limit set to {:.0} W", watts))
    }

    /// Apply a CPU core voltage offset (negative undervolts), gated on
    /// the model capability
    pub fn set_voltage_offset(&self, millivolts: i32) -> Result<String> {
        if !(-250..=100).contains(&millivolts) {
            return Err(VulcanError::InvalidValue(format!(
                "voltage offset must be within -250..=100 mV, got {}",
                millivolts
            )));
        }
        if !self.caps.supports_cpu_power_limit {
            return Err(VulcanError::CommandRejected(format!(
                "{} locks the voltage interface",
                self.caps.family
            )));
        }
        let power = self.power.as_ref().ok_or_else(|| {
            VulcanError::FeatureNotAvailable("no power write path configured".to_string())
        })?;
        power.set_voltage_offset(millivolts)?;
        Ok(format!("core voltage offset set to {} mV", millivolts))
    }

    fn fail_fast_if_ineffective(&self) -> Result<()> {
        if self.commands_ineffective() {
            return Err(VulcanError::CommandIneffective(
                "fan commands previously verified ineffective; try an alternate control path"
                    .to_string(),
            ));
        }
        Ok(())
    }

    fn install_intent(&self, intent: ActuationIntent, mode: ActuationMode) {
        {
            let mut state = self.state.lock().expect("controller state poisoned");
            state.mode = mode;
            state.intent = Some(intent);
        }
        self.ensure_reassert_running();
    }

    /// Sample RPM through the engine until the fans respond, or record
    /// a verification failure
    fn verify_fan_response(&self) -> Result<()> {
        let token = CancelToken::new();
        let baseline = self
            .engine
            .read_sample(&token)
            .map(|s| s.fans.cpu_rpm.max(s.fans.gpu_rpm))
            .unwrap_or(0.0);

        for attempt in 0..self.config.verify_tries {
            if attempt > 0 || self.config.verify_interval_ms > 0 {
                std::thread::sleep(Duration::from_millis(self.config.verify_interval_ms));
            }
            let rpm = match self.engine.read_sample(&token) {
                Ok(sample) => sample.fans.cpu_rpm.max(sample.fans.gpu_rpm),
                Err(_) => continue,
            };
            if rpm >= self.config.verify_rpm_threshold
                || rpm >= baseline + self.config.verify_rpm_rise
            {
                debug!("fan command verified: {:.0} RPM (baseline {:.0})", rpm, baseline);
                let mut state = self.state.lock().expect("controller state poisoned");
                state.verify_failures = 0;
                return Ok(());
            }
        }

        let latched = {
            let mut state = self.state.lock().expect("controller state poisoned");
            state.verify_failures = state.verify_failures.saturating_add(1);
            warn!(
                "fan command showed no RPM response ({} of {} strikes)",
                state.verify_failures, self.config.ineffective_after
            );
            if state.verify_failures >= self.config.ineffective_after
                && !state.commands_ineffective
            {
                state.commands_ineffective = true;
                state.intent = None;
                state.mode = ActuationMode::Auto;
                // A hardware/firmware limitation of this model, not a bug
                warn!(
                    "fan commands marked ineffective for {}; an alternate control path is needed",
                    self.caps.family
                );
                true
            } else {
                false
            }
        };
        if latched {
            // Re-asserting commands the hardware ignores is pure noise
            self.stop_reassert();
        }
        Err(VulcanError::CommandIneffective(
            "RPM did not respond within the verification window".to_string(),
        ))
    }

    /// Spawn the re-assertion thread if it is not already running
    fn ensure_reassert_running(&self) {
        let mut guard = self.reassert.lock().expect("reassert slot poisoned");
        if guard.is_some() {
            return;
        }

        let interval = Duration::from_secs(self.config.reassert_secs.min(self.caps.reassert_secs))
            .max(Duration::from_millis(10));
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = stop.clone();
        let fans = self.fans.clone();
        let state = self.state.clone();

        info!(
            "re-assertion task started ({}s interval)",
            interval.as_secs()
        );
        let handle = std::thread::Builder::new()
            .name("vulcan-reassert".to_string())
            .spawn(move || {
                let (lock, cvar) = &*thread_stop;
                let mut stopped = lock.lock().expect("reassert stop lock poisoned");
                loop {
                    let (guard, _) = cvar
                        .wait_timeout(stopped, interval)
                        .expect("reassert stop lock poisoned");
                    stopped = guard;
                    if *stopped {
                        break;
                    }
                    let intent = {
                        let state = state.lock().expect("controller state poisoned");
                        state.intent.clone()
                    };
                    if let Some(intent) = intent {
                        let result = if intent.max_fan {
                            fans.set_max_fan(true)
                        } else {
                            fans.set_levels(intent.cpu_duty, intent.gpu_duty)
                        };
                        if let Err(e) = result {
                            debug!("re-assertion failed: {}", e);
                        }
                    }
                }
            })
            .expect("failed to spawn re-assertion thread");

        *guard = Some(ReassertTask {
            stop,
            handle: Some(handle),
        });
    }

    fn stop_reassert(&self) {
        let task = self
            .reassert
            .lock()
            .expect("reassert slot poisoned")
            .take();
        if let Some(task) = task {
            task.stop();
            info!("re-assertion task stopped");
        }
    }
}

impl Drop for ActuationController {
    fn drop(&mut self) {
        self.stop_reassert();
    }
}

fn validate_duty(percent: f64) -> Result<()> {
    if !(0.0..=100.0).contains(&percent) {
        return Err(VulcanError::InvalidValue(format!(
            "duty cycle must be 0-100%, got {}",
            percent
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::ScriptedBackend;
    use crate::backend::{BackendKind, BackendSet};
    use crate::config::VulcanConfig;

    #[derive(Debug, Clone, PartialEq)]
    enum Command {
        Levels(u32, u32),
        MaxFan(bool),
        Mode(u8),
    }

    /// Recording fan writer for observing the command stream
    struct RecordingWriter {
        commands: Mutex<Vec<Command>>,
        reject: bool,
    }

    impl RecordingWriter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                commands: Mutex::new(Vec::new()),
                reject: false,
            })
        }

        fn rejecting() -> Arc<Self> {
            Arc::new(Self {
                commands: Mutex::new(Vec::new()),
                reject: true,
            })
        }

        fn record(&self, cmd: Command) -> Result<()> {
            if self.reject {
                return Err(VulcanError::CommandRejected("test rejection".to_string()));
            }
            self.commands.lock().unwrap().push(cmd);
            Ok(())
        }

        fn commands(&self) -> Vec<Command> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl FanWriter for RecordingWriter {
        fn set_levels(&self, cpu: f64, gpu: f64) -> Result<()> {
            self.record(Command::Levels(cpu.round() as u32, gpu.round() as u32))
        }
        fn set_max_fan(&self, on: bool) -> Result<()> {
            self.record(Command::MaxFan(on))
        }
        fn set_mode(&self, mode: u8) -> Result<()> {
            self.record(Command::Mode(mode))
        }
    }

    fn engine_with_rpm(rpm: f64) -> Arc<ReconciliationEngine> {
        let mut cfg = VulcanConfig::default();
        cfg.engine.freshness_ms = 0;
        let backend = ScriptedBackend::new(BackendKind::WmiBios)
            .with_constant(MetricId::FanRpmCpu, 0, rpm)
            .with_constant(MetricId::FanRpmGpu, 0, rpm)
            .with_constant(MetricId::CpuTemperature, 0, 70.0)
            .with_constant(MetricId::GpuTemperature, 0, 65.0);
        Arc::new(ReconciliationEngine::new(
            BackendSet::new(vec![Box::new(backend)]),
            &cfg,
        ))
    }

    fn caps() -> ModelCapabilities {
        ModelCapabilities {
            family: "Test board".to_string(),
            fan_count: 2,
            fan_level_unit: FanLevelUnit::Percent,
            supports_max_fan: true,
            supports_performance_modes: true,
            supports_cpu_power_limit: true,
            reassert_secs: 0,
            tjmax_celsius: 100.0,
        }
    }

    fn fast_config() -> ActuationConfig {
        ActuationConfig {
            verify_interval_ms: 0,
            ..ActuationConfig::default()
        }
    }

    fn controller(
        engine: Arc<ReconciliationEngine>,
        writer: Arc<RecordingWriter>,
    ) -> ActuationController {
        ActuationController::new(engine, writer, None, caps(), &fast_config())
    }

    #[test]
    fn test_set_fan_speed_enters_manual_mode() {
        let writer = RecordingWriter::new();
        let ctl = controller(engine_with_rpm(2000.0), writer.clone());

        assert_eq!(ctl.mode(), ActuationMode::Auto);
        let msg = ctl.set_fan_speed(60.0).unwrap();
        assert!(msg.contains("60"));
        assert_eq!(ctl.mode(), ActuationMode::Manual);
        assert_eq!(writer.commands()[0], Command::Levels(60, 60));
    }

    #[test]
    fn test_duty_validation() {
        let writer = RecordingWriter::new();
        let ctl = controller(engine_with_rpm(2000.0), writer.clone());
        assert!(matches!(
            ctl.set_fan_speed(101.0),
            Err(VulcanError::InvalidValue(_))
        ));
        assert!(matches!(
            ctl.set_fan_speeds(-1.0, 50.0),
            Err(VulcanError::InvalidValue(_))
        ));
        assert!(writer.commands().is_empty());
    }

    #[test]
    fn test_max_fan_verifies_against_rpm() {
        // Fans spin up past the plausibility threshold: verified
        let writer = RecordingWriter::new();
        let ctl = controller(engine_with_rpm(4200.0), writer.clone());

        let msg = ctl.set_max_fan().unwrap();
        assert!(msg.contains("verified"));
        assert_eq!(ctl.mode(), ActuationMode::Max);
        assert!(!ctl.commands_ineffective());
    }

    #[test]
    fn test_unresponsive_fans_latch_ineffective() {
        // Scenario C: RPM never crosses the threshold; after the
        // strike count the model is marked ineffective and the last
        // command returns failure
        let writer = RecordingWriter::new();
        let ctl = controller(engine_with_rpm(1800.0), writer.clone());

        let strikes = fast_config().ineffective_after;
        for i in 0..strikes {
            let result = ctl.set_fan_speed(100.0);
            assert!(result.is_err(), "strike {} unexpectedly verified", i);
        }
        assert!(ctl.commands_ineffective());

        // Fail-fast once latched, without issuing hardware commands
        let before = writer.commands().len();
        assert!(matches!(
            ctl.set_fan_speed(50.0),
            Err(VulcanError::CommandIneffective(_))
        ));
        assert_eq!(writer.commands().len(), before);
    }

    #[test]
    fn test_verification_passes_on_meaningful_rise() {
        // Baseline is taken before the command; a scripted jump from
        // 1500 to 2300 RPM beats the rise threshold without ever
        // crossing the absolute one
        let mut cfg = VulcanConfig::default();
        cfg.engine.freshness_ms = 0;
        let mut script = vec![Ok(1500.0)];
        script.extend(std::iter::repeat(Ok(2300.0)).take(10));
        let backend = ScriptedBackend::new(BackendKind::WmiBios)
            .with_script(MetricId::FanRpmCpu, 0, script)
            .with_constant(MetricId::FanRpmGpu, 0, 0.0)
            .with_constant(MetricId::CpuLoad, 0, 50.0)
            .with_constant(MetricId::CpuTemperature, 0, 70.0);
        let engine = Arc::new(ReconciliationEngine::new(
            BackendSet::new(vec![Box::new(backend)]),
            &cfg,
        ));
        let writer = RecordingWriter::new();
        let ctl = controller(engine, writer);

        assert!(ctl.set_max_fan().is_ok());
    }

    #[test]
    fn test_restore_auto_runs_release_sequence() {
        let writer = RecordingWriter::new();
        let ctl = controller(engine_with_rpm(4200.0), writer.clone());

        ctl.set_fan_speed(70.0).unwrap();

        let msg = ctl.restore_auto_control().unwrap();
        assert!(msg.contains("released"));
        assert_eq!(ctl.mode(), ActuationMode::Auto);

        // The re-assert thread is joined before the release commands
        // go out, so the tail is exactly the multi-step sequence:
        // clear max flag, default mode, low hint, release
        let cmds = writer.commands();
        assert_eq!(
            cmds[cmds.len() - 4..],
            [
                Command::MaxFan(false),
                Command::Mode(fan_mode::DEFAULT),
                Command::Levels(20, 20),
                Command::Mode(fan_mode::DEFAULT),
            ]
        );
    }

    #[test]
    fn test_reassert_resends_intent() {
        let writer = RecordingWriter::new();
        let ctl = controller(engine_with_rpm(2000.0), writer.clone());

        ctl.set_fan_speed(55.0).unwrap();
        // Zero-second caps interval floors at 10 ms; give it time to fire
        std::thread::sleep(Duration::from_millis(100));

        let resends = writer
            .commands()
            .iter()
            .filter(|c| **c == Command::Levels(55, 55))
            .count();
        assert!(resends >= 2, "intent resent {} times", resends);

        // Exiting manual mode stops the resend stream deterministically
        ctl.restore_auto_control().unwrap();
        let after_stop = writer.commands().len();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(writer.commands().len(), after_stop);
    }

    #[test]
    fn test_rejected_command_propagates() {
        let writer = RecordingWriter::rejecting();
        let ctl = controller(engine_with_rpm(2000.0), writer);
        assert!(matches!(
            ctl.set_fan_speed(40.0),
            Err(VulcanError::CommandRejected(_))
        ));
        // A rejection is not a verification failure
        assert!(!ctl.commands_ineffective());
    }

    /// Recording power writer
    struct RecordingPowerWriter {
        offsets: Mutex<Vec<i32>>,
        limits: Mutex<Vec<f64>>,
    }

    impl RecordingPowerWriter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                offsets: Mutex::new(Vec::new()),
                limits: Mutex::new(Vec::new()),
            })
        }
    }

    impl PowerWriter for RecordingPowerWriter {
        fn set_power_limit(&self, watts: f64) -> Result<()> {
            self.limits.lock().unwrap().push(watts);
            Ok(())
        }
        fn set_voltage_offset(&self, millivolts: i32) -> Result<()> {
            self.offsets.lock().unwrap().push(millivolts);
            Ok(())
        }
    }

    #[test]
    fn test_voltage_offset_range_and_routing() {
        let fans = RecordingWriter::new();
        let power = RecordingPowerWriter::new();
        let ctl = ActuationController::new(
            engine_with_rpm(2000.0),
            fans,
            Some(power.clone()),
            caps(),
            &fast_config(),
        );

        assert!(matches!(
            ctl.set_voltage_offset(-300),
            Err(VulcanError::InvalidValue(_))
        ));
        let msg = ctl.set_voltage_offset(-80).unwrap();
        assert!(msg.contains("-80"));
        assert_eq!(*power.offsets.lock().unwrap(), vec![-80]);

        ctl.set_cpu_power_limit(45.0).unwrap();
        assert_eq!(*power.limits.lock().unwrap(), vec![45.0]);
    }

    #[test]
    fn test_reset_to_defaults_clears_voltage_offset() {
        let fans = RecordingWriter::new();
        let power = RecordingPowerWriter::new();
        let ctl = ActuationController::new(
            engine_with_rpm(2000.0),
            fans,
            Some(power.clone()),
            caps(),
            &fast_config(),
        );

        ctl.set_voltage_offset(-50).unwrap();
        ctl.reset_to_defaults().unwrap();
        assert_eq!(*power.offsets.lock().unwrap(), vec![-50, 0]);
        assert_eq!(ctl.mode(), ActuationMode::Auto);
    }

    #[test]
    fn test_power_limit_gated_by_capability() {
        let writer = RecordingWriter::new();
        let mut locked = caps();
        locked.supports_cpu_power_limit = false;
        let ctl = ActuationController::new(
            engine_with_rpm(2000.0),
            writer,
            None,
            locked,
            &fast_config(),
        );
        assert!(matches!(
            ctl.set_cpu_power_limit(45.0),
            Err(VulcanError::CommandRejected(_))
        ));
    }

    #[test]
    fn test_apply_preset_uses_reconciled_temperature() {
        let writer = RecordingWriter::new();
        // Engine reports CPU 70 / GPU 65; balanced curve at 70°C is 60%
        let ctl = controller(engine_with_rpm(2000.0), writer.clone());

        let msg = ctl.apply_preset(&FanPreset::balanced()).unwrap();
        assert!(msg.contains("Balanced"));
        assert_eq!(ctl.mode(), ActuationMode::Manual);

        let cmds = writer.commands();
        assert!(cmds.contains(&Command::Mode(fan_mode::DEFAULT)));
        assert!(cmds.contains(&Command::Levels(60, 60)));
    }

    #[test]
    fn test_max_fan_refused_without_capability() {
        let writer = RecordingWriter::new();
        let mut no_max = caps();
        no_max.supports_max_fan = false;
        let ctl = ActuationController::new(
            engine_with_rpm(4200.0),
            writer.clone(),
            None,
            no_max,
            &fast_config(),
        );
        assert!(matches!(
            ctl.set_max_fan(),
            Err(VulcanError::FeatureNotAvailable(_))
        ));
        assert!(writer.commands().is_empty());
    }
}
