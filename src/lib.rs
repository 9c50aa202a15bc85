//! # Vulcan
//!
//! Thermal and fan management engine for HP OMEN/Victus laptops. Vulcan
//! polls CPU/GPU sensors (temperature, load, power, clocks, VRAM, fan
//! RPM, battery) from multiple competing, unreliable data sources and
//! issues fan-control and CPU voltage/power commands back through the
//! vendor firmware interfaces.
//!
//! ## Features
//!
//! - **Sensor reconciliation**: per-metric priority-ordered fallback
//!   chains over six backend kinds (HP WMI BIOS, kernel MSR driver,
//!   NVML, OS counters, third-party shared memory, ACPI thermal zone)
//! - **Crash isolation**: per-backend failure counting with
//!   disable/cooldown so one flaky native API cannot stall every cycle
//! - **Stuck-value detection**: escalating remediation for frozen
//!   sensors, including the thermal-limit sentinel firmware sometimes
//!   reports instead of a real temperature
//! - **Power stabilization**: bounded suppression of the transient
//!   zero readings several power/RPM sources emit under load
//! - **Verified actuation**: fan and voltage commands are re-asserted
//!   against firmware auto-revert and verified against the tach
//!
//! ## Quick Start
//!
//! ### Reading reconciled sensors
//!
//! ```no_run
//! use vulcan::{CancelToken, ReconciliationEngine, VulcanConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = VulcanConfig::default();
//! let engine = ReconciliationEngine::detect(&config);
//!
//! let sample = engine.read_sample(&CancelToken::new())?;
//! println!("CPU: {:.0}°C @ {:.0}%", sample.temperatures.cpu, sample.loads.cpu);
//! println!("GPU: {:.0}°C, {:.1} W", sample.temperatures.gpu, sample.power.gpu);
//! println!("Fans: {:.0} / {:.0} RPM", sample.fans.cpu_rpm, sample.fans.gpu_rpm);
//! println!("Sources: {}", sample.attribution());
//! # Ok(())
//! # }
//! ```
//!
//! ### Driving the fans
//!
//! ```no_run
//! use std::sync::Arc;
//! use vulcan::{
//!     ActuationController, CapabilityTable, FanPreset, ReconciliationEngine, VulcanConfig,
//!     WmiBiosBackend, WmiBiosFanWriter,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = VulcanConfig::default();
//! let engine = Arc::new(ReconciliationEngine::detect(&config));
//!
//! let table = CapabilityTable::builtin();
//! let product = vulcan::detect_product_id().unwrap_or_default();
//! let caps = table.capabilities_for(&product).clone();
//!
//! let writer = Arc::new(WmiBiosFanWriter::new(
//!     WmiBiosBackend::open(),
//!     caps.fan_level_unit,
//! ));
//! let controller =
//!     ActuationController::new(engine, writer, None, caps, &config.actuation);
//!
//! println!("{}", controller.apply_preset(&FanPreset::balanced())?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `nvidia` - NVIDIA GPU telemetry via NVML (requires the NVIDIA
//!   driver at runtime)
//!
//! ## Platform Support
//!
//! The reconciliation core (fallback chains, health tracking, stuck
//! detection, stabilization, actuation state machine) is platform
//! neutral. The production backends talk to Windows firmware and
//! driver interfaces; on other platforms they report unavailable and
//! the engine degrades accordingly.

pub mod actuation;
pub mod backend;
pub mod capability;
pub mod config;
pub mod curve;
pub mod engine;
pub mod error;
pub mod health;
pub mod metric;
pub mod sample;
pub mod stabilizer;
pub mod stuck;

// Re-export main types
pub use actuation::{
    ActuationController, ActuationIntent, ActuationMode, FanPreset, FanWriter, IntentPolicy,
    MsrPowerWriter, PowerWriter, WmiBiosFanWriter,
};
pub use backend::{
    acpi_thermal::AcpiThermalBackend, gpu_nvml::GpuNvmlBackend, kernel_msr::KernelMsrBackend,
    perf_counter::PerfCounterBackend, shared_memory::SharedMemoryBackend,
    wmi_bios::WmiBiosBackend, BackendKind, BackendSet, ReadError, ReadOutcome, SensorBackend,
};
pub use capability::{detect_product_id, CapabilityTable, FanLevelUnit, ModelCapabilities};
pub use config::{
    ActuationConfig, EngineConfig, HealthConfig, StabilizerConfig, StuckConfig, VulcanConfig,
};
pub use curve::{CurvePoint, CurveTracker, FanCurve};
pub use engine::{CancelToken, ReconciliationEngine};
pub use error::{Result, VulcanError};
pub use health::HealthTracker;
pub use metric::MetricId;
pub use sample::{
    BatteryState, Clocks, FanSpeeds, Loads, MemoryUse, MetricSource, MonitoringSample, PowerDraw,
    Temperatures, ThrottleFlags,
};
pub use stabilizer::PowerStabilizer;
pub use stuck::{StuckAction, StuckStage, StuckValueDetector};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
