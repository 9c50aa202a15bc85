//! Reconciled monitoring snapshot
//!
//! `MonitoringSample` is the primary contract consumers depend on: one
//! immutable, fully composed snapshot per reconciliation pass. Samples
//! are superseded, never mutated; readers always see the most recently
//! completed pass.

use crate::backend::BackendKind;
use crate::metric::MetricId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Where a metric's value in a sample came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricSource {
    /// Read live from this backend during the pass
    Live(BackendKind),
    /// Every source failed this pass; the value is retained from the
    /// last pass in which this backend supplied it
    Held(BackendKind),
    /// No source has ever produced a value; the field holds the 0.0
    /// sentinel
    Unavailable,
}

impl MetricSource {
    /// True unless the metric carries the never-seen sentinel
    pub fn has_value(&self) -> bool {
        !matches!(self, MetricSource::Unavailable)
    }

    /// True when the value was retained from an earlier pass
    pub fn is_stale(&self) -> bool {
        matches!(self, MetricSource::Held(_))
    }
}

/// Temperature readings (°C)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Temperatures {
    /// CPU package temperature
    pub cpu: f64,
    /// GPU core temperature
    pub gpu: f64,
    /// GPU hotspot temperature
    pub gpu_hotspot: f64,
    /// SSD/NVMe temperature
    pub ssd: f64,
}

/// Utilization readings (0-100%)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Loads {
    /// CPU utilization
    pub cpu: f64,
    /// GPU utilization
    pub gpu: f64,
}

/// Power draw readings (W)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PowerDraw {
    /// CPU package power
    pub cpu: f64,
    /// GPU board power
    pub gpu: f64,
}

/// Clock readings (MHz)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Clocks {
    /// Per-core CPU clocks; empty when only a package clock is known
    pub cpu_cores: Vec<f64>,
    /// CPU package/average clock
    pub cpu: f64,
    /// GPU core clock
    pub gpu_core: f64,
    /// GPU memory clock
    pub gpu_memory: f64,
}

/// Memory usage (MB)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemoryUse {
    /// VRAM used
    pub vram_used: f64,
    /// VRAM total
    pub vram_total: f64,
    /// System RAM used
    pub ram_used: f64,
    /// System RAM total
    pub ram_total: f64,
}

/// Fan speeds per zone (RPM)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FanSpeeds {
    /// CPU fan zone
    pub cpu_rpm: f64,
    /// GPU fan zone
    pub gpu_rpm: f64,
}

/// Battery state
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BatteryState {
    /// Charge level (0-100%)
    pub charge_percent: f64,
    /// On AC power
    pub on_ac: bool,
    /// Discharge rate (W); 0 on AC
    pub discharge_rate: f64,
    /// Estimated minutes remaining; None when on AC or unknown
    pub minutes_remaining: Option<u32>,
}

/// Throttling flags reported by firmware/driver
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ThrottleFlags {
    /// CPU thermal throttling active
    pub cpu_thermal: bool,
    /// CPU power-limit throttling active
    pub cpu_power: bool,
    /// GPU thermal throttling active
    pub gpu_thermal: bool,
    /// GPU power-limit throttling active
    pub gpu_power: bool,
}

/// One reconciled snapshot of all monitored quantities
///
/// Created once per reconciliation pass and consumed read-only; the
/// next pass supersedes it in the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSample {
    /// Temperatures (°C)
    pub temperatures: Temperatures,
    /// Utilization (0-100%)
    pub loads: Loads,
    /// Power draw (W)
    pub power: PowerDraw,
    /// Clocks (MHz)
    pub clocks: Clocks,
    /// Memory usage (MB)
    pub memory: MemoryUse,
    /// Fan speeds (RPM)
    pub fans: FanSpeeds,
    /// Battery state
    pub battery: BatteryState,
    /// Throttling flags
    pub throttle: ThrottleFlags,
    /// Per-metric source attribution
    pub sources: HashMap<MetricId, MetricSource>,
    /// Unix timestamp (seconds) of the pass that produced this sample
    pub timestamp: i64,
}

impl MonitoringSample {
    /// Empty sample with every metric marked unavailable
    pub fn empty() -> Self {
        let mut sources = HashMap::new();
        for metric in MetricId::ALL {
            sources.insert(metric, MetricSource::Unavailable);
        }
        Self {
            temperatures: Temperatures::default(),
            loads: Loads::default(),
            power: PowerDraw::default(),
            clocks: Clocks::default(),
            memory: MemoryUse::default(),
            fans: FanSpeeds::default(),
            battery: BatteryState::default(),
            throttle: ThrottleFlags::default(),
            sources,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// Value of a metric as stored in this sample
    pub fn value(&self, metric: MetricId) -> f64 {
        match metric {
            MetricId::CpuTemperature => self.temperatures.cpu,
            MetricId::CpuLoad => self.loads.cpu,
            MetricId::CpuPower => self.power.cpu,
            MetricId::CpuClock => self.clocks.cpu,
            MetricId::GpuTemperature => self.temperatures.gpu,
            MetricId::GpuHotspot => self.temperatures.gpu_hotspot,
            MetricId::GpuLoad => self.loads.gpu,
            MetricId::GpuPower => self.power.gpu,
            MetricId::GpuCoreClock => self.clocks.gpu_core,
            MetricId::GpuMemoryClock => self.clocks.gpu_memory,
            MetricId::VramUsed => self.memory.vram_used,
            MetricId::VramTotal => self.memory.vram_total,
            MetricId::RamUsed => self.memory.ram_used,
            MetricId::RamTotal => self.memory.ram_total,
            MetricId::SsdTemperature => self.temperatures.ssd,
            MetricId::FanRpmCpu => self.fans.cpu_rpm,
            MetricId::FanRpmGpu => self.fans.gpu_rpm,
            MetricId::BatteryCharge => self.battery.charge_percent,
            MetricId::BatteryDischargeRate => self.battery.discharge_rate,
        }
    }

    /// Store a metric value into the matching field
    pub(crate) fn set_value(&mut self, metric: MetricId, value: f64) {
        match metric {
            MetricId::CpuTemperature => self.temperatures.cpu = value,
            MetricId::CpuLoad => self.loads.cpu = value,
            MetricId::CpuPower => self.power.cpu = value,
            MetricId::CpuClock => self.clocks.cpu = value,
            MetricId::GpuTemperature => self.temperatures.gpu = value,
            MetricId::GpuHotspot => self.temperatures.gpu_hotspot = value,
            MetricId::GpuLoad => self.loads.gpu = value,
            MetricId::GpuPower => self.power.gpu = value,
            MetricId::GpuCoreClock => self.clocks.gpu_core = value,
            MetricId::GpuMemoryClock => self.clocks.gpu_memory = value,
            MetricId::VramUsed => self.memory.vram_used = value,
            MetricId::VramTotal => self.memory.vram_total = value,
            MetricId::RamUsed => self.memory.ram_used = value,
            MetricId::RamTotal => self.memory.ram_total = value,
            MetricId::SsdTemperature => self.temperatures.ssd = value,
            MetricId::FanRpmCpu => self.fans.cpu_rpm = value,
            MetricId::FanRpmGpu => self.fans.gpu_rpm = value,
            MetricId::BatteryCharge => self.battery.charge_percent = value,
            MetricId::BatteryDischargeRate => self.battery.discharge_rate = value,
        }
    }

    /// Source attribution for a metric
    pub fn source(&self, metric: MetricId) -> MetricSource {
        self.sources
            .get(&metric)
            .copied()
            .unwrap_or(MetricSource::Unavailable)
    }

    /// Human-readable attribution summary, one entry per metric that
    /// has a value, e.g. `cpu_temp=62.0°C(KernelMsr) gpu_power=45.3W(VendorGpuApi*)`
    /// (`*` marks a held/stale value).
    pub fn attribution(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        for metric in MetricId::ALL {
            match self.source(metric) {
                MetricSource::Live(kind) => parts.push(format!(
                    "{}={:.1}{}({})",
                    metric,
                    self.value(metric),
                    metric.unit(),
                    kind
                )),
                MetricSource::Held(kind) => parts.push(format!(
                    "{}={:.1}{}({}*)",
                    metric,
                    self.value(metric),
                    metric.unit(),
                    kind
                )),
                MetricSource::Unavailable => {}
            }
        }
        parts.join(" ")
    }
}
