//! Metric identities and per-metric reconciliation parameters
//!
//! Every physical quantity the engine reconciles is a `MetricId`. The
//! tables here (unit, change epsilon, stabilizer routing, activity
//! pairing) drive the detectors generically so no per-metric logic is
//! hardcoded in the reconciliation loop.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One physical quantity reconciled per polling cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricId {
    /// CPU package temperature (°C)
    CpuTemperature,
    /// CPU utilization (0-100%)
    CpuLoad,
    /// CPU package power draw (W)
    CpuPower,
    /// CPU core clock (MHz)
    CpuClock,
    /// GPU core temperature (°C)
    GpuTemperature,
    /// GPU hotspot temperature (°C)
    GpuHotspot,
    /// GPU utilization (0-100%)
    GpuLoad,
    /// GPU board power draw (W)
    GpuPower,
    /// GPU core clock (MHz)
    GpuCoreClock,
    /// GPU memory clock (MHz)
    GpuMemoryClock,
    /// VRAM used (MB)
    VramUsed,
    /// VRAM total (MB)
    VramTotal,
    /// System RAM used (MB)
    RamUsed,
    /// System RAM total (MB)
    RamTotal,
    /// SSD/NVMe temperature (°C)
    SsdTemperature,
    /// CPU fan zone speed (RPM)
    FanRpmCpu,
    /// GPU fan zone speed (RPM)
    FanRpmGpu,
    /// Battery charge level (0-100%)
    BatteryCharge,
    /// Battery discharge rate (W, positive while discharging)
    BatteryDischargeRate,
}

impl MetricId {
    /// All metrics, in the order they are reconciled each cycle
    pub const ALL: [MetricId; 19] = [
        MetricId::CpuTemperature,
        MetricId::CpuLoad,
        MetricId::CpuPower,
        MetricId::CpuClock,
        MetricId::GpuTemperature,
        MetricId::GpuHotspot,
        MetricId::GpuLoad,
        MetricId::GpuPower,
        MetricId::GpuCoreClock,
        MetricId::GpuMemoryClock,
        MetricId::VramUsed,
        MetricId::VramTotal,
        MetricId::RamUsed,
        MetricId::RamTotal,
        MetricId::SsdTemperature,
        MetricId::FanRpmCpu,
        MetricId::FanRpmGpu,
        MetricId::BatteryCharge,
        MetricId::BatteryDischargeRate,
    ];

    /// Unit label for display and attribution strings
    pub fn unit(&self) -> &'static str {
        match self {
            MetricId::CpuTemperature
            | MetricId::GpuTemperature
            | MetricId::GpuHotspot
            | MetricId::SsdTemperature => "°C",
            MetricId::CpuLoad | MetricId::GpuLoad | MetricId::BatteryCharge => "%",
            MetricId::CpuPower | MetricId::GpuPower | MetricId::BatteryDischargeRate => "W",
            MetricId::CpuClock | MetricId::GpuCoreClock | MetricId::GpuMemoryClock => "MHz",
            MetricId::VramUsed | MetricId::VramTotal | MetricId::RamUsed | MetricId::RamTotal => {
                "MB"
            }
            MetricId::FanRpmCpu | MetricId::FanRpmGpu => "RPM",
        }
    }

    /// Minimum change treated as a genuine value change by the stuck
    /// detector. Below this delta two reads count as identical.
    pub fn change_epsilon(&self) -> f64 {
        match self {
            // Integer-granularity firmware temps: any change is a change
            MetricId::CpuTemperature
            | MetricId::GpuTemperature
            | MetricId::GpuHotspot
            | MetricId::SsdTemperature => 0.5,
            // Loads and charge jitter by fractions constantly
            MetricId::CpuLoad | MetricId::GpuLoad | MetricId::BatteryCharge => 0.1,
            MetricId::CpuPower | MetricId::GpuPower | MetricId::BatteryDischargeRate => 0.1,
            MetricId::CpuClock | MetricId::GpuCoreClock | MetricId::GpuMemoryClock => 1.0,
            MetricId::VramUsed | MetricId::RamUsed => 1.0,
            // Totals are legitimately constant; epsilon 0 disables the
            // stuck streak for them entirely
            MetricId::VramTotal | MetricId::RamTotal => 0.0,
            MetricId::FanRpmCpu | MetricId::FanRpmGpu => 10.0,
        }
    }

    /// Whether this metric routes through the power stabilizer
    /// (telemetry sources intermittently report transient zero for
    /// these while the component is clearly active)
    pub fn is_power_like(&self) -> bool {
        matches!(
            self,
            MetricId::CpuPower | MetricId::GpuPower | MetricId::FanRpmCpu | MetricId::FanRpmGpu
        )
    }

    /// Whether this metric is a temperature reading subject to the
    /// thermal-limit sentinel policy
    pub fn is_cpu_temperature(&self) -> bool {
        matches!(self, MetricId::CpuTemperature)
    }

    /// Activity evidence pair for the stabilizer: the load and
    /// temperature metrics that corroborate a zero reading of this
    /// metric. `None` for metrics the stabilizer never touches.
    pub fn activity_evidence(&self) -> Option<(MetricId, MetricId)> {
        match self {
            MetricId::CpuPower | MetricId::FanRpmCpu => {
                Some((MetricId::CpuLoad, MetricId::CpuTemperature))
            }
            MetricId::GpuPower | MetricId::FanRpmGpu => {
                Some((MetricId::GpuLoad, MetricId::GpuTemperature))
            }
            _ => None,
        }
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricId::CpuTemperature => "cpu_temp",
            MetricId::CpuLoad => "cpu_load",
            MetricId::CpuPower => "cpu_power",
            MetricId::CpuClock => "cpu_clock",
            MetricId::GpuTemperature => "gpu_temp",
            MetricId::GpuHotspot => "gpu_hotspot",
            MetricId::GpuLoad => "gpu_load",
            MetricId::GpuPower => "gpu_power",
            MetricId::GpuCoreClock => "gpu_core_clock",
            MetricId::GpuMemoryClock => "gpu_mem_clock",
            MetricId::VramUsed => "vram_used",
            MetricId::VramTotal => "vram_total",
            MetricId::RamUsed => "ram_used",
            MetricId::RamTotal => "ram_total",
            MetricId::SsdTemperature => "ssd_temp",
            MetricId::FanRpmCpu => "fan_rpm_cpu",
            MetricId::FanRpmGpu => "fan_rpm_gpu",
            MetricId::BatteryCharge => "battery_charge",
            MetricId::BatteryDischargeRate => "battery_rate",
        };
        write!(f, "{}", name)
    }
}
