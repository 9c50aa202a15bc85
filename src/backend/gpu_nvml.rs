//! Vendor GPU telemetry backend (NVML)
//!
//! Wraps the NVIDIA management library for GPU temperature, load,
//! power, clocks, and VRAM. Every error NVML reports is converted to a
//! `ReadError` at this boundary. One class of fault it cannot convert:
//! a corrupted driver state that faults inside the native library
//! takes the process with it, since that is not unwinding and no
//! in-process handler sees it. The health tracker bounds the
//! recoverable flaky cases; the unrecoverable one is a documented
//! limitation of hosting the vendor library in-process.

use super::{BackendKind, ReadError, ReadOutcome, SensorBackend};
use crate::error::Result;
use crate::metric::MetricId;
use crate::sample::ThrottleFlags;
use std::time::Duration;

#[cfg(feature = "nvidia")]
use nvml_wrapper::{enum_wrappers::device::Clock, enum_wrappers::device::TemperatureSensor, Nvml};

/// NVIDIA GPU telemetry via NVML
pub struct GpuNvmlBackend {
    #[cfg(feature = "nvidia")]
    nvml: Option<Nvml>,
    device_index: u32,
}

impl GpuNvmlBackend {
    /// Initialize NVML and bind the first device. No NVIDIA driver,
    /// no GPU, or a headless iGPU-only machine all mean unavailable.
    pub fn open() -> Self {
        #[cfg(feature = "nvidia")]
        {
            let nvml = Nvml::init().ok().filter(|n| {
                n.device_count().map(|c| c > 0).unwrap_or(false)
            });
            Self {
                nvml,
                device_index: 0,
            }
        }

        #[cfg(not(feature = "nvidia"))]
        {
            Self { device_index: 0 }
        }
    }

    #[cfg(feature = "nvidia")]
    fn with_device<T>(
        &self,
        f: impl FnOnce(&nvml_wrapper::Device<'_>) -> std::result::Result<T, nvml_wrapper::error::NvmlError>,
    ) -> std::result::Result<T, ReadError> {
        let nvml = self
            .nvml
            .as_ref()
            .ok_or_else(|| ReadError::Unavailable("NVML not initialized".into()))?;
        let device = nvml
            .device_by_index(self.device_index)
            .map_err(|e| ReadError::Transient(format!("device lookup failed: {}", e)))?;
        f(&device).map_err(|e| ReadError::Transient(format!("NVML query failed: {}", e)))
    }
}

impl SensorBackend for GpuNvmlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::VendorGpuApi
    }

    fn is_available(&self) -> bool {
        #[cfg(feature = "nvidia")]
        {
            self.nvml.is_some()
        }

        #[cfg(not(feature = "nvidia"))]
        {
            false
        }
    }

    fn supported_metrics(&self) -> Vec<MetricId> {
        vec![
            MetricId::GpuTemperature,
            MetricId::GpuLoad,
            MetricId::GpuPower,
            MetricId::GpuCoreClock,
            MetricId::GpuMemoryClock,
            MetricId::VramUsed,
            MetricId::VramTotal,
        ]
    }

    fn priority(&self, metric: MetricId) -> Option<u8> {
        match metric {
            MetricId::GpuTemperature
            | MetricId::GpuLoad
            | MetricId::GpuPower
            | MetricId::GpuCoreClock
            | MetricId::GpuMemoryClock
            | MetricId::VramUsed
            | MetricId::VramTotal => Some(0),
            _ => None,
        }
    }

    fn try_read(&mut self, metric: MetricId) -> ReadOutcome {
        #[cfg(feature = "nvidia")]
        {
            match metric {
                MetricId::GpuTemperature => self
                    .with_device(|d| d.temperature(TemperatureSensor::Gpu))
                    .map(f64::from),
                MetricId::GpuLoad => self
                    .with_device(|d| d.utilization_rates())
                    .map(|u| f64::from(u.gpu)),
                MetricId::GpuPower => self
                    .with_device(|d| d.power_usage())
                    .map(|mw| f64::from(mw) / 1000.0),
                MetricId::GpuCoreClock => self
                    .with_device(|d| d.clock_info(Clock::Graphics))
                    .map(f64::from),
                MetricId::GpuMemoryClock => self
                    .with_device(|d| d.clock_info(Clock::Memory))
                    .map(f64::from),
                MetricId::VramUsed => self
                    .with_device(|d| d.memory_info())
                    .map(|m| m.used as f64 / 1024.0 / 1024.0),
                MetricId::VramTotal => self
                    .with_device(|d| d.memory_info())
                    .map(|m| m.total as f64 / 1024.0 / 1024.0),
                _ => Err(ReadError::NotSupported),
            }
        }

        #[cfg(not(feature = "nvidia"))]
        {
            let _ = metric;
            Err(ReadError::Unavailable(
                "built without the nvidia feature".into(),
            ))
        }
    }

    fn reinitialize(&mut self) -> Result<()> {
        #[cfg(feature = "nvidia")]
        {
            // Drop the old context first; NVML refuses a second init
            self.nvml = None;
            self.nvml = Nvml::init().ok();
        }
        Ok(())
    }

    fn read_throttle(&mut self) -> Option<ThrottleFlags> {
        #[cfg(feature = "nvidia")]
        {
            use nvml_wrapper::bitmasks::device::ThrottleReasons;
            let reasons = self
                .with_device(|d| d.current_throttle_reasons())
                .ok()?;
            Some(ThrottleFlags {
                cpu_thermal: false,
                cpu_power: false,
                gpu_thermal: reasons.intersects(
                    ThrottleReasons::SW_THERMAL_SLOWDOWN | ThrottleReasons::HW_THERMAL_SLOWDOWN,
                ),
                gpu_power: reasons.intersects(
                    ThrottleReasons::SW_POWER_CAP | ThrottleReasons::HW_POWER_BRAKE_SLOWDOWN,
                ),
            })
        }

        #[cfg(not(feature = "nvidia"))]
        {
            None
        }
    }

    fn min_interval(&self) -> Duration {
        // NVML queries are cheap but not free; no reason to hit the
        // driver faster than telemetry actually updates
        Duration::from_millis(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_metric_coverage() {
        let backend = GpuNvmlBackend::open();
        let metrics = backend.supported_metrics();
        assert!(metrics.contains(&MetricId::GpuTemperature));
        assert!(metrics.contains(&MetricId::VramTotal));
        assert_eq!(backend.priority(MetricId::CpuTemperature), None);
        // Hotspot comes from shared memory, not NVML
        assert_eq!(backend.priority(MetricId::GpuHotspot), None);
    }

    #[cfg(not(feature = "nvidia"))]
    #[test]
    fn test_unavailable_without_feature() {
        let mut backend = GpuNvmlBackend::open();
        assert!(!backend.is_available());
        assert!(matches!(
            backend.try_read(MetricId::GpuPower),
            Err(ReadError::Unavailable(_))
        ));
        assert!(backend.read_throttle().is_none());
    }
}
