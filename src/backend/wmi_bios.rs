//! HP WMI BIOS backend
//!
//! Talks to the OMEN/Victus firmware command interface (`hpqBIntM` in
//! `root\wmi`). The same channel carries sensor reads (fan RPM, BIOS
//! integer temperature) and actuation commands (fan levels, fan mode,
//! max-fan flag, performance mode); the firmware serializes its own
//! command queue, so readers and writers may use separate sessions.
//!
//! Firmware calls are not free: each one costs a trip through the ACPI
//! interpreter and shows up as DPC latency, which is why this backend
//! declares a minimum call interval instead of letting the engine poll
//! it at cache-miss rate.

use super::{BackendKind, ReadError, ReadOutcome, SensorBackend};
use crate::error::{Result, VulcanError};
use crate::metric::MetricId;
use std::time::Duration;

/// WMI BIOS command identifiers (hpqBDataIn.Command / CommandType)
#[cfg(target_os = "windows")]
mod command {
    /// Legacy command group used by all fan/thermal operations
    pub const GROUP_LEGACY: u32 = 0x0002_0008;
    /// Signature expected by the firmware in every request
    pub const SIGN: u32 = 0x5543_4553;

    pub const FAN_GET_COUNT: u32 = 0x10;
    pub const FAN_SET_MODE: u32 = 0x1A;
    pub const TEMP_GET: u32 = 0x23;
    pub const MAX_FAN_GET: u32 = 0x26;
    pub const MAX_FAN_SET: u32 = 0x27;
    pub const FAN_GET_LEVEL: u32 = 0x2D;
    pub const FAN_SET_LEVEL: u32 = 0x2E;
}

/// HP WMI BIOS command interface
pub struct WmiBiosBackend {
    available: bool,
    fan_count: u8,
}

impl WmiBiosBackend {
    /// Probe the firmware interface. Missing `hpqBIntM` (non-HP
    /// hardware, stripped OEM driver) just means unavailable.
    pub fn open() -> Self {
        #[cfg(target_os = "windows")]
        {
            match ffi::fan_count() {
                Ok(count) => Self {
                    available: true,
                    fan_count: count,
                },
                Err(_) => Self {
                    available: false,
                    fan_count: 0,
                },
            }
        }

        #[cfg(not(target_os = "windows"))]
        {
            Self {
                available: false,
                fan_count: 0,
            }
        }
    }

    /// Number of fan zones the firmware reports
    pub fn fan_count(&self) -> u8 {
        self.fan_count
    }

    /// Set both fan levels. Units depend on the board revision (see
    /// `ModelCapabilities::fan_level_unit`); the caller converts.
    pub fn set_fan_levels(&self, cpu_level: u8, gpu_level: u8) -> Result<()> {
        #[cfg(target_os = "windows")]
        {
            ffi::exec(command::FAN_SET_LEVEL, &[cpu_level, gpu_level])
                .map(|_| ())
                .map_err(|e| VulcanError::CommandRejected(e.to_string()))
        }

        #[cfg(not(target_os = "windows"))]
        {
            let _ = (cpu_level, gpu_level);
            Err(VulcanError::UnsupportedPlatform(
                "HP WMI BIOS requires Windows".to_string(),
            ))
        }
    }

    /// Set the firmware fan mode byte (performance mode register)
    pub fn set_fan_mode(&self, mode: u8) -> Result<()> {
        #[cfg(target_os = "windows")]
        {
            ffi::exec(command::FAN_SET_MODE, &[mode])
                .map(|_| ())
                .map_err(|e| VulcanError::CommandRejected(e.to_string()))
        }

        #[cfg(not(target_os = "windows"))]
        {
            let _ = mode;
            Err(VulcanError::UnsupportedPlatform(
                "HP WMI BIOS requires Windows".to_string(),
            ))
        }
    }

    /// Set or clear the max-fan flag
    pub fn set_max_fan(&self, on: bool) -> Result<()> {
        #[cfg(target_os = "windows")]
        {
            ffi::exec(command::MAX_FAN_SET, &[u8::from(on)])
                .map(|_| ())
                .map_err(|e| VulcanError::CommandRejected(e.to_string()))
        }

        #[cfg(not(target_os = "windows"))]
        {
            let _ = on;
            Err(VulcanError::UnsupportedPlatform(
                "HP WMI BIOS requires Windows".to_string(),
            ))
        }
    }

    /// Whether the max-fan flag is currently set
    pub fn max_fan(&self) -> Result<bool> {
        #[cfg(target_os = "windows")]
        {
            let data = ffi::exec(command::MAX_FAN_GET, &[])
                .map_err(|e| VulcanError::System(e.to_string()))?;
            Ok(data.first().copied().unwrap_or(0) != 0)
        }

        #[cfg(not(target_os = "windows"))]
        {
            Err(VulcanError::UnsupportedPlatform(
                "HP WMI BIOS requires Windows".to_string(),
            ))
        }
    }

    #[cfg(target_os = "windows")]
    fn read_fan_rpm(&self, zone: usize) -> ReadOutcome {
        let data = ffi::exec(command::FAN_GET_LEVEL, &[])?;
        // One byte per zone, in hundreds of RPM
        match data.get(zone) {
            Some(level) => Ok(*level as f64 * 100.0),
            None => Err(ReadError::Transient(format!(
                "firmware returned {} fan levels, wanted zone {}",
                data.len(),
                zone
            ))),
        }
    }

    #[cfg(target_os = "windows")]
    fn read_bios_temp(&self) -> ReadOutcome {
        let data = ffi::exec(command::TEMP_GET, &[])?;
        match data.first() {
            Some(&t) if t > 0 && t < 120 => Ok(t as f64),
            Some(&t) => Err(ReadError::Transient(format!(
                "implausible BIOS temperature {}",
                t
            ))),
            None => Err(ReadError::Transient("empty temperature reply".into())),
        }
    }
}

impl SensorBackend for WmiBiosBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::WmiBios
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn supported_metrics(&self) -> Vec<MetricId> {
        vec![
            MetricId::CpuTemperature,
            MetricId::FanRpmCpu,
            MetricId::FanRpmGpu,
        ]
    }

    fn priority(&self, metric: MetricId) -> Option<u8> {
        match metric {
            // Integer-granular and occasionally parked at the throttle
            // threshold; only preferred for the fan tach it owns
            MetricId::CpuTemperature => Some(2),
            MetricId::FanRpmCpu | MetricId::FanRpmGpu => Some(0),
            _ => None,
        }
    }

    fn try_read(&mut self, metric: MetricId) -> ReadOutcome {
        if !self.available {
            return Err(ReadError::Unavailable("hpqBIntM not present".into()));
        }

        #[cfg(target_os = "windows")]
        {
            match metric {
                MetricId::CpuTemperature => self.read_bios_temp(),
                MetricId::FanRpmCpu => self.read_fan_rpm(0),
                MetricId::FanRpmGpu => self.read_fan_rpm(1),
                _ => Err(ReadError::NotSupported),
            }
        }

        #[cfg(not(target_os = "windows"))]
        {
            let _ = metric;
            Err(ReadError::Unavailable(
                "HP WMI BIOS requires Windows".into(),
            ))
        }
    }

    fn min_interval(&self) -> Duration {
        // Firmware round-trips cause measurable DPC latency
        Duration::from_millis(500)
    }
}

#[cfg(target_os = "windows")]
mod ffi {
    //! Raw hpqBIntM method invocation via WMI

    use super::command;
    use super::ReadError;
    use std::collections::HashMap;
    use wmi::{COMLibrary, Variant, WMIConnection};

    /// Execute one BIOS command and return the reply payload
    pub fn exec(command_type: u32, payload: &[u8]) -> Result<Vec<u8>, ReadError> {
        let com = COMLibrary::new()
            .map_err(|e| ReadError::Unavailable(format!("COM init failed: {}", e)))?;
        let wmi = WMIConnection::with_namespace_path("root\\wmi", com)
            .map_err(|e| ReadError::Unavailable(format!("root\\wmi unavailable: {}", e)))?;

        // The interface publishes one instance per ACPI device node
        let instances: Vec<HashMap<String, Variant>> = wmi
            .raw_query("SELECT InstanceName FROM hpqBIntM")
            .map_err(|e| ReadError::Unavailable(format!("hpqBIntM not present: {}", e)))?;
        let instance = instances
            .first()
            .and_then(|i| match i.get("InstanceName") {
                Some(Variant::String(s)) => Some(s.clone()),
                _ => None,
            })
            .ok_or_else(|| ReadError::Unavailable("hpqBIntM has no instances".into()))?;

        let mut data = vec![0u8; 128];
        data[..payload.len().min(128)].copy_from_slice(&payload[..payload.len().min(128)]);

        let mut in_params: HashMap<String, Variant> = HashMap::new();
        in_params.insert("Sign".to_string(), Variant::UI4(command::SIGN));
        in_params.insert("Command".to_string(), Variant::UI4(command::GROUP_LEGACY));
        in_params.insert("CommandType".to_string(), Variant::UI4(command_type));
        in_params.insert("Size".to_string(), Variant::UI4(payload.len() as u32));
        in_params.insert(
            "hpqBData".to_string(),
            Variant::Array(data.into_iter().map(Variant::UI1).collect()),
        );

        let object_path = format!("hpqBIntM.InstanceName='{}'", instance);
        let out = wmi
            .exec_method(&object_path, "hpqBIOSInt128", &in_params)
            .map_err(|e| ReadError::Transient(format!("hpqBIOSInt128 failed: {}", e)))?;

        let out = out.ok_or_else(|| ReadError::Transient("empty method reply".into()))?;

        // rwReturnCode 0 is success; anything else is a firmware NAK
        if let Some(Variant::UI4(code)) = out.get("rwReturnCode") {
            if *code != 0 {
                return Err(ReadError::Transient(format!(
                    "firmware return code {:#x}",
                    code
                )));
            }
        }

        match out.get("Data") {
            Some(Variant::Array(bytes)) => Ok(bytes
                .iter()
                .filter_map(|v| match v {
                    Variant::UI1(b) => Some(*b),
                    _ => None,
                })
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    /// Fan zone count from the firmware
    pub fn fan_count() -> Result<u8, ReadError> {
        let data = exec(command::FAN_GET_COUNT, &[])?;
        Ok(data.first().copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_priorities() {
        let backend = WmiBiosBackend {
            available: true,
            fan_count: 2,
        };
        // Owns the fan tach; deprioritized for temperature
        assert_eq!(backend.priority(MetricId::FanRpmCpu), Some(0));
        assert_eq!(backend.priority(MetricId::FanRpmGpu), Some(0));
        assert_eq!(backend.priority(MetricId::CpuTemperature), Some(2));
        assert_eq!(backend.priority(MetricId::GpuPower), None);
    }

    #[test]
    fn test_unavailable_when_interface_missing() {
        let mut backend = WmiBiosBackend {
            available: false,
            fan_count: 0,
        };
        assert!(!backend.is_available());
        assert!(matches!(
            backend.try_read(MetricId::FanRpmCpu),
            Err(ReadError::Unavailable(_))
        ));
    }

    #[test]
    fn test_declares_min_interval() {
        let backend = WmiBiosBackend {
            available: true,
            fan_count: 2,
        };
        assert!(backend.min_interval() > Duration::ZERO);
    }
}
