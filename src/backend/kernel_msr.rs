//! Kernel MSR backend
//!
//! Reads Intel model-specific registers through a WinRing0-compatible
//! signed driver. This is the most precise CPU source available:
//! package temperature straight from the digital thermal sensor,
//! package power from RAPL energy-counter deltas, and the current
//! core ratio. It is also the source that needs a driver installed,
//! so on most machines it simply reports unavailable.
//!
//! The driver handle is opened once and reused across cycles; it is
//! released on drop. `reinitialize` closes and reopens it, which is
//! the remediation path when the driver starts returning frozen data.

use super::{BackendKind, ReadError, ReadOutcome, SensorBackend};
use crate::error::{Result, VulcanError};
use crate::metric::MetricId;
use crate::sample::ThrottleFlags;

#[cfg(target_os = "windows")]
use std::time::Instant;

/// MSR addresses used by this backend
#[cfg(target_os = "windows")]
mod msr {
    pub const IA32_PERF_STATUS: u32 = 0x198;
    pub const IA32_PACKAGE_THERM_STATUS: u32 = 0x1B1;
    pub const MSR_TEMPERATURE_TARGET: u32 = 0x1A2;
    pub const MSR_RAPL_POWER_UNIT: u32 = 0x606;
    pub const MSR_PKG_POWER_LIMIT: u32 = 0x610;
    pub const MSR_PKG_ENERGY_STATUS: u32 = 0x611;
    /// Overclocking mailbox (voltage offset interface)
    pub const OC_MAILBOX: u32 = 0x150;
}

/// MSR access through a ring-0 driver
pub struct KernelMsrBackend {
    #[cfg(target_os = "windows")]
    inner: Option<driver::Driver>,
    #[cfg(target_os = "windows")]
    tjmax: f64,
    #[cfg(target_os = "windows")]
    energy_unit_joules: f64,
    #[cfg(target_os = "windows")]
    last_energy: Option<(u32, Instant)>,
}

impl KernelMsrBackend {
    /// Open the driver device. A missing driver is the expected
    /// steady state on machines without the helper service installed.
    pub fn open() -> Self {
        #[cfg(target_os = "windows")]
        {
            match driver::Driver::open() {
                Ok(drv) => {
                    let tjmax = drv
                        .read_msr(msr::MSR_TEMPERATURE_TARGET)
                        .map(|v| ((v >> 16) & 0xFF) as f64)
                        .unwrap_or(100.0);
                    let energy_unit_joules = drv
                        .read_msr(msr::MSR_RAPL_POWER_UNIT)
                        .map(|v| {
                            let esu = (v >> 8) & 0x1F;
                            1.0 / f64::from(1u32 << esu)
                        })
                        .unwrap_or(1.0 / 65536.0);
                    Self {
                        inner: Some(drv),
                        tjmax,
                        energy_unit_joules,
                        last_energy: None,
                    }
                }
                Err(_) => Self {
                    inner: None,
                    tjmax: 100.0,
                    energy_unit_joules: 1.0 / 65536.0,
                    last_energy: None,
                },
            }
        }

        #[cfg(not(target_os = "windows"))]
        {
            Self {}
        }
    }

    /// TjMax reported by the processor (°C)
    #[cfg(target_os = "windows")]
    pub fn tjmax(&self) -> f64 {
        self.tjmax
    }

    /// Write the package power limit (PL1) in watts.
    /// Fails with `CommandRejected` when the limit is BIOS-locked.
    pub fn write_power_limit(&self, watts: f64) -> Result<()> {
        #[cfg(target_os = "windows")]
        {
            let drv = self
                .inner
                .as_ref()
                .ok_or_else(|| VulcanError::FeatureNotAvailable("MSR driver not open".into()))?;
            let current = drv
                .read_msr(msr::MSR_PKG_POWER_LIMIT)
                .map_err(|e| VulcanError::System(e.to_string()))?;
            // Bit 63: the whole register is BIOS-locked
            if current >> 63 != 0 {
                return Err(VulcanError::CommandRejected(
                    "package power limit is BIOS-locked".to_string(),
                ));
            }
            // PL1 in 1/8 W units, low 15 bits; keep enable bit set
            let units = ((watts * 8.0) as u64) & 0x7FFF;
            let new = (current & !0x7FFF) | units | (1 << 15);
            drv.write_msr(msr::MSR_PKG_POWER_LIMIT, new)
                .map_err(|e| VulcanError::System(e.to_string()))
        }

        #[cfg(not(target_os = "windows"))]
        {
            let _ = watts;
            Err(VulcanError::UnsupportedPlatform(
                "MSR access requires Windows".to_string(),
            ))
        }
    }

    /// Apply a core voltage offset in millivolts via the OC mailbox.
    /// Negative values undervolt. Locked mailboxes reject the write.
    pub fn write_voltage_offset(&self, millivolts: i32) -> Result<()> {
        #[cfg(target_os = "windows")]
        {
            let drv = self
                .inner
                .as_ref()
                .ok_or_else(|| VulcanError::FeatureNotAvailable("MSR driver not open".into()))?;
            // Offset in 1/1.024 mV steps, two's complement in bits 31:21
            let steps = ((f64::from(millivolts) * 1.024).round() as i32) << 21;
            let cmd: u64 = 0x8000_0011_0000_0000 | (steps as u32 as u64);
            drv.write_msr(msr::OC_MAILBOX, cmd)
                .map_err(|e| VulcanError::System(e.to_string()))?;
            // The mailbox reports success by clearing the busy bit
            let reply = drv
                .read_msr(msr::OC_MAILBOX)
                .map_err(|e| VulcanError::System(e.to_string()))?;
            if (reply >> 32) & 0xFF != 0 {
                return Err(VulcanError::CommandRejected(format!(
                    "OC mailbox error code {:#x}",
                    (reply >> 32) & 0xFF
                )));
            }
            Ok(())
        }

        #[cfg(not(target_os = "windows"))]
        {
            let _ = millivolts;
            Err(VulcanError::UnsupportedPlatform(
                "MSR access requires Windows".to_string(),
            ))
        }
    }

    #[cfg(target_os = "windows")]
    fn read_package_temp(&self) -> ReadOutcome {
        let drv = self
            .inner
            .as_ref()
            .ok_or_else(|| ReadError::Unavailable("MSR driver not open".into()))?;
        let status = drv.read_msr(msr::IA32_PACKAGE_THERM_STATUS)?;
        // Bit 31 validates the digital readout in bits 22:16
        if (status >> 31) & 1 == 0 {
            return Err(ReadError::Transient("thermal readout invalid".into()));
        }
        let below_tjmax = ((status >> 16) & 0x7F) as f64;
        Ok(self.tjmax - below_tjmax)
    }

    #[cfg(target_os = "windows")]
    fn read_package_power(&mut self) -> ReadOutcome {
        let drv = self
            .inner
            .as_ref()
            .ok_or_else(|| ReadError::Unavailable("MSR driver not open".into()))?;
        let raw = drv.read_msr(msr::MSR_PKG_ENERGY_STATUS)? as u32;
        let now = Instant::now();
        let prev = self.last_energy.replace((raw, now));
        match prev {
            Some((prev_raw, prev_at)) => {
                let elapsed = now.duration_since(prev_at).as_secs_f64();
                if elapsed <= 0.0 {
                    return Err(ReadError::Transient("zero-length energy window".into()));
                }
                // 32-bit counter; wrapping_sub handles rollover
                let delta = raw.wrapping_sub(prev_raw) as f64 * self.energy_unit_joules;
                Ok(delta / elapsed)
            }
            // First read primes the counter; no rate yet
            None => Err(ReadError::Transient("priming energy counter".into())),
        }
    }

    #[cfg(target_os = "windows")]
    fn read_core_clock(&self) -> ReadOutcome {
        let drv = self
            .inner
            .as_ref()
            .ok_or_else(|| ReadError::Unavailable("MSR driver not open".into()))?;
        let status = drv.read_msr(msr::IA32_PERF_STATUS)?;
        let ratio = ((status >> 8) & 0xFF) as f64;
        if ratio == 0.0 {
            return Err(ReadError::Transient("zero perf ratio".into()));
        }
        // Ratio of the 100 MHz bus clock
        Ok(ratio * 100.0)
    }
}

impl SensorBackend for KernelMsrBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::KernelMsr
    }

    fn is_available(&self) -> bool {
        #[cfg(target_os = "windows")]
        {
            self.inner.is_some()
        }

        #[cfg(not(target_os = "windows"))]
        {
            false
        }
    }

    fn supported_metrics(&self) -> Vec<MetricId> {
        vec![
            MetricId::CpuTemperature,
            MetricId::CpuPower,
            MetricId::CpuClock,
        ]
    }

    fn priority(&self, metric: MetricId) -> Option<u8> {
        match metric {
            MetricId::CpuTemperature | MetricId::CpuPower | MetricId::CpuClock => Some(0),
            _ => None,
        }
    }

    fn try_read(&mut self, metric: MetricId) -> ReadOutcome {
        #[cfg(target_os = "windows")]
        {
            match metric {
                MetricId::CpuTemperature => self.read_package_temp(),
                MetricId::CpuPower => self.read_package_power(),
                MetricId::CpuClock => self.read_core_clock(),
                _ => Err(ReadError::NotSupported),
            }
        }

        #[cfg(not(target_os = "windows"))]
        {
            let _ = metric;
            Err(ReadError::Unavailable("MSR access requires Windows".into()))
        }
    }

    fn reinitialize(&mut self) -> Result<()> {
        #[cfg(target_os = "windows")]
        {
            self.inner = None;
            self.last_energy = None;
            let drv = driver::Driver::open()
                .map_err(|e| VulcanError::InitializationError(e.to_string()))?;
            self.inner = Some(drv);
            Ok(())
        }

        #[cfg(not(target_os = "windows"))]
        {
            Ok(())
        }
    }

    fn read_throttle(&mut self) -> Option<ThrottleFlags> {
        #[cfg(target_os = "windows")]
        {
            let drv = self.inner.as_ref()?;
            let status = drv.read_msr(msr::IA32_PACKAGE_THERM_STATUS).ok()?;
            Some(ThrottleFlags {
                cpu_thermal: status & 1 != 0,
                // PROCHOT/power limit status bit
                cpu_power: (status >> 10) & 1 != 0,
                gpu_thermal: false,
                gpu_power: false,
            })
        }

        #[cfg(not(target_os = "windows"))]
        {
            None
        }
    }
}

#[cfg(target_os = "windows")]
mod driver {
    //! WinRing0-compatible device access

    use super::ReadError;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
    use windows::Win32::Storage::FileSystem::{
        CreateFileW, FILE_GENERIC_READ, FILE_GENERIC_WRITE, FILE_SHARE_READ, FILE_SHARE_WRITE,
        OPEN_EXISTING,
    };
    use windows::Win32::System::IO::DeviceIoControl;

    const DEVICE_PATH: &str = "\\\\.\\WinRing0_1_2_0";
    const IOCTL_OLS_READ_MSR: u32 = 0x9C40_2084;
    const IOCTL_OLS_WRITE_MSR: u32 = 0x9C40_2088;

    /// Exclusive owner of the driver handle
    pub struct Driver {
        handle: HANDLE,
    }

    // The handle is only used through DeviceIoControl, which the
    // kernel serializes; in-process callers are serialized by the
    // engine's update lock and the actuation controller's state lock.
    unsafe impl Send for Driver {}
    unsafe impl Sync for Driver {}

    impl Driver {
        pub fn open() -> Result<Self, ReadError> {
            let path: Vec<u16> = DEVICE_PATH.encode_utf16().chain(std::iter::once(0)).collect();
            let handle = unsafe {
                CreateFileW(
                    PCWSTR(path.as_ptr()),
                    (FILE_GENERIC_READ | FILE_GENERIC_WRITE).0,
                    FILE_SHARE_READ | FILE_SHARE_WRITE,
                    None,
                    OPEN_EXISTING,
                    Default::default(),
                    None,
                )
            }
            .map_err(|e| ReadError::Unavailable(format!("driver not present: {}", e)))?;
            if handle == INVALID_HANDLE_VALUE {
                return Err(ReadError::Unavailable("invalid driver handle".into()));
            }
            Ok(Self { handle })
        }

        pub fn read_msr(&self, index: u32) -> Result<u64, ReadError> {
            let input = index.to_le_bytes();
            let mut output = [0u8; 8];
            let mut returned = 0u32;
            unsafe {
                DeviceIoControl(
                    self.handle,
                    IOCTL_OLS_READ_MSR,
                    Some(input.as_ptr().cast()),
                    input.len() as u32,
                    Some(output.as_mut_ptr().cast()),
                    output.len() as u32,
                    Some(&mut returned),
                    None,
                )
            }
            .map_err(|e| ReadError::Transient(format!("MSR {:#x} read failed: {}", index, e)))?;
            if returned as usize != output.len() {
                return Err(ReadError::Transient(format!(
                    "short MSR reply ({} bytes)",
                    returned
                )));
            }
            Ok(u64::from_le_bytes(output))
        }

        pub fn write_msr(&self, index: u32, value: u64) -> Result<(), ReadError> {
            let mut input = [0u8; 12];
            input[..4].copy_from_slice(&index.to_le_bytes());
            input[4..].copy_from_slice(&value.to_le_bytes());
            let mut returned = 0u32;
            unsafe {
                DeviceIoControl(
                    self.handle,
                    IOCTL_OLS_WRITE_MSR,
                    Some(input.as_ptr().cast()),
                    input.len() as u32,
                    None,
                    0,
                    Some(&mut returned),
                    None,
                )
            }
            .map_err(|e| ReadError::Transient(format!("MSR {:#x} write failed: {}", index, e)))
        }
    }

    impl Drop for Driver {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.handle);
            }
        }
    }
}
