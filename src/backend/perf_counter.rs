//! OS performance counter backend
//!
//! System-level telemetry that needs no vendor driver: CPU load from
//! kernel time deltas, RAM from the memory status API, battery state
//! from the power status API plus the WMI battery class, and SSD
//! temperature from the storage reliability counters. Always available
//! on Windows, which makes it the dependable floor of the fallback
//! chains for the metrics it covers.

use super::{BackendKind, ReadError, ReadOutcome, SensorBackend};
use crate::metric::MetricId;
use std::time::Duration;

/// OS counters and power status
pub struct PerfCounterBackend {
    // Previous system times for load deltas; instance state rather
    // than process-wide statics so two engines never cross-talk
    #[cfg(target_os = "windows")]
    prev_idle: u64,
    #[cfg(target_os = "windows")]
    prev_kernel: u64,
    #[cfg(target_os = "windows")]
    prev_user: u64,
}

impl PerfCounterBackend {
    /// OS counters need no probing; the backend is available wherever
    /// the APIs exist.
    pub fn open() -> Self {
        #[cfg(target_os = "windows")]
        {
            Self {
                prev_idle: 0,
                prev_kernel: 0,
                prev_user: 0,
            }
        }

        #[cfg(not(target_os = "windows"))]
        {
            Self {}
        }
    }

    #[cfg(target_os = "windows")]
    fn read_cpu_load(&mut self) -> ReadOutcome {
        use windows::Win32::Foundation::FILETIME;

        #[link(name = "kernel32")]
        extern "system" {
            fn GetSystemTimes(
                lpIdleTime: *mut FILETIME,
                lpKernelTime: *mut FILETIME,
                lpUserTime: *mut FILETIME,
            ) -> i32;
        }

        fn filetime_to_u64(ft: &FILETIME) -> u64 {
            (u64::from(ft.dwHighDateTime) << 32) | u64::from(ft.dwLowDateTime)
        }

        let mut idle_time: FILETIME = unsafe { std::mem::zeroed() };
        let mut kernel_time: FILETIME = unsafe { std::mem::zeroed() };
        let mut user_time: FILETIME = unsafe { std::mem::zeroed() };

        let ok = unsafe { GetSystemTimes(&mut idle_time, &mut kernel_time, &mut user_time) };
        if ok == 0 {
            return Err(ReadError::Transient("GetSystemTimes failed".into()));
        }

        let idle = filetime_to_u64(&idle_time);
        let kernel = filetime_to_u64(&kernel_time);
        let user = filetime_to_u64(&user_time);

        let idle_delta = idle.saturating_sub(self.prev_idle);
        let kernel_delta = kernel.saturating_sub(self.prev_kernel);
        let user_delta = user.saturating_sub(self.prev_user);
        let first_call = self.prev_idle == 0;

        self.prev_idle = idle;
        self.prev_kernel = kernel;
        self.prev_user = user;

        if first_call {
            return Err(ReadError::Transient("priming system time deltas".into()));
        }

        // Kernel time includes idle time
        let busy = kernel_delta.saturating_sub(idle_delta) + user_delta;
        let total = idle_delta + busy;
        if total == 0 {
            return Err(ReadError::Transient("zero-length sample window".into()));
        }

        Ok(busy as f64 / total as f64 * 100.0)
    }

    #[cfg(target_os = "windows")]
    fn read_ram(&self, total: bool) -> ReadOutcome {
        use windows::Win32::System::SystemInformation::{GlobalMemoryStatusEx, MEMORYSTATUSEX};

        let mut status: MEMORYSTATUSEX = unsafe { std::mem::zeroed() };
        status.dwLength = std::mem::size_of::<MEMORYSTATUSEX>() as u32;
        unsafe { GlobalMemoryStatusEx(&mut status) }
            .map_err(|e| ReadError::Transient(format!("GlobalMemoryStatusEx failed: {}", e)))?;

        let bytes = if total {
            status.ullTotalPhys
        } else {
            status.ullTotalPhys - status.ullAvailPhys
        };
        Ok(bytes as f64 / 1024.0 / 1024.0)
    }

    #[cfg(target_os = "windows")]
    fn power_status(&self) -> Result<windows::Win32::System::Power::SYSTEM_POWER_STATUS, ReadError>
    {
        use windows::Win32::System::Power::{GetSystemPowerStatus, SYSTEM_POWER_STATUS};

        let mut status: SYSTEM_POWER_STATUS = unsafe { std::mem::zeroed() };
        unsafe { GetSystemPowerStatus(&mut status) }
            .map_err(|e| ReadError::Transient(format!("GetSystemPowerStatus failed: {}", e)))?;
        Ok(status)
    }

    #[cfg(target_os = "windows")]
    fn read_battery_charge(&self) -> ReadOutcome {
        let status = self.power_status()?;
        match status.BatteryLifePercent {
            // 255 means no battery / unknown
            255 => Err(ReadError::Unavailable("no battery present".into())),
            percent => Ok(f64::from(percent)),
        }
    }

    #[cfg(target_os = "windows")]
    fn read_discharge_rate(&self) -> ReadOutcome {
        use std::collections::HashMap;
        use wmi::{COMLibrary, Variant, WMIConnection};

        // On AC the rate is zero by definition
        let status = self.power_status()?;
        if status.ACLineStatus == 1 {
            return Ok(0.0);
        }

        let com = COMLibrary::new()
            .map_err(|e| ReadError::Unavailable(format!("COM init failed: {}", e)))?;
        let wmi = WMIConnection::with_namespace_path("root\\WMI", com)
            .map_err(|e| ReadError::Unavailable(format!("root\\WMI unavailable: {}", e)))?;

        let rows: Vec<HashMap<String, Variant>> = wmi
            .raw_query("SELECT DischargeRate FROM BatteryStatus")
            .map_err(|e| ReadError::Transient(format!("BatteryStatus query failed: {}", e)))?;

        for row in &rows {
            if let Some(Variant::I4(rate_mw)) = row.get("DischargeRate") {
                if *rate_mw > 0 {
                    return Ok(f64::from(*rate_mw) / 1000.0);
                }
            }
        }
        Err(ReadError::Transient("no discharge rate reported".into()))
    }

    #[cfg(target_os = "windows")]
    fn read_ssd_temperature(&self) -> ReadOutcome {
        use std::collections::HashMap;
        use wmi::{COMLibrary, Variant, WMIConnection};

        let com = COMLibrary::new()
            .map_err(|e| ReadError::Unavailable(format!("COM init failed: {}", e)))?;
        let wmi =
            WMIConnection::with_namespace_path("root\\microsoft\\windows\\storage", com).map_err(
                |e| ReadError::Unavailable(format!("storage namespace unavailable: {}", e)),
            )?;

        let rows: Vec<HashMap<String, Variant>> = wmi
            .raw_query("SELECT Temperature FROM MSFT_StorageReliabilityCounter")
            .map_err(|e| ReadError::Transient(format!("reliability query failed: {}", e)))?;

        let mut best: Option<f64> = None;
        for row in &rows {
            if let Some(Variant::UI2(temp)) = row.get("Temperature") {
                let t = f64::from(*temp);
                if t > 0.0 && t < 100.0 {
                    best = Some(best.map_or(t, |b: f64| b.max(t)));
                }
            }
        }
        best.ok_or_else(|| ReadError::Transient("no drive temperature reported".into()))
    }
}

impl SensorBackend for PerfCounterBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::PerfCounter
    }

    fn is_available(&self) -> bool {
        cfg!(target_os = "windows")
    }

    fn supported_metrics(&self) -> Vec<MetricId> {
        vec![
            MetricId::CpuLoad,
            MetricId::RamUsed,
            MetricId::RamTotal,
            MetricId::BatteryCharge,
            MetricId::BatteryDischargeRate,
            MetricId::SsdTemperature,
        ]
    }

    fn priority(&self, metric: MetricId) -> Option<u8> {
        match metric {
            MetricId::CpuLoad
            | MetricId::RamUsed
            | MetricId::RamTotal
            | MetricId::BatteryCharge
            | MetricId::BatteryDischargeRate
            | MetricId::SsdTemperature => Some(0),
            _ => None,
        }
    }

    fn try_read(&mut self, metric: MetricId) -> ReadOutcome {
        #[cfg(target_os = "windows")]
        {
            match metric {
                MetricId::CpuLoad => self.read_cpu_load(),
                MetricId::RamUsed => self.read_ram(false),
                MetricId::RamTotal => self.read_ram(true),
                MetricId::BatteryCharge => self.read_battery_charge(),
                MetricId::BatteryDischargeRate => self.read_discharge_rate(),
                MetricId::SsdTemperature => self.read_ssd_temperature(),
                _ => Err(ReadError::NotSupported),
            }
        }

        #[cfg(not(target_os = "windows"))]
        {
            let _ = metric;
            Err(ReadError::Unavailable(
                "OS counters implemented for Windows only".into(),
            ))
        }
    }

    fn power_source(&mut self) -> Option<bool> {
        #[cfg(target_os = "windows")]
        {
            let status = self.power_status().ok()?;
            match status.ACLineStatus {
                0 => Some(false),
                1 => Some(true),
                _ => None,
            }
        }

        #[cfg(not(target_os = "windows"))]
        {
            None
        }
    }

    fn battery_minutes(&mut self) -> Option<u32> {
        #[cfg(target_os = "windows")]
        {
            let status = self.power_status().ok()?;
            match status.BatteryLifeTime {
                u32::MAX => None,
                secs => Some(secs / 60),
            }
        }

        #[cfg(not(target_os = "windows"))]
        {
            None
        }
    }

    fn min_interval(&self) -> Duration {
        Duration::ZERO
    }
}
