//! ACPI thermal zone backend
//!
//! Coarse CPU temperature from `MSAcpi_ThermalZoneTemperature` in the
//! `root\WMI` namespace. Slow to update and integer-granular, but
//! present on nearly every machine, which makes it the fallback of
//! last resort when the precise sources are stuck or gone.

use super::{BackendKind, ReadError, ReadOutcome, SensorBackend};
use crate::metric::MetricId;
use std::time::Duration;

/// ACPI thermal zone reader (WMI)
pub struct AcpiThermalBackend {
    available: bool,
}

impl AcpiThermalBackend {
    /// Probe the thermal zone class. Probing failure just means the
    /// backend reports unavailable; never fatal.
    pub fn open() -> Self {
        Self {
            available: Self::probe(),
        }
    }

    #[cfg(target_os = "windows")]
    fn probe() -> bool {
        read_zone_temperature().is_ok()
    }

    #[cfg(not(target_os = "windows"))]
    fn probe() -> bool {
        false
    }
}

impl SensorBackend for AcpiThermalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::AcpiThermalZone
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn supported_metrics(&self) -> Vec<MetricId> {
        vec![MetricId::CpuTemperature]
    }

    fn priority(&self, metric: MetricId) -> Option<u8> {
        match metric {
            MetricId::CpuTemperature => Some(3),
            _ => None,
        }
    }

    fn try_read(&mut self, metric: MetricId) -> ReadOutcome {
        if metric != MetricId::CpuTemperature {
            return Err(ReadError::NotSupported);
        }
        if !self.available {
            return Err(ReadError::Unavailable("ACPI thermal zone absent".into()));
        }

        #[cfg(target_os = "windows")]
        {
            read_zone_temperature()
        }

        #[cfg(not(target_os = "windows"))]
        {
            Err(ReadError::Unavailable(
                "ACPI thermal zone requires Windows WMI".into(),
            ))
        }
    }

    fn min_interval(&self) -> Duration {
        // ACPI zones update on the order of seconds; polling faster
        // only burns WMI round-trips
        Duration::from_millis(1000)
    }
}

/// Query every thermal zone and return the hottest plausible reading
#[cfg(target_os = "windows")]
fn read_zone_temperature() -> ReadOutcome {
    use std::collections::HashMap;
    use wmi::{COMLibrary, Variant, WMIConnection};

    let com = COMLibrary::new()
        .map_err(|e| ReadError::Unavailable(format!("COM init failed: {}", e)))?;
    let wmi = WMIConnection::with_namespace_path("root\\WMI", com)
        .map_err(|e| ReadError::Unavailable(format!("root\\WMI unavailable: {}", e)))?;

    let results: Vec<HashMap<String, Variant>> = wmi
        .raw_query("SELECT CurrentTemperature FROM MSAcpi_ThermalZoneTemperature")
        .map_err(|e| ReadError::Transient(format!("thermal zone query failed: {}", e)))?;

    let mut best: Option<f64> = None;
    for item in &results {
        if let Some(Variant::UI4(tenths_kelvin)) = item.get("CurrentTemperature") {
            // Tenths of Kelvin to Celsius
            let temp_c = (*tenths_kelvin as f64 / 10.0) - 273.15;
            if temp_c > 0.0 && temp_c < 150.0 {
                best = Some(best.map_or(temp_c, |b: f64| b.max(temp_c)));
            }
        }
    }

    best.ok_or_else(|| ReadError::Transient("no plausible thermal zone reading".into()))
}
