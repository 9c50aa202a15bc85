//! Shared memory backend (MSI Afterburner)
//!
//! Reads the `MAHMSharedMemory` region Afterburner publishes while it
//! runs. When present it is the richest single source in the system
//! (CPU and GPU temperatures, hotspot, power, clocks, VRAM, and the
//! GPU fan tach), all updated by someone else's polling loop at zero
//! driver cost to us. When the tool is not running, the mapping simply
//! does not exist and this backend reports unavailable.
//!
//! The mapping is opened once and kept for the process lifetime; the
//! view is re-read in place on every call and unmapped on drop.

use super::{BackendKind, ReadError, ReadOutcome, SensorBackend};
use crate::metric::MetricId;

/// Afterburner source names for each metric we consume
#[cfg(target_os = "windows")]
fn source_name(metric: MetricId) -> Option<&'static str> {
    match metric {
        MetricId::CpuTemperature => Some("CPU temperature"),
        MetricId::CpuPower => Some("CPU power"),
        MetricId::CpuClock => Some("CPU clock"),
        MetricId::GpuTemperature => Some("GPU temperature"),
        MetricId::GpuHotspot => Some("GPU hotspot temperature"),
        MetricId::GpuLoad => Some("GPU usage"),
        MetricId::GpuPower => Some("GPU power"),
        MetricId::GpuCoreClock => Some("Core clock"),
        MetricId::GpuMemoryClock => Some("Memory clock"),
        MetricId::VramUsed => Some("Memory usage"),
        MetricId::FanRpmGpu => Some("Fan tachometer"),
        _ => None,
    }
}

/// Third-party monitoring tool shared memory reader
pub struct SharedMemoryBackend {
    #[cfg(target_os = "windows")]
    map: Option<mapping::Mapping>,
}

impl SharedMemoryBackend {
    /// Open the published mapping if the tool is running
    pub fn open() -> Self {
        #[cfg(target_os = "windows")]
        {
            Self {
                map: mapping::Mapping::open().ok(),
            }
        }

        #[cfg(not(target_os = "windows"))]
        {
            Self {}
        }
    }
}

impl SensorBackend for SharedMemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SharedMemory
    }

    fn is_available(&self) -> bool {
        #[cfg(target_os = "windows")]
        {
            self.map.is_some()
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
            MetricId::GpuTemperature,
            MetricId::GpuHotspot,
            MetricId::GpuLoad,
            MetricId::GpuPower,
            MetricId::GpuCoreClock,
            MetricId::GpuMemoryClock,
            MetricId::VramUsed,
            MetricId::FanRpmGpu,
        ]
    }

    fn priority(&self, metric: MetricId) -> Option<u8> {
        match metric {
            // Sole hotspot source
            MetricId::GpuHotspot => Some(0),
            MetricId::CpuTemperature
            | MetricId::CpuPower
            | MetricId::CpuClock
            | MetricId::GpuTemperature
            | MetricId::GpuLoad
            | MetricId::GpuPower
            | MetricId::GpuCoreClock
            | MetricId::GpuMemoryClock
            | MetricId::VramUsed
            | MetricId::FanRpmGpu => Some(1),
            _ => None,
        }
    }

    fn try_read(&mut self, metric: MetricId) -> ReadOutcome {
        #[cfg(target_os = "windows")]
        {
            let name = source_name(metric).ok_or(ReadError::NotSupported)?;
            let map = self
                .map
                .as_ref()
                .ok_or_else(|| ReadError::Unavailable("monitoring tool not running".into()))?;
            match map.read_source(name) {
                Ok(Some(value)) => Ok(f64::from(value)),
                Ok(None) => Err(ReadError::Transient(format!(
                    "source '{}' not published",
                    name
                ))),
                Err(e) => Err(e),
            }
        }

        #[cfg(not(target_os = "windows"))]
        {
            let _ = metric;
            Err(ReadError::Unavailable(
                "shared memory mapping requires Windows".into(),
            ))
        }
    }

    fn reinitialize(&mut self) -> crate::error::Result<()> {
        #[cfg(target_os = "windows")]
        {
            // The tool may have restarted and republished the region
            self.map = mapping::Mapping::open().ok();
        }
        Ok(())
    }
}

#[cfg(target_os = "windows")]
mod mapping {
    //! Raw MAHM region access

    use super::ReadError;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::System::Memory::{
        MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_READ,
        MEMORY_MAPPED_VIEW_ADDRESS,
    };

    const MAPPING_NAME: &str = "MAHMSharedMemory";
    /// 'MAHM' little-endian
    const SIGNATURE: u32 = 0x4D48_414D;
    /// Five 260-byte name/unit strings precede the data float
    const ENTRY_DATA_OFFSET: usize = 1300;

    /// Owner of the mapping handle and view
    pub struct Mapping {
        handle: HANDLE,
        view: MEMORY_MAPPED_VIEW_ADDRESS,
    }

    // Read-only view; concurrent readers are fine and the publisher
    // updates floats atomically enough for telemetry purposes
    unsafe impl Send for Mapping {}

    impl Mapping {
        pub fn open() -> Result<Self, ReadError> {
            let name: Vec<u16> = MAPPING_NAME
                .encode_utf16()
                .chain(std::iter::once(0))
                .collect();
            let handle = unsafe { OpenFileMappingW(FILE_MAP_READ.0, false, PCWSTR(name.as_ptr())) }
                .map_err(|e| ReadError::Unavailable(format!("mapping not published: {}", e)))?;
            let view = unsafe { MapViewOfFile(handle, FILE_MAP_READ, 0, 0, 0) };
            if view.Value.is_null() {
                unsafe {
                    let _ = CloseHandle(handle);
                }
                return Err(ReadError::Unavailable("MapViewOfFile failed".into()));
            }
            let map = Self { handle, view };
            // Validate the header before trusting any offsets
            if map.read_u32(0) != SIGNATURE {
                return Err(ReadError::Unavailable("bad shared memory signature".into()));
            }
            Ok(map)
        }

        fn base(&self) -> *const u8 {
            self.view.Value as *const u8
        }

        fn read_u32(&self, offset: usize) -> u32 {
            unsafe { (self.base().add(offset) as *const u32).read_unaligned() }
        }

        fn read_f32(&self, offset: usize) -> f32 {
            unsafe { (self.base().add(offset) as *const f32).read_unaligned() }
        }

        fn read_name(&self, offset: usize) -> String {
            let mut bytes = Vec::with_capacity(64);
            for i in 0..260 {
                let b = unsafe { self.base().add(offset + i).read() };
                if b == 0 {
                    break;
                }
                bytes.push(b);
            }
            String::from_utf8_lossy(&bytes).into_owned()
        }

        /// Look up one published source by name and return its value
        pub fn read_source(&self, name: &str) -> Result<Option<f32>, ReadError> {
            let header_size = self.read_u32(8) as usize;
            let num_entries = self.read_u32(12) as usize;
            let entry_size = self.read_u32(16) as usize;
            if entry_size < ENTRY_DATA_OFFSET + 4 || num_entries > 256 {
                return Err(ReadError::Transient("implausible header geometry".into()));
            }
            for i in 0..num_entries {
                let entry = header_size + i * entry_size;
                if self.read_name(entry) == name {
                    return Ok(Some(self.read_f32(entry + ENTRY_DATA_OFFSET)));
                }
            }
            Ok(None)
        }
    }

    impl Drop for Mapping {
        fn drop(&mut self) {
            unsafe {
                let _ = UnmapViewOfFile(self.view);
                let _ = CloseHandle(self.handle);
            }
        }
    }
}
