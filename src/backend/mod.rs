//! Sensor backend abstraction
//!
//! This module defines the common interface that all sensor data
//! sources implement, and the registry that turns a set of probed
//! backends into ordered per-metric fallback chains.
//!
//! A backend wraps exactly one native data source (firmware WMI calls,
//! kernel-driver MSR reads, vendor GPU API, OS counters, a shared
//! memory region). The contract at this boundary is strict: native
//! faults never cross it as panics. Every failure is converted into a
//! `ReadError` so the reconciliation engine can fall through to the
//! next source.

use crate::error::Result;
use crate::metric::MetricId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

pub mod acpi_thermal;
pub mod gpu_nvml;
pub mod kernel_msr;
pub mod perf_counter;
pub mod shared_memory;
pub mod wmi_bios;

/// Enumerated backend identity, stable for the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// HP WMI BIOS command interface (firmware calls)
    WmiBios,
    /// MSR access through a signed ring-0 driver
    KernelMsr,
    /// Vendor GPU telemetry API (NVML)
    VendorGpuApi,
    /// OS performance counters and power status
    PerfCounter,
    /// Shared memory published by a third-party monitoring tool
    SharedMemory,
    /// ACPI thermal zone via WMI
    AcpiThermalZone,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::WmiBios => write!(f, "WmiBios"),
            BackendKind::KernelMsr => write!(f, "KernelMsr"),
            BackendKind::VendorGpuApi => write!(f, "VendorGpuApi"),
            BackendKind::PerfCounter => write!(f, "PerfCounter"),
            BackendKind::SharedMemory => write!(f, "SharedMemory"),
            BackendKind::AcpiThermalZone => write!(f, "AcpiThermalZone"),
        }
    }
}

/// Failure taxonomy at the backend boundary
///
/// There is no repeated-failure variant here: that is derived state,
/// tracked by the health tracker once `Transient` failures cross its
/// threshold.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReadError {
    /// The source never initialized (driver not installed, tool not
    /// running, API absent). Expected steady state on many machines.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A single call failed; the next may succeed.
    #[error("transient read failure: {0}")]
    Transient(String),

    /// The backend does not supply this metric. A programming error in
    /// chain construction if it ever reaches the engine.
    #[error("metric not supported")]
    NotSupported,
}

/// Outcome of one backend read
pub type ReadOutcome = std::result::Result<f64, ReadError>;

/// Uniform capability wrapping one native data source
///
/// Implementations must catch every native-call failure and convert it
/// to a `ReadError`; nothing may panic or unwind across this trait.
pub trait SensorBackend: Send {
    /// Backend identity
    fn kind(&self) -> BackendKind;

    /// Whether the underlying source initialized successfully
    fn is_available(&self) -> bool;

    /// Metrics this backend can supply
    fn supported_metrics(&self) -> Vec<MetricId>;

    /// Priority rank for a metric (lower = preferred), or None when
    /// the metric is unsupported
    fn priority(&self, metric: MetricId) -> Option<u8>;

    /// Read one metric. May block for tens to hundreds of
    /// milliseconds on native calls; the engine runs these off any
    /// time-sensitive thread.
    fn try_read(&mut self, metric: MetricId) -> ReadOutcome;

    /// Tear down and re-open the native handle. Used as stuck-value
    /// remediation; a backend without a meaningful re-init reports Ok.
    fn reinitialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Minimum interval between calls to this backend. Firmware calls
    /// have real hardware cost (driver-level DPC latency); the engine
    /// will not call more often than this.
    fn min_interval(&self) -> Duration {
        Duration::ZERO
    }

    // === Optional side channels ===

    /// Throttling flags, for backends whose source reports them
    fn read_throttle(&mut self) -> Option<crate::sample::ThrottleFlags> {
        None
    }

    /// AC line state, for backends with power-source visibility
    fn power_source(&mut self) -> Option<bool> {
        None
    }

    /// Estimated battery minutes remaining while discharging
    fn battery_minutes(&mut self) -> Option<u32> {
        None
    }
}

/// Ordered backend collection with per-metric fallback chains
///
/// Constructed once at engine startup from probed availability. The
/// chain for each metric lists backend indices in priority order; the
/// reconciliation loop iterates it generically instead of hardcoding
/// cascades per call site.
pub struct BackendSet {
    backends: Vec<Box<dyn SensorBackend>>,
    chains: HashMap<MetricId, Vec<usize>>,
}

impl BackendSet {
    /// Build the set and its fallback chains. Unavailable backends are
    /// kept (they may become relevant after `reinitialize`) but sort
    /// after available ones of equal priority.
    pub fn new(backends: Vec<Box<dyn SensorBackend>>) -> Self {
        let mut chains: HashMap<MetricId, Vec<usize>> = HashMap::new();
        for metric in MetricId::ALL {
            let mut ranked: Vec<(u8, bool, usize)> = backends
                .iter()
                .enumerate()
                .filter_map(|(idx, b)| {
                    b.priority(metric).map(|p| (p, !b.is_available(), idx))
                })
                .collect();
            ranked.sort();
            let chain: Vec<usize> = ranked.into_iter().map(|(_, _, idx)| idx).collect();
            if !chain.is_empty() {
                chains.insert(metric, chain);
            }
        }
        Self { backends, chains }
    }

    /// Probe the standard production backends and build the set.
    ///
    /// Backends that fail to open simply report unavailable; nothing
    /// here is fatal (a machine without the driver, without the GPU
    /// API, without the monitoring tool is an expected steady state).
    pub fn detect() -> Self {
        let backends: Vec<Box<dyn SensorBackend>> = vec![
            Box::new(shared_memory::SharedMemoryBackend::open()),
            Box::new(kernel_msr::KernelMsrBackend::open()),
            Box::new(gpu_nvml::GpuNvmlBackend::open()),
            Box::new(wmi_bios::WmiBiosBackend::open()),
            Box::new(perf_counter::PerfCounterBackend::open()),
            Box::new(acpi_thermal::AcpiThermalBackend::open()),
        ];
        Self::new(backends)
    }

    /// Fallback chain for a metric (backend indices, best first)
    pub fn chain(&self, metric: MetricId) -> &[usize] {
        self.chains.get(&metric).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of registered backends
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Backend by index
    pub fn get(&self, idx: usize) -> &dyn SensorBackend {
        self.backends[idx].as_ref()
    }

    /// Mutable backend by index
    pub fn get_mut(&mut self, idx: usize) -> &mut Box<dyn SensorBackend> {
        &mut self.backends[idx]
    }

    /// Kind of the backend at an index
    pub fn kind_of(&self, idx: usize) -> BackendKind {
        self.backends[idx].kind()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted fake backend used by engine and actuation tests

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Per-metric scripted responses plus call accounting
    pub struct ScriptedBackend {
        kind: BackendKind,
        priorities: HashMap<MetricId, u8>,
        scripts: HashMap<MetricId, VecDeque<ReadOutcome>>,
        fallback: HashMap<MetricId, ReadOutcome>,
        pub calls: Arc<AtomicUsize>,
        pub reinits: Arc<AtomicUsize>,
        available: bool,
        min_interval: Duration,
    }

    impl ScriptedBackend {
        pub fn new(kind: BackendKind) -> Self {
            Self {
                kind,
                priorities: HashMap::new(),
                scripts: HashMap::new(),
                fallback: HashMap::new(),
                calls: Arc::new(AtomicUsize::new(0)),
                reinits: Arc::new(AtomicUsize::new(0)),
                available: true,
                min_interval: Duration::ZERO,
            }
        }

        /// Declare support for a metric at a priority with a constant value
        pub fn with_constant(mut self, metric: MetricId, priority: u8, value: f64) -> Self {
            self.priorities.insert(metric, priority);
            self.fallback.insert(metric, Ok(value));
            self
        }

        /// Declare support with a scripted sequence; after the script
        /// drains, the last response repeats
        pub fn with_script(
            mut self,
            metric: MetricId,
            priority: u8,
            script: Vec<ReadOutcome>,
        ) -> Self {
            self.priorities.insert(metric, priority);
            if let Some(last) = script.last() {
                self.fallback.insert(metric, last.clone());
            }
            self.scripts.insert(metric, script.into());
            self
        }

        /// Declare support for a metric that always fails
        pub fn with_failure(mut self, metric: MetricId, priority: u8) -> Self {
            self.priorities.insert(metric, priority);
            self.fallback
                .insert(metric, Err(ReadError::Transient("scripted failure".into())));
            self
        }

        pub fn with_min_interval(mut self, interval: Duration) -> Self {
            self.min_interval = interval;
            self
        }

        pub fn unavailable(mut self) -> Self {
            self.available = false;
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl SensorBackend for ScriptedBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn is_available(&self) -> bool {
            self.available
        }

        fn supported_metrics(&self) -> Vec<MetricId> {
            self.priorities.keys().copied().collect()
        }

        fn priority(&self, metric: MetricId) -> Option<u8> {
            self.priorities.get(&metric).copied()
        }

        fn try_read(&mut self, metric: MetricId) -> ReadOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.available {
                return Err(ReadError::Unavailable("scripted".into()));
            }
            if let Some(queue) = self.scripts.get_mut(&metric) {
                if let Some(outcome) = queue.pop_front() {
                    return outcome;
                }
            }
            self.fallback
                .get(&metric)
                .cloned()
                .unwrap_or(Err(ReadError::NotSupported))
        }

        fn reinitialize(&mut self) -> Result<()> {
            self.reinits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn min_interval(&self) -> Duration {
            self.min_interval
        }
    }
}
