//! Per-model capability lookup
//!
//! Fan and power actuation paths differ across OMEN/Victus board
//! revisions: some firmware accepts percentage fan levels, some only
//! krpm counts, some locks the CPU power limit entirely, and the
//! auto-revert timeout varies. The capability table gates which
//! actuation paths are attempted for the machine at hand.
//!
//! The table is an explicitly constructed value passed by reference to
//! whoever needs it; there is no process-wide singleton.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unit the firmware expects for fan level commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanLevelUnit {
    /// Duty cycle 0-100
    Percent,
    /// Hundreds of RPM (krpm ÷ 10), the older BIOS convention
    Krpm,
}

/// Capability flags for one board revision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCapabilities {
    /// Marketing family for diagnostics
    pub family: String,
    /// Number of controllable fan zones
    pub fan_count: u8,
    /// Unit for fan level commands
    pub fan_level_unit: FanLevelUnit,
    /// Firmware supports the dedicated max-fan flag
    pub supports_max_fan: bool,
    /// Firmware exposes BIOS performance modes
    pub supports_performance_modes: bool,
    /// CPU power limit is writable (not BIOS-locked)
    pub supports_cpu_power_limit: bool,
    /// Seconds between intent re-assertions for this firmware; the
    /// firmware reverts unattended manual settings after ~120 s, and
    /// aggressive revisions need a much shorter leash
    pub reassert_secs: u64,
    /// CPU throttle threshold (TjMax) used by the sentinel band (°C)
    pub tjmax_celsius: f64,
}

impl Default for ModelCapabilities {
    /// Conservative baseline for unknown boards: fans only, no max-fan
    /// flag, no power-limit writes, short re-assert leash
    fn default() -> Self {
        Self {
            family: "Unknown".to_string(),
            fan_count: 2,
            fan_level_unit: FanLevelUnit::Krpm,
            supports_max_fan: false,
            supports_performance_modes: false,
            supports_cpu_power_limit: false,
            reassert_secs: 10,
            tjmax_celsius: 100.0,
        }
    }
}

/// Capability table keyed by BIOS board product id
pub struct CapabilityTable {
    models: HashMap<String, ModelCapabilities>,
    fallback: ModelCapabilities,
}

impl CapabilityTable {
    /// Build the built-in table of known board revisions
    pub fn builtin() -> Self {
        let mut models = HashMap::new();

        models.insert(
            "84DA".to_string(),
            ModelCapabilities {
                family: "OMEN 15 (2019)".to_string(),
                fan_count: 2,
                fan_level_unit: FanLevelUnit::Krpm,
                supports_max_fan: true,
                supports_performance_modes: false,
                supports_cpu_power_limit: true,
                reassert_secs: 90,
                tjmax_celsius: 100.0,
            },
        );
        models.insert(
            "8603".to_string(),
            ModelCapabilities {
                family: "OMEN 15 (2020)".to_string(),
                fan_count: 2,
                fan_level_unit: FanLevelUnit::Krpm,
                supports_max_fan: true,
                supports_performance_modes: true,
                supports_cpu_power_limit: true,
                reassert_secs: 90,
                tjmax_celsius: 100.0,
            },
        );
        models.insert(
            "8746".to_string(),
            ModelCapabilities {
                family: "OMEN 16 (2021)".to_string(),
                fan_count: 2,
                fan_level_unit: FanLevelUnit::Percent,
                supports_max_fan: true,
                supports_performance_modes: true,
                supports_cpu_power_limit: true,
                reassert_secs: 30,
                tjmax_celsius: 100.0,
            },
        );
        models.insert(
            "88D0".to_string(),
            ModelCapabilities {
                family: "Victus 16 (2021)".to_string(),
                fan_count: 2,
                fan_level_unit: FanLevelUnit::Percent,
                supports_max_fan: true,
                supports_performance_modes: true,
                supports_cpu_power_limit: false,
                reassert_secs: 30,
                tjmax_celsius: 95.0,
            },
        );
        models.insert(
            "8A25".to_string(),
            ModelCapabilities {
                family: "OMEN 16 (2022)".to_string(),
                fan_count: 2,
                fan_level_unit: FanLevelUnit::Percent,
                supports_max_fan: true,
                supports_performance_modes: true,
                supports_cpu_power_limit: true,
                // Aggressive firmware: reverts manual fans fast
                reassert_secs: 3,
                tjmax_celsius: 100.0,
            },
        );

        Self {
            models,
            fallback: ModelCapabilities::default(),
        }
    }

    /// Capabilities for a board product id; unknown ids get the
    /// conservative fallback
    pub fn capabilities_for(&self, product_id: &str) -> &ModelCapabilities {
        self.models
            .get(&product_id.to_uppercase())
            .unwrap_or(&self.fallback)
    }

    /// Whether a board id is explicitly known
    pub fn is_known(&self, product_id: &str) -> bool {
        self.models.contains_key(&product_id.to_uppercase())
    }

    /// Number of known board revisions
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Read the board product id from firmware tables.
///
/// Windows exposes it in the registry under the BIOS description key;
/// other platforms have no HP WMI firmware to talk to, so this returns
/// None there.
pub fn detect_product_id() -> Option<String> {
    #[cfg(target_os = "windows")]
    {
        use winreg::enums::HKEY_LOCAL_MACHINE;
        use winreg::RegKey;

        let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
        let bios = hklm
            .open_subkey("HARDWARE\\DESCRIPTION\\System\\BIOS")
            .ok()?;
        let product: String = bios.get_value("BaseBoardProduct").ok()?;
        let trimmed = product.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(trimmed.to_uppercase())
    }

    #[cfg(not(target_os = "windows"))]
    {
        None
    }
}
