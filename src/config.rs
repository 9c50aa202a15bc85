//! Configuration management for vulcan
//!
//! Every empirically tuned threshold in the reconciliation and
//! actuation paths lives here rather than as a hardcoded constant.
//! These values are hardware-model approximations, not derived
//! quantities; the defaults are the ones observed to work across the
//! supported OMEN/Victus range, and a config file can override any of
//! them per machine.

use crate::error::{Result, VulcanError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level vulcan configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VulcanConfig {
    /// Reconciliation engine options
    #[serde(default)]
    pub engine: EngineConfig,
    /// Backend health tracking options
    #[serde(default)]
    pub health: HealthConfig,
    /// Stuck-value detection options
    #[serde(default)]
    pub stuck: StuckConfig,
    /// Power/RPM stabilizer options
    #[serde(default)]
    pub stabilizer: StabilizerConfig,
    /// Fan/voltage actuation options
    #[serde(default)]
    pub actuation: ActuationConfig,
}

/// Reconciliation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cache freshness window in milliseconds; repeated reads inside
    /// the window return the cached sample with no backend calls
    #[serde(default = "default_freshness_ms")]
    pub freshness_ms: u64,
    /// Freshness window while in low-overhead mode (reduces
    /// driver-call frequency at the cost of staler data)
    #[serde(default = "default_low_overhead_freshness_ms")]
    pub low_overhead_freshness_ms: u64,
    /// Time budget for a single backend call in milliseconds. A call
    /// that overruns is recorded as a failure for the cycle. The call
    /// itself is not preempted: native calls cannot be safely
    /// interrupted in-process, so this bounds blame, not latency.
    #[serde(default = "default_call_budget_ms")]
    pub call_budget_ms: u64,
}

/// Backend health tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures before a backend is disabled
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds a disabled backend sits out before one retry probe
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

/// Stuck-value detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckConfig {
    /// Identical reads before a diagnostic is logged
    #[serde(default = "default_log_streak")]
    pub log_streak: u32,
    /// Identical reads before remediation is attempted
    #[serde(default = "default_remediate_streak")]
    pub remediate_streak: u32,
    /// Fruitless remediation episodes before the source is dropped to
    /// forced-fallback mode for that metric
    #[serde(default = "default_max_remediations")]
    pub max_remediations: u32,
    /// Lower bound of the CPU thermal-limit sentinel band (°C)
    #[serde(default = "default_sentinel_low")]
    pub sentinel_band_low: f64,
    /// Upper bound of the CPU thermal-limit sentinel band (°C)
    #[serde(default = "default_sentinel_high")]
    pub sentinel_band_high: f64,
    /// Consecutive in-band reads before the sentinel is distrusted
    #[serde(default = "default_sentinel_streak")]
    pub sentinel_streak: u32,
}

/// Power/RPM stabilizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilizerConfig {
    /// Load percentage at or above which the system counts as active
    #[serde(default = "default_load_activity")]
    pub load_activity_percent: f64,
    /// Temperature at or above which the system counts as active (°C)
    #[serde(default = "default_temp_activity")]
    pub temp_activity_celsius: f64,
    /// Zero readings tolerated before the zero is trusted and the
    /// remembered value forgotten
    #[serde(default = "default_max_zero_streak")]
    pub max_zero_streak: u32,
}

/// Fan/voltage actuation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuationConfig {
    /// Seconds between re-assertions of the current intent while in
    /// Manual or Max mode. Must beat the firmware's auto-revert
    /// timeout (~120 s observed) with margin.
    #[serde(default = "default_reassert_secs")]
    pub reassert_secs: u64,
    /// RPM samples taken when verifying a max-fan command
    #[serde(default = "default_verify_tries")]
    pub verify_tries: u32,
    /// Milliseconds between verification samples
    #[serde(default = "default_verify_interval_ms")]
    pub verify_interval_ms: u64,
    /// RPM at or above which a max-fan command counts as effective
    #[serde(default = "default_verify_rpm")]
    pub verify_rpm_threshold: f64,
    /// RPM rise over baseline that also counts as effective
    #[serde(default = "default_verify_rpm_rise")]
    pub verify_rpm_rise: f64,
    /// Failed verifications before commands are declared ineffective
    /// for this model
    #[serde(default = "default_ineffective_after")]
    pub ineffective_after: u32,
}

// Default value functions

fn default_freshness_ms() -> u64 {
    100
}

fn default_low_overhead_freshness_ms() -> u64 {
    3000
}

fn default_call_budget_ms() -> u64 {
    500
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_log_streak() -> u32 {
    5
}

fn default_remediate_streak() -> u32 {
    10
}

fn default_max_remediations() -> u32 {
    3
}

fn default_sentinel_low() -> f64 {
    95.0
}

fn default_sentinel_high() -> f64 {
    100.0
}

fn default_sentinel_streak() -> u32 {
    3
}

fn default_load_activity() -> f64 {
    2.0
}

fn default_temp_activity() -> f64 {
    38.0
}

fn default_max_zero_streak() -> u32 {
    30
}

fn default_reassert_secs() -> u64 {
    30
}

fn default_verify_tries() -> u32 {
    5
}

fn default_verify_interval_ms() -> u64 {
    1000
}

fn default_verify_rpm() -> f64 {
    3000.0
}

fn default_verify_rpm_rise() -> f64 {
    500.0
}

fn default_ineffective_after() -> u32 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            freshness_ms: default_freshness_ms(),
            low_overhead_freshness_ms: default_low_overhead_freshness_ms(),
            call_budget_ms: default_call_budget_ms(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl Default for StuckConfig {
    fn default() -> Self {
        Self {
            log_streak: default_log_streak(),
            remediate_streak: default_remediate_streak(),
            max_remediations: default_max_remediations(),
            sentinel_band_low: default_sentinel_low(),
            sentinel_band_high: default_sentinel_high(),
            sentinel_streak: default_sentinel_streak(),
        }
    }
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            load_activity_percent: default_load_activity(),
            temp_activity_celsius: default_temp_activity(),
            max_zero_streak: default_max_zero_streak(),
        }
    }
}

impl Default for ActuationConfig {
    fn default() -> Self {
        Self {
            reassert_secs: default_reassert_secs(),
            verify_tries: default_verify_tries(),
            verify_interval_ms: default_verify_interval_ms(),
            verify_rpm_threshold: default_verify_rpm(),
            verify_rpm_rise: default_verify_rpm_rise(),
            ineffective_after: default_ineffective_after(),
        }
    }
}

impl VulcanConfig {
    /// Get the default configuration file path
    ///
    /// Returns `%APPDATA%\vulcan` on Windows, `~/.config/vulcan`
    /// elsewhere.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = if cfg!(windows) {
            std::env::var("APPDATA")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
        } else {
            std::env::var("HOME")
                .map(|home| PathBuf::from(home).join(".config"))
                .unwrap_or_else(|_| PathBuf::from(".config"))
        };

        Ok(config_dir.join("vulcan"))
    }

    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_dir = Self::default_path()?;
        let config_file = config_dir.join("config.toml");

        if !config_file.exists() {
            return Ok(Self::default());
        }

        Self::load_from(&config_file)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: VulcanConfig = toml::from_str(&contents)
            .map_err(|e| VulcanError::Parse(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        let config_dir = Self::default_path()?;
        std::fs::create_dir_all(&config_dir)?;
        self.save_to(&config_dir.join("config.toml"))
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| VulcanError::Other(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VulcanConfig::default();
        assert_eq!(config.engine.freshness_ms, 100);
        assert_eq!(config.engine.low_overhead_freshness_ms, 3000);
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.health.cooldown_secs, 60);
        assert_eq!(config.stuck.log_streak, 5);
        assert_eq!(config.stuck.remediate_streak, 10);
        assert_eq!(config.stabilizer.max_zero_streak, 30);
        assert_eq!(config.actuation.verify_rpm_threshold, 3000.0);
    }

    #[test]
    fn test_config_serialization() {
        let config = VulcanConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: VulcanConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.engine.freshness_ms, deserialized.engine.freshness_ms);
        assert_eq!(
            config.actuation.reassert_secs,
            deserialized.actuation.reassert_secs
        );
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: VulcanConfig = toml::from_str(
            r#"
            [health]
            failure_threshold = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.health.failure_threshold, 5);
        assert_eq!(config.health.cooldown_secs, 60);
        assert_eq!(config.stuck.remediate_streak, 10);
    }

    #[test]
    fn test_sentinel_band_ordering() {
        let config = VulcanConfig::default();
        assert!(config.stuck.sentinel_band_low < config.stuck.sentinel_band_high);
    }
}
