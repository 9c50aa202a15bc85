//! Error types for vulcan

use std::io;
use thiserror::Error;

/// Result type alias for vulcan operations
pub type Result<T> = std::result::Result<T, VulcanError>;

/// Main error type for thermal/fan management operations
#[derive(Error, Debug)]
pub enum VulcanError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// NVML error
    #[cfg(feature = "nvidia")]
    #[error("NVML error: {0}")]
    Nvml(#[from] nvml_wrapper::error::NvmlError),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Unsupported platform
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Feature not available on this hardware/firmware
    #[error("Feature not available: {0}")]
    FeatureNotAvailable(String),

    /// Invalid value
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Firmware or driver actively refused an actuation command.
    /// Not retried: a BIOS-locked setting will not unlock by asking again.
    #[error("Command rejected: {0}")]
    CommandRejected(String),

    /// Command was accepted but hardware did not respond within the
    /// verification window; a capability limitation of this model.
    #[error("Commands ineffective on this model: {0}")]
    CommandIneffective(String),

    /// System error
    #[error("System error: {0}")]
    System(String),

    /// Initialization error
    #[error("Initialization error: {0}")]
    InitializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Use after shutdown/teardown
    #[error("Disposed: {0}")]
    Disposed(String),

    /// Operation cancelled via cancellation token
    #[error("Cancelled")]
    Cancelled,

    /// Other error
    #[error("{0}")]
    Other(String),
}
