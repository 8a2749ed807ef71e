//! Unified error types for the nearby core library.
//!
//! This module provides a unified error type [`DiscoveryError`] that covers all
//! failure modes across the discovery engine. Each layer also has its own
//! specific error type (`AdapterError`, `BackendError`, `ConfigError`) for
//! internal use; they convert into [`DiscoveryError`] at the engine boundary.
//!
//! # Error classes
//!
//! Every error falls into one [`ErrorClass`], which drives how the scan
//! controller reacts:
//!
//! - **Unavailable**: hardware off or missing. Surfaced once (or silently
//!   disabled, for channels configured that way).
//! - **`PermissionDenied`**: surfaced; eligible for auto-retry.
//! - **Transient**: a single tick failed. Surfaced, loop continues.
//! - **`UserCancelled`**: an expected interaction abort. Swallowed.
//! - **Configuration**: invalid settings. Surfaced at load time.

use std::path::PathBuf;

use thiserror::Error;

use crate::adapter::AdapterError;
use crate::backend::BackendError;
use crate::types::Channel;

/// How the engine treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Hardware missing, off, or unsupported.
    Unavailable,
    /// Permission refused, or hardware temporarily busy.
    PermissionDenied,
    /// One operation failed; the next tick may succeed.
    Transient,
    /// The user dismissed a prompt.
    UserCancelled,
    /// Settings are invalid.
    Configuration,
}

/// The unified error type for all discovery operations.
#[derive(Debug, Clone, Error)]
pub enum DiscoveryError {
    // =========================================================================
    // SENSOR ERRORS
    // =========================================================================
    /// The channel's sensor is missing, powered off, or unsupported.
    #[error("{channel} is unavailable: {reason}")]
    Unavailable {
        /// Affected channel.
        channel: Channel,
        /// Human-readable reason.
        reason: String,
    },

    /// The OS refused the permission the channel needs.
    #[error("{channel} permission denied: {reason}. Grant the permission in system settings.")]
    PermissionDenied {
        /// Affected channel.
        channel: Channel,
        /// Human-readable reason.
        reason: String,
    },

    /// The sensor is in use or still initializing.
    #[error("{channel} sensor is busy: {reason}")]
    SensorBusy {
        /// Affected channel.
        channel: Channel,
        /// Human-readable reason.
        reason: String,
    },

    /// The user dismissed a system prompt.
    #[error("{channel} request cancelled by user")]
    UserCancelled {
        /// Affected channel.
        channel: Channel,
    },

    /// A scan tick failed.
    #[error("{channel} scan failed: {reason}")]
    ScanFailed {
        /// Affected channel.
        channel: Channel,
        /// Human-readable reason.
        reason: String,
    },

    // =========================================================================
    // BACKEND ERRORS
    // =========================================================================
    /// The data service could not be reached.
    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    /// The data service refused the request.
    #[error("Backend rejected request: {0}")]
    BackendRejected(String),

    /// A referenced user does not exist.
    #[error("User not found: '{0}'")]
    UserNotFound(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    /// The channel is turned off in configuration.
    #[error("{0} discovery is disabled in configuration")]
    ChannelDisabled(Channel),
}

/// A specialized [`Result`] type for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

impl DiscoveryError {
    /// Wraps an adapter error with the channel it came from.
    #[must_use]
    pub fn from_adapter(channel: Channel, err: AdapterError) -> Self {
        match err {
            AdapterError::Unavailable(reason) => Self::Unavailable { channel, reason },
            AdapterError::PermissionDenied(reason) => Self::PermissionDenied { channel, reason },
            AdapterError::Busy(reason) => Self::SensorBusy { channel, reason },
            AdapterError::Cancelled => Self::UserCancelled { channel },
            AdapterError::Failed(reason) => Self::ScanFailed { channel, reason },
        }
    }

    /// The channel this error belongs to, if it is channel-specific.
    #[must_use]
    pub const fn channel(&self) -> Option<Channel> {
        match self {
            Self::Unavailable { channel, .. }
            | Self::PermissionDenied { channel, .. }
            | Self::SensorBusy { channel, .. }
            | Self::UserCancelled { channel }
            | Self::ScanFailed { channel, .. }
            | Self::ChannelDisabled(channel) => Some(*channel),
            _ => None,
        }
    }

    /// Classifies the error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Unavailable { .. } | Self::ChannelDisabled(_) => ErrorClass::Unavailable,
            Self::PermissionDenied { .. } | Self::SensorBusy { .. } => {
                ErrorClass::PermissionDenied
            }
            Self::UserCancelled { .. } => ErrorClass::UserCancelled,
            Self::ScanFailed { .. }
            | Self::BackendUnreachable(_)
            | Self::BackendRejected(_)
            | Self::UserNotFound(_) => ErrorClass::Transient,
            Self::ConfigNotFound(_)
            | Self::ConfigParseError(_)
            | Self::ConfigValidationError(_) => ErrorClass::Configuration,
        }
    }

    /// Returns `true` if a failed start may be retried automatically.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self.class(), ErrorClass::PermissionDenied)
    }

    /// Returns `true` if a loop-tick failure should be swallowed rather than surfaced.
    ///
    /// Permission and cancellation failures during a tick are expected while
    /// system prompts are on screen.
    #[inline]
    #[must_use]
    pub const fn is_silent_tick_error(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. } | Self::UserCancelled { .. }
        )
    }

    /// Returns `true` if this error came from the data service.
    #[inline]
    #[must_use]
    pub const fn is_backend_error(&self) -> bool {
        matches!(
            self,
            Self::BackendUnreachable(_) | Self::BackendRejected(_) | Self::UserNotFound(_)
        )
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - refused input
            Self::BackendRejected(_) => 400,

            // 403 Forbidden - permission missing
            Self::PermissionDenied { .. } => 403,

            // 404 Not Found
            Self::UserNotFound(_) | Self::ConfigNotFound(_) => 404,

            // 409 Conflict - the channel cannot run in its current setup
            Self::ChannelDisabled(_) | Self::UserCancelled { .. } => 409,

            // 422 Unprocessable Entity - semantic errors
            Self::ConfigParseError(_) | Self::ConfigValidationError(_) => 422,

            // 502 Bad Gateway - upstream failure
            Self::BackendUnreachable(_) => 502,

            // 503 Service Unavailable - sensor hardware issues
            Self::Unavailable { .. } | Self::SensorBusy { .. } | Self::ScanFailed { .. } => 503,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "SENSOR_UNAVAILABLE",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::SensorBusy { .. } => "SENSOR_BUSY",
            Self::UserCancelled { .. } => "USER_CANCELLED",
            Self::ScanFailed { .. } => "SCAN_FAILED",
            Self::BackendUnreachable(_) => "BACKEND_UNREACHABLE",
            Self::BackendRejected(_) => "BACKEND_REJECTED",
            Self::UserNotFound(_) => "USER_NOT_FOUND",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::ChannelDisabled(_) => "CHANNEL_DISABLED",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<BackendError> for DiscoveryError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unreachable(msg) => Self::BackendUnreachable(msg),
            BackendError::Rejected(msg) => Self::BackendRejected(msg),
            BackendError::NotFound(id) => Self::UserNotFound(id),
        }
    }
}

impl From<crate::config::ConfigError> for DiscoveryError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::Load(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::Serialize(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::Write { path, source } => Self::ConfigParseError(format!(
                "Failed to write {}: {}",
                path.display(),
                source
            )),
            ConfigError::Validation { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
