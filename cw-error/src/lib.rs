//! Unified error handling for Coolwatch
//!
//! This crate provides a single error type used across all Coolwatch components.
//! Errors are grouped the way the discovery and polling engine treats them:
//! discovery-time failures are swallowed per candidate, transient I/O errors
//! blank a poll cycle, and fatal I/O errors take a device out of service.

use std::io;
use std::path::PathBuf;

/// Result type alias using CoolwatchError
pub type Result<T> = std::result::Result<T, CoolwatchError>;

/// Unified error type for all Coolwatch operations
#[derive(thiserror::Error, Debug)]
pub enum CoolwatchError {
    // ============================================================================
    // Transport Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to open {target}: {reason}")]
    OpenFailure {
        target: String,
        reason: String,
    },

    #[error("Device disconnected: {0}")]
    Disconnected(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead {
        expected: usize,
        actual: usize,
    },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Device closed: {0}")]
    DeviceClosed(String),

    // ============================================================================
    // Discovery Errors
    // ============================================================================
    #[error("Validation failed for {target}: {reason}")]
    ValidationFailure {
        target: String,
        reason: String,
    },

    #[error("No capability generation accepted for {0}")]
    NegotiationExhausted(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    // ============================================================================
    // Vendor SDK Errors
    // ============================================================================
    #[error("{call} returned status {status}")]
    SdkStatus {
        call: &'static str,
        status: i64,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl CoolwatchError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an open failure for a transport target
    pub fn open_failure(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::OpenFailure {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create a validation failure for a candidate
    pub fn validation(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationFailure {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create an error for a vendor SDK call that returned a non-OK status
    pub fn sdk(call: &'static str, status: impl Into<i64>) -> Self {
        Self::SdkStatus {
            call,
            status: status.into(),
        }
    }

    /// Create a timeout error from a string
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Terminal errors: the device must stop polling and report itself as gone.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Disconnected(_) | Self::DeviceClosed(_))
    }

    /// Non-fatal errors: the current cycle is lost, the next one is retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::ShortRead { .. } | Self::MalformedFrame(_)
        )
    }

    /// Classify an OS I/O error raised while talking to `target`.
    ///
    /// Serial drivers report unplugged devices through a handful of error kinds;
    /// those become [`CoolwatchError::Disconnected`] so callers stop polling.
    pub fn from_io(target: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Self::Timeout(format!("{}: {}", target, err))
            }
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotFound
            | io::ErrorKind::UnexpectedEof => Self::Disconnected(format!("{}: {}", target, err)),
            io::ErrorKind::PermissionDenied => {
                Self::PermissionDenied(format!("{}: {}", target, err))
            }
            _ => match err.raw_os_error() {
                // ENODEV / ENXIO / EIO: the usb-serial node vanished underneath us
                Some(19) | Some(6) | Some(5) => {
                    Self::Disconnected(format!("{}: {}", target, err))
                }
                _ => Self::Io(err),
            },
        }
    }
}

// Allow converting from String to CoolwatchError
impl From<String> for CoolwatchError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to CoolwatchError
impl From<&str> for CoolwatchError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
