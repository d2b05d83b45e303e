use std::time::Duration;
use thiserror::Error;

/// Why a connection could not be established or kept.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("connection failed: {0}")]
    Unknown(String),

    #[error("already connecting to {0}")]
    AlreadyConnecting(String),

    #[error("no active connection")]
    NotConnected,

    #[error("could not reconnect after {0} attempts")]
    ReconnectExhausted(u32),
}

impl ConnectionError {
    /// Classify a raw transport error message by known substrings.
    pub fn from_link_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["timed out", "timeout", "time out"]) {
            Self::Timeout(Duration::ZERO)
        } else if has(&["permission", "access denied", "not permitted", "unauthorized"]) {
            Self::PermissionDenied(message.to_string())
        } else if has(&["not found", "no such", "no device", "unavailable device", "host is down"]) {
            Self::DeviceNotFound(message.to_string())
        } else if has(&["adapter", "bluetooth is off", "bluetooth off", "powered off", "not enabled"]) {
            Self::AdapterUnavailable(message.to_string())
        } else {
            Self::Unknown(message.to_string())
        }
    }

    /// Stable identifier surfaced in status events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::PermissionDenied(_) => "permission_denied",
            Self::DeviceNotFound(_) => "device_not_found",
            Self::AdapterUnavailable(_) => "adapter_error",
            Self::Unknown(_) => "unknown",
            Self::AlreadyConnecting(_) => "already_connecting",
            Self::NotConnected => "not_connected",
            Self::ReconnectExhausted(_) => "reconnect_failed",
        }
    }

    pub fn remediation(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "Move closer to the scale and make sure it is switched on.",
            Self::PermissionDenied(_) => "Grant Bluetooth permission to the app and try again.",
            Self::DeviceNotFound(_) => "Check that the scale is paired and in range.",
            Self::AdapterUnavailable(_) => "Turn Bluetooth on and try again.",
            Self::Unknown(_) => "Restart the scale and try again.",
            Self::AlreadyConnecting(_) => "Wait for the current connection attempt to finish.",
            Self::NotConnected => "Connect to a scale first.",
            Self::ReconnectExhausted(_) => "Could not reconnect. Select the scale and connect again.",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamingError {
    #[error("link lost: {0}")]
    LinkLost(String),

    #[error("read failed: {0}")]
    ReadFailure(String),
}

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum LockError {
    #[error("no valid weight available to lock")]
    NoValidWeight,

    #[error("weight is locked while a submission is in progress")]
    LockedDuringSubmission,

    #[error("weight is not locked")]
    NotLocked,
}
