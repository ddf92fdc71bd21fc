//! Error types and result codes for the device host.

use fleet_events::{DeviceState, ErrorCode};
use fleet_id::LinkId;
use thiserror::Error;

/// Typed outcome category returned to callers instead of an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Ok,
    ConfigurationError,
    AlreadyExists,
    NotFound,
    WrongState,
    DeviceFault,
    QualityNotMet,
    ResourceExhausted,
    TransportFailure,
}

impl ResultCode {
    /// Stable reason string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Ok => "ok",
            ResultCode::ConfigurationError => "configuration_error",
            ResultCode::AlreadyExists => "already_exists",
            ResultCode::NotFound => "not_found",
            ResultCode::WrongState => "wrong_state",
            ResultCode::DeviceFault => "device_fault",
            ResultCode::QualityNotMet => "quality_not_met",
            ResultCode::ResourceExhausted => "resource_exhausted",
            ResultCode::TransportFailure => "transport_failure",
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by host operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    /// A required parameter is absent.
    #[error("missing parameter: {0}")]
    MissingParameter(String),

    /// A parameter is present but unusable.
    #[error("invalid parameter {key}: {detail}")]
    InvalidParameter { key: String, detail: String },

    /// No factory is registered for the device type.
    #[error("unsupported device type: {0}")]
    UnsupportedDeviceType(String),

    /// The requested device version is not the one this host implements.
    #[error("version mismatch for {device_type}: supported {supported}, requested {requested}")]
    VersionMismatch {
        device_type: String,
        supported: u32,
        requested: u32,
    },

    /// A device with this name already exists.
    #[error("device already exists: {0}")]
    AlreadyExists(String),

    /// No device with this name exists.
    #[error("device not found: {0}")]
    NotFound(String),

    /// The command is not legal in the device's current state.
    #[error("{device}: cannot {command} while {state}")]
    WrongState {
        device: String,
        state: DeviceState,
        command: &'static str,
    },

    /// Device-specific logic reported an error.
    #[error("{device}: device fault {code}")]
    DeviceFault { device: String, code: ErrorCode },

    /// Too many children failed for the device to meet its quorum.
    #[error("{device}: quality requirement not met")]
    QualityNotMet { device: String },

    /// The capacity allocator declined the request.
    #[error("{device}: capacity exhausted")]
    ResourceExhausted { device: String },

    /// No link with this handle exists.
    #[error("unknown link: {0}")]
    UnknownLink(LinkId),

    /// A transport operation failed.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl HostError {
    /// The typed result code for this error.
    pub fn code(&self) -> ResultCode {
        match self {
            HostError::MissingParameter(_)
            | HostError::InvalidParameter { .. }
            | HostError::UnsupportedDeviceType(_)
            | HostError::VersionMismatch { .. } => ResultCode::ConfigurationError,
            HostError::AlreadyExists(_) => ResultCode::AlreadyExists,
            HostError::NotFound(_) | HostError::UnknownLink(_) => ResultCode::NotFound,
            HostError::WrongState { .. } => ResultCode::WrongState,
            HostError::DeviceFault { .. } => ResultCode::DeviceFault,
            HostError::QualityNotMet { .. } => ResultCode::QualityNotMet,
            HostError::ResourceExhausted { .. } => ResultCode::ResourceExhausted,
            HostError::Transport(_) => ResultCode::TransportFailure,
        }
    }

    /// The wire error code reported alongside a state for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            HostError::DeviceFault { code, .. } => *code,
            HostError::WrongState { .. } => ErrorCode::WRONG_STATE,
            HostError::QualityNotMet { .. } => ErrorCode::QUALITY_NOT_MET,
            HostError::ResourceExhausted { .. } => ErrorCode::RESOURCE_EXHAUSTED,
            _ => ErrorCode::CONFIGURATION,
        }
    }
}

/// Result type for host operations.
pub type HostResult<T> = Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_share_code() {
        let errors = [
            HostError::MissingParameter("version".into()),
            HostError::UnsupportedDeviceType("warp-drive".into()),
            HostError::VersionMismatch {
                device_type: "receiver".into(),
                supported: 2,
                requested: 1,
            },
        ];
        for err in errors {
            assert_eq!(err.code(), ResultCode::ConfigurationError);
        }
    }

    #[test]
    fn test_wrong_state_message() {
        let err = HostError::WrongState {
            device: "rx0".into(),
            state: DeviceState::Idle,
            command: "resume",
        };
        assert_eq!(err.to_string(), "rx0: cannot resume while idle");
        assert_eq!(err.code().as_str(), "wrong_state");
        assert_eq!(err.error_code(), ErrorCode::WRONG_STATE);
    }
}
