use thiserror::Error;

use crate::QueueProperties;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Raw status codes shared with the OpenCL-style binding layer.
///
/// Commands in a terminal failure state carry one of these (or a backend specific negative value) in
/// [`crate::CommandStatus::Error`].
pub mod codes {
    pub const OUT_OF_RESOURCES: i32 = -5;
    pub const PROFILING_INFO_NOT_AVAILABLE: i32 = -7;
    pub const EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST: i32 = -14;
    pub const INVALID_VALUE: i32 = -30;
    pub const INVALID_QUEUE_PROPERTIES: i32 = -35;
    pub const INVALID_COMMAND_QUEUE: i32 = -36;
    pub const INVALID_PROGRAM_EXECUTABLE: i32 = -45;
    pub const INVALID_EVENT_WAIT_LIST: i32 = -57;
    pub const INVALID_EVENT: i32 = -58;
    pub const INVALID_OPERATION: i32 = -59;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("invalid wait list")]
    InvalidWaitList,

    #[error("a command in the wait list is in an error state")]
    DependencyInError,

    #[error("queue properties {0:?} are not supported by the backend")]
    InvalidQueueProperties(QueueProperties),

    #[error("unknown queue property bits {0:#x}")]
    InvalidPropertyValue(u64),

    #[error("invalid value: {0}")]
    InvalidValue(&'static str),

    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    #[error("invalid command: {0}")]
    InvalidCommand(&'static str),

    #[error("invalid command queue handle")]
    InvalidCommandQueue,

    #[error("profiling info not available")]
    ProfilingInfoNotAvailable,

    #[error("backend failed to prepare command (code {code}): {reason}")]
    BackendInitFailed { code: i32, reason: String },

    #[error("backend failed to execute command (code {code})")]
    BackendExecutionFailed { code: i32 },
}

impl QueueError {
    /// Negative status code for this error, suitable for [`crate::CommandStatus::Error`].
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidWaitList => codes::INVALID_EVENT_WAIT_LIST,
            Self::DependencyInError => codes::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST,
            Self::InvalidQueueProperties(_) => codes::INVALID_QUEUE_PROPERTIES,
            Self::InvalidPropertyValue(_) | Self::InvalidValue(_) => codes::INVALID_VALUE,
            Self::InvalidOperation(_) => codes::INVALID_OPERATION,
            Self::InvalidCommand(_) => codes::INVALID_EVENT,
            Self::InvalidCommandQueue => codes::INVALID_COMMAND_QUEUE,
            Self::ProfilingInfoNotAvailable => codes::PROFILING_INFO_NOT_AVAILABLE,
            Self::BackendInitFailed { code, .. } | Self::BackendExecutionFailed { code } => *code,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_stable() {
        assert_eq!(QueueError::DependencyInError.code(), -14);
        assert_eq!(QueueError::InvalidWaitList.code(), -57);
        assert_eq!(
            QueueError::BackendInitFailed {
                code: codes::INVALID_PROGRAM_EXECUTABLE,
                reason: "not built".into(),
            }
            .code(),
            -45
        );
        assert_eq!(QueueError::BackendExecutionFailed { code: -9000 }.code(), -9000);
        assert!(QueueError::InvalidQueueProperties(QueueProperties::PROFILING).code() < 0);
    }
}
