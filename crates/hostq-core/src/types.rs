use std::fmt;

use bitflags::bitflags;

use crate::error::{QueueError, Result};

/// Execution status of a [`crate::Command`].
///
/// Statuses are ordered as thresholds: `Queued` is the least advanced, `Complete` the most, and an
/// `Error` counts as having passed every threshold. The raw values match the OpenCL execution
/// status encoding (`CL_COMPLETE == 0`, negative values are errors).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandStatus {
    Queued,
    Submitted,
    Running,
    Complete,
    Error(i32),
}

impl CommandStatus {
    pub const QUEUED_RAW: i32 = 3;
    pub const SUBMITTED_RAW: i32 = 2;
    pub const RUNNING_RAW: i32 = 1;
    pub const COMPLETE_RAW: i32 = 0;

    pub fn as_raw(self) -> i32 {
        match self {
            Self::Queued => Self::QUEUED_RAW,
            Self::Submitted => Self::SUBMITTED_RAW,
            Self::Running => Self::RUNNING_RAW,
            Self::Complete => Self::COMPLETE_RAW,
            Self::Error(code) => code,
        }
    }

    /// Decode a raw execution status. Positive values above `Queued` are rejected; zero and
    /// anything negative are accepted.
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            Self::QUEUED_RAW => Ok(Self::Queued),
            Self::SUBMITTED_RAW => Ok(Self::Submitted),
            Self::RUNNING_RAW => Ok(Self::Running),
            Self::COMPLETE_RAW => Ok(Self::Complete),
            code if code < 0 => Ok(Self::Error(code)),
            _ => Err(QueueError::InvalidValue("unknown execution status")),
        }
    }

    pub fn is_terminal(self) -> bool {
        self.as_raw() <= Self::COMPLETE_RAW
    }

    pub fn is_error(self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Whether this status is at or past `threshold`.
    pub fn has_reached(self, threshold: CommandStatus) -> bool {
        self.as_raw() <= threshold.as_raw()
    }

    pub fn error_code(self) -> Option<i32> {
        match self {
            Self::Error(code) => Some(code),
            _ => None,
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => f.write_str("queued"),
            Self::Submitted => f.write_str("submitted"),
            Self::Running => f.write_str("running"),
            Self::Complete => f.write_str("complete"),
            Self::Error(code) => write!(f, "error({code})"),
        }
    }
}

/// What a command does. The engine only looks at a handful of kinds (barriers, wait-for-events
/// markers and the instantaneous kinds); the rest are opaque to it and interpreted by backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    NdRangeKernel,
    TaskKernel,
    NativeKernel,
    ReadBuffer,
    WriteBuffer,
    CopyBuffer,
    ReadBufferRect,
    WriteBufferRect,
    CopyBufferRect,
    ReadImage,
    WriteImage,
    CopyImage,
    CopyImageToBuffer,
    CopyBufferToImage,
    MapBuffer,
    MapImage,
    UnmapMemObject,
    Marker,
    Barrier,
    WaitForEvents,
    User,
}

impl CommandKind {
    /// Instantaneous commands have nothing to run on a backend and complete as soon as they become
    /// eligible.
    pub fn is_instantaneous(self) -> bool {
        matches!(
            self,
            Self::Marker | Self::User | Self::Barrier | Self::WaitForEvents
        )
    }

    pub fn is_kernel(self) -> bool {
        matches!(
            self,
            Self::NdRangeKernel | Self::TaskKernel | Self::NativeKernel
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::NdRangeKernel => "NDRangeKernel",
            Self::TaskKernel => "TaskKernel",
            Self::NativeKernel => "NativeKernel",
            Self::ReadBuffer => "ReadBuffer",
            Self::WriteBuffer => "WriteBuffer",
            Self::CopyBuffer => "CopyBuffer",
            Self::ReadBufferRect => "ReadBufferRect",
            Self::WriteBufferRect => "WriteBufferRect",
            Self::CopyBufferRect => "CopyBufferRect",
            Self::ReadImage => "ReadImage",
            Self::WriteImage => "WriteImage",
            Self::CopyImage => "CopyImage",
            Self::CopyImageToBuffer => "CopyImageToBuffer",
            Self::CopyBufferToImage => "CopyBufferToImage",
            Self::MapBuffer => "MapBuffer",
            Self::MapImage => "MapImage",
            Self::UnmapMemObject => "UnmapMemObject",
            Self::Marker => "Marker",
            Self::Barrier => "Barrier",
            Self::WaitForEvents => "WaitForEvents",
            Self::User => "User",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QueueProperties: u64 {
        const OUT_OF_ORDER_EXEC_MODE = 1 << 0;
        const PROFILING = 1 << 1;
    }
}

impl QueueProperties {
    /// Decode raw property bits, rejecting unknown flags.
    pub fn from_raw(bits: u64) -> Result<Self> {
        Self::from_bits(bits).ok_or(QueueError::InvalidPropertyValue(bits))
    }

    pub fn is_out_of_order(self) -> bool {
        self.contains(Self::OUT_OF_ORDER_EXEC_MODE)
    }

    pub fn is_profiling(self) -> bool {
        self.contains(Self::PROFILING)
    }
}
