//! # Engine Errors
//!
//! One error type for every fallible engine operation. The variants follow
//! the failure classes of the controller: transient back-pressure, protocol
//! errors, firmware faults and fatal recovery failures.

use core::fmt;
use megasas_hal::HalError;

/// Result type for engine operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Engine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// Admission refused (recovery running or throttle engaged); retry later
    QueueBusy,
    /// No free command in the pool; retry later
    NoCommand,
    /// Adapter is in CriticalError or detached
    Offline,
    /// Request cannot be encoded (bad CDB, SGL too long, missing buffer)
    InvalidRequest,
    /// Firmware did not reach READY
    NotReady {
        /// Last raw firmware status word observed
        state: u32,
    },
    /// Firmware reported FAULT where no recovery was possible
    FirmwareFault,
    /// INIT handshake was rejected
    InitFailed {
        /// MFI status returned for the INIT frame
        status: u8,
    },
    /// An internal command completed with a non-OK MFI status
    CommandFailed {
        /// MFI status byte
        status: u8,
    },
    /// A bounded wait expired
    Timeout,
    /// An abort could not be completed
    AbortFailed,
    /// The chip reset sequence did not complete
    ResetFailed,
    /// Firmware returned a context outside the command pool
    ProtocolViolation {
        /// The offending context value
        context: u32,
    },
    /// No adapter with that id is registered
    NotFound,
    /// An adapter with that id is already registered
    AlreadyExists,
    /// Host abstraction layer failure
    Hal(HalError),
}

impl CoreError {
    /// Whether the caller should simply retry later
    ///
    /// Transient errors are expected back-pressure and are never logged
    /// above debug level.
    pub const fn is_transient(&self) -> bool {
        matches!(self, CoreError::QueueBusy | CoreError::NoCommand)
    }

    /// Whether the error takes the adapter offline
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::Offline | CoreError::ResetFailed | CoreError::ProtocolViolation { .. }
        )
    }

    /// Short static description
    pub const fn as_str(&self) -> &'static str {
        match self {
            CoreError::QueueBusy => "queue busy",
            CoreError::NoCommand => "no command available",
            CoreError::Offline => "adapter offline",
            CoreError::InvalidRequest => "invalid request",
            CoreError::NotReady { .. } => "firmware not ready",
            CoreError::FirmwareFault => "firmware fault",
            CoreError::InitFailed { .. } => "INIT handshake failed",
            CoreError::CommandFailed { .. } => "command failed",
            CoreError::Timeout => "timed out",
            CoreError::AbortFailed => "abort failed",
            CoreError::ResetFailed => "adapter reset failed",
            CoreError::ProtocolViolation { .. } => "firmware protocol violation",
            CoreError::NotFound => "no such adapter",
            CoreError::AlreadyExists => "adapter already registered",
            CoreError::Hal(_) => "host abstraction error",
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::NotReady { state } => write!(f, "{} (status {:#010x})", self.as_str(), state),
            CoreError::InitFailed { status } | CoreError::CommandFailed { status } => {
                write!(f, "{} (mfi status {:#04x})", self.as_str(), status)
            }
            CoreError::ProtocolViolation { context } => {
                write!(f, "{} (context {:#x})", self.as_str(), context)
            }
            CoreError::Hal(e) => write!(f, "{}: {}", self.as_str(), e),
            _ => f.write_str(self.as_str()),
        }
    }
}

impl From<HalError> for CoreError {
    fn from(e: HalError) -> Self {
        CoreError::Hal(e)
    }
}
