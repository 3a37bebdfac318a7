//! # MFI Protocol Constants
//!
//! Firmware states, doorbell bits, frame commands and status codes of the
//! MegaRAID firmware interface.

// =============================================================================
// Firmware state (status register bits 31:28)
// =============================================================================

/// Mask of the state field in the firmware status word
pub const MFI_STATE_MASK: u32 = 0xF000_0000;

/// Firmware state as reported by the status register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FwState {
    /// No state reported yet
    Undefined,
    /// Boot block initialization
    BbInit,
    /// Firmware initialization
    FwInit,
    /// Waiting for the host handshake
    WaitHandshake,
    /// Second firmware initialization stage
    FwInit2,
    /// Scanning devices
    DeviceScan,
    /// A boot message is waiting for acknowledgement
    BootMessagePending,
    /// Flushing cache
    FlushCache,
    /// Ready for INIT
    Ready,
    /// Running, INIT done
    Operational,
    /// Firmware fault
    Fault,
    /// Unrecognized state code
    Unknown(u8),
}

impl FwState {
    /// Decode the state from a raw status word
    pub const fn from_status(status: u32) -> Self {
        match (status & MFI_STATE_MASK) >> 28 {
            0x0 => FwState::Undefined,
            0x1 => FwState::BbInit,
            0x4 => FwState::FwInit,
            0x6 => FwState::WaitHandshake,
            0x7 => FwState::FwInit2,
            0x8 => FwState::DeviceScan,
            0x9 => FwState::BootMessagePending,
            0xA => FwState::FlushCache,
            0xB => FwState::Ready,
            0xC => FwState::Operational,
            0xF => FwState::Fault,
            other => FwState::Unknown(other as u8),
        }
    }

    /// Encode the state into the high nibble of a status word
    pub const fn to_status(self) -> u32 {
        let code: u32 = match self {
            FwState::Undefined => 0x0,
            FwState::BbInit => 0x1,
            FwState::FwInit => 0x4,
            FwState::WaitHandshake => 0x6,
            FwState::FwInit2 => 0x7,
            FwState::DeviceScan => 0x8,
            FwState::BootMessagePending => 0x9,
            FwState::FlushCache => 0xA,
            FwState::Ready => 0xB,
            FwState::Operational => 0xC,
            FwState::Fault => 0xF,
            FwState::Unknown(code) => code as u32 & 0xF,
        };
        code << 28
    }
}

/// Firmware-reported maximum outstanding commands (status bits 15:0)
pub const fn status_max_cmds(status: u32) -> u16 {
    (status & 0xFFFF) as u16
}

/// Firmware-reported maximum SGEs per command (status bits 23:16)
pub const fn status_max_sge(status: u32) -> u16 {
    ((status & 0x00FF_0000) >> 16) as u16
}

// =============================================================================
// Inbound doorbell
// =============================================================================

/// Abort all outstanding commands
pub const MFI_INIT_ABORT: u32 = 0x0000_0001;
/// Move firmware to READY
pub const MFI_INIT_READY: u32 = 0x0000_0002;
/// Select MFI mode
pub const MFI_INIT_MFIMODE: u32 = 0x0000_0004;
/// Clear the handshake
pub const MFI_INIT_CLEAR_HANDSHAKE: u32 = 0x0000_0008;
/// Acknowledge a boot message / hotplug
pub const MFI_INIT_HOTPLUG: u32 = 0x0000_0010;
/// Stop the adapter
pub const MFI_STOP_ADP: u32 = 0x0000_0020;
/// Reset the adapter (xscale family)
pub const MFI_ADP_RESET: u32 = 0x0000_0040;
/// Doorbell value forcing an operational firmware back to READY
pub const MFI_RESET_FLAGS: u32 = MFI_INIT_READY | MFI_INIT_MFIMODE | MFI_INIT_ABORT;

// =============================================================================
// Frame commands and flags
// =============================================================================

/// Queue initialization
pub const MFI_CMD_INIT: u8 = 0x00;
/// Logical drive read
pub const MFI_CMD_LD_READ: u8 = 0x01;
/// Logical drive write
pub const MFI_CMD_LD_WRITE: u8 = 0x02;
/// Logical drive SCSI pass-through
pub const MFI_CMD_LD_SCSI_IO: u8 = 0x03;
/// Physical drive SCSI pass-through
pub const MFI_CMD_PD_SCSI_IO: u8 = 0x04;
/// Direct controller command
pub const MFI_CMD_DCMD: u8 = 0x05;
/// Abort a previously issued frame
pub const MFI_CMD_ABORT: u8 = 0x06;
/// SMP pass-through
pub const MFI_CMD_SMP: u8 = 0x07;
/// STP pass-through
pub const MFI_CMD_STP: u8 = 0x08;

/// Status byte preset for polled frames; firmware overwrites it
pub const MFI_STAT_INVALID_STATUS: u8 = 0xFF;

// =============================================================================
// Completion status codes
// =============================================================================

/// Success
pub const MFI_STAT_OK: u8 = 0x00;
/// Unknown frame command
pub const MFI_STAT_INVALID_CMD: u8 = 0x01;
/// Unknown DCMD opcode
pub const MFI_STAT_INVALID_DCMD: u8 = 0x02;
/// Bad parameter
pub const MFI_STAT_INVALID_PARAMETER: u8 = 0x03;
/// Event sequence number out of range
pub const MFI_STAT_INVALID_SEQUENCE_NUMBER: u8 = 0x04;
/// The target frame cannot be aborted
pub const MFI_STAT_ABORT_NOT_POSSIBLE: u8 = 0x05;
/// Device not present
pub const MFI_STAT_DEVICE_NOT_FOUND: u8 = 0x0C;
/// Logical drive initialization in progress
pub const MFI_STAT_LD_INIT_IN_PROGRESS: u8 = 0x18;
/// Object not found (abort target already completed)
pub const MFI_STAT_NOT_FOUND: u8 = 0x23;
/// SCSI command finished with an error status
pub const MFI_STAT_SCSI_DONE_WITH_ERROR: u8 = 0x2D;
/// SCSI command failed
pub const MFI_STAT_SCSI_IO_FAILED: u8 = 0x2E;
/// Logical drive offline
pub const MFI_STAT_LD_OFFLINE: u8 = 0x33;

/// SAM CHECK CONDITION
pub const SAM_STAT_CHECK_CONDITION: u8 = 0x02;

// =============================================================================
// DCMD opcodes
// =============================================================================

/// Controller information
pub const MR_DCMD_CTRL_GET_INFO: u32 = 0x0101_0000;
/// Event log sequence information
pub const MR_DCMD_CTRL_EVENT_GET_INFO: u32 = 0x0104_0100;
/// Wait for the next event
pub const MR_DCMD_CTRL_EVENT_WAIT: u32 = 0x0104_0500;
/// Shut the controller down
pub const MR_DCMD_CTRL_SHUTDOWN: u32 = 0x0105_0000;
/// Flush caches
pub const MR_DCMD_CTRL_CACHE_FLUSH: u32 = 0x0110_1000;
/// Logical drive list
pub const MR_DCMD_LD_GET_LIST: u32 = 0x0301_0000;

/// Flush the controller cache (CACHE_FLUSH mailbox byte 0)
pub const MR_FLUSH_CTRL_CACHE: u8 = 0x01;
/// Flush the disk caches (CACHE_FLUSH mailbox byte 0)
pub const MR_FLUSH_DISK_CACHE: u8 = 0x02;

/// Consumer index value marking an xscale reset in progress
pub const MEGASAS_ADPRESET_INPROG_SIGN: u32 = 0xDEAD_DEAD;
