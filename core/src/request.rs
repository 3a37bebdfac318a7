//! # Requests and Results
//!
//! What callers hand to the engine and what they get back. Every submission
//! returns a [`Ticket`]: a single-use, future-style handle that resolves to
//! the command's result once the completion path (or the recovery engine)
//! finishes with it. Nothing about the caller travels through firmware; the
//! context tag is the only link between a reply and its ticket.

use crate::error::{CoreError, CoreResult};
use crate::frame::{DataDirection, SgElement, DCMD_MBOX_SIZE, MAX_CDB_LEN};
use alloc::sync::Arc;
use alloc::vec::Vec;
use arrayvec::ArrayVec;
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use megasas_hal::{DmaRegion, IrqMutex};

/// Sense bytes returned to the midlayer
pub const SCSI_SENSE_BUFFERSIZE: usize = 96;

/// Fixed-capacity CDB
pub type Cdb = ArrayVec<u8, MAX_CDB_LEN>;

/// Returned sense data
pub type SenseData = ArrayVec<u8, SCSI_SENSE_BUFFERSIZE>;

// =============================================================================
// I/O requests
// =============================================================================

/// A SCSI command from the midlayer collaborator
#[derive(Debug, Clone)]
pub struct IoRequest {
    /// Target (logical drive or physical device index)
    pub target: u8,
    /// Logical unit
    pub lun: u8,
    /// Command descriptor block
    pub cdb: Cdb,
    /// Direction of the data phase
    pub direction: DataDirection,
    /// DMA-mapped data segments
    pub sgl: Vec<SgElement>,
    /// Total transfer length in bytes
    pub data_len: u32,
    /// Whether the target is a logical drive (enables the LD read/write fast path)
    pub logical: bool,
    /// How many times the midlayer has already retried this command
    pub retries: u32,
    /// Pass-through timeout in seconds (0 = firmware default)
    pub timeout_secs: u16,
}

impl IoRequest {
    /// Create a request without a data phase
    pub fn new(target: u8, lun: u8, cdb: &[u8]) -> CoreResult<Self> {
        if cdb.is_empty() {
            return Err(CoreError::InvalidRequest);
        }
        let cdb = Cdb::try_from(cdb).map_err(|_| CoreError::InvalidRequest)?;
        Ok(Self {
            target,
            lun,
            cdb,
            direction: DataDirection::None,
            sgl: Vec::new(),
            data_len: 0,
            logical: true,
            retries: 0,
            timeout_secs: 0,
        })
    }

    /// Attach a data phase
    pub fn with_data(mut self, direction: DataDirection, sgl: Vec<SgElement>) -> Self {
        self.data_len = sgl.iter().map(|s| s.len).sum();
        self.direction = direction;
        self.sgl = sgl;
        self
    }

    /// Attach a single DMA buffer as the data phase
    pub fn with_buffer(self, direction: DataDirection, buffer: &DmaRegion) -> Self {
        let sge = SgElement::new(buffer.phys(), buffer.len() as u32);
        self.with_data(direction, alloc::vec![sge])
    }

    /// Address a physical device instead of a logical drive
    pub fn physical(mut self) -> Self {
        self.logical = false;
        self
    }

    /// Record midlayer retries
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Host-level outcome of a command, in midlayer terms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    /// Delivered to the device; see the SCSI status
    Ok,
    /// Generic failure
    Error,
    /// Device gone or adapter offline
    NoConnect,
    /// Terminated by a reset or abort
    Reset,
}

/// Result of an I/O request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoResult {
    /// Host status
    pub host: HostStatus,
    /// SCSI status byte
    pub scsi_status: u8,
    /// Raw MFI completion status
    pub mfi_status: u8,
    /// Sense data (CHECK CONDITION only)
    pub sense: SenseData,
}

impl IoResult {
    /// Result carrying only a host status
    pub fn host(host: HostStatus) -> Self {
        Self {
            host,
            scsi_status: 0,
            mfi_status: 0,
            sense: SenseData::new(),
        }
    }

    /// Whether the command succeeded outright
    pub fn is_ok(&self) -> bool {
        self.host == HostStatus::Ok && self.scsi_status == 0
    }
}

// =============================================================================
// Management requests
// =============================================================================

/// A management action from the IOCTL collaborator
///
/// Opcodes and payloads are passed through uninterpreted.
#[derive(Debug, Clone)]
pub enum ManagementRequest {
    /// Direct controller command
    Dcmd {
        /// DCMD opcode
        opcode: u32,
        /// Mailbox bytes
        mbox: [u8; DCMD_MBOX_SIZE],
        /// Direction of the payload
        direction: DataDirection,
        /// Payload buffer
        buffer: Option<DmaRegion>,
    },
    /// SCSI pass-through
    Passthrough {
        /// Target
        target: u8,
        /// Logical unit
        lun: u8,
        /// Logical drive or physical device
        logical: bool,
        /// Command descriptor block
        cdb: Cdb,
        /// Direction of the payload
        direction: DataDirection,
        /// Payload buffer
        buffer: Option<DmaRegion>,
    },
}

impl ManagementRequest {
    /// DCMD without payload
    pub fn dcmd(opcode: u32, mbox: [u8; DCMD_MBOX_SIZE]) -> Self {
        ManagementRequest::Dcmd {
            opcode,
            mbox,
            direction: DataDirection::None,
            buffer: None,
        }
    }

    /// DCMD reading into `buffer`
    pub fn dcmd_read(opcode: u32, mbox: [u8; DCMD_MBOX_SIZE], buffer: DmaRegion) -> Self {
        ManagementRequest::Dcmd {
            opcode,
            mbox,
            direction: DataDirection::Read,
            buffer: Some(buffer),
        }
    }

    /// Payload buffer, if any
    pub fn buffer(&self) -> Option<&DmaRegion> {
        match self {
            ManagementRequest::Dcmd { buffer, .. } | ManagementRequest::Passthrough { buffer, .. } => {
                buffer.as_ref()
            }
        }
    }
}

/// Result of a management action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementResult {
    /// MFI completion status
    pub status: u8,
    /// SCSI status (pass-through only)
    pub scsi_status: u8,
    /// Sense data (pass-through CHECK CONDITION only)
    pub sense: SenseData,
}

impl ManagementResult {
    /// Whether firmware reported success
    pub fn is_ok(&self) -> bool {
        self.status == crate::mfi::MFI_STAT_OK
    }

    /// Convert a non-OK status into an error
    pub fn into_result(self) -> CoreResult<Self> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(CoreError::CommandFailed { status: self.status })
        }
    }
}

// =============================================================================
// Completion slots and tickets
// =============================================================================

/// Write-once result slot shared between a command and its ticket
pub struct Completion<T> {
    value: IrqMutex<Option<T>>,
    waker: IrqMutex<Option<Waker>>,
}

impl<T> Completion<T> {
    /// Create an empty slot
    pub fn new() -> Self {
        Self {
            value: IrqMutex::new(None),
            waker: IrqMutex::new(None),
        }
    }

    /// Store the result and wake the waiter
    pub(crate) fn complete(&self, value: T) {
        *self.value.lock() = Some(value);
        let waker = self.waker.lock().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn take(&self) -> Option<T> {
        self.value.lock().take()
    }

    fn is_complete(&self) -> bool {
        self.value.lock().is_some()
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Handle to the eventual result of one submitted command
///
/// Poll it as a future, or check it with [`Ticket::try_take`] from a
/// polling loop.
pub struct Ticket<T> {
    slot: Arc<Completion<T>>,
    context: u32,
    generation: u32,
}

impl<T> Ticket<T> {
    pub(crate) fn new(slot: Arc<Completion<T>>, context: u32, generation: u32) -> Self {
        Self { slot, context, generation }
    }

    /// Context tag of the command carrying this request
    pub fn context(&self) -> u32 {
        self.context
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    /// Whether the result is available
    pub fn is_complete(&self) -> bool {
        self.slot.is_complete()
    }

    /// Take the result if it is available
    pub fn try_take(&mut self) -> Option<T> {
        self.slot.take()
    }
}

impl<T> fmt::Debug for Ticket<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("context", &self.context)
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl<T> Future for Ticket<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        if let Some(value) = self.slot.take() {
            return Poll::Ready(value);
        }
        *self.slot.waker.lock() = Some(cx.waker().clone());
        // Re-check: the completion may have landed before the waker did.
        match self.slot.take() {
            Some(value) => Poll::Ready(value),
            None => Poll::Pending,
        }
    }
}
