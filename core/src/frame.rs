//! # MFI Frame Codec
//!
//! Encoders and decoders for the frames the engine hands to firmware. A
//! command owns `frame_units` contiguous 64-byte frames; the first holds the
//! header and body, and SGEs that do not fit spill into the following frames.
//!
//! ```text
//!  0      4      8          12     16     18      20           24
//!  +------+------+----------+------+------+-------+------------+----------
//!  | cmd  | tgt  | context  | pad  |flags |timeout| xfer len   | body ...
//!  | sl st| lun..|          |      |      |       | (lba count)|
//!  +------+------+----------+------+------+-------+------------+----------
//! ```
//!
//! All fields are little-endian.

use crate::mfi::*;
use bitflags::bitflags;
use megasas_hal::{DmaRegion, HalResult, PhysAddr};
use static_assertions::const_assert;

/// Size of one MFI frame unit
pub const MFI_FRAME_SIZE: usize = 64;

/// Largest frame count firmware accepts for one command
pub const MAX_FRAME_COUNT: u8 = 8;

// =============================================================================
// Layout
// =============================================================================

/// Header field offsets shared by every frame kind
pub mod hdr {
    /// Frame command
    pub const CMD: usize = 0;
    /// Sense length
    pub const SENSE_LEN: usize = 1;
    /// MFI completion status
    pub const CMD_STATUS: usize = 2;
    /// SCSI status
    pub const SCSI_STATUS: usize = 3;
    /// Target id
    pub const TARGET: usize = 4;
    /// LUN (pass-through) or access byte (LD I/O)
    pub const LUN: usize = 5;
    /// CDB length
    pub const CDB_LEN: usize = 6;
    /// Number of SGEs
    pub const SGE_COUNT: usize = 7;
    /// Context echoed in the reply queue
    pub const CONTEXT: usize = 8;
    /// Flags
    pub const FLAGS: usize = 16;
    /// Timeout
    pub const TIMEOUT: usize = 18;
    /// Data transfer length (block count for LD I/O)
    pub const DATA_XFER_LEN: usize = 20;
}

/// Sense address in LD I/O and pass-through frames
pub const SENSE_ADDR_OFFSET: usize = 24;
/// Start LBA in LD I/O frames
pub const LDIO_LBA_OFFSET: usize = 32;
/// SGL in LD I/O frames
pub const LDIO_SGL_OFFSET: usize = 40;
/// CDB in pass-through frames
pub const PTHRU_CDB_OFFSET: usize = 32;
/// SGL in pass-through frames
pub const PTHRU_SGL_OFFSET: usize = 48;
/// Opcode in DCMD frames
pub const DCMD_OPCODE_OFFSET: usize = 24;
/// Mailbox in DCMD frames
pub const DCMD_MBOX_OFFSET: usize = 28;
/// SGL in DCMD frames
pub const DCMD_SGL_OFFSET: usize = 40;
/// Target context in ABORT frames
pub const ABORT_CONTEXT_OFFSET: usize = 24;
/// Target frame address in ABORT frames
pub const ABORT_ADDR_OFFSET: usize = 32;
/// Queue-info address in INIT frames
pub const INIT_QINFO_OFFSET: usize = 24;
/// Driver version address in INIT frames
pub const INIT_DRIVER_VER_OFFSET: usize = 40;
/// The queue-info block is placed in the second frame unit of the INIT command
pub const INIT_QINFO_BLOCK: usize = MFI_FRAME_SIZE;
/// Size of the queue-info block
pub const QUEUE_INFO_SIZE: usize = 32;
/// DCMD mailbox size
pub const DCMD_MBOX_SIZE: usize = 12;
/// Longest CDB a pass-through frame carries
pub const MAX_CDB_LEN: usize = 16;

const_assert!(LDIO_SGL_OFFSET + 3 * 8 == MFI_FRAME_SIZE);
const_assert!(PTHRU_SGL_OFFSET + 2 * 8 == MFI_FRAME_SIZE);
const_assert!(PTHRU_CDB_OFFSET + MAX_CDB_LEN == PTHRU_SGL_OFFSET);
const_assert!(DCMD_MBOX_OFFSET + DCMD_MBOX_SIZE == DCMD_SGL_OFFSET);
const_assert!(INIT_QINFO_BLOCK + QUEUE_INFO_SIZE <= 2 * MFI_FRAME_SIZE);

bitflags! {
    /// Frame header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u16 {
        /// Do not post the completion to the reply queue (polled frames)
        const DONT_POST = 0x0001;
        /// SGL entries carry 64-bit addresses
        const SGL64 = 0x0002;
        /// Sense address is 64-bit
        const SENSE64 = 0x0004;
        /// Host to device
        const DIR_WRITE = 0x0008;
        /// Device to host
        const DIR_READ = 0x0010;
        /// IEEE SGL format
        const IEEE = 0x0020;
    }
}

// =============================================================================
// Scatter-gather
// =============================================================================

/// One DMA-mapped segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgElement {
    /// Bus address
    pub addr: PhysAddr,
    /// Length in bytes
    pub len: u32,
}

impl SgElement {
    /// Create a segment
    pub const fn new(addr: PhysAddr, len: u32) -> Self {
        Self { addr, len }
    }
}

/// Data direction of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    /// No data phase
    None,
    /// Device to host
    Read,
    /// Host to device
    Write,
}

impl DataDirection {
    /// Direction flags for the frame header
    pub const fn flags(self) -> FrameFlags {
        match self {
            DataDirection::None => FrameFlags::empty(),
            DataDirection::Read => FrameFlags::DIR_READ,
            DataDirection::Write => FrameFlags::DIR_WRITE,
        }
    }
}

/// Frame body shape, which decides how many SGEs fit in the main frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// LD read/write and DCMD frames (SGL at offset 40)
    Io,
    /// SCSI pass-through frames (SGL at offset 48)
    Passthru,
}

/// SGE encoding, selected by chip family and DMA addressing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SglFormat {
    /// 32-bit address + length
    Sge32,
    /// 64-bit address + length
    Sge64,
    /// 64-bit address + length + flags (skinny controllers)
    Ieee,
}

impl SglFormat {
    /// Encoded size of one SGE
    pub const fn sge_size(self) -> usize {
        match self {
            SglFormat::Sge32 => 8,
            SglFormat::Sge64 => 12,
            SglFormat::Ieee => 16,
        }
    }

    /// Header flags announcing this format
    pub const fn flags(self) -> FrameFlags {
        match self {
            SglFormat::Sge32 => FrameFlags::empty(),
            SglFormat::Sge64 => FrameFlags::SGL64,
            SglFormat::Ieee => FrameFlags::SGL64.union(FrameFlags::IEEE),
        }
    }

    /// SGEs the main frame holds before spilling
    pub const fn main_frame_capacity(self, kind: FrameKind) -> usize {
        match (kind, self) {
            (FrameKind::Io, SglFormat::Sge32) => 3,
            (FrameKind::Io, SglFormat::Sge64) => 2,
            (FrameKind::Passthru, SglFormat::Sge32) => 2,
            (_, _) => 1,
        }
    }
}

/// Number of 64-byte frame units a request with `sge_count` SGEs occupies
///
/// SGEs beyond the main frame capacity are rounded up to whole frames. The
/// result is capped at [`MAX_FRAME_COUNT`].
pub fn frame_count(format: SglFormat, sge_count: usize, kind: FrameKind) -> u8 {
    let spill = sge_count.saturating_sub(format.main_frame_capacity(kind));
    let extra = (spill * format.sge_size()).div_ceil(MFI_FRAME_SIZE);
    (extra + 1).min(MAX_FRAME_COUNT as usize) as u8
}

/// Most SGEs that fit in `frame_bytes` of frame memory for a body of `kind`
pub fn sgl_capacity(format: SglFormat, frame_bytes: usize, kind: FrameKind) -> usize {
    let start = match kind {
        FrameKind::Io => LDIO_SGL_OFFSET,
        FrameKind::Passthru => PTHRU_SGL_OFFSET,
    };
    frame_bytes.saturating_sub(start) / format.sge_size()
}

/// Write an SGL starting at `offset`, returning the SGE count
pub fn write_sgl(
    frame: &DmaRegion,
    offset: usize,
    format: SglFormat,
    sgl: &[SgElement],
) -> HalResult<u8> {
    let mut at = offset;
    for sge in sgl {
        match format {
            SglFormat::Sge32 => {
                frame.write_u32(at, sge.addr.low())?;
                frame.write_u32(at + 4, sge.len)?;
            }
            SglFormat::Sge64 => {
                frame.write_u64(at, sge.addr.as_u64())?;
                frame.write_u32(at + 8, sge.len)?;
            }
            SglFormat::Ieee => {
                frame.write_u64(at, sge.addr.as_u64())?;
                frame.write_u32(at + 8, sge.len)?;
                frame.write_u32(at + 12, 0)?;
            }
        }
        at += format.sge_size();
    }
    Ok(sgl.len() as u8)
}

/// Read `count` SGEs starting at `offset`
pub fn read_sgl(
    frame: &DmaRegion,
    offset: usize,
    format: SglFormat,
    count: usize,
) -> HalResult<alloc::vec::Vec<SgElement>> {
    let mut out = alloc::vec::Vec::with_capacity(count);
    for i in 0..count {
        let at = offset + i * format.sge_size();
        let sge = match format {
            SglFormat::Sge32 => {
                SgElement::new(PhysAddr::new(frame.read_u32(at)? as u64), frame.read_u32(at + 4)?)
            }
            SglFormat::Sge64 | SglFormat::Ieee => {
                SgElement::new(PhysAddr::new(frame.read_u64(at)?), frame.read_u32(at + 8)?)
            }
        };
        out.push(sge);
    }
    Ok(out)
}

// =============================================================================
// Header
// =============================================================================

/// The common 24-byte frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    /// Frame command
    pub cmd: u8,
    /// Sense buffer length
    pub sense_len: u8,
    /// Completion status
    pub cmd_status: u8,
    /// SCSI status
    pub scsi_status: u8,
    /// Target id
    pub target: u8,
    /// LUN
    pub lun: u8,
    /// CDB length
    pub cdb_len: u8,
    /// SGE count
    pub sge_count: u8,
    /// Context
    pub context: u32,
    /// Flags
    pub flags: u16,
    /// Timeout
    pub timeout: u16,
    /// Transfer length (LBA count for LD I/O)
    pub data_xfer_len: u32,
}

impl FrameHeader {
    /// Write the header into the first 24 bytes of `frame`
    pub fn write(&self, frame: &DmaRegion) -> HalResult<()> {
        frame.write_u8(hdr::CMD, self.cmd)?;
        frame.write_u8(hdr::SENSE_LEN, self.sense_len)?;
        frame.write_u8(hdr::CMD_STATUS, self.cmd_status)?;
        frame.write_u8(hdr::SCSI_STATUS, self.scsi_status)?;
        frame.write_u8(hdr::TARGET, self.target)?;
        frame.write_u8(hdr::LUN, self.lun)?;
        frame.write_u8(hdr::CDB_LEN, self.cdb_len)?;
        frame.write_u8(hdr::SGE_COUNT, self.sge_count)?;
        frame.write_u32(hdr::CONTEXT, self.context)?;
        frame.write_u32(12, 0)?;
        frame.write_u16(hdr::FLAGS, self.flags)?;
        frame.write_u16(hdr::TIMEOUT, self.timeout)?;
        frame.write_u32(hdr::DATA_XFER_LEN, self.data_xfer_len)
    }

    /// Decode the header of `frame`
    pub fn read(frame: &DmaRegion) -> HalResult<Self> {
        Ok(Self {
            cmd: frame.read_u8(hdr::CMD)?,
            sense_len: frame.read_u8(hdr::SENSE_LEN)?,
            cmd_status: frame.read_u8(hdr::CMD_STATUS)?,
            scsi_status: frame.read_u8(hdr::SCSI_STATUS)?,
            target: frame.read_u8(hdr::TARGET)?,
            lun: frame.read_u8(hdr::LUN)?,
            cdb_len: frame.read_u8(hdr::CDB_LEN)?,
            sge_count: frame.read_u8(hdr::SGE_COUNT)?,
            context: frame.read_u32(hdr::CONTEXT)?,
            flags: frame.read_u16(hdr::FLAGS)?,
            timeout: frame.read_u16(hdr::TIMEOUT)?,
            data_xfer_len: frame.read_u32(hdr::DATA_XFER_LEN)?,
        })
    }

    /// Decoded flags
    pub fn frame_flags(&self) -> FrameFlags {
        FrameFlags::from_bits_truncate(self.flags)
    }
}

/// Completion status fields of a returned frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStatus {
    /// MFI status
    pub cmd_status: u8,
    /// SCSI status
    pub scsi_status: u8,
    /// Valid sense bytes
    pub sense_len: u8,
}

/// Read the completion status of `frame`
pub fn read_status(frame: &DmaRegion) -> HalResult<FrameStatus> {
    Ok(FrameStatus {
        cmd_status: frame.read_u8(hdr::CMD_STATUS)?,
        scsi_status: frame.read_u8(hdr::SCSI_STATUS)?,
        sense_len: frame.read_u8(hdr::SENSE_LEN)?,
    })
}

/// Preset a frame for polled issue
///
/// Firmware overwrites the status byte and does not post to the reply queue.
pub fn prepare_polled(frame: &DmaRegion) -> HalResult<()> {
    frame.write_u8(hdr::CMD_STATUS, MFI_STAT_INVALID_STATUS)?;
    let flags = frame.read_u16(hdr::FLAGS)? | FrameFlags::DONT_POST.bits();
    frame.write_u16(hdr::FLAGS, flags)
}

fn write_sense_addr(frame: &DmaRegion, sense: PhysAddr, dma64: bool) -> HalResult<()> {
    frame.write_u32(SENSE_ADDR_OFFSET, sense.low())?;
    frame.write_u32(SENSE_ADDR_OFFSET + 4, if dma64 { sense.high() } else { 0 })
}

// =============================================================================
// Frame bodies
// =============================================================================

/// Common inputs for frames that move data
#[derive(Debug, Clone, Copy)]
pub struct DataFrame<'a> {
    /// Context of the owning command
    pub context: u32,
    /// Target id
    pub target: u8,
    /// LUN
    pub lun: u8,
    /// Direction of the data phase
    pub direction: DataDirection,
    /// Segments
    pub sgl: &'a [SgElement],
    /// SGE encoding
    pub format: SglFormat,
    /// Sense buffer address
    pub sense: PhysAddr,
    /// Sense buffer length
    pub sense_len: u8,
    /// Whether addresses above 4 GiB are in use
    pub dma64: bool,
}

impl DataFrame<'_> {
    fn flags(&self) -> u16 {
        let mut flags = self.direction.flags() | self.format.flags();
        if self.dma64 {
            flags |= FrameFlags::SENSE64;
        }
        flags.bits()
    }
}

/// Encode an LD read/write frame, returning its frame count
pub fn encode_ldio(frame: &DmaRegion, io: &DataFrame<'_>, lba: u64, blocks: u32) -> HalResult<u8> {
    frame.fill(0, MFI_FRAME_SIZE, 0);
    let cmd = match io.direction {
        DataDirection::Write => MFI_CMD_LD_WRITE,
        _ => MFI_CMD_LD_READ,
    };
    let sge_count = write_sgl(frame, LDIO_SGL_OFFSET, io.format, io.sgl)?;
    FrameHeader {
        cmd,
        sense_len: io.sense_len,
        target: io.target,
        sge_count,
        context: io.context,
        flags: io.flags(),
        data_xfer_len: blocks,
        ..FrameHeader::default()
    }
    .write(frame)?;
    write_sense_addr(frame, io.sense, io.dma64)?;
    frame.write_u64(LDIO_LBA_OFFSET, lba)?;
    Ok(frame_count(io.format, io.sgl.len(), FrameKind::Io))
}

/// Encode a SCSI pass-through frame, returning its frame count
pub fn encode_pthru(
    frame: &DmaRegion,
    io: &DataFrame<'_>,
    logical: bool,
    cdb: &[u8],
    data_len: u32,
    timeout: u16,
) -> HalResult<u8> {
    frame.fill(0, MFI_FRAME_SIZE, 0);
    let cdb_len = cdb.len().min(MAX_CDB_LEN);
    let sge_count = write_sgl(frame, PTHRU_SGL_OFFSET, io.format, io.sgl)?;
    FrameHeader {
        cmd: if logical { MFI_CMD_LD_SCSI_IO } else { MFI_CMD_PD_SCSI_IO },
        sense_len: io.sense_len,
        target: io.target,
        lun: io.lun,
        cdb_len: cdb_len as u8,
        sge_count,
        context: io.context,
        flags: io.flags(),
        timeout,
        data_xfer_len: data_len,
        ..FrameHeader::default()
    }
    .write(frame)?;
    write_sense_addr(frame, io.sense, io.dma64)?;
    frame.write_bytes(PTHRU_CDB_OFFSET, &cdb[..cdb_len])?;
    Ok(frame_count(io.format, io.sgl.len(), FrameKind::Passthru))
}

/// Encode a DCMD frame, returning its frame count
pub fn encode_dcmd(
    frame: &DmaRegion,
    context: u32,
    opcode: u32,
    mbox: &[u8; DCMD_MBOX_SIZE],
    direction: DataDirection,
    format: SglFormat,
    sgl: &[SgElement],
) -> HalResult<u8> {
    frame.fill(0, MFI_FRAME_SIZE, 0);
    let sge_count = write_sgl(frame, DCMD_SGL_OFFSET, format, sgl)?;
    let data_len: u32 = sgl.iter().map(|s| s.len).sum();
    FrameHeader {
        cmd: MFI_CMD_DCMD,
        cmd_status: MFI_STAT_INVALID_STATUS,
        sge_count,
        context,
        flags: (direction.flags() | format.flags()).bits(),
        data_xfer_len: data_len,
        ..FrameHeader::default()
    }
    .write(frame)?;
    frame.write_u32(DCMD_OPCODE_OFFSET, opcode)?;
    frame.write_bytes(DCMD_MBOX_OFFSET, mbox)?;
    Ok(frame_count(format, sgl.len(), FrameKind::Io))
}

/// Encode an ABORT frame targeting the command at `target_context`
pub fn encode_abort(
    frame: &DmaRegion,
    context: u32,
    target_context: u32,
    target_frame: PhysAddr,
) -> HalResult<()> {
    frame.fill(0, MFI_FRAME_SIZE, 0);
    FrameHeader {
        cmd: MFI_CMD_ABORT,
        cmd_status: MFI_STAT_INVALID_STATUS,
        context,
        ..FrameHeader::default()
    }
    .write(frame)?;
    frame.write_u32(ABORT_CONTEXT_OFFSET, target_context)?;
    frame.write_u64(ABORT_ADDR_OFFSET, target_frame.as_u64())
}

/// Reply queue geometry handed to firmware at INIT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInfo {
    /// Reply queue entries (max commands + 1)
    pub entries: u32,
    /// Reply queue base
    pub reply_queue: PhysAddr,
    /// Producer index address
    pub producer: PhysAddr,
    /// Consumer index address
    pub consumer: PhysAddr,
}

impl QueueInfo {
    /// Write the queue-info block at `offset`
    pub fn write(&self, region: &DmaRegion, offset: usize) -> HalResult<()> {
        region.write_u32(offset, 0)?;
        region.write_u32(offset + 4, self.entries)?;
        region.write_u64(offset + 8, self.reply_queue.as_u64())?;
        region.write_u64(offset + 16, self.producer.as_u64())?;
        region.write_u64(offset + 24, self.consumer.as_u64())
    }

    /// Read a queue-info block at `offset`
    pub fn read(region: &DmaRegion, offset: usize) -> HalResult<Self> {
        Ok(Self {
            entries: region.read_u32(offset + 4)?,
            reply_queue: PhysAddr::new(region.read_u64(offset + 8)?),
            producer: PhysAddr::new(region.read_u64(offset + 16)?),
            consumer: PhysAddr::new(region.read_u64(offset + 24)?),
        })
    }
}

/// Encode an INIT frame; the queue-info block goes into the second frame unit
pub fn encode_init(
    frame: &DmaRegion,
    context: u32,
    queue: &QueueInfo,
    driver_version: PhysAddr,
) -> HalResult<()> {
    frame.fill(0, INIT_QINFO_BLOCK + QUEUE_INFO_SIZE, 0);
    queue.write(frame, INIT_QINFO_BLOCK)?;
    FrameHeader {
        cmd: MFI_CMD_INIT,
        cmd_status: MFI_STAT_INVALID_STATUS,
        context,
        data_xfer_len: QUEUE_INFO_SIZE as u32,
        ..FrameHeader::default()
    }
    .write(frame)?;
    frame.write_u64(INIT_QINFO_OFFSET, frame.phys().add(INIT_QINFO_BLOCK as u64).as_u64())?;
    frame.write_u64(INIT_DRIVER_VER_OFFSET, driver_version.as_u64())
}

// =============================================================================
// CDB and sense helpers
// =============================================================================

/// Block range of a READ/WRITE CDB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RwCdb {
    /// Whether the CDB is a write
    pub write: bool,
    /// Starting LBA
    pub lba: u64,
    /// Number of blocks
    pub blocks: u32,
}

/// Decode READ/WRITE (6), (10), (12) and (16) CDBs
pub fn parse_rw_cdb(cdb: &[u8]) -> Option<RwCdb> {
    let be32 = |b: &[u8]| u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
    let op = *cdb.first()?;
    let (write, lba, blocks) = match (op, cdb.len()) {
        (0x08 | 0x0A, 6..) => {
            let lba = ((cdb[1] as u64 & 0x1F) << 16) | ((cdb[2] as u64) << 8) | cdb[3] as u64;
            (op == 0x0A, lba, cdb[4] as u32)
        }
        (0x28 | 0x2A, 10..) => {
            (op == 0x2A, be32(&cdb[2..6]) as u64, u16::from_be_bytes([cdb[7], cdb[8]]) as u32)
        }
        (0xA8 | 0xAA, 12..) => (op == 0xAA, be32(&cdb[2..6]) as u64, be32(&cdb[6..10])),
        (0x88 | 0x8A, 16..) => {
            let lba = ((be32(&cdb[2..6]) as u64) << 32) | be32(&cdb[6..10]) as u64;
            (op == 0x8A, lba, be32(&cdb[10..14]))
        }
        _ => return None,
    };
    Some(RwCdb { write, lba, blocks })
}

/// Normalize sense data returned with CHECK CONDITION
///
/// Devices that leave the buffer empty get fixed-format, NO SENSE data.
pub fn normalize_sense(sense: &mut [u8]) {
    if sense.len() > 2 && sense[0] == 0 {
        sense[0] = 0x70;
        sense[2] = 0;
    }
}
