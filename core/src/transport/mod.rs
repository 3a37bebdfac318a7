//! # Chip Transports
//!
//! One [`Transport`] implementation per controller family. A transport knows
//! how to reach the firmware through its register block: where the status
//! word lives, how frames are posted, how interrupts are masked and
//! acknowledged, and how the chip is reset. Everything above this layer is
//! family-independent.
//!
//! | Family | Status register | Fire encoding | Reset |
//! |--------|-----------------|---------------|-------|
//! | xscale | outbound msg 0  | `(phys >> 3) \| count` | ADP_RESET doorbell |
//! | ppc    | scratch pad     | `phys \| count << 1 \| 1` | ADP_RESET doorbell |
//! | gen2   | scratch pad     | `phys \| count << 1 \| 1` | diag key sequence |
//! | skinny | scratch pad     | low/high queue ports | diag key sequence |

pub mod regs;

mod gen2;
mod ppc;
mod skinny;
mod xscale;

pub use gen2::Gen2Transport;
pub use ppc::PpcTransport;
pub use skinny::SkinnyTransport;
pub use xscale::XscaleTransport;

use crate::error::CoreResult;
use crate::frame::SglFormat;
use crate::mfi::{FwState, MFI_STOP_ADP};
use alloc::boxed::Box;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::fmt;
use megasas_hal::{PhysAddr, RegisterBlock, Timer};

bitflags! {
    /// What an acknowledged interrupt signalled
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptCause: u32 {
        /// Replies were posted to the reply ring
        const REPLY = 0x1;
        /// The firmware state changed
        const STATE_CHANGE = 0x2;
    }
}

/// Controller family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipFamily {
    /// SAS1064R and PERC5
    Xscale,
    /// SAS1078R and SAS1078DE
    Ppc,
    /// SAS1078 gen2 and SAS0079
    Gen2,
    /// SAS0073 and SAS0071
    Skinny,
}

impl ChipFamily {
    /// Family of a PCI device id
    ///
    /// Unknown ids fall back to xscale, the oldest register layout.
    pub const fn from_device_id(device: u16) -> Self {
        match device {
            0x0060 | 0x007C => ChipFamily::Ppc,
            0x0078 | 0x0079 => ChipFamily::Gen2,
            0x0071 | 0x0073 => ChipFamily::Skinny,
            _ => ChipFamily::Xscale,
        }
    }

    /// Build the transport for this family over `regs`
    pub fn transport(self, regs: Arc<dyn RegisterBlock>) -> Box<dyn Transport> {
        match self {
            ChipFamily::Xscale => Box::new(XscaleTransport::new(regs)),
            ChipFamily::Ppc => Box::new(PpcTransport::new(regs)),
            ChipFamily::Gen2 => Box::new(Gen2Transport::new(regs)),
            ChipFamily::Skinny => Box::new(SkinnyTransport::new(regs)),
        }
    }

    /// Short name for logs
    pub const fn as_str(self) -> &'static str {
        match self {
            ChipFamily::Xscale => "xscale",
            ChipFamily::Ppc => "ppc",
            ChipFamily::Gen2 => "gen2",
            ChipFamily::Skinny => "skinny",
        }
    }
}

impl fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Register-level access to one controller
///
/// Implementations must be callable from interrupt context, except for
/// [`Transport::adapter_reset`] which sleeps.
pub trait Transport: Send + Sync {
    /// Controller family
    fn family(&self) -> ChipFamily;

    /// Post a frame; `extra_frames` is the frame count minus one
    fn fire(&self, frame: PhysAddr, extra_frames: u8);

    /// Unmask the reply and state-change interrupts
    fn enable_intr(&self);

    /// Mask all interrupts
    fn disable_intr(&self);

    /// Acknowledge a pending interrupt and report its causes
    ///
    /// Returns an empty set if the interrupt was not ours.
    fn clear_intr(&self) -> InterruptCause;

    /// Raw firmware status word
    fn read_fw_status(&self) -> u32;

    /// Write the inbound doorbell
    fn write_doorbell(&self, value: u32);

    /// Run the family's chip reset sequence
    fn adapter_reset(&self, timer: &dyn Timer) -> CoreResult<()>;

    /// Whether an interrupt arriving now belongs to a reset in progress
    fn check_reset(&self, recovering: bool, _consumer: u32) -> bool {
        recovering
    }

    /// Whether the consumer index is stamped with the reset signature
    /// while a reset is in progress
    fn marks_reset_in_consumer(&self) -> bool {
        false
    }

    /// SGE encoding used by this family
    fn sgl_format(&self, dma64: bool) -> SglFormat {
        if dma64 {
            SglFormat::Sge64
        } else {
            SglFormat::Sge32
        }
    }

    /// Halt the firmware
    fn stop_adapter(&self) {
        self.write_doorbell(MFI_STOP_ADP);
    }

    /// Decoded firmware state
    fn fw_state(&self) -> FwState {
        FwState::from_status(self.read_fw_status())
    }
}

/// Fire encoding shared by ppc, gen2 and skinny (low word)
pub(crate) const fn queue_port_value(frame: PhysAddr, extra_frames: u8) -> u32 {
    frame.low() | ((extra_frames as u32) << 1) | 1
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_table() {
        assert_eq!(ChipFamily::from_device_id(0x0411), ChipFamily::Xscale);
        assert_eq!(ChipFamily::from_device_id(0x0060), ChipFamily::Ppc);
        assert_eq!(ChipFamily::from_device_id(0x0079), ChipFamily::Gen2);
        assert_eq!(ChipFamily::from_device_id(0x0073), ChipFamily::Skinny);
        assert_eq!(ChipFamily::from_device_id(0xBEEF), ChipFamily::Xscale);
    }

    #[test]
    fn test_factory_reports_family() {
        let regs: Arc<dyn RegisterBlock> = Arc::new(testing::RecordingRegs::default());
        for family in [ChipFamily::Xscale, ChipFamily::Ppc, ChipFamily::Gen2, ChipFamily::Skinny] {
            assert_eq!(family.transport(Arc::clone(&regs)).family(), family);
        }
    }

    #[test]
    fn test_queue_port_encoding() {
        assert_eq!(queue_port_value(PhysAddr::new(0x1000_0040), 0), 0x1000_0041);
        assert_eq!(queue_port_value(PhysAddr::new(0x1000_0040), 3), 0x1000_0047);
    }
}
