//! skinny family (SAS0073, SAS0071).

use super::gen2::diag_reset;
use super::regs::*;
use super::{queue_port_value, ChipFamily, InterruptCause, Transport};
use crate::error::CoreResult;
use crate::frame::SglFormat;
use crate::mfi::FwState;
use alloc::sync::Arc;
use megasas_hal::{PhysAddr, RegisterBlock, Timer};

/// skinny transport
pub struct SkinnyTransport {
    regs: Arc<dyn RegisterBlock>,
}

impl SkinnyTransport {
    /// Wrap a register block
    pub fn new(regs: Arc<dyn RegisterBlock>) -> Self {
        Self { regs }
    }
}

impl Transport for SkinnyTransport {
    fn family(&self) -> ChipFamily {
        ChipFamily::Skinny
    }

    fn fire(&self, frame: PhysAddr, extra_frames: u8) {
        self.regs.write32(INBOUND_HIGH_QUEUE_PORT, 0);
        self.regs.write32(INBOUND_LOW_QUEUE_PORT, queue_port_value(frame, extra_frames));
    }

    fn enable_intr(&self) {
        self.regs.write32(OUTBOUND_INTR_MASK, u32::MAX);
        self.regs.write32(OUTBOUND_INTR_MASK, !MFI_SKINNY_ENABLE_INTERRUPT_MASK);
        self.regs.read32(OUTBOUND_INTR_MASK);
    }

    fn disable_intr(&self) {
        self.regs.write32(OUTBOUND_INTR_MASK, u32::MAX);
        self.regs.read32(OUTBOUND_INTR_MASK);
    }

    fn clear_intr(&self) -> InterruptCause {
        let status = self.regs.read32(OUTBOUND_INTR_STATUS);
        if status & MFI_SKINNY_ENABLE_INTERRUPT_MASK == 0 {
            return InterruptCause::empty();
        }
        // One interrupt bit for everything; a faulted firmware means the
        // state changed.
        let cause = if FwState::from_status(self.read_fw_status()) == FwState::Fault {
            InterruptCause::STATE_CHANGE
        } else {
            InterruptCause::REPLY
        };
        self.regs.write32(OUTBOUND_INTR_STATUS, status);
        self.regs.read32(OUTBOUND_INTR_STATUS);
        cause
    }

    fn read_fw_status(&self) -> u32 {
        self.regs.read32(OUTBOUND_SCRATCH_PAD)
    }

    fn write_doorbell(&self, value: u32) {
        self.regs.write32(DOORBELL, value);
    }

    fn adapter_reset(&self, timer: &dyn Timer) -> CoreResult<()> {
        diag_reset(self.regs.as_ref(), FUSION_SEQ_OFFSET, FUSION_HOST_DIAG, timer)
    }

    fn sgl_format(&self, _dma64: bool) -> SglFormat {
        SglFormat::Ieee
    }
}
