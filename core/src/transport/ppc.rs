//! ppc family (SAS1078R, SAS1078DE).

use super::regs::*;
use super::{queue_port_value, ChipFamily, InterruptCause, Transport};
use crate::error::CoreResult;
use crate::mfi::MFI_ADP_RESET;
use alloc::sync::Arc;
use megasas_hal::{PhysAddr, RegisterBlock, Timer};

/// Settle time after the reset doorbell
const PPC_RESET_SETTLE_MS: u64 = 3_000;

/// ppc transport
pub struct PpcTransport {
    regs: Arc<dyn RegisterBlock>,
}

impl PpcTransport {
    /// Wrap a register block
    pub fn new(regs: Arc<dyn RegisterBlock>) -> Self {
        Self { regs }
    }
}

impl Transport for PpcTransport {
    fn family(&self) -> ChipFamily {
        ChipFamily::Ppc
    }

    fn fire(&self, frame: PhysAddr, extra_frames: u8) {
        self.regs.write32(INBOUND_QUEUE_PORT, queue_port_value(frame, extra_frames));
    }

    fn enable_intr(&self) {
        self.regs.write32(OUTBOUND_DOORBELL_CLEAR, u32::MAX);
        self.regs.write32(OUTBOUND_INTR_MASK, !MFI_1078_ENABLE_INTERRUPT_MASK);
        self.regs.read32(OUTBOUND_INTR_MASK);
    }

    fn disable_intr(&self) {
        self.regs.write32(OUTBOUND_INTR_MASK, u32::MAX);
        self.regs.read32(OUTBOUND_INTR_MASK);
    }

    fn clear_intr(&self) -> InterruptCause {
        let status = self.regs.read32(OUTBOUND_INTR_STATUS);
        let mut cause = InterruptCause::empty();
        if status & MFI_REPLY_1078_MESSAGE_INTERRUPT != 0 {
            cause |= InterruptCause::REPLY;
        }
        if status & MFI_G2_OUTBOUND_DOORBELL_CHANGE_INTERRUPT != 0 {
            cause |= InterruptCause::STATE_CHANGE;
        }
        // Acknowledged unconditionally on this family.
        self.regs.write32(OUTBOUND_DOORBELL_CLEAR, status);
        self.regs.read32(OUTBOUND_DOORBELL_CLEAR);
        cause
    }

    fn read_fw_status(&self) -> u32 {
        self.regs.read32(OUTBOUND_SCRATCH_PAD)
    }

    fn write_doorbell(&self, value: u32) {
        self.regs.write32(INBOUND_DOORBELL, value);
    }

    fn adapter_reset(&self, timer: &dyn Timer) -> CoreResult<()> {
        self.regs.write32(INBOUND_DOORBELL, MFI_ADP_RESET);
        timer.sleep_ms(PPC_RESET_SETTLE_MS);
        Ok(())
    }
}
