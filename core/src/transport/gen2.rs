//! gen2 family (SAS1078 gen2, SAS0079) and the diagnostic reset sequence
//! it shares with skinny controllers.

use super::regs::*;
use super::{queue_port_value, ChipFamily, InterruptCause, Transport};
use crate::error::{CoreError, CoreResult};
use alloc::sync::Arc;
use megasas_hal::{PhysAddr, RegisterBlock, Timer};

/// Polls for write access to the diag register
const DIAG_WRITE_ENABLE_RETRIES: u32 = 100;
/// Polls (counted together with the write-enable polls) for reset completion
const DIAG_RESET_RETRIES: u32 = 1_000;
/// Delay between diag polls
const DIAG_POLL_MS: u64 = 100;

/// Unlock the host diag register and reset the adapter through it
pub(crate) fn diag_reset(
    regs: &dyn RegisterBlock,
    seq_offset: usize,
    diag_offset: usize,
    timer: &dyn Timer,
) -> CoreResult<()> {
    for key in DIAG_KEY_SEQUENCE {
        regs.write32(seq_offset, key);
    }
    timer.sleep_ms(1_000);

    let mut retry = 0;
    let mut host_diag = regs.read32(diag_offset);
    while host_diag & DIAG_WRITE_ENABLE == 0 {
        timer.sleep_ms(DIAG_POLL_MS);
        host_diag = regs.read32(diag_offset);
        retry += 1;
        if retry >= DIAG_WRITE_ENABLE_RETRIES {
            log::warn!("diag reset: write enable not granted (host diag {:#x})", host_diag);
            return Err(CoreError::ResetFailed);
        }
    }

    log::debug!("diag reset: write enabled (host diag {:#x})", host_diag);
    regs.write32(diag_offset, host_diag | DIAG_RESET_ADAPTER);
    timer.sleep_ms(10_000);

    host_diag = regs.read32(diag_offset);
    while host_diag & DIAG_RESET_ADAPTER != 0 {
        timer.sleep_ms(DIAG_POLL_MS);
        host_diag = regs.read32(diag_offset);
        retry += 1;
        if retry >= DIAG_RESET_RETRIES {
            log::warn!("diag reset: adapter stuck in reset (host diag {:#x})", host_diag);
            return Err(CoreError::ResetFailed);
        }
    }
    Ok(())
}

/// gen2 transport
pub struct Gen2Transport {
    regs: Arc<dyn RegisterBlock>,
}

impl Gen2Transport {
    /// Wrap a register block
    pub fn new(regs: Arc<dyn RegisterBlock>) -> Self {
        Self { regs }
    }
}

impl Transport for Gen2Transport {
    fn family(&self) -> ChipFamily {
        ChipFamily::Gen2
    }

    fn fire(&self, frame: PhysAddr, extra_frames: u8) {
        self.regs.write32(INBOUND_QUEUE_PORT, queue_port_value(frame, extra_frames));
    }

    fn enable_intr(&self) {
        self.regs.write32(OUTBOUND_DOORBELL_CLEAR, u32::MAX);
        self.regs.write32(OUTBOUND_INTR_MASK, !MFI_GEN2_ENABLE_INTERRUPT_MASK);
        self.regs.read32(OUTBOUND_INTR_MASK);
    }

    fn disable_intr(&self) {
        self.regs.write32(OUTBOUND_INTR_MASK, u32::MAX);
        self.regs.read32(OUTBOUND_INTR_MASK);
    }

    fn clear_intr(&self) -> InterruptCause {
        let status = self.regs.read32(OUTBOUND_INTR_STATUS);
        let mut cause = InterruptCause::empty();
        if status & MFI_GEN2_ENABLE_INTERRUPT_MASK != 0 {
            cause |= InterruptCause::REPLY;
        }
        if status & MFI_G2_OUTBOUND_DOORBELL_CHANGE_INTERRUPT != 0 {
            cause |= InterruptCause::STATE_CHANGE;
        }
        if !cause.is_empty() {
            self.regs.write32(OUTBOUND_DOORBELL_CLEAR, status);
        }
        self.regs.read32(OUTBOUND_INTR_STATUS);
        cause
    }

    fn read_fw_status(&self) -> u32 {
        self.regs.read32(OUTBOUND_SCRATCH_PAD)
    }

    fn write_doorbell(&self, value: u32) {
        self.regs.write32(INBOUND_DOORBELL, value);
    }

    fn adapter_reset(&self, timer: &dyn Timer) -> CoreResult<()> {
        diag_reset(self.regs.as_ref(), SEQ_OFFSET, HOST_DIAG, timer)
    }
}
