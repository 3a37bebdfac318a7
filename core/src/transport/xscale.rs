//! xscale family (SAS1064R, PERC5).

use super::regs::*;
use super::{ChipFamily, InterruptCause, Transport};
use crate::error::CoreResult;
use crate::mfi::{MEGASAS_ADPRESET_INPROG_SIGN, MFI_ADP_RESET};
use alloc::sync::Arc;
use megasas_hal::{PhysAddr, RegisterBlock, Timer};

/// Settle time after the reset doorbell
const XSCALE_RESET_SETTLE_MS: u64 = 3_000;

/// xscale transport
pub struct XscaleTransport {
    regs: Arc<dyn RegisterBlock>,
}

impl XscaleTransport {
    /// Wrap a register block
    pub fn new(regs: Arc<dyn RegisterBlock>) -> Self {
        Self { regs }
    }
}

impl Transport for XscaleTransport {
    fn family(&self) -> ChipFamily {
        ChipFamily::Xscale
    }

    fn fire(&self, frame: PhysAddr, extra_frames: u8) {
        let value = (frame.as_u64() >> 3) as u32 | extra_frames as u32;
        self.regs.write32(INBOUND_QUEUE_PORT, value);
    }

    fn enable_intr(&self) {
        self.regs.write32(OUTBOUND_INTR_MASK, 0);
        self.regs.read32(OUTBOUND_INTR_MASK);
    }

    fn disable_intr(&self) {
        self.regs.write32(OUTBOUND_INTR_MASK, MFI_XSCALE_DISABLE_MASK);
        self.regs.read32(OUTBOUND_INTR_MASK);
    }

    fn clear_intr(&self) -> InterruptCause {
        let status = self.regs.read32(OUTBOUND_INTR_STATUS);
        let mut cause = InterruptCause::empty();
        if status & MFI_OB_INTR_STATUS_MASK != 0 {
            cause |= InterruptCause::REPLY;
        }
        if status & MFI_XSCALE_OMR0_CHANGE_INTERRUPT != 0 {
            cause |= InterruptCause::STATE_CHANGE;
        }
        if !cause.is_empty() {
            self.regs.write32(OUTBOUND_INTR_STATUS, status);
        }
        self.regs.read32(OUTBOUND_INTR_STATUS);
        cause
    }

    fn read_fw_status(&self) -> u32 {
        self.regs.read32(OUTBOUND_MSG_0)
    }

    fn write_doorbell(&self, value: u32) {
        self.regs.write32(INBOUND_DOORBELL, value);
    }

    fn adapter_reset(&self, timer: &dyn Timer) -> CoreResult<()> {
        self.regs.write32(INBOUND_DOORBELL, MFI_ADP_RESET);
        timer.sleep_ms(XSCALE_RESET_SETTLE_MS);
        Ok(())
    }

    fn check_reset(&self, recovering: bool, consumer: u32) -> bool {
        recovering && consumer == MEGASAS_ADPRESET_INPROG_SIGN
    }

    fn marks_reset_in_consumer(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{CountingTimer, RecordingRegs};

    fn transport() -> (Arc<RecordingRegs>, XscaleTransport) {
        let regs = Arc::new(RecordingRegs::default());
        (Arc::clone(&regs), XscaleTransport::new(regs))
    }

    #[test]
    fn test_fire_encoding() {
        let (regs, t) = transport();
        t.fire(PhysAddr::new(0x1000_0040), 2);
        assert_eq!(regs.writes_to(INBOUND_QUEUE_PORT), [0x0200_0008 | 2]);
    }

    #[test]
    fn test_interrupt_masking() {
        let (regs, t) = transport();
        t.disable_intr();
        t.enable_intr();
        assert_eq!(regs.writes_to(OUTBOUND_INTR_MASK), [0x1F, 0]);
    }

    #[test]
    fn test_clear_intr_causes() {
        let (regs, t) = transport();
        regs.set(OUTBOUND_INTR_STATUS, 0x3);
        assert_eq!(t.clear_intr(), InterruptCause::REPLY | InterruptCause::STATE_CHANGE);
        assert_eq!(regs.writes_to(OUTBOUND_INTR_STATUS), [0x3]);

        regs.set(OUTBOUND_INTR_STATUS, 0x0);
        assert!(t.clear_intr().is_empty());
    }

    #[test]
    fn test_status_and_reset() {
        let (regs, t) = transport();
        regs.set(OUTBOUND_MSG_0, 0xB000_0010);
        assert_eq!(t.read_fw_status(), 0xB000_0010);

        let timer = CountingTimer::default();
        t.adapter_reset(&timer).unwrap();
        assert_eq!(regs.writes_to(INBOUND_DOORBELL), [MFI_ADP_RESET]);
        assert_eq!(timer.now_ms(), 3_000);
    }

    #[test]
    fn test_check_reset_needs_signature() {
        let (_, t) = transport();
        assert!(!t.check_reset(true, 4));
        assert!(t.check_reset(true, MEGASAS_ADPRESET_INPROG_SIGN));
        assert!(!t.check_reset(false, MEGASAS_ADPRESET_INPROG_SIGN));
    }
}
