//! Register offsets and bit definitions shared by the chip families.

// =============================================================================
// Register offsets
// =============================================================================

/// Inbound doorbell of skinny controllers
pub const DOORBELL: usize = 0x00;
/// Diagnostic write-sequence register of skinny controllers
pub const FUSION_SEQ_OFFSET: usize = 0x04;
/// Host diagnostic register of skinny controllers
pub const FUSION_HOST_DIAG: usize = 0x08;
/// Outbound message 0 (xscale firmware status)
pub const OUTBOUND_MSG_0: usize = 0x18;
/// Inbound doorbell
pub const INBOUND_DOORBELL: usize = 0x20;
/// Outbound interrupt status
pub const OUTBOUND_INTR_STATUS: usize = 0x30;
/// Outbound interrupt mask
pub const OUTBOUND_INTR_MASK: usize = 0x34;
/// Inbound queue port (frame submission)
pub const INBOUND_QUEUE_PORT: usize = 0x40;
/// Outbound doorbell clear
pub const OUTBOUND_DOORBELL_CLEAR: usize = 0xA0;
/// Outbound scratch pad (firmware status on ppc and later)
pub const OUTBOUND_SCRATCH_PAD: usize = 0xB0;
/// Inbound low queue port (skinny)
pub const INBOUND_LOW_QUEUE_PORT: usize = 0xC0;
/// Inbound high queue port (skinny)
pub const INBOUND_HIGH_QUEUE_PORT: usize = 0xC4;
/// Host diagnostic register
pub const HOST_DIAG: usize = 0xF8;
/// Diagnostic write-sequence register
pub const SEQ_OFFSET: usize = 0xFC;

// =============================================================================
// Interrupt bits
// =============================================================================

/// xscale: reply posted
pub const MFI_OB_INTR_STATUS_MASK: u32 = 0x0000_0002;
/// xscale: outbound message 0 changed
pub const MFI_XSCALE_OMR0_CHANGE_INTERRUPT: u32 = 0x0000_0001;
/// xscale: mask everything
pub const MFI_XSCALE_DISABLE_MASK: u32 = 0x0000_001F;
/// ppc: reply posted
pub const MFI_REPLY_1078_MESSAGE_INTERRUPT: u32 = 0x8000_0000;
/// ppc: unmasked sources
pub const MFI_1078_ENABLE_INTERRUPT_MASK: u32 = 0x8000_0004;
/// ppc and gen2: firmware state changed
pub const MFI_G2_OUTBOUND_DOORBELL_CHANGE_INTERRUPT: u32 = 0x0000_0004;
/// gen2: reply posted
pub const MFI_REPLY_GEN2_MESSAGE_INTERRUPT: u32 = 0x0000_0001;
/// gen2: unmasked sources
pub const MFI_GEN2_ENABLE_INTERRUPT_MASK: u32 =
    MFI_REPLY_GEN2_MESSAGE_INTERRUPT | MFI_G2_OUTBOUND_DOORBELL_CHANGE_INTERRUPT;
/// skinny: any outbound interrupt
pub const MFI_SKINNY_ENABLE_INTERRUPT_MASK: u32 = 0x0000_0001;

// =============================================================================
// Diagnostic reset
// =============================================================================

/// Host diag: write access granted
pub const DIAG_WRITE_ENABLE: u32 = 0x0000_0080;
/// Host diag: reset the adapter
pub const DIAG_RESET_ADAPTER: u32 = 0x0000_0004;
/// Key sequence unlocking the host diag register
pub const DIAG_KEY_SEQUENCE: [u32; 6] = [0x0, 0x4, 0xB, 0x2, 0x7, 0xD];
