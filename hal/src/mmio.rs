//! # Register Access
//!
//! Controllers expose a window of 32-bit registers. The engine only ever
//! talks to hardware through [`RegisterBlock`], so a mapped BAR, a bus
//! trace recorder and a firmware model are interchangeable.

use core::fmt;
use core::ptr;

/// A window of 32-bit device registers addressed by byte offset
pub trait RegisterBlock: Send + Sync {
    /// Read the register at `offset`
    fn read32(&self, offset: usize) -> u32;

    /// Write `value` to the register at `offset`
    fn write32(&self, offset: usize, value: u32);

    /// Write then read back, flushing posted writes
    fn write32_flush(&self, offset: usize, value: u32) {
        self.write32(offset, value);
        let _ = self.read32(offset);
    }
}

/// Memory-mapped register window (a mapped PCI BAR)
pub struct MmioRegisters {
    /// Base virtual address of the mapping
    base: usize,
    /// Size of the mapping in bytes
    size: usize,
}

impl MmioRegisters {
    /// Wrap an existing mapping
    ///
    /// # Safety
    ///
    /// `base..base + size` must be a live, uncached device mapping that stays
    /// valid for the lifetime of the returned value, and no other code may
    /// create conflicting non-volatile references into it.
    pub const unsafe fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// Size of the window in bytes
    pub const fn size(&self) -> usize {
        self.size
    }

    #[inline]
    fn in_range(&self, offset: usize) -> bool {
        offset % 4 == 0 && offset.checked_add(4).is_some_and(|end| end <= self.size)
    }
}

// SAFETY: register accesses are single volatile 32-bit operations, and the
// constructor contract guarantees the mapping outlives the value.
unsafe impl Send for MmioRegisters {}
// SAFETY: see above; the device serializes concurrent register accesses.
unsafe impl Sync for MmioRegisters {}

impl RegisterBlock for MmioRegisters {
    fn read32(&self, offset: usize) -> u32 {
        if !self.in_range(offset) {
            log::error!("mmio: read of {:#x} outside {:#x}-byte window", offset, self.size);
            return u32::MAX;
        }
        // SAFETY: in range and aligned, mapping valid per constructor contract.
        unsafe { ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write32(&self, offset: usize, value: u32) {
        if !self.in_range(offset) {
            log::error!("mmio: write of {:#x} outside {:#x}-byte window", offset, self.size);
            return;
        }
        // SAFETY: in range and aligned, mapping valid per constructor contract.
        unsafe { ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}

impl fmt::Debug for MmioRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmioRegisters")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    #[test]
    fn test_mmio_over_plain_memory() {
        let backing = Box::new([0u32; 16]);
        let base = Box::into_raw(backing) as usize;
        // SAFETY: the box stays alive until the end of the test.
        let regs = unsafe { MmioRegisters::new(base, 64) };

        regs.write32(0x20, 0xABCD);
        assert_eq!(regs.read32(0x20), 0xABCD);
        regs.write32_flush(0x3C, 7);
        assert_eq!(regs.read32(0x3C), 7);

        // Out of range or misaligned accesses are rejected.
        assert_eq!(regs.read32(0x40), u32::MAX);
        assert_eq!(regs.read32(0x21), u32::MAX);
        regs.write32(0x40, 1);

        // SAFETY: reconstructing the box leaked above.
        drop(unsafe { Box::from_raw(base as *mut [u32; 16]) });
    }
}
