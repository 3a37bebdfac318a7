//! # MegaSAS HAL - Host Abstraction Layer
//!
//! This crate defines the host facilities the controller engine is written
//! against. A host (kernel, hypervisor, user-space test bench) implements the
//! traits here once and every chip family in `megasas-core` runs on top.
//!
//! ## Design Philosophy
//!
//! The HAL is designed to be:
//! - **Minimal**: DMA memory, 32-bit registers, a clock and interrupt masking
//! - **Safe**: Encapsulates all volatile and shared-memory accesses
//! - **Protocol-agnostic**: Nothing in this crate knows about MFI frames
//!
//! ## Modules
//!
//! - [`dma`]: coherent DMA regions and allocators
//! - [`mmio`]: register block access
//! - [`timer`]: monotonic clock, sleeping and bounded polling
//! - [`interrupts`]: handler return codes, interrupt masking and [`IrqMutex`]

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod dma;
pub mod interrupts;
pub mod mmio;
pub mod timer;

pub use dma::{DmaAllocator, DmaRegion, HostDmaAllocator, WindowDmaAllocator};
pub use interrupts::{without_interrupts, InterruptControl, IrqMutex, IrqMutexGuard, IrqReturn, IrqState};
pub use mmio::{MmioRegisters, RegisterBlock};
pub use timer::{poll_until, Timer};

use core::fmt;

/// Result type for HAL operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors that can occur in HAL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// The operation is not supported by this host
    NotSupported,
    /// Invalid parameter provided
    InvalidParameter,
    /// Hardware reported an error
    HardwareError,
    /// Operation timed out
    Timeout,
    /// Address is invalid or not aligned
    InvalidAddress,
    /// Memory allocation failed
    OutOfMemory,
    /// Access falls outside the buffer or register window
    OutOfBounds,
}

impl HalError {
    /// Short static description
    pub const fn as_str(self) -> &'static str {
        match self {
            HalError::NotSupported => "operation not supported",
            HalError::InvalidParameter => "invalid parameter",
            HalError::HardwareError => "hardware error",
            HalError::Timeout => "timed out",
            HalError::InvalidAddress => "invalid or misaligned address",
            HalError::OutOfMemory => "out of DMA memory",
            HalError::OutOfBounds => "access out of bounds",
        }
    }
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU (virtual) address of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Create a new virtual address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Address of a pointer
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if the address is aligned to the given alignment
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 % align == 0
    }

    /// Add an offset to the address
    #[inline]
    pub const fn add(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    /// Convert to a raw mutable pointer
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Bus (physical) address as seen by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// The null bus address
    pub const NULL: Self = Self(0);

    /// Create a new physical address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Low 32 bits
    #[inline]
    pub const fn low(self) -> u32 {
        self.0 as u32
    }

    /// High 32 bits
    #[inline]
    pub const fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Whether the address fits in 32 bits
    #[inline]
    pub const fn fits_32(self) -> bool {
        self.0 <= u32::MAX as u64
    }

    /// Check if the address is aligned to the given alignment
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 % align == 0
    }

    /// Align the address up to the given alignment
    #[inline]
    pub const fn align_up(self, align: u64) -> Self {
        Self((self.0 + align - 1) & !(align - 1))
    }

    /// Align the address down to the given alignment
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// Add an offset to the address
    #[inline]
    pub const fn add(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
