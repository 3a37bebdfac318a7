//! # Coherent DMA Memory
//!
//! Buffers shared between the driver and the controller. A [`DmaRegion`] is a
//! cheap, cloneable view over word-addressed memory that carries the bus
//! address the device uses to reach it. All accesses are little-endian, the
//! byte order of every MFI structure.
//!
//! Two backings exist. Hosts with real hardware wrap memory they mapped for
//! the device with [`DmaRegion::from_raw_parts`]. [`HostDmaAllocator`] keeps
//! driver-private heap words behind synthetic bus addresses for hosts whose
//! "device" is a model running on the same CPU.
//!
//! Every access goes through `AtomicU32` so that the driver and the device
//! side can touch the same memory without data races. 32-bit aligned accesses
//! are single atomic operations; narrower writes are read-modify-write loops
//! on the containing word.

use crate::{HalError, HalResult, PhysAddr, VirtAddr};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

static_assertions::assert_impl_all!(DmaRegion: Send, Sync, Clone);

/// Host memory mapped for the device
struct Mapping {
    base: NonNull<AtomicU32>,
    words: usize,
}

// SAFETY: `DmaRegion::from_raw_parts` requires the mapping to stay valid and
// to be accessed only atomically while any view exists, so sharing the
// pointer across threads is sound.
unsafe impl Send for Mapping {}
// SAFETY: see `Send`; all accesses are atomic.
unsafe impl Sync for Mapping {}

/// Memory behind a region
#[derive(Clone)]
enum Backing {
    /// Driver-private words behind a synthetic bus address
    Heap(Arc<[AtomicU32]>),
    /// Coherent memory owned by the host
    Mapped(Arc<Mapping>),
}

/// A physically addressable, coherent memory region
#[derive(Clone)]
pub struct DmaRegion {
    /// Bus address of byte 0 of this view
    phys: PhysAddr,
    /// Backing words of the whole allocation
    backing: Backing,
    /// Byte offset of this view inside the backing words
    offset: usize,
    /// Length of this view in bytes
    len: usize,
}

impl DmaRegion {
    /// Create a zeroed, driver-private region of `len` bytes labelled with
    /// the synthetic bus address `phys`
    ///
    /// The device can only reach this memory through a model that resolves
    /// `phys` back to the region, as [`HostDmaAllocator::resolve`] does.
    pub(crate) fn heap(phys: PhysAddr, len: usize) -> Self {
        let words: Vec<AtomicU32> = (0..len.div_ceil(4)).map(|_| AtomicU32::new(0)).collect();
        Self {
            phys,
            backing: Backing::Heap(words.into()),
            offset: 0,
            len,
        }
    }

    /// Wrap `len` bytes of coherent memory the host mapped for the device
    ///
    /// `virt` is the CPU mapping and `phys` the bus address the controller
    /// uses for the same bytes. The memory is not cleared. Fails with
    /// [`HalError::InvalidAddress`] unless `virt` is 4-byte aligned.
    ///
    /// # Safety
    ///
    /// `virt` must be valid for reads and writes of `len` rounded up to a
    /// multiple of 4 bytes, and `phys` must map to the same bytes for the
    /// device. The memory must stay mapped until the allocator's
    /// [`DmaAllocator::free_coherent`] has been called for the region and no
    /// clone of it is accessed afterwards. The CPU must not access it other
    /// than through `DmaRegion` (or atomically) while it is wrapped.
    pub unsafe fn from_raw_parts(virt: NonNull<u8>, phys: PhysAddr, len: usize) -> HalResult<Self> {
        if !VirtAddr::from_ptr(virt.as_ptr()).is_aligned(4) {
            return Err(HalError::InvalidAddress);
        }
        let mapping = Mapping {
            base: virt.cast(),
            words: len.div_ceil(4),
        };
        Ok(Self {
            phys,
            backing: Backing::Mapped(Arc::new(mapping)),
            offset: 0,
            len,
        })
    }

    #[inline]
    fn words(&self) -> &[AtomicU32] {
        match &self.backing {
            Backing::Heap(words) => &words[..],
            // SAFETY: `from_raw_parts` guarantees `words` valid, aligned u32
            // slots for as long as the mapping is alive, and `AtomicU32` has
            // the layout of `u32`.
            Backing::Mapped(m) => unsafe { core::slice::from_raw_parts(m.base.as_ptr(), m.words) },
        }
    }

    /// CPU address of the first byte
    pub fn virt(&self) -> VirtAddr {
        VirtAddr::from_ptr(self.words().as_ptr()).add(self.offset as u64)
    }

    /// Bus address of the first byte
    #[inline]
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Carve a sub-region sharing the same backing memory
    pub fn slice(&self, offset: usize, len: usize) -> HalResult<DmaRegion> {
        let end = offset.checked_add(len).ok_or(HalError::OutOfBounds)?;
        if end > self.len {
            return Err(HalError::OutOfBounds);
        }
        Ok(DmaRegion {
            phys: self.phys.add(offset as u64),
            backing: self.backing.clone(),
            offset: self.offset + offset,
            len,
        })
    }

    /// Whether two views share the same backing memory
    pub fn same_allocation(&self, other: &DmaRegion) -> bool {
        core::ptr::eq(self.words().as_ptr(), other.words().as_ptr())
    }

    #[inline]
    fn check(&self, at: usize, size: usize) -> HalResult<usize> {
        match at.checked_add(size) {
            Some(end) if end <= self.len => Ok(self.offset + at),
            _ => Err(HalError::OutOfBounds),
        }
    }

    #[inline]
    fn byte(&self, abs: usize) -> u8 {
        let word = self.words()[abs / 4].load(Ordering::Acquire);
        (word >> ((abs % 4) * 8)) as u8
    }

    #[inline]
    fn set_byte(&self, abs: usize, value: u8) {
        let shift = (abs % 4) * 8;
        let mask = !(0xFFu32 << shift);
        let bits = (value as u32) << shift;
        let _ = self.words()[abs / 4].fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
            Some((w & mask) | bits)
        });
    }

    /// Read a byte
    pub fn read_u8(&self, at: usize) -> HalResult<u8> {
        let abs = self.check(at, 1)?;
        Ok(self.byte(abs))
    }

    /// Write a byte
    pub fn write_u8(&self, at: usize, value: u8) -> HalResult<()> {
        let abs = self.check(at, 1)?;
        self.set_byte(abs, value);
        Ok(())
    }

    /// Read a little-endian u16
    pub fn read_u16(&self, at: usize) -> HalResult<u16> {
        let abs = self.check(at, 2)?;
        Ok(u16::from_le_bytes([self.byte(abs), self.byte(abs + 1)]))
    }

    /// Write a little-endian u16
    pub fn write_u16(&self, at: usize, value: u16) -> HalResult<()> {
        let abs = self.check(at, 2)?;
        let [lo, hi] = value.to_le_bytes();
        self.set_byte(abs, lo);
        self.set_byte(abs + 1, hi);
        Ok(())
    }

    /// Read a little-endian u32
    ///
    /// Aligned reads are a single atomic load.
    pub fn read_u32(&self, at: usize) -> HalResult<u32> {
        let abs = self.check(at, 4)?;
        if abs % 4 == 0 {
            return Ok(self.words()[abs / 4].load(Ordering::Acquire));
        }
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.byte(abs + i);
        }
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write a little-endian u32
    ///
    /// Aligned writes are a single atomic store.
    pub fn write_u32(&self, at: usize, value: u32) -> HalResult<()> {
        let abs = self.check(at, 4)?;
        if abs % 4 == 0 {
            self.words()[abs / 4].store(value, Ordering::Release);
            return Ok(());
        }
        for (i, b) in value.to_le_bytes().iter().enumerate() {
            self.set_byte(abs + i, *b);
        }
        Ok(())
    }

    /// Read a little-endian u64 (low word first)
    pub fn read_u64(&self, at: usize) -> HalResult<u64> {
        let lo = self.read_u32(at)? as u64;
        let hi = self.read_u32(at + 4)? as u64;
        Ok(lo | (hi << 32))
    }

    /// Write a little-endian u64 (low word first)
    pub fn write_u64(&self, at: usize, value: u64) -> HalResult<()> {
        self.check(at, 8)?;
        self.write_u32(at, value as u32)?;
        self.write_u32(at + 4, (value >> 32) as u32)
    }

    /// Copy bytes out of the region
    pub fn read_bytes(&self, at: usize, out: &mut [u8]) -> HalResult<()> {
        let abs = self.check(at, out.len())?;
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.byte(abs + i);
        }
        Ok(())
    }

    /// Copy bytes into the region
    pub fn write_bytes(&self, at: usize, data: &[u8]) -> HalResult<()> {
        let abs = self.check(at, data.len())?;
        for (i, b) in data.iter().enumerate() {
            self.set_byte(abs + i, *b);
        }
        Ok(())
    }

    /// Read the whole region into a vector
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = alloc::vec![0u8; self.len];
        // Cannot fail: the range is the region itself.
        let _ = self.read_bytes(0, &mut out);
        out
    }

    /// Zero the whole region
    pub fn zero(&self) {
        self.fill(0, self.len, 0);
    }

    /// Fill `len` bytes starting at `at` with `value`
    ///
    /// Out-of-range requests are clamped to the region.
    pub fn fill(&self, at: usize, len: usize, value: u8) {
        let end = at.saturating_add(len).min(self.len);
        let mut pos = at.min(end);
        let word = u32::from_ne_bytes([value; 4]);
        while pos < end {
            let abs = self.offset + pos;
            if abs % 4 == 0 && end - pos >= 4 {
                self.words()[abs / 4].store(word, Ordering::Release);
                pos += 4;
            } else {
                self.set_byte(abs, value);
                pos += 1;
            }
        }
    }
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("phys", &self.phys)
            .field("virt", &self.virt())
            .field("len", &self.len)
            .finish()
    }
}

// =============================================================================
// Allocators
// =============================================================================

/// Source of coherent DMA memory
///
/// A host backed by real hardware maps coherent pages for the device and
/// hands each mapping out through [`DmaRegion::from_raw_parts`]; its
/// `free_coherent` recovers the mapping from [`DmaRegion::virt`] and
/// [`DmaRegion::phys`].
pub trait DmaAllocator: Send + Sync {
    /// Allocate a zeroed, coherent region of `size` bytes whose bus address
    /// is aligned to `align` (a power of two)
    fn alloc_coherent(&self, size: usize, align: usize) -> HalResult<DmaRegion>;

    /// Return a region to the allocator
    ///
    /// The device must no longer reference it.
    fn free_coherent(&self, region: &DmaRegion);

    /// Whether the allocator can hand out addresses above 4 GiB
    fn supports_64bit(&self) -> bool {
        false
    }
}

/// Base of the synthetic bus address space
const HOST_DMA_BASE: u64 = 0x1000_0000;

/// DMA allocator for hosts without an IOMMU-visible address space
///
/// Hands out synthetic, monotonically increasing bus addresses and keeps a
/// map from bus address to region so a device model can follow pointers
/// written into frames.
pub struct HostDmaAllocator {
    /// Next free bus address
    next: AtomicU64,
    /// Live allocations keyed by bus address
    regions: Mutex<BTreeMap<u64, DmaRegion>>,
    /// Whether addresses are placed above 4 GiB
    high_memory: bool,
}

impl HostDmaAllocator {
    /// Create an allocator placing regions below 4 GiB
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(HOST_DMA_BASE),
            regions: Mutex::new(BTreeMap::new()),
            high_memory: false,
        }
    }

    /// Create an allocator placing regions above 4 GiB
    pub const fn new_high() -> Self {
        Self {
            next: AtomicU64::new(HOST_DMA_BASE | (1 << 32)),
            regions: Mutex::new(BTreeMap::new()),
            high_memory: true,
        }
    }

    /// Resolve a bus address to the region containing it and the byte
    /// offset of the address within that region
    pub fn resolve(&self, phys: PhysAddr) -> Option<(DmaRegion, usize)> {
        let regions = self.regions.lock();
        let (base, region) = regions.range(..=phys.as_u64()).next_back()?;
        let offset = (phys.as_u64() - base) as usize;
        if offset < region.len() {
            Some((region.clone(), offset))
        } else {
            None
        }
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> usize {
        self.regions.lock().len()
    }
}

impl Default for HostDmaAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostDmaAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDmaAllocator")
            .field("next", &self.next.load(Ordering::Relaxed))
            .field("live", &self.live_allocations())
            .finish()
    }
}

impl DmaAllocator for HostDmaAllocator {
    fn alloc_coherent(&self, size: usize, align: usize) -> HalResult<DmaRegion> {
        if size == 0 || !align.is_power_of_two() {
            return Err(HalError::InvalidParameter);
        }
        let align = (align as u64).max(4);
        // Keep a guard gap so that off-by-one device accesses never land in
        // a neighbouring allocation.
        let span = (size as u64).saturating_add(align).saturating_add(64);
        let start = self.next.fetch_add(span, Ordering::Relaxed);
        let phys = PhysAddr::new(start).align_up(align);
        if !self.high_memory && !phys.add(size as u64).fits_32() {
            return Err(HalError::OutOfMemory);
        }

        let region = DmaRegion::heap(phys, size);
        self.regions.lock().insert(phys.as_u64(), region.clone());
        log::trace!("dma: allocated {} bytes at {}", size, phys);
        Ok(region)
    }

    fn free_coherent(&self, region: &DmaRegion) {
        let mut regions = self.regions.lock();
        let base = region.phys().as_u64();
        if regions.get(&base).is_some_and(|r| r.same_allocation(region)) {
            regions.remove(&base);
        }
    }

    fn supports_64bit(&self) -> bool {
        self.high_memory
    }
}

/// Bump allocator over one coherent window the host mapped for the device
///
/// Hosts that can set aside a single physically contiguous, coherent mapping
/// at probe time hand it to this allocator; every region is a
/// [`DmaRegion::from_raw_parts`] view into it. Freed space is not reused,
/// which suits the engine's allocate-at-attach, free-at-detach pattern.
pub struct WindowDmaAllocator {
    window: DmaRegion,
    /// Byte offset of the first unused byte
    next: Mutex<usize>,
    /// Live allocations
    live: AtomicU64,
}

impl WindowDmaAllocator {
    /// Manage `len` bytes at CPU address `virt`, bus address `phys`
    ///
    /// # Safety
    ///
    /// Same contract as [`DmaRegion::from_raw_parts`] for the whole window;
    /// the window must outlive every region handed out.
    pub unsafe fn new(virt: NonNull<u8>, phys: PhysAddr, len: usize) -> HalResult<Self> {
        // SAFETY: forwarded to the caller.
        let window = unsafe { DmaRegion::from_raw_parts(virt, phys, len) }?;
        Ok(Self {
            window,
            next: Mutex::new(0),
            live: AtomicU64::new(0),
        })
    }

    /// Bytes not yet handed out
    pub fn remaining(&self) -> usize {
        self.window.len() - *self.next.lock()
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for WindowDmaAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowDmaAllocator")
            .field("window", &self.window)
            .field("remaining", &self.remaining())
            .finish()
    }
}

impl DmaAllocator for WindowDmaAllocator {
    fn alloc_coherent(&self, size: usize, align: usize) -> HalResult<DmaRegion> {
        if size == 0 || !align.is_power_of_two() {
            return Err(HalError::InvalidParameter);
        }
        let align = (align as u64).max(4);
        let mut next = self.next.lock();
        let base = self.window.phys();
        let start = base.add(*next as u64).align_up(align);
        let offset = (start.as_u64() - base.as_u64()) as usize;
        let region = self.window.slice(offset, size).map_err(|_| HalError::OutOfMemory)?;
        *next = offset + size;
        drop(next);

        region.zero();
        self.live.fetch_add(1, Ordering::Relaxed);
        log::trace!("dma: window region of {} bytes at {} ({})", size, region.phys(), region.virt());
        Ok(region)
    }

    fn free_coherent(&self, region: &DmaRegion) {
        if region.same_allocation(&self.window) {
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn supports_64bit(&self) -> bool {
        !self.window.phys().add(self.window.len() as u64).fits_32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_le_accessors() {
        let region = DmaRegion::heap(PhysAddr::new(0x1000), 32);
        region.write_u32(0, 0xDEAD_BEEF).unwrap();
        assert_eq!(region.read_u8(0).unwrap(), 0xEF);
        assert_eq!(region.read_u16(2).unwrap(), 0xDEAD);

        region.write_u16(5, 0x1234).unwrap();
        assert_eq!(region.read_u8(5).unwrap(), 0x34);
        assert_eq!(region.read_u8(6).unwrap(), 0x12);

        region.write_u32(9, 0xA1B2_C3D4).unwrap();
        assert_eq!(region.read_u32(9).unwrap(), 0xA1B2_C3D4);

        region.write_u64(16, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(region.read_u32(16).unwrap(), 0x0506_0708);
        assert_eq!(region.read_u64(16).unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_region_bounds() {
        let region = DmaRegion::heap(PhysAddr::new(0x1000), 10);
        assert_eq!(region.read_u32(8), Err(HalError::OutOfBounds));
        assert_eq!(region.write_u8(10, 1), Err(HalError::OutOfBounds));
        assert!(region.read_u16(8).is_ok());
        assert!(region.slice(4, 7).is_err());
    }

    #[test]
    fn test_slice_shares_memory() {
        let region = DmaRegion::heap(PhysAddr::new(0x2000), 128);
        let frame = region.slice(64, 64).unwrap();
        assert_eq!(frame.phys(), PhysAddr::new(0x2040));
        frame.write_u32(4, 77).unwrap();
        assert_eq!(region.read_u32(68).unwrap(), 77);
        assert!(frame.same_allocation(&region));
    }

    #[test]
    fn test_fill_and_zero() {
        let region = DmaRegion::heap(PhysAddr::new(0x3000), 11);
        region.fill(1, 9, 0xFF);
        let bytes = region.to_vec();
        assert_eq!(bytes[0], 0);
        assert!(bytes[1..10].iter().all(|&b| b == 0xFF));
        assert_eq!(bytes[10], 0);
        region.zero();
        assert!(region.to_vec().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_host_allocator_resolve() {
        let alloc = HostDmaAllocator::new();
        let a = alloc.alloc_coherent(100, 64).unwrap();
        let b = alloc.alloc_coherent(16, 8).unwrap();
        assert!(a.phys().is_aligned(64));
        assert!(b.phys().as_u64() >= a.phys().as_u64() + 100);

        a.write_u8(10, 0x5A).unwrap();
        let (region, offset) = alloc.resolve(a.phys().add(10)).unwrap();
        assert_eq!(offset, 10);
        assert_eq!(region.read_u8(offset).unwrap(), 0x5A);

        assert!(alloc.resolve(a.phys().add(100)).is_none());
        alloc.free_coherent(&a);
        assert!(alloc.resolve(a.phys()).is_none());
        assert_eq!(alloc.live_allocations(), 1);
    }

    #[test]
    fn test_host_allocator_rejects_bad_requests() {
        let alloc = HostDmaAllocator::new();
        assert_eq!(alloc.alloc_coherent(0, 8).unwrap_err(), HalError::InvalidParameter);
        assert_eq!(alloc.alloc_coherent(8, 3).unwrap_err(), HalError::InvalidParameter);
    }

    #[test]
    fn test_high_allocator() {
        let alloc = HostDmaAllocator::new_high();
        let a = alloc.alloc_coherent(64, 64).unwrap();
        assert!(!a.phys().fits_32());
        assert!(alloc.supports_64bit());
    }

    /// Host memory for mapped-region tests
    fn host_words(count: usize) -> Vec<AtomicU32> {
        (0..count).map(|_| AtomicU32::new(0)).collect()
    }

    fn host_ptr(words: &[AtomicU32]) -> NonNull<u8> {
        NonNull::new(words.as_ptr() as *mut u8).unwrap()
    }

    #[test]
    fn test_mapped_views_share_host_memory() {
        let memory = host_words(16);
        let phys = PhysAddr::new(0x8000);
        let a = unsafe { DmaRegion::from_raw_parts(host_ptr(&memory), phys, 64) }.unwrap();
        let b = unsafe { DmaRegion::from_raw_parts(host_ptr(&memory), phys, 64) }.unwrap();

        a.write_u32(8, 0xCAFE_F00D).unwrap();
        assert_eq!(b.read_u32(8).unwrap(), 0xCAFE_F00D);
        assert_eq!(memory[2].load(Ordering::SeqCst), 0xCAFE_F00D);

        memory[3].store(0x0102_0304, Ordering::SeqCst);
        assert_eq!(a.read_u8(12).unwrap(), 0x04);
        assert!(a.same_allocation(&b));
        assert_eq!(a.virt(), VirtAddr::from_ptr(memory.as_ptr()));
        assert_eq!(a.slice(8, 8).unwrap().virt(), a.virt().add(8));
    }

    #[test]
    fn test_mapped_region_rejects_misaligned_memory() {
        let memory = host_words(4);
        let ptr = NonNull::new(host_ptr(&memory).as_ptr().wrapping_add(1)).unwrap();
        let err = unsafe { DmaRegion::from_raw_parts(ptr, PhysAddr::new(0x8001), 8) }.unwrap_err();
        assert_eq!(err, HalError::InvalidAddress);
    }

    #[test]
    fn test_window_allocator() {
        let memory = host_words(64);
        let phys = PhysAddr::new(0x9000);
        let alloc = unsafe { WindowDmaAllocator::new(host_ptr(&memory), phys, 256) }.unwrap();

        let a = alloc.alloc_coherent(10, 4).unwrap();
        let b = alloc.alloc_coherent(64, 64).unwrap();
        assert_eq!(a.phys(), phys);
        assert_eq!(b.phys(), PhysAddr::new(0x9040));
        assert_eq!(b.virt(), a.virt().add(64));
        assert_eq!(alloc.remaining(), 128);

        b.write_u32(4, 0x5A5A_5A5A).unwrap();
        assert_eq!(memory[17].load(Ordering::SeqCst), 0x5A5A_5A5A);

        assert_eq!(alloc.alloc_coherent(200, 4).unwrap_err(), HalError::OutOfMemory);
        assert_eq!(alloc.live_allocations(), 2);
        alloc.free_coherent(&a);
        assert_eq!(alloc.live_allocations(), 1);
        assert!(!alloc.supports_64bit());
    }
}
