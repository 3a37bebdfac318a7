//! # Interrupt Handling
//!
//! Return codes for device interrupt handlers, local interrupt masking and
//! the lock the engine shares between its interrupt handler and thread
//! context.
//!
//! A host whose device handlers run in hard interrupt context installs an
//! [`InterruptControl`] once with [`install`]. Every [`IrqMutex`] then masks
//! local interrupts for as long as it is held, so a handler can never spin on
//! a lock owned by the thread it interrupted. Hosts that run handlers in a
//! thread (threaded IRQs, user-space drivers, test benches) install nothing
//! and the lock is a plain spinlock.

use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard, Once};

// =============================================================================
// Interrupt masking
// =============================================================================

/// Local interrupt masking provided by the host
pub trait InterruptControl: Send + Sync {
    /// Mask interrupts on the current CPU, returning whether they were enabled
    fn save_and_disable(&self) -> bool;

    /// Restore the state returned by [`InterruptControl::save_and_disable`]
    fn restore(&self, was_enabled: bool);
}

static CONTROL: Once<&'static dyn InterruptControl> = Once::new();

/// Install the host's interrupt masking
///
/// Only the first call takes effect. Returns whether `control` is the one
/// in use.
pub fn install(control: &'static dyn InterruptControl) -> bool {
    let installed: *const dyn InterruptControl = *CONTROL.call_once(|| control);
    core::ptr::addr_eq(installed, control as *const dyn InterruptControl)
}

/// Saved local interrupt state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct IrqState(bool);

impl IrqState {
    /// Mask local interrupts and remember the previous state
    #[inline]
    pub fn save() -> Self {
        Self(CONTROL.get().is_some_and(|c| c.save_and_disable()))
    }

    /// Put the saved state back
    #[inline]
    pub fn restore(self) {
        if let Some(control) = CONTROL.get() {
            control.restore(self.0);
        }
    }
}

/// Run `f` with local interrupts masked
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let state = IrqState::save();
    let result = f();
    state.restore();
    result
}

// =============================================================================
// IRQ-safe lock
// =============================================================================

/// Spinlock that masks local interrupts while held
pub struct IrqMutex<T: ?Sized> {
    inner: Mutex<T>,
}

impl<T> IrqMutex<T> {
    /// Create a new lock
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }
}

impl<T: ?Sized> IrqMutex<T> {
    /// Mask local interrupts, then take the lock
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let irq = IrqState::save();
        IrqMutexGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            irq,
        }
    }
}

impl<T: Default> Default for IrqMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for IrqMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

/// Guard of an [`IrqMutex`]
///
/// Dropping it releases the lock before interrupts are unmasked.
pub struct IrqMutexGuard<'a, T: ?Sized> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    irq: IrqState,
}

impl<T: ?Sized> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: ?Sized> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: ?Sized> Drop for IrqMutexGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the guard is dropped exactly once, here, and never used
        // again.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.irq.restore();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for IrqMutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

// =============================================================================
// Handler return codes
// =============================================================================

/// Result of running a device interrupt handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// The interrupt was not raised by this device
    None,
    /// The interrupt was handled completely in the handler
    Handled,
    /// The interrupt was acknowledged and deferred work must run
    WakeThread,
}

impl IrqReturn {
    /// Whether the device claimed the interrupt
    #[inline]
    pub const fn is_handled(self) -> bool {
        !matches!(self, IrqReturn::None)
    }

    /// Whether the host must schedule the device's deferred work
    #[inline]
    pub const fn needs_thread(self) -> bool {
        matches!(self, IrqReturn::WakeThread)
    }
}
