//! # Deferred Work
//!
//! The interrupt handler never drains the ring or resets the chip itself.
//! It posts a work item here and returns [`megasas_hal::IrqReturn::WakeThread`];
//! the host then calls [`crate::Adapter::run_deferred`] from thread context.
//!
//! Posting is idempotent (work items are bits), and at most one context
//! runs the executor at a time. The executor keeps pulling items until
//! none are pending, so an item posted while it runs is never lost.

use bitflags::bitflags;
use megasas_hal::IrqMutex;

bitflags! {
    /// Work items for the deferred executor
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeferredWork: u8 {
        /// Drain the reply ring (bottom half)
        const COMPLETIONS = 0x1;
        /// Run the online controller reset
        const RECOVERY = 0x2;
    }
}

struct WorkState {
    pending: DeferredWork,
    running: bool,
}

/// Pending work plus executor ownership
pub struct WorkQueue {
    state: IrqMutex<WorkState>,
}

impl WorkQueue {
    /// Create an empty queue
    pub const fn new() -> Self {
        Self {
            state: IrqMutex::new(WorkState {
                pending: DeferredWork::empty(),
                running: false,
            }),
        }
    }

    /// Post work; returns whether any of it was not already pending
    pub fn schedule(&self, work: DeferredWork) -> bool {
        let mut state = self.state.lock();
        let fresh = !state.pending.contains(work);
        state.pending |= work;
        fresh
    }

    /// Currently pending work
    pub fn pending(&self) -> DeferredWork {
        self.state.lock().pending
    }

    /// Whether an executor is running
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Become the executor; false if another context already is
    pub(crate) fn begin(&self) -> bool {
        let mut state = self.state.lock();
        if state.running {
            return false;
        }
        state.running = true;
        true
    }

    /// Next item for the executor, recovery first
    ///
    /// Gives up executor ownership when nothing is pending.
    pub(crate) fn next(&self) -> Option<DeferredWork> {
        let mut state = self.state.lock();
        for item in [DeferredWork::RECOVERY, DeferredWork::COMPLETIONS] {
            if state.pending.contains(item) {
                state.pending.remove(item);
                return Some(item);
            }
        }
        state.running = false;
        None
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WorkQueue")
            .field("pending", &state.pending)
            .field("running", &state.running)
            .finish()
    }
}
