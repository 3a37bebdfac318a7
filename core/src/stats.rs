//! # Adapter Statistics
//!
//! Lock-free counters updated on the submission, completion and recovery
//! paths. Every request that was submitted ends up in exactly one of
//! `completed`, `aborted` or `failed_back`.

use core::sync::atomic::{AtomicU64, Ordering};

/// Live counters
#[derive(Default)]
pub(crate) struct AdapterStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
    failed_back: AtomicU64,
    reissued: AtomicU64,
    resets: AtomicU64,
    faults: AtomicU64,
    events: AtomicU64,
    busy_rejections: AtomicU64,
    protocol_errors: AtomicU64,
}

impl AdapterStats {
    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_back(&self) {
        self.failed_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reissued(&self) {
        self.reissued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_busy(&self) {
        self.busy_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> AdapterStatistics {
        AdapterStatistics {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            failed_back: self.failed_back.load(Ordering::Relaxed),
            reissued: self.reissued.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            busy_rejections: self.busy_rejections.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterStatistics {
    /// Requests accepted (I/O and management)
    pub submitted: u64,
    /// Requests completed by firmware
    pub completed: u64,
    /// Requests given up after a timeout and abort
    pub aborted: u64,
    /// Requests failed back without firmware completion
    pub failed_back: u64,
    /// Reissues after controller resets
    pub reissued: u64,
    /// Online controller resets started
    pub resets: u64,
    /// Firmware faults observed
    pub faults: u64,
    /// Events delivered
    pub events: u64,
    /// Submissions refused with a busy status
    pub busy_rejections: u64,
    /// Out-of-range contexts seen on the reply ring
    pub protocol_errors: u64,
}

impl AdapterStatistics {
    /// Requests not yet resolved
    pub fn in_flight(&self) -> u64 {
        self.submitted
            .saturating_sub(self.completed + self.aborted + self.failed_back)
    }
}
