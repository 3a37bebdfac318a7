//! # Time Source
//!
//! Monotonic milliseconds plus a sleeping primitive. Reset sequences, state
//! polling and blocking waits are all "write, sleep, poll, bounded retry";
//! [`poll_until`] is that loop.

/// Monotonic clock with sleep
pub trait Timer: Send + Sync {
    /// Milliseconds since an arbitrary fixed epoch
    fn now_ms(&self) -> u64;

    /// Sleep (or yield) for at least `ms` milliseconds
    ///
    /// Must not be called from interrupt context.
    fn sleep_ms(&self, ms: u64);
}

/// Poll `cond` every `interval_ms` until it holds or `timeout_ms` elapse
///
/// The condition is always evaluated at least once, and once more after the
/// last sleep. Returns whether the condition was met.
pub fn poll_until<F>(timer: &dyn Timer, timeout_ms: u64, interval_ms: u64, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let interval = interval_ms.max(1);
    let start = timer.now_ms();
    loop {
        if cond() {
            return true;
        }
        if timer.now_ms().saturating_sub(start) >= timeout_ms {
            return false;
        }
        timer.sleep_ms(interval);
    }
}
