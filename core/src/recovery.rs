//! # Online Controller Reset
//!
//! Recovery runs in two halves. [`Adapter::enter_recovery`] is safe in
//! interrupt context: it flips the adapter to ResetInProgress, parks every
//! request firmware owned on the deferred queue and posts a RECOVERY work
//! item. [`Adapter::recover`] runs from the deferred executor: chip reset,
//! READY handshake, INIT, then the deferred queue is replayed in FIFO order
//! and the event subscription is re-armed.
//!
//! A command that keeps faulting the controller is only replayed
//! `max_reissue_attempts` times. After that, or when any reset step fails,
//! the adapter is killed: CriticalError, firmware stopped, and every request
//! failed back with a disconnect status.

use crate::adapter::{Adapter, RecoveryState};
use crate::error::{CoreError, CoreResult};
use crate::firmware;
use crate::mfi::FwState;
use crate::pool::{CommandKind, CommandMeta, CommandState};
use crate::request::{HostStatus, IoResult};
use crate::workqueue::DeferredWork;
use core::mem;
use core::sync::atomic::Ordering;

impl Adapter {
    /// Start an online controller reset
    ///
    /// Returns false if a reset is already running, its replay has not
    /// finished yet, or the adapter is dead.
    pub(crate) fn enter_recovery(&self) -> bool {
        let ring = self.ring.hold();
        let mut hba = self.hba.lock();
        if hba.recovery != RecoveryState::Operational || !hba.replay_done {
            log::debug!("{}: reset already pending ({})", self.id, hba.recovery);
            return false;
        }

        if self.transport.marks_reset_in_consumer() {
            self.ring.mark_reset_in_progress(&ring);
        }
        self.transport.disable_intr();
        hba.recovery = RecoveryState::ResetInProgress;
        hba.replay_done = false;
        self.outstanding.store(0, Ordering::Release);

        for slot in self.pool.slots() {
            let mut meta = slot.meta.lock();
            if meta.state == CommandState::InFlight && meta.is_request() {
                meta.state = CommandState::Deferred;
                hba.deferred.push_back(slot.context());
            }
        }
        let deferred = hba.deferred.len();
        drop(hba);
        drop(ring);

        self.stats.record_reset();
        log::warn!("{}: reset in progress, {} commands deferred", self.id, deferred);
        self.work.schedule(DeferredWork::RECOVERY);
        true
    }

    /// Recovery worker
    pub(crate) fn recover(&self) {
        if self.state() != RecoveryState::ResetInProgress {
            return;
        }
        if let Err(e) = self.reset_and_replay() {
            log::error!("{}: controller reset failed: {}", self.id, e);
            self.kill_adapter();
            return;
        }

        // A fault raised while the replay was running found recovery locked out.
        if self.transport.fw_state() == FwState::Fault {
            self.stats.record_fault();
            log::warn!("{}: firmware faulted again during replay", self.id);
            self.enter_recovery();
        }
    }

    fn reset_and_replay(&self) -> CoreResult<()> {
        log::info!("{}: restarting faulted firmware", self.id);
        self.transport.disable_intr();
        self.outstanding.store(0, Ordering::Release);
        self.transport.adapter_reset(self.timer.as_ref())?;
        self.timer.sleep_ms(self.config.post_reset_delay_ms);

        firmware::transition_to_ready(
            self.transport.as_ref(),
            self.timer.as_ref(),
            self.id,
            self.config.fw_state_wait_ms,
            true,
        )?;
        self.ring.reset(self.transport.marks_reset_in_consumer());
        self.reclaim_stale();
        self.issue_init()?;

        self.hba.lock().recovery = RecoveryState::Operational;
        self.transport.enable_intr();
        log::info!("{}: firmware operational, replaying deferred commands", self.id);

        self.replay_deferred()?;
        self.rearm_events();
        Ok(())
    }

    /// Release commands the reset made meaningless
    ///
    /// Pending aborts and the event wait died with the old firmware
    /// instance; their waiters are woken with a failure.
    fn reclaim_stale(&self) {
        let stale = |meta: &CommandMeta| {
            meta.state == CommandState::InFlight
                && matches!(meta.kind, CommandKind::Abort | CommandKind::EventWait)
        };
        for context in 0..self.pool.len() as u32 {
            if let Some((handle, retired)) = self.pool.retire(context, stale) {
                log::debug!("{}: dropping stale {:?} command {}", self.id, retired.kind, context);
                self.pool.release(handle);
                retired.owner.fail(IoResult::host(HostStatus::Reset));
            }
        }
        self.aen.sub.lock().outstanding = None;
    }

    /// Reissue the deferred queue in FIFO order
    fn replay_deferred(&self) -> CoreResult<()> {
        let mut hba = self.hba.lock();
        let deferred = mem::take(&mut hba.deferred);
        let mut replayed = 0;

        for context in deferred {
            let Some(slot) = self.pool.slot(context) else {
                continue;
            };
            let mut meta = slot.meta.lock();
            if meta.state != CommandState::Deferred {
                continue;
            }
            if meta.orphaned {
                drop(meta);
                let orphan = |m: &CommandMeta| m.state == CommandState::Deferred;
                if let Some((handle, _)) = self.pool.retire(context, orphan) {
                    self.pool.release(handle);
                }
                continue;
            }

            meta.reissues = meta.reissues.saturating_add(1);
            if meta.reissues >= self.config.max_reissue_attempts {
                log::error!(
                    "{}: command {} faulted the controller {} times, giving up",
                    self.id,
                    context,
                    meta.reissues
                );
                return Err(CoreError::ResetFailed);
            }
            drop(meta);

            self.outstanding.fetch_add(1, Ordering::AcqRel);
            self.fire_slot(slot);
            self.stats.record_reissued();
            replayed += 1;
        }

        hba.replay_done = true;
        drop(hba);
        log::info!("{}: {} commands reissued", self.id, replayed);
        Ok(())
    }

    /// Take the adapter offline for good
    ///
    /// Stops firmware and fails back every deferred and in-flight request
    /// with a disconnect status. Idempotent.
    pub(crate) fn kill_adapter(&self) {
        {
            let mut hba = self.hba.lock();
            if hba.recovery == RecoveryState::CriticalError {
                return;
            }
            hba.recovery = RecoveryState::CriticalError;
            hba.accepting = false;
            hba.replay_done = true;
            hba.deferred.clear();
        }
        log::error!("{}: adapter is offline", self.id);
        self.transport.stop_adapter();
        self.transport.disable_intr();
        self.outstanding.store(0, Ordering::Release);

        let live = |meta: &CommandMeta| {
            matches!(meta.state, CommandState::InFlight | CommandState::Deferred)
                && meta.kind != CommandKind::Init
        };
        let mut failed = 0;
        for context in 0..self.pool.len() as u32 {
            let Some((handle, retired)) = self.pool.retire(context, live) else {
                continue;
            };
            self.pool.release(handle);
            let counted = matches!(retired.kind, CommandKind::Io | CommandKind::Management);
            if counted && !retired.orphaned {
                self.stats.record_failed_back();
                failed += 1;
            }
            retired.owner.fail(IoResult::host(HostStatus::NoConnect));
        }
        self.aen.sub.lock().outstanding = None;
        log::error!("{}: {} commands failed back", self.id, failed);
    }

    // =========================================================================
    // Host reset entry point
    // =========================================================================

    /// Host-initiated reset (midlayer error handling)
    ///
    /// Waits for firmware to return every outstanding request, pumping
    /// completions meanwhile. If it does not, the controller is reset; if
    /// even that leaves requests outstanding the adapter is killed and
    /// [`CoreError::ResetFailed`] returned.
    pub fn reset_adapter(&self) -> CoreResult<()> {
        match self.state() {
            RecoveryState::CriticalError => return Err(CoreError::Offline),
            RecoveryState::ResetInProgress => return self.wait_for_reset(),
            RecoveryState::Operational => {}
        }

        self.hba.lock().throttle.in_task_mgmt = true;
        let result = self.wait_for_outstanding();
        self.hba.lock().throttle.in_task_mgmt = false;
        result
    }

    /// A reset is already running: wait for it, then settle what it left
    fn wait_for_reset(&self) -> CoreResult<()> {
        let iterations = self.config.reset_wait_iterations;
        for _ in 0..iterations {
            if self.state() != RecoveryState::ResetInProgress {
                break;
            }
            self.run_deferred();
            self.timer.sleep_ms(self.config.reset_poll_interval_ms);
        }
        match self.state() {
            RecoveryState::Operational => Ok(()),
            RecoveryState::CriticalError => Err(CoreError::Offline),
            RecoveryState::ResetInProgress => {
                log::error!("{}: reset did not finish, failing deferred commands", self.id);
                self.kill_adapter();
                Err(CoreError::ResetFailed)
            }
        }
    }

    fn wait_for_outstanding(&self) -> CoreResult<()> {
        if self.drain_outstanding() {
            return Ok(());
        }

        log::warn!(
            "{}: {} commands still outstanding, resetting controller",
            self.id,
            self.outstanding()
        );
        if self.config.ocr_enabled && self.enter_recovery() {
            self.run_deferred();
            if self.state() == RecoveryState::Operational && self.drain_outstanding() {
                return Ok(());
            }
        }
        if self.state() == RecoveryState::CriticalError {
            return Err(CoreError::ResetFailed);
        }

        log::error!("{}: firmware did not return outstanding commands", self.id);
        self.kill_adapter();
        Err(CoreError::ResetFailed)
    }

    /// Wait until firmware owns no requests; false if the wait ran out
    fn drain_outstanding(&self) -> bool {
        for i in 0..self.config.reset_wait_iterations {
            let outstanding = self.outstanding();
            if outstanding == 0 {
                return true;
            }
            if i % self.config.reset_notice_interval == 0 {
                log::info!("{}: waiting for {} commands to complete", self.id, outstanding);
                self.complete_pending();
            }
            self.timer.sleep_ms(self.config.reset_poll_interval_ms);
        }
        self.outstanding() == 0
    }
}

#[cfg(test)]
mod tests {
    use crate::adapter::RecoveryState;
    use crate::config::AdapterConfig;
    use crate::error::CoreError;
    use crate::request::{HostStatus, IoRequest};
    use crate::sim::Harness;
    use alloc::vec::Vec;
    use megasas_hal::IrqReturn;

    fn read10(lba: u8) -> IoRequest {
        IoRequest::new(0, 0, &[0x28, 0, 0, 0, 0, lba, 0, 0, 1, 0]).unwrap()
    }

    #[test]
    fn test_fault_defers_in_flight_requests() {
        let h = Harness::new();
        h.sim.set_hold(true);
        let tickets: Vec<_> = (0..3).map(|i| h.adapter.submit_io(read10(i)).unwrap()).collect();
        h.sim.inject_fault();

        assert_eq!(h.adapter.handle_interrupt(), IrqReturn::WakeThread);
        assert_eq!(h.adapter.state(), RecoveryState::ResetInProgress);
        assert_eq!(h.adapter.deferred_len(), 3);
        assert_eq!(h.adapter.outstanding(), 0);
        assert_eq!(h.adapter.submit_io(read10(9)).unwrap_err(), CoreError::QueueBusy);
        assert!(tickets.iter().all(|t| !t.is_complete()));
    }

    #[test]
    fn test_second_fault_is_ignored_while_resetting() {
        let h = Harness::new();
        h.sim.inject_fault();
        assert_eq!(h.adapter.handle_interrupt(), IrqReturn::WakeThread);
        h.sim.inject_fault();
        assert_eq!(h.adapter.handle_interrupt(), IrqReturn::Handled);
        assert_eq!(h.adapter.statistics().resets, 1);
    }

    #[test]
    fn test_fault_without_ocr_kills() {
        let h = Harness::with_config(AdapterConfig {
            ocr_enabled: false,
            ..Harness::config()
        });
        h.sim.set_hold(true);
        let mut ticket = h.adapter.submit_io(read10(0)).unwrap();
        h.sim.inject_fault();
        h.pump();
        assert_eq!(h.adapter.state(), RecoveryState::CriticalError);
        assert_eq!(ticket.try_take().unwrap().host, HostStatus::NoConnect);
        assert!(h.sim.stopped());
    }

    #[test]
    fn test_kill_is_idempotent() {
        let h = Harness::new();
        h.sim.set_hold(true);
        let _ticket = h.adapter.submit_io(read10(0)).unwrap();
        h.adapter.kill_adapter();
        h.adapter.kill_adapter();
        let stats = h.adapter.statistics();
        assert_eq!(stats.failed_back, 1);
        assert_eq!(stats.in_flight(), 0);
        assert_eq!(h.adapter.submit_io(read10(1)).unwrap_err(), CoreError::Offline);
    }

    #[test]
    fn test_reset_adapter_waits_for_completions() {
        let h = Harness::new();
        let mut ticket = h.adapter.submit_io(read10(0)).unwrap();
        h.adapter.reset_adapter().unwrap();
        assert!(ticket.try_take().unwrap().is_ok());
        assert_eq!(h.adapter.statistics().resets, 0);
    }

    #[test]
    fn test_reset_adapter_escalates_when_stuck() {
        let h = Harness::new();
        h.sim.set_hold(true);
        let mut ticket = h.adapter.submit_io(read10(0)).unwrap();
        h.sim.set_hold(false);
        // The reset forgets held frames; the replay then completes.
        h.adapter.reset_adapter().unwrap();
        assert_eq!(h.adapter.statistics().resets, 1);
        assert!(ticket.try_take().unwrap().is_ok());
        assert_eq!(h.adapter.state(), RecoveryState::Operational);
    }

    #[test]
    fn test_reset_adapter_on_dead_adapter() {
        let h = Harness::new();
        h.adapter.kill_adapter();
        assert_eq!(h.adapter.reset_adapter(), Err(CoreError::Offline));
    }
}
