//! # Blocking Commands
//!
//! Thread-context helpers on top of the ticket interface: wait for a
//! management command with a timeout, abort a command that does not come
//! back, and issue polled frames that bypass the reply queue altogether.
//!
//! A blocking wait that times out first tries to abort its command. If the
//! abort is refused or lost the adapter is escalated to a controller reset,
//! after which the command gets one more wait. A command that is still out
//! after that is abandoned: its context stays reserved until firmware
//! returns it, so the slot is never reused while firmware may write to it.

use crate::adapter::Adapter;
use crate::error::{CoreError, CoreResult};
use crate::frame::{encode_abort, hdr, prepare_polled, read_status};
use crate::mfi::*;
use crate::pool::{CommandHandle, CommandKind, CommandState, Owner};
use crate::request::{Completion, ManagementRequest, ManagementResult, Ticket};
use alloc::sync::Arc;
use megasas_hal::poll_until;

/// Poll interval of blocking waits
const BLOCKING_POLL_INTERVAL_MS: u64 = 10;

/// Poll interval of polled frames
const POLLED_INTERVAL_MS: u64 = 1;

impl Adapter {
    /// Submit a management action and wait for it
    ///
    /// On timeout the command is aborted and [`CoreError::Timeout`] is
    /// returned; the caller never sees a late result.
    pub fn submit_blocking(
        &self,
        request: ManagementRequest,
        timeout_ms: u64,
    ) -> CoreResult<ManagementResult> {
        let mut ticket = self.submit_management(request)?;
        if let Some(result) = self.wait_ticket(&mut ticket, timeout_ms) {
            return result;
        }
        log::warn!(
            "{}: command {} timed out after {} ms",
            self.id,
            ticket.context(),
            timeout_ms
        );
        self.give_up(&mut ticket, timeout_ms)
    }

    /// Abort the command behind `ticket`
    ///
    /// Succeeds if firmware aborted the command or had already completed it.
    /// An aborted I/O resolves with [`crate::HostStatus::Reset`].
    pub fn abort<T>(&self, ticket: &Ticket<T>) -> CoreResult<()> {
        self.abort_command(ticket.context(), ticket.generation())
    }

    pub(crate) fn wait_ticket<T>(&self, ticket: &mut Ticket<T>, timeout_ms: u64) -> Option<T> {
        let mut result = None;
        poll_until(self.timer.as_ref(), timeout_ms, BLOCKING_POLL_INTERVAL_MS, || {
            result = ticket.try_take();
            result.is_some()
        });
        result
    }

    fn give_up(
        &self,
        ticket: &mut Ticket<CoreResult<ManagementResult>>,
        timeout_ms: u64,
    ) -> CoreResult<ManagementResult> {
        let (context, generation) = (ticket.context(), ticket.generation());
        for attempt in 1..=self.config.abort_retries {
            match self.abort_command(context, generation) {
                Ok(()) => {
                    let _ = ticket.try_take();
                    self.orphan(context, generation);
                    return Err(CoreError::Timeout);
                }
                Err(e) => {
                    log::warn!(
                        "{}: abort of command {} failed (attempt {}): {}",
                        self.id,
                        context,
                        attempt,
                        e
                    );
                }
            }
        }

        if self.config.ocr_enabled && self.enter_recovery() {
            log::warn!("{}: command {} stuck, resetting controller", self.id, context);
            self.run_deferred();
            if let Some(result) = self.wait_ticket(ticket, timeout_ms) {
                return result;
            }
        }
        if self.orphan(context, generation) {
            log::error!("{}: abandoning command {}", self.id, context);
        } else {
            // Resolved while we were escalating; the caller still timed out.
            let _ = ticket.try_take();
        }
        Err(CoreError::Timeout)
    }

    /// Stop waiting for a command; firmware may still return it later
    ///
    /// Returns false if the command already resolved.
    pub(crate) fn orphan(&self, context: u32, generation: u32) -> bool {
        let Some(slot) = self.pool.slot(context) else {
            return false;
        };
        let state = {
            let mut meta = slot.meta.lock();
            let live = matches!(meta.state, CommandState::InFlight | CommandState::Deferred);
            if meta.generation != generation || !live || meta.orphaned {
                return false;
            }
            meta.orphaned = true;
            meta.owner = Owner::None;
            meta.state
        };
        // Deferred commands were already dropped from the count.
        if state == CommandState::InFlight {
            self.release_outstanding();
        }
        self.stats.record_aborted();
        true
    }

    /// Issue an ABORT for the command at `context` and wait for it
    pub(crate) fn abort_command(&self, context: u32, generation: u32) -> CoreResult<()> {
        let target = self.pool.slot(context).ok_or(CoreError::InvalidRequest)?;
        {
            let mut meta = target.meta.lock();
            if meta.generation != generation || meta.state != CommandState::InFlight {
                log::debug!("{}: command {} no longer in flight, nothing to abort", self.id, context);
                return Ok(());
            }
            meta.abort_requested = true;
        }

        let result = self.issue_abort(context, target.frame_phys());
        if result.is_err() {
            let mut meta = target.meta.lock();
            if meta.generation == generation {
                meta.abort_requested = false;
            }
        }
        result
    }

    fn issue_abort(&self, context: u32, frame: megasas_hal::PhysAddr) -> CoreResult<()> {
        let handle = self.pool.acquire_internal().ok_or(CoreError::NoCommand)?;
        let slot = self.pool.get(&handle);
        if let Err(e) = encode_abort(slot.frame(), handle.context(), context, frame) {
            self.pool.release(handle);
            return Err(e.into());
        }

        let done = Arc::new(Completion::new());
        {
            let mut meta = slot.meta.lock();
            meta.kind = CommandKind::Abort;
            meta.owner = Owner::Abort(Arc::clone(&done));
        }
        let mut ticket = Ticket::new(done, handle.context(), handle.generation());
        if let Err(e) = self.issue(&handle, false) {
            self.pool.release(handle);
            return Err(e);
        }
        log::debug!("{}: aborting command {} with {}", self.id, context, handle.context());

        match self.wait_ticket(&mut ticket, self.config.abort_timeout_ms) {
            Some(MFI_STAT_OK) => Ok(()),
            Some(MFI_STAT_NOT_FOUND) => {
                log::debug!("{}: command {} completed before the abort", self.id, context);
                Ok(())
            }
            Some(status) => {
                log::warn!("{}: abort of {} rejected ({:#04x})", self.id, context, status);
                Err(CoreError::AbortFailed)
            }
            None => Err(CoreError::AbortFailed),
        }
    }

    /// Fire a frame with DONT_POST set and poll its status byte
    ///
    /// Bypasses admission and the reply queue; used before the queue exists
    /// and while a reset is bringing firmware back.
    pub(crate) fn issue_polled(&self, handle: &CommandHandle, timeout_ms: u64) -> CoreResult<u8> {
        let slot = self.pool.get(handle);
        prepare_polled(slot.frame())?;
        {
            let _hba = self.hba.lock();
            self.fire_slot(slot);
        }

        let frame = slot.frame();
        let done = poll_until(self.timer.as_ref(), timeout_ms, POLLED_INTERVAL_MS, || {
            frame.read_u8(hdr::CMD_STATUS).unwrap_or(MFI_STAT_INVALID_STATUS)
                != MFI_STAT_INVALID_STATUS
        });
        slot.meta.lock().state = CommandState::Prepared;
        if !done {
            log::error!("{}: polled command {} timed out", self.id, handle.context());
            return Err(CoreError::Timeout);
        }
        Ok(read_status(frame)?.cmd_status)
    }

    /// Flush controller and disk caches
    pub(crate) fn flush_cache(&self) -> CoreResult<()> {
        let mut mbox = [0u8; 12];
        mbox[0] = MR_FLUSH_CTRL_CACHE | MR_FLUSH_DISK_CACHE;
        let request = ManagementRequest::dcmd(MR_DCMD_CTRL_CACHE_FLUSH, mbox);
        self.submit_blocking(request, self.config.internal_cmd_timeout_ms)?
            .into_result()
            .map(|_| ())
    }

    /// Tell firmware the host is going away
    pub(crate) fn shutdown_controller(&self) -> CoreResult<()> {
        let request = ManagementRequest::dcmd(MR_DCMD_CTRL_SHUTDOWN, [0; 12]);
        self.submit_blocking(request, self.config.internal_cmd_timeout_ms)?
            .into_result()
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use crate::adapter::RecoveryState;
    use crate::config::AdapterConfig;
    use crate::error::CoreError;
    use crate::mfi::*;
    use crate::request::{HostStatus, IoRequest, ManagementRequest};
    use crate::sim::Harness;

    fn read10() -> IoRequest {
        IoRequest::new(0, 0, &[0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0]).unwrap()
    }

    #[test]
    fn test_blocking_dcmd_completes() {
        let h = Harness::new();
        let result = h
            .adapter
            .submit_blocking(ManagementRequest::dcmd(MR_DCMD_CTRL_GET_INFO, [0; 12]), 1_000)
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(h.adapter.outstanding(), 0);
    }

    #[test]
    fn test_unknown_dcmd_reports_status() {
        let h = Harness::new();
        let result = h
            .adapter
            .submit_blocking(ManagementRequest::dcmd(0x0BAD_0000, [0; 12]), 1_000)
            .unwrap();
        assert_eq!(result.status, MFI_STAT_INVALID_DCMD);
        assert_eq!(result.into_result().unwrap_err(), CoreError::CommandFailed { status: MFI_STAT_INVALID_DCMD });
    }

    #[test]
    fn test_abort_in_flight_io() {
        let h = Harness::new();
        h.sim.set_hold(true);
        let mut ticket = h.adapter.submit_io(read10()).unwrap();
        h.adapter.abort(&ticket).unwrap();
        let result = ticket.try_take().unwrap();
        assert_eq!(result.host, HostStatus::Reset);
        assert_eq!(h.adapter.outstanding(), 0);
    }

    #[test]
    fn test_abort_after_completion_is_noop() {
        let h = Harness::new();
        let mut ticket = h.adapter.submit_io(read10()).unwrap();
        h.pump();
        assert!(ticket.try_take().is_some());
        assert_eq!(h.adapter.abort(&ticket), Ok(()));
    }

    #[test]
    fn test_timeout_aborts_and_frees_slot() {
        let h = Harness::new();
        h.sim.set_hold(true);
        let free = h.adapter.pool().free_count();
        let err = h
            .adapter
            .submit_blocking(ManagementRequest::dcmd(MR_DCMD_LD_GET_LIST, [0; 12]), 100)
            .unwrap_err();
        assert_eq!(err, CoreError::Timeout);
        assert_eq!(h.adapter.pool().free_count(), free);
        assert_eq!(h.adapter.outstanding(), 0);
        assert_eq!(h.adapter.state(), RecoveryState::Operational);
        let stats = h.adapter.statistics();
        assert_eq!(stats.in_flight(), 0);
    }

    #[test]
    fn test_failed_abort_escalates_to_reset() {
        let h = Harness::with_config(AdapterConfig {
            abort_retries: 1,
            ..Harness::config()
        });
        h.sim.set_hold(true);
        h.sim.set_ignore_aborts(true);
        let err = h
            .adapter
            .submit_blocking(ManagementRequest::dcmd(MR_DCMD_LD_GET_LIST, [0; 12]), 100)
            .unwrap_err();
        // The replayed frame is held again, so the caller times out and the
        // command is abandoned.
        assert_eq!(err, CoreError::Timeout);
        let stats = h.adapter.statistics();
        assert_eq!(stats.resets, 1);
        assert_eq!(stats.reissued, 1);
        assert_eq!(h.sim.reset_count(), 1);
        assert_eq!(h.adapter.state(), RecoveryState::Operational);
        assert_eq!(h.adapter.outstanding(), 0);
    }

    #[test]
    fn test_orphaned_reply_is_discarded() {
        let h = Harness::new();
        h.sim.set_hold(true);
        let ticket = h
            .adapter
            .submit_management(ManagementRequest::dcmd(MR_DCMD_LD_GET_LIST, [0; 12]))
            .unwrap();
        let free = h.adapter.pool().free_count();
        assert!(h.adapter.orphan(ticket.context(), ticket.generation()));
        assert!(!h.adapter.orphan(ticket.context(), ticket.generation()));
        assert_eq!(h.adapter.outstanding(), 0);
        // Context stays reserved until firmware hands it back.
        assert_eq!(h.adapter.pool().free_count(), free);

        h.sim.release_held();
        h.pump();
        assert_eq!(h.adapter.pool().free_count(), free + 1);
        assert!(!ticket.is_complete());
        let stats = h.adapter.statistics();
        assert_eq!(stats.aborted, 1);
        assert_eq!(stats.in_flight(), 0);
    }

    #[test]
    fn test_polled_timeout() {
        let h = Harness::new();
        h.sim.set_ignore_polled(true);
        let handle = h.adapter.pool().acquire_internal().unwrap();
        crate::frame::encode_dcmd(
            h.adapter.pool().get(&handle).frame(),
            handle.context(),
            MR_DCMD_CTRL_GET_INFO,
            &[0; 12],
            crate::frame::DataDirection::None,
            h.adapter.sgl_format(),
            &[],
        )
        .unwrap();
        assert_eq!(h.adapter.issue_polled(&handle, 20), Err(CoreError::Timeout));
        h.adapter.pool().release(handle);
    }
}
