//! # Submission Path
//!
//! Admission, frame encoding and firing. Every caller request becomes one
//! command of the pool; its ticket is returned as soon as the frame has been
//! handed to firmware.
//!
//! Admission is checked twice: once for midlayer I/O before a command is
//! taken (recovery state, throttle, queue depth), and once more under the
//! hba lock right before `fire`, so nothing reaches firmware after the
//! adapter has left Operational.

use crate::adapter::{Adapter, RecoveryState};
use crate::error::{CoreError, CoreResult};
use crate::frame::{
    encode_dcmd, encode_ldio, encode_pthru, parse_rw_cdb, DataDirection, DataFrame, SgElement,
    SglFormat,
};
use crate::pool::{CommandHandle, CommandKind, CommandSlot, CommandState, Owner};
use crate::request::{Completion, IoRequest, IoResult, ManagementRequest, ManagementResult, Ticket};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

impl Adapter {
    /// Submit a midlayer SCSI command
    ///
    /// Returns [`CoreError::QueueBusy`] while a reset runs or the throttle
    /// is engaged, [`CoreError::NoCommand`] when the I/O share of the pool
    /// is exhausted and [`CoreError::Offline`] once the adapter is dead.
    /// All three leave the request with the caller.
    pub fn submit_io(&self, request: IoRequest) -> CoreResult<Ticket<IoResult>> {
        self.admit_io(request.retries)?;
        if request.sgl.len() > self.max_sge as usize {
            log::warn!(
                "{}: {} SGEs exceed the adapter limit of {}",
                self.id,
                request.sgl.len(),
                self.max_sge
            );
            return Err(CoreError::InvalidRequest);
        }

        let handle = self.pool.acquire().ok_or_else(|| {
            log::debug!("{}: no free command for target {}", self.id, request.target);
            CoreError::NoCommand
        })?;
        let slot = self.pool.get(&handle);
        let frame_count = match self.encode_io(slot, &request) {
            Ok(count) => count,
            Err(e) => {
                self.pool.release(handle);
                return Err(e);
            }
        };

        let done = Arc::new(Completion::new());
        {
            let mut meta = slot.meta.lock();
            meta.kind = CommandKind::Io;
            meta.owner = Owner::Io(Arc::clone(&done));
            meta.frame_count = frame_count;
        }
        let ticket = Ticket::new(done, handle.context(), handle.generation());
        if let Err(e) = self.issue(&handle, true) {
            self.pool.release(handle);
            return Err(e);
        }
        log::trace!(
            "{}: cmd {} -> target {} ({:#04x})",
            self.id,
            handle.context(),
            request.target,
            request.cdb[0]
        );
        // Firmware owns the command until its context comes back.
        Ok(ticket)
    }

    /// Submit a management action (DCMD or pass-through)
    ///
    /// Draws from the whole pool, headroom included, and bypasses the
    /// throttle. The ticket resolves to `Err(Offline)` if the adapter dies
    /// first.
    pub fn submit_management(
        &self,
        request: ManagementRequest,
    ) -> CoreResult<Ticket<CoreResult<ManagementResult>>> {
        self.admit_management()?;
        let handle = self.pool.acquire_internal().ok_or(CoreError::NoCommand)?;
        let slot = self.pool.get(&handle);
        let frame_count = match self.encode_management(slot, &request) {
            Ok(count) => count,
            Err(e) => {
                self.pool.release(handle);
                return Err(e);
            }
        };

        let done = Arc::new(Completion::new());
        {
            let mut meta = slot.meta.lock();
            meta.kind = CommandKind::Management;
            meta.owner = Owner::Management(Arc::clone(&done));
            meta.frame_count = frame_count;
            meta.buffer = request.buffer().cloned();
        }
        let ticket = Ticket::new(done, handle.context(), handle.generation());
        if let Err(e) = self.issue(&handle, true) {
            self.pool.release(handle);
            return Err(e);
        }
        Ok(ticket)
    }

    /// Hand a prepared command to firmware
    ///
    /// `counted` commands (I/O and management) add to the outstanding count.
    pub(crate) fn issue(&self, handle: &CommandHandle, counted: bool) -> CoreResult<()> {
        let slot = self.pool.get(handle);
        let hba = self.hba.lock();
        match hba.recovery {
            RecoveryState::Operational => {}
            RecoveryState::ResetInProgress => {
                self.stats.record_busy();
                return Err(CoreError::QueueBusy);
            }
            RecoveryState::CriticalError => return Err(CoreError::Offline),
        }

        let extra = {
            let mut meta = slot.meta.lock();
            meta.state = CommandState::InFlight;
            meta.frame_count.saturating_sub(1)
        };
        if counted {
            self.outstanding.fetch_add(1, Ordering::AcqRel);
            self.stats.record_submitted();
        }
        self.transport.fire(slot.frame_phys(), extra);
        drop(hba);
        Ok(())
    }

    /// Fire a command that is already accounted for (reset replay)
    ///
    /// Caller holds the hba lock.
    pub(crate) fn fire_slot(&self, slot: &CommandSlot) {
        let extra = {
            let mut meta = slot.meta.lock();
            meta.state = CommandState::InFlight;
            meta.frame_count.saturating_sub(1)
        };
        self.transport.fire(slot.frame_phys(), extra);
    }

    /// Release the throttle once completions brought the window down
    pub(crate) fn maybe_unthrottle(&self) {
        let mut hba = self.hba.lock();
        let throttle = &mut hba.throttle;
        if !throttle.engaged || throttle.in_task_mgmt {
            return;
        }
        if self.outstanding() < self.config.throttle_window {
            throttle.engaged = false;
            throttle.since_ms = 0;
            log::info!(
                "{}: throttle released, queue depth back to {}",
                self.id,
                self.config.max_cmd_per_lun
            );
        }
    }

    // =========================================================================
    // Admission
    // =========================================================================

    fn admit_io(&self, retries: u32) -> CoreResult<()> {
        let now = self.timer.now_ms();
        let mut hba = self.hba.lock();
        if hba.unloading {
            return Err(CoreError::Offline);
        }
        match hba.recovery {
            RecoveryState::Operational => {}
            RecoveryState::ResetInProgress => return Err(self.busy()),
            RecoveryState::CriticalError => return Err(CoreError::Offline),
        }
        if !hba.accepting || hba.throttle.in_task_mgmt {
            return Err(self.busy());
        }

        let throttle = &mut hba.throttle;
        if throttle.engaged {
            if now.saturating_sub(throttle.since_ms) < self.config.throttle_hold_ms {
                return Err(self.busy());
            }
            throttle.engaged = false;
            throttle.since_ms = 0;
            log::info!("{}: throttle hold expired", self.id);
        }
        if retries > 1 {
            throttle.engaged = true;
            throttle.since_ms = now;
            log::warn!(
                "{}: command retried {} times, throttling queue depth to {}",
                self.id,
                retries,
                self.config.throttle_window
            );
        }

        let limit = if throttle.engaged {
            self.config.throttle_window
        } else {
            self.config.max_cmd_per_lun
        };
        if self.outstanding() >= limit {
            return Err(self.busy());
        }
        Ok(())
    }

    fn admit_management(&self) -> CoreResult<()> {
        match self.hba.lock().recovery {
            RecoveryState::Operational => Ok(()),
            RecoveryState::ResetInProgress => Err(self.busy()),
            RecoveryState::CriticalError => Err(CoreError::Offline),
        }
    }

    fn busy(&self) -> CoreError {
        self.stats.record_busy();
        log::debug!("{}: submission refused, queue busy", self.id);
        CoreError::QueueBusy
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    fn dma64(&self) -> bool {
        self.format != SglFormat::Sge32
    }

    fn encode_io(&self, slot: &CommandSlot, request: &IoRequest) -> CoreResult<u8> {
        let sense_len = slot.sense().len().min(u8::MAX as usize) as u8;
        let mut io = DataFrame {
            context: slot.context(),
            target: request.target,
            lun: request.lun,
            direction: request.direction,
            sgl: &request.sgl,
            format: self.format,
            sense: slot.sense().phys(),
            sense_len,
            dma64: self.dma64(),
        };

        if request.logical {
            if let Some(rw) = parse_rw_cdb(&request.cdb) {
                io.direction = if rw.write {
                    DataDirection::Write
                } else {
                    DataDirection::Read
                };
                return Ok(encode_ldio(slot.frame(), &io, rw.lba, rw.blocks)?);
            }
        }
        Ok(encode_pthru(
            slot.frame(),
            &io,
            request.logical,
            &request.cdb,
            request.data_len,
            request.timeout_secs,
        )?)
    }

    fn encode_management(&self, slot: &CommandSlot, request: &ManagementRequest) -> CoreResult<u8> {
        let sgl: Vec<SgElement> = match request.buffer() {
            Some(buffer) => vec![SgElement::new(buffer.phys(), buffer.len() as u32)],
            None => Vec::new(),
        };
        match request {
            ManagementRequest::Dcmd { opcode, mbox, direction, .. } => Ok(encode_dcmd(
                slot.frame(),
                slot.context(),
                *opcode,
                mbox,
                *direction,
                self.format,
                &sgl,
            )?),
            ManagementRequest::Passthrough { target, lun, logical, cdb, direction, .. } => {
                let io = DataFrame {
                    context: slot.context(),
                    target: *target,
                    lun: *lun,
                    direction: *direction,
                    sgl: &sgl,
                    format: self.format,
                    sense: slot.sense().phys(),
                    sense_len: slot.sense().len().min(u8::MAX as usize) as u8,
                    dma64: self.dma64(),
                };
                let data_len = sgl.iter().map(|s| s.len).sum();
                Ok(encode_pthru(slot.frame(), &io, *logical, cdb, data_len, 0)?)
            }
        }
    }
}
