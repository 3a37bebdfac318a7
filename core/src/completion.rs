//! # Completion Path
//!
//! Interrupt top half and ring drain. The top half only acknowledges the
//! chip and decides what happens next: a firmware fault enters recovery,
//! anything else schedules the drain. The drain runs from the deferred
//! executor, walks the reply ring in firmware order and dispatches each
//! context by command kind.

use crate::adapter::{Adapter, RecoveryState};
use crate::error::CoreError;
use crate::frame::{normalize_sense, read_status, FrameStatus};
use crate::mfi::*;
use crate::pool::{CommandHandle, CommandKind, CommandMeta, CommandSlot, CommandState, Owner, Retired};
use crate::request::{HostStatus, IoResult, ManagementResult, SenseData, SCSI_SENSE_BUFFERSIZE};
use crate::transport::InterruptCause;
use crate::workqueue::DeferredWork;
use megasas_hal::IrqReturn;

/// How firmware resolved one request, before it is handed to the owner
struct Outcome {
    host: HostStatus,
    scsi_status: u8,
    sense: SenseData,
}

impl Adapter {
    /// Interrupt top half
    ///
    /// Never sleeps. Returns [`IrqReturn::WakeThread`] when the host must
    /// call [`Adapter::run_deferred`].
    pub fn handle_interrupt(&self) -> IrqReturn {
        let recovering = self.hba.lock().recovery != RecoveryState::Operational;
        if self.transport.check_reset(recovering, self.ring.consumer()) {
            return IrqReturn::Handled;
        }

        let cause = self.transport.clear_intr();
        if cause.is_empty() {
            return IrqReturn::None;
        }

        if cause.contains(InterruptCause::STATE_CHANGE) && self.transport.fw_state() == FwState::Fault {
            self.stats.record_fault();
            if self.config.ocr_enabled {
                log::warn!("{}: firmware fault, starting online controller reset", self.id);
                if self.enter_recovery() {
                    return IrqReturn::WakeThread;
                }
                return IrqReturn::Handled;
            }
            log::error!("{}: firmware fault and online reset disabled", self.id);
            self.kill_adapter();
            return IrqReturn::Handled;
        }

        self.work.schedule(DeferredWork::COMPLETIONS);
        IrqReturn::WakeThread
    }

    /// Bottom half: drain the reply ring
    ///
    /// Returns the number of contexts dispatched. Does nothing unless the
    /// adapter is Operational.
    pub fn complete_pending(&self) -> usize {
        if self.state() != RecoveryState::Operational {
            return 0;
        }
        match self.ring.drain(self.pool.len() as u32, |context| self.dispatch(context)) {
            Ok(count) => count,
            Err(CoreError::ProtocolViolation { context }) => {
                self.stats.record_protocol_error();
                log::error!(
                    "{}: firmware returned context {:#x} outside the pool of {}",
                    self.id,
                    context,
                    self.pool.len()
                );
                self.kill_adapter();
                0
            }
            Err(e) => {
                log::error!("{}: reply ring unreadable: {}", self.id, e);
                0
            }
        }
    }

    fn dispatch(&self, context: u32) {
        let in_flight = |meta: &CommandMeta| meta.state == CommandState::InFlight;
        let Some((handle, retired)) = self.pool.retire(context, in_flight) else {
            log::warn!("{}: completion for idle command {}", self.id, context);
            return;
        };

        match retired.kind {
            CommandKind::Io | CommandKind::Management => self.complete_request(handle, retired),
            CommandKind::Abort => self.complete_abort(handle, retired),
            CommandKind::EventWait => self.service_event(handle, retired),
            CommandKind::Init | CommandKind::Idle => {
                log::warn!("{}: unexpected {:?} completion for {}", self.id, retired.kind, context);
                self.pool.release(handle);
            }
        }
    }

    /// Finish an I/O or management command
    fn complete_request(&self, handle: CommandHandle, retired: Retired) {
        let slot = self.pool.get(&handle);
        let status = self.frame_status(slot);
        let outcome = if retired.abort_requested {
            Outcome {
                host: HostStatus::Reset,
                scsi_status: 0,
                sense: SenseData::new(),
            }
        } else {
            self.translate(slot, &status)
        };
        let context = handle.context();
        self.pool.release(handle);

        if retired.orphaned {
            log::debug!("{}: late completion of abandoned command {}", self.id, context);
            return;
        }
        self.release_outstanding();
        self.stats.record_completed();

        match retired.owner {
            Owner::Io(done) => done.complete(IoResult {
                host: outcome.host,
                scsi_status: outcome.scsi_status,
                mfi_status: status.cmd_status,
                sense: outcome.sense,
            }),
            Owner::Management(done) => done.complete(Ok(ManagementResult {
                status: status.cmd_status,
                scsi_status: outcome.scsi_status,
                sense: outcome.sense,
            })),
            Owner::Abort(_) | Owner::None => {}
        }
        self.maybe_unthrottle();
    }

    /// Wake the blocking aborter
    fn complete_abort(&self, handle: CommandHandle, retired: Retired) {
        let status = self.frame_status(self.pool.get(&handle));
        self.pool.release(handle);
        if let Owner::Abort(done) = retired.owner {
            done.complete(status.cmd_status);
        }
    }

    pub(crate) fn frame_status(&self, slot: &CommandSlot) -> FrameStatus {
        read_status(slot.frame()).unwrap_or(FrameStatus {
            cmd_status: MFI_STAT_INVALID_STATUS,
            scsi_status: 0,
            sense_len: 0,
        })
    }

    /// Map an MFI completion status to midlayer terms
    fn translate(&self, slot: &CommandSlot, status: &FrameStatus) -> Outcome {
        let check_condition = status.scsi_status == SAM_STAT_CHECK_CONDITION;
        let (host, with_sense) = match status.cmd_status {
            MFI_STAT_OK => (HostStatus::Ok, false),
            MFI_STAT_SCSI_IO_FAILED if check_condition => (HostStatus::Ok, true),
            MFI_STAT_SCSI_IO_FAILED | MFI_STAT_LD_INIT_IN_PROGRESS => (HostStatus::Error, false),
            MFI_STAT_SCSI_DONE_WITH_ERROR => (HostStatus::Ok, check_condition),
            MFI_STAT_LD_OFFLINE | MFI_STAT_DEVICE_NOT_FOUND => (HostStatus::NoConnect, false),
            other => {
                log::warn!(
                    "{}: command {} completed with status {:#04x}",
                    self.id,
                    slot.context(),
                    other
                );
                (HostStatus::Error, false)
            }
        };

        let mut sense = SenseData::new();
        if with_sense {
            let len = (status.sense_len as usize)
                .min(SCSI_SENSE_BUFFERSIZE)
                .min(slot.sense().len());
            let mut buf = [0u8; SCSI_SENSE_BUFFERSIZE];
            if slot.sense().read_bytes(0, &mut buf[..len]).is_ok() {
                normalize_sense(&mut buf[..len]);
                sense.extend(buf[..len].iter().copied());
            }
        }

        let scsi_status = match status.cmd_status {
            MFI_STAT_OK | MFI_STAT_DEVICE_NOT_FOUND | MFI_STAT_LD_OFFLINE => 0,
            _ => status.scsi_status,
        };
        Outcome { host, scsi_status, sense }
    }
}
