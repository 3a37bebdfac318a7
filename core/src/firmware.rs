//! # Firmware State Machine
//!
//! Drives the firmware from whatever state it is found in to READY, then
//! performs the INIT handshake that hands it the reply queue and makes it
//! OPERATIONAL.
//!
//! Each non-READY state gets its handshake write (if any), then the status
//! word is polled until it changes. The same bounded wait applies to every
//! state; a status word that stops changing is `NotReady`.

use crate::adapter::Adapter;
use crate::error::{CoreError, CoreResult};
use crate::frame::{encode_init, QueueInfo};
use crate::mfi::*;
use crate::pool::CommandKind;
use crate::registry::AdapterId;
use crate::transport::Transport;
use megasas_hal::{poll_until, Timer};

/// Status register poll interval
const FW_POLL_INTERVAL_MS: u64 = 1;

/// Bring firmware to READY
///
/// With `ocr` set (reset recovery), a FAULT state is waited out instead of
/// failing immediately.
pub fn transition_to_ready(
    transport: &dyn Transport,
    timer: &dyn Timer,
    id: AdapterId,
    wait_ms: u64,
    ocr: bool,
) -> CoreResult<()> {
    let mut status = transport.read_fw_status();
    let mut state = FwState::from_status(status);
    if state != FwState::Ready {
        log::info!("{}: waiting for firmware to become ready ({:?})", id, state);
    }

    while state != FwState::Ready {
        match state {
            FwState::Fault => {
                if !ocr {
                    log::error!("{}: firmware in FAULT state", id);
                    return Err(CoreError::FirmwareFault);
                }
                log::info!("{}: firmware in FAULT, waiting for reset to take effect", id);
            }
            FwState::WaitHandshake => {
                transport.write_doorbell(MFI_INIT_CLEAR_HANDSHAKE | MFI_INIT_HOTPLUG);
            }
            FwState::BootMessagePending => {
                transport.write_doorbell(MFI_INIT_HOTPLUG);
            }
            FwState::Operational => {
                // Bring it down to READY; nothing may complete meanwhile.
                transport.disable_intr();
                transport.write_doorbell(MFI_RESET_FLAGS);
            }
            FwState::Undefined
            | FwState::BbInit
            | FwState::FwInit
            | FwState::FwInit2
            | FwState::DeviceScan
            | FwState::FlushCache => {}
            FwState::Ready => break,
            FwState::Unknown(code) => {
                log::error!("{}: unknown firmware state {:#x}", id, code);
                return Err(CoreError::NotReady { state: status });
            }
        }

        let previous = status;
        let changed = poll_until(timer, wait_ms, FW_POLL_INTERVAL_MS, || {
            transport.read_fw_status() != previous
        });
        if !changed {
            log::error!(
                "{}: firmware stuck in {:?} (status {:#010x})",
                id,
                state,
                previous
            );
            return Err(CoreError::NotReady { state: previous });
        }

        status = transport.read_fw_status();
        state = FwState::from_status(status);
        log::debug!("{}: firmware state now {:?}", id, state);
    }

    log::info!("{}: firmware ready", id);
    Ok(())
}

impl Adapter {
    /// Hand the reply queue to firmware (polled INIT frame)
    pub(crate) fn issue_init(&self) -> CoreResult<()> {
        let handle = self.pool.acquire_internal().ok_or(CoreError::NoCommand)?;
        let slot = self.pool.get(&handle);
        let queue = QueueInfo {
            entries: self.ring.entries(),
            reply_queue: self.ring.queue_phys(),
            producer: self.ring.producer_phys(),
            consumer: self.ring.consumer_phys(),
        };
        let result = encode_init(
            slot.frame(),
            handle.context(),
            &queue,
            self.driver_version.phys(),
        )
        .map_err(CoreError::from)
        .and_then(|()| {
            slot.meta.lock().kind = CommandKind::Init;
            self.transport.disable_intr();
            self.issue_polled(&handle, self.config.internal_cmd_timeout_ms)
        });
        self.pool.release(handle);

        match result? {
            MFI_STAT_OK => {
                log::debug!("{}: INIT complete, {} reply entries", self.id, queue.entries);
                Ok(())
            }
            status => {
                log::error!("{}: INIT rejected with status {:#04x}", self.id, status);
                Err(CoreError::InitFailed { status })
            }
        }
    }
}
