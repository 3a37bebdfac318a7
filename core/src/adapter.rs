//! # Adapter
//!
//! One attached controller: its transport, command pool, reply ring, event
//! subscription and recovery state. The operations are spread over the
//! modules that own each concern:
//!
//! - [`crate::submit`]: admission, encoding and firing
//! - [`crate::completion`]: interrupt top half and ring drain
//! - [`crate::blocking`]: blocking and polled commands, abort
//! - [`crate::firmware`]: READY handshake and INIT
//! - [`crate::recovery`]: online controller reset and CriticalError
//! - [`crate::aen`]: event subscription
//!
//! ## Locking
//!
//! Lock order is ring → hba → command meta → free list. The hba lock guards
//! the recovery state, the deferred queue and the throttle, and is held
//! across `fire` so that no frame reaches firmware after the adapter has
//! left Operational.
//!
//! Every lock the top half can reach is a [`megasas_hal::IrqMutex`]: holding
//! one masks local interrupts, so the handler never spins on a lock owned
//! by the code it interrupted.

use crate::aen::AenState;
use crate::config::AdapterConfig;
use crate::error::{CoreError, CoreResult};
use crate::firmware;
use crate::frame::{sgl_capacity, FrameKind, SglFormat};
use crate::mfi::{status_max_cmds, status_max_sge, FwState};
use crate::pool::CommandPool;
use crate::registry::AdapterId;
use crate::ring::ReplyRing;
use crate::stats::{AdapterStatistics, AdapterStats};
use crate::transport::{ChipFamily, Transport};
use crate::workqueue::{DeferredWork, WorkQueue};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use megasas_hal::{DmaAllocator, DmaRegion, IrqMutex, Timer};

/// Size of the driver version buffer handed to firmware at INIT
const DRIVER_VERSION_BUF: usize = 64;

// =============================================================================
// Recovery state
// =============================================================================

/// Adapter recovery state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Accepting and completing work
    Operational,
    /// A controller reset is running; submissions are refused
    ResetInProgress,
    /// Permanently offline
    CriticalError,
}

impl RecoveryState {
    /// Short name for logs
    pub const fn as_str(self) -> &'static str {
        match self {
            RecoveryState::Operational => "operational",
            RecoveryState::ResetInProgress => "reset in progress",
            RecoveryState::CriticalError => "critical error",
        }
    }
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Software throttle
#[derive(Debug, Default)]
pub(crate) struct Throttle {
    /// Window reduced to `throttle_window`
    pub(crate) engaged: bool,
    /// When the throttle was last engaged (ms)
    pub(crate) since_ms: u64,
    /// A task-management reset is running; keep the throttle engaged
    pub(crate) in_task_mgmt: bool,
}

/// State guarded by the hba lock
pub(crate) struct HbaState {
    pub(crate) recovery: RecoveryState,
    /// The deferred queue of the last reset has been replayed
    pub(crate) replay_done: bool,
    /// Contexts awaiting reissue, in FIFO order
    pub(crate) deferred: VecDeque<u32>,
    pub(crate) throttle: Throttle,
    /// Midlayer I/O admitted
    pub(crate) accepting: bool,
    /// Detach in progress
    pub(crate) unloading: bool,
}

// =============================================================================
// Adapter
// =============================================================================

/// An attached controller
pub struct Adapter {
    pub(crate) id: AdapterId,
    pub(crate) config: AdapterConfig,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) timer: Arc<dyn Timer>,
    pub(crate) dma: Arc<dyn DmaAllocator>,
    pub(crate) pool: CommandPool,
    pub(crate) ring: ReplyRing,
    pub(crate) hba: IrqMutex<HbaState>,
    /// Io and Management commands handed to firmware and not yet returned
    pub(crate) outstanding: AtomicU32,
    pub(crate) work: WorkQueue,
    pub(crate) aen: AenState,
    pub(crate) stats: AdapterStats,
    pub(crate) format: SglFormat,
    pub(crate) max_sge: u16,
    pub(crate) driver_version: DmaRegion,
}

impl Adapter {
    /// Bring a controller up to Operational
    ///
    /// Drives firmware to READY, sizes the command pool from the firmware
    /// status word, allocates the pool, the reply ring and the event buffers,
    /// and completes the INIT handshake in polled mode. Interrupts stay
    /// masked until [`Adapter::start`].
    pub fn attach(
        id: AdapterId,
        config: AdapterConfig,
        transport: Box<dyn Transport>,
        timer: Arc<dyn Timer>,
        dma: Arc<dyn DmaAllocator>,
    ) -> CoreResult<Arc<Self>> {
        if !config.is_valid() {
            log::error!("{}: invalid configuration", id);
            return Err(CoreError::InvalidRequest);
        }
        log::info!("{}: attaching {} controller", id, transport.family());

        transport.disable_intr();
        firmware::transition_to_ready(
            transport.as_ref(),
            timer.as_ref(),
            id,
            config.fw_state_wait_ms,
            false,
        )?;

        let status = transport.read_fw_status();
        let fw_cmds = status_max_cmds(status);
        if fw_cmds < 2 {
            log::error!("{}: firmware reports {} commands", id, fw_cmds);
            return Err(CoreError::NotReady { state: status });
        }
        let max_fw_cmds = fw_cmds - 1;

        let dma64 = config.dma64 && dma.supports_64bit();
        let format = transport.sgl_format(dma64);
        let frame_capacity = sgl_capacity(format, config.frame_bytes(), FrameKind::Passthru);
        let max_sge = status_max_sge(status).min(frame_capacity as u16).max(1);
        if config.internal_headroom >= max_fw_cmds {
            log::warn!(
                "{}: headroom {} leaves no I/O commands, clamping",
                id,
                config.internal_headroom
            );
        }

        let pool = CommandPool::new(
            dma.as_ref(),
            max_fw_cmds,
            config.internal_headroom,
            config.frame_bytes(),
            config.sense_size as usize,
        )?;
        let ring = ReplyRing::new(dma.as_ref(), max_fw_cmds as u32 + 1).inspect_err(|_| {
            pool.free_memory(dma.as_ref());
        })?;
        let driver_version = dma
            .alloc_coherent(DRIVER_VERSION_BUF, 4)
            .map_err(CoreError::from)
            .inspect_err(|_| {
                ring.free_memory(dma.as_ref());
                pool.free_memory(dma.as_ref());
            })?;
        driver_version.write_bytes(0, config.driver_version.as_bytes())?;
        let aen = AenState::new(dma.as_ref(), config.max_queued_events).inspect_err(|_| {
            dma.free_coherent(&driver_version);
            ring.free_memory(dma.as_ref());
            pool.free_memory(dma.as_ref());
        })?;

        let adapter = Arc::new(Self {
            id,
            config,
            transport,
            timer,
            dma,
            pool,
            ring,
            hba: IrqMutex::new(HbaState {
                recovery: RecoveryState::Operational,
                replay_done: true,
                deferred: VecDeque::new(),
                throttle: Throttle::default(),
                accepting: false,
                unloading: false,
            }),
            outstanding: AtomicU32::new(0),
            work: WorkQueue::new(),
            aen,
            stats: AdapterStats::default(),
            format,
            max_sge,
            driver_version,
        });

        adapter.issue_init()?;
        log::info!(
            "{}: operational, {} commands ({} reserved), {} SGEs, {:?} SGL",
            id,
            adapter.pool.len(),
            adapter.pool.headroom(),
            max_sge,
            format
        );
        Ok(adapter)
    }

    /// Enable interrupts, open admission and subscribe to events
    pub fn start(&self) -> CoreResult<()> {
        self.transport.enable_intr();
        self.hba.lock().accepting = true;
        if let Err(e) = self.start_events() {
            log::error!("{}: event subscription failed: {}", self.id, e);
            return Err(e);
        }
        Ok(())
    }

    /// Quiesce the controller for detach
    ///
    /// Cancels the event subscription, flushes caches and shuts the
    /// controller down. Failures are logged; the adapter is unusable
    /// afterwards either way.
    pub fn shutdown(&self) {
        let state = {
            let mut hba = self.hba.lock();
            hba.unloading = true;
            hba.accepting = false;
            hba.recovery
        };
        log::info!("{}: shutting down", self.id);

        if state == RecoveryState::Operational {
            if let Err(e) = self.cancel_events() {
                log::warn!("{}: event abort failed: {}", self.id, e);
            }
            if let Err(e) = self.flush_cache() {
                log::warn!("{}: cache flush failed: {}", self.id, e);
            }
            if let Err(e) = self.shutdown_controller() {
                log::warn!("{}: controller shutdown failed: {}", self.id, e);
            }
        }
        self.transport.disable_intr();
    }

    /// Run deferred work until none is pending
    ///
    /// Hosts call this from thread context whenever the interrupt handler
    /// returns [`megasas_hal::IrqReturn::WakeThread`]. Concurrent calls
    /// return immediately; the running executor picks up their work.
    /// Returns the number of work items run.
    pub fn run_deferred(&self) -> usize {
        if !self.work.begin() {
            return 0;
        }
        let mut ran = 0;
        while let Some(item) = self.work.next() {
            if item == DeferredWork::RECOVERY {
                self.recover();
            } else {
                self.complete_pending();
            }
            ran += 1;
        }
        ran
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Adapter id
    pub fn id(&self) -> AdapterId {
        self.id
    }

    /// Controller family
    pub fn family(&self) -> ChipFamily {
        self.transport.family()
    }

    /// Configuration in effect
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Recovery state
    pub fn state(&self) -> RecoveryState {
        self.hba.lock().recovery
    }

    /// Firmware state as reported by the status register
    pub fn fw_state(&self) -> FwState {
        self.transport.fw_state()
    }

    /// Requests currently owned by firmware
    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Commands waiting for reissue
    pub fn deferred_len(&self) -> usize {
        self.hba.lock().deferred.len()
    }

    /// Whether the software throttle is engaged
    pub fn is_throttled(&self) -> bool {
        self.hba.lock().throttle.engaged
    }

    /// Command pool
    pub fn pool(&self) -> &CommandPool {
        &self.pool
    }

    /// Reply ring
    pub fn ring(&self) -> &ReplyRing {
        &self.ring
    }

    /// SGEs accepted per request
    pub fn max_sge(&self) -> u16 {
        self.max_sge
    }

    /// SGE encoding in use
    pub fn sgl_format(&self) -> SglFormat {
        self.format
    }

    /// Counter snapshot
    pub fn statistics(&self) -> AdapterStatistics {
        self.stats.snapshot()
    }

    /// Saturating decrement of the outstanding counter
    pub(crate) fn release_outstanding(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        self.aen.free_memory(self.dma.as_ref());
        self.dma.free_coherent(&self.driver_version);
        self.ring.free_memory(self.dma.as_ref());
        self.pool.free_memory(self.dma.as_ref());
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("id", &self.id)
            .field("family", &self.family())
            .field("state", &self.state())
            .field("outstanding", &self.outstanding())
            .field("pool", &self.pool)
            .finish()
    }
}
