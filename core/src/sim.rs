//! Simulated gen2 controller for tests.
//!
//! [`SimController`] is a register block backed by a small firmware model:
//! it follows the frame pointers written to the queue port through the
//! host DMA allocator, answers frames, posts contexts to the reply ring
//! handed over at INIT and runs the diag reset sequence. [`SimTimer`] moves
//! time forward on every sleep and runs the harness pump, so blocking waits
//! complete the way they would with a live interrupt handler.

extern crate std;

use crate::adapter::Adapter;
use crate::aen::EventClass;
use crate::config::AdapterConfig;
use crate::frame::*;
use crate::mfi::*;
use crate::registry::{AdapterId, AdapterRegistry};
use crate::transport::regs::*;
use crate::transport::ChipFamily;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use megasas_hal::interrupts::{self, InterruptControl};
use megasas_hal::{DmaAllocator, DmaRegion, HostDmaAllocator, PhysAddr, RegisterBlock, Timer};
use spin::Mutex;

/// Commands the firmware reports (the pool gets one less)
const SIM_MAX_CMDS: u32 = 17;
/// SGEs per command the firmware reports
const SIM_MAX_SGE: u32 = 32;
/// Sequence number of the newest event logged before attach
const SIM_FIRST_SEQ: u32 = 1_000;

type Hook = Arc<dyn Fn() + Send + Sync>;

// =============================================================================
// Interrupt masking
// =============================================================================

std::thread_local! {
    static IRQ_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Each test thread stands in for a CPU with its own masking depth
struct SimIrqControl;

impl InterruptControl for SimIrqControl {
    fn save_and_disable(&self) -> bool {
        IRQ_DEPTH.with(|d| {
            let prev = d.get();
            d.set(prev + 1);
            prev == 0
        })
    }

    fn restore(&self, _was_enabled: bool) {
        IRQ_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

static SIM_IRQ: SimIrqControl = SimIrqControl;

/// Whether the calling thread has interrupts masked
pub fn irqs_masked() -> bool {
    IRQ_DEPTH.with(|d| d.get() > 0)
}

// =============================================================================
// Timer
// =============================================================================

/// Virtual clock; sleeping advances it and runs the pump hook
#[derive(Default)]
pub struct SimTimer {
    now: AtomicU64,
    hook: Mutex<Option<Hook>>,
    in_hook: AtomicBool,
}

impl SimTimer {
    fn set_hook(&self, hook: Hook) {
        *self.hook.lock() = Some(hook);
    }

    /// Move time forward without pumping
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Timer for SimTimer {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep_ms(&self, ms: u64) {
        self.advance(ms);
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            if !self.in_hook.swap(true, Ordering::SeqCst) {
                hook();
                self.in_hook.store(false, Ordering::SeqCst);
            }
        }
    }
}

// =============================================================================
// Firmware model
// =============================================================================

struct Queue {
    reply: DmaRegion,
    producer: DmaRegion,
    entries: u32,
}

struct EventWait {
    context: u32,
    seq: u32,
    filter: u32,
    frame: DmaRegion,
    buffer: DmaRegion,
}

struct SimEvent {
    seq: u32,
    code: u32,
    class: EventClass,
    description: String,
}

#[derive(Clone)]
struct TargetStatus {
    cmd_status: u8,
    scsi_status: u8,
    sense: Vec<u8>,
}

struct Firmware {
    state: FwState,
    intr_status: u32,
    intr_mask: u32,
    host_diag: u32,
    key_index: usize,
    queue: Option<Queue>,
    hold: bool,
    held: Vec<(u32, DmaRegion)>,
    targets: BTreeMap<u8, TargetStatus>,
    fault_on: BTreeMap<u32, u32>,
    ignore_aborts: bool,
    ignore_polled: bool,
    aborts: usize,
    stopped: bool,
    shut_down: bool,
    resets: usize,
    posted: Vec<u32>,
    fired: Vec<(u32, Vec<u8>)>,
    unmasked_fires: usize,
    events: Vec<SimEvent>,
    newest_seq: u32,
    event_wait: Option<EventWait>,
}

/// A gen2 controller with a scripted firmware behind its registers
pub struct SimController {
    dma: Arc<HostDmaAllocator>,
    fw: Mutex<Firmware>,
}

impl SimController {
    /// Controller in READY state, resolving frame pointers through `dma`
    pub fn new(dma: Arc<HostDmaAllocator>) -> Self {
        Self {
            dma,
            fw: Mutex::new(Firmware {
                state: FwState::Ready,
                intr_status: 0,
                intr_mask: u32::MAX,
                host_diag: 0,
                key_index: 0,
                queue: None,
                hold: false,
                held: Vec::new(),
                targets: BTreeMap::new(),
                fault_on: BTreeMap::new(),
                ignore_aborts: false,
                ignore_polled: false,
                aborts: 0,
                stopped: false,
                shut_down: false,
                resets: 0,
                posted: Vec::new(),
                fired: Vec::new(),
                unmasked_fires: 0,
                events: Vec::new(),
                newest_seq: SIM_FIRST_SEQ,
                event_wait: None,
            }),
        }
    }

    fn resolve(&self, phys: PhysAddr) -> Option<DmaRegion> {
        let (region, offset) = self.dma.resolve(phys)?;
        region.slice(offset, region.len() - offset).ok()
    }

    fn sgl_buffer(&self, frame: &DmaRegion, header: &FrameHeader, offset: usize) -> Option<DmaRegion> {
        let flags = header.frame_flags();
        let format = if flags.contains(FrameFlags::IEEE) {
            SglFormat::Ieee
        } else if flags.contains(FrameFlags::SGL64) {
            SglFormat::Sge64
        } else {
            SglFormat::Sge32
        };
        let sgl = read_sgl(frame, offset, format, header.sge_count as usize).ok()?;
        let first = sgl.first()?;
        let region = self.resolve(first.addr)?;
        region.slice(0, (first.len as usize).min(region.len())).ok()
    }

    // =========================================================================
    // Test controls
    // =========================================================================

    /// Hold I/O and plain management frames instead of answering them
    pub fn set_hold(&self, hold: bool) {
        self.fw.lock().hold = hold;
    }

    /// Answer every held frame, oldest first
    pub fn release_held(&self) {
        let held: Vec<u32> = self.fw.lock().held.iter().map(|(ctx, _)| *ctx).collect();
        self.release_held_in(&held);
    }

    /// Answer the held frames with the given contexts, in that order
    pub fn release_held_in(&self, contexts: &[u32]) {
        let mut fw = self.fw.lock();
        for &context in contexts {
            if let Some(pos) = fw.held.iter().position(|(ctx, _)| *ctx == context) {
                let (_, frame) = fw.held.remove(pos);
                self.execute(&mut fw, &frame);
                fw.post(context);
            }
        }
    }

    /// Answer frames for `target` with a fixed status and sense data
    pub fn set_target_status(&self, target: u8, cmd_status: u8, scsi_status: u8, sense: &[u8]) {
        self.fw.lock().targets.insert(
            target,
            TargetStatus {
                cmd_status,
                scsi_status,
                sense: sense.to_vec(),
            },
        );
    }

    /// Fault the firmware the next `times` times `context` is fired
    pub fn fault_on_context(&self, context: u32, times: u32) {
        self.fw.lock().fault_on.insert(context, times);
    }

    /// Drop abort frames without answering them
    pub fn set_ignore_aborts(&self, ignore: bool) {
        self.fw.lock().ignore_aborts = ignore;
    }

    /// Leave polled frames unanswered
    pub fn set_ignore_polled(&self, ignore: bool) {
        self.fw.lock().ignore_polled = ignore;
    }

    /// Enter FAULT and raise the state-change interrupt
    pub fn inject_fault(&self) {
        self.fw.lock().fault();
    }

    /// Post a raw context to the reply ring
    pub fn post_raw(&self, context: u32) {
        self.fw.lock().post(context);
    }

    /// Log an event, answering a matching wait; returns its sequence number
    pub fn push_event(&self, code: u32, class: EventClass, description: &str) -> u32 {
        let mut fw = self.fw.lock();
        fw.newest_seq += 1;
        let seq = fw.newest_seq;
        fw.events.push(SimEvent {
            seq,
            code,
            class,
            description: String::from(description),
        });
        fw.deliver_events();
        seq
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Whether an unmasked interrupt is pending
    pub fn irq_pending(&self) -> bool {
        let fw = self.fw.lock();
        fw.intr_status & !fw.intr_mask != 0
    }

    /// Every context posted to the reply ring, in order
    pub fn posted(&self) -> Vec<u32> {
        self.fw.lock().posted.clone()
    }

    /// Frame bytes captured each time `context` was fired
    pub fn fired_frames(&self, context: u32) -> Vec<Vec<u8>> {
        self.fw
            .lock()
            .fired
            .iter()
            .filter(|(ctx, _)| *ctx == context)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    /// Frames fired while the driver had interrupts unmasked
    pub fn unmasked_fires(&self) -> usize {
        self.fw.lock().unmasked_fires
    }

    /// Abort frames answered
    pub fn aborts(&self) -> usize {
        self.fw.lock().aborts
    }

    /// Diag resets performed
    pub fn reset_count(&self) -> usize {
        self.fw.lock().resets
    }

    /// Whether the driver halted the firmware
    pub fn stopped(&self) -> bool {
        self.fw.lock().stopped
    }

    /// Whether CTRL_SHUTDOWN was received
    pub fn shut_down(&self) -> bool {
        self.fw.lock().shut_down
    }

    /// Newest logged event sequence number
    pub fn newest_event_seq(&self) -> u32 {
        self.fw.lock().newest_seq
    }

    /// Sequence number the pending EVENT_WAIT asks for
    pub fn event_wait_seq(&self) -> Option<u32> {
        self.fw.lock().event_wait.as_ref().map(|w| w.seq)
    }

    /// Context of the pending EVENT_WAIT
    pub fn event_wait_context(&self) -> Option<u32> {
        self.fw.lock().event_wait.as_ref().map(|w| w.context)
    }

    /// Class/locale word of the pending EVENT_WAIT
    pub fn event_wait_filter(&self) -> Option<u32> {
        self.fw.lock().event_wait.as_ref().map(|w| w.filter)
    }

    // =========================================================================
    // Frame handling
    // =========================================================================

    fn fire(&self, fw: &mut Firmware, value: u32) {
        let Some(frame) = self.resolve(PhysAddr::new((value & !0x3F) as u64)) else {
            return;
        };
        let Ok(header) = FrameHeader::read(&frame) else {
            return;
        };
        let mut bytes = [0u8; MFI_FRAME_SIZE];
        let _ = frame.read_bytes(0, &mut bytes);
        fw.fired.push((header.context, bytes.to_vec()));
        if !irqs_masked() {
            fw.unmasked_fires += 1;
        }

        if fw.state == FwState::Fault {
            return;
        }
        if let Some(remaining) = fw.fault_on.get_mut(&header.context) {
            if *remaining > 0 {
                *remaining -= 1;
                fw.fault();
                return;
            }
        }

        let polled = header.frame_flags().contains(FrameFlags::DONT_POST);
        let opcode = frame.read_u32(DCMD_OPCODE_OFFSET).unwrap_or(0);
        match header.cmd {
            MFI_CMD_INIT => {
                let status = self.init(fw, &frame);
                self.finish(fw, &frame, header.context, status, polled);
            }
            MFI_CMD_ABORT => self.abort(fw, &frame, header.context),
            _ if polled => {
                if !fw.ignore_polled {
                    self.execute(fw, &frame);
                }
            }
            MFI_CMD_DCMD if opcode == MR_DCMD_CTRL_EVENT_WAIT => {
                let buffer = self.sgl_buffer(&frame, &header, DCMD_SGL_OFFSET);
                if let Some(buffer) = buffer {
                    fw.event_wait = Some(EventWait {
                        context: header.context,
                        seq: frame.read_u32(DCMD_MBOX_OFFSET).unwrap_or(0),
                        filter: frame.read_u32(DCMD_MBOX_OFFSET + 4).unwrap_or(0),
                        frame,
                        buffer,
                    });
                    fw.deliver_events();
                } else {
                    self.finish(fw, &frame, header.context, MFI_STAT_INVALID_PARAMETER, false);
                }
            }
            _ if fw.hold => fw.held.push((header.context, frame)),
            _ => {
                self.execute(fw, &frame);
                fw.post(header.context);
            }
        }
    }

    fn finish(&self, fw: &mut Firmware, frame: &DmaRegion, context: u32, status: u8, polled: bool) {
        let _ = frame.write_u8(hdr::CMD_STATUS, status);
        if !polled {
            fw.post(context);
        }
    }

    fn init(&self, fw: &mut Firmware, frame: &DmaRegion) -> u8 {
        if fw.state != FwState::Ready {
            return MFI_STAT_INVALID_CMD;
        }
        let qinfo = frame
            .read_u64(INIT_QINFO_OFFSET)
            .ok()
            .and_then(|phys| self.resolve(PhysAddr::new(phys)));
        let Some(queue) = qinfo.and_then(|region| QueueInfo::read(&region, 0).ok()) else {
            return MFI_STAT_INVALID_PARAMETER;
        };
        let reply = self.resolve(queue.reply_queue);
        let producer = self.resolve(queue.producer);
        let (Some(reply), Some(producer)) = (reply, producer) else {
            return MFI_STAT_INVALID_PARAMETER;
        };
        fw.queue = Some(Queue {
            reply,
            producer,
            entries: queue.entries,
        });
        fw.state = FwState::Operational;
        MFI_STAT_OK
    }

    fn abort(&self, fw: &mut Firmware, frame: &DmaRegion, context: u32) {
        if fw.ignore_aborts {
            return;
        }
        fw.aborts += 1;
        let target = frame.read_u32(ABORT_CONTEXT_OFFSET).unwrap_or(u32::MAX);
        let status = if let Some(pos) = fw.held.iter().position(|(ctx, _)| *ctx == target) {
            let (_, held) = fw.held.remove(pos);
            let _ = held.write_u8(hdr::CMD_STATUS, MFI_STAT_OK);
            fw.post(target);
            MFI_STAT_OK
        } else if fw.event_wait.as_ref().is_some_and(|w| w.context == target) {
            if let Some(wait) = fw.event_wait.take() {
                let _ = wait.frame.write_u8(hdr::CMD_STATUS, MFI_STAT_OK);
            }
            fw.post(target);
            MFI_STAT_OK
        } else {
            MFI_STAT_NOT_FOUND
        };
        self.finish(fw, frame, context, status, false);
    }

    /// Answer a frame in place
    fn execute(&self, fw: &mut Firmware, frame: &DmaRegion) {
        let Ok(header) = FrameHeader::read(frame) else {
            return;
        };
        match header.cmd {
            MFI_CMD_LD_READ | MFI_CMD_LD_WRITE | MFI_CMD_LD_SCSI_IO | MFI_CMD_PD_SCSI_IO => {
                let answer = fw.targets.get(&header.target).cloned().unwrap_or(TargetStatus {
                    cmd_status: MFI_STAT_OK,
                    scsi_status: 0,
                    sense: Vec::new(),
                });
                if !answer.sense.is_empty() {
                    let low = frame.read_u32(SENSE_ADDR_OFFSET).unwrap_or(0) as u64;
                    let high = frame.read_u32(SENSE_ADDR_OFFSET + 4).unwrap_or(0) as u64;
                    if let Some(sense) = self.resolve(PhysAddr::new(high << 32 | low)) {
                        let _ = sense.write_bytes(0, &answer.sense);
                    }
                }
                let _ = frame.write_u8(hdr::SENSE_LEN, answer.sense.len() as u8);
                let _ = frame.write_u8(hdr::SCSI_STATUS, answer.scsi_status);
                let _ = frame.write_u8(hdr::CMD_STATUS, answer.cmd_status);
            }
            MFI_CMD_DCMD => {
                let opcode = frame.read_u32(DCMD_OPCODE_OFFSET).unwrap_or(0);
                let status = match opcode {
                    MR_DCMD_CTRL_EVENT_GET_INFO => {
                        match self.sgl_buffer(frame, &header, DCMD_SGL_OFFSET) {
                            Some(buffer) => {
                                let _ = buffer.write_u32(0, fw.newest_seq);
                                MFI_STAT_OK
                            }
                            None => MFI_STAT_INVALID_PARAMETER,
                        }
                    }
                    MR_DCMD_CTRL_SHUTDOWN => {
                        fw.shut_down = true;
                        MFI_STAT_OK
                    }
                    MR_DCMD_CTRL_GET_INFO | MR_DCMD_LD_GET_LIST | MR_DCMD_CTRL_CACHE_FLUSH => {
                        MFI_STAT_OK
                    }
                    _ => MFI_STAT_INVALID_DCMD,
                };
                let _ = frame.write_u8(hdr::CMD_STATUS, status);
            }
            _ => {
                let _ = frame.write_u8(hdr::CMD_STATUS, MFI_STAT_INVALID_CMD);
            }
        }
    }

    fn doorbell(&self, fw: &mut Firmware, value: u32) {
        if value & MFI_STOP_ADP != 0 {
            fw.stopped = true;
        }
        if value & MFI_INIT_READY != 0 && fw.state == FwState::Operational {
            fw.forget();
            fw.state = FwState::Ready;
        }
    }

    fn diag_key(&self, fw: &mut Firmware, value: u32) {
        if DIAG_KEY_SEQUENCE[fw.key_index] == value {
            fw.key_index += 1;
        } else {
            fw.key_index = usize::from(DIAG_KEY_SEQUENCE[0] == value);
        }
        if fw.key_index == DIAG_KEY_SEQUENCE.len() {
            fw.key_index = 0;
            fw.host_diag |= DIAG_WRITE_ENABLE;
        }
    }

    fn host_diag(&self, fw: &mut Firmware, value: u32) {
        if fw.host_diag & DIAG_WRITE_ENABLE == 0 || value & DIAG_RESET_ADAPTER == 0 {
            return;
        }
        fw.forget();
        fw.state = FwState::Ready;
        fw.intr_status = 0;
        fw.host_diag = 0;
        fw.resets += 1;
    }
}

impl Firmware {
    fn status_word(&self) -> u32 {
        self.state.to_status() | (SIM_MAX_SGE << 16) | SIM_MAX_CMDS
    }

    fn fault(&mut self) {
        self.state = FwState::Fault;
        self.intr_status |= MFI_G2_OUTBOUND_DOORBELL_CHANGE_INTERRUPT;
    }

    /// Drop everything tied to the current INIT
    fn forget(&mut self) {
        self.queue = None;
        self.held.clear();
        self.event_wait = None;
    }

    fn post(&mut self, context: u32) {
        let Some(queue) = &self.queue else {
            return;
        };
        let producer = queue.producer.read_u32(0).unwrap_or(0) % queue.entries;
        let _ = queue.reply.write_u32(producer as usize * 4, context);
        let _ = queue.producer.write_u32(0, (producer + 1) % queue.entries);
        self.intr_status |= MFI_REPLY_GEN2_MESSAGE_INTERRUPT;
        self.posted.push(context);
    }

    fn deliver_events(&mut self) {
        if self.state != FwState::Operational {
            return;
        }
        let Some(seq) = self.event_wait.as_ref().map(|w| w.seq) else {
            return;
        };
        let Some(event) = self.events.iter().find(|e| e.seq >= seq) else {
            return;
        };
        let Some(wait) = self.event_wait.take() else {
            return;
        };

        let buffer = &wait.buffer;
        buffer.fill(0, buffer.len(), 0);
        let _ = buffer.write_u32(0, event.seq);
        let _ = buffer.write_u32(4, event.seq.wrapping_mul(10));
        let _ = buffer.write_u32(8, event.code);
        let _ = buffer.write_u16(12, 0x0001);
        let _ = buffer.write_u8(15, event.class as i8 as u8);
        let text = event.description.as_bytes();
        let _ = buffer.write_bytes(128, &text[..text.len().min(127)]);

        let _ = wait.frame.write_u8(hdr::CMD_STATUS, MFI_STAT_OK);
        self.post(wait.context);
    }
}

impl RegisterBlock for SimController {
    fn read32(&self, offset: usize) -> u32 {
        let fw = self.fw.lock();
        match offset {
            OUTBOUND_SCRATCH_PAD => fw.status_word(),
            OUTBOUND_INTR_STATUS => fw.intr_status,
            OUTBOUND_INTR_MASK => fw.intr_mask,
            HOST_DIAG => fw.host_diag,
            _ => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut fw = self.fw.lock();
        match offset {
            INBOUND_QUEUE_PORT => self.fire(&mut fw, value),
            INBOUND_DOORBELL => self.doorbell(&mut fw, value),
            OUTBOUND_INTR_MASK => fw.intr_mask = value,
            OUTBOUND_DOORBELL_CLEAR => fw.intr_status &= !value,
            SEQ_OFFSET => self.diag_key(&mut fw, value),
            HOST_DIAG => self.host_diag(&mut fw, value),
            _ => {}
        }
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Where the timer hook delivers interrupts
struct PumpTarget {
    adapter: Mutex<Option<Weak<Adapter>>>,
    registry: Option<Weak<AdapterRegistry>>,
}

impl PumpTarget {
    fn pump(&self) {
        let adapter = self.adapter.lock().clone();
        if let Some(adapter) = adapter.and_then(|a| a.upgrade()) {
            pump(&adapter);
            return;
        }
        let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        for id in registry.ids() {
            registry.handle_interrupt(id);
            let _ = registry.run_deferred(id);
        }
    }
}

fn pump(adapter: &Adapter) {
    adapter.handle_interrupt();
    adapter.run_deferred();
}

/// An adapter attached to a [`SimController`]
pub struct Harness {
    pub adapter: Arc<Adapter>,
    pub sim: Arc<SimController>,
    pub timer: Arc<SimTimer>,
    pub dma: Arc<HostDmaAllocator>,
}

impl Harness {
    /// Configuration with short waits and a small headroom
    pub fn config() -> AdapterConfig {
        AdapterConfig {
            internal_headroom: 2,
            fw_state_wait_ms: 1_000,
            internal_cmd_timeout_ms: 5_000,
            abort_timeout_ms: 1_000,
            reset_poll_interval_ms: 10,
            post_reset_delay_ms: 100,
            ..AdapterConfig::default()
        }
    }

    /// Attached and started with [`Harness::config`]
    pub fn new() -> Self {
        Self::with_config(Self::config())
    }

    /// Attached and started with `config`
    pub fn with_config(config: AdapterConfig) -> Self {
        let (dma, sim, timer) = Self::parts();
        let adapter = Adapter::attach(
            AdapterId(0),
            config,
            ChipFamily::Gen2.transport(Arc::clone(&sim) as Arc<dyn RegisterBlock>),
            Arc::clone(&timer) as Arc<dyn Timer>,
            Arc::clone(&dma) as Arc<dyn DmaAllocator>,
        )
        .unwrap();
        let target = Arc::new(PumpTarget {
            adapter: Mutex::new(Some(Arc::downgrade(&adapter))),
            registry: None,
        });
        timer.set_hook(Arc::new(move || target.pump()));
        adapter.start().unwrap();
        Self { adapter, sim, timer, dma }
    }

    /// Attach a simulated controller through `registry`
    pub fn attach_into(registry: &Arc<AdapterRegistry>) -> (Arc<Adapter>, Arc<SimController>) {
        let (dma, sim, timer) = Self::parts();
        let target = Arc::new(PumpTarget {
            adapter: Mutex::new(None),
            registry: Some(Arc::downgrade(registry)),
        });
        let hook_target = Arc::clone(&target);
        timer.set_hook(Arc::new(move || hook_target.pump()));
        let adapter = registry
            .attach(
                Self::config(),
                ChipFamily::Gen2.transport(Arc::clone(&sim) as Arc<dyn RegisterBlock>),
                timer as Arc<dyn Timer>,
                dma as Arc<dyn DmaAllocator>,
            )
            .unwrap();
        // Detach runs after the registry dropped the adapter.
        *target.adapter.lock() = Some(Arc::downgrade(&adapter));
        (adapter, sim)
    }

    fn parts() -> (Arc<HostDmaAllocator>, Arc<SimController>, Arc<SimTimer>) {
        interrupts::install(&SIM_IRQ);
        let dma = Arc::new(HostDmaAllocator::new());
        let sim = Arc::new(SimController::new(Arc::clone(&dma)));
        (dma, sim, Arc::new(SimTimer::default()))
    }

    /// Deliver a pending interrupt and run deferred work
    pub fn pump(&self) {
        if self.sim.irq_pending() {
            self.adapter.handle_interrupt();
        }
        self.adapter.run_deferred();
    }
}
