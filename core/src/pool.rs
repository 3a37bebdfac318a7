//! # Command Pool
//!
//! A fixed array of commands created at attach. Each command owns one frame
//! area (`frame_units` × 64 bytes) and one sense buffer, carved out of two
//! coherent allocations. The command's index in the array is its context:
//! firmware echoes it back in the reply queue and the completion path maps
//! it straight back to the slot.
//!
//! Commands are handed out as non-clonable [`CommandHandle`]s, so a command
//! is either on the free list or held by exactly one owner. A few commands
//! are held back from I/O as headroom so management and recovery traffic
//! can always make progress.

use crate::error::{CoreError, CoreResult};
use crate::request::{Completion, IoResult, ManagementResult};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::mem;
use megasas_hal::{DmaAllocator, DmaRegion, IrqMutex, PhysAddr};

/// Frame memory alignment
const FRAME_ALIGN: usize = 64;

/// What a command is currently being used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// On the free list
    Idle,
    /// Midlayer I/O
    Io,
    /// Management action (DCMD or pass-through)
    Management,
    /// ABORT frame
    Abort,
    /// Long-lived EVENT_WAIT
    EventWait,
    /// INIT handshake
    Init,
}

/// Lifecycle of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// On the free list
    Free,
    /// Acquired and being encoded
    Prepared,
    /// Handed to firmware
    InFlight,
    /// Parked on the deferred queue during recovery
    Deferred,
}

/// Who is waiting for a command's result
pub(crate) enum Owner {
    /// Nobody (event waits, INIT)
    None,
    /// An I/O ticket
    Io(Arc<Completion<IoResult>>),
    /// A management ticket
    Management(Arc<Completion<CoreResult<ManagementResult>>>),
    /// A blocking abort
    Abort(Arc<Completion<u8>>),
}

impl Owner {
    /// Fail the waiter, if any, with an adapter-offline result
    pub(crate) fn fail(self, io: IoResult) {
        match self {
            Owner::Io(slot) => slot.complete(io),
            Owner::Management(slot) => slot.complete(Err(CoreError::Offline)),
            Owner::Abort(slot) => slot.complete(crate::mfi::MFI_STAT_ABORT_NOT_POSSIBLE),
            Owner::None => {}
        }
    }
}

/// What a retired command was carrying
pub(crate) struct Retired {
    pub(crate) kind: CommandKind,
    pub(crate) owner: Owner,
    pub(crate) orphaned: bool,
    pub(crate) abort_requested: bool,
}

/// Mutable per-command bookkeeping
pub(crate) struct CommandMeta {
    pub(crate) kind: CommandKind,
    pub(crate) state: CommandState,
    pub(crate) owner: Owner,
    /// Frame units the encoded request occupies
    pub(crate) frame_count: u8,
    /// Reissues after controller resets
    pub(crate) reissues: u8,
    /// An abort was issued for this command
    pub(crate) abort_requested: bool,
    /// The owner gave up; the reply is discarded
    pub(crate) orphaned: bool,
    /// Bumped on every acquire
    pub(crate) generation: u32,
    /// Payload kept alive while firmware may touch it
    pub(crate) buffer: Option<DmaRegion>,
}

impl CommandMeta {
    fn idle(generation: u32) -> Self {
        Self {
            kind: CommandKind::Idle,
            state: CommandState::Free,
            owner: Owner::None,
            frame_count: 1,
            reissues: 0,
            abort_requested: false,
            orphaned: false,
            generation,
            buffer: None,
        }
    }

    /// Whether the command carries a caller request (counted as outstanding)
    pub(crate) fn is_request(&self) -> bool {
        matches!(self.kind, CommandKind::Io | CommandKind::Management)
    }
}

/// One command of the pool
pub struct CommandSlot {
    context: u32,
    frame: DmaRegion,
    sense: DmaRegion,
    pub(crate) meta: IrqMutex<CommandMeta>,
}

impl CommandSlot {
    /// Context tag (index in the pool)
    pub fn context(&self) -> u32 {
        self.context
    }

    /// Frame memory
    pub fn frame(&self) -> &DmaRegion {
        &self.frame
    }

    /// Bus address of the frame
    pub fn frame_phys(&self) -> PhysAddr {
        self.frame.phys()
    }

    /// Sense buffer
    pub fn sense(&self) -> &DmaRegion {
        &self.sense
    }

    /// Current lifecycle state
    pub fn state(&self) -> CommandState {
        self.meta.lock().state
    }

    /// Current use
    pub fn kind(&self) -> CommandKind {
        self.meta.lock().kind
    }

    /// Reissues so far
    pub fn reissues(&self) -> u8 {
        self.meta.lock().reissues
    }
}

impl fmt::Debug for CommandSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = self.meta.lock();
        f.debug_struct("CommandSlot")
            .field("context", &self.context)
            .field("kind", &meta.kind)
            .field("state", &meta.state)
            .field("reissues", &meta.reissues)
            .finish()
    }
}

/// Exclusive claim on one command
///
/// Not `Clone`: returning it to the pool consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct CommandHandle {
    context: u32,
    generation: u32,
}

impl CommandHandle {
    /// Context tag of the claimed command
    pub fn context(&self) -> u32 {
        self.context
    }

    /// Acquire generation of the claimed command
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Fixed pool of commands
pub struct CommandPool {
    slots: Vec<CommandSlot>,
    free: IrqMutex<VecDeque<u32>>,
    headroom: usize,
    frame_area: DmaRegion,
    sense_area: DmaRegion,
}

impl CommandPool {
    /// Allocate `count` commands
    ///
    /// `headroom` commands are only available through
    /// [`CommandPool::acquire_internal`].
    pub fn new(
        dma: &dyn DmaAllocator,
        count: u16,
        headroom: u16,
        frame_bytes: usize,
        sense_size: usize,
    ) -> CoreResult<Self> {
        if count == 0 || frame_bytes < crate::frame::MFI_FRAME_SIZE || sense_size == 0 {
            return Err(CoreError::InvalidRequest);
        }
        let count = count as usize;
        let frame_area = dma.alloc_coherent(count * frame_bytes, FRAME_ALIGN)?;
        let sense_area = match dma.alloc_coherent(count * sense_size, 4) {
            Ok(area) => area,
            Err(e) => {
                dma.free_coherent(&frame_area);
                return Err(e.into());
            }
        };

        let mut slots = Vec::with_capacity(count);
        for i in 0..count {
            slots.push(CommandSlot {
                context: i as u32,
                frame: frame_area.slice(i * frame_bytes, frame_bytes)?,
                sense: sense_area.slice(i * sense_size, sense_size)?,
                meta: IrqMutex::new(CommandMeta::idle(0)),
            });
        }

        log::debug!(
            "pool: {} commands, {} bytes of frames each, headroom {}",
            count,
            frame_bytes,
            headroom
        );

        Ok(Self {
            slots,
            free: IrqMutex::new((0..count as u32).collect()),
            headroom: (headroom as usize).min(count - 1),
            frame_area,
            sense_area,
        })
    }

    /// Take a command for I/O, leaving the headroom untouched
    pub fn acquire(&self) -> Option<CommandHandle> {
        let context = {
            let mut free = self.free.lock();
            if free.len() <= self.headroom {
                return None;
            }
            free.pop_front()?
        };
        Some(self.claim(context))
    }

    /// Take any free command, including the headroom
    pub fn acquire_internal(&self) -> Option<CommandHandle> {
        let context = self.free.lock().pop_front()?;
        Some(self.claim(context))
    }

    fn claim(&self, context: u32) -> CommandHandle {
        let slot = &self.slots[context as usize];
        let mut meta = slot.meta.lock();
        let generation = meta.generation.wrapping_add(1);
        *meta = CommandMeta::idle(generation);
        meta.state = CommandState::Prepared;
        CommandHandle { context, generation }
    }

    /// Return a command to the free list
    pub fn release(&self, handle: CommandHandle) {
        let slot = &self.slots[handle.context as usize];
        {
            let mut meta = slot.meta.lock();
            let generation = meta.generation;
            *meta = CommandMeta::idle(generation);
        }
        self.free.lock().push_back(handle.context);
    }

    /// Take a command back from firmware or the recovery engine
    ///
    /// If `accept` approves the command's bookkeeping, the command moves to
    /// Prepared and its owner is handed to the caller together with a handle
    /// to release it with. Only one caller can retire a given command.
    pub(crate) fn retire<F>(&self, context: u32, accept: F) -> Option<(CommandHandle, Retired)>
    where
        F: FnOnce(&CommandMeta) -> bool,
    {
        let slot = self.slots.get(context as usize)?;
        let mut meta = slot.meta.lock();
        if meta.state == CommandState::Free || !accept(&meta) {
            return None;
        }
        meta.state = CommandState::Prepared;
        meta.buffer = None;
        let retired = Retired {
            kind: meta.kind,
            owner: mem::replace(&mut meta.owner, Owner::None),
            orphaned: meta.orphaned,
            abort_requested: meta.abort_requested,
        };
        Some((CommandHandle { context, generation: meta.generation }, retired))
    }

    /// Slot for `context`
    pub fn slot(&self, context: u32) -> Option<&CommandSlot> {
        self.slots.get(context as usize)
    }

    /// Slot of a held command
    pub fn get(&self, handle: &CommandHandle) -> &CommandSlot {
        &self.slots[handle.context as usize]
    }

    /// All slots, in context order
    pub fn slots(&self) -> impl Iterator<Item = &CommandSlot> {
        self.slots.iter()
    }

    /// Number of commands
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool is empty (never true for a constructed pool)
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Commands on the free list
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Commands reserved from I/O
    pub fn headroom(&self) -> usize {
        self.headroom
    }

    /// Give the backing memory back to the allocator
    pub(crate) fn free_memory(&self, dma: &dyn DmaAllocator) {
        dma.free_coherent(&self.frame_area);
        dma.free_coherent(&self.sense_area);
    }
}

impl fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandPool")
            .field("commands", &self.slots.len())
            .field("free", &self.free_count())
            .field("headroom", &self.headroom)
            .finish()
    }
}
