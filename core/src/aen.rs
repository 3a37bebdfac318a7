//! # Asynchronous Event Notification
//!
//! Firmware reports controller events through one long-lived EVENT_WAIT
//! DCMD. The command sits in firmware until an event at or after the
//! requested sequence number matches the class/locale filter, then
//! completes with the event detail in a dedicated DMA buffer. The completion
//! path decodes it, queues it for local waiters and immediately re-arms the
//! wait at the next sequence number.
//!
//! Exactly one wait is outstanding while the adapter is subscribed.
//! Registering a filter the current one already covers is a no-op; anything
//! wider aborts the current wait and re-registers with the union of both.

use crate::adapter::Adapter;
use crate::error::{CoreError, CoreResult};
use crate::frame::{encode_dcmd, DataDirection, SgElement};
use crate::mfi::*;
use crate::pool::{CommandHandle, CommandKind, Owner, Retired};
use crate::request::ManagementRequest;
use alloc::vec::Vec;
use core::fmt;
use heapless::Deque;
use megasas_hal::{poll_until, DmaAllocator, DmaRegion, HalResult, IrqMutex};

/// Delivered events kept for local waiters (upper bound)
pub const EVENT_QUEUE_CAPACITY: usize = 32;

/// Size of the event detail buffer filled by EVENT_WAIT
pub const EVENT_DETAIL_SIZE: usize = 256;

/// Size of the event log info returned by EVENT_GET_INFO
const EVENT_LOG_INFO_SIZE: usize = 20;

const DETAIL_DESCRIPTION_OFFSET: usize = 128;
const DESCRIPTION_LEN: usize = 128;

/// Poll interval of [`Adapter::wait_for_event`]
const EVENT_POLL_INTERVAL_MS: u64 = 10;

// =============================================================================
// Class and locale
// =============================================================================

/// Event severity; lower values are more verbose
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i8)]
pub enum EventClass {
    /// Debug chatter
    Debug = -2,
    /// Progress reports
    Progress = -1,
    /// Informational
    Info = 0,
    /// Warning
    Warning = 1,
    /// Critical
    Critical = 2,
    /// Fatal
    Fatal = 3,
    /// Controller is dead
    Dead = 4,
}

impl EventClass {
    /// Decode a raw class byte
    pub const fn from_raw(raw: i8) -> Option<Self> {
        Some(match raw {
            -2 => EventClass::Debug,
            -1 => EventClass::Progress,
            0 => EventClass::Info,
            1 => EventClass::Warning,
            2 => EventClass::Critical,
            3 => EventClass::Fatal,
            4 => EventClass::Dead,
            _ => return None,
        })
    }
}

/// Event filter: locale bitmap plus minimum class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventClassLocale {
    /// Locale bitmap (subsystems of interest)
    pub locale: u16,
    /// Minimum class, raw
    pub class: i8,
}

impl EventClassLocale {
    /// Every locale
    pub const LOCALE_ALL: u16 = 0xFFFF;

    /// Everything, debug class and up
    pub const ALL_DEBUG: Self = Self::new(Self::LOCALE_ALL, EventClass::Debug);

    /// Create a filter
    pub const fn new(locale: u16, class: EventClass) -> Self {
        Self { locale, class: class as i8 }
    }

    /// Mailbox word: locale in bits 0..16, class in bits 24..32
    pub const fn word(self) -> u32 {
        self.locale as u32 | ((self.class as u8 as u32) << 24)
    }

    /// Decode a mailbox word
    pub const fn from_word(word: u32) -> Self {
        Self {
            locale: word as u16,
            class: (word >> 24) as u8 as i8,
        }
    }

    /// Whether every event `other` selects is also selected by `self`
    pub fn covers(self, other: Self) -> bool {
        self.class <= other.class && self.locale & other.locale == other.locale
    }

    /// Union of both filters
    pub fn merge(self, other: Self) -> Self {
        Self {
            locale: self.locale | other.locale,
            class: self.class.min(other.class),
        }
    }
}

impl Default for EventClassLocale {
    fn default() -> Self {
        Self::ALL_DEBUG
    }
}

// =============================================================================
// Event detail
// =============================================================================

/// One delivered event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDetail {
    /// Sequence number
    pub seq: u32,
    /// Firmware timestamp
    pub timestamp: u32,
    /// Event code
    pub code: u32,
    /// Class and locale of the event
    pub class_locale: EventClassLocale,
    /// Argument type tag
    pub arg_type: u8,
    /// Human-readable description
    pub description: heapless::String<DESCRIPTION_LEN>,
}

impl EventDetail {
    /// Event class, if firmware sent a known one
    pub fn class(&self) -> Option<EventClass> {
        EventClass::from_raw(self.class_locale.class)
    }

    /// Decode the detail buffer filled by EVENT_WAIT
    pub fn decode(buffer: &DmaRegion) -> HalResult<Self> {
        let mut raw = [0u8; DESCRIPTION_LEN];
        buffer.read_bytes(DETAIL_DESCRIPTION_OFFSET, &mut raw)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let text = match core::str::from_utf8(&raw[..end]) {
            Ok(text) => text,
            Err(e) => core::str::from_utf8(&raw[..e.valid_up_to()]).unwrap_or_default(),
        };
        let mut description = heapless::String::new();
        let _ = description.push_str(text);

        Ok(Self {
            seq: buffer.read_u32(0)?,
            timestamp: buffer.read_u32(4)?,
            code: buffer.read_u32(8)?,
            class_locale: EventClassLocale {
                locale: buffer.read_u16(12)?,
                class: buffer.read_u8(15)? as i8,
            },
            arg_type: buffer.read_u8(16)?,
            description,
        })
    }
}

impl fmt::Display for EventDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} code {:#06x}: {}", self.seq, self.code, self.description)
    }
}

// =============================================================================
// Subscription state
// =============================================================================

/// The subscription as the driver sees it
pub(crate) struct Subscription {
    /// Subscribed at all
    pub(crate) active: bool,
    /// Context of the EVENT_WAIT in firmware
    pub(crate) outstanding: Option<u32>,
    /// Filter of the current wait
    pub(crate) class_locale: EventClassLocale,
    /// Sequence number being waited for
    pub(crate) seq: u32,
}

/// Per-adapter event state and buffers
pub(crate) struct AenState {
    pub(crate) sub: IrqMutex<Subscription>,
    events: IrqMutex<Deque<EventDetail, EVENT_QUEUE_CAPACITY>>,
    limit: usize,
    detail: DmaRegion,
    log_info: DmaRegion,
}

impl AenState {
    pub(crate) fn new(dma: &dyn DmaAllocator, limit: usize) -> CoreResult<Self> {
        let detail = dma.alloc_coherent(EVENT_DETAIL_SIZE, 8)?;
        let log_info = match dma.alloc_coherent(EVENT_LOG_INFO_SIZE, 8) {
            Ok(region) => region,
            Err(e) => {
                dma.free_coherent(&detail);
                return Err(e.into());
            }
        };
        Ok(Self {
            sub: IrqMutex::new(Subscription {
                active: false,
                outstanding: None,
                class_locale: EventClassLocale::ALL_DEBUG,
                seq: 0,
            }),
            events: IrqMutex::new(Deque::new()),
            limit: limit.clamp(1, EVENT_QUEUE_CAPACITY),
            detail,
            log_info,
        })
    }

    pub(crate) fn free_memory(&self, dma: &dyn DmaAllocator) {
        dma.free_coherent(&self.detail);
        dma.free_coherent(&self.log_info);
    }

    fn push(&self, event: EventDetail) {
        let mut events = self.events.lock();
        while events.len() >= self.limit {
            events.pop_front();
        }
        let _ = events.push_back(event);
    }
}

// =============================================================================
// Adapter operations
// =============================================================================

impl Adapter {
    /// Subscribe at the newest sequence number plus one
    pub(crate) fn start_events(&self) -> CoreResult<()> {
        self.aen.log_info.zero();
        let request = ManagementRequest::dcmd_read(
            MR_DCMD_CTRL_EVENT_GET_INFO,
            [0; 12],
            self.aen.log_info.clone(),
        );
        self.submit_blocking(request, self.config.internal_cmd_timeout_ms)?
            .into_result()?;
        let newest = self.aen.log_info.read_u32(0)?;
        log::info!("{}: newest event sequence number {}", self.id, newest);
        self.register_events(newest.wrapping_add(1), self.config.initial_event_filter)
    }

    /// Register for events from `seq` on, matching `filter`
    ///
    /// A filter already covered by the current subscription changes
    /// nothing. Otherwise the current wait is aborted and replaced by one
    /// for the union of both filters.
    pub fn register_events(&self, seq: u32, filter: EventClassLocale) -> CoreResult<()> {
        let mut filter = filter;
        for _ in 0..self.config.abort_retries {
            let current = {
                let sub = self.aen.sub.lock();
                sub.outstanding.map(|context| (context, sub.class_locale))
            };
            let Some((context, previous)) = current else {
                return self.issue_event_wait(seq, filter);
            };
            if previous.covers(filter) {
                log::debug!("{}: event filter {:#010x} already covered", self.id, filter.word());
                return Ok(());
            }

            filter = filter.merge(previous);
            log::info!(
                "{}: widening event filter to {:#010x}",
                self.id,
                filter.word()
            );
            self.abort_event_wait(context)?;
        }
        Err(CoreError::AbortFailed)
    }

    /// Stop the subscription
    pub fn cancel_events(&self) -> CoreResult<()> {
        let current = {
            let mut sub = self.aen.sub.lock();
            sub.active = false;
            sub.outstanding
        };
        match current {
            Some(context) => self.abort_event_wait(context),
            None => Ok(()),
        }
    }

    /// Current event filter, if subscribed
    pub fn event_filter(&self) -> Option<EventClassLocale> {
        let sub = self.aen.sub.lock();
        sub.active.then_some(sub.class_locale)
    }

    /// Drain delivered events, oldest first
    pub fn take_events(&self) -> Vec<EventDetail> {
        let mut events = self.aen.events.lock();
        let mut out = Vec::with_capacity(events.len());
        while let Some(event) = events.pop_front() {
            out.push(event);
        }
        out
    }

    /// Wait up to `timeout_ms` for the next delivered event
    pub fn wait_for_event(&self, timeout_ms: u64) -> Option<EventDetail> {
        let mut event = None;
        poll_until(self.timer.as_ref(), timeout_ms, EVENT_POLL_INTERVAL_MS, || {
            event = self.aen.events.lock().pop_front();
            event.is_some()
        });
        event
    }

    fn abort_event_wait(&self, context: u32) -> CoreResult<()> {
        let generation = self
            .pool
            .slot(context)
            .map(|slot| slot.meta.lock().generation)
            .ok_or(CoreError::InvalidRequest)?;
        self.abort_command(context, generation)?;
        let mut sub = self.aen.sub.lock();
        if sub.outstanding == Some(context) {
            sub.outstanding = None;
        }
        Ok(())
    }

    /// Put an EVENT_WAIT into firmware
    pub(crate) fn issue_event_wait(&self, seq: u32, filter: EventClassLocale) -> CoreResult<()> {
        let handle = self.pool.acquire_internal().ok_or(CoreError::NoCommand)?;
        let slot = self.pool.get(&handle);
        self.aen.detail.zero();

        let mut mbox = [0u8; 12];
        mbox[..4].copy_from_slice(&seq.to_le_bytes());
        mbox[4..8].copy_from_slice(&filter.word().to_le_bytes());
        let sge = SgElement::new(self.aen.detail.phys(), EVENT_DETAIL_SIZE as u32);
        let frame_count = match encode_dcmd(
            slot.frame(),
            handle.context(),
            MR_DCMD_CTRL_EVENT_WAIT,
            &mbox,
            DataDirection::Read,
            self.format,
            &[sge],
        ) {
            Ok(count) => count,
            Err(e) => {
                self.pool.release(handle);
                return Err(e.into());
            }
        };
        {
            let mut meta = slot.meta.lock();
            meta.kind = CommandKind::EventWait;
            meta.owner = Owner::None;
            meta.frame_count = frame_count;
        }
        {
            let mut sub = self.aen.sub.lock();
            sub.active = true;
            sub.outstanding = Some(handle.context());
            sub.class_locale = filter;
            sub.seq = seq;
        }

        if let Err(e) = self.issue(&handle, false) {
            self.aen.sub.lock().outstanding = None;
            self.pool.release(handle);
            return Err(e);
        }
        log::debug!(
            "{}: waiting for event {} (filter {:#010x}) on command {}",
            self.id,
            seq,
            filter.word(),
            handle.context()
        );
        Ok(())
    }

    /// Completion of the EVENT_WAIT: deliver and re-arm
    pub(crate) fn service_event(&self, handle: CommandHandle, retired: Retired) {
        let context = handle.context();
        let status = self.frame_status(self.pool.get(&handle));
        let (current, active, filter) = {
            let mut sub = self.aen.sub.lock();
            let current = sub.outstanding == Some(context);
            if current {
                sub.outstanding = None;
            }
            (current, sub.active, sub.class_locale)
        };

        if !current || retired.abort_requested {
            self.pool.release(handle);
            log::debug!("{}: event wait {} cancelled", self.id, context);
            return;
        }
        if status.cmd_status != MFI_STAT_OK {
            self.pool.release(handle);
            log::error!(
                "{}: event wait failed with status {:#04x}, unsubscribed",
                self.id,
                status.cmd_status
            );
            self.aen.sub.lock().active = false;
            return;
        }

        let decoded = EventDetail::decode(&self.aen.detail);
        self.pool.release(handle);
        let event = match decoded {
            Ok(event) => event,
            Err(e) => {
                log::error!("{}: unreadable event detail: {}", self.id, e);
                return;
            }
        };
        let next = event.seq.wrapping_add(1);
        log::info!("{}: event {}", self.id, event);
        self.aen.push(event);
        self.stats.record_event();

        if !active || self.hba.lock().unloading {
            return;
        }
        if let Err(e) = self.issue_event_wait(next, filter) {
            log::warn!("{}: could not re-arm event wait: {}", self.id, e);
        }
    }

    /// Re-issue the subscription after a controller reset
    pub(crate) fn rearm_events(&self) {
        let (active, seq, filter) = {
            let sub = self.aen.sub.lock();
            (sub.active, sub.seq, sub.class_locale)
        };
        if !active {
            return;
        }
        if let Err(e) = self.issue_event_wait(seq, filter) {
            log::warn!("{}: could not re-register events after reset: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterConfig;
    use crate::sim::Harness;

    #[test]
    fn test_class_locale_word() {
        let cl = EventClassLocale::ALL_DEBUG;
        assert_eq!(cl.word(), 0xFE00_FFFF);
        assert_eq!(EventClassLocale::from_word(cl.word()), cl);
    }

    #[test]
    fn test_covers_and_merge() {
        let wide = EventClassLocale::new(0x00FF, EventClass::Info);
        let narrow = EventClassLocale::new(0x0011, EventClass::Critical);
        assert!(wide.covers(narrow));
        assert!(!narrow.covers(wide));

        let other = EventClassLocale::new(0x0100, EventClass::Warning);
        assert!(!wide.covers(other));
        let merged = wide.merge(other);
        assert_eq!(merged.locale, 0x01FF);
        assert_eq!(merged.class, EventClass::Info as i8);
        assert!(merged.covers(wide) && merged.covers(other));
    }

    #[test]
    fn test_subscribed_at_newest_plus_one() {
        let h = Harness::new();
        let newest = h.sim.newest_event_seq();
        assert_eq!(h.sim.event_wait_seq(), Some(newest + 1));
        assert_eq!(h.adapter.event_filter(), Some(EventClassLocale::ALL_DEBUG));
    }

    #[test]
    fn test_event_delivery_rearms() {
        let h = Harness::new();
        let first = h.sim.push_event(0x0071, EventClass::Info, "LD 0 created");
        h.pump();
        let second = h.sim.push_event(0x0072, EventClass::Warning, "Battery low");
        h.pump();

        let events = h.adapter.take_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, first);
        assert_eq!(events[0].description.as_str(), "LD 0 created");
        assert_eq!(events[1].seq, second);
        assert_eq!(events[1].class(), Some(EventClass::Warning));
        assert_eq!(h.sim.event_wait_seq(), Some(second + 1));
        assert_eq!(h.adapter.statistics().events, 2);
    }

    #[test]
    fn test_rearm_keeps_subscription_filter() {
        let narrow = EventClassLocale::new(0x0001, EventClass::Warning);
        let h = Harness::with_config(AdapterConfig {
            initial_event_filter: narrow,
            ..Harness::config()
        });
        // The event's own class and locale do not narrow or widen the wait.
        let seq = h.sim.push_event(0x0071, EventClass::Critical, "Enclosure removed");
        h.pump();

        assert_eq!(h.adapter.take_events().len(), 1);
        assert_eq!(h.sim.event_wait_seq(), Some(seq + 1));
        assert_eq!(h.sim.event_wait_filter(), Some(narrow.word()));
        assert_eq!(h.adapter.event_filter(), Some(narrow));
    }

    #[test]
    fn test_wait_for_event() {
        let h = Harness::new();
        assert!(h.adapter.wait_for_event(50).is_none());
        h.sim.push_event(0x0010, EventClass::Critical, "Fan failed");
        let event = h.adapter.wait_for_event(1_000).unwrap();
        assert_eq!(event.code, 0x0010);
    }

    #[test]
    fn test_event_queue_drops_oldest() {
        let h = Harness::with_config(AdapterConfig {
            max_queued_events: 2,
            ..Harness::config()
        });
        for code in 1..=3 {
            h.sim.push_event(code, EventClass::Info, "tick");
            h.pump();
        }
        let codes: Vec<u32> = h.adapter.take_events().iter().map(|e| e.code).collect();
        assert_eq!(codes, [2, 3]);
    }

    #[test]
    fn test_covered_registration_is_noop() {
        let h = Harness::new();
        let context = h.sim.event_wait_context();
        h.adapter
            .register_events(1, EventClassLocale::new(0x0001, EventClass::Fatal))
            .unwrap();
        assert_eq!(h.sim.event_wait_context(), context);
        assert_eq!(h.sim.aborts(), 0);
    }

    #[test]
    fn test_wider_registration_aborts_and_merges() {
        let h = Harness::with_config(AdapterConfig {
            initial_event_filter: EventClassLocale::new(0x0001, EventClass::Warning),
            ..Harness::config()
        });
        let seq = h.sim.event_wait_seq().unwrap();
        h.adapter
            .register_events(seq, EventClassLocale::new(0x0010, EventClass::Info))
            .unwrap();
        assert_eq!(h.sim.aborts(), 1);
        let filter = h.adapter.event_filter().unwrap();
        assert_eq!(filter, EventClassLocale::new(0x0011, EventClass::Info));
        assert_eq!(h.sim.event_wait_filter(), Some(filter.word()));
        // Exactly one wait is outstanding.
        assert!(h.sim.event_wait_context().is_some());
        assert!(h.adapter.take_events().is_empty());
    }

    #[test]
    fn test_cancel_stops_delivery() {
        let h = Harness::new();
        h.adapter.cancel_events().unwrap();
        assert_eq!(h.sim.event_wait_context(), None);
        assert_eq!(h.adapter.event_filter(), None);
        h.sim.push_event(0x0001, EventClass::Info, "ignored");
        h.pump();
        assert!(h.adapter.take_events().is_empty());
    }
}
