//! # Adapter Configuration
//!
//! Every tuned constant of the engine lives here instead of in module-level
//! globals. A configuration is handed to [`crate::Adapter::attach`] and never
//! changes afterwards.

use crate::aen::{EventClassLocale, EVENT_QUEUE_CAPACITY};

/// Per-adapter tuning
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Commands reserved for internal and management use
    pub internal_headroom: u16,
    /// Reissues allowed per deferred command before the adapter goes critical
    pub max_reissue_attempts: u8,
    /// Per-state wait while driving firmware to READY (ms)
    pub fw_state_wait_ms: u64,
    /// Wait for internal blocking commands (ms)
    pub internal_cmd_timeout_ms: u64,
    /// Wait for each abort attempt (ms)
    pub abort_timeout_ms: u64,
    /// Abort attempts before escalating to recovery
    pub abort_retries: u8,
    /// Iterations of the wait-for-outstanding loop
    pub reset_wait_iterations: u32,
    /// Sleep between wait-for-outstanding iterations (ms)
    pub reset_poll_interval_ms: u64,
    /// Pump completions every this many iterations
    pub reset_notice_interval: u32,
    /// Settle delay after a chip reset (ms)
    pub post_reset_delay_ms: u64,
    /// Outstanding window while the throttle is engaged
    pub throttle_window: u32,
    /// Outstanding limit while the throttle is released
    pub max_cmd_per_lun: u32,
    /// Minimum time the throttle stays engaged (ms)
    pub throttle_hold_ms: u64,
    /// Allow online controller reset
    pub ocr_enabled: bool,
    /// Use 64-bit SGEs and sense addresses
    pub dma64: bool,
    /// 64-byte frame units per command
    pub frame_units: u16,
    /// Sense buffer size per command
    pub sense_size: u16,
    /// Delivered events kept for local waiters
    pub max_queued_events: usize,
    /// Event filter registered at start
    pub initial_event_filter: EventClassLocale,
    /// Driver version string handed to firmware at INIT
    pub driver_version: &'static str,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            internal_headroom: 32,
            max_reissue_attempts: 3,
            fw_state_wait_ms: 180_000,        // 180s
            internal_cmd_timeout_ms: 180_000, // 180s
            abort_timeout_ms: 10_000,         // 10s
            abort_retries: 3,
            reset_wait_iterations: 10,
            reset_poll_interval_ms: 1_000,
            reset_notice_interval: 5,
            post_reset_delay_ms: 30_000, // 30s
            throttle_window: 16,
            max_cmd_per_lun: 128,
            throttle_hold_ms: 10_000, // 10s
            ocr_enabled: true,
            dma64: false,
            frame_units: 16,
            sense_size: 128,
            max_queued_events: EVENT_QUEUE_CAPACITY,
            initial_event_filter: EventClassLocale::ALL_DEBUG,
            driver_version: "06.506.00.00-rs",
        }
    }
}

impl AdapterConfig {
    /// Check internal consistency
    pub fn is_valid(&self) -> bool {
        self.max_reissue_attempts > 0
            && self.abort_retries > 0
            && self.reset_notice_interval > 0
            && self.reset_poll_interval_ms > 0
            && self.frame_units >= 2
            && self.frame_units <= 64
            && self.sense_size >= 18
            && self.throttle_window > 0
            && self.throttle_window <= self.max_cmd_per_lun
            && self.max_queued_events > 0
            && self.max_queued_events <= EVENT_QUEUE_CAPACITY
            && !self.driver_version.is_empty()
            && self.driver_version.len() < 64
    }

    /// Bytes of frame memory per command
    pub const fn frame_bytes(&self) -> usize {
        self.frame_units as usize * crate::frame::MFI_FRAME_SIZE
    }
}
