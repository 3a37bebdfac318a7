//! # MegaSAS Core - MFI Command Lifecycle and Recovery Engine
//!
//! The controller engine for LSI MegaRAID SAS adapters speaking the MFI
//! frame protocol. It owns everything between the SCSI midlayer (or a
//! management client) and the controller's registers:
//!
//! - a fixed pool of commands, each with its own DMA frame and sense buffer
//! - frame encoding and chip-family specific firing
//! - the reply ring, drained by an interrupt top half and a deferred bottom half
//! - the firmware state machine and INIT handshake
//! - online controller reset: defer, reset, replay, or go offline for good
//! - the asynchronous event subscription
//!
//! ## Host integration
//!
//! A host provides a [`megasas_hal::RegisterBlock`], a
//! [`megasas_hal::DmaAllocator`] and a [`megasas_hal::Timer`], picks the
//! [`ChipFamily`] from the PCI device id and attaches through an
//! [`AdapterRegistry`]. Its interrupt handler calls
//! [`Adapter::handle_interrupt`] and, when that returns
//! [`megasas_hal::IrqReturn::WakeThread`], schedules
//! [`Adapter::run_deferred`] in thread context.
//!
//! Requests are submitted with [`Adapter::submit_io`] and
//! [`Adapter::submit_management`]; both return a [`Ticket`] that resolves
//! exactly once, either with the firmware's answer or with a failure from
//! the recovery engine.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod adapter;
pub mod aen;
pub mod blocking;
pub mod completion;
pub mod config;
pub mod error;
pub mod firmware;
pub mod frame;
pub mod mfi;
pub mod pool;
pub mod recovery;
pub mod registry;
pub mod request;
pub mod ring;
pub mod stats;
pub mod submit;
pub mod transport;
pub mod workqueue;

#[cfg(test)]
mod sim;

pub use adapter::{Adapter, RecoveryState};
pub use aen::{EventClass, EventClassLocale, EventDetail};
pub use config::AdapterConfig;
pub use error::{CoreError, CoreResult};
pub use frame::{DataDirection, SgElement, SglFormat};
pub use mfi::FwState;
pub use pool::{CommandKind, CommandPool, CommandState};
pub use registry::{AdapterId, AdapterRegistry};
pub use request::{HostStatus, IoRequest, IoResult, ManagementRequest, ManagementResult, Ticket};
pub use stats::AdapterStatistics;
pub use transport::{ChipFamily, InterruptCause, Transport};
