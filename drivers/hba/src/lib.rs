//! # Helix HBA - RAID Host Bus Adapter Command Core
//!
//! This crate is the command-queueing and DMA slot management core of the
//! Helix driver for hardware RAID controllers. The controller exposes logical
//! drives (RAID volumes) and physical drives behind a small, fixed number of
//! hardware command slots. The core accepts an unbounded stream of block I/O
//! and administrative requests, multiplexes them onto that slot pool,
//! translates them into native controller commands, splits oversized
//! transfers, and reconciles interrupt-driven completions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  OS storage stack  │ submit │ submit_admin │ abort │ reset │ on_interrupt │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  Queue Set         │  admin-wait  │  wait  │  active                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  Dispatcher        │  local replies  │  breakup  │  S/G construction     │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  Issuer            │  doorbell poll  │  start command                     │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  Completion Engine │  status ring drain  │  Status Mapper               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  Slot Pool         │  N-1 caller slots  │  1 reserved internal slot     │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  Hardware          │  HbaHardware (registers, DMA memory, reset)         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use helix_hba::{AdapterContext, HbaConfig, ScsiRequest, TargetAddr, RequestId};
//!
//! let adapter = AdapterContext::attach(HbaConfig::default(), controller, command_base)?;
//! adapter.submit(ScsiRequest::new(RequestId::new(1), TargetAddr::logical(0), cdb, |done| {
//!     // hand `done` back to the block layer
//! }));
//!
//! // From the interrupt dispatch layer:
//! adapter.on_interrupt();
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod adapter;
pub mod command;
pub mod config;
pub mod drives;
pub mod hal;
mod pool;
pub mod queue;
pub mod request;
pub mod scsi;
pub mod stats;
pub mod status;

mod completion;
mod dispatch;
mod issuer;
mod recovery;
mod waiter;

#[cfg(test)]
mod mock;
#[cfg(test)]
mod tests;

// =============================================================================
// Re-exports
// =============================================================================

pub use adapter::{AdapterContext, AdapterFlags, QueueDepths};
pub use command::{AdminCommand, AdminOpcode, DcdbCommand, IoCommand, NativeCommand, Transfer};
pub use config::{HbaConfig, WaitMode};
pub use drives::{DriveState, LogicalDrive};
pub use hal::{DmaSegment, HbaHardware, PhysAddr, RingStatus};
pub use issuer::IssueError;
pub use request::{AdminRequest, Completion, Outcome, ScsiRequest};
pub use scsi::Cdb;
pub use stats::StatsSnapshot;

use core::fmt;

// =============================================================================
// Core Types
// =============================================================================

/// Hardware slot identifier
///
/// The index of a command block in the pool. The controller echoes it back in
/// the status ring as the 8-bit command id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SlotId(u8);

impl SlotId {
    /// Create a slot id from the raw command id
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Get the raw command id
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Index into the pool
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Caller request identifier, assigned by the OS storage stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Create a new request ID
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

/// Device address behind the adapter
///
/// Bus 0 addresses logical drives (the target is the drive number). Buses
/// starting at 1 are the physical channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetAddr {
    /// Channel
    pub bus: u8,
    /// Target id on the channel
    pub target: u8,
    /// Logical unit
    pub lun: u8,
}

impl TargetAddr {
    /// Bus number used for logical drives
    pub const LOGICAL_BUS: u8 = 0;

    /// Address a logical drive
    pub const fn logical(drive: u8) -> Self {
        Self { bus: Self::LOGICAL_BUS, target: drive, lun: 0 }
    }

    /// Address a physical device on a channel
    pub const fn physical(bus: u8, target: u8) -> Self {
        Self { bus, target, lun: 0 }
    }

    /// Set the logical unit
    pub const fn with_lun(mut self, lun: u8) -> Self {
        self.lun = lun;
        self
    }

    /// Does this address a logical drive?
    pub const fn is_logical(&self) -> bool {
        self.bus == Self::LOGICAL_BUS
    }

    /// Does this address a physical device (DCDB passthrough)?
    pub const fn is_physical(&self) -> bool {
        !self.is_logical()
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Result type for adapter operations
pub type HbaResult<T> = Result<T, HbaError>;

/// Errors reported by the adapter core itself
///
/// Caller-visible command outcomes are not errors; they travel through the
/// completion sink as [`Outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HbaError {
    /// The doorbell stayed busy for the whole poll budget
    Busy,
    /// No free slot or waiter
    ResourceExhausted,
    /// A previous reset failed; the adapter is out of service
    Unavailable,
    /// A reset or abort is already running
    InResetOrAbort,
    /// The request cannot be expressed as a controller command
    InvalidRequest(&'static str),
    /// Configuration rejected at attach time
    InvalidConfig(&'static str),
    /// An internal command did not complete within its poll budget
    Timeout,
    /// An internal command completed with an error status
    CommandFailed {
        /// Basic status byte
        basic: u8,
        /// Extended status byte
        extended: u8,
    },
}

impl fmt::Display for HbaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "Adapter doorbell busy"),
            Self::ResourceExhausted => write!(f, "No free command slot or waiter"),
            Self::Unavailable => write!(f, "Adapter unavailable after failed reset"),
            Self::InResetOrAbort => write!(f, "Reset or abort already in progress"),
            Self::InvalidRequest(reason) => write!(f, "Invalid request: {}", reason),
            Self::InvalidConfig(reason) => write!(f, "Invalid configuration: {}", reason),
            Self::Timeout => write!(f, "Internal command timed out"),
            Self::CommandFailed { basic, extended } => {
                write!(f, "Command failed: basic={:#04x}, extended={:#04x}", basic, extended)
            }
        }
    }
}

impl From<IssueError> for HbaError {
    fn from(e: IssueError) -> Self {
        match e {
            IssueError::Busy { .. } => Self::Busy,
        }
    }
}
