//! # Hardware Collaborator Interface
//!
//! The core never touches registers or DMA memory directly. A hardware-access
//! layer implements [`HbaHardware`] for one physical controller and hands it to
//! [`AdapterContext::attach`](crate::AdapterContext::attach).
//!
//! ## Command Block Memory
//!
//! ```text
//! command_base
//! ┌──────────────┬──────────────┬─────┬──────────────────────┐
//! │ slot 0       │ slot 1       │ ... │ slot N-1 (reserved)  │
//! └──────────────┴──────────────┴─────┴──────────────────────┘
//!  ◄─ COMMAND_BLOCK_SIZE ─►
//!
//! one slot:
//! ┌─────────────────────────────────────┬──────────────────┐
//! │ native command + S/G list           │ sense buffer     │
//! │ 0 .. SENSE_OFFSET                   │ SENSE_BUFFER_LEN │
//! └─────────────────────────────────────┴──────────────────┘
//! ```

use crate::command::NativeCommand;
use crate::SlotId;
use core::fmt;

// =============================================================================
// Memory Types
// =============================================================================

/// Bytes of coherent DMA memory backing one command block
pub const COMMAND_BLOCK_SIZE: u64 = 256;

/// Offset of the sense buffer inside a command block
pub const SENSE_OFFSET: u64 = 192;

/// Size of the per-slot sense buffer
pub const SENSE_BUFFER_LEN: usize = 64;

/// Bus address as seen by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create a new physical address
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get as u64
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Add an offset
    pub const fn add(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// One DMA-mapped piece of a caller buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    /// Bus address of the first byte
    pub addr: PhysAddr,
    /// Length in bytes
    pub len: u32,
}

impl DmaSegment {
    /// Create a new segment
    pub const fn new(addr: u64, len: u32) -> Self {
        Self { addr: PhysAddr::new(addr), len }
    }

    /// Sub-range of this segment
    pub const fn slice(&self, offset: u32, len: u32) -> Self {
        Self { addr: self.addr.add(offset as u64), len }
    }
}

// =============================================================================
// Status Ring
// =============================================================================

/// Decoded status ring entry
///
/// Raw layout: bits 8..16 command id, 16..24 basic status, 24..32 extended
/// status. Bits 0..8 are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStatus {
    /// Slot that completed
    pub command_id: SlotId,
    /// Basic status byte
    pub basic: u8,
    /// Extended status byte
    pub extended: u8,
}

impl RingStatus {
    /// Decode a raw status word
    pub const fn from_raw(raw: u32) -> Self {
        Self {
            command_id: SlotId::new((raw >> 8) as u8),
            basic: (raw >> 16) as u8,
            extended: (raw >> 24) as u8,
        }
    }

    /// Encode into a raw status word
    pub const fn to_raw(self) -> u32 {
        ((self.command_id.raw() as u32) << 8)
            | ((self.basic as u32) << 16)
            | ((self.extended as u32) << 24)
    }
}

// =============================================================================
// Hardware Trait
// =============================================================================

/// Register and DMA access for one controller
///
/// Calls are made with the adapter lock held, so implementations must not
/// block and must not call back into the adapter.
pub trait HbaHardware: Send {
    /// Is the command doorbell still owned by the controller?
    fn doorbell_busy(&mut self) -> bool;

    /// Write a prepared command into the slot's coherent memory at `address`
    fn load_command(&mut self, address: PhysAddr, command: &NativeCommand);

    /// Hand the command block at `address` to the controller
    fn start_command(&mut self, address: PhysAddr);

    /// Does the status ring hold an unconsumed entry?
    fn ring_has_entry(&mut self) -> bool;

    /// Pop the next raw status word
    fn ring_pop(&mut self) -> u32;

    /// Publish the new ring tail index
    fn set_ring_tail(&mut self, tail: u32);

    /// Copy sense bytes out of coherent memory at `address`
    fn fetch_sense(&mut self, address: PhysAddr, buf: &mut [u8]);

    /// Reset the controller. Returns false if it did not come back.
    fn adapter_reset(&mut self) -> bool;
}
