//! # Native Controller Commands
//!
//! Every hardware command the core issues is one of three shapes:
//!
//! - [`IoCommand`]: block read/write against a logical drive
//! - [`DcdbCommand`]: SCSI passthrough to a physical drive
//! - [`AdminCommand`]: controller management (flush, enquiry, NVRAM, ...)
//!
//! Data is described by a [`Transfer`], either one contiguous segment or a
//! bounded scatter/gather list.

use crate::hal::{DmaSegment, PhysAddr};
use crate::scsi::Cdb;
use crate::SlotId;
use heapless::Vec as FixedVec;

/// Hard upper bound on scatter/gather entries per command
pub const SG_CAPACITY: usize = 32;

/// Scatter/gather list
pub type SgList = FixedVec<DmaSegment, SG_CAPACITY>;

// =============================================================================
// Native Opcodes
// =============================================================================

/// Controller opcode bytes
pub mod native {
    /// Logical drive read, single buffer
    pub const READ: u8 = 0x02;
    /// Logical drive write, single buffer
    pub const WRITE: u8 = 0x03;
    /// Physical passthrough, single buffer
    pub const DCDB: u8 = 0x04;
    /// Logical drive read, scatter/gather
    pub const READ_SG: u8 = 0x82;
    /// Logical drive write, scatter/gather
    pub const WRITE_SG: u8 = 0x83;
    /// Physical passthrough, scatter/gather
    pub const DCDB_SG: u8 = 0x84;
}

// =============================================================================
// Transfer Descriptor
// =============================================================================

/// Data transfer descriptor for one hardware command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    /// No data phase
    None,
    /// One contiguous buffer
    Single(DmaSegment),
    /// Scatter/gather list
    Scatter(SgList),
}

impl Transfer {
    /// Total bytes described
    pub fn len(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Single(seg) => seg.len,
            Self::Scatter(list) => list.iter().map(|s| s.len).sum(),
        }
    }

    /// Is there no data phase?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of hardware descriptors used
    pub fn segment_count(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Single(_) => 1,
            Self::Scatter(list) => list.len(),
        }
    }

    /// Does the command need the scatter/gather opcode variant?
    pub fn is_scatter(&self) -> bool {
        matches!(self, Self::Scatter(_))
    }

    /// Cut the byte range `offset .. offset + len` out of a caller's segments
    ///
    /// When the range needs more than `max_entries` descriptors it is
    /// shortened at the last segment that fits and then rounded down to a
    /// multiple of `granule`. Returns the descriptor and the bytes it covers,
    /// or `None` if nothing at least one granule long fits.
    pub fn slice(
        segments: &[DmaSegment],
        offset: u64,
        len: u32,
        max_entries: usize,
        granule: u32,
    ) -> Option<(Self, u32)> {
        if len == 0 {
            return Some((Self::None, 0));
        }

        let mut list = SgList::new();
        let mut skip = offset;
        let mut want = len;

        for seg in segments {
            if want == 0 {
                break;
            }
            if skip >= seg.len as u64 {
                skip -= seg.len as u64;
                continue;
            }
            if list.len() >= max_entries {
                break;
            }
            let start = skip as u32;
            let take = (seg.len - start).min(want);
            if list.push(seg.slice(start, take)).is_err() {
                break;
            }
            skip = 0;
            want -= take;
        }

        let mut covered = len - want;
        if want > 0 && granule > 0 {
            let mut excess = covered % granule;
            covered -= excess;
            while excess > 0 {
                let last = list.last_mut()?;
                if last.len <= excess {
                    excess -= last.len;
                    list.pop();
                } else {
                    last.len -= excess;
                    excess = 0;
                }
            }
        }

        match list.len() {
            0 => None,
            1 => Some((Self::Single(list[0]), covered)),
            _ => Some((Self::Scatter(list), covered)),
        }
    }
}

// =============================================================================
// Direction and Timeout
// =============================================================================

/// Logical drive transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    /// Device to host
    Read,
    /// Host to device
    Write,
}

/// Passthrough data phase direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    /// No data phase
    None,
    /// Host to device
    ToDevice,
    /// Device to host
    FromDevice,
}

/// Passthrough timeout class understood by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TimeoutClass {
    /// Up to 10 seconds
    Short = 1,
    /// Up to 60 seconds
    Medium = 2,
    /// Up to 20 minutes
    Long = 3,
}

impl TimeoutClass {
    /// Pick the class covering a caller timeout
    pub const fn from_secs(secs: u32) -> Self {
        if secs <= 10 {
            Self::Short
        } else if secs <= 60 {
            Self::Medium
        } else {
            Self::Long
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

/// Logical drive block transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoCommand {
    /// Slot issuing the command
    pub command_id: SlotId,
    /// Read or write
    pub direction: IoDirection,
    /// Logical drive number
    pub logical_drive: u8,
    /// Starting block
    pub lba: u64,
    /// Block count
    pub sectors: u32,
    /// Data buffer
    pub transfer: Transfer,
}

impl IoCommand {
    /// Native opcode byte
    pub fn opcode(&self) -> u8 {
        match (self.direction, self.transfer.is_scatter()) {
            (IoDirection::Read, false) => native::READ,
            (IoDirection::Read, true) => native::READ_SG,
            (IoDirection::Write, false) => native::WRITE,
            (IoDirection::Write, true) => native::WRITE_SG,
        }
    }
}

/// Physical drive passthrough
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcdbCommand {
    /// Slot issuing the command
    pub command_id: SlotId,
    /// `bus << 4 | target`
    pub device_address: u8,
    /// Data phase direction
    pub direction: DataDirection,
    /// Timeout class
    pub timeout: TimeoutClass,
    /// Bytes to transfer
    pub transfer_length: u32,
    /// Where the controller writes sense data
    pub sense_address: PhysAddr,
    /// The caller's CDB
    pub cdb: Cdb,
    /// Data buffer
    pub transfer: Transfer,
}

impl DcdbCommand {
    /// Encode a device address
    pub const fn encode_address(bus: u8, target: u8) -> u8 {
        (bus << 4) | (target & 0x0F)
    }

    /// Native opcode byte
    pub fn opcode(&self) -> u8 {
        if self.transfer.is_scatter() {
            native::DCDB_SG
        } else {
            native::DCDB
        }
    }
}

/// Controller management opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOpcode {
    /// Flush the controller write cache
    Flush,
    /// Adapter status and logical drive summary
    Enquiry,
    /// Per logical drive information
    GetLogicalDriveInfo,
    /// Subsystem parameters
    GetSubsystemParams,
    /// Read the RAID configuration
    ReadConfiguration,
    /// Read or write NVRAM pages
    RwNvram,
    /// Download a firmware image
    FirmwareDownload,
    /// Change a physical drive state
    SetDriveState,
    /// Any other opcode, passed through unchanged
    RawOpcode(u8),
}

impl AdminOpcode {
    /// Native opcode byte
    pub const fn code(self) -> u8 {
        match self {
            Self::Flush => 0x0A,
            Self::Enquiry => 0x05,
            Self::GetLogicalDriveInfo => 0x19,
            Self::GetSubsystemParams => 0x40,
            Self::ReadConfiguration => 0x38,
            Self::RwNvram => 0xBC,
            Self::FirmwareDownload => 0x20,
            Self::SetDriveState => 0x06,
            Self::RawOpcode(code) => code,
        }
    }
}

/// Controller management command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCommand {
    /// Slot issuing the command
    pub command_id: SlotId,
    /// Operation
    pub opcode: AdminOpcode,
    /// Opcode specific parameter word
    pub param: u32,
    /// Data buffer
    pub buffer: Transfer,
}

/// A command ready to be loaded into a slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeCommand {
    /// Logical drive I/O
    Io(IoCommand),
    /// Physical passthrough
    Dcdb(DcdbCommand),
    /// Management
    Admin(AdminCommand),
}

impl NativeCommand {
    /// Slot this command was built for
    pub fn command_id(&self) -> SlotId {
        match self {
            Self::Io(c) => c.command_id,
            Self::Dcdb(c) => c.command_id,
            Self::Admin(c) => c.command_id,
        }
    }

    /// Native opcode byte
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Io(c) => c.opcode(),
            Self::Dcdb(c) => c.opcode(),
            Self::Admin(c) => c.opcode.code(),
        }
    }

    /// Bytes moved by this command
    pub fn transfer_len(&self) -> u32 {
        match self {
            Self::Io(c) => c.transfer.len(),
            Self::Dcdb(c) => c.transfer.len(),
            Self::Admin(c) => c.buffer.len(),
        }
    }
}
