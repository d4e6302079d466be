//! # SCSI Helpers
//!
//! CDB parsing and the replies synthesised locally for logical drives. The
//! controller does not implement the SCSI command set for its logical drives,
//! so everything except block transfers and cache flushes is answered here
//! without touching hardware.

use crate::command::{DataDirection, IoDirection};
use crate::config::HbaConfig;
use crate::drives::LogicalDrive;
use crate::request::Outcome;
use alloc::vec;
use alloc::vec::Vec;

// =============================================================================
// Constants
// =============================================================================

/// Maximum CDB length
pub const MAX_CDB_LENGTH: usize = 16;

/// Standard inquiry data length
pub const STD_INQUIRY_LENGTH: usize = 36;

/// Fixed format sense data length
pub const FIXED_SENSE_LENGTH: usize = 18;

/// Above this many sectors the large geometry is reported
pub const LARGE_GEOMETRY_THRESHOLD: u64 = 0x40_0000;

/// SCSI operation codes
pub mod opcode {
    /// Test Unit Ready
    pub const TEST_UNIT_READY: u8 = 0x00;
    /// Rezero Unit
    pub const REZERO_UNIT: u8 = 0x01;
    /// Request Sense
    pub const REQUEST_SENSE: u8 = 0x03;
    /// Format Unit
    pub const FORMAT_UNIT: u8 = 0x04;
    /// Read (6)
    pub const READ_6: u8 = 0x08;
    /// Write (6)
    pub const WRITE_6: u8 = 0x0A;
    /// Inquiry
    pub const INQUIRY: u8 = 0x12;
    /// Mode Select (6)
    pub const MODE_SELECT_6: u8 = 0x15;
    /// Reserve (6)
    pub const RESERVE_6: u8 = 0x16;
    /// Release (6)
    pub const RELEASE_6: u8 = 0x17;
    /// Mode Sense (6)
    pub const MODE_SENSE_6: u8 = 0x1A;
    /// Start Stop Unit
    pub const START_STOP_UNIT: u8 = 0x1B;
    /// Receive Diagnostic Results
    pub const RECEIVE_DIAGNOSTIC: u8 = 0x1C;
    /// Send Diagnostic
    pub const SEND_DIAGNOSTIC: u8 = 0x1D;
    /// Prevent/Allow Medium Removal
    pub const PREVENT_ALLOW_MEDIUM: u8 = 0x1E;
    /// Read Capacity (10)
    pub const READ_CAPACITY_10: u8 = 0x25;
    /// Read (10)
    pub const READ_10: u8 = 0x28;
    /// Write (10)
    pub const WRITE_10: u8 = 0x2A;
    /// Write and Verify (10)
    pub const WRITE_VERIFY_10: u8 = 0x2E;
    /// Verify (10)
    pub const VERIFY_10: u8 = 0x2F;
    /// Synchronize Cache (10)
    pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;
    /// Read Defect Data (10)
    pub const READ_DEFECT_DATA_10: u8 = 0x37;
    /// Write Buffer
    pub const WRITE_BUFFER: u8 = 0x3B;
    /// Read Buffer
    pub const READ_BUFFER: u8 = 0x3C;
    /// Log Select
    pub const LOG_SELECT: u8 = 0x4C;
    /// Log Sense
    pub const LOG_SENSE: u8 = 0x4D;
    /// Mode Select (10)
    pub const MODE_SELECT_10: u8 = 0x55;
    /// Reserve (10)
    pub const RESERVE_10: u8 = 0x56;
    /// Release (10)
    pub const RELEASE_10: u8 = 0x57;
    /// Mode Sense (10)
    pub const MODE_SENSE_10: u8 = 0x5A;
    /// Read (16)
    pub const READ_16: u8 = 0x88;
    /// Write (16)
    pub const WRITE_16: u8 = 0x8A;
    /// Verify (16)
    pub const VERIFY_16: u8 = 0x8F;
    /// Synchronize Cache (16)
    pub const SYNCHRONIZE_CACHE_16: u8 = 0x91;
    /// Service Action In (16)
    pub const SERVICE_ACTION_IN_16: u8 = 0x9E;
    /// Report LUNs
    pub const REPORT_LUNS: u8 = 0xA0;
    /// Read (12)
    pub const READ_12: u8 = 0xA8;
    /// Write (12)
    pub const WRITE_12: u8 = 0xAA;

    /// Read Capacity (16) service action
    pub const SA_READ_CAPACITY_16: u8 = 0x10;
}

/// Sense keys
pub mod sense_key {
    /// No sense
    pub const NO_SENSE: u8 = 0x00;
    /// Recovered error
    pub const RECOVERED_ERROR: u8 = 0x01;
    /// Not ready
    pub const NOT_READY: u8 = 0x02;
    /// Medium error
    pub const MEDIUM_ERROR: u8 = 0x03;
    /// Hardware error
    pub const HARDWARE_ERROR: u8 = 0x04;
    /// Illegal request
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    /// Unit attention
    pub const UNIT_ATTENTION: u8 = 0x06;
}

/// Additional sense codes used by local replies
pub mod asc {
    /// Invalid command operation code
    pub const INVALID_OPCODE: u8 = 0x20;
    /// Logical block address out of range
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    /// Invalid field in CDB
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
}

// =============================================================================
// CDB
// =============================================================================

/// Command descriptor block, up to 16 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cdb {
    bytes: [u8; MAX_CDB_LENGTH],
    len: u8,
}

impl Cdb {
    /// Copy a CDB. Returns `None` for an empty or oversized CDB.
    pub fn new(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() > MAX_CDB_LENGTH {
            return None;
        }
        let mut buf = [0u8; MAX_CDB_LENGTH];
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(Self { bytes: buf, len: bytes.len() as u8 })
    }

    /// Operation code
    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }

    /// CDB bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// CDB length
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Always false, a CDB carries at least an opcode
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn byte(&self, index: usize) -> u8 {
        self.as_bytes().get(index).copied().unwrap_or(0)
    }

    fn be16(&self, at: usize) -> u16 {
        u16::from_be_bytes([self.byte(at), self.byte(at + 1)])
    }

    fn be32(&self, at: usize) -> u32 {
        u32::from_be_bytes([self.byte(at), self.byte(at + 1), self.byte(at + 2), self.byte(at + 3)])
    }

    fn be64(&self, at: usize) -> u64 {
        ((self.be32(at) as u64) << 32) | self.be32(at + 4) as u64
    }
}

/// Decode a READ/WRITE CDB into direction, starting block and block count
pub fn rw_range(cdb: &Cdb) -> Option<(IoDirection, u64, u32)> {
    let direction = match cdb.opcode() {
        opcode::READ_6 | opcode::READ_10 | opcode::READ_12 | opcode::READ_16 => IoDirection::Read,
        opcode::WRITE_6 | opcode::WRITE_10 | opcode::WRITE_12 | opcode::WRITE_16 => IoDirection::Write,
        _ => return None,
    };

    let (lba, blocks, min_len) = match cdb.opcode() {
        opcode::READ_6 | opcode::WRITE_6 => {
            let lba = (((cdb.byte(1) & 0x1F) as u64) << 16) | ((cdb.byte(2) as u64) << 8) | cdb.byte(3) as u64;
            // A zero transfer length means 256 blocks
            let blocks = match cdb.byte(4) {
                0 => 256,
                n => n as u32,
            };
            (lba, blocks, 6)
        }
        opcode::READ_10 | opcode::WRITE_10 => (cdb.be32(2) as u64, cdb.be16(7) as u32, 10),
        opcode::READ_12 | opcode::WRITE_12 => (cdb.be32(2) as u64, cdb.be32(6), 12),
        _ => (cdb.be64(2), cdb.be32(10), 16),
    };

    if cdb.len() < min_len {
        return None;
    }
    Some((direction, lba, blocks))
}

/// Is this a cache flush?
pub fn is_sync_cache(cdb: &Cdb) -> bool {
    matches!(cdb.opcode(), opcode::SYNCHRONIZE_CACHE_10 | opcode::SYNCHRONIZE_CACHE_16)
}

/// Data phase direction for a passthrough opcode
pub fn transfer_direction(op: u8) -> DataDirection {
    match op {
        opcode::TEST_UNIT_READY
        | opcode::REZERO_UNIT
        | opcode::RESERVE_6
        | opcode::RELEASE_6
        | opcode::RESERVE_10
        | opcode::RELEASE_10
        | opcode::START_STOP_UNIT
        | opcode::PREVENT_ALLOW_MEDIUM
        | opcode::VERIFY_10
        | opcode::VERIFY_16
        | opcode::SYNCHRONIZE_CACHE_10
        | opcode::SYNCHRONIZE_CACHE_16 => DataDirection::None,

        opcode::FORMAT_UNIT
        | opcode::WRITE_6
        | opcode::WRITE_10
        | opcode::WRITE_12
        | opcode::WRITE_16
        | opcode::WRITE_VERIFY_10
        | opcode::MODE_SELECT_6
        | opcode::MODE_SELECT_10
        | opcode::SEND_DIAGNOSTIC
        | opcode::WRITE_BUFFER
        | opcode::LOG_SELECT => DataDirection::ToDevice,

        _ => DataDirection::FromDevice,
    }
}

/// Build fixed-format sense data
pub fn fixed_sense(key: u8, asc: u8, ascq: u8) -> [u8; FIXED_SENSE_LENGTH] {
    let mut sense = [0u8; FIXED_SENSE_LENGTH];
    sense[0] = 0x70;
    sense[2] = key & 0x0F;
    sense[7] = (FIXED_SENSE_LENGTH - 8) as u8;
    sense[12] = asc;
    sense[13] = ascq;
    sense
}

// =============================================================================
// Local Replies
// =============================================================================

/// A reply produced without issuing a hardware command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalReply {
    /// Result for the caller
    pub outcome: Outcome,
    /// Reply payload, already cut to the allocation length
    pub data: Vec<u8>,
    /// Sense data for a failed reply
    pub sense: Option<Vec<u8>>,
}

impl LocalReply {
    /// Success with a payload
    pub fn ok(data: Vec<u8>) -> Self {
        Self { outcome: Outcome::Success, data, sense: None }
    }

    /// Bare status, no data
    pub fn status(outcome: Outcome) -> Self {
        Self { outcome, data: Vec::new(), sense: None }
    }

    /// Check condition with fixed sense
    pub fn check(key: u8, code: u8) -> Self {
        Self {
            outcome: Outcome::FatalError,
            data: Vec::new(),
            sense: Some(fixed_sense(key, code, 0).to_vec()),
        }
    }

    fn truncated(mut data: Vec<u8>, alloc: usize) -> Self {
        data.truncate(alloc);
        Self::ok(data)
    }
}

/// Answer a non-transfer command addressed to a logical drive
pub fn synthesize(cdb: &Cdb, drive: &LogicalDrive, config: &HbaConfig) -> LocalReply {
    match cdb.opcode() {
        opcode::TEST_UNIT_READY
        | opcode::REZERO_UNIT
        | opcode::FORMAT_UNIT
        | opcode::RESERVE_6
        | opcode::RELEASE_6
        | opcode::RESERVE_10
        | opcode::RELEASE_10
        | opcode::START_STOP_UNIT
        | opcode::SEND_DIAGNOSTIC
        | opcode::PREVENT_ALLOW_MEDIUM
        | opcode::VERIFY_10
        | opcode::VERIFY_16 => LocalReply::status(Outcome::Success),
        opcode::INQUIRY => inquiry(cdb, config),
        opcode::REQUEST_SENSE => {
            let sense = fixed_sense(sense_key::NO_SENSE, 0, 0);
            LocalReply::truncated(sense.to_vec(), cdb.byte(4) as usize)
        }
        opcode::READ_CAPACITY_10 => read_capacity_10(drive, config),
        opcode::SERVICE_ACTION_IN_16 if cdb.byte(1) & 0x1F == opcode::SA_READ_CAPACITY_16 => {
            read_capacity_16(cdb, drive, config)
        }
        opcode::MODE_SENSE_6 | opcode::MODE_SENSE_10 => mode_sense(cdb, drive, config),
        _ => LocalReply::check(sense_key::ILLEGAL_REQUEST, asc::INVALID_OPCODE),
    }
}

fn inquiry(cdb: &Cdb, config: &HbaConfig) -> LocalReply {
    let alloc = cdb.be16(3) as usize;

    if cdb.byte(1) & 0x01 != 0 {
        // Only the supported-pages page is implemented
        if cdb.byte(2) != 0x00 {
            return LocalReply::check(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
        }
        return LocalReply::truncated(vec![0x00, 0x00, 0x00, 0x01, 0x00], alloc);
    }

    let mut data = vec![0u8; STD_INQUIRY_LENGTH];
    data[0] = 0x00; // direct access block device
    data[2] = 0x05; // SPC-3
    data[3] = 0x02; // response data format
    data[4] = (STD_INQUIRY_LENGTH - 5) as u8;
    data[7] = 0x02; // command queueing
    data[8..16].copy_from_slice(&config.vendor_id);
    data[16..32].copy_from_slice(&config.product_id);
    data[32..36].copy_from_slice(b"1.00");
    LocalReply::truncated(data, alloc)
}

fn read_capacity_10(drive: &LogicalDrive, config: &HbaConfig) -> LocalReply {
    let last = drive.sectors.saturating_sub(1).min(u32::MAX as u64) as u32;
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&last.to_be_bytes());
    data.extend_from_slice(&config.block_size.to_be_bytes());
    LocalReply::ok(data)
}

fn read_capacity_16(cdb: &Cdb, drive: &LogicalDrive, config: &HbaConfig) -> LocalReply {
    let mut data = vec![0u8; 32];
    data[0..8].copy_from_slice(&drive.sectors.saturating_sub(1).to_be_bytes());
    data[8..12].copy_from_slice(&config.block_size.to_be_bytes());
    LocalReply::truncated(data, cdb.be32(10) as usize)
}

// =============================================================================
// Mode Sense
// =============================================================================

/// Heads and sectors per track reported for a drive size
pub fn geometry(sectors: u64) -> (u8, u8) {
    if sectors > LARGE_GEOMETRY_THRESHOLD {
        (254, 63)
    } else {
        (128, 32)
    }
}

fn format_page(config: &HbaConfig, sectors_per_track: u8) -> [u8; 24] {
    let mut page = [0u8; 24];
    page[0] = 0x03;
    page[1] = 0x16;
    page[10..12].copy_from_slice(&(sectors_per_track as u16).to_be_bytes());
    page[12..14].copy_from_slice(&(config.block_size as u16).to_be_bytes());
    page[20] = 0x80; // soft sectoring
    page
}

fn geometry_page(sectors: u64, heads: u8, sectors_per_track: u8) -> [u8; 24] {
    let cylinders = (sectors / (heads as u64 * sectors_per_track as u64)).min(0xFF_FFFF) as u32;
    let mut page = [0u8; 24];
    page[0] = 0x04;
    page[1] = 0x16;
    page[2..5].copy_from_slice(&cylinders.to_be_bytes()[1..4]);
    page[5] = heads;
    page[20..22].copy_from_slice(&10_000u16.to_be_bytes());
    page
}

fn caching_page() -> [u8; 20] {
    let mut page = [0u8; 20];
    page[0] = 0x08;
    page[1] = 0x12;
    page
}

fn mode_sense(cdb: &Cdb, drive: &LogicalDrive, config: &HbaConfig) -> LocalReply {
    let ten = cdb.opcode() == opcode::MODE_SENSE_10;
    let dbd = cdb.byte(1) & 0x08 != 0;
    let page_code = cdb.byte(2) & 0x3F;
    let alloc = if ten { cdb.be16(7) as usize } else { cdb.byte(4) as usize };
    let (heads, spt) = geometry(drive.sectors);

    let mut pages = Vec::new();
    match page_code {
        0x03 => pages.extend_from_slice(&format_page(config, spt)),
        0x04 => pages.extend_from_slice(&geometry_page(drive.sectors, heads, spt)),
        0x08 => pages.extend_from_slice(&caching_page()),
        0x3F => {
            pages.extend_from_slice(&format_page(config, spt));
            pages.extend_from_slice(&geometry_page(drive.sectors, heads, spt));
            pages.extend_from_slice(&caching_page());
        }
        _ => return LocalReply::check(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB),
    }

    let mut descriptor = Vec::new();
    if !dbd {
        let blocks = drive.sectors.min(0xFF_FFFF) as u32;
        descriptor.push(0x00);
        descriptor.extend_from_slice(&blocks.to_be_bytes()[1..4]);
        descriptor.push(0x00);
        descriptor.extend_from_slice(&config.block_size.to_be_bytes()[1..4]);
    }

    let mut data = Vec::new();
    if ten {
        let total = 8 + descriptor.len() + pages.len();
        data.extend_from_slice(&((total - 2) as u16).to_be_bytes());
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(&(descriptor.len() as u16).to_be_bytes());
    } else {
        let total = 4 + descriptor.len() + pages.len();
        data.push((total - 1) as u8);
        data.push(0);
        data.push(0);
        data.push(descriptor.len() as u8);
    }
    data.extend_from_slice(&descriptor);
    data.extend_from_slice(&pages);
    LocalReply::truncated(data, alloc)
}
