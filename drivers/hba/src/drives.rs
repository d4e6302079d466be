//! # Logical Drive Table
//!
//! Cached per-adapter view of the RAID volumes, filled in by the bring-up
//! layer from the controller's enquiry data.

use alloc::vec;
use alloc::vec::Vec;

/// Logical drive state as reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    /// Fully redundant
    Online,
    /// Running without redundancy
    Degraded,
    /// Redundancy being rebuilt
    Rebuilding,
    /// Not accessible
    Offline,
}

/// One logical drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalDrive {
    /// Capacity in blocks
    pub sectors: u64,
    /// Current state
    pub state: DriveState,
    /// RAID level
    pub raid_level: u8,
}

impl LogicalDrive {
    /// Create an online drive
    pub const fn online(sectors: u64, raid_level: u8) -> Self {
        Self { sectors, state: DriveState::Online, raid_level }
    }

    /// Can commands be sent to this drive?
    pub const fn is_accessible(&self) -> bool {
        !matches!(self.state, DriveState::Offline)
    }

    /// Does `lba .. lba + blocks` fit on the drive?
    pub fn contains(&self, lba: u64, blocks: u32) -> bool {
        lba.checked_add(blocks as u64).map_or(false, |end| end <= self.sectors)
    }
}

/// Fixed-size table indexed by drive number
#[derive(Debug)]
pub struct DriveTable {
    drives: Vec<Option<LogicalDrive>>,
}

impl DriveTable {
    /// Create an empty table
    pub fn new(capacity: usize) -> Self {
        Self { drives: vec![None; capacity] }
    }

    /// Install or replace a drive. Returns false if `index` is out of range.
    pub fn set(&mut self, index: u8, drive: LogicalDrive) -> bool {
        match self.drives.get_mut(index as usize) {
            Some(entry) => {
                *entry = Some(drive);
                true
            }
            None => false,
        }
    }

    /// Remove a drive
    pub fn clear(&mut self, index: u8) -> Option<LogicalDrive> {
        self.drives.get_mut(index as usize).and_then(Option::take)
    }

    /// Look up a drive that can accept commands
    pub fn get(&self, index: u8) -> Option<&LogicalDrive> {
        self.drives
            .get(index as usize)
            .and_then(Option::as_ref)
            .filter(|d| d.is_accessible())
    }

    /// Number of installed drives
    pub fn count(&self) -> usize {
        self.drives.iter().filter(|d| d.is_some()).count()
    }
}
