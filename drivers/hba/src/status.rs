//! # Status Mapper
//!
//! Translates the controller's basic/extended status pair into an
//! [`Outcome`]. [`map_status`] is a pure function of its inputs.

use crate::request::Outcome;
use crate::scsi::opcode;

/// Basic status codes (low nibble of the basic status byte)
pub mod basic {
    /// Command completed
    pub const SUCCESS: u8 = 0x00;
    /// Completed after recovery
    pub const RECOVERED: u8 = 0x01;
    /// Opcode not supported
    pub const INVALID_OPCODE: u8 = 0x03;
    /// Malformed command block
    pub const INVALID_CMD_BLK: u8 = 0x04;
    /// Bad parameter
    pub const INVALID_PARAM: u8 = 0x05;
    /// Controller busy
    pub const BUSY: u8 = 0x08;
    /// Completed with error
    pub const CMPLT_WERROR: u8 = 0x0C;
    /// Logical drive error
    pub const LD_ERROR: u8 = 0x0D;
    /// Command timed out in the controller
    pub const CMD_TIMEOUT: u8 = 0x0E;
    /// Physical drive error
    pub const PHYS_DRV_ERROR: u8 = 0x0F;

    /// Bits carrying the code
    pub const MASK: u8 = 0x0F;
}

/// Extended status codes
pub mod extended {
    /// Selection timeout
    pub const SEL_TO: u8 = 0xF0;
    /// Data overrun or underrun
    pub const OU_RUN: u8 = 0xF2;
    /// Bus reset seen by the controller
    pub const HOST_RESET: u8 = 0xF7;
    /// Device reset
    pub const DEV_RESET: u8 = 0xF8;
    /// Drive recovered the error
    pub const RECOVERY: u8 = 0xFC;
    /// Check condition, sense data valid
    pub const CKCOND: u8 = 0xFF;
}

/// Mapper result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedStatus {
    /// Outcome for the request
    pub outcome: Outcome,
    /// Copy the slot's sense buffer to the caller
    pub copy_sense: bool,
    /// The device moved less data than the command described
    pub underrun: bool,
}

impl MappedStatus {
    const fn plain(outcome: Outcome) -> Self {
        Self { outcome, copy_sense: false, underrun: false }
    }

    const fn with_sense(outcome: Outcome) -> Self {
        Self { outcome, copy_sense: true, underrun: false }
    }

    const fn short(outcome: Outcome) -> Self {
        Self { outcome, copy_sense: false, underrun: true }
    }
}

/// Map a completion status
///
/// `physical` is true for passthrough commands; `scsi_opcode` is the caller's
/// CDB opcode (0 for administrative commands).
pub fn map_status(basic_status: u8, extended_status: u8, physical: bool, scsi_opcode: u8) -> MappedStatus {
    match basic_status & basic::MASK {
        basic::SUCCESS => return MappedStatus::plain(Outcome::Success),
        basic::RECOVERED => {
            return if physical {
                MappedStatus::with_sense(Outcome::RecoveredIgnore)
            } else {
                MappedStatus::plain(Outcome::RecoveredIgnore)
            };
        }
        _ => {}
    }

    if physical {
        match extended_status {
            extended::SEL_TO => return MappedStatus::plain(Outcome::RetryableTimeout),
            extended::OU_RUN => {
                // Physical drives are hidden from the OS by failing their inquiry
                return if scsi_opcode == opcode::INQUIRY {
                    MappedStatus::plain(Outcome::RetryableTimeout)
                } else {
                    MappedStatus::short(Outcome::RecoveredIgnore)
                };
            }
            extended::RECOVERY => return MappedStatus::with_sense(Outcome::RecoveredIgnore),
            extended::HOST_RESET | extended::DEV_RESET => return MappedStatus::plain(Outcome::DeviceReset),
            extended::CKCOND => return MappedStatus::with_sense(Outcome::FatalError),
            _ => {}
        }
    } else if matches!(extended_status, extended::HOST_RESET | extended::DEV_RESET) {
        return MappedStatus::plain(Outcome::DeviceReset);
    }

    match basic_status & basic::MASK {
        basic::BUSY | basic::CMD_TIMEOUT => MappedStatus::plain(Outcome::RetryableTimeout),
        _ => MappedStatus::plain(Outcome::FatalError),
    }
}
