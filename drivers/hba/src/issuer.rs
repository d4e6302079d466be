//! # Issuer
//!
//! Delivers one prepared command to the controller: copy it into the slot's
//! memory, wait a bounded number of polls for the doorbell, then start it.

use crate::command::NativeCommand;
use crate::hal::{HbaHardware, PhysAddr};
use core::fmt;
use core::hint::spin_loop;

/// Issue failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueError {
    /// The doorbell stayed busy for the whole poll budget
    Busy {
        /// Polls spent
        polls: u32,
    },
}

impl fmt::Display for IssueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy { polls } => write!(f, "Doorbell busy after {} polls", polls),
        }
    }
}

/// Hand `command` at `address` to the controller
pub(crate) fn issue<H: HbaHardware>(
    hw: &mut H,
    address: PhysAddr,
    command: &NativeCommand,
    poll_limit: u32,
) -> Result<(), IssueError> {
    let mut polls = 0;
    while hw.doorbell_busy() {
        polls += 1;
        if polls >= poll_limit {
            log::warn!("[hba] doorbell busy after {} polls, slot {}", polls, command.command_id().raw());
            return Err(IssueError::Busy { polls });
        }
        spin_loop();
    }

    hw.load_command(address, command);
    hw.start_command(address);
    log::trace!(
        "[hba] started slot {} opcode {:#04x} at {}",
        command.command_id().raw(),
        command.opcode(),
        address
    );
    Ok(())
}
