//! Scripted controller for tests.

use crate::command::NativeCommand;
use crate::hal::{HbaHardware, PhysAddr, RingStatus, SENSE_BUFFER_LEN};
use crate::status::basic;
use crate::SlotId;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// In-memory controller that records commands and replays posted statuses
#[derive(Debug)]
pub struct MockController {
    /// Every started command, in order
    pub started: Vec<(PhysAddr, NativeCommand)>,
    /// Raw status words waiting to be drained
    pub ring: VecDeque<u32>,
    /// Ring tail values published by the driver
    pub tail_writes: Vec<u32>,
    /// Report the doorbell busy for this many more polls
    pub busy_polls: u32,
    /// Report the doorbell busy forever
    pub stuck: bool,
    /// Result of the next reset
    pub reset_ok: bool,
    /// Resets performed
    pub resets: u32,
    /// Sense bytes returned for every slot
    pub sense: [u8; SENSE_BUFFER_LEN],
    /// Post `auto_status` for every started command
    pub auto_complete: bool,
    /// Basic and extended status used by `auto_complete`
    pub auto_status: (u8, u8),
}

impl MockController {
    /// Idle controller with an empty ring
    pub fn new() -> Self {
        Self {
            started: Vec::new(),
            ring: VecDeque::new(),
            tail_writes: Vec::new(),
            busy_polls: 0,
            stuck: false,
            reset_ok: true,
            resets: 0,
            sense: [0; SENSE_BUFFER_LEN],
            auto_complete: false,
            auto_status: (basic::SUCCESS, 0),
        }
    }

    /// Post a completion for `slot`
    pub fn post(&mut self, slot: SlotId, basic: u8, extended: u8) {
        let status = RingStatus { command_id: slot, basic, extended };
        self.ring.push_back(status.to_raw());
    }

    /// Post a successful completion for `slot`
    pub fn post_success(&mut self, slot: SlotId) {
        self.post(slot, basic::SUCCESS, 0);
    }

    /// Slots of started commands, in order
    pub fn started_slots(&self) -> Vec<SlotId> {
        self.started.iter().map(|(_, cmd)| cmd.command_id()).collect()
    }
}

impl HbaHardware for MockController {
    fn doorbell_busy(&mut self) -> bool {
        if self.stuck {
            return true;
        }
        if self.busy_polls > 0 {
            self.busy_polls -= 1;
            return true;
        }
        false
    }

    fn load_command(&mut self, address: PhysAddr, command: &NativeCommand) {
        self.started.push((address, command.clone()));
    }

    fn start_command(&mut self, _address: PhysAddr) {
        if self.auto_complete {
            if let Some((_, command)) = self.started.last() {
                let slot = command.command_id();
                let (basic, extended) = self.auto_status;
                self.post(slot, basic, extended);
            }
        }
    }

    fn ring_has_entry(&mut self) -> bool {
        !self.ring.is_empty()
    }

    fn ring_pop(&mut self) -> u32 {
        self.ring.pop_front().unwrap_or(0)
    }

    fn set_ring_tail(&mut self, tail: u32) {
        self.tail_writes.push(tail);
    }

    fn fetch_sense(&mut self, _address: PhysAddr, buf: &mut [u8]) {
        let n = buf.len().min(self.sense.len());
        buf[..n].copy_from_slice(&self.sense[..n]);
    }

    fn adapter_reset(&mut self) -> bool {
        self.resets += 1;
        if self.reset_ok {
            self.ring.clear();
        }
        self.reset_ok
    }
}
