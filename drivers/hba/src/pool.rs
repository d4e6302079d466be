//! # Command Block Pool
//!
//! Fixed array of hardware command slots. The last slot is reserved for
//! internal commands and is never handed out by [`SlotPool::acquire`].
//!
//! ```text
//!   acquire()                fill()                 release()
//! Free ──────────► Prepared ──────────► Active ──────────────► Free
//!                     │                                       ▲
//!                     └──────────── release() (issue busy) ───┘
//! ```

use crate::command::NativeCommand;
use crate::hal::{PhysAddr, COMMAND_BLOCK_SIZE, SENSE_OFFSET};
use crate::request::{PendingAdmin, PendingScsi};
use crate::{SlotId, TargetAddr};
use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// What the completion engine does when a slot finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Complete the caller with a locally built reply
    SynthesizeReply,
    /// Issue the next chunk of a split transfer
    ContinueBreakup,
    /// Complete the caller with the hardware result
    ForwardToCaller,
}

/// Slot lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// On the free list
    Free,
    /// Acquired, command being built or issued
    Prepared,
    /// Owned by the controller
    Active,
    /// The internal slot
    Reserved,
}

/// Request owning a slot
#[derive(Debug)]
pub(crate) enum Owner {
    Scsi(PendingScsi),
    Admin(PendingAdmin),
}

/// One hardware command slot
#[derive(Debug)]
pub(crate) struct CommandBlock {
    pub id: SlotId,
    pub address: PhysAddr,
    pub state: SlotState,
    pub owner: Option<Owner>,
    pub target: Option<TargetAddr>,
    /// SCSI opcode of the caller's CDB, for status mapping
    pub scsi_opcode: u8,
    pub command: Option<NativeCommand>,
    /// Bytes carried by the command in flight
    pub chunk_len: u32,
    pub timeout_secs: u32,
    pub continuation: Continuation,
}

impl CommandBlock {
    fn new(id: SlotId, address: PhysAddr, state: SlotState) -> Self {
        Self {
            id,
            address,
            state,
            owner: None,
            target: None,
            scsi_opcode: 0,
            command: None,
            chunk_len: 0,
            timeout_secs: 0,
            continuation: Continuation::ForwardToCaller,
        }
    }

    fn clear(&mut self) -> Option<Owner> {
        self.target = None;
        self.scsi_opcode = 0;
        self.command = None;
        self.chunk_len = 0;
        self.timeout_secs = 0;
        self.continuation = Continuation::ForwardToCaller;
        self.owner.take()
    }
}

/// Fixed pool of command slots
#[derive(Debug)]
pub(crate) struct SlotPool {
    blocks: Vec<CommandBlock>,
    free: VecDeque<SlotId>,
    reserved: SlotId,
}

impl SlotPool {
    /// Lay out `size` slots starting at `base`
    pub fn new(size: usize, base: PhysAddr) -> Self {
        debug_assert!((2..=256).contains(&size));
        let reserved = SlotId::new((size - 1) as u8);
        let mut blocks = Vec::with_capacity(size);
        let mut free = VecDeque::with_capacity(size - 1);

        for i in 0..size {
            let id = SlotId::new(i as u8);
            let address = base.add(i as u64 * COMMAND_BLOCK_SIZE);
            if id == reserved {
                blocks.push(CommandBlock::new(id, address, SlotState::Reserved));
            } else {
                blocks.push(CommandBlock::new(id, address, SlotState::Free));
                free.push_back(id);
            }
        }

        Self { blocks, free, reserved }
    }

    /// Take a free caller slot
    pub fn acquire(&mut self) -> Option<SlotId> {
        let id = self.free.pop_front()?;
        self.blocks[id.index()].state = SlotState::Prepared;
        Some(id)
    }

    /// Return a slot to the free list, handing back its owner
    pub fn release(&mut self, id: SlotId) -> Option<Owner> {
        let block = self.blocks.get_mut(id.index())?;
        match block.state {
            SlotState::Free => {
                log::warn!("[hba] release of free slot {}", id.raw());
                None
            }
            SlotState::Reserved => block.clear(),
            SlotState::Prepared | SlotState::Active => {
                let owner = block.clear();
                block.state = SlotState::Free;
                self.free.push_back(id);
                owner
            }
        }
    }

    pub fn block(&self, id: SlotId) -> Option<&CommandBlock> {
        self.blocks.get(id.index())
    }

    pub fn block_mut(&mut self, id: SlotId) -> Option<&mut CommandBlock> {
        self.blocks.get_mut(id.index())
    }

    /// The internal slot
    pub fn reserved(&self) -> SlotId {
        self.reserved
    }

    /// Free caller slots
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Coherent memory of a slot
    pub fn address(&self, id: SlotId) -> PhysAddr {
        self.blocks[id.index()].address
    }

    /// Sense buffer of a slot
    pub fn sense_address(&self, id: SlotId) -> PhysAddr {
        self.address(id).add(SENSE_OFFSET)
    }
}
