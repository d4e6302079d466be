//! # Completion Engine
//!
//! Drains the status ring and settles each finished slot:
//!
//! ```text
//! ring entry ──► slot lookup ──► reserved?  ──► internal waiter
//!                     │
//!                     ▼
//!              remove from active ──► Status Mapper ──► release slot
//!                                                          │
//!       ┌──────────────────────┬──────────────────────────┼─────────────────┐
//!       ▼                      ▼                          ▼                 ▼
//!   error: complete     ContinueBreakup:           ForwardToCaller:   SynthesizeReply:
//!   caller, stop        start next chunk           complete caller    complete caller
//! ```
//!
//! Caller sinks are not run here. They are collected in a [`PassContext`]
//! and fired after the adapter lock is dropped.

use crate::command::NativeCommand;
use crate::dispatch::{AdapterState, Step};
use crate::hal::{HbaHardware, RingStatus, SENSE_BUFFER_LEN};
use crate::pool::{Continuation, Owner, SlotState};
use crate::request::{Completion, Outcome, PendingScsi, ScsiRequest};
use crate::stats::AdapterStats;
use crate::status::{map_status, MappedStatus};
use crate::waiter::AdminWaiters;
use alloc::vec;
use alloc::vec::Vec;

// =============================================================================
// Status Ring
// =============================================================================

/// Consumer side of the controller's status ring
#[derive(Debug)]
pub(crate) struct StatusRing {
    tail: u32,
    capacity: u32,
}

impl StatusRing {
    pub fn new(capacity: u32) -> Self {
        Self { tail: 0, capacity: capacity.max(1) }
    }

    /// Step past one consumed entry, returning the new tail
    pub fn advance(&mut self) -> u32 {
        self.tail = (self.tail + 1) % self.capacity;
        self.tail
    }

    pub fn reset(&mut self) {
        self.tail = 0;
    }
}

/// State of the reserved slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InternalWait {
    Idle,
    Pending,
    Done(RingStatus),
    /// The adapter was reset while the command was outstanding
    Reset,
    /// Timed out; the controller may still post a status for the slot
    Abandoned,
}

// =============================================================================
// Pass Context
// =============================================================================

/// Work collected during one locked pass
pub(crate) struct PassContext<'a> {
    pub stats: &'a AdapterStats,
    pub waiters: &'a AdminWaiters,
    completions: Vec<(ScsiRequest, Completion)>,
}

impl<'a> PassContext<'a> {
    pub fn new(stats: &'a AdapterStats, waiters: &'a AdminWaiters) -> Self {
        Self { stats, waiters, completions: Vec::new() }
    }

    /// Queue a caller completion
    pub fn complete(&mut self, request: ScsiRequest, completion: Completion) {
        log::debug!("[hba] request {} -> {}", completion.request.raw(), completion.outcome);
        self.completions.push((request, completion));
    }

    /// Raise an administrative waiter
    pub fn signal(&self, waiter: usize, outcome: Outcome) {
        self.waiters.signal(waiter, outcome);
    }

    /// Completions waiting to be fired
    pub fn pending(&self) -> usize {
        self.completions.len()
    }

    /// Run the collected sinks. Must be called without the adapter lock.
    pub fn fire(self) {
        for (request, completion) in self.completions {
            AdapterStats::bump(&self.stats.completed);
            request.complete(completion);
        }
    }
}

// =============================================================================
// Draining
// =============================================================================

impl<H: HbaHardware> AdapterState<H> {
    /// Consume every pending status entry. Returns the number consumed.
    pub fn drain(&mut self, cx: &mut PassContext<'_>) -> usize {
        let mut consumed = 0;
        while self.hw.ring_has_entry() {
            let raw = self.hw.ring_pop();
            let tail = self.ring.advance();
            self.hw.set_ring_tail(tail);
            self.settle(RingStatus::from_raw(raw), cx);
            consumed += 1;
        }
        consumed
    }

    fn settle(&mut self, status: RingStatus, cx: &mut PassContext<'_>) {
        let id = status.command_id;

        if id == self.pool.reserved() {
            match self.internal {
                InternalWait::Pending => self.internal = InternalWait::Done(status),
                InternalWait::Abandoned => {
                    log::warn!("[hba] late completion on internal slot, status {:#04x}", status.basic);
                    AdapterStats::bump(&cx.stats.spurious);
                    self.internal = InternalWait::Idle;
                    self.pool.release(id);
                }
                _ => {
                    log::warn!("[hba] unexpected completion on internal slot");
                    AdapterStats::bump(&cx.stats.spurious);
                }
            }
            return;
        }

        let Some(block) = self.pool.block_mut(id).filter(|b| b.state == SlotState::Active) else {
            log::warn!("[hba] spurious completion for slot {}", id.raw());
            AdapterStats::bump(&cx.stats.spurious);
            return;
        };

        log::trace!(
            "[hba] slot {} done: opcode {:#04x}, status {:#04x}/{:#04x}, timeout {}s",
            id.raw(),
            block.command.as_ref().map_or(0, NativeCommand::opcode),
            status.basic,
            status.extended,
            block.timeout_secs
        );
        let target = block.target;
        let scsi_opcode = block.scsi_opcode;
        let chunk_len = block.chunk_len;
        let continuation = block.continuation;

        self.active.remove(|&slot| slot == id);

        let physical = target.map_or(false, |t| t.is_physical());
        if let Some(t) = target.filter(|t| t.is_physical()) {
            self.busy_targets.clear(t);
        }

        let mapped = map_status(status.basic, status.extended, physical, scsi_opcode);
        let sense = if mapped.copy_sense {
            let mut buf = vec![0u8; SENSE_BUFFER_LEN];
            let address = self.pool.sense_address(id);
            self.hw.fetch_sense(address, &mut buf);
            Some(buf)
        } else {
            None
        };

        match self.pool.release(id) {
            Some(Owner::Scsi(pending)) => {
                self.resume_scsi(pending, mapped, sense, continuation, chunk_len, cx);
            }
            Some(Owner::Admin(pending)) => {
                self.admin_active = self.admin_active.saturating_sub(1);
                cx.signal(pending.waiter, mapped.outcome);
            }
            None => log::warn!("[hba] active slot {} had no owner", id.raw()),
        }
    }

    fn resume_scsi(
        &mut self,
        pending: PendingScsi,
        mapped: MappedStatus,
        sense: Option<Vec<u8>>,
        continuation: Continuation,
        chunk_len: u32,
        cx: &mut PassContext<'_>,
    ) {
        let id = pending.request.id;
        let outcome = mapped.outcome;

        if !outcome.is_success() {
            // Partial breakup progress is never reported as success
            let transferred = pending.cursor.saturating_sub(chunk_len as u64);
            let completion = Completion::new(id, outcome).with_transferred(transferred).with_sense(sense);
            cx.complete(pending.request, completion);
            return;
        }

        match continuation {
            Continuation::ContinueBreakup => {
                if let Step::Stall(pending) = self.start_scsi(pending, cx) {
                    self.wait.push_front(pending);
                }
            }
            Continuation::ForwardToCaller => {
                let completion = Completion::new(id, outcome)
                    .with_transferred(pending.cursor)
                    .with_underrun(mapped.underrun)
                    .with_sense(sense);
                cx.complete(pending.request, completion);
            }
            Continuation::SynthesizeReply => {
                let completion = Completion::new(id, outcome).with_reply(Vec::new());
                cx.complete(pending.request, completion);
            }
        }
    }
}
