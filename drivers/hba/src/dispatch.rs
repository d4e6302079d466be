//! # Dispatcher
//!
//! Moves admitted work onto hardware slots. One scheduling pass services the
//! administrative queue first, up to the administrative concurrency limit,
//! then the wait queue until either queue runs dry or the pool is exhausted.
//!
//! ```text
//!              ┌─────────────┐  classify   ┌───────────────────────────┐
//! wait ───────►│  Dispatcher │────────────►│ Immediate  (local reply)  │
//! admin-wait ─►│             │             │ Io         (breakup)      │
//!              └──────┬──────┘             │ Flush      (native flush) │
//!                     │ acquire/issue      │ Passthrough (DCDB)        │
//!                     ▼                    └───────────────────────────┘
//!                   active
//! ```
//!
//! A request that cannot get a slot, or whose issue hits a busy doorbell, is
//! pushed back to the front of its queue and the pass ends. On an idle
//! adapter a busy issue is retried in the same pass until it succeeds or the
//! request runs out of busy retries.

use crate::command::{AdminCommand, DataDirection, DcdbCommand, IoCommand, NativeCommand, TimeoutClass, Transfer};
use crate::completion::{InternalWait, PassContext, StatusRing};
use crate::config::HbaConfig;
use crate::drives::DriveTable;
use crate::hal::{HbaHardware, PhysAddr};
use crate::issuer::{issue, IssueError};
use crate::pool::{CommandBlock, Continuation, Owner, SlotPool, SlotState};
use crate::queue::Queue;
use crate::request::{Completion, IoPlan, Outcome, PendingAdmin, PendingScsi, ScsiRequest};
use crate::scsi::{self, asc, sense_key, LocalReply};
use crate::stats::AdapterStats;
use crate::{SlotId, TargetAddr};
use alloc::vec;
use alloc::vec::Vec;

// =============================================================================
// Target Busy Map
// =============================================================================

/// One bit per physical target with a passthrough in flight
#[derive(Debug)]
pub(crate) struct TargetBusyMap {
    buses: Vec<u16>,
}

impl TargetBusyMap {
    pub fn new(max_buses: u8) -> Self {
        Self { buses: vec![0; max_buses as usize + 1] }
    }

    pub fn is_busy(&self, target: TargetAddr) -> bool {
        self.buses
            .get(target.bus as usize)
            .map_or(false, |mask| mask & (1 << (target.target & 0x0F)) != 0)
    }

    pub fn set(&mut self, target: TargetAddr) {
        if let Some(mask) = self.buses.get_mut(target.bus as usize) {
            *mask |= 1 << (target.target & 0x0F);
        }
    }

    pub fn clear(&mut self, target: TargetAddr) {
        if let Some(mask) = self.buses.get_mut(target.bus as usize) {
            *mask &= !(1 << (target.target & 0x0F));
        }
    }

    pub fn clear_all(&mut self) {
        self.buses.iter_mut().for_each(|mask| *mask = 0);
    }
}

// =============================================================================
// Adapter State
// =============================================================================

/// Everything guarded by the adapter lock
#[derive(Debug)]
pub(crate) struct AdapterState<H> {
    pub hw: H,
    pub config: HbaConfig,
    pub pool: SlotPool,
    pub admin_wait: Queue<PendingAdmin>,
    pub wait: Queue<PendingScsi>,
    pub active: Queue<SlotId>,
    pub admin_active: usize,
    pub busy_targets: TargetBusyMap,
    pub drives: DriveTable,
    pub ring: StatusRing,
    pub internal: InternalWait,
}

/// How a request will be carried out
#[derive(Debug)]
pub(crate) enum Plan {
    /// Answered without hardware
    Immediate(LocalReply),
    /// Logical drive transfer of `total` bytes
    Io { io: IoPlan, total: u64 },
    /// Controller cache flush for a logical drive
    Flush { drive: u8 },
    /// DCDB to a physical device
    Passthrough,
}

/// Result of trying to start one request
pub(crate) enum Step<T> {
    /// The request was issued or completed
    Done,
    /// Put the request back at the front of its queue and end the pass
    Stall(T),
}

impl<H: HbaHardware> AdapterState<H> {
    pub fn new(config: HbaConfig, hw: H, command_base: PhysAddr) -> Self {
        Self {
            hw,
            pool: SlotPool::new(config.pool_size, command_base),
            admin_wait: Queue::with_capacity(config.admin_queue_depth),
            wait: Queue::new(),
            active: Queue::with_capacity(config.pool_size),
            admin_active: 0,
            busy_targets: TargetBusyMap::new(config.max_buses),
            drives: DriveTable::new(config.max_logical_drives),
            ring: StatusRing::new(config.ring_capacity),
            internal: InternalWait::Idle,
            config,
        }
    }

    /// Run one scheduling pass
    pub fn dispatch(&mut self, cx: &mut PassContext<'_>) {
        while self.admin_active < self.config.admin_concurrency {
            let Some(pending) = self.admin_wait.pop_front() else {
                break;
            };
            if let Step::Stall(pending) = self.start_admin(pending, cx) {
                self.admin_wait.push_front(pending);
                if self.idle_retry() {
                    continue;
                }
                break;
            }
        }

        loop {
            let busy = &self.busy_targets;
            let next = self.wait.remove(|p| {
                let target = p.request.target;
                !(target.is_physical() && busy.is_busy(target))
            });
            let Some(pending) = next else {
                break;
            };
            if let Step::Stall(pending) = self.start_scsi(pending, cx) {
                self.wait.push_front(pending);
                if self.idle_retry() {
                    continue;
                }
                break;
            }
        }
    }

    /// A stall with nothing in flight gets no completion to re-run the pass.
    /// The caller slot is free again, so the request is retried at once and
    /// its busy counter bounds the loop.
    fn idle_retry(&self) -> bool {
        self.active.is_empty() && self.pool.free_count() > 0
    }

    // =========================================================================
    // Classification
    // =========================================================================

    pub fn classify(&self, request: &ScsiRequest) -> Plan {
        let target = request.target;

        if target.is_physical() {
            if target.bus > self.config.max_buses
                || target.target >= self.config.targets_per_bus
                || target.lun != 0
            {
                return Plan::Immediate(LocalReply::status(Outcome::RetryableTimeout));
            }
            return Plan::Passthrough;
        }

        let drive = match self.drives.get(target.target) {
            Some(drive) if target.lun == 0 => drive,
            _ => return Plan::Immediate(LocalReply::status(Outcome::RetryableTimeout)),
        };

        if let Some((direction, lba, blocks)) = scsi::rw_range(&request.cdb) {
            if !drive.contains(lba, blocks) {
                return Plan::Immediate(LocalReply::check(sense_key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE));
            }
            let total = blocks as u64 * self.config.block_size as u64;
            if total == 0 {
                return Plan::Immediate(LocalReply::status(Outcome::Success));
            }
            if total > request.data_len() {
                return Plan::Immediate(LocalReply::status(Outcome::FatalError));
            }
            let io = IoPlan { direction, drive: target.target, start_lba: lba };
            return Plan::Io { io, total };
        }

        if scsi::is_sync_cache(&request.cdb) {
            return Plan::Flush { drive: target.target };
        }

        Plan::Immediate(scsi::synthesize(&request.cdb, drive, &self.config))
    }

    // =========================================================================
    // SCSI Requests
    // =========================================================================

    /// Start a request, or the next chunk of a split one
    pub fn start_scsi(&mut self, mut pending: PendingScsi, cx: &mut PassContext<'_>) -> Step<PendingScsi> {
        if let Some(io) = pending.io {
            return self.start_io(pending, io, cx);
        }

        match self.classify(&pending.request) {
            Plan::Immediate(reply) => {
                AdapterStats::bump(&cx.stats.immediate);
                let id = pending.request.id;
                let mut completion = Completion::new(id, reply.outcome).with_sense(reply.sense);
                if reply.outcome.is_success() {
                    completion = completion.with_transferred(reply.data.len() as u64).with_reply(reply.data);
                }
                cx.complete(pending.request, completion);
                Step::Done
            }
            Plan::Io { io, total } => {
                pending.total = total;
                pending.io = Some(io);
                self.start_io(pending, io, cx)
            }
            Plan::Flush { drive } => self.start_flush(pending, drive, cx),
            Plan::Passthrough => self.start_passthrough(pending, cx),
        }
    }

    fn start_io(&mut self, mut pending: PendingScsi, io: IoPlan, cx: &mut PassContext<'_>) -> Step<PendingScsi> {
        let Some(slot) = self.pool.acquire() else {
            return Step::Stall(pending);
        };

        let block_size = self.config.block_size;
        let want = pending.remaining().min(self.config.max_transfer as u64) as u32;
        let sliced = Transfer::slice(
            &pending.request.data,
            pending.cursor,
            want,
            self.config.max_sg_entries,
            block_size,
        );
        let Some((transfer, len)) = sliced else {
            log::warn!("[hba] request {} too fragmented for one command", pending.request.id.raw());
            self.pool.release(slot);
            let completion = Completion::new(pending.request.id, Outcome::FatalError).with_transferred(pending.cursor);
            cx.complete(pending.request, completion);
            return Step::Done;
        };

        let command = NativeCommand::Io(IoCommand {
            command_id: slot,
            direction: io.direction,
            logical_drive: io.drive,
            lba: io.start_lba + pending.cursor / block_size as u64,
            sectors: len / block_size,
            transfer,
        });

        if let Err(e) = self.issue_slot(slot, &command, cx) {
            return self.on_busy(pending, e, cx);
        }

        if pending.cursor > 0 {
            AdapterStats::bump(&cx.stats.chunks);
        }
        pending.advance(len as u64);
        pending.busy_retries = 0;
        let continuation = if pending.cursor < pending.total {
            Continuation::ContinueBreakup
        } else {
            Continuation::ForwardToCaller
        };
        log::trace!(
            "[hba] request {} chunk {} bytes, cursor {}/{}",
            pending.request.id.raw(),
            len,
            pending.cursor,
            pending.total
        );

        let target = pending.request.target;
        let opcode = pending.request.cdb.opcode();
        let timeout = pending.request.timeout_secs;
        self.activate(slot, command, Owner::Scsi(pending), Some(target), opcode, len, timeout, continuation);
        Step::Done
    }

    fn start_flush(&mut self, pending: PendingScsi, drive: u8, cx: &mut PassContext<'_>) -> Step<PendingScsi> {
        let Some(slot) = self.pool.acquire() else {
            return Step::Stall(pending);
        };

        let command = NativeCommand::Admin(AdminCommand {
            command_id: slot,
            opcode: crate::command::AdminOpcode::Flush,
            param: drive as u32,
            buffer: Transfer::None,
        });
        if let Err(e) = self.issue_slot(slot, &command, cx) {
            return self.on_busy(pending, e, cx);
        }

        let target = pending.request.target;
        let opcode = pending.request.cdb.opcode();
        let timeout = pending.request.timeout_secs;
        self.activate(slot, command, Owner::Scsi(pending), Some(target), opcode, 0, timeout, Continuation::SynthesizeReply);
        Step::Done
    }

    fn start_passthrough(&mut self, mut pending: PendingScsi, cx: &mut PassContext<'_>) -> Step<PendingScsi> {
        if pending.total > self.config.max_transfer as u64 {
            log::debug!("[hba] passthrough {} exceeds max transfer", pending.request.id.raw());
            let completion = Completion::new(pending.request.id, Outcome::FatalError);
            cx.complete(pending.request, completion);
            return Step::Done;
        }

        let Some(slot) = self.pool.acquire() else {
            return Step::Stall(pending);
        };

        let total = pending.total as u32;
        let transfer = match Transfer::slice(&pending.request.data, 0, total, self.config.max_sg_entries, 1) {
            Some((transfer, len)) if len == total => transfer,
            _ => {
                self.pool.release(slot);
                let completion = Completion::new(pending.request.id, Outcome::FatalError);
                cx.complete(pending.request, completion);
                return Step::Done;
            }
        };

        let target = pending.request.target;
        let direction = if total == 0 {
            DataDirection::None
        } else {
            scsi::transfer_direction(pending.request.cdb.opcode())
        };
        let command = NativeCommand::Dcdb(DcdbCommand {
            command_id: slot,
            device_address: DcdbCommand::encode_address(target.bus, target.target),
            direction,
            timeout: TimeoutClass::from_secs(pending.request.timeout_secs),
            transfer_length: total,
            sense_address: self.pool.sense_address(slot),
            cdb: pending.request.cdb,
            transfer,
        });

        if let Err(e) = self.issue_slot(slot, &command, cx) {
            return self.on_busy(pending, e, cx);
        }

        self.busy_targets.set(target);
        pending.advance(total as u64);
        pending.busy_retries = 0;
        let opcode = pending.request.cdb.opcode();
        let timeout = pending.request.timeout_secs;
        self.activate(slot, command, Owner::Scsi(pending), Some(target), opcode, total, timeout, Continuation::ForwardToCaller);
        Step::Done
    }

    fn on_busy(&mut self, mut pending: PendingScsi, err: IssueError, cx: &mut PassContext<'_>) -> Step<PendingScsi> {
        pending.busy_retries += 1;
        if pending.busy_retries >= self.config.issue_retry_limit {
            log::error!(
                "[hba] request {} failed after {} busy issues ({})",
                pending.request.id.raw(),
                pending.busy_retries,
                err
            );
            let completion = Completion::new(pending.request.id, Outcome::FatalError).with_transferred(pending.cursor);
            cx.complete(pending.request, completion);
            return Step::Done;
        }
        Step::Stall(pending)
    }

    // =========================================================================
    // Administrative Requests
    // =========================================================================

    fn start_admin(&mut self, mut pending: PendingAdmin, cx: &mut PassContext<'_>) -> Step<PendingAdmin> {
        let Some(slot) = self.pool.acquire() else {
            return Step::Stall(pending);
        };

        let command = NativeCommand::Admin(AdminCommand {
            command_id: slot,
            opcode: pending.request.opcode,
            param: pending.request.param,
            buffer: pending.request.buffer.map_or(Transfer::None, Transfer::Single),
        });

        if let Err(e) = self.issue_slot(slot, &command, cx) {
            pending.busy_retries += 1;
            if pending.busy_retries >= self.config.issue_retry_limit {
                log::error!("[hba] admin request {} failed: {}", pending.request.id.raw(), e);
                cx.signal(pending.waiter, Outcome::FatalError);
                return Step::Done;
            }
            return Step::Stall(pending);
        }

        self.admin_active += 1;
        let len = command.transfer_len();
        self.activate(slot, command, Owner::Admin(pending), None, 0, len, 0, Continuation::ForwardToCaller);
        Step::Done
    }

    // =========================================================================
    // Slot Helpers
    // =========================================================================

    /// Issue a prepared command; the slot goes back to the pool on failure
    fn issue_slot(&mut self, slot: SlotId, command: &NativeCommand, cx: &mut PassContext<'_>) -> Result<(), IssueError> {
        let address = self.pool.address(slot);
        match issue(&mut self.hw, address, command, self.config.issue_poll_limit) {
            Ok(()) => {
                AdapterStats::bump(&cx.stats.dispatched);
                Ok(())
            }
            Err(e) => {
                AdapterStats::bump(&cx.stats.issue_busy);
                self.pool.release(slot);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn activate(
        &mut self,
        slot: SlotId,
        command: NativeCommand,
        owner: Owner,
        target: Option<TargetAddr>,
        scsi_opcode: u8,
        chunk_len: u32,
        timeout_secs: u32,
        continuation: Continuation,
    ) {
        if let Some(block) = self.pool.block_mut(slot) {
            *block = CommandBlock {
                id: block.id,
                address: block.address,
                state: SlotState::Active,
                owner: Some(owner),
                target,
                scsi_opcode,
                command: Some(command),
                chunk_len,
                timeout_secs,
                continuation,
            };
        }
        self.active.push_back(slot);
    }

    /// Slot holding a request, if it is in flight
    pub fn active_slot_of(&self, id: crate::RequestId) -> Option<SlotId> {
        self.active.iter().copied().find(|&slot| {
            match self.pool.block(slot).and_then(|b| b.owner.as_ref()) {
                Some(Owner::Scsi(p)) => p.request.id == id,
                Some(Owner::Admin(p)) => p.request.id == id,
                None => false,
            }
        })
    }
}
