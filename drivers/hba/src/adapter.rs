//! # Adapter Context
//!
//! One [`AdapterContext`] per attached controller. It owns the adapter lock
//! and exposes the submission, recovery and interrupt entry points.
//!
//! ## Locking
//!
//! All queues, the slot pool, the drive table and the hardware handle live
//! behind a single `spin::Mutex`. The adapter flags are atomics so the fast
//! paths can read them without the lock:
//!
//! - `IN_INTERRUPT`: the completion engine is draining. Submitters enqueue
//!   and leave dispatch to the interrupt path.
//! - `IN_RESET`: a reset is running. Submitters enqueue only.
//! - `IN_ABORT`: an abort is searching the queues.
//! - `UNAVAILABLE`: a reset failed. New work fails immediately.
//!
//! Caller completion sinks always run after the lock is released.

use crate::completion::{InternalWait, PassContext};
use crate::command::{AdminCommand, AdminOpcode, NativeCommand, Transfer};
use crate::config::{HbaConfig, WaitMode};
use crate::dispatch::AdapterState;
use crate::drives::LogicalDrive;
use crate::hal::{DmaSegment, HbaHardware, PhysAddr, RingStatus};
use crate::issuer::issue;
use crate::recovery::AbortResult;
use crate::request::{AdminRequest, Completion, Outcome, PendingAdmin, PendingScsi, ScsiRequest};
use crate::stats::{AdapterStats, StatsSnapshot};
use crate::status::basic;
use crate::waiter::AdminWaiters;
use crate::{HbaError, HbaResult, RequestId};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

bitflags::bitflags! {
    /// Adapter-wide state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AdapterFlags: u32 {
        /// Reset in progress
        const IN_RESET = 1 << 0;
        /// Abort in progress
        const IN_ABORT = 1 << 1;
        /// Completion engine draining
        const IN_INTERRUPT = 1 << 2;
        /// Reset failed; adapter out of service
        const UNAVAILABLE = 1 << 3;
    }
}

/// Queue occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepths {
    /// Administrative requests waiting for a slot
    pub admin_waiting: usize,
    /// Requests waiting for a slot
    pub waiting: usize,
    /// Slots owned by the controller
    pub active: usize,
    /// Administrative commands in flight
    pub admin_active: usize,
    /// Free caller slots
    pub free: usize,
    /// Administrative submitters holding a waiter
    pub admin_waiters: usize,
}

/// Per-controller driver context
pub struct AdapterContext<H: HbaHardware> {
    config: HbaConfig,
    state: Mutex<AdapterState<H>>,
    flags: AtomicU32,
    reset_generation: AtomicU64,
    waiters: AdminWaiters,
    stats: AdapterStats,
}

impl<H: HbaHardware> AdapterContext<H> {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Take ownership of a controller whose command blocks start at
    /// `command_base`
    pub fn attach(config: HbaConfig, hw: H, command_base: PhysAddr) -> HbaResult<Self> {
        config.validate()?;
        log::info!(
            "[hba] attaching adapter: {} slots, max transfer {} KiB, {} S/G entries",
            config.pool_size,
            config.max_transfer / 1024,
            config.max_sg_entries
        );
        Ok(Self {
            state: Mutex::new(AdapterState::new(config.clone(), hw, command_base)),
            flags: AtomicU32::new(0),
            reset_generation: AtomicU64::new(0),
            waiters: AdminWaiters::new(config.admin_queue_depth),
            stats: AdapterStats::default(),
            config,
        })
    }

    /// Flush the controller cache, fail whatever is left and give the
    /// hardware back
    pub fn detach(self) -> H {
        if !self.flags().contains(AdapterFlags::UNAVAILABLE) {
            if let Err(e) = self.flush_cache() {
                log::warn!("[hba] cache flush at detach failed: {}", e);
            }
        }

        let Self { state, waiters, stats, .. } = self;
        let mut state = state.into_inner();
        let mut cx = PassContext::new(&stats, &waiters);
        let failed = state.fail_active(Outcome::FatalError, &mut cx);
        state.fail_queued(Outcome::FatalError, &mut cx);
        cx.fire();

        log::info!("[hba] adapter detached ({} requests failed in flight)", failed);
        state.hw
    }

    /// Adapter configuration
    pub fn config(&self) -> &HbaConfig {
        &self.config
    }

    /// Current flags
    pub fn flags(&self) -> AdapterFlags {
        AdapterFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Number of successful resets
    pub fn reset_generation(&self) -> u64 {
        self.reset_generation.load(Ordering::Acquire)
    }

    fn set_flags(&self, flags: AdapterFlags) -> AdapterFlags {
        AdapterFlags::from_bits_truncate(self.flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    fn clear_flags(&self, flags: AdapterFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    fn dispatch_allowed(&self) -> bool {
        !self.flags().intersects(AdapterFlags::IN_INTERRUPT | AdapterFlags::IN_RESET)
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Queue a SCSI request. Never blocks; the sink runs exactly once.
    pub fn submit(&self, request: ScsiRequest) {
        AdapterStats::bump(&self.stats.submitted);

        let mut cx = PassContext::new(&self.stats, &self.waiters);
        {
            let mut state = self.state.lock();
            if self.flags().contains(AdapterFlags::UNAVAILABLE) {
                let completion = Completion::new(request.id, Outcome::FatalError);
                cx.complete(request, completion);
            } else {
                state.wait.push_back(PendingScsi::new(request));
                if self.dispatch_allowed() {
                    state.dispatch(&mut cx);
                }
            }
        }
        cx.fire();
    }

    /// Run an administrative command and wait for its outcome
    pub fn submit_admin(&self, request: AdminRequest) -> HbaResult<Outcome> {
        if self.flags().contains(AdapterFlags::UNAVAILABLE) {
            return Err(HbaError::Unavailable);
        }
        let waiter = self.waiters.claim().ok_or(HbaError::ResourceExhausted)?;

        let id = request.id;
        let mut cx = PassContext::new(&self.stats, &self.waiters);
        {
            let mut state = self.state.lock();
            if self.flags().contains(AdapterFlags::UNAVAILABLE) {
                drop(state);
                self.waiters.release(waiter);
                return Err(HbaError::Unavailable);
            }
            state.admin_wait.push_back(PendingAdmin { request, waiter, busy_retries: 0 });
            if self.dispatch_allowed() {
                state.dispatch(&mut cx);
            }
        }
        cx.fire();

        let outcome = self.wait_admin(waiter);
        log::debug!("[hba] admin request {} -> {}", id.raw(), outcome);
        Ok(outcome)
    }

    fn wait_admin(&self, waiter: usize) -> Outcome {
        match self.config.admin_wait {
            WaitMode::Interrupt => loop {
                if let Some(outcome) = self.waiters.take(waiter) {
                    return outcome.caller_visible();
                }
                spin_loop();
            },
            WaitMode::Polled { budget } => {
                for _ in 0..budget {
                    if let Some(outcome) = self.waiters.take(waiter) {
                        return outcome.caller_visible();
                    }
                    self.on_interrupt();
                }
                match self.waiters.abandon(waiter) {
                    Some(outcome) => outcome.caller_visible(),
                    None => {
                        log::warn!("[hba] admin wait budget of {} polls exhausted", budget);
                        Outcome::RetryableTimeout
                    }
                }
            }
        }
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Cancel a request that has not reached hardware
    ///
    /// Returns false if the request is in flight, unknown, or a reset or
    /// another abort is running.
    pub fn abort(&self, id: RequestId) -> bool {
        if self.flags().intersects(AdapterFlags::IN_RESET | AdapterFlags::UNAVAILABLE) {
            return false;
        }
        let prev = self.set_flags(AdapterFlags::IN_ABORT);
        if prev.contains(AdapterFlags::IN_ABORT) {
            return false;
        }
        if prev.contains(AdapterFlags::IN_RESET) {
            self.clear_flags(AdapterFlags::IN_ABORT);
            return false;
        }

        let mut cx = PassContext::new(&self.stats, &self.waiters);
        let result = self.state.lock().abort_queued(id, &mut cx);
        self.clear_flags(AdapterFlags::IN_ABORT);
        cx.fire();

        match result {
            AbortResult::Cancelled => {
                AdapterStats::bump(&self.stats.aborted);
                log::info!("[hba] request {} aborted", id.raw());
                true
            }
            AbortResult::Active => {
                log::info!("[hba] request {} already on hardware, abort refused", id.raw());
                false
            }
            AbortResult::Unknown => false,
        }
    }

    /// Reset the controller
    ///
    /// Every in-flight request fails with `DeviceReset`; queued requests are
    /// dispatched once the controller is back. A failed reset leaves the
    /// adapter unavailable.
    pub fn reset(&self) -> bool {
        if self.flags().contains(AdapterFlags::UNAVAILABLE) {
            return false;
        }
        let prev = self.set_flags(AdapterFlags::IN_RESET);
        if prev.contains(AdapterFlags::IN_RESET) {
            return false;
        }
        if prev.contains(AdapterFlags::IN_ABORT) {
            self.clear_flags(AdapterFlags::IN_RESET);
            return false;
        }

        log::info!("[hba] resetting adapter");
        let mut cx = PassContext::new(&self.stats, &self.waiters);
        let ok = {
            let mut state = self.state.lock();
            let ok = state.reset_hardware(&mut cx);
            if ok {
                self.reset_generation.fetch_add(1, Ordering::AcqRel);
                self.clear_flags(AdapterFlags::IN_RESET);
                if !self.flags().contains(AdapterFlags::IN_INTERRUPT) {
                    state.dispatch(&mut cx);
                }
            } else {
                self.set_flags(AdapterFlags::UNAVAILABLE);
                self.clear_flags(AdapterFlags::IN_RESET);
            }
            ok
        };
        cx.fire();

        if ok {
            AdapterStats::bump(&self.stats.resets);
        } else {
            log::error!("[hba] adapter marked unavailable");
        }
        ok
    }

    // =========================================================================
    // Interrupt
    // =========================================================================

    /// Interrupt service entry point. Re-entrant calls return immediately.
    pub fn on_interrupt(&self) {
        if self.flags().intersects(AdapterFlags::IN_RESET | AdapterFlags::UNAVAILABLE) {
            return;
        }
        if self.set_flags(AdapterFlags::IN_INTERRUPT).contains(AdapterFlags::IN_INTERRUPT) {
            return;
        }

        let mut cx = PassContext::new(&self.stats, &self.waiters);
        {
            let mut state = self.state.lock();
            let drained = state.drain(&mut cx);
            if drained > 0 {
                log::trace!("[hba] drained {} status entries, {} completions", drained, cx.pending());
            }
            state.dispatch(&mut cx);
            self.clear_flags(AdapterFlags::IN_INTERRUPT);
        }
        cx.fire();
    }

    // =========================================================================
    // Internal Commands
    // =========================================================================

    /// Run a management command on the reserved slot, polling for completion
    ///
    /// After a timeout the slot is not reused until the late status arrives or
    /// the adapter is reset; until then this returns `ResourceExhausted`.
    pub fn execute_internal(&self, opcode: AdminOpcode, param: u32, buffer: Option<DmaSegment>) -> HbaResult<RingStatus> {
        let flags = self.flags();
        if flags.contains(AdapterFlags::UNAVAILABLE) {
            return Err(HbaError::Unavailable);
        }
        if flags.contains(AdapterFlags::IN_RESET) {
            return Err(HbaError::InResetOrAbort);
        }

        {
            let mut state = self.state.lock();
            if matches!(state.internal, InternalWait::Pending | InternalWait::Abandoned) {
                return Err(HbaError::ResourceExhausted);
            }
            let slot = state.pool.reserved();
            let address = state.pool.address(slot);
            let command = NativeCommand::Admin(AdminCommand {
                command_id: slot,
                opcode,
                param,
                buffer: buffer.map_or(Transfer::None, Transfer::Single),
            });
            let limit = self.config.issue_poll_limit;
            issue(&mut state.hw, address, &command, limit)?;
            if let Some(block) = state.pool.block_mut(slot) {
                block.command = Some(command);
            }
            state.internal = InternalWait::Pending;
        }

        for _ in 0..self.config.internal_poll_budget {
            self.on_interrupt();
            let mut state = self.state.lock();
            let internal = state.internal;
            match internal {
                InternalWait::Done(status) => {
                    state.internal = InternalWait::Idle;
                    state.pool.release(status.command_id);
                    return match status.basic & basic::MASK {
                        basic::SUCCESS | basic::RECOVERED => Ok(status),
                        _ => Err(HbaError::CommandFailed { basic: status.basic, extended: status.extended }),
                    };
                }
                InternalWait::Reset => {
                    state.internal = InternalWait::Idle;
                    return Err(HbaError::InResetOrAbort);
                }
                InternalWait::Idle | InternalWait::Pending | InternalWait::Abandoned => {}
            }
            drop(state);
            spin_loop();
        }

        // The reserved slot stays held until the controller answers or a reset
        let mut state = self.state.lock();
        if state.internal == InternalWait::Pending {
            state.internal = InternalWait::Abandoned;
        }
        log::warn!("[hba] internal {:?} command timed out", opcode);
        Err(HbaError::Timeout)
    }

    /// Flush the controller write cache
    pub fn flush_cache(&self) -> HbaResult<()> {
        self.execute_internal(AdminOpcode::Flush, 0, None).map(|_| ())
    }

    // =========================================================================
    // Drive Table
    // =========================================================================

    /// Install logical drive information
    pub fn set_logical_drive(&self, index: u8, drive: LogicalDrive) -> HbaResult<()> {
        let mut state = self.state.lock();
        if state.drives.set(index, drive) {
            log::debug!(
                "[hba] logical drive {}: {} sectors, {:?} ({} installed)",
                index,
                drive.sectors,
                drive.state,
                state.drives.count()
            );
            Ok(())
        } else {
            Err(HbaError::InvalidRequest("logical drive index out of range"))
        }
    }

    /// Remove a logical drive
    pub fn clear_logical_drive(&self, index: u8) -> Option<LogicalDrive> {
        self.state.lock().drives.clear(index)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Counter snapshot
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Queue occupancy
    pub fn queue_depths(&self) -> QueueDepths {
        let state = self.state.lock();
        QueueDepths {
            admin_waiting: state.admin_wait.len(),
            waiting: state.wait.len(),
            active: state.active.len(),
            admin_active: state.admin_active,
            free: state.pool.free_count(),
            admin_waiters: self.waiters.in_use(),
        }
    }

    /// Run `f` with the hardware handle under the adapter lock
    pub fn with_hardware<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        f(&mut self.state.lock().hw)
    }
}
