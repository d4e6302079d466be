//! # Abort and Reset
//!
//! Abort only reaches work that has not been handed to hardware. Anything in
//! flight can only be stopped by resetting the whole adapter, which fails
//! every active slot in bulk.

use crate::completion::{InternalWait, PassContext};
use crate::dispatch::AdapterState;
use crate::hal::HbaHardware;
use crate::pool::Owner;
use crate::request::{Completion, Outcome};
use crate::RequestId;

/// Where an abort found its request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AbortResult {
    /// Removed from a queue and completed as cancelled
    Cancelled,
    /// Already on hardware
    Active,
    /// Not known to the adapter
    Unknown,
}

impl<H: HbaHardware> AdapterState<H> {
    /// Cancel a request that has not been dispatched
    pub fn abort_queued(&mut self, id: RequestId, cx: &mut PassContext<'_>) -> AbortResult {
        if let Some(pending) = self.admin_wait.remove(|p| p.request.id == id) {
            cx.signal(pending.waiter, Outcome::Cancelled);
            return AbortResult::Cancelled;
        }

        if let Some(pending) = self.wait.remove(|p| p.request.id == id) {
            let completion = Completion::new(id, Outcome::Cancelled).with_transferred(pending.cursor);
            cx.complete(pending.request, completion);
            return AbortResult::Cancelled;
        }

        if self.active_slot_of(id).is_some() {
            AbortResult::Active
        } else {
            AbortResult::Unknown
        }
    }

    /// Fail every active slot with `outcome` and return the slots to the pool
    pub fn fail_active(&mut self, outcome: Outcome, cx: &mut PassContext<'_>) -> usize {
        let slots = self.active.drain_all();
        let count = slots.len();

        for slot in slots {
            let chunk_len = self.pool.block(slot).map_or(0, |b| b.chunk_len as u64);
            if let Some(target) = self.pool.block(slot).and_then(|b| b.target) {
                self.busy_targets.clear(target);
            }
            match self.pool.release(slot) {
                Some(Owner::Scsi(pending)) => {
                    let transferred = pending.cursor.saturating_sub(chunk_len);
                    let completion = Completion::new(pending.request.id, outcome).with_transferred(transferred);
                    cx.complete(pending.request, completion);
                }
                Some(Owner::Admin(pending)) => {
                    self.admin_active = self.admin_active.saturating_sub(1);
                    cx.signal(pending.waiter, outcome);
                }
                None => {}
            }
        }

        count
    }

    /// Fail everything still queued with `outcome`
    pub fn fail_queued(&mut self, outcome: Outcome, cx: &mut PassContext<'_>) {
        for pending in self.admin_wait.drain_all() {
            cx.signal(pending.waiter, outcome);
        }
        for pending in self.wait.drain_all() {
            let completion = Completion::new(pending.request.id, outcome).with_transferred(pending.cursor);
            cx.complete(pending.request, completion);
        }
    }

    /// Reset the controller and settle all in-flight work
    ///
    /// Queued administrative requests are failed with `DeviceReset` first.
    /// On success the active queue is failed with `DeviceReset` and ordinary
    /// queued work stays queued. On failure everything is failed with
    /// `FatalError`.
    pub fn reset_hardware(&mut self, cx: &mut PassContext<'_>) -> bool {
        for pending in self.admin_wait.drain_all() {
            cx.signal(pending.waiter, Outcome::DeviceReset);
        }

        if !self.hw.adapter_reset() {
            let failed = self.fail_active(Outcome::FatalError, cx);
            self.fail_queued(Outcome::FatalError, cx);
            self.admin_active = 0;
            self.reset_internal();
            log::error!("[hba] adapter reset failed, {} active requests failed", failed);
            return false;
        }

        let failed = self.fail_active(Outcome::DeviceReset, cx);
        self.busy_targets.clear_all();
        self.admin_active = 0;
        self.reset_internal();
        self.ring.reset();
        self.hw.set_ring_tail(0);
        log::info!("[hba] adapter reset, {} active requests failed with device reset", failed);
        true
    }

    /// Release the reserved slot from whatever the controller held on it
    fn reset_internal(&mut self) {
        match self.internal {
            InternalWait::Pending => self.internal = InternalWait::Reset,
            InternalWait::Abandoned => {
                let slot = self.pool.reserved();
                self.internal = InternalWait::Idle;
                self.pool.release(slot);
            }
            _ => {}
        }
    }
}
